use crate::function::FunctionFile;
use derive_more::Display;
use std::sync::Arc;

/// Human-readable source location attached to diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{_0}")]
pub struct DecodedLocation(pub Arc<str>);

/// Decodes the opaque location tokens recorded in kernel records.
///
/// One handler is shared by every kernel an executor fires. Any result that
/// is still pending when the executor otherwise quiesces extends the
/// handler's lifetime, so an asynchronous kernel can still decode a location
/// for a late diagnostic.
#[derive(Debug)]
pub struct LocationHandler {
    file: FunctionFile,
}

impl LocationHandler {
    pub(crate) fn new(file: FunctionFile) -> Self {
        Self { file }
    }

    #[must_use]
    pub fn decode(&self, token: u32) -> DecodedLocation {
        self.file.data().decode_location(token)
    }
}
