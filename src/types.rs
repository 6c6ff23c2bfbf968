use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::HashMap as _HashMap;

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
pub(crate) type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
