use crate::function::{KernelInfo, RegisterInfo};
use crate::sync::Ordering;
use crate::value::{AsyncValue, AsyncValueRef};
use core::ptr;

/// Current occupant of `register`, or null if nothing was installed yet.
pub(super) fn get_register_value(register: &RegisterInfo) -> *const AsyncValue {
    register.value.load(Ordering::Acquire)
}

/// The value serving `register`, installing an indirect placeholder when no
/// producer has published yet.
///
/// The returned pointer is backed by the register's reference accounting:
/// the occupant carries `user_count` references owed to its consumers, and
/// each consumer pays one back when it is done.
pub(super) fn get_or_create_register_value(register: &RegisterInfo) -> *const AsyncValue {
    let value = register.value.load(Ordering::Acquire);
    if !value.is_null() {
        return value;
    }

    // No producer yet. Install a placeholder, racing the producer's own
    // install. Speculatively pay the user-count debt in the expectation that
    // the compare-exchange succeeds: the placeholder starts with one
    // reference, and occupying the register counts as one more use, so the
    // winner sits at `user_count + 1`.
    let indirect = AsyncValueRef::indirect();
    indirect.add_ref(register.user_count as usize);
    let indirect = indirect.into_raw();
    match register.value.compare_exchange(
        ptr::null_mut(),
        indirect.cast_mut(),
        Ordering::Release,
        Ordering::Acquire,
    ) {
        Ok(_) => indirect,
        Err(existing) => {
            // Lost the race; the placeholder was never needed.
            // SAFETY: all `user_count + 1` references minted above are ours.
            unsafe { AsyncValue::drop_ref(indirect, register.user_count as usize + 1) };
            existing.cast_const()
        }
    }
}

/// Publish `new_value` as the occupant of `register`, folding the producer's
/// `+1` reference into the register accounting.
///
/// Returns the pointer now serving the register's consumers and whether the
/// register already held a placeholder. On that path the placeholder was
/// forwarded to `new_value`, and the caller owes one extra drop on the
/// returned pointer once it is done dispatching consumers.
pub(super) fn set_register_value(
    register: &RegisterInfo,
    new_value: AsyncValueRef,
) -> (*const AsyncValue, bool) {
    assert!(
        register.user_count > 0,
        "set_register_value: register has no users"
    );
    // Speculatively bring the total to `user_count`: the value arrives with
    // +1, occupying the register is one more use, and we are performing that
    // use right now, so that pair cancels.
    new_value.add_ref(register.user_count as usize - 1);
    let new_ptr = new_value.as_ptr();
    match register.value.compare_exchange(
        ptr::null_mut(),
        new_ptr.cast_mut(),
        Ordering::Release,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            // The register accounting now owns every reference the handle
            // held.
            let _ = new_value.into_raw();
            (new_ptr, false)
        }
        Err(existing) => {
            // A consumer (or the result export) installed a placeholder
            // first. Revert the speculative references, then resolve the
            // placeholder, donating the producer's +1.
            // SAFETY: the speculative references minted above are ours.
            unsafe { AsyncValue::drop_ref(new_ptr, register.user_count as usize - 1) };
            // SAFETY: a non-null loser of the publish race is alive; it holds
            // the references owed to the register's consumers.
            let indirect = unsafe { &*existing };
            assert!(
                indirect.is_unresolved_indirect(),
                "set_register_value: register already holds a resolved value"
            );
            indirect.forward_to(new_value);
            (existing.cast_const(), true)
        }
    }
}

/// Force every kernel in `used_bys` to within one decrement of firing.
///
/// Runs when an argument arrives in the error state, so consumers
/// short-circuit instead of waiting for their remaining arguments. The
/// counter only ever moves toward 1; a kernel already at or past its firing
/// point is left alone.
#[cold]
pub(super) fn set_kernels_with_error_input_ready(
    kernel_infos: &[KernelInfo],
    used_bys: &[u32],
) {
    for &kernel_id in used_bys {
        let arguments_not_ready = &kernel_infos[kernel_id as usize].arguments_not_ready;
        let mut not_ready = arguments_not_ready.load(Ordering::Acquire);
        while not_ready > 1 {
            match arguments_not_ready.compare_exchange_weak(
                not_ready,
                1,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => not_ready = current,
            }
        }
    }
}
