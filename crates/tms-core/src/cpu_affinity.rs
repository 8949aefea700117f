//! Pinning listener threads to CPU cores.
//!
//! Each subscription is polled by its own OS thread. Busy feeds (market data
//! for many instruments) benefit from a dedicated core. A negative or absent
//! core id in the config means no pinning.

use tracing::{info, warn};

/// Why a thread could not be pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    /// The core id is not one of the cores the OS reports.
    NoSuchCore { requested: usize, available: usize },
    /// The OS refused the affinity change.
    Rejected,
}

/// Pin the current thread to `core_id`.
pub fn pin_current_thread(core_id: usize) -> Result<(), PinError> {
    let cores = core_affinity::get_core_ids().unwrap_or_default();
    let core = cores.get(core_id).copied().ok_or(PinError::NoSuchCore {
        requested: core_id,
        available: cores.len(),
    })?;
    if core_affinity::set_for_current(core) {
        Ok(())
    } else {
        Err(PinError::Rejected)
    }
}

/// Pin the listener thread named `listener` when `core_id` is configured.
///
/// Returns whether the thread ended up pinned. Failures are logged and the
/// listener keeps running unpinned.
pub fn maybe_bind(core_id: Option<i32>, listener: &str) -> bool {
    let Some(core_id) = core_id.and_then(|id| usize::try_from(id).ok()) else {
        return false;
    };
    match pin_current_thread(core_id) {
        Ok(()) => {
            info!(listener, core_id, "listener thread pinned");
            true
        }
        Err(PinError::NoSuchCore { requested, available }) => {
            warn!(listener, "cannot pin to core {requested}: system has {available} core(s)");
            false
        }
        Err(PinError::Rejected) => {
            warn!(listener, core_id, "OS rejected thread pinning");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_or_negative_core_is_not_pinned() {
        assert!(!maybe_bind(None, "idle"));
        assert!(!maybe_bind(Some(-1), "idle"));
    }

    #[test]
    fn out_of_range_core_is_reported() {
        let err = pin_current_thread(usize::MAX).unwrap_err();
        assert!(matches!(err, PinError::NoSuchCore { requested: usize::MAX, .. }));
    }
}
