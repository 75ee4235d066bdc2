//! Named single-flight locks for non-reentrant long operations.
//!
//! Self-update, update scans, and update installs must never run twice
//! concurrently — a second request while one is in flight is rejected with
//! a "busy" reply, never queued. Acquisition is a compare-and-swap, and
//! the permit releases on Drop so a panicking handler cannot wedge a class
//! forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Exclusion class names.
pub mod classes {
    pub const AGENT_UPDATE: &str = "agent-update";
    pub const UPDATE_SCAN: &str = "update-scan";
    pub const UPDATE_INSTALL: &str = "update-install";
}

/// Registry of per-class in-flight flags.
#[derive(Default)]
pub struct ExclusionGuard {
    flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl ExclusionGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the named class. Non-blocking: returns `None`
    /// immediately if the class is already held. The returned permit
    /// releases the class when dropped, on every path.
    #[must_use]
    pub fn try_acquire(&self, class: &str) -> Option<ExclusionPermit> {
        let flag = self.flag(class);
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(class, "exclusion class acquired");
            Some(ExclusionPermit {
                class: class.to_string(),
                flag,
            })
        } else {
            tracing::debug!(class, "exclusion class busy");
            None
        }
    }

    /// Whether the named class is currently held.
    #[must_use]
    pub fn is_held(&self, class: &str) -> bool {
        self.flag(class).load(Ordering::Acquire)
    }

    fn flag(&self, class: &str) -> Arc<AtomicBool> {
        let mut flags = match self.flags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(flags.entry(class.to_string()).or_default())
    }
}

/// Holding one of these means the class is yours. Release is idempotent
/// and unconditional on Drop.
pub struct ExclusionPermit {
    class: String,
    flag: Arc<AtomicBool>,
}

impl Drop for ExclusionPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        tracing::debug!(class = %self.class, "exclusion class released");
    }
}
