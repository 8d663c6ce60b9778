//! The shutdown coordinator: a two-phase protocol that refuses teardown
//! while clients remain.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Tracks whether the core accepts new operations, and how many are
/// currently in flight.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    disabled: AtomicBool,
    in_flight: AtomicI64,
}

/// RAII guard marking one control-message operation as in flight. Dropping
/// it decrements the in-flight counter; the guard is only handed out if
/// the core was not disabled at the moment of entry.
pub struct InFlightGuard<'a> {
    coordinator: &'a ShutdownCoordinator,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ShutdownCoordinator {
    /// Build a coordinator with the core initially enabled.
    pub fn new() -> Self {
        ShutdownCoordinator::default()
    }

    /// `true` once a `SHUTDOWN` has succeeded and no re-initialization has
    /// happened since.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Enter a control-message operation. Returns `None` if the core is
    /// disabled (spec: P6, "no operation succeeds after a successful
    /// shutdown").
    pub fn enter(&self) -> Option<InFlightGuard<'_>> {
        if self.disabled.load(Ordering::Acquire) {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.disabled.load(Ordering::Acquire) {
            // Raced a concurrent shutdown between the check above and the
            // increment; back out so the coordinator's count stays exact.
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(InFlightGuard { coordinator: self })
    }

    /// Phase one of the two-phase drain: mark the core disabled, refusing
    /// every `enter()` from this point on. Callers that need to compute
    /// `sweep_active` themselves (e.g. to run `sweep()` only after no new
    /// operation can start) call this before sweeping, then
    /// [`ShutdownCoordinator::confirm_quiescent`] with the result.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    /// Phase two: with the core already disabled, require both that no
    /// operation is in flight and that `sweep_active` (the caller's
    /// freshly-computed `sweep()` result, taken after `disable()`) reports
    /// zero. If either check fails, the core is re-enabled and `false` is
    /// returned.
    pub fn confirm_quiescent(&self, sweep_active: u64) -> bool {
        if self.in_flight.load(Ordering::Acquire) == 0 && sweep_active == 0 {
            true
        } else {
            self.disabled.store(false, Ordering::Release);
            false
        }
    }

    /// Attempt the two-phase drain in one call: disable, then confirm
    /// quiescence against an already-computed `sweep_active`. Callers for
    /// whom `sweep_active` must itself be computed only after disabling
    /// (spec: P5/P6, no session may be created between disable and the
    /// sweep that observes quiescence) should call `disable()` and
    /// `confirm_quiescent()` separately instead, sweeping in between.
    pub fn try_shutdown(&self, sweep_active: u64) -> bool {
        self.disable();
        self.confirm_quiescent(sweep_active)
    }

    /// Re-initialize the core after a successful shutdown.
    pub fn reset(&self) {
        self.disabled.store(false, Ordering::Release);
        self.in_flight.store(0, Ordering::Release);
    }
}
