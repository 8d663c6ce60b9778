//! The session record: the per-original aggregation of live incarnations
//! plus the open handle on the original.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::incarnation::Incarnation;

/// One live session: every currently-open original pathname has exactly
/// one valid `Session` (spec: registry uniqueness invariant).
///
/// Always handled behind an `Arc<Session>`. `Arc`'s strong count and the
/// explicit `refcount` field count different things: strong count counts
/// *pointers* to this record (registry snapshot entries, local clones held
/// by in-flight operations); `refcount` counts *logically active
/// operations* against the session, per the find/drop protocol in
/// `registry::find`. A session is only torn down once both have drained.
pub struct Session<F> {
    /// The original pathname (registry key).
    pub original_path: PathBuf,
    /// The open handle on the original. Stays open for the session's
    /// entire lifetime (spec: I3).
    pub original_handle: F,
    /// Guards observation/creation (read side) vs. destruction and
    /// write-back (write side) of incarnations.
    pub lock: RwLock<()>,
    /// Live incarnations. A plain `Vec` behind a mutex is sufficient: the
    /// session's read lock already serializes meaningfully against
    /// destruction, so the lock-free append of the original design buys
    /// nothing once file I/O dominates cost.
    pub incarnations: Mutex<Vec<Incarnation<F>>>,
    /// Count of in-flight operations holding a reference to this session
    /// (spec: §4.4 find/drop protocol).
    refcount: AtomicUsize,
    /// `false` once the session has been marked for removal from the
    /// registry; readers must treat an invalid session as a miss.
    valid: AtomicBool,
}

impl<F> Session<F> {
    /// Build a fresh, valid session charged to its creator (refcount 1).
    pub fn new(original_path: PathBuf, original_handle: F) -> Self {
        Session {
            original_path,
            original_handle,
            lock: RwLock::new(()),
            incarnations: Mutex::new(Vec::new()),
            refcount: AtomicUsize::new(1),
            valid: AtomicBool::new(true),
        }
    }

    /// `true` while the session is live and discoverable.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Flip validity to invalid. Idempotent; callers hold the write lock
    /// and the registry spinlock when this matters (spec: §4.5 step 5).
    pub fn mark_invalid(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Current refcount, for diagnostics and the shutdown coordinator.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increment the refcount; called by `registry::find` before a
    /// candidate's validity/match is inspected.
    pub fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the refcount; called on a miss during traversal, or when
    /// an operation finishes with a session reference it took.
    ///
    /// Returns the refcount's value *after* the decrement, so callers can
    /// decide whether they were the last holder without a second load.
    pub fn release(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_valid_with_refcount_one() {
        let s = Session::new(PathBuf::from("/mnt/a"), ());
        assert!(s.is_valid());
        assert_eq!(s.refcount(), 1);
    }

    #[test]
    fn acquire_release_round_trips() {
        let s = Session::new(PathBuf::from("/mnt/a"), ());
        s.acquire();
        assert_eq!(s.refcount(), 2);
        assert_eq!(s.release(), 1);
    }

    #[test]
    fn mark_invalid_is_observable() {
        let s = Session::new(PathBuf::from("/mnt/a"), ());
        s.mark_invalid();
        assert!(!s.is_valid());
    }
}
