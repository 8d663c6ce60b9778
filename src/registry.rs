//! The session registry: the set of all live session records, traversed
//! concurrently by readers and updated under a single spinlock.
//!
//! Readers never see freed memory (spec: I4). This is realized with
//! `arc_swap::ArcSwap` publishing an immutable `Vec<Arc<Session<F>>>`
//! snapshot: a reader loads the current snapshot `Arc` once and holds it
//! for the duration of its traversal, so any session exclusively
//! reachable only through an older snapshot cannot be freed out from
//! under it even after a writer publishes a newer one. This is the
//! crate's concrete realization of the RCU-style quiescent read the
//! specification calls for.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::session::Session;

/// The set of all live sessions, keyed by original pathname.
pub struct Registry<F> {
    snapshot: ArcSwap<Vec<Arc<Session<F>>>>,
    /// Serializes `insert`/`unlink`; analogous to the spec's registry
    /// spinlock (a `parking_lot::Mutex` is uncontended and short-held, the
    /// same complexity class as a spinlock for this workload).
    write_lock: Mutex<()>,
}

impl<F> Registry<F> {
    /// Build an empty registry.
    pub fn new() -> Self {
        Registry {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Traverse the registry looking for a valid session at `path`.
    ///
    /// For each candidate, the refcount is incremented first and then
    /// validity/match is inspected; on a miss the refcount is decremented
    /// before moving to the next candidate. On a hit, the caller owns one
    /// refcount on the returned session and must drop it with
    /// [`Session::release`].
    pub fn find(&self, path: &Path) -> Option<Arc<Session<F>>> {
        let snapshot = self.snapshot.load();
        for session in snapshot.iter() {
            session.acquire();
            if session.is_valid() && session.original_path == path {
                return Some(session.clone());
            }
            session.release();
        }
        None
    }

    /// Traverse the registry looking for the session holding incarnation
    /// `(fd, pid)`. Acquires the session's read lock while scanning its
    /// incarnation collection, per spec: §4.4.
    pub fn find_by_fd(&self, fd: u64, pid: u32) -> Option<Arc<Session<F>>> {
        let snapshot = self.snapshot.load();
        for session in snapshot.iter() {
            session.acquire();
            if session.is_valid() {
                let _read = session.lock.read();
                let has_incarnation = session
                    .incarnations
                    .lock()
                    .iter()
                    .any(|inc| inc.key() == (pid, fd));
                if has_incarnation {
                    return Some(session.clone());
                }
            }
            session.release();
        }
        None
    }

    /// Insert `session` into the registry. Callers must hold `write_lock`
    /// (via [`Registry::lock_for_write`]) and must have just re-run `find`
    /// under that lock and observed a miss (spec: double-checked insert).
    pub fn insert(&self, session: Arc<Session<F>>) {
        self.snapshot.rcu(|current| {
            let mut next = (**current).clone();
            next.push(session.clone());
            next
        });
    }

    /// Remove `session` from the registry by pointer identity. Callers
    /// must hold `write_lock` and the session's write lock.
    pub fn unlink(&self, session: &Arc<Session<F>>) {
        self.snapshot.rcu(|current| {
            current
                .iter()
                .filter(|candidate| !Arc::ptr_eq(candidate, session))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    /// Acquire the registry's structural-mutation lock for the duration of
    /// a double-checked insert or an unlink.
    pub fn lock_for_write(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// Snapshot every currently-valid session, for `sweep` and the
    /// observability surface.
    pub fn snapshot_valid(&self) -> Vec<Arc<Session<F>>> {
        self.snapshot
            .load()
            .iter()
            .filter(|s| s.is_valid())
            .cloned()
            .collect()
    }

    /// Count of currently-valid sessions (spec: `sessions.active_count()`).
    pub fn active_session_count(&self) -> usize {
        self.snapshot.load().iter().filter(|s| s.is_valid()).count()
    }
}

impl<F> Default for Registry<F> {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn insert_then_find_hits() {
        let registry: Registry<()> = Registry::new();
        let session = Arc::new(Session::new(PathBuf::from("/mnt/a"), ()));
        let _guard = registry.lock_for_write();
        registry.insert(session.clone());
        drop(_guard);

        let found = registry.find(Path::new("/mnt/a")).unwrap();
        assert!(Arc::ptr_eq(&found, &session));
        assert_eq!(found.refcount(), 2);
    }

    #[test]
    fn find_misses_invalid_sessions() {
        let registry: Registry<()> = Registry::new();
        let session = Arc::new(Session::new(PathBuf::from("/mnt/a"), ()));
        session.mark_invalid();
        let _guard = registry.lock_for_write();
        registry.insert(session);
        drop(_guard);

        assert!(registry.find(Path::new("/mnt/a")).is_none());
    }

    #[test]
    fn unlink_removes_by_identity() {
        let registry: Registry<()> = Registry::new();
        let a = Arc::new(Session::new(PathBuf::from("/mnt/a"), ()));
        let b = Arc::new(Session::new(PathBuf::from("/mnt/b"), ()));
        {
            let _guard = registry.lock_for_write();
            registry.insert(a.clone());
            registry.insert(b.clone());
        }
        {
            let _guard = registry.lock_for_write();
            registry.unlink(&a);
        }
        assert!(registry.find(Path::new("/mnt/a")).is_none());
        assert!(registry.find(Path::new("/mnt/b")).is_some());
    }

    #[test]
    fn active_session_count_excludes_invalid() {
        let registry: Registry<()> = Registry::new();
        let a = Arc::new(Session::new(PathBuf::from("/mnt/a"), ()));
        let b = Arc::new(Session::new(PathBuf::from("/mnt/b"), ()));
        b.mark_invalid();
        let _guard = registry.lock_for_write();
        registry.insert(a);
        registry.insert(b);
        drop(_guard);
        assert_eq!(registry.active_session_count(), 1);
    }
}
