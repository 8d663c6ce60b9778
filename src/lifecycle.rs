//! The lifecycle engine: `create`, `close`, and `sweep`, the three
//! operations that drive sessions and incarnations through their states.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::host_fs::{HostFile, HostFs};
use crate::incarnation::{incarnation_path, Incarnation, MonotonicClock, SystemMonotonicClock};
use crate::open_flags::OpenFlags;
use crate::process_probe::ProcessProbe;
use crate::registry::Registry;
use crate::session::Session;

/// Owns the session registry and drives `create`/`close`/`sweep` against
/// it. Generic over the two capability traits so production callers wire
/// real filesystem and process-table access, while tests wire fakes.
pub struct LifecycleEngine<FS: HostFs, PP: ProcessProbe, C: MonotonicClock = SystemMonotonicClock> {
    host_fs: FS,
    process_probe: PP,
    clock: C,
    registry: Registry<FS::File>,
    next_fd: AtomicU64,
}

/// The result of a successful `create`.
#[derive(Debug)]
pub struct CreatedIncarnation {
    /// The fd number the caller should hand back to its process.
    pub fd: u64,
    /// `0` if copy-on-open succeeded, a negative errno otherwise.
    pub status: i32,
}

impl<FS: HostFs, PP: ProcessProbe> LifecycleEngine<FS, PP, SystemMonotonicClock> {
    /// Build an engine with the production monotonic clock.
    pub fn new(host_fs: FS, process_probe: PP) -> Self {
        LifecycleEngine {
            host_fs,
            process_probe,
            clock: SystemMonotonicClock::default(),
            registry: Registry::new(),
            next_fd: AtomicU64::new(0),
        }
    }
}

impl<FS: HostFs, PP: ProcessProbe, C: MonotonicClock> LifecycleEngine<FS, PP, C> {
    /// Build an engine with an explicit clock, for deterministic tests.
    pub fn with_clock(host_fs: FS, process_probe: PP, clock: C) -> Self {
        LifecycleEngine {
            host_fs,
            process_probe,
            clock,
            registry: Registry::new(),
            next_fd: AtomicU64::new(0),
        }
    }

    /// The underlying registry, for the observability surface.
    pub fn registry(&self) -> &Registry<FS::File> {
        &self.registry
    }

    /// The host filesystem handle, for tests that need to inspect
    /// persisted content out of band.
    pub fn host_fs(&self) -> &FS {
        &self.host_fs
    }

    /// The process probe, for tests that need to script liveness after
    /// construction.
    pub fn process_probe(&self) -> &PP {
        &self.process_probe
    }

    fn allocate_fd(&self) -> u64 {
        self.next_fd.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up or create the session for `path`, per spec: §4.5 step 1.
    ///
    /// `registry::find` never hands back an invalid session, so a hit here
    /// always carries one refcount on a live session; a miss falls through
    /// to the double-checked insert.
    fn lookup_or_create_session(
        &self,
        path: &Path,
        flags: i32,
        mode: u32,
    ) -> CoreResult<Arc<Session<FS::File>>> {
        if let Some(session) = self.registry.find(path) {
            return Ok(session);
        }

        let _write_guard = self.registry.lock_for_write();
        // Double-checked: a concurrent creator may have inserted first.
        if let Some(session) = self.registry.find(path) {
            return Ok(session);
        }

        // The original is always opened read-write regardless of the
        // caller's access-mode bits, so later write-back can proceed.
        // O_EXCL/O_CREAT are honored verbatim from the caller's flags; bits
        // outside `OpenFlags` (e.g. O_NOCTTY) pass through untouched, since
        // the mask only ever clears/sets the two access-mode bits.
        let original_flags = (flags & !OpenFlags::O_WRONLY.bits()) | OpenFlags::O_RDWR.bits();
        let original_handle = self.host_fs.open_host(path, original_flags, mode, false)?;

        let session = Arc::new(Session::new(path.to_path_buf(), original_handle));
        self.registry.insert(session.clone());
        debug!("session created for {}", path.display());
        Ok(session)
    }

    /// `create(path, flags, pid, mode) -> incarnation` (spec: §4.5).
    ///
    /// `flags` must already have the session opt-in bit stripped by the
    /// caller (spec: §4.5 preconditions); this engine never inspects it.
    pub fn create(&self, path: &Path, flags: i32, pid: u32, mode: u32) -> CoreResult<CreatedIncarnation> {
        let session = self.lookup_or_create_session(path, flags, mode)?;

        // From here the caller holds exactly one refcount on `session`,
        // released on every return path below.
        let result = self.create_incarnation(&session, path, flags, pid, mode);
        session.release();
        result
    }

    fn create_incarnation(
        &self,
        session: &Arc<Session<FS::File>>,
        path: &Path,
        flags: i32,
        pid: u32,
        mode: u32,
    ) -> CoreResult<CreatedIncarnation> {
        let nanos = self.clock.next_nanos();
        let inc_path = incarnation_path(path, pid, nanos);

        let read_guard = session.lock.read();
        if !session.is_valid() {
            drop(read_guard);
            return Err(CoreError::Retry);
        }

        let handle = match self
            .host_fs
            .open_host(&inc_path, flags | libc::O_CREAT, mode, true)
        {
            Ok(handle) => handle,
            Err(err) => {
                drop(read_guard);
                return Err(CoreError::from(err));
            }
        };

        let status = match self.host_fs.bulk_copy(&session.original_handle, &handle) {
            Ok(()) => 0,
            Err(err) => {
                warn!(
                    "copy-on-open failed for {}: {}",
                    inc_path.display(),
                    err
                );
                -err.raw_os_error().unwrap_or(libc::EIO)
            }
        };

        let fd = self.allocate_fd();
        let incarnation = Incarnation {
            owner_pid: pid,
            fd,
            handle,
            path: inc_path,
            status,
        };
        session.incarnations.lock().push(incarnation);
        drop(read_guard);

        Ok(CreatedIncarnation { fd, status })
    }

    /// `close(path, fd, pid)` (spec: §4.5).
    pub fn close(&self, path: &Path, fd: u64, pid: u32) -> CoreResult<()> {
        let session = match self.registry.find_by_fd(fd, pid) {
            Some(session) => session,
            None => return Err(CoreError::BadFd),
        };
        if session.original_path != path {
            session.release();
            return Err(CoreError::BadFd);
        }

        let owner_dead = self.process_probe.probe(pid).is_dead();

        let result = self.close_locked(&session, fd, pid);
        session.release();

        match result {
            Ok(()) if owner_dead => Err(CoreError::OwnerGone),
            other => other,
        }
    }

    fn close_locked(&self, session: &Arc<Session<FS::File>>, fd: u64, pid: u32) -> CoreResult<()> {
        let write_guard = session.lock.write();

        let removed = {
            let mut incarnations = session.incarnations.lock();
            let position = incarnations.iter().position(|inc| inc.key() == (pid, fd));
            position.map(|index| incarnations.remove(index))
        };

        let incarnation = match removed {
            Some(incarnation) => incarnation,
            None => {
                // Raced a concurrent sweep that already reaped this
                // incarnation between find_by_fd and taking the write lock.
                drop(write_guard);
                return Err(CoreError::Retry);
            }
        };

        let mut copy_error = None;
        if session.is_valid() && !incarnation.is_corrupt() {
            if let Err(err) = self
                .host_fs
                .bulk_copy(&incarnation.handle, &session.original_handle)
            {
                warn!("copy-on-close failed for {}: {}", incarnation.path.display(), err);
                copy_error = Some(err);
            }
        }
        drop(incarnation);

        let should_unlink = session.incarnations.lock().is_empty()
            && session.refcount() == 1
            && session.is_valid();
        if should_unlink {
            session.mark_invalid();
            let _registry_guard = self.registry.lock_for_write();
            self.registry.unlink(session);
            info!("session torn down for {}", session.original_path.display());
        }

        drop(write_guard);

        match copy_error {
            Some(err) => Err(CoreError::from(err)),
            None => Ok(()),
        }
    }

    /// `sweep() -> active_count` (spec: §4.5).
    pub fn sweep(&self) -> u64 {
        let mut active = 0u64;
        let mut newly_invalid = Vec::new();

        for session in self.registry.snapshot_valid() {
            session.acquire();
            let write_guard = session.lock.write();

            let taken = std::mem::take(&mut *session.incarnations.lock());
            let mut survivors = Vec::with_capacity(taken.len());
            for incarnation in taken {
                if self.process_probe.probe(incarnation.owner_pid).is_dead() {
                    debug!(
                        "sweep reaping incarnation owned by dead pid {} at {}",
                        incarnation.owner_pid,
                        incarnation.path.display()
                    );
                    // The handle here is ours (the core's), not the dead
                    // process's descriptor-table entry, so it is always
                    // closed normally via `Drop` rather than left alone.
                    drop(incarnation);
                } else {
                    survivors.push(incarnation);
                }
            }
            active += survivors.len() as u64;
            *session.incarnations.lock() = survivors;

            let now_empty = session.incarnations.lock().is_empty();
            if now_empty && session.is_valid() {
                session.mark_invalid();
                newly_invalid.push(session.clone());
            }
            drop(write_guard);
            session.release();
        }

        if !newly_invalid.is_empty() {
            let _registry_guard = self.registry.lock_for_write();
            for session in &newly_invalid {
                self.registry.unlink(session);
            }
        }

        active
    }

    /// `sessions.active_count()` observability getter.
    pub fn active_session_count(&self) -> usize {
        self.registry.active_session_count()
    }

    /// Per-session `incarnations.count()` observability getter.
    pub fn incarnation_count(&self, path: &Path) -> Option<usize> {
        let session = self.registry.find(path)?;
        let count = session.incarnations.lock().len();
        session.release();
        Some(count)
    }

    /// Per-incarnation `owner_name()` observability getter. Returns `None`
    /// if `(pid, fd)` names no live incarnation; otherwise the process's
    /// name, or the `"<gone>"` sentinel if it can no longer be resolved.
    pub fn incarnation_owner_name(&self, pid: u32, fd: u64) -> Option<String> {
        let session = self.registry.find_by_fd(fd, pid)?;
        session.release();
        Some(
            self.process_probe
                .owner_name(pid)
                .unwrap_or_else(|| "<gone>".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_fs::FakeHostFs;
    use crate::incarnation::CountingClock;
    use crate::process_probe::{Liveness, ScriptedProcessProbe};

    type TestEngine = LifecycleEngine<FakeHostFs, ScriptedProcessProbe, CountingClock>;

    fn engine() -> TestEngine {
        LifecycleEngine::with_clock(FakeHostFs::new(), ScriptedProcessProbe::new(), CountingClock::default())
    }

    #[test]
    fn create_new_file_is_empty_and_valid() {
        let engine = engine();
        engine.process_probe.set(100, Liveness::Alive);
        let created = engine
            .create(Path::new("/mnt/a.txt"), libc::O_RDWR | libc::O_CREAT, 100, 0o644)
            .unwrap();
        assert_eq!(created.status, 0);
    }

    #[test]
    fn write_then_close_flushes_to_original() {
        let engine = engine();
        engine.process_probe.set(100, Liveness::Alive);
        let created = engine
            .create(Path::new("/mnt/a.txt"), libc::O_RDWR | libc::O_CREAT, 100, 0o644)
            .unwrap();

        let session = engine.registry.find(Path::new("/mnt/a.txt")).unwrap();
        {
            let incarnations = session.incarnations.lock();
            let inc = incarnations.iter().find(|i| i.fd == created.fd).unwrap();
            inc.handle.write_at(&[0x41, 0x42, 0x43], 0).unwrap();
        }
        session.release();

        engine.close(Path::new("/mnt/a.txt"), created.fd, 100).unwrap();

        let original = engine.host_fs.peek(Path::new("/mnt/a.txt")).unwrap();
        assert_eq!(original.contents(), vec![0x41, 0x42, 0x43]);
    }

    #[test]
    fn last_closer_wins() {
        let engine = engine();
        engine.process_probe.set(100, Liveness::Alive);
        engine.process_probe.set(200, Liveness::Alive);

        let a = engine
            .create(Path::new("/mnt/a.txt"), libc::O_RDWR | libc::O_CREAT, 100, 0o644)
            .unwrap();
        let b = engine
            .create(Path::new("/mnt/a.txt"), libc::O_RDWR | libc::O_CREAT, 200, 0o644)
            .unwrap();

        let session = engine.registry.find(Path::new("/mnt/a.txt")).unwrap();
        {
            let incarnations = session.incarnations.lock();
            incarnations.iter().find(|i| i.fd == a.fd).unwrap().handle.write_at(&[0x01], 0).unwrap();
            incarnations.iter().find(|i| i.fd == b.fd).unwrap().handle.write_at(&[0x02], 0).unwrap();
        }
        session.release();

        engine.close(Path::new("/mnt/a.txt"), a.fd, 100).unwrap();
        engine.close(Path::new("/mnt/a.txt"), b.fd, 200).unwrap();

        let original = engine.host_fs.peek(Path::new("/mnt/a.txt")).unwrap();
        assert_eq!(original.contents(), vec![0x02]);
    }

    #[test]
    fn sweep_reaps_dead_owner_without_flush() {
        let engine = engine();
        engine.process_probe.set(100, Liveness::Alive);
        let created = engine
            .create(Path::new("/mnt/a.txt"), libc::O_RDWR | libc::O_CREAT, 100, 0o644)
            .unwrap();
        {
            let session = engine.registry.find(Path::new("/mnt/a.txt")).unwrap();
            session
                .incarnations
                .lock()
                .iter()
                .find(|i| i.fd == created.fd)
                .unwrap()
                .handle
                .write_at(&[0xff], 0)
                .unwrap();
            session.release();
        }

        engine.process_probe.kill(100);
        let active = engine.sweep();
        assert_eq!(active, 0);

        let original = engine.host_fs.peek(Path::new("/mnt/a.txt")).unwrap();
        assert_eq!(original.contents(), Vec::<u8>::new());
    }

    #[test]
    fn close_unknown_fd_returns_bad_fd() {
        let engine = engine();
        let err = engine.close(Path::new("/mnt/a.txt"), 99, 1).unwrap_err();
        assert!(matches!(err, CoreError::BadFd));
    }

    #[test]
    fn corrupt_incarnation_skips_writeback_on_close() {
        let engine = engine();
        engine.process_probe.set(100, Liveness::Alive);
        let created = engine
            .create(Path::new("/mnt/a.txt"), libc::O_RDWR | libc::O_CREAT, 100, 0o644)
            .unwrap();
        {
            let session = engine.registry.find(Path::new("/mnt/a.txt")).unwrap();
            {
                let mut incarnations = session.incarnations.lock();
                let inc = incarnations.iter_mut().find(|i| i.fd == created.fd).unwrap();
                inc.status = -libc::EIO;
                inc.handle.write_at(&[0x99], 0).unwrap();
            }
            session.release();
        }

        engine.close(Path::new("/mnt/a.txt"), created.fd, 100).unwrap();

        let original = engine.host_fs.peek(Path::new("/mnt/a.txt")).unwrap();
        assert_eq!(original.contents(), Vec::<u8>::new());
    }

    #[test]
    fn close_reports_owner_gone_but_still_tears_down() {
        let engine = engine();
        engine.process_probe.set(100, Liveness::Alive);
        let created = engine
            .create(Path::new("/mnt/a.txt"), libc::O_RDWR | libc::O_CREAT, 100, 0o644)
            .unwrap();
        engine.process_probe.kill(100);

        let err = engine.close(Path::new("/mnt/a.txt"), created.fd, 100).unwrap_err();
        assert!(matches!(err, CoreError::OwnerGone));
        assert_eq!(engine.active_session_count(), 0);
    }
}
