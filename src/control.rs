//! The control-message layer: the three external operations (`OPEN`,
//! `CLOSE`, `SHUTDOWN`) and the top-level [`CoreState`] that wires the
//! lifecycle engine, path gate, and shutdown coordinator together for a
//! caller (an in-process FUSE-style request loop, an IPC server, a test
//! harness) to drive.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::host_fs::HostFs;
use crate::lifecycle::LifecycleEngine;
use crate::open_flags::OpenFlags;
use crate::path_gate::{Membership, PathGate};
use crate::process_probe::ProcessProbe;
use crate::shutdown::ShutdownCoordinator;

/// `OPEN` request (spec: §6).
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub path: PathBuf,
    pub flags: i32,
    pub mode: u32,
    pub pid: u32,
}

/// `OPEN` response on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenResponse {
    pub fd: u64,
    pub status: i32,
}

/// `CLOSE` request (spec: §6).
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub path: PathBuf,
    pub fd: u64,
    pub pid: u32,
}

/// `SHUTDOWN` request (spec: §6). Carries no fields; its only variation is
/// whether it succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownRequest;

/// The top-level handle a caller holds: the path gate, the lifecycle
/// engine, and the shutdown coordinator, composed into the three control
/// messages plus the observability getters.
pub struct CoreState<FS: HostFs, PP: ProcessProbe> {
    path_gate: PathGate,
    lifecycle: LifecycleEngine<FS, PP>,
    shutdown: ShutdownCoordinator,
}

impl<FS: HostFs, PP: ProcessProbe> CoreState<FS, PP> {
    /// Build a core rooted at `root`, `CoreError::Invalid` if `root` is not
    /// absolute.
    pub fn new(root: PathBuf, host_fs: FS, process_probe: PP) -> CoreResult<Self> {
        Ok(CoreState {
            path_gate: PathGate::with_root(root)?,
            lifecycle: LifecycleEngine::new(host_fs, process_probe),
            shutdown: ShutdownCoordinator::new(),
        })
    }

    /// Build a core rooted at the compile-time default (`/mnt`).
    pub fn with_default_root(host_fs: FS, process_probe: PP) -> Self {
        CoreState {
            path_gate: PathGate::new(),
            lifecycle: LifecycleEngine::new(host_fs, process_probe),
            shutdown: ShutdownCoordinator::new(),
        }
    }

    /// Read the currently configured session root.
    pub fn get_root(&self) -> PathBuf {
        self.path_gate.get_root()
    }

    /// Replace the session root. Rejected with `CoreError::Invalid` if the
    /// new root is not absolute; has no effect on sessions already open
    /// under the previous root.
    pub fn set_root(&self, root: impl Into<PathBuf>) -> CoreResult<()> {
        self.path_gate.set_root(root)
    }

    /// Dispatch an `OPEN` control message.
    pub fn open(&self, request: OpenRequest) -> CoreResult<OpenResponse> {
        let _guard = self.shutdown.enter().ok_or(CoreError::Busy)?;

        if !request.path.is_absolute() {
            return Err(CoreError::Invalid);
        }
        if self.path_gate.is_under_root(&request.path) == Membership::Outside {
            return Err(CoreError::Invalid);
        }
        if !OpenFlags::requests_session(request.flags) {
            return Err(CoreError::Invalid);
        }
        let flags = OpenFlags::strip_session_bit(request.flags);

        let created = self
            .lifecycle
            .create(&request.path, flags, request.pid, request.mode)?;
        Ok(OpenResponse {
            fd: created.fd,
            status: created.status,
        })
    }

    /// Dispatch a `CLOSE` control message.
    pub fn close(&self, request: CloseRequest) -> CoreResult<()> {
        let _guard = self.shutdown.enter().ok_or(CoreError::Busy)?;

        if !request.path.is_absolute() {
            return Err(CoreError::Invalid);
        }
        self.lifecycle.close(&request.path, request.fd, request.pid)
    }

    /// Run a maintenance sweep, reaping incarnations whose owning process
    /// has died without closing. Not one of the three control messages,
    /// but, per spec: §5, subject to the same shutdown-entry guard as
    /// `create`/`close` (a background sweeper thread is an "operation"
    /// too). Returns the count of incarnations still active afterward.
    pub fn sweep(&self) -> CoreResult<u64> {
        let _guard = self.shutdown.enter().ok_or(CoreError::Busy)?;
        Ok(self.lifecycle.sweep())
    }

    /// Dispatch a `SHUTDOWN` control message. On success, returns the
    /// active incarnation count observed at the moment of the successful
    /// drain (always `0`, since a nonzero count fails the drain). On
    /// failure, the core remains enabled and the caller may retry.
    ///
    /// Disables the core *before* sweeping, per spec: §2 item 7 / §5 — a
    /// `create` that starts after this point sees `enter()` return `None`
    /// and never inserts a fresh incarnation, so the `sweep()` taken next
    /// is a true snapshot of what's left. Sweeping before disabling would
    /// let such a `create` land, unseen, between the sweep and the
    /// in-flight check.
    pub fn shutdown(&self, _request: ShutdownRequest) -> CoreResult<u64> {
        self.shutdown.disable();
        let active = self.lifecycle.sweep();
        if self.shutdown.confirm_quiescent(active) {
            Ok(active)
        } else {
            warn!("shutdown refused: {active} incarnations still active or an operation in flight");
            Err(CoreError::Busy)
        }
    }

    /// Re-initialize the core after a successful shutdown, for a caller
    /// that wants to reuse the same `CoreState` (e.g. remount).
    pub fn reset(&self) {
        self.shutdown.reset();
    }

    /// `true` once a `SHUTDOWN` has succeeded and no `reset` has happened.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_disabled()
    }

    /// `sessions.active_count()` observability getter.
    pub fn active_session_count(&self) -> usize {
        self.lifecycle.active_session_count()
    }

    /// Per-session `incarnations.count()` observability getter.
    pub fn incarnation_count(&self, path: &Path) -> Option<usize> {
        self.lifecycle.incarnation_count(path)
    }

    /// Per-incarnation `owner_name()` observability getter.
    pub fn incarnation_owner_name(&self, pid: u32, fd: u64) -> Option<String> {
        self.lifecycle.incarnation_owner_name(pid, fd)
    }

    /// The host filesystem handle, for tests that need to inspect
    /// persisted content out of band.
    pub fn host_fs(&self) -> &FS {
        self.lifecycle.host_fs()
    }

    /// The process probe, for tests that need to script liveness after
    /// construction.
    pub fn process_probe(&self) -> &PP {
        self.lifecycle.process_probe()
    }
}
