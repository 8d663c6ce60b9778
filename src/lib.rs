//! `sessionfs-core`: the concurrent session-manager core behind a
//! Unix-style copy-on-open filesystem overlay.
//!
//! Every original file beneath a configured root gets, on first open, a
//! private per-opener incarnation copied from the original's current
//! content. Writes land in the incarnation; the last incarnation to close
//! writes its content back to the original ("last closer wins"). A
//! background `sweep()` reaps incarnations whose owning process has died
//! without closing.
//!
//! The crate is organized around two capability traits, [`host_fs::HostFs`]
//! and [`process_probe::ProcessProbe`], so the lifecycle engine in
//! [`lifecycle`] can be driven against real files and the real process
//! table in production, or against the in-memory fakes in `host_fs`/
//! `process_probe` in tests. [`control::CoreState`] is the entry point
//! most callers want: it owns the path gate, the lifecycle engine, and the
//! shutdown coordinator, and dispatches the three external control
//! messages (`OPEN`/`CLOSE`/`SHUTDOWN`).

mod control;
mod error;
mod host_fs;
mod incarnation;
mod lifecycle;
mod open_flags;
mod path_gate;
mod process_probe;
mod registry;
mod session;
mod shutdown;

pub use control::{CloseRequest, CoreState, OpenRequest, OpenResponse, ShutdownRequest};
pub use error::{CoreError, CoreResult};
pub use host_fs::{FakeHandle, FakeHostFile, FakeHostFs, HostFile, HostFs, RealHostFile, RealHostFs};
pub use incarnation::{CountingClock, MonotonicClock, SystemMonotonicClock};
pub use lifecycle::{CreatedIncarnation, LifecycleEngine};
pub use open_flags::OpenFlags;
pub use path_gate::{Membership, PathGate, DEFAULT_ROOT};
pub use process_probe::{Liveness, ProcessProbe, RealProcessProbe, ScriptedProcessProbe};
