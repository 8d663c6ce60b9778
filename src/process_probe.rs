//! Process-liveness probing, used by [`sweep`](crate::lifecycle::sweep) to
//! reap incarnations whose owning process has died.

use std::collections::HashMap;

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// The liveness states `sweep` treats as distinct from "process is still
/// genuinely running and able to close its incarnations itself".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process is running normally.
    Alive,
    /// The process has exited but not yet been reaped by its parent.
    Zombie,
    /// The process is stopped under a debugger.
    Traced,
    /// The process is job-control stopped.
    Stopped,
    /// The process no longer exists.
    Gone,
}

impl Liveness {
    /// `sweep` treats every state but `Alive` as dead.
    pub fn is_dead(self) -> bool {
        !matches!(self, Liveness::Alive)
    }
}

/// Abstraction over the host's process table, so tests can inject a
/// scripted table of process states instead of depending on real PIDs.
pub trait ProcessProbe: Send + Sync {
    /// Classify the liveness of `pid`.
    fn probe(&self, pid: u32) -> Liveness;

    /// A short human-readable name for `pid`, for the observability
    /// surface's `owner_name()` getter. Returns `None` if the owner
    /// cannot be resolved (the sentinel string is applied by the caller).
    fn owner_name(&self, pid: u32) -> Option<String> {
        match self.probe(pid) {
            Liveness::Gone => None,
            _ => Some(format!("pid-{pid}")),
        }
    }
}

/// Production probe: reads `/proc/<pid>/stat` on Linux, falling back to
/// `kill(pid, 0)` when `/proc` is unavailable (e.g. non-Linux Unix).
#[derive(Debug, Default, Clone, Copy)]
pub struct RealProcessProbe;

impl ProcessProbe for RealProcessProbe {
    fn probe(&self, pid: u32) -> Liveness {
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            return parse_proc_stat_state(&stat).unwrap_or(Liveness::Alive);
        }
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => Liveness::Alive,
            Err(nix::errno::Errno::ESRCH) => Liveness::Gone,
            Err(_) => Liveness::Alive,
        }
    }

    fn owner_name(&self, pid: u32) -> Option<String> {
        let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
        Some(comm.trim_end().to_string())
    }
}

/// `/proc/<pid>/stat` encodes the process state as the third
/// whitespace-separated field (after a possibly-parenthesized,
/// possibly-space-containing command name), e.g. `1234 (sleep) S 1 ...`.
fn parse_proc_stat_state(stat: &str) -> Option<Liveness> {
    let close_paren = stat.rfind(')')?;
    let rest = stat.get(close_paren + 1..)?;
    let state = rest.split_whitespace().next()?;
    Some(match state {
        "Z" => Liveness::Zombie,
        "T" | "t" => Liveness::Traced,
        "S" | "D" | "R" | "I" => Liveness::Alive,
        _ => Liveness::Stopped,
    })
}

/// Scripted fake for tests: a fixed table of `pid -> Liveness`, with any
/// unlisted pid reported as `Gone`.
#[derive(Debug, Default)]
pub struct ScriptedProcessProbe {
    table: parking_lot::Mutex<HashMap<u32, Liveness>>,
}

impl ScriptedProcessProbe {
    /// Build an empty scripted table; every pid starts `Gone`.
    pub fn new() -> Self {
        ScriptedProcessProbe::default()
    }

    /// Record `pid` as alive (or whatever liveness `state` describes).
    pub fn set(&self, pid: u32, state: Liveness) {
        self.table.lock().insert(pid, state);
    }

    /// Mark `pid` as having died.
    pub fn kill(&self, pid: u32) {
        self.set(pid, Liveness::Gone);
    }
}

impl ProcessProbe for ScriptedProcessProbe {
    fn probe(&self, pid: u32) -> Liveness {
        self.table.lock().get(&pid).copied().unwrap_or(Liveness::Gone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_probe_defaults_to_gone() {
        let probe = ScriptedProcessProbe::new();
        assert_eq!(probe.probe(100), Liveness::Gone);
    }

    #[test]
    fn scripted_probe_reports_set_state() {
        let probe = ScriptedProcessProbe::new();
        probe.set(100, Liveness::Alive);
        assert_eq!(probe.probe(100), Liveness::Alive);
        probe.kill(100);
        assert_eq!(probe.probe(100), Liveness::Gone);
    }

    #[test]
    fn dead_states_exclude_only_alive() {
        assert!(!Liveness::Alive.is_dead());
        assert!(Liveness::Zombie.is_dead());
        assert!(Liveness::Traced.is_dead());
        assert!(Liveness::Stopped.is_dead());
        assert!(Liveness::Gone.is_dead());
    }

    #[test]
    fn parse_proc_stat_state_handles_parens_in_comm() {
        assert_eq!(
            parse_proc_stat_state("1234 (my (weird) proc) S 1 1 1"),
            Some(Liveness::Alive)
        );
        assert_eq!(parse_proc_stat_state("1234 (sleep) Z 1 1 1"), Some(Liveness::Zombie));
    }

    #[test]
    fn real_probe_sees_current_process_alive() {
        let probe = RealProcessProbe;
        assert_eq!(probe.probe(std::process::id()), Liveness::Alive);
    }
}
