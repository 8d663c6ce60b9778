//! Open flags as passed across the `OPEN` control message, named the way
//! `open(2)` names them.

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// The subset of `open(2)`'s flag bits the lifecycle engine inspects
    /// directly; every other bit is passed through to the host unexamined.
    /// `SESSION_OPT_IN` is not a real `open(2)` flag: it occupies a bit no
    /// Linux open flag uses, and callers set it to ask for session
    /// semantics rather than passthrough. The core strips it before any
    /// host open call (spec: §4.5 preconditions).
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct OpenFlags: i32 {
        const O_WRONLY = libc::O_WRONLY;
        const O_RDWR = libc::O_RDWR;
        const O_CREAT = libc::O_CREAT;
        const O_EXCL = libc::O_EXCL;
        const O_TRUNC = libc::O_TRUNC;
        const O_APPEND = libc::O_APPEND;
        const SESSION_OPT_IN = 1 << 30;
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.bits(), f)
    }
}

impl OpenFlags {
    /// `true` if raw flags word `bits` carries the session opt-in bit.
    /// Checked as a raw mask rather than through [`OpenFlags::from_bits_truncate`]
    /// so unrelated bits in `bits` are never inspected or dropped.
    pub fn requests_session(bits: i32) -> bool {
        bits & OpenFlags::SESSION_OPT_IN.bits() != 0
    }

    /// Strip the session opt-in bit from a raw flags word, leaving every
    /// other bit (including ones this type doesn't name) untouched.
    pub fn strip_session_bit(bits: i32) -> i32 {
        bits & !OpenFlags::SESSION_OPT_IN.bits()
    }
}
