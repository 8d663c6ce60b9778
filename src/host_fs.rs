//! File I/O primitives: scoped open/close of host-filesystem files, and
//! `bulk_copy`, which streams the entire content of one handle into
//! another from offset 0.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::RawFd;
use std::path::Path;

/// Size of the scratch buffer used by [`HostFs::bulk_copy`]'s default
/// implementation. A slab of 512 bytes is sufficient; the algorithm places
/// no requirement on slab size beyond "fixed".
const COPY_SLAB_SIZE: usize = 512;

/// A single open file on the host filesystem, opaque to callers beyond
/// the read/write/seek operations `bulk_copy` needs.
pub trait HostFile: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    /// Write `buf` starting at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
    /// Truncate the file to zero length, for overwrite-in-place write-back.
    fn truncate(&self) -> io::Result<()>;
    /// The raw file descriptor number, when one exists and is meaningful
    /// to the caller (`want_fd` in [`HostFs::open_host`]).
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Abstraction over host filesystem operations, so the lifecycle engine
/// can be tested against an in-memory fake instead of real files.
pub trait HostFs: Send + Sync {
    /// The open file handle type this implementation produces.
    type File: HostFile;

    /// Open or create the named host file.
    ///
    /// If `want_fd` is set, the caller additionally wants a descriptor
    /// number bound to the handle (the one the external process-facing
    /// collaborator will expose as the incarnation's fd); otherwise only
    /// the handle is returned.
    fn open_host(
        &self,
        path: &Path,
        flags: i32,
        mode: u32,
        want_fd: bool,
    ) -> io::Result<Self::File>;

    /// Stream the entire content of `src` into `dst`, both from offset 0,
    /// in fixed-size slabs. Aborts on the first read or write error.
    /// Never called concurrently on the same `dst` (callers serialize via
    /// the session lock).
    fn bulk_copy(&self, src: &Self::File, dst: &Self::File) -> io::Result<()> {
        dst.truncate()?;
        let mut buf = [0u8; COPY_SLAB_SIZE];
        let mut offset = 0u64;
        loop {
            let read = src.read_at(&mut buf, offset)?;
            if read == 0 {
                return Ok(());
            }
            let mut written = 0;
            while written < read {
                let n = dst.write_at(&buf[written..read], offset + written as u64)?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
                }
                written += n;
            }
            offset += read as u64;
        }
    }
}

/// Production [`HostFile`] backed by a real file descriptor. There is no
/// explicit `close`: the descriptor is released by dropping the wrapped
/// `std::fs::File`, so it is always closed exactly once, whenever the
/// last owner of this handle goes out of scope (including a `sweep()`
/// reap of a dead owner's incarnation, which never inherited the
/// descriptor from that owner's own table and so has nothing to avoid
/// double-closing).
pub struct RealHostFile {
    file: parking_lot::Mutex<std::fs::File>,
    fd: RawFd,
}

impl RealHostFile {
    fn new(file: std::fs::File) -> Self {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        RealHostFile {
            file: parking_lot::Mutex::new(file),
            fd,
        }
    }
}

impl HostFile for RealHostFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write(buf)
    }

    fn truncate(&self) -> io::Result<()> {
        self.file.lock().set_len(0)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd)
    }
}

/// Production [`HostFs`] backed by `std::fs` / raw `open(2)` flags.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealHostFs;

impl HostFs for RealHostFs {
    type File = RealHostFile;

    fn open_host(
        &self,
        path: &Path,
        flags: i32,
        mode: u32,
        _want_fd: bool,
    ) -> io::Result<Self::File> {
        use std::os::unix::io::FromRawFd;

        let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let raw = unsafe { libc::open(cpath.as_ptr(), flags, mode as libc::mode_t) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let file = unsafe { std::fs::File::from_raw_fd(raw) };
        Ok(RealHostFile::new(file))
    }
}

/// In-memory fake [`HostFile`] for tests: every "file" is a `Vec<u8>`
/// behind a mutex.
#[derive(Debug, Default)]
pub struct FakeHostFile {
    data: parking_lot::Mutex<Vec<u8>>,
}

impl HostFile for FakeHostFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&self) -> io::Result<()> {
        self.data.lock().clear();
        Ok(())
    }
}

impl FakeHostFile {
    /// Snapshot the current content, for test assertions.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

/// In-memory fake [`HostFs`]: a table of named `FakeHostFile`s, so tests
/// can exercise the lifecycle engine without touching disk.
#[derive(Debug, Default)]
pub struct FakeHostFs {
    files: parking_lot::Mutex<std::collections::HashMap<std::path::PathBuf, std::sync::Arc<FakeHostFile>>>,
}

impl FakeHostFs {
    /// Build an empty fake filesystem.
    pub fn new() -> Self {
        FakeHostFs::default()
    }

    /// Fetch a handle to the backing data for `path`, for test assertions.
    pub fn peek(&self, path: &Path) -> Option<std::sync::Arc<FakeHostFile>> {
        self.files.lock().get(path).cloned()
    }
}

/// A reference-counted handle into [`FakeHostFs`]'s table, implementing
/// [`HostFile`] by delegating to the shared backing store.
#[derive(Clone, Debug)]
pub struct FakeHandle(std::sync::Arc<FakeHostFile>);

impl HostFile for FakeHandle {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.0.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.0.write_at(buf, offset)
    }

    fn truncate(&self) -> io::Result<()> {
        self.0.truncate()
    }
}

impl HostFs for FakeHostFs {
    type File = FakeHandle;

    fn open_host(
        &self,
        path: &Path,
        flags: i32,
        _mode: u32,
        _want_fd: bool,
    ) -> io::Result<Self::File> {
        let mut files = self.files.lock();
        let exists = files.contains_key(path);
        if flags & libc::O_EXCL != 0 && flags & libc::O_CREAT != 0 && exists {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        if !exists {
            if flags & libc::O_CREAT == 0 {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            files.insert(path.to_path_buf(), std::sync::Arc::new(FakeHostFile::default()));
        }
        Ok(FakeHandle(files.get(path).unwrap().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_copy_streams_full_content() {
        let fs = FakeHostFs::new();
        let src = fs.open_host(Path::new("/mnt/a"), libc::O_CREAT, 0o644, false).unwrap();
        src.write_at(b"hello world", 0).unwrap();
        let dst = fs.open_host(Path::new("/mnt/b"), libc::O_CREAT, 0o644, false).unwrap();
        fs.bulk_copy(&src, &dst).unwrap();
        let mut buf = [0u8; 11];
        dst.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn bulk_copy_truncates_destination_first() {
        let fs = FakeHostFs::new();
        let src = fs.open_host(Path::new("/mnt/a"), libc::O_CREAT, 0o644, false).unwrap();
        src.write_at(b"ab", 0).unwrap();
        let dst = fs.open_host(Path::new("/mnt/b"), libc::O_CREAT, 0o644, false).unwrap();
        dst.write_at(b"longer content here", 0).unwrap();
        fs.bulk_copy(&src, &dst).unwrap();
        let mut buf = [0u8; 4];
        let n = dst.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"ab");
    }

    #[test]
    fn open_host_excl_create_fails_if_exists() {
        let fs = FakeHostFs::new();
        fs.open_host(Path::new("/mnt/a"), libc::O_CREAT, 0o644, false).unwrap();
        let err = fs
            .open_host(Path::new("/mnt/a"), libc::O_CREAT | libc::O_EXCL, 0o644, false)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    }
}
