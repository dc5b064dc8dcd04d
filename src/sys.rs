//! Thin wrappers around the fd-relative syscalls the daemon needs.
//!
//! Everything here is a direct translation of a single libc call into
//! `io::Result`. The shadow tree is only ever accessed relative to an
//! already-open directory descriptor, so the usual `std::fs` path-based
//! API does not apply.

use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::mem;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn cstring(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Open a directory by path with `O_PATH` semantics. Used once, for the
/// shadow-tree root; every other open is relative to a cached dir fd.
pub fn open_dir_path(path: &Path) -> io::Result<OwnedFd> {
    let c_path = cstring(path.as_os_str())?;
    let fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Symlink-refusing, path-only open of `name` relative to `dirfd`.
pub fn openat_path(dirfd: BorrowedFd<'_>, name: &OsStr) -> io::Result<OwnedFd> {
    openat(dirfd, name, libc::O_PATH | libc::O_NOFOLLOW)
}

/// Symlink-refusing read-only open of `name` relative to `dirfd`.
pub fn openat_read(dirfd: BorrowedFd<'_>, name: &OsStr) -> io::Result<OwnedFd> {
    openat(dirfd, name, libc::O_RDONLY | libc::O_NOFOLLOW)
}

/// Read-only open of the directory `dirfd` itself. An `O_PATH` descriptor
/// cannot be handed to `fdopendir` or `flock`, so callers needing either
/// must reopen first.
pub fn reopen_dir(dirfd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    openat(dirfd, OsStr::new("."), libc::O_RDONLY | libc::O_DIRECTORY)
}

fn openat(dirfd: BorrowedFd<'_>, name: &OsStr, flags: libc::c_int) -> io::Result<OwnedFd> {
    let c_name = cstring(name)?;
    let fd = unsafe { libc::openat(dirfd.as_raw_fd(), c_name.as_ptr(), flags | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// `fstatat` on the descriptor itself (`AT_EMPTY_PATH`), never following
/// symlinks. Works on `O_PATH` descriptors.
pub fn fstatat_fd(fd: BorrowedFd<'_>) -> io::Result<libc::stat> {
    let mut st: libc::stat = unsafe { mem::zeroed() };
    let empty = [0 as libc::c_char];
    let res = unsafe {
        libc::fstatat(
            fd.as_raw_fd(),
            empty.as_ptr(),
            &mut st,
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

pub fn fstatvfs(fd: BorrowedFd<'_>) -> io::Result<libc::statvfs> {
    let mut st: libc::statvfs = unsafe { mem::zeroed() };
    let res = unsafe { libc::fstatvfs(fd.as_raw_fd(), &mut st) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

pub fn flock(fd: BorrowedFd<'_>, op: libc::c_int) -> io::Result<()> {
    let res = unsafe { libc::flock(fd.as_raw_fd(), op) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn fsync_fd(fd: RawFd, datasync: bool) -> io::Result<()> {
    let res = unsafe {
        if datasync {
            libc::fdatasync(fd)
        } else {
            libc::fsync(fd)
        }
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read up to `max` bytes starting at `offset`. Short reads against a
/// regular file on a local filesystem only happen at EOF, which is the
/// expected case for bounded shadow documents.
pub fn pread_at(fd: BorrowedFd<'_>, offset: i64, max: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; max];
    let n = unsafe {
        libc::pread(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(n as usize);
    Ok(buf)
}

pub fn timespec_to_system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = nsecs as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, nsecs)
    }
}

/// One entry yielded by a [`DirStream`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    /// Offset of the *next* entry, as reported by the kernel (`d_off`).
    pub next_offset: i64,
    /// `DT_*` type byte.
    pub dtype: u8,
}

impl DirEntry {
    pub fn is_dot(&self) -> bool {
        let b = self.name.as_bytes();
        b == b"." || b == b".."
    }
}

/// A seekable stream over the entries of an open directory, backing one
/// opendir..releasedir window. Owns the underlying descriptor.
pub struct DirStream {
    dir: NonNull<libc::DIR>,
    offset: i64,
}

// The DIR handle is only touched through &mut self; the per-open handle
// table serializes access.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Takes ownership of `fd`, which must be a readable directory fd.
    pub fn new(fd: OwnedFd) -> io::Result<DirStream> {
        let raw = fd.as_raw_fd();
        let dir = unsafe { libc::fdopendir(raw) };
        let Some(dir) = NonNull::new(dir) else {
            return Err(io::Error::last_os_error());
        };
        // fdopendir took ownership of the descriptor.
        mem::forget(fd);
        Ok(DirStream { dir, offset: 0 })
    }

    pub fn raw_fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dir.as_ptr()) }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Position the stream at a `d_off` cookie previously returned in a
    /// [`DirEntry`], or 0 for the beginning.
    pub fn seek(&mut self, offset: i64) {
        if offset == 0 {
            unsafe { libc::rewinddir(self.dir.as_ptr()) };
        } else {
            unsafe { libc::seekdir(self.dir.as_ptr(), offset) };
        }
        self.offset = offset;
    }

    pub fn next(&mut self) -> io::Result<Option<DirEntry>> {
        unsafe {
            *libc::__errno_location() = 0;
        }
        let entry = unsafe { libc::readdir(self.dir.as_ptr()) };
        if entry.is_null() {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(0) | None => Ok(None),
                Some(_) => Err(err),
            };
        }
        let entry = unsafe { &*entry };
        let name_bytes = unsafe { std::ffi::CStr::from_ptr(entry.d_name.as_ptr()).to_bytes() };
        let dirent = DirEntry {
            name: OsString::from_vec(name_bytes.to_vec()),
            ino: entry.d_ino,
            next_offset: entry.d_off,
            dtype: entry.d_type,
        };
        self.offset = dirent.next_offset;
        Ok(Some(dirent))
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dir.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsFd;

    #[test]
    fn dir_stream_lists_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"x").unwrap();
        std::fs::write(tmp.path().join("b"), b"y").unwrap();

        let dirfd = open_dir_path(tmp.path()).unwrap();
        let read_fd = reopen_dir(dirfd.as_fd()).unwrap();
        let mut stream = DirStream::new(read_fd).unwrap();

        let mut names = Vec::new();
        while let Some(entry) = stream.next().unwrap() {
            if !entry.is_dot() {
                names.push(entry.name.to_string_lossy().into_owned());
            }
        }
        names.sort();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn dir_stream_seek_replays_from_cookie() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(tmp.path().join(name), b"").unwrap();
        }
        let dirfd = open_dir_path(tmp.path()).unwrap();
        let mut stream = DirStream::new(reopen_dir(dirfd.as_fd()).unwrap()).unwrap();

        let first = stream.next().unwrap().unwrap();
        let second = stream.next().unwrap().unwrap();
        stream.seek(first.next_offset);
        let replayed = stream.next().unwrap().unwrap();
        assert_eq!(replayed.name, second.name);
    }

    #[test]
    fn openat_read_refuses_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("target"), b"x").unwrap();
        std::os::unix::fs::symlink("target", tmp.path().join("link")).unwrap();

        let dirfd = open_dir_path(tmp.path()).unwrap();
        let err = openat_read(dirfd.as_fd(), OsStr::new("link")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ELOOP));
    }

    #[test]
    fn fstatat_fd_stats_the_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f"), b"hello").unwrap();
        let dirfd = open_dir_path(tmp.path()).unwrap();
        let fd = openat_path(dirfd.as_fd(), OsStr::new("f")).unwrap();
        let st = fstatat_fd(fd.as_fd()).unwrap();
        assert_eq!(st.st_size, 5);
        assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFREG);
    }
}
