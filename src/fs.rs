//! Request dispatcher.
//!
//! Each protocol operation resolves its nodeid inputs through the inode
//! cache (taking a reference), performs any shadow-tree I/O, replies, and
//! releases the reference. The daemon never serves file data: the kernel
//! client maps contents straight from the DAX device using the fmap it
//! fetches once per file.
//!
//! The `fuser` callbacks are thin shims over `do_*` methods returning
//! `Result<_, errno>`, which is what the tests drive.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::unix::io::AsFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    consts, FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyLseek, ReplyOpen, ReplyStatfs,
    ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::daxdev::{DaxDevError, DaxDevReply, DaxDevTable};
use crate::fmap::{self, FmapFileKind, FMAP_MSG_MAX};
use crate::icache::{FileKind, Icache, InodeAttr, ROOT_HANDLE};
use crate::opts::{CachePolicy, MountOpts};
use crate::shadow::{self, SHADOW_DOC_MAX};
use crate::sys::{self, DirStream};
use zerocopy::IntoBytes;

/// Slack past [`SHADOW_DOC_MAX`] so an oversized document is detected
/// rather than silently truncated.
const SHADOW_READ_SLACK: usize = 64;

const fn ioc(dir: u32, group: u8, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((group as u32) << 8) | nr
}

const IOC_READ: u32 = 2;
const IOC_WRITE: u32 = 1;

/// Fetch the fmap for the addressed file: 4096-byte out buffer.
pub const IOC_GET_FMAP: u32 = ioc(IOC_READ, b's', 1, FMAP_MSG_MAX);

/// Fetch metadata for a DAX backing device: u32 index in, fixed record out.
pub const IOC_GET_DAXDEV: u32 = ioc(
    IOC_READ | IOC_WRITE,
    b's',
    2,
    std::mem::size_of::<DaxDevReply>(),
);

fn io_errno(err: io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn filetype_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn filetype_from_dtype(dtype: u8) -> FileType {
    match dtype {
        libc::DT_DIR => FileType::Directory,
        libc::DT_LNK => FileType::Symlink,
        libc::DT_CHR => FileType::CharDevice,
        libc::DT_BLK => FileType::BlockDevice,
        libc::DT_FIFO => FileType::NamedPipe,
        libc::DT_SOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// The nodeid doubles as the kernel-visible inode number; the shadow
/// inode number stays internal to the cache.
fn attr_to_fuse(attr: &InodeAttr, handle: u64) -> FileAttr {
    FileAttr {
        ino: handle,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: UNIX_EPOCH,
        kind: filetype_from_mode(attr.mode),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev as u32,
        blksize: attr.blksize,
        flags: 0,
    }
}

/// Requested attribute changes, in protocol terms.
#[derive(Debug, Default)]
pub struct SetattrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
}

/// Lock operations accepted on the advisory-lock path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlockOp {
    Exclusive,
    Shared,
    Unlock,
}

/// One plus-mode directory entry: the raw dirent plus, for non-dot
/// entries, the looked-up handle and attributes.
#[derive(Debug)]
pub struct PlusEntry {
    pub dirent: sys::DirEntry,
    pub looked_up: Option<(u64, InodeAttr)>,
}

pub struct ShadowFs {
    opts: MountOpts,
    timeout: Duration,
    icache: Icache,
    daxdevs: DaxDevTable,
    dir_streams: Mutex<HashMap<u64, DirStream>>,
    next_fh: AtomicU64,
}

impl ShadowFs {
    pub fn new(opts: MountOpts) -> io::Result<ShadowFs> {
        let source = opts
            .source
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no shadow tree path"))?;
        let icache = Icache::new(&source)?;
        let daxdevs = DaxDevTable::new(opts.daxdev.as_deref());
        let timeout = opts.timeout_duration();
        Ok(ShadowFs {
            opts,
            timeout,
            icache,
            daxdevs,
            dir_streams: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        })
    }

    pub fn icache(&self) -> &Icache {
        &self.icache
    }

    pub fn daxdevs(&self) -> &DaxDevTable {
        &self.daxdevs
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve a nodeid from the kernel. A miss means the kernel still
    /// holds a handle the cache does not: a protocol-level inconsistency,
    /// logged and answered with EINVAL.
    fn entry(&self, handle: u64, op: &'static str) -> Result<crate::icache::InodeRef<'_>, c_int> {
        self.icache.get_from_handle(handle).ok_or_else(|| {
            error!("{op}: unknown nodeid {handle:#x}");
            libc::EINVAL
        })
    }

    /// The lookup pipeline: open the leaf relative to the parent, stat
    /// it, parse the shadow document for regular files, then dedup or
    /// insert in the cache. Returns the entry's handle and (possibly
    /// cached, possibly pinned) attributes; the kernel's lookup reference
    /// remains counted.
    pub fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<(u64, InodeAttr), c_int> {
        let parent = self.entry(parent, "lookup")?;
        let parent_fd = parent.dir_fd().ok_or(libc::ENOTDIR)?;

        let path_fd = sys::openat_path(parent_fd, name).map_err(|err| {
            let errno = io_errno(err);
            if errno != libc::ENOENT {
                error!("lookup: open of {name:?} failed: errno {errno}");
            }
            errno
        })?;
        let st = sys::fstatat_fd(path_fd.as_fd()).map_err(io_errno)?;

        let (kind, attr, fmeta, dir_fd) = match st.st_mode & libc::S_IFMT {
            libc::S_IFDIR => (
                FileKind::Directory,
                InodeAttr::from_stat(&st),
                None,
                Some(path_fd),
            ),
            libc::S_IFREG => {
                // Reopen without O_PATH to reach the document. Regular
                // files are not kept open; only directories are.
                drop(path_fd);
                let read_fd = sys::openat_read(parent_fd, name).map_err(io_errno)?;
                let buf = sys::pread_at(read_fd.as_fd(), 0, SHADOW_DOC_MAX + SHADOW_READ_SLACK)
                    .map_err(io_errno)?;
                drop(read_fd);

                if self.opts.pass_yaml {
                    // Diagnostic mode: export the document itself.
                    (FileKind::Regular, InodeAttr::from_stat(&st), None, None)
                } else {
                    let meta = shadow::parse_shadow_doc(&buf).map_err(|err| {
                        error!("lookup: bad shadow document for {name:?}: {err}");
                        libc::EIO
                    })?;
                    let mut attr = InodeAttr::from_stat(&st);
                    attr.mode = libc::S_IFREG | (meta.mode & !libc::S_IFMT);
                    attr.uid = meta.uid;
                    attr.gid = meta.gid;
                    attr.size = meta.size;
                    (FileKind::Regular, attr, Some(meta), None)
                }
            }
            _ => {
                debug!("lookup: {name:?} is neither file nor directory");
                return Err(libc::ENOENT);
            }
        };

        let (entry, reused) = self.icache.insert_or_reuse(
            parent.inode_arc(),
            name,
            st.st_ino,
            st.st_dev,
            kind,
            attr,
            fmeta,
            dir_fd,
        );
        debug!(
            "lookup: {:?} -> handle {:#x} ({}, refcount {})",
            name,
            entry.handle(),
            if reused { "cached" } else { "new" },
            entry.refcount(),
        );
        Ok((entry.handle(), entry.attr()))
    }

    pub fn do_forget(&self, handle: u64, nlookup: u64) {
        self.icache.forget(handle, nlookup);
    }

    pub fn do_getattr(&self, handle: u64) -> Result<InodeAttr, c_int> {
        let entry = self.entry(handle, "getattr")?;
        // The root is never looked up, so its attributes are refreshed
        // here instead; a setattr override still wins.
        if handle == ROOT_HANDLE && !entry.is_pinned() {
            let fd = entry.dir_fd().ok_or(libc::EIO)?;
            let st = sys::fstatat_fd(fd).map_err(io_errno)?;
            entry.set_attr(InodeAttr::from_stat(&st));
        }
        Ok(entry.attr())
    }

    /// Apply mode/uid/gid/mtime changes to the cached attributes and pin
    /// the entry so the overrides outlive any forget. Size changes are
    /// refused: the shadow tree is the sole write path.
    pub fn do_setattr(&self, handle: u64, req: SetattrRequest) -> Result<InodeAttr, c_int> {
        let entry = self.entry(handle, "setattr")?;
        if req.size.is_some() {
            error!("setattr: truncate not supported");
            return Err(libc::EINVAL);
        }
        let now = SystemTime::now();
        let resolve = |t: TimeOrNow| match t {
            TimeOrNow::SpecificTime(t) => t,
            TimeOrNow::Now => now,
        };
        let new_atime = req.atime.map(&resolve);
        let new_mtime = req.mtime.map(&resolve);
        let updated = entry.update_attr(|attr| {
            if let Some(mode) = req.mode {
                attr.mode = (attr.mode & libc::S_IFMT) | (mode & !libc::S_IFMT);
            }
            if let Some(uid) = req.uid {
                attr.uid = uid;
            }
            if let Some(gid) = req.gid {
                attr.gid = gid;
            }
            if let Some(atime) = new_atime {
                attr.atime = atime;
            }
            if let Some(mtime) = new_mtime {
                attr.mtime = mtime;
            }
        });
        entry.pin();
        Ok(updated)
    }

    /// Take the open-time reference (settled by release) and pick the
    /// kernel caching flags for this open.
    pub fn do_open(&self, handle: u64) -> Result<u32, c_int> {
        let entry = self.entry(handle, "open")?;
        let flags = match self.opts.cache {
            CachePolicy::Never => consts::FOPEN_DIRECT_IO,
            CachePolicy::Auto => 0,
            CachePolicy::Always => consts::FOPEN_KEEP_CACHE,
        };
        entry.leak();
        Ok(flags)
    }

    /// Settle one open: drop the advisory lock if this entry holds it,
    /// then the open-time reference.
    pub fn do_release(&self, handle: u64) {
        let Some(entry) = self.icache.get_from_handle(handle) else {
            warn!("release for unknown handle {handle:#x}");
            return;
        };
        if entry.flock_release_if_held() {
            info!("release: dropped advisory lock on {:?}", entry.name());
        }
        let inode = entry.inode_arc().clone();
        entry.leak();
        // the borrow just taken plus the open-time reference
        self.icache.put(&inode, 2);
    }

    pub fn do_flock(&self, handle: u64, op: FlockOp) -> Result<(), c_int> {
        let entry = self.entry(handle, "flock")?;
        if !self.opts.flock {
            return Err(libc::ENOTSUP);
        }
        match op {
            FlockOp::Exclusive => entry.flock_exclusive(),
            FlockOp::Unlock => entry.flock_unlock(),
            FlockOp::Shared => {
                error!("flock: shared locks not supported");
                Err(libc::EINVAL)
            }
        }
    }

    /// Duplicate the directory into a seekable stream for one
    /// opendir..releasedir window.
    pub fn do_opendir(&self, handle: u64) -> Result<(u64, u32), c_int> {
        let entry = self.entry(handle, "opendir")?;
        let dirfd = entry.dir_fd().ok_or(libc::ENOTDIR)?;
        let read_fd = sys::reopen_dir(dirfd).map_err(io_errno)?;
        let stream = DirStream::new(read_fd).map_err(io_errno)?;

        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.dir_streams.lock().insert(fh, stream);
        let flags = if self.opts.cache == CachePolicy::Always {
            consts::FOPEN_CACHE_DIR
        } else {
            0
        };
        Ok((fh, flags))
    }

    pub fn do_releasedir(&self, fh: u64) {
        self.dir_streams.lock().remove(&fh);
    }

    pub fn do_fsyncdir(&self, fh: u64, datasync: bool) -> Result<(), c_int> {
        self.with_dir_stream(fh, |stream| {
            sys::fsync_fd(stream.raw_fd(), datasync).map_err(io_errno)
        })
    }

    pub fn do_statfs(&self, handle: u64) -> Result<libc::statvfs, c_int> {
        let entry = self.entry(handle, "statfs")?;
        let fd = entry.nearest_dir_fd().ok_or(libc::EIO)?;
        sys::fstatvfs(fd).map_err(io_errno)
    }

    /// Serialize the entry's file metadata into a full-size fmap reply
    /// buffer. The reply length is pinned to the buffer size; older
    /// kernel clients cannot handle a short reply.
    pub fn do_get_fmap(&self, handle: u64) -> Result<Vec<u8>, c_int> {
        let entry = self.entry(handle, "get_fmap")?;
        let Some(meta) = entry.fmeta() else {
            error!("get_fmap: no fmap on {:?}", entry.name());
            return Err(libc::ENOENT);
        };
        let mut buf = vec![0u8; FMAP_MSG_MAX];
        fmap::encode_fmap(&mut buf, FmapFileKind::Regular, &meta).map_err(|err| {
            error!("get_fmap: {err}");
            libc::EINVAL
        })?;
        Ok(buf)
    }

    pub fn do_get_daxdev(&self, index: u32) -> Result<DaxDevReply, c_int> {
        info!("get_daxdev: index={index}");
        self.daxdevs.reply(index).map_err(|err| match err {
            DaxDevError::BadIndex => {
                error!("get_daxdev: non-zero device index {index}");
                libc::EINVAL
            }
            DaxDevError::NotConfigured => {
                error!("get_daxdev: dax not enabled");
                libc::EOPNOTSUPP
            }
        })
    }

    /// Data reads never reach the daemon for fmap-mapped files; this
    /// only returns content in `pass_yaml` mode, where the raw shadow
    /// documents are the exported files.
    pub fn do_read(&self, handle: u64, offset: i64, size: u32) -> Result<Vec<u8>, c_int> {
        let entry = self.entry(handle, "read")?;
        if !self.opts.pass_yaml {
            return Ok(Vec::new());
        }
        if entry.kind() != FileKind::Regular {
            return Err(libc::EISDIR);
        }
        let parent_fd = entry.nearest_dir_fd().ok_or(libc::EIO)?;
        let fd = sys::openat_read(parent_fd, entry.name()).map_err(io_errno)?;
        sys::pread_at(fd.as_fd(), offset, size as usize).map_err(io_errno)
    }

    fn with_dir_stream<T>(
        &self,
        fh: u64,
        f: impl FnOnce(&mut DirStream) -> Result<T, c_int>,
    ) -> Result<T, c_int> {
        let mut streams = self.dir_streams.lock();
        let stream = streams.get_mut(&fh).ok_or(libc::EBADF)?;
        f(stream)
    }

    /// Walk the directory stream from `offset`, handing each raw entry
    /// to `emit` until end of stream or until `emit` reports that the
    /// reply buffer is full.
    pub fn stream_dir(
        &self,
        fh: u64,
        offset: i64,
        emit: &mut dyn FnMut(&sys::DirEntry) -> bool,
    ) -> Result<(), c_int> {
        self.with_dir_stream(fh, |stream| {
            if offset != stream.offset() {
                stream.seek(offset);
            }
            loop {
                let entry = match stream.next() {
                    Ok(Some(entry)) => entry,
                    Ok(None) => return Ok(()),
                    Err(err) => return Err(io_errno(err)),
                };
                if emit(&entry) {
                    return Ok(());
                }
            }
        })
    }

    /// Plus-mode walk: every non-dot entry gets a full lookup, whose
    /// reference the kernel settles with a later forget. An entry the
    /// receiver cannot take is forgotten immediately so its reference
    /// does not linger.
    pub fn stream_dirplus(
        &self,
        dir_handle: u64,
        fh: u64,
        offset: i64,
        emit: &mut dyn FnMut(&PlusEntry) -> bool,
    ) -> Result<(), c_int> {
        let mut streams = self.dir_streams.lock();
        let stream = streams.get_mut(&fh).ok_or(libc::EBADF)?;
        if offset != stream.offset() {
            stream.seek(offset);
        }
        loop {
            let dirent = match stream.next() {
                Ok(Some(entry)) => entry,
                Ok(None) => return Ok(()),
                Err(err) => return Err(io_errno(err)),
            };
            let looked_up = if dirent.is_dot() {
                None
            } else {
                Some(self.do_lookup(dir_handle, &dirent.name)?)
            };
            let entry = PlusEntry { dirent, looked_up };
            if emit(&entry) {
                if let Some((handle, _)) = entry.looked_up {
                    self.icache.forget(handle, 1);
                }
                return Ok(());
            }
        }
    }

    /// Minimal attributes for `.` and `..` entries in plus-mode: no
    /// lookup is performed and no reference is taken for them.
    fn dot_attr(entry: &sys::DirEntry) -> FileAttr {
        FileAttr {
            ino: entry.ino,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: filetype_from_dtype(entry.dtype),
            perm: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for ShadowFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        if self.opts.writeback {
            match config.add_capabilities(consts::FUSE_WRITEBACK_CACHE) {
                Ok(()) => debug!("init: activating writeback cache"),
                Err(_) => warn!("init: kernel does not support writeback cache"),
            }
        }
        if self.opts.flock {
            match config.add_capabilities(consts::FUSE_FLOCK_LOCKS) {
                Ok(()) => debug!("init: activating advisory locks"),
                Err(_) => warn!("init: kernel does not support advisory locks"),
            }
        }
        if self.opts.readdirplus {
            match config.add_capabilities(consts::FUSE_DO_READDIRPLUS) {
                Ok(()) => debug!("init: activating readdirplus"),
                Err(_) => warn!("init: kernel does not support readdirplus"),
            }
        }
        if self.daxdevs.is_configured() {
            info!(
                "init: DAX mappings backed by {}",
                self.daxdevs.primary().unwrap_or("?")
            );
        } else {
            info!("init: no DAX device configured");
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.dir_streams.lock().clear();
        self.icache.destroy_all();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.do_lookup(parent, name) {
            Ok((handle, attr)) => reply.entry(&self.timeout, &attr_to_fuse(&attr, handle), 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.do_forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&self.timeout, &attr_to_fuse(&attr, ino)),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetattrRequest {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
        };
        match self.do_setattr(ino, changes) {
            Ok(attr) => reply.attr(&self.timeout, &attr_to_fuse(&attr, ino)),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyData) {
        reply.error(libc::ENOTSUP);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EOPNOTSUPP);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.do_open(ino) {
            // No file handle needed: data access goes through the fmap.
            Ok(flags) => reply.opened(0, flags),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.do_read(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        // Vestigial: no write path exists in userspace.
        debug!("write: nodeid={ino:#x} len={} (ignored)", data.len());
        reply.written(data.len() as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
        self.do_release(ino);
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.do_opendir(ino) {
            Ok((fh, flags)) => reply.opened(fh, flags),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir: nodeid={ino:#x} fh={fh} offset={offset}");
        let mut added = false;
        let res = self.stream_dir(fh, offset, &mut |entry| {
            let full = reply.add(
                entry.ino,
                entry.next_offset,
                filetype_from_dtype(entry.dtype),
                &entry.name,
            );
            if !full {
                added = true;
            }
            full
        });
        match res {
            Ok(()) => reply.ok(),
            // Entries already packed: a partial reply keeps the kernel's
            // bookkeeping correct, the error would lose it.
            Err(_) if added => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        debug!("readdirplus: nodeid={ino:#x} fh={fh} offset={offset}");
        let timeout = self.timeout;
        let mut added = false;
        let res = self.stream_dirplus(ino, fh, offset, &mut |entry| {
            let full = match &entry.looked_up {
                Some((handle, attr)) => reply.add(
                    *handle,
                    entry.dirent.next_offset,
                    &entry.dirent.name,
                    &timeout,
                    &attr_to_fuse(attr, *handle),
                    0,
                ),
                None => reply.add(
                    entry.dirent.ino,
                    entry.dirent.next_offset,
                    &entry.dirent.name,
                    &Duration::ZERO,
                    &Self::dot_attr(&entry.dirent),
                    0,
                ),
            };
            if !full {
                added = true;
            }
            full
        });
        match res {
            Ok(()) => reply.ok(),
            Err(_) if added => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.do_releasedir(fh);
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.do_fsyncdir(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.do_statfs(ino) {
            Ok(st) => reply.statfs(
                st.f_blocks,
                st.f_bfree,
                st.f_bavail,
                st.f_files,
                st.f_ffree,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        typ: i32,
        _pid: u32,
        _sleep: bool,
        reply: ReplyEmpty,
    ) {
        let op = match typ {
            libc::F_WRLCK => FlockOp::Exclusive,
            libc::F_RDLCK => FlockOp::Shared,
            libc::F_UNLCK => FlockOp::Unlock,
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        match self.do_flock(ino, op) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn ioctl(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: u32,
        cmd: u32,
        in_data: &[u8],
        _out_size: u32,
        reply: ReplyIoctl,
    ) {
        match cmd {
            IOC_GET_FMAP => match self.do_get_fmap(ino) {
                Ok(buf) => reply.ioctl(0, &buf),
                Err(errno) => reply.error(errno),
            },
            IOC_GET_DAXDEV => {
                if in_data.len() < 4 {
                    reply.error(libc::EINVAL);
                    return;
                }
                let index = u32::from_le_bytes([in_data[0], in_data[1], in_data[2], in_data[3]]);
                match self.do_get_daxdev(index) {
                    Ok(record) => reply.ioctl(0, record.as_bytes()),
                    Err(errno) => reply.error(errno),
                }
            }
            _ => reply.error(libc::ENOTTY),
        }
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        // No descriptor exists; resolve against the cached size.
        let size = match self.do_getattr(ino) {
            Ok(attr) => attr.size as i64,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match whence {
            libc::SEEK_SET | libc::SEEK_CUR => reply.offset(offset),
            libc::SEEK_END => reply.offset(size.saturating_add(offset)),
            libc::SEEK_DATA => {
                if offset < size {
                    reply.offset(offset)
                } else {
                    reply.error(libc::ENXIO)
                }
            }
            libc::SEEK_HOLE => reply.offset(size),
            _ => reply.error(libc::EINVAL),
        }
    }
}
