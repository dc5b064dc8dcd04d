//! Inode cache.
//!
//! The kernel addresses filesystem objects by opaque nodeids and pairs
//! every lookup reply with an eventual forget. The cache keeps one record
//! per known object, keyed both by handle (the nodeid) and by shadow
//! inode number (for deduplication at lookup time), and tracks an
//! explicit reference count per record: kernel lookups plus in-flight
//! internal borrows. A record is destroyed exactly when its count reaches
//! zero and it is not pinned.
//!
//! Handles are allocated from a monotonic counter and never reused, so a
//! stale handle from the kernel can only miss, never alias. The `Arc`
//! around each record is a memory-safety backstop for borrows that are
//! still in flight when a record is unlinked; liveness is defined by map
//! membership, not by the `Arc` count.
//!
//! Locking: one mutex guards both indices, the handle counter, and all
//! refcount updates. It is never held across I/O. Attributes and file
//! metadata have their own per-record locks and may be read by anyone
//! holding a reference.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::ops::Deref;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use libc::c_int;
use log::{error, warn};
use parking_lot::{Mutex, RwLock};

use crate::shadow::FileMeta;
use crate::sys;

/// The well-known root nodeid of the kernel protocol.
pub const ROOT_HANDLE: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Regular,
}

/// Cached attributes, in shadow-filesystem terms. `mode` carries the full
/// `st_mode`, type bits included.
#[derive(Debug, Clone, Copy)]
pub struct InodeAttr {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl InodeAttr {
    pub fn from_stat(st: &libc::stat) -> InodeAttr {
        InodeAttr {
            ino: st.st_ino,
            mode: st.st_mode,
            nlink: st.st_nlink as u32,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev,
            size: st.st_size as u64,
            blksize: st.st_blksize as u32,
            blocks: st.st_blocks as u64,
            atime: sys::timespec_to_system_time(st.st_atime, st.st_atime_nsec),
            mtime: sys::timespec_to_system_time(st.st_mtime, st.st_mtime_nsec),
            ctime: sys::timespec_to_system_time(st.st_ctime, st.st_ctime_nsec),
        }
    }
}

#[derive(Default)]
struct FlockState {
    held: bool,
    fd: Option<OwnedFd>,
}

/// One cached filesystem object.
pub struct Inode {
    handle: u64,
    ino: u64,
    dev: u64,
    kind: FileKind,
    name: OsString,
    /// Owning back-reference: this record holds one cache reference on
    /// its parent for as long as it lives. `None` only for the root.
    parent: Option<Arc<Inode>>,
    /// `O_PATH` descriptor, present iff `kind == Directory`. Kept open
    /// for the record's life so children can always be opened relative
    /// to it.
    dir_fd: Option<OwnedFd>,
    attr: RwLock<InodeAttr>,
    /// Parsed shadow metadata; present for regular files. May be absent
    /// after a parse failure until a later lookup repairs it.
    fmeta: Mutex<Option<FileMeta>>,
    flock: Mutex<FlockState>,
    /// Mutated only under the cache mutex.
    refcount: AtomicU64,
    pinned: AtomicBool,
}

impl Inode {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Inode>> {
        self.parent.as_ref()
    }

    pub fn dir_fd(&self) -> Option<BorrowedFd<'_>> {
        self.dir_fd.as_ref().map(|fd| fd.as_fd())
    }

    /// The directory descriptor to resolve this record against: its own
    /// for directories, the parent's for regular files.
    pub fn nearest_dir_fd(&self) -> Option<BorrowedFd<'_>> {
        match self.kind {
            FileKind::Directory => self.dir_fd(),
            FileKind::Regular => self.parent.as_ref().and_then(|p| p.dir_fd()),
        }
    }

    pub fn attr(&self) -> InodeAttr {
        *self.attr.read()
    }

    pub fn set_attr(&self, attr: InodeAttr) {
        *self.attr.write() = attr;
    }

    pub fn update_attr(&self, f: impl FnOnce(&mut InodeAttr)) -> InodeAttr {
        let mut guard = self.attr.write();
        f(&mut guard);
        *guard
    }

    pub fn fmeta(&self) -> Option<FileMeta> {
        self.fmeta.lock().clone()
    }

    pub fn has_fmeta(&self) -> bool {
        self.fmeta.lock().is_some()
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    /// Forbid destruction at refcount zero. Set by setattr so locally
    /// overridden attributes stay authoritative for the life of the
    /// mount. Never cleared.
    pub fn pin(&self) {
        self.pinned.store(true, Ordering::SeqCst);
    }

    pub fn flock_held(&self) -> bool {
        self.flock.lock().held
    }

    /// Take the exclusive advisory lock on behalf of the kernel client.
    /// Fails with `EINVAL` if this record already holds it.
    pub fn flock_exclusive(&self) -> Result<(), c_int> {
        let mut state = self.flock.lock();
        if state.held {
            return Err(libc::EINVAL);
        }
        let dirfd = self.nearest_dir_fd().ok_or(libc::EINVAL)?;
        // flock refuses O_PATH descriptors; take a real one for the lock's
        // lifetime.
        let fd = sys::reopen_dir(dirfd).map_err(io_errno)?;
        sys::flock(fd.as_fd(), libc::LOCK_EX).map_err(io_errno)?;
        state.held = true;
        state.fd = Some(fd);
        Ok(())
    }

    pub fn flock_unlock(&self) -> Result<(), c_int> {
        let mut state = self.flock.lock();
        if !state.held {
            return Err(libc::EINVAL);
        }
        state.held = false;
        if let Some(fd) = state.fd.take() {
            let _ = sys::flock(fd.as_fd(), libc::LOCK_UN);
        }
        Ok(())
    }

    /// Drop the advisory lock if held; used on release.
    pub fn flock_release_if_held(&self) -> bool {
        let mut state = self.flock.lock();
        if !state.held {
            return false;
        }
        state.held = false;
        if let Some(fd) = state.fd.take() {
            let _ = sys::flock(fd.as_fd(), libc::LOCK_UN);
        }
        true
    }
}

fn io_errno(err: io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// A counted borrow of a cached record. Dropping it debits one reference;
/// [`InodeRef::leak`] keeps the reference counted past the borrow (used
/// for the reference an `open` hands to `release`).
pub struct InodeRef<'a> {
    cache: &'a Icache,
    inode: Arc<Inode>,
    debt: u64,
}

impl InodeRef<'_> {
    pub fn inode_arc(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Consume without debiting: the reference stays counted until a
    /// matching explicit put (release or forget).
    pub fn leak(mut self) {
        self.debt = 0;
    }
}

impl Deref for InodeRef<'_> {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.inode
    }
}

impl Drop for InodeRef<'_> {
    fn drop(&mut self) {
        if self.debt > 0 {
            self.cache.put(&self.inode, self.debt);
        }
    }
}

struct CacheInner {
    by_handle: HashMap<u64, Arc<Inode>>,
    by_ino: HashMap<(u64, u64), u64>,
    next_handle: u64,
}

pub struct Icache {
    inner: Mutex<CacheInner>,
    root: Arc<Inode>,
}

impl Icache {
    /// Open the shadow-tree root and seed the cache with it. The root
    /// holds one base reference and is never forgotten by the kernel.
    pub fn new(shadow_root: &Path) -> io::Result<Icache> {
        let fd = sys::open_dir_path(shadow_root)?;
        let st = sys::fstatat_fd(fd.as_fd())?;
        let root = Arc::new(Inode {
            handle: ROOT_HANDLE,
            ino: st.st_ino,
            dev: st.st_dev,
            kind: FileKind::Directory,
            name: OsString::from("/"),
            parent: None,
            dir_fd: Some(fd),
            attr: RwLock::new(InodeAttr::from_stat(&st)),
            fmeta: Mutex::new(None),
            flock: Mutex::new(FlockState::default()),
            refcount: AtomicU64::new(1),
            pinned: AtomicBool::new(false),
        });

        let mut by_handle = HashMap::new();
        by_handle.insert(ROOT_HANDLE, root.clone());
        let mut by_ino = HashMap::new();
        by_ino.insert((root.dev, root.ino), ROOT_HANDLE);

        Ok(Icache {
            inner: Mutex::new(CacheInner {
                by_handle,
                by_ino,
                next_handle: ROOT_HANDLE + 1,
            }),
            root,
        })
    }

    pub fn root(&self) -> &Arc<Inode> {
        &self.root
    }

    /// Number of live records, root included.
    pub fn len(&self) -> usize {
        self.inner.lock().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a nodeid from the kernel. A miss means the kernel and the
    /// cache disagree about a handle's lifetime, which callers must treat
    /// as a protocol error.
    pub fn get_from_handle(&self, handle: u64) -> Option<InodeRef<'_>> {
        let inner = self.inner.lock();
        let inode = inner.by_handle.get(&handle)?.clone();
        inode.refcount.fetch_add(1, Ordering::SeqCst);
        drop(inner);
        Some(InodeRef {
            cache: self,
            inode,
            debt: 1,
        })
    }

    /// Locate a record by shadow (dev, ino). Lookup-time deduplication
    /// only.
    pub fn find_by_ino(&self, dev: u64, ino: u64) -> Option<InodeRef<'_>> {
        let inner = self.inner.lock();
        let handle = *inner.by_ino.get(&(dev, ino))?;
        let inode = inner.by_handle.get(&handle)?.clone();
        inode.refcount.fetch_add(1, Ordering::SeqCst);
        drop(inner);
        Some(InodeRef {
            cache: self,
            inode,
            debt: 1,
        })
    }

    /// The lookup tail: under one lock hold, either reuse the record that
    /// already covers (dev, ino) or insert a new one built from the
    /// resources the caller prepared. Returns the borrow plus whether an
    /// existing record was reused.
    ///
    /// Counting: the returned borrow carries one transient reference, and
    /// one more is taken for the kernel's lookup reference (settled by a
    /// later forget). A new record therefore starts at refcount 2, and a
    /// reused one is bumped by 2.
    ///
    /// On reuse the caller's freshly opened descriptor is discarded; its
    /// parsed metadata repairs the record only if an earlier parse
    /// failure left the record without any.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_or_reuse(
        &self,
        parent: &Arc<Inode>,
        name: &OsStr,
        ino: u64,
        dev: u64,
        kind: FileKind,
        attr: InodeAttr,
        fmeta: Option<FileMeta>,
        dir_fd: Option<OwnedFd>,
    ) -> (InodeRef<'_>, bool) {
        let mut inner = self.inner.lock();
        if let Some(&handle) = inner.by_ino.get(&(dev, ino)) {
            if let Some(existing) = inner.by_handle.get(&handle).cloned() {
                existing.refcount.fetch_add(2, Ordering::SeqCst);
                drop(inner);
                drop(dir_fd);
                if existing.kind == FileKind::Regular {
                    if let Some(fresh) = fmeta {
                        let mut slot = existing.fmeta.lock();
                        if slot.is_none() {
                            warn!(
                                "repairing missing file metadata for ino={} name={:?}",
                                ino, name
                            );
                            *slot = Some(fresh);
                        }
                    }
                }
                return (
                    InodeRef {
                        cache: self,
                        inode: existing,
                        debt: 1,
                    },
                    true,
                );
            }
        }

        let handle = inner.next_handle;
        inner.next_handle += 1;
        let inode = Arc::new(Inode {
            handle,
            ino,
            dev,
            kind,
            name: name.to_os_string(),
            parent: Some(parent.clone()),
            dir_fd,
            attr: RwLock::new(attr),
            fmeta: Mutex::new(fmeta),
            flock: Mutex::new(FlockState::default()),
            refcount: AtomicU64::new(2),
            pinned: AtomicBool::new(false),
        });
        parent.refcount.fetch_add(1, Ordering::SeqCst);
        inner.by_handle.insert(handle, inode.clone());
        inner.by_ino.insert((dev, ino), handle);
        drop(inner);
        (
            InodeRef {
                cache: self,
                inode,
                debt: 1,
            },
            false,
        )
    }

    /// Debit `n` references. At zero and unpinned the record is unlinked
    /// and one reference cascades to its parent, iteratively, within the
    /// same lock hold. Resource teardown (descriptors, metadata) happens
    /// after the lock is released.
    pub fn put(&self, inode: &Arc<Inode>, n: u64) {
        let mut unlinked: Vec<Arc<Inode>> = Vec::new();
        let mut inner = self.inner.lock();
        let mut cur = inode.clone();
        let mut n = n;
        loop {
            let rc = cur.refcount.load(Ordering::SeqCst);
            if n > rc {
                error!(
                    "refcount underflow on handle {} (have {}, dropping {})",
                    cur.handle, rc, n
                );
                n = rc;
            }
            let newrc = rc - n;
            cur.refcount.store(newrc, Ordering::SeqCst);
            if newrc == 0
                && !cur.pinned.load(Ordering::SeqCst)
                && inner.by_handle.remove(&cur.handle).is_some()
            {
                inner.by_ino.remove(&(cur.dev, cur.ino));
                unlinked.push(cur.clone());
                if let Some(parent) = cur.parent.clone() {
                    cur = parent;
                    n = 1;
                    continue;
                }
            }
            break;
        }
        drop(inner);
        drop(unlinked);
    }

    /// Settle `nlookup` kernel references for `handle`. The internal
    /// borrow taken to locate the record is settled in the same debit.
    pub fn forget(&self, handle: u64, nlookup: u64) {
        match self.get_from_handle(handle) {
            Some(entry) => {
                let inode = entry.inode_arc().clone();
                entry.leak();
                self.put(&inode, nlookup + 1);
            }
            None => warn!("forget for unknown handle {handle:#x}"),
        }
    }

    /// Drain the cache at shutdown. Only safe once no request can reach
    /// the cache anymore.
    pub fn destroy_all(&self) {
        let mut inner = self.inner.lock();
        inner.by_handle.clear();
        inner.by_ino.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::UNIX_EPOCH;

    fn test_attr(ino: u64) -> InodeAttr {
        InodeAttr {
            ino,
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blksize: 4096,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
        }
    }

    fn test_cache() -> (tempfile::TempDir, Icache) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Icache::new(tmp.path()).unwrap();
        (tmp, cache)
    }

    fn insert_file<'a>(cache: &'a Icache, name: &str, ino: u64) -> InodeRef<'a> {
        let root = cache.root().clone();
        let (entry, _) = cache.insert_or_reuse(
            &root,
            OsStr::new(name),
            ino,
            7,
            FileKind::Regular,
            test_attr(ino),
            None,
            None,
        );
        entry
    }

    #[test]
    fn root_is_seeded() {
        let (_tmp, cache) = test_cache();
        assert_eq!(cache.len(), 1);
        let root = cache.get_from_handle(ROOT_HANDLE).unwrap();
        assert_eq!(root.kind(), FileKind::Directory);
        assert!(root.dir_fd().is_some());
    }

    #[test]
    fn lookup_then_forget_destroys() {
        let (_tmp, cache) = test_cache();
        let handle = {
            let entry = insert_file(&cache, "f", 100);
            assert_eq!(entry.refcount(), 2);
            entry.handle()
        };
        // transient borrow settled; the kernel reference remains
        {
            let entry = cache.get_from_handle(handle).unwrap();
            assert_eq!(entry.refcount(), 2);
        }
        cache.forget(handle, 1);
        assert!(cache.get_from_handle(handle).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn dedup_by_ino_reuses_record() {
        let (_tmp, cache) = test_cache();
        let first = insert_file(&cache, "f", 100);
        let h = first.handle();
        drop(first);

        let second = insert_file(&cache, "f", 100);
        assert_eq!(second.handle(), h);
        // two kernel refs + one live borrow
        assert_eq!(second.refcount(), 3);
        drop(second);

        cache.forget(h, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn destruction_cascades_to_parent() {
        let (_tmp, cache) = test_cache();
        let root_rc_before = cache.root().refcount();
        let handle = {
            let entry = insert_file(&cache, "f", 100);
            entry.handle()
        };
        assert_eq!(cache.root().refcount(), root_rc_before + 1);
        cache.forget(handle, 1);
        assert_eq!(cache.root().refcount(), root_rc_before);
    }

    #[test]
    fn pinned_record_survives_zero_refcount() {
        let (_tmp, cache) = test_cache();
        let handle = {
            let entry = insert_file(&cache, "f", 100);
            entry.update_attr(|a| a.mode = libc::S_IFREG | 0o600);
            entry.pin();
            entry.handle()
        };
        cache.forget(handle, 1);
        // still resolvable, attributes intact
        let entry = cache.get_from_handle(handle).unwrap();
        assert_eq!(entry.refcount(), 1);
        assert_eq!(entry.attr().mode & 0o777, 0o600);
        drop(entry);

        // a relookup by ino revives the same record
        let revived = cache.find_by_ino(7, 100).unwrap();
        assert_eq!(revived.handle(), handle);
    }

    #[test]
    fn leak_keeps_reference_counted() {
        let (_tmp, cache) = test_cache();
        let handle = {
            let entry = insert_file(&cache, "f", 100);
            entry.handle()
        };
        let entry = cache.get_from_handle(handle).unwrap();
        let arc = entry.inode_arc().clone();
        entry.leak();
        assert_eq!(arc.refcount.load(Ordering::SeqCst), 2);
        // the leaked reference plus the kernel one
        cache.put(&arc, 1);
        cache.forget(handle, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stale_fmeta_is_repaired_on_reuse() {
        let (_tmp, cache) = test_cache();
        let first = insert_file(&cache, "f", 100);
        assert!(!first.has_fmeta());
        let h = first.handle();
        drop(first);

        let fresh = FileMeta {
            size: 4096,
            flags: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            extents: smallvec::smallvec![crate::shadow::Extent {
                offset: 0,
                length: 4096
            }],
        };
        let root = cache.root().clone();
        let (entry, reused) = cache.insert_or_reuse(
            &root,
            OsStr::new("f"),
            100,
            7,
            FileKind::Regular,
            test_attr(100),
            Some(fresh.clone()),
            None,
        );
        assert!(reused);
        assert_eq!(entry.fmeta().as_ref(), Some(&fresh));
        drop(entry);
        cache.forget(h, 2);
    }

    #[test]
    fn concurrent_lookups_create_one_record() {
        let (_tmp, cache) = test_cache();
        let cache = Arc::new(cache);
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<u64> = std::thread::scope(|scope| {
            let joins: Vec<_> = (0..threads)
                .map(|_| {
                    let cache = &cache;
                    let barrier = barrier.clone();
                    scope.spawn(move || {
                        barrier.wait();
                        let root = cache.root().clone();
                        let (entry, _) = cache.insert_or_reuse(
                            &root,
                            OsStr::new("f"),
                            42,
                            7,
                            FileKind::Regular,
                            test_attr(42),
                            None,
                            None,
                        );
                        entry.handle()
                    })
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });

        assert!(handles.windows(2).all(|w| w[0] == w[1]));
        // root + the single deduplicated record
        assert_eq!(cache.len(), 2);
        let entry = cache.get_from_handle(handles[0]).unwrap();
        // one kernel reference per lookup, plus this borrow
        assert_eq!(entry.refcount(), threads as u64 + 1);
        drop(entry);
        cache.forget(handles[0], threads as u64);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn refcount_underflow_is_clamped() {
        let (_tmp, cache) = test_cache();
        let handle = {
            let entry = insert_file(&cache, "f", 100);
            entry.handle()
        };
        // over-forget: record destroyed once, no panic, no double free
        cache.forget(handle, 99);
        assert!(cache.get_from_handle(handle).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn destroy_all_drains() {
        let (_tmp, cache) = test_cache();
        for i in 0..10 {
            let entry = insert_file(&cache, &format!("f{i}"), 100 + i);
            entry.leak();
        }
        assert_eq!(cache.len(), 11);
        cache.destroy_all();
        assert!(cache.is_empty());
    }
}
