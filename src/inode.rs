//! Inode records and the inode table.
//!
//! Every backing-filesystem object the guest kernel knows about is pinned
//! by an [`Inode`] record holding an `O_PATH` descriptor. The wire node-id
//! is the record's table handle, not the backing inode number: when the
//! backing filesystem recycles an inode number after an unlink, the same
//! record is revived with a bumped generation, so `(node-id, generation)`
//! never repeats for the lifetime of the server.
//!
//! Lifetime discipline: a record stays in the table while the kernel holds
//! lookups (`nlookup > 0`) or open handles (`nopen > 0`) on it, and is
//! erased when the final forget drops `nlookup` to zero.
//!
//! Lock order: record mutex before table mutex. `erase_locked` relies on
//! it (it takes the table lock with the record lock held); the insert path
//! avoids the inverse order by fully constructing records before they
//! become visible in the table.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::ll::FUSE_ROOT_ID;

/// Sentinel stored in [`InodeState::fd`] once the backing object was
/// unlinked and the descriptor closed, while forgets are still pending.
pub const FD_UNLINKED: RawFd = -libc::ENOENT;

/// Mutable part of an inode record, guarded by the record mutex.
#[derive(Debug)]
pub struct InodeState {
    /// `O_PATH` descriptor naming the backing object, or [`FD_UNLINKED`].
    pub fd: RawFd,
    /// Kernel-side lookup references.
    pub nlookup: u64,
    /// Currently open file handles against this inode.
    pub nopen: u32,
    /// Bumped whenever the backing fd is invalidated while the record
    /// stays alive; disambiguates recycled backing inode numbers.
    pub generation: u64,
    /// Set once the record has been erased from the table. A looker-up
    /// that raced with the erase must retry instead of reviving it.
    pub dead: bool,
}

impl InodeState {
    /// Whether the record still holds a usable backing descriptor.
    pub fn fd_valid(&self) -> bool {
        self.fd >= 0
    }
}

/// One backing-filesystem object known to the kernel.
#[derive(Debug)]
pub struct Inode {
    /// Wire node-id; allocated once, never reused.
    pub handle: u64,
    /// Backing filesystem inode number.
    pub src_ino: u64,
    /// Device of the source tree; guards against mountpoint descent.
    pub src_dev: u64,
    state: Mutex<InodeState>,
}

impl Inode {
    fn new(handle: u64, src_ino: u64, src_dev: u64, fd: RawFd, nlookup: u64) -> Self {
        Self {
            handle,
            src_ino,
            src_dev,
            state: Mutex::new(InodeState {
                fd,
                nlookup,
                nopen: 0,
                generation: 0,
                dead: false,
            }),
        }
    }

    /// Locks the record.
    pub fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }
}

/// Outcome of [`InodeTable::insert_or_get`].
pub enum InsertOutcome {
    /// The candidate went in; it was fully initialised before becoming
    /// visible, so no other thread can have observed a half-built record.
    Inserted(Arc<Inode>),
    /// A record for this backing inode already exists; the caller owns the
    /// candidate fd it opened and must close or adopt it under the record
    /// lock (rechecking [`InodeState::dead`]).
    Existing(Arc<Inode>),
}

struct Tables {
    by_handle: HashMap<u64, Arc<Inode>>,
    by_src: HashMap<u64, Arc<Inode>>,
    next_handle: u64,
}

/// The table mapping backing inode numbers and wire handles to records.
pub struct InodeTable {
    inner: Mutex<Tables>,
}

impl InodeTable {
    /// Builds the table with the root record pinned at handle
    /// [`FUSE_ROOT_ID`]. The root is never erased.
    pub fn new(root_fd: RawFd, root_ino: u64, root_dev: u64) -> (Self, Arc<Inode>) {
        let root = Arc::new(Inode::new(FUSE_ROOT_ID, root_ino, root_dev, root_fd, 1));
        let mut by_handle = HashMap::new();
        let mut by_src = HashMap::new();
        by_handle.insert(FUSE_ROOT_ID, Arc::clone(&root));
        by_src.insert(root_ino, Arc::clone(&root));
        let table = Self {
            inner: Mutex::new(Tables {
                by_handle,
                by_src,
                next_handle: FUSE_ROOT_ID + 1,
            }),
        };
        (table, root)
    }

    /// O(1) dereference of a wire node-id back to the record.
    pub fn get(&self, handle: u64) -> Option<Arc<Inode>> {
        self.inner.lock().by_handle.get(&handle).cloned()
    }

    /// Returns the existing record for `src_ino`, or inserts a fresh one
    /// constructed around `fd` with `nlookup == 1`.
    pub fn insert_or_get(&self, src_ino: u64, src_dev: u64, fd: RawFd) -> InsertOutcome {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.by_src.get(&src_ino) {
            return InsertOutcome::Existing(Arc::clone(existing));
        }
        let handle = inner.next_handle;
        inner.next_handle += 1;
        let inode = Arc::new(Inode::new(handle, src_ino, src_dev, fd, 1));
        inner.by_handle.insert(handle, Arc::clone(&inode));
        inner.by_src.insert(src_ino, Arc::clone(&inode));
        InsertOutcome::Inserted(inode)
    }

    /// Erases a record whose lookup count has reached zero. The caller
    /// holds the record lock (the sanctioned record-then-table order) and
    /// must have verified `nlookup == 0`. Returns the backing fd to close,
    /// if any; closing happens outside the locks.
    pub fn erase_locked(&self, inode: &Inode, state: &mut InodeState) -> Option<RawFd> {
        debug_assert_eq!(state.nlookup, 0);
        let mut inner = self.inner.lock();
        inner.by_handle.remove(&inode.handle);
        // by_src may already point at nothing for this record only if the
        // table was rebuilt; remove conditionally to stay idempotent.
        if inner
            .by_src
            .get(&inode.src_ino)
            .is_some_and(|cur| cur.handle == inode.handle)
        {
            inner.by_src.remove(&inode.src_ino);
        }
        drop(inner);
        state.dead = true;
        if state.fd_valid() {
            let fd = state.fd;
            state.fd = FD_UNLINKED;
            Some(fd)
        } else {
            None
        }
    }

    /// Number of live records (root included); used by tests and the
    /// shutdown log line.
    pub fn len(&self) -> usize {
        self.inner.lock().by_handle.len()
    }

    /// True when only the root record remains.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}
