//! Operation dispatch: one handler per FUSE opcode.
//!
//! [`MirrorFs::dispatch`] is the single entry point the HAL calls with raw
//! request bytes. Metadata and name operations run their backing syscalls
//! inline and return a finished reply; read and write hand their transfer
//! to the [`AioEngine`] and return pending. Every handler works against an
//! inode's `O_PATH` descriptor; data access reopens the object through
//! `/proc/self/fd/<n>`, which keeps identity stable across renames of any
//! ancestor.

use std::ffi::{CString, OsStr};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use slab::Slab;

use crate::aio::AioEngine;
use crate::config::LocalMirror;
use crate::dir::DirStream;
use crate::hal::{Completion, DeviceId, Dispatch, RequestCtx};
use crate::inode::{Inode, InodeTable, InsertOutcome, FD_UNLINKED};
use crate::ll::fuse_abi::{self as abi, consts};
use crate::ll::reply::{DirEntList, DirEntPlusList};
use crate::ll::{Errno, Operation, ReplyBuf, Request, RequestError, RequestId};
use crate::session::{Session, MAX_WRITE_SIZE};

fn cvt(ret: libc::c_int) -> Result<libc::c_int, Errno> {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

fn cvt_off(ret: libc::off_t) -> Result<libc::off_t, Errno> {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

fn cvt_ssize(ret: isize) -> Result<usize, Errno> {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret as usize)
    }
}

fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

fn name_cstr(name: &OsStr) -> Result<CString, Errno> {
    CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)
}

/// The magic-link path that reopens an `O_PATH` descriptor with real
/// access modes.
fn proc_self_fd(fd: RawFd) -> CString {
    CString::new(format!("/proc/self/fd/{fd}")).expect("no interior NUL")
}

fn fstat_fd(fd: RawFd) -> Result<libc::stat, Errno> {
    let mut st = MaybeUninit::<libc::stat>::zeroed();
    cvt(unsafe { libc::fstat(fd, st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

fn attr_from_stat(st: &libc::stat) -> abi::fuse_attr {
    abi::fuse_attr {
        ino: st.st_ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: st.st_atime,
        mtime: st.st_mtime,
        ctime: st.st_ctime,
        atimensec: st.st_atime_nsec as u32,
        mtimensec: st.st_mtime_nsec as u32,
        ctimensec: st.st_ctime_nsec as u32,
        mode: st.st_mode,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        padding: 0,
    }
}

/// The file server: inode table, directory handles, async engine and
/// session state behind one dispatch surface.
pub struct MirrorFs {
    table: InodeTable,
    root_dev: u64,
    dirs: Mutex<Slab<Arc<Mutex<DirStream>>>>,
    aio: Arc<AioEngine>,
    session: Session,
    devices: Mutex<Vec<DeviceId>>,
}

impl MirrorFs {
    /// Opens the export root and builds the server. `completer` is the HAL
    /// callback the completion reaper fires for async requests.
    pub fn new(config: &LocalMirror, completer: Arc<dyn Completion>) -> io::Result<Arc<Self>> {
        let dir = CString::new(config.dir.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in export dir"))?;
        let root_fd = unsafe {
            libc::open(
                dir.as_ptr(),
                libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        if root_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let st = fstat_fd(root_fd).map_err(|e| io::Error::from_raw_os_error(e.code()))?;
        let (table, _root) = InodeTable::new(root_fd, st.st_ino, st.st_dev);
        let aio = Arc::new(AioEngine::new(completer, config.uring_cq_polling)?);
        aio.start_reapers(config.uring_cq_polling_nthreads)?;
        info!(
            "exporting {} (dev {}, ino {})",
            config.dir.display(),
            st.st_dev,
            st.st_ino
        );
        Ok(Arc::new(Self {
            table,
            root_dev: st.st_dev,
            dirs: Mutex::new(Slab::new()),
            aio,
            session: Session::new(config.metadata_timeout()),
            devices: Mutex::new(Vec::new()),
        }))
    }

    /// Lifecycle hook: a virtio-fs device came up.
    pub fn register_device(&self, device: DeviceId) {
        info!("device {device} registered");
        self.devices.lock().push(device);
    }

    /// Lifecycle hook: a virtio-fs device went away.
    pub fn unregister_device(&self, device: DeviceId) {
        info!("device {device} unregistered");
        self.devices.lock().retain(|d| *d != device);
    }

    /// Access to the async engine (shutdown draining).
    pub fn aio(&self) -> &Arc<AioEngine> {
        &self.aio
    }

    /// Stops the async engine after outstanding completions drained.
    pub fn shutdown(&self) {
        self.aio.shutdown();
        info!("shut down with {} live inodes", self.table.len());
    }

    /// Number of records in the inode table, the pinned root included.
    pub fn live_inodes(&self) -> usize {
        self.table.len()
    }

    fn inode(&self, nodeid: u64) -> Result<Arc<Inode>, Errno> {
        self.table.get(nodeid).ok_or(Errno::EINVAL)
    }

    /// Copies the backing fd out of a record; `EBADF` once it was
    /// invalidated by an unlink.
    fn backing_fd(&self, inode: &Inode) -> Result<RawFd, Errno> {
        let state = inode.lock();
        if state.fd_valid() {
            Ok(state.fd)
        } else {
            Err(Errno::EBADF)
        }
    }

    /// The single dispatch entry point.
    pub fn dispatch(&self, device: DeviceId, data: &[u8], ctx: RequestCtx) -> Dispatch {
        if !self.devices.lock().contains(&device) {
            warn!("request for unregistered device {device}");
        }
        let req = match Request::try_from(data) {
            Ok(req) => req,
            Err(err) => return self.reject(data, err),
        };
        debug!("{req}");
        let unique = RequestId(req.unique());

        match req.operation() {
            Operation::Init(x) => {
                return self.sync_reply(unique, |reply| {
                    let out = self.session.negotiate(x.arg, req.uid(), req.gid())?;
                    reply.push(&out);
                    Ok(())
                });
            }
            _ if !self.session.initialized() => {
                warn!("request {} before init", req.unique());
                return match req.operation() {
                    Operation::Forget(_) | Operation::BatchForget(_) => Dispatch::NoReply,
                    _ => self.sync_reply(unique, |_| Err(Errno::EIO)),
                };
            }
            Operation::Destroy(_) => {
                self.session.set_destroyed();
                return self.sync_reply(unique, |_| Ok(()));
            }
            _ if self.session.destroyed() => {
                warn!("request {} after destroy", req.unique());
                return match req.operation() {
                    Operation::Forget(_) | Operation::BatchForget(_) => Dispatch::NoReply,
                    _ => self.sync_reply(unique, |_| Err(Errno::EIO)),
                };
            }
            _ => {}
        }

        match req.operation() {
            Operation::Lookup(x) => self.sync_reply(unique, |reply| {
                let parent = self.inode(req.nodeid())?;
                match self.do_lookup(&parent, x.name) {
                    Ok(entry) => {
                        reply.push(&entry);
                        Ok(())
                    }
                    Err(err) if err == Errno::ENOENT => {
                        reply.push(&self.negative_entry());
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }),
            Operation::Forget(x) => {
                self.do_forget(req.nodeid(), x.arg.nlookup);
                Dispatch::NoReply
            }
            Operation::BatchForget(x) => {
                for node in x.nodes {
                    self.do_forget(node.nodeid, node.nlookup);
                }
                Dispatch::NoReply
            }
            Operation::GetAttr(x) => self.sync_reply(unique, |reply| {
                let inode = self.inode(req.nodeid())?;
                self.do_getattr(&inode, x.arg, reply)
            }),
            Operation::SetAttr(x) => self.sync_reply(unique, |reply| {
                let inode = self.inode(req.nodeid())?;
                self.do_setattr(&inode, x.arg, reply)
            }),
            Operation::ReadLink(_) => self.sync_reply(unique, |reply| {
                let inode = self.inode(req.nodeid())?;
                self.do_readlink(&inode, reply)
            }),
            Operation::SymLink(x) => self.sync_reply(unique, |reply| {
                let parent = self.inode(req.nodeid())?;
                self.do_symlink(&parent, x.name, x.target, reply)
            }),
            Operation::MkNod(x) => self.sync_reply(unique, |reply| {
                let parent = self.inode(req.nodeid())?;
                self.do_mknod(&parent, x.name, x.arg, reply)
            }),
            Operation::MkDir(x) => self.sync_reply(unique, |reply| {
                let parent = self.inode(req.nodeid())?;
                self.do_mkdir(&parent, x.name, x.arg, reply)
            }),
            Operation::Unlink(x) => self.sync_reply(unique, |_| {
                let parent = self.inode(req.nodeid())?;
                self.do_unlink(&parent, x.name)
            }),
            Operation::RmDir(x) => self.sync_reply(unique, |_| {
                let parent = self.inode(req.nodeid())?;
                let name = name_cstr(x.name)?;
                let parent_fd = self.backing_fd(&parent)?;
                cvt(unsafe { libc::unlinkat(parent_fd, name.as_ptr(), libc::AT_REMOVEDIR) })?;
                Ok(())
            }),
            Operation::Rename(x) => self.sync_reply(unique, |_| {
                let parent = self.inode(req.nodeid())?;
                let newparent = self.inode(x.newdir)?;
                self.do_rename(&parent, x.name, &newparent, x.newname, x.flags)
            }),
            Operation::Link(x) => self.sync_reply(unique, |reply| {
                let inode = self.inode(x.arg.oldnodeid)?;
                let newparent = self.inode(req.nodeid())?;
                self.do_link(&inode, &newparent, x.name, reply)
            }),
            Operation::Open(x) => self.sync_reply(unique, |reply| {
                let inode = self.inode(req.nodeid())?;
                self.do_open(&inode, x.arg.flags, reply)
            }),
            Operation::Read(x) => self.do_read(unique, x.arg, ctx),
            Operation::Write(x) => self.do_write(unique, x.arg, x.data, ctx),
            Operation::StatFs(_) => self.sync_reply(unique, |reply| {
                let inode = self.inode(req.nodeid())?;
                self.do_statfs(&inode, reply)
            }),
            Operation::Release(x) => self.sync_reply(unique, |_| {
                let inode = self.inode(req.nodeid())?;
                self.do_release(&inode, x.arg)
            }),
            Operation::FSync(x) => self.sync_reply(unique, |_| {
                let datasync = x.arg.fsync_flags & consts::FUSE_FSYNC_FDATASYNC != 0;
                let fd = x.arg.fh as RawFd;
                if datasync {
                    cvt(unsafe { libc::fdatasync(fd) })?;
                } else {
                    cvt(unsafe { libc::fsync(fd) })?;
                }
                Ok(())
            }),
            Operation::Flush(x) => self.sync_reply(unique, |_| {
                // close a dup so outstanding data reaches the backing file
                let fd = cvt(unsafe { libc::dup(x.arg.fh as RawFd) })?;
                cvt(unsafe { libc::close(fd) })?;
                Ok(())
            }),
            Operation::OpenDir(x) => self.sync_reply(unique, |reply| {
                let inode = self.inode(req.nodeid())?;
                self.do_opendir(&inode, x.arg.flags, reply)
            }),
            Operation::ReadDir(x) => self.sync_reply(unique, |reply| {
                let inode = self.inode(req.nodeid())?;
                self.do_readdir(&inode, x.arg, reply)
            }),
            Operation::ReadDirPlus(x) => self.sync_reply(unique, |reply| {
                let inode = self.inode(req.nodeid())?;
                self.do_readdirplus(&inode, x.arg, reply)
            }),
            Operation::ReleaseDir(x) => self.sync_reply(unique, |_| {
                self.dirs
                    .lock()
                    .try_remove(x.arg.fh as usize)
                    .map(|_| ())
                    .ok_or(Errno::EBADF)
            }),
            Operation::FSyncDir(x) => self.sync_reply(unique, |_| {
                let stream = self
                    .dirs
                    .lock()
                    .get(x.arg.fh as usize)
                    .cloned()
                    .ok_or(Errno::EBADF)?;
                let fd = stream.lock().fd();
                cvt(unsafe { libc::fsync(fd) })?;
                Ok(())
            }),
            // GETLK only exists for POSIX byte-range queries (F_GETLK),
            // which are not remoted; flock(2) has no query operation
            Operation::GetLk(_) => self.sync_reply(unique, |_| Err(Errno::ENOSYS)),
            Operation::SetLk(x) => self.sync_reply(unique, |_| self.do_setlk(x.arg, x.sleep)),
            Operation::Access(x) => self.sync_reply(unique, |_| {
                let inode = self.inode(req.nodeid())?;
                let fd = self.backing_fd(&inode)?;
                let path = proc_self_fd(fd);
                cvt(unsafe {
                    libc::faccessat(libc::AT_FDCWD, path.as_ptr(), x.arg.mask as libc::c_int, 0)
                })?;
                Ok(())
            }),
            Operation::Create(x) => self.sync_reply(unique, |reply| {
                let parent = self.inode(req.nodeid())?;
                self.do_create(&parent, x.name, x.arg, reply)
            }),
            Operation::Interrupt(_) => self.sync_reply(unique, |_| Err(Errno::ENOSYS)),
            Operation::FAllocate(x) => self.sync_reply(unique, |_| {
                cvt(unsafe {
                    libc::fallocate(
                        x.arg.fh as RawFd,
                        x.arg.mode as libc::c_int,
                        x.arg.offset as libc::off_t,
                        x.arg.length as libc::off_t,
                    )
                })?;
                Ok(())
            }),
            Operation::Lseek(x) => self.sync_reply(unique, |reply| {
                let off = cvt_off(unsafe {
                    libc::lseek(
                        x.arg.fh as RawFd,
                        x.arg.offset as libc::off_t,
                        x.arg.whence as libc::c_int,
                    )
                })?;
                reply.push(&abi::fuse_lseek_out { offset: off as u64 });
                Ok(())
            }),
            Operation::Unsupported(opcode) => {
                debug!("unsupported opcode {opcode:?}");
                self.sync_reply(unique, |_| Err(Errno::ENOSYS))
            }
            // init/destroy and the pre-init gate were handled above
            Operation::Init(_) | Operation::Destroy(_) => unreachable!(),
        }
    }

    fn sync_reply(
        &self,
        unique: RequestId,
        f: impl FnOnce(&mut ReplyBuf) -> Result<(), Errno>,
    ) -> Dispatch {
        let mut reply = ReplyBuf::new(unique);
        if let Err(err) = f(&mut reply) {
            if err == Errno::ENFILE || err == Errno::EMFILE {
                warn!("backing filesystem descriptor table exhausted ({err})");
            }
            reply.error(err);
        }
        Dispatch::Sync(reply)
    }

    /// Replies to an undecodable request, when enough of a header arrived
    /// to address a reply at all.
    fn reject(&self, data: &[u8], err: RequestError) -> Dispatch {
        warn!("dropping request: {err}");
        if data.len() < 16 {
            return Dispatch::NoReply;
        }
        let unique = u64::from_ne_bytes(data[8..16].try_into().expect("sliced"));
        let errno = match err {
            RequestError::UnknownOpcode(_) => Errno::EIO,
            _ => Errno::EINVAL,
        };
        let mut reply = ReplyBuf::new(RequestId(unique));
        reply.error(errno);
        Dispatch::Sync(reply)
    }

    fn negative_entry(&self) -> abi::fuse_entry_out {
        let (secs, nanos) = self.session.timeout_parts();
        abi::fuse_entry_out {
            nodeid: 0,
            entry_valid: secs,
            entry_valid_nsec: nanos,
            ..Default::default()
        }
    }

    fn entry_out(&self, handle: u64, generation: u64, attr: abi::fuse_attr) -> abi::fuse_entry_out {
        let (secs, nanos) = self.session.timeout_parts();
        abi::fuse_entry_out {
            nodeid: handle,
            generation,
            entry_valid: secs,
            attr_valid: secs,
            entry_valid_nsec: nanos,
            attr_valid_nsec: nanos,
            attr,
        }
    }

    /// Resolves `name` under `parent` and registers (or re-references) the
    /// child in the inode table. Every successful return has incremented
    /// the child's lookup count by exactly one.
    fn do_lookup(&self, parent: &Inode, name: &OsStr) -> Result<abi::fuse_entry_out, Errno> {
        let parent_fd = self.backing_fd(parent)?;
        self.do_lookup_at(parent_fd, name)
    }

    /// Lookup against an already-extracted parent descriptor; the variant
    /// for callers that hold the parent record lock (readdirplus).
    fn do_lookup_at(&self, parent_fd: RawFd, name: &OsStr) -> Result<abi::fuse_entry_out, Errno> {
        let name = name_cstr(name)?;
        let fd = cvt(unsafe {
            libc::openat(
                parent_fd,
                name.as_ptr(),
                libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        })?;
        let st = match fstat_fd(fd) {
            Ok(st) => st,
            Err(err) => {
                close_fd(fd);
                return Err(err);
            }
        };
        if st.st_dev != self.root_dev {
            // mountpoints in the source tree are not crossed
            close_fd(fd);
            return Err(Errno::ENOTSUP);
        }
        if st.st_ino == abi::FUSE_ROOT_ID {
            // a backing ino equal to the reserved root id cannot be told
            // apart on the wire
            close_fd(fd);
            return Err(Errno::EIO);
        }

        loop {
            match self.table.insert_or_get(st.st_ino, st.st_dev, fd) {
                InsertOutcome::Inserted(inode) => {
                    let generation = inode.lock().generation;
                    return Ok(self.entry_out(inode.handle, generation, attr_from_stat(&st)));
                }
                InsertOutcome::Existing(inode) => {
                    let mut state = inode.lock();
                    if state.dead {
                        // lost a race against the final forget; the table
                        // no longer holds this record
                        continue;
                    }
                    if state.fd_valid() {
                        close_fd(fd);
                    } else {
                        // recycled backing ino: adopt the fresh descriptor,
                        // the unlink already bumped the generation
                        state.fd = fd;
                    }
                    state.nlookup += 1;
                    let generation = state.generation;
                    drop(state);
                    return Ok(self.entry_out(inode.handle, generation, attr_from_stat(&st)));
                }
            }
        }
    }

    /// Drops `n` lookup references; erases the record when the count hits
    /// zero. Negative arithmetic here means the kernel and the server
    /// disagree about liveness, which nothing downstream can repair.
    fn do_forget(&self, nodeid: u64, n: u64) {
        let Some(inode) = self.table.get(nodeid) else {
            warn!("forget for unknown node {nodeid}");
            return;
        };
        if inode.handle == abi::FUSE_ROOT_ID {
            return;
        }
        let mut state = inode.lock();
        if state.nlookup < n {
            error!(
                "lookup count underflow on node {nodeid} ({} - {n})",
                state.nlookup
            );
            std::process::abort();
        }
        state.nlookup -= n;
        if state.nlookup == 0 {
            let fd = self.table.erase_locked(&inode, &mut state);
            drop(state);
            if let Some(fd) = fd {
                close_fd(fd);
            }
        }
    }

    fn do_getattr(
        &self,
        inode: &Inode,
        arg: &abi::fuse_getattr_in,
        reply: &mut ReplyBuf,
    ) -> Result<(), Errno> {
        let fd = if arg.getattr_flags & consts::FUSE_GETATTR_FH != 0 {
            arg.fh as RawFd
        } else {
            self.backing_fd(inode)?
        };
        let st = fstat_fd(fd)?;
        let (secs, nanos) = self.session.timeout_parts();
        reply.push(&abi::fuse_attr_out {
            attr_valid: secs,
            attr_valid_nsec: nanos,
            dummy: 0,
            attr: attr_from_stat(&st),
        });
        Ok(())
    }

    fn do_setattr(
        &self,
        inode: &Inode,
        arg: &abi::fuse_setattr_in,
        reply: &mut ReplyBuf,
    ) -> Result<(), Errno> {
        let valid = arg.valid;
        let use_fh = valid & consts::FATTR_FH != 0;
        let fh = arg.fh as RawFd;
        // a path-only descriptor cannot take fchmod/fchown directly, so
        // without a file handle everything goes through the magic link
        let path = if use_fh {
            None
        } else {
            Some(proc_self_fd(self.backing_fd(inode)?))
        };

        if valid & consts::FATTR_MODE != 0 {
            let mode = arg.mode as libc::mode_t;
            match &path {
                None => cvt(unsafe { libc::fchmod(fh, mode) })?,
                Some(p) => cvt(unsafe { libc::chmod(p.as_ptr(), mode) })?,
            };
        }
        if valid & (consts::FATTR_UID | consts::FATTR_GID) != 0 {
            let uid = if valid & consts::FATTR_UID != 0 {
                arg.uid
            } else {
                libc::uid_t::MAX // leave unchanged
            };
            let gid = if valid & consts::FATTR_GID != 0 {
                arg.gid
            } else {
                libc::gid_t::MAX
            };
            match &path {
                None => cvt(unsafe { libc::fchown(fh, uid, gid) })?,
                Some(p) => cvt(unsafe { libc::chown(p.as_ptr(), uid, gid) })?,
            };
        }
        if valid & consts::FATTR_SIZE != 0 {
            match &path {
                None => cvt(unsafe { libc::ftruncate(fh, arg.size as libc::off_t) })?,
                Some(p) => cvt(unsafe { libc::truncate(p.as_ptr(), arg.size as libc::off_t) })?,
            };
        }
        if valid & (consts::FATTR_ATIME | consts::FATTR_MTIME) != 0 {
            let omit = libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            };
            let mut times = [omit, omit];
            if valid & consts::FATTR_ATIME_NOW != 0 {
                times[0].tv_nsec = libc::UTIME_NOW;
            } else if valid & consts::FATTR_ATIME != 0 {
                times[0] = libc::timespec {
                    tv_sec: arg.atime,
                    tv_nsec: arg.atimensec as libc::c_long,
                };
            }
            if valid & consts::FATTR_MTIME_NOW != 0 {
                times[1].tv_nsec = libc::UTIME_NOW;
            } else if valid & consts::FATTR_MTIME != 0 {
                times[1] = libc::timespec {
                    tv_sec: arg.mtime,
                    tv_nsec: arg.mtimensec as libc::c_long,
                };
            }
            match &path {
                None => cvt(unsafe { libc::futimens(fh, times.as_ptr()) })?,
                Some(p) => cvt(unsafe {
                    libc::utimensat(libc::AT_FDCWD, p.as_ptr(), times.as_ptr(), 0)
                })?,
            };
        }

        let stat_fd = if use_fh { fh } else { self.backing_fd(inode)? };
        let st = fstat_fd(stat_fd)?;
        let (secs, nanos) = self.session.timeout_parts();
        reply.push(&abi::fuse_attr_out {
            attr_valid: secs,
            attr_valid_nsec: nanos,
            dummy: 0,
            attr: attr_from_stat(&st),
        });
        Ok(())
    }

    fn do_readlink(&self, inode: &Inode, reply: &mut ReplyBuf) -> Result<(), Errno> {
        const EMPTY_PATH: &[u8] = b"\0";
        let fd = self.backing_fd(inode)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        // empty path: the O_PATH fd itself names the symlink
        let len = cvt_ssize(unsafe {
            libc::readlinkat(
                fd,
                EMPTY_PATH.as_ptr().cast(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        })?;
        reply.push_bytes(&buf[..len]);
        Ok(())
    }

    fn do_symlink(
        &self,
        parent: &Inode,
        name: &OsStr,
        target: &OsStr,
        reply: &mut ReplyBuf,
    ) -> Result<(), Errno> {
        let parent_fd = self.backing_fd(parent)?;
        let cname = name_cstr(name)?;
        let ctarget = name_cstr(target)?;
        cvt(unsafe { libc::symlinkat(ctarget.as_ptr(), parent_fd, cname.as_ptr()) })?;
        let entry = self.do_lookup(parent, name)?;
        reply.push(&entry);
        Ok(())
    }

    fn do_mknod(
        &self,
        parent: &Inode,
        name: &OsStr,
        arg: &abi::fuse_mknod_in,
        reply: &mut ReplyBuf,
    ) -> Result<(), Errno> {
        let parent_fd = self.backing_fd(parent)?;
        let cname = name_cstr(name)?;
        cvt(unsafe {
            libc::mknodat(
                parent_fd,
                cname.as_ptr(),
                arg.mode as libc::mode_t,
                arg.rdev as libc::dev_t,
            )
        })?;
        let entry = self.do_lookup(parent, name)?;
        reply.push(&entry);
        Ok(())
    }

    fn do_mkdir(
        &self,
        parent: &Inode,
        name: &OsStr,
        arg: &abi::fuse_mkdir_in,
        reply: &mut ReplyBuf,
    ) -> Result<(), Errno> {
        let parent_fd = self.backing_fd(parent)?;
        let cname = name_cstr(name)?;
        cvt(unsafe { libc::mkdirat(parent_fd, cname.as_ptr(), arg.mode as libc::mode_t) })?;
        let entry = self.do_lookup(parent, name)?;
        reply.push(&entry);
        Ok(())
    }

    /// Unlink with the stable-identity dance: when metadata caching is
    /// off, a name that is the object's last link and has no open handles
    /// gets its record's descriptor invalidated and generation bumped
    /// before the backing unlink, so a later reuse of the backing ino is
    /// distinguishable. The pre-unlink lookup is always undone by a
    /// compensating forget.
    fn do_unlink(&self, parent: &Inode, name: &OsStr) -> Result<(), Errno> {
        let mut compensate = None;
        if !self.session.writeback() {
            match self.do_lookup(parent, name) {
                Ok(entry) => {
                    compensate = Some(entry.nodeid);
                    if entry.attr.nlink == 1 {
                        if let Some(inode) = self.table.get(entry.nodeid) {
                            let mut state = inode.lock();
                            if state.nopen == 0 && state.fd_valid() {
                                let fd = state.fd;
                                state.fd = FD_UNLINKED;
                                state.generation += 1;
                                drop(state);
                                close_fd(fd);
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!("pre-unlink lookup failed: {err}");
                }
            }
        }

        let result = (|| {
            let cname = name_cstr(name)?;
            let parent_fd = self.backing_fd(parent)?;
            cvt(unsafe { libc::unlinkat(parent_fd, cname.as_ptr(), 0) })?;
            Ok(())
        })();

        if let Some(nodeid) = compensate {
            self.do_forget(nodeid, 1);
        }
        result
    }

    fn do_rename(
        &self,
        parent: &Inode,
        name: &OsStr,
        newparent: &Inode,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), Errno> {
        let cname = name_cstr(name)?;
        let cnewname = name_cstr(newname)?;
        let parent_fd = self.backing_fd(parent)?;
        let newparent_fd = self.backing_fd(newparent)?;
        cvt(unsafe {
            libc::renameat2(
                parent_fd,
                cname.as_ptr(),
                newparent_fd,
                cnewname.as_ptr(),
                flags,
            )
        })?;
        Ok(())
    }

    fn do_link(
        &self,
        inode: &Inode,
        newparent: &Inode,
        name: &OsStr,
        reply: &mut ReplyBuf,
    ) -> Result<(), Errno> {
        let fd = self.backing_fd(inode)?;
        let newparent_fd = self.backing_fd(newparent)?;
        let cname = name_cstr(name)?;
        let path = proc_self_fd(fd);
        cvt(unsafe {
            libc::linkat(
                libc::AT_FDCWD,
                path.as_ptr(),
                newparent_fd,
                cname.as_ptr(),
                libc::AT_SYMLINK_FOLLOW,
            )
        })?;
        let entry = self.do_lookup(newparent, name)?;
        reply.push(&entry);
        Ok(())
    }

    /// Reopens the path-only descriptor with the requested access mode.
    fn reopen(&self, inode: &Inode, flags: i32) -> Result<RawFd, Errno> {
        let fd = self.backing_fd(inode)?;
        let mut flags = flags & !(libc::O_NOFOLLOW | libc::O_CREAT | libc::O_EXCL);
        if self.session.writeback() {
            // the writeback cache reads back dirty pages through this
            // handle, and handles append ordering itself
            if flags & libc::O_ACCMODE == libc::O_WRONLY {
                flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
            }
            flags &= !libc::O_APPEND;
        }
        let path = proc_self_fd(fd);
        cvt(unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC) })
    }

    fn do_open(&self, inode: &Inode, flags: i32, reply: &mut ReplyBuf) -> Result<(), Errno> {
        let fd = self.reopen(inode, flags)?;
        inode.lock().nopen += 1;
        reply.push(&abi::fuse_open_out {
            fh: fd as u64,
            open_flags: 0,
            padding: 0,
        });
        Ok(())
    }

    fn do_release(&self, inode: &Inode, arg: &abi::fuse_release_in) -> Result<(), Errno> {
        close_fd(arg.fh as RawFd);
        let mut state = inode.lock();
        if state.nopen == 0 {
            warn!("release without matching open on node {}", inode.handle);
        } else {
            state.nopen -= 1;
        }
        Ok(())
    }

    fn do_create(
        &self,
        parent: &Inode,
        name: &OsStr,
        arg: &abi::fuse_create_in,
        reply: &mut ReplyBuf,
    ) -> Result<(), Errno> {
        let parent_fd = self.backing_fd(parent)?;
        let cname = name_cstr(name)?;
        let mut flags = (arg.flags & !libc::O_NOFOLLOW) | libc::O_CREAT | libc::O_CLOEXEC;
        if self.session.writeback() {
            if flags & libc::O_ACCMODE == libc::O_WRONLY {
                flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
            }
            flags &= !libc::O_APPEND;
        }
        let fd = cvt(unsafe {
            libc::openat(parent_fd, cname.as_ptr(), flags, arg.mode as libc::mode_t)
        })?;
        let entry = match self.do_lookup(parent, name) {
            Ok(entry) => entry,
            Err(err) => {
                close_fd(fd);
                return Err(err);
            }
        };
        if let Some(inode) = self.table.get(entry.nodeid) {
            inode.lock().nopen += 1;
        }
        reply.push(&abi::fuse_create_out(
            entry,
            abi::fuse_open_out {
                fh: fd as u64,
                open_flags: 0,
                padding: 0,
            },
        ));
        Ok(())
    }

    fn do_statfs(&self, inode: &Inode, reply: &mut ReplyBuf) -> Result<(), Errno> {
        let fd = self.backing_fd(inode)?;
        let mut st = MaybeUninit::<libc::statfs>::zeroed();
        cvt(unsafe { libc::fstatfs(fd, st.as_mut_ptr()) })?;
        let st = unsafe { st.assume_init() };
        reply.push(&abi::fuse_statfs_out {
            st: abi::fuse_kstatfs {
                blocks: st.f_blocks as u64,
                bfree: st.f_bfree as u64,
                bavail: st.f_bavail as u64,
                files: st.f_files as u64,
                ffree: st.f_ffree as u64,
                bsize: st.f_bsize as u32,
                namelen: st.f_namelen as u32,
                frsize: st.f_frsize as u32,
                padding: 0,
                spare: [0; 6],
            },
        });
        Ok(())
    }

    fn do_setlk(&self, arg: &abi::fuse_lk_in, sleep: bool) -> Result<(), Errno> {
        if arg.lk_flags & consts::FUSE_LK_FLOCK == 0 {
            // POSIX byte-range locks are not remoted
            return Err(Errno::ENOSYS);
        }
        let mut op = match arg.lk.typ {
            libc::F_RDLCK => libc::LOCK_SH,
            libc::F_WRLCK => libc::LOCK_EX,
            libc::F_UNLCK => libc::LOCK_UN,
            _ => return Err(Errno::EINVAL),
        };
        if !sleep {
            op |= libc::LOCK_NB;
        }
        cvt(unsafe { libc::flock(arg.fh as RawFd, op) })?;
        Ok(())
    }

    fn do_opendir(&self, inode: &Inode, flags: i32, reply: &mut ReplyBuf) -> Result<(), Errno> {
        let _ = flags;
        let fd = self.backing_fd(inode)?;
        let path = proc_self_fd(fd);
        let dir_fd = cvt(unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        })?;
        let stream = DirStream::from_fd(dir_fd)?;
        let fh = self.dirs.lock().insert(Arc::new(Mutex::new(stream))) as u64;
        reply.push(&abi::fuse_open_out {
            fh,
            open_flags: 0,
            padding: 0,
        });
        Ok(())
    }

    fn dir_stream(&self, fh: u64) -> Result<Arc<Mutex<DirStream>>, Errno> {
        self.dirs.lock().get(fh as usize).cloned().ok_or(Errno::EBADF)
    }

    fn do_readdir(
        &self,
        inode: &Inode,
        arg: &abi::fuse_read_in,
        reply: &mut ReplyBuf,
    ) -> Result<(), Errno> {
        let stream = self.dir_stream(arg.fh)?;
        let _inode_held = inode.lock();
        let mut stream = stream.lock();
        if arg.offset != stream.offset {
            stream.seek(arg.offset);
        }
        let mut list = DirEntList::new(reply, arg.size as usize);
        loop {
            let resume = stream.offset;
            let ent = match stream.next() {
                None => break,
                Some(Ok(ent)) => ent,
                Some(Err(err)) => {
                    if list.is_empty() {
                        return Err(err);
                    }
                    break;
                }
            };
            if ent.is_dot() {
                stream.offset = ent.off;
                continue;
            }
            if list.push(ent.ino, ent.off, ent.typ, &ent.name) {
                // no room: rewind so the next call re-reads this entry
                stream.seek(resume);
                break;
            }
            stream.offset = ent.off;
        }
        Ok(())
    }

    fn do_readdirplus(
        &self,
        inode: &Inode,
        arg: &abi::fuse_read_in,
        reply: &mut ReplyBuf,
    ) -> Result<(), Errno> {
        let stream = self.dir_stream(arg.fh)?;
        let inode_state = inode.lock();
        if !inode_state.fd_valid() {
            return Err(Errno::EBADF);
        }
        let parent_fd = inode_state.fd;
        let mut stream = stream.lock();
        if arg.offset != stream.offset {
            stream.seek(arg.offset);
        }
        let mut list = DirEntPlusList::new(reply, arg.size as usize);
        loop {
            let resume = stream.offset;
            let ent = match stream.next() {
                None => break,
                Some(Ok(ent)) => ent,
                Some(Err(err)) => {
                    if list.is_empty() {
                        return Err(err);
                    }
                    break;
                }
            };
            if ent.is_dot() {
                stream.offset = ent.off;
                continue;
            }
            let entry = match self.do_lookup_at(parent_fd, &ent.name) {
                Ok(entry) => entry,
                Err(err) if err == Errno::ENOENT => {
                    // raced with an unlink; the entry no longer exists
                    stream.offset = ent.off;
                    continue;
                }
                Err(err) => {
                    if list.is_empty() {
                        return Err(err);
                    }
                    stream.seek(resume);
                    break;
                }
            };
            if list.push(&entry, ent.off, &ent.name) {
                // no room: undo this entry's lookup and rewind
                self.do_forget(entry.nodeid, 1);
                stream.seek(resume);
                break;
            }
            stream.offset = ent.off;
        }
        Ok(())
    }

    fn do_read(&self, unique: RequestId, arg: &abi::fuse_read_in, ctx: RequestCtx) -> Dispatch {
        if arg.size as usize > MAX_WRITE_SIZE {
            return self.sync_reply(unique, |_| Err(Errno::EINVAL));
        }
        if arg.size == 0 {
            return self.sync_reply(unique, |_| Ok(()));
        }
        let reply = ReplyBuf::with_data_capacity(unique, arg.size as usize);
        match self
            .aio
            .submit_read(arg.fh as RawFd, arg.offset, arg.size, reply, ctx)
        {
            Ok(()) => Dispatch::Pending,
            Err(err) => self.sync_reply(unique, |_| Err(err)),
        }
    }

    fn do_write(
        &self,
        unique: RequestId,
        arg: &abi::fuse_write_in,
        data: &[u8],
        ctx: RequestCtx,
    ) -> Dispatch {
        let size = arg.size as usize;
        if size > MAX_WRITE_SIZE || data.len() < size {
            return self.sync_reply(unique, |_| Err(Errno::EINVAL));
        }
        if size == 0 {
            return self.sync_reply(unique, |reply| {
                reply.push(&abi::fuse_write_out { size: 0, padding: 0 });
                Ok(())
            });
        }
        // the request buffer is recycled the moment dispatch returns, the
        // payload has to move into the cookie
        let data = data[..size].to_vec();
        match self
            .aio
            .submit_write(arg.fh as RawFd, arg.offset, data, ReplyBuf::new(unique), ctx)
        {
            Ok(()) => Dispatch::Pending,
            Err(err) => self.sync_reply(unique, |_| Err(err)),
        }
    }
}
