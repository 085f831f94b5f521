//! Async read/write submission and completion reaping.
//!
//! Read and write are the only operations that leave the dispatch path
//! before their reply is finished: the data transfer is pushed into a
//! shared io_uring and the poll thread returns immediately. A reaper
//! later matches each completion back to its parked [`CallbackData`],
//! patches the reply header, and fires the HAL completion callback
//! exactly once.
//!
//! Submission is serialised by a mutex around the shared ring; reaping is
//! serialised by its own mutex so either one blocking reaper or several
//! busy-polling reapers (`uring_cq_polling`) can drain the same queue.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use io_uring::{opcode, types, IoUring};
use log::{error, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::hal::{Completion, CompletionStatus, RequestCtx};
use crate::ll::fuse_abi::fuse_write_out;
use crate::ll::{Errno, ReplyBuf};
use crate::pool::{AioOp, CallbackData, CookiePool};

/// Submission queue depth of the shared ring.
const QUEUE_DEPTH: u32 = 256;

/// User data of the NOP submissions used to wake blocking reapers.
const WAKE_USER_DATA: u64 = u64::MAX;

/// The shared async-I/O context: submit side and completion pump.
pub struct AioEngine {
    ring: IoUring,
    sq_lock: Mutex<()>,
    cq_lock: Mutex<()>,
    pool: CookiePool,
    completer: Arc<dyn Completion>,
    inflight: AtomicUsize,
    shutdown: AtomicBool,
    cq_polling: bool,
    reapers: Mutex<Vec<JoinHandle<()>>>,
}

impl AioEngine {
    pub fn new(completer: Arc<dyn Completion>, cq_polling: bool) -> io::Result<Self> {
        let ring = IoUring::new(QUEUE_DEPTH)?;
        Ok(Self {
            ring,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            pool: CookiePool::new(),
            completer,
            inflight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            cq_polling,
            reapers: Mutex::new(Vec::new()),
        })
    }

    /// Starts the completion pump: one blocking reaper, or `nthreads`
    /// busy-polling reapers when completion polling is configured.
    pub fn start_reapers(self: &Arc<Self>, nthreads: usize) -> io::Result<()> {
        let count = if self.cq_polling { nthreads.max(1) } else { 1 };
        let mut reapers = self.reapers.lock();
        for id in 0..count {
            let engine = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("mirrorfs-reap-{id}"))
                .spawn(move || engine.reap_main())?;
            reapers.push(handle);
        }
        Ok(())
    }

    /// Submits an async read of `size` bytes into the reply's payload
    /// region. On success the reply is owned by the engine until the
    /// completion callback fires.
    pub fn submit_read(
        &self,
        fd: RawFd,
        offset: u64,
        size: u32,
        mut reply: ReplyBuf,
        ctx: RequestCtx,
    ) -> Result<(), Errno> {
        reply.grow_data(size as usize);
        let ptr = reply.data_mut_ptr();
        let key = self.pool.acquire(CallbackData {
            op: AioOp::Read,
            ctx,
            reply,
            data: Vec::new(),
            orphaned: false,
        });
        let sqe = opcode::Read::new(types::Fd(fd), ptr, size)
            .offset(offset)
            .build()
            .user_data(key);
        self.submit_entry(sqe, key)
    }

    /// Submits an async write of `data`. The payload was copied out of the
    /// request buffer and lives in the cookie until completion.
    pub fn submit_write(
        &self,
        fd: RawFd,
        offset: u64,
        data: Vec<u8>,
        reply: ReplyBuf,
        ctx: RequestCtx,
    ) -> Result<(), Errno> {
        let ptr = data.as_ptr();
        let len = data.len() as u32;
        let key = self.pool.acquire(CallbackData {
            op: AioOp::Write,
            ctx,
            reply,
            data,
            orphaned: false,
        });
        let sqe = opcode::Write::new(types::Fd(fd), ptr, len)
            .offset(offset)
            .build()
            .user_data(key);
        self.submit_entry(sqe, key)
    }

    fn submit_entry(&self, sqe: io_uring::squeue::Entry, key: u64) -> Result<(), Errno> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        if !self.push_sqe(&sqe) {
            // never published; the cookie can be reclaimed outright
            self.pool.release(key);
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            return Err(Errno::EAGAIN);
        }
        let mut attempts = 0;
        loop {
            match self.ring.submit() {
                Ok(_) => return Ok(()),
                Err(e)
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY)
                    ) && attempts < 64 =>
                {
                    attempts += 1;
                    thread::yield_now();
                }
                Err(e) => {
                    // the entry is already visible to the kernel, so the
                    // cookie (and the buffers it owns) must stay parked
                    // until its completion eventually surfaces
                    error!("io_uring submit failed: {e}");
                    self.pool.orphan(key);
                    return Err(Errno::from(e));
                }
            }
        }
    }

    /// Pushes one entry, flushing the queue once if it is full. Returns
    /// false if no slot could be made available.
    fn push_sqe(&self, sqe: &io_uring::squeue::Entry) -> bool {
        for _ in 0..2 {
            {
                let _held = self.sq_lock.lock();
                let mut sq = unsafe { self.ring.submission_shared() };
                if unsafe { sq.push(sqe) }.is_ok() {
                    sq.sync();
                    return true;
                }
            }
            // queue full: let the kernel consume what is pending
            if let Err(e) = self.ring.submit() {
                warn!("io_uring flush on full queue failed: {e}");
                return false;
            }
        }
        false
    }

    fn reap_main(&self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) && self.inflight.load(Ordering::Acquire) == 0
            {
                break;
            }
            if self.cq_polling {
                if self.reap_batch() == 0 {
                    std::hint::spin_loop();
                }
            } else {
                match self.ring.submitter().submit_and_wait(1) {
                    Ok(_) => {
                        self.reap_batch();
                    }
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(e) => {
                        error!("completion wait failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    /// Drains whatever completions are ready. Returns the batch size.
    pub fn reap_batch(&self) -> usize {
        let mut events: SmallVec<[(u64, i32); 32]> = SmallVec::new();
        {
            let _held = self.cq_lock.lock();
            let mut cq = unsafe { self.ring.completion_shared() };
            cq.sync();
            for cqe in &mut cq {
                events.push((cqe.user_data(), cqe.result()));
            }
        }
        let count = events.len();
        for (key, result) in events {
            self.finish(key, result);
        }
        count
    }

    fn finish(&self, key: u64, result: i32) {
        if key == WAKE_USER_DATA {
            return;
        }
        let Some(mut cookie) = self.pool.release(key) else {
            warn!("completion for unknown cookie {key}");
            return;
        };
        self.inflight.fetch_sub(1, Ordering::SeqCst);
        if cookie.orphaned {
            return;
        }
        let status = if result < 0 {
            cookie.reply.error(Errno::from_raw(-result));
            CompletionStatus::Error
        } else {
            match cookie.op {
                AioOp::Read => cookie.reply.truncate_data(result as usize),
                AioOp::Write => cookie.reply.push(&fuse_write_out {
                    size: result as u32,
                    padding: 0,
                }),
            }
            CompletionStatus::Success
        };
        self.completer.complete(cookie.ctx, cookie.reply, status);
    }

    /// Number of submissions whose completion has not been reaped yet.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Stops the pump: outstanding completions drain, blocking reapers are
    /// woken with a NOP, and all reaper threads are joined.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handles = mem::take(&mut *self.reapers.lock());
        for _ in 0..handles.len() {
            let wake = opcode::Nop::new().build().user_data(WAKE_USER_DATA);
            if !self.push_sqe(&wake) {
                warn!("could not queue reaper wakeup");
            }
        }
        if let Err(e) = self.ring.submit() {
            warn!("could not submit reaper wakeup: {e}");
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}
