//! Callback-data pool for in-flight async I/O.
//!
//! Each read/write submission parks a [`CallbackData`] here and rides its
//! slab key through the kernel as the submission's user data. Keys are
//! plain indices, so nothing the kernel hands back is ever dereferenced as
//! a pointer, and the buffers the kernel targets stay owned by the pool
//! entry until the completion is reaped.

use parking_lot::Mutex;
use slab::Slab;

use crate::hal::RequestCtx;
use crate::ll::ReplyBuf;

/// Which data-path operation a cookie belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioOp {
    Read,
    Write,
}

/// Everything needed to finish one async request when its completion
/// arrives.
#[derive(Debug)]
pub struct CallbackData {
    pub op: AioOp,
    pub ctx: RequestCtx,
    /// The reply under construction. For reads its payload region is the
    /// kernel's scatter target and must not move while in flight.
    pub reply: ReplyBuf,
    /// For writes: the payload copied out of the request buffer. The
    /// kernel reads from it until completion.
    pub data: Vec<u8>,
    /// Set when submission failed after the entry was published to the
    /// ring; the reaper then drops the cookie without completing anything.
    pub orphaned: bool,
}

/// Thread-safe acquire/release pool of callback records.
pub struct CookiePool {
    entries: Mutex<Slab<CallbackData>>,
}

impl CookiePool {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Slab::new()),
        }
    }

    /// Parks a record and returns its key.
    pub fn acquire(&self, data: CallbackData) -> u64 {
        self.entries.lock().insert(data) as u64
    }

    /// Takes the record for `key` back out. `None` for keys the pool does
    /// not know, e.g. after a double completion.
    pub fn release(&self, key: u64) -> Option<CallbackData> {
        self.entries.lock().try_remove(key as usize)
    }

    /// Marks an entry as orphaned (see [`CallbackData::orphaned`]).
    pub fn orphan(&self, key: u64) {
        if let Some(entry) = self.entries.lock().get_mut(key as usize) {
            entry.orphaned = true;
        }
    }

    /// Number of parked records.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for CookiePool {
    fn default() -> Self {
        Self::new()
    }
}
