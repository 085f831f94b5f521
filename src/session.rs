//! Per-session negotiation state.
//!
//! One handshake per device lifetime: the guest kernel sends INIT, the
//! server echoes back the intersection of offered and wanted capabilities,
//! optionally drops privileges to the requesting identity, and marks the
//! session live. Everything here is process-wide and set exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use log::{info, warn};
use nix::unistd::{setegid, seteuid, Gid, Uid};

use crate::ll::fuse_abi::{self as abi, consts};
use crate::ll::Errno;

/// Largest write payload accepted per request.
pub const MAX_WRITE_SIZE: usize = 1 << 20;

/// Request buffer size: the largest write plus header room.
pub const BUFFER_SIZE: usize = MAX_WRITE_SIZE + 4096;

/// Negotiated session state.
pub struct Session {
    initialized: AtomicBool,
    destroyed: AtomicBool,
    negotiated: AtomicU32,
    /// Entry/attribute cache TTL handed to the kernel with every entry.
    timeout: Duration,
    /// Writeback caching; enabled iff the configured timeout is non-zero.
    writeback: bool,
}

impl Session {
    pub fn new(metadata_timeout: Duration) -> Self {
        Self {
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            negotiated: AtomicU32::new(0),
            timeout: metadata_timeout,
            writeback: !metadata_timeout.is_zero(),
        }
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn set_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn writeback(&self) -> bool {
        self.writeback
    }

    /// The entry/attr TTL as (seconds, nanoseconds), ready for wire structs.
    pub fn timeout_parts(&self) -> (u64, u32) {
        (self.timeout.as_secs(), self.timeout.subsec_nanos())
    }

    /// Negotiated capability mask (0 before init).
    pub fn flags(&self) -> u32 {
        self.negotiated.load(Ordering::Acquire)
    }

    /// Handles INIT: verifies the ABI, intersects capabilities, drops
    /// effective identity when the request carries one, and flips the
    /// session to initialised. A second INIT is refused.
    pub fn negotiate(
        &self,
        arg: &abi::fuse_init_in,
        uid: u32,
        gid: u32,
    ) -> Result<abi::fuse_init_out, Errno> {
        if arg.major < 7 || (arg.major == 7 && arg.minor < 6) {
            warn!("unsupported FUSE ABI version {}.{}", arg.major, arg.minor);
            return Err(Errno::EPROTO);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            warn!("duplicate INIT ignored");
            return Err(Errno::EIO);
        }

        let mut wanted = consts::FUSE_ASYNC_READ
            | consts::FUSE_BIG_WRITES
            | consts::FUSE_ATOMIC_O_TRUNC
            | consts::FUSE_EXPORT_SUPPORT
            | consts::FUSE_FLOCK_LOCKS
            | consts::FUSE_DO_READDIRPLUS
            | consts::FUSE_READDIRPLUS_AUTO
            | consts::FUSE_PARALLEL_DIROPS
            | consts::FUSE_MAX_PAGES;
        if self.writeback {
            wanted |= consts::FUSE_WRITEBACK_CACHE;
        }
        // the virtio-fs transfer model has no splice path, so the splice
        // bits are never part of the wanted set
        let negotiated = arg.flags & wanted;
        self.negotiated.store(negotiated, Ordering::Release);

        if uid != 0 || gid != 0 {
            if let Err(e) = setegid(Gid::from_raw(gid)) {
                warn!("could not drop effective gid to {gid}: {e}");
            }
            if let Err(e) = seteuid(Uid::from_raw(uid)) {
                warn!("could not drop effective uid to {uid}: {e}");
            }
        } else {
            info!("init carries no identity, continuing as the server user");
        }

        let max_pages = ((MAX_WRITE_SIZE - 1) / page_size::get() + 1) as u16;
        info!(
            "session initialised: kernel ABI {}.{}, negotiated flags {negotiated:#x}",
            arg.major, arg.minor
        );
        Ok(abi::fuse_init_out {
            major: abi::FUSE_KERNEL_VERSION,
            minor: abi::FUSE_KERNEL_MINOR_VERSION,
            max_readahead: arg.max_readahead,
            flags: negotiated,
            max_background: 16,
            congestion_threshold: 12,
            max_write: MAX_WRITE_SIZE as u32,
            time_gran: 1,
            max_pages,
            map_alignment: 0,
            unused: [0; 8],
        })
    }
}
