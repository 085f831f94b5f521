//! Wire protocol layer.
//!
//! Everything needed to turn raw virtio-fs request bytes into typed
//! operations and to encode replies: the kernel ABI structs, the argument
//! cursor, the request parser and the reply buffer.

pub mod argument;
pub mod fuse_abi;
pub mod reply;
pub mod request;

use std::fmt;
use std::io;
use std::num::NonZeroI32;

pub use fuse_abi::FUSE_ROOT_ID;
pub use reply::ReplyBuf;
pub use request::{Operation, Request, RequestError};

/// A newtype for request unique ids; echoed back in the reply header so the
/// kernel can pair responses with outstanding transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// A raw errno as carried in the `error` field of a reply header (stored
/// positive, sent negated). Zero is not an error, hence the `NonZeroI32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub NonZeroI32);

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        $(pub const $name: Errno = Errno::from_raw_const(libc::$name);)*
    };
}

impl Errno {
    errno_consts!(
        EPERM, ENOENT, EIO, EBADF, EAGAIN, ENOMEM, EACCES, EEXIST, ENOTDIR,
        EISDIR, EINVAL, ENFILE, EMFILE, ENOSPC, ENOSYS, ENOTEMPTY, ENOTSUP,
        ENAMETOOLONG, EPROTO, EOVERFLOW,
    );

    const fn from_raw_const(raw: i32) -> Errno {
        match NonZeroI32::new(raw) {
            Some(n) => Errno(n),
            None => panic!("errno constant must be non-zero"),
        }
    }

    /// Builds an `Errno` from a raw (positive) errno value; zero and
    /// negative values collapse to `EIO` rather than corrupting a reply.
    pub fn from_raw(raw: i32) -> Errno {
        match NonZeroI32::new(raw) {
            Some(n) if raw > 0 => Errno(n),
            _ => Errno::EIO,
        }
    }

    /// The errno of the calling thread's last failed syscall.
    pub fn last() -> Errno {
        Self::from(io::Error::last_os_error())
    }

    /// The raw positive errno value.
    pub fn code(&self) -> i32 {
        self.0.get()
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0.get())
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(raw) => Errno::from_raw(raw),
            None => Errno::EIO,
        }
    }
}
