//! Reply encoding.
//!
//! Replies are built into a [`ReplyBuf`]: an owned buffer that always
//! starts with a `fuse_out_header` and keeps the header's `len` field in
//! sync with the bytes appended after it. Handlers either fill it before
//! returning (synchronous operations) or hand it to the aio engine, which
//! patches it on completion; either way the HAL ships `bytes()` verbatim.
//!
//! The buffer is heap-allocated and never shrinks while an async
//! submission is in flight, so the data region after the header is a
//! stable target for the kernel to scatter read results into.

use std::convert::TryInto;
use std::ffi::OsStr;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::fuse_abi as abi;
use super::{Errno, RequestId};

/// Length of the fixed reply header.
pub const OUT_HEADER_LEN: usize = size_of::<abi::fuse_out_header>();

/// An owned reply in wire format.
#[derive(Debug)]
pub struct ReplyBuf {
    buf: Vec<u8>,
}

impl ReplyBuf {
    /// A fresh reply carrying only a success header.
    pub fn new(unique: RequestId) -> Self {
        Self::with_data_capacity(unique, 0)
    }

    /// A fresh reply with room reserved for `extra` payload bytes.
    pub fn with_data_capacity(unique: RequestId, extra: usize) -> Self {
        let mut buf = Vec::with_capacity(OUT_HEADER_LEN + extra);
        let header = abi::fuse_out_header {
            len: OUT_HEADER_LEN as u32,
            error: 0,
            unique: unique.0,
        };
        buf.extend_from_slice(header.as_bytes());
        Self { buf }
    }

    // The header lives at the front of a plain byte buffer (which has no
    // alignment guarantee), so field patches go through byte offsets in
    // native endianness, matching the wire format.

    fn header(&self) -> abi::fuse_out_header {
        abi::fuse_out_header::read_from_prefix(&self.buf)
            .expect("reply buffer always holds a header")
            .0
    }

    fn sync_len(&mut self) {
        let len: u32 = self.buf.len().try_into().expect("reply too large");
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
    }

    /// Turns this reply into an error reply: the payload is dropped and the
    /// header carries the negated errno.
    pub fn error(&mut self, err: Errno) {
        self.buf.truncate(OUT_HEADER_LEN);
        self.buf[4..8].copy_from_slice(&(-err.code()).to_ne_bytes());
        self.sync_len();
    }

    /// Appends a wire struct to the payload.
    pub fn push<T: IntoBytes + Immutable + ?Sized>(&mut self, val: &T) {
        self.buf.extend_from_slice(val.as_bytes());
        self.sync_len();
    }

    /// Appends raw payload bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.sync_len();
    }

    /// Zero-extends the payload to exactly `n` bytes, e.g. as a read target.
    pub(crate) fn grow_data(&mut self, n: usize) {
        self.buf.resize(OUT_HEADER_LEN + n, 0);
        self.sync_len();
    }

    /// Shrinks the payload to `n` bytes (a short read).
    pub(crate) fn truncate_data(&mut self, n: usize) {
        debug_assert!(OUT_HEADER_LEN + n <= self.buf.len());
        self.buf.truncate(OUT_HEADER_LEN + n);
        self.sync_len();
    }

    /// Pointer to the start of the payload region. Stable for the lifetime
    /// of the buffer as long as nothing appends to it.
    pub(crate) fn data_mut_ptr(&mut self) -> *mut u8 {
        debug_assert!(self.buf.len() > OUT_HEADER_LEN);
        unsafe { self.buf.as_mut_ptr().add(OUT_HEADER_LEN) }
    }

    /// The payload after the header.
    pub fn data(&self) -> &[u8] {
        &self.buf[OUT_HEADER_LEN..]
    }

    /// The complete reply in wire format.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The request id this reply answers.
    pub fn unique(&self) -> RequestId {
        RequestId(self.header().unique)
    }

    /// The (negative) error carried in the header; 0 on success.
    pub fn error_code(&self) -> i32 {
        self.header().error
    }
}

const DIRENT_ALIGN: usize = size_of::<u64>();

fn push_padded(reply: &mut ReplyBuf, head: &[u8], name: &[u8]) {
    let entlen = head.len() + name.len();
    let entsize = entlen.next_multiple_of(DIRENT_ALIGN);
    reply.buf.reserve(entsize);
    reply.buf.extend_from_slice(head);
    reply.buf.extend_from_slice(name);
    let newlen = reply.buf.len() + (entsize - entlen);
    reply.buf.resize(newlen, 0);
    reply.sync_len();
}

/// Incrementally fills a readdir reply with `fuse_dirent` records.
#[derive(Debug)]
pub struct DirEntList<'a> {
    reply: &'a mut ReplyBuf,
    max_size: usize,
}

impl<'a> DirEntList<'a> {
    pub fn new(reply: &'a mut ReplyBuf, max_size: usize) -> Self {
        Self { reply, max_size }
    }

    /// Whether any entry has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.reply.data().is_empty()
    }

    /// Appends one entry. Returns true (without writing) once the entry
    /// would overflow the size the kernel asked for.
    #[must_use]
    pub fn push(&mut self, ino: u64, off: u64, typ: u32, name: &OsStr) -> bool {
        let name = name.as_bytes();
        let entsize = (size_of::<abi::fuse_dirent>() + name.len()).next_multiple_of(DIRENT_ALIGN);
        if self.reply.data().len() + entsize > self.max_size {
            return true;
        }
        let header = abi::fuse_dirent {
            ino,
            off,
            namelen: name.len().try_into().expect("name too long"),
            typ,
        };
        push_padded(self.reply, header.as_bytes(), name);
        false
    }
}

/// Incrementally fills a readdirplus reply with `fuse_direntplus` records.
#[derive(Debug)]
pub struct DirEntPlusList<'a> {
    reply: &'a mut ReplyBuf,
    max_size: usize,
}

impl<'a> DirEntPlusList<'a> {
    pub fn new(reply: &'a mut ReplyBuf, max_size: usize) -> Self {
        Self { reply, max_size }
    }

    /// Whether any entry has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.reply.data().is_empty()
    }

    /// Appends one entry with its pre-looked-up `fuse_entry_out`. Returns
    /// true (without writing) once the reply buffer is full; the caller
    /// must then undo the lookup it performed for this entry.
    #[must_use]
    pub fn push(&mut self, entry: &abi::fuse_entry_out, off: u64, name: &OsStr) -> bool {
        let name = name.as_bytes();
        let entsize =
            (size_of::<abi::fuse_direntplus>() + name.len()).next_multiple_of(DIRENT_ALIGN);
        if self.reply.data().len() + entsize > self.max_size {
            return true;
        }
        let header = abi::fuse_direntplus {
            entry_out: *entry,
            dirent: abi::fuse_dirent {
                ino: entry.attr.ino,
                off,
                namelen: name.len().try_into().expect("name too long"),
                typ: entry.attr.mode >> 12,
            },
        };
        push_padded(self.reply, header.as_bytes(), name);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::num::NonZeroI32;

    #[test]
    fn reply_empty() {
        let r = ReplyBuf::new(RequestId(0xdeadbeef));
        assert_eq!(
            r.bytes(),
            &[
                0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00,
                0x00, 0x00, 0x00,
            ],
        );
    }

    #[test]
    fn reply_error() {
        let mut r = ReplyBuf::new(RequestId(0xdeadbeef));
        r.push_bytes(&[1, 2, 3]);
        r.error(Errno(NonZeroI32::new(66).unwrap()));
        assert_eq!(
            r.bytes(),
            &[
                0x10, 0x00, 0x00, 0x00, 0xbe, 0xff, 0xff, 0xff, 0xef, 0xbe, 0xad, 0xde, 0x00,
                0x00, 0x00, 0x00,
            ],
        );
        assert_eq!(r.error_code(), -66);
    }

    #[test]
    fn reply_data() {
        let mut r = ReplyBuf::new(RequestId(0xdeadbeef));
        r.push_bytes(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            r.bytes(),
            &[
                0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00,
                0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
            ],
        );
    }

    #[test]
    fn reply_write_out() {
        let mut r = ReplyBuf::new(RequestId(0xdeadbeef));
        r.push(&abi::fuse_write_out {
            size: 0x1122,
            padding: 0,
        });
        assert_eq!(
            r.bytes(),
            &[
                0x18, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xef, 0xbe, 0xad, 0xde, 0x00,
                0x00, 0x00, 0x00, 0x22, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ],
        );
    }

    #[test]
    fn read_target_grow_and_truncate() {
        let mut r = ReplyBuf::with_data_capacity(RequestId(7), 64);
        r.grow_data(64);
        assert_eq!(r.bytes().len(), OUT_HEADER_LEN + 64);
        r.truncate_data(5);
        assert_eq!(r.bytes().len(), OUT_HEADER_LEN + 5);
        assert_eq!(r.bytes()[0], (OUT_HEADER_LEN + 5) as u8);
    }

    #[test]
    fn dirent_list_padding_and_full() {
        let mut r = ReplyBuf::new(RequestId(0xdeadbeef));
        let mut list = DirEntList::new(&mut r, 80);
        assert!(!list.push(0xaabb, 1, libc::DT_DIR as u32, OsStr::new("hello")));
        assert!(!list.push(0xccdd, 2, libc::DT_REG as u32, OsStr::new("world.rs")));
        // 32 + 32 bytes used, a third entry no longer fits in 80
        assert!(list.push(0xee, 3, libc::DT_REG as u32, OsStr::new("third")));
        let data = r.data();
        assert_eq!(data.len(), 64);
        // entries are 8-byte aligned with zero padding after the name
        assert_eq!(&data[24..32], b"hello\0\0\0");
        assert_eq!(&data[56..64], b"world.rs");
    }

    #[test]
    fn direntplus_carries_entry() {
        let mut r = ReplyBuf::new(RequestId(1));
        let mut list = DirEntPlusList::new(&mut r, 4096);
        let mut entry = abi::fuse_entry_out::default();
        entry.nodeid = 9;
        entry.attr.ino = 42;
        entry.attr.mode = libc::S_IFREG | 0o644;
        assert!(!list.push(&entry, 1, OsStr::new("f")));
        let data = r.data();
        assert_eq!(data.len(), (size_of::<abi::fuse_direntplus>() + 1).next_multiple_of(8));
        // the embedded dirent mirrors the attr's ino and file type
        let dirent_off = size_of::<abi::fuse_entry_out>();
        assert_eq!(&data[dirent_off..dirent_off + 8], &42u64.to_le_bytes());
    }
}
