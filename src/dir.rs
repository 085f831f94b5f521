//! Directory streams for readdir.
//!
//! A [`DirStream`] owns one `DIR` handle obtained from a readable
//! directory descriptor and remembers the cursor after the last entry it
//! delivered. Successive readdir calls at the expected offset then iterate
//! without seeking; only an offset mismatch (the kernel retrying or a
//! second reader on the same handle) triggers a `seekdir`.

use std::ffi::{CStr, OsString};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::RawFd;

use crate::ll::Errno;

/// One raw directory entry as delivered by the backing filesystem.
#[derive(Debug)]
pub struct DirEntryRaw {
    pub ino: u64,
    /// Cursor for resuming the enumeration after this entry.
    pub off: u64,
    pub typ: u32,
    pub name: OsString,
}

impl DirEntryRaw {
    /// `.` and `..` are synthesised by the guest kernel and never relayed.
    pub fn is_dot(&self) -> bool {
        let b = self.name.as_encoded_bytes();
        b == b"." || b == b".."
    }
}

/// A streaming directory iterator with a cached cursor.
#[derive(Debug)]
pub struct DirStream {
    dir: *mut libc::DIR,
    /// Cursor after the last delivered entry (0 = start of directory).
    pub offset: u64,
}

// The raw DIR* is confined to whoever holds the handle's mutex.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Takes ownership of `fd`, a readable directory descriptor. On error
    /// the fd is closed.
    pub fn from_fd(fd: RawFd) -> Result<Self, Errno> {
        let dir = unsafe { libc::fdopendir(fd) };
        if dir.is_null() {
            let err = Errno::last();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self { dir, offset: 0 })
    }

    /// The underlying directory descriptor (owned by the stream).
    pub fn fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dir) }
    }

    /// Moves the stream to `offset`, a cursor previously handed out in a
    /// [`DirEntryRaw::off`], or 0 for the start of the directory.
    pub fn seek(&mut self, offset: u64) {
        unsafe {
            if offset == 0 {
                libc::rewinddir(self.dir);
            } else {
                libc::seekdir(self.dir, offset as libc::c_long);
            }
        }
        self.offset = offset;
    }

    /// Reads the next entry. `None` at end of directory.
    pub fn next(&mut self) -> Option<Result<DirEntryRaw, Errno>> {
        unsafe {
            // readdir signals errors through errno, EOF through NULL
            *libc::__errno_location() = 0;
            let ent = libc::readdir(self.dir);
            if ent.is_null() {
                let raw = *libc::__errno_location();
                if raw != 0 {
                    return Some(Err(Errno::from_raw(raw)));
                }
                return None;
            }
            let ent = &*ent;
            let name = CStr::from_ptr(ent.d_name.as_ptr());
            Some(Ok(DirEntryRaw {
                ino: ent.d_ino,
                off: ent.d_off as u64,
                typ: u32::from(ent.d_type),
                name: OsString::from_vec(name.to_bytes().to_vec()),
            }))
        }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dir) };
    }
}
