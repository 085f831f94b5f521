//! Typed access to request arguments.
//!
//! The byte region after a `fuse_in_header` packs the opcode's argument
//! struct(s), followed by NUL-terminated names and, for writes, the raw
//! payload. [`Arguments`] walks that region front to back and lifts every
//! decode failure into a [`RequestError`], so a malformed frame is
//! answered like any other protocol error instead of unwinding the poll
//! thread. That includes a request buffer without 8-byte alignment, which
//! can only come from a broken HAL integration.

use std::ffi::OsStr;
use std::mem;
use std::os::unix::ffi::OsStrExt;

use zerocopy::error::ConvertError;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::request::RequestError;

/// Cursor over the argument region of one request.
pub struct Arguments<'a> {
    data: &'a [u8],
}

impl<'a> Arguments<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Hands out everything left past the cursor, e.g. a write payload.
    pub fn take_rest(&mut self) -> &'a [u8] {
        mem::take(&mut self.data)
    }

    /// Decodes the next argument struct in place. The cursor only moves on
    /// success.
    pub fn arg<T: FromBytes + KnownLayout + Immutable>(&mut self) -> Result<&'a T, RequestError> {
        match zerocopy::Ref::<_, T>::from_prefix(self.data) {
            Ok((arg, rest)) => {
                self.data = rest;
                Ok(zerocopy::Ref::into_ref(arg))
            }
            Err(ConvertError::Size(_)) => Err(RequestError::InsufficientData),
            Err(ConvertError::Alignment(_)) => Err(RequestError::UnalignedBuffer),
            Err(ConvertError::Validity(infallible)) => match infallible {},
        }
    }

    /// Decodes `count` consecutive records of the same type, as sent by
    /// batch-forget.
    pub fn arg_slice<T: FromBytes + Immutable>(
        &mut self,
        count: usize,
    ) -> Result<&'a [T], RequestError> {
        match zerocopy::Ref::<_, [T]>::from_prefix_with_elems(self.data, count) {
            Ok((args, rest)) => {
                self.data = rest;
                Ok(zerocopy::Ref::into_ref(args))
            }
            Err(ConvertError::Size(_)) => Err(RequestError::InsufficientData),
            Err(ConvertError::Alignment(_)) => Err(RequestError::UnalignedBuffer),
            Err(ConvertError::Validity(infallible)) => match infallible {},
        }
    }

    /// Decodes the next NUL-terminated name. Names are arbitrary bytes;
    /// no UTF-8 requirement.
    pub fn name(&mut self) -> Result<&'a OsStr, RequestError> {
        let len = memchr::memchr(0, self.data).ok_or(RequestError::InsufficientData)?;
        let (name, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Ok(OsStr::from_bytes(name))
    }
}
