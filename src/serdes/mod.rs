//! Fixed-layout binary encoding for persisted metadata.
//!
//! Everything is little endian with no framing or version tags. Callers size
//! buffers with [`Encode::size`] before writing.

mod boolean;
mod num;
mod vec;

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Errors raised while decoding a byte layout.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ended before the value was complete.
    #[error("buffer too short: need {needed} bytes, {remaining} remaining")]
    ShortBuffer { needed: usize, remaining: usize },
    /// A tag or discriminant held an unknown value.
    #[error("invalid {what} tag {tag}")]
    InvalidTag { what: &'static str, tag: i64 },
    /// A decoded count disagrees with the number of encoded items.
    #[error("{what} count {expected} does not match {actual} decoded")]
    CountMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

pub trait Encode {
    fn encode<B: BufMut>(&self, buf: &mut B);

    fn size(&self) -> usize;
}

impl<T: Encode> Encode for &T {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        Encode::encode(*self, buf)
    }

    fn size(&self) -> usize {
        Encode::size(*self)
    }
}

pub trait Decode: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError>;
}

pub(crate) fn ensure_remaining<B: Buf>(buf: &B, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::ShortBuffer {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}
