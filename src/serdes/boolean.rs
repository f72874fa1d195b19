use std::mem::size_of;

use bytes::{Buf, BufMut};

use super::{CodecError, Decode, Encode};

impl Encode for bool {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        u8::from(*self).encode(buf)
    }

    fn size(&self) -> usize {
        size_of::<u8>()
    }
}

impl Decode for bool {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidTag {
                what: "bool",
                tag: i64::from(other),
            }),
        }
    }
}
