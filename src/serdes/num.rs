use std::mem::size_of;

use bytes::{Buf, BufMut};

use super::{ensure_remaining, CodecError, Decode, Encode};

macro_rules! implement_encode_decode {
    ($ty:ty, $put:ident, $get:ident) => {
        impl Encode for $ty {
            fn encode<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }

            fn size(&self) -> usize {
                size_of::<Self>()
            }
        }

        impl Decode for $ty {
            fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
                ensure_remaining(buf, size_of::<Self>())?;
                Ok(buf.$get())
            }
        }
    };
}

implement_encode_decode!(u8, put_u8, get_u8);
implement_encode_decode!(u16, put_u16_le, get_u16_le);
implement_encode_decode!(u32, put_u32_le, get_u32_le);
implement_encode_decode!(u64, put_u64_le, get_u64_le);
implement_encode_decode!(i32, put_i32_le, get_i32_le);
implement_encode_decode!(i64, put_i64_le, get_i64_le);
