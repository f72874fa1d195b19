use std::mem::size_of;

use bytes::{Buf, BufMut};

use super::{CodecError, Decode, Encode};

impl<T> Decode for Vec<T>
where
    T: Decode,
{
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let len = u32::decode(buf)? as usize;
        // Each element takes at least one byte, so a longer length is corrupt.
        let mut items = Vec::with_capacity(len.min(buf.remaining()));

        for _ in 0..len {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl<T> Encode for Vec<T>
where
    T: Encode,
{
    fn encode<B: BufMut>(&self, buf: &mut B) {
        (self.len() as u32).encode(buf);

        for item in self {
            item.encode(buf);
        }
    }

    fn size(&self) -> usize {
        self.iter().map(|item| item.size()).sum::<usize>() + size_of::<u32>()
    }
}
