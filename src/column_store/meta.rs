use bytes::{Buf, BufMut};

use crate::{
    serdes::{CodecError, Decode, Encode},
    sstable::SsTableMeta,
};

/// Aggregated metadata of a composite table, summed over every column group
/// including the base.
///
/// The checksum is a plain wrapping sum, so swapping two column groups with
/// equal per-group checksums goes undetected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoSsTableMeta {
    pub data_macro_block_cnt: i64,
    pub use_old_macro_block_cnt: i64,
    pub data_micro_block_cnt: i64,
    pub index_macro_block_cnt: i64,
    pub occupy_size: i64,
    pub original_size: i64,
    pub data_checksum: i64,
    pub column_group_cnt: u32,
    pub full_column_cnt: u32,
}

impl CoSsTableMeta {
    pub(crate) fn accumulate(&mut self, meta: &SsTableMeta) {
        self.data_macro_block_cnt = self
            .data_macro_block_cnt
            .wrapping_add(meta.data_macro_block_cnt);
        self.use_old_macro_block_cnt = self
            .use_old_macro_block_cnt
            .wrapping_add(meta.use_old_macro_block_cnt);
        self.data_micro_block_cnt = self
            .data_micro_block_cnt
            .wrapping_add(meta.data_micro_block_cnt);
        self.index_macro_block_cnt = self
            .index_macro_block_cnt
            .wrapping_add(meta.index_macro_block_cnt);
        self.occupy_size = self.occupy_size.wrapping_add(meta.occupy_size);
        self.original_size = self.original_size.wrapping_add(meta.original_size);
        self.data_checksum = self.data_checksum.wrapping_add(meta.data_checksum);
    }

    /// Reset the summed fields, keeping the column counts.
    pub(crate) fn clear_sums(&mut self) {
        *self = Self {
            column_group_cnt: self.column_group_cnt,
            full_column_cnt: self.full_column_cnt,
            ..Self::default()
        };
    }
}

impl Encode for CoSsTableMeta {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.data_macro_block_cnt.encode(buf);
        self.use_old_macro_block_cnt.encode(buf);
        self.data_micro_block_cnt.encode(buf);
        self.index_macro_block_cnt.encode(buf);
        self.occupy_size.encode(buf);
        self.original_size.encode(buf);
        self.data_checksum.encode(buf);
        self.column_group_cnt.encode(buf);
        self.full_column_cnt.encode(buf);
    }

    fn size(&self) -> usize {
        7 * 8 + 2 * 4
    }
}

impl Decode for CoSsTableMeta {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            data_macro_block_cnt: i64::decode(buf)?,
            use_old_macro_block_cnt: i64::decode(buf)?,
            data_micro_block_cnt: i64::decode(buf)?,
            index_macro_block_cnt: i64::decode(buf)?,
            occupy_size: i64::decode(buf)?,
            original_size: i64::decode(buf)?,
            data_checksum: i64::decode(buf)?,
            column_group_cnt: u32::decode(buf)?,
            full_column_cnt: u32::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_fixed_little_endian() {
        let meta = CoSsTableMeta {
            data_macro_block_cnt: 1,
            data_checksum: -2,
            column_group_cnt: 3,
            full_column_cnt: 0x0102_0304,
            ..Default::default()
        };
        let mut bytes = Vec::new();
        meta.encode(&mut bytes);
        assert_eq!(bytes.len(), meta.size());
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[0..8], &1i64.to_le_bytes());
        assert_eq!(&bytes[48..56], &(-2i64).to_le_bytes());
        assert_eq!(&bytes[56..60], &3u32.to_le_bytes());
        assert_eq!(&bytes[60..64], &[4, 3, 2, 1]);
        assert_eq!(CoSsTableMeta::decode(&mut bytes.as_slice()).unwrap(), meta);
    }

    #[test]
    fn checksum_is_an_order_insensitive_sum() {
        let a = SsTableMeta {
            data_checksum: i64::MAX,
            ..Default::default()
        };
        let b = SsTableMeta {
            data_checksum: 5,
            ..Default::default()
        };
        let mut ab = CoSsTableMeta::default();
        ab.accumulate(&a);
        ab.accumulate(&b);
        let mut ba = CoSsTableMeta::default();
        ba.accumulate(&b);
        ba.accumulate(&a);
        assert_eq!(ab.data_checksum, ba.data_checksum);
        assert_eq!(ab.data_checksum, i64::MAX.wrapping_add(5));
    }
}
