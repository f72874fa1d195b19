use bytes::{Buf, BufMut};

use crate::{
    id::ColumnId,
    serdes::{CodecError, Decode, Encode},
};

/// Full metadata of one physical table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SsTableMeta {
    /// Schema version the table was merged with.
    pub schema_version: i64,
    /// Number of rows.
    pub row_count: u64,
    /// Data macro blocks.
    pub data_macro_block_cnt: i64,
    /// Macro blocks still in the previous on-disk format.
    pub use_old_macro_block_cnt: i64,
    /// Data micro blocks.
    pub data_micro_block_cnt: i64,
    /// Index macro blocks.
    pub index_macro_block_cnt: i64,
    /// Bytes occupied on disk.
    pub occupy_size: i64,
    /// Bytes before compression.
    pub original_size: i64,
    /// Data checksum.
    pub data_checksum: i64,
    /// Columns physically stored, in storage order.
    pub column_ids: Vec<ColumnId>,
}

impl SsTableMeta {
    pub fn contains_column(&self, column: ColumnId) -> bool {
        self.column_ids.contains(&column)
    }

    pub(crate) fn deep_copy_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.column_ids.len() * std::mem::size_of::<ColumnId>()
    }
}

impl Encode for SsTableMeta {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.schema_version.encode(buf);
        self.row_count.encode(buf);
        self.data_macro_block_cnt.encode(buf);
        self.use_old_macro_block_cnt.encode(buf);
        self.data_micro_block_cnt.encode(buf);
        self.index_macro_block_cnt.encode(buf);
        self.occupy_size.encode(buf);
        self.original_size.encode(buf);
        self.data_checksum.encode(buf);
        self.column_ids.encode(buf);
    }

    fn size(&self) -> usize {
        9 * 8 + self.column_ids.size()
    }
}

impl Decode for SsTableMeta {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            schema_version: i64::decode(buf)?,
            row_count: u64::decode(buf)?,
            data_macro_block_cnt: i64::decode(buf)?,
            use_old_macro_block_cnt: i64::decode(buf)?,
            data_micro_block_cnt: i64::decode(buf)?,
            index_macro_block_cnt: i64::decode(buf)?,
            occupy_size: i64::decode(buf)?,
            original_size: i64::decode(buf)?,
            data_checksum: i64::decode(buf)?,
            column_ids: Vec::<ColumnId>::decode(buf)?,
        })
    }
}
