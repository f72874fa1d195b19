//! Physical, immutable, versioned tables.
//!
//! An [`SsTable`] is either a row-store table or one column group of a
//! composite columnar table. It may be resident (metadata loaded) or a shell
//! that only carries its key, metadata address and macro block list until a
//! [`block::TableStoreLoader`] materializes it.

pub mod block;
pub(crate) mod macro_ref;
mod meta;

use std::{fmt, mem::size_of, sync::Arc};

use bytes::{Buf, BufMut};
pub use meta::SsTableMeta;

use self::{block::BlockRefManager, macro_ref::MacroRefGuard};
use crate::{
    access::{
        ColumnSource, RowFetchIter, RowSource, Rowkey, RowkeyRange, StoreRowIterator,
        TableAccessContext, TableIterParam,
    },
    error::{StorageError, StorageResult},
    id::{MacroBlockId, TableKey, TableType, TabletId},
    serdes::{CodecError, Decode, Encode},
};

/// Where a table's metadata lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MetaDiskAddr {
    /// Not resolved yet; the table has not been persisted.
    #[default]
    None,
    /// Only in memory.
    Memory,
    /// Persisted inside a macro block.
    Block {
        /// Block holding the metadata.
        macro_id: MacroBlockId,
        /// Byte offset inside the block.
        offset: u32,
        /// Byte length of the metadata.
        size: u32,
    },
}

impl MetaDiskAddr {
    /// Whether the address points at persisted metadata.
    pub fn is_disk(&self) -> bool {
        matches!(self, Self::Block { .. })
    }

    /// Whether the address has been resolved at all.
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl Encode for MacroBlockId {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.raw().encode(buf)
    }

    fn size(&self) -> usize {
        size_of::<u64>()
    }
}

impl Decode for MacroBlockId {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(MacroBlockId::new(u64::decode(buf)?))
    }
}

impl Encode for MetaDiskAddr {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::None => 0u8.encode(buf),
            Self::Memory => 1u8.encode(buf),
            Self::Block {
                macro_id,
                offset,
                size,
            } => {
                2u8.encode(buf);
                macro_id.encode(buf);
                offset.encode(buf);
                size.encode(buf);
            }
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::None | Self::Memory => 1,
            Self::Block { .. } => 1 + 8 + 4 + 4,
        }
    }
}

impl Decode for MetaDiskAddr {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        match u8::decode(buf)? {
            0 => Ok(Self::None),
            1 => Ok(Self::Memory),
            2 => Ok(Self::Block {
                macro_id: MacroBlockId::decode(buf)?,
                offset: u32::decode(buf)?,
                size: u32::decode(buf)?,
            }),
            tag => Err(CodecError::InvalidTag {
                what: "meta disk addr",
                tag: i64::from(tag),
            }),
        }
    }
}

impl Encode for TableKey {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.tablet_id.raw().encode(buf);
        (self.table_type as u8).encode(buf);
        self.column_group_idx.encode(buf);
        self.snapshot_version.encode(buf);
    }

    fn size(&self) -> usize {
        8 + 1 + 2 + 8
    }
}

impl Decode for TableKey {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let tablet_id = TabletId::new(u64::decode(buf)?);
        let raw_type = u8::decode(buf)?;
        let table_type = TableType::from_raw(raw_type).ok_or(CodecError::InvalidTag {
            what: "table type",
            tag: i64::from(raw_type),
        })?;
        Ok(TableKey {
            tablet_id,
            table_type,
            column_group_idx: u16::decode(buf)?,
            snapshot_version: i64::decode(buf)?,
        })
    }
}

/// Parameters for creating a physical table, and for initializing the base of
/// a composite columnar table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateSsTableParam {
    pub table_key: TableKey,
    pub meta: SsTableMeta,
    pub addr: MetaDiskAddr,
    pub macro_ids: Vec<MacroBlockId>,
    /// Raw composite base type; see `column_store::CoBaseType`.
    pub co_base_type: i32,
    pub column_group_cnt: u32,
    pub full_column_cnt: u32,
    pub is_empty_co_table: bool,
}

impl CreateSsTableParam {
    /// Parameters for a plain, memory-resident table.
    pub fn new(table_key: TableKey, meta: SsTableMeta) -> Self {
        let full_column_cnt = meta.column_ids.len() as u32;
        Self {
            table_key,
            meta,
            addr: MetaDiskAddr::Memory,
            macro_ids: Vec::new(),
            co_base_type: 0,
            column_group_cnt: 1,
            full_column_cnt,
            is_empty_co_table: false,
        }
    }

    pub fn with_macro_ids(mut self, macro_ids: Vec<MacroBlockId>) -> Self {
        self.macro_ids = macro_ids;
        self
    }

    pub fn with_addr(mut self, addr: MetaDiskAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Describe the composite layout this table is the base of.
    pub fn with_column_groups(
        mut self,
        co_base_type: i32,
        column_group_cnt: u32,
        full_column_cnt: u32,
    ) -> Self {
        self.co_base_type = co_base_type;
        self.column_group_cnt = column_group_cnt;
        self.full_column_cnt = full_column_cnt;
        self
    }

    /// Mark the composite table as an empty placeholder.
    pub fn with_empty_co_table(mut self, is_empty: bool) -> Self {
        self.is_empty_co_table = is_empty;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.table_key.snapshot_version > 0 && self.meta.schema_version >= 0
    }
}

/// A physical table.
#[derive(Clone, PartialEq, Eq)]
pub struct SsTable {
    key: TableKey,
    addr: MetaDiskAddr,
    macro_ids: Vec<MacroBlockId>,
    meta: Option<Arc<SsTableMeta>>,
}

impl SsTable {
    /// Create a resident table.
    pub fn new(param: &CreateSsTableParam) -> StorageResult<Self> {
        if !param.is_valid() {
            return Err(StorageError::invalid(format!(
                "invalid sstable param for {}",
                param.table_key
            )));
        }
        Ok(Self {
            key: param.table_key,
            addr: param.addr,
            macro_ids: param.macro_ids.clone(),
            meta: Some(Arc::new(param.meta.clone())),
        })
    }

    /// Create a non-resident table whose metadata lives at `addr`.
    pub fn shell(key: TableKey, addr: MetaDiskAddr, macro_ids: Vec<MacroBlockId>) -> Self {
        Self {
            key,
            addr,
            macro_ids,
            meta: None,
        }
    }

    pub fn key(&self) -> &TableKey {
        &self.key
    }

    pub fn addr(&self) -> &MetaDiskAddr {
        &self.addr
    }

    /// Rewrite the metadata address once the table has been persisted.
    pub fn set_addr(&mut self, addr: MetaDiskAddr) -> StorageResult<()> {
        if !addr.is_valid() {
            return Err(StorageError::invalid(format!(
                "cannot set unresolved address on {}",
                self.key
            )));
        }
        self.addr = addr;
        Ok(())
    }

    pub fn macro_ids(&self) -> &[MacroBlockId] {
        &self.macro_ids
    }

    pub fn snapshot_version(&self) -> i64 {
        self.key.snapshot_version
    }

    pub fn is_loaded(&self) -> bool {
        self.meta.is_some()
    }

    /// A table is readable as a plain row table once its metadata is resident.
    pub fn is_valid_for_reading(&self) -> bool {
        self.is_loaded()
    }

    pub fn is_rowkey_cg(&self) -> bool {
        self.key.is_rowkey_cg()
    }

    /// Full metadata, available only when resident.
    pub fn meta(&self) -> StorageResult<&SsTableMeta> {
        self.meta
            .as_deref()
            .ok_or_else(|| StorageError::not_init(format!("sstable {} is not loaded", self.key)))
    }

    /// Pin every macro block of this table, all or nothing.
    pub fn inc_macro_ref(&self, manager: &dyn BlockRefManager) -> StorageResult<()> {
        let mut guard = MacroRefGuard::new(manager);
        self.acquire_macro_refs(&mut guard)?;
        guard.commit();
        Ok(())
    }

    pub(crate) fn acquire_macro_refs(&self, guard: &mut MacroRefGuard<'_>) -> StorageResult<()> {
        guard.acquire_all(self.macro_ids.iter())
    }

    /// Unpin every macro block of this table.
    pub fn dec_macro_ref(&self, manager: &dyn BlockRefManager) {
        for id in self.macro_ids.iter().rev() {
            manager.dec_ref(*id);
        }
    }

    /// Point lookup through this table alone.
    pub fn get(
        self: &Arc<Self>,
        param: &TableIterParam,
        ctx: &TableAccessContext,
        rowkey: &Rowkey,
    ) -> StorageResult<Box<dyn StoreRowIterator>> {
        self.check_read(param)?;
        if rowkey.is_empty() {
            return Err(StorageError::invalid("empty rowkey"));
        }
        self.open_rows(param, ctx, vec![RowSource::Key(rowkey.clone())])
    }

    pub fn multi_get(
        self: &Arc<Self>,
        param: &TableIterParam,
        ctx: &TableAccessContext,
        rowkeys: &[Rowkey],
    ) -> StorageResult<Box<dyn StoreRowIterator>> {
        self.check_read(param)?;
        if rowkeys.is_empty() || rowkeys.iter().any(Vec::is_empty) {
            return Err(StorageError::invalid("empty rowkey list"));
        }
        let sources = rowkeys.iter().cloned().map(RowSource::Key).collect();
        self.open_rows(param, ctx, sources)
    }

    pub fn scan(
        self: &Arc<Self>,
        param: &TableIterParam,
        ctx: &TableAccessContext,
        range: &RowkeyRange,
    ) -> StorageResult<Box<dyn StoreRowIterator>> {
        self.check_read(param)?;
        if !range.is_valid() {
            return Err(StorageError::invalid("inverted rowkey range"));
        }
        self.open_rows(param, ctx, vec![RowSource::Range(range.clone())])
    }

    pub fn multi_scan(
        self: &Arc<Self>,
        param: &TableIterParam,
        ctx: &TableAccessContext,
        ranges: &[RowkeyRange],
    ) -> StorageResult<Box<dyn StoreRowIterator>> {
        self.check_read(param)?;
        if ranges.is_empty() || ranges.iter().any(|range| !range.is_valid()) {
            return Err(StorageError::invalid("empty or inverted rowkey ranges"));
        }
        let sources = ranges.iter().cloned().map(RowSource::Range).collect();
        self.open_rows(param, ctx, sources)
    }

    fn check_read(&self, param: &TableIterParam) -> StorageResult<()> {
        if !self.is_valid_for_reading() {
            return Err(StorageError::not_init(format!(
                "sstable {} is not ready for reading",
                self.key
            )));
        }
        if param.tablet_id != self.key.tablet_id {
            tracing::error!(table = %self.key, requested = %param.tablet_id, "tablet id does not match");
            return Err(StorageError::internal(format!(
                "tablet id {} does not match {}",
                param.tablet_id, self.key
            )));
        }
        if !param.is_valid() {
            return Err(StorageError::invalid("invalid table iter param"));
        }
        Ok(())
    }

    fn open_rows(
        self: &Arc<Self>,
        param: &TableIterParam,
        ctx: &TableAccessContext,
        sources: Vec<RowSource>,
    ) -> StorageResult<Box<dyn StoreRowIterator>> {
        let meta = self.meta()?;
        let columns = param
            .read_info
            .out_cols
            .iter()
            .enumerate()
            .filter(|(_, col)| meta.contains_column(**col))
            .map(|(pos, col)| (pos, *col))
            .collect();
        Ok(Box::new(RowFetchIter::new(
            Arc::clone(&ctx.reader),
            Arc::clone(self),
            vec![ColumnSource {
                table: Arc::clone(self),
                columns,
            }],
            param.read_info.out_cols.len(),
            param.batch_size,
            sources,
        )))
    }

    /// Metadata is embedded unless it has been persisted at its own address.
    fn embeds_meta(&self) -> bool {
        self.meta.is_some() && !self.addr.is_disk()
    }

    pub(crate) fn encoded_size(&self, full: bool) -> usize {
        let mut len = self.key.size() + self.addr.size() + self.macro_ids.size() + 1;
        if full || self.embeds_meta() {
            len += self.meta.as_ref().map_or(0, |meta| meta.size());
        }
        len
    }

    /// Normal form: metadata embedded only while it has no address of its own.
    pub(crate) fn encode_normal<B: BufMut>(&self, buf: &mut B) {
        self.encode_with_meta(buf, self.embeds_meta());
    }

    /// Full form: metadata always embedded.
    pub(crate) fn encode_full<B: BufMut>(&self, buf: &mut B) -> StorageResult<()> {
        if self.meta.is_none() {
            return Err(StorageError::not_init(format!(
                "full serialization of non-resident sstable {}",
                self.key
            )));
        }
        self.encode_with_meta(buf, true);
        Ok(())
    }

    fn encode_with_meta<B: BufMut>(&self, buf: &mut B, with_meta: bool) {
        self.key.encode(buf);
        self.addr.encode(buf);
        self.macro_ids.encode(buf);
        let meta = self.meta.as_ref().filter(|_| with_meta);
        meta.is_some().encode(buf);
        if let Some(meta) = meta {
            meta.encode(buf);
        }
    }

    pub(crate) fn decode_from<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let key = TableKey::decode(buf)?;
        let addr = MetaDiskAddr::decode(buf)?;
        let macro_ids = Vec::<MacroBlockId>::decode(buf)?;
        let meta = if bool::decode(buf)? {
            Some(Arc::new(SsTableMeta::decode(buf)?))
        } else {
            None
        };
        Ok(Self {
            key,
            addr,
            macro_ids,
            meta,
        })
    }

    /// Serialized length for [`SsTable::serialize`].
    pub fn get_serialize_size(&self) -> usize {
        self.encoded_size(false)
    }

    pub fn serialize<B: BufMut>(&self, buf: &mut B) -> StorageResult<()> {
        let len = self.get_serialize_size();
        if buf.remaining_mut() < len {
            return Err(StorageError::invalid(format!(
                "buffer has {} bytes, {len} needed",
                buf.remaining_mut()
            )));
        }
        self.encode_normal(buf);
        Ok(())
    }

    pub fn deserialize<B: Buf>(buf: &mut B) -> StorageResult<Self> {
        Ok(Self::decode_from(buf)?)
    }

    /// Clone with freshly allocated metadata.
    pub(crate) fn deep_clone(&self) -> Self {
        Self {
            key: self.key,
            addr: self.addr,
            macro_ids: self.macro_ids.clone(),
            meta: self.meta.as_ref().map(|meta| Arc::new(SsTableMeta::clone(meta))),
        }
    }

    pub(crate) fn deep_copy_size(&self) -> usize {
        size_of::<Self>()
            + self.macro_ids.len() * size_of::<MacroBlockId>()
            + self.meta.as_ref().map_or(0, |meta| meta.deep_copy_size())
    }
}

impl fmt::Debug for SsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsTable")
            .field("key", &self.key)
            .field("addr", &self.addr)
            .field("macro_blocks", &self.macro_ids.len())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
