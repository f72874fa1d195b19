use std::{mem::size_of, sync::Arc};

use bytes::{Buf, BufMut};

use super::{
    arena::{MetaArena, MetaHandle},
    cg_array::CgSsTableArray,
    meta::CoSsTableMeta,
    row_iter::CoRowIterator,
    scanner::{CgIterator, CgScanShape, CgScanSource, CgScanner, CgScannerKind},
    wrapper::CgTableWrapper,
};
use crate::{
    access::{RowSource, Rowkey, RowkeyRange, StoreRowIterator, TableAccessContext, TableIterParam},
    error::{StorageError, StorageResult},
    id::{TableKey, TableType, TabletId},
    serdes::{CodecError, Decode, Encode},
    sstable::{
        block::{BlockRefManager, TableStoreLoader},
        macro_ref::MacroRefGuard,
        CreateSsTableParam, MetaDiskAddr, SsTable,
    },
};

/// What the base table of a composite table stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CoBaseType {
    /// Every column, so the base alone can serve row reads.
    AllColumns = 1,
    /// Rowkey columns only.
    RowkeyOnly = 2,
}

impl CoBaseType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::AllColumns),
            2 => Some(Self::RowkeyOnly),
            _ => None,
        }
    }
}

/// Composite columnar table: a base physical table plus one physical
/// sub-table per remaining column group.
///
/// Built in two phases. [`CoSsTable::init`] makes the base readable as a
/// plain row table and reserves the column group slots;
/// [`CoSsTable::fill_column_groups`] supplies the sub-tables and makes the
/// table readable in column-store mode. An empty table is column-store
/// readable right after `init` and never holds sub-tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoSsTable {
    base: Arc<SsTable>,
    cg_sstables: CgSsTableArray,
    cs_meta: CoSsTableMeta,
    base_type: Option<CoBaseType>,
    is_empty_co: bool,
    valid_for_cs_reading: bool,
}

impl Default for CoSsTable {
    fn default() -> Self {
        let key = TableKey::new(TabletId::default(), TableType::CoMajor, 0, 0);
        Self {
            base: Arc::new(SsTable::shell(key, MetaDiskAddr::None, Vec::new())),
            cg_sstables: CgSsTableArray::default(),
            cs_meta: CoSsTableMeta::default(),
            base_type: None,
            is_empty_co: false,
            valid_for_cs_reading: false,
        }
    }
}

impl CoSsTable {
    /// Initialize the base table and reserve `column_group_cnt - 1` slots.
    pub fn init(&mut self, param: &CreateSsTableParam) -> StorageResult<()> {
        if self.base.is_valid_for_reading() || self.valid_for_cs_reading {
            return Err(StorageError::AlreadyInitialized(format!(
                "co sstable {} is already initialized",
                self.base.key()
            )));
        }
        let Some(base_type) = CoBaseType::from_raw(param.co_base_type) else {
            return Err(StorageError::invalid(format!(
                "unknown co base type {}",
                param.co_base_type
            )));
        };
        if param.column_group_cnt <= 1 {
            return Err(StorageError::invalid(format!(
                "co sstable needs more than one column group, got {}",
                param.column_group_cnt
            )));
        }
        let base = SsTable::new(param)?;
        let mut cg_sstables = CgSsTableArray::default();
        let mut cs_meta = CoSsTableMeta {
            full_column_cnt: param.full_column_cnt,
            ..Default::default()
        };
        if param.is_empty_co_table {
            cs_meta.column_group_cnt = param.column_group_cnt;
        } else {
            cg_sstables.reserve(param.column_group_cnt as usize - 1)?;
        }

        self.base = Arc::new(base);
        self.cg_sstables = cg_sstables;
        self.cs_meta = cs_meta;
        self.base_type = Some(base_type);
        self.is_empty_co = param.is_empty_co_table;
        self.valid_for_cs_reading = param.is_empty_co_table;
        Ok(())
    }

    /// Supply the column group sub-tables, in logical order with the base
    /// left out. At most once.
    pub fn fill_column_groups(&mut self, tables: Vec<Arc<SsTable>>) -> StorageResult<()> {
        if !self.base.is_valid_for_reading()
            || self.valid_for_cs_reading
            || self.cg_sstables.count() == 0
            || self.is_empty_co
        {
            return Err(StorageError::state(format!(
                "co sstable {} cannot take column groups (readable: {}, cs readable: {}, slots: {}, empty: {})",
                self.base.key(),
                self.base.is_valid_for_reading(),
                self.valid_for_cs_reading,
                self.cg_sstables.count(),
                self.is_empty_co
            )));
        }
        let mut cg_sstables = self.cg_sstables.clone();
        cg_sstables.fill(tables)?;
        let cs_meta = self.build_cs_meta(&cg_sstables)?;

        self.cg_sstables = cg_sstables;
        self.cs_meta = cs_meta;
        self.valid_for_cs_reading = true;
        tracing::info!(
            table = %self.base.key(),
            column_groups = self.cs_meta.column_group_cnt,
            "co sstable ready for column store reads"
        );
        Ok(())
    }

    fn build_cs_meta(&self, cg_sstables: &CgSsTableArray) -> StorageResult<CoSsTableMeta> {
        let base_meta = self.base.meta()?;
        let mut cs_meta = self.cs_meta;
        cs_meta.clear_sums();
        cs_meta.column_group_cnt = cg_sstables.count() as u32 + 1;

        for table in cg_sstables.iter().chain(std::iter::once(&self.base)) {
            if table.is_rowkey_cg() && self.base_type == Some(CoBaseType::RowkeyOnly) {
                return Err(self.mismatch(table, "rowkey column group under a rowkey-only base"));
            }
            if table.snapshot_version() != self.base.snapshot_version() {
                return Err(self.mismatch(table, "snapshot version differs from base"));
            }
            let meta = table.meta()?;
            if meta.schema_version != base_meta.schema_version {
                return Err(self.mismatch(table, "schema version differs from base"));
            }
            if meta.row_count != base_meta.row_count {
                return Err(self.mismatch(table, "row count differs from base"));
            }
            cs_meta.accumulate(meta);
        }
        Ok(cs_meta)
    }

    fn mismatch(&self, table: &SsTable, what: &str) -> StorageError {
        tracing::error!(base = %self.base.key(), cg = %table.key(), "{what}");
        StorageError::internal(format!("{}: {what} ({})", table.key(), self.base.key()))
    }

    pub fn key(&self) -> &TableKey {
        self.base.key()
    }

    /// The base table, which is this table's own physical identity.
    pub fn base(&self) -> &Arc<SsTable> {
        &self.base
    }

    pub fn cs_meta(&self) -> &CoSsTableMeta {
        &self.cs_meta
    }

    pub fn base_type(&self) -> Option<CoBaseType> {
        self.base_type
    }

    pub fn is_empty_co(&self) -> bool {
        self.is_empty_co
    }

    pub fn is_cs_valid(&self) -> bool {
        self.valid_for_cs_reading
    }

    pub fn is_all_cg_base(&self) -> bool {
        self.base_type == Some(CoBaseType::AllColumns)
    }

    pub fn column_group_cnt(&self) -> u32 {
        self.cs_meta.column_group_cnt
    }

    pub fn cg_sstables(&self) -> &CgSsTableArray {
        &self.cg_sstables
    }

    /// Resolve a logical column group index to its physical table.
    ///
    /// The base sits at its own key's index; lower indices map straight into
    /// the sub-table array and higher ones shift down by one.
    pub fn get_column_group(&self, cg_idx: u32) -> StorageResult<&Arc<SsTable>> {
        if !self.valid_for_cs_reading {
            return Err(StorageError::not_init(format!(
                "co sstable {} is not ready for column store reads",
                self.key()
            )));
        }
        if cg_idx >= self.cs_meta.column_group_cnt {
            return Err(StorageError::invalid(format!(
                "column group {cg_idx} out of {}",
                self.cs_meta.column_group_cnt
            )));
        }
        let base_idx = self.key().column_group_id();
        if cg_idx == base_idx {
            return Ok(&self.base);
        }
        if self.is_empty_co {
            return Err(StorageError::state(format!(
                "empty co sstable {} has no column group {cg_idx}",
                self.key()
            )));
        }
        let pos = if cg_idx < base_idx {
            cg_idx as usize
        } else {
            cg_idx as usize - 1
        };
        self.cg_sstables.get(pos).ok_or_else(|| {
            StorageError::internal(format!("column group {cg_idx} slot {pos} is vacant"))
        })
    }

    /// Like [`CoSsTable::get_column_group`], with out-of-range indices
    /// resolving to the base. Loads full metadata through `loader` only when
    /// `need_meta` is set and the table is not resident.
    pub fn fetch_column_group(
        &self,
        cg_idx: u32,
        need_meta: bool,
        loader: &dyn TableStoreLoader,
    ) -> StorageResult<CgTableWrapper> {
        let base_idx = self.key().column_group_id();
        let real_idx = if cg_idx < self.cs_meta.column_group_cnt {
            cg_idx
        } else {
            base_idx
        };
        if self.is_empty_co && real_idx != base_idx {
            return Err(StorageError::state(format!(
                "empty co sstable {} cannot fetch column group {cg_idx}",
                self.key()
            )));
        }
        let table = Arc::clone(self.get_column_group(real_idx)?);
        let meta_handle = if need_meta && !table.is_loaded() {
            Some(loader.load_sstable(table.addr())?)
        } else {
            None
        };
        Ok(CgTableWrapper {
            cg_sstable: Some(table),
            meta_handle,
            need_meta,
        })
    }

    /// Every physical table in logical column group order; just the base
    /// for an empty table.
    pub fn get_all_tables(&self) -> StorageResult<Vec<Arc<SsTable>>> {
        if self.is_empty_co {
            return Ok(vec![Arc::clone(&self.base)]);
        }
        (0..=self.cg_sstables.count() as u32)
            .map(|idx| self.get_column_group(idx).map(Arc::clone))
            .collect()
    }

    fn check_row_read(&self, param: &TableIterParam) -> StorageResult<()> {
        if !self.valid_for_cs_reading {
            return Err(StorageError::not_init(format!(
                "co sstable {} is not ready for reading",
                self.key()
            )));
        }
        if param.tablet_id != self.key().tablet_id {
            tracing::error!(table = %self.key(), requested = %param.tablet_id, "tablet id does not match");
            return Err(StorageError::internal(format!(
                "tablet id {} does not match {}",
                param.tablet_id,
                self.key()
            )));
        }
        if !param.is_valid() {
            return Err(StorageError::invalid("invalid table iter param"));
        }
        Ok(())
    }

    fn open_fan_out(
        &self,
        param: &TableIterParam,
        ctx: &TableAccessContext,
        sources: Vec<RowSource>,
    ) -> StorageResult<Box<dyn StoreRowIterator>> {
        let iter = CoRowIterator::open(self, param, ctx, sources).map_err(|err| {
            tracing::warn!(table = %self.key(), error = %err, "failed to open co row iterator");
            err
        })?;
        Ok(Box::new(iter))
    }

    pub fn get(
        &self,
        param: &TableIterParam,
        ctx: &TableAccessContext,
        rowkey: &Rowkey,
    ) -> StorageResult<Box<dyn StoreRowIterator>> {
        self.check_row_read(param)?;
        if rowkey.is_empty() {
            return Err(StorageError::invalid("empty rowkey"));
        }
        if param.read_info.is_access_rowkey_only() || self.is_all_cg_base() {
            return self.base.get(param, ctx, rowkey);
        }
        self.open_fan_out(param, ctx, vec![RowSource::Key(rowkey.clone())])
    }

    pub fn multi_get(
        &self,
        param: &TableIterParam,
        ctx: &TableAccessContext,
        rowkeys: &[Rowkey],
    ) -> StorageResult<Box<dyn StoreRowIterator>> {
        self.check_row_read(param)?;
        if rowkeys.is_empty() || rowkeys.iter().any(Vec::is_empty) {
            return Err(StorageError::invalid("empty rowkey list"));
        }
        if param.read_info.is_access_rowkey_only() || self.is_all_cg_base() {
            return self.base.multi_get(param, ctx, rowkeys);
        }
        let sources = rowkeys.iter().cloned().map(RowSource::Key).collect();
        self.open_fan_out(param, ctx, sources)
    }

    pub fn scan(
        &self,
        param: &TableIterParam,
        ctx: &TableAccessContext,
        range: &RowkeyRange,
    ) -> StorageResult<Box<dyn StoreRowIterator>> {
        self.check_row_read(param)?;
        if !range.is_valid() {
            return Err(StorageError::invalid("inverted rowkey range"));
        }
        if ctx.query_flag.daily_merge || (!param.use_column_store && self.is_all_cg_base()) {
            return self.base.scan(param, ctx, range);
        }
        self.open_fan_out(param, ctx, vec![RowSource::Range(range.clone())])
    }

    pub fn multi_scan(
        &self,
        param: &TableIterParam,
        ctx: &TableAccessContext,
        ranges: &[RowkeyRange],
    ) -> StorageResult<Box<dyn StoreRowIterator>> {
        self.check_row_read(param)?;
        if ranges.is_empty() || ranges.iter().any(|range| !range.is_valid()) {
            return Err(StorageError::invalid("empty or inverted rowkey ranges"));
        }
        if !param.use_column_store && self.is_all_cg_base() {
            return self.base.multi_scan(param, ctx, ranges);
        }
        let sources = ranges.iter().cloned().map(RowSource::Range).collect();
        self.open_fan_out(param, ctx, sources)
    }

    /// Open a scanner over column group `param.cg_idx`, reusing the pooled
    /// one for that group. A pooled scanner of another strategy is replaced.
    pub fn cg_scan<'c>(
        &self,
        param: &TableIterParam,
        ctx: &'c mut TableAccessContext,
        is_projector: bool,
        project_single_row: bool,
    ) -> StorageResult<&'c mut CgScanner> {
        if !self.valid_for_cs_reading {
            return Err(StorageError::not_init(format!(
                "co sstable {} is not ready for column store reads",
                self.key()
            )));
        }
        let kind = CgScannerKind::choose(CgScanShape::new(
            param,
            self.cs_meta.column_group_cnt,
            is_projector,
            project_single_row,
        ));
        let wrapper = if kind == CgScannerKind::Virtual {
            None
        } else {
            Some(self.fetch_column_group(param.cg_idx, true, ctx.loader.as_ref())?)
        };
        let source = CgScanSource {
            reader: Arc::clone(&ctx.reader),
            wrapper,
            base_row_count: self.base.meta()?.row_count,
        };

        let mut scanner = match ctx.cg_iters.remove(&param.cg_idx) {
            Some(mut pooled) if pooled.kind() != kind => {
                tracing::debug!(
                    cg_idx = param.cg_idx,
                    pooled = ?pooled.kind(),
                    requested = ?kind,
                    "replace pooled cg scanner"
                );
                pooled.close();
                CgScanner::new(kind, param.cg_idx)
            }
            Some(pooled) => pooled,
            None => CgScanner::new(kind, param.cg_idx),
        };
        let opened = if scanner.is_open() {
            if scanner.cg_idx() != param.cg_idx {
                tracing::error!(pooled = scanner.cg_idx(), requested = param.cg_idx, "unexpected pooled cg scanner");
                Err(StorageError::internal(format!(
                    "pooled scanner of column group {} for column group {}",
                    scanner.cg_idx(),
                    param.cg_idx
                )))
            } else {
                scanner.switch_context(param, source)
            }
        } else {
            scanner.open(param, source)
        };
        if let Err(err) = opened {
            scanner.close();
            return Err(err);
        }
        Ok(ctx.cg_iters.entry(param.cg_idx).or_insert(scanner))
    }

    /// Pin every macro block of the base and, once filled, of every column
    /// group. Nothing stays pinned on failure.
    pub fn inc_macro_ref(&self, manager: &dyn BlockRefManager) -> StorageResult<()> {
        let mut guard = MacroRefGuard::new(manager);
        self.base.acquire_macro_refs(&mut guard)?;
        if !self.is_empty_co && self.valid_for_cs_reading {
            if let Err(err) = self.cg_sstables.acquire_macro_refs(&mut guard) {
                tracing::warn!(table = %self.key(), error = %err, "failed to pin column group macro blocks");
                return Err(err);
            }
        }
        guard.commit();
        Ok(())
    }

    pub fn dec_macro_ref(&self, manager: &dyn BlockRefManager) {
        self.base.dec_macro_ref(manager);
        if !self.is_empty_co && self.valid_for_cs_reading {
            for table in self.cg_sstables.iter() {
                table.dec_macro_ref(manager);
            }
        }
    }

    fn tail_size(&self) -> usize {
        let mut len = size_of::<i32>() + 1 + self.cs_meta.size();
        if !self.is_empty_co {
            len += self.cg_sstables.size();
        }
        len
    }

    fn encode_tail<B: BufMut>(&self, buf: &mut B) {
        self.base_type.map_or(0, |ty| ty as i32).encode(buf);
        self.is_empty_co.encode(buf);
        self.cs_meta.encode(buf);
        if !self.is_empty_co {
            self.cg_sstables.encode(buf);
        }
    }

    fn check_serialize<B: BufMut>(&self, buf: &B, len: usize) -> StorageResult<()> {
        if !self.valid_for_cs_reading {
            return Err(StorageError::not_init(format!(
                "co sstable {} is not initialized",
                self.key()
            )));
        }
        if buf.remaining_mut() < len {
            return Err(StorageError::invalid(format!(
                "buffer has {} bytes, {len} needed",
                buf.remaining_mut()
            )));
        }
        Ok(())
    }

    pub fn get_serialize_size(&self) -> usize {
        self.base.encoded_size(false) + self.tail_size()
    }

    /// `[base][i32 base type][bool empty][cs meta][column groups unless empty]`
    pub fn serialize<B: BufMut>(&self, buf: &mut B) -> StorageResult<()> {
        self.check_serialize(buf, self.get_serialize_size())?;
        self.base.encode_normal(buf);
        self.encode_tail(buf);
        Ok(())
    }

    pub fn get_full_serialize_size(&self) -> usize {
        self.base.encoded_size(true) + self.tail_size()
    }

    /// Same layout as [`CoSsTable::serialize`] with the base always carrying
    /// its full metadata.
    pub fn serialize_full<B: BufMut>(&self, buf: &mut B) -> StorageResult<()> {
        self.check_serialize(buf, self.get_full_serialize_size())?;
        self.base.encode_full(buf)?;
        self.encode_tail(buf);
        Ok(())
    }

    /// Decode into this instance. At most once.
    pub fn deserialize<B: Buf>(&mut self, buf: &mut B) -> StorageResult<()> {
        if self.valid_for_cs_reading {
            return Err(StorageError::AlreadyInitialized(format!(
                "co sstable {} is already initialized",
                self.key()
            )));
        }
        let base = SsTable::decode_from(buf)?;
        let raw_type = i32::decode(buf)?;
        let base_type = CoBaseType::from_raw(raw_type).ok_or(CodecError::InvalidTag {
            what: "co base type",
            tag: i64::from(raw_type),
        })?;
        let is_empty_co = bool::decode(buf)?;
        let cs_meta = CoSsTableMeta::decode(buf)?;
        let cg_sstables = if is_empty_co {
            CgSsTableArray::default()
        } else {
            let cg_sstables = CgSsTableArray::decode(buf)?;
            if cs_meta.column_group_cnt as usize != cg_sstables.count() + 1 {
                return Err(CodecError::CountMismatch {
                    what: "column group",
                    expected: cs_meta.column_group_cnt as usize,
                    actual: cg_sstables.count() + 1,
                }
                .into());
            }
            cg_sstables
        };

        self.base = Arc::new(base);
        self.base_type = Some(base_type);
        self.is_empty_co = is_empty_co;
        self.cs_meta = cs_meta;
        self.cg_sstables = cg_sstables;
        self.valid_for_cs_reading = true;
        Ok(())
    }

    pub fn get_deep_copy_size(&self) -> usize {
        let mut len = size_of::<Self>() + self.base.deep_copy_size();
        if !self.is_empty_co {
            len += self.cg_sstables.deep_copy_size();
        }
        len
    }

    fn deep_clone(&self) -> Self {
        Self {
            base: Arc::new(self.base.deep_clone()),
            cg_sstables: self.cg_sstables.deep_clone(),
            cs_meta: self.cs_meta,
            base_type: self.base_type,
            is_empty_co: self.is_empty_co,
            valid_for_cs_reading: self.valid_for_cs_reading,
        }
    }

    /// Copy this table and every sub-table into `arena`.
    pub fn deep_copy(&self, arena: &mut MetaArena) -> StorageResult<MetaHandle> {
        let size = self.get_deep_copy_size();
        if arena.remaining() < size {
            return Err(StorageError::invalid(format!(
                "arena has {} bytes, {size} needed",
                arena.remaining()
            )));
        }
        arena
            .place(self.deep_clone(), size)
            .ok_or_else(|| StorageError::invalid("arena exhausted"))
    }

    /// Copy into `arena`, pointing each copied sub-table at its persisted
    /// address. `addrs` follows the sub-table array order.
    pub fn deep_copy_with_addrs(
        &self,
        arena: &mut MetaArena,
        addrs: &[MetaDiskAddr],
    ) -> StorageResult<MetaHandle> {
        if !self.valid_for_cs_reading || !self.cg_sstables.is_filled() {
            return Err(StorageError::state(format!(
                "co sstable {} has no column group tables to relocate",
                self.key()
            )));
        }
        if addrs.len() != self.cg_sstables.count() {
            return Err(StorageError::invalid(format!(
                "{} addresses for {} column group tables",
                addrs.len(),
                self.cg_sstables.count()
            )));
        }
        let size = self.get_deep_copy_size();
        if arena.remaining() < size {
            return Err(StorageError::AllocationFailure(format!(
                "arena has {} bytes, {size} needed",
                arena.remaining()
            )));
        }
        let mut copy = self.deep_clone();
        for (table, addr) in copy.cg_sstables.tables_mut().iter_mut().zip(addrs) {
            Arc::make_mut(table).set_addr(*addr)?;
        }
        arena
            .place(copy, size)
            .ok_or_else(|| StorageError::AllocationFailure("arena exhausted".into()))
    }
}
