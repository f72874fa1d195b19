//! In-memory collaborators for tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::{Bound, Range},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    access::{Datum, RowkeyRange, TableAccessContext},
    column_store::{CoBaseType, CoSsTable},
    compaction::{
        services::{
            BloomFilterBuilder, LsInfo, MediumClogSubmitter, MergeDagParam, MergeDagScheduler,
            ReplicaStatus, SchedulerServices, SchemaService, Scn, TableSchema, TabletFreezer,
            TabletReplicaMetaTable, TabletStatus, TenantStorage,
        },
        BloomFilterTask, CompactionType, MediumCompactionInfo,
    },
    error::{StorageError, StorageResult},
    id::{ColumnId, LsId, MacroBlockId, RowId, TableKey, TableType, TabletId, TabletLsPair},
    sstable::{
        block::{BlockReader, BlockRefManager, TableStoreLoader},
        CreateSsTableParam, MetaDiskAddr, SsTable, SsTableMeta,
    },
};

pub(crate) const TEST_SNAPSHOT: i64 = 100;

#[derive(Default)]
pub(crate) struct MemBlockRefManager {
    refs: Mutex<HashMap<MacroBlockId, usize>>,
    failing: Mutex<HashSet<MacroBlockId>>,
}

impl MemBlockRefManager {
    pub(crate) fn fail_on(&self, id: MacroBlockId) {
        self.failing.lock().insert(id);
    }

    pub(crate) fn ref_cnt(&self, id: MacroBlockId) -> usize {
        self.refs.lock().get(&id).copied().unwrap_or(0)
    }

    pub(crate) fn total_refs(&self) -> usize {
        self.refs.lock().values().sum()
    }
}

impl BlockRefManager for MemBlockRefManager {
    fn inc_ref(&self, id: MacroBlockId) -> StorageResult<()> {
        if self.failing.lock().contains(&id) {
            return Err(StorageError::AllocationFailure(format!("pin {id}")));
        }
        *self.refs.lock().entry(id).or_default() += 1;
        Ok(())
    }

    fn dec_ref(&self, id: MacroBlockId) {
        let mut refs = self.refs.lock();
        if let Some(cnt) = refs.get_mut(&id) {
            *cnt -= 1;
            if *cnt == 0 {
                refs.remove(&id);
            }
        }
    }
}

/// Serves synthetic values: rowkey column 0 holds the row id, column `c`
/// holds `c * 1000 + row id`.
pub(crate) struct MemBlockReader;

fn key_pos(rowkey: &[Datum]) -> u64 {
    match rowkey.first() {
        Some(Datum::Int(v)) if *v >= 0 => *v as u64,
        _ => 0,
    }
}

impl BlockReader for MemBlockReader {
    fn locate_rowkey(&self, table: &SsTable, rowkey: &[Datum]) -> StorageResult<Option<RowId>> {
        let row_count = table.meta()?.row_count;
        let pos = key_pos(rowkey);
        Ok((pos < row_count).then_some(pos))
    }

    fn locate_range(&self, table: &SsTable, range: &RowkeyRange) -> StorageResult<Range<RowId>> {
        let row_count = table.meta()?.row_count;
        let start = match &range.start {
            Bound::Included(key) => key_pos(key),
            Bound::Excluded(key) => key_pos(key) + 1,
            Bound::Unbounded => 0,
        };
        let end = match &range.end {
            Bound::Included(key) => key_pos(key) + 1,
            Bound::Excluded(key) => key_pos(key),
            Bound::Unbounded => row_count,
        };
        let end = end.min(row_count);
        Ok(start.min(end)..end)
    }

    fn read_column(
        &self,
        table: &SsTable,
        column: ColumnId,
        rows: Range<RowId>,
    ) -> StorageResult<Vec<Datum>> {
        let meta = table.meta()?;
        if !meta.contains_column(column) {
            return Err(StorageError::NotFound(format!(
                "column {column} in {}",
                table.key()
            )));
        }
        if rows.end > meta.row_count {
            return Err(StorageError::invalid("rows past the end of the table"));
        }
        Ok(rows
            .map(|row| {
                if column == 0 {
                    Datum::Int(row as i64)
                } else {
                    Datum::Int(i64::from(column) * 1000 + row as i64)
                }
            })
            .collect())
    }
}

#[derive(Default)]
pub(crate) struct MemLoader {
    tables: Mutex<HashMap<MetaDiskAddr, Arc<SsTable>>>,
}

impl MemLoader {
    pub(crate) fn register(&self, table: Arc<SsTable>) {
        self.tables.lock().insert(*table.addr(), table);
    }
}

impl TableStoreLoader for MemLoader {
    fn load_sstable(&self, addr: &MetaDiskAddr) -> StorageResult<Arc<SsTable>> {
        self.tables
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("sstable at {addr:?}")))
    }
}

pub(crate) fn cg_param(
    table_type: TableType,
    cg_idx: u16,
    column_ids: Vec<ColumnId>,
    row_count: u64,
    macro_ids: &[u64],
) -> CreateSsTableParam {
    let meta = SsTableMeta {
        schema_version: 1,
        row_count,
        data_macro_block_cnt: macro_ids.len() as i64,
        data_micro_block_cnt: 4 * macro_ids.len() as i64,
        index_macro_block_cnt: 1,
        occupy_size: 2 << 20,
        original_size: 4 << 20,
        data_checksum: 100 + i64::from(cg_idx),
        column_ids,
        ..Default::default()
    };
    let key = TableKey::new(TabletId::new(1), table_type, cg_idx, TEST_SNAPSHOT);
    CreateSsTableParam::new(key, meta)
        .with_macro_ids(macro_ids.iter().copied().map(MacroBlockId::new).collect())
}

pub(crate) fn cg_table(
    table_type: TableType,
    cg_idx: u16,
    column_ids: Vec<ColumnId>,
    row_count: u64,
    macro_ids: &[u64],
) -> Arc<SsTable> {
    let param = cg_param(table_type, cg_idx, column_ids, row_count, macro_ids);
    Arc::new(SsTable::new(&param).expect("cg sstable"))
}

/// Composite table parameters with the base at column group 1 over 4 rows.
pub(crate) fn co_param(co_base_type: i32, column_group_cnt: u32, empty: bool) -> CreateSsTableParam {
    let columns = if co_base_type == CoBaseType::AllColumns as i32 {
        (0..column_group_cnt).collect()
    } else {
        vec![0]
    };
    cg_param(TableType::CoMajor, 1, columns, 4, &[1, 2])
        .with_column_groups(co_base_type, column_group_cnt, column_group_cnt)
        .with_empty_co_table(empty)
}

/// A filled composite table with a rowkey-only base at column group 1.
/// Column group `l` stores column `max(l, 1)`.
pub(crate) struct CoFixture {
    pub(crate) co: CoSsTable,
    pub(crate) cg_tables: Vec<Arc<SsTable>>,
}

impl CoFixture {
    pub(crate) fn rowkey_base(column_group_cnt: u32) -> Self {
        let mut co = CoSsTable::default();
        co.init(&co_param(
            CoBaseType::RowkeyOnly as i32,
            column_group_cnt,
            false,
        ))
        .expect("init");
        let cg_tables: Vec<_> = (0..column_group_cnt as u16)
            .filter(|idx| *idx != 1)
            .map(|idx| {
                let base = 10 * (u64::from(idx) + 1);
                cg_table(
                    TableType::NormalCg,
                    idx,
                    vec![u32::from(idx.max(1))],
                    4,
                    &[base + 1, base + 2],
                )
            })
            .collect();
        co.fill_column_groups(cg_tables.clone()).expect("fill");
        Self { co, cg_tables }
    }

    pub(crate) fn macro_block_cnt(&self) -> usize {
        self.co.base().macro_ids().len()
            + self
                .cg_tables
                .iter()
                .map(|table| table.macro_ids().len())
                .sum::<usize>()
    }

    pub(crate) fn persisted_addrs(&self) -> Vec<MetaDiskAddr> {
        (0..self.cg_tables.len() as u64)
            .map(|i| MetaDiskAddr::Block {
                macro_id: MacroBlockId::new(500 + i),
                offset: 0,
                size: 32,
            })
            .collect()
    }
}

pub(crate) fn mem_context() -> TableAccessContext {
    TableAccessContext::new(Arc::new(MemBlockReader), Arc::new(MemLoader::default()))
}

/// Context whose loader resolves the fixture's persisted column group
/// addresses.
pub(crate) fn mem_context_for(fixture: &CoFixture) -> TableAccessContext {
    let loader = MemLoader::default();
    for (table, addr) in fixture.cg_tables.iter().zip(fixture.persisted_addrs()) {
        let mut persisted = SsTable::clone(table);
        persisted.set_addr(addr).expect("addr");
        loader.register(Arc::new(persisted));
    }
    TableAccessContext::new(Arc::new(MemBlockReader), Arc::new(loader))
}

pub(crate) const LS_1: LsId = LsId::new(1001);
pub(crate) const LS_2: LsId = LsId::new(1002);
pub(crate) const TABLET_1: TabletId = TabletId::new(200001);
pub(crate) const TABLET_2: TabletId = TabletId::new(200002);
pub(crate) const TABLET_3: TabletId = TabletId::new(200003);

/// Tablet on `LS_1` with 1000 rows, schema version 1 and no pending work.
pub(crate) fn tablet_status(tablet_id: TabletId, last_major_snapshot: Scn) -> TabletStatus {
    TabletStatus {
        ls_id: LS_1,
        tablet_id,
        last_major_snapshot,
        schema_version: 1,
        row_count: 1000,
        ..Default::default()
    }
}

pub(crate) fn medium_info(snapshot: Scn, compaction_type: CompactionType) -> MediumCompactionInfo {
    MediumCompactionInfo {
        medium_snapshot: snapshot,
        compaction_type,
        schema_version: 1,
        column_group_cnt: 1,
        ..Default::default()
    }
}

struct FakeLs {
    info: LsInfo,
    tablets: BTreeMap<TabletId, TabletStatus>,
}

#[derive(Default)]
pub(crate) struct FakeStorage {
    ls: Mutex<BTreeMap<LsId, FakeLs>>,
    failing: Mutex<HashSet<TabletLsPair>>,
    gc_calls: Mutex<Vec<TabletLsPair>>,
}

impl FakeStorage {
    /// Leader log streams with tablets whose last major is 1.
    pub(crate) fn with_layout(layout: &[(u64, &[u64])]) -> Self {
        let storage = Self::default();
        for (ls, tablets) in layout {
            let ls_id = LsId::new(*ls);
            storage.add_leader_ls(ls_id, 0);
            for tablet in *tablets {
                storage.put_tablet(TabletStatus {
                    ls_id,
                    ..tablet_status(TabletId::new(*tablet), 1)
                });
            }
        }
        storage
    }

    pub(crate) fn add_ls(&self, info: LsInfo) {
        self.ls.lock().insert(
            info.ls_id,
            FakeLs {
                info,
                tablets: BTreeMap::new(),
            },
        );
    }

    pub(crate) fn add_leader_ls(&self, ls_id: LsId, weak_read_ts: Scn) {
        self.add_ls(LsInfo {
            ls_id,
            is_leader: true,
            weak_read_ts,
            members: vec![1, 2, 3],
        });
    }

    pub(crate) fn remove_ls(&self, ls_id: LsId) {
        self.ls.lock().remove(&ls_id);
    }

    pub(crate) fn update_ls(&self, ls_id: LsId, f: impl FnOnce(&mut LsInfo)) {
        if let Some(ls) = self.ls.lock().get_mut(&ls_id) {
            f(&mut ls.info);
        }
    }

    pub(crate) fn put_tablet(&self, status: TabletStatus) {
        let mut ls = self.ls.lock();
        let ls = ls.get_mut(&status.ls_id).expect("log stream");
        ls.tablets.insert(status.tablet_id, status);
    }

    pub(crate) fn update_tablet(
        &self,
        ls_id: LsId,
        tablet_id: TabletId,
        f: impl FnOnce(&mut TabletStatus),
    ) -> StorageResult<()> {
        let mut ls = self.ls.lock();
        let tablet = ls
            .get_mut(&ls_id)
            .ok_or(StorageError::LsNotExist(ls_id))?
            .tablets
            .get_mut(&tablet_id)
            .ok_or_else(|| StorageError::NotFound(format!("{tablet_id}")))?;
        f(tablet);
        Ok(())
    }

    pub(crate) fn tablet(&self, ls_id: LsId, tablet_id: TabletId) -> TabletStatus {
        self.tablet_status(ls_id, tablet_id).expect("tablet")
    }

    pub(crate) fn fail_tablet(&self, ls_id: LsId, tablet_id: TabletId) {
        self.failing
            .lock()
            .insert(TabletLsPair::new(ls_id, tablet_id));
    }

    pub(crate) fn gc_calls(&self) -> Vec<TabletLsPair> {
        self.gc_calls.lock().clone()
    }
}

impl TenantStorage for FakeStorage {
    fn ls_ids(&self) -> StorageResult<Vec<LsId>> {
        Ok(self.ls.lock().keys().copied().collect())
    }

    fn ls_info(&self, ls_id: LsId) -> StorageResult<LsInfo> {
        self.ls
            .lock()
            .get(&ls_id)
            .map(|ls| ls.info.clone())
            .ok_or(StorageError::LsNotExist(ls_id))
    }

    fn tablet_ids(&self, ls_id: LsId) -> StorageResult<Vec<TabletId>> {
        self.ls
            .lock()
            .get(&ls_id)
            .map(|ls| ls.tablets.keys().copied().collect())
            .ok_or(StorageError::LsNotExist(ls_id))
    }

    fn tablet_status(&self, ls_id: LsId, tablet_id: TabletId) -> StorageResult<TabletStatus> {
        if self
            .failing
            .lock()
            .contains(&TabletLsPair::new(ls_id, tablet_id))
        {
            return Err(StorageError::internal(format!("injected failure on {tablet_id}")));
        }
        let ls = self.ls.lock();
        ls.get(&ls_id)
            .ok_or(StorageError::LsNotExist(ls_id))?
            .tablets
            .get(&tablet_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{tablet_id}")))
    }

    fn update_upper_trans_version_and_gc(
        &self,
        ls_id: LsId,
        tablet_id: TabletId,
    ) -> StorageResult<bool> {
        self.tablet_status(ls_id, tablet_id)?;
        self.gc_calls
            .lock()
            .push(TabletLsPair::new(ls_id, tablet_id));
        Ok(true)
    }
}

#[derive(Default)]
pub(crate) struct RecordingBloomBuilder {
    built: Mutex<Vec<MacroBlockId>>,
}

impl RecordingBloomBuilder {
    pub(crate) fn built(&self) -> Vec<MacroBlockId> {
        self.built.lock().clone()
    }
}

impl BloomFilterBuilder for RecordingBloomBuilder {
    fn build(&self, task: &BloomFilterTask) -> StorageResult<()> {
        self.built.lock().push(task.macro_id);
        Ok(())
    }
}

/// Dag scheduler, freezer, commit log, meta table and schema service in one.
/// With `sync_clog` set, submitted medium infos land in the tablet's list
/// right away.
#[derive(Default)]
pub(crate) struct FakeCluster {
    storage: Arc<FakeStorage>,
    dags: Mutex<Vec<MergeDagParam>>,
    running_dag_ls: Mutex<HashSet<LsId>>,
    freezes: Mutex<Vec<TabletLsPair>>,
    clogs: Mutex<Vec<(TabletLsPair, MediumCompactionInfo)>>,
    sync_clog: Mutex<bool>,
    replicas: Mutex<Vec<ReplicaStatus>>,
    meta_queries: AtomicUsize,
    bloom: RecordingBloomBuilder,
}

impl MergeDagScheduler for FakeCluster {
    fn schedule_merge_dag(&self, param: &MergeDagParam) -> StorageResult<()> {
        let mut dags = self.dags.lock();
        if !dags.contains(param) {
            dags.push(*param);
        }
        Ok(())
    }

    fn has_running_dag(&self, ls_id: LsId) -> bool {
        self.running_dag_ls.lock().contains(&ls_id)
    }
}

impl TabletFreezer for FakeCluster {
    fn freeze_tablet(&self, ls_id: LsId, tablet_id: TabletId) -> StorageResult<()> {
        self.freezes
            .lock()
            .push(TabletLsPair::new(ls_id, tablet_id));
        Ok(())
    }
}

impl MediumClogSubmitter for FakeCluster {
    fn submit_medium_clog(
        &self,
        ls_id: LsId,
        tablet_id: TabletId,
        info: &MediumCompactionInfo,
    ) -> StorageResult<()> {
        if *self.sync_clog.lock() {
            let mut result = Ok(());
            self.storage.update_tablet(ls_id, tablet_id, |tablet| {
                result = tablet.medium_list.add(info.clone());
            })?;
            result?;
        }
        self.clogs
            .lock()
            .push((TabletLsPair::new(ls_id, tablet_id), info.clone()));
        Ok(())
    }
}

impl TabletReplicaMetaTable for FakeCluster {
    fn batch_get_replica_status(
        &self,
        pairs: &[TabletLsPair],
    ) -> StorageResult<Vec<ReplicaStatus>> {
        self.meta_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .replicas
            .lock()
            .iter()
            .filter(|status| pairs.contains(&TabletLsPair::new(status.ls_id, status.tablet_id)))
            .copied()
            .collect())
    }
}

impl SchemaService for FakeCluster {
    fn get_table_schema(&self, _tablet_id: TabletId, schema_version: i64) -> StorageResult<TableSchema> {
        Ok(TableSchema {
            schema_version,
            column_cnt: 4,
            column_group_cnt: 1,
        })
    }
}

impl BloomFilterBuilder for FakeCluster {
    fn build(&self, task: &BloomFilterTask) -> StorageResult<()> {
        self.bloom.build(task)
    }
}

pub(crate) struct FakeServices {
    pub(crate) storage: Arc<FakeStorage>,
    cluster: Arc<FakeCluster>,
}

impl Default for FakeServices {
    fn default() -> Self {
        let storage = Arc::new(FakeStorage::default());
        let cluster = Arc::new(FakeCluster {
            storage: Arc::clone(&storage),
            ..Default::default()
        });
        Self { storage, cluster }
    }
}

impl FakeServices {
    pub(crate) fn services(&self) -> SchedulerServices {
        SchedulerServices {
            storage: self.storage.clone(),
            dag_scheduler: self.cluster.clone(),
            freezer: self.cluster.clone(),
            clog: self.cluster.clone(),
            meta_table: self.cluster.clone(),
            schema: self.cluster.clone(),
            bloom_builder: self.cluster.clone(),
        }
    }

    pub(crate) fn set_sync_clog(&self, sync: bool) {
        *self.cluster.sync_clog.lock() = sync;
    }

    pub(crate) fn set_running_dag(&self, ls_id: LsId) {
        self.cluster.running_dag_ls.lock().insert(ls_id);
    }

    pub(crate) fn report_replicas(&self, replicas: Vec<ReplicaStatus>) {
        self.cluster.replicas.lock().extend(replicas);
    }

    pub(crate) fn meta_table_queries(&self) -> usize {
        self.cluster.meta_queries.load(Ordering::SeqCst)
    }

    pub(crate) fn dags(&self) -> Vec<MergeDagParam> {
        self.cluster.dags.lock().clone()
    }

    pub(crate) fn clear_dags(&self) {
        self.cluster.dags.lock().clear();
    }

    pub(crate) fn freezes(&self) -> Vec<TabletLsPair> {
        self.cluster.freezes.lock().clone()
    }

    pub(crate) fn clogs(&self) -> Vec<(TabletLsPair, MediumCompactionInfo)> {
        self.cluster.clogs.lock().clone()
    }

    pub(crate) fn bloom_built(&self) -> Vec<MacroBlockId> {
        self.cluster.bloom.built()
    }
}
