//! Collaborators the scheduler drives, and the values they exchange.
//!
//! Implementations live outside this crate: log stream management, the dag
//! scheduler, the commit log, the meta report table and the schema service.
//! Every call returns quickly or fails with a classified error; timeouts are
//! the collaborator's business and surface as [`StorageError::Timeout`].
//!
//! [`StorageError::Timeout`]: crate::error::StorageError::Timeout

use std::sync::Arc;

use crate::{
    compaction::{bloom::BloomFilterTask, medium_info::MediumCompactionInfo},
    error::StorageResult,
    id::{LsId, TabletId, TabletLsPair},
};

/// System change number. Versions, snapshots and watermarks share this scale.
pub type Scn = i64;

/// Identity of a server holding a replica.
pub type ServerId = u64;

/// What this server knows about one log stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LsInfo {
    pub ls_id: LsId,
    /// Whether the local replica is the leader.
    pub is_leader: bool,
    /// Reads below this point are consistent on the local replica.
    pub weak_read_ts: Scn,
    /// Servers holding a valid replica.
    pub members: Vec<ServerId>,
}

/// Live statistics of a tablet's active memtable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemtableStats {
    pub is_active: bool,
    /// Microseconds since the epoch.
    pub create_time_us: i64,
    /// When the previous memtable of the tablet was frozen, 0 if never.
    pub frozen_time_us: i64,
    pub insert_row_count: u64,
    pub update_row_count: u64,
    pub delete_row_count: u64,
    /// Writes that landed on the most written row.
    pub hotspot_write_count: u64,
    /// Smallest scn of data held, `None` while empty.
    pub rec_scn: Option<Scn>,
}

impl MemtableStats {
    /// Updated plus deleted rows.
    pub fn tombstone_row_count(&self) -> u64 {
        self.update_row_count + self.delete_row_count
    }
}

/// Snapshot of one tablet as the scheduler sees it.
#[derive(Clone, Debug, Default)]
pub struct TabletStatus {
    pub ls_id: LsId,
    pub tablet_id: TabletId,
    pub last_major_snapshot: Scn,
    pub schema_version: i64,
    pub row_count: u64,
    /// Rows written since the last major.
    pub inc_row_count: u64,
    /// Deleted or overwritten rows since the last major.
    pub tombstone_row_count: u64,
    pub minor_sstable_cnt: usize,
    pub memtable: Option<MemtableStats>,
    /// Medium compaction infos synced through the commit log.
    pub medium_list: crate::compaction::medium_info::MediumCompactionInfoList,
}

impl TabletStatus {
    pub fn pair(&self) -> TabletLsPair {
        TabletLsPair::new(self.ls_id, self.tablet_id)
    }
}

/// Kind of merge handed to the dag scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeType {
    Minor,
    Medium,
    Major,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeDagParam {
    pub ls_id: LsId,
    pub tablet_id: TabletId,
    pub merge_type: MergeType,
    /// Snapshot the merge produces, 0 for minor merges.
    pub merge_version: Scn,
}

/// One replica's row in the meta report table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub ls_id: LsId,
    pub tablet_id: TabletId,
    pub server: ServerId,
    /// Snapshot of the newest finished medium or major merge.
    pub compaction_scn: Scn,
    pub data_checksum: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub schema_version: i64,
    pub column_cnt: u32,
    pub column_group_cnt: u32,
}

/// Log streams and tablets of the tenant on this server.
pub trait TenantStorage: Send + Sync {
    fn ls_ids(&self) -> StorageResult<Vec<LsId>>;

    /// Fails with `LsNotExist` once the log stream is gone.
    fn ls_info(&self, ls_id: LsId) -> StorageResult<LsInfo>;

    fn tablet_ids(&self, ls_id: LsId) -> StorageResult<Vec<TabletId>>;

    fn tablet_status(&self, ls_id: LsId, tablet_id: TabletId) -> StorageResult<TabletStatus>;

    /// Refresh upper transaction versions and release obsolete sstables.
    /// Returns whether anything was released.
    fn update_upper_trans_version_and_gc(
        &self,
        ls_id: LsId,
        tablet_id: TabletId,
    ) -> StorageResult<bool>;
}

pub trait MergeDagScheduler: Send + Sync {
    /// A dag already queued for the same tablet and type counts as success.
    fn schedule_merge_dag(&self, param: &MergeDagParam) -> StorageResult<()>;

    fn has_running_dag(&self, ls_id: LsId) -> bool;
}

pub trait TabletFreezer: Send + Sync {
    fn freeze_tablet(&self, ls_id: LsId, tablet_id: TabletId) -> StorageResult<()>;
}

pub trait MediumClogSubmitter: Send + Sync {
    /// Success means the entry was handed to the log, not that it was replicated.
    fn submit_medium_clog(
        &self,
        ls_id: LsId,
        tablet_id: TabletId,
        info: &MediumCompactionInfo,
    ) -> StorageResult<()>;
}

pub trait TabletReplicaMetaTable: Send + Sync {
    fn batch_get_replica_status(&self, pairs: &[TabletLsPair])
        -> StorageResult<Vec<ReplicaStatus>>;
}

pub trait SchemaService: Send + Sync {
    fn get_table_schema(&self, tablet_id: TabletId, schema_version: i64)
        -> StorageResult<TableSchema>;
}

pub trait BloomFilterBuilder: Send + Sync {
    fn build(&self, task: &BloomFilterTask) -> StorageResult<()>;
}

/// Everything one tenant scheduler talks to.
#[derive(Clone)]
pub struct SchedulerServices {
    pub storage: Arc<dyn TenantStorage>,
    pub dag_scheduler: Arc<dyn MergeDagScheduler>,
    pub freezer: Arc<dyn TabletFreezer>,
    pub clog: Arc<dyn MediumClogSubmitter>,
    pub meta_table: Arc<dyn TabletReplicaMetaTable>,
    pub schema: Arc<dyn SchemaService>,
    pub bloom_builder: Arc<dyn BloomFilterBuilder>,
}
