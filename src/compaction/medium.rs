//! Per tablet medium compaction decisions.
//!
//! A [`MediumScheduleFunc`] lives for one call. Leaders use it to pick a
//! snapshot and replicate a [`MediumCompactionInfo`] through the commit log;
//! every replica uses it to turn synced infos into merge dags.

use std::{collections::HashMap, ops::Range, time::Duration};

use parking_lot::Mutex;

use crate::{
    compaction::{
        fast_freeze::TOMBSTONE_DEFAULT_ROW_COUNT,
        medium_info::{CompactionType, MediumCompactionInfo, MediumCompactionInfoList, MergeReason},
        services::{
            LsInfo, MergeDagParam, MergeType, SchedulerServices, Scn, TabletReplicaMetaTable,
            TabletStatus,
        },
        stats::ScheduleStatistics,
    },
    error::{StorageError, StorageResult},
    id::{LsId, TabletId, TabletLsPair},
    logging::{costore_log, Component},
};

pub const DEFAULT_SCHEDULE_MEDIUM_INTERVAL: Duration = Duration::from_secs(60);
/// Share of incremental rows that makes a large tablet merge in parallel.
pub const SCHEDULE_RANGE_INC_ROW_COUNT_PERCENTAGE_THRESHOLD: f64 = 0.2;
pub const SCHEDULE_RANGE_ROW_COUNT_THRESHOLD: u64 = 1_000_000;
pub const MAX_PARALLEL_DEGREE: u64 = 64;

const LOAD_DATA_MIN_INC_ROW_COUNT: u64 = 100_000;
const FREQUENT_WRITE_MINOR_SSTABLE_CNT: usize = 16;

/// How the snapshot of a new medium info is picked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotStrategy {
    /// Latest consistent read point.
    Medium,
    /// An explicit version target, or the read point when none is given.
    Major,
}

impl SnapshotStrategy {
    pub fn for_reason(reason: MergeReason) -> Self {
        if reason.is_user_request() || reason == MergeReason::TenantMajor {
            Self::Major
        } else {
            Self::Medium
        }
    }
}

/// A tablet whose medium round waits for replica confirmation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TabletCheckInfo {
    pub ls_id: LsId,
    pub tablet_id: TabletId,
    pub medium_snapshot: Scn,
}

impl TabletCheckInfo {
    pub fn pair(&self) -> TabletLsPair {
        TabletLsPair::new(self.ls_id, self.tablet_id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchCheckResult {
    /// Every valid replica reported the medium snapshot.
    pub finished: Vec<TabletCheckInfo>,
    /// Replicas at the same snapshot disagree on the data checksum.
    pub checksum_errors: Vec<TabletLsPair>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MediumMergeOutcome {
    /// The memtable still holds data the merge must see.
    pub tablet_need_freeze: bool,
    pub create_dag: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderSchedule {
    Skipped,
    /// The previous round must be confirmed by every replica first.
    WaitConfirm(TabletCheckInfo),
    Submitted(MediumCompactionInfo),
}

/// Medium infos handed to the commit log but not yet seen in the tablet's
/// synced list. At most one proposal per tablet is in flight.
#[derive(Debug, Default)]
pub struct PendingMediumProposals {
    inner: Mutex<HashMap<TabletLsPair, Scn>>,
}

impl PendingMediumProposals {
    /// Snapshot of the unsynced proposal of `tablet`, dropping it first if
    /// the tablet has synced or merged past it.
    pub fn pending(&self, tablet: &TabletStatus) -> Option<Scn> {
        let mut inner = self.inner.lock();
        Self::forget_synced(&mut inner, tablet);
        inner.get(&tablet.pair()).copied()
    }

    /// Claim the in-flight slot of `tablet` for `snapshot`. `false` while
    /// another proposal is unsynced.
    fn try_reserve(&self, tablet: &TabletStatus, snapshot: Scn) -> bool {
        let mut inner = self.inner.lock();
        Self::forget_synced(&mut inner, tablet);
        match inner.get(&tablet.pair()) {
            Some(_) => false,
            None => {
                inner.insert(tablet.pair(), snapshot);
                true
            }
        }
    }

    fn release(&self, pair: TabletLsPair, snapshot: Scn) {
        let mut inner = self.inner.lock();
        if inner.get(&pair) == Some(&snapshot) {
            inner.remove(&pair);
        }
    }

    fn forget_synced(inner: &mut HashMap<TabletLsPair, Scn>, tablet: &TabletStatus) {
        let pair = tablet.pair();
        if let Some(snapshot) = inner.get(&pair).copied() {
            if snapshot <= MediumScheduleFunc::get_max_sync_medium_scn(tablet) {
                inner.remove(&pair);
            }
        }
    }

    /// Drop every proposal of a log stream, e.g. after a leader change.
    pub fn clear_ls(&self, ls_id: LsId) {
        self.inner.lock().retain(|pair, _| pair.ls_id != ls_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().clear();
    }
}

pub struct MediumScheduleFunc<'a> {
    services: &'a SchedulerServices,
    stats: &'a ScheduleStatistics,
    proposals: &'a PendingMediumProposals,
    ls: &'a LsInfo,
    tablet: &'a TabletStatus,
    parallel_row_threshold: u64,
}

impl<'a> MediumScheduleFunc<'a> {
    pub fn new(
        services: &'a SchedulerServices,
        stats: &'a ScheduleStatistics,
        proposals: &'a PendingMediumProposals,
        ls: &'a LsInfo,
        tablet: &'a TabletStatus,
    ) -> Self {
        Self {
            services,
            stats,
            proposals,
            ls,
            tablet,
            parallel_row_threshold: SCHEDULE_RANGE_ROW_COUNT_THRESHOLD,
        }
    }

    pub fn with_parallel_row_threshold(self, parallel_row_threshold: u64) -> Self {
        Self {
            parallel_row_threshold: parallel_row_threshold.max(1),
            ..self
        }
    }

    /// Type and snapshot of the oldest unfinished info. A major info waits
    /// until the tenant freeze reaches its snapshot.
    pub fn read_medium_info_from_list(
        list: &MediumCompactionInfoList,
        major_frozen_snapshot: Scn,
        last_major_snapshot: Scn,
    ) -> Option<(CompactionType, Scn)> {
        let info = list.first_unfinished(last_major_snapshot)?;
        if info.is_major() && info.medium_snapshot > major_frozen_snapshot {
            return None;
        }
        Some((info.compaction_type, info.medium_snapshot))
    }

    /// Newest snapshot the tablet has either merged or synced.
    pub fn get_max_sync_medium_scn(tablet: &TabletStatus) -> Scn {
        tablet
            .last_major_snapshot
            .max(tablet.medium_list.max_medium_snapshot())
    }

    /// Turn the oldest synced info into a merge dag once reads at its snapshot
    /// are consistent and the memtable holds nothing at or below it.
    pub fn schedule_tablet_medium_merge(
        &self,
        major_frozen_snapshot: Scn,
    ) -> StorageResult<MediumMergeOutcome> {
        let tablet = self.tablet;
        let Some((compaction_type, snapshot)) = Self::read_medium_info_from_list(
            &tablet.medium_list,
            major_frozen_snapshot,
            tablet.last_major_snapshot,
        ) else {
            return Ok(MediumMergeOutcome::default());
        };
        if snapshot > self.ls.weak_read_ts {
            tracing::debug!(
                "{} medium snapshot {snapshot} above weak read ts {}",
                tablet.tablet_id,
                self.ls.weak_read_ts
            );
            return Ok(MediumMergeOutcome::default());
        }
        let memtable_rec_scn = tablet.memtable.as_ref().and_then(|memtable| memtable.rec_scn);
        if memtable_rec_scn.is_some_and(|rec_scn| rec_scn <= snapshot) {
            return Ok(MediumMergeOutcome {
                tablet_need_freeze: true,
                create_dag: false,
            });
        }
        let param = MergeDagParam {
            ls_id: self.ls.ls_id,
            tablet_id: tablet.tablet_id,
            merge_type: match compaction_type {
                CompactionType::Medium => MergeType::Medium,
                CompactionType::Major => MergeType::Major,
            },
            merge_version: snapshot,
        };
        self.services.dag_scheduler.schedule_merge_dag(&param)?;
        self.stats.inc_schedule_dag();
        costore_log!(
            log::Level::Debug,
            Component::Medium,
            "schedule_merge_dag",
            "ls={} tablet={} type={:?} snapshot={}",
            self.ls.ls_id,
            tablet.tablet_id,
            compaction_type,
            snapshot
        );
        Ok(MediumMergeOutcome {
            tablet_need_freeze: false,
            create_dag: true,
        })
    }

    /// Heuristic reason for a medium compaction outside of a major round.
    pub fn get_adaptive_reason(tablet: &TabletStatus) -> MergeReason {
        if tablet.inc_row_count >= LOAD_DATA_MIN_INC_ROW_COUNT
            && tablet.inc_row_count >= tablet.row_count
        {
            MergeReason::LoadData
        } else if tablet.tombstone_row_count >= TOMBSTONE_DEFAULT_ROW_COUNT {
            MergeReason::Tombstone
        } else if tablet.minor_sstable_cnt >= FREQUENT_WRITE_MINOR_SSTABLE_CNT
            && tablet.inc_row_count > 0
        {
            MergeReason::FrequentWrite
        } else {
            MergeReason::None
        }
    }

    pub fn choose_medium_snapshot(&self) -> Scn {
        self.ls.weak_read_ts
    }

    pub fn choose_major_snapshot(&self, major_snapshot: Scn) -> Scn {
        if major_snapshot > 0 {
            major_snapshot
        } else {
            self.ls.weak_read_ts
        }
    }

    /// Keep `info` only if its snapshot is above everything merged or synced.
    /// A user request below that floor moves up to the weak read ts.
    pub fn check_medium_scn_valid_and_fix(&self, info: &mut MediumCompactionInfo) -> bool {
        let floor = Self::get_max_sync_medium_scn(self.tablet);
        if info.medium_snapshot > floor {
            return true;
        }
        if info.merge_reason.is_user_request() && self.ls.weak_read_ts > floor {
            tracing::info!(
                "{} raise medium snapshot {} to weak read ts {}",
                self.tablet.tablet_id,
                info.medium_snapshot,
                self.ls.weak_read_ts
            );
            info.medium_snapshot = self.ls.weak_read_ts;
            return true;
        }
        tracing::debug!(
            "{} reject medium snapshot {} at or below {floor}",
            self.tablet.tablet_id,
            info.medium_snapshot
        );
        false
    }

    /// Equal row ranges when the tablet is large and has enough new rows.
    pub fn parallel_ranges(&self) -> Vec<Range<u64>> {
        let row_count = self.tablet.row_count;
        if row_count < self.parallel_row_threshold
            || (self.tablet.inc_row_count as f64)
                < row_count as f64 * SCHEDULE_RANGE_INC_ROW_COUNT_PERCENTAGE_THRESHOLD
        {
            return Vec::new();
        }
        let degree = row_count
            .div_ceil(self.parallel_row_threshold)
            .min(MAX_PARALLEL_DEGREE);
        if degree <= 1 {
            return Vec::new();
        }
        let step = row_count.div_ceil(degree);
        (0..degree)
            .map(|i| (i * step).min(row_count)..((i + 1) * step).min(row_count))
            .filter(|range| !range.is_empty())
            .collect()
    }

    /// Pick a snapshot for `reason`, build the info and hand it to the commit
    /// log. `Ok(None)` when a proposal is outstanding or the snapshot is stale.
    pub fn decide_medium_snapshot(
        &self,
        reason: MergeReason,
        major_snapshot: Scn,
    ) -> StorageResult<Option<MediumCompactionInfo>> {
        let tablet = self.tablet;
        if !self.ls.is_leader {
            return Err(StorageError::state(format!(
                "{} is not leader of {}",
                tablet.tablet_id, self.ls.ls_id
            )));
        }
        let last_medium = tablet.medium_list.max_medium_snapshot();
        if last_medium > tablet.last_major_snapshot {
            tracing::debug!(
                "{} medium {last_medium} outstanding over major {}",
                tablet.tablet_id,
                tablet.last_major_snapshot
            );
            return Ok(None);
        }

        let (compaction_type, medium_snapshot) = match SnapshotStrategy::for_reason(reason) {
            SnapshotStrategy::Major if reason == MergeReason::TenantMajor => {
                (CompactionType::Major, self.choose_major_snapshot(major_snapshot))
            }
            SnapshotStrategy::Major => (CompactionType::Medium, self.choose_major_snapshot(0)),
            SnapshotStrategy::Medium => (CompactionType::Medium, self.choose_medium_snapshot()),
        };
        let mut info = MediumCompactionInfo {
            medium_snapshot,
            compaction_type,
            merge_reason: reason,
            ..Default::default()
        };
        if !self.check_medium_scn_valid_and_fix(&mut info) {
            return Ok(None);
        }

        if !self.proposals.try_reserve(tablet, info.medium_snapshot) {
            tracing::debug!(
                "{} medium {} unsynced, skip proposal at {}",
                tablet.tablet_id,
                self.proposals.pending(tablet).unwrap_or_default(),
                info.medium_snapshot
            );
            return Ok(None);
        }
        if let Err(err) = self.fill_and_submit(&mut info) {
            self.proposals.release(tablet.pair(), info.medium_snapshot);
            return Err(err);
        }
        self.stats.inc_submit_clog();
        costore_log!(
            log::Level::Info,
            Component::Medium,
            "submit_medium_clog",
            "ls={} tablet={} reason={:?} type={:?} snapshot={} parallel={}",
            self.ls.ls_id,
            tablet.tablet_id,
            reason,
            info.compaction_type,
            info.medium_snapshot,
            info.parallel_ranges.len()
        );
        Ok(Some(info))
    }

    fn fill_and_submit(&self, info: &mut MediumCompactionInfo) -> StorageResult<()> {
        let tablet = self.tablet;
        let schema = self
            .services
            .schema
            .get_table_schema(tablet.tablet_id, tablet.schema_version)?;
        info.schema_version = schema.schema_version;
        info.column_group_cnt = schema.column_group_cnt;
        info.is_schema_changed = schema.schema_version != tablet.schema_version;
        info.parallel_ranges = self.parallel_ranges();
        self.services
            .clog
            .submit_medium_clog(self.ls.ls_id, tablet.tablet_id, info)
    }

    /// Leader entry of the periodic pass. A tenant major wins over adaptive
    /// reasons; a locally finished round is proposed again only after
    /// `prev_confirmed`.
    pub fn schedule_next_medium_for_leader(
        &self,
        major_snapshot: Scn,
        prev_confirmed: bool,
    ) -> StorageResult<LeaderSchedule> {
        let tablet = self.tablet;
        if !self.ls.is_leader {
            return Ok(LeaderSchedule::Skipped);
        }
        let reason = if major_snapshot > tablet.last_major_snapshot {
            MergeReason::TenantMajor
        } else {
            Self::get_adaptive_reason(tablet)
        };
        if reason == MergeReason::None {
            return Ok(LeaderSchedule::Skipped);
        }
        if let Some(last) = tablet.medium_list.last() {
            if last.medium_snapshot > tablet.last_major_snapshot {
                return Ok(LeaderSchedule::Skipped);
            }
            if !prev_confirmed {
                return Ok(LeaderSchedule::WaitConfirm(TabletCheckInfo {
                    ls_id: self.ls.ls_id,
                    tablet_id: tablet.tablet_id,
                    medium_snapshot: last.medium_snapshot,
                }));
            }
        }
        Ok(match self.decide_medium_snapshot(reason, major_snapshot)? {
            Some(info) => LeaderSchedule::Submitted(info),
            None => LeaderSchedule::Skipped,
        })
    }

    /// Ask the meta table in one batch which tablets finished their medium
    /// round on every valid replica.
    pub fn batch_check_medium_finish(
        meta_table: &dyn TabletReplicaMetaTable,
        ls_info_map: &HashMap<LsId, LsInfo>,
        tablet_ls_infos: &[TabletCheckInfo],
    ) -> StorageResult<BatchCheckResult> {
        let mut result = BatchCheckResult::default();
        if tablet_ls_infos.is_empty() {
            return Ok(result);
        }
        let pairs: Vec<_> = tablet_ls_infos.iter().map(TabletCheckInfo::pair).collect();
        let mut replicas: HashMap<TabletLsPair, Vec<_>> = HashMap::new();
        for status in meta_table.batch_get_replica_status(&pairs)? {
            replicas
                .entry(TabletLsPair::new(status.ls_id, status.tablet_id))
                .or_default()
                .push(status);
        }

        for check in tablet_ls_infos {
            let Some(ls_info) = ls_info_map.get(&check.ls_id) else {
                tracing::warn!("{} missing from ls info map", check.ls_id);
                continue;
            };
            let reported = replicas.get(&check.pair()).map(Vec::as_slice).unwrap_or(&[]);
            let mut finished = true;
            let mut checksum = None;
            let mut checksum_error = false;
            for member in &ls_info.members {
                let Some(status) = reported.iter().find(|status| status.server == *member) else {
                    finished = false;
                    continue;
                };
                if status.compaction_scn < check.medium_snapshot {
                    finished = false;
                } else if status.compaction_scn == check.medium_snapshot {
                    match checksum {
                        None => checksum = Some(status.data_checksum),
                        Some(expected) if expected != status.data_checksum => {
                            checksum_error = true
                        }
                        Some(_) => {}
                    }
                }
            }
            if checksum_error {
                tracing::error!(
                    "{} replicas disagree on data checksum at {}",
                    check.tablet_id,
                    check.medium_snapshot
                );
                result.checksum_errors.push(check.pair());
            } else if finished {
                result.finished.push(*check);
            }
        }
        Ok(result)
    }
}
