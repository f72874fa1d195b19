//! Per tenant driver of minor, medium and major compaction scheduling.
//!
//! One [`TenantTabletScheduler`] exists per tenant. After [`start`] it runs a
//! scheduling round every `schedule_interval`:
//!
//! 1. the minor pass freezes memtables early and queues minor merges,
//! 2. the medium pass lets leaders propose medium compactions and turns synced
//!    medium infos into merge dags on every replica,
//! 3. the major progress step advances the merged version once every tablet
//!    has merged the frozen version.
//!
//! Each pass walks tablets through its own resumable iterator, so a tick only
//! visits a bounded batch. A tablet that fails is logged, counted and skipped.
//!
//! [`start`]: TenantTabletScheduler::start

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use crate::{
    compaction::{
        bloom::{BloomFilterQueue, BloomFilterTask},
        fast_freeze::{FastFreezeChecker, FreezeDecision},
        handle::{spawn_timer, spawn_worker, TimerTaskHandle},
        iter::ScheduleIterator,
        medium::{LeaderSchedule, MediumScheduleFunc, PendingMediumProposals, TabletCheckInfo},
        medium_info::MergeReason,
        now_us,
        prohibit::{MediumScheduleGuard, ProhibitFlag, ProhibitMediumMap},
        services::{LsInfo, MergeDagParam, MergeType, SchedulerServices, Scn, TabletStatus},
        stats::{ScheduleStatistics, ScheduleStatisticsSnapshot},
    },
    error::{StorageError, StorageResult},
    id::{LsId, MacroBlockId, TabletId},
    logging::{costore_log, Component},
    option::SchedulerConfig,
};

pub const ADD_LOOP_EVENT_INTERVAL: Duration = Duration::from_secs(120);
pub const WAIT_MEDIUM_CHECK_THRESHOLD: Duration = Duration::from_secs(10 * 60);
/// Tablets frozen per freeze batch.
pub const MERGE_BATCH_FREEZE_CNT: usize = 100;
pub const INIT_COMPACTION_SCN: Scn = 1;

const SCHEDULE_ROUND_TIMER: &str = "schedule_round";
const GC_SSTABLE_TIMER: &str = "gc_sstable";
const BLOOM_FILTER_WORKER: &str = "bloom_filter";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Created,
    Inited,
    Running,
    Stopped,
    Destroyed,
}

/// Step of the scheduling round in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RoundPhase {
    Idle = 0,
    Minor = 1,
    Medium = 2,
    MajorProgress = 3,
}

impl RoundPhase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Minor,
            2 => Self::Medium,
            3 => Self::MajorProgress,
            _ => Self::Idle,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct TabletMediumOutcome {
    need_freeze: bool,
    wait_confirm: Option<TabletCheckInfo>,
}

pub struct TenantTabletScheduler {
    tenant_id: u64,
    services: SchedulerServices,
    config: RwLock<SchedulerConfig>,
    state: Mutex<SchedulerState>,
    round_phase: AtomicU8,
    /// Major merges may start.
    major_merge_status: AtomicBool,
    is_stop: AtomicBool,
    enable_adaptive_compaction: AtomicBool,
    frozen_version: RwLock<Scn>,
    merged_version: AtomicI64,
    inner_table_merged_scn: AtomicI64,
    error_tablet_cnt: AtomicI64,
    /// Every tablet seen in the current medium round merged the frozen version.
    medium_round_finished: AtomicBool,
    /// Every log stream seen in the current medium round reads at the frozen version.
    weak_read_ts_ready: AtomicBool,
    last_loop_event_us: AtomicI64,
    stats: ScheduleStatistics,
    fast_freeze: FastFreezeChecker,
    prohibit: ProhibitMediumMap,
    pending_medium: PendingMediumProposals,
    minor_iter: Mutex<ScheduleIterator>,
    medium_iter: Mutex<ScheduleIterator>,
    gc_iter: Mutex<ScheduleIterator>,
    bf_queue: BloomFilterQueue,
    timers: Mutex<Vec<TimerTaskHandle>>,
}

impl TenantTabletScheduler {
    pub fn new(tenant_id: u64, config: SchedulerConfig, services: SchedulerServices) -> Self {
        let batch_size = config.tablet_batch_size;
        Self {
            tenant_id,
            services,
            state: Mutex::new(SchedulerState::Created),
            round_phase: AtomicU8::new(RoundPhase::Idle as u8),
            major_merge_status: AtomicBool::new(true),
            is_stop: AtomicBool::new(false),
            enable_adaptive_compaction: AtomicBool::new(config.enable_adaptive_compaction),
            frozen_version: RwLock::new(INIT_COMPACTION_SCN),
            merged_version: AtomicI64::new(INIT_COMPACTION_SCN),
            inner_table_merged_scn: AtomicI64::new(INIT_COMPACTION_SCN),
            error_tablet_cnt: AtomicI64::new(0),
            medium_round_finished: AtomicBool::new(false),
            weak_read_ts_ready: AtomicBool::new(false),
            last_loop_event_us: AtomicI64::new(0),
            stats: ScheduleStatistics::default(),
            fast_freeze: FastFreezeChecker::new(config.enable_fast_freeze),
            prohibit: ProhibitMediumMap::default(),
            pending_medium: PendingMediumProposals::default(),
            minor_iter: Mutex::new(ScheduleIterator::new("minor", batch_size)),
            medium_iter: Mutex::new(ScheduleIterator::new("medium", batch_size)),
            gc_iter: Mutex::new(ScheduleIterator::new("gc", batch_size)),
            bf_queue: BloomFilterQueue::new(config.bloom_filter_queue_size),
            timers: Mutex::new(Vec::new()),
            config: RwLock::new(config),
        }
    }

    pub fn tenant_id(&self) -> u64 {
        self.tenant_id
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    pub fn init(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        match *state {
            SchedulerState::Created => {
                *state = SchedulerState::Inited;
                Ok(())
            }
            SchedulerState::Inited | SchedulerState::Running => Err(
                StorageError::AlreadyInitialized(format!("tenant {} scheduler", self.tenant_id)),
            ),
            other => Err(StorageError::state(format!(
                "init tenant {} scheduler in {other:?}",
                self.tenant_id
            ))),
        }
    }

    /// Spawn the round timer, the sstable gc timer and the bloom filter worker.
    pub fn start(self: &Arc<Self>, runtime: &Handle) -> StorageResult<()> {
        let mut state = self.state.lock();
        if *state != SchedulerState::Inited {
            return Err(StorageError::state(format!(
                "start tenant {} scheduler in {:?}",
                self.tenant_id, *state
            )));
        }
        let (schedule_interval, gc_interval) = {
            let config = self.config.read();
            (config.schedule_interval, config.gc_interval)
        };

        let weak = Arc::downgrade(self);
        let round = spawn_timer(runtime, SCHEDULE_ROUND_TIMER, schedule_interval, move || {
            Self::tick(&weak, |scheduler| scheduler.schedule_round())
        });
        let weak = Arc::downgrade(self);
        let gc = spawn_timer(runtime, GC_SSTABLE_TIMER, gc_interval, move || {
            Self::tick(&weak, |scheduler| {
                scheduler.update_upper_trans_version_and_gc_sstable()
            })
        });
        let queue = self.bf_queue.clone();
        let builder = Arc::clone(&self.services.bloom_builder);
        let receiver = queue.receiver();
        let bloom = spawn_worker(runtime, BLOOM_FILTER_WORKER, async move {
            while let Ok(task) = receiver.recv_async().await {
                let queue = queue.clone();
                let builder = Arc::clone(&builder);
                let built =
                    tokio::task::spawn_blocking(move || queue.run(builder.as_ref(), &task)).await;
                if let Err(err) = built {
                    tracing::error!("bloom filter build panicked: {err}");
                }
            }
        });

        self.timers.lock().extend([round, gc, bloom]);
        self.is_stop.store(false, Ordering::Release);
        *state = SchedulerState::Running;
        costore_log!(
            log::Level::Info,
            Component::TabletScheduler,
            "scheduler_start",
            "tenant={} interval={:?} gc_interval={:?}",
            self.tenant_id,
            schedule_interval,
            gc_interval
        );
        Ok(())
    }

    fn tick(
        weak: &Weak<Self>,
        pass: impl FnOnce(&Self) -> StorageResult<()>,
    ) -> bool {
        let Some(scheduler) = weak.upgrade() else {
            return false;
        };
        if scheduler.is_stop() {
            return false;
        }
        if let Err(err) = pass(scheduler.as_ref()) {
            tracing::warn!("tenant {} scheduler tick failed: {err}", scheduler.tenant_id);
        }
        true
    }

    /// Stop scheduling and abort the background tasks. Idempotent.
    pub fn stop(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        match *state {
            SchedulerState::Destroyed => {
                return Err(StorageError::state(format!(
                    "stop destroyed tenant {} scheduler",
                    self.tenant_id
                )))
            }
            SchedulerState::Stopped => return Ok(()),
            _ => {}
        }
        self.is_stop.store(true, Ordering::Release);
        for timer in self.timers.lock().iter() {
            timer.abort();
        }
        *state = SchedulerState::Stopped;
        costore_log!(
            log::Level::Info,
            Component::TabletScheduler,
            "scheduler_stop",
            "tenant={}",
            self.tenant_id
        );
        Ok(())
    }

    /// Wait for the background tasks to exit after [`stop`](Self::stop).
    pub async fn wait(&self) {
        let mut timers = std::mem::take(&mut *self.timers.lock());
        for timer in &mut timers {
            timer.join().await;
        }
    }

    pub fn destroy(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        match *state {
            SchedulerState::Created | SchedulerState::Inited | SchedulerState::Stopped => {}
            other => {
                return Err(StorageError::state(format!(
                    "destroy tenant {} scheduler in {other:?}",
                    self.tenant_id
                )))
            }
        }
        self.is_stop.store(true, Ordering::Release);
        self.timers.lock().clear();
        self.prohibit.clear();
        self.pending_medium.clear();
        self.fast_freeze.reset();
        self.bf_queue.clear();
        self.stats.reset();
        self.minor_iter.lock().reset();
        self.medium_iter.lock().reset();
        self.gc_iter.lock().reset();
        *state = SchedulerState::Destroyed;
        Ok(())
    }

    pub fn is_stop(&self) -> bool {
        self.is_stop.load(Ordering::Acquire)
    }

    fn check_serving(&self) -> StorageResult<()> {
        match self.state() {
            SchedulerState::Inited | SchedulerState::Running => Ok(()),
            other => Err(StorageError::state(format!(
                "tenant {} scheduler is {other:?}",
                self.tenant_id
            ))),
        }
    }

    pub fn reload_config(&self, config: SchedulerConfig) {
        self.fast_freeze.reload_config(config.enable_fast_freeze);
        self.enable_adaptive_compaction
            .store(config.enable_adaptive_compaction, Ordering::Release);
        for iter in [&self.minor_iter, &self.medium_iter, &self.gc_iter] {
            iter.lock().set_batch_size(config.tablet_batch_size);
        }
        tracing::info!(
            "tenant {} scheduler reloads config: {config:?}",
            self.tenant_id
        );
        *self.config.write() = config;
    }

    pub fn enable_adaptive_compaction(&self) -> bool {
        self.enable_adaptive_compaction.load(Ordering::Acquire)
    }

    pub fn fast_freeze_checker(&self) -> &FastFreezeChecker {
        &self.fast_freeze
    }

    pub fn round_phase(&self) -> RoundPhase {
        RoundPhase::from_raw(self.round_phase.load(Ordering::Acquire))
    }

    fn set_round_phase(&self, phase: RoundPhase) {
        self.round_phase.store(phase as u8, Ordering::Release);
    }

    pub fn stats(&self) -> ScheduleStatisticsSnapshot {
        self.stats.snapshot()
    }

    // Watermarks and counters.

    pub fn frozen_version(&self) -> Scn {
        *self.frozen_version.read()
    }

    pub fn merged_version(&self) -> Scn {
        self.merged_version.load(Ordering::Acquire)
    }

    pub fn inner_table_merged_scn(&self) -> Scn {
        self.inner_table_merged_scn.load(Ordering::Acquire)
    }

    /// Never moves backwards.
    pub fn set_inner_table_merged_scn(&self, scn: Scn) {
        self.inner_table_merged_scn.fetch_max(scn, Ordering::AcqRel);
    }

    pub fn error_tablet_cnt(&self) -> i64 {
        self.error_tablet_cnt.load(Ordering::Relaxed)
    }

    pub fn clear_error_tablet_cnt(&self) {
        self.error_tablet_cnt.store(0, Ordering::Relaxed);
    }

    pub fn update_error_tablet_cnt(&self, delta: i64) {
        self.error_tablet_cnt.fetch_add(delta, Ordering::Relaxed);
    }

    fn handle_tablet_error(&self, pass: &str, ls_id: LsId, tablet_id: TabletId, err: &StorageError) {
        if err.is_schedule_ignorable() {
            tracing::debug!("{pass} pass skips {ls_id} {tablet_id}: {err}");
        } else {
            self.update_error_tablet_cnt(1);
            tracing::warn!("{pass} pass failed on {ls_id} {tablet_id}: {err}");
        }
    }

    // Major merge control.

    /// Adopt a new tenant frozen version. Older or equal versions are ignored.
    pub fn schedule_merge(&self, broadcast_version: Scn) -> StorageResult<()> {
        self.check_serving()?;
        if broadcast_version <= 0 {
            return Err(StorageError::invalid(format!(
                "broadcast version {broadcast_version}"
            )));
        }
        {
            let mut frozen_version = self.frozen_version.write();
            if broadcast_version <= *frozen_version {
                tracing::debug!(
                    "ignore broadcast version {broadcast_version}, frozen version is {}",
                    *frozen_version
                );
                return Ok(());
            }
            *frozen_version = broadcast_version;
        }
        self.stats.start_merge(now_us());
        self.medium_iter.lock().reset();
        costore_log!(
            log::Level::Info,
            Component::TabletScheduler,
            "schedule_merge",
            "tenant={} frozen_version={} merged_version={} major_allowed={}",
            self.tenant_id,
            broadcast_version,
            self.merged_version(),
            self.could_major_merge_start()
        );
        self.kick_timer(SCHEDULE_ROUND_TIMER);
        Ok(())
    }

    pub fn stop_major_merge(&self) {
        if self.major_merge_status.swap(false, Ordering::AcqRel) {
            tracing::info!("tenant {} major merge paused", self.tenant_id);
        }
    }

    pub fn resume_major_merge(&self) {
        if !self.major_merge_status.swap(true, Ordering::AcqRel) {
            tracing::info!("tenant {} major merge resumed", self.tenant_id);
            self.kick_timer(SCHEDULE_ROUND_TIMER);
        }
    }

    pub fn could_major_merge_start(&self) -> bool {
        self.major_merge_status.load(Ordering::Acquire)
    }

    fn kick_timer(&self, name: &str) {
        if let Some(timer) = self.timers.lock().iter().find(|timer| timer.name() == name) {
            timer.kick();
        }
    }

    // Prohibit medium.

    pub fn prohibit_medium_map(&self) -> &ProhibitMediumMap {
        &self.prohibit
    }

    /// Medium proposals submitted but not yet synced.
    pub fn pending_medium_proposals(&self) -> &PendingMediumProposals {
        &self.pending_medium
    }

    /// Block medium proposals on a log stream for a transfer. `Busy` while a
    /// medium schedule holds it.
    pub fn stop_ls_schedule_medium(&self, ls_id: LsId) -> StorageResult<()> {
        self.prohibit.add_flag(ls_id, ProhibitFlag::Transfer)
    }

    pub fn clear_prohibit_medium_flag(&self, ls_id: LsId, flag: ProhibitFlag) -> StorageResult<()> {
        self.prohibit.clear_flag(ls_id, flag)
    }

    /// `None` while a transfer holds the log stream.
    pub fn ls_start_schedule_medium(
        &self,
        ls_id: LsId,
    ) -> StorageResult<Option<MediumScheduleGuard<'_>>> {
        self.prohibit.start_medium(ls_id)
    }

    // Bloom filter.

    pub fn schedule_build_bloomfilter(
        &self,
        table_id: u64,
        macro_id: MacroBlockId,
        prefix_len: i64,
    ) -> StorageResult<()> {
        if prefix_len <= 0 {
            return Err(StorageError::invalid(format!("prefix len {prefix_len}")));
        }
        let task = BloomFilterTask {
            table_id,
            macro_id,
            prefix_len,
        };
        if !self.bf_queue.push(task)? {
            tracing::debug!("bloom filter for {macro_id} already pending");
        }
        Ok(())
    }

    pub fn bf_queue_size(&self) -> usize {
        self.bf_queue.len()
    }

    /// Run queued bloom filter builds on the calling thread.
    pub fn drain_bloom_filter_tasks(&self) -> usize {
        self.bf_queue.drain(self.services.bloom_builder.as_ref())
    }

    // Rounds.

    /// One scheduling round: minor pass, medium pass, major progress.
    pub fn schedule_round(&self) -> StorageResult<()> {
        self.check_serving()?;
        self.set_round_phase(RoundPhase::Minor);
        let minor = self.minor_pass();
        self.set_round_phase(RoundPhase::Medium);
        let medium = self.medium_pass();
        self.set_round_phase(RoundPhase::Idle);
        self.add_loop_event();
        minor.and(medium)
    }

    pub fn schedule_all_tablets_minor(&self) -> StorageResult<()> {
        self.check_serving()?;
        self.set_round_phase(RoundPhase::Minor);
        let result = self.minor_pass();
        self.set_round_phase(RoundPhase::Idle);
        result
    }

    pub fn schedule_all_tablets_medium(&self) -> StorageResult<()> {
        self.check_serving()?;
        self.set_round_phase(RoundPhase::Medium);
        let result = self.medium_pass();
        self.set_round_phase(RoundPhase::Idle);
        result
    }

    fn add_loop_event(&self) {
        let now = now_us();
        let last = self.last_loop_event_us.load(Ordering::Relaxed);
        if now - last < ADD_LOOP_EVENT_INTERVAL.as_micros() as i64 {
            return;
        }
        self.last_loop_event_us.store(now, Ordering::Relaxed);
        costore_log!(
            log::Level::Info,
            Component::TabletScheduler,
            "schedule_loop",
            "tenant={} frozen_version={} merged_version={} error_tablet_cnt={} prohibit={} {}",
            self.tenant_id,
            self.frozen_version(),
            self.merged_version(),
            self.error_tablet_cnt(),
            self.prohibit,
            self.stats.snapshot()
        );
    }

    fn minor_pass(&self) -> StorageResult<()> {
        let storage = self.services.storage.as_ref();
        let minor_trigger = self.config.read().minor_trigger_sstable_cnt;
        let now = now_us();
        let mut iter = self.minor_iter.lock();
        iter.start_batch(storage)?;
        while let Some(ls_id) = iter.next_ls(storage)? {
            while let Some(tablet_id) = iter.next_tablet() {
                if let Err(err) = self.schedule_tablet_minor(ls_id, tablet_id, minor_trigger, now) {
                    self.handle_tablet_error("minor", ls_id, tablet_id, &err);
                }
            }
        }
        Ok(())
    }

    fn schedule_tablet_minor(
        &self,
        ls_id: LsId,
        tablet_id: TabletId,
        minor_trigger: usize,
        now: i64,
    ) -> StorageResult<()> {
        let tablet = self.services.storage.tablet_status(ls_id, tablet_id)?;
        if let Some(memtable) = &tablet.memtable {
            if let FreezeDecision::Freeze(reason) =
                self.fast_freeze
                    .check_need_fast_freeze(tablet.pair(), memtable, now)
            {
                self.services.freezer.freeze_tablet(ls_id, tablet_id)?;
                costore_log!(
                    log::Level::Info,
                    Component::TabletScheduler,
                    "fast_freeze",
                    "ls={} tablet={} reason={:?}",
                    ls_id,
                    tablet_id,
                    reason
                );
            }
        }
        if tablet.minor_sstable_cnt >= minor_trigger {
            self.services.dag_scheduler.schedule_merge_dag(&MergeDagParam {
                ls_id,
                tablet_id,
                merge_type: MergeType::Minor,
                merge_version: 0,
            })?;
            self.stats.inc_schedule_dag();
        }
        Ok(())
    }

    fn medium_pass(&self) -> StorageResult<()> {
        let storage = self.services.storage.as_ref();
        let merge_version = self.frozen_version();
        let mut iter = self.medium_iter.lock();
        if iter.start_batch(storage)? {
            self.medium_round_finished.store(true, Ordering::Release);
            self.weak_read_ts_ready.store(true, Ordering::Release);
        }
        while let Some(ls_id) = iter.next_ls(storage)? {
            if let Err(err) = self.schedule_ls_medium_merge(merge_version, ls_id, &mut iter) {
                iter.skip_ls();
                self.medium_round_finished.store(false, Ordering::Release);
                self.weak_read_ts_ready.store(false, Ordering::Release);
                if err.is_schedule_ignorable() {
                    tracing::debug!("medium pass skips {ls_id}: {err}");
                } else {
                    tracing::warn!("medium pass failed on {ls_id}: {err}");
                }
            }
        }
        let round_finished = iter.is_round_finished();
        drop(iter);

        self.set_round_phase(RoundPhase::MajorProgress);
        self.after_schedule_tenant_medium(merge_version, round_finished);
        Ok(())
    }

    fn schedule_ls_medium_merge(
        &self,
        merge_version: Scn,
        ls_id: LsId,
        iter: &mut ScheduleIterator,
    ) -> StorageResult<()> {
        let ls_info = self.services.storage.ls_info(ls_id)?;
        if !ls_info.is_leader {
            self.pending_medium.clear_ls(ls_id);
        }
        let weak_read_ts_ready = merge_version <= ls_info.weak_read_ts;
        if !weak_read_ts_ready {
            self.stats.inc_check_weak_read_ts();
            self.weak_read_ts_ready.store(false, Ordering::Release);
        }
        let major_frozen = if weak_read_ts_ready && self.could_major_merge_start() {
            merge_version
        } else {
            0
        };
        let guard = self.prohibit.start_medium(ls_id)?;
        if guard.is_none() {
            tracing::debug!("{ls_id} is transferring, no medium proposals this round");
        }
        let enable_adaptive = self.enable_adaptive_compaction();
        let parallel_row_threshold = self.config.read().parallel_row_threshold;

        let mut need_freeze = Vec::new();
        let mut wait_confirm = Vec::new();
        while let Some(tablet_id) = iter.next_tablet() {
            match self.schedule_tablet_medium(
                &ls_info,
                tablet_id,
                merge_version,
                major_frozen,
                enable_adaptive,
                guard.is_some(),
                parallel_row_threshold,
            ) {
                Ok(outcome) => {
                    if outcome.need_freeze {
                        need_freeze.push(tablet_id);
                    }
                    wait_confirm.extend(outcome.wait_confirm);
                }
                Err(err) => {
                    self.medium_round_finished.store(false, Ordering::Release);
                    self.handle_tablet_error("medium", ls_id, tablet_id, &err);
                }
            }
            if need_freeze.len() >= MERGE_BATCH_FREEZE_CNT {
                self.freeze_tablets(ls_id, &mut need_freeze);
            }
        }
        self.freeze_tablets(ls_id, &mut need_freeze);
        drop(guard);

        if !wait_confirm.is_empty() {
            let ls_info_map = HashMap::from([(ls_id, ls_info)]);
            let result = MediumScheduleFunc::batch_check_medium_finish(
                self.services.meta_table.as_ref(),
                &ls_info_map,
                &wait_confirm,
            )?;
            self.update_error_tablet_cnt(result.checksum_errors.len() as i64);
            self.next_round_for_leader(&wait_confirm, &result.finished)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_tablet_medium(
        &self,
        ls_info: &LsInfo,
        tablet_id: TabletId,
        merge_version: Scn,
        major_frozen: Scn,
        enable_adaptive: bool,
        ls_could_schedule_medium: bool,
        parallel_row_threshold: u64,
    ) -> StorageResult<TabletMediumOutcome> {
        let tablet = self.services.storage.tablet_status(ls_info.ls_id, tablet_id)?;
        if tablet.last_major_snapshot < merge_version {
            self.medium_round_finished.store(false, Ordering::Release);
        }
        let func = self.medium_func(ls_info, &tablet, parallel_row_threshold);

        let mut outcome = TabletMediumOutcome::default();
        if ls_info.is_leader && ls_could_schedule_medium {
            let major_snapshot = if major_frozen > tablet.last_major_snapshot {
                major_frozen
            } else {
                0
            };
            if major_snapshot > 0 || enable_adaptive {
                if let LeaderSchedule::WaitConfirm(check) =
                    func.schedule_next_medium_for_leader(major_snapshot, false)?
                {
                    outcome.wait_confirm = Some(check);
                }
            }
        }
        outcome.need_freeze = func
            .schedule_tablet_medium_merge(major_frozen)?
            .tablet_need_freeze;
        Ok(outcome)
    }

    fn medium_func<'a>(
        &'a self,
        ls_info: &'a LsInfo,
        tablet: &'a TabletStatus,
        parallel_row_threshold: u64,
    ) -> MediumScheduleFunc<'a> {
        MediumScheduleFunc::new(
            &self.services,
            &self.stats,
            &self.pending_medium,
            ls_info,
            tablet,
        )
        .with_parallel_row_threshold(parallel_row_threshold)
    }

    fn freeze_tablets(&self, ls_id: LsId, tablet_ids: &mut Vec<TabletId>) {
        for tablet_id in tablet_ids.drain(..) {
            if let Err(err) = self.services.freezer.freeze_tablet(ls_id, tablet_id) {
                self.handle_tablet_error("freeze", ls_id, tablet_id, &err);
            }
        }
    }

    fn after_schedule_tenant_medium(&self, merge_version: Scn, round_finished: bool) {
        if merge_version <= self.merged_version() {
            return;
        }
        if !round_finished {
            let start = self.stats.snapshot().start_timestamp;
            let waited = now_us() - start;
            if start > 0 && waited > WAIT_MEDIUM_CHECK_THRESHOLD.as_micros() as i64 {
                tracing::warn!(
                    "tenant {} major {merge_version} running for {}s: {}",
                    self.tenant_id,
                    waited / 1_000_000,
                    self.stats.snapshot()
                );
            }
            return;
        }
        if !self.weak_read_ts_ready.load(Ordering::Acquire) {
            return;
        }
        if self.stats.take_weak_read_ts_event() {
            tracing::info!(
                "tenant {} all ls read at frozen version {merge_version}",
                self.tenant_id
            );
        }
        if self.medium_round_finished.load(Ordering::Acquire) && self.could_major_merge_start() {
            self.merged_version.fetch_max(merge_version, Ordering::AcqRel);
            costore_log!(
                log::Level::Info,
                Component::TabletScheduler,
                "major_merge_finish",
                "tenant={} merged_version={} {}",
                self.tenant_id,
                merge_version,
                self.stats.snapshot()
            );
        }
    }

    /// Propose the next medium round for tablets whose previous round every
    /// replica confirmed. `tablet_ls_infos` are all tablets checked,
    /// `finish_tablet_ls_infos` the confirmed subset.
    pub fn schedule_next_round_for_leader(
        &self,
        tablet_ls_infos: &[TabletCheckInfo],
        finish_tablet_ls_infos: &[TabletCheckInfo],
    ) -> StorageResult<()> {
        self.check_serving()?;
        self.next_round_for_leader(tablet_ls_infos, finish_tablet_ls_infos)
    }

    fn next_round_for_leader(
        &self,
        tablet_ls_infos: &[TabletCheckInfo],
        finish_tablet_ls_infos: &[TabletCheckInfo],
    ) -> StorageResult<()> {
        let waiting = tablet_ls_infos.len().saturating_sub(finish_tablet_ls_infos.len());
        self.stats.add_wait_rs_validate(waiting as u64);
        self.stats.add_finish(finish_tablet_ls_infos.len() as u64);

        let mut by_ls: BTreeMap<LsId, Vec<TabletId>> = BTreeMap::new();
        for check in finish_tablet_ls_infos {
            by_ls.entry(check.ls_id).or_default().push(check.tablet_id);
        }
        let merge_version = self.frozen_version();
        let parallel_row_threshold = self.config.read().parallel_row_threshold;
        for (ls_id, tablet_ids) in by_ls {
            let ls_info = match self.services.storage.ls_info(ls_id) {
                Ok(ls_info) if ls_info.is_leader => ls_info,
                Ok(_) => continue,
                Err(err) if err.is_schedule_ignorable() => continue,
                Err(err) => return Err(err),
            };
            let Some(_guard) = self.prohibit.start_medium(ls_id)? else {
                continue;
            };
            let major_frozen = if merge_version <= ls_info.weak_read_ts
                && self.could_major_merge_start()
            {
                merge_version
            } else {
                0
            };
            for tablet_id in tablet_ids {
                let result = self
                    .services
                    .storage
                    .tablet_status(ls_id, tablet_id)
                    .and_then(|tablet| {
                        let major_snapshot = if major_frozen > tablet.last_major_snapshot {
                            major_frozen
                        } else {
                            0
                        };
                        self.medium_func(&ls_info, &tablet, parallel_row_threshold)
                            .schedule_next_medium_for_leader(major_snapshot, true)
                    });
                if let Err(err) = result {
                    self.handle_tablet_error("next round", ls_id, tablet_id, &err);
                }
            }
        }
        Ok(())
    }

    /// Propose a medium compaction for one tablet now, outside the periodic
    /// pass. Benign failures are swallowed.
    pub fn try_schedule_tablet_medium_merge(
        &self,
        ls_id: LsId,
        tablet_id: TabletId,
        is_rebuild_column_group: bool,
    ) -> StorageResult<()> {
        self.check_serving()?;
        let result: StorageResult<()> = (|| {
            let ls_info = self.services.storage.ls_info(ls_id)?;
            if !ls_info.is_leader {
                return Ok(());
            }
            let Some(_guard) = self.prohibit.start_medium(ls_id)? else {
                tracing::info!("{ls_id} is transferring, skip medium for {tablet_id}");
                return Ok(());
            };
            let tablet = self.services.storage.tablet_status(ls_id, tablet_id)?;
            let reason = if is_rebuild_column_group {
                MergeReason::RebuildColumnGroup
            } else {
                MergeReason::UserRequest
            };
            let parallel_row_threshold = self.config.read().parallel_row_threshold;
            self.medium_func(&ls_info, &tablet, parallel_row_threshold)
                .decide_medium_snapshot(reason, 0)?;
            Ok(())
        })();
        match result {
            Err(err) if err.is_schedule_ignorable() => {
                tracing::debug!("skip medium for {ls_id} {tablet_id}: {err}");
                Ok(())
            }
            other => other,
        }
    }

    /// Whether no merge dag of the log stream is running.
    pub fn check_ls_compaction_finish(&self, ls_id: LsId) -> StorageResult<bool> {
        self.services.storage.ls_info(ls_id)?;
        Ok(!self.services.dag_scheduler.has_running_dag(ls_id))
    }

    pub fn update_upper_trans_version_and_gc_sstable(&self) -> StorageResult<()> {
        self.check_serving()?;
        let storage = self.services.storage.as_ref();
        let mut iter = self.gc_iter.lock();
        iter.start_batch(storage)?;
        let mut released = 0usize;
        while let Some(ls_id) = iter.next_ls(storage)? {
            while let Some(tablet_id) = iter.next_tablet() {
                match storage.update_upper_trans_version_and_gc(ls_id, tablet_id) {
                    Ok(true) => released += 1,
                    Ok(false) => {}
                    Err(err) => self.handle_tablet_error("gc", ls_id, tablet_id, &err),
                }
            }
        }
        if released > 0 {
            costore_log!(
                log::Level::Info,
                Component::TabletScheduler,
                "gc_sstable",
                "tenant={} released_tablets={}",
                self.tenant_id,
                released
            );
        }
        Ok(())
    }
}
