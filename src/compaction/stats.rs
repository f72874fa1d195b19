use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
};

/// Counters of the current major round.
#[derive(Debug, Default)]
pub struct ScheduleStatistics {
    add_weak_read_ts_event_flag: AtomicBool,
    check_weak_read_ts_cnt: AtomicU64,
    start_timestamp: AtomicI64,
    schedule_dag_cnt: AtomicU64,
    submit_clog_cnt: AtomicU64,
    finish_cnt: AtomicU64,
    wait_rs_validate_cnt: AtomicU64,
}

/// Point-in-time copy of [`ScheduleStatistics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScheduleStatisticsSnapshot {
    pub add_weak_read_ts_event_flag: bool,
    pub check_weak_read_ts_cnt: u64,
    pub start_timestamp: i64,
    pub schedule_dag_cnt: u64,
    pub submit_clog_cnt: u64,
    pub finish_cnt: u64,
    pub wait_rs_validate_cnt: u64,
}

impl ScheduleStatistics {
    /// A new major round begins at `now_us`.
    pub fn start_merge(&self, now_us: i64) {
        self.add_weak_read_ts_event_flag
            .store(true, Ordering::Relaxed);
        self.check_weak_read_ts_cnt.store(0, Ordering::Relaxed);
        self.start_timestamp.store(now_us, Ordering::Relaxed);
        self.clear_tablet_cnt();
    }

    pub fn clear_tablet_cnt(&self) {
        self.schedule_dag_cnt.store(0, Ordering::Relaxed);
        self.submit_clog_cnt.store(0, Ordering::Relaxed);
        self.finish_cnt.store(0, Ordering::Relaxed);
        self.wait_rs_validate_cnt.store(0, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.add_weak_read_ts_event_flag
            .store(false, Ordering::Relaxed);
        self.check_weak_read_ts_cnt.store(0, Ordering::Relaxed);
        self.start_timestamp.store(0, Ordering::Relaxed);
        self.clear_tablet_cnt();
    }

    /// Returns whether the weak read ts event was still pending and clears it.
    pub fn take_weak_read_ts_event(&self) -> bool {
        self.add_weak_read_ts_event_flag
            .swap(false, Ordering::Relaxed)
    }

    pub fn inc_check_weak_read_ts(&self) {
        self.check_weak_read_ts_cnt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_schedule_dag(&self) {
        self.schedule_dag_cnt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submit_clog(&self) {
        self.submit_clog_cnt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_finish(&self, cnt: u64) {
        self.finish_cnt.fetch_add(cnt, Ordering::Relaxed);
    }

    pub fn add_wait_rs_validate(&self, cnt: u64) {
        self.wait_rs_validate_cnt.fetch_add(cnt, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScheduleStatisticsSnapshot {
        ScheduleStatisticsSnapshot {
            add_weak_read_ts_event_flag: self.add_weak_read_ts_event_flag.load(Ordering::Relaxed),
            check_weak_read_ts_cnt: self.check_weak_read_ts_cnt.load(Ordering::Relaxed),
            start_timestamp: self.start_timestamp.load(Ordering::Relaxed),
            schedule_dag_cnt: self.schedule_dag_cnt.load(Ordering::Relaxed),
            submit_clog_cnt: self.submit_clog_cnt.load(Ordering::Relaxed),
            finish_cnt: self.finish_cnt.load(Ordering::Relaxed),
            wait_rs_validate_cnt: self.wait_rs_validate_cnt.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for ScheduleStatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start_timestamp={} schedule_dag_cnt={} submit_clog_cnt={} finish_cnt={} \
             wait_rs_validate_cnt={} check_weak_read_ts_cnt={}",
            self.start_timestamp,
            self.schedule_dag_cnt,
            self.submit_clog_cnt,
            self.finish_cnt,
            self.wait_rs_validate_cnt,
            self.check_weak_read_ts_cnt
        )
    }
}
