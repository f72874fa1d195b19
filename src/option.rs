use std::time::Duration;

use crate::compaction::{
    bloom::BLOOM_FILTER_QUEUE_SIZE,
    medium::{DEFAULT_SCHEDULE_MEDIUM_INTERVAL, SCHEDULE_RANGE_ROW_COUNT_THRESHOLD},
};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub(crate) schedule_interval: Duration,
    pub(crate) gc_interval: Duration,
    pub(crate) tablet_batch_size: usize,
    pub(crate) enable_adaptive_compaction: bool,
    pub(crate) enable_fast_freeze: bool,
    pub(crate) minor_trigger_sstable_cnt: usize,
    pub(crate) bloom_filter_queue_size: usize,
    pub(crate) parallel_row_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            schedule_interval: DEFAULT_SCHEDULE_MEDIUM_INTERVAL,
            gc_interval: Duration::from_secs(30),
            tablet_batch_size: 1000,
            enable_adaptive_compaction: true,
            enable_fast_freeze: true,
            minor_trigger_sstable_cnt: 2,
            bloom_filter_queue_size: BLOOM_FILTER_QUEUE_SIZE,
            parallel_row_threshold: SCHEDULE_RANGE_ROW_COUNT_THRESHOLD,
        }
    }
}

impl SchedulerConfig {
    /// Interval of a scheduling round: minor pass, medium pass, major progress.
    pub fn schedule_interval(self, schedule_interval: Duration) -> Self {
        SchedulerConfig {
            schedule_interval,
            ..self
        }
    }

    pub fn gc_interval(self, gc_interval: Duration) -> Self {
        SchedulerConfig {
            gc_interval,
            ..self
        }
    }

    /// Tablets visited per pass per tick.
    pub fn tablet_batch_size(self, tablet_batch_size: usize) -> Self {
        SchedulerConfig {
            tablet_batch_size,
            ..self
        }
    }

    pub fn enable_adaptive_compaction(self, enable_adaptive_compaction: bool) -> Self {
        SchedulerConfig {
            enable_adaptive_compaction,
            ..self
        }
    }

    pub fn enable_fast_freeze(self, enable_fast_freeze: bool) -> Self {
        SchedulerConfig {
            enable_fast_freeze,
            ..self
        }
    }

    /// Minor sstables that trigger a minor merge.
    pub fn minor_trigger_sstable_cnt(self, minor_trigger_sstable_cnt: usize) -> Self {
        SchedulerConfig {
            minor_trigger_sstable_cnt,
            ..self
        }
    }

    pub fn bloom_filter_queue_size(self, bloom_filter_queue_size: usize) -> Self {
        SchedulerConfig {
            bloom_filter_queue_size,
            ..self
        }
    }

    pub fn parallel_row_threshold(self, parallel_row_threshold: u64) -> Self {
        SchedulerConfig {
            parallel_row_threshold,
            ..self
        }
    }
}
