//! Early freeze decisions for active memtables.
//!
//! The checker looks at live memtable statistics and asks for a freeze when
//! a row is written too often or when deleted and overwritten rows pile up.
//! Tombstone thresholds adapt per tablet: a tablet that keeps hitting the
//! threshold quickly gets a higher one, a quiet tablet drifts back to the
//! default.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;

use crate::{compaction::services::MemtableStats, id::TabletLsPair};

/// Memtables younger than this are left alone.
pub const FAST_FREEZE_INTERVAL: Duration = Duration::from_secs(300);
/// Writes to one row per interval that make the row a hotspot.
pub const HOTSPOT_BASE_THRESHOLD: u64 = 10_000;
pub const TOMBSTONE_DEFAULT_ROW_COUNT: u64 = 250_000;
pub const TOMBSTONE_MAX_ROW_COUNT: u64 = 500_000;
pub const TOMBSTONE_STEP_ROW_COUNT: u64 = 50_000;

const FAST_FREEZE_INTERVAL_US: i64 = FAST_FREEZE_INTERVAL.as_micros() as i64;

/// The outcome of a fast freeze check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FreezeDecision {
    NoOp,
    Freeze(FreezeReason),
}

/// Why a memtable should be frozen early.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FreezeReason {
    /// One row took more writes than the age-scaled limit.
    Hotspot { writes: u64, limit: u64 },
    /// Updated plus deleted rows reached the tablet's adaptive threshold.
    Tombstone { rows: u64, limit: u64 },
}

/// Hotspot limit for a memtable of the given age: the base threshold per
/// interval, scaled to the age.
pub fn hotspot_limit(age_us: i64) -> u64 {
    let age_us = age_us.max(FAST_FREEZE_INTERVAL_US) as u128;
    let limit = u128::from(HOTSPOT_BASE_THRESHOLD) * age_us / FAST_FREEZE_INTERVAL_US as u128;
    u64::try_from(limit).unwrap_or(u64::MAX)
}

/// Adaptive tombstone limit of one tablet and the freeze it was last
/// stepped from.
#[derive(Clone, Copy, Debug)]
struct TombstoneLimit {
    rows: u64,
    frozen_time_us: i64,
}

#[derive(Debug)]
pub struct FastFreezeChecker {
    enable: AtomicBool,
    thresholds: Mutex<HashMap<TabletLsPair, TombstoneLimit>>,
}

impl Default for FastFreezeChecker {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FastFreezeChecker {
    pub fn new(enable: bool) -> Self {
        Self {
            enable: AtomicBool::new(enable),
            thresholds: Mutex::new(HashMap::new()),
        }
    }

    pub fn reload_config(&self, enable: bool) {
        self.enable.store(enable, Ordering::Release);
    }

    /// Whether checks run at all.
    pub fn need_check(&self) -> bool {
        self.enable.load(Ordering::Acquire)
    }

    /// Current tombstone threshold of a tablet.
    pub fn tombstone_threshold(&self, key: &TabletLsPair) -> u64 {
        self.thresholds
            .lock()
            .get(key)
            .map_or(TOMBSTONE_DEFAULT_ROW_COUNT, |limit| limit.rows)
    }

    pub fn reset(&self) {
        self.thresholds.lock().clear();
    }

    pub fn check_need_fast_freeze(
        &self,
        key: TabletLsPair,
        stats: &MemtableStats,
        now_us: i64,
    ) -> FreezeDecision {
        if !self.need_check() || !stats.is_active {
            return FreezeDecision::NoOp;
        }
        let age_us = now_us - stats.create_time_us;
        if age_us < FAST_FREEZE_INTERVAL_US {
            return FreezeDecision::NoOp;
        }
        let limit = hotspot_limit(age_us);
        if stats.hotspot_write_count >= limit {
            return FreezeDecision::Freeze(FreezeReason::Hotspot {
                writes: stats.hotspot_write_count,
                limit,
            });
        }
        let limit = self.update_tombstone_threshold(key, stats);
        let rows = stats.tombstone_row_count();
        if rows >= limit {
            FreezeDecision::Freeze(FreezeReason::Tombstone { rows, limit })
        } else {
            FreezeDecision::NoOp
        }
    }

    /// Step the tablet's threshold from the last freeze cycle and return it.
    /// A freeze cycle moves the threshold once, however often it is checked.
    fn update_tombstone_threshold(&self, key: TabletLsPair, stats: &MemtableStats) -> u64 {
        let mut thresholds = self.thresholds.lock();
        let old = thresholds.get(&key).copied().unwrap_or(TombstoneLimit {
            rows: TOMBSTONE_DEFAULT_ROW_COUNT,
            frozen_time_us: 0,
        });
        if stats.frozen_time_us <= 0 || stats.frozen_time_us == old.frozen_time_us {
            return old.rows;
        }
        let rows = if stats.frozen_time_us - stats.create_time_us < 2 * FAST_FREEZE_INTERVAL_US {
            (old.rows + TOMBSTONE_STEP_ROW_COUNT).min(TOMBSTONE_MAX_ROW_COUNT)
        } else {
            old.rows
                .saturating_sub(TOMBSTONE_STEP_ROW_COUNT)
                .max(TOMBSTONE_DEFAULT_ROW_COUNT)
        };
        thresholds.insert(
            key,
            TombstoneLimit {
                rows,
                frozen_time_us: stats.frozen_time_us,
            },
        );
        rows
    }
}
