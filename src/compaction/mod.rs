//! Tenant compaction scheduling.
//!
//! The [`TenantTabletScheduler`] drives minor, medium and major merges for one
//! tenant. Merges themselves run elsewhere: this module decides what to merge
//! and when, and talks to the rest of the system through [`services`].

/// Deduplicating bloom filter build queue.
pub(crate) mod bloom;
/// Early memtable freeze decisions.
pub mod fast_freeze;
/// Handles of background timer tasks.
mod handle;
/// Resumable log stream and tablet iteration.
mod iter;
/// Per tablet medium compaction decisions.
pub mod medium;
/// Medium compaction records and their per tablet list.
pub mod medium_info;
/// Flags that keep medium scheduling and transfer apart.
pub mod prohibit;
/// Tenant scheduler.
pub mod scheduler;
/// Collaborator traits.
pub mod services;
/// Round statistics.
pub mod stats;

use std::time::{SystemTime, UNIX_EPOCH};

pub use bloom::BloomFilterTask;
pub use fast_freeze::{FastFreezeChecker, FreezeDecision, FreezeReason};
pub use medium::{BatchCheckResult, MediumScheduleFunc, PendingMediumProposals, TabletCheckInfo};
pub use medium_info::{CompactionType, MediumCompactionInfo, MediumCompactionInfoList, MergeReason};
pub use prohibit::{MediumScheduleGuard, ProhibitFlag, ProhibitMediumMap};
pub use scheduler::{RoundPhase, SchedulerState, TenantTabletScheduler};
pub use stats::{ScheduleStatistics, ScheduleStatisticsSnapshot};

/// Wall clock in microseconds since the epoch.
pub(crate) fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or(0)
}
