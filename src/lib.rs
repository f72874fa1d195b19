//! Composite columnar tables and tenant compaction scheduling.
//!
//! Two halves live here. [`column_store`] holds the composite table: a base
//! physical table plus one physical sub-table per column group, readable row
//! by row or column group by column group. [`compaction`] holds the per tenant
//! scheduler that decides when tablets freeze and merge.
//!
//! Block I/O, the commit log, the meta report table and the schema service are
//! collaborators behind traits in [`sstable::block`] and
//! [`compaction::services`].

/// Row and column access vocabulary.
pub mod access;
/// Composite column-oriented tables.
pub mod column_store;
/// Tenant compaction scheduling.
pub mod compaction;
/// Error types.
pub mod error;
/// Identifiers.
pub mod id;
mod logging;
/// Scheduler configuration.
pub mod option;
/// Fixed-layout binary encoding.
pub mod serdes;
/// Physical tables.
pub mod sstable;

pub use crate::{
    column_store::CoSsTable,
    compaction::TenantTabletScheduler,
    error::{ErrorKind, StorageError, StorageResult},
    option::SchedulerConfig,
    sstable::SsTable,
};

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod tests_internal;
