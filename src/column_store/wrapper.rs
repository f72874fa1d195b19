use std::sync::Arc;

use crate::{
    error::{StorageError, StorageResult},
    sstable::SsTable,
};

/// Binding of one requested column group to a physical table for the length
/// of a single read.
///
/// `meta_handle` is set only when full metadata was requested and the
/// resident table did not carry it, in which case it holds the table loaded
/// through the table-store loader.
#[derive(Clone, Debug, Default)]
pub struct CgTableWrapper {
    pub(crate) cg_sstable: Option<Arc<SsTable>>,
    pub(crate) meta_handle: Option<Arc<SsTable>>,
    pub(crate) need_meta: bool,
}

impl CgTableWrapper {
    pub fn is_valid(&self) -> bool {
        match &self.cg_sstable {
            None => false,
            Some(table) => !self.need_meta || table.is_loaded() || self.meta_handle.is_some(),
        }
    }

    /// Table to read from, preferring the loaded copy.
    pub fn get_sstable(&self) -> StorageResult<&Arc<SsTable>> {
        if !self.is_valid() {
            return Err(StorageError::state("column group wrapper is not valid"));
        }
        self.meta_handle
            .as_ref()
            .or(self.cg_sstable.as_ref())
            .ok_or_else(|| StorageError::state("column group wrapper has no table"))
    }

    pub fn need_meta(&self) -> bool {
        self.need_meta
    }

    pub fn is_meta_loaded_separately(&self) -> bool {
        self.meta_handle.is_some()
    }
}
