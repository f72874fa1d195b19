//! Collaborator interfaces beneath the table abstraction: block cache reads,
//! macro block pinning, and metadata loading.

use std::{ops::Range, sync::Arc};

use super::{MetaDiskAddr, SsTable};
use crate::{
    access::{Datum, RowkeyRange},
    error::StorageResult,
    id::{ColumnId, MacroBlockId, RowId},
};

/// Block cache facade used by the read path. Implementations may block on I/O.
pub trait BlockReader: Send + Sync {
    /// Row id holding `rowkey` in a rowkey-bearing table.
    fn locate_rowkey(&self, table: &SsTable, rowkey: &[Datum]) -> StorageResult<Option<RowId>>;

    /// Contiguous row ids covered by `range` in a rowkey-bearing table.
    fn locate_range(&self, table: &SsTable, range: &RowkeyRange) -> StorageResult<Range<RowId>>;

    /// Values of one column for the given row ids.
    fn read_column(
        &self,
        table: &SsTable,
        column: ColumnId,
        rows: Range<RowId>,
    ) -> StorageResult<Vec<Datum>>;
}

/// Reference counts on physical macro blocks.
pub trait BlockRefManager: Send + Sync {
    /// Pin one block.
    fn inc_ref(&self, id: MacroBlockId) -> StorageResult<()>;

    /// Unpin one block previously pinned by [`BlockRefManager::inc_ref`].
    fn dec_ref(&self, id: MacroBlockId);
}

/// Resolves an on-disk metadata address into a resident table.
pub trait TableStoreLoader: Send + Sync {
    /// Load the table stored at `addr` with full metadata.
    fn load_sstable(&self, addr: &MetaDiskAddr) -> StorageResult<Arc<SsTable>>;
}
