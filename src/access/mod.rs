//! Read-path vocabulary shared by physical tables and composite tables.

mod iter;

use std::{collections::HashMap, fmt, ops::Bound, ops::Range, sync::Arc};

pub(crate) use iter::{ColumnSource, RowFetchIter, RowSource};

use crate::{
    column_store::scanner::{CgIterator, CgScanner},
    error::StorageResult,
    id::{ColumnId, RowId, TabletId},
    sstable::block::{BlockReader, TableStoreLoader},
};

/// A single cell value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Datum {
    /// Missing value, also used for columns absent from a merged table.
    Null,
    /// Integer value.
    Int(i64),
    /// String value.
    Str(String),
}

impl From<i64> for Datum {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// Rowkey values in rowkey column order.
pub type Rowkey = Vec<Datum>;

/// Output row, one datum per requested column in request order.
pub type Row = Vec<Datum>;

/// Range of rowkeys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowkeyRange {
    /// Lower bound.
    pub start: Bound<Rowkey>,
    /// Upper bound.
    pub end: Bound<Rowkey>,
}

impl RowkeyRange {
    /// Range covering every row.
    pub fn whole() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Half-open range `[start, end)`.
    pub fn half_open(start: Rowkey, end: Rowkey) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Excluded(end),
        }
    }

    /// A range is valid when its lower bound does not exceed its upper bound.
    pub fn is_valid(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(lo), Bound::Included(hi)) => lo <= hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo < hi,
            _ => true,
        }
    }
}

/// Columns a read wants and how the rowkey is laid out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadInfo {
    /// Number of leading rowkey columns; their ids are `0..rowkey_cnt`.
    pub rowkey_cnt: usize,
    /// Requested output columns in output order.
    pub out_cols: Vec<ColumnId>,
}

impl ReadInfo {
    /// Build read info.
    pub fn new(rowkey_cnt: usize, out_cols: Vec<ColumnId>) -> Self {
        Self {
            rowkey_cnt,
            out_cols,
        }
    }

    /// True when only rowkey columns are requested.
    pub fn is_access_rowkey_only(&self) -> bool {
        self.out_cols
            .iter()
            .all(|col| (*col as usize) < self.rowkey_cnt)
    }

    /// Valid when at least one rowkey column and one output column exist.
    pub fn is_valid(&self) -> bool {
        self.rowkey_cnt > 0 && !self.out_cols.is_empty()
    }
}

/// Flags describing why a read happens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryFlag {
    /// The read is issued by a merge rather than a user query.
    pub daily_merge: bool,
}

/// Per-read parameters.
#[derive(Clone, Debug)]
pub struct TableIterParam {
    /// Tablet the read targets.
    pub tablet_id: TabletId,
    /// Requested columns.
    pub read_info: ReadInfo,
    /// Read through column groups rather than the row store.
    pub use_column_store: bool,
    /// Column group scanned by `cg_scan`.
    pub cg_idx: u32,
    /// Pushdown aggregation enabled.
    pub pd_aggregate: bool,
    /// Pushdown group-by enabled.
    pub pd_group_by: bool,
    /// Rows fetched per batch.
    pub batch_size: usize,
    /// Row range scanned by `cg_scan`, the whole group when unset.
    pub cg_rows: Option<Range<RowId>>,
}

impl TableIterParam {
    /// Parameters for a row-oriented read with default batching.
    pub fn new(tablet_id: TabletId, read_info: ReadInfo) -> Self {
        Self {
            tablet_id,
            read_info,
            use_column_store: true,
            cg_idx: 0,
            pd_aggregate: false,
            pd_group_by: false,
            batch_size: 256,
            cg_rows: None,
        }
    }

    /// Valid when the read info is valid and batches are non-empty.
    pub fn is_valid(&self) -> bool {
        self.read_info.is_valid() && self.batch_size > 0
    }

    /// Whether pushdown group-by is enabled.
    pub fn enable_pd_group_by(&self) -> bool {
        self.pd_group_by
    }

    /// Whether pushdown aggregation is enabled.
    pub fn enable_pd_aggregate(&self) -> bool {
        self.pd_aggregate
    }
}

/// Per-query context: collaborators plus pooled column-group scanners.
pub struct TableAccessContext {
    pub(crate) reader: Arc<dyn BlockReader>,
    pub(crate) loader: Arc<dyn TableStoreLoader>,
    pub(crate) query_flag: QueryFlag,
    /// At most one pooled scanner per column group.
    pub(crate) cg_iters: HashMap<u32, CgScanner>,
}

impl TableAccessContext {
    /// Build a context over the block cache and the table-store loader.
    pub fn new(reader: Arc<dyn BlockReader>, loader: Arc<dyn TableStoreLoader>) -> Self {
        Self {
            reader,
            loader,
            query_flag: QueryFlag::default(),
            cg_iters: HashMap::new(),
        }
    }

    /// Override the query flag.
    pub fn with_query_flag(mut self, query_flag: QueryFlag) -> Self {
        self.query_flag = query_flag;
        self
    }

    /// Number of pooled column-group scanners.
    pub fn pooled_cg_scanners(&self) -> usize {
        self.cg_iters.len()
    }

    /// Drop every pooled scanner, closing them first.
    pub fn reclaim_cg_scanners(&mut self) {
        for (_, mut scanner) in self.cg_iters.drain() {
            scanner.close();
        }
    }
}

impl fmt::Debug for TableAccessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableAccessContext")
            .field("query_flag", &self.query_flag)
            .field("cg_iters", &self.cg_iters.len())
            .finish()
    }
}

/// Lazy, finite sequence of rows. Restart by opening a new iterator.
pub trait StoreRowIterator: Send {
    /// Next row, or `None` once exhausted.
    fn get_next_row(&mut self) -> StorageResult<Option<Row>>;
}

/// Drain an iterator into a vector.
pub fn collect_rows(iter: &mut dyn StoreRowIterator) -> StorageResult<Vec<Row>> {
    let mut rows = Vec::new();
    while let Some(row) = iter.get_next_row()? {
        rows.push(row);
    }
    Ok(rows)
}
