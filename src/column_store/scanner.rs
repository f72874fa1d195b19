//! Column group scanners.
//!
//! A scan over one column group is served by one of several strategies,
//! chosen by [`CgScannerKind::choose`] from the shape of the request. The
//! strategies share one capability interface, [`CgIterator`], and are pooled
//! in the access context so consecutive scans of the same group reuse them
//! through [`CgIterator::switch_context`].

use std::{collections::BTreeMap, ops::Range, sync::Arc};

use super::wrapper::CgTableWrapper;
use crate::{
    access::{Datum, Row, TableIterParam},
    error::{StorageError, StorageResult},
    id::{ColumnId, RowId},
    sstable::{block::BlockReader, SsTable},
};

/// Column group index of the virtual group, which is projected but never
/// stored.
pub const VIRTUAL_CG_IDX: u32 = i32::MAX as u32;

/// Scanner strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CgScannerKind {
    /// Row ids of the virtual group.
    Virtual,
    /// Default values of a column stored in no group.
    Default,
    /// Default values collapsed into a single group.
    DefaultGroupBy,
    /// One row at a time.
    SingleRow,
    /// Pushdown group-by over the first column.
    GroupBy,
    /// Pushdown aggregation.
    Aggregated,
    /// Projected rows.
    Row,
    /// Column-major values for filter evaluation.
    Plain,
}

/// Inputs of [`CgScannerKind::choose`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CgScanShape {
    pub virtual_cg: bool,
    /// The index is past the last stored group.
    pub out_of_range: bool,
    pub project_single_row: bool,
    pub is_projector: bool,
    pub pd_group_by: bool,
    pub pd_aggregate: bool,
}

impl CgScanShape {
    pub fn new(
        param: &TableIterParam,
        column_group_cnt: u32,
        is_projector: bool,
        project_single_row: bool,
    ) -> Self {
        Self {
            virtual_cg: param.cg_idx == VIRTUAL_CG_IDX,
            out_of_range: param.cg_idx >= column_group_cnt,
            project_single_row,
            is_projector,
            pd_group_by: param.enable_pd_group_by(),
            pd_aggregate: param.enable_pd_aggregate(),
        }
    }
}

impl CgScannerKind {
    pub fn choose(shape: CgScanShape) -> Self {
        if shape.virtual_cg {
            Self::Virtual
        } else if shape.project_single_row {
            if shape.out_of_range {
                Self::Default
            } else {
                Self::SingleRow
            }
        } else if shape.out_of_range {
            if shape.pd_group_by && shape.is_projector {
                Self::DefaultGroupBy
            } else {
                Self::Default
            }
        } else if shape.pd_group_by && shape.is_projector {
            Self::GroupBy
        } else if shape.pd_aggregate {
            Self::Aggregated
        } else if shape.is_projector {
            Self::Row
        } else {
            Self::Plain
        }
    }

    /// Whether the strategy reads a physical table.
    pub fn reads_table(&self) -> bool {
        !matches!(self, Self::Virtual | Self::Default | Self::DefaultGroupBy)
    }
}

/// One unit of output from a column group scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CgBlock {
    /// Row ids without values.
    RowIds(Range<RowId>),
    /// One vector per column, covering `rows`.
    Columns {
        rows: Range<RowId>,
        columns: Vec<Vec<Datum>>,
    },
    /// Row-major projection of `rows`.
    Rows { rows: Range<RowId>, values: Vec<Row> },
    /// Distinct values of the first column with their row counts.
    Groups(Vec<(Datum, u64)>),
    /// Row count plus per-column minimum and maximum of non-null values.
    Aggregate {
        row_count: u64,
        min: Vec<Datum>,
        max: Vec<Datum>,
    },
}

/// What a scanner is opened against.
pub struct CgScanSource {
    pub(crate) reader: Arc<dyn BlockReader>,
    pub(crate) wrapper: Option<CgTableWrapper>,
    /// Row count of the composite table, bounding virtual and default scans.
    pub(crate) base_row_count: u64,
}

/// Capability interface shared by every scanner strategy.
pub trait CgIterator {
    fn cg_idx(&self) -> u32;

    fn is_open(&self) -> bool;

    fn open(&mut self, param: &TableIterParam, source: CgScanSource) -> StorageResult<()>;

    /// Re-target an open scanner at a new query over the same column group.
    fn switch_context(&mut self, param: &TableIterParam, source: CgScanSource)
        -> StorageResult<()>;

    /// Next block, or `None` once the scan is exhausted.
    fn next_block(&mut self) -> StorageResult<Option<CgBlock>>;

    fn close(&mut self);
}

#[derive(Debug)]
struct RowCursor {
    next: RowId,
    end: RowId,
}

impl RowCursor {
    fn take(&mut self, batch: u64) -> Option<Range<RowId>> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        self.next = self.end.min(start.saturating_add(batch.max(1)));
        Some(start..self.next)
    }

    fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.next)
    }
}

/// State of an open scanner.
struct ScanState {
    reader: Arc<dyn BlockReader>,
    table: Option<Arc<SsTable>>,
    columns: Vec<ColumnId>,
    cursor: RowCursor,
    batch: u64,
}

impl ScanState {
    fn open(param: &TableIterParam, source: CgScanSource, reads_table: bool) -> StorageResult<Self> {
        let (table, columns, row_count) = match (reads_table, source.wrapper) {
            (true, Some(wrapper)) => {
                let table = Arc::clone(wrapper.get_sstable()?);
                let meta = table.meta()?;
                let mut columns: Vec<ColumnId> = meta
                    .column_ids
                    .iter()
                    .copied()
                    .filter(|col| param.read_info.out_cols.contains(col))
                    .collect();
                if columns.is_empty() {
                    columns = meta.column_ids.clone();
                }
                let row_count = meta.row_count;
                (Some(table), columns, row_count)
            }
            (true, None) => {
                return Err(StorageError::invalid(format!(
                    "column group {} scan without a table",
                    param.cg_idx
                )))
            }
            (false, _) => (None, Vec::new(), source.base_row_count),
        };
        let rows = param.cg_rows.clone().unwrap_or(0..row_count);
        if rows.start > rows.end {
            return Err(StorageError::invalid(format!(
                "inverted row range {}..{}",
                rows.start, rows.end
            )));
        }
        Ok(Self {
            reader: source.reader,
            table,
            columns,
            cursor: RowCursor {
                next: rows.start.min(row_count),
                end: rows.end.min(row_count),
            },
            batch: param.batch_size as u64,
        })
    }

    fn read_columns(&self, rows: Range<RowId>) -> StorageResult<Vec<Vec<Datum>>> {
        let Some(table) = &self.table else {
            return Ok(Vec::new());
        };
        self.columns
            .iter()
            .map(|col| self.reader.read_column(table, *col, rows.clone()))
            .collect()
    }

    fn read_rows(&self, rows: Range<RowId>) -> StorageResult<Vec<Row>> {
        let columns = self.read_columns(rows.clone())?;
        let count = (rows.end - rows.start) as usize;
        let mut out: Vec<Row> = (0..count)
            .map(|_| Vec::with_capacity(columns.len()))
            .collect();
        for column in columns {
            if column.len() != count {
                return Err(StorageError::internal(format!(
                    "column read returned {} values for {count} rows",
                    column.len()
                )));
            }
            for (row, value) in out.iter_mut().zip(column) {
                row.push(value);
            }
        }
        Ok(out)
    }
}

fn check_switch(cg_idx: u32, open: bool, param: &TableIterParam) -> StorageResult<()> {
    if !open {
        return Err(StorageError::state(format!(
            "switch context on closed scanner of column group {cg_idx}"
        )));
    }
    if param.cg_idx != cg_idx {
        tracing::error!(scanner = cg_idx, requested = param.cg_idx, "column group scanner mismatch");
        return Err(StorageError::internal(format!(
            "scanner of column group {cg_idx} asked to scan column group {}",
            param.cg_idx
        )));
    }
    Ok(())
}

macro_rules! scanner_struct {
    ($(#[$doc:meta])* $name:ident { $($field:ident : $ty:ty),* }) => {
        $(#[$doc])*
        pub struct $name {
            cg_idx: u32,
            state: Option<ScanState>,
            $($field: $ty,)*
        }

        impl $name {
            fn new(cg_idx: u32, $($field: $ty),*) -> Self {
                Self {
                    cg_idx,
                    state: None,
                    $($field,)*
                }
            }

            fn state(&mut self) -> StorageResult<&mut ScanState> {
                let cg_idx = self.cg_idx;
                self.state
                    .as_mut()
                    .ok_or_else(|| StorageError::state(format!("scanner of column group {cg_idx} is not open")))
            }
        }
    };
}

scanner_struct!(
    /// Yields row ids of the virtual column group.
    VirtualCgScanner {}
);
scanner_struct!(
    /// Yields nulls for a column that no group stores.
    DefaultCgScanner { group_by: bool, emitted: bool }
);
scanner_struct!(
    /// Yields projected rows one at a time.
    CgSingleRowScanner {}
);
scanner_struct!(
    /// Yields the distinct values of the first column once.
    CgGroupByScanner { emitted: bool }
);
scanner_struct!(
    /// Yields one aggregate block.
    CgAggregatedScanner { emitted: bool }
);
scanner_struct!(
    /// Yields batches of projected rows.
    CgRowScanner {}
);
scanner_struct!(
    /// Yields batches of column-major values.
    CgPlainScanner {}
);

impl VirtualCgScanner {
    fn next(&mut self) -> StorageResult<Option<CgBlock>> {
        let state = self.state()?;
        let batch = state.batch;
        Ok(state.cursor.take(batch).map(CgBlock::RowIds))
    }
}

impl DefaultCgScanner {
    fn reset(&mut self) {
        self.emitted = false;
    }

    fn next(&mut self) -> StorageResult<Option<CgBlock>> {
        let group_by = self.group_by;
        let emitted = self.emitted;
        let state = self.state()?;
        if group_by {
            if emitted {
                return Ok(None);
            }
            let total = state.cursor.remaining();
            state.cursor.next = state.cursor.end;
            self.emitted = true;
            return Ok(Some(CgBlock::Groups(vec![(Datum::Null, total)])));
        }
        let batch = state.batch;
        Ok(state.cursor.take(batch).map(|rows| {
            let count = (rows.end - rows.start) as usize;
            CgBlock::Columns {
                rows,
                columns: vec![vec![Datum::Null; count]],
            }
        }))
    }
}

impl CgSingleRowScanner {
    fn next(&mut self) -> StorageResult<Option<CgBlock>> {
        let state = self.state()?;
        match state.cursor.take(1) {
            Some(rows) => {
                let values = state.read_rows(rows.clone())?;
                Ok(Some(CgBlock::Rows { rows, values }))
            }
            None => Ok(None),
        }
    }
}

impl CgGroupByScanner {
    fn reset(&mut self) {
        self.emitted = false;
    }

    fn next(&mut self) -> StorageResult<Option<CgBlock>> {
        if self.emitted {
            return Ok(None);
        }
        let state = self.state()?;
        let mut groups: BTreeMap<Datum, u64> = BTreeMap::new();
        let batch = state.batch;
        while let Some(rows) = state.cursor.take(batch) {
            let mut columns = state.read_columns(rows)?;
            if columns.is_empty() {
                continue;
            }
            for value in columns.swap_remove(0) {
                *groups.entry(value).or_default() += 1;
            }
        }
        self.emitted = true;
        Ok(Some(CgBlock::Groups(groups.into_iter().collect())))
    }
}

impl CgAggregatedScanner {
    fn reset(&mut self) {
        self.emitted = false;
    }

    fn next(&mut self) -> StorageResult<Option<CgBlock>> {
        if self.emitted {
            return Ok(None);
        }
        let state = self.state()?;
        let width = state.columns.len();
        let mut min: Vec<Datum> = vec![Datum::Null; width];
        let mut max: Vec<Datum> = vec![Datum::Null; width];
        let mut row_count = 0;
        let batch = state.batch;
        while let Some(rows) = state.cursor.take(batch) {
            row_count += rows.end - rows.start;
            for (pos, column) in state.read_columns(rows)?.into_iter().enumerate() {
                for value in column.into_iter().filter(|v| *v != Datum::Null) {
                    if min[pos] == Datum::Null || value < min[pos] {
                        min[pos] = value.clone();
                    }
                    if max[pos] == Datum::Null || value > max[pos] {
                        max[pos] = value;
                    }
                }
            }
        }
        self.emitted = true;
        Ok(Some(CgBlock::Aggregate {
            row_count,
            min,
            max,
        }))
    }
}

impl CgRowScanner {
    fn next(&mut self) -> StorageResult<Option<CgBlock>> {
        let state = self.state()?;
        let batch = state.batch;
        match state.cursor.take(batch) {
            Some(rows) => {
                let values = state.read_rows(rows.clone())?;
                Ok(Some(CgBlock::Rows { rows, values }))
            }
            None => Ok(None),
        }
    }
}

impl CgPlainScanner {
    fn next(&mut self) -> StorageResult<Option<CgBlock>> {
        let state = self.state()?;
        let batch = state.batch;
        match state.cursor.take(batch) {
            Some(rows) => {
                let columns = state.read_columns(rows.clone())?;
                Ok(Some(CgBlock::Columns { rows, columns }))
            }
            None => Ok(None),
        }
    }
}

/// A pooled column group scanner of any strategy.
pub enum CgScanner {
    Virtual(VirtualCgScanner),
    Default(DefaultCgScanner),
    SingleRow(CgSingleRowScanner),
    GroupBy(CgGroupByScanner),
    Aggregated(CgAggregatedScanner),
    Row(CgRowScanner),
    Plain(CgPlainScanner),
}

macro_rules! dispatch {
    ($self:expr, $scanner:ident => $body:expr) => {
        match $self {
            CgScanner::Virtual($scanner) => $body,
            CgScanner::Default($scanner) => $body,
            CgScanner::SingleRow($scanner) => $body,
            CgScanner::GroupBy($scanner) => $body,
            CgScanner::Aggregated($scanner) => $body,
            CgScanner::Row($scanner) => $body,
            CgScanner::Plain($scanner) => $body,
        }
    };
}

impl CgScanner {
    /// A closed scanner of the given strategy.
    pub fn new(kind: CgScannerKind, cg_idx: u32) -> Self {
        match kind {
            CgScannerKind::Virtual => Self::Virtual(VirtualCgScanner::new(cg_idx)),
            CgScannerKind::Default => Self::Default(DefaultCgScanner::new(cg_idx, false, false)),
            CgScannerKind::DefaultGroupBy => {
                Self::Default(DefaultCgScanner::new(cg_idx, true, false))
            }
            CgScannerKind::SingleRow => Self::SingleRow(CgSingleRowScanner::new(cg_idx)),
            CgScannerKind::GroupBy => Self::GroupBy(CgGroupByScanner::new(cg_idx, false)),
            CgScannerKind::Aggregated => {
                Self::Aggregated(CgAggregatedScanner::new(cg_idx, false))
            }
            CgScannerKind::Row => Self::Row(CgRowScanner::new(cg_idx)),
            CgScannerKind::Plain => Self::Plain(CgPlainScanner::new(cg_idx)),
        }
    }

    pub fn kind(&self) -> CgScannerKind {
        match self {
            Self::Virtual(_) => CgScannerKind::Virtual,
            Self::Default(scanner) if scanner.group_by => CgScannerKind::DefaultGroupBy,
            Self::Default(_) => CgScannerKind::Default,
            Self::SingleRow(_) => CgScannerKind::SingleRow,
            Self::GroupBy(_) => CgScannerKind::GroupBy,
            Self::Aggregated(_) => CgScannerKind::Aggregated,
            Self::Row(_) => CgScannerKind::Row,
            Self::Plain(_) => CgScannerKind::Plain,
        }
    }

    fn reset_progress(&mut self) {
        match self {
            Self::Default(scanner) => scanner.reset(),
            Self::GroupBy(scanner) => scanner.reset(),
            Self::Aggregated(scanner) => scanner.reset(),
            _ => {}
        }
    }
}

impl CgIterator for CgScanner {
    fn cg_idx(&self) -> u32 {
        dispatch!(self, scanner => scanner.cg_idx)
    }

    fn is_open(&self) -> bool {
        dispatch!(self, scanner => scanner.state.is_some())
    }

    fn open(&mut self, param: &TableIterParam, source: CgScanSource) -> StorageResult<()> {
        if self.is_open() {
            return Err(StorageError::state(format!(
                "scanner of column group {} is already open",
                self.cg_idx()
            )));
        }
        let state = ScanState::open(param, source, self.kind().reads_table())?;
        self.reset_progress();
        dispatch!(self, scanner => {
            scanner.cg_idx = param.cg_idx;
            scanner.state = Some(state);
        });
        Ok(())
    }

    fn switch_context(
        &mut self,
        param: &TableIterParam,
        source: CgScanSource,
    ) -> StorageResult<()> {
        check_switch(self.cg_idx(), self.is_open(), param)?;
        self.close();
        self.open(param, source)
    }

    fn next_block(&mut self) -> StorageResult<Option<CgBlock>> {
        dispatch!(self, scanner => scanner.next())
    }

    fn close(&mut self) {
        dispatch!(self, scanner => scanner.state = None);
    }
}

impl std::fmt::Debug for CgScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgScanner")
            .field("kind", &self.kind())
            .field("cg_idx", &self.cg_idx())
            .field("open", &self.is_open())
            .finish()
    }
}
