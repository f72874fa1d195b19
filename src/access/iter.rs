//! Batch-at-a-time row assembly over one or more physical tables.

use std::{collections::VecDeque, ops::Range, sync::Arc};

use super::{Datum, Row, Rowkey, RowkeyRange, StoreRowIterator};
use crate::{
    error::{StorageError, StorageResult},
    id::{ColumnId, RowId},
    sstable::{block::BlockReader, SsTable},
};

/// One requested rowkey or rowkey range.
#[derive(Clone, Debug)]
pub(crate) enum RowSource {
    Key(Rowkey),
    Range(RowkeyRange),
}

/// Columns read from one physical table, tagged with their output position.
#[derive(Clone, Debug)]
pub(crate) struct ColumnSource {
    pub(crate) table: Arc<SsTable>,
    pub(crate) columns: Vec<(usize, ColumnId)>,
}

/// Resolves row ids through a rowkey-bearing locator table, then reads every
/// column source for the same row ids and stitches the values into rows.
///
/// Output positions that no source covers stay [`Datum::Null`].
pub(crate) struct RowFetchIter {
    reader: Arc<dyn BlockReader>,
    locator: Arc<SsTable>,
    column_sources: Vec<ColumnSource>,
    width: usize,
    batch_size: u64,
    pending: VecDeque<RowSource>,
    current: Range<RowId>,
    buffered: VecDeque<Row>,
}

impl RowFetchIter {
    pub(crate) fn new(
        reader: Arc<dyn BlockReader>,
        locator: Arc<SsTable>,
        column_sources: Vec<ColumnSource>,
        width: usize,
        batch_size: usize,
        sources: Vec<RowSource>,
    ) -> Self {
        Self {
            reader,
            locator,
            column_sources,
            width,
            batch_size: batch_size.max(1) as u64,
            pending: sources.into(),
            current: 0..0,
            buffered: VecDeque::new(),
        }
    }

    fn resolve(&self, source: RowSource) -> StorageResult<Range<RowId>> {
        match source {
            RowSource::Key(rowkey) => Ok(
                match self.reader.locate_rowkey(&self.locator, &rowkey)? {
                    Some(row_id) => row_id..row_id + 1,
                    None => 0..0,
                },
            ),
            RowSource::Range(range) => self.reader.locate_range(&self.locator, &range),
        }
    }

    /// Buffer the next batch. Returns `false` once every source is drained.
    fn fill_batch(&mut self) -> StorageResult<bool> {
        while self.current.is_empty() {
            let Some(next) = self.pending.pop_front() else {
                return Ok(false);
            };
            self.current = self.resolve(next)?;
        }
        let start = self.current.start;
        let end = self
            .current
            .end
            .min(start.saturating_add(self.batch_size));
        let count = (end - start) as usize;
        let mut batch: Vec<Row> = (0..count).map(|_| vec![Datum::Null; self.width]).collect();

        for source in &self.column_sources {
            for &(pos, column) in &source.columns {
                let values = self.reader.read_column(&source.table, column, start..end)?;
                if values.len() != count {
                    return Err(StorageError::internal(format!(
                        "column {column} of {} returned {} values for {count} rows",
                        source.table.key(),
                        values.len()
                    )));
                }
                for (row, value) in batch.iter_mut().zip(values) {
                    row[pos] = value;
                }
            }
        }
        self.current.start = end;
        self.buffered.extend(batch);
        Ok(true)
    }
}

impl StoreRowIterator for RowFetchIter {
    fn get_next_row(&mut self) -> StorageResult<Option<Row>> {
        loop {
            if let Some(row) = self.buffered.pop_front() {
                return Ok(Some(row));
            }
            if !self.fill_batch()? {
                return Ok(None);
            }
        }
    }
}
