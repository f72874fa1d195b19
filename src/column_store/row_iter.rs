//! Row-oriented reads over a composite table.

use std::sync::Arc;

use super::CoSsTable;
use crate::{
    access::{
        ColumnSource, Row, RowFetchIter, RowSource, StoreRowIterator, TableAccessContext,
        TableIterParam,
    },
    error::StorageResult,
    id::ColumnId,
};

/// Resolves row ids through the base table and stitches each row together
/// from every column group holding a requested column.
///
/// Requested columns stored in no column group were added after the table
/// was merged and read as null.
pub struct CoRowIterator {
    inner: RowFetchIter,
    column_groups: usize,
}

impl CoRowIterator {
    pub(crate) fn open(
        table: &CoSsTable,
        param: &TableIterParam,
        ctx: &TableAccessContext,
        sources: Vec<RowSource>,
    ) -> StorageResult<Self> {
        let base_idx = table.key().column_group_id();
        let mut pending: Vec<(usize, ColumnId)> = param
            .read_info
            .out_cols
            .iter()
            .copied()
            .enumerate()
            .collect();
        let mut column_sources = Vec::new();

        // an empty table has nothing but its base to read from
        let mut order = vec![base_idx];
        if !table.is_empty_co() {
            order.extend((0..table.column_group_cnt()).filter(|idx| *idx != base_idx));
        }
        for cg_idx in order {
            if pending.is_empty() {
                break;
            }
            let wrapper = table.fetch_column_group(cg_idx, true, ctx.loader.as_ref())?;
            let cg_table = Arc::clone(wrapper.get_sstable()?);
            let meta = cg_table.meta()?;
            let (hit, rest): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|(_, col)| meta.contains_column(*col));
            pending = rest;
            if !hit.is_empty() {
                column_sources.push(ColumnSource {
                    table: cg_table,
                    columns: hit,
                });
            }
        }
        if !pending.is_empty() {
            tracing::debug!(
                table = %table.key(),
                missing = pending.len(),
                "columns absent from every column group read as null"
            );
        }

        let column_groups = column_sources.len();
        Ok(Self {
            inner: RowFetchIter::new(
                Arc::clone(&ctx.reader),
                Arc::clone(table.base()),
                column_sources,
                param.read_info.out_cols.len(),
                param.batch_size,
                sources,
            ),
            column_groups,
        })
    }

    /// Number of column groups this iterator reads from.
    pub fn column_groups(&self) -> usize {
        self.column_groups
    }
}

impl StoreRowIterator for CoRowIterator {
    fn get_next_row(&mut self) -> StorageResult<Option<Row>> {
        self.inner.get_next_row()
    }
}
