use std::{mem::size_of, sync::Arc};

use bytes::{Buf, BufMut};

use crate::{
    error::{StorageError, StorageResult},
    serdes::{CodecError, Decode, Encode},
    sstable::{macro_ref::MacroRefGuard, SsTable},
};

/// Ordered column group sub-tables of a composite table, excluding the base.
///
/// Slots are reserved up front by `init` and filled exactly once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CgSsTableArray {
    reserved: usize,
    tables: Vec<Arc<SsTable>>,
}

impl CgSsTableArray {
    pub(crate) fn reserve(&mut self, count: usize) -> StorageResult<()> {
        let mut tables = Vec::new();
        tables.try_reserve_exact(count).map_err(|err| {
            StorageError::AllocationFailure(format!("reserve {count} column group slots: {err}"))
        })?;
        self.tables = tables;
        self.reserved = count;
        Ok(())
    }

    pub(crate) fn fill(&mut self, tables: Vec<Arc<SsTable>>) -> StorageResult<()> {
        if tables.len() != self.reserved {
            return Err(StorageError::invalid(format!(
                "{} column group tables supplied for {} slots",
                tables.len(),
                self.reserved
            )));
        }
        self.tables = tables;
        Ok(())
    }

    /// Number of reserved slots.
    pub fn count(&self) -> usize {
        self.reserved
    }

    pub fn is_filled(&self) -> bool {
        self.reserved > 0 && self.tables.len() == self.reserved
    }

    pub fn get(&self, pos: usize) -> Option<&Arc<SsTable>> {
        self.tables.get(pos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SsTable>> {
        self.tables.iter()
    }

    pub(crate) fn acquire_macro_refs(&self, guard: &mut MacroRefGuard<'_>) -> StorageResult<()> {
        for table in &self.tables {
            table.acquire_macro_refs(guard)?;
        }
        Ok(())
    }

    pub(crate) fn deep_copy_size(&self) -> usize {
        self.tables.len() * size_of::<Arc<SsTable>>()
            + self
                .tables
                .iter()
                .map(|table| table.deep_copy_size())
                .sum::<usize>()
    }

    pub(crate) fn deep_clone(&self) -> Self {
        Self {
            reserved: self.reserved,
            tables: self
                .tables
                .iter()
                .map(|table| Arc::new(table.deep_clone()))
                .collect(),
        }
    }

    pub(crate) fn tables_mut(&mut self) -> &mut [Arc<SsTable>] {
        &mut self.tables
    }
}

impl Encode for CgSsTableArray {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        (self.tables.len() as u32).encode(buf);
        for table in &self.tables {
            table.encode_normal(buf);
        }
    }

    fn size(&self) -> usize {
        size_of::<u32>()
            + self
                .tables
                .iter()
                .map(|table| table.encoded_size(false))
                .sum::<usize>()
    }
}

impl Decode for CgSsTableArray {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let count = u32::decode(buf)? as usize;
        let mut tables = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            tables.push(Arc::new(SsTable::decode_from(buf)?));
        }
        Ok(Self {
            reserved: count,
            tables,
        })
    }
}
