//! Owned storage for deep-copied composite tables.

use super::CoSsTable;

/// Stable reference to a table placed in a [`MetaArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MetaHandle(usize);

/// Byte-budgeted arena of deep-copied composite tables.
#[derive(Debug)]
pub struct MetaArena {
    capacity: usize,
    used: usize,
    tables: Vec<CoSsTable>,
}

impl MetaArena {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            tables: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn get(&self, handle: MetaHandle) -> Option<&CoSsTable> {
        self.tables.get(handle.0)
    }

    /// Charge `size` bytes and take ownership of `table`. `None` when the
    /// budget is exhausted.
    pub(crate) fn place(&mut self, table: CoSsTable, size: usize) -> Option<MetaHandle> {
        if size > self.remaining() {
            return None;
        }
        self.used += size;
        self.tables.push(table);
        Some(MetaHandle(self.tables.len() - 1))
    }
}
