//! Scoped macro block pinning.

use super::block::BlockRefManager;
use crate::{error::StorageResult, id::MacroBlockId};

/// Records every block it pinned and unpins exactly those when dropped,
/// unless [`MacroRefGuard::commit`] hands ownership of the pins to the caller.
pub(crate) struct MacroRefGuard<'a> {
    manager: &'a dyn BlockRefManager,
    acquired: Vec<MacroBlockId>,
}

impl<'a> MacroRefGuard<'a> {
    pub(crate) fn new(manager: &'a dyn BlockRefManager) -> Self {
        Self {
            manager,
            acquired: Vec::new(),
        }
    }

    pub(crate) fn acquire(&mut self, id: MacroBlockId) -> StorageResult<()> {
        self.manager.inc_ref(id)?;
        self.acquired.push(id);
        Ok(())
    }

    pub(crate) fn acquire_all<'i>(
        &mut self,
        ids: impl IntoIterator<Item = &'i MacroBlockId>,
    ) -> StorageResult<()> {
        for id in ids {
            self.acquire(*id)?;
        }
        Ok(())
    }

    /// Keep the pins. Returns how many blocks were pinned.
    pub(crate) fn commit(mut self) -> usize {
        let acquired = std::mem::take(&mut self.acquired);
        acquired.len()
    }
}

impl Drop for MacroRefGuard<'_> {
    fn drop(&mut self) {
        for id in self.acquired.drain(..).rev() {
            self.manager.dec_ref(id);
        }
    }
}
