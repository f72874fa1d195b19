//! Resumable walk over the tenant's log streams and tablets.

use crate::{
    compaction::services::TenantStorage,
    error::{StorageError, StorageResult},
    id::{LsId, TabletId},
};

/// Walks every tablet of every log stream, at most `batch_size` tablets per
/// batch. A batch that runs out of budget resumes at the same tablet.
#[derive(Debug)]
pub(crate) struct ScheduleIterator {
    name: &'static str,
    batch_size: usize,
    ls_ids: Vec<LsId>,
    ls_idx: usize,
    tablet_ids: Vec<TabletId>,
    tablet_idx: usize,
    ls_loaded: bool,
    scheduled_in_batch: usize,
    round_finished: bool,
}

impl ScheduleIterator {
    pub(crate) fn new(name: &'static str, batch_size: usize) -> Self {
        Self {
            name,
            batch_size: batch_size.max(1),
            ls_ids: Vec::new(),
            ls_idx: 0,
            tablet_ids: Vec::new(),
            tablet_idx: 0,
            ls_loaded: false,
            scheduled_in_batch: 0,
            round_finished: true,
        }
    }

    pub(crate) fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }

    /// Open a batch. Returns `true` when the batch starts a new round.
    pub(crate) fn start_batch(&mut self, storage: &dyn TenantStorage) -> StorageResult<bool> {
        self.scheduled_in_batch = 0;
        if !self.round_finished {
            return Ok(false);
        }
        self.ls_ids = storage.ls_ids()?;
        self.ls_idx = 0;
        self.tablet_ids.clear();
        self.tablet_idx = 0;
        self.ls_loaded = false;
        self.round_finished = false;
        tracing::debug!("{} iterator starts a round over {} ls", self.name, self.ls_ids.len());
        Ok(true)
    }

    /// Log stream holding the next tablet. `None` once the batch budget is
    /// spent or the round is over.
    pub(crate) fn next_ls(&mut self, storage: &dyn TenantStorage) -> StorageResult<Option<LsId>> {
        loop {
            if self.batch_exhausted() || self.round_finished {
                return Ok(None);
            }
            if self.ls_loaded {
                if self.tablet_idx < self.tablet_ids.len() {
                    return Ok(Some(self.ls_ids[self.ls_idx]));
                }
                self.ls_idx += 1;
                self.ls_loaded = false;
            }
            let Some(&ls_id) = self.ls_ids.get(self.ls_idx) else {
                self.round_finished = true;
                return Ok(None);
            };
            match storage.tablet_ids(ls_id) {
                Ok(tablet_ids) => {
                    self.tablet_ids = tablet_ids;
                    self.tablet_idx = 0;
                    self.ls_loaded = true;
                }
                Err(StorageError::LsNotExist(_)) => {
                    tracing::debug!("{} iterator skips removed {ls_id}", self.name);
                    self.ls_idx += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Next tablet of the current log stream within the batch budget.
    pub(crate) fn next_tablet(&mut self) -> Option<TabletId> {
        if !self.ls_loaded || self.batch_exhausted() {
            return None;
        }
        let tablet_id = *self.tablet_ids.get(self.tablet_idx)?;
        self.tablet_idx += 1;
        self.scheduled_in_batch += 1;
        Some(tablet_id)
    }

    /// Skip the rest of the current log stream.
    pub(crate) fn skip_ls(&mut self) {
        self.tablet_idx = self.tablet_ids.len();
    }

    pub(crate) fn batch_exhausted(&self) -> bool {
        self.scheduled_in_batch >= self.batch_size
    }

    pub(crate) fn is_round_finished(&self) -> bool {
        self.round_finished
    }

    /// Forget the position, the next batch starts a new round.
    pub(crate) fn reset(&mut self) {
        self.round_finished = true;
        self.ls_ids.clear();
        self.tablet_ids.clear();
        self.ls_loaded = false;
    }
}
