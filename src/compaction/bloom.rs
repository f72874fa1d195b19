//! Deduplicating queue of bloom filter builds.

use std::{collections::HashSet, sync::Arc};

use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::{
    compaction::services::BloomFilterBuilder,
    error::{StorageError, StorageResult},
    id::MacroBlockId,
};

/// Upper bound of queued builds.
pub const BLOOM_FILTER_QUEUE_SIZE: usize = 10_000;

/// Build a bloom filter over one macro block's rowkey prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BloomFilterTask {
    pub table_id: u64,
    pub macro_id: MacroBlockId,
    pub prefix_len: i64,
}

/// A macro block is queued at most once until its build finishes.
#[derive(Debug, Clone)]
pub(crate) struct BloomFilterQueue {
    pending: Arc<Mutex<HashSet<MacroBlockId>>>,
    tx: Sender<BloomFilterTask>,
    rx: Receiver<BloomFilterTask>,
}

impl BloomFilterQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self {
            pending: Arc::new(Mutex::new(HashSet::new())),
            tx,
            rx,
        }
    }

    /// Returns `false` when the macro block is already pending.
    pub(crate) fn push(&self, task: BloomFilterTask) -> StorageResult<bool> {
        let mut pending = self.pending.lock();
        if !pending.insert(task.macro_id) {
            return Ok(false);
        }
        match self.tx.try_send(task) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(task)) => {
                pending.remove(&task.macro_id);
                Err(StorageError::Busy(format!(
                    "bloom filter queue full, drop {}",
                    task.macro_id
                )))
            }
            Err(TrySendError::Disconnected(task)) => {
                pending.remove(&task.macro_id);
                Err(StorageError::state("bloom filter queue closed"))
            }
        }
    }

    /// Builds queued or running.
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn receiver(&self) -> Receiver<BloomFilterTask> {
        self.rx.clone()
    }

    /// Run one build and release its macro block for future requests.
    pub(crate) fn run(&self, builder: &dyn BloomFilterBuilder, task: &BloomFilterTask) {
        if let Err(err) = builder.build(task) {
            tracing::warn!("build bloom filter for {}: {err}", task.macro_id);
        }
        self.pending.lock().remove(&task.macro_id);
    }

    /// Run every queued build on the calling thread.
    pub(crate) fn drain(&self, builder: &dyn BloomFilterBuilder) -> usize {
        let mut cnt = 0;
        while let Ok(task) = self.rx.try_recv() {
            self.run(builder, &task);
            cnt += 1;
        }
        cnt
    }

    pub(crate) fn clear(&self) {
        let mut pending = self.pending.lock();
        self.rx.drain().for_each(drop);
        pending.clear();
    }
}
