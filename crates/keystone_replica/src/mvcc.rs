//! Read-side MVCC resolution: committed versions, write intents, and the
//! async cleanup of intents whose transactions already reached an outcome.
//!
//! A read that lands on a write intent resolves the producing transaction's
//! state. Readable intents (committed at or before the read timestamp) are
//! returned as the latest committed value and queued for an asynchronous
//! intent switch; unreadable ones fall back to the newest committed version
//! underneath. Cleanup per row is deduplicated so concurrent readers do not
//! stampede the storage, and writers await it before touching the same row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, warn};

use keystone_hlc::HybridTimestamp;

use crate::capabilities::StorageUpdateHandler;
use crate::error::{ReplicaError, Result};
use crate::tx_state::TransactionStateResolver;
use crate::types::{
    BinaryRow, ReadResult, ReplicationGroupId, RowId, TxId, TxState, TxStateMeta,
};

/// A resolved row together with the commit timestamp it was read at.
/// `commit_timestamp = None` means the row is the reader's own uncommitted
/// write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimedRow {
    pub row: BinaryRow,
    pub commit_timestamp: Option<HybridTimestamp>,
}

/// Deduplicated in-flight cleanup per row slot.
#[derive(Clone, Default)]
pub struct RowCleanupMap {
    inner: Arc<Mutex<HashMap<RowId, watch::Receiver<bool>>>>,
}

impl RowCleanupMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for an in-flight cleanup of `row_id`, if any.
    pub async fn await_row(&self, row_id: RowId) {
        let rx = {
            let guard = self.inner.lock().expect("row cleanup map poisoned");
            guard.get(&row_id).cloned()
        };
        if let Some(mut rx) = rx {
            // The sender completes (or drops) when the cleanup task ends.
            let _ = rx.wait_for(|done| *done).await;
        }
    }

    pub async fn await_rows(&self, row_ids: &[RowId]) {
        for row_id in row_ids {
            self.await_row(*row_id).await;
        }
    }

    /// Start `cleanup` for `row_id` unless one is already in flight.
    fn launch<F>(&self, row_id: RowId, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.inner.lock().expect("row cleanup map poisoned");
        if guard.contains_key(&row_id) {
            return;
        }
        let (tx, rx) = watch::channel(false);
        guard.insert(row_id, rx);
        let map = self.inner.clone();
        tokio::spawn(async move {
            cleanup();
            let _ = tx.send(true);
            map.lock().expect("row cleanup map poisoned").remove(&row_id);
        });
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.inner.lock().expect("row cleanup map poisoned").len()
    }
}

/// Read-side resolver for MVCC read results.
pub struct MvccResolver {
    group: ReplicationGroupId,
    tx_resolver: Arc<TransactionStateResolver>,
    update_handler: Arc<dyn StorageUpdateHandler>,
    cleanup: RowCleanupMap,
}

impl MvccResolver {
    pub fn new(
        group: ReplicationGroupId,
        tx_resolver: Arc<TransactionStateResolver>,
        update_handler: Arc<dyn StorageUpdateHandler>,
    ) -> Self {
        Self {
            group,
            tx_resolver,
            update_handler,
            cleanup: RowCleanupMap::new(),
        }
    }

    pub fn cleanup(&self) -> &RowCleanupMap {
        &self.cleanup
    }

    /// Resolve a storage read result to a row.
    ///
    /// With `tx_id` set (read-write context) an intent of the same
    /// transaction is returned as-is; locks prevent foreign pending intents
    /// from being observed, so anything else resolves through transaction
    /// state. With `ts` set (read-only context) the intent is readable iff
    /// its transaction committed at or before `ts`.
    ///
    /// `last_committed` lazily produces the newest committed version under
    /// the intent, for the unreadable case.
    pub async fn resolve_read_result<F>(
        &self,
        read: ReadResult,
        tx_id: Option<TxId>,
        ts: Option<HybridTimestamp>,
        last_committed: F,
    ) -> Result<Option<TimedRow>>
    where
        F: FnOnce() -> anyhow::Result<Option<TimedRow>> + Send,
    {
        let Some(intent) = read.write_intent else {
            return Ok(read.row.map(|row| TimedRow {
                row,
                commit_timestamp: read.commit_timestamp,
            }));
        };

        if ts.is_none() {
            let own = tx_id.expect("read-write resolution requires a transaction id");
            if own == intent.tx_id {
                return Ok(read.row.map(|row| TimedRow {
                    row,
                    commit_timestamp: None,
                }));
            }
        }

        let meta = self.resolve_and_schedule(intent, read.row_id).await?;

        if can_read_from_write_intent(&meta, ts) {
            // Still an intent in storage, but its transaction is known
            // committed and the async switch is on its way.
            Ok(read.row.map(|row| TimedRow {
                row,
                commit_timestamp: meta.commit_timestamp,
            }))
        } else {
            last_committed().map_err(|err| ReplicaError::replication(self.group, err))
        }
    }

    /// Resolve the producing transaction of a write intent and report
    /// whether the intent is readable at `ts` (`None` reads latest). A
    /// final outcome also queues the row for an asynchronous intent switch.
    pub async fn resolve_write_intent_readability(
        &self,
        intent: crate::types::WriteIntentMeta,
        row_id: RowId,
        ts: Option<HybridTimestamp>,
    ) -> Result<bool> {
        let meta = self.resolve_and_schedule(intent, row_id).await?;
        Ok(can_read_from_write_intent(&meta, ts))
    }

    async fn resolve_and_schedule(
        &self,
        intent: crate::types::WriteIntentMeta,
        row_id: RowId,
    ) -> Result<TxStateMeta> {
        let meta = self
            .tx_resolver
            .resolve_tx_state(intent.tx_id, intent.commit_group)
            .await
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        if meta.state.is_final() {
            self.schedule_row_cleanup(intent.tx_id, row_id, &meta);
        }

        Ok(meta)
    }

    /// Queue an intent switch for one resolved row, deduplicated per row.
    fn schedule_row_cleanup(&self, tx_id: TxId, row_id: RowId, meta: &TxStateMeta) {
        debug_assert!(meta.state.is_final());

        // Record the observed intent first so a switch after restart covers
        // rows discovered by readers, not only rows in the volatile set.
        self.update_handler.handle_write_intent_read(tx_id, row_id);

        let commit = meta.state == TxState::Committed;
        let commit_timestamp = meta.commit_timestamp;
        let handler = self.update_handler.clone();
        let group = self.group;

        self.cleanup.launch(row_id, move || {
            debug!(%group, %tx_id, %row_id, commit, "switching resolved write intent");
            handler.switch_write_intents(tx_id, commit, commit_timestamp);
        });
    }
}

/// Whether an intent produced by a transaction in state `meta` is readable
/// at `ts` (`None` reads latest).
fn can_read_from_write_intent(meta: &TxStateMeta, ts: Option<HybridTimestamp>) -> bool {
    match meta.state {
        TxState::Committed => match (ts, meta.commit_timestamp) {
            (None, _) => true,
            (Some(read_ts), Some(commit_ts)) => commit_ts <= read_ts,
            (Some(_), None) => {
                warn!("committed transaction without a commit timestamp");
                false
            }
        },
        // Pending, finishing, abandoned or aborted: the intent is not
        // readable; the caller falls back to the last committed version.
        _ => false,
    }
}

/// Assert that every write intent observed for one key belongs to the same
/// transaction; the exclusive row lock makes anything else a storage bug.
pub fn check_write_intents_belong_to_same_tx(reads: &[ReadResult]) {
    let mut first: Option<&ReadResult> = None;
    for read in reads.iter().filter(|read| read.is_write_intent()) {
        match first {
            None => first = Some(read),
            Some(expected) => {
                debug_assert_eq!(
                    expected.write_intent.map(|intent| intent.tx_id),
                    read.write_intent.map(|intent| intent.tx_id),
                    "write intents for one key belong to different transactions"
                );
            }
        }
    }
}
