//! Per-transaction scan cursor registry.
//!
//! Cursors are memoized under `(txId, scanId)` on the first batch request
//! and live until the scan is closed or the transaction finishes. When
//! closing several cursors, the first failure is returned to the caller
//! and the remaining ones are suppressed and logged; the registry entries
//! are removed either way.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::warn;

use crate::capabilities::{IndexRowCursor, PartitionScanCursor, RowIdCursor};
use crate::types::{ReplicationGroupId, TxId};

/// The cursor shapes a scan can be backed by.
pub enum RegisteredCursor {
    Partition(Box<dyn PartitionScanCursor>),
    RowIds(Box<dyn RowIdCursor>),
    IndexRows(Box<dyn IndexRowCursor>),
}

impl RegisteredCursor {
    fn close(&mut self) -> anyhow::Result<()> {
        match self {
            RegisteredCursor::Partition(cursor) => cursor.close(),
            RegisteredCursor::RowIds(cursor) => cursor.close(),
            RegisteredCursor::IndexRows(cursor) => cursor.close(),
        }
    }
}

/// Shared handle to a registered cursor. Batch loops lock it only around
/// `next()` calls so lock acquisition and row resolution can await in
/// between.
pub type CursorHandle = Arc<Mutex<RegisteredCursor>>;

pub struct CursorRegistry {
    group: ReplicationGroupId,
    inner: Mutex<BTreeMap<(TxId, u64), CursorHandle>>,
}

impl CursorRegistry {
    pub fn new(group: ReplicationGroupId) -> Self {
        Self {
            group,
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Return the cursor registered under `(tx_id, scan_id)`, creating it
    /// on first use.
    pub fn get_or_create(
        &self,
        tx_id: TxId,
        scan_id: u64,
        create: impl FnOnce() -> anyhow::Result<RegisteredCursor>,
    ) -> anyhow::Result<CursorHandle> {
        let mut guard = self.inner.lock().expect("cursor registry poisoned");
        if let Some(handle) = guard.get(&(tx_id, scan_id)) {
            return Ok(handle.clone());
        }
        let handle = Arc::new(Mutex::new(create()?));
        guard.insert((tx_id, scan_id), handle.clone());
        Ok(handle)
    }

    /// Close one scan. Missing entries are fine: close is idempotent.
    pub fn close(&self, tx_id: TxId, scan_id: u64) -> anyhow::Result<()> {
        let removed = {
            let mut guard = self.inner.lock().expect("cursor registry poisoned");
            guard.remove(&(tx_id, scan_id))
        };
        match removed {
            Some(handle) => self.close_handle(tx_id, scan_id, &handle),
            None => Ok(()),
        }
    }

    /// Close every cursor the transaction registered. The first close
    /// failure is returned; later ones are suppressed and logged.
    pub fn close_tx(&self, tx_id: TxId) -> anyhow::Result<()> {
        let removed: Vec<((TxId, u64), CursorHandle)> = {
            let mut guard = self.inner.lock().expect("cursor registry poisoned");
            let keys: Vec<(TxId, u64)> = guard
                .range((tx_id, u64::MIN)..=(tx_id, u64::MAX))
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| guard.remove(&key).map(|handle| (key, handle)))
                .collect()
        };

        self.close_removed(removed)
    }

    /// Close every leftover cursor; used on shutdown. Same aggregation as
    /// [`CursorRegistry::close_tx`].
    pub fn close_all(&self) -> anyhow::Result<()> {
        let removed: Vec<((TxId, u64), CursorHandle)> = {
            let mut guard = self.inner.lock().expect("cursor registry poisoned");
            std::mem::take(&mut *guard).into_iter().collect()
        };
        self.close_removed(removed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cursor registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close_removed(
        &self,
        removed: Vec<((TxId, u64), CursorHandle)>,
    ) -> anyhow::Result<()> {
        let mut first_err: Option<anyhow::Error> = None;

        for ((tx_id, scan_id), handle) in removed {
            let Err(err) = self.close_handle(tx_id, scan_id, &handle) else {
                continue;
            };
            if first_err.is_none() {
                first_err = Some(err);
            } else {
                warn!(
                    group = %self.group,
                    %tx_id,
                    scan_id,
                    error = %err,
                    "suppressed scan cursor close failure"
                );
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn close_handle(
        &self,
        tx_id: TxId,
        scan_id: u64,
        handle: &CursorHandle,
    ) -> anyhow::Result<()> {
        let Ok(mut cursor) = handle.lock() else {
            return Ok(());
        };
        cursor.close().with_context(|| {
            format!(
                "closing scan cursor [group={}, tx_id={tx_id}, scan_id={scan_id}]",
                self.group
            )
        })
    }
}
