//! Index handles and the lockers that guard them.
//!
//! Each index on the partition is registered with its storage handle and a
//! locker. Lookups take shared key locks held to transaction finish; writes
//! take short-term locks released as soon as the local apply finishes; a
//! sorted-index scan locks every key it returns (and the end-of-range
//! sentinel) so range edges cannot be moved by concurrent writers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::capabilities::{HashIndex, LockManager, RowCodec, SortedIndex};
use crate::cursor::{CursorHandle, RegisteredCursor};
use crate::locks::{Lock, LockKey, LockMode};
use crate::types::{BinaryRow, BinaryTuple, IndexId, IndexRow, TxId};

/// Storage handle of one secondary index.
#[derive(Clone)]
pub enum SecondaryIndex {
    Hash(Arc<dyn HashIndex>),
    Sorted(Arc<dyn SortedIndex>),
}

impl SecondaryIndex {
    pub fn id(&self) -> IndexId {
        match self {
            SecondaryIndex::Hash(index) => index.id(),
            SecondaryIndex::Sorted(index) => index.id(),
        }
    }
}

/// Key-point and key-range locks for one index.
///
/// The empty key encodes positive infinity for scan-end locks; the tuple
/// codec never produces an empty key.
#[derive(Clone)]
pub struct IndexLocker {
    index_id: IndexId,
    locks: Arc<dyn LockManager>,
    codec: Arc<dyn RowCodec>,
}

impl IndexLocker {
    pub fn new(index_id: IndexId, locks: Arc<dyn LockManager>, codec: Arc<dyn RowCodec>) -> Self {
        Self {
            index_id,
            locks,
            codec,
        }
    }

    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    fn key_bytes(&self, row: &BinaryRow) -> anyhow::Result<Bytes> {
        Ok(self.codec.extract_index_key(self.index_id, row)?.0)
    }

    /// Shared lock on a looked-up key, held until the transaction finishes.
    pub async fn locks_for_lookup_by_key(
        &self,
        tx_id: TxId,
        key: &BinaryTuple,
    ) -> anyhow::Result<Lock> {
        self.locks
            .acquire(
                tx_id,
                LockKey::IndexKey(self.index_id, key.0.clone()),
                LockMode::S,
            )
            .await
    }

    /// Exclusive short-term lock on the inserted key. The caller releases
    /// the returned lock once the local apply finishes.
    pub async fn locks_for_insert(
        &self,
        tx_id: TxId,
        row: &BinaryRow,
    ) -> anyhow::Result<Lock> {
        let key = self.key_bytes(row)?;
        self.locks
            .acquire(tx_id, LockKey::IndexKey(self.index_id, key), LockMode::X)
            .await
    }

    /// Intention-exclusive lock on the removed key, held until finish.
    pub async fn locks_for_remove(&self, tx_id: TxId, row: &BinaryRow) -> anyhow::Result<()> {
        let key = self.key_bytes(row)?;
        self.locks
            .acquire(tx_id, LockKey::IndexKey(self.index_id, key), LockMode::IX)
            .await?;
        Ok(())
    }

    /// Advance a sorted-index scan by one row, taking a shared lock on the
    /// returned key first. At exhaustion the lock lands on the positive
    /// infinity sentinel so inserts past the last key still conflict.
    /// The upper-bound check happens after the lock is granted, which is
    /// what closes the phantom window at the range edge.
    pub async fn locks_for_scan(
        &self,
        tx_id: TxId,
        cursor: &CursorHandle,
    ) -> anyhow::Result<Option<IndexRow>> {
        let row = {
            let mut guard = cursor.lock().expect("cursor poisoned");
            match &mut *guard {
                RegisteredCursor::IndexRows(cursor) => cursor.next()?,
                _ => anyhow::bail!("scan cursor is not a sorted index cursor"),
            }
        };

        let key = row
            .as_ref()
            .map(|row| row.key.0.clone())
            .unwrap_or_else(Bytes::new);
        self.locks
            .acquire(tx_id, LockKey::IndexKey(self.index_id, key), LockMode::S)
            .await?;

        Ok(row)
    }
}

/// One registered index: storage handle plus its locker.
#[derive(Clone)]
pub struct RegisteredIndex {
    pub storage: SecondaryIndex,
    pub locker: IndexLocker,
}

/// All indexes of the partition. The primary-key index is always present;
/// secondary indexes come and go with catalog changes, so the map sits
/// behind a shared lock and the coordinator snapshots it per operation.
pub struct IndexRegistry {
    pk_storage: Arc<dyn HashIndex>,
    pk_locker: IndexLocker,
    secondary: RwLock<HashMap<IndexId, RegisteredIndex>>,
}

impl IndexRegistry {
    pub fn new(
        pk_storage: Arc<dyn HashIndex>,
        locks: Arc<dyn LockManager>,
        codec: Arc<dyn RowCodec>,
    ) -> Self {
        let pk_locker = IndexLocker::new(pk_storage.id(), locks, codec);
        Self {
            pk_storage,
            pk_locker,
            secondary: RwLock::new(HashMap::new()),
        }
    }

    pub fn pk_storage(&self) -> &Arc<dyn HashIndex> {
        &self.pk_storage
    }

    pub fn pk_locker(&self) -> &IndexLocker {
        &self.pk_locker
    }

    pub fn register(&self, index: SecondaryIndex, locks: Arc<dyn LockManager>, codec: Arc<dyn RowCodec>) {
        let locker = IndexLocker::new(index.id(), locks, codec);
        self.secondary
            .write()
            .expect("index registry poisoned")
            .insert(index.id(), RegisteredIndex { storage: index, locker });
    }

    pub fn secondary(&self, index_id: IndexId) -> Option<RegisteredIndex> {
        self.secondary
            .read()
            .expect("index registry poisoned")
            .get(&index_id)
            .cloned()
    }

    /// Lockers of every index on the partition, the primary key included;
    /// the write path walks these for insert/remove locks.
    pub fn lockers(&self) -> Vec<IndexLocker> {
        let guard = self.secondary.read().expect("index registry poisoned");
        let mut lockers = Vec::with_capacity(guard.len() + 1);
        lockers.push(self.pk_locker.clone());
        lockers.extend(guard.values().map(|index| index.locker.clone()));
        lockers
    }
}
