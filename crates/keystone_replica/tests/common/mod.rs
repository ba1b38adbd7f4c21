//! In-memory harness for coordinator integration tests.
//!
//! One `Harness` wires a `PartitionReplica` to in-memory collaborators: an
//! MVCC row store with a primary-key hash index and one sorted secondary
//! index, a two-phase-locking lock manager with real waiting, a loopback
//! raft client that round-trips every command through the serde envelope,
//! and a loopback transaction manager that turns cleanup fan-out into
//! write-intent-switch requests against the same replica.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use keystone_hlc::{HybridClock, HybridTimestamp, SafeTimeTracker};
use keystone_replica::capabilities::{
    CatalogService, ClusterNodeResolver, HashIndex, IndexRowCursor, LockManager,
    MvPartitionStorage, PartitionScanCursor, PlacementDriver, RaftClient, RowCodec, RowIdCursor,
    SchemaSyncService, SortedIndex, StorageUpdateHandler, TxManager, TxStatePartitionClient,
    TxStateStorage,
};
use keystone_replica::command::{ReplicaCommand, RowUpdate};
use keystone_replica::error::RaftError;
use keystone_replica::index::{IndexRegistry, SecondaryIndex};
use keystone_replica::locks::{Lock, LockKey, LockMode};
use keystone_replica::replica::{PartitionReplica, ReplicaDeps, ReplicaResponse, ReplicaResult};
use keystone_replica::request::{
    ReplicaRequest, RoSingleRowPkRequest, RwPkOp, RwRowOp, RwSingleRowPkRequest,
    RwSingleRowRequest, TxFinishRequest,
};
use keystone_replica::tx_state::TxStateMap;
use keystone_replica::types::{
    BinaryRow, BinaryTuple, BinaryTuplePrefix, IndexId, IndexRow, LeaseMeta, ReadResult,
    ReplicationGroupId, RowId, SchemaVersion, TableId, TransactionResult, TxId, TxMeta, TxState,
    TxStateMeta, WriteIntentMeta,
};

pub const TABLE_ID: TableId = 7;
pub const PARTITION_ID: u32 = 0;
pub const PK_INDEX_ID: IndexId = 1;
pub const SORTED_INDEX_ID: IndexId = 2;
pub const HASH_INDEX_ID: IndexId = 3;
pub const LOCAL_NODE: &str = "node-local";
pub const LOCAL_NODE_ID: &str = "id-local";
pub const COORDINATOR_ID: &str = "id-coordinator";

pub fn group() -> ReplicationGroupId {
    ReplicationGroupId::new(TABLE_ID, PARTITION_ID)
}

/// Install a log subscriber once; run with `RUST_LOG=debug` to see the
/// coordinator's tracing output while debugging a test.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

// ----------------------------------------------------------------------
// Row layout helpers: payload = [key_len u8][key][value]
// ----------------------------------------------------------------------

pub fn row(key: &str, value: &str) -> BinaryRow {
    let mut payload = Vec::with_capacity(1 + key.len() + value.len());
    payload.push(key.len() as u8);
    payload.extend_from_slice(key.as_bytes());
    payload.extend_from_slice(value.as_bytes());
    BinaryRow::new(1, payload)
}

pub fn pk(key: &str) -> BinaryTuple {
    BinaryTuple::new(Bytes::copy_from_slice(key.as_bytes()))
}

pub fn prefix(key: &str) -> BinaryTuplePrefix {
    BinaryTuplePrefix::new(Bytes::copy_from_slice(key.as_bytes()))
}

pub fn value_of(row: &BinaryRow) -> String {
    let key_len = row.payload[0] as usize;
    String::from_utf8_lossy(&row.payload[1 + key_len..]).to_string()
}

fn key_bytes_of(row: &BinaryRow) -> Bytes {
    let key_len = row.payload[0] as usize;
    row.payload.slice(1..1 + key_len)
}

pub struct LayoutCodec;

impl RowCodec for LayoutCodec {
    fn extract_pk(&self, row: &BinaryRow) -> anyhow::Result<BinaryTuple> {
        Ok(BinaryTuple::new(key_bytes_of(row)))
    }

    fn extract_index_key(
        &self,
        _index_id: IndexId,
        row: &BinaryRow,
    ) -> anyhow::Result<BinaryTuple> {
        self.extract_pk(row)
    }
}

// ----------------------------------------------------------------------
// MVCC partition with indexes
// ----------------------------------------------------------------------

#[derive(Clone)]
struct IntentVersion {
    tx_id: TxId,
    row: Option<BinaryRow>,
}

#[derive(Default, Clone)]
struct VersionChain {
    /// Committed versions ordered by commit timestamp.
    committed: Vec<(HybridTimestamp, Option<BinaryRow>)>,
    intent: Option<IntentVersion>,
}

impl VersionChain {
    fn newest_commit_ts(&self) -> Option<HybridTimestamp> {
        self.committed.last().map(|(ts, _)| *ts)
    }

    fn committed_at(&self, ts: HybridTimestamp) -> Option<&(HybridTimestamp, Option<BinaryRow>)> {
        self.committed.iter().rev().find(|(cts, _)| *cts <= ts)
    }

    fn push_committed(&mut self, ts: HybridTimestamp, row: Option<BinaryRow>) {
        if self.committed.last().is_some_and(|(last, _)| *last == ts) {
            // Idempotent replay of the same commit.
            return;
        }
        self.committed.push((ts, row));
        self.committed.sort_by_key(|(ts, _)| *ts);
    }
}

#[derive(Default)]
struct PartitionState {
    rows: HashMap<RowId, VersionChain>,
    /// Rows each transaction holds write intents on.
    tx_rows: HashMap<TxId, HashSet<RowId>>,
    pk_index: HashMap<Bytes, Vec<RowId>>,
    sorted_index: BTreeMap<Bytes, Vec<RowId>>,
}

impl PartitionState {
    fn index_row(&mut self, key: Bytes, row_id: RowId) {
        let bucket = self.pk_index.entry(key.clone()).or_default();
        if !bucket.contains(&row_id) {
            bucket.push(row_id);
        }
        let bucket = self.sorted_index.entry(key).or_default();
        if !bucket.contains(&row_id) {
            bucket.push(row_id);
        }
    }

    fn apply_update(
        &mut self,
        tx_id: TxId,
        row_id: RowId,
        row: Option<&BinaryRow>,
        track_write_intent: bool,
        commit_timestamp: Option<HybridTimestamp>,
    ) {
        if let Some(row) = row {
            self.index_row(key_bytes_of(row), row_id);
        }

        let chain = self.rows.entry(row_id).or_default();
        match commit_timestamp {
            // One-phase apply: the version lands committed right away.
            Some(cts) => chain.push_committed(cts, row.cloned()),
            None => {
                chain.intent = Some(IntentVersion {
                    tx_id,
                    row: row.cloned(),
                });
                if track_write_intent {
                    self.tx_rows.entry(tx_id).or_default().insert(row_id);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct MemPartition {
    state: Arc<Mutex<PartitionState>>,
    /// When set, every cursor handed out by this partition (and its index
    /// handles) fails its `close()`, for cleanup-error-path tests.
    fail_cursor_close: Arc<AtomicBool>,
}

impl MemPartition {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_cursor_close(&self, fail: bool) {
        self.fail_cursor_close.store(fail, Ordering::SeqCst);
    }

    fn read_chain(chain: &VersionChain, row_id: RowId, ts: HybridTimestamp) -> ReadResult {
        let newest = chain.newest_commit_ts();

        // The write intent shadows only timestamps past the newest
        // committed version; at or before it, reads land on committed data.
        let intent_visible = chain.intent.is_some() && newest.map_or(true, |cts| ts > cts);
        if intent_visible {
            let intent = chain.intent.as_ref().unwrap();
            return ReadResult {
                row_id,
                row: intent.row.clone(),
                commit_timestamp: None,
                newest_commit_timestamp: newest,
                write_intent: Some(WriteIntentMeta {
                    tx_id: intent.tx_id,
                    commit_group: group(),
                }),
            };
        }

        match chain.committed_at(ts) {
            Some((cts, row)) => ReadResult {
                row_id,
                row: row.clone(),
                commit_timestamp: Some(*cts),
                newest_commit_timestamp: None,
                write_intent: None,
            },
            None => ReadResult {
                row_id,
                row: None,
                commit_timestamp: None,
                newest_commit_timestamp: None,
                write_intent: None,
            },
        }
    }

    /// Number of live write intents, for leak assertions.
    pub fn intent_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .rows
            .values()
            .filter(|chain| chain.intent.is_some())
            .count()
    }

    pub fn committed_value(&self, key: &str, ts: HybridTimestamp) -> Option<String> {
        let state = self.state.lock().unwrap();
        let row_ids = state
            .pk_index
            .get(&Bytes::copy_from_slice(key.as_bytes()))?
            .clone();
        for row_id in row_ids {
            let chain = state.rows.get(&row_id)?;
            if let Some((_, Some(row))) = chain.committed_at(ts) {
                return Some(value_of(row));
            }
        }
        None
    }
}

impl MvPartitionStorage for MemPartition {
    fn read(&self, row_id: RowId, ts: HybridTimestamp) -> anyhow::Result<ReadResult> {
        let state = self.state.lock().unwrap();
        let chain = state.rows.get(&row_id).cloned().unwrap_or_default();
        Ok(Self::read_chain(&chain, row_id, ts))
    }

    fn scan(&self, ts: HybridTimestamp) -> anyhow::Result<Box<dyn PartitionScanCursor>> {
        let mut row_ids: Vec<RowId> = {
            let state = self.state.lock().unwrap();
            state.rows.keys().copied().collect()
        };
        row_ids.sort();
        Ok(Box::new(MemPartitionCursor {
            state: self.state.clone(),
            row_ids,
            pos: 0,
            current: None,
            ts,
            fail_close: self.fail_cursor_close.clone(),
        }))
    }
}

impl StorageUpdateHandler for MemPartition {
    fn handle_update(
        &self,
        tx_id: TxId,
        row_id: RowId,
        _commit_group: ReplicationGroupId,
        row: Option<&BinaryRow>,
        track_write_intent: bool,
        commit_timestamp: Option<HybridTimestamp>,
        _last_commit_timestamp: Option<HybridTimestamp>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.apply_update(tx_id, row_id, row, track_write_intent, commit_timestamp);
    }

    fn handle_update_all(
        &self,
        tx_id: TxId,
        _commit_group: ReplicationGroupId,
        rows: &[RowUpdate],
        track_write_intent: bool,
        commit_timestamp: Option<HybridTimestamp>,
    ) {
        let mut state = self.state.lock().unwrap();
        for update in rows {
            state.apply_update(
                tx_id,
                update.row_id,
                update.row.as_ref(),
                track_write_intent,
                commit_timestamp,
            );
        }
    }

    fn switch_write_intents(
        &self,
        tx_id: TxId,
        commit: bool,
        commit_timestamp: Option<HybridTimestamp>,
    ) {
        let mut state = self.state.lock().unwrap();
        let Some(row_ids) = state.tx_rows.remove(&tx_id) else {
            return;
        };
        for row_id in row_ids {
            let Some(chain) = state.rows.get_mut(&row_id) else {
                continue;
            };
            let Some(intent) = chain.intent.take() else {
                continue;
            };
            if intent.tx_id != tx_id {
                chain.intent = Some(intent);
                continue;
            }
            if commit {
                let cts = commit_timestamp.expect("committing switch without a timestamp");
                chain.push_committed(cts, intent.row);
            }
        }
    }

    fn handle_write_intent_read(&self, tx_id: TxId, row_id: RowId) {
        let mut state = self.state.lock().unwrap();
        state.tx_rows.entry(tx_id).or_default().insert(row_id);
    }
}

struct MemPartitionCursor {
    state: Arc<Mutex<PartitionState>>,
    row_ids: Vec<RowId>,
    pos: usize,
    current: Option<RowId>,
    ts: HybridTimestamp,
    fail_close: Arc<AtomicBool>,
}

fn injected_close(fail_close: &AtomicBool) -> anyhow::Result<()> {
    if fail_close.load(Ordering::SeqCst) {
        anyhow::bail!("injected cursor close failure");
    }
    Ok(())
}

impl PartitionScanCursor for MemPartitionCursor {
    fn next(&mut self) -> anyhow::Result<Option<ReadResult>> {
        let state = self.state.lock().unwrap();
        while self.pos < self.row_ids.len() {
            let row_id = self.row_ids[self.pos];
            self.pos += 1;
            let chain = state.rows.get(&row_id).cloned().unwrap_or_default();
            let read = MemPartition::read_chain(&chain, row_id, self.ts);
            if !read.is_empty() {
                self.current = Some(row_id);
                return Ok(Some(read));
            }
        }
        Ok(None)
    }

    fn committed(&mut self, ts: HybridTimestamp) -> anyhow::Result<Option<BinaryRow>> {
        let Some(row_id) = self.current else {
            return Ok(None);
        };
        let state = self.state.lock().unwrap();
        let chain = state.rows.get(&row_id).cloned().unwrap_or_default();
        Ok(chain.committed_at(ts).and_then(|(_, row)| row.clone()))
    }

    fn close(&mut self) -> anyhow::Result<()> {
        injected_close(&self.fail_close)
    }
}

// ----------------------------------------------------------------------
// Index handles over the shared partition state
// ----------------------------------------------------------------------

pub struct HashIndexHandle {
    partition: Arc<MemPartition>,
    id: IndexId,
}

struct SnapshotRowIds {
    row_ids: Vec<RowId>,
    pos: usize,
    fail_close: Arc<AtomicBool>,
}

impl RowIdCursor for SnapshotRowIds {
    fn next(&mut self) -> anyhow::Result<Option<RowId>> {
        let row_id = self.row_ids.get(self.pos).copied();
        self.pos += 1;
        Ok(row_id)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        injected_close(&self.fail_close)
    }
}

impl HashIndex for HashIndexHandle {
    fn id(&self) -> IndexId {
        self.id
    }

    fn lookup(&self, key: &BinaryTuple) -> anyhow::Result<Box<dyn RowIdCursor>> {
        let state = self.partition.state.lock().unwrap();
        let row_ids = state.pk_index.get(&key.0).cloned().unwrap_or_default();
        Ok(Box::new(SnapshotRowIds {
            row_ids,
            pos: 0,
            fail_close: self.partition.fail_cursor_close.clone(),
        }))
    }
}

pub struct SortedIndexHandle {
    partition: Arc<MemPartition>,
}

struct SnapshotIndexRows {
    rows: Vec<IndexRow>,
    pos: usize,
    fail_close: Arc<AtomicBool>,
}

impl IndexRowCursor for SnapshotIndexRows {
    fn next(&mut self) -> anyhow::Result<Option<IndexRow>> {
        let row = self.rows.get(self.pos).cloned();
        self.pos += 1;
        Ok(row)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        injected_close(&self.fail_close)
    }
}

impl SortedIndex for SortedIndexHandle {
    fn id(&self) -> IndexId {
        SORTED_INDEX_ID
    }

    fn scan(
        &self,
        lower: Option<&BinaryTuplePrefix>,
        upper: Option<&BinaryTuplePrefix>,
        flags: keystone_replica::types::ScanFlags,
    ) -> anyhow::Result<Box<dyn IndexRowCursor>> {
        let state = self.partition.state.lock().unwrap();
        let mut rows = Vec::new();
        for (key, row_ids) in state.sorted_index.iter() {
            if let Some(lower) = lower {
                let past_lower = match key.cmp(&lower.0) {
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => flags.lower_inclusive,
                    std::cmp::Ordering::Greater => true,
                };
                if !past_lower {
                    continue;
                }
            }
            if let Some(upper) = upper {
                let within_upper = match key.cmp(&upper.0) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Equal => flags.upper_inclusive,
                    std::cmp::Ordering::Greater => false,
                };
                if !within_upper {
                    break;
                }
            }
            for row_id in row_ids {
                rows.push(IndexRow {
                    key: BinaryTuple::new(key.clone()),
                    row_id: *row_id,
                });
            }
        }
        Ok(Box::new(SnapshotIndexRows {
            rows,
            pos: 0,
            fail_close: self.partition.fail_cursor_close.clone(),
        }))
    }

    fn compare_to_bound(
        &self,
        key: &BinaryTuple,
        bound: &BinaryTuplePrefix,
        include_equality: bool,
    ) -> std::cmp::Ordering {
        match key.0.cmp(&bound.0) {
            // With the equality flag folded into the bound, a matching key
            // still lies inside the range.
            std::cmp::Ordering::Equal if include_equality => std::cmp::Ordering::Less,
            other => other,
        }
    }
}

// ----------------------------------------------------------------------
// Lock manager with two-phase-locking semantics and real waiting
// ----------------------------------------------------------------------

#[derive(Default)]
struct LockQueueEntry {
    /// Granted modes per transaction; one entry per acquired lock.
    holders: HashMap<TxId, Vec<LockMode>>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl LockQueueEntry {
    fn effective(modes: &[LockMode]) -> Option<LockMode> {
        modes.iter().copied().reduce(LockMode::supremum)
    }

    fn can_grant(&self, tx_id: TxId, mode: LockMode) -> bool {
        self.holders.iter().all(|(holder, modes)| {
            *holder == tx_id
                || Self::effective(modes).is_none_or(|held| held.compatible(mode))
        })
    }
}

#[derive(Default)]
pub struct MemLockManager {
    inner: Mutex<HashMap<LockKey, LockQueueEntry>>,
}

impl MemLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn holds_any(&self, tx_id: TxId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.values().any(|entry| entry.holders.contains_key(&tx_id))
    }

    pub fn holds_mode(&self, tx_id: TxId, mode: LockMode) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.values().any(|entry| {
            entry
                .holders
                .get(&tx_id)
                .is_some_and(|modes| modes.contains(&mode))
        })
    }

    fn wake_waiters(entry: &mut LockQueueEntry) {
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

#[async_trait]
impl LockManager for MemLockManager {
    async fn acquire(&self, tx_id: TxId, key: LockKey, mode: LockMode) -> anyhow::Result<Lock> {
        loop {
            let waiter = {
                let mut inner = self.inner.lock().unwrap();
                let entry = inner.entry(key.clone()).or_default();
                if entry.can_grant(tx_id, mode) {
                    entry.holders.entry(tx_id).or_default().push(mode);
                    return Ok(Lock { tx_id, key, mode });
                }
                let (tx, rx) = oneshot::channel();
                entry.waiters.push(tx);
                rx
            };
            let _ = waiter.await;
        }
    }

    fn release(&self, lock: &Lock) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.get_mut(&lock.key) else {
            return;
        };
        if let Some(modes) = entry.holders.get_mut(&lock.tx_id) {
            if let Some(pos) = modes.iter().position(|mode| *mode == lock.mode) {
                modes.remove(pos);
            }
            if modes.is_empty() {
                entry.holders.remove(&lock.tx_id);
            }
        }
        Self::wake_waiters(entry);
    }

    fn release_all(&self, tx_id: TxId) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.values_mut() {
            if entry.holders.remove(&tx_id).is_some() {
                Self::wake_waiters(entry);
            }
        }
    }
}

// ----------------------------------------------------------------------
// Loopback raft: applies commands through the serde envelope
// ----------------------------------------------------------------------

pub struct LoopbackRaft {
    safe_time: Arc<SafeTimeTracker>,
    tx_meta: Arc<MemTxStateStorage>,
    pub submitted: Mutex<Vec<ReplicaCommand>>,
    /// When set, lock-release markers are recorded but not applied, so
    /// tests can observe the pre-marker durable state deterministically.
    pub defer_lock_release_markers: Mutex<bool>,
}

impl LoopbackRaft {
    pub fn new(safe_time: Arc<SafeTimeTracker>, tx_meta: Arc<MemTxStateStorage>) -> Arc<Self> {
        Arc::new(Self {
            safe_time,
            tx_meta,
            submitted: Mutex::new(Vec::new()),
            defer_lock_release_markers: Mutex::new(false),
        })
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn apply_deferred_lock_release_markers(&self) {
        *self.defer_lock_release_markers.lock().unwrap() = false;
        let deferred: Vec<ReplicaCommand> = self
            .submitted
            .lock()
            .unwrap()
            .iter()
            .filter(|cmd| matches!(cmd, ReplicaCommand::MarkLocksReleased { .. }))
            .cloned()
            .collect();
        for command in deferred {
            if let ReplicaCommand::MarkLocksReleased { tx_id, .. } = command {
                self.tx_meta.set_locks_released(tx_id);
            }
        }
    }
}

#[async_trait]
impl RaftClient for LoopbackRaft {
    async fn run(
        &self,
        command: ReplicaCommand,
    ) -> std::result::Result<Option<TransactionResult>, RaftError> {
        // Every command travels the wire form, like a real log entry.
        let encoded = command.encode().map_err(RaftError::Other)?;
        let command = ReplicaCommand::decode(&encoded).map_err(RaftError::Other)?;

        self.submitted.lock().unwrap().push(command.clone());
        self.safe_time.advance(command.safe_time());

        match command {
            ReplicaCommand::FinishTx {
                tx_id,
                commit,
                commit_timestamp,
                enlisted_groups,
                ..
            } => {
                let proposed_state = if commit {
                    TxState::Committed
                } else {
                    TxState::Aborted
                };

                if let Some(existing) = self.tx_meta.get_meta(tx_id) {
                    if existing.state != proposed_state {
                        return Err(RaftError::UnexpectedTransactionState {
                            tx_id,
                            result: TransactionResult {
                                state: existing.state,
                                commit_timestamp: existing.commit_timestamp,
                            },
                        });
                    }
                    return Ok(Some(TransactionResult {
                        state: existing.state,
                        commit_timestamp: existing.commit_timestamp,
                    }));
                }

                let meta = TxMeta {
                    state: proposed_state,
                    commit_timestamp: if commit { commit_timestamp } else { None },
                    enlisted_groups,
                    locks_released: false,
                };
                self.tx_meta.put(tx_id, meta.clone());
                Ok(Some(TransactionResult {
                    state: meta.state,
                    commit_timestamp: meta.commit_timestamp,
                }))
            }
            ReplicaCommand::MarkLocksReleased { tx_id, .. } => {
                if !*self.defer_lock_release_markers.lock().unwrap() {
                    self.tx_meta.set_locks_released(tx_id);
                }
                Ok(None)
            }
            // Updates are pre-applied (or post-applied) by the primary
            // itself; write-intent switches run locally in parallel with
            // replication. Nothing else to do on a single-replica harness.
            _ => Ok(None),
        }
    }
}

// ----------------------------------------------------------------------
// Durable transaction state storage
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct MemTxStateStorage {
    inner: Mutex<HashMap<TxId, TxMeta>>,
}

impl MemTxStateStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get_meta(&self, tx_id: TxId) -> Option<TxMeta> {
        self.inner.lock().unwrap().get(&tx_id).cloned()
    }

    pub fn put(&self, tx_id: TxId, meta: TxMeta) {
        self.inner.lock().unwrap().insert(tx_id, meta);
    }

    pub fn set_locks_released(&self, tx_id: TxId) {
        if let Some(meta) = self.inner.lock().unwrap().get_mut(&tx_id) {
            meta.locks_released = true;
        }
    }
}

impl TxStateStorage for MemTxStateStorage {
    fn get(&self, tx_id: TxId) -> anyhow::Result<Option<TxMeta>> {
        Ok(self.get_meta(tx_id))
    }

    fn scan(&self) -> anyhow::Result<Vec<(TxId, TxMeta)>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|(tx_id, meta)| (*tx_id, meta.clone()))
            .collect())
    }
}

// ----------------------------------------------------------------------
// Catalog, schema sync, placement, roster
// ----------------------------------------------------------------------

pub struct ScriptedCatalog {
    /// `physical ts -> schema version` steps for the test table.
    steps: Mutex<BTreeMap<u64, SchemaVersion>>,
    dropped_at: Mutex<Option<u64>>,
    pub forward_ok: Mutex<bool>,
    pub backward_ok: Mutex<bool>,
}

impl ScriptedCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new([(0, 1)].into_iter().collect()),
            dropped_at: Mutex::new(None),
            forward_ok: Mutex::new(false),
            backward_ok: Mutex::new(false),
        })
    }

    pub fn add_schema_step(&self, physical: u64, version: SchemaVersion) {
        self.steps.lock().unwrap().insert(physical, version);
    }

    pub fn drop_table_at(&self, physical: u64) {
        *self.dropped_at.lock().unwrap() = Some(physical);
    }
}

impl CatalogService for ScriptedCatalog {
    fn table_exists_at(&self, _table_id: TableId, ts: HybridTimestamp) -> bool {
        if let Some(dropped) = *self.dropped_at.lock().unwrap() {
            if ts.physical() >= dropped {
                return false;
            }
        }
        true
    }

    fn table_schema_at(&self, _table_id: TableId, ts: HybridTimestamp) -> Option<SchemaVersion> {
        let steps = self.steps.lock().unwrap();
        steps
            .range(..=ts.physical())
            .next_back()
            .map(|(_, version)| *version)
    }

    fn active_catalog_version(&self, _ts: HybridTimestamp) -> u32 {
        1
    }

    fn forward_compatible(&self, _t: TableId, _f: SchemaVersion, _to: SchemaVersion) -> bool {
        *self.forward_ok.lock().unwrap()
    }

    fn backward_compatible(&self, _t: TableId, _f: SchemaVersion, _to: SchemaVersion) -> bool {
        *self.backward_ok.lock().unwrap()
    }
}

pub struct ImmediateSchemaSync;

#[async_trait]
impl SchemaSyncService for ImmediateSchemaSync {
    async fn wait_for_metadata_completeness(&self, _ts: HybridTimestamp) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct ScriptedPlacement {
    lease: Mutex<Option<LeaseMeta>>,
}

impl ScriptedPlacement {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lease: Mutex::new(Some(LeaseMeta {
                leaseholder: LOCAL_NODE.to_string(),
                start_time: HybridTimestamp::new(1, 0),
                expiration_time: HybridTimestamp::MAX,
            })),
        })
    }

    pub fn current(&self) -> Option<LeaseMeta> {
        self.lease.lock().unwrap().clone()
    }

    pub fn set_lease(&self, lease: Option<LeaseMeta>) {
        *self.lease.lock().unwrap() = lease;
    }

    pub fn token(&self) -> u64 {
        self.current().expect("no lease installed").enlistment_token()
    }
}

#[async_trait]
impl PlacementDriver for ScriptedPlacement {
    async fn primary_replica(
        &self,
        _group: ReplicationGroupId,
        _at: HybridTimestamp,
    ) -> anyhow::Result<Option<LeaseMeta>> {
        Ok(self.current())
    }
}

#[derive(Default)]
pub struct ScriptedRoster {
    nodes: Mutex<HashMap<String, String>>,
}

impl ScriptedRoster {
    pub fn new() -> Arc<Self> {
        let roster = Self::default();
        roster
            .nodes
            .lock()
            .unwrap()
            .extend([
                (LOCAL_NODE_ID.to_string(), LOCAL_NODE.to_string()),
                (COORDINATOR_ID.to_string(), "node-coordinator".to_string()),
            ]);
        Arc::new(roster)
    }

    pub fn remove(&self, node_id: &str) {
        self.nodes.lock().unwrap().remove(node_id);
    }
}

impl ClusterNodeResolver for ScriptedRoster {
    fn consistent_name(&self, node_id: &str) -> Option<String> {
        self.nodes.lock().unwrap().get(node_id).cloned()
    }
}

// ----------------------------------------------------------------------
// Loopback transaction services
// ----------------------------------------------------------------------

/// Routes cleanup fan-out and recovery finishes back into the replica
/// under test, the way the real transaction manager routes them to the
/// enlisted partition primaries.
pub struct LoopbackTxServices {
    replica: OnceLock<Arc<PartitionReplica>>,
    placement: Arc<ScriptedPlacement>,
    pub cleanup_hints: Mutex<Vec<(String, TxId)>>,
}

impl LoopbackTxServices {
    pub fn new(placement: Arc<ScriptedPlacement>) -> Arc<Self> {
        Arc::new(Self {
            replica: OnceLock::new(),
            placement,
            cleanup_hints: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, replica: Arc<PartitionReplica>) {
        let _ = self.replica.set(replica);
    }

    fn replica(&self) -> anyhow::Result<&Arc<PartitionReplica>> {
        self.replica
            .get()
            .ok_or_else(|| anyhow::anyhow!("loopback services are not attached to a replica"))
    }
}

#[async_trait]
impl TxManager for LoopbackTxServices {
    async fn cleanup(
        &self,
        groups: &[ReplicationGroupId],
        commit: bool,
        commit_timestamp: Option<HybridTimestamp>,
        tx_id: TxId,
    ) -> anyhow::Result<()> {
        let replica = self.replica()?;
        for target in groups {
            if *target != group() {
                continue;
            }
            replica
                .invoke(
                    ReplicaRequest::WriteIntentSwitch(
                        keystone_replica::request::WriteIntentSwitchRequest {
                            tx_id,
                            commit,
                            commit_timestamp,
                            enlistment_token: self.placement.token(),
                        },
                    ),
                    COORDINATOR_ID,
                )
                .await
                .map_err(|err| anyhow::anyhow!(err.to_string()))?;
        }
        Ok(())
    }

    async fn cleanup_on_node(&self, node: &str, tx_id: TxId) -> anyhow::Result<()> {
        self.cleanup_hints
            .lock()
            .unwrap()
            .push((node.to_string(), tx_id));
        Ok(())
    }

    async fn finish(
        &self,
        commit_group: ReplicationGroupId,
        commit: bool,
        tx_id: TxId,
    ) -> anyhow::Result<()> {
        let replica = self.replica()?;
        replica
            .invoke(
                ReplicaRequest::TxFinish(TxFinishRequest {
                    tx_id,
                    commit,
                    commit_timestamp: None,
                    enlisted_groups: vec![commit_group],
                    enlistment_token: self.placement.token(),
                }),
                LOCAL_NODE_ID,
            )
            .await
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl TxStatePartitionClient for LoopbackTxServices {
    async fn resolve_tx_state(
        &self,
        _commit_group: ReplicationGroupId,
        tx_id: TxId,
    ) -> anyhow::Result<TxStateMeta> {
        let replica = self.replica()?;
        let result = replica
            .invoke(
                ReplicaRequest::TxStateCommitPartition(
                    keystone_replica::request::TxStateRequest { tx_id },
                ),
                LOCAL_NODE_ID,
            )
            .await
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;

        match result.response {
            ReplicaResponse::TxMeta(Some(meta)) => Ok(meta),
            ReplicaResponse::TxMeta(None) => Ok(TxStateMeta {
                state: TxState::Aborted,
                coordinator_id: None,
                commit_group: Some(group()),
                commit_timestamp: None,
            }),
            other => anyhow::bail!("unexpected tx state response: {other:?}"),
        }
    }
}

// ----------------------------------------------------------------------
// The harness
// ----------------------------------------------------------------------

pub struct Harness {
    pub replica: Arc<PartitionReplica>,
    pub partition: Arc<MemPartition>,
    pub locks: Arc<MemLockManager>,
    pub clock: Arc<HybridClock>,
    pub safe_time: Arc<SafeTimeTracker>,
    pub raft: Arc<LoopbackRaft>,
    pub tx_meta: Arc<MemTxStateStorage>,
    pub tx_states: Arc<TxStateMap>,
    pub catalog: Arc<ScriptedCatalog>,
    pub placement: Arc<ScriptedPlacement>,
    pub roster: Arc<ScriptedRoster>,
    pub services: Arc<LoopbackTxServices>,
    tx_seq: AtomicU64,
}

impl Harness {
    pub fn new() -> Harness {
        init_tracing();

        let partition = MemPartition::new();
        let locks = MemLockManager::new();
        let clock = Arc::new(HybridClock::new());
        let safe_time = Arc::new(SafeTimeTracker::default());
        let tx_meta = MemTxStateStorage::new();
        let raft = LoopbackRaft::new(safe_time.clone(), tx_meta.clone());
        let tx_states = Arc::new(TxStateMap::new());
        let catalog = ScriptedCatalog::new();
        let placement = ScriptedPlacement::new();
        let roster = ScriptedRoster::new();
        let services = LoopbackTxServices::new(placement.clone());

        let codec: Arc<dyn RowCodec> = Arc::new(LayoutCodec);
        let lock_manager: Arc<dyn LockManager> = locks.clone();

        let indexes = Arc::new(IndexRegistry::new(
            Arc::new(HashIndexHandle {
                partition: partition.clone(),
                id: PK_INDEX_ID,
            }),
            lock_manager.clone(),
            codec.clone(),
        ));
        indexes.register(
            SecondaryIndex::Sorted(Arc::new(SortedIndexHandle {
                partition: partition.clone(),
            })),
            lock_manager.clone(),
            codec.clone(),
        );
        indexes.register(
            SecondaryIndex::Hash(Arc::new(HashIndexHandle {
                partition: partition.clone(),
                id: HASH_INDEX_ID,
            })),
            lock_manager.clone(),
            codec.clone(),
        );

        let replica = Arc::new(PartitionReplica::new(ReplicaDeps {
            group: group(),
            local_node_name: LOCAL_NODE.to_string(),
            local_node_id: LOCAL_NODE_ID.to_string(),
            storage: partition.clone(),
            update_handler: partition.clone(),
            raft: raft.clone(),
            tx_manager: services.clone(),
            lock_manager,
            codec,
            indexes,
            clock: clock.clone(),
            safe_time: safe_time.clone(),
            tx_state_storage: tx_meta.clone(),
            tx_states: tx_states.clone(),
            tx_state_client: services.clone(),
            catalog: catalog.clone(),
            schema_sync: Arc::new(ImmediateSchemaSync),
            placement: placement.clone(),
            cluster: roster.clone(),
        }));
        services.attach(replica.clone());

        Harness {
            replica,
            partition,
            locks,
            clock,
            safe_time,
            raft,
            tx_meta,
            tx_states,
            catalog,
            placement,
            roster,
            services,
            tx_seq: AtomicU64::new(1),
        }
    }

    pub fn begin_tx(&self) -> TxId {
        TxId::new(self.clock.now(), self.tx_seq.fetch_add(1, Ordering::SeqCst))
    }

    pub fn token(&self) -> u64 {
        self.placement.token()
    }

    pub async fn invoke(&self, request: ReplicaRequest) -> keystone_replica::Result<ReplicaResult> {
        self.replica.invoke(request, COORDINATOR_ID).await
    }

    pub fn single_row_request(
        &self,
        op: RwRowOp,
        tx_id: TxId,
        row: BinaryRow,
        full: bool,
    ) -> ReplicaRequest {
        ReplicaRequest::RwSingleRow(RwSingleRowRequest {
            op,
            tx_id,
            commit_group: group(),
            row,
            full,
            enlistment_token: self.token(),
            schema_version: 1,
        })
    }

    pub fn single_pk_request(
        &self,
        op: RwPkOp,
        tx_id: TxId,
        key: &str,
        full: bool,
    ) -> ReplicaRequest {
        ReplicaRequest::RwSingleRowPk(RwSingleRowPkRequest {
            op,
            tx_id,
            commit_group: group(),
            pk: pk(key),
            full,
            enlistment_token: self.token(),
            schema_version: 1,
        })
    }

    pub async fn upsert(&self, tx_id: TxId, key: &str, value: &str) -> ReplicaResult {
        self.invoke(self.single_row_request(RwRowOp::Upsert, tx_id, row(key, value), false))
            .await
            .expect("upsert failed")
    }

    pub async fn insert(&self, tx_id: TxId, key: &str, value: &str) -> ReplicaResult {
        self.invoke(self.single_row_request(RwRowOp::Insert, tx_id, row(key, value), false))
            .await
            .expect("insert failed")
    }

    pub async fn rw_get(&self, tx_id: TxId, key: &str) -> Option<BinaryRow> {
        let result = self
            .invoke(self.single_pk_request(RwPkOp::Get, tx_id, key, false))
            .await
            .expect("rw get failed");
        match result.response {
            ReplicaResponse::Row(row) => row,
            other => panic!("unexpected rw get response: {other:?}"),
        }
    }

    pub async fn finish(
        &self,
        tx_id: TxId,
        commit: bool,
    ) -> keystone_replica::Result<TransactionResult> {
        let commit_timestamp = commit.then(|| self.clock.now());
        let result = self
            .invoke(ReplicaRequest::TxFinish(TxFinishRequest {
                tx_id,
                commit,
                commit_timestamp,
                enlisted_groups: vec![group()],
                enlistment_token: self.token(),
            }))
            .await?;
        match result.response {
            ReplicaResponse::TxResult(result) => Ok(result),
            other => panic!("unexpected finish response: {other:?}"),
        }
    }

    pub async fn commit(&self, tx_id: TxId) -> TransactionResult {
        self.finish(tx_id, true).await.expect("commit failed")
    }

    pub async fn abort(&self, tx_id: TxId) -> TransactionResult {
        self.finish(tx_id, false).await.expect("abort failed")
    }

    pub async fn ro_get(&self, key: &str, read_timestamp: HybridTimestamp) -> Option<BinaryRow> {
        let result = self
            .invoke(ReplicaRequest::RoSingleRowPk(RoSingleRowPkRequest {
                tx_id: self.begin_tx(),
                pk: pk(key),
                read_timestamp,
                schema_version: None,
            }))
            .await
            .expect("ro get failed");
        match result.response {
            ReplicaResponse::Row(row) => row,
            other => panic!("unexpected ro get response: {other:?}"),
        }
    }

    /// Poll the durable state until the transaction's locks-released flag
    /// flips, or panic after the deadline.
    pub async fn await_locks_released(&self, tx_id: TxId) {
        for _ in 0..200 {
            if self
                .tx_meta
                .get_meta(tx_id)
                .is_some_and(|meta| meta.locks_released)
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("locks-released marker never applied for {tx_id}");
    }
}
