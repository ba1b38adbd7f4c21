//! Shared data model for the replica coordinator.
//!
//! These types are kept in one dependency-light module because they are used
//! by the coordinator, the replicated command codec, and the collaborator
//! trait seams alike. Row payloads are opaque byte slices; only primary-key
//! and index-key projections are ever inspected, and those go through the
//! injected tuple codec.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keystone_hlc::HybridTimestamp;

/// Catalog-level table identifier.
pub type TableId = u32;
/// Partition index within a table.
pub type PartitionId = u32;
/// Catalog-level index identifier.
pub type IndexId = u32;
/// Version of a table schema.
pub type SchemaVersion = u32;

/// Identifier of one replication group: a `(table, partition)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicationGroupId {
    pub table_id: TableId,
    pub partition_id: PartitionId,
}

impl ReplicationGroupId {
    pub fn new(table_id: TableId, partition_id: PartitionId) -> Self {
        Self {
            table_id,
            partition_id,
        }
    }
}

impl fmt::Display for ReplicationGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table_id, self.partition_id)
    }
}

/// Stable identifier of a physical row slot in MVCC storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId {
    pub partition_id: PartitionId,
    pub uuid: Uuid,
}

impl RowId {
    /// Fresh row slot id for an insert into `partition_id`.
    pub fn generate(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            uuid: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition_id, self.uuid)
    }
}

/// Opaque row payload plus the schema version it was written under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryRow {
    pub schema_version: SchemaVersion,
    pub payload: Bytes,
}

impl BinaryRow {
    pub fn new(schema_version: SchemaVersion, payload: impl Into<Bytes>) -> Self {
        Self {
            schema_version,
            payload: payload.into(),
        }
    }

    /// Value equality for conditional operations compares payload slices,
    /// not row identities or schema versions.
    pub fn equal_values(&self, other: &BinaryRow) -> bool {
        self.payload == other.payload
    }
}

/// Encoded key used for index lookups.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinaryTuple(pub Bytes);

impl BinaryTuple {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

/// Encoded key prefix used as a sorted-scan bound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryTuplePrefix(pub Bytes);

impl BinaryTuplePrefix {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

/// Bound inclusion flags for sorted-index range scans.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFlags {
    /// `GREATER_OR_EQUAL`: the lower bound itself is part of the range.
    pub lower_inclusive: bool,
    /// `LESS_OR_EQUAL`: the upper bound itself is part of the range.
    pub upper_inclusive: bool,
}

/// One row produced by a sorted-index cursor: the indexed key plus the slot
/// it points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexRow {
    pub key: BinaryTuple,
    pub row_id: RowId,
}

/// Result of reading one row slot from MVCC storage at some timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadResult {
    pub row_id: RowId,
    /// Payload visible at the read timestamp; `None` for a tombstone.
    pub row: Option<BinaryRow>,
    /// Commit timestamp of the returned version; `None` for a write intent.
    pub commit_timestamp: Option<HybridTimestamp>,
    /// Commit timestamp of the newest committed version under the intent,
    /// if any. Lets readers fall back without a second index pass.
    pub newest_commit_timestamp: Option<HybridTimestamp>,
    /// Present iff the returned version is an uncommitted write intent.
    pub write_intent: Option<WriteIntentMeta>,
}

impl ReadResult {
    pub fn is_write_intent(&self) -> bool {
        self.write_intent.is_some()
    }

    /// True when neither a version nor an intent exists at the timestamp.
    pub fn is_empty(&self) -> bool {
        self.row.is_none() && self.write_intent.is_none()
    }
}

/// Provenance of an uncommitted MVCC version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteIntentMeta {
    pub tx_id: TxId,
    /// Commit partition of the producing transaction; where its durable
    /// outcome will be written.
    pub commit_group: ReplicationGroupId,
}

/// 128-bit transaction id whose high 64 bits carry the packed begin
/// timestamp, so the begin time is extractable from the id alone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub Uuid);

impl TxId {
    pub fn new(begin_timestamp: HybridTimestamp, local: u64) -> Self {
        Self(Uuid::from_u64_pair(begin_timestamp.as_u64(), local))
    }

    /// Begin timestamp packed into the high bits of the id.
    pub fn begin_timestamp(&self) -> HybridTimestamp {
        let (high, _low) = self.0.as_u64_pair();
        HybridTimestamp::from_u64(high)
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Transaction lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Pending,
    Finishing,
    Committed,
    Aborted,
    /// Coordinator left the cluster before finishing; recovery will abort.
    Abandoned,
}

impl TxState {
    /// Final states fix the durable outcome forever.
    pub fn is_final(self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted)
    }
}

/// Volatile transaction meta, kept in a process-wide map keyed by tx id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxStateMeta {
    pub state: TxState,
    /// Inconsistent id of the coordinating node, when known.
    pub coordinator_id: Option<String>,
    pub commit_group: Option<ReplicationGroupId>,
    pub commit_timestamp: Option<HybridTimestamp>,
}

impl TxStateMeta {
    pub fn pending(coordinator_id: String, commit_group: ReplicationGroupId) -> Self {
        Self {
            state: TxState::Pending,
            coordinator_id: Some(coordinator_id),
            commit_group: Some(commit_group),
            commit_timestamp: None,
        }
    }

    /// Same meta with the state (and, on commit, the timestamp) finalized.
    pub fn finished(&self, state: TxState, commit_timestamp: Option<HybridTimestamp>) -> Self {
        debug_assert!(state.is_final());
        Self {
            state,
            coordinator_id: self.coordinator_id.clone(),
            commit_group: self.commit_group,
            commit_timestamp: if state == TxState::Committed {
                commit_timestamp
            } else {
                None
            },
        }
    }
}

/// Durable transaction meta, persisted only on the commit partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMeta {
    pub state: TxState,
    pub commit_timestamp: Option<HybridTimestamp>,
    pub enlisted_groups: Vec<ReplicationGroupId>,
    /// True once every enlisted partition switched this transaction's
    /// write intents and released its locks.
    pub locks_released: bool,
}

/// Outcome of a finished transaction, as stored and as surfaced to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub state: TxState,
    pub commit_timestamp: Option<HybridTimestamp>,
}

impl TransactionResult {
    pub fn committed(commit_timestamp: HybridTimestamp) -> Self {
        Self {
            state: TxState::Committed,
            commit_timestamp: Some(commit_timestamp),
        }
    }

    pub fn aborted() -> Self {
        Self {
            state: TxState::Aborted,
            commit_timestamp: None,
        }
    }
}

/// Primary lease metadata as reported by the placement driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseMeta {
    /// Node name of the leaseholder.
    pub leaseholder: String,
    pub start_time: HybridTimestamp,
    pub expiration_time: HybridTimestamp,
}

impl LeaseMeta {
    /// The enlistment consistency token clients bind to this lease.
    pub fn enlistment_token(&self) -> u64 {
        self.start_time.as_u64()
    }
}

/// Parameters of a primary-elected / primary-expired placement event.
#[derive(Clone, Debug)]
pub struct PrimaryReplicaEvent {
    pub group: ReplicationGroupId,
    pub leaseholder: String,
    pub start_time: HybridTimestamp,
    pub expiration_time: HybridTimestamp,
}
