//! Replica request model: one tagged variant per wire shape, with shared
//! accessors used by the validation prelude and the dispatch table.
//!
//! Requests that mutate or read under a read-write transaction carry the
//! enlistment consistency token of the lease the client observed; read-only
//! and safe-time-sync requests only need to learn whether this replica is
//! primary. Everything else bypasses the lease check.

use keystone_hlc::HybridTimestamp;

use crate::types::{
    BinaryRow, BinaryTuple, BinaryTuplePrefix, IndexId, ReplicationGroupId, RowId, ScanFlags,
    SchemaVersion, TxId,
};

/// Row-carrying single-row read-write operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RwRowOp {
    Insert,
    Upsert,
    DeleteExact,
    GetAndUpsert,
    GetAndReplace,
    ReplaceIfExists,
}

/// Key-carrying single-row read-write operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RwPkOp {
    Get,
    Delete,
    GetAndDelete,
}

/// Row-carrying multi-row read-write operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RwMultiRowOp {
    InsertAll,
    UpsertAll,
    DeleteExactAll,
}

/// Key-carrying multi-row read-write operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RwMultiPkOp {
    GetAll,
    DeleteAll,
}

#[derive(Clone, Debug)]
pub struct RwSingleRowRequest {
    pub op: RwRowOp,
    pub tx_id: TxId,
    pub commit_group: ReplicationGroupId,
    pub row: BinaryRow,
    pub full: bool,
    pub enlistment_token: u64,
    pub schema_version: SchemaVersion,
}

#[derive(Clone, Debug)]
pub struct RwSingleRowPkRequest {
    pub op: RwPkOp,
    pub tx_id: TxId,
    pub commit_group: ReplicationGroupId,
    pub pk: BinaryTuple,
    pub full: bool,
    pub enlistment_token: u64,
    pub schema_version: SchemaVersion,
}

#[derive(Clone, Debug)]
pub struct RwMultiRowRequest {
    pub op: RwMultiRowOp,
    pub tx_id: TxId,
    pub commit_group: ReplicationGroupId,
    pub rows: Vec<BinaryRow>,
    pub full: bool,
    /// Disable the delayed-ack optimization: the caller wants the response
    /// only after replication, even for a non-full transaction.
    pub skip_delayed_ack: bool,
    pub enlistment_token: u64,
    pub schema_version: SchemaVersion,
}

#[derive(Clone, Debug)]
pub struct RwMultiRowPkRequest {
    pub op: RwMultiPkOp,
    pub tx_id: TxId,
    pub commit_group: ReplicationGroupId,
    pub pks: Vec<BinaryTuple>,
    pub full: bool,
    pub skip_delayed_ack: bool,
    pub enlistment_token: u64,
    pub schema_version: SchemaVersion,
}

/// Compare-and-swap of a full row (`REPLACE`).
#[derive(Clone, Debug)]
pub struct RwSwapRowRequest {
    pub tx_id: TxId,
    pub commit_group: ReplicationGroupId,
    pub old_row: BinaryRow,
    pub new_row: BinaryRow,
    pub full: bool,
    pub enlistment_token: u64,
    pub schema_version: SchemaVersion,
}

#[derive(Clone, Debug)]
pub struct RwScanRetrieveRequest {
    pub tx_id: TxId,
    pub commit_group: ReplicationGroupId,
    pub scan_id: u64,
    pub batch_size: usize,
    pub index_to_use: Option<IndexId>,
    pub exact_key: Option<BinaryTuple>,
    pub lower_bound: Option<BinaryTuplePrefix>,
    pub upper_bound: Option<BinaryTuplePrefix>,
    pub flags: ScanFlags,
    /// For scans `full` marks an implicit transaction; the scan itself is
    /// still two-phase unless the whole result fits in one batch.
    pub full: bool,
    pub enlistment_token: u64,
    pub schema_version: SchemaVersion,
}

#[derive(Clone, Debug)]
pub struct ScanCloseRequest {
    pub tx_id: TxId,
    pub scan_id: u64,
    pub enlistment_token: u64,
}

#[derive(Clone, Debug)]
pub struct TxFinishRequest {
    pub tx_id: TxId,
    pub commit: bool,
    pub commit_timestamp: Option<HybridTimestamp>,
    pub enlisted_groups: Vec<ReplicationGroupId>,
    pub enlistment_token: u64,
}

#[derive(Clone, Debug)]
pub struct WriteIntentSwitchRequest {
    pub tx_id: TxId,
    pub commit: bool,
    pub commit_timestamp: Option<HybridTimestamp>,
    pub enlistment_token: u64,
}

#[derive(Clone, Debug)]
pub struct TxRecoveryRequest {
    pub tx_id: TxId,
}

#[derive(Clone, Debug)]
pub struct TxStateRequest {
    pub tx_id: TxId,
}

#[derive(Clone, Debug)]
pub struct RoSingleRowPkRequest {
    pub tx_id: TxId,
    pub pk: BinaryTuple,
    pub read_timestamp: HybridTimestamp,
    pub schema_version: Option<SchemaVersion>,
}

#[derive(Clone, Debug)]
pub struct RoMultiRowPkRequest {
    pub tx_id: TxId,
    pub pks: Vec<BinaryTuple>,
    pub read_timestamp: HybridTimestamp,
    pub schema_version: Option<SchemaVersion>,
}

#[derive(Clone, Debug)]
pub struct RoScanRetrieveRequest {
    pub tx_id: TxId,
    pub read_timestamp: HybridTimestamp,
    pub scan_id: u64,
    pub batch_size: usize,
    pub index_to_use: Option<IndexId>,
    pub exact_key: Option<BinaryTuple>,
    pub lower_bound: Option<BinaryTuplePrefix>,
    pub upper_bound: Option<BinaryTuplePrefix>,
    pub flags: ScanFlags,
    pub schema_version: Option<SchemaVersion>,
}

/// Direct read in an implicit read-only transaction: the read timestamp is
/// chosen by the replica when the request enters processing.
#[derive(Clone, Debug)]
pub struct RoDirectSingleRowRequest {
    pub pk: BinaryTuple,
    pub schema_version: Option<SchemaVersion>,
}

#[derive(Clone, Debug)]
pub struct RoDirectMultiRowRequest {
    pub pks: Vec<BinaryTuple>,
    pub schema_version: Option<SchemaVersion>,
}

#[derive(Clone, Debug)]
pub struct BuildIndexRequest {
    pub index_id: IndexId,
    pub row_ids: Vec<RowId>,
    pub finish: bool,
}

/// Every request the coordinator dispatches on.
#[derive(Clone, Debug)]
pub enum ReplicaRequest {
    RwSingleRow(RwSingleRowRequest),
    RwSingleRowPk(RwSingleRowPkRequest),
    RwMultiRow(RwMultiRowRequest),
    RwMultiRowPk(RwMultiRowPkRequest),
    RwSwapRow(RwSwapRowRequest),
    RwScanRetrieve(RwScanRetrieveRequest),
    ScanClose(ScanCloseRequest),
    TxFinish(TxFinishRequest),
    WriteIntentSwitch(WriteIntentSwitchRequest),
    TxRecovery(TxRecoveryRequest),
    TxStateCommitPartition(TxStateRequest),
    RoSingleRowPk(RoSingleRowPkRequest),
    RoMultiRowPk(RoMultiRowPkRequest),
    RoScanRetrieve(RoScanRetrieveRequest),
    RoDirectSingleRow(RoDirectSingleRowRequest),
    RoDirectMultiRow(RoDirectMultiRowRequest),
    SafeTimeSync,
    BuildIndex(BuildIndexRequest),
}

/// Classification of read-write operations for the per-transaction
/// operation tracker: read futures may fail without blocking a commit,
/// update futures must not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpClass {
    RwRead,
    RwWrite,
}

impl ReplicaRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicaRequest::RwSingleRow(req) => match req.op {
                RwRowOp::Insert => "RW_INSERT",
                RwRowOp::Upsert => "RW_UPSERT",
                RwRowOp::DeleteExact => "RW_DELETE_EXACT",
                RwRowOp::GetAndUpsert => "RW_GET_AND_UPSERT",
                RwRowOp::GetAndReplace => "RW_GET_AND_REPLACE",
                RwRowOp::ReplaceIfExists => "RW_REPLACE_IF_EXIST",
            },
            ReplicaRequest::RwSingleRowPk(req) => match req.op {
                RwPkOp::Get => "RW_GET",
                RwPkOp::Delete => "RW_DELETE",
                RwPkOp::GetAndDelete => "RW_GET_AND_DELETE",
            },
            ReplicaRequest::RwMultiRow(req) => match req.op {
                RwMultiRowOp::InsertAll => "RW_INSERT_ALL",
                RwMultiRowOp::UpsertAll => "RW_UPSERT_ALL",
                RwMultiRowOp::DeleteExactAll => "RW_DELETE_EXACT_ALL",
            },
            ReplicaRequest::RwMultiRowPk(req) => match req.op {
                RwMultiPkOp::GetAll => "RW_GET_ALL",
                RwMultiPkOp::DeleteAll => "RW_DELETE_ALL",
            },
            ReplicaRequest::RwSwapRow(_) => "RW_REPLACE",
            ReplicaRequest::RwScanRetrieve(_) => "RW_SCAN",
            ReplicaRequest::ScanClose(_) => "SCAN_CLOSE",
            ReplicaRequest::TxFinish(_) => "TX_FINISH",
            ReplicaRequest::WriteIntentSwitch(_) => "WRITE_INTENT_SWITCH",
            ReplicaRequest::TxRecovery(_) => "TX_RECOVERY",
            ReplicaRequest::TxStateCommitPartition(_) => "TX_STATE_COMMIT_PARTITION",
            ReplicaRequest::RoSingleRowPk(_) => "RO_GET",
            ReplicaRequest::RoMultiRowPk(_) => "RO_GET_ALL",
            ReplicaRequest::RoScanRetrieve(_) => "RO_SCAN",
            ReplicaRequest::RoDirectSingleRow(_) => "RO_DIRECT_GET",
            ReplicaRequest::RoDirectMultiRow(_) => "RO_DIRECT_GET_ALL",
            ReplicaRequest::SafeTimeSync => "SAFE_TIME_SYNC",
            ReplicaRequest::BuildIndex(_) => "BUILD_INDEX",
        }
    }

    /// Enlistment token when this is a primary-replica request.
    pub fn enlistment_token(&self) -> Option<u64> {
        match self {
            ReplicaRequest::RwSingleRow(req) => Some(req.enlistment_token),
            ReplicaRequest::RwSingleRowPk(req) => Some(req.enlistment_token),
            ReplicaRequest::RwMultiRow(req) => Some(req.enlistment_token),
            ReplicaRequest::RwMultiRowPk(req) => Some(req.enlistment_token),
            ReplicaRequest::RwSwapRow(req) => Some(req.enlistment_token),
            ReplicaRequest::RwScanRetrieve(req) => Some(req.enlistment_token),
            ReplicaRequest::ScanClose(req) => Some(req.enlistment_token),
            ReplicaRequest::TxFinish(req) => Some(req.enlistment_token),
            ReplicaRequest::WriteIntentSwitch(req) => Some(req.enlistment_token),
            _ => None,
        }
    }

    /// Whether the lease check only answers "is this replica primary".
    pub fn wants_primary_flag(&self) -> bool {
        matches!(
            self,
            ReplicaRequest::RoSingleRowPk(_)
                | ReplicaRequest::RoMultiRowPk(_)
                | ReplicaRequest::RoScanRetrieve(_)
                | ReplicaRequest::SafeTimeSync
        )
    }

    /// Read timestamp of a timestamped read-only request.
    pub fn read_timestamp(&self) -> Option<HybridTimestamp> {
        match self {
            ReplicaRequest::RoSingleRowPk(req) => Some(req.read_timestamp),
            ReplicaRequest::RoMultiRowPk(req) => Some(req.read_timestamp),
            ReplicaRequest::RoScanRetrieve(req) => Some(req.read_timestamp),
            _ => None,
        }
    }

    pub fn is_read_write(&self) -> bool {
        matches!(
            self,
            ReplicaRequest::RwSingleRow(_)
                | ReplicaRequest::RwSingleRowPk(_)
                | ReplicaRequest::RwMultiRow(_)
                | ReplicaRequest::RwMultiRowPk(_)
                | ReplicaRequest::RwSwapRow(_)
                | ReplicaRequest::RwScanRetrieve(_)
        )
    }

    pub fn is_direct_read_only(&self) -> bool {
        matches!(
            self,
            ReplicaRequest::RoDirectSingleRow(_) | ReplicaRequest::RoDirectMultiRow(_)
        )
    }

    /// Declared request schema version, for the schema-match validation.
    pub fn schema_version(&self) -> Option<SchemaVersion> {
        match self {
            ReplicaRequest::RwSingleRow(req) => Some(req.schema_version),
            ReplicaRequest::RwSingleRowPk(req) => Some(req.schema_version),
            ReplicaRequest::RwMultiRow(req) => Some(req.schema_version),
            ReplicaRequest::RwMultiRowPk(req) => Some(req.schema_version),
            ReplicaRequest::RwSwapRow(req) => Some(req.schema_version),
            ReplicaRequest::RwScanRetrieve(req) => Some(req.schema_version),
            ReplicaRequest::RoSingleRowPk(req) => req.schema_version,
            ReplicaRequest::RoMultiRowPk(req) => req.schema_version,
            ReplicaRequest::RoScanRetrieve(req) => req.schema_version,
            ReplicaRequest::RoDirectSingleRow(req) => req.schema_version,
            ReplicaRequest::RoDirectMultiRow(req) => req.schema_version,
            _ => None,
        }
    }

    /// Transaction start timestamp: begin time for RW requests (packed in
    /// the tx id), read timestamp for timestamped RO requests.
    pub fn tx_start_timestamp(&self) -> Option<HybridTimestamp> {
        match self {
            ReplicaRequest::RwSingleRow(req) => Some(req.tx_id.begin_timestamp()),
            ReplicaRequest::RwSingleRowPk(req) => Some(req.tx_id.begin_timestamp()),
            ReplicaRequest::RwMultiRow(req) => Some(req.tx_id.begin_timestamp()),
            ReplicaRequest::RwMultiRowPk(req) => Some(req.tx_id.begin_timestamp()),
            ReplicaRequest::RwSwapRow(req) => Some(req.tx_id.begin_timestamp()),
            ReplicaRequest::RwScanRetrieve(req) => Some(req.tx_id.begin_timestamp()),
            _ => self.read_timestamp(),
        }
    }

    /// `(tx_id, commit_group, full)` for requests that enlist the
    /// transaction on this partition as pending volatile state.
    pub fn committable(&self) -> Option<(TxId, ReplicationGroupId, bool)> {
        match self {
            ReplicaRequest::RwSingleRow(req) => Some((req.tx_id, req.commit_group, req.full)),
            ReplicaRequest::RwSingleRowPk(req) => Some((req.tx_id, req.commit_group, req.full)),
            ReplicaRequest::RwMultiRow(req) => Some((req.tx_id, req.commit_group, req.full)),
            ReplicaRequest::RwMultiRowPk(req) => Some((req.tx_id, req.commit_group, req.full)),
            ReplicaRequest::RwSwapRow(req) => Some((req.tx_id, req.commit_group, req.full)),
            ReplicaRequest::RwScanRetrieve(req) => Some((req.tx_id, req.commit_group, req.full)),
            _ => None,
        }
    }

    /// Operation class for the per-transaction tracker; `None` for requests
    /// outside read-write transactions.
    pub fn op_class(&self) -> Option<OpClass> {
        match self {
            ReplicaRequest::RwSingleRowPk(req) if req.op == RwPkOp::Get => Some(OpClass::RwRead),
            ReplicaRequest::RwMultiRowPk(req) if req.op == RwMultiPkOp::GetAll => {
                Some(OpClass::RwRead)
            }
            ReplicaRequest::RwScanRetrieve(_) => Some(OpClass::RwRead),
            ReplicaRequest::RwSingleRow(_)
            | ReplicaRequest::RwSingleRowPk(_)
            | ReplicaRequest::RwMultiRow(_)
            | ReplicaRequest::RwMultiRowPk(_)
            | ReplicaRequest::RwSwapRow(_) => Some(OpClass::RwWrite),
            _ => None,
        }
    }
}
