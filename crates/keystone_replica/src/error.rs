//! Error types surfaced by the replica coordinator.

use thiserror::Error;

use keystone_hlc::HybridTimestamp;

use crate::types::{ReplicationGroupId, SchemaVersion, TableId, TransactionResult, TxId, TxState};

/// Top-level error type for replica operations.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// The enlistment token does not match the current lease, the lease has
    /// expired, or this replica is simply not the primary. Retryable by the
    /// client after refreshing its primary view.
    #[error(
        "primary replica miss on {local_node} [leaseholder={leaseholder:?}, \
         expected_token={expected_token:?}, actual_token={actual_token:?}]"
    )]
    PrimaryReplicaMiss {
        local_node: String,
        leaseholder: Option<String>,
        expected_token: Option<u64>,
        actual_token: Option<u64>,
    },

    #[error("table {table_id} does not exist at {ts}")]
    TableNotFound {
        table_id: TableId,
        ts: HybridTimestamp,
    },

    #[error(
        "schema {requested} is not compatible with schema {actual} for table {table_id}"
    )]
    IncompatibleSchema {
        table_id: TableId,
        requested: SchemaVersion,
        actual: SchemaVersion,
    },

    /// Forward validation at commit failed; the transaction has already been
    /// finalized as aborted by the time this surfaces.
    #[error("commit aborted for table {table_id}: {reason}")]
    IncompatibleSchemaAbort { table_id: TableId, reason: String },

    /// A finish retry proposed a different outcome than the stored one.
    /// Carries the durable result so the caller learns the real outcome.
    #[error("transaction {tx_id} already finished as {:?}", result.state)]
    TransactionAlreadyFinished {
        tx_id: TxId,
        result: TransactionResult,
    },

    /// A read/write operation arrived after the transaction reached a final
    /// state on this replica, or was never enlisted here.
    #[error("transaction {tx_id} is no longer accepting operations (state {state:?})")]
    StaleTransaction {
        tx_id: TxId,
        state: Option<TxState>,
    },

    #[error("replication to group {group} timed out")]
    ReplicationTimeout { group: ReplicationGroupId },

    #[error("replication to group {group} gave up after {attempts} safe-time reorder retries")]
    ReplicationMaxRetriesExceeded {
        group: ReplicationGroupId,
        attempts: u32,
    },

    #[error("unsupported replica request: {kind}")]
    UnsupportedRequest { kind: &'static str },

    #[error("replica for group {group} is stopping")]
    NodeStopping { group: ReplicationGroupId },

    /// Any other replication or storage failure, wrapped with the group id.
    #[error("replication error for group {group}")]
    Replication {
        group: ReplicationGroupId,
        #[source]
        source: anyhow::Error,
    },
}

impl ReplicaError {
    pub fn replication(group: ReplicationGroupId, source: anyhow::Error) -> Self {
        ReplicaError::Replication { group, source }
    }
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Failure modes of one replicated-command submission, as reported by the
/// raft client. The dispatcher translates these into [`ReplicaError`]s.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The command's stamped safe time was behind an already-applied one;
    /// the submitter restamps and retries.
    #[error("safe time reorder: stamped {stamped}, applied watermark {applied}")]
    SafeTimeReorder {
        stamped: HybridTimestamp,
        applied: HybridTimestamp,
    },

    /// A finish command lost the race against a concurrent recovery that
    /// wrote a different durable outcome.
    #[error("unexpected transaction state for {tx_id}: stored {:?}", result.state)]
    UnexpectedTransactionState {
        tx_id: TxId,
        result: TransactionResult,
    },

    #[error("replication timed out")]
    Timeout,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
