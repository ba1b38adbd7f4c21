//! Replicated commands applied through the group's log.
//!
//! Every command carries a `safe_time` stamp and the catalog version it was
//! validated against; replicas apply commands in `safe_time` order and
//! refuse commands that require a catalog version they have not seen yet.
//! The serde envelope (`encode`/`decode`) is the wire form appended to the
//! replicated log.

use serde::{Deserialize, Serialize};

use keystone_hlc::HybridTimestamp;

use crate::types::{BinaryRow, IndexId, ReplicationGroupId, RowId, TxId};

/// One row mutation inside an update command. `row = None` is a removal.
/// `last_commit_timestamp` is a read-amplification hint: the newest commit
/// time of the version the intent shadows, so replicas need not look it up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowUpdate {
    pub row_id: RowId,
    pub row: Option<BinaryRow>,
    pub last_commit_timestamp: Option<HybridTimestamp>,
}

/// Commands understood by the partition state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaCommand {
    Update {
        safe_time: HybridTimestamp,
        required_catalog_version: u32,
        tx_id: TxId,
        commit_group: ReplicationGroupId,
        update: RowUpdate,
        /// One-phase-commit transactions co-apply their finish with the
        /// update and are acknowledged only after full replication.
        full: bool,
        coordinator_id: String,
    },
    UpdateAll {
        safe_time: HybridTimestamp,
        required_catalog_version: u32,
        tx_id: TxId,
        commit_group: ReplicationGroupId,
        updates: Vec<RowUpdate>,
        full: bool,
        coordinator_id: String,
    },
    FinishTx {
        safe_time: HybridTimestamp,
        required_catalog_version: u32,
        tx_id: TxId,
        commit: bool,
        commit_timestamp: Option<HybridTimestamp>,
        enlisted_groups: Vec<ReplicationGroupId>,
        coordinator_id: Option<String>,
    },
    WriteIntentSwitch {
        safe_time: HybridTimestamp,
        required_catalog_version: u32,
        tx_id: TxId,
        commit: bool,
        commit_timestamp: Option<HybridTimestamp>,
    },
    MarkLocksReleased {
        safe_time: HybridTimestamp,
        required_catalog_version: u32,
        tx_id: TxId,
    },
    BuildIndex {
        safe_time: HybridTimestamp,
        required_catalog_version: u32,
        index_id: IndexId,
        row_ids: Vec<RowId>,
        /// Last batch for this index; flips it to the built state.
        finish: bool,
    },
    SafeTimeSync {
        safe_time: HybridTimestamp,
        required_catalog_version: u32,
    },
}

impl ReplicaCommand {
    pub fn safe_time(&self) -> HybridTimestamp {
        match self {
            ReplicaCommand::Update { safe_time, .. }
            | ReplicaCommand::UpdateAll { safe_time, .. }
            | ReplicaCommand::FinishTx { safe_time, .. }
            | ReplicaCommand::WriteIntentSwitch { safe_time, .. }
            | ReplicaCommand::MarkLocksReleased { safe_time, .. }
            | ReplicaCommand::BuildIndex { safe_time, .. }
            | ReplicaCommand::SafeTimeSync { safe_time, .. } => *safe_time,
        }
    }

    /// Restamp the command; used by the reorder retry loop.
    pub fn set_safe_time(&mut self, ts: HybridTimestamp) {
        match self {
            ReplicaCommand::Update { safe_time, .. }
            | ReplicaCommand::UpdateAll { safe_time, .. }
            | ReplicaCommand::FinishTx { safe_time, .. }
            | ReplicaCommand::WriteIntentSwitch { safe_time, .. }
            | ReplicaCommand::MarkLocksReleased { safe_time, .. }
            | ReplicaCommand::BuildIndex { safe_time, .. }
            | ReplicaCommand::SafeTimeSync { safe_time, .. } => *safe_time = ts,
        }
    }

    pub fn required_catalog_version(&self) -> u32 {
        match self {
            ReplicaCommand::Update {
                required_catalog_version,
                ..
            }
            | ReplicaCommand::UpdateAll {
                required_catalog_version,
                ..
            }
            | ReplicaCommand::FinishTx {
                required_catalog_version,
                ..
            }
            | ReplicaCommand::WriteIntentSwitch {
                required_catalog_version,
                ..
            }
            | ReplicaCommand::MarkLocksReleased {
                required_catalog_version,
                ..
            }
            | ReplicaCommand::BuildIndex {
                required_catalog_version,
                ..
            }
            | ReplicaCommand::SafeTimeSync {
                required_catalog_version,
                ..
            } => *required_catalog_version,
        }
    }

    /// Whether this is an update-like command with `full = false`; the
    /// reorder retry advances the local safe-time tracker for these before
    /// resubmitting, to keep the pre-applied storage state ahead of replay.
    pub fn is_partial_update(&self) -> bool {
        matches!(
            self,
            ReplicaCommand::Update { full: false, .. }
                | ReplicaCommand::UpdateAll { full: false, .. }
        )
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<ReplicaCommand> {
        Ok(serde_json::from_slice(data)?)
    }
}
