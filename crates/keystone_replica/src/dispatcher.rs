//! Safe-time-stamped command submission with bounded retry.
//!
//! Replicas apply commands in `safe_time` order, so a command stamped
//! behind the applied watermark is bounced back with a reorder error. The
//! dispatcher restamps with a fresh clock reading and resubmits, up to a
//! bounded number of attempts. For non-full update commands the local
//! tracker is advanced before the retry: the primary already pre-applied
//! the write, and replaying an older stamp over it must not win.

use std::sync::Arc;

use tracing::{debug, warn};

use keystone_hlc::{HybridClock, SafeTimeTracker};

use crate::capabilities::RaftClient;
use crate::command::ReplicaCommand;
use crate::error::{RaftError, ReplicaError, Result};
use crate::types::{ReplicationGroupId, TransactionResult};

/// Retry budget for safe-time reordering.
pub const MAX_RETRIES_ON_SAFE_TIME_REORDERING: u32 = 1000;

pub struct ReplicationDispatcher {
    group: ReplicationGroupId,
    raft: Arc<dyn RaftClient>,
    clock: Arc<HybridClock>,
    safe_time: Arc<SafeTimeTracker>,
    /// Guards local pre-apply and tracker advancement; shared with the
    /// coordinator's write path.
    safe_time_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ReplicationDispatcher {
    pub fn new(
        group: ReplicationGroupId,
        raft: Arc<dyn RaftClient>,
        clock: Arc<HybridClock>,
        safe_time: Arc<SafeTimeTracker>,
        safe_time_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            group,
            raft,
            clock,
            safe_time,
            safe_time_lock,
        }
    }

    /// Submit a command, retrying with fresh stamps on safe-time reorder.
    ///
    /// Timeouts surface as [`ReplicaError::ReplicationTimeout`], a lost
    /// finish race as [`ReplicaError::TransactionAlreadyFinished`], any
    /// other failure wrapped with the group id.
    pub async fn submit(&self, mut command: ReplicaCommand) -> Result<Option<TransactionResult>> {
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            match self.raft.run(command.clone()).await {
                Ok(result) => return Ok(result),
                Err(RaftError::SafeTimeReorder { stamped, applied }) => {
                    if attempts >= MAX_RETRIES_ON_SAFE_TIME_REORDERING {
                        warn!(
                            group = %self.group,
                            attempts,
                            "giving up on safe-time reorder retries"
                        );
                        return Err(ReplicaError::ReplicationMaxRetriesExceeded {
                            group: self.group,
                            attempts,
                        });
                    }

                    let fresh = self.clock.now();
                    debug!(
                        group = %self.group,
                        %stamped,
                        %applied,
                        %fresh,
                        attempts,
                        "restamping command after safe-time reorder"
                    );

                    if command.is_partial_update() {
                        // The pre-applied storage state on this primary is
                        // already newer than the bounced stamp; move the
                        // tracker forward so replayed log entries with the
                        // old stamp cannot overwrite it.
                        let _guard = self.safe_time_lock.lock().await;
                        self.safe_time.advance(fresh);
                    }

                    command.set_safe_time(fresh);
                }
                Err(RaftError::UnexpectedTransactionState { tx_id, result }) => {
                    return Err(ReplicaError::TransactionAlreadyFinished { tx_id, result });
                }
                Err(RaftError::Timeout) => {
                    return Err(ReplicaError::ReplicationTimeout { group: self.group });
                }
                Err(RaftError::Other(err)) => {
                    return Err(ReplicaError::replication(self.group, err));
                }
            }
        }
    }
}
