//! Partition replica coordinator for the Keystone distributed table store.
//!
//! For each `(table, partition)` replication group an instance of
//! [`replica::PartitionReplica`] sits in front of a replicated log and a
//! local multi-version row store. It is the single point where client
//! read/write requests meet transaction state, locking, schema validation
//! and replication: serializable read-write transactions under two-phase
//! locking, snapshot reads at a chosen timestamp with write-intent
//! resolution, a deterministic finish/cleanup protocol, and safe-time
//! ordered command submission.
//!
//! The coordinator is environment-agnostic: storage engines, the raft
//! client, the lock manager, the catalog, the placement driver and the
//! cross-partition transaction services are injected through the trait
//! seams in [`capabilities`].

pub mod busy;
pub mod capabilities;
pub mod command;
pub mod cursor;
pub mod dispatcher;
pub mod error;
pub mod index;
pub mod locks;
pub mod mvcc;
pub mod replica;
pub mod request;
pub mod schema;
pub mod tx_state;
pub mod types;

pub use error::{RaftError, ReplicaError, Result};
pub use replica::{PartitionReplica, PendingReplication, ReplicaDeps, ReplicaResponse, ReplicaResult};
pub use request::ReplicaRequest;
