//! Trait seams for the coordinator's external collaborators.
//!
//! The coordinator is transport-, storage- and catalog-agnostic: everything
//! it needs from the outside world comes in through these traits, held as
//! shared handles. Concrete implementations can be raft clients and
//! persistent engines in a node process, or in-memory harnesses in tests.
//! Infrastructure failures surface as `anyhow::Result` and get wrapped with
//! the replication group id at the coordinator boundary.

use async_trait::async_trait;

use keystone_hlc::HybridTimestamp;

use crate::command::ReplicaCommand;
use crate::error::RaftError;
use crate::locks::{Lock, LockKey, LockMode};
use crate::types::{
    BinaryRow, BinaryTuple, BinaryTuplePrefix, IndexId, IndexRow, LeaseMeta, ReadResult,
    ReplicationGroupId, RowId, ScanFlags, SchemaVersion, TableId, TransactionResult, TxId, TxMeta,
    TxStateMeta,
};

/// Pull cursor over row ids, as produced by hash-index lookups.
pub trait RowIdCursor: Send {
    fn next(&mut self) -> anyhow::Result<Option<RowId>>;

    /// Release storage resources early. Dropping the cursor must have the
    /// same effect; this exists so close failures can be observed and
    /// logged instead of silently discarded.
    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Pull cursor over index rows, as produced by sorted-index scans.
pub trait IndexRowCursor: Send {
    fn next(&mut self) -> anyhow::Result<Option<IndexRow>>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Pull cursor over MVCC read results for a whole-partition scan.
pub trait PartitionScanCursor: Send {
    fn next(&mut self) -> anyhow::Result<Option<ReadResult>>;

    /// Committed version of the row the cursor currently points at, read at
    /// `ts`. Used to resolve write intents without re-seeking.
    fn committed(&mut self, ts: HybridTimestamp) -> anyhow::Result<Option<BinaryRow>>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Multi-version partition row storage (read side).
pub trait MvPartitionStorage: Send + Sync + 'static {
    /// Read the version of `row_id` visible at `ts`. A write intent is
    /// returned regardless of `ts`; the caller resolves it.
    fn read(&self, row_id: RowId, ts: HybridTimestamp) -> anyhow::Result<ReadResult>;

    /// Open a timestamp cursor over the partition.
    fn scan(&self, ts: HybridTimestamp) -> anyhow::Result<Box<dyn PartitionScanCursor>>;
}

/// Write side of the MVCC storage: applies replicated updates and switches
/// write intents. Implementations are shared between the local fast path and
/// the log apply path, so every operation must be idempotent.
pub trait StorageUpdateHandler: Send + Sync + 'static {
    #[allow(clippy::too_many_arguments)]
    fn handle_update(
        &self,
        tx_id: TxId,
        row_id: RowId,
        commit_group: ReplicationGroupId,
        row: Option<&BinaryRow>,
        track_write_intent: bool,
        commit_timestamp: Option<HybridTimestamp>,
        last_commit_timestamp: Option<HybridTimestamp>,
    );

    fn handle_update_all(
        &self,
        tx_id: TxId,
        commit_group: ReplicationGroupId,
        rows: &[crate::command::RowUpdate],
        track_write_intent: bool,
        commit_timestamp: Option<HybridTimestamp>,
    );

    /// Convert this transaction's write intents to committed versions
    /// (`commit = true`) or remove them (`commit = false`).
    fn switch_write_intents(
        &self,
        tx_id: TxId,
        commit: bool,
        commit_timestamp: Option<HybridTimestamp>,
    );

    /// Record that a reader observed a write intent of `tx_id` at `row_id`,
    /// so a later switch covers rows discovered after a restart.
    fn handle_write_intent_read(&self, tx_id: TxId, row_id: RowId);
}

/// Hash index storage handle (also used for the primary-key index).
pub trait HashIndex: Send + Sync + 'static {
    fn id(&self) -> IndexId;

    fn lookup(&self, key: &BinaryTuple) -> anyhow::Result<Box<dyn RowIdCursor>>;
}

/// Sorted index storage handle.
pub trait SortedIndex: Send + Sync + 'static {
    fn id(&self) -> IndexId;

    /// Open a range cursor. The read-write scan path passes `upper = None`
    /// and enforces the bound itself after taking the range lock, so the
    /// lock lands on the first row past the range edge as well.
    fn scan(
        &self,
        lower: Option<&BinaryTuplePrefix>,
        upper: Option<&BinaryTuplePrefix>,
        flags: ScanFlags,
    ) -> anyhow::Result<Box<dyn IndexRowCursor>>;

    /// Compare an index key against a bound prefix. `include_equality`
    /// widens the prefix with its equality flag first, which is how a
    /// `LESS_OR_EQUAL` upper bound admits keys equal to the prefix.
    fn compare_to_bound(
        &self,
        key: &BinaryTuple,
        bound: &BinaryTuplePrefix,
        include_equality: bool,
    ) -> std::cmp::Ordering;
}

/// Extracts key projections out of opaque rows. The coordinator never looks
/// inside a row payload itself.
pub trait RowCodec: Send + Sync + 'static {
    fn extract_pk(&self, row: &BinaryRow) -> anyhow::Result<BinaryTuple>;

    fn extract_index_key(&self, index_id: IndexId, row: &BinaryRow)
        -> anyhow::Result<BinaryTuple>;
}

/// Submits replicated commands to the group's log and reports the local
/// apply outcome.
#[async_trait]
pub trait RaftClient: Send + Sync + 'static {
    /// Run a command through replication. Finish commands resolve with the
    /// durable transaction result; update-like commands resolve with `None`.
    async fn run(
        &self,
        command: ReplicaCommand,
    ) -> std::result::Result<Option<TransactionResult>, RaftError>;
}

/// Placement driver view: who holds the primary lease for a group at a
/// given timestamp.
#[async_trait]
pub trait PlacementDriver: Send + Sync + 'static {
    async fn primary_replica(
        &self,
        group: ReplicationGroupId,
        at: HybridTimestamp,
    ) -> anyhow::Result<Option<LeaseMeta>>;
}

/// Lock manager seam. Acquisition suspends until the lock is granted;
/// release is synchronous and infallible.
#[async_trait]
pub trait LockManager: Send + Sync + 'static {
    async fn acquire(&self, tx_id: TxId, key: LockKey, mode: LockMode) -> anyhow::Result<Lock>;

    fn release(&self, lock: &Lock);

    /// Release every lock held by the transaction.
    fn release_all(&self, tx_id: TxId);
}

/// Durable transaction state storage; written only on the commit partition
/// by the finish/mark-locks-released commands.
pub trait TxStateStorage: Send + Sync + 'static {
    fn get(&self, tx_id: TxId) -> anyhow::Result<Option<TxMeta>>;

    /// Snapshot of all stored transactions, for the primary-elected sweep.
    fn scan(&self) -> anyhow::Result<Vec<(TxId, TxMeta)>>;
}

/// Catalog registry view used by schema validation. Lookups are positioned
/// at a timestamp; callers must have awaited metadata completeness for that
/// timestamp first.
pub trait CatalogService: Send + Sync + 'static {
    fn table_exists_at(&self, table_id: TableId, ts: HybridTimestamp) -> bool;

    fn table_schema_at(&self, table_id: TableId, ts: HybridTimestamp) -> Option<SchemaVersion>;

    fn active_catalog_version(&self, ts: HybridTimestamp) -> u32;

    fn forward_compatible(&self, table_id: TableId, from: SchemaVersion, to: SchemaVersion)
        -> bool;

    fn backward_compatible(
        &self,
        table_id: TableId,
        from: SchemaVersion,
        to: SchemaVersion,
    ) -> bool;
}

/// Awaits local metadata completeness up to a timestamp so that schema and
/// key extraction never observe a half-delivered catalog.
#[async_trait]
pub trait SchemaSyncService: Send + Sync + 'static {
    async fn wait_for_metadata_completeness(&self, ts: HybridTimestamp) -> anyhow::Result<()>;
}

/// Cross-partition transaction services: cleanup fan-out to enlisted
/// partitions and the finish entry point used by orphan recovery.
#[async_trait]
pub trait TxManager: Send + Sync + 'static {
    /// Send write-intent-switch cleanup to every enlisted partition.
    async fn cleanup(
        &self,
        groups: &[ReplicationGroupId],
        commit: bool,
        commit_timestamp: Option<HybridTimestamp>,
        tx_id: TxId,
    ) -> anyhow::Result<()>;

    /// Send a cleanup hint to a single node, addressed by consistent name.
    async fn cleanup_on_node(&self, node: &str, tx_id: TxId) -> anyhow::Result<()>;

    /// Finish a transaction through its commit partition; used by recovery
    /// to roll back abandoned transactions (`commit` is always false there).
    async fn finish(
        &self,
        commit_group: ReplicationGroupId,
        commit: bool,
        tx_id: TxId,
    ) -> anyhow::Result<()>;
}

/// Cluster roster view: maps inconsistent node ids to consistent names for
/// nodes still present in the topology.
pub trait ClusterNodeResolver: Send + Sync + 'static {
    fn consistent_name(&self, node_id: &str) -> Option<String>;
}

/// Asks a transaction's commit partition primary for its authoritative
/// state; the far side may trigger recovery before answering.
#[async_trait]
pub trait TxStatePartitionClient: Send + Sync + 'static {
    async fn resolve_tx_state(
        &self,
        commit_group: ReplicationGroupId,
        tx_id: TxId,
    ) -> anyhow::Result<TxStateMeta>;
}
