//! The partition replica coordinator.
//!
//! One instance fronts each `(table, partition)` replication group. Every
//! request runs the same pipeline: busy-lock entry, primary-lease check,
//! table/schema validation at the operation timestamp, then the per-kind
//! handler. Read handlers resolve MVCC results against transaction state;
//! write handlers take two-phase locks, validate schema after locking, and
//! submit replicated commands with safe-time stamps; the finish and
//! recovery handlers drive transactions to their durable outcome.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{info, warn};

use keystone_hlc::{HybridClock, HybridTimestamp, SafeTimeTracker};

use crate::busy::BusyLock;
use crate::capabilities::{
    ClusterNodeResolver, LockManager, MvPartitionStorage, PlacementDriver, RaftClient, RowCodec,
    StorageUpdateHandler, TxManager, TxStateStorage, TxStatePartitionClient,
};
use crate::command::{ReplicaCommand, RowUpdate};
use crate::cursor::{CursorRegistry, RegisteredCursor};
use crate::dispatcher::ReplicationDispatcher;
use crate::error::{ReplicaError, Result};
use crate::index::{IndexRegistry, SecondaryIndex};
use crate::locks::{Lock, LockKey, LockMode};
use crate::mvcc::{check_write_intents_belong_to_same_tx, MvccResolver, TimedRow};
use crate::request::{
    OpClass, ReplicaRequest, RoDirectMultiRowRequest, RoDirectSingleRowRequest,
    RoMultiRowPkRequest, RoScanRetrieveRequest, RoSingleRowPkRequest, RwMultiPkOp, RwMultiRowOp,
    RwMultiRowPkRequest, RwMultiRowRequest, RwPkOp, RwRowOp, RwScanRetrieveRequest,
    RwSingleRowPkRequest, RwSingleRowRequest, RwSwapRowRequest, BuildIndexRequest,
    TxFinishRequest, TxRecoveryRequest, TxStateRequest, WriteIntentSwitchRequest,
};
use crate::schema::{CommitValidation, SchemaCompatValidator};
use crate::tx_state::{TransactionStateResolver, TxStateMap};
use crate::types::{
    BinaryRow, BinaryTuple, LeaseMeta, PrimaryReplicaEvent, ReadResult, ReplicationGroupId, RowId,
    TransactionResult, TxId, TxMeta, TxState, TxStateMeta,
};

/// Backoff between durable-cleanup retries on the commit partition.
const DURABLE_CLEANUP_RETRY_BACKOFF: Duration = Duration::from_millis(250);
const DURABLE_CLEANUP_RETRY_BACKOFF_MAX: Duration = Duration::from_secs(15);

/// Result payload of one replica request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicaResponse {
    None,
    Bool(bool),
    Row(Option<BinaryRow>),
    /// Per-input results of a multi-row read, aligned with request order.
    Rows(Vec<Option<BinaryRow>>),
    /// Per-input applied flags of a multi-row mutation.
    Flags(Vec<bool>),
    /// One scan batch.
    Batch(Vec<BinaryRow>),
    TxResult(TransactionResult),
    TxMeta(Option<TxStateMeta>),
}

impl ReplicaResponse {
    fn batch_len(&self) -> usize {
        match self {
            ReplicaResponse::Batch(rows) => rows.len(),
            _ => 0,
        }
    }
}

/// Delayed-acknowledgement handle: the response was produced from the local
/// apply, replication is still in flight. Cloneable so both the client ack
/// path and the transaction op tracker can await it.
#[derive(Clone)]
#[derive(Debug)]
pub struct PendingReplication {
    group: ReplicationGroupId,
    rx: watch::Receiver<Option<std::result::Result<(), String>>>,
}

impl PendingReplication {
    fn channel(
        group: ReplicationGroupId,
    ) -> (
        watch::Sender<Option<std::result::Result<(), String>>>,
        PendingReplication,
    ) {
        let (tx, rx) = watch::channel(None);
        (tx, PendingReplication { group, rx })
    }

    async fn outcome(mut self) -> std::result::Result<(), String> {
        match self.rx.wait_for(|value| value.is_some()).await {
            Ok(value) => value.clone().unwrap_or(Ok(())),
            Err(_) => Err("replication task dropped before completion".to_string()),
        }
    }

    /// Wait for replication to finish.
    pub async fn wait(self) -> Result<()> {
        let group = self.group;
        self.outcome()
            .await
            .map_err(|msg| ReplicaError::replication(group, anyhow::anyhow!(msg)))
    }
}

/// Response plus the optional replication future for delayed ack.
#[derive(Debug)]
pub struct ReplicaResult {
    pub response: ReplicaResponse,
    pub replication: Option<PendingReplication>,
}

impl ReplicaResult {
    fn local(response: ReplicaResponse) -> Self {
        Self {
            response,
            replication: None,
        }
    }

    fn replicated(response: ReplicaResponse, replication: Option<PendingReplication>) -> Self {
        Self {
            response,
            replication,
        }
    }
}

type OpOutcome = std::result::Result<(), String>;

/// Pending operation futures of open transactions; the write-intent switch
/// drains them before switching, and primary expiration drains them before
/// releasing locks.
#[derive(Default)]
struct OpTracker {
    inner: StdMutex<HashMap<TxId, HashMap<OpClass, Vec<oneshot::Receiver<OpOutcome>>>>>,
}

impl OpTracker {
    /// Register a new in-flight operation; fails when the transaction is no
    /// longer accepting operations on this replica.
    fn register(
        &self,
        tx_id: TxId,
        class: OpClass,
        states: &TxStateMap,
    ) -> Result<oneshot::Sender<OpOutcome>> {
        let mut guard = self.inner.lock().expect("op tracker poisoned");

        let state = states.get(tx_id).map(|meta| meta.state);
        let accepting = matches!(state, Some(state) if !state.is_final());
        if !accepting {
            return Err(ReplicaError::StaleTransaction { tx_id, state });
        }

        let (tx, rx) = oneshot::channel();
        guard
            .entry(tx_id)
            .or_default()
            .entry(class)
            .or_default()
            .push(rx);
        Ok(tx)
    }

    /// Take the pending futures of one transaction, reads and updates
    /// separately. The entry itself stays registered, like the cursor
    /// registry it is only dropped with the transaction.
    fn drain(
        &self,
        tx_id: TxId,
    ) -> (
        Vec<oneshot::Receiver<OpOutcome>>,
        Vec<oneshot::Receiver<OpOutcome>>,
    ) {
        let mut guard = self.inner.lock().expect("op tracker poisoned");
        let mut reads = Vec::new();
        let mut updates = Vec::new();
        if let Some(ops) = guard.get_mut(&tx_id) {
            for (class, futures) in ops.iter_mut() {
                match class {
                    OpClass::RwRead => reads.append(futures),
                    OpClass::RwWrite => updates.append(futures),
                }
            }
        }
        (reads, updates)
    }

    /// Take every pending future, grouped per transaction.
    fn drain_all(&self) -> Vec<(TxId, Vec<oneshot::Receiver<OpOutcome>>)> {
        let mut guard = self.inner.lock().expect("op tracker poisoned");
        guard
            .iter_mut()
            .map(|(tx_id, ops)| {
                let futures = ops.values_mut().flat_map(std::mem::take).collect();
                (*tx_id, futures)
            })
            .collect()
    }

    fn remove(&self, tx_id: TxId) {
        self.inner.lock().expect("op tracker poisoned").remove(&tx_id);
    }
}

/// Everything a coordinator instance needs from its node environment.
pub struct ReplicaDeps {
    pub group: ReplicationGroupId,
    /// Consistent name of the local node, as leases report leaseholders.
    pub local_node_name: String,
    /// Inconsistent id of the local node, used when this replica itself
    /// triggers recovery.
    pub local_node_id: String,
    pub storage: Arc<dyn MvPartitionStorage>,
    pub update_handler: Arc<dyn StorageUpdateHandler>,
    pub raft: Arc<dyn RaftClient>,
    pub tx_manager: Arc<dyn TxManager>,
    pub lock_manager: Arc<dyn LockManager>,
    pub codec: Arc<dyn RowCodec>,
    pub indexes: Arc<IndexRegistry>,
    pub clock: Arc<HybridClock>,
    pub safe_time: Arc<SafeTimeTracker>,
    pub tx_state_storage: Arc<dyn TxStateStorage>,
    pub tx_states: Arc<TxStateMap>,
    pub tx_state_client: Arc<dyn TxStatePartitionClient>,
    pub catalog: Arc<dyn crate::capabilities::CatalogService>,
    pub schema_sync: Arc<dyn crate::capabilities::SchemaSyncService>,
    pub placement: Arc<dyn PlacementDriver>,
    pub cluster: Arc<dyn ClusterNodeResolver>,
}

pub struct PartitionReplica {
    group: ReplicationGroupId,
    local_node_name: String,
    local_node_id: String,
    storage: Arc<dyn MvPartitionStorage>,
    update_handler: Arc<dyn StorageUpdateHandler>,
    tx_manager: Arc<dyn TxManager>,
    lock_manager: Arc<dyn LockManager>,
    codec: Arc<dyn RowCodec>,
    indexes: Arc<IndexRegistry>,
    clock: Arc<HybridClock>,
    safe_time: Arc<SafeTimeTracker>,
    tx_state_storage: Arc<dyn TxStateStorage>,
    tx_states: Arc<TxStateMap>,
    mvcc: MvccResolver,
    schema: SchemaCompatValidator,
    placement: Arc<dyn PlacementDriver>,
    cluster: Arc<dyn ClusterNodeResolver>,
    dispatcher: Arc<ReplicationDispatcher>,
    cursors: CursorRegistry,
    ops: OpTracker,
    busy: BusyLock,
    stop_guard: AtomicBool,
    /// Commands that carry safe time are stamped and handed to replication
    /// under this mutex so apply order matches stamp order.
    linearize: Mutex<()>,
    /// Guards local pre-apply plus tracker advancement.
    safe_time_lock: Arc<Mutex<()>>,
}

impl PartitionReplica {
    pub fn new(deps: ReplicaDeps) -> Self {
        let safe_time_lock = Arc::new(Mutex::new(()));
        let dispatcher = Arc::new(ReplicationDispatcher::new(
            deps.group,
            deps.raft,
            deps.clock.clone(),
            deps.safe_time.clone(),
            safe_time_lock.clone(),
        ));
        let tx_resolver = Arc::new(TransactionStateResolver::new(
            deps.tx_states.clone(),
            deps.tx_state_client,
        ));
        let mvcc = MvccResolver::new(deps.group, tx_resolver, deps.update_handler.clone());
        let schema =
            SchemaCompatValidator::new(deps.group.table_id, deps.catalog, deps.schema_sync);

        Self {
            cursors: CursorRegistry::new(deps.group),
            group: deps.group,
            local_node_name: deps.local_node_name,
            local_node_id: deps.local_node_id,
            storage: deps.storage,
            update_handler: deps.update_handler,
            tx_manager: deps.tx_manager,
            lock_manager: deps.lock_manager,
            codec: deps.codec,
            indexes: deps.indexes,
            clock: deps.clock,
            safe_time: deps.safe_time,
            tx_state_storage: deps.tx_state_storage,
            tx_states: deps.tx_states,
            mvcc,
            schema,
            placement: deps.placement,
            cluster: deps.cluster,
            dispatcher,
            ops: OpTracker::default(),
            busy: BusyLock::new(),
            stop_guard: AtomicBool::new(false),
            linearize: Mutex::new(()),
            safe_time_lock,
        }
    }

    pub fn group(&self) -> ReplicationGroupId {
        self.group
    }

    /// Entry point for every replica request.
    pub async fn invoke(&self, request: ReplicaRequest, sender_id: &str) -> Result<ReplicaResult> {
        let _busy = self.busy.enter().ok_or(ReplicaError::NodeStopping {
            group: self.group,
        })?;

        let is_primary = self.ensure_replica_is_primary(&request).await?;
        self.process_request(request, is_primary, sender_id).await
    }

    /// Stop the coordinator: block new entries, drain in-flight requests,
    /// close leftover cursors.
    pub fn shutdown(&self) {
        if self.stop_guard.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(group = %self.group, "stopping partition replica");
        self.busy.block();
        if let Err(err) = self.cursors.close_all() {
            warn!(
                group = %self.group,
                error = %err,
                "leftover cursors failed to close on shutdown"
            );
        }
    }

    // ------------------------------------------------------------------
    // Primary-lease gatekeeper
    // ------------------------------------------------------------------

    /// For primary-replica requests the enlistment token must equal the
    /// current lease start and the lease must still be valid. For requests
    /// that only need to know whether this replica is primary, the answer
    /// comes back as `Some(flag)`.
    async fn ensure_replica_is_primary(&self, request: &ReplicaRequest) -> Result<Option<bool>> {
        let now = self.clock.now();

        if let Some(token) = request.enlistment_token() {
            let lease = self.current_lease(now).await?;

            let Some(lease) = lease else {
                return Err(ReplicaError::PrimaryReplicaMiss {
                    local_node: self.local_node_name.clone(),
                    leaseholder: None,
                    expected_token: Some(token),
                    actual_token: None,
                });
            };

            let current_token = lease.enlistment_token();
            if token != current_token || lease.expiration_time < now {
                return Err(ReplicaError::PrimaryReplicaMiss {
                    local_node: self.local_node_name.clone(),
                    leaseholder: Some(lease.leaseholder),
                    expected_token: Some(token),
                    actual_token: Some(current_token),
                });
            }

            Ok(None)
        } else if request.wants_primary_flag() {
            let lease = self.current_lease(now).await?;
            Ok(Some(lease.is_some_and(|lease| {
                lease.leaseholder == self.local_node_name
            })))
        } else {
            Ok(None)
        }
    }

    async fn current_lease(&self, at: HybridTimestamp) -> Result<Option<LeaseMeta>> {
        self.placement
            .primary_replica(self.group, at)
            .await
            .map_err(|err| ReplicaError::replication(self.group, err))
    }

    // ------------------------------------------------------------------
    // Shared validation prelude and dispatch
    // ------------------------------------------------------------------

    async fn process_request(
        &self,
        request: ReplicaRequest,
        is_primary: Option<bool>,
        sender_id: &str,
    ) -> Result<ReplicaResult> {
        // Scans always enlist pending volatile state: their `full` flag
        // only marks an implicit transaction, the scan itself is treated as
        // two-phase until the last batch.
        if let Some((tx_id, commit_group, full)) = request.committable() {
            let is_scan = matches!(request, ReplicaRequest::RwScanRetrieve(_));
            if !full || is_scan {
                let coordinator = sender_id.to_string();
                self.tx_states.update(tx_id, move |old| match old {
                    Some(meta) if meta.state.is_final() => Some(meta),
                    _ => Some(TxStateMeta::pending(coordinator, commit_group)),
                });
            }
        }

        if let ReplicaRequest::TxRecovery(req) = &request {
            let response = self.process_tx_recovery(req, sender_id).await?;
            return Ok(ReplicaResult::local(response));
        }

        // Direct read-only requests read at a timestamp chosen right here.
        let direct_op_ts = request.is_direct_read_only().then(|| self.clock.now());

        self.validate_table_existence(&request, direct_op_ts).await?;
        self.validate_schema_match(&request, direct_op_ts).await?;
        self.wait_for_schemas_before_reading(&request, direct_op_ts)
            .await?;

        self.process_operation_request(request, is_primary, sender_id, direct_op_ts)
            .await
    }

    /// The table must exist at the timestamp the operation runs at: `now`
    /// for read-write requests, the read timestamp for timestamped
    /// read-only requests, the chosen timestamp for direct reads.
    async fn validate_table_existence(
        &self,
        request: &ReplicaRequest,
        direct_op_ts: Option<HybridTimestamp>,
    ) -> Result<()> {
        let op_ts = if matches!(request, ReplicaRequest::ScanClose(_)) {
            None
        } else if request.is_read_write() {
            Some(self.clock.now())
        } else if let Some(ts) = request.read_timestamp() {
            Some(ts)
        } else {
            direct_op_ts
        };

        match op_ts {
            Some(ts) => {
                self.schema
                    .fail_if_table_does_not_exist_at(ts, self.group)
                    .await
            }
            None => Ok(()),
        }
    }

    /// A declared request schema version must equal the table schema at the
    /// transaction's reference timestamp.
    async fn validate_schema_match(
        &self,
        request: &ReplicaRequest,
        direct_op_ts: Option<HybridTimestamp>,
    ) -> Result<()> {
        let Some(requested) = request.schema_version() else {
            return Ok(());
        };
        let Some(ts) = request.tx_start_timestamp().or(direct_op_ts) else {
            return Ok(());
        };

        self.schema
            .fail_if_request_schema_differs(ts, requested, self.group)
            .await
    }

    /// Key extraction must only run against schemas that are already known
    /// locally for the transaction's start timestamp.
    async fn wait_for_schemas_before_reading(
        &self,
        request: &ReplicaRequest,
        direct_op_ts: Option<HybridTimestamp>,
    ) -> Result<()> {
        let Some(ts) = request.tx_start_timestamp().or(direct_op_ts) else {
            return Ok(());
        };
        self.schema.wait_for(ts, self.group).await
    }

    async fn process_operation_request(
        &self,
        request: ReplicaRequest,
        is_primary: Option<bool>,
        sender_id: &str,
        direct_op_ts: Option<HybridTimestamp>,
    ) -> Result<ReplicaResult> {
        match request {
            ReplicaRequest::RwSingleRow(req) => {
                let (tx_id, full) = (req.tx_id, req.full);
                self.append_tx_command(
                    tx_id,
                    OpClass::RwWrite,
                    full,
                    self.process_single_row(req, sender_id),
                )
                .await
            }
            ReplicaRequest::RwSingleRowPk(req) => {
                let (tx_id, full) = (req.tx_id, req.full);
                let class = if req.op == RwPkOp::Get {
                    OpClass::RwRead
                } else {
                    OpClass::RwWrite
                };
                self.append_tx_command(
                    tx_id,
                    class,
                    full,
                    self.process_single_row_pk(req, sender_id),
                )
                .await
            }
            ReplicaRequest::RwMultiRow(req) => {
                let (tx_id, full) = (req.tx_id, req.full);
                self.append_tx_command(
                    tx_id,
                    OpClass::RwWrite,
                    full,
                    self.process_multi_row(req, sender_id),
                )
                .await
            }
            ReplicaRequest::RwMultiRowPk(req) => {
                let (tx_id, full) = (req.tx_id, req.full);
                let class = if req.op == RwMultiPkOp::GetAll {
                    OpClass::RwRead
                } else {
                    OpClass::RwWrite
                };
                self.append_tx_command(
                    tx_id,
                    class,
                    full,
                    self.process_multi_row_pk(req, sender_id),
                )
                .await
            }
            ReplicaRequest::RwSwapRow(req) => {
                let (tx_id, full) = (req.tx_id, req.full);
                self.append_tx_command(
                    tx_id,
                    OpClass::RwWrite,
                    full,
                    self.process_swap_row(req, sender_id),
                )
                .await
            }
            ReplicaRequest::RwScanRetrieve(req) => self.process_rw_scan(req).await,
            ReplicaRequest::ScanClose(req) => {
                self.cursors
                    .close(req.tx_id, req.scan_id)
                    .map_err(|err| ReplicaError::replication(self.group, err))?;
                Ok(ReplicaResult::local(ReplicaResponse::None))
            }
            ReplicaRequest::TxFinish(req) => {
                let result = self.process_tx_finish(req).await?;
                Ok(ReplicaResult::local(ReplicaResponse::TxResult(result)))
            }
            ReplicaRequest::WriteIntentSwitch(req) => {
                self.process_write_intent_switch(req).await?;
                Ok(ReplicaResult::local(ReplicaResponse::None))
            }
            ReplicaRequest::TxRecovery(_) => unreachable!("handled before validation"),
            ReplicaRequest::TxStateCommitPartition(req) => {
                let meta = self.process_tx_state_request(req).await?;
                Ok(ReplicaResult::local(ReplicaResponse::TxMeta(meta)))
            }
            ReplicaRequest::RoSingleRowPk(req) => {
                let row = self.process_ro_single_get(req, is_primary).await?;
                Ok(ReplicaResult::local(ReplicaResponse::Row(row)))
            }
            ReplicaRequest::RoMultiRowPk(req) => {
                let rows = self.process_ro_multi_get(req, is_primary).await?;
                Ok(ReplicaResult::local(ReplicaResponse::Rows(rows)))
            }
            ReplicaRequest::RoScanRetrieve(req) => {
                let rows = self.process_ro_scan(req, is_primary).await?;
                Ok(ReplicaResult::local(ReplicaResponse::Batch(rows)))
            }
            ReplicaRequest::RoDirectSingleRow(req) => {
                let ts = direct_op_ts.expect("direct read without an operation timestamp");
                let row = self.process_ro_direct_single(req, ts).await?;
                Ok(ReplicaResult::local(ReplicaResponse::Row(row)))
            }
            ReplicaRequest::RoDirectMultiRow(req) => {
                let ts = direct_op_ts.expect("direct read without an operation timestamp");
                let rows = self.process_ro_direct_multi(req, ts).await?;
                Ok(ReplicaResult::local(ReplicaResponse::Rows(rows)))
            }
            ReplicaRequest::SafeTimeSync => {
                self.process_safe_time_sync(is_primary).await?;
                Ok(ReplicaResult::local(ReplicaResponse::None))
            }
            ReplicaRequest::BuildIndex(req) => {
                self.process_build_index(req).await?;
                Ok(ReplicaResult::local(ReplicaResponse::None))
            }
        }
    }

    // ------------------------------------------------------------------
    // Per-transaction operation tracking
    // ------------------------------------------------------------------

    /// Wrap a read-write operation so commit/rollback cannot race it. Full
    /// transactions skip tracking and release all their locks as soon as
    /// the operation (including replication) settles.
    async fn append_tx_command<F>(
        &self,
        tx_id: TxId,
        class: OpClass,
        full: bool,
        op: F,
    ) -> Result<ReplicaResult>
    where
        F: std::future::Future<Output = Result<ReplicaResult>>,
    {
        if full {
            let result = op.await;
            self.release_tx_locks(tx_id);
            return result;
        }

        let sender = self.ops.register(tx_id, class, &self.tx_states)?;

        match op.await {
            Err(err) => {
                let _ = sender.send(Err(err.to_string()));
                Err(err)
            }
            Ok(result) => {
                match &result.replication {
                    Some(replication) => {
                        let replication = replication.clone();
                        tokio::spawn(async move {
                            let _ = sender.send(replication.outcome().await);
                        });
                    }
                    None => {
                        let _ = sender.send(Ok(()));
                    }
                }
                Ok(result)
            }
        }
    }

    fn release_tx_locks(&self, tx_id: TxId) {
        self.lock_manager.release_all(tx_id);
    }
}

// ----------------------------------------------------------------------
// Read paths
// ----------------------------------------------------------------------

impl PartitionReplica {
    /// Read-only point get by primary key at the request's read timestamp.
    async fn process_ro_single_get(
        &self,
        req: RoSingleRowPkRequest,
        is_primary: Option<bool>,
    ) -> Result<Option<BinaryRow>> {
        let is_primary = is_primary.expect("read-only request without a primary flag");
        self.await_safe_time_for_read(is_primary, req.read_timestamp)
            .await;
        self.resolve_row_by_pk_for_read_only(&req.pk, req.read_timestamp)
            .await
    }

    async fn process_ro_multi_get(
        &self,
        req: RoMultiRowPkRequest,
        is_primary: Option<bool>,
    ) -> Result<Vec<Option<BinaryRow>>> {
        let is_primary = is_primary.expect("read-only request without a primary flag");
        self.await_safe_time_for_read(is_primary, req.read_timestamp)
            .await;

        let mut rows = Vec::with_capacity(req.pks.len());
        for pk in &req.pks {
            rows.push(
                self.resolve_row_by_pk_for_read_only(pk, req.read_timestamp)
                    .await?,
            );
        }
        Ok(rows)
    }

    async fn process_ro_direct_single(
        &self,
        req: RoDirectSingleRowRequest,
        op_ts: HybridTimestamp,
    ) -> Result<Option<BinaryRow>> {
        self.resolve_row_by_pk_for_read_only(&req.pk, op_ts).await
    }

    async fn process_ro_direct_multi(
        &self,
        req: RoDirectMultiRowRequest,
        op_ts: HybridTimestamp,
    ) -> Result<Vec<Option<BinaryRow>>> {
        let mut rows = Vec::with_capacity(req.pks.len());
        for pk in &req.pks {
            rows.push(self.resolve_row_by_pk_for_read_only(pk, op_ts).await?);
        }
        Ok(rows)
    }

    /// Snapshot readers wait until safe time reaches their read timestamp,
    /// unless this replica is primary and its clock already passed it (the
    /// primary has every command up to `now` by definition).
    async fn await_safe_time_for_read(&self, is_primary: bool, read_ts: HybridTimestamp) {
        if is_primary && self.clock.now() > read_ts {
            return;
        }
        self.safe_time.wait_for(read_ts).await;
    }

    /// Resolve a primary key to its visible row at `ts`.
    ///
    /// The primary-key index can hold several row ids for one key (delete
    /// and re-insert under the same key), but at most one of them resolves
    /// at any timestamp, and all write intents must belong to one
    /// transaction since the key is exclusively locked by writers.
    async fn resolve_row_by_pk_for_read_only(
        &self,
        pk: &BinaryTuple,
        ts: HybridTimestamp,
    ) -> Result<Option<BinaryRow>> {
        let mut cursor = self
            .indexes
            .pk_storage()
            .lookup(pk)
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        let mut write_intents: Vec<ReadResult> = Vec::new();
        let mut regular: Vec<ReadResult> = Vec::new();

        while let Some(row_id) = cursor
            .next()
            .map_err(|err| ReplicaError::replication(self.group, err))?
        {
            let read = self.read_storage(row_id, ts)?;
            if read.is_write_intent() {
                write_intents.push(read);
            } else if !read.is_empty() {
                regular.push(read);
            }
        }

        if write_intents.is_empty() {
            return Ok(regular.into_iter().next().and_then(|read| read.row));
        }

        check_write_intents_belong_to_same_tx(&write_intents);

        let intent = write_intents[0]
            .write_intent
            .expect("write intent bucket holds a non-intent");
        let readable = self
            .mvcc
            .resolve_write_intent_readability(intent, write_intents[0].row_id, Some(ts))
            .await?;

        if readable {
            return Ok(write_intents.into_iter().find_map(|read| read.row));
        }

        // Unreadable intent: walk the newest committed version under each
        // intent, then fall back to the committed entries.
        for read in &write_intents {
            let Some(newest) = read.newest_commit_timestamp else {
                continue;
            };
            let committed = self.read_storage(read.row_id, newest)?;
            debug_assert!(
                !committed.is_write_intent(),
                "version at the newest commit timestamp is not committed"
            );
            return Ok(committed.row);
        }

        Ok(regular.into_iter().next().and_then(|read| read.row))
    }

    /// Read-only scan batch: full partition scan, hash-index lookup, or
    /// sorted-index range scan, all cursor-memoized per `(tx, scan)`.
    async fn process_ro_scan(
        &self,
        req: RoScanRetrieveRequest,
        is_primary: Option<bool>,
    ) -> Result<Vec<BinaryRow>> {
        let is_primary = is_primary.expect("read-only request without a primary flag");
        self.await_safe_time_for_read(is_primary, req.read_timestamp)
            .await;

        if let Some(index_id) = req.index_to_use {
            let index = self.indexes.secondary(index_id).ok_or_else(|| {
                ReplicaError::replication(
                    self.group,
                    anyhow::anyhow!("index {index_id} is not registered on this partition"),
                )
            })?;

            return match (&index.storage, &req.exact_key) {
                (SecondaryIndex::Hash(hash), Some(key)) => {
                    let hash = hash.clone();
                    self.ro_index_lookup(&req, hash, key.clone()).await
                }
                (SecondaryIndex::Sorted(sorted), None) => {
                    let sorted = sorted.clone();
                    self.ro_sorted_scan(&req, sorted).await
                }
                (SecondaryIndex::Sorted(_), Some(_)) => Err(ReplicaError::replication(
                    self.group,
                    anyhow::anyhow!("index lookup with an exact key requires a hash index"),
                )),
                (SecondaryIndex::Hash(_), None) => Err(ReplicaError::replication(
                    self.group,
                    anyhow::anyhow!("hash index scan requires an exact key"),
                )),
            };
        }

        self.ro_partition_scan(&req).await
    }

    async fn ro_index_lookup(
        &self,
        req: &RoScanRetrieveRequest,
        index: Arc<dyn crate::capabilities::HashIndex>,
        key: BinaryTuple,
    ) -> Result<Vec<BinaryRow>> {
        let index_id = index.id();
        let cursor = self
            .cursors
            .get_or_create(req.tx_id, req.scan_id, || {
                Ok(RegisteredCursor::RowIds(index.lookup(&key)?))
            })
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        let mut out = Vec::with_capacity(req.batch_size);
        while out.len() < req.batch_size {
            let row_id = {
                let mut guard = cursor.lock().expect("cursor poisoned");
                match &mut *guard {
                    RegisteredCursor::RowIds(cursor) => cursor
                        .next()
                        .map_err(|err| ReplicaError::replication(self.group, err))?,
                    _ => None,
                }
            };
            let Some(row_id) = row_id else {
                break;
            };

            if let Some(timed) = self.resolve_plain_ro(row_id, req.read_timestamp).await? {
                if self.index_row_matches(index_id, &key, &timed.row)? {
                    out.push(timed.row);
                }
            }

            // Long lookup loops yield instead of growing the stack.
            tokio::task::yield_now().await;
        }
        Ok(out)
    }

    async fn ro_sorted_scan(
        &self,
        req: &RoScanRetrieveRequest,
        index: Arc<dyn crate::capabilities::SortedIndex>,
    ) -> Result<Vec<BinaryRow>> {
        let index_id = index.id();
        let cursor = self
            .cursors
            .get_or_create(req.tx_id, req.scan_id, || {
                Ok(RegisteredCursor::IndexRows(index.scan(
                    req.lower_bound.as_ref(),
                    req.upper_bound.as_ref(),
                    req.flags,
                )?))
            })
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        let mut out = Vec::with_capacity(req.batch_size);
        while out.len() < req.batch_size {
            let index_row = {
                let mut guard = cursor.lock().expect("cursor poisoned");
                match &mut *guard {
                    RegisteredCursor::IndexRows(cursor) => cursor
                        .next()
                        .map_err(|err| ReplicaError::replication(self.group, err))?,
                    _ => None,
                }
            };
            let Some(index_row) = index_row else {
                break;
            };

            if let Some(timed) = self
                .resolve_plain_ro(index_row.row_id, req.read_timestamp)
                .await?
            {
                if self.index_row_matches(index_id, &index_row.key, &timed.row)? {
                    out.push(timed.row);
                }
            }

            tokio::task::yield_now().await;
        }
        Ok(out)
    }

    async fn ro_partition_scan(&self, req: &RoScanRetrieveRequest) -> Result<Vec<BinaryRow>> {
        let cursor = self
            .cursors
            .get_or_create(req.tx_id, req.scan_id, || {
                Ok(RegisteredCursor::Partition(
                    self.storage.scan(req.read_timestamp)?,
                ))
            })
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        let mut out = Vec::with_capacity(req.batch_size);
        loop {
            if out.len() >= req.batch_size {
                break;
            }

            // Advance the cursor and eagerly capture the last committed
            // candidate while still positioned on the row.
            let (read, candidate) = {
                let mut guard = cursor.lock().expect("cursor poisoned");
                let scan = match &mut *guard {
                    RegisteredCursor::Partition(cursor) => cursor,
                    _ => break,
                };
                let Some(read) = scan
                    .next()
                    .map_err(|err| ReplicaError::replication(self.group, err))?
                else {
                    break;
                };

                let candidate = match (read.is_write_intent(), read.newest_commit_timestamp) {
                    (true, Some(newest)) => scan
                        .committed(newest)
                        .map_err(|err| ReplicaError::replication(self.group, err))?
                        .map(|row| TimedRow {
                            row,
                            commit_timestamp: Some(newest),
                        }),
                    _ => None,
                };
                (read, candidate)
            };

            let resolved = self
                .mvcc
                .resolve_read_result(read, None, Some(req.read_timestamp), move || Ok(candidate))
                .await?;
            if let Some(timed) = resolved {
                out.push(timed.row);
            }

            tokio::task::yield_now().await;
        }
        Ok(out)
    }

    /// Resolve one row id at a read-only timestamp.
    async fn resolve_plain_ro(
        &self,
        row_id: RowId,
        ts: HybridTimestamp,
    ) -> Result<Option<TimedRow>> {
        let read = self.read_storage(row_id, ts)?;
        let storage = self.storage.clone();
        let newest = read.newest_commit_timestamp;

        self.mvcc
            .resolve_read_result(read, None, Some(ts), move || {
                let Some(newest) = newest else {
                    return Ok(None);
                };
                let committed = storage.read(row_id, newest)?;
                debug_assert!(!committed.is_write_intent());
                Ok(committed.row.map(|row| TimedRow {
                    row,
                    commit_timestamp: committed.commit_timestamp,
                }))
            })
            .await
    }

    /// Resolve one row id in a read-write transaction (latest version plus
    /// own intents), then check the row's schema is readable by this
    /// transaction.
    async fn resolve_plain_rw(&self, row_id: RowId, tx_id: TxId) -> Result<Option<TimedRow>> {
        let read = self.read_storage(row_id, HybridTimestamp::MAX)?;
        let storage = self.storage.clone();
        let newest = read.newest_commit_timestamp;

        let resolved = self
            .mvcc
            .resolve_read_result(read, Some(tx_id), None, move || {
                let Some(newest) = newest else {
                    return Ok(None);
                };
                let committed = storage.read(row_id, newest)?;
                debug_assert!(!committed.is_write_intent());
                Ok(committed.row.map(|row| TimedRow {
                    row,
                    commit_timestamp: committed.commit_timestamp,
                }))
            })
            .await?;

        if let Some(timed) = &resolved {
            self.schema
                .validate_backwards(timed.row.schema_version, tx_id.begin_timestamp())?;
        }
        Ok(resolved)
    }

    fn read_storage(&self, row_id: RowId, ts: HybridTimestamp) -> Result<ReadResult> {
        self.storage
            .read(row_id, ts)
            .map_err(|err| ReplicaError::replication(self.group, err))
    }

    /// An index row matches a data row when the row still projects to the
    /// same index key; stale index entries are skipped.
    fn index_row_matches(
        &self,
        index_id: crate::types::IndexId,
        key: &BinaryTuple,
        row: &BinaryRow,
    ) -> Result<bool> {
        let actual = self
            .codec
            .extract_index_key(index_id, row)
            .map_err(|err| ReplicaError::replication(self.group, err))?;
        Ok(actual == *key)
    }

    // ------------------------------------------------------------------
    // Safe-time sync and index build passthrough
    // ------------------------------------------------------------------

    async fn process_safe_time_sync(&self, is_primary: Option<bool>) -> Result<()> {
        let is_primary = is_primary.expect("safe time sync without a primary flag");
        if !is_primary {
            return Ok(());
        }

        let now = self.clock.now();
        let catalog_version = self.schema.reliable_catalog_version(now, self.group).await?;
        let command = {
            let _lin = self.linearize.lock().await;
            ReplicaCommand::SafeTimeSync {
                safe_time: self.clock.now(),
                required_catalog_version: catalog_version,
            }
        };
        self.dispatcher.submit(command).await?;
        Ok(())
    }

    async fn process_build_index(&self, req: BuildIndexRequest) -> Result<()> {
        let now = self.clock.now();
        let catalog_version = self.schema.reliable_catalog_version(now, self.group).await?;
        let command = {
            let _lin = self.linearize.lock().await;
            ReplicaCommand::BuildIndex {
                safe_time: self.clock.now(),
                required_catalog_version: catalog_version,
                index_id: req.index_id,
                row_ids: req.row_ids,
                finish: req.finish,
            }
        };
        self.dispatcher.submit(command).await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Write path
// ----------------------------------------------------------------------

/// A primary key resolved to its current row under this transaction.
struct PkResolution {
    row_id: RowId,
    row: BinaryRow,
    /// Newest commit time of the version the row shadows; carried into the
    /// update command as a read-amplification hint.
    last_commit_ts: Option<HybridTimestamp>,
}

impl PartitionReplica {
    /// Find the row a primary key currently resolves to for `tx_id`,
    /// taking the primary-key lookup lock first.
    async fn resolve_row_by_pk(
        &self,
        pk: &BinaryTuple,
        tx_id: TxId,
    ) -> Result<Option<PkResolution>> {
        self.indexes
            .pk_locker()
            .locks_for_lookup_by_key(tx_id, pk)
            .await
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        let mut cursor = self
            .indexes
            .pk_storage()
            .lookup(pk)
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        loop {
            let Some(row_id) = cursor
                .next()
                .map_err(|err| ReplicaError::replication(self.group, err))?
            else {
                return Ok(None);
            };

            if let Some(timed) = self.resolve_plain_rw(row_id, tx_id).await? {
                return Ok(Some(PkResolution {
                    row_id,
                    row: timed.row,
                    last_commit_ts: timed.commit_timestamp,
                }));
            }
        }
    }

    fn extract_pk(&self, row: &BinaryRow) -> Result<BinaryTuple> {
        self.codec
            .extract_pk(row)
            .map_err(|err| ReplicaError::replication(self.group, err))
    }

    async fn acquire_lock(&self, tx_id: TxId, key: LockKey, mode: LockMode) -> Result<Lock> {
        self.lock_manager
            .acquire(tx_id, key, mode)
            .await
            .map_err(|err| ReplicaError::replication(self.group, err))
    }

    /// Locks for overwriting an existing row: table IX, row X, plus
    /// short-term index locks returned for post-apply release.
    async fn take_locks_for_update(
        &self,
        row: &BinaryRow,
        row_id: RowId,
        tx_id: TxId,
    ) -> Result<Vec<Lock>> {
        self.acquire_lock(tx_id, LockKey::Table(self.group.table_id), LockMode::IX)
            .await?;
        self.acquire_lock(
            tx_id,
            LockKey::Row(self.group.table_id, row_id),
            LockMode::X,
        )
        .await?;
        self.take_put_locks_on_indexes(row, tx_id).await
    }

    /// Locks for inserting a fresh row: table IX only, the row id is newly
    /// generated so nobody can contend on it.
    async fn take_locks_for_insert(&self, row: &BinaryRow, tx_id: TxId) -> Result<Vec<Lock>> {
        self.acquire_lock(tx_id, LockKey::Table(self.group.table_id), LockMode::IX)
            .await?;
        self.take_put_locks_on_indexes(row, tx_id).await
    }

    async fn take_put_locks_on_indexes(
        &self,
        row: &BinaryRow,
        tx_id: TxId,
    ) -> Result<Vec<Lock>> {
        let mut short_term = Vec::new();
        for locker in self.indexes.lockers() {
            let lock = locker
                .locks_for_insert(tx_id, row)
                .await
                .map_err(|err| ReplicaError::replication(self.group, err))?;
            short_term.push(lock);
        }
        Ok(short_term)
    }

    async fn take_remove_locks_on_indexes(&self, row: &BinaryRow, tx_id: TxId) -> Result<()> {
        for locker in self.indexes.lockers() {
            locker
                .locks_for_remove(tx_id, row)
                .await
                .map_err(|err| ReplicaError::replication(self.group, err))?;
        }
        Ok(())
    }

    async fn take_locks_for_delete(
        &self,
        row: &BinaryRow,
        row_id: RowId,
        tx_id: TxId,
    ) -> Result<()> {
        self.acquire_lock(tx_id, LockKey::Table(self.group.table_id), LockMode::IX)
            .await?;
        self.acquire_lock(
            tx_id,
            LockKey::Row(self.group.table_id, row_id),
            LockMode::X,
        )
        .await?;
        self.take_remove_locks_on_indexes(row, tx_id).await
    }

    /// Locks for a conditional delete: shared row lock first, upgraded to
    /// exclusive only when the stored value matches the expectation.
    async fn take_locks_for_delete_exact(
        &self,
        expected: &BinaryRow,
        row_id: RowId,
        actual: &BinaryRow,
        tx_id: TxId,
    ) -> Result<Option<RowId>> {
        self.acquire_lock(tx_id, LockKey::Table(self.group.table_id), LockMode::IX)
            .await?;
        self.acquire_lock(
            tx_id,
            LockKey::Row(self.group.table_id, row_id),
            LockMode::S,
        )
        .await?;

        if !actual.equal_values(expected) {
            return Ok(None);
        }

        self.acquire_lock(
            tx_id,
            LockKey::Row(self.group.table_id, row_id),
            LockMode::X,
        )
        .await?;
        self.take_remove_locks_on_indexes(actual, tx_id).await?;
        Ok(Some(row_id))
    }

    /// Locks for a compare-and-swap replace; `None` when the stored value
    /// does not match the expected one.
    async fn take_locks_for_replace(
        &self,
        expected: &BinaryRow,
        actual: Option<&BinaryRow>,
        new_row: &BinaryRow,
        row_id: RowId,
        tx_id: TxId,
    ) -> Result<Option<Vec<Lock>>> {
        self.acquire_lock(tx_id, LockKey::Table(self.group.table_id), LockMode::IX)
            .await?;
        self.acquire_lock(
            tx_id,
            LockKey::Row(self.group.table_id, row_id),
            LockMode::S,
        )
        .await?;

        let matches = actual.is_some_and(|actual| actual.equal_values(expected));
        if !matches {
            return Ok(None);
        }

        self.acquire_lock(
            tx_id,
            LockKey::Row(self.group.table_id, row_id),
            LockMode::X,
        )
        .await?;
        let short_term = self.take_put_locks_on_indexes(new_row, tx_id).await?;
        Ok(Some(short_term))
    }

    async fn take_locks_for_get(&self, row_id: RowId, tx_id: TxId) -> Result<()> {
        self.acquire_lock(tx_id, LockKey::Table(self.group.table_id), LockMode::IS)
            .await?;
        self.acquire_lock(
            tx_id,
            LockKey::Row(self.group.table_id, row_id),
            LockMode::S,
        )
        .await?;
        Ok(())
    }

    fn release_short_term_locks(&self, locks: &[Lock]) {
        for lock in locks {
            self.lock_manager.release(lock);
        }
    }

    /// Schema checks after the locks are held: the table schema must not
    /// have changed since the transaction began.
    async fn validate_rw_read_after_locks(&self, tx_id: TxId) -> Result<()> {
        let operation_ts = self.clock.now();
        self.schema.wait_for(operation_ts, self.group).await?;
        self.schema
            .fail_if_schema_changed_since_tx_start(tx_id.begin_timestamp(), operation_ts)
    }

    /// Same as the read variant, but also pins the catalog version the
    /// update command will require on apply.
    async fn validate_write_after_locks(&self, tx_id: TxId) -> Result<u32> {
        let operation_ts = self.clock.now();
        let catalog_version = self
            .schema
            .reliable_catalog_version(operation_ts, self.group)
            .await?;
        self.schema
            .fail_if_schema_changed_since_tx_start(tx_id.begin_timestamp(), operation_ts)?;
        Ok(catalog_version)
    }

    // ------------------------------------------------------------------
    // Single-row handlers
    // ------------------------------------------------------------------

    async fn process_single_row_pk(
        &self,
        req: RwSingleRowPkRequest,
        sender_id: &str,
    ) -> Result<ReplicaResult> {
        let tx_id = req.tx_id;

        match req.op {
            RwPkOp::Get => {
                let Some(resolution) = self.resolve_row_by_pk(&req.pk, tx_id).await? else {
                    return Ok(ReplicaResult::local(ReplicaResponse::Row(None)));
                };
                self.take_locks_for_get(resolution.row_id, tx_id).await?;
                self.validate_rw_read_after_locks(tx_id).await?;
                Ok(ReplicaResult::local(ReplicaResponse::Row(Some(
                    resolution.row,
                ))))
            }
            RwPkOp::Delete => {
                let Some(resolution) = self.resolve_row_by_pk(&req.pk, tx_id).await? else {
                    return Ok(ReplicaResult::local(ReplicaResponse::Bool(false)));
                };
                self.take_locks_for_delete(&resolution.row, resolution.row_id, tx_id)
                    .await?;
                let catalog_version = self.validate_write_after_locks(tx_id).await?;
                self.mvcc.cleanup().await_row(resolution.row_id).await;

                let replication = self
                    .apply_update_command(
                        tx_id,
                        req.commit_group,
                        RowUpdate {
                            row_id: resolution.row_id,
                            row: None,
                            last_commit_timestamp: resolution.last_commit_ts,
                        },
                        req.full,
                        sender_id,
                        catalog_version,
                    )
                    .await?;
                Ok(ReplicaResult::replicated(
                    ReplicaResponse::Bool(true),
                    replication,
                ))
            }
            RwPkOp::GetAndDelete => {
                let Some(resolution) = self.resolve_row_by_pk(&req.pk, tx_id).await? else {
                    return Ok(ReplicaResult::local(ReplicaResponse::Row(None)));
                };
                self.take_locks_for_delete(&resolution.row, resolution.row_id, tx_id)
                    .await?;
                let catalog_version = self.validate_write_after_locks(tx_id).await?;
                self.mvcc.cleanup().await_row(resolution.row_id).await;

                let replication = self
                    .apply_update_command(
                        tx_id,
                        req.commit_group,
                        RowUpdate {
                            row_id: resolution.row_id,
                            row: None,
                            last_commit_timestamp: resolution.last_commit_ts,
                        },
                        req.full,
                        sender_id,
                        catalog_version,
                    )
                    .await?;
                Ok(ReplicaResult::replicated(
                    ReplicaResponse::Row(Some(resolution.row)),
                    replication,
                ))
            }
        }
    }

    async fn process_single_row(
        &self,
        req: RwSingleRowRequest,
        sender_id: &str,
    ) -> Result<ReplicaResult> {
        let tx_id = req.tx_id;
        let pk = self.extract_pk(&req.row)?;
        let resolution = self.resolve_row_by_pk(&pk, tx_id).await?;

        match req.op {
            RwRowOp::Insert => {
                if resolution.is_some() {
                    return Ok(ReplicaResult::local(ReplicaResponse::Bool(false)));
                }
                let row_id = RowId::generate(self.group.partition_id);
                let short_term = self.take_locks_for_insert(&req.row, tx_id).await?;
                let catalog_version = self.validate_write_after_locks(tx_id).await?;

                let replication = self
                    .apply_update_command(
                        tx_id,
                        req.commit_group,
                        RowUpdate {
                            row_id,
                            row: Some(req.row.clone()),
                            last_commit_timestamp: None,
                        },
                        req.full,
                        sender_id,
                        catalog_version,
                    )
                    .await?;
                self.release_short_term_locks(&short_term);
                Ok(ReplicaResult::replicated(
                    ReplicaResponse::Bool(true),
                    replication,
                ))
            }
            RwRowOp::Upsert | RwRowOp::GetAndUpsert => {
                let previous = resolution.as_ref().map(|res| res.row.clone());
                let (row_id, last_commit_ts, existing, short_term) = match &resolution {
                    Some(res) => (
                        res.row_id,
                        res.last_commit_ts,
                        true,
                        self.take_locks_for_update(&req.row, res.row_id, tx_id).await?,
                    ),
                    None => (
                        RowId::generate(self.group.partition_id),
                        None,
                        false,
                        self.take_locks_for_insert(&req.row, tx_id).await?,
                    ),
                };

                let catalog_version = self.validate_write_after_locks(tx_id).await?;
                if existing {
                    self.mvcc.cleanup().await_row(row_id).await;
                }

                let replication = self
                    .apply_update_command(
                        tx_id,
                        req.commit_group,
                        RowUpdate {
                            row_id,
                            row: Some(req.row.clone()),
                            last_commit_timestamp: last_commit_ts,
                        },
                        req.full,
                        sender_id,
                        catalog_version,
                    )
                    .await?;
                self.release_short_term_locks(&short_term);

                let response = match req.op {
                    RwRowOp::GetAndUpsert => ReplicaResponse::Row(previous),
                    _ => ReplicaResponse::None,
                };
                Ok(ReplicaResult::replicated(response, replication))
            }
            RwRowOp::GetAndReplace | RwRowOp::ReplaceIfExists => {
                let Some(resolution) = resolution else {
                    let response = match req.op {
                        RwRowOp::GetAndReplace => ReplicaResponse::Row(None),
                        _ => ReplicaResponse::Bool(false),
                    };
                    return Ok(ReplicaResult::local(response));
                };

                let short_term = self
                    .take_locks_for_update(&req.row, resolution.row_id, tx_id)
                    .await?;
                let catalog_version = self.validate_write_after_locks(tx_id).await?;
                self.mvcc.cleanup().await_row(resolution.row_id).await;

                let replication = self
                    .apply_update_command(
                        tx_id,
                        req.commit_group,
                        RowUpdate {
                            row_id: resolution.row_id,
                            row: Some(req.row.clone()),
                            last_commit_timestamp: resolution.last_commit_ts,
                        },
                        req.full,
                        sender_id,
                        catalog_version,
                    )
                    .await?;
                self.release_short_term_locks(&short_term);

                let response = match req.op {
                    RwRowOp::GetAndReplace => ReplicaResponse::Row(Some(resolution.row)),
                    _ => ReplicaResponse::Bool(true),
                };
                Ok(ReplicaResult::replicated(response, replication))
            }
            RwRowOp::DeleteExact => {
                let Some(resolution) = resolution else {
                    return Ok(ReplicaResult::local(ReplicaResponse::Bool(false)));
                };

                let validated = self
                    .take_locks_for_delete_exact(&req.row, resolution.row_id, &resolution.row, tx_id)
                    .await?;
                let Some(row_id) = validated else {
                    // Value mismatch: no exclusive lock taken, nothing
                    // submitted to replication.
                    return Ok(ReplicaResult::local(ReplicaResponse::Bool(false)));
                };

                let catalog_version = self.validate_write_after_locks(tx_id).await?;
                self.mvcc.cleanup().await_row(row_id).await;

                let replication = self
                    .apply_update_command(
                        tx_id,
                        req.commit_group,
                        RowUpdate {
                            row_id,
                            row: None,
                            last_commit_timestamp: resolution.last_commit_ts,
                        },
                        req.full,
                        sender_id,
                        catalog_version,
                    )
                    .await?;
                Ok(ReplicaResult::replicated(
                    ReplicaResponse::Bool(true),
                    replication,
                ))
            }
        }
    }

    async fn process_swap_row(
        &self,
        req: RwSwapRowRequest,
        sender_id: &str,
    ) -> Result<ReplicaResult> {
        let tx_id = req.tx_id;
        let pk = self.extract_pk(&req.new_row)?;

        let Some(resolution) = self.resolve_row_by_pk(&pk, tx_id).await? else {
            return Ok(ReplicaResult::local(ReplicaResponse::Bool(false)));
        };

        let Some(short_term) = self
            .take_locks_for_replace(
                &req.old_row,
                Some(&resolution.row),
                &req.new_row,
                resolution.row_id,
                tx_id,
            )
            .await?
        else {
            return Ok(ReplicaResult::local(ReplicaResponse::Bool(false)));
        };

        let catalog_version = self.validate_write_after_locks(tx_id).await?;
        self.mvcc.cleanup().await_row(resolution.row_id).await;

        let replication = self
            .apply_update_command(
                tx_id,
                req.commit_group,
                RowUpdate {
                    row_id: resolution.row_id,
                    row: Some(req.new_row.clone()),
                    last_commit_timestamp: resolution.last_commit_ts,
                },
                req.full,
                sender_id,
                catalog_version,
            )
            .await?;
        self.release_short_term_locks(&short_term);

        Ok(ReplicaResult::replicated(
            ReplicaResponse::Bool(true),
            replication,
        ))
    }

    // ------------------------------------------------------------------
    // Multi-row handlers
    // ------------------------------------------------------------------

    async fn process_multi_row(
        &self,
        req: RwMultiRowRequest,
        sender_id: &str,
    ) -> Result<ReplicaResult> {
        let tx_id = req.tx_id;

        match req.op {
            RwMultiRowOp::DeleteExactAll => {
                let mut flags = Vec::with_capacity(req.rows.len());
                let mut updates = Vec::new();
                let mut locked_rows = Vec::new();

                for search_row in &req.rows {
                    let pk = self.extract_pk(search_row)?;
                    let Some(resolution) = self.resolve_row_by_pk(&pk, tx_id).await? else {
                        flags.push(false);
                        continue;
                    };

                    match self
                        .take_locks_for_delete_exact(
                            search_row,
                            resolution.row_id,
                            &resolution.row,
                            tx_id,
                        )
                        .await?
                    {
                        Some(row_id) => {
                            updates.push(RowUpdate {
                                row_id,
                                row: None,
                                last_commit_timestamp: resolution.last_commit_ts,
                            });
                            locked_rows.push(row_id);
                            flags.push(true);
                        }
                        None => flags.push(false),
                    }
                }

                if updates.is_empty() {
                    return Ok(ReplicaResult::local(ReplicaResponse::Flags(flags)));
                }

                let catalog_version = self.validate_write_after_locks(tx_id).await?;
                self.mvcc.cleanup().await_rows(&locked_rows).await;

                let replication = self
                    .apply_update_all_command(
                        tx_id,
                        req.commit_group,
                        updates,
                        req.full,
                        req.skip_delayed_ack,
                        sender_id,
                        catalog_version,
                    )
                    .await?;
                Ok(ReplicaResult::replicated(
                    ReplicaResponse::Flags(flags),
                    replication,
                ))
            }
            RwMultiRowOp::InsertAll => {
                let mut flags = Vec::with_capacity(req.rows.len());
                let mut to_insert: Vec<(RowId, BinaryRow)> = Vec::new();
                let mut unique_keys: BTreeSet<bytes::Bytes> = BTreeSet::new();

                for row in &req.rows {
                    let pk = self.extract_pk(row)?;
                    let existing = self.resolve_row_by_pk(&pk, tx_id).await?;

                    if existing.is_none() && unique_keys.insert(pk.0.clone()) {
                        to_insert.push((RowId::generate(self.group.partition_id), row.clone()));
                        flags.push(true);
                    } else {
                        flags.push(false);
                    }
                }

                if to_insert.is_empty() {
                    return Ok(ReplicaResult::local(ReplicaResponse::Flags(flags)));
                }

                let mut short_term = Vec::new();
                for (_, row) in &to_insert {
                    short_term.extend(self.take_locks_for_insert(row, tx_id).await?);
                }

                // Fresh rows only: nothing to await in the cleanup map.
                let catalog_version = self.validate_write_after_locks(tx_id).await?;

                let updates = to_insert
                    .into_iter()
                    .map(|(row_id, row)| RowUpdate {
                        row_id,
                        row: Some(row),
                        last_commit_timestamp: None,
                    })
                    .collect();

                let replication = self
                    .apply_update_all_command(
                        tx_id,
                        req.commit_group,
                        updates,
                        req.full,
                        req.skip_delayed_ack,
                        sender_id,
                        catalog_version,
                    )
                    .await?;
                self.release_short_term_locks(&short_term);
                Ok(ReplicaResult::replicated(
                    ReplicaResponse::Flags(flags),
                    replication,
                ))
            }
            RwMultiRowOp::UpsertAll => {
                let mut updates = Vec::with_capacity(req.rows.len());
                let mut existing_rows = Vec::new();
                let mut short_term = Vec::new();

                for row in &req.rows {
                    let pk = self.extract_pk(row)?;
                    match self.resolve_row_by_pk(&pk, tx_id).await? {
                        Some(resolution) => {
                            short_term.extend(
                                self.take_locks_for_update(row, resolution.row_id, tx_id)
                                    .await?,
                            );
                            existing_rows.push(resolution.row_id);
                            updates.push(RowUpdate {
                                row_id: resolution.row_id,
                                row: Some(row.clone()),
                                last_commit_timestamp: resolution.last_commit_ts,
                            });
                        }
                        None => {
                            short_term.extend(self.take_locks_for_insert(row, tx_id).await?);
                            updates.push(RowUpdate {
                                row_id: RowId::generate(self.group.partition_id),
                                row: Some(row.clone()),
                                last_commit_timestamp: None,
                            });
                        }
                    }
                }

                if updates.is_empty() {
                    return Ok(ReplicaResult::local(ReplicaResponse::None));
                }

                let catalog_version = self.validate_write_after_locks(tx_id).await?;
                self.mvcc.cleanup().await_rows(&existing_rows).await;

                let replication = self
                    .apply_update_all_command(
                        tx_id,
                        req.commit_group,
                        updates,
                        req.full,
                        req.skip_delayed_ack,
                        sender_id,
                        catalog_version,
                    )
                    .await?;
                self.release_short_term_locks(&short_term);
                Ok(ReplicaResult::replicated(ReplicaResponse::None, replication))
            }
        }
    }

    async fn process_multi_row_pk(
        &self,
        req: RwMultiRowPkRequest,
        sender_id: &str,
    ) -> Result<ReplicaResult> {
        let tx_id = req.tx_id;

        match req.op {
            RwMultiPkOp::GetAll => {
                let mut rows = Vec::with_capacity(req.pks.len());
                for pk in &req.pks {
                    match self.resolve_row_by_pk(pk, tx_id).await? {
                        Some(resolution) => {
                            self.take_locks_for_get(resolution.row_id, tx_id).await?;
                            rows.push(Some(resolution.row));
                        }
                        None => rows.push(None),
                    }
                }

                if rows.iter().any(Option::is_some) {
                    self.validate_rw_read_after_locks(tx_id).await?;
                }
                Ok(ReplicaResult::local(ReplicaResponse::Rows(rows)))
            }
            RwMultiPkOp::DeleteAll => {
                let mut flags = Vec::with_capacity(req.pks.len());
                let mut updates = Vec::new();
                let mut locked_rows = Vec::new();

                for pk in &req.pks {
                    let Some(resolution) = self.resolve_row_by_pk(pk, tx_id).await? else {
                        flags.push(false);
                        continue;
                    };
                    self.take_locks_for_delete(&resolution.row, resolution.row_id, tx_id)
                        .await?;
                    updates.push(RowUpdate {
                        row_id: resolution.row_id,
                        row: None,
                        last_commit_timestamp: resolution.last_commit_ts,
                    });
                    locked_rows.push(resolution.row_id);
                    flags.push(true);
                }

                if updates.is_empty() {
                    return Ok(ReplicaResult::local(ReplicaResponse::Flags(flags)));
                }

                let catalog_version = self.validate_write_after_locks(tx_id).await?;
                self.mvcc.cleanup().await_rows(&locked_rows).await;

                let replication = self
                    .apply_update_all_command(
                        tx_id,
                        req.commit_group,
                        updates,
                        req.full,
                        req.skip_delayed_ack,
                        sender_id,
                        catalog_version,
                    )
                    .await?;
                Ok(ReplicaResult::replicated(
                    ReplicaResponse::Flags(flags),
                    replication,
                ))
            }
        }
    }

    // ------------------------------------------------------------------
    // Read-write scans
    // ------------------------------------------------------------------

    /// Read-write scan batches are always tracked as two-phase operations;
    /// an implicit (`full`) scan downgrades to an immediate lock release
    /// only when the batch shows the scan is complete, or on error.
    async fn process_rw_scan(&self, req: RwScanRetrieveRequest) -> Result<ReplicaResult> {
        let tx_id = req.tx_id;
        let full = req.full;
        let batch_size = req.batch_size;

        let outcome = async {
            let result = self
                .append_tx_command(
                    tx_id,
                    OpClass::RwRead,
                    false,
                    self.process_rw_scan_batch(&req),
                )
                .await?;
            if result.response.batch_len() > 0 {
                self.validate_rw_read_after_locks(tx_id).await?;
            }
            Ok::<ReplicaResult, ReplicaError>(result)
        }
        .await;

        if full {
            let finished = match &outcome {
                Ok(result) => result.response.batch_len() < batch_size,
                Err(_) => true,
            };
            if finished {
                self.release_tx_locks(tx_id);
            }
        }

        outcome
    }

    async fn process_rw_scan_batch(&self, req: &RwScanRetrieveRequest) -> Result<ReplicaResult> {
        let rows = if let Some(index_id) = req.index_to_use {
            let index = self.indexes.secondary(index_id).ok_or_else(|| {
                ReplicaError::replication(
                    self.group,
                    anyhow::anyhow!("index {index_id} is not registered on this partition"),
                )
            })?;

            match (&index.storage, &req.exact_key) {
                (SecondaryIndex::Hash(hash), Some(key)) => {
                    self.rw_index_lookup(req, index_id, hash.clone(), key.clone())
                        .await?
                }
                (SecondaryIndex::Sorted(sorted), None) => {
                    self.rw_sorted_scan(req, &index.locker, sorted.clone()).await?
                }
                _ => {
                    return Err(ReplicaError::replication(
                        self.group,
                        anyhow::anyhow!("scan shape does not match index {index_id} kind"),
                    ))
                }
            }
        } else {
            self.rw_partition_scan(req).await?
        };

        Ok(ReplicaResult::local(ReplicaResponse::Batch(rows)))
    }

    /// Hash-index lookup under locks: IS on the index and table, S on the
    /// index key, then S on every matching row.
    async fn rw_index_lookup(
        &self,
        req: &RwScanRetrieveRequest,
        index_id: crate::types::IndexId,
        index: Arc<dyn crate::capabilities::HashIndex>,
        key: BinaryTuple,
    ) -> Result<Vec<BinaryRow>> {
        let tx_id = req.tx_id;

        self.acquire_lock(tx_id, LockKey::Index(index_id), LockMode::IS)
            .await?;
        self.acquire_lock(tx_id, LockKey::Table(self.group.table_id), LockMode::IS)
            .await?;
        self.acquire_lock(
            tx_id,
            LockKey::IndexKey(index_id, key.0.clone()),
            LockMode::S,
        )
        .await?;

        let cursor = self
            .cursors
            .get_or_create(tx_id, req.scan_id, || {
                Ok(RegisteredCursor::RowIds(index.lookup(&key)?))
            })
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        let mut out = Vec::with_capacity(req.batch_size);
        while out.len() < req.batch_size {
            let row_id = {
                let mut guard = cursor.lock().expect("cursor poisoned");
                match &mut *guard {
                    RegisteredCursor::RowIds(cursor) => cursor
                        .next()
                        .map_err(|err| ReplicaError::replication(self.group, err))?,
                    _ => None,
                }
            };
            let Some(row_id) = row_id else {
                break;
            };

            self.acquire_lock(
                tx_id,
                LockKey::Row(self.group.table_id, row_id),
                LockMode::S,
            )
            .await?;

            if let Some(timed) = self.resolve_plain_rw(row_id, tx_id).await? {
                out.push(timed.row);
            }

            tokio::task::yield_now().await;
        }
        Ok(out)
    }

    /// Sorted-index range scan: every returned index row is S-locked by the
    /// index locker before the upper bound is tested, so the range edge is
    /// protected against concurrent inserts and deletes.
    async fn rw_sorted_scan(
        &self,
        req: &RwScanRetrieveRequest,
        locker: &crate::index::IndexLocker,
        index: Arc<dyn crate::capabilities::SortedIndex>,
    ) -> Result<Vec<BinaryRow>> {
        let tx_id = req.tx_id;
        let index_id = index.id();

        self.acquire_lock(tx_id, LockKey::Index(index_id), LockMode::IS)
            .await?;
        self.acquire_lock(tx_id, LockKey::Table(self.group.table_id), LockMode::IS)
            .await?;

        // The storage cursor runs without an upper bound; the bound is
        // enforced here, after the range lock lands on each row.
        let cursor = self
            .cursors
            .get_or_create(tx_id, req.scan_id, || {
                Ok(RegisteredCursor::IndexRows(index.scan(
                    req.lower_bound.as_ref(),
                    None,
                    req.flags,
                )?))
            })
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        let mut out = Vec::with_capacity(req.batch_size);
        while out.len() < req.batch_size {
            let index_row = locker
                .locks_for_scan(tx_id, &cursor)
                .await
                .map_err(|err| ReplicaError::replication(self.group, err))?;
            let Some(index_row) = index_row else {
                break;
            };

            if let Some(upper) = &req.upper_bound {
                let reached = index.compare_to_bound(&index_row.key, upper, req.flags.upper_inclusive)
                    != std::cmp::Ordering::Less;
                if reached {
                    break;
                }
            }

            self.acquire_lock(
                tx_id,
                LockKey::Row(self.group.table_id, index_row.row_id),
                LockMode::S,
            )
            .await?;

            if let Some(timed) = self.resolve_plain_rw(index_row.row_id, tx_id).await? {
                if self.index_row_matches(index_id, &index_row.key, &timed.row)? {
                    out.push(timed.row);
                }
            }

            tokio::task::yield_now().await;
        }
        Ok(out)
    }

    /// Full partition scan under a table-wide shared lock.
    async fn rw_partition_scan(&self, req: &RwScanRetrieveRequest) -> Result<Vec<BinaryRow>> {
        let tx_id = req.tx_id;

        self.acquire_lock(tx_id, LockKey::Table(self.group.table_id), LockMode::S)
            .await?;

        let cursor = self
            .cursors
            .get_or_create(tx_id, req.scan_id, || {
                Ok(RegisteredCursor::Partition(
                    self.storage.scan(HybridTimestamp::MAX)?,
                ))
            })
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        let mut out = Vec::with_capacity(req.batch_size);
        loop {
            if out.len() >= req.batch_size {
                break;
            }

            let (read, candidate) = {
                let mut guard = cursor.lock().expect("cursor poisoned");
                let scan = match &mut *guard {
                    RegisteredCursor::Partition(cursor) => cursor,
                    _ => break,
                };
                let Some(read) = scan
                    .next()
                    .map_err(|err| ReplicaError::replication(self.group, err))?
                else {
                    break;
                };

                let candidate = match (read.is_write_intent(), read.newest_commit_timestamp) {
                    (true, Some(newest)) => scan
                        .committed(newest)
                        .map_err(|err| ReplicaError::replication(self.group, err))?
                        .map(|row| TimedRow {
                            row,
                            commit_timestamp: Some(newest),
                        }),
                    _ => None,
                };
                (read, candidate)
            };

            let resolved = self
                .mvcc
                .resolve_read_result(read, Some(tx_id), None, move || Ok(candidate))
                .await?;
            if let Some(timed) = resolved {
                self.schema
                    .validate_backwards(timed.row.schema_version, tx_id.begin_timestamp())?;
                out.push(timed.row);
            }

            tokio::task::yield_now().await;
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Command application
    // ------------------------------------------------------------------

    /// Stamp and submit an update command. For an ongoing (non-full)
    /// transaction the change is applied to local storage immediately and
    /// the replication future is handed back for delayed acknowledgement;
    /// a full transaction awaits replication and applies after it, guarded
    /// against late duplicates by the safe-time watermark.
    async fn apply_update_command(
        &self,
        tx_id: TxId,
        commit_group: ReplicationGroupId,
        update: RowUpdate,
        full: bool,
        coordinator_id: &str,
        catalog_version: u32,
    ) -> Result<Option<PendingReplication>> {
        let full_submission = {
            let _lin = self.linearize.lock().await;
            let command = ReplicaCommand::Update {
                safe_time: self.clock.now(),
                required_catalog_version: catalog_version,
                tx_id,
                commit_group,
                update: update.clone(),
                full,
                coordinator_id: coordinator_id.to_string(),
            };
            let stamped = command.safe_time();

            if !full {
                {
                    let _st = self.safe_time_lock.lock().await;
                    self.update_handler.handle_update(
                        tx_id,
                        update.row_id,
                        commit_group,
                        update.row.as_ref(),
                        true,
                        None,
                        update.last_commit_timestamp,
                    );
                    self.safe_time.advance(stamped);
                }

                let (sender, pending) = PendingReplication::channel(self.group);
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    let outcome = dispatcher
                        .submit(command)
                        .await
                        .map(|_| ())
                        .map_err(|err| err.to_string());
                    let _ = sender.send(Some(outcome));
                });
                return Ok(Some(pending));
            }

            let dispatcher = self.dispatcher.clone();
            (tokio::spawn(async move { dispatcher.submit(command).await }), stamped)
        };

        let (handle, stamped) = full_submission;
        handle
            .await
            .map_err(|err| {
                ReplicaError::replication(
                    self.group,
                    anyhow::anyhow!("replication task failed: {err}"),
                )
            })??;

        // Late duplicates from the replication flow must not overwrite a
        // newer pre-applied entry.
        let _st = self.safe_time_lock.lock().await;
        if stamped > self.safe_time.current() {
            self.update_handler.handle_update(
                tx_id,
                update.row_id,
                commit_group,
                update.row.as_ref(),
                false,
                Some(stamped),
                update.last_commit_timestamp,
            );
            self.safe_time.advance(stamped);
        }
        Ok(None)
    }

    async fn apply_update_all_command(
        &self,
        tx_id: TxId,
        commit_group: ReplicationGroupId,
        updates: Vec<RowUpdate>,
        full: bool,
        skip_delayed_ack: bool,
        coordinator_id: &str,
        catalog_version: u32,
    ) -> Result<Option<PendingReplication>> {
        enum Submission {
            Delayed(PendingReplication),
            Full(
                tokio::task::JoinHandle<Result<Option<TransactionResult>>>,
                HybridTimestamp,
            ),
        }

        let submission = {
            let _lin = self.linearize.lock().await;
            let command = ReplicaCommand::UpdateAll {
                safe_time: self.clock.now(),
                required_catalog_version: catalog_version,
                tx_id,
                commit_group,
                updates: updates.clone(),
                full,
                coordinator_id: coordinator_id.to_string(),
            };
            let stamped = command.safe_time();

            if !full {
                {
                    let _st = self.safe_time_lock.lock().await;
                    self.update_handler
                        .handle_update_all(tx_id, commit_group, &updates, true, None);
                    self.safe_time.advance(stamped);
                }

                let (sender, pending) = PendingReplication::channel(self.group);
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    let outcome = dispatcher
                        .submit(command)
                        .await
                        .map(|_| ())
                        .map_err(|err| err.to_string());
                    let _ = sender.send(Some(outcome));
                });
                Submission::Delayed(pending)
            } else {
                let dispatcher = self.dispatcher.clone();
                Submission::Full(
                    tokio::spawn(async move { dispatcher.submit(command).await }),
                    stamped,
                )
            }
        };

        let (handle, stamped) = match submission {
            Submission::Delayed(pending) => {
                if skip_delayed_ack {
                    pending.wait().await?;
                    return Ok(None);
                }
                return Ok(Some(pending));
            }
            Submission::Full(handle, stamped) => (handle, stamped),
        };
        handle
            .await
            .map_err(|err| {
                ReplicaError::replication(
                    self.group,
                    anyhow::anyhow!("replication task failed: {err}"),
                )
            })??;

        let _st = self.safe_time_lock.lock().await;
        if stamped > self.safe_time.current() {
            self.update_handler
                .handle_update_all(tx_id, commit_group, &updates, false, Some(stamped));
            self.safe_time.advance(stamped);
        }
        Ok(None)
    }
}

// ----------------------------------------------------------------------
// Finish, write-intent switch, recovery
// ----------------------------------------------------------------------

impl PartitionReplica {
    /// Finish a transaction on its commit partition. A commit first runs
    /// forward schema validation for every enlisted table; on failure the
    /// transaction is finalized as aborted and the schema error surfaces
    /// after finalization.
    async fn process_tx_finish(&self, req: TxFinishRequest) -> Result<TransactionResult> {
        let tx_id = req.tx_id;

        if req.commit {
            let commit_ts = req.commit_timestamp.ok_or_else(|| {
                ReplicaError::replication(
                    self.group,
                    anyhow::anyhow!("commit finish without a commit timestamp"),
                )
            })?;

            let tables: BTreeSet<crate::types::TableId> = req
                .enlisted_groups
                .iter()
                .map(|group| group.table_id)
                .collect();
            let validation = self
                .schema
                .validate_commit(tx_id.begin_timestamp(), tables, commit_ts, self.group)
                .await?;
            let commit_allowed = validation == CommitValidation::Ok;

            let result = self
                .finish_and_cleanup(
                    &req.enlisted_groups,
                    commit_allowed,
                    commit_allowed.then_some(commit_ts),
                    tx_id,
                )
                .await?;

            return match validation {
                CommitValidation::Ok => Ok(result),
                CommitValidation::TableDropped { table_id } => {
                    Err(ReplicaError::IncompatibleSchemaAbort {
                        table_id,
                        reason: "table was dropped before the transaction committed".to_string(),
                    })
                }
                CommitValidation::Incompatible { table_id, from, to } => {
                    Err(ReplicaError::IncompatibleSchemaAbort {
                        table_id,
                        reason: format!(
                            "schema {from} is not forward-compatible with schema {to}"
                        ),
                    })
                }
            };
        }

        self.finish_and_cleanup(&req.enlisted_groups, false, None, tx_id)
            .await
    }

    async fn finish_and_cleanup(
        &self,
        enlisted: &[ReplicationGroupId],
        commit: bool,
        commit_ts: Option<HybridTimestamp>,
        tx_id: TxId,
    ) -> Result<TransactionResult> {
        // The durable state is written only by finish commands, so it is
        // either absent or final.
        let stored = self
            .tx_state_storage
            .get(tx_id)
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        if let Some(meta) = stored {
            if meta.state.is_final() {
                let stored_result = TransactionResult {
                    state: meta.state,
                    commit_timestamp: meta.commit_timestamp,
                };

                // Fully cleaned up already: report the stored outcome, even
                // when the caller proposed a different one.
                if meta.locks_released {
                    return Ok(stored_result);
                }

                // A finish retry may repeat the stored outcome; server-side
                // recovery may turn a commit retry into an observed abort,
                // and a delayed coordinator commit may land after recovery
                // aborted. Changing the outcome is refused.
                if commit != (meta.state == TxState::Committed) {
                    warn!(
                        group = %self.group,
                        %tx_id,
                        proposed_commit = commit,
                        stored_state = ?meta.state,
                        "refusing to finish an already-finished transaction with a different outcome"
                    );
                    return Err(ReplicaError::TransactionAlreadyFinished {
                        tx_id,
                        result: stored_result,
                    });
                }
            }
        }

        let result = self
            .finish_transaction(enlisted, tx_id, commit, commit_ts)
            .await?;

        self.tx_manager
            .cleanup(enlisted, commit, commit_ts, tx_id)
            .await
            .map_err(|err| ReplicaError::replication(self.group, err))?;
        self.mark_locks_released(tx_id);

        Ok(result)
    }

    /// Submit the finish command and record the outcome in volatile state.
    /// Idempotent: a repeated submission observes the already-stored
    /// result.
    async fn finish_transaction(
        &self,
        enlisted: &[ReplicationGroupId],
        tx_id: TxId,
        commit: bool,
        commit_ts: Option<HybridTimestamp>,
    ) -> Result<TransactionResult> {
        debug_assert!(!commit || commit_ts.is_some());

        let ts_for_catalog = commit_ts.unwrap_or_else(|| self.clock.now());
        let catalog_version = self
            .schema
            .reliable_catalog_version(ts_for_catalog, self.group)
            .await?;

        let submission = {
            let _lin = self.linearize.lock().await;
            let command = ReplicaCommand::FinishTx {
                safe_time: self.clock.now(),
                required_catalog_version: catalog_version,
                tx_id,
                commit,
                commit_timestamp: commit_ts,
                enlisted_groups: enlisted.to_vec(),
                coordinator_id: self
                    .tx_states
                    .get(tx_id)
                    .and_then(|meta| meta.coordinator_id),
            };
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move { dispatcher.submit(command).await })
        };

        let outcome = submission.await.map_err(|err| {
            ReplicaError::replication(
                self.group,
                anyhow::anyhow!("finish replication task failed: {err}"),
            )
        })?;

        match outcome {
            Ok(Some(result)) => {
                self.tx_states
                    .mark_finished(tx_id, result.state, result.commit_timestamp);
                Ok(result)
            }
            Ok(None) => Err(ReplicaError::replication(
                self.group,
                anyhow::anyhow!("finish command completed without a transaction result"),
            )),
            // A concurrent recovery already wrote a different outcome; the
            // local apply rejected ours and reported the stored result.
            Err(ReplicaError::TransactionAlreadyFinished { tx_id, result }) => {
                self.tx_states
                    .mark_finished(tx_id, result.state, result.commit_timestamp);
                Err(ReplicaError::TransactionAlreadyFinished { tx_id, result })
            }
            Err(err) => Err(err),
        }
    }

    /// Flip the durable locks-released flag, best-effort: replication
    /// failures are logged, the durable cleanup sweep retries later.
    fn mark_locks_released(&self, tx_id: TxId) {
        let schema = self.schema.clone();
        let clock = self.clock.clone();
        let dispatcher = self.dispatcher.clone();
        let group = self.group;

        tokio::spawn(async move {
            let catalog_version = match schema.reliable_catalog_version(clock.now(), group).await {
                Ok(version) => version,
                Err(err) => {
                    warn!(%group, %tx_id, error = %err, "cannot resolve catalog version for lock-release marker");
                    return;
                }
            };
            let command = ReplicaCommand::MarkLocksReleased {
                safe_time: clock.now(),
                required_catalog_version: catalog_version,
                tx_id,
            };
            if let Err(err) = dispatcher.submit(command).await {
                warn!(%group, %tx_id, error = %err, "failed to mark transaction locks released");
            }
        });
    }

    /// Write-intent switch on an enlisted partition: close the
    /// transaction's cursors, finalize volatile state, drain its in-flight
    /// operations, then switch intents locally while replicating the same
    /// switch to the group.
    async fn process_write_intent_switch(&self, req: WriteIntentSwitchRequest) -> Result<()> {
        let tx_id = req.tx_id;

        // A cursor that cannot be closed fails the whole switch before any
        // state is touched; the cleanup is retried by the caller.
        self.cursors
            .close_tx(tx_id)
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        let state = if req.commit {
            TxState::Committed
        } else {
            TxState::Aborted
        };
        self.tx_states
            .mark_finished(tx_id, state, req.commit_timestamp);

        let had_updates = self.await_cleanup_ready_ops(tx_id, req.commit).await;

        if had_updates {
            let command_ts = self.clock.now();
            let catalog_version = self
                .schema
                .reliable_catalog_version(command_ts, self.group)
                .await?;

            // Local switch runs in parallel with replication; the command
            // is what switches the other replicas.
            self.update_handler
                .switch_write_intents(tx_id, req.commit, req.commit_timestamp);

            let command = ReplicaCommand::WriteIntentSwitch {
                safe_time: self.clock.now(),
                required_catalog_version: catalog_version,
                tx_id,
                commit: req.commit,
                commit_timestamp: req.commit_timestamp,
            };
            let dispatcher = self.dispatcher.clone();
            let group = self.group;
            tokio::spawn(async move {
                if let Err(err) = dispatcher.submit(command).await {
                    warn!(%group, %tx_id, error = %err, "write-intent switch replication failed");
                }
            });
        }

        self.release_tx_locks(tx_id);
        self.ops.remove(tx_id);
        Ok(())
    }

    /// Drain the transaction's pending operation futures. Read failures
    /// never block a commit; update failures must not happen on commit.
    async fn await_cleanup_ready_ops(&self, tx_id: TxId, commit: bool) -> bool {
        let (reads, updates) = self.ops.drain(tx_id);
        let had_updates = !updates.is_empty();

        let mut update_futures: FuturesUnordered<_> = updates.into_iter().collect();
        while let Some(outcome) = update_futures.next().await {
            let failed = !matches!(outcome, Ok(Ok(())));
            if failed && commit {
                debug_assert!(false, "update operation failed under a committing transaction");
                warn!(
                    group = %self.group,
                    %tx_id,
                    "update operation failed while the transaction is committing"
                );
            }
        }

        let mut read_futures: FuturesUnordered<_> = reads.into_iter().collect();
        while read_futures.next().await.is_some() {}

        had_updates
    }

    // ------------------------------------------------------------------
    // Orphan recovery and commit-partition state resolution
    // ------------------------------------------------------------------

    async fn process_tx_recovery(
        &self,
        req: &TxRecoveryRequest,
        sender_id: &str,
    ) -> Result<ReplicaResponse> {
        let tx_id = req.tx_id;

        let durable = self
            .tx_state_storage
            .get(tx_id)
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        if let Some(meta) = durable {
            if meta.state.is_final() {
                self.recover_finished_tx(tx_id, &meta).await;
                // The sender could not resolve the state on its own; give
                // it a cleanup hint for the transaction we know finished.
                self.run_cleanup_on_node(tx_id, sender_id).await;
                return Ok(ReplicaResponse::None);
            }
        }

        info!(group = %self.group, %tx_id, "aborting orphan transaction");
        self.trigger_tx_recovery(tx_id, sender_id).await;
        Ok(ReplicaResponse::None)
    }

    async fn recover_finished_tx(&self, tx_id: TxId, meta: &TxMeta) {
        if meta.locks_released || meta.enlisted_groups.is_empty() {
            return;
        }
        self.durable_cleanup(tx_id, meta.clone()).await;
    }

    async fn run_cleanup_on_node(&self, tx_id: TxId, node_id: &str) {
        let Some(name) = self.cluster.consistent_name(node_id) else {
            return;
        };
        if let Err(err) = self.tx_manager.cleanup_on_node(&name, tx_id).await {
            warn!(
                group = %self.group,
                %tx_id,
                node = %name,
                error = %err,
                "cleanup hint delivery failed"
            );
        }
    }

    /// Roll back an abandoned transaction through the regular finish path
    /// (the term is irrelevant for a rollback), then hint the sender.
    async fn trigger_tx_recovery(&self, tx_id: TxId, sender_id: &str) {
        if let Err(err) = self.tx_manager.finish(self.group, false, tx_id).await {
            warn!(
                group = %self.group,
                %tx_id,
                error = %err,
                "orphan transaction rollback failed"
            );
        }
        self.run_cleanup_on_node(tx_id, sender_id).await;
    }

    /// Authoritative transaction state, answered by the commit partition
    /// primary. A `FINISHING` transaction is awaited to its final state; a
    /// transaction with no final state anywhere and no live coordinator is
    /// recovered (aborted) before answering.
    async fn process_tx_state_request(&self, req: TxStateRequest) -> Result<Option<TxStateMeta>> {
        let now = self.clock.now();
        let lease = self.current_lease(now).await?;
        let is_local_primary = lease
            .as_ref()
            .is_some_and(|lease| lease.leaseholder == self.local_node_name);
        if !is_local_primary {
            return Err(ReplicaError::PrimaryReplicaMiss {
                local_node: self.local_node_name.clone(),
                leaseholder: lease.map(|lease| lease.leaseholder),
                expected_token: None,
                actual_token: None,
            });
        }

        let tx_id = req.tx_id;
        match self.tx_states.get(tx_id) {
            Some(meta) if meta.state == TxState::Finishing => {
                Ok(self.tx_states.wait_final(tx_id).await)
            }
            Some(meta) if meta.state.is_final() => Ok(Some(meta)),
            volatile => self.resolve_state_or_recover(tx_id, volatile).await,
        }
    }

    async fn resolve_state_or_recover(
        &self,
        tx_id: TxId,
        volatile: Option<TxStateMeta>,
    ) -> Result<Option<TxStateMeta>> {
        let durable = self
            .tx_state_storage
            .get(tx_id)
            .map_err(|err| ReplicaError::replication(self.group, err))?;

        match durable {
            Some(meta) => {
                debug_assert!(meta.state.is_final());
                Ok(Some(TxStateMeta {
                    state: meta.state,
                    coordinator_id: volatile.and_then(|meta| meta.coordinator_id),
                    commit_group: Some(self.group),
                    commit_timestamp: meta.commit_timestamp,
                }))
            }
            None => {
                // Pending with a live coordinator: the finish request is
                // still expected, report the pending state.
                let coordinator_alive = volatile
                    .as_ref()
                    .filter(|meta| meta.state == TxState::Pending)
                    .and_then(|meta| meta.coordinator_id.as_deref())
                    .is_some_and(|id| self.cluster.consistent_name(id).is_some());

                if coordinator_alive {
                    return Ok(volatile);
                }

                // No durable outcome and nobody left to produce one: the
                // transaction cannot commit, roll it back.
                let local_id = self.local_node_id.clone();
                self.trigger_tx_recovery(tx_id, &local_id).await;
                Ok(self.tx_states.get(tx_id))
            }
        }
    }

    /// Commit-partition-driven cleanup retry loop: fan out cleanup to the
    /// enlisted partitions until it succeeds, then flip the durable
    /// locks-released flag. Gives up silently while the replica stops.
    async fn durable_cleanup(&self, tx_id: TxId, meta: TxMeta) {
        debug_assert!(meta.state.is_final());
        let commit = meta.state == TxState::Committed;
        let mut backoff = DURABLE_CLEANUP_RETRY_BACKOFF;

        loop {
            match self
                .tx_manager
                .cleanup(&meta.enlisted_groups, commit, meta.commit_timestamp, tx_id)
                .await
            {
                Ok(()) => {
                    self.mark_locks_released(tx_id);
                    return;
                }
                Err(err) => {
                    if self.busy.is_blocked() {
                        return;
                    }
                    warn!(
                        group = %self.group,
                        %tx_id,
                        error = %err,
                        retry_in_ms = backoff.as_millis(),
                        "durable cleanup failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(DURABLE_CLEANUP_RETRY_BACKOFF_MAX);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Primary lease events
    // ------------------------------------------------------------------

    /// On election of this replica as primary, sweep the durable state for
    /// finalized transactions whose locks were never released and schedule
    /// their cleanup. The event completes immediately; cleanups run in the
    /// background.
    pub fn on_primary_elected(replica: &Arc<Self>, evt: &PrimaryReplicaEvent) {
        debug_assert_eq!(evt.group, replica.group);
        if evt.leaseholder != replica.local_node_name {
            return;
        }

        let transactions = match replica.tx_state_storage.scan() {
            Ok(transactions) => transactions,
            Err(err) => {
                warn!(
                    group = %replica.group,
                    error = %err,
                    "cannot scan transaction state storage on primary election"
                );
                return;
            }
        };

        for (tx_id, meta) in transactions {
            debug_assert!(!meta.enlisted_groups.is_empty());
            if meta.state.is_final() && !meta.locks_released {
                info!(
                    group = %replica.group,
                    %tx_id,
                    state = ?meta.state,
                    "scheduling durable cleanup on primary election"
                );
                let replica = replica.clone();
                tokio::spawn(async move {
                    replica.durable_cleanup(tx_id, meta).await;
                });
            }
        }
    }

    /// On expiration of this replica's primary lease, wait out the pending
    /// operations of every open transaction and release their locks.
    pub fn on_primary_expired(replica: &Arc<Self>, evt: &PrimaryReplicaEvent) {
        debug_assert_eq!(evt.group, replica.group);
        if evt.leaseholder != replica.local_node_name {
            return;
        }

        info!(group = %replica.group, "primary replica expired");

        for (tx_id, futures) in replica.ops.drain_all() {
            if futures.is_empty() {
                continue;
            }
            let replica = replica.clone();
            tokio::spawn(async move {
                let mut pending: FuturesUnordered<_> = futures.into_iter().collect();
                while pending.next().await.is_some() {}
                replica.release_tx_locks(tx_id);
            });
        }
    }
}
