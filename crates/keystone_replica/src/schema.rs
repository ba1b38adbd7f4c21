//! Schema compatibility validation against the catalog at a timestamp.
//!
//! All checks are positioned in time: the validator first awaits metadata
//! completeness for the timestamp in question, then consults the catalog.
//! Forward compatibility gates commits, backward compatibility gates reads
//! of rows written under older schema versions.

use std::sync::Arc;

use keystone_hlc::HybridTimestamp;

use crate::capabilities::{CatalogService, SchemaSyncService};
use crate::error::{ReplicaError, Result};
use crate::types::{SchemaVersion, TableId};

/// Outcome of forward validation at commit time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitValidation {
    Ok,
    /// The table disappeared between transaction begin and commit.
    TableDropped { table_id: TableId },
    /// The schema at commit time is not forward-compatible with the schema
    /// the transaction started under.
    Incompatible {
        table_id: TableId,
        from: SchemaVersion,
        to: SchemaVersion,
    },
}

#[derive(Clone)]
pub struct SchemaCompatValidator {
    table_id: TableId,
    catalog: Arc<dyn CatalogService>,
    schema_sync: Arc<dyn SchemaSyncService>,
}

impl SchemaCompatValidator {
    pub fn new(
        table_id: TableId,
        catalog: Arc<dyn CatalogService>,
        schema_sync: Arc<dyn SchemaSyncService>,
    ) -> Self {
        Self {
            table_id,
            catalog,
            schema_sync,
        }
    }

    /// Await local metadata completeness for `ts`.
    pub async fn wait_for(&self, ts: HybridTimestamp, group: crate::types::ReplicationGroupId) -> Result<()> {
        self.schema_sync
            .wait_for_metadata_completeness(ts)
            .await
            .map_err(|err| ReplicaError::replication(group, err))
    }

    /// The table this validator is bound to must exist at `ts`.
    pub async fn fail_if_table_does_not_exist_at(
        &self,
        ts: HybridTimestamp,
        group: crate::types::ReplicationGroupId,
    ) -> Result<()> {
        self.wait_for(ts, group).await?;
        if self.catalog.table_exists_at(self.table_id, ts) {
            Ok(())
        } else {
            Err(ReplicaError::TableNotFound {
                table_id: self.table_id,
                ts,
            })
        }
    }

    /// The request's declared schema version must equal the table schema at
    /// the transaction's reference timestamp.
    pub async fn fail_if_request_schema_differs(
        &self,
        ts: HybridTimestamp,
        requested: SchemaVersion,
        group: crate::types::ReplicationGroupId,
    ) -> Result<()> {
        self.wait_for(ts, group).await?;
        let actual = self.schema_at(ts)?;
        if requested == actual {
            Ok(())
        } else {
            Err(ReplicaError::IncompatibleSchema {
                table_id: self.table_id,
                requested,
                actual,
            })
        }
    }

    /// Fails when the table schema changed between the transaction's begin
    /// timestamp and `operation_ts`. Callers must have awaited metadata
    /// completeness for `operation_ts`.
    pub fn fail_if_schema_changed_since_tx_start(
        &self,
        tx_begin: HybridTimestamp,
        operation_ts: HybridTimestamp,
    ) -> Result<()> {
        let at_begin = self.schema_at(tx_begin)?;
        let now = self.schema_at(operation_ts)?;
        if at_begin == now {
            Ok(())
        } else {
            Err(ReplicaError::IncompatibleSchema {
                table_id: self.table_id,
                requested: at_begin,
                actual: now,
            })
        }
    }

    /// A row written under `row_version` is readable by a transaction that
    /// began at `tx_begin` iff the versions match or are backward
    /// compatible.
    pub fn validate_backwards(
        &self,
        row_version: SchemaVersion,
        tx_begin: HybridTimestamp,
    ) -> Result<()> {
        let tx_version = self.schema_at(tx_begin)?;
        if row_version == tx_version
            || self
                .catalog
                .backward_compatible(self.table_id, row_version, tx_version)
        {
            Ok(())
        } else {
            Err(ReplicaError::IncompatibleSchema {
                table_id: self.table_id,
                requested: row_version,
                actual: tx_version,
            })
        }
    }

    /// Forward validation at commit for every enlisted table. Fail-closed:
    /// a dropped table or missing schema means the commit must not happen.
    pub async fn validate_commit(
        &self,
        tx_begin: HybridTimestamp,
        tables: impl IntoIterator<Item = TableId>,
        commit_ts: HybridTimestamp,
        group: crate::types::ReplicationGroupId,
    ) -> Result<CommitValidation> {
        self.wait_for(commit_ts, group).await?;

        for table_id in tables {
            if !self.catalog.table_exists_at(table_id, commit_ts) {
                return Ok(CommitValidation::TableDropped { table_id });
            }

            let (from, to) = match (
                self.catalog.table_schema_at(table_id, tx_begin),
                self.catalog.table_schema_at(table_id, commit_ts),
            ) {
                (Some(from), Some(to)) => (from, to),
                _ => return Ok(CommitValidation::TableDropped { table_id }),
            };

            if from != to && !self.catalog.forward_compatible(table_id, from, to) {
                return Ok(CommitValidation::Incompatible { table_id, from, to });
            }
        }

        Ok(CommitValidation::Ok)
    }

    /// Catalog version that is reliably known locally at `ts`.
    pub async fn reliable_catalog_version(
        &self,
        ts: HybridTimestamp,
        group: crate::types::ReplicationGroupId,
    ) -> Result<u32> {
        self.wait_for(ts, group).await?;
        Ok(self.catalog.active_catalog_version(ts))
    }

    fn schema_at(&self, ts: HybridTimestamp) -> Result<SchemaVersion> {
        self.catalog
            .table_schema_at(self.table_id, ts)
            .ok_or(ReplicaError::TableNotFound {
                table_id: self.table_id,
                ts,
            })
    }
}
