//! Typed lock keys and 2PL lock modes.
//!
//! The lock manager itself is an injected collaborator; this module defines
//! the vocabulary the coordinator speaks to it: hierarchical keys (table,
//! row, index, index key) and the standard intention/shared/exclusive mode
//! lattice.

use bytes::Bytes;

use crate::types::{IndexId, RowId, TableId};

/// What a lock protects.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Table(TableId),
    Row(TableId, RowId),
    Index(IndexId),
    IndexKey(IndexId, Bytes),
}

/// Standard 2PL lock modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Intention shared.
    IS,
    /// Intention exclusive.
    IX,
    /// Shared.
    S,
    /// Exclusive.
    X,
}

impl LockMode {
    /// Mode compatibility: `IS`-`IX` compatible, `S`-`IX` incompatible,
    /// `X` incompatible with everything.
    pub fn compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IS, X) | (X, IS) => false,
            (IS, _) | (_, IS) => true,
            (IX, IX) => true,
            (S, S) => true,
            _ => false,
        }
    }

    /// The weakest mode covering both, for reentrant upgrades.
    pub fn supremum(self, other: LockMode) -> LockMode {
        use LockMode::*;
        match (self, other) {
            (X, _) | (_, X) => X,
            (S, IX) | (IX, S) => X,
            (S, _) | (_, S) => S,
            (IX, _) | (_, IX) => IX,
            (IS, IS) => IS,
        }
    }
}

/// A granted lock, identified by owner, key and mode. Short-term index
/// locks are carried around as values and released once the local apply
/// finishes; long-term locks are released by `release_all` at finish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lock {
    pub tx_id: crate::types::TxId,
    pub key: LockKey,
    pub mode: LockMode,
}
