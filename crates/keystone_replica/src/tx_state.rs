//! Volatile transaction state and state resolution.
//!
//! Every replica keeps a process-wide map of volatile transaction meta,
//! created on first enlistment and discarded after finish + cleanup. The
//! map supports closure-style compare-and-swap updates and lets waiters
//! park until a transaction reaches a final state, which is how
//! `TX_STATE_COMMIT_PARTITION` requests ride out a concurrent finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use keystone_hlc::HybridTimestamp;

use crate::capabilities::TxStatePartitionClient;
use crate::types::{ReplicationGroupId, TxId, TxState, TxStateMeta};

/// Process-wide volatile transaction state, keyed by transaction id.
#[derive(Debug)]
pub struct TxStateMap {
    inner: Mutex<HashMap<TxId, TxStateMeta>>,
    /// Bumped on every mutation; final-state waiters key off it.
    version: watch::Sender<u64>,
}

impl Default for TxStateMap {
    fn default() -> Self {
        let (version, _rx) = watch::channel(0);
        Self {
            inner: Mutex::new(HashMap::new()),
            version,
        }
    }
}

impl TxStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tx_id: TxId) -> Option<TxStateMeta> {
        self.inner.lock().expect("tx state map poisoned").get(&tx_id).cloned()
    }

    /// Apply a closure to the current entry. Returning `None` removes the
    /// entry; anything else replaces it. The updated value is returned.
    pub fn update(
        &self,
        tx_id: TxId,
        f: impl FnOnce(Option<TxStateMeta>) -> Option<TxStateMeta>,
    ) -> Option<TxStateMeta> {
        let updated = {
            let mut guard = self.inner.lock().expect("tx state map poisoned");
            let old = guard.get(&tx_id).cloned();
            match f(old) {
                Some(meta) => {
                    guard.insert(tx_id, meta.clone());
                    Some(meta)
                }
                None => {
                    guard.remove(&tx_id);
                    None
                }
            }
        };
        self.version.send_modify(|v| *v += 1);
        updated
    }

    /// Mark an already-enlisted transaction as finished. Entries that were
    /// never enlisted here stay absent.
    pub fn mark_finished(
        &self,
        tx_id: TxId,
        state: TxState,
        commit_timestamp: Option<HybridTimestamp>,
    ) {
        debug_assert!(state.is_final());
        self.update(tx_id, |old| old.map(|meta| meta.finished(state, commit_timestamp)));
    }

    /// Wait until the transaction's entry reaches a final state and return
    /// it. Returns immediately when the entry is already final or absent.
    pub async fn wait_final(&self, tx_id: TxId) -> Option<TxStateMeta> {
        let mut rx = self.version.subscribe();
        loop {
            match self.get(tx_id) {
                Some(meta) if !meta.state.is_final() => {}
                other => return other,
            }
            if rx.changed().await.is_err() {
                return self.get(tx_id);
            }
        }
    }
}

/// Resolves the state of a transaction encountered through one of its write
/// intents: volatile meta first, then the commit partition primary, which
/// may itself trigger recovery before answering. Final outcomes are cached
/// back into the volatile map.
pub struct TransactionStateResolver {
    states: Arc<TxStateMap>,
    commit_client: Arc<dyn TxStatePartitionClient>,
}

impl TransactionStateResolver {
    pub fn new(states: Arc<TxStateMap>, commit_client: Arc<dyn TxStatePartitionClient>) -> Self {
        Self {
            states,
            commit_client,
        }
    }

    pub async fn resolve_tx_state(
        &self,
        tx_id: TxId,
        commit_group: ReplicationGroupId,
    ) -> anyhow::Result<TxStateMeta> {
        if let Some(meta) = self.states.get(tx_id) {
            if meta.state.is_final() {
                return Ok(meta);
            }
        }

        let resolved = self
            .commit_client
            .resolve_tx_state(commit_group, tx_id)
            .await?;

        if resolved.state.is_final() {
            let cached = resolved.clone();
            self.states.update(tx_id, move |old| match old {
                Some(meta) => Some(meta.finished(cached.state, cached.commit_timestamp)),
                None => Some(cached),
            });
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    fn tx(n: u64) -> TxId {
        TxId::new(HybridTimestamp::new(100, 0), n)
    }

    fn group() -> ReplicationGroupId {
        ReplicationGroupId::new(1, 0)
    }

    #[test]
    fn update_inserts_and_removes() {
        let map = TxStateMap::new();
        let id = tx(1);

        map.update(id, |_| Some(TxStateMeta::pending("n1".into(), group())));
        assert_eq!(map.get(id).unwrap().state, TxState::Pending);

        map.update(id, |_| None);
        assert!(map.get(id).is_none());
    }

    #[test]
    fn mark_finished_ignores_unknown_transactions() {
        let map = TxStateMap::new();
        map.mark_finished(tx(2), TxState::Aborted, None);
        assert!(map.get(tx(2)).is_none());
    }

    #[tokio::test]
    async fn wait_final_parks_through_finishing() {
        let map = Arc::new(TxStateMap::new());
        let id = tx(3);
        map.update(id, |_| Some(TxStateMeta::pending("n1".into(), group())));
        map.update(id, |old| {
            old.map(|mut meta| {
                meta.state = TxState::Finishing;
                meta
            })
        });

        let waiter = {
            let map = map.clone();
            tokio::spawn(async move { map.wait_final(id).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let commit_ts = HybridTimestamp::new(200, 0);
        map.mark_finished(id, TxState::Committed, Some(commit_ts));

        let meta = waiter.await.unwrap().unwrap();
        assert_eq!(meta.state, TxState::Committed);
        assert_eq!(meta.commit_timestamp, Some(commit_ts));
    }

    struct ScriptedClient {
        meta: TxStateMeta,
    }

    #[async_trait]
    impl TxStatePartitionClient for ScriptedClient {
        async fn resolve_tx_state(
            &self,
            _commit_group: ReplicationGroupId,
            _tx_id: TxId,
        ) -> anyhow::Result<TxStateMeta> {
            Ok(self.meta.clone())
        }
    }

    #[tokio::test]
    async fn resolver_prefers_final_volatile_state() {
        let map = Arc::new(TxStateMap::new());
        let id = tx(4);
        map.update(id, |_| Some(TxStateMeta::pending("n1".into(), group())));
        map.mark_finished(id, TxState::Aborted, None);

        let client = Arc::new(ScriptedClient {
            meta: TxStateMeta {
                state: TxState::Committed,
                coordinator_id: None,
                commit_group: Some(group()),
                commit_timestamp: Some(HybridTimestamp::new(1, 0)),
            },
        });
        let resolver = TransactionStateResolver::new(map, client);

        // The commit-partition answer must not override a locally final state.
        let meta = resolver.resolve_tx_state(id, group()).await.unwrap();
        assert_eq!(meta.state, TxState::Aborted);
    }

    #[tokio::test]
    async fn resolver_caches_remote_outcome() {
        let map = Arc::new(TxStateMap::new());
        let id = tx(5);
        let commit_ts = HybridTimestamp::new(300, 0);

        let client = Arc::new(ScriptedClient {
            meta: TxStateMeta {
                state: TxState::Committed,
                coordinator_id: Some("n2".into()),
                commit_group: Some(group()),
                commit_timestamp: Some(commit_ts),
            },
        });
        let resolver = TransactionStateResolver::new(map.clone(), client);

        let meta = resolver.resolve_tx_state(id, group()).await.unwrap();
        assert_eq!(meta.state, TxState::Committed);
        assert_eq!(map.get(id).unwrap().commit_timestamp, Some(commit_ts));
    }
}
