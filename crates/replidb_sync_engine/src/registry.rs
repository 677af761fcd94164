//! Subscription bookkeeping.
//!
//! Two independent maps are kept, each behind its own lock:
//! - local sponsor: queries this node asked peers to notify it about
//! - remote subscribed: queries peers asked this node to notify them about
//!
//! Each map tracks `peer -> query id -> status` plus a total map
//! `query id -> (fingerprint, reference count)`. The reference count equals
//! the number of peers holding the query in either status, and the total
//! entry disappears exactly when the count reaches zero.
//!
//! Per (peer, query) the lifecycle is:
//! `reserve` (NotActive) -> `activate` (Active) on acknowledgement,
//! `delete` undoes a NotActive reservation, `remove` drops either status.

use crate::config::RegistryLimits;
use crate::error::{SyncError, SyncResult};
use crate::transport::mask_peer;
use parking_lot::RwLock;
use replidb_sync_protocol::QueryFingerprint;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Status of a (peer, query) subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscribeStatus {
    /// Reserved, waiting for acknowledgement.
    NotActive,
    /// Acknowledged.
    Active,
}

#[derive(Debug, Default)]
struct SubscriptionMap {
    peers: BTreeMap<String, BTreeMap<String, SubscribeStatus>>,
    total: BTreeMap<String, (QueryFingerprint, usize)>,
}

impl SubscriptionMap {
    fn reserve(
        &mut self,
        limits: &RegistryLimits,
        peer: &str,
        query: &QueryFingerprint,
    ) -> SyncResult<()> {
        let query_id = query.identify();
        if query_id.is_empty() {
            return Err(SyncError::invalid_args("query has no identity"));
        }
        let known_query = self.total.contains_key(&query_id);
        if !known_query && self.total.len() >= limits.per_db {
            return Err(SyncError::MaxLimitsExceeded(format!(
                "more than {} queries per database",
                limits.per_db
            )));
        }
        let peer_queries = self.peers.get(peer);
        if peer_queries.is_none() && self.peers.len() >= limits.max_peers {
            return Err(SyncError::MaxLimitsExceeded(format!(
                "more than {} peers",
                limits.max_peers
            )));
        }
        if let Some(queries) = peer_queries {
            match queries.get(&query_id) {
                None if queries.len() >= limits.per_peer => {
                    return Err(SyncError::MaxLimitsExceeded(format!(
                        "more than {} queries per peer",
                        limits.per_peer
                    )));
                }
                Some(SubscribeStatus::Active) => {
                    debug!(peer = %mask_peer(peer), "query already active");
                    return Ok(());
                }
                _ => {}
            }
        }

        let queries = self.peers.entry(peer.to_string()).or_default();
        let inserted = if queries.contains_key(&query_id) {
            false
        } else {
            queries.insert(query_id.clone(), SubscribeStatus::NotActive);
            true
        };
        if let Some((_, count)) = self.total.get_mut(&query_id) {
            if inserted {
                *count += 1;
            }
        } else {
            self.total.insert(query_id, (query.clone(), 1));
        }
        Ok(())
    }

    fn activate(&mut self, peer: &str, query_id: &str) -> SyncResult<()> {
        if !self.total.contains_key(query_id) {
            return Err(SyncError::internal(format!("query {query_id} not reserved")));
        }
        let status = self
            .peers
            .get_mut(peer)
            .ok_or_else(|| SyncError::internal(format!("peer {} not reserved", mask_peer(peer))))?
            .get_mut(query_id)
            .ok_or_else(|| SyncError::internal(format!("query {query_id} not reserved for peer")))?;
        *status = SubscribeStatus::Active;
        Ok(())
    }

    fn delete(&mut self, peer: &str, query_id: &str) {
        let Some(queries) = self.peers.get_mut(peer) else {
            return;
        };
        match queries.get(query_id) {
            None => return,
            Some(SubscribeStatus::Active) => {
                warn!(peer = %mask_peer(peer), query_id, "active subscription is not deleted");
                return;
            }
            Some(SubscribeStatus::NotActive) => {}
        }
        queries.remove(query_id);
        self.release(peer, query_id);
    }

    fn remove(&mut self, peer: &str, query_id: &str) {
        let Some(queries) = self.peers.get_mut(peer) else {
            return;
        };
        if queries.remove(query_id).is_none() {
            return;
        }
        self.release(peer, query_id);
    }

    fn release(&mut self, peer: &str, query_id: &str) {
        if self.peers.get(peer).is_some_and(BTreeMap::is_empty) {
            self.peers.remove(peer);
        }
        self.decrement(query_id);
    }

    fn decrement(&mut self, query_id: &str) {
        if let Some((_, count)) = self.total.get_mut(query_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.total.remove(query_id);
            }
        }
    }

    fn clear_peer(&mut self, peer: &str) {
        let Some(queries) = self.peers.remove(peer) else {
            return;
        };
        for query_id in queries.keys() {
            self.decrement(query_id);
        }
    }

    fn queries(&self, peer: &str) -> Vec<QueryFingerprint> {
        self.peers
            .get(peer)
            .map(|queries| {
                queries
                    .keys()
                    .filter_map(|id| self.total.get(id).map(|(query, _)| query.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn query_ids(&self, peer: &str) -> Vec<String> {
        self.peers
            .get(peer)
            .map(|queries| {
                queries
                    .keys()
                    .filter(|id| self.total.contains_key(*id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn status(&self, peer: &str, query_id: &str) -> Option<SubscribeStatus> {
        self.peers.get(peer)?.get(query_id).copied()
    }

    fn reference_count(&self, query_id: &str) -> Option<usize> {
        self.total.get(query_id).map(|(_, count)| *count)
    }
}

#[derive(Debug, Default)]
struct LocalState {
    map: SubscriptionMap,
    unfinished: BTreeMap<String, BTreeSet<String>>,
}

impl LocalState {
    fn finish(&mut self, peer: &str, query_id: &str) {
        if let Some(ids) = self.unfinished.get_mut(peer) {
            ids.remove(query_id);
            if ids.is_empty() {
                self.unfinished.remove(peer);
            }
        }
    }
}

/// Tracks subscriptions in both directions with bounded admission.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    limits: RegistryLimits,
    local: RwLock<LocalState>,
    remote: RwLock<SubscriptionMap>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            limits,
            local: RwLock::new(LocalState::default()),
            remote: RwLock::new(SubscriptionMap::default()),
        }
    }

    /// Admission limits.
    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    /// Reserves a query this node is about to subscribe to at `peer`.
    ///
    /// # Errors
    ///
    /// `MaxLimitsExceeded` when the per-database, peer or per-peer bound is
    /// hit, checked in that order. `InvalidArgs` for a query without identity.
    pub fn reserve_local(&self, peer: &str, query: &QueryFingerprint) -> SyncResult<()> {
        let result = self.local.write().map.reserve(&self.limits, peer, query);
        info!(peer = %mask_peer(peer), ok = result.is_ok(), "local reserve");
        result
    }

    /// Reserves a query `peer` asked this node to notify it about.
    pub fn reserve_remote(&self, peer: &str, query: &QueryFingerprint) -> SyncResult<()> {
        let result = self.remote.write().reserve(&self.limits, peer, query);
        info!(peer = %mask_peer(peer), ok = result.is_ok(), "remote reserve");
        result
    }

    /// Marks a reserved local subscription as acknowledged.
    ///
    /// # Errors
    ///
    /// `InternalError` if the pair was never reserved.
    pub fn activate_local(&self, peer: &str, query_id: &str) -> SyncResult<()> {
        let mut local = self.local.write();
        local.map.activate(peer, query_id)?;
        local.finish(peer, query_id);
        Ok(())
    }

    /// Marks a reserved remote subscription as acknowledged.
    pub fn activate_remote(&self, peer: &str, query_id: &str) -> SyncResult<()> {
        self.remote.write().activate(peer, query_id)
    }

    /// Undoes a NotActive local reservation. Active entries are kept.
    pub fn delete_local(&self, peer: &str, query_id: &str) {
        self.local.write().map.delete(peer, query_id);
    }

    /// Undoes a NotActive remote reservation. Active entries are kept.
    pub fn delete_remote(&self, peer: &str, query_id: &str) {
        self.remote.write().delete(peer, query_id);
    }

    /// Removes a local subscription regardless of status.
    pub fn remove_local(&self, peer: &str, query_id: &str) {
        let mut local = self.local.write();
        local.map.remove(peer, query_id);
        local.finish(peer, query_id);
    }

    /// Removes a remote subscription regardless of status.
    pub fn remove_remote(&self, peer: &str, query_id: &str) {
        self.remote.write().remove(peer, query_id);
    }

    /// Drops every local subscription of `peer`, and its pending resubscriptions.
    pub fn clear_local(&self, peer: &str) {
        let mut local = self.local.write();
        local.unfinished.remove(peer);
        local.map.clear_peer(peer);
        info!(peer = %mask_peer(peer), "cleared local subscriptions");
    }

    /// Drops every remote subscription of `peer`.
    pub fn clear_remote(&self, peer: &str) {
        self.remote.write().clear_peer(peer);
        info!(peer = %mask_peer(peer), "cleared remote subscriptions");
    }

    /// Drops every remote subscription.
    pub fn clear_all_remote(&self) {
        let mut remote = self.remote.write();
        remote.peers.clear();
        remote.total.clear();
    }

    /// Replaces the set of queries still to be resubscribed at `peer`.
    /// An empty slice clears it.
    pub fn put_unfinished(&self, peer: &str, queries: &[QueryFingerprint]) {
        let mut local = self.local.write();
        if queries.is_empty() {
            local.unfinished.remove(peer);
            return;
        }
        let ids = queries.iter().map(QueryFingerprint::identify).collect();
        local.unfinished.insert(peer.to_string(), ids);
    }

    /// Pending resubscriptions per peer.
    ///
    /// Only queries still present in the local total map are returned.
    pub fn unfinished_queries(&self) -> BTreeMap<String, Vec<QueryFingerprint>> {
        let local = self.local.read();
        local
            .unfinished
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(peer, ids)| {
                let queries = ids
                    .iter()
                    .filter_map(|id| local.map.total.get(id).map(|(query, _)| query.clone()))
                    .collect();
                (peer.clone(), queries)
            })
            .collect()
    }

    /// Queries this node subscribed to at `peer`.
    pub fn local_subscribe_queries(&self, peer: &str) -> Vec<QueryFingerprint> {
        self.local.read().map.queries(peer)
    }

    /// Queries `peer` subscribed to at this node.
    pub fn remote_subscribe_queries(&self, peer: &str) -> Vec<QueryFingerprint> {
        self.remote.read().queries(peer)
    }

    /// Ids of the queries `peer` subscribed to at this node.
    pub fn remote_subscribe_query_ids(&self, peer: &str) -> Vec<String> {
        self.remote.read().query_ids(peer)
    }

    /// Every active remote subscription as `(peer, query)`.
    pub fn active_remote_subscriptions(&self) -> Vec<(String, QueryFingerprint)> {
        let remote = self.remote.read();
        let total = &remote.total;
        remote
            .peers
            .iter()
            .flat_map(|(peer, queries)| {
                queries
                    .iter()
                    .filter(|(_, status)| **status == SubscribeStatus::Active)
                    .filter_map(move |(id, _)| total.get(id))
                    .map(move |(query, _)| (peer.clone(), query.clone()))
            })
            .collect()
    }

    /// Returns true if any peer holds `query_id` in the remote map.
    pub fn is_query_exist_subscribe(&self, query_id: &str) -> bool {
        self.remote.read().total.contains_key(query_id)
    }

    /// Returns true if `peer` is tracked and is the only remaining holder of
    /// `query_id` in the remote map.
    pub fn is_last_remote_contain_subscribe(&self, peer: &str, query_id: &str) -> bool {
        let remote = self.remote.read();
        if !remote.peers.contains_key(peer) {
            return false;
        }
        remote.reference_count(query_id) == Some(1)
    }

    /// Checks whether subscribing `query` at all of `peers` would fit the
    /// peer and per-database bounds of the local map.
    pub fn local_subscribe_limit_check<S: AsRef<str>>(
        &self,
        peers: &[S],
        query: &QueryFingerprint,
    ) -> SyncResult<()> {
        let local = self.local.read();
        let mut peer_count = local.map.peers.len();
        for peer in peers {
            if local.map.peers.contains_key(peer.as_ref()) {
                continue;
            }
            peer_count += 1;
            if peer_count > self.limits.max_peers {
                return Err(SyncError::MaxLimitsExceeded(format!(
                    "more than {} peers",
                    self.limits.max_peers
                )));
            }
        }
        let query_id = query.identify();
        if !local.map.total.contains_key(&query_id) && local.map.total.len() >= self.limits.per_db {
            return Err(SyncError::MaxLimitsExceeded(format!(
                "more than {} queries per database",
                self.limits.per_db
            )));
        }
        Ok(())
    }

    /// Status of a local subscription.
    pub fn local_status(&self, peer: &str, query_id: &str) -> Option<SubscribeStatus> {
        self.local.read().map.status(peer, query_id)
    }

    /// Status of a remote subscription.
    pub fn remote_status(&self, peer: &str, query_id: &str) -> Option<SubscribeStatus> {
        self.remote.read().status(peer, query_id)
    }

    /// Number of peers holding `query_id` in the local map.
    pub fn local_reference_count(&self, query_id: &str) -> Option<usize> {
        self.local.read().map.reference_count(query_id)
    }

    /// Number of peers holding `query_id` in the remote map.
    pub fn remote_reference_count(&self, query_id: &str) -> Option<usize> {
        self.remote.read().reference_count(query_id)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(RegistryLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn query(n: usize) -> QueryFingerprint {
        QueryFingerprint::new().prefix_key(format!("q{n}"))
    }

    fn peer(n: usize) -> String {
        format!("peer-{n}")
    }

    #[test]
    fn reserve_activate_remove() {
        let registry = SubscriptionRegistry::default();
        let q = query(0);
        let id = q.identify();

        registry.reserve_remote("a", &q).unwrap();
        assert_eq!(registry.remote_status("a", &id), Some(SubscribeStatus::NotActive));
        registry.activate_remote("a", &id).unwrap();
        assert_eq!(registry.remote_status("a", &id), Some(SubscribeStatus::Active));

        // re-reserving an active pair is a no-op
        registry.reserve_remote("a", &q).unwrap();
        assert_eq!(registry.remote_reference_count(&id), Some(1));
        assert_eq!(registry.remote_status("a", &id), Some(SubscribeStatus::Active));

        registry.remove_remote("a", &id);
        assert_eq!(registry.remote_status("a", &id), None);
        assert!(!registry.is_query_exist_subscribe(&id));
    }

    #[test]
    fn repeated_reserve_is_idempotent() {
        let registry = SubscriptionRegistry::default();
        let q = query(0);
        let id = q.identify();
        registry.reserve_local("a", &q).unwrap();
        registry.reserve_local("a", &q).unwrap();
        assert_eq!(registry.local_reference_count(&id), Some(1));
        assert_eq!(registry.local_subscribe_queries("a"), vec![q]);
    }

    #[test]
    fn activate_without_reserve_fails() {
        let registry = SubscriptionRegistry::default();
        let q = query(0);
        let id = q.identify();
        assert!(matches!(
            registry.activate_local("a", &id),
            Err(SyncError::InternalError(_))
        ));

        registry.reserve_local("a", &q).unwrap();
        assert!(matches!(
            registry.activate_local("b", &id),
            Err(SyncError::InternalError(_))
        ));
    }

    #[test]
    fn delete_keeps_active_entries() {
        let registry = SubscriptionRegistry::default();
        let q = query(0);
        let id = q.identify();
        registry.reserve_remote("a", &q).unwrap();
        registry.activate_remote("a", &id).unwrap();
        registry.delete_remote("a", &id);
        assert_eq!(registry.remote_status("a", &id), Some(SubscribeStatus::Active));

        registry.reserve_remote("b", &q).unwrap();
        registry.delete_remote("b", &id);
        assert_eq!(registry.remote_status("b", &id), None);
        assert_eq!(registry.remote_reference_count(&id), Some(1));
    }

    #[test]
    fn per_peer_limit() {
        let registry = SubscriptionRegistry::default();
        for n in 0..4 {
            registry.reserve_local("a", &query(n)).unwrap();
        }
        assert!(matches!(
            registry.reserve_local("a", &query(4)),
            Err(SyncError::MaxLimitsExceeded(_))
        ));
        assert_eq!(registry.local_subscribe_queries("a").len(), 4);
        // an existing query is still accepted
        registry.reserve_local("a", &query(3)).unwrap();
    }

    #[test]
    fn per_db_limit() {
        let registry = SubscriptionRegistry::default();
        for n in 0..8 {
            registry.reserve_remote(&peer(n), &query(n)).unwrap();
        }
        assert!(matches!(
            registry.reserve_remote(&peer(9), &query(8)),
            Err(SyncError::MaxLimitsExceeded(_))
        ));
        for n in 0..8 {
            assert!(registry.is_query_exist_subscribe(&query(n).identify()));
        }
        // a known query can still be shared by another peer
        registry.reserve_remote(&peer(9), &query(0)).unwrap();
        assert_eq!(registry.remote_reference_count(&query(0).identify()), Some(2));
    }

    #[test]
    fn peer_limit() {
        let registry = SubscriptionRegistry::default();
        let q = query(0);
        for n in 0..32 {
            registry.reserve_remote(&peer(n), &q).unwrap();
        }
        assert!(matches!(
            registry.reserve_remote(&peer(32), &q),
            Err(SyncError::MaxLimitsExceeded(_))
        ));
        assert_eq!(registry.remote_reference_count(&q.identify()), Some(32));
    }

    #[test]
    fn reference_count_tracks_removals() {
        let registry = SubscriptionRegistry::default();
        let q = query(0);
        let id = q.identify();
        let n = 5;
        for p in 0..n {
            registry.reserve_remote(&peer(p), &q).unwrap();
        }
        for k in 1..n {
            registry.remove_remote(&peer(k - 1), &id);
            assert_eq!(registry.remote_reference_count(&id), Some(n - k));
        }
        assert!(registry.is_last_remote_contain_subscribe(&peer(n - 1), &id));
        registry.remove_remote(&peer(n - 1), &id);
        assert_eq!(registry.remote_reference_count(&id), None);
    }

    #[test]
    fn last_remote_holder() {
        let registry = SubscriptionRegistry::default();
        let q = query(0);
        let id = q.identify();
        assert!(!registry.is_last_remote_contain_subscribe("a", &id));
        registry.reserve_remote("a", &q).unwrap();
        registry.reserve_remote("b", &q).unwrap();
        assert!(!registry.is_last_remote_contain_subscribe("a", &id));
        registry.clear_remote("b");
        assert!(registry.is_last_remote_contain_subscribe("a", &id));
        assert!(!registry.is_last_remote_contain_subscribe("b", &id));
    }

    #[test]
    fn clear_remote_only_touches_one_peer() {
        let registry = SubscriptionRegistry::default();
        let q = query(0);
        let id = q.identify();
        registry.reserve_remote("b", &q).unwrap();
        registry.reserve_remote("c", &q).unwrap();
        registry.activate_remote("c", &id).unwrap();
        registry.clear_remote("b");
        assert!(registry.remote_subscribe_query_ids("b").is_empty());
        assert_eq!(registry.remote_subscribe_query_ids("c"), vec![id.clone()]);
        assert_eq!(registry.remote_reference_count(&id), Some(1));
        assert_eq!(registry.active_remote_subscriptions(), vec![("c".to_string(), q)]);
    }

    #[test]
    fn unfinished_resubscriptions() {
        let registry = SubscriptionRegistry::default();
        let (q0, q1) = (query(0), query(1));
        registry.reserve_local("a", &q0).unwrap();
        registry.reserve_local("a", &q1).unwrap();
        registry.put_unfinished("a", &[q0.clone(), q1.clone()]);
        assert_eq!(registry.unfinished_queries()["a"].len(), 2);

        registry.activate_local("a", &q0.identify()).unwrap();
        assert_eq!(registry.unfinished_queries()["a"], vec![q1.clone()]);

        registry.remove_local("a", &q1.identify());
        assert!(registry.unfinished_queries().is_empty());

        registry.put_unfinished("a", &[q0.clone()]);
        registry.put_unfinished("a", &[]);
        assert!(registry.unfinished_queries().is_empty());
    }

    #[test]
    fn local_limit_check() {
        let limits = RegistryLimits {
            per_peer: 4,
            per_db: 1,
            max_peers: 2,
        };
        let registry = SubscriptionRegistry::new(limits);
        registry.reserve_local("a", &query(0)).unwrap();
        assert!(registry
            .local_subscribe_limit_check(&["a", "b"], &query(0))
            .is_ok());
        assert!(registry
            .local_subscribe_limit_check(&["b", "c"], &query(0))
            .is_err());
        assert!(registry
            .local_subscribe_limit_check(&["a"], &query(1))
            .is_err());
    }

    #[test]
    fn empty_identity_is_rejected() {
        let registry = SubscriptionRegistry::default();
        let invalid = QueryFingerprint::new().begin_group();
        assert!(matches!(
            registry.reserve_remote("a", &invalid),
            Err(SyncError::InvalidArgs(_))
        ));
    }

    proptest! {
        #[test]
        fn reference_count_equals_holders(ops in prop::collection::vec((0usize..4, 0usize..3, 0u8..4), 0..64)) {
            let registry = SubscriptionRegistry::default();
            for (p, q, op) in ops {
                let (peer, query) = (peer(p), query(q));
                let id = query.identify();
                match op {
                    0 => { let _ = registry.reserve_remote(&peer, &query); }
                    1 => { let _ = registry.activate_remote(&peer, &id); }
                    2 => registry.delete_remote(&peer, &id),
                    _ => registry.remove_remote(&peer, &id),
                }
            }
            for q in 0..3 {
                let id = query(q).identify();
                let holders = (0..4).filter(|p| registry.remote_status(&peer(*p), &id).is_some()).count();
                let expected = if holders == 0 { None } else { Some(holders) };
                prop_assert_eq!(registry.remote_reference_count(&id), expected);
            }
        }
    }
}
