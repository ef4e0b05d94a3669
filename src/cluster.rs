//! The node/engine: the top-level struct tying the ring, gossiped
//! metadata, local storage, the quorum coordinator, and the background
//! gossip/handoff schedulers together. One `Engine` lives per process.
use crate::coordinator::Coordinator;
use crate::error::RingResult;
use crate::ring::{Node, NodeKey, Ring};
use crate::storage::{LocalStorage, WorkerPool};
use crate::types::{Metadata, NodeConfig};
use crate::vector_clock::{Stamped, Value, VectorClock};
use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Shared node state. Cheap to clone (it's always held behind an `Arc`).
pub struct Engine {
    self_key: NodeKey,
    self_node: Node,
    config: NodeConfig,
    metadata: RwLock<Metadata>,
    pool: Arc<WorkerPool>,
    /// Partitions this node believes it holds storage for: everything
    /// ever in its claim or replication window. Compared against the
    /// current claim/replication window on each handoff tick to detect
    /// newly orphaned partitions.
    known_partitions: DashSet<u32>,
    /// Partitions currently being streamed to their new owner. A
    /// partition leaves this set once `get_all` has delivered its final
    /// (empty) chunk to the target.
    pending_shutdown: DashSet<u32>,
    client: reqwest::Client,
    coordinator: Coordinator,
    shutdown_tx: broadcast::Sender<()>,
}

impl Engine {
    /// Build a new node from `config`. A node with no `join_addr` starts
    /// as the sole member of its own ring, owning every partition; a
    /// node with a `join_addr` starts with an empty ring and discovers
    /// membership on its first gossip tick (§4.6).
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let self_node = Node::new(
            config.bind_addr.ip().to_string(),
            config.bind_addr.port(),
            config.claim.unwrap_or(0),
        );
        let self_key = self_node.key();

        let mut ring = Ring::new(config.partitions, config.replicas);
        let mut clock = VectorClock::new();
        if config.join_addr.is_none() {
            ring.add_node(self_node.clone(), None);
            clock.increment(&self_key);
        }
        let metadata = Metadata { clock, ring };

        let pool = WorkerPool::new(config.worker_pool_size);
        let client = reqwest::Client::new();
        let coordinator = Coordinator::new(
            self_key.clone(),
            Arc::clone(&pool),
            client.clone(),
            config.read_quorum,
            config.write_quorum,
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            self_key,
            self_node,
            config,
            metadata: RwLock::new(metadata),
            pool,
            known_partitions: DashSet::new(),
            pending_shutdown: DashSet::new(),
            client,
            coordinator,
            shutdown_tx,
        })
    }

    pub fn self_key(&self) -> &str {
        &self.self_key
    }

    pub fn self_node(&self) -> &Node {
        &self.self_node
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    pub(crate) fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub(crate) fn pending_shutdown(&self) -> &DashSet<u32> {
        &self.pending_shutdown
    }

    pub(crate) fn known_partitions(&self) -> &DashSet<u32> {
        &self.known_partitions
    }

    /// Number of partitions still being streamed off this node (§6
    /// observability: lets an operator or test poll handoff progress
    /// without reaching into internal state).
    pub fn pending_handoff_count(&self) -> usize {
        self.pending_shutdown.len()
    }

    pub async fn metadata_snapshot(&self) -> Metadata {
        self.metadata.read().await.clone()
    }

    pub async fn ring_snapshot(&self) -> Ring {
        self.metadata.read().await.ring.clone()
    }

    /// Bind this node's own local shard for whatever partition `key`
    /// hashes to, per this node's own ring view.
    pub async fn local_shard_for(&self, key: &[u8]) -> LocalStorage {
        let ring = self.ring_snapshot().await;
        self.pool.shard(ring.key_to_partition(key))
    }

    pub fn local_shard(&self, partition: u32) -> LocalStorage {
        self.pool.shard(partition)
    }

    /// External coordinator GET/PUT/DELETE, dispatched against the
    /// current ring snapshot.
    pub async fn get(&self, key: &[u8]) -> RingResult<Stamped> {
        let ring = self.ring_snapshot().await;
        self.coordinator.get(&ring, key).await
    }

    pub async fn put(
        &self,
        key: &[u8],
        client_id: &str,
        context: Option<VectorClock>,
        value: Value,
    ) -> RingResult<VectorClock> {
        let ring = self.ring_snapshot().await;
        self.coordinator
            .put(&ring, key, client_id, context, value)
            .await
    }

    pub async fn delete(
        &self,
        key: &[u8],
        client_id: &str,
        context: Option<VectorClock>,
    ) -> RingResult<VectorClock> {
        self.put(key, client_id, context, Value::Tombstone).await
    }

    /// Reconcile a gossiped [`Metadata`] document received from a peer
    /// (§4.6 step 3-4). Returns `(changed, should_push_back)`:
    /// `changed` means the local view moved (adopted the peer's view
    /// and/or self-inserted); `should_push_back` means the caller
    /// should PUT the (possibly just-updated) local metadata back to
    /// the peer so it catches up.
    pub async fn update_meta(self: &Arc<Self>, received: Metadata) -> (bool, bool) {
        let mut changed = false;
        let mut push_back = false;
        {
            let mut metadata = self.metadata.write().await;
            if metadata.ring.node_count() == 0 {
                *metadata = received;
                changed = true;
            } else if metadata.clock == received.clock {
                // Already in sync, nothing to do.
            } else if received.clock.descends_from(&metadata.clock) {
                *metadata = received;
                changed = true;
            } else if metadata.clock.descends_from(&received.clock) {
                // Local strictly dominates: nothing to adopt, but the
                // peer is behind and needs the current view pushed back.
                push_back = true;
            } else {
                // Concurrent: neither dominates. Keep the local view
                // authoritative (§9) and push back so the peer converges.
                push_back = true;
            }

            if !metadata.ring.contains_node(&self.self_key) {
                metadata.ring.add_node(self.self_node.clone(), None);
                metadata.clock.increment(&self.self_key);
                metadata.clock.prune();
                changed = true;
            }
        }
        (changed, push_back || changed)
    }

    /// Reconcile a gossiped [`Metadata`] document and, if anything
    /// changed, refresh which partitions this node believes it holds
    /// storage for. Used directly by the `/_metadata` PUT handler, which
    /// runs the same reconciliation as a gossip pull from the other side.
    pub async fn receive_metadata(self: &Arc<Self>, received: Metadata) {
        let (changed, _) = self.update_meta(received).await;
        if changed {
            self.update_storage().await;
        }
    }

    /// Track every partition currently in this node's claim or
    /// replication window as "known" — storage the node either owns or
    /// must keep a replica of. Run after any metadata change (§4.6 step 6).
    pub async fn update_storage(&self) {
        let ring = self.ring_snapshot().await;
        for p in ring.claim(&self.self_key) {
            self.known_partitions.insert(p);
        }
        for p in ring.replicated(&self.self_key) {
            self.known_partitions.insert(p);
        }
    }

    /// Current claim size for this node (§6 `/admin/claim` GET).
    pub async fn claim_count(&self) -> usize {
        self.ring_snapshot().await.claim(&self.self_key).len()
    }

    /// Update this node's wanted claim and immediately (re)grow/shrink
    /// toward it (§6 `/admin/claim` PUT).
    pub async fn set_claim(self: &Arc<Self>, wanted: usize, force: bool) {
        {
            let mut metadata = self.metadata.write().await;
            metadata.ring.set_wanted(&self.self_key, wanted, force);
            metadata.clock.increment(&self.self_key);
            metadata.clock.prune();
        }
        self.update_storage().await;
    }

    /// Trigger the ring's operator balance pass (§6 `/admin/balance`).
    pub async fn balance(self: &Arc<Self>) {
        {
            let mut metadata = self.metadata.write().await;
            metadata.ring.update_claim();
            metadata.clock.increment(&self.self_key);
            metadata.clock.prune();
        }
        self.update_storage().await;
    }

    /// Apply an incoming batch of handoff data to a local shard.
    pub async fn receive_handoff(
        &self,
        partition: u32,
        entries: Vec<(Vec<u8>, Stamped)>,
    ) -> RingResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.known_partitions.insert(partition);
        self.pool.shard(partition).multi_put(entries).await
    }

    /// Start the gossip and handoff background tasks. Returns
    /// immediately; both tasks run until `shutdown()` is called.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        crate::gossip::spawn(Arc::clone(self), self.shutdown_tx.subscribe());
        crate::handoff::spawn(Arc::clone(self), self.shutdown_tx.subscribe());
    }

    /// Signal background tasks to stop. Idempotent from the caller's
    /// perspective; a closed channel (no active receivers) is not an error.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(port: u16) -> NodeConfig {
        NodeConfig {
            bind_addr: format!("127.0.0.1:{port}").parse().unwrap(),
            join_addr: None,
            claim: None,
            partitions: 32,
            replicas: 3,
            read_quorum: 1,
            write_quorum: 1,
            worker_pool_size: 2,
            gossip_interval: Duration::from_secs(30),
            handoff_interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn bootstrapping_node_owns_every_partition() {
        let engine = Engine::new(test_config(9101));
        let ring = engine.ring_snapshot().await;
        assert_eq!(ring.claim(engine.self_key()).len(), 32);
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let engine = Engine::new(test_config(9102));
        engine
            .put(b"k", "client-a", None, Value::Present(serde_json::json!("v1")))
            .await
            .unwrap();
        let (_, value) = engine.get(b"k").await.unwrap();
        assert_eq!(value, Value::Present(serde_json::json!("v1")));
    }

    #[tokio::test]
    async fn joining_node_starts_with_empty_ring() {
        let mut config = test_config(9103);
        config.join_addr = Some("127.0.0.1:9999".parse().unwrap());
        let engine = Engine::new(config);
        let ring = engine.ring_snapshot().await;
        assert_eq!(ring.node_count(), 0);
    }

    #[tokio::test]
    async fn update_meta_self_inserts_when_absent_from_received_ring() {
        let engine = Engine::new({
            let mut c = test_config(9104);
            c.join_addr = Some("127.0.0.1:9998".parse().unwrap());
            c
        });
        let mut other_ring = Ring::new(32, 3);
        other_ring.add_node(Node::new("127.0.0.1", 9998, 0), None);
        let mut clock = VectorClock::new();
        clock.increment("127.0.0.1:9998");
        let received = Metadata {
            clock,
            ring: other_ring,
        };

        let (changed, push_back) = engine.update_meta(received).await;
        assert!(changed);
        assert!(push_back);
        let ring = engine.ring_snapshot().await;
        assert!(ring.contains_node(engine.self_key()));
    }

    #[tokio::test]
    async fn set_claim_updates_wanted_and_reshapes_claim() {
        let engine = Engine::new(test_config(9105));
        engine.set_claim(10, true).await;
        assert_eq!(engine.claim_count().await, 10);
    }
}
