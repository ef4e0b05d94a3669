//! The quorum coordinator: per-request state machines for GET (R-of-N,
//! with asynchronous read-repair) and PUT/DELETE (W-of-N), dispatching
//! in parallel across whichever replicas — local or remote — own a
//! key's partition.
use crate::error::{RingError, RingResult};
use crate::network::RemoteStorage;
use crate::ring::{Node, NodeKey, Ring};
use crate::storage::{LocalStorage, WorkerPool};
use crate::vector_clock::{self, Stamped, Value, VectorClock};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;

/// A replica handle that is either this node's own storage or an HTTP
/// link to a peer's. The coordinator doesn't care which.
enum Replica {
    Local(LocalStorage),
    Remote(RemoteStorage),
}

impl Replica {
    async fn get_stamped(&self, key: &[u8]) -> RingResult<Stamped> {
        match self {
            Replica::Local(local) => local.get_stamped(key).await,
            Replica::Remote(remote) => remote
                .get(key)
                .await?
                .ok_or_else(|| RingError::NotFound(String::from_utf8_lossy(key).into_owned())),
        }
    }

    async fn put_stamped(&self, key: &[u8], stamped: &Stamped) -> RingResult<()> {
        match self {
            Replica::Local(local) => local.put_stamped(key, stamped).await,
            Replica::Remote(remote) => remote.put(key, stamped).await,
        }
    }
}

/// Coordinates one external GET/PUT/DELETE across the preferred replica
/// list for a key. Stateless beyond its construction parameters — a new
/// one is built per request from the node's current ring snapshot.
#[derive(Clone)]
pub struct Coordinator {
    self_key: NodeKey,
    pool: Arc<WorkerPool>,
    client: reqwest::Client,
    read_quorum: usize,
    write_quorum: usize,
}

impl Coordinator {
    pub fn new(
        self_key: NodeKey,
        pool: Arc<WorkerPool>,
        client: reqwest::Client,
        read_quorum: usize,
        write_quorum: usize,
    ) -> Self {
        Self {
            self_key,
            pool,
            client,
            read_quorum,
            write_quorum,
        }
    }

    fn replica_for(&self, ring: &Ring, node: &Node, key: &[u8]) -> Replica {
        if node.key() == self.self_key {
            let partition = ring.key_to_partition(key);
            Replica::Local(self.pool.shard(partition))
        } else {
            Replica::Remote(RemoteStorage::new(self.client.clone(), node))
        }
    }

    /// GET state machine (§4.5). Responds as soon as `read_quorum`
    /// successes are collected, resolving siblings across them; the
    /// remaining in-flight replicas (if any) are awaited in the
    /// background and folded into an asynchronous read-repair pass once
    /// all N have answered.
    pub async fn get(&self, ring: &Ring, key: &[u8]) -> RingResult<Stamped> {
        let replicas = ring.preferred(key).primary;
        let total = replicas.len();

        let mut futs = FuturesUnordered::new();
        for node in replicas {
            let replica = self.replica_for(ring, &node, key);
            let keyv = key.to_vec();
            futs.push(async move {
                let result = replica.get_stamped(&keyv).await;
                (node, result)
            });
        }

        let mut successes: Vec<(Node, Stamped)> = Vec::new();
        let mut failed_nodes: Vec<Node> = Vec::new();
        let mut responded = 0usize;

        while let Some((node, result)) = futs.next().await {
            responded += 1;
            match result {
                // A tombstone read is a failure for quorum purposes (§4.5):
                // it never contributes a value to resolve_list.
                Ok((clock, value)) if !value.is_tombstone() => successes.push((node, (clock, value))),
                Ok(_) => failed_nodes.push(node),
                Err(_) => failed_nodes.push(node),
            }

            if successes.len() >= self.read_quorum {
                let values: Vec<Stamped> = successes.iter().map(|(_, s)| s.clone()).collect();
                if let Some(resolved) = vector_clock::resolve_list(values) {
                    if responded < total {
                        self.spawn_read_repair(ring.clone(), key.to_vec(), futs, successes, failed_nodes);
                    } else {
                        self.read_repair(ring.clone(), key.to_vec(), successes, failed_nodes, resolved.clone())
                            .await;
                    }
                    return Ok(resolved);
                }
            }
            if responded == total {
                break;
            }
        }

        Err(RingError::QuorumUnmet {
            have: successes.len(),
            need: self.read_quorum,
            total,
        })
    }

    /// Await the remaining in-flight replica futures, then run
    /// read-repair over the complete result set, detached from the
    /// client response that already returned.
    fn spawn_read_repair(
        &self,
        ring: Ring,
        key: Vec<u8>,
        mut futs: FuturesUnordered<impl std::future::Future<Output = (Node, RingResult<Stamped>)> + Send + 'static>,
        mut successes: Vec<(Node, Stamped)>,
        mut failed_nodes: Vec<Node>,
    ) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some((node, result)) = futs.next().await {
                match result {
                    Ok((clock, value)) if !value.is_tombstone() => successes.push((node, (clock, value))),
                    _ => failed_nodes.push(node),
                }
            }
            let values: Vec<Stamped> = successes.iter().map(|(_, s)| s.clone()).collect();
            if let Some(resolved) = vector_clock::resolve_list(values) {
                coordinator
                    .read_repair(ring, key, successes, failed_nodes, resolved)
                    .await;
            }
        });
    }

    /// Write the resolved blob back to every successful replica whose
    /// clock is strictly dominated by `resolved`, and to every failed
    /// replica. No fresh clock increment: replicas converge on the same
    /// clock after repair (§9).
    async fn read_repair(
        &self,
        ring: Ring,
        key: Vec<u8>,
        successes: Vec<(Node, Stamped)>,
        failed_nodes: Vec<Node>,
        resolved: Stamped,
    ) {
        let (resolved_clock, _) = &resolved;
        let mut targets: Vec<Node> = successes
            .into_iter()
            .filter(|(_, (clock, _))| resolved_clock.descends_from(clock) && *clock != *resolved_clock)
            .map(|(node, _)| node)
            .collect();
        targets.extend(failed_nodes);

        for node in targets {
            let replica = self.replica_for(&ring, &node, &key);
            let resolved = resolved.clone();
            let key = key.clone();
            tokio::spawn(async move {
                if let Err(error) = replica.put_stamped(&key, &resolved).await {
                    tracing::warn!(%error, node = node.key(), "read-repair write failed");
                }
            });
        }
    }

    /// PUT/DELETE state machine (§4.5): increments the causal context by
    /// `client_id`, stamps `value`, and writes to every preferred
    /// replica in parallel, responding as soon as `write_quorum`
    /// successes land. Remaining in-flight writes are left running in
    /// the background rather than cancelled.
    pub async fn put(
        &self,
        ring: &Ring,
        key: &[u8],
        client_id: &str,
        context: Option<VectorClock>,
        value: Value,
    ) -> RingResult<VectorClock> {
        let mut clock = context.unwrap_or_default();
        clock.increment(client_id);
        clock.prune();
        let stamped: Stamped = (clock.clone(), value);

        let replicas = ring.preferred(key).primary;
        let total = replicas.len();
        let mut futs = FuturesUnordered::new();
        for node in replicas {
            let replica = self.replica_for(ring, &node, key);
            let stamped = stamped.clone();
            let keyv = key.to_vec();
            futs.push(async move { replica.put_stamped(&keyv, &stamped).await });
        }

        let mut successes = 0usize;
        let mut responded = 0usize;
        while let Some(result) = futs.next().await {
            responded += 1;
            if result.is_ok() {
                successes += 1;
            }
            if successes >= self.write_quorum {
                if responded < total {
                    tokio::spawn(async move { while futs.next().await.is_some() {} });
                }
                return Ok(clock);
            }
            if responded == total {
                break;
            }
        }

        Err(RingError::QuorumUnmet {
            have: successes,
            need: self.write_quorum,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Engine;
    use crate::ring::Node;
    use crate::types::NodeConfig;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn single_node_ring(self_key: &str) -> Ring {
        let mut ring = Ring::new(64, 3);
        let (host, port) = self_key.split_once(':').unwrap();
        ring.add_node(Node::new(host, port.parse().unwrap(), 0), None);
        ring
    }

    fn coordinator(self_key: &str) -> Coordinator {
        Coordinator::new(
            self_key.to_string(),
            WorkerPool::new(4),
            reqwest::Client::new(),
            1,
            1,
        )
    }

    #[tokio::test]
    async fn put_then_get_round_trips_on_single_node() {
        let ring = single_node_ring("127.0.0.1:9001");
        let coordinator = coordinator("127.0.0.1:9001");

        let clock = coordinator
            .put(&ring, b"k", "client-a", None, Value::Present(serde_json::json!("v1")))
            .await
            .unwrap();
        assert_eq!(clock.counter("client-a"), 1);

        let (_, value) = coordinator.get(&ring, b"k").await.unwrap();
        assert_eq!(value, Value::Present(serde_json::json!("v1")));
    }

    #[tokio::test]
    async fn get_on_empty_key_fails_quorum() {
        let ring = single_node_ring("127.0.0.1:9002");
        let coordinator = coordinator("127.0.0.1:9002");
        let result = coordinator.get(&ring, b"missing").await;
        assert!(matches!(result, Err(RingError::QuorumUnmet { .. })));
    }

    /// Spawn a standalone node serving only its `/_localstore/:key` surface,
    /// for tests that need two physically distinct replicas. `replica_for`
    /// always routes to `Replica::Local` for the coordinator's own node and
    /// `Replica::Remote` (a real HTTP call) for every other node, so a
    /// coordinator whose `self_key` matches neither of two such nodes talks
    /// to both exclusively over the network, each backed by its own storage.
    async fn spawn_storage_only_node(partitions: u32) -> (Arc<Engine>, SocketAddr) {
        let mut config = NodeConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            join_addr: None,
            claim: None,
            partitions,
            replicas: 1,
            read_quorum: 1,
            write_quorum: 1,
            worker_pool_size: 2,
            gossip_interval: Duration::from_secs(30),
            handoff_interval: Duration::from_secs(30),
        };
        let probe = tokio::net::TcpListener::bind(config.bind_addr).await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        config.bind_addr = addr;

        let engine = Engine::new(config);
        let serve_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let _ = crate::http::serve(serve_engine, addr).await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        (engine, addr)
    }

    /// Siblings only arise from genuinely divergent replica state: the
    /// replica write path itself is a blind overwrite (§4.5), so two
    /// sequential writes against a *single* replica simply overwrite one
    /// another rather than producing a sibling. Construct the real thing
    /// instead — two independent replicas, each holding a different
    /// causally-concurrent version of the same key, exactly as would result
    /// from two clients' writes landing on disjoint subsets of replicas.
    #[tokio::test]
    async fn concurrent_writes_surface_as_siblings() {
        let (node_a, addr_a) = spawn_storage_only_node(8).await;
        let (node_b, addr_b) = spawn_storage_only_node(8).await;

        let mut clock_x = VectorClock::new();
        clock_x.increment("client-x");
        node_a
            .local_shard_for(b"k")
            .await
            .put_stamped(b"k", &(clock_x, Value::Present(serde_json::json!("v1"))))
            .await
            .unwrap();

        let mut clock_y = VectorClock::new();
        clock_y.increment("client-y");
        node_b
            .local_shard_for(b"k")
            .await
            .put_stamped(b"k", &(clock_y, Value::Present(serde_json::json!("v2"))))
            .await
            .unwrap();

        let mut ring = Ring::new(8, 2);
        ring.add_node(Node::new(addr_a.ip().to_string(), addr_a.port(), 0), None);
        ring.add_node(Node::new(addr_b.ip().to_string(), addr_b.port(), 0), None);

        // A self_key matching neither node means both preferred replicas
        // resolve to Replica::Remote, so the coordinator only ever sees
        // node_a's and node_b's genuinely independent storage.
        let coordinator = Coordinator::new(
            "127.0.0.1:1".to_string(),
            WorkerPool::new(2),
            reqwest::Client::new(),
            2,
            2,
        );

        let (_, value) = coordinator.get(&ring, b"k").await.unwrap();
        match value {
            Value::Siblings(vs) => assert_eq!(vs.len(), 2),
            other => panic!("expected siblings from genuinely divergent replicas, got {other:?}"),
        }
    }

    /// A context round-tripped from a prior GET strictly dominates the
    /// clock it was read at, even across a plain sequential overwrite
    /// chain on a single replica (no siblings involved here — see
    /// `concurrent_writes_surface_as_siblings` above for the genuine
    /// sibling case).
    #[tokio::test]
    async fn context_round_trip_advances_the_clock() {
        let ring = single_node_ring("127.0.0.1:9004");
        let coordinator = coordinator("127.0.0.1:9004");

        coordinator
            .put(&ring, b"k", "client-x", None, Value::Present(serde_json::json!("v1")))
            .await
            .unwrap();
        let (read_clock, _) = coordinator.get(&ring, b"k").await.unwrap();

        coordinator
            .put(
                &ring,
                b"k",
                "client-x",
                Some(read_clock.clone()),
                Value::Present(serde_json::json!("v3")),
            )
            .await
            .unwrap();

        let (final_clock, value) = coordinator.get(&ring, b"k").await.unwrap();
        assert_eq!(value, Value::Present(serde_json::json!("v3")));
        assert!(final_clock.descends_from(&read_clock));
        assert!(!read_clock.descends_from(&final_clock));
    }
}
