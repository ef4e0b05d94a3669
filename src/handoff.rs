//! The handoff engine (§4.7): detects partitions this node holds but no
//! longer claims or replicates, streams their contents to the new
//! owner, and retires the local copy once delivery completes.
use crate::cluster::Engine;
use crate::error::{RingError, RingResult};
use crate::network::RemoteStorage;
use crate::ring::Node;
use crate::storage;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;

/// Chunks are capped at this many key+value bytes per `PUT /_handoff`.
const CHUNK_THRESHOLD_BYTES: usize = 1024 * 1024;

/// Spawn the handoff ticker. Runs until a message arrives on `shutdown`.
pub fn spawn(engine: Arc<Engine>, mut shutdown: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = interval(engine.config().handoff_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(&engine).await,
                _ = shutdown.recv() => break,
            }
        }
    });
}

/// One handoff round: detect newly-orphaned partitions, then attempt to
/// drain every partition still in `pending_shutdown`.
pub async fn tick(engine: &Arc<Engine>) {
    let ring = engine.ring_snapshot().await;
    let keep: BTreeSet<u32> = ring
        .claim(engine.self_key())
        .into_iter()
        .chain(ring.replicated(engine.self_key()))
        .collect();

    let orphans: Vec<u32> = engine
        .known_partitions()
        .iter()
        .map(|entry| *entry)
        .filter(|p| !keep.contains(p))
        .collect();
    for partition in orphans {
        engine.pending_shutdown().insert(partition);
        engine.known_partitions().remove(&partition);
    }

    let pending: Vec<u32> = engine.pending_shutdown().iter().map(|entry| *entry).collect();
    for partition in pending {
        let Some(owner) = ring.partition_to_node(partition) else {
            continue;
        };
        if owner.key() == engine.self_key() {
            // Ownership reverted to us before the handoff completed.
            engine.pending_shutdown().remove(&partition);
            engine.known_partitions().insert(partition);
            continue;
        }
        if let Err(error) = drain_partition(engine, partition, owner).await {
            tracing::warn!(%error, partition, target = %owner.key(), "handoff failed, will retry next tick");
        }
    }
}

/// Probe `target`, then stream `partition`'s contents to it in chunks.
/// Only on full, chunk-by-chunk success is the local shard retired and
/// the partition dropped from `pending_shutdown`; any failure leaves it
/// in place for the next tick (§4.7).
async fn drain_partition(engine: &Arc<Engine>, partition: u32, target: &Node) -> RingResult<()> {
    let remote = RemoteStorage::new(engine.client(), target);
    remote.fetch_metadata().await?;

    let shard = engine.local_shard(partition);
    let failed = Arc::new(AtomicBool::new(false));

    {
        let failed = Arc::clone(&failed);
        let remote = remote.clone();
        shard
            .get_all(CHUNK_THRESHOLD_BYTES, move |chunk| {
                let failed = Arc::clone(&failed);
                let remote = remote.clone();
                async move {
                    let stamped: Vec<(Vec<u8>, _)> = chunk
                        .into_iter()
                        .filter_map(|(key, bytes)| match storage::decode_stamped(&bytes) {
                            Ok(value) => Some((key, value)),
                            Err(error) => {
                                tracing::warn!(%error, partition, "dropping undecodable entry during handoff");
                                None
                            }
                        })
                        .collect();
                    if let Err(error) = remote.send_handoff(partition, stamped).await {
                        tracing::warn!(%error, partition, "handoff chunk delivery failed");
                        failed.store(true, Ordering::Relaxed);
                    }
                }
            })
            .await?;
    }

    if failed.load(Ordering::Relaxed) {
        return Err(RingError::Transport {
            peer: target.key(),
            reason: "one or more handoff chunks failed to deliver".into(),
        });
    }

    shard.retire().await;
    engine.pending_shutdown().remove(&partition);
    tracing::info!(partition, target = %target.key(), "handoff complete, shard retired");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::Ring;
    use crate::types::{Metadata, NodeConfig};
    use crate::vector_clock::VectorClock;
    use std::time::Duration;

    fn test_config(port: u16) -> NodeConfig {
        NodeConfig {
            bind_addr: format!("127.0.0.1:{port}").parse().unwrap(),
            join_addr: None,
            claim: None,
            partitions: 16,
            replicas: 1,
            read_quorum: 1,
            write_quorum: 1,
            worker_pool_size: 2,
            gossip_interval: Duration::from_secs(30),
            handoff_interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn orphaned_partition_moves_to_pending_shutdown() {
        let engine = Engine::new(test_config(9201));
        engine.update_storage().await;
        assert!(!engine.known_partitions().is_empty());

        // Another node takes over every partition; this node keeps its
        // ring membership but is shrunk to a zero claim.
        let mut ring = Ring::new(16, 1);
        ring.add_node(Node::new("10.0.0.9", 8000, 0), None);
        let self_node = engine.self_node().clone();
        ring.add_node(self_node.clone(), None);
        ring.set_wanted(&self_node.key(), 0, true);

        let mut clock = VectorClock::new();
        clock.increment("10.0.0.9:8000");
        clock.increment(engine.self_key());
        let received = Metadata { clock, ring };

        let (changed, _) = engine.update_meta(received).await;
        assert!(changed);
        assert_eq!(engine.claim_count().await, 0);

        tick(&engine).await;
        // Partitions no longer claimed or replicated move to
        // pending_shutdown; the handoff probe to an unreachable target
        // fails, so they stay there for a later retry.
        assert!(!engine.pending_shutdown().is_empty());
    }
}
