//! Gossip & Metadata reconciliation (§4.6): a periodic timer that pulls
//! a random peer's metadata, reconciles it against the local view, and
//! pushes back when the peer is behind.
use crate::cluster::Engine;
use crate::network::RemoteStorage;
use crate::ring::{Node, Ring};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;

/// Spawn the gossip ticker. Runs until a message arrives on `shutdown`.
pub fn spawn(engine: Arc<Engine>, mut shutdown: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut ticker = interval(engine.config().gossip_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(&engine).await,
                _ = shutdown.recv() => break,
            }
        }
    });
}

/// One gossip round (§4.6 steps 1-6).
pub async fn tick(engine: &Arc<Engine>) {
    let ring = engine.ring_snapshot().await;
    let Some(peer) = pick_peer(&ring, engine.self_key(), engine.config().join_addr) else {
        return;
    };

    let remote = RemoteStorage::new(engine.client(), &peer);
    let received = match remote.fetch_metadata().await {
        Ok(metadata) => metadata,
        Err(error) => {
            tracing::warn!(%error, peer = %peer.key(), "gossip pull failed");
            return;
        }
    };

    let (changed, push_back) = engine.update_meta(received).await;
    if changed {
        tracing::info!(peer = %peer.key(), "adopted newer metadata from gossip");
        engine.update_storage().await;
    }

    if push_back {
        let local = engine.metadata_snapshot().await;
        if let Err(error) = remote.push_metadata(&local).await {
            tracing::warn!(%error, peer = %peer.key(), "failed to push metadata back to peer");
        }
    }
}

/// Pick a uniformly random other node already in the ring. If this node
/// doesn't yet know of any peers (fresh join), fall back to the
/// configured `join_addr` so the very first tick has somewhere to pull
/// from.
fn pick_peer(ring: &Ring, self_key: &str, join_addr: Option<SocketAddr>) -> Option<Node> {
    let candidates: Vec<Node> = ring
        .nodes()
        .filter(|node| node.key() != self_key)
        .cloned()
        .collect();
    if let Some(node) = candidates.choose(&mut rand::thread_rng()) {
        return Some(node.clone());
    }
    join_addr.map(|addr| Node::new(addr.ip().to_string(), addr.port(), 0))
}
