//! Shared wire/domain types that don't belong to any single component:
//! the gossiped [`Metadata`] document, node configuration, and the
//! base64 encode/decode of the causal context header.
use crate::ring::Ring;
use crate::vector_clock::VectorClock;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// The gossiped membership document: a vector clock tracking causality
/// of ring mutations, paired with the ring itself. Every node holds one
/// authoritative copy; gossip reconciles divergent copies across peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub clock: VectorClock,
    pub ring: Ring,
}

impl Metadata {
    pub fn new(ring: Ring) -> Self {
        Self {
            clock: VectorClock::new(),
            ring,
        }
    }
}

/// Header name clients use to supply a stable causal-context identity.
pub const CLIENT_ID_HEADER: &str = "X-VinzClortho-ClientId";

/// Header name carrying the base64-encoded causal context: on writes,
/// supplied by the client to round-trip the clock from a prior read; on
/// reads, returned by the server as the resolved clock.
pub const CONTEXT_HEADER: &str = "X-VinzClortho-Context";

/// base64(JSON(VectorClock)), the wire form of the `X-VinzClortho-Context` header.
pub fn encode_context(clock: &VectorClock) -> crate::error::RingResult<String> {
    let json = serde_json::to_vec(clock)?;
    Ok(BASE64.encode(json))
}

/// Inverse of [`encode_context`]. A malformed header is an `InvalidContext`
/// error, externalised as HTTP 400.
pub fn decode_context(header: &str) -> crate::error::RingResult<VectorClock> {
    let bytes = BASE64
        .decode(header)
        .map_err(|e| crate::error::RingError::InvalidContext(e.to_string()))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| crate::error::RingError::InvalidContext(e.to_string()))
}

/// Node-level configuration, assembled from CLI flags in `bin/ringd.rs`
/// (or directly by tests). Defaults mirror the component design in
/// `SPEC_FULL.md` §3/§4.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address this node binds its HTTP surface to and advertises to peers.
    pub bind_addr: SocketAddr,
    /// An existing cluster member to gossip-join through, if any.
    pub join_addr: Option<SocketAddr>,
    /// Explicit initial claim count; `None` lets the ring decide.
    pub claim: Option<usize>,
    /// Fixed partition count `P`.
    pub partitions: u32,
    /// Configured replica factor `N`.
    pub replicas: usize,
    /// Read quorum `R`.
    pub read_quorum: usize,
    /// Write quorum `W`.
    pub write_quorum: usize,
    /// Worker pool size backing [`crate::storage::LocalStorage`].
    pub worker_pool_size: usize,
    /// Gossip tick interval.
    pub gossip_interval: Duration,
    /// Handoff-check tick interval.
    pub handoff_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7878".parse().unwrap(),
            join_addr: None,
            claim: None,
            partitions: crate::ring::DEFAULT_PARTITIONS,
            replicas: crate::ring::DEFAULT_REPLICAS,
            read_quorum: 2,
            write_quorum: 2,
            worker_pool_size: 10,
            gossip_interval: Duration::from_secs(30),
            handoff_interval: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_round_trips() {
        let mut clock = VectorClock::new();
        clock.increment("client-a");
        let encoded = encode_context(&clock).unwrap();
        let decoded = decode_context(&encoded).unwrap();
        assert_eq!(clock, decoded);
    }

    #[test]
    fn malformed_context_is_invalid() {
        assert!(decode_context("not valid base64!!").is_err());
    }

    #[test]
    fn node_config_defaults_match_component_design() {
        let config = NodeConfig::default();
        assert_eq!(config.partitions, 1024);
        assert_eq!(config.replicas, 3);
        assert_eq!(config.read_quorum, 2);
        assert_eq!(config.write_quorum, 2);
        assert_eq!(config.worker_pool_size, 10);
    }
}
