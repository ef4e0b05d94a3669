//! # ringd — a Dynamo-style distributed key/value store
//!
//! **Tagline:** *consistent hashing, vector clocks, quorum reads/writes,
//! gossiped membership, partition handoff.*
//!
//! `ringd` is the core engine of a Dynamo-style peer cluster: keys are
//! partitioned across nodes by consistent hashing, replicated to `N`
//! nodes, and read/written under `R`/`W` quorum. Per-key causality is
//! tracked with vector clocks, so concurrent writes surface as sibling
//! values rather than silently clobbering one another. Cluster
//! membership is disseminated by anti-entropy gossip of a ring-metadata
//! document, and when ring ownership changes, partitions are handed off
//! to their new owners in the background.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ringd::cluster::Engine;
//! use ringd::types::NodeConfig;
//! use ringd::vector_clock::Value;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(NodeConfig::default());
//!     engine.spawn_background_tasks();
//!
//!     engine.put(b"alice", "my-client", None, Value::Present(json!({"name": "Alice"}))).await?;
//!     let (clock, value) = engine.get(b"alice").await?;
//!     println!("{value:?} at {clock:?}");
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! `ringd` is built from seven collaborating components, documented in
//! `DESIGN.md`:
//!
//! 1. [`vector_clock`] — causality tracking per (key, client), with pruning.
//! 2. [`ring`] — the consistent-hash ring: partition assignment, preferred
//!    replica lists, the claim-growth/shrink placement algorithm.
//! 3. [`storage`] — the local storage adapter: a worker-pinned, pluggable
//!    keyed byte-blob store.
//! 4. [`network`] — the remote storage adapter: the same surface as
//!    `storage`, backed by HTTP calls to a peer.
//! 5. [`coordinator`] — the quorum coordinator: GET (R-of-N with
//!    read-repair) and PUT/DELETE (W-of-N) state machines.
//! 6. [`gossip`] — periodic metadata exchange and ring reconciliation.
//! 7. [`handoff`] — detects orphaned partitions and streams them to their
//!    new owner.
//!
//! [`cluster::Engine`] ties all seven together into one node; [`http`]
//! exposes that node's external and internal HTTP surfaces.
//!
//! ## Thread Safety
//!
//! `Engine` is always held behind an `Arc` and is safe to share across
//! tasks; every mutable piece of node state (`metadata`, `pending_shutdown`,
//! the storage shard map) is either an `RwLock` or a `DashSet`/`DashMap`.

pub mod cluster;
pub mod coordinator;
pub mod error;
pub mod gossip;
pub mod handoff;
pub mod http;
pub mod network;
pub mod ring;
pub mod storage;
pub mod types;
pub mod vector_clock;

pub use cluster::Engine;
pub use error::{RingError, RingResult};
pub use ring::{Node, NodeKey, Ring};
pub use types::{Metadata, NodeConfig};
pub use vector_clock::{Value, VectorClock};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use ringd::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cluster::Engine;
    pub use crate::error::{RingError, RingResult};
    pub use crate::ring::{Node, NodeKey, Ring};
    pub use crate::types::{Metadata, NodeConfig};
    pub use crate::vector_clock::{Value, VectorClock};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// This should be called once at application startup. It configures the
/// tracing subscriber with an environment filter.
///
/// The log level can be controlled via the `RING_LOG` environment
/// variable:
/// - `RING_LOG=error` - Only errors
/// - `RING_LOG=warn` - Errors and warnings
/// - `RING_LOG=info` - General information (default)
/// - `RING_LOG=debug` - Debug information
/// - `RING_LOG=trace` - Verbose tracing (gossip/heartbeat noise)
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("RING_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level, ignoring `RING_LOG`.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
