//! End-to-end cluster scenarios (component design §8): real nodes bound
//! to real loopback sockets, talking to each other exclusively through
//! the HTTP surface — the same path a production deployment takes.
use ringd::types::{CONTEXT_HEADER, NodeConfig};
use ringd::{Engine, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Bind a node on an OS-assigned loopback port and start its HTTP
/// surface and background gossip/handoff tasks. Returns the engine and
/// its bound address.
async fn spawn_node(mut config: NodeConfig) -> (Arc<Engine>, SocketAddr) {
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    // Bind first so we know the OS-assigned port before anyone tries to
    // reach this node, then rebuild the engine with that address as its
    // own advertised identity.
    let probe = tokio::net::TcpListener::bind(config.bind_addr).await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);
    config.bind_addr = addr;

    let engine = Engine::new(config);
    engine.spawn_background_tasks();
    let serve_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        let _ = ringd::http::serve(serve_engine, addr).await;
    });
    // Give the listener a moment to come up before the first request.
    tokio::time::sleep(Duration::from_millis(30)).await;
    (engine, addr)
}

fn base_config() -> NodeConfig {
    NodeConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        join_addr: None,
        claim: None,
        partitions: 8,
        replicas: 3,
        read_quorum: 2,
        write_quorum: 2,
        worker_pool_size: 4,
        gossip_interval: Duration::from_secs(30),
        handoff_interval: Duration::from_secs(5),
    }
}

/// Scenario (a): single node, P=8, N=3: PUT("k","v1") -> 200; GET("k") -> 200, body "v1".
#[tokio::test]
async fn single_node_put_then_get() {
    let (_engine, addr) = spawn_node(base_config()).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let response = client
        .put(format!("{base}/store/k"))
        .json(&serde_json::json!("v1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = client.get(format!("{base}/store/k")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!("v1"));
}

/// Scenario (c)/(d): two replicas independently hold concurrent versions
/// of the same key -> a GET surfaces 300 with both siblings; round-tripping
/// the 300-response context into a new PUT resolves to a single value.
///
/// The replica write path is a blind overwrite (§4.5): a single replica
/// can never disagree with itself, so genuine siblings require two
/// *distinct* replicas each holding a different concurrent version —
/// here, node1 and node2, with `replicas = 2` so both own every key.
#[tokio::test]
async fn concurrent_writes_surface_as_siblings_then_resolve() {
    let mut config1 = base_config();
    config1.replicas = 2;
    config1.read_quorum = 2;
    config1.write_quorum = 2;
    let (node1, addr1) = spawn_node(config1).await;

    let mut config2 = base_config();
    config2.replicas = 2;
    config2.read_quorum = 2;
    config2.write_quorum = 2;
    config2.join_addr = Some(addr1);
    let (node2, _addr2) = spawn_node(config2).await;

    for _ in 0..4 {
        ringd::gossip::tick(&node2).await;
        ringd::gossip::tick(&node1).await;
    }
    assert_eq!(node1.ring_snapshot().await.node_count(), 2);

    let mut clock_x = ringd::vector_clock::VectorClock::new();
    clock_x.increment("client-x");
    node1
        .local_shard_for(b"k")
        .await
        .put_stamped(b"k", &(clock_x, Value::Present(serde_json::json!("v1"))))
        .await
        .unwrap();

    let mut clock_y = ringd::vector_clock::VectorClock::new();
    clock_y.increment("client-y");
    node2
        .local_shard_for(b"k")
        .await
        .put_stamped(b"k", &(clock_y, Value::Present(serde_json::json!("v2"))))
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let base = format!("http://{addr1}");

    let response = client.get(format!("{base}/store/k")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::MULTIPLE_CHOICES);
    let context = response
        .headers()
        .get(CONTEXT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    let body: serde_json::Value = response.json().await.unwrap();
    let siblings = body.get("siblings").and_then(|v| v.as_array()).unwrap();
    assert_eq!(siblings.len(), 2);

    // The GET above triggers read-repair, but the repair writes are
    // dispatched via a detached background task rather than awaited as
    // part of the response. Give it a moment to land before the next
    // write, so it can't race with (and get overwritten by) the PUT below.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = client
        .put(format!("{base}/store/k"))
        .header(CONTEXT_HEADER, context)
        .header(ringd::types::CLIENT_ID_HEADER, "client-x")
        .json(&serde_json::json!("v3"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let response = client.get(format!("{base}/store/k")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!("v3"));
}

/// Scenario (e): a second node joins via gossip; after a couple of
/// (manually driven) ticks both rings agree, claim sets are disjoint,
/// and they cover every partition.
#[tokio::test]
async fn joining_node_converges_via_gossip() {
    let mut config1 = base_config();
    config1.partitions = 64;
    let (node1, addr1) = spawn_node(config1).await;

    let mut config2 = base_config();
    config2.partitions = 64;
    config2.join_addr = Some(addr1);
    let (node2, _addr2) = spawn_node(config2).await;

    // Node 2 doesn't know about node 1 until it gossips; node 1 doesn't
    // know about node 2 until node 2 gossips (self-insertion on pull)
    // and pushes back. Drive a few rounds deterministically rather than
    // waiting on the real interval timer.
    for _ in 0..4 {
        ringd::gossip::tick(&node2).await;
        ringd::gossip::tick(&node1).await;
    }

    let ring1 = node1.ring_snapshot().await;
    let ring2 = node2.ring_snapshot().await;
    assert_eq!(ring1.node_count(), 2);
    assert_eq!(ring2.node_count(), 2);

    let mut covered = std::collections::BTreeSet::new();
    for node in ring1.nodes() {
        covered.extend(ring1.claim(&node.key()));
    }
    assert_eq!(covered.len(), 64, "claims must cover every partition");

    let n = ring1.effective_replicas();
    assert_eq!(n, 2);
    for p in 0..ring1.partitions() {
        let owner = ring1.partition_to_node(p).unwrap().key();
        for i in 1..n as u32 {
            let q = (p + ring1.partitions() - i) % ring1.partitions();
            assert_ne!(ring1.partition_to_node(q).unwrap().key(), owner);
        }
    }
}

/// Scenario (f): operator drives a node's claim to zero; its shards move
/// to pending_shutdown and, once handoff succeeds against a reachable
/// peer, the set drains.
#[tokio::test]
async fn claim_zero_drains_via_handoff() {
    let mut config1 = base_config();
    config1.partitions = 16;
    config1.replicas = 1;
    let (node1, addr1) = spawn_node(config1).await;

    let mut config2 = base_config();
    config2.partitions = 16;
    config2.replicas = 1;
    config2.join_addr = Some(addr1);
    let (node2, _addr2) = spawn_node(config2).await;

    for _ in 0..4 {
        ringd::gossip::tick(&node2).await;
        ringd::gossip::tick(&node1).await;
    }
    node1.update_storage().await;
    assert!(node1.claim_count().await > 0);

    // Put some data that should live on node1's own partitions.
    for i in 0..20u32 {
        let key = format!("k{i}");
        node1
            .put(
                key.as_bytes(),
                "client-a",
                None,
                Value::Present(serde_json::json!(i)),
            )
            .await
            .ok();
    }

    node1.set_claim(0, true).await;
    for _ in 0..4 {
        ringd::gossip::tick(&node2).await;
        ringd::gossip::tick(&node1).await;
    }
    assert_eq!(node1.claim_count().await, 0);

    for _ in 0..20 {
        ringd::handoff::tick(&node1).await;
        if node1.pending_handoff_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(node1.pending_handoff_count(), 0, "handoff should drain node1's shards");
}
