//! The local storage adapter: a pluggable keyed byte-blob store wrapped
//! by a worker pool that pins each partition to exactly one worker,
//! giving serialised access without per-shard locking.
//!
//! `ByteStore` is the pluggable collaborator the specification treats as
//! external (§1, §4.3): the durable embedded-KV-backed implementation is
//! out of scope here. [`MemoryByteStore`] is the in-memory reference
//! implementation the core ships for tests and standalone operation.
use crate::error::{RingError, RingResult};
use crate::vector_clock::{self, Stamped};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A keyed byte-blob map: the collaborator local storage is built on top
/// of. Async so a durable implementation can do real I/O without
/// blocking the worker that owns it.
#[async_trait]
pub trait ByteStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    async fn put(&self, key: Vec<u8>, value: Vec<u8>);
    async fn delete(&self, key: &[u8]);
    /// All entries currently in the store, in no particular order.
    async fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)>;
    async fn len(&self) -> usize;
}

/// `HashMap`-backed in-memory [`ByteStore`]. The reference implementation
/// used for tests and for running a node with no durable persistence.
#[derive(Debug, Default)]
pub struct MemoryByteStore {
    map: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryByteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ByteStore for MemoryByteStore {
    async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.map.insert(key, value);
    }

    async fn delete(&self, key: &[u8]) {
        self.map.remove(key);
    }

    async fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    async fn len(&self) -> usize {
        self.map.len()
    }
}

/// A unit of work dispatched to a partition's pinned worker.
enum Op {
    Get {
        key: Vec<u8>,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        reply: oneshot::Sender<()>,
    },
    Delete {
        key: Vec<u8>,
        reply: oneshot::Sender<()>,
    },
    /// Handoff-in: apply each `(key, Stamped)` via `resolve_list_extend`
    /// against whatever is already stored at that key.
    MultiPut {
        entries: Vec<(Vec<u8>, Stamped)>,
        reply: oneshot::Sender<()>,
    },
    /// Snapshot every entry in the shard, for `get_all` chunking.
    Entries {
        reply: oneshot::Sender<Vec<(Vec<u8>, Vec<u8>)>>,
    },
    /// Drop the shard's backing store (handoff-out complete).
    Retire { reply: oneshot::Sender<()> },
}

struct Command {
    partition: u32,
    op: Op,
}

/// A fixed pool of worker tasks, each processing commands for the
/// partitions assigned to it strictly in arrival order. Partition `p` is
/// always routed to worker `p mod pool_size`, so a partition's ops are
/// totally ordered without any lock on the shard itself.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Command>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Arc<Self> {
        let size = size.max(1);
        let mut senders = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = mpsc::channel(256);
            tokio::spawn(worker_loop(rx));
            senders.push(tx);
        }
        Arc::new(Self { senders })
    }

    fn sender_for(&self, partition: u32) -> &mpsc::Sender<Command> {
        &self.senders[(partition as usize) % self.senders.len()]
    }

    /// A handle to the [`LocalStorage`] for a given partition. Cheap:
    /// shards are created lazily inside the worker on first use.
    pub fn shard(self: &Arc<Self>, partition: u32) -> LocalStorage {
        LocalStorage {
            partition,
            pool: Arc::clone(self),
        }
    }
}

async fn worker_loop(mut rx: mpsc::Receiver<Command>) {
    let mut shards: HashMap<u32, Box<dyn ByteStore>> = HashMap::new();
    while let Some(Command { partition, op }) = rx.recv().await {
        let store = shards
            .entry(partition)
            .or_insert_with(|| Box::new(MemoryByteStore::new()));
        match op {
            Op::Get { key, reply } => {
                let _ = reply.send(store.get(&key).await);
            }
            Op::Put { key, value, reply } => {
                store.put(key, value).await;
                let _ = reply.send(());
            }
            Op::Delete { key, reply } => {
                store.delete(&key).await;
                let _ = reply.send(());
            }
            Op::MultiPut { entries, reply } => {
                for (key, (clock, value)) in entries {
                    let merged = match store.get(&key).await {
                        Some(existing_bytes) => {
                            match decode_stamped(&existing_bytes) {
                                Ok(current) => {
                                    vector_clock::resolve(
                                        current,
                                        (clock, value),
                                        vector_clock::extend_siblings,
                                    )
                                }
                                // Corrupt/undecodable existing entry: the
                                // incoming write wins rather than wedging handoff.
                                Err(_) => (clock, value),
                            }
                        }
                        None => (clock, value),
                    };
                    if let Ok(bytes) = encode_stamped(&merged) {
                        store.put(key, bytes).await;
                    }
                }
                let _ = reply.send(());
            }
            Op::Entries { reply } => {
                let _ = reply.send(store.entries().await);
            }
            Op::Retire { reply } => {
                shards.remove(&partition);
                let _ = reply.send(());
            }
        }
    }
}

/// Encode a `(VectorClock, Value)` pair as its wire byte form.
pub fn encode_stamped(stamped: &Stamped) -> RingResult<Vec<u8>> {
    Ok(serde_json::to_vec(stamped)?)
}

/// Decode the wire byte form back into a `(VectorClock, Value)` pair.
pub fn decode_stamped(bytes: &[u8]) -> RingResult<Stamped> {
    Ok(serde_json::from_slice(bytes)?)
}

/// A live local storage handle bound to one partition. Every call is
/// dispatched through the owning [`WorkerPool`] worker and completes
/// asynchronously via a `oneshot` reply — the Rust analogue of the
/// base design's callback-completed async storage calls.
#[derive(Clone)]
pub struct LocalStorage {
    partition: u32,
    pool: Arc<WorkerPool>,
}

impl LocalStorage {
    pub fn partition(&self) -> u32 {
        self.partition
    }

    async fn dispatch(&self, op: Op) {
        let sender = self.pool.sender_for(self.partition).clone();
        let _ = sender
            .send(Command {
                partition: self.partition,
                op,
            })
            .await;
    }

    /// Fetch the raw stored blob for `key`, or `None` if absent.
    pub async fn get(&self, key: &[u8]) -> RingResult<Option<Vec<u8>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(Op::Get {
            key: key.to_vec(),
            reply: reply_tx,
        })
        .await;
        reply_rx
            .await
            .map_err(|_| RingError::Server("storage worker dropped reply".into()))
    }

    /// Fetch and decode a `(VectorClock, Value)` pair, failing with
    /// `NotFound` if the key is absent.
    pub async fn get_stamped(&self, key: &[u8]) -> RingResult<Stamped> {
        match self.get(key).await? {
            Some(bytes) => decode_stamped(&bytes),
            None => Err(RingError::NotFound(String::from_utf8_lossy(key).into_owned())),
        }
    }

    /// Store the raw blob for `key`.
    pub async fn put(&self, key: &[u8], value: Vec<u8>) -> RingResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(Op::Put {
            key: key.to_vec(),
            value,
            reply: reply_tx,
        })
        .await;
        reply_rx
            .await
            .map_err(|_| RingError::Server("storage worker dropped reply".into()))
    }

    /// Encode and store a `(VectorClock, Value)` pair.
    pub async fn put_stamped(&self, key: &[u8], stamped: &Stamped) -> RingResult<()> {
        self.put(key, encode_stamped(stamped)?).await
    }

    /// Remove `key` outright. Clients never call this directly (deletes
    /// are tombstone writes, §1); this is used only when retiring data
    /// already handed off.
    pub async fn delete(&self, key: &[u8]) -> RingResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(Op::Delete {
            key: key.to_vec(),
            reply: reply_tx,
        })
        .await;
        reply_rx
            .await
            .map_err(|_| RingError::Server("storage worker dropped reply".into()))
    }

    /// Apply a batch of incoming `(key, Stamped)` pairs (handoff-in).
    /// Each is resolved against whatever is already stored at that key
    /// using the sibling-extending joiner: causally-dominated incoming
    /// values are dropped, concurrent ones become siblings, and
    /// strictly-newer ones overwrite. Clients never call this directly.
    pub async fn multi_put(&self, entries: Vec<(Vec<u8>, Stamped)>) -> RingResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(Op::MultiPut {
            entries,
            reply: reply_tx,
        })
        .await;
        reply_rx
            .await
            .map_err(|_| RingError::Server("storage worker dropped reply".into()))
    }

    /// Stream every entry in the shard in chunks of at most
    /// `threshold_bytes` (measured over key+value lengths), invoking
    /// `callback` once per chunk. The final call receives an empty
    /// `Vec`, signalling completion — iteration order is unspecified.
    pub async fn get_all<F, Fut>(&self, threshold_bytes: usize, mut callback: F) -> RingResult<()>
    where
        F: FnMut(Vec<(Vec<u8>, Vec<u8>)>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(Op::Entries { reply: reply_tx }).await;
        let entries = reply_rx
            .await
            .map_err(|_| RingError::Server("storage worker dropped reply".into()))?;

        let mut chunk = Vec::new();
        let mut chunk_bytes = 0usize;
        for (key, value) in entries {
            let entry_bytes = key.len() + value.len();
            if !chunk.is_empty() && chunk_bytes + entry_bytes > threshold_bytes.max(1) {
                callback(std::mem::take(&mut chunk)).await;
                chunk_bytes = 0;
            }
            chunk_bytes += entry_bytes;
            chunk.push((key, value));
        }
        if !chunk.is_empty() {
            callback(chunk).await;
        }
        callback(Vec::new()).await;
        Ok(())
    }

    /// Retire this shard: drop its backing store from the worker. Called
    /// once handoff-out has pushed the last key to the new owner.
    pub async fn retire(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.dispatch(Op::Retire { reply: reply_tx }).await;
        let _ = reply_rx.await;
    }
}
