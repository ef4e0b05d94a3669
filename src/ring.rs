//! The consistent-hash ring: partition assignment, preferred replica lists,
//! and the claim-growth/shrink placement algorithm.
//!
//! `Ring` owns exactly one thing per partition: which node currently owns
//! it. Everything else (claim sets, replication windows, the preferred
//! list for a key) is derived from that single `owners` array, so there is
//! never a chance for a node's claim set and the ring's ownership table to
//! drift out of sync.
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};

/// Default partition count.
pub const DEFAULT_PARTITIONS: u32 = 1024;

/// Default replica factor.
pub const DEFAULT_REPLICAS: usize = 3;

/// A node's identity string, `host:port`. Used as both the ring's node-set
/// key and the vector-clock id for metadata mutations.
pub type NodeKey = String;

/// A cluster member: its network identity plus how many partitions it wants
/// to own. `wanted` is advisory — `update_claim` reconciles actual claim
/// counts toward it, within a tolerance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
    pub wanted: usize,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16, wanted: usize) -> Self {
        Self {
            host: host.into(),
            port,
            wanted,
        }
    }

    /// Identity used for ring membership and as a vector-clock id.
    pub fn key(&self) -> NodeKey {
        format!("{}:{}", self.host, self.port)
    }
}

/// The first N owners of a key's partition walk are the primary replicas;
/// the rest of the walk (in ring order) is the fallback order used when a
/// primary is unreachable.
#[derive(Debug, Clone)]
pub struct Preferred {
    pub primary: Vec<Node>,
    pub fallbacks: Vec<Node>,
}

/// A fixed-partition consistent-hash ring with replication-aware placement.
///
/// Invariants maintained by every mutating method:
/// - every partition has exactly one owner;
/// - the union of all nodes' claim sets is `{0..partitions}`, and claim sets
///   are disjoint (both follow directly from `owners` being a total
///   function from partition to node);
/// - after `fix_constraint`, for effective replica count `n >= 2`, no
///   partition's owner also owns one of its `n - 1` immediate predecessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ring {
    partitions: u32,
    replicas: usize,
    /// `owners[p]` is the key of the node that owns partition `p`.
    owners: Vec<NodeKey>,
    nodes: BTreeMap<NodeKey, Node>,
}

impl Ring {
    pub fn new(partitions: u32, replicas: usize) -> Self {
        Self {
            partitions,
            replicas,
            owners: Vec::new(),
            nodes: BTreeMap::new(),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// `min(|nodes|, configured replica count)` — the number of distinct
    /// replicas actually achievable given the current cluster size.
    pub fn effective_replicas(&self) -> usize {
        self.replicas.min(self.nodes.len().max(1))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get_node(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn contains_node(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    /// Partitions currently owned by `key`, in ascending order.
    pub fn claim(&self, key: &str) -> Vec<u32> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.as_str() == key)
            .map(|(p, _)| p as u32)
            .collect()
    }

    pub fn partition_to_node(&self, partition: u32) -> Option<&Node> {
        self.owners
            .get(partition as usize)
            .and_then(|key| self.nodes.get(key))
    }

    /// 160-bit SHA-1 of the raw key bytes, mapped to a partition index by
    /// `floor(hash * partitions / 2^160)`. Implemented as a single
    /// multiply-with-carry pass over the big-endian digest rather than
    /// pulling in a bignum crate: multiplying a 20-byte big-endian integer
    /// by the (small) partition count and keeping only the carry bits above
    /// the original 160 is exactly `floor(hash * partitions / 2^160)`, and
    /// since the digest is strictly less than `2^160`, the result is
    /// already strictly less than `partitions` — no post-hoc clamp needed,
    /// though callers may still see the spec's clamp language applied
    /// defensively via `.min(partitions - 1)`.
    pub fn key_to_partition(&self, key: &[u8]) -> u32 {
        let digest = Sha1::digest(key);
        let mut carry: u64 = 0;
        for &byte in digest.iter().rev() {
            let product = byte as u64 * self.partitions as u64 + carry;
            carry = product >> 8;
        }
        (carry as u32).min(self.partitions.saturating_sub(1))
    }

    /// Walk partitions clockwise from `key_to_partition(key)`, collecting
    /// each partition's owner in order (duplicates allowed: neighbouring
    /// partitions may share an owner). The first `effective_replicas()`
    /// entries are primaries; the rest are fallbacks. The walk does not
    /// deduplicate owners before slicing — see the Ring module doc and
    /// `docs/DESIGN.md` for why that's intentional.
    pub fn preferred(&self, key: &[u8]) -> Preferred {
        let n = self.effective_replicas();
        let start = self.key_to_partition(key);
        let mut walk = Vec::with_capacity(self.partitions as usize);
        for i in 0..self.partitions {
            let p = (start + i) % self.partitions;
            if let Some(node) = self.partition_to_node(p) {
                walk.push(node.clone());
            }
        }
        let primary = walk.iter().take(n).cloned().collect();
        let fallbacks = walk.into_iter().skip(n).collect();
        Preferred { primary, fallbacks }
    }

    /// Partitions `node` doesn't own but must still keep data for, because
    /// it owns one of the `effective_replicas() - 1` partitions immediately
    /// preceding them in the ring (and is therefore a secondary/tertiary
    /// replica holder for that partition's shard).
    pub fn replicated(&self, node_key: &str) -> BTreeSet<u32> {
        let n = self.effective_replicas();
        let mut result = BTreeSet::new();
        if n <= 1 || self.partitions == 0 {
            return result;
        }
        for q in self.claim(node_key) {
            for i in 1..n as u32 {
                let p = (q + i) % self.partitions;
                if self.owners[p as usize] != node_key {
                    result.insert(p);
                }
            }
        }
        result
    }

    /// The `2n - 1` partitions centered on `p`: the `n - 1` before it, `p`
    /// itself, and the `n - 1` after it (mod `partitions`). Used while
    /// growing a node's claim to keep its own partitions spread out enough
    /// that it never collides with its own replication window.
    fn neighbours(&self, p: u32, n: usize) -> BTreeSet<u32> {
        let n = n as i64;
        let partitions = self.partitions as i64;
        (-(n - 1)..n)
            .map(|offset| (p as i64 + offset).rem_euclid(partitions) as u32)
            .collect()
    }

    /// Add a node to the ring. If this is the first node, it claims every
    /// partition outright (there's no one else to take them from). If an
    /// explicit `claim` is given it's adopted as-is (used for handoff-driven
    /// scenarios and tests); otherwise the node is grown to an even share
    /// of the partition space via `update_node`.
    pub fn add_node(&mut self, node: Node, claim: Option<Vec<u32>>) {
        if self.owners.is_empty() {
            self.owners = vec![String::new(); self.partitions as usize];
        }
        let key = node.key();
        let want = node.wanted;
        self.nodes.insert(key.clone(), node);

        if self.owners.iter().all(|o| o.is_empty()) {
            for owner in self.owners.iter_mut() {
                *owner = key.clone();
            }
            self.fix_constraint();
            return;
        }

        if let Some(explicit) = claim {
            for p in explicit {
                if (p as usize) < self.owners.len() {
                    self.owners[p as usize] = key.clone();
                }
            }
        } else {
            let want = if want == 0 {
                (self.partitions as usize) / (self.nodes.len())
            } else {
                want
            };
            self.update_node(&key, want, false);
        }
        self.fix_constraint();
    }

    /// Remove a node from the ring, redistributing its partitions evenly
    /// across the remaining nodes.
    pub fn remove_node(&mut self, key: &str) {
        let Some(_) = self.nodes.remove(key) else {
            return;
        };
        let orphaned = self.claim(key);
        let survivors: Vec<NodeKey> = self.nodes.keys().cloned().collect();
        if survivors.is_empty() {
            for p in orphaned {
                self.owners[p as usize] = String::new();
            }
            return;
        }
        let mut rng = rand::thread_rng();
        for p in orphaned {
            let recipient = survivors.choose(&mut rng).unwrap().clone();
            self.owners[p as usize] = recipient;
        }
        self.fix_constraint();
    }

    /// Grow or shrink `key`'s claim toward `want`, per the placement
    /// algorithm in the component design: partitions are picked at random
    /// subject to a spacing constraint (`neighbours`) so a node's own
    /// claims don't end up inside each other's replication window. If
    /// `force` is false and shrinking can't find a recipient that respects
    /// the constraint, shrinking stops early (logged); if `force` is true,
    /// the partition is handed off anyway and `fix_constraint` repairs the
    /// resulting violation afterwards.
    pub fn update_node(&mut self, key: &str, want: usize, force: bool) {
        if !self.nodes.contains_key(key) {
            return;
        }
        let n = self.effective_replicas();
        let mut rng = rand::thread_rng();
        loop {
            let current = self.claim(key);
            if current.len() >= want {
                break;
            }
            let mut unwanted: BTreeSet<u32> = BTreeSet::new();
            for p in &current {
                unwanted.extend(self.neighbours(*p, n));
            }
            let candidates: Vec<u32> = (0..self.partitions)
                .filter(|p| !unwanted.contains(p))
                .collect();
            let Some(&pick) = candidates.choose(&mut rng) else {
                tracing::warn!(node = key, "no eligible partition left to grow into");
                break;
            };
            self.owners[pick as usize] = key.to_string();
        }

        loop {
            let current = self.claim(key);
            if current.len() <= want {
                break;
            }
            let Some(&pick) = current.choose(&mut rng) else {
                break;
            };
            let window = self.neighbours(pick, n);
            let other_keys: Vec<NodeKey> = self
                .nodes
                .keys()
                .filter(|k| k.as_str() != key)
                .cloned()
                .collect();
            if other_keys.is_empty() {
                break;
            }
            let eligible: Vec<&NodeKey> = other_keys
                .iter()
                .filter(|candidate| {
                    self.claim(candidate)
                        .iter()
                        .all(|p| !window.contains(p))
                })
                .collect();
            let recipient = if let Some(&r) = eligible.choose(&mut rng) {
                r.clone()
            } else if force {
                other_keys.choose(&mut rng).unwrap().clone()
            } else {
                tracing::warn!(
                    node = key,
                    partition = pick,
                    "no recipient respects the replication constraint, stopping shrink early"
                );
                break;
            };
            self.owners[pick as usize] = recipient;
        }
        self.fix_constraint();
    }

    /// Repair the replication constraint: for every partition whose owner
    /// also owns one of its `effective_replicas() - 1` immediate
    /// predecessors, walk clockwise from it and swap ownership with the
    /// first partition whose owner falls outside that window.
    pub fn fix_constraint(&mut self) {
        let n = self.effective_replicas();
        if n <= 1 || self.partitions == 0 {
            return;
        }
        for p in 0..self.partitions {
            loop {
                let predecessors: Vec<u32> = (1..n as u32)
                    .map(|i| (p + self.partitions - i % self.partitions) % self.partitions)
                    .collect();
                let owner = self.owners[p as usize].clone();
                let violates = predecessors
                    .iter()
                    .any(|&q| self.owners[q as usize] == owner);
                if !violates {
                    break;
                }
                let window: BTreeSet<u32> = predecessors.iter().copied().chain([p]).collect();
                let mut swap_with = None;
                for step in 1..self.partitions {
                    let q = (p + step) % self.partitions;
                    if window.contains(&q) {
                        continue;
                    }
                    if self.owners[q as usize] != owner {
                        swap_with = Some(q);
                        break;
                    }
                }
                match swap_with {
                    Some(q) => self.owners.swap(p as usize, q as usize),
                    None => break,
                }
            }
        }
    }

    /// The operator-triggered balance pass: any node whose claim count
    /// differs from its `wanted` by more than the empirical threshold of 3
    /// is regrown/shrunk toward `wanted`.
    pub fn update_claim(&mut self) {
        let targets: Vec<(NodeKey, usize)> = self
            .nodes
            .iter()
            .map(|(k, n)| (k.clone(), n.wanted))
            .collect();
        for (key, wanted) in targets {
            let have = self.claim(&key).len();
            if have.abs_diff(wanted) > 3 {
                self.update_node(&key, wanted, false);
            }
        }
    }

    /// Update a node's `wanted` claim count and optionally force its claim
    /// toward a new set immediately (used by `/admin/claim`).
    pub fn set_wanted(&mut self, key: &str, wanted: usize, force: bool) {
        if let Some(node) = self.nodes.get_mut(key) {
            node.wanted = wanted;
        }
        self.update_node(key, wanted, force);
    }
}
