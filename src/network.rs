//! The remote replica adapter: talks to a peer node's internal HTTP
//! surface (`/_localstore`, `/_metadata`, `/_handoff`) so the quorum
//! coordinator, gossip, and handoff engine can treat a remote replica the
//! same way they treat a local one.
use crate::error::{RingError, RingResult};
use crate::ring::Node;
use crate::types::Metadata;
use crate::vector_clock::Stamped;

/// A handle to one peer's internal HTTP API. Cheap to construct and
/// clone — it just wraps a shared `reqwest::Client` and a base URL.
#[derive(Clone)]
pub struct RemoteStorage {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteStorage {
    pub fn new(client: reqwest::Client, node: &Node) -> Self {
        Self {
            client,
            base_url: format!("http://{}:{}", node.host, node.port),
        }
    }

    fn peer(&self) -> String {
        self.base_url.clone()
    }

    fn localstore_url(&self, key: &[u8]) -> String {
        format!("{}/_localstore/{}", self.base_url, urlencoding_escape(key))
    }

    /// `GET /_localstore/:key` on the peer. `Ok(None)` means the peer has
    /// no entry for this key (HTTP 404); any other non-2xx status or
    /// transport failure is a `Transport` error, which callers fold into
    /// a failed-replica count rather than propagating.
    pub async fn get(&self, key: &[u8]) -> RingResult<Option<Stamped>> {
        let response = self
            .client
            .get(self.localstore_url(key))
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RingError::Transport {
                peer: self.peer(),
                reason: format!("unexpected status {}", response.status()),
            });
        }
        let stamped: Stamped = response.json().await.map_err(|e| self.transport_err(e))?;
        Ok(Some(stamped))
    }

    /// `PUT /_localstore/:key` on the peer with the given stamped value.
    pub async fn put(&self, key: &[u8], stamped: &Stamped) -> RingResult<()> {
        let response = self
            .client
            .put(self.localstore_url(key))
            .json(stamped)
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        if !response.status().is_success() {
            return Err(RingError::Transport {
                peer: self.peer(),
                reason: format!("unexpected status {}", response.status()),
            });
        }
        Ok(())
    }

    /// `DELETE /_localstore/:key` on the peer. Used only by handoff
    /// retirement, never by client-facing deletes (those are tombstone
    /// writes through `put`).
    pub async fn delete(&self, key: &[u8]) -> RingResult<()> {
        let response = self
            .client
            .delete(self.localstore_url(key))
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        if !response.status().is_success() {
            return Err(RingError::Transport {
                peer: self.peer(),
                reason: format!("unexpected status {}", response.status()),
            });
        }
        Ok(())
    }

    /// `GET /_metadata` on the peer: the gossip pull.
    pub async fn fetch_metadata(&self) -> RingResult<Metadata> {
        let response = self
            .client
            .get(format!("{}/_metadata", self.base_url))
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        if !response.status().is_success() {
            return Err(RingError::Transport {
                peer: self.peer(),
                reason: format!("unexpected status {}", response.status()),
            });
        }
        response.json().await.map_err(|e| self.transport_err(e))
    }

    /// `PUT /_metadata` on the peer: push a locally-dominant view back.
    pub async fn push_metadata(&self, metadata: &Metadata) -> RingResult<()> {
        let response = self
            .client
            .put(format!("{}/_metadata", self.base_url))
            .json(metadata)
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        if !response.status().is_success() {
            return Err(RingError::Transport {
                peer: self.peer(),
                reason: format!("unexpected status {}", response.status()),
            });
        }
        Ok(())
    }

    /// `PUT /_handoff` on the peer with one partition's worth of a chunk.
    /// An empty `entries` list signals the end of the stream for that
    /// partition.
    pub async fn send_handoff(
        &self,
        partition: u32,
        entries: Vec<(Vec<u8>, Stamped)>,
    ) -> RingResult<()> {
        let body = HandoffChunk { partition, entries };
        let response = self
            .client
            .put(format!("{}/_handoff", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        if !response.status().is_success() {
            return Err(RingError::Transport {
                peer: self.peer(),
                reason: format!("unexpected status {}", response.status()),
            });
        }
        Ok(())
    }

    fn transport_err(&self, e: reqwest::Error) -> RingError {
        RingError::Transport {
            peer: self.peer(),
            reason: e.to_string(),
        }
    }
}

/// Wire body for `PUT /_handoff`. Keys are arbitrary bytes, so entries
/// are carried as base64-encoded key / stamped-value pairs rather than
/// relying on `Vec<u8>`'s wasteful default JSON-array-of-numbers encoding.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HandoffChunk {
    pub partition: u32,
    #[serde(with = "byte_pairs")]
    pub entries: Vec<(Vec<u8>, Stamped)>,
}

mod byte_pairs {
    use crate::vector_clock::Stamped;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Entry {
        key: String,
        stamped: Stamped,
    }

    pub fn serialize<S: Serializer>(
        entries: &[(Vec<u8>, Stamped)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let wire: Vec<Entry> = entries
            .iter()
            .map(|(k, s)| Entry {
                key: BASE64.encode(k),
                stamped: s.clone(),
            })
            .collect();
        wire.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(Vec<u8>, Stamped)>, D::Error> {
        let wire = Vec::<Entry>::deserialize(deserializer)?;
        wire.into_iter()
            .map(|e| {
                BASE64
                    .decode(&e.key)
                    .map(|k| (k, e.stamped))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// Percent-encode a raw byte key for use as a URL path segment. Keys are
/// arbitrary bytes; this keeps `/_localstore/:key` well-formed without
/// assuming keys are valid UTF-8 text.
pub fn urlencoding_escape(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len() * 3);
    for &byte in key {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Inverse of [`urlencoding_escape`]: turns a URL path segment back into
/// the raw key bytes it was encoded from.
pub fn urlencoding_unescape(segment: &str) -> Vec<u8> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(value) = u8::from_str_radix(hex, 16) {
                    out.push(value);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}
