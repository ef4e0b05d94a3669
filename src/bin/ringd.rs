/// ringd — command-line tool for the ring cluster.
///
/// `ringd serve` starts a cluster node; the rest of the subcommands are a
/// thin HTTP client talking to a running node's `/store`, `/admin/*` and
/// `/_metadata` surfaces, in the same split the teacher CLI uses between
/// its cluster-node mode and its remote `HttpClient`.
///
/// Usage:
///   ringd serve [--bind host:port] [--join host:port] [--claim N]  - Start a node
///   ringd get <key>                                                - GET a key
///   ringd put <key> <value> [--context <ctx>] [--client-id <id>]   - PUT a key
///   ringd delete <key> [--context <ctx>]                           - DELETE (tombstone)
///   ringd status                                                   - This node's claim count
///   ringd claim <wanted> [--force]                                 - Set wanted claim
///   ringd balance                                                  - Trigger rebalance
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ringd::types::NodeConfig;
use ringd::{Engine, Ring};
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;

const DEFAULT_URL: &str = "http://127.0.0.1:7878";

/// HTTP client for remote ringd operations.
struct HttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClient {
    fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, key: &str) -> Result<(JsonValue, Option<String>)> {
        let url = format!("{}/store/{}", self.base_url, key);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("key not found: {}", key);
        }
        let context = response
            .headers()
            .get(ringd::types::CONTEXT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let multi = response.status() == reqwest::StatusCode::MULTIPLE_CHOICES;
        let body: JsonValue = response.error_for_status()?.json().await?;
        if multi {
            println!("note: concurrent siblings returned — resolve before writing back");
        }
        Ok((body, context))
    }

    async fn put(
        &self,
        key: &str,
        value: JsonValue,
        context: Option<&str>,
        client_id: Option<&str>,
    ) -> Result<Option<String>> {
        let url = format!("{}/store/{}", self.base_url, key);
        let mut request = self.client.put(&url).json(&value);
        if let Some(ctx) = context {
            request = request.header(ringd::types::CONTEXT_HEADER, ctx);
        }
        if let Some(id) = client_id {
            request = request.header(ringd::types::CLIENT_ID_HEADER, id);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response
            .headers()
            .get(ringd::types::CONTEXT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }

    async fn delete(&self, key: &str, context: Option<&str>) -> Result<()> {
        let url = format!("{}/store/{}", self.base_url, key);
        let mut request = self.client.delete(&url);
        if let Some(ctx) = context {
            request = request.header(ringd::types::CONTEXT_HEADER, ctx);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }

    async fn claim(&self) -> Result<usize> {
        let url = format!("{}/admin/claim", self.base_url);
        let response: JsonValue = self.client.get(&url).send().await?.error_for_status()?.json().await?;
        Ok(response.get("claim").and_then(|v| v.as_u64()).unwrap_or(0) as usize)
    }

    async fn set_claim(&self, wanted: usize, force: bool) -> Result<usize> {
        let url = format!("{}/admin/claim", self.base_url);
        let body = serde_json::json!({ "wanted": wanted, "force": force });
        let response: JsonValue = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.get("claim").and_then(|v| v.as_u64()).unwrap_or(0) as usize)
    }

    async fn balance(&self) -> Result<()> {
        let url = format!("{}/admin/balance", self.base_url);
        self.client.put(&url).send().await?.error_for_status()?;
        Ok(())
    }

    async fn ring(&self) -> Result<Ring> {
        let url = format!("{}/_metadata", self.base_url);
        let metadata: ringd::types::Metadata =
            self.client.get(&url).send().await?.error_for_status()?.json().await?;
        Ok(metadata.ring)
    }
}

/// ringd — a Dynamo-style distributed key/value store.
#[derive(Parser)]
#[command(name = "ringd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Base URL of a running node for remote commands (e.g. http://localhost:7878)
    #[arg(short, long, global = true, default_value = DEFAULT_URL)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster node
    Serve {
        /// Address this node binds to and advertises to peers
        #[arg(short, long, default_value = "127.0.0.1:7878")]
        bind: String,

        /// Address of an existing node to join via gossip
        #[arg(short, long)]
        join: Option<String>,

        /// Explicit initial claim count (default: let the ring decide)
        #[arg(long)]
        claim: Option<usize>,

        /// Fixed partition count P
        #[arg(long, default_value_t = ringd::ring::DEFAULT_PARTITIONS)]
        partitions: u32,

        /// Replica factor N
        #[arg(long, default_value_t = ringd::ring::DEFAULT_REPLICAS)]
        replicas: usize,

        /// Read quorum R
        #[arg(long, default_value_t = 2)]
        read_quorum: usize,

        /// Write quorum W
        #[arg(long, default_value_t = 2)]
        write_quorum: usize,

        /// Storage worker pool size
        #[arg(long, default_value_t = 10)]
        workers: usize,

        /// Gossip tick interval, in seconds
        #[arg(long, default_value_t = 30)]
        gossip_interval: u64,

        /// Handoff-check tick interval, in seconds
        #[arg(long, default_value_t = 10)]
        handoff_interval: u64,

        /// Log level (error, warn, info, debug, trace)
        #[arg(long, default_value = "info")]
        log: String,
    },

    /// GET a value
    Get {
        /// Key to read
        key: String,
    },

    /// PUT a value
    Put {
        /// Key to write
        key: String,

        /// Value to store (JSON)
        value: String,

        /// Causal context from a prior GET, to round-trip (base64)
        #[arg(long)]
        context: Option<String>,

        /// Stable client identity for the vector clock
        #[arg(long)]
        client_id: Option<String>,
    },

    /// DELETE a value (writes a tombstone)
    Delete {
        /// Key to delete
        key: String,

        /// Causal context from a prior GET, to round-trip (base64)
        #[arg(long)]
        context: Option<String>,
    },

    /// Show this node's claim count and cluster size
    Status,

    /// Set this node's wanted claim count
    Claim {
        /// Target claim count
        wanted: usize,

        /// Force the shrink even if no recipient respects the replication constraint
        #[arg(long)]
        force: bool,
    },

    /// Trigger the ring's operator balance pass
    Balance,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Serve {
        bind,
        join,
        claim,
        partitions,
        replicas,
        read_quorum,
        write_quorum,
        workers,
        gossip_interval,
        handoff_interval,
        log,
    } = &cli.command
    {
        ringd::init_logging_with_level(log);
        return run_server(
            bind,
            join.as_deref(),
            *claim,
            *partitions,
            *replicas,
            *read_quorum,
            *write_quorum,
            *workers,
            *gossip_interval,
            *handoff_interval,
        )
        .await;
    }

    let client = HttpClient::new(cli.url);
    match cli.command {
        Commands::Get { key } => {
            let (value, context) = client.get(&key).await.context("GET failed")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            if let Some(ctx) = context {
                println!("context: {ctx}");
            }
        }
        Commands::Put {
            key,
            value,
            context,
            client_id,
        } => {
            let json_value: JsonValue =
                serde_json::from_str(&value).with_context(|| format!("invalid JSON value: {value}"))?;
            let context = client
                .put(&key, json_value, context.as_deref(), client_id.as_deref())
                .await
                .context("PUT failed")?;
            println!("ok");
            if let Some(ctx) = context {
                println!("context: {ctx}");
            }
        }
        Commands::Delete { key, context } => {
            client.delete(&key, context.as_deref()).await.context("DELETE failed")?;
            println!("ok");
        }
        Commands::Status => {
            let claim = client.claim().await.context("status failed")?;
            let ring = client.ring().await.context("status failed")?;
            println!("claim: {claim}");
            println!("nodes: {}", ring.node_count());
            println!("partitions: {}", ring.partitions());
            println!("effective replicas: {}", ring.effective_replicas());
        }
        Commands::Claim { wanted, force } => {
            let claim = client.set_claim(wanted, force).await.context("claim failed")?;
            println!("claim: {claim}");
        }
        Commands::Balance => {
            client.balance().await.context("balance failed")?;
            println!("ok");
        }
        Commands::Serve { .. } => unreachable!("handled above"),
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_server(
    bind: &str,
    join: Option<&str>,
    claim: Option<usize>,
    partitions: u32,
    replicas: usize,
    read_quorum: usize,
    write_quorum: usize,
    workers: usize,
    gossip_interval: u64,
    handoff_interval: u64,
) -> Result<()> {
    let bind_addr: SocketAddr = bind.parse().with_context(|| format!("invalid bind address: {bind}"))?;
    let join_addr: Option<SocketAddr> = join
        .map(|addr| addr.parse().with_context(|| format!("invalid join address: {addr}")))
        .transpose()?;

    let config = NodeConfig {
        bind_addr,
        join_addr,
        claim,
        partitions,
        replicas,
        read_quorum,
        write_quorum,
        worker_pool_size: workers,
        gossip_interval: Duration::from_secs(gossip_interval),
        handoff_interval: Duration::from_secs(handoff_interval),
    };

    let engine = Engine::new(config);
    engine.spawn_background_tasks();

    tracing::info!(node = engine.self_key(), %bind_addr, join = ?join_addr, "starting ringd node");

    tokio::select! {
        result = ringd::http::serve(engine.clone(), bind_addr) => {
            result.context("HTTP server error")?;
        }
        _ = signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    engine.shutdown();
    Ok(())
}
