//! nftwatch - NFT transfer indexer.
//!
//! Consumes block-number notifications from a queue, fetches the block's
//! transfer-family logs over JSON-RPC, classifies the emitting contracts,
//! decodes ERC-721, ERC-1155 and CryptoPunks transfers, and keeps a
//! convergent record of token ownership and transfer history.

pub mod consumer;
pub mod etl;
pub mod lifecycle;
pub mod queue;
pub mod storage;

// Re-export for decoder authors
pub use async_trait::async_trait;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use url::Url;

use consumer::{Consumer, ConsumerStats};
use etl::event::SourceTag;
use etl::provider::{ChainProvider, FatalHook, JsonRpcProvider, ProviderPool};
use etl::{Decoder, DecoderContext};
use lifecycle::BlockProcessor;
use queue::{MessageQueue, SqliteQueue};
use storage::{NftStore, SqliteStore};

/// Configuration for the monitor.
pub struct MonitorConfig {
    /// Chain label, used in logs.
    pub network: String,

    /// JSON-RPC endpoints in priority order.
    pub rpc_urls: Vec<Url>,

    /// Extra providers appended after the JSON-RPC endpoints.
    pub providers: Vec<Arc<dyn ChainProvider>>,

    /// Decoders, at most one per token standard.
    pub decoders: Vec<Arc<dyn Decoder>>,

    /// Processing mode stamped onto token and collection records.
    pub source: SourceTag,

    /// SQLite path for the document store.
    ///
    /// Ignored when a store is supplied with `with_store()`.
    pub database_path: PathBuf,

    /// SQLite path for the queue. Defaults to `database_path`.
    pub queue_path: Option<PathBuf>,

    /// Pre-built store (tests, alternative backends).
    pub store: Option<Arc<dyn NftStore>>,

    /// Pre-built queue (tests, alternative backends).
    pub queue: Option<Arc<dyn MessageQueue>>,

    /// Records per write chunk (default: 500).
    pub write_batch_size: usize,

    /// Messages per receive (default: 10).
    pub max_messages: usize,

    /// Sleep between receives when the queue is empty (default: 1s).
    pub poll_interval: Duration,

    /// How long a received message stays hidden (default: 300s).
    pub visibility_timeout: Duration,

    /// HTTP request timeout for JSON-RPC calls (default: 30s).
    pub rpc_timeout: Duration,

    /// Interval of the provider pointer reset (default: 24h).
    pub provider_reset_interval: Duration,

    /// Graceful shutdown timeout in seconds (default: 30).
    ///
    /// When a shutdown signal is received, the system waits up to this
    /// duration for the in-flight message to complete.
    pub shutdown_timeout: u64,

    /// Replaces the pool's exit-on-exhaustion hook.
    pub fatal_hook: Option<FatalHook>,
}

impl MonitorConfig {
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::default()
    }

    fn queue_path(&self) -> PathBuf {
        self.queue_path
            .clone()
            .unwrap_or_else(|| self.database_path.clone())
    }
}

/// Builder for MonitorConfig.
#[derive(Default)]
pub struct MonitorConfigBuilder {
    network: Option<String>,
    rpc_urls: Vec<Url>,
    providers: Vec<Arc<dyn ChainProvider>>,
    decoders: Vec<Arc<dyn Decoder>>,
    source: Option<SourceTag>,
    database_path: Option<PathBuf>,
    queue_path: Option<PathBuf>,
    store: Option<Arc<dyn NftStore>>,
    queue: Option<Arc<dyn MessageQueue>>,
    write_batch_size: Option<usize>,
    max_messages: Option<usize>,
    poll_interval: Option<Duration>,
    visibility_timeout: Option<Duration>,
    rpc_timeout: Option<Duration>,
    provider_reset_interval: Option<Duration>,
    shutdown_timeout: Option<u64>,
    fatal_hook: Option<FatalHook>,
}

impl MonitorConfigBuilder {
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Adds a JSON-RPC endpoint. Order of calls is priority order.
    pub fn rpc_url(mut self, url: Url) -> Self {
        self.rpc_urls.push(url);
        self
    }

    pub fn rpc_urls(mut self, urls: impl IntoIterator<Item = Url>) -> Self {
        self.rpc_urls.extend(urls);
        self
    }

    /// Adds a provider after the JSON-RPC endpoints.
    pub fn add_provider(mut self, provider: Arc<dyn ChainProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn add_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoders.push(decoder);
        self
    }

    pub fn source(mut self, source: SourceTag) -> Self {
        self.source = Some(source);
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn queue_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_path = Some(path.into());
        self
    }

    pub fn with_store(mut self, store: Arc<dyn NftStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn write_batch_size(mut self, size: usize) -> Self {
        self.write_batch_size = Some(size);
        self
    }

    pub fn max_messages(mut self, max: usize) -> Self {
        self.max_messages = Some(max);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn provider_reset_interval(mut self, interval: Duration) -> Self {
        self.provider_reset_interval = Some(interval);
        self
    }

    /// Sets the graceful shutdown timeout in seconds.
    pub fn shutdown_timeout(mut self, seconds: u64) -> Self {
        self.shutdown_timeout = Some(seconds);
        self
    }

    pub fn fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = Some(hook);
        self
    }

    pub fn build(self) -> MonitorConfig {
        MonitorConfig {
            network: self.network.unwrap_or_else(|| "mainnet".to_string()),
            rpc_urls: self.rpc_urls,
            providers: self.providers,
            decoders: self.decoders,
            source: self.source.unwrap_or(SourceTag::Monitor),
            database_path: self
                .database_path
                .unwrap_or_else(|| PathBuf::from("nftwatch.db")),
            queue_path: self.queue_path,
            store: self.store,
            queue: self.queue,
            write_batch_size: self
                .write_batch_size
                .unwrap_or(storage::sqlite::DEFAULT_WRITE_BATCH_SIZE),
            max_messages: self.max_messages.unwrap_or(10),
            poll_interval: self.poll_interval.unwrap_or(Duration::from_secs(1)),
            visibility_timeout: self
                .visibility_timeout
                .unwrap_or(queue::sqlite::DEFAULT_VISIBILITY_TIMEOUT),
            rpc_timeout: self.rpc_timeout.unwrap_or(Duration::from_secs(30)),
            provider_reset_interval: self
                .provider_reset_interval
                .unwrap_or(Duration::from_secs(24 * 60 * 60)),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(30),
            fatal_hook: self.fatal_hook,
        }
    }
}

/// Starts the monitor and runs until SIGINT/SIGTERM or a fatal provider failure.
///
/// NOTE: The caller is responsible for initializing the tracing subscriber before calling this function.
pub async fn run(config: MonitorConfig) -> anyhow::Result<ConsumerStats> {
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    let signal_task = tokio::spawn(async move {
        wait_for_signal().await;
        signal_token.cancel();
    });

    let result = run_until(config, shutdown).await;
    signal_task.abort();
    result
}

/// Starts the monitor and runs until `shutdown` is cancelled or a fatal
/// provider failure stops the consumer.
pub async fn run_until(
    config: MonitorConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<ConsumerStats> {
    tracing::info!(
        target: "nftwatch::main",
        network = %config.network,
        source = %config.source,
        "Starting nftwatch with {} endpoint(s) and {} decoder(s)",
        config.rpc_urls.len() + config.providers.len(),
        config.decoders.len()
    );

    let mut providers: Vec<Arc<dyn ChainProvider>> = Vec::new();
    for url in &config.rpc_urls {
        let provider = JsonRpcProvider::new(url.clone(), config.rpc_timeout)
            .with_context(|| format!("invalid RPC endpoint {url}"))?;
        providers.push(Arc::new(provider));
    }
    providers.extend(config.providers.iter().cloned());

    let mut pool = ProviderPool::new(providers)?;
    if let Some(hook) = config.fatal_hook.clone() {
        pool = pool.with_fatal_hook(hook);
    }
    let pool = Arc::new(pool);

    let active = pool.connect().await?;
    tracing::info!(target: "nftwatch::main", endpoint = active.endpoint(), "Connected to provider");

    let store: Arc<dyn NftStore> = match config.store.clone() {
        Some(store) => store,
        None => Arc::new(SqliteStore::open(&config.database_path, config.write_batch_size)?),
    };
    let queue: Arc<dyn MessageQueue> = match config.queue.clone() {
        Some(queue) => queue,
        None => Arc::new(SqliteQueue::open(config.queue_path(), config.visibility_timeout)?),
    };

    let decoders = DecoderContext::new(config.decoders)?;
    let processor = Arc::new(BlockProcessor::new(pool.clone(), decoders, store, config.source));
    let consumer = Consumer::new(queue, processor, config.max_messages, config.poll_interval);

    let reset_handle = pool.spawn_daily_reset(config.provider_reset_interval, shutdown.clone());

    let consumer_token = shutdown.clone();
    let mut consumer_handle = tokio::spawn(async move { consumer.run(consumer_token).await });

    let outcome = tokio::select! {
        joined = &mut consumer_handle => Some(joined),
        () = shutdown.cancelled() => None,
    };

    let joined = match outcome {
        Some(joined) => joined,
        None => {
            tracing::info!(target: "nftwatch::main", "Waiting for in-flight message to complete...");
            match tokio::time::timeout(Duration::from_secs(config.shutdown_timeout), consumer_handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(
                        target: "nftwatch::main",
                        "Consumer did not complete within {}s timeout, forcing shutdown",
                        config.shutdown_timeout
                    );
                    reset_handle.abort();
                    anyhow::bail!("consumer did not stop within {}s", config.shutdown_timeout);
                }
            }
        }
    };

    // Stops the reset task when the consumer ended on its own.
    shutdown.cancel();
    if let Err(e) = reset_handle.await {
        tracing::warn!(target: "nftwatch::main", "Provider reset task panicked: {}", e);
    }

    let stats = joined.context("consumer task panicked")??;
    tracing::info!(
        target: "nftwatch::main",
        handled = stats.handled(),
        "nftwatch shutdown complete"
    );
    Ok(stats)
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(target: "nftwatch::main", "Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(target: "nftwatch::main", "Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!(target: "nftwatch::main", "Received SIGINT (Ctrl+C), initiating graceful shutdown...");
        }
        () = terminate => {
            tracing::info!(target: "nftwatch::main", "Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
