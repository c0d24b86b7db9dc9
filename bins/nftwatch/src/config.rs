//! Command line configuration

use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use nftwatch::etl::event::SourceTag;
use url::Url;

/// Processing mode, stamped onto token and collection records.
///
/// - **Archive**: historical backfill of old blocks.
/// - **Monitor**: live blocks as they are produced.
#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum SourceArg {
    Archive,
    Monitor,
}

impl From<SourceArg> for SourceTag {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Archive => Self::Archive,
            SourceArg::Monitor => Self::Monitor,
        }
    }
}

/// NFT transfer indexer
///
/// Consumes `{"blockNum": n}` messages from the block queue and indexes the
/// ERC-721, ERC-1155 and CryptoPunks transfers of each block.
///
/// # Examples
///
/// ```bash
/// # Live monitoring with two endpoints, the second as fallback
/// nftwatch --source monitor --rpc-urls https://rpc-a.example,https://rpc-b.example
///
/// # Backfill into a separate database
/// nftwatch --source archive --database ./archive.db --rpc-urls https://archive.example
/// ```
#[derive(Parser, Debug)]
#[command(name = "nftwatch")]
#[command(about = "Index NFT transfers block by block", long_about = None)]
pub struct Config {
    /// Chain label used in logs
    #[arg(long, env = "NFTWATCH_NETWORK", default_value = "mainnet")]
    pub network: String,

    /// JSON-RPC endpoints in priority order (comma-separated)
    #[arg(long, env = "NFTWATCH_RPC_URLS", value_delimiter = ',', required = true)]
    pub rpc_urls: Vec<String>,

    /// SQLite database for owners, history, tokens, collections and tasks
    #[arg(long, env = "NFTWATCH_DATABASE", default_value = "./nftwatch.db")]
    pub database: String,

    /// SQLite database holding the block queue (defaults to --database)
    #[arg(long, env = "NFTWATCH_QUEUE_DATABASE")]
    pub queue_database: Option<String>,

    /// Records per write transaction
    #[arg(long, default_value = "500")]
    pub write_batch_size: usize,

    /// Processing mode
    #[arg(long, value_enum)]
    pub source: SourceArg,

    /// Messages per receive
    #[arg(long, default_value = "10")]
    pub max_messages: usize,

    /// Sleep between receives when the queue is empty
    #[arg(long, default_value = "1000")]
    pub poll_interval_ms: u64,

    /// How long a received message stays hidden from other consumers
    #[arg(long, default_value = "300")]
    pub visibility_timeout_secs: u64,

    /// HTTP timeout of a single JSON-RPC request
    #[arg(long, default_value = "30")]
    pub rpc_timeout_secs: u64,

    /// Hours between resets of the active endpoint back to the first one
    #[arg(long, default_value = "24", value_parser = clap::value_parser!(u64).range(1..))]
    pub provider_reset_hours: u64,

    /// Seconds to wait for the in-flight message on shutdown
    #[arg(long, default_value = "30")]
    pub shutdown_timeout: u64,
}

impl Config {
    pub fn parse_rpc_urls(&self) -> Result<Vec<Url>> {
        let urls = self
            .rpc_urls
            .iter()
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
            .map(|raw| Url::parse(raw).map_err(|e| anyhow::anyhow!("Invalid RPC URL '{raw}': {e}")))
            .collect::<Result<Vec<_>>>()?;

        if urls.is_empty() {
            bail!("At least one RPC URL is required");
        }
        Ok(urls)
    }

    pub fn provider_reset_interval(&self) -> Duration {
        Duration::from_secs(self.provider_reset_hours.saturating_mul(60 * 60))
    }
}
