//! nftwatch binary
//!
//! Wires the JSON-RPC provider pool, the per-standard decoders, the SQLite
//! store and the SQLite block queue, then consumes until SIGINT/SIGTERM.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use config::Config;
use nftwatch::MonitorConfig;
use nftwatch_cryptopunks::CryptoPunksDecoder;
use nftwatch_erc1155::Erc1155Decoder;
use nftwatch_erc721::Erc721Decoder;

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    let config = Config::parse();
    run_monitor(config).await
}

async fn run_monitor(config: Config) -> Result<()> {
    let rpc_urls = config.parse_rpc_urls()?;

    tracing::info!("Starting nftwatch");
    tracing::info!("Network: {}", config.network);
    tracing::info!("Source: {:?}", config.source);
    for (priority, url) in rpc_urls.iter().enumerate() {
        tracing::info!("RPC endpoint #{}: {}", priority, url.host_str().unwrap_or("?"));
    }
    tracing::info!("Database: {}", config.database);
    if let Some(queue_database) = &config.queue_database {
        tracing::info!("Queue database: {}", queue_database);
    }

    let mut builder = MonitorConfig::builder()
        .network(config.network.clone())
        .rpc_urls(rpc_urls)
        .source(config.source.into())
        .database_path(&config.database)
        .write_batch_size(config.write_batch_size)
        .max_messages(config.max_messages)
        .poll_interval(Duration::from_millis(config.poll_interval_ms))
        .visibility_timeout(Duration::from_secs(config.visibility_timeout_secs))
        .rpc_timeout(Duration::from_secs(config.rpc_timeout_secs))
        .provider_reset_interval(config.provider_reset_interval())
        .shutdown_timeout(config.shutdown_timeout)
        .add_decoder(Arc::new(Erc721Decoder::new()))
        .add_decoder(Arc::new(Erc1155Decoder::new()))
        .add_decoder(Arc::new(CryptoPunksDecoder::new()));

    if let Some(queue_database) = &config.queue_database {
        builder = builder.queue_path(queue_database);
    }

    let stats = nftwatch::run(builder.build()).await?;
    tracing::info!(
        "Handled {} message(s): {} acked, {} retry, {} error",
        stats.handled(),
        stats.acked,
        stats.retried,
        stats.errored
    );
    Ok(())
}
