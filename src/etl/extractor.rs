//! Per-block log extraction.

use std::sync::Arc;

use crate::etl::event::{EventKind, RawLog};
use crate::etl::provider::{LogFilter, ProviderError, ProviderPool};

/// Result of fetching one block's transfer-family logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// No transfer-family log in the block. Not an error.
    Empty,
    /// Logs in on-chain `logIndex` order.
    Logs(Vec<RawLog>),
}

/// Fetches the transfer-family logs of a single block through the provider pool.
pub struct BlockLogFetcher {
    pool: Arc<ProviderPool>,
}

impl BlockLogFetcher {
    pub fn new(pool: Arc<ProviderPool>) -> Self {
        Self { pool }
    }

    pub fn filter_for(block_num: u64) -> LogFilter {
        LogFilter::single_block(block_num, EventKind::signatures())
    }

    pub async fn get_logs_in_block(&self, block_num: u64) -> Result<BlockOutcome, ProviderError> {
        let mut logs = self.pool.get_logs(&Self::filter_for(block_num)).await?;

        if logs.is_empty() {
            tracing::debug!(target: "nftwatch::extractor", block_num, "No transfer logs in block");
            return Ok(BlockOutcome::Empty);
        }

        // Nodes return logs in order, but reconciliation depends on it.
        logs.sort_by_key(|log| log.log_index);

        tracing::debug!(
            target: "nftwatch::extractor",
            block_num,
            count = logs.len(),
            "Fetched block logs"
        );

        Ok(BlockOutcome::Logs(logs))
    }
}
