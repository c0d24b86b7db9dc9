//! Message lifecycle: turns one queue message into recorded block state and an
//! acknowledgement decision.
//!
//! ```text
//! received -> processing -> done (task row deleted)
//!                        -> empty
//!                        -> retry  (duplicate key)
//!                        -> error  (anything else, with diagnostic)
//! ```
//!
//! Every outcome except a fatal provider failure ends with the message being
//! removed from the queue. A fatal failure leaves it for redelivery.

use std::sync::Arc;
use std::time::Instant;

use crate::etl::decoder::DecoderContext;
use crate::etl::event::{SourceTag, TokenStandard};
use crate::etl::extractor::{BlockLogFetcher, BlockOutcome};
use crate::etl::identification::ContractClassifier;
use crate::etl::provider::{ProviderError, ProviderPool};
use crate::etl::reconcile::{OwnershipReconciler, ReconcileSummary};
use crate::queue::{BlockMessage, QueueMessage};
use crate::storage::{
    BlockMonitorTask, BlockTaskStatus, NftStore, StoreError, TransferHistoryRecord,
};

/// What to do with a message once its outcome has been recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Indexed, or nothing to index.
    Ack,
    /// Recorded as `retry` for an external sweeper.
    Retry,
    /// Recorded as `error` with the given diagnostic.
    DropWithError(String),
}

/// Block-level failure. Caught once per message and recorded.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid message body: {0}")]
    InvalidMessage(String),
}

impl ProcessError {
    /// Fatal errors stop the consumer and leave the message in the queue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Provider(e) if e.is_fatal())
    }

    pub fn classify(&self) -> Disposition {
        match self {
            Self::Store(StoreError::DuplicateKey(_)) => Disposition::Retry,
            other => Disposition::DropWithError(other.to_string()),
        }
    }
}

/// Counts for one indexed block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockReport {
    pub block_num: u64,
    pub logs: usize,
    pub classified: usize,
    pub events: usize,
    pub history_written: usize,
    pub tokens_written: usize,
    pub collections_inserted: usize,
    pub erc721_owners: ReconcileSummary,
    pub cryptopunks_owners: ReconcileSummary,
    pub owner_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Empty,
    Indexed(BlockReport),
}

/// Order in which history is written.
const HISTORY_ORDER: [TokenStandard; 3] = [
    TokenStandard::Erc721,
    TokenStandard::CryptoPunks,
    TokenStandard::Erc1155,
];

/// Runs the fetch, classify, decode and write sequence for one block and
/// keeps the block task row in step with it.
pub struct BlockProcessor {
    fetcher: BlockLogFetcher,
    classifier: ContractClassifier,
    decoders: DecoderContext,
    reconciler: OwnershipReconciler,
    store: Arc<dyn NftStore>,
    source: SourceTag,
}

impl BlockProcessor {
    pub fn new(
        pool: Arc<ProviderPool>,
        decoders: DecoderContext,
        store: Arc<dyn NftStore>,
        source: SourceTag,
    ) -> Self {
        Self {
            fetcher: BlockLogFetcher::new(pool.clone()),
            classifier: ContractClassifier::new(pool),
            decoders,
            reconciler: OwnershipReconciler::new(store.clone()),
            store,
            source,
        }
    }

    pub fn source(&self) -> SourceTag {
        self.source
    }

    /// Handles one message end to end.
    ///
    /// Returns `Err` only for fatal provider failures; the caller must then
    /// leave the message undeleted and stop consuming.
    pub async fn handle(&self, message: &QueueMessage) -> Result<Disposition, ProcessError> {
        let block_num = match BlockMessage::parse(&message.body) {
            Ok(parsed) => parsed.block_num,
            Err(e) => {
                let err = ProcessError::InvalidMessage(e.to_string());
                tracing::warn!(
                    target: "nftwatch::lifecycle",
                    message_id = %message.message_id,
                    error = %err,
                    "Rejecting message"
                );
                self.record(
                    BlockMonitorTask::new(&message.message_id, 0, BlockTaskStatus::Error)
                        .with_error(err.to_string()),
                )
                .await;
                return Ok(err.classify());
            }
        };

        match self.run(message, block_num).await {
            Ok(ProcessOutcome::Empty) => {
                self.record(BlockMonitorTask::new(&message.message_id, block_num, BlockTaskStatus::Empty))
                    .await;
                Ok(Disposition::Ack)
            }
            Ok(ProcessOutcome::Indexed(report)) => {
                if let Err(e) = self.store.delete_block_task(&message.message_id).await {
                    tracing::error!(
                        target: "nftwatch::lifecycle",
                        message_id = %message.message_id,
                        block_num,
                        error = %e,
                        "Failed to clear block task"
                    );
                }
                tracing::info!(
                    target: "nftwatch::lifecycle",
                    message_id = %message.message_id,
                    block_num,
                    logs = report.logs,
                    events = report.events,
                    history = report.history_written,
                    owners = report.erc721_owners.written() + report.cryptopunks_owners.written(),
                    owner_tasks = report.owner_tasks,
                    "Block indexed"
                );
                Ok(Disposition::Ack)
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(
                    target: "nftwatch::lifecycle",
                    message_id = %message.message_id,
                    block_num,
                    error = %e,
                    "Fatal provider failure, leaving message for redelivery"
                );
                Err(e)
            }
            Err(e) => {
                let disposition = e.classify();
                let task = BlockMonitorTask::new(&message.message_id, block_num, BlockTaskStatus::Error);
                let task = match &disposition {
                    Disposition::Retry => BlockMonitorTask {
                        status: BlockTaskStatus::Retry,
                        ..task
                    },
                    Disposition::DropWithError(text) => task.with_error(text.clone()),
                    Disposition::Ack => task,
                };
                tracing::warn!(
                    target: "nftwatch::lifecycle",
                    message_id = %message.message_id,
                    block_num,
                    status = %task.status,
                    error = %e,
                    "Block processing failed"
                );
                self.record(task).await;
                Ok(disposition)
            }
        }
    }

    async fn run(&self, message: &QueueMessage, block_num: u64) -> Result<ProcessOutcome, ProcessError> {
        self.store
            .upsert_block_task(&BlockMonitorTask::new(
                &message.message_id,
                block_num,
                BlockTaskStatus::Processing,
            ))
            .await?;

        self.process_block(block_num).await
    }

    /// Fetch, classify, decode, then write history, tokens, collections,
    /// owners and owner tasks in that order.
    pub async fn process_block(&self, block_num: u64) -> Result<ProcessOutcome, ProcessError> {
        let logs = match self.fetcher.get_logs_in_block(block_num).await? {
            BlockOutcome::Empty => {
                tracing::info!(target: "nftwatch::lifecycle", block_num, "No logs found in block");
                return Ok(ProcessOutcome::Empty);
            }
            BlockOutcome::Logs(logs) => logs,
        };

        let addresses: Vec<_> = logs.iter().map(|log| log.address).collect();
        let classification = self.classifier.classify(block_num, &addresses).await?;
        let decoded = self.decoders.decode_block(&logs, &classification, self.source);

        let mut report = BlockReport {
            block_num,
            logs: logs.len(),
            classified: classification.len(),
            events: decoded.event_count(),
            ..BlockReport::default()
        };

        for standard in HISTORY_ORDER {
            let records: Vec<TransferHistoryRecord> =
                decoded.events(standard).iter().map(TransferHistoryRecord::from).collect();
            report.history_written += self.store.upsert_transfer_history(&records).await?;
        }

        report.tokens_written = self.store.upsert_tokens(&decoded.tokens).await?;
        report.collections_inserted = self
            .store
            .insert_collections_if_absent(&decoded.collections)
            .await?;

        report.erc721_owners = self.reconciler.reconcile(&decoded.erc721).await?;
        report.cryptopunks_owners = self.reconciler.reconcile(&decoded.cryptopunks).await?;

        report.owner_tasks = self.store.insert_owner_tasks(&decoded.owner_tasks).await?;

        Ok(ProcessOutcome::Indexed(report))
    }

    /// Status writes are best effort; the message is removed regardless.
    async fn record(&self, task: BlockMonitorTask) {
        if let Err(e) = self.store.upsert_block_task(&task).await {
            tracing::error!(
                target: "nftwatch::lifecycle",
                message_id = %task.message_id,
                block_num = task.block_num,
                status = %task.status,
                error = %e,
                "Failed to record block task status"
            );
        }
    }
}

/// Times and logs [`BlockProcessor::handle`].
pub async fn handle_timed(
    processor: &BlockProcessor,
    message: &QueueMessage,
) -> Result<Disposition, ProcessError> {
    let started = Instant::now();
    let result = processor.handle(message).await;
    tracing::info!(
        target: "nftwatch::lifecycle",
        message_id = %message.message_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        disposition = ?result.as_ref().ok(),
        "Message handled"
    );
    result
}
