//! Queue receive loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::lifecycle::{handle_timed, BlockProcessor, Disposition, ProcessError};
use crate::queue::MessageQueue;

/// Totals over the lifetime of one consumer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: u64,
    pub retried: u64,
    pub errored: u64,
}

impl ConsumerStats {
    pub fn handled(&self) -> u64 {
        self.acked + self.retried + self.errored
    }

    fn count(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Ack => self.acked += 1,
            Disposition::Retry => self.retried += 1,
            Disposition::DropWithError(_) => self.errored += 1,
        }
    }
}

pub struct Consumer {
    queue: Arc<dyn MessageQueue>,
    processor: Arc<BlockProcessor>,
    max_messages: usize,
    poll_interval: Duration,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        processor: Arc<BlockProcessor>,
        max_messages: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            max_messages: max_messages.max(1),
            poll_interval,
        }
    }

    /// Receives and handles messages until `shutdown` is cancelled or a fatal
    /// error occurs. Messages of a receive are handled sequentially; the one in
    /// flight always finishes before shutdown is honoured.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<ConsumerStats, ProcessError> {
        let mut stats = ConsumerStats::default();

        tracing::info!(
            target: "nftwatch::consumer",
            source = %self.processor.source(),
            max_messages = self.max_messages,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting consumer loop"
        );

        loop {
            if shutdown.is_cancelled() {
                tracing::info!(target: "nftwatch::consumer", "Shutdown requested, stopping consumer loop");
                break;
            }

            let messages = match self.queue.receive(self.max_messages).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::error!(target: "nftwatch::consumer", error = %e, "Receive failed");
                    if self.idle(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if messages.is_empty() {
                if self.idle(&shutdown).await {
                    break;
                }
                continue;
            }

            for message in &messages {
                let disposition = match handle_timed(&self.processor, message).await {
                    Ok(disposition) => disposition,
                    Err(e) => {
                        tracing::error!(
                            target: "nftwatch::consumer",
                            message_id = %message.message_id,
                            error = %e,
                            "Stopping consumer loop"
                        );
                        return Err(e);
                    }
                };

                if let Err(e) = self.queue.delete(message).await {
                    // The message will reappear after its visibility timeout.
                    tracing::error!(
                        target: "nftwatch::consumer",
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to delete message"
                    );
                }
                stats.count(&disposition);
            }
        }

        tracing::info!(
            target: "nftwatch::consumer",
            acked = stats.acked,
            retried = stats.retried,
            errored = stats.errored,
            "Consumer loop completed"
        );
        Ok(stats)
    }

    /// Sleeps for the poll interval. Returns `true` if shutdown was requested meanwhile.
    async fn idle(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            () = shutdown.cancelled() => true,
            () = tokio::time::sleep(self.poll_interval) => false,
        }
    }
}
