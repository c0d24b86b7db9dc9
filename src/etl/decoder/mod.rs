//! Decoder trait and routing.
//!
//! Each token standard provides a [`Decoder`] in its own crate. The
//! [`DecoderContext`] gates every log on the classifier's verdict for its
//! address before handing it to the decoder registered for that standard.

pub mod abi;
pub mod context;

use crate::etl::event::{RawLog, TokenStandard, TransferEvent};

pub use context::{DecodedBlock, DecoderContext};

/// Turns raw logs of one token standard into transfer events.
///
/// Decoders are pure: no I/O, no state. A log a decoder cannot make sense of
/// is skipped with a warning and yields no events.
pub trait Decoder: Send + Sync {
    /// Unique name, used in logs.
    fn decoder_name(&self) -> &str;

    /// The standard whose logs this decoder accepts.
    fn standard(&self) -> TokenStandard;

    /// Decode a single log.
    ///
    /// # Returns
    /// Zero events for malformed or foreign logs, one for single transfers,
    /// one per (id, value) pair for batch transfers.
    fn decode_log(&self, log: &RawLog) -> anyhow::Result<Vec<TransferEvent>>;

    /// Decode multiple logs (convenience method).
    fn decode(&self, logs: &[RawLog]) -> anyhow::Result<Vec<TransferEvent>> {
        let mut events = Vec::new();
        for log in logs {
            events.extend(self.decode_log(log)?);
        }
        Ok(events)
    }
}
