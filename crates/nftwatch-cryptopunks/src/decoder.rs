//! CryptoPunks event decoder
//!
//! The punks contract predates ERC-721 and emits its own events. Only the
//! three that move a punk between holders are decoded.

use anyhow::Result;
use ethabi::{Event, Log, ParamType};
use nftwatch::etl::decoder::{abi, Decoder};
use nftwatch::etl::event::{Address, EventKind, RawLog, TokenStandard, TransferEvent, U256, ZERO_ADDRESS};

/// CryptoPunks event decoder
///
/// Decodes:
/// - Assign(address indexed to, uint256 punkIndex)
/// - PunkTransfer(address indexed from, address indexed to, uint256 punkIndex)
/// - PunkBought(uint indexed punkIndex, uint value, address indexed fromAddress, address indexed toAddress)
pub struct CryptoPunksDecoder {
    assign: Event,
    punk_transfer: Event,
    punk_bought: Event,
}

impl CryptoPunksDecoder {
    pub fn new() -> Self {
        Self {
            assign: abi::event(
                "Assign",
                &[
                    ("to", ParamType::Address, true),
                    ("punkIndex", ParamType::Uint(256), false),
                ],
            ),
            punk_transfer: abi::event(
                "PunkTransfer",
                &[
                    ("from", ParamType::Address, true),
                    ("to", ParamType::Address, true),
                    ("punkIndex", ParamType::Uint(256), false),
                ],
            ),
            punk_bought: abi::event(
                "PunkBought",
                &[
                    ("punkIndex", ParamType::Uint(256), true),
                    ("value", ParamType::Uint(256), false),
                    ("fromAddress", ParamType::Address, true),
                    ("toAddress", ParamType::Address, true),
                ],
            ),
        }
    }

    fn malformed(log: &RawLog, kind: EventKind) {
        tracing::warn!(
            target: "nftwatch_cryptopunks::decoder",
            token = %format!("{:#x}", log.address),
            tx_hash = %format!("{:#x}", log.transaction_hash),
            block_number = log.block_number,
            topics_len = log.topics.len(),
            data_len = log.data.len(),
            "Malformed CryptoPunks {:?} event",
            kind
        );
    }

    fn event(log: &RawLog, token_id: U256, from: Address, to: Address) -> TransferEvent {
        TransferEvent {
            contract: log.address,
            token_id,
            from,
            to,
            block_num: log.block_number,
            log_index: log.log_index,
            tx_hash: log.transaction_hash,
            standard: TokenStandard::CryptoPunks,
            value: None,
        }
    }

    /// Parses `log` against `event` and extracts (punk index, from, to).
    fn decode_with(
        log: &RawLog,
        kind: EventKind,
        event: &Event,
        extract: impl Fn(&Log) -> Option<(U256, Address, Address)>,
    ) -> Option<TransferEvent> {
        let fields = abi::parse_log(event, log).ok().and_then(|parsed| extract(&parsed));
        match fields {
            Some((punk_index, from, to)) => Some(Self::event(log, punk_index, from, to)),
            None => {
                Self::malformed(log, kind);
                None
            }
        }
    }

    /// Assign mints the punk, so the sender is the zero address.
    fn decode_assign(&self, log: &RawLog) -> Option<TransferEvent> {
        Self::decode_with(log, EventKind::PunkAssign, &self.assign, |parsed| {
            Some((abi::uint(parsed, "punkIndex")?, ZERO_ADDRESS, abi::address(parsed, "to")?))
        })
    }

    fn decode_transfer(&self, log: &RawLog) -> Option<TransferEvent> {
        Self::decode_with(log, EventKind::PunkTransfer, &self.punk_transfer, |parsed| {
            Some((
                abi::uint(parsed, "punkIndex")?,
                abi::address(parsed, "from")?,
                abi::address(parsed, "to")?,
            ))
        })
    }

    /// The sale price is not recorded.
    fn decode_bought(&self, log: &RawLog) -> Option<TransferEvent> {
        Self::decode_with(log, EventKind::PunkBought, &self.punk_bought, |parsed| {
            Some((
                abi::uint(parsed, "punkIndex")?,
                abi::address(parsed, "fromAddress")?,
                abi::address(parsed, "toAddress")?,
            ))
        })
    }
}

impl Default for CryptoPunksDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for CryptoPunksDecoder {
    fn decoder_name(&self) -> &str {
        "cryptopunks"
    }

    fn standard(&self) -> TokenStandard {
        TokenStandard::CryptoPunks
    }

    fn decode_log(&self, log: &RawLog) -> Result<Vec<TransferEvent>> {
        let event = match log.kind() {
            Some(EventKind::PunkAssign) => self.decode_assign(log),
            Some(EventKind::PunkTransfer) => self.decode_transfer(log),
            Some(EventKind::PunkBought) => self.decode_bought(log),
            _ => None,
        };
        Ok(event.into_iter().collect())
    }
}
