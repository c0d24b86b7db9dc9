//! DecoderContext routes logs to per-standard decoders.
//!
//! # Design
//!
//! - One decoder per token standard; registering two for the same standard is an error
//! - A log is decoded only when its signature's standard matches the
//!   classification of its contract (gating against colliding signatures)
//! - Unclassified contracts are skipped
//! - Log order is preserved in every output list

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::Decoder;
use crate::etl::event::{Address, RawLog, SourceTag, TokenStandard, TransferEvent};
use crate::etl::identification::Classification;
use crate::storage::{CollectionRecord, OwnerTask, TokenKey, TokenRecord};

/// Everything produced from one block's logs, partitioned by standard.
#[derive(Debug, Clone, Default)]
pub struct DecodedBlock {
    pub erc721: Vec<TransferEvent>,
    pub erc1155: Vec<TransferEvent>,
    pub cryptopunks: Vec<TransferEvent>,
    /// One entry per token; for ERC-1155 the last event of the block wins.
    pub tokens: Vec<TokenRecord>,
    /// One entry per classified contract that emitted a log, first-seen
    /// order, whether or not any of its logs decoded.
    pub collections: Vec<CollectionRecord>,
    /// ERC-1155 only, one per token across the whole block.
    pub owner_tasks: Vec<OwnerTask>,
}

impl DecodedBlock {
    pub fn event_count(&self) -> usize {
        self.erc721.len() + self.erc1155.len() + self.cryptopunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_count() == 0
    }

    pub fn events(&self, standard: TokenStandard) -> &[TransferEvent] {
        match standard {
            TokenStandard::Erc721 => &self.erc721,
            TokenStandard::Erc1155 => &self.erc1155,
            TokenStandard::CryptoPunks => &self.cryptopunks,
        }
    }

    fn events_mut(&mut self, standard: TokenStandard) -> &mut Vec<TransferEvent> {
        match standard {
            TokenStandard::Erc721 => &mut self.erc721,
            TokenStandard::Erc1155 => &mut self.erc1155,
            TokenStandard::CryptoPunks => &mut self.cryptopunks,
        }
    }
}

pub struct DecoderContext {
    decoders: HashMap<TokenStandard, Arc<dyn Decoder>>,
}

impl DecoderContext {
    pub fn new(decoders: Vec<Arc<dyn Decoder>>) -> anyhow::Result<Self> {
        let mut decoder_map: HashMap<TokenStandard, Arc<dyn Decoder>> = HashMap::new();

        for decoder in decoders {
            let standard = decoder.standard();
            if let Some(existing) = decoder_map.get(&standard) {
                anyhow::bail!(
                    "Decoders '{}' and '{}' both handle {}",
                    existing.decoder_name(),
                    decoder.decoder_name(),
                    standard
                );
            }

            tracing::debug!(
                target: "nftwatch::decoder",
                "Registered decoder '{}' for {}",
                decoder.decoder_name(),
                standard
            );
            decoder_map.insert(standard, decoder);
        }

        tracing::info!(
            target: "nftwatch::decoder",
            "Initialized DecoderContext with {} decoders",
            decoder_map.len()
        );

        Ok(Self {
            decoders: decoder_map,
        })
    }

    pub fn standards(&self) -> Vec<TokenStandard> {
        let mut standards: Vec<_> = self.decoders.keys().copied().collect();
        standards.sort_unstable();
        standards
    }

    /// Decodes a single log, applying the classification gate.
    pub fn decode_log(&self, log: &RawLog, classification: &Classification) -> Vec<TransferEvent> {
        let Some(kind) = log.kind() else {
            return Vec::new();
        };
        let Some(classified) = classification.get(&log.address).copied() else {
            tracing::trace!(
                target: "nftwatch::decoder",
                contract = %format!("{:#x}", log.address),
                log_index = log.log_index,
                "Skipping log from unclassified contract"
            );
            return Vec::new();
        };
        if kind.standard() != classified {
            tracing::debug!(
                target: "nftwatch::decoder",
                contract = %format!("{:#x}", log.address),
                ?kind,
                %classified,
                "Signature does not match contract standard, skipping"
            );
            return Vec::new();
        }
        let Some(decoder) = self.decoders.get(&classified) else {
            tracing::warn!(
                target: "nftwatch::decoder",
                standard = %classified,
                "No decoder registered for standard"
            );
            return Vec::new();
        };

        match decoder.decode_log(log) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(
                    target: "nftwatch::decoder",
                    decoder = decoder.decoder_name(),
                    tx_hash = %format!("{:#x}", log.transaction_hash),
                    log_index = log.log_index,
                    error = %e,
                    "Decoder failed"
                );
                Vec::new()
            }
        }
    }

    /// Decodes one block's logs and derives token, collection and owner-task records.
    pub fn decode_block(
        &self,
        logs: &[RawLog],
        classification: &Classification,
        source: SourceTag,
    ) -> DecodedBlock {
        let mut block = DecodedBlock::default();
        let mut token_index: HashMap<TokenKey, usize> = HashMap::new();
        let mut seen_collections: HashSet<Address> = HashSet::new();
        let mut seen_tasks: HashSet<TokenKey> = HashSet::new();

        for log in logs {
            if let Some(&standard) = classification.get(&log.address) {
                if seen_collections.insert(log.address) {
                    block.collections.push(CollectionRecord {
                        contract: log.address,
                        standard,
                        source,
                    });
                }
            }

            for event in self.decode_log(log, classification) {
                let token = TokenRecord::from_event(&event, source);
                match token_index.get(&event.key()) {
                    Some(&index) => {
                        if event.standard == TokenStandard::Erc1155 {
                            block.tokens[index] = token;
                        }
                    }
                    None => {
                        token_index.insert(event.key(), block.tokens.len());
                        block.tokens.push(token);
                    }
                }

                if event.standard == TokenStandard::Erc1155 && seen_tasks.insert(event.key()) {
                    block.owner_tasks.push(OwnerTask::for_event(&event));
                }

                block.events_mut(event.standard).push(event);
            }
        }

        tracing::debug!(
            target: "nftwatch::decoder",
            logs = logs.len(),
            erc721 = block.erc721.len(),
            erc1155 = block.erc1155.len(),
            cryptopunks = block.cryptopunks.len(),
            tokens = block.tokens.len(),
            collections = block.collections.len(),
            owner_tasks = block.owner_tasks.len(),
            "Decoded block logs"
        );

        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::event::{EventKind, H256, TRANSFER_SIGNATURE, TRANSFER_SINGLE_SIGNATURE, U256};

    /// Emits one event per log with token id = topic[1], value = 1.
    struct EchoDecoder(TokenStandard);

    impl Decoder for EchoDecoder {
        fn decoder_name(&self) -> &str {
            "echo"
        }
        fn standard(&self) -> TokenStandard {
            self.0
        }
        fn decode_log(&self, log: &RawLog) -> anyhow::Result<Vec<TransferEvent>> {
            let Some(topic) = log.topics.get(1) else {
                anyhow::bail!("missing token topic");
            };
            Ok(vec![TransferEvent {
                contract: log.address,
                token_id: U256::from_big_endian(topic.as_bytes()),
                from: Address::zero(),
                to: Address::repeat_byte(0xee),
                block_num: log.block_number,
                log_index: log.log_index,
                tx_hash: log.transaction_hash,
                standard: self.0,
                value: Some(U256::from(log.log_index + 1)),
            }])
        }
    }

    fn context() -> DecoderContext {
        DecoderContext::new(vec![
            Arc::new(EchoDecoder(TokenStandard::Erc721)),
            Arc::new(EchoDecoder(TokenStandard::Erc1155)),
        ])
        .unwrap()
    }

    fn log(contract: u8, signature: H256, token: u64, log_index: u64) -> RawLog {
        RawLog {
            address: Address::repeat_byte(contract),
            topics: vec![signature, H256::from_low_u64_be(token)],
            data: Vec::new(),
            block_number: 7,
            transaction_hash: H256::repeat_byte(0x99),
            log_index,
        }
    }

    #[test]
    fn test_duplicate_standard_rejected() {
        let result = DecoderContext::new(vec![
            Arc::new(EchoDecoder(TokenStandard::Erc721)),
            Arc::new(EchoDecoder(TokenStandard::Erc721)),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_gating_by_classification() {
        let ctx = context();
        let classification: Classification = [
            (Address::repeat_byte(1), TokenStandard::Erc721),
            (Address::repeat_byte(2), TokenStandard::Erc1155),
        ]
        .into_iter()
        .collect();

        // Transfer from an ERC1155 contract and TransferSingle from an ERC721 contract are dropped.
        assert!(ctx.decode_log(&log(2, TRANSFER_SIGNATURE, 1, 0), &classification).is_empty());
        assert!(ctx.decode_log(&log(1, TRANSFER_SINGLE_SIGNATURE, 1, 0), &classification).is_empty());
        // Unclassified contract.
        assert!(ctx.decode_log(&log(3, TRANSFER_SIGNATURE, 1, 0), &classification).is_empty());
        // Unknown signature.
        assert!(ctx.decode_log(&log(1, H256::zero(), 1, 0), &classification).is_empty());

        assert_eq!(ctx.decode_log(&log(1, TRANSFER_SIGNATURE, 1, 0), &classification).len(), 1);
        assert_eq!(ctx.decode_log(&log(2, TRANSFER_SINGLE_SIGNATURE, 1, 0), &classification).len(), 1);
    }

    #[test]
    fn test_decoder_error_is_skipped() {
        let ctx = context();
        let classification: Classification =
            [(Address::repeat_byte(1), TokenStandard::Erc721)].into_iter().collect();
        let mut bad = log(1, TRANSFER_SIGNATURE, 1, 0);
        bad.topics.truncate(1);

        assert!(ctx.decode_log(&bad, &classification).is_empty());
    }

    #[test]
    fn test_decode_block_derives_records() {
        let ctx = context();
        let classification: Classification = [
            (Address::repeat_byte(1), TokenStandard::Erc721),
            (Address::repeat_byte(2), TokenStandard::Erc1155),
        ]
        .into_iter()
        .collect();

        let logs = vec![
            log(1, TRANSFER_SIGNATURE, 5, 0),
            log(2, TRANSFER_SINGLE_SIGNATURE, 8, 1),
            log(1, TRANSFER_SIGNATURE, 5, 2),
            log(2, TRANSFER_SINGLE_SIGNATURE, 8, 3),
            log(2, TRANSFER_SINGLE_SIGNATURE, 9, 4),
        ];
        let block = ctx.decode_block(&logs, &classification, SourceTag::Monitor);

        assert_eq!(block.erc721.len(), 2);
        assert_eq!(block.erc1155.len(), 3);
        assert!(block.cryptopunks.is_empty());
        assert_eq!(
            block.erc721.iter().map(|e| e.log_index).collect::<Vec<_>>(),
            vec![0, 2]
        );

        // (1,5), (2,8), (2,9)
        assert_eq!(block.tokens.len(), 3);
        assert!(block.tokens.iter().all(|t| t.source == SourceTag::Monitor));
        // Latest ERC1155 value for token 8 is from log index 3.
        assert_eq!(block.tokens[1].value, Some(U256::from(4)));

        assert_eq!(block.collections.len(), 2);
        assert_eq!(block.collections[0].contract, Address::repeat_byte(1));
        assert_eq!(block.collections[1].standard, TokenStandard::Erc1155);

        // Tasks deduplicated per token, ERC1155 only.
        assert_eq!(block.owner_tasks.len(), 2);
        assert!(block.owner_tasks.iter().all(|t| t.standard == TokenStandard::Erc1155));
        assert_eq!(block.owner_tasks[0].token_id, U256::from(8));
        assert_eq!(block.owner_tasks[1].token_id, U256::from(9));
    }

    #[test]
    fn test_all_event_kinds_route_to_their_standard() {
        for kind in EventKind::ALL {
            let ctx = DecoderContext::new(vec![Arc::new(EchoDecoder(kind.standard()))]).unwrap();
            let classification: Classification =
                [(Address::repeat_byte(1), kind.standard())].into_iter().collect();
            assert_eq!(ctx.decode_log(&log(1, kind.signature(), 1, 0), &classification).len(), 1);
        }
    }

    #[test]
    fn test_collection_registered_when_nothing_decodes() {
        let ctx = context();
        let classification: Classification = [
            (Address::repeat_byte(1), TokenStandard::Erc721),
            (Address::repeat_byte(2), TokenStandard::Erc1155),
        ]
        .into_iter()
        .collect();

        let mut undecodable = log(1, TRANSFER_SIGNATURE, 5, 0);
        undecodable.topics.truncate(1);
        let logs = vec![
            undecodable,
            // Signature of the other standard: gated out, contract still classified.
            log(2, TRANSFER_SIGNATURE, 6, 1),
            // Unclassified contract: no collection.
            log(3, TRANSFER_SIGNATURE, 7, 2),
        ];
        let block = ctx.decode_block(&logs, &classification, SourceTag::Archive);

        assert!(block.is_empty());
        assert!(block.tokens.is_empty());
        assert_eq!(block.collections.len(), 2);
        assert_eq!(block.collections[0].contract, Address::repeat_byte(1));
        assert_eq!(block.collections[0].standard, TokenStandard::Erc721);
        assert_eq!(block.collections[1].contract, Address::repeat_byte(2));
        assert_eq!(block.collections[1].standard, TokenStandard::Erc1155);
        assert!(block.collections.iter().all(|c| c.source == SourceTag::Archive));
    }
}
