//! Contract classification by ERC-165 `supportsInterface` calls.
//!
//! Each distinct address in a block is asked `supportsInterface` for ERC-721,
//! then ERC-1155. The legacy CryptoPunks contract predates ERC-165 and is
//! recognized by address. Addresses whose call fails or that support neither
//! interface are left out of the result; their logs are not decoded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use hex_literal::hex;

use crate::etl::decoder::abi;
use crate::etl::event::{Address, TokenStandard, CRYPTOPUNKS_ADDRESS};
use crate::etl::provider::{ProviderError, ProviderPool};

pub const ERC721_INTERFACE_ID: [u8; 4] = hex!("80ac58cd");
pub const ERC1155_INTERFACE_ID: [u8; 4] = hex!("d9b67a26");

const INTERFACE_CALL_CONCURRENCY: usize = 8;

/// Sparse address → standard map. Missing addresses are unknown.
pub type Classification = HashMap<Address, TokenStandard>;

pub struct ContractClassifier {
    pool: Arc<ProviderPool>,
}

impl ContractClassifier {
    pub fn new(pool: Arc<ProviderPool>) -> Self {
        Self { pool }
    }

    /// Classifies `addresses` (duplicates allowed, first-seen order kept for the calls).
    ///
    /// Only `ProviderError::Exhausted` escapes; every other call failure just
    /// drops the address.
    pub async fn classify(
        &self,
        block_num: u64,
        addresses: &[Address],
    ) -> Result<Classification, ProviderError> {
        let started = Instant::now();

        let mut seen = HashSet::new();
        let unique: Vec<Address> = addresses.iter().copied().filter(|a| seen.insert(*a)).collect();

        let mut result = Classification::new();
        let mut to_query = Vec::with_capacity(unique.len());
        for address in unique.iter().copied() {
            if address == CRYPTOPUNKS_ADDRESS {
                result.insert(address, TokenStandard::CryptoPunks);
            } else {
                to_query.push(address);
            }
        }

        let answers: Vec<(Address, Result<Option<TokenStandard>, ProviderError>)> =
            stream::iter(to_query.iter().copied())
                .map(|address| async move { (address, self.detect_standard(address).await) })
                .buffered(INTERFACE_CALL_CONCURRENCY)
                .collect()
                .await;

        for (address, outcome) in answers {
            match outcome {
                Ok(Some(standard)) => {
                    result.insert(address, standard);
                }
                Ok(None) => {
                    tracing::trace!(
                        target: "nftwatch::identification",
                        contract = %format!("{address:#x}"),
                        "Contract supports neither ERC721 nor ERC1155"
                    );
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        target: "nftwatch::identification",
                        contract = %format!("{address:#x}"),
                        error = %err,
                        "Interface call failed, contract skipped"
                    );
                }
            }
        }

        tracing::info!(
            target: "nftwatch::identification",
            block_num,
            queried = to_query.len(),
            distinct = unique.len(),
            classified = result.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classified block contracts"
        );

        Ok(result)
    }

    /// ERC-721 first, then ERC-1155. A failed call ends the check for this address.
    async fn detect_standard(&self, address: Address) -> Result<Option<TokenStandard>, ProviderError> {
        if self.supports_interface(address, ERC721_INTERFACE_ID).await? {
            return Ok(Some(TokenStandard::Erc721));
        }
        if self.supports_interface(address, ERC1155_INTERFACE_ID).await? {
            return Ok(Some(TokenStandard::Erc1155));
        }
        Ok(None)
    }

    async fn supports_interface(
        &self,
        address: Address,
        interface_id: [u8; 4],
    ) -> Result<bool, ProviderError> {
        let output = self
            .pool
            .call_read_only(address, &abi::supports_interface_calldata(interface_id))
            .await?;
        abi::decode_bool(&output).map_err(|e| {
            ProviderError::Malformed(format!("supportsInterface returned 0x{}: {e}", hex::encode(&output)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::event::RawLog;
    use crate::etl::provider::{ChainProvider, LogFilter};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers `supportsInterface` from a fixed table and records every call.
    #[derive(Default)]
    struct InterfaceTable {
        erc721: Vec<Address>,
        erc1155: Vec<Address>,
        reverting: Vec<Address>,
        garbage: Vec<Address>,
        calls: Mutex<Vec<(Address, [u8; 4])>>,
    }

    fn word(value: bool) -> Vec<u8> {
        ethabi::encode(&[ethabi::Token::Bool(value)])
    }

    #[async_trait]
    impl ChainProvider for InterfaceTable {
        fn endpoint(&self) -> &str {
            "table"
        }
        async fn block_height(&self) -> Result<u64, ProviderError> {
            Ok(1)
        }
        async fn get_logs(&self, _filter: &LogFilter) -> Result<Vec<RawLog>, ProviderError> {
            Ok(Vec::new())
        }
        async fn call_read_only(&self, to: Address, calldata: &[u8]) -> Result<Vec<u8>, ProviderError> {
            let id = [ERC721_INTERFACE_ID, ERC1155_INTERFACE_ID]
                .into_iter()
                .find(|id| calldata == abi::supports_interface_calldata(*id).as_slice())
                .expect("unexpected calldata");
            self.calls.lock().unwrap().push((to, id));

            if self.reverting.contains(&to) {
                return Err(ProviderError::Rpc { code: 3, message: "execution reverted".into() });
            }
            if self.garbage.contains(&to) {
                return Ok(vec![0xab; 4]);
            }
            let supported = (id == ERC721_INTERFACE_ID && self.erc721.contains(&to))
                || (id == ERC1155_INTERFACE_ID && self.erc1155.contains(&to));
            Ok(word(supported))
        }
    }

    fn classifier(table: InterfaceTable) -> (ContractClassifier, Arc<InterfaceTable>) {
        let table = Arc::new(table);
        let pool = ProviderPool::new(vec![table.clone() as Arc<dyn ChainProvider>]).unwrap();
        (ContractClassifier::new(Arc::new(pool)), table)
    }

    #[tokio::test]
    async fn test_classify_mixed_block() {
        let nft = Address::repeat_byte(0x11);
        let multi = Address::repeat_byte(0x22);
        let erc20 = Address::repeat_byte(0x33);
        let (classifier, table) = classifier(InterfaceTable {
            erc721: vec![nft],
            erc1155: vec![multi],
            ..Default::default()
        });

        let result = classifier
            .classify(1, &[nft, multi, nft, erc20, CRYPTOPUNKS_ADDRESS])
            .await
            .unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(result[&nft], TokenStandard::Erc721);
        assert_eq!(result[&multi], TokenStandard::Erc1155);
        assert_eq!(result[&CRYPTOPUNKS_ADDRESS], TokenStandard::CryptoPunks);
        assert!(!result.contains_key(&erc20));

        let calls = table.calls.lock().unwrap();
        // nft: one call (721 matched). multi and erc20: two each. Punks: none.
        assert_eq!(calls.len(), 5);
        assert!(calls.iter().all(|(addr, _)| *addr != CRYPTOPUNKS_ADDRESS));
    }

    #[tokio::test]
    async fn test_erc721_wins_over_erc1155() {
        let both = Address::repeat_byte(0x44);
        let (classifier, _) = classifier(InterfaceTable {
            erc721: vec![both],
            erc1155: vec![both],
            ..Default::default()
        });

        let result = classifier.classify(1, &[both]).await.unwrap();
        assert_eq!(result[&both], TokenStandard::Erc721);
    }

    #[tokio::test]
    async fn test_interface_call_failures_are_omitted() {
        let reverting = Address::repeat_byte(0x55);
        let garbage = Address::repeat_byte(0x66);
        let nft = Address::repeat_byte(0x77);
        let (classifier, _) = classifier(InterfaceTable {
            erc721: vec![nft],
            reverting: vec![reverting],
            garbage: vec![garbage],
            ..Default::default()
        });

        let result = classifier.classify(1, &[reverting, garbage, nft]).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[&nft], TokenStandard::Erc721);
    }
}
