//! Raw chain logs and the normalized transfer events decoded from them.
//!
//! Event signatures are the keccak256 hashes of the Solidity event declarations
//! and form a closed set: anything else coming back from the node is ignored.

use std::fmt;
use std::str::FromStr;

use hex_literal::hex;
use serde::{Deserialize, Serialize};

pub use ethers::types::{Address, H256, U256};

/// The zero address, used as `from` on mints and CryptoPunks assignments.
pub const ZERO_ADDRESS: Address = ethers::types::H160([0u8; 20]);

/// Legacy CryptoPunks market contract. It predates ERC-165 and is classified
/// by address alone.
pub const CRYPTOPUNKS_ADDRESS: Address = ethers::types::H160(hex!("b47e3cd837ddf8e4c57f05d70ab865de6e193bbb"));

/// `Transfer(address,address,uint256)`, shared by ERC-20 and ERC-721.
pub const TRANSFER_SIGNATURE: H256 =
    H256(hex!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"));
/// `Assign(address,uint256)`
pub const PUNK_ASSIGN_SIGNATURE: H256 =
    H256(hex!("8a0e37b73a0d9c82e205d4d1a3ff3d0b57ce5f4d7bccf6bac03336dc101cb7ba"));
/// `PunkTransfer(address,address,uint256)`
pub const PUNK_TRANSFER_SIGNATURE: H256 =
    H256(hex!("05af636b70da6819000c49f85b21fa82081c632069bb626f30932034099107d8"));
/// `PunkBought(uint256,uint256,address,address)`
pub const PUNK_BOUGHT_SIGNATURE: H256 =
    H256(hex!("58e5d5a525e3b40bc15abaa38b5882678db1ee68befd2f60bafe3a7fd06db9e3"));
/// `TransferSingle(address,address,address,uint256,uint256)`
pub const TRANSFER_SINGLE_SIGNATURE: H256 =
    H256(hex!("c3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62"));
/// `TransferBatch(address,address,address,uint256[],uint256[])`
pub const TRANSFER_BATCH_SIGNATURE: H256 =
    H256(hex!("4a39dc06d4c0dbc64b70af90fd698a233a518aa5d07e595d983b8c0526c8f7fb"));

/// Token standards handled by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TokenStandard {
    #[serde(rename = "ERC721")]
    Erc721,
    #[serde(rename = "ERC1155")]
    Erc1155,
    CryptoPunks,
}

impl TokenStandard {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Erc721 => "ERC721",
            Self::Erc1155 => "ERC1155",
            Self::CryptoPunks => "CryptoPunks",
        }
    }

    /// Single-holder standards have exactly one owner per token and go through
    /// the ownership reconciler. ERC-1155 balances are left to owner tasks.
    pub const fn is_single_holder(self) -> bool {
        matches!(self, Self::Erc721 | Self::CryptoPunks)
    }
}

impl fmt::Display for TokenStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenStandard {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ERC721" => Ok(Self::Erc721),
            "ERC1155" => Ok(Self::Erc1155),
            "CryptoPunks" => Ok(Self::CryptoPunks),
            other => anyhow::bail!("Unknown token standard: {other}"),
        }
    }
}

/// Which processing mode produced a record: historical backfill or live monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceTag {
    Archive,
    Monitor,
}

impl SourceTag {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Archive => "ARCHIVE",
            Self::Monitor => "MONITOR",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceTag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ARCHIVE" => Ok(Self::Archive),
            "MONITOR" => Ok(Self::Monitor),
            other => anyhow::bail!("Unknown source tag: {other}"),
        }
    }
}

/// Transfer-family events, keyed by their topic-0 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Transfer,
    PunkAssign,
    PunkTransfer,
    PunkBought,
    TransferSingle,
    TransferBatch,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        Self::Transfer,
        Self::PunkAssign,
        Self::PunkTransfer,
        Self::PunkBought,
        Self::TransferSingle,
        Self::TransferBatch,
    ];

    pub const fn signature(self) -> H256 {
        match self {
            Self::Transfer => TRANSFER_SIGNATURE,
            Self::PunkAssign => PUNK_ASSIGN_SIGNATURE,
            Self::PunkTransfer => PUNK_TRANSFER_SIGNATURE,
            Self::PunkBought => PUNK_BOUGHT_SIGNATURE,
            Self::TransferSingle => TRANSFER_SINGLE_SIGNATURE,
            Self::TransferBatch => TRANSFER_BATCH_SIGNATURE,
        }
    }

    /// The standard a contract must be classified as for this event to decode.
    pub const fn standard(self) -> TokenStandard {
        match self {
            Self::Transfer => TokenStandard::Erc721,
            Self::PunkAssign | Self::PunkTransfer | Self::PunkBought => TokenStandard::CryptoPunks,
            Self::TransferSingle | Self::TransferBatch => TokenStandard::Erc1155,
        }
    }

    pub fn from_topic(topic: &H256) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.signature() == *topic)
    }

    pub fn signatures() -> Vec<H256> {
        Self::ALL.iter().map(|kind| kind.signature()).collect()
    }
}

/// Position of an event on chain. Ordered by block first, then log index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub block_num: u64,
    pub log_index: u64,
}

impl Version {
    pub const fn new(block_num: u64, log_index: u64) -> Self {
        Self {
            block_num,
            log_index,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_num, self.log_index)
    }
}

/// A mined log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub transaction_hash: H256,
    pub log_index: u64,
}

impl RawLog {
    pub fn kind(&self) -> Option<EventKind> {
        self.topics.first().and_then(EventKind::from_topic)
    }

    pub fn version(&self) -> Version {
        Version::new(self.block_number, self.log_index)
    }
}

impl TryFrom<ethers::types::Log> for RawLog {
    type Error = anyhow::Error;

    /// Pending logs carry no position and are rejected.
    fn try_from(log: ethers::types::Log) -> Result<Self, Self::Error> {
        let block_number = log
            .block_number
            .ok_or_else(|| anyhow::anyhow!("log has no block number"))?;
        let transaction_hash = log
            .transaction_hash
            .ok_or_else(|| anyhow::anyhow!("log has no transaction hash"))?;
        let log_index = log
            .log_index
            .ok_or_else(|| anyhow::anyhow!("log has no log index"))?;
        if log_index > U256::from(u64::MAX) {
            anyhow::bail!("log index {log_index} out of range");
        }

        Ok(Self {
            address: log.address,
            topics: log.topics,
            data: log.data.to_vec(),
            block_number: block_number.as_u64(),
            transaction_hash,
            log_index: log_index.as_u64(),
        })
    }
}

/// A normalized NFT transfer. One per ERC-721 / CryptoPunks log, one per
/// (id, value) pair for ERC-1155.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub contract: Address,
    pub token_id: U256,
    pub from: Address,
    pub to: Address,
    pub block_num: u64,
    pub log_index: u64,
    pub tx_hash: H256,
    pub standard: TokenStandard,
    /// ERC-1155 amount.
    pub value: Option<U256>,
}

impl TransferEvent {
    pub fn version(&self) -> Version {
        Version::new(self.block_num, self.log_index)
    }

    pub fn key(&self) -> (Address, U256) {
        (self.contract, self.token_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cryptopunks_address_constant() {
        assert_eq!(
            format!("{CRYPTOPUNKS_ADDRESS:#x}"),
            "0xb47e3cd837ddf8e4c57f05d70ab865de6e193bbb"
        );
    }

    #[test]
    fn test_event_kind_from_topic() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_topic(&kind.signature()), Some(kind));
        }
        assert_eq!(EventKind::from_topic(&H256::zero()), None);
    }

    #[test]
    fn test_event_kind_standard() {
        assert_eq!(EventKind::Transfer.standard(), TokenStandard::Erc721);
        assert_eq!(EventKind::PunkBought.standard(), TokenStandard::CryptoPunks);
        assert_eq!(EventKind::TransferBatch.standard(), TokenStandard::Erc1155);
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version::new(10, 0) > Version::new(9, 500));
        assert!(Version::new(10, 3) > Version::new(10, 1));
        assert_eq!(Version::new(7, 2), Version::new(7, 2));
    }

    #[test]
    fn test_raw_log_from_rpc_json() {
        let json = serde_json::json!({
            "address": "0xb47e3cd837ddf8e4c57f05d70ab865de6e193bbb",
            "topics": [
                "0x05af636b70da6819000c49f85b21fa82081c632069bb626f30932034099107d8",
                "0x000000000000000000000000000000000000000000000000000000000000000a",
                "0x000000000000000000000000000000000000000000000000000000000000000b"
            ],
            "data": "0x0000000000000000000000000000000000000000000000000000000000000064",
            "blockNumber": "0x10",
            "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "logIndex": "0x2",
            "removed": false
        });

        let log: ethers::types::Log = serde_json::from_value(json).unwrap();
        let log = RawLog::try_from(log).unwrap();
        assert_eq!(log.address, CRYPTOPUNKS_ADDRESS);
        assert_eq!(log.kind(), Some(EventKind::PunkTransfer));
        assert_eq!(log.data.len(), 32);
        assert_eq!(log.version(), Version::new(16, 2));
    }

    #[test]
    fn test_pending_log_rejected() {
        let log = ethers::types::Log {
            address: CRYPTOPUNKS_ADDRESS,
            topics: vec![PUNK_TRANSFER_SIGNATURE],
            ..Default::default()
        };
        assert!(RawLog::try_from(log).is_err());
    }

    #[test]
    fn test_source_tag_parse() {
        assert_eq!("monitor".parse::<SourceTag>().unwrap(), SourceTag::Monitor);
        assert_eq!("ARCHIVE".parse::<SourceTag>().unwrap(), SourceTag::Archive);
        assert!("live".parse::<SourceTag>().is_err());
    }
}
