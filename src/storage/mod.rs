//! Persistence gateway: record types and the store contract the pipeline writes through.

pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::etl::event::{Address, SourceTag, TokenStandard, TransferEvent, Version, H256, U256};

pub use sqlite::SqliteStore;

/// Priority given to owner tasks produced by the block pipeline.
pub const OWNER_TASK_PRIORITY: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected a write.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored value could not be mapped back to its record type.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Key shared by owners and tokens.
pub type TokenKey = (Address, U256);

/// Current holder of a single-holder token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRecord {
    pub contract: Address,
    pub token_id: U256,
    pub owner: Address,
    pub version: Version,
    pub standard: TokenStandard,
    pub tx_hash: H256,
    pub value: String,
}

impl OwnerRecord {
    pub fn from_event(event: &TransferEvent) -> Self {
        Self {
            contract: event.contract,
            token_id: event.token_id,
            owner: event.to,
            version: event.version(),
            standard: event.standard,
            tx_hash: event.tx_hash,
            value: "1".to_string(),
        }
    }

    pub fn key(&self) -> TokenKey {
        (self.contract, self.token_id)
    }
}

/// One observed transfer. Keyed by (contract, token_id, tx_hash, log_index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHistoryRecord {
    pub contract: Address,
    pub token_id: U256,
    pub tx_hash: H256,
    pub log_index: u64,
    pub block_num: u64,
    pub from: Address,
    pub to: Address,
    pub standard: TokenStandard,
    pub value: Option<U256>,
}

impl From<&TransferEvent> for TransferHistoryRecord {
    fn from(event: &TransferEvent) -> Self {
        Self {
            contract: event.contract,
            token_id: event.token_id,
            tx_hash: event.tx_hash,
            log_index: event.log_index,
            block_num: event.block_num,
            from: event.from,
            to: event.to,
            standard: event.standard,
            value: event.value,
        }
    }
}

/// Token catalog entry. `source` is set on first insert only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub contract: Address,
    pub token_id: U256,
    pub standard: TokenStandard,
    pub source: SourceTag,
    /// ERC-1155 only: latest observed amount.
    pub value: Option<U256>,
    /// ERC-1155 only: latest observed transaction.
    pub tx_hash: Option<H256>,
}

impl TokenRecord {
    pub fn from_event(event: &TransferEvent, source: SourceTag) -> Self {
        let multi = event.standard == TokenStandard::Erc1155;
        Self {
            contract: event.contract,
            token_id: event.token_id,
            standard: event.standard,
            source,
            value: if multi { event.value } else { None },
            tx_hash: multi.then_some(event.tx_hash),
        }
    }

    pub fn key(&self) -> TokenKey {
        (self.contract, self.token_id)
    }
}

/// Collection catalog entry. Enrichment markers are left NULL for an external job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRecord {
    pub contract: Address,
    pub standard: TokenStandard,
    pub source: SourceTag,
}

/// Work item for the external ERC-1155 balance reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerTask {
    pub contract: Address,
    pub token_id: U256,
    pub task_id: Uuid,
    pub standard: TokenStandard,
    pub priority: u32,
    pub is_processing: bool,
    pub created_at: DateTime<Utc>,
}

impl OwnerTask {
    pub fn for_event(event: &TransferEvent) -> Self {
        Self {
            contract: event.contract,
            token_id: event.token_id,
            task_id: Uuid::new_v4(),
            standard: event.standard,
            priority: OWNER_TASK_PRIORITY,
            is_processing: false,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> TokenKey {
        (self.contract, self.token_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockTaskStatus {
    Processing,
    Error,
    Retry,
    Empty,
}

impl BlockTaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Error => "error",
            Self::Retry => "retry",
            Self::Empty => "empty",
        }
    }
}

impl fmt::Display for BlockTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockTaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "error" => Ok(Self::Error),
            "retry" => Ok(Self::Retry),
            "empty" => Ok(Self::Empty),
            other => Err(StoreError::Serialization(format!("unknown block task status {other:?}"))),
        }
    }
}

/// Lifecycle row for one queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMonitorTask {
    pub message_id: String,
    pub block_num: u64,
    pub status: BlockTaskStatus,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BlockMonitorTask {
    pub fn new(message_id: impl Into<String>, block_num: u64, status: BlockTaskStatus) -> Self {
        Self {
            message_id: message_id.into(),
            block_num,
            status,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Typed write/read contract of the document store.
///
/// Multi-record writes are applied in chunks; within a chunk every item is
/// attempted even when a sibling fails, and the first failure is returned.
#[async_trait]
pub trait NftStore: Send + Sync {
    /// Owner records for exactly the given keys. Unknown keys are absent.
    async fn find_owners(&self, keys: &[TokenKey]) -> Result<Vec<OwnerRecord>, StoreError>;

    /// Inserts or updates owners, each guarded by version: a row only changes
    /// when the incoming version is strictly greater. Returns rows changed.
    async fn upsert_owners(&self, owners: &[OwnerRecord]) -> Result<usize, StoreError>;

    /// Idempotent on (contract, token_id, tx_hash, log_index). Returns rows changed.
    async fn upsert_transfer_history(
        &self,
        records: &[TransferHistoryRecord],
    ) -> Result<usize, StoreError>;

    async fn upsert_tokens(&self, tokens: &[TokenRecord]) -> Result<usize, StoreError>;

    /// Returns the number of collections that did not exist before.
    async fn insert_collections_if_absent(
        &self,
        collections: &[CollectionRecord],
    ) -> Result<usize, StoreError>;

    async fn insert_owner_tasks(&self, tasks: &[OwnerTask]) -> Result<usize, StoreError>;

    async fn upsert_block_task(&self, task: &BlockMonitorTask) -> Result<(), StoreError>;

    async fn find_block_task(&self, message_id: &str) -> Result<Option<BlockMonitorTask>, StoreError>;

    async fn delete_block_task(&self, message_id: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(standard: TokenStandard) -> TransferEvent {
        TransferEvent {
            contract: Address::repeat_byte(1),
            token_id: U256::from(42),
            from: Address::repeat_byte(2),
            to: Address::repeat_byte(3),
            block_num: 100,
            log_index: 4,
            tx_hash: H256::repeat_byte(9),
            standard,
            value: Some(U256::from(5)),
        }
    }

    #[test]
    fn test_token_record_keeps_value_for_erc1155_only() {
        let multi = TokenRecord::from_event(&event(TokenStandard::Erc1155), SourceTag::Monitor);
        assert_eq!(multi.value, Some(U256::from(5)));
        assert_eq!(multi.tx_hash, Some(H256::repeat_byte(9)));

        let single = TokenRecord::from_event(&event(TokenStandard::Erc721), SourceTag::Monitor);
        assert_eq!(single.value, None);
        assert_eq!(single.tx_hash, None);
    }

    #[test]
    fn test_owner_record_from_event() {
        let owner = OwnerRecord::from_event(&event(TokenStandard::CryptoPunks));
        assert_eq!(owner.owner, Address::repeat_byte(3));
        assert_eq!(owner.version, Version::new(100, 4));
        assert_eq!(owner.value, "1");
    }

    #[test]
    fn test_owner_task_defaults() {
        let a = OwnerTask::for_event(&event(TokenStandard::Erc1155));
        let b = OwnerTask::for_event(&event(TokenStandard::Erc1155));
        assert_eq!(a.priority, 10);
        assert!(!a.is_processing);
        assert_ne!(a.task_id, b.task_id);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_block_task_status_round_trip() {
        for status in [
            BlockTaskStatus::Processing,
            BlockTaskStatus::Error,
            BlockTaskStatus::Retry,
            BlockTaskStatus::Empty,
        ] {
            assert_eq!(status.as_str().parse::<BlockTaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<BlockTaskStatus>().is_err());
    }
}
