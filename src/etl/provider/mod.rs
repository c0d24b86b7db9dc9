//! Chain access: the provider abstraction, its JSON-RPC implementation and
//! the failover pool that every pipeline call goes through.

pub mod jsonrpc;
pub mod pool;

use async_trait::async_trait;
use ethers::providers::RpcError;
use ethers::types::Filter;

use crate::etl::event::{Address, RawLog, H256};

pub use jsonrpc::JsonRpcProvider;
pub use pool::{FatalHook, ProviderPool};

/// Errors surfaced by a chain provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Network failure, timeout or non-success HTTP status.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node answered with a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The node answered, but the payload could not be interpreted.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// No configured endpoint answered a height query.
    #[error("all {0} provider endpoint(s) failed the height query")]
    Exhausted(usize),
}

impl ProviderError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }

    /// An `eth_call` that reverted. The endpoint is healthy; the contract said no.
    pub fn is_revert(&self) -> bool {
        match self {
            Self::Rpc { code, message } => *code == 3 || message.contains("execution reverted"),
            _ => false,
        }
    }
}

impl From<ethers::providers::ProviderError> for ProviderError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        if let Some(response) = err.as_error_response() {
            return Self::Rpc {
                code: response.code,
                message: response.message.clone(),
            };
        }
        if err.as_serde_error().is_some() {
            return Self::Malformed(err.to_string());
        }
        Self::Transport(err.to_string())
    }
}

/// `eth_getLogs` filter restricted to what the pipeline needs: a block range
/// and a set of accepted topic-0 signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub topics: Vec<H256>,
}

impl LogFilter {
    pub fn single_block(block_num: u64, topics: Vec<H256>) -> Self {
        Self {
            from_block: block_num,
            to_block: block_num,
            topics,
        }
    }
}

impl From<&LogFilter> for Filter {
    // Topic filters are positional; the signatures all go in position 0 as an OR-set.
    fn from(filter: &LogFilter) -> Self {
        Filter::new()
            .from_block(filter.from_block)
            .to_block(filter.to_block)
            .topic0(filter.topics.clone())
    }
}

/// Typed view of the node operations the pipeline consumes.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Human-readable endpoint label for logs.
    fn endpoint(&self) -> &str;

    /// Current chain height.
    async fn block_height(&self) -> Result<u64, ProviderError>;

    /// Logs matching `filter`, as returned by the node.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ProviderError>;

    /// Read-only contract call at the latest block, returning the raw return data.
    async fn call_read_only(&self, to: Address, calldata: &[u8]) -> Result<Vec<u8>, ProviderError>;
}
