//! Ethereum JSON-RPC provider over HTTP, backed by `ethers`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{BlockId, BlockNumber, Filter, TransactionRequest};
use url::Url;

use super::{ChainProvider, LogFilter, ProviderError};
use crate::etl::event::{Address, RawLog};

pub struct JsonRpcProvider {
    provider: Provider<Http>,
    label: String,
    timeout: Duration,
}

impl JsonRpcProvider {
    pub fn new(url: Url, timeout: Duration) -> anyhow::Result<Self> {
        // Endpoint URLs often embed API keys in the path; only log the host.
        let label = url.host_str().unwrap_or("unknown-host").to_string();

        Ok(Self {
            provider: Provider::new(Http::new(url)),
            label,
            timeout,
        })
    }

    async fn request<T, F>(&self, method: &'static str, request: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ethers::providers::ProviderError>>,
    {
        tracing::trace!(target: "nftwatch::provider", endpoint = %self.label, method, "JSON-RPC request");

        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(ProviderError::from),
            Err(_) => Err(ProviderError::Transport(format!(
                "{method} to {} timed out after {:?}",
                self.label, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl ChainProvider for JsonRpcProvider {
    fn endpoint(&self) -> &str {
        &self.label
    }

    async fn block_height(&self) -> Result<u64, ProviderError> {
        let height = self
            .request("eth_blockNumber", self.provider.get_block_number())
            .await?;
        Ok(height.as_u64())
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ProviderError> {
        let filter = Filter::from(filter);
        let logs = self.request("eth_getLogs", self.provider.get_logs(&filter)).await?;

        logs.into_iter()
            .map(|log| RawLog::try_from(log).map_err(|e| ProviderError::Malformed(format!("eth_getLogs: {e}"))))
            .collect()
    }

    async fn call_read_only(&self, to: Address, calldata: &[u8]) -> Result<Vec<u8>, ProviderError> {
        let call: TypedTransaction = TransactionRequest::new().to(to).data(calldata.to_vec()).into();
        let output = self
            .request(
                "eth_call",
                self.provider.call(&call, Some(BlockId::Number(BlockNumber::Latest))),
            )
            .await?;
        Ok(output.to_vec())
    }
}
