//! Prioritized failover pool over a fixed list of chain providers.
//!
//! The pool keeps one active endpoint. A failed call triggers a single
//! reconnect that scans the endpoints starting right after the one that
//! failed, then the call is retried once on whichever endpoint answered. If
//! no endpoint answers a height query the pool is exhausted: the fatal hook
//! runs and `ProviderError::Exhausted` is returned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ChainProvider, LogFilter, ProviderError};
use crate::etl::event::{Address, RawLog};

/// Bounds on the period between provider resets. `tokio::time::interval`
/// panics on a zero period and on one that overflows `Instant`.
pub const MIN_RESET_INTERVAL: Duration = Duration::from_millis(1);
pub const MAX_RESET_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Invoked once per exhausted reconnect, before the error is returned.
pub type FatalHook = Arc<dyn Fn(&ProviderError) + Send + Sync>;

#[derive(Debug, Default)]
struct PoolState {
    /// Index of the active endpoint, `None` until the first connect or after a reset.
    active: Option<usize>,
    /// Bumped on every successful connect and every reset.
    generation: u64,
}

pub struct ProviderPool {
    providers: Vec<Arc<dyn ChainProvider>>,
    state: Mutex<PoolState>,
    fatal_hook: FatalHook,
}

impl ProviderPool {
    /// Creates a pool over `providers`, in priority order.
    ///
    /// The default fatal hook logs and exits the process with status 1.
    pub fn new(providers: Vec<Arc<dyn ChainProvider>>) -> anyhow::Result<Self> {
        if providers.is_empty() {
            anyhow::bail!("Provider pool needs at least one endpoint");
        }

        Ok(Self {
            providers,
            state: Mutex::new(PoolState::default()),
            fatal_hook: Arc::new(exit_process),
        })
    }

    /// Replaces the fatal hook. Tests install an observing hook here.
    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = hook;
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Index of the active endpoint, if any.
    pub async fn active_index(&self) -> Option<usize> {
        self.state.lock().await.active
    }

    /// Queries endpoint heights starting after the active one (or at priority 0 when
    /// there is none) and makes the first one that answers active.
    pub async fn connect(&self) -> Result<Arc<dyn ChainProvider>, ProviderError> {
        let mut state = self.state.lock().await;
        self.connect_locked(&mut state).await
    }

    /// Forgets the active endpoint so the next call scans from priority 0 again.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.active = None;
        state.generation += 1;
        tracing::info!(
            target: "nftwatch::pool",
            "Provider pointer reset, next call scans from priority 0"
        );
    }

    /// Spawns the periodic reset task. It stops when `shutdown` is cancelled.
    ///
    /// `every` is clamped to [`MIN_RESET_INTERVAL`]..=[`MAX_RESET_INTERVAL`].
    pub fn spawn_daily_reset(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let clamped = every.clamp(MIN_RESET_INTERVAL, MAX_RESET_INTERVAL);
        if clamped != every {
            tracing::warn!(
                target: "nftwatch::pool",
                requested = ?every,
                using = ?clamped,
                "Provider reset interval out of range"
            );
        }
        let every = clamped;
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::debug!(target: "nftwatch::pool", "Provider reset task stopped");
                        break;
                    }
                    _ = interval.tick() => pool.reset().await,
                }
            }
        })
    }

    pub async fn block_height(&self) -> Result<u64, ProviderError> {
        self.with_failover("block_height", |provider| async move {
            provider.block_height().await
        })
        .await
    }

    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ProviderError> {
        self.with_failover("get_logs", |provider| async move {
            provider.get_logs(filter).await
        })
        .await
    }

    pub async fn call_read_only(
        &self,
        to: Address,
        calldata: &[u8],
    ) -> Result<Vec<u8>, ProviderError> {
        self.with_failover("call_read_only", |provider| async move {
            provider.call_read_only(to, calldata).await
        })
        .await
    }

    /// Runs `operation` on the active provider; on failure reconnects once and
    /// retries once. The retry's error is returned as is. Reverts are contract
    /// answers and are returned without rotating.
    async fn with_failover<T, F, Fut>(&self, name: &str, operation: F) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn ChainProvider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let (provider, generation) = self.current().await?;

        match operation(Arc::clone(&provider)).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_revert() => Err(err),
            Err(err) => {
                tracing::warn!(
                    target: "nftwatch::pool",
                    endpoint = provider.endpoint(),
                    operation = name,
                    error = %err,
                    "Provider call failed, rotating and retrying once"
                );
                let provider = self.rotate(generation).await?;
                operation(provider).await
            }
        }
    }

    async fn current(&self) -> Result<(Arc<dyn ChainProvider>, u64), ProviderError> {
        let mut state = self.state.lock().await;
        let provider = match state.active {
            Some(index) => Arc::clone(&self.providers[index]),
            None => self.connect_locked(&mut state).await?,
        };
        Ok((provider, state.generation))
    }

    /// Reconnects unless another caller already rotated since `observed`.
    async fn rotate(&self, observed: u64) -> Result<Arc<dyn ChainProvider>, ProviderError> {
        let mut state = self.state.lock().await;
        if state.generation != observed {
            if let Some(index) = state.active {
                tracing::debug!(
                    target: "nftwatch::pool",
                    endpoint = self.providers[index].endpoint(),
                    "Provider already rotated by another caller"
                );
                return Ok(Arc::clone(&self.providers[index]));
            }
        }
        self.connect_locked(&mut state).await
    }

    async fn connect_locked(
        &self,
        state: &mut PoolState,
    ) -> Result<Arc<dyn ChainProvider>, ProviderError> {
        let count = self.providers.len();
        let start = state.active.map_or(0, |index| (index + 1) % count);

        for offset in 0..count {
            let index = (start + offset) % count;
            let provider = &self.providers[index];
            match provider.block_height().await {
                Ok(height) => {
                    state.active = Some(index);
                    state.generation += 1;
                    tracing::info!(
                        target: "nftwatch::pool",
                        endpoint = provider.endpoint(),
                        index,
                        height,
                        "Connected to provider"
                    );
                    return Ok(Arc::clone(provider));
                }
                Err(err) => {
                    tracing::warn!(
                        target: "nftwatch::pool",
                        endpoint = provider.endpoint(),
                        index,
                        error = %err,
                        "Provider failed height check"
                    );
                }
            }
        }

        state.active = None;
        let err = ProviderError::Exhausted(count);
        tracing::error!(target: "nftwatch::pool", error = %err, "No provider endpoint is reachable");
        (self.fatal_hook)(&err);
        Err(err)
    }
}

fn exit_process(err: &ProviderError) {
    tracing::error!(target: "nftwatch::pool", error = %err, "Chain access lost, terminating");
    std::process::exit(1);
}
