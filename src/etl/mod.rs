pub mod decoder;
pub mod event;
pub mod extractor;
pub mod identification;
pub mod provider;
pub mod reconcile;

pub use decoder::{DecodedBlock, Decoder, DecoderContext};
pub use event::{Address, EventKind, RawLog, SourceTag, TokenStandard, TransferEvent, Version};
pub use extractor::{BlockLogFetcher, BlockOutcome};
pub use identification::{Classification, ContractClassifier};
pub use provider::{ChainProvider, JsonRpcProvider, ProviderError, ProviderPool};
pub use reconcile::{OwnershipReconciler, ReconcileSummary};
