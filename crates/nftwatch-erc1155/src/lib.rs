//! ERC1155 support for nftwatch
//!
//! Decodes `TransferSingle` and `TransferBatch` logs. Balances are multi-holder,
//! so these events feed owner tasks for an external balance job instead of the
//! ownership reconciler.

pub mod decoder;

pub use decoder::Erc1155Decoder;
