//! CryptoPunks support for nftwatch
//!
//! The CryptoPunks market contract predates ERC-721 and emits its own events:
//! `Assign`, `PunkTransfer` and `PunkBought`.

pub mod decoder;

pub use decoder::CryptoPunksDecoder;
