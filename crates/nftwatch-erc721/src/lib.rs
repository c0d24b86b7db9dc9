//! ERC721 support for nftwatch
//!
//! Decodes ERC721 `Transfer` logs into [`nftwatch::etl::event::TransferEvent`]s.
//! Ownership of these tokens is single-holder and goes through the reconciler.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nftwatch::etl::DecoderContext;
//! use nftwatch_erc721::Erc721Decoder;
//!
//! let context = DecoderContext::new(vec![Arc::new(Erc721Decoder::new())])?;
//! ```

pub mod decoder;

pub use decoder::Erc721Decoder;
