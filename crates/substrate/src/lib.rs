//! Substrate chain adapter for the watchtower indexer.
//!
//! Implements the `ChainClient` port from `watchtower-core` on top of
//! `subxt` with dynamic decoding, plus the SS58 ingress codec.

mod client;
pub mod ss58;

pub use client::{SubstrateClient, SubstrateClientConfig};
pub use ss58::{parse_account_address, AddressError};
