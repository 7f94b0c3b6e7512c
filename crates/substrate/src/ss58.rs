//! Address ingress: SS58 and hex to canonical public keys.
//!
//! Addresses arriving over the wire are converted once, here, and the
//! rest of the system only ever sees 32-byte public keys.

use std::str::FromStr;

use subxt::utils::AccountId32;
use thiserror::Error;

use watchtower_core::models::AccountId;

/// An address string that failed validation.
#[derive(Debug, Error)]
#[error("invalid address {address:?}: {reason}")]
pub struct AddressError {
    pub address: String,
    pub reason: String,
}

/// Parse an account from either a 0x-prefixed 32-byte hex public key
/// or an SS58 address (checksum verified, any network prefix).
pub fn parse_account_address(value: &str) -> Result<AccountId, AddressError> {
    let trimmed = value.trim();

    if trimmed.starts_with("0x") || looks_like_hex(trimmed) {
        return AccountId::from_hex(trimmed).map_err(|e| AddressError {
            address: value.to_string(),
            reason: e.to_string(),
        });
    }

    AccountId32::from_str(trimmed)
        .map(|account| AccountId(account.0))
        .map_err(|e| AddressError {
            address: value.to_string(),
            reason: e.to_string(),
        })
}

fn looks_like_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
