//! Address syntax validation
//!
//! Checks encoding, checksum and network prefix only; whether the wallet
//! owns an address is the daemon's business.

use sha2::{Digest, Sha256};

use crate::node::config::Network;

/// Current-generation shielded payload length
const SAPLING_PAYLOAD_LEN: usize = 43;

/// Version (2) + hash160 (20)
const TRANSPARENT_PAYLOAD_LEN: usize = 22;

/// Version (2) + a_pk (32) + pk_enc (32)
const SPROUT_PAYLOAD_LEN: usize = 66;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Transparent,
    /// Older shielded pool
    Sprout,
    /// Newer shielded pool
    Sapling,
}

impl AddressKind {
    /// Whether outputs to this kind of address can carry a memo
    pub fn is_shielded(&self) -> bool {
        !matches!(self, AddressKind::Transparent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("invalid encoding: {0}")]
    Encoding(String),
    #[error("checksum mismatch")]
    Checksum,
    #[error("not a {0} address")]
    WrongNetwork(&'static str),
    #[error("unexpected payload length {0}")]
    Length(usize),
}

fn sapling_hrp(network: Network) -> &'static str {
    match network {
        Network::Mainnet => "zs",
        Network::Testnet => "ztestsapling",
    }
}

fn transparent_versions(network: Network) -> &'static [[u8; 2]] {
    match network {
        // t1 (P2PKH), t3 (P2SH)
        Network::Mainnet => &[[0x1C, 0xB8], [0x1C, 0xBD]],
        // tm (P2PKH), t2 (P2SH)
        Network::Testnet => &[[0x1D, 0x25], [0x1C, 0xBA]],
    }
}

fn sprout_version(network: Network) -> [u8; 2] {
    match network {
        Network::Mainnet => [0x16, 0x9A],
        Network::Testnet => [0x16, 0xB6],
    }
}

/// Classify `address` for `network`, validating its encoding and checksum
pub fn parse_address(address: &str, network: Network) -> Result<AddressKind, AddressError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(AddressError::Empty);
    }

    if address.to_lowercase().starts_with(&format!("{}1", sapling_hrp(network))) {
        return parse_sapling(address, network);
    }

    parse_base58(address, network)
}

fn parse_sapling(address: &str, network: Network) -> Result<AddressKind, AddressError> {
    let (hrp, data) =
        bech32::decode(address).map_err(|e| AddressError::Encoding(e.to_string()))?;
    if hrp.to_string() != sapling_hrp(network) {
        return Err(AddressError::WrongNetwork(network.as_str()));
    }
    if data.len() != SAPLING_PAYLOAD_LEN {
        return Err(AddressError::Length(data.len()));
    }
    Ok(AddressKind::Sapling)
}

fn parse_base58(address: &str, network: Network) -> Result<AddressKind, AddressError> {
    let raw = bs58::decode(address)
        .into_vec()
        .map_err(|e| AddressError::Encoding(e.to_string()))?;
    if raw.len() < 6 {
        return Err(AddressError::Length(raw.len()));
    }

    let (payload, checksum) = raw.split_at(raw.len() - 4);
    let digest = Sha256::digest(Sha256::digest(payload));
    if &digest[..4] != checksum {
        return Err(AddressError::Checksum);
    }

    let version = [payload[0], payload[1]];
    match payload.len() {
        TRANSPARENT_PAYLOAD_LEN if transparent_versions(network).contains(&version) => {
            Ok(AddressKind::Transparent)
        }
        SPROUT_PAYLOAD_LEN if version == sprout_version(network) => Ok(AddressKind::Sprout),
        TRANSPARENT_PAYLOAD_LEN | SPROUT_PAYLOAD_LEN => {
            Err(AddressError::WrongNetwork(network.as_str()))
        }
        len => Err(AddressError::Length(len)),
    }
}
