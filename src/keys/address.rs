//! Tron addresses: 0x41 ‖ keccak256(pubkey)[12..], base58check encoded.

use bitcoin::base58;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

use super::KeyError;

/// Mainnet address prefix byte.
pub const ADDRESS_PREFIX: u8 = 0x41;
pub const ADDRESS_LEN: usize = 21;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TronAddress([u8; ADDRESS_LEN]);

impl TronAddress {
    /// From a 65-byte uncompressed SEC1 public key (leading 0x04).
    pub fn from_public_key(uncompressed: &[u8; 65]) -> Self {
        let hash = Keccak256::digest(&uncompressed[1..]);
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[0] = ADDRESS_PREFIX;
        bytes[1..].copy_from_slice(&hash[12..]);
        Self(bytes)
    }

    /// Well-known addresses baked into the binary. The prefix is not checked.
    pub const fn from_raw(bytes: [u8; ADDRESS_LEN]) -> Self { Self(bytes) }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidAddress(format!("expected {} bytes, got {}", ADDRESS_LEN, bytes.len())))?;
        if bytes[0] != ADDRESS_PREFIX {
            return Err(KeyError::InvalidAddress(format!("unexpected prefix 0x{:02x}", bytes[0])));
        }
        Ok(Self(bytes))
    }

    /// Parse a base58check `T...` address.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let s = s.trim();
        if s.len() != 34 || !s.starts_with('T') {
            return Err(KeyError::InvalidAddress(s.to_string()));
        }
        let decoded = base58::decode_check(s).map_err(|e| KeyError::InvalidAddress(format!("{}: {}", s, e)))?;
        Self::from_bytes(&decoded)
    }

    /// Parse `41…` hex (21 bytes) or EVM-style `0x…` hex (20 bytes).
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let raw = s.trim().trim_start_matches("0x");
        let bytes = hex::decode(raw).map_err(|e| KeyError::InvalidAddress(format!("{}: {}", s, e)))?;
        match bytes.len() {
            20 => {
                let mut full = [0u8; ADDRESS_LEN];
                full[0] = ADDRESS_PREFIX;
                full[1..].copy_from_slice(&bytes);
                Ok(Self(full))
            }
            _ => Self::from_bytes(&bytes),
        }
    }

    /// Accept any of the encodings the chain APIs hand back.
    pub fn parse_any(s: &str) -> Result<Self, KeyError> {
        if s.starts_with('T') { Self::parse(s) } else { Self::from_hex(s) }
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] { &self.0 }

    pub fn to_hex(&self) -> String { hex::encode(self.0) }

    /// 32-byte ABI word (address left-padded) for TRC-20 call data.
    pub fn abi_word(&self) -> String { format!("{:0>64}", hex::encode(&self.0[1..])) }

    pub fn to_base58(&self) -> String { base58::encode_check(&self.0) }
}

pub fn is_valid_address(s: &str) -> bool { TronAddress::parse(s).is_ok() }

impl fmt::Display for TronAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.to_base58()) }
}

impl fmt::Debug for TronAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "TronAddress({})", self.to_base58()) }
}

impl FromStr for TronAddress {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl TryFrom<String> for TronAddress {
    type Error = KeyError;
    fn try_from(s: String) -> Result<Self, Self::Error> { Self::parse(&s) }
}

impl From<TronAddress> for String {
    fn from(a: TronAddress) -> Self { a.to_base58() }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDT_MAINNET: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

    #[test]
    fn parses_known_contract() {
        let addr = TronAddress::parse(USDT_MAINNET).unwrap();
        assert_eq!(addr.to_hex(), "41a614f803b6fd780986a42c78ec9c7f77e6ded13c");
        assert_eq!(addr.to_string(), USDT_MAINNET);
    }

    #[test]
    fn hex_forms_roundtrip() {
        let addr = TronAddress::parse(USDT_MAINNET).unwrap();
        assert_eq!(TronAddress::from_hex(&addr.to_hex()).unwrap(), addr);
        assert_eq!(TronAddress::from_hex("0xa614f803b6fd780986a42c78ec9c7f77e6ded13c").unwrap(), addr);
        assert_eq!(TronAddress::parse_any("41a614f803b6fd780986a42c78ec9c7f77e6ded13c").unwrap(), addr);
    }

    #[test]
    fn rejects_bad_checksum_and_shape() {
        assert!(!is_valid_address("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6u"));
        assert!(!is_valid_address("XR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t"));
        assert!(!is_valid_address("TR7NHqjeKQx"));
        assert!(!is_valid_address(""));
        assert!(TronAddress::from_hex("42a614f803b6fd780986a42c78ec9c7f77e6ded13c").is_err());
    }

    #[test]
    fn abi_word_is_left_padded() {
        let addr = TronAddress::parse(USDT_MAINNET).unwrap();
        let word = addr.abi_word();
        assert_eq!(word.len(), 64);
        assert!(word.starts_with("000000000000000000000000a614f8"));
    }

    #[test]
    fn serde_uses_base58() {
        let addr = TronAddress::parse(USDT_MAINNET).unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", USDT_MAINNET));
        let back: TronAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
