//! Keys - one master seed, an unbounded stream of Tron addresses.
//!
//! The mnemonic never leaves this module. Callers get addresses, or a
//! short-lived [`SigningKey`] for exactly one signing call.

mod address;
mod derive;
mod seed;

use bitcoin::secp256k1::{All, Secp256k1};
use std::path::PathBuf;
use std::sync::OnceLock;

pub use address::{is_valid_address, TronAddress, ADDRESS_PREFIX};
pub use derive::{derive_address, derive_key, DerivedKey, SigningKey, BRANCH_PATH, MASTER_INDEX};
pub use seed::{EncryptedSeed, MasterSeed, SeedVault};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("derivation failed: {0}")]
    DerivationFailed(String),
    #[error("index {0} is outside the non-hardened range")]
    IndexOutOfRange(u32),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("wrong passphrase")]
    WrongPassphrase,
    #[error("vault: {0}")]
    Vault(String),
    #[error("vault already exists at {0}")]
    AlreadyExists(PathBuf),
}

pub(crate) fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

/// Owns the master seed and hands out derived material.
pub struct KeyRing {
    seed: MasterSeed,
    master: TronAddress,
}

impl KeyRing {
    pub fn new(seed: MasterSeed) -> Result<Self, KeyError> {
        let master = derive_address(&seed, MASTER_INDEX)?;
        Ok(Self { seed, master })
    }

    /// Treasury address (index 0). Sweeps land here, withdrawals leave from here.
    pub fn master_address(&self) -> &TronAddress { &self.master }

    pub fn address(&self, index: u32) -> Result<TronAddress, KeyError> { derive_address(&self.seed, index) }

    pub fn signing_key(&self, index: u32) -> Result<SigningKey, KeyError> {
        derive_key(&self.seed, index).map(|d| d.key)
    }

    pub fn master_key(&self) -> Result<SigningKey, KeyError> { self.signing_key(MASTER_INDEX) }

    /// Addresses for `start..start + count`.
    pub fn derive_batch(&self, start: u32, count: u32) -> Result<Vec<(u32, TronAddress)>, KeyError> {
        let end = start.checked_add(count).ok_or(KeyError::IndexOutOfRange(start))?;
        (start..end).map(|i| self.address(i).map(|a| (i, a))).collect()
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing").field("master", &self.master).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn keyring_master_is_index_zero() {
        let ring = KeyRing::new(MasterSeed::from_mnemonic(TEST_MNEMONIC).unwrap()).unwrap();
        assert_eq!(ring.master_address().to_string(), "TUEZSdKsoDHQMeZwihtdoBiN46zxhGWYdH");
        assert_eq!(ring.master_key().unwrap().address(), ring.master_address());
    }

    #[test]
    fn batch_is_contiguous() {
        let ring = KeyRing::new(MasterSeed::from_mnemonic(TEST_MNEMONIC).unwrap()).unwrap();
        let batch = ring.derive_batch(1, 3).unwrap();
        assert_eq!(batch.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(batch[0].1.to_string(), "TSeJkUh4Qv67VNFwY8LaAxERygNdy6NQZK");
    }

    #[test]
    fn invalid_mnemonic() {
        assert!(matches!(MasterSeed::from_mnemonic("not a mnemonic"), Err(KeyError::InvalidMnemonic(_))));
    }
}
