//! BIP44 derivation on the Tron branch: m/44'/195'/0'/0/{index}.

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::secp256k1::{PublicKey, SecretKey};
use std::str::FromStr;

use super::{secp, KeyError, MasterSeed, TronAddress};

/// Purpose / coin type / account / change. Address index is appended.
pub const BRANCH_PATH: &str = "m/44'/195'/0'/0";

/// Index 0 is the treasury address.
pub const MASTER_INDEX: u32 = 0;

/// Private key for one derived address. Wiped on drop.
pub struct SigningKey {
    secret: SecretKey,
    address: TronAddress,
}

impl SigningKey {
    pub fn from_secret(secret: SecretKey) -> Self {
        let address = TronAddress::from_public_key(&PublicKey::from_secret_key(secp(), &secret).serialize_uncompressed());
        Self { secret, address }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let secret = SecretKey::from_slice(bytes).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Ok(Self::from_secret(secret))
    }

    pub fn address(&self) -> &TronAddress { &self.address }

    pub(crate) fn secret(&self) -> &SecretKey { &self.secret }
}

impl Drop for SigningKey {
    fn drop(&mut self) { self.secret.non_secure_erase(); }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").field("address", &self.address).finish_non_exhaustive()
    }
}

/// Address plus the key that controls it.
#[derive(Debug)]
pub struct DerivedKey {
    pub index: u32,
    pub address: TronAddress,
    pub key: SigningKey,
}

pub(crate) fn branch_xpriv(seed: &[u8]) -> Result<Xpriv, KeyError> {
    let master = Xpriv::new_master(bitcoin::Network::Bitcoin, seed)
        .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
    let path = DerivationPath::from_str(BRANCH_PATH).map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
    master
        .derive_priv(secp(), &path)
        .map_err(|e| KeyError::DerivationFailed(e.to_string()))
}

/// Pure and deterministic: same (seed, index) always yields the same key.
pub fn derive_key(seed: &MasterSeed, index: u32) -> Result<DerivedKey, KeyError> {
    let child = ChildNumber::from_normal_idx(index).map_err(|_| KeyError::IndexOutOfRange(index))?;
    let xpriv = seed
        .branch()
        .derive_priv(secp(), &[child])
        .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
    let key = SigningKey::from_secret(xpriv.private_key);
    Ok(DerivedKey { index, address: *key.address(), key })
}

pub fn derive_address(seed: &MasterSeed, index: u32) -> Result<TronAddress, KeyError> {
    derive_key(seed, index).map(|d| d.address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn seed() -> MasterSeed { MasterSeed::from_mnemonic(TEST_MNEMONIC).unwrap() }

    #[test]
    fn matches_reference_vectors() {
        let seed = seed();
        assert_eq!(derive_address(&seed, 0).unwrap().to_string(), "TUEZSdKsoDHQMeZwihtdoBiN46zxhGWYdH");
        assert_eq!(derive_address(&seed, 1).unwrap().to_string(), "TSeJkUh4Qv67VNFwY8LaAxERygNdy6NQZK");
        assert_eq!(derive_address(&seed, 2).unwrap().to_string(), "TYJPRrdB5APNeRs4R7fYZSwW3TcrTKw2gx");
    }

    #[test]
    fn key_for_private_key_one() {
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        let key = SigningKey::from_slice(&bytes).unwrap();
        assert_eq!(key.address().to_string(), "TMVQGm1qAQYVdetCeGRRkTWYYrLXuHK2HC");
    }

    #[test]
    fn deterministic_and_unique() {
        let seed = seed();
        let mut seen = HashSet::new();
        for i in 0..300 {
            let a = derive_address(&seed, i).unwrap();
            assert_eq!(a, derive_address(&seed, i).unwrap());
            assert!(seen.insert(a), "index {} collided", i);
        }
    }

    #[test]
    fn hardened_index_rejected() {
        assert!(matches!(derive_key(&seed(), 0x8000_0000), Err(KeyError::IndexOutOfRange(_))));
    }
}
