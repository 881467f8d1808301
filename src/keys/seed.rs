//! MasterSeed and its encrypted-at-rest vault file.
//!
//! The vault holds the BIP39 mnemonic sealed with ChaCha20-Poly1305. The key is
//! derived from the operator passphrase and a random salt with blake3; a keyed
//! blake3 verifier lets `open` reject a wrong passphrase before decrypting.

use base64::Engine;
use bip39::Mnemonic;
use bitcoin::bip32::Xpriv;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use super::derive::branch_xpriv;
use super::KeyError;

const AAD_SEED: &[u8] = b"tron-custody-master-seed";
const KDF_CONTEXT: &str = "tron-custody 2024 seed vault key";
const VERIFIER_TAG: &[u8] = b"verifier";
const VAULT_VERSION: u32 = 1;

/// The decrypted root secret. Lives only inside the key ring.
pub struct MasterSeed {
    mnemonic: Zeroizing<String>,
    branch: Xpriv,
}

impl MasterSeed {
    pub fn from_mnemonic(words: &str) -> Result<Self, KeyError> {
        let mnemonic = Mnemonic::parse_normalized(words).map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
        let seed = Zeroizing::new(mnemonic.to_seed(""));
        let branch = branch_xpriv(&seed[..])?;
        Ok(Self { mnemonic: Zeroizing::new(mnemonic.to_string()), branch })
    }

    /// Fresh 24-word seed from OS randomness.
    pub fn generate() -> Result<Self, KeyError> {
        let mut entropy = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut entropy[..]);
        let mnemonic = Mnemonic::from_entropy(&entropy[..]).map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
        Self::from_mnemonic(&mnemonic.to_string())
    }

    pub(crate) fn branch(&self) -> &Xpriv { &self.branch }

    pub(crate) fn mnemonic(&self) -> &str { &self.mnemonic }
}

impl std::fmt::Debug for MasterSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("MasterSeed(..)") }
}

/// On-disk format. All binary fields are base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSeed {
    pub version: u32,
    pub salt: String,
    pub verifier: String,
    pub nonce: String,
    pub ciphertext: String,
    pub created_at: DateTime<Utc>,
}

impl EncryptedSeed {
    pub fn seal(seed: &MasterSeed, passphrase: &str) -> Result<Self, KeyError> {
        let mut salt = [0u8; 16];
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = derive_key(passphrase, &salt);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: seed.mnemonic().as_bytes(), aad: AAD_SEED })
            .map_err(|_| KeyError::Vault("encryption failed".into()))?;

        Ok(Self {
            version: VAULT_VERSION,
            salt: encode_base64(&salt),
            verifier: verifier(&key),
            nonce: encode_base64(&nonce),
            ciphertext: encode_base64(&ciphertext),
            created_at: Utc::now(),
        })
    }

    pub fn open(&self, passphrase: &str) -> Result<MasterSeed, KeyError> {
        if self.version != VAULT_VERSION {
            return Err(KeyError::Vault(format!("unsupported vault version {}", self.version)));
        }
        let salt = decode_base64(&self.salt)?;
        let key = derive_key(passphrase, &salt);
        if verifier(&key) != self.verifier {
            return Err(KeyError::WrongPassphrase);
        }

        let nonce: [u8; 12] = decode_base64(&self.nonce)?
            .try_into()
            .map_err(|_| KeyError::Vault("nonce invalid".into()))?;
        let ciphertext = decode_base64(&self.ciphertext)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce), Payload { msg: &ciphertext, aad: AAD_SEED })
                .map_err(|_| KeyError::Vault("ciphertext rejected".into()))?,
        );
        let words = std::str::from_utf8(&plaintext).map_err(|_| KeyError::Vault("mnemonic not utf-8".into()))?;
        MasterSeed::from_mnemonic(words)
    }
}

/// File-backed seed storage. Created once at first boot.
pub struct SeedVault;

impl SeedVault {
    /// `$DATA_DIR/tron-custody/seed.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("tron-custody").join("seed.json"))
    }

    pub fn exists(path: &Path) -> bool { path.is_file() }

    pub fn create(path: &Path, passphrase: &str) -> Result<MasterSeed, KeyError> {
        let seed = MasterSeed::generate()?;
        Self::store(path, passphrase, &seed)?;
        Ok(seed)
    }

    pub fn import(path: &Path, passphrase: &str, mnemonic: &str) -> Result<MasterSeed, KeyError> {
        let seed = MasterSeed::from_mnemonic(mnemonic)?;
        Self::store(path, passphrase, &seed)?;
        Ok(seed)
    }

    pub fn open(path: &Path, passphrase: &str) -> Result<MasterSeed, KeyError> {
        let data = std::fs::read_to_string(path).map_err(|e| KeyError::Vault(format!("{}: {}", path.display(), e)))?;
        let sealed: EncryptedSeed =
            serde_json::from_str(&data).map_err(|e| KeyError::Vault(format!("vault corrupt: {}", e)))?;
        sealed.open(passphrase)
    }

    /// Returns the seed and whether it was created by this call.
    pub fn load_or_create(path: &Path, passphrase: &str) -> Result<(MasterSeed, bool), KeyError> {
        if Self::exists(path) {
            Ok((Self::open(path, passphrase)?, false))
        } else {
            Ok((Self::create(path, passphrase)?, true))
        }
    }

    fn store(path: &Path, passphrase: &str, seed: &MasterSeed) -> Result<(), KeyError> {
        if Self::exists(path) {
            return Err(KeyError::AlreadyExists(path.to_path_buf()));
        }
        if passphrase.is_empty() {
            return Err(KeyError::Vault("passphrase must not be empty".into()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KeyError::Vault(e.to_string()))?;
        }
        let sealed = EncryptedSeed::seal(seed, passphrase)?;
        let json = serde_json::to_string_pretty(&sealed).map_err(|e| KeyError::Vault(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| KeyError::Vault(format!("{}: {}", path.display(), e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| KeyError::Vault(e.to_string()))?;
        }
        Ok(())
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut material = Zeroizing::new(Vec::with_capacity(passphrase.len() + salt.len()));
    material.extend_from_slice(passphrase.as_bytes());
    material.extend_from_slice(salt);
    Zeroizing::new(blake3::derive_key(KDF_CONTEXT, &material))
}

fn verifier(key: &[u8; 32]) -> String {
    blake3::keyed_hash(key, VERIFIER_TAG).to_hex().to_string()
}

fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn decode_base64(value: &str) -> Result<Vec<u8>, KeyError> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| KeyError::Vault(format!("base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derive_address;
    use tempfile::TempDir;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn import_then_open() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("vault").join("seed.json");
        let imported = SeedVault::import(&path, "correct horse", TEST_MNEMONIC).unwrap();
        let opened = SeedVault::open(&path, "correct horse").unwrap();
        assert_eq!(derive_address(&imported, 0).unwrap(), derive_address(&opened, 0).unwrap());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("abandon"));
    }

    #[test]
    fn wrong_passphrase_rejected_by_verifier() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("seed.json");
        SeedVault::import(&path, "right", TEST_MNEMONIC).unwrap();
        assert!(matches!(SeedVault::open(&path, "wrong"), Err(KeyError::WrongPassphrase)));
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let seed = MasterSeed::from_mnemonic(TEST_MNEMONIC).unwrap();
        let mut sealed = EncryptedSeed::seal(&seed, "pw").unwrap();
        let mut bytes = decode_base64(&sealed.ciphertext).unwrap();
        bytes[0] ^= 0xff;
        sealed.ciphertext = encode_base64(&bytes);
        assert!(matches!(sealed.open("pw"), Err(KeyError::Vault(_))));
    }

    #[test]
    fn load_or_create_is_stable() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("seed.json");
        let (first, created) = SeedVault::load_or_create(&path, "pw").unwrap();
        assert!(created);
        let (second, created) = SeedVault::load_or_create(&path, "pw").unwrap();
        assert!(!created);
        assert_eq!(derive_address(&first, 7).unwrap(), derive_address(&second, 7).unwrap());
        assert!(matches!(SeedVault::create(&path, "pw"), Err(KeyError::AlreadyExists(_))));
    }

    #[test]
    fn generated_seeds_differ() {
        let a = MasterSeed::generate().unwrap();
        let b = MasterSeed::generate().unwrap();
        assert_eq!(a.mnemonic().split_whitespace().count(), 24);
        assert_ne!(derive_address(&a, 0).unwrap(), derive_address(&b, 0).unwrap());
    }
}
