//! Signer - secp256k1 over SHA-256 of the raw transaction bytes.
//!
//! Output is `r ‖ s ‖ (recovery_id + 27)`. The recovery id is found by trial:
//! each candidate is recovered and reduced to an address until one matches the
//! sender. Every signature is verified before it leaves this module.

use bitcoin::secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use bitcoin::secp256k1::Message;
use sha2::{Digest, Sha256};

use crate::chain::{SignedTransaction, UnsignedTransaction};
use crate::error::{CustodyError, CustodyResult};
use crate::keys::{secp, SigningKey, TronAddress};

pub const SIGNATURE_LEN: usize = 65;

/// Sign `preimage` for `expected` (the sender the key must control).
pub fn sign(preimage: &[u8], key: &SigningKey, expected: &TronAddress) -> CustodyResult<[u8; SIGNATURE_LEN]> {
    if key.address() != expected {
        return Err(CustodyError::Invariant(format!("key for {} asked to sign as {}", key.address(), expected)));
    }
    let message = message_for(preimage);
    let mut signature = secp().sign_ecdsa(&message, key.secret());
    signature.normalize_s();
    let compact = signature.serialize_compact();

    let recovery_id = (0..4)
        .find(|&id| recovered_address(&message, &compact, id).as_ref() == Some(expected))
        .ok_or_else(|| CustodyError::SignatureMismatch(expected.to_string()))?;

    let mut out = [0u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id as u8 + 27;

    if !verify(&out, preimage, expected) {
        tracing::error!(address = %expected, "signature failed self-verification");
        return Err(CustodyError::SignatureMismatch(expected.to_string()));
    }
    Ok(out)
}

/// Accepts v as 27/28 or 0/1.
pub fn verify(signature: &[u8], preimage: &[u8], expected: &TronAddress) -> bool {
    if signature.len() != SIGNATURE_LEN {
        return false;
    }
    let v = signature[64];
    let id = if v >= 27 { v - 27 } else { v };
    if id > 3 {
        return false;
    }
    recovered_address(&message_for(preimage), &signature[..64], id as i32).as_ref() == Some(expected)
}

/// Sign a node-built transaction for `sender`.
pub fn sign_transaction(
    unsigned: &UnsignedTransaction,
    key: &SigningKey,
    sender: &TronAddress,
) -> CustodyResult<SignedTransaction> {
    unsigned.check_id()?;
    let signature = sign(&unsigned.preimage()?, key, sender)?;
    Ok(SignedTransaction::new(unsigned, signature))
}

/// Check every signature on a signed transaction against `sender`.
pub fn verify_transaction(signed: &SignedTransaction, sender: &TronAddress) -> bool {
    let Ok(preimage) = hex::decode(&signed.raw_data_hex) else { return false };
    !signed.signature.is_empty()
        && signed
            .signature
            .iter()
            .all(|s| hex::decode(s).map(|bytes| verify(&bytes, &preimage, sender)).unwrap_or(false))
}

fn message_for(preimage: &[u8]) -> Message {
    let digest: [u8; 32] = Sha256::digest(preimage).into();
    Message::from_digest(digest)
}

fn recovered_address(message: &Message, compact: &[u8], id: i32) -> Option<TronAddress> {
    let id = RecoveryId::from_i32(id).ok()?;
    let signature = RecoverableSignature::from_compact(compact, id).ok()?;
    let public = secp().recover_ecdsa(message, &signature).ok()?;
    Some(TronAddress::from_public_key(&public.serialize_uncompressed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{derive_key, MasterSeed};
    use serde_json::json;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn key(index: u32) -> SigningKey {
        let seed = MasterSeed::from_mnemonic(TEST_MNEMONIC).unwrap();
        derive_key(&seed, index).unwrap().key
    }

    #[test]
    fn sign_then_verify() {
        for index in 0..8 {
            let key = key(index);
            let payload = format!("payload-{}", index);
            let sig = sign(payload.as_bytes(), &key, key.address()).unwrap();
            assert!(sig[64] == 27 || sig[64] == 28);
            assert!(verify(&sig, payload.as_bytes(), key.address()));
        }
    }

    #[test]
    fn zero_based_v_accepted() {
        let key = key(1);
        let mut sig = sign(b"payload", &key, key.address()).unwrap();
        sig[64] -= 27;
        assert!(verify(&sig, b"payload", key.address()));
    }

    #[test]
    fn any_flipped_byte_breaks_verification() {
        let key = key(3);
        let sig = sign(b"payload", &key, key.address()).unwrap();
        for i in 0..SIGNATURE_LEN {
            let mut bad = sig;
            bad[i] ^= 0x01;
            assert!(!verify(&bad, b"payload", key.address()), "byte {} flip still verified", i);
        }
    }

    #[test]
    fn wrong_payload_or_address_fails() {
        let key = key(4);
        let other = key_address(5);
        let sig = sign(b"payload", &key, key.address()).unwrap();
        assert!(!verify(&sig, b"payloae", key.address()));
        assert!(!verify(&sig, b"payload", &other));
        assert!(!verify(&sig[..64], b"payload", key.address()));
    }

    #[test]
    fn refuses_to_sign_as_someone_else() {
        let key = key(6);
        let other = key_address(7);
        assert!(matches!(sign(b"payload", &key, &other), Err(CustodyError::Invariant(_))));
    }

    #[test]
    fn signs_node_transaction() {
        let key = key(2);
        let raw = b"\x0a\x02\xab\xcd";
        let unsigned = UnsignedTransaction {
            tx_id: hex::encode(Sha256::digest(raw)),
            raw_data: json!({"contract": []}),
            raw_data_hex: hex::encode(raw),
        };
        let signed = sign_transaction(&unsigned, &key, key.address()).unwrap();
        assert_eq!(signed.tx_id, unsigned.tx_id);
        assert!(verify_transaction(&signed, key.address()));
    }

    fn key_address(index: u32) -> TronAddress { *key(index).address() }
}
