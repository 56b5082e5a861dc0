//! Encrypted keystore for the aggregator's EVM signing key.
//!
//! Shaped after `forest`'s `key_management::keystore` (an encrypted
//! `KeyInfo` blob on disk, unlocked by a passphrase), but modernized onto
//! this crate's dependency stack: `argon2` for key derivation in place of
//! `sodiumoxide`'s `argon2id13`, and `crypto_secretbox` for authenticated
//! encryption in place of `sodiumoxide::crypto::secretbox`. Substitutes
//! for go-ethereum's scrypt-based keystore format, which this crate does
//! not read (see DESIGN.md).

use argon2::Argon2;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{AggregatorError, Result};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedKeystore {
    salt: Vec<u8>,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

/// A decrypted 32-byte secp256k1 private key, matching the signer key
/// `alloy_signer_local::PrivateKeySigner` expects.
pub struct UnlockedKey(pub [u8; 32]);

pub fn create(path: impl AsRef<std::path::Path>, private_key: &[u8; 32], passphrase: &str) -> Result<()> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = derive_key(passphrase, &salt)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = XSalsa20Poly1305::new(&key);
    let ciphertext = cipher
        .encrypt(nonce, private_key.as_slice())
        .map_err(|e| AggregatorError::Config(format!("failed to encrypt keystore: {e}")))?;

    let encoded = EncryptedKeystore { salt, nonce: nonce_bytes.to_vec(), ciphertext };
    let raw = serde_json::to_vec_pretty(&encoded)?;
    std::fs::write(path, raw)?;
    Ok(())
}

pub fn unlock(path: impl AsRef<std::path::Path>, passphrase: &str) -> Result<UnlockedKey> {
    let raw = std::fs::read(path)?;
    let encoded: EncryptedKeystore = serde_json::from_slice(&raw)?;
    let key = derive_key(passphrase, &encoded.salt)?;

    if encoded.nonce.len() != NONCE_LEN {
        return Err(AggregatorError::Config("corrupt keystore nonce".to_string()));
    }
    let nonce = Nonce::from_slice(&encoded.nonce);
    let cipher = XSalsa20Poly1305::new(&key);
    let plaintext = cipher
        .decrypt(nonce, encoded.ciphertext.as_slice())
        .map_err(|_| AggregatorError::Config("wrong passphrase or corrupt keystore".to_string()))?;

    let mut out = [0u8; 32];
    if plaintext.len() != 32 {
        return Err(AggregatorError::Config("decrypted key has unexpected length".to_string()));
    }
    out.copy_from_slice(&plaintext);
    Ok(UnlockedKey(out))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<Key> {
    let mut out = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|e| AggregatorError::Config(format!("key derivation failed: {e}")))?;
    Ok(*Key::from_slice(&out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_keystore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        let secret = [0x11u8; 32];
        create(&path, &secret, "correct horse battery staple").unwrap();

        let unlocked = unlock(&path, "correct horse battery staple").unwrap();
        assert_eq!(unlocked.0, secret);
    }

    #[test]
    fn wrong_passphrase_fails_to_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        create(&path, &[0x22u8; 32], "right").unwrap();
        assert!(unlock(&path, "wrong").is_err());
    }
}
