//! Authenticated encryption for checkpoint blobs.
//!
//! AES-256-GCM with a per-blob random nonce. The wire format is
//! `[format version][key id][12-byte nonce][ciphertext+tag]`, so a
//! deployment can rotate keys: new blobs are sealed with the current key,
//! old blobs still open with any retired key whose id matches.

use crate::error::{CheckpointError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;

/// Format version byte at the head of every sealed blob
const FORMAT_VERSION: u8 = 1;

/// Nonce size mandated by AES-GCM (96 bits)
const NONCE_LEN: usize = 12;

struct KeySlot {
    id: u8,
    cipher: Aes256Gcm,
}

/// Seals and opens checkpoint blobs under a rotatable key set
pub struct BlobCipher {
    current: KeySlot,
    retired: Vec<KeySlot>,
}

impl BlobCipher {
    /// Build a cipher from hex-encoded 32-byte keys.
    ///
    /// The current key gets id 0; retired keys get ids 1.. in the order
    /// given, matching the order of `encryption_key_retired` in config.
    pub fn from_hex_keys(current: &str, retired: &[String]) -> Result<Self> {
        let current = KeySlot {
            id: 0,
            cipher: cipher_from_hex(current)?,
        };
        let retired = retired
            .iter()
            .enumerate()
            .map(|(i, key)| {
                Ok(KeySlot {
                    id: (i + 1) as u8,
                    cipher: cipher_from_hex(key)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { current, retired })
    }

    /// Encrypt a blob with the current key
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .current
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CheckpointError::Encryption(format!("encrypt failed: {}", e)))?;

        let mut out = Vec::with_capacity(2 + NONCE_LEN + ciphertext.len());
        out.push(FORMAT_VERSION);
        out.push(self.current.id);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a sealed blob with whichever key its header names
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < 2 + NONCE_LEN {
            return Err(CheckpointError::Encryption("blob too short".to_string()));
        }
        if sealed[0] != FORMAT_VERSION {
            return Err(CheckpointError::Encryption(format!(
                "unsupported blob format version {}",
                sealed[0]
            )));
        }
        let key_id = sealed[1];
        let nonce = Nonce::from_slice(&sealed[2..2 + NONCE_LEN]);
        let ciphertext = &sealed[2 + NONCE_LEN..];

        let slot = if self.current.id == key_id {
            &self.current
        } else {
            self.retired
                .iter()
                .find(|slot| slot.id == key_id)
                .ok_or_else(|| {
                    CheckpointError::Encryption(format!("no key with id {}", key_id))
                })?
        };

        slot.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CheckpointError::Encryption(format!("decrypt failed: {}", e)))
    }
}

fn cipher_from_hex(hex_key: &str) -> Result<Aes256Gcm> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| CheckpointError::Encryption(format!("invalid hex key: {}", e)))?;
    if bytes.len() != 32 {
        return Err(CheckpointError::Encryption(format!(
            "key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let key = Key::<Aes256Gcm>::from_slice(&bytes);
    Ok(Aes256Gcm::new(key))
}
