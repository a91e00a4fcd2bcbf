//! AES-256-GCM primitives shared by key wrapping and upstream encryption.

pub mod keys;
pub mod master;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::{Error, Result};

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Encrypt plaintext under a 256-bit key. Returns the ciphertext with the
/// 16-byte tag appended, plus the freshly generated 12-byte IV.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Result<(Vec<u8>, [u8; IV_SIZE])> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| Error::internal("AES-GCM encryption failed"))?;
    Ok((ciphertext, iv))
}

/// Decrypt ciphertext-with-tag. Any input whose tag does not verify is
/// rejected with `AuthFailure`.
pub fn decrypt(ciphertext: &[u8], key: &[u8; KEY_SIZE], iv: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != IV_SIZE {
        return Err(Error::auth(format!("bad IV length: {}", iv.len())));
    }
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::auth("ciphertext shorter than the GCM tag"));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| Error::auth("AES-GCM tag verification failed"))
}
