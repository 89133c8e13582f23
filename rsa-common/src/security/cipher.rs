//! Credential encryption.
//!
//! Uses ChaCha20-Poly1305 for authenticated encryption. Each encrypted value
//! is stored as base64(nonce || ciphertext) so it fits in a single text column.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fs;
use std::io::Write;
use std::path::Path;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// Encrypts and decrypts credential strings with a fixed key.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Create a cipher from a raw 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Create a cipher from a base64 encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| Error::Config(format!("encryption key is not valid base64: {e}")))?,
        );
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            Error::Config(format!(
                "encryption key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(&key))
    }

    /// Encrypt a plaintext credential string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::Crypto("failed to encrypt credentials".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    /// Decrypt a blob produced by [`CredentialCipher::encrypt`].
    pub fn decrypt(&self, encoded: &str) -> Result<Zeroizing<String>> {
        let blob = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Crypto(format!("credential blob is not valid base64: {e}")))?;
        if blob.len() <= NONCE_LEN {
            return Err(Error::Crypto("credential blob is too short".into()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| Error::Crypto("failed to decrypt credentials - wrong key?".into()))?,
        );

        String::from_utf8(plaintext.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| Error::Crypto("decrypted credentials are not UTF-8".into()))
    }
}

/// Generate a random 32-byte key.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut key);
    key
}

/// Generate a random key encoded the way `RSA_ENCRYPTION_KEY` expects it.
pub fn generate_key_base64() -> Zeroizing<String> {
    let key = Zeroizing::new(generate_key());
    Zeroizing::new(STANDARD.encode(key.as_slice()))
}

/// Read a base64 key from `path`, creating one if the file does not exist.
pub fn load_or_create_key(path: &Path) -> Result<CredentialCipher> {
    if path.exists() {
        let encoded = Zeroizing::new(fs::read_to_string(path)?);
        return CredentialCipher::from_base64_key(&encoded);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let key = Zeroizing::new(generate_key());
    let encoded = Zeroizing::new(STANDARD.encode(key.as_slice()));
    let mut file = create_key_file(path)?;
    file.write_all(encoded.as_bytes())?;
    file.sync_all()?;
    tracing::info!(path = %path.display(), "Generated new credential encryption key");

    Ok(CredentialCipher::new(&key))
}

/// Create the key file, owner read/write only from the first byte.
fn create_key_file(path: &Path) -> Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    Ok(options.open(path)?)
}
