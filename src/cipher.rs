/* llmgate/src/cipher.rs

Authenticated encryption of vendor API keys at rest.

- AES-256-GCM; the 256-bit key is SHA-256 of the configured secret.
- Every encryption draws a fresh 96-bit nonce from the OS CSPRNG.
- Stored blob: base64(nonce || ciphertext || tag), tag is 128 bits.
- Decryption either yields the exact plaintext or `DecryptionFailed`.

Neither plaintext nor ciphertext is ever logged from here. Decrypted keys live
in `PlainApiKey`, which wipes its buffer on drop and redacts itself in Debug.
*/

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{GatewayError, Result};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Clone)]
pub struct CredentialCipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher { .. }")
    }
}

impl CredentialCipher {
    /// Bind a cipher to the configured secret.
    pub fn new(secret: &str) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(GatewayError::InvalidInput(
                "encryption secret must not be empty".into(),
            ));
        }
        let key = Zeroizing::new(<[u8; 32]>::from(Sha256::digest(secret.as_bytes())));
        let aead = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|_| GatewayError::InvalidInput("invalid encryption key length".into()))?;
        Ok(Self { aead })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Err(GatewayError::InvalidInput("API key must not be empty".into()));
        }
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| GatewayError::InvalidInput("API key could not be encrypted".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(STANDARD.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> Result<PlainApiKey> {
        let raw = STANDARD
            .decode(blob.trim())
            .map_err(|_| GatewayError::DecryptionFailed)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(GatewayError::DecryptionFailed);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let bytes = Zeroizing::new(
            self.aead
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| GatewayError::DecryptionFailed)?,
        );
        let text = std::str::from_utf8(&bytes).map_err(|_| GatewayError::DecryptionFailed)?;
        Ok(PlainApiKey::new(text))
    }
}

/// Cheap shape check: valid base64 long enough to hold nonce and tag.
/// Says nothing about whether the blob authenticates.
pub fn looks_encrypted(blob: &str) -> bool {
    STANDARD
        .decode(blob.trim())
        .map(|raw| raw.len() >= NONCE_LEN + TAG_LEN)
        .unwrap_or(false)
}

/// A decrypted API key, valid for the duration of one outbound call.
pub struct PlainApiKey(Zeroizing<String>);

impl PlainApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Debug for PlainApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PlainApiKey(<redacted>)")
    }
}
