//! At-rest encryption for private keys, tokens and webhook secrets.
//!
//! AES-256-GCM with a key derived from the configured master key through
//! HMAC-SHA256 and a fixed context string.
//! Ciphertext format: nonce (12 bytes) || ciphertext+tag, base64 when stored.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::errors::DeploydError;

type HmacSha256 = Hmac<Sha256>;

const KEY_CONTEXT: &[u8] = b"deployd/credential-encryption/aes-256-gcm/v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM authenticated encryption for stored credentials
pub struct CredentialCipher {
    key: [u8; 32],
}

impl CredentialCipher {
    /// Derive the encryption key from the master passphrase
    pub fn from_passphrase(passphrase: &SecretString) -> Result<Self, DeploydError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(passphrase.expose_secret().as_bytes())
            .map_err(|e| DeploydError::CryptoError(e.to_string()))?;
        mac.update(KEY_CONTEXT);
        Ok(Self {
            key: mac.finalize().into_bytes().into(),
        })
    }

    /// Encrypt: returns nonce || ciphertext+tag
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, DeploydError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| DeploydError::CryptoError(e.to_string()))?;

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| DeploydError::CryptoError("encryption failed".to_string()))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, DeploydError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(DeploydError::CryptoError("ciphertext too short".to_string()));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| DeploydError::CryptoError(e.to_string()))?;
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|_| DeploydError::CryptoError("decryption failed".to_string()))
    }

    /// Encrypt a secret into the base64 form kept in the store
    pub fn seal(&self, secret: &str) -> Result<String, DeploydError> {
        Ok(STANDARD.encode(self.encrypt(secret.as_bytes())?))
    }

    /// Inverse of [`CredentialCipher::seal`]
    pub fn open(&self, sealed: &str) -> Result<SecretString, DeploydError> {
        let data = STANDARD
            .decode(sealed)
            .map_err(|e| DeploydError::CryptoError(format!("invalid sealed value: {}", e)))?;
        let plaintext = String::from_utf8(self.decrypt(&data)?)
            .map_err(|_| DeploydError::CryptoError("sealed value is not UTF-8".to_string()))?;
        Ok(SecretString::from(plaintext))
    }
}
