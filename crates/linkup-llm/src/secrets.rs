use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

use linkup_core::security::ApiKey;
use secrecy::ExposeSecret;

const NONCE_LEN: usize = 12;
const KEY_FILE: &str = "secret_key";
const API_KEY_FILE: &str = "provider_key.enc";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid UTF-8")]
    InvalidUtf8,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("no stored API key")]
    NoStoredKey,
    #[error("IO error: {0}")]
    IoError(String),
}

/// Encrypt a plaintext string using ChaCha20-Poly1305 AEAD.
/// Returns base64-encoded nonce + ciphertext.
pub fn encrypt(plaintext: &str, key: &[u8; 32]) -> Result<String, SecretError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| SecretError::EncryptionFailed)?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        &combined,
    ))
}

/// Decrypt a base64-encoded nonce + ciphertext.
pub fn decrypt(encoded: &str, key: &[u8; 32]) -> Result<String, SecretError> {
    let combined = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
        .map_err(|_| SecretError::InvalidEncoding)?;

    if combined.len() < NONCE_LEN {
        return Err(SecretError::InvalidEncoding);
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = ChaCha20Poly1305::new(key.into());

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| SecretError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| SecretError::InvalidUtf8)
}

/// Generate a random 256-bit key.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut key);
    key
}

/// Load or create the secret key file.
pub fn load_or_create_key(path: &Path) -> Result<[u8; 32], SecretError> {
    if path.exists() {
        let encoded = std::fs::read_to_string(path)
            .map_err(|e| SecretError::IoError(e.to_string()))?;
        let bytes = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            encoded.trim(),
        )
        .map_err(|_| SecretError::InvalidEncoding)?;
        if bytes.len() != 32 {
            return Err(SecretError::InvalidKeyLength);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    } else {
        let key = generate_key();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SecretError::IoError(e.to_string()))?;
        }
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key);
        std::fs::write(path, &encoded).map_err(|e| SecretError::IoError(e.to_string()))?;

        // Set file permissions to 0600 on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| SecretError::IoError(e.to_string()))?;
        }

        Ok(key)
    }
}

/// Persist the generation-provider API key encrypted at rest under `data_dir`.
pub fn store_api_key(data_dir: &Path, api_key: &ApiKey) -> Result<(), SecretError> {
    let key = load_or_create_key(&data_dir.join(KEY_FILE))?;
    let encrypted = encrypt(api_key.0.expose_secret(), &key)?;
    std::fs::write(data_dir.join(API_KEY_FILE), encrypted)
        .map_err(|e| SecretError::IoError(e.to_string()))
}

/// Load the stored API key, if one has been persisted.
pub fn load_api_key(data_dir: &Path) -> Result<ApiKey, SecretError> {
    let path = data_dir.join(API_KEY_FILE);
    if !path.exists() {
        return Err(SecretError::NoStoredKey);
    }
    let key = load_or_create_key(&data_dir.join(KEY_FILE))?;
    let encoded = std::fs::read_to_string(&path).map_err(|e| SecretError::IoError(e.to_string()))?;
    let plaintext = decrypt(encoded.trim(), &key)?;
    Ok(ApiKey::new(plaintext))
}
