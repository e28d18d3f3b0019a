//! Per-deployment env var encryption at rest.
//!
//! Each env var is encrypted individually (`KEY=value` as the AEAD
//! plaintext), matching the deployment reconciler's "decrypt-per-var then
//! re-encrypt as JSON array" step: the stored blob is a JSON array of
//! base64-encoded `nonce || ciphertext` strings, one per var.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::ENV_ENCRYPTION_KEY;

fn cipher() -> Aes256Gcm {
    let mut hasher = Sha256::new();
    hasher.update(ENV_ENCRYPTION_KEY.as_bytes());
    let key_bytes = hasher.finalize();
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    Aes256Gcm::new(key)
}

/// Encrypts `KEY=value` pairs individually, returning the JSON array blob
/// stored as `vms.env_variables`.
pub fn encrypt_env(vars: &[String]) -> anyhow::Result<serde_json::Value> {
    let cipher = cipher();
    let mut out = Vec::with_capacity(vars.len());
    for var in vars {
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, var.as_bytes())
            .map_err(|e| anyhow::anyhow!("env encryption failed: {e}"))?;
        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);
        out.push(Base64.encode(blob));
    }
    Ok(serde_json::Value::Array(
        out.into_iter().map(serde_json::Value::String).collect(),
    ))
}

/// Decrypts the stored blob back into `KEY=value` strings.
pub fn decrypt_env(blob: &serde_json::Value) -> anyhow::Result<Vec<String>> {
    let cipher = cipher();
    let entries = blob
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("env_variables is not a JSON array"))?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let s = entry
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("env_variables entry is not a string"))?;
        let raw = Base64.decode(s)?;
        if raw.len() < 12 {
            anyhow::bail!("env_variables entry too short");
        }
        let (nonce_bytes, ciphertext) = raw.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("env decryption failed: {e}"))?;
        out.push(String::from_utf8(plaintext)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encrypt_decrypt() {
        std::env::set_var("ENV_ENCRYPTION_KEY", "test-key-not-for-production-use");
        let vars = vec!["MY=hello".to_string(), "N=1".to_string()];
        let blob = encrypt_env(&vars).unwrap();
        let decrypted = decrypt_env(&blob).unwrap();
        assert_eq!(vars, decrypted);
    }
}
