use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};

const SEALED_PREFIX: &str = "enc:";

#[derive(Debug, thiserror::Error)]
pub enum SecretBoxError {
    #[error("encrypted value present but no secret key configured")]
    NoKey,
    #[error("malformed encrypted value")]
    Malformed,
    #[error("decryption failed (wrong key?)")]
    DecryptFailed,
    #[error("decrypted value is not valid utf-8")]
    NotUtf8,
}

/// AES-256-GCM box for at-rest secrets. The key is derived from the
/// configured secret via SHA-256; sealed values are stored as
/// `enc:<nonce-hex>:<ciphertext-hex>`. Values without the prefix are legacy
/// plaintext and pass through unchanged.
#[derive(Clone)]
pub struct SecretBox {
    key: Option<[u8; 32]>,
}

impl SecretBox {
    pub fn new(secret: Option<&str>) -> Self {
        let key = secret.filter(|s| !s.is_empty()).map(|s| {
            let digest = Sha256::digest(s.as_bytes());
            let mut key = [0u8; 32];
            key.copy_from_slice(&digest);
            key
        });
        Self { key }
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, SecretBoxError> {
        let Some(key) = self.key.as_ref() else {
            return Err(SecretBoxError::NoKey);
        };
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SecretBoxError::Malformed)?;
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretBoxError::DecryptFailed)?;
        Ok(format!(
            "{SEALED_PREFIX}{}:{}",
            hex::encode(nonce_bytes),
            hex::encode(ciphertext)
        ))
    }

    pub fn open(&self, stored: &str) -> Result<String, SecretBoxError> {
        let Some(rest) = stored.strip_prefix(SEALED_PREFIX) else {
            return Ok(stored.to_string());
        };
        let Some(key) = self.key.as_ref() else {
            return Err(SecretBoxError::NoKey);
        };

        let (nonce_hex, ct_hex) = rest.split_once(':').ok_or(SecretBoxError::Malformed)?;
        let nonce_bytes = hex::decode(nonce_hex).map_err(|_| SecretBoxError::Malformed)?;
        if nonce_bytes.len() != 12 {
            return Err(SecretBoxError::Malformed);
        }
        let ciphertext = hex::decode(ct_hex).map_err(|_| SecretBoxError::Malformed)?;

        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SecretBoxError::Malformed)?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| SecretBoxError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| SecretBoxError::NotUtf8)
    }
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox")
            .field("key", &self.key.as_ref().map(|_| "<set>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_roundtrips() {
        let secrets = SecretBox::new(Some("test-secret"));
        let sealed = secrets.seal("sk-upstream-credential").unwrap();
        assert!(sealed.starts_with("enc:"));
        assert_eq!(secrets.open(&sealed).unwrap(), "sk-upstream-credential");
    }

    #[test]
    fn legacy_plaintext_passes_through() {
        let secrets = SecretBox::new(Some("test-secret"));
        assert_eq!(secrets.open("sk-plain").unwrap(), "sk-plain");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = SecretBox::new(Some("one")).seal("value").unwrap();
        assert!(matches!(
            SecretBox::new(Some("two")).open(&sealed),
            Err(SecretBoxError::DecryptFailed)
        ));
    }

    #[test]
    fn sealed_value_without_key_is_rejected() {
        let sealed = SecretBox::new(Some("one")).seal("value").unwrap();
        assert!(matches!(
            SecretBox::new(None).open(&sealed),
            Err(SecretBoxError::NoKey)
        ));
    }
}
