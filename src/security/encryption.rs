use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// AES-256-GCM cipher for provider API credentials.
///
/// Output is `base64(nonce || ciphertext)`, so a stored value is a single
/// opaque string and plaintext never reaches the database.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(anyhow!("Invalid key size: expected {KEY_SIZE}, got {}", key.len()));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(key);
        Ok(Self { key: bytes })
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|e| anyhow!("Invalid key encoding: {e}"))?;
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut rng = rand::rng();
        let nonce_bytes: [u8; NONCE_SIZE] = rng.random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {e}"))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn decrypt(&self, sealed_b64: &str) -> Result<String> {
        let sealed = BASE64
            .decode(sealed_b64)
            .map_err(|e| anyhow!("Invalid ciphertext encoding: {e}"))?;

        if sealed.len() <= NONCE_SIZE {
            return Err(anyhow!("Ciphertext too short"));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| anyhow!("Decryption failed: {e}"))?;

        String::from_utf8(plaintext).map_err(|e| anyhow!("Decrypted value is not UTF-8: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> CredentialCipher {
        CredentialCipher::new(&[42u8; KEY_SIZE]).expect("valid key")
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = test_cipher();
        let sealed = cipher.encrypt("ef-api-key-123").expect("Encrypt failed");
        assert_ne!(sealed, "ef-api-key-123");
        assert_eq!(cipher.decrypt(&sealed).expect("Decrypt failed"), "ef-api-key-123");
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let cipher = test_cipher();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let cipher = test_cipher();
        let sealed = cipher.encrypt("secret").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(cipher.decrypt(&BASE64.encode(raw)).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = test_cipher().encrypt("secret").unwrap();
        let other = CredentialCipher::new(&[1u8; KEY_SIZE]).unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_invalid_key_size() {
        assert!(CredentialCipher::new(&[0u8; 16]).is_err());
        assert!(CredentialCipher::from_base64(&BASE64.encode([0u8; 31])).is_err());
        assert!(CredentialCipher::from_base64(&BASE64.encode([0u8; 32])).is_ok());
    }

    #[test]
    fn test_short_input_rejected() {
        let cipher = test_cipher();
        assert!(cipher.decrypt(&BASE64.encode([0u8; 8])).is_err());
        assert!(cipher.decrypt("not base64 !!").is_err());
    }
}
