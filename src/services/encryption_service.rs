use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};

const NONCE_SIZE: usize = 12; // AES-GCM standard nonce size
const SEALED_PREFIX: &str = "enc:";

/// Seals credentials before they are written to disk.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    pub fn from_hex_key(key_hex: &str) -> Result<Self, String> {
        let key_bytes = hex::decode(key_hex.trim()).map_err(|e| format!("Invalid hex key: {e}"))?;
        if key_bytes.len() != 32 {
            return Err("Encryption key must be 32 bytes (256 bits) long".to_string());
        }
        let cipher = Aes256Gcm::new(key_bytes.as_slice().into());
        Ok(Self { cipher })
    }

    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(SEALED_PREFIX)
    }

    pub fn seal(&self, plain_text: &str) -> Result<String, String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain_text.as_bytes())
            .map_err(|e| format!("Encryption failed: {e}"))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);

        Ok(format!("{SEALED_PREFIX}{}", hex::encode(result)))
    }

    /// Values without the sealed prefix are returned as-is, so files written
    /// before a key was configured still load.
    pub fn open(&self, value: &str) -> Result<String, String> {
        let Some(cipher_hex) = value.strip_prefix(SEALED_PREFIX) else {
            return Ok(value.to_string());
        };

        let encrypted_data =
            hex::decode(cipher_hex).map_err(|e| format!("Invalid hex ciphertext: {e}"))?;
        if encrypted_data.len() < NONCE_SIZE {
            return Err("Ciphertext is too short to contain a nonce".to_string());
        }

        let (nonce_bytes, ciphertext) = encrypted_data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let decrypted_bytes = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| format!("Decryption failed: {e}"))?;

        String::from_utf8(decrypted_bytes).map_err(|e| format!("Invalid UTF-8 sequence: {e}"))
    }
}
