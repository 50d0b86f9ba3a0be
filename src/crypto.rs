/*!
Crypto things
*/
use ring::aead::BoundKey;

use crate::error::{Error, Result};

/// ring requires an implementor of `NonceSequence`,
/// which is a wrapping trait around `ring::aead::Nonce`.
/// We have to make a wrapper that can pass ownership
/// of the nonce exactly once.
struct OneNonceSequence {
    inner: Option<ring::aead::Nonce>,
}
impl OneNonceSequence {
    fn new(inner: ring::aead::Nonce) -> Self {
        Self { inner: Some(inner) }
    }
}

impl ring::aead::NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> std::result::Result<ring::aead::Nonce, ring::error::Unspecified> {
        self.inner.take().ok_or(ring::error::Unspecified)
    }
}

/// Return a `Vec` of secure random bytes of size `n`
pub fn rand_bytes(n: usize) -> Result<Vec<u8>> {
    use ring::rand::SecureRandom;
    let mut buf = vec![0; n];
    let sysrand = ring::rand::SystemRandom::new();
    sysrand
        .fill(&mut buf)
        .map_err(|_| Error::Crypto("error getting random bytes".to_string()))?;
    Ok(buf)
}

/// Return a fresh opaque token suitable for nonces and session tokens.
pub fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn hmac_sign(key: &str, s: &str) -> String {
    // using a 32 byte key
    let s_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key.as_bytes());
    let tag = ring::hmac::sign(&s_key, s.as_bytes());
    hex::encode(&tag)
}

fn seal(bytes: &[u8], nonce: &[u8], pass: &[u8]) -> Result<Vec<u8>> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| Error::Crypto("encryption nonce not unique".to_string()))?;
    let nonce = OneNonceSequence::new(nonce);
    let key = ring::aead::UnboundKey::new(alg, pass)
        .map_err(|_| Error::Crypto("error building sealing key".to_string()))?;
    let mut key = ring::aead::SealingKey::new(key, nonce);
    let mut in_out = bytes.to_vec();
    key.seal_in_place_append_tag(ring::aead::Aad::empty(), &mut in_out)
        .map_err(|_| Error::Crypto("failed encrypting bytes".to_string()))?;
    Ok(in_out)
}

fn open(bytes: &mut [u8], nonce: &[u8], pass: &[u8]) -> Result<Vec<u8>> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| Error::Crypto("decryption nonce not unique".to_string()))?;
    let nonce = OneNonceSequence::new(nonce);
    let key = ring::aead::UnboundKey::new(alg, pass)
        .map_err(|_| Error::Crypto("error building opening key".to_string()))?;
    let mut key = ring::aead::OpeningKey::new(key, nonce);
    let out_slice = key
        .open_in_place(ring::aead::Aad::empty(), bytes)
        .map_err(|_| Error::Crypto("failed decrypting bytes".to_string()))?;
    Ok(out_slice.to_vec())
}

/// Symmetric encryption of spotify tokens before they hit the database.
/// Kept behind a trait so tests can substitute an identity cipher.
pub trait TokenCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// AES-256-GCM cipher with a fresh 12-byte nonce per value.
/// Ciphertexts are stored as `hex(nonce):hex(bytes)`.
pub struct AeadCipher {
    key: Vec<u8>,
}

impl AeadCipher {
    pub fn new(key: &str) -> Result<Self> {
        if key.len() != 32 {
            return Err(Error::Crypto(format!(
                "encryption key must be 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            key: key.as_bytes().to_vec(),
        })
    }
}

impl TokenCipher for AeadCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = rand_bytes(12)?;
        let sealed = seal(plaintext.as_bytes(), &nonce, &self.key)?;
        Ok(format!("{}:{}", hex::encode(&nonce), hex::encode(&sealed)))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let mut parts = ciphertext.splitn(2, ':');
        let nonce = parts
            .next()
            .ok_or_else(|| Error::Crypto("missing nonce segment".to_string()))?;
        let value = parts
            .next()
            .ok_or_else(|| Error::Crypto("missing value segment".to_string()))?;
        let nonce =
            hex::decode(nonce).map_err(|e| Error::Crypto(format!("nonce hex decode: {}", e)))?;
        let mut value =
            hex::decode(value).map_err(|e| Error::Crypto(format!("value hex decode: {}", e)))?;
        let bytes = open(value.as_mut_slice(), &nonce, &self.key)?;
        String::from_utf8(bytes).map_err(|e| Error::Crypto(format!("invalid utf8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "01234567890123456789012345678901";

    #[test]
    fn encrypt_decrypt_round_trip() {
        let cipher = AeadCipher::new(KEY).unwrap();
        let ct = cipher.encrypt("BQDe...access-token").unwrap();
        assert_ne!(ct, "BQDe...access-token");
        assert!(ct.contains(':'));
        assert_eq!(cipher.decrypt(&ct).unwrap(), "BQDe...access-token");
    }

    #[test]
    fn fresh_nonce_per_value() {
        let cipher = AeadCipher::new(KEY).unwrap();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let cipher = AeadCipher::new(KEY).unwrap();
        let other = AeadCipher::new("abcdefghijklmnopqrstuvwxyz012345").unwrap();
        let ct = cipher.encrypt("secret").unwrap();
        assert!(other.decrypt(&ct).is_err());
    }

    #[test]
    fn rejects_short_keys() {
        assert!(AeadCipher::new("too-short").is_err());
    }

    #[test]
    fn hmac_is_deterministic() {
        assert_eq!(hmac_sign(KEY, "token"), hmac_sign(KEY, "token"));
        assert_ne!(hmac_sign(KEY, "token"), hmac_sign(KEY, "other"));
    }
}
