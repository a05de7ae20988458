//! Cryptographic primitives: the long-lived RSA key pair, the hybrid wrap of
//! session keys under a peer's public key, and the AES-256-CBC datagram
//! envelope.
//!
//! Key material layout on the wire:
//! - wrapped session key: RSA PKCS#1 v1.5 ciphertext, sized to the modulus
//!   (256 bytes at 2048 bits), plaintext is exactly the 32-byte session key
//! - encrypted datagram: `IV || ciphertext`, where 32 IV bytes are
//!   transmitted and the cipher consumes the first 16

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::path::Path;
use thiserror::Error;
use tracing::info;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Session key width (AES-256).
pub const SESSION_KEY_LEN: usize = 32;

/// IV bytes transmitted per datagram. Only the first [`CBC_IV_LEN`] are
/// consumed; the excess is fixed by the wire format and must not be removed
/// without a version bump.
pub const IV_LEN: usize = 32;

/// IV bytes the block cipher actually uses. Also the AES block size.
pub const CBC_IV_LEN: usize = 16;

/// Modulus size for generated key pairs.
pub const RSA_KEY_BITS: usize = 2048;

/// 256-bit symmetric key, one per direction per peer.
pub type SessionKey = [u8; SESSION_KEY_LEN];

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("rsa error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("private key encoding error: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),

    #[error("public key encoding error: {0}")]
    Spki(#[from] rsa::pkcs8::spki::Error),

    #[error("cipher error")]
    Cipher,

    #[error("unwrapped session key has wrong length: {0} bytes")]
    KeyLength(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Long-lived asymmetric identity of a node.
pub struct KeyPair {
    public: RsaPublicKey,
    private: RsaPrivateKey,
}

impl KeyPair {
    /// Generate a fresh key pair. 2048-bit generation is slow; it runs once
    /// per node lifetime, at first startup.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { public, private })
    }

    /// Load a key pair from its two PEM files.
    pub fn load<P: AsRef<Path>>(public_path: P, private_path: P) -> Result<Self, CryptoError> {
        let public_pem = std::fs::read_to_string(public_path)?;
        let private_pem = std::fs::read_to_string(private_path)?;
        let public = RsaPublicKey::from_public_key_pem(&public_pem)?;
        let private = RsaPrivateKey::from_pkcs8_pem(&private_pem)?;
        Ok(Self { public, private })
    }

    /// Persist as SPKI `public.pem` and PKCS#8 `private.pem`.
    pub fn save<P: AsRef<Path>>(&self, public_path: P, private_path: P) -> Result<(), CryptoError> {
        let public_pem = self.public.to_public_key_pem(LineEnding::LF)?;
        std::fs::write(&public_path, public_pem)?;

        let private_pem = self.private.to_pkcs8_pem(LineEnding::LF)?;
        std::fs::write(&private_path, private_pem.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&private_path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&private_path, perms)?;
        }

        Ok(())
    }

    /// Load the node identity, generating and persisting it first if the
    /// private key file does not exist yet.
    pub fn load_or_generate<P: AsRef<Path>>(
        public_path: P,
        private_path: P,
        bits: usize,
    ) -> Result<Self, CryptoError> {
        if !private_path.as_ref().exists() {
            info!(
                "No private key at {:?}, generating {}-bit key pair",
                private_path.as_ref(),
                bits
            );
            let pair = Self::generate(bits)?;
            pair.save(&public_path, &private_path)?;
        }
        let pair = Self::load(public_path, private_path)?;
        info!("Loaded key pair, public key ..{}", pair.fingerprint());
        Ok(pair)
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Public key in the DER form that travels in `PublicKeyReply` payloads.
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self.public.to_public_key_der()?.as_bytes().to_vec())
    }

    /// Short public-key fingerprint for logging.
    pub fn fingerprint(&self) -> String {
        match self.public_key_der() {
            Ok(der) => hex::encode(&der[der.len().saturating_sub(8)..]),
            Err(_) => "<unencodable>".into(),
        }
    }

    fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }
}

/// Fresh random 256-bit session key.
pub fn generate_session_key() -> SessionKey {
    let mut key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Wrap a session key under a peer's public key. The ciphertext is sized to
/// the peer's modulus.
pub fn encrypt_session_key(
    key: &SessionKey,
    peer_public: &RsaPublicKey,
) -> Result<Vec<u8>, CryptoError> {
    Ok(peer_public.encrypt(&mut OsRng, Pkcs1v15Encrypt, key)?)
}

/// Unwrap a session key with our private key. Fails unless the recovered
/// plaintext is exactly the session-key width.
pub fn decrypt_session_key(buf: &[u8], pair: &KeyPair) -> Result<SessionKey, CryptoError> {
    let plain = pair.private_key().decrypt(Pkcs1v15Encrypt, buf)?;
    if plain.len() != SESSION_KEY_LEN {
        return Err(CryptoError::KeyLength(plain.len()));
    }
    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&plain);
    Ok(key)
}

/// Encrypt one datagram: generate 32 random IV bytes, CBC-encrypt under the
/// first 16, return `IV || ciphertext`.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher =
        Aes256CbcEnc::new_from_slices(key, &iv[..CBC_IV_LEN]).map_err(|_| CryptoError::Cipher)?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt one datagram produced by [`seal`]. Fails fast on any framing or
/// cipher error; no partial output.
pub fn open(key: &SessionKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < IV_LEN + CBC_IV_LEN || (data.len() - IV_LEN) % CBC_IV_LEN != 0 {
        return Err(CryptoError::Cipher);
    }

    let cipher =
        Aes256CbcDec::new_from_slices(key, &data[..CBC_IV_LEN]).map_err(|_| CryptoError::Cipher)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&data[IV_LEN..])
        .map_err(|_| CryptoError::Cipher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair() -> KeyPair {
        // 1024 bits keeps the unit tests quick; the width-sensitive checks
        // depend on the session-key length, not the modulus.
        KeyPair::generate(1024).unwrap()
    }

    #[test]
    fn seal_open_round_trip() {
        let key = generate_session_key();
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let sealed = seal(&key, plaintext).unwrap();

        assert!(sealed.len() > IV_LEN);
        assert_eq!((sealed.len() - IV_LEN) % CBC_IV_LEN, 0);

        let opened = open(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn seal_uses_fresh_iv() {
        let key = generate_session_key();
        let a = seal(&key, b"same plaintext").unwrap();
        let b = seal(&key, b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn open_rejects_wrong_key() {
        let key = generate_session_key();
        let other = generate_session_key();
        let sealed = seal(&key, b"secret").unwrap();
        // A wrong key either fails the unpad or yields different bytes; the
        // contract is only that the plaintext never comes back silently.
        match open(&other, &sealed) {
            Ok(garbage) => assert_ne!(garbage, b"secret"),
            Err(CryptoError::Cipher) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn open_rejects_truncated_input() {
        let key = generate_session_key();
        let sealed = seal(&key, b"secret").unwrap();
        assert!(matches!(
            open(&key, &sealed[..IV_LEN + 7]),
            Err(CryptoError::Cipher)
        ));
        assert!(matches!(open(&key, &[0u8; 10]), Err(CryptoError::Cipher)));
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let pair = test_keypair();
        let key = generate_session_key();

        let wrapped = encrypt_session_key(&key, pair.public_key()).unwrap();
        assert_eq!(wrapped.len(), 128); // sized to the 1024-bit modulus

        let unwrapped = decrypt_session_key(&wrapped, &pair).unwrap();
        assert_eq!(unwrapped, key);
    }

    #[test]
    fn unwrap_rejects_wrong_private_key() {
        let pair = test_keypair();
        let other = test_keypair();
        let key = generate_session_key();

        let wrapped = encrypt_session_key(&key, pair.public_key()).unwrap();
        assert!(decrypt_session_key(&wrapped, &other).is_err());
    }

    #[test]
    fn pem_save_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("kapua_keys_{}", rand::random::<u32>()));
        std::fs::create_dir_all(&dir).unwrap();
        let public_path = dir.join("public.pem");
        let private_path = dir.join("private.pem");

        let pair = test_keypair();
        pair.save(&public_path, &private_path).unwrap();

        let loaded = KeyPair::load(&public_path, &private_path).unwrap();
        assert_eq!(loaded.public_key(), pair.public_key());

        // Wrap with the original, unwrap with the reloaded private key.
        let key = generate_session_key();
        let wrapped = encrypt_session_key(&key, pair.public_key()).unwrap();
        assert_eq!(decrypt_session_key(&wrapped, &loaded).unwrap(), key);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_or_generate_creates_then_reuses() {
        let dir = std::env::temp_dir().join(format!("kapua_keygen_{}", rand::random::<u32>()));
        std::fs::create_dir_all(&dir).unwrap();
        let public_path = dir.join("public.pem");
        let private_path = dir.join("private.pem");

        assert!(!private_path.exists());
        let first = KeyPair::load_or_generate(&public_path, &private_path, 1024).unwrap();
        assert!(private_path.exists());

        let second = KeyPair::load_or_generate(&public_path, &private_path, 1024).unwrap();
        assert_eq!(first.public_key(), second.public_key());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
