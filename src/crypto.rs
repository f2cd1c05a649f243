//! # Cryptographic Infrastructure
//!
//! This module provides the cryptographic primitives for Huddle:
//!
//! - **Signatures**: SHA-256 digests signed with RSA PKCS#1 v1.5, hex-encoded
//! - **Asymmetric encryption**: chunked RSA-2048 for membership payloads
//! - **Symmetric encryption**: AES-256-GCM for group chat traffic
//! - **Key encoding**: SPKI PEM for public keys, base64 for symmetric keys
//!
//! ## Chunking Contract
//!
//! RSA PKCS#1 v1.5 with a 2048-bit modulus encrypts at most 245 bytes per
//! operation and always produces a 256-byte block. Longer plaintexts are
//! split into consecutive 245-byte chunks; the resulting blocks are
//! concatenated in order and base64-encoded. Decryption rejects any input
//! whose decoded length is not a multiple of 256.
//!
//! ## Nonce Handling
//!
//! Every symmetric encryption draws a fresh random 96-bit nonce and prepends
//! it to the sealed ciphertext before base64 encoding. Decryption splits the
//! nonce prefix back off. Nonces are never reused with the same key.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// RSA modulus size for node identities.
pub const KEY_BITS: usize = 2048;

/// Maximum plaintext bytes per RSA PKCS#1 v1.5 operation with a 2048-bit key.
pub const MAX_CHUNK_LEN: usize = 245;

/// Ciphertext block size produced by a 2048-bit RSA operation.
pub const BLOCK_LEN: usize = 256;

/// Symmetric key length (AES-256).
pub const SYM_KEY_LEN: usize = 32;

/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;

// ============================================================================
// Error Types
// ============================================================================

/// Errors from cryptographic operations.
///
/// None of these are fatal to a running node: callers log and drop the
/// offending message or operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Keypair or symmetric key generation failed.
    KeyGen(String),
    /// Signing failed.
    Sign(String),
    /// Asymmetric or symmetric encryption failed.
    Encrypt(String),
    /// Decryption failed: malformed encoding, bad block alignment,
    /// truncated input, or authentication failure.
    Decrypt(String),
    /// Public key decoding failed: malformed PEM or wrong key type.
    Decode(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyGen(msg) => write!(f, "key generation failed: {msg}"),
            Self::Sign(msg) => write!(f, "signing failed: {msg}"),
            Self::Encrypt(msg) => write!(f, "encryption failed: {msg}"),
            Self::Decrypt(msg) => write!(f, "decryption failed: {msg}"),
            Self::Decode(msg) => write!(f, "public key decoding failed: {msg}"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Keypairs and Signatures
// ============================================================================

/// Generate a fresh 2048-bit RSA keypair.
pub fn generate_keypair() -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::new(&mut OsRng, KEY_BITS).map_err(|e| CryptoError::KeyGen(e.to_string()))
}

/// Sign a message: SHA-256 digest, RSA PKCS#1 v1.5 signature over the
/// digest, hex-encoded.
pub fn sign(private_key: &RsaPrivateKey, message: &str) -> Result<String, CryptoError> {
    let digest = Sha256::digest(message.as_bytes());
    let signature = private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| CryptoError::Sign(e.to_string()))?;
    Ok(hex::encode(signature))
}

/// Verify a hex-encoded signature over a message.
///
/// Returns `false` on malformed signature text or verification failure;
/// never errors.
pub fn verify(public_key: &RsaPublicKey, message: &str, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let digest = Sha256::digest(message.as_bytes());
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .is_ok()
}

// ============================================================================
// Chunked Asymmetric Encryption
// ============================================================================

/// Encrypt arbitrary-length plaintext under an RSA public key.
///
/// The plaintext is split into consecutive chunks of at most
/// [`MAX_CHUNK_LEN`] bytes; each chunk is encrypted independently into a
/// [`BLOCK_LEN`]-byte block and the blocks are concatenated in order.
/// Empty plaintext yields an empty ciphertext.
pub fn asym_encrypt(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let mut ciphertext = Vec::with_capacity(plaintext.len().div_ceil(MAX_CHUNK_LEN) * BLOCK_LEN);
    for chunk in plaintext.chunks(MAX_CHUNK_LEN) {
        let block = public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, chunk)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        ciphertext.extend_from_slice(&block);
    }
    Ok(BASE64.encode(ciphertext))
}

/// Decrypt a base64 ciphertext produced by [`asym_encrypt`].
///
/// Fails if the decoded input is not [`BLOCK_LEN`]-aligned or any block
/// fails to decrypt.
pub fn asym_decrypt(
    private_key: &RsaPrivateKey,
    ciphertext_b64: &str,
) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    if ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::Decrypt(format!(
            "ciphertext length {} is not a multiple of the block size",
            ciphertext.len()
        )));
    }
    let mut plaintext = Vec::new();
    for block in ciphertext.chunks(BLOCK_LEN) {
        let chunk = private_key
            .decrypt(Pkcs1v15Encrypt, block)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        plaintext.extend_from_slice(&chunk);
    }
    Ok(plaintext)
}

// ============================================================================
// Symmetric Encryption (AES-256-GCM)
// ============================================================================

/// A group's symmetric key together with its derived AEAD cipher.
///
/// The two are carried as one unit so that key rotation replaces them
/// atomically; no caller can observe an encoded key paired with a cipher
/// derived from a different key.
#[derive(Clone)]
pub struct GroupKey {
    /// Base64 encoding of the 32-byte key, the form carried on the wire.
    pub encoded: String,
    /// AEAD cipher derived from the key.
    pub cipher: Aes256Gcm,
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKey").finish_non_exhaustive()
    }
}

/// Generate a fresh 256-bit symmetric key and its AEAD cipher.
pub fn generate_sym_key() -> Result<GroupKey, CryptoError> {
    let mut key_bytes = [0u8; SYM_KEY_LEN];
    OsRng.fill_bytes(&mut key_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    Ok(GroupKey {
        encoded: BASE64.encode(key_bytes),
        cipher,
    })
}

/// Rebuild the AEAD cipher from a base64-encoded symmetric key.
pub fn derive_cipher(encoded: &str) -> Result<GroupKey, CryptoError> {
    let key_bytes = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::KeyGen(e.to_string()))?;
    if key_bytes.len() != SYM_KEY_LEN {
        return Err(CryptoError::KeyGen(format!(
            "symmetric key must be {SYM_KEY_LEN} bytes, got {}",
            key_bytes.len()
        )));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    Ok(GroupKey {
        encoded: encoded.to_string(),
        cipher,
    })
}

/// Seal plaintext under a fresh random nonce; returns
/// `base64(nonce || sealed)`.
pub fn sym_encrypt(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<String, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(BASE64.encode(out))
}

/// Open a `base64(nonce || sealed)` ciphertext produced by [`sym_encrypt`].
///
/// Fails on truncated input or authentication failure.
pub fn sym_decrypt(cipher: &Aes256Gcm, ciphertext_b64: &str) -> Result<Vec<u8>, CryptoError> {
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    if ciphertext.len() < NONCE_LEN {
        return Err(CryptoError::Decrypt("ciphertext shorter than nonce".into()));
    }
    let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))
}

// ============================================================================
// Public Key Encoding
// ============================================================================

/// Encode an RSA public key as SPKI PEM text.
pub fn encode_public_key(public_key: &RsaPublicKey) -> Result<String, CryptoError> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Decode(e.to_string()))
}

/// Decode SPKI PEM text back into an RSA public key.
///
/// Fails on malformed PEM or a key of the wrong type.
pub fn decode_public_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::Decode(e.to_string()))
}
