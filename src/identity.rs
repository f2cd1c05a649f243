//! # Node Identity
//!
//! Every node owns one [`Identity`]: a 2048-bit RSA keypair created at node
//! construction, plus a certificate slot filled in once a certificate
//! authority peer has signed the node's public key.
//!
//! The public key travels in the Version handshake as SPKI PEM text; the
//! private key never leaves the node. The certificate is an opaque signed
//! blob (the CA's signature over the PEM text) that is only stored after
//! local verification against the CA's known public key.

use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::crypto::{self, CryptoError};

/// Returns current time as seconds since the Unix epoch, truncated to the
/// wire timestamp width.
#[inline]
pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// A node's asymmetric keypair and CA-issued certificate.
pub struct Identity {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    public_key_pem: String,
    certificate: RwLock<Option<String>>,
}

impl Identity {
    /// Generate a fresh identity.
    ///
    /// # Errors
    /// Fails if keypair generation or public key encoding fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let private_key = crypto::generate_keypair()?;
        let public_key = RsaPublicKey::from(&private_key);
        let public_key_pem = crypto::encode_public_key(&public_key)?;
        Ok(Self {
            private_key,
            public_key,
            public_key_pem,
            certificate: RwLock::new(None),
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// The SPKI PEM encoding of the public key, as sent in handshakes and
    /// CA registrations.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Sign a message with the private key.
    pub fn sign(&self, message: &str) -> Result<String, CryptoError> {
        crypto::sign(&self.private_key, message)
    }

    /// The stored CA certificate, if registration has completed.
    pub fn certificate(&self) -> Option<String> {
        self.certificate
            .read()
            .expect("certificate lock poisoned")
            .clone()
    }

    /// Store a verified CA certificate.
    pub fn set_certificate(&self, certificate: String) {
        *self
            .certificate
            .write()
            .expect("certificate lock poisoned") = Some(certificate);
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("certified", &self.certificate().is_some())
            .finish_non_exhaustive()
    }
}
