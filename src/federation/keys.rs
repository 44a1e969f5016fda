//! Actor signing keys
//!
//! RSA key pairs for HTTP signature signing. Keys are generated at actor
//! provisioning and stored PEM-encoded; the private key never leaves the
//! database row.

use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::AppError;

const KEY_BITS: usize = 2048;

/// PEM-encoded key pair
#[derive(Debug, Clone)]
pub struct KeyPairPem {
    /// PKCS#8 PEM private key
    pub private_key_pem: String,
    /// SPKI PEM public key
    pub public_key_pem: String,
}

/// Generate a fresh RSA 2048 key pair.
///
/// Key generation is CPU-bound (hundreds of ms); callers on the request
/// path should wrap this in `spawn_blocking`.
pub fn generate_keypair() -> Result<KeyPairPem, AppError> {
    let mut rng = rand::thread_rng();
    let private_key =
        RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(|e| AppError::Internal(e.into()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok(KeyPairPem {
        private_key_pem,
        public_key_pem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::DecodePrivateKey;

    #[test]
    fn generate_keypair_produces_decodable_pem() {
        let pair = generate_keypair().expect("keypair generation should work");

        assert!(pair.private_key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(pair.public_key_pem.contains("BEGIN PUBLIC KEY"));

        let decoded = RsaPrivateKey::from_pkcs8_pem(&pair.private_key_pem);
        assert!(decoded.is_ok());
    }
}
