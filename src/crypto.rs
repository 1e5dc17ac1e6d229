//! Session-key generation and the RSA-OAEP(SHA-1) exchange primitive.

use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;

use crate::error::{ProtoError, Result};
use crate::protocol::KEY_LEN_INTERVAL;

/// Parse a PEM public key, accepting both SubjectPublicKeyInfo ("BEGIN PUBLIC
/// KEY") and PKCS#1 ("BEGIN RSA PUBLIC KEY") encodings.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| ProtoError::PublicKey(e.to_string()))
}

/// Encrypt the session key with the server's public key, OAEP over SHA-1 as
/// the protocol mandates.
pub fn encrypt_session_key(public_key: &RsaPublicKey, key: &[u8]) -> Result<Vec<u8>> {
    let mut rng = rand::thread_rng();
    Ok(public_key.encrypt(&mut rng, Oaep::new::<Sha1>(), key)?)
}

/// Generate a random session key. Lengths outside the protocol interval are
/// silently clamped to the minimum.
pub fn random_session_key(len: usize) -> Vec<u8> {
    let len = if (KEY_LEN_INTERVAL.0..=KEY_LEN_INTERVAL.1).contains(&len) {
        len
    } else {
        KEY_LEN_INTERVAL.0
    };
    let mut key = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::{Oaep, RsaPrivateKey};

    #[test]
    fn key_length_clamped_to_interval() {
        assert_eq!(random_session_key(16).len(), 16);
        assert_eq!(random_session_key(40).len(), 40);
        assert_eq!(random_session_key(7).len(), KEY_LEN_INTERVAL.0);
        assert_eq!(random_session_key(41).len(), KEY_LEN_INTERVAL.0);
        assert_eq!(random_session_key(0).len(), KEY_LEN_INTERVAL.0);
    }

    #[test]
    fn oaep_round_trip_with_pem_key() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();

        let public = parse_public_key(&pem).unwrap();
        let session_key = random_session_key(24);
        let blob = encrypt_session_key(&public, &session_key).unwrap();
        assert_ne!(blob, session_key);

        let plain = private.decrypt(Oaep::new::<Sha1>(), &blob).unwrap();
        assert_eq!(plain, session_key);
    }

    #[test]
    fn garbage_pem_is_reported() {
        assert!(matches!(
            parse_public_key("not a key"),
            Err(ProtoError::PublicKey(_))
        ));
    }
}
