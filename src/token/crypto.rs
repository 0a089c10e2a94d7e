//! Cryptographic capability behind upload tokens

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use super::TokenError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Signing and sealing primitives used by [`issue_token`](super::issue_token)
/// and [`open_token`](super::open_token)
///
/// Passed explicitly so tests and alternative deployments can substitute
/// their own primitives.
pub trait TokenCrypto: Send + Sync {
    /// Sign `message` with the issuer's private key
    fn sign(&self, issuer: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, TokenError>;

    /// Verify an issuer signature; any mismatch is `Authentication`
    fn verify(
        &self,
        issuer: &RsaPublicKey,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), TokenError>;

    /// Seal `plaintext` so only the recipient can read it
    fn seal(&self, recipient: &RsaPublicKey, plaintext: &[u8]) -> Result<String, TokenError>;

    /// Open a sealed blob; any key or integrity failure is `Decryption`
    fn unseal(&self, recipient: &RsaPrivateKey, sealed: &str) -> Result<Vec<u8>, TokenError>;
}

/// RSA-PKCS1v15/SHA-256 signatures with a ChaCha20-Poly1305 body whose key is
/// wrapped by RSA-OAEP/SHA-256
///
/// Sealed form: `b64url(wrapped_key).b64url(nonce).b64url(ciphertext)`
#[derive(Clone, Copy, Debug, Default)]
pub struct RsaTokenCrypto;

impl TokenCrypto for RsaTokenCrypto {
    fn sign(&self, issuer: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, TokenError> {
        let signing_key = SigningKey::<Sha256>::new(issuer.clone());
        let signature = signing_key
            .try_sign(message)
            .map_err(|e| TokenError::Sealing(format!("signing failed: {e}")))?;
        Ok(signature.to_vec())
    }

    fn verify(
        &self,
        issuer: &RsaPublicKey,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), TokenError> {
        let signature = Signature::try_from(signature)
            .map_err(|e| TokenError::Authentication(format!("bad signature encoding: {e}")))?;
        VerifyingKey::<Sha256>::new(issuer.clone())
            .verify(message, &signature)
            .map_err(|_| TokenError::Authentication("signature does not match issuer".into()))
    }

    fn seal(&self, recipient: &RsaPublicKey, plaintext: &[u8]) -> Result<String, TokenError> {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = ChaCha20Poly1305::new(&key)
            .encrypt(&nonce, plaintext)
            .map_err(|e| TokenError::Sealing(format!("encryption failed: {e}")))?;
        let wrapped = recipient
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), key.as_slice())
            .map_err(|e| TokenError::Sealing(format!("key wrapping failed: {e}")))?;

        Ok(format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(wrapped),
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    fn unseal(&self, recipient: &RsaPrivateKey, sealed: &str) -> Result<Vec<u8>, TokenError> {
        let [wrapped, nonce, ciphertext] = split_sealed(sealed)?;

        let key = recipient
            .decrypt(Oaep::new::<Sha256>(), &wrapped)
            .map_err(|_| TokenError::Decryption("cannot unwrap token key".into()))?;
        if key.len() != KEY_LEN {
            return Err(TokenError::Decryption("unwrapped key has wrong length".into()));
        }
        if nonce.len() != NONCE_LEN {
            return Err(TokenError::Decryption("nonce has wrong length".into()));
        }

        ChaCha20Poly1305::new(Key::from_slice(&key))
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| TokenError::Decryption("token body failed integrity check".into()))
    }
}

fn split_sealed(sealed: &str) -> Result<[Vec<u8>; 3], TokenError> {
    let parts: Vec<&str> = sealed.trim().split('.').collect();
    let [wrapped, nonce, ciphertext] = parts.as_slice() else {
        return Err(TokenError::Malformed(format!(
            "expected 3 segments, got {}",
            parts.len()
        )));
    };
    let decode = |segment: &str| {
        URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|e| TokenError::Decryption(format!("invalid segment encoding: {e}")))
    };
    Ok([decode(*wrapped)?, decode(*nonce)?, decode(*ciphertext)?])
}
