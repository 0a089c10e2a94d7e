//! Sealed, signed upload tokens
//!
//! A token binds a claim identity (`name`, `namespace`) to one receiver and
//! one issuer: it is signed with the issuer's private key and then sealed for
//! the receiver's public key. Opening reverses both steps and fails with
//! [`TokenError::Decryption`] when the receiver key does not fit and with
//! [`TokenError::Authentication`] when the issuer signature does not verify.
//!
//! Tokens carry no expiry. Single use is enforced by the receiver session,
//! not by the token.
//!
//! # Example
//!
//! ```no_run
//! use volume_upload::token::{issue_token, keys, open_token, RsaTokenCrypto};
//!
//! let receiver = keys::generate_private_key(2048)?;
//! let issuer = keys::generate_private_key(2048)?;
//!
//! let token = issue_token(
//!     &RsaTokenCrypto,
//!     "pvc1",
//!     "ns1",
//!     &receiver.to_public_key(),
//!     &issuer,
//! )?;
//! let claim = open_token(&RsaTokenCrypto, &token, &receiver, &issuer.to_public_key())?;
//! assert_eq!(claim.name, "pvc1");
//! # Ok::<(), volume_upload::token::TokenError>(())
//! ```

mod crypto;
pub mod keys;

pub use crypto::{RsaTokenCrypto, TokenCrypto};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token failures
///
/// None of these are retryable: the same token and keys fail the same way.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Signature does not verify against the expected issuer
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Token cannot be unsealed with the recipient key
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Token structure is not recognisable
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Key material could not be generated, parsed, or encoded
    #[error("key error: {0}")]
    Key(String),

    /// Token could not be produced
    #[error("sealing failed: {0}")]
    Sealing(String),
}

/// Claim identity carried by a token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTokenData {
    /// Claim name
    pub name: String,
    /// Claim namespace
    pub namespace: String,
}

#[derive(Serialize, Deserialize)]
struct SignedEnvelope {
    payload: UploadTokenData,
    signature: String,
}

fn canonical_payload(payload: &UploadTokenData) -> Result<Vec<u8>, TokenError> {
    serde_json::to_vec(payload).map_err(|e| TokenError::Sealing(e.to_string()))
}

/// Issue a token for a claim
///
/// The payload is signed with `issuer` and the signed envelope is sealed for
/// `recipient`.
pub fn issue_token(
    crypto: &dyn TokenCrypto,
    name: &str,
    namespace: &str,
    recipient: &RsaPublicKey,
    issuer: &RsaPrivateKey,
) -> Result<String, TokenError> {
    let payload = UploadTokenData {
        name: name.to_string(),
        namespace: namespace.to_string(),
    };
    let signature = crypto.sign(issuer, &canonical_payload(&payload)?)?;
    let envelope = SignedEnvelope {
        payload,
        signature: STANDARD.encode(signature),
    };
    let plaintext = serde_json::to_vec(&envelope).map_err(|e| TokenError::Sealing(e.to_string()))?;
    crypto.seal(recipient, &plaintext)
}

/// Open a token and return the claim identity it was issued for
pub fn open_token(
    crypto: &dyn TokenCrypto,
    token: &str,
    recipient: &RsaPrivateKey,
    issuer: &RsaPublicKey,
) -> Result<UploadTokenData, TokenError> {
    let plaintext = crypto.unseal(recipient, token)?;
    let envelope: SignedEnvelope = serde_json::from_slice(&plaintext)
        .map_err(|e| TokenError::Malformed(format!("invalid envelope: {e}")))?;
    let signature = STANDARD
        .decode(&envelope.signature)
        .map_err(|e| TokenError::Malformed(format!("invalid signature encoding: {e}")))?;
    crypto.verify(issuer, &canonical_payload(&envelope.payload)?, &signature)?;
    Ok(envelope.payload)
}

/// Small shared keys; RSA generation is too slow to repeat per test
#[cfg(test)]
pub(crate) mod test_keys {
    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    fn generate(cell: &'static OnceLock<RsaPrivateKey>) -> &'static RsaPrivateKey {
        cell.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
    }

    pub fn issuer() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        generate(&KEY)
    }

    pub fn recipient() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        generate(&KEY)
    }

    pub fn stranger() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        generate(&KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::test_keys::{issuer, recipient, stranger};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn issue(name: &str, namespace: &str) -> String {
        issue_token(
            &RsaTokenCrypto,
            name,
            namespace,
            &recipient().to_public_key(),
            issuer(),
        )
        .unwrap()
    }

    #[test]
    fn tokens_round_trip_claim_identity() {
        for (name, namespace) in [("pvc1", "ns1"), ("disk-a", "default"), ("x", "y-z")] {
            let token = issue(name, namespace);
            let data = open_token(
                &RsaTokenCrypto,
                &token,
                recipient(),
                &issuer().to_public_key(),
            )
            .unwrap();
            assert_eq!(
                data,
                UploadTokenData {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                }
            );
        }
    }

    /// Story: a token presented to the wrong receiver is unreadable
    #[test]
    fn story_wrong_recipient_cannot_decrypt() {
        let token = issue("pvc1", "ns1");
        let err = open_token(
            &RsaTokenCrypto,
            &token,
            stranger(),
            &issuer().to_public_key(),
        )
        .unwrap_err();
        assert!(matches!(err, TokenError::Decryption(_)));
    }

    /// Story: a token minted by someone other than the trusted issuer is
    /// rejected even though the receiver can read it
    #[test]
    fn story_untrusted_issuer_fails_authentication() {
        let forged = issue_token(
            &RsaTokenCrypto,
            "pvc1",
            "ns1",
            &recipient().to_public_key(),
            stranger(),
        )
        .unwrap();
        let err = open_token(
            &RsaTokenCrypto,
            &forged,
            recipient(),
            &issuer().to_public_key(),
        )
        .unwrap_err();
        assert!(matches!(err, TokenError::Authentication(_)));
    }

    #[test]
    fn sealed_garbage_envelope_is_malformed() {
        let sealed = RsaTokenCrypto
            .seal(&recipient().to_public_key(), b"{not json")
            .unwrap();
        let err = open_token(
            &RsaTokenCrypto,
            &sealed,
            recipient(),
            &issuer().to_public_key(),
        )
        .unwrap_err();
        assert!(matches!(err, TokenError::Malformed(_)));
    }

    /// Counts calls and delegates, showing the capability is injected
    struct Counting {
        inner: RsaTokenCrypto,
        calls: AtomicUsize,
    }

    impl TokenCrypto for Counting {
        fn sign(&self, key: &RsaPrivateKey, msg: &[u8]) -> Result<Vec<u8>, TokenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.sign(key, msg)
        }
        fn verify(&self, key: &RsaPublicKey, msg: &[u8], sig: &[u8]) -> Result<(), TokenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.verify(key, msg, sig)
        }
        fn seal(&self, key: &RsaPublicKey, plaintext: &[u8]) -> Result<String, TokenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.seal(key, plaintext)
        }
        fn unseal(&self, key: &RsaPrivateKey, sealed: &str) -> Result<Vec<u8>, TokenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.unseal(key, sealed)
        }
    }

    #[test]
    fn crypto_capability_is_used_for_every_step() {
        let crypto = Counting {
            inner: RsaTokenCrypto,
            calls: AtomicUsize::new(0),
        };
        let token = issue_token(
            &crypto,
            "pvc1",
            "ns1",
            &recipient().to_public_key(),
            issuer(),
        )
        .unwrap();
        open_token(&crypto, &token, recipient(), &issuer().to_public_key()).unwrap();
        assert_eq!(crypto.calls.load(Ordering::SeqCst), 4);
    }
}
