//! Signed, time-boxed finalize tokens.
//!
//! Wire form is `<expires_unix>.<tag>` where `tag` is a truncated
//! HMAC-SHA256 over `user_id:expires:session_id`, base64url without padding.
//! The user and session are not carried in the token; the verifier supplies
//! them from the callback sender and the stored session.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Bytes of the MAC kept so the token fits inside a 64-byte callback payload.
const TAG_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

#[derive(Clone)]
pub struct FinalizeSigner {
    secret: Vec<u8>,
}

impl FinalizeSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn sign(&self, user_id: i64, session_id: &str, expires_at: i64) -> String {
        let tag = self.tag(user_id, session_id, expires_at);
        format!("{expires_at}.{}", URL_SAFE_NO_PAD.encode(tag))
    }

    /// Signature first, then expiry.
    pub fn verify(
        &self,
        token: &str,
        user_id: i64,
        session_id: &str,
        now: i64,
    ) -> Result<(), TokenError> {
        let (expires_raw, tag_raw) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let expires_at: i64 = expires_raw.parse().map_err(|_| TokenError::Malformed)?;
        let provided = URL_SAFE_NO_PAD
            .decode(tag_raw)
            .map_err(|_| TokenError::Malformed)?;
        if provided.len() != TAG_BYTES {
            return Err(TokenError::Malformed);
        }
        let expected = self.tag(user_id, session_id, expires_at);
        if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            return Err(TokenError::BadSignature);
        }
        if now >= expires_at {
            return Err(TokenError::Expired);
        }
        Ok(())
    }

    fn tag(&self, user_id: i64, session_id: &str, expires_at: i64) -> Vec<u8> {
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            // HMAC accepts keys of any length
            Err(_) => return vec![0; TAG_BYTES],
        };
        mac.update(format!("{user_id}:{expires_at}:{session_id}").as_bytes());
        let digest = mac.finalize().into_bytes();
        digest[..TAG_BYTES].to_vec()
    }
}
