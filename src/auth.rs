//! Connection authentication
//!
//! The delivery layer trusts whatever identity an [`Authenticator`] returns.
//! The bundled [`SignedTokenAuthenticator`] checks tokens of the form
//! `<uid>.<hex sha256(secret ":" uid)>`.

use sha2::{Digest, Sha256};

use crate::error::{RelayError, Result};
use crate::protocol::message::UserId;

/// Maps handshake credentials to a user id
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, credentials: &str) -> Result<UserId>;
}

impl<F> Authenticator for F
where
    F: Fn(&str) -> Result<UserId> + Send + Sync + 'static,
{
    fn authenticate(&self, credentials: &str) -> Result<UserId> {
        self(credentials)
    }
}

/// HMAC-less signed token check keyed by a shared secret
#[derive(Clone)]
pub struct SignedTokenAuthenticator {
    secret: String,
}

impl std::fmt::Debug for SignedTokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedTokenAuthenticator")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignedTokenAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issue a token for `user_id`
    pub fn issue(&self, user_id: &str) -> String {
        format!("{}.{}", user_id, self.signature(user_id))
    }

    fn signature(&self, user_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(user_id.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl Authenticator for SignedTokenAuthenticator {
    fn authenticate(&self, credentials: &str) -> Result<UserId> {
        let (user_id, signature) = credentials
            .rsplit_once('.')
            .ok_or_else(|| RelayError::auth_failed("malformed token"))?;

        if user_id.is_empty() {
            return Err(RelayError::auth_failed("empty user id"));
        }

        if !constant_time_eq(self.signature(user_id).as_bytes(), signature.as_bytes()) {
            return Err(RelayError::auth_failed("invalid token signature"));
        }

        Ok(user_id.to_string())
    }
}

/// Check a peer's service credential. An unset token admits no one.
pub(crate) fn service_token_matches(expected: &str, presented: &str) -> bool {
    !expected.is_empty() && constant_time_eq(expected.as_bytes(), presented.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
