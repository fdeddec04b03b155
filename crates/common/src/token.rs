//! Host tokens: `hex(sha256(identity || secret))`.
//!
//! The token has no expiry and no nonce, so a captured token stays valid for
//! its identity until the secret is rotated out of every [`SecretRing`] that
//! accepts it.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of a rendered token (SHA-256, lowercase hex).
pub const TOKEN_HEX_LEN: usize = 64;

pub fn derive_token(identity: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recomputes the token for `identity` and compares it in constant time.
pub fn verify(identity: &str, token: &str, secret: &str) -> bool {
    let expected = derive_token(identity, secret);
    bool::from(expected.as_bytes().ct_eq(token.as_bytes()))
}

/// The secret agents derive with, plus older secrets still accepted while a
/// rotation rolls out.
#[derive(Clone)]
pub struct SecretRing {
    current: String,
    previous: Vec<String>,
}

impl SecretRing {
    pub fn new(current: impl Into<String>) -> Self {
        Self {
            current: current.into(),
            previous: Vec::new(),
        }
    }

    pub fn with_previous<I, S>(mut self, previous: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let current = self.current.clone();
        self.previous.extend(
            previous
                .into_iter()
                .map(Into::into)
                .filter(|secret: &String| !secret.is_empty() && *secret != current),
        );
        self.previous.dedup();
        self
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn previous_count(&self) -> usize {
        self.previous.len()
    }

    pub fn derive(&self, identity: &str) -> String {
        derive_token(identity, &self.current)
    }

    /// Every secret is checked so the time taken does not reveal which one
    /// matched.
    pub fn verify(&self, identity: &str, token: &str) -> bool {
        let mut matched = verify(identity, token, &self.current);
        for secret in &self.previous {
            matched |= verify(identity, token, secret);
        }
        matched
    }
}

impl std::fmt::Debug for SecretRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRing")
            .field("current", &"<redacted>")
            .field("previous", &self.previous.len())
            .finish()
    }
}
