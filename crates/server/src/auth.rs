use axum::http::HeaderValue;
use subtle::ConstantTimeEq;
use taskd_common::SecretRing;

/// Checks host tokens derived from the shared secret ring.
#[derive(Clone, Debug)]
pub(crate) struct HostAuthenticator {
    ring: SecretRing,
}

impl HostAuthenticator {
    pub(crate) fn new(ring: SecretRing) -> Self {
        Self { ring }
    }

    pub(crate) fn authenticate(&self, identity: &str, token: Option<&str>) -> bool {
        match token.map(str::trim) {
            Some(token) if !token.is_empty() && !identity.is_empty() => {
                self.ring.verify(identity, token)
            }
            _ => false,
        }
    }
}

/// Static bearer tokens allowed to enqueue tasks.
#[derive(Clone)]
pub(crate) struct AdminAuth {
    tokens: Vec<String>,
}

impl AdminAuth {
    pub(crate) fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        let mut tokens: Vec<String> = tokens
            .into_iter()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect();
        tokens.sort();
        tokens.dedup();
        Self { tokens }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub(crate) fn validate(&self, header: Option<&HeaderValue>) -> bool {
        let Some(presented) = bearer_token(header) else {
            return false;
        };

        let mut matched = false;
        for token in &self.tokens {
            matched |= bool::from(token.as_bytes().ct_eq(presented.as_bytes()));
        }
        matched
    }
}

/// Optional shared token for panel and extension writes
/// (`POST /api/add_observation`). Unset means open.
#[derive(Clone, Default)]
pub(crate) struct PanelAuth {
    token: Option<String>,
}

impl PanelAuth {
    pub(crate) fn new(token: Option<String>) -> Self {
        Self {
            token: token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
        }
    }

    pub(crate) fn allows(&self, presented: Option<&str>) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        presented
            .map(str::trim)
            .is_some_and(|presented| bool::from(expected.as_bytes().ct_eq(presented.as_bytes())))
    }
}

pub(crate) fn bearer_token(header: Option<&HeaderValue>) -> Option<&str> {
    let raw = header.and_then(|value| value.to_str().ok())?.trim();

    let token = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(raw)
        .trim();

    (!token.is_empty()).then_some(token)
}
