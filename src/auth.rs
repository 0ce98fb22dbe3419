//! Token verification seam.
//!
//! Token issuance belongs to the surrounding product; this engine only
//! verifies. The gateway holds a [`TokenVerifier`] injected at the
//! composition root, so tests and deployments swap implementations freely.

use std::time::{SystemTime, UNIX_EPOCH};

/// Authenticated user reference. Opaque to the engine; carried on sessions
/// for logging and authorization hooks only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

impl Identity {
    /// Identity used for tokenless connections in permissive mode.
    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verification errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Token structure unreadable
    Malformed,
    /// Signature/secret mismatch
    Invalid,
    /// Token past its expiry
    Expired,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Malformed => write!(f, "Malformed token"),
            AuthError::Invalid => write!(f, "Invalid token"),
            AuthError::Expired => write!(f, "Expired token"),
        }
    }
}

impl std::error::Error for AuthError {}

/// External identity verifier: takes a token, returns the identity it
/// certifies or why it does not.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Verifier for the product's expiry-stamped shared-secret tokens:
/// `<user>:<expires-unix>:<secret>`.
pub struct SharedSecretVerifier {
    secret: String,
}

impl SharedSecretVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

impl TokenVerifier for SharedSecretVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let mut parts = token.splitn(3, ':');
        let (user, expiry, secret) = match (parts.next(), parts.next(), parts.next()) {
            (Some(u), Some(e), Some(s)) if !u.is_empty() => (u, e, s),
            _ => return Err(AuthError::Malformed),
        };

        let expiry: u64 = expiry.parse().map_err(|_| AuthError::Malformed)?;
        if secret.is_empty() || secret != self.secret {
            return Err(AuthError::Invalid);
        }
        if expiry < Self::now() {
            return Err(AuthError::Expired);
        }
        Ok(Identity(user.to_string()))
    }
}

/// Verifier that accepts any non-empty token, for tests and local setups.
pub struct AcceptAll;

impl TokenVerifier for AcceptAll {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Malformed);
        }
        Ok(Identity(token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(user: &str, expires_in: i64, secret: &str) -> String {
        let expiry = (SharedSecretVerifier::now() as i64 + expires_in).max(0);
        format!("{user}:{expiry}:{secret}")
    }

    #[test]
    fn test_valid_token_yields_identity() {
        let verifier = SharedSecretVerifier::new("s3cret");
        let identity = verifier.verify(&token("alice", 3600, "s3cret")).unwrap();
        assert_eq!(identity, Identity("alice".to_string()));
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = SharedSecretVerifier::new("s3cret");
        let err = verifier.verify(&token("alice", -60, "s3cret")).unwrap_err();
        assert_eq!(err, AuthError::Expired);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = SharedSecretVerifier::new("s3cret");
        let err = verifier.verify(&token("alice", 3600, "guess")).unwrap_err();
        assert_eq!(err, AuthError::Invalid);
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        let verifier = SharedSecretVerifier::new("s3cret");
        assert_eq!(verifier.verify("").unwrap_err(), AuthError::Malformed);
        assert_eq!(verifier.verify("alice").unwrap_err(), AuthError::Malformed);
        assert_eq!(verifier.verify("alice:notanumber:s3cret").unwrap_err(), AuthError::Malformed);
    }

    #[test]
    fn test_accept_all() {
        assert!(AcceptAll.verify("anything").is_ok());
        assert!(AcceptAll.verify("").is_err());
    }
}
