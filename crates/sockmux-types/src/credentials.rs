//! API credentials for authenticated connections
//!
//! The secret half is wrapped in [`secrecy::SecretString`] so it is zeroized
//! on drop and cannot leak through `Debug` output. How the secret is turned
//! into an authentication payload is the business of the protocol hook, not
//! of this type.

use secrecy::{ExposeSecret, SecretString};

/// Credentials for an authenticated socket connection
#[derive(Clone)]
pub struct ApiCredentials {
    /// Public API key
    key: String,
    /// Private secret, zeroized on drop
    secret: SecretString,
}

impl ApiCredentials {
    /// Create credentials from a key and secret
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: SecretString::from(secret.into()),
        }
    }

    /// The public API key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Expose the secret for signing; callers must not store the result
    pub fn expose_secret(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("key", &self.key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
