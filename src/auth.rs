//! Request authentication.

use crate::error::{RelayError, Result};
use sha2::{Digest, Sha256};

/// Gate run before any producer or consumer request touches the relay.
pub trait Authenticator: Send + Sync {
    fn authorize(&self, credential: Option<&str>) -> Result<()>;
}

/// Accepts everything.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authorize(&self, _credential: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Accepts requests presenting one shared token.
///
/// Tokens are compared as SHA-256 digests so the comparison time does not
/// depend on where the first differing byte is.
pub struct TokenAuthenticator {
    digest: [u8; 32],
}

impl TokenAuthenticator {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self {
            digest: Self::digest(token.as_ref()),
        }
    }

    fn digest(token: &str) -> [u8; 32] {
        Sha256::digest(token.as_bytes()).into()
    }
}

impl Authenticator for TokenAuthenticator {
    fn authorize(&self, credential: Option<&str>) -> Result<()> {
        let presented = Self::digest(credential.ok_or(RelayError::AuthRejected)?);
        let diff = presented
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));

        if diff == 0 {
            Ok(())
        } else {
            Err(RelayError::AuthRejected)
        }
    }
}
