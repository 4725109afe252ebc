//! Per-request CSP nonce generation.
//!
//! A [`Nonce`] is 16 bytes from the operating system CSPRNG, rendered as 32
//! lowercase hex characters. The value is immutable once minted and its
//! `Debug` output is redacted so it never lands in a log line.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

/// Number of random bytes drawn per nonce.
pub const NONCE_BYTES: usize = 16;

/// Length of the hex-encoded nonce.
pub const NONCE_HEX_LEN: usize = 32;

/// Errors produced while minting a nonce.
#[derive(Debug, thiserror::Error)]
pub enum NonceError {
    /// The OS randomness source could not be read.
    #[error("entropy source unavailable: {0}")]
    EntropyUnavailable(String),
}

/// Opaque one-time token shared by the CSP header and permitted scripts.
#[derive(Clone, PartialEq, Eq)]
pub struct Nonce(String);

impl Nonce {
    /// Mint a fresh nonce from the OS randomness source.
    ///
    /// # Errors
    ///
    /// Returns [`NonceError::EntropyUnavailable`] when the OS source fails.
    /// Callers must not fall back to a weaker generator.
    pub fn generate() -> Result<Self, NonceError> {
        Self::generate_with(&mut OsRng)
    }

    /// Mint a nonce from the given random source.
    #[doc(hidden)]
    pub fn generate_with<R: RngCore + ?Sized>(rng: &mut R) -> Result<Self, NonceError> {
        let mut bytes = [0u8; NONCE_BYTES];
        rng.try_fill_bytes(&mut bytes)
            .map_err(|e| NonceError::EntropyUnavailable(e.to_string()))?;
        Ok(Self(hex::encode(bytes)))
    }

    /// The hex token as it appears in headers and attributes.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Nonce").field(&"__REDACTED__").finish()
    }
}
