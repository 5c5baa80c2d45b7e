//! Cryptographic error types for `coffre-crypto-core`.

use crate::progress::ProgressInterruption;
use thiserror::Error;

/// Errors produced by cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// User cancellation observed inside a primitive.
    ///
    /// Carried transparently so upper layers can unwrap it back into a
    /// [`ProgressInterruption`] instead of a crypto failure.
    #[error(transparent)]
    Interrupted(#[from] ProgressInterruption),

    /// The system CSPRNG failed to produce bytes.
    #[error("random number generator failure: {0}")]
    Rng(String),

    /// Invalid key material (wrong length, corrupted bytes).
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// A key derivation parameter is missing or out of range.
    #[error("invalid {kdf} parameter: {param}")]
    InvalidKdfParam {
        /// Human-readable KDF name.
        kdf: &'static str,
        /// The offending parameter key.
        param: &'static str,
    },

    /// Key derivation failed (allocation, backend error).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// A bulk cipher operation failed (bad padding, misaligned input).
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Secure memory allocation failure.
    #[error("secure memory error: {0}")]
    SecureMemory(String),
}
