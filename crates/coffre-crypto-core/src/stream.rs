//! Inner stream ciphers for protected-field obfuscation.
//!
//! Inside the already-decrypted XML, fields flagged `Protected` carry a
//! second layer of encryption from a keystream cipher negotiated in the
//! header (Salsa20 for v3, ChaCha20 for v4, Null as a degenerate
//! fallback). One cipher instance is shared across an entire
//! (de)serialization pass — the keystream position advances over every
//! protected value in document order, so values must be processed in
//! the order they appear.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use salsa20::Salsa20;
use sha2::{Digest, Sha256, Sha512};

/// Fixed Salsa20 nonce mandated by the format.
const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Inner stream algorithm IDs as stored in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InnerStreamAlgorithm {
    /// No obfuscation (ID 0).
    Null,
    /// Salsa20 (ID 2), the v3 default.
    Salsa20,
    /// ChaCha20 (ID 3), the v4 default.
    ChaCha20,
}

impl InnerStreamAlgorithm {
    /// Resolve an algorithm from its raw header ID. `None` means
    /// unsupported (this includes the long-obsolete ArcFour ID 1).
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Null),
            2 => Some(Self::Salsa20),
            3 => Some(Self::ChaCha20),
            _ => None,
        }
    }

    /// The raw ID written to the header.
    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Salsa20 => 2,
            Self::ChaCha20 => 3,
        }
    }

    /// Human-readable name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Salsa20 => "Salsa20",
            Self::ChaCha20 => "ChaCha20",
        }
    }

    /// Key length drawn by `randomize_seeds` for this algorithm.
    #[must_use]
    pub const fn key_size(self) -> usize {
        match self {
            Self::Null => 0,
            Self::Salsa20 => 32,
            Self::ChaCha20 => 64,
        }
    }

    /// Instantiate the keystream for the given raw key.
    #[must_use]
    pub fn cipher(self, key: &[u8]) -> InnerStreamCipher {
        match self {
            Self::Null => InnerStreamCipher::Null,
            Self::Salsa20 => {
                let hashed: [u8; 32] = Sha256::digest(key).into();
                InnerStreamCipher::Salsa20(Box::new(Salsa20::new(
                    &hashed.into(),
                    &SALSA20_NONCE.into(),
                )))
            }
            Self::ChaCha20 => {
                let wide: [u8; 64] = Sha512::digest(key).into();
                let mut chacha_key = [0u8; 32];
                chacha_key.copy_from_slice(&wide[..32]);
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(&wide[32..44]);
                InnerStreamCipher::ChaCha20(Box::new(ChaCha20::new(
                    &chacha_key.into(),
                    &nonce.into(),
                )))
            }
        }
    }
}

/// Stateful keystream applied to protected values.
///
/// Encryption and decryption are the same XOR; what matters is that the
/// stream position is shared across all values of one pass.
pub enum InnerStreamCipher {
    Null,
    Salsa20(Box<Salsa20>),
    ChaCha20(Box<ChaCha20>),
}

impl InnerStreamCipher {
    /// XOR the next keystream bytes over `data` in place.
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            Self::Null => {}
            Self::Salsa20(cipher) => cipher.apply_keystream(data),
            Self::ChaCha20(cipher) => cipher.apply_keystream(data),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
