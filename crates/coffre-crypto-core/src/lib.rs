//! `coffre-crypto-core` — cryptographic primitives for COFFRE.
//!
//! This crate is the audit target: zero I/O, zero async, no format
//! logic. It provides the cipher/KDF/stream-cipher families the KDBX
//! codec selects by UUID, secure memory containers for key material,
//! and the cancellable progress tree shared by CPU-heavy stages.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod memory;
pub mod progress;

pub mod cipher;
pub mod kdf;
pub mod stream;

pub mod vardict;

pub use cipher::{DataCipher, AES256_UUID, CHACHA20_UUID, TWOFISH_UUID};
pub use error::CryptoError;
pub use kdf::{Kdf, KdfParams, AES_KDF_UUID, ARGON2D_UUID, ARGON2ID_UUID};
pub use memory::{random_bytes, LockedRegion, SecretBuffer, SecretBytes};
pub use progress::{Progress, ProgressInterruption};
pub use stream::{InnerStreamAlgorithm, InnerStreamCipher};
pub use vardict::{Value, VariantDict};
