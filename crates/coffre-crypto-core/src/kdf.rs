//! Key derivation functions selectable by UUID.
//!
//! The composite key is stretched into the transformed key by either
//! AES-KDF (many rounds of AES-256-ECB, the v3 legacy) or Argon2 (d or
//! id, the v4 default). Parameters travel in a [`VariantDict`] whose
//! `$UUID` entry names the function; v3 headers synthesize an AES-KDF
//! dictionary from their TransformSeed/TransformRounds fields.
//!
//! Derivation is CPU-hard by design, so it owns a [`Progress`] child
//! and observes cancellation: AES-KDF every 100 000 rounds, Argon2 at
//! the boundaries of its single-shot derivation.

use crate::error::CryptoError;
use crate::memory::{random_bytes, SecretBytes};
use crate::progress::Progress;
use crate::vardict::{Value, VariantDict};
use aes::Aes256;
use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, KeyInit};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// UUID of AES-KDF.
pub const AES_KDF_UUID: [u8; 16] = [
    0xC9, 0xD9, 0xF3, 0x9A, 0x62, 0x8A, 0x44, 0x60, 0xBF, 0x74, 0x0D, 0x08, 0xC1, 0x8A, 0x4F,
    0xEA,
];

/// UUID of Argon2d.
pub const ARGON2D_UUID: [u8; 16] = [
    0xEF, 0x63, 0x6D, 0xDF, 0x8C, 0x29, 0x44, 0x4B, 0x91, 0xF7, 0xA9, 0xA4, 0x03, 0xE3, 0x0A,
    0x0C,
];

/// UUID of Argon2id.
pub const ARGON2ID_UUID: [u8; 16] = [
    0x9E, 0x29, 0x8B, 0x19, 0x56, 0xDB, 0x47, 0x73, 0xB2, 0x3D, 0xFC, 0x3E, 0xC6, 0xF0, 0xA1,
    0xE6,
];

/// Dictionary key holding the KDF UUID.
pub const PARAM_UUID: &str = "$UUID";

/// AES-KDF: 32-byte transform seed.
pub const PARAM_AES_SEED: &str = "S";
/// AES-KDF: round count (u64).
pub const PARAM_AES_ROUNDS: &str = "R";

/// Argon2: salt bytes.
pub const PARAM_ARGON2_SALT: &str = "S";
/// Argon2: parallelism (u32).
pub const PARAM_ARGON2_PARALLELISM: &str = "P";
/// Argon2: memory in bytes (u64).
pub const PARAM_ARGON2_MEMORY: &str = "M";
/// Argon2: iterations (u64).
pub const PARAM_ARGON2_ITERATIONS: &str = "I";
/// Argon2: version, 0x10 or 0x13 (u32).
pub const PARAM_ARGON2_VERSION: &str = "V";

const AES_KDF_DEFAULT_ROUNDS: u64 = 60_000;
const ARGON2_DEFAULT_ITERATIONS: u64 = 2;
const ARGON2_DEFAULT_MEMORY: u64 = 64 * 1024 * 1024;
const ARGON2_DEFAULT_PARALLELISM: u32 = 2;

const ARGON2_MIN_MEMORY: u64 = 1024 * 8;
const ARGON2_MAX_PARALLELISM: u32 = (1 << 24) - 1;
const AES_KDF_PROGRESS_STRIDE: u64 = 100_000;

/// Key derivation family, closed by design.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kdf {
    AesKdf,
    Argon2d,
    Argon2id,
}

impl Kdf {
    /// Resolve a KDF by its UUID. `None` means unsupported.
    #[must_use]
    pub fn from_uuid(uuid: &[u8]) -> Option<Self> {
        if uuid == AES_KDF_UUID {
            Some(Self::AesKdf)
        } else if uuid == ARGON2D_UUID {
            Some(Self::Argon2d)
        } else if uuid == ARGON2ID_UUID {
            Some(Self::Argon2id)
        } else {
            None
        }
    }

    /// The UUID stored in the `$UUID` parameter entry.
    #[must_use]
    pub const fn uuid(self) -> &'static [u8; 16] {
        match self {
            Self::AesKdf => &AES_KDF_UUID,
            Self::Argon2d => &ARGON2D_UUID,
            Self::Argon2id => &ARGON2ID_UUID,
        }
    }

    /// Human-readable name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AesKdf => "AES-KDF",
            Self::Argon2d => "Argon2d",
            Self::Argon2id => "Argon2id",
        }
    }

    /// Reasonable default parameters (seeds/salts are zero until
    /// [`Kdf::randomize`] runs before a save).
    #[must_use]
    pub fn default_params(self) -> KdfParams {
        let mut dict = VariantDict::new();
        dict.set(PARAM_UUID, Value::Bytes(self.uuid().to_vec()));
        match self {
            Self::AesKdf => {
                dict.set(PARAM_AES_SEED, Value::Bytes(vec![0u8; 32]));
                dict.set(PARAM_AES_ROUNDS, Value::UInt64(AES_KDF_DEFAULT_ROUNDS));
            }
            Self::Argon2d | Self::Argon2id => {
                dict.set(PARAM_ARGON2_SALT, Value::Bytes(vec![0u8; 32]));
                dict.set(
                    PARAM_ARGON2_PARALLELISM,
                    Value::UInt32(ARGON2_DEFAULT_PARALLELISM),
                );
                dict.set(PARAM_ARGON2_MEMORY, Value::UInt64(ARGON2_DEFAULT_MEMORY));
                dict.set(
                    PARAM_ARGON2_ITERATIONS,
                    Value::UInt64(ARGON2_DEFAULT_ITERATIONS),
                );
                dict.set(PARAM_ARGON2_VERSION, Value::UInt32(0x13));
            }
        }
        KdfParams { dict }
    }

    /// Replace the salt/seed with fresh random bytes.
    ///
    /// Must run before every save: reusing a transform seed across
    /// saves is a security bug.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Rng`] if the CSPRNG fails.
    pub fn randomize(self, params: &mut KdfParams) -> Result<(), CryptoError> {
        let salt = random_bytes(32)?;
        match self {
            Self::AesKdf => params.dict.set(PARAM_AES_SEED, Value::Bytes(salt)),
            Self::Argon2d | Self::Argon2id => {
                params.dict.set(PARAM_ARGON2_SALT, Value::Bytes(salt));
            }
        }
        Ok(())
    }

    /// Stretch `key` into the 32-byte transformed key.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidKdfParam`] on missing/out-of-range
    /// parameters, [`CryptoError::KeyDerivation`] on backend failure,
    /// [`CryptoError::Interrupted`] on user cancellation.
    pub fn transform(
        self,
        key: &SecretBytes<32>,
        params: &KdfParams,
        progress: &Progress,
    ) -> Result<SecretBytes<32>, CryptoError> {
        match self {
            Self::AesKdf => transform_aes_kdf(key, params, progress),
            Self::Argon2d => transform_argon2(argon2::Algorithm::Argon2d, key, params, progress),
            Self::Argon2id => {
                transform_argon2(argon2::Algorithm::Argon2id, key, params, progress)
            }
        }
    }
}

/// KDF parameter set — a [`VariantDict`] with a mandatory `$UUID` entry.
///
/// Unknown entries (e.g. Argon2's optional `K`/`A`) are preserved and
/// re-serialized untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KdfParams {
    dict: VariantDict,
}

impl KdfParams {
    /// Parse a serialized parameter dictionary.
    ///
    /// Returns `None` when the dictionary is malformed or its `$UUID`
    /// entry is missing/misshaped. An unknown-but-well-formed UUID is
    /// accepted here; [`KdfParams::kdf`] reports it as unsupported.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        let dict = VariantDict::parse(data)?;
        let uuid = dict.get_bytes(PARAM_UUID)?;
        if uuid.len() != 16 {
            return None;
        }
        Some(Self { dict })
    }

    /// Serialize for the KdfParameters header field.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        self.dict.serialize()
    }

    /// The embedded KDF UUID.
    #[must_use]
    pub fn kdf_uuid(&self) -> [u8; 16] {
        self.dict
            .get_bytes(PARAM_UUID)
            .and_then(|b| b.try_into().ok())
            .unwrap_or([0u8; 16])
    }

    /// Resolve the KDF named by `$UUID`. `None` means unsupported.
    #[must_use]
    pub fn kdf(&self) -> Option<Kdf> {
        Kdf::from_uuid(&self.kdf_uuid())
    }

    /// Direct access to the underlying dictionary.
    #[must_use]
    pub const fn dict(&self) -> &VariantDict {
        &self.dict
    }

    /// Mutable access, used by the v3 header to graft TransformSeed and
    /// TransformRounds into a synthesized AES-KDF dictionary.
    pub fn set(&mut self, key: &str, value: Value) {
        self.dict.set(key, value);
    }
}

// ---------------------------------------------------------------------------
// AES-KDF
// ---------------------------------------------------------------------------

// The only arithmetic is a modulo by a non-zero stride constant.
#[allow(clippy::arithmetic_side_effects)]
fn transform_aes_kdf(
    key: &SecretBytes<32>,
    params: &KdfParams,
    progress: &Progress,
) -> Result<SecretBytes<32>, CryptoError> {
    let seed = params
        .dict
        .get_bytes(PARAM_AES_SEED)
        .filter(|s| s.len() == 32)
        .ok_or(CryptoError::InvalidKdfParam {
            kdf: "AES-KDF",
            param: PARAM_AES_SEED,
        })?;
    let rounds = params
        .dict
        .get_u64(PARAM_AES_ROUNDS)
        .ok_or(CryptoError::InvalidKdfParam {
            kdf: "AES-KDF",
            param: PARAM_AES_ROUNDS,
        })?;

    progress.set_total(rounds);

    let aes = Aes256::new_from_slice(seed)
        .map_err(|e| CryptoError::KeyDerivation(format!("AES-KDF seed rejected: {e}")))?;

    let mut state = *key.expose();
    for round in 0..rounds {
        if round % AES_KDF_PROGRESS_STRIDE == 0 {
            progress.set_completed(round);
            progress.check_cancelled()?;
        }
        let (lo, hi) = state.split_at_mut(16);
        aes.encrypt_block(GenericArray::from_mut_slice(lo));
        aes.encrypt_block(GenericArray::from_mut_slice(hi));
    }
    progress.finish();

    let out = SecretBytes::new(Sha256::digest(state).into());
    state.zeroize();
    Ok(out)
}

// ---------------------------------------------------------------------------
// Argon2
// ---------------------------------------------------------------------------

fn transform_argon2(
    algorithm: argon2::Algorithm,
    key: &SecretBytes<32>,
    params: &KdfParams,
    progress: &Progress,
) -> Result<SecretBytes<32>, CryptoError> {
    let kdf_name = match algorithm {
        argon2::Algorithm::Argon2d => "Argon2d",
        argon2::Algorithm::Argon2id => "Argon2id",
        argon2::Algorithm::Argon2i => "Argon2i",
    };
    let invalid = |param: &'static str| CryptoError::InvalidKdfParam {
        kdf: kdf_name,
        param,
    };

    let salt = params
        .dict
        .get_bytes(PARAM_ARGON2_SALT)
        .filter(|s| s.len() >= 8)
        .ok_or_else(|| invalid(PARAM_ARGON2_SALT))?;
    let memory = params
        .dict
        .get_u64(PARAM_ARGON2_MEMORY)
        .filter(|&m| m >= ARGON2_MIN_MEMORY)
        .ok_or_else(|| invalid(PARAM_ARGON2_MEMORY))?;
    let iterations = params
        .dict
        .get_u64(PARAM_ARGON2_ITERATIONS)
        .filter(|&i| i >= 1)
        .ok_or_else(|| invalid(PARAM_ARGON2_ITERATIONS))?;
    let parallelism = params
        .dict
        .get_u32(PARAM_ARGON2_PARALLELISM)
        .filter(|&p| (1..=ARGON2_MAX_PARALLELISM).contains(&p))
        .ok_or_else(|| invalid(PARAM_ARGON2_PARALLELISM))?;
    let version_raw = params
        .dict
        .get_u32(PARAM_ARGON2_VERSION)
        .ok_or_else(|| invalid(PARAM_ARGON2_VERSION))?;
    let version = argon2::Version::try_from(version_raw)
        .map_err(|_| invalid(PARAM_ARGON2_VERSION))?;

    let m_cost = u32::try_from(memory / 1024).map_err(|_| invalid(PARAM_ARGON2_MEMORY))?;
    let t_cost = u32::try_from(iterations).map_err(|_| invalid(PARAM_ARGON2_ITERATIONS))?;

    let argon2_params = argon2::Params::new(m_cost, t_cost, parallelism, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(format!("invalid argon2 params: {e}")))?;
    let argon2 = argon2::Argon2::new(algorithm, version, argon2_params);

    // The argon2 crate derives in one shot; cancellation is observed at
    // the boundaries and the child range completes atomically.
    progress.set_total(t_cost.into());
    progress.check_cancelled()?;

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(key.expose(), salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(format!("argon2 derivation failed: {e}")))?;

    progress.finish();
    progress.check_cancelled()?;

    let result = SecretBytes::new(output);
    output.zeroize();
    Ok(result)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_argon2_params(kdf: Kdf) -> KdfParams {
        let mut params = kdf.default_params();
        params.set(PARAM_ARGON2_MEMORY, Value::UInt64(1024 * 64));
        params.set(PARAM_ARGON2_ITERATIONS, Value::UInt64(1));
        params.set(PARAM_ARGON2_PARALLELISM, Value::UInt32(1));
        params.set(PARAM_ARGON2_SALT, Value::Bytes(vec![0x55; 32]));
        params
    }

    fn fast_aes_params(rounds: u64) -> KdfParams {
        let mut params = Kdf::AesKdf.default_params();
        params.set(PARAM_AES_SEED, Value::Bytes(vec![0x11; 32]));
        params.set(PARAM_AES_ROUNDS, Value::UInt64(rounds));
        params
    }

    #[test]
    fn uuid_factory_resolves_all_known_kdfs() {
        assert_eq!(Kdf::from_uuid(&AES_KDF_UUID), Some(Kdf::AesKdf));
        assert_eq!(Kdf::from_uuid(&ARGON2D_UUID), Some(Kdf::Argon2d));
        assert_eq!(Kdf::from_uuid(&ARGON2ID_UUID), Some(Kdf::Argon2id));
        assert_eq!(Kdf::from_uuid(&[0u8; 16]), None);
    }

    #[test]
    fn params_roundtrip_preserves_unknown_entries() {
        let mut params = Kdf::Argon2d.default_params();
        params.set("K", Value::Bytes(vec![1, 2, 3]));
        let parsed = KdfParams::parse(&params.serialize()).expect("parse should succeed");
        assert_eq!(parsed.dict().get_bytes("K"), Some(&[1u8, 2, 3][..]));
        assert_eq!(parsed.kdf(), Some(Kdf::Argon2d));
    }

    #[test]
    fn params_parse_rejects_missing_uuid() {
        let dict = VariantDict::new();
        assert!(KdfParams::parse(&dict.serialize()).is_none());
    }

    #[test]
    fn params_with_unknown_uuid_report_unsupported() {
        let mut dict = VariantDict::new();
        dict.set(PARAM_UUID, Value::Bytes(vec![0x99; 16]));
        let params = KdfParams::parse(&dict.serialize()).expect("well-formed dict");
        assert_eq!(params.kdf(), None);
        assert_eq!(params.kdf_uuid(), [0x99; 16]);
    }

    #[test]
    fn aes_kdf_is_deterministic() {
        let key = SecretBytes::new([0x42; 32]);
        let params = fast_aes_params(1000);
        let a = Kdf::AesKdf
            .transform(&key, &params, &Progress::new(100))
            .expect("transform should succeed");
        let b = Kdf::AesKdf
            .transform(&key, &params, &Progress::new(100))
            .expect("transform should succeed");
        assert_eq!(a.expose(), b.expose());
    }

    #[test]
    fn aes_kdf_round_count_changes_output() {
        let key = SecretBytes::new([0x42; 32]);
        let a = Kdf::AesKdf
            .transform(&key, &fast_aes_params(1000), &Progress::new(100))
            .expect("transform should succeed");
        let b = Kdf::AesKdf
            .transform(&key, &fast_aes_params(1001), &Progress::new(100))
            .expect("transform should succeed");
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn aes_kdf_rejects_short_seed() {
        let key = SecretBytes::new([0x42; 32]);
        let mut params = Kdf::AesKdf.default_params();
        params.set(PARAM_AES_SEED, Value::Bytes(vec![0x11; 31]));
        let result = Kdf::AesKdf.transform(&key, &params, &Progress::new(100));
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKdfParam { param: "S", .. })
        ));
    }

    #[test]
    fn aes_kdf_observes_cancellation() {
        let key = SecretBytes::new([0x42; 32]);
        let params = fast_aes_params(10_000_000);
        let progress = Progress::new(100);
        progress.cancel();
        let result = Kdf::AesKdf.transform(&key, &params, &progress);
        assert!(matches!(result, Err(CryptoError::Interrupted(_))));
    }

    #[test]
    fn argon2d_and_argon2id_differ() {
        let key = SecretBytes::new([0x42; 32]);
        let d = Kdf::Argon2d
            .transform(&key, &fast_argon2_params(Kdf::Argon2d), &Progress::new(100))
            .expect("transform should succeed");
        let id = Kdf::Argon2id
            .transform(
                &key,
                &fast_argon2_params(Kdf::Argon2id),
                &Progress::new(100),
            )
            .expect("transform should succeed");
        assert_ne!(d.expose(), id.expose());
    }

    #[test]
    fn argon2_rejects_tiny_memory() {
        let key = SecretBytes::new([0x42; 32]);
        let mut params = fast_argon2_params(Kdf::Argon2d);
        params.set(PARAM_ARGON2_MEMORY, Value::UInt64(1024));
        let result = Kdf::Argon2d.transform(&key, &params, &Progress::new(100));
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKdfParam { param: "M", .. })
        ));
    }

    #[test]
    fn argon2_rejects_unknown_version() {
        let key = SecretBytes::new([0x42; 32]);
        let mut params = fast_argon2_params(Kdf::Argon2d);
        params.set(PARAM_ARGON2_VERSION, Value::UInt32(0x42));
        let result = Kdf::Argon2d.transform(&key, &params, &Progress::new(100));
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKdfParam { param: "V", .. })
        ));
    }

    #[test]
    fn randomize_refreshes_salt() {
        let mut params = Kdf::Argon2d.default_params();
        let before = params.dict().get_bytes(PARAM_ARGON2_SALT).map(<[u8]>::to_vec);
        Kdf::Argon2d
            .randomize(&mut params)
            .expect("randomize should succeed");
        let after = params.dict().get_bytes(PARAM_ARGON2_SALT).map(<[u8]>::to_vec);
        assert_ne!(before, after);
        assert_eq!(after.map(|s| s.len()), Some(32));
    }
}
