//! Outer and inner KDBX header codec.
//!
//! The outer header is plaintext: two magic signatures, a version word
//! whose upper 16 bits pick v3 or v4, then typed-length-value fields up
//! to a terminator. The exact byte range consumed is hashed (SHA-256)
//! and kept — v4 stores that hash (and an HMAC of the same bytes)
//! right after the header, and v3 embeds it in the Meta XML.
//!
//! v4 adds a second, *inner* header at the start of the decrypted
//! payload: the field-obfuscation stream algorithm and key, plus the
//! binary attachment pool.

use crate::binaries::{Binary, BinaryPool};
use crate::error::HeaderError;
use crate::io::ByteReader;
use coffre_crypto_core::kdf::{PARAM_AES_ROUNDS, PARAM_AES_SEED};
use coffre_crypto_core::{
    CryptoError, DataCipher, InnerStreamAlgorithm, Kdf, KdfParams, SecretBuffer, Value,
    VariantDict,
};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::io::Read;
use tracing::{debug, warn};

/// First magic signature of every KeePass 2.x file.
pub const SIGNATURE_1: u32 = 0x9AA2_D903;
/// Second magic signature.
pub const SIGNATURE_2: u32 = 0xB54B_FB67;

const FILE_VERSION_3: u32 = 0x0003_0001;
const FILE_VERSION_4: u32 = 0x0004_0000;
const VERSION_MASK: u32 = 0xFFFF_0000;

// Outer header field IDs.
const FIELD_END: u8 = 0;
const FIELD_COMMENT: u8 = 1;
const FIELD_CIPHER_ID: u8 = 2;
const FIELD_COMPRESSION_FLAGS: u8 = 3;
const FIELD_MASTER_SEED: u8 = 4;
const FIELD_TRANSFORM_SEED: u8 = 5; // v3 only
const FIELD_TRANSFORM_ROUNDS: u8 = 6; // v3 only
const FIELD_ENCRYPTION_IV: u8 = 7;
const FIELD_PROTECTED_STREAM_KEY: u8 = 8; // v3 only
const FIELD_STREAM_START_BYTES: u8 = 9; // v3 only
const FIELD_INNER_STREAM_ID: u8 = 10; // v3 only
const FIELD_KDF_PARAMETERS: u8 = 11; // v4
const FIELD_PUBLIC_CUSTOM_DATA: u8 = 12; // v4

// Inner header field IDs (v4).
const INNER_FIELD_END: u8 = 0;
const INNER_FIELD_STREAM_ID: u8 = 1;
const INNER_FIELD_STREAM_KEY: u8 = 2;
const INNER_FIELD_BINARY: u8 = 3;

/// KDBX format generation, selected by the version word's upper bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatVersion {
    V3,
    V4,
}

/// Parsed outer header.
#[derive(Debug)]
pub struct OuterHeader {
    pub format_version: FormatVersion,
    pub cipher: DataCipher,
    pub compressed: bool,
    pub master_seed: Vec<u8>,
    pub encryption_iv: Vec<u8>,
    pub kdf: Kdf,
    pub kdf_params: KdfParams,
    /// v3 only: random plaintext prefix used for wrong-key detection.
    pub stream_start_bytes: Option<Vec<u8>>,
    /// Field-obfuscation algorithm (outer field in v3, inner in v4).
    pub inner_stream: InnerStreamAlgorithm,
    pub public_custom_data: VariantDict,
    pub(crate) protected_stream_key: Option<SecretBuffer>,
    /// KeePass 2.38 stores data in the End field; preserved on write.
    end_value: Vec<u8>,
    raw: Vec<u8>,
    hash: [u8; 32],
}

impl OuterHeader {
    /// Header for a new database. The seeds stay empty until
    /// [`OuterHeader::randomize_seeds`] runs (before the first save).
    #[must_use]
    pub fn new(format_version: FormatVersion, cipher: DataCipher, kdf: Kdf, compressed: bool) -> Self {
        debug_assert!(
            format_version == FormatVersion::V4 || kdf == Kdf::AesKdf,
            "v3 headers can only carry AES-KDF"
        );
        let inner_stream = match format_version {
            FormatVersion::V3 => InnerStreamAlgorithm::Salsa20,
            FormatVersion::V4 => InnerStreamAlgorithm::ChaCha20,
        };
        Self {
            format_version,
            cipher,
            compressed,
            master_seed: Vec::new(),
            encryption_iv: Vec::new(),
            kdf,
            kdf_params: kdf.default_params(),
            stream_start_bytes: None,
            inner_stream,
            public_custom_data: VariantDict::new(),
            protected_stream_key: None,
            end_value: Vec::new(),
            raw: Vec::new(),
            hash: [0u8; 32],
        }
    }

    /// Checks whether `data` starts with the KeePass 2.x signatures.
    #[must_use]
    pub fn signature_matches(data: &[u8]) -> bool {
        let mut reader = ByteReader::new(data);
        reader.read_u32_le() == Some(SIGNATURE_1) && reader.read_u32_le() == Some(SIGNATURE_2)
    }

    /// Parse the outer header from the start of a database file.
    ///
    /// # Errors
    ///
    /// [`HeaderError`] describing the first offending field; unknown
    /// field IDs are skipped, not errors.
    #[allow(clippy::too_many_lines)]
    pub fn read(data: &[u8]) -> Result<Self, HeaderError> {
        let mut reader = ByteReader::new(data);

        let sign1 = reader.read_u32_le().ok_or(HeaderError::ReadingError)?;
        let sign2 = reader.read_u32_le().ok_or(HeaderError::ReadingError)?;
        let file_version = reader.read_u32_le().ok_or(HeaderError::ReadingError)?;
        if sign1 != SIGNATURE_1 || sign2 != SIGNATURE_2 {
            return Err(HeaderError::WrongSignature);
        }
        let format_version = if file_version & VERSION_MASK == FILE_VERSION_3 & VERSION_MASK {
            FormatVersion::V3
        } else if file_version & VERSION_MASK == FILE_VERSION_4 & VERSION_MASK {
            FormatVersion::V4
        } else {
            return Err(HeaderError::UnsupportedFileVersion(file_version));
        };
        debug!(?format_version, "header signatures OK");

        let mut cipher: Option<DataCipher> = None;
        let mut compressed: Option<bool> = None;
        let mut master_seed: Option<Vec<u8>> = None;
        let mut transform_seed: Option<Vec<u8>> = None;
        let mut transform_rounds: Option<u64> = None;
        let mut encryption_iv: Option<Vec<u8>> = None;
        let mut protected_stream_key: Option<SecretBuffer> = None;
        let mut stream_start_bytes: Option<Vec<u8>> = None;
        let mut inner_stream: Option<InnerStreamAlgorithm> = None;
        let mut kdf_params: Option<KdfParams> = None;
        let mut public_custom_data = VariantDict::new();
        let mut end_value = Vec::new();

        loop {
            let field_id = reader.read_u8().ok_or(HeaderError::ReadingError)?;
            let field_size = match format_version {
                FormatVersion::V3 => reader
                    .read_u16_le()
                    .map(usize::from)
                    .ok_or(HeaderError::ReadingError)?,
                FormatVersion::V4 => reader
                    .read_u32_le()
                    .map(|s| s as usize)
                    .ok_or(HeaderError::ReadingError)?,
            };
            let value = reader
                .read_bytes(field_size)
                .ok_or(HeaderError::ReadingError)?;

            let v3_only = |field: &'static str| {
                if format_version == FormatVersion::V3 {
                    Ok(())
                } else {
                    Err(HeaderError::CorruptedField(field))
                }
            };
            let v4_only = |field: &'static str| {
                if format_version == FormatVersion::V4 {
                    Ok(())
                } else {
                    Err(HeaderError::CorruptedField(field))
                }
            };

            match field_id {
                FIELD_END => {
                    end_value = value.to_vec();
                    break;
                }
                // header comments are ignored even by the original KeePass
                FIELD_COMMENT => {}
                FIELD_CIPHER_ID => {
                    if value.len() != 16 {
                        return Err(HeaderError::CorruptedField("CipherID"));
                    }
                    cipher = Some(
                        DataCipher::from_uuid(value)
                            .ok_or_else(|| HeaderError::UnsupportedDataCipher(hex::encode(value)))?,
                    );
                }
                FIELD_COMPRESSION_FLAGS => {
                    let flags: [u8; 4] = value
                        .try_into()
                        .map_err(|_| HeaderError::ReadingError)?;
                    match u32::from_le_bytes(flags) {
                        0 => compressed = Some(false),
                        1 => compressed = Some(true),
                        _ => return Err(HeaderError::UnknownCompressionAlgorithm),
                    }
                }
                FIELD_MASTER_SEED => {
                    if value.len() != 32 {
                        return Err(HeaderError::CorruptedField("MasterSeed"));
                    }
                    master_seed = Some(value.to_vec());
                }
                FIELD_TRANSFORM_SEED => {
                    v3_only("TransformSeed")?;
                    if value.len() != 32 {
                        return Err(HeaderError::CorruptedField("TransformSeed"));
                    }
                    transform_seed = Some(value.to_vec());
                }
                FIELD_TRANSFORM_ROUNDS => {
                    v3_only("TransformRounds")?;
                    let rounds: [u8; 8] = value
                        .try_into()
                        .map_err(|_| HeaderError::ReadingError)?;
                    transform_rounds = Some(u64::from_le_bytes(rounds));
                }
                FIELD_ENCRYPTION_IV => {
                    // size validated against the cipher after the loop
                    encryption_iv = Some(value.to_vec());
                }
                FIELD_PROTECTED_STREAM_KEY => {
                    v3_only("ProtectedStreamKey")?;
                    if value.len() != 32 {
                        return Err(HeaderError::CorruptedField("ProtectedStreamKey"));
                    }
                    protected_stream_key = Some(SecretBuffer::new(value));
                }
                FIELD_STREAM_START_BYTES => {
                    v3_only("StreamStartBytes")?;
                    stream_start_bytes = Some(value.to_vec());
                }
                FIELD_INNER_STREAM_ID => {
                    v3_only("InnerRandomStreamID")?;
                    let raw: [u8; 4] = value
                        .try_into()
                        .map_err(|_| HeaderError::CorruptedField("InnerRandomStreamID"))?;
                    let raw = u32::from_le_bytes(raw);
                    inner_stream = Some(
                        InnerStreamAlgorithm::from_raw(raw)
                            .ok_or(HeaderError::UnsupportedStreamCipher(raw))?,
                    );
                }
                FIELD_KDF_PARAMETERS => {
                    v4_only("KDFParameters")?;
                    kdf_params = Some(
                        KdfParams::parse(value)
                            .ok_or(HeaderError::CorruptedField("KDFParameters"))?,
                    );
                }
                FIELD_PUBLIC_CUSTOM_DATA => {
                    v4_only("PublicCustomData")?;
                    public_custom_data = VariantDict::parse(value)
                        .ok_or(HeaderError::CorruptedField("PublicCustomData"))?;
                }
                unknown => {
                    warn!(field_id = unknown, "unknown header field, skipping");
                }
            }
        }

        let size = reader.pos();
        let raw = data.get(..size).ok_or(HeaderError::ReadingError)?.to_vec();
        let hash: [u8; 32] = Sha256::digest(&raw).into();

        // Important-field presence; then coherence between them.
        let cipher = cipher.ok_or(HeaderError::CorruptedField("CipherID"))?;
        let compressed = compressed.ok_or(HeaderError::CorruptedField("CompressionFlags"))?;
        let master_seed = master_seed.ok_or(HeaderError::CorruptedField("MasterSeed"))?;
        let encryption_iv = encryption_iv.ok_or(HeaderError::CorruptedField("EncryptionIV"))?;

        let (kdf, kdf_params, inner_stream) = match format_version {
            FormatVersion::V3 => {
                let seed = transform_seed.ok_or(HeaderError::CorruptedField("TransformSeed"))?;
                let rounds =
                    transform_rounds.ok_or(HeaderError::CorruptedField("TransformRounds"))?;
                let start =
                    stream_start_bytes.as_ref().ok_or(HeaderError::CorruptedField("StreamStartBytes"))?;
                if start.is_empty() {
                    return Err(HeaderError::CorruptedField("StreamStartBytes"));
                }
                if protected_stream_key.is_none() {
                    return Err(HeaderError::CorruptedField("ProtectedStreamKey"));
                }
                let algorithm =
                    inner_stream.ok_or(HeaderError::CorruptedField("InnerRandomStreamID"))?;
                // synthesize a v4-style AES-KDF parameter set
                let mut params = Kdf::AesKdf.default_params();
                params.set(PARAM_AES_SEED, Value::Bytes(seed));
                params.set(PARAM_AES_ROUNDS, Value::UInt64(rounds));
                (Kdf::AesKdf, params, algorithm)
            }
            FormatVersion::V4 => {
                let params = kdf_params.ok_or(HeaderError::CorruptedField("KDFParameters"))?;
                let kdf = params.kdf().ok_or_else(|| {
                    HeaderError::UnsupportedKdf(hex::encode(params.kdf_uuid()))
                })?;
                // inner stream algorithm/key arrive with the inner header
                (kdf, params, InnerStreamAlgorithm::Null)
            }
        };

        if encryption_iv.len() != cipher.iv_size() {
            return Err(HeaderError::CorruptedField("EncryptionIV"));
        }
        debug!(cipher = cipher.name(), kdf = kdf.name(), "header read OK");

        Ok(Self {
            format_version,
            cipher,
            compressed,
            master_seed,
            encryption_iv,
            kdf,
            kdf_params,
            stream_start_bytes,
            inner_stream,
            public_custom_data,
            protected_stream_key,
            end_value,
            raw,
            hash,
        })
    }

    /// Size in bytes of the parsed/serialized header.
    #[must_use]
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    /// SHA-256 of the raw header bytes.
    #[must_use]
    pub const fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    pub(crate) fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Serialize the header in canonical field order, recomputing the
    /// retained hash from the freshly written bytes.
    ///
    /// # Errors
    ///
    /// [`HeaderError::CorruptedField`] when a version-required field is
    /// absent (seeds not yet randomized, v3 without AES-KDF material).
    pub fn write(&mut self) -> Result<Vec<u8>, HeaderError> {
        let mut out = Vec::new();
        out.extend_from_slice(&SIGNATURE_1.to_le_bytes());
        out.extend_from_slice(&SIGNATURE_2.to_le_bytes());
        match self.format_version {
            FormatVersion::V3 => {
                out.extend_from_slice(&FILE_VERSION_3.to_le_bytes());
                self.write_fields_v3(&mut out)?;
            }
            FormatVersion::V4 => {
                out.extend_from_slice(&FILE_VERSION_4.to_le_bytes());
                self.write_fields_v4(&mut out)?;
            }
        }
        self.raw.clone_from(&out);
        self.hash = Sha256::digest(&out).into();
        Ok(out)
    }

    fn write_fields_v3(&self, out: &mut Vec<u8>) -> Result<(), HeaderError> {
        let seed = self
            .kdf_params
            .dict()
            .get_bytes(PARAM_AES_SEED)
            .ok_or(HeaderError::CorruptedField("TransformSeed"))?;
        let rounds = self
            .kdf_params
            .dict()
            .get_u64(PARAM_AES_ROUNDS)
            .ok_or(HeaderError::CorruptedField("TransformRounds"))?;
        let stream_key = self
            .protected_stream_key
            .as_ref()
            .ok_or(HeaderError::CorruptedField("ProtectedStreamKey"))?;
        let stream_start = self
            .stream_start_bytes
            .as_ref()
            .ok_or(HeaderError::CorruptedField("StreamStartBytes"))?;

        push_field(out, FormatVersion::V3, FIELD_CIPHER_ID, self.cipher.uuid())?;
        push_field(
            out,
            FormatVersion::V3,
            FIELD_COMPRESSION_FLAGS,
            &u32::from(self.compressed).to_le_bytes(),
        )?;
        push_field(out, FormatVersion::V3, FIELD_MASTER_SEED, &self.master_seed)?;
        push_field(out, FormatVersion::V3, FIELD_TRANSFORM_SEED, seed)?;
        push_field(
            out,
            FormatVersion::V3,
            FIELD_TRANSFORM_ROUNDS,
            &rounds.to_le_bytes(),
        )?;
        push_field(out, FormatVersion::V3, FIELD_ENCRYPTION_IV, &self.encryption_iv)?;
        push_field(
            out,
            FormatVersion::V3,
            FIELD_PROTECTED_STREAM_KEY,
            stream_key.expose(),
        )?;
        push_field(out, FormatVersion::V3, FIELD_STREAM_START_BYTES, stream_start)?;
        push_field(
            out,
            FormatVersion::V3,
            FIELD_INNER_STREAM_ID,
            &self.inner_stream.raw().to_le_bytes(),
        )?;
        push_field(out, FormatVersion::V3, FIELD_END, &self.end_value)?;
        Ok(())
    }

    fn write_fields_v4(&self, out: &mut Vec<u8>) -> Result<(), HeaderError> {
        push_field(out, FormatVersion::V4, FIELD_CIPHER_ID, self.cipher.uuid())?;
        push_field(
            out,
            FormatVersion::V4,
            FIELD_COMPRESSION_FLAGS,
            &u32::from(self.compressed).to_le_bytes(),
        )?;
        push_field(out, FormatVersion::V4, FIELD_MASTER_SEED, &self.master_seed)?;
        push_field(
            out,
            FormatVersion::V4,
            FIELD_KDF_PARAMETERS,
            &self.kdf_params.serialize(),
        )?;
        push_field(out, FormatVersion::V4, FIELD_ENCRYPTION_IV, &self.encryption_iv)?;
        if !self.public_custom_data.is_empty() {
            push_field(
                out,
                FormatVersion::V4,
                FIELD_PUBLIC_CUSTOM_DATA,
                &self.public_custom_data.serialize(),
            )?;
        }
        push_field(out, FormatVersion::V4, FIELD_END, &self.end_value)?;
        Ok(())
    }

    /// Draw fresh master seed, IV, KDF salt and stream keys.
    ///
    /// Runs before every save — reusing seeds across saves is a
    /// security bug, not an optimization.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Rng`] if the CSPRNG fails.
    pub fn randomize_seeds(&mut self) -> Result<(), CryptoError> {
        debug!("randomizing the seeds");
        self.master_seed = coffre_crypto_core::random_bytes(32)?;
        self.encryption_iv = coffre_crypto_core::random_bytes(self.cipher.iv_size())?;
        self.kdf.randomize(&mut self.kdf_params)?;
        match self.format_version {
            FormatVersion::V3 => {
                self.inner_stream = InnerStreamAlgorithm::Salsa20;
                self.protected_stream_key = Some(SecretBuffer::random(32)?);
                self.stream_start_bytes = Some(coffre_crypto_core::random_bytes(32)?);
            }
            FormatVersion::V4 => {
                self.inner_stream = InnerStreamAlgorithm::ChaCha20;
                self.protected_stream_key = Some(SecretBuffer::random(64)?);
            }
        }
        Ok(())
    }

    /// Instantiate the field-obfuscation keystream from the current
    /// algorithm and key.
    ///
    /// # Errors
    ///
    /// [`HeaderError::CorruptedField`] if a non-null algorithm has no
    /// key yet (v4 before the inner header was read).
    pub fn make_stream_cipher(
        &self,
    ) -> Result<coffre_crypto_core::InnerStreamCipher, HeaderError> {
        match (&self.protected_stream_key, self.inner_stream) {
            (_, InnerStreamAlgorithm::Null) => Ok(InnerStreamAlgorithm::Null.cipher(&[])),
            (Some(key), algorithm) => Ok(algorithm.cipher(key.expose())),
            (None, _) => Err(HeaderError::CorruptedField("ProtectedStreamKey")),
        }
    }

    /// Parse the v4 inner header from the decrypted, decompressed
    /// payload. Binary fields populate `pool` in order of appearance.
    /// Returns the consumed size.
    ///
    /// # Errors
    ///
    /// [`HeaderError`] on truncation, unknown inner field IDs or an
    /// unsupported stream algorithm.
    pub fn read_inner(
        &mut self,
        data: &[u8],
        pool: &mut BinaryPool,
    ) -> Result<usize, HeaderError> {
        debug_assert_eq!(self.format_version, FormatVersion::V4);
        let mut reader = ByteReader::new(data);
        loop {
            let field_id = reader.read_u8().ok_or(HeaderError::ReadingError)?;
            let field_size = reader
                .read_u32_le()
                .map(|s| s as usize)
                .ok_or(HeaderError::ReadingError)?;
            let value = reader
                .read_bytes(field_size)
                .ok_or(HeaderError::ReadingError)?;
            match field_id {
                INNER_FIELD_END => {
                    debug!(size = reader.pos(), "inner header read OK");
                    return Ok(reader.pos());
                }
                INNER_FIELD_STREAM_ID => {
                    let raw: [u8; 4] = value
                        .try_into()
                        .map_err(|_| HeaderError::CorruptedField("Inner/RandomStreamID"))?;
                    let raw = u32::from_le_bytes(raw);
                    self.inner_stream = InnerStreamAlgorithm::from_raw(raw)
                        .ok_or(HeaderError::UnsupportedStreamCipher(raw))?;
                }
                INNER_FIELD_STREAM_KEY => {
                    if value.is_empty() {
                        return Err(HeaderError::CorruptedField("Inner/RandomStreamKey"));
                    }
                    self.protected_stream_key = Some(SecretBuffer::new(value));
                }
                INNER_FIELD_BINARY => {
                    let (&flags, payload) = value
                        .split_first()
                        .ok_or(HeaderError::CorruptedField("Inner/Binary"))?;
                    // payload is plain text; the protected bit is a
                    // recommendation, not a call for decryption
                    pool.push(Binary::new(payload.to_vec(), false, flags & 0x01 != 0));
                }
                _ => return Err(HeaderError::ReadingError),
            }
        }
    }

    /// Serialize the v4 inner header, emitting pool binaries in
    /// ascending ID order (their position *is* their ID). Compressed
    /// pool payloads are inflated first — inner-header binaries are
    /// always stored plain.
    ///
    /// # Errors
    ///
    /// [`HeaderError::BinaryUncompression`] if a pool payload fails to
    /// inflate, [`HeaderError::CorruptedField`] without a stream key.
    pub fn write_inner(
        &self,
        out: &mut Vec<u8>,
        pool: &BinaryPool,
    ) -> Result<(), HeaderError> {
        debug_assert_eq!(self.format_version, FormatVersion::V4);
        let stream_key = self
            .protected_stream_key
            .as_ref()
            .ok_or(HeaderError::CorruptedField("Inner/RandomStreamKey"))?;

        push_inner_field(
            out,
            INNER_FIELD_STREAM_ID,
            &self.inner_stream.raw().to_le_bytes(),
        );
        push_inner_field(out, INNER_FIELD_STREAM_KEY, stream_key.expose());

        for (_, binary) in pool.iter() {
            let data = if binary.compressed {
                let mut inflated = Vec::new();
                GzDecoder::new(binary.data.as_slice())
                    .read_to_end(&mut inflated)
                    .map_err(|e| HeaderError::BinaryUncompression(e.to_string()))?;
                inflated
            } else {
                binary.data.clone()
            };
            let mut field = Vec::with_capacity(data.len().saturating_add(1));
            field.push(binary.flags());
            field.extend_from_slice(&data);
            push_inner_field(out, INNER_FIELD_BINARY, &field);
        }
        push_inner_field(out, INNER_FIELD_END, &[]);
        Ok(())
    }
}

fn push_field(
    out: &mut Vec<u8>,
    version: FormatVersion,
    field_id: u8,
    value: &[u8],
) -> Result<(), HeaderError> {
    out.push(field_id);
    match version {
        FormatVersion::V3 => {
            let len = u16::try_from(value.len())
                .map_err(|_| HeaderError::CorruptedField("field length"))?;
            out.extend_from_slice(&len.to_le_bytes());
        }
        FormatVersion::V4 => {
            let len = u32::try_from(value.len())
                .map_err(|_| HeaderError::CorruptedField("field length"))?;
            out.extend_from_slice(&len.to_le_bytes());
        }
    }
    out.extend_from_slice(value);
    Ok(())
}

fn push_inner_field(out: &mut Vec<u8>, field_id: u8, value: &[u8]) {
    out.push(field_id);
    let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value);
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn randomized(version: FormatVersion, cipher: DataCipher, kdf: Kdf) -> OuterHeader {
        let mut header = OuterHeader::new(version, cipher, kdf, true);
        header.randomize_seeds().expect("randomize should succeed");
        header
    }

    #[test]
    fn v4_write_read_roundtrip() {
        let mut header = randomized(FormatVersion::V4, DataCipher::ChaCha20, Kdf::Argon2d);
        let bytes = header.write().expect("write should succeed");
        let parsed = OuterHeader::read(&bytes).expect("read should succeed");
        assert_eq!(parsed.format_version, FormatVersion::V4);
        assert_eq!(parsed.cipher, DataCipher::ChaCha20);
        assert_eq!(parsed.kdf, Kdf::Argon2d);
        assert!(parsed.compressed);
        assert_eq!(parsed.master_seed, header.master_seed);
        assert_eq!(parsed.encryption_iv, header.encryption_iv);
        assert_eq!(parsed.hash(), header.hash());
        assert_eq!(parsed.size(), bytes.len());
    }

    #[test]
    fn v3_write_read_roundtrip_synthesizes_aes_kdf() {
        let mut header = randomized(FormatVersion::V3, DataCipher::Aes256, Kdf::AesKdf);
        let bytes = header.write().expect("write should succeed");
        let parsed = OuterHeader::read(&bytes).expect("read should succeed");
        assert_eq!(parsed.format_version, FormatVersion::V3);
        assert_eq!(parsed.kdf, Kdf::AesKdf);
        assert_eq!(
            parsed.kdf_params.dict().get_u64(PARAM_AES_ROUNDS),
            header.kdf_params.dict().get_u64(PARAM_AES_ROUNDS)
        );
        assert_eq!(parsed.inner_stream, InnerStreamAlgorithm::Salsa20);
        assert_eq!(parsed.stream_start_bytes, header.stream_start_bytes);
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let mut header = randomized(FormatVersion::V4, DataCipher::Aes256, Kdf::Argon2d);
        let mut bytes = header.write().expect("write should succeed");
        bytes[0] ^= 0xFF;
        assert!(matches!(
            OuterHeader::read(&bytes),
            Err(HeaderError::WrongSignature)
        ));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut header = randomized(FormatVersion::V4, DataCipher::Aes256, Kdf::Argon2d);
        let mut bytes = header.write().expect("write should succeed");
        bytes[11] = 0x07; // major version 7
        assert!(matches!(
            OuterHeader::read(&bytes),
            Err(HeaderError::UnsupportedFileVersion(_))
        ));
    }

    #[test]
    fn minor_version_is_ignored_for_compatibility() {
        let mut header = randomized(FormatVersion::V4, DataCipher::Aes256, Kdf::Argon2d);
        let mut bytes = header.write().expect("write should succeed");
        bytes[8] = 0x63; // minor version 0x63
        assert!(OuterHeader::read(&bytes).is_ok());
    }

    #[test]
    fn unknown_cipher_uuid_is_unsupported() {
        let mut header = randomized(FormatVersion::V4, DataCipher::Aes256, Kdf::Argon2d);
        let mut bytes = header.write().expect("write should succeed");
        // CipherID is the first field: id at 12, length at 13, value at 17
        bytes[17] ^= 0xFF;
        assert!(matches!(
            OuterHeader::read(&bytes),
            Err(HeaderError::UnsupportedDataCipher(_))
        ));
    }

    #[test]
    fn truncated_header_is_a_reading_error() {
        let mut header = randomized(FormatVersion::V4, DataCipher::Aes256, Kdf::Argon2d);
        let bytes = header.write().expect("write should succeed");
        assert!(matches!(
            OuterHeader::read(&bytes[..bytes.len() / 2]),
            Err(HeaderError::ReadingError)
        ));
    }

    #[test]
    fn unknown_field_ids_are_skipped() {
        let mut header = randomized(FormatVersion::V4, DataCipher::Aes256, Kdf::Argon2d);
        let bytes = header.write().expect("write should succeed");
        // splice an unknown field (id 200) in front of the first field
        let mut spliced = bytes[..12].to_vec();
        spliced.push(200);
        spliced.extend_from_slice(&3u32.to_le_bytes());
        spliced.extend_from_slice(b"xyz");
        spliced.extend_from_slice(&bytes[12..]);
        let parsed = OuterHeader::read(&spliced).expect("unknown field must be skipped");
        assert_eq!(parsed.cipher, DataCipher::Aes256);
    }

    #[test]
    fn seed_randomization_changes_material() {
        let mut header = randomized(FormatVersion::V4, DataCipher::ChaCha20, Kdf::Argon2d);
        let seed_before = header.master_seed.clone();
        let iv_before = header.encryption_iv.clone();
        header.randomize_seeds().expect("randomize should succeed");
        assert_ne!(header.master_seed, seed_before);
        assert_ne!(header.encryption_iv, iv_before);
        assert_eq!(header.encryption_iv.len(), 12);
    }

    #[test]
    fn inner_header_roundtrip_with_binaries() {
        let header = randomized(FormatVersion::V4, DataCipher::ChaCha20, Kdf::Argon2d);
        let mut pool = BinaryPool::new();
        pool.push(Binary::new(b"attachment one".to_vec(), false, true));
        pool.push(Binary::new(b"attachment two".to_vec(), false, false));

        let mut bytes = Vec::new();
        header.write_inner(&mut bytes, &pool).expect("write inner");

        let mut reread = randomized(FormatVersion::V4, DataCipher::ChaCha20, Kdf::Argon2d);
        let mut reread_pool = BinaryPool::new();
        let consumed = reread
            .read_inner(&bytes, &mut reread_pool)
            .expect("read inner");
        assert_eq!(consumed, bytes.len());
        assert_eq!(reread.inner_stream, InnerStreamAlgorithm::ChaCha20);
        assert_eq!(reread_pool.len(), 2);
        assert_eq!(reread_pool.get(0).expect("binary 0").data, b"attachment one");
        assert!(reread_pool.get(0).expect("binary 0").protected);
        assert!(!reread_pool.get(1).expect("binary 1").protected);
    }

    #[test]
    fn inner_header_rejects_unknown_field() {
        let mut bytes = Vec::new();
        push_inner_field(&mut bytes, 9, b"?");
        push_inner_field(&mut bytes, INNER_FIELD_END, &[]);
        let mut header = randomized(FormatVersion::V4, DataCipher::ChaCha20, Kdf::Argon2d);
        let mut pool = BinaryPool::new();
        assert!(matches!(
            header.read_inner(&bytes, &mut pool),
            Err(HeaderError::ReadingError)
        ));
    }

    #[test]
    fn iv_size_mismatch_is_corrupted_field() {
        // build a ChaCha20 header, then swap the cipher UUID to AES so
        // the 12-byte IV no longer matches
        let mut header = randomized(FormatVersion::V4, DataCipher::ChaCha20, Kdf::Argon2d);
        let mut bytes = header.write().expect("write should succeed");
        bytes.splice(17..33, aes_uuid());
        let result = OuterHeader::read(&bytes);
        assert!(matches!(
            result,
            Err(HeaderError::CorruptedField("EncryptionIV"))
        ));
    }

    fn aes_uuid() -> Vec<u8> {
        DataCipher::Aes256.uuid().to_vec()
    }
}
