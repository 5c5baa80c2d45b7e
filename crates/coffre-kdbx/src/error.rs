//! Error taxonomy for the KDBX codec.
//!
//! Four disjoint kinds, kept separate so callers can react precisely:
//! structural corruption ([`FormatError`], [`HeaderError`],
//! [`ParsingError`]), a wrong master key ([`DatabaseError::InvalidKey`]),
//! crypto failures (`coffre_crypto_core::CryptoError`), and user
//! cancellation ([`DatabaseError::Cancelled`]). Each layer adds context
//! only to the kinds it understands; cancellation and wrong-key verdicts
//! cross the orchestrator boundary unchanged.

use coffre_crypto_core::ProgressInterruption;
use thiserror::Error;

/// Errors from the outer/inner header codec.
#[derive(Debug, Error)]
pub enum HeaderError {
    /// Header ends prematurely or a field cannot be read.
    #[error("header reading error, database file corrupted?")]
    ReadingError,

    /// The two fixed magic signatures do not match.
    #[error("wrong file signature, not a KeePass database?")]
    WrongSignature,

    /// The version field selects neither v3 nor v4.
    #[error("unsupported database format version: {0:#010x}")]
    UnsupportedFileVersion(u32),

    /// The CipherID field names a cipher we do not implement.
    #[error("unsupported data cipher: {0}")]
    UnsupportedDataCipher(String),

    /// The inner stream ID names a stream cipher we do not implement.
    #[error("unsupported inner stream cipher (ID {0})")]
    UnsupportedStreamCipher(u32),

    /// The KDF parameter block names a KDF we do not implement.
    #[error("unsupported key derivation function: {0}")]
    UnsupportedKdf(String),

    /// Compression flag is neither "none" nor "gzip".
    #[error("unknown compression algorithm")]
    UnknownCompressionAlgorithm,

    /// A pool binary could not be uncompressed for the inner header.
    #[error("failed to uncompress attachment data: {0}")]
    BinaryUncompression(String),

    /// The header's hash does not match its after-header copy, or the
    /// v3 Meta copy of the hash.
    #[error("header hash mismatch, database file corrupt?")]
    HashMismatch,

    /// A header field is present but malformed, missing, or misplaced.
    #[error("header field {0} is corrupted")]
    CorruptedField(&'static str),
}

/// Structural errors in the decrypted/block-level layout.
#[derive(Debug, Error)]
pub enum FormatError {
    /// File or stream ends mid-structure.
    #[error("unexpected end of file, corrupted file?")]
    PrematureDataEnd,

    /// A block declares a negative size.
    #[error("corrupted database file (negative block #{0} size)")]
    NegativeBlockSize(u64),

    /// A v3 block's index does not match the running counter.
    #[error("unexpected block ID")]
    BlockIdMismatch,

    /// A v3 block's SHA-256 does not match its content.
    #[error("block #{0} hash mismatch")]
    BlockHashMismatch(u64),

    /// A v4 block's HMAC does not match its content.
    #[error("block #{0} HMAC mismatch")]
    BlockHmacMismatch(u64),

    /// The decrypted XML cannot be interpreted.
    #[error("cannot parse database: {0}")]
    Parsing(String),

    /// Orphaned pool binary or dangling attachment reference.
    #[error("cannot process one of the attachments: {0}")]
    Attachment(String),

    /// Gzip failure while (de)compressing the payload.
    #[error("gzip error: {0}")]
    Compression(String),
}

/// Errors raised while walking the inner XML document.
#[derive(Debug, Error)]
pub enum ParsingError {
    /// The raw XML is not well-formed.
    #[error("XML error: {0}")]
    Xml(String),

    /// The document root is not `KeePassFile`.
    #[error("not a KeePass XML document")]
    NotKeePassDocument,

    /// A known container holds a tag it must not contain.
    #[error("unexpected tag '{actual}' (expected {expected})")]
    UnexpectedTag {
        actual: String,
        expected: &'static str,
    },

    /// A tag's content cannot be interpreted as its required type.
    #[error("malformed value in {tag}")]
    MalformedValue { tag: &'static str },
}

/// Errors crossing the block-stream boundary.
///
/// Separate from [`FormatError`] because the stream layer is the one
/// place where "wrong key" and "corrupt data" are distinguished.
#[derive(Debug, Error)]
pub enum BlockStreamError {
    /// The decrypted start marker or the header HMAC did not match:
    /// the master key is wrong, not the file corrupt.
    #[error("invalid master key")]
    InvalidKey,

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Interrupted(#[from] ProgressInterruption),
}

/// Top-level outcome of `Database::load` / `Database::save`.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Cannot open the database; `reason` carries the layer's message.
    #[error("cannot open database: {reason}")]
    Load { reason: String },

    /// The provided master key is invalid (wrong password/key file).
    #[error("invalid password or key file")]
    InvalidKey,

    /// Cannot save the database; `reason` carries the layer's message.
    #[error("cannot save database: {reason}")]
    Save { reason: String },

    /// The user cancelled the operation. Not a failure; never logged
    /// as an error.
    #[error(transparent)]
    Cancelled(#[from] ProgressInterruption),
}
