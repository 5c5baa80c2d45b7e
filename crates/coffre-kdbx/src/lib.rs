//! `coffre-kdbx` — KDBX 3/4 database codec for COFFRE.
//!
//! Decrypts, integrity-checks, parses and re-serializes KeePass 2.x
//! database files: outer/inner headers, hash-chained (v3) and
//! HMAC-chained (v4) block streams, the inner XML tree with protected
//! fields, and the deduplicated binary attachment pool. The only
//! boundary the caller needs is [`Database::load`] / [`Database::save`]
//! plus a [`coffre_crypto_core::Progress`] for cancellation.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;

mod io;

pub mod binaries;
pub mod blocks;
pub mod header;
pub mod keys;
pub mod vardict {
    //! Re-export of the variant dictionary used by v4 headers.
    pub use coffre_crypto_core::vardict::{Value, VariantDict};
}

pub mod entry;
pub mod group;
pub mod meta;
pub mod tree;
mod xml;

pub mod database;

pub use binaries::{check_attachments_integrity, Binary, BinaryPool};
pub use database::Database;
pub use entry::{
    Attachment, AutoType, AutoTypeAssociation, Entry, EntryField, Times, FIELD_NOTES,
    FIELD_PASSWORD, FIELD_TITLE, FIELD_URL, FIELD_USERNAME,
};
pub use error::{BlockStreamError, DatabaseError, FormatError, HeaderError, ParsingError};
pub use group::Group;
pub use header::{FormatVersion, OuterHeader};
pub use keys::KeyHelper;
pub use meta::{CustomData, CustomIcon, MemoryProtection, Meta};
pub use tree::{DeletedObject, EntryId, GroupId, NodeId, Tree};

pub use coffre_crypto_core::{
    DataCipher, InnerStreamAlgorithm, Kdf, KdfParams, Progress, ProgressInterruption,
    SecretBuffer, SecretBytes,
};
