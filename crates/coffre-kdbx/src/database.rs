//! The top-level orchestrator: `Database::load` and `Database::save`.
//!
//! Load: header → key derivation → block stream + decryption →
//! decompression → (v4) inner header → XML parse → deleted-status
//! propagation → attachment integrity. Save runs the reverse pipeline
//! after reseeding and rebuilding the binary pool.
//!
//! A `Database` is a plain owned value — no process-wide current
//! database, no notification center. The caller holds it, passes a
//! [`Progress`] in, and observes that object from wherever it likes.

use crate::binaries::{self, BinaryPool};
use crate::blocks;
use crate::entry::Attachment;
use crate::error::{BlockStreamError, DatabaseError, FormatError, HeaderError, ParsingError};
use crate::group::{Group, GROUP_TRASH_ICON};
use crate::header::{FormatVersion, OuterHeader};
use crate::meta::Meta;
use crate::tree::{DeletedObject, EntryId, GroupId, Tree};
use crate::xml;
use chrono::{DateTime, TimeZone, Utc};
use coffre_crypto_core::{
    CryptoError, DataCipher, Kdf, Progress, SecretBuffer, SecretBytes,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha512};
use std::io::{Read, Write};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroize;

/// Progress unit layout shared by load and save (out of 100).
mod steps {
    pub const ALL: u64 = 100;
    pub const KEY_DERIVATION: u64 = 60;

    // loading
    pub const DECRYPTION: u64 = 20;
    pub const READING_BLOCKS: u64 = 5;
    pub const GZIP_UNPACK: u64 = 5;
    pub const PARSING: u64 = 10;

    // writing
    pub const PACKING: u64 = 10;
    pub const GZIP_PACK: u64 = 5;
    pub const ENCRYPTION: u64 = 20;
    pub const WRITING_BLOCKS: u64 = 5;
}

/// An open KDBX database.
pub struct Database {
    header: OuterHeader,
    pub meta: Meta,
    tree: Tree,
    binaries: BinaryPool,
    deleted_objects: Vec<DeletedObject>,
    composite_key: Option<SecretBytes<32>>,
}

impl Database {
    /// Create a fresh, empty database around a root group named after
    /// the database itself. Seeds stay empty until the first save.
    #[must_use]
    pub fn new(
        format_version: FormatVersion,
        cipher: DataCipher,
        kdf: Kdf,
        compressed: bool,
        database_name: &str,
    ) -> Self {
        let now = truncated_now();
        let mut meta = Meta::default();
        meta.database_name = database_name.to_owned();
        meta.set_all_timestamps(now);
        let mut tree = Tree::new(Group::new(database_name, now));
        tree.set_all_timestamps(now);
        Self {
            header: OuterHeader::new(format_version, cipher, kdf, compressed),
            meta,
            tree,
            binaries: BinaryPool::new(),
            deleted_objects: Vec::new(),
            composite_key: None,
        }
    }

    /// Checks whether `data` looks like a KeePass 2.x database at all.
    #[must_use]
    pub fn signature_matches(data: &[u8]) -> bool {
        OuterHeader::signature_matches(data)
    }

    #[must_use]
    pub const fn header(&self) -> &OuterHeader {
        &self.header
    }

    /// Mutable header access, for changing encryption settings (cipher
    /// parameters, KDF work factors) before a save.
    pub fn header_mut(&mut self) -> &mut OuterHeader {
        &mut self.header
    }

    #[must_use]
    pub const fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    #[must_use]
    pub const fn binaries(&self) -> &BinaryPool {
        &self.binaries
    }

    #[must_use]
    pub fn deleted_objects(&self) -> &[DeletedObject] {
        &self.deleted_objects
    }

    /// Replace the composite key used for subsequent saves.
    pub fn change_composite_key(&mut self, key: SecretBytes<32>) {
        self.composite_key = Some(key);
    }

    /// Decrypt and parse a database.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::InvalidKey`] when the key is wrong (v3 marker,
    /// v4 header HMAC), [`DatabaseError::Load`] for every structural or
    /// cryptographic failure, [`DatabaseError::Cancelled`] when the
    /// user interrupts — cancellation is never rewritten into a reason
    /// string.
    pub fn load(
        data: &[u8],
        composite_key: SecretBytes<32>,
        progress: &Progress,
    ) -> Result<Self, DatabaseError> {
        info!("loading database");
        progress.set_total(steps::ALL);

        let mut header = OuterHeader::read(data).map_err(header_to_load)?;
        debug!(version = ?header.format_version, "header read OK");

        let (cipher_key, hmac_key) =
            derive_master_keys(&header, &composite_key, progress).map_err(crypto_to_load)?;
        debug!("key derivation OK");

        let body = data
            .get(header.size()..)
            .ok_or_else(|| format_to_load(&FormatError::PrematureDataEnd))?;

        let mut decrypted = match header.format_version {
            FormatVersion::V3 => decrypt_body_v3(&header, body, &cipher_key, progress)?,
            FormatVersion::V4 => decrypt_body_v4(&header, body, &cipher_key, &hmac_key, progress)?,
        };
        debug!("block decryption OK");

        if header.compressed {
            debug!("inflating gzip data");
            let inflated = gunzip(&decrypted).map_err(|e| format_to_load(&e))?;
            decrypted.zeroize();
            decrypted = inflated;
        }
        progress.complete_units(steps::GZIP_UNPACK);

        let mut pool = BinaryPool::new();
        let xml_start = match header.format_version {
            FormatVersion::V3 => 0,
            FormatVersion::V4 => {
                let size = header
                    .read_inner(&decrypted, &mut pool)
                    .map_err(header_to_load)?;
                debug!("inner header read OK");
                size
            }
        };

        let mut stream_cipher = header.make_stream_cipher().map_err(header_to_load)?;
        let xml_bytes = decrypted
            .get(xml_start..)
            .ok_or_else(|| format_to_load(&FormatError::PrematureDataEnd))?;
        let (meta, tree, deleted_objects) = xml::parse_document(
            xml_bytes,
            header.format_version,
            &mut stream_cipher,
            &mut pool,
        )
        .map_err(parsing_to_load)?;
        decrypted.zeroize();

        // In v3, Meta carries a ground-truth copy of the header hash.
        if header.format_version == FormatVersion::V3 {
            if let Some(stored) = &meta.header_hash {
                if stored.as_slice() != header.hash() {
                    warn!("meta header hash mismatch");
                    return Err(header_to_load(HeaderError::HashMismatch));
                }
            }
        }
        progress.complete_units(steps::PARSING);

        let mut database = Self {
            header,
            meta,
            tree,
            binaries: pool,
            deleted_objects,
            composite_key: Some(composite_key),
        };
        database.propagate_deleted_status();

        // no missing and no redundant binaries
        binaries::check_attachments_integrity(&database.binaries, &database.tree)
            .map_err(|e| format_to_load(&e))?;

        info!("database loaded OK");
        Ok(database)
    }

    /// Re-encrypt the database into its on-disk byte layout.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::Save`] on failure, [`DatabaseError::Cancelled`]
    /// when interrupted.
    pub fn save(&mut self, progress: &Progress) -> Result<Vec<u8>, DatabaseError> {
        info!("saving database");
        progress.set_total(steps::ALL);
        let composite_key = self.composite_key.clone().ok_or_else(|| DatabaseError::Save {
            reason: "no composite key set".into(),
        })?;

        self.header.randomize_seeds().map_err(crypto_to_save)?;
        debug!("seeds randomized OK");
        let (cipher_key, hmac_key) =
            derive_master_keys(&self.header, &composite_key, progress).map_err(crypto_to_save)?;
        debug!("key derivation OK");

        // rebuild the binary pool, in case attachments were added/removed
        self.binaries = binaries::rebuild(&self.binaries, &mut self.tree);
        debug!("binaries updated OK");
        progress.complete_units(steps::PACKING);

        let header_bytes = self.header.write().map_err(header_to_save)?;
        if self.header.format_version == FormatVersion::V3 {
            self.meta.header_hash = Some(self.header.hash().to_vec());
        }

        let mut stream_cipher = self.header.make_stream_cipher().map_err(header_to_save)?;
        let xml_bytes = xml::write_document(
            &self.meta,
            &self.tree,
            &self.deleted_objects,
            self.header.format_version,
            &mut stream_cipher,
            &self.binaries,
        )
        .map_err(parsing_to_save)?;
        debug!("XML generation OK");

        let mut out = header_bytes;
        match self.header.format_version {
            FormatVersion::V3 => {
                let payload = if self.header.compressed {
                    gzip(&xml_bytes).map_err(|e| format_to_save(&e))?
                } else {
                    xml_bytes
                };
                progress.complete_units(steps::GZIP_PACK);

                let stream_start = self
                    .header
                    .stream_start_bytes
                    .clone()
                    .ok_or_else(|| header_to_save(HeaderError::CorruptedField("StreamStartBytes")))?;
                let body = blocks::write_hashed_blocks(
                    &payload,
                    &stream_start,
                    &progress.child(steps::WRITING_BLOCKS),
                )
                .map_err(blocks_to_save)?;
                let encrypted = self
                    .header
                    .cipher
                    .encrypt(
                        &body,
                        &cipher_key,
                        &self.header.encryption_iv,
                        &progress.child(steps::ENCRYPTION),
                    )
                    .map_err(crypto_to_save)?;
                out.extend_from_slice(&encrypted);
            }
            FormatVersion::V4 => {
                out.extend_from_slice(self.header.hash());
                out.extend_from_slice(&blocks::header_hmac(self.header.raw_bytes(), &hmac_key));

                let mut content = Vec::new();
                self.header
                    .write_inner(&mut content, &self.binaries)
                    .map_err(header_to_save)?;
                content.extend_from_slice(&xml_bytes);

                let payload = if self.header.compressed {
                    let deflated = gzip(&content).map_err(|e| format_to_save(&e))?;
                    content.zeroize();
                    deflated
                } else {
                    content
                };
                progress.complete_units(steps::GZIP_PACK);

                let encrypted = self
                    .header
                    .cipher
                    .encrypt(
                        &payload,
                        &cipher_key,
                        &self.header.encryption_iv,
                        &progress.child(steps::ENCRYPTION),
                    )
                    .map_err(crypto_to_save)?;
                let body = blocks::write_hmac_blocks(
                    &encrypted,
                    &hmac_key,
                    &progress.child(steps::WRITING_BLOCKS),
                )
                .map_err(blocks_to_save)?;
                out.extend_from_slice(&body);
            }
        }
        debug!("content encryption OK");
        progress.finish();
        Ok(out)
    }

    /// The recycle-bin group, created on demand when `create_if_missing`
    /// and enabled in Meta. `None` when the recycle bin is disabled.
    pub fn backup_group(&mut self, create_if_missing: bool) -> Option<GroupId> {
        if !self.meta.recycle_bin_enabled {
            return None;
        }
        if !self.meta.recycle_bin_uuid.is_nil() {
            if let Some(id) = self.tree.find_group_by_uuid(self.meta.recycle_bin_uuid) {
                return Some(id);
            }
        }
        if create_if_missing {
            let now = truncated_now();
            let mut backup = Group::new("Recycle Bin", now);
            backup.icon_id = GROUP_TRASH_ICON;
            backup.is_deleted = true;
            backup.enable_searching = Some(false);
            backup.uuid = Uuid::new_v4();
            self.meta.recycle_bin_uuid = backup.uuid;
            self.meta.recycle_bin_changed = now;
            let root = self.tree.root_id();
            let id = self.tree.add_group(root, backup);
            debug!("recycle bin group created");
            return Some(id);
        }
        None
    }

    /// Delete a group with its whole branch: move to the recycle bin
    /// when possible, otherwise purge permanently and record every
    /// removed UUID in the deleted-objects ledger.
    pub fn delete_group(&mut self, id: GroupId) {
        let Some(group) = self.tree.group(id) else {
            return;
        };
        if group.parent().is_none() {
            warn!("cannot delete group: no parent group");
            return;
        }
        let already_deleted = group.is_deleted;
        let (sub_groups, sub_entries) = self.tree.collect_subtree(id);

        let move_only = !already_deleted && self.meta.recycle_bin_enabled;
        if move_only {
            if let Some(backup_id) = self.backup_group(true) {
                debug!("moving group to recycle bin");
                let now = truncated_now();
                self.tree.move_group(id, backup_id);
                if let Some(group) = self.tree.group_mut(id) {
                    group.accessed(now);
                    group.times.location_changed = now;
                    group.is_deleted = true;
                }
                // subtree items keep their timestamps, only the flag moves
                for sub in sub_groups {
                    if let Some(g) = self.tree.group_mut(sub) {
                        g.is_deleted = true;
                    }
                }
                for sub in sub_entries {
                    if let Some(e) = self.tree.entry_mut(sub) {
                        e.is_deleted = true;
                    }
                }
                return;
            }
        }

        debug!("removing the group permanently");
        if let Some(group) = self.tree.group(id) {
            self.add_deleted_object(group.uuid);
        }
        for sub in &sub_groups {
            if let Some(g) = self.tree.group(*sub) {
                self.add_deleted_object(g.uuid);
            }
        }
        for sub in &sub_entries {
            if let Some(e) = self.tree.entry(*sub) {
                self.add_deleted_object(e.uuid);
            }
        }
        self.tree.remove_group(id);
    }

    /// Delete an entry: recycle-bin move, or permanent purge with a
    /// deleted-objects record when the entry is already recycled (or
    /// the recycle bin is disabled).
    pub fn delete_entry(&mut self, id: EntryId) {
        let Some(entry) = self.tree.entry(id) else {
            return;
        };
        if entry.parent().is_none() {
            warn!("cannot delete entry: no parent group");
            return;
        }
        if entry.is_deleted {
            // already in the recycle bin: purge for good
            let uuid = entry.uuid;
            self.add_deleted_object(uuid);
            self.tree.remove_entry(id);
            return;
        }
        if self.meta.recycle_bin_enabled {
            if let Some(backup_id) = self.backup_group(true) {
                let now = truncated_now();
                self.tree.move_entry(id, backup_id);
                if let Some(entry) = self.tree.entry_mut(id) {
                    entry.accessed(now);
                    entry.times.location_changed = now;
                    entry.is_deleted = true;
                }
                return;
            }
        }
        let uuid = entry.uuid;
        self.add_deleted_object(uuid);
        self.tree.remove_entry(id);
    }

    /// Append to the deleted-objects ledger (never removed within a
    /// session).
    pub fn add_deleted_object(&mut self, uuid: Uuid) {
        self.deleted_objects.push(DeletedObject {
            uuid,
            deletion_time: truncated_now(),
        });
    }

    /// Build an attachment suitable for this database's entries,
    /// gzip-compressing the payload when the database is compressed.
    #[must_use]
    pub fn make_attachment(&self, name: &str, data: &[u8]) -> Attachment {
        if self.header.compressed {
            if let Ok(deflated) = gzip(data) {
                return Attachment::new(name.to_owned(), true, deflated);
            }
            warn!("failed to compress attachment data, storing plain");
        }
        Attachment::new(name.to_owned(), false, data.to_vec())
    }

    /// Snapshot an entry into its history and trim per the Meta
    /// retention policy.
    pub fn backup_entry_state(&mut self, id: EntryId) {
        let limit = self.meta.history_max_items;
        if let Some(entry) = self.tree.entry_mut(id) {
            entry.backup_state(limit);
        }
    }

    /// Flag everything under the recycle bin as deleted.
    fn propagate_deleted_status(&mut self) {
        let Some(backup_id) = self.backup_group(false) else {
            return;
        };
        let (groups, entries) = self.tree.collect_subtree(backup_id);
        for id in groups {
            if let Some(group) = self.tree.group_mut(id) {
                group.is_deleted = true;
            }
        }
        for id in entries {
            if let Some(entry) = self.tree.entry_mut(id) {
                entry.is_deleted = true;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Key schedule
// ---------------------------------------------------------------------------

/// `cipherKey = resize(masterSeed ‖ KDF(composite))`,
/// `hmacKeyBase = SHA-512(masterSeed ‖ KDF(composite) ‖ 0x01)`.
fn derive_master_keys(
    header: &OuterHeader,
    composite_key: &SecretBytes<32>,
    progress: &Progress,
) -> Result<(SecretBytes<32>, SecretBytes<64>), CryptoError> {
    debug!("start key derivation");
    let kdf_progress = progress.child(steps::KEY_DERIVATION);
    let transformed = header
        .kdf
        .transform(composite_key, &header.kdf_params, &kdf_progress)?;

    let mut joined =
        Vec::with_capacity(header.master_seed.len().saturating_add(transformed.expose().len()));
    joined.extend_from_slice(&header.master_seed);
    joined.extend_from_slice(transformed.expose());
    let joined = SecretBuffer::from_vec(joined);

    let cipher_key = header.cipher.resize_key(joined.expose());

    let mut hmac_input =
        Vec::with_capacity(joined.len().saturating_add(1));
    hmac_input.extend_from_slice(joined.expose());
    hmac_input.push(0x01);
    let hmac_key = SecretBytes::new(Sha512::digest(&hmac_input).into());
    hmac_input.zeroize();

    Ok((cipher_key, hmac_key))
}

// ---------------------------------------------------------------------------
// Body decryption
// ---------------------------------------------------------------------------

fn decrypt_body_v3(
    header: &OuterHeader,
    body: &[u8],
    cipher_key: &SecretBytes<32>,
    progress: &Progress,
) -> Result<Vec<u8>, DatabaseError> {
    debug!("decrypting v3 blocks");
    let plaintext = header
        .cipher
        .decrypt(
            body,
            cipher_key,
            &header.encryption_iv,
            &progress.child(steps::DECRYPTION),
        )
        .map_err(|e| match e {
            // a wrong key garbles the CBC padding long before the
            // start marker would be reachable
            CryptoError::Cipher(_) => DatabaseError::InvalidKey,
            other => crypto_to_load(other),
        })?;
    let stream_start = header
        .stream_start_bytes
        .as_deref()
        .ok_or_else(|| header_to_load(HeaderError::CorruptedField("StreamStartBytes")))?;
    blocks::read_hashed_blocks(
        &plaintext,
        stream_start,
        &progress.child(steps::READING_BLOCKS),
    )
    .map_err(blocks_to_load)
}

fn decrypt_body_v4(
    header: &OuterHeader,
    body: &[u8],
    cipher_key: &SecretBytes<32>,
    hmac_key: &SecretBytes<64>,
    progress: &Progress,
) -> Result<Vec<u8>, DatabaseError> {
    debug!("decrypting v4 blocks");
    let stored_hash = body
        .get(..32)
        .ok_or_else(|| format_to_load(&FormatError::PrematureDataEnd))?;
    if stored_hash != header.hash() {
        // the header hash is independent of the master key: a mismatch
        // can only mean corruption
        warn!("header hash mismatch, database corrupted?");
        return Err(header_to_load(HeaderError::HashMismatch));
    }
    let stored_hmac = body
        .get(32..64)
        .ok_or_else(|| format_to_load(&FormatError::PrematureDataEnd))?;
    let computed_hmac = blocks::header_hmac(header.raw_bytes(), hmac_key);
    if stored_hmac != computed_hmac {
        // the HMAC does depend on the master key; with the hash already
        // verified this means a wrong key, not corruption
        warn!("header HMAC mismatch, invalid master key?");
        return Err(DatabaseError::InvalidKey);
    }

    let block_data = body
        .get(64..)
        .ok_or_else(|| format_to_load(&FormatError::PrematureDataEnd))?;
    let encrypted = blocks::read_hmac_blocks(
        block_data,
        hmac_key,
        &progress.child(steps::READING_BLOCKS),
    )
    .map_err(blocks_to_load)?;

    header
        .cipher
        .decrypt(
            &encrypted,
            cipher_key,
            &header.encryption_iv,
            &progress.child(steps::DECRYPTION),
        )
        .map_err(crypto_to_load)
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

fn gunzip(data: &[u8]) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| FormatError::Compression(e.to_string()))?;
    Ok(out)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, FormatError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| FormatError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| FormatError::Compression(e.to_string()))
}

// ---------------------------------------------------------------------------
// Error wrapping
//
// Each helper adds context for the kinds it understands; InvalidKey and
// ProgressInterruption cross the boundary unchanged.
// ---------------------------------------------------------------------------

fn header_to_load(e: HeaderError) -> DatabaseError {
    DatabaseError::Load {
        reason: e.to_string(),
    }
}

fn header_to_save(e: HeaderError) -> DatabaseError {
    DatabaseError::Save {
        reason: e.to_string(),
    }
}

fn format_to_load(e: &FormatError) -> DatabaseError {
    DatabaseError::Load {
        reason: e.to_string(),
    }
}

fn format_to_save(e: &FormatError) -> DatabaseError {
    DatabaseError::Save {
        reason: e.to_string(),
    }
}

fn parsing_to_load(e: ParsingError) -> DatabaseError {
    DatabaseError::Load {
        reason: FormatError::Parsing(e.to_string()).to_string(),
    }
}

fn parsing_to_save(e: ParsingError) -> DatabaseError {
    DatabaseError::Save {
        reason: e.to_string(),
    }
}

fn crypto_to_load(e: CryptoError) -> DatabaseError {
    match e {
        CryptoError::Interrupted(i) => DatabaseError::Cancelled(i),
        other => DatabaseError::Load {
            reason: other.to_string(),
        },
    }
}

fn crypto_to_save(e: CryptoError) -> DatabaseError {
    match e {
        CryptoError::Interrupted(i) => DatabaseError::Cancelled(i),
        other => DatabaseError::Save {
            reason: other.to_string(),
        },
    }
}

fn blocks_to_load(e: BlockStreamError) -> DatabaseError {
    match e {
        BlockStreamError::InvalidKey => DatabaseError::InvalidKey,
        BlockStreamError::Interrupted(i) => DatabaseError::Cancelled(i),
        BlockStreamError::Format(f) => format_to_load(&f),
    }
}

fn blocks_to_save(e: BlockStreamError) -> DatabaseError {
    match e {
        BlockStreamError::Interrupted(i) => DatabaseError::Cancelled(i),
        BlockStreamError::InvalidKey => DatabaseError::Save {
            reason: "invalid key during save".into(),
        },
        BlockStreamError::Format(f) => format_to_save(&f),
    }
}

fn truncated_now() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp(), 0)
        .single()
        .unwrap_or_else(Utc::now)
}
