//! The binary pool: content-addressed, deduplicated attachment storage.
//!
//! Entries reference pool slots by integer ID. The pool is rebuilt from
//! the attachments themselves before every save, so IDs are transient
//! bookkeeping, not stable identifiers.

use crate::error::FormatError;
use crate::tree::Tree;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One payload in the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binary {
    pub data: Vec<u8>,
    pub compressed: bool,
    /// Protection hint only — it requests inner-stream encryption of
    /// the v3 XML text and byte 0 of the v4 inner-header field, it does
    /// not make the payload authoritative ciphertext.
    pub protected: bool,
}

impl Binary {
    #[must_use]
    pub const fn new(data: Vec<u8>, compressed: bool, protected: bool) -> Self {
        Self {
            data,
            compressed,
            protected,
        }
    }

    /// v4 inner-header flags byte.
    #[must_use]
    pub fn flags(&self) -> u8 {
        u8::from(self.protected)
    }
}

/// ID-keyed pool. Iteration is always in ascending ID order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BinaryPool {
    entries: BTreeMap<usize, Binary>,
}

impl BinaryPool {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, id: usize) -> Option<&Binary> {
        self.entries.get(&id)
    }

    /// Insert under an explicit ID (v3 Meta binaries carry their ID in
    /// XML). Returns `false` if the ID was already taken.
    pub fn insert(&mut self, id: usize, binary: Binary) -> bool {
        match self.entries.entry(id) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(binary);
                true
            }
        }
    }

    /// Append under the next sequential ID (v4 inner-header order).
    pub fn push(&mut self, binary: Binary) -> usize {
        let id = self.entries.len();
        self.entries.insert(id, binary);
        id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(id, binary)` in ascending ID order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Binary)> {
        self.entries.iter().map(|(id, b)| (*id, b))
    }

    #[must_use]
    pub fn ids(&self) -> BTreeSet<usize> {
        self.entries.keys().copied().collect()
    }
}

/// Rebuild the pool from the tree's attachments, deduplicating by exact
/// byte content, and rewrite every attachment's pool reference.
///
/// History snapshots are walked before the live entry's own attachments
/// so older content lands at lower IDs; new IDs are dense from 0. A
/// payload already present in the old pool keeps its compression and
/// protection flags; a genuinely new payload is marked protected.
pub fn rebuild(old_pool: &BinaryPool, tree: &mut Tree) -> BinaryPool {
    // Content-keyed view of the old pool for flag reuse.
    let mut old_inverse: HashMap<&[u8], &Binary> = HashMap::new();
    for (_, binary) in old_pool.iter() {
        old_inverse.insert(binary.data.as_slice(), binary);
    }

    let mut new_pool = BinaryPool::new();
    // Content already assigned a new ID during this save.
    let mut new_inverse: HashMap<Vec<u8>, usize> = HashMap::new();

    for entry_id in tree.entries_in_document_order() {
        let Some(entry) = tree.entry_mut(entry_id) else {
            continue;
        };
        for historical in &mut entry.history {
            for attachment in &mut historical.attachments {
                assign_binary(attachment, &old_inverse, &mut new_inverse, &mut new_pool);
            }
        }
        for attachment in &mut entry.attachments {
            assign_binary(attachment, &old_inverse, &mut new_inverse, &mut new_pool);
        }
    }
    new_pool
}

fn assign_binary(
    attachment: &mut crate::entry::Attachment,
    old_inverse: &HashMap<&[u8], &Binary>,
    new_inverse: &mut HashMap<Vec<u8>, usize>,
    new_pool: &mut BinaryPool,
) {
    if let Some(&id) = new_inverse.get(attachment.data.as_slice()) {
        // identical bytes already pooled during this save
        attachment.binary_id = id;
        return;
    }
    let binary = old_inverse.get(attachment.data.as_slice()).map_or_else(
        || Binary::new(attachment.data.clone(), attachment.compressed, true),
        |old| Binary::new(old.data.clone(), old.compressed, old.protected),
    );
    let id = new_pool.push(binary);
    new_inverse.insert(attachment.data.clone(), id);
    attachment.binary_id = id;
}

/// Two-sided referential check between entries and the pool.
///
/// Dangling references (entry → missing binary) and orphaned binaries
/// (pool slot no entry uses) are distinct, reportable failures; neither
/// is ever silently repaired.
///
/// # Errors
///
/// Returns [`FormatError::Attachment`] describing the direction of the
/// mismatch.
pub fn check_attachments_integrity(pool: &BinaryPool, tree: &Tree) -> Result<(), FormatError> {
    let known: BTreeSet<usize> = pool.ids();
    let mut used: BTreeSet<usize> = BTreeSet::new();
    for entry_id in tree.entries_in_document_order() {
        if let Some(entry) = tree.entry(entry_id) {
            used.extend(entry.attachment_ids(true));
        }
    }

    if known == used {
        return Ok(());
    }
    if used.iter().any(|id| !known.contains(id)) {
        tracing::warn!("some entries refer to non-existent attachments");
        return Err(FormatError::Attachment(
            "some entries refer to non-existent attachments".into(),
        ));
    }
    tracing::warn!("some binary attachments are not referenced from any entry");
    Err(FormatError::Attachment(
        "some attachments are not referenced from any entry".into(),
    ))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Attachment, Entry};
    use crate::group::Group;
    use chrono::TimeZone;
    use chrono::{DateTime, Utc};

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_000, 0).single().expect("valid")
    }

    fn tree_with_attachments(payloads: &[&[u8]]) -> Tree {
        let mut tree = Tree::new(Group::new("Root", now()));
        let root = tree.root_id();
        let mut entry = Entry::new(now());
        for (i, payload) in payloads.iter().enumerate() {
            entry
                .attachments
                .push(Attachment::new(format!("file{i}"), false, payload.to_vec()));
        }
        tree.add_entry(root, entry);
        tree
    }

    #[test]
    fn rebuild_assigns_dense_ids_from_zero() {
        let mut tree = tree_with_attachments(&[b"aaa", b"bbb", b"ccc"]);
        let pool = rebuild(&BinaryPool::new(), &mut tree);
        assert_eq!(pool.ids(), BTreeSet::from([0, 1, 2]));
        check_attachments_integrity(&pool, &tree).expect("integrity should hold");
    }

    #[test]
    fn rebuild_dedups_identical_content() {
        let mut tree = tree_with_attachments(&[b"same", b"same", b"other"]);
        let pool = rebuild(&BinaryPool::new(), &mut tree);
        assert_eq!(pool.len(), 2);
        let entry_id = tree.entries_in_document_order()[0];
        let entry = tree.entry(entry_id).expect("entry");
        assert_eq!(
            entry.attachments[0].binary_id(),
            entry.attachments[1].binary_id()
        );
        assert_ne!(
            entry.attachments[0].binary_id(),
            entry.attachments[2].binary_id()
        );
    }

    #[test]
    fn rebuild_reuses_old_pool_flags() {
        let mut tree = tree_with_attachments(&[b"payload"]);
        let mut old_pool = BinaryPool::new();
        old_pool.push(Binary::new(b"payload".to_vec(), true, false));
        let pool = rebuild(&old_pool, &mut tree);
        let binary = pool.get(0).expect("pooled binary");
        assert!(binary.compressed);
        assert!(!binary.protected);
    }

    #[test]
    fn rebuild_marks_new_payloads_protected() {
        let mut tree = tree_with_attachments(&[b"brand new"]);
        let pool = rebuild(&BinaryPool::new(), &mut tree);
        assert!(pool.get(0).expect("pooled binary").protected);
    }

    #[test]
    fn rebuild_walks_history_before_live_attachments() {
        let mut tree = Tree::new(Group::new("Root", now()));
        let root = tree.root_id();
        let mut entry = Entry::new(now());
        entry
            .attachments
            .push(Attachment::new("old.txt".into(), false, b"old".to_vec()));
        entry.backup_state(10);
        entry.attachments.clear();
        entry
            .attachments
            .push(Attachment::new("new.txt".into(), false, b"new".to_vec()));
        tree.add_entry(root, entry);

        let pool = rebuild(&BinaryPool::new(), &mut tree);
        // the historical payload got the lower ID
        assert_eq!(pool.get(0).expect("binary 0").data, b"old");
        assert_eq!(pool.get(1).expect("binary 1").data, b"new");
    }

    #[test]
    fn integrity_detects_dangling_reference() {
        let mut tree = tree_with_attachments(&[b"x"]);
        let entry_id = tree.entries_in_document_order()[0];
        tree.entry_mut(entry_id).expect("entry").attachments[0].binary_id = 99;
        let err = check_attachments_integrity(&BinaryPool::new(), &tree)
            .expect_err("dangling ref must fail");
        assert!(err.to_string().contains("non-existent"));
    }

    #[test]
    fn integrity_detects_orphaned_binary() {
        let tree = Tree::new(Group::new("Root", now()));
        let mut pool = BinaryPool::new();
        pool.push(Binary::new(b"orphan".to_vec(), false, false));
        let err =
            check_attachments_integrity(&pool, &tree).expect_err("orphan must fail");
        assert!(err.to_string().contains("not referenced"));
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let mut pool = BinaryPool::new();
        assert!(pool.insert(0, Binary::new(vec![1], false, false)));
        assert!(!pool.insert(0, Binary::new(vec![2], false, false)));
    }
}
