#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! History retention, soft deletion and the deleted-objects ledger.

use coffre_crypto_core::kdf::{
    PARAM_ARGON2_ITERATIONS, PARAM_ARGON2_MEMORY, PARAM_ARGON2_PARALLELISM,
};
use coffre_crypto_core::Value;
use coffre_kdbx::{
    Database, DataCipher, Entry, FormatVersion, Kdf, KeyHelper, Progress, FIELD_TITLE,
};

fn composite_key() -> coffre_kdbx::SecretBytes<32> {
    let helper = KeyHelper::Kdbx2;
    helper.composite_key(&helper.password_bytes("history"), &[], None)
}

fn new_database() -> Database {
    let mut db = Database::new(
        FormatVersion::V4,
        DataCipher::ChaCha20,
        Kdf::Argon2d,
        true,
        "Timeline",
    );
    let params = &mut db.header_mut().kdf_params;
    params.set(PARAM_ARGON2_ITERATIONS, Value::UInt64(1));
    params.set(PARAM_ARGON2_MEMORY, Value::UInt64(1024 * 1024));
    params.set(PARAM_ARGON2_PARALLELISM, Value::UInt32(1));
    db
}

fn at(secs: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::TimeZone::timestamp_opt(&chrono::Utc, secs, 0)
        .single()
        .expect("valid time")
}

#[test]
fn edits_past_the_limit_prune_oldest_snapshots() {
    let mut db = new_database();
    db.meta.history_max_items = 3;
    let root = db.tree().root_id();
    let entry_id = db.tree_mut().add_entry(root, Entry::new(at(0)));

    for i in 0..7_i64 {
        {
            let entry = db.tree_mut().entry_mut(entry_id).expect("entry");
            entry.set_field(FIELD_TITLE, &format!("revision {i}"), false);
            entry.times.last_modification = at(1_000_000 + i * 60);
        }
        db.backup_entry_state(entry_id);
    }

    let entry = db.tree().entry(entry_id).expect("entry");
    assert_eq!(entry.history.len(), 3, "retention limit must hold");
    // the live entry survives untouched
    assert_eq!(entry.title(), "revision 6");
    // the survivors are the most recent snapshots, newest first
    let titles: Vec<&str> = entry.history.iter().map(Entry::title).collect();
    assert_eq!(titles, vec!["revision 6", "revision 5", "revision 4"]);
}

#[test]
fn history_snapshots_carry_no_nested_history() {
    let mut db = new_database();
    let root = db.tree().root_id();
    let entry_id = db.tree_mut().add_entry(root, Entry::new(at(0)));
    db.backup_entry_state(entry_id);
    db.backup_entry_state(entry_id);

    let entry = db.tree().entry(entry_id).expect("entry");
    assert_eq!(entry.history.len(), 2);
    for snapshot in &entry.history {
        assert!(snapshot.history.is_empty(), "history must stay one level deep");
    }
}

#[test]
fn history_survives_the_roundtrip() {
    let mut db = new_database();
    let root = db.tree().root_id();
    let entry_id = db.tree_mut().add_entry(root, Entry::new(at(0)));
    {
        let entry = db.tree_mut().entry_mut(entry_id).expect("entry");
        entry.set_field(FIELD_TITLE, "before", false);
        entry.times.last_modification = at(100);
    }
    db.backup_entry_state(entry_id);
    {
        let entry = db.tree_mut().entry_mut(entry_id).expect("entry");
        entry.set_field(FIELD_TITLE, "after", false);
        entry.times.last_modification = at(200);
    }

    db.change_composite_key(composite_key());
    let bytes = db.save(&Progress::new(100)).expect("save should succeed");
    let reloaded =
        Database::load(&bytes, composite_key(), &Progress::new(100)).expect("load should succeed");

    let entry_id = reloaded.tree().entries_in_document_order()[0];
    let entry = reloaded.tree().entry(entry_id).expect("entry");
    assert_eq!(entry.title(), "after");
    assert_eq!(entry.history.len(), 1);
    assert_eq!(entry.history[0].title(), "before");
    assert_eq!(entry.history[0].uuid, entry.uuid);
}

#[test]
fn deleting_an_entry_moves_it_to_the_recycle_bin() {
    let mut db = new_database();
    let root = db.tree().root_id();
    let entry_id = db.tree_mut().add_entry(root, Entry::new(at(0)));

    db.delete_entry(entry_id);

    let entry = db.tree().entry(entry_id).expect("entry still lives");
    assert!(entry.is_deleted);
    let backup_id = db.backup_group(false).expect("recycle bin exists now");
    assert_eq!(entry.parent(), Some(backup_id));
    assert!(db.deleted_objects().is_empty(), "soft delete leaves no ledger entry");
    assert!(!db.meta.recycle_bin_uuid.is_nil());
}

#[test]
fn deleting_a_recycled_entry_purges_it_permanently() {
    let mut db = new_database();
    let root = db.tree().root_id();
    let entry_id = db.tree_mut().add_entry(root, Entry::new(at(0)));
    let uuid = db.tree().entry(entry_id).expect("entry").uuid;

    db.delete_entry(entry_id); // into the bin
    db.delete_entry(entry_id); // out of existence

    assert!(db.tree().entry(entry_id).is_none());
    assert_eq!(db.deleted_objects().len(), 1);
    assert_eq!(db.deleted_objects()[0].uuid, uuid);
}

#[test]
fn disabled_recycle_bin_purges_immediately() {
    let mut db = new_database();
    db.meta.recycle_bin_enabled = false;
    let root = db.tree().root_id();
    let entry_id = db.tree_mut().add_entry(root, Entry::new(at(0)));
    let uuid = db.tree().entry(entry_id).expect("entry").uuid;

    db.delete_entry(entry_id);

    assert!(db.tree().entry(entry_id).is_none());
    assert_eq!(db.deleted_objects().len(), 1);
    assert_eq!(db.deleted_objects()[0].uuid, uuid);
}

#[test]
fn deleting_a_group_recycles_its_whole_branch() {
    let mut db = new_database();
    let root = db.tree().root_id();
    let group_id = db
        .tree_mut()
        .add_group(root, coffre_kdbx::Group::new("Doomed", at(0)));
    let child_id = db.tree_mut().add_entry(group_id, Entry::new(at(0)));

    db.delete_group(group_id);

    assert!(db.tree().group(group_id).expect("group").is_deleted);
    assert!(db.tree().entry(child_id).expect("entry").is_deleted);
    let backup_id = db.backup_group(false).expect("recycle bin");
    assert_eq!(
        db.tree().group(group_id).expect("group").parent(),
        Some(backup_id)
    );
}

#[test]
fn deleting_a_recycled_group_records_every_uuid() {
    let mut db = new_database();
    let root = db.tree().root_id();
    let group_id = db
        .tree_mut()
        .add_group(root, coffre_kdbx::Group::new("Doomed", at(0)));
    let child_id = db.tree_mut().add_entry(group_id, Entry::new(at(0)));
    let group_uuid = db.tree().group(group_id).expect("group").uuid;
    let child_uuid = db.tree().entry(child_id).expect("entry").uuid;

    db.delete_group(group_id); // soft
    db.delete_group(group_id); // permanent

    assert!(db.tree().group(group_id).is_none());
    assert!(db.tree().entry(child_id).is_none());
    let uuids: Vec<uuid::Uuid> = db.deleted_objects().iter().map(|d| d.uuid).collect();
    assert!(uuids.contains(&group_uuid));
    assert!(uuids.contains(&child_uuid));
}

#[test]
fn deleted_objects_ledger_roundtrips() {
    let mut db = new_database();
    db.meta.recycle_bin_enabled = false;
    let root = db.tree().root_id();
    let entry_id = db.tree_mut().add_entry(root, Entry::new(at(0)));
    let uuid = db.tree().entry(entry_id).expect("entry").uuid;
    db.delete_entry(entry_id);

    db.change_composite_key(composite_key());
    let bytes = db.save(&Progress::new(100)).expect("save should succeed");
    let reloaded =
        Database::load(&bytes, composite_key(), &Progress::new(100)).expect("load should succeed");

    assert_eq!(reloaded.deleted_objects().len(), 1);
    assert_eq!(reloaded.deleted_objects()[0].uuid, uuid);
}

#[test]
fn recycled_items_are_flagged_deleted_after_reload() {
    let mut db = new_database();
    let root = db.tree().root_id();
    let entry_id = db.tree_mut().add_entry(root, Entry::new(at(0)));
    db.delete_entry(entry_id);

    db.change_composite_key(composite_key());
    let bytes = db.save(&Progress::new(100)).expect("save should succeed");
    let reloaded =
        Database::load(&bytes, composite_key(), &Progress::new(100)).expect("load should succeed");

    let recycled: Vec<&Entry> = reloaded
        .tree()
        .entries_in_document_order()
        .into_iter()
        .filter_map(|id| reloaded.tree().entry(id))
        .collect();
    assert_eq!(recycled.len(), 1);
    assert!(recycled[0].is_deleted, "deleted status must propagate on load");
}
