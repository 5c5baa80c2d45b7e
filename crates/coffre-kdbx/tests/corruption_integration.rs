#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Wrong-key vs. corruption classification on real file bytes.

use coffre_crypto_core::kdf::{
    PARAM_AES_ROUNDS, PARAM_ARGON2_ITERATIONS, PARAM_ARGON2_MEMORY, PARAM_ARGON2_PARALLELISM,
};
use coffre_crypto_core::Value;
use coffre_kdbx::{
    Database, DatabaseError, DataCipher, FormatVersion, Kdf, KeyHelper, Progress,
};

fn composite_key(password: &str) -> coffre_kdbx::SecretBytes<32> {
    let helper = KeyHelper::Kdbx2;
    helper.composite_key(&helper.password_bytes(password), &[], None)
}

fn saved_database(version: FormatVersion, cipher: DataCipher, kdf: Kdf) -> Vec<u8> {
    let mut db = Database::new(version, cipher, kdf, true, "Corruptible");
    let params = &mut db.header_mut().kdf_params;
    params.set(PARAM_AES_ROUNDS, Value::UInt64(100));
    params.set(PARAM_ARGON2_ITERATIONS, Value::UInt64(1));
    params.set(PARAM_ARGON2_MEMORY, Value::UInt64(1024 * 1024));
    params.set(PARAM_ARGON2_PARALLELISM, Value::UInt32(1));

    let root = db.tree().root_id();
    let now = chrono::TimeZone::timestamp_opt(&chrono::Utc, 1_700_000_000, 0)
        .single()
        .expect("valid time");
    let mut entry = coffre_kdbx::Entry::new(now);
    entry.set_field(coffre_kdbx::FIELD_TITLE, "canary", false);
    entry.set_field(coffre_kdbx::FIELD_PASSWORD, "tweet", true);
    db.tree_mut().add_entry(root, entry);

    db.change_composite_key(composite_key("good"));
    db.save(&Progress::new(100)).expect("save should succeed")
}

fn load(bytes: &[u8], password: &str) -> Result<Database, DatabaseError> {
    Database::load(bytes, composite_key(password), &Progress::new(100))
}

#[test]
fn v3_wrong_password_is_invalid_key() {
    let bytes = saved_database(FormatVersion::V3, DataCipher::Aes256, Kdf::AesKdf);
    assert!(matches!(
        load(&bytes, "bad"),
        Err(DatabaseError::InvalidKey)
    ));
}

#[test]
fn v3_wrong_password_with_stream_cipher_is_invalid_key() {
    // ChaCha20 has no padding, so here the start-marker check itself
    // must catch the wrong key
    let bytes = saved_database(FormatVersion::V3, DataCipher::ChaCha20, Kdf::AesKdf);
    assert!(matches!(
        load(&bytes, "bad"),
        Err(DatabaseError::InvalidKey)
    ));
}

#[test]
fn v4_wrong_password_is_invalid_key() {
    for cipher in [DataCipher::Aes256, DataCipher::ChaCha20, DataCipher::Twofish] {
        let bytes = saved_database(FormatVersion::V4, cipher, Kdf::Argon2d);
        assert!(matches!(
            load(&bytes, "bad"),
            Err(DatabaseError::InvalidKey)
        ));
    }
}

#[test]
fn v4_flipped_payload_byte_is_corruption_not_wrong_key() {
    let bytes = saved_database(FormatVersion::V4, DataCipher::ChaCha20, Kdf::Argon2d);
    // flip one byte well inside the HMAC block payload
    let mut corrupt = bytes.clone();
    let offset = bytes.len() - 100;
    corrupt[offset] ^= 0x01;
    match load(&corrupt, "good") {
        Err(DatabaseError::Load { reason }) => {
            assert!(reason.contains("HMAC"), "unexpected reason: {reason}");
        }
        other => panic!("expected Load error, got {other:?}", other = other.err()),
    }
}

#[test]
fn v4_flipped_header_byte_fails_hash_check() {
    let bytes = saved_database(FormatVersion::V4, DataCipher::Aes256, Kdf::Argon2d);
    let mut corrupt = bytes.clone();
    // flip a master-seed byte: the field has no validation of its own,
    // so only the stored header hash can catch the tampering
    let seed_offset = 12 + 5 + 16 + 5 + 4 + 5; // sig/version, cipher, compression, seed value
    corrupt[seed_offset] ^= 0x01;
    match load(&corrupt, "good") {
        // the tampered header no longer matches its stored SHA-256
        Err(DatabaseError::Load { reason }) => {
            assert!(reason.contains("hash"), "unexpected reason: {reason}");
        }
        other => panic!("expected Load error, got {other:?}", other = other.err()),
    }
}

#[test]
fn truncation_mid_block_is_premature_end() {
    let bytes = saved_database(FormatVersion::V4, DataCipher::Aes256, Kdf::Argon2d);
    let result = load(&bytes[..bytes.len() - 25], "good");
    match result {
        Err(DatabaseError::Load { reason }) => {
            assert!(
                reason.contains("end of file") || reason.contains("HMAC"),
                "unexpected reason: {reason}"
            );
        }
        other => panic!("expected Load error, got {other:?}", other = other.err()),
    }
}

#[test]
fn truncated_header_is_a_load_error() {
    let bytes = saved_database(FormatVersion::V4, DataCipher::Aes256, Kdf::Argon2d);
    let result = load(&bytes[..40], "good");
    assert!(matches!(result, Err(DatabaseError::Load { .. })));
}

#[test]
fn garbage_input_is_rejected_by_signature() {
    let result = load(&[0xFFu8; 4096], "good");
    match result {
        Err(DatabaseError::Load { reason }) => {
            assert!(reason.contains("signature"), "unexpected reason: {reason}");
        }
        other => panic!("expected Load error, got {other:?}", other = other.err()),
    }
}

#[test]
fn v3_mid_stream_corruption_is_a_block_error() {
    // with a stream cipher the decryption itself cannot fail, so the
    // flipped byte must surface through the hash-block layer
    let bytes = saved_database(FormatVersion::V3, DataCipher::ChaCha20, Kdf::AesKdf);
    let mut corrupt = bytes.clone();
    let offset = bytes.len() / 2;
    corrupt[offset] ^= 0x01;
    match load(&corrupt, "good") {
        Err(DatabaseError::Load { reason }) => {
            assert!(
                reason.contains("hash") || reason.contains("block"),
                "unexpected reason: {reason}"
            );
        }
        Err(DatabaseError::InvalidKey) => {
            panic!("mid-stream corruption must not be reported as a wrong key")
        }
        other => panic!("expected Load error, got {other:?}", other = other.err()),
    }
}
