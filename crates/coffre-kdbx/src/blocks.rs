//! Integrity-checked block streams for the encrypted database body.
//!
//! Two generations of the same idea:
//!
//! - **v3 "hash blocks"** live *inside* the decrypted plaintext: a
//!   random start marker (wrong-key detector), then
//!   `index:u32, sha256:32, size:u32, data` records chained by a
//!   running counter, terminated by a zero-size block with an all-zero
//!   hash.
//! - **v4 "HMAC blocks"** wrap the *ciphertext*: `hmac:32, size:u32,
//!   data` records, each authenticated with a per-block key derived
//!   from the HMAC key base and the block index; the reserved index
//!   `u64::MAX` authenticates the header itself.
//!
//! Write path splits into fixed 1 MiB chunks, matching the reference
//! implementation.

use crate::error::{BlockStreamError, FormatError};
use crate::io::ByteReader;
use coffre_crypto_core::{Progress, SecretBytes};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Write-side chunk size (1 MiB, the KeePass 2 default).
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Block index reserved for the header HMAC.
pub const HEADER_BLOCK_INDEX: u64 = u64::MAX;

/// Per-block HMAC key: SHA-512(LE64(index) ‖ keyBase).
#[must_use]
pub fn hmac_block_key(key_base: &SecretBytes<64>, block_index: u64) -> SecretBytes<64> {
    let mut hasher = Sha512::new();
    hasher.update(block_index.to_le_bytes());
    hasher.update(key_base.expose());
    SecretBytes::new(hasher.finalize().into())
}

/// HMAC-SHA256 of the raw header bytes under the reserved block key.
#[must_use]
pub fn header_hmac(header_bytes: &[u8], key_base: &SecretBytes<64>) -> [u8; 32] {
    let block_key = hmac_block_key(key_base, HEADER_BLOCK_INDEX);
    hmac_sha256(block_key.expose(), &[header_bytes])
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn block_hmac(key_base: &SecretBytes<64>, block_index: u64, data: &[u8]) -> [u8; 32] {
    let block_key = hmac_block_key(key_base, block_index);
    let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
    hmac_sha256(
        block_key.expose(),
        &[&block_index.to_le_bytes(), &size.to_le_bytes(), data],
    )
}

// ---------------------------------------------------------------------------
// v3 hash blocks
// ---------------------------------------------------------------------------

/// Join a decrypted v3 body back into the payload.
///
/// The leading marker bytes must equal the header's StreamStartBytes —
/// that is the wrong-password check, distinguishable from the per-block
/// hash checks that indicate corruption.
///
/// # Errors
///
/// [`BlockStreamError::InvalidKey`] on marker mismatch, otherwise a
/// [`FormatError`] naming the corruption.
pub fn read_hashed_blocks(
    plaintext: &[u8],
    stream_start: &[u8],
    progress: &Progress,
) -> Result<Vec<u8>, BlockStreamError> {
    debug!("reading v3 hash blocks");
    let mut reader = ByteReader::new(plaintext);
    let marker = reader
        .read_bytes(stream_start.len())
        .ok_or(FormatError::PrematureDataEnd)?;
    if marker != stream_start {
        // first bytes do not match: wrong master key, not corruption
        return Err(BlockStreamError::InvalidKey);
    }

    progress.set_total(u64::try_from(plaintext.len()).unwrap_or(u64::MAX));
    let mut payload = Vec::new();
    let mut expected_index: u32 = 0;
    loop {
        progress.check_cancelled()?;
        let index = reader
            .read_u32_le()
            .ok_or(FormatError::PrematureDataEnd)?;
        if index != expected_index {
            return Err(FormatError::BlockIdMismatch.into());
        }
        expected_index = expected_index.wrapping_add(1);

        let stored_hash = reader
            .read_bytes(32)
            .ok_or(FormatError::PrematureDataEnd)?;
        let size = reader
            .read_u32_le()
            .ok_or(FormatError::PrematureDataEnd)?;

        if size == 0 {
            if stored_hash.iter().all(|&b| b == 0) {
                break;
            }
            // empty block with non-zero hash: corrupted terminator
            return Err(FormatError::BlockHashMismatch(u64::from(index)).into());
        }

        let data = reader
            .read_bytes(size as usize)
            .ok_or(FormatError::PrematureDataEnd)?;
        let computed: [u8; 32] = Sha256::digest(data).into();
        if computed != stored_hash {
            return Err(FormatError::BlockHashMismatch(u64::from(index)).into());
        }
        payload.extend_from_slice(data);
        progress.set_completed(u64::try_from(reader.pos()).unwrap_or(u64::MAX));
    }
    progress.finish();
    Ok(payload)
}

/// Split `data` into a v3 hash-block body: marker, 1 MiB chunks, then
/// the zero-size terminator with an all-zero hash.
///
/// # Errors
///
/// [`BlockStreamError::Interrupted`] on user cancellation.
pub fn write_hashed_blocks(
    data: &[u8],
    stream_start: &[u8],
    progress: &Progress,
) -> Result<Vec<u8>, BlockStreamError> {
    debug!(bytes = data.len(), "writing v3 hash blocks");
    progress.set_total(u64::try_from(data.len()).unwrap_or(u64::MAX));

    let mut out = Vec::with_capacity(
        stream_start
            .len()
            .saturating_add(data.len())
            .saturating_add(44),
    );
    out.extend_from_slice(stream_start);

    let mut index: u32 = 0;
    for chunk in data.chunks(DEFAULT_BLOCK_SIZE) {
        progress.check_cancelled()?;
        out.extend_from_slice(&index.to_le_bytes());
        let hash: [u8; 32] = Sha256::digest(chunk).into();
        out.extend_from_slice(&hash);
        out.extend_from_slice(&u32::try_from(chunk.len()).unwrap_or(u32::MAX).to_le_bytes());
        out.extend_from_slice(chunk);
        index = index.wrapping_add(1);
        progress.complete_units(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
    }
    // terminator: running index, zero hash, zero size
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&0u32.to_le_bytes());
    progress.finish();
    Ok(out)
}

// ---------------------------------------------------------------------------
// v4 HMAC blocks
// ---------------------------------------------------------------------------

/// Join a v4 HMAC block stream back into the (still encrypted) payload.
///
/// Block indices run sequentially from 0; each block's MAC covers
/// `LE64(index) ‖ LE32(size) ‖ data`. The zero-size terminator is
/// authenticated too, so truncation cannot masquerade as a clean end.
///
/// # Errors
///
/// [`FormatError::BlockHmacMismatch`] on authentication failure,
/// [`FormatError::PrematureDataEnd`] / [`FormatError::NegativeBlockSize`]
/// on structural damage.
pub fn read_hmac_blocks(
    data: &[u8],
    key_base: &SecretBytes<64>,
    progress: &Progress,
) -> Result<Vec<u8>, BlockStreamError> {
    debug!("reading v4 HMAC blocks");
    progress.set_total(u64::try_from(data.len()).unwrap_or(u64::MAX));
    let mut reader = ByteReader::new(data);
    let mut payload = Vec::new();
    let mut index: u64 = 0;
    loop {
        progress.check_cancelled()?;
        let stored_hmac = reader
            .read_bytes(32)
            .ok_or(FormatError::PrematureDataEnd)?;
        let size = reader
            .read_u32_le()
            .ok_or(FormatError::PrematureDataEnd)?;
        if size > i32::MAX as u32 {
            return Err(FormatError::NegativeBlockSize(index).into());
        }
        let block_data = reader
            .read_bytes(size as usize)
            .ok_or(FormatError::PrematureDataEnd)?;

        let computed = block_hmac(key_base, index, block_data);
        if computed != stored_hmac {
            return Err(FormatError::BlockHmacMismatch(index).into());
        }

        // zero size might be data corruption, hence checked only after
        // HMAC verification
        if size == 0 {
            break;
        }
        payload.extend_from_slice(block_data);
        index = index.wrapping_add(1);
        progress.set_completed(u64::try_from(reader.pos()).unwrap_or(u64::MAX));
    }
    progress.finish();
    Ok(payload)
}

/// Split `data` into a v4 HMAC block stream: 1 MiB chunks plus the
/// authenticated zero-size terminator.
///
/// # Errors
///
/// [`BlockStreamError::Interrupted`] on user cancellation.
pub fn write_hmac_blocks(
    data: &[u8],
    key_base: &SecretBytes<64>,
    progress: &Progress,
) -> Result<Vec<u8>, BlockStreamError> {
    debug!(bytes = data.len(), "writing v4 HMAC blocks");
    progress.set_total(u64::try_from(data.len()).unwrap_or(u64::MAX));

    let mut out = Vec::with_capacity(data.len().saturating_add(72));
    let mut index: u64 = 0;
    for chunk in data.chunks(DEFAULT_BLOCK_SIZE) {
        progress.check_cancelled()?;
        out.extend_from_slice(&block_hmac(key_base, index, chunk));
        out.extend_from_slice(&u32::try_from(chunk.len()).unwrap_or(u32::MAX).to_le_bytes());
        out.extend_from_slice(chunk);
        index = index.wrapping_add(1);
        progress.complete_units(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
    }
    out.extend_from_slice(&block_hmac(key_base, index, &[]));
    out.extend_from_slice(&0u32.to_le_bytes());
    progress.finish();
    Ok(out)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn key_base() -> SecretBytes<64> {
        SecretBytes::new([0x5C; 64])
    }

    fn start_bytes() -> Vec<u8> {
        vec![0xA1; 32]
    }

    #[test]
    fn v3_roundtrip() {
        let data = vec![0x42u8; 5000];
        let body = write_hashed_blocks(&data, &start_bytes(), &Progress::new(100))
            .expect("write should succeed");
        let back = read_hashed_blocks(&body, &start_bytes(), &Progress::new(100))
            .expect("read should succeed");
        assert_eq!(back, data);
    }

    #[test]
    fn v3_empty_payload_roundtrip() {
        let body = write_hashed_blocks(&[], &start_bytes(), &Progress::new(100))
            .expect("write should succeed");
        let back = read_hashed_blocks(&body, &start_bytes(), &Progress::new(100))
            .expect("read should succeed");
        assert!(back.is_empty());
    }

    #[test]
    fn v3_marker_mismatch_is_invalid_key() {
        let body = write_hashed_blocks(b"data", &start_bytes(), &Progress::new(100))
            .expect("write should succeed");
        let other_start = vec![0xA2; 32];
        let result = read_hashed_blocks(&body, &other_start, &Progress::new(100));
        assert!(matches!(result, Err(BlockStreamError::InvalidKey)));
    }

    #[test]
    fn v3_flipped_data_byte_is_hash_mismatch() {
        let mut body = write_hashed_blocks(&[0x11; 100], &start_bytes(), &Progress::new(100))
            .expect("write should succeed");
        // 32 marker + 4 index + 32 hash + 4 size = 72; flip a data byte
        body[80] ^= 0x01;
        let result = read_hashed_blocks(&body, &start_bytes(), &Progress::new(100));
        assert!(matches!(
            result,
            Err(BlockStreamError::Format(FormatError::BlockHashMismatch(0)))
        ));
    }

    #[test]
    fn v3_block_id_mismatch_is_detected() {
        let mut body = write_hashed_blocks(&[0x11; 100], &start_bytes(), &Progress::new(100))
            .expect("write should succeed");
        body[32] = 9; // first block index
        let result = read_hashed_blocks(&body, &start_bytes(), &Progress::new(100));
        assert!(matches!(
            result,
            Err(BlockStreamError::Format(FormatError::BlockIdMismatch))
        ));
    }

    #[test]
    fn v3_truncation_is_premature_end() {
        let body = write_hashed_blocks(&[0x11; 100], &start_bytes(), &Progress::new(100))
            .expect("write should succeed");
        let result =
            read_hashed_blocks(&body[..body.len() - 10], &start_bytes(), &Progress::new(100));
        assert!(matches!(
            result,
            Err(BlockStreamError::Format(FormatError::PrematureDataEnd))
        ));
    }

    #[test]
    fn v3_terminator_with_dirty_hash_is_rejected() {
        let mut body = write_hashed_blocks(&[], &start_bytes(), &Progress::new(100))
            .expect("write should succeed");
        // terminator layout: marker(32) + index(4) + hash(32) + size(4)
        body[40] = 0xFF;
        let result = read_hashed_blocks(&body, &start_bytes(), &Progress::new(100));
        assert!(matches!(
            result,
            Err(BlockStreamError::Format(FormatError::BlockHashMismatch(_)))
        ));
    }

    #[test]
    fn v4_roundtrip() {
        let data = vec![0x37u8; 4096];
        let body = write_hmac_blocks(&data, &key_base(), &Progress::new(100))
            .expect("write should succeed");
        let back = read_hmac_blocks(&body, &key_base(), &Progress::new(100))
            .expect("read should succeed");
        assert_eq!(back, data);
    }

    #[test]
    fn v4_multi_block_roundtrip() {
        // forces three blocks plus terminator
        let data = vec![0x66u8; DEFAULT_BLOCK_SIZE * 2 + 17];
        let body = write_hmac_blocks(&data, &key_base(), &Progress::new(100))
            .expect("write should succeed");
        let back = read_hmac_blocks(&body, &key_base(), &Progress::new(100))
            .expect("read should succeed");
        assert_eq!(back.len(), data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn v4_any_flipped_byte_is_hmac_mismatch() {
        let mut body = write_hmac_blocks(&[0x11; 256], &key_base(), &Progress::new(100))
            .expect("write should succeed");
        body[40] ^= 0x01; // inside the first block's data
        let result = read_hmac_blocks(&body, &key_base(), &Progress::new(100));
        assert!(matches!(
            result,
            Err(BlockStreamError::Format(FormatError::BlockHmacMismatch(0)))
        ));
    }

    #[test]
    fn v4_wrong_key_base_is_hmac_mismatch() {
        let body = write_hmac_blocks(&[0x11; 256], &key_base(), &Progress::new(100))
            .expect("write should succeed");
        let other = SecretBytes::new([0x5D; 64]);
        let result = read_hmac_blocks(&body, &other, &Progress::new(100));
        assert!(matches!(
            result,
            Err(BlockStreamError::Format(FormatError::BlockHmacMismatch(0)))
        ));
    }

    #[test]
    fn v4_truncation_mid_block_is_premature_end() {
        let body = write_hmac_blocks(&[0x11; 256], &key_base(), &Progress::new(100))
            .expect("write should succeed");
        let result = read_hmac_blocks(&body[..50], &key_base(), &Progress::new(100));
        assert!(matches!(
            result,
            Err(BlockStreamError::Format(FormatError::PrematureDataEnd))
        ));
    }

    #[test]
    fn v4_missing_terminator_is_premature_end() {
        let body = write_hmac_blocks(&[0x11; 256], &key_base(), &Progress::new(100))
            .expect("write should succeed");
        // drop the authenticated terminator entirely
        let result = read_hmac_blocks(&body[..body.len() - 36], &key_base(), &Progress::new(100));
        assert!(matches!(
            result,
            Err(BlockStreamError::Format(FormatError::PrematureDataEnd))
        ));
    }

    #[test]
    fn header_hmac_depends_on_key_and_bytes() {
        let a = header_hmac(b"header bytes", &key_base());
        let b = header_hmac(b"header bytes", &SecretBytes::new([0u8; 64]));
        let c = header_hmac(b"other bytes", &key_base());
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn block_keys_differ_per_index() {
        let k0 = hmac_block_key(&key_base(), 0);
        let k1 = hmac_block_key(&key_base(), 1);
        let kh = hmac_block_key(&key_base(), HEADER_BLOCK_INDEX);
        assert_ne!(k0.expose(), k1.expose());
        assert_ne!(k0.expose(), kh.expose());
    }

    #[test]
    fn cancellation_interrupts_writing() {
        let progress = Progress::new(100);
        progress.cancel();
        let result = write_hmac_blocks(&[0u8; 16], &key_base(), &progress);
        assert!(matches!(result, Err(BlockStreamError::Interrupted(_))));
    }
}
