//! Composite master key derivation.
//!
//! Password, key file and challenge-response secret are hashed and
//! chained into a single 32-byte composite key before the KDF runs.
//! KDB (1.x) and KDBX (2.x) chain the parts differently — getting a
//! single hash pass wrong makes every existing database unreadable, so
//! the per-version rules live in one place.

use coffre_crypto_core::{SecretBuffer, SecretBytes};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;
use xml::reader::{EventReader, XmlEvent};

/// Length of the composite key and of a binary key file.
pub const KEY_FILE_KEY_LENGTH: usize = 32;

/// Per-format key processing rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyHelper {
    /// KeePass 1.x (`.kdb`).
    Kdb1,
    /// KeePass 2.x (`.kdbx`, format v3 and v4).
    Kdbx2,
}

impl KeyHelper {
    /// Convert a password string to raw bytes per the format's rules:
    /// KDBX hashes UTF-8, KDB hashes a lossy Latin-1 rendering.
    #[must_use]
    pub fn password_bytes(self, password: &str) -> SecretBuffer {
        match self {
            Self::Kdbx2 => SecretBuffer::new(password.as_bytes()),
            Self::Kdb1 => {
                let latin1: Vec<u8> = password
                    .chars()
                    .map(|c| {
                        let code = u32::from(c);
                        u8::try_from(code).unwrap_or(b'?')
                    })
                    .collect();
                SecretBuffer::from_vec(latin1)
            }
        }
    }

    /// Extract key material from a key file.
    ///
    /// Probing order: exact 32-byte binary key; 64 bytes of hex; XML
    /// `<KeyFile><Key><Data>base64</Data></Key></KeyFile>` (KDBX only);
    /// otherwise SHA-256 of the raw file bytes.
    #[must_use]
    pub fn process_key_file(self, key_file_data: &[u8]) -> SecretBuffer {
        debug_assert!(!key_file_data.is_empty());

        if key_file_data.len() == KEY_FILE_KEY_LENGTH {
            debug!("key file format: binary");
            return SecretBuffer::new(key_file_data);
        }
        if key_file_data.len() == 2 * KEY_FILE_KEY_LENGTH {
            if let Some(key) = std::str::from_utf8(key_file_data)
                .ok()
                .and_then(|s| hex::decode(s).ok())
            {
                debug!("key file format: hex");
                return SecretBuffer::from_vec(key);
            }
        }
        if self == Self::Kdbx2 {
            if let Some(key) = parse_xml_key_file(key_file_data) {
                debug!("key file format: XML");
                return key;
            }
        }
        debug!("key file format: other, hashing");
        SecretBuffer::new(&Sha256::digest(key_file_data))
    }

    /// Combine the available secrets into the composite key.
    ///
    /// At least one part must be non-empty. Parts are concatenated in
    /// fixed order — SHA-256(password) ‖ keyFileKey ‖
    /// SHA-256(challengeResponse) — each present only when supplied.
    /// KDBX always applies one extra SHA-256 pass over the
    /// concatenation; KDB applies it only when parts were actually
    /// combined (a lone key file is used as-is, a lone password gets a
    /// single hash).
    #[must_use]
    pub fn composite_key(
        self,
        password_data: &SecretBuffer,
        key_file_data: &[u8],
        challenge_response: Option<&[u8]>,
    ) -> SecretBytes<32> {
        debug_assert!(
            !password_data.is_empty() || !key_file_data.is_empty() || challenge_response.is_some()
        );

        let password_part: Option<[u8; 32]> = (!password_data.is_empty())
            .then(|| Sha256::digest(password_data.expose()).into());
        let key_file_part: Option<SecretBuffer> =
            (!key_file_data.is_empty()).then(|| self.process_key_file(key_file_data));
        let challenge_part: Option<[u8; 32]> =
            challenge_response.map(|secret| Sha256::digest(secret).into());

        let part_count = usize::from(password_part.is_some())
            .saturating_add(usize::from(key_file_part.is_some()))
            .saturating_add(usize::from(challenge_part.is_some()));

        // KDB shortcuts for a single secret
        if self == Self::Kdb1 && part_count == 1 {
            if let Some(hash) = password_part {
                return SecretBytes::new(hash);
            }
            if let Some(key) = &key_file_part {
                let digest: [u8; 32] = if key.len() == KEY_FILE_KEY_LENGTH {
                    let mut out = [0u8; 32];
                    out.copy_from_slice(key.expose());
                    out
                } else {
                    Sha256::digest(key.expose()).into()
                };
                return SecretBytes::new(digest);
            }
        }

        let mut pre_key = Sha256::new();
        if let Some(hash) = password_part {
            pre_key.update(hash);
        }
        if let Some(key) = &key_file_part {
            pre_key.update(key.expose());
        }
        if let Some(hash) = challenge_part {
            pre_key.update(hash);
        }
        SecretBytes::new(pre_key.finalize().into())
    }
}

/// Pull the base64 `<Key><Data>` element out of a KeePass XML key file.
fn parse_xml_key_file(data: &[u8]) -> Option<SecretBuffer> {
    let mut reader = EventReader::new(data);
    let mut path: Vec<String> = Vec::new();
    let mut key_base64: Option<String> = None;
    loop {
        match reader.next().ok()? {
            XmlEvent::StartElement { name, .. } => path.push(name.local_name),
            XmlEvent::EndElement { .. } => {
                path.pop();
            }
            XmlEvent::Characters(text) => {
                if path == ["KeyFile", "Key", "Data"] {
                    key_base64 = Some(text.trim().to_owned());
                }
            }
            XmlEvent::EndDocument => break,
            _ => {}
        }
    }
    let decoded = BASE64.decode(key_base64?).ok()?;
    Some(SecretBuffer::from_vec(decoded))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
