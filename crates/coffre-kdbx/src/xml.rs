//! XML machinery for the inner document.
//!
//! Event-stream reading with strict child dispatch (a known container
//! rejects tags it does not know — unlike header fields, the XML schema
//! tolerates no strangers), value codecs shared by Meta/Group/Entry,
//! and the document-level parse/serialize entry points.

use crate::binaries::BinaryPool;
use crate::entry::Times;
use crate::error::ParsingError;
use crate::group::Group;
use crate::header::FormatVersion;
use crate::meta::Meta;
use crate::tree::{DeletedObject, Tree};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use coffre_crypto_core::InnerStreamCipher;
use std::io::{Read, Write};
use tracing::debug;
use uuid::Uuid;
use xml::attribute::OwnedAttribute;
use xml::reader::{EventReader, ParserConfig, XmlEvent};
use xml::writer::{EmitterConfig, EventWriter, XmlEvent as WriterEvent};

/// Seconds between 0001-01-01T00:00:00Z (the v4 epoch) and the Unix
/// epoch.
const V4_EPOCH_OFFSET: i64 = 62_135_596_800;

pub(crate) const TRUE: &str = "True";
pub(crate) const FALSE: &str = "False";
pub(crate) const NULL: &str = "null";

/// Context threaded through the XML readers.
pub(crate) struct ReadCtx<'a> {
    pub version: FormatVersion,
    pub cipher: &'a mut InnerStreamCipher,
}

/// Context threaded through the XML writers.
pub(crate) struct WriteCtx<'a> {
    pub version: FormatVersion,
    pub cipher: &'a mut InnerStreamCipher,
}

// ---------------------------------------------------------------------------
// Event-stream helpers
// ---------------------------------------------------------------------------

/// The next structural event under the current element.
pub(crate) enum Child {
    /// A child element started.
    Element {
        name: String,
        attributes: Vec<OwnedAttribute>,
    },
    /// The current element ended.
    End,
}

/// Advance to the next child element or the parent's end tag.
pub(crate) fn next_child<R: Read>(reader: &mut EventReader<R>) -> Result<Child, ParsingError> {
    loop {
        match reader.next().map_err(xml_error)? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                return Ok(Child::Element {
                    name: name.local_name,
                    attributes,
                })
            }
            XmlEvent::EndElement { .. } => return Ok(Child::End),
            XmlEvent::EndDocument => {
                return Err(ParsingError::Xml("unexpected end of document".into()))
            }
            // inter-element whitespace, comments, PIs
            _ => {}
        }
    }
}

/// Consume a text-only element's content through its end tag.
pub(crate) fn read_text<R: Read>(reader: &mut EventReader<R>) -> Result<String, ParsingError> {
    let mut text = String::new();
    loop {
        match reader.next().map_err(xml_error)? {
            XmlEvent::Characters(chunk) | XmlEvent::CData(chunk) => text.push_str(&chunk),
            XmlEvent::Whitespace(chunk) => text.push_str(&chunk),
            XmlEvent::EndElement { .. } => return Ok(text),
            XmlEvent::StartElement { name, .. } => {
                return Err(ParsingError::Xml(format!(
                    "unexpected element <{}> inside a value",
                    name.local_name
                )))
            }
            XmlEvent::EndDocument => {
                return Err(ParsingError::Xml("unexpected end of document".into()))
            }
            _ => {}
        }
    }
}

/// Attribute lookup by local name.
pub(crate) fn attr<'a>(attributes: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.as_str())
}

pub(crate) fn xml_error<E: std::fmt::Display>(e: E) -> ParsingError {
    ParsingError::Xml(e.to_string())
}

// ---------------------------------------------------------------------------
// Value codecs
// ---------------------------------------------------------------------------

/// "True" (any case) is true, everything else is false.
pub(crate) fn parse_bool(text: &str) -> bool {
    text.eq_ignore_ascii_case("true")
}

/// Tri-state: "null"/empty is unset.
pub(crate) fn parse_optional_bool(text: &str) -> Option<bool> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(parse_bool(trimmed))
    }
}

pub(crate) const fn bool_str(value: bool) -> &'static str {
    if value {
        TRUE
    } else {
        FALSE
    }
}

/// UUIDs travel as base64 of their 16 raw bytes; unparseable input
/// degrades to the nil UUID, as the reference implementation does.
pub(crate) fn parse_uuid(text: &str) -> Uuid {
    BASE64
        .decode(text.trim())
        .ok()
        .and_then(|bytes| Uuid::from_slice(&bytes).ok())
        .unwrap_or_else(Uuid::nil)
}

pub(crate) fn uuid_string(uuid: Uuid) -> String {
    BASE64.encode(uuid.as_bytes())
}

/// Parse a timestamp in the *source* version's encoding.
pub(crate) fn parse_date(version: FormatVersion, text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    match version {
        FormatVersion::V3 => DateTime::parse_from_rfc3339(trimmed)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        FormatVersion::V4 => {
            let raw = BASE64.decode(trimmed).ok()?;
            let secs = u64::from_le_bytes(raw.try_into().ok()?);
            let unix = i64::try_from(secs).ok()?.checked_sub(V4_EPOCH_OFFSET)?;
            Utc.timestamp_opt(unix, 0).single()
        }
    }
}

/// Format a timestamp in the *target* version's encoding.
pub(crate) fn format_date(version: FormatVersion, time: DateTime<Utc>) -> String {
    match version {
        FormatVersion::V3 => time.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        FormatVersion::V4 => {
            let secs = time.timestamp().saturating_add(V4_EPOCH_OFFSET);
            let secs = u64::try_from(secs).unwrap_or(0);
            BASE64.encode(secs.to_le_bytes())
        }
    }
}

/// Decrypt a protected value: base64, keystream, UTF-8.
pub(crate) fn unprotect_value(
    text: &str,
    cipher: &mut InnerStreamCipher,
) -> Option<String> {
    let mut bytes = BASE64.decode(text.trim()).ok()?;
    cipher.apply(&mut bytes);
    String::from_utf8(bytes).ok()
}

/// Encrypt a protected value for storage: keystream, then base64.
pub(crate) fn protect_value(value: &str, cipher: &mut InnerStreamCipher) -> String {
    let mut bytes = value.as_bytes().to_vec();
    cipher.apply(&mut bytes);
    BASE64.encode(&bytes)
}

// ---------------------------------------------------------------------------
// Writer helpers
// ---------------------------------------------------------------------------

pub(crate) fn start_element<W: Write>(
    writer: &mut EventWriter<W>,
    name: &str,
) -> Result<(), ParsingError> {
    writer
        .write(WriterEvent::start_element(name))
        .map_err(xml_error)
}

pub(crate) fn end_element<W: Write>(writer: &mut EventWriter<W>) -> Result<(), ParsingError> {
    writer.write(WriterEvent::end_element()).map_err(xml_error)
}

pub(crate) fn text_element<W: Write>(
    writer: &mut EventWriter<W>,
    name: &str,
    text: &str,
) -> Result<(), ParsingError> {
    start_element(writer, name)?;
    if !text.is_empty() {
        writer
            .write(WriterEvent::characters(text))
            .map_err(xml_error)?;
    }
    end_element(writer)
}

// ---------------------------------------------------------------------------
// Times block (shared by groups and entries)
// ---------------------------------------------------------------------------

pub(crate) fn parse_times<R: Read>(
    reader: &mut EventReader<R>,
    ctx: &ReadCtx<'_>,
    expected: &'static str,
) -> Result<Times, ParsingError> {
    let mut times = Times::new_at(Utc::now().trunc_subsecs());
    loop {
        match next_child(reader)? {
            Child::End => return Ok(times),
            Child::Element { name, .. } => {
                let text = read_text(reader)?;
                let date = |tag| {
                    parse_date(ctx.version, &text).ok_or(ParsingError::MalformedValue { tag })
                };
                match name.as_str() {
                    "CreationTime" => times.creation = date("Times/CreationTime")?,
                    "LastModificationTime" => {
                        times.last_modification = date("Times/LastModificationTime")?;
                    }
                    "LastAccessTime" => times.last_access = date("Times/LastAccessTime")?,
                    "ExpiryTime" => times.expiry = date("Times/ExpiryTime")?,
                    "Expires" => times.expires = parse_bool(&text),
                    "UsageCount" => times.usage_count = text.trim().parse().unwrap_or(0),
                    "LocationChanged" => times.location_changed = date("Times/LocationChanged")?,
                    _ => {
                        return Err(ParsingError::UnexpectedTag {
                            actual: name,
                            expected,
                        })
                    }
                }
            }
        }
    }
}

pub(crate) fn write_times<W: Write>(
    writer: &mut EventWriter<W>,
    ctx: &WriteCtx<'_>,
    times: &Times,
) -> Result<(), ParsingError> {
    start_element(writer, "Times")?;
    text_element(writer, "CreationTime", &format_date(ctx.version, times.creation))?;
    text_element(
        writer,
        "LastModificationTime",
        &format_date(ctx.version, times.last_modification),
    )?;
    text_element(
        writer,
        "LastAccessTime",
        &format_date(ctx.version, times.last_access),
    )?;
    text_element(writer, "ExpiryTime", &format_date(ctx.version, times.expiry))?;
    text_element(writer, "Expires", bool_str(times.expires))?;
    text_element(writer, "UsageCount", &times.usage_count.to_string())?;
    text_element(
        writer,
        "LocationChanged",
        &format_date(ctx.version, times.location_changed),
    )?;
    end_element(writer)
}

trait TruncSubsecs {
    fn trunc_subsecs(self) -> Self;
}

impl TruncSubsecs for DateTime<Utc> {
    fn trunc_subsecs(self) -> Self {
        Utc.timestamp_opt(self.timestamp(), 0).single().unwrap_or(self)
    }
}

// ---------------------------------------------------------------------------
// Document level
// ---------------------------------------------------------------------------

/// Parse the decrypted inner XML into metadata, tree and the
/// deleted-objects ledger.
pub(crate) fn parse_document(
    xml_bytes: &[u8],
    version: FormatVersion,
    cipher: &mut InnerStreamCipher,
    pool: &mut BinaryPool,
) -> Result<(Meta, Tree, Vec<DeletedObject>), ParsingError> {
    debug!("parsing XML document");
    let config = ParserConfig::new()
        .trim_whitespace(false)
        .cdata_to_characters(true);
    let mut reader = EventReader::new_with_config(xml_bytes, config);

    let Child::Element { name, .. } = next_child(&mut reader)? else {
        return Err(ParsingError::NotKeePassDocument);
    };
    if name != "KeePassFile" {
        return Err(ParsingError::NotKeePassDocument);
    }

    let mut meta = Meta::default();
    let mut tree: Option<Tree> = None;
    let mut deleted: Vec<DeletedObject> = Vec::new();

    loop {
        match next_child(&mut reader)? {
            Child::End => break,
            Child::Element { name, .. } => match name.as_str() {
                "Meta" => {
                    let mut ctx = ReadCtx { version, cipher };
                    meta = Meta::parse(&mut reader, &mut ctx, pool)?;
                    debug!("meta loaded OK");
                }
                "Root" => loop {
                    match next_child(&mut reader)? {
                        Child::End => break,
                        Child::Element { name, .. } => match name.as_str() {
                            "Group" => {
                                let mut ctx = ReadCtx { version, cipher };
                                tree = Some(crate::group::parse_group_tree(
                                    &mut reader,
                                    &mut ctx,
                                    &meta,
                                    pool,
                                )?);
                            }
                            "DeletedObjects" => {
                                deleted = parse_deleted_objects(&mut reader, version)?;
                            }
                            _ => {
                                return Err(ParsingError::UnexpectedTag {
                                    actual: name,
                                    expected: "Root/*",
                                })
                            }
                        },
                    }
                },
                _ => {
                    return Err(ParsingError::UnexpectedTag {
                        actual: name,
                        expected: "KeePassFile/*",
                    })
                }
            },
        }
    }

    let tree = tree
        .unwrap_or_else(|| Tree::new(Group::new("", Utc::now().trunc_subsecs())));
    debug!("XML content loaded OK");
    Ok((meta, tree, deleted))
}

fn parse_deleted_objects<R: Read>(
    reader: &mut EventReader<R>,
    version: FormatVersion,
) -> Result<Vec<DeletedObject>, ParsingError> {
    let mut deleted = Vec::new();
    loop {
        match next_child(reader)? {
            Child::End => return Ok(deleted),
            Child::Element { name, .. } => {
                if name != "DeletedObject" {
                    return Err(ParsingError::UnexpectedTag {
                        actual: name,
                        expected: "DeletedObjects/*",
                    });
                }
                let mut uuid = Uuid::nil();
                let mut deletion_time = None;
                loop {
                    match next_child(reader)? {
                        Child::End => break,
                        Child::Element { name, .. } => {
                            let text = read_text(reader)?;
                            match name.as_str() {
                                "UUID" => uuid = parse_uuid(&text),
                                "DeletionTime" => {
                                    deletion_time =
                                        Some(parse_date(version, &text).ok_or(
                                            ParsingError::MalformedValue {
                                                tag: "DeletedObject/DeletionTime",
                                            },
                                        )?);
                                }
                                _ => {
                                    return Err(ParsingError::UnexpectedTag {
                                        actual: name,
                                        expected: "DeletedObject/*",
                                    })
                                }
                            }
                        }
                    }
                }
                let deletion_time = deletion_time.ok_or(ParsingError::MalformedValue {
                    tag: "DeletedObject/DeletionTime",
                })?;
                deleted.push(DeletedObject {
                    uuid,
                    deletion_time,
                });
            }
        }
    }
}

/// Serialize metadata, tree and deleted objects into the inner XML.
pub(crate) fn write_document(
    meta: &Meta,
    tree: &Tree,
    deleted: &[DeletedObject],
    version: FormatVersion,
    cipher: &mut InnerStreamCipher,
    pool: &BinaryPool,
) -> Result<Vec<u8>, ParsingError> {
    debug!("generating XML document");
    let mut out = Vec::new();
    let mut writer = EmitterConfig::new()
        .perform_indent(true)
        .create_writer(&mut out);

    start_element(&mut writer, "KeePassFile")?;
    {
        let mut ctx = WriteCtx { version, cipher };
        meta.write(&mut writer, &mut ctx, pool)?;

        start_element(&mut writer, "Root")?;
        crate::group::write_group_tree(&mut writer, &mut ctx, tree, meta)?;

        start_element(&mut writer, "DeletedObjects")?;
        for object in deleted {
            start_element(&mut writer, "DeletedObject")?;
            text_element(&mut writer, "UUID", &uuid_string(object.uuid))?;
            text_element(
                &mut writer,
                "DeletionTime",
                &format_date(version, object.deletion_time),
            )?;
            end_element(&mut writer)?;
        }
        end_element(&mut writer)?; // DeletedObjects
        end_element(&mut writer)?; // Root
    }
    end_element(&mut writer)?; // KeePassFile
    drop(writer);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
