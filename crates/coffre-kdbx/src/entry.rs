//! Entries: field sets, attachments, auto-type, timestamps, history.

use crate::binaries::BinaryPool;
use crate::error::ParsingError;
use crate::meta::{CustomData, MemoryProtection};
use crate::tree::GroupId;
use crate::xml::{
    attr, bool_str, next_child, parse_bool, parse_times, parse_uuid, protect_value, read_text,
    start_element, text_element, unprotect_value, uuid_string, write_times, xml_error, Child,
    ReadCtx, WriteCtx,
};
use chrono::{DateTime, TimeZone, Utc};
use std::io::{Read, Write};
use uuid::Uuid;
use xml::reader::EventReader;
use xml::writer::EventWriter;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Standard field names with dedicated memory-protection defaults.
pub const FIELD_TITLE: &str = "Title";
pub const FIELD_USERNAME: &str = "UserName";
pub const FIELD_PASSWORD: &str = "Password";
pub const FIELD_URL: &str = "URL";
pub const FIELD_NOTES: &str = "Notes";

/// A named entry field with its protection flag.
///
/// The value is wiped on drop; protected values spend their on-disk
/// life additionally encrypted by the inner stream cipher, but inside
/// the tree they are plain (name, value, protected) triples — masking
/// for display is the UI's business.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EntryField {
    pub name: String,
    pub value: String,
    pub protected: bool,
}

impl EntryField {
    #[must_use]
    pub const fn new(name: String, value: String, protected: bool) -> Self {
        Self {
            name,
            value,
            protected,
        }
    }
}

/// An entry attachment. `binary_id` is pool-internal bookkeeping,
/// reassigned by the pool rebuild on every save.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub(crate) binary_id: usize,
    pub compressed: bool,
    pub data: Vec<u8>,
}

impl Attachment {
    #[must_use]
    pub const fn new(name: String, compressed: bool, data: Vec<u8>) -> Self {
        Self {
            name,
            binary_id: 0,
            compressed,
            data,
        }
    }

    /// Current binary-pool reference of this attachment.
    #[must_use]
    pub const fn binary_id(&self) -> usize {
        self.binary_id
    }
}

/// Auto-type window/keystroke association.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AutoTypeAssociation {
    pub window: String,
    pub sequence: String,
}

/// Auto-type configuration of an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoType {
    pub enabled: bool,
    pub obfuscation: u32,
    pub default_sequence: String,
    pub associations: Vec<AutoTypeAssociation>,
}

impl Default for AutoType {
    fn default() -> Self {
        Self {
            enabled: true,
            obfuscation: 0,
            default_sequence: String::new(),
            associations: Vec::new(),
        }
    }
}

/// Timestamps shared by groups and entries (the XML `Times` block).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Times {
    pub creation: DateTime<Utc>,
    pub last_modification: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub expires: bool,
    pub usage_count: u32,
    pub location_changed: DateTime<Utc>,
}

impl Times {
    /// All timestamps set to `now`, non-expiring, zero usage.
    #[must_use]
    pub const fn new_at(now: DateTime<Utc>) -> Self {
        Self {
            creation: now,
            last_modification: now,
            last_access: now,
            expiry: now,
            expires: false,
            usage_count: 0,
            location_changed: now,
        }
    }

    /// Register an access: bump the access time and usage counter.
    pub fn accessed(&mut self, now: DateTime<Utc>) {
        self.last_access = now;
        self.usage_count = self.usage_count.saturating_add(1);
    }
}

/// A password entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub uuid: Uuid,
    pub icon_id: u32,
    pub custom_icon_uuid: Uuid,
    pub foreground_color: String,
    pub background_color: String,
    pub override_url: String,
    pub tags: String,
    pub fields: Vec<EntryField>,
    pub attachments: Vec<Attachment>,
    pub times: Times,
    pub auto_type: AutoType,
    pub custom_data: CustomData,
    /// Prior full snapshots, most recent first. Snapshots never carry
    /// their own history.
    pub history: Vec<Entry>,
    pub is_deleted: bool,
    pub(crate) parent: Option<GroupId>,
}

/// Default icon for new entries ("key").
pub const ENTRY_DEFAULT_ICON: u32 = 0;

impl Entry {
    /// A fresh empty entry with a random UUID.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            icon_id: ENTRY_DEFAULT_ICON,
            custom_icon_uuid: Uuid::nil(),
            foreground_color: String::new(),
            background_color: String::new(),
            override_url: String::new(),
            tags: String::new(),
            fields: Vec::new(),
            attachments: Vec::new(),
            times: Times::new_at(now),
            auto_type: AutoType::default(),
            custom_data: CustomData::default(),
            history: Vec::new(),
            is_deleted: false,
            parent: None,
        }
    }

    /// The group this entry currently belongs to (`None` for history
    /// snapshots and detached entries).
    #[must_use]
    pub const fn parent(&self) -> Option<GroupId> {
        self.parent
    }

    /// Look up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&EntryField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field value by name, empty string when absent.
    #[must_use]
    pub fn field_value(&self, name: &str) -> &str {
        self.field(name).map_or("", |f| f.value.as_str())
    }

    /// Set or replace a field.
    pub fn set_field(&mut self, name: &str, value: &str, protected: bool) {
        if let Some(field) = self.fields.iter_mut().find(|f| f.name == name) {
            field.value.zeroize();
            field.value = value.to_owned();
            field.protected = protected;
        } else {
            self.fields
                .push(EntryField::new(name.to_owned(), value.to_owned(), protected));
        }
    }

    #[must_use]
    pub fn title(&self) -> &str {
        self.field_value(FIELD_TITLE)
    }

    #[must_use]
    pub fn username(&self) -> &str {
        self.field_value(FIELD_USERNAME)
    }

    #[must_use]
    pub fn password(&self) -> &str {
        self.field_value(FIELD_PASSWORD)
    }

    /// Clone this entry without its history, for use as a history
    /// snapshot. KDBX history items keep the live entry's UUID.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        let mut clone = self.clone();
        clone.history.clear();
        clone.parent = None;
        clone
    }

    /// Prepend the current state to history and trim to the retention
    /// limit. A negative `history_max_items` means unlimited.
    pub fn backup_state(&mut self, history_max_items: i32) {
        let snapshot = self.snapshot();
        self.history.insert(0, snapshot);
        self.maintain_history_size(history_max_items);
    }

    /// Drop the oldest-by-modification-time snapshots beyond the limit.
    /// The live entry itself is never pruned.
    pub fn maintain_history_size(&mut self, history_max_items: i32) {
        let Ok(max_items) = usize::try_from(history_max_items) else {
            return; // negative limit: unlimited
        };
        if self.history.len() <= max_items {
            return;
        }
        // Evict oldest first, preserving the most-recent-first order of
        // what remains.
        self.history
            .sort_by(|a, b| b.times.last_modification.cmp(&a.times.last_modification));
        self.history.truncate(max_items);
    }

    /// Pool IDs referenced by this entry's attachments, optionally
    /// including historical snapshots.
    #[must_use]
    pub fn attachment_ids(&self, include_history: bool) -> std::collections::BTreeSet<usize> {
        let mut ids: std::collections::BTreeSet<usize> =
            self.attachments.iter().map(|a| a.binary_id).collect();
        if include_history {
            for historical in &self.history {
                ids.extend(historical.attachments.iter().map(|a| a.binary_id));
            }
        }
        ids
    }

    /// Register an access (timestamp + usage counter).
    pub fn accessed(&mut self, now: DateTime<Utc>) {
        self.times.accessed(now);
    }
}

// ---------------------------------------------------------------------------
// XML codec
// ---------------------------------------------------------------------------

impl Entry {
    /// Parse an `<Entry>` element whose start tag was just consumed.
    pub(crate) fn parse<R: Read>(
        reader: &mut EventReader<R>,
        ctx: &mut ReadCtx<'_>,
        pool: &BinaryPool,
    ) -> Result<Self, ParsingError> {
        let now = Utc
            .timestamp_opt(Utc::now().timestamp(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        let mut entry = Self::new(now);
        loop {
            match next_child(reader)? {
                Child::End => return Ok(entry),
                Child::Element { name, .. } => match name.as_str() {
                    "UUID" => entry.uuid = parse_uuid(&read_text(reader)?),
                    "IconID" => {
                        entry.icon_id = read_text(reader)?
                            .trim()
                            .parse()
                            .unwrap_or(ENTRY_DEFAULT_ICON);
                    }
                    "CustomIconUUID" => {
                        entry.custom_icon_uuid = parse_uuid(&read_text(reader)?);
                    }
                    "ForegroundColor" => entry.foreground_color = read_text(reader)?,
                    "BackgroundColor" => entry.background_color = read_text(reader)?,
                    "OverrideURL" => entry.override_url = read_text(reader)?,
                    "Tags" => entry.tags = read_text(reader)?,
                    "String" => {
                        // empty (key and value both blank) fields are
                        // dropped; some clients are known to emit them
                        if let Some(field) = parse_string_field(reader, ctx)? {
                            entry.set_field(&field.name, &field.value, field.protected);
                        }
                    }
                    "Binary" => {
                        entry.attachments.push(parse_attachment(reader, pool)?);
                    }
                    "Times" => entry.times = parse_times(reader, ctx, "Entry/Times/*")?,
                    "AutoType" => entry.auto_type = parse_auto_type(reader)?,
                    "CustomData" => {
                        entry.custom_data = CustomData::parse(reader, "Entry/CustomData/*")?;
                    }
                    "History" => entry.history = parse_history(reader, ctx, pool)?,
                    _ => {
                        return Err(ParsingError::UnexpectedTag {
                            actual: name,
                            expected: "Entry/*",
                        })
                    }
                },
            }
        }
    }

    /// Serialize this entry, re-protecting standard fields per the
    /// database's memory-protection policy.
    pub(crate) fn write<W: Write>(
        &self,
        writer: &mut EventWriter<W>,
        ctx: &mut WriteCtx<'_>,
        protection: &MemoryProtection,
    ) -> Result<(), ParsingError> {
        start_element(writer, "Entry")?;
        text_element(writer, "UUID", &uuid_string(self.uuid))?;
        text_element(writer, "IconID", &self.icon_id.to_string())?;
        if !self.custom_icon_uuid.is_nil() {
            text_element(writer, "CustomIconUUID", &uuid_string(self.custom_icon_uuid))?;
        }
        text_element(writer, "ForegroundColor", &self.foreground_color)?;
        text_element(writer, "BackgroundColor", &self.background_color)?;
        text_element(writer, "OverrideURL", &self.override_url)?;
        text_element(writer, "Tags", &self.tags)?;
        write_times(writer, ctx, &self.times)?;

        for field in &self.fields {
            let protected = protection.for_field(&field.name).unwrap_or(field.protected);
            start_element(writer, "String")?;
            text_element(writer, "Key", &field.name)?;
            if protected {
                let stored = protect_value(&field.value, ctx.cipher);
                writer
                    .write(
                        xml::writer::XmlEvent::start_element("Value")
                            .attr("Protected", crate::xml::TRUE),
                    )
                    .map_err(xml_error)?;
                if !stored.is_empty() {
                    writer
                        .write(xml::writer::XmlEvent::characters(&stored))
                        .map_err(xml_error)?;
                }
                crate::xml::end_element(writer)?;
            } else {
                text_element(writer, "Value", &field.value)?;
            }
            crate::xml::end_element(writer)?;
        }

        for attachment in &self.attachments {
            // no payload here, just a ref into the binary pool
            start_element(writer, "Binary")?;
            text_element(writer, "Key", &attachment.name)?;
            let ref_string = attachment.binary_id.to_string();
            writer
                .write(xml::writer::XmlEvent::start_element("Value").attr("Ref", &ref_string))
                .map_err(xml_error)?;
            crate::xml::end_element(writer)?;
            crate::xml::end_element(writer)?;
        }

        write_auto_type(writer, &self.auto_type)?;

        if ctx.version == crate::header::FormatVersion::V4 && !self.custom_data.is_empty() {
            self.custom_data.write(writer)?;
        }

        if !self.history.is_empty() {
            start_element(writer, "History")?;
            for historical in &self.history {
                historical.write(writer, ctx, protection)?;
            }
            crate::xml::end_element(writer)?;
        }
        crate::xml::end_element(writer)
    }
}

fn parse_string_field<R: Read>(
    reader: &mut EventReader<R>,
    ctx: &mut ReadCtx<'_>,
) -> Result<Option<EntryField>, ParsingError> {
    let mut key: Option<String> = None;
    let mut value: Option<String> = None;
    let mut protected = false;
    loop {
        match next_child(reader)? {
            Child::End => break,
            Child::Element { name, attributes } => match name.as_str() {
                "Key" => key = Some(read_text(reader)?),
                "Value" => {
                    protected = attr(&attributes, "Protected").is_some_and(parse_bool);
                    let text = read_text(reader)?;
                    value = if protected {
                        unprotect_value(&text, ctx.cipher)
                    } else {
                        Some(text)
                    };
                }
                _ => {
                    return Err(ParsingError::UnexpectedTag {
                        actual: name,
                        expected: "Entry/String/*",
                    })
                }
            },
        }
    }
    let key = key.ok_or(ParsingError::MalformedValue {
        tag: "Entry/String/Key",
    })?;
    let value = value.ok_or(ParsingError::MalformedValue {
        tag: "Entry/String/Value",
    })?;
    if key.is_empty() && !value.is_empty() {
        return Err(ParsingError::MalformedValue {
            tag: "Entry/String/Key",
        });
    }
    if key.is_empty() && value.is_empty() {
        return Ok(None);
    }
    Ok(Some(EntryField::new(key, value, protected)))
}

fn parse_attachment<R: Read>(
    reader: &mut EventReader<R>,
    pool: &BinaryPool,
) -> Result<Attachment, ParsingError> {
    let mut name: Option<String> = None;
    let mut resolved: Option<(usize, bool, Vec<u8>)> = None;
    loop {
        match next_child(reader)? {
            Child::End => break,
            Child::Element {
                name: tag,
                attributes,
            } => match tag.as_str() {
                "Key" => name = Some(read_text(reader)?),
                "Value" => {
                    let id: usize = attr(&attributes, "Ref")
                        .and_then(|s| s.trim().parse().ok())
                        .ok_or(ParsingError::MalformedValue {
                            tag: "Entry/Binary/Value/Ref",
                        })?;
                    read_text(reader)?; // consume the (empty) element body
                    let binary = pool.get(id).ok_or(ParsingError::MalformedValue {
                        tag: "Entry/Binary/Value/Ref",
                    })?;
                    resolved = Some((id, binary.compressed, binary.data.clone()));
                }
                _ => {
                    return Err(ParsingError::UnexpectedTag {
                        actual: tag,
                        expected: "Entry/Binary/*",
                    })
                }
            },
        }
    }
    let name = name.ok_or(ParsingError::MalformedValue {
        tag: "Entry/Binary/Key",
    })?;
    let (binary_id, compressed, data) = resolved.ok_or(ParsingError::MalformedValue {
        tag: "Entry/Binary/Value",
    })?;
    Ok(Attachment {
        name,
        binary_id,
        compressed,
        data,
    })
}

fn parse_auto_type<R: Read>(reader: &mut EventReader<R>) -> Result<AutoType, ParsingError> {
    let mut auto_type = AutoType::default();
    loop {
        match next_child(reader)? {
            Child::End => return Ok(auto_type),
            Child::Element { name, .. } => match name.as_str() {
                "Enabled" => auto_type.enabled = parse_bool(&read_text(reader)?),
                "DataTransferObfuscation" => {
                    auto_type.obfuscation = read_text(reader)?.trim().parse().unwrap_or(0);
                }
                "DefaultSequence" => auto_type.default_sequence = read_text(reader)?,
                "Association" => {
                    let mut window: Option<String> = None;
                    let mut sequence: Option<String> = None;
                    loop {
                        match next_child(reader)? {
                            Child::End => break,
                            Child::Element { name, .. } => match name.as_str() {
                                "Window" => window = Some(read_text(reader)?),
                                "KeystrokeSequence" => sequence = Some(read_text(reader)?),
                                _ => {
                                    return Err(ParsingError::UnexpectedTag {
                                        actual: name,
                                        expected: "Entry/AutoType/Association/*",
                                    })
                                }
                            },
                        }
                    }
                    auto_type.associations.push(AutoTypeAssociation {
                        window: window.ok_or(ParsingError::MalformedValue {
                            tag: "Entry/AutoType/Association/Window",
                        })?,
                        sequence: sequence.ok_or(ParsingError::MalformedValue {
                            tag: "Entry/AutoType/Association/Sequence",
                        })?,
                    });
                }
                _ => {
                    return Err(ParsingError::UnexpectedTag {
                        actual: name,
                        expected: "Entry/AutoType/*",
                    })
                }
            },
        }
    }
}

fn write_auto_type<W: Write>(
    writer: &mut EventWriter<W>,
    auto_type: &AutoType,
) -> Result<(), ParsingError> {
    start_element(writer, "AutoType")?;
    text_element(writer, "Enabled", bool_str(auto_type.enabled))?;
    text_element(
        writer,
        "DataTransferObfuscation",
        &auto_type.obfuscation.to_string(),
    )?;
    if !auto_type.default_sequence.is_empty() {
        text_element(writer, "DefaultSequence", &auto_type.default_sequence)?;
    }
    for association in &auto_type.associations {
        start_element(writer, "Association")?;
        text_element(writer, "Window", &association.window)?;
        text_element(writer, "KeystrokeSequence", &association.sequence)?;
        crate::xml::end_element(writer)?;
    }
    crate::xml::end_element(writer)
}

fn parse_history<R: Read>(
    reader: &mut EventReader<R>,
    ctx: &mut ReadCtx<'_>,
    pool: &BinaryPool,
) -> Result<Vec<Entry>, ParsingError> {
    let mut history = Vec::new();
    loop {
        match next_child(reader)? {
            Child::End => return Ok(history),
            Child::Element { name, .. } => {
                if name != "Entry" {
                    return Err(ParsingError::UnexpectedTag {
                        actual: name,
                        expected: "Entry/History/*",
                    });
                }
                history.push(Entry::parse(reader, ctx, pool)?);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
