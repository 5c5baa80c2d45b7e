//! Database metadata: names, protection defaults, recycle bin state,
//! history limits, custom icons, and (v3) the XML-borne binary pool.

use crate::binaries::{Binary, BinaryPool};
use crate::error::ParsingError;
use crate::header::FormatVersion;
use crate::xml::{
    attr, bool_str, format_date, next_child, parse_bool, parse_date, parse_uuid, read_text,
    start_element, text_element, uuid_string, xml_error, Child, ReadCtx, WriteCtx,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use std::io::{Read, Write};
use tracing::{debug, info, warn};
use uuid::Uuid;
use xml::reader::EventReader;
use xml::writer::EventWriter;

/// Generator name written into saved databases.
pub const GENERATOR_NAME: &str = "COFFRE";

/// Default `MaintenanceHistoryDays`.
pub const DEFAULT_MAINTENANCE_HISTORY_DAYS: u32 = 365;
/// Default history item cap (-1 is unlimited).
pub const DEFAULT_HISTORY_MAX_ITEMS: i32 = 10;
/// Default history size cap in bytes (-1 is unlimited).
pub const DEFAULT_HISTORY_MAX_SIZE: i64 = 6 * 1024 * 1024;

/// Per-field memory-protection defaults for the standard fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryProtection {
    pub protect_title: bool,
    pub protect_username: bool,
    pub protect_password: bool,
    pub protect_url: bool,
    pub protect_notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_username: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

impl MemoryProtection {
    /// The protection default for a standard field, `None` for custom
    /// fields (their flag is per-field, not policy-driven).
    #[must_use]
    pub fn for_field(&self, name: &str) -> Option<bool> {
        match name {
            crate::entry::FIELD_TITLE => Some(self.protect_title),
            crate::entry::FIELD_USERNAME => Some(self.protect_username),
            crate::entry::FIELD_PASSWORD => Some(self.protect_password),
            crate::entry::FIELD_URL => Some(self.protect_url),
            crate::entry::FIELD_NOTES => Some(self.protect_notes),
            _ => None,
        }
    }

    fn parse<R: Read>(reader: &mut EventReader<R>) -> Result<Self, ParsingError> {
        let mut mp = Self::default();
        loop {
            match next_child(reader)? {
                Child::End => return Ok(mp),
                Child::Element { name, .. } => {
                    let text = read_text(reader)?;
                    match name.as_str() {
                        "ProtectTitle" => mp.protect_title = parse_bool(&text),
                        "ProtectUserName" => mp.protect_username = parse_bool(&text),
                        "ProtectPassword" => mp.protect_password = parse_bool(&text),
                        "ProtectURL" => mp.protect_url = parse_bool(&text),
                        "ProtectNotes" => mp.protect_notes = parse_bool(&text),
                        _ => {
                            return Err(ParsingError::UnexpectedTag {
                                actual: name,
                                expected: "Meta/MemoryProtection/*",
                            })
                        }
                    }
                }
            }
        }
    }

    fn write<W: Write>(&self, writer: &mut EventWriter<W>) -> Result<(), ParsingError> {
        start_element(writer, "MemoryProtection")?;
        text_element(writer, "ProtectTitle", bool_str(self.protect_title))?;
        text_element(writer, "ProtectUserName", bool_str(self.protect_username))?;
        text_element(writer, "ProtectPassword", bool_str(self.protect_password))?;
        text_element(writer, "ProtectURL", bool_str(self.protect_url))?;
        text_element(writer, "ProtectNotes", bool_str(self.protect_notes))?;
        crate::xml::end_element(writer)
    }
}

/// A custom icon: UUID plus raw image bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomIcon {
    pub uuid: Uuid,
    pub data: Vec<u8>,
}

/// String key/value items attached to Meta, groups and entries (v4).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CustomData {
    pub items: Vec<(String, String)>,
}

impl CustomData {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn parse<R: Read>(
        reader: &mut EventReader<R>,
        expected: &'static str,
    ) -> Result<Self, ParsingError> {
        let mut data = Self::default();
        loop {
            match next_child(reader)? {
                Child::End => return Ok(data),
                Child::Element { name, .. } => {
                    if name != "Item" {
                        return Err(ParsingError::UnexpectedTag {
                            actual: name,
                            expected,
                        });
                    }
                    let mut key = None;
                    let mut value = None;
                    loop {
                        match next_child(reader)? {
                            Child::End => break,
                            Child::Element { name, .. } => {
                                let text = read_text(reader)?;
                                match name.as_str() {
                                    "Key" => key = Some(text),
                                    "Value" => value = Some(text),
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
                    let key = key.ok_or(ParsingError::MalformedValue {
                        tag: "CustomData/Item/Key",
                    })?;
                    let value = value.ok_or(ParsingError::MalformedValue {
                        tag: "CustomData/Item/Value",
                    })?;
                    data.items.push((key, value));
                }
            }
        }
    }

    pub(crate) fn write<W: Write>(
        &self,
        writer: &mut EventWriter<W>,
    ) -> Result<(), ParsingError> {
        start_element(writer, "CustomData")?;
        for (key, value) in &self.items {
            start_element(writer, "Item")?;
            text_element(writer, "Key", key)?;
            text_element(writer, "Value", value)?;
            crate::xml::end_element(writer)?;
        }
        crate::xml::end_element(writer)
    }
}

/// Database metadata (the XML `Meta` block).
#[derive(Clone, Debug, PartialEq)]
pub struct Meta {
    pub generator: String,
    /// v3 only: the outer header hash as recorded inside the payload.
    pub header_hash: Option<Vec<u8>>,
    pub settings_changed: DateTime<Utc>,
    pub database_name: String,
    pub database_name_changed: DateTime<Utc>,
    pub database_description: String,
    pub database_description_changed: DateTime<Utc>,
    pub default_username: String,
    pub default_username_changed: DateTime<Utc>,
    pub maintenance_history_days: u32,
    /// CSS-style hex color, empty for transparent.
    pub color: String,
    pub master_key_changed: DateTime<Utc>,
    pub master_key_change_rec: i64,
    pub master_key_change_force: i64,
    pub memory_protection: MemoryProtection,
    pub recycle_bin_enabled: bool,
    pub recycle_bin_uuid: Uuid,
    pub recycle_bin_changed: DateTime<Utc>,
    pub entry_templates_group: Uuid,
    pub entry_templates_group_changed: DateTime<Utc>,
    pub history_max_items: i32,
    pub history_max_size: i64,
    pub last_selected_group: Uuid,
    pub last_top_visible_group: Uuid,
    pub custom_icons: Vec<CustomIcon>,
    pub custom_data: CustomData,
}

impl Default for Meta {
    fn default() -> Self {
        let now = Utc
            .timestamp_opt(Utc::now().timestamp(), 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            generator: String::new(),
            header_hash: None,
            settings_changed: now,
            database_name: String::new(),
            database_name_changed: now,
            database_description: String::new(),
            database_description_changed: now,
            default_username: String::new(),
            default_username_changed: now,
            maintenance_history_days: DEFAULT_MAINTENANCE_HISTORY_DAYS,
            color: String::new(),
            master_key_changed: now,
            master_key_change_rec: -1,
            master_key_change_force: -1,
            memory_protection: MemoryProtection::default(),
            recycle_bin_enabled: true,
            recycle_bin_uuid: Uuid::nil(),
            recycle_bin_changed: now,
            entry_templates_group: Uuid::nil(),
            entry_templates_group_changed: now,
            history_max_items: DEFAULT_HISTORY_MAX_ITEMS,
            history_max_size: DEFAULT_HISTORY_MAX_SIZE,
            last_selected_group: Uuid::nil(),
            last_top_visible_group: Uuid::nil(),
            custom_icons: Vec::new(),
            custom_data: CustomData::default(),
        }
    }
}

impl Meta {
    /// Set every maintained timestamp to `time` (new-database init).
    pub fn set_all_timestamps(&mut self, time: DateTime<Utc>) {
        self.settings_changed = time;
        self.database_name_changed = time;
        self.database_description_changed = time;
        self.default_username_changed = time;
        self.master_key_changed = time;
        self.recycle_bin_changed = time;
        self.entry_templates_group_changed = time;
    }

    #[allow(clippy::too_many_lines)]
    pub(crate) fn parse<R: Read>(
        reader: &mut EventReader<R>,
        ctx: &mut ReadCtx<'_>,
        pool: &mut BinaryPool,
    ) -> Result<Self, ParsingError> {
        let mut meta = Self::default();
        loop {
            match next_child(reader)? {
                Child::End => return Ok(meta),
                Child::Element { name, .. } => match name.as_str() {
                    "Generator" => {
                        meta.generator = read_text(reader)?;
                        info!(generator = %meta.generator, "database was last edited by");
                    }
                    "SettingsChanged" => {
                        // v4 only
                        if ctx.version != FormatVersion::V4 {
                            return Err(ParsingError::UnexpectedTag {
                                actual: name,
                                expected: "Meta/*",
                            });
                        }
                        let text = read_text(reader)?;
                        meta.settings_changed =
                            parse_date(ctx.version, &text).unwrap_or(meta.settings_changed);
                    }
                    "HeaderHash" => {
                        let text = read_text(reader)?;
                        if ctx.version == FormatVersion::V3 {
                            meta.header_hash = BASE64.decode(text.trim()).ok();
                        } else {
                            // sometimes left behind by v3→v4 conversion;
                            // harmless, so log and ignore
                            warn!("HeaderHash tag in a non-v3 database, ignoring");
                        }
                    }
                    "DatabaseName" => meta.database_name = read_text(reader)?,
                    "DatabaseNameChanged" => {
                        let text = read_text(reader)?;
                        meta.database_name_changed =
                            parse_date(ctx.version, &text).unwrap_or(meta.database_name_changed);
                    }
                    "DatabaseDescription" => meta.database_description = read_text(reader)?,
                    "DatabaseDescriptionChanged" => {
                        let text = read_text(reader)?;
                        meta.database_description_changed = parse_date(ctx.version, &text)
                            .unwrap_or(meta.database_description_changed);
                    }
                    "DefaultUserName" => meta.default_username = read_text(reader)?,
                    "DefaultUserNameChanged" => {
                        let text = read_text(reader)?;
                        meta.default_username_changed =
                            parse_date(ctx.version, &text).unwrap_or(meta.default_username_changed);
                    }
                    "MaintenanceHistoryDays" => {
                        meta.maintenance_history_days = read_text(reader)?
                            .trim()
                            .parse()
                            .unwrap_or(DEFAULT_MAINTENANCE_HISTORY_DAYS);
                    }
                    "Color" => meta.color = read_text(reader)?,
                    "MasterKeyChanged" => {
                        let text = read_text(reader)?;
                        meta.master_key_changed =
                            parse_date(ctx.version, &text).unwrap_or(meta.master_key_changed);
                    }
                    "MasterKeyChangeRec" => {
                        meta.master_key_change_rec =
                            read_text(reader)?.trim().parse().unwrap_or(-1);
                    }
                    "MasterKeyChangeForce" => {
                        meta.master_key_change_force =
                            read_text(reader)?.trim().parse().unwrap_or(-1);
                    }
                    "MemoryProtection" => {
                        meta.memory_protection = MemoryProtection::parse(reader)?;
                    }
                    "CustomIcons" => meta.custom_icons = parse_custom_icons(reader)?,
                    "RecycleBinEnabled" => {
                        meta.recycle_bin_enabled = parse_bool(&read_text(reader)?);
                    }
                    "RecycleBinUUID" => meta.recycle_bin_uuid = parse_uuid(&read_text(reader)?),
                    "RecycleBinChanged" => {
                        let text = read_text(reader)?;
                        meta.recycle_bin_changed =
                            parse_date(ctx.version, &text).unwrap_or(meta.recycle_bin_changed);
                    }
                    "EntryTemplatesGroup" => {
                        meta.entry_templates_group = parse_uuid(&read_text(reader)?);
                    }
                    "EntryTemplatesGroupChanged" => {
                        let text = read_text(reader)?;
                        meta.entry_templates_group_changed = parse_date(ctx.version, &text)
                            .unwrap_or(meta.entry_templates_group_changed);
                    }
                    "HistoryMaxItems" => {
                        meta.history_max_items = read_text(reader)?.trim().parse().unwrap_or(-1);
                    }
                    "HistoryMaxSize" => {
                        meta.history_max_size = read_text(reader)?.trim().parse().unwrap_or(-1);
                    }
                    "LastSelectedGroup" => {
                        meta.last_selected_group = parse_uuid(&read_text(reader)?);
                    }
                    "LastTopVisibleGroup" => {
                        meta.last_top_visible_group = parse_uuid(&read_text(reader)?);
                    }
                    "Binaries" => parse_binaries(reader, ctx, pool)?,
                    "CustomData" => {
                        meta.custom_data = CustomData::parse(reader, "Meta/CustomData/*")?;
                    }
                    _ => {
                        return Err(ParsingError::UnexpectedTag {
                            actual: name,
                            expected: "Meta/*",
                        })
                    }
                },
            }
        }
    }

    pub(crate) fn write<W: Write>(
        &self,
        writer: &mut EventWriter<W>,
        ctx: &mut WriteCtx<'_>,
        pool: &BinaryPool,
    ) -> Result<(), ParsingError> {
        start_element(writer, "Meta")?;
        // the generator is always replaced with this implementation's name
        text_element(writer, "Generator", GENERATOR_NAME)?;
        match ctx.version {
            FormatVersion::V3 => {
                if let Some(hash) = &self.header_hash {
                    text_element(writer, "HeaderHash", &BASE64.encode(hash))?;
                }
            }
            FormatVersion::V4 => {
                text_element(
                    writer,
                    "SettingsChanged",
                    &format_date(ctx.version, self.settings_changed),
                )?;
            }
        }
        text_element(writer, "DatabaseName", &self.database_name)?;
        text_element(
            writer,
            "DatabaseNameChanged",
            &format_date(ctx.version, self.database_name_changed),
        )?;
        text_element(writer, "DatabaseDescription", &self.database_description)?;
        text_element(
            writer,
            "DatabaseDescriptionChanged",
            &format_date(ctx.version, self.database_description_changed),
        )?;
        text_element(writer, "DefaultUserName", &self.default_username)?;
        text_element(
            writer,
            "DefaultUserNameChanged",
            &format_date(ctx.version, self.default_username_changed),
        )?;
        text_element(
            writer,
            "MaintenanceHistoryDays",
            &self.maintenance_history_days.to_string(),
        )?;
        text_element(writer, "Color", &self.color)?;
        text_element(
            writer,
            "MasterKeyChanged",
            &format_date(ctx.version, self.master_key_changed),
        )?;
        text_element(
            writer,
            "MasterKeyChangeRec",
            &self.master_key_change_rec.to_string(),
        )?;
        text_element(
            writer,
            "MasterKeyChangeForce",
            &self.master_key_change_force.to_string(),
        )?;
        self.memory_protection.write(writer)?;
        text_element(
            writer,
            "RecycleBinEnabled",
            bool_str(self.recycle_bin_enabled),
        )?;
        text_element(writer, "RecycleBinUUID", &uuid_string(self.recycle_bin_uuid))?;
        text_element(
            writer,
            "RecycleBinChanged",
            &format_date(ctx.version, self.recycle_bin_changed),
        )?;
        text_element(
            writer,
            "EntryTemplatesGroup",
            &uuid_string(self.entry_templates_group),
        )?;
        text_element(
            writer,
            "EntryTemplatesGroupChanged",
            &format_date(ctx.version, self.entry_templates_group_changed),
        )?;
        text_element(writer, "HistoryMaxItems", &self.history_max_items.to_string())?;
        text_element(writer, "HistoryMaxSize", &self.history_max_size.to_string())?;
        text_element(
            writer,
            "LastSelectedGroup",
            &uuid_string(self.last_selected_group),
        )?;
        text_element(
            writer,
            "LastTopVisibleGroup",
            &uuid_string(self.last_top_visible_group),
        )?;
        if !self.custom_icons.is_empty() {
            start_element(writer, "CustomIcons")?;
            for icon in &self.custom_icons {
                start_element(writer, "Icon")?;
                text_element(writer, "UUID", &uuid_string(icon.uuid))?;
                text_element(writer, "Data", &BASE64.encode(&icon.data))?;
                crate::xml::end_element(writer)?;
            }
            crate::xml::end_element(writer)?;
        }
        if ctx.version == FormatVersion::V3 && !pool.is_empty() {
            // v3 stores the binary pool in Meta; v4 keeps it in the
            // inner header instead
            write_binaries(writer, ctx, pool)?;
            debug!("meta binaries written OK");
        }
        self.custom_data.write(writer)?;
        crate::xml::end_element(writer)
    }
}

fn parse_custom_icons<R: Read>(
    reader: &mut EventReader<R>,
) -> Result<Vec<CustomIcon>, ParsingError> {
    let mut icons = Vec::new();
    loop {
        match next_child(reader)? {
            Child::End => return Ok(icons),
            Child::Element { name, .. } => {
                if name != "Icon" {
                    return Err(ParsingError::UnexpectedTag {
                        actual: name,
                        expected: "Meta/CustomIcons/*",
                    });
                }
                let mut uuid = None;
                let mut data = None;
                loop {
                    match next_child(reader)? {
                        Child::End => break,
                        Child::Element { name, .. } => {
                            let text = read_text(reader)?;
                            match name.as_str() {
                                "UUID" => uuid = Some(parse_uuid(&text)),
                                "Data" => {
                                    data = Some(BASE64.decode(text.trim()).map_err(|_| {
                                        ParsingError::MalformedValue {
                                            tag: "CustomIcon/Data",
                                        }
                                    })?);
                                }
                                _ => {
                                    return Err(ParsingError::UnexpectedTag {
                                        actual: name,
                                        expected: "CustomIcon/*",
                                    })
                                }
                            }
                        }
                    }
                }
                let uuid = uuid.ok_or(ParsingError::MalformedValue {
                    tag: "CustomIcon/UUID",
                })?;
                let data = data.ok_or(ParsingError::MalformedValue {
                    tag: "CustomIcon/Data",
                })?;
                icons.push(CustomIcon { uuid, data });
            }
        }
    }
}

fn parse_binaries<R: Read>(
    reader: &mut EventReader<R>,
    ctx: &mut ReadCtx<'_>,
    pool: &mut BinaryPool,
) -> Result<(), ParsingError> {
    loop {
        match next_child(reader)? {
            Child::End => return Ok(()),
            Child::Element { name, attributes } => {
                if name != "Binary" {
                    return Err(ParsingError::UnexpectedTag {
                        actual: name,
                        expected: "Meta/Binaries/*",
                    });
                }
                let id: usize = attr(&attributes, "ID")
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or(ParsingError::MalformedValue {
                        tag: "Meta/Binary/ID",
                    })?;
                let compressed = attr(&attributes, "Compressed").is_some_and(parse_bool);
                let protected = attr(&attributes, "Protected").is_some_and(parse_bool);
                let text = read_text(reader)?;
                let mut data =
                    BASE64
                        .decode(text.trim())
                        .map_err(|_| ParsingError::MalformedValue {
                            tag: "Meta/Binary/Value",
                        })?;
                if protected {
                    ctx.cipher.apply(&mut data);
                }
                if !pool.insert(id, Binary::new(data, compressed, protected)) {
                    return Err(ParsingError::MalformedValue {
                        tag: "Meta/Binary/ID",
                    });
                }
            }
        }
    }
}

fn write_binaries<W: Write>(
    writer: &mut EventWriter<W>,
    ctx: &mut WriteCtx<'_>,
    pool: &BinaryPool,
) -> Result<(), ParsingError> {
    start_element(writer, "Binaries")?;
    for (id, binary) in pool.iter() {
        let id_string = id.to_string();
        let mut element = xml::writer::XmlEvent::start_element("Binary")
            .attr("ID", &id_string)
            .attr("Compressed", bool_str(binary.compressed));
        if binary.protected {
            element = element.attr("Protected", crate::xml::TRUE);
        }
        writer.write(element).map_err(xml_error)?;
        let encoded = if binary.protected {
            let mut data = binary.data.clone();
            ctx.cipher.apply(&mut data);
            BASE64.encode(&data)
        } else {
            BASE64.encode(&binary.data)
        };
        if !encoded.is_empty() {
            writer
                .write(xml::writer::XmlEvent::characters(&encoded))
                .map_err(xml_error)?;
        }
        crate::xml::end_element(writer)?;
    }
    crate::xml::end_element(writer)
}
