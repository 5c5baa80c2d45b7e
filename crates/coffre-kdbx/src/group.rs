//! Groups: named, ordered containers of subgroups and entries.

use crate::entry::{Entry, Times};
use crate::error::ParsingError;
use crate::meta::{CustomData, Meta};
use crate::tree::{GroupId, NodeId, Tree};
use crate::xml::{
    bool_str, next_child, parse_bool, parse_optional_bool, parse_times, parse_uuid, read_text,
    start_element, text_element, uuid_string, write_times, Child, ReadCtx, WriteCtx, NULL,
};
use chrono::{DateTime, TimeZone, Utc};
use std::io::{Read, Write};
use tracing::debug;
use uuid::Uuid;
use xml::reader::EventReader;
use xml::writer::EventWriter;

/// Default icon for groups ("folder").
pub const GROUP_DEFAULT_ICON: u32 = 48;
/// Icon used for the recycle bin group.
pub const GROUP_TRASH_ICON: u32 = 43;

/// A group node. Children keep document order; ownership lives in the
/// [`crate::tree::Tree`] arena, the group only records ids.
#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    pub uuid: Uuid,
    pub name: String,
    pub notes: String,
    pub icon_id: u32,
    pub custom_icon_uuid: Uuid,
    pub times: Times,
    pub is_expanded: bool,
    pub default_auto_type_sequence: String,
    /// Tri-state: `Some(true)`/`Some(false)`/unset ("null" in XML).
    pub enable_auto_type: Option<bool>,
    /// Tri-state, same encoding as auto-type.
    pub enable_searching: Option<bool>,
    pub last_top_visible_entry: Uuid,
    pub custom_data: CustomData,
    pub is_deleted: bool,
    pub(crate) parent: Option<GroupId>,
    pub(crate) children: Vec<NodeId>,
}

impl Group {
    /// A fresh empty group with a random UUID.
    #[must_use]
    pub fn new(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.to_owned(),
            notes: String::new(),
            icon_id: GROUP_DEFAULT_ICON,
            custom_icon_uuid: Uuid::nil(),
            times: Times::new_at(now),
            is_expanded: true,
            default_auto_type_sequence: String::new(),
            enable_auto_type: None,
            enable_searching: None,
            last_top_visible_entry: Uuid::nil(),
            custom_data: CustomData::default(),
            is_deleted: false,
            parent: None,
            children: Vec::new(),
        }
    }

    /// The parent group (`None` for the root).
    #[must_use]
    pub const fn parent(&self) -> Option<GroupId> {
        self.parent
    }

    /// Ordered child node ids (subgroups and entries interleaved).
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Register an access (timestamp + usage counter).
    pub fn accessed(&mut self, now: DateTime<Utc>) {
        self.times.accessed(now);
    }
}

// ---------------------------------------------------------------------------
// XML codec
// ---------------------------------------------------------------------------

/// Parse the top-level `<Group>` (whose start tag was just consumed)
/// into a fresh tree.
pub(crate) fn parse_group_tree<R: Read>(
    reader: &mut EventReader<R>,
    ctx: &mut ReadCtx<'_>,
    meta: &Meta,
    pool: &crate::binaries::BinaryPool,
) -> Result<Tree, ParsingError> {
    let now = Utc
        .timestamp_opt(Utc::now().timestamp(), 0)
        .single()
        .unwrap_or_else(Utc::now);
    let mut tree = Tree::new(Group::new("", now));
    let root = tree.root_id();
    parse_group_into(reader, ctx, meta, pool, &mut tree, root)?;
    Ok(tree)
}

#[allow(clippy::too_many_lines)]
fn parse_group_into<R: Read>(
    reader: &mut EventReader<R>,
    ctx: &mut ReadCtx<'_>,
    meta: &Meta,
    pool: &crate::binaries::BinaryPool,
    tree: &mut Tree,
    group_id: GroupId,
) -> Result<(), ParsingError> {
    let detached = || ParsingError::Xml("group detached from arena".into());
    loop {
        match next_child(reader)? {
            Child::End => {
                debug!("group loaded OK");
                return Ok(());
            }
            Child::Element { name, .. } => match name.as_str() {
                "UUID" => {
                    let uuid = parse_uuid(&read_text(reader)?);
                    let is_backup = uuid == meta.recycle_bin_uuid && meta.recycle_bin_enabled;
                    let group = tree.group_mut(group_id).ok_or_else(detached)?;
                    group.uuid = uuid;
                    if is_backup {
                        // may also be flagged higher in the call stack
                        group.is_deleted = true;
                    }
                }
                "Name" => {
                    tree.group_mut(group_id).ok_or_else(detached)?.name = read_text(reader)?;
                }
                "Notes" => {
                    tree.group_mut(group_id).ok_or_else(detached)?.notes = read_text(reader)?;
                }
                "IconID" => {
                    let icon = read_text(reader)?.trim().parse().unwrap_or(GROUP_DEFAULT_ICON);
                    tree.group_mut(group_id).ok_or_else(detached)?.icon_id = icon;
                }
                "CustomIconUUID" => {
                    tree.group_mut(group_id).ok_or_else(detached)?.custom_icon_uuid =
                        parse_uuid(&read_text(reader)?);
                }
                "Times" => {
                    let times = parse_times(reader, ctx, "Group/Times/*")?;
                    tree.group_mut(group_id).ok_or_else(detached)?.times = times;
                }
                "IsExpanded" => {
                    let expanded = parse_bool(&read_text(reader)?);
                    tree.group_mut(group_id).ok_or_else(detached)?.is_expanded = expanded;
                }
                "DefaultAutoTypeSequence" => {
                    tree.group_mut(group_id)
                        .ok_or_else(detached)?
                        .default_auto_type_sequence = read_text(reader)?;
                }
                "EnableAutoType" => {
                    let flag = parse_optional_bool(&read_text(reader)?);
                    tree.group_mut(group_id).ok_or_else(detached)?.enable_auto_type = flag;
                }
                "EnableSearching" => {
                    let flag = parse_optional_bool(&read_text(reader)?);
                    tree.group_mut(group_id).ok_or_else(detached)?.enable_searching = flag;
                }
                "LastTopVisibleEntry" => {
                    tree.group_mut(group_id)
                        .ok_or_else(detached)?
                        .last_top_visible_entry = parse_uuid(&read_text(reader)?);
                }
                "CustomData" => {
                    let data = CustomData::parse(reader, "Group/CustomData/*")?;
                    tree.group_mut(group_id).ok_or_else(detached)?.custom_data = data;
                }
                "Group" => {
                    let is_deleted = tree.group(group_id).ok_or_else(detached)?.is_deleted;
                    let mut subgroup = Group::new("", Utc::now());
                    subgroup.is_deleted = is_deleted;
                    let sub_id = tree.add_group(group_id, subgroup);
                    parse_group_into(reader, ctx, meta, pool, tree, sub_id)?;
                }
                "Entry" => {
                    let is_deleted = tree.group(group_id).ok_or_else(detached)?.is_deleted;
                    let mut entry = Entry::parse(reader, ctx, pool)?;
                    entry.is_deleted = entry.is_deleted || is_deleted;
                    tree.add_entry(group_id, entry);
                }
                _ => {
                    return Err(ParsingError::UnexpectedTag {
                        actual: name,
                        expected: "Group/*",
                    })
                }
            },
        }
    }
}

/// Serialize the whole tree starting at the root group.
pub(crate) fn write_group_tree<W: Write>(
    writer: &mut EventWriter<W>,
    ctx: &mut WriteCtx<'_>,
    tree: &Tree,
    meta: &Meta,
) -> Result<(), ParsingError> {
    write_group(writer, ctx, tree, tree.root_id(), meta)
}

fn write_group<W: Write>(
    writer: &mut EventWriter<W>,
    ctx: &mut WriteCtx<'_>,
    tree: &Tree,
    group_id: GroupId,
    meta: &Meta,
) -> Result<(), ParsingError> {
    let group = tree
        .group(group_id)
        .ok_or_else(|| ParsingError::Xml("group detached from arena".into()))?;

    start_element(writer, "Group")?;
    text_element(writer, "UUID", &uuid_string(group.uuid))?;
    text_element(writer, "Name", &group.name)?;
    text_element(writer, "Notes", &group.notes)?;
    text_element(writer, "IconID", &group.icon_id.to_string())?;
    if !group.custom_icon_uuid.is_nil() {
        text_element(writer, "CustomIconUUID", &uuid_string(group.custom_icon_uuid))?;
    }
    write_times(writer, ctx, &group.times)?;
    text_element(writer, "IsExpanded", bool_str(group.is_expanded))?;
    text_element(
        writer,
        "DefaultAutoTypeSequence",
        &group.default_auto_type_sequence,
    )?;
    text_element(
        writer,
        "EnableAutoType",
        group.enable_auto_type.map_or(NULL, bool_str),
    )?;
    text_element(
        writer,
        "EnableSearching",
        group.enable_searching.map_or(NULL, bool_str),
    )?;
    text_element(
        writer,
        "LastTopVisibleEntry",
        &uuid_string(group.last_top_visible_entry),
    )?;
    if ctx.version == crate::header::FormatVersion::V4 && !group.custom_data.is_empty() {
        group.custom_data.write(writer)?;
    }

    // entries before subgroups, as the reference serializer does
    for child in group.children() {
        if let NodeId::Entry(entry_id) = child {
            if let Some(entry) = tree.entry(*entry_id) {
                entry.write(writer, ctx, &meta.memory_protection)?;
            }
        }
    }
    for child in group.children() {
        if let NodeId::Group(sub_id) = child {
            write_group(writer, ctx, tree, *sub_id, meta)?;
        }
    }
    crate::xml::end_element(writer)
}
