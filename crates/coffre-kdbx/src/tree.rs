//! Arena-backed group/entry tree.
//!
//! Groups and entries live in owning vectors; relationships are index
//! newtypes ([`GroupId`], [`EntryId`]) instead of pointers, so cloning
//! an entry for a history snapshot never drags the tree along and no
//! reference cycles exist. Removed slots are tombstoned (`None`) —
//! ids are never reused within one session.

use crate::entry::Entry;
use crate::group::Group;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Index of a group in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) usize);

/// Index of an entry in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) usize);

/// An ordered child reference inside a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeId {
    Group(GroupId),
    Entry(EntryId),
}

/// Ledger record of a permanently purged item, kept for external sync
/// reconciliation. Append-only within a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: DateTime<Utc>,
}

/// The owning arena. Exactly one root group; every live non-root node
/// has exactly one parent.
#[derive(Clone, Debug)]
pub struct Tree {
    groups: Vec<Option<Group>>,
    entries: Vec<Option<Entry>>,
    root: GroupId,
}

impl Tree {
    /// Build a tree around the given root group.
    #[must_use]
    pub fn new(mut root: Group) -> Self {
        root.parent = None;
        Self {
            groups: vec![Some(root)],
            entries: Vec::new(),
            root: GroupId(0),
        }
    }

    #[must_use]
    pub const fn root_id(&self) -> GroupId {
        self.root
    }

    #[must_use]
    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(id.0)?.as_ref()
    }

    pub fn group_mut(&mut self, id: GroupId) -> Option<&mut Group> {
        self.groups.get_mut(id.0)?.as_mut()
    }

    #[must_use]
    pub fn entry(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(id.0)?.as_ref()
    }

    pub fn entry_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.entries.get_mut(id.0)?.as_mut()
    }

    /// Add `group` as the last child of `parent`.
    pub fn add_group(&mut self, parent: GroupId, mut group: Group) -> GroupId {
        group.parent = Some(parent);
        group.children.clear();
        let id = GroupId(self.groups.len());
        self.groups.push(Some(group));
        if let Some(p) = self.group_mut(parent) {
            p.children.push(NodeId::Group(id));
        }
        id
    }

    /// Add `entry` as the last child of `parent`.
    pub fn add_entry(&mut self, parent: GroupId, mut entry: Entry) -> EntryId {
        entry.parent = Some(parent);
        let id = EntryId(self.entries.len());
        self.entries.push(Some(entry));
        if let Some(p) = self.group_mut(parent) {
            p.children.push(NodeId::Entry(id));
        }
        id
    }

    /// Re-parent a group under `new_parent`. The root cannot move.
    pub fn move_group(&mut self, id: GroupId, new_parent: GroupId) {
        if id == self.root {
            return;
        }
        let Some(old_parent) = self.group(id).and_then(Group::parent) else {
            return;
        };
        if let Some(p) = self.group_mut(old_parent) {
            p.children.retain(|n| *n != NodeId::Group(id));
        }
        if let Some(g) = self.group_mut(id) {
            g.parent = Some(new_parent);
        }
        if let Some(p) = self.group_mut(new_parent) {
            p.children.push(NodeId::Group(id));
        }
    }

    /// Re-parent an entry under `new_parent`.
    pub fn move_entry(&mut self, id: EntryId, new_parent: GroupId) {
        let Some(old_parent) = self.entry(id).and_then(Entry::parent) else {
            return;
        };
        if let Some(p) = self.group_mut(old_parent) {
            p.children.retain(|n| *n != NodeId::Entry(id));
        }
        if let Some(e) = self.entry_mut(id) {
            e.parent = Some(new_parent);
        }
        if let Some(p) = self.group_mut(new_parent) {
            p.children.push(NodeId::Entry(id));
        }
    }

    /// Remove an entry permanently (tombstones its slot).
    pub fn remove_entry(&mut self, id: EntryId) {
        if let Some(parent) = self.entry(id).and_then(Entry::parent) {
            if let Some(p) = self.group_mut(parent) {
                p.children.retain(|n| *n != NodeId::Entry(id));
            }
        }
        if let Some(slot) = self.entries.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Remove a group and its whole subtree permanently.
    pub fn remove_group(&mut self, id: GroupId) {
        if id == self.root {
            return;
        }
        let (sub_groups, sub_entries) = self.collect_subtree(id);
        for entry_id in sub_entries {
            if let Some(slot) = self.entries.get_mut(entry_id.0) {
                *slot = None;
            }
        }
        for group_id in sub_groups {
            if let Some(slot) = self.groups.get_mut(group_id.0) {
                *slot = None;
            }
        }
        if let Some(parent) = self.group(id).and_then(Group::parent) {
            if let Some(p) = self.group_mut(parent) {
                p.children.retain(|n| *n != NodeId::Group(id));
            }
        }
        if let Some(slot) = self.groups.get_mut(id.0) {
            *slot = None;
        }
    }

    /// All descendant groups and entries of `id`, depth-first in
    /// document order. `id` itself is not included.
    #[must_use]
    pub fn collect_subtree(&self, id: GroupId) -> (Vec<GroupId>, Vec<EntryId>) {
        let mut groups = Vec::new();
        let mut entries = Vec::new();
        let mut stack: Vec<NodeId> = self
            .group(id)
            .map(|g| g.children().to_vec())
            .unwrap_or_default();
        // keep document order: pop from the front
        stack.reverse();
        while let Some(node) = stack.pop() {
            match node {
                NodeId::Group(gid) => {
                    groups.push(gid);
                    if let Some(g) = self.group(gid) {
                        for child in g.children().iter().rev() {
                            stack.push(*child);
                        }
                    }
                }
                NodeId::Entry(eid) => entries.push(eid),
            }
        }
        (groups, entries)
    }

    /// All live entries in document order, root-first.
    #[must_use]
    pub fn entries_in_document_order(&self) -> Vec<EntryId> {
        self.collect_subtree(self.root).1
    }

    /// All live groups in document order (root excluded).
    #[must_use]
    pub fn groups_in_document_order(&self) -> Vec<GroupId> {
        self.collect_subtree(self.root).0
    }

    /// Find a live group by UUID (depth-first, includes the root).
    #[must_use]
    pub fn find_group_by_uuid(&self, uuid: Uuid) -> Option<GroupId> {
        if self.group(self.root).map(|g| g.uuid) == Some(uuid) {
            return Some(self.root);
        }
        self.groups_in_document_order()
            .into_iter()
            .find(|id| self.group(*id).map(|g| g.uuid) == Some(uuid))
    }

    /// Find a live entry by UUID.
    #[must_use]
    pub fn find_entry_by_uuid(&self, uuid: Uuid) -> Option<EntryId> {
        self.entries_in_document_order()
            .into_iter()
            .find(|id| self.entry(*id).map(|e| e.uuid) == Some(uuid))
    }

    /// Number of live entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Number of live groups (root included).
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.iter().filter(|g| g.is_some()).count()
    }

    /// Set every timestamp of every live node to `time` (new-database
    /// initialization; expiry stays untouched).
    pub fn set_all_timestamps(&mut self, time: DateTime<Utc>) {
        for group in self.groups.iter_mut().flatten() {
            group.times.creation = time;
            group.times.last_access = time;
            group.times.last_modification = time;
            group.times.location_changed = time;
        }
        for entry in self.entries.iter_mut().flatten() {
            entry.times.creation = time;
            entry.times.last_access = time;
            entry.times.last_modification = time;
            entry.times.location_changed = time;
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
