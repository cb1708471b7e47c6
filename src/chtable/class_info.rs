//! Per-class hierarchy records and their wire form.

use crate::core::ids::{ClassId, CompThreadId};
use crate::core::thread_set::ThreadBitSet;
use serde::{Deserialize, Serialize};

/// Hierarchy record of one loaded class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentClassInfo {
    pub class: ClassId,
    /// Direct subclasses and implementers, most recently added last.
    subclasses: Vec<ClassId>,
    /// Compilation threads that had a remote compile in flight when this class gained a subclass.
    newly_extended: ThreadBitSet,
    /// Scratch mark for subclass walks; always clear between walks.
    pub(crate) visited: bool,
    reservable: bool,
}

impl PersistentClassInfo {
    pub fn new(class: ClassId) -> Self {
        Self {
            class,
            subclasses: Vec::new(),
            newly_extended: ThreadBitSet::new(),
            visited: false,
            reservable: true,
        }
    }

    pub fn subclasses(&self) -> &[ClassId] {
        &self.subclasses
    }

    pub fn has_been_extended(&self) -> bool {
        !self.subclasses.is_empty()
    }

    /// Returns false if `sub` was already recorded.
    pub fn add_subclass(&mut self, sub: ClassId) -> bool {
        if self.subclasses.contains(&sub) {
            return false;
        }
        self.subclasses.push(sub);
        true
    }

    pub fn remove_subclass(&mut self, sub: ClassId) -> bool {
        let before = self.subclasses.len();
        self.subclasses.retain(|c| *c != sub);
        self.subclasses.len() != before
    }

    pub fn is_newly_extended_for(&self, thread: CompThreadId) -> bool {
        self.newly_extended.contains(thread)
    }

    pub fn mark_newly_extended(&mut self, threads: &ThreadBitSet) {
        self.newly_extended.union(threads);
    }

    /// Returns true if no thread is left marked.
    pub fn clear_newly_extended(&mut self, thread: CompThreadId) -> bool {
        self.newly_extended.clear(thread);
        self.newly_extended.is_empty()
    }

    pub fn is_reservable(&self) -> bool {
        self.reservable
    }

    pub fn set_reservable(&mut self, reservable: bool) {
        self.reservable = reservable;
    }

    pub fn serialize(&self) -> SerializedClassInfo {
        SerializedClassInfo {
            class: self.class,
            subclasses: self.subclasses.clone(),
            reservable: self.reservable,
        }
    }

    pub fn from_serialized(flat: &SerializedClassInfo) -> Self {
        Self {
            class: flat.class,
            subclasses: flat.subclasses.clone(),
            newly_extended: ThreadBitSet::new(),
            visited: false,
            reservable: flat.reservable,
        }
    }
}

/// Flat wire form of a [`PersistentClassInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedClassInfo {
    pub class: ClassId,
    pub subclasses: Vec<ClassId>,
    pub reservable: bool,
}

/// Hierarchy state attached to a compilation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChTableUpdate {
    /// Changes since the previous request. Removes must be applied before mods.
    Delta {
        removes: Vec<ClassId>,
        mods: Vec<SerializedClassInfo>,
    },
    /// The client's whole hierarchy, replacing whatever the server holds.
    Full(Vec<SerializedClassInfo>),
}

impl ChTableUpdate {
    pub fn empty() -> Self {
        ChTableUpdate::Delta {
            removes: Vec::new(),
            mods: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ChTableUpdate::Delta { removes, mods } => removes.is_empty() && mods.is_empty(),
            ChTableUpdate::Full(_) => false,
        }
    }
}
