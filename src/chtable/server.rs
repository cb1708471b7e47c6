//! Server-side mirror of one client's class hierarchy table.

use crate::chtable::class_info::{ChTableUpdate, SerializedClassInfo};
use crate::chtable::table::PersistentChTable;
use crate::core::error::StreamResult;
use crate::core::ids::ClassId;

#[derive(Debug, Default)]
pub struct ServerChTable {
    table: PersistentChTable,
    initialized: bool,
}

impl ServerChTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &PersistentChTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut PersistentChTable {
        &mut self.table
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Populate the table from the client's full hierarchy the first time it is needed.
    ///
    /// Returns true if `fetch` was called.
    pub fn initialize_if_needed<F>(&mut self, fetch: F) -> StreamResult<bool>
    where
        F: FnOnce() -> StreamResult<Vec<SerializedClassInfo>>,
    {
        if self.initialized {
            return Ok(false);
        }
        let all = fetch()?;
        self.replace_all(&all);
        Ok(true)
    }

    fn replace_all(&mut self, all: &[SerializedClassInfo]) {
        self.table.clear();
        for flat in all {
            self.table.apply_serialized(flat);
        }
        self.initialized = true;
        log::debug!("chtable: initialized with {} classes", all.len());
    }

    /// Apply removes first, then mods.
    pub fn do_update(&mut self, removes: &[ClassId], mods: &[SerializedClassInfo]) {
        for class in removes {
            self.table.remove_class(*class);
        }
        for flat in mods {
            self.table.apply_serialized(flat);
        }
        if !removes.is_empty() || !mods.is_empty() {
            log::trace!("chtable: applied {} removes and {} mods", removes.len(), mods.len());
        }
    }

    /// Apply the hierarchy state carried by a compilation request.
    ///
    /// A delta arriving before the table was initialized is dropped; the next
    /// `initialize_if_needed` fetches the full hierarchy, which already includes it.
    pub fn apply_update(&mut self, update: &ChTableUpdate) {
        match update {
            ChTableUpdate::Full(all) => self.replace_all(all),
            ChTableUpdate::Delta { removes, mods } if self.initialized => self.do_update(removes, mods),
            ChTableUpdate::Delta { .. } => {}
        }
    }

    /// Forget everything; the next compile re-fetches the hierarchy.
    pub fn clear(&mut self) {
        self.table.clear();
        self.initialized = false;
    }

    pub fn has_been_extended(&self, class: ClassId) -> bool {
        self.table.has_been_extended(class)
    }

    pub fn collect_all_subclasses(&mut self, class: ClassId) -> Vec<ClassId> {
        self.table.collect_all_subclasses(class)
    }
}
