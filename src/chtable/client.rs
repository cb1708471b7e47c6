// This module holds the client variant of the persistent class hierarchy table. Besides the
// hierarchy itself it accumulates the delta that has not been sent to the server yet: the set
// of classes whose records changed (dirty) and the set of classes that were unloaded
// (removed). Every compilation request drains the delta; a full-resync request instead ships
// the whole table and drains the delta as well. A class that is unloaded and then reloaded
// with the same identity before the next request appears in both sets, which is why the
// server applies removes before mods. When a class gains a subclass, the class is marked
// newly extended for every compilation thread that currently has a remote compile in flight;
// each thread clears its own mark when it starts its next compile and checks the marks when
// it commits, so an extension that happened while the server was compiling is never missed.

//! Client-side class hierarchy table and its pending delta.

use crate::chtable::class_info::ChTableUpdate;
use crate::chtable::table::PersistentChTable;
use crate::core::ids::{ClassId, CompThreadId};
use crate::core::thread_set::ThreadBitSet;
use hashbrown::HashSet;

#[derive(Debug, Default)]
pub struct ClientChTable {
    table: PersistentChTable,
    dirty: HashSet<ClassId>,
    removed: HashSet<ClassId>,
    /// Classes with at least one newly-extended bit set.
    newly_extended: HashSet<ClassId>,
}

impl ClientChTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &PersistentChTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut PersistentChTable {
        &mut self.table
    }

    /// Record a newly loaded class under its superclass and interfaces.
    ///
    /// `remote_threads` are the compilation threads with a remote compile in
    /// flight; each supertype that gains a subclass is marked newly extended
    /// for them. Returns the supertypes that gained a subclass.
    pub fn class_loaded(
        &mut self,
        class: ClassId,
        super_class: Option<ClassId>,
        interfaces: &[ClassId],
        remote_threads: &ThreadBitSet,
    ) -> Vec<ClassId> {
        self.table.get_or_insert(class);
        self.dirty.insert(class);

        let mut extended = Vec::new();
        for sup in super_class.iter().chain(interfaces.iter()).copied() {
            if self.table.add_subclass(sup, class) {
                self.dirty.insert(sup);
                extended.push(sup);
                if !remote_threads.is_empty() {
                    if let Some(info) = self.table.find_mut(sup) {
                        info.mark_newly_extended(remote_threads);
                    }
                    self.newly_extended.insert(sup);
                }
            }
        }
        log::trace!("chtable: loaded {} extending {:?}", class, extended);
        extended
    }

    /// Drop an unloaded class. Unloading an unknown class is a no-op.
    pub fn class_unloaded(&mut self, class: ClassId) {
        if !self.table.contains(class) {
            return;
        }
        for sup in self.table.remove_class(class) {
            self.dirty.insert(sup);
        }
        self.dirty.remove(&class);
        self.newly_extended.remove(&class);
        self.removed.insert(class);
    }

    /// Disable lock reservation for a class, as requested by the server.
    pub fn clear_reservable(&mut self, class: ClassId) {
        if let Some(info) = self.table.find_mut(class) {
            if info.is_reservable() {
                info.set_reservable(false);
                self.dirty.insert(class);
            }
        }
    }

    pub fn has_pending_delta(&self) -> bool {
        !self.dirty.is_empty() || !self.removed.is_empty()
    }

    /// Serialize and clear the pending delta.
    pub fn serialize_updates(&mut self) -> ChTableUpdate {
        let mut removes: Vec<ClassId> = self.removed.drain().collect();
        removes.sort();
        let mut dirty: Vec<ClassId> = self.dirty.drain().collect();
        dirty.sort();
        let mods = dirty
            .into_iter()
            .filter_map(|class| self.table.find(class).map(|info| info.serialize()))
            .collect();
        ChTableUpdate::Delta { removes, mods }
    }

    /// Serialize the whole hierarchy; the pending delta is subsumed and cleared.
    pub fn serialize_all(&mut self) -> ChTableUpdate {
        self.dirty.clear();
        self.removed.clear();
        ChTableUpdate::Full(self.table.serialize_all())
    }

    /// Forget this thread's newly-extended marks; called when it starts a remote compile.
    pub fn clear_newly_extended(&mut self, thread: CompThreadId) {
        let table = &mut self.table;
        self.newly_extended.retain(|class| match table.find_mut(*class) {
            Some(info) => !info.clear_newly_extended(thread),
            None => false,
        });
    }

    /// First class of `classes` marked newly extended for `thread`.
    pub fn first_newly_extended(&self, classes: &[ClassId], thread: CompThreadId) -> Option<ClassId> {
        classes.iter().copied().find(|class| {
            self.newly_extended.contains(class)
                && self
                    .table
                    .find(*class)
                    .is_some_and(|info| info.is_newly_extended_for(thread))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(raw: u64) -> ClassId {
        ClassId::new(raw)
    }

    #[test]
    fn test_delta_is_drained_by_serialize() {
        let mut chtable = ClientChTable::new();
        let none = ThreadBitSet::new();
        chtable.class_loaded(c(1), None, &[], &none);
        chtable.class_loaded(c(2), Some(c(1)), &[], &none);
        assert!(chtable.has_pending_delta());

        match chtable.serialize_updates() {
            ChTableUpdate::Delta { removes, mods } => {
                assert!(removes.is_empty());
                assert_eq!(mods.len(), 2);
                assert_eq!(mods[0].subclasses, vec![c(2)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!chtable.has_pending_delta());
        assert!(chtable.serialize_updates().is_empty());
    }

    #[test]
    fn test_unload_then_reload_appears_in_both_sets() {
        let mut chtable = ClientChTable::new();
        let none = ThreadBitSet::new();
        chtable.class_loaded(c(1), None, &[], &none);
        chtable.class_loaded(c(2), Some(c(1)), &[], &none);
        chtable.serialize_updates();

        chtable.class_unloaded(c(2));
        chtable.class_loaded(c(2), Some(c(1)), &[], &none);
        match chtable.serialize_updates() {
            ChTableUpdate::Delta { removes, mods } => {
                assert_eq!(removes, vec![c(2)]);
                let classes: Vec<_> = mods.iter().map(|m| m.class).collect();
                assert_eq!(classes, vec![c(1), c(2)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        chtable.class_unloaded(c(77));
        assert!(!chtable.has_pending_delta());
    }

    #[test]
    fn test_newly_extended_marks_only_in_flight_threads() {
        let mut chtable = ClientChTable::new();
        chtable.class_loaded(c(1), None, &[], &ThreadBitSet::new());
        let in_flight: ThreadBitSet = [0, 2].into_iter().collect();
        let extended = chtable.class_loaded(c(2), Some(c(1)), &[], &in_flight);
        assert_eq!(extended, vec![c(1)]);

        assert_eq!(chtable.first_newly_extended(&[c(1)], 0), Some(c(1)));
        assert_eq!(chtable.first_newly_extended(&[c(1)], 1), None);
        chtable.clear_newly_extended(0);
        assert_eq!(chtable.first_newly_extended(&[c(1)], 0), None);
        assert_eq!(chtable.first_newly_extended(&[c(1)], 2), Some(c(1)));
        chtable.clear_newly_extended(2);
        assert!(chtable.newly_extended.is_empty());
    }

    #[test]
    fn test_clear_reservable_marks_dirty() {
        let mut chtable = ClientChTable::new();
        chtable.class_loaded(c(1), None, &[], &ThreadBitSet::new());
        chtable.serialize_updates();
        chtable.clear_reservable(c(1));
        assert!(!chtable.table().find(c(1)).unwrap().is_reservable());
        assert!(chtable.has_pending_delta());
    }
}
