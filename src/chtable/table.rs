// This module provides the class hierarchy table shared by the client and server variants.
// PersistentChTable maps every known class to its PersistentClassInfo and keeps the subclass
// lists consistent on insertion and removal: removing a class excises it from every other
// record's subclass list, so no list ever names a class the table no longer holds. Subclass
// walks, used to justify devirtualization and to validate hierarchy assumptions at commit
// time, mark each record visited through a VisitTracker and reset every mark before the walk
// returns, so a record reachable through several paths (a class that both extends a class and
// implements an interface of the same hierarchy) is processed once and the next walk starts
// clean. The table also converts to and from its flat wire form.

//! Class hierarchy table.

use crate::chtable::class_info::{PersistentClassInfo, SerializedClassInfo};
use crate::core::ids::ClassId;
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::ops::ControlFlow;

/// Records visited during one walk and clears their marks afterwards.
struct VisitTracker {
    visited: Vec<ClassId>,
}

impl VisitTracker {
    fn new() -> Self {
        Self { visited: Vec::new() }
    }

    /// Mark `info`; returns false if it was already marked in this walk.
    fn visit(&mut self, info: &mut PersistentClassInfo) -> bool {
        if info.visited {
            return false;
        }
        info.visited = true;
        self.visited.push(info.class);
        true
    }

    fn reset(self, classes: &mut HashMap<ClassId, PersistentClassInfo>) {
        for class in self.visited {
            if let Some(info) = classes.get_mut(&class) {
                info.visited = false;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PersistentChTable {
    classes: HashMap<ClassId, PersistentClassInfo>,
}

impl PersistentChTable {
    pub fn new() -> Self {
        Self {
            classes: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn find(&self, class: ClassId) -> Option<&PersistentClassInfo> {
        self.classes.get(&class)
    }

    pub fn find_mut(&mut self, class: ClassId) -> Option<&mut PersistentClassInfo> {
        self.classes.get_mut(&class)
    }

    pub fn contains(&self, class: ClassId) -> bool {
        self.classes.contains_key(&class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &PersistentClassInfo> {
        self.classes.values()
    }

    pub(crate) fn classes_mut(&mut self) -> impl Iterator<Item = &mut PersistentClassInfo> {
        self.classes.values_mut()
    }

    pub fn get_or_insert(&mut self, class: ClassId) -> &mut PersistentClassInfo {
        self.classes
            .entry(class)
            .or_insert_with(|| PersistentClassInfo::new(class))
    }

    /// Record `sub` as a direct subclass of `sup`. Returns true if the edge is new.
    pub fn add_subclass(&mut self, sup: ClassId, sub: ClassId) -> bool {
        self.get_or_insert(sub);
        self.get_or_insert(sup).add_subclass(sub)
    }

    /// Remove a class and excise it from every subclass list.
    ///
    /// Returns the classes whose subclass lists changed. Removing an absent class is a no-op.
    pub fn remove_class(&mut self, class: ClassId) -> Vec<ClassId> {
        if self.classes.remove(&class).is_none() {
            return Vec::new();
        }
        let mut changed = Vec::new();
        for info in self.classes.values_mut() {
            if info.remove_subclass(class) {
                changed.push(info.class);
            }
        }
        changed
    }

    /// Insert or replace a record from its wire form.
    pub fn apply_serialized(&mut self, flat: &SerializedClassInfo) {
        self.classes
            .insert(flat.class, PersistentClassInfo::from_serialized(flat));
    }

    pub fn serialize_all(&self) -> Vec<SerializedClassInfo> {
        let mut all: Vec<_> = self.classes.values().map(|info| info.serialize()).collect();
        all.sort_by_key(|flat| flat.class);
        all
    }

    pub fn clear(&mut self) {
        self.classes.clear();
    }

    /// Order-independent view of the hierarchy, for comparing two tables.
    pub fn snapshot(&self) -> BTreeMap<ClassId, (Vec<ClassId>, bool)> {
        self.classes
            .values()
            .map(|info| {
                let mut subs = info.subclasses().to_vec();
                subs.sort();
                (info.class, (subs, info.is_reservable()))
            })
            .collect()
    }

    pub fn has_been_extended(&self, class: ClassId) -> bool {
        self.find(class).is_some_and(|info| info.has_been_extended())
    }

    /// Depth-first walk over every transitive subclass of `root` (excluding `root`).
    ///
    /// Each class is passed to `visitor` at most once. Visit marks are reset
    /// before returning, also when the visitor breaks early.
    pub fn walk_subclasses<F>(&mut self, root: ClassId, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(&PersistentClassInfo) -> ControlFlow<()>,
    {
        let mut tracker = VisitTracker::new();
        let mut stack: Vec<ClassId> = match self.classes.get_mut(&root) {
            Some(info) => {
                tracker.visit(info);
                info.subclasses().iter().rev().copied().collect()
            }
            None => Vec::new(),
        };

        let mut flow = ControlFlow::Continue(());
        while let Some(class) = stack.pop() {
            let Some(info) = self.classes.get_mut(&class) else {
                continue;
            };
            if !tracker.visit(info) {
                continue;
            }
            if visitor(info).is_break() {
                flow = ControlFlow::Break(());
                break;
            }
            stack.extend(info.subclasses().iter().rev().copied());
        }

        tracker.reset(&mut self.classes);
        flow
    }

    pub fn collect_all_subclasses(&mut self, root: ClassId) -> Vec<ClassId> {
        let mut result = Vec::new();
        let _ = self.walk_subclasses(root, |info| {
            result.push(info.class);
            ControlFlow::Continue(())
        });
        result
    }

    /// The unique class below `root` accepted by `is_candidate`, if there is exactly one.
    pub fn single_implementer<F>(&mut self, root: ClassId, is_candidate: F) -> Option<ClassId>
    where
        F: Fn(ClassId) -> bool,
    {
        let mut found = None;
        let flow = self.walk_subclasses(root, |info| {
            if !is_candidate(info.class) {
                return ControlFlow::Continue(());
            }
            if found.is_some() {
                return ControlFlow::Break(());
            }
            found = Some(info.class);
            ControlFlow::Continue(())
        });
        if flow.is_break() {
            None
        } else {
            found
        }
    }

    #[cfg(test)]
    pub(crate) fn any_visited(&self) -> bool {
        self.classes.values().any(|info| info.visited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(raw: u64) -> ClassId {
        ClassId::new(raw)
    }

    // 1 <- 2 <- 4, 1 <- 3, interface 10 implemented by 2 and 4.
    fn diamond() -> PersistentChTable {
        let mut table = PersistentChTable::new();
        table.add_subclass(c(1), c(2));
        table.add_subclass(c(1), c(3));
        table.add_subclass(c(2), c(4));
        table.add_subclass(c(10), c(2));
        table.add_subclass(c(10), c(4));
        table
    }

    #[test]
    fn test_walk_visits_each_class_once_and_resets() {
        let mut table = diamond();
        let mut from_interface = table.collect_all_subclasses(c(10));
        from_interface.sort();
        assert_eq!(from_interface, vec![c(2), c(4)]);
        assert!(!table.any_visited());

        let mut from_root = table.collect_all_subclasses(c(1));
        from_root.sort();
        assert_eq!(from_root, vec![c(2), c(3), c(4)]);
        assert!(!table.any_visited());
        assert!(table.collect_all_subclasses(c(99)).is_empty());
    }

    #[test]
    fn test_early_break_still_resets_marks() {
        let mut table = diamond();
        let flow = table.walk_subclasses(c(1), |_| ControlFlow::Break(()));
        assert!(flow.is_break());
        assert!(!table.any_visited());
    }

    #[test]
    fn test_cycle_through_interfaces_terminates() {
        let mut table = diamond();
        // An inconsistent edge back to the root must not loop forever.
        table.add_subclass(c(4), c(1));
        let subs = table.collect_all_subclasses(c(1));
        assert_eq!(subs.len(), 3);
    }

    #[test]
    fn test_remove_class_excises_from_lists() {
        let mut table = diamond();
        let mut changed = table.remove_class(c(2));
        changed.sort();
        assert_eq!(changed, vec![c(1), c(10)]);
        assert_eq!(table.find(c(1)).unwrap().subclasses(), &[c(3)]);
        assert!(table.remove_class(c(2)).is_empty());
    }

    #[test]
    fn test_single_implementer() {
        let mut table = diamond();
        assert_eq!(table.single_implementer(c(10), |k| k == c(4)), Some(c(4)));
        assert_eq!(table.single_implementer(c(10), |_| true), None);
        assert_eq!(table.single_implementer(c(3), |_| true), None);
        assert!(!table.any_visited());
    }
}
