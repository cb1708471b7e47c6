//! Runtime assumptions of installed method bodies.
//!
//! Each assumption lives in a slot of a generational arena: the slot index is
//! reused through a free list once the assumption is fired or its body is
//! reclaimed, and the generation stamped into [`AssumptionId`] makes a stale
//! handle miss instead of aliasing the new occupant. Assumptions are indexed
//! by the event key that invalidates them and by their owning body, so both
//! firing an event and reclaiming a body touch only the affected records.

use crate::client::code_cache::BodyId;
use crate::core::ids::{ClassId, MethodId, ObjectHandle};
use crate::protocol::commit_data::{GuardAssumption, PatchSite};
use hashbrown::HashMap;

/// The VM event an assumption depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssumptionKey {
    /// `method` gains an override.
    Override(MethodId),
    /// `class` gains a subclass.
    Extend(ClassId),
    /// `call_site` is retargeted.
    CallSite(ObjectHandle),
    /// A breakpoint is set in `method`.
    Breakpoint(MethodId),
    /// `class` is redefined.
    Redefinition(ClassId),
}

impl AssumptionKey {
    /// Event that breaks a nop-able guard.
    pub fn of_guard(assumption: &GuardAssumption) -> AssumptionKey {
        match *assumption {
            GuardAssumption::NonOverridden { method } => AssumptionKey::Override(method),
            GuardAssumption::HierarchyOverride { method, .. } => AssumptionKey::Override(method),
            GuardAssumption::ClassExtend { class } => AssumptionKey::Extend(class),
            GuardAssumption::SingleImplementer { class, .. } => AssumptionKey::Extend(class),
            GuardAssumption::MutableCallSite { call_site, .. } => AssumptionKey::CallSite(call_site),
            GuardAssumption::Breakpoint { method } => AssumptionKey::Breakpoint(method),
            GuardAssumption::HotCodeReplace { class } => AssumptionKey::Redefinition(class),
        }
    }
}

/// What happens when an assumption's event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssumptionAction {
    /// Patch the guard at this client address to its slow path.
    Patch(PatchSite),
    /// The body relied on pre-existence; it must be recompiled.
    Recompile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeAssumption {
    pub key: AssumptionKey,
    pub action: AssumptionAction,
    pub body: BodyId,
}

/// Handle of a live assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssumptionId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<RuntimeAssumption>,
}

#[derive(Debug, Default)]
pub struct AssumptionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_key: HashMap<AssumptionKey, Vec<AssumptionId>>,
    by_body: HashMap<BodyId, Vec<AssumptionId>>,
    live: usize,
}

impl AssumptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: AssumptionKey, action: AssumptionAction, body: BodyId) -> AssumptionId {
        let entry = RuntimeAssumption { key, action, body };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.entry = Some(entry);
                AssumptionId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                AssumptionId { index, generation: 0 }
            }
        };
        self.by_key.entry(key).or_default().push(id);
        self.by_body.entry(body).or_default().push(id);
        self.live += 1;
        id
    }

    pub fn get(&self, id: AssumptionId) -> Option<&RuntimeAssumption> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn is_live(&self, id: AssumptionId) -> bool {
        self.get(id).is_some()
    }

    /// Remove one assumption; None if it is already gone.
    fn release(&mut self, id: AssumptionId) -> Option<RuntimeAssumption> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        self.free.push(id.index);
        self.live -= 1;
        Some(entry)
    }

    /// Remove and return every assumption broken by `key`.
    pub fn fire(&mut self, key: AssumptionKey) -> Vec<RuntimeAssumption> {
        let Some(ids) = self.by_key.remove(&key) else {
            return Vec::new();
        };
        let mut fired = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(assumption) = self.release(id) else {
                continue;
            };
            if let Some(owned) = self.by_body.get_mut(&assumption.body) {
                owned.retain(|other| *other != id);
                if owned.is_empty() {
                    self.by_body.remove(&assumption.body);
                }
            }
            fired.push(assumption);
        }
        fired
    }

    /// Drop every assumption of `body`. Reclaiming twice is a no-op.
    pub fn reclaim_body(&mut self, body: BodyId) -> usize {
        let Some(ids) = self.by_body.remove(&body) else {
            return 0;
        };
        let mut reclaimed = 0;
        for id in ids {
            if let Some(assumption) = self.release(id) {
                reclaimed += 1;
                if let Some(keyed) = self.by_key.get_mut(&assumption.key) {
                    keyed.retain(|k| *k != id);
                    if keyed.is_empty() {
                        self.by_key.remove(&assumption.key);
                    }
                }
            }
        }
        reclaimed
    }

    pub fn count_for(&self, body: BodyId) -> usize {
        self.by_body
            .get(&body)
            .map_or(0, |ids| ids.iter().filter(|id| self.is_live(**id)).count())
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
