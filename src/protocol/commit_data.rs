//! Optimistic assumptions a remote compilation ships back with its code.
//!
//! The server records every class-hierarchy assumption the optimizer took
//! while compiling; the client validates them all before the body is
//! installed. Patch-site locations are absolute addresses inside the
//! server's code buffer and get rebased against `server_code_start`.

use crate::core::ids::{ClassId, MethodId, ObjectHandle};
use serde::{Deserialize, Serialize};

/// A patchable guard location and the slow-path target it is patched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchSite {
    pub location: u64,
    pub destination: u64,
}

impl PatchSite {
    /// Translate a server-side site to the client's allocation of the same body.
    pub fn rebase(self, server_start: u64, client_start: u64) -> PatchSite {
        let move_to_client = |addr: u64| client_start.wrapping_add(addr.wrapping_sub(server_start));
        PatchSite {
            location: move_to_client(self.location),
            destination: move_to_client(self.destination),
        }
    }
}

/// What a nop-able guard assumes. Each variant carries only what its validity check needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardAssumption {
    /// Method is not overridden anywhere.
    NonOverridden { method: MethodId },
    /// Method is not overridden below `this_class`.
    HierarchyOverride { method: MethodId, this_class: ClassId },
    /// Class has no subclasses (VFT test and array-store-check guards).
    ClassExtend { class: ClassId },
    /// Interface or abstract class has exactly this one implementer.
    SingleImplementer { class: ClassId, implementer: ClassId },
    /// Call site target has not changed since `epoch` was sampled.
    MutableCallSite { call_site: ObjectHandle, epoch: u64 },
    /// No breakpoint is set in the inlined method.
    Breakpoint { method: MethodId },
    /// Class has not been redefined.
    HotCodeReplace { class: ClassId },
}

/// One nop-able virtual guard of the compiled body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualGuardSite {
    pub assumption: GuardAssumption,
    pub site: PatchSite,
}

/// A guard that must be patched as soon as `class` gains a subclass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectSite {
    pub class: ClassId,
    pub site: PatchSite,
}

/// All hierarchy assumptions of one remote compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitData {
    /// Classes assumed to have no subclasses through pre-existence.
    pub preexistence_classes: Vec<ClassId>,
    /// Methods assumed not overridden through pre-existence.
    pub preexistence_methods: Vec<MethodId>,
    /// Classes that must not have gained a subclass since the compile started.
    pub classes_not_newly_extended: Vec<ClassId>,
    pub virtual_guards: Vec<VirtualGuardSite>,
    pub side_effect_sites: Vec<SideEffectSite>,
    /// Classes whose static final fields were assumed constant.
    pub static_final_field_classes: Vec<ClassId>,
    pub server_code_start: u64,
}

impl CommitData {
    pub fn is_empty(&self) -> bool {
        self.preexistence_classes.is_empty()
            && self.preexistence_methods.is_empty()
            && self.classes_not_newly_extended.is_empty()
            && self.virtual_guards.is_empty()
            && self.side_effect_sites.is_empty()
            && self.static_final_field_classes.is_empty()
    }
}
