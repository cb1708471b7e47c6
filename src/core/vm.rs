// This module defines the VM-introspection interface the compiler consumes. VmQuery is the
// query surface of a client VM as seen by an optimizer: class metadata, field offsets, method
// resolution, string and array introspection, mutable call sites and compilation state. It is
// implemented both by the client's own VM and by the server's RemoteVmProxy, which answers the
// same queries from its caches or by an RPC, so code written against VmQuery cannot tell
// whether it runs next to the VM or on a remote server. Every query may fail with a
// StreamError because a remote answer can be lost; a local VM never fails. Queries about
// entities the VM does not know answer None rather than an error. ClientVm extends the
// surface with the operations only the owner of the VM can perform: installing thunks,
// reporting the intermediate representation of a method for crash diagnostics, and deciding
// whether a method is overridden within a given part of the hierarchy. VmEventListener is the
// reverse direction: the hooks through which the VM tells the JIT that classes or methods changed.

//! VM-introspection interface shared by the local VM and the remote proxy.

use crate::core::error::StreamError;
use crate::core::ids::{ClassId, LoaderId, MethodId, ObjectHandle};
use crate::protocol::message::ClassChain;
use crate::protocol::mirror::{
    ClassFlags, ClassInfo, FieldAttributes, JittedBodyInfo, ResolutionKind, ResolvedMethodMirror,
    VmInfo,
};

pub type VmResult<T> = Result<T, StreamError>;

/// Query surface of a client VM.
pub trait VmQuery {
    fn super_class(&self, class: ClassId) -> VmResult<Option<ClassId>>;

    fn is_instance_of(&self, class: ClassId, target: ClassId) -> VmResult<bool>;

    fn system_class_from_name(&self, name: &str) -> VmResult<Option<ClassId>>;

    fn class_of_method(&self, method: MethodId) -> VmResult<Option<ClassId>>;

    /// Class named by a type signature, looked up in the loader of `context`.
    fn class_from_signature(&self, signature: &str, context: ClassId) -> VmResult<Option<ClassId>>;

    fn class_has_been_extended(&self, class: ClassId) -> VmResult<bool>;

    fn class_has_been_replaced(&self, class: ClassId) -> VmResult<bool>;

    fn is_class_initialized(&self, class: ClassId) -> VmResult<bool>;

    fn class_depth_and_flags(&self, class: ClassId) -> VmResult<Option<(u32, ClassFlags)>>;

    fn instance_field_offset(&self, class: ClassId, name: &str, signature: &str) -> VmResult<Option<u32>>;

    fn component_class(&self, class: ClassId) -> VmResult<Option<ClassId>>;

    fn array_class(&self, class: ClassId) -> VmResult<Option<ClassId>>;

    fn class_loader(&self, class: ClassId) -> VmResult<Option<LoaderId>>;

    fn is_method_breakpointed(&self, method: MethodId) -> VmResult<bool>;

    fn string_utf8_length(&self, string: ObjectHandle) -> VmResult<Option<usize>>;

    fn mutable_call_site_epoch(&self, call_site: ObjectHandle) -> VmResult<Option<u64>>;

    fn vm_info(&self) -> VmResult<VmInfo>;

    /// Everything about a class in one answer.
    fn class_info(&self, class: ClassId) -> VmResult<Option<ClassInfo>>;

    fn method_mirror(&self, method: MethodId) -> VmResult<Option<ResolvedMethodMirror>>;

    /// Resolve the call site at `cp_index` of `owning_class`'s constant pool.
    fn resolve_method(
        &self,
        kind: ResolutionKind,
        owning_class: ClassId,
        cp_index: u32,
        target_class: Option<ClassId>,
    ) -> VmResult<Option<ResolvedMethodMirror>>;

    fn virtual_method_is_overridden(&self, method: MethodId) -> VmResult<bool>;

    fn field_attributes(
        &self,
        owning_class: ClassId,
        cp_index: u32,
        is_static: bool,
    ) -> VmResult<Option<FieldAttributes>>;

    fn class_from_constant_pool(&self, owning_class: ClassId, cp_index: u32) -> VmResult<Option<ClassId>>;

    fn jitted_body_info(&self, method: MethodId) -> VmResult<Option<JittedBodyInfo>>;

    fn is_compiled(&self, method: MethodId) -> VmResult<bool>;

    fn invocation_count(&self, method: MethodId) -> VmResult<Option<u32>>;

    /// Shared-cache class chain of `class`, if it is in the shared cache.
    fn class_chain(&self, class: ClassId) -> VmResult<Option<ClassChain>>;
}

/// Operations only the VM's owner can perform.
pub trait ClientVm: VmQuery + Send + Sync {
    /// Install a J2I thunk for `signature` and return its address.
    fn set_j2i_thunk(&self, signature: &str, thunk: &[u8]) -> u64;

    /// Textual summary of the intermediate representation of `method`, for diagnostics.
    fn il_summary(&self, method: MethodId) -> String;

    /// Whether `method` is overridden by a class at or below `this_class`.
    fn is_overridden_in_hierarchy(&self, method: MethodId, this_class: ClassId) -> bool;
}

/// Hooks the VM calls into the JIT after changing class or method state.
///
/// The VM has already applied the change when a hook runs.
pub trait VmEventListener: Send + Sync {
    fn class_loaded(&self, class: ClassId, super_class: Option<ClassId>, interfaces: &[ClassId]);

    fn class_unloaded(&self, class: ClassId);

    /// `method` gained an override in `by_class`.
    fn method_overridden(&self, method: MethodId, by_class: ClassId);

    fn class_redefined(&self, class: ClassId);

    fn breakpoint_set(&self, method: MethodId);

    fn call_site_retargeted(&self, call_site: ObjectHandle);

    /// A static final field of `class` was written after initialization.
    fn final_field_modified(&self, class: ClassId);
}
