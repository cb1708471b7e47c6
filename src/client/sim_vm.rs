// This module implements SimulatedVm, an in-memory stand-in for the client JVM that owns the
// classes, methods, constant pools, strings and call sites the JIT reasons about. It answers
// the full VmQuery surface locally (it never fails) and lets a test or the demo mutate the VM
// the way an application would: load and unload classes, add overriding methods, redefine a
// class, set a breakpoint, retarget a mutable call site or write a static final field. After
// applying a mutation the VM notifies its registered VmEventListeners, which is how the JIT
// client keeps its class hierarchy table, delta and runtime assumptions current. Listeners are
// held weakly so a listener owning the VM does not keep itself alive, and they are called
// without the VM's lock held so they may query the VM.

//! In-memory client VM.

use crate::core::ids::{ClassId, ConstantPoolId, LoaderId, MethodId, ObjectHandle};
use crate::core::vm::{ClientVm, VmEventListener, VmQuery, VmResult};
use crate::protocol::message::ClassChain;
use crate::protocol::mirror::{
    ClassFlags, ClassInfo, FieldAttributes, FieldType, JittedBodyInfo, ResolutionKind,
    ResolvedMethodMirror, VmInfo,
};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub const SYSTEM_LOADER: LoaderId = LoaderId::new(0x10);

/// Description of a class to load.
#[derive(Debug, Clone)]
pub struct ClassSpec {
    name: String,
    super_class: Option<ClassId>,
    interfaces: Vec<ClassId>,
    flags: ClassFlags,
    loader: LoaderId,
    initialized: bool,
}

impl ClassSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_class: None,
            interfaces: Vec::new(),
            flags: ClassFlags::default(),
            loader: SYSTEM_LOADER,
            initialized: true,
        }
    }

    pub fn extends(mut self, super_class: ClassId) -> Self {
        self.super_class = Some(super_class);
        self
    }

    pub fn implements(mut self, interface: ClassId) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_flags(mut self, flags: ClassFlags) -> Self {
        self.flags = ClassFlags(self.flags.0 | flags.0);
        self
    }

    pub fn with_loader(mut self, loader: LoaderId) -> Self {
        self.loader = loader;
        self
    }

    pub fn uninitialized(mut self) -> Self {
        self.initialized = false;
        self
    }
}

/// Description of a method to define.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    name: String,
    signature: String,
    is_static: bool,
    is_final: bool,
    is_private: bool,
    is_abstract: bool,
    is_synchronized: bool,
    is_jni_native: bool,
}

impl MethodSpec {
    pub fn virtual_method(name: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signature: signature.into(),
            is_static: false,
            is_final: false,
            is_private: false,
            is_abstract: false,
            is_synchronized: false,
            is_jni_native: false,
        }
    }

    pub fn static_method(name: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            is_static: true,
            ..Self::virtual_method(name, signature)
        }
    }

    pub fn final_method(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn private_method(mut self) -> Self {
        self.is_private = true;
        self
    }

    pub fn abstract_method(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn synchronized_method(mut self) -> Self {
        self.is_synchronized = true;
        self
    }

    pub fn native(mut self) -> Self {
        self.is_jni_native = true;
        self
    }
}

/// A field reference in a constant pool.
#[derive(Debug, Clone)]
pub struct FieldRef {
    pub declaring_class: ClassId,
    pub signature: String,
    pub offset_or_address: u64,
    pub is_static: bool,
    pub is_final: bool,
    pub is_volatile: bool,
}

#[derive(Debug, Clone)]
enum CpEntry {
    Method { kind: ResolutionKind, method: MethodId },
    Field { attrs: FieldAttributes, is_static: bool },
    Class(ClassId),
}

#[derive(Debug)]
struct SimClass {
    info: ClassInfo,
    replaced: bool,
    fields: HashMap<(String, String), u32>,
    constant_pool: HashMap<u32, CpEntry>,
}

#[derive(Debug)]
struct SimMethod {
    mirror: ResolvedMethodMirror,
    /// Classes that define an override of this method.
    overridden_by: Vec<ClassId>,
    breakpointed: bool,
}

#[derive(Debug, Default)]
struct SimState {
    classes: HashMap<ClassId, SimClass>,
    methods: HashMap<MethodId, SimMethod>,
    by_name: HashMap<String, ClassId>,
    strings: HashMap<ObjectHandle, String>,
    call_sites: HashMap<ObjectHandle, u64>,
    thunks: HashMap<String, u64>,
    next_vtable_slot: u32,
}

impl SimState {
    fn supertypes(&self, class: ClassId) -> impl Iterator<Item = ClassId> + '_ {
        self.classes
            .get(&class)
            .into_iter()
            .flat_map(|c| c.info.super_class.into_iter().chain(c.info.interfaces.iter().copied()))
    }

    fn is_instance_of(&self, class: ClassId, target: ClassId) -> bool {
        let mut queue = VecDeque::from([class]);
        let mut seen = Vec::new();
        while let Some(c) = queue.pop_front() {
            if c == target {
                return true;
            }
            if seen.contains(&c) {
                continue;
            }
            seen.push(c);
            queue.extend(self.supertypes(c));
        }
        false
    }

    fn has_subclass(&self, class: ClassId) -> bool {
        self.classes.values().any(|c| {
            c.info.class != class
                && (c.info.super_class == Some(class) || c.info.interfaces.contains(&class))
        })
    }

    fn cp_entry(&self, class: ClassId, cp_index: u32) -> Option<&CpEntry> {
        self.classes.get(&class)?.constant_pool.get(&cp_index)
    }
}

/// A client VM kept entirely in memory.
pub struct SimulatedVm {
    state: RwLock<SimState>,
    vm_info: VmInfo,
    next_address: AtomicU64,
    listeners: Mutex<Vec<Weak<dyn VmEventListener>>>,
}

impl SimulatedVm {
    pub fn new() -> Self {
        Self::with_shared_class_cache(true)
    }

    pub fn with_shared_class_cache(enabled: bool) -> Self {
        let object_class = ClassId::new(0x1000);
        let string_class = ClassId::new(0x1100);
        let vm = Self {
            state: RwLock::new(SimState::default()),
            vm_info: VmInfo {
                pointer_size: 8,
                compressed_refs: true,
                heap_base: 0x1_0000_0000,
                heap_top: 0x2_0000_0000,
                has_shared_class_cache: enabled,
                string_class,
                object_class,
            },
            next_address: AtomicU64::new(0x2000),
            listeners: Mutex::new(Vec::new()),
        };
        vm.insert_class(object_class, ClassSpec::new("java/lang/Object"));
        vm.insert_class(string_class, ClassSpec::new("java/lang/String").extends(object_class));
        vm
    }

    pub fn object_class(&self) -> ClassId {
        self.vm_info.object_class
    }

    /// Register a listener; it is dropped once the listener itself is.
    pub fn add_listener<L: VmEventListener + 'static>(&self, listener: &Arc<L>) {
        let weak: Weak<dyn VmEventListener> = Arc::downgrade(listener) as Weak<dyn VmEventListener>;
        self.listeners.lock().push(weak);
    }

    fn notify(&self, event: impl Fn(&dyn VmEventListener)) {
        let live: Vec<Arc<dyn VmEventListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            event(listener.as_ref());
        }
    }

    fn fresh_address(&self) -> u64 {
        self.next_address.fetch_add(0x100, Ordering::Relaxed)
    }

    fn insert_class(&self, class: ClassId, spec: ClassSpec) {
        let mut state = self.state.write();
        let depth = spec
            .super_class
            .and_then(|s| state.classes.get(&s))
            .map_or(0, |s| s.info.depth + 1);
        let info = ClassInfo {
            class,
            name: spec.name.clone(),
            rom_class: spec.name.as_bytes().to_vec(),
            super_class: spec.super_class,
            interfaces: spec.interfaces,
            depth,
            flags: spec.flags,
            loader: spec.loader,
            constant_pool: ConstantPoolId::new(class.raw() + 0x8),
            component_class: None,
            array_class: None,
            initialized: spec.initialized,
            methods: Vec::new(),
        };
        if spec.loader == SYSTEM_LOADER {
            state.by_name.insert(spec.name, class);
        }
        state.classes.insert(
            class,
            SimClass {
                info,
                replaced: false,
                fields: HashMap::new(),
                constant_pool: HashMap::new(),
            },
        );
    }

    /// Load a class and tell the listeners.
    pub fn define_class(&self, spec: ClassSpec) -> ClassId {
        let class = ClassId::new(self.fresh_address());
        let super_class = spec.super_class;
        let interfaces = spec.interfaces.clone();
        self.insert_class(class, spec);
        self.notify(|l| l.class_loaded(class, super_class, &interfaces));
        class
    }

    /// Create the array class of `component`.
    pub fn define_array_class(&self, component: ClassId) -> Option<ClassId> {
        let name = format!("[L{};", self.state.read().classes.get(&component)?.info.name);
        let array = self.define_class(
            ClassSpec::new(name)
                .extends(self.vm_info.object_class)
                .with_flags(ClassFlags(ClassFlags::ARRAY)),
        );
        let mut state = self.state.write();
        if let Some(a) = state.classes.get_mut(&array) {
            a.info.component_class = Some(component);
        }
        if let Some(c) = state.classes.get_mut(&component) {
            c.info.array_class = Some(array);
        }
        Some(array)
    }

    pub fn define_method(&self, class: ClassId, spec: MethodSpec) -> Option<MethodId> {
        let method = MethodId::new(self.fresh_address());
        let mut state = self.state.write();
        let literals = state.classes.get(&class)?.info.constant_pool;
        let vtable_slot = if spec.is_static || spec.is_private {
            None
        } else {
            state.next_vtable_slot += 1;
            Some(state.next_vtable_slot)
        };
        let mirror = ResolvedMethodMirror {
            method,
            owning_class: class,
            literals,
            name: spec.name,
            signature: spec.signature,
            is_static: spec.is_static,
            is_final: spec.is_final,
            is_private: spec.is_private,
            is_abstract: spec.is_abstract,
            is_synchronized: spec.is_synchronized,
            is_jni_native: spec.is_jni_native,
            is_interpreted: true,
            vtable_slot,
            recognized: None,
            body: JittedBodyInfo {
                is_compiled: false,
                invocation_count: 0,
                start_address: None,
            },
        };
        state.methods.insert(
            method,
            SimMethod {
                mirror,
                overridden_by: Vec::new(),
                breakpointed: false,
            },
        );
        if let Some(c) = state.classes.get_mut(&class) {
            c.info.methods.push(method);
        }
        Some(method)
    }

    fn set_cp_entry(&self, class: ClassId, cp_index: u32, entry: CpEntry) -> bool {
        match self.state.write().classes.get_mut(&class) {
            Some(c) => {
                c.constant_pool.insert(cp_index, entry);
                true
            }
            None => false,
        }
    }

    pub fn add_call_site(&self, class: ClassId, cp_index: u32, kind: ResolutionKind, method: MethodId) -> bool {
        self.set_cp_entry(class, cp_index, CpEntry::Method { kind, method })
    }

    pub fn add_field_ref(&self, class: ClassId, cp_index: u32, field: FieldRef) -> bool {
        let attrs = FieldAttributes {
            declaring_class: Some(field.declaring_class),
            offset_or_address: field.offset_or_address,
            field_type: FieldType::from_signature(&field.signature),
            is_volatile: field.is_volatile,
            is_final: field.is_final,
            is_private: false,
            unresolved_in_cp: false,
        };
        self.set_cp_entry(
            class,
            cp_index,
            CpEntry::Field {
                attrs,
                is_static: field.is_static,
            },
        )
    }

    pub fn add_class_ref(&self, class: ClassId, cp_index: u32, target: ClassId) -> bool {
        self.set_cp_entry(class, cp_index, CpEntry::Class(target))
    }

    pub fn add_instance_field(&self, class: ClassId, name: &str, signature: &str, offset: u32) -> bool {
        match self.state.write().classes.get_mut(&class) {
            Some(c) => {
                c.fields.insert((name.to_string(), signature.to_string()), offset);
                true
            }
            None => false,
        }
    }

    pub fn new_string(&self, value: &str) -> ObjectHandle {
        let handle = ObjectHandle::new(self.vm_info.heap_base + self.fresh_address());
        self.state.write().strings.insert(handle, value.to_string());
        handle
    }

    pub fn new_call_site(&self) -> ObjectHandle {
        let handle = ObjectHandle::new(self.vm_info.heap_base + self.fresh_address());
        self.state.write().call_sites.insert(handle, 0);
        handle
    }

    /// Change the target of a mutable call site, bumping its epoch.
    pub fn retarget_call_site(&self, call_site: ObjectHandle) -> Option<u64> {
        let epoch = {
            let mut state = self.state.write();
            let epoch = state.call_sites.get_mut(&call_site)?;
            *epoch += 1;
            *epoch
        };
        self.notify(|l| l.call_site_retargeted(call_site));
        Some(epoch)
    }

    /// Define an override of `method` in `in_class` and tell the listeners.
    pub fn override_method(&self, method: MethodId, in_class: ClassId) -> Option<MethodId> {
        let (name, signature) = {
            let state = self.state.read();
            let m = &state.methods.get(&method)?.mirror;
            (m.name.clone(), m.signature.clone())
        };
        let overrider = self.define_method(in_class, MethodSpec::virtual_method(name, signature))?;
        if let Some(m) = self.state.write().methods.get_mut(&method) {
            m.overridden_by.push(in_class);
        }
        self.notify(|l| l.method_overridden(method, in_class));
        Some(overrider)
    }

    pub fn unload_class(&self, class: ClassId) -> bool {
        {
            let mut state = self.state.write();
            let Some(removed) = state.classes.remove(&class) else {
                return false;
            };
            for method in &removed.info.methods {
                state.methods.remove(method);
            }
            if state.by_name.get(&removed.info.name) == Some(&class) {
                state.by_name.remove(&removed.info.name);
            }
        }
        self.notify(|l| l.class_unloaded(class));
        true
    }

    pub fn redefine_class(&self, class: ClassId) -> bool {
        match self.state.write().classes.get_mut(&class) {
            Some(c) => c.replaced = true,
            None => return false,
        }
        self.notify(|l| l.class_redefined(class));
        true
    }

    pub fn set_breakpoint(&self, method: MethodId) -> bool {
        match self.state.write().methods.get_mut(&method) {
            Some(m) => m.breakpointed = true,
            None => return false,
        }
        self.notify(|l| l.breakpoint_set(method));
        true
    }

    /// Write a static final field of `class` after initialization.
    pub fn modify_final_field(&self, class: ClassId) {
        self.notify(|l| l.final_field_modified(class));
    }

    pub fn initialize_class(&self, class: ClassId) -> bool {
        match self.state.write().classes.get_mut(&class) {
            Some(c) => {
                c.info.initialized = true;
                true
            }
            None => false,
        }
    }

    /// Record that `method` now has compiled code at `address`.
    pub fn mark_compiled(&self, method: MethodId, address: u64) {
        if let Some(m) = self.state.write().methods.get_mut(&method) {
            m.mirror.body.is_compiled = true;
            m.mirror.body.start_address = Some(address);
            m.mirror.is_interpreted = false;
        }
    }

    pub fn set_invocation_count(&self, method: MethodId, count: u32) {
        if let Some(m) = self.state.write().methods.get_mut(&method) {
            m.mirror.body.invocation_count = count;
        }
    }
}

impl Default for SimulatedVm {
    fn default() -> Self {
        Self::new()
    }
}

impl VmQuery for SimulatedVm {
    fn super_class(&self, class: ClassId) -> VmResult<Option<ClassId>> {
        Ok(self.state.read().classes.get(&class).and_then(|c| c.info.super_class))
    }

    fn is_instance_of(&self, class: ClassId, target: ClassId) -> VmResult<bool> {
        Ok(self.state.read().is_instance_of(class, target))
    }

    fn system_class_from_name(&self, name: &str) -> VmResult<Option<ClassId>> {
        Ok(self.state.read().by_name.get(name).copied())
    }

    fn class_of_method(&self, method: MethodId) -> VmResult<Option<ClassId>> {
        Ok(self.state.read().methods.get(&method).map(|m| m.mirror.owning_class))
    }

    fn class_from_signature(&self, signature: &str, context: ClassId) -> VmResult<Option<ClassId>> {
        let state = self.state.read();
        if !state.classes.contains_key(&context) {
            return Ok(None);
        }
        let name = signature
            .strip_prefix('L')
            .and_then(|s| s.strip_suffix(';'))
            .unwrap_or(signature);
        Ok(state.by_name.get(name).copied())
    }

    fn class_has_been_extended(&self, class: ClassId) -> VmResult<bool> {
        Ok(self.state.read().has_subclass(class))
    }

    fn class_has_been_replaced(&self, class: ClassId) -> VmResult<bool> {
        Ok(self.state.read().classes.get(&class).is_some_and(|c| c.replaced))
    }

    fn is_class_initialized(&self, class: ClassId) -> VmResult<bool> {
        Ok(self.state.read().classes.get(&class).is_some_and(|c| c.info.initialized))
    }

    fn class_depth_and_flags(&self, class: ClassId) -> VmResult<Option<(u32, ClassFlags)>> {
        Ok(self
            .state
            .read()
            .classes
            .get(&class)
            .map(|c| (c.info.depth, c.info.flags)))
    }

    fn instance_field_offset(&self, class: ClassId, name: &str, signature: &str) -> VmResult<Option<u32>> {
        let state = self.state.read();
        let key = (name.to_string(), signature.to_string());
        let mut current = Some(class);
        while let Some(c) = current.and_then(|c| state.classes.get(&c)) {
            if let Some(offset) = c.fields.get(&key) {
                return Ok(Some(*offset));
            }
            current = c.info.super_class;
        }
        Ok(None)
    }

    fn component_class(&self, class: ClassId) -> VmResult<Option<ClassId>> {
        Ok(self.state.read().classes.get(&class).and_then(|c| c.info.component_class))
    }

    fn array_class(&self, class: ClassId) -> VmResult<Option<ClassId>> {
        Ok(self.state.read().classes.get(&class).and_then(|c| c.info.array_class))
    }

    fn class_loader(&self, class: ClassId) -> VmResult<Option<LoaderId>> {
        Ok(self.state.read().classes.get(&class).map(|c| c.info.loader))
    }

    fn is_method_breakpointed(&self, method: MethodId) -> VmResult<bool> {
        Ok(self.state.read().methods.get(&method).is_some_and(|m| m.breakpointed))
    }

    fn string_utf8_length(&self, string: ObjectHandle) -> VmResult<Option<usize>> {
        Ok(self.state.read().strings.get(&string).map(String::len))
    }

    fn mutable_call_site_epoch(&self, call_site: ObjectHandle) -> VmResult<Option<u64>> {
        Ok(self.state.read().call_sites.get(&call_site).copied())
    }

    fn vm_info(&self) -> VmResult<VmInfo> {
        Ok(self.vm_info.clone())
    }

    fn class_info(&self, class: ClassId) -> VmResult<Option<ClassInfo>> {
        Ok(self.state.read().classes.get(&class).map(|c| c.info.clone()))
    }

    fn class_chain(&self, class: ClassId) -> VmResult<Option<ClassChain>> {
        if !self.vm_info.has_shared_class_cache {
            return Ok(None);
        }
        let state = self.state.read();
        let mut offsets = Vec::new();
        let mut current = Some(class);
        while let Some(c) = current.and_then(|c| state.classes.get(&c)) {
            offsets.push(c.info.class.raw());
            current = c.info.super_class;
        }
        Ok((!offsets.is_empty()).then_some(ClassChain {
            rom_class_offsets: offsets,
        }))
    }

    fn method_mirror(&self, method: MethodId) -> VmResult<Option<ResolvedMethodMirror>> {
        Ok(self.state.read().methods.get(&method).map(|m| m.mirror.clone()))
    }

    fn resolve_method(
        &self,
        kind: ResolutionKind,
        owning_class: ClassId,
        cp_index: u32,
        _target_class: Option<ClassId>,
    ) -> VmResult<Option<ResolvedMethodMirror>> {
        let state = self.state.read();
        Ok(match state.cp_entry(owning_class, cp_index) {
            Some(CpEntry::Method { kind: k, method }) if *k == kind => {
                state.methods.get(method).map(|m| m.mirror.clone())
            }
            _ => None,
        })
    }

    fn virtual_method_is_overridden(&self, method: MethodId) -> VmResult<bool> {
        Ok(self
            .state
            .read()
            .methods
            .get(&method)
            .is_some_and(|m| !m.overridden_by.is_empty()))
    }

    fn field_attributes(
        &self,
        owning_class: ClassId,
        cp_index: u32,
        is_static: bool,
    ) -> VmResult<Option<FieldAttributes>> {
        Ok(match self.state.read().cp_entry(owning_class, cp_index) {
            Some(CpEntry::Field { attrs, is_static: s }) if *s == is_static => Some(*attrs),
            _ => None,
        })
    }

    fn class_from_constant_pool(&self, owning_class: ClassId, cp_index: u32) -> VmResult<Option<ClassId>> {
        Ok(match self.state.read().cp_entry(owning_class, cp_index) {
            Some(CpEntry::Class(class)) => Some(*class),
            _ => None,
        })
    }

    fn jitted_body_info(&self, method: MethodId) -> VmResult<Option<JittedBodyInfo>> {
        Ok(self.state.read().methods.get(&method).map(|m| m.mirror.body))
    }

    fn is_compiled(&self, method: MethodId) -> VmResult<bool> {
        Ok(self
            .state
            .read()
            .methods
            .get(&method)
            .is_some_and(|m| m.mirror.body.is_compiled))
    }

    fn invocation_count(&self, method: MethodId) -> VmResult<Option<u32>> {
        Ok(self
            .state
            .read()
            .methods
            .get(&method)
            .map(|m| m.mirror.body.invocation_count))
    }
}

impl ClientVm for SimulatedVm {
    fn set_j2i_thunk(&self, signature: &str, _thunk: &[u8]) -> u64 {
        let address = self.fresh_address();
        *self
            .state
            .write()
            .thunks
            .entry(signature.to_string())
            .or_insert(0x7e00_0000 + address)
    }

    fn il_summary(&self, method: MethodId) -> String {
        let state = self.state.read();
        let Some(m) = state.methods.get(&method) else {
            return format!("{}: <unknown method>", method);
        };
        let cp_entries = state
            .classes
            .get(&m.mirror.owning_class)
            .map_or(0, |c| c.constant_pool.len());
        format!(
            "{} {}{} static={} cp_entries={} invocations={}",
            method,
            m.mirror.name,
            m.mirror.signature,
            m.mirror.is_static,
            cp_entries,
            m.mirror.body.invocation_count
        )
    }

    fn is_overridden_in_hierarchy(&self, method: MethodId, this_class: ClassId) -> bool {
        let state = self.state.read();
        state.methods.get(&method).is_some_and(|m| {
            m.overridden_by
                .iter()
                .any(|&c| state.is_instance_of(c, this_class))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl VmEventListener for Recorder {
        fn class_loaded(&self, class: ClassId, super_class: Option<ClassId>, _: &[ClassId]) {
            self.events.lock().push(format!("load {} < {:?}", class, super_class));
        }
        fn class_unloaded(&self, class: ClassId) {
            self.events.lock().push(format!("unload {}", class));
        }
        fn method_overridden(&self, method: MethodId, _: ClassId) {
            self.events.lock().push(format!("override {}", method));
        }
        fn class_redefined(&self, _: ClassId) {}
        fn breakpoint_set(&self, _: MethodId) {}
        fn call_site_retargeted(&self, _: ObjectHandle) {}
        fn final_field_modified(&self, _: ClassId) {}
    }

    #[test]
    fn test_hierarchy_queries() {
        let vm = SimulatedVm::new();
        let object = vm.object_class();
        let a = vm.define_class(ClassSpec::new("A").extends(object));
        let b = vm.define_class(ClassSpec::new("B").extends(a));
        assert_eq!(vm.super_class(b).unwrap(), Some(a));
        assert!(vm.is_instance_of(b, object).unwrap());
        assert!(!vm.is_instance_of(a, b).unwrap());
        assert!(vm.class_has_been_extended(a).unwrap());
        assert!(!vm.class_has_been_extended(b).unwrap());
        assert_eq!(vm.class_depth_and_flags(b).unwrap().map(|(d, _)| d), Some(2));
        assert_eq!(vm.system_class_from_name("B").unwrap(), Some(b));
        assert_eq!(vm.class_from_signature("LB;", a).unwrap(), Some(b));
        assert_eq!(vm.class_chain(b).unwrap().unwrap().rom_class_offsets.len(), 3);
    }

    #[test]
    fn test_override_and_listener_notification() {
        let vm = SimulatedVm::new();
        let recorder = Arc::new(Recorder::default());
        vm.add_listener(&recorder);

        let a = vm.define_class(ClassSpec::new("A").extends(vm.object_class()));
        let run = vm.define_method(a, MethodSpec::virtual_method("run", "()V")).unwrap();
        assert!(!vm.virtual_method_is_overridden(run).unwrap());

        let b = vm.define_class(ClassSpec::new("B").extends(a));
        vm.override_method(run, b).unwrap();
        assert!(vm.virtual_method_is_overridden(run).unwrap());
        assert!(vm.is_overridden_in_hierarchy(run, a));
        let unrelated = vm.define_class(ClassSpec::new("C").extends(vm.object_class()));
        assert!(!vm.is_overridden_in_hierarchy(run, unrelated));

        assert!(vm.unload_class(b));
        assert!(!vm.unload_class(b));
        let events = recorder.events.lock().clone();
        assert_eq!(events.len(), 5);
        assert!(events[2].starts_with("override"));
        assert!(events[4].starts_with("unload"));
    }

    #[test]
    fn test_constant_pool_resolution() {
        let vm = SimulatedVm::new();
        let a = vm.define_class(ClassSpec::new("A").extends(vm.object_class()));
        let run = vm.define_method(a, MethodSpec::static_method("run", "()V")).unwrap();
        vm.add_call_site(a, 1, ResolutionKind::Static, run);
        assert_eq!(
            vm.resolve_method(ResolutionKind::Static, a, 1, None).unwrap().map(|m| m.method),
            Some(run)
        );
        assert!(vm.resolve_method(ResolutionKind::Virtual, a, 1, None).unwrap().is_none());
        assert!(vm.resolve_method(ResolutionKind::Static, a, 2, None).unwrap().is_none());
        let thunk = vm.set_j2i_thunk("()V", &[]);
        assert_eq!(vm.set_j2i_thunk("()V", &[]), thunk);
    }
}
