// This module provides the per-compilation session used on the server while it compiles one
// request, built on a bumpalo arena. CompilationSession owns the scratch state whose lifetime
// is exactly one compilation: resolved-method mirrors keyed by (resolution kind, owning class,
// constant-pool index, target class), field and static attribute lookups, the known-object
// table and the generated code buffer, all allocated in the arena. None of these may outlive the
// compilation because the client can resolve more of its constant pools, initialize classes
// or unload them between two requests; the session-wide caches that do survive live in the
// client session instead. The arena's allocated bytes feed the server's memory accounting
// while the compilation runs.
// SessionStats counts the RPCs issued versus queries answered from a cache, which is the
// figure of merit for a remote compilation.

//! Arena-based per-compilation session.
//!
//! Everything here is discarded when the compilation ends.

use crate::core::ids::{ClassId, KnownObjectIndex, MethodId, ObjectHandle};
use crate::protocol::message::MessageType;
use crate::protocol::mirror::{FieldAttributes, ResolutionKind, ResolvedMethodMirror};
use bumpalo::Bump;
use hashbrown::DefaultHashBuilder;
use hashbrown::HashMap;
use std::cell::{Cell, RefCell};
use std::fmt;

/// Key of a resolved-method lookup within one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodCacheKey {
    pub kind: ResolutionKind,
    pub owning_class: ClassId,
    pub cp_index: u32,
    /// Receiver class for interface resolution.
    pub target_class: Option<ClassId>,
}

/// Key of a field attribute lookup within one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldCacheKey {
    pub owning_class: ClassId,
    pub cp_index: u32,
    pub is_static: bool,
}

type ArenaMap<'arena, K, V> = HashMap<K, V, DefaultHashBuilder, &'arena Bump>;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,

    stats: RefCell<SessionStats>,

    /// `None` records a call site known to be unresolved.
    resolved_methods: RefCell<ArenaMap<'arena, MethodCacheKey, Option<ResolvedMethodMirror>>>,

    method_mirrors: RefCell<ArenaMap<'arena, MethodId, ResolvedMethodMirror>>,

    field_attributes: RefCell<ArenaMap<'arena, FieldCacheKey, FieldAttributes>>,

    known_objects: RefCell<bumpalo::collections::Vec<'arena, ObjectHandle>>,

    current_method: Cell<Option<MethodId>>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            resolved_methods: RefCell::new(HashMap::new_in(arena)),
            method_mirrors: RefCell::new(HashMap::new_in(arena)),
            field_attributes: RefCell::new(HashMap::new_in(arena)),
            known_objects: RefCell::new(bumpalo::collections::Vec::new_in(arena)),
            current_method: Cell::new(None),
        }
    }

    /// Fresh code buffer living in the arena.
    pub fn code_buffer(&self) -> bumpalo::collections::Vec<'arena, u8> {
        bumpalo::collections::Vec::new_in(self.arena)
    }

    pub fn set_current_method(&self, method: MethodId) {
        self.current_method.set(Some(method));
    }

    pub fn current_method(&self) -> Option<MethodId> {
        self.current_method.get()
    }

    /// Cached resolution: `Some(None)` means "known unresolved".
    pub fn cached_resolved_method(&self, key: &MethodCacheKey) -> Option<Option<ResolvedMethodMirror>> {
        let cached = self.resolved_methods.borrow().get(key).cloned();
        if cached.is_some() {
            self.record_cache_hit();
        }
        cached
    }

    pub fn cache_resolved_method(&self, key: MethodCacheKey, mirror: Option<ResolvedMethodMirror>) {
        if let Some(mirror) = &mirror {
            self.cache_method_mirror(mirror.clone());
        }
        self.resolved_methods.borrow_mut().insert(key, mirror);
    }

    pub fn cached_method_mirror(&self, method: MethodId) -> Option<ResolvedMethodMirror> {
        let cached = self.method_mirrors.borrow().get(&method).cloned();
        if cached.is_some() {
            self.record_cache_hit();
        }
        cached
    }

    pub fn cache_method_mirror(&self, mirror: ResolvedMethodMirror) {
        let mut mirrors = self.method_mirrors.borrow_mut();
        if !mirrors.contains_key(&mirror.method) {
            self.stats.borrow_mut().mirrors_created += 1;
        }
        mirrors.insert(mirror.method, mirror);
    }

    pub fn cached_field_attributes(&self, key: &FieldCacheKey) -> Option<FieldAttributes> {
        let cached = self.field_attributes.borrow().get(key).copied();
        if cached.is_some() {
            self.record_cache_hit();
        }
        cached
    }

    pub fn cache_field_attributes(&self, key: FieldCacheKey, attrs: FieldAttributes) {
        self.field_attributes.borrow_mut().insert(key, attrs);
    }

    /// Index of `handle` in the known-object table, adding it if new.
    pub fn known_object_index(&self, handle: ObjectHandle) -> KnownObjectIndex {
        let mut table = self.known_objects.borrow_mut();
        if let Some(pos) = table.iter().position(|h| *h == handle) {
            return pos as KnownObjectIndex;
        }
        table.push(handle);
        (table.len() - 1) as KnownObjectIndex
    }

    pub fn known_object(&self, index: KnownObjectIndex) -> Option<ObjectHandle> {
        self.known_objects.borrow().get(index as usize).copied()
    }

    pub fn known_object_count(&self) -> usize {
        self.known_objects.borrow().len()
    }

    /// Drop every per-compilation cache; the arena itself is reclaimed with the session.
    pub fn clear_caches(&self) {
        self.resolved_methods.borrow_mut().clear();
        self.method_mirrors.borrow_mut().clear();
        self.field_attributes.borrow_mut().clear();
        self.known_objects.borrow_mut().clear();
    }

    pub fn record_rpc(&self, kind: MessageType) {
        let mut stats = self.stats.borrow_mut();
        stats.rpcs_issued += 1;
        *stats.rpc_counts.entry(kind).or_insert(0) += 1;
    }

    pub fn record_cache_hit(&self) {
        self.stats.borrow_mut().cache_hits += 1;
    }

    pub fn record_code_emitted(&self, size: usize) {
        self.stats.borrow_mut().code_size += size;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }

    pub fn memory_used(&self) -> usize {
        self.arena.allocated_bytes()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Round trips to the client.
    pub rpcs_issued: usize,

    /// Queries answered without a round trip.
    pub cache_hits: usize,

    pub rpc_counts: HashMap<MessageType, usize>,

    pub mirrors_created: usize,

    /// Code bytes emitted.
    pub code_size: usize,
}

impl SessionStats {
    pub fn rpcs_of(&self, kind: MessageType) -> usize {
        self.rpc_counts.get(&kind).copied().unwrap_or(0)
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  RPCs issued: {}", self.rpcs_issued)?;
        writeln!(f, "  Cache hits: {}", self.cache_hits)?;
        writeln!(f, "  Method mirrors created: {}", self.mirrors_created)?;
        writeln!(f, "  Code size: {} bytes", self.code_size)?;

        if !self.rpc_counts.is_empty() {
            writeln!(f, "  RPC breakdown:")?;
            let mut sorted: Vec<_> = self.rpc_counts.iter().collect();
            sorted.sort_by_key(|(_, count)| std::cmp::Reverse(**count));

            for (kind, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", kind, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mirror::{FieldType, JittedBodyInfo};
    use crate::core::ids::ConstantPoolId;

    fn key(cp_index: u32) -> MethodCacheKey {
        MethodCacheKey {
            kind: ResolutionKind::Virtual,
            owning_class: ClassId::new(0x100),
            cp_index,
            target_class: None,
        }
    }

    fn mirror() -> ResolvedMethodMirror {
        ResolvedMethodMirror {
            method: MethodId::new(0x200),
            owning_class: ClassId::new(0x100),
            literals: ConstantPoolId::new(0x300),
            name: "run".to_string(),
            signature: "()V".to_string(),
            is_static: false,
            is_final: false,
            is_private: false,
            is_abstract: false,
            is_synchronized: false,
            is_jni_native: false,
            is_interpreted: true,
            vtable_slot: Some(3),
            recognized: None,
            body: JittedBodyInfo {
                is_compiled: false,
                invocation_count: 10,
                start_address: None,
            },
        }
    }

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.rpcs_issued, 0);
        assert_eq!(stats.cache_hits, 0);
        assert!(session.current_method().is_none());
    }

    #[test]
    fn test_resolved_method_cache() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        assert!(session.cached_resolved_method(&key(1)).is_none());
        session.cache_resolved_method(key(1), Some(mirror()));
        session.cache_resolved_method(key(2), None);

        assert_eq!(session.cached_resolved_method(&key(1)), Some(Some(mirror())));
        assert_eq!(session.cached_resolved_method(&key(2)), Some(None));
        let stats = session.stats();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.mirrors_created, 1);

        assert_eq!(session.cached_method_mirror(MethodId::new(0x200)), Some(mirror()));

        session.clear_caches();
        assert!(session.cached_resolved_method(&key(1)).is_none());
        assert!(session.cached_method_mirror(MethodId::new(0x200)).is_none());
    }

    #[test]
    fn test_field_attribute_cache() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let key = FieldCacheKey {
            owning_class: ClassId::new(1),
            cp_index: 4,
            is_static: false,
        };
        let attrs = FieldAttributes {
            declaring_class: Some(ClassId::new(1)),
            offset_or_address: 16,
            field_type: FieldType::Int,
            is_volatile: false,
            is_final: false,
            is_private: true,
            unresolved_in_cp: false,
        };
        session.cache_field_attributes(key, attrs);
        assert_eq!(session.cached_field_attributes(&key), Some(attrs));
    }

    #[test]
    fn test_known_object_table() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let a = session.known_object_index(ObjectHandle::new(0xa0));
        let b = session.known_object_index(ObjectHandle::new(0xb0));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(session.known_object_index(ObjectHandle::new(0xa0)), 0);
        assert_eq!(session.known_object(1), Some(ObjectHandle::new(0xb0)));
        assert_eq!(session.known_object(7), None);
        assert_eq!(session.known_object_count(), 2);
    }

    #[test]
    fn test_caches_grow_the_arena() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let before = session.memory_used();

        for cp_index in 0..64 {
            session.cache_resolved_method(key(cp_index), Some(mirror()));
        }
        assert!(session.memory_used() > before);
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_rpc(MessageType::VmGetSuperClass);
        session.record_rpc(MessageType::VmGetSuperClass);
        session.record_rpc(MessageType::ClassEnvGetClassInfo);
        session.record_code_emitted(64);

        let stats = session.stats();
        assert_eq!(stats.rpcs_of(MessageType::VmGetSuperClass), 2);
        let output = format!("{}", stats);
        assert!(output.contains("RPCs issued: 3"));
        assert!(output.contains("VmGetSuperClass: 2"));
        assert!(output.contains("Code size: 64 bytes"));
    }
}
