// This module implements RemoteVmProxy, the server-side stand-in for the client's VM. It
// satisfies the same VmQuery surface the compiler would use next to a local VM; each query
// first consults the caches of the client session (shared by every compilation of that
// client) or of the current compilation session, and only on a miss issues exactly one RPC
// over the compilation's stream and stores the answer. Class metadata is fetched in one
// batched ClassEnvGetClassInfo call and then serves superclass, depth and flags, loader,
// component class and the rest without further round trips. Values that can change while
// the client runs (breakpoints, overriding, call site targets, compilation state) are always
// asked for; values that only move one way (class initialized, array class created) are
// cached once they reach their final state. A fetched class info is only cached when no
// unload or redefinition evicted classes while the query was in flight. Before any RPC the
// proxy checks the interrupt flag raised when unloaded or redefined classes were processed
// for this client, and gives up with StreamError::Interrupted instead of continuing the
// dialogue; it also charges the compilation's arena to the server's memory accounting.

//! Server-side proxy of the client VM.

use crate::core::error::StreamError;
use crate::core::ids::{ClassId, KnownObjectIndex, LoaderId, MethodId, ObjectHandle};
use crate::core::session::{CompilationSession, FieldCacheKey, MethodCacheKey};
use crate::core::vm::{VmQuery, VmResult};
use crate::protocol::message::{ClassChain, MessageType};
use crate::protocol::mirror::{
    ClassFlags, ClassInfo, FieldAttributes, JittedBodyInfo, ResolutionKind, ResolvedMethodMirror,
    VmInfo,
};
use crate::protocol::stream::Stream;
use crate::server::client_session::ClientSessionData;
use crate::server::load::ActiveCompilation;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct RemoteVmProxy<'a, 'arena> {
    stream: RefCell<&'a mut Stream>,
    client: &'a ClientSessionData,
    session: &'a CompilationSession<'arena>,
    interrupt: Arc<AtomicBool>,
    /// The client answered a query with a compilation-interrupted notice.
    peer_interrupted: Cell<bool>,
    memory: Option<&'a ActiveCompilation<'a>>,
}

impl<'a, 'arena> RemoteVmProxy<'a, 'arena> {
    pub fn new(
        stream: &'a mut Stream,
        client: &'a ClientSessionData,
        session: &'a CompilationSession<'arena>,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        Self {
            stream: RefCell::new(stream),
            client,
            session,
            interrupt,
            peer_interrupted: Cell::new(false),
            memory: None,
        }
    }

    /// Charge the compilation's arena to `active` while the compilation runs.
    pub fn with_memory_accounting(mut self, active: &'a ActiveCompilation<'a>) -> Self {
        self.memory = Some(active);
        self
    }

    fn account_memory(&self) {
        if let Some(active) = self.memory {
            active.charge(self.session.memory_used());
        }
    }

    pub fn client(&self) -> &'a ClientSessionData {
        self.client
    }

    pub fn session(&self) -> &'a CompilationSession<'arena> {
        self.session
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Whether the client abandoned this compilation; it then expects no response.
    pub fn peer_interrupted(&self) -> bool {
        self.peer_interrupted.get()
    }

    fn rpc<A, R>(&self, kind: MessageType, args: &A) -> VmResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.is_interrupted() {
            return Err(StreamError::Interrupted);
        }
        self.account_memory();
        self.session.record_rpc(kind);
        let reply = self.stream.borrow_mut().rpc(kind, args);
        if matches!(reply, Err(StreamError::Interrupted)) {
            self.peer_interrupted.set(true);
        }
        reply
    }

    fn hit<T>(&self, value: T) -> T {
        self.session.record_cache_hit();
        value
    }

    /// Class info from the session cache, fetching it with one RPC on a miss.
    fn with_class_info<R>(&self, class: ClassId, f: impl Fn(&ClassInfo) -> R) -> VmResult<Option<R>> {
        if let Some(result) = self.client.with_class_info(class, &f) {
            return Ok(Some(self.hit(result)));
        }
        let epoch = self.client.class_epoch();
        let fetched: Option<ClassInfo> = self.rpc(MessageType::ClassEnvGetClassInfo, &(class,))?;
        Ok(fetched.map(|info| {
            let result = f(&info);
            if !self.client.cache_class_info(info, epoch) {
                log::debug!("{}: {} was evicted while it was fetched, not caching it", self.client.client_uid(), class);
            }
            result
        }))
    }

    /// Ask the client to stop reserving locks on instances of `class`.
    ///
    /// Returns false without a round trip when the mirrored table already
    /// records the class as not reservable.
    pub fn clear_reservable(&self, class: ClassId) -> VmResult<bool> {
        let reservable = self
            .client
            .chtable()
            .table()
            .find(class)
            .map_or(true, |info| info.is_reservable());
        if !reservable {
            return Ok(self.hit(false));
        }
        self.rpc::<_, ()>(MessageType::ChTableClearReservable, &(class,))?;
        if let Some(info) = self.client.chtable().table_mut().find_mut(class) {
            info.set_reservable(false);
        }
        Ok(true)
    }

    /// Address of the J2I thunk for `signature` on the client, installing it once per session.
    pub fn j2i_thunk(&self, signature: &str) -> VmResult<u64> {
        if let Some(address) = self.client.thunk(signature) {
            return Ok(self.hit(address));
        }
        let thunk = build_j2i_thunk(signature);
        let address: u64 = self.rpc(MessageType::VmSetJ2IThunk, &(signature.to_string(), thunk))?;
        self.client.cache_thunk(signature, address);
        Ok(address)
    }

    pub fn known_object_index(&self, handle: ObjectHandle) -> KnownObjectIndex {
        self.session.known_object_index(handle)
    }

    /// Every subclass of `class` known to the mirrored hierarchy table.
    pub fn subclasses_of(&self, class: ClassId) -> Vec<ClassId> {
        self.client.chtable().collect_all_subclasses(class)
    }
}

/// Machine-independent stand-in for a J2I thunk: one marker byte per argument, `L` for references.
fn build_j2i_thunk(signature: &str) -> Vec<u8> {
    let args = signature
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(args, _)| args)
        .unwrap_or("");
    let mut thunk = vec![0xe9];
    let mut bytes = args.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'L' => {
                thunk.push(b'L');
                bytes.by_ref().find(|&c| c == b';');
            }
            b'[' => {
                thunk.push(b'L');
                loop {
                    match bytes.next() {
                        Some(b'[') => continue,
                        Some(b'L') => {
                            bytes.by_ref().find(|&c| c == b';');
                            break;
                        }
                        _ => break,
                    }
                }
            }
            other => thunk.push(other),
        }
    }
    thunk
}

fn resolution_message(kind: ResolutionKind) -> MessageType {
    match kind {
        ResolutionKind::Static => MessageType::ResolvedMethodGetResolvedStatic,
        ResolutionKind::Special => MessageType::ResolvedMethodGetResolvedSpecial,
        ResolutionKind::Virtual => MessageType::ResolvedMethodGetResolvedVirtual,
        ResolutionKind::Interface => MessageType::ResolvedMethodGetResolvedInterface,
    }
}

impl VmQuery for RemoteVmProxy<'_, '_> {
    fn super_class(&self, class: ClassId) -> VmResult<Option<ClassId>> {
        match self.with_class_info(class, |info| info.super_class)? {
            Some(super_class) => Ok(super_class),
            None => self.rpc(MessageType::VmGetSuperClass, &(class,)),
        }
    }

    fn is_instance_of(&self, class: ClassId, target: ClassId) -> VmResult<bool> {
        if class == target {
            return Ok(true);
        }
        let target_is_interface = self.client.with_class_info(target, |info| info.flags.is_interface());
        if target_is_interface == Some(false) {
            // Walk the superclass chain through the cache; any gap falls back to the client.
            let mut current = Some(class);
            while let Some(c) = current {
                if c == target {
                    return Ok(self.hit(true));
                }
                match self.client.with_class_info(c, |info| info.super_class) {
                    Some(next) => current = next,
                    None => return self.rpc(MessageType::VmIsInstanceOf, &(class, target)),
                }
            }
            return Ok(self.hit(false));
        }
        self.rpc(MessageType::VmIsInstanceOf, &(class, target))
    }

    fn system_class_from_name(&self, name: &str) -> VmResult<Option<ClassId>> {
        if let Some(class) = self.client.system_class(name) {
            return Ok(Some(self.hit(class)));
        }
        let class: Option<ClassId> =
            self.rpc(MessageType::VmGetSystemClassFromClassName, &(name.to_string(),))?;
        if let Some(class) = class {
            self.client.cache_system_class(name, class);
        }
        Ok(class)
    }

    fn class_of_method(&self, method: MethodId) -> VmResult<Option<ClassId>> {
        if let Some(class) = self.client.class_of_method(method) {
            return Ok(Some(self.hit(class)));
        }
        let class: Option<ClassId> = self.rpc(MessageType::VmGetClassOfMethod, &(method,))?;
        if let Some(class) = class {
            self.client.cache_class_of_method(method, class);
        }
        Ok(class)
    }

    fn class_from_signature(&self, signature: &str, context: ClassId) -> VmResult<Option<ClassId>> {
        self.rpc(
            MessageType::VmGetClassFromSignature,
            &(signature.to_string(), context),
        )
    }

    fn class_has_been_extended(&self, class: ClassId) -> VmResult<bool> {
        {
            let chtable = self.client.chtable();
            if chtable.is_initialized() && chtable.table().contains(class) {
                return Ok(self.hit(chtable.has_been_extended(class)));
            }
        }
        self.rpc(MessageType::VmClassHasBeenExtended, &(class,))
    }

    fn class_has_been_replaced(&self, class: ClassId) -> VmResult<bool> {
        self.rpc(MessageType::VmClassHasBeenReplaced, &(class,))
    }

    fn is_class_initialized(&self, class: ClassId) -> VmResult<bool> {
        if self.client.with_class_info(class, |info| info.initialized) == Some(true) {
            return Ok(self.hit(true));
        }
        let initialized: bool = self.rpc(MessageType::VmIsClassInitialized, &(class,))?;
        if initialized {
            self.client.update_class_info(class, |info| info.initialized = true);
        }
        Ok(initialized)
    }

    fn class_depth_and_flags(&self, class: ClassId) -> VmResult<Option<(u32, ClassFlags)>> {
        match self.with_class_info(class, |info| (info.depth, info.flags))? {
            Some(result) => Ok(Some(result)),
            None => self.rpc(MessageType::VmGetClassDepthAndFlags, &(class,)),
        }
    }

    fn instance_field_offset(&self, class: ClassId, name: &str, signature: &str) -> VmResult<Option<u32>> {
        if let Some(offset) = self.client.field_offset(class, name, signature) {
            return Ok(self.hit(offset));
        }
        let offset: Option<u32> = self.rpc(
            MessageType::VmGetInstanceFieldOffset,
            &(class, name.to_string(), signature.to_string()),
        )?;
        self.client.cache_field_offset(class, name, signature, offset);
        Ok(offset)
    }

    fn component_class(&self, class: ClassId) -> VmResult<Option<ClassId>> {
        match self.with_class_info(class, |info| info.component_class)? {
            Some(component) => Ok(component),
            None => self.rpc(MessageType::VmGetComponentClass, &(class,)),
        }
    }

    fn array_class(&self, class: ClassId) -> VmResult<Option<ClassId>> {
        if let Some(Some(array)) = self.client.with_class_info(class, |info| info.array_class) {
            return Ok(Some(self.hit(array)));
        }
        let array: Option<ClassId> = self.rpc(MessageType::VmGetArrayClass, &(class,))?;
        if let Some(array) = array {
            self.client.update_class_info(class, |info| info.array_class = Some(array));
        }
        Ok(array)
    }

    fn class_loader(&self, class: ClassId) -> VmResult<Option<LoaderId>> {
        match self.with_class_info(class, |info| info.loader)? {
            Some(loader) => Ok(Some(loader)),
            None => self.rpc(MessageType::VmGetClassLoader, &(class,)),
        }
    }

    fn is_method_breakpointed(&self, method: MethodId) -> VmResult<bool> {
        self.rpc(MessageType::VmIsMethodBreakpointed, &(method,))
    }

    fn string_utf8_length(&self, string: ObjectHandle) -> VmResult<Option<usize>> {
        let length: Option<u64> = self.rpc(MessageType::VmGetStringUtf8Length, &(string,))?;
        Ok(length.map(|l| l as usize))
    }

    fn mutable_call_site_epoch(&self, call_site: ObjectHandle) -> VmResult<Option<u64>> {
        self.rpc(MessageType::VmGetMutableCallSiteEpoch, &(call_site,))
    }

    fn vm_info(&self) -> VmResult<VmInfo> {
        if let Some(info) = self.client.vm_info() {
            return Ok(self.hit(info));
        }
        let info: VmInfo = self.rpc(MessageType::VmGetVmInfo, &())?;
        self.client.cache_vm_info(info.clone());
        Ok(info)
    }

    fn class_info(&self, class: ClassId) -> VmResult<Option<ClassInfo>> {
        self.with_class_info(class, |info| info.clone())
    }

    fn method_mirror(&self, method: MethodId) -> VmResult<Option<ResolvedMethodMirror>> {
        if let Some(mirror) = self.session.cached_method_mirror(method) {
            return Ok(Some(mirror));
        }
        let mirror: Option<ResolvedMethodMirror> =
            self.rpc(MessageType::ResolvedMethodGetMirror, &(method,))?;
        if let Some(mirror) = &mirror {
            self.session.cache_method_mirror(mirror.clone());
        }
        Ok(mirror)
    }

    fn resolve_method(
        &self,
        kind: ResolutionKind,
        owning_class: ClassId,
        cp_index: u32,
        target_class: Option<ClassId>,
    ) -> VmResult<Option<ResolvedMethodMirror>> {
        let key = MethodCacheKey {
            kind,
            owning_class,
            cp_index,
            target_class,
        };
        if let Some(cached) = self.session.cached_resolved_method(&key) {
            return Ok(cached);
        }
        let mirror: Option<ResolvedMethodMirror> = self.rpc(
            resolution_message(kind),
            &(owning_class, cp_index, target_class),
        )?;
        self.session.cache_resolved_method(key, mirror.clone());
        Ok(mirror)
    }

    fn virtual_method_is_overridden(&self, method: MethodId) -> VmResult<bool> {
        self.rpc(MessageType::ResolvedMethodVirtualMethodIsOverridden, &(method,))
    }

    fn field_attributes(
        &self,
        owning_class: ClassId,
        cp_index: u32,
        is_static: bool,
    ) -> VmResult<Option<FieldAttributes>> {
        let key = FieldCacheKey {
            owning_class,
            cp_index,
            is_static,
        };
        if let Some(attrs) = self.session.cached_field_attributes(&key) {
            return Ok(Some(attrs));
        }
        let kind = if is_static {
            MessageType::ResolvedMethodStaticAttributes
        } else {
            MessageType::ResolvedMethodFieldAttributes
        };
        let attrs: Option<FieldAttributes> = self.rpc(kind, &(owning_class, cp_index))?;
        if let Some(attrs) = attrs {
            // An unresolved entry may resolve later in this compilation.
            if !attrs.unresolved_in_cp {
                self.session.cache_field_attributes(key, attrs);
            }
        }
        Ok(attrs)
    }

    fn class_from_constant_pool(&self, owning_class: ClassId, cp_index: u32) -> VmResult<Option<ClassId>> {
        self.rpc(
            MessageType::ResolvedMethodGetClassFromConstantPool,
            &(owning_class, cp_index),
        )
    }

    fn jitted_body_info(&self, method: MethodId) -> VmResult<Option<JittedBodyInfo>> {
        self.rpc(MessageType::ResolvedMethodGetJittedBodyInfo, &(method,))
    }

    fn is_compiled(&self, method: MethodId) -> VmResult<bool> {
        self.rpc(MessageType::CompInfoIsCompiled, &(method,))
    }

    fn invocation_count(&self, method: MethodId) -> VmResult<Option<u32>> {
        self.rpc(MessageType::CompInfoGetInvocationCount, &(method,))
    }

    fn class_chain(&self, class: ClassId) -> VmResult<Option<ClassChain>> {
        self.rpc(MessageType::SharedCacheGetClassChainOffset, &(class,))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::ConstantPoolId;
    use crate::core::test_utils::test::TestContext;
    use crate::protocol::stream::stream_pair;
    use std::thread;

    fn class_a_info() -> ClassInfo {
        ClassInfo {
            class: ClassId::new(0xa),
            name: "A".to_string(),
            rom_class: vec![],
            super_class: Some(ClassId::new(0x1)),
            interfaces: vec![],
            depth: 1,
            flags: ClassFlags::default(),
            loader: LoaderId::new(0x5),
            constant_pool: ConstantPoolId::new(0xac),
            component_class: None,
            array_class: None,
            initialized: false,
            methods: vec![],
        }
    }

    /// Answer `count` class-info queries for class A, then report how many were seen.
    fn scripted_client(mut stream: Stream, count: usize) -> thread::JoinHandle<usize> {
        thread::spawn(move || {
            let mut seen = 0;
            for _ in 0..count {
                match stream.read() {
                    Ok(MessageType::ClassEnvGetClassInfo) => {
                        let (_class,): (ClassId,) = stream.recv_data().unwrap();
                        stream
                            .write(MessageType::ClassEnvGetClassInfo, &Some(class_a_info()))
                            .unwrap();
                        seen += 1;
                    }
                    _ => break,
                }
            }
            seen
        })
    }

    #[test]
    fn test_super_class_is_fetched_once() {
        let (mut server, client) = stream_pair();
        let responder = scripted_client(client, 1);

        let ctx = TestContext::new();
        let ((first, second, loader), session) = ctx.with_proxy(&mut server, false, |proxy| {
            (
                proxy.super_class(ClassId::new(0xa)).unwrap(),
                proxy.super_class(ClassId::new(0xa)).unwrap(),
                proxy.class_loader(ClassId::new(0xa)).unwrap(),
            )
        });
        assert_eq!(first, Some(ClassId::new(0x1)));
        assert_eq!(first, second);
        assert_eq!(loader, Some(LoaderId::new(0x5)));

        let stats = session.stats();
        assert_eq!(stats.rpcs_issued, 1);
        assert_eq!(stats.cache_hits, 2);
        server.shutdown();
        assert_eq!(responder.join().unwrap(), 1);
    }

    #[test]
    fn test_interrupted_proxy_issues_no_rpc() {
        let (mut server, _client) = stream_pair();
        let ctx = TestContext::new();
        let (result, session) = ctx.with_proxy(&mut server, true, |proxy| {
            proxy.is_method_breakpointed(MethodId::new(1))
        });
        assert_eq!(result, Err(StreamError::Interrupted));
        assert_eq!(session.stats().rpcs_issued, 0);
    }

    #[test]
    fn test_j2i_thunk_bytes() {
        assert_eq!(build_j2i_thunk("(ILjava/lang/Object;J)V"), vec![0xe9, b'I', b'L', b'J']);
        assert_eq!(build_j2i_thunk("([[I[Ljava/lang/String;D)V"), vec![0xe9, b'L', b'L', b'D']);
        assert_eq!(build_j2i_thunk("garbage"), vec![0xe9]);
    }
}
