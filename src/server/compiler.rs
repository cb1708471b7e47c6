// This module defines the boundary between the remote-compilation machinery and the code
// generator that actually compiles a method. The optimizer, inliner and instruction selection
// live outside this crate; what the server needs from them is captured by the MethodCompiler
// trait: given the request and a VmQuery implementation (the RemoteVmProxy when compiling for a
// remote client), produce code bytes, data bytes, the hierarchy assumptions taken along the way
// and the methods that need call trampolines. PlaceholderCompiler is the built-in implementation used
// by the demo binary and the tests. It does the kind of querying a real optimizer does against
// the VM surface (class info, method resolution, overriding checks, field attributes, thunk
// installation, clearing lock reservation for synchronized methods of extended classes) and
// records an assumption for every speculative decision, emitting a
// placeholder instruction stream with one patchable site per guard. Its behavior is tuned by
// the request's option string, for example `callSites=3,fields=2`.

//! Compiler hook used by the server to compile one method.

use crate::core::error::{CompilationErrorCode, CompileFailure};
use crate::core::ids::{ClassId, MethodId};
use crate::core::session::CompilationSession;
use crate::core::vm::VmQuery;
use crate::protocol::commit_data::{CommitData, GuardAssumption, PatchSite, SideEffectSite, VirtualGuardSite};
use crate::protocol::message::{CompilationRequest, OptLevel};
use crate::protocol::mirror::{ResolutionKind, ResolvedMethodMirror};
use crate::server::vm_proxy::RemoteVmProxy;
use std::fmt::Write;

/// Base address the server pretends its code buffer starts at; clients rebase against it.
pub const SERVER_CODE_BASE: u64 = 0x7f00_0000_0000;

/// Output of one compilation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledBody {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub commit: CommitData,
    pub log: String,
    pub trampoline_methods: Vec<MethodId>,
}

/// Compiles one method on behalf of a client.
///
/// Implementations must reach the client only through `vm` so they work the
/// same against a local VM and a remote one. A query error (interrupt or
/// stream failure) must be returned, not swallowed.
pub trait MethodCompiler: Send + Sync {
    fn compile<'arena>(
        &self,
        request: &CompilationRequest,
        vm: &RemoteVmProxy<'_, 'arena>,
        session: &CompilationSession<'arena>,
    ) -> Result<CompiledBody, CompileFailure>;
}

/// Options understood by [`PlaceholderCompiler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderOptions {
    /// Constant-pool indices 1..=call_sites are treated as virtual invokes.
    pub call_sites: u32,
    /// Constant-pool indices after the call sites treated as static field loads.
    pub fields: u32,
    /// Panic inside the compiler, to exercise the crash path.
    pub crash: bool,
}

impl Default for PlaceholderOptions {
    fn default() -> Self {
        Self {
            call_sites: 2,
            fields: 1,
            crash: false,
        }
    }
}

impl PlaceholderOptions {
    pub fn parse(options: &str) -> Self {
        let mut parsed = PlaceholderOptions::default();
        for item in options.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item.split_once('=') {
                Some(("callSites", n)) => parsed.call_sites = n.parse().unwrap_or(parsed.call_sites),
                Some(("fields", n)) => parsed.fields = n.parse().unwrap_or(parsed.fields),
                None if item == "crash" => parsed.crash = true,
                _ => log::debug!("ignoring unknown compiler option '{}'", item),
            }
        }
        parsed
    }
}

const NOP5: [u8; 5] = [0x0f, 0x1f, 0x44, 0x00, 0x00];
const CALL_REL32: u8 = 0xe8;
const RET: u8 = 0xc3;

/// Emits placeholder code while exercising the VM query surface the way an optimizer does.
#[derive(Debug, Default)]
pub struct PlaceholderCompiler;

struct Emitter<'s, 'arena> {
    code: bumpalo::collections::Vec<'arena, u8>,
    slow_paths: Vec<usize>,
    session: &'s CompilationSession<'arena>,
}

impl<'s, 'arena> Emitter<'s, 'arena> {
    fn new(session: &'s CompilationSession<'arena>) -> Self {
        Self {
            code: session.code_buffer(),
            slow_paths: Vec::new(),
            session,
        }
    }

    fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a nop-able guard; its slow path is laid out after the main line.
    fn guard(&mut self) -> usize {
        let at = self.offset();
        self.code.extend_from_slice(&NOP5);
        self.slow_paths.push(at);
        at
    }

    fn call(&mut self) {
        self.code.push(CALL_REL32);
        self.code.extend_from_slice(&[0; 4]);
    }

    /// Close the main line and place slow paths; returns the patch sites of all guards.
    fn finish(mut self) -> (Vec<u8>, Vec<PatchSite>) {
        self.code.push(RET);
        let mut sites = Vec::with_capacity(self.slow_paths.len());
        for &guard_at in &self.slow_paths {
            let slow_path = self.code.len();
            self.code.push(CALL_REL32);
            self.code.extend_from_slice(&[0; 4]);
            self.code.push(RET);
            sites.push(PatchSite {
                location: SERVER_CODE_BASE + guard_at as u64,
                destination: SERVER_CODE_BASE + slow_path as u64,
            });
        }
        self.session.record_code_emitted(self.code.len());
        (self.code.to_vec(), sites)
    }
}

enum PendingGuard {
    Virtual(GuardAssumption),
    SideEffect(ClassId),
}

impl PlaceholderCompiler {
    fn devirtualize(
        &self,
        vm: &RemoteVmProxy<'_, '_>,
        callee: &ResolvedMethodMirror,
        commit: &mut CommitData,
    ) -> Result<Option<GuardAssumption>, CompileFailure> {
        if !callee.is_virtual_dispatch() {
            return Ok(None);
        }
        if let Some((_, flags)) = vm.class_depth_and_flags(callee.owning_class)? {
            if flags.is_abstract() || flags.is_interface() {
                let implementers = vm.subclasses_of(callee.owning_class);
                if let [implementer] = implementers[..] {
                    commit.classes_not_newly_extended.push(implementer);
                    return Ok(Some(GuardAssumption::SingleImplementer {
                        class: callee.owning_class,
                        implementer,
                    }));
                }
                return Ok(None);
            }
        }
        if vm.virtual_method_is_overridden(callee.method)? {
            return Ok(None);
        }
        commit.preexistence_methods.push(callee.method);
        Ok(Some(GuardAssumption::NonOverridden { method: callee.method }))
    }
}

impl MethodCompiler for PlaceholderCompiler {
    fn compile<'arena>(
        &self,
        request: &CompilationRequest,
        vm: &RemoteVmProxy<'_, 'arena>,
        session: &CompilationSession<'arena>,
    ) -> Result<CompiledBody, CompileFailure> {
        let options = PlaceholderOptions::parse(&request.options);
        let mut log = String::new();
        let mut commit = CommitData {
            server_code_start: SERVER_CODE_BASE,
            ..CommitData::default()
        };
        let mut trampolines = Vec::new();
        let mut pending = Vec::new();

        session.set_current_method(request.method);
        let info = vm.vm_info()?;
        let method = vm
            .method_mirror(request.method)?
            .ok_or_else(|| CompileFailure::new(CompilationErrorCode::Failure, "method is not known to the client"))?;
        let class = vm
            .class_info(method.owning_class)?
            .ok_or_else(|| CompileFailure::new(CompilationErrorCode::Failure, "class is not known to the client"))?;
        let _ = writeln!(
            log,
            "compiling {}.{}{} at {:?} ({}-bit)",
            class.name,
            method.name,
            method.signature,
            request.opt_level,
            info.pointer_size * 8
        );

        if options.crash {
            panic!("placeholder compiler asked to crash on {}", request.method);
        }
        if vm.is_method_breakpointed(method.method)? {
            return Err(CompileFailure::new(CompilationErrorCode::NotNeeded, "method is breakpointed"));
        }

        if method.is_synchronized && !method.is_static && vm.class_has_been_extended(class.class)? {
            let cleared = vm.clear_reservable(class.class)?;
            let _ = writeln!(log, "  lock reservation of {} cleared: {}", class.name, cleared);
        }

        let mut emitter = Emitter::new(session);
        // Guards are recorded in emission order so they pair up with their patch sites.
        if request.opt_level >= OptLevel::Hot && !vm.class_has_been_extended(class.class)? {
            commit.classes_not_newly_extended.push(class.class);
            commit.preexistence_classes.push(class.class);
            emitter.guard();
            pending.push(PendingGuard::Virtual(GuardAssumption::ClassExtend { class: class.class }));
        }

        for cp_index in 1..=options.call_sites {
            let Some(callee) = vm.resolve_method(ResolutionKind::Virtual, class.class, cp_index, None)? else {
                let _ = writeln!(log, "  cp {}: unresolved call", cp_index);
                emitter.call();
                continue;
            };
            match self.devirtualize(vm, &callee, &mut commit)? {
                Some(assumption) => {
                    let _ = writeln!(log, "  cp {}: inlined {} under {:?}", cp_index, callee.name, assumption);
                    emitter.guard();
                    pending.push(PendingGuard::Virtual(assumption));
                }
                None => {
                    if callee.is_jni_native {
                        vm.j2i_thunk(&callee.signature)?;
                    }
                    if !callee.is_virtual_dispatch() {
                        trampolines.push(callee.method);
                    }
                    emitter.call();
                }
            }
        }

        let mut data = Vec::new();
        for cp_index in options.call_sites + 1..=options.call_sites + options.fields {
            let Some(attrs) = vm.field_attributes(class.class, cp_index, true)? else {
                continue;
            };
            let Some(declaring) = attrs.declaring_class else {
                continue;
            };
            if attrs.is_final && !vm.client().has_illegal_final_modification(declaring) {
                commit.static_final_field_classes.push(declaring);
                data.extend_from_slice(&attrs.offset_or_address.to_le_bytes());
            }
            if !vm.is_class_initialized(declaring)? {
                emitter.guard();
                pending.push(PendingGuard::SideEffect(declaring));
            }
        }

        let (code, sites) = emitter.finish();
        for (guard, site) in pending.into_iter().zip(sites) {
            match guard {
                PendingGuard::Virtual(assumption) => commit.virtual_guards.push(VirtualGuardSite { assumption, site }),
                PendingGuard::SideEffect(class) => commit.side_effect_sites.push(SideEffectSite { class, site }),
            }
        }

        let _ = writeln!(log, "emitted {} code bytes, {} RPCs", code.len(), session.stats().rpcs_issued);
        Ok(CompiledBody {
            code,
            data,
            commit,
            log,
            trampoline_methods: trampolines,
        })
    }
}
