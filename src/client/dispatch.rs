// This module is the client's message dispatcher. While the server compiles, it sends queries
// back to the client; each one is answered here from the client's own VM and hierarchy table.
// dispatch takes the kind returned by the last read, decodes the argument tuple that kind is
// defined with, and encodes the reply without sending it, so the caller can give up VM access
// before blocking on the network. Terminal kinds end the dialogue and leave their payload for
// the caller to decode. Kinds that can never arrive from the server are a protocol error.
// When the calling compilation has been interrupted, the query is not answered: its payload is
// discarded and a CompilationInterrupted notice is prepared in place of the reply.

//! Answering server queries from the client VM.

use crate::chtable::client::ClientChTable;
use crate::core::error::{StreamError, StreamResult};
use crate::core::ids::{ClassId, MethodId, ObjectHandle};
use crate::core::vm::{ClientVm, VmResult};
use crate::protocol::message::MessageType;
use crate::protocol::mirror::ResolutionKind;
use crate::protocol::stream::{Frame, Stream};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Client state a query may read or update.
pub struct QueryContext<'a> {
    pub vm: &'a dyn ClientVm,
    pub chtable: &'a Mutex<ClientChTable>,
    /// Raised when the compilation waiting on this dialogue should be abandoned.
    pub interrupted: &'a AtomicBool,
}

/// What to do after one received message.
#[derive(Debug)]
pub enum Dispatch {
    /// Send this reply and keep reading.
    Reply(Frame),
    /// Send this notice and stop; the compilation is abandoned.
    Abandon(Frame),
    /// A terminal message arrived; its payload is still pending on the stream.
    Done(MessageType),
}

/// Handle the message of `kind` just returned by `stream.read()`.
pub fn dispatch(ctx: &QueryContext<'_>, stream: &mut Stream, kind: MessageType) -> StreamResult<Dispatch> {
    if kind.is_terminal() {
        return Ok(Dispatch::Done(kind));
    }
    if !kind.is_server_query() {
        return Err(StreamError::mismatch(format!("{} is not sent by the server", kind)));
    }
    if ctx.interrupted.load(Ordering::Acquire) {
        stream.discard_pending();
        log::debug!("compilation interrupted, not answering {}", kind);
        return Ok(Dispatch::Abandon(stream.prepare(MessageType::CompilationInterrupted, &())?));
    }
    answer(ctx, stream, kind).map(Dispatch::Reply)
}

/// Decode the arguments, compute the answer and encode it as the reply to `kind`.
fn reply<A, R>(stream: &mut Stream, kind: MessageType, f: impl FnOnce(A) -> VmResult<R>) -> StreamResult<Frame>
where
    A: DeserializeOwned,
    R: Serialize,
{
    let args: A = stream.recv_data()?;
    let result = f(args)?;
    stream.prepare(kind, &result)
}

fn resolution_kind(kind: MessageType) -> Option<ResolutionKind> {
    match kind {
        MessageType::ResolvedMethodGetResolvedStatic => Some(ResolutionKind::Static),
        MessageType::ResolvedMethodGetResolvedSpecial => Some(ResolutionKind::Special),
        MessageType::ResolvedMethodGetResolvedVirtual => Some(ResolutionKind::Virtual),
        MessageType::ResolvedMethodGetResolvedInterface => Some(ResolutionKind::Interface),
        _ => None,
    }
}

fn answer(ctx: &QueryContext<'_>, stream: &mut Stream, kind: MessageType) -> StreamResult<Frame> {
    let vm = ctx.vm;
    if let Some(resolution) = resolution_kind(kind) {
        return reply(stream, kind, |(owning, cp_index, target): (ClassId, u32, Option<ClassId>)| {
            vm.resolve_method(resolution, owning, cp_index, target)
        });
    }

    use MessageType as M;
    match kind {
        M::VmGetSuperClass => reply(stream, kind, |(class,): (ClassId,)| vm.super_class(class)),
        M::VmIsInstanceOf => reply(stream, kind, |(class, target): (ClassId, ClassId)| {
            vm.is_instance_of(class, target)
        }),
        M::VmGetSystemClassFromClassName => reply(stream, kind, |(name,): (String,)| {
            vm.system_class_from_name(&name)
        }),
        M::VmGetClassOfMethod => reply(stream, kind, |(method,): (MethodId,)| vm.class_of_method(method)),
        M::VmGetClassFromSignature => reply(stream, kind, |(signature, context): (String, ClassId)| {
            vm.class_from_signature(&signature, context)
        }),
        M::VmClassHasBeenExtended => reply(stream, kind, |(class,): (ClassId,)| vm.class_has_been_extended(class)),
        M::VmClassHasBeenReplaced => reply(stream, kind, |(class,): (ClassId,)| vm.class_has_been_replaced(class)),
        M::VmIsClassInitialized => reply(stream, kind, |(class,): (ClassId,)| vm.is_class_initialized(class)),
        M::VmGetClassDepthAndFlags => reply(stream, kind, |(class,): (ClassId,)| vm.class_depth_and_flags(class)),
        M::VmGetInstanceFieldOffset => reply(stream, kind, |(class, name, signature): (ClassId, String, String)| {
            vm.instance_field_offset(class, &name, &signature)
        }),
        M::VmGetComponentClass => reply(stream, kind, |(class,): (ClassId,)| vm.component_class(class)),
        M::VmGetArrayClass => reply(stream, kind, |(class,): (ClassId,)| vm.array_class(class)),
        M::VmGetClassLoader => reply(stream, kind, |(class,): (ClassId,)| vm.class_loader(class)),
        M::VmIsMethodBreakpointed => reply(stream, kind, |(method,): (MethodId,)| vm.is_method_breakpointed(method)),
        M::VmGetStringUtf8Length => reply(stream, kind, |(string,): (ObjectHandle,)| {
            vm.string_utf8_length(string).map(|len| len.map(|l| l as u64))
        }),
        M::VmGetMutableCallSiteEpoch => reply(stream, kind, |(call_site,): (ObjectHandle,)| {
            vm.mutable_call_site_epoch(call_site)
        }),
        M::VmGetVmInfo => reply(stream, kind, |(): ()| vm.vm_info()),
        M::VmSetJ2IThunk => reply(stream, kind, |(signature, thunk): (String, Vec<u8>)| {
            Ok(vm.set_j2i_thunk(&signature, &thunk))
        }),
        M::ClassEnvGetClassInfo => reply(stream, kind, |(class,): (ClassId,)| vm.class_info(class)),
        M::ResolvedMethodGetMirror => reply(stream, kind, |(method,): (MethodId,)| vm.method_mirror(method)),
        M::ResolvedMethodVirtualMethodIsOverridden => reply(stream, kind, |(method,): (MethodId,)| {
            vm.virtual_method_is_overridden(method)
        }),
        M::ResolvedMethodFieldAttributes => reply(stream, kind, |(class, cp_index): (ClassId, u32)| {
            vm.field_attributes(class, cp_index, false)
        }),
        M::ResolvedMethodStaticAttributes => reply(stream, kind, |(class, cp_index): (ClassId, u32)| {
            vm.field_attributes(class, cp_index, true)
        }),
        M::ResolvedMethodGetClassFromConstantPool => reply(stream, kind, |(class, cp_index): (ClassId, u32)| {
            vm.class_from_constant_pool(class, cp_index)
        }),
        M::ResolvedMethodGetJittedBodyInfo => reply(stream, kind, |(method,): (MethodId,)| vm.jitted_body_info(method)),
        M::CompInfoIsCompiled => reply(stream, kind, |(method,): (MethodId,)| vm.is_compiled(method)),
        M::CompInfoGetInvocationCount => reply(stream, kind, |(method,): (MethodId,)| vm.invocation_count(method)),
        M::ChTableGetAllClassInfo => reply(stream, kind, |(): ()| Ok(ctx.chtable.lock().table().serialize_all())),
        M::ChTableClearReservable => reply(stream, kind, |(class,): (ClassId,)| {
            ctx.chtable.lock().clear_reservable(class);
            Ok(())
        }),
        M::SharedCacheGetClassChainOffset => reply(stream, kind, |(class,): (ClassId,)| vm.class_chain(class)),
        other => Err(StreamError::mismatch(format!("no handler for {}", other))),
    }
}
