// This module implements the server side of one compilation dialogue. A connection carries a
// sequence of compilations; each starts with a CompilationRequest (or a session/connection
// terminate notice) and ends with exactly one terminal message, except when the client itself
// abandoned the compilation, in which case it expects nothing. process_entry finds or creates
// the client's session, waits for the request's turn in the client's sequence, applies the
// critical state carried by the request in that order (unloaded and redefined classes evict
// cache entries and interrupt the other in-flight compilations of the client, illegal final
// field modifications are recorded, the hierarchy delta is applied to the mirrored table or
// the whole table is fetched once) and releases the turn so the next request can proceed while
// this one compiles. Requests are refused when server memory is very low; otherwise the AOT
// cache is consulted and the compiler runs against a RemoteVmProxy with a fresh arena, whose
// size is charged to the load monitor before every RPC. A body is only stored in the AOT cache
// once it is known not to have been interrupted, together with its assumptions, which the
// client validates before installing a cached body. A panic inside the compiler is caught and
// reported as a crashed compilation thread. Stream errors
// that leave the byte stream untrustworthy are returned to the caller, which drops the
// connection; everything else is answered with a structured failure and load feedback.

//! Request handling for one client connection.

use crate::chtable::class_info::{ChTableUpdate, SerializedClassInfo};
use crate::core::config::ServerConfig;
use crate::core::error::{CompilationErrorCode, CompileFailure, StreamError, StreamResult};
use crate::core::ids::ClientUid;
use crate::core::session::CompilationSession;
use crate::core::vm::VmQuery;
use crate::protocol::message::{
    AotCacheHitResponse, CompilationCodeResponse, CompilationRequest, CrashReport, MessageType,
    ServerMemoryState,
};
use crate::protocol::stream::Stream;
use crate::server::aot_cache::{AotCache, AotCacheKey, AotRecord};
use crate::server::client_session::ClientSessionData;
use crate::server::compiler::{CompiledBody, MethodCompiler};
use crate::server::load::LoadMonitor;
use crate::server::session_table::ClientSessionTable;
use crate::server::vm_proxy::RemoteVmProxy;
use bumpalo::Bump;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// State shared by every connection of one server process.
pub struct ServerContext {
    pub config: ServerConfig,
    pub sessions: ClientSessionTable,
    pub load: LoadMonitor,
    pub aot_cache: AotCache,
    compiler: Box<dyn MethodCompiler>,
    server_uid: u64,
    compilations: AtomicUsize,
}

impl ServerContext {
    pub fn new(config: ServerConfig, compiler: Box<dyn MethodCompiler>) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_server_uid(config, compiler, nanos ^ ((std::process::id() as u64) << 32))
    }

    /// Context with a fixed identity; clients resynchronize when it changes.
    pub fn with_server_uid(config: ServerConfig, compiler: Box<dyn MethodCompiler>, server_uid: u64) -> Self {
        Self {
            sessions: ClientSessionTable::new(config.session_old_age, config.purge_interval),
            load: LoadMonitor::new(config.memory_budget, config.compilation_threads),
            aot_cache: AotCache::new(),
            config,
            compiler,
            server_uid,
            compilations: AtomicUsize::new(0),
        }
    }

    pub fn server_uid(&self) -> u64 {
        self.server_uid
    }

    /// Number of compilation requests handled so far.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}

/// What the connection should do after one entry was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Serve compilations on `stream` until the client closes it or the stream fails.
pub fn serve_connection(ctx: &ServerContext, mut stream: Stream) {
    loop {
        match process_entry(ctx, &mut stream) {
            Ok(ConnectionState::Open) => {}
            Ok(ConnectionState::Closed) => break,
            Err(StreamError::TransportClosed { reason }) => {
                log::debug!("connection closed: {}", reason);
                break;
            }
            Err(err) => {
                log::error!("dropping connection: {}", err);
                break;
            }
        }
    }
    log::debug!("connection statistics:\n{}", stream.stats());
    stream.shutdown();
}

/// Handle the next entry of the connection: one compilation or a terminate notice.
pub fn process_entry(ctx: &ServerContext, stream: &mut Stream) -> StreamResult<ConnectionState> {
    let kind = match stream.read() {
        Ok(kind) => kind,
        Err(err @ StreamError::VersionIncompatible { .. }) => {
            log::warn!("{}", err);
            stream.write_error(
                CompilationErrorCode::StreamVersionIncompatible,
                err.to_string(),
                None,
                ctx.server_uid,
            )?;
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    match kind {
        MessageType::CompilationRequest => {
            let request: CompilationRequest = stream.recv_data()?;
            ctx.compilations.fetch_add(1, Ordering::Relaxed);
            handle_request(ctx, stream, request)?;
            Ok(ConnectionState::Open)
        }
        MessageType::ClientSessionTerminate => {
            let (uid,): (ClientUid,) = stream.recv_data()?;
            log::info!("{}: client terminated its session", uid);
            ctx.sessions.delete(uid);
            Ok(ConnectionState::Closed)
        }
        MessageType::ConnectionTerminate => {
            log::debug!("client closed the connection");
            Ok(ConnectionState::Closed)
        }
        other => Err(StreamError::mismatch(format!(
            "{} cannot start a compilation",
            other
        ))),
    }
}

enum Outcome {
    AotHit(AotRecord),
    Compiled(CompiledBody, Option<AotCacheKey>),
    Failed(CompileFailure),
    Crashed(String),
}

fn handle_request(ctx: &ServerContext, stream: &mut Stream, request: CompilationRequest) -> StreamResult<()> {
    let uid = request.client_uid;
    let session = ctx.sessions.find_or_create(uid);
    log::debug!(
        "{}: request {} for {} at {:?}{}",
        uid,
        request.seq_no,
        request.method,
        request.opt_level,
        if request.diagnostic { " (diagnostic)" } else { "" }
    );

    let mut turn = match session.acquire_turn(request.seq_no, ctx.config.sequencing_timeout) {
        Ok(turn) => turn,
        Err(err @ StreamError::OutOfSequence { .. }) => {
            log::warn!("{}: {}", uid, err);
            return stream.write_error(
                CompilationErrorCode::StreamLostMessage,
                err.to_string(),
                None,
                ctx.server_uid,
            );
        }
        Err(err) => return Err(err),
    };

    session.process_unloaded_classes(&request.unloaded_classes, request.seq_no);
    session.process_redefined_classes(&request.redefined_classes, request.seq_no);
    session.record_illegal_final_modifications(&request.illegal_final_field_modifications);
    let chtable_result = apply_chtable_update(&session, stream, &request.chtable_update);
    turn.release(request.carries_critical_state());
    if let Err(err) = chtable_result {
        // Only the client can interrupt the hierarchy fetch.
        return finish_with_stream_error(ctx, stream, err, turn.is_interrupted(), true);
    }

    let load = ctx.load.current();
    if load.memory >= ServerMemoryState::VeryLow {
        log::warn!("{}: refusing {}, server memory is very low", uid, request.method);
        return stream.write_error(
            CompilationErrorCode::LowPhysicalMemory,
            "server memory is very low",
            Some(load),
            ctx.server_uid,
        );
    }

    let arena = Bump::new();
    let compilation = CompilationSession::new(&arena);
    let active = ctx.load.begin_compilation();
    let (outcome, peer_interrupted) = {
        let proxy = RemoteVmProxy::new(stream, &session, &compilation, turn.interrupt_flag())
            .with_memory_accounting(&active);
        let outcome = compile(ctx, &request, &proxy, &compilation);
        (outcome, proxy.peer_interrupted())
    };
    active.charge(compilation.memory_used());
    log::debug!("{}: {}\n{}", uid, request.method, compilation.stats());

    let server_interrupted = turn.is_interrupted();
    match outcome {
        Outcome::AotHit(record) => {
            let response = AotCacheHitResponse {
                code: record.code,
                data: record.data,
                commit: record.commit,
                record_ids: vec![record.id],
                load: ctx.load.current(),
                server_uid: ctx.server_uid,
            };
            stream.write(MessageType::AotCacheHit, &response)
        }
        Outcome::Compiled(..) if server_interrupted => stream.write_error(
            CompilationErrorCode::Interrupted,
            "classes were unloaded during the compilation",
            None,
            ctx.server_uid,
        ),
        Outcome::Compiled(body, aot_key) => {
            if let Some(key) = aot_key.filter(|_| !request.diagnostic) {
                ctx.aot_cache
                    .store(key, body.code.clone(), body.data.clone(), body.commit.clone());
            }
            let response = CompilationCodeResponse {
                code: body.code,
                data: body.data,
                commit: body.commit,
                log: body.log,
                load: ctx.load.current(),
                trampoline_methods: body.trampoline_methods,
                server_uid: ctx.server_uid,
            };
            stream.write(MessageType::CompilationCode, &response)
        }
        Outcome::Failed(failure) => match failure.stream_error {
            Some(err) => finish_with_stream_error(ctx, stream, err, server_interrupted, peer_interrupted),
            None => {
                log::debug!("{}: {} failed: {}", uid, request.method, failure.reason);
                let feedback = failure.code.carries_load_feedback().then(|| ctx.load.current());
                stream.write_error(failure.code, failure.reason, feedback, ctx.server_uid)
            }
        },
        Outcome::Crashed(detail) => {
            log::error!("{}: compilation thread crashed on {}: {}", uid, request.method, detail);
            let report = CrashReport {
                method: request.method,
                detail,
            };
            stream.write(MessageType::CompilationThreadCrashed, &report)
        }
    }
}

fn apply_chtable_update(
    session: &ClientSessionData,
    stream: &mut Stream,
    update: &ChTableUpdate,
) -> StreamResult<()> {
    let mut chtable = session.chtable();
    if matches!(update, ChTableUpdate::Full(_)) || chtable.is_initialized() {
        chtable.apply_update(update);
        return Ok(());
    }
    // The client's table already contains the delta it just drained.
    let fetched = chtable.initialize_if_needed(|| {
        stream.rpc::<_, Vec<SerializedClassInfo>>(MessageType::ChTableGetAllClassInfo, &())
    })?;
    if fetched {
        log::debug!(
            "{}: initialized hierarchy table with {} classes",
            session.client_uid(),
            chtable.table().len()
        );
    }
    Ok(())
}

fn finish_with_stream_error(
    ctx: &ServerContext,
    stream: &mut Stream,
    err: StreamError,
    server_interrupted: bool,
    peer_interrupted: bool,
) -> StreamResult<()> {
    match err {
        StreamError::Interrupted if peer_interrupted => {
            log::debug!("client abandoned the compilation");
            Ok(())
        }
        StreamError::Interrupted if server_interrupted => stream.write_error(
            CompilationErrorCode::Interrupted,
            "classes were unloaded during the compilation",
            None,
            ctx.server_uid,
        ),
        StreamError::Interrupted => Ok(()),
        err => Err(err),
    }
}

fn compile<'arena>(
    ctx: &ServerContext,
    request: &CompilationRequest,
    proxy: &RemoteVmProxy<'_, 'arena>,
    compilation: &CompilationSession<'arena>,
) -> Outcome {
    let aot_key = match aot_cache_key(request, proxy) {
        Ok(key) => key,
        Err(err) => return Outcome::Failed(err.into()),
    };
    if let Some(key) = &aot_key {
        if let Some(record) = ctx.aot_cache.lookup(key) {
            log::debug!("AOT cache hit for {}", key.method_signature);
            return Outcome::AotHit(record);
        }
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| ctx.compiler.compile(request, proxy, compilation)));
    match result {
        Ok(Ok(body)) => Outcome::Compiled(body, aot_key),
        Ok(Err(failure)) => Outcome::Failed(failure),
        Err(payload) => {
            let detail = payload
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown panic".to_string());
            Outcome::Crashed(detail)
        }
    }
}

fn aot_cache_key(request: &CompilationRequest, proxy: &RemoteVmProxy<'_, '_>) -> StreamResult<Option<AotCacheKey>> {
    let Some(chain) = request.class_chain.as_ref().filter(|_| request.use_aot_cache) else {
        return Ok(None);
    };
    let Some(method) = proxy.method_mirror(request.method)? else {
        return Ok(None);
    };
    Ok(Some(AotCacheKey {
        class_chain: chain.clone(),
        method_signature: format!("{}{}", method.name, method.signature),
        opt_level: request.opt_level,
    }))
}
