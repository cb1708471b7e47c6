// This module drives remote compilations from the client. JitClient owns everything a client
// VM needs to offload compilations: the connector to the server and a pool of idle streams,
// the request state shared by all compilation threads, the guard commit engine with the code
// cache, admission control and server availability tracking. A compilation walks the states
// Idle, ConnectionAcquired, RequestSent and AwaitingMessage and ends Succeeded, Failed or
// Interrupted. While it waits for the server the thread gives up its share of VM access and
// takes it back as soon as a message arrives, because a network wait is unbounded; every
// server query in between is answered by the dispatcher. A compiled body is only installed
// after the commit engine validated its assumptions. Load feedback from the server is handed
// to admission control, a change of server identity forces a full hierarchy resync, and a
// crash of the server's compilation thread triggers a diagnostic-only recompilation on the
// same stream whose outcome is discarded. Stream failures put the server into back-off, a
// version mismatch marks the server incompatible for good, and an out-of-range status is
// reported as protocol corruption. Every failure leaves the decision of retrying remotely,
// compiling locally or giving up to decide_retry.

//! Client-side compilation orchestration.

use crate::client::admission::AdmissionControl;
use crate::client::availability::ServerAvailability;
use crate::client::commit::GuardCommitEngine;
use crate::client::code_cache::BodyId;
use crate::client::compilation_info::{ClientCompilationInfo, RequestHeader};
use crate::client::dispatch::{dispatch, Dispatch, QueryContext};
use crate::core::config::ClientConfig;
use crate::core::error::{CompilationErrorCode, CompileFailure, StreamError, StreamResult};
use crate::core::ids::{ClassId, ClientUid, CompThreadId, MethodId};
use crate::core::vm::ClientVm;
use crate::protocol::message::{
    AotCacheHitResponse, ClassChain, CompilationCodeResponse, CompilationFailureResponse,
    CompilationRequest, CrashReport, MessageType, OptLevel,
};
use crate::protocol::stream::{Connector, MessageStats, Stream};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

/// What the caller wants compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileRequest {
    pub method: MethodId,
    pub class: ClassId,
    pub opt_level: OptLevel,
    pub options: String,
    pub thread: CompThreadId,
    pub use_aot_cache: bool,
}

impl CompileRequest {
    pub fn new(method: MethodId, class: ClassId, opt_level: OptLevel) -> Self {
        Self {
            method,
            class,
            opt_level,
            options: String::new(),
            thread: 0,
            use_aot_cache: false,
        }
    }

    pub fn on_thread(mut self, thread: CompThreadId) -> Self {
        self.thread = thread;
        self
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    pub fn with_aot_cache(mut self, use_aot_cache: bool) -> Self {
        self.use_aot_cache = use_aot_cache;
        self
    }
}

/// An installed remote compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMethod {
    pub method: MethodId,
    pub body: BodyId,
    pub start: u64,
    pub from_aot_cache: bool,
    pub log: String,
    pub trampoline_methods: Vec<MethodId>,
}

/// What the owner of a failed compilation should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryRemote,
    RetryLocal,
    GiveUp,
}

/// States of one remote compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationState {
    Idle,
    ConnectionAcquired,
    RequestSent,
    AwaitingMessage,
    Succeeded,
    Failed,
    Interrupted,
}

/// How the dialogue of one request ended.
enum DialogueEnd {
    /// A terminal message of this kind is pending on the stream.
    Terminal(MessageType),
    /// The client abandoned the compilation.
    Abandoned,
}

pub struct JitClient {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    vm: Arc<dyn ClientVm>,
    /// Compilation threads hold this shared while they touch the VM.
    vm_access: RwLock<()>,
    info: ClientCompilationInfo,
    engine: Mutex<GuardCommitEngine>,
    admission: AdmissionControl,
    availability: ServerAvailability,
    idle_streams: Mutex<Vec<Stream>>,
    closed_stream_stats: Mutex<MessageStats>,
}

impl JitClient {
    pub fn new(config: ClientConfig, client_uid: ClientUid, connector: Box<dyn Connector>, vm: Arc<dyn ClientVm>) -> Self {
        Self {
            admission: AdmissionControl::new(config.compilation_threads),
            availability: ServerAvailability::new(config.retry.clone()),
            info: ClientCompilationInfo::new(client_uid),
            engine: Mutex::new(GuardCommitEngine::new()),
            vm_access: RwLock::new(()),
            idle_streams: Mutex::new(Vec::new()),
            closed_stream_stats: Mutex::new(MessageStats::default()),
            config,
            connector,
            vm,
        }
    }

    pub fn client_uid(&self) -> ClientUid {
        self.info.client_uid()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn vm(&self) -> &Arc<dyn ClientVm> {
        &self.vm
    }

    pub fn info(&self) -> &ClientCompilationInfo {
        &self.info
    }

    pub fn engine(&self) -> &Mutex<GuardCommitEngine> {
        &self.engine
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    pub fn availability(&self) -> &ServerAvailability {
        &self.availability
    }

    /// Exclusive VM access, as a stop-the-world operation would take it.
    pub fn exclusive_vm_access(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.vm_access.write()
    }

    pub fn idle_stream_count(&self) -> usize {
        self.idle_streams.lock().len()
    }

    /// Message counts of every stream this client opened.
    pub fn message_stats(&self) -> MessageStats {
        let mut stats = self.closed_stream_stats.lock().clone();
        for stream in self.idle_streams.lock().iter() {
            stats.merge(stream.stats());
        }
        stats
    }

    /// Compile `request` remotely, retrying remotely while that is worthwhile.
    pub fn compile(&self, request: &CompileRequest) -> Result<CompiledMethod, CompileFailure> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let failure = match self.compile_once(request) {
                Ok(compiled) => return Ok(compiled),
                Err(failure) => failure,
            };
            match self.decide_retry(&failure, attempts) {
                RetryDecision::RetryRemote => {
                    log::debug!(
                        "{}: retrying {} remotely after: {}",
                        self.client_uid(),
                        request.method,
                        failure.reason
                    );
                }
                decision => {
                    log::debug!("{}: {} failed remotely ({:?})", self.client_uid(), request.method, decision);
                    return Err(failure);
                }
            }
        }
    }

    /// Whether a failed remote compilation should be retried, and where.
    pub fn decide_retry(&self, failure: &CompileFailure, attempts: u32) -> RetryDecision {
        let budget_left = attempts < self.config.retry.max_remote_attempts;
        match failure.code {
            CompilationErrorCode::StreamFailure => {
                let address = self.connector.server_address();
                if budget_left
                    && self.availability.is_compatible(&address)
                    && self.availability.is_available(Instant::now())
                {
                    RetryDecision::RetryRemote
                } else {
                    RetryDecision::RetryLocal
                }
            }
            CompilationErrorCode::StreamLostMessage
            | CompilationErrorCode::Interrupted
            | CompilationErrorCode::StreamInterrupted => {
                if budget_left {
                    RetryDecision::RetryRemote
                } else {
                    RetryDecision::GiveUp
                }
            }
            CompilationErrorCode::LowPhysicalMemory => RetryDecision::RetryLocal,
            code if code.should_retry_locally() => RetryDecision::RetryLocal,
            _ => RetryDecision::GiveUp,
        }
    }

    fn enter(&self, request: &CompileRequest, state: CompilationState) {
        log::trace!("{}: {} on thread {} -> {:?}", self.client_uid(), request.method, request.thread, state);
    }

    fn compile_once(&self, request: &CompileRequest) -> Result<CompiledMethod, CompileFailure> {
        self.enter(request, CompilationState::Idle);
        let address = self.connector.server_address();
        if !self.availability.is_compatible(&address) {
            return Err(CompileFailure::new(
                CompilationErrorCode::ServerUnavailable,
                format!("server {} is incompatible", address),
            ));
        }
        if !self.availability.is_available(Instant::now()) {
            return Err(CompileFailure::new(
                CompilationErrorCode::ServerUnavailable,
                format!("server {} is backing off", address),
            ));
        }

        let mut stream = match self.acquire_stream() {
            Ok(stream) => stream,
            Err(err) => {
                self.availability.record_failure(Instant::now());
                return Err(CompileFailure::from(err));
            }
        };
        self.enter(request, CompilationState::ConnectionAcquired);

        let interrupt = self.info.begin_remote(request.thread);
        let result = self.run_compilation(&mut stream, request, &interrupt);
        self.info.end_remote(request.thread);

        let final_state = match &result {
            Ok(_) => CompilationState::Succeeded,
            Err(f) if matches!(f.code, CompilationErrorCode::Interrupted | CompilationErrorCode::StreamInterrupted) => {
                CompilationState::Interrupted
            }
            Err(_) => CompilationState::Failed,
        };
        self.enter(request, final_state);

        match &result {
            Err(CompileFailure {
                stream_error: Some(err), ..
            }) if err.is_fatal_for_connection() => self.discard_stream(stream, err),
            _ => self.release_stream(stream),
        }
        result
    }

    fn run_compilation(
        &self,
        stream: &mut Stream,
        request: &CompileRequest,
        interrupt: &AtomicBool,
    ) -> Result<CompiledMethod, CompileFailure> {
        let mut access = self.vm_access.read();
        let class_chain = if request.use_aot_cache {
            self.vm.class_chain(request.class)?
        } else {
            None
        };

        let header = self.info.prepare_request();
        let wire = build_request(self.client_uid(), request, &header, class_chain.clone(), false);
        self.enter(request, CompilationState::RequestSent);
        let end = match self.converse(stream, &mut access, &wire, interrupt) {
            Ok(end) => end,
            Err(err) => {
                self.on_stream_error(&err, Some(header));
                return Err(err.into());
            }
        };

        let kind = match end {
            DialogueEnd::Abandoned => {
                return Err(CompileFailure::new(
                    CompilationErrorCode::Interrupted,
                    "compilation abandoned by the client",
                ))
            }
            DialogueEnd::Terminal(kind) => kind,
        };

        let outcome = self.finish(stream, request, kind);
        if let Err(failure) = &outcome {
            if let Some(err) = &failure.stream_error {
                self.on_stream_error(err, None);
            }
        }
        let crashed = matches!(&outcome, Err(f) if f.code == CompilationErrorCode::ThreadCrashed);
        if crashed {
            self.diagnose_crash(stream, &mut access, request, class_chain, interrupt);
        }
        drop(access);
        if outcome.is_ok() {
            self.availability.record_success();
        }
        outcome
    }

    /// Send `request` and answer server queries until the dialogue ends.
    fn converse(
        &self,
        stream: &mut Stream,
        access: &mut RwLockReadGuard<'_, ()>,
        request: &CompilationRequest,
        interrupt: &AtomicBool,
    ) -> StreamResult<DialogueEnd> {
        let ctx = QueryContext {
            vm: self.vm.as_ref(),
            chtable: self.info.chtable(),
            interrupted: interrupt,
        };
        let mut outgoing = Some(stream.prepare(MessageType::CompilationRequest, request)?);
        loop {
            let frame = outgoing.take();
            let kind = RwLockReadGuard::unlocked(access, || -> StreamResult<MessageType> {
                if let Some(frame) = frame {
                    stream.send_prepared(frame)?;
                }
                stream.read()
            })?;
            match dispatch(&ctx, stream, kind)? {
                Dispatch::Reply(frame) => outgoing = Some(frame),
                Dispatch::Abandon(frame) => {
                    RwLockReadGuard::unlocked(access, || stream.send_prepared(frame))?;
                    return Ok(DialogueEnd::Abandoned);
                }
                Dispatch::Done(kind) => return Ok(DialogueEnd::Terminal(kind)),
            }
        }
    }

    /// Decode the terminal message of `kind` and act on it.
    fn finish(&self, stream: &mut Stream, request: &CompileRequest, kind: MessageType) -> Result<CompiledMethod, CompileFailure> {
        match kind {
            MessageType::CompilationCode => {
                let response: CompilationCodeResponse = stream.recv_data()?;
                self.info.observe_server_uid(response.server_uid);
                self.admission.on_feedback(response.load);
                self.install(request, response)
            }
            MessageType::AotCacheHit => {
                let response: AotCacheHitResponse = stream.recv_data()?;
                self.info.observe_server_uid(response.server_uid);
                self.admission.on_feedback(response.load);
                self.install_aot(request, response)
            }
            MessageType::CompilationFailure => {
                let response: CompilationFailureResponse = stream.recv_data()?;
                Err(self.failure_from(response)?)
            }
            MessageType::CompilationThreadCrashed => {
                let report: CrashReport = stream.recv_data()?;
                log::error!(
                    "{}: server compilation thread crashed on {}: {}",
                    self.client_uid(),
                    report.method,
                    report.detail
                );
                Err(CompileFailure::new(CompilationErrorCode::ThreadCrashed, report.detail))
            }
            other => Err(StreamError::mismatch(format!("{} does not end a compilation", other)).into()),
        }
    }

    fn failure_from(&self, response: CompilationFailureResponse) -> Result<CompileFailure, StreamError> {
        let code = CompilationErrorCode::try_from(response.status)?;
        self.info.observe_server_uid(response.server_uid);
        if code.carries_load_feedback() {
            if let Some(load) = response.load {
                self.admission.on_feedback(load);
            }
        }
        Ok(CompileFailure::new(code, response.reason).with_feedback(response.load))
    }

    fn install(&self, request: &CompileRequest, response: CompilationCodeResponse) -> Result<CompiledMethod, CompileFailure> {
        let illegal = self.info.illegal_final_modifications();
        let outcome = {
            let mut engine = self.engine.lock();
            let mut chtable = self.info.chtable().lock();
            engine.commit(
                self.vm.as_ref(),
                &mut chtable,
                &illegal,
                request.thread,
                request.method,
                &response,
            )?
        };
        Ok(CompiledMethod {
            method: request.method,
            body: outcome.body,
            start: outcome.start,
            from_aot_cache: false,
            log: response.log,
            trampoline_methods: response.trampoline_methods,
        })
    }

    fn install_aot(&self, request: &CompileRequest, response: AotCacheHitResponse) -> Result<CompiledMethod, CompileFailure> {
        let illegal = self.info.illegal_final_modifications();
        let outcome = {
            let mut engine = self.engine.lock();
            let mut chtable = self.info.chtable().lock();
            engine.install_aot(
                self.vm.as_ref(),
                &mut chtable,
                &illegal,
                request.thread,
                request.method,
                &response,
            )?
        };
        log::debug!("{}: {} served from the server's AOT cache", self.client_uid(), request.method);
        Ok(CompiledMethod {
            method: request.method,
            body: outcome.body,
            start: outcome.start,
            from_aot_cache: true,
            log: String::new(),
            trampoline_methods: Vec::new(),
        })
    }

    /// Log the method's IL and recompile it once in diagnostic mode; the outcome is discarded.
    fn diagnose_crash(
        &self,
        stream: &mut Stream,
        access: &mut RwLockReadGuard<'_, ()>,
        request: &CompileRequest,
        class_chain: Option<ClassChain>,
        interrupt: &AtomicBool,
    ) {
        log::error!(
            target: "jitserver::diagnostic",
            "{}: IL of crashed compilation: {}",
            self.client_uid(),
            self.vm.il_summary(request.method)
        );
        let header = self.info.prepare_request();
        let wire = build_request(self.client_uid(), request, &header, class_chain, true);
        match self.converse(stream, access, &wire, interrupt) {
            Ok(DialogueEnd::Terminal(kind)) => {
                stream.discard_pending();
                log::info!("{}: diagnostic compilation of {} ended with {}", self.client_uid(), request.method, kind);
            }
            Ok(DialogueEnd::Abandoned) => {}
            Err(err) => {
                // The original failure is what gets reported.
                log::warn!("{}: diagnostic compilation failed: {}", self.client_uid(), err);
                self.on_stream_error(&err, Some(header));
            }
        }
    }

    fn on_stream_error(&self, err: &StreamError, unsent: Option<RequestHeader>) {
        match err {
            StreamError::VersionIncompatible { .. } => {
                self.availability
                    .record_incompatibility(&self.connector.server_address());
            }
            StreamError::TransportClosed { .. } => {
                self.availability.record_failure(Instant::now());
            }
            StreamError::TypeMismatch { .. } | StreamError::ProtocolCorruption { .. } => {
                log::error!("{}: {}", self.client_uid(), err);
            }
            _ => {}
        }
        if err.is_fatal_for_connection() {
            match unsent {
                Some(header) => self.info.restore_unsent(header),
                None => self.info.request_full_resync(),
            }
        }
    }

    fn acquire_stream(&self) -> StreamResult<Stream> {
        if let Some(stream) = self.idle_streams.lock().pop() {
            return Ok(stream);
        }
        self.connector.connect()
    }

    fn release_stream(&self, stream: Stream) {
        self.idle_streams.lock().push(stream);
    }

    fn discard_stream(&self, mut stream: Stream, reason: &StreamError) {
        log::debug!("{}: closing stream after {}", self.client_uid(), reason);
        stream.shutdown();
        self.closed_stream_stats.lock().merge(stream.stats());
    }

    /// End the client's session on the server and close every idle stream.
    pub fn shutdown(&self) {
        let streams: Vec<Stream> = std::mem::take(&mut *self.idle_streams.lock());
        let mut terminated = false;
        for mut stream in streams {
            let result = if terminated {
                stream.write(MessageType::ConnectionTerminate, &())
            } else {
                terminated = true;
                stream.write(MessageType::ClientSessionTerminate, &(self.client_uid(),))
            };
            if let Err(err) = result {
                log::debug!("{}: closing stream: {}", self.client_uid(), err);
            }
            stream.shutdown();
            self.closed_stream_stats.lock().merge(stream.stats());
        }
        log::info!("{}: remote compilation shut down\n{}", self.client_uid(), self.message_stats());
    }
}

fn build_request(
    client_uid: ClientUid,
    request: &CompileRequest,
    header: &RequestHeader,
    class_chain: Option<ClassChain>,
    diagnostic: bool,
) -> CompilationRequest {
    CompilationRequest {
        client_uid,
        seq_no: header.seq_no,
        last_critical_seq_no: header.last_critical_seq_no,
        comp_thread: request.thread,
        method: request.method,
        class: request.class,
        opt_level: request.opt_level,
        options: request.options.clone(),
        use_aot_cache: request.use_aot_cache,
        class_chain,
        unloaded_classes: header.unloaded_classes.clone(),
        redefined_classes: header.redefined_classes.clone(),
        illegal_final_field_modifications: header.illegal_final_field_modifications.clone(),
        chtable_update: header.chtable_update.clone(),
        diagnostic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::sim_vm::SimulatedVm;
    use crate::core::config::RetryConfig;
    use crate::protocol::stream::TcpConnector;
    use std::time::Duration;

    fn client(attempts: u32) -> JitClient {
        let config = ClientConfig::default().with_retry(
            RetryConfig::default()
                .with_backoff(Duration::ZERO, Duration::ZERO)
                .with_max_remote_attempts(attempts),
        );
        JitClient::new(
            config,
            ClientUid(1),
            Box::new(TcpConnector::new("127.0.0.1:1")),
            Arc::new(SimulatedVm::new()),
        )
    }

    #[test]
    fn test_retry_decisions() {
        let client = client(2);
        let failure = |code| CompileFailure::new(code, "x");
        assert_eq!(
            client.decide_retry(&failure(CompilationErrorCode::StreamFailure), 1),
            RetryDecision::RetryRemote
        );
        assert_eq!(
            client.decide_retry(&failure(CompilationErrorCode::StreamFailure), 2),
            RetryDecision::RetryLocal
        );
        assert_eq!(
            client.decide_retry(&failure(CompilationErrorCode::ChTableCommitFailure), 1),
            RetryDecision::RetryLocal
        );
        assert_eq!(
            client.decide_retry(&failure(CompilationErrorCode::StreamLostMessage), 1),
            RetryDecision::RetryRemote
        );
        assert_eq!(
            client.decide_retry(&failure(CompilationErrorCode::NotNeeded), 1),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_incompatible_server_is_not_retried() {
        let client = client(3);
        client.availability().record_incompatibility("127.0.0.1:1");
        let err = client
            .compile(&CompileRequest::new(MethodId::new(1), ClassId::new(2), OptLevel::Warm))
            .unwrap_err();
        assert_eq!(err.code, CompilationErrorCode::ServerUnavailable);
        assert_eq!(
            client.decide_retry(&CompileFailure::new(CompilationErrorCode::StreamFailure, "x"), 1),
            RetryDecision::RetryLocal
        );
    }
}
