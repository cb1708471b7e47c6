//! Shared fixtures for the integration tests.
//!
//! A fixture runs a server context in process, connects a client to it over
//! the channel transport and gives the client a simulated VM. Methods are
//! compiled by the placeholder compiler unless a test supplies its own.

#![allow(dead_code)]

use jitserver::client::{ClassSpec, CompileRequest, JitClient, MethodSpec, SimulatedVm};
use jitserver::core::{ClassId, ClientConfig, ClientUid, CompileFailure, MethodId, ServerConfig};
use jitserver::protocol::{CompilationRequest, OptLevel, ResolutionKind};
use jitserver::server::{
    CompiledBody, LocalConnector, MethodCompiler, PlaceholderCompiler, RemoteVmProxy, ServerContext,
};
use jitserver::core::CompilationSession;
use std::sync::Arc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Fixture {
    pub ctx: Arc<ServerContext>,
    pub vm: Arc<SimulatedVm>,
    pub client: Arc<JitClient>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_compiler(Box::new(PlaceholderCompiler))
    }

    pub fn with_compiler(compiler: Box<dyn MethodCompiler>) -> Self {
        Self::with_vm(Arc::new(SimulatedVm::new()), compiler)
    }

    /// Fixture over a VM the compiler may also hold on to.
    pub fn with_vm(vm: Arc<SimulatedVm>, compiler: Box<dyn MethodCompiler>) -> Self {
        Self::with_parts(ServerConfig::default(), ClientConfig::default(), vm, compiler)
    }

    pub fn with_configs(server: ServerConfig, client: ClientConfig, compiler: Box<dyn MethodCompiler>) -> Self {
        Self::with_parts(server, client, Arc::new(SimulatedVm::new()), compiler)
    }

    pub fn with_parts(
        server: ServerConfig,
        client: ClientConfig,
        vm: Arc<SimulatedVm>,
        compiler: Box<dyn MethodCompiler>,
    ) -> Self {
        init_logging();
        let ctx = Arc::new(ServerContext::with_server_uid(server, compiler, 0x5e7e));
        let client = Arc::new(JitClient::new(
            client,
            ClientUid(7),
            Box::new(LocalConnector::new(ctx.clone())),
            vm.clone(),
        ));
        vm.add_listener(&client);
        Self { ctx, vm, client }
    }
}

/// `Shape.area` and a static `App.run` whose constant pool calls `area` virtually.
#[derive(Debug, Clone, Copy)]
pub struct App {
    pub shape: ClassId,
    pub area: MethodId,
    pub app: ClassId,
    pub run: MethodId,
}

impl App {
    pub fn define(vm: &SimulatedVm, call_sites: u32) -> App {
        let shape = vm.define_class(ClassSpec::new("test/Shape").extends(vm.object_class()));
        let area = vm
            .define_method(shape, MethodSpec::virtual_method("area", "()D"))
            .unwrap();
        let app = vm.define_class(ClassSpec::new("test/App").extends(vm.object_class()));
        let run = vm.define_method(app, MethodSpec::static_method("run", "()V")).unwrap();
        for cp_index in 1..=call_sites {
            assert!(vm.add_call_site(app, cp_index, ResolutionKind::Virtual, area));
        }
        App { shape, area, app, run }
    }

    pub fn request(&self, call_sites: u32) -> CompileRequest {
        CompileRequest::new(self.run, self.app, OptLevel::Warm)
            .with_options(format!("callSites={},fields=0", call_sites))
    }
}

/// Runs the placeholder compiler, then calls `after` while the client still waits for the result.
pub struct ThenCompiler<F> {
    pub after: F,
}

impl<F> MethodCompiler for ThenCompiler<F>
where
    F: Fn() + Send + Sync,
{
    fn compile<'arena>(
        &self,
        request: &CompilationRequest,
        vm: &RemoteVmProxy<'_, 'arena>,
        session: &CompilationSession<'arena>,
    ) -> Result<CompiledBody, CompileFailure> {
        let body = PlaceholderCompiler.compile(request, vm, session)?;
        (self.after)();
        Ok(body)
    }
}
