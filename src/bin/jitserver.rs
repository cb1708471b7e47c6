//! JITServer binary.
//!
//! `serve` runs a compilation server on TCP. `demo` runs a client and a
//! server in one process and walks through a remote compilation on the
//! client's worker pool, a cache hit and an invalidation.

use clap::{Parser, Subcommand};
use jitserver::client::{ClassSpec, CompilationWorkers, CompileRequest, JitClient, MethodSpec, SimulatedVm};
use jitserver::core::{ClientConfig, ClientUid, ServerConfig};
use jitserver::protocol::{OptLevel, ResolutionKind};
use jitserver::server::{JitServer, LocalConnector, PlaceholderCompiler, ServerContext};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "jitserver", about = "Remote JIT compilation server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve compilation requests over TCP.
    Serve {
        /// Port to listen on; overrides JITSERVER_PORT.
        #[arg(long)]
        port: Option<u16>,
        /// Compilation threads; overrides JITSERVER_THREADS.
        #[arg(long)]
        threads: Option<usize>,
        /// Arena memory budget in MiB.
        #[arg(long)]
        memory_mb: Option<usize>,
    },
    /// Compile a few methods through an in-process server.
    Demo {
        /// Number of call sites in the compiled method.
        #[arg(long, default_value_t = 2)]
        call_sites: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            port,
            threads,
            memory_mb,
        } => serve(port, threads, memory_mb),
        Command::Demo { call_sites } => demo(call_sites),
    }
}

fn serve(port: Option<u16>, threads: Option<usize>, memory_mb: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ServerConfig::from_env()?;
    if let Some(port) = port {
        config = config.with_port(port);
    }
    if let Some(threads) = threads {
        config = config.with_compilation_threads(threads);
    }
    if let Some(mb) = memory_mb {
        config = config.with_memory_budget(mb * 1024 * 1024);
    }
    let server = JitServer::bind(config, Box::new(PlaceholderCompiler))?;
    server.run()?;
    Ok(())
}

fn demo(call_sites: u32) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Arc::new(ServerContext::new(ServerConfig::default(), Box::new(PlaceholderCompiler)));
    let vm = Arc::new(SimulatedVm::new());
    let client = Arc::new(JitClient::new(
        ClientConfig::default(),
        ClientUid(1),
        Box::new(LocalConnector::new(ctx.clone())),
        vm.clone(),
    ));
    vm.add_listener(&client);

    let shape = vm.define_class(ClassSpec::new("demo/Shape").extends(vm.object_class()));
    let area = vm
        .define_method(shape, MethodSpec::virtual_method("area", "()D"))
        .ok_or("cannot define Shape.area")?;
    let app = vm.define_class(ClassSpec::new("demo/App").extends(vm.object_class()));
    let run = vm
        .define_method(app, MethodSpec::static_method("run", "()V"))
        .ok_or("cannot define App.run")?;
    for cp_index in 1..=call_sites {
        vm.add_call_site(app, cp_index, ResolutionKind::Virtual, area);
    }

    let request = CompileRequest::new(run, app, OptLevel::Warm).with_options(format!("callSites={},fields=0", call_sites));
    let workers = CompilationWorkers::new(client.clone());
    let first = workers.submit(request.clone()).recv()??;
    println!("compiled {} at {:#x}\n{}", first.method, first.start, first.log);
    let again = workers.submit(request).recv()??;
    println!("recompiled {} at {:#x}\n{}", again.method, again.start, again.log);
    println!(
        "{} compilation threads running under {}",
        workers.running_workers(),
        client.admission().policy()
    );
    workers.shutdown();

    let circle = vm.define_class(ClassSpec::new("demo/Circle").extends(shape));
    vm.override_method(area, circle);
    {
        let engine = client.engine().lock();
        println!(
            "after overriding Shape.area: {} bodies installed, {} live assumptions",
            engine.code_cache().installed_count(),
            engine.assumptions().len()
        );
    }

    client.shutdown();
    println!("server handled {} compilations", ctx.compilations());
    Ok(())
}
