//! The client's compilation worker pool under changing server load.

mod common;

use common::{App, Fixture};
use jitserver::client::{AdmissionPolicy, CompilationWorkers};
use jitserver::core::{ClientConfig, CompilationErrorCode, ServerConfig};
use jitserver::server::PlaceholderCompiler;

const BUDGET: usize = 100 * 1024 * 1024;

fn fixture(threads: usize) -> Fixture {
    Fixture::with_configs(
        ServerConfig::default().with_memory_budget(BUDGET),
        ClientConfig::default().with_compilation_threads(threads),
        Box::new(PlaceholderCompiler),
    )
}

#[test]
fn test_workers_serve_queued_requests() {
    let fx = fixture(2);
    let app = App::define(&fx.vm, 1);
    let workers = CompilationWorkers::new(fx.client.clone());

    let pending: Vec<_> = (0..6).map(|_| workers.submit(app.request(1))).collect();
    for result in pending {
        assert!(result.recv().unwrap().is_ok());
    }
    assert!((1..=2).contains(&workers.running_workers()));
    assert_eq!(fx.client.engine().lock().code_cache().installed_count(), 6);
    assert_eq!(fx.ctx.compilations(), 6);

    workers.shutdown();
}

#[test]
fn test_workers_shrink_when_server_memory_runs_out() {
    let fx = fixture(3);
    let app = App::define(&fx.vm, 1);
    let workers = CompilationWorkers::new(fx.client.clone());

    let pending: Vec<_> = (0..6).map(|_| workers.submit(app.request(1))).collect();
    for result in pending {
        assert!(result.recv().unwrap().is_ok());
    }
    assert_eq!(fx.client.admission().policy(), AdmissionPolicy::Aggressive);

    {
        let hog = fx.ctx.load.begin_compilation();
        hog.charge(BUDGET);
        let refused: Vec<_> = (0..4).map(|_| workers.submit(app.request(1))).collect();
        for result in refused {
            let err = result.recv().unwrap().unwrap_err();
            assert_eq!(err.code, CompilationErrorCode::LowPhysicalMemory);
        }
        assert_eq!(fx.client.admission().policy(), AdmissionPolicy::Suspend);
        assert_eq!(workers.running_workers(), 1);

        // No new thread starts while the remaining one is idle.
        let result = workers.submit(app.request(1)).recv().unwrap();
        assert!(result.is_err());
        assert_eq!(workers.running_workers(), 1);
    }

    assert!(workers.submit(app.request(1)).recv().unwrap().is_ok());
    workers.shutdown();
}
