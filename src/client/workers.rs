//! Compilation worker threads sized by server load feedback.
//!
//! Requests are queued on a channel and served by worker threads, each with
//! its own compilation thread id. A submit starts another worker only when no
//! worker is idle and either none is running or the admission policy allows
//! one more. After each compilation a worker retires when more workers run
//! than the policy targets; the policy never targets fewer than one, so the
//! queue is always drained.

use crate::client::orchestrator::{CompileRequest, CompiledMethod, JitClient};
use crate::core::error::CompileFailure;
use crate::core::ids::CompThreadId;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub type CompileResult = Result<CompiledMethod, CompileFailure>;

struct Job {
    request: CompileRequest,
    reply: Sender<CompileResult>,
}

#[derive(Default)]
struct WorkerState {
    running: usize,
    idle: usize,
    free_threads: Vec<CompThreadId>,
    handles: Vec<JoinHandle<()>>,
}

struct Shared {
    client: Arc<JitClient>,
    jobs: Receiver<Job>,
    state: Mutex<WorkerState>,
}

pub struct CompilationWorkers {
    queue: Sender<Job>,
    shared: Arc<Shared>,
}

impl CompilationWorkers {
    /// Pool with up to the client's configured number of compilation threads.
    pub fn new(client: Arc<JitClient>) -> Self {
        let (queue, jobs) = crossbeam_channel::unbounded();
        let max_threads = client.config().compilation_threads.max(1);
        let state = WorkerState {
            free_threads: (0..max_threads).rev().collect(),
            ..WorkerState::default()
        };
        Self {
            queue,
            shared: Arc::new(Shared {
                client,
                jobs,
                state: Mutex::new(state),
            }),
        }
    }

    /// Queue a compilation; the result arrives on the returned channel.
    pub fn submit(&self, request: CompileRequest) -> Receiver<CompileResult> {
        let (reply, result) = crossbeam_channel::bounded(1);
        // The pool owns a receiver, so the queue is never disconnected here.
        let _ = self.queue.send(Job { request, reply });
        self.maybe_start_worker();
        result
    }

    pub fn running_workers(&self) -> usize {
        self.shared.state.lock().running
    }

    /// Stop accepting work, let the workers drain the queue and wait for them.
    pub fn shutdown(self) {
        let CompilationWorkers { queue, shared } = self;
        drop(queue);
        let handles = std::mem::take(&mut shared.state.lock().handles);
        for handle in handles {
            if handle.join().is_err() {
                log::error!("compilation worker panicked");
            }
        }
    }

    fn maybe_start_worker(&self) {
        let mut state = self.shared.state.lock();
        if state.idle > 0 {
            return;
        }
        let running = state.running;
        if running > 0 && !self.shared.client.admission().may_start_thread(running) {
            return;
        }
        let Some(thread) = state.free_threads.pop() else {
            return;
        };

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("jit-compile-{}", thread))
            .spawn(move || worker_loop(shared, thread));
        match spawned {
            Ok(handle) => {
                state.running += 1;
                state.handles.push(handle);
                log::debug!("started compilation thread {} ({} running)", thread, state.running);
            }
            Err(err) => {
                state.free_threads.push(thread);
                log::error!("cannot start compilation thread {}: {}", thread, err);
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>, thread: CompThreadId) {
    loop {
        shared.state.lock().idle += 1;
        let job = shared.jobs.recv();
        shared.state.lock().idle -= 1;
        let Ok(job) = job else {
            break;
        };

        let result = shared.client.compile(&job.request.on_thread(thread));
        // Decided before replying so a caller sees the pool already resized.
        let retire = {
            let mut state = shared.state.lock();
            let target = shared.client.admission().target_threads(state.running);
            let retire = state.running > target;
            if retire {
                state.running -= 1;
                state.free_threads.push(thread);
                log::debug!(
                    "compilation thread {} retires under {} ({} running)",
                    thread,
                    shared.client.admission().policy(),
                    state.running
                );
            }
            retire
        };
        let _ = job.reply.send(result);
        if retire {
            return;
        }
    }
    let mut state = shared.state.lock();
    state.running -= 1;
    state.free_threads.push(thread);
}
