//! Client side: offloading compilations to a server and installing the results.
//!
//! [`JitClient`] runs one remote compilation per calling thread, answering
//! the server's queries from the local VM while it waits. Results pass
//! through the [`GuardCommitEngine`] before any code becomes reachable.
//! [`CompilationWorkers`] runs queued compilations on a pool of threads whose
//! size follows the server's load feedback.

pub mod admission;
pub mod assumptions;
pub mod availability;
pub mod code_cache;
pub mod commit;
pub mod compilation_info;
pub mod dispatch;
pub mod events;
pub mod orchestrator;
pub mod sim_vm;
pub mod workers;

pub use admission::{AdmissionControl, AdmissionPolicy};
pub use assumptions::{AssumptionAction, AssumptionKey, AssumptionTable};
pub use availability::ServerAvailability;
pub use code_cache::{BodyId, CodeCache, InstalledBody};
pub use commit::{CommitOutcome, FireReport, GuardCommitEngine};
pub use compilation_info::{ClientCompilationInfo, RequestHeader};
pub use orchestrator::{CompilationState, CompileRequest, CompiledMethod, JitClient, RetryDecision};
pub use sim_vm::{ClassSpec, FieldRef, MethodSpec, SimulatedVm};
pub use workers::{CompilationWorkers, CompileResult};
