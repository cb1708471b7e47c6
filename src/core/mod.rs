// This module serves as the central hub of the infrastructure shared by the client and the
// server side of remote compilation. It exports the opaque identities of client VM entities,
// the error taxonomy of the protocol, configuration read from the environment, the bit set
// of compilation threads used by the hierarchy tables, the arena-backed per-compilation
// session with its caches and statistics, and the VM-introspection traits that the client VM
// and the server's remote proxy both implement. Nothing in here performs I/O.

//! Core infrastructure shared by client and server.
//!
//! # Key Components
//!
//! ## Identities (`ids`)
//! - Opaque, hashable tokens for classes, methods, loaders and heap objects
//! - The stable identity of a client VM
//!
//! ## Errors (`error`)
//! - Transport failures, compilation status codes and commit aborts
//!
//! ## Compilation Session (`session`)
//! - Arena-based per-compilation caches using `bumpalo`
//! - RPC and cache statistics
//!
//! ## VM Interface (`vm`)
//! - The query surface an optimizer consumes
//! - VM event hooks

pub mod config;
pub mod error;
pub mod ids;
pub mod session;
pub mod thread_set;
pub mod vm;

#[cfg(test)]
pub mod test_utils;

pub use config::{ClientConfig, RetryConfig, ServerConfig};
pub use error::{CommitError, CompilationErrorCode, CompileFailure, ConfigError, StreamError, StreamResult};
pub use ids::{ClassId, ClientUid, CompThreadId, ConstantPoolId, KnownObjectIndex, LoaderId, MethodId, ObjectHandle};
pub use session::{CompilationSession, SessionStats};
pub use thread_set::ThreadBitSet;
pub use vm::{ClientVm, VmEventListener, VmQuery, VmResult};
