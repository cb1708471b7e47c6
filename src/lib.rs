//! jitserver - remote compilation for a JIT compiler.
//!
//! A client VM offloads method compilation to a server process. The server
//! has no access to the client's heap or class tables; it reconstructs what
//! it needs through synchronous queries over the same stream that carried
//! the request, and caches the answers per client so repeated questions cost
//! nothing. The client installs a result only after checking that every
//! assumption the server compiled under still holds.
//!
//! # Primary Usage
//!
//! ```ignore
//! use jitserver::client::{CompileRequest, JitClient, SimulatedVm};
//! use jitserver::core::{ClientConfig, ClientUid};
//! use jitserver::protocol::{OptLevel, TcpConnector};
//! use std::sync::Arc;
//!
//! let vm = Arc::new(SimulatedVm::new());
//! let client = Arc::new(JitClient::new(
//!     ClientConfig::from_env()?,
//!     ClientUid(1),
//!     Box::new(TcpConnector::new("127.0.0.1:38400")),
//!     vm.clone(),
//! ));
//! vm.add_listener(&client);
//! let compiled = client.compile(&CompileRequest::new(method, class, OptLevel::Warm))?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Identities, errors, configuration, per-compilation sessions, VM traits
//! - [`protocol`] - Message catalog, payloads and framed streams
//! - [`chtable`] - Persistent class hierarchy tables and their delta synchronization
//! - [`server`] - Client sessions, the remote VM proxy and request handling
//! - [`client`] - Remote compilation driver, query dispatch, guarded commit and the
//!   load-driven compilation worker pool

pub mod chtable;
pub mod client;
pub mod core;
pub mod protocol;
pub mod server;

pub use client::{CompileRequest, CompiledMethod, JitClient};
pub use core::{ClientConfig, ClientUid, CompileFailure, ServerConfig, StreamError};
pub use server::{JitServer, LocalConnector, ServerContext};
