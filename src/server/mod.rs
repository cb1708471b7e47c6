//! Server side: per-client sessions, the remote VM proxy and request handling.

pub mod aot_cache;
pub mod client_session;
pub mod compilation;
pub mod compiler;
pub mod listener;
pub mod load;
pub mod session_table;
pub mod vm_proxy;

pub use client_session::{ClientSessionData, CompilationTurn};
pub use compilation::{process_entry, serve_connection, ConnectionState, ServerContext};
pub use compiler::{CompiledBody, MethodCompiler, PlaceholderCompiler, PlaceholderOptions};
pub use listener::{JitServer, LocalConnector};
pub use session_table::ClientSessionTable;
pub use vm_proxy::RemoteVmProxy;
