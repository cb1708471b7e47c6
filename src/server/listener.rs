//! Accepting connections.
//!
//! [`JitServer`] listens on TCP and serves every connection on its own
//! thread; [`LocalConnector`] hands out in-process connections to the same
//! request handling, used by the demo and the tests.

use crate::core::config::ServerConfig;
use crate::core::error::StreamResult;
use crate::protocol::stream::{stream_pair, Connector, Stream, TcpTransport};
use crate::server::compilation::{serve_connection, ServerContext};
use crate::server::compiler::MethodCompiler;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

pub struct JitServer {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    stopping: Arc<AtomicBool>,
}

impl JitServer {
    pub fn bind(config: ServerConfig, compiler: Box<dyn MethodCompiler>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.socket_address())?;
        let ctx = Arc::new(ServerContext::new(config, compiler));
        log::info!(
            "JITServer {:#x} listening on {}",
            ctx.server_uid(),
            listener.local_addr()?
        );
        Ok(Self {
            ctx,
            listener,
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Flag that makes `run` return after the next accepted connection.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stopping.clone()
    }

    /// Accept connections until stopped, one thread per connection.
    pub fn run(&self) -> io::Result<()> {
        let mut next_id = 0usize;
        for socket in self.listener.incoming() {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            let socket = match socket {
                Ok(socket) => socket,
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    continue;
                }
            };
            let peer = socket.peer_addr().ok();
            let transport = match TcpTransport::new(socket) {
                Ok(transport) => transport,
                Err(err) => {
                    log::warn!("cannot configure connection from {:?}: {}", peer, err);
                    continue;
                }
            };
            next_id += 1;
            log::debug!("connection {} from {:?}", next_id, peer);
            let ctx = self.ctx.clone();
            thread::Builder::new()
                .name(format!("jitserver-conn-{}", next_id))
                .spawn(move || serve_connection(&ctx, Stream::new(Box::new(transport))))?;
        }
        Ok(())
    }
}

/// In-process connections to a server context, each served on its own thread.
pub struct LocalConnector {
    ctx: Arc<ServerContext>,
    connections: AtomicUsize,
}

impl LocalConnector {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Connections opened so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

impl Connector for LocalConnector {
    fn connect(&self) -> StreamResult<Stream> {
        let (client, server) = stream_pair();
        let id = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
        let ctx = self.ctx.clone();
        thread::Builder::new()
            .name(format!("jitserver-local-{}", id))
            .spawn(move || serve_connection(&ctx, server))?;
        Ok(client)
    }

    fn server_address(&self) -> String {
        format!("local:{:#x}", self.ctx.server_uid())
    }
}
