//! Client behaviour when the server cannot be used.

mod common;

use common::{init_logging, App};
use jitserver::client::{JitClient, SimulatedVm};
use jitserver::core::{
    ClientConfig, ClientUid, CompilationErrorCode, RetryConfig, ServerConfig, StreamError, StreamResult,
};
use jitserver::protocol::{
    ChannelTransport, CompilationFailureResponse, CompilationRequest, Connector, MessageType, ProtocolVersion,
    Stream, TcpConnector,
};
use jitserver::server::{serve_connection, PlaceholderCompiler, ServerContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Connects to a server that speaks a newer protocol version.
struct SkewedConnector {
    ctx: Arc<ServerContext>,
    connects: Arc<AtomicUsize>,
}

impl Connector for SkewedConnector {
    fn connect(&self) -> StreamResult<Stream> {
        self.connects.fetch_add(1, Ordering::AcqRel);
        let (client, server) = ChannelTransport::pair();
        let newer = ProtocolVersion {
            minor: ProtocolVersion::CURRENT.minor + 1,
            ..ProtocolVersion::CURRENT
        };
        let ctx = self.ctx.clone();
        thread::spawn(move || serve_connection(&ctx, Stream::with_version(Box::new(server), newer.encode())));
        Ok(Stream::new(Box::new(client)))
    }

    fn server_address(&self) -> String {
        "skewed:38400".to_string()
    }
}

/// Answers every compilation request with a status outside the known range.
struct CorruptConnector;

impl Connector for CorruptConnector {
    fn connect(&self) -> StreamResult<Stream> {
        let (client, server) = ChannelTransport::pair();
        thread::spawn(move || {
            let mut stream = Stream::new(Box::new(server));
            while let Ok(MessageType::CompilationRequest) = stream.read() {
                let request: CompilationRequest = match stream.recv_data() {
                    Ok(request) => request,
                    Err(_) => break,
                };
                let failure = CompilationFailureResponse {
                    status: CompilationErrorCode::MAX + 7,
                    reason: format!("garbage for {}", request.method),
                    load: None,
                    server_uid: 1,
                };
                if stream.write(MessageType::CompilationFailure, &failure).is_err() {
                    break;
                }
            }
        });
        Ok(Stream::new(Box::new(client)))
    }

    fn server_address(&self) -> String {
        "corrupt:38400".to_string()
    }
}

fn client_with(connector: Box<dyn Connector>, retry: RetryConfig) -> (Arc<SimulatedVm>, Arc<JitClient>) {
    init_logging();
    let vm = Arc::new(SimulatedVm::new());
    let client = Arc::new(JitClient::new(
        ClientConfig::default().with_retry(retry),
        ClientUid(11),
        connector,
        vm.clone(),
    ));
    vm.add_listener(&client);
    (vm, client)
}

#[test]
fn test_version_mismatch_closes_connection_and_is_not_retried() {
    let ctx = Arc::new(ServerContext::new(ServerConfig::default(), Box::new(PlaceholderCompiler)));
    let connects = Arc::new(AtomicUsize::new(0));
    let (vm, client) = client_with(
        Box::new(SkewedConnector {
            ctx,
            connects: connects.clone(),
        }),
        RetryConfig::default().with_max_remote_attempts(3),
    );
    let app = App::define(&vm, 1);

    let err = client.compile(&app.request(1)).unwrap_err();
    assert_eq!(err.code, CompilationErrorCode::StreamVersionIncompatible);
    assert!(matches!(err.stream_error, Some(StreamError::VersionIncompatible { .. })));
    assert_eq!(client.availability().incompatibility_count(), 1);
    assert_eq!(connects.load(Ordering::Acquire), 1);
    assert_eq!(client.idle_stream_count(), 0);
    // The unsent hierarchy goes out in full with the next request.
    assert!(client.info().needs_full_resync());

    let err = client.compile(&app.request(1)).unwrap_err();
    assert_eq!(err.code, CompilationErrorCode::ServerUnavailable);
    assert_eq!(connects.load(Ordering::Acquire), 1);
    assert_eq!(client.availability().incompatibility_count(), 1);
}

#[test]
fn test_unreachable_server_backs_off() {
    let (vm, client) = client_with(
        Box::new(TcpConnector::new("127.0.0.1:1")),
        RetryConfig::default().with_backoff(Duration::from_secs(60), Duration::from_secs(120)),
    );
    let app = App::define(&vm, 1);

    let err = client.compile(&app.request(1)).unwrap_err();
    assert_eq!(err.code, CompilationErrorCode::StreamFailure);
    assert_eq!(client.availability().consecutive_failures(), 1);
    assert!(!client.availability().is_available(Instant::now()));

    // Inside the back-off window no connection is attempted.
    let err = client.compile(&app.request(1)).unwrap_err();
    assert_eq!(err.code, CompilationErrorCode::ServerUnavailable);
    assert_eq!(client.availability().consecutive_failures(), 1);
}

#[test]
fn test_transport_failures_are_retried_remotely_up_to_the_limit() {
    let (vm, client) = client_with(
        Box::new(TcpConnector::new("127.0.0.1:1")),
        RetryConfig::default()
            .with_backoff(Duration::ZERO, Duration::ZERO)
            .with_max_remote_attempts(3),
    );
    let app = App::define(&vm, 1);

    let err = client.compile(&app.request(1)).unwrap_err();
    assert_eq!(err.code, CompilationErrorCode::StreamFailure);
    assert_eq!(client.availability().consecutive_failures(), 3);
}

#[test]
fn test_out_of_range_status_is_protocol_corruption() {
    let (vm, client) = client_with(Box::new(CorruptConnector), RetryConfig::default());
    let app = App::define(&vm, 1);

    let err = client.compile(&app.request(1)).unwrap_err();
    assert!(matches!(err.stream_error, Some(StreamError::ProtocolCorruption { .. })));
    assert_eq!(client.idle_stream_count(), 0);
    assert!(client.info().needs_full_resync());
}
