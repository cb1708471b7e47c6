// This module implements the typed, versioned message stream that both ends of the protocol
// use on top of a raw frame transport. The Transport trait moves opaque frames and reports
// connection failure; TcpTransport length-prefixes frames on a socket and ChannelTransport
// connects two in-process endpoints through crossbeam channels, which is what the demo and the
// integration tests use. Stream adds the frame header (protocol version, message kind, payload
// length), encodes payloads with bincode using fixed options that reject trailing bytes, and
// splits reception into read (which returns the kind) and recv_data (which decodes the payload
// into the shape the caller expects), so a shape disagreement between the two ends surfaces
// as TypeMismatch instead of a silently misread value. A frame from a peer with a different
// protocol version is rejected as VersionIncompatible before its payload is looked at, and an
// unknown kind is reported as ProtocolCorruption. MessageStats counts frames per kind.

//! Framed, versioned message streams.

use crate::core::error::{CompilationErrorCode, StreamError, StreamResult};
use crate::protocol::message::{CompilationFailureResponse, MessageType, ProtocolVersion, ServerLoad};
use bincode::Options;
use crossbeam_channel::{Receiver, Sender};
use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

/// Size of the frame header: version (u32), kind (u16), payload length (u32).
pub const FRAME_HEADER_SIZE: usize = 10;

/// Frames larger than this are treated as corruption.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A bidirectional channel of opaque frames.
pub trait Transport: Send {
    fn send_frame(&mut self, frame: &[u8]) -> StreamResult<()>;

    fn recv_frame(&mut self) -> StreamResult<Vec<u8>>;

    /// Close the connection; the peer's next receive fails.
    fn shutdown(&mut self);
}

/// Frames over a TCP socket, each prefixed with its little-endian u32 length.
pub struct TcpTransport {
    socket: TcpStream,
}

impl TcpTransport {
    pub fn new(socket: TcpStream) -> StreamResult<Self> {
        socket.set_nodelay(true)?;
        Ok(Self { socket })
    }

    pub fn connect(address: &str) -> StreamResult<Self> {
        Self::new(TcpStream::connect(address)?)
    }
}

impl Transport for TcpTransport {
    fn send_frame(&mut self, frame: &[u8]) -> StreamResult<()> {
        let len = u32::try_from(frame.len())
            .map_err(|_| StreamError::corruption(format!("frame of {} bytes", frame.len())))?;
        self.socket.write_all(&len.to_le_bytes())?;
        self.socket.write_all(frame)?;
        self.socket.flush()?;
        Ok(())
    }

    fn recv_frame(&mut self) -> StreamResult<Vec<u8>> {
        let mut len = [0u8; 4];
        self.socket.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(StreamError::corruption(format!("frame length {}", len)));
        }
        let mut frame = vec![0u8; len];
        self.socket.read_exact(&mut frame)?;
        Ok(frame)
    }

    fn shutdown(&mut self) {
        // Already-closed sockets report NotConnected; nothing left to do then.
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// In-process frames over a pair of crossbeam channels.
pub struct ChannelTransport {
    tx: Option<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
}

impl ChannelTransport {
    /// Two connected endpoints.
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        (
            ChannelTransport { tx: Some(a_tx), rx: a_rx },
            ChannelTransport { tx: Some(b_tx), rx: b_rx },
        )
    }
}

impl Transport for ChannelTransport {
    fn send_frame(&mut self, frame: &[u8]) -> StreamResult<()> {
        let tx = self.tx.as_ref().ok_or_else(|| StreamError::closed("transport shut down"))?;
        tx.send(frame.to_vec())
            .map_err(|_| StreamError::closed("peer disconnected"))
    }

    fn recv_frame(&mut self) -> StreamResult<Vec<u8>> {
        if self.tx.is_none() {
            return Err(StreamError::closed("transport shut down"));
        }
        self.rx.recv().map_err(|_| StreamError::closed("peer disconnected"))
    }

    fn shutdown(&mut self) {
        self.tx = None;
    }
}

/// Per-kind frame counters of one stream.
#[derive(Debug, Clone, Default)]
pub struct MessageStats {
    sent: HashMap<MessageType, u64>,
    received: HashMap<MessageType, u64>,
}

impl MessageStats {
    pub fn sent(&self, kind: MessageType) -> u64 {
        self.sent.get(&kind).copied().unwrap_or(0)
    }

    pub fn received(&self, kind: MessageType) -> u64 {
        self.received.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_sent(&self) -> u64 {
        self.sent.values().sum()
    }

    pub fn total_received(&self) -> u64 {
        self.received.values().sum()
    }

    /// Fold another stream's counters into these.
    pub fn merge(&mut self, other: &MessageStats) {
        for (kind, count) in &other.sent {
            *self.sent.entry(*kind).or_insert(0) += count;
        }
        for (kind, count) in &other.received {
            *self.received.entry(*kind).or_insert(0) += count;
        }
    }
}

impl fmt::Display for MessageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Message Statistics:")?;
        writeln!(f, "  Sent: {}", self.total_sent())?;
        writeln!(f, "  Received: {}", self.total_received())?;
        for &kind in MessageType::ALL {
            let (sent, received) = (self.sent(kind), self.received(kind));
            if sent + received > 0 {
                writeln!(f, "    {:<40} sent {:>6}  received {:>6}", kind.name(), sent, received)?;
            }
        }
        Ok(())
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_FRAME_SIZE as u64)
}

/// One encoded message, header included.
#[derive(Debug, Clone)]
pub struct Frame {
    kind: MessageType,
    bytes: Vec<u8>,
}

impl Frame {
    pub fn kind(&self) -> MessageType {
        self.kind
    }
}

/// A typed message stream over one transport.
pub struct Stream {
    transport: Box<dyn Transport>,
    version: u32,
    pending: Option<(MessageType, Vec<u8>)>,
    stats: MessageStats,
}

impl Stream {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_version(transport, ProtocolVersion::CURRENT.encode())
    }

    /// Stream that stamps frames with an explicit protocol version.
    pub fn with_version(transport: Box<dyn Transport>, version: u32) -> Self {
        Self {
            transport,
            version,
            pending: None,
            stats: MessageStats::default(),
        }
    }

    /// Encode one message without sending it.
    pub fn prepare<T: Serialize + ?Sized>(&self, kind: MessageType, args: &T) -> StreamResult<Frame> {
        let payload = codec()
            .serialize(args)
            .map_err(|e| StreamError::mismatch(format!("encoding {}: {}", kind, e)))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| StreamError::corruption(format!("payload of {} bytes", payload.len())))?;

        let mut bytes = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&(kind as u16).to_le_bytes());
        bytes.extend_from_slice(&len.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(Frame { kind, bytes })
    }

    /// Send a message encoded by `prepare`.
    pub fn send_prepared(&mut self, frame: Frame) -> StreamResult<()> {
        self.transport.send_frame(&frame.bytes)?;
        *self.stats.sent.entry(frame.kind).or_insert(0) += 1;
        log::trace!("sent {} ({} bytes)", frame.kind, frame.bytes.len() - FRAME_HEADER_SIZE);
        Ok(())
    }

    /// Send one message of `kind` with `args` as payload.
    pub fn write<T: Serialize + ?Sized>(&mut self, kind: MessageType, args: &T) -> StreamResult<()> {
        let frame = self.prepare(kind, args)?;
        self.send_prepared(frame)
    }

    /// Receive the next message and return its kind; the payload is kept for `recv_data`.
    pub fn read(&mut self) -> StreamResult<MessageType> {
        let frame = self.transport.recv_frame()?;
        if frame.len() < FRAME_HEADER_SIZE {
            return Err(StreamError::corruption(format!("short frame of {} bytes", frame.len())));
        }
        let version = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if version != self.version {
            return Err(StreamError::VersionIncompatible {
                local: self.version,
                remote: version,
            });
        }
        let kind = MessageType::try_from(u16::from_le_bytes([frame[4], frame[5]]))?;
        let len = u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]) as usize;
        if len != frame.len() - FRAME_HEADER_SIZE {
            return Err(StreamError::corruption(format!(
                "{} declares {} payload bytes, frame carries {}",
                kind,
                len,
                frame.len() - FRAME_HEADER_SIZE
            )));
        }
        *self.stats.received.entry(kind).or_insert(0) += 1;
        log::trace!("received {} ({} bytes)", kind, len);
        self.pending = Some((kind, frame[FRAME_HEADER_SIZE..].to_vec()));
        Ok(kind)
    }

    /// Decode the payload of the message returned by the last `read`.
    pub fn recv_data<T: DeserializeOwned>(&mut self) -> StreamResult<T> {
        let (kind, payload) = self
            .pending
            .take()
            .ok_or_else(|| StreamError::mismatch("no message pending"))?;
        codec().deserialize(&payload).map_err(|e| {
            StreamError::mismatch(format!(
                "payload of {} does not decode as {}: {}",
                kind,
                std::any::type_name::<T>(),
                e
            ))
        })
    }

    /// Drop the payload of the last `read` without decoding it.
    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Read a reply that must be of `kind`.
    ///
    /// A `CompilationInterrupted` notice in place of the reply means the peer
    /// abandoned the compilation.
    pub fn read_reply<T: DeserializeOwned>(&mut self, kind: MessageType) -> StreamResult<T> {
        match self.read()? {
            k if k == kind => self.recv_data(),
            MessageType::CompilationInterrupted => {
                self.pending = None;
                Err(StreamError::Interrupted)
            }
            other => Err(StreamError::mismatch(format!(
                "expected reply {}, received {}",
                kind, other
            ))),
        }
    }

    /// Send a query and wait for its reply.
    pub fn rpc<A, R>(&mut self, kind: MessageType, args: &A) -> StreamResult<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.write(kind, args)?;
        self.read_reply(kind)
    }

    /// Send a structured compilation failure.
    pub fn write_error(
        &mut self,
        code: CompilationErrorCode,
        reason: impl Into<String>,
        load: Option<ServerLoad>,
        server_uid: u64,
    ) -> StreamResult<()> {
        let failure = CompilationFailureResponse {
            status: code.as_u32(),
            reason: reason.into(),
            load,
            server_uid,
        };
        self.write(MessageType::CompilationFailure, &failure)
    }

    pub fn stats(&self) -> &MessageStats {
        &self.stats
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn shutdown(&mut self) {
        self.transport.shutdown();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("version", &ProtocolVersion::decode(self.version))
            .field("sent", &self.stats.total_sent())
            .field("received", &self.stats.total_received())
            .finish()
    }
}

/// Two connected in-process streams.
pub fn stream_pair() -> (Stream, Stream) {
    let (a, b) = ChannelTransport::pair();
    (Stream::new(Box::new(a)), Stream::new(Box::new(b)))
}

/// Opens fresh streams to one server.
pub trait Connector: Send + Sync {
    fn connect(&self) -> StreamResult<Stream>;

    /// Server identity used for availability and compatibility bookkeeping.
    fn server_address(&self) -> String;
}

/// Connects to a server over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> StreamResult<Stream> {
        let transport = TcpTransport::connect(&self.address)?;
        log::debug!("connected to {}", self.address);
        Ok(Stream::new(Box::new(transport)))
    }

    fn server_address(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::ClassId;

    #[test]
    fn test_write_read_recv_data() {
        let (mut client, mut server) = stream_pair();
        server
            .write(MessageType::VmGetSuperClass, &(ClassId::new(0x10),))
            .unwrap();
        assert_eq!(client.read().unwrap(), MessageType::VmGetSuperClass);
        let (class,): (ClassId,) = client.recv_data().unwrap();
        assert_eq!(class, ClassId::new(0x10));
        assert_eq!(client.stats().received(MessageType::VmGetSuperClass), 1);
        assert_eq!(server.stats().sent(MessageType::VmGetSuperClass), 1);
    }

    #[test]
    fn test_shape_mismatch_is_type_mismatch() {
        let (mut a, mut b) = stream_pair();
        a.write(MessageType::VmIsInstanceOf, &(1u64, 2u64)).unwrap();
        b.read().unwrap();
        let result: StreamResult<(u64,)> = b.recv_data();
        assert!(matches!(result, Err(StreamError::TypeMismatch { .. })));
    }

    #[test]
    fn test_version_mismatch_detected_on_read() {
        let (x, y) = ChannelTransport::pair();
        let mut old = Stream::with_version(Box::new(x), 7);
        let mut current = Stream::new(Box::new(y));
        old.write(MessageType::CompilationCode, &()).unwrap();
        assert_eq!(
            current.read(),
            Err(StreamError::VersionIncompatible {
                local: ProtocolVersion::CURRENT.encode(),
                remote: 7
            })
        );
    }

    #[test]
    fn test_unknown_kind_is_corruption() {
        let (mut x, y) = ChannelTransport::pair();
        let mut stream = Stream::new(Box::new(y));
        let mut frame = ProtocolVersion::CURRENT.encode().to_le_bytes().to_vec();
        frame.extend_from_slice(&4242u16.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        x.send_frame(&frame).unwrap();
        assert!(matches!(stream.read(), Err(StreamError::ProtocolCorruption { .. })));
    }

    #[test]
    fn test_interrupted_reply_and_shutdown() {
        let (mut a, mut b) = stream_pair();
        b.write(MessageType::CompilationInterrupted, &()).unwrap();
        let reply: StreamResult<bool> = a.read_reply(MessageType::VmClassHasBeenExtended);
        assert_eq!(reply, Err(StreamError::Interrupted));

        b.shutdown();
        assert!(matches!(a.read(), Err(StreamError::TransportClosed { .. })));
    }
}
