//! Wire protocol: message catalog, payload types and framed streams.

pub mod commit_data;
pub mod message;
pub mod mirror;
pub mod stream;

pub use commit_data::{CommitData, GuardAssumption, PatchSite, SideEffectSite, VirtualGuardSite};
pub use message::{
    ActiveThreadsState, AotCacheHitResponse, ClassChain, CompilationCodeResponse,
    CompilationFailureResponse, CompilationRequest, CrashReport, MessageType, OptLevel,
    ProtocolVersion, ServerLoad, ServerMemoryState,
};
pub use mirror::{
    ClassFlags, ClassInfo, FieldAttributes, FieldType, JittedBodyInfo, ResolutionKind,
    ResolvedMethodMirror, VmInfo,
};
pub use stream::{
    stream_pair, ChannelTransport, Connector, Frame, MessageStats, Stream, TcpConnector, TcpTransport,
    Transport,
};
