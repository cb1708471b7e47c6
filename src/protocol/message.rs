// This module is the message catalog of the remote-compilation protocol. MessageType is the
// closed set of message kinds, grouped by the subsystem that answers them: session control
// sent by the client, terminal responses sent by the server at the end of a compilation, and
// the many queries the server issues back to the client while compiling (VM introspection,
// batched class info, method resolution, compilation-control state, class hierarchy and
// shared-cache lookups). Each kind has exactly one request payload shape and one reply
// payload shape; the reply to a server query is tagged with the same kind as the query.
// Payloads are plain serde structs or tuples. Unknown kind values never map to a message:
// TryFrom<u16> reports protocol corruption so the connection is dropped instead of a payload
// being misread. The module also defines the compilation request and the terminal response
// payloads, including the server load feedback used for client admission control.

//! Message kinds and payloads exchanged between client and server.

use crate::chtable::class_info::ChTableUpdate;
use crate::core::error::StreamError;
use crate::core::ids::{ClassId, ClientUid, CompThreadId, MethodId};
use crate::protocol::commit_data::CommitData;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version; both ends must agree exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u16,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion {
        major: 1,
        minor: 12,
        patch: 0,
    };

    /// Packed form carried in every frame header.
    pub const fn encode(self) -> u32 {
        ((self.major as u32) << 24) | ((self.minor as u32) << 16) | self.patch as u32
    }

    pub const fn decode(raw: u32) -> Self {
        Self {
            major: (raw >> 24) as u8,
            minor: (raw >> 16) as u8,
            patch: raw as u16,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

macro_rules! message_types {
    ($($name:ident = $value:literal,)*) => {
        /// Kind tag of a protocol message.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum MessageType {
            $($name = $value,)*
        }

        impl MessageType {
            pub const ALL: &'static [MessageType] = &[$(MessageType::$name,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(MessageType::$name => stringify!($name),)*
                }
            }
        }

        impl TryFrom<u16> for MessageType {
            type Error = StreamError;

            fn try_from(value: u16) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(MessageType::$name),)*
                    other => Err(StreamError::corruption(format!("unknown message kind {}", other))),
                }
            }
        }
    };
}

message_types! {
    // Session control, client to server.
    CompilationRequest = 0,
    ClientSessionTerminate = 1,
    ConnectionTerminate = 2,
    CompilationInterrupted = 3,

    // Terminal responses, server to client.
    CompilationCode = 10,
    AotCacheHit = 11,
    CompilationFailure = 12,
    CompilationThreadCrashed = 13,

    // VM introspection.
    VmGetSuperClass = 100,
    VmIsInstanceOf = 101,
    VmGetSystemClassFromClassName = 102,
    VmGetClassOfMethod = 103,
    VmGetClassFromSignature = 104,
    VmClassHasBeenExtended = 105,
    VmClassHasBeenReplaced = 106,
    VmIsClassInitialized = 107,
    VmGetClassDepthAndFlags = 108,
    VmGetInstanceFieldOffset = 109,
    VmGetComponentClass = 110,
    VmGetArrayClass = 111,
    VmGetClassLoader = 112,
    VmIsMethodBreakpointed = 113,
    VmGetStringUtf8Length = 114,
    VmGetMutableCallSiteEpoch = 115,
    VmGetVmInfo = 116,
    VmSetJ2IThunk = 117,

    // Batched class information.
    ClassEnvGetClassInfo = 200,

    // Method resolution.
    ResolvedMethodGetMirror = 300,
    ResolvedMethodGetResolvedStatic = 301,
    ResolvedMethodGetResolvedSpecial = 302,
    ResolvedMethodGetResolvedVirtual = 303,
    ResolvedMethodGetResolvedInterface = 304,
    ResolvedMethodVirtualMethodIsOverridden = 305,
    ResolvedMethodFieldAttributes = 306,
    ResolvedMethodStaticAttributes = 307,
    ResolvedMethodGetClassFromConstantPool = 308,
    ResolvedMethodGetJittedBodyInfo = 309,

    // Compilation control state.
    CompInfoIsCompiled = 400,
    CompInfoGetInvocationCount = 401,

    // Class hierarchy table.
    ChTableGetAllClassInfo = 500,
    ChTableClearReservable = 501,

    // Shared class cache.
    SharedCacheGetClassChainOffset = 600,
}

impl MessageType {
    /// Kinds that end the dialogue of one compilation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageType::CompilationCode
                | MessageType::AotCacheHit
                | MessageType::CompilationFailure
                | MessageType::CompilationThreadCrashed
        )
    }

    /// Kinds the server sends to query the client mid-compilation.
    pub fn is_server_query(self) -> bool {
        (self as u16) >= 100
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Free physical memory state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServerMemoryState {
    Normal,
    Low,
    VeryLow,
}

/// Active compilation thread state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActiveThreadsState {
    Normal,
    High,
    VeryHigh,
}

/// Load feedback attached to successful and low-memory responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerLoad {
    pub memory: ServerMemoryState,
    pub threads: ActiveThreadsState,
}

impl ServerLoad {
    pub const IDLE: ServerLoad = ServerLoad {
        memory: ServerMemoryState::Normal,
        threads: ActiveThreadsState::Normal,
    };
}

/// Optimization level requested for a compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptLevel {
    Cold,
    Warm,
    Hot,
    Scorching,
}

/// Identity fingerprint of a class and its superclass chain, used to address the AOT cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassChain {
    /// Offsets of the ROM classes of the chain in the client's shared cache.
    pub rom_class_offsets: Vec<u64>,
}

/// One compilation request; the first message of every compilation dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationRequest {
    pub client_uid: ClientUid,
    pub seq_no: u32,
    /// Sequence number of the most recent request carrying critical state, up to this one.
    pub last_critical_seq_no: u32,
    pub comp_thread: CompThreadId,
    pub method: MethodId,
    pub class: ClassId,
    pub opt_level: OptLevel,
    /// Serialized compiler options.
    pub options: String,
    /// Whether the client would accept an artifact from the server's AOT cache.
    pub use_aot_cache: bool,
    pub class_chain: Option<ClassChain>,
    pub unloaded_classes: Vec<ClassId>,
    /// Classes redefined since the previous request; their cached metadata is stale.
    pub redefined_classes: Vec<ClassId>,
    pub illegal_final_field_modifications: Vec<ClassId>,
    pub chtable_update: ChTableUpdate,
    /// Diagnostic-only recompilation after a server crash; the outcome is discarded.
    pub diagnostic: bool,
}

impl CompilationRequest {
    /// Whether this request carries state the server must apply in sequence order.
    pub fn carries_critical_state(&self) -> bool {
        !self.unloaded_classes.is_empty()
            || !self.redefined_classes.is_empty()
            || !self.illegal_final_field_modifications.is_empty()
            || !self.chtable_update.is_empty()
    }
}

/// Successful fresh compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationCodeResponse {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub commit: CommitData,
    pub log: String,
    pub load: ServerLoad,
    /// Methods whose calls from this body need trampolines.
    pub trampoline_methods: Vec<MethodId>,
    pub server_uid: u64,
}

/// Artifact served from the server's AOT cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AotCacheHitResponse {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    /// Assumptions the cached body was compiled under; checked again before install.
    pub commit: CommitData,
    pub record_ids: Vec<u64>,
    pub load: ServerLoad,
    pub server_uid: u64,
}

/// Structured compilation failure. The status is kept raw so out-of-range values stay detectable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationFailureResponse {
    pub status: u32,
    pub reason: String,
    pub load: Option<ServerLoad>,
    pub server_uid: u64,
}

/// Server compilation thread crashed while compiling the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub method: MethodId,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_values_are_unique_and_round_trip() {
        let mut seen = std::collections::HashSet::new();
        for &kind in MessageType::ALL {
            assert!(seen.insert(kind as u16), "duplicate value for {}", kind);
            assert_eq!(MessageType::try_from(kind as u16), Ok(kind));
        }
        assert!(matches!(
            MessageType::try_from(9999),
            Err(StreamError::ProtocolCorruption { .. })
        ));
    }

    #[test]
    fn test_terminal_and_query_kinds() {
        assert!(MessageType::CompilationCode.is_terminal());
        assert!(MessageType::CompilationThreadCrashed.is_terminal());
        assert!(!MessageType::VmGetSuperClass.is_terminal());
        assert!(MessageType::VmGetSuperClass.is_server_query());
        assert!(!MessageType::CompilationRequest.is_server_query());
        assert!(!MessageType::CompilationFailure.is_server_query());
    }

    #[test]
    fn test_version_packing() {
        let v = ProtocolVersion::CURRENT;
        assert_eq!(ProtocolVersion::decode(v.encode()), v);
        assert_eq!(v.to_string(), "1.12.0");
    }
}
