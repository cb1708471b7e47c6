//! Opaque identities of client-side VM entities.
//!
//! The server never dereferences anything the client owns. Class, method and
//! constant-pool pointers of the client become comparable, hashable tokens that
//! are only ever used as map keys or echoed back to the client as RPC arguments.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! remote_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw token value as sent over the wire.
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{:#x}"), self.0)
            }
        }
    };
}

remote_id!(
    /// Identity of a loaded class on the client (its RAM class pointer).
    ClassId,
    "class@"
);
remote_id!(
    /// Identity of a method on the client (its RAM method pointer).
    MethodId,
    "method@"
);
remote_id!(
    /// Identity of a class's constant pool on the client.
    ConstantPoolId,
    "cp@"
);
remote_id!(
    /// Identity of a class loader on the client.
    LoaderId,
    "loader@"
);
remote_id!(
    /// Location of a heap reference on the client. Never dereferenced by the server.
    ObjectHandle,
    "obj@"
);

/// Stable identity of one logical client VM instance.
///
/// Survives reconnects of individual streams; owns exactly one server-side
/// client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientUid(pub u64);

impl fmt::Display for ClientUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Index of a compilation thread within one process.
pub type CompThreadId = usize;

/// Index into a per-compilation known-object table.
pub type KnownObjectIndex = u32;
