//! Value snapshots of client metadata held by the server.
//!
//! A mirror is created from one RPC and then served from cache, so the
//! optimizer can read class and method attributes field by field without a
//! round trip per field.

use crate::core::ids::{ClassId, ConstantPoolId, LoaderId, MethodId};
use serde::{Deserialize, Serialize};

/// Class modifier and shape bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassFlags(pub u32);

impl ClassFlags {
    pub const INTERFACE: u32 = 1 << 0;
    pub const ABSTRACT: u32 = 1 << 1;
    pub const FINAL: u32 = 1 << 2;
    pub const ARRAY: u32 = 1 << 3;
    pub const PRIMITIVE: u32 = 1 << 4;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn is_interface(self) -> bool {
        self.contains(Self::INTERFACE)
    }

    pub fn is_abstract(self) -> bool {
        self.contains(Self::ABSTRACT)
    }
}

/// Everything the server caches about one class, fetched in a single batched RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub class: ClassId,
    pub name: String,
    /// Opaque serialized ROM class.
    pub rom_class: Vec<u8>,
    pub super_class: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    pub depth: u32,
    pub flags: ClassFlags,
    pub loader: LoaderId,
    pub constant_pool: ConstantPoolId,
    pub component_class: Option<ClassId>,
    /// Array class of this class, if the client has created it yet.
    pub array_class: Option<ClassId>,
    pub initialized: bool,
    pub methods: Vec<MethodId>,
}

/// How a call site is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionKind {
    Static,
    Special,
    Virtual,
    Interface,
}

/// Compilation state of a method body on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JittedBodyInfo {
    pub is_compiled: bool,
    pub invocation_count: u32,
    pub start_address: Option<u64>,
}

/// Server-held snapshot of a resolved client method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMethodMirror {
    pub method: MethodId,
    pub owning_class: ClassId,
    pub literals: ConstantPoolId,
    pub name: String,
    pub signature: String,
    pub is_static: bool,
    pub is_final: bool,
    pub is_private: bool,
    pub is_abstract: bool,
    pub is_synchronized: bool,
    pub is_jni_native: bool,
    pub is_interpreted: bool,
    pub vtable_slot: Option<u32>,
    /// Tag of a method the optimizer treats specially.
    pub recognized: Option<u16>,
    pub body: JittedBodyInfo,
}

impl ResolvedMethodMirror {
    /// Whether a call to this method needs a guard to be devirtualized.
    pub fn is_virtual_dispatch(&self) -> bool {
        !self.is_static && !self.is_private && !self.is_final && self.vtable_slot.is_some()
    }
}

/// Primitive or reference type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Int,
    Long,
    Float,
    Double,
    Boolean,
    Reference,
}

impl FieldType {
    /// Parse the leading type character of a field signature.
    pub fn from_signature(signature: &str) -> FieldType {
        match signature.as_bytes().first() {
            Some(b'J') => FieldType::Long,
            Some(b'F') => FieldType::Float,
            Some(b'D') => FieldType::Double,
            Some(b'Z') => FieldType::Boolean,
            Some(b'L') | Some(b'[') => FieldType::Reference,
            _ => FieldType::Int,
        }
    }
}

/// Attributes of a field reference in a constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAttributes {
    pub declaring_class: Option<ClassId>,
    /// Offset for instance fields, address for statics.
    pub offset_or_address: u64,
    pub field_type: FieldType,
    pub is_volatile: bool,
    pub is_final: bool,
    pub is_private: bool,
    pub unresolved_in_cp: bool,
}

/// Static properties of the client VM, fetched once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub pointer_size: u32,
    pub compressed_refs: bool,
    pub heap_base: u64,
    pub heap_top: u64,
    pub has_shared_class_cache: bool,
    pub string_class: ClassId,
    pub object_class: ClassId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_from_signature() {
        assert_eq!(FieldType::from_signature("J"), FieldType::Long);
        assert_eq!(FieldType::from_signature("Ljava/lang/String;"), FieldType::Reference);
        assert_eq!(FieldType::from_signature("[I"), FieldType::Reference);
        assert_eq!(FieldType::from_signature("I"), FieldType::Int);
        assert_eq!(FieldType::from_signature(""), FieldType::Int);
    }

    #[test]
    fn test_class_flags() {
        let flags = ClassFlags(ClassFlags::INTERFACE | ClassFlags::ABSTRACT);
        assert!(flags.is_interface());
        assert!(flags.is_abstract());
        assert!(!flags.contains(ClassFlags::ARRAY));
    }
}
