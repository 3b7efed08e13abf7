//! Object types that every [MemoryManager](crate::MemoryManager) starts with

use crate::object::{ObjectHandle, ObjectType, ObjectView};

/// Leaf object: payload is plain bytes, owns nothing
///
/// Registered as [TypeTag::OPAQUE](crate::TypeTag::OPAQUE).
#[derive(Debug, Default)]
pub struct Opaque;

impl ObjectType for Opaque {
    fn name(&self) -> &str {
        "opaque"
    }

    fn is_container(&self) -> bool {
        false
    }

    fn enumerate_owned(&self, _obj: &ObjectView<'_>, _out: &mut Vec<ObjectHandle>) {}
}

/// Container whose payload is an array of 16-byte reference slots
///
/// Registered as [TypeTag::SLOTS](crate::TypeTag::SLOTS).
/// Slots are written with [MemoryManager::set_slot](crate::MemoryManager::set_slot).
#[derive(Debug, Default)]
pub struct Slots;

impl ObjectType for Slots {
    fn name(&self) -> &str {
        "slots"
    }

    fn is_container(&self) -> bool {
        true
    }

    fn enumerate_owned(&self, obj: &ObjectView<'_>, out: &mut Vec<ObjectHandle>) {
        out.extend(obj.ref_slots());
    }
}
