//! The handle-based object heap.
//!
//! Objects are addressed by [`ObjHandle`] — a slot index plus a generation
//! counter. Freeing a slot bumps its generation, so a handle that survived
//! its object can be detected instead of silently resolving to whatever
//! reuses the slot.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use ovum_core::{ObjHandle, TypeId, Value};

/// A key in a Hash object. Reals key by their bit pattern; strings by
/// content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Int(i64),
    UInt(u64),
    Bool(bool),
    RealBits(u64),
    Str(Arc<str>),
}

impl HashKey {
    /// Derives a key from a value; `None` for values that cannot key a Hash.
    pub fn from_value(value: &Value) -> Option<HashKey> {
        match value {
            Value::Int(i) => Some(HashKey::Int(*i)),
            Value::UInt(u) => Some(HashKey::UInt(*u)),
            Value::Bool(b) => Some(HashKey::Bool(*b)),
            Value::Real(r) => Some(HashKey::RealBits(r.to_bits())),
            Value::Str(s) => Some(HashKey::Str(Arc::clone(s))),
            Value::Enum(_, v) => Some(HashKey::Int(*v)),
            _ => None,
        }
    }
}

/// The storage of one object.
#[derive(Debug)]
pub enum ObjectBody {
    /// Plain instance fields.
    Fields(Vec<Value>),
    /// Backing store of an `aves.List`.
    List(Vec<Value>),
    /// Backing store of an `aves.Hash`.
    Hash(FxHashMap<HashKey, Value>),
}

#[derive(Debug)]
struct HeapSlot {
    generation: u32,
    object: Option<HeapObject>,
}

#[derive(Debug)]
struct HeapObject {
    type_id: TypeId,
    body: ObjectBody,
    marked: bool,
}

/// The object store. All access is serialized by the owning [`super::Gc`]'s
/// lock, which also serves as the field-access lock for reference-mediated
/// reads and writes.
#[derive(Debug, Default)]
pub struct ObjectHeap {
    slots: Vec<HeapSlot>,
    free: Vec<u32>,
    live: usize,
}

impl ObjectHeap {
    pub fn new() -> ObjectHeap {
        ObjectHeap::default()
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Allocates an object with the given body.
    pub fn alloc(&mut self, type_id: TypeId, body: ObjectBody) -> ObjHandle {
        self.live += 1;
        let object = HeapObject {
            type_id,
            body,
            marked: false,
        };
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.object = Some(object);
                ObjHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(HeapSlot {
                    generation: 0,
                    object: Some(object),
                });
                ObjHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Allocates an object with `field_count` null fields.
    pub fn alloc_fields(&mut self, type_id: TypeId, field_count: u32) -> ObjHandle {
        self.alloc(
            type_id,
            ObjectBody::Fields(vec![Value::Null; field_count as usize]),
        )
    }

    fn resolve(&self, handle: ObjHandle) -> Option<&HeapObject> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.object.as_ref()
    }

    fn resolve_mut(&mut self, handle: ObjHandle) -> Option<&mut HeapObject> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.object.as_mut()
    }

    pub fn is_live(&self, handle: ObjHandle) -> bool {
        self.resolve(handle).is_some()
    }

    pub fn type_of(&self, handle: ObjHandle) -> Option<TypeId> {
        self.resolve(handle).map(|o| o.type_id)
    }

    pub fn field(&self, handle: ObjHandle, index: u32) -> Option<Value> {
        match &self.resolve(handle)?.body {
            ObjectBody::Fields(fields) => fields.get(index as usize).cloned(),
            _ => None,
        }
    }

    pub fn set_field(&mut self, handle: ObjHandle, index: u32, value: Value) -> bool {
        match &mut self.resolve_mut(handle).map(|o| &mut o.body) {
            Some(ObjectBody::Fields(fields)) => match fields.get_mut(index as usize) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    pub fn body(&self, handle: ObjHandle) -> Option<&ObjectBody> {
        self.resolve(handle).map(|o| &o.body)
    }

    pub fn body_mut(&mut self, handle: ObjHandle) -> Option<&mut ObjectBody> {
        self.resolve_mut(handle).map(|o| &mut o.body)
    }

    // Mark-sweep plumbing, driven by the Gc.

    pub(crate) fn clear_marks(&mut self) {
        for slot in &mut self.slots {
            if let Some(object) = &mut slot.object {
                object.marked = false;
            }
        }
    }

    /// Marks the object; returns true when it was newly marked (and its
    /// children still need tracing).
    pub(crate) fn mark(&mut self, handle: ObjHandle) -> bool {
        match self.resolve_mut(handle) {
            Some(object) if !object.marked => {
                object.marked = true;
                true
            }
            _ => false,
        }
    }

    /// Collects the handles referenced by an object's body.
    pub(crate) fn trace(&self, handle: ObjHandle, out: &mut Vec<ObjHandle>) {
        fn visit(value: &Value, out: &mut Vec<ObjHandle>) {
            match value {
                Value::Object { handle, .. } => out.push(*handle),
                Value::FieldRef { object, .. } => out.push(*object),
                _ => {}
            }
        }

        let Some(object) = self.resolve(handle) else {
            return;
        };
        match &object.body {
            ObjectBody::Fields(values) | ObjectBody::List(values) => {
                for value in values {
                    visit(value, out);
                }
            }
            ObjectBody::Hash(map) => {
                for value in map.values() {
                    visit(value, out);
                }
            }
        }
    }

    /// Frees every unmarked object. Returns the number freed.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let dead = matches!(&slot.object, Some(object) if !object.marked);
            if dead {
                slot.object = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                freed += 1;
            }
        }
        self.live -= freed;
        freed
    }
}
