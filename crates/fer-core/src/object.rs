//! Heap object variants.
//!
//! Every heap-allocated Fer value is one of these variants. The shared
//! header (mark bit, allocation-list link) lives in the heap's slot, not
//! here; pattern matching replaces the downcasts a C implementation
//! would do with pointer casts.

use std::mem;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::heap::{GcRef, Heap};
use crate::table::Table;
use crate::value::Value;

/// A host-provided callable. Receives the heap (so it can allocate) and
/// the argument window; returns a value or a runtime error message.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, String>;

/// An interned, immutable string with its precomputed FNV-1a hash.
#[derive(Debug)]
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A dynamic array of values.
#[derive(Debug, Default)]
pub struct ObjList {
    pub items: Vec<Value>,
}

/// A hash table keyed by interned strings.
#[derive(Debug, Default)]
pub struct ObjDict {
    pub entries: Table,
}

/// A compiled function. The chunk is shared with the call frames that
/// are currently executing it.
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    /// Interned name, or `None` for the top-level script.
    pub name: Option<GcRef>,
    pub chunk: Rc<Chunk>,
}

/// A registered native function.
#[derive(Debug)]
pub struct ObjNative {
    pub name: GcRef,
    pub arity: u8,
    pub function: NativeFn,
}

/// A function plus its captured upvalues.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: GcRef,
    /// One upvalue handle per upvalue of the function.
    pub upvalues: Vec<GcRef>,
}

/// Where a captured variable currently lives.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueLocation {
    /// Still on the VM value stack, at this slot.
    Stack(usize),
    /// Hoisted into the upvalue itself.
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjUpvalue {
    pub location: UpvalueLocation,
}

impl ObjUpvalue {
    /// The stack slot of an open upvalue. Panics if already closed;
    /// closed upvalues are never on the VM's open list.
    pub fn stack_slot(&self) -> usize {
        match self.location {
            UpvalueLocation::Stack(slot) => slot,
            UpvalueLocation::Closed(_) => panic!("closed upvalue on the open list"),
        }
    }
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: GcRef,
    pub methods: Table,
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: GcRef,
    pub fields: Table,
}

/// A receiver paired with a method closure, produced by reading a
/// method off an instance.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: GcRef,
}

/// A heap object: the discriminant is the type tag.
#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    List(ObjList),
    Dict(ObjDict),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::List(_) => "list",
            Obj::Dict(_) => "dictionary",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native function",
            Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }

    /// Estimated heap footprint, used for GC pacing. Counts the object
    /// itself plus its owned payload.
    pub fn size_estimate(&self) -> usize {
        let payload = match self {
            Obj::String(s) => s.chars.len(),
            Obj::List(l) => l.items.capacity() * mem::size_of::<Value>(),
            Obj::Dict(d) => d.entries.byte_estimate(),
            Obj::Function(f) => {
                f.chunk.code.capacity()
                    + f.chunk.lines.capacity() * mem::size_of::<u32>()
                    + f.chunk.constants.capacity() * mem::size_of::<Value>()
            }
            Obj::Native(_) => 0,
            Obj::Closure(c) => c.upvalues.capacity() * mem::size_of::<GcRef>(),
            Obj::Upvalue(_) => 0,
            Obj::Class(c) => c.methods.byte_estimate(),
            Obj::Instance(i) => i.fields.byte_estimate(),
            Obj::BoundMethod(_) => 0,
        };
        mem::size_of::<Obj>() + payload
    }
}

/// FNV-1a, 32-bit.
pub fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(hash_str(""), 2166136261);
        assert_eq!(hash_str("a"), 0xe40c292c);
        assert_eq!(hash_str("foobar"), 0xbf9cf968);
    }

    #[test]
    fn kind_names() {
        let s = Obj::String(ObjString {
            chars: "x".into(),
            hash: hash_str("x"),
        });
        assert_eq!(s.kind_name(), "string");
        assert_eq!(Obj::List(ObjList::default()).kind_name(), "list");
    }
}
