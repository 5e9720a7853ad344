//! Core runtime data model for the Fer language: values, heap objects,
//! the garbage-collected heap, the string-keyed hash table, chunks of
//! bytecode, and the public error types.
//!
//! Everything that can outlive a single VM instruction lives here. The
//! compiler and VM in `fer-vm` hold `GcRef` handles into the [`Heap`];
//! the heap owns every object and reclaims unreachable ones with a
//! precise mark-and-sweep collector.

pub mod chunk;
pub mod error;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, Op};
pub use error::{CompileError, CompileErrors, ErrorAt, FerError, RuntimeError, TraceFrame};
pub use heap::{GcRef, Heap};
pub use object::{
    hash_str, NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjDict, ObjFunction,
    ObjInstance, ObjList, ObjNative, ObjString, ObjUpvalue, UpvalueLocation,
};
pub use table::Table;
pub use value::{format_number, Value};
