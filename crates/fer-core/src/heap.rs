//! The garbage-collected heap.
//!
//! Objects live in an arena of slots; a [`GcRef`] is a stable index
//! handle. Live objects are threaded on an intrusive allocation list so
//! the sweep can walk exactly the objects that exist; freed slots are
//! recycled through a free list. Collection is precise mark-and-sweep:
//! the VM seeds the gray worklist with its roots, `trace_references`
//! darkens the object graph, the intern pool drops entries whose key
//! did not survive marking, and `sweep` reclaims everything left white.
//!
//! Pacing: every allocation adds the object's estimated footprint to
//! `bytes_allocated`; the VM collects when that passes `next_gc` (or on
//! every allocation in stress mode), and after a collection the
//! threshold is twice the surviving bytes.

use crate::object::{hash_str, Obj, ObjString};
use crate::table::Table;
use crate::value::{format_number, Value};

const GC_HEAP_GROW_FACTOR: usize = 2;
const GC_FIRST_THRESHOLD: usize = 1024 * 1024;

/// A handle to a heap object. Valid for as long as the object is
/// reachable from the GC roots; the heap never moves objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef(u32);

impl GcRef {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_index(index: u32) -> Self {
        GcRef(index)
    }
}

#[derive(Debug)]
struct Slot {
    marked: bool,
    /// Next object on the allocation list, if this slot is live.
    next: Option<u32>,
    /// `None` marks a free slot awaiting reuse.
    obj: Option<Obj>,
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    /// Head of the intrusive allocation list.
    head: Option<u32>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<GcRef>,
    /// The string intern pool. Keys are not kept alive by this table:
    /// the collector prunes unmarked keys before sweeping.
    strings: Table,
    /// Collect on every allocation.
    pub stress: bool,
    /// Log allocation and collection activity to stderr.
    pub log: bool,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            next_gc: GC_FIRST_THRESHOLD,
            ..Heap::default()
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// True when the next allocation should be preceded by a collection.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// The single allocation path. Links the object into the allocation
    /// list and accounts its footprint.
    pub fn allocate(&mut self, obj: Obj) -> GcRef {
        self.bytes_allocated += obj.size_estimate();
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Slot {
                    marked: false,
                    next: self.head,
                    obj: Some(obj),
                };
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    marked: false,
                    next: self.head,
                    obj: Some(obj),
                });
                index
            }
        };
        self.head = Some(index);
        if self.log {
            let slot = &self.slots[index as usize];
            let obj = slot.obj.as_ref().unwrap();
            eprintln!(
                "[gc] allocate #{index} ({}, {} bytes)",
                obj.kind_name(),
                obj.size_estimate()
            );
        }
        GcRef(index)
    }

    /// Intern a string: return the canonical object for these bytes,
    /// allocating one only if none is alive.
    pub fn intern(&mut self, s: &str) -> GcRef {
        let hash = hash_str(s);
        let slots = &self.slots;
        let found = self.strings.find_key(hash, |key| {
            match slots[key.index() as usize].obj.as_ref() {
                Some(Obj::String(existing)) => &*existing.chars == s,
                _ => false,
            }
        });
        if let Some(existing) = found {
            return existing;
        }
        let string = self.allocate(Obj::String(ObjString {
            chars: s.into(),
            hash,
        }));
        self.strings.set(string, hash, Value::nil());
        string
    }

    pub fn obj(&self, r: GcRef) -> &Obj {
        self.slots[r.0 as usize]
            .obj
            .as_ref()
            .expect("use of freed object")
    }

    pub fn obj_mut(&mut self, r: GcRef) -> &mut Obj {
        self.slots[r.0 as usize]
            .obj
            .as_mut()
            .expect("use of freed object")
    }

    pub fn string(&self, r: GcRef) -> &ObjString {
        match self.obj(r) {
            Obj::String(s) => s,
            other => panic!("expected string, found {}", other.kind_name()),
        }
    }

    /// The precomputed hash of an interned string.
    pub fn hash_of(&self, r: GcRef) -> u32 {
        self.string(r).hash
    }

    // Typed accessors for places where the tag is an invariant of the
    // bytecode (a mismatch is a compiler bug, not a user error).

    pub fn function(&self, r: GcRef) -> &crate::object::ObjFunction {
        match self.obj(r) {
            Obj::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn closure(&self, r: GcRef) -> &crate::object::ObjClosure {
        match self.obj(r) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn closure_mut(&mut self, r: GcRef) -> &mut crate::object::ObjClosure {
        match self.obj_mut(r) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn class(&self, r: GcRef) -> &crate::object::ObjClass {
        match self.obj(r) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn class_mut(&mut self, r: GcRef) -> &mut crate::object::ObjClass {
        match self.obj_mut(r) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn instance_mut(&mut self, r: GcRef) -> &mut crate::object::ObjInstance {
        match self.obj_mut(r) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn list(&self, r: GcRef) -> &crate::object::ObjList {
        match self.obj(r) {
            Obj::List(l) => l,
            other => panic!("expected list, found {}", other.kind_name()),
        }
    }

    pub fn list_mut(&mut self, r: GcRef) -> &mut crate::object::ObjList {
        match self.obj_mut(r) {
            Obj::List(l) => l,
            other => panic!("expected list, found {}", other.kind_name()),
        }
    }

    pub fn dict(&self, r: GcRef) -> &crate::object::ObjDict {
        match self.obj(r) {
            Obj::Dict(d) => d,
            other => panic!("expected dictionary, found {}", other.kind_name()),
        }
    }

    pub fn dict_mut(&mut self, r: GcRef) -> &mut crate::object::ObjDict {
        match self.obj_mut(r) {
            Obj::Dict(d) => d,
            other => panic!("expected dictionary, found {}", other.kind_name()),
        }
    }

    pub fn upvalue(&self, r: GcRef) -> &crate::object::ObjUpvalue {
        match self.obj(r) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn upvalue_mut(&mut self, r: GcRef) -> &mut crate::object::ObjUpvalue {
        match self.obj_mut(r) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    // ── Mark phase ────────────────────────────────────────────────

    pub fn mark_value(&mut self, value: Value) {
        if let Some(r) = value.as_object() {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: GcRef) {
        let slot = &mut self.slots[r.0 as usize];
        if slot.obj.is_none() || slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.pairs() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Drain the gray worklist, darkening each object's referents.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: GcRef) {
        match self.obj(r) {
            // Strings hold no references.
            Obj::String(_) => {}
            Obj::List(list) => {
                let count = list.items.len();
                for i in 0..count {
                    let item = match self.obj(r) {
                        Obj::List(list) => list.items[i],
                        _ => unreachable!(),
                    };
                    self.mark_value(item);
                }
            }
            Obj::Dict(dict) => {
                let pairs = dict.entries.pairs();
                for (key, value) in pairs {
                    self.mark_object(key);
                    self.mark_value(value);
                }
            }
            Obj::Function(function) => {
                let name = function.name;
                let count = function.chunk.constants.len();
                if let Some(name) = name {
                    self.mark_object(name);
                }
                for i in 0..count {
                    let constant = match self.obj(r) {
                        Obj::Function(function) => function.chunk.constants[i],
                        _ => unreachable!(),
                    };
                    self.mark_value(constant);
                }
            }
            Obj::Native(native) => {
                let name = native.name;
                self.mark_object(name);
            }
            Obj::Closure(closure) => {
                let function = closure.function;
                let upvalues = closure.upvalues.clone();
                self.mark_object(function);
                for upvalue in upvalues {
                    self.mark_object(upvalue);
                }
            }
            Obj::Upvalue(upvalue) => {
                if let crate::object::UpvalueLocation::Closed(value) = upvalue.location {
                    self.mark_value(value);
                }
            }
            Obj::Class(class) => {
                let name = class.name;
                let methods = class.methods.pairs();
                self.mark_object(name);
                for (key, value) in methods {
                    self.mark_object(key);
                    self.mark_value(value);
                }
            }
            Obj::Instance(instance) => {
                let class = instance.class;
                let fields = instance.fields.pairs();
                self.mark_object(class);
                for (key, value) in fields {
                    self.mark_object(key);
                    self.mark_value(value);
                }
            }
            Obj::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                self.mark_value(receiver);
                self.mark_object(method);
            }
        }
    }

    // ── Sweep phase ───────────────────────────────────────────────

    /// Prune intern-pool entries whose key did not survive marking.
    /// Must run after `trace_references` and before `sweep`.
    pub fn remove_unmarked_strings(&mut self) {
        let slots = &self.slots;
        self.strings
            .retain_keys(|key| slots[key.index() as usize].marked);
    }

    /// Walk the allocation list: free unmarked objects, clear the mark
    /// on survivors, and recompute the surviving byte count.
    pub fn sweep(&mut self) {
        let before = self.bytes_allocated;
        let mut live_bytes = 0usize;
        let mut prev: Option<u32> = None;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &mut self.slots[index as usize];
            let next = slot.next;
            if slot.marked {
                slot.marked = false;
                live_bytes += slot.obj.as_ref().unwrap().size_estimate();
                prev = Some(index);
            } else {
                let obj = slot.obj.take().unwrap();
                slot.next = None;
                if self.log {
                    eprintln!("[gc] free #{index} ({})", obj.kind_name());
                }
                drop(obj);
                match prev {
                    Some(p) => self.slots[p as usize].next = next,
                    None => self.head = next,
                }
                self.free.push(index);
            }
            cursor = next;
        }
        self.bytes_allocated = live_bytes;
        self.next_gc = (self.bytes_allocated * GC_HEAP_GROW_FACTOR).max(GC_FIRST_THRESHOLD);
        if self.log {
            eprintln!(
                "[gc] collected {} bytes ({} -> {}), next at {}",
                before.saturating_sub(live_bytes),
                before,
                live_bytes,
                self.next_gc
            );
        }
    }

    /// Number of live objects on the allocation list.
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            count += 1;
            cursor = self.slots[index as usize].next;
        }
        count
    }

    /// Walk the allocation list and assert it holds no duplicates and
    /// only live slots. Used by tests.
    pub fn check_allocation_list(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        let mut cursor = self.head;
        while let Some(index) = cursor {
            if !seen.insert(index) {
                return false;
            }
            let slot = &self.slots[index as usize];
            if slot.obj.is_none() {
                return false;
            }
            cursor = slot.next;
        }
        true
    }

    // ── Printing ──────────────────────────────────────────────────

    /// Render a value the way `print` and the REPL show it.
    pub fn format_value(&self, value: Value) -> String {
        if value.is_nil() {
            return "nil".to_string();
        }
        if let Some(b) = value.as_bool() {
            return b.to_string();
        }
        if let Some(n) = value.as_number() {
            return format_number(n);
        }
        match value.as_object() {
            Some(r) => self.format_object(r),
            None => unreachable!("value is not nil, bool, number or object"),
        }
    }

    fn format_function(&self, function: GcRef) -> String {
        match self.obj(function) {
            Obj::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", self.string(name).chars),
                None => "<script>".to_string(),
            },
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    fn format_object(&self, r: GcRef) -> String {
        match self.obj(r) {
            Obj::String(s) => s.chars.to_string(),
            Obj::List(list) => {
                let items: Vec<String> =
                    list.items.iter().map(|v| self.format_value(*v)).collect();
                format!("[{}]", items.join(", "))
            }
            Obj::Dict(dict) => {
                let pairs: Vec<String> = dict
                    .entries
                    .pairs()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", self.string(*k).chars, self.format_value(*v)))
                    .collect();
                format!("{{{}}}", pairs.join(", "))
            }
            Obj::Function(_) => self.format_function(r),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Closure(closure) => self.format_function(closure.function),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(class) => self.string(class.name).chars.to_string(),
            Obj::Instance(instance) => {
                let class = match self.obj(instance.class) {
                    Obj::Class(c) => c,
                    other => panic!("expected class, found {}", other.kind_name()),
                };
                format!("{} instance", self.string(class.name).chars)
            }
            Obj::BoundMethod(bound) => self.format_function({
                match self.obj(bound.method) {
                    Obj::Closure(c) => c.function,
                    other => panic!("expected closure, found {}", other.kind_name()),
                }
            }),
        }
    }
}
