use std::rc::Rc;

use crate::bytecode::chunk::Chunk;
use crate::lang::value::Value;
use crate::runtime::table::Table;

/// Initial allocation budget before the first collection cycle.
pub const GC_INITIAL_THRESHOLD: usize = 64;
const GC_GROW_FACTOR: usize = 2;

/// Index of a live object in the [`Heap`] registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// A compiled function: created once at compile time, immutable afterwards.
#[derive(Debug)]
pub struct FunctionProto {
    /// Empty for the top-level script.
    pub name: Rc<str>,
    pub arity: u8,
    /// Number of captured variables a closure over this prototype carries.
    pub upvalue_count: usize,
    pub chunk: Chunk,
}

impl FunctionProto {
    pub fn new(name: Rc<str>) -> Self {
        FunctionProto {
            name,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
        }
    }
}

/// A runtime function value: one prototype plus the captured-variable cells
/// it closes over.
#[derive(Debug)]
pub struct Closure {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

/// A captured-variable cell.
///
/// Open upvalues alias a live operand-stack slot; when the owning frame or
/// block ends they close by copying the value out. The transition happens
/// exactly once, open to closed, never back.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Class {
    pub name: Rc<str>,
    pub methods: Table<Value>,
}

#[derive(Debug)]
pub struct Instance {
    pub class: Handle,
    pub fields: Table<Value>,
}

/// A method closure paired with the receiver it was looked up on.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Handle,
    pub method: Handle,
}

#[derive(Debug)]
pub enum Obj {
    Function(FunctionProto),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

/// The object heap: an explicit registry of every allocated object with a
/// mark bit per slot, a free list, and the string-interning set.
///
/// Reclamation is tri-color mark-sweep: the VM greys the roots via
/// [`Heap::mark_value`] / [`Heap::mark_object`], [`Heap::trace`] drains the
/// grey worklist blackening objects by marking their out-edges, and
/// [`Heap::sweep`] frees whatever stayed white. Reference cycles between
/// closures, instances, and captured state are reclaimed like anything else.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Obj>>,
    marks: Vec<bool>,
    free: Vec<u32>,
    grey: Vec<Handle>,
    live: usize,
    /// Allocations since the last collection cycle.
    allocated: usize,
    /// Adaptive trigger; reset to roughly twice the live count after a cycle.
    next_gc: usize,
    strings: Table<()>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::with_threshold(GC_INITIAL_THRESHOLD)
    }

    pub fn with_threshold(next_gc: usize) -> Self {
        Heap {
            slots: Vec::new(),
            marks: Vec::new(),
            free: Vec::new(),
            grey: Vec::new(),
            live: 0,
            allocated: 0,
            next_gc,
            strings: Table::new(),
        }
    }

    /// Register a fully-formed object and return its handle.
    ///
    /// Never triggers a collection: the VM decides when to collect, strictly
    /// before it starts building the objects of an instruction.
    pub fn alloc(&mut self, obj: Obj) -> Handle {
        self.allocated += 1;
        self.live += 1;
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(obj);
                self.marks[idx as usize] = false;
                Handle(idx)
            }
            None => {
                self.slots.push(Some(obj));
                self.marks.push(false);
                Handle(self.slots.len() as u32 - 1)
            }
        }
    }

    pub fn get(&self, handle: Handle) -> &Obj {
        match &self.slots[handle.0 as usize] {
            Some(obj) => obj,
            None => panic!("dangling object handle {}", handle.0),
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        match &mut self.slots[handle.0 as usize] {
            Some(obj) => obj,
            None => panic!("dangling object handle {}", handle.0),
        }
    }

    pub fn live_objects(&self) -> usize {
        self.live
    }

    /// True once the allocations since the last cycle exceed the adaptive
    /// threshold.
    pub fn should_collect(&self) -> bool {
        self.allocated > self.next_gc
    }

    /// Intern a string: identical content always yields the same allocation.
    pub fn intern(&mut self, s: &str) -> Rc<str> {
        if let Some(existing) = self.strings.find_key(s) {
            return existing;
        }
        let rc: Rc<str> = Rc::from(s);
        self.strings.set(rc.clone(), ());
        rc
    }

    // --- typed accessors -----------------------------------------------------
    // Handle/variant mismatches indicate corrupt bytecode or a VM bug, the
    // fatal error class, hence the panics.

    pub fn function(&self, handle: Handle) -> &FunctionProto {
        match self.get(handle) {
            Obj::Function(f) => f,
            other => panic!("expected function, found {:?}", other),
        }
    }

    pub fn closure(&self, handle: Handle) -> &Closure {
        match self.get(handle) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, found {:?}", other),
        }
    }

    pub fn upvalue(&self, handle: Handle) -> &Upvalue {
        match self.get(handle) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {:?}", other),
        }
    }

    pub fn upvalue_mut(&mut self, handle: Handle) -> &mut Upvalue {
        match self.get_mut(handle) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {:?}", other),
        }
    }

    pub fn class(&self, handle: Handle) -> &Class {
        match self.get(handle) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {:?}", other),
        }
    }

    pub fn class_mut(&mut self, handle: Handle) -> &mut Class {
        match self.get_mut(handle) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {:?}", other),
        }
    }

    pub fn instance(&self, handle: Handle) -> &Instance {
        match self.get(handle) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {:?}", other),
        }
    }

    pub fn instance_mut(&mut self, handle: Handle) -> &mut Instance {
        match self.get_mut(handle) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {:?}", other),
        }
    }

    pub fn bound_method(&self, handle: Handle) -> &BoundMethod {
        match self.get(handle) {
            Obj::BoundMethod(b) => b,
            other => panic!("expected bound method, found {:?}", other),
        }
    }

    // --- collection ----------------------------------------------------------

    /// Grey a root value if it references a heap object.
    pub fn mark_value(&mut self, value: &Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(*handle);
        }
    }

    /// Grey a white object: set its mark bit and queue it for tracing.
    pub fn mark_object(&mut self, handle: Handle) {
        let idx = handle.0 as usize;
        if self.slots[idx].is_some() && !self.marks[idx] {
            self.marks[idx] = true;
            self.grey.push(handle);
        }
    }

    /// Drain the grey worklist, blackening each object by greying every white
    /// object it references.
    pub fn trace(&mut self) {
        while let Some(handle) = self.grey.pop() {
            self.blacken(handle);
        }
    }

    fn blacken(&mut self, handle: Handle) {
        // Gather the out-edges first; marking mutates the registry state.
        let mut children: Vec<Handle> = Vec::new();
        let collect = |children: &mut Vec<Handle>, value: &Value| {
            if let Value::Obj(h) = value {
                children.push(*h);
            }
        };

        match self.get(handle) {
            Obj::Function(f) => {
                // Nested prototypes live in the constant pool of their
                // enclosing function; they must be kept alive through it.
                for value in &f.chunk.constants {
                    collect(&mut children, value);
                }
            }
            Obj::Closure(c) => {
                children.push(c.function);
                children.extend_from_slice(&c.upvalues);
            }
            Obj::Upvalue(Upvalue::Closed(value)) => collect(&mut children, value),
            // An open upvalue's value lives in a stack slot, which is a root.
            Obj::Upvalue(Upvalue::Open(_)) => {}
            Obj::Class(c) => {
                for (_, value) in c.methods.iter() {
                    collect(&mut children, value);
                }
            }
            Obj::Instance(i) => {
                children.push(i.class);
                for (_, value) in i.fields.iter() {
                    collect(&mut children, value);
                }
            }
            Obj::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(b.method);
            }
        }

        for child in children {
            self.mark_object(child);
        }
    }

    /// Reclaim every still-white object, reset survivors to white, and set
    /// the next collection threshold to twice the surviving live count. Also
    /// prunes intern entries no longer owned by anything outside the set.
    pub fn sweep(&mut self) {
        debug_assert!(self.grey.is_empty(), "sweep with pending grey objects");
        for idx in 0..self.slots.len() {
            if self.slots[idx].is_some() && !self.marks[idx] {
                self.slots[idx] = None;
                self.free.push(idx as u32);
                self.live -= 1;
            }
            self.marks[idx] = false;
        }
        self.allocated = 0;
        self.next_gc = (self.live * GC_GROW_FACTOR).max(GC_INITIAL_THRESHOLD);

        // Freeing slots above dropped the dead objects' string copies, so an
        // entry whose only remaining owner is the intern set itself is dead.
        // Without this the set grows for the life of the heap; transient
        // concatenation results would pile up forever.
        let stale: Vec<Rc<str>> = self
            .strings
            .iter()
            .filter(|&(key, _)| Rc::strong_count(key) == 1)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.strings.delete(&key);
        }
    }

    /// Number of entries in the string-interning set.
    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    /// Heap-aware value formatting.
    pub fn show(&self, value: &Value) -> String {
        match value {
            Value::Obj(handle) => match self.get(*handle) {
                Obj::Function(f) => self.show_function(f),
                Obj::Closure(c) => self.show_function(self.function(c.function)),
                Obj::Upvalue(_) => "upvalue".to_string(),
                Obj::Class(c) => c.name.to_string(),
                Obj::Instance(i) => format!("{} instance", self.class(i.class).name),
                Obj::BoundMethod(b) => {
                    let closure = self.closure(b.method);
                    self.show_function(self.function(closure.function))
                }
            },
            _ => value.to_string(),
        }
    }

    fn show_function(&self, function: &FunctionProto) -> String {
        if function.name.is_empty() {
            "<script>".to_string()
        } else {
            format!("<fn {}>", function.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_class(heap: &mut Heap, name: &str) -> Handle {
        let name = heap.intern(name);
        heap.alloc(Obj::Class(Class {
            name,
            methods: Table::new(),
        }))
    }

    fn new_instance(heap: &mut Heap, class: Handle) -> Handle {
        heap.alloc(Obj::Instance(Instance {
            class,
            fields: Table::new(),
        }))
    }

    fn collect(heap: &mut Heap, roots: &[Handle]) {
        for &root in roots {
            heap.mark_object(root);
        }
        heap.trace();
        heap.sweep();
    }

    #[test]
    fn test_unrooted_object_is_reclaimed_in_one_cycle() {
        let mut heap = Heap::new();
        let a = new_class(&mut heap, "A");
        let b = new_class(&mut heap, "B");
        assert_eq!(heap.live_objects(), 2);

        collect(&mut heap, &[a]);
        assert_eq!(heap.live_objects(), 1);
        assert!(matches!(heap.get(a), Obj::Class(_)));
        let _ = b; // b's slot is free again
    }

    #[test]
    fn test_reference_cycle_is_reclaimed() {
        let mut heap = Heap::new();
        let class = new_class(&mut heap, "Node");
        let a = new_instance(&mut heap, class);
        let b = new_instance(&mut heap, class);

        let other = heap.intern("other");
        heap.instance_mut(a).fields.set(other.clone(), Value::Obj(b));
        heap.instance_mut(b).fields.set(other, Value::Obj(a));
        assert_eq!(heap.live_objects(), 3);

        // The cycle keeps itself alive through fields, but nothing roots it.
        collect(&mut heap, &[class]);
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn test_closed_upvalue_keeps_its_value_alive() {
        let mut heap = Heap::new();
        let class = new_class(&mut heap, "Held");
        let instance = new_instance(&mut heap, class);
        let cell = heap.alloc(Obj::Upvalue(Upvalue::Closed(Value::Obj(instance))));

        collect(&mut heap, &[cell]);
        assert_eq!(heap.live_objects(), 3);
        assert!(matches!(heap.get(instance), Obj::Instance(_)));
    }

    #[test]
    fn test_closure_keeps_prototype_and_nested_constants_alive() {
        let mut heap = Heap::new();
        let inner_name = heap.intern("inner");
        let inner = heap.alloc(Obj::Function(FunctionProto::new(inner_name)));

        let outer_name = heap.intern("outer");
        let mut outer_proto = FunctionProto::new(outer_name);
        outer_proto.chunk.add_constant(Value::Obj(inner));
        let outer = heap.alloc(Obj::Function(outer_proto));

        let closure = heap.alloc(Obj::Closure(Closure {
            function: outer,
            upvalues: Vec::new(),
        }));

        collect(&mut heap, &[closure]);
        assert_eq!(heap.live_objects(), 3);
        assert!(matches!(heap.get(inner), Obj::Function(_)));
    }

    #[test]
    fn test_survivors_are_white_for_the_next_cycle() {
        let mut heap = Heap::new();
        let a = new_class(&mut heap, "A");
        collect(&mut heap, &[a]);
        // A second cycle with no roots must reclaim the previous survivor.
        collect(&mut heap, &[]);
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn test_threshold_adapts_to_live_count() {
        let mut heap = Heap::with_threshold(0);
        let class = new_class(&mut heap, "A");
        assert!(heap.should_collect());

        let mut instances = Vec::new();
        for _ in 0..100 {
            instances.push(new_instance(&mut heap, class));
        }
        let mut roots = vec![class];
        roots.extend(&instances);
        collect(&mut heap, &roots);

        // 101 survivors; the next trigger sits at roughly twice that.
        assert!(!heap.should_collect());
        assert_eq!(heap.live_objects(), 101);
        for _ in 0..202 {
            new_instance(&mut heap, class);
        }
        assert!(!heap.should_collect());
        new_instance(&mut heap, class);
        assert!(heap.should_collect());
    }

    #[test]
    fn test_slot_reuse_after_sweep() {
        let mut heap = Heap::new();
        let a = new_class(&mut heap, "A");
        let doomed = new_class(&mut heap, "B");
        collect(&mut heap, &[a]);

        let reused = new_class(&mut heap, "C");
        assert_eq!(reused.index(), doomed.index());
        assert_eq!(heap.class(reused).name.as_ref(), "C");
    }

    #[test]
    fn test_interning_deduplicates() {
        let mut heap = Heap::new();
        let a = heap.intern("shared");
        let b = heap.intern("shared");
        let c = heap.intern("different");
        assert!(Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_sweep_prunes_interned_strings_with_no_owner_left() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        heap.intern("scratch");
        assert_eq!(heap.interned_count(), 2);

        heap.sweep();
        assert_eq!(heap.interned_count(), 1);
        assert!(heap.strings.find_key("scratch").is_none());
        let survivor = heap.strings.find_key("kept").unwrap();
        assert!(Rc::ptr_eq(&kept, &survivor));
    }

    #[test]
    fn test_intern_entries_follow_their_owning_objects() {
        let mut heap = Heap::new();
        let class = new_class(&mut heap, "Owned");
        collect(&mut heap, &[class]);
        assert!(heap.strings.find_key("Owned").is_some());

        // Once the class dies its name has no owner left either.
        collect(&mut heap, &[]);
        assert!(heap.strings.find_key("Owned").is_none());
    }

    #[test]
    fn test_method_dictionary_copy_is_not_live() {
        let mut heap = Heap::new();
        let sup = new_class(&mut heap, "Base");
        let sub = new_class(&mut heap, "Derived");

        let m = heap.intern("m");
        heap.class_mut(sup).methods.set(m, Value::Nil);

        let copied = heap.class(sup).methods.clone();
        heap.class_mut(sub).methods.add_all(&copied);

        // Mutating the superclass dictionary afterwards must not show up in
        // the already-defined subclass.
        let late = heap.intern("late");
        heap.class_mut(sup).methods.set(late, Value::Nil);
        assert!(heap.class(sub).methods.get("m").is_some());
        assert!(heap.class(sub).methods.get("late").is_none());
    }
}
