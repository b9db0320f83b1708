// =============================================================================
// VM - Bytecode interpreter
// =============================================================================

use std::io::Write;
use std::rc::Rc;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::compiler::compile;
use crate::bytecode::op::Op;
use crate::lang::value::{NativeFn, NativeFunction, Value};
use crate::runtime::object::{
    BoundMethod, Class, Closure, Handle, Heap, Instance, Obj, Upvalue, GC_INITIAL_THRESHOLD,
};
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::table::Table;
use crate::CinderError;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

/// Interpreter tuning knobs. The defaults match normal operation; tests
/// shrink `gc_threshold` to force collection pressure.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub frames_max: usize,
    pub stack_max: usize,
    pub gc_threshold: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            frames_max: FRAMES_MAX,
            stack_max: STACK_MAX,
            gc_threshold: GC_INITIAL_THRESHOLD,
        }
    }
}

/// One function activation: the closure being run, the instruction pointer
/// into its chunk, and the stack slot where its window begins (slot zero of
/// the window holds the callee itself).
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: Handle,
    ip: usize,
    base: usize,
}

/// The bytecode interpreter.
///
/// All nested calls run inside one dispatch loop over an explicit frame
/// array; script recursion never recurses on the host stack, so runaway
/// recursion surfaces as a reported error when the frame array fills.
///
/// Globals and the heap persist across [`Vm::interpret`] calls; the operand
/// stack and frames reset each time.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table<Value>,
    open_upvalues: Vec<Handle>,
    pub heap: Heap,
    config: VmConfig,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut vm = Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            heap: Heap::with_threshold(config.gc_threshold),
            config,
        };
        vm.define_native("clock", 0, native_clock);
        vm
    }

    /// Register a host function under a global name.
    pub fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let name = self.heap.intern(name);
        self.globals.set(
            name.clone(),
            Value::Native(Rc::new(NativeFunction {
                name,
                arity,
                function,
            })),
        );
    }

    /// Compile and run a source string, writing `print` output to `out`.
    ///
    /// A compile error means nothing executed. A runtime error leaves the
    /// globals and heap intact, so the same instance stays usable.
    pub fn interpret(&mut self, source: &str, out: &mut dyn Write) -> Result<(), CinderError> {
        let script = compile(source, &mut self.heap).map_err(CinderError::Compile)?;

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        let closure = self.heap.alloc(Obj::Closure(Closure {
            function: script,
            upvalues: Vec::new(),
        }));
        self.stack.push(Value::Obj(closure));
        self.call_closure(closure, 0)
            .map_err(|message| CinderError::Runtime(RuntimeError::new(message, 0)))?;

        self.run(out).map_err(CinderError::Runtime)
    }

    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }

    // ----------------------------------------------------------------- decode

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn chunk(&self) -> &Chunk {
        let closure = self.heap.closure(self.frame().closure);
        &self.heap.function(closure.function).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frame().ip;
        let byte = self.chunk().code[ip];
        self.frame_mut().ip = ip + 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let ip = self.frame().ip;
        let value = self.chunk().read_u16(ip);
        self.frame_mut().ip = ip + 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        self.chunk().constants[idx].clone()
    }

    fn read_string(&mut self) -> Rc<str> {
        match self.read_constant() {
            Value::Str(s) => s,
            other => panic!("corrupt bytecode: expected string constant, found {:?}", other),
        }
    }

    // ------------------------------------------------------------------ stack

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow (vm bug)")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    // ----------------------------------------------------------------- errors

    /// Build a runtime error at the instruction that just executed, with a
    /// call trace, innermost frame first.
    fn error(&self, message: &str) -> RuntimeError {
        let line = self.chunk().line(self.frame().ip.saturating_sub(1));
        let mut err = RuntimeError::new(message, line);
        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            let line = function.chunk.line(frame.ip.saturating_sub(1));
            if function.name.is_empty() {
                err.trace.push(format!("[line {}] in script", line));
            } else {
                err.trace.push(format!("[line {}] in {}()", line, function.name));
            }
        }
        err
    }

    // --------------------------------------------------------------- dispatch

    fn run(&mut self, out: &mut dyn Write) -> Result<(), RuntimeError> {
        loop {
            let byte = self.read_byte();
            let op = match Op::from_byte(byte) {
                Some(op) => op,
                None => panic!("corrupt bytecode: unknown opcode {:#04x}", byte),
            };

            match op {
                Op::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                Op::Nil => self.push(Value::Nil),
                Op::True => self.push(Value::Bool(true)),
                Op::False => self.push(Value::Bool(false)),
                Op::Pop => {
                    self.pop();
                }

                Op::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().base + slot].clone();
                    self.push(value);
                }
                Op::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0).clone();
                }
                Op::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name) {
                        Some(value) => {
                            let value = value.clone();
                            self.push(value);
                        }
                        None => {
                            return Err(self.error(&format!("undefined variable '{}'", name)));
                        }
                    }
                }
                Op::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                Op::SetGlobal => {
                    let name = self.read_string();
                    // Assignment never creates a global; only `var` does.
                    if self.globals.get(&name).is_none() {
                        return Err(self.error(&format!("undefined variable '{}'", name)));
                    }
                    let value = self.peek(0).clone();
                    self.globals.set(name, value);
                }
                Op::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let cell = self.heap.closure(self.frame().closure).upvalues[idx];
                    let value = match self.heap.upvalue(cell) {
                        Upvalue::Open(slot) => self.stack[*slot].clone(),
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                Op::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let cell = self.heap.closure(self.frame().closure).upvalues[idx];
                    let value = self.peek(0).clone();
                    match self.heap.upvalue_mut(cell) {
                        Upvalue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        Upvalue::Closed(cell_value) => *cell_value = value,
                    }
                }

                Op::GetProperty => {
                    self.maybe_collect();
                    let name = self.read_string();
                    let Value::Obj(handle) = *self.peek(0) else {
                        return Err(self.error("only instances have properties"));
                    };
                    let Obj::Instance(instance) = self.heap.get(handle) else {
                        return Err(self.error("only instances have properties"));
                    };
                    if let Some(field) = instance.fields.get(&name) {
                        let field = field.clone();
                        self.pop();
                        self.push(field);
                    } else {
                        let class = instance.class;
                        self.bind_method(class, handle, &name)?;
                    }
                }
                Op::SetProperty => {
                    let name = self.read_string();
                    let Value::Obj(handle) = *self.peek(1) else {
                        return Err(self.error("only instances have fields"));
                    };
                    if !matches!(self.heap.get(handle), Obj::Instance(_)) {
                        return Err(self.error("only instances have fields"));
                    }
                    let value = self.pop();
                    self.pop();
                    self.heap
                        .instance_mut(handle)
                        .fields
                        .set(name, value.clone());
                    // assignment is an expression; the value remains
                    self.push(value);
                }
                Op::GetSuper => {
                    self.maybe_collect();
                    let name = self.read_string();
                    let superclass_value = self.pop();
                    let superclass = self.as_class(superclass_value);
                    let Value::Obj(receiver) = *self.peek(0) else {
                        panic!("corrupt bytecode: 'this' slot does not hold an instance");
                    };
                    // Field lookup is skipped on purpose: super resolves
                    // methods only, against the definition-time superclass.
                    let Some(method) = self.heap.class(superclass).methods.get(&name).cloned()
                    else {
                        return Err(self.error(&format!("undefined property '{}'", name)));
                    };
                    let method = self.as_closure(method);
                    let bound = self.heap.alloc(Obj::BoundMethod(BoundMethod {
                        receiver,
                        method,
                    }));
                    self.pop();
                    self.push(Value::Obj(bound));
                }

                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Op::Greater | Op::Less | Op::Subtract | Op::Multiply | Op::Divide => {
                    let (a, b) = match (self.peek(1), self.peek(0)) {
                        (Value::Number(a), Value::Number(b)) => (*a, *b),
                        _ => return Err(self.error("operands must be numbers")),
                    };
                    self.pop();
                    self.pop();
                    let result = match op {
                        Op::Greater => Value::Bool(a > b),
                        Op::Less => Value::Bool(a < b),
                        Op::Subtract => Value::Number(a - b),
                        Op::Multiply => Value::Number(a * b),
                        Op::Divide => Value::Number(a / b),
                        _ => unreachable!(),
                    };
                    self.push(result);
                }
                Op::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        let result = Value::Number(a + b);
                        self.pop();
                        self.pop();
                        self.push(result);
                    }
                    (Value::Str(a), Value::Str(b)) => {
                        let joined = format!("{}{}", a, b);
                        self.pop();
                        self.pop();
                        let interned = self.heap.intern(&joined);
                        self.push(Value::Str(interned));
                    }
                    _ => {
                        return Err(self.error("operands must be two numbers or two strings"));
                    }
                },
                Op::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Op::Negate => {
                    let Value::Number(n) = *self.peek(0) else {
                        return Err(self.error("operand must be a number"));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }

                Op::Print => {
                    let value = self.pop();
                    let _ = writeln!(out, "{}", self.heap.show(&value));
                }

                Op::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                Op::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                Op::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                Op::Call => {
                    self.maybe_collect();
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count).clone();
                    self.call_value(callee, arg_count)
                        .map_err(|m| self.error(&m))?;
                }
                Op::Invoke => {
                    self.maybe_collect();
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(&name, arg_count)?;
                }
                Op::SuperInvoke => {
                    self.maybe_collect();
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass_value = self.pop();
                    let superclass = self.as_class(superclass_value);
                    self.invoke_from_class(superclass, &name, arg_count)
                        .map_err(|m| self.error(&m))?;
                }

                Op::Closure => {
                    self.maybe_collect();
                    let Value::Obj(function) = self.read_constant() else {
                        panic!("corrupt bytecode: closure operand is not a function");
                    };
                    let count = self.heap.function(function).upvalue_count;
                    let mut upvalues = Vec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let slot = self.frame().base + index;
                            upvalues.push(self.capture_upvalue(slot));
                        } else {
                            upvalues
                                .push(self.heap.closure(self.frame().closure).upvalues[index]);
                        }
                    }
                    let closure = self.heap.alloc(Obj::Closure(Closure { function, upvalues }));
                    self.push(Value::Obj(closure));
                }
                Op::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                Op::Return => {
                    let result = self.pop();
                    let base = self.frame().base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.stack.clear();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }

                Op::Class => {
                    self.maybe_collect();
                    let name = self.read_string();
                    let class = self.heap.alloc(Obj::Class(Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                Op::Inherit => {
                    let Value::Obj(superclass) = *self.peek(1) else {
                        return Err(self.error("superclass must be a class"));
                    };
                    if !matches!(self.heap.get(superclass), Obj::Class(_)) {
                        return Err(self.error("superclass must be a class"));
                    }
                    let Value::Obj(subclass) = *self.peek(0) else {
                        panic!("corrupt bytecode: inherit target is not a class");
                    };
                    // One-time copy at definition time: later changes to the
                    // superclass dictionary never reach the subclass.
                    let methods = self.heap.class(superclass).methods.clone();
                    self.heap.class_mut(subclass).methods.add_all(&methods);
                    self.pop();
                }
                Op::Method => {
                    let name = self.read_string();
                    let method = self.peek(0).clone();
                    let Value::Obj(class) = *self.peek(1) else {
                        panic!("corrupt bytecode: method target is not a class");
                    };
                    self.heap.class_mut(class).methods.set(name, method);
                    self.pop();
                }
            }
        }
    }

    // ------------------------------------------------------------------ calls

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), String> {
        match callee {
            Value::Obj(handle) => match self.heap.get(handle) {
                Obj::Closure(_) => self.call_closure(handle, arg_count),
                Obj::Class(class) => {
                    let init = class.methods.get("init").cloned();
                    let instance = self.heap.alloc(Obj::Instance(Instance {
                        class: handle,
                        fields: Table::new(),
                    }));
                    let slot = self.stack.len() - 1 - arg_count;
                    self.stack[slot] = Value::Obj(instance);
                    match init {
                        Some(init) => {
                            let init = self.as_closure(init);
                            self.call_closure(init, arg_count)
                        }
                        None if arg_count != 0 => {
                            Err(format!("expected 0 arguments but got {}", arg_count))
                        }
                        None => Ok(()),
                    }
                }
                Obj::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let method = bound.method;
                    let slot = self.stack.len() - 1 - arg_count;
                    self.stack[slot] = Value::Obj(receiver);
                    self.call_closure(method, arg_count)
                }
                _ => Err("can only call functions and classes".to_string()),
            },
            Value::Native(native) => {
                if arg_count != native.arity as usize {
                    return Err(format!(
                        "expected {} arguments but got {}",
                        native.arity, arg_count
                    ));
                }
                let first = self.stack.len() - arg_count;
                let args: Vec<Value> = self.stack[first..].to_vec();
                let result = (native.function)(&args)?;
                self.stack.truncate(first - 1);
                self.push(result);
                Ok(())
            }
            _ => Err("can only call functions and classes".to_string()),
        }
    }

    fn call_closure(&mut self, closure: Handle, arg_count: usize) -> Result<(), String> {
        let arity = {
            let closure = self.heap.closure(closure);
            self.heap.function(closure.function).arity as usize
        };
        if arg_count != arity {
            return Err(format!(
                "expected {} arguments but got {}",
                arity, arg_count
            ));
        }
        if self.frames.len() >= self.config.frames_max {
            return Err("stack overflow".to_string());
        }
        if self.stack.len() > self.config.stack_max {
            return Err("stack overflow".to_string());
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn invoke(&mut self, name: &str, arg_count: usize) -> Result<(), RuntimeError> {
        let Value::Obj(receiver) = *self.peek(arg_count) else {
            return Err(self.error("only instances have methods"));
        };
        let Obj::Instance(instance) = self.heap.get(receiver) else {
            return Err(self.error("only instances have methods"));
        };
        // A field holding a callable shadows a method of the same name.
        if let Some(field) = instance.fields.get(name) {
            let field = field.clone();
            let slot = self.stack.len() - 1 - arg_count;
            self.stack[slot] = field.clone();
            return self.call_value(field, arg_count).map_err(|m| self.error(&m));
        }
        let class = instance.class;
        self.invoke_from_class(class, name, arg_count)
            .map_err(|m| self.error(&m))
    }

    fn invoke_from_class(
        &mut self,
        class: Handle,
        name: &str,
        arg_count: usize,
    ) -> Result<(), String> {
        let Some(method) = self.heap.class(class).methods.get(name).cloned() else {
            return Err(format!("undefined property '{}'", name));
        };
        let method = self.as_closure(method);
        self.call_closure(method, arg_count)
    }

    fn bind_method(
        &mut self,
        class: Handle,
        receiver: Handle,
        name: &str,
    ) -> Result<(), RuntimeError> {
        let Some(method) = self.heap.class(class).methods.get(name).cloned() else {
            return Err(self.error(&format!("undefined property '{}'", name)));
        };
        let method = self.as_closure(method);
        let bound = self
            .heap
            .alloc(Obj::BoundMethod(BoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn as_closure(&self, value: Value) -> Handle {
        match value {
            Value::Obj(handle) if matches!(self.heap.get(handle), Obj::Closure(_)) => handle,
            other => panic!("corrupt bytecode: expected closure, found {:?}", other),
        }
    }

    fn as_class(&self, value: Value) -> Handle {
        match value {
            Value::Obj(handle) if matches!(self.heap.get(handle), Obj::Class(_)) => handle,
            other => panic!("corrupt bytecode: expected class, found {:?}", other),
        }
    }

    // --------------------------------------------------------------- upvalues

    /// Find or create the open upvalue cell for a stack slot. The open list
    /// is kept sorted by slot, highest first, so closing scans a prefix.
    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        let mut insert_at = self.open_upvalues.len();
        for (i, &handle) in self.open_upvalues.iter().enumerate() {
            match self.heap.upvalue(handle) {
                Upvalue::Open(s) if *s == slot => return handle,
                Upvalue::Open(s) if *s < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let handle = self.heap.alloc(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, handle);
        handle
    }

    /// Close every open upvalue at or above `from_slot`: copy the stack value
    /// into the cell and drop it from the open list.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&handle) = self.open_upvalues.first() {
            let slot = match self.heap.upvalue(handle) {
                Upvalue::Open(slot) => *slot,
                Upvalue::Closed(_) => panic!("closed upvalue on the open list"),
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot].clone();
            *self.heap.upvalue_mut(handle) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // --------------------------------------------------------------------- gc

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Mark from every root the VM holds, then trace and sweep. Roots are
    /// the operand stack, global values, the closure of every live frame,
    /// and the open upvalue cells.
    pub fn collect_garbage(&mut self) {
        for value in &self.stack {
            self.heap.mark_value(value);
        }
        for (_, value) in self.globals.iter() {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.heap.mark_object(upvalue);
        }
        self.heap.trace();
        self.heap.sweep();
    }
}

fn native_clock(_args: &[Value]) -> Result<Value, String> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(Value::Number(now.as_secs_f64()))
}
