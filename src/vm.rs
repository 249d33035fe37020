use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunk::Chunk;
use crate::compiler;
use crate::error::InterpretError;
use crate::gc::Heap;
use crate::opcode::OpCode;
use crate::table::Table;
use crate::value::{
    values_equal, hash_str, ClosureObj, NativeFn, NativeObj, Obj, ObjRef, StrObj, UpvalState,
    UpvalueObj, Value,
};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

// slot 0 of a frame aliases the called closure itself
#[derive(Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    base: usize,
}

// the trace has already gone to stderr when one of these is returned
struct RuntimeFault;

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    heap: Heap,
    open_upvalues: Option<ObjRef>,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Builds a VM whose `print` output goes to the given writer; tests hand
    /// in a buffer, the CLI hands in stdout.
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            heap: Heap::new(),
            open_upvalues: None,
            out,
        };
        vm.define_native("clock", clock_native);
        vm
    }

    /// Forces a collection before every allocation. Pathologically slow,
    /// invaluable for flushing out missing roots.
    pub fn set_stress_gc(&mut self, on: bool) {
        self.heap.stress = on;
    }

    pub(crate) fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let Some(fun) = compiler::compile(source, self) else {
            return Err(InterpretError::Compile);
        };

        self.push(Value::Obj(fun));
        let closure = self.alloc(Obj::Closure(ClosureObj { fun, upvalues: vec![] }), &[]);
        self.pop();
        self.push(Value::Obj(closure));
        if self.call(closure, 0).is_err() {
            return Err(InterpretError::Runtime);
        }
        self.run().map_err(|_| InterpretError::Runtime)
    }

    pub fn repl(&mut self) {
        let mut line = String::new();
        loop {
            line.clear();
            print!("nox> ");
            let _ = io::stdout().flush();
            match io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let t = line.trim();
            if t.is_empty() { continue; }
            if t == ":q" || t == ":quit" { break; }
            let _ = self.interpret(t);
        }
    }

    // ---- allocation & GC ----

    /// Every managed allocation funnels through here so the collector can
    /// run at the decision point, before the new object is installed.
    /// `extra_roots` protects values only the caller can see (the
    /// compiler's in-progress chain, a half-built object's parts).
    pub(crate) fn alloc(&mut self, body: Obj, extra_roots: &[Value]) -> ObjRef {
        if self.heap.should_collect(body.heap_size()) {
            self.collect_garbage(extra_roots);
        }
        self.heap.alloc(body)
    }

    pub(crate) fn copy_string(&mut self, chars: &str, extra_roots: &[Value]) -> ObjRef {
        let hash = hash_str(chars);
        if let Some(r) = self.heap.find_string(chars, hash) {
            return r;
        }
        let r = self.alloc(Obj::Str(StrObj { chars: chars.to_string(), hash }), extra_roots);
        self.heap.intern(r);
        r
    }

    pub(crate) fn take_string(&mut self, chars: String, extra_roots: &[Value]) -> ObjRef {
        let hash = hash_str(&chars);
        if let Some(r) = self.heap.find_string(&chars, hash) {
            return r;
        }
        let r = self.alloc(Obj::Str(StrObj { chars, hash }), extra_roots);
        self.heap.intern(r);
        r
    }

    fn collect_garbage(&mut self, extra_roots: &[Value]) {
        let before = self.heap.bytes_allocated();
        tracing::debug!(target: "gc", "-- gc begin");

        let Vm { heap, stack, frames, globals, open_upvalues, .. } = self;
        for &v in stack.iter() {
            heap.mark_value(v);
        }
        for frame in frames.iter() {
            heap.mark_object(frame.closure);
        }
        let mut upvalue = *open_upvalues;
        while let Some(r) = upvalue {
            heap.mark_object(r);
            upvalue = heap.upvalue(r).next;
        }
        for (key, value) in globals.iter() {
            heap.mark_object(key);
            heap.mark_value(value);
        }
        for &v in extra_roots {
            heap.mark_value(v);
        }

        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();
        heap.end_collection();

        tracing::debug!(
            target: "gc",
            "-- gc end: collected {} bytes (from {} to {})",
            before - self.heap.bytes_allocated(),
            before,
            self.heap.bytes_allocated(),
        );
    }

    // ---- stack ----

    #[inline]
    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    #[inline]
    fn peek(&self, dist: usize) -> Value {
        self.stack[self.stack.len() - 1 - dist]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // ---- frame decoding ----

    fn frame_chunk(&self, fi: usize) -> &Chunk {
        let closure = self.heap.closure(self.frames[fi].closure);
        &self.heap.fun(closure.fun).chunk
    }

    fn read_byte(&mut self, fi: usize) -> u8 {
        let ip = self.frames[fi].ip;
        let b = self.frame_chunk(fi).code[ip];
        self.frames[fi].ip = ip + 1;
        b
    }

    fn read_u16(&mut self, fi: usize) -> u16 {
        let hi = self.read_byte(fi) as u16;
        let lo = self.read_byte(fi) as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self, fi: usize) -> Value {
        let idx = self.read_byte(fi) as usize;
        self.frame_chunk(fi).constants[idx]
    }

    fn read_string_constant(&mut self, fi: usize) -> ObjRef {
        match self.read_constant(fi) {
            Value::Obj(r) => r,
            _ => unreachable!("name constants are strings"),
        }
    }

    // ---- faults ----

    fn runtime_error(&mut self, msg: &str) -> RuntimeFault {
        eprintln!("{msg}");
        for frame in self.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let fun = self.heap.fun(closure.fun);
            let line = fun.chunk.lines[frame.ip.saturating_sub(1)];
            match fun.name {
                Some(name) => eprintln!("[line {}] in {}()", line, self.heap.string(name).chars),
                None => eprintln!("[line {}] in script", line),
            }
        }
        self.reset_stack();
        RuntimeFault
    }

    // ---- calls ----

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeFault> {
        if let Value::Obj(r) = callee {
            match self.heap.get(r) {
                Obj::Closure(_) => return self.call(r, argc),
                Obj::Native(native) => {
                    let fun = native.fun;
                    let args_start = self.stack.len() - argc;
                    let result = fun(&self.stack[args_start..]);
                    self.stack.truncate(args_start - 1);
                    self.push(result);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    fn call(&mut self, closure: ObjRef, argc: usize) -> Result<(), RuntimeFault> {
        let arity = self.heap.fun(self.heap.closure(closure).fun).arity;
        if argc != arity {
            let msg = format!("Expected {arity} arguments but got {argc}.");
            return Err(self.runtime_error(&msg));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    // ---- upvalues ----

    fn open_slot(&self, upvalue: ObjRef) -> usize {
        match self.heap.upvalue(upvalue).state {
            UpvalState::Open(slot) => slot,
            UpvalState::Closed(_) => unreachable!("closed upvalue on the open list"),
        }
    }

    // the open list is kept sorted by descending stack slot so closing a
    // region only ever inspects its head
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut cur = self.open_upvalues;
        while let Some(r) = cur {
            if self.open_slot(r) <= slot {
                break;
            }
            prev = Some(r);
            cur = self.heap.upvalue(r).next;
        }
        if let Some(r) = cur {
            if self.open_slot(r) == slot {
                return r;
            }
        }

        let created = self.alloc(
            Obj::Upvalue(UpvalueObj { state: UpvalState::Open(slot), next: cur }),
            &[],
        );
        match prev {
            Some(p) => self.heap.upvalue_mut(p).next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    fn close_upvalues(&mut self, from: usize) {
        while let Some(r) = self.open_upvalues {
            if self.open_slot(r) < from {
                break;
            }
            let value = self.stack[self.open_slot(r)];
            let upvalue = self.heap.upvalue_mut(r);
            self.open_upvalues = upvalue.next;
            upvalue.state = UpvalState::Closed(value);
        }
    }

    // ---- natives ----

    fn define_native(&mut self, name: &str, fun: NativeFn) {
        let name = self.copy_string(name, &[]);
        let native = self.alloc(Obj::Native(NativeObj { fun }), &[Value::Obj(name)]);
        self.globals.set(self.heap.objects(), name, Value::Obj(native));
    }

    // ---- dispatch ----

    fn binary_num(&mut self, op: fn(f64, f64) -> Value) -> Result<(), RuntimeFault> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn run(&mut self) -> Result<(), RuntimeFault> {
        loop {
            let fi = self.frames.len() - 1;

            if tracing::enabled!(target: "vm", tracing::Level::TRACE) {
                let mut repr = String::new();
                for &v in &self.stack {
                    repr.push_str(&format!("[ {} ]", self.heap.format_value(v)));
                }
                let ip = self.frames[fi].ip;
                let mut text = String::new();
                crate::dis::disassemble_instruction(&self.heap, self.frame_chunk(fi), ip, &mut text);
                tracing::trace!(target: "vm", "{:16} {}", repr, text.trim_end());
            }

            let op = OpCode::from_u8(self.read_byte(fi));
            match op {
                OpCode::Constant => {
                    let v = self.read_constant(fi);
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte(fi) as usize;
                    let v = self.stack[self.frames[fi].base + slot];
                    self.push(v);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte(fi) as usize;
                    let base = self.frames[fi].base;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetGlobal => {
                    let name = self.read_string_constant(fi);
                    match self.globals.get(self.heap.objects(), name) {
                        Some(v) => self.push(v),
                        None => {
                            let msg =
                                format!("Undefined variable '{}'.", self.heap.string(name).chars);
                            return Err(self.runtime_error(&msg));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant(fi);
                    let v = self.peek(0);
                    self.globals.set(self.heap.objects(), name, v);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant(fi);
                    let v = self.peek(0);
                    // assignment never creates; undo the insert it just did
                    if self.globals.set(self.heap.objects(), name, v) {
                        self.globals.delete(self.heap.objects(), name);
                        let msg =
                            format!("Undefined variable '{}'.", self.heap.string(name).chars);
                        return Err(self.runtime_error(&msg));
                    }
                }

                OpCode::GetUpvalue => {
                    let idx = self.read_byte(fi) as usize;
                    let upvalue = self.heap.closure(self.frames[fi].closure).upvalues[idx];
                    let v = match self.heap.upvalue(upvalue).state {
                        UpvalState::Open(slot) => self.stack[slot],
                        UpvalState::Closed(v) => v,
                    };
                    self.push(v);
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_byte(fi) as usize;
                    let upvalue = self.heap.closure(self.frames[fi].closure).upvalues[idx];
                    let v = self.peek(0);
                    match self.heap.upvalue(upvalue).state {
                        UpvalState::Open(slot) => self.stack[slot] = v,
                        UpvalState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalState::Closed(v);
                        }
                    }
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(values_equal(a, b)));
                }
                OpCode::Greater => self.binary_num(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_num(|a, b| Value::Bool(a < b))?,

                OpCode::Add => {
                    match (self.peek(1), self.peek(0)) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a + b));
                        }
                        (Value::Obj(a), Value::Obj(b))
                            if self.heap.is_string(a) && self.heap.is_string(b) =>
                        {
                            // both operands stay on the stack until the result
                            // is interned, so a collection here cannot eat them
                            let mut chars = self.heap.string(a).chars.clone();
                            chars.push_str(&self.heap.string(b).chars);
                            let result = self.take_string(chars, &[]);
                            self.pop();
                            self.pop();
                            self.push(Value::Obj(result));
                        }
                        _ => {
                            return Err(self
                                .runtime_error("Operands must be two numbers or two strings."));
                        }
                    }
                }
                OpCode::Sub => self.binary_num(|a, b| Value::Number(a - b))?,
                OpCode::Mul => self.binary_num(|a, b| Value::Number(a * b))?,
                OpCode::Div => self.binary_num(|a, b| Value::Number(a / b))?,

                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }

                OpCode::Print => {
                    let v = self.pop();
                    let text = self.heap.format_value(v);
                    let _ = writeln!(self.out, "{text}");
                }

                OpCode::Jump => {
                    let offset = self.read_u16(fi) as usize;
                    self.frames[fi].ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16(fi) as usize;
                    if self.peek(0).is_falsey() {
                        self.frames[fi].ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16(fi) as usize;
                    self.frames[fi].ip -= offset;
                }

                OpCode::Call => {
                    let argc = self.read_byte(fi) as usize;
                    self.call_value(self.peek(argc), argc)?;
                }
                OpCode::Closure => {
                    let fun = match self.read_constant(fi) {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure constant is a function"),
                    };
                    let count = self.heap.fun(fun).upvalue_count;
                    // the closure goes on the stack first so the upvalues
                    // allocated below stay reachable through it
                    let closure = self.alloc(
                        Obj::Closure(ClosureObj { fun, upvalues: Vec::with_capacity(count) }),
                        &[],
                    );
                    self.push(Value::Obj(closure));
                    for _ in 0..count {
                        let is_local = self.read_byte(fi) != 0;
                        let index = self.read_byte(fi) as usize;
                        let upvalue = if is_local {
                            let base = self.frames[fi].base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.heap.closure(self.frames[fi].closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("frame stack underflow");
                    self.close_upvalues(frame.base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result);
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn clock_native(_args: &[Value]) -> Value {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => Value::Number(elapsed.as_secs_f64()),
        Err(_) => Value::Number(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vm() -> Vm {
        Vm::with_output(Box::new(io::sink()))
    }

    #[test]
    fn unreferenced_strings_die_in_collection() {
        let mut vm = test_vm();
        let r = vm.copy_string("orphan", &[]);
        assert!(vm.heap.contains(r));
        vm.collect_garbage(&[]);
        assert!(!vm.heap.contains(r));
    }

    #[test]
    fn stack_values_survive_collection() {
        let mut vm = test_vm();
        let r = vm.copy_string("kept", &[]);
        vm.push(Value::Obj(r));
        vm.collect_garbage(&[]);
        assert!(vm.heap.contains(r));
        // and the intern entry is still valid
        assert_eq!(vm.copy_string("kept", &[]), r);
    }

    #[test]
    fn extra_roots_protect_compiler_values() {
        let mut vm = test_vm();
        let r = vm.copy_string("pinned", &[]);
        vm.collect_garbage(&[Value::Obj(r)]);
        assert!(vm.heap.contains(r));
    }

    #[test]
    fn globals_root_their_keys_and_values() {
        let mut vm = test_vm();
        let key = vm.copy_string("g", &[]);
        let value = vm.copy_string("v", &[Value::Obj(key)]);
        vm.globals.set(vm.heap.objects(), key, Value::Obj(value));
        vm.collect_garbage(&[]);
        assert!(vm.heap.contains(key));
        assert!(vm.heap.contains(value));
    }

    #[test]
    fn collection_accounting_shrinks_bytes() {
        let mut vm = test_vm();
        let before = vm.heap.bytes_allocated();
        for i in 0..100 {
            vm.copy_string(&format!("garbage-{i}"), &[]);
        }
        assert!(vm.heap.bytes_allocated() > before);
        vm.collect_garbage(&[]);
        assert_eq!(vm.heap.bytes_allocated(), before);
    }

    #[test]
    fn interning_returns_the_same_object() {
        let mut vm = test_vm();
        let a = vm.copy_string("twin", &[]);
        let b = vm.copy_string("twin", &[]);
        let c = vm.take_string("twin".to_string(), &[]);
        assert_eq!(a, b);
        assert_eq!(a, c);
    }
}
