//! vm.rs — machine à pile qui exécute le bytecode produit par le compilateur.
//!
//! La boucle `run` lit une [`Op`] à la fois depuis le chunk de la frame
//! active, l'exécute, puis avance. Toute opération susceptible d'échouer à
//! l'exécution (type incorrect, variable non définie, pile vide…) renvoie
//! un message d'erreur brut ; [`Vm::interpret`] l'habille avec la pile
//! d'appels courante pour produire un [`RuntimeError`].
//!
//! La collecte GC n'est déclenchée qu'en tête de boucle, entre deux
//! instructions : à cet instant précis, toute valeur vivante est soit sur
//! la pile, soit dans les globales, soit accrochée à une frame ou une
//! upvalue ouverte — jamais "en transit" dans une variable locale Rust le
//! temps d'un seul handler d'opcode. Ça suffit à garantir la sûreté du
//! marquage sans faire du compilateur ou de la VM elle-même une racine
//! explicite pendant l'exécution d'un handler.

use ahash::AHashMap;

use lox_core::heap::{render, GcRoots};
use lox_core::object::{BoundMethod, Class, Closure, Instance, NativeFn, Upvalue};
use lox_core::ops::UpvalueCapture;
use lox_core::{Heap, Obj, ObjHandle, Op, Value};

use crate::error::{RuntimeError, TraceFrame};
use crate::natives;

/// Options de construction / exécution de la VM.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Taille maximale de la pile d'évaluation.
    pub stack_limit: usize,
    /// Profondeur maximale de la pile d'appels (§4.2 : 64 par défaut).
    pub frame_limit: usize,
    /// Journalise chaque instruction exécutée (`--trace`).
    pub trace: bool,
    /// Force une collecte à chaque allocation (`--gc-stress`).
    pub gc_stress: bool,
    /// Journalise chaque collecte (`--gc-log`).
    pub gc_log: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self { stack_limit: 1 << 16, frame_limit: 64, trace: false, gc_stress: false, gc_log: false }
    }
}

impl VmOptions {
    pub fn with_trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }

    pub fn with_gc_stress(mut self, on: bool) -> Self {
        self.gc_stress = on;
        self
    }

    pub fn with_gc_log(mut self, on: bool) -> Self {
        self.gc_log = on;
        self
    }

    pub fn with_frame_limit(mut self, limit: usize) -> Self {
        self.frame_limit = limit;
        self
    }

    pub fn with_stack_limit(mut self, limit: usize) -> Self {
        self.stack_limit = limit;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: ObjHandle,
    ip: usize,
    base: usize,
}

/// Machine virtuelle Lox : pile, frames, globales, upvalues ouvertes et tas.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: AHashMap<ObjHandle, Value>,
    /// Triées par slot de pile décroissant, comme la liste chaînée de
    /// l'implémentation de référence.
    open_upvalues: Vec<ObjHandle>,
    init_string: ObjHandle,
    options: VmOptions,
}

struct Roots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    globals: &'a AHashMap<ObjHandle, Value>,
    open_upvalues: &'a [ObjHandle],
    init_string: ObjHandle,
}

impl GcRoots for Roots<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        for value in self.stack {
            heap.mark_value(value);
        }
        for (&name, value) in self.globals {
            heap.mark_object(name);
            heap.mark_value(value);
        }
        for frame in self.frames {
            heap.mark_object(frame.closure);
        }
        for &handle in self.open_upvalues {
            heap.mark_object(handle);
        }
        heap.mark_object(self.init_string);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut heap = Heap::new();
        heap.stress_gc = options.gc_stress;
        heap.log_gc = options.gc_log;
        let init_string = heap.intern("init");

        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(options.frame_limit),
            globals: AHashMap::new(),
            open_upvalues: Vec::new(),
            init_string,
            options,
        };
        vm.define_native("clock", natives::clock);
        vm
    }

    /// Tas courant, pour que l'appelant (typiquement une CLI qui recompile
    /// une ligne de REPL à la fois) interne ses chaînes dans le même tas.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn define_native(&mut self, name: &'static str, function: NativeFn) {
        let name_handle = self.heap.intern(name);
        let native_handle = self.heap.alloc(Obj::Native(lox_core::object::NativeFunction { name, function }));
        self.globals.insert(name_handle, Value::Obj(native_handle));
    }

    /// Exécute une fonction fraîchement compilée (le script de plus haut
    /// niveau, ou n'importe quelle fonction top-level pour un usage REPL).
    pub fn interpret(&mut self, function: ObjHandle) -> Result<(), RuntimeError> {
        let closure_handle = self.heap.alloc(Obj::Closure(Closure { function, upvalues: Vec::new() }));
        self.stack.push(Value::Obj(closure_handle));
        if let Err(message) = self.call(closure_handle, 0) {
            return Err(self.runtime_error(message));
        }
        self.run().map_err(|message| self.runtime_error(message))
    }

    fn runtime_error(&self, message: String) -> RuntimeError {
        RuntimeError::new(message, self.build_trace())
    }

    fn build_trace(&self) -> Vec<TraceFrame> {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function_handle = self.function_handle(frame.closure);
            let Some(Obj::Function(function)) = self.heap.get(function_handle) else { continue };
            let line = function.chunk.line(frame.ip.saturating_sub(1));
            let name = match function.name {
                Some(handle) => self.string_value(handle),
                None => "script".to_string(),
            };
            trace.push(TraceFrame { line, function_name: name });
        }
        trace
    }

    fn function_handle(&self, closure_handle: ObjHandle) -> ObjHandle {
        match self.heap.get(closure_handle) {
            Some(Obj::Closure(closure)) => closure.function,
            _ => unreachable!("a call frame's closure handle must reference a closure"),
        }
    }

    fn string_value(&self, handle: ObjHandle) -> String {
        match self.heap.get(handle) {
            Some(Obj::Str(s)) => s.bytes.clone(),
            _ => String::new(),
        }
    }

    fn is_string(&self, handle: ObjHandle) -> bool {
        matches!(self.heap.get(handle), Some(Obj::Str(_)))
    }

    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let roots = Roots {
            stack: &self.stack,
            frames: &self.frames,
            globals: &self.globals,
            open_upvalues: &self.open_upvalues,
            init_string: self.init_string,
        };
        self.heap.collect_garbage(&roots);
    }

    // ----- pile -----

    fn push(&mut self, value: Value) -> Result<(), String> {
        if self.stack.len() >= self.options.stack_limit {
            return Err("Stack overflow.".to_string());
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, String> {
        self.stack.pop().ok_or_else(|| "Stack underflow.".to_string())
    }

    fn peek(&self, depth: usize) -> Result<Value, String> {
        self.stack
            .len()
            .checked_sub(1 + depth)
            .and_then(|i| self.stack.get(i))
            .copied()
            .ok_or_else(|| "Stack underflow.".to_string())
    }

    fn current_frame(&self) -> CallFrame {
        *self.frames.last().expect("vm always has an active frame while running")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("vm always has an active frame while running")
    }

    fn read_op(&mut self) -> Result<Op, String> {
        let frame = self.current_frame();
        let function_handle = self.function_handle(frame.closure);
        let op = match self.heap.get(function_handle) {
            Some(Obj::Function(f)) => f.chunk.op(frame.ip).cloned(),
            _ => None,
        };
        self.current_frame_mut().ip += 1;
        op.ok_or_else(|| "instruction pointer ran off the end of the chunk".to_string())
    }

    fn read_constant(&self, index: u8) -> Value {
        let frame = self.current_frame();
        let function_handle = self.function_handle(frame.closure);
        match self.heap.get(function_handle) {
            Some(Obj::Function(f)) => f.chunk.constant(index).ok().copied().unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    fn trace_instruction(&self) {
        let mut line = String::from("          ");
        for value in &self.stack {
            line.push_str(&format!("[ {} ]", render(value, &self.heap)));
        }
        let frame = self.current_frame();
        let function_handle = self.function_handle(frame.closure);
        if let Some(Obj::Function(f)) = self.heap.get(function_handle) {
            if frame.ip < f.chunk.len() {
                let instruction = lox_core::disassemble_instruction(&f.chunk, &self.heap, frame.ip);
                tracing::trace!(instruction = %instruction, stack = %line, "dispatch");
            }
        }
    }

    // ----- boucle principale -----

    fn run(&mut self) -> Result<(), String> {
        loop {
            self.collect_if_needed();
            if self.options.trace {
                self.trace_instruction();
            }

            let op = self.read_op()?;
            match op {
                Op::Constant(index) => {
                    let value = self.read_constant(index);
                    self.push(value)?;
                }
                Op::Nil => self.push(Value::Nil)?,
                Op::True => self.push(Value::Bool(true))?,
                Op::False => self.push(Value::Bool(false))?,
                Op::Pop => {
                    self.pop()?;
                }
                Op::GetLocal(slot) => {
                    let base = self.current_frame().base;
                    let value = self.stack[base + slot as usize];
                    self.push(value)?;
                }
                Op::SetLocal(slot) => {
                    let base = self.current_frame().base;
                    let value = self.peek(0)?;
                    self.stack[base + slot as usize] = value;
                }
                Op::GetGlobal(index) => self.get_global(index)?,
                Op::DefineGlobal(index) => self.define_global(index)?,
                Op::SetGlobal(index) => self.set_global(index)?,
                Op::GetUpvalue(slot) => {
                    let closure_handle = self.current_frame().closure;
                    let upvalue_handle = self.upvalue_handle(closure_handle, slot);
                    let value = self.read_upvalue(upvalue_handle);
                    self.push(value)?;
                }
                Op::SetUpvalue(slot) => {
                    let closure_handle = self.current_frame().closure;
                    let upvalue_handle = self.upvalue_handle(closure_handle, slot);
                    let value = self.peek(0)?;
                    self.write_upvalue(upvalue_handle, value);
                }
                Op::GetProperty(index) => self.get_property(index)?,
                Op::SetProperty(index) => self.set_property(index)?,
                Op::GetSuper(index) => self.get_super(index)?,
                Op::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(a == b))?;
                }
                Op::Greater => self.binary_number_cmp(|a, b| a > b)?,
                Op::Less => self.binary_number_cmp(|a, b| a < b)?,
                Op::Add => self.add()?,
                Op::Subtract => self.binary_number_op(|a, b| a - b)?,
                Op::Multiply => self.binary_number_op(|a, b| a * b)?,
                Op::Divide => self.binary_number_op(|a, b| a / b)?,
                Op::Negate => {
                    let value = self.peek(0)?;
                    let Value::Number(n) = value else {
                        return Err("Operand must be a number.".to_string());
                    };
                    self.pop()?;
                    self.push(Value::Number(-n))?;
                }
                Op::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(!value.is_truthy()))?;
                }
                Op::Print => {
                    let value = self.pop()?;
                    println!("{}", render(&value, &self.heap));
                }
                Op::Jump(target) => {
                    self.current_frame_mut().ip = target as usize;
                }
                Op::JumpIfFalse(target) => {
                    if !self.peek(0)?.is_truthy() {
                        self.current_frame_mut().ip = target as usize;
                    }
                }
                Op::Loop(target) => {
                    self.current_frame_mut().ip = target as usize;
                }
                Op::Call(arg_count) => self.call_value(arg_count)?,
                Op::Invoke(name_index, arg_count) => self.invoke(name_index, arg_count)?,
                Op::SuperInvoke(name_index, arg_count) => self.super_invoke(name_index, arg_count)?,
                Op::Closure(fn_index, captures) => self.make_closure(fn_index, captures)?,
                Op::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop()?;
                }
                Op::Return => {
                    let result = self.pop()?;
                    let frame = self.frames.pop().expect("run loop always has an active frame");
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result)?;
                }
                Op::Class(name_index) => {
                    let name_value = self.read_constant(name_index);
                    let Value::Obj(name_handle) = name_value else {
                        unreachable!("compiler always stores class names as string constants")
                    };
                    let class_handle = self.heap.alloc(Obj::Class(Class::new(name_handle)));
                    self.push(Value::Obj(class_handle))?;
                }
                Op::Inherit => self.inherit()?,
                Op::Method(name_index) => self.define_method(name_index)?,
            }
        }
    }

    // ----- variables -----

    fn get_global(&mut self, index: u8) -> Result<(), String> {
        let name_handle = self.constant_as_name(index);
        match self.globals.get(&name_handle) {
            Some(&value) => self.push(value),
            None => Err(format!("Undefined variable '{}'.", self.string_value(name_handle))),
        }
    }

    fn define_global(&mut self, index: u8) -> Result<(), String> {
        let name_handle = self.constant_as_name(index);
        let value = self.pop()?;
        self.globals.insert(name_handle, value);
        Ok(())
    }

    fn set_global(&mut self, index: u8) -> Result<(), String> {
        let name_handle = self.constant_as_name(index);
        let value = self.peek(0)?;
        if !self.globals.contains_key(&name_handle) {
            return Err(format!("Undefined variable '{}'.", self.string_value(name_handle)));
        }
        self.globals.insert(name_handle, value);
        Ok(())
    }

    fn constant_as_name(&self, index: u8) -> ObjHandle {
        match self.read_constant(index) {
            Value::Obj(handle) => handle,
            _ => unreachable!("compiler always stores names as string constants"),
        }
    }

    fn upvalue_handle(&self, closure_handle: ObjHandle, slot: u8) -> ObjHandle {
        match self.heap.get(closure_handle) {
            Some(Obj::Closure(closure)) => closure.upvalues[slot as usize],
            _ => unreachable!("current frame's closure handle must reference a closure"),
        }
    }

    fn read_upvalue(&self, handle: ObjHandle) -> Value {
        match self.heap.get(handle) {
            Some(Obj::Upvalue(Upvalue::Open(slot))) => self.stack[*slot],
            Some(Obj::Upvalue(Upvalue::Closed(value))) => *value,
            _ => unreachable!("upvalue handle must reference an upvalue object"),
        }
    }

    fn write_upvalue(&mut self, handle: ObjHandle, value: Value) {
        let open_slot = match self.heap.get(handle) {
            Some(Obj::Upvalue(Upvalue::Open(slot))) => Some(*slot),
            _ => None,
        };
        match open_slot {
            Some(slot) => self.stack[slot] = value,
            None => {
                if let Some(Obj::Upvalue(upvalue)) = self.heap.get_mut(handle) {
                    *upvalue = Upvalue::Closed(value);
                }
            }
        }
    }

    fn capture_upvalue(&mut self, slot: usize) -> ObjHandle {
        for &handle in &self.open_upvalues {
            match self.heap.get(handle) {
                Some(Obj::Upvalue(Upvalue::Open(s))) if *s == slot => return handle,
                Some(Obj::Upvalue(Upvalue::Open(s))) if *s < slot => break,
                _ => {}
            }
        }
        let handle = self.heap.alloc(Obj::Upvalue(Upvalue::Open(slot)));
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|&h| matches!(self.heap.get(h), Some(Obj::Upvalue(Upvalue::Open(s))) if *s < slot))
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, handle);
        handle
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&handle) = self.open_upvalues.first() {
            let slot = match self.heap.get(handle) {
                Some(Obj::Upvalue(Upvalue::Open(s))) => *s,
                _ => break,
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            if let Some(Obj::Upvalue(upvalue)) = self.heap.get_mut(handle) {
                *upvalue = Upvalue::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    // ----- arithmétique -----

    fn binary_number_op(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), String> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => self.push(Value::Number(f(a, b))),
            _ => Err("Operands must be numbers.".to_string()),
        }
    }

    fn binary_number_cmp(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), String> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => self.push(Value::Bool(f(a, b))),
            _ => Err("Operands must be numbers.".to_string()),
        }
    }

    fn add(&mut self) -> Result<(), String> {
        let b = self.peek(0)?;
        let a = self.peek(1)?;
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop()?;
                self.pop()?;
                self.push(Value::Number(a + b))
            }
            (Value::Obj(ha), Value::Obj(hb)) if self.is_string(ha) && self.is_string(hb) => {
                self.pop()?;
                self.pop()?;
                let concatenated = format!("{}{}", self.string_value(ha), self.string_value(hb));
                let handle = self.heap.intern(&concatenated);
                self.push(Value::Obj(handle))
            }
            _ => Err("Operands must be two numbers or two strings.".to_string()),
        }
    }

    // ----- appels -----

    fn call(&mut self, closure_handle: ObjHandle, arg_count: u8) -> Result<(), String> {
        let function_handle = self.function_handle(closure_handle);
        let arity = match self.heap.get(function_handle) {
            Some(Obj::Function(f)) => f.arity,
            _ => unreachable!("closure must reference a function"),
        };
        if arg_count != arity {
            return Err(format!("Expected {arity} arguments but got {arg_count}."));
        }
        if self.frames.len() >= self.options.frame_limit {
            return Err("Stack overflow.".to_string());
        }
        let base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, base });
        Ok(())
    }

    fn call_value(&mut self, arg_count: u8) -> Result<(), String> {
        let callee = self.peek(arg_count as usize)?;
        let Value::Obj(handle) = callee else {
            return Err("Can only call functions and classes.".to_string());
        };

        enum Callable {
            Closure,
            Native(NativeFn),
            Class,
            Bound(ObjHandle, Value),
        }

        let callable = match self.heap.get(handle) {
            Some(Obj::Closure(_)) => Callable::Closure,
            Some(Obj::Native(native)) => Callable::Native(native.function),
            Some(Obj::Class(_)) => Callable::Class,
            Some(Obj::BoundMethod(bound)) => Callable::Bound(bound.method, bound.receiver),
            _ => return Err("Can only call functions and classes.".to_string()),
        };

        match callable {
            Callable::Closure => self.call(handle, arg_count),
            Callable::Native(native_fn) => {
                let args_start = self.stack.len() - arg_count as usize;
                let args: Vec<Value> = self.stack[args_start..].to_vec();
                let result = native_fn(&args);
                self.stack.truncate(args_start - 1);
                self.push(result)
            }
            Callable::Class => self.instantiate(handle, arg_count),
            Callable::Bound(method, receiver) => {
                let base = self.stack.len() - arg_count as usize - 1;
                self.stack[base] = receiver;
                self.call(method, arg_count)
            }
        }
    }

    fn instantiate(&mut self, class_handle: ObjHandle, arg_count: u8) -> Result<(), String> {
        let instance_handle = self.heap.alloc(Obj::Instance(Instance::new(class_handle)));
        let base = self.stack.len() - arg_count as usize - 1;
        self.stack[base] = Value::Obj(instance_handle);

        let initializer = match self.heap.get(class_handle) {
            Some(Obj::Class(class)) => class.methods.get(&self.init_string).copied(),
            _ => unreachable!("callee was verified to be a class"),
        };
        match initializer {
            Some(init_handle) => self.call(init_handle, arg_count),
            None if arg_count == 0 => Ok(()),
            None => Err(format!("Expected 0 arguments but got {arg_count}.")),
        }
    }

    fn bind_method(&mut self, class_handle: ObjHandle, name_handle: ObjHandle) -> Result<Option<Value>, String> {
        let method_handle = match self.heap.get(class_handle) {
            Some(Obj::Class(class)) => class.methods.get(&name_handle).copied(),
            _ => None,
        };
        let Some(method_handle) = method_handle else { return Ok(None) };
        let receiver = self.peek(0)?;
        let bound_handle = self.heap.alloc(Obj::BoundMethod(BoundMethod { receiver, method: method_handle }));
        Ok(Some(Value::Obj(bound_handle)))
    }

    fn get_property(&mut self, name_index: u8) -> Result<(), String> {
        let name_handle = self.constant_as_name(name_index);
        let receiver = self.peek(0)?;
        let Value::Obj(instance_handle) = receiver else {
            return Err("Only instances have properties.".to_string());
        };
        let (field, class_handle) = match self.heap.get(instance_handle) {
            Some(Obj::Instance(instance)) => (instance.fields.get(&name_handle).copied(), instance.class),
            _ => return Err("Only instances have properties.".to_string()),
        };
        if let Some(value) = field {
            self.pop()?;
            return self.push(value);
        }
        match self.bind_method(class_handle, name_handle)? {
            Some(bound) => {
                self.pop()?;
                self.push(bound)
            }
            None => Err(format!("Undefined property '{}'.", self.string_value(name_handle))),
        }
    }

    fn set_property(&mut self, name_index: u8) -> Result<(), String> {
        let name_handle = self.constant_as_name(name_index);
        let value = self.peek(0)?;
        let receiver = self.peek(1)?;
        let Value::Obj(instance_handle) = receiver else {
            return Err("Only instances have fields.".to_string());
        };
        match self.heap.get_mut(instance_handle) {
            Some(Obj::Instance(instance)) => {
                instance.fields.insert(name_handle, value);
            }
            _ => return Err("Only instances have fields.".to_string()),
        }
        self.pop()?;
        self.pop()?;
        self.push(value)
    }

    fn get_super(&mut self, name_index: u8) -> Result<(), String> {
        let name_handle = self.constant_as_name(name_index);
        let superclass_value = self.pop()?;
        let Value::Obj(superclass_handle) = superclass_value else {
            unreachable!("compiler always pushes the superclass before GET_SUPER")
        };
        match self.bind_method(superclass_handle, name_handle)? {
            Some(bound) => {
                self.pop()?;
                self.push(bound)
            }
            None => Err(format!("Undefined property '{}'.", self.string_value(name_handle))),
        }
    }

    fn invoke(&mut self, name_index: u8, arg_count: u8) -> Result<(), String> {
        let name_handle = self.constant_as_name(name_index);
        let receiver = self.peek(arg_count as usize)?;
        let Value::Obj(instance_handle) = receiver else {
            return Err("Only instances have methods.".to_string());
        };
        let (field, class_handle) = match self.heap.get(instance_handle) {
            Some(Obj::Instance(instance)) => (instance.fields.get(&name_handle).copied(), instance.class),
            _ => return Err("Only instances have methods.".to_string()),
        };
        if let Some(value) = field {
            let base = self.stack.len() - arg_count as usize - 1;
            self.stack[base] = value;
            return self.call_value(arg_count);
        }
        self.invoke_from_class(class_handle, name_handle, arg_count)
    }

    fn invoke_from_class(&mut self, class_handle: ObjHandle, name_handle: ObjHandle, arg_count: u8) -> Result<(), String> {
        let method_handle = match self.heap.get(class_handle) {
            Some(Obj::Class(class)) => class.methods.get(&name_handle).copied(),
            _ => None,
        };
        match method_handle {
            Some(method_handle) => self.call(method_handle, arg_count),
            None => Err(format!("Undefined property '{}'.", self.string_value(name_handle))),
        }
    }

    fn super_invoke(&mut self, name_index: u8, arg_count: u8) -> Result<(), String> {
        let name_handle = self.constant_as_name(name_index);
        let superclass_value = self.pop()?;
        let Value::Obj(superclass_handle) = superclass_value else {
            unreachable!("compiler always pushes the superclass before SUPER_INVOKE")
        };
        self.invoke_from_class(superclass_handle, name_handle, arg_count)
    }

    fn inherit(&mut self) -> Result<(), String> {
        let subclass_value = self.peek(0)?;
        let superclass_value = self.peek(1)?;
        let Value::Obj(superclass_handle) = superclass_value else {
            return Err("Superclass must be a class.".to_string());
        };
        let Value::Obj(subclass_handle) = subclass_value else {
            unreachable!("compiler always pushes the subclass before INHERIT")
        };
        let methods = match self.heap.get(superclass_handle) {
            Some(Obj::Class(class)) => class.methods.clone(),
            _ => return Err("Superclass must be a class.".to_string()),
        };
        match self.heap.get_mut(subclass_handle) {
            Some(Obj::Class(class)) => {
                for (name, method) in methods {
                    class.methods.insert(name, method);
                }
            }
            _ => unreachable!("compiler always pushes the subclass before INHERIT"),
        }
        self.pop()?;
        Ok(())
    }

    fn define_method(&mut self, name_index: u8) -> Result<(), String> {
        let name_handle = self.constant_as_name(name_index);
        let method_value = self.pop()?;
        let Value::Obj(method_handle) = method_value else {
            unreachable!("compiler always emits a closure before METHOD")
        };
        let class_value = self.peek(0)?;
        let Value::Obj(class_handle) = class_value else {
            unreachable!("compiler keeps the class on the stack while defining methods")
        };
        match self.heap.get_mut(class_handle) {
            Some(Obj::Class(class)) => {
                class.methods.insert(name_handle, method_handle);
            }
            _ => unreachable!("compiler keeps the class on the stack while defining methods"),
        }
        Ok(())
    }

    fn make_closure(&mut self, fn_index: u8, captures: Vec<UpvalueCapture>) -> Result<(), String> {
        let function_value = self.read_constant(fn_index);
        let Value::Obj(function_handle) = function_value else {
            unreachable!("compiler always stores functions as constants")
        };
        let mut upvalues = Vec::with_capacity(captures.len());
        for capture in captures {
            if capture.is_local {
                let base = self.current_frame().base;
                upvalues.push(self.capture_upvalue(base + capture.index as usize));
            } else {
                let enclosing = self.current_frame().closure;
                upvalues.push(self.upvalue_handle(enclosing, capture.index));
            }
        }
        let closure_handle = self.heap.alloc(Obj::Closure(Closure { function: function_handle, upvalues }));
        self.push(Value::Obj(closure_handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_source(source: &str) -> Result<Vm, RuntimeError> {
        let mut vm = Vm::new();
        let handle = lox_compiler::compile(source, vm.heap_mut()).expect("source should compile");
        vm.interpret(handle)?;
        Ok(vm)
    }

    fn global_named(vm: &Vm, name: &str) -> Value {
        for (&handle, &value) in &vm.globals {
            if vm.string_value(handle) == name {
                return value;
            }
        }
        panic!("no global named '{name}'");
    }

    #[test]
    fn arithmetic_and_globals() {
        let vm = run_source("var x = 1 + 2 * 3; var y = x;").unwrap();
        assert!(vm.globals.values().any(|v| matches!(v, Value::Number(n) if *n == 7.0)));
    }

    #[test]
    fn string_concatenation() {
        let vm = run_source(r#"var s = "foo" + "bar";"#).unwrap();
        let Some(Value::Obj(handle)) = vm.globals.values().next() else { panic!("expected a string global") };
        assert_eq!(vm.string_value(*handle), "foobar");
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let err = run_source("print nope;").unwrap_err();
        assert!(err.message.contains("Undefined variable 'nope'"));
        assert_eq!(err.trace.last().unwrap().function_name, "script");
    }

    #[test]
    fn closures_share_mutated_upvalue() {
        let vm = run_source(indoc::indoc! {"
            fun makeCounter() {
                var count = 0;
                fun increment() {
                    count = count + 1;
                    return count;
                }
                return increment;
            }
            var counter = makeCounter();
            var a = counter();
            var b = counter();
        "})
        .unwrap();
        let mut numbers: Vec<f64> = vm
            .globals
            .values()
            .filter_map(|v| if let Value::Number(n) = v { Some(*n) } else { None })
            .collect();
        numbers.sort_by(f64::total_cmp);
        assert_eq!(numbers, vec![1.0, 2.0]);
    }

    #[test]
    fn class_instantiation_and_methods() {
        let vm = run_source(indoc::indoc! {"
            class Counter {
                init() { this.value = 0; }
                bump() { this.value = this.value + 1; return this.value; }
            }
            var c = Counter();
            var a = c.bump();
            var b = c.bump();
        "})
        .unwrap();
        let mut numbers: Vec<f64> = vm
            .globals
            .values()
            .filter_map(|v| if let Value::Number(n) = v { Some(*n) } else { None })
            .collect();
        numbers.sort_by(f64::total_cmp);
        assert_eq!(numbers, vec![1.0, 2.0]);
    }

    #[test]
    fn inheritance_dispatches_to_superclass_method_via_super() {
        let vm = run_source(indoc::indoc! {"
            class Animal {
                speak() { return \"...\"; }
            }
            class Dog < Animal {
                speak() { return super.speak(); }
            }
            var d = Dog();
            var sound = d.speak();
        "})
        .unwrap();
        let Value::Obj(handle) = global_named(&vm, "sound") else { panic!("expected a string global") };
        assert_eq!(vm.string_value(handle), "...");
    }

    #[test]
    fn stack_overflow_from_unbounded_recursion_is_reported() {
        let err = run_source(indoc::indoc! {"
            fun recurse() { return recurse(); }
            recurse();
        "})
        .unwrap_err();
        assert_eq!(err.message, "Stack overflow.");
    }

    #[test]
    fn gc_stress_mode_does_not_collect_reachable_values() {
        let mut vm = Vm::with_options(VmOptions::default().with_gc_stress(true));
        let handle = lox_compiler::compile(
            indoc::indoc! {"
                var a = \"alive\";
                var b = a + \"!\";
                print b;
            "},
            vm.heap_mut(),
        )
        .expect("source should compile");
        vm.interpret(handle).expect("should run without error");
        let Value::Obj(b_handle) = global_named(&vm, "b") else { panic!("expected a string global") };
        assert_eq!(vm.string_value(b_handle), "alive!");
    }
}
