use std::cell::RefCell;
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    compile, Chunk, Error, Gc, Heap, NativeFun, ObjBoundMethod, ObjClass, ObjClosure, ObjFun,
    ObjInstance, ObjString, ObjUpvalue, OpCode, RuntimeError, Table, Value, MAX_FRAMES, MAX_STACK,
};

#[cfg(feature = "trace")]
use crate::{disassemble_chunk, disassemble_instruction};

fn clock_native(_args: &[Value]) -> Value {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Value::Number(now.as_secs_f64())
}

/// A call's bookkeeping: the closure being run, the instruction pointer into
/// its chunk, and the stack slot where its locals begin. Slot 0 holds the
/// callee, or the receiver for method calls.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: Gc<ObjClosure>,
    ip: usize,
    slots: usize,
}

/// A bytecode virtual machine for the Lox programming language
#[derive(Debug)]
pub struct VM<Out = io::Stdout> {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    // Sorted by descending stack slot; no two entries share a slot.
    open_upvalues: Vec<Gc<RefCell<ObjUpvalue>>>,
    heap: Heap,
    init_string: Gc<ObjString>,
    out: Out,
}

impl VM<io::Stdout> {
    /// Create a virtual machine printing to the process's stdout.
    pub fn new() -> Self {
        Self::with_output(io::stdout())
    }
}

impl Default for VM<io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Out: Write> VM<Out> {
    /// Create a virtual machine printing to the given sink.
    pub fn with_output(out: Out) -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Self {
            stack: Vec::with_capacity(MAX_STACK),
            frames: Vec::with_capacity(MAX_FRAMES),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            heap,
            init_string,
            out,
        };
        vm.define_native("clock", 0, clock_native);
        vm
    }

    /// Compile and run the given source code.
    ///
    /// Compile diagnostics and runtime stack traces are written to stderr. On
    /// a runtime error the value stack is reset but globals survive, so a
    /// REPL can keep feeding lines to the same machine.
    pub fn interpret(&mut self, src: &str) -> Result<(), Error> {
        let fun = compile(src, &mut self.heap).ok_or(Error::Compile)?;

        #[cfg(feature = "trace")]
        disassemble_chunk(&fun.chunk, "<script>");

        match self.run_function(fun) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.report_runtime_error(&err);
                Err(Error::Runtime)
            }
        }
    }

    fn run_function(&mut self, fun: Gc<ObjFun>) -> Result<(), RuntimeError> {
        // The bare function roots itself on the stack while the closure for
        // it is allocated.
        self.push(Value::Fun(fun))?;
        let closure = self.heap.alloc(ObjClosure {
            fun,
            upvalues: Vec::new(),
        });
        self.pop();
        self.push(Value::Closure(closure))?;
        self.call_closure(closure, 0)?;
        self.run()
    }

    fn report_runtime_error(&mut self, err: &RuntimeError) {
        eprintln!("{err}");
        for frame in self.frames.iter().rev() {
            let fun = &frame.closure.fun;
            let (_, pos) = fun.chunk.read_instruction(frame.ip - 1);
            match &fun.name {
                Some(name) => eprintln!("[line {}] in {}()", pos.line, name),
                None => eprintln!("[line {}] in script", pos.line),
            }
        }
        self.reset_stack();
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn define_native(&mut self, name: &str, arity: u8, call: fn(&[Value]) -> Value) {
        let name = self.heap.intern(name);
        self.globals
            .set(name, Value::NativeFun(NativeFun { name, arity, call }));
    }

    // ------------------------------------------------------------------
    // Stack and frame access

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() == MAX_STACK {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("Stack must be non-empty.")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("Frame stack must be non-empty.")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames
            .last_mut()
            .expect("Frame stack must be non-empty.")
    }

    fn chunk(&self) -> &Chunk {
        &self.frame().closure.fun.chunk
    }

    fn read_const(&self, idx: u8) -> Value {
        *self.chunk().read_const(idx as usize)
    }

    fn read_const_str(&self, idx: u8) -> Gc<ObjString> {
        match self.read_const(idx) {
            Value::Str(s) => s,
            _ => unreachable!("Constant for the name must have been added."),
        }
    }

    // ------------------------------------------------------------------
    // Garbage collection

    fn maybe_gc(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        for value in &self.stack {
            self.heap.mark_value(*value);
        }
        for frame in &self.frames {
            self.heap.mark(frame.closure);
        }
        for upvalue in &self.open_upvalues {
            self.heap.mark(*upvalue);
        }
        self.globals.mark(&mut self.heap);
        self.heap.mark(self.init_string);
        self.heap.collect();
    }

    // ------------------------------------------------------------------
    // Calls

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        match callee {
            Value::Closure(closure) => self.call_closure(closure, arg_count),
            Value::NativeFun(native) => {
                if arg_count != native.arity {
                    return Err(RuntimeError::Arity(native.arity, arg_count));
                }
                let base = self.stack.len() - arg_count as usize;
                let result = (native.call)(&self.stack[base..]);
                self.stack.truncate(base - 1);
                self.push(result)
            }
            Value::Class(class) => {
                self.maybe_gc();
                let instance = self.heap.alloc(RefCell::new(ObjInstance::new(class)));
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = Value::Instance(instance);

                let initializer = class.borrow().methods.get(self.init_string);
                match initializer {
                    Some(Value::Closure(init)) => self.call_closure(init, arg_count),
                    Some(_) => unreachable!("Methods must be closures."),
                    None if arg_count != 0 => Err(RuntimeError::Arity(0, arg_count)),
                    None => Ok(()),
                }
            }
            Value::BoundMethod(bound) => {
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = bound.receiver;
                self.call_closure(bound.method, arg_count)
            }
            _ => Err(RuntimeError::NotCallable),
        }
    }

    fn call_closure(&mut self, closure: Gc<ObjClosure>, arg_count: u8) -> Result<(), RuntimeError> {
        if arg_count != closure.fun.arity {
            return Err(RuntimeError::Arity(closure.fun.arity, arg_count));
        }
        if self.frames.len() == MAX_FRAMES {
            return Err(RuntimeError::StackOverflow);
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count as usize - 1,
        });
        Ok(())
    }

    fn invoke(&mut self, name: Gc<ObjString>, arg_count: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count as usize);
        let instance = match receiver {
            Value::Instance(instance) => instance,
            _ => return Err(RuntimeError::NoMethods),
        };

        // A field holding a callable shadows any method of the same name.
        let field = instance.borrow().fields.get(name);
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count as usize - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }

        let class = instance.borrow().class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: Gc<RefCell<ObjClass>>,
        name: Gc<ObjString>,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let method = class.borrow().methods.get(name);
        match method {
            Some(Value::Closure(method)) => self.call_closure(method, arg_count),
            Some(_) => unreachable!("Methods must be closures."),
            None => Err(RuntimeError::UndefinedProperty(name.as_str().to_string())),
        }
    }

    fn bind_method(
        &mut self,
        class: Gc<RefCell<ObjClass>>,
        name: Gc<ObjString>,
    ) -> Result<(), RuntimeError> {
        let method = class.borrow().methods.get(name);
        let method = match method {
            Some(Value::Closure(method)) => method,
            Some(_) => unreachable!("Methods must be closures."),
            None => return Err(RuntimeError::UndefinedProperty(name.as_str().to_string())),
        };

        self.maybe_gc();
        let bound = self.heap.alloc(ObjBoundMethod {
            receiver: self.peek(0),
            method,
        });
        self.pop();
        self.push(Value::BoundMethod(bound))
    }

    // ------------------------------------------------------------------
    // Upvalues

    fn capture_upvalue(&mut self, slot: usize) -> Gc<RefCell<ObjUpvalue>> {
        let mut insert_at = self.open_upvalues.len();
        for (idx, upvalue) in self.open_upvalues.iter().enumerate() {
            let open_slot = match *upvalue.borrow() {
                ObjUpvalue::Open(open_slot) => open_slot,
                ObjUpvalue::Closed(_) => unreachable!("Closed upvalues are unlinked."),
            };
            if open_slot == slot {
                return *upvalue;
            }
            if open_slot < slot {
                insert_at = idx;
                break;
            }
        }
        let upvalue = self.heap.alloc(RefCell::new(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    fn close_upvalues(&mut self, last: usize) {
        // The list is sorted by descending slot, so everything to close sits
        // at the front.
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match *upvalue.borrow() {
                ObjUpvalue::Open(slot) => slot,
                ObjUpvalue::Closed(_) => unreachable!("Closed upvalues are unlinked."),
            };
            if slot < last {
                break;
            }
            *upvalue.borrow_mut() = ObjUpvalue::Closed(self.stack[slot]);
            self.open_upvalues.remove(0);
        }
    }

    // ------------------------------------------------------------------
    // Execution

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "trace")]
            {
                print_stack_trace(&self.stack);
                disassemble_instruction(self.chunk(), self.frame().ip);
            }

            let opcode = self.chunk().read_instruction(self.frame().ip).0.clone();
            self.frame_mut().ip += 1;

            match opcode {
                OpCode::Constant(idx) => {
                    let value = self.read_const(idx);
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal(slot) => {
                    let value = self.stack[self.frame().slots + slot as usize];
                    self.push(value)?;
                }
                OpCode::SetLocal(slot) => {
                    let value = self.peek(0);
                    let base = self.frame().slots;
                    self.stack[base + slot as usize] = value;
                }
                OpCode::GetGlobal(idx) => {
                    let name = self.read_const_str(idx);
                    match self.globals.get(name) {
                        Some(value) => self.push(value)?,
                        None => {
                            return Err(RuntimeError::UndefinedVariable(
                                name.as_str().to_string(),
                            ));
                        }
                    }
                }
                OpCode::DefineGlobal(idx) => {
                    let name = self.read_const_str(idx);
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal(idx) => {
                    let name = self.read_const_str(idx);
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        self.globals.remove(name);
                        return Err(RuntimeError::UndefinedVariable(name.as_str().to_string()));
                    }
                }
                OpCode::GetUpvalue(idx) => {
                    let upvalue = self.frame().closure.upvalues[idx as usize];
                    let value = match *upvalue.borrow() {
                        ObjUpvalue::Open(slot) => self.stack[slot],
                        ObjUpvalue::Closed(value) => value,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue(idx) => {
                    let value = self.peek(0);
                    let upvalue = self.frame().closure.upvalues[idx as usize];
                    let open_slot = match &mut *upvalue.borrow_mut() {
                        ObjUpvalue::Open(slot) => Some(*slot),
                        ObjUpvalue::Closed(closed) => {
                            *closed = value;
                            None
                        }
                    };
                    if let Some(slot) = open_slot {
                        self.stack[slot] = value;
                    }
                }
                OpCode::GetProperty(idx) => {
                    let instance = match self.peek(0) {
                        Value::Instance(instance) => instance,
                        _ => return Err(RuntimeError::NoProperties),
                    };
                    let name = self.read_const_str(idx);
                    let field = instance.borrow().fields.get(name);
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value)?;
                        }
                        None => {
                            let class = instance.borrow().class;
                            self.bind_method(class, name)?;
                        }
                    }
                }
                OpCode::SetProperty(idx) => {
                    let instance = match self.peek(1) {
                        Value::Instance(instance) => instance,
                        _ => return Err(RuntimeError::NoFields),
                    };
                    let name = self.read_const_str(idx);
                    instance.borrow_mut().fields.set(name, self.peek(0));
                    let value = self.pop();
                    self.pop();
                    self.push(value)?;
                }
                OpCode::GetSuper(idx) => {
                    let name = self.read_const_str(idx);
                    let superclass = match self.pop() {
                        Value::Class(class) => class,
                        _ => unreachable!("The compiler only emits GetSuper below a class."),
                    };
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push(Value::Bool(lhs == rhs))?;
                }
                OpCode::Greater => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push(lhs.gt(&rhs)?)?;
                }
                OpCode::Less => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push(lhs.lt(&rhs)?)?;
                }
                OpCode::Add => match (self.peek(1), self.peek(0)) {
                    (Value::Number(lhs), Value::Number(rhs)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(lhs + rhs))?;
                    }
                    (Value::Str(lhs), Value::Str(rhs)) => {
                        // Both operands stay on the stack rooting themselves
                        // until the result is interned.
                        self.maybe_gc();
                        let mut result = String::with_capacity(
                            lhs.as_str().len() + rhs.as_str().len(),
                        );
                        result.push_str(lhs.as_str());
                        result.push_str(rhs.as_str());
                        let result = Value::Str(self.heap.intern(&result));
                        self.pop();
                        self.pop();
                        self.push(result)?;
                    }
                    _ => return Err(RuntimeError::NotNumbersOrStrings),
                },
                OpCode::Subtract => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push((&lhs - &rhs)?)?;
                }
                OpCode::Multiply => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push((&lhs * &rhs)?)?;
                }
                OpCode::Divide => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push((&lhs / &rhs)?)?;
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(!&value)?;
                }
                OpCode::Negate => {
                    let value = self.pop();
                    self.push((-&value)?)?;
                }
                OpCode::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.out, "{value}");
                }
                OpCode::Jump(offset) => {
                    self.frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse(offset) => {
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop(offset) => {
                    self.frame_mut().ip -= offset as usize;
                }
                OpCode::Call(arg_count) => {
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke(idx, arg_count) => {
                    let name = self.read_const_str(idx);
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke(idx, arg_count) => {
                    let name = self.read_const_str(idx);
                    let superclass = match self.pop() {
                        Value::Class(class) => class,
                        _ => unreachable!("The compiler only emits SuperInvoke below a class."),
                    };
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure(idx, upvalue_indices) => {
                    self.maybe_gc();
                    let fun = match self.read_const(idx) {
                        Value::Fun(fun) => fun,
                        _ => unreachable!("The constant must hold a function."),
                    };
                    let mut upvalues = Vec::with_capacity(upvalue_indices.len());
                    for upvalue in &upvalue_indices {
                        if upvalue.is_local {
                            let slot = self.frame().slots + upvalue.index as usize;
                            upvalues.push(self.capture_upvalue(slot));
                        } else {
                            upvalues
                                .push(self.frame().closure.upvalues[upvalue.index as usize]);
                        }
                    }
                    let closure = self.heap.alloc(ObjClosure { fun, upvalues });
                    self.push(Value::Closure(closure))?;
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("Frame stack must be non-empty.");
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        // Pop the top-level closure; a finished script leaves
                        // the stack empty.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result)?;
                }
                OpCode::Class(idx) => {
                    let name = self.read_const_str(idx);
                    self.maybe_gc();
                    let class = self.heap.alloc(RefCell::new(ObjClass::new(name)));
                    self.push(Value::Class(class))?;
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1) {
                        Value::Class(class) => class,
                        _ => return Err(RuntimeError::NotClass),
                    };
                    let subclass = match self.peek(0) {
                        Value::Class(class) => class,
                        _ => unreachable!("The compiler emits Inherit above a new class."),
                    };
                    subclass
                        .borrow_mut()
                        .methods
                        .add_all(&superclass.borrow().methods);
                    self.pop();
                }
                OpCode::Method(idx) => {
                    let name = self.read_const_str(idx);
                    let method = self.peek(0);
                    let class = match self.peek(1) {
                        Value::Class(class) => class,
                        _ => unreachable!("The compiler emits Method above a class."),
                    };
                    class.borrow_mut().methods.set(name, method);
                    self.pop();
                }
            }
        }
    }
}

#[cfg(feature = "trace")]
fn print_stack_trace(stack: &[Value]) {
    print!("          ");
    for val in stack {
        print!("[ {} ]", val);
    }
    println!();
}
