//! The virtual machine: register stack, call stack, object and upvalue
//! pools, and the instruction dispatch loop.
//!
//! A `Vm` owns everything it executes on. The host loads a chunk, pushes
//! arguments and calls; native closures invoked from script re-enter the
//! host synchronously on the same stacks. Dispatch faults unwind to the
//! nearest host entry and leave the VM usable.

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::bytecode::{Chunk, Constant, Prototype};
use crate::error::{Error, Result};
use crate::frame::{CallFrame, MULTIRET};
use crate::instruction::{Instruction, OpCode};
use crate::object::{HeapObject, LuaClosure, NativeClosure, ObjectRef, Upvalue, UpvalueRef};
use crate::pool::Pool;
use crate::table::Table;
use crate::value::{self, float_to_int_exact, LuaInt, LuaNum, LuaStr, Numeric, Value};

/// Execution bounds and diagnostics switches.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Register stack ceiling; exceeding it is a `StackOverflow`.
    pub max_registers: usize,
    /// Call depth ceiling; exceeding it is a `StackOverflow`.
    pub max_call_depth: usize,
    /// Trace every dispatched instruction to stderr.
    pub debug_trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_registers: 1_000_000,
            max_call_depth: 200,
            debug_trace: false,
        }
    }
}

enum Callee {
    Script(Rc<Prototype>, ObjectRef),
    Native(crate::object::NativeFn),
}

/// A virtual machine instance.
///
/// Single-threaded by construction; create one per embedding.
pub struct Vm {
    registers: Vec<Value>,
    frames: Vec<CallFrame>,
    objects: Pool<HeapObject>,
    upvalues: Pool<Upvalue>,
    /// Open upvalues ordered by referenced stack index, lowest first.
    open_upvalues: Vec<UpvalueRef>,
    /// Per-prototype closure cache, keyed by prototype identity.
    closure_cache: HashMap<usize, Weak<std::cell::RefCell<HeapObject>>>,
    /// The distinguished environment; lives as long as the VM.
    env: Value,
    config: VmConfig,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut objects = Pool::new();
        let env_obj = ObjectRef::from_rc(objects.alloc(HeapObject::Table(Table::new())));
        Vm {
            registers: Vec::new(),
            frames: Vec::new(),
            objects,
            upvalues: Pool::new(),
            open_upvalues: Vec::new(),
            closure_cache: HashMap::new(),
            env: Value::Object(env_obj),
            config,
        }
    }

    //
    // Host API
    //

    /// Instantiate a chunk's root closure, bound to the distinguished
    /// environment through its first upvalue, and push it.
    pub fn load(&mut self, chunk: &Chunk) -> Result<()> {
        let proto = Rc::clone(&chunk.root);
        let mut upvalues = Vec::with_capacity(proto.upvalues.len());
        for i in 0..proto.upvalues.len() {
            let initial = if i == 0 { self.env.clone() } else { Value::Nil };
            upvalues.push(UpvalueRef::from_rc(
                self.upvalues.alloc(Upvalue::Closed(initial)),
            ));
        }
        let closure = ObjectRef::from_rc(
            self.objects
                .alloc(HeapObject::LuaClosure(LuaClosure { proto, upvalues })),
        );
        self.push(Value::Object(closure))
    }

    /// Push one value.
    pub fn push(&mut self, value: Value) -> Result<()> {
        if self.registers.len() >= self.config.max_registers {
            return Err(Error::StackOverflow);
        }
        self.registers.push(value);
        Ok(())
    }

    /// Pop one value; popping an empty stack yields nil.
    pub fn pop(&mut self) -> Value {
        self.registers.pop().unwrap_or(Value::Nil)
    }

    /// Pop `n` values.
    pub fn pop_n(&mut self, n: usize) {
        let new_len = self.registers.len().saturating_sub(n);
        self.registers.truncate(new_len);
    }

    /// Current register stack size.
    pub fn stack_size(&self) -> usize {
        self.registers.len()
    }

    /// The i-th argument of the executing native closure, 1-indexed.
    /// Out-of-range reads yield nil.
    pub fn argument(&self, i: usize) -> Value {
        match self.frames.last() {
            Some(frame) if !frame.is_script() && i >= 1 && i <= self.num_params() => {
                self.reg(frame.func_idx + i)
            }
            _ => Value::Nil,
        }
    }

    /// Number of arguments passed to the executing native closure.
    pub fn num_params(&self) -> usize {
        match self.frames.last() {
            Some(frame) if !frame.is_script() => frame.base - frame.func_idx - 1,
            _ => 0,
        }
    }

    /// The distinguished environment as a value.
    pub fn env(&self) -> Value {
        self.env.clone()
    }

    /// Read a key from the distinguished environment.
    pub fn global(&self, key: &Value) -> Value {
        match &self.env {
            Value::Object(obj) => match &*obj.borrow() {
                HeapObject::Table(t) => t.get(key),
                _ => Value::Nil,
            },
            _ => Value::Nil,
        }
    }

    /// Write a key in the distinguished environment.
    pub fn set_global(&mut self, key: Value, value: Value) {
        if let Value::Object(obj) = &self.env {
            if let HeapObject::Table(t) = &mut *obj.borrow_mut() {
                t.set(key, value);
            }
        }
    }

    /// Allocate an empty table.
    pub fn alloc_table(&mut self) -> Value {
        Value::Object(ObjectRef::from_rc(
            self.objects.alloc(HeapObject::Table(Table::new())),
        ))
    }

    /// Wrap a host function as a callable value.
    pub fn alloc_native_function<F>(&mut self, f: F) -> Value
    where
        F: Fn(&mut Vm) -> Result<i32> + 'static,
    {
        Value::Object(ObjectRef::from_rc(self.objects.alloc(
            HeapObject::NativeClosure(NativeClosure { func: Rc::new(f) }),
        )))
    }

    /// Register a host function under a name in the environment.
    pub fn define_native_function<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&mut Vm) -> Result<i32> + 'static,
    {
        let func = self.alloc_native_function(f);
        self.set_global(Value::str(name), func);
    }

    /// Invoke the function at `stack_top - nargs - 1` with the `nargs`
    /// values above it, asking for `nreturn` results ([`MULTIRET`] keeps
    /// them all). On success the results replace function and arguments.
    pub fn call(&mut self, nargs: usize, nreturn: i32) -> Result<()> {
        let func_idx = self
            .registers
            .len()
            .checked_sub(nargs + 1)
            .ok_or(Error::CallNonCallable("nil"))?;
        let entry_depth = self.frames.len();

        let result = self.call_at(func_idx, nreturn);
        if let Err(e) = result {
            self.unwind(entry_depth, func_idx);
            return Err(e);
        }
        Ok(())
    }

    /// Live objects in the object pool.
    pub fn live_objects(&self) -> usize {
        self.objects.live()
    }

    /// Live upvalues in the upvalue pool.
    pub fn live_upvalues(&self) -> usize {
        self.upvalues.live()
    }

    /// Open upvalues still aliasing the register stack.
    pub fn open_upvalue_count(&self) -> usize {
        self.open_upvalues.len()
    }

    //
    // Register access
    //

    fn reg(&self, idx: usize) -> Value {
        self.registers.get(idx).cloned().unwrap_or(Value::Nil)
    }

    fn set_reg(&mut self, idx: usize, value: Value) -> Result<()> {
        if idx >= self.registers.len() {
            self.ensure_registers(idx + 1)?;
        }
        self.registers[idx] = value;
        Ok(())
    }

    fn ensure_registers(&mut self, len: usize) -> Result<()> {
        if len > self.config.max_registers {
            return Err(Error::StackOverflow);
        }
        if len > self.registers.len() {
            self.registers.resize(len, Value::Nil);
        }
        Ok(())
    }

    //
    // Call protocol
    //

    fn call_at(&mut self, func_idx: usize, nreturn: i32) -> Result<()> {
        if self.precall(func_idx, nreturn)? {
            return Ok(());
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.is_fresh = true;
        }
        self.execute()
    }

    fn classify_callee(&self, func_idx: usize) -> Result<Callee> {
        let callee = self.reg(func_idx);
        let obj = match &callee {
            Value::Object(obj) => obj.clone(),
            other => return Err(Error::CallNonCallable(other.type_name())),
        };
        let kind = match &*obj.borrow() {
            HeapObject::LuaClosure(c) => Callee::Script(Rc::clone(&c.proto), obj.clone()),
            HeapObject::NativeClosure(n) => Callee::Native(Rc::clone(&n.func)),
            HeapObject::Table(_) => return Err(Error::CallNonCallable("table")),
        };
        Ok(kind)
    }

    /// Dispatch a pushed function. Returns true when the call completed
    /// inline (native target), false when a script frame was pushed.
    fn precall(&mut self, func_idx: usize, nreturn: i32) -> Result<bool> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(Error::StackOverflow);
        }
        match self.classify_callee(func_idx)? {
            Callee::Native(func) => {
                let nargs = self.registers.len() - func_idx - 1;
                self.frames.push(CallFrame {
                    func_idx,
                    base: func_idx + 1 + nargs,
                    pc: 0,
                    numresults: nreturn,
                    top: 0,
                    proto: None,
                    closure: None,
                    varargs: Vec::new(),
                    is_fresh: false,
                    is_tail: false,
                });
                let n = func(self)?.max(0) as usize;
                let n = n.min(self.registers.len());
                let first = self.registers.len() - n;
                self.finish_call(first, n);
                Ok(true)
            }
            Callee::Script(proto, closure) => {
                let nargs = self.registers.len() - func_idx - 1;
                let fixed = proto.num_params as usize;

                let varargs = if nargs > fixed {
                    let extras = self.registers.split_off(func_idx + 1 + fixed);
                    if proto.is_vararg {
                        extras
                    } else {
                        Vec::new()
                    }
                } else {
                    Vec::new()
                };
                self.ensure_registers(func_idx + 1 + fixed)?;

                let base = func_idx + 1;
                let top = base + proto.max_stack_size as usize;
                self.ensure_registers(top)?;

                self.frames.push(CallFrame {
                    func_idx,
                    base,
                    pc: 0,
                    numresults: nreturn,
                    top,
                    proto: Some(proto),
                    closure: Some(closure),
                    varargs,
                    is_fresh: false,
                    is_tail: false,
                });
                Ok(false)
            }
        }
    }

    /// Pop the current frame and settle its results at the function
    /// slot, padding with nil or truncating to the requested count.
    fn finish_call(&mut self, first_result: usize, nres: usize) {
        let frame = self.frames.pop().expect("finish_call without a frame");
        let func_idx = frame.func_idx;

        let first = first_result.min(self.registers.len());
        let end = (first + nres).min(self.registers.len());
        let results: Vec<Value> = self.registers.drain(first..end).collect();
        self.registers.truncate(func_idx);
        self.registers.extend(results);

        if frame.numresults != MULTIRET {
            let wanted = frame.numresults.max(0) as usize;
            self.registers.resize(func_idx + wanted, Value::Nil);
        }
    }

    /// Restore the innermost script frame's register ceiling after a
    /// fixed-result call settled below it.
    fn restore_frame_top(&mut self) -> Result<()> {
        if let Some(frame) = self.frames.last() {
            if frame.is_script() && self.registers.len() < frame.top {
                let top = frame.top;
                self.ensure_registers(top)?;
            }
        }
        Ok(())
    }

    /// Unwind every frame above `depth`, closing their upvalues, then
    /// drop the registers of the failed call.
    fn unwind(&mut self, depth: usize, func_idx: usize) {
        while self.frames.len() > depth {
            let frame = self.frames.pop().expect("unwinding an empty call stack");
            if frame.is_script() {
                self.close_upvalues(frame.base);
            }
        }
        self.registers.truncate(func_idx);
    }

    //
    // Upvalue lifecycle
    //

    /// Find the open upvalue aliasing `stack_idx`, or create one.
    /// Sharing an existing entry is what makes captured variables aliases
    /// rather than copies.
    fn find_or_create_upvalue(&mut self, stack_idx: usize) -> UpvalueRef {
        match self
            .open_upvalues
            .binary_search_by_key(&stack_idx, |uv| uv.open_index().unwrap_or(usize::MAX))
        {
            Ok(pos) => self.open_upvalues[pos].clone(),
            Err(pos) => {
                let upvalue = UpvalueRef::from_rc(self.upvalues.alloc(Upvalue::Open(stack_idx)));
                self.open_upvalues.insert(pos, upvalue.clone());
                upvalue
            }
        }
    }

    /// Close every open upvalue at or above `level`, highest first.
    fn close_upvalues(&mut self, level: usize) {
        while let Some(upvalue) = self.open_upvalues.last() {
            match upvalue.open_index() {
                Some(idx) if idx >= level => {
                    let value = self.reg(idx);
                    let upvalue = self.open_upvalues.pop().expect("open upvalue list emptied");
                    upvalue.close(value);
                }
                _ => break,
            }
        }
    }

    fn frame_upvalue(&self, index: usize) -> Result<UpvalueRef> {
        let frame = self.frames.last().expect("no active frame");
        let closure = frame.closure.as_ref().expect("script frame without closure");
        match &*closure.borrow() {
            HeapObject::LuaClosure(c) => c
                .upvalues
                .get(index)
                .cloned()
                .ok_or(Error::UpvalueBounds(index)),
            _ => Err(Error::UpvalueBounds(index)),
        }
    }

    /// Build (or reuse) the closure for `proto` captured at `base`.
    fn make_closure(&mut self, proto: &Rc<Prototype>, base: usize) -> Result<Value> {
        let parent_upvalues: Vec<UpvalueRef> = {
            let frame = self.frames.last().expect("no active frame");
            let closure = frame.closure.as_ref().expect("script frame without closure");
            match &*closure.borrow() {
                HeapObject::LuaClosure(c) => c.upvalues.clone(),
                _ => Vec::new(),
            }
        };

        let mut upvalues = Vec::with_capacity(proto.upvalues.len());
        for desc in &proto.upvalues {
            if desc.in_stack {
                upvalues.push(self.find_or_create_upvalue(base + desc.index as usize));
            } else {
                let inherited = parent_upvalues
                    .get(desc.index as usize)
                    .cloned()
                    .ok_or(Error::UpvalueBounds(desc.index as usize))?;
                upvalues.push(inherited);
            }
        }

        // Reuse the cached closure when it captured the exact same
        // upvalue handles; observable sharing is part of the contract.
        let key = Rc::as_ptr(proto) as usize;
        if let Some(cached) = self.closure_cache.get(&key).and_then(Weak::upgrade) {
            let matches = match &*cached.borrow() {
                HeapObject::LuaClosure(c) => {
                    c.upvalues.len() == upvalues.len()
                        && c.upvalues
                            .iter()
                            .zip(&upvalues)
                            .all(|(a, b)| a.ptr_eq(b))
                }
                _ => false,
            };
            if matches {
                return Ok(Value::Object(ObjectRef::from_rc(cached)));
            }
        }

        let object = ObjectRef::from_rc(self.objects.alloc(HeapObject::LuaClosure(LuaClosure {
            proto: Rc::clone(proto),
            upvalues,
        })));
        self.closure_cache
            .insert(key, Rc::downgrade(object.rc()));
        Ok(Value::Object(object))
    }

    //
    // Dispatch loop
    //

    fn execute(&mut self) -> Result<()> {
        loop {
            let (base, pc, proto) = {
                let frame = self.frames.last().expect("executing without a frame");
                let proto = frame.proto.clone().expect("executing a native frame");
                (frame.base, frame.pc, proto)
            };
            let word = *proto
                .code
                .get(pc)
                .ok_or(Error::BytecodeCorrupt("program counter out of range"))?;
            let inst = Instruction(word);
            let op = inst.opcode()?;
            self.frames.last_mut().expect("frame vanished").pc = pc + 1;

            if self.config.debug_trace {
                eprintln!(
                    "ferrule: depth={} pc={} base={} {:?}",
                    self.frames.len(),
                    pc,
                    base,
                    op
                );
            }

            match op {
                OpCode::Move => {
                    let value = self.reg(base + inst.b() as usize);
                    self.set_reg(base + inst.a() as usize, value)?;
                }
                OpCode::LoadK => {
                    let value = constant_value(proto.constant(inst.bx() as usize)?);
                    self.set_reg(base + inst.a() as usize, value)?;
                }
                OpCode::LoadKx => {
                    let extra = self.fetch_extraarg(&proto)?;
                    let value = constant_value(proto.constant(extra)?);
                    self.set_reg(base + inst.a() as usize, value)?;
                }
                OpCode::LoadBool => {
                    self.set_reg(base + inst.a() as usize, Value::Boolean(inst.b() != 0))?;
                    if inst.c() != 0 {
                        self.frames.last_mut().expect("frame vanished").pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    let a = base + inst.a() as usize;
                    for i in 0..=inst.b() as usize {
                        self.set_reg(a + i, Value::Nil)?;
                    }
                }
                OpCode::GetUpval => {
                    let upvalue = self.frame_upvalue(inst.b() as usize)?;
                    let value = upvalue.get(&self.registers);
                    self.set_reg(base + inst.a() as usize, value)?;
                }
                OpCode::SetUpval => {
                    let upvalue = self.frame_upvalue(inst.b() as usize)?;
                    let value = self.reg(base + inst.a() as usize);
                    upvalue.set(&mut self.registers, value);
                }
                OpCode::GetTabUp => {
                    let upvalue = self.frame_upvalue(inst.b() as usize)?;
                    let receiver = upvalue.get(&self.registers);
                    let key = self.rk(base, &proto, inst.rk_c())?;
                    let value = table_get(&receiver, &key)?;
                    self.set_reg(base + inst.a() as usize, value)?;
                }
                OpCode::SetTabUp => {
                    let upvalue = self.frame_upvalue(inst.a() as usize)?;
                    let receiver = upvalue.get(&self.registers);
                    let key = self.rk(base, &proto, inst.rk_b())?;
                    let value = self.rk(base, &proto, inst.rk_c())?;
                    table_set(&receiver, key, value)?;
                }
                OpCode::GetTable => {
                    let receiver = self.reg(base + inst.b() as usize);
                    let key = self.rk(base, &proto, inst.rk_c())?;
                    let value = table_get(&receiver, &key)?;
                    self.set_reg(base + inst.a() as usize, value)?;
                }
                OpCode::SetTable => {
                    let receiver = self.reg(base + inst.a() as usize);
                    let key = self.rk(base, &proto, inst.rk_b())?;
                    let value = self.rk(base, &proto, inst.rk_c())?;
                    table_set(&receiver, key, value)?;
                }
                OpCode::NewTable => {
                    let table = self.alloc_table();
                    self.set_reg(base + inst.a() as usize, table)?;
                }
                OpCode::SelfOp => {
                    let receiver = self.reg(base + inst.b() as usize);
                    let key = self.rk(base, &proto, inst.rk_c())?;
                    let method = table_get(&receiver, &key)?;
                    self.set_reg(base + inst.a() as usize + 1, receiver)?;
                    self.set_reg(base + inst.a() as usize, method)?;
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Mod
                | OpCode::Pow
                | OpCode::Div
                | OpCode::IDiv
                | OpCode::BAnd
                | OpCode::BOr
                | OpCode::BXor
                | OpCode::Shl
                | OpCode::Shr => {
                    let lhs = self.rk(base, &proto, inst.rk_b())?;
                    let rhs = self.rk(base, &proto, inst.rk_c())?;
                    let result = arith(op, &lhs, &rhs)?;
                    self.set_reg(base + inst.a() as usize, result)?;
                }
                OpCode::Unm => {
                    let operand = self.reg(base + inst.b() as usize);
                    let result = match operand.to_numeric() {
                        Some(Numeric::Int(i)) => Value::Integer(i.wrapping_neg()),
                        Some(Numeric::Float(f)) => Value::Number(-f),
                        None => return Err(Error::ArithOnNonNumber(operand.type_name())),
                    };
                    self.set_reg(base + inst.a() as usize, result)?;
                }
                OpCode::BNot => {
                    let operand = self.reg(base + inst.b() as usize);
                    let i = operand_integer(&operand)?;
                    self.set_reg(base + inst.a() as usize, Value::Integer(!i))?;
                }
                OpCode::Not => {
                    let operand = self.reg(base + inst.b() as usize);
                    self.set_reg(base + inst.a() as usize, Value::Boolean(!operand.is_truthy()))?;
                }
                OpCode::Len => {
                    let operand = self.reg(base + inst.b() as usize);
                    let result = match &operand {
                        Value::Str(s) => Value::Integer(s.len() as LuaInt),
                        Value::Object(obj) => match &*obj.borrow() {
                            HeapObject::Table(t) => Value::Integer(t.sequence_len()),
                            _ => return Err(Error::LengthOnUnsupported(operand.type_name())),
                        },
                        _ => return Err(Error::LengthOnUnsupported(operand.type_name())),
                    };
                    self.set_reg(base + inst.a() as usize, result)?;
                }
                OpCode::Concat => {
                    let b = inst.b() as usize;
                    let c = inst.c() as usize;
                    let mut bytes = Vec::new();
                    for i in b..=c {
                        let piece = self.reg(base + i);
                        let s = piece
                            .to_lua_string()
                            .ok_or(Error::ConcatOnNonStringable(piece.type_name()))?;
                        bytes.extend_from_slice(s.as_bytes());
                    }
                    self.set_reg(base + inst.a() as usize, Value::Str(LuaStr::from_bytes(&bytes)))?;
                }
                OpCode::Jmp => {
                    let a = inst.a() as usize;
                    if a > 0 {
                        self.close_upvalues(base + a - 1);
                    }
                    self.jump(inst.sbx());
                }
                OpCode::Eq => {
                    let lhs = self.rk(base, &proto, inst.rk_b())?;
                    let rhs = self.rk(base, &proto, inst.rk_c())?;
                    self.conditional_skip(lhs == rhs, inst.a());
                }
                OpCode::Lt => {
                    let lhs = self.rk(base, &proto, inst.rk_b())?;
                    let rhs = self.rk(base, &proto, inst.rk_c())?;
                    let cond = value::lt(&lhs, &rhs)?;
                    self.conditional_skip(cond, inst.a());
                }
                OpCode::Le => {
                    let lhs = self.rk(base, &proto, inst.rk_b())?;
                    let rhs = self.rk(base, &proto, inst.rk_c())?;
                    let cond = value::le(&lhs, &rhs)?;
                    self.conditional_skip(cond, inst.a());
                }
                OpCode::Test => {
                    let cond = self.reg(base + inst.a() as usize).is_truthy();
                    self.conditional_skip(cond, inst.c());
                }
                OpCode::TestSet => {
                    let value = self.reg(base + inst.b() as usize);
                    if value.is_truthy() == (inst.c() != 0) {
                        self.set_reg(base + inst.a() as usize, value)?;
                    } else {
                        self.frames.last_mut().expect("frame vanished").pc += 1;
                    }
                }
                OpCode::Call => {
                    let func_idx = base + inst.a() as usize;
                    let b = inst.b() as usize;
                    if b != 0 {
                        // Fixed argument count: trim or pad to it.
                        self.ensure_registers(func_idx + b)?;
                        self.registers.truncate(func_idx + b);
                    }
                    let nreturn = inst.c() as i32 - 1;
                    if self.precall(func_idx, nreturn)? && inst.c() != 0 {
                        self.restore_frame_top()?;
                    }
                }
                OpCode::TailCall => {
                    let func_idx = base + inst.a() as usize;
                    let b = inst.b() as usize;
                    if b != 0 {
                        self.ensure_registers(func_idx + b)?;
                        self.registers.truncate(func_idx + b);
                    }
                    if self.op_tailcall(func_idx)? {
                        return Ok(());
                    }
                }
                OpCode::Return => {
                    let first = base + inst.a() as usize;
                    let b = inst.b() as usize;
                    let nres = if b == 0 {
                        self.registers.len().saturating_sub(first)
                    } else {
                        b - 1
                    };
                    if self.op_return(first, nres)? {
                        return Ok(());
                    }
                }
                OpCode::ForLoop => self.op_forloop(inst, base)?,
                OpCode::ForPrep => self.op_forprep(inst, base)?,
                OpCode::TForCall => {
                    let a = base + inst.a() as usize;
                    let func_idx = a + 3;
                    self.ensure_registers(func_idx + 3)?;
                    self.registers.truncate(func_idx + 3);
                    let (func, state, control) = (self.reg(a), self.reg(a + 1), self.reg(a + 2));
                    self.set_reg(func_idx, func)?;
                    self.set_reg(func_idx + 1, state)?;
                    self.set_reg(func_idx + 2, control)?;
                    if self.precall(func_idx, inst.c() as i32)? {
                        self.restore_frame_top()?;
                    }
                }
                OpCode::TForLoop => {
                    let a = base + inst.a() as usize;
                    let control = self.reg(a + 1);
                    if !control.is_nil() {
                        self.set_reg(a, control)?;
                        self.jump(inst.sbx());
                    }
                }
                OpCode::SetList => self.op_setlist(inst, base, &proto)?,
                OpCode::Closure => {
                    let child = proto
                        .protos
                        .get(inst.bx() as usize)
                        .cloned()
                        .ok_or(Error::BytecodeCorrupt("prototype index out of range"))?;
                    let closure = self.make_closure(&child, base)?;
                    self.set_reg(base + inst.a() as usize, closure)?;
                }
                OpCode::VarArg => self.op_vararg(inst, base)?,
                OpCode::ExtraArg => {
                    return Err(Error::BytecodeCorrupt("stray EXTRAARG"));
                }
            }
        }
    }

    /// Consume the `EXTRAARG` word the previous instruction requires.
    fn fetch_extraarg(&mut self, proto: &Prototype) -> Result<usize> {
        let frame = self.frames.last_mut().expect("frame vanished");
        let word = *proto
            .code
            .get(frame.pc)
            .ok_or(Error::BytecodeCorrupt("missing EXTRAARG"))?;
        frame.pc += 1;
        let inst = Instruction(word);
        if inst.opcode()? != OpCode::ExtraArg {
            return Err(Error::BytecodeCorrupt("expected EXTRAARG"));
        }
        Ok(inst.ax() as usize)
    }

    fn jump(&mut self, offset: i32) {
        let frame = self.frames.last_mut().expect("frame vanished");
        frame.pc = (frame.pc as i64 + offset as i64) as usize;
    }

    /// Comparison postlude: when the outcome disagrees with the operand,
    /// skip the jump that always follows.
    fn conditional_skip(&mut self, cond: bool, operand: u32) {
        if cond != (operand != 0) {
            self.frames.last_mut().expect("frame vanished").pc += 1;
        }
    }

    fn rk(&self, base: usize, proto: &Prototype, rk: (bool, usize)) -> Result<Value> {
        let (is_constant, index) = rk;
        if is_constant {
            Ok(constant_value(proto.constant(index)?))
        } else {
            Ok(self.reg(base + index))
        }
    }

    /// Return from the current script frame. True means the frame was
    /// the host entry and control leaves the dispatch loop.
    fn op_return(&mut self, first: usize, nres: usize) -> Result<bool> {
        let (frame_base, was_fresh, wanted) = {
            let frame = self.frames.last().expect("return without a frame");
            (frame.base, frame.is_fresh, frame.numresults)
        };
        self.close_upvalues(frame_base);
        self.finish_call(first, nres);
        if was_fresh {
            return Ok(true);
        }
        if wanted != MULTIRET {
            self.restore_frame_top()?;
        }
        Ok(false)
    }

    /// Tail call: reuse the current frame for the callee. True when the
    /// degenerate native path returned out of the host entry frame.
    fn op_tailcall(&mut self, func_idx: usize) -> Result<bool> {
        let (frame_func, frame_base, numresults, is_fresh) = {
            let frame = self.frames.last().expect("tail call without a frame");
            (frame.func_idx, frame.base, frame.numresults, frame.is_fresh)
        };

        if let Callee::Native(_) = self.classify_callee(func_idx)? {
            // A native target cannot reuse the frame; run it to
            // completion and return its results.
            self.precall(func_idx, MULTIRET)?;
            let nres = self.registers.len().saturating_sub(func_idx);
            return self.op_return(func_idx, nres);
        }

        self.close_upvalues(frame_base);

        // Slide callee and arguments down onto the dying frame.
        let nargs = self.registers.len() - func_idx - 1;
        for i in 0..=nargs {
            let value = self.reg(func_idx + i);
            self.set_reg(frame_func + i, value)?;
        }
        self.registers.truncate(frame_func + 1 + nargs);

        self.frames.pop();
        let pushed_script = !self.precall(frame_func, numresults)?;
        debug_assert!(pushed_script, "tail callee reclassified as native");
        if let Some(frame) = self.frames.last_mut() {
            frame.is_fresh = is_fresh;
            frame.is_tail = true;
        }
        Ok(false)
    }

    fn op_vararg(&mut self, inst: Instruction, base: usize) -> Result<()> {
        let a = base + inst.a() as usize;
        let b = inst.b() as usize;
        let varargs = {
            let frame = self.frames.last().expect("vararg without a frame");
            frame.varargs.clone()
        };
        let wanted = if b == 0 { varargs.len() } else { b - 1 };
        if b == 0 {
            self.ensure_registers(a + wanted)?;
            self.registers.truncate(a + wanted);
        }
        for i in 0..wanted {
            let value = varargs.get(i).cloned().unwrap_or(Value::Nil);
            self.set_reg(a + i, value)?;
        }
        Ok(())
    }

    fn op_setlist(&mut self, inst: Instruction, base: usize, proto: &Prototype) -> Result<()> {
        let a = base + inst.a() as usize;
        let b = inst.b() as usize;
        let count = if b == 0 {
            self.registers.len().saturating_sub(a + 1)
        } else {
            b
        };
        let block = if inst.c() == 0 {
            self.fetch_extraarg(proto)?
        } else {
            inst.c() as usize
        };
        let start = (block - 1) * Instruction::LFIELDS_PER_FLUSH;

        let receiver = self.reg(a);
        for i in 1..=count {
            let value = self.reg(a + i);
            table_set(&receiver, Value::Integer((start + i) as LuaInt), value)?;
        }
        if b == 0 {
            self.restore_frame_top()?;
        }
        Ok(())
    }

    fn op_forprep(&mut self, inst: Instruction, base: usize) -> Result<()> {
        let a = base + inst.a() as usize;
        let init = self.reg(a).to_numeric().ok_or(Error::ForLoopOnNonNumber)?;
        let limit = self
            .reg(a + 1)
            .to_numeric()
            .ok_or(Error::ForLoopOnNonNumber)?;
        let step = self
            .reg(a + 2)
            .to_numeric()
            .ok_or(Error::ForLoopOnNonNumber)?;

        match (init, step) {
            (Numeric::Int(i0), Numeric::Int(s)) => {
                if s == 0 {
                    return Err(Error::ForLoopStepZero);
                }
                let limit_i = match limit {
                    Numeric::Int(l) => l,
                    Numeric::Float(l) => for_limit(l, s),
                };
                self.set_reg(a, Value::Integer(i0.wrapping_sub(s)))?;
                self.set_reg(a + 1, Value::Integer(limit_i))?;
                self.set_reg(a + 2, Value::Integer(s))?;
            }
            _ => {
                let (i0, l, s) = (init.as_float(), limit.as_float(), step.as_float());
                if s == 0.0 {
                    return Err(Error::ForLoopStepZero);
                }
                self.set_reg(a, Value::Number(i0 - s))?;
                self.set_reg(a + 1, Value::Number(l))?;
                self.set_reg(a + 2, Value::Number(s))?;
            }
        }
        self.jump(inst.sbx());
        Ok(())
    }

    fn op_forloop(&mut self, inst: Instruction, base: usize) -> Result<()> {
        let a = base + inst.a() as usize;
        match (self.reg(a), self.reg(a + 1), self.reg(a + 2)) {
            (Value::Integer(idx), Value::Integer(limit), Value::Integer(step)) => {
                // Overflow of the index means the loop has run off the
                // representable range; treat it as completion.
                if let Some(next) = idx.checked_add(step) {
                    let continues = if step > 0 { next <= limit } else { next >= limit };
                    if continues {
                        self.set_reg(a, Value::Integer(next))?;
                        self.set_reg(a + 3, Value::Integer(next))?;
                        self.jump(inst.sbx());
                    }
                }
            }
            (idx, limit, step) => {
                let idx = idx.to_number().ok_or(Error::ForLoopOnNonNumber)?;
                let limit = limit.to_number().ok_or(Error::ForLoopOnNonNumber)?;
                let step = step.to_number().ok_or(Error::ForLoopOnNonNumber)?;
                let next = idx + step;
                let continues = if step > 0.0 { next <= limit } else { next >= limit };
                if continues {
                    self.set_reg(a, Value::Number(next))?;
                    self.set_reg(a + 3, Value::Number(next))?;
                    self.jump(inst.sbx());
                }
            }
        }
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

/// Materialize a constant-pool entry as a runtime value.
fn constant_value(constant: &Constant) -> Value {
    match constant {
        Constant::Nil => Value::Nil,
        Constant::Boolean(b) => Value::Boolean(*b),
        Constant::Integer(i) => Value::Integer(*i),
        Constant::Number(n) => Value::Number(*n),
        Constant::Str(s) => Value::Str(s.clone()),
    }
}

fn table_get(receiver: &Value, key: &Value) -> Result<Value> {
    match receiver {
        Value::Object(obj) => match &*obj.borrow() {
            HeapObject::Table(t) => Ok(t.get(key)),
            _ => Err(Error::IndexNonTable(receiver.type_name())),
        },
        _ => Err(Error::IndexNonTable(receiver.type_name())),
    }
}

fn table_set(receiver: &Value, key: Value, value: Value) -> Result<()> {
    match receiver {
        Value::Object(obj) => match &mut *obj.borrow_mut() {
            HeapObject::Table(t) => {
                t.set(key, value);
                Ok(())
            }
            _ => Err(Error::IndexNonTable(receiver.type_name())),
        },
        _ => Err(Error::IndexNonTable(receiver.type_name())),
    }
}

/// Integer view of a bitwise operand: exact or rejected.
fn operand_integer(v: &Value) -> Result<LuaInt> {
    match v.to_numeric() {
        Some(Numeric::Int(i)) => Ok(i),
        Some(Numeric::Float(f)) => {
            float_to_int_exact(f).ok_or(Error::ArithNoIntegerRepresentation)
        }
        None => Err(Error::ArithOnNonNumber(v.type_name())),
    }
}

/// Binary arithmetic dispatch shared by the arithmetic opcodes.
fn arith(op: OpCode, lhs: &Value, rhs: &Value) -> Result<Value> {
    match op {
        OpCode::BAnd | OpCode::BOr | OpCode::BXor | OpCode::Shl | OpCode::Shr => {
            let a = operand_integer(lhs)?;
            let b = operand_integer(rhs)?;
            let r = match op {
                OpCode::BAnd => a & b,
                OpCode::BOr => a | b,
                OpCode::BXor => a ^ b,
                OpCode::Shl => shift_left(a, b),
                OpCode::Shr => shift_left(a, b.wrapping_neg()),
                _ => unreachable!(),
            };
            return Ok(Value::Integer(r));
        }
        _ => {}
    }

    let a = lhs
        .to_numeric()
        .ok_or(Error::ArithOnNonNumber(lhs.type_name()))?;
    let b = rhs
        .to_numeric()
        .ok_or(Error::ArithOnNonNumber(rhs.type_name()))?;

    match op {
        // Division and exponentiation always produce floats.
        OpCode::Div => Ok(Value::Number(a.as_float() / b.as_float())),
        OpCode::Pow => Ok(Value::Number(a.as_float().powf(b.as_float()))),
        _ => match (a, b) {
            (Numeric::Int(x), Numeric::Int(y)) => int_arith(op, x, y),
            (x, y) => float_arith(op, x.as_float(), y.as_float()),
        },
    }
}

fn int_arith(op: OpCode, x: LuaInt, y: LuaInt) -> Result<Value> {
    let r = match op {
        OpCode::Add => x.wrapping_add(y),
        OpCode::Sub => x.wrapping_sub(y),
        OpCode::Mul => x.wrapping_mul(y),
        OpCode::IDiv => {
            if y == 0 {
                return Err(Error::ArithDivideByZero);
            }
            if y == -1 {
                // Avoids the MIN / -1 overflow; the result wraps.
                x.wrapping_neg()
            } else {
                let q = x / y;
                if (x % y != 0) && ((x < 0) != (y < 0)) {
                    q - 1
                } else {
                    q
                }
            }
        }
        OpCode::Mod => {
            if y == 0 {
                return Err(Error::ArithDivideByZero);
            }
            if y == -1 {
                0
            } else {
                let r = x % y;
                if r != 0 && ((r < 0) != (y < 0)) {
                    r + y
                } else {
                    r
                }
            }
        }
        _ => unreachable!("float-only op reached integer arithmetic"),
    };
    Ok(Value::Integer(r))
}

fn float_arith(op: OpCode, x: LuaNum, y: LuaNum) -> Result<Value> {
    let r = match op {
        OpCode::Add => x + y,
        OpCode::Sub => x - y,
        OpCode::Mul => x * y,
        OpCode::IDiv => (x / y).floor(),
        OpCode::Mod => {
            // Result takes the sign of the divisor.
            let m = x % y;
            if m != 0.0 && ((m < 0.0) != (y < 0.0)) {
                m + y
            } else {
                m
            }
        }
        _ => unreachable!("float-only op reached float fallback"),
    };
    Ok(Value::Number(r))
}

/// Logical shift with the language's out-of-range rules: counts past the
/// word width produce 0, negative counts shift the other way.
fn shift_left(x: LuaInt, n: LuaInt) -> LuaInt {
    if n >= 64 || n <= -64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as LuaInt
    } else {
        ((x as u64) >> -n) as LuaInt
    }
}

/// Clamp a float loop limit into the integer domain, per step direction.
fn for_limit(limit: LuaNum, step: LuaInt) -> LuaInt {
    if limit.is_nan() {
        // NaN limits never admit an iteration.
        return if step > 0 { LuaInt::MIN } else { LuaInt::MAX };
    }
    let adjusted = if step > 0 { limit.floor() } else { limit.ceil() };
    if adjusted >= LuaInt::MAX as LuaNum {
        LuaInt::MAX
    } else if adjusted <= LuaInt::MIN as LuaNum {
        LuaInt::MIN
    } else {
        adjusted as LuaInt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trip() {
        let mut vm = Vm::new();
        vm.push(Value::Integer(7)).unwrap();
        vm.push(Value::str("hi")).unwrap();
        assert_eq!(vm.stack_size(), 2);
        assert_eq!(vm.pop(), Value::str("hi"));
        assert_eq!(vm.pop(), Value::Integer(7));
        assert_eq!(vm.pop(), Value::Nil);
    }

    #[test]
    fn globals_round_trip() {
        let mut vm = Vm::new();
        vm.set_global(Value::str("answer"), Value::Integer(42));
        assert_eq!(vm.global(&Value::str("answer")), Value::Integer(42));
        vm.set_global(Value::str("answer"), Value::Nil);
        assert_eq!(vm.global(&Value::str("answer")), Value::Nil);
    }

    #[test]
    fn integer_arith_wraps() {
        let r = arith(
            OpCode::Add,
            &Value::Integer(LuaInt::MAX),
            &Value::Integer(1),
        )
        .unwrap();
        assert_eq!(r, Value::Integer(LuaInt::MIN));
    }

    #[test]
    fn division_always_floats() {
        let r = arith(OpCode::Div, &Value::Integer(7), &Value::Integer(2)).unwrap();
        assert_eq!(r, Value::Number(3.5));
    }

    #[test]
    fn floor_division_and_modulo_signs() {
        assert_eq!(
            arith(OpCode::IDiv, &Value::Integer(-7), &Value::Integer(2)).unwrap(),
            Value::Integer(-4)
        );
        assert_eq!(
            arith(OpCode::Mod, &Value::Integer(-7), &Value::Integer(2)).unwrap(),
            Value::Integer(1)
        );
        assert_eq!(
            arith(OpCode::Mod, &Value::Integer(7), &Value::Integer(-2)).unwrap(),
            Value::Integer(-1)
        );
        assert!(matches!(
            arith(OpCode::Mod, &Value::Integer(1), &Value::Integer(0)),
            Err(Error::ArithDivideByZero)
        ));
    }

    #[test]
    fn string_operands_coerce() {
        let r = arith(OpCode::Add, &Value::str("10"), &Value::Integer(1)).unwrap();
        assert_eq!(r, Value::Integer(11));
        assert!(matches!(
            arith(OpCode::Add, &Value::str("pear"), &Value::Integer(1)),
            Err(Error::ArithOnNonNumber("string"))
        ));
    }

    #[test]
    fn bitwise_requires_exact_integers() {
        assert_eq!(
            arith(OpCode::BAnd, &Value::Integer(6), &Value::Number(3.0)).unwrap(),
            Value::Integer(2)
        );
        assert!(matches!(
            arith(OpCode::BAnd, &Value::Integer(6), &Value::Number(3.5)),
            Err(Error::ArithNoIntegerRepresentation)
        ));
    }

    #[test]
    fn shifts_follow_range_rules() {
        assert_eq!(shift_left(1, 4), 16);
        assert_eq!(shift_left(1, 64), 0);
        assert_eq!(shift_left(16, -4), 1);
        assert_eq!(shift_left(-1, -56), 0xFF);
    }

    #[test]
    fn call_non_callable_reports_type() {
        let mut vm = Vm::new();
        vm.push(Value::Integer(1)).unwrap();
        assert!(matches!(
            vm.call(0, 0),
            Err(Error::CallNonCallable("number"))
        ));
        // The failed call slot was dropped.
        assert_eq!(vm.stack_size(), 0);
    }

    #[test]
    fn native_call_adjusts_results() {
        let mut vm = Vm::new();
        let f = vm.alloc_native_function(|vm| {
            vm.push(Value::Integer(1))?;
            vm.push(Value::Integer(2))?;
            Ok(2)
        });
        vm.push(f).unwrap();
        vm.call(0, 3).unwrap();
        assert_eq!(vm.stack_size(), 3);
        assert_eq!(vm.pop(), Value::Nil);
        assert_eq!(vm.pop(), Value::Integer(2));
        assert_eq!(vm.pop(), Value::Integer(1));
    }

    #[test]
    fn native_arguments_are_one_indexed() {
        let mut vm = Vm::new();
        let f = vm.alloc_native_function(|vm| {
            assert_eq!(vm.num_params(), 2);
            let a = vm.argument(1);
            let b = vm.argument(2);
            assert_eq!(vm.argument(3), Value::Nil);
            let sum = arith(OpCode::Add, &a, &b)?;
            vm.push(sum)?;
            Ok(1)
        });
        vm.push(f).unwrap();
        vm.push(Value::Integer(20)).unwrap();
        vm.push(Value::Integer(22)).unwrap();
        vm.call(2, 1).unwrap();
        assert_eq!(vm.pop(), Value::Integer(42));
    }

    #[test]
    fn object_slot_frees_after_last_drop() {
        let mut vm = Vm::new();
        let table = vm.alloc_table();
        let live_before = vm.live_objects();
        let copy1 = table.clone();
        let copy2 = table.clone();
        drop(table);
        drop(copy1);
        assert_eq!(vm.live_objects(), live_before);
        drop(copy2);
        assert_eq!(vm.live_objects(), live_before - 1);
    }
}
