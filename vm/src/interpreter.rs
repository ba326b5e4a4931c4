use std::sync::Arc;

use bytecode::{FunctionDef, Instruction, OpCode};
use heap::{HeapError, Mutator};
use object::{SlotId, SlotSpec, Value};

use crate::frame::{Frame, SAVED_STATE_SLOTS};
use crate::jit::JitFunction;
use crate::stack::Stack;
use crate::{Config, RuntimeError, VirtualMachine};

/// Interpreter registers, saved by [`ExecutionContext::run`] so a failed run
/// leaves the context as it found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Registers {
    top: usize,
    function: usize,
    ip: usize,
    bp: usize,
}

/// One interpreter thread: a stack, the current frame registers and the VM
/// it executes against.
///
/// Frames live on the stack. `bp` is the position just past the current
/// frame's saved state, `ip` indexes the current function's instructions.
/// Both are 0 when no function is executing.
///
/// Each context is a mutator of the VM's heap. While a run is in progress
/// collections stop it between instructions; otherwise the references on
/// its stack are published whenever they change.
pub struct ExecutionContext {
    vm: Arc<VirtualMachine>,
    config: Config,
    stack: Stack,
    function: usize,
    ip: usize,
    bp: usize,
    mutator: Mutator,
    running: bool,
}

impl ExecutionContext {
    pub fn new(vm: Arc<VirtualMachine>) -> Self {
        let config = vm.config().clone();
        Self::with_config(vm, config)
    }

    pub fn with_config(vm: Arc<VirtualMachine>, config: Config) -> Self {
        Self {
            stack: Stack::new(config.stack_size),
            mutator: vm.heap().register_mutator(),
            vm,
            config,
            function: 0,
            ip: 0,
            bp: 0,
            running: false,
        }
    }

    pub fn vm(&self) -> &Arc<VirtualMachine> {
        &self.vm
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn function(&self) -> usize {
        self.function
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn bp(&self) -> usize {
        self.bp
    }

    pub fn mutator(&self) -> &Mutator {
        &self.mutator
    }

    /// Empty the stack and clear the frame registers.
    pub fn reset(&mut self) {
        self.stack.reset();
        self.function = 0;
        self.ip = 0;
        self.bp = 0;
        if !self.running {
            self.mutator.publish(&*self);
        }
    }

    // ── operand stack ──────────────────────────────────────────────

    #[inline(always)]
    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.stack.push(value)?;
        if !self.running && value.is_ref() {
            self.mutator.publish(&*self);
        }
        Ok(())
    }

    /// Pop an operand. Never reaches into the current frame's saved state.
    #[inline(always)]
    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        if self.stack.top() <= self.bp {
            return Err(RuntimeError::StackUnderflow);
        }
        let value = self.stack.pop()?;
        if !self.running && value.is_ref() {
            self.mutator.publish(&*self);
        }
        Ok(value)
    }

    #[inline(always)]
    pub fn peek(&self) -> Result<Value, RuntimeError> {
        if self.stack.top() <= self.bp {
            return Err(RuntimeError::StackUnderflow);
        }
        self.stack.peek()
    }

    pub fn pop_int(&mut self) -> Result<i64, RuntimeError> {
        let value = self.pop()?;
        value.as_int48().ok_or(RuntimeError::TypeMismatch {
            expected: "int48",
            got: value,
        })
    }

    // ── entry points ───────────────────────────────────────────────

    /// Run function `target` with `args` and return its result.
    ///
    /// The argument count is checked before anything is pushed. On failure
    /// the stack and registers are restored to their state at entry.
    pub fn run(&mut self, target: usize, args: &[Value]) -> Result<Value, RuntimeError> {
        let vm = Arc::clone(&self.vm);
        let callee = vm.get_function(target)?;
        if args.len() != callee.nargs as usize {
            return Err(RuntimeError::ArityMismatch {
                function: target,
                expected: callee.nargs,
                got: args.len(),
            });
        }

        let outermost = !self.running;
        if outermost {
            self.mutator.enter();
            self.running = true;
        }

        let saved = self.registers();
        let result = self.run_checked(target, callee, args);
        if let Err(err) = &result {
            log::debug!("run of '{}' failed: {err}", callee.name);
            self.restore_registers(saved);
        }

        if outermost {
            self.running = false;
            self.mutator.leave(&*self);
        }
        result
    }

    /// Run a function that takes no arguments.
    pub fn run0(&mut self, target: usize) -> Result<Value, RuntimeError> {
        self.run(target, &[])
    }

    fn run_checked(
        &mut self,
        target: usize,
        callee: &FunctionDef,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        for &arg in args {
            self.push(arg)?;
        }

        if let Some(jit) = self.jit_entry(target) {
            return self.call_jit_function(jit, callee.nargs as usize);
        }

        self.enter_call(target)?;
        let entry_bp = self.bp;
        self.interpret(entry_bp)?;
        self.pop()
    }

    fn registers(&self) -> Registers {
        Registers {
            top: self.stack.top(),
            function: self.function,
            ip: self.ip,
            bp: self.bp,
        }
    }

    fn restore_registers(&mut self, saved: Registers) {
        if self.stack.top() >= saved.top {
            self.stack.restore(saved.top);
        }
        self.function = saved.function;
        self.ip = saved.ip;
        self.bp = saved.bp;
    }

    fn jit_entry(&self, target: usize) -> Option<JitFunction> {
        if self.config.jit {
            self.vm.jit_function(target)
        } else {
            None
        }
    }

    // ── call protocol ──────────────────────────────────────────────

    /// Push a frame for `target`, whose arguments are already on the stack,
    /// and make it current.
    pub fn enter_call(&mut self, target: usize) -> Result<(), RuntimeError> {
        let vm = Arc::clone(&self.vm);
        let callee = vm.get_function(target)?;

        self.stack.pushn(callee.nregs as usize)?;
        self.stack.push(Value::from_uint48(self.function as u64))?;
        self.stack.push(Value::from_ptr(self.ip))?;
        self.stack.push(Value::from_ptr(self.bp))?;

        log::debug!("enter '{}' (#{target}) at bp {}", callee.name, self.stack.top());
        self.function = target;
        self.ip = 0;
        self.bp = self.stack.top();
        Ok(())
    }

    /// Tear down the current frame and resume the caller's registers.
    ///
    /// The caller's `ip` is restored verbatim, still pointing at the call.
    pub fn exit_call(&mut self) -> Result<(), RuntimeError> {
        let vm = Arc::clone(&self.vm);
        let callee = vm.get_function(self.function)?;
        if self.bp < SAVED_STATE_SLOTS {
            return Err(RuntimeError::StackUnderflow);
        }

        self.stack.restore(self.bp);
        let bp = Self::saved_position(self.stack.pop()?, "saved base pointer")?;
        let ip = Self::saved_position(self.stack.pop()?, "saved instruction pointer")?;
        let saved_function = self.stack.pop()?;
        let function = saved_function.as_uint48().ok_or(RuntimeError::TypeMismatch {
            expected: "saved function index",
            got: saved_function,
        })?;

        self.stack.popn(callee.nvars() as usize)?;
        log::debug!("exit '{}' (#{})", callee.name, self.function);
        self.function = function as usize;
        self.ip = ip;
        self.bp = bp;
        Ok(())
    }

    fn saved_position(value: Value, expected: &'static str) -> Result<usize, RuntimeError> {
        value
            .as_ptr()
            .ok_or(RuntimeError::TypeMismatch { expected, got: value })
    }

    /// The frame view of the current function.
    pub fn frame(&self) -> Result<Frame, RuntimeError> {
        Ok(Frame::new(self.bp, self.vm.get_function(self.function)?))
    }

    // ── dispatch loop ──────────────────────────────────────────────

    /// Execute until the frame whose base pointer is `entry_bp` returns.
    fn interpret(&mut self, entry_bp: usize) -> Result<(), RuntimeError> {
        let vm = Arc::clone(&self.vm);
        loop {
            self.mutator.safepoint(&*self);
            let function = vm.get_function(self.function)?;
            let instruction = self.fetch(function)?;
            let op = instruction.opcode().map_err(|byte| RuntimeError::UnknownOpcode {
                byte,
                function: self.function,
                ip: self.ip,
            })?;
            let immediate = instruction.immediate();
            log::trace!("{}:{:<4} {}", function.name, self.ip, instruction);

            match op {
                OpCode::EndSection => {
                    return Err(RuntimeError::UnexpectedEndOfFunction {
                        function: self.function,
                        ip: self.ip,
                    });
                }
                OpCode::FunctionCall => self.do_function_call(immediate)?,
                OpCode::FunctionReturn => {
                    if self.do_function_return(entry_bp)? {
                        return Ok(());
                    }
                }
                OpCode::PrimitiveCall => self.do_primitive_call(immediate)?,
                OpCode::Jmp => self.jump(immediate)?,
                OpCode::Duplicate => {
                    let top = self.peek()?;
                    self.push(top)?;
                    self.advance();
                }
                OpCode::Drop => {
                    self.pop()?;
                    self.advance();
                }
                OpCode::PushFromVar => {
                    let position = Frame::new(self.bp, function).local(immediate)?;
                    let value = self
                        .stack
                        .get(position)
                        .ok_or(RuntimeError::StackUnderflow)?;
                    self.push(value)?;
                    self.advance();
                }
                OpCode::PopIntoVar => {
                    let position = Frame::new(self.bp, function).local(immediate)?;
                    let value = self.pop()?;
                    self.stack.set(position, value)?;
                    self.advance();
                }
                OpCode::IntPushConstant | OpCode::StrPushConstant => {
                    self.push(Value::from_int48(immediate as i64))?;
                    self.advance();
                }
                OpCode::IntAdd => self.int_binary(|l, r| Ok(l.wrapping_add(r)))?,
                OpCode::IntSub => self.int_binary(|l, r| Ok(l.wrapping_sub(r)))?,
                OpCode::IntMul => self.int_binary(|l, r| Ok(l.wrapping_mul(r)))?,
                OpCode::IntDiv => self.int_binary(|l, r| {
                    if r == 0 {
                        return Err(RuntimeError::DivideByZero);
                    }
                    Ok(l.wrapping_div(r))
                })?,
                OpCode::IntNot => {
                    let x = self.pop_int()?;
                    self.push(Value::from_int48((x == 0) as i64))?;
                    self.advance();
                }
                OpCode::IntJmpEq => self.int_jump(immediate, |l, r| l == r)?,
                OpCode::IntJmpNeq => self.int_jump(immediate, |l, r| l != r)?,
                OpCode::IntJmpGt => self.int_jump(immediate, |l, r| l > r)?,
                OpCode::IntJmpGe => self.int_jump(immediate, |l, r| l >= r)?,
                OpCode::IntJmpLt => self.int_jump(immediate, |l, r| l < r)?,
                OpCode::IntJmpLe => self.int_jump(immediate, |l, r| l <= r)?,
                OpCode::NewObject => {
                    let object = vm.heap().allocate_empty_object(&*self);
                    self.push(Value::from_ref(object))?;
                    self.advance();
                }
                OpCode::PushFromObject => self.do_push_from_object(&vm, immediate)?,
                OpCode::PopIntoObject => self.do_pop_into_object(&vm, immediate)?,
                OpCode::CallIndirect => return Err(RuntimeError::Unsupported(op)),
                OpCode::SystemCollect => {
                    vm.heap().request_full_collection(&*self);
                    if self.config.verbose {
                        log::info!("collection requested: {:?}", vm.heap().stats());
                    }
                    self.advance();
                }
            }
        }
    }

    #[inline(always)]
    fn fetch(&self, function: &FunctionDef) -> Result<Instruction, RuntimeError> {
        function
            .instructions
            .get(self.ip)
            .copied()
            .ok_or(RuntimeError::UnexpectedEndOfFunction {
                function: self.function,
                ip: self.ip,
            })
    }

    #[inline(always)]
    fn advance(&mut self) {
        self.ip += 1;
    }

    /// `ip += offset + 1`
    fn jump(&mut self, offset: i32) -> Result<(), RuntimeError> {
        let target = self.ip as i64 + offset as i64 + 1;
        if target < 0 {
            return Err(RuntimeError::InvalidJump {
                function: self.function,
                ip: self.ip,
                offset,
            });
        }
        self.ip = target as usize;
        Ok(())
    }

    fn index(op: OpCode, immediate: i32) -> Result<usize, RuntimeError> {
        usize::try_from(immediate).map_err(|_| RuntimeError::InvalidImmediate { op, immediate })
    }

    fn slot(op: OpCode, immediate: i32) -> Result<SlotId, RuntimeError> {
        u32::try_from(immediate)
            .map(SlotId)
            .map_err(|_| RuntimeError::InvalidImmediate { op, immediate })
    }

    fn int_binary(
        &mut self,
        f: impl FnOnce(i64, i64) -> Result<i64, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        self.push(Value::from_int48(f(left, right)?))?;
        self.advance();
        Ok(())
    }

    fn int_jump(
        &mut self,
        offset: i32,
        condition: impl FnOnce(i64, i64) -> bool,
    ) -> Result<(), RuntimeError> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        if condition(left, right) {
            self.jump(offset)
        } else {
            self.advance();
            Ok(())
        }
    }

    // ── handlers ───────────────────────────────────────────────────

    fn do_function_call(&mut self, immediate: i32) -> Result<(), RuntimeError> {
        let target = Self::index(OpCode::FunctionCall, immediate)?;
        match self.jit_entry(target) {
            Some(jit) => {
                let nargs = self.vm.get_function(target)?.nargs as usize;
                let result = self.call_jit_function(jit, nargs)?;
                self.push(result)?;
                self.advance();
                Ok(())
            }
            None => self.enter_call(target),
        }
    }

    /// Returns whether the frame entered at `entry_bp` just returned.
    fn do_function_return(&mut self, entry_bp: usize) -> Result<bool, RuntimeError> {
        let result = self.pop()?;
        let returning = self.bp;
        self.exit_call()?;
        self.push(result)?;
        if returning == entry_bp {
            return Ok(true);
        }
        self.advance();
        Ok(false)
    }

    fn do_primitive_call(&mut self, immediate: i32) -> Result<(), RuntimeError> {
        let index = Self::index(OpCode::PrimitiveCall, immediate)?;
        let primitive = self.vm.get_primitive(index)?;
        primitive(self)?;
        self.advance();
        Ok(())
    }

    // ( object -- value )
    fn do_push_from_object(
        &mut self,
        vm: &VirtualMachine,
        immediate: i32,
    ) -> Result<(), RuntimeError> {
        let slot = Self::slot(OpCode::PushFromObject, immediate)?;
        let target = self.pop()?;
        let object = target.as_object().ok_or(RuntimeError::NotAnObject(target))?;
        let descriptor = vm
            .heap()
            .lookup_slot(object, slot)?
            .ok_or(RuntimeError::NoSuchSlot(slot))?;
        let value = vm.heap().get_value(object, descriptor)?;
        self.push(value)?;
        self.advance();
        Ok(())
    }

    // ( value object -- )
    fn do_pop_into_object(
        &mut self,
        vm: &VirtualMachine,
        immediate: i32,
    ) -> Result<(), RuntimeError> {
        let slot = Self::slot(OpCode::PopIntoObject, immediate)?;
        let target = self.peek()?;
        let mut object = target.as_object().ok_or(RuntimeError::NotAnObject(target))?;
        self.pop()?;
        // The value must exist before the object is reshaped. It stays on
        // the stack, rooted, until it is stored.
        self.peek()?;

        let heap = vm.heap();
        let descriptor = match heap.lookup_slot(object, slot)? {
            Some(descriptor) => descriptor,
            None => {
                // The transition may collect; only the root keeps the object
                // alive and its reference must be read back afterwards.
                let root = heap.root(object);
                heap.transition_layout(&*self, &root, SlotSpec::value(slot))?;
                object = root.get().ok_or(HeapError::ReleasedHandle)?;
                heap.lookup_slot(object, slot)?
                    .ok_or(RuntimeError::NoSuchSlot(slot))?
            }
        };

        let value = self.pop()?;
        heap.set_value(object, descriptor, value)?;
        self.advance();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytecode::{FunctionBuilder, FunctionDef, Instruction, OpCode};
    use heap::HeapSettings;
    use object::{INT48_MAX, INT48_MIN, ObjectRef, ShapeId, SlotId, Value, ValueKind};

    use super::*;
    use crate::{JitFunction, VirtualMachine};

    fn int(n: i64) -> Value {
        Value::from_int48(n)
    }

    fn function(
        name: &str,
        nargs: u32,
        nregs: u32,
        emit: impl FnOnce(&mut FunctionBuilder),
    ) -> FunctionDef {
        let mut b = FunctionBuilder::new(name, nargs, nregs);
        emit(&mut b);
        b.finish().expect("immediates in range")
    }

    fn add2() -> FunctionDef {
        function("add2", 2, 0, |b| {
            b.push_from_var(0).push_from_var(1).int_add().function_return();
        })
    }

    fn vm_with(config: Config, functions: Vec<FunctionDef>) -> VirtualMachine {
        let mut vm = VirtualMachine::new(config);
        for f in functions {
            vm.load_function(f);
        }
        vm
    }

    fn context(functions: Vec<FunctionDef>) -> ExecutionContext {
        ExecutionContext::new(Arc::new(vm_with(Config::default(), functions)))
    }

    fn assert_idle(cx: &ExecutionContext) {
        assert_eq!(cx.stack().top(), 0);
        assert_eq!((cx.function(), cx.ip(), cx.bp()), (0, 0, 0));
    }

    // ── call protocol ─────────────────────────────────────────────────

    #[test]
    fn add2_returns_sum() {
        let mut cx = context(vec![add2()]);
        assert_eq!(cx.run(0, &[int(3), int(4)]), Ok(int(7)));
        assert_idle(&cx);
    }

    #[test]
    fn arity_mismatch_leaves_stack_alone() {
        let mut cx = context(vec![add2()]);
        cx.push(int(9)).expect("push");

        assert_eq!(
            cx.run(0, &[int(1)]),
            Err(RuntimeError::ArityMismatch {
                function: 0,
                expected: 2,
                got: 1
            })
        );
        assert_eq!(cx.stack().as_slice(), &[int(9)]);
        assert!(matches!(cx.run0(0), Err(RuntimeError::ArityMismatch { .. })));
        assert_eq!(cx.stack().top(), 1);
        assert_eq!(cx.bp(), 0);
    }

    #[test]
    fn enter_call_lays_out_frame() {
        let callee = function("f", 1, 2, |b| {
            b.int_push_constant(0).function_return();
        });
        let mut cx = context(vec![callee]);
        cx.push(int(41)).expect("arg");
        cx.enter_call(0).expect("enter");

        let frame = cx.frame().expect("frame");
        assert_eq!(cx.bp(), 1 + 2 + 3);
        assert_eq!(frame.local(0), Ok(0));
        assert_eq!(cx.stack().get(0), Some(int(41)));
        assert_eq!(cx.stack().get(1), Some(Value::UNINITIALIZED));
        assert_eq!(cx.stack().get(frame.saved_function_slot()), Some(Value::from_uint48(0)));
        assert_eq!(cx.stack().get(frame.saved_ip_slot()), Some(Value::from_ptr(0)));
        assert_eq!(cx.stack().get(frame.saved_bp_slot()), Some(Value::from_ptr(0)));
        assert_eq!((cx.function(), cx.ip()), (0, 0));
    }

    #[test]
    fn nested_frames_unwind_lifo() {
        let outer = function("outer", 0, 1, |_| {});
        let inner = function("inner", 2, 1, |_| {});
        let mut cx = context(vec![outer, inner]);

        let start = cx.stack().top();
        cx.enter_call(0).expect("enter outer");
        let outer_bp = cx.bp();

        cx.push(int(1)).expect("arg");
        cx.push(int(2)).expect("arg");
        let before_args = cx.stack().top() - 2;
        cx.enter_call(1).expect("enter inner");
        cx.push(int(99)).expect("scratch");

        cx.exit_call().expect("exit inner");
        assert_eq!(cx.stack().top(), before_args);
        assert_eq!((cx.function(), cx.bp()), (0, outer_bp));
        cx.push(int(3)).expect("inner result");

        cx.exit_call().expect("exit outer");
        cx.push(int(4)).expect("outer result");
        assert_eq!(cx.stack().top(), start + 1);
        assert_eq!(cx.bp(), 0);
    }

    #[test]
    fn exit_call_without_frame() {
        let mut cx = context(vec![add2()]);
        assert_eq!(cx.exit_call(), Err(RuntimeError::StackUnderflow));
    }

    #[test]
    fn calls_resume_after_call_site() {
        let main = function("main", 0, 0, |b| {
            b.int_push_constant(3).int_push_constant(4).function_call(1);
            b.int_push_constant(10).int_mul().function_return();
        });
        let mut cx = context(vec![main, add2()]);
        assert_eq!(cx.run0(0), Ok(int(70)));
        assert_idle(&cx);
    }

    #[test]
    fn operand_pops_stop_at_frame() {
        let f = function("f", 1, 0, |b| {
            b.drop_top().function_return();
        });
        let mut cx = context(vec![f]);
        assert_eq!(cx.run(0, &[int(1)]), Err(RuntimeError::StackUnderflow));
        assert_idle(&cx);
    }

    // ── variables ─────────────────────────────────────────────────────

    #[test]
    fn var_round_trip() {
        let f = function("f", 1, 1, |b| {
            b.int_push_constant(42).pop_into_var(1).push_from_var(1).function_return();
        });
        let mut cx = context(vec![f]);
        assert_eq!(cx.run(0, &[int(7)]), Ok(int(42)));
    }

    #[test]
    fn pop_into_var_overwrites_argument() {
        let f = function("f", 1, 0, |b| {
            b.int_push_constant(5).pop_into_var(0).push_from_var(0).function_return();
        });
        let mut cx = context(vec![f]);
        assert_eq!(cx.run(0, &[int(7)]), Ok(int(5)));
    }

    #[test]
    fn locals_start_uninitialized() {
        let f = function("f", 0, 1, |b| {
            b.push_from_var(0).function_return();
        });
        let mut cx = context(vec![f]);
        assert_eq!(cx.run0(0), Ok(Value::UNINITIALIZED));
    }

    #[test]
    fn variable_index_checked() {
        let f = function("f", 1, 1, |b| {
            b.push_from_var(2).function_return();
        });
        let mut cx = context(vec![f]);
        assert_eq!(
            cx.run(0, &[int(0)]),
            Err(RuntimeError::VariableOutOfRange { index: 2, nvars: 2 })
        );
        assert_idle(&cx);
    }

    // ── stack ops & constants ─────────────────────────────────────────

    #[test]
    fn duplicate_and_drop() {
        let f = function("f", 0, 0, |b| {
            b.int_push_constant(5).duplicate().int_add();
            b.int_push_constant(9).drop_top().function_return();
        });
        let mut cx = context(vec![f]);
        assert_eq!(cx.run0(0), Ok(int(10)));
    }

    #[test]
    fn constants_are_integers() {
        let f = function("f", 0, 0, |b| {
            b.int_push_constant(-12).str_push_constant(7).int_sub().function_return();
        });
        let mut cx = context(vec![f]);
        assert_eq!(cx.run0(0), Ok(int(-19)));
    }

    // ── arithmetic ────────────────────────────────────────────────────

    fn binary(op: OpCode) -> FunctionDef {
        function("binary", 2, 0, |b| {
            b.push_from_var(0).push_from_var(1).emit(op, 0).function_return();
        })
    }

    #[test]
    fn integer_arithmetic() {
        let cases = [
            (OpCode::IntAdd, 3, 4, 7),
            (OpCode::IntSub, 3, 10, -7),
            (OpCode::IntMul, -6, 7, -42),
            (OpCode::IntDiv, 7, 2, 3),
            (OpCode::IntDiv, -7, 2, -3),
        ];
        for (op, left, right, expected) in cases {
            let mut cx = context(vec![binary(op)]);
            assert_eq!(cx.run(0, &[int(left), int(right)]), Ok(int(expected)), "{op}");
        }
    }

    #[test]
    fn arithmetic_wraps_at_48_bits() {
        let mut cx = context(vec![binary(OpCode::IntAdd)]);
        assert_eq!(cx.run(0, &[int(INT48_MAX), int(1)]), Ok(int(INT48_MIN)));

        let mut cx = context(vec![binary(OpCode::IntMul)]);
        assert_eq!(cx.run(0, &[int(INT48_MIN), int(-1)]), Ok(int(INT48_MIN)));

        let mut cx = context(vec![binary(OpCode::IntDiv)]);
        assert_eq!(cx.run(0, &[int(INT48_MIN), int(-1)]), Ok(int(INT48_MIN)));
    }

    #[test]
    fn divide_by_zero_fails() {
        let mut cx = context(vec![binary(OpCode::IntDiv)]);
        assert_eq!(cx.run(0, &[int(1), int(0)]), Err(RuntimeError::DivideByZero));
        assert_idle(&cx);
    }

    #[test]
    fn int_not() {
        let f = function("not", 1, 0, |b| {
            b.push_from_var(0).int_not().function_return();
        });
        let mut cx = context(vec![f]);
        assert_eq!(cx.run(0, &[int(0)]), Ok(int(1)));
        assert_eq!(cx.run(0, &[int(5)]), Ok(int(0)));
        assert_eq!(cx.run(0, &[int(-1)]), Ok(int(0)));
    }

    #[test]
    fn arithmetic_requires_integers() {
        let f = function("f", 1, 0, |b| {
            b.push_from_var(0).int_push_constant(1).int_add().function_return();
        });
        let mut cx = context(vec![f]);
        let not_int = Value::from_uint48(1);
        assert_eq!(
            cx.run(0, &[not_int]),
            Err(RuntimeError::TypeMismatch {
                expected: "int48",
                got: not_int
            })
        );
    }

    // ── jumps ─────────────────────────────────────────────────────────

    #[test]
    fn jmp_skips_instructions() {
        let f = function("f", 0, 0, |b| {
            b.emit(OpCode::Jmp, 2); // 0 -> 3
            b.int_push_constant(1).function_return();
            b.int_push_constant(3).function_return();
        });
        let mut cx = context(vec![f]);
        assert_eq!(cx.run0(0), Ok(int(3)));
    }

    #[test]
    fn conditional_jumps() {
        let cases = [
            (OpCode::IntJmpEq, [(2, 2, true), (1, 2, false)]),
            (OpCode::IntJmpNeq, [(1, 2, true), (2, 2, false)]),
            (OpCode::IntJmpGt, [(3, 2, true), (-3, 2, false)]),
            (OpCode::IntJmpGe, [(2, 2, true), (1, 2, false)]),
            (OpCode::IntJmpLt, [(INT48_MIN, INT48_MAX, true), (2, 2, false)]),
            (OpCode::IntJmpLe, [(-5, -5, true), (INT48_MAX, INT48_MIN, false)]),
        ];
        for (op, pairs) in cases {
            let f = function("cmp", 2, 0, |b| {
                b.push_from_var(0).push_from_var(1);
                let taken = b.jump_if(op);
                b.int_push_constant(0).function_return();
                b.bind(taken);
                b.int_push_constant(1).function_return();
            });
            let mut cx = context(vec![f]);
            for (left, right, taken) in pairs {
                assert_eq!(
                    cx.run(0, &[int(left), int(right)]),
                    Ok(int(taken as i64)),
                    "{op} {left} {right}"
                );
                assert_idle(&cx);
            }
        }
    }

    #[test]
    fn backward_jump_before_start_fails() {
        let f = function("f", 0, 0, |b| {
            b.emit(OpCode::Jmp, -5);
        });
        let mut cx = context(vec![f]);
        assert_eq!(
            cx.run0(0),
            Err(RuntimeError::InvalidJump {
                function: 0,
                ip: 0,
                offset: -5
            })
        );
    }

    // ── termination & decoding ────────────────────────────────────────

    #[test]
    fn end_section_is_not_a_return() {
        let f = function("f", 0, 0, |b| {
            b.int_push_constant(1);
        });
        let mut cx = context(vec![f]);
        assert_eq!(
            cx.run0(0),
            Err(RuntimeError::UnexpectedEndOfFunction { function: 0, ip: 1 })
        );
        assert_idle(&cx);
    }

    #[test]
    fn running_off_unterminated_code() {
        let mut b = FunctionBuilder::new("f", 0, 0);
        b.int_push_constant(1);
        let mut cx = context(vec![b.finish_unterminated().expect("immediates in range")]);
        assert_eq!(
            cx.run0(0),
            Err(RuntimeError::UnexpectedEndOfFunction { function: 0, ip: 1 })
        );
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let f = FunctionDef::new("f", 0, 0, vec![Instruction::from_raw(0xFE00_0000)]);
        let mut cx = context(vec![f]);
        assert_eq!(
            cx.run0(0),
            Err(RuntimeError::UnknownOpcode {
                byte: 0xFE,
                function: 0,
                ip: 0
            })
        );
    }

    #[test]
    fn call_indirect_is_unsupported() {
        let empty = function("empty", 0, 0, |b| {
            b.call_indirect();
        });
        let loaded = function("loaded", 0, 0, |b| {
            b.int_push_constant(1).new_object().call_indirect();
        });
        let mut cx = context(vec![empty, loaded]);
        assert_eq!(cx.run0(0), Err(RuntimeError::Unsupported(OpCode::CallIndirect)));
        assert_eq!(cx.run0(1), Err(RuntimeError::Unsupported(OpCode::CallIndirect)));
        assert_idle(&cx);
    }

    #[test]
    fn unknown_targets() {
        let call = function("call", 0, 0, |b| {
            b.function_call(9);
        });
        let prim = function("prim", 0, 0, |b| {
            b.primitive_call(3);
        });
        let negative = function("negative", 0, 0, |b| {
            b.emit(OpCode::FunctionCall, -1);
        });
        let mut cx = context(vec![call, prim, negative]);
        assert_eq!(cx.run0(0), Err(RuntimeError::UnknownFunction(9)));
        assert_eq!(cx.run0(1), Err(RuntimeError::UnknownPrimitive(3)));
        assert_eq!(
            cx.run0(2),
            Err(RuntimeError::InvalidImmediate {
                op: OpCode::FunctionCall,
                immediate: -1
            })
        );
        assert_eq!(cx.run0(5), Err(RuntimeError::UnknownFunction(5)));
    }

    #[test]
    fn runaway_recursion_overflows() {
        let f = function("f", 0, 1, |b| {
            b.function_call(0);
        });
        let config = Config {
            stack_size: 64,
            ..Config::default()
        };
        let mut cx = ExecutionContext::new(Arc::new(vm_with(config, vec![f])));
        assert_eq!(cx.run0(0), Err(RuntimeError::StackOverflow));
        assert_idle(&cx);
    }

    #[test]
    fn reset_clears_registers() {
        let mut cx = context(vec![add2()]);
        cx.push(int(1)).expect("push");
        cx.push(int(2)).expect("push");
        cx.enter_call(0).expect("enter");
        cx.reset();
        assert_idle(&cx);
    }

    // ── primitives ────────────────────────────────────────────────────

    fn double(cx: &mut ExecutionContext) -> Result<(), RuntimeError> {
        let n = cx.pop()?;
        let add = cx
            .vm()
            .function_index("add2")
            .ok_or_else(|| RuntimeError::UnknownFunctionName("add2".to_string()))?;
        let result = cx.run(add, &[n, n])?;
        cx.push(result)
    }

    fn fail(_cx: &mut ExecutionContext) -> Result<(), RuntimeError> {
        Err(RuntimeError::DivideByZero)
    }

    #[test]
    fn primitive_reenters_interpreter() {
        let main = function("main", 0, 0, |b| {
            b.int_push_constant(21).primitive_call(0);
            b.int_push_constant(1).int_add().function_return();
        });
        let mut vm = vm_with(Config::default(), vec![main, add2()]);
        vm.register_primitive("double", double);
        let mut cx = ExecutionContext::new(Arc::new(vm));

        assert_eq!(cx.run0(0), Ok(int(43)));
        assert_idle(&cx);
    }

    #[test]
    fn primitive_failure_unwinds_run() {
        let main = function("main", 0, 0, |b| {
            b.int_push_constant(1).primitive_call(0).function_return();
        });
        let mut vm = vm_with(Config::default(), vec![main]);
        vm.register_primitive("fail", fail);
        let mut cx = ExecutionContext::new(Arc::new(vm));

        assert_eq!(cx.run0(0), Err(RuntimeError::DivideByZero));
        assert_idle(&cx);
    }

    // ── objects ───────────────────────────────────────────────────────

    const X: u32 = 0;
    const Y: u32 = 1;

    /// Builds `{x: 5, y: 6}` in the given slot order and returns it.
    fn make_object(first: u32, second: u32) -> FunctionDef {
        function("make", 0, 1, |b| {
            b.new_object().pop_into_var(0);
            b.int_push_constant(5).push_from_var(0).pop_into_object(first);
            b.int_push_constant(6).push_from_var(0).pop_into_object(second);
            b.push_from_var(0).function_return();
        })
    }

    fn object_of(value: Value) -> ObjectRef {
        value.as_object().expect("object reference")
    }

    #[test]
    fn store_then_load_slot() {
        let f = function("f", 0, 1, |b| {
            b.new_object().pop_into_var(0);
            b.int_push_constant(5).push_from_var(0).pop_into_object(X);
            b.push_from_var(0).push_from_object(X).function_return();
        });
        let mut cx = context(vec![f]);
        assert_eq!(cx.run0(0), Ok(int(5)));
    }

    #[test]
    fn equal_insertion_order_shares_shape() {
        let mut cx = context(vec![make_object(X, Y), make_object(X, Y), make_object(Y, X)]);
        let heap = cx.vm().heap().clone();

        let a = object_of(cx.run0(0).expect("first object"));
        let b = object_of(cx.run0(1).expect("second object"));
        assert_ne!(a, b);
        assert_eq!(heap.shape_of(a), heap.shape_of(b));

        // empty, {x}, {x, y}
        assert_eq!(heap.shapes().len(), 3);

        let c = object_of(cx.run0(2).expect("reversed object"));
        assert_ne!(heap.shape_of(a), heap.shape_of(c));
        assert_eq!(heap.shapes().len(), 5);
    }

    #[test]
    fn overwriting_a_slot_keeps_shape() {
        let f = function("f", 0, 1, |b| {
            b.new_object().pop_into_var(0);
            b.int_push_constant(1).push_from_var(0).pop_into_object(X);
            b.int_push_constant(2).push_from_var(0).pop_into_object(X);
            b.push_from_var(0).function_return();
        });
        let mut cx = context(vec![f]);
        let heap = cx.vm().heap().clone();

        let object = object_of(cx.run0(0).expect("object"));
        let shape = heap.shapes().get(heap.shape_of(object).expect("live")).expect("shape");
        assert_eq!(shape.slot_count(), 1);
        let descriptor = heap
            .lookup_slot(object, SlotId(X))
            .expect("live")
            .expect("slot x");
        assert_eq!(heap.get_value(object, descriptor), Ok(int(2)));
    }

    #[test]
    fn field_access_on_non_objects() {
        let load = function("load", 0, 0, |b| {
            b.int_push_constant(1).push_from_object(X).function_return();
        });
        let store = function("store", 0, 0, |b| {
            b.int_push_constant(1).int_push_constant(2).pop_into_object(X);
        });
        let mut cx = context(vec![load, store]);
        assert_eq!(cx.run0(0), Err(RuntimeError::NotAnObject(int(1))));
        assert_eq!(cx.run0(1), Err(RuntimeError::NotAnObject(int(2))));
        assert_idle(&cx);
    }

    #[test]
    fn missing_slot_fails() {
        let f = function("f", 0, 0, |b| {
            b.new_object().push_from_object(3).function_return();
        });
        let mut cx = context(vec![f]);
        assert_eq!(cx.run0(0), Err(RuntimeError::NoSuchSlot(SlotId(3))));
    }

    #[test]
    fn negative_slot_immediates_are_rejected() {
        let load = function("load", 0, 0, |b| {
            b.new_object().emit(OpCode::PushFromObject, -1);
        });
        let store = function("store", 0, 0, |b| {
            b.int_push_constant(1).new_object().emit(OpCode::PopIntoObject, -2);
        });
        let mut cx = context(vec![load, store]);
        assert_eq!(
            cx.run0(0),
            Err(RuntimeError::InvalidImmediate {
                op: OpCode::PushFromObject,
                immediate: -1
            })
        );
        assert_eq!(
            cx.run0(1),
            Err(RuntimeError::InvalidImmediate {
                op: OpCode::PopIntoObject,
                immediate: -2
            })
        );
        assert_idle(&cx);
    }

    #[test]
    fn store_without_value_leaves_object_unchanged() {
        let empty = function("empty", 0, 0, |b| {
            b.new_object().function_return();
        });
        let store = function("store", 1, 0, |b| {
            b.push_from_var(0).pop_into_object(X);
            b.int_push_constant(0).function_return();
        });
        let load = function("load", 1, 0, |b| {
            b.push_from_var(0).push_from_object(X).function_return();
        });
        let mut cx = context(vec![empty, store, load]);
        let heap = cx.vm().heap().clone();

        let object = cx.run0(0).expect("object");
        assert_eq!(cx.run(1, &[object]), Err(RuntimeError::StackUnderflow));
        assert_eq!(heap.shape_of(object_of(object)), Ok(ShapeId::EMPTY));
        assert_eq!(cx.run(2, &[object]), Err(RuntimeError::NoSuchSlot(SlotId(X))));
        assert_eq!(heap.shapes().len(), 1);
    }

    #[test]
    fn object_rooted_across_collecting_transition() {
        // Allocations and the transition together reach the threshold, so
        // the store collects while the target object is off the stack.
        let f = function("f", 0, 0, |b| {
            b.new_object().drop_top();
            b.int_push_constant(7).new_object().pop_into_object(X);
            b.int_push_constant(1).function_return();
        });
        let settings = HeapSettings {
            initial_capacity: 8,
            collect_threshold: 3,
        };
        let vm = {
            let mut vm = VirtualMachine::with_heap_settings(Config::default(), settings);
            vm.load_function(f);
            Arc::new(vm)
        };
        let mut cx = ExecutionContext::new(Arc::clone(&vm));

        assert_eq!(cx.run0(0), Ok(int(1)));
        let stats = vm.heap().stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.objects_freed, 1);
        assert_eq!(vm.heap().live_objects(), 1);
    }

    #[test]
    fn system_collect_uses_stack_roots() {
        let f = function("f", 0, 0, |b| {
            b.new_object().drop_top();
            b.new_object().system_collect().function_return();
        });
        let vm = Arc::new(vm_with(Config::default(), vec![f]));
        let mut cx = ExecutionContext::new(Arc::clone(&vm));

        let kept = object_of(cx.run0(0).expect("object"));
        let stats = vm.heap().stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.objects_freed, 1);
        assert_eq!(stats.root_edges, 1);
        assert!(vm.heap().is_live(kept));
    }

    #[test]
    fn collection_keeps_other_contexts_stacks() {
        let collect = function("collect", 0, 0, |b| {
            b.new_object().drop_top();
            b.system_collect().int_push_constant(0).function_return();
        });
        let load = function("load", 1, 0, |b| {
            b.push_from_var(0).push_from_object(X).function_return();
        });
        let vm = Arc::new(vm_with(Config::default(), vec![make_object(X, Y), collect, load]));
        let mut holder = ExecutionContext::new(Arc::clone(&vm));
        let mut collector = ExecutionContext::new(Arc::clone(&vm));
        assert_eq!(vm.heap().mutator_count(), 2);

        let object = holder.run0(0).expect("object");
        holder.push(object).expect("push");

        assert_eq!(collector.run0(1), Ok(int(0)));
        let stats = vm.heap().stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.objects_freed, 1);
        assert!(vm.heap().is_live(object_of(object)));

        assert_eq!(holder.pop(), Ok(object));
        assert_eq!(holder.run(2, &[object]), Ok(int(5)));

        // popped and unpublished: the next collection frees it
        assert_eq!(collector.run0(1), Ok(int(0)));
        assert!(!vm.heap().is_live(object_of(object)));

        drop(holder);
        assert_eq!(vm.heap().mutator_count(), 1);
    }

    #[test]
    fn concurrent_contexts_survive_each_others_collections() {
        // obj (var 1) holds n in slot x while the loop allocates garbage
        // n times, then the slot is read back.
        let churn = function("churn", 1, 2, |b| {
            b.new_object().pop_into_var(1);
            b.push_from_var(0).push_from_var(1).pop_into_object(X);
            b.push_from_var(0).pop_into_var(2);
            let top = b.current_offset();
            b.push_from_var(2).int_push_constant(0);
            let done = b.jump_if(OpCode::IntJmpLe);
            b.new_object().drop_top();
            b.push_from_var(2).int_push_constant(1).int_sub().pop_into_var(2);
            b.jump_to(OpCode::Jmp, top);
            b.bind(done);
            b.push_from_var(1).push_from_object(X).function_return();
        });
        let settings = HeapSettings {
            initial_capacity: 8,
            collect_threshold: 2,
        };
        let vm = {
            let mut vm = VirtualMachine::with_heap_settings(Config::default(), settings);
            vm.load_function(churn);
            Arc::new(vm)
        };

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let vm = Arc::clone(&vm);
                std::thread::spawn(move || {
                    let mut cx = ExecutionContext::new(vm);
                    for round in 0..8 {
                        let n = 20 + i * 8 + round;
                        assert_eq!(cx.run(0, &[int(n)]), Ok(int(n)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }
        assert!(vm.heap().stats().collections > 0);
        assert_eq!(vm.heap().mutator_count(), 0);
    }

    #[test]
    fn contexts_share_shapes_across_threads() {
        let vm = Arc::new(vm_with(Config::default(), vec![make_object(X, Y)]));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let vm = Arc::clone(&vm);
                std::thread::spawn(move || {
                    let mut cx = ExecutionContext::new(vm);
                    for _ in 0..16 {
                        cx.run0(0).expect("make object");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }
        assert_eq!(vm.heap().shapes().len(), 3);
    }

    // ── jit bridge ────────────────────────────────────────────────────

    fn raw_int(raw: u64) -> i64 {
        Value::from_raw(raw).as_int48().unwrap_or(i64::MIN)
    }

    extern "C" fn answer(_cx: *mut ExecutionContext) -> u64 {
        int(42).raw()
    }

    extern "C" fn negate(_cx: *mut ExecutionContext, a: u64) -> u64 {
        int(-raw_int(a)).raw()
    }

    extern "C" fn minus(_cx: *mut ExecutionContext, a: u64, b: u64) -> u64 {
        int(raw_int(a) - raw_int(b)).raw()
    }

    extern "C" fn minus3(_cx: *mut ExecutionContext, a: u64, b: u64, c: u64) -> u64 {
        int(raw_int(a) - raw_int(b) - raw_int(c)).raw()
    }

    extern "C" fn unboxed(_cx: *mut ExecutionContext) -> u64 {
        12345
    }

    extern "C" fn minus_from_stack(cx: *mut ExecutionContext) -> u64 {
        // SAFETY: called by the bridge with the context that invoked it.
        let cx = unsafe { &mut *cx };
        match (cx.pop_int(), cx.pop_int()) {
            (Ok(b), Ok(a)) => int(a - b).raw(),
            _ => Value::UNINITIALIZED.raw(),
        }
    }

    fn jit_context(pass_param: bool) -> ExecutionContext {
        let config = Config {
            jit: true,
            pass_param,
            ..Config::default()
        };
        ExecutionContext::new(Arc::new(vm_with(config, Vec::new())))
    }

    #[test]
    fn jit_passes_arguments_in_push_order() {
        let mut cx = jit_context(true);
        assert_eq!(cx.call_jit_function(JitFunction::Arity0(answer), 0), Ok(int(42)));

        cx.push(int(5)).expect("push");
        assert_eq!(cx.call_jit_function(JitFunction::Arity1(negate), 1), Ok(int(-5)));

        cx.push(int(10)).expect("push");
        cx.push(int(3)).expect("push");
        assert_eq!(cx.call_jit_function(JitFunction::Arity2(minus), 2), Ok(int(7)));

        cx.push(int(10)).expect("push");
        cx.push(int(3)).expect("push");
        cx.push(int(2)).expect("push");
        assert_eq!(cx.call_jit_function(JitFunction::Arity3(minus3), 3), Ok(int(5)));
        assert_eq!(cx.stack().top(), 0);
    }

    #[test]
    fn jit_arity_checked_before_popping() {
        let mut cx = jit_context(true);
        cx.push(int(1)).expect("push");
        cx.push(int(2)).expect("push");
        assert_eq!(
            cx.call_jit_function(JitFunction::Arity1(negate), 2),
            Err(RuntimeError::JitArity {
                expected: 1,
                got: 2
            })
        );
        assert_eq!(
            cx.call_jit_function(JitFunction::Arity3(minus3), 4),
            Err(RuntimeError::UnsupportedJitArity(4))
        );
        assert_eq!(cx.stack().top(), 2);
    }

    #[test]
    fn jit_result_is_a_raw_word() {
        let mut cx = jit_context(true);
        let result = cx
            .call_jit_function(JitFunction::Arity0(unboxed), 0)
            .expect("jit call");
        assert_eq!(result.kind(), ValueKind::Raw);
        assert_eq!(result.raw(), 12345);
    }

    #[test]
    fn stack_only_convention() {
        let mut cx = jit_context(false);
        cx.push(int(10)).expect("push");
        cx.push(int(3)).expect("push");
        assert_eq!(
            cx.call_jit_function(JitFunction::Arity0(minus_from_stack), 2),
            Ok(int(7))
        );
        assert_eq!(cx.stack().top(), 0);

        assert_eq!(
            cx.call_jit_function(JitFunction::Arity2(minus), 2),
            Err(RuntimeError::JitArity {
                expected: 2,
                got: 0
            })
        );
    }

    #[test]
    fn run_and_calls_prefer_jit_entries() {
        // Interpreted `sub` would return 0; its native entry subtracts.
        let sub = function("sub", 2, 0, |b| {
            b.int_push_constant(0).function_return();
        });
        let main = function("main", 0, 0, |b| {
            b.int_push_constant(9).int_push_constant(4).function_call(0);
            b.int_push_constant(1).int_add().function_return();
        });

        for (jit, expected_run, expected_main) in [(true, 5, 6), (false, 0, 1)] {
            let config = Config {
                jit,
                ..Config::default()
            };
            let mut vm = vm_with(config, vec![sub.clone(), main.clone()]);
            vm.set_jit_function(0, JitFunction::Arity2(minus)).expect("sub loaded");
            let mut cx = ExecutionContext::new(Arc::new(vm));

            assert_eq!(cx.run(0, &[int(9), int(4)]), Ok(int(expected_run)));
            assert_eq!(cx.run0(1), Ok(int(expected_main)));
            assert_idle(&cx);
        }
    }
}
