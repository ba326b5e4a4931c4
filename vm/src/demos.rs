//! Small built-in programs, used by the `b9vm` binary and the tests.

use bytecode::{FunctionBuilder, ImmediateOutOfRange, OpCode};
use object::Value;

use crate::{ExecutionContext, JitFunction, RuntimeError, VirtualMachine};

/// Slot ids used by `point`.
pub const SLOT_X: u32 = 0;
pub const SLOT_Y: u32 = 1;

/// `( n -- 0 )` print an integer on its own line.
pub fn print_number(cx: &mut ExecutionContext) -> Result<(), RuntimeError> {
    let n = cx.pop_int()?;
    println!("{n}");
    cx.push(Value::from_int48(0))
}

/// Register the demo primitives and load every demo function.
///
/// Loaded functions: `add(a, b)`, `fib(n)`, `sum_to(n)`, `point(x, y)` and
/// `main()`, which prints the result of each of the others.
pub fn install(vm: &mut VirtualMachine) -> Result<(), ImmediateOutOfRange> {
    let print = vm.register_primitive("print_number", print_number) as u32;

    let mut b = FunctionBuilder::new("add", 2, 0);
    b.push_from_var(0).push_from_var(1).int_add().function_return();
    let add = vm.load_function(b.finish()?) as u32;

    let fib = vm.function_count() as u32;
    let mut b = FunctionBuilder::new("fib", 1, 0);
    b.push_from_var(0).int_push_constant(2);
    let recurse = b.jump_if(OpCode::IntJmpGe);
    b.push_from_var(0).function_return();
    b.bind(recurse);
    b.push_from_var(0).int_push_constant(1).int_sub().function_call(fib);
    b.push_from_var(0).int_push_constant(2).int_sub().function_call(fib);
    b.int_add().function_return();
    vm.load_function(b.finish()?);

    // acc lives in variable 1
    let mut b = FunctionBuilder::new("sum_to", 1, 1);
    b.int_push_constant(0).pop_into_var(1);
    let top = b.current_offset();
    b.push_from_var(0).int_push_constant(0);
    let done = b.jump_if(OpCode::IntJmpLe);
    b.push_from_var(1).push_from_var(0).int_add().pop_into_var(1);
    b.push_from_var(0).int_push_constant(1).int_sub().pop_into_var(0);
    b.jump_to(OpCode::Jmp, top);
    b.bind(done);
    b.push_from_var(1).function_return();
    let sum_to = vm.load_function(b.finish()?) as u32;

    // object lives in variable 2, which keeps it rooted across the collection
    let mut b = FunctionBuilder::new("point", 2, 1);
    b.new_object().pop_into_var(2);
    b.push_from_var(0).push_from_var(2).pop_into_object(SLOT_X);
    b.push_from_var(1).push_from_var(2).pop_into_object(SLOT_Y);
    b.system_collect();
    b.push_from_var(2).push_from_object(SLOT_X).duplicate().int_mul();
    b.push_from_var(2).push_from_object(SLOT_Y).duplicate().int_mul();
    b.int_add().function_return();
    let point = vm.load_function(b.finish()?) as u32;

    let mut b = FunctionBuilder::new("main", 0, 0);
    b.int_push_constant(20).int_push_constant(22).function_call(add);
    b.primitive_call(print).drop_top();
    b.int_push_constant(10).function_call(fib);
    b.primitive_call(print).drop_top();
    b.int_push_constant(100).function_call(sum_to);
    b.primitive_call(print).drop_top();
    b.int_push_constant(3).int_push_constant(4).function_call(point);
    b.primitive_call(print).drop_top();
    b.int_push_constant(0).function_return();
    vm.load_function(b.finish()?);
    Ok(())
}

extern "C" fn add_params(_cx: *mut ExecutionContext, a: u64, b: u64) -> u64 {
    match (Value::from_raw(a).as_int48(), Value::from_raw(b).as_int48()) {
        (Some(a), Some(b)) => Value::from_int48(a.wrapping_add(b)).raw(),
        _ => Value::UNINITIALIZED.raw(),
    }
}

extern "C" fn add_stack(cx: *mut ExecutionContext) -> u64 {
    // SAFETY: the bridge passes the live context that is calling us and
    // holds no other borrow of it for the duration of the call.
    let cx = unsafe { &mut *cx };
    match (cx.pop_int(), cx.pop_int()) {
        (Ok(b), Ok(a)) => Value::from_int48(a.wrapping_add(b)).raw(),
        _ => Value::UNINITIALIZED.raw(),
    }
}

/// Install a native entry for `add` matching the VM's calling convention.
pub fn install_native(vm: &mut VirtualMachine) -> Result<(), RuntimeError> {
    let add = vm
        .function_index("add")
        .ok_or_else(|| RuntimeError::UnknownFunctionName("add".to_string()))?;
    let jit = if vm.config().pass_param {
        JitFunction::Arity2(add_params)
    } else {
        JitFunction::Arity0(add_stack)
    };
    vm.set_jit_function(add, jit)
}
