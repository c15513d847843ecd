//! The dispatch loop: one opcode per iteration, a result-typed error
//! channel instead of host exceptions, and frame-walking unwind for
//! program-level throws.

use std::ffi::c_void;
use std::sync::{Arc, Weak};

use crate::errors::{FatalError, VmError};
use crate::ffi::{self, ForeignStub, RawValue};
use crate::raw::opcode::{Opcode, OperandKind};
use crate::runtime::frame::FrameTemplate;
use crate::runtime::obj::{
	MethodBody, MethodKind, MethodState, Obj, ObjRef, Ordering, Payload,
};
use crate::sign::Sign;
use crate::vm::thread::{ThreadState, VmThread};
use crate::vm::StrixVm;

/// How a `run` invocation ended: a normal return from the outermost
/// frame, or an uncaught throw (stack trace already printed).
pub enum Outcome {
	Returned(ObjRef),
	Unwound(ObjRef),
}

enum Flow {
	Continue,
	Finished(ObjRef),
}

/// Calls a method: bytecode methods get a frame pushed (or swapped in,
/// for a tail call); foreign methods execute immediately and leave their
/// result on the current frame.
pub fn call(
	vm: &StrixVm,
	state: &mut ThreadState,
	method: &ObjRef,
	receiver: Option<ObjRef>,
	args: Vec<ObjRef>,
	tail: bool,
) -> Result<(), VmError> {
	let method_state = method
		.as_method()
		.ok_or_else(|| VmError::illegal_access(format!("not a method: {method}")))?;
	match method_state.body() {
		MethodBody::Foreign(stub) => call_foreign(vm, state, method_state, *stub, receiver, &args),
		MethodBody::Bytecode(template) => {
			if args.len() != template.args().count() {
				return Err(VmError::illegal_access(format!(
					"wrong argument count for {}: expected {}, got {}",
					method_state.sign(),
					template.args().count(),
					args.len()
				)));
			}
			let mut frame = template.instantiate(method.clone(), method_state.module());
			for (index, arg) in args.into_iter().enumerate() {
				frame.args_mut().set(index, arg)?;
			}
			if let Some(receiver) = receiver {
				frame.locals_mut().set(0, receiver)?;
			}
			match tail {
				true => state.replace_frame(frame)?,
				false => state.push_frame(frame)?,
			}
			Ok(())
		}
	}
}

fn call_foreign(
	vm: &StrixVm,
	state: &mut ThreadState,
	method_state: &MethodState,
	stub: ForeignStub,
	receiver: Option<ObjRef>,
	args: &[ObjRef],
) -> Result<(), VmError> {
	let sign = method_state.sign().to_string();
	if args.len() != stub.arity as usize {
		return Err(VmError::illegal_access(format!(
			"wrong argument count for {sign}: expected {}, got {}",
			stub.arity,
			args.len()
		)));
	}

	let mut strings = vec![];
	let mut raw_args = Vec::with_capacity(args.len());
	for arg in args {
		raw_args.push(ffi::lower(arg, &sign, &mut strings)?);
	}
	let self_ptr = match (stub.has_self, &receiver) {
		(true, Some(obj)) => Some(Arc::as_ptr(obj) as *mut Obj as *mut c_void),
		(true, None) => {
			return Err(VmError::Fatal(FatalError::ForeignCall {
				sign,
				message: "missing receiver for a has-self foreign method".into(),
			}))
		}
		(false, _) => None,
	};
	let thread = VmThread::current();
	let thread_ptr = thread
		.as_ref()
		.map(|thread| Arc::as_ptr(thread) as *mut c_void)
		.unwrap_or(std::ptr::null_mut());

	let mut ret = RawValue::NULL;
	unsafe { ffi::invoke(stub.func, thread_ptr, self_ptr, &mut ret, &raw_args)? };
	drop(strings);

	if let Some(value) = ffi::lift(ret, &sign, vm.manager())? {
		state.frame()?.push(value)?;
	}
	Ok(())
}

/// Executes until the frame that was on top when `run` was entered
/// returns (or an uncaught throw empties the stack down to it).
pub fn run(vm: &StrixVm, state: &mut ThreadState) -> Result<Outcome, FatalError> {
	let base = state.depth();
	if base == 0 {
		return Err(FatalError::Argument {
			sign: "run".into(),
			message: "no frame to execute".into(),
		});
	}

	loop {
		if let Some(debugger) = vm.debugger() {
			debugger.update(vm);
		}
		let byte = state.frame()?.read_byte()?;
		let opcode = Opcode::from_byte(byte)
			.ok_or_else(|| FatalError::IllegalAccess(format!("unknown opcode: {byte:#04X}")))?;

		match step(vm, state, base, opcode) {
			Ok(Flow::Continue) => {}
			Ok(Flow::Finished(value)) => return Ok(Outcome::Returned(value)),
			Err(VmError::Fatal(error)) => return Err(error),
			Err(VmError::Throw(value)) => {
				if let Some(value) = unwind(vm, state, base, value)? {
					return Ok(Outcome::Unwound(value));
				}
			}
		}
	}
}

/// Walks the call stack top-down looking for a handler covering each
/// frame's pc and the thrown value's type. On a hit: clear the operand
/// stack, push the thrown value, resume at the target. On exhaustion the
/// trace is printed and the remaining frames of this run are popped.
fn unwind(
	vm: &StrixVm,
	state: &mut ThreadState,
	base: usize,
	value: ObjRef,
) -> Result<Option<ObjRef>, FatalError> {
	let thrown_ty = value.ty().or_else(|| vm.vm_type(value.tag()));
	loop {
		let handler = {
			let frame = state.frame()?;
			let pc = frame.pc();
			frame
				.exceptions()
				.target_for(pc, |ty| vm.check_cast(thrown_ty.clone(), ty))
		};
		if let Some(target) = handler {
			let frame = state.frame()?;
			frame.clear_stack();
			frame.set_pc(target)?;
			frame.push(value)?;
			return Ok(None);
		}
		if state.depth() == base {
			print_stack_trace(state, &value);
			while state.depth() >= base {
				state.pop_frame();
			}
			return Ok(Some(value));
		}
		state.pop_frame();
	}
}

fn print_stack_trace(state: &ThreadState, value: &ObjRef) {
	let mut trace = format!("uncaught exception: {value}\n");
	for frame in state.frames().iter().rev() {
		let sign = frame
			.method()
			.as_method()
			.map(|method| method.sign().to_string())
			.unwrap_or_else(|| "<unknown>".into());
		match frame.lines().source_line_for(frame.pc().saturating_sub(1)) {
			Ok(line) => trace.push_str(&format!("\tat {sign} (line {line})\n")),
			Err(_) => trace.push_str(&format!("\tat {sign}\n")),
		}
	}
	eprint!("{trace}");
}

fn read_index(state: &mut ThreadState, opcode: Opcode) -> Result<usize, FatalError> {
	let frame = state.frame()?;
	Ok(match opcode.operand() {
		OperandKind::U16 => frame.read_u16()? as usize,
		_ => frame.read_byte()? as usize,
	})
}

fn pool_const(state: &mut ThreadState, opcode: Opcode) -> Result<ObjRef, FatalError> {
	let index = read_index(state, opcode)?;
	state.frame()?.const_at(index)
}

fn pool_string(state: &mut ThreadState, opcode: Opcode) -> Result<String, FatalError> {
	Ok(pool_const(state, opcode)?.to_string())
}

fn pop_args(state: &mut ThreadState, count: usize) -> Result<Vec<ObjRef>, FatalError> {
	let frame = state.frame()?;
	let mut args = Vec::with_capacity(count);
	for _ in 0..count {
		args.push(frame.pop()?);
	}
	args.reverse();
	Ok(args)
}

/// The display name of a value's type, for diagnostics.
fn type_name(value: &ObjRef) -> String {
	value
		.ty()
		.as_deref()
		.and_then(Obj::as_type)
		.map(|state| state.sign().to_string())
		.unwrap_or_else(|| format!("basic.{}", value.tag()))
}

fn expect_int(vm: &StrixVm, value: &ObjRef) -> Result<i64, VmError> {
	value
		.as_int()
		.ok_or_else(|| vm.throw_message(format!("expected int, found '{}'", type_name(value))))
}

fn expect_bool(vm: &StrixVm, value: &ObjRef) -> Result<bool, VmError> {
	value
		.as_bool()
		.ok_or_else(|| vm.throw_message(format!("expected bool, found '{}'", type_name(value))))
}

fn expect_float(vm: &StrixVm, value: &ObjRef) -> Result<f64, VmError> {
	value
		.as_float()
		.ok_or_else(|| vm.throw_message(format!("expected float, found '{}'", type_name(value))))
}

fn expect_array_items(vm: &StrixVm, value: &ObjRef) -> Result<Vec<ObjRef>, VmError> {
	match value.is_array() {
		true => Ok(value.array_items()?),
		false => Err(vm.throw_message(format!("expected array, found '{}'", type_name(value)))),
	}
}

fn method_arity(method: &ObjRef) -> Result<usize, VmError> {
	method
		.as_method()
		.map(MethodState::arity)
		.ok_or_else(|| VmError::illegal_access(format!("not a method: {method}")))
}

fn method_parts(method: &ObjRef) -> Result<(MethodKind, Sign, FrameTemplate, Weak<Obj>), VmError> {
	let state = method
		.as_method()
		.ok_or_else(|| VmError::illegal_access(format!("not a method: {method}")))?;
	let template = state
		.template()
		.ok_or_else(|| VmError::illegal_access(format!("cannot copy a foreign method: {method}")))?
		.clone();
	Ok((state.kind(), state.sign().clone(), template, state.module_handle()))
}

/// Wraps a freshly built template back into a method object, carrying
/// over the original's member slots. The deep-copy half of `SPLOAD` and
/// `CLOSURELOAD`.
fn finish_method_copy(
	vm: &StrixVm,
	original: &ObjRef,
	kind: MethodKind,
	sign: Sign,
	template: FrameTemplate,
	module: Weak<Obj>,
) -> ObjRef {
	let copy = vm.manager().alloc(Payload::Method(MethodState::new(
		kind,
		sign,
		MethodBody::Bytecode(template),
		module,
	)));
	for (name, slot) in original.member_snapshot() {
		copy.set_member_with_flags(&name, slot.value().copy(), slot.flags());
	}
	copy
}

fn int_pow(vm: &StrixVm, base: i64, exp: i64) -> Result<i64, VmError> {
	if exp >= 0 {
		let exp = u32::try_from(exp).unwrap_or(u32::MAX);
		return Ok(base.wrapping_pow(exp));
	}
	match base {
		0 => Err(vm.throw_message("division by zero")),
		1 => Ok(1),
		-1 => Ok(if exp % 2 == 0 { 1 } else { -1 }),
		_ => Ok(0),
	}
}

fn step(vm: &StrixVm, state: &mut ThreadState, base: usize, opcode: Opcode) -> Result<Flow, VmError> {
	match opcode {
		Opcode::Nop => {}

		// ---- stack ----
		Opcode::Const | Opcode::ConstF => {
			let value = pool_const(state, opcode)?;
			state.frame()?.push(value)?;
		}
		Opcode::ConstNull => {
			let null = vm.manager().null();
			state.frame()?.push(null)?;
		}
		Opcode::ConstTrue => {
			let value = vm.manager().bool(true);
			state.frame()?.push(value)?;
		}
		Opcode::ConstFalse => {
			let value = vm.manager().bool(false);
			state.frame()?.push(value)?;
		}
		Opcode::Pop => {
			state.frame()?.pop()?;
		}
		Opcode::NPop => {
			let frame = state.frame()?;
			let count = frame.read_byte()?;
			for _ in 0..count {
				frame.pop()?;
			}
		}
		Opcode::Dup => {
			let frame = state.frame()?;
			let top = frame.peek()?;
			frame.push(top)?;
		}
		Opcode::NDup => {
			let frame = state.frame()?;
			let count = frame.read_byte()?;
			let top = frame.peek()?;
			for _ in 0..count {
				frame.push(top.clone())?;
			}
		}

		// ---- globals ----
		Opcode::GLoad | Opcode::GLoadF => {
			let name = pool_string(state, opcode)?;
			let value = vm.get_symbol(&name)?;
			state.frame()?.push(value)?;
		}
		Opcode::GStore | Opcode::GStoreF => {
			let name = pool_string(state, opcode)?;
			let value = state.frame()?.peek()?;
			vm.set_symbol(&name, value)?;
		}
		Opcode::PGStore | Opcode::PGStoreF => {
			let name = pool_string(state, opcode)?;
			let value = state.frame()?.pop()?;
			vm.set_symbol(&name, value)?;
		}

		// ---- locals ----
		Opcode::LLoad | Opcode::LLoadF => {
			let index = read_index(state, opcode)?;
			let frame = state.frame()?;
			let value = frame.locals().get(index)?;
			frame.push(value)?;
		}
		Opcode::LStore | Opcode::LStoreF => {
			let index = read_index(state, opcode)?;
			let frame = state.frame()?;
			let value = frame.peek()?;
			frame.locals_mut().set(index, value)?;
		}
		Opcode::PLStore | Opcode::PLStoreF => {
			let index = read_index(state, opcode)?;
			let frame = state.frame()?;
			let value = frame.pop()?;
			frame.locals_mut().set(index, value)?;
		}

		// ---- args ----
		Opcode::ALoad => {
			let index = read_index(state, opcode)?;
			let frame = state.frame()?;
			let value = frame.args().get(index)?;
			frame.push(value)?;
		}
		Opcode::AStore => {
			let index = read_index(state, opcode)?;
			let frame = state.frame()?;
			let value = frame.peek()?;
			frame.args_mut().set(index, value)?;
		}
		Opcode::PAStore => {
			let index = read_index(state, opcode)?;
			let frame = state.frame()?;
			let value = frame.pop()?;
			frame.args_mut().set(index, value)?;
		}

		// ---- members ----
		Opcode::MLoad | Opcode::MLoadF => {
			let name = Sign::parse(&pool_string(state, opcode)?)?.name();
			let object = state.frame()?.pop()?;
			let member = object.get_member(&name)?;
			state.frame()?.push(member)?;
		}
		Opcode::MStore | Opcode::MStoreF => {
			let name = Sign::parse(&pool_string(state, opcode)?)?.name();
			let frame = state.frame()?;
			let object = frame.pop()?;
			let value = frame.peek()?;
			object.set_member(&name, value);
		}
		Opcode::PMStore | Opcode::PMStoreF => {
			let name = Sign::parse(&pool_string(state, opcode)?)?.name();
			let frame = state.frame()?;
			let object = frame.pop()?;
			let value = frame.pop()?;
			object.set_member(&name, value);
		}

		// ---- super binding ----
		Opcode::SpLoad | Opcode::SpLoadF => {
			let sign_text = pool_string(state, opcode)?;
			let receiver = state.frame()?.pop()?;
			let method = vm.get_symbol(&sign_text)?;
			let (kind, sign, mut template, module) = method_parts(&method)?;
			let capture = template.locals_mut().ramp_up(0, vm.manager())?;
			capture.set_captured(receiver)?;
			let bound = finish_method_copy(vm, &method, kind, sign, template, module);
			state.frame()?.push(bound)?;
		}

		// ---- arrays ----
		Opcode::ArrPack => {
			let count = state.frame()?.read_byte()? as usize;
			let items = pop_args(state, count)?;
			let array = vm.manager().array_from(items);
			state.frame()?.push(array)?;
		}
		Opcode::ArrUnpack => {
			let value = state.frame()?.pop()?;
			let items = expect_array_items(vm, &value)?;
			let frame = state.frame()?;
			for item in items {
				frame.push(item)?;
			}
		}
		Opcode::ArrBuild | Opcode::ArrBuildF => {
			let count = read_index(state, opcode)?;
			let array = vm.manager().array(count);
			state.frame()?.push(array)?;
		}
		Opcode::ILoad => {
			let frame = state.frame()?;
			let array = frame.pop()?;
			let index = frame.pop()?;
			let index = expect_int(vm, &index)?;
			if !array.is_array() {
				return Err(vm.throw_message(format!("expected array, found '{}'", type_name(&array))));
			}
			let value = array.array_get(index)?;
			state.frame()?.push(value)?;
		}
		Opcode::IStore => {
			let frame = state.frame()?;
			let array = frame.pop()?;
			let index = frame.pop()?;
			let value = frame.peek()?;
			let index = expect_int(vm, &index)?;
			if !array.is_array() {
				return Err(vm.throw_message(format!("expected array, found '{}'", type_name(&array))));
			}
			array.array_set(index, value)?;
		}
		Opcode::PIStore => {
			let frame = state.frame()?;
			let array = frame.pop()?;
			let index = frame.pop()?;
			let value = frame.pop()?;
			let index = expect_int(vm, &index)?;
			if !array.is_array() {
				return Err(vm.throw_message(format!("expected array, found '{}'", type_name(&array))));
			}
			array.array_set(index, value)?;
		}
		Opcode::ArrLen => {
			let value = state.frame()?.pop()?;
			if !value.is_array() {
				return Err(vm.throw_message(format!("expected array, found '{}'", type_name(&value))));
			}
			let length = vm.manager().int(value.array_len()? as i64);
			state.frame()?.push(length)?;
		}

		// ---- calls ----
		Opcode::Invoke => {
			let count = state.frame()?.read_byte()? as usize;
			let method = state.frame()?.pop()?;
			let args = pop_args(state, count)?;
			// A call immediately followed by a return forwards its result
			// to the caller's caller, so the frame slot can be reused.
			let tail = state.frame_ref()?.peek_byte() == Some(Opcode::Ret as u8);
			call(vm, state, &method, None, args, tail)?;
		}
		Opcode::VInvoke | Opcode::VInvokeF => {
			let sign = Sign::parse(&pool_string(state, opcode)?)?;
			let name = sign.name();
			let count = sign.params().len();
			let args = pop_args(state, count)?;
			let receiver = state.frame()?.pop()?;
			let method = receiver.get_member(&name)?;
			call(vm, state, &method, Some(receiver), args, false)?;
		}
		Opcode::GInvoke | Opcode::GInvokeF => {
			let sign_text = pool_string(state, opcode)?;
			let method = vm.get_symbol(&sign_text)?;
			let count = method_arity(&method)?;
			let args = pop_args(state, count)?;
			call(vm, state, &method, None, args, false)?;
		}
		Opcode::LInvoke | Opcode::LInvokeF => {
			let index = read_index(state, opcode)?;
			let method = state.frame()?.locals().get(index)?;
			let count = method_arity(&method)?;
			let args = pop_args(state, count)?;
			call(vm, state, &method, None, args, false)?;
		}
		Opcode::AInvoke => {
			let index = read_index(state, opcode)?;
			let method = state.frame()?.args().get(index)?;
			let count = method_arity(&method)?;
			let args = pop_args(state, count)?;
			call(vm, state, &method, None, args, false)?;
		}
		Opcode::SpInvoke | Opcode::SpInvokeF => {
			let sign_text = pool_string(state, opcode)?;
			let method = vm.get_symbol(&sign_text)?;
			let count = method_arity(&method)?;
			let args = pop_args(state, count)?;
			let receiver = state.frame()?.pop()?;
			call(vm, state, &method, Some(receiver), args, false)?;
		}
		Opcode::CallSub => {
			let frame = state.frame()?;
			let offset = frame.read_i16()?;
			let address = vm.manager().int(frame.pc() as i64);
			frame.push(address)?;
			frame.adjust(offset as i32)?;
		}
		Opcode::RetSub => {
			let frame = state.frame()?;
			let address = frame.pop()?;
			let address = address
				.as_int()
				.ok_or_else(|| VmError::illegal_access("retsub without a return address"))?;
			if address < 0 {
				return Err(VmError::illegal_access(format!("jump target out of range: {address}")));
			}
			frame.set_pc(address as u32)?;
		}

		// ---- jumps ----
		Opcode::Jmp => {
			let frame = state.frame()?;
			let offset = frame.read_i16()?;
			frame.adjust(offset as i32)?;
		}
		Opcode::Jt | Opcode::Jf => {
			let frame = state.frame()?;
			let value = frame.pop()?;
			let offset = frame.read_i16()?;
			let take = match opcode {
				Opcode::Jt => value.truth(),
				_ => !value.truth(),
			};
			if take {
				frame.adjust(offset as i32)?;
			}
		}
		Opcode::Jlt | Opcode::Jle | Opcode::Jeq | Opcode::Jne | Opcode::Jge | Opcode::Jgt => {
			let frame = state.frame()?;
			let b = frame.pop()?;
			let a = frame.pop()?;
			let offset = frame.read_i16()?;
			if compare_predicate(opcode, a.compare(&b)) {
				frame.adjust(offset as i32)?;
			}
		}

		// ---- primitives ----
		Opcode::Not => {
			let value = state.frame()?.pop()?;
			let value = expect_bool(vm, &value)?;
			let result = vm.manager().bool(!value);
			state.frame()?.push(result)?;
		}
		Opcode::Inv => {
			let value = state.frame()?.pop()?;
			let value = expect_int(vm, &value)?;
			let result = vm.manager().int(!value);
			state.frame()?.push(result)?;
		}
		Opcode::Neg => {
			let value = state.frame()?.pop()?;
			let result = match value.payload() {
				Payload::Int(int) => vm.manager().int(int.wrapping_neg()),
				Payload::Float(float) => vm.manager().float(-float),
				_ => {
					return Err(vm.throw_message(format!("cannot negate '{}'", type_name(&value))));
				}
			};
			state.frame()?.push(result)?;
		}
		Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Rem | Opcode::Pow => {
			let (a, b) = {
				let frame = state.frame()?;
				let b = frame.pop()?;
				let a = frame.pop()?;
				(a, b)
			};
			let result = match (a.payload(), b.payload()) {
				(Payload::Int(x), Payload::Int(y)) => {
					let value = match opcode {
						Opcode::Add => x.wrapping_add(*y),
						Opcode::Sub => x.wrapping_sub(*y),
						Opcode::Mul => x.wrapping_mul(*y),
						Opcode::Div => match y {
							0 => return Err(vm.throw_message("division by zero")),
							_ => x.wrapping_div(*y),
						},
						Opcode::Rem => match y {
							0 => return Err(vm.throw_message("division by zero")),
							_ => x.wrapping_rem(*y),
						},
						_ => int_pow(vm, *x, *y)?,
					};
					vm.manager().int(value)
				}
				(Payload::Float(x), Payload::Float(y)) => {
					let value = match opcode {
						Opcode::Add => x + y,
						Opcode::Sub => x - y,
						Opcode::Mul => x * y,
						Opcode::Div => x / y,
						Opcode::Rem => x % y,
						_ => x.powf(*y),
					};
					vm.manager().float(value)
				}
				_ => {
					return Err(vm.throw_message(format!(
						"cannot apply '{}' to '{}' and '{}'",
						opcode.mnemonic(),
						type_name(&a),
						type_name(&b)
					)))
				}
			};
			state.frame()?.push(result)?;
		}
		Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr | Opcode::UShr
		| Opcode::Rol | Opcode::Ror => {
			let (a, b) = {
				let frame = state.frame()?;
				let b = frame.pop()?;
				let a = frame.pop()?;
				(a, b)
			};
			let x = expect_int(vm, &a)?;
			let y = expect_int(vm, &b)?;
			let value = match opcode {
				Opcode::And => x & y,
				Opcode::Or => x | y,
				Opcode::Xor => x ^ y,
				Opcode::Shl => x.wrapping_shl(y as u32),
				Opcode::Shr => x.wrapping_shr(y as u32),
				Opcode::UShr => ((x as u64).wrapping_shr(y as u32)) as i64,
				Opcode::Rol => x.rotate_left((y as u32) % 64),
				_ => x.rotate_right((y as u32) % 64),
			};
			let result = vm.manager().int(value);
			state.frame()?.push(result)?;
		}
		Opcode::Concat => {
			let (a, b) = {
				let frame = state.frame()?;
				let b = frame.pop()?;
				let a = frame.pop()?;
				(a, b)
			};
			let (Some(x), Some(y)) = (a.as_str(), b.as_str()) else {
				return Err(vm.throw_message(format!(
					"cannot concatenate '{}' and '{}'",
					type_name(&a),
					type_name(&b)
				)));
			};
			let result = vm.manager().string(format!("{x}{y}"));
			state.frame()?.push(result)?;
		}
		Opcode::Lt | Opcode::Le | Opcode::Eq | Opcode::Ne | Opcode::Ge | Opcode::Gt => {
			let frame = state.frame()?;
			let b = frame.pop()?;
			let a = frame.pop()?;
			let result = compare_predicate(opcode, a.compare(&b));
			let result = vm.manager().bool(result);
			state.frame()?.push(result)?;
		}
		Opcode::Is => {
			let frame = state.frame()?;
			let b = frame.pop()?;
			let a = frame.pop()?;
			let result = vm.manager().bool(Arc::ptr_eq(&a, &b));
			state.frame()?.push(result)?;
		}
		Opcode::NIs => {
			let frame = state.frame()?;
			let b = frame.pop()?;
			let a = frame.pop()?;
			let result = vm.manager().bool(!Arc::ptr_eq(&a, &b));
			state.frame()?.push(result)?;
		}
		Opcode::IsNull => {
			let value = state.frame()?.pop()?;
			let result = vm.manager().bool(value.is_null());
			state.frame()?.push(result)?;
		}
		Opcode::NIsNull => {
			let value = state.frame()?.pop()?;
			let result = vm.manager().bool(!value.is_null());
			state.frame()?.push(result)?;
		}

		// ---- type operations ----
		Opcode::GetType => {
			let value = state.frame()?.pop()?;
			let ty = value
				.ty()
				.or_else(|| vm.vm_type(value.tag()))
				.unwrap_or_else(|| vm.manager().null());
			state.frame()?.push(ty)?;
		}
		Opcode::SCast | Opcode::CCast => {
			let (ty, value) = {
				let frame = state.frame()?;
				let ty = frame.pop()?;
				let value = frame.pop()?;
				(ty, value)
			};
			let Some(ty_state) = ty.as_type() else {
				return Err(VmError::illegal_access(format!("not a type: {ty}")));
			};
			let ty_sign = ty_state.sign().to_string();
			let from = value.ty().or_else(|| vm.vm_type(value.tag()));
			if vm.check_cast(from.clone(), &ty) {
				value.retype(ty.clone());
				state.frame()?.push(value)?;
			} else if opcode == Opcode::SCast {
				let null = vm.manager().null();
				state.frame()?.push(null)?;
			} else {
				let from_name = from
					.as_deref()
					.and_then(Obj::as_type)
					.map(|state| state.sign().to_string())
					.unwrap_or_else(|| value.tag().to_string());
				return Err(vm.throw_message(format!(
					"object of type '{from_name}' cannot be cast to object of type '{ty_sign}'"
				)));
			}
		}
		Opcode::I2F => {
			let value = state.frame()?.pop()?;
			let value = expect_int(vm, &value)?;
			let result = vm.manager().float(value as f64);
			state.frame()?.push(result)?;
		}
		Opcode::F2I => {
			let value = state.frame()?.pop()?;
			let value = expect_float(vm, &value)?;
			let result = vm.manager().int(value as i64);
			state.frame()?.push(result)?;
		}
		Opcode::I2B => {
			let value = state.frame()?.pop()?;
			let value = expect_int(vm, &value)?;
			let result = vm.manager().bool(value != 0);
			state.frame()?.push(result)?;
		}
		Opcode::B2I => {
			let value = state.frame()?.pop()?;
			let value = expect_bool(vm, &value)?;
			let result = vm.manager().int(value as i64);
			state.frame()?.push(result)?;
		}
		Opcode::O2B => {
			let value = state.frame()?.pop()?;
			let result = vm.manager().bool(value.truth());
			state.frame()?.push(result)?;
		}
		Opcode::O2S => {
			let value = state.frame()?.pop()?;
			let result = vm.manager().string(value.to_string());
			state.frame()?.push(result)?;
		}

		// ---- monitors ----
		Opcode::EnterMonitor => {
			let value = state.frame()?.pop()?;
			value.enter_monitor();
		}
		Opcode::ExitMonitor => {
			let value = state.frame()?.pop()?;
			value.exit_monitor()?;
		}

		// ---- miscellaneous ----
		Opcode::MtPerf | Opcode::MtPerfF => {
			let index = read_index(state, opcode)?;
			let value = state.frame()?.pop()?;
			let target = {
				let frame = state.frame()?;
				let table = frame.matches().get(index).ok_or_else(|| {
					VmError::illegal_access(format!("index out of bounds: {index} (match table)"))
				})?;
				table.perform(&value)
			};
			state.frame()?.set_pc(target)?;
		}
		Opcode::ClosureLoad => {
			let count = state.frame()?.read_byte()?;
			let method = state.frame()?.pop()?;
			let (kind, sign, mut template, module) = method_parts(&method)?;
			for _ in 0..count {
				let dest = state.frame()?.read_u16()? as usize;
				let capture_kind = state.frame()?.read_byte()?;
				let capture = match capture_kind {
					0x00 => {
						let index = state.frame()?.read_byte()? as usize;
						state.frame()?.args_mut().ramp_up(index, vm.manager())?
					}
					0x01 => {
						let index = state.frame()?.read_u16()? as usize;
						state.frame()?.locals_mut().ramp_up(index, vm.manager())?
					}
					kind => {
						return Err(VmError::illegal_access(format!("unknown capture kind: {kind:#04X}")))
					}
				};
				template.locals_mut().install(dest, capture)?;
			}
			let closure = finish_method_copy(vm, &method, kind, sign, template, module);
			state.frame()?.push(closure)?;
		}
		Opcode::ObjLoad => {
			let ty = state.frame()?.pop()?;
			let instance = vm.instantiate(&ty)?;
			state.frame()?.push(instance)?;
		}
		Opcode::Throw => {
			let value = state.frame()?.pop()?;
			return Err(VmError::Throw(value));
		}
		Opcode::Ret => {
			let value = state.frame()?.pop()?;
			state.pop_frame();
			if state.depth() < base {
				return Ok(Flow::Finished(value));
			}
			state.frame()?.push(value)?;
		}
		Opcode::VRet => {
			state.pop_frame();
			if state.depth() < base {
				return Ok(Flow::Finished(vm.manager().null()));
			}
		}
		Opcode::Println => {
			let value = state.frame()?.pop()?;
			vm.write_out(&format!("{value}\n"));
		}
	}
	Ok(Flow::Continue)
}

fn compare_predicate(opcode: Opcode, ordering: Ordering) -> bool {
	match opcode {
		Opcode::Lt | Opcode::Jlt => ordering == Ordering::Less,
		Opcode::Le | Opcode::Jle => matches!(ordering, Ordering::Less | Ordering::Equal),
		Opcode::Eq | Opcode::Jeq => ordering == Ordering::Equal,
		Opcode::Ne | Opcode::Jne => ordering != Ordering::Equal,
		Opcode::Ge | Opcode::Jge => matches!(ordering, Ordering::Equal | Ordering::Greater),
		_ => ordering == Ordering::Greater,
	}
}
