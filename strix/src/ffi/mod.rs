//! The C ABI for foreign methods.
//!
//! A foreign method declares an arity and a has-self flag; the VM calls a
//! C function with the layout `(Thread*, [Self*,] Value* ret, Value arg0,
//! …)`. A `Value` crossing the boundary is a 16-byte tagged pair. This
//! module only defines the call surface and the per-arity trampolines;
//! resolving a symbol name to a function is left to a [`SymbolResolver`]
//! supplied by the embedder.

use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

use crate::errors::FatalError;
use crate::runtime::memory::MemoryManager;
use crate::runtime::obj::{ObjRef, Payload};

/// Highest argument count the trampolines cover.
pub const MAX_FOREIGN_ARGS: usize = 8;

/// The 16-byte exchange value: a tag word and a payload word.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RawValue {
	pub tag: u64,
	pub payload: u64,
}

impl RawValue {
	pub const TAG_NULL: u64 = 0;
	pub const TAG_BOOL: u64 = 1;
	pub const TAG_CHAR: u64 = 2;
	pub const TAG_INT: u64 = 3;
	pub const TAG_FLOAT: u64 = 4;
	/// Payload is a pointer to NUL-terminated UTF-8, valid for the call.
	pub const TAG_STRING: u64 = 5;

	pub const NULL: RawValue = RawValue { tag: Self::TAG_NULL, payload: 0 };

	pub fn int(value: i64) -> Self {
		Self { tag: Self::TAG_INT, payload: value as u64 }
	}

	pub fn float(value: f64) -> Self {
		Self { tag: Self::TAG_FLOAT, payload: value.to_bits() }
	}

	pub fn bool(value: bool) -> Self {
		Self { tag: Self::TAG_BOOL, payload: value as u64 }
	}

	pub fn char(value: u32) -> Self {
		Self { tag: Self::TAG_CHAR, payload: value as u64 }
	}
}

/// An opaque foreign entry point; cast to its true shape by the per-arity
/// trampoline at call time.
pub type ForeignFn = unsafe extern "C" fn();

/// A foreign method body as carried by a `Method` object.
#[derive(Copy, Clone)]
pub struct ForeignStub {
	pub arity: u8,
	pub has_self: bool,
	pub func: ForeignFn,
}

/// The resolve-by-name seam. Platform-specific library loading lives
/// behind this trait, outside this crate.
pub trait SymbolResolver: Send + Sync {
	fn resolve(&self, name: &str) -> Option<ForeignFn>;
}

fn arity_error(arity: usize) -> FatalError {
	FatalError::ForeignCall {
		sign: "<foreign>".into(),
		message: format!("unsupported arity: {arity} (max {MAX_FOREIGN_ARGS})"),
	}
}

macro_rules! foreign_arg_ty {
	($idx:tt) => {
		RawValue
	};
}

macro_rules! dispatch_plain {
	($func:expr, $thread:expr, $ret:expr, $args:expr; $($count:literal => ($($idx:tt),*);)*) => {
		match $args.len() {
			$(
				$count => {
					let f: unsafe extern "C" fn(*mut c_void, *mut RawValue $(, foreign_arg_ty!($idx))*) =
						std::mem::transmute($func);
					f($thread, $ret $(, $args[$idx])*);
					Ok(())
				}
			)*
			other => Err(arity_error(other)),
		}
	};
}

macro_rules! dispatch_with_self {
	($func:expr, $thread:expr, $self_:expr, $ret:expr, $args:expr; $($count:literal => ($($idx:tt),*);)*) => {
		match $args.len() {
			$(
				$count => {
					let f: unsafe extern "C" fn(*mut c_void, *mut c_void, *mut RawValue $(, foreign_arg_ty!($idx))*) =
						std::mem::transmute($func);
					f($thread, $self_, $ret $(, $args[$idx])*);
					Ok(())
				}
			)*
			other => Err(arity_error(other)),
		}
	};
}

/// Performs the raw call through the arity-matched trampoline.
///
/// # Safety
/// `func` must point at a C function whose true signature matches the
/// declared arity and has-self flag, and every pointer argument must stay
/// valid for the duration of the call.
pub unsafe fn invoke(
	func: ForeignFn,
	thread: *mut c_void,
	self_ptr: Option<*mut c_void>,
	ret: *mut RawValue,
	args: &[RawValue],
) -> Result<(), FatalError> {
	match self_ptr {
		None => dispatch_plain! {
			func, thread, ret, args;
			0 => ();
			1 => (0);
			2 => (0, 1);
			3 => (0, 1, 2);
			4 => (0, 1, 2, 3);
			5 => (0, 1, 2, 3, 4);
			6 => (0, 1, 2, 3, 4, 5);
			7 => (0, 1, 2, 3, 4, 5, 6);
			8 => (0, 1, 2, 3, 4, 5, 6, 7);
		},
		Some(self_) => dispatch_with_self! {
			func, thread, self_, ret, args;
			0 => ();
			1 => (0);
			2 => (0, 1);
			3 => (0, 1, 2);
			4 => (0, 1, 2, 3);
			5 => (0, 1, 2, 3, 4);
			6 => (0, 1, 2, 3, 4, 5);
			7 => (0, 1, 2, 3, 4, 5, 6);
			8 => (0, 1, 2, 3, 4, 5, 6, 7);
		},
	}
}

/// Lowers a runtime value into its exchange form. Strings are interned
/// into `strings`, which must outlive the call.
pub fn lower(value: &ObjRef, sign: &str, strings: &mut Vec<CString>) -> Result<RawValue, FatalError> {
	match value.payload() {
		Payload::Null => Ok(RawValue::NULL),
		Payload::Bool(b) => Ok(RawValue::bool(*b)),
		Payload::Char(c) => Ok(RawValue::char(*c)),
		Payload::Int(i) => Ok(RawValue::int(*i)),
		Payload::Float(f) => Ok(RawValue::float(*f)),
		Payload::String(s) => {
			let interned = CString::new(s.as_bytes()).map_err(|_| FatalError::ForeignCall {
				sign: sign.into(),
				message: "string argument contains an interior NUL".into(),
			})?;
			let pointer = interned.as_ptr() as u64;
			strings.push(interned);
			Ok(RawValue { tag: RawValue::TAG_STRING, payload: pointer })
		}
		_ => Err(FatalError::ForeignCall {
			sign: sign.into(),
			message: format!("cannot pass a {} across the foreign boundary", value.tag()),
		}),
	}
}

/// Lifts a returned exchange value back onto the heap. A null tag means
/// "no value"; the caller pushes nothing.
pub fn lift(
	value: RawValue,
	sign: &str,
	manager: &Arc<MemoryManager>,
) -> Result<Option<ObjRef>, FatalError> {
	match value.tag {
		RawValue::TAG_NULL => Ok(None),
		RawValue::TAG_BOOL => Ok(Some(manager.bool(value.payload != 0))),
		RawValue::TAG_CHAR => Ok(Some(manager.char(value.payload as u32))),
		RawValue::TAG_INT => Ok(Some(manager.int(value.payload as i64))),
		RawValue::TAG_FLOAT => Ok(Some(manager.float(f64::from_bits(value.payload)))),
		RawValue::TAG_STRING => {
			if value.payload == 0 {
				return Ok(Some(manager.string("")));
			}
			let text = unsafe { CStr::from_ptr(value.payload as *const std::ffi::c_char) }
				.to_str()
				.map_err(|_| FatalError::ForeignCall {
					sign: sign.into(),
					message: "returned string is not valid utf-8".into(),
				})?;
			Ok(Some(manager.string(text)))
		}
		tag => Err(FatalError::ForeignCall {
			sign: sign.into(),
			message: format!("unknown return tag: {tag}"),
		}),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	unsafe extern "C" fn add_two(_thread: *mut c_void, ret: *mut RawValue, a: RawValue, b: RawValue) {
		*ret = RawValue::int((a.payload as i64) + (b.payload as i64));
	}

	unsafe extern "C" fn no_result(_thread: *mut c_void, _ret: *mut RawValue) {}

	#[test]
	fn raw_value_is_sixteen_bytes() {
		assert_eq!(std::mem::size_of::<RawValue>(), 16);
	}

	type TwoArgFn = unsafe extern "C" fn(*mut c_void, *mut RawValue, RawValue, RawValue);
	type ZeroArgFn = unsafe extern "C" fn(*mut c_void, *mut RawValue);

	#[test]
	fn trampoline_calls_through_with_two_args() {
		let args = [RawValue::int(2), RawValue::int(3)];
		let mut ret = RawValue::NULL;
		let func: ForeignFn = unsafe { std::mem::transmute(add_two as TwoArgFn) };
		unsafe { invoke(func, std::ptr::null_mut(), None, &mut ret, &args).unwrap() };
		assert_eq!(ret, RawValue::int(5));
	}

	#[test]
	fn null_return_means_no_value() {
		let mut ret = RawValue::NULL;
		let func: ForeignFn = unsafe { std::mem::transmute(no_result as ZeroArgFn) };
		unsafe { invoke(func, std::ptr::null_mut(), None, &mut ret, &[]).unwrap() };
		let manager = crate::runtime::memory::MemoryManager::new();
		assert!(lift(ret, "t", &manager).unwrap().is_none());
	}

	#[test]
	fn arity_beyond_the_trampolines_is_rejected() {
		let args = [RawValue::NULL; MAX_FOREIGN_ARGS + 1];
		let mut ret = RawValue::NULL;
		let func: ForeignFn = unsafe { std::mem::transmute(no_result as ZeroArgFn) };
		let result = unsafe { invoke(func, std::ptr::null_mut(), None, &mut ret, &args) };
		assert!(matches!(result, Err(FatalError::ForeignCall { .. })));
	}

	#[test]
	fn lowering_rejects_non_primitives() {
		let manager = crate::runtime::memory::MemoryManager::new();
		let array = manager.array(0);
		let mut strings = vec![];
		assert!(lower(&array, "t", &mut strings).is_err());
		assert!(lower(&manager.int(1), "t", &mut strings).is_ok());
	}
}
