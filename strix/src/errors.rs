use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use crate::runtime::obj::ObjRef;

/// Errors that terminate the VM. These are host-level failures; they are
/// never delivered to the guest program.
#[derive(Debug)]
pub enum FatalError {
	/// The reader or verifier rejected a program file.
	CorruptFile(PathBuf),
	/// A symbol, member, or index could not be resolved at runtime.
	IllegalAccess(String),
	/// The memory manager could not satisfy an allocation.
	Memory(usize),
	/// A foreign call was set up with an unsupported shape.
	ForeignCall { sign: String, message: String },
	/// The call stack exceeded the configured depth.
	StackOverflow,
	/// A caller of the public API broke its contract.
	Argument { sign: String, message: String },
	Io(std::io::Error),
}

impl Display for FatalError {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			FatalError::CorruptFile(path) => write!(f, "corrupt file: '{}'", path.display()),
			FatalError::IllegalAccess(message) => write!(f, "{message}"),
			FatalError::Memory(size) => write!(f, "failed to allocate memory: {size} bytes"),
			FatalError::ForeignCall { sign, message } => write!(f, "error calling foreign function: {sign}: {message}"),
			FatalError::StackOverflow => write!(f, "bad state: stack overflow"),
			FatalError::Argument { sign, message } => write!(f, "{sign}: {message}"),
			FatalError::Io(error) => write!(f, "{error}"),
		}
	}
}

impl std::error::Error for FatalError {}

impl From<std::io::Error> for FatalError {
	fn from(value: std::io::Error) -> Self {
		Self::Io(value)
	}
}

/// The error channel of the dispatch loop. A program-level `throw` travels
/// as a value here rather than as a host exception; the loop consumes
/// `Throw` while unwinding and only `Fatal` escapes to the embedder.
#[derive(Debug)]
pub enum VmError {
	/// A value thrown by the guest program, pending a handler.
	Throw(ObjRef),
	Fatal(FatalError),
}

impl From<FatalError> for VmError {
	fn from(value: FatalError) -> Self {
		Self::Fatal(value)
	}
}

impl VmError {
	pub fn illegal_access(message: impl Into<String>) -> Self {
		Self::Fatal(FatalError::IllegalAccess(message.into()))
	}
}
