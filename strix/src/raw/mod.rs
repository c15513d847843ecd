//! The raw, on-disk representation of a program: record structures that
//! mirror the binary layout byte for byte, plus the codec that reads and
//! writes them. All multi-byte integers are big-endian; nested counts are
//! authoritative and the reader never probes.

use std::fmt::{self, Display, Formatter};

pub mod constant;
pub mod opcode;
pub mod program;

pub use constant::{Constant, Metadata};
pub use opcode::{CaptureSource, Opcode, OpcodeIterator, Operand, OperandKind};
pub use program::{
	Class, ExceptionRecord, LineInfo, MatchRecord, Method, Module, Program, Var, MAGIC_EXECUTABLE,
	MAGIC_LIBRARY,
};

/// Errors produced by the reader and writer. The loader folds all of these
/// into a corrupt-file error carrying the offending path.
#[derive(Debug)]
pub enum CodecError {
	Io(std::io::Error),
	InvalidMagic(u32),
	InvalidTag(u8),
	InvalidUtf8,
	/// A count re-derived while writing does not fit its field width.
	CountOverflow(&'static str),
}

impl Display for CodecError {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			CodecError::Io(error) => write!(f, "{error}"),
			CodecError::InvalidMagic(magic) => write!(f, "invalid magic number: {magic:#010X}"),
			CodecError::InvalidTag(tag) => write!(f, "invalid constant tag: {tag:#04X}"),
			CodecError::InvalidUtf8 => write!(f, "invalid utf-8 in string constant"),
			CodecError::CountOverflow(what) => write!(f, "too many entries for {what}"),
		}
	}
}

impl std::error::Error for CodecError {}

impl From<std::io::Error> for CodecError {
	fn from(value: std::io::Error) -> Self {
		Self::Io(value)
	}
}
