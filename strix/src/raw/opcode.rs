use std::fmt::{self, Display, Formatter};
use std::io::{Cursor, Error, ErrorKind, Read, Result};

use byteorder::{BigEndian, ReadBytesExt};

/// Shape of the bytes following an opcode byte. Opcodes that reference
/// the constant pool come in pairs: a wide form with a `u16` operand and
/// a fast form (`*F`) with a `u8` operand; their semantics are identical.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandKind {
	None,
	U8,
	U16,
	I16,
	/// The variable-length capture list of `CLOSURELOAD`.
	Captures,
}

macro_rules! define_opcodes {
	(
		$(
			$(#[$attr:meta])*
			$name:ident [$operand:ident] = $value:literal
		),* $(,)?
	) => {
		#[repr(u8)]
		#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
		pub enum Opcode {
			$(
				$(#[$attr])*
				$name = $value
			),*
		}

		impl Opcode {
			pub fn from_byte(byte: u8) -> Option<Self> {
				match byte {
					$($value => Some(Opcode::$name),)*
					_ => None,
				}
			}

			pub const fn operand(self) -> OperandKind {
				match self {
					$(Opcode::$name => OperandKind::$operand,)*
				}
			}

			pub const fn mnemonic(self) -> &'static str {
				paste::paste! {
					match self {
						$(Opcode::$name => stringify!([<$name:lower>]),)*
					}
				}
			}
		}
	};
}

define_opcodes! {
	/// Do nothing.
	Nop [None] = 0x00,
	/// Push the pool constant at the wide index.
	Const [U16] = 0x01,
	ConstF [U8] = 0x02,
	/// Push a fresh null.
	ConstNull [None] = 0x03,
	ConstTrue [None] = 0x04,
	ConstFalse [None] = 0x05,
	/// Discard the top of the stack.
	Pop [None] = 0x06,
	/// Discard the top n items.
	NPop [U8] = 0x07,
	/// Duplicate the top of the stack.
	Dup [None] = 0x08,
	/// Push the top of the stack n more times.
	NDup [U8] = 0x09,
	/// Push the global named by the pool signature.
	GLoad [U16] = 0x0A,
	GLoadF [U8] = 0x0B,
	/// Store the top of the stack into the named global, keeping it.
	GStore [U16] = 0x0C,
	GStoreF [U8] = 0x0D,
	/// Pop the top of the stack into the named global.
	PGStore [U16] = 0x0E,
	PGStoreF [U8] = 0x0F,
	/// Push the local at the wide index.
	LLoad [U16] = 0x10,
	LLoadF [U8] = 0x11,
	LStore [U16] = 0x12,
	LStoreF [U8] = 0x13,
	PLStore [U16] = 0x14,
	PLStoreF [U8] = 0x15,
	/// Push the argument at the index.
	ALoad [U8] = 0x16,
	AStore [U8] = 0x17,
	PAStore [U8] = 0x18,
	/// Pop an object, push its member named by the pool signature.
	MLoad [U16] = 0x19,
	MLoadF [U8] = 0x1A,
	/// Pop an object, store the (kept) top of the stack into its member.
	MStore [U16] = 0x1B,
	MStoreF [U8] = 0x1C,
	PMStore [U16] = 0x1D,
	PMStoreF [U8] = 0x1E,
	/// Pop a receiver, push the named method bound to it.
	SpLoad [U16] = 0x1F,
	SpLoadF [U8] = 0x20,
	/// Pop n values, push an array holding them in order.
	ArrPack [U8] = 0x21,
	/// Pop an array, push its elements in order.
	ArrUnpack [None] = 0x22,
	/// Push a new null-filled array of the given length.
	ArrBuild [U16] = 0x23,
	ArrBuildF [U8] = 0x24,
	/// Pop an array then an index, push the element.
	ILoad [None] = 0x25,
	/// Pop an array then an index, store the (kept) top into the slot.
	IStore [None] = 0x26,
	PIStore [None] = 0x27,
	/// Pop an array, push its length.
	ArrLen [None] = 0x28,
	/// Pop a method above n arguments and call it.
	Invoke [U8] = 0x29,
	/// Virtual call: resolve the pool signature on the receiver.
	VInvoke [U16] = 0x2A,
	VInvokeF [U8] = 0x2B,
	/// Call the global named by the pool signature.
	GInvoke [U16] = 0x2C,
	GInvokeF [U8] = 0x2D,
	/// Call the method held in the local at the index.
	LInvoke [U16] = 0x2E,
	LInvokeF [U8] = 0x2F,
	/// Call the method held in the argument at the index.
	AInvoke [U8] = 0x30,
	/// Super call: the named method with the receiver below the args.
	SpInvoke [U16] = 0x31,
	SpInvokeF [U8] = 0x32,
	/// Push the return offset and jump by the relative offset.
	CallSub [I16] = 0x33,
	/// Pop the return offset and jump to it.
	RetSub [None] = 0x34,
	/// Jump by the signed offset, relative to the byte after the operand.
	Jmp [I16] = 0x35,
	/// Pop one; jump when it is truthy.
	Jt [I16] = 0x36,
	/// Pop one; jump when it is falsy.
	Jf [I16] = 0x37,
	/// Pop two; jump on the ordered comparison.
	Jlt [I16] = 0x38,
	Jle [I16] = 0x39,
	Jeq [I16] = 0x3A,
	Jne [I16] = 0x3B,
	Jge [I16] = 0x3C,
	Jgt [I16] = 0x3D,
	/// Boolean not.
	Not [None] = 0x3E,
	/// Bitwise complement over Int.
	Inv [None] = 0x3F,
	/// Arithmetic negation over a number.
	Neg [None] = 0x40,
	Add [None] = 0x41,
	Sub [None] = 0x42,
	Mul [None] = 0x43,
	Div [None] = 0x44,
	Rem [None] = 0x45,
	Pow [None] = 0x46,
	And [None] = 0x47,
	Or [None] = 0x48,
	Xor [None] = 0x49,
	Shl [None] = 0x4A,
	Shr [None] = 0x4B,
	/// Unsigned (logical) right shift.
	UShr [None] = 0x4C,
	Rol [None] = 0x4D,
	Ror [None] = 0x4E,
	/// String concatenation.
	Concat [None] = 0x4F,
	Lt [None] = 0x50,
	Le [None] = 0x51,
	Eq [None] = 0x52,
	Ne [None] = 0x53,
	Ge [None] = 0x54,
	Gt [None] = 0x55,
	/// Identity comparison.
	Is [None] = 0x56,
	NIs [None] = 0x57,
	IsNull [None] = 0x58,
	NIsNull [None] = 0x59,
	/// Pop a value, push its type.
	GetType [None] = 0x5A,
	/// Safe cast: pop a type then a value; push the cast value or null.
	SCast [None] = 0x5B,
	/// Checked cast: as `SCast` but throws on failure.
	CCast [None] = 0x5C,
	I2F [None] = 0x5D,
	F2I [None] = 0x5E,
	I2B [None] = 0x5F,
	B2I [None] = 0x60,
	/// Truth value of any object.
	O2B [None] = 0x61,
	/// VM string form of any object.
	O2S [None] = 0x62,
	/// Pop one and lock its monitor.
	EnterMonitor [None] = 0x63,
	/// Pop one and unlock its monitor.
	ExitMonitor [None] = 0x64,
	/// Pop the scrutinee and jump through the indexed match table.
	MtPerf [U16] = 0x65,
	MtPerfF [U8] = 0x66,
	/// Pop a method, deep-copy it and install the listed captures.
	ClosureLoad [Captures] = 0x67,
	/// Pop a type, push a new instance of it.
	ObjLoad [None] = 0x68,
	/// Pop a value and unwind to the nearest matching handler.
	Throw [None] = 0x69,
	/// Pop the return value, pop the frame, deliver to the caller.
	Ret [None] = 0x6A,
	/// Pop the frame, deliver null to the caller.
	VRet [None] = 0x6B,
	/// Pop a value and write its string form plus newline to the console.
	Println [None] = 0x6C,
}

/// Source of a captured slot in a `CLOSURELOAD` record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CaptureSource {
	Arg(u8),
	Local(u16),
}

/// A decoded operand, for disassembly and tooling; the interpreter reads
/// operands straight from the code bytes instead.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
	None,
	U8(u8),
	U16(u16),
	I16(i16),
	Captures(Vec<(u16, CaptureSource)>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instr {
	pub opcode: Opcode,
	pub operand: Operand,
}

impl Display for Instr {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.opcode.mnemonic())?;
		match &self.operand {
			Operand::None => Ok(()),
			Operand::U8(value) => write!(f, " {value}"),
			Operand::U16(value) => write!(f, " {value}"),
			Operand::I16(value) => write!(f, " {value:+}"),
			Operand::Captures(captures) => {
				for (dest, source) in captures {
					match source {
						CaptureSource::Arg(i) => write!(f, " {dest}<-a{i}")?,
						CaptureSource::Local(i) => write!(f, " {dest}<-l{i}")?,
					}
				}
				Ok(())
			}
		}
	}
}

impl Instr {
	pub fn read(stream: &mut Cursor<&[u8]>) -> Result<Self> {
		let byte = stream.read_u8()?;
		let opcode = Opcode::from_byte(byte)
			.ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("unknown opcode {byte:#04X}")))?;
		let operand = match opcode.operand() {
			OperandKind::None => Operand::None,
			OperandKind::U8 => Operand::U8(stream.read_u8()?),
			OperandKind::U16 => Operand::U16(stream.read_u16::<BigEndian>()?),
			OperandKind::I16 => Operand::I16(stream.read_i16::<BigEndian>()?),
			OperandKind::Captures => {
				let count = stream.read_u8()?;
				let mut captures = Vec::with_capacity(count as usize);
				for _ in 0..count {
					let dest = stream.read_u16::<BigEndian>()?;
					let source = match stream.read_u8()? {
						0x00 => CaptureSource::Arg(stream.read_u8()?),
						0x01 => CaptureSource::Local(stream.read_u16::<BigEndian>()?),
						kind => {
							return Err(Error::new(
								ErrorKind::InvalidData,
								format!("unknown capture kind {kind:#04X}"),
							))
						}
					};
					captures.push((dest, source));
				}
				Operand::Captures(captures)
			}
		};
		Ok(Self { opcode, operand })
	}
}

/// Walks a code vector instruction by instruction, yielding each byte
/// offset and the decoded instruction at it.
pub struct OpcodeIterator<'l> {
	cursor: Cursor<&'l [u8]>,
}

impl<'l> OpcodeIterator<'l> {
	pub fn new(bytes: &'l [u8]) -> Self {
		Self { cursor: Cursor::new(bytes) }
	}
}

impl<'l> Iterator for OpcodeIterator<'l> {
	type Item = (u64, Result<Instr>);

	fn next(&mut self) -> Option<Self::Item> {
		let position = self.cursor.position();
		match position == self.cursor.get_ref().len() as u64 {
			true => None,
			false => Some((position, Instr::read(&mut self.cursor))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_byte_round_trips_through_the_decoder() {
		let mut seen = 0;
		for byte in 0..=u8::MAX {
			if let Some(opcode) = Opcode::from_byte(byte) {
				assert_eq!(opcode as u8, byte);
				seen += 1;
			}
		}
		assert_eq!(seen, 0x6D);
	}

	#[test]
	fn fast_variants_share_semantics_with_distinct_widths() {
		assert_eq!(Opcode::Const.operand(), OperandKind::U16);
		assert_eq!(Opcode::ConstF.operand(), OperandKind::U8);
		assert_eq!(Opcode::GLoad.operand(), OperandKind::U16);
		assert_eq!(Opcode::GLoadF.operand(), OperandKind::U8);
	}

	#[test]
	fn mnemonics_are_lowercase_names() {
		assert_eq!(Opcode::Nop.mnemonic(), "nop");
		assert_eq!(Opcode::ClosureLoad.mnemonic(), "closureload");
		assert_eq!(Opcode::PGStoreF.mnemonic(), "pgstoref");
	}

	#[test]
	fn iterator_decodes_offsets_and_operands() {
		// const 1; jmp +2; println
		let code = [0x01, 0x00, 0x01, 0x35, 0x00, 0x02, 0x6C];
		let decoded: Vec<_> = OpcodeIterator::new(&code)
			.map(|(offset, instr)| (offset, instr.unwrap()))
			.collect();
		assert_eq!(decoded.len(), 3);
		assert_eq!(decoded[0].0, 0);
		assert_eq!(decoded[0].1.opcode, Opcode::Const);
		assert_eq!(decoded[1].1.operand, Operand::I16(2));
		assert_eq!(decoded[2].0, 6);
	}

	#[test]
	fn closure_capture_records_decode() {
		// closureload with 2 captures: dest 0 <- arg 1, dest 1 <- local 3
		let code = [0x67, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0x00, 0x03];
		let (_, instr) = OpcodeIterator::new(&code).next().unwrap();
		let instr = instr.unwrap();
		assert_eq!(instr.opcode, Opcode::ClosureLoad);
		assert_eq!(
			instr.operand,
			Operand::Captures(vec![
				(0, CaptureSource::Arg(1)),
				(1, CaptureSource::Local(3)),
			])
		);
	}
}
