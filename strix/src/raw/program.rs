use std::fmt::Formatter;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use derivative::Derivative;

use crate::raw::constant::{checked_u16, Constant, Metadata};
use crate::raw::opcode::OpcodeIterator;
use crate::raw::CodecError;

/// Magic number of an executable program (carries an entry point).
pub const MAGIC_EXECUTABLE: u32 = 0xC0FF_EEDE;
/// Magic number of a linkable library (entry index is zero).
pub const MAGIC_LIBRARY: u32 = 0xDEAD_CAFE;

/// The top-level record of a program file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
	pub magic: u32,
	pub minor_version: u32,
	pub major_version: u32,
	/// File-pool index of the entry-point signature, 0 for libraries.
	pub entry: u16,
	/// File-pool index of the import-path array constant, 0 when absent.
	pub imports: u16,
	pub constant_pool: Vec<Constant>,
	pub modules: Vec<Module>,
	pub meta: Metadata,
}

impl Program {
	pub fn read(stream: &mut impl Read) -> Result<Self, CodecError> {
		let magic = stream.read_u32::<BigEndian>()?;
		if magic != MAGIC_EXECUTABLE && magic != MAGIC_LIBRARY {
			return Err(CodecError::InvalidMagic(magic));
		}
		Ok(Self {
			magic,
			minor_version: stream.read_u32::<BigEndian>()?,
			major_version: stream.read_u32::<BigEndian>()?,
			entry: stream.read_u16::<BigEndian>()?,
			imports: stream.read_u16::<BigEndian>()?,
			constant_pool: read_table(stream, Constant::read)?,
			modules: read_table(stream, Module::read)?,
			meta: Metadata::read(stream)?,
		})
	}

	pub fn write(&self, stream: &mut impl Write) -> Result<(), CodecError> {
		stream.write_u32::<BigEndian>(self.magic)?;
		stream.write_u32::<BigEndian>(self.minor_version)?;
		stream.write_u32::<BigEndian>(self.major_version)?;
		stream.write_u16::<BigEndian>(self.entry)?;
		stream.write_u16::<BigEndian>(self.imports)?;
		write_pool(stream, &self.constant_pool)?;
		write_table(stream, &self.modules, "module table", Module::write)?;
		self.meta.write(stream)
	}

	#[cfg(feature = "memmap2")]
	pub fn read_file(path: impl AsRef<Path>) -> Result<Self, CodecError> {
		let file = File::open(path)?;
		let map = unsafe { memmap2::Mmap::map(&file)? };
		Self::read(&mut std::io::Cursor::new(&map[..]))
	}

	#[cfg(not(feature = "memmap2"))]
	pub fn read_file(path: impl AsRef<Path>) -> Result<Self, CodecError> {
		let file = File::open(path)?;
		Self::read(&mut std::io::BufReader::new(file))
	}

	pub fn write_file(&self, path: impl AsRef<Path>) -> Result<(), CodecError> {
		let mut stream = std::io::BufWriter::new(File::create(path)?);
		self.write(&mut stream)?;
		stream.flush()?;
		Ok(())
	}

	pub fn is_executable(&self) -> bool {
		self.magic == MAGIC_EXECUTABLE
	}
}

/// A module record: globals, methods, classes, a module-local constant
/// pool and nested submodules.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Module {
	pub kind: u8,
	pub compiled_from: u16,
	pub name: u16,
	pub init: u16,
	pub globals: Vec<Var>,
	pub methods: Vec<Method>,
	pub classes: Vec<Class>,
	pub constant_pool: Vec<Constant>,
	pub modules: Vec<Module>,
	pub meta: Metadata,
}

impl Module {
	pub fn read(stream: &mut impl Read) -> Result<Self, CodecError> {
		Ok(Self {
			kind: stream.read_u8()?,
			compiled_from: stream.read_u16::<BigEndian>()?,
			name: stream.read_u16::<BigEndian>()?,
			init: stream.read_u16::<BigEndian>()?,
			globals: read_table(stream, Var::read)?,
			methods: read_table(stream, Method::read)?,
			classes: read_table(stream, Class::read)?,
			constant_pool: read_table(stream, Constant::read)?,
			modules: read_table(stream, Module::read)?,
			meta: Metadata::read(stream)?,
		})
	}

	pub fn write(&self, stream: &mut impl Write) -> Result<(), CodecError> {
		stream.write_u8(self.kind)?;
		stream.write_u16::<BigEndian>(self.compiled_from)?;
		stream.write_u16::<BigEndian>(self.name)?;
		stream.write_u16::<BigEndian>(self.init)?;
		write_table(stream, &self.globals, "global table", Var::write)?;
		write_table(stream, &self.methods, "method table", Method::write)?;
		write_table(stream, &self.classes, "class table", Class::write)?;
		write_pool(stream, &self.constant_pool)?;
		write_table(stream, &self.modules, "submodule table", Module::write)?;
		self.meta.write(stream)
	}
}

/// A variable record. Globals, fields, args and locals all share this
/// shape: kind byte (0 var, 1 const), access flags, name and
/// type-signature pool indices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Var {
	pub kind: u8,
	pub access_flags: u16,
	pub name: u16,
	pub ty: u16,
	pub meta: Metadata,
}

impl Var {
	pub fn read(stream: &mut impl Read) -> Result<Self, CodecError> {
		Ok(Self {
			kind: stream.read_u8()?,
			access_flags: stream.read_u16::<BigEndian>()?,
			name: stream.read_u16::<BigEndian>()?,
			ty: stream.read_u16::<BigEndian>()?,
			meta: Metadata::read(stream)?,
		})
	}

	pub fn write(&self, stream: &mut impl Write) -> Result<(), CodecError> {
		stream.write_u8(self.kind)?;
		stream.write_u16::<BigEndian>(self.access_flags)?;
		stream.write_u16::<BigEndian>(self.name)?;
		stream.write_u16::<BigEndian>(self.ty)?;
		self.meta.write(stream)
	}
}

/// A class record. Kind byte: 0 class, 1 interface, 2 annotation, 3 enum.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Class {
	pub kind: u8,
	pub access_flags: u16,
	pub name: u16,
	/// Pool index of the array constant holding supertype signatures.
	pub supers: u16,
	pub fields: Vec<Var>,
	pub methods: Vec<Method>,
	pub meta: Metadata,
}

impl Class {
	pub fn read(stream: &mut impl Read) -> Result<Self, CodecError> {
		Ok(Self {
			kind: stream.read_u8()?,
			access_flags: stream.read_u16::<BigEndian>()?,
			name: stream.read_u16::<BigEndian>()?,
			supers: stream.read_u16::<BigEndian>()?,
			fields: read_table(stream, Var::read)?,
			methods: read_table(stream, Method::read)?,
			meta: Metadata::read(stream)?,
		})
	}

	pub fn write(&self, stream: &mut impl Write) -> Result<(), CodecError> {
		stream.write_u8(self.kind)?;
		stream.write_u16::<BigEndian>(self.access_flags)?;
		stream.write_u16::<BigEndian>(self.name)?;
		stream.write_u16::<BigEndian>(self.supers)?;
		write_table(stream, &self.fields, "field table", Var::write)?;
		write_table(stream, &self.methods, "method table", Method::write)?;
		self.meta.write(stream)
	}
}

/// A method record. Kind byte: 0 function, 1 method, 2 constructor.
/// `closure_start` is the index within the locals at which captured
/// variables begin.
#[derive(Clone, Derivative, Default, PartialEq)]
#[derivative(Debug)]
pub struct Method {
	pub kind: u8,
	pub access_flags: u16,
	pub name: u16,
	pub args: Vec<Var>,
	pub locals: Vec<Var>,
	pub closure_start: u16,
	pub stack_max: u32,
	#[derivative(Debug(format_with = "debug_code"))]
	pub code: Vec<u8>,
	pub exception_table: Vec<ExceptionRecord>,
	pub line_info: LineInfo,
	pub matches: Vec<MatchRecord>,
	pub meta: Metadata,
}

impl Method {
	pub fn read(stream: &mut impl Read) -> Result<Self, CodecError> {
		let kind = stream.read_u8()?;
		let access_flags = stream.read_u16::<BigEndian>()?;
		let name = stream.read_u16::<BigEndian>()?;

		let args_count = stream.read_u8()?;
		let mut args = Vec::with_capacity(args_count as usize);
		for _ in 0..args_count {
			args.push(Var::read(stream)?);
		}

		let locals_count = stream.read_u16::<BigEndian>()?;
		let closure_start = stream.read_u16::<BigEndian>()?;
		let mut locals = Vec::with_capacity(locals_count as usize);
		for _ in 0..locals_count {
			locals.push(Var::read(stream)?);
		}

		let stack_max = stream.read_u32::<BigEndian>()?;
		let code_count = stream.read_u32::<BigEndian>()?;
		let mut code = vec![0u8; code_count as usize];
		stream.read_exact(&mut code)?;

		Ok(Self {
			kind,
			access_flags,
			name,
			args,
			locals,
			closure_start,
			stack_max,
			code,
			exception_table: read_table(stream, ExceptionRecord::read)?,
			line_info: LineInfo::read(stream)?,
			matches: read_table(stream, MatchRecord::read)?,
			meta: Metadata::read(stream)?,
		})
	}

	pub fn write(&self, stream: &mut impl Write) -> Result<(), CodecError> {
		stream.write_u8(self.kind)?;
		stream.write_u16::<BigEndian>(self.access_flags)?;
		stream.write_u16::<BigEndian>(self.name)?;

		let args_count = u8::try_from(self.args.len()).map_err(|_| CodecError::CountOverflow("arg table"))?;
		stream.write_u8(args_count)?;
		for arg in &self.args {
			arg.write(stream)?;
		}

		stream.write_u16::<BigEndian>(checked_u16(self.locals.len(), "local table")?)?;
		stream.write_u16::<BigEndian>(self.closure_start)?;
		for local in &self.locals {
			local.write(stream)?;
		}

		stream.write_u32::<BigEndian>(self.stack_max)?;
		let code_count = u32::try_from(self.code.len()).map_err(|_| CodecError::CountOverflow("code"))?;
		stream.write_u32::<BigEndian>(code_count)?;
		stream.write_all(&self.code)?;

		write_table(stream, &self.exception_table, "exception table", ExceptionRecord::write)?;
		self.line_info.write(stream)?;
		write_table(stream, &self.matches, "match table", MatchRecord::write)?;
		self.meta.write(stream)
	}
}

/// One protected region: `[start_pc, end_pc)` guarded by a handler at
/// `target_pc` for throwables of the pool-named exception type.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExceptionRecord {
	pub start_pc: u32,
	pub end_pc: u32,
	pub target_pc: u32,
	pub exception: u16,
	pub meta: Metadata,
}

impl ExceptionRecord {
	pub fn read(stream: &mut impl Read) -> Result<Self, CodecError> {
		Ok(Self {
			start_pc: stream.read_u32::<BigEndian>()?,
			end_pc: stream.read_u32::<BigEndian>()?,
			target_pc: stream.read_u32::<BigEndian>()?,
			exception: stream.read_u16::<BigEndian>()?,
			meta: Metadata::read(stream)?,
		})
	}

	pub fn write(&self, stream: &mut impl Write) -> Result<(), CodecError> {
		stream.write_u32::<BigEndian>(self.start_pc)?;
		stream.write_u32::<BigEndian>(self.end_pc)?;
		stream.write_u32::<BigEndian>(self.target_pc)?;
		stream.write_u16::<BigEndian>(self.exception)?;
		self.meta.write(stream)
	}
}

/// Run-length-encoded source line numbers: each entry maps `times`
/// consecutive code bytes to one source line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LineInfo {
	pub numbers: Vec<(u8, u32)>,
}

impl LineInfo {
	pub fn read(stream: &mut impl Read) -> Result<Self, CodecError> {
		let count = stream.read_u16::<BigEndian>()?;
		let mut numbers = Vec::with_capacity(count as usize);
		for _ in 0..count {
			let times = stream.read_u8()?;
			let lineno = stream.read_u32::<BigEndian>()?;
			numbers.push((times, lineno));
		}
		Ok(Self { numbers })
	}

	pub fn write(&self, stream: &mut impl Write) -> Result<(), CodecError> {
		stream.write_u16::<BigEndian>(checked_u16(self.numbers.len(), "line info")?)?;
		for (times, lineno) in &self.numbers {
			stream.write_u8(*times)?;
			stream.write_u32::<BigEndian>(*lineno)?;
		}
		Ok(())
	}

	/// Total number of code bytes covered by the table.
	pub fn byte_total(&self) -> u64 {
		self.numbers.iter().map(|(times, _)| *times as u64).sum()
	}
}

/// A pattern-match dispatch table: pool-indexed case values mapped to code
/// locations, plus the default location.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchRecord {
	pub cases: Vec<(u16, u32)>,
	pub default_location: u32,
	pub meta: Metadata,
}

impl MatchRecord {
	pub fn read(stream: &mut impl Read) -> Result<Self, CodecError> {
		let count = stream.read_u16::<BigEndian>()?;
		let mut cases = Vec::with_capacity(count as usize);
		for _ in 0..count {
			let value = stream.read_u16::<BigEndian>()?;
			let location = stream.read_u32::<BigEndian>()?;
			cases.push((value, location));
		}
		Ok(Self {
			cases,
			default_location: stream.read_u32::<BigEndian>()?,
			meta: Metadata::read(stream)?,
		})
	}

	pub fn write(&self, stream: &mut impl Write) -> Result<(), CodecError> {
		stream.write_u16::<BigEndian>(checked_u16(self.cases.len(), "match cases")?)?;
		for (value, location) in &self.cases {
			stream.write_u16::<BigEndian>(*value)?;
			stream.write_u32::<BigEndian>(*location)?;
		}
		stream.write_u32::<BigEndian>(self.default_location)?;
		self.meta.write(stream)
	}
}

fn read_table<T, S: Read>(
	stream: &mut S,
	read: impl Fn(&mut S) -> Result<T, CodecError>,
) -> Result<Vec<T>, CodecError> {
	let count = stream.read_u16::<BigEndian>()?;
	let mut entries = Vec::with_capacity(count as usize);
	for _ in 0..count {
		entries.push(read(stream)?);
	}
	Ok(entries)
}

fn write_table<T, S: Write>(
	stream: &mut S,
	entries: &[T],
	what: &'static str,
	write: impl Fn(&T, &mut S) -> Result<(), CodecError>,
) -> Result<(), CodecError> {
	stream.write_u16::<BigEndian>(checked_u16(entries.len(), what)?)?;
	for entry in entries {
		write(entry, stream)?;
	}
	Ok(())
}

// The effective pool size must stay below the reserved 16-bit maximum.
fn write_pool(stream: &mut impl Write, pool: &[Constant]) -> Result<(), CodecError> {
	if pool.len() >= u16::MAX as usize {
		return Err(CodecError::CountOverflow("constant pool"));
	}
	stream.write_u16::<BigEndian>(pool.len() as u16)?;
	for constant in pool {
		constant.write(stream)?;
	}
	Ok(())
}

fn debug_code(bytes: &[u8], fmt: &mut Formatter) -> std::fmt::Result {
	let mut dbg = fmt.debug_list();
	for (offset, instr) in OpcodeIterator::new(bytes) {
		match instr {
			Ok(instr) => dbg.entry(&format_args!("{offset:08X}\t{instr}")),
			Err(_) => dbg.entry(&format_args!("{offset:08X}\t??")),
		};
	}
	dbg.finish()
}
