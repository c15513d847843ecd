//! Shared helpers for the integration suites: a tiny code assembler and
//! builders for the raw program records.

#![allow(dead_code)]

use std::path::Path;

use strix::raw::{
	Class, Constant, LineInfo, Metadata, Method, Module, Opcode, Program, Var, MAGIC_EXECUTABLE,
	MAGIC_LIBRARY,
};
use strix::vm::{Settings, StrixVm};

pub fn utf8(text: &str) -> Constant {
	Constant::Utf8(text.into())
}

/// Builds a code vector opcode by opcode.
pub struct Asm(Vec<u8>);

impl Asm {
	pub fn new() -> Self {
		Self(vec![])
	}

	pub fn op(mut self, opcode: Opcode) -> Self {
		self.0.push(opcode as u8);
		self
	}

	pub fn op8(mut self, opcode: Opcode, operand: u8) -> Self {
		self.0.push(opcode as u8);
		self.0.push(operand);
		self
	}

	pub fn op16(mut self, opcode: Opcode, operand: u16) -> Self {
		self.0.push(opcode as u8);
		self.0.extend_from_slice(&operand.to_be_bytes());
		self
	}

	pub fn opi16(mut self, opcode: Opcode, operand: i16) -> Self {
		self.0.push(opcode as u8);
		self.0.extend_from_slice(&operand.to_be_bytes());
		self
	}

	pub fn raw(mut self, bytes: &[u8]) -> Self {
		self.0.extend_from_slice(bytes);
		self
	}

	pub fn build(self) -> Vec<u8> {
		self.0
	}
}

pub fn var(name: u16) -> Var {
	Var { kind: 0, access_flags: 0, name, ty: 0, meta: Metadata::default() }
}

pub fn method(name: u16, args: usize, locals: usize, stack_max: u32, code: Vec<u8>) -> Method {
	Method {
		kind: 0,
		access_flags: 0,
		name,
		args: (0..args).map(|_| var(0)).collect(),
		locals: (0..locals).map(|_| var(0)).collect(),
		closure_start: 0,
		stack_max,
		code,
		exception_table: vec![],
		line_info: LineInfo::default(),
		matches: vec![],
		meta: Metadata::default(),
	}
}

/// The conventional module pool prefix: `[Null, <source>, <name>, <init>]`
/// at indices 0 through 3; callers append their constants from index 4.
pub fn base_pool(name: &str, init: &str) -> Vec<Constant> {
	vec![
		Constant::Null,
		utf8(&format!("{name}.sx")),
		utf8(name),
		utf8(init),
	]
}

pub fn module(name_idx: u16, pool: Vec<Constant>, methods: Vec<Method>) -> Module {
	Module {
		kind: 0,
		compiled_from: 1,
		name: name_idx,
		init: 3,
		globals: vec![],
		methods,
		classes: vec![],
		constant_pool: pool,
		modules: vec![],
		meta: Metadata::default(),
	}
}

pub fn executable(entry_sign: &str, modules: Vec<Module>) -> Program {
	Program {
		magic: MAGIC_EXECUTABLE,
		minor_version: 0,
		major_version: 1,
		entry: 1,
		imports: 0,
		constant_pool: vec![Constant::Null, utf8(entry_sign)],
		modules,
		meta: Metadata::default(),
	}
}

pub fn library(modules: Vec<Module>) -> Program {
	Program {
		magic: MAGIC_LIBRARY,
		minor_version: 0,
		major_version: 1,
		entry: 0,
		imports: 0,
		constant_pool: vec![Constant::Null],
		modules,
		meta: Metadata::default(),
	}
}

pub fn class(name: u16, supers: u16, fields: Vec<Var>, methods: Vec<Method>) -> Class {
	Class {
		kind: 0,
		access_flags: 0,
		name,
		supers,
		fields,
		methods,
		meta: Metadata::default(),
	}
}

pub fn write_program(dir: &Path, file: &str, program: &Program) -> std::path::PathBuf {
	let path = dir.join(file);
	program.write_file(&path).unwrap();
	path
}

/// Runs a program with captured console output; panics on fatal errors.
pub fn run_program(program: &Program, args: Vec<String>) -> (i32, String) {
	let dir = tempfile::tempdir().unwrap();
	let path = write_program(dir.path(), "program.sx", program);
	let vm = StrixVm::new(Settings::default());
	vm.capture_output();
	let code = vm.start(path, args).unwrap();
	(code, vm.captured_output().unwrap())
}
