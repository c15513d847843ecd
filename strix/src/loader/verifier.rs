use std::fmt::{self, Display, Formatter};

use crate::raw::{Class, Constant, LineInfo, MatchRecord, Method, Module, Program, Var};
use crate::raw::{MAGIC_EXECUTABLE, MAGIC_LIBRARY};

/// A structural defect found by the cheap pre-load pass. The loader folds
/// every variant into a corrupt-file error carrying the path; the variant
/// itself is logged.
#[derive(Debug)]
pub enum VerifyError {
	BadMagic(u32),
	BadKind { what: &'static str, value: u8 },
	IndexOutOfRange { what: &'static str, index: u32, count: u32 },
	BadConstant { what: &'static str, index: u16 },
	LineInfoOverflow,
	ClosureStartOutOfRange { closure_start: u16, locals: u16 },
	PoolTooLarge(usize),
}

impl Display for VerifyError {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			VerifyError::BadMagic(magic) => write!(f, "bad magic number: {magic:#010X}"),
			VerifyError::BadKind { what, value } => write!(f, "bad kind byte for {what}: {value:#04X}"),
			VerifyError::IndexOutOfRange { what, index, count } => {
				write!(f, "index out of range for {what}: {index} (count {count})")
			}
			VerifyError::BadConstant { what, index } => {
				write!(f, "constant {index} is not a valid {what}")
			}
			VerifyError::LineInfoOverflow => write!(f, "line info covers more bytes than the code"),
			VerifyError::ClosureStartOutOfRange { closure_start, locals } => {
				write!(f, "closure start {closure_start} exceeds the local count {locals}")
			}
			VerifyError::PoolTooLarge(count) => write!(f, "constant pool too large: {count}"),
		}
	}
}

impl std::error::Error for VerifyError {}

/// Runs the structural checks: magic number, every index against its
/// target table, kind-byte legality, line-info totals and match-case
/// locations against the code size, and `closure_start` against the
/// local count.
pub fn verify(program: &Program) -> Result<(), VerifyError> {
	Verifier { program }.check_program()
}

struct Verifier<'l> {
	program: &'l Program,
}

impl Verifier<'_> {
	fn check_program(&self) -> Result<(), VerifyError> {
		let magic = self.program.magic;
		if magic != MAGIC_EXECUTABLE && magic != MAGIC_LIBRARY {
			return Err(VerifyError::BadMagic(magic));
		}

		let pool = &self.program.constant_pool;
		check_pool_size(pool)?;
		if self.program.entry != 0 {
			check_utf8(pool, self.program.entry, "entry signature")?;
		}
		if self.program.imports != 0 {
			check_range(self.program.imports as u32, pool.len() as u32, "file constant pool")?;
			match pool.get(self.program.imports as usize) {
				Some(Constant::Array(items)) => {
					for item in items {
						if !matches!(item, Constant::Utf8(_)) {
							return Err(VerifyError::BadConstant {
								what: "import path",
								index: self.program.imports,
							});
						}
					}
				}
				_ => {
					return Err(VerifyError::BadConstant {
						what: "import array",
						index: self.program.imports,
					})
				}
			}
		}

		for module in &self.program.modules {
			self.check_module(module)?;
		}
		Ok(())
	}

	fn check_module(&self, module: &Module) -> Result<(), VerifyError> {
		let pool = &module.constant_pool;
		check_pool_size(pool)?;
		check_utf8(pool, module.compiled_from, "module source path")?;
		check_utf8(pool, module.name, "module name")?;
		check_utf8(pool, module.init, "module initializer")?;

		for global in &module.globals {
			check_var(global, pool, "global")?;
		}
		for method in &module.methods {
			check_method(method, pool)?;
		}
		for class in &module.classes {
			check_class(class, pool)?;
		}
		for submodule in &module.modules {
			self.check_module(submodule)?;
		}
		Ok(())
	}
}

fn check_pool_size(pool: &[Constant]) -> Result<(), VerifyError> {
	match pool.len() < u16::MAX as usize {
		true => Ok(()),
		false => Err(VerifyError::PoolTooLarge(pool.len())),
	}
}

fn check_range(index: u32, count: u32, what: &'static str) -> Result<(), VerifyError> {
	match index < count {
		true => Ok(()),
		false => Err(VerifyError::IndexOutOfRange { what, index, count }),
	}
}

fn check_utf8(pool: &[Constant], index: u16, what: &'static str) -> Result<(), VerifyError> {
	check_range(index as u32, pool.len() as u32, "constant pool")?;
	match pool[index as usize] {
		Constant::Utf8(_) => Ok(()),
		_ => Err(VerifyError::BadConstant { what, index }),
	}
}

fn check_var(var: &Var, pool: &[Constant], what: &'static str) -> Result<(), VerifyError> {
	if var.kind > 0x01 {
		return Err(VerifyError::BadKind { what, value: var.kind });
	}
	check_range(var.name as u32, pool.len() as u32, "constant pool")?;
	check_range(var.ty as u32, pool.len() as u32, "constant pool")
}

fn check_method(method: &Method, pool: &[Constant]) -> Result<(), VerifyError> {
	if method.kind > 0x02 {
		return Err(VerifyError::BadKind { what: "method", value: method.kind });
	}
	check_range(method.name as u32, pool.len() as u32, "constant pool")?;
	for arg in &method.args {
		check_var(arg, pool, "arg")?;
	}
	for local in &method.locals {
		check_var(local, pool, "local")?;
	}
	if method.closure_start as usize > method.locals.len() {
		return Err(VerifyError::ClosureStartOutOfRange {
			closure_start: method.closure_start,
			locals: method.locals.len() as u16,
		});
	}

	let code_count = method.code.len() as u32;
	for record in &method.exception_table {
		check_range(record.exception as u32, pool.len() as u32, "constant pool")?;
		if record.start_pc > code_count || record.end_pc > code_count {
			return Err(VerifyError::IndexOutOfRange {
				what: "exception region",
				index: record.start_pc.max(record.end_pc),
				count: code_count,
			});
		}
		check_range(record.target_pc, code_count, "exception target")?;
	}

	check_line_info(&method.line_info, code_count)?;
	for record in &method.matches {
		check_match(record, code_count, pool)?;
	}
	Ok(())
}

fn check_line_info(line_info: &LineInfo, code_count: u32) -> Result<(), VerifyError> {
	match line_info.byte_total() <= code_count as u64 {
		true => Ok(()),
		false => Err(VerifyError::LineInfoOverflow),
	}
}

fn check_match(record: &MatchRecord, code_count: u32, pool: &[Constant]) -> Result<(), VerifyError> {
	for (value, location) in &record.cases {
		check_range(*value as u32, pool.len() as u32, "constant pool")?;
		check_range(*location, code_count, "match case location")?;
	}
	check_range(record.default_location, code_count, "match default location")
}

fn check_class(class: &Class, pool: &[Constant]) -> Result<(), VerifyError> {
	if class.kind > 0x03 {
		return Err(VerifyError::BadKind { what: "class", value: class.kind });
	}
	check_utf8(pool, class.name, "class name")?;
	check_range(class.supers as u32, pool.len() as u32, "constant pool")?;
	match pool.get(class.supers as usize) {
		Some(Constant::Array(items)) => {
			for item in items {
				if !matches!(item, Constant::Utf8(_)) {
					return Err(VerifyError::BadConstant { what: "supertype signature", index: class.supers });
				}
			}
		}
		_ => return Err(VerifyError::BadConstant { what: "supertype array", index: class.supers }),
	}
	for field in &class.fields {
		check_var(field, pool, "field")?;
	}
	for method in &class.methods {
		check_method(method, pool)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::raw::{ExceptionRecord, Metadata};

	fn minimal_program() -> Program {
		Program {
			magic: MAGIC_EXECUTABLE,
			minor_version: 0,
			major_version: 1,
			entry: 1,
			imports: 0,
			constant_pool: vec![Constant::Null, Constant::Utf8("app.main()".into())],
			modules: vec![Module {
				kind: 0,
				compiled_from: 1,
				name: 2,
				init: 3,
				globals: vec![],
				methods: vec![Method {
					kind: 0,
					access_flags: 0,
					name: 4,
					args: vec![],
					locals: vec![],
					closure_start: 0,
					stack_max: 4,
					code: vec![0x6B],
					exception_table: vec![],
					line_info: LineInfo::default(),
					matches: vec![],
					meta: Metadata::default(),
				}],
				classes: vec![],
				constant_pool: vec![
					Constant::Null,
					Constant::Utf8("app.sx".into()),
					Constant::Utf8("app".into()),
					Constant::Utf8("".into()),
					Constant::Utf8("main()".into()),
				],
				modules: vec![],
				meta: Metadata::default(),
			}],
			meta: Metadata::default(),
		}
	}

	#[test]
	fn a_minimal_program_verifies() {
		verify(&minimal_program()).unwrap();
	}

	#[test]
	fn bad_magic_is_rejected() {
		let mut program = minimal_program();
		program.magic = 0x1234_5678;
		assert!(matches!(verify(&program), Err(VerifyError::BadMagic(_))));
	}

	#[test]
	fn out_of_range_name_is_rejected() {
		let mut program = minimal_program();
		program.modules[0].methods[0].name = 99;
		assert!(matches!(verify(&program), Err(VerifyError::IndexOutOfRange { .. })));
	}

	#[test]
	fn bad_kind_bytes_are_rejected() {
		let mut program = minimal_program();
		program.modules[0].methods[0].kind = 3;
		assert!(matches!(verify(&program), Err(VerifyError::BadKind { what: "method", .. })));
	}

	#[test]
	fn closure_start_beyond_locals_is_rejected() {
		let mut program = minimal_program();
		program.modules[0].methods[0].closure_start = 1;
		assert!(matches!(verify(&program), Err(VerifyError::ClosureStartOutOfRange { .. })));
	}

	#[test]
	fn line_info_overflow_is_rejected() {
		let mut program = minimal_program();
		program.modules[0].methods[0].line_info = LineInfo { numbers: vec![(2, 1)] };
		assert!(matches!(verify(&program), Err(VerifyError::LineInfoOverflow)));
	}

	#[test]
	fn exception_targets_must_sit_inside_the_code() {
		let mut program = minimal_program();
		program.modules[0].methods[0].exception_table = vec![ExceptionRecord {
			start_pc: 0,
			end_pc: 1,
			target_pc: 5,
			exception: 0,
			meta: Metadata::default(),
		}];
		assert!(matches!(verify(&program), Err(VerifyError::IndexOutOfRange { .. })));
	}

	#[test]
	fn match_locations_are_checked_against_the_code() {
		let mut program = minimal_program();
		program.modules[0].methods[0].matches = vec![crate::raw::MatchRecord {
			cases: vec![(0, 9)],
			default_location: 0,
			meta: Metadata::default(),
		}];
		assert!(matches!(verify(&program), Err(VerifyError::IndexOutOfRange { .. })));
	}

	#[test]
	fn entry_must_name_a_string_constant() {
		let mut program = minimal_program();
		program.entry = 0x0000;
		verify(&program).unwrap();
		program.entry = 1;
		program.constant_pool[1] = Constant::Int(9);
		assert!(matches!(verify(&program), Err(VerifyError::BadConstant { .. })));
	}

	#[test]
	fn import_array_shape_is_checked() {
		let mut program = minimal_program();
		program.constant_pool.push(Constant::Array(vec![Constant::Int(1)]));
		program.imports = 2;
		assert!(matches!(verify(&program), Err(VerifyError::BadConstant { .. })));
	}
}
