//! The codec round-trip laws: `read(write(P)) == P` structurally, and
//! `write ∘ read` byte-identical on well-formed files.

mod common;

use common::*;
use strix::raw::{
	CodecError, Constant, ExceptionRecord, LineInfo, MatchRecord, Metadata, Opcode, Program, Var,
};

fn rich_program() -> Program {
	let mut pool = base_pool("rich", "rich.boot()");
	pool.push(utf8("main()")); // 4
	pool.push(utf8("boot()")); // 5
	pool.push(Constant::Int(-5)); // 6
	pool.push(Constant::from_f64(2.5)); // 7
	pool.push(Constant::Char('Ω' as u32)); // 8
	pool.push(Constant::True); // 9
	pool.push(Constant::False); // 10
	pool.push(Constant::Array(vec![Constant::Utf8("basic.any".into())])); // 11
	pool.push(utf8("Thing")); // 12
	pool.push(utf8("field")); // 13
	pool.push(utf8("touch()")); // 14
	pool.push(utf8("inner")); // 15
	pool.push(utf8("rich.Oops")); // 16
	pool.push(utf8("Oops")); // 17
	pool.push(Constant::Array(vec![Constant::Int(1), Constant::Array(vec![Constant::True])])); // 18

	let mut main = method(
		4,
		1,
		2,
		8,
		Asm::new()
			.op8(Opcode::ConstF, 6)
			.op(Opcode::Println)
			.op(Opcode::VRet)
			.build(),
	);
	main.closure_start = 1;
	main.exception_table = vec![ExceptionRecord {
		start_pc: 0,
		end_pc: 3,
		target_pc: 2,
		exception: 16,
		meta: Metadata(vec![("k".into(), "v".into())]),
	}];
	main.line_info = LineInfo { numbers: vec![(2, 10), (2, 11)] };
	main.matches = vec![MatchRecord {
		cases: vec![(6, 0), (9, 2)],
		default_location: 2,
		meta: Metadata::default(),
	}];
	main.meta = Metadata(vec![("doc".into(), "entry".into())]);

	let thing = class(
		12,
		11,
		vec![Var { kind: 1, access_flags: 0x1001, name: 13, ty: 0, meta: Metadata::default() }],
		vec![method(14, 0, 1, 4, Asm::new().op(Opcode::VRet).build())],
	);

	let mut inner = module(15, base_pool("inner", ""), vec![]);
	inner.globals = vec![var(2)];

	let mut rich = module(2, pool, vec![main, boot()]);
	rich.classes = vec![thing, class(17, 11, vec![], vec![])];
	rich.globals = vec![var(13)];
	rich.modules = vec![inner];

	let mut program = executable("rich.main()", vec![rich]);
	program.meta = Metadata(vec![("compiler".into(), "spc 0.1".into())]);
	program
}

fn boot() -> strix::raw::Method {
	method(5, 0, 0, 4, Asm::new().op(Opcode::VRet).build())
}

#[test]
fn structural_round_trip() {
	let program = rich_program();
	let mut bytes = vec![];
	program.write(&mut bytes).unwrap();
	let back = Program::read(&mut std::io::Cursor::new(bytes)).unwrap();
	assert_eq!(back, program);
}

#[test]
fn write_after_read_is_byte_identical() {
	let program = rich_program();
	let mut first = vec![];
	program.write(&mut first).unwrap();
	let back = Program::read(&mut std::io::Cursor::new(first.clone())).unwrap();
	let mut second = vec![];
	back.write(&mut second).unwrap();
	assert_eq!(first, second);
}

#[test]
fn round_trip_through_the_filesystem() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("rich.sx");
	let program = rich_program();
	program.write_file(&path).unwrap();
	let back = Program::read_file(&path).unwrap();
	assert_eq!(back, program);
}

#[test]
fn truncated_files_are_rejected() {
	let program = rich_program();
	let mut bytes = vec![];
	program.write(&mut bytes).unwrap();
	bytes.truncate(bytes.len() / 2);
	let result = Program::read(&mut std::io::Cursor::new(bytes));
	assert!(matches!(result, Err(CodecError::Io(_))));
}

#[test]
fn an_unknown_constant_tag_is_rejected() {
	let mut pool = base_pool("t", "");
	pool.push(utf8("main()"));
	let program = executable("t.main()", vec![module(2, pool, vec![])]);
	let mut bytes = vec![];
	program.write(&mut bytes).unwrap();

	// The file pool's first entry (Null, tag 0x00) sits right after the
	// fixed header plus the pool count.
	let header = 4 + 4 + 4 + 2 + 2 + 2;
	assert_eq!(bytes[header], 0x00);
	bytes[header] = 0x1F;
	let result = Program::read(&mut std::io::Cursor::new(bytes));
	assert!(matches!(result, Err(CodecError::InvalidTag(0x1F))));
}

#[test]
fn a_bad_magic_number_is_rejected() {
	let mut bytes = vec![];
	rich_program().write(&mut bytes).unwrap();
	bytes[0] = 0x00;
	let result = Program::read(&mut std::io::Cursor::new(bytes));
	assert!(matches!(result, Err(CodecError::InvalidMagic(_))));
}

#[test]
fn oversized_tables_refuse_to_write() {
	let mut program = rich_program();
	program.modules[0].methods[0].args = (0..300).map(|_| var(0)).collect();
	let mut bytes = vec![];
	assert!(matches!(
		program.write(&mut bytes),
		Err(CodecError::CountOverflow("arg table"))
	));
}
