//! Loader behavior through real files: import resolution and dedup,
//! initializer ordering, module states, the reference pool, metadata,
//! and corrupt-file rejection.

mod common;

use common::*;
use strix::errors::FatalError;
use strix::loader::Loader;
use strix::raw::{Constant, ExceptionRecord, Metadata, Opcode, Program, MAGIC_EXECUTABLE};
use strix::runtime::obj::ModuleLoadState;
use strix::vm::{Settings, StrixVm};

fn boot_method(name: u16, message: u8) -> strix::raw::Method {
	let code = Asm::new()
		.op8(Opcode::ConstF, message)
		.op(Opcode::Println)
		.op(Opcode::VRet)
		.build();
	method(name, 0, 0, 4, code)
}

fn library_with_init(dir: &std::path::Path) -> std::path::PathBuf {
	let mut pool = base_pool("libm", "libm.boot()");
	pool.push(utf8("boot()")); // 4
	pool.push(utf8("lib-init")); // 5
	let lib = library(vec![module(2, pool, vec![boot_method(4, 5)])]);
	write_program(dir, "libm.sx", &lib)
}

fn root_with_imports(lib_paths: &[&std::path::Path]) -> Program {
	let mut pool = base_pool("app", "app.boot()");
	pool.push(utf8("main()")); // 4
	pool.push(utf8("boot()")); // 5
	pool.push(utf8("app-init")); // 6
	pool.push(utf8("main")); // 7

	let main_code = Asm::new()
		.op8(Opcode::ConstF, 7)
		.op(Opcode::Println)
		.op(Opcode::VRet)
		.build();
	let app = module(2, pool, vec![method(4, 0, 0, 4, main_code), boot_method(5, 6)]);

	let imports = lib_paths
		.iter()
		.map(|path| utf8(&path.to_string_lossy()))
		.collect();
	Program {
		magic: MAGIC_EXECUTABLE,
		minor_version: 0,
		major_version: 1,
		entry: 1,
		imports: 2,
		constant_pool: vec![Constant::Null, utf8("app.main()"), Constant::Array(imports)],
		modules: vec![app],
		meta: Metadata::default(),
	}
}

#[test]
fn imports_load_first_and_initializers_run_in_post_order() {
	let dir = tempfile::tempdir().unwrap();
	let lib_path = library_with_init(dir.path());
	let root = root_with_imports(&[&lib_path]);
	let root_path = write_program(dir.path(), "app.sx", &root);

	let vm = StrixVm::new(Settings::default());
	vm.capture_output();
	let exit = vm.start(root_path, vec![]).unwrap();
	assert_eq!(exit, 0);
	assert_eq!(vm.captured_output().unwrap(), "lib-init\napp-init\nmain\n");

	for name in ["libm", "app"] {
		let module = vm.get_symbol(name).unwrap();
		assert_eq!(module.as_module().unwrap().state(), ModuleLoadState::Initialized);
	}
}

#[test]
fn duplicate_imports_load_once() {
	let dir = tempfile::tempdir().unwrap();
	let lib_path = library_with_init(dir.path());
	let root = root_with_imports(&[&lib_path, &lib_path]);
	let root_path = write_program(dir.path(), "app.sx", &root);

	let vm = StrixVm::new(Settings::default());
	vm.capture_output();
	vm.start(root_path, vec![]).unwrap();
	assert_eq!(vm.captured_output().unwrap(), "lib-init\napp-init\nmain\n");
}

#[test]
fn a_module_without_an_initializer_stays_loaded() {
	let mut pool = base_pool("test", "");
	pool.push(utf8("main()")); // 4
	let code = Asm::new().op(Opcode::VRet).build();
	let program = executable("test.main()", vec![module(2, pool, vec![method(4, 0, 0, 4, code)])]);

	let dir = tempfile::tempdir().unwrap();
	let path = write_program(dir.path(), "test.sx", &program);
	let vm = StrixVm::new(Settings::default());
	vm.capture_output();
	vm.start(path, vec![]).unwrap();
	let module = vm.get_symbol("test").unwrap();
	assert_eq!(module.as_module().unwrap().state(), ModuleLoadState::Loaded);
}

#[test]
fn unresolved_references_fail_the_load() {
	let mut pool = base_pool("test", "");
	pool.push(utf8("main()")); // 4
	pool.push(utf8("test.Missing")); // 5
	let code = Asm::new().op(Opcode::VRet).build();
	let mut main = method(4, 0, 0, 4, code);
	main.exception_table = vec![ExceptionRecord {
		start_pc: 0,
		end_pc: 1,
		target_pc: 0,
		exception: 5,
		meta: Metadata::default(),
	}];
	let program = executable("test.main()", vec![module(2, pool, vec![main])]);

	let dir = tempfile::tempdir().unwrap();
	let path = write_program(dir.path(), "test.sx", &program);
	let vm = StrixVm::new(Settings::default());
	let error = vm.start(path, vec![]).unwrap_err();
	match error {
		FatalError::IllegalAccess(message) => assert!(message.contains("reference not found")),
		other => panic!("unexpected error: {other}"),
	}
}

#[test]
fn garbage_is_a_corrupt_file() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("junk.sx");
	std::fs::write(&path, b"\xC0\xFF\xEE\xDEgarbage").unwrap();

	let vm = StrixVm::new(Settings::default());
	let error = vm.start(path.clone(), vec![]).unwrap_err();
	match error {
		FatalError::CorruptFile(reported) => {
			assert_eq!(reported.canonicalize().unwrap(), path.canonicalize().unwrap())
		}
		other => panic!("unexpected error: {other}"),
	}
}

#[test]
fn verifier_rejections_surface_as_corrupt_files() {
	let mut pool = base_pool("test", "");
	pool.push(utf8("main()")); // 4
	let code = Asm::new().op(Opcode::VRet).build();
	let mut main = method(4, 0, 0, 4, code);
	main.kind = 7;
	let program = executable("test.main()", vec![module(2, pool, vec![main])]);

	let dir = tempfile::tempdir().unwrap();
	let path = write_program(dir.path(), "test.sx", &program);
	let vm = StrixVm::new(Settings::default());
	assert!(matches!(vm.start(path, vec![]), Err(FatalError::CorruptFile(_))));
}

#[test]
fn record_metadata_lands_in_the_store() {
	let mut pool = base_pool("test", "");
	pool.push(utf8("main()")); // 4
	let code = Asm::new().op(Opcode::VRet).build();
	let mut main = method(4, 0, 0, 4, code);
	main.meta = Metadata(vec![("doc".into(), "the entry point".into())]);
	let program = executable("test.main()", vec![module(2, pool, vec![main])]);

	let dir = tempfile::tempdir().unwrap();
	let path = write_program(dir.path(), "test.sx", &program);
	let vm = StrixVm::new(Settings::default());
	let mut loader = Loader::new(&vm);
	let result = loader.load(&path).unwrap();
	assert!(result.entry.is_some());

	let meta = vm.metadata("test.main()").unwrap();
	assert_eq!(meta.get("doc").map(String::as_str), Some("the entry point"));
}

#[test]
fn loading_twice_returns_the_cached_module() {
	let mut pool = base_pool("test", "");
	pool.push(utf8("main()")); // 4
	let code = Asm::new().op(Opcode::VRet).build();
	let program = executable("test.main()", vec![module(2, pool, vec![method(4, 0, 0, 4, code)])]);

	let dir = tempfile::tempdir().unwrap();
	let path = write_program(dir.path(), "test.sx", &program);
	let vm = StrixVm::new(Settings::default());
	let mut loader = Loader::new(&vm);
	loader.load(&path).unwrap();
	let first = vm.get_symbol("test").unwrap();
	loader.load(&path).unwrap();
	let second = vm.get_symbol("test").unwrap();
	assert!(std::sync::Arc::ptr_eq(&first, &second));
}
