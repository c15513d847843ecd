//! The VM object: the module registry, metadata store, console, thread
//! bookkeeping, the `basic` module and the cast check. Execution itself
//! lives in [`interp`]; threads in [`thread`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use fxhash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::errors::{FatalError, VmError};
use crate::ffi::{ForeignFn, ForeignStub};
use crate::loader::Loader;
use crate::runtime::memory::MemoryManager;
use crate::runtime::obj::{
	MethodBody, MethodKind, MethodState, ModuleLoadState, ModuleState, ObjRef, ObjTag, Payload,
	TypeKind, TypeState,
};
use crate::sign::Sign;
use crate::vm::interp::Outcome;
use crate::vm::thread::{ThreadState, ThreadStatus, VmThread};

pub mod debug;
pub mod interp;
pub mod thread;

pub use debug::Debugger;

/// VM-wide configuration.
pub struct Settings {
	pub lang_name: &'static str,
	pub vm_name: &'static str,
	pub version: &'static str,
	pub max_call_stack_depth: usize,
	pub lib_path: PathBuf,
	pub mod_path: Vec<PathBuf>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			lang_name: "Strix",
			vm_name: "strixvm",
			version: env!("CARGO_PKG_VERSION"),
			max_call_stack_depth: 1024,
			lib_path: PathBuf::new(),
			mod_path: vec![],
		}
	}
}

enum ConsoleSink {
	Stdout,
	Capture(Vec<u8>),
}

/// The `PRINTLN` sink: inherited stdout by default, or an in-memory
/// buffer for embedders and tests.
struct Console {
	sink: Mutex<ConsoleSink>,
}

impl Console {
	fn write(&self, text: &str) {
		use std::io::Write;
		match &mut *self.sink.lock().unwrap() {
			ConsoleSink::Stdout => {
				let mut stdout = std::io::stdout().lock();
				let _ = stdout.write_all(text.as_bytes());
				let _ = stdout.flush();
			}
			ConsoleSink::Capture(buffer) => buffer.extend_from_slice(text.as_bytes()),
		}
	}
}

/// The virtual machine.
pub struct StrixVm {
	manager: Arc<MemoryManager>,
	settings: Settings,
	modules: RwLock<FxHashMap<String, ObjRef>>,
	metadata: RwLock<FxHashMap<String, FxHashMap<String, String>>>,
	console: Console,
	debugger: Option<Box<dyn Debugger>>,
	threads: Mutex<Vec<Arc<VmThread>>>,
	on_exit: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
	exit_code: AtomicI32,
	fatal: Mutex<Option<FatalError>>,
	basic_loaded: AtomicBool,
	this: Weak<StrixVm>,
}

impl StrixVm {
	pub fn new(settings: Settings) -> Arc<Self> {
		Self::with_debugger(settings, None)
	}

	pub fn with_debugger(settings: Settings, debugger: Option<Box<dyn Debugger>>) -> Arc<Self> {
		Arc::new_cyclic(|this| Self {
			manager: MemoryManager::new(),
			settings,
			modules: RwLock::new(FxHashMap::default()),
			metadata: RwLock::new(FxHashMap::default()),
			console: Console { sink: Mutex::new(ConsoleSink::Stdout) },
			debugger,
			threads: Mutex::new(vec![]),
			on_exit: Mutex::new(vec![]),
			exit_code: AtomicI32::new(0),
			fatal: Mutex::new(None),
			basic_loaded: AtomicBool::new(false),
			this: this.clone(),
		})
	}

	fn arc(&self) -> Arc<StrixVm> {
		self.this.upgrade().expect("vm used outside its handle")
	}

	pub fn manager(&self) -> &Arc<MemoryManager> {
		&self.manager
	}

	pub fn settings(&self) -> &Settings {
		&self.settings
	}

	pub fn debugger(&self) -> Option<&dyn Debugger> {
		self.debugger.as_deref()
	}

	/// Redirects `PRINTLN` into an in-memory buffer.
	pub fn capture_output(&self) {
		*self.console.sink.lock().unwrap() = ConsoleSink::Capture(vec![]);
	}

	/// The captured output so far, when capturing is active.
	pub fn captured_output(&self) -> Option<String> {
		match &*self.console.sink.lock().unwrap() {
			ConsoleSink::Capture(buffer) => Some(String::from_utf8_lossy(buffer).into_owned()),
			ConsoleSink::Stdout => None,
		}
	}

	pub(crate) fn write_out(&self, text: &str) {
		self.console.write(text);
	}

	pub fn exit_code(&self) -> i32 {
		self.exit_code.load(AtomicOrdering::Acquire)
	}

	/// Registers an action to run when the last thread terminates.
	pub fn on_exit(&self, action: impl FnOnce() + Send + 'static) {
		debug!("registered exit hook");
		self.on_exit.lock().unwrap().push(Box::new(action));
	}

	/// Builds the program-level throwable for a runtime error message.
	pub fn throw_message(&self, message: impl Into<Box<str>>) -> VmError {
		VmError::Throw(self.manager.string(message))
	}

	// ---- symbol registry ----

	pub fn install_module(&self, name: &str, module: ObjRef) {
		self.modules.write().unwrap().insert(name.to_string(), module);
	}

	pub fn modules(&self) -> Vec<(String, ObjRef)> {
		self.modules
			.read()
			.unwrap()
			.iter()
			.map(|(name, module)| (name.clone(), module.clone()))
			.collect()
	}

	/// Hierarchical symbol lookup: the first sign element names a
	/// top-level module, every further element walks a member table.
	/// Returns `None` instead of failing.
	pub fn lookup_symbol(&self, sign: &str) -> Option<ObjRef> {
		let sign = Sign::parse(sign).ok()?;
		let elements = sign.elements();
		let first = elements.first()?;
		let mut obj = self.modules.read().unwrap().get(&first.to_string()).cloned()?;
		for element in &elements[1..] {
			obj = obj.get_member(&element.to_string()).ok()?;
		}
		Some(obj)
	}

	/// As [`Self::lookup_symbol`], but a missing symbol is an error.
	pub fn get_symbol(&self, sign: &str) -> Result<ObjRef, FatalError> {
		self.lookup_symbol(sign)
			.ok_or_else(|| FatalError::IllegalAccess(format!("cannot find symbol: {sign}")))
	}

	pub fn set_symbol(&self, sign: &str, value: ObjRef) -> Result<(), FatalError> {
		let parsed = Sign::parse(sign)?;
		let elements = parsed.elements();
		let [first, rest @ ..] = elements else { return Ok(()) };

		if rest.is_empty() {
			if value.as_module().is_none() {
				return Err(FatalError::IllegalAccess(format!("not a module: {value}")));
			}
			self.install_module(&first.to_string(), value);
			return Ok(());
		}

		let mut obj = self
			.modules
			.read()
			.unwrap()
			.get(&first.to_string())
			.cloned()
			.ok_or_else(|| FatalError::IllegalAccess(format!("cannot find symbol: {sign}")))?;
		for element in &rest[..rest.len() - 1] {
			obj = obj
				.get_member(&element.to_string())
				.map_err(|_| FatalError::IllegalAccess(format!("cannot find symbol: {sign}")))?;
		}
		obj.set_member(&rest[rest.len() - 1].to_string(), value);
		Ok(())
	}

	// ---- metadata store ----

	pub fn set_metadata(&self, sign: String, meta: FxHashMap<String, String>) {
		self.metadata.write().unwrap().insert(sign, meta);
	}

	pub fn metadata(&self, sign: &str) -> Option<FxHashMap<String, String>> {
		self.metadata.read().unwrap().get(sign).cloned()
	}

	// ---- the basic module ----

	/// Installs the built-in `basic` module: `any` at the root of the
	/// type lattice and the primitive types beneath it. Idempotent; runs
	/// before any program load.
	pub fn load_basic(&self) {
		if self.basic_loaded.swap(true, AtomicOrdering::SeqCst) {
			return;
		}

		let new_type = |sign: &str, supers: Vec<Sign>, type_params: FxHashMap<String, ObjRef>| {
			let sign = Sign::parse(sign).expect("builtin signature");
			self.manager
				.alloc(Payload::Type(TypeState::new(TypeKind::Class, sign, supers, type_params)))
		};

		let any = new_type("basic.any", vec![], FxHashMap::default());
		let supers = vec![Sign::parse("basic.any").expect("builtin signature")];

		let mut array_params = FxHashMap::default();
		array_params.insert(
			"[T]".to_string(),
			self.manager.alloc(Payload::Type(TypeState::sentinel(
				Sign::parse("[T]").expect("builtin signature"),
			))),
		);

		let members: [(&str, ObjRef); 10] = [
			("any", any),
			("bool", new_type("basic.bool", supers.clone(), FxHashMap::default())),
			("int", new_type("basic.int", supers.clone(), FxHashMap::default())),
			("float", new_type("basic.float", supers.clone(), FxHashMap::default())),
			("char", new_type("basic.char", supers.clone(), FxHashMap::default())),
			("string", new_type("basic.string", supers.clone(), FxHashMap::default())),
			("array[T]", new_type("basic.array[T]", supers.clone(), array_params)),
			("Enum", new_type("basic.Enum", supers.clone(), FxHashMap::default())),
			("Annotation", new_type("basic.Annotation", supers.clone(), FxHashMap::default())),
			("Throwable", new_type("basic.Throwable", supers.clone(), FxHashMap::default())),
		];

		let sign = Sign::parse("basic").expect("builtin signature");
		let module = self
			.manager
			.alloc(Payload::Module(ModuleState::new(sign, PathBuf::new(), vec![])));
		for (name, ty) in members {
			module.set_member(name, ty);
		}
		module
			.as_module()
			.expect("module payload")
			.set_state(ModuleLoadState::Loaded);
		self.install_module("basic", module);
		info!("loaded basic module");
	}

	/// Maps a primitive tag onto its `basic` type.
	pub fn vm_type(&self, tag: ObjTag) -> Option<ObjRef> {
		let sign = match tag {
			ObjTag::Null | ObjTag::Object => "basic.any",
			ObjTag::Bool => "basic.bool",
			ObjTag::Char => "basic.char",
			ObjTag::String => "basic.string",
			ObjTag::Int => "basic.int",
			ObjTag::Float => "basic.float",
			ObjTag::Array => "basic.array[T]",
			_ => return None,
		};
		self.lookup_symbol(sign)
	}

	// ---- types & instances ----

	/// Whether a value of type `from` can be viewed as `to`: identity,
	/// signature equality, `basic.any`, or `to` reachable through the
	/// transitive supertype signatures of `from`.
	pub fn check_cast(&self, from: Option<ObjRef>, to: &ObjRef) -> bool {
		let Some(to_state) = to.as_type() else { return false };
		let to_sign = to_state.sign();
		if to_sign.to_string() == "basic.any" {
			return true;
		}
		let Some(from) = from else { return false };
		if Arc::ptr_eq(&from, to) {
			return true;
		}

		let mut visited = FxHashSet::default();
		let mut pending = vec![from];
		while let Some(ty) = pending.pop() {
			let Some(state) = ty.as_type() else { continue };
			if state.sign() == to_sign {
				return true;
			}
			for super_sign in state.supers() {
				let key = super_sign.to_string();
				if visited.insert(key.clone()) {
					if let Some(super_ty) = self.lookup_symbol(&key) {
						pending.push(super_ty);
					}
				}
			}
		}
		false
	}

	/// Creates an instance of `ty`: the new object's member table is
	/// seeded from the type's member slots plus the slots inherited from
	/// its transitive supertypes.
	pub fn instantiate(&self, ty: &ObjRef) -> Result<ObjRef, FatalError> {
		if ty.as_type().is_none() {
			return Err(FatalError::IllegalAccess(format!("not a type: {ty}")));
		}
		let obj = self.manager.alloc_typed(Payload::Instance, Some(ty.clone()));

		let mut visited = FxHashSet::default();
		let mut pending = vec![ty.clone()];
		while let Some(current) = pending.pop() {
			for (name, slot) in current.member_snapshot() {
				if obj.get_member(&name).is_err() {
					obj.set_member_with_flags(&name, slot.value().copy(), slot.flags());
				}
			}
			if let Some(state) = current.as_type() {
				for super_sign in state.supers() {
					let key = super_sign.to_string();
					if visited.insert(key.clone()) {
						if let Some(super_ty) = self.lookup_symbol(&key) {
							pending.push(super_ty);
						}
					}
				}
			}
		}
		Ok(obj)
	}

	/// Registers a foreign method under `sign`.
	pub fn register_foreign(
		&self,
		sign: &str,
		arity: u8,
		has_self: bool,
		func: ForeignFn,
	) -> Result<(), FatalError> {
		let parsed = Sign::parse(sign)?;
		let stub = ForeignStub { arity, has_self, func };
		let method = self.manager.alloc(Payload::Method(MethodState::new(
			MethodKind::Function,
			parsed,
			MethodBody::Foreign(stub),
			Weak::new(),
		)));
		self.set_symbol(sign, method)
	}

	// ---- lifecycle ----

	/// Loads and runs a program on a fresh VM thread, blocking until it
	/// terminates. Returns the program's exit code; fatal host errors
	/// are returned as errors after the thread winds down.
	pub fn start(&self, path: impl Into<PathBuf>, args: Vec<String>) -> Result<i32, FatalError> {
		let path = path.into();
		let vm = self.arc();
		let thread = VmThread::spawn(
			self.arc(),
			{
				let vm = self.arc();
				move |this| {
					vm.threads.lock().unwrap().push(this.clone());
					debug!("thread attached to the vm");
				}
			},
			move |this| {
				this.set_status(ThreadStatus::Running);
				let code = match vm.vm_main(&path, &args) {
					Ok(code) => code,
					Err(error) => {
						eprintln!("fatal error: {error}");
						*vm.fatal.lock().unwrap() = Some(error);
						1
					}
				};
				this.set_exit_code(code);
				this.set_status(ThreadStatus::Terminated);
				vm.thread_finished(this);
			},
		);

		thread.join();
		if let Some(error) = self.fatal.lock().unwrap().take() {
			return Err(error);
		}
		Ok(self.exit_code())
	}

	fn vm_main(&self, path: &PathBuf, args: &[String]) -> Result<i32, FatalError> {
		if let Some(debugger) = self.debugger() {
			debugger.init(self);
			info!("debugger initialized");
		}
		self.load_basic();

		let mut loader = Loader::new(self);
		let result = loader.load(path)?;

		let mut state = ThreadState::new(self.settings.max_call_stack_depth);

		// Module initializers run in import post-order before the entry.
		for init in &result.inits {
			match interp::call(self, &mut state, init, None, vec![], false) {
				Ok(()) => {}
				Err(VmError::Fatal(error)) => return Err(error),
				Err(VmError::Throw(_)) => return Ok(1),
			}
			match interp::run(self, &mut state)? {
				Outcome::Returned(_) => {}
				Outcome::Unwound(_) => return Ok(1),
			}
			if let Some(module) = init.as_method().and_then(MethodState::module) {
				if let Some(module_state) = module.as_module() {
					module_state.set_state(ModuleLoadState::Initialized);
				}
			}
			info!("called module initializer");
		}

		let Some(entry) = result.entry else {
			return Err(FatalError::IllegalAccess(format!(
				"cannot find entry point in '{}'",
				path.display()
			)));
		};
		let entry_state = entry
			.as_method()
			.ok_or_else(|| FatalError::IllegalAccess(format!("entry point is not a method: {entry}")))?;
		let entry_sign = entry_state.sign().to_string();

		let call_args = match entry_state.arity() {
			0 => vec![],
			1 => {
				let items = args.iter().map(|arg| self.manager.string(arg.as_str())).collect();
				vec![self.manager.array_from(items)]
			}
			_ => {
				return Err(FatalError::Argument {
					sign: entry_sign,
					message: "entry point must have zero or one argument (basic.array)".into(),
				})
			}
		};

		info!(entry = %entry_sign, "calling entry point");
		match interp::call(self, &mut state, &entry, None, call_args, false) {
			Ok(()) => {}
			Err(VmError::Fatal(error)) => return Err(error),
			Err(VmError::Throw(_)) => return Ok(1),
		}
		match interp::run(self, &mut state)? {
			Outcome::Returned(value) => Ok(value.as_int().map(|code| code as i32).unwrap_or(0)),
			Outcome::Unwound(_) => Ok(1),
		}
	}

	fn thread_finished(&self, thread: &Arc<VmThread>) {
		let mut threads = self.threads.lock().unwrap();
		threads.retain(|other| !Arc::ptr_eq(other, thread));
		if threads.is_empty() {
			drop(threads);
			debug!("last thread finished, cleaning up");
			self.exit_code.store(thread.exit_code(), AtomicOrdering::Release);
			let actions: Vec<_> = self.on_exit.lock().unwrap().drain(..).collect();
			for action in actions {
				action();
			}
			if let Some(debugger) = self.debugger() {
				debugger.cleanup(self);
			}
		}
	}
}
