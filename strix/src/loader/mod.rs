//! Loads verified program files into runtime objects: modules, globals,
//! methods with their frame templates, classes and the constant pools.
//! Imports resolve depth-first, unresolved type references are interned
//! in a reference pool, and module initializers are collected in import
//! post-order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fxhash::FxHashMap;
use tracing::{debug, info, warn};

use crate::errors::FatalError;
use crate::raw::{self, Constant, Metadata, Program};
use crate::runtime::frame::FrameTemplate;
use crate::runtime::obj::{
	Flags, MethodBody, MethodKind, MethodState, ModuleLoadState, ModuleState, ObjRef, Payload,
	TypeKind, TypeState,
};
use crate::runtime::tables::{ExceptionEntry, ExceptionTable, LineTable, MatchTable, VariableTable};
use crate::sign::Sign;
use crate::vm::StrixVm;

pub mod resolver;
pub mod verifier;

pub use resolver::PathResolver;
pub use verifier::{verify, VerifyError};

/// What a load produced: the entry-point method of the root file (when
/// executable) and the module initializers in call order.
pub struct LoadResult {
	pub entry: Option<ObjRef>,
	pub inits: Vec<ObjRef>,
}

pub struct Loader<'l> {
	vm: &'l StrixVm,
	resolver: PathResolver,
	loaded: FxHashMap<PathBuf, ()>,
	reference_pool: FxHashMap<String, ObjRef>,
	sign_stack: Vec<Sign>,
	scope_stack: Vec<ObjRef>,
	module_stack: Vec<ObjRef>,
	pool_stack: Vec<Vec<ObjRef>>,
	init_signs: Vec<String>,
	entry_sign: Option<String>,
	null: ObjRef,
}

impl<'l> Loader<'l> {
	pub fn new(vm: &'l StrixVm) -> Self {
		vm.load_basic();
		Self {
			vm,
			resolver: PathResolver::new(vm.settings().mod_path.clone()),
			loaded: FxHashMap::default(),
			reference_pool: FxHashMap::default(),
			sign_stack: vec![],
			scope_stack: vec![],
			module_stack: vec![],
			pool_stack: vec![],
			init_signs: vec![],
			entry_sign: None,
			null: vm.manager().null(),
		}
	}

	/// Loads `path` and everything it imports. Loading is idempotent per
	/// canonical path; a second load of an already-loaded file is a
	/// no-op and the cached modules stand.
	pub fn load(&mut self, path: &Path) -> Result<LoadResult, FatalError> {
		let spec = path.to_string_lossy();
		let root = self
			.resolver
			.resolve(None, &spec)
			.ok_or_else(|| FatalError::IllegalAccess(format!("cannot find file: '{spec}'")))?;
		self.load_file(&root, true)?;

		// Anything still unresolved after the whole DAG loaded is a
		// missing symbol.
		for (sign, ty) in &self.reference_pool {
			if ty.as_type().map(TypeState::kind) == Some(TypeKind::Unresolved) {
				return Err(FatalError::IllegalAccess(format!("reference not found: '{sign}'")));
			}
		}

		let mut inits = vec![];
		for sign in std::mem::take(&mut self.init_signs) {
			let init = self.vm.get_symbol(&sign)?;
			if let Some(module) = init.as_method().and_then(MethodState::module) {
				if let Some(state) = module.as_module() {
					state.set_init(init.clone());
				}
			}
			inits.push(init);
		}

		let entry = match self.entry_sign.take() {
			Some(sign) => Some(self.vm.get_symbol(&sign)?),
			None => None,
		};
		Ok(LoadResult { entry, inits })
	}

	fn load_file(&mut self, path: &Path, is_root: bool) -> Result<(), FatalError> {
		let canonical = path
			.canonicalize()
			.map_err(|_| FatalError::IllegalAccess(format!("cannot find file: '{}'", path.display())))?;
		if self.loaded.contains_key(&canonical) {
			return Ok(());
		}
		self.loaded.insert(canonical.clone(), ());

		let program = Program::read_file(&canonical).map_err(|error| {
			warn!(path = %canonical.display(), %error, "failed to read program");
			FatalError::CorruptFile(canonical.clone())
		})?;
		info!(path = %canonical.display(), "read file");
		verifier::verify(&program).map_err(|error| {
			warn!(path = %canonical.display(), %error, "verification failed");
			FatalError::CorruptFile(canonical.clone())
		})?;
		info!(path = %canonical.display(), "verified file");

		// Imports load depth-first so initializers end up in post-order.
		for import in self.import_paths(&program, &canonical)? {
			self.load_file(&import, false)?;
		}

		for module in &program.modules {
			self.load_module(module)?;
		}

		if is_root && program.is_executable() && program.entry != 0 {
			self.entry_sign = program
				.constant_pool
				.get(program.entry as usize)
				.and_then(Constant::as_str)
				.map(str::to_string);
		}
		Ok(())
	}

	fn import_paths(&mut self, program: &Program, path: &Path) -> Result<Vec<PathBuf>, FatalError> {
		if program.imports == 0 {
			return Ok(vec![]);
		}
		let Some(Constant::Array(items)) = program.constant_pool.get(program.imports as usize) else {
			return Err(FatalError::CorruptFile(path.to_path_buf()));
		};
		let from_dir = path.parent().map(Path::to_path_buf);
		let mut imports = Vec::with_capacity(items.len());
		for item in items {
			let spec = item.as_str().ok_or_else(|| FatalError::CorruptFile(path.to_path_buf()))?;
			let import = self
				.resolver
				.resolve(from_dir.as_deref(), spec)
				.ok_or_else(|| FatalError::IllegalAccess(format!("cannot find imported file: '{spec}'")))?;
			imports.push(import);
		}
		Ok(imports)
	}

	fn load_module(&mut self, info: &raw::Module) -> Result<(), FatalError> {
		let pool = self.load_constant_pool(&info.constant_pool);
		let string_at = |index: u16| -> String {
			pool.get(index as usize).map(|value| value.to_string()).unwrap_or_default()
		};
		let compiled_from = string_at(info.compiled_from);
		let name = string_at(info.name);
		let init = string_at(info.init);
		if !init.is_empty() {
			self.init_signs.push(init);
		}

		let sign = match self.sign_stack.last() {
			Some(current) => current.join(&name)?,
			None => Sign::parse(&name)?,
		};
		self.sign_stack.push(sign.clone());

		let module = self.vm.manager().alloc(Payload::Module(ModuleState::new(
			sign.clone(),
			PathBuf::from(compiled_from),
			pool.clone(),
		)));

		self.scope_stack.push(module.clone());
		self.module_stack.push(module.clone());
		self.pool_stack.push(pool);

		for global in &info.globals {
			let global_name = self.pool_string(global.name)?;
			let global_sign = sign.join(&global_name)?;
			self.vm.set_metadata(global_sign.to_string(), load_meta(&global.meta));
			module.set_member_with_flags(
				&global_name,
				self.null.clone(),
				Flags::from_bits_truncate(global.access_flags),
			);
		}

		for method in &info.methods {
			self.load_method(method)?;
		}
		for class in &info.classes {
			self.load_class(class)?;
		}
		for submodule in &info.modules {
			self.load_module(submodule)?;
		}
		self.vm.set_metadata(sign.to_string(), load_meta(&info.meta));

		self.pool_stack.pop();
		self.module_stack.pop();
		self.scope_stack.pop();
		self.sign_stack.pop();

		match self.scope_stack.last() {
			Some(scope) => scope.set_member(&name, module.clone()),
			None => self.vm.install_module(&name, module.clone()),
		}
		if let Some(state) = module.as_module() {
			state.set_state(ModuleLoadState::Loaded);
		}
		info!(module = %sign, "loaded module");
		Ok(())
	}

	fn load_method(&mut self, info: &raw::Method) -> Result<(), FatalError> {
		let kind = match info.kind {
			0x00 => MethodKind::Function,
			0x01 => MethodKind::Method,
			_ => MethodKind::Constructor,
		};
		let name = self.pool_string(info.name)?;
		let sign = self.current_sign().join(&name)?;

		let mut args = VariableTable::new(info.args.len(), &self.null);
		for (index, arg) in info.args.iter().enumerate() {
			args.set_meta(index, load_meta(&arg.meta))?;
		}
		let mut locals = VariableTable::new(info.locals.len(), &self.null);
		for (index, local) in info.locals.iter().enumerate() {
			locals.set_meta(index, load_meta(&local.meta))?;
		}

		// Exception types resolve through the reference pool; entries
		// pointing at classes of this file are patched when those load.
		let mut exceptions = ExceptionTable::default();
		for record in &info.exception_table {
			let type_sign = self.pool_string(record.exception)?;
			let ty = self.find_type(&type_sign)?;
			exceptions.add(ExceptionEntry::new(
				record.start_pc,
				record.end_pc,
				record.target_pc,
				ty,
				load_meta(&record.meta),
			));
		}

		let mut lines = LineTable::default();
		for (times, lineno) in &info.line_info.numbers {
			lines.add_line(*times, *lineno);
		}

		let mut matches = Vec::with_capacity(info.matches.len());
		for record in &info.matches {
			let mut cases = Vec::with_capacity(record.cases.len());
			for (value, location) in &record.cases {
				cases.push((self.pool_value(*value)?, *location));
			}
			matches.push(MatchTable::new(cases, record.default_location));
		}

		self.vm.set_metadata(sign.to_string(), load_meta(&info.meta));

		let template = FrameTemplate::new(
			info.code.clone(),
			info.stack_max,
			info.closure_start,
			args,
			locals,
			exceptions,
			lines,
			matches,
		);
		let module = match self.module_stack.last() {
			Some(module) => Arc::downgrade(module),
			None => std::sync::Weak::new(),
		};
		let method = self.vm.manager().alloc(Payload::Method(MethodState::new(
			kind,
			sign.clone(),
			MethodBody::Bytecode(template),
			module,
		)));

		let scope = self
			.scope_stack
			.last()
			.ok_or_else(|| FatalError::IllegalAccess(format!("no scope for method: {sign}")))?;
		scope.set_member_with_flags(&name, method, Flags::from_bits_truncate(info.access_flags));
		debug!(method = %sign, "loaded method");
		Ok(())
	}

	fn load_class(&mut self, info: &raw::Class) -> Result<(), FatalError> {
		let kind = match info.kind {
			0x00 => TypeKind::Class,
			0x01 => TypeKind::Interface,
			0x02 => TypeKind::Annotation,
			_ => TypeKind::Enum,
		};
		let name = self.pool_string(info.name)?;
		let sign = self.current_sign().join(&name)?;
		self.sign_stack.push(sign.clone());

		let supers_value = self.pool_value(info.supers)?;
		let mut supers = vec![];
		for item in supers_value.array_items()? {
			supers.push(Sign::parse(&item.to_string())?);
		}

		// Type parameters come from the signature; each starts as an
		// unresolved placeholder.
		let mut type_params = FxHashMap::default();
		for param in sign.type_params() {
			let param_name = format!("[{param}]");
			let placeholder = self
				.vm
				.manager()
				.alloc(Payload::Type(TypeState::sentinel(Sign::parse(&param_name)?)));
			type_params.insert(param_name, placeholder);
		}

		let ty = self.define_type(TypeState::new(kind, sign.clone(), supers, type_params));
		self.scope_stack.push(ty.clone());

		for field in &info.fields {
			let field_name = self.pool_string(field.name)?;
			let field_sign = sign.join(&field_name)?;
			self.vm.set_metadata(field_sign.to_string(), load_meta(&field.meta));
			ty.set_member_with_flags(
				&field_name,
				self.null.clone(),
				Flags::from_bits_truncate(field.access_flags),
			);
		}
		for method in &info.methods {
			self.load_method(method)?;
		}
		self.vm.set_metadata(sign.to_string(), load_meta(&info.meta));

		self.scope_stack.pop();
		self.sign_stack.pop();

		let scope = self
			.scope_stack
			.last()
			.ok_or_else(|| FatalError::IllegalAccess(format!("no scope for type: {sign}")))?;
		scope.set_member_with_flags(&name, ty, Flags::from_bits_truncate(info.access_flags));
		debug!(class = %sign, "loaded type");
		Ok(())
	}

	/// Finds the type named by `sign_text`: an already-loaded symbol, an
	/// existing reference-pool entry, or a freshly interned unresolved
	/// sentinel.
	fn find_type(&mut self, sign_text: &str) -> Result<ObjRef, FatalError> {
		if let Some(symbol) = self.vm.lookup_symbol(sign_text) {
			if symbol.as_type().is_some() {
				return Ok(symbol);
			}
		}
		if let Some(sentinel) = self.reference_pool.get(sign_text) {
			return Ok(sentinel.clone());
		}
		let sentinel = self
			.vm
			.manager()
			.alloc(Payload::Type(TypeState::sentinel(Sign::parse(sign_text)?)));
		self.reference_pool.insert(sign_text.to_string(), sentinel.clone());
		Ok(sentinel)
	}

	/// Installs a class definition. When the signature was referred to
	/// earlier, the pooled sentinel is patched in place so every holder
	/// sees the resolved type.
	fn define_type(&mut self, state: TypeState) -> ObjRef {
		let key = state.sign().to_string();
		if let Some(sentinel) = self.reference_pool.remove(&key) {
			if let Some(existing) = sentinel.as_type() {
				existing.resolve_from(&state);
			}
			return sentinel;
		}
		self.vm.manager().alloc(Payload::Type(state))
	}

	fn load_constant_pool(&self, constants: &[Constant]) -> Vec<ObjRef> {
		constants.iter().map(|constant| self.load_constant(constant)).collect()
	}

	fn load_constant(&self, constant: &Constant) -> ObjRef {
		let manager = self.vm.manager();
		match constant {
			Constant::Null => self.null.clone(),
			Constant::True => manager.bool(true),
			Constant::False => manager.bool(false),
			Constant::Char(value) => manager.char(*value),
			Constant::Int(value) => manager.int(*value),
			Constant::Float(bits) => manager.float(f64::from_bits(*bits)),
			Constant::Utf8(text) => manager.string(text.as_str()),
			Constant::Array(items) => {
				let items = items.iter().map(|item| self.load_constant(item)).collect();
				manager.array_from(items)
			}
		}
	}

	fn current_sign(&self) -> Sign {
		self.sign_stack.last().cloned().unwrap_or_default()
	}

	fn pool_value(&self, index: u16) -> Result<ObjRef, FatalError> {
		self.pool_stack
			.last()
			.and_then(|pool| pool.get(index as usize))
			.cloned()
			.ok_or_else(|| FatalError::IllegalAccess(format!("index out of bounds: {index} (constant pool)")))
	}

	fn pool_string(&self, index: u16) -> Result<String, FatalError> {
		Ok(self.pool_value(index)?.to_string())
	}
}

fn load_meta(meta: &Metadata) -> FxHashMap<String, String> {
	meta.0
		.iter()
		.map(|(key, value)| (key.clone(), value.clone()))
		.collect()
}
