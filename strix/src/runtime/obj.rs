use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};

use bitflags::bitflags;
use fxhash::FxHashMap;

use crate::errors::FatalError;
use crate::ffi::ForeignStub;
use crate::runtime::frame::FrameTemplate;
use crate::runtime::memory::MemoryInfo;
use crate::runtime::monitor::Monitor;
use crate::sign::Sign;
use crate::utilities::format_float;

/// A shared handle to a heap value. All references between runtime
/// objects are handles; identity (`is`) is handle identity.
pub type ObjRef = Arc<Obj>;

bitflags! {
	/// Access flags of a member slot. The low byte holds modifiers, the
	/// high byte holds the accessor level.
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct Flags: u16 {
		const STATIC = 0x0001;
		const ABSTRACT = 0x0002;
		const FINAL = 0x0004;
		const OVERRIDE = 0x0008;
		const PRIVATE = 0x0100;
		const INTERNAL = 0x0200;
		const MODULE_PRIVATE = 0x0400;
		const PROTECTED = 0x0800;
		const PUBLIC = 0x1000;
	}
}

/// One named slot of an object: the value and its access flags.
#[derive(Clone)]
pub struct MemberSlot {
	value: ObjRef,
	flags: Flags,
}

impl MemberSlot {
	pub fn new(value: ObjRef, flags: Flags) -> Self {
		Self { value, flags }
	}

	pub fn value(&self) -> &ObjRef {
		&self.value
	}

	pub fn flags(&self) -> Flags {
		self.flags
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ObjTag {
	Null,
	Bool,
	Char,
	String,
	Int,
	Float,
	Array,
	Object,
	Capture,
	Module,
	Method,
	Type,
}

impl Display for ObjTag {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		let name = match self {
			ObjTag::Null => "null",
			ObjTag::Bool => "bool",
			ObjTag::Char => "char",
			ObjTag::String => "string",
			ObjTag::Int => "int",
			ObjTag::Float => "float",
			ObjTag::Array => "array",
			ObjTag::Object => "object",
			ObjTag::Capture => "capture",
			ObjTag::Module => "module",
			ObjTag::Method => "method",
			ObjTag::Type => "type",
		};
		write!(f, "{name}")
	}
}

/// Result of the structural comparison. `Undefined` is the outcome for
/// values of different tags (and incomparable floats); the ordered
/// operators treat it as false and `!=` treats it as true.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Ordering {
	Less,
	Equal,
	Greater,
	Undefined,
}

impl From<std::cmp::Ordering> for Ordering {
	fn from(value: std::cmp::Ordering) -> Self {
		match value {
			std::cmp::Ordering::Less => Ordering::Less,
			std::cmp::Ordering::Equal => Ordering::Equal,
			std::cmp::Ordering::Greater => Ordering::Greater,
		}
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MethodKind {
	Function,
	Method,
	Constructor,
}

impl MethodKind {
	fn word(self) -> &'static str {
		match self {
			MethodKind::Function => "function",
			MethodKind::Method => "method",
			MethodKind::Constructor => "constructor",
		}
	}
}

pub enum MethodBody {
	Bytecode(FrameTemplate),
	Foreign(ForeignStub),
}

pub struct MethodState {
	kind: MethodKind,
	sign: Sign,
	body: MethodBody,
	module: Weak<Obj>,
}

impl MethodState {
	pub fn new(kind: MethodKind, sign: Sign, body: MethodBody, module: Weak<Obj>) -> Self {
		Self { kind, sign, body, module }
	}

	pub fn kind(&self) -> MethodKind {
		self.kind
	}

	pub fn sign(&self) -> &Sign {
		&self.sign
	}

	pub fn body(&self) -> &MethodBody {
		&self.body
	}

	pub fn template(&self) -> Option<&FrameTemplate> {
		match &self.body {
			MethodBody::Bytecode(template) => Some(template),
			MethodBody::Foreign(_) => None,
		}
	}

	pub fn module(&self) -> Option<ObjRef> {
		self.module.upgrade()
	}

	pub(crate) fn module_handle(&self) -> Weak<Obj> {
		self.module.clone()
	}

	/// Declared argument count: the args table for bytecode methods, the
	/// declared arity for foreign stubs.
	pub fn arity(&self) -> usize {
		match &self.body {
			MethodBody::Bytecode(template) => template.args().count(),
			MethodBody::Foreign(stub) => stub.arity as usize,
		}
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ModuleLoadState {
	NotRead,
	Read,
	Loaded,
	Initialized,
}

pub struct ModuleState {
	sign: Sign,
	path: PathBuf,
	constant_pool: Vec<ObjRef>,
	init: RwLock<Option<ObjRef>>,
	state: RwLock<ModuleLoadState>,
}

impl ModuleState {
	pub fn new(sign: Sign, path: PathBuf, constant_pool: Vec<ObjRef>) -> Self {
		Self {
			sign,
			path,
			constant_pool,
			init: RwLock::new(None),
			state: RwLock::new(ModuleLoadState::Read),
		}
	}

	pub fn sign(&self) -> &Sign {
		&self.sign
	}

	pub fn path(&self) -> &PathBuf {
		&self.path
	}

	pub fn constant_pool(&self) -> &[ObjRef] {
		&self.constant_pool
	}

	pub fn init(&self) -> Option<ObjRef> {
		self.init.read().unwrap().clone()
	}

	pub fn set_init(&self, init: ObjRef) {
		*self.init.write().unwrap() = Some(init);
	}

	pub fn state(&self) -> ModuleLoadState {
		*self.state.read().unwrap()
	}

	pub fn set_state(&self, state: ModuleLoadState) {
		*self.state.write().unwrap() = state;
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TypeKind {
	Class,
	Interface,
	Annotation,
	Enum,
	/// A reference-pool sentinel awaiting its definition.
	Unresolved,
}

impl TypeKind {
	fn word(self) -> &'static str {
		match self {
			TypeKind::Class => "class",
			TypeKind::Interface => "interface",
			TypeKind::Annotation => "annotation",
			TypeKind::Enum => "enum",
			TypeKind::Unresolved => "unresolved",
		}
	}
}

/// The mutable state of a `Type` object. Fields are interior-mutable so
/// that an unresolved sentinel can be patched in place once its class
/// definition loads; every handle to the sentinel then sees the real
/// type.
pub struct TypeState {
	kind: RwLock<TypeKind>,
	sign: RwLock<Sign>,
	supers: RwLock<Vec<Sign>>,
	type_params: RwLock<FxHashMap<String, ObjRef>>,
}

impl TypeState {
	pub fn new(kind: TypeKind, sign: Sign, supers: Vec<Sign>, type_params: FxHashMap<String, ObjRef>) -> Self {
		Self {
			kind: RwLock::new(kind),
			sign: RwLock::new(sign),
			supers: RwLock::new(supers),
			type_params: RwLock::new(type_params),
		}
	}

	pub fn sentinel(sign: Sign) -> Self {
		Self::new(TypeKind::Unresolved, sign, vec![], FxHashMap::default())
	}

	pub fn kind(&self) -> TypeKind {
		*self.kind.read().unwrap()
	}

	pub fn sign(&self) -> Sign {
		self.sign.read().unwrap().clone()
	}

	pub fn supers(&self) -> Vec<Sign> {
		self.supers.read().unwrap().clone()
	}

	pub fn type_params(&self) -> FxHashMap<String, ObjRef> {
		self.type_params.read().unwrap().clone()
	}

	/// Patches this state with the definition of `other`. Used to resolve
	/// a reference-pool sentinel.
	pub fn resolve_from(&self, other: &TypeState) {
		*self.kind.write().unwrap() = other.kind();
		*self.sign.write().unwrap() = other.sign();
		*self.supers.write().unwrap() = other.supers();
		*self.type_params.write().unwrap() = other.type_params();
	}
}

pub enum Payload {
	Null,
	Bool(bool),
	/// A 32-bit codepoint; kept raw so any pool value survives.
	Char(u32),
	Int(i64),
	Float(f64),
	String(Box<str>),
	/// Fixed length, mutable cells.
	Array(RwLock<Box<[ObjRef]>>),
	/// A class instance; its state lives in the member table.
	Instance,
	Module(ModuleState),
	Method(MethodState),
	Type(TypeState),
	/// The shared, re-bindable cell closures capture through.
	Capture(RwLock<ObjRef>),
}

/// A heap value. Every value, primitives included, carries the same
/// header: memory info, a recursive monitor, a type pointer and a member
/// table.
pub struct Obj {
	info: MemoryInfo,
	monitor: Monitor,
	ty: RwLock<Option<ObjRef>>,
	members: RwLock<FxHashMap<String, MemberSlot>>,
	payload: Payload,
}

impl Obj {
	pub(crate) fn new(info: MemoryInfo, payload: Payload, ty: Option<ObjRef>) -> Self {
		Self {
			info,
			monitor: Monitor::new(),
			ty: RwLock::new(ty),
			members: RwLock::new(FxHashMap::default()),
			payload,
		}
	}

	pub fn info(&self) -> &MemoryInfo {
		&self.info
	}

	pub fn payload(&self) -> &Payload {
		&self.payload
	}

	pub fn tag(&self) -> ObjTag {
		match &self.payload {
			Payload::Null => ObjTag::Null,
			Payload::Bool(_) => ObjTag::Bool,
			Payload::Char(_) => ObjTag::Char,
			Payload::Int(_) => ObjTag::Int,
			Payload::Float(_) => ObjTag::Float,
			Payload::String(_) => ObjTag::String,
			Payload::Array(_) => ObjTag::Array,
			Payload::Instance => ObjTag::Object,
			Payload::Module(_) => ObjTag::Module,
			Payload::Method(_) => ObjTag::Method,
			Payload::Type(_) => ObjTag::Type,
			Payload::Capture(_) => ObjTag::Capture,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self.payload, Payload::Null)
	}

	pub fn enter_monitor(&self) {
		self.monitor.enter();
	}

	pub fn exit_monitor(&self) -> Result<(), FatalError> {
		self.monitor.exit()
	}

	/// The type pointer. Primitives start without one; the VM maps their
	/// tags onto the `basic` types on demand.
	pub fn ty(&self) -> Option<ObjRef> {
		self.ty.read().unwrap().clone()
	}

	/// Re-types the value (casts do this on success). Member slots the new
	/// type declares and the value lacks are merged in; existing state is
	/// kept.
	pub fn retype(&self, ty: ObjRef) {
		if ty.as_type().is_some() {
			let mut members = self.members.write().unwrap();
			for (name, slot) in ty.members.read().unwrap().iter() {
				members.entry(name.clone()).or_insert_with(|| slot.clone());
			}
		}
		*self.ty.write().unwrap() = Some(ty);
	}

	pub(crate) fn set_ty(&self, ty: Option<ObjRef>) {
		*self.ty.write().unwrap() = ty;
	}

	pub fn get_member(&self, name: &str) -> Result<ObjRef, FatalError> {
		if let Some(slot) = self.members.read().unwrap().get(name) {
			return Ok(slot.value().clone());
		}
		Err(FatalError::IllegalAccess(format!("cannot find member: {name} in {self}")))
	}

	/// Overwrites the named slot, or creates one when the name is new.
	pub fn set_member(&self, name: &str, value: ObjRef) {
		let mut members = self.members.write().unwrap();
		match members.get_mut(name) {
			Some(slot) => slot.value = value,
			None => {
				members.insert(name.to_string(), MemberSlot::new(value, Flags::default()));
			}
		}
	}

	pub fn set_member_with_flags(&self, name: &str, value: ObjRef, flags: Flags) {
		self.members
			.write()
			.unwrap()
			.insert(name.to_string(), MemberSlot::new(value, flags));
	}

	pub fn member_flags(&self, name: &str) -> Result<Flags, FatalError> {
		if let Some(slot) = self.members.read().unwrap().get(name) {
			return Ok(slot.flags());
		}
		Err(FatalError::IllegalAccess(format!("cannot find member: {name} in {self}")))
	}

	pub fn set_member_flags(&self, name: &str, flags: Flags) -> Result<(), FatalError> {
		if let Some(slot) = self.members.write().unwrap().get_mut(name) {
			slot.flags = flags;
			return Ok(());
		}
		Err(FatalError::IllegalAccess(format!("cannot find member: {name} in {self}")))
	}

	pub fn member_snapshot(&self) -> Vec<(String, MemberSlot)> {
		self.members
			.read()
			.unwrap()
			.iter()
			.map(|(name, slot)| (name.clone(), slot.clone()))
			.collect()
	}

	/// The truth value: null is false, primitives answer for their value,
	/// everything else is true.
	pub fn truth(&self) -> bool {
		match &self.payload {
			Payload::Null => false,
			Payload::Bool(value) => *value,
			Payload::Char(value) => *value != 0,
			Payload::Int(value) => *value != 0,
			Payload::Float(value) => *value != 0.0,
			Payload::String(value) => !value.is_empty(),
			Payload::Array(cells) => !cells.read().unwrap().is_empty(),
			Payload::Capture(cell) => !cell.read().unwrap().is_null(),
			_ => true,
		}
	}

	/// Structural comparison. Same-tag primitives compare by value,
	/// strings and arrays lexicographically; everything else is `Equal`
	/// only to itself and `Undefined` otherwise.
	pub fn compare(&self, other: &Obj) -> Ordering {
		match (&self.payload, &other.payload) {
			(Payload::Null, Payload::Null) => Ordering::Equal,
			(Payload::Bool(a), Payload::Bool(b)) => a.cmp(b).into(),
			(Payload::Char(a), Payload::Char(b)) => a.cmp(b).into(),
			(Payload::Int(a), Payload::Int(b)) => a.cmp(b).into(),
			(Payload::Float(a), Payload::Float(b)) => match a.partial_cmp(b) {
				Some(ordering) => ordering.into(),
				None => Ordering::Undefined,
			},
			(Payload::String(a), Payload::String(b)) => a.cmp(b).into(),
			(Payload::Array(a), Payload::Array(b)) => {
				if std::ptr::eq(self, other) {
					return Ordering::Equal;
				}
				let a = a.read().unwrap();
				let b = b.read().unwrap();
				for (lhs, rhs) in a.iter().zip(b.iter()) {
					match lhs.compare(rhs) {
						Ordering::Equal => continue,
						other => return other,
					}
				}
				a.len().cmp(&b.len()).into()
			}
			_ if self.tag() == other.tag() => match std::ptr::eq(self, other) {
				true => Ordering::Equal,
				false => Ordering::Undefined,
			},
			_ => Ordering::Undefined,
		}
	}

	/// Hash consistent with `compare == Equal`, used by match tables:
	/// primitives hash by tag and value, arrays element-wise, everything
	/// else by identity.
	pub fn structural_hash<H: Hasher>(&self, state: &mut H) {
		self.tag().hash(state);
		match &self.payload {
			Payload::Null => {}
			Payload::Bool(value) => value.hash(state),
			Payload::Char(value) => value.hash(state),
			Payload::Int(value) => value.hash(state),
			// Normalized so that positive and negative zero agree.
			Payload::Float(value) => {
				let bits = if *value == 0.0 { 0u64 } else { value.to_bits() };
				bits.hash(state);
			}
			Payload::String(value) => value.hash(state),
			Payload::Array(cells) => {
				for cell in cells.read().unwrap().iter() {
					cell.structural_hash(state);
				}
			}
			_ => (self as *const Obj as usize).hash(state),
		}
	}

	/// The shared handle to this object. Objects are born inside their
	/// handle, so the upgrade only fails mid-teardown.
	pub fn handle(&self) -> ObjRef {
		self.info.handle().expect("object used outside its handle")
	}

	/// Deep copy. Immutable values (and the long-lived module, method,
	/// type and capture objects) return themselves; this is observable
	/// through `is` and is part of the contract. Arrays and instances
	/// copy their contents recursively.
	pub fn copy(&self) -> ObjRef {
		match &self.payload {
			Payload::Array(cells) => {
				let items: Vec<ObjRef> = cells.read().unwrap().iter().map(|cell| cell.copy()).collect();
				self.info
					.manager()
					.alloc_typed(Payload::Array(RwLock::new(items.into_boxed_slice())), self.ty())
			}
			Payload::Instance => {
				let copy = self.info.manager().alloc_typed(Payload::Instance, self.ty());
				for (name, slot) in self.members.read().unwrap().iter() {
					copy.set_member_with_flags(name, slot.value().copy(), slot.flags());
				}
				copy
			}
			_ => self.handle(),
		}
	}

	// Payload accessors. `None` signals a tag mismatch; the interpreter
	// turns that into the cast throwable.

	pub fn as_bool(&self) -> Option<bool> {
		match &self.payload {
			Payload::Bool(value) => Some(*value),
			_ => None,
		}
	}

	pub fn as_char(&self) -> Option<u32> {
		match &self.payload {
			Payload::Char(value) => Some(*value),
			_ => None,
		}
	}

	pub fn as_int(&self) -> Option<i64> {
		match &self.payload {
			Payload::Int(value) => Some(*value),
			_ => None,
		}
	}

	pub fn as_float(&self) -> Option<f64> {
		match &self.payload {
			Payload::Float(value) => Some(*value),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match &self.payload {
			Payload::String(value) => Some(value),
			_ => None,
		}
	}

	pub fn as_method(&self) -> Option<&MethodState> {
		match &self.payload {
			Payload::Method(state) => Some(state),
			_ => None,
		}
	}

	pub fn as_module(&self) -> Option<&ModuleState> {
		match &self.payload {
			Payload::Module(state) => Some(state),
			_ => None,
		}
	}

	pub fn as_type(&self) -> Option<&TypeState> {
		match &self.payload {
			Payload::Type(state) => Some(state),
			_ => None,
		}
	}

	pub fn is_array(&self) -> bool {
		matches!(self.payload, Payload::Array(_))
	}

	pub fn array_len(&self) -> Result<usize, FatalError> {
		match &self.payload {
			Payload::Array(cells) => Ok(cells.read().unwrap().len()),
			_ => Err(FatalError::IllegalAccess(format!("not an array: {self}"))),
		}
	}

	/// Bounds-checked element read; negative indices wrap from the end.
	pub fn array_get(&self, index: i64) -> Result<ObjRef, FatalError> {
		match &self.payload {
			Payload::Array(cells) => {
				let cells = cells.read().unwrap();
				let index = wrap_index(index, cells.len())?;
				Ok(cells[index].clone())
			}
			_ => Err(FatalError::IllegalAccess(format!("not an array: {self}"))),
		}
	}

	pub fn array_set(&self, index: i64, value: ObjRef) -> Result<(), FatalError> {
		match &self.payload {
			Payload::Array(cells) => {
				let mut cells = cells.write().unwrap();
				let index = wrap_index(index, cells.len())?;
				cells[index] = value;
				Ok(())
			}
			_ => Err(FatalError::IllegalAccess(format!("not an array: {self}"))),
		}
	}

	pub fn array_items(&self) -> Result<Vec<ObjRef>, FatalError> {
		match &self.payload {
			Payload::Array(cells) => Ok(cells.read().unwrap().to_vec()),
			_ => Err(FatalError::IllegalAccess(format!("not an array: {self}"))),
		}
	}

	/// Reads through a capture cell.
	pub fn captured(&self) -> Option<ObjRef> {
		match &self.payload {
			Payload::Capture(cell) => Some(cell.read().unwrap().clone()),
			_ => None,
		}
	}

	pub fn set_captured(&self, value: ObjRef) -> Result<(), FatalError> {
		match &self.payload {
			Payload::Capture(cell) => {
				*cell.write().unwrap() = value;
				Ok(())
			}
			_ => Err(FatalError::IllegalAccess(format!("not a capture: {self}"))),
		}
	}
}

fn wrap_index(index: i64, length: usize) -> Result<usize, FatalError> {
	let wrapped = if index < 0 { index + length as i64 } else { index };
	if wrapped < 0 || wrapped >= length as i64 {
		return Err(FatalError::IllegalAccess(format!("index out of bounds: {index} (array)")));
	}
	Ok(wrapped as usize)
}

fn type_sign(ty: &Option<ObjRef>) -> String {
	ty.as_deref()
		.and_then(Obj::as_type)
		.map(|state| state.sign().to_string())
		.unwrap_or_else(|| "basic.any".into())
}

impl Display for Obj {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match &self.payload {
			Payload::Null => write!(f, "null"),
			Payload::Bool(value) => write!(f, "{value}"),
			Payload::Char(value) => {
				write!(f, "{}", char::from_u32(*value).unwrap_or(char::REPLACEMENT_CHARACTER))
			}
			Payload::Int(value) => write!(f, "{value}"),
			Payload::Float(value) => write!(f, "{}", format_float(*value)),
			Payload::String(value) => write!(f, "{value}"),
			Payload::Array(cells) => {
				write!(f, "[")?;
				for (i, cell) in cells.read().unwrap().iter().enumerate() {
					if i > 0 {
						write!(f, ", ")?;
					}
					write!(f, "{cell}")?;
				}
				write!(f, "]")
			}
			Payload::Instance => write!(f, "<object of type {}>", type_sign(&self.ty())),
			Payload::Module(state) => write!(f, "<module {}>", state.sign()),
			Payload::Method(state) => write!(f, "<{} '{}'>", state.kind().word(), state.sign()),
			Payload::Type(state) => write!(f, "<{} '{}'>", state.kind().word(), state.sign()),
			Payload::Capture(cell) => write!(f, "<capture of {}>", cell.read().unwrap()),
		}
	}
}

impl Debug for Obj {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}({self})", self.tag())
	}
}
