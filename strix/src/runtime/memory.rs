use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use crate::runtime::obj::{Obj, ObjRef, Payload};

/// Per-object allocation header: the back-pointer to the owning manager,
/// the collector's mark bit, and the object's own shared handle.
pub struct MemoryInfo {
	manager: Arc<MemoryManager>,
	marked: AtomicBool,
	this: Weak<Obj>,
}

impl MemoryInfo {
	pub fn manager(&self) -> &Arc<MemoryManager> {
		&self.manager
	}

	/// The shared handle of the object carrying this header. Every object
	/// is born inside its handle, so this only fails mid-teardown.
	pub fn handle(&self) -> Option<ObjRef> {
		self.this.upgrade()
	}

	pub fn is_marked(&self) -> bool {
		self.marked.load(AtomicOrdering::Relaxed)
	}

	pub fn set_marked(&self, marked: bool) {
		self.marked.store(marked, AtomicOrdering::Relaxed);
	}
}

/// Observes allocations as they happen. This is the seam a collector
/// hangs off of; the default manager counts and otherwise does nothing.
pub trait CollectorHook: Send + Sync {
	fn object_allocated(&self, obj: &ObjRef);
}

/// The uniform allocator for runtime values. Every heap value is created
/// here so that each one carries its manager back-pointer and passes
/// through the post-allocation hook.
pub struct MemoryManager {
	objects_allocated: AtomicUsize,
	hook: RwLock<Option<Box<dyn CollectorHook>>>,
	null: OnceLock<ObjRef>,
	this: Weak<MemoryManager>,
}

impl MemoryManager {
	pub fn new() -> Arc<Self> {
		Arc::new_cyclic(|this| Self {
			objects_allocated: AtomicUsize::new(0),
			hook: RwLock::new(None),
			null: OnceLock::new(),
			this: this.clone(),
		})
	}

	fn arc(&self) -> Arc<MemoryManager> {
		self.this.upgrade().expect("manager used outside its handle")
	}

	pub fn set_hook(&self, hook: Box<dyn CollectorHook>) {
		*self.hook.write().unwrap() = Some(hook);
	}

	pub fn objects_allocated(&self) -> usize {
		self.objects_allocated.load(AtomicOrdering::Relaxed)
	}

	pub fn alloc(&self, payload: Payload) -> ObjRef {
		self.alloc_typed(payload, None)
	}

	pub fn alloc_typed(&self, payload: Payload, ty: Option<ObjRef>) -> ObjRef {
		let manager = self.arc();
		let obj = Arc::new_cyclic(|this| {
			let info = MemoryInfo {
				manager,
				marked: AtomicBool::new(false),
				this: this.clone(),
			};
			Obj::new(info, payload, ty)
		});
		self.objects_allocated.fetch_add(1, AtomicOrdering::Relaxed);
		if let Some(hook) = self.hook.read().unwrap().as_ref() {
			hook.object_allocated(&obj);
		}
		obj
	}

	/// The shared null value. Null is immutable, so one object per
	/// manager serves every default-initialized slot.
	pub fn null(&self) -> ObjRef {
		self.null.get_or_init(|| self.alloc(Payload::Null)).clone()
	}

	pub fn bool(&self, value: bool) -> ObjRef {
		self.alloc(Payload::Bool(value))
	}

	pub fn char(&self, value: u32) -> ObjRef {
		self.alloc(Payload::Char(value))
	}

	pub fn int(&self, value: i64) -> ObjRef {
		self.alloc(Payload::Int(value))
	}

	pub fn float(&self, value: f64) -> ObjRef {
		self.alloc(Payload::Float(value))
	}

	pub fn string(&self, value: impl Into<Box<str>>) -> ObjRef {
		self.alloc(Payload::String(value.into()))
	}

	/// A fixed-length array with every slot holding null.
	pub fn array(&self, length: usize) -> ObjRef {
		let null = self.null();
		self.array_from(vec![null; length])
	}

	pub fn array_from(&self, items: Vec<ObjRef>) -> ObjRef {
		self.alloc(Payload::Array(RwLock::new(items.into_boxed_slice())))
	}

	pub fn capture(&self, value: ObjRef) -> ObjRef {
		self.alloc(Payload::Capture(RwLock::new(value)))
	}
}
