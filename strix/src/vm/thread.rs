use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::thread::{self, JoinHandle, ThreadId};

use fxhash::FxHashMap;
use tracing::debug;

use crate::errors::FatalError;
use crate::runtime::frame::Frame;
use crate::vm::StrixVm;

/// The call stack of one thread of execution.
pub struct ThreadState {
	frames: Vec<Frame>,
	max_depth: usize,
}

impl ThreadState {
	pub fn new(max_depth: usize) -> Self {
		Self { frames: Vec::new(), max_depth }
	}

	pub fn depth(&self) -> usize {
		self.frames.len()
	}

	pub fn frames(&self) -> &[Frame] {
		&self.frames
	}

	pub fn push_frame(&mut self, frame: Frame) -> Result<(), FatalError> {
		if self.frames.len() >= self.max_depth {
			return Err(FatalError::StackOverflow);
		}
		self.frames.push(frame);
		Ok(())
	}

	pub fn pop_frame(&mut self) -> Option<Frame> {
		self.frames.pop()
	}

	/// Swaps the active frame in place; the frame budget is unchanged.
	/// This is how tail calls avoid growing the stack.
	pub fn replace_frame(&mut self, frame: Frame) -> Result<(), FatalError> {
		match self.frames.last_mut() {
			Some(slot) => {
				*slot = frame;
				Ok(())
			}
			None => Err(FatalError::IllegalAccess("no active frame".into())),
		}
	}

	pub fn frame(&mut self) -> Result<&mut Frame, FatalError> {
		self.frames
			.last_mut()
			.ok_or_else(|| FatalError::IllegalAccess("no active frame".into()))
	}

	pub fn frame_ref(&self) -> Result<&Frame, FatalError> {
		self.frames
			.last()
			.ok_or_else(|| FatalError::IllegalAccess("no active frame".into()))
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadStatus {
	NotStarted,
	Running,
	Terminated,
}

fn registry() -> &'static RwLock<FxHashMap<ThreadId, Arc<VmThread>>> {
	static REGISTRY: OnceLock<RwLock<FxHashMap<ThreadId, Arc<VmThread>>>> = OnceLock::new();
	REGISTRY.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// A VM thread: an OS thread plus its status and exit code, registered in
/// the process-wide thread registry for the lifetime of its body.
pub struct VmThread {
	vm: Arc<StrixVm>,
	handle: Mutex<Option<JoinHandle<()>>>,
	status: RwLock<ThreadStatus>,
	exit_code: AtomicI32,
}

impl VmThread {
	/// Spawns the thread with the registration handshake: the body runs
	/// only after the thread appears in the registry and `pre` has
	/// completed, and this constructor returns only after both happened.
	pub fn spawn(
		vm: Arc<StrixVm>,
		pre: impl FnOnce(&Arc<VmThread>) + Send + 'static,
		body: impl FnOnce(&Arc<VmThread>) + Send + 'static,
	) -> Arc<VmThread> {
		let this = Arc::new(VmThread {
			vm,
			handle: Mutex::new(None),
			status: RwLock::new(ThreadStatus::NotStarted),
			exit_code: AtomicI32::new(0),
		});

		// Clearance: the spawner signals once the thread is registered.
		let clearance = Arc::new((Mutex::new(false), Condvar::new()));
		// Started: the thread signals once `pre` has run.
		let started = Arc::new((Mutex::new(false), Condvar::new()));

		let handle = {
			let this = this.clone();
			let clearance = clearance.clone();
			let started = started.clone();
			thread::spawn(move || {
				{
					let (lock, condvar) = &*clearance;
					let mut cleared = lock.lock().unwrap();
					while !*cleared {
						cleared = condvar.wait(cleared).unwrap();
					}
					pre(&this);
					let (lock, _) = &*started;
					*lock.lock().unwrap() = true;
				}
				started.1.notify_one();

				body(&this);

				registry().write().unwrap().remove(&thread::current().id());
				debug!("thread unregistered");
			})
		};

		{
			// Register before giving clearance, under the clearance lock,
			// so no body observes an unregistered self.
			let (lock, _) = &*clearance;
			let mut cleared = lock.lock().unwrap();
			registry().write().unwrap().insert(handle.thread().id(), this.clone());
			debug!("thread registered");
			*cleared = true;
		}
		clearance.1.notify_one();

		{
			let (lock, condvar) = &*started;
			let mut has_started = lock.lock().unwrap();
			while !*has_started {
				has_started = condvar.wait(has_started).unwrap();
			}
		}

		*this.handle.lock().unwrap() = Some(handle);
		this
	}

	/// The VM thread executing on the current OS thread, if any.
	pub fn current() -> Option<Arc<VmThread>> {
		registry().read().unwrap().get(&thread::current().id()).cloned()
	}

	pub fn vm(&self) -> &Arc<StrixVm> {
		&self.vm
	}

	pub fn status(&self) -> ThreadStatus {
		*self.status.read().unwrap()
	}

	pub fn set_status(&self, status: ThreadStatus) {
		*self.status.write().unwrap() = status;
	}

	pub fn is_running(&self) -> bool {
		self.status() == ThreadStatus::Running
	}

	pub fn exit_code(&self) -> i32 {
		self.exit_code.load(AtomicOrdering::Acquire)
	}

	pub fn set_exit_code(&self, code: i32) {
		self.exit_code.store(code, AtomicOrdering::Release);
	}

	/// Blocks until the thread body completes.
	pub fn join(&self) {
		let handle = self.handle.lock().unwrap().take();
		if let Some(handle) = handle {
			let _ = handle.join();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::*;
	use crate::vm::Settings;

	#[test]
	fn the_body_sees_itself_registered_and_pre_ran_first() {
		let vm = StrixVm::new(Settings::default());
		let pre_ran = Arc::new(AtomicBool::new(false));
		let body_ok = Arc::new(AtomicBool::new(false));

		let thread = VmThread::spawn(
			vm,
			{
				let pre_ran = pre_ran.clone();
				move |_| pre_ran.store(true, Ordering::SeqCst)
			},
			{
				let pre_ran = pre_ran.clone();
				let body_ok = body_ok.clone();
				move |this| {
					let registered = VmThread::current().is_some_and(|current| Arc::ptr_eq(&current, this));
					body_ok.store(registered && pre_ran.load(Ordering::SeqCst), Ordering::SeqCst);
				}
			},
		);

		// The constructor may only return after `pre` completed.
		assert!(pre_ran.load(Ordering::SeqCst));
		thread.join();
		assert!(body_ok.load(Ordering::SeqCst));
		assert!(VmThread::current().is_none());
	}

	#[test]
	fn exit_codes_and_status_are_observable() {
		let vm = StrixVm::new(Settings::default());
		let thread = VmThread::spawn(vm, |_| {}, |this| {
			this.set_status(ThreadStatus::Running);
			this.set_exit_code(7);
			this.set_status(ThreadStatus::Terminated);
		});
		thread.join();
		assert_eq!(thread.exit_code(), 7);
		assert_eq!(thread.status(), ThreadStatus::Terminated);
	}
}
