use crate::vm::StrixVm;

/// The in-process debugger hook. When a debugger is attached the
/// interpreter calls [`Debugger::update`] before dispatching each
/// instruction; the callback may block for as long as it likes but gets
/// read-only access and must not mutate interpreter state.
pub trait Debugger: Send + Sync {
	/// Called once before the program starts.
	fn init(&self, vm: &StrixVm) {
		let _ = vm;
	}

	/// Called before every instruction dispatch.
	fn update(&self, vm: &StrixVm);

	/// Called once after the last thread terminates.
	fn cleanup(&self, vm: &StrixVm) {
		let _ = vm;
	}
}
