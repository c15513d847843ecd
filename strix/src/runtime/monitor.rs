use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::errors::FatalError;

#[derive(Default)]
struct MonitorState {
	owner: Option<ThreadId>,
	entries: u32,
}

/// The per-object recursive monitor backing `ENTERMONITOR`/`EXITMONITOR`.
///
/// A thread may enter the monitor any number of times but must exit it
/// exactly as many times; lock and unlock happen in separate opcodes, so
/// ownership is tracked explicitly rather than through a guard.
#[derive(Default)]
pub struct Monitor {
	state: Mutex<MonitorState>,
	available: Condvar,
}

impl Monitor {
	pub fn new() -> Self {
		Self::default()
	}

	/// Blocks until the monitor is free or already owned by this thread,
	/// then takes one entry.
	pub fn enter(&self) {
		let me = thread::current().id();
		let mut state = self.state.lock().unwrap();
		while state.owner.is_some() && state.owner != Some(me) {
			state = self.available.wait(state).unwrap();
		}
		state.owner = Some(me);
		state.entries += 1;
	}

	/// Releases one entry; the last exit wakes one waiter. Exiting a
	/// monitor this thread does not own breaks the pairing contract.
	pub fn exit(&self) -> Result<(), FatalError> {
		let me = thread::current().id();
		let mut state = self.state.lock().unwrap();
		if state.owner != Some(me) {
			return Err(FatalError::Argument {
				sign: "Monitor::exit".into(),
				message: "monitor is not owned by the current thread".into(),
			});
		}
		state.entries -= 1;
		if state.entries == 0 {
			state.owner = None;
			drop(state);
			self.available.notify_one();
		}
		Ok(())
	}

	#[cfg(test)]
	fn is_locked(&self) -> bool {
		self.state.lock().unwrap().owner.is_some()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	#[test]
	fn reentrant_on_the_same_thread() {
		let monitor = Monitor::new();
		monitor.enter();
		monitor.enter();
		monitor.exit().unwrap();
		assert!(monitor.is_locked());
		monitor.exit().unwrap();
		assert!(!monitor.is_locked());
	}

	#[test]
	fn exit_without_ownership_is_an_error() {
		let monitor = Monitor::new();
		assert!(monitor.exit().is_err());
	}

	#[test]
	fn contended_entry_blocks_until_release() {
		let monitor = Arc::new(Monitor::new());
		monitor.enter();

		let contender = {
			let monitor = monitor.clone();
			std::thread::spawn(move || {
				monitor.enter();
				monitor.exit().unwrap();
			})
		};

		monitor.exit().unwrap();
		contender.join().unwrap();
		assert!(!monitor.is_locked());
	}
}
