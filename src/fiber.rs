//! Stackful coroutines used as the unit of guest context switching.
//!
//! Each fiber is backed by a parked host thread with a 512 KiB stack. A
//! fiber's occupancy guard is held from the moment another fiber yields
//! into it until the fiber it next yields into starts running and releases
//! it; at most one host thread is ever inside a fiber. Yielding between two
//! fibers that are both currently running deadlocks on the guards, so every
//! host core thread keeps a thread fiber of its own to route switches
//! through.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::config::FIBER_STACK_SIZE;

/// Unwind payload requesting a restart from the rewind point.
struct RewindSignal;

/// Unwind payload requesting the fiber's host thread to exit.
struct ShutdownSignal;

struct FiberState {
	/// A host thread is inside the fiber, or one is about to enter it.
	occupied: bool,
	/// A resume has been handed to the fiber and not yet consumed.
	resumed: bool,
	/// The fiber that yielded into this one; cleared by the resumed fiber,
	/// which releases its occupancy.
	previous: Option<Arc<Fiber>>,
	shutdown: bool,
	released: bool,
	thread: Option<thread::JoinHandle<()>>,
}

pub struct Fiber {
	state: Mutex<FiberState>,
	resume_cv: Condvar,
	guard_cv: Condvar,
	rewind_point: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
	is_thread_fiber: bool,
}

impl Fiber {
	/// Spawns a new fiber. `entry` receives the fiber's own handle and must
	/// never return; it runs once the fiber is first yielded to.
	pub fn spawn(
		name: &str,
		entry: impl FnOnce(Arc<Fiber>) + Send + 'static,
	) -> Arc<Fiber> {
		let fiber = Arc::new(Fiber {
			state: Mutex::new(FiberState {
				occupied: false,
				resumed: false,
				previous: None,
				shutdown: false,
				released: false,
				thread: None,
			}),
			resume_cv: Condvar::new(),
			guard_cv: Condvar::new(),
			rewind_point: Mutex::new(None),
			is_thread_fiber: false,
		});

		let fiber_for_thread = fiber.clone();
		let handle = thread::Builder::new()
			.name(name.into())
			.stack_size(FIBER_STACK_SIZE)
			.spawn(move || Self::fiber_main(fiber_for_thread, entry))
			.expect("failed to spawn fiber host thread");
		fiber.state.lock().unwrap().thread = Some(handle);

		fiber
	}

	/// Wraps the calling host thread in a fiber. The fiber's guard is held
	/// from now until [`Fiber::exit`].
	pub fn thread_to_fiber() -> Arc<Fiber> {
		Arc::new(Fiber {
			state: Mutex::new(FiberState {
				occupied: true,
				resumed: false,
				previous: None,
				shutdown: false,
				released: false,
				thread: None,
			}),
			resume_cv: Condvar::new(),
			guard_cv: Condvar::new(),
			rewind_point: Mutex::new(None),
			is_thread_fiber: true,
		})
	}

	/// Transfers control from `from` (which must be the fiber the calling
	/// host thread is inside) to `to`. Returns once another fiber yields
	/// back into `from`.
	pub fn yield_to(from: &Arc<Fiber>, to: &Arc<Fiber>) {
		{
			let mut state = to.state.lock().unwrap();
			debug_assert!(!state.released, "yield to a dead fiber");
			while state.occupied {
				state = to.guard_cv.wait(state).unwrap();
			}
			state.occupied = true;
			state.previous = Some(from.clone());
			state.resumed = true;
			to.resume_cv.notify_one();
		}

		from.wait_for_resume();
		from.finish_switch();
	}

	/// Registers the closure that [`Fiber::rewind`] restarts from.
	pub fn set_rewind_point(&self, rewind: impl Fn() + Send + Sync + 'static) {
		*self.rewind_point.lock().unwrap() = Some(Arc::new(rewind));
	}

	/// Restarts the current fiber from its rewind point, abandoning the
	/// current execution. Must be called from inside the fiber; never
	/// returns.
	pub fn rewind(&self) -> ! {
		assert!(
			self.rewind_point.lock().unwrap().is_some(),
			"rewind without a rewind point"
		);
		panic::panic_any(RewindSignal);
	}

	/// Permanently releases a thread fiber's guard and marks it dead.
	pub fn exit(&self) {
		assert!(self.is_thread_fiber, "exiting a non thread fiber");
		let mut state = self.state.lock().unwrap();
		state.occupied = false;
		state.released = true;
		self.guard_cv.notify_all();
	}

	/// Requests a parked fiber's host thread to exit instead of resuming.
	pub fn shutdown(&self) {
		let mut state = self.state.lock().unwrap();
		state.shutdown = true;
		self.resume_cv.notify_all();
	}

	/// Waits for the fiber's host thread to finish. Call after
	/// [`Fiber::shutdown`].
	pub fn join(&self) {
		let handle = self.state.lock().unwrap().thread.take();
		if let Some(handle) = handle {
			let _ = handle.join();
		}
	}

	fn wait_for_resume(&self) {
		let mut state = self.state.lock().unwrap();
		loop {
			if state.shutdown {
				drop(state);
				panic::panic_any(ShutdownSignal);
			}
			if state.resumed {
				state.resumed = false;
				return;
			}
			state = self.resume_cv.wait(state).unwrap();
		}
	}

	/// Completes a resume: releases the guard of the fiber that yielded
	/// into this one.
	fn finish_switch(&self) {
		let previous = self
			.state
			.lock()
			.unwrap()
			.previous
			.take()
			.expect("fiber resumed without a previous fiber");
		let mut state = previous.state.lock().unwrap();
		state.occupied = false;
		previous.guard_cv.notify_one();
	}

	fn fiber_main(fiber: Arc<Fiber>, entry: impl FnOnce(Arc<Fiber>) + Send) {
		let first = {
			let fiber = fiber.clone();
			AssertUnwindSafe(move || {
				fiber.wait_for_resume();
				fiber.finish_switch();
				entry(fiber);
			})
		};

		let mut result: Result<(), Box<dyn Any + Send>> = panic::catch_unwind(first);
		loop {
			match result {
				Ok(()) => {
					warn!("fiber entry returned; marking the fiber dead");
					fiber.state.lock().unwrap().released = true;
					return;
				}
				Err(payload) if payload.is::<ShutdownSignal>() => return,
				Err(payload) if payload.is::<RewindSignal>() => {
					let rewind = fiber
						.rewind_point
						.lock()
						.unwrap()
						.clone()
						.expect("rewind without a rewind point");
					result = panic::catch_unwind(AssertUnwindSafe(move || (rewind.as_ref())()));
				}
				Err(payload) => {
					// A panic inside kernel or guest-loop code is an
					// invariant violation; take the whole emulator down
					// rather than silently wedging one core.
					if let Some(message) = payload
						.downcast_ref::<&str>()
						.copied()
						.map(String::from)
						.or_else(|| payload.downcast_ref::<String>().cloned())
					{
						error!("fiber panicked: {message}");
					} else {
						error!("fiber panicked");
					}
					std::process::abort();
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn ping_pong_round_trip() {
		let host = Fiber::thread_to_fiber();
		let hops = Arc::new(AtomicUsize::new(0));

		let worker = {
			let host = host.clone();
			let hops = hops.clone();
			Fiber::spawn("worker", move |me| loop {
				hops.fetch_add(1, Ordering::SeqCst);
				Fiber::yield_to(&me, &host);
			})
		};

		for expected in 1..=16 {
			Fiber::yield_to(&host, &worker);
			assert_eq!(hops.load(Ordering::SeqCst), expected);
		}

		worker.shutdown();
		worker.join();
		host.exit();
	}

	#[test]
	fn switch_through_intermediate_fiber() {
		let host = Fiber::thread_to_fiber();
		let order = Arc::new(Mutex::new(Vec::new()));

		// host -> a -> b -> host; a and b record their turns.
		let b = {
			let host = host.clone();
			let order = order.clone();
			Fiber::spawn("b", move |me| {
				order.lock().unwrap().push("b");
				Fiber::yield_to(&me, &host);
				unreachable!()
			})
		};
		let a = {
			let b = b.clone();
			let order = order.clone();
			Fiber::spawn("a", move |me| {
				order.lock().unwrap().push("a");
				Fiber::yield_to(&me, &b);
				unreachable!()
			})
		};

		Fiber::yield_to(&host, &a);
		assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);

		for fiber in [a, b] {
			fiber.shutdown();
			fiber.join();
		}
		host.exit();
	}

	#[test]
	fn rewind_restarts_from_rewind_point() {
		let host = Fiber::thread_to_fiber();
		let order = Arc::new(Mutex::new(Vec::new()));

		let worker = {
			let host = host.clone();
			let order = order.clone();
			Fiber::spawn("rewinder", move |me| {
				me.set_rewind_point({
					let order = order.clone();
					let host = host.clone();
					let me = me.clone();
					move || {
						order.lock().unwrap().push("rewind");
						Fiber::yield_to(&me, &host);
						unreachable!()
					}
				});
				order.lock().unwrap().push("entry");
				Fiber::yield_to(&me, &host);
				// Resumed a second time: restart on the rewind path.
				me.rewind();
			})
		};

		Fiber::yield_to(&host, &worker);
		Fiber::yield_to(&host, &worker);
		assert_eq!(*order.lock().unwrap(), vec!["entry", "rewind"]);

		worker.shutdown();
		worker.join();
		host.exit();
	}
}
