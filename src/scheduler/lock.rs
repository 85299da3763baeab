//! The global scheduler lock.
//!
//! Recursive on the owning thread; acquiring disables dispatch on the
//! current thread. The final release is the linearization point of every
//! scheduling decision: it fences, recomputes the chosen thread per core,
//! releases the underlying spin lock and then reschedules the cores whose
//! choice changed.

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use super::thread::ThreadId;
use super::timer;
use crate::kernel::{KernelCore, KernelState};

/// Plain test-and-set spin lock; the scheduler lock never sleeps.
pub(crate) struct RawSpinLock {
	locked: AtomicBool,
}

impl RawSpinLock {
	pub const fn new() -> Self {
		Self {
			locked: AtomicBool::new(false),
		}
	}

	pub fn lock(&self) {
		let backoff = Backoff::new();
		while self
			.locked
			.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			backoff.snooze();
		}
	}

	pub fn unlock(&self) {
		self.locked.store(false, Ordering::Release);
	}
}

pub(crate) struct SchedulerLock {
	spin: RawSpinLock,
	owner: AtomicU64,
	depth: AtomicU32,
}

impl SchedulerLock {
	pub const fn new() -> Self {
		Self {
			spin: RawSpinLock::new(),
			owner: AtomicU64::new(0),
			depth: AtomicU32::new(0),
		}
	}

	pub fn is_locked_by_current_thread(&self, kernel: &KernelCore) -> bool {
		self.owner.load(Ordering::Acquire) == kernel.current_thread_id().to_raw()
	}

	pub(crate) fn lock(&self, kernel: &KernelCore) {
		if self.is_locked_by_current_thread(kernel) {
			debug_assert!(self.depth.load(Ordering::Relaxed) > 0);
			self.depth.fetch_add(1, Ordering::Relaxed);
		} else {
			kernel.disable_dispatch();
			self.spin.lock();
			debug_assert_eq!(self.depth.load(Ordering::Relaxed), 0);
			self.owner
				.store(kernel.current_thread_id().to_raw(), Ordering::Release);
			self.depth.store(1, Ordering::Relaxed);
		}
	}

	pub(crate) fn unlock(&self, kernel: &KernelCore) {
		debug_assert!(self.is_locked_by_current_thread(kernel));

		if self.depth.fetch_sub(1, Ordering::Relaxed) > 1 {
			return;
		}

		fence(Ordering::SeqCst);

		// Still the owner: safe to look at the guarded state.
		let cores_needing_scheduling = {
			let state = unsafe { kernel.state_unchecked() };
			if state.update_needed {
				super::update_highest_priority_threads(kernel, state)
			} else {
				0
			}
		};

		self.owner.store(0, Ordering::Release);
		self.spin.unlock();

		super::enable_scheduling(kernel, cores_needing_scheduling);
	}
}

/// RAII guard for the scheduler lock; the only safe door to the kernel
/// state. Nested operations receive `&mut KernelState` instead of taking
/// the guard again.
pub(crate) struct SchedulerGuard<'a> {
	kernel: &'a KernelCore,
}

impl<'a> SchedulerGuard<'a> {
	pub(crate) fn new(kernel: &'a KernelCore) -> Self {
		kernel.scheduler_lock().lock(kernel);
		Self { kernel }
	}

	pub fn state(&mut self) -> &mut KernelState {
		unsafe { self.kernel.state_unchecked() }
	}
}

impl Drop for SchedulerGuard<'_> {
	fn drop(&mut self) {
		self.kernel.scheduler_lock().unlock(self.kernel);
	}
}

/// Takes the scheduler lock and, unless cancelled, arms the hardware timer
/// for the given thread right before releasing it. SVC wait paths bail out
/// with [`SchedulerLockAndSleep::cancel_sleep`] on every error return so a
/// failed wait leaves no timer task behind.
pub(crate) struct SchedulerLockAndSleep<'a> {
	kernel: &'a KernelCore,
	thread: ThreadId,
	timeout_tick: i64,
}

impl<'a> SchedulerLockAndSleep<'a> {
	pub fn new(kernel: &'a KernelCore, thread: ThreadId, timeout_tick: i64) -> Self {
		kernel.scheduler_lock().lock(kernel);
		Self {
			kernel,
			thread,
			timeout_tick,
		}
	}

	pub fn state(&mut self) -> &mut KernelState {
		unsafe { self.kernel.state_unchecked() }
	}

	pub fn cancel_sleep(&mut self) {
		self.timeout_tick = 0;
	}

	/// Whether dropping this guard will arm the timer.
	pub fn timer_will_arm(&self) -> bool {
		self.timeout_tick > 0
	}
}

impl Drop for SchedulerLockAndSleep<'_> {
	fn drop(&mut self) {
		if self.timeout_tick > 0 {
			let state = unsafe { self.kernel.state_unchecked() };
			timer::register_absolute_task(self.kernel, state, self.thread, self.timeout_tick);
		}
		self.kernel.scheduler_lock().unlock(self.kernel);
	}
}
