//! Kernel-internal locks that schedule: a light lock packs the owner
//! thread id and a waiter bit into one word, taking the scheduler-locked
//! slow path only on contention. Waiters participate in priority
//! inheritance through kernel address keys.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hermit_sync::SpinMutex;

use crate::kernel::{KernelCore, KernelState};
use crate::scheduler::thread::{self, ThreadId};
use crate::scheduler::SchedulerLockAndSleep;
use crate::synch::wait::{self, WaitQueue};

const WAITER_BIT: u64 = 1;

/// The tag packs the owner id shifted left once with the waiter bit.
fn pack(owner: ThreadId, has_waiters: bool) -> u64 {
	(owner.to_raw() << 1) | u64::from(has_waiters)
}

fn owner_of(tag: u64) -> Option<ThreadId> {
	ThreadId::from_raw(tag >> 1)
}

pub(crate) struct LightLock {
	tag: AtomicU64,
}

impl LightLock {
	pub const fn new() -> Self {
		Self {
			tag: AtomicU64::new(0),
		}
	}

	/// Key identifying this lock in the priority-inheritance graph. The
	/// lock must not move while contended; every LightLock here lives
	/// inside a heap allocation that outlives its waiters.
	fn address_key(&self) -> u64 {
		&self.tag as *const AtomicU64 as u64
	}

	pub fn lock(&self, kernel: &KernelCore) {
		let cur = kernel.current_thread_id();

		loop {
			let mut old_tag = self.tag.load(Ordering::Relaxed);

			loop {
				let new_tag = if old_tag == 0 {
					pack(cur, false)
				} else {
					old_tag | WAITER_BIT
				};
				match self.tag.compare_exchange_weak(
					old_tag,
					new_tag,
					Ordering::Acquire,
					Ordering::Relaxed,
				) {
					Ok(_) => break,
					Err(observed) => old_tag = observed,
				}
			}

			if old_tag == 0 || self.lock_slow_path(kernel, old_tag | WAITER_BIT, cur) {
				break;
			}
		}
	}

	pub fn unlock(&self, kernel: &KernelCore) {
		let cur = kernel.current_thread_id();

		let expected = pack(cur, false);
		if self
			.tag
			.compare_exchange(expected, 0, Ordering::Release, Ordering::Relaxed)
			.is_err()
		{
			let mut guard = kernel.lock_scheduler();
			self.unlock_slow_path(kernel, guard.state(), cur);
		}
	}

	/// Variant for callers already holding the scheduler lock.
	pub(crate) fn unlock_with_state(&self, kernel: &KernelCore, s: &mut KernelState) {
		let cur = kernel.current_thread_id();

		let expected = pack(cur, false);
		if self
			.tag
			.compare_exchange(expected, 0, Ordering::Release, Ordering::Relaxed)
			.is_err()
		{
			self.unlock_slow_path(kernel, s, cur);
		}
	}

	/// Returns true once the lock has been acquired (by handoff), false if
	/// the tag moved and the fast path must retry.
	fn lock_slow_path(&self, kernel: &KernelCore, owner_tag: u64, cur: ThreadId) -> bool {
		let mut guard = kernel.lock_scheduler();
		let s = guard.state();

		// Ensure we actually have locking to do.
		if self.tag.load(Ordering::Relaxed) != owner_tag {
			return false;
		}

		let owner = owner_of(owner_tag).expect("locked tag without an owner");
		s.thread_mut(cur).set_kernel_address_key(self.address_key());
		thread::add_waiter(kernel, s, owner, cur);

		thread::begin_wait(kernel, s, cur, WaitQueue::light_lock());

		if s.thread(owner).is_suspended() {
			thread::continue_if_has_kernel_waiters(kernel, s, owner);
		}

		true
	}

	fn unlock_slow_path(&self, kernel: &KernelCore, s: &mut KernelState, cur: ThreadId) {
		// Pass the lock to the next owner.
		let (next_owner, has_waiters) =
			thread::remove_waiter_by_key(kernel, s, cur, self.address_key(), true);

		let next_tag = match next_owner {
			Some(next) => {
				wait::end_wait(kernel, s, next, Ok(()));
				if s.thread(next).is_suspended() {
					thread::continue_if_has_kernel_waiters(kernel, s, next);
				}
				pack(next, has_waiters)
			}
			None => 0,
		};

		// We may have been unsuspended while holding kernel waiters;
		// re-suspend now that they are gone.
		if s.thread(cur).is_suspend_requested() {
			thread::try_suspend(kernel, s, cur);
		}

		self.tag.store(next_tag, Ordering::Release);
	}

	pub fn is_locked_by_current_thread(&self, kernel: &KernelCore) -> bool {
		owner_of(self.tag.load(Ordering::Relaxed)) == Some(kernel.current_thread_id())
	}
}

/// Condition variable over a [`LightLock`], for kernel-internal waits.
pub(crate) struct LightCondVar {
	wait_list: Arc<SpinMutex<Vec<ThreadId>>>,
}

impl LightCondVar {
	pub fn new() -> Self {
		Self {
			wait_list: Arc::new(SpinMutex::new(Vec::new())),
		}
	}

	/// Releases `lock`, sleeps until broadcast (or `timeout` ticks), then
	/// reacquires `lock`. With `allow_terminating_thread`, termination does
	/// not interrupt the wait.
	pub fn wait(
		&self,
		kernel: &KernelCore,
		lock: &LightLock,
		timeout: i64,
		allow_terminating_thread: bool,
	) {
		debug_assert!(lock.is_locked_by_current_thread(kernel));
		let tid = kernel.current_thread_id();

		{
			let mut slp = SchedulerLockAndSleep::new(kernel, tid, timeout);
			let s = slp.state();

			if !allow_terminating_thread && s.thread(tid).shared.is_termination_requested() {
				slp.cancel_sleep();
				return;
			}

			lock.unlock_with_state(kernel, s);

			self.wait_list.lock().push(tid);

			let with_timer = slp.timer_will_arm();
			let s = slp.state();
			thread::begin_wait(
				kernel,
				s,
				tid,
				WaitQueue::light_condvar(
					self.wait_list.clone(),
					allow_terminating_thread,
					with_timer,
				),
			);
		}

		lock.lock(kernel);
	}

	/// Wakes every waiter; the caller holds the scheduler lock.
	pub(crate) fn broadcast_with_state(&self, kernel: &KernelCore, s: &mut KernelState) {
		let woken: Vec<ThreadId> = self.wait_list.lock().drain(..).collect();
		for tid in woken {
			wait::end_wait(kernel, s, tid, Ok(()));
		}
	}
}
