//! Process-wide condition variables over guest memory.
//!
//! The mutex word (tag) holds the owner thread's handle; bit 30 marks
//! waiter presence. Signalling hands the mutex to the next owner by
//! writing the new tag atomically and registering the woken thread as a
//! waiter on the new owner, so priority inheritance propagates across the
//! handoff.

use std::sync::atomic::{fence, Ordering};

use crate::kernel::handle_table::{Handle, KernelObject};
use crate::kernel::{KernelCore, KernelState};
use crate::result::{SvcError, SvcResult};
use crate::scheduler::thread::{self, SyncTreeAdapter, SyncTreeKind, ThreadId};
use crate::scheduler::SchedulerLockAndSleep;
use crate::synch::wait::{self, WaitQueue};

/// Bit set in a lock tag while other threads wait for it.
pub const HANDLE_WAIT_MASK: u32 = 1 << 30;

fn read_from_user(kernel: &KernelCore, addr: u64) -> Option<u32> {
	kernel.process().memory().read32(addr)
}

fn write_to_user(kernel: &KernelCore, addr: u64, value: u32) -> bool {
	kernel.process().memory().write32(addr, value)
}

/// Atomically ORs the wait mask into the lock word, or stores `if_zero`
/// when the word is free. Returns the previous value.
fn update_lock_atomic(kernel: &KernelCore, addr: u64, if_zero: u32, or_mask: u32) -> Option<u32> {
	let monitor = kernel.process().monitor();
	let slot = kernel.current_monitor_slot();

	loop {
		let expected = monitor.exclusive_read32(slot, addr)?;
		let value = if expected == 0 {
			if_zero
		} else {
			expected | or_mask
		};
		if monitor.exclusive_write32(slot, addr, value) {
			return Some(expected);
		}
	}
}

/// Releases the user mutex at `addr` held by the current thread, waking
/// the highest-priority waiter as the new owner (ArbitrateUnlock).
pub(crate) fn signal_to_address(kernel: &KernelCore, addr: u64) -> SvcResult {
	let owner = kernel.current_thread_id();
	let mut guard = kernel.lock_scheduler();
	let s = guard.state();

	let (next_owner, has_waiters) = thread::remove_waiter_by_key(kernel, s, owner, addr, false);

	let mut next_value = 0u32;
	if let Some(next) = next_owner {
		next_value = s.thread(next).address_key_value;
		if has_waiters {
			next_value |= HANDLE_WAIT_MASK;
		}
	}

	fence(Ordering::SeqCst);

	let result = if write_to_user(kernel, addr, next_value) {
		Ok(())
	} else {
		Err(SvcError::InvalidCurrentMemory)
	};

	if let Some(next) = next_owner {
		wait::end_wait(kernel, s, next, result);
	}

	result
}

/// Acquires the contended user mutex at `addr` tagged with
/// `handle | HANDLE_WAIT_MASK` by waiting on its owner (ArbitrateLock).
pub(crate) fn wait_for_address(
	kernel: &KernelCore,
	handle: Handle,
	addr: u64,
	tag: u32,
) -> SvcResult {
	let tid = kernel.current_thread_id();

	{
		let mut guard = kernel.lock_scheduler();
		let s = guard.state();

		if s.thread(tid).shared.is_termination_requested() {
			return Err(SvcError::TerminationRequested);
		}

		let test_tag = read_from_user(kernel, addr).ok_or(SvcError::InvalidCurrentMemory)?;

		// The lock was released (or handed over) in the meantime.
		if test_tag != (handle | HANDLE_WAIT_MASK) {
			return Ok(());
		}

		let owner = match kernel.process().handle_table().get(handle) {
			Some(KernelObject::Thread(owner)) => owner,
			_ => return Err(SvcError::InvalidHandle),
		};

		s.thread_mut(tid).set_user_address_key(addr, tag);
		thread::add_waiter(kernel, s, owner, tid);

		thread::begin_wait(kernel, s, tid, WaitQueue::lock_owner());
	}

	kernel.current_thread_shared().load_wait_result()
}

/// Wakes one condvar waiter: hands it the mutex if it is free, or chains
/// it onto the current mutex owner.
fn signal_impl(kernel: &KernelCore, s: &mut KernelState, target: ThreadId) {
	let addr = s.thread(target).address_key;
	let own_tag = s.thread(target).address_key_value;

	match update_lock_atomic(kernel, addr, own_tag, HANDLE_WAIT_MASK) {
		None => {
			// The lock word is inaccessible.
			wait::end_wait(kernel, s, target, Err(SvcError::InvalidCurrentMemory));
		}
		Some(0) => {
			// Nobody held the lock; the target owns it now.
			wait::end_wait(kernel, s, target, Ok(()));
		}
		Some(prev_tag) => {
			// Wait on the previous owner; the target stays asleep.
			let owner_handle = prev_tag & !HANDLE_WAIT_MASK;
			match kernel.process().handle_table().get(owner_handle) {
				Some(KernelObject::Thread(owner)) => {
					thread::add_waiter(kernel, s, owner, target);
				}
				_ => {
					// The lock is tagged with a thread that doesn't exist.
					wait::end_wait(kernel, s, target, Err(SvcError::InvalidState));
				}
			}
		}
	}
}

/// Wakes up to `count` waiters on `cv_key` (count <= 0 wakes all);
/// clears the key's has-waiter flag when the tree runs dry.
pub(crate) fn signal(kernel: &KernelCore, cv_key: u64, count: i32) {
	let mut guard = kernel.lock_scheduler();
	let s = guard.state();

	let mut num_waiters = 0;
	let mut it = {
		let KernelState { threads, condvar_tree, .. } = &mut *s;
		condvar_tree.lower_bound(&SyncTreeAdapter(threads), &(cv_key, i32::MIN))
	};
	while let Some(target) = it {
		if s.thread(target).sync_key != cv_key || (count > 0 && num_waiters >= count) {
			break;
		}

		let next = {
			let KernelState { threads, condvar_tree, .. } = &mut *s;
			condvar_tree.next(&SyncTreeAdapter(threads), target)
		};

		{
			let KernelState { threads, condvar_tree, .. } = &mut *s;
			condvar_tree.remove(&mut SyncTreeAdapter(threads), target);
		}
		s.thread_mut(target).sync_tree = None;

		signal_impl(kernel, s, target);

		it = next;
		num_waiters += 1;
	}

	// No waiters remain for this key: clear the has-waiter flag.
	let drained = match it {
		None => true,
		Some(target) => s.thread(target).sync_key != cv_key,
	};
	if drained {
		write_to_user(kernel, cv_key, 0);
	}
}

/// WaitProcessWideKeyAtomic: releases the mutex at `addr` (waking its next
/// owner) and enqueues on the condvar key, all under one scheduler-lock
/// hold.
pub(crate) fn wait(
	kernel: &KernelCore,
	addr: u64,
	cv_key: u64,
	tag: u32,
	timeout: i64,
) -> SvcResult {
	let tid = kernel.current_thread_id();

	{
		let mut slp = SchedulerLockAndSleep::new(kernel, tid, timeout);
		let s = slp.state();

		if s.thread(tid).shared.is_termination_requested() {
			slp.cancel_sleep();
			return Err(SvcError::TerminationRequested);
		}

		{
			// Release the mutex and update it for the next owner.
			let (next_owner, has_waiters) =
				thread::remove_waiter_by_key(kernel, s, tid, addr, false);

			let mut next_value = 0u32;
			if let Some(next) = next_owner {
				next_value = s.thread(next).address_key_value;
				if has_waiters {
					next_value |= HANDLE_WAIT_MASK;
				}
				wait::end_wait(kernel, s, next, Ok(()));
			}

			// Mark the condvar key as contended before publishing the new
			// mutex value.
			write_to_user(kernel, cv_key, 1);
			fence(Ordering::SeqCst);

			if !write_to_user(kernel, addr, next_value) {
				slp.cancel_sleep();
				return Err(SvcError::InvalidCurrentMemory);
			}
		}

		if timeout == 0 {
			slp.cancel_sleep();
			return Err(SvcError::TimedOut);
		}

		let with_timer = slp.timer_will_arm();
		let s = slp.state();
		s.thread_mut(tid).set_user_address_key(addr, tag);
		s.thread_mut(tid).sync_key = cv_key;
		s.thread_mut(tid).sync_tree = Some(SyncTreeKind::Condvar);
		{
			let KernelState { threads, condvar_tree, .. } = &mut *s;
			condvar_tree.insert(&mut SyncTreeAdapter(threads), tid);
		}

		thread::begin_wait(kernel, s, tid, WaitQueue::condvar_wait(with_timer));
	}

	kernel.current_thread_shared().load_wait_result()
}
