//! The address arbiter: futex-like compare/decrement waits on guest
//! memory words, with waiters ordered by (address, priority) in a
//! red-black tree shared with the condition variable machinery.

use crate::kernel::{KernelCore, KernelState};
use crate::result::{SvcError, SvcResult};
use crate::scheduler::thread::{self, SyncTreeAdapter, SyncTreeKind, ThreadId};
use crate::scheduler::SchedulerLockAndSleep;
use crate::synch::wait::{self, WaitQueue};

fn read_from_user(kernel: &KernelCore, addr: u64) -> Option<i32> {
	kernel.process().memory().read32(addr).map(|v| v as i32)
}

/// Emulates the guest's LDXR/CMP/STXR decrement loop.
fn decrement_if_less_than(kernel: &KernelCore, addr: u64, value: i32) -> Option<i32> {
	let monitor = kernel.process().monitor();
	let slot = kernel.current_monitor_slot();

	loop {
		let current = monitor.exclusive_read32(slot, addr)? as i32;
		if current < value {
			if monitor.exclusive_write32(slot, addr, (current - 1) as u32) {
				return Some(current);
			}
			// Lost the reservation; try again.
		} else {
			monitor.clear_exclusive(slot);
			return Some(current);
		}
	}
}

/// Emulates the guest's LDXR/CMP/STXR compare-and-set loop.
fn update_if_equal(kernel: &KernelCore, addr: u64, value: i32, new_value: i32) -> Option<i32> {
	let monitor = kernel.process().monitor();
	let slot = kernel.current_monitor_slot();

	loop {
		let current = monitor.exclusive_read32(slot, addr)? as i32;
		if current == value {
			if monitor.exclusive_write32(slot, addr, new_value as u32) {
				return Some(current);
			}
		} else {
			monitor.clear_exclusive(slot);
			return Some(current);
		}
	}
}

/// Wakes up to `count` waiters on `addr` (count <= 0 wakes all). The
/// caller holds the scheduler lock.
fn wake_waiters(kernel: &KernelCore, s: &mut KernelState, addr: u64, count: i32) -> i32 {
	let mut num_waiters = 0;

	let mut it = {
		let KernelState { threads, arbiter_tree, .. } = &mut *s;
		arbiter_tree.lower_bound(&SyncTreeAdapter(threads), &(addr, i32::MIN))
	};
	while let Some(target) = it {
		if s.thread(target).sync_key != addr || (count > 0 && num_waiters >= count) {
			break;
		}

		let next = {
			let KernelState { threads, arbiter_tree, .. } = &mut *s;
			arbiter_tree.next(&SyncTreeAdapter(threads), target)
		};

		wait::end_wait(kernel, s, target, Ok(()));

		debug_assert_eq!(s.thread(target).sync_tree, Some(SyncTreeKind::Arbiter));
		{
			let KernelState { threads, arbiter_tree, .. } = &mut *s;
			arbiter_tree.remove(&mut SyncTreeAdapter(threads), target);
		}
		s.thread_mut(target).sync_tree = None;

		it = next;
		num_waiters += 1;
	}

	num_waiters
}

/// Counts waiters on `addr` beyond the iterator start, up to `count`.
fn count_waiters_at(s: &mut KernelState, addr: u64, count: i32) -> i32 {
	let mut counted = 0;
	let mut it = {
		let KernelState { threads, arbiter_tree, .. } = &mut *s;
		arbiter_tree.lower_bound(&SyncTreeAdapter(threads), &(addr, i32::MIN))
	};
	while let Some(target) = it {
		if s.thread(target).sync_key != addr || counted > count {
			break;
		}
		counted += 1;
		it = {
			let KernelState { threads, arbiter_tree, .. } = &mut *s;
			arbiter_tree.next(&SyncTreeAdapter(threads), target)
		};
	}
	counted
}

pub(crate) fn signal(kernel: &KernelCore, addr: u64, count: i32) -> SvcResult {
	let mut guard = kernel.lock_scheduler();
	wake_waiters(kernel, guard.state(), addr, count);
	Ok(())
}

pub(crate) fn signal_and_increment_if_equal(
	kernel: &KernelCore,
	addr: u64,
	value: i32,
	count: i32,
) -> SvcResult {
	let mut guard = kernel.lock_scheduler();
	let s = guard.state();

	let user_value =
		update_if_equal(kernel, addr, value, value.wrapping_add(1)).ok_or(SvcError::InvalidCurrentMemory)?;
	if user_value != value {
		return Err(SvcError::InvalidState);
	}

	wake_waiters(kernel, s, addr, count);
	Ok(())
}

pub(crate) fn signal_and_modify_by_waiting_count_if_equal(
	kernel: &KernelCore,
	addr: u64,
	value: i32,
	count: i32,
) -> SvcResult {
	let mut guard = kernel.lock_scheduler();
	let s = guard.state();

	// The new value depends on how many waiters remain relative to the
	// wake count.
	let waiting = count_waiters_at(s, addr, count.max(0));
	let new_value = if count <= 0 {
		if waiting > 0 {
			value.wrapping_sub(2)
		} else {
			value.wrapping_add(1)
		}
	} else if waiting > 0 {
		if waiting <= count {
			value.wrapping_sub(1)
		} else {
			value
		}
	} else {
		value.wrapping_add(1)
	};

	let user_value = if new_value != value {
		update_if_equal(kernel, addr, value, new_value)
	} else {
		read_from_user(kernel, addr)
	}
	.ok_or(SvcError::InvalidCurrentMemory)?;
	if user_value != value {
		return Err(SvcError::InvalidState);
	}

	wake_waiters(kernel, s, addr, count);
	Ok(())
}

/// Waits while `*addr < value`, optionally decrementing the word first.
pub(crate) fn wait_if_less_than(
	kernel: &KernelCore,
	addr: u64,
	value: i32,
	decrement: bool,
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

		let user_value = if decrement {
			decrement_if_less_than(kernel, addr, value)
		} else {
			read_from_user(kernel, addr)
		};
		let Some(user_value) = user_value else {
			slp.cancel_sleep();
			return Err(SvcError::InvalidCurrentMemory);
		};

		if user_value >= value {
			slp.cancel_sleep();
			return Err(SvcError::InvalidState);
		}

		if timeout == 0 {
			slp.cancel_sleep();
			return Err(SvcError::TimedOut);
		}

		insert_waiter(kernel, &mut slp, tid, addr)?;
	}

	kernel.current_thread_shared().load_wait_result()
}

/// Waits while `*addr == value`.
pub(crate) fn wait_if_equal(kernel: &KernelCore, addr: u64, value: i32, timeout: i64) -> SvcResult {
	let tid = kernel.current_thread_id();

	{
		let mut slp = SchedulerLockAndSleep::new(kernel, tid, timeout);
		let s = slp.state();

		if s.thread(tid).shared.is_termination_requested() {
			slp.cancel_sleep();
			return Err(SvcError::TerminationRequested);
		}

		let Some(user_value) = read_from_user(kernel, addr) else {
			slp.cancel_sleep();
			return Err(SvcError::InvalidCurrentMemory);
		};

		if user_value != value {
			slp.cancel_sleep();
			return Err(SvcError::InvalidState);
		}

		if timeout == 0 {
			slp.cancel_sleep();
			return Err(SvcError::TimedOut);
		}

		insert_waiter(kernel, &mut slp, tid, addr)?;
	}

	kernel.current_thread_shared().load_wait_result()
}

fn insert_waiter(
	kernel: &KernelCore,
	slp: &mut SchedulerLockAndSleep<'_>,
	tid: ThreadId,
	addr: u64,
) -> SvcResult {
	let with_timer = slp.timer_will_arm();
	let s = slp.state();

	s.thread_mut(tid).sync_key = addr;
	s.thread_mut(tid).sync_tree = Some(SyncTreeKind::Arbiter);
	{
		let KernelState { threads, arbiter_tree, .. } = &mut *s;
		arbiter_tree.insert(&mut SyncTreeAdapter(threads), tid);
	}

	thread::begin_wait(kernel, s, tid, WaitQueue::arbiter(with_timer));
	Ok(())
}
