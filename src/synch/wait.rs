//! Wait queues and the generic object wait.
//!
//! A waiting thread carries a [`WaitQueue`] describing what it waits on;
//! ending or cancelling the wait dispatches on that queue so each
//! primitive can unhook the thread from its bookkeeping (arbiter tree,
//! condvar tree, lock waiter tree, object wait lists) before the thread
//! goes Runnable again.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use hermit_sync::SpinMutex;
use smallvec::SmallVec;

use crate::config::ARGUMENT_HANDLE_COUNT_MAX;
use crate::kernel::{KernelCore, KernelState};
use crate::result::{SvcError, SvcResult};
use crate::scheduler::thread::{self, SyncTreeKind, ThreadId, ThreadState};
use crate::scheduler::{timer, SchedulerLockAndSleep};
use crate::synch::event::EventId;

/// A waitable kernel object, as referenced from a synchronization wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitObject {
	Event(EventId),
	Thread(ThreadId),
}

#[derive(Clone)]
pub(crate) enum WaitKind {
	/// Plain timed sleep; nothing to unhook.
	Sleep,
	/// Waiting in the address arbiter tree.
	Arbiter,
	/// Waiting in the condition variable tree (and possibly on the lock
	/// owner after a signal handed the mutex over).
	CondvarWait,
	/// Waiting on the owner of a user mutex (ArbitrateLock).
	LockOwner,
	/// Waiting on the owner of a kernel light lock.
	LightLock,
	/// Waiting on a light condition variable's wait list.
	LightCondvar {
		wait_list: Arc<SpinMutex<Vec<ThreadId>>>,
		allow_terminating: bool,
	},
	/// Waiting for one of several objects to signal.
	Sync {
		objects: SmallVec<[WaitObject; 4]>,
	},
	/// Waiting for another thread to become unpinned.
	Pinned { owner: ThreadId },
}

#[derive(Clone)]
pub(crate) struct WaitQueue {
	kind: WaitKind,
	with_timer: bool,
}

impl WaitQueue {
	pub fn sleep(with_timer: bool) -> Self {
		Self {
			kind: WaitKind::Sleep,
			with_timer,
		}
	}

	pub fn arbiter(with_timer: bool) -> Self {
		Self {
			kind: WaitKind::Arbiter,
			with_timer,
		}
	}

	pub fn condvar_wait(with_timer: bool) -> Self {
		Self {
			kind: WaitKind::CondvarWait,
			with_timer,
		}
	}

	pub fn lock_owner() -> Self {
		Self {
			kind: WaitKind::LockOwner,
			with_timer: false,
		}
	}

	pub fn light_lock() -> Self {
		Self {
			kind: WaitKind::LightLock,
			with_timer: false,
		}
	}

	pub fn light_condvar(
		wait_list: Arc<SpinMutex<Vec<ThreadId>>>,
		allow_terminating: bool,
		with_timer: bool,
	) -> Self {
		Self {
			kind: WaitKind::LightCondvar {
				wait_list,
				allow_terminating,
			},
			with_timer,
		}
	}

	pub fn sync(objects: SmallVec<[WaitObject; 4]>, with_timer: bool) -> Self {
		Self {
			kind: WaitKind::Sync { objects },
			with_timer,
		}
	}

	pub fn pinned(owner: ThreadId) -> Self {
		Self {
			kind: WaitKind::Pinned { owner },
			with_timer: false,
		}
	}
}

/// Sets the result, flips the thread Runnable, clears its wait queue and
/// cancels the timer task.
fn finish_wait(
	kernel: &KernelCore,
	s: &mut KernelState,
	tid: ThreadId,
	result: SvcResult,
	cancel_timer: bool,
) {
	s.thread(tid).shared.store_wait_result(result);
	thread::set_thread_state(kernel, s, tid, ThreadState::Runnable);

	let queue = s.thread_mut(tid).wait_queue.take();
	if cancel_timer && queue.is_some_and(|q| q.with_timer) {
		timer::cancel_task(s, tid);
	}
}

fn unlink_from_object(s: &mut KernelState, object: WaitObject, tid: ThreadId) {
	match object {
		WaitObject::Event(event) => {
			s.events.get_mut(event).waiters.retain(|&mut w| w != tid);
		}
		WaitObject::Thread(target) => {
			s.thread_mut(target).object_waiters.retain(|&mut w| w != tid);
		}
	}
}

/// Completes a wait successfully-or-not on behalf of a waker.
pub(crate) fn end_wait(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId, result: SvcResult) {
	if s.thread(tid).state() != ThreadState::Waiting {
		return;
	}

	let queue = s.thread(tid).wait_queue.clone().expect("waiting without a queue");
	debug_assert!(
		!matches!(queue.kind, WaitKind::Sleep | WaitKind::Sync { .. }),
		"EndWait on a queue that is only cancelled"
	);

	finish_wait(kernel, s, tid, result, true);
}

/// Aborts a wait (timeout, termination, explicit cancel), unhooking the
/// thread from whatever it was queued on.
pub(crate) fn cancel_wait(
	kernel: &KernelCore,
	s: &mut KernelState,
	tid: ThreadId,
	result: SvcResult,
	cancel_timer_task: bool,
) {
	if s.thread(tid).state() != ThreadState::Waiting {
		return;
	}

	let queue = s.thread(tid).wait_queue.clone().expect("waiting without a queue");
	match &queue.kind {
		WaitKind::Sleep => {}
		WaitKind::Arbiter => {
			if s.thread(tid).sync_tree == Some(SyncTreeKind::Arbiter) {
				remove_from_sync_tree(s, tid);
			}
		}
		WaitKind::CondvarWait => {
			if let Some(lock) = s.thread(tid).waiting_lock {
				let owner = s.lock_infos.get(lock).owner;
				thread::remove_waiter(kernel, s, owner, tid);
			}
			if s.thread(tid).sync_tree == Some(SyncTreeKind::Condvar) {
				remove_from_sync_tree(s, tid);
			}
		}
		WaitKind::LockOwner | WaitKind::LightLock => {
			if let Some(lock) = s.thread(tid).waiting_lock {
				let owner = s.lock_infos.get(lock).owner;
				thread::remove_waiter(kernel, s, owner, tid);
			}
		}
		WaitKind::LightCondvar {
			wait_list,
			allow_terminating,
		} => {
			// A terminating thread is allowed to keep waiting here.
			if *allow_terminating && result == Err(SvcError::TerminationRequested) {
				return;
			}
			wait_list.lock().retain(|&w| w != tid);
		}
		WaitKind::Sync { objects } => {
			for &object in objects.iter() {
				unlink_from_object(s, object, tid);
			}
			s.thread_mut(tid).cancellable = false;
		}
		WaitKind::Pinned { owner } => {
			s.thread_mut(*owner).pinned_waiters.retain(|&mut w| w != tid);
		}
	}

	finish_wait(kernel, s, tid, result, cancel_timer_task);
}

fn remove_from_sync_tree(s: &mut KernelState, tid: ThreadId) {
	let kind = s.thread(tid).sync_tree.expect("thread not in a sync tree");
	let KernelState {
		threads,
		arbiter_tree,
		condvar_tree,
		..
	} = &mut *s;
	let tree = match kind {
		SyncTreeKind::Arbiter => arbiter_tree,
		SyncTreeKind::Condvar => condvar_tree,
	};
	tree.remove(&mut thread::SyncTreeAdapter(threads), tid);
	s.thread_mut(tid).sync_tree = None;
}

/// An object became signaled: wake `tid` if it still waits on it.
pub(crate) fn notify_available(
	kernel: &KernelCore,
	s: &mut KernelState,
	tid: ThreadId,
	object: WaitObject,
	result: SvcResult,
) {
	if s.thread(tid).state() != ThreadState::Waiting {
		return;
	}

	let queue = s.thread(tid).wait_queue.clone().expect("waiting without a queue");
	let WaitKind::Sync { objects } = &queue.kind else {
		unreachable!("object notification for a non-synchronization wait");
	};

	let index = objects
		.iter()
		.position(|&o| o == object)
		.expect("notified for an object the thread does not wait on");
	for &object in objects.iter() {
		unlink_from_object(s, object, tid);
	}

	s.thread(tid)
		.shared
		.synced_index
		.store(index as i32, Ordering::SeqCst);
	s.thread_mut(tid).cancellable = false;

	finish_wait(kernel, s, tid, result, true);
}

/// Wakes every thread currently linked on `object`.
pub(crate) fn notify_object_waiters(
	kernel: &KernelCore,
	s: &mut KernelState,
	object: WaitObject,
	result: SvcResult,
) {
	let waiters: SmallVec<[ThreadId; 4]> = match object {
		WaitObject::Event(event) => s.events.get(event).waiters.clone(),
		WaitObject::Thread(target) => s.thread(target).object_waiters.clone(),
	};
	for waiter in waiters {
		notify_available(kernel, s, waiter, object, result);
	}
}

fn object_is_signaled(s: &KernelState, object: WaitObject) -> bool {
	match object {
		WaitObject::Event(event) => s.events.get(event).signaled,
		WaitObject::Thread(target) => s.thread(target).signaled,
	}
}

fn link_to_object(s: &mut KernelState, object: WaitObject, tid: ThreadId) {
	match object {
		WaitObject::Event(event) => s.events.get_mut(event).waiters.push(tid),
		WaitObject::Thread(target) => s.thread_mut(target).object_waiters.push(tid),
	}
}

/// Waits for any of `objects` to signal, up to `timeout` (absolute tick;
/// 0 = poll, negative = forever). Returns the index of the signaled
/// object.
pub(crate) fn wait_synchronization(
	kernel: &KernelCore,
	objects: &[WaitObject],
	timeout: i64,
) -> SvcResult<usize> {
	debug_assert!(objects.len() <= ARGUMENT_HANDLE_COUNT_MAX);
	let tid = kernel.current_thread_id();

	{
		let mut slp = SchedulerLockAndSleep::new(kernel, tid, timeout);
		let s = slp.state();

		if s.thread(tid).shared.is_termination_requested() {
			slp.cancel_sleep();
			return Err(SvcError::TerminationRequested);
		}

		// Fast path: one of the objects is already signaled.
		for (index, &object) in objects.iter().enumerate() {
			if object_is_signaled(s, object) {
				slp.cancel_sleep();
				return Ok(index);
			}
		}

		if timeout == 0 {
			slp.cancel_sleep();
			return Err(SvcError::TimedOut);
		}

		if s.thread(tid).wait_cancelled {
			s.thread_mut(tid).wait_cancelled = false;
			slp.cancel_sleep();
			return Err(SvcError::Cancelled);
		}

		for &object in objects {
			link_to_object(s, object, tid);
		}

		s.thread_mut(tid).cancellable = true;
		s.thread(tid).shared.synced_index.store(-1, Ordering::SeqCst);

		let with_timer = slp.timer_will_arm();
		let s = slp.state();
		thread::begin_wait(
			kernel,
			s,
			tid,
			WaitQueue::sync(objects.iter().copied().collect(), with_timer),
		);
	}

	let shared = kernel.current_thread_shared();
	shared.load_wait_result()?;
	let index = shared.synced_index.load(Ordering::SeqCst);
	debug_assert!(index >= 0);
	Ok(index as usize)
}
