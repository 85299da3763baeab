//! The hardware timer: an ordered tree of sleeping threads keyed by
//! absolute wake tick, driven by one host timer event that is reprogrammed
//! whenever the minimum changes. Tasks fire under the scheduler lock; a
//! thread's expiry cancels its wait with `TimedOut`.

use crate::collections::rbtree::RbTree;
use crate::kernel::{KernelCore, KernelState};
use crate::scheduler::thread::{self, ThreadId, TimerTreeAdapter};
use crate::time::TimerSource;

pub(crate) struct HardwareTimerState {
	tree: RbTree<ThreadId>,
	/// Cached minimum so the drain loop does not re-search the tree.
	next_task: Option<ThreadId>,
}

impl HardwareTimerState {
	pub fn new() -> Self {
		Self {
			tree: RbTree::new(),
			next_task: None,
		}
	}
}

/// Schedules `tid` to fire at the absolute tick `time` (> 0) and
/// reprograms the host timer if it became the earliest task.
pub(crate) fn register_absolute_task(
	kernel: &KernelCore,
	s: &mut KernelState,
	tid: ThreadId,
	time: i64,
) {
	debug_assert!(time > 0);
	debug_assert!(s.thread(tid).wake_time == 0);

	let KernelState { threads, timer, .. } = &mut *s;
	let mut adapter = TimerTreeAdapter(threads);
	adapter.0.get_mut(&tid).unwrap().wake_time = time;
	timer.tree.insert(&mut adapter, tid);

	match timer.next_task {
		Some(current) if adapter.0[&current].wake_time <= time => {}
		_ => {
			timer.next_task = Some(tid);
			kernel
				.host_timer()
				.set_oneshot(TimerSource::Wakeup, Some(time));
		}
	}
}

/// Removes a pending task; a no-op when the task is not scheduled. The
/// host timer is left programmed and may fire spuriously.
pub(crate) fn cancel_task(s: &mut KernelState, tid: ThreadId) {
	if s.thread(tid).wake_time > 0 {
		remove_task(s, tid);
	}
}

fn remove_task(s: &mut KernelState, tid: ThreadId) {
	let KernelState { threads, timer, .. } = &mut *s;
	let mut adapter = TimerTreeAdapter(threads);

	let successor = timer.tree.next(&adapter, tid);
	timer.tree.remove(&mut adapter, tid);
	adapter.0.get_mut(&tid).unwrap().wake_time = 0;

	if timer.next_task == Some(tid) {
		timer.next_task = successor;
	}
}

/// Host timer callback: pops every task whose time has come and fires it,
/// then reprograms the host timer for the new minimum.
pub(crate) fn on_host_timer_interrupt(kernel: &KernelCore) {
	let mut guard = kernel.lock_scheduler();
	let s = guard.state();

	let now = kernel.tick_source().now_ns();
	while let Some(task) = s.timer.next_task {
		let time = s.thread(task).wake_time;
		if time > now {
			break;
		}
		remove_task(s, task);
		thread::on_timer(kernel, s, task);
	}

	if let Some(task) = s.timer.next_task {
		let time = s.thread(task).wake_time;
		kernel
			.host_timer()
			.set_oneshot(TimerSource::Wakeup, Some(time));
	}
}
