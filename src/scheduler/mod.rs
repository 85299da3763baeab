//! The per-core schedulers and the global scheduling algorithm.
//!
//! Each emulated core picks the highest-priority runnable thread from its
//! scheduled queue; the choice is revisited on the final release of the
//! scheduler lock, which also load-balances runnable threads onto idle
//! cores from their suggested queues and interrupts every core whose
//! choice changed. The actual context switch runs on a per-core switcher
//! fiber that owns no guest state of its own.

pub(crate) mod lock;
pub(crate) mod priority_queue;
pub(crate) mod thread;
pub(crate) mod timer;

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::sync::Weak;

use crossbeam_utils::Backoff;
use smallvec::SmallVec;

pub(crate) use lock::{SchedulerGuard, SchedulerLock, SchedulerLockAndSleep};

use crate::config::{
	HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY, NUM_CPU_CORES, PREEMPTION_PRIORITIES,
};
use crate::fiber::Fiber;
use crate::kernel::{KernelCore, KernelState};
use thread::{ThreadId, ThreadKind, ThreadState};

/// Whether the calling context may perform a reschedule right now.
pub(crate) fn can_schedule(kernel: &KernelCore) -> bool {
	kernel.dispatch_disable_count() == 0
}

// Queue maintenance callbacks, invoked under the scheduler lock whenever a
// thread's schedulability changes.

pub(crate) fn on_thread_state_changed(
	kernel: &KernelCore,
	s: &mut KernelState,
	tid: ThreadId,
	old_raw: u16,
) {
	debug_assert!(kernel.scheduler_lock().is_locked_by_current_thread(kernel));

	const RUNNABLE: u16 = ThreadState::Runnable as u16;
	let cur_raw = s.thread(tid).raw_state();
	if cur_raw == old_raw {
		return;
	}

	if old_raw == RUNNABLE {
		let KernelState { threads, queue, .. } = &mut *s;
		queue.remove(threads, tid);
		increment_scheduled_count(kernel, s, tid);
		s.update_needed = true;

		if s.thread(tid).is_dummy() {
			s.woken_dummies.retain(|&woken| woken != tid);
		}
	} else if cur_raw == RUNNABLE {
		let KernelState { threads, queue, .. } = &mut *s;
		queue.push_back(threads, tid);
		increment_scheduled_count(kernel, s, tid);
		s.update_needed = true;

		if s.thread(tid).is_dummy() {
			// Wake the backing host thread once the lock is released.
			s.woken_dummies.push(tid);
		}
	}
}

pub(crate) fn on_thread_priority_changed(
	kernel: &KernelCore,
	s: &mut KernelState,
	tid: ThreadId,
	old_priority: i32,
) {
	debug_assert!(kernel.scheduler_lock().is_locked_by_current_thread(kernel));

	if s.thread(tid).is_runnable() {
		let is_running = tid == kernel.current_thread_id();
		let KernelState { threads, queue, .. } = &mut *s;
		queue.change_priority(threads, old_priority, is_running, tid);
		increment_scheduled_count(kernel, s, tid);
		s.update_needed = true;
	}
}

pub(crate) fn on_thread_affinity_mask_changed(
	kernel: &KernelCore,
	s: &mut KernelState,
	tid: ThreadId,
	old_mask: thread::AffinityMask,
	old_core: i32,
) {
	debug_assert!(kernel.scheduler_lock().is_locked_by_current_thread(kernel));

	if s.thread(tid).is_runnable() {
		let KernelState { threads, queue, .. } = &mut *s;
		queue.change_affinity_mask(threads, old_core, old_mask, tid);
		increment_scheduled_count(kernel, s, tid);
		s.update_needed = true;
	}
}

fn increment_scheduled_count(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) {
	if s.thread(tid).shared.kind == ThreadKind::User {
		kernel.process().increment_scheduled_count();
	}
}

/// Forgets a dying thread as any core's previous thread.
pub(crate) fn clear_previous_thread(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) {
	debug_assert!(kernel.scheduler_lock().is_locked_by_current_thread(kernel));
	let _ = s;
	for core in 0..NUM_CPU_CORES {
		let _ = kernel.core(core).prev_thread.compare_exchange(
			tid.to_raw(),
			0,
			Ordering::SeqCst,
			Ordering::SeqCst,
		);
	}
}

/// Publishes `top` as the core's chosen thread. Returns the core's bit if
/// the choice changed.
fn update_highest_priority_thread(
	kernel: &KernelCore,
	s: &mut KernelState,
	core: usize,
	top: Option<ThreadId>,
) -> u64 {
	let cc = kernel.core(core);
	let prev_raw = cc.highest_priority_thread.load(Ordering::SeqCst);
	let new_raw = top.map_or(0, ThreadId::to_raw);
	if prev_raw == new_raw {
		return 0;
	}

	if let Some(prev) = ThreadId::from_raw(prev_raw) {
		if let Some(prev_thread) = s.threads.get_mut(&prev) {
			prev_thread.last_scheduled_tick = kernel.tick_source().now_ns();
			if prev_thread.shared.kind == ThreadKind::User {
				kernel.process().increment_scheduled_count();
			}
		}
	}

	cc.highest_priority_thread.store(new_raw, Ordering::SeqCst);
	cc.needs_scheduling.store(true, Ordering::SeqCst);
	1 << core
}

/// The scheduler-update algorithm, run at the final scheduler-lock
/// release: recomputes every core's chosen thread, migrates suggestions to
/// idle cores and returns the mask of cores needing a reschedule.
pub(crate) fn update_highest_priority_threads(kernel: &KernelCore, s: &mut KernelState) -> u64 {
	debug_assert!(kernel.scheduler_lock().is_locked_by_current_thread(kernel));

	s.update_needed = false;

	let mut cores_needing_scheduling = 0u64;
	let mut idle_cores = 0u64;
	let mut top_threads: [Option<ThreadId>; NUM_CPU_CORES] = [None; NUM_CPU_CORES];

	for core in 0..NUM_CPU_CORES {
		let mut top = s.queue.scheduled_front(core);
		if let Some(front) = top {
			// The process may have pinned a thread to this core; prefer it
			// over the front unless the front has kernel waiters.
			if let Some(pinned) = s.pinned_threads[core] {
				if pinned != front && s.thread(front).num_kernel_waiters == 0 {
					top = if s.thread(pinned).is_runnable() {
						Some(pinned)
					} else {
						None
					};
				}
			}
		} else {
			idle_cores |= 1 << core;
		}

		top_threads[core] = top;
		cores_needing_scheduling |= update_highest_priority_thread(kernel, s, core, top);
	}

	// Idle cores are bad; try to migrate a suggestion to each in turn.
	while idle_cores != 0 {
		let core = idle_cores.trailing_zeros() as usize;

		let mut migrated = false;
		let mut suggestion = s.queue.suggested_front(core);
		if suggestion.is_some() {
			let mut candidates: SmallVec<[usize; NUM_CPU_CORES]> = SmallVec::new();

			while let Some(suggested) = suggestion {
				let suggested_core = s.thread(suggested).active_core;
				let top_on_core = if suggested_core >= 0 {
					top_threads[suggested_core as usize]
				} else {
					None
				};

				if top_on_core != Some(suggested) {
					// Not chosen on its own core, so it can move, unless a
					// thread of very high priority is involved there.
					if let Some(top) = top_on_core {
						if s.thread(top).priority < HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY {
							break;
						}
					}

					s.thread_mut(suggested).active_core = core as i32;
					{
						let KernelState { threads, queue, .. } = &mut *s;
						queue.change_core(threads, suggested_core, suggested, false);
					}
					top_threads[core] = Some(suggested);
					cores_needing_scheduling |=
						update_highest_priority_thread(kernel, s, core, Some(suggested));
					migrated = true;
					break;
				}

				// Remember its core as a candidate for the second pass.
				candidates.push(suggested_core as usize);
				suggestion = s.queue.suggested_next(&s.threads, core, suggested);
			}

			// No suggestion could move directly: try to pull a candidate
			// core's top thread over here and promote its next in line.
			if !migrated && suggestion.is_none() {
				for &candidate in &candidates {
					let Some(former_top) = top_threads[candidate] else {
						continue;
					};
					if let Some(next_on_candidate) =
						s.queue.scheduled_next(&s.threads, candidate, former_top)
					{
						top_threads[candidate] = Some(next_on_candidate);
						cores_needing_scheduling |= update_highest_priority_thread(
							kernel,
							s,
							candidate,
							Some(next_on_candidate),
						);

						s.thread_mut(former_top).active_core = core as i32;
						{
							let KernelState { threads, queue, .. } = &mut *s;
							queue.change_core(threads, candidate as i32, former_top, false);
						}
						top_threads[core] = Some(former_top);
						cores_needing_scheduling |=
							update_highest_priority_thread(kernel, s, core, Some(former_top));
						break;
					}
				}
			}
		}

		idle_cores &= !(1 << core);
	}

	// Dummy threads made runnable can wake their host threads now.
	let woken: Vec<ThreadId> = s.woken_dummies.drain(..).collect();
	for tid in woken {
		s.thread(tid).shared.dummy_end_wait();
	}

	// A dummy current thread that went to sleep parks its host thread when
	// the lock is released.
	let cur = kernel.current_thread_id();
	if let Some(cur_thread) = s.threads.get(&cur) {
		if cur_thread.is_dummy() && !cur_thread.is_runnable() {
			cur_thread.shared.dummy_request_wait();
		}
	}

	cores_needing_scheduling
}

/// Post-release half of the scheduler-lock protocol: interrupt the other
/// cores in the mask and reschedule (or re-enable dispatch on) the current
/// one.
pub(crate) fn enable_scheduling(kernel: &KernelCore, cores_needing_scheduling: u64) {
	debug_assert!(kernel.dispatch_disable_count() >= 1);

	match kernel.current_scheduler_core() {
		None => {
			// Host (dummy) context: we cannot schedule here. Interrupt
			// every flagged core, then park if a wait was requested.
			reschedule_cores(kernel, cores_needing_scheduling);
			debug_assert_eq!(kernel.dispatch_disable_count(), 1);
			kernel.current_thread_shared().dummy_begin_wait();
			kernel.enable_dispatch();
		}
		Some(core) => {
			reschedule_cores(kernel, cores_needing_scheduling & !(1 << core));
			if kernel.dispatch_disable_count() > 1 {
				kernel.enable_dispatch();
			} else {
				reschedule_current_core(kernel, core);
			}
		}
	}
}

fn reschedule_cores(kernel: &KernelCore, core_mask: u64) {
	crate::kernel::interrupts::send_inter_processor_interrupt(kernel, core_mask);
}

fn reschedule_current_core(kernel: &KernelCore, core: usize) {
	debug_assert_eq!(kernel.dispatch_disable_count(), 1);

	kernel.enable_dispatch();
	if kernel.core(core).needs_scheduling.load(Ordering::SeqCst) {
		kernel.disable_dispatch();
		schedule(kernel, core);
		kernel.enable_dispatch();
	}
}

/// Reschedule request from an interrupt (IPI, timer) on this core.
pub(crate) fn request_schedule_on_interrupt(kernel: &KernelCore, core: usize) {
	kernel.core(core).needs_scheduling.store(true, Ordering::SeqCst);

	if can_schedule(kernel) {
		kernel.disable_dispatch();
		schedule(kernel, core);
		kernel.enable_dispatch();
	}
}

fn schedule(kernel: &KernelCore, core: usize) {
	debug_assert_eq!(kernel.dispatch_disable_count(), 1);
	debug_assert_eq!(kernel.current_core_id(), core as i32);

	schedule_impl(kernel, core);
}

/// Hands the core to the switcher fiber unless the chosen thread is
/// already the current one.
fn schedule_impl(kernel: &KernelCore, core: usize) {
	let cc = kernel.core(core);

	cc.needs_scheduling.store(false, Ordering::Relaxed);
	fence(Ordering::SeqCst);

	let cur = kernel.current_thread_id();
	let highest = ThreadId::from_raw(cc.highest_priority_thread.load(Ordering::SeqCst));

	if highest == Some(cur) {
		fence(Ordering::SeqCst);
		return;
	}

	cc.switch_cur_thread.store(cur.to_raw(), Ordering::SeqCst);
	cc.switch_next_thread
		.store(highest.map_or(0, ThreadId::to_raw), Ordering::SeqCst);
	cc.switch_from_schedule.store(true, Ordering::SeqCst);

	let cur_fiber = kernel.current_thread_shared().fiber().clone();
	let switch_fiber = cc.switch_fiber().clone();
	Fiber::yield_to(&cur_fiber, &switch_fiber);

	// Execution resumes here once this thread is scheduled again.
}

/// Single-core mode: the one host thread hops to the next emulated core by
/// unloading the running thread and entering that core's switcher.
pub(crate) fn preempt_single_core(kernel: &KernelCore, core: usize) {
	kernel.disable_dispatch();

	let cur = kernel.current_thread_id();
	let prev_core = kernel.current_thread_shared().current_core.load(Ordering::SeqCst);
	if prev_core >= 0 {
		unload(kernel, prev_core as usize, cur);
	}

	let cc = kernel.core(core);
	cc.switch_from_schedule.store(false, Ordering::SeqCst);
	let cur_fiber = kernel.current_thread_shared().fiber().clone();
	let switch_fiber = cc.switch_fiber().clone();
	Fiber::yield_to(&cur_fiber, &switch_fiber);

	kernel.enable_dispatch();
}

/// Entry of a core's switcher fiber: loops forever, performing one context
/// switch per activation.
pub(crate) fn switch_fiber_main(kernel: Weak<KernelCore>, core: usize, me: Arc<Fiber>) {
	// Tracks CPU-time accounting across switches.
	let mut last_switch_tick = 0i64;

	loop {
		let Some(kernel) = kernel.upgrade() else {
			return;
		};

		let cc = kernel.core(core);
		let from_schedule = cc.switch_from_schedule.swap(false, Ordering::SeqCst);
		let mut next = ThreadId::from_raw(cc.switch_next_thread.load(Ordering::SeqCst));

		if from_schedule {
			if let Some(cur) = ThreadId::from_raw(cc.switch_cur_thread.load(Ordering::SeqCst)) {
				unload(&kernel, core, cur);
			}
		} else {
			// Entered outside of Schedule (interrupt path or single-core
			// preemption): restart the pick from the published choice.
			cc.needs_scheduling.store(false, Ordering::Relaxed);
			fence(Ordering::SeqCst);
			next = ThreadId::from_raw(cc.highest_priority_thread.load(Ordering::SeqCst));
		}

		// Loop until a context switch sticks.
		let chosen = loop {
			let target = next.unwrap_or_else(|| cc.idle_thread());

			// Take the target's context guard, watching for interference
			// from other cores.
			let backoff = Backoff::new();
			let mut locked = false;
			loop {
				if kernel.thread_shared(target).try_lock_context() {
					locked = true;
					break;
				}
				if cc.needs_scheduling.load(Ordering::SeqCst) {
					break;
				}
				backoff.snooze();
			}

			if locked {
				switch_thread(&kernel, core, target, &mut last_switch_tick);

				if !cc.needs_scheduling.load(Ordering::SeqCst) {
					break target;
				}

				// Our switch failed; release the context and retry.
				kernel.thread_shared(target).unlock_context();
			}

			cc.needs_scheduling.store(false, Ordering::Relaxed);
			fence(Ordering::SeqCst);
			next = ThreadId::from_raw(cc.highest_priority_thread.load(Ordering::SeqCst));
		};

		reload(&kernel, core, chosen);

		let target_fiber = kernel.thread_shared(chosen).fiber().clone();
		drop(kernel);
		Fiber::yield_to(&me, &target_fiber);
	}
}

/// Saves the outgoing thread's guest context and releases its context
/// guard (unless it is being terminated, in which case the guard stays
/// held forever).
fn unload(kernel: &KernelCore, core: usize, tid: ThreadId) {
	let shared = kernel.thread_shared(tid);

	if shared.kind == ThreadKind::User {
		let arm = kernel.process().arm_interface(core);
		arm.get_context(&mut shared.guest_context.lock());
	}

	if shared.dpc_flags.load(Ordering::SeqCst) & thread::DpcFlag::TERMINATED.bits() == 0 {
		shared.unlock_context();
	}
}

fn reload(kernel: &KernelCore, core: usize, tid: ThreadId) {
	let shared = kernel.thread_shared(tid);

	if shared.kind == ThreadKind::User {
		let arm = kernel.process().arm_interface(core);
		arm.set_context(&shared.guest_context.lock());
		arm.set_tpidrro_el0(shared.tls_address);
	}
}

/// Makes `next` the core's current thread, accounting CPU time to the
/// outgoing one.
fn switch_thread(kernel: &KernelCore, core: usize, next: ThreadId, last_switch_tick: &mut i64) {
	let cc = kernel.core(core);
	let next_shared = kernel.thread_shared(next);

	if next_shared.current_core.load(Ordering::SeqCst) != core as i32 {
		next_shared.current_core.store(core as i32, Ordering::SeqCst);
	}

	let cur = ThreadId::from_raw(cc.current_thread.load(Ordering::SeqCst));
	if cur == Some(next) {
		return;
	}

	let now = kernel.tick_source().now_ns();
	let tick_diff = now - *last_switch_tick;
	*last_switch_tick = now;

	if let Some(cur) = cur {
		let cur_shared = kernel.thread_shared(cur);
		cur_shared.cpu_time_ns.fetch_add(tick_diff, Ordering::SeqCst);

		if !cur_shared.is_termination_requested()
			&& cur_shared.current_core.load(Ordering::SeqCst) == core as i32
		{
			cc.prev_thread.store(cur.to_raw(), Ordering::SeqCst);
		} else {
			cc.prev_thread.store(0, Ordering::SeqCst);
		}
	}

	cc.current_thread.store(next.to_raw(), Ordering::SeqCst);
}

/// Rotates the given (core, priority) cell for the preemption tick and
/// tries to fill the core with a suggestion that has waited longer than
/// the new front.
pub(crate) fn rotate_scheduled_queue(
	kernel: &KernelCore,
	s: &mut KernelState,
	core: usize,
	priority: i32,
) {
	debug_assert!(kernel.scheduler_lock().is_locked_by_current_thread(kernel));

	// Move the front of the queue to the end.
	let top_thread = s.queue.scheduled_front_at(core, priority);
	let mut next_thread = None;
	if let Some(top) = top_thread {
		next_thread = {
			let KernelState { threads, queue, .. } = &mut *s;
			queue.move_to_scheduled_back(threads, top)
		};
		if next_thread != top_thread {
			increment_scheduled_count(kernel, s, top);
			if let Some(next) = next_thread {
				increment_scheduled_count(kernel, s, next);
			}
		}
	}

	// While we have a suggested thread at this priority, try to migrate it.
	{
		let mut suggestion = s.queue.suggested_front_at(core, priority);
		while let Some(suggested) = suggestion {
			let suggested_core = s.thread(suggested).active_core;
			let top_on_suggested_core = if suggested_core >= 0 {
				s.queue.scheduled_front(suggested_core as usize)
			} else {
				None
			};

			if top_on_suggested_core != Some(suggested) {
				// Prefer a new front that has been waiting longer than the
				// suggestion.
				if top_thread != next_thread {
					if let Some(next) = next_thread {
						if s.thread(next).last_scheduled_tick
							< s.thread(suggested).last_scheduled_tick
						{
							break;
						}
					}
				}

				// Migration moves the suggestion to the front of the queue.
				let displaceable = match top_on_suggested_core {
					None => true,
					Some(top) => {
						s.thread(top).priority >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY
					}
				};
				if displaceable {
					s.thread_mut(suggested).active_core = core as i32;
					{
						let KernelState { threads, queue, .. } = &mut *s;
						queue.change_core(threads, suggested_core, suggested, true);
					}
					increment_scheduled_count(kernel, s, suggested);
					break;
				}
			}

			suggestion = s.queue.same_priority_next(&s.threads, core, suggested);
		}
	}

	// Having rotated at this priority, check whether a better-priority
	// suggestion can migrate here.
	{
		let mut best_thread = s.queue.scheduled_front(core);
		if best_thread == Some(kernel.current_thread_id()) {
			best_thread = best_thread
				.and_then(|best| s.queue.scheduled_next(&s.threads, core, best));
		}

		let best_is_weak = match best_thread {
			Some(best) => s.thread(best).priority >= priority,
			None => false,
		};
		if best_is_weak {
			let best_priority = s.thread(best_thread.unwrap()).priority;
			let mut suggestion = s.queue.suggested_front(core);
			while let Some(suggested) = suggestion {
				if s.thread(suggested).priority >= best_priority {
					break;
				}

				let suggested_core = s.thread(suggested).active_core;
				let top_on_suggested_core = if suggested_core >= 0 {
					s.queue.scheduled_front(suggested_core as usize)
				} else {
					None
				};

				if top_on_suggested_core != Some(suggested) {
					let displaceable = match top_on_suggested_core {
						None => true,
						Some(top) => {
							s.thread(top).priority >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY
						}
					};
					if displaceable {
						s.thread_mut(suggested).active_core = core as i32;
						{
							let KernelState { threads, queue, .. } = &mut *s;
							queue.change_core(threads, suggested_core, suggested, true);
						}
						increment_scheduled_count(kernel, s, suggested);
						break;
					}
				}

				suggestion = s.queue.suggested_next(&s.threads, core, suggested);
			}
		}
	}

	s.update_needed = true;
}

/// The 10 ms preemption tick: rotate each core at its preemption priority.
pub(crate) fn preempt_threads(kernel: &KernelCore, s: &mut KernelState) {
	debug_assert!(kernel.scheduler_lock().is_locked_by_current_thread(kernel));
	for core in 0..NUM_CPU_CORES {
		rotate_scheduled_queue(kernel, s, core, PREEMPTION_PRIORITIES[core]);
	}
}

// The three cooperative yields, in increasing willingness to migrate.

pub(crate) fn yield_without_core_migration(kernel: &KernelCore) {
	debug_assert!(can_schedule(kernel));

	let cur = kernel.current_thread_id();
	let mut guard = kernel.lock_scheduler();
	let s = guard.state();

	// Nothing has been scheduled since our last yield; don't waste work.
	let scheduled_count = kernel.process().scheduled_count();
	if s.thread(cur).yield_schedule_count == Some(scheduled_count) {
		return;
	}

	if s.thread(cur).is_runnable() {
		let next_thread = {
			let KernelState { threads, queue, .. } = &mut *s;
			queue.move_to_scheduled_back(threads, cur)
		};
		increment_scheduled_count(kernel, s, cur);

		if next_thread != Some(cur) {
			s.update_needed = true;
		} else {
			s.thread_mut(cur).yield_schedule_count = Some(kernel.process().scheduled_count());
		}
	}
}

pub(crate) fn yield_with_core_migration(kernel: &KernelCore) {
	debug_assert!(can_schedule(kernel));

	let cur = kernel.current_thread_id();
	let mut guard = kernel.lock_scheduler();
	let s = guard.state();

	let scheduled_count = kernel.process().scheduled_count();
	if s.thread(cur).yield_schedule_count == Some(scheduled_count) {
		return;
	}

	if s.thread(cur).is_runnable() {
		let core = s.thread(cur).active_core;
		let cur_priority = s.thread(cur).priority;

		let next_thread = {
			let KernelState { threads, queue, .. } = &mut *s;
			queue.move_to_scheduled_back(threads, cur)
		};
		increment_scheduled_count(kernel, s, cur);

		let mut recheck = false;
		let mut suggestion = s.queue.suggested_front(core as usize);
		while let Some(suggested) = suggestion {
			let suggested_core = s.thread(suggested).active_core;
			let running_on_suggested_core = if suggested_core >= 0 {
				ThreadId::from_raw(
					kernel
						.core(suggested_core as usize)
						.highest_priority_thread
						.load(Ordering::SeqCst),
				)
			} else {
				None
			};

			if running_on_suggested_core != Some(suggested) {
				// Prefer our next thread over a lower-priority suggestion,
				// or an equal-priority one that has waited less.
				let suggested_priority = s.thread(suggested).priority;
				let prefer_next = suggested_priority > cur_priority
					|| (suggested_priority == cur_priority
						&& next_thread != Some(cur)
						&& next_thread.is_some_and(|next| {
							s.thread(next).last_scheduled_tick
								< s.thread(suggested).last_scheduled_tick
						}));
				if prefer_next {
					suggestion = None;
					break;
				}

				let displaceable = match running_on_suggested_core {
					None => true,
					Some(running) => {
						s.thread(running).priority >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY
					}
				};
				if displaceable {
					s.thread_mut(suggested).active_core = core;
					{
						let KernelState { threads, queue, .. } = &mut *s;
						queue.change_core(threads, suggested_core, suggested, true);
					}
					increment_scheduled_count(kernel, s, suggested);
					break;
				} else {
					// Couldn't migrate; check again on a future yield.
					recheck = true;
				}
			}

			suggestion = s.queue.suggested_next(&s.threads, core as usize, suggested);
		}

		if suggestion.is_some() || next_thread != Some(cur) {
			s.update_needed = true;
		} else if !recheck {
			s.thread_mut(cur).yield_schedule_count = Some(kernel.process().scheduled_count());
		}
	}
}

pub(crate) fn yield_to_any_thread(kernel: &KernelCore) {
	debug_assert!(can_schedule(kernel));

	let cur = kernel.current_thread_id();
	let mut guard = kernel.lock_scheduler();
	let s = guard.state();

	let scheduled_count = kernel.process().scheduled_count();
	if s.thread(cur).yield_schedule_count == Some(scheduled_count) {
		return;
	}

	if s.thread(cur).is_runnable() {
		let core = s.thread(cur).active_core;

		// Migrate ourselves off any core.
		s.thread_mut(cur).active_core = -1;
		{
			let KernelState { threads, queue, .. } = &mut *s;
			queue.change_core(threads, core, cur, false);
		}
		increment_scheduled_count(kernel, s, cur);

		if s.queue.scheduled_front(core as usize).is_none() {
			let mut suggestion = s.queue.suggested_front(core as usize);
			while let Some(suggested) = suggestion {
				let suggested_core = s.thread(suggested).active_core;
				let top_on_suggested_core = if suggested_core >= 0 {
					s.queue.scheduled_front(suggested_core as usize)
				} else {
					None
				};

				if top_on_suggested_core != Some(suggested) {
					let displaceable = match top_on_suggested_core {
						None => true,
						Some(top) => {
							s.thread(top).priority >= HIGHEST_CORE_MIGRATION_ALLOWED_PRIORITY
						}
					};
					if displaceable {
						s.thread_mut(suggested).active_core = core;
						{
							let KernelState { threads, queue, .. } = &mut *s;
							queue.change_core(threads, suggested_core, suggested, false);
						}
						increment_scheduled_count(kernel, s, suggested);
					}

					// Migrated or not, we had a candidate, so we're done.
					break;
				}

				suggestion = s.queue.suggested_next(&s.threads, core as usize, suggested);
			}

			if suggestion != Some(cur) {
				s.update_needed = true;
			} else {
				s.thread_mut(cur).yield_schedule_count = Some(kernel.process().scheduled_count());
			}
		} else {
			s.update_needed = true;
		}
	}
}
