//! Ready queues: per priority level and per core, a circular intrusive
//! list of threads, doubled into a scheduled side (the thread's active
//! core) and a suggested side (every other core in its affinity mask).
//! A 64-bit bitmap per core tracks the non-empty priority levels, so the
//! front of a core's queue is a trailing-zeros scan away.
//!
//! Dummy threads back host callers and must never be chosen by a core;
//! every mutator silently skips them.

use crossbeam_utils::CachePadded;

use super::thread::{AffinityMask, ThreadId, ThreadMap};
use crate::config::{LOWEST_THREAD_PRIORITY, NUM_CPU_CORES, NUM_PRIORITIES};

#[derive(Debug, Default, Clone, Copy)]
struct QueueRoot {
	first: Option<ThreadId>,
	last: Option<ThreadId>,
}

/// One of the two queue sides (scheduled or suggested).
struct QueueSide {
	roots: Box<[QueueRoot]>,
	available_priorities: [CachePadded<u64>; NUM_CPU_CORES],
}

impl QueueSide {
	fn new() -> Self {
		Self {
			roots: vec![QueueRoot::default(); NUM_PRIORITIES * NUM_CPU_CORES].into_boxed_slice(),
			available_priorities: Default::default(),
		}
	}

	fn root(&self, priority: i32, core: usize) -> &QueueRoot {
		&self.roots[priority as usize * NUM_CPU_CORES + core]
	}

	fn root_mut(&mut self, priority: i32, core: usize) -> &mut QueueRoot {
		&mut self.roots[priority as usize * NUM_CPU_CORES + core]
	}

	fn push_back(&mut self, threads: &mut ThreadMap, priority: i32, core: usize, tid: ThreadId) {
		if priority > LOWEST_THREAD_PRIORITY {
			return;
		}

		let tail = self.root(priority, core).last;
		{
			let link = &mut threads.get_mut(&tid).unwrap().queue_links[core];
			link.prev = tail;
			link.next = None;
		}
		match tail {
			Some(tail) => threads.get_mut(&tail).unwrap().queue_links[core].next = Some(tid),
			None => {
				self.root_mut(priority, core).first = Some(tid);
				*self.available_priorities[core] |= 1 << priority;
			}
		}
		self.root_mut(priority, core).last = Some(tid);
	}

	fn push_front(&mut self, threads: &mut ThreadMap, priority: i32, core: usize, tid: ThreadId) {
		if priority > LOWEST_THREAD_PRIORITY {
			return;
		}

		let head = self.root(priority, core).first;
		{
			let link = &mut threads.get_mut(&tid).unwrap().queue_links[core];
			link.prev = None;
			link.next = head;
		}
		match head {
			Some(head) => threads.get_mut(&head).unwrap().queue_links[core].prev = Some(tid),
			None => {
				self.root_mut(priority, core).last = Some(tid);
				*self.available_priorities[core] |= 1 << priority;
			}
		}
		self.root_mut(priority, core).first = Some(tid);
	}

	fn remove(&mut self, threads: &mut ThreadMap, priority: i32, core: usize, tid: ThreadId) {
		if priority > LOWEST_THREAD_PRIORITY {
			return;
		}

		let link = threads[&tid].queue_links[core];
		match link.prev {
			Some(prev) => threads.get_mut(&prev).unwrap().queue_links[core].next = link.next,
			None => self.root_mut(priority, core).first = link.next,
		}
		match link.next {
			Some(next) => threads.get_mut(&next).unwrap().queue_links[core].prev = link.prev,
			None => self.root_mut(priority, core).last = link.prev,
		}
		threads.get_mut(&tid).unwrap().queue_links[core] = Default::default();

		if self.root(priority, core).first.is_none() {
			*self.available_priorities[core] &= !(1 << priority);
		}
	}

	/// Head of the highest non-empty priority level on `core`.
	fn front(&self, core: usize) -> Option<ThreadId> {
		let priority = self.available_priorities[core].trailing_zeros() as i32;
		if priority <= LOWEST_THREAD_PRIORITY {
			self.root(priority, core).first
		} else {
			None
		}
	}

	fn front_at(&self, priority: i32, core: usize) -> Option<ThreadId> {
		if priority <= LOWEST_THREAD_PRIORITY {
			self.root(priority, core).first
		} else {
			None
		}
	}

	/// Next thread after `tid` on `core`, descending through priority
	/// levels when the current one is exhausted.
	fn next(&self, threads: &ThreadMap, core: usize, tid: ThreadId) -> Option<ThreadId> {
		if let Some(next) = threads[&tid].queue_links[core].next {
			return Some(next);
		}

		let above = threads[&tid].priority + 1;
		let mask = if above >= 64 {
			0
		} else {
			*self.available_priorities[core] & !((1u64 << above) - 1)
		};
		let priority = mask.trailing_zeros() as i32;
		if priority <= LOWEST_THREAD_PRIORITY {
			self.root(priority, core).first
		} else {
			None
		}
	}

	fn move_to_back(
		&mut self,
		threads: &mut ThreadMap,
		priority: i32,
		core: usize,
		tid: ThreadId,
	) -> Option<ThreadId> {
		if priority > LOWEST_THREAD_PRIORITY {
			return None;
		}
		self.remove(threads, priority, core, tid);
		self.push_back(threads, priority, core, tid);
		self.root(priority, core).first
	}
}

pub(crate) struct PriorityQueue {
	scheduled: QueueSide,
	suggested: QueueSide,
}

impl PriorityQueue {
	pub fn new() -> Self {
		Self {
			scheduled: QueueSide::new(),
			suggested: QueueSide::new(),
		}
	}

	fn other_cores(mask: AffinityMask, active_core: i32) -> impl Iterator<Item = usize> {
		let mut bits = mask.raw();
		if active_core >= 0 {
			bits &= !(1 << active_core);
		}
		std::iter::from_fn(move || {
			if bits == 0 {
				return None;
			}
			let core = bits.trailing_zeros() as usize;
			bits &= bits - 1;
			Some(core)
		})
	}

	fn push_back_at(&mut self, threads: &mut ThreadMap, priority: i32, tid: ThreadId) {
		let (mask, core) = {
			let t = &threads[&tid];
			(t.affinity_mask, t.active_core)
		};
		if core >= 0 {
			self.scheduled.push_back(threads, priority, core as usize, tid);
		}
		for other in Self::other_cores(mask, core) {
			self.suggested.push_back(threads, priority, other, tid);
		}
	}

	fn push_front_at(&mut self, threads: &mut ThreadMap, priority: i32, tid: ThreadId) {
		let (mask, core) = {
			let t = &threads[&tid];
			(t.affinity_mask, t.active_core)
		};
		if core >= 0 {
			self.scheduled.push_front(threads, priority, core as usize, tid);
		}
		// Suggestions always go to the back.
		for other in Self::other_cores(mask, core) {
			self.suggested.push_back(threads, priority, other, tid);
		}
	}

	fn remove_at(&mut self, threads: &mut ThreadMap, priority: i32, tid: ThreadId) {
		let (mask, core) = {
			let t = &threads[&tid];
			(t.affinity_mask, t.active_core)
		};
		if core >= 0 {
			self.scheduled.remove(threads, priority, core as usize, tid);
		}
		for other in Self::other_cores(mask, core) {
			self.suggested.remove(threads, priority, other, tid);
		}
	}

	pub fn push_back(&mut self, threads: &mut ThreadMap, tid: ThreadId) {
		if threads[&tid].is_dummy() {
			return;
		}
		let priority = threads[&tid].priority;
		self.push_back_at(threads, priority, tid);
	}

	pub fn remove(&mut self, threads: &mut ThreadMap, tid: ThreadId) {
		if threads[&tid].is_dummy() {
			return;
		}
		let priority = threads[&tid].priority;
		self.remove_at(threads, priority, tid);
	}

	pub fn scheduled_front(&self, core: usize) -> Option<ThreadId> {
		self.scheduled.front(core)
	}

	pub fn scheduled_front_at(&self, core: usize, priority: i32) -> Option<ThreadId> {
		self.scheduled.front_at(priority, core)
	}

	pub fn suggested_front(&self, core: usize) -> Option<ThreadId> {
		self.suggested.front(core)
	}

	pub fn suggested_front_at(&self, core: usize, priority: i32) -> Option<ThreadId> {
		self.suggested.front_at(priority, core)
	}

	pub fn scheduled_next(&self, threads: &ThreadMap, core: usize, tid: ThreadId) -> Option<ThreadId> {
		self.scheduled.next(threads, core, tid)
	}

	pub fn suggested_next(&self, threads: &ThreadMap, core: usize, tid: ThreadId) -> Option<ThreadId> {
		self.suggested.next(threads, core, tid)
	}

	/// Next thread in the same (priority, core) cell only.
	pub fn same_priority_next(&self, threads: &ThreadMap, core: usize, tid: ThreadId) -> Option<ThreadId> {
		threads[&tid].queue_links[core].next
	}

	/// Rotates `tid` to the back of its cell; returns the new front.
	pub fn move_to_scheduled_back(&mut self, threads: &mut ThreadMap, tid: ThreadId) -> Option<ThreadId> {
		if threads[&tid].is_dummy() {
			return None;
		}
		let (priority, core) = {
			let t = &threads[&tid];
			(t.priority, t.active_core)
		};
		self.scheduled
			.move_to_back(threads, priority, core as usize, tid)
	}

	/// Requeues after a priority change. A running thread goes to the front
	/// of its new level so it keeps the core.
	pub fn change_priority(
		&mut self,
		threads: &mut ThreadMap,
		old_priority: i32,
		is_running: bool,
		tid: ThreadId,
	) {
		if threads[&tid].is_dummy() {
			return;
		}
		self.remove_at(threads, old_priority, tid);

		let priority = threads[&tid].priority;
		if is_running {
			self.push_front_at(threads, priority, tid);
		} else {
			self.push_back_at(threads, priority, tid);
		}
	}

	/// Requeues after an affinity-mask change: out of every queue the old
	/// mask put it in, into every queue the new one does.
	pub fn change_affinity_mask(
		&mut self,
		threads: &mut ThreadMap,
		old_core: i32,
		old_mask: AffinityMask,
		tid: ThreadId,
	) {
		if threads[&tid].is_dummy() {
			return;
		}

		let (priority, new_mask, new_core) = {
			let t = &threads[&tid];
			(t.priority, t.affinity_mask, t.active_core)
		};

		for core in 0..NUM_CPU_CORES {
			if old_mask.get(core as i32) {
				if core as i32 == old_core {
					self.scheduled.remove(threads, priority, core, tid);
				} else {
					self.suggested.remove(threads, priority, core, tid);
				}
			}
		}

		for core in 0..NUM_CPU_CORES {
			if new_mask.get(core as i32) {
				if core as i32 == new_core {
					self.scheduled.push_back(threads, priority, core, tid);
				} else {
					self.suggested.push_back(threads, priority, core, tid);
				}
			}
		}
	}

	/// Migrates a thread whose active core changed: the new core's
	/// suggestion becomes a scheduled entry and the old core keeps it as a
	/// suggestion.
	pub fn change_core(&mut self, threads: &mut ThreadMap, prev_core: i32, tid: ThreadId, to_front: bool) {
		if threads[&tid].is_dummy() {
			return;
		}

		let (priority, new_core) = {
			let t = &threads[&tid];
			(t.priority, t.active_core)
		};
		if prev_core == new_core {
			return;
		}

		if prev_core >= 0 {
			self.scheduled.remove(threads, priority, prev_core as usize, tid);
		}
		if new_core >= 0 {
			self.suggested.remove(threads, priority, new_core as usize, tid);
			if to_front {
				self.scheduled.push_front(threads, priority, new_core as usize, tid);
			} else {
				self.scheduled.push_back(threads, priority, new_core as usize, tid);
			}
		}
		if prev_core >= 0 {
			self.suggested.push_back(threads, priority, prev_core as usize, tid);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::scheduler::thread::{new_thread_map, Thread, ThreadKind, ThreadShared};

	fn make_thread(threads: &mut ThreadMap, raw_id: u64, priority: i32, core: i32, mask: u64) -> ThreadId {
		let id = ThreadId::new(raw_id);
		let shared = Arc::new(ThreadShared::new(id, ThreadKind::User, 0, core));
		threads.insert(
			id,
			Thread::new(shared, priority, core, AffinityMask::from_raw(mask)),
		);
		id
	}

	#[test]
	fn front_follows_priority_and_insertion_order() {
		let mut threads = new_thread_map();
		let mut queue = PriorityQueue::new();

		let low_a = make_thread(&mut threads, 1, 44, 0, 0b0001);
		let low_b = make_thread(&mut threads, 2, 44, 0, 0b0001);
		let high = make_thread(&mut threads, 3, 10, 0, 0b0001);

		queue.push_back(&mut threads, low_a);
		queue.push_back(&mut threads, low_b);
		queue.push_back(&mut threads, high);

		assert_eq!(queue.scheduled_front(0), Some(high));
		queue.remove(&mut threads, high);
		assert_eq!(queue.scheduled_front(0), Some(low_a));
		assert_eq!(queue.scheduled_next(&threads, 0, low_a), Some(low_b));
	}

	#[test]
	fn affinity_places_suggestions_on_other_cores() {
		let mut threads = new_thread_map();
		let mut queue = PriorityQueue::new();

		let t = make_thread(&mut threads, 1, 30, 0, 0b0111);
		queue.push_back(&mut threads, t);

		assert_eq!(queue.scheduled_front(0), Some(t));
		assert_eq!(queue.suggested_front(1), Some(t));
		assert_eq!(queue.suggested_front(2), Some(t));
		assert_eq!(queue.suggested_front(3), None);

		queue.remove(&mut threads, t);
		for core in 0..NUM_CPU_CORES {
			assert_eq!(queue.scheduled_front(core), None);
			assert_eq!(queue.suggested_front(core), None);
		}
	}

	#[test]
	fn change_core_swaps_scheduled_and_suggested() {
		let mut threads = new_thread_map();
		let mut queue = PriorityQueue::new();

		let t = make_thread(&mut threads, 1, 30, 0, 0b0011);
		queue.push_back(&mut threads, t);

		threads.get_mut(&t).unwrap().active_core = 1;
		queue.change_core(&mut threads, 0, t, false);

		assert_eq!(queue.scheduled_front(1), Some(t));
		assert_eq!(queue.suggested_front(0), Some(t));
		assert_eq!(queue.scheduled_front(0), None);
		assert_eq!(queue.suggested_front(1), None);
	}

	#[test]
	fn move_to_back_rotates_equal_priority_threads() {
		let mut threads = new_thread_map();
		let mut queue = PriorityQueue::new();

		let t1 = make_thread(&mut threads, 1, 44, 0, 0b0001);
		let t2 = make_thread(&mut threads, 2, 44, 0, 0b0001);
		let t3 = make_thread(&mut threads, 3, 44, 0, 0b0001);
		for t in [t1, t2, t3] {
			queue.push_back(&mut threads, t);
		}

		assert_eq!(queue.move_to_scheduled_back(&mut threads, t1), Some(t2));
		assert_eq!(queue.scheduled_front(0), Some(t2));
		assert_eq!(queue.scheduled_next(&threads, 0, t2), Some(t3));
		assert_eq!(queue.scheduled_next(&threads, 0, t3), Some(t1));
	}

	#[test]
	fn dummy_threads_never_enter_the_queue() {
		let mut threads = new_thread_map();
		let mut queue = PriorityQueue::new();

		let id = ThreadId::new(9);
		let shared = Arc::new(ThreadShared::new(id, ThreadKind::Dummy, 0, 0));
		threads.insert(
			id,
			Thread::new(shared, 63, 0, AffinityMask::from_raw(0b1111)),
		);

		queue.push_back(&mut threads, id);
		for core in 0..NUM_CPU_CORES {
			assert_eq!(queue.scheduled_front(core), None);
			assert_eq!(queue.suggested_front(core), None);
		}
	}

	#[test]
	fn change_priority_runs_running_thread_first() {
		let mut threads = new_thread_map();
		let mut queue = PriorityQueue::new();

		let t1 = make_thread(&mut threads, 1, 30, 0, 0b0001);
		let t2 = make_thread(&mut threads, 2, 30, 0, 0b0001);
		queue.push_back(&mut threads, t1);
		queue.push_back(&mut threads, t2);

		// t2 is boosted to t1's level while "running": it must come first.
		threads.get_mut(&t2).unwrap().priority = 20;
		queue.change_priority(&mut threads, 30, true, t2);
		assert_eq!(queue.scheduled_front(0), Some(t2));

		threads.get_mut(&t2).unwrap().priority = 30;
		queue.change_priority(&mut threads, 20, true, t2);
		assert_eq!(queue.scheduled_front(0), Some(t2));
		assert_eq!(queue.scheduled_next(&threads, 0, t2), Some(t1));
	}
}
