//! Thread control blocks and the lock-ownership graph.
//!
//! Every thread is split in two records. The scheduler-locked half
//! ([`Thread`]) lives in the kernel state arena and holds everything the
//! scheduling algorithms mutate: state bits, priorities, queue links, tree
//! nodes, the priority-inheritance graph. The shared half
//! ([`ThreadShared`]) is reference counted and holds what other host
//! threads touch without the scheduler lock: the context guard, DPC and
//! termination flags, the saved guest context and the backing fiber.
//!
//! The inheritance graph is expressed with ids: a thread owns a list of
//! [`LockInfo`] entries, each lock info owns a waiter tree of thread ids,
//! and a waiting thread points back at the lock info it blocks on.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use ahash::RandomState;
use hashbrown::HashMap;
use hermit_sync::{OnceCell, SpinMutex};
use smallvec::SmallVec;

use crate::arm::ThreadContext;
use crate::collections::rbtree::{RbAdapter, RbNode, RbTree};
use crate::config::{LOWEST_THREAD_PRIORITY, NUM_CPU_CORES};
use crate::fiber::Fiber;
use crate::kernel::{KernelCore, KernelState};
use crate::result::{SvcError, SvcResult};
use crate::scheduler;
use crate::synch::light_lock::LightLock;
use crate::synch::wait::{self, WaitQueue};

/// Stable 64-bit thread id. Ids are assigned monotonically and never
/// reused; zero is reserved as "no thread" in atomics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
	pub const fn to_raw(self) -> u64 {
		self.0
	}

	pub const fn from_raw(raw: u64) -> Option<Self> {
		if raw == 0 {
			None
		} else {
			Some(Self(raw))
		}
	}

	pub(crate) const fn new(raw: u64) -> Self {
		Self(raw)
	}
}

impl fmt::Display for ThreadId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl fmt::Debug for ThreadId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ThreadId({})", self.0)
	}
}

/// Base scheduling state, stored in the low bits of the raw state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
	Initialized = 0,
	Waiting = 1,
	Runnable = 2,
	Terminated = 3,
}

const STATE_MASK: u16 = 0xF;
const SUSPEND_SHIFT: u16 = 4;

/// Reasons a thread may be held suspended; each contributes one bit above
/// the state mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendType {
	Process = 0,
	Thread = 1,
	Debug = 2,
	Backtrace = 3,
	Init = 4,
	System = 5,
}

const SUSPEND_FLAG_MASK: u16 = ((1 << 6) - 1) << SUSPEND_SHIFT;

const fn suspend_bit(ty: SuspendType) -> u16 {
	1 << (SUSPEND_SHIFT + ty as u16)
}

bitflags! {
	/// Deferred actions the scheduler honors the next time it inspects the
	/// thread.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct DpcFlag: u32 {
		const TERMINATING = 1 << 0;
		const TERMINATED = 1 << 1;
	}
}

/// Single-step control for the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StepState {
	NotStepping = 0,
	StepPending = 1,
	StepPerformed = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
	/// Guest thread owned by the emulated process.
	User,
	/// Per-core idle thread; never enters the ready queues.
	Idle,
	/// Stand-in for a host thread calling into the kernel; skipped by the
	/// ready queues but able to wait.
	Dummy,
}

/// Physical core affinity, at most [`NUM_CPU_CORES`] bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityMask(u64);

impl AffinityMask {
	pub const fn empty() -> Self {
		Self(0)
	}

	pub const fn from_raw(raw: u64) -> Self {
		Self(raw)
	}

	pub const fn single(core: i32) -> Self {
		Self(1 << core)
	}

	pub const fn raw(self) -> u64 {
		self.0
	}

	pub fn get(self, core: i32) -> bool {
		core >= 0 && (self.0 >> core) & 1 != 0
	}

	pub fn highest_set_core(self) -> i32 {
		63 - self.0.leading_zeros() as i32
	}
}

/// Per-core intrusive list links for the ready queues.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct QueueLink {
	pub prev: Option<ThreadId>,
	pub next: Option<ThreadId>,
}

/// Which id-keyed tree the thread's sync node is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncTreeKind {
	Arbiter,
	Condvar,
}

struct DummyPark {
	runnable: Mutex<bool>,
	wakeup: Condvar,
}

/// The half of a thread that is accessed without the scheduler lock.
pub(crate) struct ThreadShared {
	pub id: ThreadId,
	pub kind: ThreadKind,
	pub tls_address: u64,
	pub host_context: OnceCell<Arc<Fiber>>,
	context_guard: AtomicBool,
	pub dpc_flags: AtomicU32,
	pub termination_requested: AtomicBool,
	pub step_state: AtomicU8,
	pub current_core: AtomicI32,
	pub cpu_time_ns: AtomicI64,
	wait_result: AtomicU32,
	pub synced_index: AtomicI32,
	pub open_count: AtomicU32,
	pub guest_context: SpinMutex<ThreadContext>,
	pub activity_pause_lock: LightLock,
	dummy_park: Option<DummyPark>,
}

impl ThreadShared {
	pub fn new(id: ThreadId, kind: ThreadKind, tls_address: u64, initial_core: i32) -> Self {
		Self {
			id,
			kind,
			tls_address,
			host_context: OnceCell::new(),
			context_guard: AtomicBool::new(false),
			dpc_flags: AtomicU32::new(0),
			termination_requested: AtomicBool::new(false),
			step_state: AtomicU8::new(StepState::NotStepping as u8),
			current_core: AtomicI32::new(initial_core),
			cpu_time_ns: AtomicI64::new(0),
			wait_result: AtomicU32::new(0),
			synced_index: AtomicI32::new(-1),
			open_count: AtomicU32::new(1),
			guest_context: SpinMutex::new(ThreadContext::default()),
			activity_pause_lock: LightLock::new(),
			dummy_park: match kind {
				ThreadKind::Dummy => Some(DummyPark {
					runnable: Mutex::new(true),
					wakeup: Condvar::new(),
				}),
				_ => None,
			},
		}
	}

	pub fn is_dummy(&self) -> bool {
		self.kind == ThreadKind::Dummy
	}

	pub fn fiber(&self) -> &Arc<Fiber> {
		self.host_context.get().expect("thread has no fiber")
	}

	/// Held while a host thread executes the guest on this thread's behalf.
	pub fn try_lock_context(&self) -> bool {
		self.context_guard
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
	}

	/// Unlocking an unheld guard is a no-op (the guard of a thread that has
	/// never run yet is unheld when it is first unloaded).
	pub fn unlock_context(&self) {
		self.context_guard.store(false, Ordering::Release);
	}

	pub fn has_dpc(&self) -> bool {
		self.dpc_flags.load(Ordering::SeqCst) != 0
	}

	pub fn register_dpc(&self, flag: DpcFlag) {
		self.dpc_flags.fetch_or(flag.bits(), Ordering::SeqCst);
	}

	pub fn is_termination_requested(&self) -> bool {
		self.termination_requested.load(Ordering::SeqCst)
	}

	pub fn step_state(&self) -> StepState {
		match self.step_state.load(Ordering::SeqCst) {
			1 => StepState::StepPending,
			2 => StepState::StepPerformed,
			_ => StepState::NotStepping,
		}
	}

	pub fn set_step_state(&self, state: StepState) {
		self.step_state.store(state as u8, Ordering::SeqCst);
	}

	pub fn store_wait_result(&self, result: SvcResult) {
		let raw = match result {
			Ok(()) => 0,
			Err(e) => e as u32 + 1,
		};
		self.wait_result.store(raw, Ordering::SeqCst);
	}

	pub fn load_wait_result(&self) -> SvcResult {
		match self.wait_result.load(Ordering::SeqCst) {
			0 => Ok(()),
			raw => Err(SvcError::try_from(raw - 1).expect("corrupt wait result")),
		}
	}

	/// Requested by the scheduler update while the lock is held; the parked
	/// state is consumed by [`ThreadShared::dummy_begin_wait`].
	pub fn dummy_request_wait(&self) {
		let park = self.dummy_park.as_ref().expect("not a dummy thread");
		*park.runnable.lock().unwrap() = false;
	}

	/// Blocks the backing host thread until the dummy thread is runnable
	/// again.
	pub fn dummy_begin_wait(&self) {
		let Some(park) = self.dummy_park.as_ref() else {
			return;
		};
		let mut runnable = park.runnable.lock().unwrap();
		while !*runnable {
			runnable = park.wakeup.wait(runnable).unwrap();
		}
	}

	pub fn dummy_end_wait(&self) {
		let park = self.dummy_park.as_ref().expect("not a dummy thread");
		*park.runnable.lock().unwrap() = true;
		park.wakeup.notify_one();
	}
}

/// The scheduler-locked half of a thread.
pub(crate) struct Thread {
	pub shared: Arc<ThreadShared>,

	raw_state: u16,
	suspend_allowed: u16,
	suspend_request: u16,

	pub base_priority: i32,
	pub priority: i32,
	pub virtual_ideal_core: i32,
	pub physical_ideal_core: i32,
	pub affinity_mask: AffinityMask,
	pub active_core: i32,

	pub original_physical_ideal_core: i32,
	pub original_affinity_mask: AffinityMask,
	pub num_core_migration_disables: i32,
	pub is_pinned: bool,

	pub queue_links: [QueueLink; NUM_CPU_CORES],

	pub wait_queue: Option<WaitQueue>,
	pub cancellable: bool,
	pub wait_cancelled: bool,

	// Arbiter/condvar membership. `sync_key` keys the tree named by
	// `sync_tree`; `address_key` names the lock word this thread owns or
	// wants for priority inheritance.
	pub sync_key: u64,
	pub sync_tree: Option<SyncTreeKind>,
	pub sync_node: RbNode<ThreadId>,
	pub address_key: u64,
	pub address_key_value: u32,
	pub is_kernel_address_key: bool,

	pub held_locks: SmallVec<[LockInfoId; 4]>,
	pub waiting_lock: Option<LockInfoId>,
	pub num_kernel_waiters: i32,
	pub waiter_node: RbNode<ThreadId>,

	pub timer_node: RbNode<ThreadId>,
	/// Absolute wake tick; 0 when not in the timer tree.
	pub wake_time: i64,

	pub signaled: bool,
	pub object_waiters: SmallVec<[ThreadId; 4]>,
	pub pinned_waiters: SmallVec<[ThreadId; 2]>,

	pub last_scheduled_tick: i64,
	pub yield_schedule_count: Option<u64>,
}

impl Thread {
	pub fn new(shared: Arc<ThreadShared>, priority: i32, ideal_core: i32, affinity: AffinityMask) -> Self {
		Self {
			shared,
			raw_state: ThreadState::Initialized as u16,
			suspend_allowed: SUSPEND_FLAG_MASK,
			suspend_request: 0,
			base_priority: priority,
			priority,
			virtual_ideal_core: ideal_core,
			physical_ideal_core: ideal_core,
			affinity_mask: affinity,
			active_core: ideal_core,
			original_physical_ideal_core: ideal_core,
			original_affinity_mask: affinity,
			num_core_migration_disables: 0,
			is_pinned: false,
			queue_links: Default::default(),
			wait_queue: None,
			cancellable: false,
			wait_cancelled: false,
			sync_key: 0,
			sync_tree: None,
			sync_node: RbNode::new(),
			address_key: 0,
			address_key_value: 0,
			is_kernel_address_key: false,
			held_locks: SmallVec::new(),
			waiting_lock: None,
			num_kernel_waiters: 0,
			waiter_node: RbNode::new(),
			timer_node: RbNode::new(),
			wake_time: 0,
			signaled: false,
			object_waiters: SmallVec::new(),
			pinned_waiters: SmallVec::new(),
			last_scheduled_tick: 0,
			yield_schedule_count: None,
		}
	}

	pub fn is_dummy(&self) -> bool {
		self.shared.kind == ThreadKind::Dummy
	}

	/// State including suspend bits; equal to `Runnable` only when the
	/// thread is actually eligible to run.
	pub fn raw_state(&self) -> u16 {
		self.raw_state
	}

	pub fn state(&self) -> ThreadState {
		match self.raw_state & STATE_MASK {
			0 => ThreadState::Initialized,
			1 => ThreadState::Waiting,
			2 => ThreadState::Runnable,
			_ => ThreadState::Terminated,
		}
	}

	pub fn is_runnable(&self) -> bool {
		self.raw_state == ThreadState::Runnable as u16
	}

	pub fn is_suspended(&self) -> bool {
		self.raw_state & SUSPEND_FLAG_MASK != 0
	}

	pub fn is_suspend_requested(&self) -> bool {
		self.suspend_request != 0
	}

	pub fn is_suspend_requested_for(&self, ty: SuspendType) -> bool {
		self.suspend_request & suspend_bit(ty) != 0
	}

	fn suspend_flags(&self) -> u16 {
		self.suspend_allowed & self.suspend_request
	}

	/// Overrides the raw state without notifying the scheduler; only for
	/// records that are not in any queue yet.
	pub(crate) fn set_raw_state_unchecked(&mut self, state: ThreadState) {
		self.raw_state = state as u16;
	}

	pub fn set_kernel_address_key(&mut self, key: u64) {
		self.address_key = key;
		self.is_kernel_address_key = true;
	}

	pub fn set_user_address_key(&mut self, key: u64, value: u32) {
		self.address_key = key;
		self.address_key_value = value;
		self.is_kernel_address_key = false;
	}
}

pub(crate) type ThreadMap = HashMap<ThreadId, Thread, RandomState>;

pub(crate) fn new_thread_map() -> ThreadMap {
	ThreadMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0))
}

// Tree adapters over the thread arena.

/// Arbiter/condvar trees, keyed by (key, priority).
pub(crate) struct SyncTreeAdapter<'a>(pub &'a mut ThreadMap);

impl RbAdapter for SyncTreeAdapter<'_> {
	type Id = ThreadId;
	type Key = (u64, i32);

	fn node(&self, id: ThreadId) -> &RbNode<ThreadId> {
		&self.0[&id].sync_node
	}

	fn node_mut(&mut self, id: ThreadId) -> &mut RbNode<ThreadId> {
		&mut self.0.get_mut(&id).unwrap().sync_node
	}

	fn key(&self, id: ThreadId) -> (u64, i32) {
		let thread = &self.0[&id];
		(thread.sync_key, thread.priority)
	}
}

/// Lock-info waiter trees, keyed by priority (FIFO at equal priority).
pub(crate) struct WaiterTreeAdapter<'a>(pub &'a mut ThreadMap);

impl RbAdapter for WaiterTreeAdapter<'_> {
	type Id = ThreadId;
	type Key = i32;

	fn node(&self, id: ThreadId) -> &RbNode<ThreadId> {
		&self.0[&id].waiter_node
	}

	fn node_mut(&mut self, id: ThreadId) -> &mut RbNode<ThreadId> {
		&mut self.0.get_mut(&id).unwrap().waiter_node
	}

	fn key(&self, id: ThreadId) -> i32 {
		self.0[&id].priority
	}
}

/// The hardware timer's task tree, keyed by absolute wake tick.
pub(crate) struct TimerTreeAdapter<'a>(pub &'a mut ThreadMap);

impl RbAdapter for TimerTreeAdapter<'_> {
	type Id = ThreadId;
	type Key = i64;

	fn node(&self, id: ThreadId) -> &RbNode<ThreadId> {
		&self.0[&id].timer_node
	}

	fn node_mut(&mut self, id: ThreadId) -> &mut RbNode<ThreadId> {
		&mut self.0.get_mut(&id).unwrap().timer_node
	}

	fn key(&self, id: ThreadId) -> i64 {
		self.0[&id].wake_time
	}
}

// Lock-info arena.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LockInfoId(u32);

/// One address-keyed lock with at least one waiter.
pub(crate) struct LockInfo {
	pub owner: ThreadId,
	pub address_key: u64,
	pub is_kernel_address_key: bool,
	pub waiter_count: u32,
	pub waiters: RbTree<ThreadId>,
}

#[derive(Default)]
pub(crate) struct LockInfoPool {
	entries: Vec<Option<LockInfo>>,
	free: Vec<u32>,
}

impl LockInfoPool {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn alloc(&mut self, info: LockInfo) -> LockInfoId {
		match self.free.pop() {
			Some(index) => {
				self.entries[index as usize] = Some(info);
				LockInfoId(index)
			}
			None => {
				self.entries.push(Some(info));
				LockInfoId((self.entries.len() - 1) as u32)
			}
		}
	}

	pub fn release(&mut self, id: LockInfoId) {
		let slot = self.entries[id.0 as usize].take();
		debug_assert!(slot.is_some_and(|info| info.waiter_count == 0));
		self.free.push(id.0);
	}

	pub fn get(&self, id: LockInfoId) -> &LockInfo {
		self.entries[id.0 as usize].as_ref().expect("stale lock info id")
	}

	pub fn get_mut(&mut self, id: LockInfoId) -> &mut LockInfo {
		self.entries[id.0 as usize].as_mut().expect("stale lock info id")
	}
}

// State machine. All functions below require the scheduler lock.

/// Applies a base-state transition and tells the scheduler about it.
pub(crate) fn set_thread_state(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId, state: ThreadState) {
	let thread = s.thread_mut(tid);
	let old_raw = thread.raw_state;
	thread.raw_state = (old_raw & !STATE_MASK) | state as u16;
	if thread.raw_state != old_raw {
		scheduler::on_thread_state_changed(kernel, s, tid, old_raw);
	}
}

/// Folds the current suspend request into the raw state word.
pub(crate) fn update_thread_state(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) {
	let thread = s.thread_mut(tid);
	let old_raw = thread.raw_state;
	thread.raw_state = thread.suspend_flags() | (old_raw & STATE_MASK);
	if thread.raw_state != old_raw {
		scheduler::on_thread_state_changed(kernel, s, tid, old_raw);
	}
}

/// Clears all suspend bits from the raw state word.
pub(crate) fn continue_thread(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) {
	let thread = s.thread_mut(tid);
	let old_raw = thread.raw_state;
	thread.raw_state = old_raw & STATE_MASK;
	scheduler::on_thread_state_changed(kernel, s, tid, old_raw);
}

pub(crate) fn request_suspend(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId, ty: SuspendType) {
	s.thread_mut(tid).suspend_request |= suspend_bit(ty);
	try_suspend(kernel, s, tid);
}

pub(crate) fn resume(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId, ty: SuspendType) {
	s.thread_mut(tid).suspend_request &= !suspend_bit(ty);
	update_thread_state(kernel, s, tid);
}

/// Suspends the thread unless kernel waiters pin it runnable.
pub(crate) fn try_suspend(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) {
	debug_assert!(s.thread(tid).is_suspend_requested());
	if s.thread(tid).num_kernel_waiters > 0 {
		return;
	}
	update_thread_state(kernel, s, tid);
}

/// Clears suspension while the thread holds kernel-keyed locks with
/// waiters, so lock handoff cannot deadlock on a suspended owner.
pub(crate) fn continue_if_has_kernel_waiters(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) {
	if s.thread(tid).num_kernel_waiters > 0 && s.thread(tid).is_suspended() {
		continue_thread(kernel, s, tid);
	}
}

/// Transitions the thread to Waiting on the given queue.
pub(crate) fn begin_wait(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId, queue: WaitQueue) {
	set_thread_state(kernel, s, tid, ThreadState::Waiting);
	s.thread_mut(tid).wait_queue = Some(queue);
}

/// Timer expiry handler: cancels a pending wait with `TimedOut`.
pub(crate) fn on_timer(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) {
	if s.thread(tid).state() == ThreadState::Waiting {
		wait::cancel_wait(kernel, s, tid, Err(SvcError::TimedOut), false);
	}
}

/// Cancels a cancellable synchronization wait, or flags the cancel for the
/// next one.
pub(crate) fn wait_cancel(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) {
	let thread = s.thread_mut(tid);
	if thread.state() == ThreadState::Waiting && thread.cancellable {
		thread.wait_cancelled = false;
		wait::cancel_wait(kernel, s, tid, Err(SvcError::Cancelled), true);
	} else {
		thread.wait_cancelled = true;
	}
}

// Priority inheritance.

fn find_held_lock(s: &KernelState, owner: ThreadId, key: u64, is_kernel: bool) -> Option<LockInfoId> {
	s.thread(owner)
		.held_locks
		.iter()
		.copied()
		.find(|&id| {
			let info = s.lock_infos.get(id);
			info.address_key == key && info.is_kernel_address_key == is_kernel
		})
}

fn highest_priority_waiter(s: &KernelState, id: LockInfoId) -> ThreadId {
	// Clone-free read access: the adapter only needs the map for lookups.
	// The waiter tree is ordered by ascending priority, so the minimum is
	// the highest-priority waiter.
	struct ReadAdapter<'a>(&'a ThreadMap);
	impl RbAdapter for ReadAdapter<'_> {
		type Id = ThreadId;
		type Key = i32;

		fn node(&self, id: ThreadId) -> &RbNode<ThreadId> {
			&self.0[&id].waiter_node
		}

		fn node_mut(&mut self, _id: ThreadId) -> &mut RbNode<ThreadId> {
			unreachable!("read-only adapter")
		}

		fn key(&self, id: ThreadId) -> i32 {
			self.0[&id].priority
		}
	}

	s.lock_infos
		.get(id)
		.waiters
		.front(&ReadAdapter(&s.threads))
		.expect("lock info without waiters")
}

fn add_waiter_impl(kernel: &KernelCore, s: &mut KernelState, owner: ThreadId, waiter: ThreadId) {
	debug_assert!(s.thread(waiter).sync_tree.is_none());

	let key = s.thread(waiter).address_key;
	let is_kernel = s.thread(waiter).is_kernel_address_key;

	if is_kernel {
		s.thread_mut(owner).num_kernel_waiters += 1;
		s.update_needed = true;
	}

	let lock_id = match find_held_lock(s, owner, key, is_kernel) {
		Some(id) => id,
		None => {
			let id = s.lock_infos.alloc(LockInfo {
				owner,
				address_key: key,
				is_kernel_address_key: is_kernel,
				waiter_count: 0,
				waiters: RbTree::new(),
			});
			s.thread_mut(owner).held_locks.insert(0, id);
			id
		}
	};

	let KernelState { threads, lock_infos, .. } = &mut *s;
	let info = lock_infos.get_mut(lock_id);
	info.waiters.insert(&mut WaiterTreeAdapter(threads), waiter);
	info.waiter_count += 1;
	s.thread_mut(waiter).waiting_lock = Some(lock_id);
	let _ = kernel;
}

fn remove_waiter_impl(kernel: &KernelCore, s: &mut KernelState, owner: ThreadId, waiter: ThreadId) {
	if s.thread(waiter).is_kernel_address_key {
		s.thread_mut(owner).num_kernel_waiters -= 1;
		debug_assert!(s.thread(owner).num_kernel_waiters >= 0);
		s.update_needed = true;
	}

	let lock_id = s.thread(waiter).waiting_lock.expect("waiter without a lock");
	debug_assert_eq!(s.lock_infos.get(lock_id).owner, owner);

	let emptied = {
		let KernelState { threads, lock_infos, .. } = &mut *s;
		let info = lock_infos.get_mut(lock_id);
		info.waiters.remove(&mut WaiterTreeAdapter(threads), waiter);
		info.waiter_count -= 1;
		info.waiter_count == 0
	};
	s.thread_mut(waiter).waiting_lock = None;

	if emptied {
		s.thread_mut(owner).held_locks.retain(|&mut id| id != lock_id);
		s.lock_infos.release(lock_id);
	}
	let _ = kernel;
}

/// Recomputes a thread's effective priority from its base priority and the
/// waiters of every lock it holds, walking up the ownership chain while
/// the inherited priority keeps changing.
pub(crate) fn restore_priority(kernel: &KernelCore, s: &mut KernelState, mut tid: ThreadId) {
	loop {
		let (mut new_priority, held_locks) = {
			let thread = s.thread(tid);
			(thread.base_priority, thread.held_locks.clone())
		};
		for held in held_locks {
			let waiter = highest_priority_waiter(s, held);
			new_priority = new_priority.min(s.thread(waiter).priority);
		}

		if new_priority == s.thread(tid).priority {
			return;
		}

		let lock_owner = s
			.thread(tid)
			.waiting_lock
			.map(|id| s.lock_infos.get(id).owner);

		// Take the thread out of any ordered structure keyed by its
		// priority before changing it.
		if let Some(owner) = lock_owner {
			remove_waiter_impl(kernel, s, owner, tid);
		}
		let sync_tree = s.thread(tid).sync_tree;
		if let Some(kind) = sync_tree {
			let KernelState { threads, arbiter_tree, condvar_tree, .. } = &mut *s;
			let tree = match kind {
				SyncTreeKind::Arbiter => arbiter_tree,
				SyncTreeKind::Condvar => condvar_tree,
			};
			tree.remove(&mut SyncTreeAdapter(threads), tid);
		}

		let old_priority = s.thread(tid).priority;
		s.thread_mut(tid).priority = new_priority;

		if let Some(kind) = sync_tree {
			let KernelState { threads, arbiter_tree, condvar_tree, .. } = &mut *s;
			let tree = match kind {
				SyncTreeKind::Arbiter => arbiter_tree,
				SyncTreeKind::Condvar => condvar_tree,
			};
			tree.insert(&mut SyncTreeAdapter(threads), tid);
		}
		if let Some(owner) = lock_owner {
			add_waiter_impl(kernel, s, owner, tid);
		}

		scheduler::on_thread_priority_changed(kernel, s, tid, old_priority);

		match lock_owner {
			Some(owner) => tid = owner,
			None => return,
		}
	}
}

/// Registers `waiter` as blocked on a lock held by `owner` and propagates
/// priority inheritance.
pub(crate) fn add_waiter(kernel: &KernelCore, s: &mut KernelState, owner: ThreadId, waiter: ThreadId) {
	add_waiter_impl(kernel, s, owner, waiter);
	if s.thread(waiter).priority < s.thread(owner).priority {
		restore_priority(kernel, s, owner);
	}
}

pub(crate) fn remove_waiter(kernel: &KernelCore, s: &mut KernelState, owner: ThreadId, waiter: ThreadId) {
	remove_waiter_impl(kernel, s, owner, waiter);
	let owner_thread = s.thread(owner);
	if owner_thread.priority == s.thread(waiter).priority
		&& owner_thread.priority < owner_thread.base_priority
	{
		restore_priority(kernel, s, owner);
	}
}

/// Releases the lock keyed by `key` owned by `owner`: picks the highest
/// priority waiter as the next owner, hands the remaining waiters over and
/// undoes any inherited boost. Returns `(next_owner, has_more_waiters)`.
pub(crate) fn remove_waiter_by_key(
	kernel: &KernelCore,
	s: &mut KernelState,
	owner: ThreadId,
	key: u64,
	is_kernel: bool,
) -> (Option<ThreadId>, bool) {
	let Some(lock_id) = find_held_lock(s, owner, key, is_kernel) else {
		return (None, false);
	};

	s.thread_mut(owner).held_locks.retain(|&mut id| id != lock_id);
	if is_kernel {
		let count = s.lock_infos.get(lock_id).waiter_count as i32;
		s.thread_mut(owner).num_kernel_waiters -= count;
		debug_assert!(s.thread(owner).num_kernel_waiters >= 0);
		s.update_needed = true;
	}

	debug_assert!(s.lock_infos.get(lock_id).waiter_count > 0);
	let next_owner = highest_priority_waiter(s, lock_id);

	let emptied = {
		let KernelState { threads, lock_infos, .. } = &mut *s;
		let info = lock_infos.get_mut(lock_id);
		info.waiters.remove(&mut WaiterTreeAdapter(threads), next_owner);
		info.waiter_count -= 1;
		info.waiter_count == 0
	};
	s.thread_mut(next_owner).waiting_lock = None;

	let has_waiters = if emptied {
		s.lock_infos.release(lock_id);
		false
	} else {
		let remaining = s.lock_infos.get(lock_id).waiter_count as i32;
		s.lock_infos.get_mut(lock_id).owner = next_owner;
		s.thread_mut(next_owner).held_locks.insert(0, lock_id);
		if is_kernel {
			s.thread_mut(next_owner).num_kernel_waiters += remaining;
		}
		true
	};

	// The next owner was the highest-priority waiter, so only the old
	// owner can need a priority restoration.
	let owner_thread = s.thread(owner);
	if owner_thread.priority == s.thread(next_owner).priority
		&& owner_thread.priority < owner_thread.base_priority
	{
		restore_priority(kernel, s, owner);
	}

	(Some(next_owner), has_waiters)
}

// Priorities, affinity, activity.

pub(crate) fn set_base_priority(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId, priority: i32) {
	debug_assert!((0..=LOWEST_THREAD_PRIORITY).contains(&priority));
	s.thread_mut(tid).base_priority = priority;
	restore_priority(kernel, s, tid);
}

/// Raises the base priority; used when termination is requested.
pub(crate) fn increase_base_priority(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId, priority: i32) {
	debug_assert!(!s.thread(tid).is_pinned);
	if s.thread(tid).base_priority > priority {
		s.thread_mut(tid).base_priority = priority;
		restore_priority(kernel, s, tid);
	}
}

/// Binds the current thread to its core with preference over the normally
/// chosen thread, remembering the state to restore on unpin.
pub(crate) fn pin_current_thread(kernel: &KernelCore, s: &mut KernelState, core: i32) {
	let tid = kernel.current_thread_id();
	{
		let thread = s.thread_mut(tid);
		debug_assert_eq!(thread.num_core_migration_disables, 0);
		thread.is_pinned = true;
		thread.num_core_migration_disables += 1;
		thread.original_physical_ideal_core = thread.physical_ideal_core;
		thread.original_affinity_mask = thread.affinity_mask;
	}
	s.pinned_threads[core as usize] = Some(tid);

	let active_core = s.thread(tid).active_core;
	let old_mask = s.thread(tid).original_affinity_mask;
	{
		let thread = s.thread_mut(tid);
		thread.active_core = core;
		thread.physical_ideal_core = core;
		thread.affinity_mask = AffinityMask::single(core);
	}
	if active_core != core || s.thread(tid).affinity_mask != old_mask {
		scheduler::on_thread_affinity_mask_changed(kernel, s, tid, old_mask, active_core);
	}

	s.thread_mut(tid).suspend_allowed &= !suspend_bit(SuspendType::Thread);
	update_thread_state(kernel, s, tid);
}

pub(crate) fn unpin_current_thread(kernel: &KernelCore, s: &mut KernelState, core: i32) {
	let tid = kernel.current_thread_id();
	s.pinned_threads[core as usize] = None;

	{
		let thread = s.thread_mut(tid);
		debug_assert_eq!(thread.num_core_migration_disables, 1);
		thread.is_pinned = false;
		thread.num_core_migration_disables -= 1;
	}

	let old_mask = s.thread(tid).affinity_mask;
	let active_core = s.thread(tid).active_core;
	{
		let thread = s.thread_mut(tid);
		thread.physical_ideal_core = thread.original_physical_ideal_core;
		thread.affinity_mask = thread.original_affinity_mask;
	}
	if s.thread(tid).affinity_mask != old_mask {
		if !s.thread(tid).affinity_mask.get(active_core) {
			let new_core = if s.thread(tid).physical_ideal_core >= 0 {
				s.thread(tid).physical_ideal_core
			} else {
				s.thread(tid).affinity_mask.highest_set_core()
			};
			s.thread_mut(tid).active_core = new_core;
		}
		scheduler::on_thread_affinity_mask_changed(kernel, s, tid, old_mask, active_core);
	}

	if !s.thread(tid).shared.is_termination_requested() {
		s.thread_mut(tid).suspend_allowed |= suspend_bit(SuspendType::Thread);
		update_thread_state(kernel, s, tid);
	}

	// Resume any threads that began waiting on us while we were pinned.
	let waiters: SmallVec<[ThreadId; 2]> = s.thread_mut(tid).pinned_waiters.drain(..).collect();
	for waiter in waiters {
		wait::end_wait(kernel, s, waiter, Ok(()));
	}
}

pub(crate) fn get_core_mask(s: &KernelState, tid: ThreadId) -> (i32, u64) {
	let thread = s.thread(tid);
	(thread.virtual_ideal_core, thread.affinity_mask.raw())
}

/// Changes a thread's ideal core and affinity mask. When core migration is
/// disabled (pinning), the new values are stored for the unpin path.
pub(crate) fn set_core_mask(
	kernel: &KernelCore,
	s: &mut KernelState,
	tid: ThreadId,
	ideal_core: i32,
	affinity: u64,
) -> SvcResult {
	let mask = AffinityMask::from_raw(affinity);

	s.thread_mut(tid).virtual_ideal_core = ideal_core;

	if s.thread(tid).num_core_migration_disables == 0 {
		let old_mask = s.thread(tid).affinity_mask;
		let old_core = s.thread(tid).active_core;

		{
			let thread = s.thread_mut(tid);
			thread.physical_ideal_core = ideal_core;
			thread.affinity_mask = mask;
		}

		if old_mask.raw() != affinity {
			let active = s.thread(tid).active_core;
			if !mask.get(active) {
				let new_core = if ideal_core >= 0 {
					ideal_core
				} else {
					mask.highest_set_core()
				};
				s.thread_mut(tid).active_core = new_core;
			}
			scheduler::on_thread_affinity_mask_changed(kernel, s, tid, old_mask, old_core);
		}
	} else {
		// Migration is disabled; update the state to restore.
		let thread = s.thread_mut(tid);
		thread.original_physical_ideal_core = ideal_core;
		thread.original_affinity_mask = mask;
	}

	Ok(())
}

// Lifecycle.

/// Makes an Initialized thread Runnable.
pub(crate) fn run_thread(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) -> SvcResult {
	loop {
		let cur = kernel.current_thread_id();

		if s.thread(tid).shared.is_termination_requested()
			|| s.thread(cur).shared.is_termination_requested()
		{
			return Err(SvcError::TerminationRequested);
		}
		if s.thread(tid).state() != ThreadState::Initialized {
			return Err(SvcError::InvalidState);
		}

		// If the current thread has been asked to suspend, suspend it and
		// retry.
		if s.thread(cur).is_suspend_requested() {
			update_thread_state(kernel, s, cur);
			continue;
		}

		if s.thread(tid).is_suspend_requested() {
			update_thread_state(kernel, s, tid);
		}

		s.thread(tid).shared.open_count.fetch_add(1, Ordering::SeqCst);
		kernel.process().increment_running_threads();
		set_thread_state(kernel, s, tid, ThreadState::Runnable);
		return Ok(());
	}
}

/// First phase of termination, run on the dying thread's behalf under the
/// scheduler lock.
pub(crate) fn start_termination(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) {
	let current_core = kernel.current_core_id();
	if current_core >= 0 && s.pinned_threads[current_core as usize] == Some(tid) {
		unpin_current_thread(kernel, s, current_core);
	}

	set_thread_state(kernel, s, tid, ThreadState::Terminated);
	scheduler::clear_previous_thread(kernel, s, tid);
	s.thread(tid).shared.register_dpc(DpcFlag::TERMINATED);
}

/// Second phase, run by the worker task manager once the thread no longer
/// occupies any core: signal waiters and drop the run reference.
pub(crate) fn finish_termination(kernel: &KernelCore, tid: ThreadId) {
	// Ensure the thread is not executing on any core.
	for core in 0..NUM_CPU_CORES {
		while kernel.core(core).current_thread() == Some(tid) {
			std::hint::spin_loop();
		}
	}

	{
		let mut guard = kernel.lock_scheduler();
		let s = guard.state();
		s.thread_mut(tid).signaled = true;
		wait::notify_object_waiters(kernel, s, wait::WaitObject::Thread(tid), Ok(()));
	}

	kernel.close_thread(tid);
}

/// Terminates the calling thread. Never returns; the backing fiber is
/// never scheduled again.
pub(crate) fn exit_current(kernel: &KernelCore) -> ! {
	let tid = kernel.current_thread_id();
	kernel.process().decrement_running_threads();

	{
		let mut guard = kernel.lock_scheduler();
		let s = guard.state();

		// Disallow all suspension.
		s.thread_mut(tid).suspend_allowed = 0;
		update_thread_state(kernel, s, tid);

		start_termination(kernel, s, tid);
		kernel.worker().queue_exit(kernel, s, tid);
	}

	unreachable!("terminated thread was scheduled again");
}

/// Asks another thread to terminate. Returns its state after the request.
pub(crate) fn request_terminate(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) -> ThreadState {
	debug_assert_ne!(tid, kernel.current_thread_id());

	let shared = s.thread(tid).shared.clone();
	let first_request = shared
		.termination_requested
		.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
		.is_ok();

	if first_request {
		if s.thread(tid).state() == ThreadState::Initialized {
			s.thread_mut(tid).raw_state = ThreadState::Terminated as u16;
			return ThreadState::Terminated;
		}

		shared.register_dpc(DpcFlag::TERMINATING);

		if s.thread(tid).is_pinned {
			let core = s.thread(tid).active_core;
			if s.pinned_threads[core as usize] == Some(tid) {
				s.pinned_threads[core as usize] = None;
			}
		}

		if s.thread(tid).is_suspended() {
			s.thread_mut(tid).suspend_allowed = 0;
			update_thread_state(kernel, s, tid);
		}

		increase_base_priority(kernel, s, tid, crate::config::TERMINATING_THREAD_PRIORITY);

		if s.thread(tid).state() == ThreadState::Runnable {
			// The thread may be running on any core in its affinity mask.
			let mask = s.thread(tid).affinity_mask.raw();
			if mask != 0 {
				crate::kernel::interrupts::send_inter_processor_interrupt(kernel, mask);
			}
		} else if s.thread(tid).state() == ThreadState::Waiting {
			wait::cancel_wait(kernel, s, tid, Err(SvcError::TerminationRequested), true);
		}
	}

	s.thread(tid).state()
}

/// Releases every lock the thread still owns, cancelling the waiters.
pub(crate) fn release_held_locks(kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) {
	debug_assert!(s.thread(tid).waiting_lock.is_none());
	debug_assert_eq!(s.thread(tid).num_kernel_waiters, 0);

	while let Some(&lock_id) = s.thread(tid).held_locks.first() {
		debug_assert!(!s.lock_infos.get(lock_id).is_kernel_address_key);
		while s
			.thread(tid)
			.held_locks
			.first()
			.is_some_and(|&id| id == lock_id)
		{
			let waiter = highest_priority_waiter(s, lock_id);
			// Removing the last waiter frees the lock info and pops it off
			// the held list.
			remove_waiter_impl(kernel, s, tid, waiter);
			wait::cancel_wait(kernel, s, waiter, Err(SvcError::InvalidState), true);
		}
	}
}

/// Puts the calling thread to sleep for `timeout` ticks (must be > 0).
pub(crate) fn sleep(kernel: &KernelCore, timeout: i64) -> SvcResult {
	debug_assert!(timeout > 0);
	let tid = kernel.current_thread_id();

	{
		let mut slp = scheduler::SchedulerLockAndSleep::new(kernel, tid, timeout);
		let s = slp.state();

		if s.thread(tid).shared.is_termination_requested() {
			slp.cancel_sleep();
			return Err(SvcError::TerminationRequested);
		}

		let timer_armed = slp.timer_will_arm();
		let s = slp.state();
		begin_wait(kernel, s, tid, WaitQueue::sleep(timer_armed));
	}

	Ok(())
}

/// Pauses or resumes a thread (guest ThreadActivity).
pub(crate) fn set_activity(kernel: &KernelCore, tid: ThreadId, pause: bool) -> SvcResult {
	let shared = kernel.thread_shared(tid);
	shared.activity_pause_lock.lock(kernel);
	let result = set_activity_locked(kernel, tid, pause);
	shared.activity_pause_lock.unlock(kernel);
	result
}

fn set_activity_locked(kernel: &KernelCore, tid: ThreadId, pause: bool) -> SvcResult {
	{
		let mut guard = kernel.lock_scheduler();
		let s = guard.state();

		let state = s.thread(tid).state();
		if state != ThreadState::Waiting && state != ThreadState::Runnable {
			return Err(SvcError::InvalidState);
		}

		if pause {
			if s.thread(tid).is_suspend_requested_for(SuspendType::Thread) {
				return Err(SvcError::InvalidState);
			}
			request_suspend(kernel, s, tid, SuspendType::Thread);
		} else {
			if !s.thread(tid).is_suspend_requested_for(SuspendType::Thread) {
				return Err(SvcError::InvalidState);
			}
			resume(kernel, s, tid, SuspendType::Thread);
		}
	}

	if pause {
		// Don't return until the thread is actually off-core.
		loop {
			let mut guard = kernel.lock_scheduler();
			let s = guard.state();

			if s.thread(tid).shared.is_termination_requested() {
				return Ok(());
			}

			if s.thread(tid).is_pinned {
				let cur = kernel.current_thread_id();
				if s.thread(cur).shared.is_termination_requested() {
					return Err(SvcError::TerminationRequested);
				}
				s.thread_mut(tid).pinned_waiters.push(cur);
				begin_wait(kernel, s, cur, WaitQueue::pinned(tid));
			} else {
				let running = (0..NUM_CPU_CORES)
					.any(|core| kernel.core(core).current_thread() == Some(tid));
				if !running {
					return Ok(());
				}
			}
		}
	}

	Ok(())
}
