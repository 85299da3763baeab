//! The kernel orchestrator: owns the scheduler state, the per-core
//! contexts, the hardware timer, the emulated process and the worker, and
//! gives every host thread an identity (a guest thread, an idle thread or
//! a dummy thread standing in for a host caller).

pub(crate) mod cpu_manager;
pub mod handle_table;
pub(crate) mod interrupts;
pub(crate) mod physical_core;
pub mod process;
pub(crate) mod worker;

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use ahash::RandomState;
use crossbeam_utils::CachePadded;
use hashbrown::HashMap;
use hermit_sync::{OnceCell, SpinMutex};

use crate::arm::Debugger;
use crate::collections::rbtree::RbTree;
use crate::config::{
	DUMMY_THREAD_PRIORITY, IDLE_THREAD_PRIORITY, LOWEST_THREAD_PRIORITY, NUM_CPU_CORES,
	PREEMPTION_INTERVAL_NS,
};
use crate::fiber::Fiber;
use crate::result::{SvcError, SvcResult};
use crate::scheduler::priority_queue::PriorityQueue;
use crate::scheduler::thread::{
	self, new_thread_map, AffinityMask, LockInfoPool, Thread, ThreadId, ThreadKind, ThreadMap,
	ThreadShared, ThreadState,
};
use crate::scheduler::timer::HardwareTimerState;
use crate::scheduler::{self, SchedulerGuard, SchedulerLock};
use crate::synch::event::{EventId, EventPool};
use crate::time::{HostTimer, TickSource, TimerSource};
use handle_table::KernelObject;
use physical_core::PhysicalCore;
use process::Process;
use worker::WorkerTaskManager;

/// Everything the scheduling algorithms mutate, guarded by the global
/// scheduler lock.
pub(crate) struct KernelState {
	pub threads: ThreadMap,
	pub lock_infos: LockInfoPool,
	pub queue: PriorityQueue,
	pub timer: HardwareTimerState,
	pub arbiter_tree: RbTree<ThreadId>,
	pub condvar_tree: RbTree<ThreadId>,
	pub events: EventPool,
	pub update_needed: bool,
	pub woken_dummies: Vec<ThreadId>,
	pub pinned_threads: [Option<ThreadId>; NUM_CPU_CORES],
}

impl KernelState {
	fn new() -> Self {
		Self {
			threads: new_thread_map(),
			lock_infos: LockInfoPool::new(),
			queue: PriorityQueue::new(),
			timer: HardwareTimerState::new(),
			arbiter_tree: RbTree::new(),
			condvar_tree: RbTree::new(),
			events: EventPool::new(),
			update_needed: false,
			woken_dummies: Vec::new(),
			pinned_threads: [None; NUM_CPU_CORES],
		}
	}

	pub fn thread(&self, tid: ThreadId) -> &Thread {
		self.threads.get(&tid).expect("stale thread id")
	}

	pub fn thread_mut(&mut self, tid: ThreadId) -> &mut Thread {
		self.threads.get_mut(&tid).expect("stale thread id")
	}
}

/// Per-core scheduling context shared between host threads without the
/// scheduler lock.
pub(crate) struct CoreContext {
	pub needs_scheduling: AtomicBool,
	pub highest_priority_thread: AtomicU64,
	pub current_thread: AtomicU64,
	pub prev_thread: AtomicU64,
	pub switch_cur_thread: AtomicU64,
	pub switch_next_thread: AtomicU64,
	pub switch_from_schedule: AtomicBool,
	pub physical: PhysicalCore,
	idle_thread: OnceCell<ThreadId>,
	switch_fiber: OnceCell<Arc<Fiber>>,
	pub host_fiber: OnceCell<Arc<Fiber>>,
}

impl CoreContext {
	fn new() -> Self {
		Self {
			needs_scheduling: AtomicBool::new(false),
			highest_priority_thread: AtomicU64::new(0),
			current_thread: AtomicU64::new(0),
			prev_thread: AtomicU64::new(0),
			switch_cur_thread: AtomicU64::new(0),
			switch_next_thread: AtomicU64::new(0),
			switch_from_schedule: AtomicBool::new(false),
			physical: PhysicalCore::new(),
			idle_thread: OnceCell::new(),
			switch_fiber: OnceCell::new(),
			host_fiber: OnceCell::new(),
		}
	}

	pub fn idle_thread(&self) -> ThreadId {
		*self.idle_thread.get().expect("core not initialized")
	}

	pub fn switch_fiber(&self) -> &Arc<Fiber> {
		self.switch_fiber.get().expect("core not initialized")
	}

	pub fn current_thread(&self) -> Option<ThreadId> {
		ThreadId::from_raw(self.current_thread.load(Ordering::SeqCst))
	}
}

struct HostThreadContext {
	kernel_id: Cell<u64>,
	current: RefCell<Option<Arc<ThreadShared>>>,
	disable_count: Cell<u32>,
}

thread_local! {
	static HOST_CONTEXT: HostThreadContext = const {
		HostThreadContext {
			kernel_id: Cell::new(0),
			current: RefCell::new(None),
			disable_count: Cell::new(0),
		}
	};
}

/// Core id of the calling host thread, for log prefixes.
pub(crate) fn logging_core_id() -> Option<i32> {
	HOST_CONTEXT
		.try_with(|ctx| {
			let current = ctx.current.try_borrow().ok()?;
			let shared = current.as_ref()?;
			let core = shared.current_core.load(Ordering::Relaxed);
			(core >= 0).then_some(core)
		})
		.ok()
		.flatten()
}

static KERNEL_IDS: AtomicU64 = AtomicU64::new(1);

pub struct KernelCore {
	id: u64,
	state: std::cell::UnsafeCell<KernelState>,
	sched_lock: SchedulerLock,
	cores: [CachePadded<CoreContext>; NUM_CPU_CORES],
	tick: TickSource,
	host_timer: HostTimer,
	process: OnceCell<Process>,
	worker: WorkerTaskManager,
	debugger: OnceCell<Box<dyn Debugger>>,
	shared_threads: SpinMutex<HashMap<ThreadId, Arc<ThreadShared>, RandomState>>,
	next_thread_id: AtomicU64,
	self_weak: OnceCell<Weak<KernelCore>>,
	shutting_down: AtomicBool,
	started: AtomicBool,
	single_core: bool,
	single_core_current: AtomicUsize,
	core_threads: SpinMutex<Vec<JoinHandle<()>>>,
	timer_thread: SpinMutex<Option<JoinHandle<()>>>,
}

// The state cell is guarded by the scheduler lock; everything else is
// internally synchronized.
unsafe impl Sync for KernelCore {}
unsafe impl Send for KernelCore {}

impl KernelCore {
	pub fn new() -> Arc<Self> {
		Self::with_mode(false)
	}

	/// All emulated cores share one host thread, driven by the preemption
	/// tick.
	pub fn new_single_core() -> Arc<Self> {
		Self::with_mode(true)
	}

	fn with_mode(single_core: bool) -> Arc<Self> {
		crate::logging::init();

		let kernel = Arc::new(Self {
			id: KERNEL_IDS.fetch_add(1, Ordering::Relaxed),
			state: std::cell::UnsafeCell::new(KernelState::new()),
			sched_lock: SchedulerLock::new(),
			cores: [(); NUM_CPU_CORES].map(|()| CachePadded::new(CoreContext::new())),
			tick: TickSource::new(),
			host_timer: HostTimer::new(),
			process: OnceCell::new(),
			worker: WorkerTaskManager::new(),
			debugger: OnceCell::new(),
			shared_threads: SpinMutex::new(HashMap::with_hasher(RandomState::with_seeds(
				0, 0, 0, 0,
			))),
			next_thread_id: AtomicU64::new(1),
			self_weak: OnceCell::new(),
			shutting_down: AtomicBool::new(false),
			started: AtomicBool::new(false),
			single_core,
			single_core_current: AtomicUsize::new(0),
			core_threads: SpinMutex::new(Vec::new()),
			timer_thread: SpinMutex::new(None),
		});

		assert!(kernel.self_weak.set(Arc::downgrade(&kernel)).is_ok());
		*kernel.timer_thread.lock() = Some(HostTimer::spawn(Arc::downgrade(&kernel)));
		kernel.worker.spawn(Arc::downgrade(&kernel));

		kernel
	}

	fn self_weak(&self) -> Weak<KernelCore> {
		self.self_weak.get().expect("kernel weak not set").clone()
	}

	// Accessors.

	pub(crate) fn scheduler_lock(&self) -> &SchedulerLock {
		&self.sched_lock
	}

	/// # Safety
	///
	/// The caller must hold the scheduler lock (or be its releasing path).
	pub(crate) unsafe fn state_unchecked(&self) -> &mut KernelState {
		&mut *self.state.get()
	}

	pub(crate) fn lock_scheduler(&self) -> SchedulerGuard<'_> {
		SchedulerGuard::new(self)
	}

	pub(crate) fn core(&self, core: usize) -> &CoreContext {
		&self.cores[core]
	}

	pub fn tick_source(&self) -> &TickSource {
		&self.tick
	}

	pub(crate) fn host_timer(&self) -> &HostTimer {
		&self.host_timer
	}

	pub(crate) fn worker(&self) -> &WorkerTaskManager {
		&self.worker
	}

	pub fn set_process(&self, process: Process) {
		assert!(
			self.process.set(process).is_ok(),
			"process already initialized"
		);
	}

	pub fn process(&self) -> &Process {
		self.process.get().expect("no process initialized")
	}

	pub(crate) fn try_process(&self) -> Option<&Process> {
		self.process.get()
	}

	pub fn set_debugger(&self, debugger: Box<dyn Debugger>) {
		assert!(self.debugger.set(debugger).is_ok(), "debugger already set");
	}

	pub(crate) fn debugger(&self) -> Option<&dyn Debugger> {
		self.debugger.get().map(|d| &**d)
	}

	pub fn is_single_core(&self) -> bool {
		self.single_core
	}

	pub fn is_shutting_down(&self) -> bool {
		self.shutting_down.load(Ordering::SeqCst)
	}

	pub(crate) fn thread_shared(&self, tid: ThreadId) -> Arc<ThreadShared> {
		self.shared_threads
			.lock()
			.get(&tid)
			.cloned()
			.expect("stale thread id")
	}

	// Host thread identity.

	pub(crate) fn bind_host_thread(&self, shared: Arc<ThreadShared>) {
		HOST_CONTEXT.with(|ctx| {
			ctx.kernel_id.set(self.id);
			*ctx.current.borrow_mut() = Some(shared);
			ctx.disable_count.set(0);
		});
	}

	pub(crate) fn set_dispatch_count(&self, count: u32) {
		HOST_CONTEXT.with(|ctx| ctx.disable_count.set(count));
	}

	pub(crate) fn current_thread_shared(&self) -> Arc<ThreadShared> {
		HOST_CONTEXT.with(|ctx| {
			debug_assert_eq!(ctx.kernel_id.get(), self.id, "host thread bound elsewhere");
			ctx.current
				.borrow()
				.clone()
				.expect("host thread not registered with the kernel")
		})
	}

	pub fn current_thread_id(&self) -> ThreadId {
		self.current_thread_shared().id
	}

	/// Emulated core the caller runs on, or -1 for host (dummy) threads.
	pub fn current_core_id(&self) -> i32 {
		self.current_thread_shared()
			.current_core
			.load(Ordering::SeqCst)
	}

	/// The core whose scheduler the calling context belongs to; `None` in
	/// host (dummy) contexts, which cannot reschedule themselves.
	pub(crate) fn current_scheduler_core(&self) -> Option<usize> {
		let shared = self.current_thread_shared();
		if shared.is_dummy() {
			return None;
		}
		let core = shared.current_core.load(Ordering::SeqCst);
		(core >= 0).then_some(core as usize)
	}

	/// Exclusive-monitor slot of the calling context. Host callers outside
	/// any core share the spare slot.
	pub(crate) fn current_monitor_slot(&self) -> usize {
		let core = self.current_core_id();
		if core >= 0 && !self.current_thread_shared().is_dummy() {
			core as usize
		} else {
			NUM_CPU_CORES
		}
	}

	pub(crate) fn dispatch_disable_count(&self) -> u32 {
		HOST_CONTEXT.with(|ctx| ctx.disable_count.get())
	}

	pub(crate) fn disable_dispatch(&self) {
		HOST_CONTEXT.with(|ctx| ctx.disable_count.set(ctx.disable_count.get() + 1));
	}

	pub(crate) fn enable_dispatch(&self) {
		HOST_CONTEXT.with(|ctx| {
			let count = ctx.disable_count.get();
			debug_assert!(count > 0);
			ctx.disable_count.set(count - 1);
		});
	}

	/// Registers the calling host thread with the kernel, backing it with
	/// a dummy thread so it can take the scheduler lock and wait.
	/// Idempotent.
	pub fn register_host_thread(&self) -> ThreadId {
		let existing = HOST_CONTEXT.with(|ctx| {
			if ctx.kernel_id.get() == self.id {
				ctx.current.borrow().as_ref().map(|shared| shared.id)
			} else {
				None
			}
		});
		if let Some(tid) = existing {
			return tid;
		}

		let tid = self.allocate_thread_id();
		let shared = Arc::new(ThreadShared::new(tid, ThreadKind::Dummy, 0, -1));
		self.shared_threads.lock().insert(tid, shared.clone());

		// Bind first: taking the scheduler lock already needs an identity.
		self.bind_host_thread(shared.clone());

		{
			let mut guard = self.lock_scheduler();
			let s = guard.state();
			let mut record = Thread::new(
				shared,
				DUMMY_THREAD_PRIORITY,
				-1,
				AffinityMask::empty(),
			);
			record.set_raw_state_unchecked(ThreadState::Runnable);
			s.threads.insert(tid, record);
		}

		trace!("registered host thread as dummy thread {tid}");
		tid
	}

	fn allocate_thread_id(&self) -> ThreadId {
		ThreadId::new(self.next_thread_id.fetch_add(1, Ordering::SeqCst))
	}

	// Thread lifecycle.

	/// Creates a guest thread in the Initialized state.
	pub fn create_thread(
		&self,
		priority: i32,
		ideal_core: i32,
		affinity_mask: u64,
		tls_address: u64,
	) -> SvcResult<ThreadId> {
		self.register_host_thread();

		if !(0..=LOWEST_THREAD_PRIORITY).contains(&priority) {
			return Err(SvcError::InvalidCombination);
		}
		if ideal_core < 0
			|| ideal_core >= NUM_CPU_CORES as i32
			|| affinity_mask & (1 << ideal_core) == 0
			|| affinity_mask >> NUM_CPU_CORES != 0
		{
			return Err(SvcError::InvalidCombination);
		}

		let tid = self.allocate_thread_id();
		let shared = Arc::new(ThreadShared::new(tid, ThreadKind::User, tls_address, ideal_core));

		let weak = self.self_weak();
		let fiber = Fiber::spawn(&format!("GuestThread_{tid}"), move |me| {
			cpu_manager::guest_thread_main(weak, me, tid);
		});
		assert!(shared.host_context.set(fiber).is_ok());

		self.shared_threads.lock().insert(tid, shared.clone());
		{
			let mut guard = self.lock_scheduler();
			guard.state().threads.insert(
				tid,
				Thread::new(
					shared,
					priority,
					ideal_core,
					AffinityMask::from_raw(affinity_mask),
				),
			);
		}

		debug!("created thread {tid} with priority {priority} on core {ideal_core}");
		Ok(tid)
	}

	/// Makes an Initialized thread Runnable.
	pub fn start_thread(&self, tid: ThreadId) -> SvcResult {
		self.register_host_thread();
		let mut guard = self.lock_scheduler();
		thread::run_thread(self, guard.state(), tid)
	}

	/// Requests another thread's termination.
	pub fn terminate_thread(&self, tid: ThreadId) -> SvcResult {
		self.register_host_thread();

		let state = {
			let mut guard = self.lock_scheduler();
			thread::request_terminate(self, guard.state(), tid)
		};

		if state != ThreadState::Terminated {
			let objects = [crate::synch::wait::WaitObject::Thread(tid)];
			crate::synch::wait::wait_synchronization(self, &objects, -1)?;
		}
		Ok(())
	}

	// Object reference counts. The handle table stores plain ids; these
	// keep them alive.

	pub(crate) fn open_object(&self, obj: KernelObject) {
		match obj {
			KernelObject::Thread(tid) => {
				self.thread_shared(tid)
					.open_count
					.fetch_add(1, Ordering::SeqCst);
			}
			KernelObject::ReadableEvent(event) | KernelObject::WritableEvent(event) => {
				let mut guard = self.lock_scheduler();
				guard.state().events.get_mut(event).open_count += 1;
			}
		}
	}

	pub(crate) fn close_object(&self, obj: KernelObject) {
		match obj {
			KernelObject::Thread(tid) => self.close_thread(tid),
			KernelObject::ReadableEvent(event) | KernelObject::WritableEvent(event) => {
				self.close_event(event)
			}
		}
	}

	pub(crate) fn create_event(&self) -> EventId {
		let mut guard = self.lock_scheduler();
		guard.state().events.alloc()
	}

	pub(crate) fn close_event(&self, event: EventId) {
		let mut guard = self.lock_scheduler();
		let s = guard.state();
		let object = s.events.get_mut(event);
		object.open_count -= 1;
		if object.open_count == 0 {
			s.events.release(event);
		}
	}

	pub(crate) fn close_thread(&self, tid: ThreadId) {
		let shared = self.thread_shared(tid);
		if shared.open_count.fetch_sub(1, Ordering::SeqCst) != 1 {
			return;
		}

		debug!("destroying thread {tid}");
		{
			let mut guard = self.lock_scheduler();
			let s = guard.state();
			thread::release_held_locks(self, s, tid);
			debug_assert!(!s.thread(tid).is_runnable());
			s.threads.remove(&tid);
		}
		self.shared_threads.lock().remove(&tid);

		// Unwind the backing fiber, if it never got the chance to exit.
		if let Some(fiber) = shared.host_context.get() {
			fiber.shutdown();
			fiber.join();
		}
	}

	// Boot, timers, shutdown.

	/// Creates the per-core idle threads and switcher fibers, then spawns
	/// and releases the core host threads.
	pub fn start(self: &Arc<Self>) {
		assert!(self.process.get().is_some(), "no process initialized");
		assert!(!self.started.swap(true, Ordering::SeqCst), "already started");
		self.register_host_thread();

		for core in 0..NUM_CPU_CORES {
			let idle_tid = self.allocate_thread_id();
			let shared = Arc::new(ThreadShared::new(idle_tid, ThreadKind::Idle, 0, core as i32));

			let weak = Arc::downgrade(self);
			let idle_fiber = Fiber::spawn(&format!("IdleThread_{core}"), move |me| {
				cpu_manager::idle_thread_main(weak, me, idle_tid);
			});
			assert!(shared.host_context.set(idle_fiber).is_ok());

			self.shared_threads.lock().insert(idle_tid, shared.clone());
			{
				let mut guard = self.lock_scheduler();
				guard.state().threads.insert(
					idle_tid,
					Thread::new(
						shared,
						IDLE_THREAD_PRIORITY,
						core as i32,
						AffinityMask::single(core as i32),
					),
				);
			}

			let cc = self.core(core);
			assert!(cc.idle_thread.set(idle_tid).is_ok());
			cc.current_thread.store(idle_tid.to_raw(), Ordering::SeqCst);
			cc.needs_scheduling.store(true, Ordering::SeqCst);

			let weak = Arc::downgrade(self);
			let switch_fiber = Fiber::spawn(&format!("CoreSwitcher_{core}"), move |me| {
				scheduler::switch_fiber_main(weak, core, me);
			});
			assert!(cc.switch_fiber.set(switch_fiber).is_ok());
		}

		cpu_manager::start(self);

		// Arm the preemption tick.
		self.host_timer.set_oneshot(
			TimerSource::Preemption,
			Some(self.tick.now_ns() + PREEMPTION_INTERVAL_NS),
		);

		info!(
			"kernel started with {} core thread(s)",
			if self.single_core { 1 } else { NUM_CPU_CORES }
		);
	}

	pub(crate) fn on_hardware_timer_interrupt(&self) {
		self.register_host_thread();
		crate::scheduler::timer::on_host_timer_interrupt(self);
	}

	pub(crate) fn on_preemption_tick(&self) {
		self.register_host_thread();
		{
			let mut guard = self.lock_scheduler();
			scheduler::preempt_threads(self, guard.state());
		}

		if !self.is_shutting_down() {
			self.host_timer.set_oneshot(
				TimerSource::Preemption,
				Some(self.tick.now_ns() + PREEMPTION_INTERVAL_NS),
			);
		}
	}

	/// Single-core mode: rotate execution to the next emulated core.
	pub(crate) fn advance_single_core(&self) {
		let next = (self.single_core_current.load(Ordering::SeqCst) + 1) % NUM_CPU_CORES;
		self.single_core_current.store(next, Ordering::SeqCst);
		scheduler::preempt_single_core(self, next);
	}

	/// Suspends (or resumes) every user thread, for emulation pause.
	pub fn set_emulation_paused(&self, paused: bool) {
		self.register_host_thread();
		let mut guard = self.lock_scheduler();
		let s = guard.state();

		let user_threads: Vec<ThreadId> = s
			.threads
			.iter()
			.filter(|(_, t)| t.shared.kind == ThreadKind::User)
			.map(|(&tid, _)| tid)
			.collect();
		for tid in user_threads {
			if paused {
				thread::request_suspend(self, s, tid, thread::SuspendType::System);
			} else {
				thread::resume(self, s, tid, thread::SuspendType::System);
			}
		}
	}

	/// Stops the cores, the timer and the worker, and unwinds every fiber.
	/// The interleaving: raise `shutting_down`, interrupt every core, and
	/// let each core's loop yield back to its host thread at the next
	/// interrupt.
	pub fn shutdown(self: &Arc<Self>) {
		if self.shutting_down.swap(true, Ordering::SeqCst) {
			return;
		}
		self.register_host_thread();
		if let Some(process) = self.try_process() {
			process.set_terminating();
		}

		// Wake the worker so it can observe the flag.
		{
			let mut guard = self.lock_scheduler();
			let s = guard.state();
			self.worker.notify_shutdown(self, s);
		}

		if self.started.load(Ordering::SeqCst) {
			interrupts::send_inter_processor_interrupt(self, (1 << NUM_CPU_CORES) - 1);
			for handle in self.core_threads.lock().drain(..) {
				let _ = handle.join();
			}
		}

		self.host_timer.shutdown();
		if let Some(handle) = self.timer_thread.lock().take() {
			let _ = handle.join();
		}

		self.worker.join();

		// Unwind whatever fibers are still parked.
		let fibers: Vec<Arc<Fiber>> = {
			let shared = self.shared_threads.lock();
			shared
				.values()
				.filter_map(|s| s.host_context.get().cloned())
				.collect()
		};
		for fiber in &fibers {
			fiber.shutdown();
		}
		for fiber in &fibers {
			fiber.join();
		}
		for core in 0..NUM_CPU_CORES {
			if let Some(fiber) = self.core(core).switch_fiber.get() {
				fiber.shutdown();
				fiber.join();
			}
		}

		info!("kernel shut down");
	}

	pub(crate) fn register_core_thread(&self, handle: JoinHandle<()>) {
		self.core_threads.lock().push(handle);
	}
}
