//! Scenario tests for the scheduling core. Host test threads register as
//! dummy threads, so the wait paths below block and wake through the same
//! machinery guest threads use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use crate::arm::{
	ArmInterface, GuestMemory, HaltReason, ReservationMonitor, SharedMemory, ThreadContext,
};
use crate::kernel::handle_table::KernelObject;
use crate::kernel::process::Process;
use crate::kernel::KernelCore;
use crate::result::SvcError;
use crate::scheduler::thread::{self, ThreadId, ThreadState};
use crate::scheduler;
use crate::synch::light_lock::LightLock;
use crate::syscalls;

/// Minimal executor for tests that never run guest code.
struct NullExecutor;

impl ArmInterface for NullExecutor {
	fn run_thread(&self, _thread: ThreadId) -> HaltReason {
		HaltReason::BREAK_LOOP
	}

	fn step_thread(&self, _thread: ThreadId) -> HaltReason {
		HaltReason::STEP_THREAD
	}

	fn get_context(&self, _ctx: &mut ThreadContext) {}
	fn set_context(&self, _ctx: &ThreadContext) {}
	fn signal_interrupt(&self, _thread: Option<ThreadId>) {}
	fn lock_thread(&self, _thread: ThreadId) {}
	fn unlock_thread(&self, _thread: ThreadId) {}
	fn set_tpidrro_el0(&self, _value: u64) {}

	fn svc_number(&self) -> u32 {
		0
	}

	fn svc_arguments(&self) -> [u64; 8] {
		[0; 8]
	}

	fn set_svc_arguments(&self, _args: [u64; 8]) {}
}

fn test_kernel() -> (Arc<KernelCore>, Arc<SharedMemory>) {
	let memory = Arc::new(SharedMemory::new(0x10000));
	let monitor = Box::new(ReservationMonitor::new(memory.clone()));
	let executors: Vec<Box<dyn ArmInterface>> =
		(0..4).map(|_| Box::new(NullExecutor) as Box<dyn ArmInterface>).collect();

	let kernel = KernelCore::new();
	kernel.set_process(Process::new(memory.clone(), monitor, executors));
	kernel.register_host_thread();
	(kernel, memory)
}

fn set_priority(kernel: &KernelCore, tid: ThreadId, priority: i32) {
	let mut guard = kernel.lock_scheduler();
	let s = guard.state();
	s.thread_mut(tid).base_priority = priority;
	s.thread_mut(tid).priority = priority;
}

/// Polls a predicate on the kernel state until it holds or a deadline
/// passes.
fn wait_until(kernel: &KernelCore, mut predicate: impl FnMut(&mut crate::kernel::KernelState) -> bool) {
	let deadline = Instant::now() + Duration::from_secs(5);
	loop {
		{
			let mut guard = kernel.lock_scheduler();
			if predicate(guard.state()) {
				return;
			}
		}
		assert!(Instant::now() < deadline, "condition did not hold in time");
		std::thread::yield_now();
	}
}

#[test]
fn priority_inheritance_is_transitive() {
	let (kernel, _memory) = test_kernel();

	let t1 = kernel.create_thread(10, 0, 0b0001, 0).unwrap();
	let t2 = kernel.create_thread(20, 0, 0b0001, 0).unwrap();
	let t3 = kernel.create_thread(30, 0, 0b0001, 0).unwrap();

	{
		let mut guard = kernel.lock_scheduler();
		let s = guard.state();

		// T2 blocks on a lock held by T3.
		s.thread_mut(t2).set_kernel_address_key(0x2000);
		thread::add_waiter(&kernel, s, t3, t2);
		assert_eq!(s.thread(t3).priority, 20);

		// T1 blocks on a lock held by T2: the boost flows through to T3.
		s.thread_mut(t1).set_kernel_address_key(0x1000);
		thread::add_waiter(&kernel, s, t2, t1);
		assert_eq!(s.thread(t2).priority, 10);
		assert_eq!(s.thread(t3).priority, 10);

		// T1 ceases to wait: T3's priority is recomputed from T2 alone.
		thread::remove_waiter(&kernel, s, t2, t1);
		assert_eq!(s.thread(t2).priority, 20);
		assert_eq!(s.thread(t3).priority, 20);

		thread::remove_waiter(&kernel, s, t3, t2);
		assert_eq!(s.thread(t3).priority, 30);
	}

	kernel.shutdown();
}

#[test]
fn light_lock_contention_boosts_and_restores_the_owner() {
	let (kernel, _memory) = test_kernel();
	let lock = Arc::new(LightLock::new());

	let a_holds = Arc::new(Barrier::new(2));
	let release_a = Arc::new(AtomicBool::new(false));
	let b_locked = Arc::new(AtomicBool::new(false));

	let thread_a = {
		let kernel = kernel.clone();
		let lock = lock.clone();
		let a_holds = a_holds.clone();
		let release_a = release_a.clone();
		std::thread::spawn(move || {
			let tid = kernel.register_host_thread();
			set_priority(&kernel, tid, 40);

			lock.lock(&kernel);
			a_holds.wait();
			while !release_a.load(Ordering::SeqCst) {
				std::thread::yield_now();
			}
			lock.unlock(&kernel);

			// Back at base priority once the waiter is gone.
			let mut guard = kernel.lock_scheduler();
			assert_eq!(guard.state().thread(tid).priority, 40);
			tid
		})
	};

	a_holds.wait();

	let thread_b = {
		let kernel = kernel.clone();
		let lock = lock.clone();
		let b_locked = b_locked.clone();
		std::thread::spawn(move || {
			let tid = kernel.register_host_thread();
			set_priority(&kernel, tid, 20);

			lock.lock(&kernel);
			b_locked.store(true, Ordering::SeqCst);
			lock.unlock(&kernel);
			tid
		})
	};

	// B enqueues on the lock and boosts A to priority 20.
	let a_tid = {
		let deadline = Instant::now() + Duration::from_secs(5);
		loop {
			{
				let mut guard = kernel.lock_scheduler();
				let s = guard.state();
				let boosted = s
					.threads
					.iter()
					.find(|(_, t)| t.base_priority == 40 && t.priority == 20);
				if let Some((&tid, _)) = boosted {
					break tid;
				}
			}
			assert!(Instant::now() < deadline, "owner was never boosted");
			std::thread::yield_now();
		}
	};

	release_a.store(true, Ordering::SeqCst);
	let joined_a = thread_a.join().unwrap();
	thread_b.join().unwrap();
	assert_eq!(joined_a, a_tid);
	assert!(b_locked.load(Ordering::SeqCst));

	kernel.shutdown();
}

#[test]
fn arbiter_decrements_and_signals() {
	let (kernel, memory) = test_kernel();
	memory.write32(0x1000, 5);

	let waiter = {
		let kernel = kernel.clone();
		std::thread::spawn(move || {
			kernel.register_host_thread();
			syscalls::wait_for_address(
				&kernel,
				0x1000,
				syscalls::ArbitrationType::DecrementAndWaitIfLessThan as u32,
				10,
				-1,
			)
		})
	};

	// The waiter decrements the word and goes to sleep in the arbiter tree.
	wait_until(&kernel, |s| s.arbiter_tree.len() == 1);
	assert_eq!(memory.read32(0x1000), Some(4));

	syscalls::signal_to_address(&kernel, 0x1000, syscalls::SignalType::Signal as u32, 0, 1)
		.unwrap();
	assert_eq!(waiter.join().unwrap(), Ok(()));
	assert_eq!(memory.read32(0x1000), Some(4));

	// Word 4, value 3: not less than, so the wait fails immediately.
	let result = syscalls::wait_for_address(
		&kernel,
		0x1000,
		syscalls::ArbitrationType::DecrementAndWaitIfLessThan as u32,
		3,
		-1,
	);
	assert_eq!(result, Err(SvcError::InvalidState));
	assert_eq!(memory.read32(0x1000), Some(4));

	kernel.shutdown();
}

#[test]
fn condvar_signals_one_waiter_and_hands_off_the_mutex() {
	let (kernel, memory) = test_kernel();

	const MUTEX: u64 = 0x2000;
	const KEY: u64 = 0x2100;

	// Each waiter takes the mutex uncontended, waits on the key, and once
	// woken holds the mutex until told to release it.
	let spawn_waiter = |name: &str, release: Arc<AtomicBool>| {
		let kernel = kernel.clone();
		let memory = memory.clone();
		std::thread::Builder::new()
			.name(name.into())
			.spawn(move || {
				let tid = kernel.register_host_thread();
				let handle = kernel
					.process()
					.handle_table()
					.add(KernelObject::Thread(tid))
					.unwrap();

				assert!(memory.write32(MUTEX, handle));
				let result =
					syscalls::wait_process_wide_key_atomic(&kernel, MUTEX, KEY, handle, -1);

				while !release.load(Ordering::SeqCst) {
					std::thread::yield_now();
				}
				syscalls::arbitrate_unlock(&kernel, MUTEX).unwrap();
				(handle, result)
			})
			.unwrap()
	};

	let release_a = Arc::new(AtomicBool::new(false));
	let release_b = Arc::new(AtomicBool::new(false));

	let waiter_a = spawn_waiter("waiter_a", release_a.clone());
	// Ensure A enqueues first so FIFO order at equal priority is known.
	wait_until(&kernel, |s| s.condvar_tree.len() == 1);
	let waiter_b = spawn_waiter("waiter_b", release_b.clone());
	wait_until(&kernel, |s| s.condvar_tree.len() == 2);

	// Both waits released the mutex and flagged the key as contended.
	assert_eq!(memory.read32(MUTEX), Some(0));
	assert_eq!(memory.read32(KEY), Some(1));

	// Wake exactly one waiter: the earlier one takes the free mutex.
	syscalls::signal_process_wide_key(&kernel, KEY, 1);
	wait_until(&kernel, |s| s.condvar_tree.len() == 1);

	let handle_a = memory.read32(MUTEX).unwrap();
	assert_ne!(handle_a, 0);
	assert_eq!(handle_a & crate::synch::condvar::HANDLE_WAIT_MASK, 0);
	// The remaining waiter keeps the key's waiter flag set.
	assert_eq!(memory.read32(KEY), Some(1));

	// Wake B: the mutex is held by A, so B chains onto A's ownership and
	// the tag gains the waiter bit while B stays asleep.
	syscalls::signal_process_wide_key(&kernel, KEY, 1);
	wait_until(&kernel, |s| s.condvar_tree.is_empty());
	wait_until(&kernel, |s| {
		s.threads
			.values()
			.any(|t| t.is_dummy() && t.waiting_lock.is_some())
	});
	assert_eq!(
		memory.read32(MUTEX),
		Some(handle_a | crate::synch::condvar::HANDLE_WAIT_MASK)
	);

	// A releases the mutex: B becomes the owner and returns successfully.
	release_a.store(true, Ordering::SeqCst);
	let (joined_a, result_a) = waiter_a.join().unwrap();
	assert_eq!(joined_a, handle_a);
	assert_eq!(result_a, Ok(()));

	wait_until(&kernel, |s| {
		s.threads.values().all(|t| t.waiting_lock.is_none())
	});
	let handle_b = memory.read32(MUTEX).unwrap();
	assert_ne!(handle_b & !crate::synch::condvar::HANDLE_WAIT_MASK, 0);
	assert_ne!(handle_b, handle_a);

	release_b.store(true, Ordering::SeqCst);
	let (_joined_b, result_b) = waiter_b.join().unwrap();
	assert_eq!(result_b, Ok(()));
	assert_eq!(memory.read32(MUTEX), Some(0));

	kernel.shutdown();
}

#[test]
fn preemption_rotation_moves_the_head_back() {
	let (kernel, _memory) = test_kernel();

	let t1 = kernel.create_thread(44, 0, 0b0001, 0).unwrap();
	let t2 = kernel.create_thread(44, 0, 0b0001, 0).unwrap();
	let t3 = kernel.create_thread(44, 0, 0b0001, 0).unwrap();

	for tid in [t1, t2, t3] {
		kernel.start_thread(tid).unwrap();
	}

	{
		let mut guard = kernel.lock_scheduler();
		let s = guard.state();
		assert_eq!(s.queue.scheduled_front_at(0, 44), Some(t1));

		scheduler::rotate_scheduled_queue(&kernel, s, 0, 44);

		assert_eq!(s.queue.scheduled_front_at(0, 44), Some(t2));
		assert_eq!(s.queue.same_priority_next(&s.threads, 0, t2), Some(t3));
		assert_eq!(s.queue.same_priority_next(&s.threads, 0, t3), Some(t1));
	}

	kernel.shutdown();
}

#[test]
fn idle_core_pulls_a_suggested_thread_over() {
	let (kernel, _memory) = test_kernel();

	// A high-priority thread owns core 0; T_X sits behind it with affinity
	// for cores 0 and 1. Core 1 is idle.
	let hog = kernel.create_thread(10, 0, 0b0001, 0).unwrap();
	let tx = kernel.create_thread(30, 0, 0b0011, 0).unwrap();

	kernel.start_thread(hog).unwrap();
	kernel.start_thread(tx).unwrap();

	{
		let mut guard = kernel.lock_scheduler();
		let s = guard.state();

		// The update at the last lock release already walked core 1's
		// suggested queue and migrated T_X; re-running it is stable.
		s.update_needed = true;
		scheduler::update_highest_priority_threads(&kernel, s);

		assert_eq!(s.thread(tx).active_core, 1);
		assert_eq!(s.queue.scheduled_front(1), Some(tx));
		assert_eq!(s.queue.suggested_front(0), Some(tx));
		assert_eq!(
			kernel.core(1).highest_priority_thread.load(Ordering::SeqCst),
			tx.to_raw()
		);
	}

	kernel.shutdown();
}

#[test]
fn arbiter_wait_times_out_through_the_hardware_timer() {
	let (kernel, memory) = test_kernel();
	memory.write32(0x3000, 7);

	let started = Instant::now();
	let result = syscalls::wait_for_address(
		&kernel,
		0x3000,
		syscalls::ArbitrationType::WaitIfEqual as u32,
		7,
		1_000_000,
	);

	assert_eq!(result, Err(SvcError::TimedOut));
	assert!(started.elapsed() >= Duration::from_millis(1));

	// The timed-out thread is off the tree and runnable again.
	{
		let mut guard = kernel.lock_scheduler();
		let s = guard.state();
		assert!(s.arbiter_tree.is_empty());
		let tid = kernel.current_thread_id();
		assert_eq!(s.thread(tid).state(), ThreadState::Runnable);
		assert_eq!(s.thread(tid).wake_time, 0);
	}

	kernel.shutdown();
}

#[test]
fn sleep_wakes_in_timeout_order() {
	let (kernel, _memory) = test_kernel();

	let order = Arc::new(hermit_sync::SpinMutex::new(Vec::new()));
	let start = Arc::new(Barrier::new(2));
	let mut sleepers = Vec::new();
	for (i, ns) in [(0u64, 40_000_000i64), (1, 10_000_000)] {
		let kernel = kernel.clone();
		let order = order.clone();
		let start = start.clone();
		sleepers.push(std::thread::spawn(move || {
			kernel.register_host_thread();
			start.wait();
			thread::sleep(
				&kernel,
				kernel.tick_source().now_ns() + ns,
			)
			.unwrap();
			order.lock().push(i);
		}));
	}

	for sleeper in sleepers {
		sleeper.join().unwrap();
	}
	assert_eq!(*order.lock(), vec![1, 0]);

	kernel.shutdown();
}

#[test]
fn wait_synchronization_returns_the_signaled_index() {
	let (kernel, _memory) = test_kernel();

	let (write_handle, read_handle) = syscalls::create_event(&kernel).unwrap();

	// Poll: nothing signaled yet.
	let result = syscalls::wait_synchronization(&kernel, &[read_handle], 0);
	assert_eq!(result, Err(SvcError::TimedOut));

	let signaler = {
		let kernel = kernel.clone();
		std::thread::spawn(move || {
			kernel.register_host_thread();
			std::thread::sleep(Duration::from_millis(2));
			syscalls::signal_event(&kernel, write_handle).unwrap();
		})
	};

	let result = syscalls::wait_synchronization(&kernel, &[read_handle], 1_000_000_000);
	assert_eq!(result, Ok(0));
	signaler.join().unwrap();

	// The event stays signaled until reset.
	assert_eq!(syscalls::wait_synchronization(&kernel, &[read_handle], 0), Ok(0));
	syscalls::reset_signal(&kernel, read_handle).unwrap();
	assert_eq!(
		syscalls::wait_synchronization(&kernel, &[read_handle], 0),
		Err(SvcError::TimedOut)
	);

	syscalls::close_handle(&kernel, write_handle).unwrap();
	syscalls::close_handle(&kernel, read_handle).unwrap();

	kernel.shutdown();
}

#[test]
fn cancel_synchronization_aborts_a_wait() {
	let (kernel, _memory) = test_kernel();

	let (_write_handle, read_handle) = syscalls::create_event(&kernel).unwrap();

	let waiter = {
		let kernel = kernel.clone();
		std::thread::spawn(move || {
			let tid = kernel.register_host_thread();
			let handle = kernel
				.process()
				.handle_table()
				.add(KernelObject::Thread(tid))
				.unwrap();
			let result = syscalls::wait_synchronization(&kernel, &[read_handle], -1);
			(handle, result)
		})
	};

	wait_until(&kernel, |s| {
		s.threads
			.values()
			.any(|t| t.is_dummy() && t.state() == ThreadState::Waiting && t.cancellable)
	});

	// Only the waiter is in a cancellable wait; the worker's wait is not.
	let target = {
		let mut guard = kernel.lock_scheduler();
		let s = guard.state();
		s.threads
			.iter()
			.find(|(_, t)| t.is_dummy() && t.state() == ThreadState::Waiting && t.cancellable)
			.map(|(&tid, _)| tid)
			.unwrap()
	};
	{
		let mut guard = kernel.lock_scheduler();
		thread::wait_cancel(&kernel, guard.state(), target);
	}

	let (_handle, result) = waiter.join().unwrap();
	assert_eq!(result, Err(SvcError::Cancelled));

	kernel.shutdown();
}
