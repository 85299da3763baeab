//! End-to-end tests booting the full multicore kernel with a scripted
//! guest executor: guest "programs" are queues of operations (SVCs and
//! memory stores) consumed by `run_thread`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nx_kernel::arm::{
	ArmInterface, GuestMemory, HaltReason, ReservationMonitor, SharedMemory, ThreadContext,
};
use nx_kernel::syscalls;
use nx_kernel::{KernelCore, KernelObject, Process, ThreadId};

enum GuestOp {
	Svc { number: u32, args: [u64; 8] },
	WriteMemory { addr: u64, value: u32 },
}

#[derive(Default)]
struct ScriptState {
	programs: Mutex<HashMap<u64, VecDeque<GuestOp>>>,
	/// (thread id, svc number, result register) per completed SVC.
	results: Mutex<Vec<(u64, u32, u64)>>,
}

impl ScriptState {
	fn push_program(&self, thread: ThreadId, ops: Vec<GuestOp>) {
		self.programs
			.lock()
			.unwrap()
			.insert(thread.to_raw(), ops.into());
	}

	fn results_for(&self, thread: ThreadId) -> Vec<(u32, u64)> {
		self.results
			.lock()
			.unwrap()
			.iter()
			.filter(|(tid, _, _)| *tid == thread.to_raw())
			.map(|&(_, number, result)| (number, result))
			.collect()
	}
}

/// One scripted executor per emulated core.
struct ScriptedExecutor {
	state: Arc<ScriptState>,
	memory: Arc<SharedMemory>,
	interrupted: AtomicBool,
	current_svc: Mutex<(u32, [u64; 8])>,
	current_thread: Mutex<u64>,
}

impl ScriptedExecutor {
	fn new(state: Arc<ScriptState>, memory: Arc<SharedMemory>) -> Self {
		Self {
			state,
			memory,
			interrupted: AtomicBool::new(false),
			current_svc: Mutex::new((0, [0; 8])),
			current_thread: Mutex::new(0),
		}
	}
}

impl ArmInterface for ScriptedExecutor {
	fn run_thread(&self, thread: ThreadId) -> HaltReason {
		*self.current_thread.lock().unwrap() = thread.to_raw();

		loop {
			// Safe point: interrupts break the loop between operations.
			if self.interrupted.swap(false, Ordering::SeqCst) {
				return HaltReason::BREAK_LOOP;
			}

			let op = self
				.state
				.programs
				.lock()
				.unwrap()
				.get_mut(&thread.to_raw())
				.and_then(|program| program.pop_front());

			match op {
				Some(GuestOp::Svc { number, args }) => {
					*self.current_svc.lock().unwrap() = (number, args);
					return HaltReason::SUPERVISOR_CALL;
				}
				Some(GuestOp::WriteMemory { addr, value }) => {
					self.memory.write32(addr, value);
				}
				None => {
					// Out of script; idle politely until interrupted.
					std::thread::sleep(Duration::from_micros(100));
					return HaltReason::BREAK_LOOP;
				}
			}
		}
	}

	fn step_thread(&self, _thread: ThreadId) -> HaltReason {
		HaltReason::STEP_THREAD
	}

	fn get_context(&self, _ctx: &mut ThreadContext) {}
	fn set_context(&self, _ctx: &ThreadContext) {}

	fn signal_interrupt(&self, _thread: Option<ThreadId>) {
		self.interrupted.store(true, Ordering::SeqCst);
	}

	fn lock_thread(&self, _thread: ThreadId) {}
	fn unlock_thread(&self, _thread: ThreadId) {}
	fn set_tpidrro_el0(&self, _value: u64) {}

	fn svc_number(&self) -> u32 {
		self.current_svc.lock().unwrap().0
	}

	fn svc_arguments(&self) -> [u64; 8] {
		self.current_svc.lock().unwrap().1
	}

	fn set_svc_arguments(&self, args: [u64; 8]) {
		let (number, _) = *self.current_svc.lock().unwrap();
		let thread = *self.current_thread.lock().unwrap();
		self.state.results.lock().unwrap().push((thread, number, args[0]));
	}
}

const SVC_SLEEP_THREAD: u32 = 0x0B;
const SVC_EXIT_THREAD: u32 = 0x0A;
const SVC_GET_CURRENT_PROCESSOR_NUMBER: u32 = 0x10;
const SVC_WAIT_FOR_ADDRESS: u32 = 0x34;
const SVC_SIGNAL_TO_ADDRESS: u32 = 0x35;

fn svc(number: u32, args: [u64; 8]) -> GuestOp {
	GuestOp::Svc { number, args }
}

fn boot() -> (Arc<KernelCore>, Arc<SharedMemory>, Arc<ScriptState>) {
	let memory = Arc::new(SharedMemory::new(0x10000));
	let monitor = Box::new(ReservationMonitor::new(memory.clone()));
	let state = Arc::new(ScriptState::default());

	let executors: Vec<Box<dyn ArmInterface>> = (0..4)
		.map(|_| {
			Box::new(ScriptedExecutor::new(state.clone(), memory.clone()))
				as Box<dyn ArmInterface>
		})
		.collect();

	let kernel = KernelCore::new();
	kernel.set_process(Process::new(memory.clone(), monitor, executors));
	kernel.start();
	kernel.register_host_thread();

	(kernel, memory, state)
}

fn join_threads(kernel: &KernelCore, threads: &[ThreadId]) {
	let table = kernel.process().handle_table();
	for &tid in threads {
		let handle = table.add(KernelObject::Thread(tid)).unwrap();
		let result = syscalls::wait_synchronization(kernel, &[handle], 10_000_000_000);
		assert_eq!(result, Ok(0), "thread {tid} did not exit in time");
	}
}

#[test]
fn guest_threads_signal_each_other_across_cores() {
	let (kernel, memory, state) = boot();

	let waiter = kernel.create_thread(30, 1, 0b0010, 0).unwrap();
	let signaler = kernel.create_thread(30, 0, 0b0001, 0).unwrap();

	// The waiter sleeps on the word; the signaler wakes it from another
	// core after a short guest sleep.
	state.push_program(
		waiter,
		vec![
			svc(SVC_WAIT_FOR_ADDRESS, [0x100, 2, 0, u64::MAX, 0, 0, 0, 0]),
			svc(SVC_EXIT_THREAD, [0; 8]),
		],
	);
	state.push_program(
		signaler,
		vec![
			svc(SVC_SLEEP_THREAD, [2_000_000, 0, 0, 0, 0, 0, 0, 0]),
			svc(SVC_SIGNAL_TO_ADDRESS, [0x100, 0, 0, 1, 0, 0, 0, 0]),
			svc(SVC_EXIT_THREAD, [0; 8]),
		],
	);

	kernel.start_thread(waiter).unwrap();
	kernel.start_thread(signaler).unwrap();

	join_threads(&kernel, &[waiter, signaler]);

	// The waiter's WaitForAddress completed successfully.
	let waiter_results = state.results_for(waiter);
	assert_eq!(waiter_results, vec![(SVC_WAIT_FOR_ADDRESS, 0)]);

	// The signaler's sleep and signal both succeeded.
	let signaler_results = state.results_for(signaler);
	assert_eq!(
		signaler_results,
		vec![(SVC_SLEEP_THREAD, 0), (SVC_SIGNAL_TO_ADDRESS, 0)]
	);

	assert_eq!(memory.read32(0x100), Some(0));
	kernel.shutdown();
}

#[test]
fn threads_run_on_their_assigned_cores() {
	let (kernel, memory, state) = boot();

	let mut threads = Vec::new();
	for core in 0..4u64 {
		let tid = kernel
			.create_thread(40, core as i32, 1 << core, 0)
			.unwrap();
		state.push_program(
			tid,
			vec![
				svc(SVC_GET_CURRENT_PROCESSOR_NUMBER, [0; 8]),
				GuestOp::WriteMemory {
					addr: 0x200 + core * 4,
					value: 0xA0 + core as u32,
				},
				svc(SVC_EXIT_THREAD, [0; 8]),
			],
		);
		threads.push(tid);
	}

	for &tid in &threads {
		kernel.start_thread(tid).unwrap();
	}
	join_threads(&kernel, &threads);

	for (core, &tid) in threads.iter().enumerate() {
		let results = state.results_for(tid);
		assert_eq!(
			results,
			vec![(SVC_GET_CURRENT_PROCESSOR_NUMBER, core as u64)],
			"thread pinned to core {core} ran elsewhere"
		);
		assert_eq!(memory.read32(0x200 + core as u64 * 4), Some(0xA0 + core as u32));
	}

	kernel.shutdown();
}

#[test]
fn many_threads_share_one_core_fairly() {
	let (kernel, memory, state) = boot();

	// Six equal-priority threads on core 2; each stamps its slot and
	// yields, repeatedly, then exits.
	let mut threads = Vec::new();
	for i in 0..6u64 {
		let tid = kernel.create_thread(44, 2, 0b0100, 0).unwrap();
		let mut ops = Vec::new();
		for _ in 0..8 {
			ops.push(GuestOp::WriteMemory {
				addr: 0x300 + i * 4,
				value: 1,
			});
			// SleepThread(0) = yield without core migration.
			ops.push(svc(SVC_SLEEP_THREAD, [0; 8]));
		}
		ops.push(svc(SVC_EXIT_THREAD, [0; 8]));
		state.push_program(tid, ops);
		threads.push(tid);
	}

	for &tid in &threads {
		kernel.start_thread(tid).unwrap();
	}
	join_threads(&kernel, &threads);

	for i in 0..6u64 {
		assert_eq!(memory.read32(0x300 + i * 4), Some(1));
	}

	kernel.shutdown();
}
