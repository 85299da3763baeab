//! One emulated CPU core: owns the guest execution loop and translates
//! halt reasons into scheduler events.

use std::sync::{Condvar, Mutex};

use crate::arm::HaltReason;
use crate::kernel::KernelCore;
use crate::scheduler::thread::{self, StepState, SuspendType, ThreadId};
use crate::syscalls;

struct Inner {
	/// Thread currently inside the executor, for interrupt delivery.
	running_thread: Option<ThreadId>,
	interrupted: bool,
}

pub(crate) struct PhysicalCore {
	inner: Mutex<Inner>,
	on_interrupt: Condvar,
}

impl PhysicalCore {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Inner {
				running_thread: None,
				interrupted: false,
			}),
			on_interrupt: Condvar::new(),
		}
	}

	/// Runs `tid` on this core until it blocks, faults or is interrupted.
	pub fn run_thread(&self, kernel: &KernelCore, core: usize, tid: ThreadId) {
		let process = kernel.process();
		let arm = process.arm_interface(core);

		arm.initialize();

		loop {
			let shared = kernel.thread_shared(tid);

			// A termination DPC ends the thread before it re-enters guest
			// code.
			if shared.has_dpc() && shared.is_termination_requested() {
				thread::exit_current(kernel);
			}

			// A completed single step parks the thread for the debugger.
			if shared.step_state() == StepState::StepPerformed {
				if let Some(debugger) = kernel.debugger() {
					debugger.notify_thread_stopped(tid);
				}
				self.suspend_for_debug(kernel, tid);
				return;
			}

			let halt = {
				// Enter the core context; bail out if an interrupt beat us.
				{
					let mut inner = self.inner.lock().unwrap();
					if inner.interrupted {
						return;
					}
					inner.running_thread = Some(tid);
					arm.lock_thread(tid);
				}

				let halt = if shared.step_state() == StepState::StepPending {
					let halt = arm.step_thread(tid);
					if halt.contains(HaltReason::STEP_THREAD) {
						shared.set_step_state(StepState::StepPerformed);
					}
					halt
				} else {
					arm.run_thread(tid)
				};

				arm.unlock_thread(tid);
				self.inner.lock().unwrap().running_thread = None;

				halt
			};

			// Scheduling may occur below; no cached state survives these
			// calls.
			let supervisor_call = halt.contains(HaltReason::SUPERVISOR_CALL);
			let breakpoint = halt.contains(HaltReason::INSTRUCTION_BREAKPOINT);
			let prefetch_abort = halt.contains(HaltReason::PREFETCH_ABORT);
			let data_abort = halt.contains(HaltReason::DATA_ABORT);
			let interrupt = halt.contains(HaltReason::BREAK_LOOP);

			if breakpoint || prefetch_abort {
				if breakpoint {
					arm.rewind_breakpoint_instruction();
				}
				if let Some(debugger) = kernel.debugger() {
					debugger.notify_thread_stopped(tid);
				}
				self.suspend_for_debug(kernel, tid);
				return;
			}

			if data_abort {
				if let Some(debugger) = kernel.debugger() {
					let watchpoint = arm.halted_watchpoint().unwrap_or(0);
					debugger.notify_thread_watchpoint(tid, watchpoint);
				}
				self.suspend_for_debug(kernel, tid);
				return;
			}

			if supervisor_call {
				syscalls::call(kernel, arm.svc_number());
				return;
			}

			if interrupt || kernel.is_single_core() {
				return;
			}
		}
	}

	fn suspend_for_debug(&self, kernel: &KernelCore, tid: ThreadId) {
		let mut guard = kernel.lock_scheduler();
		thread::request_suspend(kernel, guard.state(), tid, SuspendType::Debug);
	}

	/// Parks the host thread until an interrupt arrives.
	pub fn idle(&self) {
		let mut inner = self.inner.lock().unwrap();
		while !inner.interrupted {
			inner = self.on_interrupt.wait(inner).unwrap();
		}
	}

	pub fn is_interrupted(&self) -> bool {
		self.inner.lock().unwrap().interrupted
	}

	/// Flags the interrupt, wakes the idle loop and kicks the executor off
	/// the running thread, if any.
	pub fn interrupt(&self, kernel: &KernelCore, core: usize) {
		let mut inner = self.inner.lock().unwrap();
		inner.interrupted = true;
		self.on_interrupt.notify_one();

		if let Some(tid) = inner.running_thread {
			if let Some(process) = kernel.try_process() {
				process.arm_interface(core).signal_interrupt(Some(tid));
			}
		}
	}

	pub fn clear_interrupt(&self) {
		self.inner.lock().unwrap().interrupted = false;
	}
}
