//! Deferred kernel work: the second phase of thread termination runs on a
//! dedicated host thread, once the dying thread is off every core. The
//! queue is protected by a light lock and drained under a light condition
//! variable, so the worker parks as an ordinary dummy-thread waiter.

use std::collections::VecDeque;
use std::sync::Weak;
use std::thread::JoinHandle;

use hermit_sync::SpinMutex;

use crate::kernel::{KernelCore, KernelState};
use crate::scheduler::thread::{self, ThreadId};
use crate::synch::light_lock::{LightCondVar, LightLock};

pub(crate) struct WorkerTaskManager {
	lock: LightLock,
	available: LightCondVar,
	tasks: SpinMutex<VecDeque<ThreadId>>,
	handle: SpinMutex<Option<JoinHandle<()>>>,
}

impl WorkerTaskManager {
	pub fn new() -> Self {
		Self {
			lock: LightLock::new(),
			available: LightCondVar::new(),
			tasks: SpinMutex::new(VecDeque::new()),
			handle: SpinMutex::new(None),
		}
	}

	pub fn spawn(&self, kernel: Weak<KernelCore>) {
		let handle = std::thread::Builder::new()
			.name("KernelWorker".into())
			.spawn(move || Self::run(kernel))
			.unwrap();
		*self.handle.lock() = Some(handle);
	}

	/// Queues the exit task for `tid`. Called under the scheduler lock.
	pub fn queue_exit(&self, kernel: &KernelCore, s: &mut KernelState, tid: ThreadId) {
		self.tasks.lock().push_back(tid);
		self.available.broadcast_with_state(kernel, s);
	}

	/// Wakes the worker so it can observe shutdown. Called under the
	/// scheduler lock.
	pub fn notify_shutdown(&self, kernel: &KernelCore, s: &mut KernelState) {
		self.available.broadcast_with_state(kernel, s);
	}

	pub fn join(&self) {
		if let Some(handle) = self.handle.lock().take() {
			let _ = handle.join();
		}
	}

	fn run(kernel: Weak<KernelCore>) {
		let Some(kernel) = kernel.upgrade() else {
			return;
		};
		kernel.register_host_thread();

		loop {
			let task = {
				let worker = kernel.worker();
				worker.lock.lock(&kernel);
				let task = loop {
					if let Some(task) = worker.tasks.lock().pop_front() {
						break Some(task);
					}
					if kernel.is_shutting_down() {
						break None;
					}
					worker.available.wait(&kernel, &worker.lock, -1, true);
				};
				worker.lock.unlock(&kernel);
				task
			};

			match task {
				Some(tid) => thread::finish_termination(&kernel, tid),
				None => return,
			}
		}
	}
}
