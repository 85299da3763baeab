//! Host threads backing the emulated cores.
//!
//! One host thread is spawned per emulated core (one in total in
//! single-core mode). Each wraps itself in a thread fiber and yields into
//! the scheduler's initial pick; from then on it is only the substrate the
//! guest and idle fibers schedule themselves on. It gets control back when
//! shutdown routes the core's current fiber home.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier, Weak};

use crate::config::NUM_CPU_CORES;
use crate::fiber::Fiber;
use crate::kernel::{interrupts, KernelCore};
use crate::scheduler::thread::ThreadId;

pub(crate) fn start(kernel: &Arc<KernelCore>) {
	let core_count = if kernel.is_single_core() {
		1
	} else {
		NUM_CPU_CORES
	};

	// The extra participant is this (booting) thread.
	let barrier = Arc::new(Barrier::new(core_count + 1));

	for core in 0..core_count {
		let core_kernel = kernel.clone();
		let core_barrier = barrier.clone();
		let name = if core_count == 1 {
			"CPUThread".to_string()
		} else {
			format!("CPUCore_{core}")
		};
		let handle = std::thread::Builder::new()
			.name(name)
			.spawn(move || run_core_thread(core_kernel, core, core_barrier))
			.unwrap();
		kernel.register_core_thread(handle);
	}

	barrier.wait();
}

fn run_core_thread(kernel: Arc<KernelCore>, core: usize, barrier: Arc<Barrier>) {
	let idle = kernel.core(core).idle_thread();
	kernel.bind_host_thread(kernel.thread_shared(idle));

	let host_fiber = Fiber::thread_to_fiber();
	assert!(kernel.core(core).host_fiber.set(host_fiber.clone()).is_ok());

	barrier.wait();

	// Enter the scheduler's current pick; this returns at shutdown.
	let first = kernel
		.core(core)
		.current_thread()
		.expect("core has no initial thread");
	let target = kernel.thread_shared(first).fiber().clone();
	Fiber::yield_to(&host_fiber, &target);

	debug!("core {core} host thread exiting");
	host_fiber.exit();
}

/// Entry of a guest thread's fiber: run the guest until interrupted, then
/// handle the interrupt, forever.
pub(crate) fn guest_thread_main(kernel: Weak<KernelCore>, me: Arc<Fiber>, tid: ThreadId) {
	{
		let Some(kernel) = kernel.upgrade() else {
			return;
		};
		kernel.bind_host_thread(kernel.thread_shared(tid));
		// A freshly scheduled thread starts with dispatch disabled once.
		kernel.set_dispatch_count(1);
		kernel.enable_dispatch();
	}

	loop {
		let Some(kernel) = kernel.upgrade() else {
			return;
		};

		if kernel.is_shutting_down() {
			exit_to_host(&kernel, &me);
		}

		let shared = kernel.thread_shared(tid);
		if kernel.is_single_core() {
			let core = shared.current_core.load(Ordering::SeqCst) as usize;
			if !kernel.core(core).physical.is_interrupted() {
				kernel.core(core).physical.run_thread(&kernel, core, tid);
			}
			kernel.advance_single_core();
			let core = shared.current_core.load(Ordering::SeqCst) as usize;
			interrupts::handle_interrupt(&kernel, core);
		} else {
			let mut core = shared.current_core.load(Ordering::SeqCst) as usize;
			while !kernel.core(core).physical.is_interrupted() {
				kernel.core(core).physical.run_thread(&kernel, core, tid);
				core = shared.current_core.load(Ordering::SeqCst) as usize;
			}
			interrupts::handle_interrupt(&kernel, core);
		}
	}
}

/// Entry of a core's idle fiber: park until interrupted, then let the
/// interrupt handler reschedule.
pub(crate) fn idle_thread_main(kernel: Weak<KernelCore>, me: Arc<Fiber>, tid: ThreadId) {
	{
		let Some(kernel) = kernel.upgrade() else {
			return;
		};
		kernel.bind_host_thread(kernel.thread_shared(tid));
		kernel.set_dispatch_count(1);
		kernel.enable_dispatch();
	}

	loop {
		let Some(kernel) = kernel.upgrade() else {
			return;
		};

		if kernel.is_shutting_down() {
			exit_to_host(&kernel, &me);
		}

		let core = kernel
			.thread_shared(tid)
			.current_core
			.load(Ordering::SeqCst) as usize;
		if !kernel.core(core).physical.is_interrupted() {
			kernel.core(core).physical.idle();
		}
		interrupts::handle_interrupt(&kernel, core);
	}
}

/// Returns the core to its host thread for shutdown. The calling fiber is
/// never scheduled again; it is unwound by the kernel's fiber teardown.
fn exit_to_host(kernel: &Arc<KernelCore>, me: &Arc<Fiber>) -> ! {
	let core = kernel.current_core_id();
	debug_assert!(core >= 0);
	let host = kernel
		.core(core as usize)
		.host_fiber
		.get()
		.expect("core host fiber missing")
		.clone();

	Fiber::yield_to(me, &host);
	unreachable!("shutdown fiber was scheduled again");
}
