//! Interrupt plumbing: IPIs between emulated cores and the per-core
//! interrupt handler that runs when a guest loop observes its core's
//! interrupt flag.

use crate::config::NUM_CPU_CORES;
use crate::kernel::KernelCore;
use crate::scheduler;
use crate::scheduler::thread::{self, ThreadKind};

/// Guest thread-local-region offsets of the user interrupt protocol: the
/// low halfword at this offset is the user disable count, the high one the
/// kernel's interrupt flag.
const TLR_INTERRUPT_WORD_OFFSET: u64 = 0x100;

pub(crate) fn handle_interrupt(kernel: &KernelCore, core: usize) {
	// Acknowledge the interrupt.
	kernel.core(core).physical.clear_interrupt();

	// If the user disable count is set, the thread asked not to be
	// rescheduled: pin it and raise its interrupt flag instead.
	let cur = kernel.current_thread_shared();
	if cur.kind == ThreadKind::User && cur.tls_address != 0 {
		if let Some(process) = kernel.try_process() {
			let word_addr = cur.tls_address + TLR_INTERRUPT_WORD_OFFSET;
			let disable_count = process
				.memory()
				.read32(word_addr)
				.map_or(0, |word| word & 0xFFFF);

			if disable_count != 0 {
				let mut guard = kernel.lock_scheduler();
				let s = guard.state();
				if s.pinned_threads[core].is_none() {
					thread::pin_current_thread(kernel, s, core as i32);

					// Set the interrupt flag in the thread's local region.
					if let Some(word) = process.memory().read32(word_addr) {
						process.memory().write32(word_addr, word | 0x1_0000);
					}
				}
			}
		}
	}

	scheduler::request_schedule_on_interrupt(kernel, core);
}

pub(crate) fn send_inter_processor_interrupt(kernel: &KernelCore, core_mask: u64) {
	for core in 0..NUM_CPU_CORES {
		if core_mask & (1 << core) != 0 {
			kernel.core(core).physical.interrupt(kernel, core);
		}
	}
}
