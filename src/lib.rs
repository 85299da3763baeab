//! nx-kernel is the HLE kernel core of an ARMv8 game-console emulator:
//! the scheduler, the hardware-timer-driven wait machinery, the
//! synchronization primitives that schedule on top of it and the
//! inter-core context switching that multiplexes guest threads onto
//! host-backed virtual CPUs using fibers.
//!
//! The crate deliberately does not execute guest code. The embedder
//! supplies an [`arm::ArmInterface`] per emulated core, guest memory and
//! an exclusive monitor, and drives the kernel through [`KernelCore`] and
//! the [`syscalls`] surface.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nx_kernel::arm::{ReservationMonitor, SharedMemory};
//! use nx_kernel::{KernelCore, Process};
//!
//! # fn executors() -> Vec<Box<dyn nx_kernel::arm::ArmInterface>> { unimplemented!() }
//! let memory = Arc::new(SharedMemory::new(0x10000));
//! let monitor = Box::new(ReservationMonitor::new(memory.clone()));
//!
//! let kernel = KernelCore::new();
//! kernel.set_process(Process::new(memory, monitor, executors()));
//! kernel.start();
//!
//! let main_thread = kernel.create_thread(44, 0, 0b0001, 0).unwrap();
//! kernel.register_host_thread();
//! kernel.start_thread(main_thread).unwrap();
//! ```

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod arm;
mod collections;
pub mod config;
pub mod fiber;
mod kernel;
pub mod logging;
mod result;
mod scheduler;
mod synch;
pub mod syscalls;
mod time;

pub use kernel::handle_table::{
	Handle, HandleTable, KernelObject, PSEUDO_HANDLE_CURRENT_PROCESS,
	PSEUDO_HANDLE_CURRENT_THREAD,
};
pub use kernel::process::Process;
pub use kernel::KernelCore;
pub use result::{SvcError, SvcResult};
pub use scheduler::thread::{SuspendType, ThreadId, ThreadState};
pub use synch::event::EventId;
pub use time::TickSource;

#[cfg(test)]
mod tests;
