//! Interfaces to the collaborators that execute and observe guest code.
//!
//! The kernel core never interprets guest instructions itself; it drives an
//! [`ArmInterface`] and reacts to the halt reason it reports. Guest memory
//! and the LDXR/STXR exclusive monitor are equally behind traits so the
//! synchronization primitives stay independent of the memory system.

pub(crate) mod monitor;

pub use monitor::{ReservationMonitor, SharedMemory};

use crate::scheduler::thread::ThreadId;

bitflags! {
	/// Why a call into the guest returned.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct HaltReason: u64 {
		const STEP_THREAD = 1 << 0;
		const DATA_ABORT = 1 << 1;
		const BREAK_LOOP = 1 << 2;
		const SUPERVISOR_CALL = 1 << 3;
		const INSTRUCTION_BREAKPOINT = 1 << 4;
		const PREFETCH_ABORT = 1 << 5;
	}
}

/// Saved guest CPU state of one thread.
#[derive(Debug, Clone)]
pub struct ThreadContext {
	pub regs: [u64; 31],
	pub sp: u64,
	pub pc: u64,
	pub pstate: u32,
	pub vregs: [u128; 32],
	pub fpcr: u32,
	pub fpsr: u32,
	pub tpidr: u64,
}

impl Default for ThreadContext {
	fn default() -> Self {
		Self {
			regs: [0; 31],
			sp: 0,
			pc: 0,
			pstate: 0,
			vregs: [0; 32],
			fpcr: 0,
			fpsr: 0,
			tpidr: 0,
		}
	}
}

/// One guest ISA executor, bound to one emulated core.
///
/// All methods take `&self`; implementations synchronize internally.
/// [`ArmInterface::signal_interrupt`] in particular is called from other
/// host threads and must make an in-progress [`ArmInterface::run_thread`]
/// return with [`HaltReason::BREAK_LOOP`] at its next safe point.
pub trait ArmInterface: Send + Sync {
	fn initialize(&self) {}

	/// Runs the given thread until it halts.
	fn run_thread(&self, thread: ThreadId) -> HaltReason;

	/// Executes a single instruction of the given thread.
	fn step_thread(&self, thread: ThreadId) -> HaltReason;

	fn get_context(&self, ctx: &mut ThreadContext);
	fn set_context(&self, ctx: &ThreadContext);

	/// Requests the executor to stop; safe to call off-core.
	fn signal_interrupt(&self, thread: Option<ThreadId>);

	/// Pairs with the per-thread context guard: while a thread is locked the
	/// executor may run it; `signal_interrupt` synchronizes with this.
	fn lock_thread(&self, thread: ThreadId);
	fn unlock_thread(&self, thread: ThreadId);

	fn set_tpidrro_el0(&self, value: u64);

	fn svc_number(&self) -> u32;
	fn svc_arguments(&self) -> [u64; 8];
	fn set_svc_arguments(&self, args: [u64; 8]);

	fn clear_instruction_cache(&self) {}
	fn invalidate_cache_range(&self, _addr: u64, _size: u64) {}

	/// Rolls the program counter back over a breakpoint instruction.
	fn rewind_breakpoint_instruction(&self) {}

	/// Address of the watchpoint responsible for a data abort, if any.
	fn halted_watchpoint(&self) -> Option<u64> {
		None
	}
}

/// Guest physical memory as the synchronization primitives see it.
///
/// Accesses return `None`/`false` for unmapped or misaligned addresses;
/// the callers translate that into `InvalidCurrentMemory`.
pub trait GuestMemory: Send + Sync {
	fn read32(&self, addr: u64) -> Option<u32>;
	fn write32(&self, addr: u64, value: u32) -> bool;
}

/// Emulation of the exclusive monitor backing LDXR/STXR sequences.
///
/// `slot` identifies the reserving agent (an emulated core, or a host
/// caller outside any core). A write succeeds only if the slot's
/// reservation from the preceding exclusive read still holds.
pub trait ExclusiveMonitor: Send + Sync {
	fn exclusive_read32(&self, slot: usize, addr: u64) -> Option<u32>;
	fn exclusive_write32(&self, slot: usize, addr: u64, value: u32) -> bool;
	fn clear_exclusive(&self, slot: usize);
}

/// Debugger notifications emitted by the guest run loop.
pub trait Debugger: Send + Sync {
	fn notify_thread_stopped(&self, thread: ThreadId);
	fn notify_thread_watchpoint(&self, thread: ThreadId, watchpoint: u64);
}
