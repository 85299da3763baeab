//! The emulated process. Process creation is outside this crate's scope,
//! so the kernel hosts exactly one: it owns the guest memory, the
//! exclusive monitor, the per-core ISA executors and the handle table.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::arm::{ArmInterface, ExclusiveMonitor, GuestMemory};
use crate::config::NUM_CPU_CORES;
use crate::kernel::handle_table::HandleTable;

pub struct Process {
	memory: Arc<dyn GuestMemory>,
	monitor: Box<dyn ExclusiveMonitor>,
	arm_interfaces: Vec<Box<dyn ArmInterface>>,
	handle_table: HandleTable,
	scheduled_count: AtomicU64,
	running_threads: AtomicI32,
	terminating: AtomicBool,
}

impl Process {
	/// `arm_interfaces` must hold one executor per emulated core.
	pub fn new(
		memory: Arc<dyn GuestMemory>,
		monitor: Box<dyn ExclusiveMonitor>,
		arm_interfaces: Vec<Box<dyn ArmInterface>>,
	) -> Self {
		assert_eq!(arm_interfaces.len(), NUM_CPU_CORES);
		Self {
			memory,
			monitor,
			arm_interfaces,
			handle_table: HandleTable::new(0).unwrap(),
			scheduled_count: AtomicU64::new(0),
			running_threads: AtomicI32::new(0),
			terminating: AtomicBool::new(false),
		}
	}

	pub fn memory(&self) -> &dyn GuestMemory {
		&*self.memory
	}

	pub fn monitor(&self) -> &dyn ExclusiveMonitor {
		&*self.monitor
	}

	pub fn arm_interface(&self, core: usize) -> &dyn ArmInterface {
		&*self.arm_interfaces[core]
	}

	pub fn handle_table(&self) -> &HandleTable {
		&self.handle_table
	}

	/// Bumped whenever scheduling touches one of the process's threads;
	/// the yield fast paths compare against it.
	pub(crate) fn scheduled_count(&self) -> u64 {
		self.scheduled_count.load(Ordering::SeqCst)
	}

	pub(crate) fn increment_scheduled_count(&self) {
		self.scheduled_count.fetch_add(1, Ordering::SeqCst);
	}

	pub(crate) fn increment_running_threads(&self) {
		self.running_threads.fetch_add(1, Ordering::SeqCst);
	}

	pub(crate) fn decrement_running_threads(&self) {
		self.running_threads.fetch_sub(1, Ordering::SeqCst);
	}

	pub fn running_thread_count(&self) -> i32 {
		self.running_threads.load(Ordering::SeqCst)
	}

	pub fn is_terminating(&self) -> bool {
		self.terminating.load(Ordering::SeqCst)
	}

	pub(crate) fn set_terminating(&self) {
		self.terminating.store(true, Ordering::SeqCst);
	}
}
