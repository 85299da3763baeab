//! Supervisor call entry points and the raw dispatcher.
//!
//! Every call here runs with dispatch enabled until it takes the
//! scheduler lock. Errors are plain return values; a wait path that has
//! already begun sleeping always cancels its pending timer registration
//! before returning an error.

use num_enum::TryFromPrimitive;
use smallvec::SmallVec;

use crate::config::{ARGUMENT_HANDLE_COUNT_MAX, LOWEST_THREAD_PRIORITY, NUM_CPU_CORES};
use crate::kernel::handle_table::{
	Handle, KernelObject, PSEUDO_HANDLE_CURRENT_THREAD,
};
use crate::kernel::KernelCore;
use crate::result::{SvcError, SvcResult};
use crate::scheduler::thread::{self, ThreadId};
use crate::scheduler;
use crate::synch::{arbiter, condvar, event, wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum ArbitrationType {
	WaitIfLessThan = 0,
	DecrementAndWaitIfLessThan = 1,
	WaitIfEqual = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum SignalType {
	Signal = 0,
	SignalAndIncrementIfEqual = 1,
	SignalAndModifyByWaitingCountIfEqual = 2,
}

/// Guest addresses with the top bit set belong to the kernel region.
fn is_kernel_address(addr: u64) -> bool {
	addr >> 63 != 0
}

/// Converts a nanosecond timeout to an absolute wake tick: positive
/// values become `now + ns + 2` (saturating), zero means try-once and
/// negative means wait forever.
fn absolute_timeout(kernel: &KernelCore, timeout_ns: i64) -> i64 {
	if timeout_ns > 0 {
		kernel
			.tick_source()
			.now_ns()
			.checked_add(timeout_ns + 2)
			.unwrap_or(i64::MAX)
	} else {
		timeout_ns
	}
}

/// Resolves a handle, honoring the current-thread pseudo handle.
fn resolve_thread_handle(kernel: &KernelCore, handle: Handle) -> SvcResult<ThreadId> {
	if handle == PSEUDO_HANDLE_CURRENT_THREAD {
		return Ok(kernel.current_thread_id());
	}
	match kernel.process().handle_table().get(handle) {
		Some(KernelObject::Thread(tid)) => Ok(tid),
		_ => Err(SvcError::InvalidHandle),
	}
}

// Address arbiter.

pub fn wait_for_address(
	kernel: &KernelCore,
	address: u64,
	arb_type: u32,
	value: i32,
	timeout_ns: i64,
) -> SvcResult {
	if is_kernel_address(address) {
		return Err(SvcError::InvalidCurrentMemory);
	}
	if address % 4 != 0 {
		return Err(SvcError::InvalidAddress);
	}
	let arb_type = ArbitrationType::try_from(arb_type).map_err(|_| SvcError::InvalidEnumValue)?;

	let timeout = absolute_timeout(kernel, timeout_ns);
	match arb_type {
		ArbitrationType::WaitIfLessThan => {
			arbiter::wait_if_less_than(kernel, address, value, false, timeout)
		}
		ArbitrationType::DecrementAndWaitIfLessThan => {
			arbiter::wait_if_less_than(kernel, address, value, true, timeout)
		}
		ArbitrationType::WaitIfEqual => arbiter::wait_if_equal(kernel, address, value, timeout),
	}
}

pub fn signal_to_address(
	kernel: &KernelCore,
	address: u64,
	signal_type: u32,
	value: i32,
	count: i32,
) -> SvcResult {
	if is_kernel_address(address) {
		return Err(SvcError::InvalidCurrentMemory);
	}
	if address % 4 != 0 {
		return Err(SvcError::InvalidAddress);
	}
	let signal_type = SignalType::try_from(signal_type).map_err(|_| SvcError::InvalidEnumValue)?;

	match signal_type {
		SignalType::Signal => arbiter::signal(kernel, address, count),
		SignalType::SignalAndIncrementIfEqual => {
			arbiter::signal_and_increment_if_equal(kernel, address, value, count)
		}
		SignalType::SignalAndModifyByWaitingCountIfEqual => {
			arbiter::signal_and_modify_by_waiting_count_if_equal(kernel, address, value, count)
		}
	}
}

// Condition variables and user mutexes.

pub fn arbitrate_lock(kernel: &KernelCore, owner_handle: Handle, address: u64, tag: u32) -> SvcResult {
	if is_kernel_address(address) {
		return Err(SvcError::InvalidCurrentMemory);
	}
	if address % 4 != 0 {
		return Err(SvcError::InvalidAddress);
	}

	condvar::wait_for_address(kernel, owner_handle, address, tag)
}

pub fn arbitrate_unlock(kernel: &KernelCore, address: u64) -> SvcResult {
	if is_kernel_address(address) {
		return Err(SvcError::InvalidCurrentMemory);
	}
	if address % 4 != 0 {
		return Err(SvcError::InvalidAddress);
	}

	condvar::signal_to_address(kernel, address)
}

pub fn wait_process_wide_key_atomic(
	kernel: &KernelCore,
	address: u64,
	cv_key: u64,
	tag: u32,
	timeout_ns: i64,
) -> SvcResult {
	if is_kernel_address(address) {
		return Err(SvcError::InvalidCurrentMemory);
	}
	if address % 4 != 0 {
		return Err(SvcError::InvalidAddress);
	}

	let timeout = absolute_timeout(kernel, timeout_ns);
	condvar::wait(kernel, address, cv_key & !3, tag, timeout)
}

pub fn signal_process_wide_key(kernel: &KernelCore, cv_key: u64, count: i32) {
	condvar::signal(kernel, cv_key & !3, count);
}

// Threads.

pub fn create_thread(
	kernel: &KernelCore,
	entry: u64,
	argument: u64,
	stack_top: u64,
	priority: i32,
	ideal_core: i32,
) -> SvcResult<Handle> {
	if !(0..=LOWEST_THREAD_PRIORITY).contains(&priority) {
		return Err(SvcError::InvalidCombination);
	}
	if ideal_core < 0 || ideal_core >= NUM_CPU_CORES as i32 {
		return Err(SvcError::InvalidCombination);
	}

	let tid = kernel.create_thread(priority, ideal_core, 1 << ideal_core, 0)?;

	// Seed the guest context.
	{
		let shared = kernel.thread_shared(tid);
		let mut ctx = shared.guest_context.lock();
		ctx.pc = entry;
		ctx.sp = stack_top;
		ctx.regs[0] = argument;
	}

	kernel.open_object(KernelObject::Thread(tid));
	let handle = match kernel.process().handle_table().add(KernelObject::Thread(tid)) {
		Ok(handle) => handle,
		Err(e) => {
			kernel.close_object(KernelObject::Thread(tid));
			kernel.close_thread(tid);
			return Err(e);
		}
	};
	// Hand the creation reference to the handle.
	kernel.close_thread(tid);
	Ok(handle)
}

pub fn start_thread(kernel: &KernelCore, handle: Handle) -> SvcResult {
	let tid = resolve_thread_handle(kernel, handle)?;
	let mut guard = kernel.lock_scheduler();
	thread::run_thread(kernel, guard.state(), tid)
}

pub fn exit_thread(kernel: &KernelCore) -> ! {
	thread::exit_current(kernel)
}

/// Positive: sleep that many nanoseconds. 0 / -1 / -2 select the three
/// yield flavors.
pub fn sleep_thread(kernel: &KernelCore, timeout_ns: i64) -> SvcResult {
	match timeout_ns {
		0 => {
			scheduler::yield_without_core_migration(kernel);
			Ok(())
		}
		-1 => {
			scheduler::yield_with_core_migration(kernel);
			Ok(())
		}
		-2 => {
			scheduler::yield_to_any_thread(kernel);
			Ok(())
		}
		ns if ns > 0 => thread::sleep(kernel, absolute_timeout(kernel, ns)),
		_ => Err(SvcError::InvalidEnumValue),
	}
}

pub fn get_thread_priority(kernel: &KernelCore, handle: Handle) -> SvcResult<i32> {
	let tid = resolve_thread_handle(kernel, handle)?;
	let mut guard = kernel.lock_scheduler();
	Ok(guard.state().thread(tid).priority)
}

pub fn set_thread_priority(kernel: &KernelCore, handle: Handle, priority: i32) -> SvcResult {
	if !(0..=LOWEST_THREAD_PRIORITY).contains(&priority) {
		return Err(SvcError::InvalidCombination);
	}
	let tid = resolve_thread_handle(kernel, handle)?;

	let mut guard = kernel.lock_scheduler();
	thread::set_base_priority(kernel, guard.state(), tid, priority);
	Ok(())
}

pub fn get_thread_core_mask(kernel: &KernelCore, handle: Handle) -> SvcResult<(i32, u64)> {
	let tid = resolve_thread_handle(kernel, handle)?;
	let mut guard = kernel.lock_scheduler();
	Ok(thread::get_core_mask(guard.state(), tid))
}

pub fn set_thread_core_mask(
	kernel: &KernelCore,
	handle: Handle,
	ideal_core: i32,
	affinity_mask: u64,
) -> SvcResult {
	if ideal_core >= NUM_CPU_CORES as i32 {
		return Err(SvcError::InvalidCombination);
	}
	if affinity_mask >> NUM_CPU_CORES != 0 || affinity_mask == 0 {
		return Err(SvcError::InvalidCombination);
	}
	if ideal_core >= 0 && affinity_mask & (1 << ideal_core) == 0 {
		return Err(SvcError::InvalidCombination);
	}

	let tid = resolve_thread_handle(kernel, handle)?;
	{
		let mut guard = kernel.lock_scheduler();
		thread::set_core_mask(kernel, guard.state(), tid, ideal_core, affinity_mask)?;
	}

	// If the thread is currently running on a core the new mask excludes,
	// wait until it has moved off (or until it is no longer pinned there).
	loop {
		let mut guard = kernel.lock_scheduler();
		let s = guard.state();

		if s.thread(tid).shared.is_termination_requested() {
			return Ok(());
		}

		let on_excluded_core = (0..NUM_CPU_CORES).any(|core| {
			kernel.core(core).current_thread() == Some(tid) && affinity_mask & (1 << core) == 0
		});
		if !on_excluded_core {
			return Ok(());
		}

		if s.thread(tid).is_pinned {
			let cur = kernel.current_thread_id();
			if s.thread(cur).shared.is_termination_requested() {
				return Err(SvcError::TerminationRequested);
			}
			s.thread_mut(tid).pinned_waiters.push(cur);
			thread::begin_wait(kernel, s, cur, wait::WaitQueue::pinned(tid));
		}
		// Otherwise release the lock and retry until the switchers have
		// moved the thread.
	}
}

pub fn get_current_processor_number(kernel: &KernelCore) -> i32 {
	kernel.current_core_id()
}

/// Pauses (1) or resumes (0) a thread.
pub fn set_thread_activity(kernel: &KernelCore, handle: Handle, activity: u32) -> SvcResult {
	let pause = match activity {
		0 => false,
		1 => true,
		_ => return Err(SvcError::InvalidEnumValue),
	};

	let tid = resolve_thread_handle(kernel, handle)?;
	if tid == kernel.current_thread_id() && pause {
		return Err(SvcError::Busy);
	}

	thread::set_activity(kernel, tid, pause)
}

// Events and generic synchronization.

pub fn create_event(kernel: &KernelCore) -> SvcResult<(Handle, Handle)> {
	let event = kernel.create_event();
	let table = kernel.process().handle_table();

	kernel.open_object(KernelObject::WritableEvent(event));
	let write_handle = match table.add(KernelObject::WritableEvent(event)) {
		Ok(handle) => handle,
		Err(e) => {
			kernel.close_object(KernelObject::WritableEvent(event));
			kernel.close_event(event);
			return Err(e);
		}
	};

	kernel.open_object(KernelObject::ReadableEvent(event));
	let read_handle = match table.add(KernelObject::ReadableEvent(event)) {
		Ok(handle) => handle,
		Err(e) => {
			kernel.close_object(KernelObject::ReadableEvent(event));
			if let Some(obj) = table.remove(write_handle) {
				kernel.close_object(obj);
			}
			kernel.close_event(event);
			return Err(e);
		}
	};

	// Drop the creation reference; the handles keep the event alive.
	kernel.close_event(event);
	Ok((write_handle, read_handle))
}

pub fn signal_event(kernel: &KernelCore, handle: Handle) -> SvcResult {
	let Some(KernelObject::WritableEvent(event)) = kernel.process().handle_table().get(handle)
	else {
		return Err(SvcError::InvalidHandle);
	};

	let mut guard = kernel.lock_scheduler();
	event::signal(kernel, guard.state(), event)
}

pub fn clear_event(kernel: &KernelCore, handle: Handle) -> SvcResult {
	let object = kernel.process().handle_table().get(handle);
	let event = match object {
		Some(KernelObject::WritableEvent(event)) | Some(KernelObject::ReadableEvent(event)) => {
			event
		}
		_ => return Err(SvcError::InvalidHandle),
	};

	let mut guard = kernel.lock_scheduler();
	event::clear(guard.state(), event)
}

pub fn reset_signal(kernel: &KernelCore, handle: Handle) -> SvcResult {
	let Some(KernelObject::ReadableEvent(event)) = kernel.process().handle_table().get(handle)
	else {
		return Err(SvcError::InvalidHandle);
	};

	let mut guard = kernel.lock_scheduler();
	event::reset(guard.state(), event)
}

pub fn close_handle(kernel: &KernelCore, handle: Handle) -> SvcResult {
	match kernel.process().handle_table().remove(handle) {
		Some(obj) => {
			kernel.close_object(obj);
			Ok(())
		}
		None => Err(SvcError::InvalidHandle),
	}
}

/// Waits on up to 0x40 handles; returns the signaled index.
pub fn wait_synchronization(
	kernel: &KernelCore,
	handles: &[Handle],
	timeout_ns: i64,
) -> SvcResult<usize> {
	if handles.len() > ARGUMENT_HANDLE_COUNT_MAX {
		return Err(SvcError::OutOfResource);
	}

	// Resolve and pin every object for the duration of the wait.
	let mut objects: SmallVec<[WaitObjectRef; 4]> = SmallVec::new();
	for &handle in handles {
		let object = if handle == PSEUDO_HANDLE_CURRENT_THREAD {
			Some(KernelObject::Thread(kernel.current_thread_id()))
		} else {
			kernel.process().handle_table().get(handle)
		};
		let wait_object = match object {
			Some(KernelObject::Thread(tid)) => wait::WaitObject::Thread(tid),
			Some(KernelObject::ReadableEvent(event)) => wait::WaitObject::Event(event),
			_ => return Err(SvcError::InvalidHandle),
		};
		let kernel_object = object.unwrap();
		kernel.open_object(kernel_object);
		objects.push(WaitObjectRef {
			kernel: kernel_object,
			wait: wait_object,
		});
	}

	let wait_objects: SmallVec<[wait::WaitObject; 4]> =
		objects.iter().map(|o| o.wait).collect();
	let timeout = absolute_timeout(kernel, timeout_ns);
	let result = wait::wait_synchronization(kernel, &wait_objects, timeout);

	for object in objects {
		kernel.close_object(object.kernel);
	}

	result
}

struct WaitObjectRef {
	kernel: KernelObject,
	wait: wait::WaitObject,
}

pub fn cancel_synchronization(kernel: &KernelCore, handle: Handle) -> SvcResult {
	let tid = resolve_thread_handle(kernel, handle)?;
	let mut guard = kernel.lock_scheduler();
	thread::wait_cancel(kernel, guard.state(), tid);
	Ok(())
}

// Raw dispatcher.

mod numbers {
	pub const CREATE_THREAD: u32 = 0x08;
	pub const START_THREAD: u32 = 0x09;
	pub const EXIT_THREAD: u32 = 0x0A;
	pub const SLEEP_THREAD: u32 = 0x0B;
	pub const GET_THREAD_PRIORITY: u32 = 0x0C;
	pub const SET_THREAD_PRIORITY: u32 = 0x0D;
	pub const GET_THREAD_CORE_MASK: u32 = 0x0E;
	pub const SET_THREAD_CORE_MASK: u32 = 0x0F;
	pub const GET_CURRENT_PROCESSOR_NUMBER: u32 = 0x10;
	pub const SIGNAL_EVENT: u32 = 0x11;
	pub const CLEAR_EVENT: u32 = 0x12;
	pub const CLOSE_HANDLE: u32 = 0x16;
	pub const RESET_SIGNAL: u32 = 0x17;
	pub const WAIT_SYNCHRONIZATION: u32 = 0x18;
	pub const CANCEL_SYNCHRONIZATION: u32 = 0x19;
	pub const ARBITRATE_LOCK: u32 = 0x1A;
	pub const ARBITRATE_UNLOCK: u32 = 0x1B;
	pub const WAIT_PROCESS_WIDE_KEY_ATOMIC: u32 = 0x1C;
	pub const SIGNAL_PROCESS_WIDE_KEY: u32 = 0x1D;
	pub const SET_THREAD_ACTIVITY: u32 = 0x32;
	pub const WAIT_FOR_ADDRESS: u32 = 0x34;
	pub const SIGNAL_TO_ADDRESS: u32 = 0x35;
	pub const CREATE_EVENT: u32 = 0x45;
}

/// Entry point from the guest run loop: decodes the 8-register argument
/// window, dispatches and writes the results back.
pub fn call(kernel: &KernelCore, svc_number: u32) {
	let core = kernel.current_core_id();
	debug_assert!(core >= 0, "SVC outside a core context");
	let arm = kernel.process().arm_interface(core as usize);
	let mut args = arm.svc_arguments();

	trace!("SVC {svc_number:#04x} called");

	match svc_number {
		numbers::SLEEP_THREAD => {
			let result = sleep_thread(kernel, args[0] as i64);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::GET_THREAD_PRIORITY => {
			let result = get_thread_priority(kernel, args[1] as Handle);
			if let Ok(priority) = result {
				args[1] = priority as u64;
			}
			args[0] = raw_result(result);
		}
		numbers::SET_THREAD_PRIORITY => {
			let result = set_thread_priority(kernel, args[0] as Handle, args[1] as i32);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::GET_THREAD_CORE_MASK => {
			let result = get_thread_core_mask(kernel, args[2] as Handle);
			if let Ok((core_id, mask)) = result {
				args[1] = core_id as u64;
				args[2] = mask;
			}
			args[0] = raw_result(result);
		}
		numbers::SET_THREAD_CORE_MASK => {
			let result =
				set_thread_core_mask(kernel, args[0] as Handle, args[1] as i32, args[2]);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::GET_CURRENT_PROCESSOR_NUMBER => {
			args[0] = get_current_processor_number(kernel) as u64;
		}
		numbers::SIGNAL_EVENT => {
			let result = signal_event(kernel, args[0] as Handle);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::CLEAR_EVENT => {
			let result = clear_event(kernel, args[0] as Handle);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::RESET_SIGNAL => {
			let result = reset_signal(kernel, args[0] as Handle);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::CLOSE_HANDLE => {
			let result = close_handle(kernel, args[0] as Handle);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::WAIT_SYNCHRONIZATION => {
			// args: [_, handles address, handle count, timeout]
			let address = args[1];
			let count = args[2] as usize;
			let timeout_ns = args[3] as i64;

			let result = read_guest_handles(kernel, address, count)
				.and_then(|handles| wait_synchronization(kernel, &handles, timeout_ns));
			if let Ok(index) = result {
				args[1] = index as u64;
			}
			args[0] = raw_result(result);
		}
		numbers::CANCEL_SYNCHRONIZATION => {
			let result = cancel_synchronization(kernel, args[0] as Handle);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::ARBITRATE_LOCK => {
			let result =
				arbitrate_lock(kernel, args[0] as Handle, args[1], args[2] as u32);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::ARBITRATE_UNLOCK => {
			let result = arbitrate_unlock(kernel, args[0]);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::WAIT_PROCESS_WIDE_KEY_ATOMIC => {
			let result = wait_process_wide_key_atomic(
				kernel,
				args[0],
				args[1],
				args[2] as u32,
				args[3] as i64,
			);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::SIGNAL_PROCESS_WIDE_KEY => {
			signal_process_wide_key(kernel, args[0], args[1] as i32);
		}
		numbers::SET_THREAD_ACTIVITY => {
			let result = set_thread_activity(kernel, args[0] as Handle, args[1] as u32);
			args[0] = raw_result(result);
		}
		numbers::WAIT_FOR_ADDRESS => {
			let result = wait_for_address(
				kernel,
				args[0],
				args[1] as u32,
				args[2] as i32,
				args[3] as i64,
			);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::SIGNAL_TO_ADDRESS => {
			let result = signal_to_address(
				kernel,
				args[0],
				args[1] as u32,
				args[2] as i32,
				args[3] as i32,
			);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::EXIT_THREAD => {
			exit_thread(kernel);
		}
		numbers::START_THREAD => {
			let result = start_thread(kernel, args[0] as Handle);
			args[0] = u64::from(SvcError::to_raw(result));
		}
		numbers::CREATE_THREAD => {
			// args: [_, entry, argument, stack top, priority, core]
			let result = create_thread(
				kernel,
				args[1],
				args[2],
				args[3],
				args[4] as i32,
				args[5] as i32,
			);
			if let Ok(handle) = result {
				args[1] = u64::from(handle);
			}
			args[0] = raw_result(result);
		}
		numbers::CREATE_EVENT => {
			let result = create_event(kernel);
			if let Ok((write_handle, read_handle)) = result {
				args[1] = u64::from(write_handle);
				args[2] = u64::from(read_handle);
			}
			args[0] = raw_result(result);
		}
		_ => {
			warn!("unknown SVC {svc_number:#04x}");
			args[0] = u64::from(SvcError::to_raw(Err(SvcError::NotFound)));
		}
	}

	let core = kernel.current_core_id();
	debug_assert!(core >= 0);
	kernel
		.process()
		.arm_interface(core as usize)
		.set_svc_arguments(args);
}

fn raw_result<T>(result: SvcResult<T>) -> u64 {
	u64::from(SvcError::to_raw(result.map(|_| ())))
}

fn read_guest_handles(kernel: &KernelCore, address: u64, count: usize) -> SvcResult<Vec<Handle>> {
	if count > ARGUMENT_HANDLE_COUNT_MAX {
		return Err(SvcError::OutOfResource);
	}
	let memory = kernel.process().memory();
	let mut handles = Vec::with_capacity(count);
	for i in 0..count {
		let handle = memory
			.read32(address + i as u64 * 4)
			.ok_or(SvcError::InvalidCurrentMemory)?;
		handles.push(handle);
	}
	Ok(handles)
}
