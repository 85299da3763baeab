use std::sync::{Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::kernel::KernelCore;

/// Monotonic time source for the emulated hardware, in nanoseconds since
/// kernel construction.
#[derive(Debug)]
pub struct TickSource {
	origin: Instant,
}

impl TickSource {
	pub fn new() -> Self {
		Self {
			origin: Instant::now(),
		}
	}

	pub fn now_ns(&self) -> i64 {
		i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
	}
}

impl Default for TickSource {
	fn default() -> Self {
		Self::new()
	}
}

/// A possible one-shot timer source (i.e. reason the host timer was set up).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerSource {
	/// Thread wakeups driven by the hardware timer's task tree.
	Wakeup,
	/// The periodic preemption tick.
	Preemption,
}

/// A slot in the timer list. Each source is represented once, so multiple
/// timers share the one host timer thread.
#[derive(Debug)]
struct Slot {
	source: TimerSource,
	/// Absolute wakeup time in nanoseconds. [`i64::MAX`] means the slot is
	/// not set.
	wakeup_time: i64,
}

#[derive(Debug)]
struct TimerList {
	slots: [Slot; 2],
	shutdown: bool,
}

impl TimerList {
	const fn new() -> Self {
		Self {
			slots: [
				Slot {
					source: TimerSource::Wakeup,
					wakeup_time: i64::MAX,
				},
				Slot {
					source: TimerSource::Preemption,
					wakeup_time: i64::MAX,
				},
			],
			shutdown: false,
		}
	}

	fn slot_mut(&mut self, source: TimerSource) -> &mut Slot {
		self.slots
			.iter_mut()
			.find(|slot| slot.source == source)
			.unwrap()
	}

	/// The next slot to fire. May return an unset slot if none are set.
	fn next_timer(&self) -> &Slot {
		self.slots
			.iter()
			.min_by_key(|slot| slot.wakeup_time)
			.unwrap()
	}

	fn next_timer_mut(&mut self) -> &mut Slot {
		self.slots
			.iter_mut()
			.min_by_key(|slot| slot.wakeup_time)
			.unwrap()
	}
}

/// Fires one-shot events at absolute tick times on a dedicated host thread.
///
/// This stands in for the hardware timer interrupt: the kernel programs a
/// wakeup per [`TimerSource`] and the callback runs on the timer thread,
/// which registers itself with the kernel as a host thread so that it may
/// take the scheduler lock.
pub(crate) struct HostTimer {
	list: Mutex<TimerList>,
	program_changed: Condvar,
}

impl HostTimer {
	pub const fn new() -> Self {
		Self {
			list: Mutex::new(TimerList::new()),
			program_changed: Condvar::new(),
		}
	}

	/// Programs `source` to fire at the absolute time `wakeup_time` (in ns),
	/// or disables it when `None`. Overwrites any previous programming of the
	/// same source.
	pub fn set_oneshot(&self, source: TimerSource, wakeup_time: Option<i64>) {
		let mut list = self.list.lock().unwrap();
		list.slot_mut(source).wakeup_time = wakeup_time.unwrap_or(i64::MAX);
		self.program_changed.notify_one();
	}

	pub fn shutdown(&self) {
		self.list.lock().unwrap().shutdown = true;
		self.program_changed.notify_one();
	}

	/// Spawns the timer thread. `kernel` is held weakly so that dropping the
	/// kernel stops the timer.
	pub fn spawn(kernel: Weak<KernelCore>) -> thread::JoinHandle<()> {
		thread::Builder::new()
			.name("HostTimer".into())
			.spawn(move || Self::run(kernel))
			.unwrap()
	}

	fn run(kernel: Weak<KernelCore>) {
		loop {
			let Some(kernel) = kernel.upgrade() else {
				return;
			};

			let fired = {
				let mut list = kernel.host_timer().list.lock().unwrap();
				loop {
					if list.shutdown {
						return;
					}

					let next = list.next_timer().wakeup_time;
					let now = kernel.tick_source().now_ns();
					if next <= now {
						let slot = list.next_timer_mut();
						slot.wakeup_time = i64::MAX;
						break slot.source;
					}

					list = if next == i64::MAX {
						kernel.host_timer().program_changed.wait(list).unwrap()
					} else {
						let timeout = Duration::from_nanos((next - now) as u64);
						kernel
							.host_timer()
							.program_changed
							.wait_timeout(list, timeout)
							.unwrap()
							.0
					};
				}
			};

			match fired {
				TimerSource::Wakeup => kernel.on_hardware_timer_interrupt(),
				TimerSource::Preemption => kernel.on_preemption_tick(),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tick_source_is_monotonic() {
		let clock = TickSource::new();
		let a = clock.now_ns();
		let b = clock.now_ns();
		assert!(b >= a);
	}

	#[test]
	fn next_timer_prefers_earliest_slot() {
		let mut list = TimerList::new();
		list.slot_mut(TimerSource::Preemption).wakeup_time = 500;
		list.slot_mut(TimerSource::Wakeup).wakeup_time = 100;
		assert_eq!(list.next_timer().source, TimerSource::Wakeup);

		list.slot_mut(TimerSource::Wakeup).wakeup_time = i64::MAX;
		assert_eq!(list.next_timer().source, TimerSource::Preemption);
	}
}
