//! Waitable events: one signal bit shared by a writable and a readable
//! handle. Signalling wakes every thread linked on the readable side.

use smallvec::SmallVec;

use crate::kernel::{KernelCore, KernelState};
use crate::result::{SvcError, SvcResult};
use crate::scheduler::thread::ThreadId;
use crate::synch::wait::{self, WaitObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId(u32);

pub(crate) struct EventObject {
	pub signaled: bool,
	pub waiters: SmallVec<[ThreadId; 4]>,
	pub open_count: u32,
}

#[derive(Default)]
pub(crate) struct EventPool {
	entries: Vec<Option<EventObject>>,
	free: Vec<u32>,
}

impl EventPool {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn alloc(&mut self) -> EventId {
		let event = EventObject {
			signaled: false,
			waiters: SmallVec::new(),
			open_count: 1,
		};
		match self.free.pop() {
			Some(index) => {
				self.entries[index as usize] = Some(event);
				EventId(index)
			}
			None => {
				self.entries.push(Some(event));
				EventId((self.entries.len() - 1) as u32)
			}
		}
	}

	pub fn release(&mut self, id: EventId) {
		let slot = self.entries[id.0 as usize].take();
		debug_assert!(slot.is_some_and(|event| event.waiters.is_empty()));
		self.free.push(id.0);
	}

	pub fn get(&self, id: EventId) -> &EventObject {
		self.entries[id.0 as usize].as_ref().expect("stale event id")
	}

	pub fn get_mut(&mut self, id: EventId) -> &mut EventObject {
		self.entries[id.0 as usize].as_mut().expect("stale event id")
	}
}

/// Signals the event, waking its waiters.
pub(crate) fn signal(kernel: &KernelCore, s: &mut KernelState, event: EventId) -> SvcResult {
	if !s.events.get(event).signaled {
		s.events.get_mut(event).signaled = true;
		wait::notify_object_waiters(kernel, s, WaitObject::Event(event), Ok(()));
	}
	Ok(())
}

/// Clears the signal unconditionally.
pub(crate) fn clear(s: &mut KernelState, event: EventId) -> SvcResult {
	s.events.get_mut(event).signaled = false;
	Ok(())
}

/// Clears the signal; fails when the event was not signaled.
pub(crate) fn reset(s: &mut KernelState, event: EventId) -> SvcResult {
	if !s.events.get(event).signaled {
		return Err(SvcError::InvalidState);
	}
	s.events.get_mut(event).signaled = false;
	Ok(())
}
