use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;
use hermit_sync::SpinMutex;

use super::{ExclusiveMonitor, GuestMemory};

/// Flat little-endian guest memory backed by host heap.
pub struct SharedMemory {
	bytes: SpinMutex<Box<[u8]>>,
}

impl SharedMemory {
	pub fn new(size: usize) -> Self {
		Self {
			bytes: SpinMutex::new(vec![0; size].into_boxed_slice()),
		}
	}

	fn check(addr: u64, len: usize) -> Option<usize> {
		let addr = usize::try_from(addr).ok()?;
		if addr % 4 != 0 {
			return None;
		}
		addr.checked_add(4).filter(|end| *end <= len)?;
		Some(addr)
	}
}

impl GuestMemory for SharedMemory {
	fn read32(&self, addr: u64) -> Option<u32> {
		let bytes = self.bytes.lock();
		let addr = Self::check(addr, bytes.len())?;
		Some(u32::from_le_bytes(
			bytes[addr..addr + 4].try_into().unwrap(),
		))
	}

	fn write32(&self, addr: u64, value: u32) -> bool {
		let mut bytes = self.bytes.lock();
		let Some(addr) = Self::check(addr, bytes.len()) else {
			return false;
		};
		bytes[addr..addr + 4].copy_from_slice(&value.to_le_bytes());
		true
	}
}

/// Exclusive monitor over a [`SharedMemory`].
///
/// A reservation remembers the value observed by the exclusive read; the
/// paired write succeeds only if the word still holds that value. That is
/// weaker than a hardware monitor (ABA is invisible) but every user in the
/// kernel runs its read/modify/write sequence under the scheduler lock, so
/// the monitor only has to defend against concurrent host-side access.
pub struct ReservationMonitor {
	memory: Arc<SharedMemory>,
	reservations: SpinMutex<HashMap<usize, (u64, u32), RandomState>>,
}

impl ReservationMonitor {
	pub fn new(memory: Arc<SharedMemory>) -> Self {
		Self {
			memory,
			reservations: SpinMutex::new(HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0))),
		}
	}
}

impl ExclusiveMonitor for ReservationMonitor {
	fn exclusive_read32(&self, slot: usize, addr: u64) -> Option<u32> {
		let value = self.memory.read32(addr)?;
		self.reservations.lock().insert(slot, (addr, value));
		Some(value)
	}

	fn exclusive_write32(&self, slot: usize, addr: u64, value: u32) -> bool {
		let mut reservations = self.reservations.lock();
		let Some((reserved_addr, expected)) = reservations.remove(&slot) else {
			return false;
		};
		if reserved_addr != addr {
			return false;
		}

		// The reservation and the store must be checked atomically with
		// respect to other writers.
		let mut bytes = self.memory.bytes.lock();
		let Some(index) = SharedMemory::check(addr, bytes.len()) else {
			return false;
		};
		let current = u32::from_le_bytes(bytes[index..index + 4].try_into().unwrap());
		if current != expected {
			return false;
		}
		bytes[index..index + 4].copy_from_slice(&value.to_le_bytes());
		true
	}

	fn clear_exclusive(&self, slot: usize) {
		self.reservations.lock().remove(&slot);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn read_write_round_trip() {
		let memory = SharedMemory::new(0x1000);
		assert!(memory.write32(0x10, 0xdead_beef));
		assert_eq!(memory.read32(0x10), Some(0xdead_beef));
	}

	#[test]
	fn rejects_misaligned_and_out_of_range() {
		let memory = SharedMemory::new(0x100);
		assert_eq!(memory.read32(0x2), None);
		assert_eq!(memory.read32(0x100), None);
		assert!(!memory.write32(0xfffe, 1));
	}

	#[test]
	fn exclusive_write_fails_after_interfering_store() {
		let memory = Arc::new(SharedMemory::new(0x100));
		let monitor = ReservationMonitor::new(memory.clone());

		assert_eq!(monitor.exclusive_read32(0, 0x40), Some(0));
		assert!(memory.write32(0x40, 7));
		assert!(!monitor.exclusive_write32(0, 0x40, 1));
		assert_eq!(memory.read32(0x40), Some(7));

		// A fresh read/write pair succeeds.
		assert_eq!(monitor.exclusive_read32(0, 0x40), Some(7));
		assert!(monitor.exclusive_write32(0, 0x40, 8));
		assert_eq!(memory.read32(0x40), Some(8));
	}

	#[test]
	fn clear_exclusive_drops_the_reservation() {
		let memory = Arc::new(SharedMemory::new(0x100));
		let monitor = ReservationMonitor::new(memory);

		monitor.exclusive_read32(2, 0x8);
		monitor.clear_exclusive(2);
		assert!(!monitor.exclusive_write32(2, 0x8, 1));
	}
}
