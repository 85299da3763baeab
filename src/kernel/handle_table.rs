//! Per-process handle table: a fixed array of slots addressed by packed
//! handles. A handle packs a 15-bit slot index with a 15-bit linear id;
//! after a slot is freed and reused, stale handles carrying the old linear
//! id fail validation.

use hermit_sync::SpinMutex;

use crate::config::HANDLE_TABLE_MAX_SIZE;
use crate::result::{SvcError, SvcResult};
use crate::scheduler::thread::ThreadId;
use crate::synch::event::EventId;

pub type Handle = u32;

pub const PSEUDO_HANDLE_CURRENT_THREAD: Handle = 0xFFFF_8000;
pub const PSEUDO_HANDLE_CURRENT_PROCESS: Handle = 0xFFFF_8001;

pub const fn is_pseudo_handle(handle: Handle) -> bool {
	handle == PSEUDO_HANDLE_CURRENT_THREAD || handle == PSEUDO_HANDLE_CURRENT_PROCESS
}

/// What a handle refers to. Reference counts live with the objects; the
/// table only records the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelObject {
	Thread(ThreadId),
	ReadableEvent(EventId),
	WritableEvent(EventId),
}

const INDEX_BITS: u32 = 15;
const LINEAR_ID_BITS: u32 = 15;
const MIN_LINEAR_ID: u16 = 1;
const MAX_LINEAR_ID: u16 = (1 << LINEAR_ID_BITS) - 1;

#[derive(Debug, Clone, Copy)]
struct HandlePack {
	index: u32,
	linear_id: u16,
	reserved: u32,
}

impl HandlePack {
	fn unpack(handle: Handle) -> Self {
		Self {
			index: handle & ((1 << INDEX_BITS) - 1),
			linear_id: ((handle >> INDEX_BITS) & ((1 << LINEAR_ID_BITS) - 1)) as u16,
			reserved: handle >> (INDEX_BITS + LINEAR_ID_BITS),
		}
	}
}

const fn encode_handle(index: u16, linear_id: u16) -> Handle {
	index as u32 | ((linear_id as u32) << INDEX_BITS)
}

/// A slot is either occupied (remembering its linear id) or part of the
/// intrusive free list.
#[derive(Debug, Clone, Copy)]
enum EntryInfo {
	Occupied { linear_id: u16 },
	Free { next_free_index: i32 },
}

struct Inner {
	entry_infos: Vec<EntryInfo>,
	objects: Vec<Option<KernelObject>>,
	free_head_index: i32,
	table_size: u16,
	count: u16,
	max_count: u16,
	next_linear_id: u16,
}

impl Inner {
	fn allocate_entry(&mut self) -> usize {
		debug_assert!(self.count < self.table_size);

		let index = self.free_head_index;
		let EntryInfo::Free { next_free_index } = self.entry_infos[index as usize] else {
			unreachable!("free head points at an occupied slot");
		};
		self.free_head_index = next_free_index;

		self.count += 1;
		self.max_count = self.max_count.max(self.count);

		index as usize
	}

	fn free_entry(&mut self, index: usize) {
		debug_assert!(self.count > 0);

		self.objects[index] = None;
		self.entry_infos[index] = EntryInfo::Free {
			next_free_index: self.free_head_index,
		};
		self.free_head_index = index as i32;
		self.count -= 1;
	}

	fn allocate_linear_id(&mut self) -> u16 {
		let id = self.next_linear_id;
		self.next_linear_id += 1;
		if self.next_linear_id > MAX_LINEAR_ID {
			self.next_linear_id = MIN_LINEAR_ID;
		}
		id
	}

	fn is_valid_handle(&self, handle: Handle) -> bool {
		let pack = HandlePack::unpack(handle);
		debug_assert_eq!(pack.reserved, 0);

		if handle == 0 || pack.linear_id == 0 {
			return false;
		}
		if pack.index >= u32::from(self.table_size) {
			return false;
		}
		if self.objects[pack.index as usize].is_none() {
			return false;
		}
		matches!(
			self.entry_infos[pack.index as usize],
			EntryInfo::Occupied { linear_id } if linear_id == pack.linear_id
		)
	}
}

pub struct HandleTable {
	inner: SpinMutex<Inner>,
}

impl HandleTable {
	/// Creates a table with up to `size` entries (0 means the maximum).
	pub fn new(size: usize) -> SvcResult<Self> {
		if size > HANDLE_TABLE_MAX_SIZE {
			return Err(SvcError::OutOfMemory);
		}
		let table_size = if size == 0 { HANDLE_TABLE_MAX_SIZE } else { size };

		let mut entry_infos = Vec::with_capacity(table_size);
		let mut free_head_index = -1;
		for i in 0..table_size {
			entry_infos.push(EntryInfo::Free {
				next_free_index: free_head_index,
			});
			free_head_index = i as i32;
		}

		Ok(Self {
			inner: SpinMutex::new(Inner {
				entry_infos,
				objects: vec![None; table_size],
				free_head_index,
				table_size: table_size as u16,
				count: 0,
				max_count: 0,
				next_linear_id: MIN_LINEAR_ID,
			}),
		})
	}

	pub fn count(&self) -> usize {
		usize::from(self.inner.lock().count)
	}

	/// Adds an object, returning its new handle. The caller has already
	/// opened a reference on the object.
	pub fn add(&self, obj: KernelObject) -> SvcResult<Handle> {
		let mut inner = self.inner.lock();

		if inner.count >= inner.table_size {
			return Err(SvcError::OutOfHandles);
		}

		let linear_id = inner.allocate_linear_id();
		let index = inner.allocate_entry();
		inner.entry_infos[index] = EntryInfo::Occupied { linear_id };
		inner.objects[index] = Some(obj);

		Ok(encode_handle(index as u16, linear_id))
	}

	/// Removes a handle, returning the object it referenced so the caller
	/// can close it.
	pub fn remove(&self, handle: Handle) -> Option<KernelObject> {
		if is_pseudo_handle(handle) {
			return None;
		}
		let pack = HandlePack::unpack(handle);
		if pack.reserved != 0 {
			return None;
		}

		let mut inner = self.inner.lock();
		if !inner.is_valid_handle(handle) {
			return None;
		}

		let obj = inner.objects[pack.index as usize];
		inner.free_entry(pack.index as usize);
		obj
	}

	/// Looks a handle up without resolving pseudo handles.
	pub fn get(&self, handle: Handle) -> Option<KernelObject> {
		let pack = HandlePack::unpack(handle);
		if pack.reserved != 0 {
			return None;
		}

		let inner = self.inner.lock();
		if inner.is_valid_handle(handle) {
			inner.objects[pack.index as usize]
		} else {
			None
		}
	}

	/// Reserves a slot for a two-phase insert, returning the handle that
	/// [`HandleTable::register`] will bind.
	pub fn reserve(&self) -> SvcResult<Handle> {
		let mut inner = self.inner.lock();

		if inner.count >= inner.table_size {
			return Err(SvcError::OutOfHandles);
		}

		let linear_id = inner.allocate_linear_id();
		let index = inner.allocate_entry();
		inner.entry_infos[index] = EntryInfo::Occupied { linear_id };
		Ok(encode_handle(index as u16, linear_id))
	}

	/// Releases a reserved-but-unregistered handle.
	pub fn unreserve(&self, handle: Handle) {
		let pack = HandlePack::unpack(handle);
		debug_assert_eq!(pack.reserved, 0);
		debug_assert_ne!(pack.linear_id, 0);

		let mut inner = self.inner.lock();
		if pack.index < u32::from(inner.table_size) {
			debug_assert!(inner.objects[pack.index as usize].is_none());
			inner.free_entry(pack.index as usize);
		}
	}

	/// Binds an object to a previously reserved handle.
	pub fn register(&self, handle: Handle, obj: KernelObject) {
		let pack = HandlePack::unpack(handle);
		debug_assert_eq!(pack.reserved, 0);
		debug_assert_ne!(pack.linear_id, 0);

		let mut inner = self.inner.lock();
		if pack.index < u32::from(inner.table_size) {
			debug_assert!(inner.objects[pack.index as usize].is_none());
			inner.entry_infos[pack.index as usize] = EntryInfo::Occupied {
				linear_id: pack.linear_id,
			};
			inner.objects[pack.index as usize] = Some(obj);
		}
	}

	/// Empties the table, returning the objects for the caller to close.
	pub fn finalize(&self) -> Vec<KernelObject> {
		let mut inner = self.inner.lock();
		let mut closed = Vec::new();
		for index in 0..usize::from(inner.table_size) {
			if let Some(obj) = inner.objects[index] {
				closed.push(obj);
				inner.free_entry(index);
			}
		}
		closed
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn thread_object(raw: u64) -> KernelObject {
		KernelObject::Thread(ThreadId::new(raw))
	}

	#[test]
	fn add_get_remove_round_trip() {
		let table = HandleTable::new(16).unwrap();
		let handle = table.add(thread_object(7)).unwrap();

		assert_eq!(table.get(handle), Some(thread_object(7)));
		assert_eq!(table.remove(handle), Some(thread_object(7)));
		assert_eq!(table.get(handle), None);
		assert_eq!(table.remove(handle), None);
	}

	#[test]
	fn stale_handles_fail_after_slot_reuse() {
		let table = HandleTable::new(1).unwrap();

		let first = table.add(thread_object(1)).unwrap();
		table.remove(first);

		// The slot is reused with a fresh linear id.
		let second = table.add(thread_object(2)).unwrap();
		assert_ne!(first, second);
		assert_eq!(table.get(first), None);
		assert_eq!(table.get(second), Some(thread_object(2)));
	}

	#[test]
	fn overflow_returns_out_of_handles() {
		let table = HandleTable::new(2).unwrap();
		table.add(thread_object(1)).unwrap();
		table.add(thread_object(2)).unwrap();
		assert_eq!(table.add(thread_object(3)), Err(SvcError::OutOfHandles));

		// Freeing one slot makes the table usable again.
		let handles = table.finalize();
		assert_eq!(handles.len(), 2);
		assert!(table.add(thread_object(4)).is_ok());
	}

	#[test]
	fn linear_id_wraps_without_hitting_zero() {
		let table = HandleTable::new(1).unwrap();

		let mut last = 0;
		for raw in 0..0x8002u64 {
			let handle = table.add(thread_object(raw + 1)).unwrap();
			let linear_id = (handle >> 15) & 0x7FFF;
			assert_ne!(linear_id, 0);
			assert_ne!(handle, last);
			last = handle;
			table.remove(handle);
		}
	}

	#[test]
	fn reserve_register_binds_the_reserved_handle() {
		let table = HandleTable::new(4).unwrap();

		let handle = table.reserve().unwrap();
		assert_eq!(table.get(handle), None);

		table.register(handle, thread_object(9));
		assert_eq!(table.get(handle), Some(thread_object(9)));
	}

	#[test]
	fn reserve_unreserve_releases_the_slot() {
		let table = HandleTable::new(1).unwrap();

		let handle = table.reserve().unwrap();
		assert_eq!(table.reserve(), Err(SvcError::OutOfHandles));
		table.unreserve(handle);
		assert!(table.reserve().is_ok());
	}

	#[test]
	fn rejects_reserved_bits_and_zero() {
		let table = HandleTable::new(4).unwrap();
		let handle = table.add(thread_object(1)).unwrap();

		assert_eq!(table.get(0), None);
		assert_eq!(table.get(handle | 0x4000_0000), None);
		assert_eq!(table.get(handle | 0x8000_0000), None);
	}
}
