/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! The page-frame allocator (PFA): a buddy allocator handing out runs of `2^order` physically
//! contiguous pages.
//!
//! Spec section 2 treats the PFA as an external collaborator ("backed by a buddy allocator; the
//! core treats it as opaque"). It is implemented here anyway, in the teacher's own
//! `memory::buddy` shape, because the slab and paging modules this crate *does* own need a real
//! allocator underneath them to exercise their invariants (leak-freedom on
//! `destroy_process_image`, slab growth/shrink, ...). The boundary the rest of the core actually
//! depends on is the narrow one spec section 2 names: `alloc_pages`/`free_pages`/`page_count`/
//! `page_inc`/`page_dec`, plus the two address-translation helpers.

use crate::config::{MAX_FRAME_ORDER, PAGE_SIZE};
use crate::util::{align_up, order_for};
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags! {
	/// Allocation flags, mirroring the teacher's `buddy::FLAG_*` constants.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct Flags: u32 {
		/// Allocate from the zone used for kernel structures.
		const KERNEL = 0b0001;
		/// Allocate from the zone mapped into user address spaces.
		const USER = 0b0010;
		/// The allocation must not fail except for genuine memory exhaustion.
		const NOFAIL = 0b0100;
	}
}

/// A physical address. A newtype so paging code can't accidentally treat it as a virtual one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
	/// Returns the address of the page containing this address.
	pub fn page_align(self) -> Self {
		Self(self.0 & !(PAGE_SIZE - 1))
	}

	pub fn offset(self, delta: usize) -> Self {
		Self(self.0 + delta)
	}
}

/// Translates a physical address to its kernel low-memory mapping.
///
/// Spec section 3 calls this `lowmem_addr ↔ page`: kernel-mapped low memory where physical
/// memory is reachable at a fixed offset (here, identity: this core's test and reference
/// environment maps all physical memory 1:1 into kernel space, as a pedagogical kernel's
/// early low-memory region does).
#[inline]
pub fn lowmem_addr(addr: PhysAddr) -> *mut u8 {
	addr.0 as *mut u8
}

/// Returns the size in bytes of a run of the given buddy `order`.
#[inline]
pub const fn frame_size(order: u8) -> usize {
	PAGE_SIZE << order
}

/// Returns the physical base address of the run of `order` that contains `addr`.
///
/// Used to recover a slab's header (which lives at the start of its run) from any object
/// pointer inside it, without needing every run to be naturally aligned in absolute address
/// space — only aligned relative to the arena's base, which `init` guarantees.
pub fn containing_run_base(addr: PhysAddr, order: u8) -> PhysAddr {
	with_arena(|arena| {
		let size = frame_size(order);
		let rel = addr.0 - arena.base.0;
		PhysAddr(arena.base.0 + (rel - rel % size))
	})
}

/// Metadata for one physical page, indexed by page number from the arena base.
struct PageMeta {
	/// Reference count. Zero means free.
	refcount: AtomicU32,
	/// The buddy order of the run this page is the head of, or `u8::MAX` if this page is not a
	/// run head (i.e. it is a free-list/order field that only the head of an allocated or free
	/// block carries meaning).
	order: AtomicU32,
}

/// The buddy allocator's single arena. A real kernel discovers this region from the multiboot
/// memory map (out of scope here); this core is handed the region explicitly by whatever sets
/// it up, which lets the exact same allocator run against a `Vec`-backed arena in tests.
struct Arena {
	base: PhysAddr,
	/// Number of pages covered by the arena.
	page_count: usize,
	/// Per-page metadata.
	pages: &'static mut [PageMeta],
	/// Free lists, indexed by order: `free_lists[o]` holds the page index of the first free run
	/// of order `o`, or `None`.
	free_lists: [Option<usize>; (MAX_FRAME_ORDER as usize) + 1],
	/// Intrusive free-list links: `next_free[i]` is the page index of the next free run at the
	/// same order as page `i`'s run, when `i` is itself a free run head.
	next_free: &'static mut [Option<usize>],
}

impl Arena {
	fn page_index(&self, addr: PhysAddr) -> usize {
		(addr.0 - self.base.0) / PAGE_SIZE
	}

	fn page_addr(&self, index: usize) -> PhysAddr {
		self.base.offset(index * PAGE_SIZE)
	}

	fn buddy_index(&self, index: usize, order: u8) -> usize {
		index ^ (1usize << order)
	}

	fn unlink_free(&mut self, order: u8, index: usize) {
		let mut cursor = self.free_lists[order as usize];
		let mut prev: Option<usize> = None;
		while let Some(cur) = cursor {
			if cur == index {
				match prev {
					Some(p) => self.next_free[p] = self.next_free[cur],
					None => self.free_lists[order as usize] = self.next_free[cur],
				}
				self.next_free[cur] = None;
				return;
			}
			prev = Some(cur);
			cursor = self.next_free[cur];
		}
	}

	fn link_free(&mut self, order: u8, index: usize) {
		self.next_free[index] = self.free_lists[order as usize];
		self.free_lists[order as usize] = Some(index);
		self.pages[index].order.store(order as u32, Ordering::Relaxed);
	}

	fn split_down_to(&mut self, index: usize, from_order: u8, to_order: u8) {
		let mut order = from_order;
		while order > to_order {
			order -= 1;
			let buddy = self.buddy_index(index, order);
			self.link_free(order, buddy);
		}
	}

	/// Finds and detaches a free run of exactly `order`, splitting a larger one if needed.
	fn take_free(&mut self, order: u8) -> Option<usize> {
		let mut cur_order = order;
		while (cur_order as usize) <= MAX_FRAME_ORDER as usize {
			if let Some(index) = self.free_lists[cur_order as usize] {
				self.unlink_free(cur_order, index);
				self.split_down_to(index, cur_order, order);
				return Some(index);
			}
			cur_order += 1;
		}
		None
	}

	/// Returns a run to the free lists, merging with its buddy while possible.
	fn give_free(&mut self, mut index: usize, mut order: u8) {
		while order < MAX_FRAME_ORDER {
			let buddy = self.buddy_index(index, order);
			if buddy >= self.page_count {
				break;
			}
			let buddy_order = self.pages[buddy].order.load(Ordering::Relaxed) as u8;
			let buddy_free = self.pages[buddy].refcount.load(Ordering::Relaxed) == 0
				&& buddy_order == order
				&& self.is_linked(order, buddy);
			if !buddy_free {
				break;
			}
			self.unlink_free(order, buddy);
			index = index.min(buddy);
			order += 1;
		}
		self.link_free(order, index);
	}

	fn is_linked(&self, order: u8, index: usize) -> bool {
		let mut cursor = self.free_lists[order as usize];
		while let Some(cur) = cursor {
			if cur == index {
				return true;
			}
			cursor = self.next_free[cur];
		}
		false
	}
}

static mut ARENA: Option<Arena> = None;

fn with_arena<R>(f: impl FnOnce(&mut Arena) -> R) -> R {
	unsafe {
		let arena = (&raw mut ARENA)
			.as_mut()
			.unwrap()
			.as_mut()
			.expect("pfa::init was never called");
		f(arena)
	}
}

/// Initializes the page-frame allocator over `[base, base + page_count * PAGE_SIZE)`.
///
/// `pages` and `next_free` back the allocator's own metadata and must each have `page_count`
/// elements and live for `'static` (in a real boot, carved out of the same arena below the
/// first usable page; in tests, leaked `Vec`s).
///
/// # Safety
///
/// The caller must guarantee the described region is otherwise unused physical memory, and that
/// `init` is called at most once.
pub unsafe fn init(
	base: PhysAddr,
	page_count: usize,
	pages: &'static mut [PageMeta],
	next_free: &'static mut [Option<usize>],
) {
	debug_assert_eq!(pages.len(), page_count);
	debug_assert_eq!(next_free.len(), page_count);
	let mut arena = Arena {
		base,
		page_count,
		pages,
		free_lists: [None; (MAX_FRAME_ORDER as usize) + 1],
		next_free,
	};
	// Build the largest possible runs covering the whole arena, largest-order-first.
	let mut index = 0;
	while index < page_count {
		let mut order = order_for(page_count - index).min(MAX_FRAME_ORDER);
		// A run must both fit in the remainder and start on a multiple of its own size, or the
		// buddy-by-xor trick used by `take_free`/`give_free` would pair it with the wrong frame.
		while order > 0 && (index + (1usize << order) > page_count || index % (1usize << order) != 0) {
			order -= 1;
		}
		arena.link_free(order, index);
		index += 1usize << order;
	}
	ARENA = Some(arena);
}

/// Allocates a run of `2^order` contiguous pages. Returns `None` on exhaustion.
pub fn alloc_pages(order: u8, _flags: Flags) -> Option<PhysAddr> {
	with_arena(|arena| {
		let index = arena.take_free(order)?;
		// Stamp every page of the run, not just the head, with its own independent refcount
		// and order: callers that only hold a pointer into the middle of the run (the slab
		// allocator recovering a header; paging individually COW-splitting one page out of a
		// multi-page VMA backing) need both to treat any constituent page on its own terms.
		for i in index..index + (1usize << order) {
			arena.pages[i].refcount.store(1, Ordering::Relaxed);
			arena.pages[i].order.store(order as u32, Ordering::Relaxed);
		}
		Some(arena.page_addr(index))
	})
}

/// Returns the buddy order of the run containing `addr`, as stamped by `alloc_pages`.
pub fn order_of(addr: PhysAddr) -> u8 {
	with_arena(|arena| {
		let index = arena.page_index(addr.page_align());
		arena.pages[index].order.load(Ordering::Relaxed) as u8
	})
}

/// Allocates a run of `2^order` contiguous pages and zeroes it.
pub fn alloc_pages_zeroed(order: u8, flags: Flags) -> Option<PhysAddr> {
	let addr = alloc_pages(order, flags)?;
	// Safety: the run was just allocated and is exclusively owned by the caller.
	unsafe {
		core::ptr::write_bytes(addr.0 as *mut u8, 0, PAGE_SIZE << order);
	}
	Some(addr)
}

/// Releases the run starting at `addr` of order `order`, as returned by `alloc_pages`. Panics
/// (integrity violation) if the address isn't a known run head.
pub fn free_pages(addr: PhysAddr, order: u8) {
	with_arena(|arena| {
		let index = arena.page_index(addr);
		let refcount = arena.pages[index].refcount.fetch_sub(1, Ordering::AcqRel);
		if refcount != 1 {
			return;
		}
		arena.give_free(index, order);
	});
}

/// Returns the current reference count of the page containing `addr`.
pub fn page_count(addr: PhysAddr) -> u32 {
	with_arena(|arena| {
		let index = arena.page_index(addr);
		arena.pages[index].refcount.load(Ordering::Relaxed)
	})
}

/// Increments the reference count of the page containing `addr` (used when a COW page becomes
/// shared by one more address space).
pub fn page_inc(addr: PhysAddr) {
	with_arena(|arena| {
		let index = arena.page_index(addr);
		arena.pages[index].refcount.fetch_add(1, Ordering::AcqRel);
	});
}

/// Decrements the reference count of the page containing `addr` without freeing it even at
/// zero; used by `destroy_vm_area` on shared COW pages where the *caller* already knows not to
/// reach zero here (ownership is tracked by the VMA that actually frees via `free_pages`).
pub fn page_dec(addr: PhysAddr) {
	with_arena(|arena| {
		let index = arena.page_index(addr);
		arena.pages[index].refcount.fetch_sub(1, Ordering::AcqRel);
	});
}

#[cfg(test)]
pub(crate) mod test_harness {
	use super::*;

	/// A page-sized, page-aligned block. `Entry::set_frame_addr` requires frame addresses to be
	/// page-aligned; a plain `Vec<u8>` only promises byte alignment, so the test arena is backed
	/// by `Vec<AlignedPage>` instead, whose element alignment (and therefore the allocator's
	/// returned base address) is `PAGE_SIZE`.
	#[repr(align(4096))]
	struct AlignedPage([u8; PAGE_SIZE]);

	/// Builds a fresh, leaked test arena of `page_count` pages and initializes the global PFA.
	/// Tests that need isolation from each other should be run with `cargo test -- --test-threads=1`
	/// or given their own process, since the PFA here is a single global like the real kernel's.
	pub fn init_test_arena(page_count: usize) -> PhysAddr {
		let region: &'static mut [AlignedPage] =
			Vec::from_iter((0..page_count).map(|_| AlignedPage([0u8; PAGE_SIZE]))).leak();
		let base = PhysAddr(region.as_ptr() as usize);
		debug_assert_eq!(base.0 % PAGE_SIZE, 0, "test arena must be page-aligned");
		let pages: &'static mut [PageMeta] = Vec::from_iter((0..page_count).map(|_| PageMeta {
			refcount: AtomicU32::new(0),
			order: AtomicU32::new(0),
		}))
		.leak();
		let next_free: &'static mut [Option<usize>] = vec![None; page_count].leak();
		unsafe {
			init(base, page_count, pages, next_free);
		}
		base
	}
}

#[cfg(test)]
mod test {
	use super::test_harness::init_test_arena;
	use super::*;
	use std::sync::Mutex;

	// The PFA is a process-wide singleton; serialize tests that touch it.
	static TEST_LOCK: Mutex<()> = Mutex::new(());

	#[test]
	fn alloc_free_roundtrip() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_test_arena(64);
		let a = alloc_pages(0, Flags::KERNEL).expect("alloc");
		let b = alloc_pages(0, Flags::KERNEL).expect("alloc");
		assert_ne!(a.0, b.0);
		assert_eq!(page_count(a), 1);
		free_pages(a, 0);
		free_pages(b, 0);
	}

	#[test]
	fn reuse_after_free() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_test_arena(16);
		let a = alloc_pages(2, Flags::KERNEL).expect("alloc order 2");
		free_pages(a, 2);
		let b = alloc_pages(2, Flags::KERNEL).expect("alloc order 2 again");
		assert_eq!(a.0, b.0, "freed run should be reusable");
		free_pages(b, 2);
	}

	#[test]
	fn refcount_inc_dec_for_cow() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_test_arena(16);
		let a = alloc_pages(0, Flags::KERNEL).expect("alloc");
		page_inc(a);
		assert_eq!(page_count(a), 2);
		page_dec(a);
		assert_eq!(page_count(a), 1);
		free_pages(a, 0);
	}
}
