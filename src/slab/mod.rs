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

//! A slab allocator on top of the page-frame allocator, in the spirit of the teacher's
//! `memory::malloc` chunk/block free lists but organized around fixed-size object caches instead
//! of a general-purpose heap. A [`Cache`] carves the pages it grows into fixed-size slots and
//! tracks which pages are full, partially used, or untouched so allocation never has to walk a
//! slab's objects to find a free one.
//!
//! Every slab's objects live in-band: a free slot's first bytes hold the index of the next free
//! slot (or `u16::MAX`), the same trick the teacher's `malloc::chunk` free list uses for its
//! chunk headers. The slab header itself sits at the start of the page run it owns, recovered
//! from any object pointer by masking down to the run's base (see [`crate::pfa::containing_run_base`]).

pub mod kmalloc;

use crate::errno::{Errno, KResult};
use crate::pfa::{self, Flags, PhysAddr};
use crate::util::align_up;
use crate::util::list::{Link, List};
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

/// Called on every object's first use, to let a cache initialize it once. Re-used objects are
/// handed back as-is: a slab never re-runs the constructor for a slot it has already produced.
pub type CtorFn = fn(*mut u8);
/// Called on every constructed object when its cache is destroyed.
pub type DtorFn = fn(*mut u8);

/// A slab won't grow to a larger page order just to clear this bar, but a cache that can't reach
/// it even at [`crate::config::MAX_FRAME_ORDER`] still gets created with whatever it can fit.
const MIN_OBJECTS_PER_SLAB: usize = 8;

/// Upper bound on the number of live caches, including the kmalloc size classes. A real kernel's
/// cache count is static (one per kernel structure plus the kmalloc classes), so a fixed pool
/// avoids needing a heap allocator to host the caches themselves — the classic slab
/// chicken-and-egg problem, sidestepped here by never putting `CacheState` on the heap at all.
const MAX_CACHES: usize = 32;

static CACHE_POOL: crate::util::lock::IntMutex<[Option<CacheState>; MAX_CACHES]> =
	crate::util::lock::IntMutex::new([None; MAX_CACHES]);

struct CacheState {
	#[allow(dead_code)] // diagnostic-only: never read back, only useful in a debugger/log dump.
	name: &'static str,
	object_size: usize,
	align: usize,
	order: u8,
	objects_per_slab: u16,
	ctor: Option<CtorFn>,
	dtor: Option<DtorFn>,
	slabs_full: List,
	slabs_partial: List,
	slabs_free: List,
	num_active: usize,
	num_slabs: usize,
}

/// The header every slab carries at the start of its page run.
#[repr(C)]
struct SlabHeader {
	link: Link,
	cache_slot: usize,
	free_list: Option<u16>,
	next_virgin: u16,
	capacity: u16,
	in_use: u16,
}

unsafe fn object_ptr(header: *mut SlabHeader, header_size: usize, object_size: usize, index: u16) -> *mut u8 {
	(header as *mut u8).add(header_size + index as usize * object_size)
}

unsafe fn read_next(header: *mut SlabHeader, header_size: usize, object_size: usize, index: u16) -> Option<u16> {
	let raw = object_ptr(header, header_size, object_size, index) as *const u16;
	match raw.read_unaligned() {
		u16::MAX => None,
		v => Some(v),
	}
}

unsafe fn write_next(header: *mut SlabHeader, header_size: usize, object_size: usize, index: u16, next: Option<u16>) {
	let raw = object_ptr(header, header_size, object_size, index) as *mut u16;
	raw.write_unaligned(next.unwrap_or(u16::MAX));
}

/// Allocates a fresh slab for `state` and links it into `slabs_free`. Returns `None` on PFA
/// exhaustion.
fn grow(slot: usize, state: &mut CacheState) -> Option<NonNull<SlabHeader>> {
	let phys = pfa::alloc_pages(state.order, Flags::KERNEL)?;
	let base = pfa::lowmem_addr(phys) as *mut SlabHeader;
	unsafe {
		base.write(SlabHeader {
			link: Link::new(),
			cache_slot: slot,
			free_list: None,
			next_virgin: 0,
			capacity: state.objects_per_slab,
			in_use: 0,
		});
		let mut header = NonNull::new_unchecked(base);
		state.slabs_free.push_front(NonNull::from(&mut header.as_mut().link));
		state.num_slabs += 1;
		Some(header)
	}
}

/// A handle to a fixed-size object cache.
pub struct Cache {
	slot: usize,
}

impl Cache {
	/// Creates a new cache of objects of `size` bytes, aligned to `align`. `ctor`/`dtor`, if
	/// given, run on an object's first use and on cache teardown respectively.
	pub fn create(
		name: &'static str,
		size: usize,
		align: usize,
		ctor: Option<CtorFn>,
		dtor: Option<DtorFn>,
	) -> KResult<Self> {
		let align = align.max(align_of::<u16>());
		let object_size = align_up(size.max(size_of::<u16>()), align);
		let header_size = align_up(size_of::<SlabHeader>(), align);

		let mut order = 0u8;
		let mut capacity;
		loop {
			let usable = pfa::frame_size(order).saturating_sub(header_size);
			capacity = usable / object_size;
			if capacity >= MIN_OBJECTS_PER_SLAB || order == crate::config::MAX_FRAME_ORDER {
				break;
			}
			order += 1;
		}
		if capacity == 0 {
			return Err(Errno::EINVAL);
		}
		let capacity = capacity.min(u16::MAX as usize) as u16;

		let mut pool = CACHE_POOL.lock();
		let slot = pool.iter().position(Option::is_none).ok_or(Errno::ENOMEM)?;
		pool[slot] = Some(CacheState {
			name,
			object_size,
			align,
			order,
			objects_per_slab: capacity,
			ctor,
			dtor,
			slabs_full: List::new(),
			slabs_partial: List::new(),
			slabs_free: List::new(),
			num_active: 0,
			num_slabs: 0,
		});
		Ok(Cache { slot })
	}

	/// Returns the size in bytes of one object, after alignment padding.
	pub fn object_size(&self) -> usize {
		CACHE_POOL.lock()[self.slot].as_ref().expect("object_size: cache already destroyed").object_size
	}

	/// Allocates one object. Returns `None` on PFA exhaustion, never panics on a full cache (it
	/// grows instead).
	pub fn alloc(&self) -> Option<NonNull<u8>> {
		let mut pool = CACHE_POOL.lock();
		let state = pool[self.slot].as_mut().expect("alloc: cache already destroyed");
		let header_size = align_up(size_of::<SlabHeader>(), state.align);
		let object_size = state.object_size;

		let mut slab = if let Some(link) = state.slabs_partial.front() {
			unsafe { container_of!(link, SlabHeader, link) }
		} else if let Some(link) = state.slabs_free.front() {
			unsafe { container_of!(link, SlabHeader, link) }
		} else {
			grow(self.slot, state)?
		};

		let header = unsafe { slab.as_mut() };
		let was_empty = header.in_use == 0;
		let (object_index, is_virgin) = if let Some(free_idx) = header.free_list {
			header.free_list = unsafe { read_next(slab.as_ptr(), header_size, object_size, free_idx) };
			(free_idx, false)
		} else {
			let idx = header.next_virgin;
			header.next_virgin += 1;
			(idx, true)
		};
		header.in_use += 1;
		let becomes_full = header.in_use == header.capacity;
		let link = NonNull::from(&mut header.link);
		if was_empty {
			unsafe { state.slabs_free.remove(link) };
		} else {
			unsafe { state.slabs_partial.remove(link) };
		}
		if becomes_full {
			unsafe { state.slabs_full.push_front(link) };
		} else {
			unsafe { state.slabs_partial.push_front(link) };
		}
		state.num_active += 1;

		let object = unsafe { object_ptr(slab.as_ptr(), header_size, object_size, object_index) };
		if is_virgin {
			if let Some(ctor) = state.ctor {
				ctor(object);
			}
		}
		Some(unsafe { NonNull::new_unchecked(object) })
	}

	/// Frees an object previously returned by [`Cache::alloc`]. The owning cache is recovered
	/// from the pointer itself, so no `&self` is needed, matching the C convention this mirrors.
	///
	/// Panics (integrity violation) if `obj` is not a live object of a known slab: a pointer that
	/// never came from a cache at all is always caught; a corrupted free list, a double free, or
	/// a pointer that came from a cache but was never allocated are only caught in debug builds
	/// or with the `slab-checks` feature on, which a hardened release build can skip.
	pub fn free(obj: NonNull<u8>) {
		let phys = PhysAddr(obj.as_ptr() as usize);
		let order = pfa::order_of(phys);
		let run_base = pfa::containing_run_base(phys, order);
		let header_ptr = pfa::lowmem_addr(run_base) as *mut SlabHeader;
		let slot = unsafe { (*header_ptr).cache_slot };

		let mut pool = CACHE_POOL.lock();
		let Some(state) = pool.get_mut(slot).and_then(Option::as_mut) else {
			crate::kernel_panic!("cache_free: pointer belongs to a destroyed or unknown cache");
		};
		let header_size = align_up(size_of::<SlabHeader>(), state.align);
		let object_size = state.object_size;

		let obj_off = obj.as_ptr() as usize - header_ptr as usize;
		#[cfg(any(debug_assertions, feature = "slab-checks"))]
		if obj_off < header_size || (obj_off - header_size) % object_size != 0 {
			crate::kernel_panic!("cache_free: pointer is not slab-object-aligned");
		}
		let index = ((obj_off - header_size) / object_size) as u16;
		let header = unsafe { &mut *header_ptr };
		#[cfg(any(debug_assertions, feature = "slab-checks"))]
		if index >= header.next_virgin {
			crate::kernel_panic!("cache_free: pointer was never allocated from this slab");
		}
		#[cfg(any(debug_assertions, feature = "slab-checks"))]
		{
			let mut cursor = header.free_list;
			while let Some(i) = cursor {
				if i == index {
					crate::kernel_panic!("cache_free: double free detected");
				}
				cursor = unsafe { read_next(header_ptr, header_size, object_size, i) };
			}
		}

		let was_full = header.in_use == header.capacity;
		unsafe { write_next(header_ptr, header_size, object_size, index, header.free_list) };
		header.free_list = Some(index);
		header.in_use -= 1;
		state.num_active -= 1;
		let link = NonNull::from(&mut header.link);
		if was_full {
			unsafe { state.slabs_full.remove(link) };
		} else {
			unsafe { state.slabs_partial.remove(link) };
		}
		if header.in_use == 0 {
			unsafe { state.slabs_free.push_front(link) };
		} else {
			unsafe { state.slabs_partial.push_front(link) };
		}
	}

	/// Tears down the cache and returns all its pages to the PFA. Fails with `EBUSY` if any
	/// object allocated from it is still live — the caller's obligation to free everything
	/// first, not an integrity violation, so this returns an error instead of panicking. Takes
	/// `&mut self` rather than consuming the cache so a caller that gets `EBUSY` still has a
	/// handle to free the remaining objects with and retry, since `EBUSY` here is a normal
	/// recoverable condition, not a terminal one.
	pub fn destroy(&mut self) -> KResult<()> {
		let mut pool = CACHE_POOL.lock();
		let state = pool[self.slot].as_mut().expect("destroy: cache already destroyed");
		if state.num_active != 0 {
			return Err(Errno::EBUSY);
		}
		let order = state.order;
		let header_size = align_up(size_of::<SlabHeader>(), state.align);
		let object_size = state.object_size;
		let dtor = state.dtor;

		for list in [&mut state.slabs_full, &mut state.slabs_partial, &mut state.slabs_free] {
			while let Some(link) = list.pop_front() {
				let mut header = unsafe { container_of!(link, SlabHeader, link) };
				if let Some(dtor) = dtor {
					let next_virgin = unsafe { header.as_ref() }.next_virgin;
					for i in 0..next_virgin {
						let obj = unsafe { object_ptr(header.as_ptr(), header_size, object_size, i) };
						dtor(obj);
					}
				}
				let run_base = PhysAddr(unsafe { header.as_mut() } as *mut SlabHeader as usize);
				pfa::free_pages(run_base, order);
			}
		}
		pool[self.slot] = None;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::pfa::test_harness::init_test_arena;
	use std::sync::Mutex;

	static TEST_LOCK: Mutex<()> = Mutex::new(());

	#[test]
	fn alloc_free_reuses_slot() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_test_arena(64);
		let mut cache = Cache::create("test_small", 32, 8, None, None).expect("create");
		let a = cache.alloc().expect("alloc a");
		let b = cache.alloc().expect("alloc b");
		assert_ne!(a, b);
		Cache::free(a);
		let c = cache.alloc().expect("alloc c reuses freed slot");
		assert_eq!(a, c, "freed slot should be reused before growing");
		Cache::free(b);
		Cache::free(c);
		cache.destroy().expect("destroy with no live objects");
	}

	#[test]
	fn ctor_runs_once_per_slot() {
		use core::sync::atomic::{AtomicUsize, Ordering};
		static CALLS: AtomicUsize = AtomicUsize::new(0);
		fn ctor(_obj: *mut u8) {
			CALLS.fetch_add(1, Ordering::SeqCst);
		}

		let _guard = TEST_LOCK.lock().unwrap();
		init_test_arena(64);
		CALLS.store(0, Ordering::SeqCst);
		let mut cache = Cache::create("test_ctor", 16, 8, Some(ctor), None).expect("create");
		let a = cache.alloc().expect("alloc a");
		Cache::free(a);
		let b = cache.alloc().expect("alloc b reuses a's slot");
		assert_eq!(a, b);
		assert_eq!(CALLS.load(Ordering::SeqCst), 1, "ctor must not re-run on reuse");
		Cache::free(b);
		cache.destroy().unwrap();
	}

	#[test]
	fn destroy_fails_with_live_objects() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_test_arena(64);
		let mut cache = Cache::create("test_busy", 16, 8, None, None).expect("create");
		let a = cache.alloc().expect("alloc");
		assert_eq!(cache.destroy(), Err(Errno::EBUSY));
		// destroy() borrows rather than consumes, so the handle survives an EBUSY and the
		// caller can free what's left and retry instead of leaking the slot.
		Cache::free(a);
		cache.destroy().expect("destroy should succeed once the live object is freed");
	}

	#[test]
	fn grows_across_many_slabs() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_test_arena(256);
		let mut cache = Cache::create("test_grow", 64, 8, None, None).expect("create");
		let mut objs = Vec::new();
		for _ in 0..64 {
			objs.push(cache.alloc().expect("alloc"));
		}
		for o in objs {
			Cache::free(o);
		}
		cache.destroy().unwrap();
	}
}
