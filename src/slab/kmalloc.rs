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

//! `kmalloc`/`kfree`: a general-purpose byte allocator built on a fixed ladder of
//! power-of-two-ish [`Cache`]s, one per size class. Requests above
//! [`crate::config::KMALLOC_MAX_SIZE`] skip the caches entirely and go straight to the
//! page-frame allocator, mirroring the teacher's `malloc` falling back to whole pages for large
//! blocks instead of fragmenting a cache's slabs.

use super::Cache;
use crate::config::{KMALLOC_MAX_SIZE, PAGE_SIZE};
use crate::errno::KResult;
use crate::pfa::{self, PhysAddr};
use crate::util::lock::IntMutex;
use crate::util::{ceil_div, order_for};
use core::mem::align_of;
use core::ptr::NonNull;

const SIZE_CLASSES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];
const NAMES: [&str; 9] = [
	"kmalloc-16",
	"kmalloc-32",
	"kmalloc-64",
	"kmalloc-128",
	"kmalloc-256",
	"kmalloc-512",
	"kmalloc-1024",
	"kmalloc-2048",
	"kmalloc-4096",
];

static CLASSES: IntMutex<[Option<Cache>; SIZE_CLASSES.len()]> = IntMutex::new([None; SIZE_CLASSES.len()]);

/// Creates the kmalloc size-class caches. Must be called once during boot, after
/// [`crate::pfa::init`].
pub fn init() -> KResult<()> {
	let mut classes = CLASSES.lock();
	for (i, &size) in SIZE_CLASSES.iter().enumerate() {
		classes[i] = Some(Cache::create(NAMES[i], size, align_of::<usize>(), None, None)?);
	}
	Ok(())
}

/// Allocates `size` bytes. Requests above [`KMALLOC_MAX_SIZE`] are rounded up to a page run and
/// handed straight to the page-frame allocator.
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
	if size == 0 {
		return None;
	}
	if size > KMALLOC_MAX_SIZE {
		let order = order_for(ceil_div(size, PAGE_SIZE));
		let addr = pfa::alloc_pages(order, pfa::Flags::KERNEL)?;
		return NonNull::new(pfa::lowmem_addr(addr));
	}
	let class = SIZE_CLASSES.iter().position(|&s| s >= size)?;
	let classes = CLASSES.lock();
	let cache = classes[class].as_ref().expect("kmalloc: slab::kmalloc::init was never called");
	cache.alloc()
}

/// Frees a block returned by [`kmalloc`]. The size class is recovered from the address, not
/// passed back by the caller: [`pfa::order_of`] gives the buddy order of the run `ptr` lives in,
/// and [`pfa::containing_run_base`] gives that run's base address. A cache-backed object is
/// always offset past its slab's header, so it never equals the run base; a large (page-run)
/// allocation is handed out starting exactly at the run base, since [`kmalloc`] returns
/// `pfa::lowmem_addr(addr)` unchanged. That makes "does `ptr` equal its own run's base" an exact
/// large-vs-class discriminator, the same recovery `Cache::free` already does one level down.
pub fn kfree(ptr: NonNull<u8>) {
	let phys = PhysAddr(ptr.as_ptr() as usize);
	let order = pfa::order_of(phys);
	let run_base = pfa::containing_run_base(phys, order);
	if run_base.0 == phys.0 {
		pfa::free_pages(run_base, order);
	} else {
		Cache::free(ptr);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::pfa::test_harness::init_test_arena;
	use std::sync::Mutex;

	static TEST_LOCK: Mutex<()> = Mutex::new(());

	#[test]
	fn small_alloc_roundtrip() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_test_arena(256);
		init().expect("kmalloc init");
		let p = kmalloc(40).expect("alloc 40 bytes");
		kfree(p);
	}

	#[test]
	fn large_alloc_falls_back_to_pfa() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_test_arena(256);
		init().expect("kmalloc init");
		let big = KMALLOC_MAX_SIZE + 1;
		let p = kmalloc(big).expect("alloc above kmalloc ceiling");
		kfree(p);
	}
}
