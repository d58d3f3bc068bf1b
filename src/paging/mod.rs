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

//! Per-process address spaces: page directories/tables, VMAs, copy-on-write fork, demand paging
//! and `mmap`/`munmap`. Grounded on the teacher's `memory` module's frame/virtual-address
//! plumbing, generalized from a whole-kernel singleton to the per-`Mm` structures spec section 3
//! calls for.
//!
//! This core never actually switches `CR3` or enables the MMU: that is the "low-level CPU trap
//! plumbing" spec section 1 explicitly puts out of scope. Every address here is a *physical*
//! address reachable through [`crate::pfa::lowmem_addr`]'s identity mapping; `Mm`/`Vma`/page
//! tables are maintained as real data structures and the fault-resolution algorithm runs for
//! real, but nothing here assumes a live page-fault trap — tests call [`fault::handle`]
//! directly with synthetic fault parameters, the same inputs a real ISR would extract from the
//! trap frame.
//!
//! One consequence: the "transient mapping window" spec's design notes describe (a pointer to
//! the *original* PTE encoded into a re-entrant fault's PTE while copying through a temporary
//! remap) has no counterpart here, since every frame is already reachable without remapping.
//! [`fault::TRANSIENT_WINDOW`] is kept as an empty range so the branch structure in
//! [`fault::handle`] mirrors the source algorithm's shape, but it can never be entered. The COW
//! clone walk achieves the same externally observable outcome (spec section 8's "both sides
//! either shared-non-writable+COW or both already materialized") without needing the pointer
//! encoding trick: see [`clone_vm_area`].

pub mod entry;
pub mod fault;

use crate::config::{MAX_FRAME_ORDER, PAGE_SIZE, PROCESS_END, USER_STACK_TOP};
use crate::errno::{Errno, KResult};
use crate::pfa::{self, Flags, PhysAddr};
use crate::slab::Cache;
use crate::util::lock::IntMutex;
use crate::util::{align_up, order_for};
use alloc::collections::BTreeMap;
use bitflags::bitflags;
use core::ptr::NonNull;
use entry::{dir_index, table_index, Entry, Table};

static PGDIR_CACHE: IntMutex<Option<Cache>> = IntMutex::new(None);
static PGTBL_CACHE: IntMutex<Option<Cache>> = IntMutex::new(None);

/// The kernel's own page directory, whose global-marked entries every process `Mm` inherits by
/// reference (spec's design notes: "the kernel's master `mm`... initialized-once process-wide
/// state"). `None` until [`set_kernel_pgdir`] runs; a blank `Mm` created before that simply has
/// no kernel mappings to inherit, which is fine for tests that only exercise user-space VMAs.
///
/// Stored as a raw address rather than `NonNull<Table>`: `NonNull` carries no `Send`/`Sync` impl
/// of its own (same reasoning as [`crate::util::list::List`]'s explicit `Send` impl), and a raw
/// address sidesteps that without needing another one here.
static KERNEL_PGDIR: IntMutex<Option<usize>> = IntMutex::new(None);

/// Drops `PGDIR_CACHE`/`PGTBL_CACHE`/`KERNEL_PGDIR` back to `None` so the next [`init`] call
/// builds fresh caches against whichever arena `pfa::test_harness::init_test_arena` just
/// installed, instead of reusing slab state tied to a previous test's now-replaced arena.
/// Unlike [`crate::devfs::test_harness::reset`], this doesn't walk and free live objects first
/// (nothing here tracks every outstanding `Table` across tests), so the old `Cache`'s pool slot
/// is simply abandoned rather than destroyed — the same trade [`crate::slab::kmalloc::init`]
/// already makes on every re-init.
#[cfg(test)]
pub(crate) fn reset_test_state() {
	*PGDIR_CACHE.lock() = None;
	*PGTBL_CACHE.lock() = None;
	*KERNEL_PGDIR.lock() = None;
}

/// Creates the page-directory and page-table slab caches. Must run once, after
/// [`crate::slab::kmalloc::init`].
pub fn init() -> KResult<()> {
	let mut pgdir = PGDIR_CACHE.lock();
	if pgdir.is_none() {
		*pgdir = Some(Cache::create("pgdir_cache", core::mem::size_of::<Table>(), PAGE_SIZE, None, None)?);
	}
	let mut pgtbl = PGTBL_CACHE.lock();
	if pgtbl.is_none() {
		*pgtbl = Some(Cache::create("pgtbl_cache", core::mem::size_of::<Table>(), PAGE_SIZE, None, None)?);
	}
	Ok(())
}

/// Registers `pgdir` as the kernel's master directory for [`create_blank_process_image`] and
/// [`clone_process_image`] to inherit global mappings from.
///
/// # Safety
///
/// `pgdir` must stay valid and its global-marked entries must never change frame identity for
/// the remainder of the kernel's life (they are shared by reference, never copied, into every
/// process `Mm`).
pub unsafe fn set_kernel_pgdir(pgdir: NonNull<Table>) {
	*KERNEL_PGDIR.lock() = Some(pgdir.as_ptr() as usize);
}

fn alloc_table(cache: &IntMutex<Option<Cache>>) -> KResult<NonNull<Table>> {
	let guard = cache.lock();
	let cache = guard.as_ref().expect("paging: init() was never called");
	let obj = cache.alloc().ok_or(Errno::ENOMEM)?;
	let table_ptr = obj.cast::<Table>();
	unsafe {
		table_ptr.as_ptr().write(Table::zeroed());
	}
	Ok(table_ptr)
}

bitflags! {
	/// Flags carried on a [`Vma`] and, materialized, on its backing PTEs.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct VmaFlags: u32 {
		const PRESENT = 0b00001;
		const RW      = 0b00010;
		const USER    = 0b00100;
		const COW     = 0b01000;
		const GLOBAL  = 0b10000;
	}
}

/// A virtual memory area: `[vm_start, vm_end)` with uniform flags (spec section 3).
#[derive(Clone, Debug)]
pub struct Vma {
	pub vm_start: usize,
	pub vm_end: usize,
	pub flags: VmaFlags,
}

impl Vma {
	fn page_count(&self) -> usize {
		(self.vm_end - self.vm_start) / PAGE_SIZE
	}
}

/// A process's address-space descriptor: page directory plus ordered VMA list (spec section 3).
/// The VMA list is kept in a [`BTreeMap`] keyed by `vm_start`, which is naturally sorted and
/// gives disjointness checks and the sorted-list invariant for free (spec's design notes flag
/// the intrusive list as a C-specific device; an arena+index/ordered-map structure is the
/// suggested systems-language substitute).
pub struct Mm {
	pgdir: NonNull<Table>,
	vmas: BTreeMap<usize, Vma>,
	mmap_cache: Option<usize>,
	map_count: usize,
	total_vm_pages: usize,
	start_stack: usize,
}

impl Mm {
	fn new() -> KResult<Self> {
		let pgdir = alloc_table(&PGDIR_CACHE)?;
		Ok(Self {
			pgdir,
			vmas: BTreeMap::new(),
			mmap_cache: None,
			map_count: 0,
			total_vm_pages: 0,
			start_stack: 0,
		})
	}

	pub fn map_count(&self) -> usize {
		self.map_count
	}

	pub fn total_vm_pages(&self) -> usize {
		self.total_vm_pages
	}

	pub fn vmas(&self) -> impl Iterator<Item = &Vma> {
		self.vmas.values()
	}

	pub fn start_stack(&self) -> usize {
		self.start_stack
	}

	fn pgdir(&self) -> &Table {
		unsafe { self.pgdir.as_ref() }
	}

	fn pgdir_mut(&mut self) -> &mut Table {
		unsafe { self.pgdir.as_mut() }
	}

	fn is_disjoint(&self, start: usize, end: usize) -> bool {
		self.vmas
			.values()
			.all(|v| end <= v.vm_start || start >= v.vm_end)
	}

	/// Exposes [`Mm::new`] to sibling test modules (`fault`) that need a blank address space
	/// without going through a process-creation helper.
	#[cfg(test)]
	pub(crate) fn new_for_test() -> KResult<Self> {
		Self::new()
	}
}

/// Exposes [`read_pte`] to sibling test modules.
#[cfg(test)]
pub(crate) fn read_pte_for_test(mm: &mut Mm, vaddr: usize) -> Entry {
	read_pte(mm.pgdir_mut(), vaddr)
}

/// Flags for [`update_vm_area`]: which PTE bits to set, and whether to advance the frame number
/// (`UPDADDR` in the source) or leave existing frame identity untouched.
#[derive(Clone, Copy)]
pub struct UpdateFlags {
	pub present: bool,
	pub rw: bool,
	pub user: bool,
	pub global: bool,
	pub cow: bool,
	pub update_addr: bool,
}

/// Maps/updates `[virt_start, virt_start + size)` in `pgdir`, one page at a time, allocating
/// missing page tables from `pgtbl_cache` on demand (spec 4.2: `update_vm_area`).
pub fn update_vm_area(
	pgdir: &mut Table,
	virt_start: usize,
	phy_start: PhysAddr,
	size: usize,
	flags: UpdateFlags,
) -> KResult<()> {
	let pages = size.div_ceil(PAGE_SIZE);
	let mut phys = phy_start;
	for i in 0..pages {
		let vaddr = virt_start + i * PAGE_SIZE;
		let di = dir_index(vaddr);
		let mut pde = pgdir.entries[di];
		if !pde.present() {
			let table = alloc_table(&PGTBL_CACHE)?;
			pde.set_frame_addr(PhysAddr(table.as_ptr() as usize));
			pde.set_present(true);
			pde.set_rw(true);
			pde.set_user(true);
			pgdir.entries[di] = pde;
		}
		let table = unsafe { &mut *(pfa::lowmem_addr(pde.frame_addr()) as *mut Table) };
		let ti = table_index(vaddr);
		let mut pte = table.entries[ti];
		pte.set_present(flags.present);
		pte.set_rw(flags.rw);
		pte.set_user(flags.user);
		pte.set_global(flags.global);
		pte.set_cow(flags.cow);
		if flags.update_addr {
			pte.set_frame_addr(phys);
			phys = phys.offset(PAGE_SIZE);
		}
		table.entries[ti] = pte;
		fault::tlb_invalidate(vaddr);
	}
	Ok(())
}

/// Creates a new VMA in `mm`. Colliding with an existing VMA is an integrity violation (spec
/// 4.2: "a correct caller never collides") and panics instead of returning an error.
pub fn create_vm_area(mm: &mut Mm, vm_start: usize, size: usize, flags: VmaFlags) -> KResult<()> {
	let size = align_up(size, PAGE_SIZE);
	let vm_end = vm_start + size;
	if !mm.is_disjoint(vm_start, vm_end) {
		crate::kernel_panic!("create_vm_area: VMA collision");
	}
	let pages = size / PAGE_SIZE;

	if flags.contains(VmaFlags::COW) {
		// Backing deferred: entries marked non-present + COW, materialized lazily on fault.
		update_vm_area(
			mm.pgdir_mut(),
			vm_start,
			PhysAddr(0),
			size,
			UpdateFlags {
				present: false,
				rw: flags.contains(VmaFlags::RW),
				user: flags.contains(VmaFlags::USER),
				global: flags.contains(VmaFlags::GLOBAL),
				cow: true,
				update_addr: false,
			},
		)?;
	} else {
		let order = order_for(pages).min(MAX_FRAME_ORDER);
		let phys = pfa::alloc_pages_zeroed(order, Flags::KERNEL).ok_or(Errno::ENOMEM)?;
		update_vm_area(
			mm.pgdir_mut(),
			vm_start,
			phys,
			size,
			UpdateFlags {
				present: true,
				rw: flags.contains(VmaFlags::RW),
				user: flags.contains(VmaFlags::USER),
				global: flags.contains(VmaFlags::GLOBAL),
				cow: false,
				update_addr: true,
			},
		)?;
	}

	mm.vmas.insert(
		vm_start,
		Vma {
			vm_start,
			vm_end,
			flags,
		},
	);
	mm.map_count += 1;
	mm.total_vm_pages += pages;
	mm.mmap_cache = Some(vm_start);
	Ok(())
}

/// Clones `vma` (belonging to `src`) into `dst`.
///
/// Non-COW: fresh physical backing is allocated in `dst` and the source range is copied into it
/// through the identity (lowmem) mapping, standing in for the source's transient-window copy.
///
/// COW: the source range is first marked read-only+COW in `src` (materialized pages only —
/// already-deferred pages have nothing to protect). The destination then mirrors each source
/// page: a materialized source page is shared (frame refcount incremented, same read-only+COW
/// flags); a still-deferred source page is left deferred in the destination too, since neither
/// side has a frame yet for the other to share. Both converge to the spec's invariant: "either
/// shared-non-writable+COW or both already materialized".
pub fn clone_vm_area(src: &mut Mm, vma: &Vma, dst: &mut Mm, cow: bool) -> KResult<()> {
	if cow {
		for page in 0..vma.page_count() {
			let vaddr = vma.vm_start + page * PAGE_SIZE;
			let src_pte = read_pte(src.pgdir_mut(), vaddr);
			if src_pte.present() {
				let mut marked = src_pte;
				marked.set_rw(false);
				marked.set_cow(true);
				write_pte(src.pgdir_mut(), vaddr, marked);
				pfa::page_inc(marked.frame_addr());

				let mut dst_pte = marked;
				dst_pte.set_present(true);
				write_pte_allocating(dst.pgdir_mut(), vaddr, dst_pte)?;
			} else {
				// never materialized on the source side either; both sides fault independently.
				write_pte_allocating(dst.pgdir_mut(), vaddr, src_pte)?;
			}
		}
	} else {
		let order = order_for(vma.page_count()).min(MAX_FRAME_ORDER);
		let phys = pfa::alloc_pages_zeroed(order, Flags::KERNEL).ok_or(Errno::ENOMEM)?;
		update_vm_area(
			dst.pgdir_mut(),
			vma.vm_start,
			phys,
			vma.vm_end - vma.vm_start,
			UpdateFlags {
				present: true,
				rw: true,
				user: vma.flags.contains(VmaFlags::USER),
				global: false,
				cow: false,
				update_addr: true,
			},
		)?;
		for page in 0..vma.page_count() {
			let vaddr = vma.vm_start + page * PAGE_SIZE;
			let src_pte = read_pte(src.pgdir_mut(), vaddr);
			if src_pte.present() {
				unsafe {
					core::ptr::copy_nonoverlapping(
						pfa::lowmem_addr(src_pte.frame_addr()),
						pfa::lowmem_addr(PhysAddr(phys.0 + page * PAGE_SIZE)),
						PAGE_SIZE,
					);
				}
			}
		}
	}

	dst.vmas.insert(
		vma.vm_start,
		Vma {
			vm_start: vma.vm_start,
			vm_end: vma.vm_end,
			flags: vma.flags,
		},
	);
	dst.map_count += 1;
	dst.total_vm_pages += vma.page_count();
	Ok(())
}

fn read_pte(pgdir: &mut Table, vaddr: usize) -> Entry {
	let pde = pgdir.entries[dir_index(vaddr)];
	if !pde.present() {
		return Entry::empty();
	}
	let table = unsafe { &*(pfa::lowmem_addr(pde.frame_addr()) as *const Table) };
	table.entries[table_index(vaddr)]
}

fn write_pte(pgdir: &mut Table, vaddr: usize, pte: Entry) {
	let pde = pgdir.entries[dir_index(vaddr)];
	let table = unsafe { &mut *(pfa::lowmem_addr(pde.frame_addr()) as *mut Table) };
	table.entries[table_index(vaddr)] = pte;
	fault::tlb_invalidate(vaddr);
}

fn write_pte_allocating(pgdir: &mut Table, vaddr: usize, pte: Entry) -> KResult<()> {
	let di = dir_index(vaddr);
	let mut pde = pgdir.entries[di];
	if !pde.present() {
		let table = alloc_table(&PGTBL_CACHE)?;
		pde.set_frame_addr(PhysAddr(table.as_ptr() as usize));
		pde.set_present(true);
		pde.set_rw(true);
		pde.set_user(true);
		pgdir.entries[di] = pde;
	}
	let table = unsafe { &mut *(pfa::lowmem_addr(pde.frame_addr()) as *mut Table) };
	table.entries[table_index(vaddr)] = pte;
	Ok(())
}

/// Destroys the VMA starting at `vm_start`: walks its range page by page, returning frames to
/// the PFA (or just decrementing a still-shared COW frame's refcount), then unlinks and frees
/// the VMA itself and adjusts `mm`'s bookkeeping.
pub fn destroy_vm_area(mm: &mut Mm, vm_start: usize) -> KResult<()> {
	let vma = mm.vmas.remove(&vm_start).ok_or(Errno::EINVAL)?;
	let pages = vma.page_count();
	for page in 0..pages {
		let vaddr = vma.vm_start + page * PAGE_SIZE;
		let pte = read_pte(mm.pgdir_mut(), vaddr);
		if !pte.present() {
			continue;
		}
		let frame = pte.frame_addr();
		if pfa::page_count(frame) > 1 {
			pfa::page_dec(frame);
		} else {
			pfa::free_pages(frame, 0);
		}
	}
	mm.map_count -= 1;
	mm.total_vm_pages -= pages;
	if mm.mmap_cache == Some(vm_start) {
		mm.mmap_cache = None;
	}
	Ok(())
}

/// Builds a fresh `Mm` for a brand-new process: inherits the kernel's global mappings and
/// creates a COW-backed user stack VMA (spec 4.2: "flags `PRESENT|RW|USER|COW`").
pub fn create_blank_process_image(stack_size: usize) -> KResult<Mm> {
	let mut mm = Mm::new()?;
	inherit_kernel_mappings(&mut mm);
	let top = USER_STACK_TOP;
	let start = top - align_up(stack_size, PAGE_SIZE);
	create_vm_area(
		&mut mm,
		start,
		top - start,
		VmaFlags::PRESENT | VmaFlags::RW | VmaFlags::USER | VmaFlags::COW,
	)?;
	mm.start_stack = top;
	Ok(mm)
}

/// Clones `src` wholesale: every VMA is cloned with `cow=true` (spec 4.2: `clone_process_image`).
pub fn clone_process_image(src: &mut Mm) -> KResult<Mm> {
	let mut dst = Mm::new()?;
	inherit_kernel_mappings(&mut dst);
	let starts: alloc::vec::Vec<usize> = src.vmas.keys().copied().collect();
	for start in starts {
		let vma = src.vmas.get(&start).expect("vma list mutated during clone").clone();
		clone_vm_area(src, &vma, &mut dst, true)?;
	}
	dst.start_stack = src.start_stack;
	Ok(dst)
}

fn inherit_kernel_mappings(mm: &mut Mm) {
	let Some(kernel_addr) = *KERNEL_PGDIR.lock() else {
		return;
	};
	let kernel = unsafe { &*(kernel_addr as *const Table) };
	for (i, kpde) in kernel.entries.iter().enumerate() {
		if kpde.present() && kpde.global() {
			mm.pgdir_mut().entries[i] = *kpde;
		}
	}
}

/// Tears down every VMA in `mm`, frees its non-global page tables and its page directory.
///
/// If the caller's current page directory is the one being destroyed, the caller must switch to
/// the kernel's directory before calling this (spec 4.2); that switch is CPU/`CR3` plumbing this
/// core never performs, since it is out of scope (spec section 1).
pub fn destroy_process_image(mut mm: Mm) {
	let starts: alloc::vec::Vec<usize> = mm.vmas.keys().copied().collect();
	for start in starts {
		destroy_vm_area(&mut mm, start).expect("destroy_process_image: VMA vanished mid-teardown");
	}
	for pde in mm.pgdir_mut().entries.iter_mut() {
		if pde.present() && !pde.global() {
			if let Some(table) = NonNull::new(pfa::lowmem_addr(pde.frame_addr())) {
				Cache::free(table);
			}
			*pde = Entry::empty();
		}
	}
	Cache::free(mm.pgdir.cast());
}

/// Finds the first gap of at least `length` bytes strictly between existing VMAs (and the
/// caller-supplied `[floor, ceiling)` bounds), for `mmap`'s no-hint path.
fn find_gap(mm: &Mm, length: usize, floor: usize, ceiling: usize) -> Option<usize> {
	let mut cursor = floor;
	for vma in mm.vmas.values() {
		if vma.vm_start >= cursor + length {
			return Some(cursor);
		}
		cursor = cursor.max(vma.vm_end);
	}
	if cursor + length <= ceiling {
		Some(cursor)
	} else {
		None
	}
}

/// `mmap(addr, length, prot, flags)`: honors `addr` as a hint if the range is free, otherwise
/// finds the first sufficient gap. Always creates a COW-backed VMA (spec 4.2).
pub fn mmap(mm: &mut Mm, addr_hint: usize, length: usize, flags: VmaFlags) -> KResult<usize> {
	let length = align_up(length, PAGE_SIZE);
	let start = if addr_hint != 0 && mm.is_disjoint(addr_hint, addr_hint + length) && addr_hint + length <= PROCESS_END
	{
		addr_hint
	} else {
		find_gap(mm, length, crate::config::ALLOC_BEGIN, PROCESS_END).ok_or(Errno::ENOMEM)?
	};
	create_vm_area(mm, start, length, flags | VmaFlags::COW)?;
	Ok(start)
}

/// `munmap(addr, length)`: only an exact `[addr, addr+length)` match against a VMA's bounds is
/// accepted; partial unmaps are rejected (spec 4.2).
pub fn munmap(mm: &mut Mm, addr: usize, length: usize) -> KResult<()> {
	let length = align_up(length, PAGE_SIZE);
	match mm.vmas.get(&addr) {
		Some(vma) if vma.vm_end - vma.vm_start == length => destroy_vm_area(mm, addr),
		Some(_) => Err(Errno::EINVAL),
		None => Err(Errno::EINVAL),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::pfa::test_harness::init_test_arena;
	use crate::slab::kmalloc;
	use std::sync::Mutex;

	static TEST_LOCK: Mutex<()> = Mutex::new(());

	fn setup(pages: usize) {
		init_test_arena(pages);
		kmalloc::init().expect("kmalloc init");
		reset_test_state();
		init().expect("paging init");
	}

	#[test]
	fn cow_fork_diverges_on_write() {
		let _guard = TEST_LOCK.lock().unwrap();
		setup(512);
		let mut parent = Mm::new().expect("parent mm");
		create_vm_area(
			&mut parent,
			0x4000_0000,
			PAGE_SIZE,
			VmaFlags::PRESENT | VmaFlags::RW | VmaFlags::USER,
		)
		.expect("create vma");
		let pte = read_pte(parent.pgdir_mut(), 0x4000_0000);
		let parent_frame = pte.frame_addr();
		unsafe {
			*pfa::lowmem_addr(parent_frame) = 0xAA;
		}

		let mut child = clone_process_image(&mut parent).expect("clone");
		let child_pte_before = read_pte(child.pgdir_mut(), 0x4000_0000);
		assert!(child_pte_before.cow());
		assert!(!child_pte_before.rw());

		// child writes: resolve the COW fault directly, as a real ISR would.
		let resolved = fault::resolve_cow_for_test(child_pte_before);
		write_pte(child.pgdir_mut(), 0x4000_0000, resolved);
		unsafe {
			*pfa::lowmem_addr(resolved.frame_addr()) = 0xBB;
		}

		let parent_byte = unsafe { *pfa::lowmem_addr(parent_frame) };
		let child_byte = unsafe { *pfa::lowmem_addr(resolved.frame_addr()) };
		assert_eq!(parent_byte, 0xAA, "parent's page must be untouched by child's write");
		assert_eq!(child_byte, 0xBB);
		assert_ne!(resolved.frame_addr(), parent_frame, "child must have its own frame now");
	}

	#[test]
	fn zero_fill_on_demand() {
		let _guard = TEST_LOCK.lock().unwrap();
		setup(256);
		let mut mm = Mm::new().expect("mm");
		create_vm_area(
			&mut mm,
			0x5000_0000,
			PAGE_SIZE,
			VmaFlags::PRESENT | VmaFlags::RW | VmaFlags::USER | VmaFlags::COW,
		)
		.expect("create deferred vma");
		let pte = read_pte(mm.pgdir_mut(), 0x5000_0000);
		assert!(!pte.present());
		let resolved = fault::resolve_cow_for_test(pte);
		write_pte(mm.pgdir_mut(), 0x5000_0000, resolved);
		assert!(resolved.present());
		assert_eq!(pfa::page_count(resolved.frame_addr()), 1);
		let byte = unsafe { *pfa::lowmem_addr(resolved.frame_addr()) };
		assert_eq!(byte, 0);
	}

	#[test]
	fn munmap_rejects_partial_and_accepts_exact() {
		let _guard = TEST_LOCK.lock().unwrap();
		setup(256);
		let mut mm = Mm::new().expect("mm");
		let addr = mmap(&mut mm, 0x5000_0000, 2 * PAGE_SIZE, VmaFlags::PRESENT | VmaFlags::RW | VmaFlags::USER)
			.expect("mmap");
		assert_eq!(munmap(&mut mm, addr, PAGE_SIZE), Err(Errno::EINVAL));
		assert_eq!(munmap(&mut mm, addr, 2 * PAGE_SIZE), Ok(()));
		assert_eq!(mm.map_count(), 0);
	}

	#[test]
	fn vma_list_stays_sorted_and_counted() {
		let _guard = TEST_LOCK.lock().unwrap();
		setup(512);
		let mut mm = Mm::new().expect("mm");
		create_vm_area(&mut mm, 0x4000_2000, PAGE_SIZE, VmaFlags::PRESENT | VmaFlags::RW | VmaFlags::USER)
			.unwrap();
		create_vm_area(&mut mm, 0x4000_0000, PAGE_SIZE, VmaFlags::PRESENT | VmaFlags::RW | VmaFlags::USER)
			.unwrap();
		let starts: alloc::vec::Vec<usize> = mm.vmas().map(|v| v.vm_start).collect();
		assert_eq!(starts, alloc::vec![0x4000_0000, 0x4000_2000]);
		assert_eq!(mm.map_count(), 2);
		assert_eq!(mm.total_vm_pages(), 2);
	}

	#[test]
	#[should_panic(expected = "create_vm_area: VMA collision")]
	fn colliding_vma_panics() {
		let _guard = TEST_LOCK.lock().unwrap();
		setup(256);
		let mut mm = Mm::new().expect("mm");
		create_vm_area(&mut mm, 0x4000_0000, PAGE_SIZE, VmaFlags::PRESENT | VmaFlags::RW | VmaFlags::USER)
			.unwrap();
		create_vm_area(&mut mm, 0x4000_0000, PAGE_SIZE, VmaFlags::PRESENT | VmaFlags::RW | VmaFlags::USER)
			.unwrap();
	}
}
