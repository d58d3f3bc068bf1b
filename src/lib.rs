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

//! `kcore`: the slab allocator, per-process address-space manager, and DevFS pseudo-filesystem
//! of a pedagogical Unix-like kernel.
//!
//! This crate covers three modules end to end — [`pfa`] (page-frame allocation), [`slab`]
//! (object caches and `kmalloc`), [`paging`] (VMAs, COW, the fault handler) and [`devfs`] (the
//! driver-node pseudo-filesystem) — plus the ambient pieces a kernel crate needs regardless of
//! scope: [`errno`], [`panic`], [`io`]'s serial console, and this file's `#[global_allocator]`.
//!
//! [`syscall`] and [`sched`] model only the narrow edge the rest of this crate touches; the real
//! dispatcher, scheduler, VFS layer, and boot/trap plumbing live outside this crate.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod alloc_impl;
pub mod config;
pub mod devfs;
pub mod errno;
pub mod io;
pub mod paging;
pub mod panic;
pub mod pfa;
pub mod sched;
pub mod slab;
pub mod syscall;
pub mod util;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: alloc_impl::KernelAlloc = alloc_impl::KernelAlloc;

#[cfg(not(test))]
#[panic_handler]
fn on_panic(info: &core::panic::PanicInfo) -> ! {
	println!("--- RUST PANIC ---");
	println!("{info}");
	loop {
		#[cfg(feature = "x86")]
		x86_64::instructions::hlt();
		#[cfg(not(feature = "x86"))]
		core::hint::spin_loop();
	}
}

/// Brings up every subsystem that doesn't need boot-time-discovered physical memory bounds:
/// the serial console, the kmalloc size classes, paging's slab caches, and the DevFS singleton.
///
/// The caller's boot code must have already called [`pfa::init`] with the memory map its own
/// arch-specific discovery found — this crate has no way to conjure that out of nothing, same
/// boundary the syscall dispatcher and scheduler sit at (see [`syscall`], [`sched`]).
pub fn init() -> errno::KResult<()> {
	io::init();
	slab::kmalloc::init()?;
	paging::init()?;
	devfs::init()?;
	Ok(())
}
