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

//! Compile-time tunables, grouped by subsystem the way the teacher's `.config`-derived constants
//! are. There is no boot/link surface in this core to drive a menu config from (that lives in
//! the syscall dispatcher and boot loader, both out of scope), so these stay plain `pub const`s.

/// The size of a page in bytes (spec section 6).
pub const PAGE_SIZE: usize = 0x1000;

/// Number of entries in a page directory or a page table (spec section 6).
pub const ENTRIES_PER_TABLE: usize = 1024;

/// The highest buddy order the page-frame allocator will hand out, mirroring the teacher's
/// `buddy::MAX_ORDER`.
pub const MAX_FRAME_ORDER: u8 = 17;

/// Pointer to the end of the kernel-reserved low area of virtual memory and the start of the
/// allocatable region, mirroring the teacher's `memory::ALLOC_BEGIN`.
pub const ALLOC_BEGIN: usize = 0x4000_0000;

/// The first address of kernel space; user address space is `[0, PROCESS_END)`.
pub const PROCESS_END: usize = 0xc000_0000;

/// Top of the user stack for a freshly created process image.
pub const USER_STACK_TOP: usize = PROCESS_END - PAGE_SIZE;

/// Default size of a new process's stack VMA, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 8 * PAGE_SIZE;

/// The smallest free-list bin size in the kmalloc byte allocator used for sizes below a page.
pub const KMALLOC_MIN_SIZE: usize = 16;

/// The largest size class served by the cache-backed kmalloc path before falling back straight
/// to the page-frame allocator. Must match the top of `kmalloc::SIZE_CLASSES`.
pub const KMALLOC_MAX_SIZE: usize = PAGE_SIZE;

/// Maximum length of a devfs node's flat path name, mirroring `DEVFS_NAME_MAX` in the original
/// source.
pub const DEVFS_NAME_MAX: usize = 255;

/// Maximum number of live devfs nodes, mirroring `DEVFS_MAX_FILES` in the original source.
pub const DEVFS_MAX_FILES: usize = 1024;

/// Integrity marker stored in every `devfs` node, mirroring `DEVFS_MAGIC_NUMBER` in the original
/// source.
pub const DEVFS_MAGIC: u32 = 0xBF;
