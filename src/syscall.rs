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

//! External contract: the syscall dispatcher (spec section 1 names it out of scope beyond its
//! narrow contact with this core: numeric dispatch with `ENOSYS` on out-of-range, and `mmap`'s
//! indirected-argument convention, spec section 4.4/6).

use crate::errno::Errno;

/// A syscall handler: six trap-frame register arguments in, a negative-errno-or-value result.
pub type SyscallFn = fn(&[usize; 6]) -> isize;

/// Dispatches syscall number `nr`. Unregistered or out-of-range numbers return `ENOSYS`, never
/// panic: this is ordinary userspace misbehavior, not an integrity violation.
pub fn dispatch(table: &[Option<SyscallFn>], nr: usize, args: &[usize; 6]) -> isize {
	match table.get(nr).and_then(|f| *f) {
		Some(f) => f(args),
		None => Errno::ENOSYS.as_negative() as isize,
	}
}

/// The six-field struct `mmap`'s syscall entry reads its arguments from instead of taking them
/// directly in registers (spec section 4.4: "dispatched via an indirection that reads six
/// arguments from a user-provided struct").
#[repr(C)]
pub struct MmapArgs {
	pub addr: usize,
	pub length: usize,
	pub prot: usize,
	pub flags: usize,
	pub fd: usize,
	pub offset: usize,
}

#[cfg(test)]
mod test {
	use super::*;

	fn ok_call(_args: &[usize; 6]) -> isize {
		42
	}

	#[test]
	fn out_of_range_is_enosys() {
		let table: [Option<SyscallFn>; 1] = [Some(ok_call)];
		assert_eq!(dispatch(&table, 5, &[0; 6]), Errno::ENOSYS.as_negative() as isize);
	}

	#[test]
	fn registered_call_dispatches() {
		let table: [Option<SyscallFn>; 1] = [Some(ok_call)];
		assert_eq!(dispatch(&table, 0, &[0; 6]), 42);
	}
}
