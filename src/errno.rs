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

//! The errno convention every syscall-facing function in this crate returns through.
//!
//! Section 7 of the design draws a hard line: resource shortage and "the caller asked for
//! something that doesn't exist/isn't allowed" are [`Errno`]s, never panics. Integrity
//! violations (a corrupted free list, a collision a correct caller can't produce) are kernel
//! bugs and go through [`crate::kernel_panic`] instead — there is no `Errno` variant for them.

use core::fmt;

/// A negative-errno-style error code, as returned to userspace by the syscall layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
	/// Operation not permitted.
	EPERM = 1,
	/// No such file or directory.
	ENOENT = 2,
	/// Permission denied.
	EACCES = 13,
	/// Bad address.
	EFAULT = 14,
	/// Device or resource busy.
	EBUSY = 16,
	/// File exists.
	EEXIST = 17,
	/// Not a directory.
	ENOTDIR = 20,
	/// Is a directory.
	EISDIR = 21,
	/// Invalid argument.
	EINVAL = 22,
	/// File table overflow.
	ENFILE = 23,
	/// Out of memory.
	ENOMEM = 12,
	/// Function not implemented.
	ENOSYS = 38,
}

impl Errno {
	/// Returns the negative integer value the syscall layer hands back to userspace.
	pub const fn as_negative(self) -> i32 {
		-(self as i32)
	}
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Errno::EPERM => "EPERM",
			Errno::ENOENT => "ENOENT",
			Errno::EACCES => "EACCES",
			Errno::EFAULT => "EFAULT",
			Errno::EBUSY => "EBUSY",
			Errno::EEXIST => "EEXIST",
			Errno::ENOTDIR => "ENOTDIR",
			Errno::EISDIR => "EISDIR",
			Errno::EINVAL => "EINVAL",
			Errno::ENFILE => "ENFILE",
			Errno::ENOMEM => "ENOMEM",
			Errno::ENOSYS => "ENOSYS",
		};
		write!(f, "{name}")
	}
}

/// The result type returned by every fallible public operation in this crate.
pub type KResult<T> = Result<T, Errno>;

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn negative_convention() {
		assert_eq!(Errno::ENOENT.as_negative(), -2);
		assert_eq!(Errno::ENOSYS.as_negative(), -38);
	}
}
