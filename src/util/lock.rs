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

//! A spinlock that also disables interrupts for the duration of the critical section.
//!
//! Section 5 of the design requires slab and page-frame allocator state to be serialized
//! against interrupt contexts that also allocate. On a single core with interrupt preemption,
//! that means: no real contention, but a held lock must not be preempted by an ISR that
//! re-enters the same allocator.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "x86")]
#[inline]
fn interrupts_enabled() -> bool {
	x86_64::instructions::interrupts::are_enabled()
}

#[cfg(feature = "x86")]
#[inline]
fn disable_interrupts() {
	x86_64::instructions::interrupts::disable();
}

#[cfg(feature = "x86")]
#[inline]
fn restore_interrupts(were_enabled: bool) {
	if were_enabled {
		x86_64::instructions::interrupts::enable();
	}
}

#[cfg(not(feature = "x86"))]
#[inline]
fn interrupts_enabled() -> bool {
	false
}

#[cfg(not(feature = "x86"))]
#[inline]
fn disable_interrupts() {}

#[cfg(not(feature = "x86"))]
#[inline]
fn restore_interrupts(_were_enabled: bool) {}

/// An interrupt-disabling spinlock around a `T`.
pub struct IntMutex<T: ?Sized> {
	locked: AtomicBool,
	data: UnsafeCell<T>,
}

// Safety: access to `data` is only ever granted through `lock`, which enforces exclusivity.
unsafe impl<T: ?Sized + Send> Sync for IntMutex<T> {}

impl<T> IntMutex<T> {
	/// Creates a new unlocked mutex wrapping `data`.
	pub const fn new(data: T) -> Self {
		Self {
			locked: AtomicBool::new(false),
			data: UnsafeCell::new(data),
		}
	}
}

impl<T: ?Sized> IntMutex<T> {
	/// Locks the mutex, disabling interrupts until the returned guard is dropped.
	pub fn lock(&self) -> IntMutexGuard<T> {
		let were_enabled = interrupts_enabled();
		disable_interrupts();
		while self
			.locked
			.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			core::hint::spin_loop();
		}
		IntMutexGuard {
			mutex: self,
			were_enabled,
		}
	}

	/// Returns a mutable reference to the inner value, bypassing locking.
	///
	/// # Safety
	///
	/// The caller must guarantee no other reference, locked or not, is live.
	pub unsafe fn get_mut_unchecked(&self) -> &mut T {
		&mut *self.data.get()
	}
}

/// RAII guard returned by [`IntMutex::lock`]. Unlocks and restores the interrupt flag on drop.
pub struct IntMutexGuard<'a, T: ?Sized> {
	mutex: &'a IntMutex<T>,
	were_enabled: bool,
}

impl<T: ?Sized> Deref for IntMutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.mutex.data.get() }
	}
}

impl<T: ?Sized> DerefMut for IntMutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.mutex.data.get() }
	}
}

impl<T: ?Sized> Drop for IntMutexGuard<'_, T> {
	fn drop(&mut self) {
		self.mutex.locked.store(false, Ordering::Release);
		restore_interrupts(self.were_enabled);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn lock_unlock() {
		let m = IntMutex::new(0usize);
		{
			let mut g = m.lock();
			*g += 1;
		}
		assert_eq!(*m.lock(), 1);
	}

	#[test]
	fn reentrant_after_drop() {
		let m = IntMutex::new(Vec::<i32>::new());
		m.lock().push(1);
		m.lock().push(2);
		assert_eq!(*m.lock(), vec![1, 2]);
	}
}
