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

//! External contract: the scheduler/process table (spec section 1 names it out of scope beyond
//! its edge with this core). The only edge the fault handler needs is "deliver SIGSEGV to the
//! current task and let the scheduler arrange re-entry" — modeled here as a counter a real
//! scheduler implementation would replace with an actual task suspend/reschedule.

use core::sync::atomic::{AtomicUsize, Ordering};

static SIGSEGV_DELIVERIES: AtomicUsize = AtomicUsize::new(0);

/// Delivers `SIGSEGV` to the current task, per the page-fault handler's user-mode terminal
/// paths (spec 4.2 step 1, step 4).
pub fn deliver_sigsegv() {
	SIGSEGV_DELIVERIES.fetch_add(1, Ordering::SeqCst);
}

/// Number of `SIGSEGV`s delivered so far. Exists for tests to observe the fault handler's
/// user-mode terminal path without a real scheduler to suspend a task in.
pub fn sigsegv_count() -> usize {
	SIGSEGV_DELIVERIES.load(Ordering::SeqCst)
}
