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

//! The kernel's only log sink: a 16550 serial port. `print!`/`println!` write here; there is no
//! VGA text console in this core since the framebuffer driver lives outside the scope (DevFS
//! only needs *a* character sink to exercise its file-ops, not a real console driver).

pub mod serial;

use crate::util::lock::IntMutex;
use serial::Serial;

/// The global serial console every `print!`/`println!` goes through.
pub static CONSOLE: IntMutex<Option<Serial>> = IntMutex::new(None);

/// Initializes the serial console on COM1. Must be called once before the first `println!`.
pub fn init() {
	*CONSOLE.lock() = Some(Serial::new(serial::COM1));
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
	use core::fmt::Write;
	if let Some(port) = CONSOLE.lock().as_mut() {
		let _ = port.write_fmt(args);
	}
}

/// Prints to the kernel's serial console.
#[macro_export]
macro_rules! print {
	($($arg:tt)*) => {
		$crate::io::_print(core::format_args!($($arg)*))
	};
}

/// Prints to the kernel's serial console, with a trailing newline.
#[macro_export]
macro_rules! println {
	() => { $crate::print!("\n") };
	($($arg:tt)*) => {{
		$crate::io::_print(core::format_args!($($arg)*));
		$crate::print!("\n");
	}};
}
