// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel crashes/failures such that they can be found by
//! tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is false until the
//!   kernel reaches the `die` function (either explicitly or as a result of a
//!   `panic!`), and true after.
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The `die` routine
//!   writes as much of the failure reason into this buffer (as UTF-8) as
//!   possible, truncating if the buffer fills. For printing, trim off any
//!   trailing NUL bytes.
//!
//! The kernel dies when it can't continue: the idle task faulting or
//! returning, a broken internal invariant, or a blocking call from interrupt
//! context under [`IsrBlockingPolicy::Fault`]. Faults in ordinary tasks kill
//! only the task.
//!
//! On the host, `die` panics instead, so that tests can observe it.
//!
//! [`IsrBlockingPolicy::Fault`]: crate::kernel::IsrBlockingPolicy::Fault

use core::fmt::Display;

#[cfg(target_os = "none")]
use core::{fmt::Write, sync::atomic::Ordering};

/// Flag that gets set to `true` by all failure reporting functions, giving
/// tools a one-stop-shop for doing kernel triage.
#[cfg(target_os = "none")]
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

#[cfg(target_os = "none")]
const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of the
/// event that caused the kernel to fail, padded with NULs.
#[cfg(target_os = "none")]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: interrupts may be enabled here, but a second caller would have
    // to arrive by way of a fault or panic inside this function, which we
    // catch below and refuse to go any further.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Recursive failure. Panicking again would only make it worse.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: only one execution of this function gets past the flag.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    // Stop the world; nothing else gets to run on a dead kernel.
    crate::arch::disable_interrupts();

    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    loop {
        // Platform-independent NOP
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(not(target_os = "none"))]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    panic!("kernel died: {msg}")
}

#[cfg(target_os = "none")]
struct Eulogist {
    dest: &'static mut [u8],
}

#[cfg(target_os = "none")]
impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
