// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for an architecture, for running the kernel's logic in
//! tests.
//!
//! Nothing here switches stacks. Tests play the part of the interrupt
//! handlers and feed saved stack pointers through `Kernel::switch`
//! themselves; frames use the RISC-V layout so that fabricated stacks have a
//! realistic shape.

use std::cell::Cell;

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

pub type Frame = crate::frame::riscv::TrapFrame;

// Per thread, since every test runs on a thread of its own.
std::thread_local! {
    /// Set by `request_switch` and `yield_now`, for tests to observe.
    static SWITCH_PENDING: Cell<bool> = const { Cell::new(false) };
    /// Whether the test is playing an interrupt handler.
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
}

pub extern "C" fn idle_main(_: usize) {}

pub extern "C" fn task_exit() -> ! {
    crate::api::exit()
}

pub fn request_switch() {
    SWITCH_PENDING.set(true);
}

pub fn yield_now() {
    request_switch();
}

/// Reports and clears a pending switch request.
pub fn take_switch_request() -> bool {
    SWITCH_PENDING.replace(false)
}

pub fn in_interrupt() -> bool {
    IN_INTERRUPT.get()
}

/// Makes `in_interrupt` report `yes` on this thread.
pub fn set_in_interrupt(yes: bool) {
    IN_INTERRUPT.set(yes);
}

pub fn disable_interrupts() {}

/// # Safety
///
/// Trivially safe here; the signature matches the real back ends.
pub unsafe fn start_first_task(_sp: usize) -> ! {
    panic!("entering the first task");
}
