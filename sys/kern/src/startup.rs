// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup, and the one kernel object the system runs on.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::kernel::Kernel;
use crate::stack::StackPool;

/// Every task's stack. Kept apart from `KERNEL` so that borrowing the kernel
/// never borrows the memory the running task is using.
static TASK_STACKS: StackPool = StackPool::new();

/// The kernel. Tasks reach it through `api`, interrupt handlers and the
/// context switch path through `with_kernel`.
static KERNEL: Mutex<RefCell<Kernel>> =
    Mutex::new(RefCell::new(Kernel::new(&TASK_STACKS)));

/// Runs `body` with exclusive access to the kernel, inside a critical
/// section.
///
/// To preserve uniqueness of the `&mut` reference passed into `body`, this
/// function will detect any attempts to call it recursively and die.
pub(crate) fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    critical_section::with(|cs| {
        let Ok(mut kernel) = KERNEL.borrow(cs).try_borrow_mut() else {
            crate::fail::die("recursive use of with_kernel");
        };
        body(&mut kernel)
    })
}

/// Starts the scheduler: installs the idle task and hands the processor to
/// the most important task created so far (or to idle, if there are none).
///
/// Tasks and queues the application needs at startup should be created with
/// `api` before calling this. It doesn't return.
///
/// # Safety
///
/// This function has architecture-specific requirements for safe use. On
/// ARM, for instance, it must be called from the main stack in privileged
/// mode, and on RISC-V from machine mode. It takes over the timer and the
/// context switch interrupt.
///
/// This function may not be called reentrantly or from multiple cores.
pub unsafe fn start_scheduler() -> ! {
    let sp = with_kernel(|k| k.start(crate::arch::idle_main));
    // Safety: `sp` is the frame `start` just chose, and our caller has
    // promised the rest.
    unsafe { crate::arch::start_first_task(sp) }
}
