// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv{6,7,8}-M.
//!
//! # ARM-M timer
//!
//! We use the system tick timer as the kernel timer. It's only suitable for
//! producing periodic interrupts, which is all we need: each SysTick
//! interrupt is one kernel tick.
//!
//! # Notes on ARM-M interrupts
//!
//! This implementation uses three exception handlers:
//!
//! - `SysTick` runs the tick processing.
//! - `PendSV` performs every context switch.
//! - `SVCall` is used exactly once, to leave the startup code and enter the
//!   first task.
//!
//! On any exception, the processor stacks a small subset of machine state (the
//! `BaseExceptionFrame`) on the interrupted stack and calls our handler, which
//! is a normal Rust function following the C calling convention. That's
//! great as long as the handler returns to the code it interrupted, but a
//! context switch needs the *rest* of the interrupted task's registers saved
//! somewhere it can find them again, and needs to restore a different task's
//! registers on the way out.
//!
//! That's relatively costly, so it's only appropriate in a handler that we
//! believe will result in a context switch. Most ticks and most device
//! interrupts don't. So none of those handlers save the full state; instead,
//! if one of them discovers that a context switch is required, it sets the
//! `PendSV` interrupt pending. Tasks that need to give up the processor
//! (because they're blocking, or yielding) do exactly the same thing.
//!
//! `PendSV` is intended for this exact use. It runs at the lowest priority,
//! so it kicks in when every other handler has exited, and performs the full
//! save/restore sequence around invoking the scheduler. It pushes `r4`-`r11`
//! and `EXC_RETURN` (the `SoftwareFrame`) on the task's stack, right below
//! what the hardware pushed, and hands the resulting stack pointer to
//! `Kernel::switch`. Because a timer-driven switch and a voluntary one both go
//! through `PendSV`, a task's saved frame looks the same however it was
//! suspended.
//!
//! Tasks run privileged, on the process stack.

use core::arch::{self, global_asm};
use core::mem::size_of;

use abi::FaultInfo;
use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::SCB;

use crate::config::TICK_DIVISOR;
use crate::frame::arm_m::{SoftwareFrame, EXC_RETURN_THREAD_PSP};
use crate::startup::with_kernel;
use crate::task::NextTask;

macro_rules! uassert {
    ($cond : expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// Register image saved for a suspended task.
pub type Frame = crate::frame::arm_m::ExceptionFrame;

/// Body of the idle task.
pub extern "C" fn idle_main(_: usize) {
    loop {
        cortex_m::asm::wfi();
    }
}

/// Where a task's entry function returns to.
pub extern "C" fn task_exit() -> ! {
    crate::api::exit()
}

/// Asks for a context switch as soon as no other handler is running.
///
/// From a task, with interrupts enabled, this takes effect before the next
/// instruction. With interrupts masked, or from a handler, it takes effect
/// once they're unmasked or the handler returns.
pub fn request_switch() {
    SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Gives up the processor so that the scheduler can run.
pub fn yield_now() {
    request_switch();
}

/// Checks whether we're running in a handler rather than in a task.
pub fn in_interrupt() -> bool {
    SCB::vect_active() != VectActive::ThreadMode
}

pub fn disable_interrupts() {
    cortex_m::interrupt::disable();
}

/// Configures exceptions and the tick timer, then enters the task whose frame
/// is at `sp`.
///
/// # Safety
///
/// Call this exactly once, from Thread mode on the main stack, with `sp`
/// fresh from `Kernel::start`.
pub unsafe fn start_first_task(sp: usize) -> ! {
    // Enable faults and set fault/exception priorities to reasonable settings.
    // Our goal here is to keep the kernel non-preemptive, which means the
    // kernel entry points (SVCall, PendSV, SysTick) must be at one priority
    // level. Fault handlers need to be higher priority, however, so that we
    // can detect faults in tasks no matter what.
    //
    // Safety: we're purely lowering priorities from their defaults, so it
    // can't cause any surprise preemption. But these operations are `unsafe`
    // in the `cortex_m` crate.
    unsafe {
        let scb = &*SCB::PTR;
        // Faults on, on the processors that distinguish faults. This
        // distinguishes the following faults from HardFault:
        //
        // - ARMv7+: MEMFAULT, BUSFAULT, USGFAULT
        // - ARMv8: SECUREFAULT
        cfg_if::cfg_if! {
            if #[cfg(armv7m)] {
                scb.shcsr.modify(|x| x | 0b111 << 16);
            } else if #[cfg(armv8m)] {
                scb.shcsr.modify(|x| x | 0b1111 << 16);
            } else if #[cfg(armv6m)] {
                // This facility is missing.
            } else {
                compile_error!("missing fault setup for ARM profile");
            }
        }

        // Set fault and standard exception priorities.
        cfg_if::cfg_if! {
            if #[cfg(armv6m)] {
                // ARMv6 only has 4 priority levels and no configurable fault
                // priorities. Set priorities of SVCall, SysTick and PendSV to 3
                // (the lowest configurable).
                scb.shpr[0].modify(|x| x | 0b11 << 30);
                scb.shpr[1].modify(|x| x | 0b11 << 22 | 0b11 << 30);
            } else if #[cfg(any(armv7m, armv8m))] {
                // Set priority of Usage, Bus, MemManage to 0 (highest
                // configurable).
                scb.shpr[0].write(0x00);
                scb.shpr[1].write(0x00);
                scb.shpr[2].write(0x00);
                // Set priority of SVCall to 0xFF (lowest configurable).
                scb.shpr[7].write(0xFF);
                // SysTick and PendSV also to 0xFF
                scb.shpr[10].write(0xFF);
                scb.shpr[11].write(0xFF);
            } else {
                compile_error!("missing fault priorities for ARM profile");
            }
        }

        #[cfg(any(armv7m, armv8m))]
        {
            // Trap on division by zero rather than quietly returning 0.
            const DIV_0_TRP: u32 = 1 << 4;
            scb.ccr.modify(|x| x | DIV_0_TRP);
        }
    }

    // Safety: this, too, is safe in practice but unsafe in API.
    unsafe {
        // Configure the timer, but leave it stopped: the first tick must not
        // land before the first task's frame has been restored. SVCall starts
        // it.
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(TICK_DIVISOR - 1);
        // Clear current value.
        syst.cvr.write(0);
    }

    // Safety: this is setting the Process (task) stack pointer, which has no
    // effect _assuming_ this code is running on the Main (kernel) stack. It
    // points at the hardware part of the first task's frame.
    unsafe {
        cortex_m::register::psp::write((sp + size_of::<SoftwareFrame>()) as u32);
    }

    // Restore the software part of the frame by hand, then flip into Handler
    // mode by a trap. The SVCall handler below returns into Thread mode on
    // the process stack, which pops the hardware part.
    cfg_if::cfg_if! {
        if #[cfg(armv6m)] {
            unsafe {
                arch::asm!("
                    @ restore the callee-save registers
                    ldm r0!, {{r4-r7}}
                    ldm r0, {{r0-r3}}
                    mov r11, r3
                    mov r10, r2
                    mov r9, r1
                    mov r8, r0
                    @ Trap into the kernel.
                    svc #0xFF
                    @ noreturn generates a UDF here in case that should return.
                    ",
                    in("r0") sp,
                    options(noreturn),
                )
            }
        } else if #[cfg(any(armv7m, armv8m))] {
            unsafe {
                arch::asm!("
                    @ Restore callee-save registers.
                    ldm r0, {{r4-r11}}
                    @ Trap into the kernel.
                    svc #0xFF
                    @ noreturn generates a UDF here in case that should return.
                    ",
                    in("r0") sp,
                    options(noreturn),
                )
            }
        } else {
            compile_error!("missing kernel bootstrap sequence for ARM profile");
        }
    }
}

/// Called from `SVCall` on the way into the first task.
#[no_mangle]
extern "C" fn start_tick() {
    // Safety: enabling the counter and its interrupt has no memory safety
    // implications. The register API doesn't know this.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.csr.modify(|v| v | 0b111);
    }
}

// Handler that gets linked into the vector table for the Supervisor Call (SVC)
// instruction. The only SVC is the one in `start_first_task`, so this starts
// the tick and returns into Thread mode on the process stack.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        bl start_tick
        @ Manufacture an EXC_RETURN to change the processor mode and stack
        @ when we return.
        ldr r0, ={exc_return}
        mov lr, r0
        bx lr
    ",
    exc_return = const EXC_RETURN_THREAD_PSP,
}

/// Handler that gets linked into the vector table for the System Tick Timer
/// overflow interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    // If any timeouts fired, or the time slice is up, we need to defer a
    // context switch, because the entry sequence to this ISR doesn't save
    // state.
    if with_kernel(|k| k.tick()) != NextTask::Same {
        SCB::set_pendsv();
    }
}

cfg_if::cfg_if! {
    if #[cfg(armv6m)] {
        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                @ make room for the software frame below the hardware one.
                mrs r0, PSP
                subs r0, #36
                @ store r4-r11, then EXC_RETURN. Only r4-r7 can be stored
                @ directly.
                mov r1, r0
                stm r1!, {{r4-r7}}
                mov r4, r8
                mov r5, r9
                mov r6, r10
                mov r7, r11
                stm r1!, {{r4-r7}}
                mov r4, lr
                str r4, [r1]

                @ r0 is the saved frame; get back the next task's.
                bl switch_context

                @ restore the high registers and EXC_RETURN first, using
                @ r4-r7 as scratch.
                mov r1, r0
                adds r1, #16
                ldm r1!, {{r4-r7}}
                mov r8, r4
                mov r9, r5
                mov r10, r6
                mov r11, r7
                ldr r4, [r1]
                mov lr, r4
                adds r1, #4
                msr PSP, r1
                @ now the low registers.
                ldm r0!, {{r4-r7}}

                @ resume
                bx lr
            ",
        }
    } else if #[cfg(all(any(armv7m, armv8m), has_fpu))] {
        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                mrs r0, PSP
                @ if the task has FP context (EXC_RETURN bit 4 clear), the
                @ hardware stacked s0-s15; we add s16-s31.
                tst lr, #0x10
                it eq
                vstmdbeq r0!, {{s16-s31}}
                stmdb r0!, {{r4-r11, lr}}

                @ r0 is the saved frame; get back the next task's.
                bl switch_context

                ldmia r0!, {{r4-r11, lr}}
                tst lr, #0x10
                it eq
                vldmiaeq r0!, {{s16-s31}}
                msr PSP, r0

                @ resume
                bx lr
            ",
        }
    } else if #[cfg(any(armv7m, armv8m))] {
        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                mrs r0, PSP
                stmdb r0!, {{r4-r11, lr}}

                @ r0 is the saved frame; get back the next task's.
                bl switch_context

                ldmia r0!, {{r4-r11, lr}}
                msr PSP, r0

                @ resume
                bx lr
            ",
        }
    } else {
        compile_error!("missing PendSV impl for ARM profile.");
    }
}

/// The Rust side of the PendSV handler, after all volatile registers have been
/// saved on the outgoing task's stack.
#[no_mangle]
extern "C" fn switch_context(saved_sp: usize) -> usize {
    with_kernel(|k| k.switch(saved_sp))
}

// Faults. Configurable faults (ARMv7+) and HardFault all go to `handle_fault`
// with EXC_RETURN and the exception number. If it returns, a context switch
// is pending, and it happens before the faulting task could resume.
cfg_if::cfg_if! {
    if #[cfg(armv6m)] {
        global_asm!{"
            .section .text.HardFault
            .globl HardFault
            .type HardFault,function
            HardFault:
                mov r0, lr
                movs r1, #3
                ldr r2, =handle_fault
                bx r2
            ",
        }
    } else if #[cfg(any(armv7m, armv8m))] {
        global_asm!{"
            .section .text.configurable_fault
            .globl configurable_fault
            .type configurable_fault,function
            configurable_fault:
                mov r0, lr
                @ Exception number is the bottom bits of IPSR; every fault
                @ routed here is below 16.
                mrs r1, IPSR
                and r1, r1, #0xf
                b handle_fault

            .section .text.MemoryManagement
            .globl MemoryManagement
            .type MemoryManagement,function
            MemoryManagement:
                b configurable_fault

            .section .text.BusFault
            .globl BusFault
            .type BusFault,function
            BusFault:
                b configurable_fault

            .section .text.UsageFault
            .globl UsageFault
            .type UsageFault,function
            UsageFault:
                b configurable_fault

            .section .text.HardFault
            .globl HardFault
            .type HardFault,function
            HardFault:
                b configurable_fault
            ",
        }
    } else {
        compile_error!("missing fault handlers for ARM profile.");
    }
}

/// Bits of EXC_RETURN that are set when returning to Thread mode on the
/// process stack, i.e. when the exception interrupted a task.
const EXC_RETURN_FROM_TASK: u32 = 0b1100;

/// Kills the task that faulted.
///
/// # Safety
///
/// Only to be called from the fault handler shims above.
#[no_mangle]
unsafe extern "C" fn handle_fault(exc_return: u32, exception: u32) {
    if exc_return & EXC_RETURN_FROM_TASK != EXC_RETURN_FROM_TASK {
        crate::fail::die("kernel fault");
    }
    let info = fault_info(exception);
    let _ = with_kernel(|k| k.fault_current(info));
    SCB::set_pendsv();
}

#[cfg(armv6m)]
fn fault_info(_exception: u32) -> FaultInfo {
    // ARMv6-M, to reduce complexity, does not distinguish fault causes.
    FaultInfo::InvalidOperation(0)
}

#[cfg(any(armv7m, armv8m))]
fn fault_info(exception: u32) -> FaultInfo {
    const IACCVIOL: u32 = 1 << 0;
    const MMARVALID: u32 = 1 << 7;
    const BFARVALID: u32 = 1 << 15;
    const UNDEFINSTR: u32 = 1 << 16;
    const INVSTATE: u32 = 1 << 17;

    // Safety: reading fault status has no side effects; writing the value
    // back clears exactly the bits we've consumed.
    let scb = unsafe { &*SCB::PTR };
    let cfsr = scb.cfsr.read();
    unsafe { scb.cfsr.write(cfsr) };

    match exception {
        // MemManage
        4 if cfsr & IACCVIOL != 0 => FaultInfo::IllegalText,
        4 => FaultInfo::MemoryAccess {
            address: (cfsr & MMARVALID != 0).then(|| scb.mmfar.read() as usize),
        },
        // BusFault
        5 => FaultInfo::MemoryAccess {
            address: (cfsr & BFARVALID != 0).then(|| scb.bfar.read() as usize),
        },
        // UsageFault
        6 if cfsr & UNDEFINSTR != 0 => FaultInfo::IllegalInstruction,
        6 if cfsr & INVSTATE != 0 => FaultInfo::IllegalText,
        _ => FaultInfo::InvalidOperation(cfsr),
    }
}
