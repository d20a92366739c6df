// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for 32-bit RISC-V in machine mode.
//!
//! Tasks and kernel both run in machine mode. There's one trap vector
//! (`mtvec` in direct mode), and every trap, whether an interrupt or an
//! exception, takes the same path: push a complete `TrapFrame` on the task's
//! stack, move to the interrupt stack, and call `trap_handler` with the frame
//! address. Whatever stack pointer comes back is where the frame is restored
//! from, so switching tasks is just a matter of returning a different one.
//!
//! Interrupts don't nest. `mstatus.MIE` is cleared on trap entry and stays
//! clear until the `mret`.
//!
//! # Timer and software interrupt
//!
//! The tick comes from the CLINT machine timer: each timer interrupt advances
//! `mtimecmp` by one tick's worth of `mtime` counts. A context switch
//! requested from inside a critical section or a handler raises the machine
//! software interrupt (`msip`), which is taken as soon as interrupts are
//! enabled again. A task that wants to give up the processor right away uses
//! `ecall`.

use core::arch::{asm, global_asm};
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use abi::FaultInfo;
use critical_section::{Mutex, RawRestoreState};

use crate::config::{CLINT_BASE, ISR_STACK_WORDS, TICK_DIVISOR};
use crate::frame::riscv::TrapFrame;
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
pub type Frame = TrapFrame;

const MSTATUS_MIE: usize = 1 << 3;
const MIE_MSIE: usize = 1 << 3;
const MIE_MTIE: usize = 1 << 7;

const MCAUSE_INTERRUPT: usize = 1 << 31;
const MCAUSE_MACHINE_SOFT: usize = MCAUSE_INTERRUPT | 3;
const MCAUSE_MACHINE_TIMER: usize = MCAUSE_INTERRUPT | 7;
const MCAUSE_MACHINE_EXTERNAL: usize = MCAUSE_INTERRUPT | 11;
const MCAUSE_ECALL_M: usize = 11;

/// Set while `trap_handler` runs. Only ever loaded and stored, since the
/// base ISA has no read-modify-write atomics.
static IN_TRAP: AtomicBool = AtomicBool::new(false);

/// Handler for machine external interrupts, installed by the application.
static EXTERNAL_HANDLER: Mutex<Cell<Option<fn()>>> = Mutex::new(Cell::new(None));

#[repr(C, align(16))]
struct IsrStack([usize; ISR_STACK_WORDS]);

/// Stack that `trap_handler` runs on.
#[used]
static mut ISR_STACK: IsrStack = IsrStack([0; ISR_STACK_WORDS]);

/// Body of the idle task.
pub extern "C" fn idle_main(_: usize) {
    loop {
        // Safety: `wfi` has no memory effects.
        unsafe { asm!("wfi", options(nomem, nostack)) };
    }
}

/// Where a task's entry function returns to.
pub extern "C" fn task_exit() -> ! {
    crate::api::exit()
}

/// Asks for a context switch as soon as interrupts are enabled.
pub fn request_switch() {
    clint::set_msip(true);
}

/// Gives up the processor immediately.
pub fn yield_now() {
    // Safety: the trap handler returns here (well, to the next instruction)
    // when this task is next scheduled.
    unsafe { asm!("ecall") };
}

/// Checks whether we're running in a trap handler rather than in a task.
pub fn in_interrupt() -> bool {
    IN_TRAP.load(Ordering::Relaxed)
}

pub fn disable_interrupts() {
    // Safety: masking interrupts can't violate memory safety.
    unsafe { asm!("csrci mstatus, {mie}", mie = const MSTATUS_MIE) };
}

/// Installs the function to call for machine external interrupts. It runs in
/// interrupt context.
pub fn set_external_handler(handler: fn()) {
    critical_section::with(|cs| EXTERNAL_HANDLER.borrow(cs).set(Some(handler)));
}

/// Points the trap vector at the kernel, arms the timer, and enters the task
/// whose frame is at `sp`.
///
/// # Safety
///
/// Call this exactly once, with `sp` fresh from `Kernel::start`.
pub unsafe fn start_first_task(sp: usize) -> ! {
    // Safety: we're taking over the trap vector and timer, which nothing
    // else uses before the kernel starts.
    unsafe {
        asm!(
            "csrci mstatus, {mie}",
            "la {tmp}, trap_entry",
            "csrw mtvec, {tmp}",
            mie = const MSTATUS_MIE,
            tmp = out(reg) _,
        );
        clint::set_mtimecmp(clint::mtime().wrapping_add(u64::from(TICK_DIVISOR)));
        asm!(
            "csrs mie, {bits}",
            bits = in(reg) MIE_MTIE | MIE_MSIE,
        );
    }

    // Restoring the first frame sets `mstatus` from it, and `mret` turns
    // interrupts on.
    unsafe {
        asm!(
            "mv sp, {sp}",
            "tail trap_restore",
            sp = in(reg) sp,
            options(noreturn),
        )
    }
}

global_asm! {"
    .section .text.trap_entry
    .globl trap_entry
    .type trap_entry,@function
    .p2align 2
    trap_entry:
        # Save the interrupted task's registers below its stack pointer, in
        # the order of `TrapFrame`.
        addi sp, sp, -128
        sw ra, 0(sp)
        sw t0, 4(sp)
        sw t1, 8(sp)
        sw t2, 12(sp)
        sw s0, 16(sp)
        sw s1, 20(sp)
        sw a0, 24(sp)
        sw a1, 28(sp)
        sw a2, 32(sp)
        sw a3, 36(sp)
        sw a4, 40(sp)
        sw a5, 44(sp)
        sw a6, 48(sp)
        sw a7, 52(sp)
        sw s2, 56(sp)
        sw s3, 60(sp)
        sw s4, 64(sp)
        sw s5, 68(sp)
        sw s6, 72(sp)
        sw s7, 76(sp)
        sw s8, 80(sp)
        sw s9, 84(sp)
        sw s10, 88(sp)
        sw s11, 92(sp)
        sw t3, 96(sp)
        sw t4, 100(sp)
        sw t5, 104(sp)
        sw t6, 108(sp)
        csrr t0, mepc
        sw t0, 112(sp)
        csrr t0, mstatus
        sw t0, 116(sp)

        # trap_handler(frame, mcause, mtval), on the interrupt stack.
        mv a0, sp
        csrr a1, mcause
        csrr a2, mtval
        la sp, {isr_stack}
        li t0, {isr_stack_bytes}
        add sp, sp, t0
        call trap_handler

        # a0 is the frame to restore, perhaps another task's.
        mv sp, a0

    .globl trap_restore
    trap_restore:
        lw t0, 112(sp)
        csrw mepc, t0
        lw t0, 116(sp)
        csrw mstatus, t0
        lw ra, 0(sp)
        lw t0, 4(sp)
        lw t1, 8(sp)
        lw t2, 12(sp)
        lw s0, 16(sp)
        lw s1, 20(sp)
        lw a0, 24(sp)
        lw a1, 28(sp)
        lw a2, 32(sp)
        lw a3, 36(sp)
        lw a4, 40(sp)
        lw a5, 44(sp)
        lw a6, 48(sp)
        lw a7, 52(sp)
        lw s2, 56(sp)
        lw s3, 60(sp)
        lw s4, 64(sp)
        lw s5, 68(sp)
        lw s6, 72(sp)
        lw s7, 76(sp)
        lw s8, 80(sp)
        lw s9, 84(sp)
        lw s10, 88(sp)
        lw s11, 92(sp)
        lw t3, 96(sp)
        lw t4, 100(sp)
        lw t5, 104(sp)
        lw t6, 108(sp)
        addi sp, sp, 128
        mret
    ",
    isr_stack = sym ISR_STACK,
    isr_stack_bytes = const ISR_STACK_WORDS * 4,
}

/// The Rust side of every trap. `sp` is the address of the frame just saved;
/// the return value is the address of the frame to restore.
#[no_mangle]
extern "C" fn trap_handler(sp: usize, mcause: usize, mtval: usize) -> usize {
    if IN_TRAP.load(Ordering::Relaxed) {
        crate::fail::die("trap in trap handler");
    }
    IN_TRAP.store(true, Ordering::Relaxed);

    let next = match mcause {
        MCAUSE_MACHINE_TIMER => {
            clint::set_mtimecmp(
                clint::mtimecmp().wrapping_add(u64::from(TICK_DIVISOR)),
            );
            with_kernel(|k| match k.tick() {
                NextTask::Same => sp,
                NextTask::Other => k.switch(sp),
            })
        }
        MCAUSE_MACHINE_SOFT => {
            clint::set_msip(false);
            with_kernel(|k| k.switch(sp))
        }
        MCAUSE_MACHINE_EXTERNAL => {
            let handler =
                critical_section::with(|cs| EXTERNAL_HANDLER.borrow(cs).get());
            if let Some(handler) = handler {
                handler();
            }
            // Anything it readied gets the processor by way of `msip`.
            sp
        }
        MCAUSE_ECALL_M => {
            // Resume after the `ecall`, not on it.
            //
            // The frame is on the task's stack, which is not ours to make
            // references into, so this goes through the raw pointer.
            //
            // Safety: `sp` is the frame trap_entry just pushed.
            unsafe {
                let frame = sp as *mut TrapFrame;
                let mepc = core::ptr::addr_of_mut!((*frame).mepc);
                mepc.write(mepc.read().wrapping_add(4));
            }
            with_kernel(|k| k.switch(sp))
        }
        cause if cause & MCAUSE_INTERRUPT != 0 => sp,
        cause => {
            let info = fault_info(cause, mtval);
            with_kernel(|k| {
                let _ = k.fault_current(info);
                k.switch(sp)
            })
        }
    };

    IN_TRAP.store(false, Ordering::Relaxed);
    next
}

fn fault_info(mcause: usize, mtval: usize) -> FaultInfo {
    match mcause {
        // Instruction address misaligned, instruction access fault.
        0 | 1 => FaultInfo::IllegalText,
        2 => FaultInfo::IllegalInstruction,
        // Load/store misaligned or access fault.
        4..=7 => FaultInfo::MemoryAccess {
            address: Some(mtval),
        },
        _ => FaultInfo::InvalidOperation(mcause as u32),
    }
}

/// Masks machine interrupts for the duration of a critical section.
struct MachineModeCs;
critical_section::set_impl!(MachineModeCs);

// Safety: single hart, and the previous interrupt state is restored exactly.
unsafe impl critical_section::Impl for MachineModeCs {
    unsafe fn acquire() -> RawRestoreState {
        let mstatus: usize;
        unsafe {
            asm!(
                "csrrci {0}, mstatus, {mie}",
                out(reg) mstatus,
                mie = const MSTATUS_MIE,
            );
        }
        mstatus & MSTATUS_MIE != 0
    }

    unsafe fn release(was_enabled: RawRestoreState) {
        if was_enabled {
            unsafe { asm!("csrsi mstatus, {mie}", mie = const MSTATUS_MIE) };
        }
    }
}

/// The core-local interruptor, hart 0.
mod clint {
    use super::CLINT_BASE;
    use core::ptr::{read_volatile, write_volatile};

    const MSIP: usize = CLINT_BASE;
    const MTIMECMP: usize = CLINT_BASE + 0x4000;
    const MTIME: usize = CLINT_BASE + 0xBFF8;

    pub fn set_msip(pending: bool) {
        // Safety: MSIP is a CLINT register at a fixed offset.
        unsafe { write_volatile(MSIP as *mut u32, u32::from(pending)) }
    }

    /// Reads a 64-bit counter that can tick between the two halves.
    fn read64(addr: usize) -> u64 {
        let lo = addr as *const u32;
        let hi = (addr + 4) as *const u32;
        // Safety: the CLINT's timer registers are at fixed offsets.
        unsafe {
            loop {
                let h = read_volatile(hi);
                let l = read_volatile(lo);
                if read_volatile(hi) == h {
                    return u64::from(h) << 32 | u64::from(l);
                }
            }
        }
    }

    pub fn mtime() -> u64 {
        read64(MTIME)
    }

    pub fn mtimecmp() -> u64 {
        read64(MTIMECMP)
    }

    pub fn set_mtimecmp(value: u64) {
        let lo = MTIMECMP as *mut u32;
        let hi = (MTIMECMP + 4) as *mut u32;
        // Safety: as above. Parking the high half at its maximum first keeps
        // a half-written compare value from firing early.
        unsafe {
            write_volatile(hi, u32::MAX);
            write_volatile(lo, value as u32);
            write_volatile(hi, (value >> 32) as u32);
        }
    }
}
