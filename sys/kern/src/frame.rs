// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Saved register frames.
//!
//! Every architecture back end saves a task's registers *on the task's own
//! stack*, and records the resulting stack pointer in the task's control
//! block. The layouts are described here as `#[repr(C)]` structs, lowest
//! address first, so that the assembly in `arch` and the initial frames built
//! by [`build`] can't disagree about where a register lives.
//!
//! The layouts are compiled for every target, including the host, where the
//! fields are simply wider. That lets the tests check both layouts without
//! hardware.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of one stack word, in bytes.
pub const WORD: usize = core::mem::size_of::<usize>();

/// Everything needed to fabricate the first frame of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameInit {
    /// Address of the task's entry function.
    pub entry: usize,
    /// Value handed to the entry function as its only argument.
    pub arg: usize,
    /// Address the entry function returns to, if it ever does.
    pub exit: usize,
}

/// A register image in the form the context switch engine saves and
/// restores.
pub trait Frame: IntoBytes + Immutable + Sized {
    /// Produces the frame that, once restored, starts executing at
    /// `init.entry` with `init.arg` in the first argument register and
    /// `init.exit` as the return address. Every other register is zero.
    fn initial(init: &FrameInit) -> Self;
}

/// Number of stack words a frame of type `F` occupies.
pub const fn frame_words<F: Frame>() -> usize {
    core::mem::size_of::<F>() / WORD
}

/// Writes the initial frame for a task into the top of `region` (its stack)
/// and returns the word index where the frame begins. That word is where the
/// task's saved stack pointer must point.
///
/// `region` must be at least `frame_words::<F>()` long; stack slots are sized
/// so that this holds (see `stack::MIN_TASK_STACK_WORDS`).
pub fn build<F: Frame>(region: &mut [usize], init: &FrameInit) -> usize {
    let base = region.len() - frame_words::<F>();
    region[base..]
        .as_mut_bytes()
        .copy_from_slice(F::initial(init).as_bytes());
    base
}

/// ARM M-profile layout.
///
/// The hardware pushes `BaseExceptionFrame` on exception entry; PendSV then
/// pushes `SoftwareFrame` below it. On FPU parts, a task that has touched the
/// FPU also gets `s16`-`s31` between the two (signalled by bit 4 of
/// `exc_return` being clear); fresh frames never do.
pub mod arm_m {
    use super::*;

    /// Initial program status register value: Thumb bit set, everything else
    /// clear.
    pub const INITIAL_PSR: usize = 1 << 24;

    /// `EXC_RETURN` value for "return to Thread mode, use PSP, no FP state".
    pub const EXC_RETURN_THREAD_PSP: usize = 0xFFFF_FFFD;

    /// Registers saved by the PendSV handler.
    #[derive(
        Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
    )]
    #[repr(C)]
    pub struct SoftwareFrame {
        pub r4: usize,
        pub r5: usize,
        pub r6: usize,
        pub r7: usize,
        pub r8: usize,
        pub r9: usize,
        pub r10: usize,
        pub r11: usize,
        pub exc_return: usize,
    }

    /// Registers stacked by the processor on exception entry.
    #[derive(
        Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
    )]
    #[repr(C)]
    pub struct BaseExceptionFrame {
        pub r0: usize,
        pub r1: usize,
        pub r2: usize,
        pub r3: usize,
        pub r12: usize,
        pub lr: usize,
        pub pc: usize,
        pub xpsr: usize,
    }

    #[derive(
        Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
    )]
    #[repr(C)]
    pub struct ExceptionFrame {
        pub software: SoftwareFrame,
        pub base: BaseExceptionFrame,
    }

    impl Frame for ExceptionFrame {
        fn initial(init: &FrameInit) -> Self {
            Self {
                software: SoftwareFrame {
                    exc_return: EXC_RETURN_THREAD_PSP,
                    ..Default::default()
                },
                base: BaseExceptionFrame {
                    r0: init.arg,
                    lr: init.exit,
                    // Function addresses carry the Thumb bit; the stacked
                    // return address must not. The T bit lives in xPSR.
                    pc: init.entry & !1,
                    xpsr: INITIAL_PSR,
                    ..Default::default()
                },
            }
        }
    }
}

/// RISC-V machine-mode layout.
///
/// One trap entry saves everything for both interrupts and `ecall`, so this
/// includes the caller-saved registers. `sp` isn't stored: it *is* the
/// frame's address. `gp` and `tp` are shared by all tasks and left alone.
/// The frame is padded to 32 words to keep the stack 16-byte aligned.
pub mod riscv {
    use super::*;

    /// `mstatus` image for a new task: MPP = machine, MPIE set, so that
    /// `mret` enters the task with interrupts enabled.
    pub const INITIAL_MSTATUS: usize = (0b11 << 11) | (1 << 7);

    #[derive(
        Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
    )]
    #[repr(C)]
    pub struct TrapFrame {
        pub ra: usize,
        pub t0: usize,
        pub t1: usize,
        pub t2: usize,
        pub s0: usize,
        pub s1: usize,
        pub a0: usize,
        pub a1: usize,
        pub a2: usize,
        pub a3: usize,
        pub a4: usize,
        pub a5: usize,
        pub a6: usize,
        pub a7: usize,
        pub s2: usize,
        pub s3: usize,
        pub s4: usize,
        pub s5: usize,
        pub s6: usize,
        pub s7: usize,
        pub s8: usize,
        pub s9: usize,
        pub s10: usize,
        pub s11: usize,
        pub t3: usize,
        pub t4: usize,
        pub t5: usize,
        pub t6: usize,
        pub mepc: usize,
        pub mstatus: usize,
        pub _pad: [usize; 2],
    }

    impl Frame for TrapFrame {
        fn initial(init: &FrameInit) -> Self {
            Self {
                ra: init.exit,
                a0: init.arg,
                mepc: init.entry,
                mstatus: INITIAL_MSTATUS,
                ..Default::default()
            }
        }
    }

    static_assertions::const_assert_eq!(frame_words::<TrapFrame>(), 32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    const INIT: FrameInit = FrameInit {
        entry: 0x0800_1235,
        arg: 0xA5A5,
        exit: 0x0800_4001,
    };

    fn word(offset: usize) -> usize {
        offset / WORD
    }

    #[test]
    fn frame_sits_at_top_of_region() {
        let mut region = [0x5555usize; 64];
        let base = build::<riscv::TrapFrame>(&mut region, &INIT);
        assert_eq!(base, 64 - 32);
        assert!(
            region[..base].iter().all(|&w| w == 0x5555),
            "words below the frame must be untouched"
        );
    }

    #[test]
    fn riscv_frame_primes_entry_arg_and_return() {
        let mut region = [0xFFFF_FFFFusize; 48];
        let base = build::<riscv::TrapFrame>(&mut region, &INIT);
        let frame = &region[base..];
        let at = |off| frame[word(off)];

        assert_eq!(at(offset_of!(riscv::TrapFrame, mepc)), INIT.entry);
        assert_eq!(at(offset_of!(riscv::TrapFrame, a0)), INIT.arg);
        assert_eq!(at(offset_of!(riscv::TrapFrame, ra)), INIT.exit);
        assert_eq!(
            at(offset_of!(riscv::TrapFrame, mstatus)),
            riscv::INITIAL_MSTATUS
        );

        let primed = [
            offset_of!(riscv::TrapFrame, mepc),
            offset_of!(riscv::TrapFrame, a0),
            offset_of!(riscv::TrapFrame, ra),
            offset_of!(riscv::TrapFrame, mstatus),
        ]
        .map(word);
        for (i, &w) in frame.iter().enumerate() {
            if !primed.contains(&i) {
                assert_eq!(w, 0, "word {i} of a fresh frame should be zero");
            }
        }
    }

    #[test]
    fn riscv_trap_offsets_match_assembly() {
        // The trap entry sequence in arch::riscv32 hardcodes these.
        assert_eq!(offset_of!(riscv::TrapFrame, ra) / WORD, 0);
        assert_eq!(offset_of!(riscv::TrapFrame, a0) / WORD, 6);
        assert_eq!(offset_of!(riscv::TrapFrame, s2) / WORD, 14);
        assert_eq!(offset_of!(riscv::TrapFrame, t3) / WORD, 24);
        assert_eq!(offset_of!(riscv::TrapFrame, mepc) / WORD, 28);
        assert_eq!(offset_of!(riscv::TrapFrame, mstatus) / WORD, 29);
    }

    #[test]
    fn arm_frame_matches_exception_entry_layout() {
        use arm_m::{BaseExceptionFrame, ExceptionFrame, SoftwareFrame};

        assert_eq!(frame_words::<ExceptionFrame>(), 9 + 8);
        assert_eq!(
            offset_of!(ExceptionFrame, base),
            core::mem::size_of::<SoftwareFrame>(),
            "hardware frame must sit directly above the software frame"
        );
        assert_eq!(offset_of!(BaseExceptionFrame, pc) / WORD, 6);
        assert_eq!(offset_of!(SoftwareFrame, exc_return) / WORD, 8);
    }

    #[test]
    fn arm_frame_clears_thumb_bit_in_pc() {
        let frame = arm_m::ExceptionFrame::initial(&INIT);
        assert_eq!(frame.base.pc, 0x0800_1234);
        assert_eq!(frame.base.xpsr, arm_m::INITIAL_PSR);
        assert_eq!(frame.base.r0, INIT.arg);
        assert_eq!(frame.base.lr, INIT.exit);
        assert_eq!(frame.software.exc_return, arm_m::EXC_RETURN_THREAD_PSP);
        assert_eq!(frame.software.r4, 0);
        assert_eq!(frame.base.r12, 0);
    }
}
