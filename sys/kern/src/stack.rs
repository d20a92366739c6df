// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task stacks.
//!
//! Each task slot owns one `Stack` in a `StackPool` for the life of the
//! kernel. A task created in the slot uses the top `stack_words` words of it
//! (its *region*). When the task is created the whole region is painted with
//! [`STACK_PAINT`], and then the initial frame is written over the top. The
//! lowest word of the region is the guard: if it ever stops holding the paint
//! value, the task has run off the bottom of its stack.
//!
//! The pool lives outside `Kernel`. A running task's locals live in its
//! stack, and a task holds `&mut` references into them while it calls the
//! kernel, so no reference the kernel holds may cover stack memory. It
//! keeps a `Region` (an address and a length) per task, and only looks at a
//! region's words through raw pointers.

use core::cell::UnsafeCell;

use crate::config::{STACK_WORDS, TASK_SLOTS};
use crate::frame::{self, WORD};

/// Value written over every stack word before a task first runs.
pub const STACK_PAINT: usize = 0xbadd_cafe;

/// Words at the bottom of a region that must keep their paint.
pub const GUARD_WORDS: usize = 1;

/// Smallest region a task may ask for: a frame, the guard, and enough room
/// beyond that for the task to call anything at all.
pub const MIN_TASK_STACK_WORDS: usize =
    frame::frame_words::<crate::arch::Frame>() + GUARD_WORDS + 16;

static_assertions::const_assert!(STACK_WORDS >= MIN_TASK_STACK_WORDS);
static_assertions::const_assert!(STACK_WORDS % 4 == 0);

/// Backing memory for one task slot. Aligned for the strictest of our
/// targets (RISC-V wants 16 bytes, ARM 8).
#[repr(C, align(16))]
struct Stack([usize; STACK_WORDS]);

impl Stack {
    const EMPTY: Self = Self([0; STACK_WORDS]);
}

/// Stack memory for every task slot.
pub struct StackPool(UnsafeCell<[Stack; TASK_SLOTS]>);

// Safety: no reference to the pool's contents is ever produced from a shared
// `StackPool`. `region` only does address arithmetic, and a region's memory
// is accessed through raw pointers or, while no task can be using it,
// through `Region::as_mut_slice`.
unsafe impl Sync for StackPool {}

impl StackPool {
    pub const fn new() -> Self {
        Self(UnsafeCell::new([Stack::EMPTY; TASK_SLOTS]))
    }

    /// The top `words` words of slot `slot`'s stack.
    pub fn region(&self, slot: usize, words: usize) -> Region {
        uassert!(slot < TASK_SLOTS);
        uassert!(words <= STACK_WORDS);
        let stack = self.0.get().cast::<Stack>().wrapping_add(slot);
        let top = stack as usize + core::mem::size_of::<Stack>();
        Region {
            base: top - words * WORD,
            words,
        }
    }
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}

/// The part of a slot's stack that one task uses, by address. Only a
/// `StackPool` makes these, so a region always lies inside a pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    base: usize,
    words: usize,
}

impl Region {
    /// Address of the lowest word, which is the guard.
    pub fn base(self) -> usize {
        self.base
    }

    pub fn words(self) -> usize {
        self.words
    }

    /// Address one past the highest word.
    pub fn top(self) -> usize {
        self.base + self.words * WORD
    }

    /// The region's memory as a slice.
    ///
    /// # Safety
    ///
    /// For as long as the slice lives, no task may be running on this region
    /// and nothing else may refer to its memory.
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [usize] {
        // Safety: the region lies inside a pool and our caller vouches for
        // exclusivity.
        unsafe {
            core::slice::from_raw_parts_mut(self.base as *mut usize, self.words)
        }
    }

    /// Reads word `i` without making a reference to the region, which may
    /// well belong to a task in the middle of using it.
    fn read(self, i: usize) -> usize {
        uassert!(i < self.words);
        // Safety: in bounds of a region of a pool, and `usize` has no
        // invalid bit patterns.
        unsafe { (self.base as *const usize).add(i).read_volatile() }
    }

    /// Checks that the guard at the bottom of the region is intact. On
    /// failure, returns the address of the damaged guard word.
    pub fn check_guard(self) -> Result<(), usize> {
        if self.words != 0 && self.read(0) == STACK_PAINT {
            Ok(())
        } else {
            Err(self.base)
        }
    }

    /// Counts the words at the bottom of the region that still hold paint,
    /// which is how close the task has ever come to overflowing.
    pub fn high_water(self) -> usize {
        (0..self.words)
            .take_while(|&i| self.read(i) == STACK_PAINT)
            .count()
    }

    /// Checks whether `sp` could be the saved stack pointer of a frame of at
    /// least `frame_words` words inside the region, above the guard.
    pub fn frame_fits(self, sp: usize, frame_words: usize) -> bool {
        let bottom = self.base + GUARD_WORDS * WORD;
        sp % WORD == 0
            && sp >= bottom
            && sp
                .checked_add(frame_words * WORD)
                .is_some_and(|frame_end| frame_end <= self.top())
    }
}

/// Fills `words` with the paint value.
pub fn paint(words: &mut [usize]) {
    words.fill(STACK_PAINT);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A pool of its own, for tests that scribble on stacks.
    fn pool() -> &'static StackPool {
        Box::leak(Box::default())
    }

    /// Runs `body` on the region's memory.
    fn with_words(region: Region, body: impl FnOnce(&mut [usize])) {
        // Safety: no tasks run in these tests.
        body(unsafe { region.as_mut_slice() });
    }

    #[test]
    fn painted_region_has_intact_guard_and_full_high_water() {
        let region = pool().region(1, 64);
        with_words(region, paint);
        assert_eq!(region.check_guard(), Ok(()));
        assert_eq!(region.high_water(), 64);
    }

    #[test]
    fn overwritten_guard_reports_its_address() {
        let region = pool().region(1, 64);
        with_words(region, |w| {
            paint(w);
            w[0] = 0;
        });
        assert_eq!(region.check_guard(), Err(region.base()));
    }

    #[test]
    fn high_water_stops_at_first_used_word() {
        let region = pool().region(1, 64);
        with_words(region, |w| {
            paint(w);
            w[10] = 1;
            w[40] = 2;
        });
        assert_eq!(region.high_water(), 10);
    }

    #[test]
    fn regions_share_the_top_of_their_slot() {
        let pool = pool();
        let whole = pool.region(0, STACK_WORDS);
        let part = pool.region(0, 64);
        assert_eq!(part.top(), whole.top());
        assert_eq!(part.base(), whole.top() - 64 * WORD);
        assert_eq!(whole.base() % 16, 0, "slots must be 16-byte aligned");
        assert_eq!(
            pool.region(1, STACK_WORDS).base(),
            whole.top(),
            "slots must be laid out back to back"
        );
    }

    #[test]
    fn frame_fit_rejects_guard_overlap_misalignment_and_overrun() {
        let region = pool().region(0, 64);
        let base = region.base();
        let top = region.top();

        assert!(region.frame_fits(top - 32 * WORD, 32));
        assert!(region.frame_fits(base + WORD, 32));
        assert!(!region.frame_fits(base, 32), "frame over the guard");
        assert!(!region.frame_fits(top - 31 * WORD, 32), "frame past top");
        assert!(!region.frame_fits(top - 32 * WORD + 1, 32), "misaligned");
        assert!(!region.frame_fits(0, 32));
        assert!(!region.frame_fits(usize::MAX - 3, 32));
    }
}
