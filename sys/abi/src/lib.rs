// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and applications.

#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Names a particular incarnation of a task.
///
/// A `TaskId` combines two fields, a task index (which can be predicted at
/// compile time) and a task generation number. The generation number begins
/// counting at zero and wraps on overflow. Critically, the generation number
/// of a task is incremented when its slot is freed by deletion. This ensures
/// that an ID held by another task continues to refer to the deleted
/// incarnation, rather than whatever task is later created in the same slot.
///
/// The task index is in the lower `TaskId::INDEX_BITS` bits, while the
/// generation is in the remaining top bits.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// Number of bits in a `TaskId` used to represent task index, rather than
    /// generation number.
    pub const INDEX_BITS: u32 = 8;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// The idle task always occupies slot zero and is never deleted, so its
    /// ID never changes.
    pub const IDLE: Self = Self::for_index_and_gen(0, Generation::ZERO);

    /// Fabricates a `TaskId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        TaskId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Type used to track generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically *higher*
/// priorities are more important. Priority 0 is reserved for the idle task,
/// which runs only when nothing else can.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`, to
/// keep us from confusing ourselves on whether `>` means numerically greater or
/// more important.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
    Default,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// The level occupied by the idle task and nothing else.
    pub const IDLE: Self = Self(0);

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// Index of this priority's ready list.
    pub fn level(self) -> usize {
        usize::from(self.0)
    }
}

/// Names a blocking queue. Queues are never destroyed, so unlike `TaskId`
/// there is no generation.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct QueueId(pub u8);

impl QueueId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// How long a blocking operation is willing to wait, in ticks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Timeout {
    /// Wait at most this many ticks. Zero never blocks.
    Ticks(u32),
    /// Wait until the operation can complete, however long that takes.
    Forever,
}

impl Timeout {
    /// Fail immediately instead of blocking.
    pub const NONE: Self = Self::Ticks(0);

    /// Number of ticks to load into the delay counter, or `None` when the
    /// wait is unbounded.
    pub fn ticks(self) -> Option<u32> {
        match self {
            Self::Ticks(n) => Some(n),
            Self::Forever => None,
        }
    }

    /// Checks whether this timeout permits blocking at all.
    pub fn can_block(self) -> bool {
        self != Self::NONE
    }
}

/// State used to make scheduling decisions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Eligible to run, sitting in the ready list for its priority.
    Ready,
    /// Currently holding the processor. At most one task is in this state.
    Running,
    /// Waiting for something.
    Blocked(BlockReason),
    /// Will never run again. The slot stays occupied until the task is
    /// deleted.
    Terminated(ExitReason),
}

impl TaskState {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

/// Why a task is in `TaskState::Blocked`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockReason {
    /// Sleeping for a fixed number of ticks.
    Delay,
    /// Waiting for space in a queue, holding an item to deposit.
    Send(QueueId),
    /// Waiting for an item to arrive in a queue.
    Receive(QueueId),
}

/// How a task came to be terminated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExitReason {
    /// The task called `exit`, or returned from its entry point.
    Returned,
    /// The kernel killed the task.
    Faulted(FaultInfo),
}

/// A record describing a fault taken by a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultInfo {
    /// The guard word at the bottom of the task's stack was overwritten. The
    /// address is that of the guard word.
    StackOverflow { address: usize },
    /// The task's saved stack pointer does not describe a frame that lies
    /// inside its own stack.
    InvalidFrame { stack_pointer: usize },
    /// The task has violated memory access rules. This is `Option` because
    /// there are cases of processor faults that don't provide a precise
    /// address.
    MemoryAccess { address: Option<usize> },
    /// Attempt to execute non-executable memory
    IllegalText,
    /// Execution of an illegal instruction
    IllegalInstruction,
    /// Other invalid operation, with an architecture-specific code.
    InvalidOperation(u32),
}

impl core::fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::StackOverflow { address } => {
                write!(f, "stack overflow (guard at {address:#x})")
            }
            Self::InvalidFrame { stack_pointer } => {
                write!(f, "invalid saved frame at {stack_pointer:#x}")
            }
            Self::MemoryAccess { address: Some(a) } => {
                write!(f, "memory access fault at {a:#x}")
            }
            Self::MemoryAccess { address: None } => {
                f.write_str("memory access fault")
            }
            Self::IllegalText => f.write_str("illegal text"),
            Self::IllegalInstruction => f.write_str("illegal instruction"),
            Self::InvalidOperation(code) => {
                write!(f, "invalid operation {code:#x}")
            }
        }
    }
}

/// Errors returned from kernel operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelError {
    /// No free task slot (and therefore no free stack).
    PoolExhausted,
    /// A blocking operation waited as long as it was allowed to.
    Timeout,
    /// An operation that would block, or a task creation, was attempted
    /// from interrupt context; or a blocking operation was attempted before
    /// any task was running.
    IllegalBlockingContext,
    /// The `TaskId` is out of range, or names a deleted incarnation.
    NoSuchTask,
    /// The operation isn't allowed on this task (e.g. deleting idle).
    IllegalTask,
    /// Priority is the idle level or past the configured number of levels.
    BadPriority,
    /// Requested stack is smaller than a frame or larger than a stack slot.
    BadStackSize,
    /// The `QueueId` does not name a created queue.
    NoSuchQueue,
    /// Zero capacity, zero item size, or an item larger than a mailbox.
    BadQueueShape,
    /// The buffer passed to a queue operation isn't exactly one item long.
    ItemSizeMismatch,
    /// Queues must be created before the scheduler starts.
    AlreadyStarted,
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::PoolExhausted => "pool exhausted",
            Self::Timeout => "timed out",
            Self::IllegalBlockingContext => "blocking call from interrupt",
            Self::NoSuchTask => "no such task",
            Self::IllegalTask => "operation not permitted on task",
            Self::BadPriority => "bad priority",
            Self::BadStackSize => "bad stack size",
            Self::NoSuchQueue => "no such queue",
            Self::BadQueueShape => "bad queue shape",
            Self::ItemSizeMismatch => "item size mismatch",
            Self::AlreadyStarted => "scheduler already started",
        };
        f.write_str(s)
    }
}
