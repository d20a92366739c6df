// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel object.
//!
//! `Kernel` holds every piece of scheduling state: the task table, the ready
//! lists, the queues and their storage, and the clock. Task stacks are the
//! exception, and live in a `StackPool` the kernel refers to. Its
//! operations are spread across the modules that implement them (`task`,
//! `sched`, `time`, `queue`); this module has the struct itself, a few
//! accessors, and the consistency checker used by the tests.
//!
//! Operations take `&mut self` and never block. An operation that would make
//! the caller wait records the wait and says so, and it's up to whoever called
//! it (the `api` module, on a target) to get off the processor.

use abi::{BlockReason, FaultInfo, KernelError, QueueId, TaskId, TaskState};

use crate::config::{MAX_QUEUES, QUEUE_POOL_BYTES, TASK_SLOTS};
use crate::queue::QueueControl;
use crate::sched::ReadyLists;
use crate::stack::StackPool;
use crate::task::{Slot, Task};
use crate::time::Timestamp;

/// Slot index of the idle task.
pub const IDLE: usize = 0;

/// Called, with the kernel locked, when a task is killed for a fault. It must
/// not call back into the kernel.
pub type FaultHook = fn(TaskId, FaultInfo);

/// What to do when a blocking operation is attempted from a context that
/// can't block (an interrupt handler, or before the scheduler has started).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum IsrBlockingPolicy {
    /// Treat it as a fatal bug, and take the kernel down.
    #[default]
    Fault,
    /// Fail the operation with `KernelError::IllegalBlockingContext`.
    ReturnError,
}

/// Who is calling a kernel operation. Only `Caller::Task` may block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Caller {
    Task,
    Interrupt,
}

pub struct Kernel {
    pub(crate) slots: [Slot; TASK_SLOTS],
    /// Task stack memory, kept out of this struct (see `stack`).
    pub(crate) stacks: &'static StackPool,
    pub(crate) ready: ReadyLists,
    pub(crate) queues: [Option<QueueControl>; MAX_QUEUES],
    pub(crate) queue_pool: [u8; QUEUE_POOL_BYTES],
    pub(crate) pool_used: usize,
    /// Slot index of the task on the processor, once started.
    pub(crate) current: Option<usize>,
    pub(crate) started: bool,
    pub(crate) now: Timestamp,
    pub(crate) switches: u64,
    pub(crate) fault_hook: Option<FaultHook>,
    pub(crate) isr_policy: IsrBlockingPolicy,
}

impl Kernel {
    pub const fn new(stacks: &'static StackPool) -> Self {
        const NO_QUEUE: Option<QueueControl> = None;
        Self {
            slots: [Slot::EMPTY; TASK_SLOTS],
            stacks,
            ready: ReadyLists::new(),
            queues: [NO_QUEUE; MAX_QUEUES],
            queue_pool: [0; QUEUE_POOL_BYTES],
            pool_used: 0,
            current: None,
            started: false,
            now: Timestamp::ZERO,
            switches: 0,
            fault_hook: None,
            isr_policy: IsrBlockingPolicy::Fault,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// The task on the processor, if the scheduler has started.
    pub fn current_task(&self) -> Option<TaskId> {
        self.current.map(|i| self.id_of(i))
    }

    /// Saved stack pointer of a task that isn't running.
    pub fn saved_sp(&self, id: TaskId) -> Result<usize, KernelError> {
        let index = self.check_task_id(id)?;
        Ok(self.task(index).saved_sp())
    }

    /// Number of times the processor has changed hands.
    pub fn context_switches(&self) -> u64 {
        self.switches
    }

    pub fn set_fault_hook(&mut self, hook: Option<FaultHook>) {
        self.fault_hook = hook;
    }

    pub fn set_isr_blocking_policy(&mut self, policy: IsrBlockingPolicy) {
        self.isr_policy = policy;
    }

    pub fn isr_blocking_policy(&self) -> IsrBlockingPolicy {
        self.isr_policy
    }

    pub(crate) fn id_of(&self, index: usize) -> TaskId {
        TaskId::for_index_and_gen(index, self.slots[index].generation)
    }

    /// The task in an occupied slot. Callers must have checked that the slot
    /// is occupied.
    pub(crate) fn task(&self, index: usize) -> &Task {
        match &self.slots[index].task {
            Some(task) => task,
            None => crate::fail::die("empty task slot"),
        }
    }

    pub(crate) fn task_mut(&mut self, index: usize) -> &mut Task {
        match &mut self.slots[index].task {
            Some(task) => task,
            None => crate::fail::die("empty task slot"),
        }
    }

    /// Checks the cross-structure invariants of the scheduler and queues,
    /// returning the first one found broken.
    pub fn audit(&self) -> Result<(), Violation> {
        let mut running = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(task) = &slot.task else { continue };
            match task.state {
                TaskState::Running => {
                    if running.replace(i).is_some() {
                        return Err(Violation::MultipleRunning);
                    }
                    if self.current != Some(i) {
                        return Err(Violation::RunningNotCurrent(i));
                    }
                }
                TaskState::Ready => {
                    if i != IDLE
                        && !self.ready.level(task.priority()).contains(i)
                    {
                        return Err(Violation::ReadyNotListed(i));
                    }
                }
                TaskState::Blocked(BlockReason::Send(q)) => {
                    if !self.waiters(q, true).is_some_and(|l| l.contains(i)) {
                        return Err(Violation::WaiterNotListed(i));
                    }
                }
                TaskState::Blocked(BlockReason::Receive(q)) => {
                    if !self.waiters(q, false).is_some_and(|l| l.contains(i)) {
                        return Err(Violation::WaiterNotListed(i));
                    }
                }
                TaskState::Blocked(BlockReason::Delay)
                | TaskState::Terminated(_) => (),
            }
        }
        // Between an operation and the switch it asks for, the current task
        // may be blocked or gone, but once started some task is current.
        if self.started && self.current.is_none() {
            return Err(Violation::NothingCurrent);
        }

        let mut seen = [false; TASK_SLOTS];
        for (level, list) in self.ready.iter() {
            for i in list.iter() {
                let ok = i != IDLE
                    && self.slots[i].task.as_ref().is_some_and(|t| {
                        t.state == TaskState::Ready
                            && t.priority().level() == level
                    });
                if !ok {
                    return Err(Violation::BadReadyEntry(i));
                }
                if core::mem::replace(&mut seen[i], true) {
                    return Err(Violation::Duplicate(i));
                }
            }
        }

        for (qi, q) in self.queues.iter().enumerate() {
            let Some(q) = q else { continue };
            let id = QueueId(qi as u8);
            if q.count > q.capacity {
                return Err(Violation::QueueOverfull(id));
            }
            if !q.receivers.is_empty() && q.count != 0 {
                return Err(Violation::ReceiversWithItems(id));
            }
            if !q.senders.is_empty() && q.count != q.capacity {
                return Err(Violation::SendersWithSpace(id));
            }
            for (list, reason) in [
                (&q.senders, BlockReason::Send(id)),
                (&q.receivers, BlockReason::Receive(id)),
            ] {
                for i in list.iter() {
                    let blocked = self.slots[i]
                        .task
                        .as_ref()
                        .is_some_and(|t| t.state == TaskState::Blocked(reason));
                    if !blocked {
                        return Err(Violation::BadWaiter(i));
                    }
                    if core::mem::replace(&mut seen[i], true) {
                        return Err(Violation::Duplicate(i));
                    }
                }
            }
        }
        Ok(())
    }

    fn waiters(
        &self,
        q: QueueId,
        senders: bool,
    ) -> Option<&crate::sched::TaskList> {
        let control = self.queues.get(q.index())?.as_ref()?;
        Some(if senders {
            &control.senders
        } else {
            &control.receivers
        })
    }
}

/// A broken kernel invariant, as reported by [`Kernel::audit`]. Task numbers
/// are slot indices.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Violation {
    MultipleRunning,
    RunningNotCurrent(usize),
    NothingCurrent,
    ReadyNotListed(usize),
    WaiterNotListed(usize),
    BadReadyEntry(usize),
    BadWaiter(usize),
    Duplicate(usize),
    QueueOverfull(QueueId),
    ReceiversWithItems(QueueId),
    SendersWithSpace(QueueId),
}
