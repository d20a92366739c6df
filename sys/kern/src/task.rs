// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task control blocks and the task registry.

use abi::{
    BlockReason, ExitReason, FaultInfo, Generation, KernelError, Priority,
    TaskId, TaskState,
};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::config::{MAX_ITEM_SIZE, PRIORITY_LEVELS, STACK_WORDS, TASK_SLOTS};
use crate::frame::{self, FrameInit, WORD};
use crate::kernel::{Kernel, IDLE};
use crate::stack::{self, Region, MIN_TASK_STACK_WORDS};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Create(TaskId, Priority),
    Delete(TaskId),
    Exit(TaskId),
    Fault(TaskId, FaultInfo),
}

ringbuf!(TASK_RINGBUF, Trace, 32, Trace::None);

/// A task entry point. The argument is whatever was given to `create`.
///
/// Entry points aren't expected to return, but if one does, the task exits.
pub type TaskEntry = extern "C" fn(usize);

/// Everything needed to create a task.
#[derive(Copy, Clone, Debug)]
pub struct TaskDesc {
    /// Name for debugging; need not be unique.
    pub name: &'static str,
    pub entry: TaskEntry,
    pub arg: usize,
    /// Must be in `1..PRIORITY_LEVELS`; level 0 belongs to idle.
    pub priority: Priority,
    /// How much of the slot's stack the task gets, in words.
    pub stack_words: usize,
}

/// How a blocked task's wait ended. Set by whoever readies the task, and
/// collected by the task once it runs again.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Wake {
    /// The wait ended because the operation completed: the item was taken
    /// (send), an item was delivered to the mailbox (receive), or the delay
    /// elapsed.
    Completed,
    /// The timeout elapsed first.
    TimedOut,
}

/// Holds one queue item on behalf of a blocked task: the item a sender is
/// waiting to deposit, or the item handed to a waiting receiver.
#[derive(Copy, Clone, Debug)]
pub struct Mailbox {
    bytes: [u8; MAX_ITEM_SIZE],
    len: usize,
}

impl Mailbox {
    const EMPTY: Self = Self {
        bytes: [0; MAX_ITEM_SIZE],
        len: 0,
    };

    pub fn fill(&mut self, item: &[u8]) {
        self.bytes[..item.len()].copy_from_slice(item);
        self.len = item.len();
    }

    pub fn contents(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// Internal representation of a task.
#[derive(Debug)]
pub struct Task {
    /// Address of the task's saved frame. Only meaningful while the task is
    /// not running; only the switch path and task creation write it.
    saved_sp: usize,
    priority: Priority,
    pub(crate) state: TaskState,
    /// Ticks left before the current wait times out, if it can.
    pub(crate) delay: Option<u32>,
    pub(crate) wake: Option<Wake>,
    pub(crate) mailbox: Mailbox,
    name: &'static str,
    /// Where the task's stack is. The memory itself belongs to the pool.
    region: Region,
}

impl Task {
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn saved_sp(&self) -> usize {
        self.saved_sp
    }

    pub(crate) fn set_saved_sp(&mut self, sp: usize) {
        self.saved_sp = sp;
    }

    pub fn stack_words(&self) -> usize {
        self.region.words()
    }

    pub fn region(&self) -> Region {
        self.region
    }
}

/// One entry in the task table. The generation outlives the task, so that a
/// stale `TaskId` can be told apart from the slot's next occupant.
#[derive(Debug)]
pub struct Slot {
    pub(crate) generation: Generation,
    pub(crate) task: Option<Task>,
}

impl Slot {
    pub const EMPTY: Self = Self {
        generation: Generation::ZERO,
        task: None,
    };
}

/// Return value for operations that can have scheduling implications. This is
/// marked `must_use` because forgetting to actually update the scheduler after
/// performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever task we were just running.
    Same,
    /// We need to switch tasks; the scheduler will figure out which one.
    Other,
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (NextTask::Same, NextTask::Same) => NextTask::Same,
            _ => NextTask::Other,
        }
    }
}

impl Kernel {
    /// Creates a task from `desc`, making it Ready at its priority.
    ///
    /// Returns the new task's ID, plus whether it should preempt whatever is
    /// running right now.
    pub fn create(
        &mut self,
        desc: &TaskDesc,
    ) -> Result<(TaskId, NextTask), KernelError> {
        if desc.priority == Priority::IDLE
            || desc.priority.level() >= PRIORITY_LEVELS
        {
            return Err(KernelError::BadPriority);
        }
        if !(MIN_TASK_STACK_WORDS..=STACK_WORDS).contains(&desc.stack_words) {
            return Err(KernelError::BadStackSize);
        }
        // A task that deleted itself keeps running on its stack until the
        // switch away from it happens, so its slot isn't reusable until then.
        let index = (1..TASK_SLOTS)
            .find(|&i| {
                self.slots[i].task.is_none() && self.current != Some(i)
            })
            .ok_or(KernelError::PoolExhausted)?;

        self.install(index, desc);
        let id = self.id_of(index);
        ringbuf_entry!(TASK_RINGBUF, Trace::Create(id, desc.priority));
        Ok((id, self.make_ready(index)))
    }

    /// Sets up the idle task in its reserved slot.
    pub(crate) fn install_idle(&mut self, entry: TaskEntry) {
        self.install(
            IDLE,
            &TaskDesc {
                name: "idle",
                entry,
                arg: 0,
                priority: Priority::IDLE,
                stack_words: STACK_WORDS,
            },
        );
    }

    /// Paints the slot's stack, builds the first frame, and fills in the
    /// control block.
    fn install(&mut self, index: usize, desc: &TaskDesc) {
        let region = self.stacks.region(index, desc.stack_words);
        // Safety: nothing runs on a slot being installed. `create` never
        // reuses the current task's slot, and idle is installed before
        // anything runs at all.
        let words = unsafe { region.as_mut_slice() };
        stack::paint(words);
        let base = frame::build::<crate::arch::Frame>(
            words,
            &FrameInit {
                entry: desc.entry as usize,
                arg: desc.arg,
                exit: crate::arch::task_exit as usize,
            },
        );
        let saved_sp = region.base() + base * WORD;

        self.slots[index].task = Some(Task {
            saved_sp,
            priority: desc.priority,
            state: TaskState::Ready,
            delay: None,
            wake: None,
            mailbox: Mailbox::EMPTY,
            name: desc.name,
            region,
        });
    }

    /// Deletes a task, wherever it is, and frees its slot.
    ///
    /// If `id` is the running task, the result is `NextTask::Other` and the
    /// task must not be resumed: the caller switches away and never returns.
    pub fn delete(&mut self, id: TaskId) -> Result<NextTask, KernelError> {
        let index = self.check_task_id(id)?;
        if index == IDLE {
            return Err(KernelError::IllegalTask);
        }

        self.unlink(index);
        let slot = &mut self.slots[index];
        slot.task = None;
        slot.generation = slot.generation.next();
        ringbuf_entry!(TASK_RINGBUF, Trace::Delete(id));

        Ok(if self.current == Some(index) {
            NextTask::Other
        } else {
            NextTask::Same
        })
    }

    /// Marks the running task as having exited. It keeps its slot until
    /// someone deletes it.
    pub fn exit_current(&mut self) -> NextTask {
        let Some(index) = self.current else {
            return NextTask::Same;
        };
        if index == IDLE {
            crate::fail::die("idle task exited");
        }
        let id = self.id_of(index);
        if let Some(task) = &mut self.slots[index].task {
            if !task.state.is_terminated() {
                task.state = TaskState::Terminated(ExitReason::Returned);
                ringbuf_entry!(TASK_RINGBUF, Trace::Exit(id));
            }
        }
        NextTask::Other
    }

    /// Kills a task for a fault, and tells the fault hook about it.
    pub(crate) fn fault(&mut self, index: usize, info: FaultInfo) {
        if index == IDLE {
            crate::fail::die(info);
        }
        self.unlink(index);
        let task = self.task_mut(index);
        task.state = TaskState::Terminated(ExitReason::Faulted(info));

        let id = self.id_of(index);
        ringbuf_entry!(TASK_RINGBUF, Trace::Fault(id, info));
        if let Some(hook) = self.fault_hook {
            hook(id, info);
        }
    }

    /// Kills the running task for a fault the processor reported. A fault
    /// with nobody running, or in idle, is the kernel's own.
    pub fn fault_current(&mut self, info: FaultInfo) -> NextTask {
        let Some(current) = self.current else {
            crate::fail::die(info);
        };
        self.fault(current, info);
        NextTask::Other
    }

    /// Removes a task from whatever ready list or wait list holds it, and
    /// forgets any wait in progress.
    pub(crate) fn unlink(&mut self, index: usize) {
        let Some(task) = &mut self.slots[index].task else {
            return;
        };
        task.delay = None;
        task.wake = None;
        match task.state {
            TaskState::Ready => {
                let priority = task.priority;
                self.ready.remove(priority, index);
            }
            TaskState::Blocked(BlockReason::Send(q)) => {
                self.queue_control_mut(q).senders.remove(index);
            }
            TaskState::Blocked(BlockReason::Receive(q)) => {
                self.queue_control_mut(q).receivers.remove(index);
            }
            TaskState::Blocked(BlockReason::Delay)
            | TaskState::Running
            | TaskState::Terminated(_) => (),
        }
    }

    /// Checks a `TaskId` for validity against the table.
    ///
    /// On success, returns an index that names an occupied slot.
    pub fn check_task_id(&self, id: TaskId) -> Result<usize, KernelError> {
        let slot = self.slots.get(id.index()).ok_or(KernelError::NoSuchTask)?;
        if slot.task.is_none() || slot.generation != id.generation() {
            return Err(KernelError::NoSuchTask);
        }
        Ok(id.index())
    }

    pub fn task_state(&self, id: TaskId) -> Result<TaskState, KernelError> {
        let index = self.check_task_id(id)?;
        Ok(self.task(index).state)
    }

    pub fn task_name(&self, id: TaskId) -> Result<&'static str, KernelError> {
        let index = self.check_task_id(id)?;
        Ok(self.task(index).name)
    }

    pub fn task_priority(&self, id: TaskId) -> Result<Priority, KernelError> {
        let index = self.check_task_id(id)?;
        Ok(self.task(index).priority)
    }

    /// Fewest words of the task's stack that have never been touched.
    pub fn stack_high_water(&self, id: TaskId) -> Result<usize, KernelError> {
        let index = self.check_task_id(id)?;
        Ok(self.task(index).region.high_water())
    }

    /// Checks the stack guard of a task.
    pub(crate) fn check_guard(&self, index: usize) -> Result<(), FaultInfo> {
        self.task(index)
            .region
            .check_guard()
            .map_err(|address| FaultInfo::StackOverflow { address })
    }

    /// Checks the stack guard of a task, and that its saved stack pointer
    /// describes a frame inside its own stack.
    pub(crate) fn check_stack(&self, index: usize) -> Result<(), FaultInfo> {
        self.check_guard(index)?;
        let task = self.task(index);
        if !task.region.frame_fits(
            task.saved_sp,
            frame::frame_words::<crate::arch::Frame>(),
        ) {
            return Err(FaultInfo::InvalidFrame {
                stack_pointer: task.saved_sp,
            });
        }
        Ok(())
    }

    /// Directly corrupts a task's stack guard. Test-only.
    #[cfg(test)]
    pub(crate) fn smash_guard(&mut self, id: TaskId) {
        let region = self.task(id.index()).region;
        // Safety: tests only pretend to run tasks.
        unsafe { region.as_mut_slice()[0] = 0 };
    }
}
