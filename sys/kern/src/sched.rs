// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ready lists and task selection.
//!
//! Each priority level has a FIFO of Ready tasks. The scheduler always runs
//! the head of the most important non-empty list, and falls back to the idle
//! task, which lives in no list at all, when every list is empty.
//!
//! Where a task lands in its list decides round-robin order:
//!
//! - A task that becomes Ready (new, or done waiting) goes to the tail.
//! - A task that gives up the processor voluntarily, or whose time slice ends
//!   on a tick, goes to the tail.
//! - A task that is preempted by a more important one goes to the *head*, so
//!   that it picks up where it left off before its peers get a turn.

use abi::{Priority, TaskId, TaskState};
use heapless::Deque;
use ringbuf::{ringbuf, ringbuf_entry};

use crate::config::{PRIORITY_LEVELS, TASK_SLOTS};
use crate::kernel::{Kernel, IDLE};
use crate::task::{NextTask, TaskEntry};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Start,
    Switch(TaskId),
}

ringbuf!(SCHED_RINGBUF, Trace, 64, Trace::None);

/// A FIFO of task slot indices.
///
/// Every task is in at most one list at a time, so a list can never need more
/// than `TASK_SLOTS` entries.
pub struct TaskList(Deque<usize, TASK_SLOTS>);

impl TaskList {
    pub const fn new() -> Self {
        Self(Deque::new())
    }

    pub fn push_back(&mut self, index: usize) {
        uassert!(self.0.push_back(index).is_ok());
    }

    pub fn push_front(&mut self, index: usize) {
        uassert!(self.0.push_front(index).is_ok());
    }

    pub fn pop_front(&mut self) -> Option<usize> {
        self.0.pop_front()
    }

    /// Removes `index` from the list, keeping everything else in order.
    /// Returns whether it was there.
    pub fn remove(&mut self, index: usize) -> bool {
        let mut found = false;
        for _ in 0..self.0.len() {
            let Some(i) = self.0.pop_front() else { break };
            if i == index && !found {
                found = true;
            } else {
                // Can't fail: we just made room.
                let _ = self.0.push_back(i);
            }
        }
        found
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0.iter().any(|&i| i == index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for TaskList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// One `TaskList` per priority level. Level 0 belongs to idle and stays empty.
pub struct ReadyLists([TaskList; PRIORITY_LEVELS]);

impl ReadyLists {
    pub const fn new() -> Self {
        const EMPTY: TaskList = TaskList::new();
        Self([EMPTY; PRIORITY_LEVELS])
    }

    pub fn level(&self, priority: Priority) -> &TaskList {
        &self.0[priority.level()]
    }

    /// Adds a task at the tail of its level.
    pub fn enqueue(&mut self, priority: Priority, index: usize) {
        self.0[priority.level()].push_back(index);
    }

    /// Puts a preempted task back at the head of its level.
    pub fn requeue_front(&mut self, priority: Priority, index: usize) {
        self.0[priority.level()].push_front(index);
    }

    pub fn remove(&mut self, priority: Priority, index: usize) -> bool {
        self.0[priority.level()].remove(index)
    }

    /// Takes the head of the most important non-empty level.
    pub fn pop_highest(&mut self) -> Option<usize> {
        self.0.iter_mut().rev().find_map(TaskList::pop_front)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(TaskList::is_empty)
    }

    /// Iterates over `(level, list)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &TaskList)> + '_ {
        self.0.iter().enumerate()
    }
}

impl Kernel {
    /// Picks the task that should run next and takes it off its ready list.
    /// Idle when nothing else is Ready.
    pub fn select_next(&mut self) -> TaskId {
        let index = self.ready.pop_highest().unwrap_or(IDLE);
        self.id_of(index)
    }

    /// Moves a task to Ready at the tail of its level, and works out whether
    /// it should preempt the task on the processor.
    pub(crate) fn make_ready(&mut self, index: usize) -> NextTask {
        let task = self.task_mut(index);
        task.state = TaskState::Ready;
        let priority = task.priority();
        self.ready.enqueue(priority, index);

        if !self.started {
            return NextTask::Same;
        }
        let Some(current) = self.current else {
            return NextTask::Same;
        };
        match &self.slots[current].task {
            Some(cur)
                if cur.state == TaskState::Running
                    && !priority.is_more_important_than(cur.priority()) =>
            {
                NextTask::Same
            }
            // Either outranked, or the processor is being vacated anyway.
            _ => NextTask::Other,
        }
    }

    /// Sends the running task to the back of its level, if anyone else at
    /// that level is waiting for a turn. Used for both explicit yields and
    /// time slicing.
    pub fn yield_current(&mut self) -> NextTask {
        let Some(current) = self.current else {
            return NextTask::Same;
        };
        if current == IDLE {
            return if self.ready.is_empty() {
                NextTask::Same
            } else {
                NextTask::Other
            };
        }
        let Some(task) = self.slots[current].task.as_mut() else {
            return NextTask::Other;
        };
        if task.state != TaskState::Running {
            return NextTask::Other;
        }
        let priority = task.priority();
        if self.ready.level(priority).is_empty() {
            return NextTask::Same;
        }
        task.state = TaskState::Ready;
        self.ready.enqueue(priority, current);
        NextTask::Other
    }

    /// Portable half of the context switch.
    ///
    /// `saved_sp` is where the architecture code just saved the outgoing
    /// task's registers. This records it, validates the outgoing task's stack,
    /// puts the task back on its ready list if it was merely preempted, and
    /// then picks the next task to run. The return value is the incoming
    /// task's saved stack pointer, from which the architecture code restores
    /// its registers.
    ///
    /// Tasks whose saved state turns out to be damaged are faulted instead of
    /// being run.
    pub fn switch(&mut self, saved_sp: usize) -> usize {
        if let Some(current) = self.current {
            self.park(current, saved_sp);
        }
        self.dispatch()
    }

    /// Installs the idle task, marks the scheduler started, and picks the
    /// first task. Returns its saved stack pointer for the architecture code
    /// to restore.
    pub fn start(&mut self, idle_entry: TaskEntry) -> usize {
        uassert!(!self.started);
        self.install_idle(idle_entry);
        self.started = true;
        ringbuf_entry!(SCHED_RINGBUF, Trace::Start);
        self.dispatch()
    }

    fn park(&mut self, index: usize, saved_sp: usize) {
        // A task that deleted or terminated itself is never resumed.
        let Some(task) = self.slots[index].task.as_mut() else {
            return;
        };
        if task.state.is_terminated() {
            return;
        }
        task.set_saved_sp(saved_sp);

        if let Err(info) = self.check_stack(index) {
            self.fault(index, info);
            return;
        }

        let task = self.task_mut(index);
        if task.state == TaskState::Running {
            task.state = TaskState::Ready;
            let priority = task.priority();
            if index != IDLE {
                self.ready.requeue_front(priority, index);
            }
        }
    }

    fn dispatch(&mut self) -> usize {
        loop {
            let next = self.select_next().index();
            if let Err(info) = self.check_stack(next) {
                self.fault(next, info);
                continue;
            }

            self.task_mut(next).state = TaskState::Running;
            if self.current != Some(next) {
                self.switches = self.switches.wrapping_add(1);
                ringbuf_entry!(SCHED_RINGBUF, Trace::Switch(self.id_of(next)));
            }
            self.current = Some(next);
            return self.task(next).saved_sp();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{boot, desc, nop, spawn};
    use abi::{BlockReason, ExitReason, FaultInfo};
    use std::sync::Mutex;

    #[test]
    fn select_next_takes_the_most_important_then_falls_back_to_idle() {
        let mut k = boot();
        let low = spawn(&mut k, 1);
        let high = spawn(&mut k, 2);
        assert_eq!(k.select_next(), high);
        assert_eq!(k.select_next(), low);
        assert_eq!(k.select_next(), TaskId::IDLE);
        assert_eq!(k.select_next(), TaskId::IDLE);
    }

    #[test]
    fn task_list_remove_keeps_order() {
        let mut list = TaskList::new();
        for i in [3, 1, 4, 5] {
            list.push_back(i);
        }
        assert!(list.remove(1));
        assert!(!list.remove(9));
        assert_eq!(list.iter().collect::<Vec<_>>(), [3, 4, 5]);
        list.push_front(7);
        assert_eq!(list.pop_front(), Some(7));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn most_important_level_wins() {
        let mut lists = ReadyLists::new();
        lists.enqueue(Priority(1), 1);
        lists.enqueue(Priority(3), 2);
        lists.enqueue(Priority(3), 3);
        lists.enqueue(Priority(2), 4);
        let order: Vec<_> = core::iter::from_fn(|| lists.pop_highest()).collect();
        assert_eq!(order, [2, 3, 4, 1]);
        assert!(lists.is_empty());
    }

    #[test]
    fn idle_runs_when_nothing_is_ready() {
        let mut k = boot();
        let _ = k.start(nop);
        assert_eq!(k.current_task(), Some(TaskId::IDLE));
        assert_eq!(k.task_state(TaskId::IDLE), Ok(TaskState::Running));
        k.audit().unwrap();
    }

    #[test]
    fn first_task_is_most_important() {
        let mut k = boot();
        let _low = spawn(&mut k, 1);
        let high = spawn(&mut k, 4);
        let _mid = spawn(&mut k, 2);
        let sp = k.start(nop);
        assert_eq!(k.current_task(), Some(high));
        assert_eq!(k.saved_sp(high), Ok(sp));
    }

    #[test]
    fn equal_priorities_take_turns_on_each_tick() {
        let mut k = boot();
        let tasks = [spawn(&mut k, 2), spawn(&mut k, 2), spawn(&mut k, 2)];
        let _lower = spawn(&mut k, 1);
        let mut sp = k.start(nop);

        let mut seen = vec![];
        for _ in 0..7 {
            seen.push(k.current_task().unwrap());
            assert_eq!(k.tick(), NextTask::Other);
            sp = k.switch(sp);
            k.audit().unwrap();
        }
        let expected: Vec<_> = tasks.iter().cycle().take(7).copied().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn lone_task_keeps_running_across_ticks() {
        let mut k = boot();
        let a = spawn(&mut k, 2);
        let _ = spawn(&mut k, 1);
        let _ = k.start(nop);
        for _ in 0..5 {
            assert_eq!(k.tick(), NextTask::Same);
        }
        assert_eq!(k.current_task(), Some(a));
        assert_eq!(k.context_switches(), 1);
    }

    #[test]
    fn creating_a_more_important_task_preempts_immediately() {
        let mut k = boot();
        let low = spawn(&mut k, 1);
        let sp = k.start(nop);
        assert_eq!(k.current_task(), Some(low));

        let (_peer, hint) = k.create(&desc(1)).unwrap();
        assert_eq!(hint, NextTask::Same, "equals wait for the time slice");

        let (high, hint) = k.create(&desc(3)).unwrap();
        assert_eq!(hint, NextTask::Other);
        let _ = k.switch(sp);
        assert_eq!(k.current_task(), Some(high));
        assert_eq!(k.task_state(low), Ok(TaskState::Ready));
        k.audit().unwrap();
    }

    #[test]
    fn preempted_task_resumes_before_its_peers() {
        let mut k = boot();
        let a = spawn(&mut k, 1);
        let b = spawn(&mut k, 1);
        let h = spawn(&mut k, 2);
        let mut sp = k.start(nop);
        assert_eq!(k.current_task(), Some(h));

        // h sleeps; a runs.
        assert!(matches!(
            k.delay(1, crate::kernel::Caller::Task),
            Ok(crate::queue::Transfer::Blocked)
        ));
        sp = k.switch(sp);
        assert_eq!(k.current_task(), Some(a));

        // h wakes on the next tick and preempts a.
        assert_eq!(k.tick(), NextTask::Other);
        sp = k.switch(sp);
        assert_eq!(k.current_task(), Some(h));

        // When h sleeps again, a gets the rest of its turn, not b.
        let _ = k.delay(5, crate::kernel::Caller::Task);
        let _ = k.switch(sp);
        assert_eq!(k.current_task(), Some(a));
        assert_eq!(k.task_state(b), Ok(TaskState::Ready));
        k.audit().unwrap();
    }

    #[test]
    fn yield_rotates_among_equals_only() {
        let mut k = boot();
        let a = spawn(&mut k, 1);
        let sp = k.start(nop);
        assert_eq!(k.yield_current(), NextTask::Same, "nobody to yield to");

        let b = spawn(&mut k, 1);
        assert_eq!(k.yield_current(), NextTask::Other);
        let _ = k.switch(sp);
        assert_eq!(k.current_task(), Some(b));
        assert_eq!(k.task_state(a), Ok(TaskState::Ready));
    }

    #[test]
    fn overflowed_guard_faults_the_task_and_calls_the_hook() {
        static FAULTS: Mutex<Vec<(TaskId, FaultInfo)>> = Mutex::new(Vec::new());
        fn hook(id: TaskId, info: FaultInfo) {
            FAULTS.lock().unwrap().push((id, info));
        }

        let mut k = boot();
        k.set_fault_hook(Some(hook));
        let victim = spawn(&mut k, 2);
        let bystander = spawn(&mut k, 1);
        let sp = k.start(nop);
        assert_eq!(k.current_task(), Some(victim));

        k.smash_guard(victim);
        assert_eq!(k.tick(), NextTask::Other);
        let _ = k.switch(sp);

        let state = k.task_state(victim).unwrap();
        let TaskState::Terminated(ExitReason::Faulted(info)) = state else {
            panic!("victim should have been faulted, is {state:?}");
        };
        assert!(matches!(info, FaultInfo::StackOverflow { .. }));
        assert_eq!(*FAULTS.lock().unwrap(), [(victim, info)]);
        assert_eq!(k.current_task(), Some(bystander));
        k.audit().unwrap();
    }

    #[test]
    fn corrupt_saved_frame_is_never_restored() {
        static FAULTS: Mutex<Vec<TaskId>> = Mutex::new(Vec::new());
        fn hook(id: TaskId, _: FaultInfo) {
            FAULTS.lock().unwrap().push(id);
        }

        let mut k = boot();
        k.set_fault_hook(Some(hook));
        let bad = spawn(&mut k, 2);
        let good = spawn(&mut k, 1);
        k.task_mut(bad.index()).set_saved_sp(0x40);

        let _ = k.start(nop);
        assert_eq!(k.current_task(), Some(good));
        assert_eq!(
            k.task_state(bad),
            Ok(TaskState::Terminated(ExitReason::Faulted(
                FaultInfo::InvalidFrame { stack_pointer: 0x40 }
            )))
        );
        assert_eq!(*FAULTS.lock().unwrap(), [bad]);
    }

    #[test]
    fn stack_pointer_outside_stack_faults_on_the_way_out() {
        let mut k = boot();
        let a = spawn(&mut k, 1);
        let b = spawn(&mut k, 1);
        let _ = k.start(nop);
        assert_eq!(k.current_task(), Some(a));

        // Pretend the task's registers were saved somewhere absurd.
        let _ = k.tick();
        let sp = k.switch(usize::MAX & !7);
        assert_eq!(k.current_task(), Some(b));
        assert_eq!(k.saved_sp(b), Ok(sp));
        assert!(matches!(
            k.task_state(a),
            Ok(TaskState::Terminated(ExitReason::Faulted(
                FaultInfo::InvalidFrame { .. }
            )))
        ));
    }

    #[test]
    #[should_panic(expected = "kernel died")]
    fn idle_fault_takes_the_kernel_down() {
        let mut k = boot();
        let _ = k.start(nop);
        k.smash_guard(TaskId::IDLE);
        let _ = k.tick();
    }

    #[test]
    fn delayed_task_is_not_scheduled() {
        let mut k = boot();
        let a = spawn(&mut k, 2);
        let sp = k.start(nop);
        let _ = k.delay(3, crate::kernel::Caller::Task);
        let _ = k.switch(sp);
        assert_eq!(k.current_task(), Some(TaskId::IDLE));
        assert_eq!(
            k.task_state(a),
            Ok(TaskState::Blocked(BlockReason::Delay))
        );
    }
}
