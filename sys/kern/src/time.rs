// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.
//!
//! Time advances one tick per timer interrupt. On each tick, every blocked
//! task with a timeout has it counted down, and those reaching zero are made
//! Ready in slot order. Then the running task's stack guard is checked and,
//! unless a more important task just woke up, its time slice ends.

use abi::{BlockReason, KernelError, TaskId, TaskState};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::config::{TASK_SLOTS, TICK_HZ};
use crate::kernel::{Caller, IsrBlockingPolicy, Kernel, IDLE};
use crate::queue::Transfer;
use crate::task::{NextTask, Wake};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Block(TaskId, BlockReason),
    Expired(TaskId),
    IllegalBlock,
}

ringbuf!(TIME_RINGBUF, Trace, 32, Trace::None);

/// In-kernel timestamp representation.
///
/// This is measured in ticks since the kernel was built, and is never
/// expected to wrap.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn ticks(self) -> u64 {
        self.0
    }

    fn advance(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// Converts milliseconds to ticks, rounding up so that a delay is never
/// shorter than asked for.
pub fn ms_to_ticks(ms: u32) -> u32 {
    let ticks = (u64::from(ms) * u64::from(TICK_HZ)).div_ceil(1000);
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

impl Kernel {
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Processes one timer tick.
    pub fn tick(&mut self) -> NextTask {
        self.now.advance();

        let mut hint = NextTask::Same;
        for i in 0..TASK_SLOTS {
            let Some(task) = self.slots[i].task.as_mut() else {
                continue;
            };
            if !task.state.is_blocked() {
                continue;
            }
            let Some(left) = task.delay.as_mut() else {
                continue;
            };
            *left = left.saturating_sub(1);
            if *left == 0 {
                hint = hint.combine(self.expire(i));
            }
        }

        if let Some(current) = self.current {
            let running = self.slots[current]
                .task
                .as_ref()
                .is_some_and(|t| t.state == TaskState::Running);
            if running {
                if let Err(info) = self.check_guard(current) {
                    self.fault(current, info);
                    return NextTask::Other;
                }
            }
        }

        // If someone more important woke up, the running task is preempted
        // and keeps its place at the head of its level; otherwise its time
        // slice is over.
        if hint == NextTask::Same {
            hint = self.yield_current();
        }
        hint
    }

    /// Ends a wait whose timeout ran out.
    fn expire(&mut self, index: usize) -> NextTask {
        let task = self.task_mut(index);
        task.delay = None;
        match task.state {
            TaskState::Blocked(BlockReason::Delay) => {
                task.wake = Some(Wake::Completed);
            }
            TaskState::Blocked(BlockReason::Send(q)) => {
                task.wake = Some(Wake::TimedOut);
                self.queue_control_mut(q).senders.remove(index);
            }
            TaskState::Blocked(BlockReason::Receive(q)) => {
                task.wake = Some(Wake::TimedOut);
                self.queue_control_mut(q).receivers.remove(index);
            }
            TaskState::Ready | TaskState::Running | TaskState::Terminated(_) => {
                return NextTask::Same;
            }
        }
        ringbuf_entry!(TIME_RINGBUF, Trace::Expired(self.id_of(index)));
        self.make_ready(index)
    }

    /// Puts the running task to sleep for `ticks` ticks. Zero is a yield.
    pub fn delay(
        &mut self,
        ticks: u32,
        caller: Caller,
    ) -> Result<Transfer, KernelError> {
        if ticks == 0 {
            return Ok(Transfer::Done(match caller {
                Caller::Task => self.yield_current(),
                Caller::Interrupt => NextTask::Same,
            }));
        }
        self.blocking_caller(caller)?;
        self.block_current(BlockReason::Delay, Some(ticks));
        Ok(Transfer::Blocked)
    }

    /// Checks that the caller is in a position to block, returning the
    /// running task's index if so.
    ///
    /// Only tasks can block, and idle may not. What happens otherwise depends
    /// on the `IsrBlockingPolicy`.
    pub(crate) fn blocking_caller(
        &self,
        caller: Caller,
    ) -> Result<usize, KernelError> {
        match (caller, self.current) {
            (Caller::Task, Some(current)) if self.started && current != IDLE => {
                Ok(current)
            }
            _ => {
                ringbuf_entry!(TIME_RINGBUF, Trace::IllegalBlock);
                match self.isr_policy {
                    IsrBlockingPolicy::Fault => crate::fail::die(
                        KernelError::IllegalBlockingContext,
                    ),
                    IsrBlockingPolicy::ReturnError => {
                        Err(KernelError::IllegalBlockingContext)
                    }
                }
            }
        }
    }

    /// Moves the running task to Blocked, with an optional timeout. The
    /// caller is responsible for listing it wherever it's waiting.
    pub(crate) fn block_current(
        &mut self,
        reason: BlockReason,
        ticks: Option<u32>,
    ) -> usize {
        let Some(current) = self.current else {
            crate::fail::die("block with no current task");
        };
        let task = self.task_mut(current);
        uassert!(task.state == TaskState::Running);
        task.state = TaskState::Blocked(reason);
        task.delay = ticks;
        task.wake = None;
        ringbuf_entry!(TIME_RINGBUF, Trace::Block(self.id_of(current), reason));
        current
    }

    /// Collects the outcome of the running task's last wait, if it has ended.
    pub fn take_wake(&mut self) -> Option<Wake> {
        let current = self.current?;
        self.slots[current].task.as_mut()?.wake.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{boot, nop, spawn};
    use abi::Timeout;

    #[test]
    fn ms_conversion_rounds_up() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(1000), TICK_HZ);
    }

    #[test]
    fn clock_counts_ticks() {
        let mut k = boot();
        let _ = k.start(nop);
        for _ in 0..10 {
            let _ = k.tick();
        }
        assert_eq!(k.now(), Timestamp::from(10));
    }

    #[test]
    fn delay_wakes_after_exactly_n_ticks() {
        let mut k = boot();
        let a = spawn(&mut k, 1);
        let mut sp = k.start(nop);
        assert!(matches!(k.delay(3, Caller::Task), Ok(Transfer::Blocked)));
        sp = k.switch(sp);
        assert_eq!(k.current_task(), Some(TaskId::IDLE));

        assert_eq!(k.tick(), NextTask::Same);
        assert_eq!(k.tick(), NextTask::Same);
        assert_eq!(k.task_state(a), Ok(TaskState::Blocked(BlockReason::Delay)));
        assert_eq!(k.tick(), NextTask::Other);
        let _ = k.switch(sp);
        assert_eq!(k.current_task(), Some(a));
        assert_eq!(k.take_wake(), Some(Wake::Completed));
        assert_eq!(k.take_wake(), None);
    }

    #[test]
    fn zero_delay_is_a_yield() {
        let mut k = boot();
        let a = spawn(&mut k, 1);
        let b = spawn(&mut k, 1);
        let sp = k.start(nop);
        assert!(matches!(
            k.delay(0, Caller::Task),
            Ok(Transfer::Done(NextTask::Other))
        ));
        let _ = k.switch(sp);
        assert_eq!(k.current_task(), Some(b));
        assert_eq!(k.task_state(a), Ok(TaskState::Ready));
    }

    #[test]
    fn receive_times_out_after_exactly_t_ticks() {
        const T: u32 = 5;
        let mut k = boot();
        let q = k.create_queue(1, 4).unwrap();
        let rx = spawn(&mut k, 1);
        let mut sp = k.start(nop);

        let mut buf = [0; 4];
        let r = k.queue_receive(q, &mut buf, Timeout::Ticks(T), Caller::Task);
        assert!(matches!(r, Ok(Transfer::Blocked)));
        sp = k.switch(sp);

        for n in 1..T {
            assert_eq!(k.tick(), NextTask::Same, "tick {n}");
            assert!(k.task_state(rx).unwrap().is_blocked(), "tick {n}");
        }
        assert_eq!(k.tick(), NextTask::Other);
        assert_eq!(k.task_state(rx), Ok(TaskState::Ready));
        k.audit().unwrap();

        let _ = k.switch(sp);
        assert_eq!(k.current_task(), Some(rx));
        assert_eq!(
            k.finish_receive(&mut buf),
            Some(Err(KernelError::Timeout))
        );
    }

    #[test]
    fn forever_never_expires() {
        let mut k = boot();
        let q = k.create_queue(1, 1).unwrap();
        let rx = spawn(&mut k, 1);
        let sp = k.start(nop);
        let mut buf = [0];
        let r = k.queue_receive(q, &mut buf, Timeout::Forever, Caller::Task);
        assert!(matches!(r, Ok(Transfer::Blocked)));
        let _ = k.switch(sp);

        for _ in 0..10_000 {
            let _ = k.tick();
        }
        assert_eq!(
            k.task_state(rx),
            Ok(TaskState::Blocked(BlockReason::Receive(q)))
        );
    }

    #[test]
    fn simultaneous_expiries_become_ready_in_slot_order() {
        let mut k = boot();
        let tasks = [spawn(&mut k, 1), spawn(&mut k, 1), spawn(&mut k, 1)];
        let mut sp = k.start(nop);
        assert_eq!(k.current_task(), Some(tasks[0]));

        // Get them to block in the order 1, 2, 0.
        assert_eq!(k.yield_current(), NextTask::Other);
        for _ in 0..3 {
            sp = k.switch(sp);
            let _ = k.delay(2, Caller::Task);
        }
        let _ = k.switch(sp);
        assert_eq!(k.current_task(), Some(TaskId::IDLE));

        let _ = k.tick();
        assert_eq!(k.tick(), NextTask::Other);
        let order: Vec<_> = k.ready.level(abi::Priority(1)).iter().collect();
        assert_eq!(order, tasks.map(|t| t.index()));
    }

    #[test]
    fn blocking_from_interrupt_is_refused_under_return_error() {
        let mut k = boot();
        let a = spawn(&mut k, 1);
        let _ = k.start(nop);
        k.set_isr_blocking_policy(IsrBlockingPolicy::ReturnError);
        assert_eq!(
            k.delay(10, Caller::Interrupt).map(|_| ()),
            Err(KernelError::IllegalBlockingContext)
        );
        assert_eq!(k.task_state(a), Ok(TaskState::Running));
    }

    #[test]
    #[should_panic(expected = "blocking call from interrupt")]
    fn blocking_from_interrupt_is_fatal_by_default() {
        let mut k = boot();
        let _ = spawn(&mut k, 1);
        let _ = k.start(nop);
        let _ = k.delay(10, Caller::Interrupt);
    }

    #[test]
    fn blocking_before_start_is_refused() {
        let mut k = boot();
        k.set_isr_blocking_policy(IsrBlockingPolicy::ReturnError);
        assert_eq!(
            k.delay(1, Caller::Task).map(|_| ()),
            Err(KernelError::IllegalBlockingContext)
        );
    }
}
