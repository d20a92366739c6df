// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded blocking queues.
//!
//! A queue is a ring of fixed-size items carved out of the kernel's queue
//! pool, plus two wait lists: tasks waiting to send (the ring is full) and
//! tasks waiting to receive (the ring is empty). Both lists are FIFO, so
//! waiters are served in the order they arrived.
//!
//! Items never sit in a ring while a receiver waits, and never wait in a
//! sender's mailbox while the ring has room:
//!
//! - A send to a queue with a waiting receiver copies the item straight into
//!   that receiver's mailbox and readies it.
//! - A receive from a full queue with a waiting sender takes the oldest item,
//!   then moves the sender's item into the freed space and readies the sender.
//!
//! Because the item changes hands at the moment the waiter is readied, a
//! waiter can't miss its wakeup, and the order of items is preserved.
//!
//! Queues are created before the scheduler starts, and live forever.

use core::ops::Range;

use abi::{BlockReason, KernelError, QueueId, TaskId, Timeout};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::config::{MAX_ITEM_SIZE, QUEUE_POOL_BYTES};
use crate::kernel::{Caller, Kernel};
use crate::sched::TaskList;
use crate::task::{NextTask, Wake};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Created(QueueId, usize, usize),
    HandOff(QueueId, TaskId),
    Refill(QueueId, TaskId),
}

ringbuf!(QUEUE_RINGBUF, Trace, 32, Trace::None);

/// Outcome of an operation that may have to wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Transfer {
    /// The operation finished; the hint says whether someone more important
    /// than the caller is now Ready.
    Done(NextTask),
    /// The caller has been blocked and must get off the processor. Its
    /// result is collected with `finish_send`/`finish_receive` once it runs
    /// again.
    Blocked,
}

/// Bookkeeping for one queue. The items themselves are in the kernel's queue
/// pool, starting at `base`.
#[derive(Debug)]
pub struct QueueControl {
    base: usize,
    item_size: usize,
    pub(crate) capacity: usize,
    /// Slot of the oldest item.
    read: usize,
    /// Slot the next item goes in.
    write: usize,
    pub(crate) count: usize,
    pub(crate) senders: TaskList,
    pub(crate) receivers: TaskList,
}

impl QueueControl {
    fn new(base: usize, item_size: usize, capacity: usize) -> Self {
        Self {
            base,
            item_size,
            capacity,
            read: 0,
            write: 0,
            count: 0,
            senders: TaskList::new(),
            receivers: TaskList::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    fn slot(&self, i: usize) -> Range<usize> {
        let start = self.base + i * self.item_size;
        start..start + self.item_size
    }

    fn advance(&self, i: usize) -> usize {
        if i + 1 == self.capacity {
            0
        } else {
            i + 1
        }
    }

    fn push(&mut self, pool: &mut [u8], item: &[u8]) {
        uassert!(!self.is_full());
        pool[self.slot(self.write)].copy_from_slice(item);
        self.write = self.advance(self.write);
        self.count += 1;
    }

    fn pop(&mut self, pool: &[u8], out: &mut [u8]) {
        uassert!(self.count != 0);
        out.copy_from_slice(&pool[self.slot(self.read)]);
        self.read = self.advance(self.read);
        self.count -= 1;
    }
}

impl Kernel {
    /// Creates a queue of `capacity` items of `item_size` bytes each.
    pub fn create_queue(
        &mut self,
        capacity: usize,
        item_size: usize,
    ) -> Result<QueueId, KernelError> {
        if self.started {
            return Err(KernelError::AlreadyStarted);
        }
        if capacity == 0 || item_size == 0 || item_size > MAX_ITEM_SIZE {
            return Err(KernelError::BadQueueShape);
        }
        let index = self
            .queues
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::PoolExhausted)?;
        let end = capacity
            .checked_mul(item_size)
            .and_then(|bytes| self.pool_used.checked_add(bytes))
            .filter(|&end| end <= QUEUE_POOL_BYTES)
            .ok_or(KernelError::PoolExhausted)?;

        self.queues[index] =
            Some(QueueControl::new(self.pool_used, item_size, capacity));
        self.pool_used = end;

        let id = QueueId(index as u8);
        ringbuf_entry!(QUEUE_RINGBUF, Trace::Created(id, capacity, item_size));
        Ok(id)
    }

    /// Sends one item to `q`, waiting up to `timeout` for room.
    pub fn queue_send(
        &mut self,
        q: QueueId,
        item: &[u8],
        timeout: Timeout,
        caller: Caller,
    ) -> Result<Transfer, KernelError> {
        if item.len() != self.queue(q)?.item_size {
            return Err(KernelError::ItemSizeMismatch);
        }

        if let Some(rx) = self.queue_control_mut(q).receivers.pop_front() {
            let task = self.task_mut(rx);
            task.mailbox.fill(item);
            task.wake = Some(Wake::Completed);
            task.delay = None;
            ringbuf_entry!(QUEUE_RINGBUF, Trace::HandOff(q, self.id_of(rx)));
            return Ok(Transfer::Done(self.make_ready(rx)));
        }

        let (control, pool) = self.ring(q);
        if !control.is_full() {
            control.push(pool, item);
            return Ok(Transfer::Done(NextTask::Same));
        }

        if !timeout.can_block() {
            return Err(KernelError::Timeout);
        }
        let current = self.blocking_caller(caller)?;
        self.task_mut(current).mailbox.fill(item);
        self.block_current(BlockReason::Send(q), timeout.ticks());
        self.queue_control_mut(q).senders.push_back(current);
        Ok(Transfer::Blocked)
    }

    /// Receives one item from `q` into `out`, waiting up to `timeout` for
    /// one to arrive.
    ///
    /// If this returns `Transfer::Blocked`, `out` is untouched; the item is
    /// delivered by `finish_receive`.
    pub fn queue_receive(
        &mut self,
        q: QueueId,
        out: &mut [u8],
        timeout: Timeout,
        caller: Caller,
    ) -> Result<Transfer, KernelError> {
        if out.len() != self.queue(q)?.item_size {
            return Err(KernelError::ItemSizeMismatch);
        }

        let (control, pool) = self.ring(q);
        if control.count != 0 {
            control.pop(pool, out);
            let Some(tx) = control.senders.pop_front() else {
                return Ok(Transfer::Done(NextTask::Same));
            };

            // Room just opened up; the longest-waiting sender fills it.
            let mailbox = self.task(tx).mailbox;
            let (control, pool) = self.ring(q);
            control.push(pool, mailbox.contents());
            let task = self.task_mut(tx);
            task.wake = Some(Wake::Completed);
            task.delay = None;
            ringbuf_entry!(QUEUE_RINGBUF, Trace::Refill(q, self.id_of(tx)));
            return Ok(Transfer::Done(self.make_ready(tx)));
        }

        if !timeout.can_block() {
            return Err(KernelError::Timeout);
        }
        let current = self.blocking_caller(caller)?;
        self.block_current(BlockReason::Receive(q), timeout.ticks());
        self.queue_control_mut(q).receivers.push_back(current);
        Ok(Transfer::Blocked)
    }

    /// Collects the result of a send that blocked. `None` means the task
    /// hasn't been woken yet.
    pub fn finish_send(&mut self) -> Option<Result<(), KernelError>> {
        match self.take_wake()? {
            Wake::Completed => Some(Ok(())),
            Wake::TimedOut => Some(Err(KernelError::Timeout)),
        }
    }

    /// Collects the result of a receive that blocked, copying the delivered
    /// item into `out`. `None` means the task hasn't been woken yet.
    pub fn finish_receive(
        &mut self,
        out: &mut [u8],
    ) -> Option<Result<(), KernelError>> {
        match self.take_wake()? {
            Wake::Completed => {
                let item = self.task(self.current?).mailbox.contents();
                if item.len() != out.len() {
                    return Some(Err(KernelError::ItemSizeMismatch));
                }
                out.copy_from_slice(item);
                Some(Ok(()))
            }
            Wake::TimedOut => Some(Err(KernelError::Timeout)),
        }
    }

    /// Number of items sitting in `q`.
    pub fn queue_len(&self, q: QueueId) -> Result<usize, KernelError> {
        Ok(self.queue(q)?.count)
    }

    pub fn queue_capacity(&self, q: QueueId) -> Result<usize, KernelError> {
        Ok(self.queue(q)?.capacity)
    }

    pub fn queue_item_size(&self, q: QueueId) -> Result<usize, KernelError> {
        Ok(self.queue(q)?.item_size)
    }

    fn queue(&self, q: QueueId) -> Result<&QueueControl, KernelError> {
        self.queues
            .get(q.index())
            .and_then(Option::as_ref)
            .ok_or(KernelError::NoSuchQueue)
    }

    /// Control block of a queue that is known to exist, because it has been
    /// checked or because a task is waiting on it.
    pub(crate) fn queue_control_mut(&mut self, q: QueueId) -> &mut QueueControl {
        match self.queues.get_mut(q.index()).and_then(Option::as_mut) {
            Some(control) => control,
            None => crate::fail::die(KernelError::NoSuchQueue),
        }
    }

    /// Splits out a queue's control block and the pool holding its items.
    fn ring(&mut self, q: QueueId) -> (&mut QueueControl, &mut [u8]) {
        let Self {
            queues, queue_pool, ..
        } = self;
        match queues.get_mut(q.index()).and_then(Option::as_mut) {
            Some(control) => (control, &mut queue_pool[..]),
            None => crate::fail::die(KernelError::NoSuchQueue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{boot, nop, spawn};
    use crate::kernel::IsrBlockingPolicy;
    use abi::TaskState;
    use proptest::prelude::*;

    #[test]
    fn items_come_out_in_the_order_they_went_in() {
        let mut k = boot();
        let q = k.create_queue(3, 1).unwrap();
        let _ = spawn(&mut k, 1);
        let _ = k.start(nop);

        for b in [1, 2, 3] {
            let r = k.queue_send(q, &[b], Timeout::NONE, Caller::Task);
            assert_eq!(r, Ok(Transfer::Done(NextTask::Same)));
        }
        let mut got = vec![];
        for _ in 0..3 {
            let mut out = [0];
            let r = k.queue_receive(q, &mut out, Timeout::NONE, Caller::Task);
            assert_eq!(r, Ok(Transfer::Done(NextTask::Same)));
            got.push(out[0]);
        }
        assert_eq!(got, [1, 2, 3]);
    }

    #[test]
    fn ring_wraps_around() {
        let mut k = boot();
        let q = k.create_queue(2, 2).unwrap();
        let _ = spawn(&mut k, 1);
        let _ = k.start(nop);

        let mut out = [0; 2];
        for i in 0..5u8 {
            let _ = k.queue_send(q, &[i, !i], Timeout::NONE, Caller::Task);
            let _ = k.queue_receive(q, &mut out, Timeout::NONE, Caller::Task);
            assert_eq!(out, [i, !i]);
        }
        assert_eq!(k.queue_len(q), Ok(0));
    }

    #[test]
    fn zero_timeout_fails_fast_on_full_and_empty() {
        let mut k = boot();
        let q = k.create_queue(1, 1).unwrap();
        let _ = spawn(&mut k, 1);
        let _ = k.start(nop);

        let mut out = [0];
        let r = k.queue_receive(q, &mut out, Timeout::NONE, Caller::Task);
        assert_eq!(r, Err(KernelError::Timeout));

        let _ = k.queue_send(q, &[9], Timeout::NONE, Caller::Task);
        let r = k.queue_send(q, &[10], Timeout::NONE, Caller::Task);
        assert_eq!(r, Err(KernelError::Timeout));
        assert_eq!(k.queue_len(q), Ok(1));
    }

    #[test]
    fn zero_timeout_is_fine_from_an_interrupt() {
        let mut k = boot();
        let q = k.create_queue(1, 1).unwrap();
        let _ = spawn(&mut k, 1);
        let _ = k.start(nop);

        let r = k.queue_send(q, &[1], Timeout::NONE, Caller::Interrupt);
        assert_eq!(r, Ok(Transfer::Done(NextTask::Same)));
        let r = k.queue_send(q, &[2], Timeout::NONE, Caller::Interrupt);
        assert_eq!(r, Err(KernelError::Timeout));
    }

    #[test]
    fn interrupt_may_not_wait_on_a_full_queue() {
        let mut k = boot();
        k.set_isr_blocking_policy(IsrBlockingPolicy::ReturnError);
        let q = k.create_queue(1, 1).unwrap();
        let _ = spawn(&mut k, 1);
        let _ = k.start(nop);
        let _ = k.queue_send(q, &[1], Timeout::NONE, Caller::Interrupt);

        let r = k.queue_send(q, &[2], Timeout::Forever, Caller::Interrupt);
        assert_eq!(r, Err(KernelError::IllegalBlockingContext));
        k.audit().unwrap();
    }

    #[test]
    fn shape_and_argument_errors() {
        let mut k = boot();
        assert_eq!(k.create_queue(0, 4), Err(KernelError::BadQueueShape));
        assert_eq!(k.create_queue(4, 0), Err(KernelError::BadQueueShape));
        assert_eq!(
            k.create_queue(1, MAX_ITEM_SIZE + 1),
            Err(KernelError::BadQueueShape)
        );

        let q = k.create_queue(2, 4).unwrap();
        assert_eq!(k.queue_capacity(q), Ok(2));
        assert_eq!(k.queue_item_size(q), Ok(4));
        let r = k.queue_send(q, &[1, 2, 3], Timeout::NONE, Caller::Task);
        assert_eq!(r, Err(KernelError::ItemSizeMismatch));
        let nowhere = QueueId(200);
        let r = k.queue_send(nowhere, &[1; 4], Timeout::NONE, Caller::Task);
        assert_eq!(r, Err(KernelError::NoSuchQueue));
        assert_eq!(k.queue_len(nowhere), Err(KernelError::NoSuchQueue));
    }

    #[test]
    fn pool_runs_out_of_bytes_or_slots() {
        let mut k = boot();
        assert_eq!(
            k.create_queue(QUEUE_POOL_BYTES + 1, 1),
            Err(KernelError::PoolExhausted)
        );
        assert_eq!(
            k.create_queue(usize::MAX, MAX_ITEM_SIZE),
            Err(KernelError::PoolExhausted)
        );
        for _ in 0..crate::config::MAX_QUEUES {
            k.create_queue(1, 1).unwrap();
        }
        assert_eq!(k.create_queue(1, 1), Err(KernelError::PoolExhausted));
    }

    #[test]
    fn queues_are_fixed_once_started() {
        let mut k = boot();
        let _ = k.start(nop);
        assert_eq!(k.create_queue(1, 1), Err(KernelError::AlreadyStarted));
    }

    #[test]
    fn interrupt_send_preempts_for_a_more_important_receiver() {
        let mut k = boot();
        let q = k.create_queue(4, 1).unwrap();
        let low = spawn(&mut k, 1);
        let high = spawn(&mut k, 3);
        let mut sp = k.start(nop);
        assert_eq!(k.current_task(), Some(high));

        let mut out = [0];
        let r = k.queue_receive(q, &mut out, Timeout::Forever, Caller::Task);
        assert_eq!(r, Ok(Transfer::Blocked));
        sp = k.switch(sp);
        assert_eq!(k.current_task(), Some(low));

        // An interrupt arrives while `low` runs.
        let r = k.queue_send(q, &[7], Timeout::NONE, Caller::Interrupt);
        assert_eq!(r, Ok(Transfer::Done(NextTask::Other)));
        assert_eq!(k.queue_len(q), Ok(0), "item went straight to the waiter");

        let _ = k.switch(sp);
        assert_eq!(k.current_task(), Some(high));
        assert_eq!(k.finish_receive(&mut out), Some(Ok(())));
        assert_eq!(out, [7]);
        assert_eq!(k.task_state(low), Ok(TaskState::Ready));
        k.audit().unwrap();
    }

    #[test]
    fn receivers_are_served_in_arrival_order() {
        let mut k = boot();
        let q = k.create_queue(1, 1).unwrap();
        let r1 = spawn(&mut k, 2);
        let r2 = spawn(&mut k, 2);
        let tx = spawn(&mut k, 1);
        let mut sp = k.start(nop);

        let mut out = [0];
        for _ in 0..2 {
            let r = k.queue_receive(q, &mut out, Timeout::Forever, Caller::Task);
            assert_eq!(r, Ok(Transfer::Blocked));
            sp = k.switch(sp);
        }
        assert_eq!(k.current_task(), Some(tx));
        for b in [10, 20] {
            let r = k.queue_send(q, &[b], Timeout::NONE, Caller::Task);
            assert_eq!(r, Ok(Transfer::Done(NextTask::Other)));
        }
        k.audit().unwrap();

        for (who, expected) in [(r1, 10), (r2, 20)] {
            sp = k.switch(sp);
            assert_eq!(k.current_task(), Some(who));
            assert_eq!(k.finish_receive(&mut out), Some(Ok(())));
            assert_eq!(out, [expected]);
            let _ = k.delay(100, Caller::Task);
        }
    }

    #[test]
    fn waiting_sender_refills_the_slot_a_receive_frees() {
        let mut k = boot();
        let q = k.create_queue(1, 1).unwrap();
        let tx = spawn(&mut k, 2);
        let rx = spawn(&mut k, 1);
        let mut sp = k.start(nop);

        assert!(k.queue_send(q, &[1], Timeout::NONE, Caller::Task).is_ok());
        let r = k.queue_send(q, &[2], Timeout::Forever, Caller::Task);
        assert_eq!(r, Ok(Transfer::Blocked));
        sp = k.switch(sp);
        assert_eq!(k.current_task(), Some(rx));

        let mut out = [0];
        let r = k.queue_receive(q, &mut out, Timeout::NONE, Caller::Task);
        assert_eq!(r, Ok(Transfer::Done(NextTask::Other)));
        assert_eq!(out, [1]);
        assert_eq!(k.queue_len(q), Ok(1));
        k.audit().unwrap();

        let _ = k.switch(sp);
        assert_eq!(k.current_task(), Some(tx));
        assert_eq!(k.finish_send(), Some(Ok(())));

        let r = k.queue_receive(q, &mut out, Timeout::NONE, Caller::Task);
        assert_eq!(r, Ok(Transfer::Done(NextTask::Same)));
        assert_eq!(out, [2]);
    }

    #[test]
    fn timed_out_send_leaves_no_trace_of_its_item() {
        let mut k = boot();
        let q = k.create_queue(1, 1).unwrap();
        let tx = spawn(&mut k, 1);
        let mut sp = k.start(nop);

        let _ = k.queue_send(q, &[1], Timeout::NONE, Caller::Task);
        let r = k.queue_send(q, &[2], Timeout::Ticks(2), Caller::Task);
        assert_eq!(r, Ok(Transfer::Blocked));
        sp = k.switch(sp);

        let _ = k.tick();
        assert_eq!(k.tick(), NextTask::Other);
        let _ = k.switch(sp);
        assert_eq!(k.current_task(), Some(tx));
        assert_eq!(k.finish_send(), Some(Err(KernelError::Timeout)));

        let mut out = [0];
        let _ = k.queue_receive(q, &mut out, Timeout::NONE, Caller::Task);
        assert_eq!(out, [1]);
        assert_eq!(k.queue_len(q), Ok(0));
    }

    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    enum Role {
        Producer,
        Consumer,
    }

    struct Actor {
        id: TaskId,
        role: Role,
        done: u32,
        waiting: bool,
    }

    /// Runs one producer and one consumer over a small queue, with ticks
    /// sprinkled in wherever `ticks` says, and returns what the consumer got.
    fn producer_consumer(
        producer_priority: u8,
        consumer_priority: u8,
        count: u32,
        ticks: Vec<bool>,
    ) -> Vec<u32> {
        let mut k = boot();
        let q = k.create_queue(2, 4).unwrap();
        let mut actors = [
            Actor {
                id: spawn(&mut k, producer_priority),
                role: Role::Producer,
                done: 0,
                waiting: false,
            },
            Actor {
                id: spawn(&mut k, consumer_priority),
                role: Role::Consumer,
                done: 0,
                waiting: false,
            },
        ];
        let mut got = vec![];
        let mut sp = k.start(nop);
        let mut ticks = ticks.into_iter();

        for _ in 0..10_000 {
            k.audit().unwrap();
            if got.len() == count as usize {
                break;
            }
            let current = k.current_task().unwrap();
            let actor = actors.iter_mut().find(|a| a.id == current);
            let Some(actor) = actor.filter(|_| !ticks.next().unwrap_or(false))
            else {
                // A tick, or idle is running and time needs to pass.
                if k.tick() != NextTask::Same {
                    sp = k.switch(sp);
                }
                continue;
            };

            let mut buf = [0; 4];
            if actor.waiting {
                let r = match actor.role {
                    Role::Producer => k.finish_send(),
                    Role::Consumer => k.finish_receive(&mut buf),
                };
                assert_eq!(r, Some(Ok(())), "resumed without a result");
                actor.waiting = false;
                actor.done += 1;
                if actor.role == Role::Consumer {
                    got.push(u32::from_le_bytes(buf));
                }
                continue;
            }
            if actor.done == count {
                let _ = k.exit_current();
                sp = k.switch(sp);
                continue;
            }

            let r = match actor.role {
                Role::Producer => k.queue_send(
                    q,
                    &actor.done.to_le_bytes(),
                    Timeout::Forever,
                    Caller::Task,
                ),
                Role::Consumer => {
                    k.queue_receive(q, &mut buf, Timeout::Forever, Caller::Task)
                }
            };
            match r.unwrap() {
                Transfer::Blocked => {
                    actor.waiting = true;
                    sp = k.switch(sp);
                }
                Transfer::Done(hint) => {
                    actor.done += 1;
                    if actor.role == Role::Consumer {
                        got.push(u32::from_le_bytes(buf));
                    }
                    if hint != NextTask::Same {
                        sp = k.switch(sp);
                    }
                }
            }
        }
        got
    }

    proptest! {
        #[test]
        fn every_item_arrives_once_and_in_order(
            producer_priority in 1u8..4,
            consumer_priority in 1u8..4,
            count in 1u32..20,
            ticks in proptest::collection::vec(any::<bool>(), 0..200),
        ) {
            let got = producer_consumer(
                producer_priority,
                consumer_priority,
                count,
                ticks,
            );
            prop_assert_eq!(got, (0..count).collect::<Vec<_>>());
        }
    }
}
