// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interface tasks (and interrupt handlers) use to talk to the kernel.
//!
//! Each function here runs one operation on the kernel object, inside a
//! critical section, and deals with the scheduling consequences before
//! leaving it: if the operation readied something more important, or parked
//! the caller, a context switch is requested. The switch happens as the
//! critical section ends. A parked caller collects its result once it is
//! woken.
//!
//! Whether the caller is a task or an interrupt handler is worked out here,
//! not by the caller. Operations that would have to wait fail with
//! `KernelError::IllegalBlockingContext` from an interrupt handler (or take
//! the kernel down, depending on the `IsrBlockingPolicy`). Operations with a
//! zero timeout never wait, and are fine to use anywhere.

use core::marker::PhantomData;

use abi::{KernelError, Priority, QueueId, TaskId, TaskState, Timeout};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

use crate::arch;
use crate::kernel::{Caller, Kernel};
use crate::queue::Transfer;
use crate::startup::with_kernel;
use crate::task::NextTask;
use crate::time::{self, Timestamp};

pub use crate::kernel::{FaultHook, IsrBlockingPolicy};
pub use crate::task::{TaskDesc, TaskEntry};

fn caller() -> Caller {
    if arch::in_interrupt() {
        Caller::Interrupt
    } else {
        Caller::Task
    }
}

/// Acts on a scheduling hint from the kernel. Must be called with the kernel
/// still held, so that no tick can get in between the decision and the
/// request.
fn reschedule(hint: NextTask) {
    if hint == NextTask::Other {
        arch::request_switch();
    }
}

/// Requests whatever switch the outcome of a transfer calls for: to a task it
/// readied, or away from a caller that now has to wait. Same rule as
/// `reschedule` about holding the kernel.
fn settle(
    result: Result<Transfer, KernelError>,
) -> Result<Transfer, KernelError> {
    match result {
        Ok(Transfer::Done(hint)) => reschedule(hint),
        Ok(Transfer::Blocked) => arch::request_switch(),
        Err(_) => (),
    }
    result
}

/// Waits until `finish` reports that the caller's wait is over. The switch
/// away from the caller has already been requested, so normally the first
/// look finds the result.
fn wait_for<T>(mut finish: impl FnMut(&mut Kernel) -> Option<T>) -> T {
    loop {
        if let Some(result) = with_kernel(&mut finish) {
            return result;
        }
        arch::yield_now();
    }
}

/// Creates a task. If it's more important than the caller, it runs before
/// this returns. Not allowed from an interrupt handler.
pub fn create(desc: &TaskDesc) -> Result<TaskId, KernelError> {
    if arch::in_interrupt() {
        return Err(KernelError::IllegalBlockingContext);
    }
    with_kernel(|k| {
        let (id, hint) = k.create(desc)?;
        reschedule(hint);
        Ok(id)
    })
}

/// Shorthand for `create` with an unnamed task.
pub fn create_task(
    entry: TaskEntry,
    arg: usize,
    priority: u8,
    stack_words: usize,
) -> Result<TaskId, KernelError> {
    create(&TaskDesc {
        name: "",
        entry,
        arg,
        priority: Priority(priority),
        stack_words,
    })
}

/// Deletes a task. A task deleting itself doesn't return.
pub fn delete(id: TaskId) -> Result<(), KernelError> {
    let itself = with_kernel(|k| {
        let itself = k.current_task() == Some(id);
        reschedule(k.delete(id)?);
        Ok::<_, KernelError>(itself)
    })?;
    if itself && !arch::in_interrupt() {
        vanish();
    }
    Ok(())
}

/// Ends the calling task. Its slot stays taken until someone deletes it.
pub fn exit() -> ! {
    if arch::in_interrupt() {
        crate::fail::die("exit from interrupt");
    }
    with_kernel(|k| reschedule(k.exit_current()));
    vanish()
}

/// Spins out the last moments of a task that is gone from the scheduler's
/// point of view. The switch away from it is already pending.
fn vanish() -> ! {
    loop {
        arch::yield_now();
    }
}

/// Gives the processor to the next task of the same priority, if there is
/// one. Does nothing from an interrupt handler.
pub fn yield_now() {
    if arch::in_interrupt() {
        return;
    }
    with_kernel(|k| reschedule(k.yield_current()));
}

/// Sleeps for `ticks` ticks. Zero is the same as `yield_now`.
pub fn delay(ticks: u32) -> Result<(), KernelError> {
    let transfer = with_kernel(|k| settle(k.delay(ticks, caller())))?;
    if transfer == Transfer::Blocked {
        wait_for(|k| k.take_wake().map(drop));
    }
    Ok(())
}

/// Sleeps for at least `ms` milliseconds.
pub fn delay_ms(ms: u32) -> Result<(), KernelError> {
    delay(time::ms_to_ticks(ms))
}

/// Ticks since the scheduler started.
pub fn now() -> Timestamp {
    with_kernel(|k| k.now())
}

/// The task that's running, or was interrupted. `None` before the scheduler
/// starts.
pub fn current() -> Option<TaskId> {
    with_kernel(|k| k.current_task())
}

pub fn task_state(id: TaskId) -> Result<TaskState, KernelError> {
    with_kernel(|k| k.task_state(id))
}

/// Fewest words of the task's stack that have never been used.
pub fn stack_high_water(id: TaskId) -> Result<usize, KernelError> {
    with_kernel(|k| k.stack_high_water(id))
}

pub fn context_switches() -> u64 {
    with_kernel(|k| k.context_switches())
}

pub fn set_isr_blocking_policy(policy: IsrBlockingPolicy) {
    with_kernel(|k| k.set_isr_blocking_policy(policy));
}

/// Installs (or, with `None`, removes) the function called when a task is
/// killed for a fault.
pub fn set_fault_hook(hook: Option<FaultHook>) {
    with_kernel(|k| k.set_fault_hook(hook));
}

/// Creates a queue of `capacity` items of `item_size` bytes. Queues must be
/// created before the scheduler starts.
pub fn create_queue(
    capacity: usize,
    item_size: usize,
) -> Result<QueueId, KernelError> {
    with_kernel(|k| k.create_queue(capacity, item_size))
}

/// Sends `item` to `q`, waiting up to `timeout` for room.
pub fn send(q: QueueId, item: &[u8], timeout: Timeout) -> Result<(), KernelError> {
    let transfer =
        with_kernel(|k| settle(k.queue_send(q, item, timeout, caller())))?;
    match transfer {
        Transfer::Done(_) => Ok(()),
        Transfer::Blocked => wait_for(|k| k.finish_send()),
    }
}

/// Receives an item from `q` into `out`, waiting up to `timeout` for one.
pub fn receive(
    q: QueueId,
    out: &mut [u8],
    timeout: Timeout,
) -> Result<(), KernelError> {
    let transfer = with_kernel(|k| {
        settle(k.queue_receive(q, &mut *out, timeout, caller()))
    })?;
    match transfer {
        Transfer::Done(_) => Ok(()),
        Transfer::Blocked => wait_for(|k| k.finish_receive(out)),
    }
}

/// A queue of `T`s. Items are copied in and out as bytes.
pub struct Queue<T> {
    id: QueueId,
    _item: PhantomData<fn(T) -> T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Queue<T> {}

impl<T> core::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Queue").field(&self.id).finish()
    }
}

impl<T: FromBytes + IntoBytes + Immutable> Queue<T> {
    /// Creates a queue with room for `capacity` items.
    pub fn create(capacity: usize) -> Result<Self, KernelError> {
        let id = create_queue(capacity, core::mem::size_of::<T>())?;
        Ok(Self {
            id,
            _item: PhantomData,
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn send(&self, item: &T, timeout: Timeout) -> Result<(), KernelError> {
        send(self.id, item.as_bytes(), timeout)
    }

    pub fn receive(&self, timeout: Timeout) -> Result<T, KernelError> {
        let mut item = T::new_zeroed();
        receive(self.id, item.as_mut_bytes(), timeout)?;
        Ok(item)
    }

    pub fn len(&self) -> usize {
        with_kernel(|k| k.queue_len(self.id)).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
