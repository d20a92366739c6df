// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Skiff kernel.
//!
//! A small preemptive kernel: a fixed pool of tasks scheduled by priority with
//! round-robin among equals, a periodic tick, and bounded blocking queues for
//! passing messages between tasks (and from interrupt handlers to tasks).
//!
//! Code outside of the `arch` module is portable. All of the scheduling state
//! lives in a single [`kernel::Kernel`] object, which is a plain value: on a
//! target there is exactly one, kept behind a critical section in
//! [`startup`], while on the host tests build as many as they like and drive
//! them directly, playing the parts of the running task and of interrupt
//! handlers.
//!
//! # Design principles
//!
//! 1. Static configuration. The number of tasks, priority levels, stack sizes
//!    and queue storage are fixed when the kernel is built (see `build.rs`).
//!    Nothing is allocated at runtime.
//! 2. A strong preference for safe code where reasonable. The unsafe parts are
//!    the register save/restore sequences in `arch`, and little else.
//! 3. A preference for simple and clear algorithms over fast and clever
//!    algorithms. Lists are scanned, not indexed by bitmaps.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod api;
pub mod config;
pub mod fail;
pub mod frame;
pub mod kernel;
pub mod queue;
pub mod sched;
pub mod stack;
pub mod startup;
pub mod stream;
pub mod task;
pub mod time;
