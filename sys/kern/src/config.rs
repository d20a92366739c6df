// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-time kernel configuration.
//!
//! The constants included here are generated by `build.rs` from the RON
//! document in `$SKIFF_KCONFIG`, or from defaults when that isn't set.

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

/// Number of task slots: every user task, plus idle.
pub const TASK_SLOTS: usize = MAX_TASKS + 1;

/// Timer input clocks per kernel tick.
pub const TICK_DIVISOR: u32 = CPU_HZ / TICK_HZ;

static_assertions::const_assert!(PRIORITY_LEVELS >= 2);
static_assertions::const_assert!(TASK_SLOTS <= 1 << abi::TaskId::INDEX_BITS);
static_assertions::const_assert!(MAX_QUEUES <= 256);
static_assertions::const_assert!(TICK_DIVISOR > 0);
