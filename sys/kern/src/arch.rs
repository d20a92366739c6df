// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same set
//! of names: the `uassert!` macro, `Frame`, `idle_main`, `task_exit`,
//! `request_switch`, `yield_now`, `in_interrupt`, `disable_interrupts` and
//! `start_first_task`.

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(all(target_arch = "riscv32", target_os = "none"))] {
        #[macro_use]
        pub mod riscv32;
        pub use riscv32::*;
    } else if #[cfg(target_os = "none")] {
        compile_error!("support for this architecture not implemented");
    } else {
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
