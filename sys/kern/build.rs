// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Smallest stack slot we accept. The largest frame is 32 words (RV32); the
/// rest is headroom for the guard word and the task's first few calls.
const MIN_STACK_WORDS: usize = 64;

fn main() -> Result<()> {
    build_util::expose_target_profile()?;

    let kconfig: KernelConfig =
        build_util::ron_from_env_or_default("SKIFF_KCONFIG")?;
    kconfig.validate()?;
    generate_kconfig(&kconfig)?;

    Ok(())
}

/// Build-time kernel configuration, read as RON from `$SKIFF_KCONFIG`, e.g.
///
/// ```text
/// (tick_hz: 1000, cpu_hz: 64_000_000, max_tasks: 4)
/// ```
///
/// Fields that are left out take the defaults below.
#[derive(Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
struct KernelConfig {
    tick_hz: u32,
    cpu_hz: u32,
    priority_levels: usize,
    max_tasks: usize,
    stack_words: usize,
    max_queues: usize,
    queue_pool_bytes: usize,
    max_item_size: usize,
    clint_base: u32,
    isr_stack_words: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_hz: 100,
            cpu_hz: 16_000_000,
            priority_levels: 8,
            max_tasks: 8,
            stack_words: 256,
            max_queues: 4,
            queue_pool_bytes: 1024,
            max_item_size: 32,
            clint_base: 0x0200_0000,
            isr_stack_words: 256,
        }
    }
}

impl KernelConfig {
    fn validate(&self) -> Result<()> {
        if self.tick_hz == 0 || self.cpu_hz / self.tick_hz == 0 {
            bail!(
                "tick_hz ({}) must be nonzero and at most cpu_hz ({})",
                self.tick_hz,
                self.cpu_hz
            );
        }
        if !(2..=256).contains(&self.priority_levels) {
            bail!(
                "priority_levels must be in 2..=256 (one is idle's), got {}",
                self.priority_levels
            );
        }
        // Task slots are indexed by 8 bits of a TaskId, and idle takes one.
        if !(1..=255).contains(&self.max_tasks) {
            bail!("max_tasks must be in 1..=255, got {}", self.max_tasks);
        }
        if self.stack_words < MIN_STACK_WORDS || self.stack_words % 4 != 0 {
            bail!(
                "stack_words must be a multiple of 4 and at least {}, got {}",
                MIN_STACK_WORDS,
                self.stack_words
            );
        }
        if self.isr_stack_words < MIN_STACK_WORDS
            || self.isr_stack_words % 4 != 0
        {
            bail!(
                "isr_stack_words must be a multiple of 4 and at least {}",
                MIN_STACK_WORDS
            );
        }
        if self.max_queues > 256 {
            bail!("max_queues must be at most 256, got {}", self.max_queues);
        }
        if self.max_item_size == 0 {
            bail!("max_item_size must be nonzero");
        }
        Ok(())
    }
}

fn generate_kconfig(kconfig: &KernelConfig) -> Result<()> {
    let out = &PathBuf::from(env::var_os("OUT_DIR").context("no OUT_DIR")?);
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(file, "pub const TICK_HZ: u32 = {};", kconfig.tick_hz)?;
    writeln!(file, "pub const CPU_HZ: u32 = {};", kconfig.cpu_hz)?;
    writeln!(
        file,
        "pub const PRIORITY_LEVELS: usize = {};",
        kconfig.priority_levels
    )?;
    writeln!(file, "pub const MAX_TASKS: usize = {};", kconfig.max_tasks)?;
    writeln!(file, "pub const STACK_WORDS: usize = {};", kconfig.stack_words)?;
    writeln!(file, "pub const MAX_QUEUES: usize = {};", kconfig.max_queues)?;
    writeln!(
        file,
        "pub const QUEUE_POOL_BYTES: usize = {};",
        kconfig.queue_pool_bytes
    )?;
    writeln!(
        file,
        "pub const MAX_ITEM_SIZE: usize = {};",
        kconfig.max_item_size
    )?;
    writeln!(file, "pub const CLINT_BASE: usize = {:#x};", kconfig.clint_base)?;
    writeln!(
        file,
        "pub const ISR_STACK_WORDS: usize = {};",
        kconfig.isr_stack_words
    )?;

    Ok(())
}
