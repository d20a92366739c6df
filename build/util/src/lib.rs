// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::env;

/// Target families the kernel knows how to run on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TargetProfile {
    /// One of the ARM M-profile targets (`thumbv*`).
    ArmM,
    /// 32-bit RISC-V, machine mode.
    Riscv32,
    /// Anything else. Only the host simulation is available here.
    Host,
}

/// Exposes the CPU's architecture version. This isn't available in rustc's
/// standard environment.
///
/// For ARM targets this will set one of `cfg(armv6m)`, `cfg(armv7m)`, or
/// `cfg(armv8m)` depending on the value of the `TARGET` environment variable,
/// plus `cfg(has_fpu)` for hard-float targets. RISC-V and host targets get no
/// extra cfgs, since rustc's own `target_arch` is enough to tell them apart.
pub fn expose_target_profile() -> Result<TargetProfile> {
    let target = env::var("TARGET").context("TARGET not set")?;

    let profile = if target.starts_with("thumbv6m") {
        println!("cargo:rustc-cfg=armv6m");
        TargetProfile::ArmM
    } else if target.starts_with("thumbv7m") || target.starts_with("thumbv7em")
    {
        println!("cargo:rustc-cfg=armv7m");
        TargetProfile::ArmM
    } else if target.starts_with("thumbv8m") {
        println!("cargo:rustc-cfg=armv8m");
        TargetProfile::ArmM
    } else if target.starts_with("thumb") {
        bail!("Don't know the target {target}");
    } else if target.starts_with("riscv32") {
        TargetProfile::Riscv32
    } else {
        TargetProfile::Host
    };

    if profile == TargetProfile::ArmM && target.ends_with("eabihf") {
        println!("cargo:rustc-cfg=has_fpu");
    }

    Ok(profile)
}

/// Pulls a RON document out of the environment variable `var` and parses it
/// as `T`, using `T::default()` if the variable is missing. If the variable
/// is present but fails to parse, this fails with `Err`.
///
/// Note that -- thanks to the magic of Serde -- fields missing from the
/// document take their defaults as long as `T` is marked `#[serde(default)]`.
pub fn ron_from_env_or_default<T: DeserializeOwned + Default>(
    var: &str,
) -> Result<T> {
    // We want to emit this whether or not the env var is present, so that we'll
    // be re-run if it becomes present.
    println!("cargo:rerun-if-env-changed={var}");

    let text = match env::var(var) {
        Ok(text) => {
            println!("--- ron for ${var} ---");
            println!("{text}");
            text
        }
        Err(_) => {
            println!("--- var ${var} not present, using default ---");
            return Ok(T::default());
        }
    };
    ron::de::from_str(&text).with_context(|| format!("parsing ${var}"))
}
