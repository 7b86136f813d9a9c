//-
// Copyright 2017, 2018, 2019 The proptest developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Global configuration, loaded once from `NEXUS_*` environment variables
//! and overridable per call. Grounded on the teacher's
//! `test_runner/config.rs`: a plain `Clone + Debug` struct, defaults baked
//! in, environment variables parsed once into a `lazy_static` and merged
//! over the defaults, with a warning (not a hard error) on unparsable or
//! unknown variables.

use std::env;
use std::fmt;
use std::str::FromStr;

const MIN_EXECUTIONS: &str = "NEXUS_MIN_EXECUTIONS";
const MAX_SHRINK_ITERS: &str = "NEXUS_MAX_SHRINK_ITERS";
const MAX_SHRINK_TIME_MS: &str = "NEXUS_MAX_SHRINK_TIME_MS";
const FUZZ_MAX_ITERATIONS: &str = "NEXUS_FUZZ_MAX_ITERATIONS";
const FUZZ_MAX_CYCLE_MS: &str = "NEXUS_FUZZ_MAX_CYCLE_MS";
const VERBOSE: &str = "NEXUS_VERBOSE";

fn parse_or_warn<T: FromStr + fmt::Display>(
    src: &str,
    dst: &mut T,
    typ: &str,
    var: &str,
) {
    if let Ok(value) = src.parse() {
        *dst = value;
    } else {
        eprintln!(
            "nexus: the env-var {}={} can't be parsed as {}, using default of {}.",
            var, src, typ, *dst
        );
    }
}

fn contextualize_config(mut result: Config) -> Config {
    for (var, value) in env::vars() {
        match var.as_str() {
            MIN_EXECUTIONS => parse_or_warn(
                &value,
                &mut result.min_executions,
                "u32",
                MIN_EXECUTIONS,
            ),
            MAX_SHRINK_ITERS => parse_or_warn(
                &value,
                &mut result.max_shrink_iters,
                "u32",
                MAX_SHRINK_ITERS,
            ),
            MAX_SHRINK_TIME_MS => parse_or_warn(
                &value,
                &mut result.max_shrink_time_ms,
                "u32",
                MAX_SHRINK_TIME_MS,
            ),
            FUZZ_MAX_ITERATIONS => parse_or_warn(
                &value,
                &mut result.fuzz_max_iterations,
                "u32",
                FUZZ_MAX_ITERATIONS,
            ),
            FUZZ_MAX_CYCLE_MS => parse_or_warn(
                &value,
                &mut result.fuzz_max_cycle_ms,
                "u64",
                FUZZ_MAX_CYCLE_MS,
            ),
            VERBOSE => {
                parse_or_warn(&value, &mut result.verbose, "u32", VERBOSE)
            }
            _ => {
                if var.starts_with("NEXUS_") {
                    eprintln!("nexus: ignoring unknown env-var {}.", var);
                }
            }
        }
    }
    result
}

fn default_default_config() -> Config {
    Config {
        min_executions: 100,
        max_shrink_iters: 10_000,
        max_shrink_time_ms: 0,
        fuzz_max_iterations: 1_000,
        fuzz_max_cycle_ms: 10_000,
        verbose: 0,
        _non_exhaustive: (),
    }
}

lazy_static::lazy_static! {
    static ref DEFAULT_CONFIG: Config = contextualize_config(default_default_config());
}

/// Run-wide tuning knobs, merged once from `NEXUS_*` environment variables
/// over hardcoded defaults. The per-function-descriptor `min_executions`
/// (spec.md section 3) defaults from `Config::min_executions` but may be
/// overridden per op via `FunctionDescriptor::min_executions`.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Default minimum number of times each MCT test function must execute
    /// before the Machine's loop may terminate (spec.md section 4.4/4.9,
    /// scenario S4: "each op at least 100 times").
    ///
    /// Overridable with `NEXUS_MIN_EXECUTIONS`.
    pub min_executions: u32,

    /// Bound on the number of minimizer proposals tried before giving up,
    /// guarding against pathological non-termination beyond the complexity
    /// well-foundedness argument (spec.md section 4.6).
    ///
    /// Overridable with `NEXUS_MAX_SHRINK_ITERS`.
    pub max_shrink_iters: u32,

    /// If non-zero, stop minimizing after this many milliseconds have
    /// elapsed since the start of the minimization loop.
    ///
    /// Overridable with `NEXUS_MAX_SHRINK_TIME_MS`.
    pub max_shrink_time_ms: u32,

    /// Default fuzz driver iteration budget (spec.md section 4.8).
    ///
    /// Overridable with `NEXUS_FUZZ_MAX_ITERATIONS`.
    pub fuzz_max_iterations: u32,

    /// Default fuzz driver elapsed-time budget, in milliseconds, standing
    /// in for the source's "elapsed cycles" (spec.md section 4.8).
    ///
    /// Overridable with `NEXUS_FUZZ_MAX_CYCLE_MS`.
    pub fuzz_max_cycle_ms: u64,

    /// Diagnostic verbosity, matching the teacher's `verbose_message!`
    /// levels:
    ///
    /// - 0: no extra output.
    /// - 1: log failure summaries.
    /// - 2: trace low-level machine/minimizer details.
    ///
    /// Overridable with `NEXUS_VERBOSE`.
    pub verbose: u32,

    #[doc(hidden)]
    pub _non_exhaustive: (),
}

impl Default for Config {
    fn default() -> Self {
        DEFAULT_CONFIG.clone()
    }
}

impl Config {
    /// The process-wide config merged from `NEXUS_*` env vars, cloned for
    /// the caller to use or override. Equivalent to `Config::default()`;
    /// spelled out separately because call sites read better as "the config
    /// in effect right now" than "the default config".
    pub fn current() -> Self {
        DEFAULT_CONFIG.clone()
    }
}

/// Leveled diagnostic logging, matching the teacher's `verbose_message!`
/// macro shape: a level, then `format!`-style args, gated on
/// `Config::verbose`.
#[macro_export]
macro_rules! verbose_message {
    ($config:expr, $level:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {
        if $config.verbose >= $level {
            eprintln!(concat!("[nexus] ", $fmt) $(, $arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = default_default_config();
        assert_eq!(c.min_executions, 100);
        assert!(c.fuzz_max_iterations > 0);
    }
}
