//-
// Copyright 2017, 2018 The proptest developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;

use crate::reason::Reason;

/// The error taxonomy for nexus (spec.md section 7).
///
/// This is *not* the assertion-failure signal (see `assertion::AssertionPanic`):
/// `NexusError` is a recoverable value returned from machine/trace-replay
/// helpers, while the assertion-failure signal is the non-local unwind
/// `CHECK!`/`REQUIRE!` raise on a terminating failure.
#[derive(Debug, Clone)]
pub enum NexusError {
    /// A `CHECK`/`REQUIRE`, or an invariant, observed a false predicate.
    CheckFailure(Reason),
    /// 1000 consecutive fallback attempts failed to satisfy any op's
    /// precondition; lists the function names that were stuck.
    PreconditionStarvation { stuck: Vec<&'static str> },
    /// Machine build found a type with no safe generator, or no test
    /// functions.
    SetupError(Reason),
    /// An equivalence spec is incompatible with the registered operation set
    /// (a bridging function, or related functions that fail to pair up).
    BridgingViolation(Reason),
}

pub type NexusResult<T> = Result<T, NexusError>;

impl fmt::Display for NexusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NexusError::CheckFailure(r) => write!(f, "check failed: {}", r),
            NexusError::PreconditionStarvation { stuck } => write!(
                f,
                "unable to satisfy any precondition; stuck on: {}",
                stuck.join(", ")
            ),
            NexusError::SetupError(r) => write!(f, "machine setup error: {}", r),
            NexusError::BridgingViolation(r) => {
                write!(f, "equivalence bridging violation: {}", r)
            }
        }
    }
}

impl std::error::Error for NexusError {}

impl From<Reason> for NexusError {
    fn from(r: Reason) -> Self {
        NexusError::CheckFailure(r)
    }
}

/// Funnels a `NexusResult` through the assertion bus instead of the
/// language's general-purpose panic machinery (spec.md section 7: setup
/// errors, precondition starvation, and bridging violations are "surfaced as
/// a required-check failure", not a bare Rust panic). Test bodies call
/// `MctDriver::run(..).require()` rather than `.unwrap()` so that a driver
/// error counts against the bus and raises the same assertion-failure signal
/// every other terminating `CHECK!` does.
pub trait RequireOk {
    fn require(self);
}

impl RequireOk for NexusResult<()> {
    fn require(self) {
        if let Err(e) = self {
            crate::assertion::record_check(false, "mct", 0, true, || e.to_string());
        }
    }
}
