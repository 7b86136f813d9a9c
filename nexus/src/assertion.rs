//! The Assertion Bus (spec.md section 4.2): per-execution-thread counters
//! for checks, a silencing flag, a "terminate on failure" flag, and the
//! assertion-failure signal that unwinds the running test.
//!
//! Modeled as thread-local state (section 5: "the AssertionBus is
//! thread-local scoped state") rather than a value threaded through every
//! `CHECK!` call site, because `CHECK!`/`REQUIRE!` need to work as bare
//! macro invocations inside arbitrary test bodies without the user
//! plumbing a context object through every function they call.

use std::any::Any;
use std::cell::RefCell;

/// Location and message of the first failed check recorded on the current
/// thread since the last `reset`.
#[derive(Debug, Clone)]
pub struct FailureInfo {
    pub file: &'static str,
    pub line: u32,
    pub message: String,
}

/// Per-execution-thread check bookkeeping (spec.md section 3,
/// "AssertionBus state").
#[derive(Debug, Clone)]
pub struct AssertionBus {
    pub num_checks: u64,
    pub num_failed_checks: u64,
    pub silenced: bool,
    pub always_terminate: bool,
    pub first_failure: Option<FailureInfo>,
}

impl AssertionBus {
    fn zeroed(silenced: bool, always_terminate: bool) -> Self {
        AssertionBus {
            num_checks: 0,
            num_failed_checks: 0,
            silenced,
            always_terminate,
            first_failure: None,
        }
    }

    pub fn did_fail(&self) -> bool {
        self.num_failed_checks > 0
    }
}

thread_local! {
    static BUS: RefCell<AssertionBus> = RefCell::new(AssertionBus::zeroed(false, false));
}

/// Re-initializes the bus to fresh zeros. Called by the Runner immediately
/// before each test body runs (spec.md section 3: "All are re-initialized
/// before each test body runs").
pub fn reset(silenced: bool, always_terminate: bool) {
    BUS.with(|b| *b.borrow_mut() = AssertionBus::zeroed(silenced, always_terminate));
}

/// Snapshots the bus's counters and first failure without resetting them.
pub fn snapshot() -> AssertionBus {
    BUS.with(|b| b.borrow().clone())
}

/// Runs `f` with mutable access to the current thread's bus. Used by
/// invariant auto-application in the Machine (spec.md section 4.4), which
/// needs to flip `silenced`/`always_terminate` transiently.
pub fn with_bus<R>(f: impl FnOnce(&mut AssertionBus) -> R) -> R {
    BUS.with(|b| f(&mut b.borrow_mut()))
}

/// The assertion-failure signal's payload type (spec.md DESIGN NOTES:
/// "a dedicated error channel... not the language's general-purpose error
/// type"). It carries no data; all diagnostic information has already been
/// written into the bus's `first_failure` and the failure log by the time
/// this is raised.
#[derive(Debug)]
pub struct AssertionPanic;

/// Returns whether a caught panic payload is the assertion-failure signal
/// (as opposed to an unrelated user panic, which the Runner should not
/// silently swallow as a mere check failure).
pub fn is_assertion_panic(payload: &(dyn Any + Send)) -> bool {
    payload.downcast_ref::<AssertionPanic>().is_some()
}

/// Records one check result (spec.md section 4.2, steps 1-4). `msg` is
/// computed lazily so passing checks pay no formatting cost.
///
/// Raises the assertion-failure signal (non-local unwind, section 4.2 step
/// 4) if `pass` is false and either `terminate`, or the bus's
/// `always_terminate` is set.
pub fn record_check(
    pass: bool,
    file: &'static str,
    line: u32,
    terminate: bool,
    msg: impl FnOnce() -> String,
) {
    let should_raise = BUS.with(|b| {
        let mut bus = b.borrow_mut();
        bus.num_checks += 1;
        if pass {
            return false;
        }
        bus.num_failed_checks += 1;
        let message = msg();
        if !bus.silenced {
            eprintln!("{}:{}: {}", file, line, message);
        }
        if bus.first_failure.is_none() {
            bus.first_failure = Some(FailureInfo {
                file,
                line,
                message,
            });
        }
        terminate || bus.always_terminate
    });
    if should_raise {
        std::panic::panic_any(AssertionPanic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_checks_and_keeps_first_failure() {
        reset(true, false);
        record_check(true, "f", 1, false, || "unreachable".into());
        record_check(false, "f", 2, false, || "first".into());
        record_check(false, "f", 3, false, || "second".into());
        let snap = snapshot();
        assert_eq!(snap.num_checks, 3);
        assert_eq!(snap.num_failed_checks, 2);
        assert_eq!(snap.first_failure.unwrap().line, 2);
    }

    #[test]
    #[should_panic]
    fn terminate_raises_signal() {
        reset(true, false);
        record_check(false, "f", 1, true, || "boom".into());
    }
}
