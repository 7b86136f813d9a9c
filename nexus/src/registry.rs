//! The process-wide Registry (spec.md section 4.1): an append-only,
//! self-populating list of tests and apps.
//!
//! Registration happens through `inventory::submit!`, emitted by the
//! `#[nexus::test]`/`#[nexus::app]` proc-macros in `nexus-macros`. The
//! first read of `all_tests()`/`all_apps()` lazily builds the backing
//! `Vec`s via `once_cell::sync::Lazy`, which realizes DESIGN NOTES'
//! "lazily initialized, write-once-then-read-only container whose first
//! read happens strictly after all registrations": by the time `main`
//! (or the Runner) calls `all_tests()`, every `inventory::submit!` emitted
//! by `ctor`-style static initializers has already run.

use std::cell::RefCell;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::reason::Reason;

/// Dense index into the registry's backing `Vec<Test>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId(pub usize);

/// Dense index into the registry's backing `Vec<App>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(pub usize);

pub type TestBody = fn();
pub type AppBody = fn(&[String]);

/// How a test should be reproduced instead of running normally (spec.md
/// section 3: `reproduction ∈ {none, seed_only(u64), trace(string)}`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reproduction {
    None,
    SeedOnly(u64),
    Trace(String),
}

impl Default for Reproduction {
    fn default() -> Self {
        Reproduction::None
    }
}

/// The observed-outcome tuple from spec.md section 3's Test identity.
#[derive(Clone, Debug, Default)]
pub struct TestOutcome {
    pub did_fail: bool,
    pub num_checks: u64,
    pub num_failed_checks: u64,
    pub first_fail_info: Option<(&'static str, u32, String)>,
    /// Unix timestamp (seconds) the test execution started.
    pub execution_timestamp: Option<i64>,
    pub execution_seconds: f64,
}

/// The static, macro-generated half of a test: everything fixed at
/// `#[nexus::test(..)]` expansion time.
#[derive(Clone)]
pub struct TestRecord {
    pub name: &'static str,
    pub source_file: &'static str,
    pub source_line: u32,
    pub body: TestBody,
    pub exclusive: bool,
    pub should_fail: bool,
    pub endless: bool,
    pub disabled: bool,
    pub debug: bool,
    pub verbose: bool,
    pub seed: Option<u64>,
    pub before: Option<&'static str>,
    pub after: Option<&'static str>,
    pub opt_in_group: Option<&'static str>,
}

impl TestRecord {
    pub fn new(
        name: &'static str,
        source_file: &'static str,
        source_line: u32,
        body: TestBody,
    ) -> Self {
        TestRecord {
            name,
            source_file,
            source_line,
            body,
            exclusive: false,
            should_fail: false,
            endless: false,
            disabled: false,
            debug: false,
            verbose: false,
            seed: None,
            before: None,
            after: None,
            opt_in_group: None,
        }
    }

    pub fn with_exclusive(mut self, v: bool) -> Self {
        self.exclusive = v;
        self
    }
    pub fn with_should_fail(mut self, v: bool) -> Self {
        self.should_fail = v;
        self
    }
    pub fn with_endless(mut self, v: bool) -> Self {
        self.endless = v;
        self
    }
    pub fn with_disabled(mut self, v: bool) -> Self {
        self.disabled = v;
        self
    }
    pub fn with_debug(mut self, v: bool) -> Self {
        self.debug = v;
        self
    }
    pub fn with_verbose(mut self, v: bool) -> Self {
        self.verbose = v;
        self
    }
    pub fn with_seed(mut self, v: Option<u64>) -> Self {
        self.seed = v;
        self
    }
    pub fn with_before(mut self, v: Option<&'static str>) -> Self {
        self.before = v;
        self
    }
    pub fn with_after(mut self, v: Option<&'static str>) -> Self {
        self.after = v;
        self
    }
    pub fn with_opt_in_group(mut self, v: Option<&'static str>) -> Self {
        self.opt_in_group = v;
        self
    }
}

/// The static, macro-generated half of an app.
#[derive(Clone)]
pub struct AppRecord {
    pub name: &'static str,
    pub source_file: &'static str,
    pub source_line: u32,
    pub body: AppBody,
}

impl AppRecord {
    pub fn new(
        name: &'static str,
        source_file: &'static str,
        source_line: u32,
        body: AppBody,
    ) -> Self {
        AppRecord {
            name,
            source_file,
            source_line,
            body,
        }
    }
}

/// The inventory-collected wrapper a `#[nexus::test]`-expanded ctor
/// function submits.
pub struct TestCtor(pub fn() -> TestRecord);
inventory::collect!(TestCtor);

/// The inventory-collected wrapper a `#[nexus::app]`-expanded ctor
/// function submits.
pub struct AppCtor(pub fn() -> AppRecord);
inventory::collect!(AppCtor);

#[derive(Debug, Default)]
struct TestState {
    seed: u64,
    seed_overwritten: bool,
    endless: bool,
    reproduction: Reproduction,
    outcome: TestOutcome,
}

/// A registered test: the record plus its mutable runtime state. Only the
/// "observed outcome" part needs interior mutability (spec.md section 3). A
/// `Mutex` rather than a `RefCell` holds it, since `Test` lives inside the
/// process-wide `static TESTS` and so must be `Sync`; the Runner's own
/// single-threaded, sequential execution (spec.md section 5) means the lock
/// is never actually contended.
pub struct Test {
    pub id: TestId,
    pub record: TestRecord,
    state: Mutex<TestState>,
}

impl Test {
    fn new(id: TestId, record: TestRecord) -> Self {
        let endless = record.endless;
        let seed = record.seed.unwrap_or(0);
        let seed_overwritten = record.seed.is_some();
        Test {
            id,
            record,
            state: Mutex::new(TestState {
                seed,
                seed_overwritten,
                endless,
                reproduction: Reproduction::None,
                outcome: TestOutcome::default(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.record.name
    }

    pub fn is_exclusive(&self) -> bool {
        self.record.exclusive
    }
    pub fn should_fail(&self) -> bool {
        self.record.should_fail
    }
    pub fn is_disabled(&self) -> bool {
        self.record.disabled
    }
    pub fn is_debug(&self) -> bool {
        self.record.debug
    }
    pub fn is_endless(&self) -> bool {
        self.state.lock().unwrap().endless
    }
    pub fn opt_in_group(&self) -> Option<&'static str> {
        self.record.opt_in_group
    }

    pub fn seed(&self) -> u64 {
        self.state.lock().unwrap().seed
    }

    /// Assigns `run_seed` unless this test overrode its own seed (spec.md
    /// section 4.9 step 5: "Assign run_seed if the test did not override
    /// its seed").
    pub fn assign_run_seed(&self, run_seed: u64) {
        let mut s = self.state.lock().unwrap();
        if !s.seed_overwritten {
            s.seed = run_seed;
        }
    }

    pub fn force_endless(&self) {
        self.state.lock().unwrap().endless = true;
    }

    pub fn reproduction(&self) -> Reproduction {
        self.state.lock().unwrap().reproduction.clone()
    }

    pub fn should_reproduce(&self) -> bool {
        !matches!(self.state.lock().unwrap().reproduction, Reproduction::None)
    }

    pub fn set_reproduction(&self, repr: Reproduction) {
        self.state.lock().unwrap().reproduction = repr;
    }

    pub fn record_outcome(&self, outcome: TestOutcome) {
        self.state.lock().unwrap().outcome = outcome;
    }

    pub fn outcome(&self) -> TestOutcome {
        self.state.lock().unwrap().outcome.clone()
    }
}

/// A registered app: an alternative entry point, no assertion bookkeeping.
pub struct App {
    pub id: AppId,
    pub record: AppRecord,
}

impl App {
    pub fn name(&self) -> &'static str {
        self.record.name
    }
    pub fn run(&self, argv: &[String]) {
        (self.record.body)(argv)
    }
}

static TESTS: Lazy<Vec<Test>> = Lazy::new(|| {
    inventory::iter::<TestCtor>()
        .enumerate()
        .map(|(i, ctor)| Test::new(TestId(i), (ctor.0)()))
        .collect()
});

static APPS: Lazy<Vec<App>> = Lazy::new(|| {
    inventory::iter::<AppCtor>()
        .enumerate()
        .map(|(i, ctor)| App {
            id: AppId(i),
            record: (ctor.0)(),
        })
        .collect()
});

/// All registered tests, in registration order (spec.md section 4.1:
/// "registration order is preserved and is the default iteration order").
pub fn all_tests() -> &'static [Test] {
    &TESTS
}

/// All registered apps, in registration order.
pub fn all_apps() -> &'static [App] {
    &APPS
}

pub fn find_test(name: &str) -> Option<&'static Test> {
    all_tests().iter().find(|t| t.name() == name)
}

pub fn find_app(name: &str) -> Option<&'static App> {
    all_apps().iter().find(|a| a.name() == name)
}

thread_local! {
    static CURRENT_TEST: RefCell<Option<&'static Test>> = RefCell::new(None);
}

/// The test whose body is presently executing on this thread, if any. The
/// MCT Driver reads this to find its seed/reproduction instead of the test
/// body having to pass itself down explicitly (spec.md section 4.9 runs
/// each test on the thread that calls its body, one at a time).
pub fn current_test() -> Option<&'static Test> {
    CURRENT_TEST.with(|c| *c.borrow())
}

/// Binds `test` as `current_test()` for the duration of `f`, restoring the
/// previous value afterward (Runner invokes this around every test body).
pub fn run_with_current_test<R>(test: &'static Test, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_TEST.with(|c| c.borrow_mut().replace(test));
    let result = f();
    CURRENT_TEST.with(|c| *c.borrow_mut() = previous);
    result
}

/// The closed set of runtime `configure` options (spec.md section 4.1).
/// Most of these are set at registration time via `#[nexus::test(..)]`
/// attribute arguments; this enum exists for the subset the Runner applies
/// post-registration from parsed CLI flags (`endless`, `reproduce`).
pub enum ConfigureOption {
    Endless,
    Reproduce(Reproduction),
    Seed(u64),
}

pub fn configure(test: &Test, option: ConfigureOption) -> Result<(), Reason> {
    match option {
        ConfigureOption::Endless => test.force_endless(),
        ConfigureOption::Reproduce(r) => test.set_reproduction(r),
        ConfigureOption::Seed(s) => {
            let mut state = test.state.lock().unwrap();
            state.seed = s;
            state.seed_overwritten = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_defaults() {
        fn body() {}
        let r = TestRecord::new("x", "f.rs", 1, body);
        assert!(!r.exclusive);
        assert!(!r.should_fail);
        assert_eq!(r.seed, None);
    }

    #[test]
    fn seed_assignment_respects_override() {
        fn body() {}
        let rec = TestRecord::new("x", "f.rs", 1, body).with_seed(Some(7));
        let t = Test::new(TestId(0), rec);
        t.assign_run_seed(99);
        assert_eq!(t.seed(), 7);

        let rec2 = TestRecord::new("y", "f.rs", 1, body);
        let t2 = Test::new(TestId(1), rec2);
        t2.assign_run_seed(99);
        assert_eq!(t2.seed(), 99);
    }
}
