//! The Runner (spec.md section 4.9): discovers, selects, seeds, runs,
//! times, and reports registered tests and apps. Modeled on the teacher's
//! `TestRunner::run`/`call_test` shape — a `catch_unwind`-wrapped
//! invocation of the test body around a reset-then-snapshot bus, with
//! `verbose_message!`-style leveled diagnostics — generalized from "run one
//! generated case" to "run every selected registered test in order".

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::assertion;
use crate::cli::Args;
use crate::config::Config;
use crate::registry::{self, ConfigureOption, Reproduction, Test};
use crate::report::{self, Report, Testcase, TestcaseStatus};
use crate::rng::TestRng;
use crate::verbose_message;

/// The test binary's entry point: `fn main() { nexus::runner::main(); }`.
/// Parses argv, runs the algorithm in spec.md section 4.9, and exits the
/// process with the resulting code.
pub fn main() {
    let args = Args::parse_args();
    std::process::exit(run(&args));
}

/// Runs the full Runner algorithm against already-parsed `args`, returning
/// the process exit code rather than calling `std::process::exit` directly
/// so tests can call this without tearing down the test harness itself.
pub fn run(args: &Args) -> i32 {
    let config = Config::current();

    // Step 2: any App matching an explicit name takes over entirely.
    if !args.names.is_empty() {
        let matching_apps: Vec<&registry::App> = registry::all_apps()
            .iter()
            .filter(|a| args.names.iter().any(|n| n == a.name()))
            .collect();
        if !matching_apps.is_empty() {
            let argv: Vec<String> = std::env::args().skip(1).collect();
            for app in matching_apps {
                app.run(&argv);
            }
            return 0;
        }
    }

    if args.list {
        for t in registry::all_tests() {
            println!("{}", t.name());
        }
        for a in registry::all_apps() {
            println!("{} (app)", a.name());
        }
        return 0;
    }

    // Step 3: sentinel XML, written before a single test runs.
    if let Some(path) = &args.xml {
        if let Err(e) = report::write_sentinel(path) {
            eprintln!("nexus: failed to write sentinel xml to {}: {}", path, e);
        }
    }

    // Step 4: run_seed and selection.
    let run_seed = hash_clock_now();
    let (to_run, disabled) = select_tests(args, run_seed);

    verbose_message!(
        config,
        1,
        "running {} test(s), {} disabled, run_seed = {}",
        to_run.len(),
        disabled.len(),
        run_seed
    );

    let run_start = Instant::now();
    let run_timestamp = unix_seconds_now();

    let mut report = Report::new("nexus");
    let mut any_unexpected_failure = false;

    for &test in &disabled {
        report.add_testcase(Testcase {
            name: test.name().to_string(),
            assertions: 0,
            time: 0.0,
            file: test.record.source_file.to_string(),
            line: test.record.source_line,
            status: TestcaseStatus::Skipped,
        });
    }

    let mut ran = Vec::with_capacity(to_run.len());
    for &test in &to_run {
        if let Some(blocker) = failed_after_dependency(test, &to_run) {
            verbose_message!(
                config,
                1,
                "skipping `{}`: after-dependency `{}` failed",
                test.name(),
                blocker.name()
            );
            report.add_testcase(Testcase {
                name: test.name().to_string(),
                assertions: 0,
                time: 0.0,
                file: test.record.source_file.to_string(),
                line: test.record.source_line,
                status: TestcaseStatus::Skipped,
            });
            continue;
        }

        let outcome = run_one_test(test, args, run_seed, &config);
        if outcome.did_fail != test.should_fail() {
            any_unexpected_failure = true;
        }
        report.add_testcase(outcome_to_testcase(test, &outcome));
        ran.push(test);
    }

    report.time = run_start.elapsed().as_secs_f64();
    report.timestamp = run_timestamp;

    if let Some(path) = &args.xml {
        // Step 7: overwrite the sentinel with the real report.
        if let Err(e) = report::write_report(&report, path) {
            eprintln!("nexus: failed to write xml to {}: {}", path, e);
        }
    }

    if to_run.is_empty() && disabled.is_empty() {
        eprintln!("nexus: no tests selected");
    }

    print_summary(&ran, run_seed);

    if any_unexpected_failure {
        1
    } else {
        0
    }
}

/// One test's outcome as recorded by [`run_one_test`], bridging
/// `registry::TestOutcome` (what the registry remembers about the test
/// going forward) and what the XML report and summary line need to say
/// about this run specifically.
struct RunOutcome {
    did_fail: bool,
    num_checks: u64,
    num_failed_checks: u64,
    first_fail_info: Option<(&'static str, u32, String)>,
    seconds: f64,
}

/// Partitions all registered tests into "to run" / "disabled" per spec.md
/// section 4.9 step 4: explicit names (if any) narrow the set first, then
/// `isEnabled` and opt-in group membership apply.
fn select_tests(args: &Args, run_seed: u64) -> (Vec<&'static Test>, Vec<&'static Test>) {
    let all = registry::all_tests();
    let mut to_run = Vec::new();
    let mut disabled = Vec::new();

    for test in all {
        let named = args.names.is_empty() || args.names.iter().any(|n| n == test.name());
        if !named {
            continue;
        }

        let group_ok = match test.opt_in_group() {
            None => true,
            Some(g) => args.groups.iter().any(|wanted| wanted == g),
        };

        if test.is_disabled() || !group_ok {
            disabled.push(test);
            continue;
        }

        test.assign_run_seed(run_seed);
        if args.endless {
            test.force_endless();
        }
        if let Some(repr) = &args.repr {
            let reproduction = parse_reproduction(repr);
            let _ = registry::configure(test, ConfigureOption::Reproduce(reproduction));
        }
        to_run.push(test);
    }

    (order_by_before_after(to_run), disabled)
}

/// `*` matches any run of characters, anything else matches literally
/// (spec.md section 4.1 `before(pattern)`/`after(pattern)`, resolved against
/// `examples/original_source/src/nexus/test.hh`'s `after("some pattern*")`
/// example).
fn pattern_matches(pattern: &str, name: &str) -> bool {
    fn rec(p: &[u8], n: &[u8]) -> bool {
        match p.first() {
            None => n.is_empty(),
            Some(b'*') => rec(&p[1..], n) || (!n.is_empty() && rec(p, &n[1..])),
            Some(&c) => n.first() == Some(&c) && rec(&p[1..], &n[1..]),
        }
    }
    rec(pattern.as_bytes(), name.as_bytes())
}

/// Reorders `tests` so that every `before(pattern)`/`after(pattern)`
/// ordering constraint among them is respected (spec.md section 4.1,
/// resolved per `test.hh:33-35`: "runs this test before/after some other
/// tests"), via a stable topological sort (Kahn's algorithm, processing
/// ready nodes in their original relative order). A pattern with no match
/// among the selected tests imposes no constraint; a dependency cycle is not
/// an error — the unresolved remainder is appended in original order rather
/// than panicking over a scheduling preference.
fn order_by_before_after(tests: Vec<&'static Test>) -> Vec<&'static Test> {
    let n = tests.len();
    let mut indegree = vec![0usize; n];
    let mut must_run_after: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, t) in tests.iter().enumerate() {
        if let Some(pattern) = t.record.before {
            for (j, other) in tests.iter().enumerate() {
                if i != j && pattern_matches(pattern, other.name()) {
                    must_run_after[i].push(j);
                    indegree[j] += 1;
                }
            }
        }
        if let Some(pattern) = t.record.after {
            for (j, other) in tests.iter().enumerate() {
                if i != j && pattern_matches(pattern, other.name()) {
                    must_run_after[j].push(i);
                    indegree[i] += 1;
                }
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_front() {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        order.push(i);
        for &j in &must_run_after[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.push_back(j);
            }
        }
    }
    for i in 0..n {
        if !visited[i] {
            order.push(i);
        }
    }

    order.into_iter().map(|i| tests[i]).collect()
}

/// If `test` declares `after(pattern)` and some already-scheduled test whose
/// name matches `pattern` actually failed, returns that test: `test` is then
/// "not run at all" (`test.hh:35`). Relies on `to_run` already being ordered
/// so a matching dependency's outcome is recorded by the time its dependents
/// are checked.
fn failed_after_dependency(test: &Test, to_run: &[&'static Test]) -> Option<&'static Test> {
    let pattern = test.record.after?;
    to_run
        .iter()
        .find(|&&other| {
            !std::ptr::eq(other, test) && pattern_matches(pattern, other.name()) && other.outcome().did_fail
        })
        .copied()
}

/// Numeric strings are seed-only reproduction; anything else is a trace
/// string (spec.md section 6: "numeric interpreted as seed; otherwise as a
/// trace").
fn parse_reproduction(s: &str) -> Reproduction {
    match s.parse::<u64>() {
        Ok(seed) => Reproduction::SeedOnly(seed),
        Err(_) => Reproduction::Trace(s.to_string()),
    }
}

/// Runs a single test body inside a freshly reset AssertionBus (spec.md
/// section 4.9 steps 5): binds `current_test`, silences bus output exactly
/// when the test is declared `should_fail`, and catches the assertion
/// signal at this frame unless the test is in `debug` or reproduction mode
/// (section 5: "is allowed to propagate to the debugger").
fn run_one_test(test: &'static Test, _args: &Args, _run_seed: u64, config: &Config) -> RunOutcome {
    let always_terminate = test.is_debug() || test.should_reproduce();
    assertion::reset(test.should_fail(), always_terminate);

    let start = Instant::now();
    let catch_here = !always_terminate;

    let result = registry::run_with_current_test(test, || {
        if catch_here {
            panic::catch_unwind(AssertUnwindSafe(|| (test.record.body)())).err()
        } else {
            (test.record.body)();
            None
        }
    });

    if let Some(payload) = result {
        if !assertion::is_assertion_panic(&*payload) {
            verbose_message!(config, 1, "test `{}` panicked outside the assertion bus", test.name());
            panic::resume_unwind(payload);
        }
    }

    let seconds = start.elapsed().as_secs_f64();
    let snap = assertion::snapshot();
    let outcome = RunOutcome {
        did_fail: snap.did_fail(),
        num_checks: snap.num_checks,
        num_failed_checks: snap.num_failed_checks,
        first_fail_info: snap.first_failure.map(|f| (f.file, f.line, f.message)),
        seconds,
    };

    test.record_outcome(crate::registry::TestOutcome {
        did_fail: outcome.did_fail,
        num_checks: outcome.num_checks,
        num_failed_checks: outcome.num_failed_checks,
        first_fail_info: outcome.first_fail_info.clone(),
        execution_timestamp: Some(unix_seconds_now()),
        execution_seconds: outcome.seconds,
    });

    outcome
}

fn outcome_to_testcase(test: &Test, outcome: &RunOutcome) -> Testcase {
    let base = Testcase {
        name: test.name().to_string(),
        assertions: outcome.num_checks,
        time: outcome.seconds,
        file: test.record.source_file.to_string(),
        line: test.record.source_line,
        status: TestcaseStatus::Passed,
    };

    if outcome.did_fail == test.should_fail() {
        return base;
    }

    if outcome.did_fail {
        // Unexpectedly failed.
        let (message, body) = outcome
            .first_fail_info
            .as_ref()
            .map(|(file, line, msg)| (msg.clone(), format!("{}:{}: {}", file, line, msg)))
            .unwrap_or_else(|| ("check failed".to_string(), String::new()));
        Testcase {
            status: TestcaseStatus::Failed { message, body },
            ..base
        }
    } else {
        // Marked should_fail but passed.
        Testcase {
            status: TestcaseStatus::Failed {
                message: "test was marked should_fail but did not fail".to_string(),
                body: String::new(),
            },
            ..base
        }
    }
}

/// Spec.md section 4.9 step 6: one line per test whose outcome diverged
/// from its expectation. `ran` excludes tests skipped via the after-dependency
/// gate — a skipped test never updated its `TestOutcome`, so comparing its
/// stale default against `should_fail()` would misreport it.
fn print_summary(ran: &[&Test], run_seed: u64) {
    let mut unexpected = 0;
    for test in ran {
        let outcome = test.outcome();
        if outcome.did_fail == test.should_fail() {
            continue;
        }
        unexpected += 1;
        let repr = match test.reproduction() {
            Reproduction::Trace(s) => format!(", repr = {}", s),
            Reproduction::SeedOnly(s) => format!(", repr = {}", s),
            Reproduction::None => String::new(),
        };
        eprintln!(
            "FAIL {} (seed = {}{})",
            test.name(),
            test.seed(),
            repr
        );
    }
    if unexpected == 0 {
        println!("nexus: all tests passed (run_seed = {})", run_seed);
    } else {
        println!("nexus: {} test(s) failed unexpectedly", unexpected);
    }
}

fn unix_seconds_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// `hash(high_resolution_clock_now())` (spec.md section 4.9 step 4):
/// nothing downstream depends on any property of this hash beyond
/// "changes between runs", so a `TestRng` seeded from entropy stands in for
/// the source's high-resolution clock sample.
fn hash_clock_now() -> u64 {
    use rand::RngCore as _;
    TestRng::from_entropy().next_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matches_literal_and_wildcard() {
        assert!(pattern_matches("foo", "foo"));
        assert!(!pattern_matches("foo", "foobar"));
        assert!(pattern_matches("foo*", "foobar"));
        assert!(pattern_matches("*bar", "foobar"));
        assert!(pattern_matches("*", "anything"));
        assert!(!pattern_matches("foo*baz", "foobar"));
    }
}
