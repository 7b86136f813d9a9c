//! End-to-end Runner scenarios from spec.md section 8 (S1-S3): a whole test
//! binary's worth of registered tests, run through `nexus::runner::run`
//! exactly as a real binary's `main` would, checked against the recorded
//! outcome rather than against the process exit code.

use nexus::cli::Args;
use nexus::registry;

#[nexus::test]
fn t1() {
    nexus::CHECK!(1 + 1 == 2);
}

#[nexus::test]
fn t2() {
    nexus::CHECK!(2 == 3);
}

#[nexus::test(should_fail)]
fn t3() {
    nexus::CHECK!(false);
}

#[nexus::test]
fn dep_fail() {
    nexus::CHECK!(false);
}

#[nexus::test(after = "dep_fail")]
fn gated() {
    nexus::CHECK!(1 + 1 == 2);
}

#[nexus::test]
fn dep_fail_2() {
    nexus::CHECK!(false);
}

#[nexus::test(after = "dep_fail_2", should_fail)]
fn gated_should_fail() {
    nexus::CHECK!(false);
}

fn args_for(names: &[&str]) -> Args {
    Args {
        endless: false,
        repr: None,
        xml: None,
        groups: Vec::new(),
        list: false,
        names: names.iter().map(|s| s.to_string()).collect(),
    }
}

#[test]
fn s1_basic_check_pass() {
    let code = nexus::runner::run(&args_for(&["t1"]));
    let test = registry::find_test("t1").expect("t1 registered");
    let outcome = test.outcome();
    assert_eq!(outcome.num_checks, 1);
    assert_eq!(outcome.num_failed_checks, 0);
    assert!(!outcome.did_fail);
    assert_eq!(code, 0);
}

#[test]
fn s2_basic_check_fail() {
    let code = nexus::runner::run(&args_for(&["t2"]));
    let test = registry::find_test("t2").expect("t2 registered");
    let outcome = test.outcome();
    assert!(outcome.did_fail);
    assert_eq!(outcome.num_failed_checks, 1);
    let (_, _, message) = outcome.first_fail_info.expect("failure recorded");
    assert!(message.contains("lhs: 2"));
    assert!(message.contains("rhs: 3"));
    assert_eq!(code, 1);
}

#[test]
fn s3_should_fail_counts_as_passing() {
    let code = nexus::runner::run(&args_for(&["t3"]));
    let test = registry::find_test("t3").expect("t3 registered");
    let outcome = test.outcome();
    assert!(outcome.did_fail);
    assert_eq!(outcome.num_failed_checks, 1);
    assert_eq!(code, 0);
}

/// `gated` declares `after = "dep_fail"`; since `dep_fail` fails, `gated`
/// must not run at all (`examples/original_source/src/nexus/test.hh:35`).
#[test]
fn after_dependency_failure_skips_the_gated_test() {
    nexus::runner::run(&args_for(&["dep_fail", "gated"]));
    let dep = registry::find_test("dep_fail").expect("dep_fail registered");
    assert!(dep.outcome().did_fail);

    let gated = registry::find_test("gated").expect("gated registered");
    let outcome = gated.outcome();
    assert_eq!(outcome.num_checks, 0, "gated's body must never have executed");
    assert!(!outcome.did_fail);
}

/// A `should_fail` test skipped by a failed `after`-dependency must not be
/// reported as an unexpected failure: it never ran, so its `TestOutcome`
/// stays at the default `did_fail = false`, which would wrongly look like a
/// passing-when-it-should-fail test if compared against `should_fail()`.
#[test]
fn after_dependency_failure_skips_a_should_fail_test_without_exit_failure() {
    let code = nexus::runner::run(&args_for(&["dep_fail_2", "gated_should_fail"]));
    assert_eq!(code, 1, "dep_fail_2 itself still fails unexpectedly");

    let gated = registry::find_test("gated_should_fail")
        .expect("gated_should_fail registered");
    let outcome = gated.outcome();
    assert_eq!(outcome.num_checks, 0, "gated_should_fail's body must never have executed");
}
