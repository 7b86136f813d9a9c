//! The CLI collaborator (spec.md section 6): parses argv into the fields
//! the Runner consumes, via `clap`'s derive API.

use clap::Parser;

/// Nexus test binary arguments.
#[derive(Parser, Debug)]
#[clap(about = "A nexus test/app binary.")]
pub struct Args {
    /// Run all fuzz/MCT tests in endless mode (never stop on a budget).
    #[clap(long)]
    pub endless: bool,

    /// Force reproduction from a stored seed (decimal `u64`) or trace
    /// string, applied to every selected test.
    #[clap(long, value_name = "SEED_OR_TRACE")]
    pub repr: Option<String>,

    /// Write a JUnit-compatible XML report to this path.
    #[clap(long, value_name = "PATH")]
    pub xml: Option<String>,

    /// Only run tests whose `opt_in_group` is one of these (repeatable).
    #[clap(long = "group", value_name = "NAME")]
    pub groups: Vec<String>,

    /// List every registered test and app, then exit without running
    /// anything.
    #[clap(long, short = 'l')]
    pub list: bool,

    /// Test or app names to run; multiple names are OR'ed together. Any
    /// app name present here short-circuits normal test selection (spec.md
    /// section 4.9 step 2).
    pub names: Vec<String>,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }
}
