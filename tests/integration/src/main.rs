//! Runs the integration suites one after another
//!
//! Each suite is a separate `cargo test` target. Its output streams
//! straight through and `RUST_LOG` is passed on unchanged.
//!
//! ```text
//! cargo run -p integration-tests                       every suite
//! cargo run -p integration-tests -- adapter stress     suites by prefix
//! cargo run -p integration-tests -- --list
//! cargo run -p integration-tests -- --fail-fast --release
//! ```

use std::process::{Command, ExitCode};
use std::time::{Duration, Instant};

use clap::Parser;

/// Test target and what it covers
struct Suite {
    target: &'static str,
    covers: &'static str,
}

const SUITES: &[Suite] = &[
    Suite {
        target: "adapter_tests",
        covers: "activation races, deferred etherealization, manager states",
    },
    Suite {
        target: "dispatch_tests",
        covers: "key routing, forward tables, upcall context",
    },
    Suite {
        target: "invocation_tests",
        covers: "retry policy, forwards, deferred requests, pending set",
    },
    Suite {
        target: "stress_tests",
        covers: "many clients, activation churn, hold toggling, deferred storms",
    },
];

#[derive(Parser, Debug)]
#[command(name = "integration-tests", about = "Run the ORB integration suites")]
struct Args {
    /// Suites to run, matched by prefix; all when empty
    suites: Vec<String>,

    /// Print the suites and exit
    #[arg(long)]
    list: bool,

    /// Stop after the first failing suite
    #[arg(long)]
    fail_fast: bool,

    /// Build the suites in release mode
    #[arg(long)]
    release: bool,
}

struct SuiteRun {
    target: &'static str,
    passed: bool,
    elapsed: Duration,
}

/// Suites whose target starts with one of `filters`
fn select<'a>(suites: &'a [Suite], filters: &[String]) -> Vec<&'a Suite> {
    suites
        .iter()
        .filter(|s| filters.is_empty() || filters.iter().any(|f| s.target.starts_with(f.as_str())))
        .collect()
}

fn run(suite: &Suite, release: bool) -> SuiteRun {
    println!("==> {} ({})", suite.target, suite.covers);
    let mut cargo = Command::new("cargo");
    cargo.args(["test", "-p", "integration-tests", "--test", suite.target]);
    if release {
        cargo.arg("--release");
    }

    let started = Instant::now();
    let passed = match cargo.status() {
        Ok(status) => status.success(),
        Err(e) => {
            eprintln!("cannot run cargo for {}: {}", suite.target, e);
            false
        }
    };
    SuiteRun {
        target: suite.target,
        passed,
        elapsed: started.elapsed(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.list {
        for suite in SUITES {
            println!("{:<18} {}", suite.target, suite.covers);
        }
        return ExitCode::SUCCESS;
    }

    let suites = select(SUITES, &args.suites);
    if suites.is_empty() {
        eprintln!("no suite matches {:?}", args.suites);
        return ExitCode::from(2);
    }

    let mut runs = Vec::with_capacity(suites.len());
    for suite in suites {
        let outcome = run(suite, args.release);
        let failed = !outcome.passed;
        runs.push(outcome);
        if failed && args.fail_fast {
            break;
        }
    }

    println!();
    for r in &runs {
        println!(
            "{} {:<18} {:.1}s",
            if r.passed { "ok  " } else { "FAIL" },
            r.target,
            r.elapsed.as_secs_f64()
        );
    }

    if runs.iter().all(|r| r.passed) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(filters: &[&str]) -> Vec<&'static str> {
        let filters: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
        select(SUITES, &filters).iter().map(|s| s.target).collect()
    }

    #[test]
    fn test_select_by_prefix() {
        assert_eq!(targets(&[]).len(), SUITES.len());
        assert_eq!(targets(&["adapter"]), vec!["adapter_tests"]);
        assert_eq!(
            targets(&["stress", "dispatch_tests"]),
            vec!["dispatch_tests", "stress_tests"]
        );
        assert!(targets(&["nothing"]).is_empty());
    }

    #[test]
    fn test_args() {
        let args = Args::parse_from(["integration-tests", "--fail-fast", "invocation"]);
        assert!(args.fail_fast);
        assert!(!args.list);
        assert_eq!(args.suites, vec!["invocation"]);
    }
}
