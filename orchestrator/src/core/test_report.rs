//! Pass/fail counts from test tool output.
//!
//! Exit status is advisory; the counts read here decide a verification result.
//! Parsers are tried in a fixed order and the first that recognizes its
//! summary line wins.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
}

impl TestCounts {
    pub fn attempted(&self) -> u32 {
        self.passed + self.failed
    }
}

type Parser = fn(&str) -> Option<TestCounts>;

const PARSERS: &[(&str, Parser)] = &[
    ("jest", parse_jest),
    ("vitest", parse_vitest),
    ("pytest", parse_pytest),
    ("node_test", parse_node_test),
    ("mocha", parse_mocha),
    ("cargo", parse_cargo),
    ("go", parse_go),
];

/// Counts from the first recognized summary, with the parser name.
pub fn parse_test_counts(output: &str) -> Option<(&'static str, TestCounts)> {
    PARSERS
        .iter()
        .find_map(|(name, parser)| parser(output).map(|counts| (*name, counts)))
}

static COUNT_PAIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s+(passed|failed|errors?|error)\b").expect("count pair regex")
});

fn pairs(summary: &str) -> Option<TestCounts> {
    let mut counts = TestCounts::default();
    let mut seen = false;
    for caps in COUNT_PAIR_RE.captures_iter(summary) {
        let n: u32 = caps[1].parse().unwrap_or(0);
        seen = true;
        match &caps[2] {
            "passed" => counts.passed += n,
            _ => counts.failed += n,
        }
    }
    seen.then_some(counts)
}

static JEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Tests:\s+(.+)$").expect("jest regex"));

/// `Tests:       1 failed, 4 passed, 5 total`
fn parse_jest(output: &str) -> Option<TestCounts> {
    JEST_RE
        .captures_iter(output)
        .last()
        .and_then(|caps| pairs(&caps[1]))
}

static VITEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Tests\s+(.+\(\d+\))\s*$").expect("vitest regex"));

/// ` Tests  1 failed | 4 passed (5)`
fn parse_vitest(output: &str) -> Option<TestCounts> {
    VITEST_RE
        .captures_iter(output)
        .last()
        .and_then(|caps| pairs(&caps[1]))
}

static PYTEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^=+ (.*\b(?:passed|failed|error|errors)\b.*) in [\d.]+s.*=+$")
        .expect("pytest regex")
});

/// `===== 1 failed, 4 passed in 0.12s =====`
fn parse_pytest(output: &str) -> Option<TestCounts> {
    PYTEST_RE
        .captures_iter(output)
        .last()
        .and_then(|caps| pairs(&caps[1]))
}

static NODE_TEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:#|\u{2139})\s*(pass|fail)\s+(\d+)\s*$").expect("node test regex")
});

/// TAP (`# pass 4`) or spec reporter (`ℹ pass 4`) summaries from `node --test`.
fn parse_node_test(output: &str) -> Option<TestCounts> {
    let mut counts = TestCounts::default();
    let mut seen = false;
    for caps in NODE_TEST_RE.captures_iter(output) {
        let n: u32 = caps[2].parse().unwrap_or(0);
        seen = true;
        if &caps[1] == "pass" {
            counts.passed = n;
        } else {
            counts.failed = n;
        }
    }
    seen.then_some(counts)
}

static MOCHA_PASSING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+) passing\b").expect("mocha passing regex"));
static MOCHA_FAILING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+) failing\b").expect("mocha failing regex"));

fn parse_mocha(output: &str) -> Option<TestCounts> {
    let passed = MOCHA_PASSING_RE
        .captures(output)
        .and_then(|caps| caps[1].parse().ok());
    let failed = MOCHA_FAILING_RE
        .captures(output)
        .and_then(|caps| caps[1].parse().ok());
    if passed.is_none() && failed.is_none() {
        return None;
    }
    Some(TestCounts {
        passed: passed.unwrap_or(0),
        failed: failed.unwrap_or(0),
    })
}

static CARGO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed").expect("cargo regex")
});

/// Sums every `test result:` line (one per test binary).
fn parse_cargo(output: &str) -> Option<TestCounts> {
    let mut counts = TestCounts::default();
    let mut seen = false;
    for caps in CARGO_RE.captures_iter(output) {
        seen = true;
        counts.passed += caps[1].parse::<u32>().unwrap_or(0);
        counts.failed += caps[2].parse::<u32>().unwrap_or(0);
    }
    seen.then_some(counts)
}

static GO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*--- (PASS|FAIL): ").expect("go regex"));

/// `go test -v` per-test lines.
fn parse_go(output: &str) -> Option<TestCounts> {
    let mut counts = TestCounts::default();
    let mut seen = false;
    for caps in GO_RE.captures_iter(output) {
        seen = true;
        if &caps[1] == "PASS" {
            counts.passed += 1;
        } else {
            counts.failed += 1;
        }
    }
    seen.then_some(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(output: &str) -> (&'static str, u32, u32) {
        let (name, counts) = parse_test_counts(output).expect("counts");
        (name, counts.passed, counts.failed)
    }

    #[test]
    fn jest_summary() {
        let out = "PASS tests/a.test.js\nFAIL tests/b.test.js\nTests:       1 failed, 4 passed, 5 total\nTime: 1s\n";
        assert_eq!(counts(out), ("jest", 4, 1));
    }

    #[test]
    fn vitest_summary() {
        let out = " Test Files  1 passed (1)\n      Tests  2 failed | 3 passed (5)\n";
        assert_eq!(counts(out), ("vitest", 3, 2));
    }

    #[test]
    fn pytest_summary_counts_errors_as_failures() {
        let out = "tests/test_a.py ..F\n========= 1 failed, 2 passed, 1 error in 0.31s =========\n";
        assert_eq!(counts(out), ("pytest", 2, 2));
    }

    #[test]
    fn node_test_tap_and_spec() {
        let tap = "TAP version 13\n# tests 3\n# suites 0\n# pass 2\n# fail 1\n";
        assert_eq!(counts(tap), ("node_test", 2, 1));
        let spec = "\u{2139} tests 2\n\u{2139} pass 2\n\u{2139} fail 0\n";
        assert_eq!(counts(spec), ("node_test", 2, 0));
    }

    #[test]
    fn mocha_cargo_and_go() {
        assert_eq!(counts("  3 passing (20ms)\n  1 failing\n"), ("mocha", 3, 1));
        let cargo = "test result: ok. 3 passed; 0 failed; 0 ignored\ntest result: FAILED. 1 passed; 2 failed; 0 ignored\n";
        assert_eq!(counts(cargo), ("cargo", 4, 2));
        let go = "=== RUN   TestA\n--- PASS: TestA (0.00s)\n=== RUN   TestB\n--- FAIL: TestB (0.00s)\nFAIL\n";
        assert_eq!(counts(go), ("go", 1, 1));
    }

    #[test]
    fn unrecognized_output_has_no_counts() {
        assert_eq!(parse_test_counts("command not found: pytest"), None);
        assert_eq!(parse_test_counts(""), None);
    }
}
