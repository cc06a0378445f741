//! Reading failed test runs back into something a re-prompt can use.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

const MAX_MESSAGES: usize = 10;
const MAX_FAILED_TESTS: usize = 10;
const MAX_MESSAGE_CHARS: usize = 300;

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:E\s+)?((?:\w+(?:Error|Exception)\b:?.*)|(?:error(?:\[E\d+\])?:.*)|(?:.*panicked at.*))$")
        .expect("ERROR_LINE_RE regex should compile")
});

static FAILED_TEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:FAILED (\S+)(?: - .*)?|test (\S+) \.\.\. FAILED|\s*✕ (.+?)(?: \(\d+ ms\))?)\s*$")
        .expect("FAILED_TEST_RE regex should compile")
});

/// Broad class of a test failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Import,
    Syntax,
    Indentation,
    UndefinedName,
    Attribute,
    Type,
    FileNotFound,
    Assertion,
    Unknown,
}

impl FailureCategory {
    /// Classifies one error message.
    pub fn of(message: &str) -> Self {
        let m = message.to_lowercase();
        if m.contains("import") || m.contains("module") || m.contains("unresolved") {
            FailureCategory::Import
        } else if m.contains("indentation") {
            FailureCategory::Indentation
        } else if m.contains("syntax") || m.contains("unexpected token") {
            FailureCategory::Syntax
        } else if (m.contains("name") && m.contains("not defined")) || m.contains("cannot find") || m.contains("is not defined") {
            FailureCategory::UndefinedName
        } else if m.contains("attribute") || m.contains("no method named") {
            FailureCategory::Attribute
        } else if m.contains("file") && (m.contains("not found") || m.contains("no such")) {
            FailureCategory::FileNotFound
        } else if m.contains("type") {
            FailureCategory::Type
        } else if m.contains("assert") {
            FailureCategory::Assertion
        } else {
            FailureCategory::Unknown
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureCategory::Import => "import_error",
            FailureCategory::Syntax => "syntax_error",
            FailureCategory::Indentation => "indentation_error",
            FailureCategory::UndefinedName => "undefined_name",
            FailureCategory::Attribute => "attribute_error",
            FailureCategory::Type => "type_error",
            FailureCategory::FileNotFound => "file_not_found",
            FailureCategory::Assertion => "assertion_failure",
            FailureCategory::Unknown => "unknown_error",
        };
        f.write_str(s)
    }
}

/// What went wrong in a candidate's test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureAnalysis {
    /// Distinct categories, in order of first appearance.
    pub categories: Vec<FailureCategory>,
    pub root_cause: String,
    pub messages: Vec<String>,
    pub failed_tests: Vec<String>,
}

impl FailureAnalysis {
    /// Extracts error lines and failing test names from raw test output.
    pub fn from_log(log: &str) -> Self {
        let mut messages: Vec<String> = Vec::new();
        for caps in ERROR_LINE_RE.captures_iter(log) {
            let Some(line) = caps.get(1).map(|m| m.as_str().trim()) else {
                continue;
            };
            let line: String = line.chars().take(MAX_MESSAGE_CHARS).collect();
            if !messages.contains(&line) {
                messages.push(line);
            }
            if messages.len() == MAX_MESSAGES {
                break;
            }
        }

        let mut failed_tests: Vec<String> = Vec::new();
        for caps in FAILED_TEST_RE.captures_iter(log) {
            let name = (1..=3).find_map(|i| caps.get(i)).map(|m| m.as_str().trim().to_string());
            if let Some(name) = name {
                if !failed_tests.contains(&name) {
                    failed_tests.push(name);
                }
            }
            if failed_tests.len() == MAX_FAILED_TESTS {
                break;
            }
        }

        Self::build(messages, failed_tests)
    }

    /// Analysis of a single failure message, such as a preflight rejection.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self::build(vec![message.into()], Vec::new())
    }

    /// Prepends a note that did not come from the log, such as a timeout.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.messages.insert(0, note.into());
        self.messages.truncate(MAX_MESSAGES);
        Self::build(self.messages, self.failed_tests)
    }

    fn build(messages: Vec<String>, failed_tests: Vec<String>) -> Self {
        let mut categories = Vec::new();
        for category in messages.iter().map(|m| FailureCategory::of(m)) {
            if !categories.contains(&category) {
                categories.push(category);
            }
        }
        if categories.is_empty() {
            categories.push(FailureCategory::Unknown);
        }

        Self {
            root_cause: root_cause(&categories).to_string(),
            categories,
            messages,
            failed_tests,
        }
    }
}

fn root_cause(categories: &[FailureCategory]) -> &'static str {
    let has = |c: FailureCategory| categories.contains(&c);
    if has(FailureCategory::Import) {
        "Missing or incorrect imports"
    } else if has(FailureCategory::Syntax) || has(FailureCategory::Indentation) {
        "Code syntax issues"
    } else if has(FailureCategory::FileNotFound) {
        "File path or structure issues"
    } else if has(FailureCategory::UndefinedName) {
        "Variable or function not defined"
    } else if has(FailureCategory::Type) || has(FailureCategory::Attribute) {
        "Type mismatch or incorrect object usage"
    } else if has(FailureCategory::Assertion) {
        "Behaviour does not match what the tests expect"
    } else {
        "Unknown issue - requires manual investigation"
    }
}
