//! Output comparison.
//!
//! Expected output lines may end with a suffix that changes how they are
//! compared to the actual output: ` (re)` for a regular expression,
//! ` (glob)` for a glob pattern and ` (esc)` for escaped text.

use crate::escape::{ESC_SUFFIX, GLOB_SUFFIX, RE_SUFFIX, drop_eol, escape_bytes, unescape_bytes};
use crate::script::ExecutedCommand;
use regex::Regex;

/// How a single expected output line is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMatcher<'a> {
    /// Only an exact match is accepted.
    Literal,
    /// The pattern must match the whole actual line.
    Regex(&'a str),
    /// Glob pattern where `*` also matches `/`.
    Glob(&'a str),
    /// Escaped text, compared after normalizing the escapes.
    Escaped(&'a str),
}

impl<'a> LineMatcher<'a> {
    /// Pick the matcher for an expected line without its line ending.
    pub fn classify(expected: &'a str) -> Self {
        if let Some(pattern) = expected.strip_suffix(RE_SUFFIX) {
            LineMatcher::Regex(pattern)
        } else if let Some(pattern) = expected.strip_suffix(GLOB_SUFFIX) {
            LineMatcher::Glob(pattern)
        } else if expected.ends_with(ESC_SUFFIX) {
            LineMatcher::Escaped(expected)
        } else {
            LineMatcher::Literal
        }
    }

    /// Whether `actual` (without its line ending) is accepted.
    pub fn matches(self, actual: &str) -> bool {
        match self {
            LineMatcher::Literal => false,
            LineMatcher::Regex(pattern) => match_entire_line(pattern, actual),
            LineMatcher::Glob(pattern) => match_entire_line(&glob_to_regex(pattern), actual),
            // The same text can be escaped in several ways: both "x (esc)"
            // and "\x78 (esc)" mean "x". Re-escaping the decoded text gives
            // the form the actual output was normalized to.
            LineMatcher::Escaped(expected) => {
                unescape_bytes(expected).is_ok_and(|decoded| escape_bytes(&decoded) == actual)
            }
        }
    }
}

/// True when `pattern` compiles and matches all of `line`.
pub fn match_entire_line(pattern: &str, line: &str) -> bool {
    Regex::new(&format!("^(?:{pattern})$")).is_ok_and(|re| re.is_match(line))
}

/// Translate a glob pattern into a regular expression.
///
/// `*` matches any run of characters including path separators, `?` matches
/// one character and a backslash makes the next character literal. A
/// trailing backslash is dropped.
pub fn glob_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '?' => re.push('.'),
            '*' => re.push_str(".*"),
            '\\' => {
                let Some(literal) = chars.next() else {
                    break;
                };
                push_literal(&mut re, literal);
            }
            c => push_literal(&mut re, c),
        }
    }
    re
}

fn push_literal(re: &mut String, c: char) {
    if r"\.+*?()|[]{}^$".contains(c) {
        re.push('\\');
    }
    re.push(c);
}

impl ExecutedCommand {
    /// Whether the exit code or output differed from what was expected.
    pub fn failed(&self) -> bool {
        if self.actual_exit_code != self.command.expected_exit_code {
            return true;
        }
        if self.actual_output.len() != self.command.expected_output.len() {
            return true;
        }
        self.actual_output
            .iter()
            .zip(&self.command.expected_output)
            .any(|(actual, expected)| !line_matches(actual, expected))
    }
}

fn line_matches(actual: &str, expected: &str) -> bool {
    // An exact match is always accepted, even if the line ends with a
    // suffix such as " (re)".
    if actual == expected {
        return true;
    }
    LineMatcher::classify(drop_eol(expected)).matches(drop_eol(actual))
}
