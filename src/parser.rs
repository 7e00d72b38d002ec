//! Test file parser.
//!
//! A test file is plain text. Indented lines hold shell commands and their
//! expected output; every other line is commentary:
//!
//! ```text
//! Commentary.
//!
//!   $ echo hello; false
//!   hello
//!   [1]
//! ```

use crate::escape::drop_eol;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const COMMAND_PREFIX: &str = "  $ ";
pub const CONTINUATION_PREFIX: &str = "  > ";
pub const OUTPUT_PREFIX: &str = "  ";

/// A single shell command with its expected output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Command {
    /// Command line passed to the shell, including continuation lines.
    pub cmd_line: String,
    /// Expected output lines, each with its own line ending.
    pub expected_output: Vec<String>,
    /// Expected exit code, taken from a trailing `[N]` line.
    pub expected_exit_code: i32,
    /// Number of file lines before the first expected output line.
    ///
    /// This is also the 1-based line number of the last command line and
    /// the 0-based index of the first output line, which is what the patch
    /// engine needs.
    pub line_number: usize,
}

/// A parsed test file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Test {
    pub path: PathBuf,
    pub cmds: Vec<Command>,
}

/// A structural error in a test file.
///
/// The commands parsed before the error are kept in `partial`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}:{lineno}: {msg}", .path.display())]
pub struct InvalidTestError {
    pub path: PathBuf,
    /// 1-based line of the offending line.
    pub lineno: usize,
    pub msg: String,
    pub partial: Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Commentary,
    InCommand,
    InOutput,
}

/// Split `input` into commands.
pub fn parse_test(input: &str, path: &Path) -> Result<Test, InvalidTestError> {
    let mut test = Test {
        path: path.to_path_buf(),
        cmds: Vec::new(),
    };
    let mut state = State::Commentary;

    for (index, line) in input.split_inclusive('\n').enumerate() {
        if let Some(cmd_line) = line.strip_prefix(COMMAND_PREFIX) {
            if state == State::InOutput {
                close_output(&mut test);
            }
            test.cmds.push(Command {
                cmd_line: cmd_line.to_string(),
                line_number: index + 1,
                ..Command::default()
            });
            state = State::InCommand;
        } else if let Some(continuation) = line.strip_prefix(CONTINUATION_PREFIX) {
            let cmd = match (state, test.cmds.last_mut()) {
                (State::InCommand, Some(cmd)) => cmd,
                _ => {
                    let msg = format!("Continuation line {line:?} has no command");
                    return Err(invalid(test, index, msg));
                }
            };
            cmd.cmd_line.push_str(continuation);
            cmd.line_number += 1;
        } else if let Some(output) = line.strip_prefix(OUTPUT_PREFIX) {
            let cmd = match (state, test.cmds.last_mut()) {
                (State::InCommand | State::InOutput, Some(cmd)) => cmd,
                _ => {
                    let msg = format!("Output line {line:?} has no command");
                    return Err(invalid(test, index, msg));
                }
            };
            cmd.expected_output.push(output.to_string());
            state = State::InOutput;
        } else {
            if state == State::InOutput {
                close_output(&mut test);
            }
            state = State::Commentary;
        }
    }

    if state == State::InOutput {
        close_output(&mut test);
    }
    Ok(test)
}

fn invalid(test: Test, index: usize, msg: String) -> InvalidTestError {
    InvalidTestError {
        path: test.path.clone(),
        lineno: index + 1,
        msg,
        partial: test,
    }
}

/// Move a trailing `[N]` output line into the expected exit code.
fn close_output(test: &mut Test) {
    let Some(cmd) = test.cmds.last_mut() else {
        return;
    };
    let Some(last) = cmd.expected_output.last() else {
        return;
    };
    let code = drop_eol(last)
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|digits| digits.parse::<i32>().ok());
    if let Some(code) = code {
        cmd.expected_output.pop();
        cmd.expected_exit_code = code;
    }
}
