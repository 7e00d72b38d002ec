//! Execution protocol.
//!
//! All commands of a test file run in one shell. After every command the
//! script echoes a banner carrying `$?`, so the combined output can be split
//! back into per-command output and exit codes afterwards.

use crate::env::Environment;
use crate::escape::{NO_EOL_SUFFIX, escape_bytes};
use crate::parser::Command;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command as Process, ExitStatus, Stdio};
use std::thread;
use thiserror::Error;
use uuid::Uuid;

/// Text echoed in front of the exit status on every banner line.
const BANNER_MARKER: &str = "--- CRAM ";

/// A command together with what it actually did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedCommand {
    /// The command responsible for the output.
    pub command: Command,
    /// Output read from stdout and stderr, normalized.
    pub actual_output: Vec<String>,
    pub actual_exit_code: i32,
}

/// The shell output could not be matched up with the commands.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("banner line has no valid exit code: {line:?}")]
    BadExitCode { line: String },
    #[error("expected results for {expected} commands, got {actual}")]
    CommandCountMismatch { expected: usize, actual: usize },
}

/// Turn a UUID into a banner we can recognize later in the output.
pub fn make_banner(id: Uuid) -> String {
    format!("{id} ---")
}

/// A fresh banner for one run.
pub fn new_banner() -> String {
    make_banner(Uuid::new_v4())
}

/// Produce the script lines sent to the shell.
///
/// Each command is followed by an `echo` of the banner and `$?`. A command
/// on the last line of a file without a final newline gets one.
pub fn make_script(cmds: &[Command], banner: &str) -> Vec<String> {
    let echo = format!("echo \"{BANNER_MARKER}$? {banner}\"\n");
    cmds.iter()
        .flat_map(|cmd| {
            let mut line = cmd.cmd_line.clone();
            if !line.ends_with('\n') {
                line.push('\n');
            }
            [line, echo.clone()]
        })
        .collect()
}

/// Split the combined shell output into one [`ExecutedCommand`] per command.
///
/// Output lines are escaped with [`escape_bytes`]. Output that does not end
/// in a newline shows up in front of the banner; it is kept as a line
/// marked with `" (no-eol)"`.
pub fn split_output(
    cmds: &[Command],
    output: &[u8],
    banner: &str,
) -> Result<Vec<ExecutedCommand>, ProtocolError> {
    let banner_suffix = format!(" {banner}\n");
    let mut executed = Vec::with_capacity(cmds.len());
    let mut actual_output = Vec::new();

    for line in output.split_inclusive(|&b| b == b'\n') {
        let Some(head) = line.strip_suffix(banner_suffix.as_bytes()) else {
            actual_output.push(escape_bytes(line));
            continue;
        };

        // `head` now looks like "...--- CRAM NN", where "..." can be empty.
        let bad_line = || ProtocolError::BadExitCode {
            line: String::from_utf8_lossy(line).into_owned(),
        };
        let marker = find_last(head, BANNER_MARKER.as_bytes()).ok_or_else(bad_line)?;
        let (prefix, status) = (&head[..marker], &head[marker + BANNER_MARKER.len()..]);
        let exit_code = std::str::from_utf8(status)
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .ok_or_else(bad_line)?;

        if !prefix.is_empty() {
            let mut line = prefix.to_vec();
            line.extend_from_slice(NO_EOL_SUFFIX.as_bytes());
            line.push(b'\n');
            actual_output.push(escape_bytes(&line));
        }

        let Some(command) = cmds.get(executed.len()) else {
            return Err(ProtocolError::CommandCountMismatch {
                expected: cmds.len(),
                actual: executed.len() + 1,
            });
        };
        executed.push(ExecutedCommand {
            command: command.clone(),
            actual_output: std::mem::take(&mut actual_output),
            actual_exit_code: exit_code,
        });
    }

    if executed.len() != cmds.len() {
        return Err(ProtocolError::CommandCountMismatch {
            expected: cmds.len(),
            actual: executed.len(),
        });
    }
    Ok(executed)
}

fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

/// Run `lines` as a script in `workdir` and return stdout and stderr
/// interleaved in the order they were written.
///
/// The exit status of the shell itself is not reported; a shell that stops
/// early shows up as missing banners.
pub fn execute_script(
    shell: &Path,
    workdir: &Path,
    env: &Environment,
    lines: &[String],
) -> io::Result<Vec<u8>> {
    let script = lines.concat();
    let (mut reader, writer) = io::pipe()?;

    let mut child = Process::new(shell)
        .arg("-")
        .current_dir(workdir)
        .env_clear()
        .envs(env.iter())
        .stdin(Stdio::piped())
        .stdout(writer.try_clone()?)
        .stderr(writer)
        .spawn()?;

    let mut output = Vec::new();
    let communicated = match child.stdin.take() {
        Some(mut stdin) => thread::scope(|s| {
            let feeder = s.spawn(move || match stdin.write_all(script.as_bytes()) {
                // The shell may exit before reading the whole script.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                result => result,
            });
            let read = reader.read_to_end(&mut output);
            let fed = feeder
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("script writer panicked")));
            read.and(fed)
        }),
        None => Err(io::Error::other("shell has no stdin")),
    };
    let status = reap(&mut child, communicated)?;
    tracing::debug!(workdir = %workdir.display(), %status, bytes = output.len(), "shell finished");
    Ok(output)
}

/// Wait for the shell. If talking to it failed, kill it first so it is not
/// left running, and return that error.
fn reap(child: &mut Child, communicated: io::Result<()>) -> io::Result<ExitStatus> {
    if let Err(e) = communicated {
        let _ = child.kill();
        let _ = child.wait();
        return Err(e);
    }
    child.wait()
}
