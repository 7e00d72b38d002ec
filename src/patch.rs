//! Rewriting test files with new output.
//!
//! Only the expected output (and exit code line) of the given commands is
//! replaced. Every other line of the file is copied through unchanged.

use crate::escape::NO_EOL_SUFFIX;
use crate::parser::OUTPUT_PREFIX;
use crate::script::ExecutedCommand;
use std::fs;
use std::path::{Path, PathBuf};

/// Replace the expected output of `cmds` in `original` with their actual output.
pub fn patch(original: &str, cmds: &[ExecutedCommand]) -> String {
    let lines: Vec<&str> = original.split_inclusive('\n').collect();

    let mut cmds: Vec<&ExecutedCommand> = cmds.iter().collect();
    cmds.sort_by_key(|cmd| cmd.command.line_number);

    let mut output = String::with_capacity(original.len());
    let mut cursor = 0;

    for cmd in cmds {
        let start = cmd.command.line_number.clamp(cursor, lines.len());
        for line in &lines[cursor..start] {
            output.push_str(line);
        }
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }

        for line in &cmd.actual_output {
            output.push_str(OUTPUT_PREFIX);
            output.push_str(line);
            if !line.ends_with('\n') {
                output.push_str(NO_EOL_SUFFIX);
                output.push('\n');
            }
        }
        cursor = (start + cmd.command.expected_output.len()).min(lines.len());

        if cmd.actual_exit_code != cmd.command.expected_exit_code {
            // [0] is implied.
            if cmd.actual_exit_code != 0 {
                output.push_str(&format!("{OUTPUT_PREFIX}[{}]\n", cmd.actual_exit_code));
            }
            // Drop the old exit code line, if there is one. Extra text after
            // the closing bracket is tolerated.
            let old = format!("{OUTPUT_PREFIX}[{}]", cmd.command.expected_exit_code);
            if lines.get(cursor).is_some_and(|line| line.starts_with(&old)) {
                cursor += 1;
            }
        }
    }

    for line in &lines[cursor..] {
        output.push_str(line);
    }
    output
}

/// Patch the test file at `path` in place.
///
/// The result is written to a `.patched` sibling first and then renamed
/// over the original, so a failure leaves the original untouched.
pub fn patch_file(path: &Path, cmds: &[ExecutedCommand]) -> std::io::Result<()> {
    let original = fs::read_to_string(path)?;
    let patched = patch(&original, cmds);

    let mut tmp = PathBuf::from(path);
    tmp.as_mut_os_string().push(".patched");
    fs::write(&tmp, patched)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    tracing::debug!(path = %path.display(), commands = cmds.len(), "patched test file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_test;
    use proptest::prelude::*;

    /// Parse `input` and pretend command `index` produced `actual`.
    fn executed(input: &str, index: usize, actual: &[&str], exit: i32) -> ExecutedCommand {
        let test = parse_test(input, Path::new("<string>")).unwrap();
        ExecutedCommand {
            command: test.cmds[index].clone(),
            actual_output: actual.iter().map(|s| s.to_string()).collect(),
            actual_exit_code: exit,
        }
    }

    #[test]
    fn patch_nothing() {
        let input = "Intro\n  $ echo hi\n  bye\nOutro\n";
        assert_eq!(patch(input, &[]), input);
    }

    #[test]
    fn patch_replaces_output() {
        let input = "  $ echo hi\n  bye\n";
        let cmd = executed(input, 0, &["hi\n"], 0);
        assert_eq!(patch(input, &[cmd]), "  $ echo hi\n  hi\n");
    }

    #[test]
    fn patch_keeps_surrounding_lines() {
        let input = "Intro\n\n  $ echo a\n  x\n  y\n\nMiddle\n\n  $ echo b\n  b\n\nOutro";
        let cmd = executed(input, 0, &["a\n"], 0);
        assert_eq!(
            patch(input, &[cmd]),
            "Intro\n\n  $ echo a\n  a\n\nMiddle\n\n  $ echo b\n  b\n\nOutro"
        );
    }

    #[test]
    fn patch_multiple_commands_in_any_order() {
        let input = "  $ echo a\n  1\n  $ echo b\n  2\n  $ echo c\n  3\n";
        let a = executed(input, 0, &["a\n"], 0);
        let c = executed(input, 2, &["c\n", "cc\n"], 0);
        assert_eq!(
            patch(input, &[c, a]),
            "  $ echo a\n  a\n  $ echo b\n  2\n  $ echo c\n  c\n  cc\n"
        );
    }

    #[test]
    fn patch_adds_exit_code() {
        let input = "  $ false\n\nText\n";
        let cmd = executed(input, 0, &[], 1);
        assert_eq!(patch(input, &[cmd]), "  $ false\n  [1]\n\nText\n");
    }

    #[test]
    fn patch_replaces_exit_code() {
        let input = "  $ exit 1\n  out\n  [1]\nText\n";
        let cmd = executed(input, 0, &["out\n"], 2);
        assert_eq!(patch(input, &[cmd]), "  $ exit 1\n  out\n  [2]\nText\n");
    }

    #[test]
    fn patch_removes_exit_code() {
        let input = "  $ true\n  [1]\nText\n";
        let cmd = executed(input, 0, &[], 0);
        assert_eq!(patch(input, &[cmd]), "  $ true\nText\n");
    }

    #[test]
    fn patch_removes_exit_code_with_trailing_text() {
        // Only the prefix of the old exit code line is compared.
        let mut cmd = executed("  $ true\n  [1]\n", 0, &[], 0);
        cmd.command.expected_exit_code = 1;
        let input = "  $ true\n  [1]  \nText\n";
        assert_eq!(patch(input, &[cmd]), "  $ true\nText\n");
    }

    #[test]
    fn patch_keeps_exit_code_when_only_output_changes() {
        let input = "  $ echo a; false\n  b\n  [1]\n";
        let cmd = executed(input, 0, &["a\n"], 1);
        assert_eq!(patch(input, &[cmd]), "  $ echo a; false\n  a\n  [1]\n");
    }

    #[test]
    fn patch_does_not_skip_unrelated_line() {
        let input = "  $ false\n  [0] is not an exit code here\n";
        let test = parse_test(input, Path::new("<string>")).unwrap();
        assert_eq!(test.cmds[0].expected_output.len(), 1);
        let cmd = executed(input, 0, &["[0] is not an exit code here\n"], 1);
        assert_eq!(
            patch(input, &[cmd]),
            "  $ false\n  [0] is not an exit code here\n  [1]\n"
        );
    }

    #[test]
    fn patch_continuation_lines() {
        let input = "  $ echo a \\\n  > b\n  x\n";
        let cmd = executed(input, 0, &["a b\n"], 0);
        assert_eq!(patch(input, &[cmd]), "  $ echo a \\\n  > b\n  a b\n");
    }

    #[test]
    fn patch_command_without_final_newline() {
        let input = "  $ echo hi";
        let cmd = executed(input, 0, &["hi\n"], 0);
        assert_eq!(patch(input, &[cmd]), "  $ echo hi\n  hi\n");
    }

    #[test]
    fn patch_marks_missing_eol() {
        let input = "  $ printf hi\n";
        let cmd = executed(input, 0, &["hi"], 0);
        assert_eq!(patch(input, &[cmd]), "  $ printf hi\n  hi (no-eol)\n");
    }

    #[test]
    fn patch_file_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.t");
        let input = "  $ echo hi\n  bye\n";
        std::fs::write(&path, input).unwrap();

        let cmd = executed(input, 0, &["hi\n"], 0);
        patch_file(&path, &[cmd]).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "  $ echo hi\n  hi\n");
        assert!(!dir.path().join("test.t.patched").exists());
    }

    #[test]
    fn patch_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = patch_file(&dir.path().join("missing.t"), &[]);
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn empty_patch_is_identity(input in "[ -~\n]*") {
            prop_assert_eq!(patch(&input, &[]), input);
        }

        #[test]
        fn accepting_expected_output_is_identity(
            blocks in proptest::collection::vec(
                ("[a-z]{1,8}", proptest::collection::vec("[a-z][a-z ]{0,8}", 0..3)),
                1..4,
            )
        ) {
            let mut input = String::from("Title\n");
            for (cmd_line, output) in &blocks {
                input.push_str(&format!("  $ {cmd_line}\n"));
                for line in output {
                    input.push_str(&format!("  {line}\n"));
                }
                input.push_str("Text\n");
            }
            let test = parse_test(&input, Path::new("<string>")).unwrap();
            let cmds: Vec<ExecutedCommand> = test
                .cmds
                .into_iter()
                .map(|command| ExecutedCommand {
                    actual_output: command.expected_output.clone(),
                    actual_exit_code: command.expected_exit_code,
                    command,
                })
                .collect();
            prop_assert_eq!(patch(&input, &cmds), input);
        }
    }
}
