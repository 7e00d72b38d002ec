mod env;
mod error;
mod escape;
mod loader;
mod matcher;
mod parser;
mod patch;
mod runner;
mod schema;
mod script;

use clap::{Args, Parser, Subcommand, ValueEnum};
use error::Error;
use escape::drop_eol;
use runner::{ExecutedTest, JobResult};
use script::ExecutedCommand;
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Progress characters, diffs and prompts
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
}

#[derive(Parser)]
#[command(name = "cram")]
#[command(about = "Functional tests for command line applications")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute test files
    Run(RunArgs),
    /// Parse test files without running them
    Validate {
        /// Test files or directories
        #[arg(default_value = ".")]
        paths: Vec<PathBuf>,
    },
    /// Scaffold a new test file
    Init {
        /// Output path for the new test file
        #[arg(default_value = "tests/example.t")]
        path: PathBuf,
    },
    /// Output the config file schema
    Schema,
}

#[derive(Args)]
struct RunArgs {
    /// Test files or directories
    #[arg(default_value = ".")]
    paths: Vec<PathBuf>,
    /// Number of tests to run in parallel (default: twice the number of CPUs)
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Interactively update test files on failure
    #[arg(short, long)]
    interactive: bool,
    /// Show names of test files
    #[arg(short, long)]
    verbose: bool,
    /// Output debug information
    #[arg(long)]
    debug: bool,
    /// Keep the temporary directory after executing tests
    #[arg(long)]
    keep_tmp: bool,
    /// Output format
    #[arg(short, long, default_value = "human")]
    output: OutputFormat,
    /// Config file (default: cram.yaml or cram.toml in the current directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

const EXAMPLE_TEST: &str = r#"This is an example test file. Everything that is not indented is
commentary. Commands start with "  $ " and continue with "  > ":

  $ echo hello \
  > world
  hello world

The expected output follows the command, indented by two spaces.
A non-zero exit code is written in brackets:

  $ false
  [1]

Output lines can also be matched by a regular expression or a glob:

  $ date +%Y
  \d{4} (re)
  $ echo "$TESTDIR"
  /* (glob)

Commands run in a fresh directory, and the shell keeps its state
between commands:

  $ mkdir data && cd data
  $ touch a.txt b.txt
  $ ls
  a.txt
  b.txt
"#;

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            init_tracing(args.debug);
            std::process::exit(run(args));
        }
        Command::Validate { paths } => {
            init_tracing(false);
            std::process::exit(validate(&paths));
        }
        Command::Init { path } => {
            if path.exists() {
                eprintln!("Error: file already exists: {}", path.display());
                std::process::exit(1);
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
                && let Err(e) = fs::create_dir_all(parent)
            {
                eprintln!("Error creating directory: {e}");
                std::process::exit(1);
            }
            if let Err(e) = fs::write(&path, EXAMPLE_TEST) {
                eprintln!("Error writing file: {e}");
                std::process::exit(1);
            }
            println!("Created: {}", path.display());
        }
        Command::Schema => {
            let schema = schema::generate_schema();
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing schema: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Log to stderr, filtered by `CRAM_LOG`.
fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("CRAM_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn default_jobs() -> usize {
    2 * std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Run the tests and return the process exit code.
fn run(args: RunArgs) -> i32 {
    let config = match loader::load_config(args.config.as_deref(), Path::new(".")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            return 2;
        }
    };
    let jobs = args
        .jobs
        .or(config.as_ref().and_then(|c| c.jobs))
        .unwrap_or_else(default_jobs);
    let keep_tmp = args.keep_tmp || config.as_ref().is_some_and(|c| c.keep_tmp);
    let human = matches!(args.output, OutputFormat::Human);

    let temp_root =
        match runner::create_temp_root(config.as_ref().and_then(|c| c.temp_dir.as_ref())) {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("Could not create temp directory: {e}");
                return 2;
            }
        };
    if keep_tmp {
        eprintln!("# Temporary directory: {}", temp_root.path().display());
    }

    let effective = runner::EffectiveConfig::from_config(config.as_ref());
    let paths = loader::find_tests(&args.paths);
    tracing::debug!(files = paths.len(), jobs, "starting run");

    let mut results = Vec::with_capacity(paths.len());
    runner::run_parallel(&paths, jobs, temp_root.path(), &effective, |job| {
        if args.debug
            && let Ok(test) = &job.result
        {
            eprintln!("# {}\n{}", job.path.display(), test.script);
        }
        if human {
            report_progress(&job, args.verbose);
        }
        results.push(job);
    });
    results.sort_by_key(|job| job.index);

    let summary = Summary::from_results(&results);
    match args.output {
        OutputFormat::Human => {
            println!();
            let stdin = io::stdin();
            report_failures(&results, args.interactive, &mut stdin.lock());
        }
        OutputFormat::Json => {
            if let Err(e) = print_json(&results, &summary) {
                eprintln!("Error serializing results: {e}");
                return 2;
            }
        }
    }
    eprintln!("{summary}");

    if keep_tmp {
        let _ = temp_root.keep();
    }
    summary.exit_code()
}

/// Describe a processing error, naming the file when the error does not.
fn describe_error(path: &Path, err: &Error) -> String {
    match err {
        Error::Protocol(e) => format!("{}: {e}", path.display()),
        other => other.to_string(),
    }
}

/// Print a progress character, or a line in verbose mode.
fn report_progress(job: &JobResult, verbose: bool) {
    let path = job.path.display();
    match &job.result {
        Err(e) => {
            let msg = describe_error(&job.path, e);
            if verbose {
                println!("E {msg}");
            } else {
                eprintln!("{msg}");
                print!("E");
            }
        }
        Ok(test) if !test.passed() => {
            if verbose {
                println!(
                    "F {path}: {} of {} commands failed",
                    test.failures.len(),
                    test.test.cmds.len()
                );
            } else {
                print!("F");
            }
        }
        Ok(test) => {
            if verbose {
                println!(". {path}: {} commands passed", test.test.cmds.len());
            } else {
                print!(".");
            }
        }
    }
    let _ = io::stdout().flush();
}

/// Show a diff for every failed command and, if `interactive`, offer to
/// write the actual output back into the test file.
fn report_failures<R: BufRead>(results: &[JobResult], interactive: bool, input: &mut R) {
    let mut stdout = io::stdout();
    for job in results {
        let Ok(test) = &job.result else {
            continue;
        };

        let mut accepted = Vec::new();
        for cmd in &test.failures {
            println!("When executing {:?}:", drop_eol(&cmd.command.cmd_line));
            print!("{}", render_diff(cmd));

            if interactive {
                match prompt("Accept this change?", input, &mut stdout) {
                    Ok(true) => accepted.push(cmd.clone()),
                    Ok(false) => {}
                    Err(e) => {
                        eprintln!("Error reading answer: {e}");
                        return;
                    }
                }
            }
        }

        if !accepted.is_empty() {
            match patch::patch_file(&job.path, &accepted) {
                Ok(()) => println!("Patched {}", job.path.display()),
                Err(e) => eprintln!("Error patching {}: {e}", job.path.display()),
            }
        }
    }
}

/// Ask a yes/no question until it is answered.
fn prompt<R: BufRead, W: Write>(question: &str, input: &mut R, out: &mut W) -> io::Result<bool> {
    loop {
        write!(out, "{question} ")?;
        out.flush()?;

        let mut answer = String::new();
        if input.read_line(&mut answer)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "no answer on stdin",
            ));
        }
        match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => writeln!(out, "Please answer 'yes' or 'no'")?,
        }
    }
}

/// Line diff of expected against actual output, exit codes included.
fn render_diff(cmd: &ExecutedCommand) -> String {
    let expected = output_text(&cmd.command.expected_output, cmd.command.expected_exit_code);
    let actual = output_text(&cmd.actual_output, cmd.actual_exit_code);

    let diff = TextDiff::from_lines(expected.as_str(), actual.as_str());
    let mut rendered = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        rendered.push(sign);
        rendered.push_str(change.value());
    }
    rendered
}

/// Output lines followed by the `[N]` exit code line when it is non-zero.
fn output_text(lines: &[String], exit_code: i32) -> String {
    let mut text = String::new();
    for line in lines {
        text.push_str(line);
        if !line.ends_with('\n') {
            text.push('\n');
        }
    }
    if exit_code != 0 {
        text.push_str(&format!("[{exit_code}]\n"));
    }
    text
}

/// Totals for a run.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
struct Summary {
    tests: usize,
    commands: usize,
    errors: usize,
    failures: usize,
}

impl Summary {
    fn from_results(results: &[JobResult]) -> Self {
        let mut summary = Summary {
            tests: results.len(),
            ..Summary::default()
        };
        for job in results {
            match &job.result {
                Ok(test) => {
                    summary.commands += test.test.cmds.len();
                    if !test.passed() {
                        summary.failures += 1;
                    }
                }
                Err(e) => {
                    if let Error::InvalidTest(invalid) = e {
                        summary.commands += invalid.partial.cmds.len();
                    }
                    summary.errors += 1;
                }
            }
        }
        summary
    }

    fn exit_code(&self) -> i32 {
        if self.errors > 0 {
            2
        } else if self.failures > 0 {
            1
        } else {
            0
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "# Ran {} tests ({} commands), {} errors, {} failures",
            self.tests, self.commands, self.errors, self.failures
        )
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    summary: &'a Summary,
    tests: Vec<JsonTest<'a>>,
}

#[derive(Serialize)]
struct JsonTest<'a> {
    path: &'a Path,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a ExecutedTest>,
}

fn print_json(results: &[JobResult], summary: &Summary) -> serde_json::Result<()> {
    let tests = results
        .iter()
        .map(|job| match &job.result {
            Ok(test) => JsonTest {
                path: &job.path,
                status: if test.passed() { "passed" } else { "failed" },
                error: None,
                result: Some(test),
            },
            Err(e) => JsonTest {
                path: &job.path,
                status: "error",
                error: Some(describe_error(&job.path, e)),
                result: None,
            },
        })
        .collect();
    let report = JsonReport { summary, tests };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Parse test files and report their structure. Returns the exit code.
fn validate(args: &[PathBuf]) -> i32 {
    let paths = loader::find_tests(args);
    if paths.is_empty() {
        eprintln!("No test files found");
        return 1;
    }

    let mut errors = 0;
    for path in &paths {
        match runner::load_test(path) {
            Ok(test) => {
                println!("✓ {} ({} commands)", path.display(), test.cmds.len());
            }
            Err(e) => {
                eprintln!("✗ {}", describe_error(path, &e));
                errors += 1;
            }
        }
    }

    if errors > 0 {
        eprintln!("\n{errors} test file(s) failed validation");
        return 1;
    }
    println!("\nAll {} test file(s) valid", paths.len());
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{self, Command as TestCommand, InvalidTestError, Test};

    fn failed_cmd(expected: &[&str], exit: i32, actual: &[&str], actual_exit: i32) -> ExecutedCommand {
        ExecutedCommand {
            command: TestCommand {
                cmd_line: "cmd\n".to_string(),
                expected_output: expected.iter().map(|s| s.to_string()).collect(),
                expected_exit_code: exit,
                line_number: 1,
            },
            actual_output: actual.iter().map(|s| s.to_string()).collect(),
            actual_exit_code: actual_exit,
        }
    }

    fn job(index: usize, result: Result<ExecutedTest, Error>) -> JobResult {
        JobResult {
            index,
            path: PathBuf::from(format!("{index}.t")),
            result,
        }
    }

    fn executed_test(cmds: usize, failures: Vec<ExecutedCommand>) -> ExecutedTest {
        ExecutedTest {
            test: Test {
                path: PathBuf::from("x.t"),
                cmds: vec![TestCommand::default(); cmds],
            },
            executed: vec![],
            script: String::new(),
            workdir: PathBuf::new(),
            failures,
        }
    }

    #[yare::parameterized(
        yes       = { "y\n", true },
        yes_word  = { "YES\n", true },
        no        = { "n\n", false },
        no_word   = { " no \n", false },
        reprompt  = { "maybe\nyes\n", true },
    )]
    fn prompt_answers(input: &str, expected: bool) {
        let mut out = Vec::new();
        let answer = prompt("Accept?", &mut io::Cursor::new(input), &mut out).unwrap();
        assert_eq!(answer, expected);
    }

    #[test]
    fn prompt_repeats_question() {
        let mut out = Vec::new();
        prompt("Accept?", &mut io::Cursor::new("x\nn\n"), &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Accept? Please answer 'yes' or 'no'\nAccept? "
        );
    }

    #[test]
    fn prompt_eof_is_error() {
        let mut out = Vec::new();
        let err = prompt("Accept?", &mut io::Cursor::new(""), &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn prompt_shares_reader_between_questions() {
        let mut input = io::Cursor::new("y\nn\n");
        let mut out = Vec::new();
        assert!(prompt("First?", &mut input, &mut out).unwrap());
        assert!(!prompt("Second?", &mut input, &mut out).unwrap());
    }

    #[test]
    fn diff_shows_changed_lines() {
        let cmd = failed_cmd(&["a\n", "c\n"], 0, &["a\n", "b\n"], 0);
        assert_eq!(render_diff(&cmd), " a\n-c\n+b\n");
    }

    #[test]
    fn diff_shows_exit_codes() {
        let cmd = failed_cmd(&["out\n"], 0, &["out\n"], 3);
        assert_eq!(render_diff(&cmd), " out\n+[3]\n");

        let cmd = failed_cmd(&[], 1, &[], 2);
        assert_eq!(render_diff(&cmd), "-[1]\n+[2]\n");
    }

    #[test]
    fn diff_terminates_last_line() {
        let cmd = failed_cmd(&["a"], 0, &["b (no-eol)\n"], 0);
        assert_eq!(render_diff(&cmd), "-a\n+b (no-eol)\n");
    }

    #[test]
    fn summary_counts() {
        let invalid = InvalidTestError {
            path: PathBuf::from("bad.t"),
            lineno: 2,
            msg: "no command".to_string(),
            partial: Test {
                path: PathBuf::from("bad.t"),
                cmds: vec![TestCommand::default()],
            },
        };
        let results = vec![
            job(0, Ok(executed_test(2, vec![]))),
            job(1, Ok(executed_test(3, vec![failed_cmd(&[], 0, &[], 1)]))),
            job(2, Err(Error::InvalidTest(invalid))),
        ];

        let summary = Summary::from_results(&results);
        assert_eq!(
            summary,
            Summary {
                tests: 3,
                commands: 6,
                errors: 1,
                failures: 1
            }
        );
        assert_eq!(
            summary.to_string(),
            "# Ran 3 tests (6 commands), 1 errors, 1 failures"
        );
        assert_eq!(summary.exit_code(), 2);
    }

    #[yare::parameterized(
        clean    = { 0, 0, 0 },
        failures = { 0, 2, 1 },
        errors   = { 1, 0, 2 },
        both     = { 1, 1, 2 },
    )]
    fn summary_exit_code(errors: usize, failures: usize, code: i32) {
        let summary = Summary {
            tests: errors + failures,
            commands: 0,
            errors,
            failures,
        };
        assert_eq!(summary.exit_code(), code);
    }

    #[test]
    fn example_test_parses() {
        let test = parser::parse_test(EXAMPLE_TEST, Path::new("example.t")).unwrap();
        assert_eq!(test.cmds.len(), 7);
        assert_eq!(test.cmds[0].cmd_line, "echo hello \\\nworld\n");
        assert_eq!(test.cmds[1].expected_exit_code, 1);
    }
}
