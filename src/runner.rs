//! Test execution engine.
//!
//! Each test file runs in its own working directory under a shared temporary
//! root. Several files are processed at once by a fixed pool of workers.

use crate::env::Environment;
use crate::error::Error;
use crate::parser::{Test, parse_test};
use crate::schema::{CramConfig, TempRoot};
use crate::script::{ExecutedCommand, execute_script, make_script, new_banner, split_output};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

/// Capacity of the job and result queues.
const QUEUE_DEPTH: usize = 8;

/// Shell used when the configuration does not name one.
const DEFAULT_SHELL: &str = "/bin/sh";

/// A fully executed test file.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedTest {
    pub test: Test,
    /// Results for every command, in file order.
    pub executed: Vec<ExecutedCommand>,
    /// The script that was sent to the shell.
    pub script: String,
    /// Working directory the commands ran in.
    pub workdir: PathBuf,
    /// Commands whose output or exit code differed from the expectation.
    pub failures: Vec<ExecutedCommand>,
}

impl ExecutedTest {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of processing one test file.
#[derive(Debug)]
pub struct JobResult {
    /// Position of the file in the list given to [`run_parallel`].
    pub index: usize,
    /// Set even when processing failed.
    pub path: PathBuf,
    pub result: Result<ExecutedTest, Error>,
}

/// Effective configuration for running tests, combining the config file and the host.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub shell: PathBuf,
    /// Host environment every test starts from.
    pub base_env: Environment,
    /// Extra variables from the config file, already interpolated.
    pub env: HashMap<String, String>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(DEFAULT_SHELL),
            base_env: Environment::from_process(),
            env: HashMap::new(),
        }
    }
}

impl EffectiveConfig {
    /// Create from an optional config file.
    pub fn from_config(config: Option<&CramConfig>) -> Self {
        let mut effective = Self::default();
        if let Some(cfg) = config {
            if let Some(shell) = &cfg.shell {
                effective.shell = shell.clone();
            }
            effective.env = cfg.env.clone();
        }
        effective
    }
}

/// Create the temporary directory holding the per-file working directories.
///
/// The directory is removed when the returned handle is dropped, unless the
/// caller keeps it.
pub fn create_temp_root(temp_dir: Option<&TempRoot>) -> io::Result<tempfile::TempDir> {
    match temp_dir {
        None => tempfile::Builder::new().prefix("cram-").tempdir(),
        Some(TempRoot::Local) => {
            let parent = Path::new(".cram");
            fs::create_dir_all(parent)?;
            let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
            tempfile::Builder::new()
                .prefix(&format!("{timestamp}-"))
                .tempdir_in(parent)
        }
        Some(TempRoot::Path(parent)) => {
            fs::create_dir_all(parent)?;
            tempfile::Builder::new().prefix("cram-").tempdir_in(parent)
        }
    }
}

/// Read and parse the test file at `path`.
pub fn load_test(path: &Path) -> Result<Test, Error> {
    let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
    let input = String::from_utf8(bytes)
        .map_err(|e| Error::io(path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
    Ok(parse_test(&input, path)?)
}

/// Run the test file at `path` inside a fresh working directory under `tempdir`.
///
/// `idx` keeps the working directories of files with the same name apart.
pub fn process(
    tempdir: &Path,
    path: &Path,
    idx: usize,
    config: &EffectiveConfig,
) -> Result<ExecutedTest, Error> {
    let test = load_test(path)?;

    let workdir = tempdir.join(workdir_name(path, idx));
    create_private_dir(&workdir).map_err(|e| Error::io(&workdir, e))?;

    let banner = new_banner();
    let lines = make_script(&test.cmds, &banner);
    let env = Environment::for_test(&config.base_env, &config.env, path)
        .map_err(|e| Error::io(path, e))?;

    tracing::debug!(
        path = %path.display(),
        workdir = %workdir.display(),
        commands = test.cmds.len(),
        "running test file"
    );
    let output =
        execute_script(&config.shell, &workdir, &env, &lines).map_err(|e| Error::io(path, e))?;
    let executed = split_output(&test.cmds, &output, &banner)?;

    let failures: Vec<ExecutedCommand> =
        executed.iter().filter(|cmd| cmd.failed()).cloned().collect();
    if !failures.is_empty() {
        tracing::info!(path = %path.display(), failures = failures.len(), "test file failed");
    }

    Ok(ExecutedTest {
        test,
        executed,
        script: lines.concat(),
        workdir,
        failures,
    })
}

/// Name of the working directory for the `idx`-th file: `003-name` for `name.t`.
fn workdir_name(path: &Path, idx: usize) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{idx:03}-{stem}")
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir(path)
}

/// Process `paths` with up to `jobs` workers and hand every result to `on_result`.
///
/// Results arrive in completion order; use [`JobResult::index`] to restore
/// the input order. `on_result` runs on the calling thread, so it may prompt
/// the user. Returns once every file has been reported.
pub fn run_parallel<F>(
    paths: &[PathBuf],
    jobs: usize,
    tempdir: &Path,
    config: &EffectiveConfig,
    mut on_result: F,
) where
    F: FnMut(JobResult),
{
    let workers = jobs.clamp(1, paths.len().max(1));
    let (job_tx, job_rx) = mpsc::sync_channel::<(usize, &Path)>(QUEUE_DEPTH);
    let job_rx = Mutex::new(job_rx);
    let (result_tx, result_rx) = mpsc::sync_channel::<JobResult>(QUEUE_DEPTH);

    thread::scope(|s| {
        s.spawn(move || {
            for (index, path) in paths.iter().enumerate() {
                if job_tx.send((index, path.as_path())).is_err() {
                    break;
                }
            }
        });

        for _ in 0..workers {
            let result_tx = result_tx.clone();
            let job_rx = &job_rx;
            s.spawn(move || worker(job_rx, result_tx, tempdir, config));
        }
        // The result queue closes once the last worker drops its sender.
        drop(result_tx);

        for result in result_rx {
            on_result(result);
        }
    });
}

fn worker(
    jobs: &Mutex<Receiver<(usize, &Path)>>,
    results: SyncSender<JobResult>,
    tempdir: &Path,
    config: &EffectiveConfig,
) {
    loop {
        let job = jobs.lock().recv();
        let Ok((index, path)) = job else {
            break;
        };
        let result = process(tempdir, path, index, config);
        if let Err(e) = &result {
            tracing::debug!(path = %path.display(), error = %e, "test file errored");
        }
        let done = JobResult {
            index,
            path: path.to_path_buf(),
            result,
        };
        if results.send(done).is_err() {
            break;
        }
    }
}

/// Process `paths` and return the results in input order.
#[cfg_attr(not(test), allow(dead_code))]
pub fn run_all(
    paths: &[PathBuf],
    jobs: usize,
    tempdir: &Path,
    config: &EffectiveConfig,
) -> Vec<JobResult> {
    let mut results = Vec::with_capacity(paths.len());
    run_parallel(paths, jobs, tempdir, config, |r| results.push(r));
    results.sort_by_key(|r| r.index);
    results
}
