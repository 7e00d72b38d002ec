//! Configuration file schema.
//!
//! A `cram.yaml` (or `cram.toml`) in the current directory provides defaults
//! for a test run. Every field is optional.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Suite-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CramConfig {
    /// Schema version.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Number of test files processed in parallel (the `--jobs` flag overrides this).
    #[serde(default)]
    pub jobs: Option<usize>,

    /// Shell used to run the commands (default: `/bin/sh`).
    #[serde(default)]
    pub shell: Option<PathBuf>,

    /// Extra environment variables for every test.
    /// Values may reference the host environment with `${VAR}`.
    /// `TESTDIR` and the locale variables cannot be overridden.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Keep the temporary directory after the run.
    #[serde(default)]
    pub keep_tmp: bool,

    /// Where to create the temporary directory holding the per-test working directories.
    /// Use "local" for `.cram/` in the current directory, or give a path.
    /// When not set, the system temp directory is used.
    #[serde(default)]
    pub temp_dir: Option<TempRoot>,
}

fn default_version() -> u32 {
    1
}

/// Parent directory for the temporary directory of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(from = "String", into = "String")]
pub enum TempRoot {
    /// Use `.cram/` in the current directory, with a timestamped name.
    Local,
    /// Use a specific directory.
    Path(PathBuf),
}

impl From<String> for TempRoot {
    fn from(s: String) -> Self {
        if s == "local" {
            TempRoot::Local
        } else {
            TempRoot::Path(PathBuf::from(s))
        }
    }
}

impl From<TempRoot> for String {
    fn from(dir: TempRoot) -> String {
        match dir {
            TempRoot::Local => "local".to_string(),
            TempRoot::Path(p) => p.display().to_string(),
        }
    }
}

/// Generate a JSON schema for the configuration file.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(CramConfig)
}
