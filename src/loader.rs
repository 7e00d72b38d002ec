//! Test discovery and configuration loading.

use crate::env::interpolate_env;
use crate::schema::CramConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Failed to read the file.
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to parse YAML.
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// Failed to parse TOML.
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    /// Unsupported file extension.
    #[error("unsupported file format: {0} (expected .yaml, .yml, or .toml)")]
    UnsupportedFormat(String),
    /// An `env` value references a variable that is not set.
    #[error("env.{key}: {msg}")]
    Interpolation { key: String, msg: String },
}

/// Config files looked up in the current directory, in order.
pub const CONFIG_FILENAMES: &[&str] = &["cram.yaml", "cram.toml"];

/// Extension of test files found when walking directories.
const TEST_EXTENSION: &str = "t";

/// Load a config file from an explicit path.
pub fn load_config_file(path: &Path) -> Result<CramConfig, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut config: CramConfig = match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents)?,
        "toml" => toml::from_str(&contents)?,
        other => return Err(LoadError::UnsupportedFormat(other.to_string())),
    };
    interpolate_config_env(&mut config)?;
    Ok(config)
}

/// Load the suite configuration.
///
/// Uses `explicit` when given; otherwise looks for `cram.yaml`, then
/// `cram.toml`, in `dir`. Returns `None` if there is no config file.
pub fn load_config(explicit: Option<&Path>, dir: &Path) -> Result<Option<CramConfig>, LoadError> {
    if let Some(path) = explicit {
        return load_config_file(path).map(Some);
    }
    for name in CONFIG_FILENAMES {
        let path = dir.join(name);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "loading config");
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

fn interpolate_config_env(config: &mut CramConfig) -> Result<(), LoadError> {
    for (key, value) in config.env.iter_mut() {
        *value = interpolate_env(value).map_err(|msg| LoadError::Interpolation {
            key: key.clone(),
            msg,
        })?;
    }
    Ok(())
}

/// Expand command-line arguments into the list of test files.
///
/// Files are used as given. Directories are searched recursively for `.t`
/// files, sorted by path, without following symlinked directories. Paths
/// that cannot be inspected are kept so that running them reports the error.
pub fn find_tests(args: &[PathBuf]) -> Vec<PathBuf> {
    if args.is_empty() {
        return find_tests(&[PathBuf::from(".")]);
    }

    let mut tests = Vec::new();
    for arg in args {
        if arg.is_dir() {
            let mut found = Vec::new();
            collect_tests_recursive(arg, &mut found);
            found.sort();
            tests.extend(found);
        } else {
            tests.push(arg.clone());
        }
    }
    tests
}

fn collect_tests_recursive(dir: &Path, tests: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "cannot read directory");
            tests.push(dir.to_path_buf());
            return;
        }
    };

    for entry in entries {
        let (path, file_type) = match entry.and_then(|e| Ok((e.path(), e.file_type()?))) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "cannot read directory entry");
                continue;
            }
        };

        // Symlinked directories are not followed.
        if file_type.is_dir() {
            collect_tests_recursive(&path, tests);
        } else if file_type.is_symlink() && path.is_dir() {
            tracing::debug!(path = %path.display(), "skipping symlinked directory");
        } else if path.extension().is_some_and(|ext| ext == TEST_EXTENSION) {
            tests.push(path);
        }
    }
}
