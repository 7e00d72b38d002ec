//! Environment for the test shell.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::Path;

/// Variables pinned for every test so output does not depend on the host.
const PINNED: &[(&str, &str)] = &[
    ("LC_ALL", "C"),
    ("LANG", "C"),
    ("LANGUAGE", "C"),
    ("TZ", "GMT"),
    ("TERM", "xterm"),
    ("COLUMNS", "80"),
];

/// Environment variables passed to the shell running one test file.
///
/// Names and values are kept as OS strings, so variables that are not valid
/// UTF-8 still reach the shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<OsString, OsString>,
}

impl Environment {
    /// Snapshot of the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars_os().collect(),
        }
    }

    /// Build the environment for the test file at `path`.
    ///
    /// `overrides` are applied on top of `base`; `TESTDIR` and the locale
    /// variables are set last and always win.
    pub fn for_test(
        base: &Environment,
        overrides: &HashMap<String, String>,
        path: &Path,
    ) -> std::io::Result<Self> {
        let abs = std::path::absolute(path)?;
        let testdir = abs.parent().unwrap_or(&abs);

        let mut env = base.clone();
        for (k, v) in overrides {
            env.set(k, v);
        }
        env.set("TESTDIR", testdir);
        for (k, v) in PINNED {
            env.set(k, v);
        }
        Ok(env)
    }

    pub fn set(&mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) {
        self.vars
            .insert(key.as_ref().to_os_string(), value.as_ref().to_os_string());
    }

    /// The value of `key`, if it is set and valid UTF-8.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_os(key)?.to_str()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn get_os(&self, key: &str) -> Option<&OsStr> {
        self.vars.get(OsStr::new(key)).map(OsString::as_os_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }
}

/// Interpolate environment variables in a string.
///
/// Supports `${VAR}` syntax. Returns an error message if a referenced variable is not set.
pub fn interpolate_env(s: &str) -> Result<String, String> {
    interpolate_env_with(s, &HashMap::new())
}

/// Interpolate environment variables in a string, with additional variables from a map.
///
/// First checks the provided map, then falls back to system environment variables.
pub fn interpolate_env_with(s: &str, env: &HashMap<String, String>) -> Result<String, String> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => var_name.push(c),
                    None => {
                        return Err(format!("Unclosed variable reference: ${{{var_name}"));
                    }
                }
            }
            let value = env
                .get(&var_name)
                .cloned()
                .or_else(|| std::env::var(&var_name).ok())
                .ok_or_else(|| format!("Environment variable '{var_name}' is not set"))?;
            result.push_str(&value);
        } else {
            result.push(c);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_pins_locale_and_testdir() {
        let env =
            Environment::for_test(&Environment::default(), &HashMap::new(), Path::new("/foo/bar.t"))
                .unwrap();
        assert_eq!(env.get("TESTDIR"), Some("/foo"));
        assert_eq!(env.get("LANG"), Some("C"));
        assert_eq!(env.get("LC_ALL"), Some("C"));
        assert_eq!(env.get("LANGUAGE"), Some("C"));
        assert_eq!(env.get("TZ"), Some("GMT"));
        assert_eq!(env.get("TERM"), Some("xterm"));
        assert_eq!(env.get("COLUMNS"), Some("80"));
    }

    #[test]
    fn test_environment_overrides() {
        let mut base = Environment::default();
        base.set("KEEP", "base");
        base.set("LANG", "en_US.UTF-8");
        let overrides = HashMap::from([
            ("EXTRA".to_string(), "yes".to_string()),
            ("TESTDIR".to_string(), "/ignored".to_string()),
        ]);

        let env = Environment::for_test(&base, &overrides, Path::new("/a/b/c.t")).unwrap();
        assert_eq!(env.get("KEEP"), Some("base"));
        assert_eq!(env.get("EXTRA"), Some("yes"));
        assert_eq!(env.get("TESTDIR"), Some("/a/b"));
        assert_eq!(env.get("LANG"), Some("C"));
    }

    #[test]
    fn test_environment_relative_path_is_absolute() {
        let env = Environment::for_test(&Environment::default(), &HashMap::new(), Path::new("x.t"))
            .unwrap();
        let testdir = env.get("TESTDIR").unwrap();
        assert!(Path::new(testdir).is_absolute());
    }

    #[cfg(unix)]
    #[test]
    fn test_environment_keeps_non_utf8_values() {
        use std::os::unix::ffi::OsStrExt;

        let raw = OsStr::from_bytes(b"caf\xe9");
        let mut base = Environment::default();
        base.set("RAW_VALUE", raw);
        base.set(OsStr::from_bytes(b"RAW_\xffNAME"), "x");

        let env = Environment::for_test(&base, &HashMap::new(), Path::new("/t/a.t")).unwrap();
        assert_eq!(env.get_os("RAW_VALUE"), Some(raw));
        assert_eq!(env.get("RAW_VALUE"), None);
        assert!(env.iter().any(|(k, _)| k.as_bytes() == b"RAW_\xffNAME"));
    }

    #[test]
    fn test_interpolate_env() {
        let path = std::env::var("PATH").unwrap();
        assert_eq!(interpolate_env("${PATH}").unwrap(), path);
        assert_eq!(
            interpolate_env("prefix_${PATH}_suffix").unwrap(),
            format!("prefix_{path}_suffix")
        );
        assert_eq!(interpolate_env("no vars here").unwrap(), "no vars here");
        assert_eq!(interpolate_env("").unwrap(), "");
    }

    #[test]
    fn test_interpolate_env_with_map() {
        let vars = HashMap::from([("CRAM_MAP_ONLY".to_string(), "mapped".to_string())]);
        assert_eq!(
            interpolate_env_with("${CRAM_MAP_ONLY}/bin", &vars).unwrap(),
            "mapped/bin"
        );
    }

    #[test]
    fn test_interpolate_env_missing_var() {
        let result = interpolate_env("${NONEXISTENT_VAR_12345}");
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("NONEXISTENT_VAR_12345"));
    }

    #[test]
    fn test_interpolate_env_unclosed() {
        let result = interpolate_env("${UNCLOSED");
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("Unclosed"));
    }
}
