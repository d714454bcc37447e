/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

/// Immutable run configuration, produced by the CLI layer before any sandbox
/// work starts.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the application the grain is an instance of. Non-empty, no '/'.
    pub app_name: String,
    /// Id of the grain itself. Non-empty, no '/'.
    pub grain_id: String,
    /// Absolute path to the read-only package tree that becomes the
    /// sandbox's root filesystem.
    pub pkg_path: PathBuf,
    /// Absolute path to the grain's mutable data directory.
    /// `var_path/sandbox` is the subdirectory visible to the app as `/var`.
    pub var_path: PathBuf,
    /// `NAME=VALUE` entries for the sandboxed process. No defaults are added.
    pub environment: Vec<String>,
    /// argv for the sandboxed process. Never empty.
    pub command: Vec<String>,
    pub is_new: bool,
    pub mount_proc: bool,
    pub keep_stdio: bool,
    pub devmode: bool,
    pub seccomp_dump: bool,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        check_identifier("app name", &self.app_name)?;
        check_identifier("grain id", &self.grain_id)?;
        if self.command.is_empty() {
            bail!("no command given");
        }
        if !self.pkg_path.is_absolute() {
            bail!("package path must be absolute: {}", self.pkg_path.display());
        }
        if !self.var_path.is_absolute() {
            bail!("var path must be absolute: {}", self.var_path.display());
        }
        Ok(())
    }

    /// The app-visible writable directory inside the grain.
    pub fn sandbox_dir(&self) -> PathBuf {
        self.var_path.join("sandbox")
    }
}

fn check_identifier(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') {
        bail!("invalid {}: {:?}", what, value);
    }
    Ok(())
}

/// Convert a path to absolute, whether or not the target exists yet.
///
/// `canonicalize` fails on a missing target, but flag handling only needs a
/// relative path turned absolute. Resolve the deepest existing parent and
/// re-append the remainder.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    match path.canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            match (path.parent(), path.file_name()) {
                (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
                    Ok(absolutize(parent)?.join(name))
                }
                _ => {
                    // A single relative component (or a bare root entry).
                    let cwd = std::env::current_dir().context("while reading cwd")?;
                    let mut tail = path.components();
                    if path.is_absolute() {
                        tail.next();
                        return Ok(PathBuf::from("/").join(tail.as_path()));
                    }
                    match tail.next() {
                        Some(Component::Normal(first)) => Ok(cwd.join(first)),
                        _ => Ok(cwd.join(path)),
                    }
                }
            }
        }
        Err(e) => {
            Err(e).with_context(|| format!("while resolving path '{}'", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            app_name: "acme-app".to_string(),
            grain_id: "g123".to_string(),
            pkg_path: "/var/sandstorm/apps/acme-app".into(),
            var_path: "/var/sandstorm/grains/g123".into(),
            environment: vec!["PATH=/bin".to_string()],
            command: vec!["/start".to_string()],
            is_new: false,
            mount_proc: false,
            keep_stdio: false,
            devmode: false,
            seccomp_dump: false,
        }
    }

    #[test]
    fn valid_config_passes() {
        test_config().validate().unwrap();
    }

    #[test]
    fn rejects_bad_identifiers() {
        let mut cfg = test_config();
        cfg.app_name = String::new();
        assert!(cfg.validate().is_err());

        let mut cfg = test_config();
        cfg.grain_id = "../escape".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_command() {
        let mut cfg = test_config();
        cfg.command.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_relative_paths() {
        let mut cfg = test_config();
        cfg.pkg_path = "apps/acme".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn absolutize_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = absolutize(dir.path()).unwrap();
        assert!(resolved.is_absolute());
    }

    #[test]
    fn absolutize_missing_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-created-yet");
        let resolved = absolutize(&missing).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("not-created-yet"));
    }

    #[test]
    fn absolutize_missing_chain() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("a/b/c");
        let resolved = absolutize(&missing).unwrap();
        assert!(resolved.ends_with("a/b/c"));
    }

    #[test]
    fn absolutize_relative_single_component() {
        let resolved = absolutize(Path::new("definitely-does-not-exist-xyz")).unwrap();
        assert!(resolved.is_absolute());
    }
}
