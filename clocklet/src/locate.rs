//! Worker runtime resolution.
//!
//! Finding a usable Python on end-user machines is a probe chain, not a
//! single path: a bundled interpreter when the installer shipped one, then
//! the well-known install locations, then whatever `PATH` has. Partial
//! installs are common, so the whole chain is walked before giving up.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// A single place a runtime might live. Candidates are evaluated lazily,
/// in order; the first probe hit wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCandidate {
    /// Interpreter shipped alongside the application.
    Bundled(PathBuf),
    /// Fixed, platform-specific install location.
    WellKnown(PathBuf),
    /// Bare command name resolved through the `PATH` variable.
    PathLookup(String),
}

impl std::fmt::Display for RuntimeCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bundled(path) => write!(f, "bundled:{}", path.display()),
            Self::WellKnown(path) => write!(f, "{}", path.display()),
            Self::PathLookup(command) => write!(f, "PATH:{command}"),
        }
    }
}

/// Every candidate was probed and none is usable. `tried` preserves probe
/// order so the interface layer can show what was looked at.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no usable worker runtime found (tried: {})", tried.join(", "))]
pub struct LocateError {
    pub tried: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRuntime {
    pub program: PathBuf,
}

/// Ordered runtime probe chain.
#[derive(Debug, Clone)]
pub struct RuntimeLocator {
    bundled: Option<PathBuf>,
    well_known: Vec<PathBuf>,
    command: String,
}

#[cfg(unix)]
fn default_well_known() -> Vec<PathBuf> {
    [
        "/usr/local/bin/python3",
        "/opt/homebrew/bin/python3",
        "/usr/bin/python3",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

#[cfg(windows)]
fn default_well_known() -> Vec<PathBuf> {
    [
        r"C:\Python312\python.exe",
        r"C:\Python311\python.exe",
        r"C:\Python310\python.exe",
        r"C:\Program Files\Python312\python.exe",
        r"C:\Program Files\Python311\python.exe",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

const DEFAULT_COMMAND: &str = if cfg!(windows) { "python" } else { "python3" };

impl Default for RuntimeLocator {
    fn default() -> Self {
        Self {
            bundled: None,
            well_known: default_well_known(),
            command: DEFAULT_COMMAND.to_string(),
        }
    }
}

impl RuntimeLocator {
    pub fn with_bundled(mut self, path: impl Into<PathBuf>) -> Self {
        self.bundled = Some(path.into());
        self
    }

    pub fn with_well_known(mut self, paths: Vec<PathBuf>) -> Self {
        self.well_known = paths;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// The probe order: bundled first, then well-known paths, then `PATH`.
    pub fn candidates(&self) -> impl Iterator<Item = RuntimeCandidate> + '_ {
        self.bundled
            .iter()
            .map(|path| RuntimeCandidate::Bundled(path.clone()))
            .chain(
                self.well_known
                    .iter()
                    .map(|path| RuntimeCandidate::WellKnown(path.clone())),
            )
            .chain(std::iter::once(RuntimeCandidate::PathLookup(
                self.command.clone(),
            )))
    }

    pub fn resolve(&self) -> Result<ResolvedRuntime, LocateError> {
        self.resolve_with(&|path| path.is_file(), std::env::var_os("PATH").as_deref())
    }

    /// Resolution with an injected filesystem probe and `PATH` value, so the
    /// policy is testable without touching the real machine.
    pub fn resolve_with(
        &self,
        probe: &dyn Fn(&Path) -> bool,
        path_var: Option<&OsStr>,
    ) -> Result<ResolvedRuntime, LocateError> {
        let mut tried = Vec::new();
        for candidate in self.candidates() {
            match &candidate {
                RuntimeCandidate::Bundled(path) | RuntimeCandidate::WellKnown(path) => {
                    if probe(path) {
                        tracing::info!(runtime = %candidate, "Resolved worker runtime");
                        return Ok(ResolvedRuntime {
                            program: path.clone(),
                        });
                    }
                }
                RuntimeCandidate::PathLookup(command) => {
                    if let Some(program) = lookup_in_path(command, path_var, probe) {
                        tracing::info!(runtime = %program.display(), "Resolved worker runtime from PATH");
                        return Ok(ResolvedRuntime { program });
                    }
                }
            }
            tried.push(candidate.to_string());
        }
        Err(LocateError { tried })
    }
}

fn lookup_in_path(
    command: &str,
    path_var: Option<&OsStr>,
    probe: &dyn Fn(&Path) -> bool,
) -> Option<PathBuf> {
    let path_var = path_var?;
    for dir in std::env::split_paths(path_var) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(command);
        if probe(&candidate) {
            return Some(candidate);
        }
        if cfg!(windows) {
            let with_exe = dir.join(format!("{command}.exe"));
            if probe(&with_exe) {
                return Some(with_exe);
            }
        }
    }
    None
}
