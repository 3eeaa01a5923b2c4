// src/config.rs
//
// =============================================================================
// REPX-LAB: BUILD CONFIGURATION
// =============================================================================
//
// Knobs of one `build` invocation. The lab file says *what* to build; this
// says where it goes and how it is labelled.

use std::env;
use std::path::{Path, PathBuf};

/// Environment fallback for the revision id.
pub const REVISION_ENV: &str = "REPX_LAB_REVISION";
pub const DEFAULT_REVISION: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Final lab directory. Built next to it and renamed into place.
    pub out: PathBuf,
    /// Revision id recorded in the root metadata (e.g. a git hash).
    pub revision: String,
    /// Overrides `lab.version` from the lab file.
    pub lab_version: Option<String>,
    /// Replace an existing output directory.
    pub force: bool,
}

impl BuildConfig {
    pub fn new(out: impl AsRef<Path>) -> Self {
        Self {
            out: out.as_ref().to_path_buf(),
            revision: resolve_revision(None),
            lab_version: None,
            force: false,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn with_lab_version(mut self, version: impl Into<String>) -> Self {
        self.lab_version = Some(version.into());
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Explicit value, else `$REPX_LAB_REVISION`, else `"unknown"`.
pub fn resolve_revision(explicit: Option<String>) -> String {
    explicit
        .filter(|r| !r.trim().is_empty())
        .or_else(|| env::var(REVISION_ENV).ok().filter(|r| !r.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_REVISION.to_string())
}
