// src/error.rs
//
// =============================================================================
// REPX-LAB: BUILD ERRORS
// =============================================================================
//
// One variant per failure class of a lab build. Every error names the
// offending stage/run/step (the `subject`) and what exactly is missing or
// conflicting (the `detail`). Nothing here is recoverable: the first error
// aborts the whole build and no partial lab is written.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

/// Coarse classification, mostly useful for tests and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Definition,
    Wiring,
    Topology,
    Validation,
    Io,
    Parse,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Definition => "definition",
            ErrorKind::Wiring => "wiring",
            ErrorKind::Topology => "topology",
            ErrorKind::Validation => "validation",
            ErrorKind::Io => "io",
            ErrorKind::Parse => "parse",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    /// Unknown attribute keys, missing required fields, bad dynamic-field signatures.
    #[error("definition error in {subject}: {detail}")]
    Definition { subject: String, detail: String },

    /// Ambiguous or unmet input mappings, references to names that do not exist.
    #[error("wiring error in {subject}: {detail}")]
    Wiring { subject: String, detail: String },

    /// Cycles and wrong root/sink counts, in the run graph or a step graph.
    #[error("topology error in {subject}: {detail}")]
    Topology { subject: String, detail: String },

    /// Duplicate names, group/run collisions, malformed resource strings.
    #[error("validation error in {subject}: {detail}")]
    Validation { subject: String, detail: String },

    #[error("I/O error while {action}: {source}")]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },
}

impl BuildError {
    pub fn definition(subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Definition {
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    pub fn wiring(subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Wiring {
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    pub fn topology(subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Topology {
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    pub fn validation(subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Validation {
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    pub fn io(action: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            action: action.into(),
            source,
        }
    }

    pub fn parse(what: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self::Parse {
            what: what.into(),
            detail: detail.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Definition { .. } => ErrorKind::Definition,
            BuildError::Wiring { .. } => ErrorKind::Wiring,
            BuildError::Topology { .. } => ErrorKind::Topology,
            BuildError::Validation { .. } => ErrorKind::Validation,
            BuildError::Io { .. } => ErrorKind::Io,
            BuildError::Parse { .. } => ErrorKind::Parse,
        }
    }

    /// Appends a context line (e.g. "in file: lab.yaml") to the detail.
    pub fn push_context(mut self, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match &mut self {
            BuildError::Definition { detail, .. }
            | BuildError::Wiring { detail, .. }
            | BuildError::Topology { detail, .. }
            | BuildError::Validation { detail, .. }
            | BuildError::Parse { detail, .. } => {
                detail.push_str("\n  ");
                detail.push_str(&msg);
            }
            BuildError::Io { action, .. } => {
                action.push_str(" (");
                action.push_str(&msg);
                action.push(')');
            }
        }
        self
    }
}

/// Renders a name list for messages: `'a', 'b', 'c'`.
pub(crate) fn quoted<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| format!("'{}'", n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}
