// src/params.rs
//
// =============================================================================
// REPX-LAB: PARAMETER ENGINE
// =============================================================================
//
// Responsibilities:
// 1. Resolve a stage's declared defaults against run-supplied values.
// 2. Expand a sweep into the Cartesian product of concrete assignments.
// 3. Compute effective parameters (own values over inherited ones).
// 4. Materialise directory/file-scan sweep sources into plain lists.

use crate::core::Params;
use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// ============================================================================
// 1. SWEEP SPECIFICATION
// ============================================================================

/// One swept parameter and its candidate values, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepAxis {
    pub name: String,
    pub values: Vec<Value>,
}

/// Ordered parameter sweep of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepSpec {
    axes: Vec<SweepAxis>,
}

impl SweepSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an axis. Empty value lists and repeated names are rejected.
    pub fn push(&mut self, owner: &str, name: impl Into<String>, values: Vec<Value>) -> Result<()> {
        let name = name.into();
        if values.is_empty() {
            return Err(BuildError::validation(
                format!("run '{owner}'"),
                format!("sweep parameter '{name}' has no values"),
            ));
        }
        if self.axes.iter().any(|a| a.name == name) {
            return Err(BuildError::validation(
                format!("run '{owner}'"),
                format!("sweep parameter '{name}' is declared twice"),
            ));
        }
        self.axes.push(SweepAxis { name, values });
        Ok(())
    }

    /// Builder form of [`SweepSpec::push`] for literal sweeps.
    pub fn with(mut self, owner: &str, name: &str, values: Vec<Value>) -> Result<Self> {
        self.push(owner, name, values)?;
        Ok(self)
    }

    pub fn axes(&self) -> &[SweepAxis] {
        &self.axes
    }

    /// Number of assignments the sweep expands to.
    pub fn combinations(&self) -> usize {
        self.axes.iter().map(|a| a.values.len()).product()
    }
}

// ============================================================================
// 2. RESOLUTION & EXPANSION
// ============================================================================

/// Per-parameter: the override if the run supplies one, else the declared
/// default. Overrides for parameters the stage does not declare are ignored.
pub fn resolve_defaults(stage_params: &Params, overrides: &Params) -> Params {
    stage_params
        .iter()
        .map(|(name, default)| {
            let value = overrides.get(name).unwrap_or(default);
            (name.clone(), value.clone())
        })
        .collect()
}

/// Cartesian product of all axes. The first declared parameter varies
/// slowest, values keep their list order. An empty sweep yields a single
/// empty assignment.
pub fn expand_sweep(spec: &SweepSpec) -> Vec<Params> {
    let mut out = vec![Params::new()];
    for axis in &spec.axes {
        let mut next = Vec::with_capacity(out.len() * axis.values.len());
        for partial in &out {
            for value in &axis.values {
                let mut assignment = partial.clone();
                assignment.insert(axis.name.clone(), value.clone());
                next.push(assignment);
            }
        }
        out = next;
    }
    out
}

/// Own parameters layered over the effective parameters of every hard
/// producer. Producers are applied in order, so later ones win among
/// themselves; `own` always wins.
pub fn effective_params<'a, I>(own: &Params, producers: I) -> Params
where
    I: IntoIterator<Item = &'a Params>,
{
    let mut merged = Params::new();
    for inherited in producers {
        merged.extend(inherited.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

// ============================================================================
// 3. SWEEP SOURCES
// ============================================================================

/// How a sweep axis is declared in a lab file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SweepSource {
    List(Vec<Value>),
    /// Every entry of a directory, sorted by file name.
    Dir { dir: PathBuf },
    /// Every non-empty line of a text file.
    Lines { lines: PathBuf },
}

impl SweepSource {
    /// Turns the source into a concrete value list. Relative paths are
    /// resolved against `base_dir`.
    pub fn materialize(&self, base_dir: &Path, subject: &str) -> Result<Vec<Value>> {
        match self {
            SweepSource::List(values) => Ok(values.clone()),
            SweepSource::Dir { dir } => {
                let root = base_dir.join(dir);
                let mut values = Vec::new();
                for entry in WalkDir::new(&root)
                    .min_depth(1)
                    .max_depth(1)
                    .sort_by_file_name()
                {
                    let entry = entry.map_err(|e| {
                        BuildError::validation(
                            subject,
                            format!("cannot scan sweep directory {}: {e}", root.display()),
                        )
                    })?;
                    values.push(Value::String(entry.path().to_string_lossy().into_owned()));
                }
                log::debug!("Sweep dir {} -> {} values", root.display(), values.len());
                Ok(values)
            }
            SweepSource::Lines { lines } => {
                let path = base_dir.join(lines);
                let raw = fs::read_to_string(&path)
                    .map_err(|e| BuildError::io(format!("reading sweep file {}", path.display()), e))?;
                Ok(raw
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(|l| Value::String(l.to_string()))
                    .collect())
            }
        }
    }
}
