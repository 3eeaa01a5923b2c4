//! RepX lab declaration DSL (YAML)
//!
//! # Philosophy
//! The lab file is the **canonical, human-readable** description of an
//! experiment: stages, the pipelines that wire them, the runs that sweep
//! them and the dependencies between runs. It is VCS-friendly and is the
//! only input of a build besides the tool binaries and image layers it
//! points to.
//!
//! # Notes
//! - Loading is two-phase: every stage and pipeline is registered first and
//!   references are resolved once the file is fully read, so declaration
//!   order in the YAML does not matter.
//! - Relative paths (tools, image layers, sweep sources) are resolved against
//!   the directory of the lab file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::core::DependencyKind;
use crate::error::{BuildError, Result};
use crate::lab::{ImageSpec, LabSpec, RunSpec};
use crate::params::{SweepSource, SweepSpec};
use crate::pipeline::{EntryDecl, PipelineBuilder, PipelineDecl};
use crate::resources::ResourceDecl;
use crate::stage::{scalar_text, StageSpec};
use crate::wiring::DepExpr;

/// Lab file schema version supported by this implementation.
pub const SUPPORTED_DSL_VERSION: u32 = 1;

// =============================================================================
// Lab file types
// =============================================================================

/// Top-level YAML document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabFile {
    pub version: u32,
    pub lab: LabMeta,
    #[serde(default)]
    pub tools: BTreeMap<String, String>,
    #[serde(default)]
    pub images: BTreeMap<String, ImageDecl>,
    /// Kept untyped: stage shapes are validated by the stage resolver.
    #[serde(default)]
    pub stages: BTreeMap<String, Value>,
    #[serde(default)]
    pub pipelines: BTreeMap<String, Vec<EntrySpec>>,
    #[serde(default)]
    pub runs: Vec<RunDecl>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabMeta {
    pub name: String,
    #[serde(default)]
    pub version: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageDecl {
    pub layers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntrySpec {
    #[serde(default)]
    pub id: Option<String>,
    pub stage: String,
    #[serde(default)]
    pub deps: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunDecl {
    pub name: String,
    pub pipelines: Vec<String>,
    /// Sweep map. A YAML mapping keeps declaration order, which fixes the
    /// expansion order.
    #[serde(default)]
    pub params: serde_yaml::Mapping,
    #[serde(default)]
    pub dependencies: Vec<Value>,
    #[serde(default)]
    pub containerized: bool,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub resources: Option<ResourceDecl>,
}

// =============================================================================
// Public API
// =============================================================================

/// Load, parse and link a YAML lab file.
pub fn load_yaml(path: impl AsRef<Path>) -> Result<LabSpec> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .map_err(|e| BuildError::io(format!("reading lab file {}", path.display()), e))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    parse_str(&raw, base_dir).map_err(|e| e.push_context(format!("in file: {}", path.display())))
}

/// Parse lab YAML; relative paths are resolved against `base_dir`.
pub fn parse_str(raw: &str, base_dir: &Path) -> Result<LabSpec> {
    let file: LabFile = serde_yaml::from_str(raw).map_err(|e| BuildError::parse("lab YAML", e))?;

    if file.version != SUPPORTED_DSL_VERSION {
        return Err(BuildError::definition(
            "lab file",
            format!(
                "unsupported schema version {}; this build supports version {SUPPORTED_DSL_VERSION}",
                file.version
            ),
        ));
    }

    into_spec(file, base_dir)
}

/// Resolve a path relative to the lab directory.
pub fn resolve_relative(base_dir: &Path, referenced: &str) -> PathBuf {
    let p = PathBuf::from(referenced);
    if p.is_absolute() {
        p
    } else {
        base_dir.join(p)
    }
}

// =============================================================================
// Conversion
// =============================================================================

fn into_spec(file: LabFile, base_dir: &Path) -> Result<LabSpec> {
    if file.lab.name.trim().is_empty() {
        return Err(BuildError::definition("lab file", "lab.name must not be empty"));
    }

    // Phase 1: register.
    let mut builder = PipelineBuilder::new();
    for (id, decl) in &file.stages {
        builder.stage(StageSpec::from_decl(id, decl)?)?;
    }
    for (name, entries) in &file.pipelines {
        builder.pipeline(pipeline_decl(name, entries)?)?;
    }
    // Phase 2: link.
    let registry = builder.build()?;

    let runs = file
        .runs
        .iter()
        .map(|r| run_spec(r, base_dir))
        .collect::<Result<Vec<_>>>()?;

    let images = file
        .images
        .iter()
        .map(|(name, decl)| {
            let layers = decl.layers.iter().map(|l| resolve_relative(base_dir, l)).collect();
            (name.clone(), ImageSpec { layers })
        })
        .collect();

    log::debug!(
        "Loaded lab '{}': {} stage(s), {} pipeline(s), {} run(s)",
        file.lab.name,
        registry.stages.len(),
        registry.pipelines.len(),
        runs.len()
    );

    Ok(LabSpec {
        name: file.lab.name,
        version: file.lab.version.as_ref().map(scalar_text).unwrap_or_else(|| "0".to_string()),
        tools: file
            .tools
            .iter()
            .map(|(name, p)| (name.clone(), resolve_relative(base_dir, p)))
            .collect(),
        images,
        registry,
        runs,
        groups: file.groups,
    })
}

fn pipeline_decl(name: &str, entries: &[EntrySpec]) -> Result<PipelineDecl> {
    let subject = format!("pipeline '{name}'");
    let entries = entries
        .iter()
        .map(|e| {
            let deps = e
                .deps
                .iter()
                .map(|d| DepExpr::from_json(&subject, d))
                .collect::<Result<Vec<_>>>()?;
            Ok(EntryDecl {
                id: e.id.clone(),
                stage: e.stage.clone(),
                deps,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(PipelineDecl {
        name: name.to_string(),
        entries,
    })
}

/// `run`, `[run]` or `[run, hard|soft]`.
fn run_dependency(subject: &str, v: &Value) -> Result<(String, DependencyKind)> {
    let bad = || {
        BuildError::definition(
            subject,
            format!("invalid run dependency {v} (expected a run name or [run, hard|soft])"),
        )
    };
    match v {
        Value::String(run) => Ok((run.clone(), DependencyKind::Hard)),
        Value::Array(items) => match items.as_slice() {
            [Value::String(run)] => Ok((run.clone(), DependencyKind::Hard)),
            [Value::String(run), Value::String(kind)] => {
                let kind = kind
                    .parse::<DependencyKind>()
                    .map_err(|e| BuildError::definition(subject, e))?;
                Ok((run.clone(), kind))
            }
            _ => Err(bad()),
        },
        _ => Err(bad()),
    }
}

fn sweep_spec(subject: &str, owner: &str, params: &serde_yaml::Mapping, base_dir: &Path) -> Result<SweepSpec> {
    let mut sweep = SweepSpec::new();
    for (key, raw) in params {
        let name = key
            .as_str()
            .ok_or_else(|| BuildError::definition(subject, format!("sweep parameter names must be strings, got {key:?}")))?;

        let source: SweepSource = match raw {
            serde_yaml::Value::Sequence(_) | serde_yaml::Value::Mapping(_) => serde_yaml::from_value(raw.clone())
                .map_err(|e| {
                    BuildError::definition(
                        subject,
                        format!("sweep parameter '{name}' must be a list, {{dir: ...}} or {{lines: ...}}: {e}"),
                    )
                })?,
            // A bare scalar is a one-value sweep.
            scalar => {
                let value: Value = serde_yaml::from_value(scalar.clone())
                    .map_err(|e| BuildError::definition(subject, format!("sweep parameter '{name}': {e}")))?;
                SweepSource::List(vec![value])
            }
        };

        let values = source.materialize(base_dir, subject)?;
        sweep.push(owner, name, values)?;
    }
    Ok(sweep)
}

fn run_spec(decl: &RunDecl, base_dir: &Path) -> Result<RunSpec> {
    let subject = format!("run '{}'", decl.name);
    if decl.name.trim().is_empty() {
        return Err(BuildError::definition("lab file", "run name must not be empty"));
    }

    Ok(RunSpec {
        name: decl.name.clone(),
        pipelines: decl.pipelines.clone(),
        sweep: sweep_spec(&subject, &decl.name, &decl.params, base_dir)?,
        dependencies: decl
            .dependencies
            .iter()
            .map(|d| run_dependency(&subject, d))
            .collect::<Result<Vec<_>>>()?,
        containerized: decl.containerized,
        image: decl.image.clone(),
        inputs: decl.inputs.clone(),
        resources: decl.resources.clone().unwrap_or_default(),
    })
}
