// src/core.rs
//
// =============================================================================
// REPX-LAB: CORE SCHEMA
// =============================================================================
//
// The data contracts between graph resolution and packaging.
//
// Design Principles:
// 1. Newtype Pattern: job ids and dependency kinds are not bare strings.
// 2. Immutability: a Job is sealed once, with its identity hash computed
//    from everything that went into it.
// 3. Determinism: every map is a BTreeMap so canonical JSON is stable.

use crate::error::{BuildError, Result};
use crate::provenance::sha256_bytes;
use crate::resources::ResourceHint;
use crate::scatter::ScatterGatherPlan;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A concrete parameter assignment (name -> value).
pub type Params = BTreeMap<String, Value>;

/// Hex characters of the identity hash kept in a job id.
pub const JOB_HASH_LEN: usize = 32;

// ============================================================================
// 1. IDENTIFIERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// The identity hash part (everything before the first '-').
    pub fn hash(&self) -> &str {
        self.0.split_once('-').map(|(h, _)| h).unwrap_or(&self.0)
    }

    /// `abcdef1-name` form for log lines.
    pub fn short_id(&self) -> String {
        match self.0.split_once('-') {
            Some((hash, rest)) if hash.len() >= 7 => format!("{}-{}", &hash[..7], rest),
            _ => self.0.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StageType {
    #[default]
    Simple,
    ScatterGather,
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageType::Simple => write!(f, "simple"),
            StageType::ScatterGather => write!(f, "scatter-gather"),
        }
    }
}

/// Run-level dependency flavour.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Upstream jobs are passed as data inputs.
    #[default]
    Hard,
    /// Ordering and provenance only.
    Soft,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::Hard => write!(f, "hard"),
            DependencyKind::Soft => write!(f, "soft"),
        }
    }
}

impl FromStr for DependencyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "hard" => Ok(DependencyKind::Hard),
            "soft" => Ok(DependencyKind::Soft),
            other => Err(format!(
                "invalid dependency type '{other}'. Valid values are: hard, soft"
            )),
        }
    }
}

// ============================================================================
// 2. INPUT MAPPINGS
// ============================================================================

/// Where a job (or a fan-out phase) gets one of its inputs from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSource {
    /// An earlier job of the same pipeline.
    Job { job_id: JobId },
    /// Every matching job of a hard upstream run.
    Run {
        run: String,
        stage_filter: Vec<String>,
    },
    /// A run-level literal (file path, string, number...).
    Literal { value: Value },
    /// The current work item of a scatter branch.
    WorkItem,
    /// Another step of the same fan-out branch.
    Step { step: String },
    /// Result manifest of all sink-step outputs, for the gather phase.
    SinkOutputs { step: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMapping {
    pub source: InputSource,
    pub source_output: Option<String>,
    pub target_input: String,
}

impl InputMapping {
    pub fn new(
        source: InputSource,
        source_output: Option<String>,
        target_input: impl Into<String>,
    ) -> Self {
        Self {
            source,
            source_output,
            target_input: target_input.into(),
        }
    }

    /// Human-readable origin, used in ambiguity messages.
    pub fn describe(&self) -> String {
        let out = self.source_output.as_deref().unwrap_or("-");
        match &self.source {
            InputSource::Job { job_id } => format!("job '{}' output '{}'", job_id.short_id(), out),
            InputSource::Run { run, .. } => format!("run '{}' output '{}'", run, out),
            InputSource::Literal { value } => format!("literal {}", value),
            InputSource::WorkItem => "scatter work item".to_string(),
            InputSource::Step { step } => format!("step '{}' output '{}'", step, out),
            InputSource::SinkOutputs { step } => format!("sink step '{}' results", step),
        }
    }

    /// The shape the execution engine reads from run metadata.
    pub fn to_metadata(&self) -> Value {
        match &self.source {
            InputSource::Job { job_id } => json!({
                "job_id": job_id,
                "source_output": self.source_output,
                "target_input": self.target_input,
                "type": "intra-pipeline",
            }),
            InputSource::Run { run, stage_filter } => json!({
                "source_run": run,
                "source_stage_filter": stage_filter.join(","),
                "source_output": self.source_output,
                "target_input": self.target_input,
                "type": "inter-run",
                "dependency_type": DependencyKind::Hard,
            }),
            InputSource::Literal { value } => json!({
                "source": "literal",
                "value": value,
                "target_input": self.target_input,
            }),
            InputSource::WorkItem => json!({
                "source": "scatter:work_item",
                "target_input": self.target_input,
            }),
            InputSource::Step { step } => json!({
                "source": format!("step:{step}"),
                "source_output": self.source_output,
                "target_input": self.target_input,
            }),
            InputSource::SinkOutputs { step } => json!({
                "source": format!("gather:{step}"),
                "source_output": self.source_output,
                "target_input": self.target_input,
            }),
        }
    }
}

// ============================================================================
// 3. THE JOB (Resolved Stage)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "stage_type", rename_all = "kebab-case")]
pub enum JobBody {
    Simple { script: String },
    ScatterGather(ScatterGatherPlan),
}

/// Everything a job is made of, before it gets an identity.
#[derive(Debug, Clone, Serialize)]
pub struct JobDraft {
    pub name: String,
    pub stage: String,
    pub version: Option<String>,
    pub params: Params,
    pub effective_params: Params,
    pub inputs: Vec<InputMapping>,
    pub outputs: BTreeMap<String, String>,
    pub resources: ResourceHint,
    pub tools: Vec<String>,
    pub body: JobBody,
}

/// A stage instantiated against one parameter set and one set of input sources.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub stage: String,
    pub version: Option<String>,
    pub params: Params,
    pub effective_params: Params,
    pub inputs: Vec<InputMapping>,
    pub outputs: BTreeMap<String, String>,
    pub resources: ResourceHint,
    pub tools: Vec<String>,
    pub body: JobBody,
}

/// The part of a job that determines its identity. Effective params are
/// derived from producers, whose ids are already in `inputs`.
#[derive(Serialize)]
struct IdentityPayload<'a> {
    name: &'a str,
    version: &'a Option<String>,
    params: &'a Params,
    inputs: &'a [InputMapping],
    outputs: &'a BTreeMap<String, String>,
    resources: &'a ResourceHint,
    tools: &'a [String],
    body: &'a JobBody,
}

impl JobDraft {
    /// Computes the content hash and freezes the job.
    pub fn seal(mut self) -> Result<Job> {
        self.inputs
            .sort_by(|a, b| a.target_input.cmp(&b.target_input));
        self.tools.sort();
        self.tools.dedup();

        let payload = IdentityPayload {
            name: &self.name,
            version: &self.version,
            params: &self.params,
            inputs: &self.inputs,
            outputs: &self.outputs,
            resources: &self.resources,
            tools: &self.tools,
            body: &self.body,
        };
        let canonical = serde_json::to_vec(&payload)
            .map_err(|e| BuildError::parse(format!("identity of stage '{}'", self.name), e))?;
        let hash = sha256_bytes(&canonical);

        let id = match &self.version {
            Some(v) => format!("{}-{}-{}", &hash[..JOB_HASH_LEN], self.name, v),
            None => format!("{}-{}", &hash[..JOB_HASH_LEN], self.name),
        };

        Ok(Job {
            id: JobId(id),
            name: self.name,
            stage: self.stage,
            version: self.version,
            params: self.params,
            effective_params: self.effective_params,
            inputs: self.inputs,
            outputs: self.outputs,
            resources: self.resources,
            tools: self.tools,
            body: self.body,
        })
    }
}

impl Job {
    pub fn stage_type(&self) -> StageType {
        match self.body {
            JobBody::Simple { .. } => StageType::Simple,
            JobBody::ScatterGather(_) => StageType::ScatterGather,
        }
    }

    /// Jobs of the same pipeline this job reads from.
    pub fn producers(&self) -> impl Iterator<Item = &JobId> {
        self.inputs.iter().filter_map(|m| match &m.source {
            InputSource::Job { job_id } => Some(job_id),
            _ => None,
        })
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|m| m.target_input.as_str())
    }
}
