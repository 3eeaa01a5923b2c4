// src/lab.rs
//
// =============================================================================
// REPX-LAB: LAB EVALUATION
// =============================================================================
//
// Ties the resolution pieces together:
//
//   LabSpec ──▶ RunGraph (order) ──▶ per run: sweep × pipelines ──▶ Jobs
//                                            ▲
//                 hard upstream terminal outputs + run literals
//
// The result (`ResolvedLab`) is everything the packager needs; no file is
// touched here except sweep sources, which the loader already materialised.

use crate::core::{DependencyKind, InputMapping, InputSource, Job, JobId};
use crate::error::{BuildError, Result};
use crate::params::{expand_sweep, SweepSpec};
use crate::pipeline::{EvalContext, PipelineRegistry};
use crate::resources::{ResourceDecl, ResourceHint};
use crate::stage::is_path_safe;
use crate::wiring::ExternalInputs;
use crate::workflow::{validate_names, RunEdge, RunGraph};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

// ============================================================================
// 1. DECLARATIONS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageSpec {
    /// Layer tarballs, bottom first.
    pub layers: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub pipelines: Vec<String>,
    pub sweep: SweepSpec,
    pub dependencies: Vec<(String, DependencyKind)>,
    pub containerized: bool,
    pub image: Option<String>,
    /// Literal values offered to unmet inputs.
    pub inputs: BTreeMap<String, Value>,
    pub resources: ResourceDecl,
}

impl RunSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipelines.push(name.into());
        self
    }

    pub fn depends_on(mut self, run: impl Into<String>, kind: DependencyKind) -> Self {
        self.dependencies.push((run.into(), kind));
        self
    }

    pub fn input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    fn subject(&self) -> String {
        format!("run '{}'", self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LabSpec {
    pub name: String,
    pub version: String,
    /// Tool name -> host file.
    pub tools: BTreeMap<String, PathBuf>,
    pub images: BTreeMap<String, ImageSpec>,
    pub registry: PipelineRegistry,
    pub runs: Vec<RunSpec>,
    pub groups: BTreeMap<String, Vec<String>>,
}

// ============================================================================
// 2. RESOLVED FORM
// ============================================================================

#[derive(Debug, Clone)]
pub struct ResolvedRun {
    pub name: String,
    pub dependencies: BTreeMap<String, DependencyKind>,
    pub containerized: bool,
    pub image: Option<String>,
    /// Unique jobs in first-seen order.
    pub jobs: Vec<Job>,
    /// Jobs no other job of this run reads from.
    pub terminal: Vec<JobId>,
}

impl ResolvedRun {
    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    pub fn terminal_jobs(&self) -> impl Iterator<Item = &Job> {
        self.terminal.iter().filter_map(|id| self.job(id))
    }

    /// Tools required by any job of the run.
    pub fn tools(&self) -> BTreeSet<&str> {
        self.jobs
            .iter()
            .flat_map(|j| j.tools.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedLab {
    pub name: String,
    pub version: String,
    pub tools: BTreeMap<String, PathBuf>,
    pub images: BTreeMap<String, ImageSpec>,
    /// In scheduled (dependency) order.
    pub runs: Vec<ResolvedRun>,
    pub groups: BTreeMap<String, Vec<String>>,
}

impl ResolvedLab {
    pub fn run(&self, name: &str) -> Option<&ResolvedRun> {
        self.runs.iter().find(|r| r.name == name)
    }

    /// Every distinct job of the lab, by id.
    pub fn unique_jobs(&self) -> BTreeMap<&JobId, &Job> {
        self.runs
            .iter()
            .flat_map(|r| r.jobs.iter())
            .map(|j| (&j.id, j))
            .collect()
    }
}

// ============================================================================
// 3. EVALUATION
// ============================================================================

/// One candidate per output name exposed by the terminal jobs of `upstream`.
fn upstream_candidates(upstream: &ResolvedRun) -> Vec<InputMapping> {
    let mut by_output: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for job in upstream.terminal_jobs() {
        for output in job.outputs.keys() {
            by_output.entry(output).or_default().insert(&job.name);
        }
    }
    by_output
        .into_iter()
        .map(|(output, stages)| {
            InputMapping::new(
                InputSource::Run {
                    run: upstream.name.clone(),
                    stage_filter: stages.into_iter().map(str::to_string).collect(),
                },
                Some(output.to_string()),
                output,
            )
        })
        .collect()
}

fn terminal_ids(jobs: &[Job]) -> Vec<JobId> {
    let consumed: HashSet<&JobId> = jobs.iter().flat_map(Job::producers).collect();
    jobs.iter()
        .filter(|j| !consumed.contains(&j.id))
        .map(|j| j.id.clone())
        .collect()
}

impl LabSpec {
    fn check_run(&self, run: &RunSpec) -> Result<()> {
        let subject = run.subject();
        if !is_path_safe(&run.name) {
            return Err(BuildError::validation(
                &subject,
                "run name must be non-empty without '/' or whitespace",
            ));
        }
        for p in &run.pipelines {
            if !self.registry.pipelines.contains_key(p) {
                return Err(BuildError::definition(&subject, format!("references unknown pipeline '{p}'")));
            }
        }
        if run.pipelines.is_empty() {
            return Err(BuildError::definition(&subject, "run lists no pipelines"));
        }
        match (&run.image, run.containerized) {
            (Some(image), _) if !self.images.contains_key(image) => Err(BuildError::definition(
                &subject,
                format!("references unknown image '{image}'"),
            )),
            (None, true) => Err(BuildError::validation(
                &subject,
                "containerized run needs an 'image'",
            )),
            _ => Ok(()),
        }
    }

    fn check_tools(&self, run: &ResolvedRun) -> Result<()> {
        for job in &run.jobs {
            if let Some(missing) = job.tools.iter().find(|t| !self.tools.contains_key(*t)) {
                return Err(BuildError::definition(
                    format!("stage '{}'", job.name),
                    format!("requires tool '{missing}', which the lab does not declare"),
                ));
            }
        }
        Ok(())
    }

    /// Evaluates every run in dependency order. Any error aborts the whole
    /// evaluation.
    pub fn evaluate(&self) -> Result<ResolvedLab> {
        let mut graph = RunGraph::new(self.runs.iter().map(|r| r.name.clone()))?;
        for run in &self.runs {
            self.check_run(run)?;
            for (dep, kind) in &run.dependencies {
                graph.add_edge(RunEdge {
                    from: dep.clone(),
                    to: run.name.clone(),
                    kind: *kind,
                })?;
            }
        }

        let specs: BTreeMap<&str, &RunSpec> = self.runs.iter().map(|r| (r.name.as_str(), r)).collect();

        let evaluated = graph.evaluate(|name, upstream| {
            let spec = specs
                .get(name)
                .ok_or_else(|| BuildError::definition(format!("run '{name}'"), "run disappeared from the registry"))?;
            let subject = spec.subject();
            let resources: ResourceHint = spec.resources.parse(&subject)?;

            let mut external: ExternalInputs = spec
                .inputs
                .iter()
                .map(|(k, v)| InputMapping::new(InputSource::Literal { value: v.clone() }, None, k))
                .collect();
            for (_, up) in upstream.hard() {
                for m in upstream_candidates(up) {
                    external.add(m);
                }
            }

            let ctx = EvalContext {
                run: name,
                resources: &resources,
                external: &external,
            };

            let mut jobs: Vec<Job> = Vec::new();
            let mut seen: HashSet<JobId> = HashSet::new();
            let assignments = expand_sweep(&spec.sweep);
            for assignment in &assignments {
                for pipeline_name in &spec.pipelines {
                    let pipeline = self.registry.pipelines.get(pipeline_name).ok_or_else(|| {
                        BuildError::definition(&subject, format!("references unknown pipeline '{pipeline_name}'"))
                    })?;
                    for job in pipeline.evaluate(&ctx, assignment)? {
                        if seen.insert(job.id.clone()) {
                            jobs.push(job);
                        }
                    }
                }
            }

            let resolved = ResolvedRun {
                name: name.to_string(),
                dependencies: upstream.all().map(|(n, k, _)| (n.to_string(), k)).collect(),
                containerized: spec.containerized,
                image: spec.image.clone(),
                terminal: terminal_ids(&jobs),
                jobs,
            };
            self.check_tools(&resolved)?;

            log::info!(
                "Run '{}': {} assignment(s), {} job(s), {} terminal",
                name,
                assignments.len(),
                resolved.jobs.len(),
                resolved.terminal.len()
            );
            Ok(resolved)
        })?;

        let names: Vec<String> = evaluated.iter().map(|(n, _)| n.clone()).collect();
        validate_names(&names, &self.groups)?;

        Ok(ResolvedLab {
            name: self.name.clone(),
            version: self.version.clone(),
            tools: self.tools.clone(),
            images: self.images.clone(),
            runs: evaluated.into_iter().map(|(_, r)| r).collect(),
            groups: self.groups.clone(),
        })
    }
}
