// src/pipeline.rs
//
// =============================================================================
// REPX-LAB: PIPELINES
// =============================================================================
//
// A pipeline is an ordered list of stage instantiations, each naming the
// earlier instantiations it reads from.
//
// Built in two phases:
// 1. Register: every stage and every pipeline declaration is recorded under
//    its name, nothing is resolved yet.
// 2. Link: once the registry is complete, each entry's stage and producer
//    references are resolved. A producer must be declared earlier in the
//    same pipeline.
//
// Evaluation then instantiates every entry for one parameter assignment,
// wires it against its producers and seals it into a Job.

use crate::core::{InputSource, Job, JobBody, JobDraft, JobId, Params};
use crate::error::{quoted, BuildError, Result};
use crate::params::effective_params;
use crate::resources::{merge_all, ResourceHint};
use crate::scatter;
use crate::stage::{render_body, ResolvedKind, StageSpec};
use crate::wiring::{wire, DepExpr, ExternalInputs, Link, Producer};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// ============================================================================
// 1. DECLARATIONS
// ============================================================================

/// One line of a pipeline declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDecl {
    /// Defaults to the stage id.
    pub id: Option<String>,
    pub stage: String,
    pub deps: Vec<DepExpr>,
}

impl EntryDecl {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            id: None,
            stage: stage.into(),
            deps: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn dep(mut self, dep: DepExpr) -> Self {
        self.deps.push(dep);
        self
    }

    pub fn entry_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.stage)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDecl {
    pub name: String,
    pub entries: Vec<EntryDecl>,
}

// ============================================================================
// 2. LINKED PIPELINES
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineNode {
    pub id: String,
    pub stage: Arc<StageSpec>,
    /// (index of the producing node, how to wire it)
    pub deps: Vec<(usize, DepExpr)>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub nodes: Vec<PipelineNode>,
}

/// Phase 1 of the builder.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: BTreeMap<String, Arc<StageSpec>>,
    pending: Vec<PipelineDecl>,
}

/// The completed registry of stages and linked pipelines.
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pub stages: BTreeMap<String, Arc<StageSpec>>,
    pub pipelines: BTreeMap<String, Pipeline>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, spec: StageSpec) -> Result<()> {
        if self.stages.contains_key(&spec.id) {
            return Err(BuildError::definition(
                format!("stage '{}'", spec.id),
                "stage id is declared more than once",
            ));
        }
        self.stages.insert(spec.id.clone(), Arc::new(spec));
        Ok(())
    }

    pub fn pipeline(&mut self, decl: PipelineDecl) -> Result<()> {
        if self.pending.iter().any(|p| p.name == decl.name) {
            return Err(BuildError::definition(
                format!("pipeline '{}'", decl.name),
                "pipeline name is declared more than once",
            ));
        }
        self.pending.push(decl);
        Ok(())
    }

    /// Phase 2: resolves every reference against the complete registry.
    pub fn build(self) -> Result<PipelineRegistry> {
        let mut pipelines = BTreeMap::new();
        for decl in self.pending {
            let pipeline = link_pipeline(&self.stages, decl)?;
            pipelines.insert(pipeline.name.clone(), pipeline);
        }
        Ok(PipelineRegistry {
            stages: self.stages,
            pipelines,
        })
    }
}

fn link_pipeline(stages: &BTreeMap<String, Arc<StageSpec>>, decl: PipelineDecl) -> Result<Pipeline> {
    let subject = format!("pipeline '{}'", decl.name);
    if decl.entries.is_empty() {
        return Err(BuildError::definition(&subject, "pipeline has no stages"));
    }

    let all_ids: Vec<&str> = decl.entries.iter().map(EntryDecl::entry_id).collect();
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut nodes = Vec::with_capacity(decl.entries.len());

    for (idx, entry) in decl.entries.iter().enumerate() {
        let entry_id = entry.entry_id();
        let stage = stages.get(&entry.stage).ok_or_else(|| {
            BuildError::definition(
                &subject,
                format!("entry '{}' references unknown stage '{}'", entry_id, entry.stage),
            )
        })?;

        let mut deps = Vec::with_capacity(entry.deps.len());
        for dep in &entry.deps {
            let producer = dep.producer();
            match position.get(producer) {
                Some(&p) => deps.push((p, dep.clone())),
                None if all_ids.contains(&producer) => {
                    return Err(BuildError::topology(
                        &subject,
                        format!(
                            "entry '{entry_id}' depends on '{producer}', which is not declared before it"
                        ),
                    ))
                }
                None => {
                    return Err(BuildError::wiring(
                        &subject,
                        format!(
                            "entry '{entry_id}' depends on unknown entry '{producer}' (entries: {})",
                            quoted(&all_ids)
                        ),
                    ))
                }
            }
        }

        if position.insert(entry_id, idx).is_some() {
            return Err(BuildError::definition(
                &subject,
                format!("entry id '{entry_id}' is used more than once"),
            ));
        }
        nodes.push(PipelineNode {
            id: entry_id.to_string(),
            stage: Arc::clone(stage),
            deps,
        });
    }

    Ok(Pipeline {
        name: decl.name,
        nodes,
    })
}

// ============================================================================
// 3. EVALUATION
// ============================================================================

/// Run-level context shared by every pipeline of a run.
pub struct EvalContext<'a> {
    pub run: &'a str,
    pub resources: &'a ResourceHint,
    pub external: &'a ExternalInputs,
}

impl Pipeline {
    /// Instantiates every entry for `assignment`, in declaration order.
    pub fn evaluate(&self, ctx: &EvalContext<'_>, assignment: &Params) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let job = self
                .evaluate_node(node, &jobs, ctx, assignment)
                .map_err(|e| e.push_context(format!("in pipeline '{}' of run '{}'", self.name, ctx.run)))?;
            log::trace!("{}: {} -> {}", ctx.run, node.id, job.id.short_id());
            jobs.push(job);
        }
        Ok(jobs)
    }

    fn evaluate_node(
        &self,
        node: &PipelineNode,
        done: &[Job],
        ctx: &EvalContext<'_>,
        assignment: &Params,
    ) -> Result<Job> {
        let resolved = node.stage.resolve(assignment)?;
        let subject = resolved.subject();

        let links: Vec<Link<'_>> = node
            .deps
            .iter()
            .map(|(idx, dep)| {
                let upstream = &done[*idx];
                let producer = Producer {
                    label: format!("stage '{}'", upstream.name),
                    source: InputSource::Job {
                        job_id: upstream.id.clone(),
                    },
                    outputs: &upstream.outputs,
                };
                match dep {
                    DepExpr::Producer(_) => Link::Implicit(producer),
                    DepExpr::Triple { output, input, .. } => Link::Explicit {
                        producer,
                        output: output.clone(),
                        input: input.clone(),
                    },
                }
            })
            .collect();

        let inputs = wire(&subject, resolved.inputs(), &links, ctx.external)?;

        let by_id: HashMap<&JobId, &Job> = done.iter().map(|j| (&j.id, j)).collect();
        let mut producers: Vec<&JobId> = Vec::new();
        for m in &inputs {
            if let InputSource::Job { job_id } = &m.source {
                if !producers.contains(&job_id) {
                    producers.push(job_id);
                }
            }
        }
        let effective = effective_params(
            &resolved.params,
            producers
                .iter()
                .filter_map(|id| by_id.get(id))
                .map(|j| &j.effective_params),
        );

        let resources = merge_all([ctx.resources], &resolved.resources);
        let mut tools = resolved.run_dependencies.clone();

        let body = match &resolved.kind {
            ResolvedKind::Simple(phase) => JobBody::Simple {
                script: render_body(&subject, &phase.run, &resolved.params, &phase.inputs, &phase.outputs)?,
            },
            ResolvedKind::ScatterGather { .. } => {
                let plan = scatter::plan(&resolved, &inputs, &resources)?;
                tools.extend(plan.tools());
                JobBody::ScatterGather(plan)
            }
        };

        JobDraft {
            name: resolved.name.clone(),
            stage: resolved.stage_id.clone(),
            version: resolved.version.clone(),
            outputs: resolved.outputs().clone(),
            params: resolved.params,
            effective_params: effective,
            inputs,
            resources,
            tools,
            body,
        }
        .seal()
    }
}
