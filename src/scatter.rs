// src/scatter.rs
//
// =============================================================================
// REPX-LAB: SCATTER-GATHER DAG VALIDATOR
// =============================================================================
//
// A fan-out stage is one job with three phases:
//
//   scatter ──(work item)──▶ [ step DAG per branch ] ──(sink output)──▶ gather
//
// Checks, in this order:
// 1. scatter declares both `work__items` and `worker__arg`.
// 2. gather declares `worker__outs`.
// 3. at least one root step, then no cycles among steps.
// 4. exactly one sink step.
// 5. some root step declares `worker__item`.
// Then every step is wired with the dependency rules, the gather phase gets
// the sink output, and the whole thing becomes a `ScatterGatherPlan`.

use crate::core::{InputMapping, InputSource, Params};
use crate::error::{quoted, BuildError, Result};
use crate::resources::{merge_all, ResourceHint};
use crate::stage::{render_body, ResolvedKind, ResolvedPhase, ResolvedStage, ResolvedStep};
use crate::wiring::{DepExpr, ExternalInputs, Link, Producer, Wiring};
use crate::workflow::topo_order;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Scatter output holding the list of work items.
pub const WORK_ITEMS_OUTPUT: &str = "work__items";
/// Scatter output holding the argument shared by every branch.
pub const WORKER_ARG_OUTPUT: &str = "worker__arg";
/// Step input fed with the branch's work item.
pub const WORK_ITEM_INPUT: &str = "worker__item";
/// Gather input fed with the manifest of all sink outputs.
pub const WORK_RESULTS_INPUT: &str = "worker__outs";

/// Placeholder for a branch's step output directory in output templates.
const OUT_PLACEHOLDER: &str = "$out";

// ============================================================================
// 1. PLAN
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PhasePlan {
    pub inputs: Vec<InputMapping>,
    pub outputs: BTreeMap<String, String>,
    pub resources: ResourceHint,
    pub script: String,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepPlan {
    pub deps: Vec<String>,
    #[serde(flatten)]
    pub phase: PhasePlan,
}

/// Validated and wired fan-out job body.
#[derive(Debug, Clone, Serialize)]
pub struct ScatterGatherPlan {
    pub scatter: PhasePlan,
    pub steps: BTreeMap<String, StepPlan>,
    /// Deterministic topological order of the step DAG.
    pub order: Vec<String>,
    pub sink_step: String,
    pub gather: PhasePlan,
}

impl ScatterGatherPlan {
    pub fn sink_output(&self) -> Option<(&String, &String)> {
        self.steps
            .get(&self.sink_step)
            .and_then(|s| s.phase.outputs.iter().next())
    }

    /// What the gather phase reads from `worker__outs`: one entry per branch,
    /// the sink output template resolved against that branch's directory.
    pub fn work_results_manifest<P: AsRef<Path>>(&self, branch_roots: &[P]) -> Vec<BTreeMap<String, String>> {
        let Some((name, template)) = self.sink_output() else {
            return Vec::new();
        };
        branch_roots
            .iter()
            .map(|root| {
                let out_dir = root
                    .as_ref()
                    .join(format!("step-{}", self.sink_step))
                    .join("out");
                let resolved = template.replace(OUT_PLACEHOLDER, &out_dir.to_string_lossy());
                BTreeMap::from([(name.clone(), resolved)])
            })
            .collect()
    }

    /// Executable name of a phase inside the job's `bin/` directory.
    pub fn exe_name(phase: &str) -> String {
        format!("{phase}.sh")
    }

    /// The `steps.json` document packaged with the job.
    pub fn steps_metadata(&self) -> Value {
        let mut steps = Map::new();
        for (name, step) in &self.steps {
            let mut entry = Map::new();
            entry.insert(
                "exe_path".into(),
                Value::String(format!("bin/{}", Self::exe_name(&format!("step-{name}")))),
            );
            entry.insert("deps".into(), json!(step.deps));
            entry.insert("outputs".into(), json!(step.phase.outputs));
            entry.insert(
                "inputs".into(),
                Value::Array(step.phase.inputs.iter().map(InputMapping::to_metadata).collect()),
            );
            if let Some(hints) = step.phase.resources.to_metadata() {
                entry.insert("resource_hints".into(), hints);
            }
            steps.insert(name.clone(), Value::Object(entry));
        }
        json!({
            "steps": steps,
            "order": self.order,
            "sink_step": self.sink_step,
        })
    }
}

// ============================================================================
// 2. VALIDATION
// ============================================================================

fn require_slot(subject: &str, declared: bool, phase: &str, slot: &str) -> Result<()> {
    if declared {
        return Ok(());
    }
    Err(BuildError::definition(
        subject,
        format!("{phase} phase must declare '{slot}'"),
    ))
}

/// Step DAG facts the planner needs: topological order, the sink and the
/// deps of each step by name.
struct StepGraph {
    order: Vec<String>,
    sink: String,
}

fn analyse_steps(subject: &str, steps: &BTreeMap<String, ResolvedStep>) -> Result<StepGraph> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let index: HashMap<&str, NodeIndex> = steps
        .keys()
        .map(|name| (name.as_str(), graph.add_node(name.as_str())))
        .collect();

    for (name, step) in steps {
        for dep in &step.deps {
            let producer = dep.producer();
            let from = index.get(producer).ok_or_else(|| {
                BuildError::wiring(
                    format!("{subject} step '{name}'"),
                    format!("depends on unknown step '{producer}' (steps: {})", quoted(steps.keys())),
                )
            })?;
            graph.update_edge(*from, index[name.as_str()], ());
        }
    }

    let roots: Vec<&str> = steps
        .iter()
        .filter(|(_, s)| s.deps.is_empty())
        .map(|(n, _)| n.as_str())
        .collect();
    if roots.is_empty() {
        return Err(BuildError::topology(
            subject,
            "no root step (every step has dependencies)",
        ));
    }

    let order = topo_order(&graph).map_err(|cyclic| {
        let names: Vec<&str> = cyclic.iter().map(|n| graph[*n]).collect();
        BuildError::topology(subject, format!("step dependency cycle between {}", quoted(&names)))
    })?;

    let depended_on: BTreeSet<&str> = steps
        .values()
        .flat_map(|s| s.deps.iter().map(DepExpr::producer))
        .collect();
    let sinks: Vec<&str> = steps
        .keys()
        .map(String::as_str)
        .filter(|n| !depended_on.contains(n))
        .collect();
    let sink = match sinks.as_slice() {
        [one] => one.to_string(),
        _ => {
            return Err(BuildError::topology(
                subject,
                format!("expected exactly one sink step, found {} ({})", sinks.len(), quoted(&sinks)),
            ))
        }
    };

    if !roots
        .iter()
        .any(|r| steps[*r].phase.inputs.contains_key(WORK_ITEM_INPUT))
    {
        return Err(BuildError::wiring(
            subject,
            format!("no root step declares '{WORK_ITEM_INPUT}' (roots: {})", quoted(&roots)),
        ));
    }

    Ok(StepGraph {
        order: order.into_iter().map(|n| graph[n].to_string()).collect(),
        sink,
    })
}

// ============================================================================
// 3. PLANNING
// ============================================================================

fn phase_plan(
    subject: &str,
    phase: &ResolvedPhase,
    params: &Params,
    base: &ResourceHint,
    inputs: Vec<InputMapping>,
) -> Result<PhasePlan> {
    let mut tools = phase.run_dependencies.clone();
    tools.sort();
    tools.dedup();
    Ok(PhasePlan {
        inputs,
        outputs: phase.outputs.clone(),
        resources: merge_all([base], &phase.resources),
        script: render_body(subject, &phase.run, params, &phase.inputs, &phase.outputs)?,
        tools,
    })
}

/// Validates a resolved fan-out stage and wires its phases.
///
/// `job_inputs` are the mappings the pipeline wired for the scatter phase;
/// they also serve as the external table for steps and gather. `base` is the
/// hint every phase inherits (run hint merged with the stage hint).
pub fn plan(stage: &ResolvedStage, job_inputs: &[InputMapping], base: &ResourceHint) -> Result<ScatterGatherPlan> {
    let subject = stage.subject();
    let ResolvedKind::ScatterGather { scatter, steps, gather } = &stage.kind else {
        return Err(BuildError::definition(&subject, "not a scatter-gather stage"));
    };

    require_slot(&subject, scatter.outputs.contains_key(WORK_ITEMS_OUTPUT), "scatter", WORK_ITEMS_OUTPUT)?;
    require_slot(&subject, scatter.outputs.contains_key(WORKER_ARG_OUTPUT), "scatter", WORKER_ARG_OUTPUT)?;
    require_slot(&subject, gather.inputs.contains_key(WORK_RESULTS_INPUT), "gather", WORK_RESULTS_INPUT)?;

    let graph = analyse_steps(&subject, steps)?;
    let external: ExternalInputs = job_inputs.iter().cloned().collect();

    let mut step_plans = BTreeMap::new();
    for name in &graph.order {
        let step = &steps[name];
        let step_subject = format!("{subject} step '{name}'");

        let links: Vec<Link<'_>> = step
            .deps
            .iter()
            .map(|dep| {
                let producer = Producer {
                    label: format!("step '{}'", dep.producer()),
                    source: InputSource::Step {
                        step: dep.producer().to_string(),
                    },
                    outputs: &steps[dep.producer()].phase.outputs,
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

        let mut wiring = Wiring::new(&step_subject, &step.phase.inputs);
        for link in &links {
            wiring.link(link)?;
        }
        if wiring.unmet().iter().any(|n| n == WORK_ITEM_INPUT) {
            wiring.push(InputMapping::new(InputSource::WorkItem, None, WORK_ITEM_INPUT));
        }
        wiring.fill_from(&external);
        let inputs = wiring.finish()?;

        let mut deps: Vec<String> = step.deps.iter().map(|d| d.producer().to_string()).collect();
        deps.sort();
        deps.dedup();

        step_plans.insert(
            name.clone(),
            StepPlan {
                deps,
                phase: phase_plan(&step_subject, &step.phase, &stage.params, base, inputs)?,
            },
        );
        log::trace!("{step_subject}: wired");
    }

    let sink_outputs = &steps[&graph.sink].phase.outputs;
    let sink_output = match sink_outputs.keys().collect::<Vec<_>>().as_slice() {
        [one] => (*one).clone(),
        _ => {
            return Err(BuildError::wiring(
                format!("{subject} step '{}'", graph.sink),
                format!(
                    "sink step must declare exactly one output, found {} ({})",
                    sink_outputs.len(),
                    quoted(sink_outputs.keys())
                ),
            ))
        }
    };

    let gather_subject = format!("{subject} gather");
    let mut wiring = Wiring::new(&gather_subject, &gather.inputs);
    wiring.push(InputMapping::new(
        InputSource::SinkOutputs {
            step: graph.sink.clone(),
        },
        Some(sink_output),
        WORK_RESULTS_INPUT,
    ));
    wiring.fill_from(&external);
    let gather_inputs = wiring.finish()?;

    log::debug!(
        "{}: {} step(s), order [{}], sink '{}'",
        subject,
        graph.order.len(),
        graph.order.join(", "),
        graph.sink
    );

    Ok(ScatterGatherPlan {
        scatter: phase_plan(
            &format!("{subject} scatter"),
            scatter,
            &stage.params,
            base,
            job_inputs.to_vec(),
        )?,
        steps: step_plans,
        order: graph.order,
        sink_step: graph.sink,
        gather: phase_plan(&gather_subject, gather, &stage.params, base, gather_inputs)?,
    })
}

impl ScatterGatherPlan {
    /// Hint of the whole job: the maximum over every phase.
    pub fn job_resources(&self) -> ResourceHint {
        let phases = std::iter::once(&self.scatter.resources)
            .chain(self.steps.values().map(|s| &s.phase.resources))
            .chain(std::iter::once(&self.gather.resources));
        merge_all(phases, &ResourceHint::default())
    }

    /// Tools of every phase, sorted and deduplicated.
    pub fn tools(&self) -> Vec<String> {
        let set: BTreeSet<&String> = self
            .scatter
            .tools
            .iter()
            .chain(self.steps.values().flat_map(|s| s.phase.tools.iter()))
            .chain(self.gather.tools.iter())
            .collect();
        set.into_iter().cloned().collect()
    }
}
