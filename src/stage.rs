// src/stage.rs
//
// =============================================================================
// REPX-LAB: STAGE RESOLVER
// =============================================================================
//
// Responsibilities:
// 1. Validate a stage declaration against the allowed keys of its type.
// 2. Model fields that are either literals or functions of the parameters.
// 3. Resolve a stage against one parameter assignment: concrete name,
//    inputs, outputs, resource hint and rendered executable body.

use crate::core::Params;
use crate::error::{quoted, BuildError, Result};
use crate::resources::{ResourceDecl, ResourceHint};
use crate::wiring::DepExpr;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

pub const SIMPLE_STAGE_KEYS: &[&str] = &[
    "name",
    "version",
    "params",
    "inputs",
    "outputs",
    "resources",
    "run",
    "runDependencies",
];

pub const SCATTER_GATHER_STAGE_KEYS: &[&str] = &[
    "name",
    "version",
    "params",
    "resources",
    "scatter",
    "steps",
    "gather",
    "runDependencies",
];

pub const PHASE_KEYS: &[&str] = &["inputs", "outputs", "resources", "run", "runDependencies"];

pub const STEP_KEYS: &[&str] = &["inputs", "outputs", "resources", "run", "runDependencies", "deps"];

/// Shell prologue of every packaged executable. The execution engine calls
/// it as `<exe> <out-dir> <inputs.json>`.
pub const SCRIPT_PREAMBLE: &str = r#"#!/usr/bin/env bash
set -euo pipefail
out="$1"
inputs_json="$2"
repx_input() { jq -r --arg k "$1" '.[$k]' "$inputs_json"; }
"#;

// ============================================================================
// 1. DYNAMIC FIELDS
// ============================================================================

pub type ParamFn<T> = Arc<dyn Fn(&Params) -> Result<T> + Send + Sync>;

/// A field that is a plain value or a single-argument function of the
/// resolved parameters.
#[derive(Clone)]
pub enum Dynamic<T> {
    Literal(T),
    ParamFn(ParamFn<T>),
}

impl<T: fmt::Debug> fmt::Debug for Dynamic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dynamic::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            Dynamic::ParamFn(_) => f.write_str("ParamFn(..)"),
        }
    }
}

impl<T: Default> Default for Dynamic<T> {
    fn default() -> Self {
        Dynamic::Literal(T::default())
    }
}

impl<T: Clone> Dynamic<T> {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Params) -> Result<T> + Send + Sync + 'static,
    {
        Dynamic::ParamFn(Arc::new(f))
    }

    pub fn resolve(&self, params: &Params) -> Result<T> {
        match self {
            Dynamic::Literal(v) => Ok(v.clone()),
            Dynamic::ParamFn(f) => f(params),
        }
    }
}

impl<T> From<T> for Dynamic<T> {
    fn from(v: T) -> Self {
        Dynamic::Literal(v)
    }
}

/// Parses a declared field value.
///
/// A mapping carrying an `fn` key is a function declaration and must have
/// the shape `{ fn: [params], template: <value> }`; anything else is a
/// literal. `convert` turns the (substituted) value into the field type.
pub fn dynamic_from_value<T, C>(subject: &str, field: &str, raw: Value, convert: C) -> Result<Dynamic<T>>
where
    T: Clone + 'static,
    C: Fn(Value) -> std::result::Result<T, String> + Send + Sync + 'static,
{
    let fn_decl = match &raw {
        Value::Object(map) if map.contains_key("fn") => Some(map.clone()),
        _ => None,
    };

    let Some(map) = fn_decl else {
        let value = convert(raw)
            .map_err(|e| BuildError::definition(subject, format!("field '{field}': {e}")))?;
        return Ok(Dynamic::Literal(value));
    };

    let extra: Vec<&String> = map.keys().filter(|k| *k != "fn" && *k != "template").collect();
    if !extra.is_empty() {
        return Err(BuildError::definition(
            subject,
            format!(
                "dynamic field '{field}' has unexpected keys {} (expected 'fn' and 'template')",
                quoted(extra)
            ),
        ));
    }
    let args: Vec<String> = match map.get("fn") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|a| a.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                BuildError::definition(subject, format!("dynamic field '{field}': 'fn' arguments must be names"))
            })?,
        _ => {
            return Err(BuildError::definition(
                subject,
                format!("dynamic field '{field}': 'fn' must be a list of argument names"),
            ))
        }
    };
    if args.len() != 1 {
        return Err(BuildError::definition(
            subject,
            format!(
                "dynamic field '{field}' must be a function of exactly one argument (the parameters), got {} ({})",
                args.len(),
                quoted(&args)
            ),
        ));
    }
    let template = map.get("template").cloned().ok_or_else(|| {
        BuildError::definition(subject, format!("dynamic field '{field}' has no 'template'"))
    })?;

    let subject = subject.to_string();
    let field = field.to_string();
    Ok(Dynamic::from_fn(move |params: &Params| {
        let value = substitute(&template, params)
            .map_err(|e| BuildError::definition(&subject, format!("field '{field}': {e}")))?;
        convert(value).map_err(|e| BuildError::definition(&subject, format!("field '{field}': {e}")))
    }))
}

/// Deserialises a JSON value into `T`, stringifying the error.
pub fn from_json<T: DeserializeOwned>(v: Value) -> std::result::Result<T, String> {
    serde_json::from_value(v).map_err(|e| e.to_string())
}

/// Declared inputs: a map of name -> placeholder default, or a list of names.
pub fn inputs_from_json(v: Value) -> std::result::Result<BTreeMap<String, Value>, String> {
    match v {
        Value::Null => Ok(BTreeMap::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(name) => Ok((name, Value::String(String::new()))),
                other => Err(format!("input names must be strings, got {other}")),
            })
            .collect(),
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(format!("inputs must be a map or a list, got {other}")),
    }
}

pub fn outputs_from_json(v: Value) -> std::result::Result<BTreeMap<String, String>, String> {
    match v {
        Value::Null => Ok(BTreeMap::new()),
        other => from_json(other),
    }
}

// ============================================================================
// 2. TEMPLATES
// ============================================================================

/// Scalar text of a parameter value as it appears inside strings.
pub fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replaces `{param}` in every string (keys included). A string that is
/// exactly one placeholder takes the parameter's value with its JSON type.
pub fn substitute(template: &Value, params: &Params) -> std::result::Result<Value, String> {
    match template {
        Value::String(s) => {
            if let Some(name) = whole_placeholder(s) {
                return params
                    .get(name)
                    .cloned()
                    .ok_or_else(|| format!("template references unknown parameter '{name}'"));
            }
            substitute_str(s, params).map(Value::String)
        }
        Value::Array(items) => items
            .iter()
            .map(|i| substitute(i, params))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(substitute_str(k, params)?, substitute(v, params)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    is_ident(inner).then_some(inner)
}

fn substitute_str(s: &str, params: &Params) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_ident(&after[..end]) => {
                let name = &after[..end];
                let value = params
                    .get(name)
                    .ok_or_else(|| format!("template references unknown parameter '{name}'"))?;
                out.push_str(&scalar_text(value));
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Renders `{{params.x}}`, `{{outputs.x}}` and `{{inputs.x}}` in a stage
/// body and prepends the shell prologue.
pub fn render_body(
    subject: &str,
    body: &str,
    params: &Params,
    inputs: &BTreeMap<String, Value>,
    outputs: &BTreeMap<String, String>,
) -> Result<String> {
    let mut rendered = String::with_capacity(body.len() + SCRIPT_PREAMBLE.len());
    rendered.push_str(SCRIPT_PREAMBLE);

    let mut rest = body;
    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            BuildError::definition(subject, "unterminated '{{' placeholder in run body")
        })?;
        let reference = after[..end].trim();
        let (scope, name) = reference.split_once('.').ok_or_else(|| {
            BuildError::definition(
                subject,
                format!("run body placeholder '{{{{{reference}}}}}' must be params.X, inputs.X or outputs.X"),
            )
        })?;
        let replacement = match scope {
            "params" => params.get(name).map(scalar_text),
            "outputs" => outputs.get(name).map(|t| format!("\"{t}\"")),
            "inputs" => inputs.contains_key(name).then(|| format!("\"$(repx_input {name})\"")),
            _ => None,
        }
        .ok_or_else(|| {
            BuildError::definition(
                subject,
                format!("run body references unknown {scope} '{name}'"),
            )
        })?;
        rendered.push_str(&replacement);
        rest = &after[end + 2..];
    }
    rendered.push_str(rest);
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    Ok(rendered)
}

// ============================================================================
// 3. STAGE DECLARATIONS
// ============================================================================

/// Inputs/outputs/resources/body of a simple stage or of one fan-out phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseSpec {
    pub inputs: Dynamic<BTreeMap<String, Value>>,
    pub outputs: Dynamic<BTreeMap<String, String>>,
    pub resources: Dynamic<ResourceDecl>,
    pub run: String,
    pub run_dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StepSpec {
    pub phase: PhaseSpec,
    pub deps: Vec<DepExpr>,
}

#[derive(Debug, Clone)]
pub struct ScatterGatherSpec {
    pub scatter: PhaseSpec,
    pub steps: BTreeMap<String, StepSpec>,
    pub gather: PhaseSpec,
}

#[derive(Debug, Clone)]
pub enum StageKind {
    Simple(PhaseSpec),
    ScatterGather(ScatterGatherSpec),
}

/// Static stage declaration, authored once and reused across runs.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Key of the stage in the lab's stage table.
    pub id: String,
    pub name: Dynamic<String>,
    pub version: Option<String>,
    pub params: Params,
    pub resources: Dynamic<ResourceDecl>,
    pub run_dependencies: Vec<String>,
    pub kind: StageKind,
}

/// Rejects any key outside `allowed`, naming every offender.
pub fn validate_keys(subject: &str, decl: &Map<String, Value>, allowed: &[&str]) -> Result<()> {
    let unknown: BTreeSet<&str> = decl
        .keys()
        .map(String::as_str)
        .filter(|k| !allowed.contains(k))
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }
    Err(BuildError::definition(
        subject,
        format!(
            "unknown attribute(s) {} (allowed: {})",
            quoted(&unknown),
            allowed.join(", ")
        ),
    ))
}

fn is_scatter_gather(decl: &Map<String, Value>) -> bool {
    ["scatter", "steps", "gather"].iter().any(|k| decl.contains_key(*k))
}

fn string_list(subject: &str, field: &str, v: Option<&Value>) -> Result<Vec<String>> {
    match v {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => from_json(v.clone())
            .map_err(|e| BuildError::definition(subject, format!("field '{field}': {e}"))),
    }
}

fn phase_from_decl(subject: &str, decl: &Map<String, Value>, require_run: bool) -> Result<PhaseSpec> {
    let get = |k: &str| decl.get(k).cloned().unwrap_or(Value::Null);

    let run = match decl.get("run") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(BuildError::definition(
                subject,
                format!("field 'run' must be a string, got {other}"),
            ))
        }
        None if require_run => {
            return Err(BuildError::definition(subject, "missing required field 'run'"))
        }
        None => String::new(),
    };

    Ok(PhaseSpec {
        inputs: dynamic_from_value(subject, "inputs", get("inputs"), inputs_from_json)?,
        outputs: dynamic_from_value(subject, "outputs", get("outputs"), outputs_from_json)?,
        resources: resources_field(subject, get("resources"))?,
        run,
        run_dependencies: string_list(subject, "runDependencies", decl.get("runDependencies"))?,
    })
}

fn resources_field(subject: &str, raw: Value) -> Result<Dynamic<ResourceDecl>> {
    dynamic_from_value(subject, "resources", raw, |v| match v {
        Value::Null => Ok(ResourceDecl::default()),
        other => from_json(other),
    })
}

/// Names and versions end up in `jobs/<id>`, so they must be one path segment.
pub(crate) fn is_path_safe(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains('/') && !s.contains('\\') && !s.contains(char::is_whitespace)
}

fn sub_decl<'a>(subject: &str, decl: &'a Map<String, Value>, key: &str) -> Result<&'a Map<String, Value>> {
    match decl.get(key) {
        Some(Value::Object(m)) => Ok(m),
        Some(_) => Err(BuildError::definition(subject, format!("field '{key}' must be a mapping"))),
        None => Err(BuildError::definition(subject, format!("missing required field '{key}'"))),
    }
}

impl StageSpec {
    /// Validates and parses a stage declaration (the JSON form of one entry
    /// of the lab's `stages` table).
    pub fn from_decl(id: &str, decl: &Value) -> Result<StageSpec> {
        let subject = format!("stage '{id}'");
        let decl = decl
            .as_object()
            .ok_or_else(|| BuildError::definition(&subject, "stage declaration must be a mapping"))?;

        let fan_out = is_scatter_gather(decl);
        let allowed = if fan_out { SCATTER_GATHER_STAGE_KEYS } else { SIMPLE_STAGE_KEYS };
        validate_keys(&subject, decl, allowed)?;

        let name_raw = decl
            .get("name")
            .cloned()
            .ok_or_else(|| BuildError::definition(&subject, "missing required field 'name'"))?;
        let name = dynamic_from_value(&subject, "name", name_raw, |v| match v {
            Value::String(s) => Ok(s),
            other => Err(format!("name must be a string, got {other}")),
        })?;

        let version = match decl.get("version") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let version = scalar_text(v);
                if !is_path_safe(&version) {
                    return Err(BuildError::definition(
                        &subject,
                        format!("version '{version}' must be non-empty without '/' or whitespace"),
                    ));
                }
                Some(version)
            }
        };
        let params: Params = match decl.get("params") {
            None | Some(Value::Null) => Params::new(),
            Some(v) => from_json(v.clone())
                .map_err(|e| BuildError::definition(&subject, format!("field 'params': {e}")))?,
        };

        let kind = if fan_out {
            let scatter_decl = sub_decl(&subject, decl, "scatter")?;
            let gather_decl = sub_decl(&subject, decl, "gather")?;
            let steps_decl = sub_decl(&subject, decl, "steps")?;

            let scatter_subject = format!("{subject} scatter");
            validate_keys(&scatter_subject, scatter_decl, PHASE_KEYS)?;
            let gather_subject = format!("{subject} gather");
            validate_keys(&gather_subject, gather_decl, PHASE_KEYS)?;

            let mut steps = BTreeMap::new();
            for (step_name, step_decl) in steps_decl {
                let step_subject = format!("{subject} step '{step_name}'");
                let step_decl = step_decl.as_object().ok_or_else(|| {
                    BuildError::definition(&step_subject, "step declaration must be a mapping")
                })?;
                validate_keys(&step_subject, step_decl, STEP_KEYS)?;
                let deps = match step_decl.get("deps") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|d| DepExpr::from_json(&step_subject, d))
                        .collect::<Result<Vec<_>>>()?,
                    Some(_) => {
                        return Err(BuildError::definition(&step_subject, "field 'deps' must be a list"))
                    }
                };
                steps.insert(
                    step_name.clone(),
                    StepSpec {
                        phase: phase_from_decl(&step_subject, step_decl, true)?,
                        deps,
                    },
                );
            }
            if steps.is_empty() {
                return Err(BuildError::definition(&subject, "'steps' must declare at least one step"));
            }

            StageKind::ScatterGather(ScatterGatherSpec {
                scatter: phase_from_decl(&scatter_subject, scatter_decl, true)?,
                steps,
                gather: phase_from_decl(&gather_subject, gather_decl, true)?,
            })
        } else {
            let mut phase = phase_from_decl(&subject, decl, true)?;
            // Simple stages keep their hint and tools at stage level.
            phase.resources = Dynamic::default();
            phase.run_dependencies.clear();
            StageKind::Simple(phase)
        };

        Ok(StageSpec {
            id: id.to_string(),
            name,
            version,
            params,
            resources: resources_field(&subject, decl.get("resources").cloned().unwrap_or(Value::Null))?,
            run_dependencies: string_list(&subject, "runDependencies", decl.get("runDependencies"))?,
            kind,
        })
    }

    pub fn is_scatter_gather(&self) -> bool {
        matches!(self.kind, StageKind::ScatterGather(_))
    }
}

// ============================================================================
// 4. RESOLUTION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ResolvedPhase {
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, String>,
    pub resources: ResourceHint,
    pub run: String,
    pub run_dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub phase: ResolvedPhase,
    pub deps: Vec<DepExpr>,
}

#[derive(Debug, Clone)]
pub enum ResolvedKind {
    Simple(ResolvedPhase),
    ScatterGather {
        scatter: ResolvedPhase,
        steps: BTreeMap<String, ResolvedStep>,
        gather: ResolvedPhase,
    },
}

/// A stage's shape for one parameter assignment, before wiring.
#[derive(Debug, Clone)]
pub struct ResolvedStage {
    pub stage_id: String,
    pub name: String,
    pub version: Option<String>,
    pub params: Params,
    pub resources: ResourceHint,
    pub run_dependencies: Vec<String>,
    pub kind: ResolvedKind,
}

impl ResolvedStage {
    /// Inputs the pipeline has to satisfy (the scatter phase's for fan-out stages).
    pub fn inputs(&self) -> &BTreeMap<String, Value> {
        match &self.kind {
            ResolvedKind::Simple(p) => &p.inputs,
            ResolvedKind::ScatterGather { scatter, .. } => &scatter.inputs,
        }
    }

    /// Outputs visible to downstream stages (the gather phase's for fan-out stages).
    pub fn outputs(&self) -> &BTreeMap<String, String> {
        match &self.kind {
            ResolvedKind::Simple(p) => &p.outputs,
            ResolvedKind::ScatterGather { gather, .. } => &gather.outputs,
        }
    }

    pub fn subject(&self) -> String {
        format!("stage '{}'", self.name)
    }
}

fn resolve_phase(subject: &str, phase: &PhaseSpec, params: &Params) -> Result<ResolvedPhase> {
    Ok(ResolvedPhase {
        inputs: phase.inputs.resolve(params)?,
        outputs: phase.outputs.resolve(params)?,
        resources: phase.resources.resolve(params)?.parse(subject)?,
        run: phase.run.clone(),
        run_dependencies: phase.run_dependencies.clone(),
    })
}

/// Resolves one dynamic field; literals pass through, functions are called
/// with the resolved parameter set.
pub fn resolve_dynamic<T: Clone>(field: &Dynamic<T>, params: &Params) -> Result<T> {
    field.resolve(params)
}

impl StageSpec {
    /// Instantiates the stage for `overrides` (a run's parameter assignment).
    pub fn resolve(&self, overrides: &Params) -> Result<ResolvedStage> {
        let params = crate::params::resolve_defaults(&self.params, overrides);
        let subject = format!("stage '{}'", self.id);

        let name = resolve_dynamic(&self.name, &params)?;
        if !is_path_safe(&name) {
            return Err(BuildError::definition(
                &subject,
                format!("resolved name '{name}' must be non-empty without '/' or whitespace"),
            ));
        }
        let subject = format!("stage '{name}'");

        let kind = match &self.kind {
            StageKind::Simple(phase) => ResolvedKind::Simple(resolve_phase(&subject, phase, &params)?),
            StageKind::ScatterGather(sg) => {
                let mut steps = BTreeMap::new();
                for (step_name, step) in &sg.steps {
                    let step_subject = format!("{subject} step '{step_name}'");
                    steps.insert(
                        step_name.clone(),
                        ResolvedStep {
                            phase: resolve_phase(&step_subject, &step.phase, &params)?,
                            deps: step.deps.clone(),
                        },
                    );
                }
                ResolvedKind::ScatterGather {
                    scatter: resolve_phase(&format!("{subject} scatter"), &sg.scatter, &params)?,
                    steps,
                    gather: resolve_phase(&format!("{subject} gather"), &sg.gather, &params)?,
                }
            }
        };

        Ok(ResolvedStage {
            stage_id: self.id.clone(),
            resources: resolve_dynamic(&self.resources, &params)?.parse(&subject)?,
            name,
            version: self.version.clone(),
            params,
            run_dependencies: self.run_dependencies.clone(),
            kind,
        })
    }
}
