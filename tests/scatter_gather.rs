use repx_lab::core::{InputMapping, InputSource, JobBody};
use repx_lab::pipeline::{EntryDecl, EvalContext, PipelineBuilder, PipelineDecl};
use repx_lab::resources::ResourceHint;
use repx_lab::scatter::{self, WORK_ITEM_INPUT, WORK_RESULTS_INPUT};
use repx_lab::stage::StageSpec;
use repx_lab::wiring::ExternalInputs;
use repx_lab::{ErrorKind, Params};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;

fn fan_out(steps: Value) -> Value {
    json!({
        "name": "fan",
        "scatter": {
            "inputs": ["numbers"],
            "outputs": { "work__items": "$out/items.json", "worker__arg": "$out/arg.json" },
            "run": "jq -R . {{inputs.numbers}} | jq -s . > {{outputs.work__items}}; echo '{}' > {{outputs.worker__arg}}",
        },
        "steps": steps,
        "gather": {
            "inputs": ["worker__outs"],
            "outputs": { "combined": "$out/combined.txt" },
            "run": "jq -r '.[].result' {{inputs.worker__outs}} | xargs cat > {{outputs.combined}}",
        },
    })
}

/// extract -> {square, double} -> combine
fn diamond_steps() -> Value {
    json!({
        "extract": {
            "inputs": ["worker__item"],
            "outputs": { "value": "$out/value.txt" },
            "run": "echo {{inputs.worker__item}} > {{outputs.value}}",
        },
        "square": {
            "deps": ["extract"],
            "inputs": ["value"],
            "outputs": { "squared": "$out/sq.txt" },
            "run": "echo $(( $(cat {{inputs.value}}) ** 2 )) > {{outputs.squared}}",
        },
        "double": {
            "deps": ["extract"],
            "inputs": ["value"],
            "outputs": { "doubled": "$out/db.txt" },
            "run": "echo $(( $(cat {{inputs.value}}) * 2 )) > {{outputs.doubled}}",
        },
        "combine": {
            "deps": ["square", "double"],
            "inputs": ["squared", "doubled"],
            "outputs": { "result": "$out/result.txt" },
            "run": "cat {{inputs.squared}} {{inputs.doubled}} > {{outputs.result}}",
        },
    })
}

fn numbers_input() -> Vec<InputMapping> {
    vec![InputMapping::new(
        InputSource::Literal { value: json!("numbers.txt") },
        None,
        "numbers",
    )]
}

fn plan_for(steps: Value) -> repx_lab::Result<repx_lab::ScatterGatherPlan> {
    let decl = fan_out(steps);
    let spec = StageSpec::from_decl("fan", &decl)?;
    let resolved = spec.resolve(&Params::new())?;
    scatter::plan(&resolved, &numbers_input(), &ResourceHint::default())
}

#[test]
fn test_diamond_validates_and_orders() {
    let plan = plan_for(diamond_steps()).expect("valid fan-out");
    assert_eq!(plan.sink_step, "combine");
    assert_eq!(plan.order.first().map(String::as_str), Some("extract"));
    assert_eq!(plan.order.last().map(String::as_str), Some("combine"));
    assert_eq!(plan.order.len(), 4);

    let extract = &plan.steps["extract"];
    assert_eq!(extract.phase.inputs.len(), 1);
    assert_eq!(extract.phase.inputs[0].source, InputSource::WorkItem);
    assert_eq!(extract.phase.inputs[0].target_input, WORK_ITEM_INPUT);

    let combine = &plan.steps["combine"];
    assert_eq!(combine.deps, vec!["double".to_string(), "square".to_string()]);
    assert!(combine
        .phase
        .inputs
        .iter()
        .all(|m| matches!(m.source, InputSource::Step { .. })));

    let gather_in = &plan.gather.inputs;
    assert_eq!(gather_in.len(), 1);
    assert_eq!(gather_in[0].target_input, WORK_RESULTS_INPUT);
    assert_eq!(
        gather_in[0].source,
        InputSource::SinkOutputs {
            step: "combine".into()
        }
    );
}

#[test]
fn test_gather_receives_one_entry_per_work_item() {
    let plan = plan_for(diamond_steps()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("numbers.txt");
    fs::write(&input, "1\n2\n3\n4\n").unwrap();
    let items: Vec<String> = fs::read_to_string(&input)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect();
    assert_eq!(items.len(), 4);

    let branches: Vec<PathBuf> = (0..items.len()).map(|i| dir.path().join(format!("branch-{i}"))).collect();
    let manifest = plan.work_results_manifest(&branches);
    assert_eq!(manifest.len(), 4);
    for (i, entry) in manifest.iter().enumerate() {
        let path = &entry["result"];
        assert!(path.contains(&format!("branch-{i}")), "{path}");
        assert!(path.ends_with("result.txt"), "{path}");
        assert!(!path.contains("$out"));
    }
}

#[test]
fn test_two_sinks_rejected() {
    let steps = json!({
        "root": {
            "inputs": ["worker__item"],
            "outputs": { "v": "$out/v" },
            "run": "true",
        },
        "left": { "deps": ["root"], "inputs": ["v"], "outputs": { "l": "$out/l" }, "run": "true" },
        "right": { "deps": ["root"], "inputs": ["v"], "outputs": { "r": "$out/r" }, "run": "true" },
    });
    let err = plan_for(steps).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Topology);
    let msg = err.to_string();
    assert!(msg.contains("'left'") && msg.contains("'right'"), "{msg}");
}

#[test]
fn test_single_root_single_sink_passes() {
    let steps = json!({
        "only": {
            "inputs": ["worker__item"],
            "outputs": { "out": "$out/o" },
            "run": "true",
        },
    });
    let plan = plan_for(steps).unwrap();
    assert_eq!(plan.sink_step, "only");
    assert_eq!(plan.order, vec!["only".to_string()]);
}

#[test]
fn test_step_cycle_rejected() {
    let steps = json!({
        "root": { "inputs": ["worker__item"], "outputs": { "v": "$out/v" }, "run": "true" },
        "a": { "deps": ["root", "b"], "inputs": ["v"], "outputs": { "x": "$out/x" }, "run": "true" },
        "b": { "deps": ["a"], "outputs": { "y": "$out/y" }, "run": "true" },
        "sink": { "deps": ["a"], "outputs": { "z": "$out/z" }, "run": "true" },
    });
    let err = plan_for(steps).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Topology);
    let msg = err.to_string();
    assert!(msg.contains("'a'") && msg.contains("'b'"), "{msg}");
}

#[test]
fn test_no_root_rejected() {
    let steps = json!({
        "a": { "deps": ["b"], "inputs": ["worker__item"], "outputs": { "x": "$out/x" }, "run": "true" },
        "b": { "deps": ["a"], "outputs": { "y": "$out/y" }, "run": "true" },
    });
    assert_eq!(plan_for(steps).unwrap_err().kind(), ErrorKind::Topology);
}

#[test]
fn test_root_must_take_work_item() {
    let steps = json!({
        "only": { "outputs": { "out": "$out/o" }, "run": "true" },
    });
    let err = plan_for(steps).unwrap_err();
    assert!(err.to_string().contains("worker__item"));
}

#[test]
fn test_unknown_step_dependency() {
    let steps = json!({
        "only": { "deps": ["ghost"], "inputs": ["worker__item"], "outputs": { "out": "$out/o" }, "run": "true" },
    });
    let err = plan_for(steps).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Wiring);
    assert!(err.to_string().contains("'ghost'"));
}

#[test]
fn test_sink_with_two_outputs_is_ambiguous() {
    let steps = json!({
        "only": {
            "inputs": ["worker__item"],
            "outputs": { "a": "$out/a", "b": "$out/b" },
            "run": "true",
        },
    });
    assert_eq!(plan_for(steps).unwrap_err().kind(), ErrorKind::Wiring);
}

#[test]
fn test_mandated_slots() {
    let mut decl = fan_out(diamond_steps());
    let obj = decl.as_object_mut().unwrap();
    obj["scatter"]["outputs"] = json!({ "work__items": "$out/items.json" });
    let spec = StageSpec::from_decl("fan", &decl).unwrap();
    let resolved = spec.resolve(&Params::new()).unwrap();
    let err = scatter::plan(&resolved, &numbers_input(), &ResourceHint::default()).unwrap_err();
    assert!(err.to_string().contains("worker__arg"));

    let mut decl = fan_out(diamond_steps());
    let obj = decl.as_object_mut().unwrap();
    obj["gather"]["inputs"] = json!([]);
    obj["gather"]["run"] = json!("true");
    let spec = StageSpec::from_decl("fan", &decl).unwrap();
    let resolved = spec.resolve(&Params::new()).unwrap();
    let err = scatter::plan(&resolved, &numbers_input(), &ResourceHint::default()).unwrap_err();
    assert!(err.to_string().contains("worker__outs"));
}

#[test]
fn test_fan_out_job_through_pipeline() {
    let mut decl = fan_out(diamond_steps());
    decl["resources"] = json!({ "mem": "1G" });
    decl["steps"]["square"]["resources"] = json!({ "cpus": 4 });

    let mut builder = PipelineBuilder::new();
    builder.stage(StageSpec::from_decl("fan", &decl).unwrap()).unwrap();
    builder
        .pipeline(PipelineDecl {
            name: "p".into(),
            entries: vec![EntryDecl::new("fan")],
        })
        .unwrap();
    let registry = builder.build().unwrap();

    let run_hint = ResourceHint {
        time: Some(60),
        ..Default::default()
    };
    let external: ExternalInputs = numbers_input().into_iter().collect();
    let ctx = EvalContext {
        run: "r",
        resources: &run_hint,
        external: &external,
    };
    let jobs = registry.pipelines["p"].evaluate(&ctx, &Params::new()).unwrap();
    let job = &jobs[0];
    assert_eq!(job.outputs.keys().collect::<Vec<_>>(), vec!["combined"]);

    let JobBody::ScatterGather(plan) = &job.body else {
        panic!("expected a fan-out body");
    };
    let square = &plan.steps["square"].phase.resources;
    assert_eq!(square.cpus, Some(4));
    assert_eq!(square.mem, Some(1024 * 1024 * 1024));
    assert_eq!(square.time, Some(60));

    let steps_json = plan.steps_metadata();
    assert_eq!(steps_json["sink_step"], json!("combine"));
    assert_eq!(steps_json["steps"]["extract"]["exe_path"], json!("bin/step-extract.sh"));
}
