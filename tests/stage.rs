use repx_lab::stage::{render_body, substitute, validate_keys, ResolvedKind, StageSpec, SIMPLE_STAGE_KEYS};
use repx_lab::{ErrorKind, Params};
use serde_json::{json, Value};
use std::collections::BTreeMap;

fn params(v: Value) -> Params {
    serde_json::from_value(v).unwrap()
}

#[test]
fn test_unknown_keys_named_in_error() {
    let decl = json!({ "name": "x", "run": "true", "bogus": 1, "other": 2 });
    let err = StageSpec::from_decl("x", &decl).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Definition);
    let msg = err.to_string();
    assert!(msg.contains("'bogus'") && msg.contains("'other'"), "{msg}");
    assert!(msg.contains("stage 'x'"), "{msg}");

    let map = decl.as_object().unwrap();
    assert!(validate_keys("stage 'x'", map, SIMPLE_STAGE_KEYS).is_err());
}

#[test]
fn test_fan_out_keys_differ_from_simple() {
    // `inputs` belongs to the phases of a fan-out stage, not to the stage.
    let decl = json!({
        "name": "fan",
        "inputs": ["a"],
        "scatter": { "run": "true" },
        "steps": { "s": { "run": "true" } },
        "gather": { "run": "true" },
    });
    let err = StageSpec::from_decl("fan", &decl).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Definition);
    assert!(err.to_string().contains("'inputs'"));
}

#[test]
fn test_missing_name_and_run() {
    let err = StageSpec::from_decl("s", &json!({ "run": "true" })).unwrap_err();
    assert!(err.to_string().contains("'name'"));
    let err = StageSpec::from_decl("s", &json!({ "name": "s" })).unwrap_err();
    assert!(err.to_string().contains("'run'"));
}

#[test]
fn test_dynamic_fields_resolve_per_assignment() {
    let decl = json!({
        "name": { "fn": ["params"], "template": "shard-{n}" },
        "params": { "n": 1 },
        "outputs": {
            "fn": ["params"],
            "template": { "part_{n}": "$out/part_{n}.csv" }
        },
        "resources": { "fn": ["params"], "template": { "cpus": "{n}" } },
        "run": "echo {{params.n}}",
    });
    let spec = StageSpec::from_decl("shard", &decl).unwrap();

    let one = spec.resolve(&Params::new()).unwrap();
    assert_eq!(one.name, "shard-1");
    assert_eq!(one.outputs().keys().collect::<Vec<_>>(), vec!["part_1"]);

    let three = spec.resolve(&params(json!({ "n": 3 }))).unwrap();
    assert_eq!(three.name, "shard-3");
    assert_eq!(three.outputs()["part_3"], "$out/part_3.csv");
    assert!(matches!(three.kind, ResolvedKind::Simple(_)));
    assert_eq!(three.resources.cpus, Some(3));
}

#[test]
fn test_dynamic_field_arity_checked() {
    for args in [json!([]), json!(["a", "b"])] {
        let decl = json!({
            "name": { "fn": args, "template": "x" },
            "run": "true",
        });
        let err = StageSpec::from_decl("s", &decl).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Definition);
    }
}

#[test]
fn test_unknown_template_parameter() {
    let decl = json!({
        "name": { "fn": ["params"], "template": "x-{missing}" },
        "run": "true",
    });
    let spec = StageSpec::from_decl("s", &decl).unwrap();
    let err = spec.resolve(&Params::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Definition);
    assert!(err.to_string().contains("'missing'"));
}

#[test]
fn test_whole_placeholder_keeps_type() {
    let p = params(json!({ "n": 4, "tag": "a" }));
    assert_eq!(substitute(&json!("{n}"), &p).unwrap(), json!(4));
    assert_eq!(substitute(&json!("n={n}-{tag}"), &p).unwrap(), json!("n=4-a"));
    assert_eq!(substitute(&json!("{not closed"), &p).unwrap(), json!("{not closed"));
}

#[test]
fn test_render_body_placeholders() {
    let p = params(json!({ "k": 5 }));
    let inputs: BTreeMap<String, Value> = [("data".to_string(), json!(""))].into_iter().collect();
    let outputs: BTreeMap<String, String> = [("res".to_string(), "$out/res.txt".to_string())].into_iter().collect();

    let body = render_body("stage 'r'", "cat {{inputs.data}} | head -{{params.k}} > {{outputs.res}}", &p, &inputs, &outputs).unwrap();
    assert!(body.starts_with("#!/usr/bin/env bash"));
    assert!(body.contains(r#"cat "$(repx_input data)" | head -5 > "$out/res.txt""#), "{body}");

    let err = render_body("stage 'r'", "{{outputs.nope}}", &p, &inputs, &outputs).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Definition);
    assert!(err.to_string().contains("stage 'r'"));
}

#[test]
fn test_bad_resource_string_fails_resolution() {
    let decl = json!({ "name": "s", "run": "true", "resources": { "time": "soon" } });
    let spec = StageSpec::from_decl("s", &decl).unwrap();
    assert_eq!(spec.resolve(&Params::new()).unwrap_err().kind(), ErrorKind::Validation);
}

#[test]
fn test_resolved_name_must_be_path_safe() {
    let decl = json!({ "name": { "fn": ["p"], "template": "{v}" }, "params": { "v": "a/b" }, "run": "true" });
    let spec = StageSpec::from_decl("s", &decl).unwrap();
    assert_eq!(spec.resolve(&Params::new()).unwrap_err().kind(), ErrorKind::Definition);
}

#[test]
fn test_version_must_be_path_safe() {
    for bad in ["1.0/beta", "1 0", ""] {
        let decl = json!({ "name": "fit", "version": bad, "run": "true" });
        let err = StageSpec::from_decl("fit", &decl).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Definition, "{bad:?}");
        assert!(err.to_string().contains("version"), "{err}");
    }

    let decl = json!({ "name": "fit", "version": 2, "run": "true" });
    let spec = StageSpec::from_decl("fit", &decl).unwrap();
    assert_eq!(spec.version.as_deref(), Some("2"));
}
