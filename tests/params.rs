use repx_lab::params::{effective_params, expand_sweep, resolve_defaults, SweepSource, SweepSpec};
use repx_lab::{ErrorKind, Params};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;

fn params(v: Value) -> Params {
    serde_json::from_value(v).unwrap()
}

#[test]
fn test_resolve_defaults_per_parameter() {
    let declared = params(json!({ "alpha": 1, "beta": "x", "gamma": true }));
    let overrides = params(json!({ "beta": "y", "unrelated": 42 }));
    let resolved = resolve_defaults(&declared, &overrides);
    assert_eq!(resolved, params(json!({ "alpha": 1, "beta": "y", "gamma": true })));
}

#[test]
fn test_cartesian_expansion_3_by_2() {
    let sweep = SweepSpec::new()
        .with("r", "a", vec![json!(1), json!(2), json!(3)])
        .unwrap()
        .with("r", "b", vec![json!("x"), json!("y")])
        .unwrap();
    assert_eq!(sweep.combinations(), 6);

    let out = expand_sweep(&sweep);
    assert_eq!(out.len(), 6);
    let distinct: BTreeSet<String> = out.iter().map(|p| serde_json::to_string(p).unwrap()).collect();
    assert_eq!(distinct.len(), 6);

    // First declared parameter varies slowest.
    assert_eq!(out[0], params(json!({ "a": 1, "b": "x" })));
    assert_eq!(out[1], params(json!({ "a": 1, "b": "y" })));
    assert_eq!(out[2], params(json!({ "a": 2, "b": "x" })));
    assert_eq!(out[5], params(json!({ "a": 3, "b": "y" })));
}

#[test]
fn test_empty_sweep_yields_one_assignment() {
    let out = expand_sweep(&SweepSpec::new());
    assert_eq!(out, vec![Params::new()]);
}

#[test]
fn test_empty_value_list_rejected() {
    let err = SweepSpec::new().with("train", "lr", vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let msg = err.to_string();
    assert!(msg.contains("run 'train'") && msg.contains("'lr'"), "{msg}");
}

#[test]
fn test_duplicate_axis_rejected() {
    let err = SweepSpec::new()
        .with("r", "a", vec![json!(1)])
        .unwrap()
        .with("r", "a", vec![json!(2)])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_effective_params_own_values_win() {
    let own = params(json!({ "offset": 2, "mode": "fast" }));
    let first = params(json!({ "offset": 1, "seed": 7 }));
    let second = params(json!({ "seed": 9, "scale": 0.5 }));
    let eff = effective_params(&own, [&first, &second]);
    assert_eq!(
        eff,
        params(json!({ "offset": 2, "mode": "fast", "seed": 9, "scale": 0.5 }))
    );
}

#[test]
fn test_sweep_sources_materialize() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data = dir.path().join("data");
    fs::create_dir(&data).unwrap();
    for name in ["b.txt", "a.txt", "c.txt"] {
        fs::write(data.join(name), name).unwrap();
    }
    fs::write(dir.path().join("items.txt"), "one\n\n  two  \nthree\n").unwrap();

    let list: SweepSource = serde_json::from_value(json!([1, 2])).unwrap();
    assert_eq!(list.materialize(dir.path(), "run 'r'").unwrap(), vec![json!(1), json!(2)]);

    let by_dir: SweepSource = serde_json::from_value(json!({ "dir": "data" })).unwrap();
    let values = by_dir.materialize(dir.path(), "run 'r'").unwrap();
    let names: Vec<String> = values
        .iter()
        .map(|v| v.as_str().unwrap().rsplit(['/', '\\']).next().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);

    let by_lines: SweepSource = serde_json::from_value(json!({ "lines": "items.txt" })).unwrap();
    assert_eq!(
        by_lines.materialize(dir.path(), "run 'r'").unwrap(),
        vec![json!("one"), json!("two"), json!("three")]
    );

    let missing: SweepSource = serde_json::from_value(json!({ "lines": "nope.txt" })).unwrap();
    assert_eq!(
        missing.materialize(dir.path(), "run 'r'").unwrap_err().kind(),
        ErrorKind::Io
    );
}
