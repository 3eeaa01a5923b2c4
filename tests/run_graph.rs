use repx_lab::workflow::{validate_names, RunEdge, RunGraph};
use repx_lab::{DependencyKind, ErrorKind};
use std::collections::BTreeMap;

fn edge(from: &str, to: &str, kind: DependencyKind) -> RunEdge {
    RunEdge {
        from: from.into(),
        to: to.into(),
        kind,
    }
}

#[test]
fn test_schedule_respects_dependencies() {
    let mut g = RunGraph::new(["report", "train", "prepare"]).unwrap();
    g.add_edge(edge("prepare", "train", DependencyKind::Hard)).unwrap();
    g.add_edge(edge("train", "report", DependencyKind::Soft)).unwrap();

    assert_eq!(g.schedule().unwrap(), vec!["prepare", "train", "report"]);
}

#[test]
fn test_independent_runs_keep_declaration_order() {
    let g = RunGraph::new(["c", "a", "b"]).unwrap();
    assert_eq!(g.schedule().unwrap(), vec!["c", "a", "b"]);
}

#[test]
fn test_three_run_cycle_names_all_members() {
    let mut g = RunGraph::new(["A", "B", "C", "D"]).unwrap();
    g.add_edge(edge("A", "B", DependencyKind::Hard)).unwrap();
    g.add_edge(edge("B", "C", DependencyKind::Hard)).unwrap();
    g.add_edge(edge("C", "A", DependencyKind::Soft)).unwrap();
    g.add_edge(edge("C", "D", DependencyKind::Hard)).unwrap();

    let err = g.schedule().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Topology);
    let msg = err.to_string();
    for name in ["'A'", "'B'", "'C'"] {
        assert!(msg.contains(name), "{msg}");
    }
    // D is downstream of the cycle, not part of it.
    assert!(!msg.contains("'D'"), "{msg}");
}

#[test]
fn test_self_dependency_is_a_cycle() {
    let mut g = RunGraph::new(["solo"]).unwrap();
    g.add_edge(edge("solo", "solo", DependencyKind::Hard)).unwrap();
    assert_eq!(g.schedule().unwrap_err().kind(), ErrorKind::Topology);
}

#[test]
fn test_duplicate_and_unknown_runs() {
    let err = RunGraph::new(["a", "a"]).err().expect("duplicate run");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut g = RunGraph::new(["a"]).unwrap();
    let err = g.add_edge(edge("ghost", "a", DependencyKind::Hard)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Definition);
    assert!(err.to_string().contains("'ghost'"));
}

#[test]
fn test_evaluate_sees_upstream_results() {
    let mut g = RunGraph::new(["b", "a", "c"]).unwrap();
    g.add_edge(edge("a", "b", DependencyKind::Hard)).unwrap();
    g.add_edge(edge("b", "c", DependencyKind::Soft)).unwrap();

    let results = g
        .evaluate(|name, upstream| {
            let mut total = 1;
            for (_, _, v) in upstream.all() {
                total += *v;
            }
            if name == "c" {
                assert!(upstream.hard().next().is_none());
                assert_eq!(upstream.get("b"), Some(&2));
            }
            Ok(total)
        })
        .unwrap();

    assert_eq!(
        results,
        vec![("a".to_string(), 1), ("b".to_string(), 2), ("c".to_string(), 3)]
    );
}

#[test]
fn test_evaluate_stops_at_first_error() {
    let g = RunGraph::new(["a", "b"]).unwrap();
    let mut seen = Vec::new();
    let err = g
        .evaluate(|name, _| {
            seen.push(name.to_string());
            if name == "a" {
                Err(repx_lab::BuildError::validation("run 'a'", "boom"))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(seen, vec!["a"]);
}

#[test]
fn test_group_checks() {
    let runs = vec!["train".to_string(), "eval".to_string()];

    let mut groups = BTreeMap::new();
    groups.insert("all".to_string(), vec!["train".to_string(), "eval".to_string()]);
    validate_names(&runs, &groups).unwrap();

    let mut clash = groups.clone();
    clash.insert("train".to_string(), vec!["eval".to_string()]);
    let err = validate_names(&runs, &clash).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("'train'"));

    let mut unknown = BTreeMap::new();
    unknown.insert("g".to_string(), vec!["nope".to_string()]);
    assert_eq!(validate_names(&runs, &unknown).unwrap_err().kind(), ErrorKind::Validation);

    let dup = vec!["x".to_string(), "x".to_string()];
    assert_eq!(validate_names(&dup, &BTreeMap::new()).unwrap_err().kind(), ErrorKind::Validation);
}
