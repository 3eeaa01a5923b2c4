use repx_lab::resources::{format_mem, format_time, merge, merge_all, parse_mem, parse_time, ResourceDecl, ResourceHint};
use repx_lab::ErrorKind;
use serde_json::json;

fn hint(mem: Option<u64>, cpus: Option<u32>, time: Option<u64>) -> ResourceHint {
    ResourceHint {
        mem,
        cpus,
        time,
        ..Default::default()
    }
}

#[test]
fn test_parse_mem_units() {
    assert_eq!(parse_mem("512").unwrap(), 512);
    assert_eq!(parse_mem("1K").unwrap(), 1024);
    assert_eq!(parse_mem("512M").unwrap(), 512 * 1024 * 1024);
    assert_eq!(parse_mem("4G").unwrap(), 4 * 1024 * 1024 * 1024);
    assert_eq!(parse_mem("4g").unwrap(), parse_mem("4G").unwrap());
    assert_eq!(parse_mem("1T").unwrap(), 1024u64.pow(4));

    assert!(parse_mem("").is_err());
    assert!(parse_mem("G").is_err());
    assert!(parse_mem("4X").is_err());
    assert!(parse_mem("4.5G").is_err());
    assert!(parse_mem("99999999999999999999T").is_err());
}

#[test]
fn test_parse_time_forms() {
    assert_eq!(parse_time("90").unwrap(), 90);
    assert_eq!(parse_time("01:30").unwrap(), 90);
    assert_eq!(parse_time("01:00:00").unwrap(), 3600);
    assert_eq!(parse_time("1-00:00:00").unwrap(), 86_400);
    assert_eq!(parse_time("2-01:02:03").unwrap(), 2 * 86_400 + 3723);

    assert!(parse_time("").is_err());
    assert!(parse_time("1:2:3:4").is_err());
    assert!(parse_time("ab:cd").is_err());
}

#[test]
fn test_malformed_hint_is_validation_error() {
    let decl: ResourceDecl = serde_json::from_value(json!({ "mem": "lots" })).unwrap();
    let err = decl.parse("stage 'fit'").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("stage 'fit'"), "{err}");

    let decl: ResourceDecl = serde_json::from_value(json!({ "cpus": 0 })).unwrap();
    assert_eq!(decl.parse("stage 'fit'").unwrap_err().kind(), ErrorKind::Validation);

    // Oversized values are rejected, not wrapped.
    let decl: ResourceDecl = serde_json::from_value(json!({ "time": "99999999999999999:00:00" })).unwrap();
    let err = decl.parse("stage 'fit'").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("overflows"), "{err}");

    let decl: ResourceDecl = serde_json::from_value(json!({ "time": "213503982334602-00:00:00" })).unwrap();
    assert_eq!(decl.parse("stage 'fit'").unwrap_err().kind(), ErrorKind::Validation);
}

#[test]
fn test_decl_accepts_strings_numbers_and_sbatch_alias() {
    let decl: ResourceDecl = serde_json::from_value(json!({
        "mem": "2G",
        "cpus": "4",
        "time": "00:10:00",
        "partition": "short",
        "sbatch_opts": ["--qos=low"],
    }))
    .unwrap();
    let h = decl.parse("x").unwrap();
    assert_eq!(h.mem, Some(2 * 1024 * 1024 * 1024));
    assert_eq!(h.cpus, Some(4));
    assert_eq!(h.time, Some(600));
    assert_eq!(h.partition.as_deref(), Some("short"));
    assert_eq!(h.extra_opts, Some(vec!["--qos=low".to_string()]));
}

#[test]
fn test_merge_takes_max_and_absent_is_identity() {
    let a = hint(Some(100), None, Some(60));
    let b = hint(Some(50), Some(4), None);
    let m = merge(&a, &b);
    assert_eq!(m.mem, Some(100));
    assert_eq!(m.cpus, Some(4));
    assert_eq!(m.time, Some(60));

    let empty = ResourceHint::default();
    assert_eq!(merge(&empty, &a), a);
    assert_eq!(merge(&a, &empty), a);
}

#[test]
fn test_merge_monotonic_on_mem() {
    for (x, y) in [(1u64, 2u64), (5, 5), (0, 1 << 40)] {
        let a = hint(Some(x), None, None);
        let b = hint(Some(y), None, None);
        assert_eq!(merge(&a, &b).mem, Some(y));
    }
}

#[test]
fn test_merge_numeric_fields_commutative_and_associative() {
    let hints = [
        hint(Some(1), Some(8), None),
        hint(None, Some(2), Some(30)),
        hint(Some(7), None, Some(10)),
    ];
    for a in &hints {
        for b in &hints {
            let ab = merge(a, b);
            let ba = merge(b, a);
            assert_eq!((ab.mem, ab.cpus, ab.time), (ba.mem, ba.cpus, ba.time));
            for c in &hints {
                let left = merge(&merge(a, b), c);
                let right = merge(a, &merge(b, c));
                assert_eq!(left, right);
            }
        }
    }
}

#[test]
fn test_partition_last_writer_wins_with_fallback() {
    let a = ResourceHint {
        partition: Some("long".into()),
        extra_opts: Some(vec!["--a".into()]),
        ..Default::default()
    };
    let b = ResourceHint {
        partition: Some("gpu".into()),
        ..Default::default()
    };
    let m = merge(&a, &b);
    assert_eq!(m.partition.as_deref(), Some("gpu"));
    assert_eq!(m.extra_opts, Some(vec!["--a".to_string()]));

    let m = merge(&b, &ResourceHint::default());
    assert_eq!(m.partition.as_deref(), Some("gpu"));
}

#[test]
fn test_merge_all_own_hint_last() {
    let upstream = [
        ResourceHint {
            partition: Some("a".into()),
            cpus: Some(16),
            ..Default::default()
        },
        ResourceHint {
            partition: Some("b".into()),
            ..Default::default()
        },
    ];
    let own = ResourceHint {
        partition: Some("own".into()),
        cpus: Some(2),
        ..Default::default()
    };
    let m = merge_all(upstream.iter(), &own);
    assert_eq!(m.partition.as_deref(), Some("own"));
    assert_eq!(m.cpus, Some(16));

    let m = merge_all(upstream.iter(), &ResourceHint::default());
    assert_eq!(m.partition.as_deref(), Some("b"));
}

#[test]
fn test_scheduler_form() {
    assert_eq!(format_mem(4 * 1024 * 1024 * 1024), "4G");
    assert_eq!(format_mem(1536 * 1024 * 1024), "1536M");
    assert_eq!(format_mem(1000), "1000");
    assert_eq!(format_time(3723), "01:02:03");
    assert_eq!(format_time(2 * 86_400), "48:00:00");

    assert!(ResourceHint::default().to_metadata().is_none());
    let meta = ResourceHint {
        mem: Some(1024 * 1024 * 1024),
        cpus: Some(2),
        time: Some(60),
        partition: None,
        extra_opts: Some(vec!["--x".into()]),
    }
    .to_metadata()
    .unwrap();
    assert_eq!(
        meta,
        json!({ "mem": "1G", "cpus": 2, "time": "00:01:00", "sbatch_opts": ["--x"] })
    );
}
