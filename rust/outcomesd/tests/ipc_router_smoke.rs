mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::{request, request_err, request_ok, seed_program, spawn_sidecar, temp_dir};

#[test]
fn router_rejects_unknown_methods_and_requires_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health.get("workspacePath").is_some_and(|v| v.is_null()));

    let e = request_err(&mut stdin, &mut reader, "2", "nope.method", json!({}));
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("not_implemented"));

    let e = request_err(&mut stdin, &mut reader, "3", "classes.list", json!({}));
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("no_workspace"));

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json response");
    let v: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
    assert_eq!(v.get("ok").and_then(|x| x.as_bool()), Some(false));
    assert_eq!(
        v.pointer("/error/code").and_then(|x| x.as_str()),
        Some("bad_json")
    );

    // The loop keeps serving after a bad line.
    let resp = request(&mut stdin, &mut reader, "4", "health", json!({}));
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("outcomesd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let p = seed_program(&mut stdin, &mut reader, &workspace);

    let calls = [
        ("setup.get", json!({})),
        ("curriculum.tree", json!({ "curriculumId": p.curriculum_id })),
        ("classes.list", json!({ "curriculumId": p.curriculum_id })),
        ("components.list", json!({ "classId": p.class1_id })),
        (
            "scores.set",
            json!({ "classId": p.class1_id, "nim": test_support::ANI, "componentId": p.uts_id, "value": 80 }),
        ),
        ("weights.validate", json!({ "classId": p.class1_id })),
        (
            "calc.cpmkScore",
            json!({ "nim": test_support::ANI, "cpmkId": p.cpmk1_id }),
        ),
        (
            "calc.cplScore",
            json!({ "nim": test_support::ANI, "cplId": p.cpl_id }),
        ),
        (
            "calc.cohortStats",
            json!({ "cohort": { "classId": p.class1_id }, "level": "cpmk" }),
        ),
        (
            "reports.studentOutcomes",
            json!({ "nim": test_support::ANI, "curriculumId": p.curriculum_id }),
        ),
        (
            "reports.programMatrix",
            json!({ "curriculumId": p.curriculum_id }),
        ),
        ("reports.classCpmk", json!({ "classId": p.class1_id })),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let _ = request_ok(&mut stdin, &mut reader, &format!("s{}", i), method, params);
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn curriculum_tree_derives_cpl_from_ik_and_checks_course_weights() {
    let workspace = temp_dir("outcomesd-curriculum-tree");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let p = seed_program(&mut stdin, &mut reader, &workspace);

    let tree = request_ok(
        &mut stdin,
        &mut reader,
        "t1",
        "curriculum.tree",
        json!({ "curriculumId": p.curriculum_id }),
    );
    let cpls = tree.get("cpls").and_then(|v| v.as_array()).expect("cpls");
    assert_eq!(cpls.len(), 1);
    let cpmk_ids: Vec<&str> = cpls[0]
        .get("cpmks")
        .and_then(|v| v.as_array())
        .expect("cpmks")
        .iter()
        .filter_map(|k| k.get("id").and_then(|v| v.as_str()))
        .collect();
    assert!(cpmk_ids.contains(&p.cpmk1_id.as_str()), "CPL derived from IK link");
    assert!(cpmk_ids.contains(&p.cpmk2_id.as_str()));

    let checks = cpls[0]
        .get("weightChecks")
        .and_then(|v| v.as_array())
        .expect("weightChecks");
    assert_eq!(checks.len(), 2);
    for c in checks {
        assert_eq!(c.pointer("/check/valid").and_then(|v| v.as_bool()), Some(true));
    }

    // An IK of another CPL cannot be linked under an explicit CPL it does not belong to.
    let other_cpl = request_ok(
        &mut stdin,
        &mut reader,
        "t2",
        "cpl.upsert",
        json!({ "curriculumId": p.curriculum_id, "code": "CPL-02", "description": "Komunikasi" }),
    );
    let other_cpl_id = other_cpl.get("cplId").and_then(|v| v.as_str()).expect("cplId");
    let rps = request_ok(
        &mut stdin,
        &mut reader,
        "t3",
        "rps.upsert",
        json!({ "courseId": tree.pointer("/cpls/0/cpmks/0/courseId").and_then(|v| v.as_str()).expect("courseId") }),
    );
    let e = request_err(
        &mut stdin,
        &mut reader,
        "t4",
        "cpmk.upsert",
        json!({
            "rpsId": rps.get("rpsId").and_then(|v| v.as_str()).expect("rpsId"),
            "code": "CPMK-X",
            "description": "Conflicting",
            "cplId": other_cpl_id,
            "bobotToCpl": 10,
            "ikIds": [p.ik_id],
        }),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn cpl_weight_groups_are_checked_per_syllabus_revision() {
    let workspace = temp_dir("outcomesd-rps-revisions");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let p = seed_program(&mut stdin, &mut reader, &workspace);

    // IF101 is re-issued: revision 2 carries CPMK-1 at bobot 80 toward the same CPL.
    let rps2 = request_ok(
        &mut stdin,
        &mut reader,
        "v1",
        "rps.upsert",
        json!({ "courseId": p.course1_id, "revision": "2" }),
    );
    let rps2_id = rps2.get("rpsId").and_then(|v| v.as_str()).expect("rpsId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "v2",
        "cpmk.upsert",
        json!({
            "rpsId": rps2_id,
            "code": "CPMK-1",
            "description": "Menyusun algoritma dasar (rev 2)",
            "bobotToCpl": 80,
            "ikIds": [p.ik_id],
        }),
    );

    let tree = request_ok(
        &mut stdin,
        &mut reader,
        "v3",
        "curriculum.tree",
        json!({ "curriculumId": p.curriculum_id }),
    );
    let checks = tree
        .pointer("/cpls/0/weightChecks")
        .and_then(|v| v.as_array())
        .expect("weightChecks");
    assert_eq!(checks.len(), 3, "one group per course revision: {:?}", checks);
    for c in checks {
        assert_eq!(
            c.pointer("/check/valid").and_then(|v| v.as_bool()),
            Some(true),
            "{}",
            c
        );
    }
    let if101_sums: Vec<f64> = checks
        .iter()
        .filter(|c| c.get("courseCode").and_then(|v| v.as_str()) == Some("IF101"))
        .filter_map(|c| c.pointer("/check/sum").and_then(|v| v.as_f64()))
        .collect();
    assert_eq!(if101_sums, vec![40.0, 80.0]);

    // Without rpsId the newest revision is validated.
    let latest = request_ok(
        &mut stdin,
        &mut reader,
        "v4",
        "weights.validate",
        json!({ "courseId": p.course1_id, "cplId": p.cpl_id }),
    );
    assert_eq!(latest.get("valid").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(latest.get("sum").and_then(|v| v.as_f64()), Some(80.0));

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "v5",
        "weights.validate",
        json!({ "courseId": p.course1_id, "cplId": p.cpl_id, "rpsId": p.rps1_id }),
    );
    assert_eq!(first.get("sum").and_then(|v| v.as_f64()), Some(40.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
