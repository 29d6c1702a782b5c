mod test_support;

use serde_json::json;
use test_support::{
    assert_close, request_ok, seed_program, spawn_sidecar, temp_dir, ANI, BUDI, CITRA,
};

fn score(v: &serde_json::Value) -> Option<f64> {
    v.get("score").and_then(|x| x.as_f64())
}

fn no_data(v: &serde_json::Value) -> bool {
    v.get("noData").and_then(|x| x.as_bool()) == Some(true) && v.get("score") == Some(&json!(null))
}

#[test]
fn partial_components_renormalize_and_no_data_propagates() {
    let workspace = temp_dir("outcomesd-rollup-e2e");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let p = seed_program(&mut stdin, &mut reader, &workspace);

    // Ani: UTS 80, UAS 90, Tugas never assessed.
    for (i, (component_id, value)) in [(&p.uts_id, 80.0), (&p.uas_id, 90.0)].into_iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("a{}", i),
            "scores.set",
            json!({ "classId": p.class1_id, "nim": ANI, "componentId": component_id, "value": value }),
        );
    }
    let cpmk = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "calc.cpmkScore",
        json!({ "nim": ANI, "cpmkId": p.cpmk1_id, "scope": { "kind": "all" } }),
    );
    assert_close(score(&cpmk), 85.0);
    assert_eq!(cpmk.get("inputs").and_then(|v| v.as_array()).map(|a| a.len()), Some(3));

    // CPMK-2 has no scores, so CPL-01 is CPMK-1 alone.
    let cpl = request_ok(
        &mut stdin,
        &mut reader,
        "c2",
        "calc.cplScore",
        json!({ "nim": ANI, "cplId": p.cpl_id }),
    );
    assert_close(score(&cpl), 85.0);
    let contributions = cpl.get("contributions").and_then(|v| v.as_array()).expect("contributions");
    let excluded = contributions
        .iter()
        .find(|c| c.get("cpmkId").and_then(|v| v.as_str()) == Some(p.cpmk2_id.as_str()))
        .expect("CPMK-2 contribution");
    assert!(no_data(excluded));
    assert_eq!(excluded.get("included").and_then(|v| v.as_bool()), Some(false));

    // Budi: CPMK-1 = 70, CPMK-2 NO_DATA at bobot 40/60 gives 70, not 28.
    for (i, component_id) in [&p.uts_id, &p.uas_id, &p.tugas_id].into_iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("b{}", i),
            "scores.set",
            json!({ "classId": p.class1_id, "nim": BUDI, "componentId": component_id, "value": 70 }),
        );
    }
    let cpl = request_ok(
        &mut stdin,
        &mut reader,
        "c3",
        "calc.cplScore",
        json!({ "nim": BUDI, "cplId": p.cpl_id }),
    );
    assert_close(score(&cpl), 70.0);

    // Citra has nothing anywhere.
    let cpmk = request_ok(
        &mut stdin,
        &mut reader,
        "c4",
        "calc.cpmkScore",
        json!({ "nim": CITRA, "cpmkId": p.cpmk1_id }),
    );
    assert!(no_data(&cpmk));
    let cpl = request_ok(
        &mut stdin,
        &mut reader,
        "c5",
        "calc.cplScore",
        json!({ "nim": CITRA, "cplId": p.cpl_id }),
    );
    assert!(no_data(&cpl));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scope_selects_classes_by_term() {
    let workspace = temp_dir("outcomesd-rollup-scope");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let p = seed_program(&mut stdin, &mut reader, &workspace);

    // Citra only has a 2024-GENAP score.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "scores.set",
        json!({ "classId": p.class2_id, "nim": CITRA, "componentId": p.proyek_id, "value": 90 }),
    );

    let cases = [
        (json!({ "kind": "all" }), Some(90.0)),
        (json!({ "kind": "year", "year": 2024 }), Some(90.0)),
        (json!({ "kind": "term", "year": 2024, "semester": "GENAP" }), Some(90.0)),
        (json!({ "kind": "term", "year": 2024, "semester": "GANJIL" }), None),
        (json!({ "kind": "terms", "terms": ["2023-GENAP", "2024-GANJIL"] }), None),
        (json!({ "kind": "terms", "terms": ["2025-GANJIL", "2024-GENAP"] }), Some(90.0)),
        (json!({ "kind": "year", "year": 2023 }), None),
    ];
    for (i, (scope, expected)) in cases.into_iter().enumerate() {
        let cpl = request_ok(
            &mut stdin,
            &mut reader,
            &format!("q{}", i),
            "calc.cplScore",
            json!({ "nim": CITRA, "cplId": p.cpl_id, "scope": scope }),
        );
        match expected {
            Some(v) => assert_close(score(&cpl), v),
            None => assert!(no_data(&cpl), "scope {} should be NO_DATA: {}", scope, cpl),
        }
    }

    let e = test_support::request_err(
        &mut stdin,
        &mut reader,
        "q-bad",
        "calc.cplScore",
        json!({ "nim": CITRA, "cplId": p.cpl_id, "scope": { "kind": "terms", "terms": [] } }),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn clearing_a_score_and_editing_weights_take_effect_immediately() {
    let workspace = temp_dir("outcomesd-rollup-fresh");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let p = seed_program(&mut stdin, &mut reader, &workspace);

    for (i, (component_id, value)) in [(&p.uts_id, 80.0), (&p.uas_id, 90.0), (&p.tugas_id, 60.0)]
        .into_iter()
        .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("w{}", i),
            "scores.set",
            json!({ "classId": p.class1_id, "nim": ANI, "componentId": component_id, "value": value }),
        );
    }
    let params = json!({ "nim": ANI, "cpmkId": p.cpmk1_id });
    let first = request_ok(&mut stdin, &mut reader, "r1", "calc.cpmkScore", params.clone());
    assert_close(score(&first), 75.0);
    let again = request_ok(&mut stdin, &mut reader, "r2", "calc.cpmkScore", params.clone());
    assert_eq!(
        score(&first).map(f64::to_bits),
        score(&again).map(f64::to_bits)
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "r3",
        "scores.set",
        json!({ "classId": p.class1_id, "nim": ANI, "componentId": p.tugas_id, "value": null }),
    );
    let cleared = request_ok(&mut stdin, &mut reader, "r4", "calc.cpmkScore", params.clone());
    assert_close(score(&cleared), 85.0);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "r5",
        "components.upsert",
        json!({ "classId": p.class1_id, "name": "UTS", "weight": 10, "cpmkId": p.cpmk1_id }),
    );
    let reweighted = request_ok(&mut stdin, &mut reader, "r6", "calc.cpmkScore", params);
    // (80*10 + 90*30) / 40
    assert_close(score(&reweighted), 87.5);

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "r7",
        "components.list",
        json!({ "classId": p.class1_id }),
    );
    assert_eq!(list.pointer("/weightCheck/valid").and_then(|v| v.as_bool()), Some(false));
    assert_close(list.pointer("/weightCheck/sum").and_then(|v| v.as_f64()), 80.0);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn retaken_course_pools_every_in_scope_attempt() {
    let workspace = temp_dir("outcomesd-rollup-retake");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let p = seed_program(&mut stdin, &mut reader, &workspace);

    // Ani fails IF101 in 2024-GANJIL and retakes it in 2025-GANJIL.
    let retake = request_ok(
        &mut stdin,
        &mut reader,
        "t1",
        "class.create",
        json!({ "courseId": p.course1_id, "name": "IF101-B", "year": 2025, "semester": "GANJIL" }),
    );
    let retake_id = retake.get("classId").and_then(|v| v.as_str()).expect("classId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "t2",
        "enrollment.set",
        json!({ "classId": retake_id, "nims": [ANI] }),
    );
    for (i, (name, weight)) in [("UTS", 30), ("UAS", 30), ("Tugas", 40)].into_iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("t3-{}", i),
            "components.upsert",
            json!({ "classId": retake_id, "name": name, "weight": weight, "cpmkId": p.cpmk1_id }),
        );
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "t4",
        "scores.bulkImport",
        json!({
            "classId": p.class1_id,
            "columns": ["UTS", "UAS", "Tugas"],
            "rows": [ { "nim": ANI, "cells": [40, 40, 40] } ],
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "t5",
        "scores.bulkImport",
        json!({
            "classId": retake_id,
            "columns": ["UTS", "UAS", "Tugas"],
            "rows": [ { "nim": ANI, "cells": [90, 90, 90] } ],
        }),
    );

    let cases = [
        (json!({ "kind": "all" }), 65.0),
        (json!({ "kind": "year", "year": 2024 }), 40.0),
        (json!({ "kind": "term", "year": 2025, "semester": "GANJIL" }), 90.0),
    ];
    for (i, (scope, expected)) in cases.into_iter().enumerate() {
        let cpmk = request_ok(
            &mut stdin,
            &mut reader,
            &format!("t6-{}", i),
            "calc.cpmkScore",
            json!({ "nim": ANI, "cpmkId": p.cpmk1_id, "scope": scope }),
        );
        assert_close(score(&cpmk), expected);
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
