mod test_support;

use serde_json::json;
use test_support::{
    assert_close, request_err, request_ok, seed_program, spawn_sidecar, temp_dir, ANI, BUDI,
    CITRA,
};

fn cpmk1(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
    id: &str,
    nim: &str,
    cpmk_id: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "calc.cpmkScore",
        json!({ "nim": nim, "cpmkId": cpmk_id }),
    )
}

#[test]
fn csv_import_commits_whole_batch_and_blank_means_no_data() {
    let workspace = temp_dir("outcomesd-import-csv");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let p = seed_program(&mut stdin, &mut reader, &workspace);

    // Labels match case-insensitively; Ani's Tugas is blank, Budi's row drops trailing cells.
    let csv = format!(
        "\u{feff}NIM,uts,UAS,Tugas\r\n{},80,90,\r\n{},70\r\n{},\"105\",60,50\r\n",
        ANI, BUDI, CITRA
    );
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "i1",
        "scores.bulkImport",
        json!({ "classId": p.class1_id, "csvText": csv }),
    );
    assert_eq!(result.get("rowCount").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(result.get("cellCount").and_then(|v| v.as_u64()), Some(6));
    assert_eq!(result.get("clearedCount").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(result.get("suspectCount").and_then(|v| v.as_u64()), Some(1));
    let fingerprint = result.get("fingerprint").and_then(|v| v.as_str()).expect("fingerprint");
    assert_eq!(fingerprint.len(), 64);

    let ani = cpmk1(&mut stdin, &mut reader, "c1", ANI, &p.cpmk1_id);
    assert_close(ani.get("score").and_then(|v| v.as_f64()), 85.0);
    let budi = cpmk1(&mut stdin, &mut reader, "c2", BUDI, &p.cpmk1_id);
    assert_close(budi.get("score").and_then(|v| v.as_f64()), 70.0);
    // Out-of-range is accepted by the rollup: (105*30 + 60*30 + 50*40) / 100
    let citra = cpmk1(&mut stdin, &mut reader, "c3", CITRA, &p.cpmk1_id);
    assert_close(citra.get("score").and_then(|v| v.as_f64()), 69.5);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn rejected_batch_writes_nothing() {
    let workspace = temp_dir("outcomesd-import-atomic");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let p = seed_program(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "i1",
        "scores.bulkImport",
        json!({
            "classId": p.class1_id,
            "columns": ["UTS", "UAS", "Tugas"],
            "rows": [ { "nim": ANI, "cells": [80, 90, 60] } ],
        }),
    );
    let before = cpmk1(&mut stdin, &mut reader, "c1", ANI, &p.cpmk1_id);
    assert_close(before.get("score").and_then(|v| v.as_f64()), 75.0);

    // Ani's row is valid, but the unenrolled NIM and the bad cell reject the batch.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "i2",
        "scores.bulkImport",
        json!({
            "classId": p.class1_id,
            "columns": ["UTS", "UAS", "Tugas"],
            "rows": [
                { "nim": ANI, "cells": [10, 10, 10] },
                { "nim": "9999999", "cells": [50, 50, 50] },
                { "nim": BUDI, "cells": [50, "abc", 50] },
            ],
        }),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("import_rejected"));
    let issues = e
        .pointer("/details/issues")
        .and_then(|v| v.as_array())
        .expect("issues");
    let codes: Vec<&str> = issues
        .iter()
        .filter_map(|i| i.get("code").and_then(|v| v.as_str()))
        .collect();
    assert!(codes.contains(&"not_enrolled"), "{:?}", codes);
    assert!(codes.contains(&"bad_cell"), "{:?}", codes);

    let after = cpmk1(&mut stdin, &mut reader, "c2", ANI, &p.cpmk1_id);
    assert_eq!(
        before.get("score").and_then(|v| v.as_f64()).map(f64::to_bits),
        after.get("score").and_then(|v| v.as_f64()).map(f64::to_bits)
    );
    let budi = cpmk1(&mut stdin, &mut reader, "c3", BUDI, &p.cpmk1_id);
    assert_eq!(budi.get("noData").and_then(|v| v.as_bool()), Some(true));

    // Unknown and duplicated column labels are rejected too.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "i3",
        "scores.bulkImport",
        json!({
            "classId": p.class1_id,
            "csvText": format!("NIM,UTS,Kuis,uts\n{},1,2,3\n", ANI),
        }),
    );
    let codes: Vec<String> = e
        .pointer("/details/issues")
        .and_then(|v| v.as_array())
        .expect("issues")
        .iter()
        .filter_map(|i| i.get("code").and_then(|v| v.as_str()).map(str::to_string))
        .collect();
    assert!(codes.iter().any(|c| c == "unknown_column"), "{:?}", codes);
    assert!(codes.iter().any(|c| c == "duplicate_column"), "{:?}", codes);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn manual_entry_requires_enrollment() {
    let workspace = temp_dir("outcomesd-scores-set");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let p = seed_program(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.upsert",
        json!({ "nim": "2401999", "name": "Dodi" }),
    );
    let e = request_err(
        &mut stdin,
        &mut reader,
        "s2",
        "scores.set",
        json!({ "classId": p.class1_id, "nim": "2401999", "componentId": p.uts_id, "value": 90 }),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    let set = request_ok(
        &mut stdin,
        &mut reader,
        "s3",
        "scores.set",
        json!({ "classId": p.class1_id, "nim": ANI, "componentId": p.uts_id, "value": -5 }),
    );
    assert_eq!(set.get("suspect").and_then(|v| v.as_bool()), Some(true));

    // A component from another class is refused.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "s4",
        "scores.set",
        json!({ "classId": p.class1_id, "nim": ANI, "componentId": p.proyek_id, "value": 50 }),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
