#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_outcomesd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn outcomesd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(serde_json::Value::Null)
}

/// Returns the error object of a response that must fail.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or(serde_json::Value::Null)
}

pub fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

pub fn assert_close(actual: Option<f64>, expected: f64) {
    let a = actual.expect("numeric score");
    assert!(
        (a - expected).abs() < 1e-9,
        "expected {}, got {}",
        expected,
        a
    );
}

/// Ids created by [`seed_program`].
pub struct Program {
    pub curriculum_id: String,
    pub cpl_id: String,
    pub ik_id: String,
    pub course1_id: String,
    pub course2_id: String,
    /// IF101 revision "1".
    pub rps1_id: String,
    pub cpmk1_id: String,
    pub cpmk2_id: String,
    /// IF101-A, 2024-GANJIL; components UTS 30, UAS 30, Tugas 40, all on CPMK-1.
    pub class1_id: String,
    /// IF102-A, 2024-GENAP; component Proyek 100 on CPMK-2.
    pub class2_id: String,
    pub uts_id: String,
    pub uas_id: String,
    pub tugas_id: String,
    pub proyek_id: String,
}

pub const ANI: &str = "2401001";
pub const BUDI: &str = "2401002";
pub const CITRA: &str = "2401003";

/// One CPL fed by CPMK-1 (bobot 40, course IF101) and CPMK-2 (bobot 60,
/// course IF102). All three students sit both classes; no scores yet.
pub fn seed_program(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> Program {
    let mut n = 0usize;
    let mut call = |method: &str, params: serde_json::Value| {
        n += 1;
        request_ok(stdin, reader, &format!("seed-{}", n), method, params)
    };

    let _ = call("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let curriculum_id = str_field(
        &call("curriculum.create", json!({ "code": "TI-2024", "name": "Teknik Informatika" })),
        "curriculumId",
    );
    let cpl_id = str_field(
        &call(
            "cpl.upsert",
            json!({ "curriculumId": curriculum_id, "code": "CPL-01", "description": "Mampu merancang algoritma" }),
        ),
        "cplId",
    );
    let ik_id = str_field(
        &call(
            "ik.upsert",
            json!({ "cplId": cpl_id, "code": "IK-01.1", "description": "Analisis kompleksitas" }),
        ),
        "ikId",
    );

    let course1_id = str_field(
        &call(
            "course.upsert",
            json!({ "curriculumId": curriculum_id, "code": "IF101", "name": "Algoritma" }),
        ),
        "courseId",
    );
    let course2_id = str_field(
        &call(
            "course.upsert",
            json!({ "curriculumId": curriculum_id, "code": "IF102", "name": "Struktur Data" }),
        ),
        "courseId",
    );
    let rps1_id = str_field(&call("rps.upsert", json!({ "courseId": course1_id })), "rpsId");
    let rps2_id = str_field(&call("rps.upsert", json!({ "courseId": course2_id })), "rpsId");

    let cpmk1_id = str_field(
        &call(
            "cpmk.upsert",
            json!({
                "rpsId": rps1_id,
                "code": "CPMK-1",
                "description": "Menyusun algoritma dasar",
                "bobotToCpl": 40,
                "ikIds": [ik_id],
            }),
        ),
        "cpmkId",
    );
    let cpmk2_id = str_field(
        &call(
            "cpmk.upsert",
            json!({
                "rpsId": rps2_id,
                "code": "CPMK-2",
                "description": "Memilih struktur data",
                "cplId": cpl_id,
                "bobotToCpl": 60,
            }),
        ),
        "cpmkId",
    );

    let class1_id = str_field(
        &call(
            "class.create",
            json!({ "courseId": course1_id, "name": "IF101-A", "year": 2024, "semester": "GANJIL" }),
        ),
        "classId",
    );
    let class2_id = str_field(
        &call(
            "class.create",
            json!({ "courseId": course2_id, "name": "IF102-A", "year": 2024, "semester": "GENAP" }),
        ),
        "classId",
    );

    for (nim, name) in [(ANI, "Ani"), (BUDI, "Budi"), (CITRA, "Citra")] {
        let _ = call("students.upsert", json!({ "nim": nim, "name": name }));
    }
    for class_id in [&class1_id, &class2_id] {
        let _ = call(
            "enrollment.set",
            json!({ "classId": class_id, "nims": [ANI, BUDI, CITRA] }),
        );
    }

    let mut component = |class_id: &str, name: &str, weight: f64, cpmk_id: &str| {
        str_field(
            &call(
                "components.upsert",
                json!({ "classId": class_id, "name": name, "weight": weight, "cpmkId": cpmk_id }),
            ),
            "componentId",
        )
    };
    let uts_id = component(&class1_id, "UTS", 30.0, &cpmk1_id);
    let uas_id = component(&class1_id, "UAS", 30.0, &cpmk1_id);
    let tugas_id = component(&class1_id, "Tugas", 40.0, &cpmk1_id);
    let proyek_id = component(&class2_id, "Proyek", 100.0, &cpmk2_id);

    Program {
        curriculum_id,
        cpl_id,
        ik_id,
        course1_id,
        course2_id,
        rps1_id,
        cpmk1_id,
        cpmk2_id,
        class1_id,
        class2_id,
        uts_id,
        uas_id,
        tugas_id,
        proyek_id,
    }
}
