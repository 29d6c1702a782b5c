use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::handlers::calc::{attainment_json, Cohort, OutcomeLevel};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{db_conn, optional_f64, parse_scope, required_str};
use crate::ipc::types::{AppState, Request};
use crate::rollup::{self, WeightEntry, WeightRule};
use crate::store::{self, ClassSheet, CurriculumSnapshot};
use serde_json::json;

fn handle_student_outcomes(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nim = match required_str(req, "nim") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let curriculum_id = match required_str(req, "curriculumId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match parse_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let settings = match setup::load_rollup_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let student = match store::find_student_by_nim(conn, &nim) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let snapshot = match CurriculumSnapshot::load(conn, &curriculum_id, &scope) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let policy = settings.missing_policy;

    let cpls: Vec<serde_json::Value> = snapshot
        .cpls
        .iter()
        .map(|cpl| {
            let iks: Vec<serde_json::Value> = snapshot
                .iks_of_cpl(&cpl.id)
                .map(|ik| {
                    attainment_json(
                        snapshot.ik_score(&student.id, &ik.id, policy),
                        json!({ "id": ik.id, "code": ik.code, "description": ik.description }),
                    )
                })
                .collect();
            let cpmks: Vec<serde_json::Value> = snapshot
                .cpmks_of_cpl(&cpl.id)
                .map(|k| {
                    attainment_json(
                        snapshot.cpmk_score(&student.id, &k.id, policy),
                        json!({
                            "id": k.id,
                            "code": k.code,
                            "courseCode": k.course_code,
                            "bobotToCpl": k.bobot_to_cpl,
                        }),
                    )
                })
                .collect();
            attainment_json(
                snapshot.cpl_score(&student.id, &cpl.id, policy),
                json!({
                    "id": cpl.id,
                    "code": cpl.code,
                    "description": cpl.description,
                    "iks": iks,
                    "cpmks": cpmks,
                }),
            )
        })
        .collect();

    ok(
        &req.id,
        json!({
            "student": student,
            "curriculumId": curriculum_id,
            "scope": scope.to_json(),
            "cpls": cpls,
        }),
    )
}

fn handle_program_matrix(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let curriculum_id = match required_str(req, "curriculumId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match parse_scope(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let settings = match setup::load_rollup_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let threshold = match optional_f64(req, "threshold") {
        Ok(v) => v.or(settings.pass_threshold),
        Err(e) => return e,
    };

    let cohort = match Cohort::load(conn, &json!({ "curriculumId": curriculum_id }), &scope) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let policy = settings.missing_policy;
    let stats = cohort.outcome_stats(OutcomeLevel::Cpl, policy, threshold);
    let columns: Vec<serde_json::Value> = cohort
        .snapshot
        .cpls
        .iter()
        .map(|c| json!({ "id": c.id, "code": c.code }))
        .collect();
    let rows: Vec<serde_json::Value> = cohort
        .students
        .iter()
        .map(|s| {
            let cells: Vec<serde_json::Value> = cohort
                .snapshot
                .cpls
                .iter()
                .map(|c| cohort.snapshot.cpl_score(&s.id, &c.id, policy).to_json())
                .collect();
            json!({ "nim": s.nim, "name": s.name, "cpls": cells })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "curriculumId": curriculum_id,
            "scope": scope.to_json(),
            "threshold": threshold,
            "cpls": columns,
            "stats": stats,
            "students": rows,
        }),
    )
}

fn handle_class_cpmk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let settings = match setup::load_rollup_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let scale = match setup::load_letter_scale(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let sheet = match ClassSheet::load(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let policy = settings.missing_policy;

    let entries: Vec<WeightEntry> = sheet
        .components
        .iter()
        .map(|c| WeightEntry {
            label: c.name.clone(),
            weight: c.weight,
        })
        .collect();
    let weight_check = rollup::validate_weights(
        &entries,
        settings.weight_total,
        settings.weight_epsilon,
        WeightRule::Exact,
    );

    let cpmks: Vec<serde_json::Value> = sheet
        .cpmks
        .iter()
        .map(|k| {
            let stats = rollup::cohort_stats(
                sheet
                    .students
                    .iter()
                    .map(|s| sheet.cpmk_score(&s.id, &k.id, policy)),
                settings.pass_threshold,
            );
            json!({ "id": k.id, "code": k.code, "description": k.description, "stats": stats })
        })
        .collect();

    let mut suspect_count = 0usize;
    let students: Vec<serde_json::Value> = sheet
        .students
        .iter()
        .map(|s| {
            let cells: Vec<serde_json::Value> = sheet
                .cpmks
                .iter()
                .map(|k| {
                    attainment_json(
                        sheet.cpmk_score(&s.id, &k.id, policy),
                        json!({ "cpmkId": k.id }),
                    )
                })
                .collect();
            let course = sheet.course_score(&s.id, policy);
            let (letter, suspect) = match course.value() {
                Some(v) => {
                    let g = scale.grade(v);
                    (g.letter, g.suspect)
                }
                None => (None, false),
            };
            if suspect {
                suspect_count += 1;
            }
            json!({
                "nim": s.nim,
                "name": s.name,
                "cpmks": cells,
                "course": course.to_json(),
                "letter": letter,
                "suspect": suspect,
            })
        })
        .collect();

    if suspect_count > 0 {
        tracing::warn!(class_id = %class_id, suspect = suspect_count, "course scores outside 0..=100");
    }
    ok(
        &req.id,
        json!({
            "class": sheet.class.to_json(),
            "weightCheck": weight_check,
            "cpmks": cpmks,
            "students": students,
            "suspectCount": suspect_count,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentOutcomes" => Some(handle_student_outcomes(state, req)),
        "reports.programMatrix" => Some(handle_program_matrix(state, req)),
        "reports.classCpmk" => Some(handle_class_cpmk(state, req)),
        _ => None,
    }
}
