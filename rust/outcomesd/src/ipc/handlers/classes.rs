use crate::db;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::rollup::{self, WeightEntry, WeightRule};
use crate::store;
use crate::term::{AcademicTerm, Semester};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_class_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(year) = req.params.get("year").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing/invalid year", None);
    };
    let Some(semester) = req
        .params
        .get("semester")
        .and_then(|v| v.as_str())
        .and_then(Semester::parse)
    else {
        return err(&req.id, "bad_params", "semester must be GANJIL or GENAP", None);
    };

    let course_exists: Option<String> = match conn
        .query_row("SELECT id FROM courses WHERE id = ?", [&course_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if course_exists.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, course_id, name, term_year, term_semester) VALUES(?, ?, ?, ?, ?)",
        (&id, &course_id, &name, year, semester.as_str()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    let term = AcademicTerm { year, semester };
    ok(&req.id, json!({ "classId": id, "term": term.to_string() }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let curriculum_id = match optional_str(req, "curriculumId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT cl.id, cl.name, cl.term_year, cl.term_semester, co.id, co.code, co.curriculum_id,
                (SELECT COUNT(*) FROM enrollments e WHERE e.class_id = cl.id),
                (SELECT COUNT(*) FROM components c WHERE c.class_id = cl.id)
         FROM classes cl
         JOIN courses co ON co.id = cl.course_id
         WHERE (?1 IS NULL OR co.curriculum_id = ?1)
         ORDER BY cl.term_year, cl.term_semester, co.code, cl.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&curriculum_id], |r| {
            let year: i64 = r.get(2)?;
            let semester: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "term": format!("{}-{}", year, semester),
                "courseId": r.get::<_, String>(4)?,
                "courseCode": r.get::<_, String>(5)?,
                "curriculumId": r.get::<_, String>(6)?,
                "studentCount": r.get::<_, i64>(7)?,
                "componentCount": r.get::<_, i64>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nim = match required_str(req, "nim") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<String> = match conn
        .query_row("SELECT id FROM students WHERE nim = ?", [&nim], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let now = db::now_rfc3339();
    if let Some(id) = existing {
        if let Err(e) = conn.execute(
            "UPDATE students SET name = ?, updated_at = ? WHERE id = ?",
            (&name, &now, &id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        return ok(&req.id, json!({ "studentId": id, "created": false }));
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, nim, name, updated_at) VALUES(?, ?, ?, ?)",
        (&id, &nim, &name, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    ok(&req.id, json!({ "studentId": id, "created": true }))
}

fn handle_enrollment_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(nims) = req.params.get("nims").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing nims[]", None);
    };
    if let Err(e) = store::load_class(conn, &class_id) {
        return calc_err(&req.id, e);
    }

    let mut student_ids = Vec::with_capacity(nims.len());
    let mut missing = Vec::new();
    for v in nims {
        let Some(nim) = v.as_str() else {
            return err(&req.id, "bad_params", "nims must contain only strings", None);
        };
        match store::find_student_by_nim(conn, nim) {
            Ok(s) => student_ids.push(s.id),
            Err(e) if e.code == "not_found" => missing.push(nim.to_string()),
            Err(e) => return calc_err(&req.id, e),
        }
    }
    if !missing.is_empty() {
        return err(
            &req.id,
            "not_found",
            "unknown students",
            Some(json!({ "nims": missing })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let now = db::now_rfc3339();
    let mut added = 0usize;
    for student_id in &student_ids {
        match tx.execute(
            "INSERT OR IGNORE INTO enrollments(class_id, student_id, enrolled_at) VALUES(?, ?, ?)",
            (&class_id, student_id, &now),
        ) {
            Ok(n) => added += n,
            Err(e) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "enrollments" })),
                );
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, "added": added, "requested": student_ids.len() }))
}

/// The CPMK must belong to the class's course.
fn check_component_cpmk(
    conn: &Connection,
    course_id: &str,
    cpmk_id: &str,
) -> Result<bool, rusqlite::Error> {
    let found: Option<String> = conn
        .query_row(
            "SELECT k.id FROM cpmks k JOIN rps r ON r.id = k.rps_id
             WHERE k.id = ? AND r.course_id = ?",
            (cpmk_id, course_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn handle_components_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let weight = match req.params.get("weight").and_then(|v| v.as_f64()) {
        Some(w) if (0.0..=100.0).contains(&w) => w,
        _ => {
            return err(
                &req.id,
                "bad_params",
                "weight must be a number between 0 and 100",
                None,
            )
        }
    };
    let cpmk_id = match optional_str(req, "cpmkId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let class = match store::load_class(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    if let Some(k) = &cpmk_id {
        match check_component_cpmk(conn, &class.course_id, k) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "bad_params",
                    "cpmkId does not belong to this class's course",
                    Some(json!({ "cpmkId": k })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM components WHERE class_id = ? AND name = ?",
            (&class_id, &name),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(id) = existing {
        if let Err(e) = conn.execute(
            "UPDATE components SET name = ?, weight = ?, cpmk_id = ? WHERE id = ?",
            (&name, weight, &cpmk_id, &id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        return ok(&req.id, json!({ "componentId": id, "created": false }));
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM components WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO components(id, class_id, name, weight, cpmk_id, sort_order) VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &class_id, &name, weight, &cpmk_id, sort_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "components" })),
        );
    }
    ok(&req.id, json!({ "componentId": id, "created": true }))
}

fn handle_components_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class = match store::load_class(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let components = match store::load_class_components(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let settings = match setup::load_rollup_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let entries: Vec<WeightEntry> = components
        .iter()
        .map(|c| WeightEntry {
            label: c.name.clone(),
            weight: c.weight,
        })
        .collect();
    let check = rollup::validate_weights(
        &entries,
        settings.weight_total,
        settings.weight_epsilon,
        WeightRule::Exact,
    );
    if !check.valid {
        tracing::warn!(class_id = %class_id, sum = check.sum, "component weights do not sum to total");
    }

    ok(
        &req.id,
        json!({
            "class": class.to_json(),
            "components": components,
            "weightCheck": check,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "class.create" => Some(handle_class_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "students.upsert" => Some(handle_students_upsert(state, req)),
        "enrollment.set" => Some(handle_enrollment_set(state, req)),
        "components.upsert" => Some(handle_components_upsert(state, req)),
        "components.list" => Some(handle_components_list(state, req)),
        _ => None,
    }
}
