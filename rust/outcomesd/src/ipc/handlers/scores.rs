use crate::db;
use crate::import::{self, ComponentRef, ImportTable};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store;
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn handle_scores_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nim = match required_str(req, "nim") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let value = match req.params.get("value") {
        None => return err(&req.id, "bad_params", "missing value (use null to clear)", None),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(f) if f.is_finite() => Some(f),
            _ => return err(&req.id, "bad_params", "value must be a number or null", None),
        },
    };

    let student = match store::find_student_by_nim(conn, &nim) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let enrolled: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE class_id = ? AND student_id = ?",
            (&class_id, &student.id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if enrolled.is_none() {
        return err(
            &req.id,
            "bad_params",
            "student is not enrolled in this class",
            Some(json!({ "nim": nim, "classId": class_id })),
        );
    }
    let component_class: Option<String> = match conn
        .query_row(
            "SELECT class_id FROM components WHERE id = ?",
            [&component_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match component_class {
        None => return err(&req.id, "not_found", "component not found", None),
        Some(c) if c != class_id => {
            return err(
                &req.id,
                "bad_params",
                "component does not belong to this class",
                Some(json!({ "componentId": component_id })),
            )
        }
        Some(_) => {}
    }

    let result = match value {
        Some(v) => conn.execute(
            "INSERT INTO component_scores(id, component_id, student_id, score, updated_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(component_id, student_id) DO UPDATE SET
               score = excluded.score,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &component_id,
                &student.id,
                v,
                db::now_rfc3339(),
            ),
        ),
        None => conn.execute(
            "DELETE FROM component_scores WHERE component_id = ? AND student_id = ?",
            (&component_id, &student.id),
        ),
    };
    if let Err(e) = result {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let suspect = value.is_some_and(|v| !(0.0..=100.0).contains(&v));
    ok(
        &req.id,
        json!({
            "ok": true,
            "score": value,
            "noData": value.is_none(),
            "suspect": suspect,
        }),
    )
}

fn build_table(req: &Request) -> Result<ImportTable, serde_json::Value> {
    let parsed = if let Some(text) = req.params.get("csvText").and_then(|v| v.as_str()) {
        import::table_from_csv(text)
    } else {
        let (Some(columns), Some(rows)) = (req.params.get("columns"), req.params.get("rows"))
        else {
            return Err(err(
                &req.id,
                "bad_params",
                "provide csvText or columns[] and rows[]",
                None,
            ));
        };
        import::table_from_json(columns, rows)
    };
    parsed.map_err(|issues| {
        err(
            &req.id,
            "import_rejected",
            "import input could not be parsed",
            Some(json!({ "issues": import::issues_json(&issues) })),
        )
    })
}

fn handle_scores_bulk_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let table = match build_table(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = store::load_class(conn, &class_id) {
        return calc_err(&req.id, e);
    }
    let components: Vec<ComponentRef> = match store::load_class_components(conn, &class_id) {
        Ok(rows) => rows
            .into_iter()
            .map(|c| ComponentRef {
                id: c.id,
                name: c.name,
            })
            .collect(),
        Err(e) => return calc_err(&req.id, e),
    };
    let enrolled: HashMap<String, String> = match store::load_class_students(conn, &class_id) {
        Ok(rows) => rows.into_iter().map(|s| (s.nim, s.id)).collect(),
        Err(e) => return calc_err(&req.id, e),
    };

    let plan = match import::plan_import(&table, &components, &enrolled) {
        Ok(p) => p,
        Err(issues) => {
            tracing::warn!(class_id = %class_id, issues = issues.len(), "bulk import rejected");
            return err(
                &req.id,
                "import_rejected",
                format!("import rejected: {} issue(s)", issues.len()),
                Some(json!({ "issues": import::issues_json(&issues) })),
            );
        }
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let now = db::now_rfc3339();
    for w in &plan.writes {
        let result = match w.value {
            Some(v) => tx.execute(
                "INSERT INTO component_scores(id, component_id, student_id, score, updated_at)
                 VALUES(?, ?, ?, ?, ?)
                 ON CONFLICT(component_id, student_id) DO UPDATE SET
                   score = excluded.score,
                   updated_at = excluded.updated_at",
                (
                    Uuid::new_v4().to_string(),
                    &w.component_id,
                    &w.student_id,
                    v,
                    &now,
                ),
            ),
            None => tx.execute(
                "DELETE FROM component_scores WHERE component_id = ? AND student_id = ?",
                (&w.component_id, &w.student_id),
            ),
        };
        if let Err(e) = result {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "component_scores" })),
            );
        }
    }

    let batch_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO import_batches(id, class_id, content_sha256, row_count, cell_count, cleared_count, imported_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &batch_id,
            &class_id,
            &plan.fingerprint,
            plan.row_count as i64,
            plan.cell_count as i64,
            plan.cleared_count as i64,
            &now,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "import_batches" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(
        class_id = %class_id,
        batch_id = %batch_id,
        rows = plan.row_count,
        cells = plan.cell_count,
        cleared = plan.cleared_count,
        suspect = plan.suspect_count,
        "bulk import committed"
    );
    ok(
        &req.id,
        json!({
            "batchId": batch_id,
            "rowCount": plan.row_count,
            "cellCount": plan.cell_count,
            "clearedCount": plan.cleared_count,
            "suspectCount": plan.suspect_count,
            "fingerprint": plan.fingerprint,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.set" => Some(handle_scores_set(state, req)),
        "scores.bulkImport" => Some(handle_scores_bulk_import(state, req)),
        _ => None,
    }
}
