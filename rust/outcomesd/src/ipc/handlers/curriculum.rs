use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{db_conn, optional_f64, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::rollup::{self, WeightEntry, WeightRule};
use crate::store::{self, CpmkRow, CurriculumSnapshot};
use crate::term::TermScope;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

fn lookup_id(
    conn: &Connection,
    sql: &str,
    params: (&str, &str),
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(sql, params, |r| r.get(0)).optional()
}

fn next_sort_order(conn: &Connection, sql: &str, parent_id: &str) -> Result<i64, rusqlite::Error> {
    conn.query_row(sql, [parent_id], |r| r.get::<_, i64>(0))
}

fn handle_curriculum_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing: Option<String> = match conn
        .query_row("SELECT id FROM curricula WHERE code = ?", [&code], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(id) = existing {
        if let Err(e) = conn.execute("UPDATE curricula SET name = ? WHERE id = ?", (&name, &id)) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        return ok(&req.id, json!({ "curriculumId": id, "created": false }));
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO curricula(id, code, name) VALUES(?, ?, ?)",
        (&id, &code, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "curricula" })),
        );
    }
    ok(&req.id, json!({ "curriculumId": id, "created": true }))
}

fn handle_cpl_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let curriculum_id = match required_str(req, "curriculumId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = match optional_str(req, "description") {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => return e,
    };
    if let Err(e) = store::require_curriculum(conn, &curriculum_id) {
        return calc_err(&req.id, e);
    }

    let existing = match lookup_id(
        conn,
        "SELECT id FROM cpls WHERE curriculum_id = ? AND code = ?",
        (&curriculum_id, &code),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(id) = existing {
        if let Err(e) = conn.execute(
            "UPDATE cpls SET description = ? WHERE id = ?",
            (&description, &id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        return ok(&req.id, json!({ "cplId": id, "created": false }));
    }

    let sort_order = match next_sort_order(
        conn,
        "SELECT COUNT(*) FROM cpls WHERE curriculum_id = ?",
        &curriculum_id,
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO cpls(id, curriculum_id, code, description, sort_order) VALUES(?, ?, ?, ?, ?)",
        (&id, &curriculum_id, &code, &description, sort_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "cpls" })),
        );
    }
    ok(&req.id, json!({ "cplId": id, "created": true }))
}

fn handle_ik_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cpl_id = match required_str(req, "cplId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = match optional_str(req, "description") {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => return e,
    };
    if let Err(e) = store::curriculum_of_cpl(conn, &cpl_id) {
        return calc_err(&req.id, e);
    }

    let existing = match lookup_id(
        conn,
        "SELECT id FROM iks WHERE cpl_id = ? AND code = ?",
        (&cpl_id, &code),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(id) = existing {
        if let Err(e) = conn.execute(
            "UPDATE iks SET description = ? WHERE id = ?",
            (&description, &id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        return ok(&req.id, json!({ "ikId": id, "created": false }));
    }

    let sort_order = match next_sort_order(conn, "SELECT COUNT(*) FROM iks WHERE cpl_id = ?", &cpl_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO iks(id, cpl_id, code, description, sort_order) VALUES(?, ?, ?, ?, ?)",
        (&id, &cpl_id, &code, &description, sort_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "iks" })),
        );
    }
    ok(&req.id, json!({ "ikId": id, "created": true }))
}

fn handle_course_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let curriculum_id = match required_str(req, "curriculumId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = store::require_curriculum(conn, &curriculum_id) {
        return calc_err(&req.id, e);
    }

    let existing = match lookup_id(
        conn,
        "SELECT id FROM courses WHERE curriculum_id = ? AND code = ?",
        (&curriculum_id, &code),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(id) = existing {
        if let Err(e) = conn.execute("UPDATE courses SET name = ? WHERE id = ?", (&name, &id)) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        return ok(&req.id, json!({ "courseId": id, "created": false }));
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, curriculum_id, code, name) VALUES(?, ?, ?, ?)",
        (&id, &curriculum_id, &code, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }
    ok(&req.id, json!({ "courseId": id, "created": true }))
}

fn handle_rps_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let revision = match optional_str(req, "revision") {
        Ok(v) => v.unwrap_or_else(|| "1".to_string()),
        Err(e) => return e,
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

    let existing = match lookup_id(
        conn,
        "SELECT id FROM rps WHERE course_id = ? AND revision = ?",
        (&course_id, &revision),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(id) = existing {
        return ok(&req.id, json!({ "rpsId": id, "created": false }));
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO rps(id, course_id, revision) VALUES(?, ?, ?)",
        (&id, &course_id, &revision),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "rps" })),
        );
    }
    ok(&req.id, json!({ "rpsId": id, "created": true }))
}

fn parse_ik_ids(req: &Request) -> Result<Vec<String>, serde_json::Value> {
    let Some(raw) = req.params.get("ikIds") else {
        return Ok(Vec::new());
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let Some(arr) = raw.as_array() else {
        return Err(err(&req.id, "bad_params", "ikIds must be an array", None));
    };
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for v in arr {
        let Some(id) = v.as_str().map(|s| s.trim()).filter(|s| !s.is_empty()) else {
            return Err(err(
                &req.id,
                "bad_params",
                "ikIds must contain only non-empty strings",
                None,
            ));
        };
        if seen.insert(id.to_string()) {
            out.push(id.to_string());
        }
    }
    Ok(out)
}

/// A CPMK reaches its CPL either directly or through its IKs; both paths must agree.
fn resolve_cpmk_cpl(
    conn: &Connection,
    req: &Request,
    curriculum_id: &str,
    explicit_cpl: Option<String>,
    ik_ids: &[String],
) -> Result<Option<String>, serde_json::Value> {
    if let Some(cpl_id) = &explicit_cpl {
        match store::curriculum_of_cpl(conn, cpl_id) {
            Ok(c) if c == curriculum_id => {}
            Ok(_) => {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "cplId belongs to a different curriculum",
                    Some(json!({ "cplId": cpl_id })),
                ))
            }
            Err(e) => return Err(calc_err(&req.id, e)),
        }
    }

    let mut ik_cpls: Vec<String> = Vec::new();
    for ik_id in ik_ids {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT i.cpl_id, c.curriculum_id FROM iks i JOIN cpls c ON c.id = i.cpl_id WHERE i.id = ?",
                [ik_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
        let Some((cpl_id, ik_curriculum)) = row else {
            return Err(err(
                &req.id,
                "not_found",
                "ik not found",
                Some(json!({ "ikId": ik_id })),
            ));
        };
        if ik_curriculum != curriculum_id {
            return Err(err(
                &req.id,
                "bad_params",
                "ik belongs to a different curriculum",
                Some(json!({ "ikId": ik_id })),
            ));
        }
        if !ik_cpls.contains(&cpl_id) {
            ik_cpls.push(cpl_id);
        }
    }

    match explicit_cpl {
        Some(cpl_id) => {
            if ik_cpls.iter().any(|c| *c != cpl_id) {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "every linked IK must belong to the CPMK's CPL",
                    Some(json!({ "cplId": cpl_id })),
                ));
            }
            Ok(Some(cpl_id))
        }
        None => match ik_cpls.len() {
            0 => Ok(None),
            1 => Ok(ik_cpls.pop()),
            _ => Err(err(
                &req.id,
                "bad_params",
                "linked IKs span more than one CPL; pass cplId explicitly",
                None,
            )),
        },
    }
}

fn handle_cpmk_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rps_id = match required_str(req, "rpsId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = match optional_str(req, "description") {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => return e,
    };
    let explicit_cpl = match optional_str(req, "cplId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let bobot_to_cpl = match optional_f64(req, "bobotToCpl") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(b) = bobot_to_cpl {
        if !(0.0..=100.0).contains(&b) {
            return err(
                &req.id,
                "bad_params",
                "bobotToCpl must be between 0 and 100",
                Some(json!({ "bobotToCpl": b })),
            );
        }
    }
    let ik_ids = match parse_ik_ids(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let curriculum_id: Option<String> = match conn
        .query_row(
            "SELECT co.curriculum_id FROM rps r JOIN courses co ON co.id = r.course_id WHERE r.id = ?",
            [&rps_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(curriculum_id) = curriculum_id else {
        return err(&req.id, "not_found", "rps not found", None);
    };

    let cpl_id = match resolve_cpmk_cpl(conn, req, &curriculum_id, explicit_cpl, &ik_ids) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if cpl_id.is_none() && bobot_to_cpl.is_some() {
        return err(
            &req.id,
            "bad_params",
            "bobotToCpl requires a CPL (cplId or ikIds)",
            None,
        );
    }

    let existing = match lookup_id(
        conn,
        "SELECT id FROM cpmks WHERE rps_id = ? AND code = ?",
        (&rps_id, &code),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let sort_order = match next_sort_order(conn, "SELECT COUNT(*) FROM cpmks WHERE rps_id = ?", &rps_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let created = existing.is_none();
    let cpmk_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());
    let write = if created {
        tx.execute(
            "INSERT INTO cpmks(id, rps_id, code, description, cpl_id, bobot_to_cpl, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &cpmk_id,
                &rps_id,
                &code,
                &description,
                &cpl_id,
                bobot_to_cpl,
                sort_order,
            ),
        )
    } else {
        tx.execute(
            "UPDATE cpmks SET description = ?, cpl_id = ?, bobot_to_cpl = ? WHERE id = ?",
            (&description, &cpl_id, bobot_to_cpl, &cpmk_id),
        )
    };
    if let Err(e) = write {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "cpmks" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM cpmk_iks WHERE cpmk_id = ?", [&cpmk_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "cpmk_iks" })),
        );
    }
    for ik_id in &ik_ids {
        if let Err(e) = tx.execute(
            "INSERT INTO cpmk_iks(cpmk_id, ik_id) VALUES(?, ?)",
            (&cpmk_id, ik_id),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "cpmk_iks" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "cpmkId": cpmk_id,
            "created": created,
            "cplId": cpl_id,
            "bobotToCpl": bobot_to_cpl,
            "ikIds": ik_ids
        }),
    )
}

fn cpmk_json(k: &CpmkRow) -> serde_json::Value {
    json!({
        "id": k.id,
        "code": k.code,
        "description": k.description,
        "courseId": k.course_id,
        "courseCode": k.course_code,
        "rpsId": k.rps_id,
        "revision": k.rps_revision,
        "bobotToCpl": k.bobot_to_cpl,
        "ikIds": k.ik_ids,
    })
}

fn handle_curriculum_tree(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let curriculum_id = match required_str(req, "curriculumId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let settings = match setup::load_rollup_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let snapshot = match CurriculumSnapshot::load(conn, &curriculum_id, &TermScope::All) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let mut cpls_out = Vec::with_capacity(snapshot.cpls.len());
    for cpl in &snapshot.cpls {
        let iks: Vec<serde_json::Value> = snapshot
            .iks_of_cpl(&cpl.id)
            .map(|ik| {
                let cpmk_ids: Vec<&str> = snapshot
                    .cpmks
                    .iter()
                    .filter(|k| k.ik_ids.contains(&ik.id))
                    .map(|k| k.id.as_str())
                    .collect();
                json!({
                    "id": ik.id,
                    "code": ik.code,
                    "description": ik.description,
                    "cpmkIds": cpmk_ids,
                })
            })
            .collect();

        // Weight groups: CPMKs of one syllabus revision feeding this CPL.
        let mut groups: BTreeMap<(String, String, String), (String, Vec<WeightEntry>)> =
            BTreeMap::new();
        for k in snapshot.cpmks_of_cpl(&cpl.id) {
            let Some(weight) = k.bobot_to_cpl else {
                continue;
            };
            groups
                .entry((k.course_code.clone(), k.rps_revision.clone(), k.rps_id.clone()))
                .or_insert_with(|| (k.course_id.clone(), Vec::new()))
                .1
                .push(WeightEntry {
                    label: k.code.clone(),
                    weight,
                });
        }
        let weight_checks: Vec<serde_json::Value> = groups
            .iter()
            .map(|((course_code, revision, rps_id), (course_id, entries))| {
                let check = rollup::validate_weights(
                    entries,
                    settings.weight_total,
                    settings.weight_epsilon,
                    WeightRule::AtMost,
                );
                json!({
                    "courseId": course_id,
                    "courseCode": course_code,
                    "rpsId": rps_id,
                    "revision": revision,
                    "check": check,
                })
            })
            .collect();

        cpls_out.push(json!({
            "id": cpl.id,
            "code": cpl.code,
            "description": cpl.description,
            "iks": iks,
            "cpmks": snapshot.cpmks_of_cpl(&cpl.id).map(cpmk_json).collect::<Vec<_>>(),
            "weightChecks": weight_checks,
        }));
    }

    let unmapped: Vec<serde_json::Value> = snapshot
        .cpmks
        .iter()
        .filter(|k| k.cpl_id.is_none() || k.bobot_to_cpl.is_none())
        .map(cpmk_json)
        .collect();

    ok(
        &req.id,
        json!({
            "curriculumId": curriculum_id,
            "cpls": cpls_out,
            "unmappedCpmks": unmapped,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "curriculum.create" => Some(handle_curriculum_create(state, req)),
        "cpl.upsert" => Some(handle_cpl_upsert(state, req)),
        "ik.upsert" => Some(handle_ik_upsert(state, req)),
        "course.upsert" => Some(handle_course_upsert(state, req)),
        "rps.upsert" => Some(handle_rps_upsert(state, req)),
        "cpmk.upsert" => Some(handle_cpmk_upsert(state, req)),
        "curriculum.tree" => Some(handle_curriculum_tree(state, req)),
        _ => None,
    }
}
