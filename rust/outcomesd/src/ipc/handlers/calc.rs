use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{db_conn, optional_f64, optional_str, parse_scope, required_str};
use crate::ipc::types::{AppState, Request};
use crate::rollup::{self, Attainment, CalcError, MissingPolicy, WeightEntry, WeightRule};
use crate::store::{self, CurriculumSnapshot, StudentRow};
use rusqlite::Connection;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum OutcomeLevel {
    Cpmk,
    Cpl,
}

impl OutcomeLevel {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpmk" => Some(Self::Cpmk),
            "cpl" => Some(Self::Cpl),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Cpmk => "cpmk",
            Self::Cpl => "cpl",
        }
    }
}

/// Students whose per-outcome scores are aggregated, plus the outcomes in play.
pub(super) struct Cohort {
    pub snapshot: CurriculumSnapshot,
    pub students: Vec<StudentRow>,
    /// Restricts CPMK-level outcomes to one course when the cohort is a class.
    pub course_id: Option<String>,
    pub label: serde_json::Value,
}

impl Cohort {
    /// A class cohort is its enrollment list; scores still come from every
    /// in-scope class, so the same student gets the same score everywhere.
    pub fn load(
        conn: &Connection,
        selector: &serde_json::Value,
        scope: &crate::term::TermScope,
    ) -> Result<Self, CalcError> {
        let class_id = selector.get("classId").and_then(|v| v.as_str());
        let curriculum_id = selector.get("curriculumId").and_then(|v| v.as_str());
        match (class_id, curriculum_id) {
            (Some(class_id), _) => {
                let class = store::load_class(conn, class_id)?;
                let snapshot = CurriculumSnapshot::load(conn, &class.curriculum_id, scope)?;
                let students = store::load_class_students(conn, class_id)?;
                Ok(Cohort {
                    snapshot,
                    students,
                    course_id: Some(class.course_id.clone()),
                    label: json!({ "classId": class.id, "term": class.term.to_string() }),
                })
            }
            (None, Some(curriculum_id)) => {
                let snapshot = CurriculumSnapshot::load(conn, curriculum_id, scope)?;
                let students = snapshot.students.clone();
                Ok(Cohort {
                    snapshot,
                    students,
                    course_id: None,
                    label: json!({ "curriculumId": curriculum_id }),
                })
            }
            (None, None) => Err(CalcError::new(
                "bad_params",
                "cohort must name a classId or a curriculumId",
            )),
        }
    }

    pub fn outcome_stats(
        &self,
        level: OutcomeLevel,
        policy: MissingPolicy,
        threshold: Option<f64>,
    ) -> Vec<serde_json::Value> {
        match level {
            OutcomeLevel::Cpmk => self
                .snapshot
                .cpmks
                .iter()
                .filter(|k| self.course_id.as_deref().map_or(true, |c| c == k.course_id))
                .map(|k| {
                    let stats = rollup::cohort_stats(
                        self.students
                            .iter()
                            .map(|s| self.snapshot.cpmk_score(&s.id, &k.id, policy)),
                        threshold,
                    );
                    json!({
                        "id": k.id,
                        "code": k.code,
                        "courseCode": k.course_code,
                        "stats": stats,
                    })
                })
                .collect(),
            OutcomeLevel::Cpl => self
                .snapshot
                .cpls
                .iter()
                .map(|c| {
                    let stats = rollup::cohort_stats(
                        self.students
                            .iter()
                            .map(|s| self.snapshot.cpl_score(&s.id, &c.id, policy)),
                        threshold,
                    );
                    json!({
                        "id": c.id,
                        "code": c.code,
                        "stats": stats,
                    })
                })
                .collect(),
        }
    }
}

pub(super) fn attainment_json(a: Attainment, mut extra: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = extra.as_object_mut() {
        obj.insert("score".into(), json!(a.value()));
        obj.insert("noData".into(), json!(a.is_no_data()));
    }
    extra
}

fn weight_entries(raw: &serde_json::Value) -> Result<Vec<WeightEntry>, String> {
    let Some(items) = raw.as_array() else {
        return Err("weights must be an array".into());
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let weight = item
                .get("weight")
                .and_then(|v| v.as_f64())
                .filter(|w| w.is_finite())
                .ok_or_else(|| format!("weights[{}].weight must be a number", i))?;
            let label = item
                .get("label")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("#{}", i + 1));
            Ok(WeightEntry { label, weight })
        })
        .collect()
}

fn handle_weights_validate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let settings = match setup::load_rollup_settings(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let expected = match optional_f64(req, "expected") {
        Ok(v) => v.unwrap_or(settings.weight_total),
        Err(e) => return e,
    };
    let class_id = match optional_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match optional_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cpl_id = match optional_str(req, "cplId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rps_id = match optional_str(req, "rpsId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let (entries, rule) = if let Some(raw) = req.params.get("weights") {
        let entries = match weight_entries(raw) {
            Ok(v) => v,
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        };
        let rule = match req.params.get("rule").and_then(|v| v.as_str()) {
            None => WeightRule::Exact,
            Some(s) => match WeightRule::parse(s) {
                Some(r) => r,
                None => return err(&req.id, "bad_params", "rule must be exact or atMost", None),
            },
        };
        (entries, rule)
    } else if let Some(class_id) = class_id {
        if let Err(e) = store::load_class(conn, &class_id) {
            return calc_err(&req.id, e);
        }
        let components = match store::load_class_components(conn, &class_id) {
            Ok(v) => v,
            Err(e) => return calc_err(&req.id, e),
        };
        let entries = components
            .into_iter()
            .map(|c| WeightEntry {
                label: c.name,
                weight: c.weight,
            })
            .collect();
        (entries, WeightRule::Exact)
    } else if let (Some(course_id), Some(cpl_id)) = (course_id, cpl_id) {
        let rps_id = match rps_id {
            Some(v) => v,
            None => match store::latest_rps_of_course(conn, &course_id) {
                Ok(v) => v,
                Err(e) => return calc_err(&req.id, e),
            },
        };
        let cpmks = match store::load_course_cpmks(conn, &course_id) {
            Ok(v) => v,
            Err(e) => return calc_err(&req.id, e),
        };
        let entries = cpmks
            .into_iter()
            .filter(|k| k.rps_id == rps_id)
            .filter(|k| k.cpl_id.as_deref() == Some(cpl_id.as_str()))
            .filter_map(|k| {
                k.bobot_to_cpl.map(|w| WeightEntry {
                    label: k.code,
                    weight: w,
                })
            })
            .collect();
        (entries, WeightRule::AtMost)
    } else {
        return err(
            &req.id,
            "bad_params",
            "provide weights[], classId, or courseId with cplId (and optional rpsId)",
            None,
        );
    };

    let check = rollup::validate_weights(&entries, expected, settings.weight_epsilon, rule);
    if !check.valid {
        tracing::warn!(sum = check.sum, expected = check.expected, "weight group does not validate");
    }
    let labels: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| json!({ "label": e.label, "weight": e.weight }))
        .collect();
    ok(
        &req.id,
        json!({
            "sum": check.sum,
            "valid": check.valid,
            "check": check,
            "weights": labels,
        }),
    )
}

fn handle_calc_cpmk_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nim = match required_str(req, "nim") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cpmk_id = match required_str(req, "cpmkId") {
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
    let curriculum_id = match store::curriculum_of_cpmk(conn, &cpmk_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let snapshot = match CurriculumSnapshot::load(conn, &curriculum_id, &scope) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let inputs = snapshot.cpmk_inputs(&student.id, &cpmk_id);
    let score = rollup::cpmk_score(&inputs, settings.missing_policy);
    let inputs_json: Vec<serde_json::Value> = inputs
        .iter()
        .map(|c| json!({ "weight": c.weight, "score": c.score }))
        .collect();
    ok(
        &req.id,
        attainment_json(
            score,
            json!({
                "nim": student.nim,
                "cpmkId": cpmk_id,
                "scope": scope.to_json(),
                "missingPolicy": settings.missing_policy.as_str(),
                "inputs": inputs_json,
            }),
        ),
    )
}

fn handle_calc_cpl_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nim = match required_str(req, "nim") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cpl_id = match required_str(req, "cplId") {
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
    let curriculum_id = match store::curriculum_of_cpl(conn, &cpl_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let snapshot = match CurriculumSnapshot::load(conn, &curriculum_id, &scope) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let policy = settings.missing_policy;
    let contributions: Vec<serde_json::Value> = snapshot
        .cpmks_of_cpl(&cpl_id)
        .map(|k| {
            let score = snapshot.cpmk_score(&student.id, &k.id, policy);
            attainment_json(
                score,
                json!({
                    "cpmkId": k.id,
                    "code": k.code,
                    "courseCode": k.course_code,
                    "bobotToCpl": k.bobot_to_cpl,
                    "included": k.bobot_to_cpl.is_some() && !score.is_no_data(),
                }),
            )
        })
        .collect();
    let score = snapshot.cpl_score(&student.id, &cpl_id, policy);
    ok(
        &req.id,
        attainment_json(
            score,
            json!({
                "nim": student.nim,
                "cplId": cpl_id,
                "scope": scope.to_json(),
                "contributions": contributions,
            }),
        ),
    )
}

fn handle_calc_cohort_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(selector) = req.params.get("cohort").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "cohort must be an object", None);
    };
    let Some(level) = req
        .params
        .get("level")
        .and_then(|v| v.as_str())
        .and_then(OutcomeLevel::parse)
    else {
        return err(&req.id, "bad_params", "level must be cpmk or cpl", None);
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

    let cohort = match Cohort::load(conn, selector, &scope) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let outcomes = cohort.outcome_stats(level, settings.missing_policy, threshold);
    ok(
        &req.id,
        json!({
            "cohort": cohort.label,
            "level": level.as_str(),
            "scope": scope.to_json(),
            "cohortSize": cohort.students.len(),
            "threshold": threshold,
            "outcomes": outcomes,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "weights.validate" => Some(handle_weights_validate(state, req)),
        "calc.cpmkScore" => Some(handle_calc_cpmk_score(state, req)),
        "calc.cplScore" => Some(handle_calc_cpl_score(state, req)),
        "calc.cohortStats" => Some(handle_calc_cohort_stats(state, req)),
        _ => None,
    }
}
