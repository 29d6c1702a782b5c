use crate::db;
use crate::grading::LetterScale;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rollup::MissingPolicy;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Rollup,
    Grading,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "rollup" => Some(Self::Rollup),
            "grading" => Some(Self::Grading),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Rollup => "setup.rollup",
            Self::Grading => "setup.grading",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Rollup => json!({
            "weightTotal": 100.0,
            "weightEpsilon": 0.01,
            "missingPolicy": MissingPolicy::default().as_str(),
            "passThreshold": null
        }),
        SetupSection::Grading => json!({
            "scale": LetterScale::default().to_json()
        }),
    }
}

fn as_object_mut(v: &mut Value) -> Result<&mut Map<String, Value>, String> {
    v.as_object_mut()
        .ok_or_else(|| "section value must be an object".to_string())
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let Some(f) = v.as_f64() else {
        return Err(format!("{} must be a number", key));
    };
    if !(min..=max).contains(&f) {
        return Err(format!("{} must be between {} and {}", key, min, max));
    }
    Ok(f)
}

fn parse_nullable_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    Ok(json!(parse_f64_range(v, key, min, max)?))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Rollup => match k.as_str() {
                "weightTotal" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 1.0, 1000.0)?));
                }
                "weightEpsilon" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 1.0)?));
                }
                "missingPolicy" => {
                    let Some(policy) = v.as_str().and_then(MissingPolicy::parse) else {
                        return Err("missingPolicy must be one of: exclude, zero".into());
                    };
                    obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
                }
                "passThreshold" => {
                    obj.insert(k.clone(), parse_nullable_f64_range(v, k, 0.0, 100.0)?);
                }
                _ => return Err(format!("unknown rollup field: {}", k)),
            },
            SetupSection::Grading => match k.as_str() {
                "scale" => {
                    let scale = LetterScale::from_json(v)?;
                    obj.insert(k.clone(), scale.to_json());
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut single = Map::new();
                single.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &single);
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollupSettings {
    pub weight_total: f64,
    pub weight_epsilon: f64,
    pub missing_policy: MissingPolicy,
    pub pass_threshold: Option<f64>,
}

pub fn load_rollup_settings(conn: &rusqlite::Connection) -> anyhow::Result<RollupSettings> {
    let v = load_section(conn, SetupSection::Rollup)?;
    Ok(RollupSettings {
        weight_total: v.get("weightTotal").and_then(|x| x.as_f64()).unwrap_or(100.0),
        weight_epsilon: v.get("weightEpsilon").and_then(|x| x.as_f64()).unwrap_or(0.01),
        missing_policy: v
            .get("missingPolicy")
            .and_then(|x| x.as_str())
            .and_then(MissingPolicy::parse)
            .unwrap_or_default(),
        pass_threshold: v.get("passThreshold").and_then(|x| x.as_f64()),
    })
}

pub fn load_letter_scale(conn: &rusqlite::Connection) -> anyhow::Result<LetterScale> {
    let v = load_section(conn, SetupSection::Grading)?;
    match v.get("scale") {
        Some(raw) => LetterScale::from_json(raw).map_err(anyhow::Error::msg),
        None => Ok(LetterScale::default()),
    }
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let rollup = match load_section(conn, SetupSection::Rollup) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grading = match load_section(conn, SetupSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "rollup": rollup,
            "grading": grading
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section_raw, "settings updated");
    ok(&req.id, json!({ "ok": true, "section": section_raw, "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
