use rusqlite::Connection;

use crate::ipc::error::{calc_err, err};
use crate::ipc::types::{AppState, Request};
use crate::term::{self, TermScope};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_str() {
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => Ok(Some(s.trim().to_string())),
            None => Err(err(
                &req.id,
                "bad_params",
                format!("{} must be a string or null", key),
                None,
            )),
        },
    }
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_f64() {
            Some(f) if f.is_finite() => Ok(Some(f)),
            _ => Err(err(
                &req.id,
                "bad_params",
                format!("{} must be a number or null", key),
                None,
            )),
        },
    }
}

pub fn parse_scope(req: &Request) -> Result<TermScope, serde_json::Value> {
    term::parse_term_scope(req.params.get("scope")).map_err(|e| calc_err(&req.id, e))
}
