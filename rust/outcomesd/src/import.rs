//! Bulk score import: one row per student, one column per component label.
//! Validation is all-or-nothing; a plan is only produced when every row and
//! cell resolves, so the writer can commit it in a single transaction.

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

pub const IMPORT_MAX_ROWS: usize = 5000;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Blank,
    Number(f64),
    Invalid(String),
}

impl Cell {
    fn from_text(raw: &str) -> Cell {
        let t = raw.trim();
        if t.is_empty() {
            return Cell::Blank;
        }
        // Spreadsheets exported with a decimal comma still carry a single separator.
        let normalized = if t.contains(',') && !t.contains('.') {
            t.replace(',', ".")
        } else {
            t.to_string()
        };
        match normalized.parse::<f64>() {
            Ok(v) if v.is_finite() => Cell::Number(v),
            _ => Cell::Invalid(t.to_string()),
        }
    }

    fn from_json(v: &Value) -> Cell {
        match v {
            Value::Null => Cell::Blank,
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.is_finite() => Cell::Number(f),
                _ => Cell::Invalid(n.to_string()),
            },
            Value::String(s) => Cell::from_text(s),
            other => Cell::Invalid(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub line_no: usize,
    pub nim: String,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportTable {
    pub columns: Vec<String>,
    pub rows: Vec<ImportRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportIssue {
    pub line: Option<usize>,
    pub column: Option<String>,
    pub code: &'static str,
    pub message: String,
}

impl ImportIssue {
    fn new(
        line: Option<usize>,
        column: Option<&str>,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        ImportIssue {
            line,
            column: column.map(|c| c.to_string()),
            code,
            message: message.into(),
        }
    }
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

/// Header is `NIM,<label>,...`; line numbers in issues are 1-based file lines.
pub fn table_from_csv(text: &str) -> Result<ImportTable, Vec<ImportIssue>> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
        .filter(|(_, l)| !l.trim().is_empty());

    let Some((header_line, header)) = lines.next() else {
        return Err(vec![ImportIssue::new(None, None, "empty_input", "csv has no header row")]);
    };
    let header = parse_csv_record(header.trim_start_matches('\u{feff}'));
    if header.len() < 2 {
        return Err(vec![ImportIssue::new(
            Some(header_line),
            None,
            "bad_header",
            "header must be NIM followed by at least one component column",
        )]);
    }
    let columns: Vec<String> = header[1..].iter().map(|s| s.trim().to_string()).collect();

    let mut rows = Vec::new();
    let mut issues = Vec::new();
    for (line_no, line) in lines {
        let fields = parse_csv_record(line);
        if fields.len() > columns.len() + 1 {
            issues.push(ImportIssue::new(
                Some(line_no),
                None,
                "bad_row",
                format!(
                    "row has {} cells, header declares {}",
                    fields.len() - 1,
                    columns.len()
                ),
            ));
            continue;
        }
        let nim = fields[0].trim().to_string();
        let mut cells: Vec<Cell> = fields[1..].iter().map(|f| Cell::from_text(f)).collect();
        // Trailing blank cells are often dropped by spreadsheet exports.
        cells.resize(columns.len(), Cell::Blank);
        rows.push(ImportRow {
            line_no,
            nim,
            cells,
        });
    }
    if issues.is_empty() {
        Ok(ImportTable { columns, rows })
    } else {
        Err(issues)
    }
}

/// `columns: [label...]`, `rows: [{nim, cells: [number|string|null]}]`; line numbers are 1-based row indices.
pub fn table_from_json(columns: &Value, rows: &Value) -> Result<ImportTable, Vec<ImportIssue>> {
    let Some(cols) = columns.as_array() else {
        return Err(vec![ImportIssue::new(None, None, "bad_header", "columns must be an array")]);
    };
    let mut labels = Vec::with_capacity(cols.len());
    for c in cols {
        let Some(s) = c.as_str() else {
            return Err(vec![ImportIssue::new(
                None,
                None,
                "bad_header",
                "columns must contain only strings",
            )]);
        };
        labels.push(s.trim().to_string());
    }
    if labels.is_empty() {
        return Err(vec![ImportIssue::new(
            None,
            None,
            "bad_header",
            "columns must name at least one component",
        )]);
    }
    let Some(raw_rows) = rows.as_array() else {
        return Err(vec![ImportIssue::new(None, None, "bad_row", "rows must be an array")]);
    };

    let mut out = Vec::with_capacity(raw_rows.len());
    let mut issues = Vec::new();
    for (i, r) in raw_rows.iter().enumerate() {
        let line_no = i + 1;
        let nim = r.get("nim").and_then(|v| v.as_str()).map(|s| s.trim().to_string());
        let cells = r.get("cells").and_then(|v| v.as_array());
        let (Some(nim), Some(cells)) = (nim, cells) else {
            issues.push(ImportIssue::new(
                Some(line_no),
                None,
                "bad_row",
                "row must have string nim and cells[]",
            ));
            continue;
        };
        if cells.len() > labels.len() {
            issues.push(ImportIssue::new(
                Some(line_no),
                None,
                "bad_row",
                format!("row has {} cells, columns declare {}", cells.len(), labels.len()),
            ));
            continue;
        }
        let mut parsed: Vec<Cell> = cells.iter().map(Cell::from_json).collect();
        parsed.resize(labels.len(), Cell::Blank);
        out.push(ImportRow {
            line_no,
            nim,
            cells: parsed,
        });
    }
    if issues.is_empty() {
        Ok(ImportTable {
            columns: labels,
            rows: out,
        })
    } else {
        Err(issues)
    }
}

#[derive(Debug, Clone)]
pub struct ComponentRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreWrite {
    pub student_id: String,
    pub component_id: String,
    /// `None` clears the stored score: the student has no data for that component.
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportPlan {
    pub writes: Vec<ScoreWrite>,
    pub row_count: usize,
    pub cell_count: usize,
    pub cleared_count: usize,
    pub suspect_count: usize,
    pub fingerprint: String,
}

fn label_key(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Resolves labels to components and NIMs to enrolled students.
/// `enrolled` maps NIM to student id for the class being imported.
pub fn plan_import(
    table: &ImportTable,
    components: &[ComponentRef],
    enrolled: &HashMap<String, String>,
) -> Result<ImportPlan, Vec<ImportIssue>> {
    let mut issues = Vec::new();

    if table.rows.len() > IMPORT_MAX_ROWS {
        return Err(vec![ImportIssue::new(
            None,
            None,
            "too_many_rows",
            format!(
                "import exceeds max rows: {} > {}",
                table.rows.len(),
                IMPORT_MAX_ROWS
            ),
        )]);
    }

    let by_name: HashMap<String, &ComponentRef> =
        components.iter().map(|c| (label_key(&c.name), c)).collect();
    let mut seen_labels: HashSet<String> = HashSet::new();
    let mut column_ids: Vec<Option<&str>> = Vec::with_capacity(table.columns.len());
    for label in &table.columns {
        let key = label_key(label);
        if !seen_labels.insert(key.clone()) {
            issues.push(ImportIssue::new(
                None,
                Some(label),
                "duplicate_column",
                "component column appears more than once",
            ));
            column_ids.push(None);
            continue;
        }
        match by_name.get(&key) {
            Some(c) => column_ids.push(Some(c.id.as_str())),
            None => {
                issues.push(ImportIssue::new(
                    None,
                    Some(label),
                    "unknown_column",
                    "no component with this name in the class",
                ));
                column_ids.push(None);
            }
        }
    }

    let mut writes = Vec::new();
    let mut seen_nims: HashSet<String> = HashSet::new();
    let mut cell_count = 0usize;
    let mut cleared_count = 0usize;
    let mut suspect_count = 0usize;
    for row in &table.rows {
        if row.nim.is_empty() {
            issues.push(ImportIssue::new(Some(row.line_no), None, "missing_nim", "row has no NIM"));
            continue;
        }
        if !seen_nims.insert(row.nim.clone()) {
            issues.push(ImportIssue::new(
                Some(row.line_no),
                None,
                "duplicate_nim",
                format!("NIM {} appears more than once", row.nim),
            ));
            continue;
        }
        let Some(student_id) = enrolled.get(&row.nim) else {
            issues.push(ImportIssue::new(
                Some(row.line_no),
                None,
                "not_enrolled",
                format!("NIM {} is not enrolled in this class", row.nim),
            ));
            continue;
        };

        for (cell, (label, component_id)) in row
            .cells
            .iter()
            .zip(table.columns.iter().zip(column_ids.iter()))
        {
            let value = match cell {
                Cell::Blank => None,
                Cell::Number(v) => Some(*v),
                Cell::Invalid(raw) => {
                    issues.push(ImportIssue::new(
                        Some(row.line_no),
                        Some(label),
                        "bad_cell",
                        format!("not a number: {:?}", raw),
                    ));
                    continue;
                }
            };
            let Some(component_id) = component_id else {
                continue;
            };
            match value {
                Some(v) => {
                    cell_count += 1;
                    if !(0.0..=100.0).contains(&v) {
                        suspect_count += 1;
                    }
                }
                None => cleared_count += 1,
            }
            writes.push(ScoreWrite {
                student_id: student_id.clone(),
                component_id: component_id.to_string(),
                value,
            });
        }
    }

    if !issues.is_empty() {
        return Err(issues);
    }
    Ok(ImportPlan {
        fingerprint: fingerprint(&writes),
        writes,
        row_count: table.rows.len(),
        cell_count,
        cleared_count,
        suspect_count,
    })
}

/// SHA-256 over the resolved writes, independent of row order in the source.
fn fingerprint(writes: &[ScoreWrite]) -> String {
    let mut canonical: Vec<String> = writes
        .iter()
        .map(|w| {
            format!(
                "{}\t{}\t{}",
                w.student_id,
                w.component_id,
                w.value.map(|v| v.to_string()).unwrap_or_default()
            )
        })
        .collect();
    canonical.sort();
    let mut hasher = Sha256::new();
    for line in &canonical {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

pub fn issues_json(issues: &[ImportIssue]) -> Value {
    json!(issues)
}
