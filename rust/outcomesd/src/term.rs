use crate::rollup::CalcError;
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Semester {
    Ganjil,
    Genap,
}

impl Semester {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GANJIL" => Some(Self::Ganjil),
            "GENAP" => Some(Self::Genap),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ganjil => "GANJIL",
            Self::Genap => "GENAP",
        }
    }
}

/// (year, semester); GANJIL sorts before GENAP within a year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AcademicTerm {
    pub year: i64,
    pub semester: Semester,
}

impl fmt::Display for AcademicTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.year, self.semester.as_str())
    }
}

impl FromStr for AcademicTerm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((year, semester)) = s.trim().split_once('-') else {
            return Err(format!("term must look like 2024-GANJIL, got {:?}", s));
        };
        let year: i64 = year
            .trim()
            .parse()
            .map_err(|_| format!("bad term year in {:?}", s))?;
        let semester =
            Semester::parse(semester).ok_or_else(|| format!("bad term semester in {:?}", s))?;
        Ok(AcademicTerm { year, semester })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TermScope {
    #[default]
    All,
    Year(i64),
    Terms(BTreeSet<AcademicTerm>),
}

impl TermScope {
    pub fn contains(&self, term: AcademicTerm) -> bool {
        match self {
            TermScope::All => true,
            TermScope::Year(y) => term.year == *y,
            TermScope::Terms(set) => set.contains(&term),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TermScope::All => json!({ "kind": "all" }),
            TermScope::Year(y) => json!({ "kind": "year", "year": y }),
            TermScope::Terms(set) => json!({
                "kind": "terms",
                "terms": set.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            }),
        }
    }
}

fn bad_scope(message: impl Into<String>) -> CalcError {
    CalcError::new("bad_params", message)
}

pub fn parse_term_scope(raw: Option<&serde_json::Value>) -> Result<TermScope, CalcError> {
    let Some(raw) = raw else {
        return Ok(TermScope::All);
    };
    if raw.is_null() {
        return Ok(TermScope::All);
    }
    let Some(obj) = raw.as_object() else {
        return Err(bad_scope("scope must be an object"));
    };

    let kind = obj
        .get("kind")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "all".to_string());

    match kind.as_str() {
        "all" => Ok(TermScope::All),
        "year" => {
            let Some(year) = obj.get("year").and_then(|v| v.as_i64()) else {
                return Err(bad_scope("scope.year must be an integer"));
            };
            Ok(TermScope::Year(year))
        }
        "term" => {
            let Some(year) = obj.get("year").and_then(|v| v.as_i64()) else {
                return Err(bad_scope("scope.year must be an integer"));
            };
            let Some(semester) = obj
                .get("semester")
                .and_then(|v| v.as_str())
                .and_then(Semester::parse)
            else {
                return Err(bad_scope("scope.semester must be GANJIL or GENAP"));
            };
            Ok(TermScope::Terms(BTreeSet::from([AcademicTerm {
                year,
                semester,
            }])))
        }
        "terms" => {
            let Some(arr) = obj.get("terms").and_then(|v| v.as_array()) else {
                return Err(bad_scope("scope.terms must be an array"));
            };
            let mut set = BTreeSet::new();
            for v in arr {
                let Some(s) = v.as_str() else {
                    return Err(bad_scope("scope.terms must contain only strings"));
                };
                let term = s.parse::<AcademicTerm>().map_err(|e| {
                    bad_scope(e).with_details(json!({ "term": s }))
                })?;
                set.insert(term);
            }
            if set.is_empty() {
                return Err(bad_scope("scope.terms must contain at least one term"));
            }
            Ok(TermScope::Terms(set))
        }
        other => Err(bad_scope("scope.kind must be one of: term, year, all, terms")
            .with_details(json!({ "kind": other }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(year: i64, semester: Semester) -> AcademicTerm {
        AcademicTerm { year, semester }
    }

    #[test]
    fn term_ids_round_trip_through_display() {
        let t: AcademicTerm = "2024-genap".parse().expect("parse term");
        assert_eq!(t, term(2024, Semester::Genap));
        assert_eq!(t.to_string(), "2024-GENAP");
        assert!("2024".parse::<AcademicTerm>().is_err());
        assert!("2024-SPRING".parse::<AcademicTerm>().is_err());
    }

    #[test]
    fn terms_order_by_year_then_ganjil_first() {
        assert!(term(2023, Semester::Genap) < term(2024, Semester::Ganjil));
        assert!(term(2024, Semester::Ganjil) < term(2024, Semester::Genap));
    }

    #[test]
    fn year_scope_covers_both_semesters() {
        let scope = parse_term_scope(Some(&json!({ "kind": "year", "year": 2024 }))).unwrap();
        assert!(scope.contains(term(2024, Semester::Ganjil)));
        assert!(scope.contains(term(2024, Semester::Genap)));
        assert!(!scope.contains(term(2023, Semester::Genap)));
    }

    #[test]
    fn explicit_terms_need_not_be_contiguous() {
        let scope = parse_term_scope(Some(&json!({
            "kind": "terms",
            "terms": ["2022-GANJIL", "2024-GENAP", "2022-GANJIL"]
        })))
        .unwrap();
        assert!(scope.contains(term(2022, Semester::Ganjil)));
        assert!(!scope.contains(term(2023, Semester::Ganjil)));
        assert!(scope.contains(term(2024, Semester::Genap)));
        let TermScope::Terms(set) = scope else {
            panic!("expected explicit terms");
        };
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn missing_scope_means_all_time() {
        assert_eq!(parse_term_scope(None).unwrap(), TermScope::All);
        assert_eq!(parse_term_scope(Some(&json!(null))).unwrap(), TermScope::All);
    }

    #[test]
    fn malformed_scopes_are_rejected() {
        assert!(parse_term_scope(Some(&json!({ "kind": "terms", "terms": [] }))).is_err());
        assert!(parse_term_scope(Some(&json!({ "kind": "term", "year": 2024 }))).is_err());
        assert!(parse_term_scope(Some(&json!({ "kind": "decade" }))).is_err());
        assert!(parse_term_scope(Some(&json!("ALL"))).is_err());
    }
}
