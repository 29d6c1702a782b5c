//! Fetches weight tables, mappings and scores from the workspace database and
//! feeds them to the pure rollups in [`crate::rollup`]. Nothing here is cached:
//! every request builds a fresh snapshot so edits are visible immediately.

use crate::rollup::{
    self, Attainment, CalcError, ComponentInput, CpmkContribution, MissingPolicy, WeightedInput,
};
use crate::term::{AcademicTerm, Semester, TermScope};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

fn query_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub id: String,
    pub nim: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CplRow {
    pub id: String,
    pub code: String,
    pub description: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IkRow {
    pub id: String,
    pub cpl_id: String,
    pub code: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpmkRow {
    pub id: String,
    pub code: String,
    pub description: String,
    pub course_id: String,
    pub course_code: String,
    pub rps_id: String,
    pub rps_revision: String,
    pub cpl_id: Option<String>,
    pub bobot_to_cpl: Option<f64>,
    pub ik_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ClassRow {
    pub id: String,
    pub course_id: String,
    pub course_code: String,
    pub curriculum_id: String,
    pub name: String,
    pub term: AcademicTerm,
}

impl ClassRow {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "courseId": self.course_id,
            "courseCode": self.course_code,
            "curriculumId": self.curriculum_id,
            "name": self.name,
            "term": self.term.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRow {
    pub id: String,
    pub class_id: String,
    pub name: String,
    pub weight: f64,
    pub cpmk_id: Option<String>,
    pub sort_order: i64,
}

fn parse_term(year: i64, semester: &str) -> Result<AcademicTerm, CalcError> {
    let Some(semester) = Semester::parse(semester) else {
        return Err(CalcError::new(
            "db_query_failed",
            format!("unexpected term semester in database: {}", semester),
        ));
    };
    Ok(AcademicTerm { year, semester })
}

fn map_cpmk_row(r: &Row<'_>) -> rusqlite::Result<CpmkRow> {
    Ok(CpmkRow {
        id: r.get(0)?,
        code: r.get(1)?,
        description: r.get(2)?,
        course_id: r.get(3)?,
        course_code: r.get(4)?,
        rps_id: r.get(5)?,
        rps_revision: r.get(6)?,
        cpl_id: r.get(7)?,
        bobot_to_cpl: r.get(8)?,
        ik_ids: Vec::new(),
    })
}

fn map_component_row(r: &Row<'_>) -> rusqlite::Result<ComponentRow> {
    Ok(ComponentRow {
        id: r.get(0)?,
        class_id: r.get(1)?,
        name: r.get(2)?,
        weight: r.get(3)?,
        cpmk_id: r.get(4)?,
        sort_order: r.get(5)?,
    })
}

pub fn find_student_by_nim(conn: &Connection, nim: &str) -> Result<StudentRow, CalcError> {
    conn.query_row(
        "SELECT id, nim, name FROM students WHERE nim = ?",
        [nim.trim()],
        |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                nim: r.get(1)?,
                name: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| {
        CalcError::new("not_found", "student not found")
            .with_details(serde_json::json!({ "nim": nim }))
    })
}

pub fn require_curriculum(conn: &Connection, curriculum_id: &str) -> Result<(), CalcError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM curricula WHERE id = ?",
            [curriculum_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_err)?;
    found
        .map(|_| ())
        .ok_or_else(|| CalcError::new("not_found", "curriculum not found"))
}

pub fn curriculum_of_cpmk(conn: &Connection, cpmk_id: &str) -> Result<String, CalcError> {
    conn.query_row(
        "SELECT co.curriculum_id
         FROM cpmks k
         JOIN rps r ON r.id = k.rps_id
         JOIN courses co ON co.id = r.course_id
         WHERE k.id = ?",
        [cpmk_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| CalcError::new("not_found", "cpmk not found"))
}

pub fn curriculum_of_cpl(conn: &Connection, cpl_id: &str) -> Result<String, CalcError> {
    conn.query_row(
        "SELECT curriculum_id FROM cpls WHERE id = ?",
        [cpl_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| CalcError::new("not_found", "cpl not found"))
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<ClassRow, CalcError> {
    let row: Option<(String, String, String, String, String, i64, String)> = conn
        .query_row(
            "SELECT cl.id, cl.course_id, co.code, co.curriculum_id, cl.name, cl.term_year, cl.term_semester
             FROM classes cl
             JOIN courses co ON co.id = cl.course_id
             WHERE cl.id = ?",
            [class_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()
        .map_err(query_err)?;
    let Some((id, course_id, course_code, curriculum_id, name, year, semester)) = row else {
        return Err(CalcError::new("not_found", "class not found"));
    };
    Ok(ClassRow {
        id,
        course_id,
        course_code,
        curriculum_id,
        name,
        term: parse_term(year, &semester)?,
    })
}

pub fn load_class_students(conn: &Connection, class_id: &str) -> Result<Vec<StudentRow>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.nim, s.name
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.class_id = ?
             ORDER BY s.nim",
        )
        .map_err(query_err)?;
    stmt.query_map([class_id], |r| {
        Ok(StudentRow {
            id: r.get(0)?,
            nim: r.get(1)?,
            name: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_err)
}

pub fn load_class_components(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<ComponentRow>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, class_id, name, weight, cpmk_id, sort_order
             FROM components
             WHERE class_id = ?
             ORDER BY sort_order, name",
        )
        .map_err(query_err)?;
    stmt.query_map([class_id], map_component_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)
}

pub fn load_course_cpmks(conn: &Connection, course_id: &str) -> Result<Vec<CpmkRow>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT k.id, k.code, k.description, co.id, co.code, r.id, r.revision, k.cpl_id, k.bobot_to_cpl
             FROM cpmks k
             JOIN rps r ON r.id = k.rps_id
             JOIN courses co ON co.id = r.course_id
             WHERE co.id = ?
             ORDER BY r.revision, k.sort_order, k.code",
        )
        .map_err(query_err)?;
    stmt.query_map([course_id], map_cpmk_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)
}

/// Newest syllabus revision of a course: numeric revisions compare as numbers.
pub fn latest_rps_of_course(conn: &Connection, course_id: &str) -> Result<String, CalcError> {
    conn.query_row(
        "SELECT id FROM rps
         WHERE course_id = ?
         ORDER BY CAST(revision AS INTEGER) DESC, revision DESC
         LIMIT 1",
        [course_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| CalcError::new("not_found", "course has no rps revision"))
}

/// Everything one curriculum needs for student, cohort and program rollups,
/// restricted to the classes whose term falls inside `scope`.
#[derive(Debug, Clone)]
pub struct CurriculumSnapshot {
    pub cpls: Vec<CplRow>,
    pub iks: Vec<IkRow>,
    pub cpmks: Vec<CpmkRow>,
    pub components: Vec<ComponentRow>,
    /// Students enrolled in at least one in-scope class, ordered by NIM.
    pub students: Vec<StudentRow>,
    enrolled: HashSet<(String, String)>,
    scores: HashMap<(String, String), f64>,
    components_by_cpmk: HashMap<String, Vec<usize>>,
}

impl CurriculumSnapshot {
    pub fn load(
        conn: &Connection,
        curriculum_id: &str,
        scope: &TermScope,
    ) -> Result<Self, CalcError> {
        require_curriculum(conn, curriculum_id)?;

        let mut cpls_stmt = conn
            .prepare(
                "SELECT id, code, description, sort_order
                 FROM cpls
                 WHERE curriculum_id = ?
                 ORDER BY sort_order, code",
            )
            .map_err(query_err)?;
        let cpls: Vec<CplRow> = cpls_stmt
            .query_map([curriculum_id], |r| {
                Ok(CplRow {
                    id: r.get(0)?,
                    code: r.get(1)?,
                    description: r.get(2)?,
                    sort_order: r.get(3)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;

        let mut iks_stmt = conn
            .prepare(
                "SELECT i.id, i.cpl_id, i.code, i.description
                 FROM iks i
                 JOIN cpls c ON c.id = i.cpl_id
                 WHERE c.curriculum_id = ?
                 ORDER BY c.sort_order, c.code, i.sort_order, i.code",
            )
            .map_err(query_err)?;
        let iks: Vec<IkRow> = iks_stmt
            .query_map([curriculum_id], |r| {
                Ok(IkRow {
                    id: r.get(0)?,
                    cpl_id: r.get(1)?,
                    code: r.get(2)?,
                    description: r.get(3)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;

        let mut cpmks_stmt = conn
            .prepare(
                "SELECT k.id, k.code, k.description, co.id, co.code, r.id, r.revision, k.cpl_id, k.bobot_to_cpl
                 FROM cpmks k
                 JOIN rps r ON r.id = k.rps_id
                 JOIN courses co ON co.id = r.course_id
                 WHERE co.curriculum_id = ?
                 ORDER BY co.code, r.revision, k.sort_order, k.code",
            )
            .map_err(query_err)?;
        let mut cpmks: Vec<CpmkRow> = cpmks_stmt
            .query_map([curriculum_id], map_cpmk_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;

        let mut links_stmt = conn
            .prepare(
                "SELECT ci.cpmk_id, ci.ik_id
                 FROM cpmk_iks ci
                 JOIN iks i ON i.id = ci.ik_id
                 JOIN cpls c ON c.id = i.cpl_id
                 WHERE c.curriculum_id = ?
                 ORDER BY i.sort_order, i.code",
            )
            .map_err(query_err)?;
        let links: Vec<(String, String)> = links_stmt
            .query_map([curriculum_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;
        let mut iks_by_cpmk: HashMap<String, Vec<String>> = HashMap::new();
        for (cpmk_id, ik_id) in links {
            iks_by_cpmk.entry(cpmk_id).or_default().push(ik_id);
        }
        for k in &mut cpmks {
            if let Some(ids) = iks_by_cpmk.remove(&k.id) {
                k.ik_ids = ids;
            }
        }

        let mut classes_stmt = conn
            .prepare(
                "SELECT cl.id, cl.course_id, co.code, cl.name, cl.term_year, cl.term_semester
                 FROM classes cl
                 JOIN courses co ON co.id = cl.course_id
                 WHERE co.curriculum_id = ?
                 ORDER BY cl.term_year, cl.term_semester, co.code, cl.name",
            )
            .map_err(query_err)?;
        let class_rows: Vec<(String, String, String, String, i64, String)> = classes_stmt
            .query_map([curriculum_id], |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;
        let mut classes: Vec<ClassRow> = Vec::new();
        for (id, course_id, course_code, name, year, semester) in class_rows {
            let term = parse_term(year, &semester)?;
            if !scope.contains(term) {
                continue;
            }
            classes.push(ClassRow {
                id,
                course_id,
                course_code,
                curriculum_id: curriculum_id.to_string(),
                name,
                term,
            });
        }
        let class_ids: HashSet<&str> = classes.iter().map(|c| c.id.as_str()).collect();

        let mut components_stmt = conn
            .prepare(
                "SELECT c.id, c.class_id, c.name, c.weight, c.cpmk_id, c.sort_order
                 FROM components c
                 JOIN classes cl ON cl.id = c.class_id
                 JOIN courses co ON co.id = cl.course_id
                 WHERE co.curriculum_id = ?
                 ORDER BY c.class_id, c.sort_order, c.name",
            )
            .map_err(query_err)?;
        let components: Vec<ComponentRow> = components_stmt
            .query_map([curriculum_id], map_component_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?
            .into_iter()
            .filter(|c| class_ids.contains(c.class_id.as_str()))
            .collect();
        let component_ids: HashSet<&str> = components.iter().map(|c| c.id.as_str()).collect();

        let mut enroll_stmt = conn
            .prepare(
                "SELECT e.class_id, s.id, s.nim, s.name
                 FROM enrollments e
                 JOIN students s ON s.id = e.student_id
                 JOIN classes cl ON cl.id = e.class_id
                 JOIN courses co ON co.id = cl.course_id
                 WHERE co.curriculum_id = ?
                 ORDER BY s.nim",
            )
            .map_err(query_err)?;
        let enroll_rows: Vec<(String, String, String, String)> = enroll_stmt
            .query_map([curriculum_id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;
        let mut enrolled: HashSet<(String, String)> = HashSet::new();
        let mut students: Vec<StudentRow> = Vec::new();
        let mut seen_students: HashSet<String> = HashSet::new();
        for (class_id, student_id, nim, name) in enroll_rows {
            if !class_ids.contains(class_id.as_str()) {
                continue;
            }
            if seen_students.insert(student_id.clone()) {
                students.push(StudentRow {
                    id: student_id.clone(),
                    nim,
                    name,
                });
            }
            enrolled.insert((class_id, student_id));
        }

        // Joining on enrollments drops scores left behind by a withdrawn enrollment.
        let mut scores_stmt = conn
            .prepare(
                "SELECT cs.component_id, cs.student_id, cs.score
                 FROM component_scores cs
                 JOIN components c ON c.id = cs.component_id
                 JOIN enrollments e ON e.class_id = c.class_id AND e.student_id = cs.student_id
                 JOIN classes cl ON cl.id = c.class_id
                 JOIN courses co ON co.id = cl.course_id
                 WHERE co.curriculum_id = ?",
            )
            .map_err(query_err)?;
        let score_rows: Vec<(String, String, f64)> = scores_stmt
            .query_map([curriculum_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;
        let mut scores: HashMap<(String, String), f64> = HashMap::new();
        for (component_id, student_id, score) in score_rows {
            if component_ids.contains(component_id.as_str()) {
                scores.insert((component_id, student_id), score);
            }
        }

        let mut components_by_cpmk: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, c) in components.iter().enumerate() {
            if let Some(cpmk_id) = &c.cpmk_id {
                components_by_cpmk.entry(cpmk_id.clone()).or_default().push(i);
            }
        }

        Ok(CurriculumSnapshot {
            cpls,
            iks,
            cpmks,
            components,
            students,
            enrolled,
            scores,
            components_by_cpmk,
        })
    }

    pub fn iks_of_cpl<'a>(&'a self, cpl_id: &'a str) -> impl Iterator<Item = &'a IkRow> + 'a {
        self.iks.iter().filter(move |i| i.cpl_id == cpl_id)
    }

    pub fn cpmks_of_cpl<'a>(&'a self, cpl_id: &'a str) -> impl Iterator<Item = &'a CpmkRow> + 'a {
        self.cpmks
            .iter()
            .filter(move |k| k.cpl_id.as_deref() == Some(cpl_id))
    }

    /// Components of in-scope classes the student is enrolled in that map to `cpmk_id`.
    pub fn cpmk_inputs(&self, student_id: &str, cpmk_id: &str) -> Vec<ComponentInput> {
        let Some(indices) = self.components_by_cpmk.get(cpmk_id) else {
            return Vec::new();
        };
        indices
            .iter()
            .map(|i| &self.components[*i])
            .filter(|c| {
                self.enrolled
                    .contains(&(c.class_id.clone(), student_id.to_string()))
            })
            .map(|c| ComponentInput {
                weight: c.weight,
                score: self
                    .scores
                    .get(&(c.id.clone(), student_id.to_string()))
                    .copied(),
            })
            .collect()
    }

    pub fn cpmk_score(&self, student_id: &str, cpmk_id: &str, policy: MissingPolicy) -> Attainment {
        rollup::cpmk_score(&self.cpmk_inputs(student_id, cpmk_id), policy)
    }

    fn contributions<'a, I>(
        &self,
        student_id: &str,
        cpmks: I,
        policy: MissingPolicy,
    ) -> Vec<CpmkContribution>
    where
        I: Iterator<Item = &'a CpmkRow>,
    {
        cpmks
            .map(|k| CpmkContribution {
                bobot_to_cpl: k.bobot_to_cpl,
                score: self.cpmk_score(student_id, &k.id, policy),
            })
            .collect()
    }

    pub fn cpl_score(&self, student_id: &str, cpl_id: &str, policy: MissingPolicy) -> Attainment {
        rollup::cpl_score(&self.contributions(student_id, self.cpmks_of_cpl(cpl_id), policy))
    }

    /// Same formula as the CPL rollup, restricted to the CPMKs grouped under one IK.
    pub fn ik_score(&self, student_id: &str, ik_id: &str, policy: MissingPolicy) -> Attainment {
        let cpmks = self
            .cpmks
            .iter()
            .filter(|k| k.ik_ids.iter().any(|id| id == ik_id));
        rollup::cpl_score(&self.contributions(student_id, cpmks, policy))
    }
}

/// One class's components, enrollments and scores, for the per-class grade sheet.
#[derive(Debug, Clone)]
pub struct ClassSheet {
    pub class: ClassRow,
    pub students: Vec<StudentRow>,
    pub components: Vec<ComponentRow>,
    pub cpmks: Vec<CpmkRow>,
    scores: HashMap<(String, String), f64>,
}

impl ClassSheet {
    pub fn load(conn: &Connection, class_id: &str) -> Result<Self, CalcError> {
        let class = load_class(conn, class_id)?;
        let students = load_class_students(conn, class_id)?;
        let components = load_class_components(conn, class_id)?;
        let cpmks = load_course_cpmks(conn, &class.course_id)?;

        let mut stmt = conn
            .prepare(
                "SELECT cs.component_id, cs.student_id, cs.score
                 FROM component_scores cs
                 JOIN components c ON c.id = cs.component_id
                 JOIN enrollments e ON e.class_id = c.class_id AND e.student_id = cs.student_id
                 WHERE c.class_id = ?",
            )
            .map_err(query_err)?;
        let rows: Vec<(String, String, f64)> = stmt
            .query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;
        let scores = rows
            .into_iter()
            .map(|(component_id, student_id, score)| ((component_id, student_id), score))
            .collect();

        Ok(ClassSheet {
            class,
            students,
            components,
            cpmks,
            scores,
        })
    }

    pub fn score(&self, student_id: &str, component_id: &str) -> Option<f64> {
        self.scores
            .get(&(component_id.to_string(), student_id.to_string()))
            .copied()
    }

    pub fn cpmk_score(&self, student_id: &str, cpmk_id: &str, policy: MissingPolicy) -> Attainment {
        let inputs: Vec<ComponentInput> = self
            .components
            .iter()
            .filter(|c| c.cpmk_id.as_deref() == Some(cpmk_id))
            .map(|c| ComponentInput {
                weight: c.weight,
                score: self.score(student_id, &c.id),
            })
            .collect();
        rollup::cpmk_score(&inputs, policy)
    }

    /// Weighted mean over every component of the class, mapped or not.
    pub fn course_score(&self, student_id: &str, policy: MissingPolicy) -> Attainment {
        rollup::weighted_rollup(
            self.components.iter().map(|c| WeightedInput {
                weight: c.weight,
                score: self.score(student_id, &c.id),
            }),
            policy,
        )
    }
}
