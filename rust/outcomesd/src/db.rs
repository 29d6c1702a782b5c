use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "outcomes.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    // Curriculum side: CPL -> IK, course -> RPS -> CPMK.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS curricula(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cpls(
            id TEXT PRIMARY KEY,
            curriculum_id TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(curriculum_id) REFERENCES curricula(id),
            UNIQUE(curriculum_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS iks(
            id TEXT PRIMARY KEY,
            cpl_id TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(cpl_id) REFERENCES cpls(id),
            UNIQUE(cpl_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            curriculum_id TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(curriculum_id) REFERENCES curricula(id),
            UNIQUE(curriculum_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS rps(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            revision TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, revision)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cpmks(
            id TEXT PRIMARY KEY,
            rps_id TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL,
            cpl_id TEXT,
            bobot_to_cpl REAL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(rps_id) REFERENCES rps(id),
            FOREIGN KEY(cpl_id) REFERENCES cpls(id),
            UNIQUE(rps_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cpmks_cpl ON cpmks(cpl_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cpmk_iks(
            cpmk_id TEXT NOT NULL,
            ik_id TEXT NOT NULL,
            PRIMARY KEY(cpmk_id, ik_id),
            FOREIGN KEY(cpmk_id) REFERENCES cpmks(id),
            FOREIGN KEY(ik_id) REFERENCES iks(id)
        )",
        [],
    )?;

    // Teaching side: class -> enrollment, class -> component -> score.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            term_year INTEGER NOT NULL,
            term_semester TEXT NOT NULL CHECK(term_semester IN ('GANJIL', 'GENAP')),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_course ON classes(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            nim TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            enrolled_at TEXT,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS components(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL COLLATE NOCASE,
            weight REAL NOT NULL,
            cpmk_id TEXT,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(cpmk_id) REFERENCES cpmks(id),
            UNIQUE(class_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_components_class ON components(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_components_cpmk ON components(cpmk_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS component_scores(
            id TEXT PRIMARY KEY,
            component_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            score REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(component_id) REFERENCES components(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(component_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_component_scores_student ON component_scores(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_batches(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            content_sha256 TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            cell_count INTEGER NOT NULL,
            cleared_count INTEGER NOT NULL,
            imported_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_batches_class ON import_batches(class_id)",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
