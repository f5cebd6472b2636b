use crate::db;
use rusqlite::Connection;
use std::path::PathBuf;

pub fn memory_db() -> Connection {
    let conn = Connection::open_in_memory().expect("open memory db");
    db::init_schema(&conn).expect("init schema");
    conn
}

/// A schema-initialised database file under the temp dir, for tests that
/// need a second connection.
pub fn file_db(prefix: &str) -> (Connection, PathBuf) {
    let path = std::env::temp_dir().join(format!(
        "{}-{}.sqlite3",
        prefix,
        uuid::Uuid::new_v4()
    ));
    let conn = Connection::open(&path).expect("open file db");
    db::init_schema(&conn).expect("init schema");
    (conn, path)
}

pub fn add_class(conn: &Connection, id: &str, homeroom: Option<&str>) {
    conn.execute(
        "INSERT INTO classes(id, name, school_year, homeroom_teacher) VALUES(?, ?, '2025-2026', ?)",
        (id, format!("Class {}", id), homeroom),
    )
    .expect("insert class");
}

pub fn add_student(conn: &Connection, class_id: &str, id: &str, sort_order: i64) {
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
         VALUES(?, ?, ?, 'Test', 1, ?)",
        (id, class_id, format!("Student {}", id), sort_order),
    )
    .expect("insert student");
}

pub fn add_period(conn: &Connection, id: &str, name: &str) {
    conn.execute(
        "INSERT INTO periods(id, name, school_year, is_active) VALUES(?, ?, '2025-2026', 1)",
        (id, name),
    )
    .expect("insert period");
}

/// Adds the subject and its assignment to the class; the assignment id is
/// `ta-<subject_id>`.
pub fn add_assignment(
    conn: &Connection,
    class_id: &str,
    subject_id: &str,
    group: &str,
    teacher: Option<&str>,
    coefficient: u32,
    sort_order: i64,
) -> String {
    conn.execute(
        "INSERT OR IGNORE INTO subjects(id, name, subject_group) VALUES(?, ?, ?)",
        (subject_id, subject_id.to_uppercase(), group),
    )
    .expect("insert subject");
    let ta_id = format!("ta-{}", subject_id);
    conn.execute(
        "INSERT INTO teaching_assignments(id, class_id, subject_id, teacher_name, coefficient, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&ta_id, class_id, subject_id, teacher, coefficient, sort_order),
    )
    .expect("insert assignment");
    ta_id
}

pub fn add_grade(
    conn: &Connection,
    student_id: &str,
    ta_id: &str,
    period_id: &str,
    sequence: u8,
    value: f64,
) {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grade_entries(id, student_id, teaching_assignment_id, period_id, sequence_number, value, evaluation_type, evaluation_date)
         VALUES(?, ?, ?, ?, ?, ?, 'test', '2025-10-01')",
        (&id, student_id, ta_id, period_id, sequence, value),
    )
    .expect("insert grade");
}

pub fn report_card_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM report_cards", [], |r| r.get(0))
        .expect("count report cards")
}
