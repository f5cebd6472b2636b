use crate::model::{
    ClassInfo, GradeEntry, PeriodRecord, ReportCard, StoredReportCard, StudentRef,
    TeachingAssignment,
};
use rusqlite::{
    params, params_from_iter, types::Value, Connection, OptionalExtension, Transaction,
    TransactionBehavior,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("report card payload could not be encoded or decoded: {0}")]
    Payload(#[from] serde_json::Error),
}

pub trait RosterProvider {
    fn class_info(&self, class_id: &str) -> Result<Option<ClassInfo>, StoreError>;
    /// Active students of the class, in roster order.
    fn list_students(&self, class_id: &str) -> Result<Vec<StudentRef>, StoreError>;
    fn class_of_student(&self, student_id: &str) -> Result<Option<String>, StoreError>;
}

pub trait AssignmentProvider {
    fn list_assignments(&self, class_id: &str) -> Result<Vec<TeachingAssignment>, StoreError>;
}

pub trait PeriodProvider {
    fn period(&self, period_id: &str) -> Result<Option<PeriodRecord>, StoreError>;
}

pub trait GradeRepository {
    /// Every entry of `student_ids` in the period, grouped by student id.
    fn grade_entries(
        &self,
        period_id: &str,
        student_ids: &[String],
    ) -> Result<HashMap<String, Vec<GradeEntry>>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Written,
    /// Stored content already matched; the row was left untouched.
    Unchanged,
    /// The stored card is locked; nothing was written.
    Locked,
}

/// One batch transaction. Reads made through it see the same snapshot the
/// writes land in. Dropping it without `commit` rolls back.
pub trait UnitOfWork: RosterProvider + AssignmentProvider + PeriodProvider + GradeRepository {
    /// `None` when no card exists for the pair. Never decodes the payload.
    fn lock_state(&self, student_id: &str, period_id: &str) -> Result<Option<bool>, StoreError>;
    fn upsert_report_card(&mut self, card: &ReportCard) -> Result<UpsertOutcome, StoreError>;
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

pub trait ReportCardStore {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError>;
    fn lock_state(&self, student_id: &str, period_id: &str) -> Result<Option<bool>, StoreError>;
    fn find_report_card(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> Result<Option<StoredReportCard>, StoreError>;
    /// Stored cards of a class and period, in roster order.
    fn list_report_cards(
        &self,
        class_id: &str,
        period_id: &str,
    ) -> Result<Vec<StoredReportCard>, StoreError>;
    /// Returns false when no card exists for the pair.
    fn set_locked(&self, student_id: &str, period_id: &str, locked: bool)
        -> Result<bool, StoreError>;
}

/// Everything the report-card engine consumes.
pub trait Gradebook:
    RosterProvider + AssignmentProvider + PeriodProvider + GradeRepository + ReportCardStore
{
}

impl<T> Gradebook for T where
    T: RosterProvider + AssignmentProvider + PeriodProvider + GradeRepository + ReportCardStore
{
}

pub fn content_digest(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

fn query_class_info(conn: &Connection, class_id: &str) -> Result<Option<ClassInfo>, StoreError> {
    let info = conn
        .query_row(
            "SELECT id, school_year, homeroom_teacher FROM classes WHERE id = ?",
            [class_id],
            |r| {
                Ok(ClassInfo {
                    id: r.get(0)?,
                    school_year: r.get(1)?,
                    homeroom_teacher: r.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(info)
}

fn query_students(conn: &Connection, class_id: &str) -> Result<Vec<StudentRef>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, last_name, first_name
         FROM students
         WHERE class_id = ? AND active = 1
         ORDER BY sort_order, id",
    )?;
    let students = stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(StudentRef {
                id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(students)
}

fn query_class_of_student(conn: &Connection, student_id: &str) -> Result<Option<String>, StoreError> {
    let class_id = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(class_id)
}

fn query_assignments(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<TeachingAssignment>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT ta.id, ta.subject_id, s.name, s.subject_group,
                ta.teacher_name, ta.coefficient
         FROM teaching_assignments ta
         JOIN subjects s ON s.id = ta.subject_id
         WHERE ta.class_id = ?
         ORDER BY ta.sort_order, s.name",
    )?;
    let assignments = stmt
        .query_map([class_id], |r| {
            Ok(TeachingAssignment {
                id: r.get(0)?,
                subject_id: r.get(1)?,
                subject_name: r.get(2)?,
                subject_group: r.get(3)?,
                teacher_name: r.get(4)?,
                coefficient: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(assignments)
}

fn query_period(conn: &Connection, period_id: &str) -> Result<Option<PeriodRecord>, StoreError> {
    let period = conn
        .query_row(
            "SELECT id, name, school_year FROM periods WHERE id = ?",
            [period_id],
            |r| {
                Ok(PeriodRecord {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    school_year: r.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(period)
}

fn query_grade_entries(
    conn: &Connection,
    period_id: &str,
    student_ids: &[String],
) -> Result<HashMap<String, Vec<GradeEntry>>, StoreError> {
    let mut by_student: HashMap<String, Vec<GradeEntry>> = HashMap::new();
    if student_ids.is_empty() {
        return Ok(by_student);
    }

    let placeholders = std::iter::repeat("?")
        .take(student_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT g.id, g.student_id, g.teaching_assignment_id, g.period_id, g.sequence_number,
                g.value, g.evaluation_type, g.evaluation_date, g.remark,
                ta.subject_id, ta.coefficient, ta.teacher_name
         FROM grade_entries g
         JOIN teaching_assignments ta ON ta.id = g.teaching_assignment_id
         WHERE g.period_id = ? AND g.student_id IN ({})
         ORDER BY g.student_id, g.sequence_number, g.evaluation_date, g.id",
        placeholders
    );
    let mut bind_values: Vec<Value> = Vec::with_capacity(student_ids.len() + 1);
    bind_values.push(Value::Text(period_id.to_string()));
    for id in student_ids {
        bind_values.push(Value::Text(id.clone()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(bind_values), |r| {
        Ok(GradeEntry {
            id: r.get(0)?,
            student_id: r.get(1)?,
            teaching_assignment_id: r.get(2)?,
            period_id: r.get(3)?,
            sequence_number: r.get(4)?,
            value: r.get(5)?,
            evaluation_type: r.get(6)?,
            evaluation_date: r.get(7)?,
            remark: r.get(8)?,
            subject_id: r.get(9)?,
            coefficient: r.get(10)?,
            teacher_name: r.get(11)?,
        })
    })?;
    for row in rows {
        let entry = row?;
        by_student
            .entry(entry.student_id.clone())
            .or_default()
            .push(entry);
    }
    Ok(by_student)
}

fn query_lock_state(
    conn: &Connection,
    student_id: &str,
    period_id: &str,
) -> Result<Option<bool>, StoreError> {
    let locked: Option<i64> = conn
        .query_row(
            "SELECT is_locked FROM report_cards WHERE student_id = ? AND period_id = ?",
            (student_id, period_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(locked.map(|v| v != 0))
}

const STORED_CARD_COLUMNS: &str = "rc.id, rc.is_locked, rc.generated_at, rc.content_sha256, rc.payload";

type StoredCardRow = (String, i64, String, String, String);

fn stored_card_from_row(row: StoredCardRow) -> Result<StoredReportCard, StoreError> {
    let (id, is_locked, generated_at, content_sha256, payload) = row;
    Ok(StoredReportCard {
        id,
        is_locked: is_locked != 0,
        generated_at,
        content_sha256,
        report: serde_json::from_str(&payload)?,
    })
}

fn query_report_card(
    conn: &Connection,
    student_id: &str,
    period_id: &str,
) -> Result<Option<StoredReportCard>, StoreError> {
    let sql = format!(
        "SELECT {} FROM report_cards rc WHERE rc.student_id = ? AND rc.period_id = ?",
        STORED_CARD_COLUMNS
    );
    let row: Option<StoredCardRow> = conn
        .query_row(&sql, (student_id, period_id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .optional()?;
    row.map(stored_card_from_row).transpose()
}

pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl RosterProvider for SqliteStore<'_> {
    fn class_info(&self, class_id: &str) -> Result<Option<ClassInfo>, StoreError> {
        query_class_info(self.conn, class_id)
    }

    fn list_students(&self, class_id: &str) -> Result<Vec<StudentRef>, StoreError> {
        query_students(self.conn, class_id)
    }

    fn class_of_student(&self, student_id: &str) -> Result<Option<String>, StoreError> {
        query_class_of_student(self.conn, student_id)
    }
}

impl AssignmentProvider for SqliteStore<'_> {
    fn list_assignments(&self, class_id: &str) -> Result<Vec<TeachingAssignment>, StoreError> {
        query_assignments(self.conn, class_id)
    }
}

impl PeriodProvider for SqliteStore<'_> {
    fn period(&self, period_id: &str) -> Result<Option<PeriodRecord>, StoreError> {
        query_period(self.conn, period_id)
    }
}

impl GradeRepository for SqliteStore<'_> {
    fn grade_entries(
        &self,
        period_id: &str,
        student_ids: &[String],
    ) -> Result<HashMap<String, Vec<GradeEntry>>, StoreError> {
        query_grade_entries(self.conn, period_id, student_ids)
    }
}

impl ReportCardStore for SqliteStore<'_> {
    fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError> {
        // IMMEDIATE takes the write lock before the batch reads anything, so
        // a concurrent batch waits and then sees this one's grades and cards.
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        Ok(Box::new(SqliteUnitOfWork { tx }))
    }

    fn lock_state(&self, student_id: &str, period_id: &str) -> Result<Option<bool>, StoreError> {
        query_lock_state(self.conn, student_id, period_id)
    }

    fn find_report_card(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> Result<Option<StoredReportCard>, StoreError> {
        query_report_card(self.conn, student_id, period_id)
    }

    fn list_report_cards(
        &self,
        class_id: &str,
        period_id: &str,
    ) -> Result<Vec<StoredReportCard>, StoreError> {
        let sql = format!(
            "SELECT {}
             FROM report_cards rc
             JOIN students s ON s.id = rc.student_id
             WHERE rc.class_id = ? AND rc.period_id = ?
             ORDER BY s.sort_order, s.id",
            STORED_CARD_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<StoredCardRow> = stmt
            .query_map((class_id, period_id), |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(stored_card_from_row).collect()
    }

    fn set_locked(
        &self,
        student_id: &str,
        period_id: &str,
        locked: bool,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE report_cards SET is_locked = ? WHERE student_id = ? AND period_id = ?",
            (i64::from(locked), student_id, period_id),
        )?;
        Ok(changed > 0)
    }
}

pub struct SqliteUnitOfWork<'c> {
    tx: Transaction<'c>,
}

impl RosterProvider for SqliteUnitOfWork<'_> {
    fn class_info(&self, class_id: &str) -> Result<Option<ClassInfo>, StoreError> {
        query_class_info(&self.tx, class_id)
    }

    fn list_students(&self, class_id: &str) -> Result<Vec<StudentRef>, StoreError> {
        query_students(&self.tx, class_id)
    }

    fn class_of_student(&self, student_id: &str) -> Result<Option<String>, StoreError> {
        query_class_of_student(&self.tx, student_id)
    }
}

impl AssignmentProvider for SqliteUnitOfWork<'_> {
    fn list_assignments(&self, class_id: &str) -> Result<Vec<TeachingAssignment>, StoreError> {
        query_assignments(&self.tx, class_id)
    }
}

impl PeriodProvider for SqliteUnitOfWork<'_> {
    fn period(&self, period_id: &str) -> Result<Option<PeriodRecord>, StoreError> {
        query_period(&self.tx, period_id)
    }
}

impl GradeRepository for SqliteUnitOfWork<'_> {
    fn grade_entries(
        &self,
        period_id: &str,
        student_ids: &[String],
    ) -> Result<HashMap<String, Vec<GradeEntry>>, StoreError> {
        query_grade_entries(&self.tx, period_id, student_ids)
    }
}

impl UnitOfWork for SqliteUnitOfWork<'_> {
    fn lock_state(&self, student_id: &str, period_id: &str) -> Result<Option<bool>, StoreError> {
        query_lock_state(&self.tx, student_id, period_id)
    }

    fn upsert_report_card(&mut self, card: &ReportCard) -> Result<UpsertOutcome, StoreError> {
        let payload = serde_json::to_string(card)?;
        let digest = content_digest(&payload);

        // Compare against the stored payload itself so a row whose payload
        // was rewritten behind our back gets repaired.
        let existing: Option<(String, i64)> = self
            .tx
            .query_row(
                "SELECT payload, is_locked FROM report_cards WHERE student_id = ? AND period_id = ?",
                (&card.student_id, &card.period_id),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match existing {
            Some((_, locked)) if locked != 0 => return Ok(UpsertOutcome::Locked),
            Some((stored, _)) if content_digest(&stored) == digest => {
                return Ok(UpsertOutcome::Unchanged)
            }
            _ => {}
        }

        let generated_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let changed = self.tx.execute(
            "INSERT INTO report_cards(
                id, student_id, period_id, class_id, overall_average, rank, class_size,
                comment, payload, content_sha256, is_locked, generated_at
             )
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
             ON CONFLICT(student_id, period_id) DO UPDATE SET
               class_id = excluded.class_id,
               overall_average = excluded.overall_average,
               rank = excluded.rank,
               class_size = excluded.class_size,
               comment = excluded.comment,
               payload = excluded.payload,
               content_sha256 = excluded.content_sha256,
               generated_at = excluded.generated_at
             WHERE report_cards.is_locked = 0",
            params![
                uuid::Uuid::new_v4().to_string(),
                card.student_id,
                card.period_id,
                card.class_id,
                card.overall_average,
                card.rank,
                card.class_size,
                card.comment,
                payload,
                digest,
                generated_at,
            ],
        )?;
        if changed == 0 {
            return Ok(UpsertOutcome::Locked);
        }
        Ok(UpsertOutcome::Written)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let unit = *self;
        unit.tx.commit()?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let unit = *self;
        unit.tx.rollback()?;
        Ok(())
    }
}
