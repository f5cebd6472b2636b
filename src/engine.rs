use crate::calc::{self, SubjectStats};
use crate::config::EngineConfig;
use crate::model::{
    BatchResult, ClassInfo, ClassProfile, GradeEntry, GroupTotal, PeriodContext, ReportCard,
    StoredReportCard, StudentOutcome, StudentRef, StudentState, SubjectLine, TeachingAssignment,
};
use crate::sequences::{self, SequenceResolution};
use crate::store::{Gradebook, StoreError, UnitOfWork, UpsertOutcome};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to load {what}: {source}")]
    DataAccess {
        what: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("failed to persist report cards: {0}")]
    Persistence(#[source] StoreError),
    #[error("{0}")]
    NotFound(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::DataAccess { .. } => "db_query_failed",
            EngineError::Persistence(_) => "db_update_failed",
            EngineError::NotFound(_) => "not_found",
        }
    }
}

fn load<T>(what: &'static str, res: Result<T, StoreError>) -> Result<T, EngineError> {
    res.map_err(|source| EngineError::DataAccess { what, source })
}

/// Loaded inputs plus the class-wide figures shared by every card.
struct ClassSnapshot {
    class: ClassInfo,
    period: PeriodContext,
    roster: Vec<StudentRef>,
    assignments: Vec<TeachingAssignment>,
    /// Students with at least one counted entry.
    entries: HashMap<String, Vec<GradeEntry>>,
    averages: HashMap<String, f64>,
    ranks: HashMap<String, u32>,
    profile: ClassProfile,
    subject_stats: BTreeMap<String, SubjectStats>,
}

pub struct ReportCardEngine<'a, S: Gradebook> {
    store: &'a S,
    config: &'a EngineConfig,
}

impl<'a, S: Gradebook> ReportCardEngine<'a, S> {
    pub fn new(store: &'a S, config: &'a EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn recompute_class_period(
        &self,
        class_id: &str,
        period_id: &str,
    ) -> Result<BatchResult, EngineError> {
        let mut warnings = Vec::new();
        // Reads and writes share one unit of work, so a concurrent batch can
        // never slip newer grades in between what we load and what we write.
        let mut unit = self.store.begin().map_err(EngineError::Persistence)?;
        let loaded = self.load_snapshot(&*unit, class_id, period_id, &mut warnings);
        let snap = match loaded {
            Ok(snap) => snap,
            Err(e) => {
                if let Err(rb) = unit.rollback() {
                    warn!("rollback failed: {}", rb);
                }
                return Err(e);
            }
        };

        let mut outcomes: Vec<StudentOutcome> = snap
            .roster
            .iter()
            .map(|s| StudentOutcome {
                student_id: s.id.clone(),
                state: StudentState::Pending,
                unchanged: false,
            })
            .collect();

        for (student, outcome) in snap.roster.iter().zip(outcomes.iter_mut()) {
            let Some(entries) = snap.entries.get(&student.id) else {
                debug!("{}: no grade entries, skipped", student.id);
                outcome.state = StudentState::SkippedNoData;
                continue;
            };

            let locked = match unit.lock_state(&student.id, period_id) {
                Ok(v) => v.unwrap_or(false),
                Err(e) => return Err(abort(unit, class_id, period_id, e)),
            };
            if locked {
                debug!("{}: report card locked, skipped", student.id);
                outcome.state = StudentState::SkippedLocked;
                continue;
            }

            let card = self.assemble_card(&snap, student, entries);
            outcome.state = StudentState::Computed;
            match unit.upsert_report_card(&card) {
                Ok(UpsertOutcome::Written) => {}
                Ok(UpsertOutcome::Unchanged) => outcome.unchanged = true,
                Ok(UpsertOutcome::Locked) => outcome.state = StudentState::SkippedLocked,
                Err(e) => return Err(abort(unit, class_id, period_id, e)),
            }
        }

        if let Err(e) = unit.commit() {
            error!(
                "commit failed for class {} period {}: {}",
                class_id, period_id, e
            );
            return Err(EngineError::Persistence(e));
        }
        for outcome in &mut outcomes {
            if outcome.state == StudentState::Computed {
                outcome.state = StudentState::Persisted;
            }
        }

        let count = |state: StudentState| outcomes.iter().filter(|o| o.state == state).count();
        let result = BatchResult {
            class_id: class_id.to_string(),
            period_id: period_id.to_string(),
            computed: count(StudentState::Persisted),
            unchanged: outcomes.iter().filter(|o| o.unchanged).count(),
            skipped_locked: count(StudentState::SkippedLocked),
            skipped_no_data: count(StudentState::SkippedNoData),
            warnings,
            outcomes,
        };
        info!(
            "report cards class={} period={}: computed={} unchanged={} locked={} no_data={}",
            class_id,
            period_id,
            result.computed,
            result.unchanged,
            result.skipped_locked,
            result.skipped_no_data
        );
        Ok(result)
    }

    /// A locked card is returned as stored. Otherwise the whole class is
    /// recomputed and the student's fresh row returned.
    pub fn get_or_recompute_student_report_card(
        &self,
        student_id: &str,
        period_id: &str,
    ) -> Result<StoredReportCard, EngineError> {
        let class_id = load("student", self.store.class_of_student(student_id))?
            .ok_or_else(|| EngineError::NotFound(format!("student not found: {}", student_id)))?;

        let locked = load("report card", self.store.lock_state(student_id, period_id))?;
        if locked != Some(true) {
            self.recompute_class_period(&class_id, period_id)?;
        }
        load(
            "report card",
            self.store.find_report_card(student_id, period_id),
        )?
        .ok_or_else(|| {
            EngineError::NotFound(format!(
                "no report card for student {} in period {}: no grades recorded",
                student_id, period_id
            ))
        })
    }

    fn period_context(
        &self,
        source: &dyn UnitOfWork,
        period_id: &str,
        warnings: &mut Vec<String>,
    ) -> Result<PeriodContext, EngineError> {
        let record = load("period", source.period(period_id))?
            .ok_or_else(|| EngineError::NotFound(format!("period not found: {}", period_id)))?;

        let resolution =
            sequences::resolve_sequences(&record.name, &self.config.period_sequences);
        let sequences = resolution.sequences();
        if let SequenceResolution::Fallback(s) = resolution {
            let msg = format!(
                "unknown period mapping for '{}', using sequences {} and {}",
                record.name, s[0], s[1]
            );
            warn!("{}", msg);
            warnings.push(msg);
        }

        Ok(PeriodContext {
            period_id: record.id,
            name: record.name,
            school_year: record.school_year,
            sequences,
        })
    }

    fn load_snapshot(
        &self,
        source: &dyn UnitOfWork,
        class_id: &str,
        period_id: &str,
        warnings: &mut Vec<String>,
    ) -> Result<ClassSnapshot, EngineError> {
        let class = load("class", source.class_info(class_id))?
            .ok_or_else(|| EngineError::NotFound(format!("class not found: {}", class_id)))?;
        let period = self.period_context(source, period_id, warnings)?;
        let roster = load("roster", source.list_students(class_id))?;
        let assignments: Vec<TeachingAssignment> =
            load("teaching assignments", source.list_assignments(class_id))?
                .into_iter()
                .filter(|a| a.is_taught())
                .collect();
        let taught: HashSet<&str> = assignments.iter().map(|a| a.id.as_str()).collect();

        let student_ids: Vec<String> = roster.iter().map(|s| s.id.clone()).collect();
        let mut loaded = load(
            "grade entries",
            source.grade_entries(period_id, &student_ids),
        )?;

        // Entries under zero-coefficient or foreign assignments never count,
        // not even toward "has data".
        let mut entries: HashMap<String, Vec<GradeEntry>> = HashMap::new();
        for student in &roster {
            let Some(list) = loaded.remove(&student.id) else {
                continue;
            };
            let kept: Vec<GradeEntry> = list
                .into_iter()
                .filter(|e| taught.contains(e.teaching_assignment_id.as_str()))
                .collect();
            if !kept.is_empty() {
                entries.insert(student.id.clone(), kept);
            }
        }

        let ranked: Vec<(String, f64)> = roster
            .iter()
            .filter_map(|s| {
                entries.get(&s.id).map(|list| {
                    let avg = calc::weighted_average(list.iter().map(|e| (e.value, e.coefficient)));
                    (s.id.clone(), avg)
                })
            })
            .collect();
        let ranks = calc::rank_students(&ranked);
        let overall: Vec<f64> = ranked.iter().map(|(_, avg)| *avg).collect();
        let profile = calc::class_profile(&overall, self.config.pass_mark);
        let subject_stats = calc::subject_statistics(entries.values().flatten());

        Ok(ClassSnapshot {
            class,
            period,
            roster,
            assignments,
            entries,
            averages: ranked.into_iter().collect(),
            ranks,
            profile,
            subject_stats,
        })
    }

    fn label_or_default(&self, name: Option<&str>) -> String {
        name.map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.config.not_assigned_label.clone())
    }

    fn assemble_card(
        &self,
        snap: &ClassSnapshot,
        student: &StudentRef,
        entries: &[GradeEntry],
    ) -> ReportCard {
        let overall_average = snap.averages.get(&student.id).copied().unwrap_or(0.0);
        let rank = snap.ranks.get(&student.id).copied().unwrap_or(0);

        let mut subjects = Vec::new();
        for ta in &snap.assignments {
            let Some(stats) = snap.subject_stats.get(&ta.id) else {
                continue;
            };
            let Some((subject_average, subject_rank)) = stats.student_standing(&student.id) else {
                continue;
            };
            subjects.push(SubjectLine {
                teaching_assignment_id: ta.id.clone(),
                subject_id: ta.subject_id.clone(),
                subject_name: ta.subject_name.clone(),
                group: ta.subject_group.clone(),
                coefficient: ta.coefficient,
                subject_average,
                // Product of the already-rounded average, kept for parity
                // with historical report cards.
                weighted_total: calc::round_off_2_decimals(
                    subject_average * f64::from(ta.coefficient),
                ),
                class_subject_average: stats.class_average,
                class_subject_min: stats.min,
                class_subject_max: stats.max,
                subject_rank,
                teacher_name: self.label_or_default(ta.teacher_name.as_deref()),
            });
        }

        let group_totals = group_totals(&subjects);
        let total_coefficient: u32 = subjects.iter().map(|s| s.coefficient).sum();
        let total_weighted =
            calc::round_off_2_decimals(subjects.iter().map(|s| s.weighted_total).sum::<f64>());

        ReportCard {
            student_id: student.id.clone(),
            student_name: student.display_name.clone(),
            class_id: snap.class.id.clone(),
            period_id: snap.period.period_id.clone(),
            period_name: snap.period.name.clone(),
            school_year: snap
                .period
                .school_year
                .clone()
                .or_else(|| snap.class.school_year.clone()),
            homeroom_teacher: self.label_or_default(snap.class.homeroom_teacher.as_deref()),
            overall_average,
            rank,
            class_size: snap.averages.len() as u32,
            subjects,
            group_totals,
            total_coefficient,
            total_weighted,
            sequence_breakdown: sequences::sequence_breakdown(snap.period.sequences, entries),
            class_profile: snap.profile,
            comment: calc::comment_for(overall_average).to_string(),
        }
    }
}

/// Subject groups in first-appearance order.
fn group_totals(subjects: &[SubjectLine]) -> Vec<GroupTotal> {
    let mut out: Vec<GroupTotal> = Vec::new();
    for line in subjects {
        let idx = match out.iter().position(|g| g.group == line.group) {
            Some(i) => i,
            None => {
                out.push(GroupTotal {
                    group: line.group.clone(),
                    total_coefficient: 0,
                    total_weighted: 0.0,
                    average: 0.0,
                });
                out.len() - 1
            }
        };
        out[idx].total_coefficient += line.coefficient;
        out[idx].total_weighted += line.weighted_total;
    }
    for g in &mut out {
        g.total_weighted = calc::round_off_2_decimals(g.total_weighted);
        g.average = if g.total_coefficient > 0 {
            calc::round_off_2_decimals(g.total_weighted / f64::from(g.total_coefficient))
        } else {
            0.0
        };
    }
    out
}

fn abort(
    unit: Box<dyn UnitOfWork + '_>,
    class_id: &str,
    period_id: &str,
    source: StoreError,
) -> EngineError {
    error!(
        "rolling back report cards for class {} period {}: {}",
        class_id, period_id, source
    );
    if let Err(e) = unit.rollback() {
        warn!("rollback failed: {}", e);
    }
    EngineError::Persistence(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PeriodRecord;
    use crate::store::{
        AssignmentProvider, GradeRepository, PeriodProvider, ReportCardStore, RosterProvider,
        SqliteStore,
    };
    use crate::test_support::*;
    use rusqlite::Connection;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    fn roster_of_three(period_name: &str) -> (Connection, String) {
        let conn = memory_db();
        add_class(&conn, "c1", Some("Mrs Ada"));
        add_student(&conn, "c1", "s1", 1);
        add_student(&conn, "c1", "s2", 2);
        add_student(&conn, "c1", "s3", 3);
        add_period(&conn, "p1", period_name);
        let math = add_assignment(&conn, "c1", "math", "Sciences", Some("Mr Euler"), 1, 1);
        (conn, math)
    }

    fn stored(conn: &Connection, student: &str) -> StoredReportCard {
        SqliteStore::new(conn)
            .find_report_card(student, "p1")
            .expect("find")
            .expect("stored card")
    }

    type CardRow = (String, String, String, String, i64);

    fn card_rows(conn: &Connection) -> Vec<CardRow> {
        let mut stmt = conn
            .prepare(
                "SELECT id, payload, content_sha256, generated_at, is_locked
                 FROM report_cards ORDER BY student_id",
            )
            .expect("prepare");
        stmt.query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows")
    }

    fn recompute(conn: &Connection) -> Result<BatchResult, EngineError> {
        let store = SqliteStore::new(conn);
        let config = EngineConfig::default();
        ReportCardEngine::new(&store, &config).recompute_class_period("c1", "p1")
    }

    #[test]
    fn ranks_and_profile_match_worked_example() {
        let (conn, math) = roster_of_three("1st period");
        add_grade(&conn, "s1", &math, "p1", 1, 15.0);
        add_grade(&conn, "s2", &math, "p1", 1, 10.0);
        add_grade(&conn, "s3", &math, "p1", 2, 8.0);

        let result = recompute(&conn).expect("batch");
        assert_eq!(result.computed, 3);
        assert!(result.warnings.is_empty());

        let ranks: Vec<u32> = ["s1", "s2", "s3"]
            .iter()
            .map(|s| stored(&conn, s).report.rank)
            .collect();
        assert_eq!(ranks, vec![1, 2, 3]);

        let card = stored(&conn, "s2").report;
        assert_eq!(card.class_size, 3);
        assert_eq!(card.class_profile.mean, 11.0);
        assert_eq!(card.class_profile.pass_rate_pct, 66.67);
        assert_eq!(card.class_profile.top_average, 15.0);
        assert_eq!(card.class_profile.bottom_average, 8.0);
        assert_eq!(card.comment, calc::COMMENT_BORDERLINE);
        assert_eq!(stored(&conn, "s1").report.comment, calc::COMMENT_SATISFACTORY);
        assert_eq!(stored(&conn, "s3").report.comment, calc::COMMENT_NEEDS_IMPROVEMENT);
    }

    #[test]
    fn subject_line_keeps_rounded_average_times_coefficient() {
        let conn = memory_db();
        add_class(&conn, "c1", None);
        add_student(&conn, "c1", "s1", 1);
        add_period(&conn, "p1", "1st period");
        let a = add_assignment(&conn, "c1", "a", "Core", None, 2, 1);
        add_grade(&conn, "s1", &a, "p1", 1, 10.0);
        add_grade(&conn, "s1", &a, "p1", 2, 14.0);

        recompute(&conn).expect("batch");
        let card = stored(&conn, "s1").report;
        let line = &card.subjects[0];
        assert_eq!(line.subject_average, 12.0);
        assert_eq!(line.weighted_total, 24.0);
        assert_eq!(line.subject_rank, 1);
        assert_eq!(line.teacher_name, "Not assigned");
        assert_eq!(card.homeroom_teacher, "Not assigned");
        assert_eq!(card.total_coefficient, 2);
        assert_eq!(card.total_weighted, 24.0);
    }

    #[test]
    fn overall_average_weights_every_entry_by_its_coefficient() {
        let (conn, math) = roster_of_three("1st period");
        let french = add_assignment(&conn, "c1", "french", "Letters", Some("Ms Hugo"), 2, 2);
        let art = add_assignment(&conn, "c1", "art", "Arts", Some("Mr Klee"), 0, 3);
        conn.execute(
            "UPDATE teaching_assignments SET coefficient = 4 WHERE id = ?",
            [&math],
        )
        .expect("coef");
        add_grade(&conn, "s1", &math, "p1", 1, 10.0);
        add_grade(&conn, "s1", &math, "p1", 2, 14.0);
        add_grade(&conn, "s1", &french, "p1", 1, 9.0);
        add_grade(&conn, "s1", &art, "p1", 1, 20.0);

        recompute(&conn).expect("batch");
        let card = stored(&conn, "s1").report;
        // (10*4 + 14*4 + 9*2) / 10
        assert_eq!(card.overall_average, 11.4);
        assert!(card.overall_average >= 0.0 && card.overall_average <= 20.0);
        let subjects: Vec<&str> = card.subjects.iter().map(|s| s.subject_id.as_str()).collect();
        assert_eq!(subjects, vec!["math", "french"]);

        assert_eq!(card.group_totals.len(), 2);
        assert_eq!(card.group_totals[0].group, "Sciences");
        assert_eq!(card.group_totals[0].total_weighted, 48.0);
        assert_eq!(card.group_totals[1].average, 9.0);
        assert_eq!(card.total_coefficient, 6);
        assert_eq!(card.total_weighted, 66.0);
    }

    #[test]
    fn students_without_counted_entries_get_no_card() {
        let (conn, math) = roster_of_three("1st period");
        let art = add_assignment(&conn, "c1", "art", "Arts", None, 0, 2);
        add_grade(&conn, "s1", &math, "p1", 1, 12.0);
        // only a zero-coefficient entry
        add_grade(&conn, "s2", &art, "p1", 1, 18.0);

        let result = recompute(&conn).expect("batch");
        assert_eq!(result.computed, 1);
        assert_eq!(result.skipped_no_data, 2);
        assert_eq!(report_card_count(&conn), 1);
        assert_eq!(stored(&conn, "s1").report.class_size, 1);
        assert_eq!(result.outcomes[1].state, StudentState::SkippedNoData);
    }

    #[test]
    fn recompute_twice_is_byte_identical() {
        let (conn, math) = roster_of_three("1st period");
        add_grade(&conn, "s1", &math, "p1", 1, 13.25);
        add_grade(&conn, "s2", &math, "p1", 2, 7.5);

        let snapshot = |conn: &Connection| -> Vec<(String, String, String, String)> {
            let mut stmt = conn
                .prepare(
                    "SELECT id, payload, content_sha256, generated_at FROM report_cards ORDER BY student_id",
                )
                .expect("prepare");
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
                .expect("query")
                .collect::<Result<Vec<_>, _>>()
                .expect("rows")
        };

        let first = recompute(&conn).expect("first");
        assert_eq!(first.unchanged, 0);
        let before = snapshot(&conn);
        let second = recompute(&conn).expect("second");
        assert_eq!(second.computed, 2);
        assert_eq!(second.unchanged, 2);
        assert_eq!(snapshot(&conn), before);
    }

    #[test]
    fn locked_card_survives_recompute_with_new_grades() {
        let (conn, math) = roster_of_three("1st period");
        add_grade(&conn, "s1", &math, "p1", 1, 11.0);
        add_grade(&conn, "s2", &math, "p1", 1, 9.0);
        recompute(&conn).expect("first");
        let store = SqliteStore::new(&conn);
        assert!(store.set_locked("s1", "p1", true).expect("lock"));
        let locked_before = stored(&conn, "s1");

        add_grade(&conn, "s1", &math, "p1", 2, 19.0);
        add_grade(&conn, "s2", &math, "p1", 2, 19.0);
        let result = recompute(&conn).expect("second");

        assert_eq!(result.skipped_locked, 1);
        assert_eq!(result.computed, 1);
        assert_eq!(stored(&conn, "s1"), locked_before);
        assert_eq!(stored(&conn, "s2").report.overall_average, 14.0);
    }

    #[test]
    fn unknown_period_name_falls_back_and_completes() {
        let (conn, math) = roster_of_three("Special Term");
        add_grade(&conn, "s1", &math, "p1", 1, 12.0);
        add_grade(&conn, "s1", &math, "p1", 2, 16.0);
        add_grade(&conn, "s1", &math, "p1", 3, 4.0);

        let result = recompute(&conn).expect("batch");
        assert_eq!(result.computed, 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("Special Term"));

        let card = stored(&conn, "s1").report;
        let seqs: Vec<u8> = card.sequence_breakdown.keys().copied().collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(card.sequence_breakdown[&1]["math"].average, 12.0);
        // the stray sequence-3 entry still counts toward the period average
        assert_eq!(card.overall_average, 10.67);
    }

    #[test]
    fn sequence_breakdown_follows_period_mapping() {
        let (conn, math) = roster_of_three("2nd period");
        add_grade(&conn, "s1", &math, "p1", 3, 10.0);
        add_grade(&conn, "s1", &math, "p1", 4, 15.0);
        add_grade(&conn, "s1", &math, "p1", 1, 2.0);

        recompute(&conn).expect("batch");
        let card = stored(&conn, "s1").report;
        let seqs: Vec<u8> = card.sequence_breakdown.keys().copied().collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(card.sequence_breakdown[&4]["math"].coefficient, 1);
    }

    #[test]
    fn persistence_failure_rolls_back_the_whole_batch() {
        let (conn, math) = roster_of_three("1st period");
        add_grade(&conn, "s1", &math, "p1", 1, 12.0);
        add_grade(&conn, "s2", &math, "p1", 1, 11.0);
        add_grade(&conn, "s3", &math, "p1", 1, 10.0);
        conn.execute_batch(
            "CREATE TRIGGER fail_s3 BEFORE INSERT ON report_cards
             WHEN NEW.student_id = 's3'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .expect("trigger");

        let err = recompute(&conn).expect_err("batch must fail");
        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(err.code(), "db_update_failed");
        assert_eq!(report_card_count(&conn), 0);
    }

    #[test]
    fn load_failure_aborts_before_any_write() {
        let (conn, math) = roster_of_three("1st period");
        add_grade(&conn, "s1", &math, "p1", 1, 12.0);
        conn.execute_batch("DROP TABLE grade_entries;").expect("drop");

        let err = recompute(&conn).expect_err("batch must fail");
        assert!(matches!(
            err,
            EngineError::DataAccess {
                what: "grade entries",
                ..
            }
        ));
        assert_eq!(err.code(), "db_query_failed");
        assert_eq!(report_card_count(&conn), 0);
    }

    #[test]
    fn distinct_averages_rank_one_to_n() {
        let (conn, math) = roster_of_three("1st period");
        add_student(&conn, "c1", "s4", 4);
        for (i, s) in ["s1", "s2", "s3", "s4"].iter().enumerate() {
            add_grade(&conn, s, &math, "p1", 1, 5.0 + i as f64 * 3.5);
        }
        recompute(&conn).expect("batch");
        let mut ranks: Vec<u32> = ["s1", "s2", "s3", "s4"]
            .iter()
            .map(|s| stored(&conn, s).report.rank)
            .collect();
        assert_eq!(ranks, vec![4, 3, 2, 1]);
        ranks.sort();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn get_or_recompute_builds_missing_card_and_respects_locks() {
        let (conn, math) = roster_of_three("1st period");
        add_grade(&conn, "s1", &math, "p1", 1, 14.0);
        let store = SqliteStore::new(&conn);
        let config = EngineConfig::default();
        let engine = ReportCardEngine::new(&store, &config);

        let card = engine
            .get_or_recompute_student_report_card("s1", "p1")
            .expect("card");
        assert_eq!(card.report.overall_average, 14.0);
        assert!(!card.is_locked);

        store.set_locked("s1", "p1", true).expect("lock");
        add_grade(&conn, "s1", &math, "p1", 2, 2.0);
        let locked = engine
            .get_or_recompute_student_report_card("s1", "p1")
            .expect("locked card");
        assert!(locked.is_locked);
        assert_eq!(locked.report.overall_average, 14.0);

        let no_data = engine
            .get_or_recompute_student_report_card("s2", "p1")
            .expect_err("no grades");
        assert_eq!(no_data.code(), "not_found");
        let unknown = engine
            .get_or_recompute_student_report_card("ghost", "p1")
            .expect_err("unknown student");
        assert_eq!(unknown.code(), "not_found");
    }

    #[test]
    fn unknown_class_or_period_is_not_found() {
        let (conn, _) = roster_of_three("1st period");
        let store = SqliteStore::new(&conn);
        let config = EngineConfig::default();
        let engine = ReportCardEngine::new(&store, &config);
        assert!(matches!(
            engine.recompute_class_period("nope", "p1"),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.recompute_class_period("c1", "nope"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn configured_pass_mark_and_mapping_apply() {
        let (conn, math) = roster_of_three("Special Term");
        add_grade(&conn, "s1", &math, "p1", 5, 11.0);
        add_grade(&conn, "s2", &math, "p1", 6, 13.0);
        let store = SqliteStore::new(&conn);
        let mut config = EngineConfig::default();
        config.pass_mark = 12.0;
        config
            .period_sequences
            .insert("special term".to_string(), [5, 6]);

        let result = ReportCardEngine::new(&store, &config)
            .recompute_class_period("c1", "p1")
            .expect("batch");
        assert!(result.warnings.is_empty());
        let card = stored(&conn, "s1").report;
        assert_eq!(card.class_profile.pass_rate_pct, 50.0);
        assert_eq!(card.sequence_breakdown.keys().copied().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn failed_update_leaves_existing_cards_untouched() {
        let (conn, math) = roster_of_three("1st period");
        add_grade(&conn, "s1", &math, "p1", 1, 12.0);
        add_grade(&conn, "s2", &math, "p1", 1, 11.0);
        add_grade(&conn, "s3", &math, "p1", 1, 10.0);
        recompute(&conn).expect("first");
        let before = card_rows(&conn);
        assert_eq!(before.len(), 3);

        add_grade(&conn, "s1", &math, "p1", 2, 18.0);
        add_grade(&conn, "s2", &math, "p1", 2, 17.0);
        add_grade(&conn, "s3", &math, "p1", 2, 16.0);
        conn.execute_batch(
            "CREATE TRIGGER fail_update_s3 BEFORE UPDATE ON report_cards
             WHEN NEW.student_id = 's3'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .expect("trigger");

        let err = recompute(&conn).expect_err("batch must fail");
        assert!(matches!(err, EngineError::Persistence(_)));
        assert_eq!(card_rows(&conn), before);
    }

    #[test]
    fn locked_card_with_unreadable_payload_is_still_skipped() {
        let (conn, math) = roster_of_three("1st period");
        add_grade(&conn, "s1", &math, "p1", 1, 11.0);
        add_grade(&conn, "s2", &math, "p1", 1, 9.0);
        recompute(&conn).expect("first");
        let store = SqliteStore::new(&conn);
        store.set_locked("s1", "p1", true).expect("lock");
        conn.execute(
            "UPDATE report_cards SET payload = '{\"legacy\": true}' WHERE student_id = 's1'",
            [],
        )
        .expect("old payload");

        add_grade(&conn, "s2", &math, "p1", 2, 19.0);
        let result = recompute(&conn).expect("batch");
        assert_eq!(result.skipped_locked, 1);
        assert_eq!(result.computed, 1);
        assert_eq!(stored(&conn, "s2").report.overall_average, 14.0);

        let config = EngineConfig::default();
        let engine = ReportCardEngine::new(&store, &config);
        let card = engine
            .get_or_recompute_student_report_card("s2", "p1")
            .expect("s2 card");
        assert_eq!(card.report.overall_average, 14.0);
    }

    type Hook = Box<dyn FnOnce()>;

    /// Runs its hook the first time a batch reads grade entries through the
    /// unit of work.
    struct HookedStore<'c> {
        inner: SqliteStore<'c>,
        hook: RefCell<Option<Hook>>,
    }

    struct HookedUnit<'a> {
        inner: Box<dyn UnitOfWork + 'a>,
        hook: RefCell<Option<Hook>>,
    }

    impl RosterProvider for HookedStore<'_> {
        fn class_info(&self, class_id: &str) -> Result<Option<ClassInfo>, StoreError> {
            self.inner.class_info(class_id)
        }
        fn list_students(&self, class_id: &str) -> Result<Vec<StudentRef>, StoreError> {
            self.inner.list_students(class_id)
        }
        fn class_of_student(&self, student_id: &str) -> Result<Option<String>, StoreError> {
            self.inner.class_of_student(student_id)
        }
    }

    impl AssignmentProvider for HookedStore<'_> {
        fn list_assignments(&self, class_id: &str) -> Result<Vec<TeachingAssignment>, StoreError> {
            self.inner.list_assignments(class_id)
        }
    }

    impl PeriodProvider for HookedStore<'_> {
        fn period(&self, period_id: &str) -> Result<Option<PeriodRecord>, StoreError> {
            self.inner.period(period_id)
        }
    }

    impl GradeRepository for HookedStore<'_> {
        fn grade_entries(
            &self,
            period_id: &str,
            student_ids: &[String],
        ) -> Result<HashMap<String, Vec<GradeEntry>>, StoreError> {
            self.inner.grade_entries(period_id, student_ids)
        }
    }

    impl ReportCardStore for HookedStore<'_> {
        fn begin(&self) -> Result<Box<dyn UnitOfWork + '_>, StoreError> {
            let inner = self.inner.begin()?;
            Ok(Box::new(HookedUnit {
                inner,
                hook: RefCell::new(self.hook.borrow_mut().take()),
            }))
        }
        fn lock_state(&self, student_id: &str, period_id: &str) -> Result<Option<bool>, StoreError> {
            self.inner.lock_state(student_id, period_id)
        }
        fn find_report_card(
            &self,
            student_id: &str,
            period_id: &str,
        ) -> Result<Option<StoredReportCard>, StoreError> {
            self.inner.find_report_card(student_id, period_id)
        }
        fn list_report_cards(
            &self,
            class_id: &str,
            period_id: &str,
        ) -> Result<Vec<StoredReportCard>, StoreError> {
            self.inner.list_report_cards(class_id, period_id)
        }
        fn set_locked(
            &self,
            student_id: &str,
            period_id: &str,
            locked: bool,
        ) -> Result<bool, StoreError> {
            self.inner.set_locked(student_id, period_id, locked)
        }
    }

    impl RosterProvider for HookedUnit<'_> {
        fn class_info(&self, class_id: &str) -> Result<Option<ClassInfo>, StoreError> {
            self.inner.class_info(class_id)
        }
        fn list_students(&self, class_id: &str) -> Result<Vec<StudentRef>, StoreError> {
            self.inner.list_students(class_id)
        }
        fn class_of_student(&self, student_id: &str) -> Result<Option<String>, StoreError> {
            self.inner.class_of_student(student_id)
        }
    }

    impl AssignmentProvider for HookedUnit<'_> {
        fn list_assignments(&self, class_id: &str) -> Result<Vec<TeachingAssignment>, StoreError> {
            self.inner.list_assignments(class_id)
        }
    }

    impl PeriodProvider for HookedUnit<'_> {
        fn period(&self, period_id: &str) -> Result<Option<PeriodRecord>, StoreError> {
            self.inner.period(period_id)
        }
    }

    impl GradeRepository for HookedUnit<'_> {
        fn grade_entries(
            &self,
            period_id: &str,
            student_ids: &[String],
        ) -> Result<HashMap<String, Vec<GradeEntry>>, StoreError> {
            let hook = self.hook.borrow_mut().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.grade_entries(period_id, student_ids)
        }
    }

    impl UnitOfWork for HookedUnit<'_> {
        fn lock_state(&self, student_id: &str, period_id: &str) -> Result<Option<bool>, StoreError> {
            self.inner.lock_state(student_id, period_id)
        }
        fn upsert_report_card(&mut self, card: &ReportCard) -> Result<UpsertOutcome, StoreError> {
            self.inner.upsert_report_card(card)
        }
        fn commit(self: Box<Self>) -> Result<(), StoreError> {
            let unit = *self;
            unit.inner.commit()
        }
        fn rollback(self: Box<Self>) -> Result<(), StoreError> {
            let unit = *self;
            unit.inner.rollback()
        }
    }

    #[test]
    fn concurrent_writer_waits_until_the_batch_commits() {
        let (conn, path) = file_db("reportcardd-engine-lock");
        add_class(&conn, "c1", None);
        add_student(&conn, "c1", "s1", 1);
        add_period(&conn, "p1", "1st period");
        let math = add_assignment(&conn, "c1", "math", "Sciences", None, 1, 1);
        add_grade(&conn, "s1", &math, "p1", 1, 10.0);

        // A second connection tries to record a grade while the batch is
        // reading. It must be refused, not slipped in under the batch.
        let refused: Rc<Cell<Option<bool>>> = Rc::new(Cell::new(None));
        let seen = Rc::clone(&refused);
        let other_path = path.clone();
        let late_ta = math.clone();
        let hook: Hook = Box::new(move || {
            let other = Connection::open(&other_path).expect("second connection");
            other.busy_timeout(Duration::ZERO).expect("busy timeout");
            let res = other.execute(
                "INSERT INTO grade_entries(id, student_id, teaching_assignment_id, period_id, sequence_number, value, evaluation_type)
                 VALUES('late', 's1', ?, 'p1', 2, 20.0, 'test')",
                [&late_ta],
            );
            seen.set(Some(res.is_err()));
        });
        let store = HookedStore {
            inner: SqliteStore::new(&conn),
            hook: RefCell::new(Some(hook)),
        };
        let config = EngineConfig::default();
        ReportCardEngine::new(&store, &config)
            .recompute_class_period("c1", "p1")
            .expect("batch");

        assert_eq!(refused.get(), Some(true));
        assert_eq!(stored(&conn, "s1").report.overall_average, 10.0);

        // After the commit the late grade lands and the next batch sees it.
        add_grade(&conn, "s1", &math, "p1", 2, 20.0);
        recompute(&conn).expect("second batch");
        assert_eq!(stored(&conn, "s1").report.overall_average, 15.0);

        drop(store);
        drop(conn);
        let _ = std::fs::remove_file(&path);
    }
}
