use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: String,
    pub school_year: Option<String>,
    pub homeroom_teacher: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub id: String,
    pub display_name: String,
}

/// One (subject, class, teacher, coefficient) pairing. Every grade entry is
/// recorded against exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeachingAssignment {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub subject_group: String,
    pub teacher_name: Option<String>,
    pub coefficient: u32,
}

impl TeachingAssignment {
    /// Zero-coefficient assignments are "not taught this period".
    pub fn is_taught(&self) -> bool {
        self.coefficient > 0
    }
}

/// A grade entry joined with the assignment it was recorded against.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeEntry {
    pub id: String,
    pub student_id: String,
    pub teaching_assignment_id: String,
    pub period_id: String,
    pub sequence_number: u8,
    pub value: f64,
    pub evaluation_type: String,
    pub evaluation_date: Option<String>,
    pub remark: Option<String>,
    pub subject_id: String,
    pub coefficient: u32,
    pub teacher_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodRecord {
    pub id: String,
    pub name: String,
    pub school_year: Option<String>,
}

/// Everything a batch needs to know about the grading period. Resolved once
/// per call and threaded through explicitly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodContext {
    pub period_id: String,
    pub name: String,
    pub school_year: Option<String>,
    pub sequences: [u8; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub teaching_assignment_id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub group: String,
    pub coefficient: u32,
    pub subject_average: f64,
    pub weighted_total: f64,
    pub class_subject_average: f64,
    pub class_subject_min: f64,
    pub class_subject_max: f64,
    pub subject_rank: u32,
    pub teacher_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupTotal {
    pub group: String,
    pub total_coefficient: u32,
    pub total_weighted: f64,
    pub average: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceSubjectAverage {
    pub average: f64,
    pub coefficient: u32,
}

/// sequence number -> subject id -> sub-average
pub type SequenceBreakdown = BTreeMap<u8, BTreeMap<String, SequenceSubjectAverage>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassProfile {
    pub student_count: usize,
    pub mean: f64,
    pub top_average: f64,
    pub bottom_average: f64,
    pub pass_rate_pct: f64,
    pub std_dev: f64,
}

/// The computed content of a report card. This is what gets digested and
/// stored as the row payload, so field order and map ordering must stay
/// deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub student_id: String,
    pub student_name: String,
    pub class_id: String,
    pub period_id: String,
    pub period_name: String,
    pub school_year: Option<String>,
    pub homeroom_teacher: String,
    pub overall_average: f64,
    pub rank: u32,
    pub class_size: u32,
    pub subjects: Vec<SubjectLine>,
    pub group_totals: Vec<GroupTotal>,
    pub total_coefficient: u32,
    pub total_weighted: f64,
    pub sequence_breakdown: SequenceBreakdown,
    pub class_profile: ClassProfile,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReportCard {
    pub id: String,
    pub is_locked: bool,
    pub generated_at: String,
    pub content_sha256: String,
    pub report: ReportCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StudentState {
    Pending,
    SkippedLocked,
    SkippedNoData,
    Computed,
    Persisted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentOutcome {
    pub student_id: String,
    pub state: StudentState,
    /// Set when the stored row already held identical content.
    pub unchanged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub class_id: String,
    pub period_id: String,
    pub computed: usize,
    pub unchanged: usize,
    pub skipped_locked: usize,
    pub skipped_no_data: usize,
    pub warnings: Vec<String>,
    pub outcomes: Vec<StudentOutcome>,
}
