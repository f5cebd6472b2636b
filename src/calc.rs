use crate::model::{ClassProfile, GradeEntry};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

// 100 * 2.675 lands on 267.49999999999997; nudge it back over the half.
const ROUNDING_EPSILON: f64 = 1e-9;

/// Half-up rounding to 2 decimals: `Int(100*x + 0.5) / 100`.
///
/// Every average is rounded exactly once, where it is first computed.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5 + ROUNDING_EPSILON).floor() / 100.0
}

/// `round(sum(value * coefficient) / sum(coefficient), 2)`.
///
/// Total: an empty input, or one where every coefficient is zero, yields 0.0.
pub fn weighted_average<I>(values: I) -> f64
where
    I: IntoIterator<Item = (f64, u32)>,
{
    let mut sum = 0.0_f64;
    let mut denom: u64 = 0;
    for (value, coefficient) in values {
        if coefficient == 0 {
            continue;
        }
        sum += value * f64::from(coefficient);
        denom += u64::from(coefficient);
    }
    if denom == 0 {
        return 0.0;
    }
    round_off_2_decimals(sum / denom as f64)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sort_descending(values: &mut [f64]) {
    values.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
}

/// Class-wide figures for one teaching assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectStats {
    pub student_averages: BTreeMap<String, f64>,
    pub class_average: f64,
    pub min: f64,
    pub max: f64,
    /// Student averages, highest first. Ties are kept.
    pub distribution: Vec<f64>,
}

impl SubjectStats {
    /// Positional rank of `average` in the distribution. The first occurrence
    /// wins, so equal averages share the better rank.
    pub fn rank_of(&self, average: f64) -> Option<u32> {
        self.distribution
            .iter()
            .position(|v| *v == average)
            .map(|idx| idx as u32 + 1)
    }

    pub fn student_average(&self, student_id: &str) -> Option<f64> {
        self.student_averages.get(student_id).copied()
    }

    /// The student's subject average and subject rank.
    pub fn student_standing(&self, student_id: &str) -> Option<(f64, u32)> {
        let average = self.student_average(student_id)?;
        let rank = self.rank_of(average)?;
        Some((average, rank))
    }
}

/// Per-assignment statistics over every entry of the class and period.
///
/// A student's subject average is the plain mean of their values: all
/// entries under one assignment share its coefficient.
pub fn subject_statistics<'a, I>(entries: I) -> BTreeMap<String, SubjectStats>
where
    I: IntoIterator<Item = &'a GradeEntry>,
{
    let mut grouped: BTreeMap<String, BTreeMap<String, Vec<f64>>> = BTreeMap::new();
    for e in entries {
        if e.coefficient == 0 {
            continue;
        }
        grouped
            .entry(e.teaching_assignment_id.clone())
            .or_default()
            .entry(e.student_id.clone())
            .or_default()
            .push(e.value);
    }

    let mut out = BTreeMap::new();
    for (ta_id, by_student) in grouped {
        let student_averages: BTreeMap<String, f64> = by_student
            .into_iter()
            .map(|(sid, values)| (sid, round_off_2_decimals(mean(&values))))
            .collect();
        let mut distribution: Vec<f64> = student_averages.values().copied().collect();
        sort_descending(&mut distribution);

        let class_average = round_off_2_decimals(mean(&distribution));
        let max = distribution.first().copied().unwrap_or(0.0);
        let min = distribution.last().copied().unwrap_or(0.0);
        out.insert(
            ta_id,
            SubjectStats {
                student_averages,
                class_average,
                min,
                max,
                distribution,
            },
        );
    }
    out
}

/// Class-wide profile over the overall averages of students with data.
pub fn class_profile(averages: &[f64], pass_mark: f64) -> ClassProfile {
    if averages.is_empty() {
        return ClassProfile::default();
    }
    let n = averages.len() as f64;
    let raw_mean = mean(averages);
    let top = averages.iter().copied().fold(f64::MIN, f64::max);
    let bottom = averages.iter().copied().fold(f64::MAX, f64::min);
    let passed = averages.iter().filter(|a| **a >= pass_mark).count() as f64;
    let variance = averages
        .iter()
        .map(|a| (a - raw_mean).powi(2))
        .sum::<f64>()
        / n;

    ClassProfile {
        student_count: averages.len(),
        mean: round_off_2_decimals(raw_mean),
        top_average: top,
        bottom_average: bottom,
        pass_rate_pct: round_off_2_decimals(100.0 * passed / n),
        std_dev: round_off_2_decimals(variance.sqrt()),
    }
}

/// 1-based positional ranks, highest average first.
///
/// Equal averages still get distinct consecutive ranks; the lower student id
/// takes the better one.
pub fn rank_students(averages: &[(String, f64)]) -> HashMap<String, u32> {
    let mut ordered: Vec<&(String, f64)> = averages.iter().collect();
    ordered.sort_by(|(a_id, a), (b_id, b)| {
        b.partial_cmp(a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a_id.cmp(b_id))
    });
    ordered
        .into_iter()
        .enumerate()
        .map(|(idx, (id, _))| (id.clone(), idx as u32 + 1))
        .collect()
}

pub const COMMENT_EXCELLENT: &str = "Excellent";
pub const COMMENT_SATISFACTORY: &str = "Satisfactory";
pub const COMMENT_BORDERLINE: &str = "Borderline pass";
pub const COMMENT_NEEDS_IMPROVEMENT: &str = "Needs improvement";

/// Inclusive lower thresholds: 16, 12, 10.
pub fn comment_for(average: f64) -> &'static str {
    if average >= 16.0 {
        COMMENT_EXCELLENT
    } else if average >= 12.0 {
        COMMENT_SATISFACTORY
    } else if average >= 10.0 {
        COMMENT_BORDERLINE
    } else {
        COMMENT_NEEDS_IMPROVEMENT
    }
}
