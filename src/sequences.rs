use crate::calc::weighted_average;
use crate::model::{GradeEntry, SequenceBreakdown, SequenceSubjectAverage};
use std::collections::BTreeMap;

/// Used when a period name is not in any lookup table.
pub const DEFAULT_SEQUENCES: [u8; 2] = [1, 2];

const BUILTIN_PERIODS: &[(&str, [u8; 2])] = &[
    ("1st period", [1, 2]),
    ("first period", [1, 2]),
    ("first term", [1, 2]),
    ("term 1", [1, 2]),
    ("trimester 1", [1, 2]),
    ("1er trimestre", [1, 2]),
    ("trimestre 1", [1, 2]),
    ("2nd period", [3, 4]),
    ("second period", [3, 4]),
    ("second term", [3, 4]),
    ("term 2", [3, 4]),
    ("trimester 2", [3, 4]),
    ("2e trimestre", [3, 4]),
    ("trimestre 2", [3, 4]),
    ("3rd period", [5, 6]),
    ("third period", [5, 6]),
    ("third term", [5, 6]),
    ("term 3", [5, 6]),
    ("trimester 3", [5, 6]),
    ("3e trimestre", [5, 6]),
    ("trimestre 3", [5, 6]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceResolution {
    Known([u8; 2]),
    /// No mapping for the name; carries the fallback set.
    Fallback([u8; 2]),
}

impl SequenceResolution {
    pub fn sequences(self) -> [u8; 2] {
        match self {
            SequenceResolution::Known(s) | SequenceResolution::Fallback(s) => s,
        }
    }
}

fn normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Maps a period name to its two sequences. Configured overrides are
/// consulted before the built-in table.
pub fn resolve_sequences(
    period_name: &str,
    overrides: &BTreeMap<String, [u8; 2]>,
) -> SequenceResolution {
    let key = normalize(period_name);
    if let Some(seqs) = overrides
        .iter()
        .find(|(name, _)| normalize(name) == key)
        .map(|(_, seqs)| *seqs)
    {
        return SequenceResolution::Known(seqs);
    }
    BUILTIN_PERIODS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, seqs)| SequenceResolution::Known(*seqs))
        .unwrap_or(SequenceResolution::Fallback(DEFAULT_SEQUENCES))
}

/// Per-sequence, per-subject weighted sub-averages for one student.
///
/// Entries whose sequence is not part of `sequences` are dropped. Only
/// sequences that hold at least one entry appear in the result.
pub fn sequence_breakdown(sequences: [u8; 2], entries: &[GradeEntry]) -> SequenceBreakdown {
    let mut grouped: BTreeMap<u8, BTreeMap<String, (u32, Vec<(f64, u32)>)>> = BTreeMap::new();
    for e in entries {
        if !sequences.contains(&e.sequence_number) || e.coefficient == 0 {
            continue;
        }
        let slot = grouped
            .entry(e.sequence_number)
            .or_default()
            .entry(e.subject_id.clone())
            .or_insert_with(|| (e.coefficient, Vec::new()));
        slot.1.push((e.value, e.coefficient));
    }

    grouped
        .into_iter()
        .map(|(seq, subjects)| {
            let averages = subjects
                .into_iter()
                .map(|(subject_id, (coefficient, values))| {
                    (
                        subject_id,
                        SequenceSubjectAverage {
                            average: weighted_average(values),
                            coefficient,
                        },
                    )
                })
                .collect();
            (seq, averages)
        })
        .collect()
}
