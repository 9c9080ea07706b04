//! Per-run score accumulation.
//!
//! The [Scoreboard] is an arena of [ColumnScores], one per physical column. Each column's scores
//! are built by exactly one worker and moved into the arena when that column's detection is
//! complete, so no locking is needed.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::CanonicalKey;

#[derive(Clone, Debug, Default, PartialEq)]
struct KeyScore {
    deltas: Vec<f64>,
    contributors: u32,
}

/// Deltas received by one physical column, per canonical key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColumnScores {
    keys: BTreeMap<CanonicalKey, KeyScore>,
}

/// Summed score of one canonical key for one physical column.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ScoreTotal {
    pub score: f64,
    /// Number of detector invocations that contributed a delta.
    pub contributors: u32,
}

impl ColumnScores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the deltas returned by one successful detector invocation. A key that appears more
    /// than once counts as a single contribution.
    pub fn apply_invocation(&mut self, deltas: &[(CanonicalKey, f64)]) {
        let mut contributed: Vec<&CanonicalKey> = Vec::with_capacity(deltas.len());
        for (key, delta) in deltas {
            let entry = self.keys.entry(key.clone()).or_default();
            entry.deltas.push(*delta);
            if !contributed.contains(&key) {
                entry.contributors += 1;
                contributed.push(key);
            }
        }
    }

    /// Totals per key. Each sum adds its deltas in ascending order, so the result does not depend
    /// on the order in which packs or detectors ran.
    pub fn totals(&self) -> BTreeMap<CanonicalKey, ScoreTotal> {
        self.keys
            .iter()
            .map(|(key, score)| {
                let mut deltas = score.deltas.clone();
                deltas.sort_by(f64::total_cmp);
                (
                    key.clone(),
                    ScoreTotal {
                        score: deltas.iter().sum(),
                        contributors: score.contributors,
                    },
                )
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Scores of every physical column of one table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scoreboard {
    columns: Vec<ColumnScores>,
}

impl Scoreboard {
    /// Creates a scoreboard with empty scores for `width` physical columns.
    pub fn new(width: usize) -> Self {
        Self {
            columns: vec![ColumnScores::default(); width],
        }
    }

    /// Stores the finished scores of one column.
    pub fn set_column(&mut self, column: usize, scores: ColumnScores) {
        if let Some(slot) = self.columns.get_mut(column) {
            *slot = scores;
        }
    }

    pub fn column(&self, column: usize) -> Option<&ColumnScores> {
        self.columns.get(column)
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Totals for every column, in column order.
    pub fn totals(&self) -> Vec<BTreeMap<CanonicalKey, ScoreTotal>> {
        self.columns.iter().map(ColumnScores::totals).collect()
    }
}
