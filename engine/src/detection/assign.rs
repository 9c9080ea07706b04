//! Selection of one winning canonical key per physical column.

use std::{cmp::Ordering, collections::BTreeMap, collections::VecDeque};

use serde::Serialize;

use super::scoreboard::ScoreTotal;
use crate::model::CanonicalKey;

/// Which summed scores are eligible to win a column.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Threshold {
    /// Any score strictly greater than zero.
    Positive,
    /// Any score greater than or equal to the value.
    AtLeast(f64),
}

impl Threshold {
    pub fn from_min_score(min_score: Option<f64>) -> Self {
        match min_score {
            None => Threshold::Positive,
            Some(min_score) => Threshold::AtLeast(min_score),
        }
    }

    pub fn is_eligible(self, score: f64) -> bool {
        match self {
            Threshold::Positive => score > 0.0,
            Threshold::AtLeast(min_score) => score >= min_score,
        }
    }
}

/// An eligible canonical key for one physical column.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Candidate {
    pub key: CanonicalKey,
    pub score: f64,
    pub contributors: u32,
    /// The column header equals the key's label, ignoring case.
    pub label_match: bool,
}

/// Orders candidates best first: higher score, then a header/label match, then more contributing
/// detector invocations, then the lexicographically smaller key.
fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.label_match.cmp(&a.label_match))
        .then_with(|| b.contributors.cmp(&a.contributors))
        .then_with(|| a.key.cmp(&b.key))
}

/// Case-insensitive comparison of a header with a label.
pub fn header_matches_label(header: &str, label: &str) -> bool {
    header.to_lowercase() == label.to_lowercase()
}

/// Ranks the eligible candidates of one column, best first.
///
/// `selectable` maps every key that may be assigned (keys that own a loaded pack) to its label.
/// Scores for other keys are ignored.
pub fn rank_candidates(
    totals: &BTreeMap<CanonicalKey, ScoreTotal>,
    header: &str,
    selectable: &BTreeMap<CanonicalKey, Option<String>>,
    threshold: Threshold,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = totals
        .iter()
        .filter(|(_, total)| threshold.is_eligible(total.score))
        .filter_map(|(key, total)| {
            let label = selectable.get(key)?;
            Some(Candidate {
                key: key.clone(),
                score: total.score,
                contributors: total.contributors,
                label_match: label
                    .as_deref()
                    .is_some_and(|label| header_matches_label(header, label)),
            })
        })
        .collect();
    candidates.sort_by(compare_candidates);
    candidates
}

/// Resolves ranked candidate lists (one per physical column, in column order) into a unique
/// assignment, returning the index of each column's winning candidate.
///
/// Columns propose their candidates best first. A key held by another column goes to the higher
/// score, then to the lower column index, and the losing column proposes its next candidate. The
/// outcome does not depend on the order of proposals.
pub fn resolve_unique(ranked: &[Vec<Candidate>]) -> Vec<Option<usize>> {
    let mut next_choice = vec![0usize; ranked.len()];
    let mut assigned: Vec<Option<usize>> = vec![None; ranked.len()];
    let mut holders: BTreeMap<&CanonicalKey, usize> = BTreeMap::new();
    let mut free: VecDeque<usize> = (0..ranked.len()).collect();

    while let Some(column) = free.pop_front() {
        let Some(candidate) = ranked[column].get(next_choice[column]) else {
            // Exhausted: the column stays unassigned.
            continue;
        };
        let choice = next_choice[column];
        next_choice[column] += 1;

        match holders.get(&candidate.key).copied() {
            None => {
                holders.insert(&candidate.key, column);
                assigned[column] = Some(choice);
            }
            Some(holder) => {
                let held_score = held_candidate(ranked, &assigned, holder).score;
                let takes_over = match candidate.score.total_cmp(&held_score) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => column < holder,
                };
                if takes_over {
                    holders.insert(&candidate.key, column);
                    assigned[column] = Some(choice);
                    assigned[holder] = None;
                    free.push_back(holder);
                } else {
                    free.push_back(column);
                }
            }
        }
    }

    assigned
}

fn held_candidate<'a>(
    ranked: &'a [Vec<Candidate>],
    assigned: &[Option<usize>],
    column: usize,
) -> &'a Candidate {
    // A holder always has an assigned choice.
    let choice = assigned[column].unwrap_or_default();
    &ranked[column][choice]
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use map_macro::btree_map;

    use super::*;
    use crate::testutil::key;

    fn total(score: f64, contributors: u32) -> ScoreTotal {
        ScoreTotal {
            score,
            contributors,
        }
    }

    fn candidate(k: &str, score: f64) -> Candidate {
        Candidate {
            key: key(k),
            score,
            contributors: 1,
            label_match: false,
        }
    }

    fn selectable(keys: &[(&str, Option<&str>)]) -> BTreeMap<CanonicalKey, Option<String>> {
        keys.iter()
            .map(|(k, label)| (key(k), label.map(str::to_string)))
            .collect()
    }

    #[gtest]
    fn test_threshold() {
        expect_that!(Threshold::Positive.is_eligible(0.0), eq(false));
        expect_that!(Threshold::Positive.is_eligible(1e-9), eq(true));
        expect_that!(Threshold::AtLeast(2.0).is_eligible(2.0), eq(true));
        expect_that!(Threshold::AtLeast(2.0).is_eligible(1.9), eq(false));
        expect_that!(Threshold::AtLeast(-1.0).is_eligible(-0.5), eq(true));
        expect_that!(Threshold::Positive.is_eligible(f64::NAN), eq(false));
    }

    #[gtest]
    fn test_tie_break_prefers_label_match() {
        let totals = btree_map! {
            key("full_name") => total(1.0, 5),
            key("last_comma_first") => total(1.0, 1),
        };
        let selectable = selectable(&[
            ("full_name", Some("Full Name")),
            ("last_comma_first", Some("Name")),
        ]);

        let ranked = rank_candidates(&totals, "NAME", &selectable, Threshold::Positive);

        expect_that!(
            ranked.iter().map(|c| c.key.as_str()).collect::<Vec<_>>(),
            elements_are![eq(&"last_comma_first"), eq(&"full_name")]
        );
    }

    #[gtest]
    fn test_tie_break_contributors_then_key() {
        let totals = btree_map! {
            key("b") => total(2.0, 1),
            key("c") => total(2.0, 3),
            key("a") => total(2.0, 1),
            key("d") => total(3.0, 1),
        };
        let selectable = selectable(&[("a", None), ("b", None), ("c", None), ("d", None)]);

        let ranked = rank_candidates(&totals, "x", &selectable, Threshold::Positive);

        expect_that!(
            ranked.iter().map(|c| c.key.as_str()).collect::<Vec<_>>(),
            elements_are![eq(&"d"), eq(&"c"), eq(&"a"), eq(&"b")]
        );
    }

    #[gtest]
    fn test_rank_ignores_unselectable_and_ineligible_keys() {
        let totals = btree_map! {
            key("first_name") => total(5.0, 1),
            key("full_name") => total(1.0, 1),
            key("email") => total(0.0, 1),
        };
        let selectable = selectable(&[("full_name", None), ("email", None)]);

        let ranked = rank_candidates(&totals, "x", &selectable, Threshold::Positive);

        expect_that!(ranked, elements_are![eq(&candidate("full_name", 1.0))]);
    }

    #[gtest]
    fn test_resolve_unique_higher_score_wins_and_loser_falls_back() {
        let ranked = vec![
            vec![candidate("name", 1.0), candidate("email", 0.5)],
            vec![candidate("name", 2.0)],
        ];

        expect_that!(resolve_unique(&ranked), elements_are![some(eq(&1)), some(eq(&0))]);
    }

    #[gtest]
    fn test_resolve_unique_equal_scores_lower_index_wins() {
        let ranked = vec![
            vec![candidate("email", 1.0)],
            vec![candidate("name", 1.0), candidate("email", 1.0)],
            vec![candidate("name", 1.0)],
        ];

        expect_that!(
            resolve_unique(&ranked),
            elements_are![some(eq(&0)), some(eq(&0)), none()]
        );
    }

    #[gtest]
    fn test_resolve_unique_chain_of_displacements() {
        // Column 2 takes "a" from column 0, which takes "b" from column 1, which is left with
        // nothing eligible.
        let ranked = vec![
            vec![candidate("a", 2.0), candidate("b", 5.0)],
            vec![candidate("b", 1.0)],
            vec![candidate("a", 3.0)],
        ];

        expect_that!(
            resolve_unique(&ranked),
            elements_are![some(eq(&1)), none(), some(eq(&0))]
        );
    }

    #[gtest]
    fn test_resolve_unique_is_order_independent() {
        let ranked = vec![
            vec![candidate("a", 2.0), candidate("b", 1.0), candidate("c", 1.0)],
            vec![candidate("a", 1.5), candidate("c", 3.0)],
            vec![candidate("b", 4.0), candidate("a", 5.0)],
            vec![candidate("c", 0.5), candidate("a", 0.5)],
        ];
        let expected = resolve_unique(&ranked);

        // No scores tie, so reversing the column order must give the same assignment.
        let reversed: Vec<_> = ranked.iter().rev().cloned().collect();
        let mut actual = resolve_unique(&reversed);
        actual.reverse();

        expect_that!(actual, eq(&expected));
        expect_that!(expected, elements_are![some(eq(&0)), some(eq(&1)), some(eq(&0)), none()]);
    }
}
