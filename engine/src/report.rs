//! Structured outcome of one table run, for persistence and display by the caller.
//!
//! Recoverable failures never propagate as errors. Workers accumulate them, together with call
//! counters, into a [Tally] per job, and the tallies are merged into the [ExecutionReport].

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    detection::scoreboard::ScoreTotal,
    loader::LoadedPack,
    model::{CanonicalKey, ConfigurationId, PackVersionId},
    sandbox::{CallFailure, FailureKind},
};

/// The call whose failure was recorded.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    Setup,
    Detector,
    Transform,
}

/// One recoverable failure of a pack call.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct RecordedError {
    pub class: ErrorClass,
    pub canonical_key: CanonicalKey,
    pub column: Option<usize>,
    pub row: Option<usize>,
    pub entry_point: String,
    pub kind: FailureKind,
    pub message: String,
}

impl RecordedError {
    pub fn new(
        class: ErrorClass,
        canonical_key: &CanonicalKey,
        entry_point: &str,
        failure: &CallFailure,
    ) -> Self {
        Self {
            class,
            canonical_key: canonical_key.clone(),
            column: None,
            row: None,
            entry_point: entry_point.to_string(),
            kind: failure.kind(),
            message: failure.to_string(),
        }
    }

    pub fn at_column(mut self, column: usize) -> Self {
        self.column = Some(column);
        self
    }

    pub fn at_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct DetectorCounters {
    pub invocations: u64,
    pub errors: u64,
    /// Columns for which the detector was not called because its pack's setup failed.
    pub skipped: u64,
}

impl DetectorCounters {
    fn merge(&mut self, other: &DetectorCounters) {
        self.invocations += other.invocations;
        self.errors += other.errors;
        self.skipped += other.skipped;
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CallCounters {
    pub invocations: u64,
    pub errors: u64,
}

/// Counters of one pack's calls.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PackCounters {
    /// Keyed by detector name.
    pub detectors: BTreeMap<String, DetectorCounters>,
    pub transform: CallCounters,
    /// Calls of any kind that failed with a sandbox violation.
    pub violations: u64,
}

impl PackCounters {
    pub fn detector(&mut self, name: &str) -> &mut DetectorCounters {
        self.detectors.entry(name.to_string()).or_default()
    }

    fn merge(&mut self, other: &PackCounters) {
        for (name, counters) in &other.detectors {
            self.detector(name).merge(counters);
        }
        self.transform.invocations += other.transform.invocations;
        self.transform.errors += other.transform.errors;
        self.violations += other.violations;
    }
}

/// Counters and recoverable errors accumulated by one unit of work.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tally {
    packs: Vec<PackCounters>,
    errors: Vec<RecordedError>,
    dropped_side_effects: u64,
}

impl Tally {
    pub fn new(num_packs: usize) -> Self {
        Self {
            packs: vec![PackCounters::default(); num_packs],
            ..Default::default()
        }
    }

    /// Counters of the pack at index `pack`.
    pub fn pack(&mut self, pack: usize) -> &mut PackCounters {
        if pack >= self.packs.len() {
            self.packs.resize_with(pack + 1, PackCounters::default);
        }
        &mut self.packs[pack]
    }

    pub fn pack_counters(&self) -> &[PackCounters] {
        &self.packs
    }

    /// Records a recoverable failure of a call to the pack at index `pack`.
    pub fn record(&mut self, pack: usize, error: RecordedError) {
        if error.kind == FailureKind::SandboxViolation {
            self.pack(pack).violations += 1;
        }
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[RecordedError] {
        &self.errors
    }

    /// Counts a fill-if-empty write naming a key that is not an output column.
    pub fn drop_side_effect(&mut self) {
        self.dropped_side_effects += 1;
    }

    pub fn dropped_side_effects(&self) -> u64 {
        self.dropped_side_effects
    }

    pub fn merge(&mut self, other: Tally) {
        for (index, counters) in other.packs.iter().enumerate() {
            self.pack(index).merge(counters);
        }
        self.errors.extend(other.errors);
        self.dropped_side_effects += other.dropped_side_effects;
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TableShape {
    pub sheet_name: String,
    pub rows: usize,
    pub columns: usize,
}

/// Outcome of detection for one physical column.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnAssignment {
    pub column: usize,
    pub header: String,
    /// The winning canonical key, or none if the column is unassigned.
    pub canonical_key: Option<CanonicalKey>,
    pub score: Option<f64>,
    pub contributors: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SetupStatus {
    /// The pack does not export `setup`.
    NotExported,
    Succeeded,
    Failed { kind: FailureKind },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PackReport {
    pub canonical_key: CanonicalKey,
    pub version_id: PackVersionId,
    pub setup: SetupStatus,
    #[serde(flatten)]
    pub counters: PackCounters,
}

/// Wall-clock duration of each phase, in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PhaseTimings {
    pub startup_ms: u64,
    pub setup_ms: u64,
    pub detection_ms: u64,
    pub transform_ms: u64,
    pub total_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub configuration_id: ConfigurationId,
    pub table: TableShape,
    pub assignments: Vec<ColumnAssignment>,
    /// Summed scores per physical column, including keys that can never be selected.
    pub scoreboard: Vec<BTreeMap<CanonicalKey, ScoreTotal>>,
    pub packs: Vec<PackReport>,
    pub dropped_side_effects: u64,
    /// Exact counts, even when `errors` is truncated.
    pub error_counts: BTreeMap<ErrorClass, u64>,
    pub errors: Vec<RecordedError>,
    pub errors_truncated: bool,
    pub timings: PhaseTimings,
}

/// Everything the run orchestration collected, before it is shaped into an [ExecutionReport].
pub struct ReportParts<'a> {
    pub configuration_id: ConfigurationId,
    pub table: TableShape,
    pub assignments: Vec<ColumnAssignment>,
    pub scoreboard: Vec<BTreeMap<CanonicalKey, ScoreTotal>>,
    pub packs: &'a [LoadedPack],
    pub setup: Vec<SetupStatus>,
    pub tally: Tally,
    pub max_recorded_errors: usize,
    pub timings: PhaseTimings,
}

impl ExecutionReport {
    pub fn assemble(parts: ReportParts<'_>) -> Self {
        let ReportParts {
            configuration_id,
            table,
            assignments,
            scoreboard,
            packs,
            setup,
            mut tally,
            max_recorded_errors,
            timings,
        } = parts;

        let mut error_counts = BTreeMap::new();
        for error in &tally.errors {
            *error_counts.entry(error.class).or_insert(0) += 1;
        }

        let mut errors = std::mem::take(&mut tally.errors);
        errors.sort();
        let errors_truncated = errors.len() > max_recorded_errors;
        errors.truncate(max_recorded_errors);

        let packs = packs
            .iter()
            .enumerate()
            .map(|(index, pack)| PackReport {
                canonical_key: pack.canonical_key.clone(),
                version_id: pack.version_id.clone(),
                setup: setup
                    .get(index)
                    .cloned()
                    .unwrap_or(SetupStatus::NotExported),
                counters: tally.packs.get(index).cloned().unwrap_or_default(),
            })
            .collect();

        Self {
            configuration_id,
            table,
            assignments,
            scoreboard,
            packs,
            dropped_side_effects: tally.dropped_side_effects,
            error_counts,
            errors,
            errors_truncated,
            timings,
        }
    }

    /// Number of recoverable errors of `class`.
    pub fn error_count(&self, class: ErrorClass) -> u64 {
        self.error_counts.get(&class).copied().unwrap_or(0)
    }

    /// The key assigned to each physical column, in column order.
    pub fn assigned_keys(&self) -> Vec<Option<&str>> {
        self.assignments
            .iter()
            .map(|assignment| assignment.canonical_key.as_ref().map(CanonicalKey::as_str))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;
    use crate::testutil::key;

    fn error(class: ErrorClass, k: &str, row: usize, failure: CallFailure) -> RecordedError {
        RecordedError::new(class, &key(k), "transform_cell", &failure).at_row(row)
    }

    #[gtest]
    fn test_merge_adds_counters() {
        let mut first = Tally::new(1);
        first.pack(0).detector("detect_a").invocations += 2;
        first.pack(0).transform.invocations += 1;
        first.drop_side_effect();

        let mut second = Tally::new(2);
        second.pack(0).detector("detect_a").errors += 1;
        second.pack(1).detector("detect_b").skipped += 3;
        second.record(
            1,
            error(ErrorClass::Detector, "b", 0, CallFailure::Violation("x".into())),
        );

        first.merge(second);

        expect_that!(
            first.pack_counters()[0].detectors["detect_a"],
            eq(DetectorCounters {
                invocations: 2,
                errors: 1,
                skipped: 0,
            })
        );
        expect_that!(first.pack_counters()[1].detectors["detect_b"].skipped, eq(3));
        expect_that!(first.pack_counters()[1].violations, eq(1));
        expect_that!(first.dropped_side_effects(), eq(1));
        expect_that!(first.errors().len(), eq(1));
    }

    #[gtest]
    fn test_assemble_sorts_and_caps_errors() -> anyhow::Result<()> {
        let mut tally = Tally::new(0);
        tally.record(0, error(ErrorClass::Transform, "b", 2, CallFailure::Timeout(250)));
        tally.record(0, error(ErrorClass::Transform, "a", 9, CallFailure::Timeout(250)));
        tally.record(0, error(ErrorClass::Transform, "a", 1, CallFailure::MemoryLimit));

        let report = ExecutionReport::assemble(ReportParts {
            configuration_id: ConfigurationId::try_from("cfg")?,
            table: TableShape {
                sheet_name: "Sheet1".to_string(),
                rows: 10,
                columns: 2,
            },
            assignments: Vec::new(),
            scoreboard: Vec::new(),
            packs: &[],
            setup: Vec::new(),
            tally,
            max_recorded_errors: 2,
            timings: PhaseTimings::default(),
        });

        expect_that!(report.error_count(ErrorClass::Transform), eq(3));
        expect_that!(report.error_count(ErrorClass::Setup), eq(0));
        expect_that!(report.errors_truncated, eq(true));
        expect_that!(
            report
                .errors
                .iter()
                .map(|e| (e.canonical_key.as_str(), e.row))
                .collect::<Vec<_>>(),
            elements_are![eq(&("a", Some(1))), eq(&("a", Some(9)))]
        );
        Ok(())
    }
}
