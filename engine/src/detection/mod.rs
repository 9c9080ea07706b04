//! Scoring of physical columns against canonical keys.

pub mod assign;
pub mod scoreboard;

use anyhow::Result;
use serde_json::{Value, json};

use crate::{
    loader::LoadedPack,
    model::{CanonicalKey, SELF_KEY},
    report::{ErrorClass, RecordedError, Tally},
    sandbox::{CallFailure, EntryPoint, PackInvoker},
    table::PhysicalTable,
};
use scoreboard::ColumnScores;

/// The Execution State of one pack for the duration of one table.
#[derive(Clone, Debug, PartialEq)]
pub enum PackState {
    /// The value returned by `setup`, or `null` for packs without one.
    Ready(Value),
    /// `setup` failed: the pack contributes nothing for the rest of the table.
    Failed,
}

impl PackState {
    pub fn state(&self) -> Option<&Value> {
        match self {
            PackState::Ready(state) => Some(state),
            PackState::Failed => None,
        }
    }
}

/// Scores and recoverable errors from running every detector against one physical column.
#[derive(Debug, Default)]
pub struct ColumnDetection {
    pub scores: ColumnScores,
    pub tally: Tally,
}

/// Runs every detector of every pack against physical column `column`.
///
/// A failed call contributes nothing and is recorded; other detectors still run. Only failures of
/// the execution environment are returned as errors.
pub fn detect_column<I: PackInvoker + ?Sized>(
    invoker: &mut I,
    packs: &[LoadedPack],
    states: &[PackState],
    table: &PhysicalTable,
    column: usize,
    sample_rows: Option<usize>,
    context: &Value,
) -> Result<ColumnDetection> {
    let mut detection = ColumnDetection {
        scores: ColumnScores::new(),
        tally: Tally::new(packs.len()),
    };

    let values = table.column_values(column, sample_rows);

    for (index, pack) in packs.iter().enumerate() {
        let manifest = pack.manifest();
        let Some(state) = states.get(index).and_then(PackState::state) else {
            for name in &manifest.detectors {
                detection.tally.pack(index).detector(name).skipped += 1;
            }
            continue;
        };

        let input = detector_input(table, column, &values, state, &pack.params, context);

        for (detector, name) in manifest.detectors.iter().enumerate() {
            detection.tally.pack(index).detector(name).invocations += 1;

            let outcome = invoker
                .invoke(index, EntryPoint::Detector(detector), &input)?
                .and_then(|value| {
                    parse_detector_return(value, &pack.canonical_key)
                        .map_err(CallFailure::InvalidReturn)
                });
            match outcome {
                Ok(deltas) => detection.scores.apply_invocation(&deltas),
                Err(failure) => {
                    log::debug!(
                        "Detector {name} of {} failed on column {column}: {failure}",
                        pack.canonical_key,
                    );
                    detection.tally.pack(index).detector(name).errors += 1;
                    detection.tally.record(
                        index,
                        RecordedError::new(
                            ErrorClass::Detector,
                            &pack.canonical_key,
                            name,
                            &failure,
                        )
                        .at_column(column),
                    );
                }
            }
        }
    }

    Ok(detection)
}

/// The single argument passed to a `detect_*` function.
pub(crate) fn detector_input(
    table: &PhysicalTable,
    column: usize,
    values: &[&str],
    state: &Value,
    params: &Value,
    context: &Value,
) -> Value {
    json!({
        "header": table.header_text(column),
        "values": values,
        "sheetName": table.sheet_name,
        "columnIndex": column,
        "bounds": table.bounds,
        "state": state,
        "params": params,
        "context": context,
    })
}

/// Checks the value returned by a detector and rewrites `"self"` to `own_key`.
///
/// `null` is an empty mapping. Anything else must be an object whose keys are canonical keys and
/// whose values are finite numbers; otherwise the whole return is rejected.
pub fn parse_detector_return(
    value: Value,
    own_key: &CanonicalKey,
) -> std::result::Result<Vec<(CanonicalKey, f64)>, String> {
    let map = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Object(map) => map,
        other => {
            return Err(format!(
                "expected an object of score deltas, got {}",
                value_kind(&other)
            ));
        }
    };

    map.into_iter()
        .map(|(key, delta)| {
            let key = resolve_key(&key, own_key)?;
            match delta.as_f64() {
                Some(delta) if delta.is_finite() => Ok((key, delta)),
                _ => Err(format!(
                    "delta for {key} must be a finite number, got {}",
                    value_kind(&delta)
                )),
            }
        })
        .collect()
}

/// Resolves a key of a returned mapping, substituting `own_key` for `"self"`.
pub(crate) fn resolve_key(
    key: &str,
    own_key: &CanonicalKey,
) -> std::result::Result<CanonicalKey, String> {
    if key == SELF_KEY {
        return Ok(own_key.clone());
    }
    CanonicalKey::try_from(key).map_err(|err| err.to_string())
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
