//! Per-row normalisation and the fill-if-empty merge of cross-column writes.

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{Value, json};

use crate::{
    detection::{PackState, resolve_key, value_kind},
    loader::{CanonicalColumn, LoadedPack},
    model::{CanonicalKey, SELF_KEY},
    report::{ErrorClass, RecordedError, Tally},
    sandbox::{CallFailure, EntryPoint, PackInvoker, TRANSFORM_EXPORT},
    table::{OutputColumn, PhysicalTable, is_empty_cell},
};

/// What produces the output of one physical column.
#[derive(Clone, Debug, Eq, PartialEq)]
enum ColumnSource {
    /// Assigned to the canonical column at output index `output`, owned by the pack at index
    /// `pack`.
    Mapped { output: usize, pack: Option<usize> },
    /// Unassigned. Its raw value is copied to `output` when unmapped columns are appended.
    Unassigned { output: Option<usize> },
}

/// The output layout of one table and how each physical column feeds it.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformPlan {
    columns: Vec<OutputColumn>,
    key_index: BTreeMap<CanonicalKey, usize>,
    /// In ascending physical column order, which is also the merge order.
    sources: Vec<ColumnSource>,
}

impl TransformPlan {
    /// Lays out one output column per canonical column, in the order given, followed by the
    /// unassigned physical columns if `append_unmapped` is set.
    ///
    /// `assignment` holds the winning key of each physical column. Keys without a canonical
    /// column are treated as unassigned.
    pub fn new(
        canonical: &[CanonicalColumn],
        assignment: &[Option<CanonicalKey>],
        table: &PhysicalTable,
        append_unmapped: bool,
    ) -> Self {
        let mut columns: Vec<OutputColumn> = canonical
            .iter()
            .map(|column| OutputColumn::Canonical {
                key: column.canonical_key.clone(),
                label: column.label.clone(),
            })
            .collect();
        let key_index: BTreeMap<CanonicalKey, usize> = canonical
            .iter()
            .enumerate()
            .map(|(index, column)| (column.canonical_key.clone(), index))
            .collect();

        let mut sources = Vec::with_capacity(assignment.len());
        for (physical, key) in assignment.iter().enumerate() {
            let mapped = key
                .as_ref()
                .and_then(|key| key_index.get(key).map(|&output| (output, canonical[output].pack)));
            let source = match mapped {
                Some((output, pack)) => ColumnSource::Mapped { output, pack },
                None if append_unmapped => {
                    columns.push(OutputColumn::Unmapped {
                        column: physical,
                        header: table.header_text(physical).to_string(),
                    });
                    ColumnSource::Unassigned {
                        output: Some(columns.len() - 1),
                    }
                }
                None => ColumnSource::Unassigned { output: None },
            };
            sources.push(source);
        }

        Self {
            columns,
            key_index,
            sources,
        }
    }

    pub fn columns(&self) -> &[OutputColumn] {
        &self.columns
    }

    pub fn output_index(&self, key: &CanonicalKey) -> Option<usize> {
        self.key_index.get(key).copied()
    }
}

/// Writes proposed by one successful `transform_cell` call.
#[derive(Clone, Debug, PartialEq)]
pub struct CellWrites {
    /// Replacement for the pack's own cell. `None` leaves the raw value.
    pub own: Option<Value>,
    /// Fill-if-empty writes to other canonical columns, in key order.
    pub others: Vec<(CanonicalKey, Value)>,
}

/// Checks the value returned by `transform_cell` and splits off the pack's own cell.
///
/// `"self"` and the pack's own key both address the own cell; `"self"` takes precedence.
pub fn parse_transform_return(
    value: Value,
    own_key: &CanonicalKey,
) -> std::result::Result<CellWrites, String> {
    let Value::Object(mut map) = value else {
        return Err(format!(
            "expected an object of cell values, got {}",
            value_kind(&value)
        ));
    };

    let explicit_own = map.remove(own_key.as_str());
    let own = map.remove(SELF_KEY).or(explicit_own);
    let others = map
        .into_iter()
        .map(|(key, value)| Ok((resolve_key(&key, own_key)?, value)))
        .collect::<std::result::Result<Vec<_>, String>>()?;

    Ok(CellWrites { own, others })
}

/// The single argument passed to `transform_cell`.
pub(crate) fn cell_input(
    table: &PhysicalTable,
    row: usize,
    column: usize,
    state: &Value,
    params: &Value,
    context: &Value,
) -> Value {
    json!({
        "value": table.cell(row, column),
        "rowIndex": row,
        "columnIndex": column,
        "header": table.header_text(column),
        "state": state,
        "params": params,
        "context": context,
    })
}

/// Produces one output row.
///
/// Physical columns are visited in ascending order. A mapped column's pack overwrites its own cell
/// and proposes writes to other canonical cells, each applied only if that cell is still empty.
/// A failed call writes the raw value and applies none of its proposals.
#[allow(clippy::too_many_arguments)]
pub fn transform_row<I: PackInvoker + ?Sized>(
    invoker: &mut I,
    plan: &TransformPlan,
    packs: &[LoadedPack],
    states: &[PackState],
    table: &PhysicalTable,
    row: usize,
    context: &Value,
    tally: &mut Tally,
) -> Result<Vec<Value>> {
    let mut output = vec![Value::Null; plan.columns.len()];

    for (physical, source) in plan.sources.iter().enumerate() {
        let raw = table.cell(row, physical);
        let (output_index, pack_index) = match *source {
            ColumnSource::Unassigned { output: Some(output_index) } => {
                output[output_index] = Value::String(raw.to_string());
                continue;
            }
            ColumnSource::Unassigned { output: None } => continue,
            ColumnSource::Mapped { output, pack } => (output, pack),
        };

        let runnable = pack_index.and_then(|index| {
            let pack = packs.get(index)?;
            let state = states.get(index)?.state()?;
            pack.manifest().has_transform.then_some((index, pack, state))
        });
        let Some((index, pack, state)) = runnable else {
            output[output_index] = Value::String(raw.to_string());
            continue;
        };

        let input = cell_input(table, row, physical, state, &pack.params, context);
        tally.pack(index).transform.invocations += 1;
        let outcome = invoker
            .invoke(index, EntryPoint::Transform, &input)?
            .and_then(|value| {
                parse_transform_return(value, &pack.canonical_key).map_err(CallFailure::InvalidReturn)
            });

        match outcome {
            Ok(writes) => {
                output[output_index] = writes
                    .own
                    .unwrap_or_else(|| Value::String(raw.to_string()));
                for (key, value) in writes.others {
                    match plan.output_index(&key) {
                        Some(target) => {
                            if is_empty_cell(&output[target]) {
                                output[target] = value;
                            }
                        }
                        None => tally.drop_side_effect(),
                    }
                }
            }
            Err(failure) => {
                log::debug!(
                    "Transform of {} failed on row {row} column {physical}: {failure}",
                    pack.canonical_key,
                );
                output[output_index] = Value::String(raw.to_string());
                tally.pack(index).transform.errors += 1;
                tally.record(
                    index,
                    RecordedError::new(
                        ErrorClass::Transform,
                        &pack.canonical_key,
                        TRANSFORM_EXPORT,
                        &failure,
                    )
                    .at_column(physical)
                    .at_row(row),
                );
            }
        }
    }

    Ok(output)
}
