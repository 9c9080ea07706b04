//! Orchestration of one table run: setup, detection, assignment and transform.


use std::{collections::BTreeMap, sync::Arc, time::Instant};

use serde_json::{Value, json};

use crate::{
    cancel::CancelToken,
    config::EngineConfig,
    detection::{
        PackState,
        assign::{Candidate, Threshold, rank_candidates, resolve_unique},
        detect_column,
        scoreboard::{ScoreTotal, Scoreboard},
    },
    error::EngineError,
    loader::{LoadedPack, PackSet},
    model::CanonicalKey,
    report::{
        ColumnAssignment, ErrorClass, ExecutionReport, PhaseTimings, RecordedError, ReportParts,
        SetupStatus, TableShape, Tally,
    },
    sandbox::{EntryPoint, PackInvoker, PackSandbox, SETUP_EXPORT, pool::SandboxPool},
    table::{OutputTable, PhysicalTable},
    transform::{TransformPlan, transform_row},
};

/// The normalised table and the report of how it was produced.
#[derive(Debug)]
pub struct RunOutput {
    pub table: OutputTable,
    pub report: ExecutionReport,
}

/// Runs loaded packs against physical tables.
#[derive(Clone, Debug, Default)]
pub struct Engine {
    config: EngineConfig,
}

struct SetupOutcome {
    states: Vec<PackState>,
    status: Vec<SetupStatus>,
    tally: Tally,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Maps the columns of `table` onto the canonical columns of `pack_set` and normalises every
    /// row.
    ///
    /// `metadata` is passed to every pack call as `context`. Recoverable failures of pack calls
    /// are recorded in the report. The run is abandoned with [EngineError::Cancelled] if `cancel`
    /// is set before it completes, and no output is produced.
    pub fn run_table(
        &self,
        pack_set: &PackSet,
        table: &PhysicalTable,
        metadata: &Value,
        cancel: &CancelToken,
    ) -> Result<RunOutput, EngineError> {
        let started = Instant::now();
        table.check_rectangular()?;
        check_cancelled(cancel)?;

        let packs = Arc::new(pack_set.packs.clone());
        let shared_table = Arc::new(table.clone());
        let context = Arc::new(metadata.clone());

        let workers = self
            .config
            .worker_count(table.width().max(packs.len()));
        let pool = SandboxPool::start(
            &self.config.sandbox_settings(),
            Arc::new(pack_set.sources()),
            workers,
        )?;
        let startup_ms = elapsed_ms(started);

        let phase = Instant::now();
        let SetupOutcome {
            states,
            status: setup_status,
            mut tally,
        } = run_setup(&pool, &packs, &context, cancel)?;
        let states = Arc::new(states);
        let setup_ms = elapsed_ms(phase);
        check_cancelled(cancel)?;

        let phase = Instant::now();
        let sample_rows = self.config.detection_sample_rows;
        let tasks: Vec<_> = (0..table.width())
            .map(|column| {
                let packs = packs.clone();
                let states = states.clone();
                let table = shared_table.clone();
                let context = context.clone();
                move |sandbox: &mut PackSandbox| {
                    detect_column(sandbox, &packs, &states, &table, column, sample_rows, &context)
                }
            })
            .collect();
        let detections = pool.run_all(tasks, cancel)?;

        let mut scoreboard = Scoreboard::new(table.width());
        for (column, detection) in detections.into_iter().enumerate() {
            scoreboard.set_column(column, detection.scores);
            tally.merge(detection.tally);
        }
        let totals = scoreboard.totals();
        let assignments = assign_columns(
            &totals,
            table,
            &pack_set.selectable_keys(),
            Threshold::from_min_score(self.config.min_score),
        );
        let detection_ms = elapsed_ms(phase);
        log::info!(
            "Assigned {} of {} columns of {:?}.",
            assignments
                .iter()
                .filter(|assignment| assignment.canonical_key.is_some())
                .count(),
            table.width(),
            table.sheet_name,
        );
        check_cancelled(cancel)?;

        let phase = Instant::now();
        let assignment: Vec<Option<CanonicalKey>> = assignments
            .iter()
            .map(|assignment| assignment.canonical_key.clone())
            .collect();
        let plan = Arc::new(TransformPlan::new(
            &pack_set.columns,
            &assignment,
            table,
            self.config.append_unmapped,
        ));
        let chunk_rows = self.config.transform_chunk_rows.max(1);
        let tasks: Vec<_> = (0..table.rows.len())
            .step_by(chunk_rows)
            .map(|first_row| {
                let rows = first_row..(first_row + chunk_rows).min(table.rows.len());
                let packs = packs.clone();
                let states = states.clone();
                let table = shared_table.clone();
                let context = context.clone();
                let plan = plan.clone();
                let cancel = cancel.clone();
                move |sandbox: &mut PackSandbox| -> anyhow::Result<(Vec<Vec<Value>>, Tally)> {
                    let mut tally = Tally::new(packs.len());
                    let mut output = Vec::with_capacity(rows.len());
                    for row in rows {
                        // The pool reports the cancellation once this job returns.
                        if cancel.is_cancelled() {
                            break;
                        }
                        output.push(transform_row(
                            sandbox, &plan, &packs, &states, &table, row, &context, &mut tally,
                        )?);
                    }
                    Ok((output, tally))
                }
            })
            .collect();
        let chunks = pool.run_all(tasks, cancel)?;
        drop(pool);

        let mut rows = Vec::with_capacity(table.rows.len());
        for (chunk, chunk_tally) in chunks {
            rows.extend(chunk);
            tally.merge(chunk_tally);
        }
        let transform_ms = elapsed_ms(phase);
        log::info!(
            "Transformed {} rows of {:?}.",
            rows.len(),
            table.sheet_name
        );

        let report = ExecutionReport::assemble(ReportParts {
            configuration_id: pack_set.configuration_id.clone(),
            table: TableShape {
                sheet_name: table.sheet_name.clone(),
                rows: table.rows.len(),
                columns: table.width(),
            },
            assignments,
            scoreboard: totals,
            packs: &pack_set.packs,
            setup: setup_status,
            tally,
            max_recorded_errors: self.config.max_recorded_errors,
            timings: PhaseTimings {
                startup_ms,
                setup_ms,
                detection_ms,
                transform_ms,
                total_ms: elapsed_ms(started),
            },
        });

        Ok(RunOutput {
            table: OutputTable {
                columns: plan.columns().to_vec(),
                rows,
            },
            report,
        })
    }
}

/// Calls `setup` of every pack that exports it, exactly once.
fn run_setup(
    pool: &SandboxPool,
    packs: &Arc<Vec<LoadedPack>>,
    context: &Arc<Value>,
    cancel: &CancelToken,
) -> Result<SetupOutcome, EngineError> {
    let with_setup: Vec<usize> = packs
        .iter()
        .enumerate()
        .filter(|(_, pack)| pack.manifest().has_setup)
        .map(|(index, _)| index)
        .collect();
    let tasks: Vec<_> = with_setup
        .iter()
        .map(|&index| {
            let input = json!({
                "params": packs[index].params,
                "context": context.as_ref(),
            });
            move |sandbox: &mut PackSandbox| sandbox.invoke(index, EntryPoint::Setup, &input)
        })
        .collect();
    let outcomes = pool.run_all(tasks, cancel)?;

    let mut outcome = SetupOutcome {
        states: vec![PackState::Ready(Value::Null); packs.len()],
        status: vec![SetupStatus::NotExported; packs.len()],
        tally: Tally::new(packs.len()),
    };
    for (index, result) in with_setup.into_iter().zip(outcomes) {
        let pack = &packs[index];
        match result {
            Ok(state) => {
                outcome.states[index] = PackState::Ready(state);
                outcome.status[index] = SetupStatus::Succeeded;
            }
            Err(failure) => {
                log::warn!(
                    "Setup of pack {} failed, it contributes nothing to this table: {failure}",
                    pack.version_id,
                );
                outcome.states[index] = PackState::Failed;
                outcome.status[index] = SetupStatus::Failed {
                    kind: failure.kind(),
                };
                outcome.tally.record(
                    index,
                    RecordedError::new(
                        ErrorClass::Setup,
                        &pack.canonical_key,
                        SETUP_EXPORT,
                        &failure,
                    ),
                );
            }
        }
    }
    Ok(outcome)
}

/// Picks the unique winning key of every physical column.
fn assign_columns(
    totals: &[BTreeMap<CanonicalKey, ScoreTotal>],
    table: &PhysicalTable,
    selectable: &BTreeMap<CanonicalKey, Option<String>>,
    threshold: Threshold,
) -> Vec<ColumnAssignment> {
    let ranked: Vec<Vec<Candidate>> = totals
        .iter()
        .enumerate()
        .map(|(column, totals)| {
            rank_candidates(totals, table.header_text(column), selectable, threshold)
        })
        .collect();
    let winners = resolve_unique(&ranked);

    winners
        .into_iter()
        .enumerate()
        .map(|(column, winner)| {
            let candidate = winner.and_then(|choice| ranked[column].get(choice));
            ColumnAssignment {
                column,
                header: table.header_text(column).to_string(),
                canonical_key: candidate.map(|candidate| candidate.key.clone()),
                score: candidate.map(|candidate| candidate.score),
                contributors: candidate.map_or(0, |candidate| candidate.contributors),
            }
        })
        .collect()
}

fn check_cancelled(cancel: &CancelToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}
