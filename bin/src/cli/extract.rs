use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use atomic_write_file::AtomicWriteFile;
use clap::Args;
use engine::{CancelToken, Engine, ExecutionReport, load_packs};

use crate::{csvtable, project::Project};

/// Maps the columns of a CSV table onto the project's canonical columns and writes the
/// normalised table.
#[derive(Args, Debug)]
pub struct Command {
    /// Path to the project configuration YAML file.
    #[arg(long)]
    pub config: PathBuf,

    /// Path to the input CSV. Its first record is the header.
    pub input_csv: PathBuf,

    /// Path to write the normalised CSV to.
    pub output_csv: PathBuf,

    /// Path to write the JSON execution report to.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Sheet name presented to detectors. Defaults to the input file's stem.
    #[arg(long)]
    pub sheet_name: Option<String>,

    /// JSON metadata passed to every pack call as `context`.
    #[arg(long)]
    pub context: Option<String>,
}

/// Runs the subcommand. Ctrl-C cancels the run.
pub fn run(cmd: &Command) -> Result<()> {
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())?;
    }
    extract(cmd, &cancel)
}

pub(super) fn extract(cmd: &Command, cancel: &CancelToken) -> Result<()> {
    let project = Project::load(&cmd.config)?;
    let (store, bindings, _) = project.read_packs()?;
    let engine = Engine::new(project.config.engine.clone());

    let pack_set = load_packs(
        &store,
        &project.config.configuration_id,
        &bindings,
        &engine.config().sandbox_settings(),
    )
    .with_context(|| format!("loading packs for {}", project.config.configuration_id))?;

    let sheet_name = match &cmd.sheet_name {
        Some(sheet_name) => sheet_name.clone(),
        None => cmd
            .input_csv
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let table = csvtable::read_table(&cmd.input_csv, &sheet_name)?;
    let metadata = match &cmd.context {
        Some(context) => serde_json::from_str(context).with_context(|| "parsing --context")?,
        None => serde_json::json!({"source": cmd.input_csv.to_string_lossy()}),
    };

    let output = engine
        .run_table(&pack_set, &table, &metadata, cancel)
        .with_context(|| format!("processing {:?}", cmd.input_csv))?;

    csvtable::write_table(&cmd.output_csv, &output.table)?;
    if let Some(path) = &cmd.report {
        write_report(path, &output.report)?;
    }

    let errors: u64 = output.report.error_counts.values().sum();
    if errors > 0 {
        eprintln!(
            "Completed with {errors} recoverable pack errors, see the report for details."
        );
    }
    Ok(())
}

fn write_report(path: &Path, report: &ExecutionReport) -> Result<()> {
    let mut file =
        AtomicWriteFile::open(path).with_context(|| format!("opening report {:?}", path))?;
    serde_json::to_writer_pretty(&mut file, report)
        .with_context(|| format!("serialising report {:?}", path))?;
    file.flush()?;
    file.commit()
        .with_context(|| format!("committing report {:?}", path))?;
    Ok(())
}
