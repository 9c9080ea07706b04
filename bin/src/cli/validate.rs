use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use engine::{clock::SystemClock, registry, store::PackStore};

use crate::project::{self, Project, ValidationRecord};

/// Validates every pack bound in a project configuration, and writes a validation record next
/// to each pack file.
#[derive(Args, Debug)]
pub struct Command {
    /// Path to the project configuration YAML file.
    #[arg(long)]
    pub config: PathBuf,
}

/// Runs the subcommand.
pub fn run(cmd: &Command) -> Result<()> {
    let project = Project::load(&cmd.config)?;
    let settings = project.config.engine.sandbox_settings();
    let (mut store, _, stored) = project.read_packs()?;

    let mut failed = 0;
    for pack in &stored {
        let outcome = registry::validate_and_record(&mut store, &pack.id, &settings, &SystemClock)?;
        let version = store.get(&pack.id)?;
        project::write_record(
            &pack.path,
            &ValidationRecord {
                pack_version_id: version.id.clone(),
                digest: version.digest.clone(),
                validated_at: outcome.validated_at,
                errors: outcome.errors.clone(),
            },
        )?;

        if outcome.is_valid() {
            eprintln!("{}: valid.", pack.path.display());
        } else {
            failed += 1;
            eprintln!("{}: invalid.", pack.path.display());
            for error in &outcome.errors {
                eprintln!("  {error}");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} packs failed validation", stored.len());
    }
    Ok(())
}
