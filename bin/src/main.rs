use anyhow::Result;

mod cli;
mod csvtable;
mod project;

fn main() -> Result<()> {
    cli::run()
}
