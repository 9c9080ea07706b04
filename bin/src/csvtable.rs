use std::{io::Write, path::Path};

use anyhow::{Context, Result};
use atomic_write_file::AtomicWriteFile;
use engine::{OutputTable, PhysicalTable};

/// Reads a CSV file whose first record is the header. Short records are padded with empty
/// cells.
pub fn read_table(path: &Path, sheet_name: &str) -> Result<PhysicalTable> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening input CSV {:?}", path))?;

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("reading record from {:?}", path))?;
        records.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }

    let mut records = records.into_iter();
    let header = records.next().unwrap_or_default();
    Ok(PhysicalTable::new(sheet_name, header, records))
}

/// Writes the table as CSV with one header record of column names.
pub fn write_table(path: &Path, table: &OutputTable) -> Result<()> {
    let mut file = AtomicWriteFile::open(path)
        .with_context(|| format!("opening output CSV {:?}", path))?;
    let mut csv_writer = csv::WriterBuilder::new().from_writer(&mut file);

    csv_writer
        .write_record(table.headers())
        .with_context(|| "writing header")?;
    for row in &table.rows {
        csv_writer
            .write_record(OutputTable::render_row(row))
            .with_context(|| "writing record")?;
    }

    // Check for error rather than implicitly flushing and ignoring.
    csv_writer.flush().with_context(|| "flushing to CSV")?;
    drop(csv_writer);
    file.flush()?;
    file.commit()
        .with_context(|| format!("committing output CSV {:?}", path))?;
    Ok(())
}
