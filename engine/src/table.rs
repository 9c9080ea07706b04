use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::{error::EngineError, model::CanonicalKey};

/// Position of a physical table within its source sheet, passed to detectors as `bounds`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableBounds {
    pub first_row: usize,
    pub first_column: usize,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Row(pub Vec<String>);

impl Deref for Row {
    type Target = Vec<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<C, S> From<C> for Row
where
    C: IntoIterator<Item = S>,
    S: Into<String>,
{
    fn from(value: C) -> Self {
        Row(value.into_iter().map(Into::into).collect())
    }
}

/// A table as supplied by document ingestion: a header row plus data rows of raw cell text.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PhysicalTable {
    pub sheet_name: String,
    pub header: Row,
    pub rows: Vec<Row>,
    pub bounds: TableBounds,
}

impl PhysicalTable {
    /// Creates a table, padding ragged rows with empty cells to the widest row or header.
    pub fn new<H, R, I>(sheet_name: &str, header: H, rows: I) -> Self
    where
        H: Into<Row>,
        R: Into<Row>,
        I: IntoIterator<Item = R>,
    {
        let mut header: Row = header.into();
        let mut rows: Vec<Row> = rows.into_iter().map(Into::into).collect();

        let width = rows
            .iter()
            .map(|row| row.len())
            .chain(std::iter::once(header.len()))
            .max()
            .unwrap_or(0);
        header.0.resize(width, String::new());
        for row in &mut rows {
            row.0.resize(width, String::new());
        }

        Self {
            sheet_name: sheet_name.to_string(),
            header,
            rows,
            bounds: TableBounds::default(),
        }
    }

    /// Number of physical columns.
    pub fn width(&self) -> usize {
        self.header.len()
    }

    /// Checks that every row has exactly one cell per header column.
    pub fn check_rectangular(&self) -> Result<(), EngineError> {
        let width = self.width();
        match self.rows.iter().position(|row| row.len() != width) {
            Some(row_index) => Err(EngineError::InvalidTable(format!(
                "row {row_index} has {} cells but the header has {width}",
                self.rows[row_index].len(),
            ))),
            None => Ok(()),
        }
    }

    pub fn header_text(&self, column: usize) -> &str {
        self.header.get(column).map(String::as_str).unwrap_or("")
    }

    pub fn cell(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|row| row.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Values of one column, limited to the first `limit` rows if given.
    pub fn column_values(&self, column: usize, limit: Option<usize>) -> Vec<&str> {
        let limit = limit.unwrap_or(self.rows.len());
        self.rows
            .iter()
            .take(limit)
            .map(|row| row.get(column).map(String::as_str).unwrap_or(""))
            .collect()
    }
}

/// Output column of a normalised table.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputColumn {
    /// A canonical column of the configuration.
    Canonical {
        key: CanonicalKey,
        label: Option<String>,
    },
    /// An unassigned physical column appended verbatim.
    Unmapped { column: usize, header: String },
}

impl OutputColumn {
    /// Header text for rendering: the canonical key, or the original physical header.
    pub fn header(&self) -> &str {
        match self {
            OutputColumn::Canonical { key, .. } => key.as_str(),
            OutputColumn::Unmapped { header, .. } => header,
        }
    }
}

/// A normalised table: one row per input row, one cell per [OutputColumn].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OutputTable {
    pub columns: Vec<OutputColumn>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl OutputTable {
    pub fn headers(&self) -> Vec<&str> {
        self.columns.iter().map(OutputColumn::header).collect()
    }

    /// Renders one row as text cells: `null` becomes empty, strings are verbatim and other values
    /// are JSON text.
    pub fn render_row(row: &[serde_json::Value]) -> Vec<String> {
        row.iter().map(render_cell).collect()
    }
}

pub fn render_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// True for the values that fill-if-empty treats as an unset cell.
pub fn is_empty_cell(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        _ => false,
    }
}
