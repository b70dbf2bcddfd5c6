//! Merged-result artifacts.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ExtractionRecord;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode artifact: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Csv => "text/csv; charset=utf-8",
            Self::Json => "application/json",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(&s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown export format '{s}' (expected csv or json)"))
    }
}

/// Opaque handle to a serialized artifact: its file name in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serializes merged records and resolves references back to files.
pub trait Exporter: Send + Sync {
    fn serialize(&self, records: &[ExtractionRecord]) -> Result<ArtifactRef, ExportError>;

    /// Resolve a reference produced by [`Exporter::serialize`]. `None` for
    /// unknown or malformed references.
    fn open(&self, reference: &str) -> Option<PathBuf>;
}

/// Writes artifacts into a single directory.
pub struct ArtifactStore {
    dir: PathBuf,
    format: ExportFormat,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, format: ExportFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    fn next_name(&self) -> String {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!(
            "output_data_{secs}_{:08x}.{}",
            fastrand::u32(..),
            self.format.extension()
        )
    }
}

impl Exporter for ArtifactStore {
    fn serialize(&self, records: &[ExtractionRecord]) -> Result<ArtifactRef, ExportError> {
        std::fs::create_dir_all(&self.dir)?;
        let body = match self.format {
            ExportFormat::Csv => export_csv(records),
            ExportFormat::Json => export_json(records)?,
        };
        let name = self.next_name();
        std::fs::write(self.dir.join(&name), body)?;
        tracing::info!(artifact = %name, rows = records.len(), "artifact written");
        Ok(ArtifactRef(name))
    }

    fn open(&self, reference: &str) -> Option<PathBuf> {
        if !is_valid_reference(reference) {
            return None;
        }
        let path = self.dir.join(reference);
        path.is_file().then_some(path)
    }
}

/// File-name characters only: no separators, no leading dot.
fn is_valid_reference(reference: &str) -> bool {
    !reference.is_empty()
        && !reference.starts_with('.')
        && reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn csv_escape(s: &str) -> String {
    if s.contains('"') || s.contains(',') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => csv_escape(s),
        Some(other) => csv_escape(&other.to_string()),
    }
}

/// Columns are every field name in first-seen order, then the provenance tags.
fn export_csv(records: &[ExtractionRecord]) -> String {
    let mut columns: Vec<&str> = Vec::new();
    for record in records {
        for key in record.fields.keys() {
            if key != "page_number" && key != "document_name" && !columns.contains(&key.as_str())
            {
                columns.push(key.as_str());
            }
        }
    }

    let mut out = String::new();
    let header: Vec<String> = columns
        .iter()
        .map(|c| csv_escape(c))
        .chain(["page_number".to_string(), "document_name".to_string()])
        .collect();
    out.push_str(&header.join(","));
    out.push('\n');

    for record in records {
        let mut row: Vec<String> = columns
            .iter()
            .map(|c| cell(record.fields.get(*c)))
            .collect();
        row.push(record.page_number.to_string());
        row.push(csv_escape(&record.document_name));
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn export_json(records: &[ExtractionRecord]) -> Result<String, serde_json::Error> {
    let rows: Vec<Value> = records
        .iter()
        .map(|r| Value::Object(r.to_json()))
        .collect();
    serde_json::to_string_pretty(&rows)
}
