// Embedding import and export files.
//
// JSON carries everything, vectors included, keyed by entry name. CSV only
// has `name,text` columns, so imported rows must be embedded again.

use super::embeddings::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Imported entry text is capped like memories the model writes.
pub const MAX_IMPORT_TEXT_CHARS: usize = 4000;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("columns must be ['name', 'text']")]
    MissingColumns,
    #[error("unsupported file type {0}, use .json or .csv")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    Json,
    Csv,
}

impl TransferFormat {
    pub fn from_filename(filename: &str) -> Result<Self, TransferError> {
        let lower = filename.to_lowercase();
        if lower.ends_with(".json") {
            Ok(Self::Json)
        } else if lower.ends_with(".csv") {
            Ok(Self::Csv)
        } else {
            Err(TransferError::Unsupported(filename.to_string()))
        }
    }

    pub fn export_filename(self) -> &'static str {
        match self {
            Self::Json => "embeddings_export.json",
            Self::Csv => "embeddings_export.csv",
        }
    }
}

/// A JSON entry; the name comes from its key.
#[derive(Debug, Serialize, Deserialize)]
struct JsonEntry {
    text: String,
    #[serde(alias = "embedding")]
    vector: Vec<f32>,
    #[serde(default)]
    ai_created: bool,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    modified_at: i64,
}

/// A CSV row waiting to be embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRow {
    pub name: String,
    pub text: String,
}

fn cap_text(text: String) -> String {
    if text.chars().count() <= MAX_IMPORT_TEXT_CHARS {
        text
    } else {
        text.chars().take(MAX_IMPORT_TEXT_CHARS).collect()
    }
}

pub fn export_json(entries: &[Embedding]) -> Result<Vec<u8>, TransferError> {
    let dump: BTreeMap<&str, JsonEntry> = entries
        .iter()
        .map(|e| {
            let entry = JsonEntry {
                text: e.text.clone(),
                vector: e.vector.clone(),
                ai_created: e.ai_created,
                created_at: e.created_at,
                modified_at: e.modified_at,
            };
            (e.name.as_str(), entry)
        })
        .collect();
    Ok(serde_json::to_vec(&dump)?)
}

pub fn parse_json(bytes: &[u8]) -> Result<Vec<Embedding>, TransferError> {
    let dump: BTreeMap<String, JsonEntry> = serde_json::from_slice(bytes)?;
    let now = chrono::Utc::now().timestamp();
    Ok(dump
        .into_iter()
        .map(|(name, entry)| Embedding {
            name,
            text: cap_text(entry.text),
            vector: entry.vector,
            ai_created: entry.ai_created,
            created_at: if entry.created_at > 0 { entry.created_at } else { now },
            modified_at: if entry.modified_at > 0 { entry.modified_at } else { now },
        })
        .collect())
}

/// `name,text` rows. Vectors are left out.
pub fn export_csv(entries: &[Embedding]) -> Result<Vec<u8>, TransferError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for entry in entries {
        writer.serialize(TextRow {
            name: entry.name.clone(),
            text: entry.text.clone(),
        })?;
    }
    writer.into_inner().map_err(|e| TransferError::Io(e.into_error()))
}

pub fn parse_csv(bytes: &[u8]) -> Result<Vec<TextRow>, TransferError> {
    let mut reader = csv::Reader::from_reader(bytes);
    let headers = reader.headers()?;
    if !headers.iter().any(|h| h == "name") || !headers.iter().any(|h| h == "text") {
        return Err(TransferError::MissingColumns);
    }

    let mut rows = Vec::new();
    for row in reader.deserialize::<TextRow>() {
        let row = row?;
        if row.name.trim().is_empty() || row.text.trim().is_empty() {
            continue;
        }
        rows.push(TextRow {
            name: row.name,
            text: cap_text(row.text),
        });
    }
    Ok(rows)
}
