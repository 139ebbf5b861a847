//! Source reading a JSON array of objects from disk

use std::fs;

use anyhow::{Context, Result, anyhow};

use super::{Extraction, SourceConnector, SourceQuery};
use crate::models::Record;

/// Reads `configuration.path`, a JSON array of row objects
///
/// The model query is not interpreted. Incremental queries only yield rows
/// past the stored watermark.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFileSource;

impl SourceConnector for JsonFileSource {
    fn query(&self, query: &SourceQuery) -> Result<Extraction> {
        let path = query
            .configuration
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("path is not configured"))?;

        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&contents)
            .with_context(|| format!("Expected a JSON array of rows in {path}"))?;

        let query = query.clone();
        let records = rows
            .into_iter()
            .map(Record::from_json)
            .filter(move |row| match row {
                Ok(record) => query.admits(record),
                Err(_) => true,
            });

        Ok(Extraction {
            records: Box::new(records),
            total_row_count: None,
        })
    }
}
