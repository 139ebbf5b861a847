//! Source and destination connector contracts
//!
//! The executor only sees these traits. Concrete connectors are looked up
//! by their `connector_name` in a [`ConnectorRegistry`].

mod http;
mod json_file;
mod memory;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

use crate::models::{CatalogStream, Connector, JsonMap, QueryType, Record, RequestMethod, SyncMode};

pub use http::HttpDestination;
pub use json_file::JsonFileSource;
pub use memory::{RecordingDestination, StaticSource, WriteCall};

/// Records produced by a source, lazily
///
/// An `Err` item ends the extraction; items after it are never read.
pub type RecordStream = Box<dyn Iterator<Item = Result<Record>> + Send>;

/// Result of a source query
pub struct Extraction {
    pub records: RecordStream,
    /// Row count reported by the source, when it knows it up front
    pub total_row_count: Option<u64>,
}

impl Extraction {
    /// Wrap an in-memory list of records
    pub fn from_records(records: Vec<Record>) -> Self {
        let total = records.len() as u64;
        Self {
            records: Box::new(records.into_iter().map(Ok)),
            total_row_count: Some(total),
        }
    }
}

/// What to extract from a source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    /// Source connector configuration
    pub configuration: JsonMap,
    pub query: String,
    pub query_type: QueryType,
    pub sync_mode: SyncMode,
    pub cursor_field: Option<String>,
    /// Watermark from the last fully successful incremental run
    pub current_cursor: Option<String>,
}

impl SourceQuery {
    /// Whether an incremental source should emit `record`
    ///
    /// Full-refresh queries, and incremental queries without a watermark
    /// yet, emit everything. Otherwise only rows whose cursor is strictly
    /// past the watermark pass.
    pub fn admits(&self, record: &Record) -> bool {
        if self.sync_mode != SyncMode::Incremental {
            return true;
        }
        let (Some(field), Some(watermark)) = (&self.cursor_field, &self.current_cursor) else {
            return true;
        };
        record
            .get(field)
            .and_then(|value| value.compare_cursor(watermark))
            == Some(Ordering::Greater)
    }
}

/// Where one chunk is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub url: String,
    pub method: RequestMethod,
}

/// One record in a write payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadRecord {
    pub fields: Record,
}

/// Destination-shaped chunk: `{"records": [{"fields": {...}}, ...]}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WritePayload {
    pub records: Vec<PayloadRecord>,
}

impl WritePayload {
    pub fn from_chunk(chunk: &[Record]) -> Self {
        Self {
            records: chunk
                .iter()
                .map(|record| PayloadRecord {
                    fields: record.clone(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Extracts records from an external system
pub trait SourceConnector: Send + Sync {
    /// Run the model query
    ///
    /// Connection or query errors abort the run.
    fn query(&self, query: &SourceQuery) -> Result<Extraction>;
}

/// Writes records to an external system
pub trait DestinationConnector: Send + Sync {
    /// Verify the destination is reachable with this configuration
    fn check(&self, configuration: &JsonMap) -> Result<()>;

    /// Write one chunk; any error or non-2xx response is a failure
    fn write(&self, target: &WriteTarget, payload: &WritePayload) -> Result<()>;
}

/// The `destination_url` a destination connector is configured with
pub fn destination_url(configuration: &JsonMap) -> Result<&str> {
    configuration
        .get("destination_url")
        .and_then(|v| v.as_str())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| anyhow!("destination_url is not configured"))
}

/// Resolve the write target for a catalog stream
///
/// A stream with its own `url` is joined onto `destination_url`.
pub fn resolve_target(destination: &Connector, stream: &CatalogStream) -> Result<WriteTarget> {
    let base = destination_url(&destination.configuration)?;
    let url = match &stream.url {
        Some(path) => url::Url::parse(base)
            .and_then(|base| base.join(path))
            .with_context(|| format!("Invalid url for stream {}", stream.name))?
            .to_string(),
        None => base.to_string(),
    };

    Ok(WriteTarget {
        url,
        method: stream.request_method,
    })
}

/// Maps `connector_name` to implementations
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    sources: HashMap<String, Arc<dyn SourceConnector>>,
    destinations: HashMap<String, Arc<dyn DestinationConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `JsonFile` source and `Http` destination
    pub fn with_defaults(http_timeout: Duration) -> Self {
        let mut registry = Self::new();
        registry.register_source("JsonFile", Arc::new(JsonFileSource));
        registry.register_destination("Http", Arc::new(HttpDestination::new(http_timeout)));
        registry
    }

    pub fn register_source(&mut self, name: impl Into<String>, source: Arc<dyn SourceConnector>) {
        self.sources.insert(name.into(), source);
    }

    pub fn register_destination(
        &mut self,
        name: impl Into<String>,
        destination: Arc<dyn DestinationConnector>,
    ) {
        self.destinations.insert(name.into(), destination);
    }

    pub fn source(&self, connector_name: &str) -> Option<Arc<dyn SourceConnector>> {
        self.sources.get(connector_name).cloned()
    }

    pub fn destination(&self, connector_name: &str) -> Option<Arc<dyn DestinationConnector>> {
        self.destinations.get(connector_name).cloned()
    }
}
