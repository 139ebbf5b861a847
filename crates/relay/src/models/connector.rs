//! Connector and model definitions
//!
//! Connectors are configured elsewhere; the engine only reads them to
//! validate syncs and to resolve which implementation moves the data.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseEnumError;

/// Opaque key-value configuration attached to connectors and syncs
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorId(pub i64);

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub i64);

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorType {
    Source,
    Destination,
}

impl ConnectorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorType::Source => "source",
            ConnectorType::Destination => "destination",
        }
    }
}

impl FromStr for ConnectorType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(ConnectorType::Source),
            "destination" => Ok(ConnectorType::Destination),
            other => Err(ParseEnumError::new("connector type", other)),
        }
    }
}

/// HTTP method a destination stream expects for writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Post => "POST",
            RequestMethod::Put => "PUT",
            RequestMethod::Patch => "PATCH",
        }
    }
}

/// A writable target advertised by a destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogStream {
    pub name: String,
    #[serde(default)]
    pub request_method: RequestMethod,
    /// Path joined onto the destination URL; the base URL is used when absent
    #[serde(default)]
    pub url: Option<String>,
}

impl CatalogStream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request_method: RequestMethod::default(),
            url: None,
        }
    }

    pub fn with_method(mut self, method: RequestMethod) -> Self {
        self.request_method = method;
        self
    }
}

/// The destination's advertised schema of writable streams
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<CatalogStream>,
}

impl Catalog {
    pub fn new(streams: Vec<CatalogStream>) -> Self {
        Self { streams }
    }

    pub fn stream(&self, name: &str) -> Option<&CatalogStream> {
        self.streams.iter().find(|s| s.name == name)
    }
}

/// A configured source or destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    /// Assigned by the store on insert
    pub id: ConnectorId,
    pub workspace_id: i64,
    pub connector_type: ConnectorType,
    /// Human-readable name
    pub name: String,
    /// Implementation key resolved through the connector registry ("Http", "JsonFile", ...)
    pub connector_name: String,
    pub configuration: JsonMap,
    /// Only destinations carry a catalog
    pub catalog: Option<Catalog>,
    pub created_at: DateTime<Utc>,
}

impl Connector {
    fn new(
        connector_type: ConnectorType,
        name: impl Into<String>,
        connector_name: impl Into<String>,
    ) -> Self {
        Self {
            id: ConnectorId(0),
            workspace_id: 0,
            connector_type,
            name: name.into(),
            connector_name: connector_name.into(),
            configuration: JsonMap::new(),
            catalog: None,
            created_at: Utc::now(),
        }
    }

    pub fn source(name: impl Into<String>, connector_name: impl Into<String>) -> Self {
        Self::new(ConnectorType::Source, name, connector_name)
    }

    pub fn destination(name: impl Into<String>, connector_name: impl Into<String>) -> Self {
        Self::new(ConnectorType::Destination, name, connector_name)
    }

    pub fn with_workspace(mut self, workspace_id: i64) -> Self {
        self.workspace_id = workspace_id;
        self
    }

    pub fn with_configuration(mut self, configuration: JsonMap) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[default]
    RawSql,
    Table,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::RawSql => "raw_sql",
            QueryType::Table => "table",
        }
    }
}

impl FromStr for QueryType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw_sql" => Ok(QueryType::RawSql),
            "table" => Ok(QueryType::Table),
            other => Err(ParseEnumError::new("query type", other)),
        }
    }
}

/// The query or stream read from a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub workspace_id: i64,
    /// The source connector this model reads from
    pub connector_id: ConnectorId,
    pub name: String,
    pub query: String,
    pub query_type: QueryType,
    /// Field whose value identifies a row
    pub primary_key: String,
}

impl Model {
    pub fn new(
        connector_id: ConnectorId,
        name: impl Into<String>,
        query: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> Self {
        Self {
            id: ModelId(0),
            workspace_id: 0,
            connector_id,
            name: name.into(),
            query: query.into(),
            query_type: QueryType::default(),
            primary_key: primary_key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_stream_lookup() {
        let catalog = Catalog::new(vec![
            CatalogStream::new("profile"),
            CatalogStream::new("events").with_method(RequestMethod::Put),
        ]);

        assert_eq!(catalog.stream("events").unwrap().request_method, RequestMethod::Put);
        assert!(catalog.stream("missing").is_none());
    }

    #[test]
    fn test_catalog_stream_defaults_on_deserialize() {
        let stream: CatalogStream = serde_json::from_str(r#"{"name": "profile"}"#).unwrap();
        assert_eq!(stream.request_method, RequestMethod::Post);
        assert!(stream.url.is_none());
    }

    #[test]
    fn test_connector_type_round_trip() {
        for ty in [ConnectorType::Source, ConnectorType::Destination] {
            assert_eq!(ty.as_str().parse::<ConnectorType>().unwrap(), ty);
        }
        assert!("warehouse".parse::<ConnectorType>().is_err());
    }
}
