//! In-memory connectors
//!
//! A source serving a fixed list of records and a destination that records
//! every write. Both can be scripted to fail, which makes them the fakes
//! used throughout the tests.

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::{Result, anyhow, bail};

use super::{
    DestinationConnector, Extraction, SourceConnector, SourceQuery, WritePayload, WriteTarget,
};
use crate::models::{JsonMap, Record};

/// Serves a fixed list of records
#[derive(Default)]
pub struct StaticSource {
    records: Vec<Record>,
    query_error: Option<String>,
    /// Yield this many records, then fail
    fail_after: Option<(usize, String)>,
    queries: RwLock<Vec<SourceQuery>>,
}

impl StaticSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    /// Fail every query before yielding anything
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.query_error = Some(message.into());
        self
    }

    /// Fail the stream after `count` records
    pub fn failing_after(mut self, count: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((count, message.into()));
        self
    }

    /// Queries received so far
    pub fn queries(&self) -> Vec<SourceQuery> {
        self.queries.read().unwrap().clone()
    }
}

impl SourceConnector for StaticSource {
    fn query(&self, query: &SourceQuery) -> Result<Extraction> {
        self.queries.write().unwrap().push(query.clone());

        if let Some(message) = &self.query_error {
            bail!("{message}");
        }

        let admitted: Vec<Record> = self
            .records
            .iter()
            .filter(|record| query.admits(record))
            .cloned()
            .collect();

        let Some((count, message)) = self.fail_after.clone() else {
            return Ok(Extraction::from_records(admitted));
        };

        let stream = admitted
            .into_iter()
            .take(count)
            .map(Ok)
            .chain(std::iter::once(Err(anyhow!(message))));
        Ok(Extraction {
            records: Box::new(stream),
            total_row_count: None,
        })
    }
}

/// A write the destination received
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCall {
    pub target: WriteTarget,
    pub payload: WritePayload,
}

type WriteHook = Box<dyn Fn(usize) + Send + Sync>;

/// Records every write; selected calls can be made to fail
#[derive(Default)]
pub struct RecordingDestination {
    writes: RwLock<Vec<WriteCall>>,
    /// 1-based indexes of write calls that fail
    failing_calls: HashSet<usize>,
    check_error: Option<String>,
    after_write: Option<WriteHook>,
}

impl RecordingDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `call`-th write (1-based) fail
    pub fn fail_call(mut self, call: usize) -> Self {
        self.failing_calls.insert(call);
        self
    }

    /// Make connectivity checks fail
    pub fn failing_check(mut self, message: impl Into<String>) -> Self {
        self.check_error = Some(message.into());
        self
    }

    /// Run `hook` with the call index after every write
    pub fn with_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.after_write = Some(Box::new(hook));
        self
    }

    /// Every write attempted, failed ones included
    pub fn writes(&self) -> Vec<WriteCall> {
        self.writes.read().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.read().unwrap().len()
    }
}

impl DestinationConnector for RecordingDestination {
    fn check(&self, _configuration: &JsonMap) -> Result<()> {
        match &self.check_error {
            Some(message) => bail!("{message}"),
            None => Ok(()),
        }
    }

    fn write(&self, target: &WriteTarget, payload: &WritePayload) -> Result<()> {
        let call = {
            let mut writes = self.writes.write().unwrap();
            writes.push(WriteCall {
                target: target.clone(),
                payload: payload.clone(),
            });
            writes.len()
        };

        if let Some(hook) = &self.after_write {
            hook(call);
        }

        if self.failing_calls.contains(&call) {
            bail!("destination rejected write {call}");
        }
        Ok(())
    }
}
