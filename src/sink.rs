//! The downstream accumulator abstraction.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::metric::{FieldValue, TagMap};

/// Fields of one emitted measurement.
pub type FieldMap = HashMap<String, FieldValue>;

/// Abstract downstream consumer of aggregated measurements.
///
/// Implemented by the embedding process; the service only ever pushes
/// `(measurement, fields, tags, timestamp)` tuples plus fatal listener
/// errors into it.
pub trait MetricSink: Send + Sync {
    fn add_fields(&self, measurement: &str, fields: FieldMap, tags: TagMap, timestamp: DateTime<Utc>);
    fn add_gauge(&self, measurement: &str, fields: FieldMap, tags: TagMap, timestamp: DateTime<Utc>);
    fn add_counter(&self, measurement: &str, fields: FieldMap, tags: TagMap, timestamp: DateTime<Utc>);

    /// Reports an error that terminated a listener task.
    fn add_error(&self, error: crate::Error);
}

/// Which sink operation recorded a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Fields,
    Gauge,
    Counter,
}

/// One measurement captured by [`CollectingSink`].
#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub kind: RecordKind,
    pub measurement: String,
    pub fields: FieldMap,
    pub tags: TagMap,
    pub timestamp: DateTime<Utc>,
}

/// Sink that stores everything it receives; used by the tests and useful
/// for embedders that batch downstream writes.
#[derive(Default)]
pub struct CollectingSink {
    records: Mutex<Vec<SinkRecord>>,
    errors: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, kind: RecordKind, measurement: &str, fields: FieldMap, tags: TagMap, timestamp: DateTime<Utc>) {
        self.records.lock().unwrap().push(SinkRecord {
            kind,
            measurement: measurement.to_owned(),
            fields,
            tags,
            timestamp,
        });
    }

    /// All captured records, in emission order.
    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Drains and returns the captured records.
    pub fn take_records(&self) -> Vec<SinkRecord> {
        std::mem::take(&mut *self.records.lock().unwrap())
    }

    /// First record for the given measurement name, if any.
    pub fn find(&self, measurement: &str) -> Option<SinkRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|record| record.measurement == measurement)
            .cloned()
    }

    /// All records for the given measurement name.
    pub fn find_all(&self, measurement: &str) -> Vec<SinkRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.measurement == measurement)
            .cloned()
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl MetricSink for CollectingSink {
    fn add_fields(&self, measurement: &str, fields: FieldMap, tags: TagMap, timestamp: DateTime<Utc>) {
        self.push(RecordKind::Fields, measurement, fields, tags, timestamp);
    }

    fn add_gauge(&self, measurement: &str, fields: FieldMap, tags: TagMap, timestamp: DateTime<Utc>) {
        self.push(RecordKind::Gauge, measurement, fields, tags, timestamp);
    }

    fn add_counter(&self, measurement: &str, fields: FieldMap, tags: TagMap, timestamp: DateTime<Utc>) {
        self.push(RecordKind::Counter, measurement, fields, tags, timestamp);
    }

    fn add_error(&self, error: crate::Error) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}
