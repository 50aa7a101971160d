//! Core data types shared by the parser, the keying step and the caches.

use std::collections::BTreeMap;

/// Tag set attached to a measurement.
///
/// Kept ordered so identity hashing is independent of insertion order.
pub type TagMap = BTreeMap<String, String>;

/// Field name used when a bucket does not map to an explicit field.
pub const DEFAULT_FIELD_NAME: &str = "value";

/// The five StatsD metric types plus DataDog distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Counter,
    Gauge,
    Set,
    Timing,
    Histogram,
    Distribution,
}

impl MetricType {
    /// Parses the wire symbol between the first and second `|`.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "c" => Some(Self::Counter),
            "g" => Some(Self::Gauge),
            "s" => Some(Self::Set),
            "ms" => Some(Self::Timing),
            "h" => Some(Self::Histogram),
            "d" => Some(Self::Distribution),
            _ => None,
        }
    }

    /// Value of the `metric_type` tag injected for this type.
    pub fn tag_value(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Set => "set",
            Self::Timing => "timing",
            Self::Histogram => "histogram",
            Self::Distribution => "distribution",
        }
    }
}

/// Value carried by one parsed sample, discriminated by metric type:
/// counters are integers, sets keep the raw string, everything else is a
/// float.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Signed(i64),
    Float(f64),
    Text(String),
}

/// One StatsD value parsed from a line, before name keying.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Pre-keyed identifier, possibly with embedded `,k=v` pairs.
    pub bucket: String,
    pub value: SampleValue,
    pub mtype: MetricType,
    /// Whether the literal value carried a leading `+` or `-`.
    pub additive: bool,
    /// Declared sample rate; `None` when absent or unparseable.
    pub sample_rate: Option<f64>,
    /// Tags from the DataDog `#...` segment.
    pub line_tags: TagMap,
}

/// A sample with its derived identity, ready for aggregation.
#[derive(Debug, Clone)]
pub struct KeyedMetric {
    pub name: String,
    pub field: String,
    /// Cache key derived from the sorted tag set and the name.
    pub hash: String,
    pub value: SampleValue,
    pub mtype: MetricType,
    pub additive: bool,
    pub sample_rate: Option<f64>,
    pub tags: TagMap,
}

/// Field value emitted to the sink.
///
/// Counters and set cardinalities are stored as integers internally and cast
/// here at emit time depending on the `float_*` switches; `Text` carries the
/// RFC 3339 `start_time` and event payload fields.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    SignedInt(i64),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::SignedInt(value) => Some(*value as f64),
            Self::Text(_) => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::SignedInt(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}
