//! Derives the measurement name, field, tags and identity hash for a sample.
//!
//! Keying runs outside the aggregation mutex: the bundled mapper is
//! stateless per call, and the per-separator mapper cache below carries its
//! own lock.

use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::error;

use crate::metric::{KeyedMetric, MetricType, Sample, TagMap, DEFAULT_FIELD_NAME};

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref DISALLOWED: Regex = Regex::new(r"[^a-zA-Z_\-0-9\.;=]").unwrap();
}

/// Whether counters report the delta since the last flush or a cumulative
/// total; becomes the `temporality` tag when temporality is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporality {
    Delta,
    Cumulative,
}

impl Temporality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delta => "delta",
            Self::Cumulative => "cumulative",
        }
    }
}

/// Keying switches derived from the service configuration.
#[derive(Debug, Clone, Default)]
pub struct KeyConfig {
    pub sanitize_names_method: String,
    pub convert_names: bool,
    pub metric_separator: String,
    pub temporality: Option<Temporality>,
}

/// Name rewrite produced by a [`NameMapper`].
#[derive(Debug, Clone)]
pub struct MappedName {
    pub name: String,
    /// Empty means "use the default field".
    pub field: String,
    pub tags: TagMap,
}

/// Pluggable bucket-name mapper, e.g. a graphite template engine supplied by
/// the embedding process.
pub trait NameMapper: Send + Sync {
    fn map(&self, name: &str, default_tags: &TagMap) -> Result<MappedName, crate::Error>;
}

/// Mapper used when no templates are configured; passes everything through.
pub struct IdentityMapper;

impl NameMapper for IdentityMapper {
    fn map(&self, name: &str, default_tags: &TagMap) -> Result<MappedName, crate::Error> {
        Ok(MappedName {
            name: name.to_owned(),
            field: String::new(),
            tags: default_tags.clone(),
        })
    }
}

type MapperBuilder = Box<dyn Fn(&str) -> Result<Arc<dyn NameMapper>, crate::Error> + Send + Sync>;

/// Caches one mapper instance keyed on the configured separator, rebuilding
/// it lazily when the separator changes.
pub struct MapperCache {
    build: MapperBuilder,
    cached: Mutex<Option<(String, Arc<dyn NameMapper>)>>,
}

impl MapperCache {
    pub fn new(build: MapperBuilder) -> Self {
        Self {
            build,
            cached: Mutex::new(None),
        }
    }

    /// Cache over the pass-through mapper.
    pub fn identity() -> Self {
        Self::new(Box::new(|_| Ok(Arc::new(IdentityMapper) as Arc<dyn NameMapper>)))
    }

    /// `None` when the builder fails; mapper errors never fail the line.
    fn get(&self, separator: &str) -> Option<Arc<dyn NameMapper>> {
        let mut cached = self.cached.lock().unwrap();
        if let Some((cached_separator, mapper)) = cached.as_ref() {
            if cached_separator == separator {
                return Some(Arc::clone(mapper));
            }
        }
        match (self.build)(separator) {
            Ok(mapper) => {
                *cached = Some((separator.to_owned(), Arc::clone(&mapper)));
                Some(mapper)
            }
            Err(_) => None,
        }
    }
}

/// Splits the bucket into `(name, field, tags)`: inline `,k=v` pairs, name
/// sanitizing, the mapper pass and the `convert_names` rewrite.
pub fn parse_bucket(bucket: &str, config: &KeyConfig, mappers: &MapperCache) -> (String, String, TagMap) {
    let mut tags = TagMap::new();
    let mut parts = bucket.split(',');
    let mut name = parts.next().unwrap_or_default().to_owned();
    for part in parts {
        let (key, value) = parse_key_value(part);
        if !key.is_empty() {
            tags.insert(key.to_owned(), value);
        }
    }

    match config.sanitize_names_method.as_str() {
        "" => {}
        "upstream" => {
            name = WHITESPACE.replace_all(&name, "_").into_owned();
            name = name.replace('/', "-");
            name = DISALLOWED.replace_all(&name, "").into_owned();
        }
        other => error!(message = "Unknown sanitize name method.", method = other),
    }

    let mut field = String::new();
    if let Some(mapper) = mappers.get(&config.metric_separator) {
        if let Ok(mapped) = mapper.map(&name, &tags) {
            name = mapped.name;
            field = mapped.field;
            tags = mapped.tags;
        }
    }

    if config.convert_names {
        name = name.replace('.', "_");
        name = name.replace('-', "__");
    }
    if field.is_empty() {
        field = DEFAULT_FIELD_NAME.to_owned();
    }

    (name, field, tags)
}

/// Lenient `key=value` split: no `=` leaves the key empty (the pair is then
/// dropped by the caller), extra `=` stay in the value.
fn parse_key_value(entry: &str) -> (&str, String) {
    match entry.split_once('=') {
        None => ("", entry.to_owned()),
        Some((key, value)) => (key, value.to_owned()),
    }
}

/// Keys a parsed sample: bucket parsing, `metric_type`/`temporality` tag
/// injection, line-tag overlay and the identity hash.
pub fn key_sample(sample: Sample, config: &KeyConfig, mappers: &MapperCache) -> KeyedMetric {
    let (name, field, mut tags) = parse_bucket(&sample.bucket, config, mappers);

    tags.insert(
        "metric_type".to_owned(),
        sample.mtype.tag_value().to_owned(),
    );
    if sample.mtype == MetricType::Counter {
        if let Some(temporality) = config.temporality {
            tags.insert("temporality".to_owned(), temporality.as_str().to_owned());
        }
    }

    // Line tags win over bucket tags on collision.
    for (key, value) in &sample.line_tags {
        tags.insert(key.clone(), value.clone());
    }

    let hash = identity_hash(&name, &tags);

    KeyedMetric {
        name,
        field,
        hash,
        value: sample.value,
        mtype: sample.mtype,
        additive: sample.additive,
        sample_rate: sample.sample_rate,
        tags,
    }
}

/// Deterministic cache key: sorted `k=v` pairs joined, then the measurement
/// name appended. Tag ordering never affects identity.
pub fn identity_hash(name: &str, tags: &TagMap) -> String {
    let mut hash = String::with_capacity(name.len() + tags.len() * 16);
    for (key, value) in tags {
        hash.push_str(key);
        hash.push('=');
        hash.push_str(value);
    }
    hash.push_str(name);
    hash
}
