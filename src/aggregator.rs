//! In-memory aggregation caches and the periodic flush.
//!
//! All five metric types aggregate into per-identity cache entries behind a
//! single mutex; distributions are the exception and queue up verbatim for
//! the next flush. Entries live until their per-type delete-on-flush switch
//! or TTL eviction removes them.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::metric::{FieldValue, KeyedMetric, MetricType, SampleValue, TagMap, DEFAULT_FIELD_NAME};
use crate::running_stats::RunningStats;
use crate::sink::{FieldMap, MetricSink};

/// Behavior switches for the caches and the flush, derived from the service
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct AggregatorOptions {
    /// Percentiles emitted for each timing/histogram field.
    pub percentiles: Vec<f64>,
    pub percentile_limit: usize,
    pub delete_gauges: bool,
    pub delete_counters: bool,
    pub delete_sets: bool,
    pub delete_timings: bool,
    pub float_counters: bool,
    pub float_timings: bool,
    pub float_sets: bool,
    pub enable_aggregation_temporality: bool,
    pub datadog_extensions: bool,
    pub datadog_distributions: bool,
    /// Idle eviction after flush; `None` disables.
    pub max_ttl: Option<Duration>,
}

#[derive(Debug)]
struct CachedGauge {
    name: String,
    fields: HashMap<String, f64>,
    tags: TagMap,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct CachedCounter {
    name: String,
    fields: HashMap<String, i64>,
    tags: TagMap,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct CachedSet {
    name: String,
    fields: HashMap<String, HashSet<String>>,
    tags: TagMap,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct CachedTimings {
    name: String,
    fields: HashMap<String, RunningStats>,
    tags: TagMap,
    expires_at: Option<Instant>,
}

/// Distributions are never aggregated across samples; each one is emitted
/// on the next flush and the list cleared.
#[derive(Debug)]
struct PendingDistribution {
    name: String,
    value: f64,
    tags: TagMap,
}

#[derive(Debug)]
struct Caches {
    gauges: HashMap<String, CachedGauge>,
    counters: HashMap<String, CachedCounter>,
    sets: HashMap<String, CachedSet>,
    timings: HashMap<String, CachedTimings>,
    distributions: Vec<PendingDistribution>,
    last_gather_time: DateTime<Utc>,
}

/// The aggregation engine. Shared between the parser workers (apply) and the
/// gather tick (flush).
pub struct Aggregator {
    options: AggregatorOptions,
    caches: Mutex<Caches>,
}

impl Aggregator {
    pub fn new(options: AggregatorOptions) -> Self {
        Self {
            options,
            caches: Mutex::new(Caches {
                gauges: HashMap::new(),
                counters: HashMap::new(),
                sets: HashMap::new(),
                timings: HashMap::new(),
                distributions: Vec::new(),
                last_gather_time: Utc::now(),
            }),
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.options.max_ttl.map(|ttl| Instant::now() + ttl)
    }

    /// Applies one keyed sample to the matching cache.
    pub fn apply(&self, metric: KeyedMetric) {
        let mut caches = self.caches.lock().unwrap();
        let expires_at = self.next_expiry();

        match metric.mtype {
            MetricType::Distribution => {
                if self.options.datadog_extensions && self.options.datadog_distributions {
                    if let SampleValue::Float(value) = metric.value {
                        caches.distributions.push(PendingDistribution {
                            name: metric.name,
                            value,
                            tags: metric.tags,
                        });
                    }
                }
            }
            MetricType::Timing | MetricType::Histogram => {
                let SampleValue::Float(value) = metric.value else {
                    return;
                };
                let entry = caches
                    .timings
                    .entry(metric.hash)
                    .or_insert_with(|| CachedTimings {
                        name: metric.name,
                        fields: HashMap::new(),
                        tags: metric.tags,
                        expires_at: None,
                    });
                let limit = self.options.percentile_limit;
                let stats = entry
                    .fields
                    .entry(metric.field)
                    .or_insert_with(|| RunningStats::new(limit));
                match metric.sample_rate {
                    // Sampled timings approximate the upsampled population.
                    Some(rate) if rate > 0.0 && rate < 1.0 => {
                        let repeats = (1.0 / rate).floor() as usize;
                        for _ in 0..repeats {
                            stats.add_value(value);
                        }
                    }
                    _ => stats.add_value(value),
                }
                entry.expires_at = expires_at;
            }
            MetricType::Counter => {
                let SampleValue::Signed(value) = metric.value else {
                    return;
                };
                let entry = caches
                    .counters
                    .entry(metric.hash)
                    .or_insert_with(|| CachedCounter {
                        name: metric.name,
                        fields: HashMap::new(),
                        tags: metric.tags,
                        expires_at: None,
                    });
                *entry.fields.entry(metric.field).or_insert(0) += value;
                entry.expires_at = expires_at;
            }
            MetricType::Gauge => {
                let SampleValue::Float(value) = metric.value else {
                    return;
                };
                let entry = caches
                    .gauges
                    .entry(metric.hash)
                    .or_insert_with(|| CachedGauge {
                        name: metric.name,
                        fields: HashMap::new(),
                        tags: metric.tags,
                        expires_at: None,
                    });
                let field = entry.fields.entry(metric.field).or_insert(0.0);
                if metric.additive {
                    *field += value;
                } else {
                    *field = value;
                }
                entry.expires_at = expires_at;
            }
            MetricType::Set => {
                let SampleValue::Text(value) = metric.value else {
                    return;
                };
                let entry = caches
                    .sets
                    .entry(metric.hash)
                    .or_insert_with(|| CachedSet {
                        name: metric.name,
                        fields: HashMap::new(),
                        tags: metric.tags,
                        expires_at: None,
                    });
                entry.fields.entry(metric.field).or_default().insert(value);
                entry.expires_at = expires_at;
            }
        }
    }

    /// Drains the caches into the sink; called on each external gather tick.
    ///
    /// Emission order is distributions, timings, gauges, counters, sets.
    pub fn flush(&self, sink: &dyn MetricSink) {
        let now = Utc::now();
        let mut caches = self.caches.lock().unwrap();

        let start_time = self.options.enable_aggregation_temporality.then(|| {
            caches
                .last_gather_time
                .to_rfc3339_opts(SecondsFormat::Secs, true)
        });

        for pending in std::mem::take(&mut caches.distributions) {
            let mut fields = FieldMap::new();
            fields.insert(DEFAULT_FIELD_NAME.to_owned(), FieldValue::Float(pending.value));
            if let Some(start) = &start_time {
                fields.insert("start_time".to_owned(), FieldValue::Text(start.clone()));
            }
            sink.add_fields(&pending.name, fields, pending.tags, now);
        }

        for entry in caches.timings.values_mut() {
            let mut fields = FieldMap::new();
            for (field_name, stats) in entry.fields.iter_mut() {
                let prefix = if field_name == DEFAULT_FIELD_NAME {
                    String::new()
                } else {
                    format!("{field_name}_")
                };
                fields.insert(format!("{prefix}mean"), FieldValue::Float(stats.mean()));
                fields.insert(format!("{prefix}median"), FieldValue::Float(stats.median()));
                fields.insert(format!("{prefix}stddev"), FieldValue::Float(stats.stddev()));
                fields.insert(format!("{prefix}sum"), FieldValue::Float(stats.sum()));
                fields.insert(format!("{prefix}upper"), FieldValue::Float(stats.upper()));
                fields.insert(format!("{prefix}lower"), FieldValue::Float(stats.lower()));
                let count = if self.options.float_timings {
                    FieldValue::Float(stats.count() as f64)
                } else {
                    FieldValue::SignedInt(stats.count() as i64)
                };
                fields.insert(format!("{prefix}count"), count);
                for percentile in &self.options.percentiles {
                    fields.insert(
                        format!("{prefix}{percentile}_percentile"),
                        FieldValue::Float(stats.percentile(*percentile)),
                    );
                }
            }
            if let Some(start) = &start_time {
                fields.insert("start_time".to_owned(), FieldValue::Text(start.clone()));
            }
            sink.add_fields(&entry.name, fields, entry.tags.clone(), now);
        }
        if self.options.delete_timings {
            caches.timings.clear();
        }

        for entry in caches.gauges.values() {
            let mut fields: FieldMap = entry
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), FieldValue::Float(*value)))
                .collect();
            if let Some(start) = &start_time {
                fields.insert("start_time".to_owned(), FieldValue::Text(start.clone()));
            }
            sink.add_gauge(&entry.name, fields, entry.tags.clone(), now);
        }
        if self.options.delete_gauges {
            caches.gauges.clear();
        }

        for entry in caches.counters.values() {
            let mut fields: FieldMap = entry
                .fields
                .iter()
                .map(|(name, value)| {
                    let value = if self.options.float_counters {
                        FieldValue::Float(*value as f64)
                    } else {
                        FieldValue::SignedInt(*value)
                    };
                    (name.clone(), value)
                })
                .collect();
            if let Some(start) = &start_time {
                fields.insert("start_time".to_owned(), FieldValue::Text(start.clone()));
            }
            sink.add_counter(&entry.name, fields, entry.tags.clone(), now);
        }
        if self.options.delete_counters {
            caches.counters.clear();
        }

        for entry in caches.sets.values() {
            let mut fields: FieldMap = entry
                .fields
                .iter()
                .map(|(name, values)| {
                    let cardinality = if self.options.float_sets {
                        FieldValue::Float(values.len() as f64)
                    } else {
                        FieldValue::SignedInt(values.len() as i64)
                    };
                    (name.clone(), cardinality)
                })
                .collect();
            if let Some(start) = &start_time {
                fields.insert("start_time".to_owned(), FieldValue::Text(start.clone()));
            }
            sink.add_fields(&entry.name, fields, entry.tags.clone(), now);
        }
        if self.options.delete_sets {
            caches.sets.clear();
        }

        if self.options.max_ttl.is_some() {
            let deadline = Instant::now();
            caches.gauges.retain(|_, cached| !expired(cached.expires_at, deadline));
            caches.sets.retain(|_, cached| !expired(cached.expires_at, deadline));
            caches.timings.retain(|_, cached| !expired(cached.expires_at, deadline));
            caches.counters.retain(|_, cached| !expired(cached.expires_at, deadline));
        }

        caches.last_gather_time = now;
    }
}

fn expired(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.is_some_and(|at| at < now)
}
