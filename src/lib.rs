//! StatsD ingestion and aggregation service.
//!
//! Listens for StatsD-formatted lines over UDP or TCP (including the DataDog
//! protocol extensions), parses them, aggregates values in memory by metric
//! identity and, on each external gather tick, flushes aggregated
//! measurements into a [`sink::MetricSink`].
//!
//! The embedding process owns configuration loading, the flush schedule and
//! the downstream accumulator; this crate owns everything between the socket
//! and the sink:
//!
//! ```text
//! listener -> bounded queue -> parser workers -> aggregation caches -> gather
//! ```

pub mod aggregator;
pub mod config;
pub mod events;
pub mod keying;
pub mod metric;
pub mod net;
pub mod parser;
pub mod running_stats;
pub mod sink;
pub mod source;
pub mod telemetry;

use std::error;

pub type Error = Box<dyn error::Error + Send + Sync + 'static>;
pub type Result<T> = std::result::Result<T, Error>;

pub use config::StatsdConfig;
pub use source::Statsd;
