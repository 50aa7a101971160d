//! The statsd listener service: sockets, the bounded ingress queue and the
//! parser workers.

pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::aggregator::{Aggregator, AggregatorOptions};
use crate::config::{ConfigError, StatsdConfig, DEFAULT_SEPARATOR};
use crate::events;
use crate::keying::{self, KeyConfig, MapperCache, Temporality};
use crate::parser::{self, ParseOptions};
use crate::sink::MetricSink;
use crate::telemetry::SourceStats;

/// The UDP packet limit; one datagram payload can never exceed this.
pub(crate) const UDP_MAX_PACKET_SIZE: usize = 64 * 1024;

#[derive(Debug, Snafu)]
pub enum SourceError {
    #[snafu(display("invalid service address: {source}"))]
    Address { source: ConfigError },

    #[snafu(display("failed to bind UDP listener {address}: {source}"))]
    BindUdp {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[snafu(display("failed to bind TCP listener {address}: {source}"))]
    BindTcp {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[snafu(display("the service is already running"))]
    AlreadyRunning,
}

/// One payload waiting in the ingress queue.
#[derive(Debug)]
pub(crate) struct Packet {
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
    /// Peer IP, used as the event source tag.
    pub source: String,
}

pub(crate) enum EnqueueResult {
    Queued,
    Dropped,
    Closed,
}

/// State shared by the listener, connection handler and worker tasks.
pub(crate) struct Pipeline {
    pub aggregator: Arc<Aggregator>,
    pub mappers: Arc<MapperCache>,
    pub stats: Arc<SourceStats>,
    pub sink: Arc<dyn MetricSink>,
    pub shutdown: CancellationToken,
    pub handlers: TaskTracker,
    queue: flume::Sender<Packet>,
    allowed_pending: usize,
    drops: Arc<AtomicU64>,
    parse_options: ParseOptions,
    key_config: KeyConfig,
    datadog_extensions: bool,
    conns: Mutex<HashMap<String, SocketAddr>>,
}

impl Pipeline {
    /// Non-blocking enqueue. A full queue drops the payload: backpressure is
    /// by loss, never by blocking the listener.
    pub(crate) fn enqueue(&self, packet: Packet) -> EnqueueResult {
        match self.queue.try_send(packet) {
            Ok(()) => {
                self.stats.set_pending_messages(self.queue.len() as u64);
                EnqueueResult::Queued
            }
            Err(flume::TrySendError::Full(_)) => {
                let drops = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
                if drops == 1
                    || self.allowed_pending == 0
                    || drops % self.allowed_pending as u64 == 0
                {
                    error!(
                        message = "Statsd message queue full, dropping messages; consider increasing allowed_pending_messages.",
                        dropped = drops,
                    );
                }
                EnqueueResult::Dropped
            }
            Err(flume::TrySendError::Disconnected(_)) => EnqueueResult::Closed,
        }
    }

    pub(crate) fn remember(&self, id: &str, peer: SocketAddr) {
        self.conns.lock().unwrap().insert(id.to_owned(), peer);
    }

    pub(crate) fn forget(&self, id: &str) {
        self.conns.lock().unwrap().remove(id);
    }

    /// Worker loop: drain the queue, split payloads into lines and dispatch
    /// them. Parse errors are logged and swallowed; only shutdown or queue
    /// closure ends the worker.
    pub(crate) async fn run_worker(self: Arc<Self>, queue: flume::Receiver<Packet>) {
        loop {
            let packet = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                received = queue.recv_async() => match received {
                    Ok(packet) => packet,
                    Err(_) => return,
                },
            };
            self.stats.set_pending_messages(queue.len() as u64);

            let start = Instant::now();
            self.process_packet(&packet);
            self.stats.set_parse_time(start.elapsed().as_nanos() as u64);
        }
    }

    fn process_packet(&self, packet: &Packet) {
        let text = match std::str::from_utf8(&packet.payload) {
            Ok(text) => text,
            Err(error) => {
                error!(message = "Discarding payload that is not valid UTF-8.", %error);
                return;
            }
        };
        for line in text.split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if self.datadog_extensions && line.starts_with("_e") {
                if let Err(error) =
                    events::parse_event_line(packet.received_at, line, &packet.source, self.sink.as_ref())
                {
                    // A bad event must not stop the rest of the batch.
                    error!(message = "Parsing event line failed.", %error);
                    debug!(message = "Offending line.", line);
                }
                continue;
            }
            match parser::parse_line(line, self.parse_options) {
                Ok(samples) => {
                    for sample in samples {
                        let keyed = keying::key_sample(sample, &self.key_config, &self.mappers);
                        self.aggregator.apply(keyed);
                    }
                }
                Err(error) => {
                    error!(message = "Invalid statsd line, discarding.", %error, line);
                }
            }
        }
    }
}

struct Running {
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    queue: flume::Sender<Packet>,
    local_addr: Option<SocketAddr>,
}

/// The statsd ingestion service.
///
/// `start` binds the configured listener and spawns the pipeline; the
/// embedding process then calls [`Statsd::gather`] on its flush schedule and
/// [`Statsd::stop`] on shutdown.
pub struct Statsd {
    config: StatsdConfig,
    aggregator: Arc<Aggregator>,
    mappers: Arc<MapperCache>,
    stats: Arc<SourceStats>,
    drops: Arc<AtomicU64>,
    running: Option<Running>,
}

impl Statsd {
    pub fn new(config: StatsdConfig) -> Self {
        Self::with_mapper(config, MapperCache::identity())
    }

    /// Uses a custom name-mapper factory, e.g. a graphite template engine
    /// built from `config.templates`.
    pub fn with_mapper(mut config: StatsdConfig, mappers: MapperCache) -> Self {
        if config.metric_separator.is_empty() {
            config.metric_separator = DEFAULT_SEPARATOR.to_owned();
        }
        let aggregator = Arc::new(Aggregator::new(aggregator_options(&config)));
        Self {
            aggregator,
            mappers: Arc::new(mappers),
            stats: Arc::new(SourceStats::default()),
            drops: Arc::new(AtomicU64::new(0)),
            running: None,
            config,
        }
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    /// The bound listener address, once started. Useful when the configured
    /// port is `0`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().and_then(|running| running.local_addr)
    }

    /// Binds the configured listener and spawns the ingestion tasks.
    pub async fn start(&mut self, sink: Arc<dyn MetricSink>) -> Result<(), SourceError> {
        if self.running.is_some() {
            return AlreadyRunningSnafu.fail();
        }

        let address = self.config.resolve_service_address().context(AddressSnafu)?;
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        let (queue_tx, queue_rx) = flume::bounded(self.config.allowed_pending_messages);

        self.stats.set_limits(
            self.config.max_tcp_connections as u64,
            self.config.allowed_pending_messages as u64,
        );

        let pipeline = Arc::new(Pipeline {
            aggregator: Arc::clone(&self.aggregator),
            mappers: Arc::clone(&self.mappers),
            stats: Arc::clone(&self.stats),
            sink,
            shutdown: shutdown.clone(),
            handlers: tasks.clone(),
            queue: queue_tx.clone(),
            allowed_pending: self.config.allowed_pending_messages,
            drops: Arc::clone(&self.drops),
            parse_options: parse_options(&self.config),
            key_config: key_config(&self.config),
            datadog_extensions: self.config.datadog_extensions,
            conns: Mutex::new(HashMap::new()),
        });

        let local_addr;
        if self.config.is_udp() {
            let socket = tokio::net::UdpSocket::bind(address)
                .await
                .context(BindUdpSnafu { address })?;
            if self.config.read_buffer_size > 0 {
                if let Err(error) =
                    crate::net::set_receive_buffer_size(&socket, self.config.read_buffer_size)
                {
                    warn!(message = "Failed configuring receive buffer size on UDP socket.", %error);
                }
            }
            local_addr = socket.local_addr().ok();
            info!(message = "UDP listening.", address = %address);
            tasks.spawn(udp::listen(socket, Arc::clone(&pipeline)));
        } else {
            let listener = tokio::net::TcpListener::bind(address)
                .await
                .context(BindTcpSnafu { address })?;
            local_addr = listener.local_addr().ok();
            info!(message = "TCP listening.", address = %address);
            let options = tcp::TcpOptions {
                max_connections: self.config.max_tcp_connections,
                keep_alive: self.config.tcp_keep_alive,
                keep_alive_period: self.config.keep_alive_period(),
            };
            tasks.spawn(tcp::listen(listener, options, Arc::clone(&pipeline)));
        }

        for _ in 0..self.config.number_worker_threads {
            tasks.spawn(Arc::clone(&pipeline).run_worker(queue_rx.clone()));
        }

        info!(message = "Started the statsd service.", address = %self.config.service_address);
        self.running = Some(Running {
            pipeline,
            shutdown,
            tasks,
            queue: queue_tx,
            local_addr,
        });
        Ok(())
    }

    /// Flushes aggregated measurements into the sink; called by the
    /// embedding process on its flush cadence.
    pub fn gather(&self, sink: &dyn MetricSink) {
        self.aggregator.flush(sink);
    }

    /// Cooperative shutdown: signal every task, await them all, then close
    /// the ingress queue.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        info!(message = "Stopping the statsd service.");
        let open = running.pipeline.conns.lock().unwrap().len();
        if open > 0 {
            info!(message = "Closing open TCP connections.", connections = open);
        }
        running.shutdown.cancel();
        running.tasks.close();
        running.tasks.wait().await;
        drop(running.queue);
        info!(message = "Stopped the statsd service.", address = %self.config.service_address);
    }
}

impl Drop for Statsd {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.cancel();
        }
    }
}

fn parse_options(config: &StatsdConfig) -> ParseOptions {
    ParseOptions {
        datadog_extensions: config.datadog_extensions,
        datadog_keep_container_tag: config.datadog_keep_container_tag,
    }
}

fn key_config(config: &StatsdConfig) -> KeyConfig {
    KeyConfig {
        sanitize_names_method: config.sanitize_names_method.clone(),
        convert_names: config.convert_names,
        metric_separator: config.metric_separator.clone(),
        temporality: config.enable_aggregation_temporality.then(|| {
            if config.delete_counters {
                Temporality::Delta
            } else {
                Temporality::Cumulative
            }
        }),
    }
}

fn aggregator_options(config: &StatsdConfig) -> AggregatorOptions {
    AggregatorOptions {
        percentiles: config.percentiles.clone(),
        percentile_limit: config.percentile_limit,
        delete_gauges: config.delete_gauges,
        delete_counters: config.delete_counters,
        delete_sets: config.delete_sets,
        delete_timings: config.delete_timings,
        float_counters: config.float_counters,
        float_timings: config.float_timings,
        float_sets: config.float_sets,
        enable_aggregation_temporality: config.enable_aggregation_temporality,
        datadog_extensions: config.datadog_extensions,
        datadog_distributions: config.datadog_distributions,
        max_ttl: config.max_ttl(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;

    fn test_pipeline(queue_depth: usize) -> (Arc<Pipeline>, flume::Receiver<Packet>) {
        let config = StatsdConfig::default();
        let (queue_tx, queue_rx) = flume::bounded(queue_depth);
        let pipeline = Arc::new(Pipeline {
            aggregator: Arc::new(Aggregator::new(aggregator_options(&config))),
            mappers: Arc::new(MapperCache::identity()),
            stats: Arc::new(SourceStats::default()),
            sink: Arc::new(CollectingSink::new()),
            shutdown: CancellationToken::new(),
            handlers: TaskTracker::new(),
            queue: queue_tx,
            allowed_pending: queue_depth,
            drops: Arc::new(AtomicU64::new(0)),
            parse_options: parse_options(&config),
            key_config: key_config(&config),
            datadog_extensions: false,
            conns: Mutex::new(HashMap::new()),
        });
        (pipeline, queue_rx)
    }

    fn packet(payload: &str) -> Packet {
        Packet {
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            received_at: Utc::now(),
            source: "127.0.0.1".to_owned(),
        }
    }

    #[test]
    fn enqueue_never_blocks_and_drops_monotonically() {
        let (pipeline, queue_rx) = test_pipeline(3);

        for i in 0..10 {
            let result = pipeline.enqueue(packet(&format!("m{i}:1|c")));
            if i < 3 {
                assert!(matches!(result, EnqueueResult::Queued));
            } else {
                assert!(matches!(result, EnqueueResult::Dropped));
                assert_eq!(pipeline.drops.load(Ordering::Relaxed), (i - 2) as u64);
            }
        }

        assert_eq!(queue_rx.len(), 3);
        assert_eq!(pipeline.drops.load(Ordering::Relaxed), 7);
        assert_eq!(pipeline.stats.snapshot().pending_messages, 3);
    }

    #[test]
    fn enqueue_reports_a_closed_queue() {
        let (pipeline, queue_rx) = test_pipeline(1);
        drop(queue_rx);
        assert!(matches!(
            pipeline.enqueue(packet("m:1|c")),
            EnqueueResult::Closed
        ));
    }

    #[test]
    fn worker_batches_split_trim_and_aggregate() {
        let (pipeline, _queue_rx) = test_pipeline(4);
        pipeline.process_packet(&packet("  load:42|g  \n\nhits:1|c\nhits:2|c\nbroken line\n"));

        let sink = CollectingSink::new();
        pipeline.aggregator.flush(&sink);

        assert_eq!(
            sink.find("load").unwrap().fields.get("value").unwrap(),
            &crate::metric::FieldValue::Float(42.0)
        );
        assert_eq!(
            sink.find("hits").unwrap().fields.get("value").unwrap(),
            &crate::metric::FieldValue::SignedInt(3)
        );
    }

    #[test]
    fn invalid_utf8_payloads_are_discarded() {
        let (pipeline, _queue_rx) = test_pipeline(4);
        pipeline.process_packet(&Packet {
            payload: Bytes::from_static(&[0xff, 0xfe, b'\n']),
            received_at: Utc::now(),
            source: String::new(),
        });

        let sink = CollectingSink::new();
        pipeline.aggregator.flush(&sink);
        assert!(sink.take_records().is_empty());
    }

    #[test]
    fn event_lines_are_routed_to_the_event_path() {
        let config = StatsdConfig {
            datadog_extensions: true,
            ..StatsdConfig::default()
        };
        let (queue_tx, _queue_rx) = flume::bounded(4);
        let sink = Arc::new(CollectingSink::new());
        let pipeline = Pipeline {
            aggregator: Arc::new(Aggregator::new(aggregator_options(&config))),
            mappers: Arc::new(MapperCache::identity()),
            stats: Arc::new(SourceStats::default()),
            sink: Arc::clone(&sink) as Arc<dyn MetricSink>,
            shutdown: CancellationToken::new(),
            handlers: TaskTracker::new(),
            queue: queue_tx,
            allowed_pending: 4,
            drops: Arc::new(AtomicU64::new(0)),
            parse_options: parse_options(&config),
            key_config: key_config(&config),
            datadog_extensions: true,
            conns: Mutex::new(HashMap::new()),
        };

        // One event, one broken event, one ordinary metric; the broken one
        // must not stop the batch.
        pipeline.process_packet(&packet("_e{5,4}:title|text\n_e{9,9}:bogus|x\nhits:1|c\n"));

        let records = sink.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].measurement, "title");

        let flush_sink = CollectingSink::new();
        pipeline.aggregator.flush(&flush_sink);
        assert!(flush_sink.find("hits").is_some());
    }
}
