//! Bus publisher.
//!
//! Wraps an `rdkafka` future producer, publishing each finished digest as
//! one record on the configured topic. Publishing only enqueues the
//! record; delivery acknowledgement (or failure) is observed
//! asynchronously and folded into the running send/error counters, the
//! same two-phase shape as the original producer's callback/errback pair.

use entropy_config::BusSettings;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug)]
pub enum BusError {
    ClientConfig(String),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::ClientConfig(msg) => write!(f, "bus client config failed: {msg}"),
        }
    }
}

impl std::error::Error for BusError {}

/// Running counters for the bus publisher, safe to read from any task.
#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusStats {
    pub sent: u64,
    pub errors: u64,
    pub success_rate_percent: f64,
}

/// Async Kafka publisher for finished entropy digests.
pub struct BusPublisher {
    producer: FutureProducer,
    topic: String,
    counters: Arc<Counters>,
}

impl BusPublisher {
    /// Build the publisher from `settings`, applying the full configuration
    /// surface (batching, compression, SASL, acks, retries) up front.
    pub fn new(settings: &BusSettings) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("security.protocol", &settings.security_protocol)
            .set("sasl.mechanism", &settings.sasl_mechanism)
            .set("sasl.username", &settings.sasl_username)
            .set("sasl.password", &settings.sasl_password)
            .set("batch.size", settings.batch_size.to_string())
            .set("linger.ms", settings.linger_ms.to_string())
            .set("compression.type", &settings.compression_type)
            .set(
                "max.in.flight.requests.per.connection",
                settings.max_in_flight_requests.to_string(),
            )
            .set("queue.buffering.max.kbytes", (settings.buffer_memory / 1024).to_string())
            .set("message.timeout.ms", settings.max_block_ms.to_string())
            .set("acks", &settings.acks)
            .set("retries", settings.retries.to_string())
            .create()
            .map_err(|err| BusError::ClientConfig(err.to_string()))?;

        info!(topic = %settings.topic, "bus producer initialized");

        Ok(BusPublisher {
            producer,
            topic: settings.topic.clone(),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Enqueue `digest` for delivery. Returns `true` once the record has
    /// been accepted onto the producer's internal queue; actual delivery
    /// success or failure is observed on a spawned task and only affects
    /// the running counters, not this return value — mirroring the
    /// original producer's synchronous-enqueue/async-callback split.
    pub fn publish(&self, digest: String) -> bool {
        let record: FutureRecord<'_, (), str> = FutureRecord::to(&self.topic).payload(digest.as_str());

        let delivery = self.producer.send_result(record);
        let (future, topic, counters) = match delivery {
            Ok(future) => (future, self.topic.clone(), self.counters.clone()),
            Err((err, _record)) => {
                error!(topic = %self.topic, error = %err, "bus send queue full");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        tokio::spawn(async move {
            match future.await {
                Ok(Ok((partition, offset))) => {
                    counters.sent.fetch_add(1, Ordering::Relaxed);
                    debug!(topic = %topic, partition, offset, "message delivered");
                }
                Ok(Err((err, _))) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    error!(topic = %topic, error = %err, "message delivery failed");
                }
                Err(_) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    error!(topic = %topic, "delivery future dropped before completion");
                }
            }
        });

        true
    }

    /// Block until every queued record has been delivered or `timeout` elapses.
    pub async fn flush(&self, timeout: Duration) {
        if let Err(err) = self.producer.flush(Timeout::After(timeout)) {
            error!(error = %err, "error flushing bus producer");
        }
    }

    /// Flush, then tear the producer down. The `FutureProducer` itself has
    /// no separate handle-close step beyond dropping it once every queued
    /// record has been flushed, mirroring the original producer's
    /// `flush()` + `close(timeout)` pair.
    pub async fn close(&self, timeout: Duration) {
        self.flush(timeout).await;
        info!(topic = %self.topic, "bus producer closed");
    }

    pub fn stats(&self) -> BusStats {
        let sent = self.counters.sent.load(Ordering::Relaxed);
        let errors = self.counters.errors.load(Ordering::Relaxed);
        let total = sent + errors;
        let success_rate_percent = if total > 0 {
            sent as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        BusStats {
            sent,
            errors,
            success_rate_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_report_zero_rate_before_any_sends() {
        let counters = Counters::default();
        let sent = counters.sent.load(Ordering::Relaxed);
        let errors = counters.errors.load(Ordering::Relaxed);
        assert_eq!(sent, 0);
        assert_eq!(errors, 0);
    }

    #[test]
    fn success_rate_math_matches_original_formula() {
        let sent = 7u64;
        let errors = 3u64;
        let total = sent + errors;
        let rate = sent as f64 / total as f64 * 100.0;
        assert!((rate - 70.0).abs() < f64::EPSILON);
    }
}
