//! EntropyGen pipeline: subscribe to public real-time feeds, fold every
//! accepted message through deduplication and entropy mixing, and publish
//! the resulting digests to the downstream bus.
//!
//! The binary entry point lives in `src/main.rs`; this crate holds the
//! orchestration that wires the per-module crates together so it can be
//! exercised from tests without a real network or bus.

use entropy_bus::BusPublisher;
use entropy_config::Settings;
use entropy_dedup::DedupFilter;
use entropy_memory::MemoryGovernor;
use entropy_mixer::Mixer;
use entropy_ws::{EndpointSubscriber, Handler, SubscriberConfig, SubscriberHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Everything the pipeline dispatcher needs exclusive access to. A single
/// mutex around this bundle realizes the "dedup and mixer are touched by
/// exactly one task at a time" rule from the concurrency model without
/// requiring a dedicated single-threaded executor.
struct Stage {
    dedup: DedupFilter,
    mixer: Mixer,
}

/// Shared, read-many counters surfaced in the message-count-triggered stats
/// log.
#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    duplicates: AtomicU64,
}

/// Point-in-time snapshot of [`Pipeline::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub accepted: u64,
    pub duplicates: u64,
}

/// Owns the whole running pipeline: one subscriber per endpoint, the
/// serialized dedup/mixer stage, the bus publisher, and the memory
/// governor.
pub struct Pipeline {
    settings: Settings,
    stage: Arc<Mutex<Stage>>,
    bus: Arc<BusPublisher>,
    counters: Arc<Counters>,
    memory_governor: Arc<Mutex<MemoryGovernor>>,
    subscriber_handles: Vec<(String, Arc<SubscriberHandle>)>,
    shutdown: CancellationToken,
    joins: Vec<tokio::task::JoinHandle<()>>,
}

/// Consolidate counters from the dedup filter, the bus publisher, and a
/// fresh memory-governor reading into one stats log line, and — mirroring
/// the same defensive reclamation the periodic Memory Governor tick
/// performs — clear the mixer's in-flight batch inline if that reading
/// comes back `critical`.
async fn log_pipeline_stats(
    stage: &Mutex<Stage>,
    bus: &BusPublisher,
    memory_governor: &Mutex<MemoryGovernor>,
    counters: &Counters,
) {
    let accepted = counters.accepted.load(Ordering::Relaxed);
    let duplicates = counters.duplicates.load(Ordering::Relaxed);
    let dedup_stats = stage.lock().await.dedup.stats();
    let bus_stats = bus.stats();
    let mem_stats = memory_governor.lock().await.check_memory();

    info!(
        accepted,
        duplicates,
        dedup_entries = dedup_stats.entries,
        dedup_fill_percent = dedup_stats.fill_percent,
        bus_sent = bus_stats.sent,
        bus_success_rate = bus_stats.success_rate_percent,
        mem_rss_bytes = mem_stats.rss_bytes,
        mem_percent = mem_stats.percent,
        mem_status = ?mem_stats.status,
        "pipeline stats"
    );

    if mem_stats.status == entropy_memory::MemoryStatus::Critical {
        stage.lock().await.mixer.clear();
    }
}

impl Pipeline {
    /// Build the pipeline and spawn one subscriber task per configured
    /// endpoint. Returns as soon as every subscriber task is spawned; the
    /// subscribers themselves connect in the background.
    pub fn start(settings: Settings) -> Result<Self, entropy_bus::BusError> {
        let bus = Arc::new(BusPublisher::new(&settings.bus)?);
        let stage = Arc::new(Mutex::new(Stage {
            dedup: DedupFilter::new(settings.dedup_max_entries),
            mixer: Mixer::new(settings.message_batch_size, settings.pepper_rounds.clone()),
        }));
        let counters = Arc::new(Counters::default());
        let memory_governor = Arc::new(Mutex::new(MemoryGovernor::new(
            settings.memory_threshold_percent,
            settings.memory_critical_percent,
        )));
        let admission = Arc::new(Semaphore::new(settings.message_processing_batch.max(1)));
        let shutdown = CancellationToken::new();
        let stats_log_interval_messages = settings.stats_log_interval_messages.max(1);

        let handler: Handler = {
            let stage = stage.clone();
            let bus = bus.clone();
            let counters = counters.clone();
            let memory_governor = memory_governor.clone();
            let admission = admission.clone();
            Arc::new(move |url: String, payload: Vec<u8>| {
                let stage = stage.clone();
                let bus = bus.clone();
                let counters = counters.clone();
                let memory_governor = memory_governor.clone();
                let admission = admission.clone();
                Box::pin(async move {
                    let _permit = match admission.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let fingerprint = DedupFilter::fingerprint(&payload);
                    let digest = {
                        let mut guard = stage.lock().await;
                        match guard.dedup.observe(&fingerprint) {
                            entropy_dedup::Observation::Duplicate => {
                                counters.duplicates.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                            entropy_dedup::Observation::Novel => guard.mixer.add(payload),
                        }
                    };
                    let accepted_now = counters.accepted.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(digest) = digest {
                        bus.publish(digest);
                    }
                    debug!(url, "message accepted");

                    if accepted_now % stats_log_interval_messages == 0 {
                        log_pipeline_stats(&stage, &bus, &memory_governor, &counters).await;
                    }
                }) as entropy_ws::HandlerFuture
            })
        };

        let mut subscriber_handles = Vec::new();
        let mut joins = Vec::new();
        for endpoint in &settings.endpoints {
            let config = SubscriberConfig {
                url: endpoint.url.clone(),
                init_payload: endpoint.init_payload.clone(),
                init_required: endpoint.init_required,
                queue_max_size: settings.message_queue_max_size,
                reconnect_delay: settings.reconnect_delay,
                max_reconnect_attempts: settings.max_reconnect_attempts,
            };
            let subscriber = EndpointSubscriber::new(config);
            let (join, handle) = subscriber.spawn(handler.clone(), shutdown.clone());
            subscriber_handles.push((endpoint.url.clone(), handle));
            joins.push(join);
        }

        Ok(Pipeline {
            settings,
            stage,
            bus,
            counters,
            memory_governor,
            subscriber_handles,
            shutdown,
            joins,
        })
    }

    /// Spawn the periodic memory governor task (§4.5's 60-second cadence).
    /// Under critical pressure it discards the mixer's in-flight batch,
    /// trading one partial batch for staying inside the configured memory
    /// envelope. This is independent of the message-count-triggered check
    /// `log_pipeline_stats` performs on the same governor instance.
    pub fn spawn_memory_governor(&self) -> tokio::task::JoinHandle<()> {
        let stage = self.stage.clone();
        let memory_governor = self.memory_governor.clone();
        let interval = self.settings.memory_check_interval;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = memory_governor.lock().await.check_memory();
                        if stats.status == entropy_memory::MemoryStatus::Critical {
                            let mut guard = stage.lock().await;
                            guard.mixer.clear();
                        }
                    }
                }
            }
        })
    }

    /// Number of connected endpoints right now.
    pub fn connected_endpoints(&self) -> usize {
        self.subscriber_handles
            .iter()
            .filter(|(_, h)| h.is_connected())
            .count()
    }

    /// Snapshot of the accepted/duplicate counters, independent of the
    /// message-count-triggered stats log.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
        }
    }

    /// Signal every subscriber and background task to stop, wait for them
    /// to finish, close the bus publisher, and emit a final statistics log
    /// (§5 "Cancellation": "After cancellation, a final statistics log is
    /// emitted").
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for join in self.joins {
            let _ = join.await;
        }
        self.bus.close(std::time::Duration::from_secs(5)).await;
        log_pipeline_stats(&self.stage, &self.bus, &self.memory_governor, &self.counters).await;
        info!("pipeline shut down gracefully");
    }
}
