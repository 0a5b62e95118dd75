//! EntropyGen configuration.
//!
//! Every setting is sourced from an environment variable with a documented
//! default; there are no command-line arguments (see the CLI surface in the
//! top-level spec). The built-in endpoint list and the Blitzortung
//! init-required subset mirror the original Python `config.py` constants.

use std::time::Duration;
use tracing::warn;

// ---------------------------------------------------------------------------
// Endpoint wire format
// ---------------------------------------------------------------------------

/// One configured WebSocket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    /// Opaque text sent immediately after connect, if configured.
    pub init_payload: Option<String>,
    /// Member of the "init-required" subset (receives the fixed family init
    /// message in addition to / instead of `init_payload`).
    pub init_required: bool,
}

/// Parse one `url` or `url;===;base64(initPayload)` entry.
///
/// A base64 decode failure is logged and the endpoint is still returned,
/// just without `init_payload` (§6 "Endpoint-config wire format").
fn parse_endpoint_spec(spec: &str, init_required: bool) -> Endpoint {
    use base64::Engine;

    match spec.split_once(";===;") {
        Some((url, b64)) => {
            let init_payload = match base64::engine::general_purpose::STANDARD.decode(b64) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!(url, error = %e, "init payload was not valid UTF-8");
                        None
                    }
                },
                Err(e) => {
                    warn!(url, error = %e, "failed to base64-decode init payload");
                    None
                }
            };
            Endpoint {
                url: url.to_owned(),
                init_payload,
                init_required,
            }
        }
        None => Endpoint {
            url: spec.to_owned(),
            init_payload: None,
            init_required,
        },
    }
}

// ---------------------------------------------------------------------------
// Built-in defaults
// ---------------------------------------------------------------------------

const DEFAULT_ENDPOINTS: &[&str] = &[
    "wss://stream.binance.com:9443/ws/btcusdt@trade",
    "wss://stream.binance.com:9443/ws/ethusdt@trade",
    "wss://stream.binance.com:443/stream?streams=btcusdt@trade/ethusdt@trade/bnbusdt@trade",
    "wss://stream.binance.com:9443/ws/btcusdt@depth",
    "wss://fstream.binance.com/ws/btcusdt@aggTrade",
    "wss://advanced-trade-ws.coinbase.com",
    "wss://ws.kraken.com/",
    "wss://ws.okx.com:8443/ws/v5/public",
    "wss://stream.bybit.com/v5/public/spot",
    "wss://ws.blockchain.info/inv",
    "wss://ws.blockchain.info/blocks",
    "wss://stream.binance.com:9443/ws/!ticker@arr",
    "wss://stream.binance.com:9443/ws/!miniTicker@arr",
    "wss://stream.binance.com:9443/ws/btcusdt@kline_1s",
    "wss://ws1.blitzortung.org",
    "wss://ws7.blitzortung.org",
    "wss://ws8.blitzortung.org",
    "wss://www.seismicportal.eu/standing_order/websocket",
    "wss://certstream.calidog.io/",
];

/// Endpoints that additionally receive the fixed Blitzortung subscribe
/// message on connect.
pub const BLITZORTUNG_ENDPOINTS: &[&str] = &[
    "wss://ws1.blitzortung.org",
    "wss://ws7.blitzortung.org",
    "wss://ws8.blitzortung.org",
];

/// Fixed subscription payload for the "init-required" endpoint family.
pub const BLITZORTUNG_INIT_MESSAGE: &str = r#"{"a": 111}"#;

/// The ten pepper tokens, in schedule order `A..J`. The digest mix depends
/// on the exact UTF-8 bytes of these strings — do not rename them.
pub const PEPPER_ROUNDS: [&str; 10] = [
    "PEPPER_ROUND_A",
    "PEPPER_ROUND_B",
    "PEPPER_ROUND_C",
    "PEPPER_ROUND_D",
    "PEPPER_ROUND_E",
    "PEPPER_ROUND_F",
    "PEPPER_ROUND_G",
    "PEPPER_ROUND_H",
    "PEPPER_ROUND_I",
    "PEPPER_ROUND_J",
];

fn default_endpoint_list() -> Vec<Endpoint> {
    DEFAULT_ENDPOINTS
        .iter()
        .map(|&url| {
            let init_required = BLITZORTUNG_ENDPOINTS.contains(&url);
            Endpoint {
                url: url.to_owned(),
                init_payload: None,
                init_required,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Bus (downstream message bus) settings
// ---------------------------------------------------------------------------

/// Downstream message bus client configuration (§6 "Bus settings").
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub topic: String,
    pub bootstrap_servers: String,
    pub sasl_username: String,
    pub sasl_password: String,
    pub security_protocol: String,
    pub sasl_mechanism: String,
    pub batch_size: u32,
    pub linger_ms: u32,
    pub compression_type: String,
    pub max_in_flight_requests: u32,
    pub buffer_memory: u64,
    pub max_block_ms: u64,
    pub acks: String,
    pub retries: u32,
}

impl BusSettings {
    fn from_env() -> Self {
        BusSettings {
            topic: env_string("ENTROPYGEN_BUS_TOPIC", "EntropyGen-RAWHashes_Topic1"),
            bootstrap_servers: env_string("ENTROPYGEN_BUS_BOOTSTRAP_SERVERS", ""),
            sasl_username: env_string("ENTROPYGEN_BUS_SASL_USERNAME", ""),
            sasl_password: env_string("ENTROPYGEN_BUS_SASL_PASSWORD", ""),
            security_protocol: env_string("ENTROPYGEN_BUS_SECURITY_PROTOCOL", "SASL_SSL"),
            sasl_mechanism: env_string("ENTROPYGEN_BUS_SASL_MECHANISM", "PLAIN"),
            batch_size: 16_384,
            linger_ms: 0,
            compression_type: "snappy".to_owned(),
            max_in_flight_requests: 1000,
            buffer_memory: 64 * 1024 * 1024,
            max_block_ms: 10_000,
            acks: "all".to_owned(),
            retries: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// All runtime settings for the pipeline, assembled from environment
/// variables at process startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoints: Vec<Endpoint>,
    pub message_batch_size: usize,
    pub dedup_max_entries: usize,
    pub message_queue_max_size: usize,
    pub message_processing_batch: usize,
    pub reconnect_delay: Duration,
    /// `None` means unbounded reconnect attempts.
    pub max_reconnect_attempts: Option<u32>,
    pub memory_check_interval: Duration,
    pub memory_threshold_percent: f64,
    pub memory_critical_percent: f64,
    pub stats_log_interval_messages: u64,
    pub bus: BusSettings,
    pub pepper_rounds: Vec<String>,
}

impl Settings {
    /// Load all settings from the environment, falling back to the
    /// documented defaults for anything unset or unparsable.
    pub fn load() -> Self {
        let endpoints = match std::env::var("ENTROPYGEN_ENDPOINTS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|spec| {
                    let init_required = BLITZORTUNG_ENDPOINTS
                        .iter()
                        .any(|&b| spec.starts_with(b));
                    parse_endpoint_spec(spec.trim(), init_required)
                })
                .collect(),
            _ => default_endpoint_list(),
        };

        Settings {
            endpoints,
            message_batch_size: env_usize("MESSAGE_BATCH_SIZE", 10),
            dedup_max_entries: env_usize("DEDUPLICATION_MAX_ENTRIES", 50_000_000),
            message_queue_max_size: env_usize("MESSAGE_QUEUE_MAX_SIZE", 100_000_000),
            message_processing_batch: env_usize("MESSAGE_PROCESSING_BATCH", 1000),
            reconnect_delay: Duration::from_secs(env_u64("RECONNECT_DELAY_SECONDS", 5)),
            max_reconnect_attempts: std::env::var("MAX_RECONNECT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok()),
            memory_check_interval: Duration::from_secs(env_u64(
                "MEMORY_CHECK_INTERVAL_SECONDS",
                60,
            )),
            memory_threshold_percent: env_f64("MEMORY_THRESHOLD_PERCENT", 85.0),
            memory_critical_percent: env_f64("MEMORY_CRITICAL_PERCENT", 95.0),
            stats_log_interval_messages: env_u64("STATS_LOG_INTERVAL_MESSAGES", 1000),
            bus: BusSettings::from_env(),
            pepper_rounds: PEPPER_ROUNDS.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}
