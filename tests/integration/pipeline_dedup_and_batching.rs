//! End-to-end pipeline harness: a mock feed server stands in for a real
//! upstream endpoint, and the pipeline is driven through the same
//! dedup-then-mix path real traffic would take.
//!
//! The bus publisher points at an unreachable broker — publishing still
//! enqueues successfully (delivery failure only affects the bus's own
//! counters, observed separately in `entropy-bus`'s unit tests), so this
//! harness focuses on what the pipeline itself is responsible for:
//! accepting novel payloads, deduplicating repeats, and connecting to the
//! configured endpoint.

use entropy_config::{BusSettings, Endpoint, Settings};
use entropy_test_support::MockFeedServer;
use entropygen::Pipeline;
use std::time::Duration;

fn test_settings(endpoint_url: String) -> Settings {
    Settings {
        endpoints: vec![Endpoint {
            url: endpoint_url,
            init_payload: None,
            init_required: false,
        }],
        message_batch_size: 1000, // large enough that no batch completes mid-test
        dedup_max_entries: 1000,
        message_queue_max_size: 32,
        message_processing_batch: 100,
        reconnect_delay: Duration::from_millis(20),
        max_reconnect_attempts: None,
        memory_check_interval: Duration::from_secs(3600),
        memory_threshold_percent: 85.0,
        memory_critical_percent: 95.0,
        stats_log_interval_messages: 1_000_000,
        bus: BusSettings {
            topic: "test-topic".to_owned(),
            bootstrap_servers: "127.0.0.1:1".to_owned(),
            sasl_username: String::new(),
            sasl_password: String::new(),
            security_protocol: "PLAINTEXT".to_owned(),
            sasl_mechanism: "PLAIN".to_owned(),
            batch_size: 16_384,
            linger_ms: 0,
            compression_type: "none".to_owned(),
            max_in_flight_requests: 5,
            buffer_memory: 1024 * 1024,
            max_block_ms: 200,
            acks: "all".to_owned(),
            retries: 0,
        },
        pepper_rounds: entropy_config::PEPPER_ROUNDS.iter().map(|s| (*s).to_owned()).collect(),
    }
}

#[tokio::test]
async fn pipeline_connects_and_deduplicates_s3_mixed_scenario() {
    let server = MockFeedServer::start().await.expect("mock server start");
    let url = server.url();

    let pipeline = Pipeline::start(test_settings(url)).expect("pipeline starts");

    tokio::time::timeout(Duration::from_secs(2), async {
        while pipeline.connected_endpoints() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("endpoint never connected");

    // S3: a mix of distinct and duplicate payloads.
    server.send_text("alpha");
    server.send_text("alpha");
    server.send_text("beta");
    server.send_text("alpha");
    server.send_text("gamma");

    tokio::time::timeout(Duration::from_secs(2), async {
        while pipeline.stats().accepted + pipeline.stats().duplicates < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pipeline never processed all five messages");

    let stats = pipeline.stats();
    assert_eq!(stats.accepted, 3, "alpha, beta, gamma are the distinct payloads");
    assert_eq!(stats.duplicates, 2, "the two repeated \"alpha\" frames");

    pipeline.shutdown().await;
}
