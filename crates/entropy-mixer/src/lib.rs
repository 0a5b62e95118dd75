//! The entropy mixer.
//!
//! Accumulates accepted payloads into fixed-size batches and condenses
//! each batch into one 128-hex-character SHA-512 output digest, mixed
//! with a data-dependent permutation of a fixed pepper schedule and a
//! trailing high-resolution timestamp.

use chrono::{Datelike, Timelike, Utc};
use rand_core::RngCore;
use rand_mt::Mt19937GenRand64;
use sha2::{Digest, Sha256, Sha512};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Payloads longer than this are truncated before entering a batch.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Batch mixing (pure, deterministic, clock-free)
// ---------------------------------------------------------------------------

/// Seed the permutation PRNG from the first 64 bits (16 hex chars) of
/// SHA-256(combined).
fn seed_from_combined(combined: &[u8]) -> u64 {
    let digest_hex = hex_encode(Sha256::digest(combined).as_slice());
    u64::from_str_radix(&digest_hex[..16], 16).expect("hex prefix of a sha256 digest is valid hex")
}

/// Fisher-Yates shuffle of `[0, n)`, driven by a seeded MT19937-64 PRNG.
///
/// Written by hand (rather than via `rand::seq::SliceRandom`) so the exact
/// draw sequence is pinned and auditable: for `i` from `n - 1` down to `1`,
/// draw `j` uniformly from `[0, i]` and swap `i` and `j`.
pub fn shuffle_indices(seed: u64, n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = Mt19937GenRand64::new(seed);
    for i in (1..n).rev() {
        let bound = i as u64 + 1;
        let j = (rng.next_u64() % bound) as usize;
        order.swap(i, j);
    }
    order
}

/// Mix one complete batch of payloads (in insertion order) into a
/// 128-hex-character lowercase digest.
///
/// `timestamp` must already be rendered as `YYYYMMDDhhmmssuuuuuu` (zero
/// padded calendar fields, six-digit microseconds) — callers pass the
/// real wall clock in production and a frozen string in tests, which is
/// what keeps this function itself pure and reproducible.
pub fn mix_batch(batch: &[Vec<u8>], pepper_rounds: &[String], timestamp: &str) -> String {
    let mut combined = Vec::with_capacity(batch.iter().map(Vec::len).sum());
    for payload in batch {
        combined.extend_from_slice(payload);
    }

    let seed = seed_from_combined(&combined);
    let order = shuffle_indices(seed, pepper_rounds.len());

    let mut hash = Sha512::digest(&combined).as_slice().to_vec();
    for idx in order {
        let mut input = hash;
        input.extend_from_slice(pepper_rounds[idx].as_bytes());
        hash = Sha512::digest(&input).as_slice().to_vec();
    }

    let mut input = hash;
    input.extend_from_slice(timestamp.as_bytes());
    hex_encode(Sha512::digest(&input).as_slice())
}

fn hex_encode(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

/// Render the current UTC instant as `YYYYMMDDhhmmssuuuuuu`.
pub fn current_timestamp() -> String {
    let now = Utc::now();
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}{:06}",
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.timestamp_subsec_micros()
    )
}

// ---------------------------------------------------------------------------
// Stateful mixer
// ---------------------------------------------------------------------------

/// Accumulates payloads and emits one digest per complete batch.
pub struct Mixer {
    batch_size: usize,
    /// Hard cap of `2 * batch_size`, acting as a safety belt if feeding
    /// briefly outruns consumption.
    buffer: VecDeque<Vec<u8>>,
    pepper_rounds: Vec<String>,
    processed_count: u64,
}

impl Mixer {
    pub fn new(batch_size: usize, pepper_rounds: Vec<String>) -> Self {
        let batch_size = batch_size.max(1);
        Mixer {
            batch_size,
            buffer: VecDeque::with_capacity(batch_size * 2),
            pepper_rounds,
            processed_count: 0,
        }
    }

    /// Append one accepted payload. Truncates payloads over 1 MiB before
    /// buffering. Returns `Some(digest)` the moment the buffer reaches a
    /// full batch (the batch is then consumed atomically).
    pub fn add(&mut self, mut payload: Vec<u8>) -> Option<String> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            warn!(size = payload.len(), "payload too large, truncating");
            payload.truncate(MAX_PAYLOAD_BYTES);
        }

        let cap = self.batch_size * 2;
        if self.buffer.len() >= cap {
            warn!("mixer buffer at safety cap, dropping oldest payload");
            self.buffer.pop_front();
        }
        self.buffer.push_back(payload);

        if self.buffer.len() >= self.batch_size {
            let batch: Vec<Vec<u8>> = self.buffer.drain(..self.batch_size).collect();
            let timestamp = current_timestamp();
            let digest = mix_batch(&batch, &self.pepper_rounds, &timestamp);
            self.processed_count += 1;
            debug!(
                batch_number = self.processed_count,
                batch_size = batch.len(),
                "batch complete"
            );
            Some(digest)
        } else {
            None
        }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    /// Discard the in-flight (incomplete) batch. Used by the Memory
    /// Governor under critical memory pressure.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
