// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Network monitor (C4). Maintains EWMA estimates of throughput and
//! latency from samples workers submit after each successful transfer,
//! and turns them into advisory hints for the tuner (C6) and the
//! multipart path (C7).

use crate::config::NetworkConfig;
use migrator_common::model::NetworkQuality;
use std::sync::atomic::{AtomicU64, Ordering};

const MIN_PART_SIZE_BYTES: u64 = 5 * 1024 * 1024;
const MAX_PART_SIZE_BYTES: u64 = 5 * 1024 * 1024 * 1024;
const BASE_PART_SIZE_BYTES: u64 = 16 * 1024 * 1024;

/// Thread-safe EWMA tracker for throughput and latency. Reads are
/// lock-free; `record_sample` serializes itself internally via a CAS
/// loop on the bit-packed `f64` (stored as its bit pattern in an
/// `AtomicU64`, the pattern the teacher uses for lock-free gauges).
pub struct NetworkMonitor {
    alpha: f64,
    throughput_bps_bits: AtomicU64,
    latency_ms_bits: AtomicU64,
}

impl NetworkMonitor {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            alpha: config.ewma_alpha,
            throughput_bps_bits: AtomicU64::new(0f64.to_bits()),
            latency_ms_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Records one completed transfer: `bytes` moved over `duration`.
    /// `latency_ms` is the time-to-first-byte observed for the same
    /// transfer.
    pub fn record_sample(&self, bytes: u64, duration: std::time::Duration, latency_ms: f64) {
        let throughput = if duration.as_secs_f64() > 0.0 {
            bytes as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        self.update_ewma(&self.throughput_bps_bits, throughput);
        self.update_ewma(&self.latency_ms_bits, latency_ms);
    }

    fn update_ewma(&self, slot: &AtomicU64, sample: f64) {
        let mut current_bits = slot.load(Ordering::Relaxed);
        loop {
            let current = f64::from_bits(current_bits);
            let next = if current == 0.0 {
                sample
            } else {
                self.alpha * sample + (1.0 - self.alpha) * current
            };
            match slot.compare_exchange_weak(
                current_bits,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current_bits = observed,
            }
        }
    }

    pub fn throughput_bytes_per_sec(&self) -> f64 {
        f64::from_bits(self.throughput_bps_bits.load(Ordering::Relaxed))
    }

    pub fn latency_ms(&self) -> f64 {
        f64::from_bits(self.latency_ms_bits.load(Ordering::Relaxed))
    }

    pub fn quality(&self) -> NetworkQuality {
        NetworkQuality::from_latency(self.latency_ms())
    }

    /// Recommended worker count, scaled off a baseline by the quality
    /// multiplier. The tuner (C6) blends this with its own current
    /// count.
    pub fn recommended_worker_count(&self, baseline: u32) -> u32 {
        ((baseline as f64) * self.quality().concurrency_multiplier()).round() as u32
    }

    /// Recommended multipart part size, clamped into the valid S3 range
    /// (5 MiB..5 GiB) as required by spec §4.7 step 2.
    pub fn recommended_part_size_bytes(&self) -> u64 {
        let scaled = (BASE_PART_SIZE_BYTES as f64 * self.quality().chunk_size_multiplier()) as u64;
        scaled.clamp(MIN_PART_SIZE_BYTES, MAX_PART_SIZE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use test_r::test;

    fn monitor() -> NetworkMonitor {
        NetworkMonitor::new(&NetworkConfig {
            ewma_alpha: 0.5,
            sample_window: 16,
        })
    }

    #[test]
    fn first_sample_sets_the_estimate_directly() {
        let monitor = monitor();
        monitor.record_sample(1_000_000, Duration::from_secs(1), 30.0);
        assert_eq!(monitor.throughput_bytes_per_sec(), 1_000_000.0);
        assert_eq!(monitor.quality(), NetworkQuality::Excellent);
    }

    #[test]
    fn subsequent_samples_blend_via_ewma() {
        let monitor = monitor();
        monitor.record_sample(1_000_000, Duration::from_secs(1), 100.0);
        monitor.record_sample(1_000_000, Duration::from_secs(1), 900.0);
        // alpha=0.5: 0.5*900 + 0.5*100 = 500
        assert!((monitor.latency_ms() - 500.0).abs() < 1e-6);
    }

    #[test]
    fn part_size_recommendation_stays_in_valid_range() {
        let monitor = monitor();
        monitor.record_sample(1, Duration::from_secs(1), 900.0);
        let part_size = monitor.recommended_part_size_bytes();
        assert!(part_size >= MIN_PART_SIZE_BYTES && part_size <= MAX_PART_SIZE_BYTES);
    }
}
