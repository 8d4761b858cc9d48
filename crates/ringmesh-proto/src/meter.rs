//! Lock-free contribution metering (§4.2, §8).
//!
//! Every counter is a plain atomic so the hot RPC path never blocks on a
//! mutex to record a sample; [`ContributionMeter::snapshot`] only pays for a
//! handful of relaxed loads.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ContributionMeter {
    prompt_requests: AtomicU64,
    tensor_requests: AtomicU64,
    tokens: AtomicU64,
    compute_ms: AtomicU64,
    bytes_transferred: AtomicU64,
    failures: AtomicU64,
    peak_memory_mib: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContributionSnapshot {
    /// `prompt_requests + tensor_requests` (§8 "inferenceRequests").
    pub requests: u64,
    pub prompt_requests: u64,
    pub tensor_requests: u64,
    pub tokens: u64,
    pub compute_ms: u64,
    pub bytes_transferred: u64,
    pub failures: u64,
    pub peak_memory_mib: i64,
    pub average_latency_ms: f64,
    pub score: f64,
}

impl ContributionMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed `SendPrompt` (§4.2).
    pub fn record_prompt(&self, tokens: u64, compute_ms: u64, bytes: u64) {
        self.prompt_requests.fetch_add(1, Ordering::Relaxed);
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
        self.compute_ms.fetch_add(compute_ms, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record one completed `SendTensor`; tensors have no token count.
    pub fn record_tensor(&self, compute_ms: u64, bytes: u64) {
        self.tensor_requests.fetch_add(1, Ordering::Relaxed);
        self.compute_ms.fetch_add(compute_ms, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// CAS loop keeping the running maximum of observed resident memory.
    pub fn update_peak_memory(&self, mib: i64) {
        let mut current = self.peak_memory_mib.load(Ordering::Relaxed);
        while mib > current {
            match self.peak_memory_mib.compare_exchange_weak(
                current,
                mib,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn snapshot(&self) -> ContributionSnapshot {
        let prompt_requests = self.prompt_requests.load(Ordering::Relaxed);
        let tensor_requests = self.tensor_requests.load(Ordering::Relaxed);
        let requests = prompt_requests + tensor_requests;
        let tokens = self.tokens.load(Ordering::Relaxed);
        let compute_ms = self.compute_ms.load(Ordering::Relaxed);
        let bytes_transferred = self.bytes_transferred.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let peak_memory_mib = self.peak_memory_mib.load(Ordering::Relaxed);

        let average_latency_ms = if requests == 0 {
            0.0
        } else {
            compute_ms as f64 / requests as f64
        };

        // §8: score rewards volume and compute, with a 20% bonus for a
        // clean record (no recorded failures).
        let base = requests as f64 * 1.0 + tokens as f64 * 0.1 + compute_ms as f64 * 0.001;
        let score = if failures == 0 { base * 1.2 } else { base };

        ContributionSnapshot {
            requests,
            prompt_requests,
            tensor_requests,
            tokens,
            compute_ms,
            bytes_transferred,
            failures,
            peak_memory_mib,
            average_latency_ms,
            score,
        }
    }

    pub fn reset(&self) {
        self.prompt_requests.store(0, Ordering::Relaxed);
        self.tensor_requests.store(0, Ordering::Relaxed);
        self.tokens.store(0, Ordering::Relaxed);
        self.compute_ms.store(0, Ordering::Relaxed);
        self.bytes_transferred.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.peak_memory_mib.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_starts_at_zero() {
        let meter = ContributionMeter::new();
        let snap = meter.snapshot();
        assert_eq!(snap.requests, 0);
        assert_eq!(snap.score, 0.0);
    }

    #[test]
    fn prompt_and_tensor_counts_are_tracked_separately() {
        let meter = ContributionMeter::new();
        meter.record_prompt(10, 5, 100);
        meter.record_tensor(5, 200);
        meter.record_tensor(5, 200);
        let snap = meter.snapshot();
        assert_eq!(snap.prompt_requests, 1);
        assert_eq!(snap.tensor_requests, 2);
        assert_eq!(snap.requests, 3);
    }

    #[test]
    fn score_gets_clean_record_bonus() {
        let meter = ContributionMeter::new();
        meter.record_prompt(100, 50, 1024);
        let clean = meter.snapshot().score;

        meter.record_failure();
        let with_failure = meter.snapshot().score;

        assert!(clean > with_failure);
    }

    #[test]
    fn peak_memory_only_increases() {
        let meter = ContributionMeter::new();
        meter.update_peak_memory(100);
        meter.update_peak_memory(50);
        assert_eq!(meter.snapshot().peak_memory_mib, 100);
        meter.update_peak_memory(200);
        assert_eq!(meter.snapshot().peak_memory_mib, 200);
    }

    #[test]
    fn average_latency_divides_by_request_count() {
        let meter = ContributionMeter::new();
        meter.record_prompt(10, 30, 100);
        meter.record_prompt(10, 70, 100);
        assert_eq!(meter.snapshot().average_latency_ms, 50.0);
    }

    #[test]
    fn reset_clears_all_counters() {
        let meter = ContributionMeter::new();
        meter.record_prompt(10, 30, 100);
        meter.record_failure();
        meter.update_peak_memory(42);
        meter.reset();
        assert_eq!(meter.snapshot(), ContributionSnapshot {
            requests: 0,
            prompt_requests: 0,
            tensor_requests: 0,
            tokens: 0,
            compute_ms: 0,
            bytes_transferred: 0,
            failures: 0,
            peak_memory_mib: 0,
            average_latency_ms: 0.0,
            score: 0.0,
        });
    }

    proptest::proptest! {
        /// Whatever order peak-memory samples arrive in, the tracked value
        /// only ever climbs (§8, contribution monotonicity).
        #[test]
        fn peak_memory_is_monotone_under_any_sample_order(
            samples in proptest::collection::vec(0i64..10_000, 1..50),
        ) {
            let meter = ContributionMeter::new();
            let mut running_max = 0i64;
            for &sample in &samples {
                meter.update_peak_memory(sample);
                running_max = running_max.max(sample);
                proptest::prop_assert_eq!(meter.snapshot().peak_memory_mib, running_max);
            }
        }

        /// The score formula itself (§8): volume/token/compute-weighted base,
        /// with a fixed 20% bonus exactly when no failure has been recorded.
        #[test]
        fn score_matches_the_documented_formula(
            requests in 0u32..50,
            tokens in 0u32..5000,
            compute_ms in 0u32..5000,
            has_failure in proptest::bool::ANY,
        ) {
            let meter = ContributionMeter::new();
            for _ in 0..requests {
                meter.record_prompt((tokens / requests.max(1)) as u64, (compute_ms / requests.max(1)) as u64, 0);
            }
            if has_failure {
                meter.record_failure();
            }
            let snap = meter.snapshot();
            let base = snap.requests as f64 * 1.0
                + snap.tokens as f64 * 0.1
                + snap.compute_ms as f64 * 0.001;
            let expected = if snap.failures == 0 { base * 1.2 } else { base };
            proptest::prop_assert!((snap.score - expected).abs() < 1e-9);
        }

        /// Every counter in a later snapshot is >= the one before it, for
        /// any interleaving of prompt/tensor/failure events with no
        /// intervening `reset` (§8, contribution monotonicity).
        #[test]
        fn snapshots_only_move_forward_without_a_reset(
            events in proptest::collection::vec(0u8..3, 0..30),
        ) {
            let meter = ContributionMeter::new();
            let mut prev = meter.snapshot();
            for event in events {
                match event {
                    0 => meter.record_prompt(5, 7, 11),
                    1 => meter.record_tensor(3, 13),
                    _ => meter.record_failure(),
                }
                let next = meter.snapshot();
                proptest::prop_assert!(next.requests >= prev.requests);
                proptest::prop_assert!(next.tokens >= prev.tokens);
                proptest::prop_assert!(next.compute_ms >= prev.compute_ms);
                proptest::prop_assert!(next.bytes_transferred >= prev.bytes_transferred);
                proptest::prop_assert!(next.failures >= prev.failures);
                prev = next;
            }
        }
    }
}
