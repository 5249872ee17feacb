//! Metrics of the messaging service.
//!
//! The dense per-verb dropped-message array is the source of truth queried
//! by operators and tests; the Prometheus counter vector mirrors it for
//! exporters.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{IntCounterVec, Opts, Registry};

use crate::verb::{Verb, VERB_COUNT};

pub struct MessagingMetrics {
    dropped: [AtomicU64; VERB_COUNT],
    dropped_total: IntCounterVec,
}

impl MessagingMetrics {
    pub fn new(registry: &Registry) -> Self {
        let dropped_total = IntCounterVec::new(
            Opts::new(
                "messaging_dropped_messages_total",
                "Outbound requests that resolved with failure, by verb.",
            ),
            &["verb"],
        )
        .expect("valid metric description");
        registry
            .register(Box::new(dropped_total.clone()))
            .expect("metric registered once per registry");

        Self {
            dropped: std::array::from_fn(|_| AtomicU64::new(0)),
            dropped_total,
        }
    }

    /// Incremented exactly once per outbound request that resolved with
    /// failure.
    pub fn increment_dropped(&self, verb: Verb) {
        self.dropped[verb.index()].fetch_add(1, Ordering::Relaxed);
        self.dropped_total.with_label_values(&[verb.name()]).inc();
    }

    pub fn dropped_for(&self, verb: Verb) -> u64 {
        self.dropped[verb.index()].load(Ordering::Relaxed)
    }

    /// Raw per-verb counters, indexed by `Verb::index()`, for exporters.
    pub fn dropped_snapshot(&self) -> [u64; VERB_COUNT] {
        std::array::from_fn(|i| self.dropped[i].load(Ordering::Relaxed))
    }
}
