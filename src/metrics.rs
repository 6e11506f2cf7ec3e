//! In-crate counters for the loop and webhook stages.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters for the cognitive loop.
#[derive(Debug, Default)]
pub struct LoopStats {
    total_requests: AtomicU64,
    successful_responses: AtomicU64,
    safety_overrides: AtomicU64,
    anchor_responses: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    failures: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time view of the loop counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LoopStatsSnapshot {
    pub total_requests: u64,
    pub successful_responses: u64,
    pub safety_overrides: u64,
    pub anchor_responses: u64,
    pub circuit_breaker_trips: u64,
    pub failures: u64,
    pub cancelled: u64,
    pub success_rate: f64,
}

impl LoopStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successful_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_safety_override(&self) {
        self.safety_overrides.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anchor(&self) {
        self.anchor_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trip(&self) {
        self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters, deriving the success rate.
    pub fn snapshot(&self) -> LoopStatsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_responses.load(Ordering::Relaxed);
        LoopStatsSnapshot {
            total_requests: total,
            successful_responses: successful,
            safety_overrides: self.safety_overrides.load(Ordering::Relaxed),
            anchor_responses: self.anchor_responses.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            success_rate: successful as f64 / total.max(1) as f64,
        }
    }
}

/// Running counters for the webhook router.
#[derive(Debug, Default)]
pub struct WebhookStats {
    received: AtomicU64,
    accepted: AtomicU64,
    invalid_signatures: AtomicU64,
    duplicates: AtomicU64,
    handler_failures: AtomicU64,
    automation_triggers: AtomicU64,
    // Running average kept as a (sum, count) pair of micros
    processing_micros_total: AtomicU64,
    processing_samples: AtomicU64,
}

/// Point-in-time view of the webhook counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WebhookStatsSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub invalid_signatures: u64,
    pub duplicates: u64,
    pub handler_failures: u64,
    pub automation_triggers: u64,
    pub average_processing_ms: f64,
}

impl WebhookStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_signature(&self) {
        self.invalid_signatures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_automation_trigger(&self) {
        self.automation_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_time(&self, ms: f64) {
        self.processing_micros_total
            .fetch_add((ms * 1000.0) as u64, Ordering::Relaxed);
        self.processing_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters, deriving the running average.
    pub fn snapshot(&self) -> WebhookStatsSnapshot {
        let samples = self.processing_samples.load(Ordering::Relaxed);
        let total_micros = self.processing_micros_total.load(Ordering::Relaxed);
        WebhookStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            invalid_signatures: self.invalid_signatures.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            automation_triggers: self.automation_triggers.load(Ordering::Relaxed),
            average_processing_ms: total_micros as f64 / 1000.0 / samples.max(1) as f64,
        }
    }
}
