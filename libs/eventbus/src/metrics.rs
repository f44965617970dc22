//! Bus counters
//!
//! Relaxed atomics bumped on the dispatch path; [`BusStats`] is a plain
//! snapshot for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BusMetrics {
    pub sends: AtomicU64,
    pub publishes: AtomicU64,
    pub requests: AtomicU64,
    pub deliveries: AtomicU64,
    pub replies: AtomicU64,
    pub remote_deliveries: AtomicU64,
    pub remote_inbound: AtomicU64,
    pub no_handlers: AtomicU64,
    pub reply_timeouts: AtomicU64,
    pub handler_failures: AtomicU64,
    pub already_replied: AtomicU64,
    pub dropped_replies: AtomicU64,
}

impl BusMetrics {
    pub fn record_send(&self) {
        self.sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply(&self) {
        self.replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_delivery(&self) {
        self.remote_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_inbound(&self) {
        self.remote_inbound.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_handlers(&self) {
        self.no_handlers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply_timeout(&self) {
        self.reply_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_already_replied(&self) {
        self.already_replied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_reply(&self) {
        self.dropped_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusStats {
        BusStats {
            sends: self.sends.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            remote_deliveries: self.remote_deliveries.load(Ordering::Relaxed),
            remote_inbound: self.remote_inbound.load(Ordering::Relaxed),
            no_handlers: self.no_handlers.load(Ordering::Relaxed),
            reply_timeouts: self.reply_timeouts.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            already_replied: self.already_replied.load(Ordering::Relaxed),
            dropped_replies: self.dropped_replies.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BusMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub sends: u64,
    pub publishes: u64,
    pub requests: u64,
    /// Handler invocations, replies included
    pub deliveries: u64,
    pub replies: u64,
    pub remote_deliveries: u64,
    pub remote_inbound: u64,
    pub no_handlers: u64,
    pub reply_timeouts: u64,
    pub handler_failures: u64,
    pub already_replied: u64,
    pub dropped_replies: u64,
}

impl BusStats {
    /// Requests that ended in a failure kind rather than a reply
    pub fn failed_requests(&self) -> u64 {
        self.reply_timeouts + self.handler_failures
    }
}
