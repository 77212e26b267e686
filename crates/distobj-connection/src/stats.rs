// Copyright 2025 Distobj Authors
//
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

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free traffic counters for one connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    requests_sent: AtomicU64,
    replies_received: AtomicU64,
    requests_served: AtomicU64,
    error_replies_sent: AtomicU64,
    timeouts: AtomicU64,
    late_replies_discarded: AtomicU64,
    releases_sent: AtomicU64,
    releases_received: AtomicU64,
}

impl ConnectionStats {
    pub fn record_request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_served(&self, failed: bool) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.error_replies_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_reply(&self) {
        self.late_replies_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release_sent(&self) {
        self.releases_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release_received(&self) {
        self.releases_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            error_replies_sent: self.error_replies_sent.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            late_replies_discarded: self.late_replies_discarded.load(Ordering::Relaxed),
            releases_sent: self.releases_sent.load(Ordering::Relaxed),
            releases_received: self.releases_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConnectionStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub requests_sent: u64,
    pub replies_received: u64,
    pub requests_served: u64,
    pub error_replies_sent: u64,
    pub timeouts: u64,
    pub late_replies_discarded: u64,
    pub releases_sent: u64,
    pub releases_received: u64,
}
