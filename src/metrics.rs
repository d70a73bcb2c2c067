use std::{
    fmt::Write,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::circuit_breaker::CircuitState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Ip,
    User,
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::User => "user",
        }
    }
}

#[derive(Debug, Default)]
struct PolicyCounters {
    allowed_total: AtomicU64,
    denied_total: AtomicU64,
    degraded_total: AtomicU64,
    skipped_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub degraded: u64,
    pub skipped: u64,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    ip: PolicyCounters,
    user: PolicyCounters,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, kind: PolicyKind) -> &PolicyCounters {
        match kind {
            PolicyKind::Ip => &self.ip,
            PolicyKind::User => &self.user,
        }
    }

    pub fn allowed(&self, kind: PolicyKind) {
        self.counters(kind).allowed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn denied(&self, kind: PolicyKind) {
        self.counters(kind).denied_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Request let through because the store could not be consulted.
    pub fn degraded(&self, kind: PolicyKind) {
        self.counters(kind).degraded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped(&self, kind: PolicyKind) {
        self.counters(kind).skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, kind: PolicyKind) -> PolicySnapshot {
        let c = self.counters(kind);
        PolicySnapshot {
            allowed: c.allowed_total.load(Ordering::Relaxed),
            denied: c.denied_total.load(Ordering::Relaxed),
            degraded: c.degraded_total.load(Ordering::Relaxed),
            skipped: c.skipped_total.load(Ordering::Relaxed),
        }
    }

    pub fn render_prometheus(&self, breaker: CircuitState, key_count: Option<usize>) -> String {
        let mut out = String::new();
        let series: [(&str, fn(&PolicySnapshot) -> u64); 4] = [
            ("ratelimit_allowed_total", |s| s.allowed),
            ("ratelimit_denied_total", |s| s.denied),
            ("ratelimit_degraded_total", |s| s.degraded),
            ("ratelimit_skipped_total", |s| s.skipped),
        ];

        for (name, pick) in series {
            let _ = writeln!(out, "# TYPE {name} counter");
            for kind in [PolicyKind::Ip, PolicyKind::User] {
                let value = pick(&self.snapshot(kind));
                let _ = writeln!(out, "{name}{{policy=\"{}\"}} {value}", kind.as_str());
            }
        }

        let _ = writeln!(out, "# HELP ratelimit_circuit_state 0 closed, 1 open, 2 half-open");
        let _ = writeln!(out, "# TYPE ratelimit_circuit_state gauge");
        let _ = writeln!(out, "ratelimit_circuit_state {}", breaker.as_u8());
        if let Some(keys) = key_count {
            let _ = writeln!(out, "# TYPE ratelimit_store_keys gauge");
            let _ = writeln!(out, "ratelimit_store_keys {keys}");
        }
        out
    }
}
