use crate::sync::{AtomicU64, Ordering};
use serde::Serialize;
use std::time::Duration;

/// Which stub flavour a creation counter refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    Lookup,
    Dispatch,
    Resolve,
    Shuffle,
    Instantiating,
}

/// Stub subsystem counters.
///
/// Every counter is independent, so all updates use `Ordering::Relaxed`.
#[derive(Debug, Default)]
pub struct StubMetrics {
    pub resolver_calls: AtomicU64,
    pub lookup_stubs: AtomicU64,
    pub dispatch_stubs: AtomicU64,
    pub resolve_stubs: AtomicU64,
    pub shuffle_thunks: AtomicU64,
    pub instantiating_stubs: AtomicU64,
    pub promotions: AtomicU64,
    pub downgrades: AtomicU64,
    pub cache_inserts: AtomicU64,
    pub cache_clears: AtomicU64,
    pub barrier_swaps: AtomicU64,
    pub barrier_refreshes: AtomicU64,
    pub icache_flushes: AtomicU64,
    pub suspensions: AtomicU64,
    pub suspension_total_us: AtomicU64,
}

impl StubMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_resolver_call(&self) {
        self.resolver_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stub_created(&self, kind: StubKind) {
        let counter = match kind {
            StubKind::Lookup => &self.lookup_stubs,
            StubKind::Dispatch => &self.dispatch_stubs,
            StubKind::Resolve => &self.resolve_stubs,
            StubKind::Shuffle => &self.shuffle_thunks,
            StubKind::Instantiating => &self.instantiating_stubs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downgrade(&self) {
        self.downgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_insert(&self) {
        self.cache_inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_clear(&self) {
        self.cache_clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_barrier_swap(&self) {
        self.barrier_swaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_barrier_refresh(&self) {
        self.barrier_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_icache_flush(&self) {
        self.icache_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspension(&self, duration: Duration) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
        self.suspension_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            resolver_calls: load(&self.resolver_calls),
            stubs: StubCounts {
                lookup: load(&self.lookup_stubs),
                dispatch: load(&self.dispatch_stubs),
                resolve: load(&self.resolve_stubs),
                shuffle: load(&self.shuffle_thunks),
                instantiating: load(&self.instantiating_stubs),
            },
            promotions: load(&self.promotions),
            downgrades: load(&self.downgrades),
            cache_inserts: load(&self.cache_inserts),
            cache_clears: load(&self.cache_clears),
            barrier_swaps: load(&self.barrier_swaps),
            barrier_refreshes: load(&self.barrier_refreshes),
            icache_flushes: load(&self.icache_flushes),
            suspensions: load(&self.suspensions),
            suspension_total_us: load(&self.suspension_total_us),
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct StubCounts {
    pub lookup: u64,
    pub dispatch: u64,
    pub resolve: u64,
    pub shuffle: u64,
    pub instantiating: u64,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub resolver_calls: u64,
    pub stubs: StubCounts,
    pub promotions: u64,
    pub downgrades: u64,
    pub cache_inserts: u64,
    pub cache_clears: u64,
    pub barrier_swaps: u64,
    pub barrier_refreshes: u64,
    pub icache_flushes: u64,
    pub suspensions: u64,
    pub suspension_total_us: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Stub Statistics:")?;
        writeln!(f, "  Resolver calls:     {:>8}", self.resolver_calls)?;
        writeln!(
            f,
            "  Stubs created:      lookup {}, dispatch {}, resolve {}, shuffle {}, instantiating {}",
            self.stubs.lookup,
            self.stubs.dispatch,
            self.stubs.resolve,
            self.stubs.shuffle,
            self.stubs.instantiating
        )?;
        writeln!(f, "  Promotions:         {:>8}", self.promotions)?;
        writeln!(f, "  Downgrades:         {:>8}", self.downgrades)?;
        writeln!(f, "  Cache inserts:      {:>8}", self.cache_inserts)?;
        writeln!(f, "  Barrier swaps:      {:>8}", self.barrier_swaps)?;
        writeln!(f, "  Barrier refreshes:  {:>8}", self.barrier_refreshes)?;
        writeln!(f, "  I-cache flushes:    {:>8}", self.icache_flushes)?;
        writeln!(
            f,
            "  Suspensions:        {:>8} ({} us total)",
            self.suspensions, self.suspension_total_us
        )?;
        Ok(())
    }
}
