//! Per-harvest metric storage.
//!
//! A [`StatsEngine`] holds one [`Stats`] per metric name for a single harvest
//! window. Probes feed it through the metric aggregator; the harvester takes
//! the whole engine at the window boundary and starts a fresh one.

use std::collections::BTreeMap;

/// Call count and timing for one metric.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    call_count: u64,
    total_nanos: u64,
    min_nanos: u64,
    max_nanos: u64,
}

impl Stats {
    pub fn increment_call_count(&mut self) {
        self.call_count += 1;
    }

    /// Records one timed call.
    pub fn record_nanos(&mut self, nanos: u64) {
        if self.call_count == 0 {
            self.min_nanos = nanos;
            self.max_nanos = nanos;
        } else {
            self.min_nanos = self.min_nanos.min(nanos);
            self.max_nanos = self.max_nanos.max(nanos);
        }
        self.call_count += 1;
        self.total_nanos = self.total_nanos.saturating_add(nanos);
    }

    pub fn merge(&mut self, other: &Stats) {
        if other.call_count == 0 {
            return;
        }
        if self.call_count == 0 {
            self.min_nanos = other.min_nanos;
            self.max_nanos = other.max_nanos;
        } else {
            self.min_nanos = self.min_nanos.min(other.min_nanos);
            self.max_nanos = self.max_nanos.max(other.max_nanos);
        }
        self.call_count += other.call_count;
        self.total_nanos = self.total_nanos.saturating_add(other.total_nanos);
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    pub fn total_nanos(&self) -> u64 {
        self.total_nanos
    }

    pub fn min_nanos(&self) -> u64 {
        self.min_nanos
    }

    pub fn max_nanos(&self) -> u64 {
        self.max_nanos
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsEngine {
    stats: BTreeMap<String, Stats>,
}

impl StatsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats for `name`, created empty on first use.
    pub fn get_stats(&mut self, name: &str) -> &mut Stats {
        self.stats.entry(name.to_string()).or_default()
    }

    /// Makes `name` present in the harvest with no calls.
    pub fn record_empty_stats(&mut self, name: &str) {
        self.get_stats(name);
    }

    pub fn get(&self, name: &str) -> Option<&Stats> {
        self.stats.get(name)
    }

    pub fn merge(&mut self, other: &StatsEngine) {
        for (name, stats) in &other.stats {
            self.get_stats(name).merge(stats);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Stats)> {
        self.stats.iter().map(|(name, stats)| (name.as_str(), stats))
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Sum of call counts across every metric.
    pub fn total_calls(&self) -> u64 {
        self.stats.values().map(Stats::call_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_tracks_min_max_and_total() {
        let mut stats = Stats::default();
        stats.record_nanos(30);
        stats.record_nanos(10);
        stats.record_nanos(20);
        assert_eq!(stats.call_count(), 3);
        assert_eq!(stats.total_nanos(), 60);
        assert_eq!(stats.min_nanos(), 10);
        assert_eq!(stats.max_nanos(), 30);
    }

    #[test]
    fn merge_keeps_extremes() {
        let mut a = StatsEngine::new();
        a.get_stats("Java/Foo/bar").record_nanos(5);
        let mut b = StatsEngine::new();
        b.get_stats("Java/Foo/bar").record_nanos(50);
        b.record_empty_stats("AgentCheck/CircuitBreaker/tripped/all");

        a.merge(&b);
        let merged = a.get("Java/Foo/bar").unwrap();
        assert_eq!(merged.call_count(), 2);
        assert_eq!(merged.min_nanos(), 5);
        assert_eq!(merged.max_nanos(), 50);
        assert_eq!(a.get("AgentCheck/CircuitBreaker/tripped/all").unwrap().call_count(), 0);
        assert_eq!(a.total_calls(), 2);
    }
}
