//! Cluster configuration
//!
//! Per CLUSTER_MODEL.md §3:
//! - The label identifies the cluster's persisted settings record
//! - auto_rebuild and auto_reconnect default to off; self-healing is
//!   opt-in
//! - required_tables is the schema contract every replica must host,
//!   consulted by the synchronization copy
//!
//! Configured by the embedder at construction, immutable afterwards.

/// Configuration for one cluster coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Cluster identity; keys the authoritative settings record.
    pub label: String,

    /// Persist authoritative settings and allow the cluster to rebuild a
    /// member from them on restart. Default `false`.
    pub auto_rebuild: bool,

    /// Allow `restart_quarantined` to put quarantined members back through
    /// the start sequence. Default `false`.
    pub auto_reconnect: bool,

    /// Tables every replica must host; the synchronization copy creates
    /// them on the target even when the template lacks data for them.
    pub required_tables: Vec<String>,

    /// Bounded per-replica queue depth. A full queue back-pressures the
    /// caller instead of stalling other replicas.
    pub queue_capacity: usize,

    /// How long a template search waits for a catching-up member to reach
    /// READY before giving up.
    pub template_wait_ms: u64,

    /// Seed for ready-replica selection. `None` seeds from entropy; tests
    /// pin it for deterministic selection.
    pub rng_seed: Option<u64>,
}

impl ClusterConfig {
    /// Create a configuration with conservative defaults.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            auto_rebuild: false,
            auto_reconnect: false,
            required_tables: Vec::new(),
            queue_capacity: 256,
            template_wait_ms: 2_000,
            rng_seed: None,
        }
    }

    /// Create a self-healing configuration: authoritative settings are
    /// persisted and quarantined members may be restarted.
    pub fn self_healing(label: impl Into<String>) -> Self {
        let mut config = Self::new(label);
        config.auto_rebuild = true;
        config.auto_reconnect = true;
        config
    }

    /// Set the required tables.
    pub fn with_required_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-replica queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the template-search wait budget.
    pub fn with_template_wait_ms(mut self, ms: u64) -> Self {
        self.template_wait_ms = ms;
        self
    }

    /// Pin the selection RNG seed.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_conservative() {
        let config = ClusterConfig::new("main");
        assert!(!config.auto_rebuild);
        assert!(!config.auto_reconnect);
        assert!(config.required_tables.is_empty());
        assert!(config.queue_capacity > 0);
    }

    #[test]
    fn test_self_healing_enables_both_flags() {
        let config = ClusterConfig::self_healing("main");
        assert!(config.auto_rebuild);
        assert!(config.auto_reconnect);
    }

    #[test]
    fn test_with_required_tables() {
        let config = ClusterConfig::new("main").with_required_tables(["accounts", "ledger"]);
        assert_eq!(config.required_tables, vec!["accounts", "ledger"]);
    }
}
