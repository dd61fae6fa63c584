use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::ClusterConfig;

/// Name of the recommender handling MPAs which don't select one.
pub const DEFAULT_RECOMMENDER_NAME: &str = "default";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RecommenderConfig {
    pub cluster: ClusterConfig,
    /// Name of this recommender.
    /// MPAs selecting another recommender are ignored.
    pub recommender_name: String,
    /// How often metrics should be fetched and recommendations computed.
    /// In seconds. Default: 1 min
    pub recommender_interval: u64,
    /// How often orphaned checkpoints should be garbage collected.
    /// In seconds. Default: 10 min
    pub checkpoints_gc_interval: u64,
    /// Timeout for writing checkpoints since the start of the main loop.
    /// In seconds. Default: 1 min
    pub checkpoints_write_timeout: u64,
    /// Minimum number of checkpoints to write per main loop.
    pub min_checkpoints_per_run: usize,
    /// Whether checkpoints are read on startup and written every loop.
    pub use_checkpoints: bool,
    /// If true, only track pods which have an associated MPA.
    pub memory_saver: bool,
    /// Namespace to search for MPA objects. Empty means all namespaces.
    pub mpa_object_namespace: String,
    /// Namespaces to ignore when searching for MPA objects.
    /// Cannot be combined with mpa_object_namespace.
    pub ignored_mpa_object_namespaces: Vec<String>,
    /// How often aggregate container states are garbage collected.
    /// In seconds. Default: 1 min
    pub aggregate_state_gc_interval: u64,

    /// Length of a single memory peak aggregation window.
    /// In seconds. Default: 24 h
    pub memory_aggregation_interval: u64,
    /// Number of aggregation intervals forming the memory history window.
    pub memory_aggregation_interval_count: u64,
    /// Half life of the memory histogram decay. In seconds. Default: 24 h
    pub memory_histogram_decay_half_life: u64,
    /// Half life of the CPU histogram decay. In seconds. Default: 24 h
    pub cpu_histogram_decay_half_life: u64,
    /// Ratio by which memory is bumped up after an OOM.
    pub oom_bump_up_ratio: f64,
    /// Minimal increase of memory after an OOM, in bytes. Default: 100 MiB
    pub oom_min_bump_up_bytes: f64,

    /// CPU usage percentile used for the target recommendation.
    pub target_cpu_percentile: f64,
    /// Memory usage percentile used for the target recommendation.
    pub target_memory_percentile: f64,
    pub lower_bound_cpu_percentile: f64,
    pub lower_bound_memory_percentile: f64,
    pub upper_bound_cpu_percentile: f64,
    pub upper_bound_memory_percentile: f64,
    /// Fraction of the usage added as a safety margin.
    pub recommendation_margin_fraction: f64,
    /// Minimum CPU recommended per pod, in millicores.
    pub pod_min_cpu_millicores: f64,
    /// Minimum memory recommended per pod, in MiB.
    pub pod_min_memory_mb: f64,

    /// Number of MPAs reconciled horizontally in parallel.
    pub concurrent_hpa_syncs: usize,
    /// Minimum change ratio (from 1.0) before a rescale is proposed.
    pub hpa_tolerance: f64,
    /// Window over which the highest recommendation is used for scale down.
    /// In seconds. Default: 5 min
    pub hpa_downscale_stabilization_window: u64,
    /// Period after pod start when CPU samples might be skipped.
    /// In seconds. Default: 5 min
    pub hpa_cpu_initialization_period: u64,
    /// Period after pod start during which readiness changes
    /// are treated as initial readiness. In seconds. Default: 30 sec
    pub hpa_initial_readiness_delay: u64,

    /// Period of the scale cache refresh loop. In seconds. Default: 7 sec
    pub scale_cache_loop_period: u64,
    /// How long a cached scale stays fresh. In seconds. Default: 10 min
    pub scale_cache_entry_freshness_time: u64,
    /// How long an unused cached scale is kept. In seconds. Default: 1 h
    pub scale_cache_entry_lifetime: u64,
    /// Random jitter applied to the refresh time, as a fraction of freshness time.
    pub scale_cache_entry_jitter_factor: f64,

    /// Capacity of the OOM event channel.
    pub oom_channel_capacity: usize,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        RecommenderConfig {
            cluster: ClusterConfig::default(),
            recommender_name: DEFAULT_RECOMMENDER_NAME.to_string(),
            recommender_interval: 60,
            checkpoints_gc_interval: 600,
            checkpoints_write_timeout: 60,
            min_checkpoints_per_run: 10,
            use_checkpoints: true,
            memory_saver: false,
            mpa_object_namespace: String::new(),
            ignored_mpa_object_namespaces: vec![],
            aggregate_state_gc_interval: 60,
            memory_aggregation_interval: 24 * 3600,
            memory_aggregation_interval_count: 8,
            memory_histogram_decay_half_life: 24 * 3600,
            cpu_histogram_decay_half_life: 24 * 3600,
            oom_bump_up_ratio: 1.2,
            oom_min_bump_up_bytes: 100.0 * 1024.0 * 1024.0,
            target_cpu_percentile: 0.9,
            target_memory_percentile: 0.9,
            lower_bound_cpu_percentile: 0.5,
            lower_bound_memory_percentile: 0.5,
            upper_bound_cpu_percentile: 0.95,
            upper_bound_memory_percentile: 0.95,
            recommendation_margin_fraction: 0.15,
            pod_min_cpu_millicores: 25.0,
            pod_min_memory_mb: 250.0,
            concurrent_hpa_syncs: 5,
            hpa_tolerance: 0.1,
            hpa_downscale_stabilization_window: 300,
            hpa_cpu_initialization_period: 300,
            hpa_initial_readiness_delay: 30,
            scale_cache_loop_period: 7,
            scale_cache_entry_freshness_time: 600,
            scale_cache_entry_lifetime: 3600,
            scale_cache_entry_jitter_factor: 1.0,
            oom_channel_capacity: 5000,
        }
    }
}

impl RecommenderConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.mpa_object_namespace.is_empty() && !self.ignored_mpa_object_namespaces.is_empty() {
            return Err(anyhow!(
                "--mpa-object-namespace and --ignored-mpa-object-namespaces are mutually exclusive and can't be set together."
            ));
        }
        if self.concurrent_hpa_syncs == 0 {
            return Err(anyhow!("concurrentHpaSyncs must be positive"));
        }
        Ok(())
    }

    /// Total length of the memory history window in seconds.
    pub fn memory_aggregation_window_length(&self) -> u64 {
        self.memory_aggregation_interval * self.memory_aggregation_interval_count
    }

    /// Whether MPAs in the given namespace are handled by this recommender.
    pub fn watches_namespace(&self, namespace: &str) -> bool {
        if !self.mpa_object_namespace.is_empty() {
            return self.mpa_object_namespace == namespace;
        }
        !self
            .ignored_mpa_object_namespaces
            .iter()
            .any(|ignored| ignored == namespace)
    }
}
