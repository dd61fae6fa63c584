use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use resources::{
    config::recommender::RecommenderConfig,
    objects::{
        checkpoint::CheckpointStatus,
        metrics::{Resource, ResourceList},
        mpa::{ContainerResourcePolicy, ContainerScalingMode, UpdateMode},
    },
};

use super::{
    cores_from_cpu_amount,
    histogram::{DecayingHistogram, ExponentialHistogramOptions, Histogram},
    ContainerUsageSample,
};
use crate::error::RecommenderError;

/// Version of the checkpoint format this recommender reads and writes.
pub const SUPPORTED_CHECKPOINT_VERSION: &str = "v3";

/// Minimal weight of a CPU sample, in cores.
const MIN_SAMPLE_WEIGHT: f64 = 0.1;
/// Weights smaller than this are treated as zero.
const EPSILON: f64 = 0.001 * MIN_SAMPLE_WEIGHT;
/// Growth ratio of consecutive histogram buckets.
const HISTOGRAM_BUCKET_SIZE_GROWTH: f64 = 0.05;

lazy_static! {
    /// CPU histogram buckets from 0.01 core up to 1000 cores.
    pub static ref CPU_HISTOGRAM_OPTIONS: ExponentialHistogramOptions =
        ExponentialHistogramOptions::new(1000.0, 0.01, 1.0 + HISTOGRAM_BUCKET_SIZE_GROWTH, EPSILON);
    /// Memory histogram buckets from 10 MB up to 1 TB.
    pub static ref MEMORY_HISTOGRAM_OPTIONS: ExponentialHistogramOptions =
        ExponentialHistogramOptions::new(1e12, 1e7, 1.0 + HISTOGRAM_BUCKET_SIZE_GROWTH, EPSILON);
}

/// Resources recommended when a container policy doesn't name any.
pub const DEFAULT_CONTROLLED_RESOURCES: [Resource; 2] = [Resource::CPU, Resource::Memory];

/// Parameters of the usage aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationsConfig {
    /// Length of a single memory peak window.
    pub memory_aggregation_interval: Duration,
    pub memory_aggregation_interval_count: i32,
    pub memory_histogram_decay_half_life: Duration,
    pub cpu_histogram_decay_half_life: Duration,
    pub oom_bump_up_ratio: f64,
    /// In bytes.
    pub oom_min_bump_up: f64,
}

impl Default for AggregationsConfig {
    fn default() -> Self {
        AggregationsConfig::from(&RecommenderConfig::default())
    }
}

impl From<&RecommenderConfig> for AggregationsConfig {
    fn from(config: &RecommenderConfig) -> Self {
        AggregationsConfig {
            memory_aggregation_interval: Duration::seconds(
                config.memory_aggregation_interval as i64,
            ),
            memory_aggregation_interval_count: config.memory_aggregation_interval_count as i32,
            memory_histogram_decay_half_life: Duration::seconds(
                config.memory_histogram_decay_half_life as i64,
            ),
            cpu_histogram_decay_half_life: Duration::seconds(
                config.cpu_histogram_decay_half_life as i64,
            ),
            oom_bump_up_ratio: config.oom_bump_up_ratio,
            oom_min_bump_up: config.oom_min_bump_up_bytes,
        }
    }
}

impl AggregationsConfig {
    /// The whole history taken into account for memory peaks.
    pub fn memory_aggregation_window_length(&self) -> Duration {
        self.memory_aggregation_interval * self.memory_aggregation_interval_count
    }
}

/// Aggregated usage of all containers sharing an [`AggregateStateKey`](super::AggregateStateKey),
/// or of a whole MPA when merged by container name.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateContainerState {
    /// CPU usage in cores, each sample weighted by the container request.
    pub aggregate_cpu_usage: DecayingHistogram,
    /// Peak memory usage per aggregation window, in bytes.
    pub aggregate_memory_peaks: DecayingHistogram,
    pub first_sample_start: Option<NaiveDateTime>,
    pub last_sample_start: Option<NaiveDateTime>,
    pub total_samples_count: i64,
    pub creation_time: NaiveDateTime,

    /// Last target recommended for these containers, before capping.
    pub last_recommendation: Option<ResourceList>,
    /// Whether any MPA currently aggregates this state.
    pub is_under_mpa: bool,
    pub update_mode: Option<UpdateMode>,
    pub scaling_mode: Option<ContainerScalingMode>,
    pub controlled_resources: Option<Vec<Resource>>,
}

impl AggregateContainerState {
    pub fn new(config: &AggregationsConfig, now: NaiveDateTime) -> Self {
        AggregateContainerState {
            aggregate_cpu_usage: DecayingHistogram::new(
                &CPU_HISTOGRAM_OPTIONS,
                config.cpu_histogram_decay_half_life,
            ),
            aggregate_memory_peaks: DecayingHistogram::new(
                &MEMORY_HISTOGRAM_OPTIONS,
                config.memory_histogram_decay_half_life,
            ),
            first_sample_start: None,
            last_sample_start: None,
            total_samples_count: 0,
            creation_time: now,
            last_recommendation: None,
            is_under_mpa: false,
            update_mode: None,
            scaling_mode: None,
            controlled_resources: None,
        }
    }

    pub fn add_sample(&mut self, sample: &ContainerUsageSample) {
        match sample.resource {
            Resource::CPU => self.add_cpu_sample(sample),
            Resource::Memory => self.aggregate_memory_peaks.add_sample(
                sample.usage as f64,
                1.0,
                sample.measure_start,
            ),
        }
    }

    /// Only memory peaks can be taken back.
    pub fn subtract_sample(&mut self, sample: &ContainerUsageSample) {
        match sample.resource {
            Resource::Memory => self.aggregate_memory_peaks.subtract_sample(
                sample.usage as f64,
                1.0,
                sample.measure_start,
            ),
            Resource::CPU => {
                tracing::warn!("Subtracting CPU samples is not supported, ignoring");
            },
        }
    }

    fn add_cpu_sample(&mut self, sample: &ContainerUsageSample) {
        let usage = cores_from_cpu_amount(sample.usage);
        let request = cores_from_cpu_amount(sample.request);
        self.aggregate_cpu_usage
            .add_sample(usage, request.max(MIN_SAMPLE_WEIGHT), sample.measure_start);
        if self
            .last_sample_start
            .map_or(true, |last| sample.measure_start > last)
        {
            self.last_sample_start = Some(sample.measure_start);
        }
        if self
            .first_sample_start
            .map_or(true, |first| sample.measure_start < first)
        {
            self.first_sample_start = Some(sample.measure_start);
        }
        self.total_samples_count += 1;
    }

    pub fn merge_container_state(&mut self, other: &AggregateContainerState) {
        self.aggregate_cpu_usage.merge(&other.aggregate_cpu_usage);
        self.aggregate_memory_peaks
            .merge(&other.aggregate_memory_peaks);
        if let Some(other_first) = other.first_sample_start {
            if self.first_sample_start.map_or(true, |first| other_first < first) {
                self.first_sample_start = Some(other_first);
            }
        }
        if let Some(other_last) = other.last_sample_start {
            if self.last_sample_start.map_or(true, |last| other_last > last) {
                self.last_sample_start = Some(other_last);
            }
        }
        self.total_samples_count += other.total_samples_count;
    }

    pub fn save_to_checkpoint(&self, now: NaiveDateTime) -> CheckpointStatus {
        CheckpointStatus {
            last_update_time: Some(now),
            version: SUPPORTED_CHECKPOINT_VERSION.to_string(),
            cpu_histogram: self.aggregate_cpu_usage.save_to_checkpoint(),
            memory_histogram: self.aggregate_memory_peaks.save_to_checkpoint(),
            first_sample_start: self.first_sample_start,
            last_sample_start: self.last_sample_start,
            total_samples_count: self.total_samples_count,
        }
    }

    pub fn load_from_checkpoint(
        &mut self,
        checkpoint: &CheckpointStatus,
    ) -> Result<(), RecommenderError> {
        if checkpoint.version != SUPPORTED_CHECKPOINT_VERSION {
            return Err(RecommenderError::CheckpointVersionMismatch {
                found: checkpoint.version.to_owned(),
                expected: SUPPORTED_CHECKPOINT_VERSION.to_string(),
            });
        }
        self.total_samples_count = checkpoint.total_samples_count.max(0);
        self.first_sample_start = checkpoint.first_sample_start;
        self.last_sample_start = checkpoint.last_sample_start;
        self.aggregate_memory_peaks
            .load_from_checkpoint(&checkpoint.memory_histogram)?;
        self.aggregate_cpu_usage
            .load_from_checkpoint(&checkpoint.cpu_histogram)?;
        Ok(())
    }

    /// Whether the aggregation has seen no sample for a whole memory history window.
    pub fn is_expired(&self, now: NaiveDateTime, window_length: Duration) -> bool {
        let since = match (self.is_empty(), self.last_sample_start) {
            (false, Some(last)) => last,
            _ => self.creation_time,
        };
        now - since >= window_length
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples_count == 0
    }

    pub fn needs_recommendation(&self) -> bool {
        self.is_under_mpa && self.scaling_mode != Some(ContainerScalingMode::Off)
    }

    pub fn mark_not_autoscaled(&mut self) {
        self.is_under_mpa = false;
        self.last_recommendation = None;
        self.update_mode = None;
    }

    /// Take the scaling mode and the controlled resources from a container policy.
    pub fn update_from_policy(&mut self, policy: Option<&ContainerResourcePolicy>) {
        self.scaling_mode = Some(
            policy
                .and_then(|p| p.mode)
                .unwrap_or(ContainerScalingMode::Auto),
        );
        self.controlled_resources = Some(
            policy
                .and_then(|p| p.controlled_resources.to_owned())
                .unwrap_or_else(|| DEFAULT_CONTROLLED_RESOURCES.to_vec()),
        );
    }

    pub fn controlled_resources(&self) -> Vec<Resource> {
        self.controlled_resources
            .to_owned()
            .unwrap_or_else(|| DEFAULT_CONTROLLED_RESOURCES.to_vec())
    }
}

/// Merge aggregations by container name.
pub fn aggregate_state_by_container_name<'a>(
    states: impl Iterator<Item = (&'a str, &'a AggregateContainerState)>,
    config: &AggregationsConfig,
    now: NaiveDateTime,
) -> BTreeMap<String, AggregateContainerState> {
    let mut by_name = BTreeMap::<String, AggregateContainerState>::new();
    for (container_name, state) in states {
        by_name
            .entry(container_name.to_string())
            .or_insert_with(|| AggregateContainerState::new(config, now))
            .merge_container_state(state);
    }
    by_name
}
