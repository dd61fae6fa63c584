use chrono::{Duration, NaiveDateTime};
use resources::objects::metrics::{Resource, ResourceList};

use super::{
    aggregation::{AggregateContainerState, AggregationsConfig},
    memory_amount_from_bytes, scale_resource, AggregateStateKey, ContainerUsageSample,
};
use crate::error::RecommenderError;

/// Usage tracking of a single running container.
///
/// Samples are forwarded to the aggregation identified by `aggregate_key`,
/// which the caller looks up in the cluster state.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerState {
    /// Current request of the container.
    pub request: ResourceList,
    pub last_cpu_sample_start: Option<NaiveDateTime>,
    pub last_memory_sample_start: Option<NaiveDateTime>,
    /// Peak memory usage in the current window.
    pub memory_peak: i64,
    /// Memory needed by the container according to an OOM in the current window.
    pub oom_peak: i64,
    /// End of the current memory aggregation window, exclusive.
    /// The window starts `memory_aggregation_interval` before.
    pub window_end: Option<NaiveDateTime>,
    pub aggregate_key: AggregateStateKey,
}

impl ContainerState {
    pub fn new(request: ResourceList, aggregate_key: AggregateStateKey) -> Self {
        ContainerState {
            request,
            last_cpu_sample_start: None,
            last_memory_sample_start: None,
            memory_peak: 0,
            oom_peak: 0,
            window_end: None,
            aggregate_key,
        }
    }

    pub fn max_memory_peak(&self) -> i64 {
        self.memory_peak.max(self.oom_peak)
    }

    /// Add a usage sample. Returns false when the sample was discarded
    /// for being invalid, duplicated or out of order.
    pub fn add_sample(
        &mut self,
        sample: &ContainerUsageSample,
        aggregate: &mut AggregateContainerState,
        config: &AggregationsConfig,
    ) -> bool {
        let sample = ContainerUsageSample {
            request: self.request.get(&sample.resource).cloned().unwrap_or(0),
            ..sample.to_owned()
        };
        match sample.resource {
            Resource::CPU => self.add_cpu_sample(&sample, aggregate),
            Resource::Memory => self.add_memory_sample(&sample, false, aggregate, config),
        }
    }

    fn add_cpu_sample(
        &mut self,
        sample: &ContainerUsageSample,
        aggregate: &mut AggregateContainerState,
    ) -> bool {
        if sample.usage < 0
            || self
                .last_cpu_sample_start
                .map_or(false, |last| sample.measure_start <= last)
        {
            return false;
        }
        aggregate.add_sample(sample);
        self.last_cpu_sample_start = Some(sample.measure_start);
        true
    }

    fn add_memory_sample(
        &mut self,
        sample: &ContainerUsageSample,
        is_oom: bool,
        aggregate: &mut AggregateContainerState,
        config: &AggregationsConfig,
    ) -> bool {
        let ts = sample.measure_start;
        // OOM samples are always processed
        if sample.usage < 0
            || (!is_oom
                && self
                    .last_memory_sample_start
                    .map_or(false, |last| ts < last))
        {
            return false;
        }
        self.last_memory_sample_start = Some(ts);
        let window_end = *self.window_end.get_or_insert(ts);

        // One peak per window: a higher sample inside the current window
        // replaces the peak already added to the aggregation.
        let mut add_new_peak = false;
        if ts < window_end {
            let old_max = self.max_memory_peak();
            if old_max != 0 && sample.usage > old_max {
                aggregate.subtract_sample(&ContainerUsageSample {
                    measure_start: window_end,
                    usage: old_max,
                    request: sample.request,
                    resource: Resource::Memory,
                });
                add_new_peak = true;
            }
        } else {
            let interval = config.memory_aggregation_interval;
            let shift = truncate(ts - window_end, interval) + interval;
            self.window_end = Some(window_end + shift);
            self.memory_peak = 0;
            self.oom_peak = 0;
            add_new_peak = true;
        }

        if add_new_peak {
            aggregate.add_sample(&ContainerUsageSample {
                measure_start: self.window_end.unwrap_or(window_end),
                usage: sample.usage,
                request: sample.request,
                resource: Resource::Memory,
            });
            if is_oom {
                self.oom_peak = sample.usage;
            } else {
                self.memory_peak = sample.usage;
            }
        }
        true
    }

    /// Record an OOM kill as a memory sample, bumped up above the memory in use.
    pub fn record_oom(
        &mut self,
        timestamp: NaiveDateTime,
        requested_memory: i64,
        aggregate: &mut AggregateContainerState,
        config: &AggregationsConfig,
    ) -> Result<(), RecommenderError> {
        if let Some(window_end) = self.window_end {
            if timestamp < window_end - config.memory_aggregation_interval {
                return Err(RecommenderError::OomDiscarded(timestamp.to_string()));
            }
        }
        // The OOM peak is left out so that subsequent OOMs don't escalate the recommendation.
        let memory_used = requested_memory.max(self.memory_peak);
        let memory_needed = (memory_used + memory_amount_from_bytes(config.oom_min_bump_up))
            .max(scale_resource(memory_used, config.oom_bump_up_ratio));
        let sample = ContainerUsageSample {
            measure_start: timestamp,
            usage: memory_needed,
            request: requested_memory,
            resource: Resource::Memory,
        };
        if !self.add_memory_sample(&sample, true, aggregate, config) {
            return Err(RecommenderError::SampleDiscarded);
        }
        Ok(())
    }
}

/// Round a non-negative duration down to a multiple of `unit`.
fn truncate(duration: Duration, unit: Duration) -> Duration {
    let unit_ms = unit.num_milliseconds();
    if unit_ms <= 0 {
        return duration;
    }
    let ms = duration.num_milliseconds();
    Duration::milliseconds(ms - ms % unit_ms)
}
