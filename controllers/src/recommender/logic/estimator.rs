use resources::objects::metrics::{Resource, ResourceList};

use crate::model::{
    aggregation::AggregateContainerState, cpu_amount_from_cores, histogram::Histogram,
    memory_amount_from_bytes, scale_resource,
};

/// Computes a resource amount for each resource from the usage history of a container.
pub trait ResourceEstimator: Send + Sync {
    fn get_resource_estimation(&self, state: &AggregateContainerState) -> ResourceList;
}

/// Picks a percentile of the CPU usage and memory peak distributions.
pub struct PercentileEstimator {
    pub cpu_percentile: f64,
    pub memory_percentile: f64,
}

impl ResourceEstimator for PercentileEstimator {
    fn get_resource_estimation(&self, state: &AggregateContainerState) -> ResourceList {
        ResourceList::from([
            (
                Resource::CPU,
                cpu_amount_from_cores(state.aggregate_cpu_usage.percentile(self.cpu_percentile)),
            ),
            (
                Resource::Memory,
                memory_amount_from_bytes(
                    state
                        .aggregate_memory_peaks
                        .percentile(self.memory_percentile),
                ),
            ),
        ])
    }
}

/// Adds a safety margin to the estimation of the base estimator.
pub struct MarginEstimator {
    pub margin_fraction: f64,
    pub base: Box<dyn ResourceEstimator>,
}

impl ResourceEstimator for MarginEstimator {
    fn get_resource_estimation(&self, state: &AggregateContainerState) -> ResourceList {
        self.base
            .get_resource_estimation(state)
            .into_iter()
            .map(|(resource, amount)| (resource, scale_resource(amount, 1.0 + self.margin_fraction)))
            .collect()
    }
}

/// Scales the base estimation by `(1 + multiplier / confidence) ^ exponent`,
/// so the estimation widens while little history is available.
pub struct ConfidenceMultiplier {
    pub multiplier: f64,
    pub exponent: f64,
    pub base: Box<dyn ResourceEstimator>,
}

/// Days of history backing the aggregation, measured both by its time span
/// and by its sample count at one sample per minute.
pub fn confidence(state: &AggregateContainerState) -> f64 {
    let life_span_days = match (state.first_sample_start, state.last_sample_start) {
        (Some(first), Some(last)) => (last - first).num_seconds() as f64 / (24.0 * 3600.0),
        _ => 0.0,
    };
    let samples_days = state.total_samples_count as f64 / (60.0 * 24.0);
    life_span_days.min(samples_days)
}

impl ResourceEstimator for ConfidenceMultiplier {
    fn get_resource_estimation(&self, state: &AggregateContainerState) -> ResourceList {
        let factor = (1.0 + self.multiplier / confidence(state)).powf(self.exponent);
        self.base
            .get_resource_estimation(state)
            .into_iter()
            .map(|(resource, amount)| (resource, scale_resource(amount, factor)))
            .collect()
    }
}

/// Raises the base estimation to at least the given amounts.
pub struct MinResourcesEstimator<'a> {
    pub min_resources: ResourceList,
    pub base: &'a dyn ResourceEstimator,
}

impl ResourceEstimator for MinResourcesEstimator<'_> {
    fn get_resource_estimation(&self, state: &AggregateContainerState) -> ResourceList {
        self.base
            .get_resource_estimation(state)
            .into_iter()
            .map(|(resource, amount)| {
                let min = self.min_resources.get(&resource).cloned().unwrap_or(0);
                (resource, amount.max(min))
            })
            .collect()
    }
}
