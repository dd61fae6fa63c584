use std::collections::BTreeMap;

use resources::{
    config::recommender::RecommenderConfig,
    objects::{
        metrics::{Resource, ResourceList},
        mpa::RecommendedContainerResources,
    },
};

use super::estimator::{
    ConfidenceMultiplier, MarginEstimator, MinResourcesEstimator, PercentileEstimator,
    ResourceEstimator,
};
use crate::model::{
    aggregation::AggregateContainerState, cpu_amount_from_cores, memory_amount_from_bytes,
};

/// Recommendations by container name, before capping.
pub type RecommendedPodResourcesMap = BTreeMap<String, RecommendedContainerResources>;

/// Computes target, lower and upper bound resources for the containers of a pod.
pub struct PodResourceRecommender {
    target_estimator: Box<dyn ResourceEstimator>,
    lower_bound_estimator: Box<dyn ResourceEstimator>,
    upper_bound_estimator: Box<dyn ResourceEstimator>,
    pod_min_cpu_millicores: f64,
    pod_min_memory_mb: f64,
}

impl PodResourceRecommender {
    pub fn new(config: &RecommenderConfig) -> Self {
        let percentile = |cpu_percentile, memory_percentile| -> Box<dyn ResourceEstimator> {
            Box::new(MarginEstimator {
                margin_fraction: config.recommendation_margin_fraction,
                base: Box::new(PercentileEstimator {
                    cpu_percentile,
                    memory_percentile,
                }),
            })
        };
        let target_estimator = percentile(
            config.target_cpu_percentile,
            config.target_memory_percentile,
        );
        let lower_bound_estimator = Box::new(ConfidenceMultiplier {
            multiplier: 0.001,
            exponent: -2.0,
            base: percentile(
                config.lower_bound_cpu_percentile,
                config.lower_bound_memory_percentile,
            ),
        });
        let upper_bound_estimator = Box::new(ConfidenceMultiplier {
            multiplier: 1.0,
            exponent: 1.0,
            base: percentile(
                config.upper_bound_cpu_percentile,
                config.upper_bound_memory_percentile,
            ),
        });
        Self {
            target_estimator,
            lower_bound_estimator,
            upper_bound_estimator,
            pod_min_cpu_millicores: config.pod_min_cpu_millicores,
            pod_min_memory_mb: config.pod_min_memory_mb,
        }
    }

    /// Recommendations for every container of the pod.
    /// The pod minimum is shared evenly between the containers.
    pub fn get_recommended_pod_resources(
        &self,
        states: &BTreeMap<String, AggregateContainerState>,
    ) -> RecommendedPodResourcesMap {
        if states.is_empty() {
            return RecommendedPodResourcesMap::new();
        }
        let fraction = 1.0 / states.len() as f64;
        let min_resources = ResourceList::from([
            (
                Resource::CPU,
                cpu_amount_from_cores(self.pod_min_cpu_millicores * fraction / 1000.0),
            ),
            (
                Resource::Memory,
                memory_amount_from_bytes(self.pod_min_memory_mb * 1024.0 * 1024.0 * fraction),
            ),
        ]);
        states
            .iter()
            .map(|(container_name, state)| {
                let estimate = |base: &dyn ResourceEstimator| {
                    let estimator = MinResourcesEstimator {
                        min_resources: min_resources.to_owned(),
                        base,
                    };
                    filter_controlled_resources(
                        estimator.get_resource_estimation(state),
                        &state.controlled_resources(),
                    )
                };
                let target = estimate(self.target_estimator.as_ref());
                (
                    container_name.to_owned(),
                    RecommendedContainerResources {
                        container_name: container_name.to_owned(),
                        uncapped_target: target.to_owned(),
                        target,
                        lower_bound: estimate(self.lower_bound_estimator.as_ref()),
                        upper_bound: estimate(self.upper_bound_estimator.as_ref()),
                    },
                )
            })
            .collect()
    }
}

fn filter_controlled_resources(amounts: ResourceList, controlled: &[Resource]) -> ResourceList {
    amounts
        .into_iter()
        .filter(|(resource, _)| controlled.contains(resource))
        .collect()
}
