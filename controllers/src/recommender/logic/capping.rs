use resources::objects::{
    metrics::ResourceList,
    mpa::{
        ContainerResourcePolicy, ContainerScalingMode, PodResourcePolicy, RecommendedContainerResources,
        RecommendedPodResources,
    },
};

use super::recommender::RecommendedPodResourcesMap;

fn clamp(amounts: &mut ResourceList, policy: &ContainerResourcePolicy) {
    for (resource, amount) in amounts.iter_mut() {
        if let Some(min) = policy.min_allowed.get(resource) {
            if *amount < *min {
                *amount = *min;
            }
        }
        if let Some(max) = policy.max_allowed.get(resource) {
            if *amount > *max {
                *amount = *max;
            }
        }
    }
}

fn apply_container_policy(
    mut recommendation: RecommendedContainerResources,
    policy: Option<&ContainerResourcePolicy>,
) -> RecommendedContainerResources {
    recommendation.uncapped_target = recommendation.target.to_owned();
    if let Some(policy) = policy {
        clamp(&mut recommendation.target, policy);
        clamp(&mut recommendation.lower_bound, policy);
        clamp(&mut recommendation.upper_bound, policy);
    }
    recommendation
}

/// Clamp the recommendations into the bounds of the resource policy.
/// The uncapped target keeps the value before clamping.
/// Containers with scaling turned off get no recommendation.
pub fn apply_policy(
    recommendations: RecommendedPodResourcesMap,
    policy: Option<&PodResourcePolicy>,
) -> RecommendedPodResources {
    let mut container_recommendations = recommendations
        .into_values()
        .filter_map(|recommendation| {
            let container_policy =
                policy.and_then(|p| p.container_policy(&recommendation.container_name));
            if container_policy.and_then(|p| p.mode) == Some(ContainerScalingMode::Off) {
                return None;
            }
            Some(apply_container_policy(recommendation, container_policy))
        })
        .collect::<Vec<_>>();
    container_recommendations.sort_by(|a, b| a.container_name.cmp(&b.container_name));
    RecommendedPodResources {
        container_recommendations,
    }
}
