use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDateTime;
use resources::objects::{
    hpa::{HorizontalPodAutoscalerBehavior, MetricSpec, MetricStatus},
    labels::Selector,
    mpa::{
        ConditionType, ContainerScalingMode, MultidimPodAutoscalerStatus, PodResourcePolicy,
        PodUpdatePolicy, RecommendedPodResources, UpdateMode,
    },
    object_reference::CrossVersionObjectReference,
    Labels,
};

use super::{
    aggregation::{aggregate_state_by_container_name, AggregateContainerState, AggregationsConfig},
    conditions::ConditionsMap,
    AggregateStateKey, MpaId,
};

pub type AggregateStateMap = HashMap<AggregateStateKey, AggregateContainerState>;

/// The recommender's view of a MultidimPodAutoscaler object.
///
/// Aggregations are not owned: the MPA keeps the keys of the
/// aggregations matching its selector, the states live in the cluster state.
#[derive(Debug, Clone)]
pub struct Mpa {
    pub id: MpaId,
    /// Pods whose labels match are controlled by this MPA.
    pub pod_selector: Selector,
    pub annotations: BTreeMap<String, String>,
    pub conditions: ConditionsMap,
    /// Most recently computed recommendation. Can be None.
    pub recommendation: Option<RecommendedPodResources>,
    aggregate_container_states: BTreeSet<AggregateStateKey>,
    pub resource_policy: Option<PodResourcePolicy>,
    /// Aggregations restored from checkpoints at startup, keyed by container name.
    /// Merged into the live aggregations when computing recommendations.
    pub containers_initial_aggregate_state: BTreeMap<String, AggregateContainerState>,
    pub update_mode: Option<UpdateMode>,
    pub created: NaiveDateTime,
    pub checkpoint_written: Option<NaiveDateTime>,
    pub scale_target_ref: Option<CrossVersionObjectReference>,
    /// Number of tracked pods matching the selector.
    pub pod_count: usize,

    pub metrics: Vec<MetricSpec>,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub behavior: Option<HorizontalPodAutoscalerBehavior>,
    pub desired_replicas: i32,
    pub current_metrics: Vec<MetricStatus>,
}

impl Mpa {
    pub fn new(id: MpaId, pod_selector: Selector, created: NaiveDateTime) -> Self {
        Mpa {
            id,
            pod_selector,
            annotations: BTreeMap::new(),
            conditions: ConditionsMap::new(),
            recommendation: None,
            aggregate_container_states: BTreeSet::new(),
            resource_policy: None,
            containers_initial_aggregate_state: BTreeMap::new(),
            update_mode: None,
            created,
            checkpoint_written: None,
            scale_target_ref: None,
            pod_count: 0,
            metrics: vec![],
            min_replicas: 1,
            max_replicas: 0,
            behavior: None,
            desired_replicas: 0,
            current_metrics: vec![],
        }
    }

    pub fn uses_aggregation(&self, key: &AggregateStateKey) -> bool {
        self.aggregate_container_states.contains(key)
    }

    pub fn aggregation_keys(&self) -> impl Iterator<Item = &AggregateStateKey> {
        self.aggregate_container_states.iter()
    }

    /// Whether pods with the given labels in the given namespace belong to this MPA.
    pub fn matches_pod(&self, namespace: &str, labels: &Labels) -> bool {
        self.id.namespace == namespace && self.pod_selector.matches(labels)
    }

    /// Link the aggregation if it matches this MPA and isn't linked yet.
    /// The aggregation takes over the update mode and the container policy.
    pub fn use_aggregation_if_matching(
        &mut self,
        key: &AggregateStateKey,
        labels: &Labels,
        state: &mut AggregateContainerState,
    ) {
        if self.uses_aggregation(key) || !self.matches_pod(&key.namespace, labels) {
            return;
        }
        self.aggregate_container_states.insert(key.to_owned());
        state.is_under_mpa = true;
        state.update_mode = self.update_mode;
        state.update_from_policy(
            self.resource_policy
                .as_ref()
                .and_then(|p| p.container_policy(&key.container_name)),
        );
    }

    /// Unlink an aggregation. Returns whether it was linked.
    pub fn delete_aggregation(&mut self, key: &AggregateStateKey) -> bool {
        self.aggregate_container_states.remove(key)
    }

    /// Replace the resource policy, re-applying it to every linked aggregation on change.
    pub fn set_resource_policy(
        &mut self,
        policy: Option<&PodResourcePolicy>,
        states: &mut AggregateStateMap,
    ) {
        if self.resource_policy.as_ref() == policy {
            return;
        }
        self.resource_policy = policy.cloned();
        for key in &self.aggregate_container_states {
            if let Some(state) = states.get_mut(key) {
                state.update_from_policy(
                    self.resource_policy
                        .as_ref()
                        .and_then(|p| p.container_policy(&key.container_name)),
                );
            }
        }
    }

    pub fn set_update_mode(
        &mut self,
        update_policy: Option<&PodUpdatePolicy>,
        states: &mut AggregateStateMap,
    ) {
        let update_mode = update_policy.and_then(|p| p.update_mode);
        if update_policy.is_some() && update_mode == self.update_mode {
            return;
        }
        self.update_mode = update_mode;
        for key in &self.aggregate_container_states {
            if let Some(state) = states.get_mut(key) {
                state.update_mode = update_mode;
            }
        }
    }

    /// Store a new recommendation, remembering the uncapped targets on the aggregations.
    pub fn update_recommendation(
        &mut self,
        recommendation: Option<RecommendedPodResources>,
        states: &mut AggregateStateMap,
    ) {
        if let Some(recommendation) = &recommendation {
            for container in &recommendation.container_recommendations {
                for key in &self.aggregate_container_states {
                    if key.container_name != container.container_name {
                        continue;
                    }
                    if let Some(state) = states.get_mut(key) {
                        state.last_recommendation = Some(container.uncapped_target.to_owned());
                    }
                }
            }
        }
        self.recommendation = recommendation;
    }

    pub fn has_recommendation(&self) -> bool {
        self.recommendation
            .as_ref()
            .map_or(false, |r| !r.container_recommendations.is_empty())
    }

    pub fn has_matched_pods(&self) -> bool {
        self.pod_count > 0
    }

    pub fn update_conditions(&mut self, pods_matched: bool, now: NaiveDateTime) {
        let (reason, message) = if pods_matched {
            self.conditions.delete(ConditionType::NoPodsMatched);
            ("", "")
        } else {
            let reason = "NoPodsMatched";
            let message = "No pods match this MPA object";
            self.conditions
                .set(ConditionType::NoPodsMatched, true, reason, message, now);
            (reason, message)
        };
        if self.has_recommendation() {
            self.conditions
                .set(ConditionType::RecommendationProvided, true, "", "", now);
        } else {
            self.conditions.set(
                ConditionType::RecommendationProvided,
                false,
                reason,
                message,
                now,
            );
        }
    }

    /// The vertical part of the status. Horizontal fields are kept from `observed`.
    pub fn as_status(&self, observed: &MultidimPodAutoscalerStatus) -> MultidimPodAutoscalerStatus {
        MultidimPodAutoscalerStatus {
            recommendation: self.recommendation.to_owned(),
            conditions: self.conditions.as_list(),
            ..observed.to_owned()
        }
    }

    /// Linked aggregations merged by container name,
    /// with the checkpointed initial states merged in.
    pub fn aggregate_state_by_container_name(
        &self,
        states: &AggregateStateMap,
        config: &AggregationsConfig,
        now: NaiveDateTime,
    ) -> BTreeMap<String, AggregateContainerState> {
        let linked = self
            .aggregate_container_states
            .iter()
            .filter_map(|key| {
                states
                    .get(key)
                    .map(|state| (key.container_name.as_str(), state))
            });
        let mut by_name = aggregate_state_by_container_name(linked, config, now);
        for (container_name, initial) in &self.containers_initial_aggregate_state {
            by_name
                .entry(container_name.to_owned())
                .or_insert_with(|| AggregateContainerState::new(config, now))
                .merge_container_state(initial);
        }
        by_name
    }

    /// Merged aggregations of the containers that need a recommendation:
    /// scaling not turned off by policy and at least one sample seen.
    pub fn recommendable_aggregate_states(
        &self,
        states: &AggregateStateMap,
        config: &AggregationsConfig,
        now: NaiveDateTime,
    ) -> BTreeMap<String, AggregateContainerState> {
        self.aggregate_state_by_container_name(states, config, now)
            .into_iter()
            .filter_map(|(container_name, mut state)| {
                let policy = self
                    .resource_policy
                    .as_ref()
                    .and_then(|p| p.container_policy(&container_name));
                let disabled = policy.and_then(|p| p.mode) == Some(ContainerScalingMode::Off);
                if disabled || state.total_samples_count == 0 {
                    return None;
                }
                state.update_from_policy(policy);
                Some((container_name, state))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use resources::objects::{
        metrics::{Resource, ResourceList},
        mpa::{ContainerResourcePolicy, RecommendedContainerResources},
    };

    use super::*;
    use crate::model::ContainerUsageSample;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 6, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    fn key(container: &str) -> AggregateStateKey {
        AggregateStateKey {
            namespace: "default".to_string(),
            container_name: container.to_string(),
            labels_key: "app=web".to_string(),
        }
    }

    fn web_mpa() -> Mpa {
        Mpa::new(
            MpaId::new("default", "web"),
            Selector::parse("app=web").unwrap(),
            now(),
        )
    }

    fn sampled_state(config: &AggregationsConfig) -> AggregateContainerState {
        let mut state = AggregateContainerState::new(config, now());
        state.add_sample(&ContainerUsageSample {
            measure_start: now(),
            usage: 500,
            request: 1000,
            resource: Resource::CPU,
        });
        state
    }

    #[test]
    fn links_only_matching_aggregations() {
        let config = AggregationsConfig::default();
        let mut mpa = web_mpa();
        let labels = Labels::from([("app", "web")]);
        let mut state = AggregateContainerState::new(&config, now());
        mpa.use_aggregation_if_matching(&key("app"), &labels, &mut state);
        assert!(mpa.uses_aggregation(&key("app")));
        assert!(state.is_under_mpa);
        assert_eq!(state.scaling_mode, Some(ContainerScalingMode::Auto));

        let mut other = AggregateContainerState::new(&config, now());
        let other_key = AggregateStateKey {
            namespace: "prod".to_string(),
            ..key("app")
        };
        mpa.use_aggregation_if_matching(&other_key, &labels, &mut other);
        assert!(!mpa.uses_aggregation(&other_key));
        assert!(!other.is_under_mpa);
    }

    #[test]
    fn policy_change_propagates_to_aggregations() {
        let config = AggregationsConfig::default();
        let mut states = AggregateStateMap::new();
        let mut mpa = web_mpa();
        let mut state = AggregateContainerState::new(&config, now());
        mpa.use_aggregation_if_matching(&key("app"), &Labels::from([("app", "web")]), &mut state);
        states.insert(key("app"), state);

        let policy = PodResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: "*".to_string(),
                mode: Some(ContainerScalingMode::Off),
                controlled_resources: Some(vec![Resource::Memory]),
                ..Default::default()
            }],
        };
        mpa.set_resource_policy(Some(&policy), &mut states);
        let state = &states[&key("app")];
        assert_eq!(state.scaling_mode, Some(ContainerScalingMode::Off));
        assert_eq!(state.controlled_resources(), vec![Resource::Memory]);

        mpa.set_update_mode(
            Some(&PodUpdatePolicy {
                update_mode: Some(UpdateMode::Initial),
            }),
            &mut states,
        );
        assert_eq!(states[&key("app")].update_mode, Some(UpdateMode::Initial));
    }

    #[test]
    fn conditions_without_pods() {
        let mut mpa = web_mpa();
        mpa.update_conditions(false, now());
        assert!(mpa.conditions.is_true(ConditionType::NoPodsMatched));
        let provided = mpa
            .conditions
            .get(ConditionType::RecommendationProvided)
            .unwrap();
        assert_eq!(provided.reason, "NoPodsMatched");
        assert!(!mpa.conditions.is_true(ConditionType::RecommendationProvided));

        let mut states = AggregateStateMap::new();
        mpa.update_recommendation(
            Some(RecommendedPodResources {
                container_recommendations: vec![RecommendedContainerResources {
                    container_name: "app".to_string(),
                    ..Default::default()
                }],
            }),
            &mut states,
        );
        mpa.update_conditions(true, now());
        assert!(mpa.conditions.get(ConditionType::NoPodsMatched).is_none());
        assert!(mpa.conditions.is_true(ConditionType::RecommendationProvided));
    }

    #[test]
    fn recommendation_is_remembered_on_aggregations() {
        let config = AggregationsConfig::default();
        let mut states = AggregateStateMap::new();
        let mut mpa = web_mpa();
        let mut state = AggregateContainerState::new(&config, now());
        mpa.use_aggregation_if_matching(&key("app"), &Labels::from([("app", "web")]), &mut state);
        states.insert(key("app"), state);

        let target = ResourceList::from([(Resource::CPU, 100)]);
        mpa.update_recommendation(
            Some(RecommendedPodResources {
                container_recommendations: vec![RecommendedContainerResources {
                    container_name: "app".to_string(),
                    uncapped_target: target.clone(),
                    ..Default::default()
                }],
            }),
            &mut states,
        );
        assert_eq!(states[&key("app")].last_recommendation, Some(target));
        assert!(mpa.has_recommendation());
    }

    #[test]
    fn initial_states_are_merged_and_filtered() {
        let config = AggregationsConfig::default();
        let mut states = AggregateStateMap::new();
        let mut mpa = web_mpa();
        let labels = Labels::from([("app", "web")]);
        for name in ["app", "sidecar"] {
            let mut state = AggregateContainerState::new(&config, now());
            mpa.use_aggregation_if_matching(&key(name), &labels, &mut state);
            states.insert(key(name), state);
        }
        states.insert(key("app"), sampled_state(&config));
        mpa.containers_initial_aggregate_state
            .insert("app".to_string(), sampled_state(&config));
        mpa.containers_initial_aggregate_state
            .insert("restored".to_string(), sampled_state(&config));

        let merged = mpa.aggregate_state_by_container_name(&states, &config, now());
        assert_eq!(merged.len(), 3);
        assert_eq!(merged["app"].total_samples_count, 2);

        // The sidecar has no samples yet
        let recommendable = mpa.recommendable_aggregate_states(&states, &config, now());
        assert_eq!(
            recommendable.keys().cloned().collect::<Vec<_>>(),
            vec!["app".to_string(), "restored".to_string()]
        );

        mpa.resource_policy = Some(PodResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: "restored".to_string(),
                mode: Some(ContainerScalingMode::Off),
                ..Default::default()
            }],
        });
        let recommendable = mpa.recommendable_aggregate_states(&states, &config, now());
        assert_eq!(recommendable.keys().collect::<Vec<_>>(), vec!["app"]);
    }
}
