use std::collections::{HashMap, HashSet};

use chrono::{Duration, NaiveDateTime};
use resources::objects::{
    labels::Selector,
    metrics::ResourceList,
    mpa::{ConditionType, MultidimPodAutoscaler},
    pod::PodPhase,
    Labels,
};

use super::{
    aggregation::{AggregateContainerState, AggregationsConfig},
    conditions::ConditionsMap,
    container::ContainerState,
    mpa::{AggregateStateMap, Mpa},
    AggregateStateKey, ContainerId, ContainerUsageSampleWithKey, MpaId, PodId,
};
use crate::{
    error::RecommenderError,
    target::{ControllerFetcher, ControllerKeyWithApiVersion},
};

/// After this long without a recommendation an MPA is reported.
pub const RECOMMENDATION_MISSING_MAX_DURATION_MINUTES: i64 = 30;

#[derive(Debug, Clone)]
pub struct PodState {
    pub id: PodId,
    /// Interned labels of the pod, see [`ClusterState::label_set`].
    pub labels_key: String,
    pub containers: HashMap<String, ContainerState>,
    pub phase: PodPhase,
}

impl PodState {
    fn new(id: PodId) -> Self {
        PodState {
            id,
            labels_key: String::new(),
            containers: HashMap::new(),
            phase: PodPhase::Pending,
        }
    }

    pub fn aggregate_state_key(&self, container_name: &str) -> AggregateStateKey {
        AggregateStateKey {
            namespace: self.id.namespace.to_owned(),
            container_name: container_name.to_string(),
            labels_key: self.labels_key.to_owned(),
        }
    }

    fn is_active(&self) -> bool {
        self.phase != PodPhase::Succeeded && self.phase != PodPhase::Failed
    }
}

/// Everything the recommender knows about the cluster:
/// pods, MPAs and the aggregated usage of containers.
pub struct ClusterState {
    pub pods: HashMap<PodId, PodState>,
    pub mpas: HashMap<MpaId, Mpa>,
    /// MPAs without a recommendation, with the time they were last reported.
    pub empty_mpas: HashMap<MpaId, NaiveDateTime>,
    /// MPA objects as last listed from the API server.
    pub observed_mpas: Vec<MultidimPodAutoscaler>,

    aggregate_state_map: AggregateStateMap,
    label_set_map: HashMap<String, Labels>,

    last_aggregate_container_state_gc: NaiveDateTime,
    gc_interval: Duration,
    config: AggregationsConfig,
}

impl ClusterState {
    pub fn new(gc_interval: Duration, config: AggregationsConfig) -> Self {
        ClusterState {
            pods: HashMap::new(),
            mpas: HashMap::new(),
            empty_mpas: HashMap::new(),
            observed_mpas: vec![],
            aggregate_state_map: HashMap::new(),
            label_set_map: HashMap::new(),
            last_aggregate_container_state_gc: NaiveDateTime::from_timestamp(0, 0),
            gc_interval,
            config,
        }
    }

    pub fn config(&self) -> &AggregationsConfig {
        &self.config
    }

    pub fn state_map_size(&self) -> usize {
        self.aggregate_state_map.len()
    }

    pub fn aggregate_states(&self) -> &AggregateStateMap {
        &self.aggregate_state_map
    }

    /// Borrow an MPA together with the aggregations it refers to.
    pub fn mpa_with_aggregates(&mut self, id: &MpaId) -> Option<(&mut Mpa, &mut AggregateStateMap)> {
        let mpa = self.mpas.get_mut(id)?;
        Some((mpa, &mut self.aggregate_state_map))
    }

    pub fn label_set(&self, labels_key: &str) -> Option<&Labels> {
        self.label_set_map.get(labels_key)
    }

    fn intern_labels(&mut self, labels: &Labels) -> String {
        let key = labels.to_string();
        self.label_set_map
            .entry(key.to_owned())
            .or_insert_with(|| labels.to_owned());
        key
    }

    /// Add a pod or update its labels and phase.
    /// On a label change the containers move to the aggregations of the new labels.
    pub fn add_or_update_pod(
        &mut self,
        pod_id: &PodId,
        labels: &Labels,
        phase: PodPhase,
        now: NaiveDateTime,
    ) {
        let labels_key = self.intern_labels(labels);
        let old_labels_key = match self.pods.get(pod_id) {
            Some(pod) => Some(pod.labels_key.to_owned()),
            None => {
                self.pods
                    .insert(pod_id.to_owned(), PodState::new(pod_id.to_owned()));
                None
            },
        };

        if old_labels_key.as_ref() != Some(&labels_key) {
            if let Some(old) = &old_labels_key {
                self.update_pod_count(&pod_id.namespace, old, false);
            }
            let container_names = match self.pods.get_mut(pod_id) {
                Some(pod) => {
                    pod.labels_key = labels_key.to_owned();
                    pod.containers.keys().cloned().collect::<Vec<_>>()
                },
                None => vec![],
            };
            for container_name in container_names {
                let key = self.find_or_create_aggregate(
                    AggregateStateKey {
                        namespace: pod_id.namespace.to_owned(),
                        container_name: container_name.to_owned(),
                        labels_key: labels_key.to_owned(),
                    },
                    now,
                );
                if let Some(container) = self
                    .pods
                    .get_mut(pod_id)
                    .and_then(|pod| pod.containers.get_mut(&container_name))
                {
                    container.aggregate_key = key;
                }
            }
            self.update_pod_count(&pod_id.namespace, &labels_key, true);
        }

        if let Some(pod) = self.pods.get_mut(pod_id) {
            pod.phase = phase;
        }
    }

    fn update_pod_count(&mut self, namespace: &str, labels_key: &str, increment: bool) {
        let labels = match self.label_set_map.get(labels_key) {
            Some(labels) => labels,
            None => return,
        };
        for mpa in self.mpas.values_mut() {
            if mpa.matches_pod(namespace, labels) {
                if increment {
                    mpa.pod_count += 1;
                } else {
                    mpa.pod_count = mpa.pod_count.saturating_sub(1);
                }
            }
        }
    }

    pub fn get_container(&self, container_id: &ContainerId) -> Option<&ContainerState> {
        self.pods
            .get(&container_id.pod_id)
            .and_then(|pod| pod.containers.get(&container_id.container_name))
    }

    pub fn delete_pod(&mut self, pod_id: &PodId) {
        if let Some(pod) = self.pods.remove(pod_id) {
            self.update_pod_count(&pod.id.namespace, &pod.labels_key, false);
        }
    }

    /// Add a container to a known pod, or update its request.
    pub fn add_or_update_container(
        &mut self,
        container_id: &ContainerId,
        request: ResourceList,
        now: NaiveDateTime,
    ) -> Result<(), RecommenderError> {
        let pod = self
            .pods
            .get_mut(&container_id.pod_id)
            .ok_or_else(|| RecommenderError::KeyError(container_id.pod_id.to_string()))?;
        if let Some(container) = pod.containers.get_mut(&container_id.container_name) {
            container.request = request;
            return Ok(());
        }
        let key = pod.aggregate_state_key(&container_id.container_name);
        let key = self.find_or_create_aggregate(key, now);
        if let Some(pod) = self.pods.get_mut(&container_id.pod_id) {
            pod.containers.insert(
                container_id.container_name.to_owned(),
                ContainerState::new(request, key),
            );
        }
        Ok(())
    }

    /// Feed a usage sample to its container.
    pub fn add_sample(&mut self, sample: &ContainerUsageSampleWithKey) -> Result<(), RecommenderError> {
        let key = self.container_aggregate_key(&sample.container)?;
        self.find_or_create_aggregate(key.to_owned(), sample.sample.measure_start);
        let config = self.config;
        let (container, aggregate) = self.container_with_aggregate(&sample.container, &key)?;
        if !container.add_sample(&sample.sample, aggregate, &config) {
            return Err(RecommenderError::SampleDiscarded);
        }
        Ok(())
    }

    /// Record an OOM kill of a container as a bumped up memory sample.
    pub fn record_oom(
        &mut self,
        container_id: &ContainerId,
        timestamp: NaiveDateTime,
        requested_memory: i64,
    ) -> Result<(), RecommenderError> {
        let key = self.container_aggregate_key(container_id)?;
        self.find_or_create_aggregate(key.to_owned(), timestamp);
        let config = self.config;
        let (container, aggregate) = self.container_with_aggregate(container_id, &key)?;
        container.record_oom(timestamp, requested_memory, aggregate, &config)
    }

    fn container_aggregate_key(
        &self,
        container_id: &ContainerId,
    ) -> Result<AggregateStateKey, RecommenderError> {
        let pod = self
            .pods
            .get(&container_id.pod_id)
            .ok_or_else(|| RecommenderError::KeyError(container_id.pod_id.to_string()))?;
        let container = pod
            .containers
            .get(&container_id.container_name)
            .ok_or_else(|| RecommenderError::KeyError(container_id.to_string()))?;
        Ok(container.aggregate_key.to_owned())
    }

    fn container_with_aggregate(
        &mut self,
        container_id: &ContainerId,
        key: &AggregateStateKey,
    ) -> Result<(&mut ContainerState, &mut AggregateContainerState), RecommenderError> {
        let container = self
            .pods
            .get_mut(&container_id.pod_id)
            .and_then(|pod| pod.containers.get_mut(&container_id.container_name))
            .ok_or_else(|| RecommenderError::KeyError(container_id.to_string()))?;
        let aggregate = self
            .aggregate_state_map
            .get_mut(key)
            .ok_or_else(|| RecommenderError::KeyError(key.to_string()))?;
        Ok((container, aggregate))
    }

    /// Return the key of the aggregation, creating and linking it to matching MPAs if needed.
    fn find_or_create_aggregate(
        &mut self,
        key: AggregateStateKey,
        now: NaiveDateTime,
    ) -> AggregateStateKey {
        if !self.aggregate_state_map.contains_key(&key) {
            let mut state = AggregateContainerState::new(&self.config, now);
            if let Some(labels) = self.label_set_map.get(&key.labels_key) {
                for mpa in self.mpas.values_mut() {
                    mpa.use_aggregation_if_matching(&key, labels, &mut state);
                }
            }
            self.aggregate_state_map.insert(key.to_owned(), state);
        }
        key
    }

    /// Add or update an MPA from its API object.
    /// A changed selector rebuilds the MPA from scratch.
    pub fn add_or_update_mpa(
        &mut self,
        object: &MultidimPodAutoscaler,
        selector: Selector,
        now: NaiveDateTime,
    ) -> Result<(), RecommenderError> {
        let id = MpaId::new(&object.metadata.namespace, &object.metadata.name);
        let conditions = ConditionsMap::from_list(&object.status.conditions);
        let recommendation = if conditions.is_true(ConditionType::RecommendationProvided) {
            object.status.recommendation.to_owned()
        } else {
            None
        };

        if self
            .mpas
            .get(&id)
            .map_or(false, |mpa| mpa.pod_selector != selector)
        {
            self.delete_mpa(&id)?;
        }
        if !self.mpas.contains_key(&id) {
            let created = object.metadata.creation_timestamp.unwrap_or(now);
            let mut mpa = Mpa::new(id.to_owned(), selector, created);
            for (key, state) in self.aggregate_state_map.iter_mut() {
                if let Some(labels) = self.label_set_map.get(&key.labels_key) {
                    mpa.use_aggregation_if_matching(key, labels, state);
                }
            }
            mpa.pod_count = self.get_matching_pods(&mpa).len();
            self.mpas.insert(id.to_owned(), mpa);
        }

        let mpa = self
            .mpas
            .get_mut(&id)
            .ok_or_else(|| RecommenderError::KeyError(id.to_string()))?;
        mpa.scale_target_ref = object.spec.scale_target_ref.to_owned();
        mpa.annotations = object.metadata.annotations.to_owned();
        mpa.conditions = conditions;
        mpa.recommendation = recommendation;
        mpa.set_update_mode(
            object.spec.update_policy.as_ref(),
            &mut self.aggregate_state_map,
        );
        mpa.set_resource_policy(
            object.spec.resource_policy.as_ref(),
            &mut self.aggregate_state_map,
        );

        mpa.metrics = object.spec.metrics.to_owned();
        if let Some(constraints) = &object.spec.constraints {
            mpa.min_replicas = constraints.min_replicas.unwrap_or(1);
            mpa.max_replicas = constraints.max_replicas;
            mpa.behavior = constraints.behavior.to_owned();
        }
        mpa.desired_replicas = object.status.desired_replicas;
        mpa.current_metrics = object.status.current_metrics.to_owned();
        Ok(())
    }

    /// Remove an MPA. Aggregations no other MPA refers to stop being autoscaled.
    pub fn delete_mpa(&mut self, id: &MpaId) -> Result<(), RecommenderError> {
        let mpa = self
            .mpas
            .remove(id)
            .ok_or_else(|| RecommenderError::KeyError(id.to_string()))?;
        for key in mpa.aggregation_keys() {
            if self.mpas.values().any(|other| other.uses_aggregation(key)) {
                continue;
            }
            if let Some(state) = self.aggregate_state_map.get_mut(key) {
                state.mark_not_autoscaled();
            }
        }
        self.empty_mpas.remove(id);
        Ok(())
    }

    /// Track MPAs without a recommendation.
    /// Returns an error once an MPA has lacked one for too long, then starts over.
    pub fn record_recommendation(
        &mut self,
        id: &MpaId,
        now: NaiveDateTime,
    ) -> Result<(), RecommenderError> {
        if self.mpas.get(id).map_or(false, |mpa| mpa.has_recommendation()) {
            self.empty_mpas.remove(id);
            return Ok(());
        }
        let max_duration = Duration::minutes(RECOMMENDATION_MISSING_MAX_DURATION_MINUTES);
        match self.empty_mpas.get(id) {
            None => {
                self.empty_mpas.insert(id.to_owned(), now);
            },
            Some(last_logged) if *last_logged + max_duration < now => {
                self.empty_mpas.insert(id.to_owned(), now);
                return Err(RecommenderError::MissingRecommendation {
                    namespace: id.namespace.to_owned(),
                    name: id.mpa_name.to_owned(),
                    minutes: RECOMMENDATION_MISSING_MAX_DURATION_MINUTES,
                });
            },
            Some(_) => {},
        }
        Ok(())
    }

    pub fn get_matching_pods(&self, mpa: &Mpa) -> Vec<PodId> {
        self.pods
            .values()
            .filter(|pod| {
                self.label_set_map
                    .get(&pod.labels_key)
                    .map_or(false, |labels| mpa.matches_pod(&pod.id.namespace, labels))
            })
            .map(|pod| pod.id.to_owned())
            .collect()
    }

    /// The MPA controlling the pod. With several matches the lowest id wins.
    pub fn get_controlling_mpa(&self, pod: &PodState) -> Option<&Mpa> {
        let labels = self.label_set_map.get(&pod.labels_key)?;
        self.mpas
            .values()
            .filter(|mpa| mpa.matches_pod(&pod.id.namespace, labels))
            .min_by(|a, b| a.id.cmp(&b.id))
    }

    /// The top-most controller of the scale target of the MPA controlling the pod.
    pub async fn get_controller_for_pod(
        &self,
        pod: &PodState,
        fetcher: &dyn ControllerFetcher,
    ) -> Option<ControllerKeyWithApiVersion> {
        let mpa = self.get_controlling_mpa(pod)?;
        let target = mpa.scale_target_ref.as_ref()?;
        let controller = ControllerKeyWithApiVersion::from_reference(&mpa.id.namespace, target);
        fetcher
            .find_topmost_well_known_or_scalable(&controller)
            .await
            .ok()
            .flatten()
    }

    /// Aggregations of containers of active pods,
    /// or of pods whose controller still exists.
    async fn contributive_aggregate_keys(
        &self,
        fetcher: &dyn ControllerFetcher,
    ) -> HashSet<AggregateStateKey> {
        let mut keys = HashSet::new();
        for pod in self.pods.values() {
            if pod.is_active() || self.get_controller_for_pod(pod, fetcher).await.is_some() {
                keys.extend(
                    pod.containers
                        .keys()
                        .map(|name| pod.aggregate_state_key(name)),
                );
            }
        }
        keys
    }

    pub async fn garbage_collect(&mut self, now: NaiveDateTime, fetcher: &dyn ControllerFetcher) {
        tracing::debug!("Garbage collection of aggregate container states triggered");
        let contributive = self.contributive_aggregate_keys(fetcher).await;
        let window_length = self.config.memory_aggregation_window_length();
        let keys_to_delete = self
            .aggregate_state_map
            .iter()
            .filter_map(|(key, state)| {
                if !contributive.contains(key) && state.is_empty() {
                    tracing::debug!("Removing empty and not contributive aggregation {}", key);
                    Some(key.to_owned())
                } else if state.is_expired(now, window_length) {
                    tracing::debug!("Removing expired aggregation {}", key);
                    Some(key.to_owned())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();
        for key in keys_to_delete {
            self.aggregate_state_map.remove(&key);
            for mpa in self.mpas.values_mut() {
                mpa.delete_aggregation(&key);
            }
        }
    }

    pub async fn rate_limited_garbage_collect(
        &mut self,
        now: NaiveDateTime,
        fetcher: &dyn ControllerFetcher,
    ) {
        if now - self.last_aggregate_container_state_gc < self.gc_interval {
            return;
        }
        self.garbage_collect(now, fetcher).await;
        self.last_aggregate_container_state_gc = now;
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use resources::objects::{
        metrics::Resource,
        mpa::{
            ContainerResourcePolicy, ContainerScalingMode, MultidimPodAutoscalerSpec,
            PodResourcePolicy,
        },
        object_reference::CrossVersionObjectReference,
        Metadata,
    };

    use super::*;
    use crate::model::ContainerUsageSample;

    const MIB: i64 = 1024 * 1024;

    fn time(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 6, 1)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .unwrap()
    }

    fn cluster() -> ClusterState {
        ClusterState::new(Duration::minutes(1), AggregationsConfig::default())
    }

    fn mpa_object(name: &str) -> MultidimPodAutoscaler {
        MultidimPodAutoscaler {
            metadata: Metadata::new("default", name),
            spec: MultidimPodAutoscalerSpec {
                scale_target_ref: Some(CrossVersionObjectReference::new(
                    "apps/v1",
                    "Deployment",
                    name,
                )),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn web_labels() -> Labels {
        Labels::from([("app", "web")])
    }

    fn requests() -> ResourceList {
        ResourceList::from([(Resource::CPU, 100), (Resource::Memory, 200 * MIB)])
    }

    fn cpu_sample(container: &ContainerId, hour: u32) -> ContainerUsageSampleWithKey {
        ContainerUsageSampleWithKey {
            sample: ContainerUsageSample {
                measure_start: time(hour),
                usage: 50,
                request: 100,
                resource: Resource::CPU,
            },
            container: container.to_owned(),
        }
    }

    struct FakeFetcher {
        exists: bool,
    }

    #[async_trait]
    impl ControllerFetcher for FakeFetcher {
        async fn find_topmost_well_known_or_scalable(
            &self,
            controller: &ControllerKeyWithApiVersion,
        ) -> Result<Option<ControllerKeyWithApiVersion>> {
            Ok(self.exists.then(|| controller.to_owned()))
        }
    }

    #[test]
    fn pods_and_mpas_link_aggregations() {
        let mut cluster = cluster();
        let pod = PodId::new("default", "web-1");
        let container = ContainerId::new("default", "web-1", "app");
        cluster.add_or_update_pod(&pod, &web_labels(), PodPhase::Running, time(0));
        cluster
            .add_or_update_container(&container, requests(), time(0))
            .unwrap();
        cluster
            .add_or_update_mpa(&mpa_object("web"), Selector::parse("app=web").unwrap(), time(0))
            .unwrap();

        let id = MpaId::new("default", "web");
        let key = cluster.get_container(&container).unwrap().aggregate_key.clone();
        assert_eq!(key.labels_key, "app=web");
        assert!(cluster.mpas[&id].uses_aggregation(&key));
        assert_eq!(cluster.mpas[&id].pod_count, 1);
        assert!(cluster.aggregate_states()[&key].is_under_mpa);

        // Same labels again change nothing
        cluster.add_or_update_pod(&pod, &web_labels(), PodPhase::Running, time(1));
        assert_eq!(cluster.mpas[&id].pod_count, 1);
        assert_eq!(cluster.state_map_size(), 1);
    }

    #[test]
    fn label_change_rebinds_containers() {
        let mut cluster = cluster();
        cluster
            .add_or_update_mpa(&mpa_object("web"), Selector::parse("app=web").unwrap(), time(0))
            .unwrap();
        let pod = PodId::new("default", "web-1");
        let container = ContainerId::new("default", "web-1", "app");
        cluster.add_or_update_pod(&pod, &web_labels(), PodPhase::Running, time(0));
        cluster
            .add_or_update_container(&container, requests(), time(0))
            .unwrap();
        let id = MpaId::new("default", "web");
        assert_eq!(cluster.mpas[&id].pod_count, 1);

        let new_labels = Labels::from([("app", "api")]);
        cluster.add_or_update_pod(&pod, &new_labels, PodPhase::Running, time(1));
        let key = cluster.get_container(&container).unwrap().aggregate_key.clone();
        assert_eq!(key.labels_key, "app=api");
        assert_eq!(cluster.mpas[&id].pod_count, 0);
        assert!(!cluster.mpas[&id].uses_aggregation(&key));
        assert_eq!(cluster.state_map_size(), 2);
        assert!(cluster.add_sample(&cpu_sample(&container, 2)).is_ok());
        assert_eq!(cluster.aggregate_states()[&key].total_samples_count, 1);
    }

    #[test]
    fn unknown_pods_and_containers_are_key_errors() {
        let mut cluster = cluster();
        let container = ContainerId::new("default", "web-1", "app");
        let result = cluster.add_or_update_container(&container, requests(), time(0));
        assert!(matches!(result, Err(RecommenderError::KeyError(_))));
        cluster.add_or_update_pod(&container.pod_id, &web_labels(), PodPhase::Running, time(0));
        let result = cluster.add_sample(&cpu_sample(&container, 1));
        assert!(result.unwrap_err().is_key_error());
        let result = cluster.record_oom(&container, time(1), 200 * MIB);
        assert!(result.unwrap_err().is_key_error());
    }

    #[test]
    fn duplicate_sample_is_discarded() {
        let mut cluster = cluster();
        let container = ContainerId::new("default", "web-1", "app");
        cluster.add_or_update_pod(&container.pod_id, &web_labels(), PodPhase::Running, time(0));
        cluster
            .add_or_update_container(&container, requests(), time(0))
            .unwrap();
        assert!(cluster.add_sample(&cpu_sample(&container, 1)).is_ok());
        assert_eq!(
            cluster.add_sample(&cpu_sample(&container, 1)),
            Err(RecommenderError::SampleDiscarded)
        );
    }

    #[test]
    fn oom_is_recorded_as_bumped_peak() {
        let mut cluster = cluster();
        let container = ContainerId::new("default", "web-1", "app");
        cluster.add_or_update_pod(&container.pod_id, &web_labels(), PodPhase::Running, time(0));
        cluster
            .add_or_update_container(&container, requests(), time(0))
            .unwrap();
        let mut sample = cpu_sample(&container, 1);
        sample.sample.resource = Resource::Memory;
        sample.sample.usage = 180 * MIB;
        cluster.add_sample(&sample).unwrap();
        cluster.record_oom(&container, time(1), 200 * MIB).unwrap();
        let state = cluster.get_container(&container).unwrap();
        assert_eq!(state.oom_peak, 300 * MIB);
    }

    #[test]
    fn selector_change_rebuilds_mpa_and_policy_propagates() {
        let mut cluster = cluster();
        let container = ContainerId::new("default", "web-1", "app");
        cluster.add_or_update_pod(&container.pod_id, &web_labels(), PodPhase::Running, time(0));
        cluster
            .add_or_update_container(&container, requests(), time(0))
            .unwrap();
        let mut object = mpa_object("web");
        cluster
            .add_or_update_mpa(&object, Selector::parse("app=web").unwrap(), time(0))
            .unwrap();
        let key = cluster.get_container(&container).unwrap().aggregate_key.clone();

        object.spec.resource_policy = Some(PodResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: "app".to_string(),
                mode: Some(ContainerScalingMode::Off),
                ..Default::default()
            }],
        });
        cluster
            .add_or_update_mpa(&object, Selector::parse("app=web").unwrap(), time(1))
            .unwrap();
        assert_eq!(
            cluster.aggregate_states()[&key].scaling_mode,
            Some(ContainerScalingMode::Off)
        );

        // A selector still matching the pod keeps the aggregation
        cluster
            .add_or_update_mpa(&object, Selector::parse("app in (web,api)").unwrap(), time(2))
            .unwrap();
        let mpa = &cluster.mpas[&MpaId::new("default", "web")];
        assert!(mpa.uses_aggregation(&key));
        assert_eq!(mpa.pod_count, 1);
        assert!(cluster.aggregate_states()[&key].is_under_mpa);
    }

    #[test]
    fn delete_mpa_clears_links() {
        let mut cluster = cluster();
        let container = ContainerId::new("default", "web-1", "app");
        cluster.add_or_update_pod(&container.pod_id, &web_labels(), PodPhase::Running, time(0));
        cluster
            .add_or_update_container(&container, requests(), time(0))
            .unwrap();
        cluster
            .add_or_update_mpa(&mpa_object("web"), Selector::parse("app=web").unwrap(), time(0))
            .unwrap();
        cluster
            .add_or_update_mpa(&mpa_object("other"), Selector::parse("app").unwrap(), time(0))
            .unwrap();
        let key = cluster.get_container(&container).unwrap().aggregate_key.clone();
        let web = MpaId::new("default", "web");
        let other = MpaId::new("default", "other");
        cluster.record_recommendation(&web, time(0)).unwrap();
        assert!(cluster.empty_mpas.contains_key(&web));

        cluster.delete_mpa(&web).unwrap();
        assert!(!cluster.empty_mpas.contains_key(&web));
        // Still referenced by the other MPA
        assert!(cluster.aggregate_states()[&key].is_under_mpa);
        cluster.delete_mpa(&other).unwrap();
        assert!(!cluster.aggregate_states()[&key].is_under_mpa);
        assert!(cluster.delete_mpa(&other).unwrap_err().is_key_error());
    }

    #[test]
    fn missing_recommendation_is_reported_after_max_duration() {
        let mut cluster = cluster();
        cluster
            .add_or_update_mpa(&mpa_object("web"), Selector::parse("app=web").unwrap(), time(0))
            .unwrap();
        let id = MpaId::new("default", "web");
        let start = time(1);
        assert!(cluster.record_recommendation(&id, start).is_ok());
        assert!(cluster
            .record_recommendation(&id, start + Duration::minutes(30))
            .is_ok());
        let later = start + Duration::minutes(31);
        assert!(matches!(
            cluster.record_recommendation(&id, later),
            Err(RecommenderError::MissingRecommendation { .. })
        ));
        assert_eq!(cluster.empty_mpas[&id], later);
    }

    #[tokio::test]
    async fn gc_removes_empty_and_expired_aggregations() {
        let mut cluster = cluster();
        cluster
            .add_or_update_mpa(&mpa_object("web"), Selector::parse("app=web").unwrap(), time(0))
            .unwrap();
        let finished = ContainerId::new("default", "job-1", "app");
        cluster.add_or_update_pod(&finished.pod_id, &Labels::from([("job", "1")]), PodPhase::Succeeded, time(0));
        cluster
            .add_or_update_container(&finished, requests(), time(0))
            .unwrap();
        let running = ContainerId::new("default", "web-1", "app");
        cluster.add_or_update_pod(&running.pod_id, &web_labels(), PodPhase::Running, time(0));
        cluster
            .add_or_update_container(&running, requests(), time(0))
            .unwrap();
        cluster.add_sample(&cpu_sample(&running, 1)).unwrap();
        assert_eq!(cluster.state_map_size(), 2);

        let fetcher = FakeFetcher {
            exists: false,
        };
        cluster.rate_limited_garbage_collect(time(2), &fetcher).await;
        // The succeeded pod has no live controller and no samples
        assert_eq!(cluster.state_map_size(), 1);

        // Rate limited
        let expired = time(1) + Duration::days(9);
        cluster.rate_limited_garbage_collect(time(2) + Duration::seconds(30), &fetcher).await;
        assert_eq!(cluster.state_map_size(), 1);
        cluster.rate_limited_garbage_collect(expired, &fetcher).await;
        assert_eq!(cluster.state_map_size(), 0);
        assert_eq!(cluster.mpas[&MpaId::new("default", "web")].aggregation_keys().count(), 0);
    }

    #[tokio::test]
    async fn gc_keeps_aggregations_of_live_controllers() {
        let mut cluster = cluster();
        cluster
            .add_or_update_mpa(&mpa_object("web"), Selector::parse("app=web").unwrap(), time(0))
            .unwrap();
        let finished = ContainerId::new("default", "web-1", "app");
        cluster.add_or_update_pod(&finished.pod_id, &web_labels(), PodPhase::Failed, time(0));
        cluster
            .add_or_update_container(&finished, requests(), time(0))
            .unwrap();
        let fetcher = FakeFetcher {
            exists: true,
        };
        cluster.garbage_collect(time(1), &fetcher).await;
        assert_eq!(cluster.state_map_size(), 1);
    }
}
