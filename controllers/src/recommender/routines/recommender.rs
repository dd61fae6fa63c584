use std::{mem, sync::Arc};

use chrono::{Duration, NaiveDateTime};
use resources::{
    config::recommender::RecommenderConfig,
    objects::{mpa::MultidimPodAutoscaler, Object},
};
use tokio::{sync::mpsc, time::Instant};

use super::{horizontal::HorizontalController, replica_calculator::ReplicaCalculator};
use crate::{
    checkpoint::CheckpointWriter,
    clients::{EventRecorder, EventType, MpaClient, ScaleClient},
    input::{
        feeder::{ClusterStateFeeder, FeederClients},
        oom::OomInfo,
    },
    logic::{capping, recommender::PodResourceRecommender},
    model::{aggregation::AggregationsConfig, cluster::ClusterState, MpaId},
    target::ControllerFetcher,
};

/// API collaborators of the recommender.
pub struct RecommenderClients {
    pub feeder: FeederClients,
    pub scales: Arc<dyn ScaleClient>,
    pub events: Arc<dyn EventRecorder>,
}

/// Owns the cluster model and runs the recommendation loop over it.
pub struct Recommender {
    cluster: ClusterState,
    feeder: ClusterStateFeeder,
    checkpoint_writer: CheckpointWriter,
    pod_resource_recommender: PodResourceRecommender,
    horizontal: HorizontalController,
    mpa_client: Arc<dyn MpaClient>,
    events: Arc<dyn EventRecorder>,
    controller_fetcher: Arc<dyn ControllerFetcher>,
    config: RecommenderConfig,
    last_checkpoint_gc: NaiveDateTime,
}

impl Recommender {
    pub fn new(
        clients: RecommenderClients,
        oom_rx: mpsc::Receiver<OomInfo>,
        config: &RecommenderConfig,
        now: NaiveDateTime,
    ) -> Self {
        let FeederClients {
            mpas,
            pods,
            metrics,
            checkpoints,
            selectors,
            controllers,
        } = clients.feeder;
        let calculator = ReplicaCalculator::new(pods.clone(), metrics.clone(), config);
        let horizontal = HorizontalController::new(
            mpas.clone(),
            clients.scales,
            clients.events.clone(),
            calculator,
            config,
        );
        let feeder = ClusterStateFeeder::new(
            FeederClients {
                mpas: mpas.clone(),
                pods,
                metrics,
                checkpoints: checkpoints.clone(),
                selectors,
                controllers: controllers.clone(),
            },
            oom_rx,
            config,
        );
        Self {
            cluster: ClusterState::new(
                Duration::seconds(config.aggregate_state_gc_interval as i64),
                AggregationsConfig::from(config),
            ),
            feeder,
            checkpoint_writer: CheckpointWriter::new(checkpoints),
            pod_resource_recommender: PodResourceRecommender::new(config),
            horizontal,
            mpa_client: mpas,
            events: clients.events,
            controller_fetcher: controllers,
            config: config.to_owned(),
            last_checkpoint_gc: now,
        }
    }

    /// Warm up the model from the stored checkpoints.
    pub async fn init_from_checkpoints(&mut self, now: NaiveDateTime) {
        if self.config.use_checkpoints {
            self.feeder
                .init_from_checkpoints(&mut self.cluster, now)
                .await;
        }
    }

    /// Compute the vertical recommendations and write them to the MPA statuses.
    /// The written statuses replace the observed ones, so the horizontal pass builds on them.
    pub async fn update_mpas(&mut self, now: NaiveDateTime) {
        let mut observed_mpas = mem::take(&mut self.cluster.observed_mpas);
        for observed in observed_mpas.iter_mut() {
            self.update_mpa(observed, now).await;
        }
        self.cluster.observed_mpas = observed_mpas;
    }

    async fn update_mpa(&mut self, observed: &mut MultidimPodAutoscaler, now: NaiveDateTime) {
        let id = MpaId::new(observed.namespace(), observed.name());
        tracing::debug!("Recommender is checking MPA {}...", id);
        let config = *self.cluster.config();
        let (mpa, states) = match self.cluster.mpa_with_aggregates(&id) {
            Some(found) => found,
            None => {
                tracing::debug!("MPA {} not found in the cluster state map!", id);
                return;
            },
        };

        let resources = self
            .pod_resource_recommender
            .get_recommended_pod_resources(&mpa.recommendable_aggregate_states(states, &config, now));
        let had_recommendation = mpa.has_recommendation();
        let recommendation = capping::apply_policy(resources, mpa.resource_policy.as_ref());
        let recommendation = if recommendation.container_recommendations.is_empty() {
            None
        } else {
            Some(recommendation)
        };
        mpa.update_recommendation(recommendation, states);
        tracing::debug!("MPA {} recommendation updated: {:?}", id, mpa.recommendation);
        if mpa.has_recommendation() && !had_recommendation {
            tracing::info!(
                "First recommendation for MPA {} after {}s",
                id,
                (now - mpa.created).num_seconds()
            );
        }
        let pods_matched = mpa.has_matched_pods();
        mpa.update_conditions(pods_matched, now);
        let status = mpa.as_status(&observed.status);

        if let Err(err) = self.cluster.record_recommendation(&id, now) {
            tracing::warn!("{}", err);
            self.events
                .event(observed, EventType::Warning, "MissingRecommendation", &err.to_string())
                .await;
            if let Some(mpa) = self.cluster.mpas.get(&id) {
                let matching = self.cluster.get_matching_pods(mpa);
                tracing::debug!(
                    "MPA {} has {} matching pods: {:?}",
                    id,
                    mpa.pod_count,
                    matching
                );
                if matching.len() != mpa.pod_count {
                    tracing::error!(
                        "ClusterState pod count and matching pods disagree for MPA {}",
                        id
                    );
                }
            }
        }

        if status == observed.status {
            return;
        }
        match self
            .mpa_client
            .patch_status(&id.namespace, &id.mpa_name, &status)
            .await
        {
            Ok(()) => observed.status = status,
            Err(err) => tracing::error!("Cannot update MPA {} object. Reason: {:#}", id, err),
        }
    }

    /// Write checkpoints until the deadline, and periodically drop the orphaned ones.
    pub async fn maintain_checkpoints(&mut self, now: NaiveDateTime, deadline: Instant) {
        if !self.config.use_checkpoints {
            return;
        }
        if let Err(err) = self
            .checkpoint_writer
            .store_checkpoints(
                &mut self.cluster,
                now,
                deadline,
                self.config.min_checkpoints_per_run,
            )
            .await
        {
            tracing::warn!("Failed to store checkpoints. Reason: {:#}", err);
        }
        if now - self.last_checkpoint_gc > Duration::seconds(self.config.checkpoints_gc_interval as i64) {
            self.last_checkpoint_gc = now;
            self.feeder
                .garbage_collect_checkpoints(&mut self.cluster, now)
                .await;
        }
    }

    /// One tick: feed the model, recommend both dimensions, then persist and clean up.
    pub async fn run_once(&mut self, now: NaiveDateTime) {
        let deadline =
            Instant::now() + std::time::Duration::from_secs(self.config.checkpoints_write_timeout);
        tracing::debug!("Recommender run");

        self.feeder.load_mpas(&mut self.cluster, now).await;
        self.feeder.load_pods(&mut self.cluster, now).await;
        self.feeder.load_real_time_metrics(&mut self.cluster).await;
        tracing::info!(
            "ClusterState is tracking {} PodStates and {} MPAs",
            self.cluster.pods.len(),
            self.cluster.mpas.len()
        );

        self.update_mpas(now).await;
        self.horizontal
            .reconcile_all(&self.cluster.observed_mpas, now)
            .await;

        self.maintain_checkpoints(now, deadline).await;

        self.cluster
            .rate_limited_garbage_collect(now, self.controller_fetcher.as_ref())
            .await;
        tracing::info!(
            "ClusterState is tracking {} aggregated container states",
            self.cluster.state_map_size()
        );
    }
}

#[cfg(test)]
mod tests {
    use resources::objects::{
        hpa::{MetricSpec, MetricTarget, ResourceMetricSource},
        metrics::{ContainerMetrics, PodMetrics, Resource, ResourceList},
        mpa::{ConditionStatus, ConditionType, MultidimPodAutoscalerSpec, ScalingConstraints},
        object_reference::CrossVersionObjectReference,
        pod::{Container, Pod, PodCondition, PodConditionType, PodPhase, PodSpec, PodStatus, ResourceRequirements},
        scale::Scale,
        Labels, Metadata,
    };

    use super::*;
    use crate::{
        input::oom,
        target::selector_fetcher::ScaleSelectorFetcher,
        testing::{time, FakeApi},
    };

    fn recommender(api: &Arc<FakeApi>, now: NaiveDateTime) -> Recommender {
        let (_, oom_rx) = oom::channel(10);
        Recommender::new(
            RecommenderClients {
                feeder: FeederClients {
                    mpas: api.clone(),
                    pods: api.clone(),
                    metrics: api.clone(),
                    checkpoints: api.clone(),
                    selectors: Arc::new(ScaleSelectorFetcher::new(api.clone())),
                    controllers: api.clone(),
                },
                scales: api.clone(),
                events: api.clone(),
            },
            oom_rx,
            &RecommenderConfig::default(),
            now,
        )
    }

    fn mpa(metrics: Vec<MetricSpec>) -> MultidimPodAutoscaler {
        MultidimPodAutoscaler {
            metadata: Metadata::new("default", "web"),
            spec: MultidimPodAutoscalerSpec {
                scale_target_ref: Some(CrossVersionObjectReference::new(
                    "apps/v1",
                    "Deployment",
                    "web",
                )),
                constraints: Some(ScalingConstraints {
                    min_replicas: Some(1),
                    max_replicas: 10,
                    behavior: None,
                }),
                metrics,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn scale(replicas: i32) -> Scale {
        let mut scale = Scale::default();
        scale.spec.replicas = replicas;
        scale.status.replicas = replicas;
        scale.status.selector = "app=web".to_string();
        scale
    }

    fn pod(name: &str, now: NaiveDateTime) -> Pod {
        let mut metadata = Metadata::new("default", name);
        metadata.labels = Labels::from([("app", "web")]);
        let mut status = PodStatus {
            phase: PodPhase::Running,
            start_time: Some(now - Duration::hours(1)),
            ..Default::default()
        };
        status.conditions.insert(
            PodConditionType::Ready,
            PodCondition {
                status: true,
                last_transition_time: Some(now - Duration::hours(1)),
            },
        );
        Pod {
            metadata,
            spec: PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    resources: ResourceRequirements {
                        requests: ResourceList::from([
                            (Resource::CPU, 100),
                            (Resource::Memory, 200 << 20),
                        ]),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: Some(status),
        }
    }

    fn usage(name: &str, now: NaiveDateTime) -> PodMetrics {
        PodMetrics {
            name: name.to_string(),
            namespace: "default".to_string(),
            labels: Labels::from([("app", "web")]),
            timestamp: now - Duration::seconds(30),
            window: 30,
            containers: vec![ContainerMetrics {
                name: "app".to_string(),
                usage: ResourceList::from([(Resource::CPU, 100), (Resource::Memory, 150 << 20)]),
            }],
        }
    }

    fn condition(api: &FakeApi, type_: ConditionType) -> Option<ConditionStatus> {
        api.statuses.lock()["default/web"]
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
            .map(|c| c.status)
    }

    #[tokio::test]
    async fn mpa_without_pods_reports_missing_recommendation() {
        let api = Arc::new(FakeApi::default());
        api.mpas.lock().push(mpa(vec![]));
        api.scales.lock().insert("web".to_string(), scale(1));
        let now = time(12, 0, 0);
        let mut recommender = recommender(&api, now);

        recommender.run_once(now).await;
        assert_eq!(condition(&api, ConditionType::NoPodsMatched), Some(ConditionStatus::True));
        assert_eq!(
            condition(&api, ConditionType::RecommendationProvided),
            Some(ConditionStatus::False)
        );
        assert_eq!(api.statuses.lock()["default/web"].recommendation, None);
        assert!(api.event_reasons().is_empty());

        recommender.run_once(now + Duration::minutes(20)).await;
        assert!(api.event_reasons().is_empty());
        recommender.run_once(now + Duration::minutes(31)).await;
        assert_eq!(api.event_reasons(), vec!["MissingRecommendation".to_string()]);
        // The timer starts over
        recommender.run_once(now + Duration::minutes(40)).await;
        assert_eq!(api.event_reasons().len(), 1);
    }

    #[tokio::test]
    async fn both_dimensions_are_recommended_in_one_tick() {
        let api = Arc::new(FakeApi::default());
        api.mpas.lock().push(mpa(vec![MetricSpec::Resource(ResourceMetricSource {
            name: Resource::CPU,
            target: MetricTarget::AverageUtilization(50),
        })]));
        api.scales.lock().insert("web".to_string(), scale(2));
        let now = time(12, 0, 0);
        for name in ["web-1", "web-2"] {
            api.pods.lock().push(pod(name, now));
            api.pod_metrics.lock().push(usage(name, now));
        }
        let mut recommender = recommender(&api, now);
        recommender.run_once(now).await;

        let status = api.statuses.lock()["default/web"].to_owned();
        let recommendation = status.recommendation.unwrap();
        assert_eq!(recommendation.container_recommendations.len(), 1);
        assert_eq!(recommendation.container_recommendations[0].container_name, "app");
        assert_eq!(status.current_replicas, 2);
        assert_eq!(status.desired_replicas, 4);
        let types = status.conditions.iter().map(|c| c.type_).collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                ConditionType::AbleToScale,
                ConditionType::RecommendationProvided,
                ConditionType::ScalingActive,
                ConditionType::ScalingLimited,
            ]
        );
        assert_eq!(api.event_reasons(), vec!["SuccessfulRescale".to_string()]);
        // The usage is checkpointed
        assert!(api.checkpoints.lock().contains_key("default/web-app"));
    }

    #[tokio::test]
    async fn checkpoints_are_not_written_when_disabled() {
        let api = Arc::new(FakeApi::default());
        api.mpas.lock().push(mpa(vec![]));
        api.scales.lock().insert("web".to_string(), scale(1));
        let now = time(12, 0, 0);
        api.pods.lock().push(pod("web-1", now));
        api.pod_metrics.lock().push(usage("web-1", now));
        let (_, oom_rx) = oom::channel(10);
        let mut recommender = Recommender::new(
            RecommenderClients {
                feeder: FeederClients {
                    mpas: api.clone(),
                    pods: api.clone(),
                    metrics: api.clone(),
                    checkpoints: api.clone(),
                    selectors: Arc::new(ScaleSelectorFetcher::new(api.clone())),
                    controllers: api.clone(),
                },
                scales: api.clone(),
                events: api.clone(),
            },
            oom_rx,
            &RecommenderConfig {
                use_checkpoints: false,
                ..Default::default()
            },
            now,
        );
        recommender.run_once(now).await;
        assert!(api.statuses.lock()["default/web"].recommendation.is_some());
        assert!(api.checkpoints.lock().is_empty());
    }
}
