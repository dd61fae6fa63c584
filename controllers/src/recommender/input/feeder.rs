use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use resources::{
    config::recommender::{RecommenderConfig, DEFAULT_RECOMMENDER_NAME},
    objects::{
        checkpoint::VerticalPodAutoscalerCheckpoint,
        labels::Selector,
        mpa::{ConditionType, MultidimPodAutoscaler},
        Object,
    },
};
use tokio::sync::mpsc;

use super::{
    metrics::MetricsClient,
    oom::OomInfo,
    spec::{BasicPodSpec, SpecClient},
};
use crate::{
    clients::{CheckpointClient, MetricsSource, MpaClient, PodLister},
    error::RecommenderError,
    model::{aggregation::AggregateContainerState, cluster::ClusterState, MpaId},
    target::{ControllerFetcher, ControllerKeyWithApiVersion, SelectorFetcher},
};

/// API collaborators of the feeder.
pub struct FeederClients {
    pub mpas: Arc<dyn MpaClient>,
    pub pods: Arc<dyn PodLister>,
    pub metrics: Arc<dyn MetricsSource>,
    pub checkpoints: Arc<dyn CheckpointClient>,
    pub selectors: Arc<dyn SelectorFetcher>,
    pub controllers: Arc<dyn ControllerFetcher>,
}

/// A condition to set to True with the message, or to remove.
#[derive(Debug, Clone, PartialEq)]
struct ConditionUpdate {
    type_: ConditionType,
    delete: bool,
    message: String,
}

impl ConditionUpdate {
    fn set(type_: ConditionType, message: String) -> Self {
        Self {
            type_,
            delete: false,
            message,
        }
    }

    fn delete(type_: ConditionType) -> Self {
        Self {
            type_,
            delete: true,
            message: String::new(),
        }
    }
}

/// Loads the API state into the [`ClusterState`] model.
pub struct ClusterStateFeeder {
    mpa_client: Arc<dyn MpaClient>,
    spec_client: SpecClient,
    metrics_client: MetricsClient,
    checkpoint_client: Arc<dyn CheckpointClient>,
    selector_fetcher: Arc<dyn SelectorFetcher>,
    controller_fetcher: Arc<dyn ControllerFetcher>,
    oom_rx: mpsc::Receiver<OomInfo>,
    config: RecommenderConfig,
}

impl ClusterStateFeeder {
    pub fn new(
        clients: FeederClients,
        oom_rx: mpsc::Receiver<OomInfo>,
        config: &RecommenderConfig,
    ) -> Self {
        Self {
            mpa_client: clients.mpas,
            spec_client: SpecClient::new(clients.pods),
            metrics_client: MetricsClient::new(clients.metrics, &config.mpa_object_namespace),
            checkpoint_client: clients.checkpoints,
            selector_fetcher: clients.selectors,
            controller_fetcher: clients.controllers,
            oom_rx,
            config: config.to_owned(),
        }
    }

    /// Whether this recommender is responsible for the MPA.
    fn handles(&self, mpa: &MultidimPodAutoscaler) -> bool {
        let name = self.config.recommender_name.as_str();
        let recommenders = &mpa.spec.recommenders;
        if recommenders.is_empty() {
            if name != DEFAULT_RECOMMENDER_NAME {
                tracing::debug!(
                    "Recommender {} is not the default one, ignoring MPA {} without recommenders",
                    name,
                    mpa.key()
                );
                return false;
            }
            return true;
        }
        if !recommenders.iter().any(|r| r.name == name) {
            tracing::debug!(
                "Ignoring MPA {} as recommender {} is not selected",
                mpa.key(),
                name
            );
            return false;
        }
        true
    }

    async fn validate_target_ref(
        &self,
        mpa: &MultidimPodAutoscaler,
    ) -> std::result::Result<(), String> {
        let target = match &mpa.spec.scale_target_ref {
            Some(target) => target,
            None => return Err(String::new()),
        };
        let key = ControllerKeyWithApiVersion::from_reference(mpa.namespace(), target);
        match self
            .controller_fetcher
            .find_topmost_well_known_or_scalable(&key)
            .await
        {
            Err(err) => Err(format!(
                "Error checking if target is a topmost well-known or scalable controller: {:#}",
                err
            )),
            Ok(None) => Err(format!(
                "Unknown error during checking if target is a topmost well-known or scalable controller: {}",
                key
            )),
            Ok(Some(top_most)) if top_most != key => Err(
                "The scaleTargetRef controller has a parent but it should point to a topmost well-known or scalable controller"
                    .to_string(),
            ),
            Ok(Some(_)) => Ok(()),
        }
    }

    /// The pod selector of the MPA, with the conditions describing its validity.
    async fn get_selector(
        &self,
        mpa: &MultidimPodAutoscaler,
    ) -> (Selector, Vec<ConditionUpdate>) {
        match self.selector_fetcher.fetch(mpa).await {
            Ok(selector) => match self.validate_target_ref(mpa).await {
                Err(message) => (
                    Selector::nothing(),
                    vec![
                        ConditionUpdate::set(ConditionType::ConfigUnsupported, message),
                        ConditionUpdate::delete(ConditionType::ConfigDeprecated),
                    ],
                ),
                Ok(()) => (
                    selector,
                    vec![
                        ConditionUpdate::delete(ConditionType::ConfigUnsupported),
                        ConditionUpdate::delete(ConditionType::ConfigDeprecated),
                    ],
                ),
            },
            Err(err) => {
                tracing::error!(
                    "Cannot get target selector from MPA's scaleTargetRef. Reason: {:#}",
                    err
                );
                (
                    Selector::nothing(),
                    vec![
                        ConditionUpdate::set(
                            ConditionType::ConfigUnsupported,
                            format!("Cannot read scaleTargetRef. Reason: {:#}", err),
                        ),
                        ConditionUpdate::delete(ConditionType::ConfigDeprecated),
                    ],
                )
            },
        }
    }

    /// Sync the MPAs of the model with the API server.
    pub async fn load_mpas(&self, cluster: &mut ClusterState, now: NaiveDateTime) {
        let mpas = match self.mpa_client.list_mpas().await {
            Ok(mpas) => mpas,
            Err(err) => {
                tracing::error!("Cannot list MPAs. Reason: {:#}", err);
                return;
            },
        };
        tracing::debug!("Fetched {} MPAs.", mpas.len());
        let mpas = mpas
            .into_iter()
            .filter(|mpa| self.config.watches_namespace(mpa.namespace()))
            .filter(|mpa| self.handles(mpa))
            .collect::<Vec<_>>();

        let mut present = HashSet::new();
        for mpa in &mpas {
            let id = MpaId::new(mpa.namespace(), mpa.name());
            let (selector, updates) = self.get_selector(mpa).await;
            tracing::debug!("Using selector {} for MPA {}", selector, id);
            if let Err(err) = cluster.add_or_update_mpa(mpa, selector, now) {
                tracing::warn!("Failed to add MPA {}. Reason: {}", id, err);
                continue;
            }
            if let Some(state) = cluster.mpas.get_mut(&id) {
                for update in updates {
                    if update.delete {
                        state.conditions.delete(update.type_);
                    } else {
                        state
                            .conditions
                            .set(update.type_, true, "", &update.message, now);
                    }
                }
            }
            tracing::debug!("Added MPA {}", id);
            present.insert(id);
        }

        let stale = cluster
            .mpas
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect::<Vec<_>>();
        for id in stale {
            tracing::info!("Deleting MPA {}", id);
            if let Err(err) = cluster.delete_mpa(&id) {
                tracing::error!("Deleting MPA {} failed: {}", id, err);
            }
        }
        cluster.observed_mpas = mpas;
    }

    fn matches_any_mpa(cluster: &ClusterState, spec: &BasicPodSpec) -> bool {
        cluster
            .mpas
            .values()
            .any(|mpa| mpa.matches_pod(&spec.id.namespace, &spec.labels))
    }

    /// Sync the pods and containers of the model with the API server.
    pub async fn load_pods(&self, cluster: &mut ClusterState, now: NaiveDateTime) {
        let specs = match self.spec_client.get_pod_specs().await {
            Ok(specs) => specs,
            Err(err) => {
                tracing::error!("Cannot get pod specs. Reason: {:#}", err);
                return;
            },
        };
        let present = specs.iter().map(|spec| &spec.id).collect::<HashSet<_>>();
        let stale = cluster
            .pods
            .keys()
            .filter(|id| !present.contains(id))
            .cloned()
            .collect::<Vec<_>>();
        for id in stale {
            tracing::debug!("Deleting Pod {}", id);
            cluster.delete_pod(&id);
        }

        for spec in specs {
            if self.config.memory_saver && !Self::matches_any_mpa(cluster, &spec) {
                continue;
            }
            cluster.add_or_update_pod(&spec.id, &spec.labels, spec.phase, now);
            for container in spec.containers {
                if let Err(err) =
                    cluster.add_or_update_container(&container.id, container.request, now)
                {
                    tracing::warn!("Failed to add container {}. Reason: {}", container.id, err);
                }
            }
        }
    }

    /// Feed usage samples and pending OOM kills to the model.
    pub async fn load_real_time_metrics(&mut self, cluster: &mut ClusterState) {
        let snapshots = match self.metrics_client.get_containers_metrics().await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                tracing::error!("Cannot get container metrics. Reason: {:#}", err);
                return;
            },
        };
        let mut sample_count = 0;
        let mut dropped = 0;
        for snapshot in &snapshots {
            for sample in snapshot.samples() {
                match cluster.add_sample(&sample) {
                    Ok(()) => sample_count += 1,
                    Err(err) if err.is_key_error() && self.config.memory_saver => {},
                    Err(RecommenderError::SampleDiscarded) => {
                        tracing::debug!(
                            "Discarded {} sample of container {}",
                            sample.sample.resource,
                            sample.container
                        );
                        dropped += 1;
                    },
                    Err(err) => {
                        tracing::warn!(
                            "Error adding metric sample for container {}: {}",
                            sample.container,
                            err
                        );
                        dropped += 1;
                    },
                }
            }
        }
        tracing::info!(
            "ClusterSpec fed with #{} ContainerUsageSamples for #{} containers. Dropped #{} samples.",
            sample_count,
            snapshots.len(),
            dropped
        );

        while let Ok(oom) = self.oom_rx.try_recv() {
            tracing::info!("OOM detected {:?}", oom);
            if let Err(err) = cluster.record_oom(&oom.container_id, oom.timestamp, oom.memory) {
                tracing::warn!("Failed to record OOM {:?}. Reason: {}", oom, err);
            }
        }
    }

    fn set_mpa_checkpoint(
        cluster: &mut ClusterState,
        checkpoint: &VerticalPodAutoscalerCheckpoint,
        now: NaiveDateTime,
    ) -> Result<()> {
        let id = MpaId::new(checkpoint.namespace(), &checkpoint.spec.vpa_object_name);
        let config = *cluster.config();
        let mpa = cluster
            .mpas
            .get_mut(&id)
            .ok_or_else(|| anyhow!("cannot load checkpoint to missing MPA object {}", id))?;
        let mut state = AggregateContainerState::new(&config, now);
        state
            .load_from_checkpoint(&checkpoint.status)
            .with_context(|| format!("cannot load checkpoint for MPA {}", id))?;
        mpa.containers_initial_aggregate_state
            .insert(checkpoint.spec.container_name.to_owned(), state);
        Ok(())
    }

    /// Prime the MPAs with the aggregations stored in checkpoints.
    pub async fn init_from_checkpoints(&self, cluster: &mut ClusterState, now: NaiveDateTime) {
        tracing::info!("Initializing MPA from checkpoints");
        self.load_mpas(cluster, now).await;

        let namespaces = cluster
            .mpas
            .keys()
            .map(|id| id.namespace.to_owned())
            .collect::<BTreeSet<_>>();
        for namespace in namespaces {
            tracing::info!("Fetching checkpoints from namespace {}", namespace);
            let checkpoints = match self.checkpoint_client.list_checkpoints(Some(&namespace)).await {
                Ok(checkpoints) => checkpoints,
                Err(err) => {
                    tracing::error!(
                        "Cannot list MPA checkpoints from namespace {}. Reason: {:#}",
                        namespace,
                        err
                    );
                    continue;
                },
            };
            for checkpoint in checkpoints {
                tracing::info!(
                    "Loading MPA {}/{} checkpoint for {}",
                    namespace,
                    checkpoint.spec.vpa_object_name,
                    checkpoint.spec.container_name
                );
                if let Err(err) = Self::set_mpa_checkpoint(cluster, &checkpoint, now) {
                    tracing::error!("Error while loading checkpoint. Reason: {:#}", err);
                }
            }
        }
    }

    /// Delete checkpoints of MPAs that no longer exist.
    pub async fn garbage_collect_checkpoints(&self, cluster: &mut ClusterState, now: NaiveDateTime) {
        tracing::info!("Starting garbage collection of checkpoints");
        self.load_mpas(cluster, now).await;

        let checkpoints = match self.checkpoint_client.list_checkpoints(None).await {
            Ok(checkpoints) => checkpoints,
            Err(err) => {
                tracing::error!("Cannot list MPA checkpoints. Reason: {:#}", err);
                return;
            },
        };
        for checkpoint in checkpoints {
            let id = MpaId::new(checkpoint.namespace(), &checkpoint.spec.vpa_object_name);
            if cluster.mpas.contains_key(&id) {
                continue;
            }
            match self
                .checkpoint_client
                .delete_checkpoint(checkpoint.namespace(), checkpoint.name())
                .await
            {
                Ok(()) => tracing::info!(
                    "Orphaned MPA checkpoint cleanup - deleting {}/{}.",
                    checkpoint.namespace(),
                    checkpoint.name()
                ),
                Err(err) => tracing::error!(
                    "Cannot delete MPA checkpoint {}/{}. Reason: {:#}",
                    checkpoint.namespace(),
                    checkpoint.name(),
                    err
                ),
            }
        }
    }
}
