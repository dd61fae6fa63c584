use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use resources::objects::{
    checkpoint::{CheckpointSpec, VerticalPodAutoscalerCheckpoint},
    metrics::Resource,
    Metadata,
};
use tokio::time::Instant;

use crate::{
    clients::CheckpointClient,
    model::{
        aggregation::AggregateContainerState, cluster::ClusterState, mpa::Mpa, ContainerUsageSample,
        MpaId,
    },
};

/// Persists the aggregations of MPAs so a restarted recommender starts warm.
pub struct CheckpointWriter {
    client: Arc<dyn CheckpointClient>,
}

/// Aggregations of the MPA by container name,
/// leaving out the memory peaks of windows still open.
fn build_aggregate_state_map(
    cluster: &ClusterState,
    mpa: &Mpa,
    now: NaiveDateTime,
) -> BTreeMap<String, AggregateContainerState> {
    let mut states = mpa.aggregate_state_by_container_name(
        cluster.aggregate_states(),
        cluster.config(),
        now,
    );
    for pod in cluster.pods.values() {
        for (container_name, container) in &pod.containers {
            if !mpa.uses_aggregation(&container.aggregate_key) {
                continue;
            }
            let window_end = match container.window_end {
                Some(window_end) if now < window_end => window_end,
                _ => continue,
            };
            if let Some(state) = states.get_mut(container_name) {
                state.subtract_sample(&ContainerUsageSample {
                    measure_start: window_end,
                    usage: container.max_memory_peak(),
                    request: container.request.get(&Resource::Memory).cloned().unwrap_or(0),
                    resource: Resource::Memory,
                });
            }
        }
    }
    states
}

impl CheckpointWriter {
    pub fn new(client: Arc<dyn CheckpointClient>) -> Self {
        Self {
            client,
        }
    }

    /// Write checkpoints of the MPAs whose checkpoints are the oldest.
    /// Past the deadline the writer stops, once at least `min_checkpoints` MPAs are written.
    pub async fn store_checkpoints(
        &self,
        cluster: &mut ClusterState,
        now: NaiveDateTime,
        deadline: Instant,
        min_checkpoints: usize,
    ) -> Result<()> {
        let mut ids = cluster
            .mpas
            .values()
            .map(|mpa| (mpa.checkpoint_written, mpa.id.to_owned()))
            .collect::<Vec<_>>();
        ids.sort();

        let mut remaining = min_checkpoints as i64;
        for (_, id) in ids {
            if Instant::now() >= deadline && remaining <= 0 {
                return Err(anyhow!("Deadline exceeded while writing checkpoints"));
            }
            self.store_mpa_checkpoints(cluster, &id, now).await;
            remaining -= 1;
        }
        Ok(())
    }

    async fn store_mpa_checkpoints(&self, cluster: &mut ClusterState, id: &MpaId, now: NaiveDateTime) {
        let states = match cluster.mpas.get(id) {
            Some(mpa) => build_aggregate_state_map(cluster, mpa, now),
            None => return,
        };
        for (container_name, state) in states {
            let checkpoint = VerticalPodAutoscalerCheckpoint {
                metadata: Metadata::new(
                    &id.namespace,
                    &format!("{}-{}", id.mpa_name, container_name),
                ),
                spec: CheckpointSpec {
                    vpa_object_name: id.mpa_name.to_owned(),
                    container_name: container_name.to_owned(),
                },
                status: state.save_to_checkpoint(now),
            };
            match self.client.create_or_update_checkpoint(&checkpoint).await {
                Ok(()) => tracing::debug!(
                    "Saved MPA {}/{} checkpoint for {}",
                    id.namespace,
                    id.mpa_name,
                    container_name
                ),
                Err(err) => tracing::error!(
                    "Cannot save MPA {}/{} checkpoint for {}. Reason: {:#}",
                    id.namespace,
                    id.mpa_name,
                    container_name,
                    err
                ),
            }
        }
        // Stamped whether or not the writes succeeded
        if let Some(mpa) = cluster.mpas.get_mut(id) {
            mpa.checkpoint_written = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use resources::objects::{
        labels::Selector,
        metrics::ResourceList,
        mpa::MultidimPodAutoscaler,
        pod::PodPhase,
        Labels, Object,
    };

    use super::*;
    use crate::{
        model::{aggregation::AggregationsConfig, ContainerId, ContainerUsageSampleWithKey, PodId},
        testing::{time, FakeApi},
    };

    fn cluster_with_mpas(names: &[&str], now: NaiveDateTime) -> ClusterState {
        let mut cluster = ClusterState::new(Duration::minutes(1), AggregationsConfig::default());
        for name in names {
            let object = MultidimPodAutoscaler {
                metadata: Metadata::new("default", name),
                ..Default::default()
            };
            let selector = Selector::parse(&format!("app={}", name)).unwrap();
            cluster.add_or_update_mpa(&object, selector, now).unwrap();
        }
        cluster
    }

    fn add_usage(cluster: &mut ClusterState, app: &str, now: NaiveDateTime) {
        let pod = PodId::new("default", &format!("{}-1", app));
        let container = ContainerId {
            pod_id: pod.to_owned(),
            container_name: "app".to_string(),
        };
        cluster.add_or_update_pod(&pod, &Labels::from([("app", app)]), PodPhase::Running, now);
        cluster
            .add_or_update_container(
                &container,
                ResourceList::from([(Resource::CPU, 1000), (Resource::Memory, 1 << 30)]),
                now,
            )
            .unwrap();
        for (resource, usage) in [(Resource::CPU, 500), (Resource::Memory, 500 << 20)] {
            cluster
                .add_sample(&ContainerUsageSampleWithKey {
                    sample: ContainerUsageSample {
                        measure_start: now,
                        usage,
                        request: 0,
                        resource,
                    },
                    container: container.to_owned(),
                })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn checkpoint_leaves_out_open_memory_window() {
        let now = time(12, 0, 0);
        let mut cluster = cluster_with_mpas(&["web"], now);
        add_usage(&mut cluster, "web", now);
        let api = Arc::new(FakeApi::default());
        let writer = CheckpointWriter::new(api.clone());
        writer
            .store_checkpoints(&mut cluster, now, Instant::now(), 10)
            .await
            .unwrap();

        let checkpoints = api.checkpoints.lock();
        let checkpoint = &checkpoints["default/web-app"];
        assert_eq!(checkpoint.key(), "default/web-app");
        assert_eq!(checkpoint.spec.vpa_object_name, "web");
        assert_eq!(checkpoint.spec.container_name, "app");
        assert_eq!(checkpoint.status.total_samples_count, 1);
        assert!(!checkpoint.status.cpu_histogram.bucket_weights.is_empty());
        assert!(checkpoint.status.memory_histogram.bucket_weights.is_empty());
        assert_eq!(
            cluster.mpas[&MpaId::new("default", "web")].checkpoint_written,
            Some(now)
        );
    }

    #[tokio::test]
    async fn oldest_checkpoints_first_until_deadline() {
        let now = time(12, 0, 0);
        let mut cluster = cluster_with_mpas(&["a", "b", "c"], now);
        for name in ["a", "b", "c"] {
            add_usage(&mut cluster, name, now);
        }
        let earlier = now - Duration::minutes(10);
        cluster
            .mpas
            .get_mut(&MpaId::new("default", "a"))
            .unwrap()
            .checkpoint_written = Some(earlier);
        cluster
            .mpas
            .get_mut(&MpaId::new("default", "c"))
            .unwrap()
            .checkpoint_written = Some(earlier - Duration::minutes(1));

        let api = Arc::new(FakeApi::default());
        let writer = CheckpointWriter::new(api.clone());
        // The deadline has passed, only the required minimum is written
        let result = writer
            .store_checkpoints(&mut cluster, now, Instant::now(), 2)
            .await;
        assert!(result.is_err());
        let written = api.checkpoints.lock().keys().cloned().collect::<Vec<_>>();
        // "b" was never written, then "c" is the oldest
        assert_eq!(written, vec!["default/b-app".to_string(), "default/c-app".to_string()]);
        assert_eq!(
            cluster.mpas[&MpaId::new("default", "a")].checkpoint_written,
            Some(earlier)
        );
    }

    #[tokio::test]
    async fn failed_writes_still_move_mpa_back() {
        let now = time(12, 0, 0);
        let mut cluster = cluster_with_mpas(&["web", "idle"], now);
        add_usage(&mut cluster, "web", now);
        let api = Arc::new(FakeApi::default());
        *api.reject_checkpoints.lock() = true;
        let writer = CheckpointWriter::new(api.clone());
        writer
            .store_checkpoints(&mut cluster, now, Instant::now(), 10)
            .await
            .unwrap();

        assert!(api.checkpoints.lock().is_empty());
        // Both the MPA whose write failed and the one without aggregations are stamped
        for name in ["web", "idle"] {
            assert_eq!(
                cluster.mpas[&MpaId::new("default", name)].checkpoint_written,
                Some(now)
            );
        }

        // Next round an MPA never written goes first, ahead of the failed one
        let later = now + Duration::minutes(1);
        let object = MultidimPodAutoscaler {
            metadata: Metadata::new("default", "zeta"),
            ..Default::default()
        };
        cluster
            .add_or_update_mpa(&object, Selector::parse("app=zeta").unwrap(), later)
            .unwrap();
        add_usage(&mut cluster, "zeta", later);
        *api.reject_checkpoints.lock() = false;
        let result = writer
            .store_checkpoints(&mut cluster, later, Instant::now(), 1)
            .await;
        assert!(result.is_err());
        let written = api.checkpoints.lock().keys().cloned().collect::<Vec<_>>();
        assert_eq!(written, vec!["default/zeta-app".to_string()]);
    }
}
