use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use resources::objects::{
    labels::Selector,
    metrics::{PodMetrics, ResourceList},
};

use crate::{
    clients::MetricsSource,
    model::{ContainerId, ContainerUsageSample, ContainerUsageSampleWithKey},
};

/// Resource usage of a single container over a collection window.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerMetricsSnapshot {
    pub id: ContainerId,
    /// End of the collection window.
    pub snapshot_time: NaiveDateTime,
    /// Length of the collection window in seconds.
    pub snapshot_window: u32,
    pub usage: ResourceList,
}

impl ContainerMetricsSnapshot {
    /// One sample per measured resource.
    /// The request is filled in by the container state when the sample is added.
    pub fn samples(&self) -> impl Iterator<Item = ContainerUsageSampleWithKey> + '_ {
        self.usage
            .iter()
            .map(move |(resource, usage)| ContainerUsageSampleWithKey {
                sample: ContainerUsageSample {
                    measure_start: self.snapshot_time,
                    usage: *usage,
                    request: 0,
                    resource: *resource,
                },
                container: self.id.to_owned(),
            })
    }
}

fn snapshots_of(pod: &PodMetrics) -> impl Iterator<Item = ContainerMetricsSnapshot> + '_ {
    let snapshot_time = pod.timestamp + chrono::Duration::seconds(pod.window as i64);
    pod.containers
        .iter()
        .map(move |container| ContainerMetricsSnapshot {
            id: ContainerId::new(&pod.namespace, &pod.name, &container.name),
            snapshot_time,
            snapshot_window: pod.window,
            usage: container.usage.to_owned(),
        })
}

pub struct MetricsClient {
    source: Arc<dyn MetricsSource>,
    /// Namespace to read metrics from, all namespaces if None.
    namespace: Option<String>,
}

impl MetricsClient {
    pub fn new(source: Arc<dyn MetricsSource>, namespace: &str) -> Self {
        Self {
            source,
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
        }
    }

    pub async fn get_containers_metrics(&self) -> Result<Vec<ContainerMetricsSnapshot>> {
        let pods = self
            .source
            .get_pod_metrics(self.namespace.as_deref(), &Selector::everything())
            .await
            .with_context(|| "Cannot get pod metrics")?;
        tracing::debug!("{} pod metrics retrieved", pods.len());
        Ok(pods.iter().flat_map(snapshots_of).collect())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use resources::objects::metrics::{ContainerMetrics, ExternalMetricValue, MetricValue, Resource};
    use resources::objects::{object_reference::CrossVersionObjectReference, Labels};

    use super::*;

    struct FakeSource {
        pods: Vec<PodMetrics>,
        namespace: Mutex<Option<Option<String>>>,
    }

    #[async_trait]
    impl MetricsSource for FakeSource {
        async fn get_pod_metrics(
            &self,
            namespace: Option<&str>,
            _selector: &Selector,
        ) -> Result<Vec<PodMetrics>> {
            *self.namespace.lock() = Some(namespace.map(str::to_string));
            Ok(self.pods.to_owned())
        }

        async fn get_pods_metric(
            &self,
            _: &str,
            _: &str,
            _: &Selector,
            _: &Selector,
        ) -> Result<Vec<MetricValue>> {
            unimplemented!()
        }

        async fn get_object_metric(
            &self,
            _: &str,
            _: &str,
            _: &CrossVersionObjectReference,
            _: &Selector,
        ) -> Result<MetricValue> {
            unimplemented!()
        }

        async fn get_external_metric(
            &self,
            _: &str,
            _: &str,
            _: &Selector,
        ) -> Result<Vec<ExternalMetricValue>> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn snapshots_per_container() {
        let timestamp = NaiveDate::from_ymd_opt(2022, 6, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap();
        let source = Arc::new(FakeSource {
            pods: vec![PodMetrics {
                name: "web-1".to_string(),
                namespace: "prod".to_string(),
                labels: Labels::new(),
                timestamp,
                window: 30,
                containers: vec![
                    ContainerMetrics {
                        name: "app".to_string(),
                        usage: ResourceList::from([(Resource::CPU, 120), (Resource::Memory, 1 << 20)]),
                    },
                    ContainerMetrics {
                        name: "sidecar".to_string(),
                        usage: ResourceList::from([(Resource::CPU, 5)]),
                    },
                ],
            }],
            namespace: Mutex::new(None),
        });
        let client = MetricsClient::new(source.clone(), "");
        let snapshots = client.get_containers_metrics().await.unwrap();
        assert_eq!(*source.namespace.lock(), Some(None));
        assert_eq!(snapshots.len(), 2);

        let app = &snapshots[0];
        assert_eq!(app.id, ContainerId::new("prod", "web-1", "app"));
        assert_eq!(app.snapshot_time, timestamp + chrono::Duration::seconds(30));
        let samples = app.samples().collect::<Vec<_>>();
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.sample.measure_start == app.snapshot_time));
        assert_eq!(samples[0].sample.resource, Resource::CPU);
        assert_eq!(samples[0].sample.usage, 120);
        assert_eq!(samples[1].sample.usage, 1 << 20);

        let client = MetricsClient::new(source.clone(), "prod");
        client.get_containers_metrics().await.unwrap();
        assert_eq!(*source.namespace.lock(), Some(Some("prod".to_string())));
    }
}
