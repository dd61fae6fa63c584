use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use resources::objects::{
    labels::Selector,
    metrics::{PodMetric, PodMetricsInfo, Resource},
    object_reference::CrossVersionObjectReference,
};

use crate::clients::MetricsSource;

/// Reads the metrics replica counts are computed from.
pub struct ReplicaMetricsClient {
    source: Arc<dyn MetricsSource>,
}

impl ReplicaMetricsClient {
    pub fn new(source: Arc<dyn MetricsSource>) -> Self {
        Self {
            source,
        }
    }

    /// Usage of a resource per pod, summed over its containers
    /// or taken from the named container only.
    /// Pods missing the resource for one of the containers are left out.
    pub async fn get_resource_metric(
        &self,
        resource: &Resource,
        namespace: &str,
        selector: &Selector,
        container: Option<&str>,
    ) -> Result<(PodMetricsInfo, NaiveDateTime)> {
        let metrics = self.source.get_pod_metrics(Some(namespace), selector).await?;
        let timestamp = match metrics.first() {
            Some(pod) => pod.timestamp,
            None => return Err(anyhow!("no metrics returned from resource metrics API")),
        };

        let mut metric_info = PodMetricsInfo::new();
        for pod in metrics {
            let mut sum = 0;
            let mut found = false;
            let mut missing = false;
            for metric in pod
                .containers
                .iter()
                .filter(|c| container.map_or(true, |name| c.name == name))
            {
                match metric.usage.get(resource) {
                    Some(usage) => {
                        sum += *usage;
                        found = true;
                    },
                    None => {
                        tracing::debug!(
                            "Missing resource metric {} for container {} in pod {}/{}",
                            resource,
                            metric.name,
                            pod.namespace,
                            pod.name
                        );
                        missing = true;
                        break;
                    },
                }
            }
            if found && !missing {
                metric_info.insert(
                    pod.name,
                    PodMetric {
                        timestamp: pod.timestamp,
                        window: pod.window,
                        value: sum,
                    },
                );
            }
        }
        Ok((metric_info, timestamp))
    }

    /// A custom metric for each pod matching the selector.
    pub async fn get_raw_metric(
        &self,
        metric_name: &str,
        namespace: &str,
        selector: &Selector,
        metric_selector: &Selector,
    ) -> Result<(PodMetricsInfo, NaiveDateTime)> {
        let values = self
            .source
            .get_pods_metric(namespace, metric_name, selector, metric_selector)
            .await?;
        let timestamp = match values.first() {
            Some(value) => value.timestamp,
            None => return Err(anyhow!("no metrics returned from custom metrics API")),
        };
        let metric_info = values
            .into_iter()
            .map(|value| {
                (
                    value.described_object.name,
                    PodMetric {
                        timestamp: value.timestamp,
                        window: value.window,
                        value: value.value,
                    },
                )
            })
            .collect();
        Ok((metric_info, timestamp))
    }

    pub async fn get_object_metric(
        &self,
        metric_name: &str,
        namespace: &str,
        object: &CrossVersionObjectReference,
        metric_selector: &Selector,
    ) -> Result<(i64, NaiveDateTime)> {
        let value = self
            .source
            .get_object_metric(namespace, metric_name, object, metric_selector)
            .await?;
        Ok((value.value, value.timestamp))
    }

    /// Values of all series of an external metric.
    pub async fn get_external_metric(
        &self,
        metric_name: &str,
        namespace: &str,
        metric_selector: &Selector,
    ) -> Result<(Vec<i64>, NaiveDateTime)> {
        let values = self
            .source
            .get_external_metric(namespace, metric_name, metric_selector)
            .await?;
        let timestamp = match values.first() {
            Some(value) => value.timestamp,
            None => return Err(anyhow!("no metrics returned from external metrics API")),
        };
        Ok((values.into_iter().map(|v| v.value).collect(), timestamp))
    }
}

#[cfg(test)]
mod tests {
    use resources::objects::{
        metrics::{ContainerMetrics, PodMetrics, ResourceList},
        Labels,
    };

    use super::*;
    use crate::testing::{time, FakeApi};

    fn pod_metrics(name: &str, containers: Vec<(&str, ResourceList)>) -> PodMetrics {
        PodMetrics {
            name: name.to_string(),
            namespace: "default".to_string(),
            labels: Labels::from([("app", "web")]),
            timestamp: time(12, 0, 0),
            window: 30,
            containers: containers
                .into_iter()
                .map(|(name, usage)| ContainerMetrics {
                    name: name.to_string(),
                    usage,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn resource_usage_is_summed_per_pod() {
        let api = Arc::new(FakeApi::default());
        *api.pod_metrics.lock() = vec![
            pod_metrics(
                "web-1",
                vec![
                    ("app", ResourceList::from([(Resource::CPU, 300)])),
                    ("sidecar", ResourceList::from([(Resource::CPU, 50)])),
                ],
            ),
            // Memory only, left out
            pod_metrics("web-2", vec![("app", ResourceList::from([(Resource::Memory, 1 << 20)]))]),
        ];
        let client = ReplicaMetricsClient::new(api);
        let selector = Selector::parse("app=web").unwrap();

        let (metrics, timestamp) = client
            .get_resource_metric(&Resource::CPU, "default", &selector, None)
            .await
            .unwrap();
        assert_eq!(timestamp, time(12, 0, 0));
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics["web-1"].value, 350);

        let (metrics, _) = client
            .get_resource_metric(&Resource::CPU, "default", &selector, Some("sidecar"))
            .await
            .unwrap();
        assert_eq!(metrics["web-1"].value, 50);
    }

    #[tokio::test]
    async fn no_metrics_is_an_error() {
        let client = ReplicaMetricsClient::new(Arc::new(FakeApi::default()));
        let result = client
            .get_resource_metric(&Resource::CPU, "default", &Selector::everything(), None)
            .await;
        assert!(result.is_err());
    }
}
