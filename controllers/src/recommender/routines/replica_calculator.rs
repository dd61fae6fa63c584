use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDateTime};
use resources::{
    config::recommender::RecommenderConfig,
    objects::{
        labels::Selector,
        metrics::{PodMetric, PodMetricsInfo, Resource},
        object_reference::CrossVersionObjectReference,
        pod::{Pod, PodConditionType, PodPhase},
    },
};

use super::metrics::ReplicaMetricsClient;
use crate::clients::{MetricsSource, PodLister};

/// A replica count proposed from a metric, with the usage it is based on.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaCount {
    pub replicas: i32,
    /// Average per pod, or the total for single value targets.
    pub usage: i64,
    /// Utilization in percent of the requests, for utilization targets.
    pub utilization: Option<i32>,
    pub timestamp: NaiveDateTime,
}

/// Pods of the target grouped by how their samples are taken into account.
#[derive(Debug, Default)]
struct PodGroups {
    ready_count: usize,
    unready: HashSet<String>,
    missing: HashSet<String>,
    ignored: HashSet<String>,
}

pub struct ReplicaCalculator {
    client: ReplicaMetricsClient,
    pods: Arc<dyn PodLister>,
    tolerance: f64,
    cpu_initialization_period: Duration,
    delay_of_initial_readiness_status: Duration,
}

impl ReplicaCalculator {
    pub fn new(
        pods: Arc<dyn PodLister>,
        metrics: Arc<dyn MetricsSource>,
        config: &RecommenderConfig,
    ) -> Self {
        Self {
            client: ReplicaMetricsClient::new(metrics),
            pods,
            tolerance: config.hpa_tolerance,
            cpu_initialization_period: Duration::seconds(config.hpa_cpu_initialization_period as i64),
            delay_of_initial_readiness_status: Duration::seconds(
                config.hpa_initial_readiness_delay as i64,
            ),
        }
    }

    /// Calculate desired replica count based on a target utilization
    /// of the requested resource.
    #[allow(clippy::too_many_arguments)]
    pub async fn calc_replicas_by_utilization(
        &self,
        current_replicas: i32,
        target_utilization: i32,
        resource: &Resource,
        namespace: &str,
        selector: &Selector,
        container: Option<&str>,
        now: NaiveDateTime,
    ) -> Result<ReplicaCount> {
        let (mut metrics, timestamp) = self
            .client
            .get_resource_metric(resource, namespace, selector, container)
            .await
            .with_context(|| format!("unable to get metrics for resource {}", resource))?;
        let pods = self.get_pods(namespace, selector).await?;

        let groups = self.group_pods(&pods, &metrics, Some(resource), now);
        remove_metrics_for_pods(&mut metrics, &groups.ignored);
        remove_metrics_for_pods(&mut metrics, &groups.unready);
        if metrics.is_empty() {
            return Err(anyhow!("did not receive metrics for any ready pods"));
        }
        let requests = calc_pod_requests(&pods, resource, container)?;

        let (usage_ratio, utilization, raw_utilization) =
            utilization_ratio(&metrics, &requests, target_utilization)?;
        let result = |replicas| ReplicaCount {
            replicas,
            usage: raw_utilization,
            utilization: Some(utilization),
            timestamp,
        };

        let scale_up_with_unready = !groups.unready.is_empty() && usage_ratio > 1.0;
        if !scale_up_with_unready && groups.missing.is_empty() {
            if (1.0 - usage_ratio).abs() <= self.tolerance {
                return Ok(result(current_replicas));
            }
            return Ok(result(
                (usage_ratio * groups.ready_count as f64).ceil() as i32,
            ));
        }

        // Make conservative assumption for missing pods
        for pod_name in &groups.missing {
            let value = if usage_ratio < 1.0 {
                // When scaling down, treat missing pods as using at least their request
                let fallback_utilization = target_utilization.max(100) as i64;
                requests.get(pod_name).cloned().unwrap_or(0) * fallback_utilization / 100
            } else {
                // When scaling up, treat missing pods as 0% usage
                0
            };
            insert_metric(&mut metrics, pod_name, value, timestamp);
        }
        if scale_up_with_unready {
            for pod_name in &groups.unready {
                insert_metric(&mut metrics, pod_name, 0, timestamp);
            }
        }

        let (new_usage_ratio, _, _) = utilization_ratio(&metrics, &requests, target_utilization)?;
        Ok(result(self.checked_replicas(
            current_replicas,
            usage_ratio,
            new_usage_ratio,
            metrics.len(),
        )))
    }

    /// Calculate desired replica count based on a target average value of the resource.
    #[allow(clippy::too_many_arguments)]
    pub async fn calc_replicas_by_value(
        &self,
        current_replicas: i32,
        target_usage: i64,
        resource: &Resource,
        namespace: &str,
        selector: &Selector,
        container: Option<&str>,
        now: NaiveDateTime,
    ) -> Result<ReplicaCount> {
        let (metrics, timestamp) = self
            .client
            .get_resource_metric(resource, namespace, selector, container)
            .await
            .with_context(|| format!("unable to get metrics for resource {}", resource))?;
        let (replicas, usage) = self
            .calc_plain_metric_replicas(
                metrics,
                timestamp,
                current_replicas,
                target_usage,
                namespace,
                selector,
                Some(resource),
                now,
            )
            .await?;
        Ok(ReplicaCount {
            replicas,
            usage,
            utilization: None,
            timestamp,
        })
    }

    /// Calculate desired replica count based on a target average of a per-pod metric.
    #[allow(clippy::too_many_arguments)]
    pub async fn calc_replicas_by_pods_metric(
        &self,
        current_replicas: i32,
        target_usage: i64,
        metric_name: &str,
        namespace: &str,
        selector: &Selector,
        metric_selector: &Selector,
        now: NaiveDateTime,
    ) -> Result<ReplicaCount> {
        let (metrics, timestamp) = self
            .client
            .get_raw_metric(metric_name, namespace, selector, metric_selector)
            .await
            .with_context(|| format!("unable to get metric {}", metric_name))?;
        let (replicas, usage) = self
            .calc_plain_metric_replicas(
                metrics,
                timestamp,
                current_replicas,
                target_usage,
                namespace,
                selector,
                None,
                now,
            )
            .await?;
        Ok(ReplicaCount {
            replicas,
            usage,
            utilization: None,
            timestamp,
        })
    }

    /// Calculate desired replica count based on a target value of a metric
    /// describing a single object.
    #[allow(clippy::too_many_arguments)]
    pub async fn calc_replicas_by_object_metric(
        &self,
        current_replicas: i32,
        target_usage: i64,
        metric_name: &str,
        namespace: &str,
        object: &CrossVersionObjectReference,
        selector: &Selector,
        metric_selector: &Selector,
    ) -> Result<ReplicaCount> {
        let (usage, timestamp) = self
            .client
            .get_object_metric(metric_name, namespace, object, metric_selector)
            .await
            .with_context(|| {
                format!(
                    "unable to get metric {} on {} {}/{}",
                    metric_name, object.kind, namespace, object.name
                )
            })?;
        let usage_ratio = usage as f64 / target_usage as f64;
        let replicas = self
            .calc_usage_ratio_replicas(current_replicas, usage_ratio, namespace, selector)
            .await?;
        Ok(ReplicaCount {
            replicas,
            usage,
            utilization: None,
            timestamp,
        })
    }

    /// Calculate desired replica count based on a target average per pod
    /// of a metric describing a single object.
    pub async fn calc_replicas_by_object_per_pod_metric(
        &self,
        status_replicas: i32,
        target_average_usage: i64,
        metric_name: &str,
        namespace: &str,
        object: &CrossVersionObjectReference,
        metric_selector: &Selector,
    ) -> Result<ReplicaCount> {
        let (usage, timestamp) = self
            .client
            .get_object_metric(metric_name, namespace, object, metric_selector)
            .await
            .with_context(|| {
                format!(
                    "unable to get metric {} on {} {}/{}",
                    metric_name, object.kind, namespace, object.name
                )
            })?;
        let (replicas, usage) = self.per_pod_replicas(status_replicas, usage, target_average_usage);
        Ok(ReplicaCount {
            replicas,
            usage,
            utilization: None,
            timestamp,
        })
    }

    /// Calculate desired replica count based on a target value of an external metric,
    /// summed over its series.
    pub async fn calc_replicas_by_external_metric(
        &self,
        current_replicas: i32,
        target_usage: i64,
        metric_name: &str,
        namespace: &str,
        metric_selector: &Selector,
        pod_selector: &Selector,
    ) -> Result<ReplicaCount> {
        let (values, timestamp) = self
            .client
            .get_external_metric(metric_name, namespace, metric_selector)
            .await
            .with_context(|| {
                format!(
                    "unable to get external metric {}/{}/{}",
                    namespace, metric_name, metric_selector
                )
            })?;
        let usage = values.iter().sum::<i64>();
        let usage_ratio = usage as f64 / target_usage as f64;
        let replicas = self
            .calc_usage_ratio_replicas(current_replicas, usage_ratio, namespace, pod_selector)
            .await?;
        Ok(ReplicaCount {
            replicas,
            usage,
            utilization: None,
            timestamp,
        })
    }

    /// Calculate desired replica count based on a target average per pod
    /// of an external metric.
    pub async fn calc_replicas_by_external_per_pod_metric(
        &self,
        status_replicas: i32,
        target_average_usage: i64,
        metric_name: &str,
        namespace: &str,
        metric_selector: &Selector,
    ) -> Result<ReplicaCount> {
        let (values, timestamp) = self
            .client
            .get_external_metric(metric_name, namespace, metric_selector)
            .await
            .with_context(|| {
                format!(
                    "unable to get external metric {}/{}/{}",
                    namespace, metric_name, metric_selector
                )
            })?;
        let usage = values.iter().sum::<i64>();
        let (replicas, usage) = self.per_pod_replicas(status_replicas, usage, target_average_usage);
        Ok(ReplicaCount {
            replicas,
            usage,
            utilization: None,
            timestamp,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn calc_plain_metric_replicas(
        &self,
        mut metrics: PodMetricsInfo,
        timestamp: NaiveDateTime,
        current_replicas: i32,
        target_usage: i64,
        namespace: &str,
        selector: &Selector,
        resource: Option<&Resource>,
        now: NaiveDateTime,
    ) -> Result<(i32, i64)> {
        let pods = self.get_pods(namespace, selector).await?;
        let groups = self.group_pods(&pods, &metrics, resource, now);
        remove_metrics_for_pods(&mut metrics, &groups.ignored);
        remove_metrics_for_pods(&mut metrics, &groups.unready);
        if metrics.is_empty() {
            return Err(anyhow!("did not receive metrics for any ready pods"));
        }

        let (usage_ratio, usage) = metric_usage_ratio(&metrics, target_usage);
        let scale_up_with_unready = !groups.unready.is_empty() && usage_ratio > 1.0;
        if !scale_up_with_unready && groups.missing.is_empty() {
            if (1.0 - usage_ratio).abs() <= self.tolerance {
                return Ok((current_replicas, usage));
            }
            return Ok((
                (usage_ratio * groups.ready_count as f64).ceil() as i32,
                usage,
            ));
        }

        for pod_name in &groups.missing {
            // When scaling down, treat missing pods as being at the target
            let value = if usage_ratio < 1.0 { target_usage } else { 0 };
            insert_metric(&mut metrics, pod_name, value, timestamp);
        }
        if scale_up_with_unready {
            for pod_name in &groups.unready {
                insert_metric(&mut metrics, pod_name, 0, timestamp);
            }
        }

        let (new_usage_ratio, _) = metric_usage_ratio(&metrics, target_usage);
        Ok((
            self.checked_replicas(current_replicas, usage_ratio, new_usage_ratio, metrics.len()),
            usage,
        ))
    }

    /// The replica count after the conservative assumptions were made.
    /// The assumptions must not change the scale direction,
    /// and the new ratio must still call for a change.
    fn checked_replicas(
        &self,
        current_replicas: i32,
        usage_ratio: f64,
        new_usage_ratio: f64,
        pod_count: usize,
    ) -> i32 {
        if (1.0 - new_usage_ratio).abs() <= self.tolerance
            || (usage_ratio < 1.0 && new_usage_ratio > 1.0)
            || (usage_ratio > 1.0 && new_usage_ratio < 1.0)
        {
            return current_replicas;
        }
        let new_replicas = (new_usage_ratio * pod_count as f64).ceil() as i32;
        if (new_usage_ratio < 1.0 && new_replicas > current_replicas)
            || (new_usage_ratio > 1.0 && new_replicas < current_replicas)
        {
            current_replicas
        } else {
            new_replicas
        }
    }

    async fn calc_usage_ratio_replicas(
        &self,
        current_replicas: i32,
        usage_ratio: f64,
        namespace: &str,
        selector: &Selector,
    ) -> Result<i32> {
        if current_replicas == 0 {
            return Ok(usage_ratio.ceil() as i32);
        }
        if (1.0 - usage_ratio).abs() <= self.tolerance {
            return Ok(current_replicas);
        }
        let ready_pods = self
            .get_ready_pods_count(namespace, selector)
            .await
            .with_context(|| "unable to calculate ready pods")?;
        Ok((usage_ratio * ready_pods as f64).ceil() as i32)
    }

    /// Replica count and average usage for a per-pod target over a total usage.
    fn per_pod_replicas(&self, status_replicas: i32, usage: i64, target_average_usage: i64) -> (i32, i64) {
        let mut replicas = status_replicas;
        let usage_ratio = usage as f64 / (target_average_usage as f64 * status_replicas as f64);
        if (1.0 - usage_ratio).abs() > self.tolerance {
            replicas = (usage as f64 / target_average_usage as f64).ceil() as i32;
        }
        let average = (usage as f64 / status_replicas.max(1) as f64).ceil() as i64;
        (replicas, average)
    }

    /// Sort the pods into ready, unready, missing and ignored ones.
    /// Deleted and failed pods are ignored, pending pods are unready.
    /// CPU samples taken while a pod was starting up don't count either.
    fn group_pods(
        &self,
        pods: &[Pod],
        metrics: &PodMetricsInfo,
        resource: Option<&Resource>,
        now: NaiveDateTime,
    ) -> PodGroups {
        let mut groups = PodGroups::default();
        for pod in pods {
            let name = pod.metadata.name.to_owned();
            let phase = pod.phase();
            if pod.metadata.deletion_timestamp.is_some() || phase == PodPhase::Failed {
                groups.ignored.insert(name);
                continue;
            }
            if phase == PodPhase::Pending {
                groups.unready.insert(name);
                continue;
            }
            let metric = match metrics.get(&name) {
                Some(metric) => metric,
                None => {
                    tracing::debug!("No metrics found for pod {}", name);
                    groups.missing.insert(name);
                    continue;
                },
            };
            if resource == Some(&Resource::CPU) && self.cpu_sample_unready(pod, metric, now) {
                tracing::debug!("Ignored CPU sample of pod {} since it's not ready", name);
                groups.unready.insert(name);
                continue;
            }
            groups.ready_count += 1;
        }
        groups
    }

    fn cpu_sample_unready(&self, pod: &Pod, metric: &PodMetric, now: NaiveDateTime) -> bool {
        let status = match &pod.status {
            Some(status) => status,
            None => return true,
        };
        let (condition, start_time) = match (
            status.conditions.get(&PodConditionType::Ready),
            status.start_time,
        ) {
            (Some(condition), Some(start_time)) => (condition, start_time),
            _ => return true,
        };
        let transition = condition.last_transition_time.unwrap_or(start_time);
        if start_time + self.cpu_initialization_period > now {
            // Unready, or no full metric window collected since the last transition
            !condition.status
                || metric.timestamp < transition + Duration::seconds(metric.window as i64)
        } else {
            // Never became ready after the initial readiness delay
            !condition.status && start_time + self.delay_of_initial_readiness_status > transition
        }
    }

    async fn get_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>> {
        let pods = self
            .pods
            .list_pods(Some(namespace), selector)
            .await
            .with_context(|| "unable to get pods while calculating replica count")?;
        if pods.is_empty() {
            return Err(anyhow!(
                "no pods returned by selector while calculating replica count"
            ));
        }
        Ok(pods)
    }

    async fn get_ready_pods_count(&self, namespace: &str, selector: &Selector) -> Result<usize> {
        let pods = self.get_pods(namespace, selector).await?;
        Ok(pods
            .iter()
            .filter(|pod| pod.phase() == PodPhase::Running && pod.is_ready())
            .count())
    }
}

fn remove_metrics_for_pods(metrics: &mut PodMetricsInfo, pods: &HashSet<String>) {
    for pod in pods {
        metrics.remove(pod);
    }
}

fn insert_metric(metrics: &mut PodMetricsInfo, pod_name: &str, value: i64, timestamp: NaiveDateTime) {
    metrics.insert(
        pod_name.to_owned(),
        PodMetric {
            timestamp,
            window: 0,
            value,
        },
    );
}

/// Requests of the resource per pod, summed over the containers
/// or taken from the named container only.
fn calc_pod_requests(
    pods: &[Pod],
    resource: &Resource,
    container: Option<&str>,
) -> Result<HashMap<String, i64>> {
    let mut requests = HashMap::new();
    for pod in pods {
        let mut pod_sum = 0;
        for c in pod
            .spec
            .containers
            .iter()
            .filter(|c| container.map_or(true, |name| c.name == name))
        {
            match c.resources.requests.get(resource) {
                Some(request) => pod_sum += *request,
                None => {
                    return Err(anyhow!(
                        "missing request for {} in container {} of Pod {}",
                        resource,
                        c.name,
                        pod.metadata.name
                    ))
                },
            }
        }
        requests.insert(pod.metadata.name.to_owned(), pod_sum);
    }
    Ok(requests)
}

/// Ratio of the utilization to the target, the utilization in percent
/// and the average raw usage, over the pods with known requests.
fn utilization_ratio(
    metrics: &PodMetricsInfo,
    requests: &HashMap<String, i64>,
    target_utilization: i32,
) -> Result<(f64, i32, i64)> {
    let mut metrics_total = 0;
    let mut requests_total = 0;
    let mut entries = 0;
    for (pod_name, metric) in metrics {
        if let Some(request) = requests.get(pod_name) {
            metrics_total += metric.value;
            requests_total += *request;
            entries += 1;
        }
    }
    if requests_total == 0 {
        return Err(anyhow!("no metrics returned matched known pods"));
    }
    let utilization = (metrics_total * 100 / requests_total) as i32;
    Ok((
        utilization as f64 / target_utilization as f64,
        utilization,
        metrics_total / entries,
    ))
}

/// Ratio of the average usage to the target, and the average usage.
fn metric_usage_ratio(metrics: &PodMetricsInfo, target_usage: i64) -> (f64, i64) {
    let metrics_total = metrics.values().map(|m| m.value).sum::<i64>();
    let usage = metrics_total / metrics.len().max(1) as i64;
    (usage as f64 / target_usage as f64, usage)
}

#[cfg(test)]
mod tests {
    use resources::objects::{
        metrics::{ContainerMetrics, ExternalMetricValue, MetricValue, PodMetrics, ResourceList},
        pod::{Container, PodCondition, PodSpec, PodStatus, ResourceRequirements},
        Labels, Metadata,
    };

    use super::*;
    use crate::testing::{time, FakeApi};

    fn now() -> NaiveDateTime {
        time(12, 0, 0)
    }

    fn pod(name: &str, phase: PodPhase, ready: bool, cpu_request: i64) -> Pod {
        let mut metadata = Metadata::new("default", name);
        metadata.labels = Labels::from([("app", "web")]);
        let mut status = PodStatus {
            phase,
            start_time: Some(now() - Duration::hours(1)),
            ..Default::default()
        };
        status.conditions.insert(
            PodConditionType::Ready,
            PodCondition {
                status: ready,
                last_transition_time: Some(now() - Duration::minutes(50)),
            },
        );
        Pod {
            metadata,
            spec: PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    resources: ResourceRequirements {
                        requests: ResourceList::from([(Resource::CPU, cpu_request)]),
                        ..Default::default()
                    },
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: Some(status),
        }
    }

    fn usage(name: &str, cpu: i64) -> PodMetrics {
        PodMetrics {
            name: name.to_string(),
            namespace: "default".to_string(),
            labels: Labels::from([("app", "web")]),
            timestamp: now() - Duration::seconds(30),
            window: 30,
            containers: vec![ContainerMetrics {
                name: "app".to_string(),
                usage: ResourceList::from([(Resource::CPU, cpu)]),
            }],
        }
    }

    fn calculator(api: &Arc<FakeApi>) -> ReplicaCalculator {
        ReplicaCalculator::new(api.clone(), api.clone(), &RecommenderConfig::default())
    }

    fn selector() -> Selector {
        Selector::parse("app=web").unwrap()
    }

    async fn by_utilization(api: &Arc<FakeApi>, current: i32, target: i32) -> Result<ReplicaCount> {
        calculator(api)
            .calc_replicas_by_utilization(
                current,
                target,
                &Resource::CPU,
                "default",
                &selector(),
                None,
                now(),
            )
            .await
    }

    #[tokio::test]
    async fn scale_up_on_cpu_utilization() {
        let api = Arc::new(FakeApi::default());
        for name in ["web-1", "web-2", "web-3"] {
            api.pods.lock().push(pod(name, PodPhase::Running, true, 100));
            api.pod_metrics.lock().push(usage(name, 100));
        }
        let count = by_utilization(&api, 3, 50).await.unwrap();
        assert_eq!(count.replicas, 6);
        assert_eq!(count.utilization, Some(100));
        assert_eq!(count.usage, 100);
    }

    #[tokio::test]
    async fn within_tolerance_keeps_current() {
        let api = Arc::new(FakeApi::default());
        for name in ["web-1", "web-2"] {
            api.pods.lock().push(pod(name, PodPhase::Running, true, 100));
            api.pod_metrics.lock().push(usage(name, 52));
        }
        let count = by_utilization(&api, 2, 50).await.unwrap();
        assert_eq!(count.replicas, 2);
    }

    #[tokio::test]
    async fn missing_pods_dampen_scale_down() {
        let api = Arc::new(FakeApi::default());
        for name in ["web-1", "web-2", "web-3", "web-4"] {
            api.pods.lock().push(pod(name, PodPhase::Running, true, 100));
        }
        // Two pods report 10% usage, two report nothing
        api.pod_metrics.lock().push(usage("web-1", 10));
        api.pod_metrics.lock().push(usage("web-2", 10));
        let count = by_utilization(&api, 4, 50).await.unwrap();
        // Missing pods count as fully used: (10 + 10 + 100 + 100) / 400 = 55%,
        // which would flip the scale direction
        assert_eq!(count.replicas, 4);
    }

    #[tokio::test]
    async fn unready_pods_dampen_scale_up() {
        let api = Arc::new(FakeApi::default());
        api.pods.lock().push(pod("web-1", PodPhase::Running, true, 100));
        api.pods.lock().push(pod("web-2", PodPhase::Pending, false, 100));
        api.pods.lock().push(pod("web-3", PodPhase::Failed, false, 100));
        api.pod_metrics.lock().push(usage("web-1", 200));
        api.pod_metrics.lock().push(usage("web-3", 900));
        let count = by_utilization(&api, 3, 50).await.unwrap();
        // The failed pod is ignored, the pending one counts as idle: 200 / 200 = 100%
        assert_eq!(count.utilization, Some(200));
        assert_eq!(count.replicas, 4);
    }

    #[tokio::test]
    async fn cpu_samples_of_starting_pods_are_skipped() {
        let api = Arc::new(FakeApi::default());
        let mut starting = pod("web-2", PodPhase::Running, true, 100);
        if let Some(status) = starting.status.as_mut() {
            status.start_time = Some(now() - Duration::minutes(1));
            if let Some(ready) = status.conditions.get_mut(&PodConditionType::Ready) {
                // Became ready after the sample window started
                ready.last_transition_time = Some(now() - Duration::seconds(40));
            }
        }
        api.pods.lock().push(pod("web-1", PodPhase::Running, true, 100));
        api.pods.lock().push(starting);
        api.pod_metrics.lock().push(usage("web-1", 40));
        api.pod_metrics.lock().push(usage("web-2", 100));
        let count = by_utilization(&api, 2, 50).await.unwrap();
        assert_eq!(count.utilization, Some(40));
        // 0.8 of one ready pod
        assert_eq!(count.replicas, 1);
    }

    #[tokio::test]
    async fn missing_request_is_an_error() {
        let api = Arc::new(FakeApi::default());
        let mut no_request = pod("web-1", PodPhase::Running, true, 100);
        no_request.spec.containers[0].resources.requests.clear();
        api.pods.lock().push(no_request);
        api.pod_metrics.lock().push(usage("web-1", 100));
        let err = by_utilization(&api, 1, 50).await.unwrap_err();
        assert!(err.to_string().contains("missing request for cpu"));
    }

    #[tokio::test]
    async fn no_pods_is_an_error() {
        let api = Arc::new(FakeApi::default());
        api.pod_metrics.lock().push(usage("web-1", 100));
        let err = by_utilization(&api, 1, 50).await.unwrap_err();
        assert!(format!("{:#}", err).contains("no pods returned by selector"));
    }

    #[tokio::test]
    async fn raw_value_target() {
        let api = Arc::new(FakeApi::default());
        for name in ["web-1", "web-2"] {
            api.pods.lock().push(pod(name, PodPhase::Running, true, 100));
            api.pod_metrics.lock().push(usage(name, 300));
        }
        let count = calculator(&api)
            .calc_replicas_by_value(2, 100, &Resource::CPU, "default", &selector(), None, now())
            .await
            .unwrap();
        assert_eq!(count.replicas, 6);
        assert_eq!(count.usage, 300);
        assert_eq!(count.utilization, None);
    }

    #[tokio::test]
    async fn pods_metric_average() {
        let api = Arc::new(FakeApi::default());
        let mut values = vec![];
        for name in ["web-1", "web-2"] {
            api.pods.lock().push(pod(name, PodPhase::Running, true, 100));
            values.push(MetricValue {
                described_object: CrossVersionObjectReference::new("v1", "Pod", name),
                metric_name: "qps".to_string(),
                timestamp: now(),
                window: 60,
                value: 20_000,
            });
        }
        api.pods_metrics.lock().insert("qps".to_string(), values);
        let count = calculator(&api)
            .calc_replicas_by_pods_metric(
                2,
                10_000,
                "qps",
                "default",
                &selector(),
                &Selector::everything(),
                now(),
            )
            .await
            .unwrap();
        assert_eq!(count.replicas, 4);
        assert_eq!(count.usage, 20_000);
    }

    #[tokio::test]
    async fn object_metric_scales_ready_pods() {
        let api = Arc::new(FakeApi::default());
        api.pods.lock().push(pod("web-1", PodPhase::Running, true, 100));
        api.pods.lock().push(pod("web-2", PodPhase::Running, false, 100));
        let ingress = CrossVersionObjectReference::new("networking/v1", "Ingress", "main");
        api.object_metrics.lock().insert(
            "requests".to_string(),
            MetricValue {
                described_object: ingress.to_owned(),
                metric_name: "requests".to_string(),
                timestamp: now(),
                window: 60,
                value: 3000,
            },
        );
        let calculator = calculator(&api);
        let count = calculator
            .calc_replicas_by_object_metric(
                2,
                1000,
                "requests",
                "default",
                &ingress,
                &selector(),
                &Selector::everything(),
            )
            .await
            .unwrap();
        // Ratio 3 over the single ready pod
        assert_eq!(count.replicas, 3);
        assert_eq!(count.usage, 3000);

        let count = calculator
            .calc_replicas_by_object_per_pod_metric(
                2,
                500,
                "requests",
                "default",
                &ingress,
                &Selector::everything(),
            )
            .await
            .unwrap();
        assert_eq!(count.replicas, 6);
        assert_eq!(count.usage, 1500);
    }

    #[tokio::test]
    async fn external_metric_is_summed() {
        let api = Arc::new(FakeApi::default());
        for name in ["web-1", "web-2"] {
            api.pods.lock().push(pod(name, PodPhase::Running, true, 100));
        }
        let value = |value| ExternalMetricValue {
            metric_name: "queue_length".to_string(),
            metric_labels: Labels::new(),
            timestamp: now(),
            value,
        };
        api.external_metrics
            .lock()
            .insert("queue_length".to_string(), vec![value(4000), value(2000)]);
        let calculator = calculator(&api);
        let count = calculator
            .calc_replicas_by_external_metric(
                2,
                2000,
                "queue_length",
                "default",
                &Selector::everything(),
                &selector(),
            )
            .await
            .unwrap();
        assert_eq!(count.replicas, 6);
        assert_eq!(count.usage, 6000);

        // Within tolerance of the target average
        let count = calculator
            .calc_replicas_by_external_per_pod_metric(
                2,
                3000,
                "queue_length",
                "default",
                &Selector::everything(),
            )
            .await
            .unwrap();
        assert_eq!(count.replicas, 2);
        assert_eq!(count.usage, 3000);
    }
}
