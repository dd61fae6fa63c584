use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use reqwest::{Client, RequestBuilder, StatusCode};
use resources::{
    config::ClusterConfig,
    models::{ErrResponse, Response},
    objects::{
        checkpoint::VerticalPodAutoscalerCheckpoint,
        labels::Selector,
        metrics::{ExternalMetricValue, MetricValue, PodMetrics},
        mpa::{MultidimPodAutoscaler, MultidimPodAutoscalerStatus},
        object_reference::CrossVersionObjectReference,
        pod::Pod,
        scale::Scale,
        Metadata, Object,
    },
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

use super::{
    CheckpointClient, ClientError, EventRecorder, EventType, MetricsSource, MpaClient,
    ObjectFetcher, PodLister, ScaleClient,
};

const CHECKPOINTS: &str = "verticalpodautoscalercheckpoints";

/// Client of the API server, implementing every collaborator of the recommender.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    metadata: Metadata,
}

impl ApiClient {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.api_server_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, namespace: Option<&str>, path: &str) -> String {
        match namespace {
            Some(namespace) => format!(
                "{}/api/v1/namespaces/{}/{}",
                self.base_url, namespace, path
            ),
            None => format!("{}/api/v1/{}", self.base_url, path),
        }
    }

    /// GET an object wrapped in a [`Response`]. A 404 yields None.
    async fn get<T>(&self, url: String, query: &[(&str, String)]) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .json::<Response<T>>()
            .await
            .with_context(|| format!("Failed to decode response of {}", url))?;
        match response.data {
            Some(data) => Ok(Some(data)),
            None => Err(anyhow!(
                "Empty response from {}: {}",
                url,
                response.msg.unwrap_or_default()
            )),
        }
    }

    async fn get_required<T>(&self, url: String, query: &[(&str, String)]) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.get(url.to_owned(), query)
            .await?
            .ok_or_else(|| ClientError::NotFound(url).into())
    }

    /// Send a write request, turning error replies into errors.
    async fn write(&self, request: RequestBuilder, what: &str) -> Result<()> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to {}", what))?;
        if response.status().is_success() {
            let response = response.json::<Response<()>>().await?;
            if let Some(msg) = response.msg {
                tracing::debug!("{}", msg);
            }
            Ok(())
        } else if response.status() == StatusCode::NOT_FOUND {
            Err(ClientError::NotFound(what.to_string()).into())
        } else {
            let err = response.json::<ErrResponse>().await?;
            Err(anyhow!(
                "Failed to {}: {}{}",
                what,
                err.msg,
                err.cause.map(|c| format!(", caused by: {}", c)).unwrap_or_default()
            ))
        }
    }
}

/// The collection name of a kind, e.g. `deployments` for `Deployment`.
fn resource_path(kind: &str) -> String {
    format!("{}s", kind.to_lowercase())
}

fn selector_query(key: &'static str, selector: &Selector) -> Vec<(&'static str, String)> {
    if selector.is_empty() {
        vec![]
    } else {
        vec![(key, selector.to_string())]
    }
}

#[async_trait]
impl MpaClient for ApiClient {
    async fn list_mpas(&self) -> Result<Vec<MultidimPodAutoscaler>> {
        let url = self.url(None, "multidimpodautoscalers");
        Ok(self.get(url, &[]).await?.unwrap_or_default())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MultidimPodAutoscalerStatus,
    ) -> Result<()> {
        let url = self.url(
            Some(namespace),
            &format!("multidimpodautoscalers/{}/status", name),
        );
        let patch = json!([{ "op": "add", "path": "/status", "value": status }]);
        self.write(
            self.client.patch(url).json(&patch),
            &format!("patch status of MPA {}/{}", namespace, name),
        )
        .await
    }
}

#[async_trait]
impl PodLister for ApiClient {
    async fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Pod>> {
        if *selector == Selector::Nothing {
            return Ok(vec![]);
        }
        let url = self.url(namespace, "pods");
        let pods: Vec<Pod> = self
            .get(url, &selector_query("selector", selector))
            .await?
            .unwrap_or_default();
        // Filter again, the server may not support every selector form
        Ok(pods
            .into_iter()
            .filter(|pod| selector.matches(&pod.metadata.labels))
            .collect())
    }
}

#[async_trait]
impl MetricsSource for ApiClient {
    async fn get_pod_metrics(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<PodMetrics>> {
        if *selector == Selector::Nothing {
            return Ok(vec![]);
        }
        let url = self.url(namespace, "metrics/pods");
        Ok(self
            .get(url, &selector_query("selector", selector))
            .await?
            .unwrap_or_default())
    }

    async fn get_pods_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        selector: &Selector,
        metric_selector: &Selector,
    ) -> Result<Vec<MetricValue>> {
        let url = self.url(
            Some(namespace),
            &format!("custommetrics/pods/{}", metric_name),
        );
        let mut query = selector_query("selector", selector);
        query.extend(selector_query("metricSelector", metric_selector));
        self.get_required(url, &query).await
    }

    async fn get_object_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        object: &CrossVersionObjectReference,
        metric_selector: &Selector,
    ) -> Result<MetricValue> {
        let url = self.url(
            Some(namespace),
            &format!(
                "custommetrics/{}/{}/{}",
                resource_path(&object.kind),
                object.name,
                metric_name
            ),
        );
        self.get_required(url, &selector_query("metricSelector", metric_selector))
            .await
    }

    async fn get_external_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        metric_selector: &Selector,
    ) -> Result<Vec<ExternalMetricValue>> {
        let url = self.url(
            Some(namespace),
            &format!("externalmetrics/{}", metric_name),
        );
        self.get_required(url, &selector_query("metricSelector", metric_selector))
            .await
    }
}

#[async_trait]
impl ScaleClient for ApiClient {
    async fn get_scale(
        &self,
        namespace: &str,
        target: &CrossVersionObjectReference,
    ) -> Result<Scale> {
        let url = self.url(
            Some(namespace),
            &format!("{}/{}/scale", resource_path(&target.kind), target.name),
        );
        self.get_required(url, &[]).await
    }
}

#[async_trait]
impl ObjectFetcher for ApiClient {
    async fn get_metadata(
        &self,
        namespace: &str,
        target: &CrossVersionObjectReference,
    ) -> Result<Option<Metadata>> {
        let url = self.url(
            Some(namespace),
            &format!("{}/{}", resource_path(&target.kind), target.name),
        );
        let object: Option<ObjectMeta> = self.get(url, &[]).await?;
        Ok(object.map(|o| o.metadata))
    }
}

#[async_trait]
impl CheckpointClient for ApiClient {
    async fn list_checkpoints(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<VerticalPodAutoscalerCheckpoint>> {
        let url = self.url(namespace, CHECKPOINTS);
        Ok(self.get(url, &[]).await?.unwrap_or_default())
    }

    async fn create_or_update_checkpoint(
        &self,
        checkpoint: &VerticalPodAutoscalerCheckpoint,
    ) -> Result<()> {
        let url = self.url(
            Some(checkpoint.namespace()),
            &format!("{}/{}", CHECKPOINTS, checkpoint.name()),
        );
        self.write(
            self.client.put(url).json(checkpoint),
            &format!("store checkpoint {}", checkpoint.key()),
        )
        .await
    }

    async fn delete_checkpoint(&self, namespace: &str, name: &str) -> Result<()> {
        let url = self.url(Some(namespace), &format!("{}/{}", CHECKPOINTS, name));
        self.write(
            self.client.delete(url),
            &format!("delete checkpoint {}/{}", namespace, name),
        )
        .await
    }
}

#[async_trait]
impl EventRecorder for ApiClient {
    async fn event(
        &self,
        mpa: &MultidimPodAutoscaler,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let url = self.url(Some(mpa.namespace()), "events");
        let event = json!({
            "involvedObject": {
                "kind": mpa.kind(),
                "namespace": mpa.namespace(),
                "name": mpa.name(),
            },
            "type": event_type.to_string(),
            "reason": reason,
            "message": message,
            "source": { "component": "mpa-recommender" },
            "timestamp": Local::now().naive_utc(),
        });
        let result = self
            .write(
                self.client.post(url).json(&event),
                &format!("record event {} for MPA {}", reason, mpa.key()),
            )
            .await;
        if let Err(err) = result {
            tracing::warn!("{:#}", err);
        }
    }
}
