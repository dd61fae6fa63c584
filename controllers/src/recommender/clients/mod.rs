use anyhow::Result;
use async_trait::async_trait;
use resources::objects::{
    checkpoint::VerticalPodAutoscalerCheckpoint,
    labels::Selector,
    metrics::{ExternalMetricValue, MetricValue, PodMetrics},
    mpa::{MultidimPodAutoscaler, MultidimPodAutoscalerStatus},
    object_reference::CrossVersionObjectReference,
    pod::Pod,
    scale::Scale,
    Metadata,
};
use strum::Display;
use thiserror::Error;

pub mod api;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The API server answered 404 for a single object.
    #[error("{0} not found")]
    NotFound(String),
}

/// Whether an error comes from reading an object that doesn't exist.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ClientError>(), Some(ClientError::NotFound(_)))
}

#[async_trait]
pub trait MpaClient: Send + Sync {
    async fn list_mpas(&self) -> Result<Vec<MultidimPodAutoscaler>>;

    /// Replace the status of an MPA with a JSON patch.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MultidimPodAutoscalerStatus,
    ) -> Result<()>;
}

#[async_trait]
pub trait PodLister: Send + Sync {
    /// Pods in `namespace` (all namespaces if None) matching `selector`.
    async fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Pod>>;
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Resource usage snapshots of the containers of matching pods.
    async fn get_pod_metrics(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<PodMetrics>>;

    /// A custom metric for each matching pod.
    async fn get_pods_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        selector: &Selector,
        metric_selector: &Selector,
    ) -> Result<Vec<MetricValue>>;

    /// A custom metric describing a single object.
    async fn get_object_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        object: &CrossVersionObjectReference,
        metric_selector: &Selector,
    ) -> Result<MetricValue>;

    async fn get_external_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        metric_selector: &Selector,
    ) -> Result<Vec<ExternalMetricValue>>;
}

#[async_trait]
pub trait ScaleClient: Send + Sync {
    /// Read the scale subresource of the referenced object.
    async fn get_scale(
        &self,
        namespace: &str,
        target: &CrossVersionObjectReference,
    ) -> Result<Scale>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EventType {
    Normal,
    Warning,
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn event(
        &self,
        mpa: &MultidimPodAutoscaler,
        event_type: EventType,
        reason: &str,
        message: &str,
    );
}

#[async_trait]
pub trait CheckpointClient: Send + Sync {
    /// Checkpoints in `namespace`, or in every namespace if None.
    async fn list_checkpoints(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<VerticalPodAutoscalerCheckpoint>>;

    async fn create_or_update_checkpoint(
        &self,
        checkpoint: &VerticalPodAutoscalerCheckpoint,
    ) -> Result<()>;

    async fn delete_checkpoint(&self, namespace: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Metadata of a controller object, None if it doesn't exist.
    async fn get_metadata(
        &self,
        namespace: &str,
        target: &CrossVersionObjectReference,
    ) -> Result<Option<Metadata>>;
}
