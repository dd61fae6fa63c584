//! In-memory API server used by the tests.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use resources::objects::{
    checkpoint::VerticalPodAutoscalerCheckpoint,
    labels::Selector,
    metrics::{ExternalMetricValue, MetricValue, PodMetrics},
    mpa::{MultidimPodAutoscaler, MultidimPodAutoscalerStatus},
    object_reference::CrossVersionObjectReference,
    pod::Pod,
    scale::Scale,
    Object,
};

use crate::{
    clients::{
        CheckpointClient, ClientError, EventRecorder, EventType, MetricsSource, MpaClient,
        PodLister, ScaleClient,
    },
    target::{ControllerFetcher, ControllerKeyWithApiVersion},
};

pub fn time(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2022, 6, 1)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .unwrap()
}

#[derive(Default)]
pub struct FakeApi {
    pub mpas: Mutex<Vec<MultidimPodAutoscaler>>,
    /// Patched statuses by MPA key.
    pub statuses: Mutex<BTreeMap<String, MultidimPodAutoscalerStatus>>,
    pub pods: Mutex<Vec<Pod>>,
    pub pod_metrics: Mutex<Vec<PodMetrics>>,
    /// Per-pod custom metrics by metric name.
    pub pods_metrics: Mutex<HashMap<String, Vec<MetricValue>>>,
    /// Object metrics by metric name.
    pub object_metrics: Mutex<HashMap<String, MetricValue>>,
    pub external_metrics: Mutex<HashMap<String, Vec<ExternalMetricValue>>>,
    /// Scales by target name.
    pub scales: Mutex<HashMap<String, Scale>>,
    pub events: Mutex<Vec<(EventType, String, String)>>,
    /// Checkpoints by `namespace/name`.
    pub checkpoints: Mutex<BTreeMap<String, VerticalPodAutoscalerCheckpoint>>,
    /// Makes every checkpoint write fail.
    pub reject_checkpoints: Mutex<bool>,
    /// Top-most controllers by controller name. Unlisted controllers are their own top-most.
    pub top_most: Mutex<HashMap<String, Result<Option<ControllerKeyWithApiVersion>, String>>>,
}

impl FakeApi {
    pub fn event_reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, reason, _)| reason.to_owned()).collect()
    }
}

#[async_trait]
impl MpaClient for FakeApi {
    async fn list_mpas(&self) -> Result<Vec<MultidimPodAutoscaler>> {
        Ok(self.mpas.lock().to_owned())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MultidimPodAutoscalerStatus,
    ) -> Result<()> {
        self.statuses
            .lock()
            .insert(format!("{}/{}", namespace, name), status.to_owned());
        Ok(())
    }
}

#[async_trait]
impl PodLister for FakeApi {
    async fn list_pods(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .iter()
            .filter(|pod| namespace.map_or(true, |ns| pod.namespace() == ns))
            .filter(|pod| selector.matches(&pod.metadata.labels))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MetricsSource for FakeApi {
    async fn get_pod_metrics(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<PodMetrics>> {
        Ok(self
            .pod_metrics
            .lock()
            .iter()
            .filter(|pod| namespace.map_or(true, |ns| pod.namespace == ns))
            .filter(|pod| selector.matches(&pod.labels))
            .cloned()
            .collect())
    }

    async fn get_pods_metric(
        &self,
        _namespace: &str,
        metric_name: &str,
        _selector: &Selector,
        _metric_selector: &Selector,
    ) -> Result<Vec<MetricValue>> {
        self.pods_metrics
            .lock()
            .get(metric_name)
            .cloned()
            .ok_or_else(|| anyhow!("no metric {}", metric_name))
    }

    async fn get_object_metric(
        &self,
        _namespace: &str,
        metric_name: &str,
        _object: &CrossVersionObjectReference,
        _metric_selector: &Selector,
    ) -> Result<MetricValue> {
        self.object_metrics
            .lock()
            .get(metric_name)
            .cloned()
            .ok_or_else(|| anyhow!("no metric {}", metric_name))
    }

    async fn get_external_metric(
        &self,
        _namespace: &str,
        metric_name: &str,
        _metric_selector: &Selector,
    ) -> Result<Vec<ExternalMetricValue>> {
        self.external_metrics
            .lock()
            .get(metric_name)
            .cloned()
            .ok_or_else(|| anyhow!("no metric {}", metric_name))
    }
}

#[async_trait]
impl ScaleClient for FakeApi {
    async fn get_scale(
        &self,
        _namespace: &str,
        target: &CrossVersionObjectReference,
    ) -> Result<Scale> {
        self.scales
            .lock()
            .get(&target.name)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(target.to_string()).into())
    }
}

#[async_trait]
impl EventRecorder for FakeApi {
    async fn event(
        &self,
        _mpa: &MultidimPodAutoscaler,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events
            .lock()
            .push((event_type, reason.to_string(), message.to_string()));
    }
}

#[async_trait]
impl CheckpointClient for FakeApi {
    async fn list_checkpoints(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<VerticalPodAutoscalerCheckpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .values()
            .filter(|cp| namespace.map_or(true, |ns| cp.namespace() == ns))
            .cloned()
            .collect())
    }

    async fn create_or_update_checkpoint(
        &self,
        checkpoint: &VerticalPodAutoscalerCheckpoint,
    ) -> Result<()> {
        if *self.reject_checkpoints.lock() {
            return Err(anyhow!("checkpoint {} rejected", checkpoint.key()));
        }
        self.checkpoints
            .lock()
            .insert(checkpoint.key(), checkpoint.to_owned());
        Ok(())
    }

    async fn delete_checkpoint(&self, namespace: &str, name: &str) -> Result<()> {
        self.checkpoints
            .lock()
            .remove(&format!("{}/{}", namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(name.to_string()).into())
    }
}

#[async_trait]
impl ControllerFetcher for FakeApi {
    async fn find_topmost_well_known_or_scalable(
        &self,
        controller: &ControllerKeyWithApiVersion,
    ) -> Result<Option<ControllerKeyWithApiVersion>> {
        match self.top_most.lock().get(&controller.key.name) {
            Some(result) => result.to_owned().map_err(|err| anyhow!(err)),
            None => Ok(Some(controller.to_owned())),
        }
    }
}
