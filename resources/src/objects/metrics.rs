use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use super::{object_reference::CrossVersionObjectReference, Labels};

#[derive(
    Debug, Serialize, Deserialize, Hash, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Display, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Resource {
    /// CPU in millicores.
    CPU,
    /// Memory in bytes.
    Memory,
}

/// Amounts of compute resources.
/// CPU is expressed in millicores, memory in bytes.
pub type ResourceList = BTreeMap<Resource, i64>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Metrics of containers in a pod.
pub struct PodMetrics {
    /// Pod name
    pub name: String,
    /// Pod namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Labels of the pod at collection time.
    #[serde(default)]
    pub labels: Labels,
    /// Start of the collection window.
    pub timestamp: NaiveDateTime,
    /// Duration in seconds over which the metrics were gathered.
    pub window: u32,
    /// Metrics for all containers collected within the same time window.
    pub containers: Vec<ContainerMetrics>,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ContainerMetrics {
    pub name: String,
    pub usage: ResourceList,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
/// An overall summary of PodMetrics.
pub struct PodMetric {
    pub timestamp: NaiveDateTime,
    /// Duration in seconds over which the metrics were gathered.
    pub window: u32,
    pub value: i64,
}

/// A mapping from pod names to metrics.
pub type PodMetricsInfo = HashMap<String, PodMetric>;

/// A custom metric value reported for a single object, in milli-units.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricValue {
    /// The object the metric describes, a pod for per-pod metrics.
    pub described_object: CrossVersionObjectReference,
    pub metric_name: String,
    pub timestamp: NaiveDateTime,
    /// Duration in seconds over which the value was gathered.
    #[serde(default)]
    pub window: u32,
    /// Value in milli-units.
    pub value: i64,
}

/// An external metric sample, in milli-units.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMetricValue {
    pub metric_name: String,
    #[serde(default)]
    pub metric_labels: Labels,
    pub timestamp: NaiveDateTime,
    /// Value in milli-units.
    pub value: i64,
}
