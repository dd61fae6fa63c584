use std::fmt::{Display, Formatter};

use chrono::NaiveDateTime;
use resources::objects::metrics::Resource;

pub mod aggregation;
pub mod cluster;
pub mod conditions;
pub mod container;
pub mod histogram;
pub mod mpa;

/// Resources above this amount are clamped.
pub const MAX_RESOURCE_AMOUNT: i64 = 100_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodId {
    pub namespace: String,
    pub pod_name: String,
}

impl PodId {
    pub fn new(namespace: &str, pod_name: &str) -> Self {
        PodId {
            namespace: namespace.to_string(),
            pod_name: pod_name.to_string(),
        }
    }
}

impl Display for PodId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId {
    pub pod_id: PodId,
    pub container_name: String,
}

impl ContainerId {
    pub fn new(namespace: &str, pod_name: &str, container_name: &str) -> Self {
        ContainerId {
            pod_id: PodId::new(namespace, pod_name),
            container_name: container_name.to_string(),
        }
    }
}

impl Display for ContainerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pod_id, self.container_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MpaId {
    pub namespace: String,
    pub mpa_name: String,
}

impl MpaId {
    pub fn new(namespace: &str, mpa_name: &str) -> Self {
        MpaId {
            namespace: namespace.to_string(),
            mpa_name: mpa_name.to_string(),
        }
    }
}

impl Display for MpaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.mpa_name)
    }
}

/// Identifies an aggregation: containers with the same name
/// in pods with the same namespace and labels.
///
/// Labels are referred to by their interned string form,
/// see [`cluster::ClusterState::label_set`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateStateKey {
    pub namespace: String,
    pub container_name: String,
    pub labels_key: String,
}

impl Display for AggregateStateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} [{}]",
            self.namespace, self.container_name, self.labels_key
        )
    }
}

/// A single usage measurement of one resource of a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerUsageSample {
    /// Start of the measurement interval.
    pub measure_start: NaiveDateTime,
    /// Average usage within the interval, millicores or bytes.
    pub usage: i64,
    /// Request of the container at the time of the measurement.
    pub request: i64,
    pub resource: Resource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerUsageSampleWithKey {
    pub sample: ContainerUsageSample,
    pub container: ContainerId,
}

pub fn cores_from_cpu_amount(millicores: i64) -> f64 {
    millicores as f64 / 1000.0
}

pub fn cpu_amount_from_cores(cores: f64) -> i64 {
    resource_amount_from_float(cores * 1000.0)
}

pub fn memory_amount_from_bytes(bytes: f64) -> i64 {
    resource_amount_from_float(bytes)
}

/// Multiply an amount by a factor, clamping the result into `[0, MAX_RESOURCE_AMOUNT]`.
pub fn scale_resource(amount: i64, factor: f64) -> i64 {
    resource_amount_from_float(amount as f64 * factor)
}

fn resource_amount_from_float(amount: f64) -> i64 {
    if amount.is_nan() || amount < 0.0 {
        0
    } else if amount > MAX_RESOURCE_AMOUNT as f64 {
        MAX_RESOURCE_AMOUNT
    } else {
        amount as i64
    }
}
