use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use super::{metrics::ResourceList, Metadata, Object};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Pod {
    pub metadata: Metadata,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: Option<PodStatus>,
}

impl Object for Pod {
    fn kind(&self) -> &'static str {
        "Pod"
    }

    fn name(&self) -> &String {
        &self.metadata.name
    }

    fn namespace(&self) -> &String {
        &self.metadata.namespace
    }
}

impl Pod {
    pub fn phase(&self) -> PodPhase {
        self.status
            .as_ref()
            .map(|s| s.phase.to_owned())
            .unwrap_or(PodPhase::Pending)
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.get(&PodConditionType::Ready))
            .map_or(false, |c| c.status)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// List of containers belonging to the pod.
    /// Containers cannot currently be added or removed.
    /// There must be at least one container in a Pod. Cannot be updated.
    pub containers: Vec<Container>,
    /// NodeName is a request to schedule this pod onto a specific node.
    pub node_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Name of the container specified as a DNS_LABEL.
    /// Each container in a pod must have a unique name (DNS_LABEL).
    /// Cannot be updated.
    pub name: String,
    /// Docker image name.
    #[serde(default)]
    pub image: String,
    /// Compute Resources required by this container.
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ResourceRequirements {
    /// Minimum amount of compute resources required.
    pub requests: ResourceList,
    /// Maximum amount of compute resources allowed.
    pub limits: ResourceList,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStatus {
    /// RFC 3339 date and time at which the object was acknowledged by the Kubelet.
    /// This is before the Kubelet pulled the container image(s) for the pod.
    pub start_time: Option<NaiveDateTime>,
    /// The phase of a Pod is a simple, high-level summary
    /// of where the Pod is in its lifecycle.
    pub phase: PodPhase,
    /// Current service state of pod.
    pub conditions: HashMap<PodConditionType, PodCondition>,
    /// The list has one entry per container in the manifest.
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, Display)]
pub enum PodPhase {
    /// All containers in the pod have terminated,
    /// and at least one container has terminated in failure.
    Failed,
    /// The pod has been accepted by the system,
    /// but one or more of the containers has not been created.
    #[default]
    Pending,
    /// The pod has been bound to a node,
    /// and all of the containers have been created.
    Running,
    /// All containers in the pod have terminated in success,
    /// and will not be restarted.
    Succeeded,
    /// The state of the pod could not be obtained.
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, EnumIter, Clone)]
pub enum PodConditionType {
    /// All containers in the pod are ready.
    ContainersReady,
    /// All init containers have completed successfully.
    Initialized,
    /// The pod has been scheduled to a node.
    PodScheduled,
    /// The pod is able to serve requests
    /// and should be added to the load balancing pools of all matching Services.
    Ready,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    /// Status is the status of the condition.
    pub status: bool,
    /// Last time the condition transitioned from one status to another.
    #[serde(default)]
    pub last_transition_time: Option<NaiveDateTime>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerStatus {
    /// This must be a DNS_LABEL.
    /// Each container in a pod must have a unique name.
    pub name: String,
    /// The number of times the container has been restarted.
    pub restart_count: u32,
    /// Details about the container's last termination condition.
    pub last_state: Option<ContainerStateTerminated>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStateTerminated {
    /// Exit status from the last termination of the container.
    #[serde(default)]
    pub exit_code: i32,
    /// Brief reason from the last termination of the container, e.g. `OOMKilled`.
    #[serde(default)]
    pub reason: String,
    /// Time at which the container last terminated.
    pub finished_at: NaiveDateTime,
}
