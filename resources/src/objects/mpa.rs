use std::fmt::{Display, Formatter};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::Display;

use super::{
    hpa::{HorizontalPodAutoscalerBehavior, MetricSpec, MetricStatus},
    metrics::{Resource, ResourceList},
    object_reference::CrossVersionObjectReference,
    Metadata, Object,
};

/// MultidimPodAutoscaler is the configuration for a multidimensional pod autoscaler,
/// which automatically manages pod resources and replica count
/// based on historical and real time resource utilization.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct MultidimPodAutoscaler {
    pub metadata: Metadata,
    /// Specification of the behavior of the autoscaler.
    pub spec: MultidimPodAutoscalerSpec,
    /// Current information about the autoscaler.
    #[serde(default)]
    pub status: MultidimPodAutoscalerStatus,
}

impl Object for MultidimPodAutoscaler {
    fn kind(&self) -> &'static str {
        "MultidimPodAutoscaler"
    }

    fn name(&self) -> &String {
        &self.metadata.name
    }

    fn namespace(&self) -> &String {
        &self.metadata.namespace
    }
}

impl Display for MultidimPodAutoscaler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<16} {}", "Name:", self.metadata.name)?;
        writeln!(f, "{:<16} {}", "Namespace:", self.metadata.namespace)?;
        if let Some(target) = &self.spec.scale_target_ref {
            writeln!(f, "{:<16} {}", "Target:", target)?;
        }
        write!(
            f,
            "{:<16} {} current / {} desired",
            "Replicas:", self.status.current_replicas, self.status.desired_replicas
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MultidimPodAutoscalerSpec {
    /// Points to the controller managing the set of pods for the autoscaler to control,
    /// e.g. Deployment or StatefulSet.
    pub scale_target_ref: Option<CrossVersionObjectReference>,
    /// Describes the rules on how changes are applied to the pods.
    /// If not specified, all fields get their default values.
    pub update_policy: Option<PodUpdatePolicy>,
    /// Controls how the autoscaler computes recommended resources.
    /// If not specified, the autoscaler computes recommended resources
    /// for all containers in the pod, without additional constraints.
    pub resource_policy: Option<PodResourcePolicy>,
    /// Recommender responsible for generating recommendation for this object.
    /// List should be empty (then the default recommender will generate the recommendation)
    /// or contain exactly one recommender.
    pub recommenders: Vec<RecommenderSelector>,
    /// Describes the constraints for horizontal and vertical scaling.
    pub constraints: Option<ScalingConstraints>,
    /// Contains the specifications for which to use
    /// to calculate the desired replica count.
    /// The maximum replica count across all metrics will be used.
    pub metrics: Vec<MetricSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RecommenderSelector {
    /// Name of the recommender responsible for generating recommendation for this object.
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ScalingConstraints {
    /// The lower limit for the number of replicas
    /// to which the autoscaler can scale down.
    /// It defaults to 1 pod.
    pub min_replicas: Option<i32>,
    /// The upper limit for the number of replicas
    /// to which the autoscaler can scale up.
    pub max_replicas: i32,
    /// Configures the scaling behavior of the target
    /// in both Up and Down directions.
    /// If not set, the recommender stabilizes scale down
    /// with its default window and limits scale up by a fixed rate.
    pub behavior: Option<HorizontalPodAutoscalerBehavior>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PodUpdatePolicy {
    /// Controls when autoscaler applies changes to the pod resources.
    /// The default is 'Auto'.
    pub update_mode: Option<UpdateMode>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
pub enum UpdateMode {
    /// The autoscaler never changes pod resources.
    Off,
    /// The autoscaler assigns resources on pod creation
    /// and doesn't change them during the lifetime of the pod.
    Initial,
    /// The autoscaler assigns resources on pod creation
    /// and additionally can update them during the lifetime of the pod.
    Recreate,
    /// The autoscaler assigns resources on pod creation
    /// and additionally can update them during the lifetime of the pod,
    /// using any available update method.
    Auto,
}

/// Controls how autoscaler computes the recommended resources
/// for containers belonging to the pod.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PodResourcePolicy {
    /// Per-container resource policies.
    pub container_policies: Vec<ContainerResourcePolicy>,
}

/// The name of the container policy applying to all containers
/// without a dedicated policy.
pub const DEFAULT_CONTAINER_RESOURCE_POLICY: &str = "*";

impl PodResourcePolicy {
    /// The policy for a container, falling back to the `*` entry.
    pub fn container_policy(&self, container_name: &str) -> Option<&ContainerResourcePolicy> {
        self.container_policies
            .iter()
            .find(|p| p.container_name == container_name)
            .or_else(|| {
                self.container_policies
                    .iter()
                    .find(|p| p.container_name == DEFAULT_CONTAINER_RESOURCE_POLICY)
            })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerResourcePolicy {
    /// Name of the container or DEFAULT_CONTAINER_RESOURCE_POLICY,
    /// in which case the policy is used by the containers
    /// that don't have their own policy specified.
    pub container_name: String,
    /// Whether autoscaler is enabled for the container. The default is "Auto".
    pub mode: Option<ContainerScalingMode>,
    /// Specifies the minimal amount of resources that will be recommended for the container.
    pub min_allowed: ResourceList,
    /// Specifies the maximum amount of resources that will be recommended for the container.
    pub max_allowed: ResourceList,
    /// Specifies the type of recommendations that will be computed
    /// (and possibly applied) by the autoscaler.
    /// If not specified, the default of [cpu, memory] will be used.
    pub controlled_resources: Option<Vec<Resource>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
pub enum ContainerScalingMode {
    /// Autoscaling is enabled for the container.
    Auto,
    /// Autoscaling is disabled for the container.
    Off,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MultidimPodAutoscalerStatus {
    /// The most recently computed amount of resources recommended
    /// by the autoscaler for the controlled pods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<RecommendedPodResources>,
    /// Conditions is the set of conditions required for this autoscaler
    /// to scale its target, and indicates whether or not those conditions are met.
    pub conditions: Vec<MultidimPodAutoscalerCondition>,
    /// Last time the MultidimPodAutoscaler scaled the number of pods.
    pub last_scale_time: Option<NaiveDateTime>,
    /// Current number of replicas of pods managed by this autoscaler,
    /// as last seen by the autoscaler.
    pub current_replicas: i32,
    /// Desired number of replicas of pods managed by this autoscaler,
    /// as last calculated by the autoscaler.
    pub desired_replicas: i32,
    /// The last read state of the metrics used by this autoscaler.
    pub current_metrics: Vec<MetricStatus>,
}

/// The recommendation of resources computed by the autoscaler.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RecommendedPodResources {
    /// Resources recommended by the autoscaler for each container.
    pub container_recommendations: Vec<RecommendedContainerResources>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RecommendedContainerResources {
    /// Name of the container.
    pub container_name: String,
    /// Recommended amount of resources. Observes ContainerResourcePolicy.
    pub target: ResourceList,
    /// Minimum recommended amount of resources. Observes ContainerResourcePolicy.
    pub lower_bound: ResourceList,
    /// Maximum recommended amount of resources. Observes ContainerResourcePolicy.
    pub upper_bound: ResourceList,
    /// The most recent recommended resources target computed by the autoscaler
    /// for the controlled pods, based only on actual resource usage,
    /// not taking into account the ContainerResourcePolicy.
    pub uncapped_target: ResourceList,
}

/// Describes the state of a MultidimPodAutoscaler at a certain point.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultidimPodAutoscalerCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<NaiveDateTime>,
    /// The reason for the condition's last transition.
    #[serde(default)]
    pub reason: String,
    /// A human-readable explanation containing details about the transition.
    #[serde(default)]
    pub message: String,
}

/// Ordered alphabetically, so sorting by type sorts by name.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum ConditionType {
    /// Whether the autoscaler is able to fetch and update scales.
    AbleToScale,
    /// The configuration uses a deprecated form.
    ConfigDeprecated,
    /// This MPA configuration is unsupported and recommendations will not be provided for it.
    ConfigUnsupported,
    /// The recommender is still gathering usage history.
    FetchingHistory,
    /// No pods match this MPA object.
    NoPodsMatched,
    /// Recommendation provided for this MPA object.
    RecommendationProvided,
    /// Whether horizontal scaling is active, i.e. metrics are computable.
    ScalingActive,
    /// The desired scale was capped by the min/max constraints or rate limits.
    ScalingLimited,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}
