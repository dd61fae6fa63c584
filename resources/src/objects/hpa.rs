use serde::{Deserialize, Serialize};
use strum::Display;

use super::{labels::LabelSelector, metrics::Resource, object_reference::CrossVersionObjectReference};

/// Specifies how to scale based on a single metric.
/// Only one source should be set, selected by `type`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum MetricSpec {
    /// A metric describing a single kubernetes object.
    Object(ObjectMetricSource),
    /// A metric describing each pod in the current scale target,
    /// averaged together before being compared to the target value.
    Pods(PodsMetricSource),
    /// A resource metric known to Kubernetes,
    /// as specified in requests and limits, describing each pod.
    Resource(ResourceMetricSource),
    /// A resource metric describing a single container in each pod.
    ContainerResource(ContainerResourceMetricSource),
    /// A global metric that is not associated with any Kubernetes object.
    External(ExternalMetricSource),
    /// Any metric source type this recommender does not understand.
    #[serde(other)]
    Unknown,
}

impl MetricSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            MetricSpec::Object(_) => "Object",
            MetricSpec::Pods(_) => "Pods",
            MetricSpec::Resource(_) => "Resource",
            MetricSpec::ContainerResource(_) => "ContainerResource",
            MetricSpec::External(_) => "External",
            MetricSpec::Unknown => "",
        }
    }
}

/// Identifies a metric by name and, optionally, selector.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MetricIdentifier {
    /// The name of the given metric.
    pub name: String,
    /// Narrows the set of metric series to use.
    /// When unset, just the metric name is used to gather metrics.
    #[serde(default)]
    pub selector: Option<LabelSelector>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetricSource {
    pub described_object: CrossVersionObjectReference,
    pub target: MetricTarget,
    pub metric: MetricIdentifier,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodsMetricSource {
    pub metric: MetricIdentifier,
    /// Only `averageValue` is supported for pods metrics.
    pub target: MetricTarget,
}

/// ResourceMetricSource indicates how to scale on a resource metric
/// known to Kubernetes, as specified in requests and limits,
/// describing each pod in the current scale target (e.g. CPU or memory).
/// The values will be averaged together before being compared to the target.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceMetricSource {
    /// Name of the resource.
    pub name: Resource,
    /// Target value for the given metric
    pub target: MetricTarget,
}

impl Default for ResourceMetricSource {
    fn default() -> Self {
        ResourceMetricSource {
            name: Resource::CPU,
            target: MetricTarget::AverageUtilization(80),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerResourceMetricSource {
    /// Name of the resource.
    pub name: Resource,
    /// Name of the container in the pods of the scaling target.
    pub container: String,
    pub target: MetricTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExternalMetricSource {
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

/// MetricTarget defines the target value, average value,
/// or average utilization of a specific metric.
///
/// Resource metric values use the unit of the resource (millicores, bytes),
/// every other metric is expressed in milli-units.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MetricTarget {
    /// Target value of the metric.
    Value(i64),
    /// Target value of the average of the metric across all relevant pods.
    AverageValue(i64),
    /// Target value of the average of the resource metric
    /// across all relevant pods,
    /// represented as a percentage of the requested value
    /// of the resource for the pods.
    AverageUtilization(i32),
}

/// The most recently observed state of a single metric.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum MetricStatus {
    Object(ObjectMetricStatus),
    Pods(PodsMetricStatus),
    Resource(ResourceMetricStatus),
    ContainerResource(ContainerResourceMetricStatus),
    External(ExternalMetricStatus),
}

/// The current value of a metric.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricValueStatus {
    pub value: Option<i64>,
    pub average_value: Option<i64>,
    /// Percentage of the requested value of the resource for the pods.
    pub average_utilization: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetricStatus {
    pub metric: MetricIdentifier,
    pub current: MetricValueStatus,
    #[serde(default)]
    pub described_object: Option<CrossVersionObjectReference>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodsMetricStatus {
    pub metric: MetricIdentifier,
    pub current: MetricValueStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceMetricStatus {
    pub name: Resource,
    pub current: MetricValueStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerResourceMetricStatus {
    pub name: Resource,
    pub container: String,
    pub current: MetricValueStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExternalMetricStatus {
    pub metric: MetricIdentifier,
    pub current: MetricValueStatus,
}

/// HorizontalPodAutoscalerBehavior configures the scaling behavior
/// of the target in both Up and Down directions
/// (scaleUp and scaleDown fields respectively).
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HorizontalPodAutoscalerBehavior {
    /// Scaling policy for scaling Up.
    /// If not set, the default value is the higher of:
    /// - increase no more than 4 pods per 15 seconds
    /// - double the number of pods per 15 seconds
    /// No stabilization is used.
    pub scale_up: Option<HPAScalingRules>,
    /// Scaling policy for scaling Down.
    /// If not set, the default value is to allow to scale down
    /// to minReplicas pods, with the recommender's downscale
    /// stabilization window.
    pub scale_down: Option<HPAScalingRules>,
}

impl HorizontalPodAutoscalerBehavior {
    /// Scale up rules with omitted fields filled with defaults.
    pub fn scale_up_rules(&self) -> HPAScalingRules {
        let defaults = default_scale_up_rules();
        match &self.scale_up {
            Some(rules) => rules.with_defaults(&defaults),
            None => defaults,
        }
    }

    /// Scale down rules with omitted fields filled with defaults.
    /// An omitted stabilization window takes `default_window_seconds`.
    pub fn scale_down_rules(&self, default_window_seconds: i32) -> HPAScalingRules {
        let mut defaults = default_scale_down_rules();
        defaults.stabilization_window_seconds = Some(default_window_seconds);
        match &self.scale_down {
            Some(rules) => rules.with_defaults(&defaults),
            None => defaults,
        }
    }
}

fn default_scale_up_rules() -> HPAScalingRules {
    HPAScalingRules {
        policies: vec![
            HPAScalingPolicy {
                type_: ScalingPolicyType::Pods,
                value: 4,
                period_seconds: 15,
            },
            HPAScalingPolicy {
                type_: ScalingPolicyType::Percent,
                value: 100,
                period_seconds: 15,
            },
        ],
        select_policy: Some(PolicySelection::Max),
        stabilization_window_seconds: Some(0),
    }
}

fn default_scale_down_rules() -> HPAScalingRules {
    HPAScalingRules {
        policies: vec![HPAScalingPolicy {
            type_: ScalingPolicyType::Percent,
            value: 100,
            period_seconds: 15,
        }],
        select_policy: Some(PolicySelection::Max),
        stabilization_window_seconds: None,
    }
}

/// HPAScalingRules configures the scaling behavior for one direction.
/// These Rules are applied after calculating DesiredReplicas
/// from metrics for the HPA.
/// They can limit the scaling velocity by specifying scaling policies.
/// They can prevent flapping by specifying the stabilization window,
/// so that the number of replicas is not set instantly,
/// instead, the safest value from the stabilization window is chosen.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HPAScalingRules {
    /// A list of potential scaling polices which can be used during scaling.
    pub policies: Vec<HPAScalingPolicy>,
    /// Specify which policy should be used.
    /// If not set, the default value Max is used.
    pub select_policy: Option<PolicySelection>,
    /// Number of seconds for which past recommendations should be considered
    /// while scaling up or scaling down.
    /// Must be greater than or equal to zero and less than or equal to 3600 (one hour).
    pub stabilization_window_seconds: Option<i32>,
}

impl HPAScalingRules {
    fn with_defaults(&self, defaults: &HPAScalingRules) -> HPAScalingRules {
        HPAScalingRules {
            policies: if self.policies.is_empty() {
                defaults.policies.to_owned()
            } else {
                self.policies.to_owned()
            },
            select_policy: self.select_policy.or(defaults.select_policy),
            stabilization_window_seconds: self
                .stabilization_window_seconds
                .or(defaults.stabilization_window_seconds),
        }
    }

    pub fn longest_period(&self) -> i32 {
        self.policies
            .iter()
            .map(|policy| policy.period_seconds)
            .max()
            .unwrap_or(0)
    }
}

/// PolicySelection describes how to choose a policy from multiple ones
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum PolicySelection {
    /// Select the policy with the lowest recommendation value.
    Min,
    /// Select the policy with the highest recommendation value.
    #[default]
    Max,
    /// Disable current action
    Disabled,
}

/// HPAScalingPolicy is a single policy
/// which must hold true for a specified past interval.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HPAScalingPolicy {
    /// Specify the scaling policy.
    #[serde(rename = "type")]
    pub type_: ScalingPolicyType,
    /// Contains the amount of change which is permitted by the policy.
    /// It must be greater than zero.
    pub value: i32,
    /// Specifies the window of time for which the policy should hold true.
    /// PeriodSeconds must be greater than zero
    /// and less than or equal to 1800(30 min).
    pub period_seconds: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ScalingPolicyType {
    Pods,
    Percent,
}
