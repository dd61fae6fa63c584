use std::{
    cmp::{max, min, Ordering},
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{anyhow, Context, Error, Result};
use chrono::{Duration, NaiveDateTime};
use futures::{stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use resources::{
    config::recommender::RecommenderConfig,
    objects::{
        hpa::{
            ContainerResourceMetricStatus, ExternalMetricSource, ExternalMetricStatus,
            HPAScalingRules, HorizontalPodAutoscalerBehavior, MetricIdentifier, MetricSpec,
            MetricStatus, MetricTarget, MetricValueStatus, ObjectMetricSource, ObjectMetricStatus,
            PodsMetricStatus, PolicySelection, ResourceMetricStatus, ScalingPolicyType,
        },
        labels::Selector,
        metrics::Resource,
        mpa::{ConditionType, MultidimPodAutoscaler, MultidimPodAutoscalerStatus},
        scale::Scale,
        Object,
    },
};

use super::replica_calculator::{ReplicaCalculator, ReplicaCount};
use crate::{
    clients::{EventRecorder, EventType, MpaClient, ScaleClient},
    error::RecommenderError,
    model::{conditions::set_condition, MpaId},
};

/// Without behavior rules, scale up to at most this factor of the current replicas...
const SCALE_UP_LIMIT_FACTOR: f64 = 2.0;
/// ...or to this many replicas, whichever is higher.
const SCALE_UP_LIMIT_MINIMUM: f64 = 4.0;

#[derive(Debug, Clone)]
struct TimestampedRecommendation {
    recommendation: i32,
    timestamp: NaiveDateTime,
}

#[derive(Debug, Clone)]
struct TimestampedScaleEvent {
    replica_change: i32,
    timestamp: NaiveDateTime,
    /// Older than the longest policy period, free to be overwritten.
    outdated: bool,
}

/// The replica count proposed by the metrics of an MPA.
struct MetricsProposal {
    replicas: i32,
    metric: String,
    timestamp: NaiveDateTime,
    statuses: Vec<MetricStatus>,
}

/// A metric which couldn't be turned into a replica count.
struct MetricFailure {
    reason: &'static str,
    error: Error,
}

/// Inputs of the normalization of a proposed replica count.
struct NormalizationArg {
    key: MpaId,
    scale_up: HPAScalingRules,
    scale_down: HPAScalingRules,
    min_replicas: i32,
    max_replicas: i32,
    current_replicas: i32,
    desired_replicas: i32,
}

/// Horizontal half of the recommender: proposes a replica count for the scale target
/// of every MPA with metrics, and reports it in the MPA status.
pub struct HorizontalController {
    mpa_client: Arc<dyn MpaClient>,
    scales: Arc<dyn ScaleClient>,
    events: Arc<dyn EventRecorder>,
    calculator: ReplicaCalculator,
    downscale_stabilization_window: Duration,
    concurrent_syncs: usize,

    /// Unstabilized recommendations
    recommendations: Mutex<HashMap<MpaId, Vec<TimestampedRecommendation>>>,
    scale_up_events: RwLock<HashMap<MpaId, Vec<TimestampedScaleEvent>>>,
    scale_down_events: RwLock<HashMap<MpaId, Vec<TimestampedScaleEvent>>>,
}

impl HorizontalController {
    pub fn new(
        mpa_client: Arc<dyn MpaClient>,
        scales: Arc<dyn ScaleClient>,
        events: Arc<dyn EventRecorder>,
        calculator: ReplicaCalculator,
        config: &RecommenderConfig,
    ) -> Self {
        Self {
            mpa_client,
            scales,
            events,
            calculator,
            downscale_stabilization_window: Duration::seconds(
                config.hpa_downscale_stabilization_window as i64,
            ),
            concurrent_syncs: config.concurrent_hpa_syncs.max(1),
            recommendations: Mutex::new(HashMap::new()),
            scale_up_events: RwLock::new(HashMap::new()),
            scale_down_events: RwLock::new(HashMap::new()),
        }
    }

    /// Reconcile the given MPAs, a bounded number at a time.
    /// History of MPAs not in the list is dropped.
    pub async fn reconcile_all(&self, mpas: &[MultidimPodAutoscaler], now: NaiveDateTime) {
        let present = mpas
            .iter()
            .map(|mpa| MpaId::new(mpa.namespace(), mpa.name()))
            .collect::<HashSet<_>>();
        self.recommendations
            .lock()
            .retain(|id, _| present.contains(id));
        self.scale_up_events
            .write()
            .retain(|id, _| present.contains(id));
        self.scale_down_events
            .write()
            .retain(|id, _| present.contains(id));

        stream::iter(mpas)
            .map(|mpa| async move {
                if let Err(err) = self.reconcile(mpa, now).await {
                    tracing::error!("Error updating MPA status: {:#}", err);
                }
            })
            .buffer_unordered(self.concurrent_syncs)
            .collect::<Vec<_>>()
            .await;
    }

    pub async fn reconcile(&self, mpa: &MultidimPodAutoscaler, now: NaiveDateTime) -> Result<()> {
        let key = MpaId::new(mpa.namespace(), mpa.name());
        let target = match &mpa.spec.scale_target_ref {
            Some(target) if !mpa.spec.metrics.is_empty() => target,
            _ => {
                tracing::debug!("MPA {} has no horizontal scaling configured", key);
                return Ok(());
            },
        };
        let mut status = mpa.status.to_owned();

        let scale = match self.scales.get_scale(mpa.namespace(), target).await {
            Ok(scale) => scale,
            Err(err) => {
                set_condition(
                    &mut status.conditions,
                    ConditionType::AbleToScale,
                    false,
                    "FailedGetScale",
                    &format!(
                        "the MPA recommender was unable to get the target's current scale: {:#}",
                        err
                    ),
                    now,
                );
                self.events
                    .event(mpa, EventType::Warning, "FailedGetScale", &format!("{:#}", err))
                    .await;
                self.update_status_if_needed(mpa, status).await?;
                return Err(err.context(format!("failed to query scale subresource for {}", target)));
            },
        };
        set_condition(
            &mut status.conditions,
            ConditionType::AbleToScale,
            true,
            "SucceededGetScale",
            "the MPA recommender was able to get the target's current scale",
            now,
        );

        let current_replicas = scale.spec.replicas;
        let constraints = mpa.spec.constraints.to_owned().unwrap_or_default();
        let min_replicas = constraints.min_replicas.unwrap_or(1);
        let max_replicas = constraints.max_replicas;
        let behavior = constraints.behavior.as_ref();
        let mut metric_statuses = status.current_metrics.to_owned();
        let mut rescale = true;
        let mut rescale_reason = String::new();

        let mut desired_replicas = if current_replicas == 0 {
            rescale = false;
            set_condition(
                &mut status.conditions,
                ConditionType::ScalingActive,
                false,
                "ScalingDisabled",
                "scaling is disabled since the replica count of the target is zero",
                now,
            );
            0
        } else if current_replicas > max_replicas {
            rescale_reason = "Current number of replicas above Spec.Constraints.MaxReplicas".into();
            max_replicas
        } else if current_replicas < min_replicas {
            rescale_reason = "Current number of replicas below Spec.Constraints.MinReplicas".into();
            min_replicas
        } else {
            let proposal = match self
                .compute_replicas_for_metrics(mpa, &scale, &mut status, now)
                .await
            {
                Ok(proposal) => proposal,
                Err(err) => {
                    status.current_replicas = current_replicas;
                    if let Err(err) = self.update_status_if_needed(mpa, status).await {
                        tracing::error!("{:#}", err);
                    }
                    self.events
                        .event(
                            mpa,
                            EventType::Warning,
                            "FailedComputeMetricsReplicas",
                            &format!("{:#}", err),
                        )
                        .await;
                    return Err(err.context(format!(
                        "failed to compute desired number of replicas based on listed metrics for {}",
                        target
                    )));
                },
            };
            tracing::debug!(
                "Proposing {} desired replicas (based on {} from {}) for {}",
                proposal.replicas,
                proposal.metric,
                proposal.timestamp,
                key
            );
            metric_statuses = proposal.statuses;

            let desired = match behavior {
                None => self.normalize_desired_replicas(
                    &key,
                    &mut status,
                    current_replicas,
                    proposal.replicas,
                    min_replicas,
                    max_replicas,
                    now,
                ),
                Some(behavior) => self.normalize_desired_replicas_with_behaviors(
                    NormalizationArg {
                        key: key.to_owned(),
                        scale_up: behavior.scale_up_rules(),
                        scale_down: behavior.scale_down_rules(
                            self.downscale_stabilization_window.num_seconds() as i32,
                        ),
                        min_replicas,
                        max_replicas,
                        current_replicas,
                        desired_replicas: proposal.replicas,
                    },
                    &mut status,
                    now,
                ),
            };
            rescale = desired != current_replicas;
            rescale_reason = if desired > current_replicas {
                format!("{} above target", proposal.metric)
            } else {
                "All metrics below target".to_string()
            };
            desired
        };

        if rescale {
            // The scale subresource is left alone, the recommendation is the status
            tracing::info!(
                "Recommending {} replicas for {} of MPA {} (currently {}): {}",
                desired_replicas,
                target,
                key,
                current_replicas,
                rescale_reason
            );
            set_condition(
                &mut status.conditions,
                ConditionType::AbleToScale,
                true,
                "SucceededRescale",
                &format!(
                    "the MPA controller was able to update the target scale to {}",
                    desired_replicas
                ),
                now,
            );
            self.events
                .event(
                    mpa,
                    EventType::Normal,
                    "SuccessfulRescale",
                    &format!("New size: {}; reason: {}", desired_replicas, rescale_reason),
                )
                .await;
            self.store_scale_event(&key, behavior, current_replicas, desired_replicas, now);
            status.last_scale_time = Some(now);
        } else {
            tracing::debug!(
                "Decided not to scale {} to {} (last scale time was {:?})",
                target,
                desired_replicas,
                status.last_scale_time
            );
            desired_replicas = current_replicas;
        }

        status.current_replicas = current_replicas;
        status.desired_replicas = desired_replicas;
        status.current_metrics = metric_statuses;
        self.update_status_if_needed(mpa, status).await
    }

    /// The highest replica count proposed by any metric.
    /// Fails when every metric fails, or when some fail and the others would scale down.
    async fn compute_replicas_for_metrics(
        &self,
        mpa: &MultidimPodAutoscaler,
        scale: &Scale,
        status: &mut MultidimPodAutoscalerStatus,
        now: NaiveDateTime,
    ) -> Result<MetricsProposal> {
        if scale.status.selector.is_empty() {
            let message = "selector is required";
            self.events
                .event(mpa, EventType::Warning, "SelectorRequired", message)
                .await;
            set_condition(
                &mut status.conditions,
                ConditionType::ScalingActive,
                false,
                "InvalidSelector",
                "the MPA target's scale is missing a selector",
                now,
            );
            return Err(anyhow!(message));
        }
        let selector = match Selector::parse(&scale.status.selector) {
            Ok(selector) => selector,
            Err(err) => {
                let message = RecommenderError::InvalidSelector(format!("{:#}", err)).to_string();
                self.events
                    .event(mpa, EventType::Warning, "InvalidSelector", &message)
                    .await;
                set_condition(
                    &mut status.conditions,
                    ConditionType::ScalingActive,
                    false,
                    "InvalidSelector",
                    &message,
                    now,
                );
                return Err(anyhow!(message));
            },
        };

        let specs = &mpa.spec.metrics;
        let mut statuses = Vec::with_capacity(specs.len());
        let mut best: Option<(i32, String, NaiveDateTime)> = None;
        let mut invalid_metrics_count = 0;
        let mut first_failure: Option<MetricFailure> = None;
        for spec in specs {
            match self
                .compute_replicas_for_metric(mpa, spec, scale, &selector, now)
                .await
            {
                Ok((count, metric, metric_status)) => {
                    statuses.push(metric_status);
                    if best
                        .as_ref()
                        .map_or(true, |(replicas, ..)| count.replicas > *replicas)
                    {
                        best = Some((count.replicas, metric, count.timestamp));
                    }
                },
                Err(failure) => {
                    self.events
                        .event(
                            mpa,
                            EventType::Warning,
                            failure.reason,
                            &format!("{:#}", failure.error),
                        )
                        .await;
                    if first_failure.is_none() {
                        first_failure = Some(failure);
                    }
                    invalid_metrics_count += 1;
                },
            }
        }

        if let Some(failure) = first_failure {
            let scales_down = best
                .as_ref()
                .map_or(true, |(replicas, ..)| *replicas < scale.spec.replicas);
            if invalid_metrics_count >= specs.len() || scales_down {
                set_condition(
                    &mut status.conditions,
                    ConditionType::ScalingActive,
                    false,
                    failure.reason,
                    &format!(
                        "the MPA was unable to compute the replica count: {:#}",
                        failure.error
                    ),
                    now,
                );
                return Err(anyhow!(
                    "invalid metrics ({} invalid out of {}), first error is: {:#}",
                    invalid_metrics_count,
                    specs.len(),
                    failure.error
                ));
            }
        }

        let (replicas, metric, timestamp) =
            best.ok_or_else(|| anyhow!("no metrics to compute the replica count from"))?;
        set_condition(
            &mut status.conditions,
            ConditionType::ScalingActive,
            true,
            "ValidMetricFound",
            &format!(
                "the MPA was able to successfully calculate a replica count from {}",
                metric
            ),
            now,
        );
        Ok(MetricsProposal {
            replicas,
            metric,
            timestamp,
            statuses,
        })
    }

    async fn compute_replicas_for_metric(
        &self,
        mpa: &MultidimPodAutoscaler,
        spec: &MetricSpec,
        scale: &Scale,
        selector: &Selector,
        now: NaiveDateTime,
    ) -> Result<(ReplicaCount, String, MetricStatus), MetricFailure> {
        let namespace = mpa.namespace();
        let spec_replicas = scale.spec.replicas;
        let status_replicas = scale.status.replicas;
        let failure = |reason: &'static str| move |error: Error| MetricFailure { reason, error };

        match spec {
            MetricSpec::Resource(source) => {
                let (count, metric, current) = self
                    .compute_resource_metric(
                        spec_replicas,
                        &source.name,
                        &source.target,
                        None,
                        namespace,
                        selector,
                        now,
                    )
                    .await
                    .map_err(failure("FailedGetResourceMetric"))?;
                let status = MetricStatus::Resource(ResourceMetricStatus {
                    name: source.name,
                    current,
                });
                Ok((count, metric, status))
            },
            MetricSpec::ContainerResource(source) => {
                let (count, metric, current) = self
                    .compute_resource_metric(
                        spec_replicas,
                        &source.name,
                        &source.target,
                        Some(source.container.as_str()),
                        namespace,
                        selector,
                        now,
                    )
                    .await
                    .map_err(failure("FailedGetContainerResourceMetric"))?;
                let status = MetricStatus::ContainerResource(ContainerResourceMetricStatus {
                    name: source.name,
                    container: source.container.to_owned(),
                    current,
                });
                Ok((count, metric, status))
            },
            MetricSpec::Pods(source) => {
                let count = self
                    .compute_pods_metric(spec_replicas, &source.metric, &source.target, namespace, selector, now)
                    .await
                    .map_err(failure("FailedGetPodsMetric"))?;
                let status = MetricStatus::Pods(PodsMetricStatus {
                    metric: source.metric.to_owned(),
                    current: MetricValueStatus {
                        average_value: Some(count.usage),
                        ..Default::default()
                    },
                });
                Ok((count, format!("pods metric {}", source.metric.name), status))
            },
            MetricSpec::Object(source) => {
                let (count, current) = self
                    .compute_object_metric(spec_replicas, status_replicas, source, namespace, selector)
                    .await
                    .map_err(failure("FailedGetObjectMetric"))?;
                let status = MetricStatus::Object(ObjectMetricStatus {
                    metric: source.metric.to_owned(),
                    current,
                    described_object: Some(source.described_object.to_owned()),
                });
                let metric = format!(
                    "{} metric {}",
                    source.described_object.kind, source.metric.name
                );
                Ok((count, metric, status))
            },
            MetricSpec::External(source) => {
                let (count, current) = self
                    .compute_external_metric(spec_replicas, status_replicas, source, namespace, selector)
                    .await
                    .map_err(failure("FailedGetExternalMetric"))?;
                let status = MetricStatus::External(ExternalMetricStatus {
                    metric: source.metric.to_owned(),
                    current,
                });
                Ok((count, format!("external metric {}", source.metric.name), status))
            },
            MetricSpec::Unknown => Err(MetricFailure {
                reason: "InvalidMetricSourceType",
                error: RecommenderError::InvalidMetricSourceType(spec.type_name().to_string())
                    .into(),
            }),
        }
    }

    async fn compute_pods_metric(
        &self,
        current_replicas: i32,
        metric: &MetricIdentifier,
        target: &MetricTarget,
        namespace: &str,
        selector: &Selector,
        now: NaiveDateTime,
    ) -> Result<ReplicaCount> {
        let target = match target {
            MetricTarget::AverageValue(target) => *target,
            _ => {
                return Err(anyhow!(
                    "invalid pods metric source: an average value target must be set"
                ))
            },
        };
        let metric_selector = metric_selector(metric)?;
        self.calculator
            .calc_replicas_by_pods_metric(
                current_replicas,
                target,
                &metric.name,
                namespace,
                selector,
                &metric_selector,
                now,
            )
            .await
            .with_context(|| format!("failed to get pods metric value {}", metric.name))
    }

    /// A value target scales the ready pods, an average value target the status replicas.
    async fn compute_object_metric(
        &self,
        spec_replicas: i32,
        status_replicas: i32,
        source: &ObjectMetricSource,
        namespace: &str,
        selector: &Selector,
    ) -> Result<(ReplicaCount, MetricValueStatus)> {
        let metric_selector = metric_selector(&source.metric)?;
        match source.target {
            MetricTarget::Value(target) => {
                let count = self
                    .calculator
                    .calc_replicas_by_object_metric(
                        spec_replicas,
                        target,
                        &source.metric.name,
                        namespace,
                        &source.described_object,
                        selector,
                        &metric_selector,
                    )
                    .await
                    .with_context(|| format!("failed to get object metric value {}", source.metric.name))?;
                let current = MetricValueStatus {
                    value: Some(count.usage),
                    ..Default::default()
                };
                Ok((count, current))
            },
            MetricTarget::AverageValue(target) => {
                let count = self
                    .calculator
                    .calc_replicas_by_object_per_pod_metric(
                        status_replicas,
                        target,
                        &source.metric.name,
                        namespace,
                        &source.described_object,
                        &metric_selector,
                    )
                    .await
                    .with_context(|| format!("failed to get object metric value {}", source.metric.name))?;
                let current = MetricValueStatus {
                    average_value: Some(count.usage),
                    ..Default::default()
                };
                Ok((count, current))
            },
            MetricTarget::AverageUtilization(_) => Err(anyhow!(
                "invalid object metric source: neither a value target nor an average value target was set"
            )),
        }
    }

    async fn compute_external_metric(
        &self,
        spec_replicas: i32,
        status_replicas: i32,
        source: &ExternalMetricSource,
        namespace: &str,
        selector: &Selector,
    ) -> Result<(ReplicaCount, MetricValueStatus)> {
        let metric_selector = metric_selector(&source.metric)?;
        match source.target {
            MetricTarget::AverageValue(target) => {
                let count = self
                    .calculator
                    .calc_replicas_by_external_per_pod_metric(
                        status_replicas,
                        target,
                        &source.metric.name,
                        namespace,
                        &metric_selector,
                    )
                    .await
                    .with_context(|| format!("failed to get external metric {}", source.metric.name))?;
                let current = MetricValueStatus {
                    average_value: Some(count.usage),
                    ..Default::default()
                };
                Ok((count, current))
            },
            MetricTarget::Value(target) => {
                let count = self
                    .calculator
                    .calc_replicas_by_external_metric(
                        spec_replicas,
                        target,
                        &source.metric.name,
                        namespace,
                        &metric_selector,
                        selector,
                    )
                    .await
                    .with_context(|| format!("failed to get external metric {}", source.metric.name))?;
                let current = MetricValueStatus {
                    value: Some(count.usage),
                    ..Default::default()
                };
                Ok((count, current))
            },
            MetricTarget::AverageUtilization(_) => Err(anyhow!(
                "invalid external metric source: neither a value target nor an average value target was set"
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn compute_resource_metric(
        &self,
        current_replicas: i32,
        resource: &Resource,
        target: &MetricTarget,
        container: Option<&str>,
        namespace: &str,
        selector: &Selector,
        now: NaiveDateTime,
    ) -> Result<(ReplicaCount, String, MetricValueStatus)> {
        let resource_name = match container {
            Some(_) => format!("{} container resource", resource),
            None => format!("{} resource", resource),
        };
        match target {
            MetricTarget::AverageValue(target) => {
                let count = self
                    .calculator
                    .calc_replicas_by_value(
                        current_replicas,
                        *target,
                        resource,
                        namespace,
                        selector,
                        container,
                        now,
                    )
                    .await
                    .with_context(|| format!("failed to get {} usage", resource))?;
                let current = MetricValueStatus {
                    average_value: Some(count.usage),
                    ..Default::default()
                };
                Ok((count, resource_name, current))
            },
            MetricTarget::AverageUtilization(target) => {
                let count = self
                    .calculator
                    .calc_replicas_by_utilization(
                        current_replicas,
                        *target,
                        resource,
                        namespace,
                        selector,
                        container,
                        now,
                    )
                    .await
                    .with_context(|| format!("failed to get {} utilization", resource))?;
                let current = MetricValueStatus {
                    average_value: Some(count.usage),
                    average_utilization: count.utilization,
                    ..Default::default()
                };
                let metric = format!("{} utilization (percentage of request)", resource_name);
                Ok((count, metric, current))
            },
            MetricTarget::Value(_) => Err(anyhow!(
                "invalid resource metric source: neither a utilization target nor a value target was set"
            )),
        }
    }

    /// Stabilize scale down over the default window, then clamp into
    /// the replica limits and the fixed scale up rate.
    #[allow(clippy::too_many_arguments)]
    fn normalize_desired_replicas(
        &self,
        key: &MpaId,
        status: &mut MultidimPodAutoscalerStatus,
        current_replicas: i32,
        prenormalized_desired_replicas: i32,
        min_replicas: i32,
        max_replicas: i32,
        now: NaiveDateTime,
    ) -> i32 {
        let stabilized = self.stabilize_recommendation(key, prenormalized_desired_replicas, now);
        if stabilized != prenormalized_desired_replicas {
            set_condition(
                &mut status.conditions,
                ConditionType::AbleToScale,
                true,
                "ScaleDownStabilized",
                "recent recommendations were higher than current one, applying the highest recent recommendation",
                now,
            );
        } else {
            set_condition(
                &mut status.conditions,
                ConditionType::AbleToScale,
                true,
                "ReadyForNewScale",
                "recommended size matches current size",
                now,
            );
        }

        let (desired, reason, message) =
            convert_desired_replicas_with_rules(current_replicas, stabilized, min_replicas, max_replicas);
        set_condition(
            &mut status.conditions,
            ConditionType::ScalingLimited,
            desired != stabilized,
            reason,
            message,
            now,
        );
        desired
    }

    /// The highest recommendation within the downscale stabilization window.
    fn stabilize_recommendation(
        &self,
        key: &MpaId,
        prenormalized_desired_replicas: i32,
        now: NaiveDateTime,
    ) -> i32 {
        let cutoff = now - self.downscale_stabilization_window;
        let mut recommendations = self.recommendations.lock();
        let history = recommendations.entry(key.to_owned()).or_default();

        let mut max_recommendation = prenormalized_desired_replicas;
        let mut old_sample = None;
        for (i, rec) in history.iter().enumerate() {
            if rec.timestamp < cutoff {
                old_sample = Some(i);
            } else if rec.recommendation > max_recommendation {
                max_recommendation = rec.recommendation;
            }
        }
        let new_sample = TimestampedRecommendation {
            recommendation: prenormalized_desired_replicas,
            timestamp: now,
        };
        match old_sample {
            Some(i) => history[i] = new_sample,
            None => history.push(new_sample),
        }
        max_recommendation
    }

    fn normalize_desired_replicas_with_behaviors(
        &self,
        mut arg: NormalizationArg,
        status: &mut MultidimPodAutoscalerStatus,
        now: NaiveDateTime,
    ) -> i32 {
        let prenormalized_desired_replicas = arg.desired_replicas;
        let (stabilized, reason, message) = self.stabilize_recommendation_with_behaviors(&arg, now);
        arg.desired_replicas = stabilized;
        if stabilized != prenormalized_desired_replicas {
            set_condition(
                &mut status.conditions,
                ConditionType::AbleToScale,
                true,
                reason,
                message,
                now,
            );
        } else {
            set_condition(
                &mut status.conditions,
                ConditionType::AbleToScale,
                true,
                "ReadyForNewScale",
                "recommended size matches current size",
                now,
            );
        }

        let (desired, reason, message) = self.convert_desired_replicas_with_behavior_rate(&arg, now);
        set_condition(
            &mut status.conditions,
            ConditionType::ScalingLimited,
            desired != stabilized,
            reason,
            message,
            now,
        );
        desired
    }

    /// Stabilize recommendation with stabilization windows specified in behavior.
    fn stabilize_recommendation_with_behaviors(
        &self,
        arg: &NormalizationArg,
        now: NaiveDateTime,
    ) -> (i32, &'static str, &'static str) {
        let up_cutoff =
            now - Duration::seconds(arg.scale_up.stabilization_window_seconds.unwrap_or(0) as i64);
        let down_cutoff =
            now - Duration::seconds(arg.scale_down.stabilization_window_seconds.unwrap_or(0) as i64);
        let mut up_recommendation = arg.desired_replicas;
        let mut down_recommendation = arg.desired_replicas;

        let mut recommendations = self.recommendations.lock();
        let history = recommendations.entry(arg.key.to_owned()).or_default();
        let mut old_sample = None;
        // Find upper and lower bounds
        for (i, rec) in history.iter().enumerate() {
            if rec.timestamp >= up_cutoff {
                up_recommendation = up_recommendation.min(rec.recommendation);
            }
            if rec.timestamp >= down_cutoff {
                down_recommendation = down_recommendation.max(rec.recommendation);
            }
            if rec.timestamp < up_cutoff && rec.timestamp < down_cutoff {
                old_sample = Some(i);
            }
        }
        // Stabilize
        let recommendation = arg
            .current_replicas
            .max(up_recommendation)
            .min(down_recommendation);
        tracing::debug!(
            "up_recommendation: {}, down_recommendation: {}",
            up_recommendation,
            down_recommendation
        );

        // Record **unstabilized** recommendation
        let new_sample = TimestampedRecommendation {
            recommendation: arg.desired_replicas,
            timestamp: now,
        };
        match old_sample {
            Some(i) => history[i] = new_sample,
            None => history.push(new_sample),
        }

        if arg.desired_replicas >= arg.current_replicas {
            (
                recommendation,
                "ScaleUpStabilized",
                "recent recommendations were lower than current one, applying the lowest recent recommendation",
            )
        } else {
            (
                recommendation,
                "ScaleDownStabilized",
                "recent recommendations were higher than current one, applying the highest recent recommendation",
            )
        }
    }

    /// Normalize desired replicas count with the rate defined in scaling behavior.
    fn convert_desired_replicas_with_behavior_rate(
        &self,
        arg: &NormalizationArg,
        now: NaiveDateTime,
    ) -> (i32, &'static str, &'static str) {
        match arg.desired_replicas.cmp(&arg.current_replicas) {
            // Scaling up
            Ordering::Greater => {
                let up_events = self.scale_up_events.read();
                let down_events = self.scale_down_events.read();
                let scale_up_limit = calc_scale_up_limit_with_scaling_rules(
                    arg.current_replicas,
                    up_events.get(&arg.key),
                    down_events.get(&arg.key),
                    &arg.scale_up,
                    now,
                )
                // Don't scale up further until the scale up events are outdated
                .max(arg.current_replicas);
                let (maximum_allowed_replicas, reason, message) = if arg.max_replicas > scale_up_limit {
                    (
                        scale_up_limit,
                        "ScaleUpLimit",
                        "the desired replica count is increasing faster than the maximum scale rate",
                    )
                } else {
                    (
                        arg.max_replicas,
                        "TooManyReplicas",
                        "the desired replica count is more than the maximum replica count",
                    )
                };
                if arg.desired_replicas > maximum_allowed_replicas {
                    tracing::info!(
                        "Scale up limited to {} for {}",
                        maximum_allowed_replicas,
                        arg.key
                    );
                    return (maximum_allowed_replicas, reason, message);
                }
            },
            // Scaling down
            Ordering::Less => {
                let up_events = self.scale_up_events.read();
                let down_events = self.scale_down_events.read();
                let scale_down_limit = calc_scale_down_limit_with_behaviors(
                    arg.current_replicas,
                    up_events.get(&arg.key),
                    down_events.get(&arg.key),
                    &arg.scale_down,
                    now,
                )
                .min(arg.current_replicas);
                let (minimum_allowed_replicas, reason, message) = if arg.min_replicas < scale_down_limit {
                    (
                        scale_down_limit,
                        "ScaleDownLimit",
                        "the desired replica count is decreasing faster than the maximum scale rate",
                    )
                } else {
                    (
                        arg.min_replicas,
                        "TooFewReplicas",
                        "the desired replica count is less than the minimum replica count",
                    )
                };
                if arg.desired_replicas < minimum_allowed_replicas {
                    tracing::info!(
                        "Scale down limited to {} for {}",
                        minimum_allowed_replicas,
                        arg.key
                    );
                    return (minimum_allowed_replicas, reason, message);
                }
            },
            Ordering::Equal => {},
        }
        (
            arg.desired_replicas,
            "DesiredWithinRange",
            "the desired count is within the acceptable range",
        )
    }

    /// Record a replica change for the rate limits of the behavior, reusing an outdated slot.
    fn store_scale_event(
        &self,
        key: &MpaId,
        behavior: Option<&HorizontalPodAutoscalerBehavior>,
        prev_replicas: i32,
        new_replicas: i32,
        now: NaiveDateTime,
    ) {
        let behavior = match behavior {
            Some(behavior) => behavior,
            None => return,
        };
        tracing::debug!(
            "Record scale event for {}: {} -> {}",
            key,
            prev_replicas,
            new_replicas
        );
        let (events, longest_period, replica_change) = match new_replicas.cmp(&prev_replicas) {
            Ordering::Greater => (
                &self.scale_up_events,
                behavior.scale_up_rules().longest_period(),
                new_replicas - prev_replicas,
            ),
            Ordering::Less => (
                &self.scale_down_events,
                behavior
                    .scale_down_rules(self.downscale_stabilization_window.num_seconds() as i32)
                    .longest_period(),
                prev_replicas - new_replicas,
            ),
            Ordering::Equal => return,
        };

        let mut events = events.write();
        let events = events.entry(key.to_owned()).or_default();
        mark_scale_events_outdated(events, longest_period, now);
        let event = TimestampedScaleEvent {
            replica_change,
            timestamp: now,
            outdated: false,
        };
        match events.iter_mut().find(|e| e.outdated) {
            Some(slot) => *slot = event,
            None => events.push(event),
        }
    }

    async fn update_status_if_needed(
        &self,
        mpa: &MultidimPodAutoscaler,
        status: MultidimPodAutoscalerStatus,
    ) -> Result<()> {
        if mpa.status == status {
            return Ok(());
        }
        if let Err(err) = self
            .mpa_client
            .patch_status(mpa.namespace(), mpa.name(), &status)
            .await
        {
            self.events
                .event(mpa, EventType::Warning, "FailedUpdateStatus", &format!("{:#}", err))
                .await;
            return Err(err.context(format!("failed to update status for {}", mpa.name())));
        }
        tracing::info!("Successfully updated status for {}", mpa.name());
        Ok(())
    }
}

/// The selector narrowing a metric's series. None selects every series.
fn metric_selector(metric: &MetricIdentifier) -> Result<Selector> {
    match &metric.selector {
        Some(selector) => Selector::from_label_selector(Some(selector)),
        None => Ok(Selector::everything()),
    }
}

/// Clamp into the replica limits and the fixed scale up rate.
fn convert_desired_replicas_with_rules(
    current_replicas: i32,
    desired_replicas: i32,
    min_replicas: i32,
    max_replicas: i32,
) -> (i32, &'static str, &'static str) {
    let scale_up_limit = calc_scale_up_limit(current_replicas);
    let (maximum_allowed_replicas, reason, message) = if max_replicas > scale_up_limit {
        (
            scale_up_limit,
            "ScaleUpLimit",
            "the desired replica count is increasing faster than the maximum scale rate",
        )
    } else {
        (
            max_replicas,
            "TooManyReplicas",
            "the desired replica count is more than the maximum replica count",
        )
    };

    if desired_replicas < min_replicas {
        (
            min_replicas,
            "TooFewReplicas",
            "the desired replica count is less than the minimum replica count",
        )
    } else if desired_replicas > maximum_allowed_replicas {
        (maximum_allowed_replicas, reason, message)
    } else {
        (
            desired_replicas,
            "DesiredWithinRange",
            "the desired count is within the acceptable range",
        )
    }
}

fn calc_scale_up_limit(current_replicas: i32) -> i32 {
    (SCALE_UP_LIMIT_FACTOR * current_replicas as f64).max(SCALE_UP_LIMIT_MINIMUM) as i32
}

fn calc_scale_up_limit_with_scaling_rules(
    current_replicas: i32,
    scale_up_events: Option<&Vec<TimestampedScaleEvent>>,
    scale_down_events: Option<&Vec<TimestampedScaleEvent>>,
    rules: &HPAScalingRules,
    now: NaiveDateTime,
) -> i32 {
    let (mut result, select_fn): (i32, fn(i32, i32) -> i32) = match rules.select_policy {
        Some(PolicySelection::Disabled) => return current_replicas,
        Some(PolicySelection::Min) => (i32::MAX, min),
        Some(PolicySelection::Max) | None => (i32::MIN, max),
    };
    for policy in &rules.policies {
        let replicas_added_in_current_period =
            get_replicas_change_in_period(policy.period_seconds, scale_up_events, now);
        let replicas_deleted_in_current_period =
            get_replicas_change_in_period(policy.period_seconds, scale_down_events, now);
        let period_start =
            current_replicas - replicas_added_in_current_period + replicas_deleted_in_current_period;
        let period_limit = match policy.type_ {
            ScalingPolicyType::Pods => period_start + policy.value,
            ScalingPolicyType::Percent => {
                (period_start as f64 * (1.0 + policy.value as f64 / 100.0)).ceil() as i32
            },
        };
        result = select_fn(result, period_limit);
    }
    result
}

fn calc_scale_down_limit_with_behaviors(
    current_replicas: i32,
    scale_up_events: Option<&Vec<TimestampedScaleEvent>>,
    scale_down_events: Option<&Vec<TimestampedScaleEvent>>,
    rules: &HPAScalingRules,
    now: NaiveDateTime,
) -> i32 {
    let (mut result, select_fn): (i32, fn(i32, i32) -> i32) = match rules.select_policy {
        Some(PolicySelection::Disabled) => return current_replicas,
        // Minimum change results in maximum value
        Some(PolicySelection::Min) => (i32::MIN, max),
        Some(PolicySelection::Max) | None => (i32::MAX, min),
    };
    for policy in &rules.policies {
        let replicas_added_in_current_period =
            get_replicas_change_in_period(policy.period_seconds, scale_up_events, now);
        let replicas_deleted_in_current_period =
            get_replicas_change_in_period(policy.period_seconds, scale_down_events, now);
        let period_start =
            current_replicas - replicas_added_in_current_period + replicas_deleted_in_current_period;
        let period_limit = match policy.type_ {
            ScalingPolicyType::Pods => period_start - policy.value,
            ScalingPolicyType::Percent => {
                (period_start as f64 * (1.0 - policy.value as f64 / 100.0)) as i32
            },
        };
        result = select_fn(result, period_limit);
    }
    result
}

fn get_replicas_change_in_period(
    period_seconds: i32,
    events: Option<&Vec<TimestampedScaleEvent>>,
    now: NaiveDateTime,
) -> i32 {
    let period_start = now - Duration::seconds(period_seconds as i64);
    match events {
        Some(events) => events
            .iter()
            .filter(|event| event.timestamp > period_start)
            .map(|event| event.replica_change)
            .sum(),
        None => 0,
    }
}

/// Flag events that are older than `now - period`.
fn mark_scale_events_outdated(
    events: &mut [TimestampedScaleEvent],
    period_seconds: i32,
    now: NaiveDateTime,
) {
    let period_start = now - Duration::seconds(period_seconds as i64);
    for event in events.iter_mut() {
        if event.timestamp < period_start {
            event.outdated = true;
        }
    }
}
