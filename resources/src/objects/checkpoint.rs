use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{Metadata, Object};

/// Checkpoint of the aggregated usage of a single container,
/// used to warm start the recommender after a restart.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct VerticalPodAutoscalerCheckpoint {
    pub metadata: Metadata,
    /// Specification of the checkpoint.
    pub spec: CheckpointSpec,
    /// Data of the checkpoint.
    #[serde(default)]
    pub status: CheckpointStatus,
}

impl Object for VerticalPodAutoscalerCheckpoint {
    fn kind(&self) -> &'static str {
        "VerticalPodAutoscalerCheckpoint"
    }

    fn name(&self) -> &String {
        &self.metadata.name
    }

    fn namespace(&self) -> &String {
        &self.metadata.namespace
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSpec {
    /// Name of the autoscaler object that stored this checkpoint.
    pub vpa_object_name: String,
    /// Name of the checkpointed container.
    pub container_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckpointStatus {
    /// The time when the status was last refreshed.
    pub last_update_time: Option<NaiveDateTime>,
    /// Version of the format of the stored data.
    pub version: String,
    /// Checkpoint of histogram for consumption of CPU.
    pub cpu_histogram: HistogramCheckpoint,
    /// Checkpoint of histogram for consumption of memory.
    pub memory_histogram: HistogramCheckpoint,
    /// Timestamp of the first sample from the histograms.
    pub first_sample_start: Option<NaiveDateTime>,
    /// Timestamp of the last sample from the histograms.
    pub last_sample_start: Option<NaiveDateTime>,
    /// Total number of samples in the histograms.
    pub total_samples_count: i64,
}

/// Histogram in a compact, serializable form.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HistogramCheckpoint {
    /// Reference timestamp for samples collected within this histogram.
    pub reference_timestamp: Option<NaiveDateTime>,
    /// Map from bucket index to bucket weight, normalized to the largest bucket.
    pub bucket_weights: BTreeMap<usize, u32>,
    /// Sum of samples to be used as denominator for weights from bucket_weights.
    pub total_weight: f64,
}
