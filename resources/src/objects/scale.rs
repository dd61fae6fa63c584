use serde::{Deserialize, Serialize};

use super::{Metadata, Object};

/// Scale represents a scaling request for a resource.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Scale {
    #[serde(default)]
    pub metadata: Metadata,
    /// Defines the behavior of the scale.
    #[serde(default)]
    pub spec: ScaleSpec,
    /// Current status of the scale.
    #[serde(default)]
    pub status: ScaleStatus,
}

impl Object for Scale {
    fn kind(&self) -> &'static str {
        "Scale"
    }

    fn name(&self) -> &String {
        &self.metadata.name
    }

    fn namespace(&self) -> &String {
        &self.metadata.namespace
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ScaleSpec {
    /// Desired number of instances for the scaled object.
    pub replicas: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ScaleStatus {
    /// Actual number of observed instances of the scaled object.
    pub replicas: i32,
    /// Label query over pods that should match the replicas count,
    /// in the textual selector form.
    pub selector: String,
}
