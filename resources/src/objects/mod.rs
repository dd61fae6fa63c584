use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use self::labels::Labels;

pub mod checkpoint;
pub mod hpa;
pub mod labels;
pub mod metrics;
pub mod mpa;
pub mod object_reference;
pub mod pod;
pub mod scale;

pub trait Object: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn name(&self) -> &String;

    fn namespace(&self) -> &String;

    /// The unique `namespace/name` key of the object.
    fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    /// Name must be unique within a namespace.
    /// Is required when creating resources.
    pub name: String,
    /// Namespace defines the space within which each name must be unique.
    /// Defaults to "default".
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// UID is the unique in time and space value for this object.
    /// It is typically generated by the server on successful creation of a resource
    /// and is not allowed to change on PUT operations.
    pub uid: Option<String>,
    /// Map of string keys and values that can be used to organize
    /// and categorize (scope and select) objects.
    pub labels: Labels,
    /// Unstructured key value map stored with a resource
    /// that may be set by external tools to store and retrieve arbitrary metadata.
    pub annotations: BTreeMap<String, String>,
    /// List of objects depended by this object.
    /// If ALL objects in the list have been deleted,
    /// this object will be garbage collected.
    /// There cannot be more than one managing controller.
    pub owner_references: Vec<OwnerReference>,
    /// Time at which this object was created.
    pub creation_timestamp: Option<NaiveDateTime>,
    /// Time at which this resource will be deleted.
    /// Set by the server when a graceful deletion is requested.
    pub deletion_timestamp: Option<NaiveDateTime>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Metadata {
    pub fn new(namespace: &str, name: &str) -> Self {
        Metadata {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    /// The owner reference marked as the managing controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

/// Contains enough information to let you identify an owning object.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// API version of the referent.
    #[serde(default)]
    pub api_version: String,
    /// Kind of the referent.
    pub kind: String,
    /// Name of the referent.
    pub name: String,
    /// If true, this reference points to the managing controller.
    #[serde(default)]
    pub controller: bool,
}
