use std::fmt::{Display, Formatter};

use anyhow::Result;
use async_trait::async_trait;
use resources::objects::{
    labels::Selector, mpa::MultidimPodAutoscaler, object_reference::CrossVersionObjectReference,
};

pub mod controller_fetcher;
pub mod scale_cache;
pub mod selector_fetcher;

/// Identifies a controller object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerKeyWithApiVersion {
    pub key: ControllerKey,
    pub api_version: String,
}

impl ControllerKeyWithApiVersion {
    pub fn new(namespace: &str, api_version: &str, kind: &str, name: &str) -> Self {
        ControllerKeyWithApiVersion {
            key: ControllerKey {
                namespace: namespace.to_string(),
                kind: kind.to_string(),
                name: name.to_string(),
            },
            api_version: api_version.to_string(),
        }
    }

    pub fn from_reference(namespace: &str, reference: &CrossVersionObjectReference) -> Self {
        Self::new(
            namespace,
            &reference.api_version,
            &reference.kind,
            &reference.name,
        )
    }

    /// API group part of the api version, empty for the core group.
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }
}

impl Display for ControllerKeyWithApiVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} {}/{}",
            self.api_version, self.key.kind, self.key.namespace, self.key.name
        )
    }
}

/// Resolves controllers to the top-most controller owning them.
#[async_trait]
pub trait ControllerFetcher: Send + Sync {
    /// Walk the owner references up from `controller` and return the
    /// top-most controller which is well known or exposes a scale subresource.
    /// Returns None when no such controller exists.
    async fn find_topmost_well_known_or_scalable(
        &self,
        controller: &ControllerKeyWithApiVersion,
    ) -> Result<Option<ControllerKeyWithApiVersion>>;
}

/// Resolves the pod selector of the workload an MPA targets.
#[async_trait]
pub trait SelectorFetcher: Send + Sync {
    async fn fetch(&self, mpa: &MultidimPodAutoscaler) -> Result<Selector>;
}
