use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDateTime};
use resources::{
    config::recommender::RecommenderConfig,
    objects::{object_reference::CrossVersionObjectReference, scale::Scale, Metadata},
};

use super::{
    scale_cache::{ScaleCache, ScaleCacheKey, ScaleResult},
    ControllerFetcher, ControllerKeyWithApiVersion,
};
use crate::{
    clients::{is_not_found, ObjectFetcher, ScaleClient},
    error::RecommenderError,
};

/// Controllers whose owner references are read directly from the object.
const WELL_KNOWN_CONTROLLERS: [&str; 7] = [
    "CronJob",
    "DaemonSet",
    "Deployment",
    "Job",
    "ReplicaSet",
    "ReplicationController",
    "StatefulSet",
];

const NODE: &str = "Node";

fn is_well_known(key: &ControllerKeyWithApiVersion) -> bool {
    WELL_KNOWN_CONTROLLERS.contains(&key.key.kind.as_str())
}

fn reference(key: &ControllerKeyWithApiVersion) -> CrossVersionObjectReference {
    CrossVersionObjectReference::new(&key.api_version, &key.key.kind, &key.key.name)
}

fn cache_key(key: &ControllerKeyWithApiVersion) -> ScaleCacheKey {
    let group_kind = match key.group() {
        "" => key.key.kind.to_owned(),
        group => format!("{}.{}", key.key.kind, group),
    };
    ScaleCacheKey {
        namespace: key.key.namespace.to_owned(),
        group_kind,
        name: key.key.name.to_owned(),
    }
}

fn owner_key(namespace: &str, metadata: &Metadata) -> Option<ControllerKeyWithApiVersion> {
    metadata.controller_ref().map(|owner| {
        ControllerKeyWithApiVersion::new(namespace, &owner.api_version, &owner.kind, &owner.name)
    })
}

/// Walks owner references through the API server,
/// caching scale subresource lookups of custom controllers.
pub struct ApiControllerFetcher {
    objects: Arc<dyn ObjectFetcher>,
    scales: Arc<dyn ScaleClient>,
    cache: ScaleCache,
}

impl ApiControllerFetcher {
    pub fn new(
        objects: Arc<dyn ObjectFetcher>,
        scales: Arc<dyn ScaleClient>,
        config: &RecommenderConfig,
    ) -> Self {
        Self {
            objects,
            scales,
            cache: ScaleCache::new(
                Duration::seconds(config.scale_cache_entry_freshness_time as i64),
                Duration::seconds(config.scale_cache_entry_lifetime as i64),
                config.scale_cache_entry_jitter_factor,
            ),
        }
    }

    async fn query_scale(&self, namespace: &str, target: &CrossVersionObjectReference) -> ScaleResult {
        match self.scales.get_scale(namespace, target).await {
            Ok(scale) => Ok(Some(scale)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(format!("{:#}", err)),
        }
    }

    async fn get_scale_for_resource(
        &self,
        key: &ControllerKeyWithApiVersion,
        now: NaiveDateTime,
    ) -> ScaleResult {
        let cache_key = cache_key(key);
        if let Some(result) = self.cache.get(&cache_key, now) {
            return result;
        }
        let result = self.query_scale(&key.key.namespace, &reference(key)).await;
        self.cache
            .insert(cache_key, reference(key), result.to_owned(), now);
        result
    }

    async fn get_parent_of_well_known(
        &self,
        key: &ControllerKeyWithApiVersion,
    ) -> Result<Option<ControllerKeyWithApiVersion>> {
        let metadata = self
            .objects
            .get_metadata(&key.key.namespace, &reference(key))
            .await?
            .ok_or_else(|| RecommenderError::ControllerNotFound {
                kind: key.key.kind.to_owned(),
                namespace: key.key.namespace.to_owned(),
                name: key.key.name.to_owned(),
            })?;
        Ok(owner_key(&key.key.namespace, &metadata))
    }

    async fn get_parent(
        &self,
        key: &ControllerKeyWithApiVersion,
        now: NaiveDateTime,
    ) -> Result<Option<ControllerKeyWithApiVersion>> {
        if is_well_known(key) {
            return self.get_parent_of_well_known(key).await;
        }
        match self.get_scale_for_resource(key, now).await {
            Ok(Some(scale)) => Ok(scale_owner(&key.key.namespace, &scale)),
            Ok(None) => Ok(None),
            Err(err) => Err(anyhow!(
                "Unhandled targetRef {} / {} / {}, last error {}",
                key.api_version,
                key.key.kind,
                key.key.name,
                err
            )),
        }
    }

    async fn is_well_known_or_scalable(
        &self,
        key: &ControllerKeyWithApiVersion,
        now: NaiveDateTime,
    ) -> bool {
        if is_well_known(key) {
            return true;
        }
        if key.key.kind == NODE {
            return false;
        }
        matches!(self.get_scale_for_resource(key, now).await, Ok(Some(_)))
    }

    /// Re-query stale scale cache entries and drop expired ones.
    pub async fn refresh_cache(&self) {
        let now = Local::now().naive_utc();
        for (key, target) in self.cache.keys_to_refresh(now) {
            let result = self.query_scale(&key.namespace, &target).await;
            self.cache.refresh(&key, result, now);
        }
        self.cache.remove_expired(now);
    }

    /// Refresh the scale cache every `period` forever.
    pub async fn run_cache_refresh_loop(self: Arc<Self>, period: std::time::Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            self.refresh_cache().await;
        }
    }
}

fn scale_owner(namespace: &str, scale: &Scale) -> Option<ControllerKeyWithApiVersion> {
    owner_key(namespace, &scale.metadata)
}

#[async_trait]
impl ControllerFetcher for ApiControllerFetcher {
    async fn find_topmost_well_known_or_scalable(
        &self,
        controller: &ControllerKeyWithApiVersion,
    ) -> Result<Option<ControllerKeyWithApiVersion>> {
        let now = Local::now().naive_utc();
        let mut key = controller.to_owned();
        let mut top_most = None;
        if self.is_well_known_or_scalable(&key, now).await {
            top_most = Some(key.to_owned());
        }
        let mut visited = HashSet::from([key.to_owned()]);
        loop {
            let owner = match self.get_parent(&key, now).await? {
                Some(owner) => owner,
                None => return Ok(top_most),
            };
            if self.is_well_known_or_scalable(&owner, now).await {
                top_most = Some(owner.to_owned());
            }
            if !visited.insert(owner.to_owned()) {
                return Err(RecommenderError::CycleInOwnership.into());
            }
            key = owner;
        }
    }
}
