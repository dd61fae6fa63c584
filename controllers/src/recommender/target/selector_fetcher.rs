use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use resources::objects::{labels::Selector, mpa::MultidimPodAutoscaler, Object};

use super::SelectorFetcher;
use crate::clients::ScaleClient;

/// Reads the selector from the scale subresource of the target.
pub struct ScaleSelectorFetcher {
    scales: Arc<dyn ScaleClient>,
}

impl ScaleSelectorFetcher {
    pub fn new(scales: Arc<dyn ScaleClient>) -> Self {
        Self {
            scales,
        }
    }
}

#[async_trait]
impl SelectorFetcher for ScaleSelectorFetcher {
    async fn fetch(&self, mpa: &MultidimPodAutoscaler) -> Result<Selector> {
        let target = mpa
            .spec
            .scale_target_ref
            .as_ref()
            .ok_or_else(|| anyhow!("scaleTargetRef not defined"))?;
        let scale = self
            .scales
            .get_scale(mpa.namespace(), target)
            .await
            .with_context(|| format!("Unhandled targetRef {}", target))?;
        if scale.status.selector.is_empty() {
            return Err(anyhow!(
                "Resource {}/{} has an empty selector for scale sub-resource",
                mpa.namespace(),
                target.name
            ));
        }
        Selector::parse(&scale.status.selector)
    }
}
