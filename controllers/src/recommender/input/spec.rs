use std::sync::Arc;

use anyhow::Result;
use resources::objects::{
    labels::Selector,
    metrics::ResourceList,
    pod::{Pod, PodPhase},
    Labels,
};

use crate::{
    clients::PodLister,
    model::{ContainerId, PodId},
};

/// The parts of a pod the cluster state tracks.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicPodSpec {
    pub id: PodId,
    pub labels: Labels,
    pub phase: PodPhase,
    pub containers: Vec<BasicContainerSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicContainerSpec {
    pub id: ContainerId,
    pub image: String,
    pub request: ResourceList,
}

impl From<&Pod> for BasicPodSpec {
    fn from(pod: &Pod) -> Self {
        let id = PodId::new(&pod.metadata.namespace, &pod.metadata.name);
        let containers = pod
            .spec
            .containers
            .iter()
            .map(|container| BasicContainerSpec {
                id: ContainerId {
                    pod_id: id.to_owned(),
                    container_name: container.name.to_owned(),
                },
                image: container.image.to_owned(),
                request: container.resources.requests.to_owned(),
            })
            .collect();
        BasicPodSpec {
            id,
            labels: pod.metadata.labels.to_owned(),
            phase: pod.phase(),
            containers,
        }
    }
}

pub struct SpecClient {
    pods: Arc<dyn PodLister>,
}

impl SpecClient {
    pub fn new(pods: Arc<dyn PodLister>) -> Self {
        Self {
            pods,
        }
    }

    /// Specs of every pod past the Pending phase.
    pub async fn get_pod_specs(&self) -> Result<Vec<BasicPodSpec>> {
        let pods = self.pods.list_pods(None, &Selector::everything()).await?;
        Ok(pods
            .iter()
            .filter(|pod| pod.phase() != PodPhase::Pending)
            .map(BasicPodSpec::from)
            .collect())
    }
}
