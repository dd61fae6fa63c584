use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use dashmap::DashMap;
use futures::StreamExt;
use resources::{
    models::etcd::WatchEvent,
    objects::{labels::Selector, metrics::Resource, pod::Pod, Object},
};
use tokio::{sync::mpsc, time::Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{clients::PodLister, model::ContainerId};

const OOM_KILLED: &str = "OOMKilled";
const INITIAL_BACKOFF: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const BACKOFF_JITTER: f64 = 0.5;

/// An OOM kill of a container.
#[derive(Debug, Clone, PartialEq)]
pub struct OomInfo {
    pub timestamp: NaiveDateTime,
    /// Memory request of the container when it was killed, in bytes.
    pub memory: i64,
    pub container_id: ContainerId,
}

pub fn channel(capacity: usize) -> (mpsc::Sender<OomInfo>, mpsc::Receiver<OomInfo>) {
    mpsc::channel(capacity.max(1))
}

/// OOM kills found by comparing two versions of a pod.
pub fn find_ooms(old: &Pod, new: &Pod) -> Vec<OomInfo> {
    let (old_status, new_status) = match (&old.status, &new.status) {
        (Some(old), Some(new)) => (old, new),
        _ => return vec![],
    };
    new_status
        .container_statuses
        .iter()
        .filter_map(|status| {
            let terminated = status.last_state.as_ref()?;
            if terminated.reason != OOM_KILLED {
                return None;
            }
            let old_restarts = old_status
                .container_statuses
                .iter()
                .find(|s| s.name == status.name)
                .map(|s| s.restart_count)?;
            if status.restart_count <= old_restarts {
                return None;
            }
            let memory = old
                .spec
                .containers
                .iter()
                .find(|c| c.name == status.name)
                .and_then(|c| c.resources.requests.get(&Resource::Memory))
                .cloned()?;
            Some(OomInfo {
                timestamp: terminated.finished_at,
                memory,
                container_id: ContainerId::new(new.namespace(), new.name(), &status.name),
            })
        })
        .collect()
}

/// Watches pod updates for OOM killed containers and reports them
/// into a bounded channel, dropping events rather than blocking.
pub struct OomObserver {
    pods: DashMap<String, Pod>,
    tx: mpsc::Sender<OomInfo>,
    lister: Arc<dyn PodLister>,
    watch_url: String,
}

impl OomObserver {
    pub fn new(tx: mpsc::Sender<OomInfo>, lister: Arc<dyn PodLister>, watch_base_url: &str) -> Self {
        Self {
            pods: DashMap::new(),
            tx,
            lister,
            watch_url: format!("{}/api/v1/watch/pods", watch_base_url.trim_end_matches('/')),
        }
    }

    pub fn on_update(&self, old: &Pod, new: &Pod) {
        for oom in find_ooms(old, new) {
            tracing::debug!("OOM detected {:?}", oom);
            if let Err(err) = self.tx.try_send(oom) {
                tracing::warn!("Dropping OOM event: {}", err);
            }
        }
    }

    pub fn handle_event(&self, event: WatchEvent<Pod>) {
        match event {
            WatchEvent::Put(e) => {
                if let Some(old) = self.pods.insert(e.key, e.object.to_owned()) {
                    if old != e.object {
                        self.on_update(&old, &e.object);
                    }
                }
            },
            WatchEvent::Delete(e) => {
                if self.pods.remove(&e.key).is_none() {
                    tracing::debug!("Watch inconsistent, pod {} already deleted", e.key);
                }
            },
        }
    }

    async fn list(&self) -> Result<()> {
        let pods = self
            .lister
            .list_pods(None, &Selector::everything())
            .await
            .with_context(|| "Failed to list pods")?;
        self.pods.clear();
        for pod in pods {
            self.pods.insert(pod.key(), pod);
        }
        Ok(())
    }

    async fn watch(&self) -> Result<()> {
        let (stream, _) = connect_async(self.watch_url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", self.watch_url))?;
        let (_, mut receiver) = stream.split();
        tracing::info!("OOM observer connected, receiving pod events...");
        loop {
            let msg: Message = receiver
                .next()
                .await
                .ok_or_else(|| anyhow!("Failed to receive watch message from api-server"))??;
            if msg.is_close() {
                return Err(anyhow!("Api-server watch disconnect"));
            }
            if let Message::Text(msg) = msg {
                let event: WatchEvent<Pod> = serde_json::from_str(msg.as_str())?;
                self.handle_event(event);
            } else {
                tracing::warn!("Receive none text watch message from api-server");
            }
        }
    }

    /// List then watch pods forever, reconnecting with jittered exponential back-off.
    pub async fn run(self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.list().await {
                Ok(()) => {
                    backoff = INITIAL_BACKOFF;
                    if let Err(err) = self.watch().await {
                        tracing::warn!("Pod watch ended unexpectedly, caused by: {:#}", err);
                    }
                },
                Err(err) => tracing::warn!("{:#}", err),
            }
            let delay = backoff.mul_f64(1.0 + rand::random::<f64>() * BACKOFF_JITTER);
            tracing::info!("Restarting OOM observer in {:?}", delay);
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use resources::{
        models::etcd::{DeleteEvent, PutEvent},
        objects::{
            metrics::ResourceList,
            pod::{
                Container, ContainerStateTerminated, ContainerStatus, PodPhase, PodSpec,
                PodStatus, ResourceRequirements,
            },
            Metadata,
        },
    };

    use super::*;

    struct NoPods;

    #[async_trait]
    impl PodLister for NoPods {
        async fn list_pods(&self, _: Option<&str>, _: &Selector) -> Result<Vec<Pod>> {
            Ok(vec![])
        }
    }

    fn finished_at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 6, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    fn pod(memory: i64, restarts: u32, reason: &str) -> Pod {
        Pod {
            metadata: Metadata::new("default", "web-1"),
            spec: PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    image: "nginx".to_string(),
                    resources: ResourceRequirements {
                        requests: ResourceList::from([(Resource::Memory, memory)]),
                        limits: ResourceList::new(),
                    },
                }],
                node_name: None,
            },
            status: Some(PodStatus {
                phase: PodPhase::Running,
                container_statuses: vec![ContainerStatus {
                    name: "app".to_string(),
                    restart_count: restarts,
                    last_state: (!reason.is_empty()).then(|| ContainerStateTerminated {
                        exit_code: 137,
                        reason: reason.to_string(),
                        finished_at: finished_at(),
                    }),
                }],
                ..Default::default()
            }),
        }
    }

    #[test]
    fn restart_after_oom_kill_is_reported() {
        let ooms = find_ooms(&pod(200, 0, ""), &pod(300, 1, OOM_KILLED));
        assert_eq!(
            ooms,
            vec![OomInfo {
                timestamp: finished_at(),
                memory: 200,
                container_id: ContainerId::new("default", "web-1", "app"),
            }]
        );
    }

    #[test]
    fn other_restarts_are_ignored() {
        assert!(find_ooms(&pod(200, 0, ""), &pod(200, 1, "Error")).is_empty());
        assert!(find_ooms(&pod(200, 1, OOM_KILLED), &pod(200, 1, OOM_KILLED)).is_empty());
    }

    #[test]
    fn watch_events_feed_the_channel() {
        let (tx, mut rx) = channel(1);
        let observer = OomObserver::new(tx, Arc::new(NoPods), "ws://localhost:8080/");
        assert_eq!(observer.watch_url, "ws://localhost:8080/api/v1/watch/pods");

        let key = pod(0, 0, "").key();
        observer.handle_event(WatchEvent::Put(PutEvent {
            key: key.to_owned(),
            object: pod(200, 0, ""),
        }));
        assert!(rx.try_recv().is_err());

        observer.handle_event(WatchEvent::Put(PutEvent {
            key: key.to_owned(),
            object: pod(200, 1, OOM_KILLED),
        }));
        assert_eq!(rx.try_recv().map(|oom| oom.memory), Ok(200));

        // A full channel drops the event instead of blocking
        observer.handle_event(WatchEvent::Put(PutEvent {
            key: key.to_owned(),
            object: pod(200, 2, OOM_KILLED),
        }));
        observer.handle_event(WatchEvent::Put(PutEvent {
            key: key.to_owned(),
            object: pod(200, 3, OOM_KILLED),
        }));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        observer.handle_event(WatchEvent::Delete(DeleteEvent {
            key,
        }));
        assert!(observer.pods.is_empty());
    }
}
