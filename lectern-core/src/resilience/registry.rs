use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::playback::{PlaybackResult, PlayerKind};
use crate::sync::lock;

/// A mounted player that the registry can force down.
#[async_trait]
pub trait ManagedInstance: Send + Sync {
    fn instance_id(&self) -> &str;
    fn kind(&self) -> PlayerKind;
    fn container_id(&self) -> &str;
    /// Stops and destroys the underlying player without touching the registry.
    async fn release(&self) -> PlaybackResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveInstance {
    pub instance_id: String,
    pub kind: PlayerKind,
    pub container_id: String,
}

struct RegisteredInstance {
    summary: ActiveInstance,
    handle: Arc<dyn ManagedInstance>,
}

/// Process-wide bound on concurrently mounted players.
pub struct InstanceRegistry {
    capacity: usize,
    admission: tokio::sync::Mutex<()>,
    entries: Mutex<VecDeque<RegisteredInstance>>,
}

impl fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("capacity", &self.capacity)
            .field("active", &self.active_instance_count())
            .finish()
    }
}

impl InstanceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            admission: tokio::sync::Mutex::new(()),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admits `instance`, tearing down the oldest entries first when the
    /// registry is full. Returns the ids that were evicted.
    pub async fn register(&self, instance: Arc<dyn ManagedInstance>) -> Vec<String> {
        let _admission = self.admission.lock().await;

        let evicted = {
            let mut entries = lock(&self.entries);
            entries.retain(|entry| entry.summary.instance_id != instance.instance_id());
            let mut evicted = Vec::new();
            while entries.len() >= self.capacity {
                match entries.pop_front() {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
            evicted
        };

        let mut evicted_ids = Vec::with_capacity(evicted.len());
        for entry in evicted {
            info!(
                target: "playback",
                evicted = %entry.summary.instance_id,
                incoming = %instance.instance_id(),
                "player capacity reached, tearing down oldest instance"
            );
            release_defensively(&entry).await;
            evicted_ids.push(entry.summary.instance_id);
        }

        let summary = ActiveInstance {
            instance_id: instance.instance_id().to_string(),
            kind: instance.kind(),
            container_id: instance.container_id().to_string(),
        };
        debug!(target: "playback", instance_id = %summary.instance_id, "player registered");
        lock(&self.entries).push_back(RegisteredInstance {
            summary,
            handle: instance,
        });
        evicted_ids
    }

    /// Forgets an instance that already tore itself down.
    pub fn unregister(&self, instance_id: &str) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|entry| entry.summary.instance_id != instance_id);
        before != entries.len()
    }

    pub fn active_instance_count(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn active_instances(&self) -> Vec<ActiveInstance> {
        lock(&self.entries)
            .iter()
            .map(|entry| entry.summary.clone())
            .collect()
    }

    pub fn is_active(&self, instance_id: &str) -> bool {
        lock(&self.entries)
            .iter()
            .any(|entry| entry.summary.instance_id == instance_id)
    }

    /// Releases every registered player; one failing teardown does not stop
    /// the others.
    pub async fn teardown_all(&self) -> usize {
        let _admission = self.admission.lock().await;
        let drained: Vec<RegisteredInstance> = lock(&self.entries).drain(..).collect();
        let count = drained.len();
        for entry in &drained {
            release_defensively(entry).await;
        }
        count
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new(1)
    }
}

async fn release_defensively(entry: &RegisteredInstance) {
    if let Err(err) = entry.handle.release().await {
        warn!(
            target: "playback",
            instance_id = %entry.summary.instance_id,
            kind = %entry.summary.kind,
            "player teardown failed: {err}"
        );
    }
}
