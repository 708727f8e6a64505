//! Registry of live supervisors, keyed by daemon kind.

use crate::supervisor::supervisor::Supervisor;
use crate::supervisor::types::{DaemonDescriptor, DaemonKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Reads are concurrent, registration serialises.
#[derive(Default)]
pub struct SupervisorRegistry {
    inner: RwLock<HashMap<DaemonKind, Arc<dyn Supervisor>>>,
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, supervisor: Arc<dyn Supervisor>) {
        let kind = supervisor.kind();
        let mut inner = self.inner.write().await;
        if inner.insert(kind, supervisor).is_some() {
            log::warn!("[registry] supervisor {} replaced", kind.as_str());
        } else {
            log::info!("[registry] supervisor {} registered", kind.as_str());
        }
    }

    pub async fn get(&self, kind: DaemonKind) -> Option<Arc<dyn Supervisor>> {
        self.inner.read().await.get(&kind).cloned()
    }

    pub async fn kinds(&self) -> Vec<DaemonKind> {
        self.inner.read().await.keys().copied().collect()
    }

    pub async fn all(&self) -> Vec<Arc<dyn Supervisor>> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Descriptors for every registered supervisor.
    pub async fn descriptors(&self) -> Vec<DaemonDescriptor> {
        let supervisors = self.all().await;
        let mut out = Vec::with_capacity(supervisors.len());
        for supervisor in supervisors {
            out.push(supervisor.status().await);
        }
        out.sort_by_key(|d| d.kind.as_str());
        out
    }
}
