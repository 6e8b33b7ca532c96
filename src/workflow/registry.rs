/// Hot-reload workflow registry using ArcSwap
///
/// Lock-free cache of workflow definitions in front of the SQLite storage.
/// Executions read definitions through here; updates swap the whole map so
/// readers never block and never observe a half-applied change.

use crate::error::Result;
use crate::workflow::{storage::WorkflowStorage, types::Workflow};
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Cached workflow definitions keyed by workflow id
#[derive(Debug)]
pub struct WorkflowRegistry {
    workflows: ArcSwap<HashMap<String, Arc<Workflow>>>,
    /// Backing storage; `None` keeps the registry purely in memory
    storage: Option<WorkflowStorage>,
}

impl WorkflowRegistry {
    pub fn new(storage: Option<WorkflowStorage>) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// In-memory registry without persistence
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Fetch a definition, loading it from storage on a cache miss
    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Arc<Workflow>>> {
        if let Some(workflow) = self.workflows.load().get(workflow_id) {
            return Ok(Some(Arc::clone(workflow)));
        }

        let Some(storage) = &self.storage else {
            return Ok(None);
        };

        match storage.get_workflow(workflow_id).await? {
            Some(workflow) => {
                tracing::debug!(workflow_id, "Loaded workflow definition from storage");
                let workflow = Arc::new(workflow);
                self.swap_in(Arc::clone(&workflow));
                Ok(Some(workflow))
            }
            None => Ok(None),
        }
    }

    /// Persist (when backed by storage) and cache a definition
    pub async fn upsert_workflow(&self, workflow: Workflow) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.save_workflow(&workflow).await?;
        }
        tracing::info!(workflow_id = %workflow.id, nodes = workflow.nodes.len(), "Registered workflow");
        self.swap_in(Arc::new(workflow));
        Ok(())
    }

    /// Drop a definition from the cache and the storage
    pub async fn remove_workflow(&self, workflow_id: &str) -> Result<bool> {
        let current = self.workflows.load();
        let mut next = (**current).clone();
        let cached = next.remove(workflow_id).is_some();
        self.workflows.store(Arc::new(next));

        let stored = match &self.storage {
            Some(storage) => storage.delete_workflow(workflow_id).await?,
            None => false,
        };
        Ok(cached || stored)
    }

    /// Ids of cached definitions
    pub fn list_workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn swap_in(&self, workflow: Arc<Workflow>) {
        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(workflow.id.clone(), Arc::clone(&workflow));
            next
        });
    }
}
