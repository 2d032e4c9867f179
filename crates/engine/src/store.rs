//! Read-only access to workflow definitions.
//!
//! The engine does not own persistence; the definition store is an external
//! collaborator. [`InMemoryStore`] is the reference implementation used by
//! the orchestrator in tests and embedded deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::models::Workflow;

/// Read-only workflow lookup.
pub trait DefinitionStore: Send + Sync {
    fn workflow(&self, id: Uuid) -> Option<Arc<Workflow>>;
    fn workflows(&self) -> Vec<Arc<Workflow>>;
}

/// Simple in-process store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<HashMap<Uuid, Arc<Workflow>>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, workflow: Workflow) -> Arc<Workflow> {
        let workflow = Arc::new(workflow);
        self.inner
            .write()
            .unwrap()
            .insert(workflow.id, workflow.clone());
        workflow
    }
}

impl DefinitionStore for InMemoryStore {
    fn workflow(&self, id: Uuid) -> Option<Arc<Workflow>> {
        self.inner.read().unwrap().get(&id).cloned()
    }

    fn workflows(&self) -> Vec<Arc<Workflow>> {
        self.inner.read().unwrap().values().cloned().collect()
    }
}
