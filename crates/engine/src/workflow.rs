//! Workflow definitions and their registry.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use spire_core::WorkflowId;

use crate::error::EngineError;
use crate::step::Step;

/// An ordered list of steps under a name.
pub struct Workflow {
    id: WorkflowId,
    steps: Vec<Arc<dyn Step>>,
}

impl Workflow {
    /// Start a workflow definition.
    pub fn new(id: WorkflowId) -> Self {
        Self {
            id,
            steps: Vec::new(),
        }
    }

    /// Append a step.
    #[must_use]
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Workflow name.
    #[must_use]
    pub fn id(&self) -> &WorkflowId {
        &self.id
    }

    /// Step at `position`, `None` past the end.
    #[must_use]
    pub fn step_at(&self, position: usize) -> Option<&Arc<dyn Step>> {
        self.steps.get(position)
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the workflow has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::Validation(format!("workflow {} has no steps", self.id)));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            let name = step.name();
            if name.trim().is_empty() {
                return Err(EngineError::Validation(format!(
                    "workflow {} has a step with an empty name",
                    self.id
                )));
            }
            if !seen.insert(name) {
                return Err(EngineError::Validation(format!(
                    "workflow {} has duplicate step {name:?}",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let steps: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("steps", &steps)
            .finish()
    }
}

/// Thread-safe registry of workflows keyed by id.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    workflows: DashMap<WorkflowId, Arc<Workflow>>,
}

impl WorkflowRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `workflow`, replacing any previous definition with the same id.
    ///
    /// Runs already in flight pick up the new definition at their next claim,
    /// so replacing a workflow must keep existing step positions meaningful.
    pub fn register(&self, workflow: Workflow) -> Result<(), EngineError> {
        workflow.validate()?;
        tracing::info!(workflow = %workflow.id, steps = workflow.len(), "registered workflow");
        self.workflows.insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    /// Workflow for `id`.
    #[must_use]
    pub fn get(&self, id: &WorkflowId) -> Option<Arc<Workflow>> {
        self.workflows.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &WorkflowId) -> bool {
        self.workflows.contains_key(id)
    }

    /// Registered workflow ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<WorkflowId> = self.workflows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
