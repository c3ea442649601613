#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Spire Engine
//!
//! Durable workflow execution on top of the [`spire_ports::Store`] traits.
//!
//! - [`Workflow`] / [`Step`] -- user task logic, registered by name
//! - [`ActionHandler`] -- side-effecting clients, invoked through the effect ledger
//! - [`Orchestrator`] -- drives one claimed run through checkpoints
//! - [`Dispatcher`] -- N worker tasks claiming runs by lease
//! - [`Sweeper`] -- expires overdue approval tickets
//! - [`ControlSurface`] -- tenant-scoped start, inspect, decide and cancel
//! - [`TimelineReader`] -- paged streams over a run's events
//!
//! [`Engine`] wires them together around one store and one [`Telemetry`].

pub mod action;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod step;
pub mod sweeper;
pub mod timeline;
pub mod workflow;

use std::sync::Arc;

pub use action::{ActionCall, ActionError, ActionHandler, ActionRegistry};
pub use config::EngineConfig;
pub use control::{Caller, ControlSurface, Snapshot, StartOptions};
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use error::EngineError;
pub use orchestrator::{Disposition, Orchestrator};
pub use step::{
    ApprovalRequest, EffectRequest, FnStep, RetryPolicy, Step, StepContext, StepError, StepOutcome,
};
pub use sweeper::Sweeper;
pub use timeline::TimelineReader;
pub use workflow::{Workflow, WorkflowRegistry};

use spire_ports::Store;
use spire_telemetry::Telemetry;

/// One store, its registries and the components built on them.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    workflows: Arc<WorkflowRegistry>,
    actions: Arc<ActionRegistry>,
    telemetry: Telemetry,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine over `store`, validating `config`.
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            store,
            workflows: Arc::new(WorkflowRegistry::new()),
            actions: Arc::new(ActionRegistry::new()),
            telemetry: Telemetry::new(config.notification_capacity),
            config,
        })
    }

    /// Register a workflow definition.
    pub fn register_workflow(&self, workflow: Workflow) -> Result<(), EngineError> {
        self.workflows.register(workflow)
    }

    /// Register the handler for `action`.
    pub fn register_action(&self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.actions.register(action, handler);
    }

    /// Tenant-scoped operations.
    #[must_use]
    pub fn control(&self) -> ControlSurface {
        ControlSurface::new(Arc::clone(&self.store), Arc::clone(&self.workflows))
    }

    /// A run driver sharing this engine's registries.
    #[must_use]
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.workflows),
            Arc::clone(&self.actions),
            self.telemetry.clone(),
            self.config.clone(),
        )
    }

    /// A worker pool. Each call creates an independent in-flight map.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.orchestrator(),
            Arc::clone(&self.store),
            self.telemetry.clone(),
            self.config.clone(),
        )
    }

    /// The ticket sweeper.
    #[must_use]
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            Arc::clone(&self.store),
            self.telemetry.clone(),
            self.config.sweep_interval,
        )
    }

    /// Paged reads of run timelines.
    #[must_use]
    pub fn timeline(&self) -> TimelineReader {
        TimelineReader::new(Arc::clone(&self.store))
    }

    /// Metrics and notifications.
    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Workflow registry.
    #[must_use]
    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    /// The store everything runs on.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workflows", &self.workflows.ids())
            .field("actions", &self.actions)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
