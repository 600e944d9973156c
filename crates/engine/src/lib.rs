pub mod engine;
pub mod error;
pub mod notify;
pub mod queue;
pub mod registry;
pub mod settlement;
pub mod step_manager;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod worker;

pub use engine::{validate_step_templates, SubmitReceipt, WorkflowEngine};
pub use error::{EngineError, Result};
pub use notify::{channels_for_step, LogNotifier, NotificationFanout, NotificationService, Notifier};
pub use queue::{DeadJob, Job, JobOptions, JobQueue};
pub use registry::{ActionHandler, ActionRegistry};
pub use settlement::{ApprovalSettlement, SettleOutcome, SettlementHandler};
pub use step_manager::StepManager;
pub use store::{MemoryStore, WorkflowStore};
pub use sweeper::{ExpirySweeper, ResendReceipt};
pub use types::{
    Approval, ApprovalChannel, ApprovalField, ApprovalId, ApprovalStatus, CompensationConfig,
    Decision, DefinitionId, Event, EventType, FieldType, Step, StepConfig, StepId, StepKind,
    StepReplay, StepState, StepTemplate, Workflow, WorkflowDefinition, WorkflowId, WorkflowState,
};
pub use worker::{JobHandler, QueueWorker};
