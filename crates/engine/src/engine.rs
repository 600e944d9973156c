//! Workflow driver and step executor
//!
//! The engine advances a workflow across its step sequence: AUTO steps run
//! synchronously through the action registry, HUMAN steps suspend behind a
//! freshly minted approval and resume later through the settlement
//! pipeline. Aggregate workflow state is always recomputed from step and
//! approval facts, never carried forward.

use crate::error::{EngineError, Result};
use crate::notify::NotificationService;
use crate::queue::JobQueue;
use crate::registry::ActionRegistry;
use crate::store::WorkflowStore;
use crate::types::{
    Approval, ApprovalChannel, ApprovalId, ApprovalStatus, Decision, DefinitionId, Event,
    EventType, Step, StepId, StepKind, StepState, StepTemplate, Workflow, WorkflowDefinition,
    WorkflowId, WorkflowState,
};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How long an approval stays open before the sweeper may expire it
pub const DEFAULT_APPROVAL_TTL_HOURS: i64 = 24;

/// Receipt returned by `submit_decision`: the decision is queued, not
/// applied synchronously
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub job_id: String,
    /// False when a job for the same token was already queued
    pub queued: bool,
}

/// Main workflow engine
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    actions: Arc<ActionRegistry>,
    notifications: NotificationService,
    approval_queue: JobQueue,
    approval_ttl: chrono::Duration,
}

impl WorkflowEngine {
    /// Create a new workflow engine
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        actions: Arc<ActionRegistry>,
        notifications: NotificationService,
        approval_queue: JobQueue,
    ) -> Self {
        Self {
            store,
            actions,
            notifications,
            approval_queue,
            approval_ttl: chrono::Duration::hours(DEFAULT_APPROVAL_TTL_HOURS),
        }
    }

    /// Override the approval TTL
    pub fn with_approval_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.approval_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn approval_queue(&self) -> &JobQueue {
        &self.approval_queue
    }

    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }

    pub fn approval_ttl(&self) -> chrono::Duration {
        self.approval_ttl
    }

    // ========== Definition Management ==========

    /// Register a new definition version after validating step shape
    pub async fn create_definition(
        &self,
        name: &str,
        steps: Vec<StepTemplate>,
        description: Option<String>,
    ) -> Result<WorkflowDefinition> {
        validate_step_templates(&steps)?;

        let version = self.store.latest_version(name).await?.map_or(1, |v| v + 1);
        let definition = WorkflowDefinition {
            id: DefinitionId::new(),
            name: name.to_string(),
            version,
            description,
            steps,
            is_active: true,
            created_at: Utc::now(),
        };
        self.store.put_definition(definition.clone()).await?;

        info!(name, version, "created workflow definition");
        Ok(definition)
    }

    /// Active highest-version definition for a type
    pub async fn active_definition(&self, name: &str) -> Result<WorkflowDefinition> {
        self.store
            .active_definition(name)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(name.to_string()))
    }

    /// Deactivate every active version of a definition name
    pub async fn deactivate_definition(&self, name: &str) -> Result<usize> {
        let count = self.store.deactivate_definitions(name).await?;
        info!(name, count, "deactivated workflow definition");
        Ok(count)
    }

    /// Human-readable list of instantiable workflow types
    pub async fn available_workflow_types(&self) -> Result<Vec<String>> {
        let mut definitions = self.store.definitions().await?;
        definitions.retain(|d| d.is_active);
        definitions.sort_by(|a, b| a.name.cmp(&b.name).then(b.version.cmp(&a.version)));
        definitions.dedup_by(|a, b| a.name == b.name);
        Ok(definitions
            .iter()
            .map(|d| {
                format!(
                    "{} (v{}) - {}",
                    d.name,
                    d.version,
                    d.description.as_deref().unwrap_or("")
                )
            })
            .collect())
    }

    // ========== Workflow Lifecycle ==========

    /// Instantiate a workflow from the active definition of a type
    pub async fn create_workflow(
        &self,
        workflow_type: &str,
        metadata: serde_json::Value,
    ) -> Result<Workflow> {
        let definition = self.active_definition(workflow_type).await?;
        info!(
            name = %definition.name,
            version = definition.version,
            "using workflow definition"
        );

        let workflow_id = WorkflowId::new();
        let now = Utc::now();
        let steps = definition
            .steps
            .iter()
            .enumerate()
            .map(|(idx, template)| Step::from_template(workflow_id, idx, template))
            .collect();

        let workflow = Workflow {
            id: workflow_id,
            workflow_type: workflow_type.to_string(),
            state: WorkflowState::Pending,
            metadata,
            current_step_index: 0,
            steps,
            approvals: Vec::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
        };
        self.store.insert_workflow(workflow.clone()).await?;

        self.append_event(
            workflow_id,
            EventType::WorkflowCreated,
            json!({
                "definition_type": workflow_type,
                "definition_version": definition.version,
                "steps_count": definition.steps.len(),
            }),
        )
        .await?;

        Ok(workflow)
    }

    /// Execute a workflow from its first unfinished step
    pub async fn execute_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        self.execute_from(workflow_id, 0).await
    }

    /// Execute a workflow's steps in ascending index order starting at
    /// `from_idx`, skipping completed ones. Halts at the first step that
    /// suspends on an approval; this is the engine's single suspension
    /// point. The aggregate state is re-derived and persisted afterwards,
    /// including on the failure path.
    pub async fn execute_from(&self, workflow_id: WorkflowId, from_idx: usize) -> Result<Workflow> {
        let mut workflow = self.require_workflow(workflow_id).await?;
        info!(%workflow_id, steps = workflow.steps.len(), from_idx, "executing workflow");

        loop {
            let next = workflow
                .steps
                .iter()
                .filter(|s| s.idx >= from_idx && s.state != StepState::Done)
                .map(|s| s.idx)
                .min();
            let Some(idx) = next else { break };

            match self.run_step(&mut workflow, idx).await {
                Ok(StepState::Waiting) => {
                    info!(%workflow_id, step_idx = idx, "workflow paused waiting for approval");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    // Leave persisted state consistent before re-raising
                    if let Err(persist_err) = self.persist_derived_state(&mut workflow).await {
                        error!(%workflow_id, error = %persist_err, "failed to persist state after step failure");
                    }
                    return Err(e);
                }
            }
        }

        self.persist_derived_state(&mut workflow).await?;
        Ok(workflow)
    }

    /// Recompute the aggregate state from current facts and persist it
    pub async fn update_workflow_state(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        let mut workflow = self.require_workflow(workflow_id).await?;
        self.persist_derived_state(&mut workflow).await?;
        Ok(workflow)
    }

    /// Cancel a workflow (supplemental operator action)
    pub async fn cancel_workflow(
        &self,
        workflow_id: WorkflowId,
        reason: Option<String>,
    ) -> Result<Workflow> {
        let mut workflow = self.require_workflow(workflow_id).await?;
        workflow.state = WorkflowState::Rejected;
        workflow = self.store.update_workflow(&workflow).await?;

        self.append_event(
            workflow_id,
            EventType::WorkflowCancelled,
            json!({ "reason": reason }),
        )
        .await?;

        info!(%workflow_id, "workflow cancelled");
        Ok(workflow)
    }

    /// Delete a workflow and everything it owns
    pub async fn delete_workflow(&self, workflow_id: WorkflowId) -> Result<()> {
        self.store.delete_workflow(workflow_id).await?;
        info!(%workflow_id, "workflow deleted");
        Ok(())
    }

    pub async fn workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        self.require_workflow(workflow_id).await
    }

    pub async fn workflows(&self) -> Result<Vec<Workflow>> {
        self.store.workflows().await
    }

    pub async fn events(&self, workflow_id: WorkflowId) -> Result<Vec<Event>> {
        self.store.events(workflow_id).await
    }

    // ========== Decision Intake ==========

    /// Queue a human decision for asynchronous settlement. Deduplicated by
    /// token, so a double submission collapses into one job.
    pub fn submit_decision(
        &self,
        token: &str,
        decision: Decision,
        feedback: Option<String>,
        actor: &str,
    ) -> SubmitReceipt {
        let job_id = format!("approval-{token}");
        let queued = self.approval_queue.add(
            job_id.clone(),
            json!({
                "token": token,
                "decision": decision,
                "feedback": feedback,
                "actor": actor,
            }),
        );
        info!(%job_id, %decision, queued, "approval decision queued");
        SubmitReceipt { job_id, queued }
    }

    // ========== Step Execution ==========

    /// Run one step to completion or suspension. Public to the crate so
    /// the replay manager can resume a specific step.
    pub(crate) async fn run_step(
        &self,
        workflow: &mut Workflow,
        idx: usize,
    ) -> Result<StepState> {
        let step = workflow
            .step_at(idx)
            .ok_or_else(|| EngineError::StepNotFound(format!("index {idx}")))?;
        let step_id = step.id;
        let kind = step.kind;
        debug!(workflow_id = %workflow.id, step_idx = idx, ?kind, "executing step");

        self.mark_step(workflow, step_id, StepState::Ready).await?;

        let result = match kind {
            StepKind::Auto => self.run_auto_step(workflow, step_id, idx).await,
            StepKind::Human => self.run_human_step(workflow, step_id, idx).await,
        };

        match result {
            Ok(state) => Ok(state),
            Err(e) => {
                self.fail_step(workflow, step_id, &e).await;
                Err(e)
            }
        }
    }

    async fn run_auto_step(
        &self,
        workflow: &mut Workflow,
        step_id: StepId,
        idx: usize,
    ) -> Result<StepState> {
        let step = workflow
            .step(step_id)
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?
            .clone();

        self.actions.dispatch(workflow, &step).await?;

        let now = Utc::now();
        if let Some(step) = workflow.step_mut(step_id) {
            step.state = StepState::Done;
            step.executed_at = Some(now);
            step.failed_at = None;
            step.updated_at = now;
        }
        workflow.current_step_index = idx + 1;
        *workflow = self.store.update_workflow(workflow).await?;

        info!(workflow_id = %workflow.id, step_idx = idx, "auto step completed");
        Ok(StepState::Done)
    }

    async fn run_human_step(
        &self,
        workflow: &mut Workflow,
        step_id: StepId,
        idx: usize,
    ) -> Result<StepState> {
        let now = Utc::now();
        let channel = workflow
            .step(step_id)
            .and_then(|s| s.config.channel)
            .unwrap_or(ApprovalChannel::Web);

        // At most one pending approval per step: a re-issued request
        // supersedes whatever is still open
        let superseded = workflow.expire_pending_approvals(step_id, now);
        if superseded > 0 {
            debug!(workflow_id = %workflow.id, step_idx = idx, superseded, "expired superseded approvals");
        }

        let approval = Approval {
            id: ApprovalId::new(),
            workflow_id: workflow.id,
            step_id,
            channel,
            status: ApprovalStatus::Pending,
            token: approval_token(),
            expires_at: now + self.approval_ttl,
            feedback: None,
            decided_by: None,
            created_at: now,
            updated_at: now,
        };
        let approval_id = approval.id;
        let token = approval.token.clone();
        workflow.approvals.push(approval);

        if let Some(step) = workflow.step_mut(step_id) {
            step.state = StepState::Waiting;
            step.updated_at = now;
        }
        workflow.current_step_index = idx;
        *workflow = self.store.update_workflow(workflow).await?;

        // Hand off delivery; a full notification queue must not fail the step
        if !self
            .notifications
            .queue_approval_request(workflow.id, step_id, approval_id, &token)
        {
            warn!(workflow_id = %workflow.id, %approval_id, "notification job already queued");
        }

        self.append_event(
            workflow.id,
            EventType::ApprovalRequested,
            json!({
                "approval_id": approval_id,
                "channel": channel,
                "step_id": step_id,
                "step_index": idx,
                "token": token,
            }),
        )
        .await?;

        info!(workflow_id = %workflow.id, step_idx = idx, %channel, "human step - approval requested");
        Ok(StepState::Waiting)
    }

    /// Mark the step FAILED, record the event and run compensation. Called
    /// on the failure path only; the original error is re-raised by the
    /// caller.
    async fn fail_step(&self, workflow: &mut Workflow, step_id: StepId, cause: &EngineError) {
        let now = Utc::now();
        let idx = workflow.step(step_id).map(|s| s.idx);
        error!(workflow_id = %workflow.id, step_idx = ?idx, error = %cause, "step execution failed");

        if let Some(step) = workflow.step_mut(step_id) {
            step.state = StepState::Failed;
            step.failed_at = Some(now);
            step.updated_at = now;
        }
        match self.store.update_workflow(workflow).await {
            Ok(committed) => *workflow = committed,
            Err(e) => error!(workflow_id = %workflow.id, error = %e, "failed to persist failed step"),
        }

        if let Err(e) = self
            .append_event(
                workflow.id,
                EventType::StepFailed,
                json!({
                    "step_id": step_id,
                    "step_index": idx,
                    "error": cause.to_string(),
                }),
            )
            .await
        {
            error!(workflow_id = %workflow.id, error = %e, "failed to record step failure event");
        }

        self.compensate(workflow, step_id).await;
    }

    /// Best-effort compensation hook. Dispatches the step's compensating
    /// action when one is declared and records the outcome; it never
    /// re-raises, so the original failure stays visible to the caller, and
    /// it never reverses persisted side effects on its own.
    pub(crate) async fn compensate(&self, workflow: &Workflow, step_id: StepId) {
        let Some(step) = workflow.step(step_id) else {
            return;
        };
        let Some(compensating) = step.compensating.clone() else {
            debug!(workflow_id = %workflow.id, step_idx = step.idx, "no compensation configured, skipping");
            return;
        };

        info!(workflow_id = %workflow.id, step_idx = step.idx, action = %compensating.action, "executing compensation");

        let mut compensation_step = step.clone();
        compensation_step.config.action = Some(compensating.action.clone());

        let (event_type, payload) = match self.actions.dispatch(workflow, &compensation_step).await
        {
            Ok(()) => (
                EventType::CompensationExecuted,
                json!({
                    "step_id": step_id,
                    "compensation": compensating,
                }),
            ),
            Err(e) => {
                error!(workflow_id = %workflow.id, step_idx = step.idx, error = %e, "compensation failed");
                (
                    EventType::CompensationFailed,
                    json!({
                        "step_id": step_id,
                        "error": e.to_string(),
                    }),
                )
            }
        };

        if let Err(e) = self.append_event(workflow.id, event_type, payload).await {
            error!(workflow_id = %workflow.id, error = %e, "failed to record compensation event");
        }
    }

    // ========== Helpers ==========

    pub(crate) async fn require_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        self.store
            .workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    pub(crate) async fn append_event(
        &self,
        workflow_id: WorkflowId,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.store
            .append_event(Event::new(workflow_id, event_type, payload))
            .await
    }

    async fn mark_step(
        &self,
        workflow: &mut Workflow,
        step_id: StepId,
        state: StepState,
    ) -> Result<()> {
        let now = Utc::now();
        if let Some(step) = workflow.step_mut(step_id) {
            step.state = state;
            step.updated_at = now;
        }
        *workflow = self.store.update_workflow(workflow).await?;
        Ok(())
    }

    pub(crate) async fn persist_derived_state(&self, workflow: &mut Workflow) -> Result<()> {
        let previous = workflow.state;
        let derived = workflow.derive_state();
        workflow.state = derived;
        *workflow = self.store.update_workflow(workflow).await?;

        if previous != derived {
            debug!(workflow_id = %workflow.id, from = ?previous, to = ?derived, "workflow state changed");
            self.append_event(
                workflow.id,
                EventType::WorkflowStateChanged,
                json!({ "from": previous, "to": derived }),
            )
            .await?;

            if derived == WorkflowState::Done {
                self.append_event(
                    workflow.id,
                    EventType::WorkflowCompleted,
                    json!({ "completed_at": workflow.updated_at }),
                )
                .await?;
                info!(workflow_id = %workflow.id, "workflow completed");
            }
        }
        Ok(())
    }
}

/// Validate the shape of definition steps before they are stored: at least
/// one step, HUMAN steps carry a channel, explicit indices match their
/// position.
pub fn validate_step_templates(steps: &[StepTemplate]) -> Result<()> {
    if steps.is_empty() {
        return Err(EngineError::InvalidDefinition(
            "workflow must have at least one step".to_string(),
        ));
    }

    for (position, step) in steps.iter().enumerate() {
        if step.kind == StepKind::Human && step.config.channel.is_none() {
            return Err(EngineError::InvalidDefinition(format!(
                "step {position} (HUMAN) must have a channel in config"
            )));
        }
        if let Some(idx) = step.idx {
            if idx != position {
                return Err(EngineError::InvalidDefinition(format!(
                    "step index mismatch: expected {position}, got {idx}"
                )));
            }
        }
    }
    Ok(())
}

/// Mint an unguessable approval token
pub(crate) fn approval_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}
