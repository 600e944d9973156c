//! Replay, rollback and manual execution of individual steps
//!
//! A single entry point decides between the two recovery semantics: a step
//! behind the workflow's cursor is replayed (reset, downstream rolled back,
//! cursor rewound), a step at or ahead of the cursor is simply executed.

use crate::engine::WorkflowEngine;
use crate::error::{EngineError, Result};
use crate::types::{
    ApprovalStatus, EventType, StepId, StepKind, StepReplay, StepState, Workflow, WorkflowId,
    WorkflowState,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Operator-facing recovery surface over the workflow engine
#[derive(Clone)]
pub struct StepManager {
    engine: Arc<WorkflowEngine>,
}

impl StepManager {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    /// Replay a step that already ran, or execute one that has not been
    /// reached yet, depending on where it sits relative to the cursor
    pub async fn execute_or_replay_step(
        &self,
        workflow_id: WorkflowId,
        step_id: StepId,
        reason: Option<String>,
        actor: &str,
    ) -> Result<Workflow> {
        let workflow = self.engine.require_workflow(workflow_id).await?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;

        if step.idx < workflow.current_step_index {
            info!(%workflow_id, step_idx = step.idx, "step is behind the cursor, replaying");
            self.replay_step(workflow_id, step_id, reason, actor).await
        } else {
            info!(%workflow_id, step_idx = step.idx, "step is at or ahead of the cursor, executing");
            self.execute_step_manually(workflow_id, step_id, reason, actor)
                .await
        }
    }

    /// Re-run a finished step: reset it, roll every downstream step back to
    /// PENDING, expire outstanding approvals from the target onwards, rewind
    /// the cursor and resume. The whole reset commits as one aggregate
    /// write; execution resumes outside it.
    pub async fn replay_step(
        &self,
        workflow_id: WorkflowId,
        step_id: StepId,
        reason: Option<String>,
        actor: &str,
    ) -> Result<Workflow> {
        let mut workflow = self.engine.require_workflow(workflow_id).await?;
        let target = workflow
            .step(step_id)
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;
        if !target.can_replay {
            return Err(EngineError::StepNotReplayable(step_id.to_string()));
        }
        let target_idx = target.idx;
        let now = Utc::now();

        if let Some(step) = workflow.step_mut(step_id) {
            step.state = StepState::Ready;
            step.failed_at = None;
            step.replay_count += 1;
            step.updated_at = now;
        }
        workflow.expire_pending_approvals(step_id, now);

        let downstream: Vec<StepId> = workflow
            .steps
            .iter()
            .filter(|s| s.idx > target_idx)
            .map(|s| s.id)
            .collect();
        for downstream_id in &downstream {
            if let Some(step) = workflow.step_mut(*downstream_id) {
                step.state = StepState::Pending;
                step.failed_at = None;
                step.executed_at = None;
                step.updated_at = now;
            }
        }
        for downstream_id in downstream {
            workflow.expire_pending_approvals(downstream_id, now);
        }

        workflow.current_step_index = target_idx;
        workflow.state = WorkflowState::Running;
        self.engine.store().update_workflow(&workflow).await?;

        self.engine
            .store()
            .append_replay(StepReplay::new(workflow_id, step_id, reason.clone(), actor))
            .await?;
        self.engine
            .append_event(
                workflow_id,
                EventType::StepReplayInitiated,
                json!({
                    "step_id": step_id,
                    "step_index": target_idx,
                    "reason": reason,
                    "replayed_by": actor,
                }),
            )
            .await?;

        info!(%workflow_id, step_idx = target_idx, actor, "step replay initiated");

        self.engine.execute_from(workflow_id, target_idx).await
    }

    /// Force-run a step at or ahead of the cursor without touching
    /// downstream state
    pub async fn execute_step_manually(
        &self,
        workflow_id: WorkflowId,
        step_id: StepId,
        reason: Option<String>,
        actor: &str,
    ) -> Result<Workflow> {
        let mut workflow = self.engine.require_workflow(workflow_id).await?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?
            .clone();
        if !step.can_execute {
            return Err(EngineError::StepExecutionDisabled(step_id.to_string()));
        }

        // A human step may only be forced once a decision has landed
        if step.kind == StepKind::Human {
            let has_approved = workflow
                .approvals
                .iter()
                .any(|a| a.step_id == step_id && a.status == ApprovalStatus::Approved);
            if !has_approved {
                return Err(EngineError::ApprovalPending(step_id.to_string()));
            }
        }

        let now = Utc::now();
        if let Some(step) = workflow.step_mut(step_id) {
            step.state = StepState::Ready;
            step.executed_at = Some(now);
            step.failed_at = None;
            step.updated_at = now;
        }
        self.engine.store().update_workflow(&workflow).await?;

        self.engine
            .append_event(
                workflow_id,
                EventType::StepManualExecution,
                json!({
                    "step_id": step_id,
                    "step_index": step.idx,
                    "reason": reason,
                    "executed_by": actor,
                }),
            )
            .await?;

        self.engine.execute_from(workflow_id, step.idx).await
    }

    /// Reset a failed step back to READY and resume the workflow
    pub async fn retry_step(&self, workflow_id: WorkflowId, step_id: StepId) -> Result<Workflow> {
        let mut workflow = self.engine.require_workflow(workflow_id).await?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;
        if step.state != StepState::Failed {
            return Err(EngineError::StepNotRetryable(step_id.to_string()));
        }
        let step_idx = step.idx;
        let now = Utc::now();

        if let Some(step) = workflow.step_mut(step_id) {
            step.state = StepState::Ready;
            step.failed_at = None;
            step.updated_at = now;
        }
        self.engine.store().update_workflow(&workflow).await?;

        self.engine
            .append_event(
                workflow_id,
                EventType::StepRetried,
                json!({ "step_id": step_id, "step_index": step_idx }),
            )
            .await?;

        info!(%workflow_id, step_idx, "retrying failed step");
        self.engine.execute_workflow(workflow_id).await
    }

    /// Restart a workflow from the beginning: every step back to READY,
    /// outstanding approvals expired, cursor rewound
    pub async fn restart_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        let mut workflow = self.engine.require_workflow(workflow_id).await?;
        let now = Utc::now();

        let step_ids: Vec<StepId> = workflow.steps.iter().map(|s| s.id).collect();
        for step_id in &step_ids {
            if let Some(step) = workflow.step_mut(*step_id) {
                step.state = StepState::Ready;
                step.failed_at = None;
                step.executed_at = None;
                step.updated_at = now;
            }
        }
        for step_id in step_ids {
            workflow.expire_pending_approvals(step_id, now);
        }
        workflow.current_step_index = 0;
        workflow.state = WorkflowState::Running;
        self.engine.store().update_workflow(&workflow).await?;

        self.engine
            .append_event(
                workflow_id,
                EventType::WorkflowRestarted,
                json!({ "restarted_at": now }),
            )
            .await?;

        info!(%workflow_id, "workflow restarted");
        self.engine.execute_workflow(workflow_id).await
    }
}
