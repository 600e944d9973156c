//! Approval settlement: applying a queued human decision
//!
//! Consumes decision jobs produced by `WorkflowEngine::submit_decision`.
//! Settlement is idempotent per token: redelivery of an already-applied
//! decision is a success no-op, which is what makes the at-least-once
//! queue safe to retry.

use crate::engine::WorkflowEngine;
use crate::error::{EngineError, Result};
use crate::queue::Job;
use crate::types::{ApprovalStatus, Decision, EventType, StepState, WorkflowId};
use crate::worker::JobHandler;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of settling one decision
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// The decision was applied and the workflow resumed or halted
    Applied {
        workflow_id: WorkflowId,
        decision: Decision,
    },
    /// The approval had already left the pending state; nothing was mutated
    AlreadyProcessed { workflow_id: WorkflowId },
}

/// Applies decisions to approvals and drives the owning workflow forward
#[derive(Clone)]
pub struct ApprovalSettlement {
    engine: Arc<WorkflowEngine>,
}

impl ApprovalSettlement {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    /// Settle a decision against the approval identified by `token`.
    ///
    /// An expired token is refused with a distinct, recoverable signal
    /// (the approval can be resent); any other non-pending status is an
    /// idempotent no-op.
    pub async fn settle(
        &self,
        token: &str,
        decision: Decision,
        feedback: Option<String>,
        actor: &str,
    ) -> Result<SettleOutcome> {
        let store = self.engine.store();
        let workflow_id = store
            .workflow_by_token(token)
            .await?
            .ok_or_else(|| EngineError::ApprovalNotFound(token.to_string()))?;

        let mut workflow = self.engine.require_workflow(workflow_id).await?;
        let approval = workflow
            .approval_by_token(token)
            .ok_or_else(|| EngineError::ApprovalNotFound(token.to_string()))?
            .clone();

        match approval.status {
            ApprovalStatus::Pending => {}
            ApprovalStatus::Expired => {
                return Err(EngineError::ApprovalExpired(token.to_string()));
            }
            _ => {
                info!(%workflow_id, token, "approval already processed, skipping");
                return Ok(SettleOutcome::AlreadyProcessed { workflow_id });
            }
        }

        let now = Utc::now();
        let step_id = approval.step_id;
        if let Some(approval) = workflow.approval_mut(approval.id) {
            approval.status = decision.as_approval_status();
            approval.feedback = feedback.clone();
            approval.decided_by = Some(actor.to_string());
            approval.updated_at = now;
        }
        if let Some(step) = workflow.step_mut(step_id) {
            step.state = StepState::Done;
            step.executed_at = Some(now);
            step.updated_at = now;
        }
        if let Some(idx) = workflow.step(step_id).map(|s| s.idx) {
            workflow.current_step_index = idx + 1;
        }
        self.engine.store().update_workflow(&workflow).await?;

        let event_type = match decision {
            Decision::Approved => EventType::ApprovalApproved,
            Decision::Rejected => EventType::ApprovalRejected,
        };
        self.engine
            .append_event(
                workflow_id,
                event_type,
                json!({
                    "approval_id": approval.id,
                    "step_id": step_id,
                    "decision": decision,
                    "feedback": feedback,
                    "actor": actor,
                }),
            )
            .await?;

        info!(%workflow_id, %decision, "approval processed");

        match decision {
            Decision::Approved => {
                // Resume from the next unfinished step
                self.engine.execute_workflow(workflow_id).await?;
            }
            Decision::Rejected => {
                // Rejection is terminal by derivation precedence; only the
                // aggregate state needs recomputing
                self.engine.update_workflow_state(workflow_id).await?;
            }
        }

        Ok(SettleOutcome::Applied {
            workflow_id,
            decision,
        })
    }
}

/// Queue consumer wrapping `ApprovalSettlement`
pub struct SettlementHandler {
    settlement: ApprovalSettlement,
}

impl SettlementHandler {
    pub fn new(settlement: ApprovalSettlement) -> Self {
        Self { settlement }
    }
}

#[async_trait]
impl JobHandler for SettlementHandler {
    async fn process(&self, job: &Job) -> Result<serde_json::Value> {
        let token = job.payload["token"]
            .as_str()
            .ok_or_else(|| EngineError::Serialization("decision job missing token".to_string()))?;
        let decision: Decision = serde_json::from_value(job.payload["decision"].clone())?;
        let feedback = job.payload["feedback"].as_str().map(str::to_string);
        let actor = job.payload["actor"].as_str().unwrap_or("unknown");

        match self.settlement.settle(token, decision, feedback, actor).await {
            Ok(SettleOutcome::Applied {
                workflow_id,
                decision,
            }) => Ok(json!({
                "success": true,
                "workflow_id": workflow_id,
                "decision": decision,
            })),
            Ok(SettleOutcome::AlreadyProcessed { workflow_id }) => Ok(json!({
                "skipped": true,
                "reason": "already_processed",
                "workflow_id": workflow_id,
            })),
            Err(e) => {
                warn!(token, error = %e, "settlement attempt failed");
                Err(e)
            }
        }
    }
}
