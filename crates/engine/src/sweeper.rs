//! Approval expiry sweeping and resending
//!
//! Expiry is observational: a swept approval becomes `expired` and its
//! step stays WAITING until an operator resends or replays it. Resumption
//! is always an explicit action.

use crate::engine::{approval_token, WorkflowEngine};
use crate::error::{EngineError, Result};
use crate::notify::Notifier;
use crate::types::{ApprovalId, ApprovalStatus, EventType, WorkflowId};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// New credentials handed back by a resend
#[derive(Debug, Clone)]
pub struct ResendReceipt {
    pub new_token: String,
    pub new_expiry: DateTime<Utc>,
}

/// Periodic or on-demand scan for approvals past their deadline
#[derive(Clone)]
pub struct ExpirySweeper {
    engine: Arc<WorkflowEngine>,
    notifier: Arc<dyn Notifier>,
}

impl ExpirySweeper {
    pub fn new(engine: Arc<WorkflowEngine>, notifier: Arc<dyn Notifier>) -> Self {
        Self { engine, notifier }
    }

    /// Expire every pending approval whose deadline has passed; returns
    /// how many were expired. Step and workflow state are deliberately
    /// left untouched.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let expired = self.engine.store().expired_pending_approvals(now).await?;
        info!(count = expired.len(), "found expired approvals");

        let mut swept = 0;
        for (workflow_id, approval_id) in expired {
            match self.expire_one(workflow_id, approval_id, now).await {
                Ok(true) => swept += 1,
                Ok(false) => {}
                Err(e) => {
                    // One stuck workflow must not stall the whole sweep
                    warn!(%workflow_id, %approval_id, error = %e, "failed to expire approval");
                }
            }
        }
        Ok(swept)
    }

    async fn expire_one(
        &self,
        workflow_id: WorkflowId,
        approval_id: ApprovalId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut workflow = self.engine.require_workflow(workflow_id).await?;
        let Some(approval) = workflow.approval(approval_id) else {
            return Ok(false);
        };
        // A settlement may have raced the scan; expiry only applies to
        // approvals still pending
        if approval.status != ApprovalStatus::Pending {
            return Ok(false);
        }
        let step_id = approval.step_id;

        if let Some(approval) = workflow.approval_mut(approval_id) {
            approval.status = ApprovalStatus::Expired;
            approval.updated_at = now;
        }
        workflow = self.engine.store().update_workflow(&workflow).await?;

        self.engine
            .append_event(
                workflow_id,
                EventType::ApprovalExpired,
                json!({ "approval_id": approval_id, "step_id": step_id }),
            )
            .await?;

        if let Some(approval) = workflow.approval(approval_id) {
            if let Err(e) = self.notifier.approval_expired(approval).await {
                warn!(%approval_id, error = %e, "expiry notification failed");
            }
        }

        info!(%workflow_id, %approval_id, "approval expired");
        Ok(true)
    }

    /// Mint a fresh token and deadline for an expired approval and
    /// re-deliver the request
    pub async fn resend_approval(&self, approval_id: ApprovalId) -> Result<ResendReceipt> {
        let workflow_id = self
            .engine
            .store()
            .workflow_by_approval(approval_id)
            .await?
            .ok_or_else(|| EngineError::ApprovalNotFound(approval_id.to_string()))?;
        let mut workflow = self.engine.require_workflow(workflow_id).await?;
        let approval = workflow
            .approval(approval_id)
            .ok_or_else(|| EngineError::ApprovalNotFound(approval_id.to_string()))?
            .clone();

        if approval.status != ApprovalStatus::Expired {
            return Err(EngineError::AlreadyProcessed(format!(
                "approval {approval_id} is {:?}, only expired approvals can be resent",
                approval.status
            )));
        }

        let now = Utc::now();
        let new_token = approval_token();
        let new_expiry = now + self.engine.approval_ttl();
        if let Some(approval) = workflow.approval_mut(approval_id) {
            approval.token = new_token.clone();
            approval.expires_at = new_expiry;
            approval.status = ApprovalStatus::Pending;
            approval.updated_at = now;
        }
        self.engine.store().update_workflow(&workflow).await?;

        self.engine.notifications().queue_approval_request(
            workflow_id,
            approval.step_id,
            approval_id,
            &new_token,
        );

        self.engine
            .append_event(
                workflow_id,
                EventType::ApprovalResent,
                json!({
                    "approval_id": approval_id,
                    "old_token": approval.token,
                    "new_token": new_token,
                }),
            )
            .await?;

        info!(%workflow_id, %approval_id, "approval resent with a new token");
        Ok(ResendReceipt {
            new_token,
            new_expiry,
        })
    }

    /// Run the sweeper on an interval until the shutdown signal flips
    pub async fn run(&self, every: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.sweep().await {
                        Ok(0) => {}
                        Ok(swept) => debug!(swept, "expiry sweep finished"),
                        Err(e) => warn!(error = %e, "expiry sweep failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("expiry sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
