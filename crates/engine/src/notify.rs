//! Notification collaborator contract and queue-backed channel fan-out
//!
//! The engine only decides that a notification is due and for whom; the
//! `Notifier` implementation owns delivery. Requests are queued and fanned
//! out to every configured channel independently, so one channel failing
//! never blocks the others and nothing propagates into the driver.

use crate::error::{EngineError, Result};
use crate::queue::{Job, JobQueue};
use crate::store::WorkflowStore;
use crate::types::{Approval, ApprovalChannel, ApprovalId, Step, StepId, Workflow, WorkflowId};
use crate::worker::JobHandler;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outbound delivery contract. Fire-and-forget from the engine's point of
/// view; implementations may talk to mail/Slack/SMS providers.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn approval_requested(
        &self,
        approval: &Approval,
        workflow: &Workflow,
        step: &Step,
        channel: ApprovalChannel,
    ) -> Result<()>;

    async fn approval_expired(&self, approval: &Approval) -> Result<()>;
}

/// Reference notifier that logs the approval link instead of delivering it
pub struct LogNotifier {
    base_url: String,
}

impl LogNotifier {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new("http://localhost:3000")
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn approval_requested(
        &self,
        approval: &Approval,
        workflow: &Workflow,
        step: &Step,
        channel: ApprovalChannel,
    ) -> Result<()> {
        let title = step.config.title.as_deref().unwrap_or("Workflow Approval");
        info!(
            workflow_id = %workflow.id,
            step_idx = step.idx,
            %channel,
            title,
            expires_at = %approval.expires_at,
            url = %format!("{}/approve/{}", self.base_url, approval.token),
            "approval requested"
        );
        Ok(())
    }

    async fn approval_expired(&self, approval: &Approval) -> Result<()> {
        info!(
            workflow_id = %approval.workflow_id,
            approval_id = %approval.id,
            "approval expired, awaiting resend"
        );
        Ok(())
    }
}

/// Queues approval-request notifications for asynchronous fan-out
#[derive(Clone)]
pub struct NotificationService {
    queue: JobQueue,
}

impl NotificationService {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Enqueue one fan-out job per approval occurrence. The token changes
    /// on every resend/replay, so it is the natural dedup key for one
    /// request occurrence.
    pub fn queue_approval_request(
        &self,
        workflow_id: WorkflowId,
        step_id: StepId,
        approval_id: ApprovalId,
        token: &str,
    ) -> bool {
        let queued = self.queue.add(
            format!("notification-{token}"),
            serde_json::json!({
                "workflow_id": workflow_id,
                "step_id": step_id,
                "approval_id": approval_id,
            }),
        );
        if queued {
            debug!(%approval_id, "notification queued");
        }
        queued
    }
}

/// Channels a step's approval request should fan out to: boolean channel
/// flags from the config extension map, falling back to the step's primary
/// channel
pub fn channels_for_step(step: &Step) -> Vec<ApprovalChannel> {
    let mut channels = Vec::new();
    for (key, channel) in [
        ("email", ApprovalChannel::Email),
        ("slack", ApprovalChannel::Slack),
        ("sms", ApprovalChannel::Sms),
        ("teams", ApprovalChannel::Teams),
        ("web", ApprovalChannel::Web),
    ] {
        if step
            .config
            .extra
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            channels.push(channel);
        }
    }

    if channels.is_empty() {
        channels.push(step.config.channel.unwrap_or(ApprovalChannel::Email));
    }
    channels
}

/// Consumer side of the notification queue: resolves the approval and
/// delivers to every configured channel independently
pub struct NotificationFanout {
    store: Arc<dyn WorkflowStore>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationFanout {
    pub fn new(store: Arc<dyn WorkflowStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }
}

#[async_trait]
impl JobHandler for NotificationFanout {
    async fn process(&self, job: &Job) -> Result<serde_json::Value> {
        let workflow_id: WorkflowId = serde_json::from_value(job.payload["workflow_id"].clone())?;
        let step_id: StepId = serde_json::from_value(job.payload["step_id"].clone())?;
        let approval_id: ApprovalId = serde_json::from_value(job.payload["approval_id"].clone())?;

        let workflow = self
            .store
            .workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;
        let approval = workflow
            .approval(approval_id)
            .ok_or_else(|| EngineError::ApprovalNotFound(approval_id.to_string()))?;

        let channels = channels_for_step(step);
        debug!(%approval_id, ?channels, "fanning out approval notification");

        let sends = channels.iter().map(|channel| {
            self.notifier
                .approval_requested(approval, &workflow, step, *channel)
        });
        let results = join_all(sends).await;

        let mut delivered = 0usize;
        for (channel, result) in channels.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    // Channel failures are isolated: logged, never re-raised
                    warn!(%approval_id, %channel, error = %e, "channel delivery failed");
                }
            }
        }

        Ok(serde_json::json!({
            "approval_id": approval_id,
            "channels": channels.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            "delivered": delivered,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StepConfig, StepKind, StepTemplate};

    fn human_step(config: StepConfig) -> Step {
        Step::from_template(
            WorkflowId::new(),
            0,
            &StepTemplate {
                idx: Some(0),
                kind: StepKind::Human,
                config,
                compensating: None,
            },
        )
    }

    #[test]
    fn channel_flags_take_precedence() {
        let mut extra = serde_json::Map::new();
        extra.insert("email".to_string(), serde_json::json!(true));
        extra.insert("slack".to_string(), serde_json::json!(true));
        let step = human_step(StepConfig {
            channel: Some(ApprovalChannel::Web),
            extra,
            ..Default::default()
        });
        assert_eq!(
            channels_for_step(&step),
            vec![ApprovalChannel::Email, ApprovalChannel::Slack]
        );
    }

    #[test]
    fn falls_back_to_the_primary_channel() {
        let step = human_step(StepConfig {
            channel: Some(ApprovalChannel::Slack),
            ..Default::default()
        });
        assert_eq!(channels_for_step(&step), vec![ApprovalChannel::Slack]);
    }

    #[test]
    fn defaults_to_email_without_any_configuration() {
        let step = human_step(StepConfig::default());
        assert_eq!(channels_for_step(&step), vec![ApprovalChannel::Email]);
    }
}
