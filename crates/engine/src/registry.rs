//! Registry of AUTO step action handlers

use crate::error::{EngineError, Result};
use crate::types::{Step, Workflow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Largest metadata amount `validate_data` accepts
pub const MAX_AMOUNT: f64 = 10_000.0;

/// A named action executed when an AUTO step runs
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, workflow: &Workflow, step: &Step) -> Result<()>;
}

/// Dispatch table mapping action names to handlers. Unknown or missing
/// action names fall through to a logged no-op.
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in actions
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("validate_data", Arc::new(ValidateData::default()));
        registry.register("process_payment", Arc::new(ProcessPayment));
        registry.register("send_notification", Arc::new(SendNotification));
        registry.register("spell_check", Arc::new(SpellCheck));
        registry.register("publish_content", Arc::new(PublishContent));
        registry
    }

    /// Register a handler under an action name
    pub fn register(&mut self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action.into(), handler);
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Run the step's configured action, or the default no-op when the
    /// action is absent or unregistered
    pub async fn dispatch(&self, workflow: &Workflow, step: &Step) -> Result<()> {
        match step.config.action.as_deref() {
            Some(action) => match self.handlers.get(action) {
                Some(handler) => handler.run(workflow, step).await,
                None => {
                    debug!(action, step_idx = step.idx, "no handler registered, running default no-op");
                    Ok(())
                }
            },
            None => {
                debug!(step_idx = step.idx, "auto step has no action, running default no-op");
                Ok(())
            }
        }
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Example business-rule gate: caps the metadata amount and requires a
/// description
pub struct ValidateData {
    max_amount: f64,
}

impl ValidateData {
    pub fn new(max_amount: f64) -> Self {
        Self { max_amount }
    }
}

impl Default for ValidateData {
    fn default() -> Self {
        Self::new(MAX_AMOUNT)
    }
}

#[async_trait]
impl ActionHandler for ValidateData {
    async fn run(&self, workflow: &Workflow, _step: &Step) -> Result<()> {
        let amount = workflow.metadata.get("amount").and_then(|v| v.as_f64());
        if let Some(amount) = amount {
            if amount > self.max_amount {
                return Err(EngineError::ValidationFailed(format!(
                    "amount {amount} exceeds the maximum limit of {}",
                    self.max_amount
                )));
            }
        }

        let has_description = workflow
            .metadata
            .get("description")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        if !has_description {
            return Err(EngineError::ValidationFailed(
                "description is required".to_string(),
            ));
        }

        debug!(workflow_id = %workflow.id, ?amount, "data validation passed");
        Ok(())
    }
}

/// Simulated payment capture against the metadata amount
pub struct ProcessPayment;

#[async_trait]
impl ActionHandler for ProcessPayment {
    async fn run(&self, workflow: &Workflow, _step: &Step) -> Result<()> {
        let amount = workflow.metadata.get("amount").and_then(|v| v.as_f64());
        info!(workflow_id = %workflow.id, ?amount, "processing payment");
        Ok(())
    }
}

/// Emits the configured message through the log
pub struct SendNotification;

#[async_trait]
impl ActionHandler for SendNotification {
    async fn run(&self, workflow: &Workflow, step: &Step) -> Result<()> {
        let message = step.config.message.as_deref().unwrap_or("(no message)");
        info!(workflow_id = %workflow.id, message, "sending notification");
        Ok(())
    }
}

pub struct SpellCheck;

#[async_trait]
impl ActionHandler for SpellCheck {
    async fn run(&self, workflow: &Workflow, _step: &Step) -> Result<()> {
        debug!(workflow_id = %workflow.id, "running spell check on content");
        Ok(())
    }
}

pub struct PublishContent;

#[async_trait]
impl ActionHandler for PublishContent {
    async fn run(&self, workflow: &Workflow, _step: &Step) -> Result<()> {
        info!(workflow_id = %workflow.id, "publishing content");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        StepConfig, StepKind, StepTemplate, WorkflowId, WorkflowState,
    };
    use chrono::Utc;

    fn workflow_with_metadata(metadata: serde_json::Value) -> Workflow {
        let id = WorkflowId::new();
        let now = Utc::now();
        Workflow {
            id,
            workflow_type: "expense".to_string(),
            state: WorkflowState::Pending,
            metadata,
            current_step_index: 0,
            steps: vec![crate::types::Step::from_template(
                id,
                0,
                &StepTemplate {
                    idx: Some(0),
                    kind: StepKind::Auto,
                    config: StepConfig {
                        action: Some("validate_data".to_string()),
                        ..Default::default()
                    },
                    compensating: None,
                },
            )],
            approvals: Vec::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    #[tokio::test]
    async fn validate_data_rejects_amounts_over_the_ceiling() {
        let registry = ActionRegistry::with_builtins();
        let workflow = workflow_with_metadata(serde_json::json!({
            "amount": 15000,
            "description": "team offsite"
        }));
        let err = registry
            .dispatch(&workflow, &workflow.steps[0])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn validate_data_requires_a_description() {
        let registry = ActionRegistry::with_builtins();
        let workflow = workflow_with_metadata(serde_json::json!({ "amount": 50 }));
        let err = registry
            .dispatch(&workflow, &workflow.steps[0])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn validate_data_accepts_well_formed_metadata() {
        let registry = ActionRegistry::with_builtins();
        let workflow = workflow_with_metadata(serde_json::json!({
            "amount": 120.5,
            "description": "keyboard"
        }));
        registry
            .dispatch(&workflow, &workflow.steps[0])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_action_is_a_no_op() {
        let registry = ActionRegistry::with_builtins();
        let mut workflow = workflow_with_metadata(serde_json::json!({}));
        workflow.steps[0].config.action = Some("archive_everything".to_string());
        registry
            .dispatch(&workflow, &workflow.steps[0])
            .await
            .unwrap();
    }
}
