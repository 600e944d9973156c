use greenlight_engine::{
    ActionRegistry, ApprovalChannel, CompensationConfig, EngineError, EventType, JobQueue,
    MemoryStore, NotificationFanout, NotificationService, Notifier, StepConfig, StepKind,
    StepState, StepTemplate, WorkflowEngine, WorkflowState, WorkflowStore,
};
use greenlight_engine::worker::JobHandler;
use std::sync::Arc;

fn engine() -> Arc<WorkflowEngine> {
    let _ = tracing_subscriber::fmt::try_init();
    let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
    Arc::new(WorkflowEngine::new(
        store,
        Arc::new(ActionRegistry::with_builtins()),
        NotificationService::new(JobQueue::new("notification-queue")),
        JobQueue::new("approval-queue"),
    ))
}

fn auto(action: &str) -> StepTemplate {
    StepTemplate {
        idx: None,
        kind: StepKind::Auto,
        config: StepConfig {
            action: Some(action.to_string()),
            ..Default::default()
        },
        compensating: None,
    }
}

fn human(channel: ApprovalChannel) -> StepTemplate {
    StepTemplate {
        idx: None,
        kind: StepKind::Human,
        config: StepConfig {
            channel: Some(channel),
            ..Default::default()
        },
        compensating: None,
    }
}

#[tokio::test]
async fn all_auto_workflow_completes_in_one_execution() {
    let engine = engine();
    engine
        .create_definition(
            "expense",
            vec![
                auto("validate_data"),
                auto("process_payment"),
                auto("send_notification"),
            ],
            Some("expense approval".to_string()),
        )
        .await
        .unwrap();

    let workflow = engine
        .create_workflow(
            "expense",
            serde_json::json!({ "amount": 250, "description": "standing desk" }),
        )
        .await
        .unwrap();
    assert_eq!(workflow.state, WorkflowState::Pending);

    let workflow = engine.execute_workflow(workflow.id).await.unwrap();
    assert_eq!(workflow.state, WorkflowState::Done);
    assert_eq!(workflow.current_step_index, 3);
    assert!(workflow.steps.iter().all(|s| s.state == StepState::Done));
    assert!(workflow.steps.iter().all(|s| s.executed_at.is_some()));

    let events = engine.events(workflow.id).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert!(types.contains(&EventType::WorkflowCreated));
    assert!(types.contains(&EventType::WorkflowCompleted));
}

#[tokio::test]
async fn human_step_suspends_the_workflow() {
    let engine = engine();
    engine
        .create_definition(
            "publish",
            vec![
                auto("spell_check"),
                human(ApprovalChannel::Slack),
                auto("publish_content"),
            ],
            None,
        )
        .await
        .unwrap();

    let workflow = engine
        .create_workflow("publish", serde_json::json!({ "title": "launch post" }))
        .await
        .unwrap();
    let workflow = engine.execute_workflow(workflow.id).await.unwrap();

    assert_eq!(workflow.state, WorkflowState::WaitingApproval);
    assert_eq!(workflow.steps[0].state, StepState::Done);
    assert_eq!(workflow.steps[1].state, StepState::Waiting);
    // The step after the suspension point is untouched
    assert_eq!(workflow.steps[2].state, StepState::Ready);
    assert_eq!(workflow.current_step_index, 1);

    assert_eq!(workflow.approvals.len(), 1);
    let approval = &workflow.approvals[0];
    assert_eq!(approval.channel, ApprovalChannel::Slack);
    assert_eq!(approval.token.len(), 32);
    assert!(approval.expires_at > workflow.created_at);
}

#[tokio::test]
async fn validation_failure_marks_step_and_workflow_failed() {
    let engine = engine();
    engine
        .create_definition(
            "expense",
            vec![auto("validate_data"), auto("process_payment")],
            None,
        )
        .await
        .unwrap();

    let workflow = engine
        .create_workflow(
            "expense",
            serde_json::json!({ "amount": 15000, "description": "gold keyboard" }),
        )
        .await
        .unwrap();

    let err = engine.execute_workflow(workflow.id).await.unwrap_err();
    assert!(matches!(err, EngineError::ValidationFailed(_)));

    // Persisted state is consistent even though the caller saw an error
    let workflow = engine.workflow(workflow.id).await.unwrap();
    assert_eq!(workflow.state, WorkflowState::Failed);
    assert_eq!(workflow.steps[0].state, StepState::Failed);
    assert!(workflow.steps[0].failed_at.is_some());
    // The downstream step never ran
    assert_eq!(workflow.steps[1].state, StepState::Ready);
    assert!(workflow.steps[1].executed_at.is_none());

    let events = engine.events(workflow.id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::StepFailed));
}

#[tokio::test]
async fn failed_step_triggers_compensation() {
    let engine = engine();
    let mut step = auto("validate_data");
    step.compensating = Some(CompensationConfig {
        action: "send_notification".to_string(),
        parameters: None,
    });
    engine
        .create_definition("expense", vec![step], None)
        .await
        .unwrap();

    let workflow = engine
        .create_workflow("expense", serde_json::json!({ "amount": 99999 }))
        .await
        .unwrap();
    engine.execute_workflow(workflow.id).await.unwrap_err();

    let events = engine.events(workflow.id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::CompensationExecuted));
}

#[tokio::test]
async fn definitions_resolve_to_the_highest_active_version() {
    let engine = engine();
    engine
        .create_definition("expense", vec![auto("validate_data")], None)
        .await
        .unwrap();
    let v2 = engine
        .create_definition(
            "expense",
            vec![auto("validate_data"), auto("process_payment")],
            None,
        )
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    let workflow = engine
        .create_workflow(
            "expense",
            serde_json::json!({ "amount": 10, "description": "pens" }),
        )
        .await
        .unwrap();
    assert_eq!(workflow.steps.len(), 2);

    engine.deactivate_definition("expense").await.unwrap();
    let err = engine
        .create_workflow("expense", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DefinitionNotFound(_)));
}

#[tokio::test]
async fn definition_shape_is_validated_at_creation() {
    let engine = engine();

    let err = engine
        .create_definition("empty", vec![], None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDefinition(_)));

    let mut channelless = human(ApprovalChannel::Web);
    channelless.config.channel = None;
    let err = engine
        .create_definition("bad-human", vec![channelless], None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDefinition(_)));

    let mut shifted = auto("spell_check");
    shifted.idx = Some(3);
    let err = engine
        .create_definition("bad-idx", vec![shifted], None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidDefinition(_)));
}

#[tokio::test]
async fn cancelling_a_workflow_is_recorded() {
    let engine = engine();
    engine
        .create_definition("expense", vec![auto("validate_data")], None)
        .await
        .unwrap();
    let workflow = engine
        .create_workflow("expense", serde_json::json!({}))
        .await
        .unwrap();

    let workflow = engine
        .cancel_workflow(workflow.id, Some("duplicate request".to_string()))
        .await
        .unwrap();
    assert_eq!(workflow.state, WorkflowState::Rejected);

    let events = engine.events(workflow.id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::WorkflowCancelled));
}

#[tokio::test]
async fn deleting_a_workflow_cascades() {
    let engine = engine();
    engine
        .create_definition("expense", vec![auto("validate_data")], None)
        .await
        .unwrap();
    let workflow = engine
        .create_workflow(
            "expense",
            serde_json::json!({ "amount": 5, "description": "tape" }),
        )
        .await
        .unwrap();
    engine.execute_workflow(workflow.id).await.unwrap();

    engine.delete_workflow(workflow.id).await.unwrap();
    assert!(matches!(
        engine.workflow(workflow.id).await.unwrap_err(),
        EngineError::WorkflowNotFound(_)
    ));
    assert!(engine.events(workflow.id).await.unwrap().is_empty());
}

struct FlakyChannelNotifier;

#[async_trait::async_trait]
impl Notifier for FlakyChannelNotifier {
    async fn approval_requested(
        &self,
        _approval: &greenlight_engine::Approval,
        _workflow: &greenlight_engine::Workflow,
        _step: &greenlight_engine::Step,
        channel: ApprovalChannel,
    ) -> greenlight_engine::Result<()> {
        if channel == ApprovalChannel::Slack {
            return Err(EngineError::Storage("slack webhook unreachable".to_string()));
        }
        Ok(())
    }

    async fn approval_expired(
        &self,
        _approval: &greenlight_engine::Approval,
    ) -> greenlight_engine::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn channel_failures_are_isolated_in_the_fan_out() {
    let _ = tracing_subscriber::fmt::try_init();
    let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
    let notification_queue = JobQueue::new("notification-queue");
    let engine = Arc::new(WorkflowEngine::new(
        store.clone(),
        Arc::new(ActionRegistry::with_builtins()),
        NotificationService::new(notification_queue.clone()),
        JobQueue::new("approval-queue"),
    ));

    let mut step = human(ApprovalChannel::Web);
    step.config.extra.insert("email".to_string(), serde_json::json!(true));
    step.config.extra.insert("slack".to_string(), serde_json::json!(true));
    engine
        .create_definition("signoff", vec![step], None)
        .await
        .unwrap();
    let workflow = engine
        .create_workflow("signoff", serde_json::json!({}))
        .await
        .unwrap();
    engine.execute_workflow(workflow.id).await.unwrap();

    let job = notification_queue.take().expect("fan-out job queued");
    let fanout = NotificationFanout::new(store, Arc::new(FlakyChannelNotifier));
    let result = fanout.process(&job).await.unwrap();

    // One channel failed, the other delivered; the job itself succeeds
    assert_eq!(result["delivered"], 1);
    assert_eq!(result["channels"].as_array().unwrap().len(), 2);
}
