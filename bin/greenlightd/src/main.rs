use greenlight_engine::{
    ActionRegistry, ApprovalChannel, ApprovalSettlement, Decision, ExpirySweeper, JobOptions,
    JobQueue, LogNotifier, MemoryStore, NotificationFanout, NotificationService, QueueWorker,
    SettlementHandler, StepConfig, StepKind, StepTemplate, WorkflowEngine, WorkflowStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
    let approval_queue = JobQueue::with_options(
        "approval-queue",
        JobOptions {
            attempts: 3,
            backoff: Duration::from_secs(1),
        },
    );
    let notification_queue = JobQueue::with_options(
        "notification-queue",
        JobOptions {
            attempts: 3,
            backoff: Duration::from_secs(1),
        },
    );

    let notifier = Arc::new(LogNotifier::default());
    let engine = Arc::new(WorkflowEngine::new(
        store.clone(),
        Arc::new(ActionRegistry::with_builtins()),
        NotificationService::new(notification_queue.clone()),
        approval_queue.clone(),
    ));
    let settlement = ApprovalSettlement::new(engine.clone());
    let sweeper = ExpirySweeper::new(engine.clone(), notifier.clone());

    // Queue consumers: decisions and notification fan-out
    let mut approval_worker = QueueWorker::new(
        approval_queue.clone(),
        Arc::new(SettlementHandler::new(settlement)),
    )
    .with_concurrency(5);
    let mut notification_worker = QueueWorker::new(
        notification_queue.clone(),
        Arc::new(NotificationFanout::new(store, notifier)),
    )
    .with_concurrency(10);
    let approval_handle = approval_worker.start();
    let notification_handle = notification_worker.start();

    let (sweeper_shutdown, sweeper_rx) = tokio::sync::watch::channel(false);
    let sweeper_handle = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.run(Duration::from_secs(60), sweeper_rx).await })
    };

    info!("workers started, seeding demo definition");

    engine
        .create_definition(
            "expense-approval",
            vec![
                StepTemplate {
                    idx: None,
                    kind: StepKind::Auto,
                    config: StepConfig {
                        action: Some("validate_data".to_string()),
                        ..Default::default()
                    },
                    compensating: None,
                },
                StepTemplate {
                    idx: None,
                    kind: StepKind::Human,
                    config: StepConfig {
                        channel: Some(ApprovalChannel::Email),
                        title: Some("Expense sign-off".to_string()),
                        assignee: Some("finance@example.com".to_string()),
                        ..Default::default()
                    },
                    compensating: None,
                },
                StepTemplate {
                    idx: None,
                    kind: StepKind::Auto,
                    config: StepConfig {
                        action: Some("process_payment".to_string()),
                        ..Default::default()
                    },
                    compensating: None,
                },
            ],
            Some("Expense reimbursement with a finance sign-off".to_string()),
        )
        .await?;

    let workflow = engine
        .create_workflow(
            "expense-approval",
            serde_json::json!({
                "employee": "sam",
                "amount": 420.0,
                "description": "conference travel",
            }),
        )
        .await?;
    let workflow = engine.execute_workflow(workflow.id).await?;
    info!(workflow_id = %workflow.id, state = ?workflow.state, "workflow suspended on approval");

    // Simulate the human decision arriving through the API layer
    let token = workflow.approvals[0].token.clone();
    engine.submit_decision(&token, Decision::Approved, Some("approved for travel".to_string()), "finance");

    tokio::time::sleep(Duration::from_secs(1)).await;

    let workflow = engine.workflow(workflow.id).await?;
    info!(workflow_id = %workflow.id, state = ?workflow.state, cursor = workflow.current_step_index, "final state");
    for event in engine.events(workflow.id).await? {
        info!(event = ?event.event_type, payload = %event.payload, "audit");
    }

    let _ = sweeper_shutdown.send(true);
    approval_worker.shutdown();
    notification_worker.shutdown();
    let _ = tokio::try_join!(approval_handle, notification_handle, sweeper_handle);

    Ok(())
}
