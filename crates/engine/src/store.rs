//! Repository contract for engine state, with an in-memory reference store
//!
//! All engine transitions go through `WorkflowStore`. A workflow record is
//! one aggregate (instance + steps + approvals) committed atomically via
//! `update_workflow`, guarded by an optimistic revision stamp; events and
//! replay rows are append-only side records. A durable backend implements
//! the same contract against a transactional database.

use crate::error::{EngineError, Result};
use crate::types::{
    Approval, ApprovalId, ApprovalStatus, Event, StepId, StepReplay, Workflow, WorkflowDefinition,
    WorkflowId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Transactional persistence contract for workflows, definitions, events
/// and replay history
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Store a new definition version
    async fn put_definition(&self, definition: WorkflowDefinition) -> Result<()>;

    /// Highest active version for a definition name, if any
    async fn active_definition(&self, name: &str) -> Result<Option<WorkflowDefinition>>;

    /// Highest version (active or not) for a definition name
    async fn latest_version(&self, name: &str) -> Result<Option<u32>>;

    /// All stored definitions, every version
    async fn definitions(&self) -> Result<Vec<WorkflowDefinition>>;

    /// Deactivate every active version of a definition name; returns the
    /// number of versions deactivated
    async fn deactivate_definitions(&self, name: &str) -> Result<usize>;

    /// Insert a freshly created workflow aggregate
    async fn insert_workflow(&self, workflow: Workflow) -> Result<()>;

    /// Load a workflow aggregate
    async fn workflow(&self, id: WorkflowId) -> Result<Option<Workflow>>;

    /// Commit a mutated aggregate. Fails with `RevisionConflict` when the
    /// stored revision no longer matches the one the caller loaded; on
    /// success the revision is bumped and the committed copy returned.
    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow>;

    /// All workflow aggregates
    async fn workflows(&self) -> Result<Vec<Workflow>>;

    /// Delete a workflow and everything it owns (steps, approvals, events,
    /// replay rows)
    async fn delete_workflow(&self, id: WorkflowId) -> Result<()>;

    /// Resolve an approval token to its owning workflow
    async fn workflow_by_token(&self, token: &str) -> Result<Option<WorkflowId>>;

    /// Resolve an approval id to its owning workflow
    async fn workflow_by_approval(&self, approval_id: ApprovalId) -> Result<Option<WorkflowId>>;

    /// Pending approvals whose deadline has passed
    async fn expired_pending_approvals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(WorkflowId, ApprovalId)>>;

    /// Append an audit event
    async fn append_event(&self, event: Event) -> Result<()>;

    /// Events for a workflow, oldest first
    async fn events(&self, workflow_id: WorkflowId) -> Result<Vec<Event>>;

    /// Append a replay audit row
    async fn append_replay(&self, replay: StepReplay) -> Result<()>;

    /// Replay rows for a step, oldest first
    async fn replays(&self, step_id: StepId) -> Result<Vec<StepReplay>>;
}

#[derive(Default)]
struct StoreInner {
    definitions: Vec<WorkflowDefinition>,
    workflows: HashMap<WorkflowId, Workflow>,
    events: HashMap<WorkflowId, Vec<Event>>,
    replays: Vec<StepReplay>,
}

/// In-memory reference implementation of the repository contract
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_approval<'a>(
        inner: &'a StoreInner,
        matches: impl Fn(&Approval) -> bool,
    ) -> Option<(&'a Workflow, &'a Approval)> {
        inner.workflows.values().find_map(|workflow| {
            workflow
                .approvals
                .iter()
                .find(|a| matches(a))
                .map(|a| (workflow, a))
        })
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn put_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        self.inner.write().definitions.push(definition);
        Ok(())
    }

    async fn active_definition(&self, name: &str) -> Result<Option<WorkflowDefinition>> {
        let inner = self.inner.read();
        Ok(inner
            .definitions
            .iter()
            .filter(|d| d.name == name && d.is_active)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn latest_version(&self, name: &str) -> Result<Option<u32>> {
        let inner = self.inner.read();
        Ok(inner
            .definitions
            .iter()
            .filter(|d| d.name == name)
            .map(|d| d.version)
            .max())
    }

    async fn definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        Ok(self.inner.read().definitions.clone())
    }

    async fn deactivate_definitions(&self, name: &str) -> Result<usize> {
        let mut inner = self.inner.write();
        let mut count = 0;
        for definition in &mut inner.definitions {
            if definition.name == name && definition.is_active {
                definition.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn insert_workflow(&self, workflow: Workflow) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.workflows.contains_key(&workflow.id) {
            return Err(EngineError::Storage(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        inner.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn workflow(&self, id: WorkflowId) -> Result<Option<Workflow>> {
        Ok(self.inner.read().workflows.get(&id).cloned())
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow> {
        let mut inner = self.inner.write();
        let stored = inner
            .workflows
            .get_mut(&workflow.id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow.id.to_string()))?;

        if stored.revision != workflow.revision {
            return Err(EngineError::RevisionConflict(workflow.id.to_string()));
        }

        let mut committed = workflow.clone();
        committed.revision += 1;
        committed.updated_at = Utc::now();
        *stored = committed.clone();
        Ok(committed)
    }

    async fn workflows(&self) -> Result<Vec<Workflow>> {
        let mut all: Vec<Workflow> = self.inner.read().workflows.values().cloned().collect();
        all.sort_by_key(|w| w.created_at);
        Ok(all)
    }

    async fn delete_workflow(&self, id: WorkflowId) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .workflows
            .remove(&id)
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))?;
        inner.events.remove(&id);
        inner.replays.retain(|r| r.workflow_id != id);
        Ok(())
    }

    async fn workflow_by_token(&self, token: &str) -> Result<Option<WorkflowId>> {
        let inner = self.inner.read();
        Ok(Self::find_approval(&inner, |a| a.token == token).map(|(w, _)| w.id))
    }

    async fn workflow_by_approval(&self, approval_id: ApprovalId) -> Result<Option<WorkflowId>> {
        let inner = self.inner.read();
        Ok(Self::find_approval(&inner, |a| a.id == approval_id).map(|(w, _)| w.id))
    }

    async fn expired_pending_approvals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(WorkflowId, ApprovalId)>> {
        let inner = self.inner.read();
        let mut expired = Vec::new();
        for workflow in inner.workflows.values() {
            for approval in &workflow.approvals {
                if approval.status == ApprovalStatus::Pending && approval.expires_at < now {
                    expired.push((workflow.id, approval.id));
                }
            }
        }
        Ok(expired)
    }

    async fn append_event(&self, event: Event) -> Result<()> {
        self.inner
            .write()
            .events
            .entry(event.workflow_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn events(&self, workflow_id: WorkflowId) -> Result<Vec<Event>> {
        Ok(self
            .inner
            .read()
            .events
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_replay(&self, replay: StepReplay) -> Result<()> {
        self.inner.write().replays.push(replay);
        Ok(())
    }

    async fn replays(&self, step_id: StepId) -> Result<Vec<StepReplay>> {
        Ok(self
            .inner
            .read()
            .replays
            .iter()
            .filter(|r| r.step_id == step_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StepConfig, StepKind, StepTemplate, WorkflowState};
    use crate::types::{DefinitionId, Step};

    fn definition(name: &str, version: u32, is_active: bool) -> WorkflowDefinition {
        WorkflowDefinition {
            id: DefinitionId::new(),
            name: name.to_string(),
            version,
            description: None,
            steps: vec![StepTemplate {
                idx: Some(0),
                kind: StepKind::Auto,
                config: StepConfig::default(),
                compensating: None,
            }],
            is_active,
            created_at: Utc::now(),
        }
    }

    fn workflow() -> Workflow {
        let id = WorkflowId::new();
        let now = Utc::now();
        Workflow {
            id,
            workflow_type: "expense".to_string(),
            state: WorkflowState::Pending,
            metadata: serde_json::json!({}),
            current_step_index: 0,
            steps: vec![Step::from_template(
                id,
                0,
                &StepTemplate {
                    idx: Some(0),
                    kind: StepKind::Auto,
                    config: StepConfig::default(),
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
    async fn active_definition_picks_highest_active_version() {
        let store = MemoryStore::new();
        store.put_definition(definition("expense", 1, true)).await.unwrap();
        store.put_definition(definition("expense", 2, true)).await.unwrap();
        store.put_definition(definition("expense", 3, false)).await.unwrap();

        let active = store.active_definition("expense").await.unwrap().unwrap();
        assert_eq!(active.version, 2);
        assert_eq!(store.latest_version("expense").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn update_workflow_detects_stale_revision() {
        let store = MemoryStore::new();
        let wf = workflow();
        store.insert_workflow(wf.clone()).await.unwrap();

        let committed = store.update_workflow(&wf).await.unwrap();
        assert_eq!(committed.revision, 1);

        // Committing the original (stale) copy again must conflict
        let err = store.update_workflow(&wf).await.unwrap_err();
        assert!(matches!(err, EngineError::RevisionConflict(_)));
    }

    #[tokio::test]
    async fn delete_cascades_events_and_replays() {
        let store = MemoryStore::new();
        let wf = workflow();
        let step_id = wf.steps[0].id;
        store.insert_workflow(wf.clone()).await.unwrap();
        store
            .append_event(Event::new(
                wf.id,
                crate::types::EventType::WorkflowCreated,
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        store
            .append_replay(StepReplay::new(wf.id, step_id, None, "operator"))
            .await
            .unwrap();

        store.delete_workflow(wf.id).await.unwrap();
        assert!(store.workflow(wf.id).await.unwrap().is_none());
        assert!(store.events(wf.id).await.unwrap().is_empty());
        assert!(store.replays(step_id).await.unwrap().is_empty());
    }
}
