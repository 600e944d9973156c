//! Core domain types for the orchestration engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionId(pub Uuid);

impl DefinitionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a step within a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub Uuid);

impl ApprovalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a step: executed by the engine or suspended on a human decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepKind {
    Auto,
    Human,
}

/// Execution state of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    /// Not yet reached (downstream of a replayed step)
    Pending,
    /// Eligible to run
    Ready,
    /// Suspended on an outstanding approval
    Waiting,
    Done,
    Failed,
}

/// Aggregate state of a workflow instance, derived from step/approval facts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Pending,
    Running,
    WaitingApproval,
    Done,
    Failed,
    Rejected,
}

impl WorkflowState {
    /// Terminal states do not advance on their own; replay/restart re-enters them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Rejected)
    }
}

/// Delivery channel for an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalChannel {
    Web,
    Slack,
    Email,
    Teams,
    Sms,
}

impl ApprovalChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalChannel::Web => "web",
            ApprovalChannel::Slack => "slack",
            ApprovalChannel::Email => "email",
            ApprovalChannel::Teams => "teams",
            ApprovalChannel::Sms => "sms",
        }
    }
}

impl std::fmt::Display for ApprovalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

/// A human decision submitted against an approval token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_approval_status(&self) -> ApprovalStatus {
        match self {
            Decision::Approved => ApprovalStatus::Approved,
            Decision::Rejected => ApprovalStatus::Rejected,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approved => f.write_str("approved"),
            Decision::Rejected => f.write_str("rejected"),
        }
    }
}

/// Input field rendered on an approval form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Textarea,
    Number,
    Select,
    Checkbox,
}

/// Compensation descriptor attached to a step; dispatched best-effort when
/// the step fails. It records intent and emits events, it does not reverse
/// persisted side effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationConfig {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Per-step configuration. Known fields are typed; anything else lands in
/// the extension map and is carried through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConfig {
    /// Action name dispatched through the registry (AUTO steps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Primary delivery channel (required for HUMAN steps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ApprovalChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<ApprovalField>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Step template inside a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    /// Position in the sequence; when provided it must match the array index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idx: Option<usize>,
    pub kind: StepKind,
    #[serde(default)]
    pub config: StepConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensating: Option<CompensationConfig>,
}

/// Named, versioned workflow template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: DefinitionId,
    pub name: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepTemplate>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// One step of a workflow instance, snapshotted from the definition at
/// creation time. Mutated only by the executor and the replay manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub workflow_id: WorkflowId,
    pub idx: usize,
    pub kind: StepKind,
    pub state: StepState,
    pub config: StepConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensating: Option<CompensationConfig>,
    #[serde(default)]
    pub replay_count: u32,
    #[serde(default = "default_true")]
    pub can_replay: bool,
    #[serde(default = "default_true")]
    pub can_execute: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Step {
    /// Snapshot a definition step template into a fresh instance step
    pub fn from_template(workflow_id: WorkflowId, idx: usize, template: &StepTemplate) -> Self {
        let now = Utc::now();
        Self {
            id: StepId::new(),
            workflow_id,
            idx,
            kind: template.kind,
            state: StepState::Ready,
            config: template.config.clone(),
            compensating: template.compensating.clone(),
            replay_count: 0,
            can_replay: true,
            can_execute: true,
            failed_at: None,
            executed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outstanding or settled human decision request, keyed externally only by
/// its unguessable token. A step accumulates one row per request occurrence
/// (initial, resend, replay); at most one may be pending at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub channel: ApprovalChannel,
    pub status: ApprovalStatus,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Workflow instance: owns its steps and approvals; events and replay rows
/// are appended through the store and cascade-deleted with the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    /// Logical definition name this instance was created from
    pub workflow_type: String,
    pub state: WorkflowState,
    pub metadata: serde_json::Value,
    pub current_step_index: usize,
    pub steps: Vec<Step>,
    pub approvals: Vec<Approval>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-lock stamp, bumped by the store on every commit
    #[serde(default)]
    pub revision: u64,
}

impl Workflow {
    pub fn step(&self, step_id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn step_at(&self, idx: usize) -> Option<&Step> {
        self.steps.iter().find(|s| s.idx == idx)
    }

    pub fn approval(&self, approval_id: ApprovalId) -> Option<&Approval> {
        self.approvals.iter().find(|a| a.id == approval_id)
    }

    pub fn approval_mut(&mut self, approval_id: ApprovalId) -> Option<&mut Approval> {
        self.approvals.iter_mut().find(|a| a.id == approval_id)
    }

    pub fn approval_by_token(&self, token: &str) -> Option<&Approval> {
        self.approvals.iter().find(|a| a.token == token)
    }

    /// Expire every pending approval bound to the given step, stamping
    /// `expires_at` to now. Returns how many were expired.
    pub fn expire_pending_approvals(&mut self, step_id: StepId, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for approval in &mut self.approvals {
            if approval.step_id == step_id && approval.status == ApprovalStatus::Pending {
                approval.status = ApprovalStatus::Expired;
                approval.expires_at = now;
                approval.updated_at = now;
                expired += 1;
            }
        }
        expired
    }

    /// Derive the aggregate state from current step/approval facts.
    ///
    /// Precedence, highest first: rejected approval, failed step, all
    /// steps done, waiting step, ready step, pending.
    pub fn derive_state(&self) -> WorkflowState {
        if self
            .approvals
            .iter()
            .any(|a| a.status == ApprovalStatus::Rejected)
        {
            WorkflowState::Rejected
        } else if self.steps.iter().any(|s| s.state == StepState::Failed) {
            WorkflowState::Failed
        } else if self.steps.iter().all(|s| s.state == StepState::Done) {
            WorkflowState::Done
        } else if self.steps.iter().any(|s| s.state == StepState::Waiting) {
            WorkflowState::WaitingApproval
        } else if self.steps.iter().any(|s| s.state == StepState::Ready) {
            WorkflowState::Running
        } else {
            WorkflowState::Pending
        }
    }
}

/// Types of audit events recorded against a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    WorkflowCreated,
    WorkflowStateChanged,
    WorkflowCompleted,
    WorkflowRestarted,
    WorkflowCancelled,
    StepFailed,
    StepRetried,
    StepManualExecution,
    StepReplayInitiated,
    ApprovalRequested,
    ApprovalApproved,
    ApprovalRejected,
    ApprovalExpired,
    ApprovalResent,
    CompensationExecuted,
    CompensationFailed,
}

/// Append-only audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(workflow_id: WorkflowId, event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            event_type,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Append-only audit row recording one replay/rollback action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReplay {
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub replayed_by: String,
    pub created_at: DateTime<Utc>,
}

impl StepReplay {
    pub fn new(
        workflow_id: WorkflowId,
        step_id: StepId,
        reason: Option<String>,
        replayed_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            step_id,
            reason,
            replayed_by: replayed_by.into(),
            created_at: Utc::now(),
        }
    }
}
