use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::context::WorkflowContext;

/// 工作流实例状态机
/// RUNNING → {WAITING, COMPLETED, FAILED, CANCELED}
/// WAITING → RUNNING (人工任务完成) → {COMPLETED, FAILED, CANCELED}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Waiting,
    Completed,
    Failed,
    Canceled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Canceled
        )
    }
}

/// 运行中的工作流实例
/// start_workflow 时创建，运行循环中不断修改，到达终态后不再变化。
#[derive(Debug, Clone)]
pub struct WorkflowInstanceData {
    pub id: Uuid,
    pub workflow_name: String,
    pub workflow_version: String,
    pub status: WorkflowStatus,
    pub context: WorkflowContext,
    pub current_step: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowInstanceData {
    pub fn new(
        workflow_name: &str,
        workflow_version: &str,
        context: WorkflowContext,
        initial_step: &str,
    ) -> Self {
        Self {
            id: context.instance_id,
            workflow_name: workflow_name.to_string(),
            workflow_version: workflow_version.to_string(),
            status: WorkflowStatus::Running,
            context,
            current_step: Some(initial_step.to_string()),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}
