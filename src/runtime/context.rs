use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 单次步骤执行的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Scheduled,
    Running,
    Waiting,
    Succeeded,
    Failed,
    Canceled,
    Skipped,
}

/// 步骤执行记录 (创建后不可变)
/// 追加到 Context 的 step_history，从不删除或原地修改。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
}

impl StepExecution {
    pub fn succeeded(step_name: &str, started_at: DateTime<Utc>, result: Option<Value>) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Succeeded,
            started_at,
            completed_at: Some(Utc::now()),
            output_data: result.clone(),
            result,
            error: None,
            input_data: None,
        }
    }

    pub fn failed(step_name: &str, started_at: DateTime<Utc>, error: String) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Failed,
            started_at,
            completed_at: Some(Utc::now()),
            result: None,
            error: Some(error),
            input_data: None,
            output_data: None,
        }
    }

    pub fn skipped(step_name: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Skipped,
            started_at,
            completed_at: Some(Utc::now()),
            result: None,
            error: None,
            input_data: None,
            output_data: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input_data = Some(input);
        self
    }
}

/// 工作流运行时上下文 (Workflow Context)
/// 每个实例一份：键值数据 + 只追加的执行历史，贯穿所有步骤调用。
///
/// 并行策略：data/metadata 是所有分支共享的并发 Map (DashMap)，
/// 单 key 操作原子，不同 key 的并发写入不会互相丢失；
/// history 通过 Mutex 串行追加。`with_step` 只派生一个新的
/// current_step 标签，底层状态仍然共享。
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub workflow_id: Uuid,
    pub instance_id: Uuid,
    data: Arc<DashMap<String, Value>>,
    /// Immutable by convention: set at start, steps should only read it.
    metadata: Arc<DashMap<String, Value>>,
    pub current_step: String,
    history: Arc<Mutex<Vec<StepExecution>>>,
    pub started_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl WorkflowContext {
    pub fn new(
        workflow_id: Uuid,
        instance_id: Uuid,
        initial_step: &str,
        initial_data: HashMap<String, Value>,
    ) -> Self {
        let data = DashMap::new();
        for (k, v) in initial_data {
            data.insert(k, v);
        }
        Self {
            workflow_id,
            instance_id,
            data: Arc::new(data),
            metadata: Arc::new(DashMap::new()),
            current_step: initial_step.to_string(),
            history: Arc::new(Mutex::new(Vec::new())),
            started_at: Utc::now(),
            user_id: None,
            tenant_id: None,
        }
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_tenant(mut self, tenant_id: &str) -> Self {
        self.tenant_id = Some(tenant_id.to_string());
        self
    }

    /// 派生一个分支视图：共享同一份 data/metadata/history，
    /// 只有 current_step 标签不同。
    pub fn with_step(&self, step_name: &str) -> Self {
        let mut derived = self.clone();
        derived.current_step = step_name.to_string();
        derived
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn merge(&self, values: HashMap<String, Value>) {
        for (k, v) in values {
            self.data.insert(k, v);
        }
    }

    /// Snapshot of the data map. Expensive for large contexts; used for
    /// execution records and expression evaluation.
    pub fn data_snapshot(&self) -> HashMap<String, Value> {
        self.data
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    pub fn set_metadata(&self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.metadata.get(key).map(|v| v.value().clone())
    }

    pub fn push_execution(&self, execution: StepExecution) {
        // Lock poisoning only happens if a holder panicked mid-push;
        // the Vec itself is still usable, so recover the guard.
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(execution);
    }

    pub fn history(&self) -> Vec<StepExecution> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.clone()
    }

    pub fn history_len(&self) -> usize {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.len()
    }
}
