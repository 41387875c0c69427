use thiserror::Error;
use uuid::Uuid;

/// 引擎层错误分类
/// 步骤内部的业务错误走 anyhow，跨越引擎边界时落到这里。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow not found: {name} (version: {})", version.as_deref().unwrap_or("latest"))]
    WorkflowNotFound {
        name: String,
        version: Option<String>,
    },

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("step '{step}' not found in definition '{definition}'")]
    StepNotFound { definition: String, step: String },

    /// 操作与实例当前状态不符 (如对非 WAITING 实例调用 complete_human_task)。
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("invalid definition '{name}': {}", errors.join("; "))]
    InvalidDefinition { name: String, errors: Vec<String> },

    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
