use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// 引擎发出的进度事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    Started { instance_id: Uuid },
    Waiting { instance_id: Uuid, step_name: String },
    Completed { instance_id: Uuid },
    Failed { instance_id: Uuid, error: String },
    Canceled { instance_id: Uuid, reason: String },
}

impl WorkflowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::Started { .. } => "workflow.started",
            WorkflowEvent::Waiting { .. } => "workflow.waiting",
            WorkflowEvent::Completed { .. } => "workflow.completed",
            WorkflowEvent::Failed { .. } => "workflow.failed",
            WorkflowEvent::Canceled { .. } => "workflow.canceled",
        }
    }

    pub fn instance_id(&self) -> Uuid {
        match self {
            WorkflowEvent::Started { instance_id }
            | WorkflowEvent::Waiting { instance_id, .. }
            | WorkflowEvent::Completed { instance_id }
            | WorkflowEvent::Failed { instance_id, .. }
            | WorkflowEvent::Canceled { instance_id, .. } => *instance_id,
        }
    }
}

/// 事件端口。实现方自行决定投递方式；emit 不允许失败。
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkflowEvent);
}

/// 默认实现：tracing 结构化日志
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: WorkflowEvent) {
        match &event {
            WorkflowEvent::Waiting { instance_id, step_name } => {
                info!(event = event.event_type(), instance_id = %instance_id, step_name = %step_name);
            }
            WorkflowEvent::Failed { instance_id, error } => {
                info!(event = event.event_type(), instance_id = %instance_id, error = %error);
            }
            WorkflowEvent::Canceled { instance_id, reason } => {
                info!(event = event.event_type(), instance_id = %instance_id, reason = %reason);
            }
            _ => {
                info!(event = event.event_type(), instance_id = %event.instance_id());
            }
        }
    }
}

/// 通过 mpsc 转发事件，订阅方 (测试、API 层) 自取。
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: WorkflowEvent) {
        // Receiver dropped means nobody is listening; that is fine.
        let _ = self.sender.send(event);
    }
}
