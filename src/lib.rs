//! stepflow — 工作流编排引擎
//!
//! 执行 DAG 形态的流程定义：机器步骤、人工审批、定时器、Webhook、
//! 决策网关。引擎追踪执行状态，在人工任务处暂停，外部输入后确定性恢复，
//! 并支持并行分支的扇出/汇合。

pub mod error;
pub mod groups;
pub mod model;
pub mod runtime;
pub mod steps;

pub use error::{EngineError, EngineResult};
pub use model::definition::{Condition, DefinitionBuilder, Edge, WorkflowDefinition};
pub use model::graph::WorkflowGraph;
pub use model::manifest::DefinitionManifest;
pub use model::registry::Registry;
pub use runtime::context::{StepExecution, StepStatus, WorkflowContext};
pub use runtime::engine::{Engine, StepOutcome};
pub use runtime::events::{ChannelEventSink, EventSink, TracingEventSink, WorkflowEvent};
pub use runtime::instance::{WorkflowInstanceData, WorkflowStatus};
pub use runtime::storage::{InMemoryInstanceStore, InstanceStore};
pub use steps::{
    ExclusiveGatewayStep, HumanStep, MachineStep, ParallelGatewayStep, Step, StepHandler,
    StepType, TimerStep, WebhookStep,
};
