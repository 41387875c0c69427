use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::runtime::context::WorkflowContext;
use crate::runtime::engine::{Engine, StepOutcome};
use crate::steps::{Guard, Step};

/// 组合助手：在引擎的 execute_step 原语之上做顺序/并行/条件编排。
/// 与运行循环无关 —— 组内步骤不走 Graph，也不暂停。
///
/// 顺序组：按声明顺序执行，第一个失败即停止。
pub struct SequentialGroup {
    steps: Vec<Step>,
}

impl SequentialGroup {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub async fn run(
        &self,
        engine: &Engine,
        ctx: &WorkflowContext,
    ) -> EngineResult<Vec<StepOutcome>> {
        let mut outcomes = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let outcome = engine.execute_step(step, &ctx.with_step(step.name())).await;
            if let StepOutcome::Failed(message) = &outcome {
                return Err(EngineError::StepFailed {
                    step: step.name().to_string(),
                    message: message.clone(),
                });
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

/// 并行组：所有步骤一起启动、一起等待，共享同一个上下文。
/// 任一失败则整组报错 (报告最先收到的错误)。
pub struct ParallelGroup {
    steps: Vec<Step>,
}

impl ParallelGroup {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub async fn run(
        &self,
        engine: &Arc<Engine>,
        ctx: &WorkflowContext,
    ) -> EngineResult<Vec<(String, StepOutcome)>> {
        let mut set = JoinSet::new();
        for step in &self.steps {
            let step = step.clone();
            let branch_ctx = ctx.with_step(step.name());
            let engine = engine.clone();
            set.spawn(async move {
                let name = step.name().to_string();
                let outcome = engine.execute_step(&step, &branch_ctx).await;
                (name, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(self.steps.len());
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    if let StepOutcome::Failed(message) = &outcome {
                        if first_error.is_none() {
                            first_error = Some(EngineError::StepFailed {
                                step: name.clone(),
                                message: message.clone(),
                            });
                        }
                    }
                    outcomes.push((name, outcome));
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(EngineError::StepFailed {
                            step: "<panicked>".to_string(),
                            message: join_err.to_string(),
                        });
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }
}

/// 条件组：谓词选择 then/else 分支，选中的分支按顺序执行。
pub struct ConditionalGroup {
    predicate: Guard,
    then_steps: Vec<Step>,
    else_steps: Vec<Step>,
}

impl ConditionalGroup {
    pub fn new<F>(predicate: F, then_steps: Vec<Step>, else_steps: Vec<Step>) -> Self
    where
        F: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            then_steps,
            else_steps,
        }
    }

    pub async fn run(
        &self,
        engine: &Engine,
        ctx: &WorkflowContext,
    ) -> EngineResult<Vec<StepOutcome>> {
        let branch = if (self.predicate)(ctx) {
            debug!("conditional group taking then-branch");
            &self.then_steps
        } else {
            debug!("conditional group taking else-branch");
            &self.else_steps
        };
        SequentialGroup::new(branch.clone()).run(engine, ctx).await
    }
}
