pub mod builtin;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::debug;

use crate::runtime::context::WorkflowContext;

/// 步骤类型标签，驱动引擎的调度逻辑 (是否可暂停、是否需要表单等)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Machine,
    Human,
    Webhook,
    Timer,
    Gateway,
}

pub type Guard = Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>;
pub type SuccessHook = Arc<dyn Fn(&WorkflowContext, &Value) + Send + Sync>;
pub type FailureHook = Arc<dyn Fn(&WorkflowContext, &str) + Send + Sync>;
pub type Selector = Arc<dyn Fn(&WorkflowContext) -> String + Send + Sync>;
pub type DurationFn = Arc<dyn Fn(&WorkflowContext) -> Duration + Send + Sync>;

/// 机器步骤的业务逻辑接口
/// params 来自步骤配置 (其中 `${var}` 引用在执行前已解析)。
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: &WorkflowContext) -> Result<Value>;
}

/// 闭包包装的 StepHandler，测试和内联逻辑用
pub struct FnHandler {
    name: String,
    func: Arc<dyn Fn(Value, &WorkflowContext) -> Result<Value> + Send + Sync>,
}

impl FnHandler {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(Value, &WorkflowContext) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl StepHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, params: Value, ctx: &WorkflowContext) -> Result<Value> {
        (self.func)(params, ctx)
    }
}

/// 所有步骤变体共有的部分：名称、守卫、生命周期钩子
#[derive(Clone, Default)]
pub struct StepBase {
    pub name: String,
    pub guard: Option<Guard>,
    pub success_hook: Option<SuccessHook>,
    pub failure_hook: Option<FailureHook>,
}

impl StepBase {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            guard: None,
            success_hook: None,
            failure_hook: None,
        }
    }
}

#[derive(Clone)]
pub struct MachineStep {
    pub base: StepBase,
    pub handler: Arc<dyn StepHandler>,
    pub params: Value,
    /// Context key the handler result is written to.
    pub output: Option<String>,
}

impl MachineStep {
    pub fn new(name: &str, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            base: StepBase::new(name),
            handler,
            params: Value::Null,
            output: None,
        }
    }

    /// 直接用闭包定义业务逻辑的机器步骤
    pub fn from_fn<F>(name: &str, func: F) -> Self
    where
        F: Fn(&WorkflowContext) -> Result<Value> + Send + Sync + 'static,
    {
        let handler = FnHandler::new(name, move |_params, ctx| func(ctx));
        Self::new(name, Arc::new(handler))
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_output(mut self, key: &str) -> Self {
        self.output = Some(key.to_string());
        self
    }
}

#[derive(Clone)]
pub struct HumanStep {
    pub base: StepBase,
    pub title: String,
    /// Structured description of the expected input form.
    pub form_schema: Value,
    /// Context key holding the assignee for this task, resolved at pause time.
    pub assignee_key: Option<String>,
}

impl HumanStep {
    pub fn new(name: &str, title: &str) -> Self {
        Self {
            base: StepBase::new(name),
            title: title.to_string(),
            form_schema: Value::Null,
            assignee_key: None,
        }
    }

    pub fn with_form_schema(mut self, schema: Value) -> Self {
        self.form_schema = schema;
        self
    }

    pub fn with_assignee_key(mut self, key: &str) -> Self {
        self.assignee_key = Some(key.to_string());
        self
    }

    pub fn assignee(&self, ctx: &WorkflowContext) -> Option<String> {
        let key = self.assignee_key.as_deref()?;
        match ctx.get(key)? {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub enum TimerDuration {
    Fixed(Duration),
    FromContext(DurationFn),
}

#[derive(Clone)]
pub struct TimerStep {
    pub base: StepBase,
    pub duration: TimerDuration,
}

impl TimerStep {
    pub fn fixed(name: &str, duration: Duration) -> Self {
        Self {
            base: StepBase::new(name),
            duration: TimerDuration::Fixed(duration),
        }
    }

    pub fn from_context<F>(name: &str, func: F) -> Self
    where
        F: Fn(&WorkflowContext) -> Duration + Send + Sync + 'static,
    {
        Self {
            base: StepBase::new(name),
            duration: TimerDuration::FromContext(Arc::new(func)),
        }
    }
}

#[derive(Clone)]
pub struct WebhookStep {
    pub base: StepBase,
    /// Context key the callback payload is expected under. The wait for the
    /// callback itself is an engine/external concern; the step only consumes
    /// data assumed already present.
    pub payload_key: String,
}

impl WebhookStep {
    pub fn new(name: &str, payload_key: &str) -> Self {
        Self {
            base: StepBase::new(name),
            payload_key: payload_key.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ExclusiveGatewayStep {
    pub base: StepBase,
    /// Returns the name of the one step to continue with (not an edge lookup).
    pub selector: Selector,
}

impl ExclusiveGatewayStep {
    pub fn new<F>(name: &str, selector: F) -> Self
    where
        F: Fn(&WorkflowContext) -> String + Send + Sync + 'static,
    {
        Self {
            base: StepBase::new(name),
            selector: Arc::new(selector),
        }
    }
}

#[derive(Clone)]
pub struct ParallelGatewayStep {
    pub base: StepBase,
    /// Unconditional fan-out declaration.
    pub branches: Vec<String>,
}

impl ParallelGatewayStep {
    pub fn new(name: &str, branches: Vec<&str>) -> Self {
        Self {
            base: StepBase::new(name),
            branches: branches.into_iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// 步骤：封闭的和类型，引擎的运行循环对变体做显式 match。
#[derive(Clone)]
pub enum Step {
    Machine(MachineStep),
    Human(HumanStep),
    Timer(TimerStep),
    Webhook(WebhookStep),
    ExclusiveGateway(ExclusiveGatewayStep),
    ParallelGateway(ParallelGatewayStep),
}

impl Step {
    pub fn name(&self) -> &str {
        &self.base().name
    }

    pub fn step_type(&self) -> StepType {
        match self {
            Step::Machine(_) => StepType::Machine,
            Step::Human(_) => StepType::Human,
            Step::Timer(_) => StepType::Timer,
            Step::Webhook(_) => StepType::Webhook,
            Step::ExclusiveGateway(_) | Step::ParallelGateway(_) => StepType::Gateway,
        }
    }

    pub fn base(&self) -> &StepBase {
        match self {
            Step::Machine(s) => &s.base,
            Step::Human(s) => &s.base,
            Step::Timer(s) => &s.base,
            Step::Webhook(s) => &s.base,
            Step::ExclusiveGateway(s) => &s.base,
            Step::ParallelGateway(s) => &s.base,
        }
    }

    fn base_mut(&mut self) -> &mut StepBase {
        match self {
            Step::Machine(s) => &mut s.base,
            Step::Human(s) => &mut s.base,
            Step::Timer(s) => &mut s.base,
            Step::Webhook(s) => &mut s.base,
            Step::ExclusiveGateway(s) => &mut s.base,
            Step::ParallelGateway(s) => &mut s.base,
        }
    }

    pub fn with_guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        self.base_mut().guard = Some(Arc::new(guard));
        self
    }

    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkflowContext, &Value) + Send + Sync + 'static,
    {
        self.base_mut().success_hook = Some(Arc::new(hook));
        self
    }

    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkflowContext, &str) + Send + Sync + 'static,
    {
        self.base_mut().failure_hook = Some(Arc::new(hook));
        self
    }

    /// 守卫：返回 false 时引擎记录 SKIPPED 并照常沿出边推进。
    pub fn can_execute(&self, ctx: &WorkflowContext) -> bool {
        match &self.base().guard {
            Some(guard) => guard(ctx),
            None => true,
        }
    }

    /// 执行步骤本体。人工步骤是占位 no-op (引擎在调用前就暂停了)。
    pub async fn execute(&self, ctx: &WorkflowContext) -> Result<Value> {
        match self {
            Step::Machine(step) => {
                let params = resolve_params(step.params.clone(), ctx);
                let result = step.handler.execute(params, ctx).await?;
                if let Some(out_key) = &step.output {
                    ctx.set(out_key, result.clone());
                }
                Ok(result)
            }
            Step::Human(_) => Ok(Value::Null),
            Step::Timer(step) => {
                let duration = match &step.duration {
                    TimerDuration::Fixed(d) => *d,
                    TimerDuration::FromContext(f) => f(ctx),
                };
                debug!(step = %self.name(), ?duration, "timer step sleeping");
                sleep(duration).await;
                Ok(Value::Null)
            }
            Step::Webhook(step) => {
                let payload = ctx.get(&step.payload_key).unwrap_or(Value::Null);
                if payload.is_null() {
                    debug!(step = %self.name(), key = %step.payload_key, "webhook payload not present");
                }
                Ok(payload)
            }
            Step::ExclusiveGateway(step) => {
                let next = (step.selector)(ctx);
                Ok(Value::String(next))
            }
            Step::ParallelGateway(step) => Ok(json!(step.branches)),
        }
    }

    pub fn notify_success(&self, ctx: &WorkflowContext, result: &Value) {
        if let Some(hook) = &self.base().success_hook {
            hook(ctx, result);
        }
    }

    pub fn notify_failure(&self, ctx: &WorkflowContext, error: &str) {
        if let Some(hook) = &self.base().failure_hook {
            hook(ctx, error);
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name())
            .field("type", &self.step_type())
            .finish()
    }
}

impl From<MachineStep> for Step {
    fn from(s: MachineStep) -> Self {
        Step::Machine(s)
    }
}

impl From<HumanStep> for Step {
    fn from(s: HumanStep) -> Self {
        Step::Human(s)
    }
}

impl From<TimerStep> for Step {
    fn from(s: TimerStep) -> Self {
        Step::Timer(s)
    }
}

impl From<WebhookStep> for Step {
    fn from(s: WebhookStep) -> Self {
        Step::Webhook(s)
    }
}

impl From<ExclusiveGatewayStep> for Step {
    fn from(s: ExclusiveGatewayStep) -> Self {
        Step::ExclusiveGateway(s)
    }
}

impl From<ParallelGatewayStep> for Step {
    fn from(s: ParallelGatewayStep) -> Self {
        Step::ParallelGateway(s)
    }
}

/// 解析 params 中的 `${var}` 引用为上下文中的实际值
fn resolve_params(mut params: Value, ctx: &WorkflowContext) -> Value {
    if let Some(obj) = params.as_object_mut() {
        for (_, v) in obj.iter_mut() {
            if let Some(s) = v.as_str() {
                if s.starts_with("${") && s.ends_with("}") {
                    let var_name = &s[2..s.len() - 1];
                    if let Some(val) = ctx.get(var_name) {
                        *v = val;
                    }
                }
            }
        }
    }
    params
}
