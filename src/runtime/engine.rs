use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::definition::WorkflowDefinition;
use crate::model::graph::WorkflowGraph;
use crate::model::registry::Registry;
use crate::runtime::context::{StepExecution, WorkflowContext};
use crate::runtime::events::{EventSink, TracingEventSink, WorkflowEvent};
use crate::runtime::instance::{WorkflowInstanceData, WorkflowStatus};
use crate::runtime::storage::InstanceStore;
use crate::steps::{Step, StepType};

/// 单次步骤执行的结果，由 execute_step 返回
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Succeeded(Value),
    /// Guard rejected the step; it produced no result but the run still
    /// advances along the outgoing edges.
    Skipped,
    Failed(String),
}

/// 一次循环迭代之后的走向
enum Flow {
    Continue(String),
    FanOut(Vec<String>),
    Done,
}

/// 工作流执行引擎
///
/// 实例表和运行任务表由引擎持有，按 instance_id 索引；
/// 每个实例一把 Mutex，resume/cancel/推进互斥。
/// 运行循环是 fire-and-forget 的后台任务：start_workflow 与
/// complete_human_task 都立即返回，调用方通过轮询或事件观察进度。
pub struct Engine {
    registry: Registry,
    instances: DashMap<Uuid, Arc<Mutex<WorkflowInstanceData>>>,
    running: DashMap<Uuid, JoinHandle<()>>,
    store: Option<Arc<dyn InstanceStore>>,
    events: Arc<dyn EventSink>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            instances: DashMap::new(),
            running: DashMap::new(),
            store: None,
            events: Arc::new(TracingEventSink),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn register(&self, definition: WorkflowDefinition) {
        self.registry.register(definition);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 启动一个工作流实例。运行循环交给后台任务，立即返回实例 id。
    pub async fn start_workflow(
        self: &Arc<Self>,
        name: &str,
        version: Option<&str>,
        initial_data: HashMap<String, Value>,
    ) -> EngineResult<Uuid> {
        let def = self.registry.get(name, version)?;
        let workflow_id = Uuid::new_v4();
        let instance_id = Uuid::new_v4();
        let ctx = WorkflowContext::new(workflow_id, instance_id, &def.initial_step, initial_data);
        let instance = WorkflowInstanceData::new(&def.name, &def.version, ctx, &def.initial_step);
        let inst = Arc::new(Mutex::new(instance));
        self.instances.insert(instance_id, inst.clone());

        self.persist(&inst).await;
        info!(instance_id = %instance_id, workflow = %def.name, version = %def.version, "workflow started");
        self.events.emit(WorkflowEvent::Started { instance_id });
        self.spawn_run(instance_id, def);
        Ok(instance_id)
    }

    pub async fn get_instance(&self, id: Uuid) -> EngineResult<WorkflowInstanceData> {
        let inst = self.instance_arc(id)?;
        let guard = inst.lock().await;
        Ok(guard.clone())
    }

    /// 快照所有未到终态的实例 (RUNNING / WAITING)
    pub async fn get_running_instances(&self) -> Vec<WorkflowInstanceData> {
        let mut result = Vec::new();
        let handles: Vec<Arc<Mutex<WorkflowInstanceData>>> =
            self.instances.iter().map(|e| e.value().clone()).collect();
        for inst in handles {
            let guard = inst.lock().await;
            if matches!(guard.status, WorkflowStatus::Running | WorkflowStatus::Waiting) {
                result.push(guard.clone());
            }
        }
        result
    }

    /// 单步执行原语：守卫 → 执行 → 钩子 → 追加执行记录。
    /// 运行循环、扇出分支和 Step Groups 都经过这里。
    pub async fn execute_step(&self, step: &Step, ctx: &WorkflowContext) -> StepOutcome {
        let started_at = Utc::now();
        let input = json!(ctx.data_snapshot());

        if !step.can_execute(ctx) {
            debug!(step = %step.name(), "guard rejected execution, skipping");
            ctx.push_execution(StepExecution::skipped(step.name(), started_at));
            return StepOutcome::Skipped;
        }

        match step.execute(ctx).await {
            Ok(result) => {
                step.notify_success(ctx, &result);
                ctx.push_execution(
                    StepExecution::succeeded(step.name(), started_at, Some(result.clone()))
                        .with_input(input),
                );
                StepOutcome::Succeeded(result)
            }
            Err(err) => {
                let message = format!("{:#}", err);
                step.notify_failure(ctx, &message);
                ctx.push_execution(
                    StepExecution::failed(step.name(), started_at, message.clone())
                        .with_input(input),
                );
                StepOutcome::Failed(message)
            }
        }
    }

    /// 完成一个等待中的人工任务：合并数据、记录执行、恢复运行循环。
    /// 前置条件：实例处于 WAITING 且停在 step_name，否则报错且不改状态。
    pub async fn complete_human_task(
        self: &Arc<Self>,
        id: Uuid,
        step_name: &str,
        user_id: &str,
        data: HashMap<String, Value>,
    ) -> EngineResult<()> {
        let inst = self.instance_arc(id)?;
        let mut guard = inst.lock().await;

        if guard.status != WorkflowStatus::Waiting {
            return Err(EngineError::Precondition(format!(
                "instance {} is {:?}, expected WAITING",
                id, guard.status
            )));
        }
        if guard.current_step.as_deref() != Some(step_name) {
            return Err(EngineError::Precondition(format!(
                "instance {} is waiting at '{}', not '{}'",
                id,
                guard.current_step.as_deref().unwrap_or("<none>"),
                step_name
            )));
        }

        let def = self
            .registry
            .get(&guard.workflow_name, Some(&guard.workflow_version))?;
        let graph = WorkflowGraph::new(&def);
        let ctx = guard.context.clone();

        info!(instance_id = %id, step = %step_name, user = %user_id, "human task completed");
        let started_at = Utc::now();
        ctx.merge(data.clone());
        ctx.push_execution(StepExecution::succeeded(step_name, started_at, Some(json!(data))));
        guard.status = WorkflowStatus::Running;

        // 用合并后的上下文解析后继，再放循环回后台
        let step_ctx = ctx.with_step(step_name);
        let flow = resolve_next(&graph, &step_ctx, step_name);
        if let Flow::Continue(next) = &flow {
            guard.current_step = Some(next.clone());
        }
        drop(guard);
        self.persist(&inst).await;

        match flow {
            Flow::Done => self.finish(id, WorkflowStatus::Completed, None).await,
            Flow::Continue(_) => self.spawn_run(id, def),
            Flow::FanOut(names) => self.spawn_fanout(id, def, names),
        }
        Ok(())
    }

    /// 取消实例 (尽力而为)：置 CANCELED、写入原因、abort 后台任务。
    /// 进行中的 execute() 不会被同步打断，只是在下一个 await 点被丢弃。
    pub async fn cancel_workflow(&self, id: Uuid, reason: &str) -> EngineResult<()> {
        let inst = self.instance_arc(id)?;
        {
            let mut guard = inst.lock().await;
            if guard.status.is_terminal() {
                return Err(EngineError::Precondition(format!(
                    "instance {} is already {:?}",
                    id, guard.status
                )));
            }
            guard.status = WorkflowStatus::Canceled;
            guard.error = Some(format!("canceled: {}", reason));
            guard.completed_at = Some(Utc::now());
        }
        self.persist(&inst).await;
        if let Some((_, handle)) = self.running.remove(&id) {
            handle.abort();
        }
        info!(instance_id = %id, reason = %reason, "workflow canceled");
        self.events.emit(WorkflowEvent::Canceled {
            instance_id: id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// 粗粒度调度原语：可选延迟后把实例拨到 step_name 并确保有运行任务。
    /// 延迟只存在于进程内，不是持久定时器。
    pub fn schedule_step(
        self: &Arc<Self>,
        id: Uuid,
        step_name: &str,
        delay: Option<Duration>,
    ) -> EngineResult<()> {
        let inst = self.instance_arc(id)?;
        let engine = self.clone();
        let step_name = step_name.to_string();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let def = {
                let mut guard = inst.lock().await;
                if guard.status.is_terminal() {
                    warn!(instance_id = %id, status = ?guard.status, "not scheduling step on terminal instance");
                    return;
                }
                let def = match engine
                    .registry
                    .get(&guard.workflow_name, Some(&guard.workflow_version))
                {
                    Ok(def) => def,
                    Err(e) => {
                        drop(guard);
                        engine.fail(id, e.to_string()).await;
                        return;
                    }
                };
                guard.current_step = Some(step_name.clone());
                guard.status = WorkflowStatus::Running;
                def
            };
            engine.persist(&inst).await;
            engine.spawn_run(id, def);
        });
        Ok(())
    }

    // --- Run loop internals ---

    fn spawn_run(self: &Arc<Self>, id: Uuid, def: Arc<WorkflowDefinition>) {
        let engine = self.clone();
        let task = move || tokio::spawn(async move { engine.run_loop(id, def).await });
        // Entry holds the shard lock, making check-and-insert atomic against
        // concurrent relaunch attempts.
        match self.running.entry(id) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_finished() {
                    warn!(instance_id = %id, "run task already tracked, not spawning another");
                    return;
                }
                entry.insert(task());
            }
            Entry::Vacant(entry) => {
                entry.insert(task());
            }
        }
    }

    fn spawn_fanout(self: &Arc<Self>, id: Uuid, def: Arc<WorkflowDefinition>, names: Vec<String>) {
        let engine = self.clone();
        let task = move || {
            tokio::spawn(async move {
                let graph = WorkflowGraph::new(&def);
                let ctx = match engine.context_of(id).await {
                    Some(ctx) => ctx,
                    None => return,
                };
                match engine.fan_out(&def, &graph, &ctx, names).await {
                    Err(err) => engine.fail(id, err).await,
                    Ok(Flow::Continue(join)) => {
                        if engine.set_current(id, &join).await {
                            engine.clone().run_loop(id, def).await;
                        }
                    }
                    Ok(_) => engine.finish(id, WorkflowStatus::Completed, None).await,
                }
            })
        };
        match self.running.entry(id) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_finished() {
                    warn!(instance_id = %id, "run task already tracked, not spawning another");
                    return;
                }
                entry.insert(task());
            }
            Entry::Vacant(entry) => {
                entry.insert(task());
            }
        }
    }

    /// 运行循环：每次迭代处理一个步骤。
    /// Graph 每次执行尝试构建一次，循环内不再变化。
    async fn run_loop(self: Arc<Self>, id: Uuid, def: Arc<WorkflowDefinition>) {
        let graph = WorkflowGraph::new(&def);
        loop {
            let Ok(inst) = self.instance_arc(id) else { return };
            let (current, ctx) = {
                let guard = inst.lock().await;
                if guard.status != WorkflowStatus::Running {
                    self.running.remove(&id);
                    return;
                }
                (guard.current_step.clone(), guard.context.clone())
            };

            let Some(current) = current else {
                self.finish(id, WorkflowStatus::Completed, None).await;
                return;
            };

            let Some(step) = def.step(&current) else {
                // Malformed definition made it into execution: fatal.
                self.fail(
                    id,
                    EngineError::StepNotFound {
                        definition: def.name.clone(),
                        step: current.clone(),
                    }
                    .to_string(),
                )
                .await;
                return;
            };

            // 人工步骤：执行前暂停，execute() 在本轮根本不会被调用
            if step.step_type() == StepType::Human {
                // Untrack this task before WAITING becomes observable so a
                // prompt complete_human_task can relaunch the loop.
                self.running.remove(&id);
                {
                    let mut guard = inst.lock().await;
                    if guard.status != WorkflowStatus::Running {
                        return;
                    }
                    guard.status = WorkflowStatus::Waiting;
                }
                if let Step::Human(human) = step {
                    if let Some(assignee) = human.assignee(&ctx) {
                        debug!(instance_id = %id, step = %current, assignee = %assignee, "human task assigned");
                    }
                }
                self.persist(&inst).await;
                self.events.emit(WorkflowEvent::Waiting {
                    instance_id: id,
                    step_name: current.clone(),
                });
                return;
            }

            let step_ctx = ctx.with_step(&current);
            let outcome = self.execute_step(step, &step_ctx).await;

            let flow = match outcome {
                StepOutcome::Failed(err) => {
                    self.fail(id, err).await;
                    return;
                }
                // 网关变体覆盖基于边的推进
                StepOutcome::Succeeded(result) => match step {
                    Step::ExclusiveGateway(_) => match result {
                        Value::String(next) => Flow::Continue(next),
                        other => {
                            self.fail(
                                id,
                                format!(
                                    "exclusive gateway '{}' returned a non-string target: {}",
                                    current, other
                                ),
                            )
                            .await;
                            return;
                        }
                    },
                    Step::ParallelGateway(gateway) => Flow::FanOut(gateway.branches.clone()),
                    _ => resolve_next(&graph, &step_ctx, &current),
                },
                StepOutcome::Skipped => resolve_next(&graph, &step_ctx, &current),
            };

            match flow {
                Flow::Done => {
                    self.finish(id, WorkflowStatus::Completed, None).await;
                    return;
                }
                Flow::Continue(next) => {
                    let mut guard = inst.lock().await;
                    if guard.status != WorkflowStatus::Running {
                        self.running.remove(&id);
                        return;
                    }
                    guard.current_step = Some(next);
                    drop(guard);
                    self.persist(&inst).await;
                }
                Flow::FanOut(names) => match self.fan_out(&def, &graph, &ctx, names).await {
                    Err(err) => {
                        self.fail(id, err).await;
                        return;
                    }
                    Ok(Flow::Continue(join)) => {
                        if !self.set_current(id, &join).await {
                            return;
                        }
                    }
                    Ok(_) => {
                        self.finish(id, WorkflowStatus::Completed, None).await;
                        return;
                    }
                },
            }
        }
    }

    /// 并行扇出：所有分支一起启动、一起等待。
    /// 每个分支拿到 with_step 的视图 (共享同一份 data/history)。
    /// 任一分支失败 ⇒ 整个实例 FAILED (报告最先收到的错误)。
    /// 全部成功 ⇒ 计算各分支后继的并集：唯一的公共目标作为 join 继续，
    /// 空集完成，多个不同目标按完成处理 (不跟进嵌套扇出)。
    async fn fan_out(
        self: &Arc<Self>,
        def: &Arc<WorkflowDefinition>,
        graph: &WorkflowGraph,
        ctx: &WorkflowContext,
        names: Vec<String>,
    ) -> Result<Flow, String> {
        let mut set = JoinSet::new();
        for name in &names {
            let Some(step) = def.step(name) else {
                return Err(EngineError::StepNotFound {
                    definition: def.name.clone(),
                    step: name.clone(),
                }
                .to_string());
            };
            let step = step.clone();
            let branch_ctx = ctx.with_step(name);
            let engine = self.clone();
            let branch_name = name.clone();
            set.spawn(async move {
                let outcome = engine.execute_step(&step, &branch_ctx).await;
                (branch_name, outcome)
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, StepOutcome::Failed(err))) => {
                    if first_error.is_none() {
                        first_error = Some(format!("branch '{}' failed: {}", name, err));
                    }
                }
                Ok(_) => {}
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(format!("branch task panicked: {}", join_err));
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let mut union: Vec<String> = Vec::new();
        for name in &names {
            if graph.is_terminal(name) {
                continue;
            }
            let branch_ctx = ctx.with_step(name);
            for target in graph.get_next_steps(name, &branch_ctx) {
                if !union.contains(&target) {
                    union.push(target);
                }
            }
        }
        match union.len() {
            0 => Ok(Flow::Done),
            1 => Ok(Flow::Continue(union.remove(0))),
            _ => {
                warn!(
                    targets = ?union,
                    "fan-out branches diverge to multiple targets; nested fan-out is not followed, completing instance"
                );
                Ok(Flow::Done)
            }
        }
    }

    // --- State helpers ---

    fn instance_arc(&self, id: Uuid) -> EngineResult<Arc<Mutex<WorkflowInstanceData>>> {
        self.instances
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::InstanceNotFound(id))
    }

    async fn context_of(&self, id: Uuid) -> Option<WorkflowContext> {
        let inst = self.instance_arc(id).ok()?;
        let guard = inst.lock().await;
        Some(guard.context.clone())
    }

    /// 返回 false 表示实例已不在 RUNNING (被取消等)，调用方应停止推进。
    async fn set_current(&self, id: Uuid, step: &str) -> bool {
        let Ok(inst) = self.instance_arc(id) else {
            return false;
        };
        {
            let mut guard = inst.lock().await;
            if guard.status != WorkflowStatus::Running {
                self.running.remove(&id);
                return false;
            }
            guard.current_step = Some(step.to_string());
        }
        self.persist(&inst).await;
        true
    }

    async fn fail(&self, id: Uuid, error: String) {
        error!(instance_id = %id, error = %error, "workflow failed");
        self.finish(id, WorkflowStatus::Failed, Some(error)).await;
    }

    async fn finish(&self, id: Uuid, status: WorkflowStatus, error: Option<String>) {
        let Ok(inst) = self.instance_arc(id) else {
            return;
        };
        {
            let mut guard = inst.lock().await;
            if guard.status.is_terminal() {
                // Cancel won the race; leave its verdict in place.
                self.running.remove(&id);
                return;
            }
            guard.status = status;
            guard.completed_at = Some(Utc::now());
            if status == WorkflowStatus::Completed {
                guard.current_step = None;
            }
            guard.error = error.clone();
        }
        self.persist(&inst).await;
        match status {
            WorkflowStatus::Completed => {
                info!(instance_id = %id, "workflow completed");
                self.events.emit(WorkflowEvent::Completed { instance_id: id });
            }
            WorkflowStatus::Failed => {
                self.events.emit(WorkflowEvent::Failed {
                    instance_id: id,
                    error: error.unwrap_or_default(),
                });
            }
            _ => {}
        }
        self.running.remove(&id);
    }

    async fn persist(&self, inst: &Arc<Mutex<WorkflowInstanceData>>) {
        if let Some(store) = &self.store {
            let snapshot = inst.lock().await.clone();
            if let Err(e) = store.save_instance(&snapshot).await {
                error!(instance_id = %snapshot.id, error = %e, "failed to persist instance");
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// 终点判定 + 后继解析：零个后继视为完成，一个顺序推进，多个扇出。
fn resolve_next(graph: &WorkflowGraph, ctx: &WorkflowContext, current: &str) -> Flow {
    if graph.is_terminal(current) {
        return Flow::Done;
    }
    let mut next = graph.get_next_steps(current, ctx);
    match next.len() {
        0 => Flow::Done,
        1 => Flow::Continue(next.remove(0)),
        _ => Flow::FanOut(next),
    }
}
