use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::model::graph::WorkflowGraph;
use crate::runtime::context::WorkflowContext;
use crate::steps::Step;

pub type Predicate = Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>;

/// 边上的条件
#[derive(Clone)]
pub enum Condition {
    /// Code-level predicate over the context.
    Predicate(Predicate),
    /// String expression. Pending a real expression language this is a
    /// stub that always evaluates true.
    Expr(String),
}

impl Condition {
    pub fn evaluate(&self, ctx: &WorkflowContext) -> bool {
        match self {
            Condition::Predicate(p) => p(ctx),
            Condition::Expr(expr) => {
                debug!(expr = %expr, "string edge condition treated as true (no expression language yet)");
                true
            }
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Predicate(_) => write!(f, "Condition::Predicate(..)"),
            Condition::Expr(e) => write!(f, "Condition::Expr({:?})", e),
        }
    }
}

/// 有向边：source → target，可选条件
#[derive(Debug, Clone)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub condition: Option<Condition>,
}

impl Edge {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
        }
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Condition::Predicate(Arc::new(predicate)));
        self
    }

    pub fn when_expr(mut self, expr: &str) -> Self {
        self.condition = Some(Condition::Expr(expr.to_string()));
        self
    }
}

/// 工作流蓝图 (不可变)
/// 构造一次，注册进 Registry，之后不再修改。
/// 悬空引用 (边指向不存在的步骤等) 允许构造，由 `validate()` 报告。
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    pub description: String,
    pub steps: HashMap<String, Step>,
    pub edges: Vec<Edge>,
    pub initial_step: String,
    pub terminal_steps: HashSet<String>,
}

impl WorkflowDefinition {
    pub fn builder(name: &str, version: &str) -> DefinitionBuilder {
        DefinitionBuilder::new(name, version)
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    /// 结构校验：委托给派生的 Graph。返回问题列表，空表示通过。
    pub fn validate(&self) -> Vec<String> {
        WorkflowGraph::new(self).validate()
    }

    /// validate 的错误形式：问题列表非空时返回 InvalidDefinition。
    pub fn ensure_valid(&self) -> EngineResult<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidDefinition {
                name: self.name.clone(),
                errors,
            })
        }
    }
}

/// 蓝图构建器 (声明步骤、连线、起止点)
pub struct DefinitionBuilder {
    name: String,
    version: String,
    description: String,
    steps: HashMap<String, Step>,
    edges: Vec<Edge>,
    initial_step: Option<String>,
    terminal_steps: HashSet<String>,
}

impl DefinitionBuilder {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            description: String::new(),
            steps: HashMap::new(),
            edges: Vec::new(),
            initial_step: None,
            terminal_steps: HashSet::new(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// 注册步骤。第一个注册的步骤默认为初始步骤。
    pub fn step(mut self, step: impl Into<Step>) -> Self {
        let step = step.into();
        if self.initial_step.is_none() {
            self.initial_step = Some(step.name().to_string());
        }
        self.steps.insert(step.name().to_string(), step);
        self
    }

    pub fn initial(mut self, name: &str) -> Self {
        self.initial_step = Some(name.to_string());
        self
    }

    pub fn terminal(mut self, name: &str) -> Self {
        self.terminal_steps.insert(name.to_string());
        self
    }

    pub fn edge(mut self, source: &str, target: &str) -> Self {
        self.edges.push(Edge::new(source, target));
        self
    }

    pub fn edge_if<F>(mut self, source: &str, target: &str, predicate: F) -> Self
    where
        F: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        self.edges.push(Edge::new(source, target).when(predicate));
        self
    }

    pub fn edge_expr(mut self, source: &str, target: &str, expr: &str) -> Self {
        self.edges.push(Edge::new(source, target).when_expr(expr));
        self
    }

    pub fn build(self) -> WorkflowDefinition {
        WorkflowDefinition {
            name: self.name,
            version: self.version,
            description: self.description,
            steps: self.steps,
            edges: self.edges,
            initial_step: self.initial_step.unwrap_or_default(),
            terminal_steps: self.terminal_steps,
        }
    }
}
