use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::definition::{DefinitionBuilder, WorkflowDefinition};
use crate::steps::{
    FnHandler, HumanStep, MachineStep, ParallelGatewayStep, Step, StepHandler, StepType,
    TimerStep, WebhookStep,
};

/// Definition 的结构化持久表示 (YAML/JSON)。
/// 只覆盖结构面：步骤名和类型、边、起止点 —— 步骤逻辑是代码，
/// 机器步骤通过 handler 名称在加载时解析。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<ManifestStep>,
    #[serde(default)]
    pub edges: Vec<ManifestEdge>,
    pub initial_step: String,
    #[serde(default)]
    pub terminal_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestStep {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Machine steps: registered handler name (defaults to the step name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Human steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub form_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_key: Option<String>,
    /// Webhook steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_key: Option<String>,
    /// Timer steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Parallel gateway steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEdge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

pub fn load_manifest_from_yaml(path: impl AsRef<Path>) -> Result<DefinitionManifest> {
    let path = path.as_ref();
    let yaml_content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read YAML file from {}", path.display()))?;
    manifest_from_yaml_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", path.display()))
}

pub fn manifest_from_yaml_str(yaml: &str) -> Result<DefinitionManifest> {
    Ok(serde_yaml::from_str(yaml)?)
}

impl DefinitionManifest {
    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// 解析为可执行的 Definition。
    /// 机器步骤按 handler 名称解析；未注册的 handler 退化为 no-op，
    /// 这样纯结构工具 (validate/paths) 不需要任何代码即可工作。
    pub fn into_definition(
        self,
        handlers: &HashMap<String, Arc<dyn StepHandler>>,
    ) -> Result<WorkflowDefinition> {
        let mut builder = DefinitionBuilder::new(&self.name, &self.version)
            .description(&self.description);

        for spec in &self.steps {
            let step = build_step(spec, handlers)?;
            builder = builder.step(step);
        }

        builder = builder.initial(&self.initial_step);
        for terminal in &self.terminal_steps {
            builder = builder.terminal(terminal);
        }
        for edge in &self.edges {
            builder = match &edge.condition {
                Some(expr) => builder.edge_expr(&edge.source, &edge.target, expr),
                None => builder.edge(&edge.source, &edge.target),
            };
        }
        Ok(builder.build())
    }
}

fn build_step(
    spec: &ManifestStep,
    handlers: &HashMap<String, Arc<dyn StepHandler>>,
) -> Result<Step> {
    let step = match spec.step_type {
        StepType::Machine => {
            let handler_name = spec.handler.as_deref().unwrap_or(&spec.name);
            let handler = match handlers.get(handler_name) {
                Some(h) => h.clone(),
                None => {
                    // Structural placeholder so manifests validate without code.
                    Arc::new(FnHandler::new(handler_name, |_, _| Ok(Value::Null)))
                        as Arc<dyn StepHandler>
                }
            };
            handler.validate(&spec.params)?;
            let mut machine = MachineStep::new(&spec.name, handler).with_params(spec.params.clone());
            if let Some(output) = &spec.output {
                machine = machine.with_output(output);
            }
            machine.into()
        }
        StepType::Human => {
            let title = spec.title.as_deref().unwrap_or(&spec.name);
            let mut human = HumanStep::new(&spec.name, title)
                .with_form_schema(spec.form_schema.clone());
            if let Some(key) = &spec.assignee_key {
                human = human.with_assignee_key(key);
            }
            human.into()
        }
        StepType::Timer => {
            let millis = spec
                .duration_ms
                .ok_or_else(|| anyhow!("timer step '{}' is missing duration_ms", spec.name))?;
            TimerStep::fixed(&spec.name, Duration::from_millis(millis)).into()
        }
        StepType::Webhook => {
            let key = spec.payload_key.as_deref().unwrap_or(&spec.name);
            WebhookStep::new(&spec.name, key).into()
        }
        StepType::Gateway => {
            if spec.branches.is_empty() {
                return Err(anyhow!(
                    "gateway step '{}' needs branches (exclusive gateways carry code and cannot be loaded from a manifest)",
                    spec.name
                ));
            }
            let branches: Vec<&str> = spec.branches.iter().map(String::as_str).collect();
            ParallelGatewayStep::new(&spec.name, branches).into()
        }
    };
    Ok(step)
}

impl From<&WorkflowDefinition> for DefinitionManifest {
    /// 导出结构面。机器步骤记录 handler 名，闭包/选择器本身不可序列化。
    fn from(def: &WorkflowDefinition) -> Self {
        let mut steps: Vec<ManifestStep> = def
            .steps
            .values()
            .map(|step| {
                let mut spec = ManifestStep {
                    name: step.name().to_string(),
                    step_type: step.step_type(),
                    handler: None,
                    params: Value::Null,
                    output: None,
                    title: None,
                    form_schema: Value::Null,
                    assignee_key: None,
                    payload_key: None,
                    duration_ms: None,
                    branches: Vec::new(),
                };
                match step {
                    Step::Machine(m) => {
                        spec.handler = Some(m.handler.name().to_string());
                        spec.params = m.params.clone();
                        spec.output = m.output.clone();
                    }
                    Step::Human(h) => {
                        spec.title = Some(h.title.clone());
                        spec.form_schema = h.form_schema.clone();
                        spec.assignee_key = h.assignee_key.clone();
                    }
                    Step::Webhook(w) => {
                        spec.payload_key = Some(w.payload_key.clone());
                    }
                    Step::ParallelGateway(g) => {
                        spec.branches = g.branches.clone();
                    }
                    Step::Timer(t) => {
                        if let crate::steps::TimerDuration::Fixed(d) = &t.duration {
                            spec.duration_ms = Some(d.as_millis() as u64);
                        }
                    }
                    Step::ExclusiveGateway(_) => {}
                }
                spec
            })
            .collect();
        steps.sort_by(|a, b| a.name.cmp(&b.name));

        let mut terminal_steps: Vec<String> = def.terminal_steps.iter().cloned().collect();
        terminal_steps.sort();

        Self {
            name: def.name.clone(),
            version: def.version.clone(),
            description: def.description.clone(),
            steps,
            edges: def
                .edges
                .iter()
                .map(|e| ManifestEdge {
                    source: e.source.clone(),
                    target: e.target.clone(),
                    condition: match &e.condition {
                        Some(crate::model::definition::Condition::Expr(s)) => Some(s.clone()),
                        _ => None,
                    },
                })
                .collect(),
            initial_step: def.initial_step.clone(),
            terminal_steps,
        }
    }
}
