use anyhow::Result;
use async_trait::async_trait;
use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, eval_with_context};
use serde_json::{Value, json};
use tracing::{error, info};

use crate::runtime::context::WorkflowContext;
use crate::steps::StepHandler;

/// 内置日志步骤
pub struct LogHandler;

#[async_trait]
impl StepHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn execute(&self, params: Value, ctx: &WorkflowContext) -> Result<Value> {
        if let Some(msg) = params.get("msg").and_then(|v| v.as_str()) {
            info!(instance_id = %ctx.instance_id, step = %ctx.current_step, "[LOG] {}", msg);
        } else {
            info!(instance_id = %ctx.instance_id, step = %ctx.current_step, "[LOG] {:?}", params);
        }
        Ok(Value::Null)
    }
}

/// 内置赋值步骤
/// 支持三种形式：
///   assignments: [{key, value}, ...]  直接写入
///   expression: "x = a + b"           evalexpr 表达式 (左侧可省略)
///   value: <json>                     作为步骤结果返回
pub struct AssignHandler;

#[async_trait]
impl StepHandler for AssignHandler {
    fn name(&self) -> &str {
        "assign"
    }

    async fn execute(&self, params: Value, ctx: &WorkflowContext) -> Result<Value> {
        // 1. Handle "assignments" list
        if let Some(list) = params.get("assignments").and_then(|v| v.as_array()) {
            for item in list {
                if let (Some(k), Some(v)) = (item.get("key").and_then(|s| s.as_str()), item.get("value")) {
                    ctx.set(k, v.clone());
                }
            }
        }

        // 2. Handle "expression"
        if let Some(expr) = params.get("expression").and_then(|v| v.as_str()) {
            // Simple parsing for "var = expr"
            let (target_var, rhs) = if let Some((left, right)) = expr.split_once('=') {
                (Some(left.trim()), right.trim())
            } else {
                (None, expr)
            };

            let eval_ctx = build_eval_context(ctx);
            match eval_with_context(rhs, &eval_ctx) {
                Ok(result) => {
                    let json_val = match result {
                        evalexpr::Value::String(s) => Some(Value::String(s)),
                        evalexpr::Value::Int(i) => Some(json!(i)),
                        evalexpr::Value::Float(f) => Some(json!(f)),
                        evalexpr::Value::Boolean(b) => Some(Value::Bool(b)),
                        _ => None,
                    };

                    if let Some(jv) = json_val {
                        if let Some(var_name) = target_var {
                            ctx.set(var_name, jv);
                        } else if params.get("value").is_none() {
                            return Ok(jv);
                        }
                    }
                }
                Err(e) => error!("Expression evaluation failed: {} -> {}", rhs, e),
            }
        }

        // 3. Handle "value"
        if let Some(val) = params.get("value") {
            Ok(val.clone())
        } else {
            Ok(Value::Null)
        }
    }
}

fn build_eval_context(ctx: &WorkflowContext) -> HashMapContext<DefaultNumericTypes> {
    let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (k, v) in ctx.data_snapshot() {
        let ev = match v {
            Value::String(s) => Some(evalexpr::Value::String(s)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(evalexpr::Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Some(evalexpr::Value::Float(f))
                } else {
                    None
                }
            }
            Value::Bool(b) => Some(evalexpr::Value::Boolean(b)),
            _ => None,
        };
        if let Some(ev) = ev {
            let _ = eval_ctx.set_value(k, ev);
        }
    }
    eval_ctx
}
