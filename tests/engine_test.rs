use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};
use uuid::Uuid;

use stepflow::model::definition::WorkflowDefinition;
use stepflow::runtime::engine::Engine;
use stepflow::runtime::events::{ChannelEventSink, WorkflowEvent};
use stepflow::runtime::instance::{WorkflowInstanceData, WorkflowStatus};
use stepflow::runtime::storage::{InMemoryInstanceStore, InstanceStore};
use stepflow::runtime::context::StepStatus;
use stepflow::steps::{ExclusiveGatewayStep, MachineStep, TimerStep, WebhookStep};

async fn wait_for_status(
    engine: &Arc<Engine>,
    id: Uuid,
    status: WorkflowStatus,
) -> WorkflowInstanceData {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let instance = engine.get_instance(id).await.expect("instance exists");
        if instance.status == status {
            return instance;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {:?}, last status {:?} (error: {:?})",
            status,
            instance.status,
            instance.error
        );
        sleep(Duration::from_millis(10)).await;
    }
}

fn tracker(name: &str) -> MachineStep {
    let key = format!("ran_{}", name);
    MachineStep::from_fn(name, move |ctx| {
        ctx.set(&key, json!(true));
        Ok(json!(key.clone()))
    })
}

#[tokio::test]
async fn test_linear_run_to_completion() {
    let def = WorkflowDefinition::builder("linear", "1.0.0")
        .step(tracker("a"))
        .step(tracker("b"))
        .step(tracker("c"))
        .edge("a", "b")
        .edge("b", "c")
        .terminal("c")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let id = engine
        .start_workflow("linear", None, HashMap::new())
        .await
        .expect("start");
    let instance = wait_for_status(&engine, id, WorkflowStatus::Completed).await;

    assert_eq!(instance.current_step, None);
    let history: Vec<String> = instance
        .context
        .history()
        .iter()
        .map(|e| e.step_name.clone())
        .collect();
    assert_eq!(history, vec!["a", "b", "c"]);
    for record in instance.context.history() {
        assert_eq!(record.status, StepStatus::Succeeded);
    }
}

#[tokio::test]
async fn test_events_and_persistence_on_completion() {
    let def = WorkflowDefinition::builder("evented", "1.0.0")
        .step(tracker("only"))
        .terminal("only")
        .build();

    let (sink, mut events) = ChannelEventSink::new();
    let store = Arc::new(InMemoryInstanceStore::new());
    let engine = Arc::new(
        Engine::new()
            .with_store(store.clone())
            .with_events(Arc::new(sink)),
    );
    engine.register(def);

    let id = engine
        .start_workflow("evented", None, HashMap::new())
        .await
        .expect("start");
    wait_for_status(&engine, id, WorkflowStatus::Completed).await;

    assert_eq!(
        events.recv().await,
        Some(WorkflowEvent::Started { instance_id: id })
    );
    assert_eq!(
        events.recv().await,
        Some(WorkflowEvent::Completed { instance_id: id })
    );

    let persisted = store.load_instance(id).await.unwrap().expect("persisted");
    assert_eq!(persisted.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_fail_fast_on_step_error() {
    let def = WorkflowDefinition::builder("failing", "1.0.0")
        .step(tracker("ok"))
        .step(MachineStep::from_fn("boom", |_| {
            Err(anyhow!("payment provider unavailable"))
        }))
        .step(tracker("never"))
        .edge("ok", "boom")
        .edge("boom", "never")
        .terminal("never")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let id = engine
        .start_workflow("failing", None, HashMap::new())
        .await
        .expect("start");
    let instance = wait_for_status(&engine, id, WorkflowStatus::Failed).await;

    let error = instance.error.expect("error recorded");
    assert!(error.contains("payment provider unavailable"), "{}", error);

    let history = instance.context.history();
    let failed = history.iter().find(|e| e.step_name == "boom").expect("record");
    assert_eq!(failed.status, StepStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("payment provider unavailable"));
    assert!(!history.iter().any(|e| e.step_name == "never"));
}

#[tokio::test]
async fn test_guard_skips_step_but_still_advances() {
    let def = WorkflowDefinition::builder("guarded", "1.0.0")
        .step(tracker("a"))
        .step(
            stepflow::Step::from(tracker("skipped"))
                .with_guard(|ctx| ctx.get("feature_on").is_some()),
        )
        .step(tracker("c"))
        .edge("a", "skipped")
        .edge("skipped", "c")
        .terminal("c")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let id = engine
        .start_workflow("guarded", None, HashMap::new())
        .await
        .expect("start");
    let instance = wait_for_status(&engine, id, WorkflowStatus::Completed).await;

    let history = instance.context.history();
    let skipped = history.iter().find(|e| e.step_name == "skipped").expect("record");
    assert_eq!(skipped.status, StepStatus::Skipped);
    assert!(skipped.result.is_none());
    // the step itself never ran, but the run still advanced past it
    assert_eq!(instance.context.get("ran_skipped"), None);
    assert_eq!(instance.context.get("ran_c"), Some(json!(true)));
}

#[tokio::test]
async fn test_exclusive_gateway_overrides_edge_resolution() {
    let def = WorkflowDefinition::builder("routed", "1.0.0")
        .step(ExclusiveGatewayStep::new("route", |ctx| {
            let amount = ctx.get("amount").and_then(|v| v.as_i64()).unwrap_or(0);
            if amount > 1000 {
                "review".to_string()
            } else {
                "auto".to_string()
            }
        }))
        .step(tracker("review"))
        .step(tracker("auto"))
        // edges deliberately point both ways; the gateway's selector decides
        .edge("route", "review")
        .edge("route", "auto")
        .terminal("review")
        .terminal("auto")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let id = engine
        .start_workflow("routed", None, HashMap::from([("amount".to_string(), json!(5000))]))
        .await
        .expect("start");
    let instance = wait_for_status(&engine, id, WorkflowStatus::Completed).await;

    assert_eq!(instance.context.get("ran_review"), Some(json!(true)));
    assert_eq!(instance.context.get("ran_auto"), None);
}

#[tokio::test]
async fn test_timer_step_delays_then_completes() {
    let def = WorkflowDefinition::builder("timed", "1.0.0")
        .step(TimerStep::fixed("wait", Duration::from_millis(50)))
        .step(tracker("after"))
        .edge("wait", "after")
        .terminal("after")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let started = Instant::now();
    let id = engine
        .start_workflow("timed", None, HashMap::new())
        .await
        .expect("start");
    let instance = wait_for_status(&engine, id, WorkflowStatus::Completed).await;

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(instance.context.get("ran_after"), Some(json!(true)));
}

#[tokio::test]
async fn test_timer_duration_computed_from_context() {
    let def = WorkflowDefinition::builder("ctx_timed", "1.0.0")
        .step(TimerStep::from_context("wait", |ctx| {
            let ms = ctx.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(0);
            Duration::from_millis(ms)
        }))
        .step(tracker("after"))
        .edge("wait", "after")
        .terminal("after")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let started = Instant::now();
    let id = engine
        .start_workflow(
            "ctx_timed",
            None,
            HashMap::from([("delay_ms".to_string(), json!(80))]),
        )
        .await
        .expect("start");
    let instance = wait_for_status(&engine, id, WorkflowStatus::Completed).await;

    assert!(started.elapsed() >= Duration::from_millis(80));
    assert_eq!(instance.context.get("ran_after"), Some(json!(true)));
}

#[tokio::test]
async fn test_webhook_step_consumes_present_payload() {
    let def = WorkflowDefinition::builder("hooked", "1.0.0")
        .step(WebhookStep::new("callback", "callback_payload"))
        .step(tracker("after"))
        .edge("callback", "after")
        .terminal("after")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let initial = HashMap::from([(
        "callback_payload".to_string(),
        json!({"status": "shipped"}),
    )]);
    let id = engine
        .start_workflow("hooked", None, initial)
        .await
        .expect("start");
    let instance = wait_for_status(&engine, id, WorkflowStatus::Completed).await;

    let history = instance.context.history();
    let hook = history.iter().find(|e| e.step_name == "callback").expect("record");
    assert_eq!(hook.result, Some(json!({"status": "shipped"})));
}

#[tokio::test]
async fn test_missing_step_in_definition_fails_instance() {
    let def = WorkflowDefinition::builder("dangling", "1.0.0")
        .step(tracker("a"))
        .edge("a", "ghost")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let id = engine
        .start_workflow("dangling", None, HashMap::new())
        .await
        .expect("start");
    let instance = wait_for_status(&engine, id, WorkflowStatus::Failed).await;

    let error = instance.error.unwrap();
    assert!(error.contains("step 'ghost' not found in definition 'dangling'"), "{}", error);
}

#[tokio::test]
async fn test_cancel_running_workflow() {
    let def = WorkflowDefinition::builder("cancelable", "1.0.0")
        .step(TimerStep::fixed("long_wait", Duration::from_secs(30)))
        .step(tracker("after"))
        .edge("long_wait", "after")
        .terminal("after")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let id = engine
        .start_workflow("cancelable", None, HashMap::new())
        .await
        .expect("start");
    // let the run loop reach the timer
    sleep(Duration::from_millis(50)).await;

    engine
        .cancel_workflow(id, "user requested abort")
        .await
        .expect("cancel");

    let instance = engine.get_instance(id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Canceled);
    assert!(instance.error.unwrap().contains("user requested abort"));

    // resuming a canceled instance is a precondition violation
    let result = engine
        .complete_human_task(id, "long_wait", "alice", HashMap::new())
        .await;
    assert!(matches!(result, Err(stepflow::EngineError::Precondition(_))));

    // canceling again is also rejected
    let again = engine.cancel_workflow(id, "twice").await;
    assert!(matches!(again, Err(stepflow::EngineError::Precondition(_))));
}

#[tokio::test]
async fn test_schedule_step_jumps_and_relaunches() {
    let def = WorkflowDefinition::builder("jumpable", "1.0.0")
        .step(stepflow::HumanStep::new("gate", "Manual gate"))
        .step(tracker("target"))
        .edge("gate", "target")
        .terminal("target")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let id = engine
        .start_workflow("jumpable", None, HashMap::new())
        .await
        .expect("start");
    // the run loop parks at the human gate and its task ends
    wait_for_status(&engine, id, WorkflowStatus::Waiting).await;

    // skip the gate entirely: move the instance directly to "target"
    engine
        .schedule_step(id, "target", Some(Duration::from_millis(20)))
        .expect("schedule");

    let instance = wait_for_status(&engine, id, WorkflowStatus::Completed).await;
    assert_eq!(instance.context.get("ran_target"), Some(json!(true)));
}

#[tokio::test]
async fn test_duplicate_relaunch_runs_the_step_once() {
    let def = WorkflowDefinition::builder("relaunched", "1.0.0")
        .step(stepflow::HumanStep::new("gate", "Manual gate"))
        .step(tracker("target"))
        .edge("gate", "target")
        .terminal("target")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let id = engine
        .start_workflow("relaunched", None, HashMap::new())
        .await
        .expect("start");
    wait_for_status(&engine, id, WorkflowStatus::Waiting).await;

    // two racing relaunch attempts: only one run task may actually start
    engine.schedule_step(id, "target", None).expect("first");
    engine.schedule_step(id, "target", None).expect("second");

    let instance = wait_for_status(&engine, id, WorkflowStatus::Completed).await;
    let runs = instance
        .context
        .history()
        .iter()
        .filter(|e| e.step_name == "target")
        .count();
    assert_eq!(runs, 1);
}

#[tokio::test]
async fn test_unknown_workflow_is_a_lookup_error() {
    let engine = Arc::new(Engine::new());
    let result = engine.start_workflow("nope", None, HashMap::new()).await;
    assert!(matches!(
        result,
        Err(stepflow::EngineError::WorkflowNotFound { .. })
    ));

    let result = engine.get_instance(Uuid::new_v4()).await;
    assert!(matches!(
        result,
        Err(stepflow::EngineError::InstanceNotFound(_))
    ));
}

#[tokio::test]
async fn test_get_running_instances() {
    let def = WorkflowDefinition::builder("slow", "1.0.0")
        .step(TimerStep::fixed("wait", Duration::from_secs(30)))
        .terminal("wait")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let id = engine
        .start_workflow("slow", None, HashMap::new())
        .await
        .expect("start");
    sleep(Duration::from_millis(50)).await;

    let running = engine.get_running_instances().await;
    assert!(running.iter().any(|i| i.id == id));

    engine.cancel_workflow(id, "cleanup").await.expect("cancel");
    let running = engine.get_running_instances().await;
    assert!(!running.iter().any(|i| i.id == id));
}

#[tokio::test]
async fn test_on_success_and_on_failure_hooks_fire() {
    let def = WorkflowDefinition::builder("hooks", "1.0.0")
        .step(
            stepflow::Step::from(MachineStep::from_fn("first", |_| Ok(json!("fine"))))
                .on_success(|ctx, result| {
                    ctx.set("success_hook_saw", result.clone());
                }),
        )
        .step(
            stepflow::Step::from(MachineStep::from_fn("second", |_| {
                Err(anyhow!("expected breakage"))
            }))
            .on_failure(|ctx, error| {
                ctx.set("failure_hook_saw", Value::String(error.to_string()));
            }),
        )
        .edge("first", "second")
        .terminal("second")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let id = engine
        .start_workflow("hooks", None, HashMap::new())
        .await
        .expect("start");
    let instance = wait_for_status(&engine, id, WorkflowStatus::Failed).await;

    assert_eq!(instance.context.get("success_hook_saw"), Some(json!("fine")));
    let failure = instance.context.get("failure_hook_saw").expect("failure hook ran");
    assert!(failure.as_str().unwrap().contains("expected breakage"));
}
