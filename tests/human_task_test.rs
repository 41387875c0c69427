use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

use stepflow::model::definition::WorkflowDefinition;
use stepflow::runtime::context::StepStatus;
use stepflow::runtime::engine::Engine;
use stepflow::runtime::events::{ChannelEventSink, WorkflowEvent};
use stepflow::runtime::instance::{WorkflowInstanceData, WorkflowStatus};
use stepflow::steps::{HumanStep, MachineStep};

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

fn approval_workflow() -> WorkflowDefinition {
    WorkflowDefinition::builder("approval", "1.0.0")
        .step(MachineStep::from_fn("start", |ctx| {
            ctx.set("prepared", json!(true));
            Ok(json!("prepared"))
        }))
        .step(
            HumanStep::new("approve", "Approve the request")
                .with_form_schema(json!({"fields": [{"name": "approved", "type": "boolean"}]}))
                .with_assignee_key("manager"),
        )
        .step(MachineStep::from_fn("finish", |ctx| {
            ctx.set("finished", json!(true));
            Ok(json!("finished"))
        }))
        .edge("start", "approve")
        .edge("approve", "finish")
        .terminal("finish")
        .build()
}

#[tokio::test]
async fn test_pause_resume_round_trip() {
    let (sink, mut events) = ChannelEventSink::new();
    let engine = Arc::new(Engine::new().with_events(Arc::new(sink)));
    engine.register(approval_workflow());

    let initial = HashMap::from([("manager".to_string(), json!("alice"))]);
    let id = engine
        .start_workflow("approval", None, initial)
        .await
        .expect("start");

    // the engine pauses *before* executing the human step
    let instance = wait_for_status(&engine, id, WorkflowStatus::Waiting).await;
    assert_eq!(instance.current_step.as_deref(), Some("approve"));
    // "start" ran, "approve" has no execution record yet
    let names: Vec<String> = instance
        .context
        .history()
        .iter()
        .map(|e| e.step_name.clone())
        .collect();
    assert_eq!(names, vec!["start"]);

    assert_eq!(
        events.recv().await,
        Some(WorkflowEvent::Started { instance_id: id })
    );
    assert_eq!(
        events.recv().await,
        Some(WorkflowEvent::Waiting {
            instance_id: id,
            step_name: "approve".to_string()
        })
    );

    engine
        .complete_human_task(
            id,
            "approve",
            "alice",
            HashMap::from([("approved".to_string(), json!(true))]),
        )
        .await
        .expect("complete");

    let instance = wait_for_status(&engine, id, WorkflowStatus::Completed).await;
    assert_eq!(instance.context.get("approved"), Some(json!(true)));
    assert_eq!(instance.context.get("finished"), Some(json!(true)));

    let history = instance.context.history();
    let approve = history.iter().find(|e| e.step_name == "approve").expect("record");
    assert_eq!(approve.status, StepStatus::Succeeded);
    let names: Vec<String> = history.iter().map(|e| e.step_name.clone()).collect();
    assert_eq!(names, vec!["start", "approve", "finish"]);

    assert_eq!(
        events.recv().await,
        Some(WorkflowEvent::Completed { instance_id: id })
    );
}

#[tokio::test]
async fn test_complete_wrong_step_is_rejected() {
    let engine = Arc::new(Engine::new());
    engine.register(approval_workflow());

    let id = engine
        .start_workflow("approval", None, HashMap::new())
        .await
        .expect("start");
    wait_for_status(&engine, id, WorkflowStatus::Waiting).await;

    let result = engine
        .complete_human_task(id, "finish", "alice", HashMap::new())
        .await;
    assert!(matches!(result, Err(stepflow::EngineError::Precondition(_))));

    // state was not corrupted: still waiting at the same step
    let instance = engine.get_instance(id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Waiting);
    assert_eq!(instance.current_step.as_deref(), Some("approve"));
}

#[tokio::test]
async fn test_complete_while_not_waiting_is_rejected() {
    let engine = Arc::new(Engine::new());
    engine.register(approval_workflow());

    let id = engine
        .start_workflow("approval", None, HashMap::new())
        .await
        .expect("start");
    wait_for_status(&engine, id, WorkflowStatus::Waiting).await;

    engine
        .complete_human_task(id, "approve", "bob", HashMap::new())
        .await
        .expect("first completion");
    wait_for_status(&engine, id, WorkflowStatus::Completed).await;

    // double-completion after the instance moved on
    let result = engine
        .complete_human_task(id, "approve", "bob", HashMap::new())
        .await;
    assert!(matches!(result, Err(stepflow::EngineError::Precondition(_))));
}

#[tokio::test]
async fn test_human_step_as_terminal_completes_on_completion() {
    let def = WorkflowDefinition::builder("sign_off", "1.0.0")
        .step(MachineStep::from_fn("prepare", |_| Ok(json!("ready"))))
        .step(HumanStep::new("sign", "Final sign-off"))
        .edge("prepare", "sign")
        .terminal("sign")
        .build();

    let engine = Arc::new(Engine::new());
    engine.register(def);

    let id = engine
        .start_workflow("sign_off", None, HashMap::new())
        .await
        .expect("start");
    wait_for_status(&engine, id, WorkflowStatus::Waiting).await;

    engine
        .complete_human_task(id, "sign", "carol", HashMap::new())
        .await
        .expect("complete");

    let instance = wait_for_status(&engine, id, WorkflowStatus::Completed).await;
    let names: Vec<String> = instance
        .context
        .history()
        .iter()
        .map(|e| e.step_name.clone())
        .collect();
    assert_eq!(names, vec!["prepare", "sign"]);
}

#[tokio::test]
async fn test_cancel_while_waiting() {
    let engine = Arc::new(Engine::new());
    engine.register(approval_workflow());

    let id = engine
        .start_workflow("approval", None, HashMap::new())
        .await
        .expect("start");
    wait_for_status(&engine, id, WorkflowStatus::Waiting).await;

    engine
        .cancel_workflow(id, "request withdrawn")
        .await
        .expect("cancel");

    let instance = engine.get_instance(id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Canceled);
    assert!(instance.error.unwrap().contains("request withdrawn"));

    let result = engine
        .complete_human_task(id, "approve", "alice", HashMap::new())
        .await;
    assert!(matches!(result, Err(stepflow::EngineError::Precondition(_))));
}
