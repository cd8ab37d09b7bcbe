use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fathom_core::test_utils::{ScriptedModel, ScriptedTurn};
use fathom_core::tools::{Tool, ToolContext, handler_fn};
use fathom_core::{
    Agent, DependencyBundle, Event, Node, RunConfig, RunFailure, RunSession, UnitCounts,
};
use fathom_tools::{ExecutionMode, InputSchema, ToolCall, ToolError, ToolResult, ToolSchema};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Barrier, mpsc};

/// Shared recorder the handlers report into.
#[derive(Default)]
struct Recorder {
    log: Mutex<Vec<String>>,
    invocations: AtomicUsize,
}

impl Recorder {
    fn push(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl DependencyBundle for Recorder {}

fn schema(name: &str) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: format!("{name} tool"),
        input_schema: InputSchema::empty(),
    }
}

async fn advance_to_tool_node<D: DependencyBundle>(session: &mut RunSession<D>) -> Node {
    loop {
        let node = session.advance().await.unwrap();
        if matches!(node, Node::ToolCall { .. }) {
            return node;
        }
        assert!(!node.is_end(), "session ended before dispatch: {node:?}");
    }
}

#[derive(Deserialize, schemars::JsonSchema)]
struct SearchParams {
    query: String,
}

struct Search;

#[async_trait::async_trait]
impl Tool<Recorder> for Search {
    type Params = SearchParams;
    type Output = String;

    const NAME: &'static str = "search";
    const DESCRIPTION: &'static str = "Search the web";

    async fn execute(&self, params: SearchParams, ctx: &ToolContext<Recorder>) -> Result<String, ToolError> {
        ctx.deps().invocations.fetch_add(1, Ordering::SeqCst);
        Ok(format!("results for {}", params.query))
    }
}

#[tokio::test]
async fn missing_required_field_lists_the_field() {
    let model = ScriptedModel::shared([
        ScriptedTurn::tool_calls(
            vec![ToolCall::new("c1", "search", json!({}))],
            UnitCounts::default(),
        ),
        ScriptedTurn::text("ok"),
    ]);
    let agent: Agent<Recorder> = Agent::builder("research", model).tool(Search).build().unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut session = agent.start("Search", Arc::clone(&recorder)).unwrap();

    let node = advance_to_tool_node(&mut session).await;
    let events: Vec<Event> = session.open_stream(&node).unwrap().collect().await;

    let completed = events
        .iter()
        .find_map(|e| match e {
            Event::ToolCallCompleted { call_id, result } if call_id == "c1" => Some(result),
            _ => None,
        })
        .expect("c1 should complete");
    let error = completed.error().expect("validation error");
    assert!(matches!(error, ToolError::Validation { .. }));
    assert_eq!(error.invalid_fields(), vec!["query"]);
    assert_eq!(recorder.invocations.load(Ordering::SeqCst), 0);

    let end = session.run_to_end().await.unwrap();
    assert_eq!(end.text, "ok");
}

#[tokio::test]
async fn call_ids_are_invoked_at_most_once() {
    let model = ScriptedModel::shared([
        ScriptedTurn::tool_calls(
            vec![
                ToolCall::new("same", "search", json!({"query": "a"})),
                ToolCall::new("same", "search", json!({"query": "b"})),
            ],
            UnitCounts::default(),
        ),
        ScriptedTurn::tool_calls(
            vec![ToolCall::new("same", "search", json!({"query": "c"}))],
            UnitCounts::default(),
        ),
        ScriptedTurn::text("done"),
    ]);
    let agent: Agent<Recorder> = Agent::builder("research", model).tool(Search).build().unwrap();
    let recorder = Arc::new(Recorder::default());

    let result = agent.run("Search twice", Arc::clone(&recorder)).await.unwrap();

    assert_eq!(result.output.text, "done");
    assert_eq!(recorder.invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn blocking_calls_run_one_after_another() {
    let model = ScriptedModel::shared([
        ScriptedTurn::tool_calls(
            vec![
                ToolCall::new("1", "step", json!({})),
                ToolCall::new("2", "step", json!({})),
            ],
            UnitCounts::default(),
        ),
        ScriptedTurn::text("done"),
    ]);
    let agent: Agent<Recorder> = Agent::builder("sequential", model)
        .register(
            schema("step"),
            handler_fn(|_args: Value, ctx: ToolContext<Recorder>| async move {
                ctx.deps().push(format!("start {}", ctx.call_id));
                tokio::time::sleep(Duration::from_millis(20)).await;
                ctx.deps().push(format!("end {}", ctx.call_id));
                Ok(ToolResult::Output(Value::Null))
            }),
            ExecutionMode::Blocking,
        )
        .build()
        .unwrap();
    let recorder = Arc::new(Recorder::default());

    agent.run("Go", Arc::clone(&recorder)).await.unwrap();

    assert_eq!(recorder.log(), vec!["start 1", "end 1", "start 2", "end 2"]);
}

#[tokio::test]
async fn non_blocking_calls_run_concurrently() {
    let barrier = Arc::new(Barrier::new(3));
    let model = ScriptedModel::shared([
        ScriptedTurn::tool_calls(
            (1..=3)
                .map(|i| ToolCall::new(i.to_string(), "rendezvous", json!({})))
                .collect(),
            UnitCounts::default(),
        ),
        ScriptedTurn::text("met"),
    ]);
    let tool_barrier = Arc::clone(&barrier);
    let agent: Agent<Recorder> = Agent::builder("parallel", Arc::clone(&model) as Arc<dyn fathom_core::Provider>)
        .config(RunConfig {
            tool_timeout_secs: Some(5),
            ..RunConfig::default()
        })
        .register(
            schema("rendezvous"),
            handler_fn(move |_args: Value, _ctx: ToolContext<Recorder>| {
                let barrier = Arc::clone(&tool_barrier);
                async move {
                    // Only returns once all three calls are in flight.
                    barrier.wait().await;
                    Ok(ToolResult::Output(json!("arrived")))
                }
            }),
            ExecutionMode::NonBlocking,
        )
        .build()
        .unwrap();

    let result = agent.run("Meet", Arc::new(Recorder::default())).await.unwrap();

    assert_eq!(result.output.text, "met");
    let requests = model.requests();
    let tool_messages: Vec<String> = requests[1].messages[2..]
        .iter()
        .map(fathom_core::conversation::Message::extract_text)
        .collect();
    assert_eq!(tool_messages, vec!["arrived"; 3]);
}

struct Started {
    tx: mpsc::UnboundedSender<String>,
}

impl DependencyBundle for Started {}

#[tokio::test]
async fn cancelled_tool_stage_releases_permits_and_emits_no_completion() {
    let model = ScriptedModel::shared([ScriptedTurn::tool_calls(
        vec![
            ToolCall::new("h1", "hang", json!({})),
            ToolCall::new("h2", "hang", json!({})),
        ],
        UnitCounts::default(),
    )]);
    let agent: Agent<Started> = Agent::builder("hanging", model)
        .config(RunConfig {
            max_concurrent_tools: 2,
            tool_timeout_secs: None,
            ..RunConfig::default()
        })
        .register(
            schema("hang"),
            handler_fn(|_args: Value, ctx: ToolContext<Started>| async move {
                let _ = ctx.deps().tx.send(ctx.call_id.clone());
                futures::future::pending::<()>().await;
                Ok(ToolResult::Output(Value::Null))
            }),
            ExecutionMode::NonBlocking,
        )
        .build()
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = agent.start("Hang", Arc::new(Started { tx })).unwrap();
    let node = advance_to_tool_node(&mut session).await;
    let mut stream = session.open_stream(&node).unwrap();

    let mut events = Vec::new();
    events.push(stream.next().await.unwrap());
    events.push(stream.next().await.unwrap());
    // Keep polling until both handlers have started.
    let mut started = Vec::new();
    while started.len() < 2 {
        tokio::select! {
            event = stream.next() => events.extend(event),
            id = rx.recv() => started.extend(id),
        }
    }
    assert_eq!(session.available_tool_permits(), 0);

    stream.cancel();
    assert!(stream.next().await.is_none());
    drop(stream);

    let mut released = false;
    for _ in 0..100 {
        if session.available_tool_permits() == 2 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(released, "permits were not returned");

    assert!(
        events
            .iter()
            .all(|e| !matches!(e, Event::ToolCallCompleted { .. }))
    );
    let end = session.advance().await.unwrap();
    assert_eq!(
        end,
        Node::End {
            result: Err(RunFailure::Cancelled)
        }
    );
}
