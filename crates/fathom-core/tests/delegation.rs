use std::sync::{Arc, Mutex};
use std::time::Duration;

use fathom_core::test_utils::{ScriptedModel, ScriptedTurn};
use fathom_core::tools::{ToolContext, handler_fn};
use fathom_core::{
    Agent, ConfigurationError, DelegateTool, DelegationBridge, DependencyBundle, RunConfig,
    TransportError, UnitCounts,
};
use fathom_tools::{ExecutionMode, InputSchema, ToolCall, ToolError, ToolResult, ToolSchema};
use serde::Deserialize;
use serde_json::{Value, json};

/// Dependencies of the calling agent.
struct Workspace {
    owner: String,
}

impl DependencyBundle for Workspace {}

/// Dependencies of the nested agent. Never shared with the caller.
struct Mailbox {
    address: String,
    seen: Arc<Mutex<Vec<String>>>,
}

impl DependencyBundle for Mailbox {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.address.is_empty() {
            return Err(ConfigurationError::dependencies("address is empty"));
        }
        Ok(())
    }
}

#[derive(Deserialize, schemars::JsonSchema)]
struct DraftEmail {
    /// What the email should say.
    topic: String,
}

fn email_agent(model: Arc<ScriptedModel>) -> Agent<Mailbox> {
    Agent::builder("email", model)
        .register(
            ToolSchema {
                name: "whoami".to_string(),
                description: "Sender address".to_string(),
                input_schema: InputSchema::empty(),
            },
            handler_fn(|_args: Value, ctx: ToolContext<Mailbox>| async move {
                let address = ctx.deps().address.clone();
                ctx.deps()
                    .seen
                    .lock()
                    .unwrap()
                    .push(address.clone());
                Ok(ToolResult::Output(json!(address)))
            }),
            ExecutionMode::Blocking,
        )
        .build()
        .unwrap()
}

fn research_agent(
    model: Arc<ScriptedModel>,
    email: Agent<Mailbox>,
    seen: Arc<Mutex<Vec<String>>>,
) -> Agent<Workspace> {
    let delegate = DelegateTool::<Mailbox, DraftEmail, _>::new(
        "draft_email",
        "Ask the email agent to draft a message",
        DelegationBridge::new(email),
        move |params: DraftEmail, ctx: &ToolContext<Workspace>| {
            let address = if params.topic == "nobody" {
                String::new()
            } else {
                format!("{}@example.com", ctx.deps().owner)
            };
            Ok::<_, ToolError>((
                format!("Draft an email about {}", params.topic),
                Arc::new(Mailbox {
                    address,
                    seen: Arc::clone(&seen),
                }),
            ))
        },
    );
    let schema = delegate.schema();
    Agent::builder("research", model)
        .register(schema, delegate, ExecutionMode::Blocking)
        .build()
        .unwrap()
}

fn delegate_call(topic: &str) -> ScriptedTurn {
    ScriptedTurn::tool_calls(
        vec![ToolCall::new(
            "d1",
            "draft_email",
            json!({ "topic": topic }),
        )],
        UnitCounts::from_parts(10, 2),
    )
}

fn workspace() -> Arc<Workspace> {
    Arc::new(Workspace {
        owner: "ada".to_string(),
    })
}

#[tokio::test]
async fn nested_usage_is_merged_once_and_output_returned() {
    let nested = ScriptedModel::shared([
        ScriptedTurn::text_with_usage("Dear team, the report is ready.", UnitCounts::from_parts(3, 5)),
    ]);
    let parent = ScriptedModel::shared([delegate_call("the report"), ScriptedTurn::text("Sent.")]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let agent = research_agent(Arc::clone(&parent), email_agent(Arc::clone(&nested)), seen);

    let result = agent.run("Tell the team", workspace()).await.unwrap();

    assert_eq!(result.output.text, "Sent.");
    assert_eq!(result.usage.totals, UnitCounts::from_parts(13, 7));
    assert_eq!(result.usage.total_units(), 20);
    assert_eq!(result.usage.agent("research"), UnitCounts::from_parts(10, 2));
    assert_eq!(result.usage.agent("email"), UnitCounts::from_parts(3, 5));

    let nested_requests = nested.requests();
    assert_eq!(nested_requests.len(), 1);
    assert_eq!(
        nested_requests[0].messages[0].extract_text(),
        "Draft an email about the report"
    );

    let parent_requests = parent.requests();
    assert_eq!(
        parent_requests[1].messages[2].extract_text(),
        "Dear team, the report is ready."
    );
}

#[tokio::test]
async fn nested_agent_sees_only_its_own_dependencies() {
    let nested = ScriptedModel::shared([
        ScriptedTurn::tool_calls(
            vec![ToolCall::new("w1", "whoami", json!({}))],
            UnitCounts::default(),
        ),
        ScriptedTurn::text("Signed."),
    ]);
    let parent = ScriptedModel::shared([delegate_call("lunch"), ScriptedTurn::text("Done.")]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let agent = research_agent(
        Arc::clone(&parent),
        email_agent(nested),
        Arc::clone(&seen),
    );

    let result = agent.run("Invite everyone", workspace()).await.unwrap();

    assert_eq!(result.output.text, "Done.");
    assert_eq!(*seen.lock().unwrap(), vec!["ada@example.com".to_string()]);
    // The nested history never leaks into the caller's conversation.
    assert_eq!(result.history.len(), 4);
    assert_eq!(parent.requests()[1].messages[2].extract_text(), "Signed.");
}

#[tokio::test]
async fn nested_failure_becomes_a_tool_error_and_keeps_partial_usage() {
    let nested = ScriptedModel::shared([
        ScriptedTurn::tool_calls(
            vec![ToolCall::new("x1", "missing_tool", json!({}))],
            UnitCounts::from_parts(4, 1),
        ),
        ScriptedTurn::FailToStart(TransportError::unauthorized("scripted", "bad key")),
    ]);
    let parent = ScriptedModel::shared([
        delegate_call("quarterly numbers"),
        ScriptedTurn::text("I could not send the email."),
    ]);
    let agent = research_agent(
        Arc::clone(&parent),
        email_agent(nested),
        Arc::new(Mutex::new(Vec::new())),
    );

    let result = agent.run("Email finance", workspace()).await.unwrap();

    assert_eq!(result.output.text, "I could not send the email.");
    assert_eq!(result.usage.agent("email"), UnitCounts::from_parts(4, 1));
    assert_eq!(result.usage.totals, UnitCounts::from_parts(14, 3));

    let requests = parent.requests();
    let tool_message = requests[1].messages[2].extract_text();
    assert!(tool_message.starts_with("Error: "), "{tool_message}");
    assert!(tool_message.contains("email"), "{tool_message}");
}

#[tokio::test]
async fn rejected_nested_dependencies_become_a_tool_error() {
    let nested = ScriptedModel::shared([ScriptedTurn::text("unused")]);
    let parent = ScriptedModel::shared([delegate_call("nobody"), ScriptedTurn::text("Skipped.")]);
    let agent = research_agent(
        Arc::clone(&parent),
        email_agent(Arc::clone(&nested)),
        Arc::new(Mutex::new(Vec::new())),
    );

    let result = agent.run("Email nobody", workspace()).await.unwrap();

    assert_eq!(result.output.text, "Skipped.");
    assert_eq!(nested.request_count(), 0);
    assert_eq!(result.usage.agent("email"), UnitCounts::default());

    let requests = parent.requests();
    let tool_message = requests[1].messages[2].extract_text();
    assert!(tool_message.contains("address is empty"), "{tool_message}");
}

fn slow_email_agent(model: Arc<ScriptedModel>) -> Agent<Mailbox> {
    Agent::builder("email", model)
        .config(RunConfig {
            tool_timeout_secs: None,
            ..RunConfig::default()
        })
        .register(
            ToolSchema {
                name: "archive_search".to_string(),
                description: "Search old mail".to_string(),
                input_schema: InputSchema::empty(),
            },
            handler_fn(|_args: Value, _ctx: ToolContext<Mailbox>| async move {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(ToolResult::Output(json!("found nothing")))
            }),
            ExecutionMode::Blocking,
        )
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn nested_usage_survives_the_parent_tool_timeout() {
    let nested = ScriptedModel::shared([
        ScriptedTurn::tool_calls(
            vec![ToolCall::new("s1", "archive_search", json!({}))],
            UnitCounts::from_parts(3, 5),
        ),
        ScriptedTurn::text("never reached"),
    ]);
    let parent = ScriptedModel::shared([
        delegate_call("old invoices"),
        ScriptedTurn::text("The email agent took too long."),
    ]);
    let agent = research_agent(
        Arc::clone(&parent),
        slow_email_agent(Arc::clone(&nested)),
        Arc::new(Mutex::new(Vec::new())),
    );

    let result = agent.run("Find invoices", workspace()).await.unwrap();

    assert_eq!(result.output.text, "The email agent took too long.");
    assert_eq!(nested.request_count(), 1);
    assert_eq!(result.usage.agent("research"), UnitCounts::from_parts(10, 2));
    assert_eq!(result.usage.agent("email"), UnitCounts::from_parts(3, 5));
    assert_eq!(result.usage.totals, UnitCounts::from_parts(13, 7));

    let requests = parent.requests();
    let tool_message = requests[1].messages[2].extract_text();
    assert!(tool_message.contains("timed out"), "{tool_message}");
}

#[tokio::test]
async fn delegation_error_names_the_nested_agent() {
    let err = ToolError::Delegation {
        agent: "email".to_string(),
        message: "boom".to_string(),
    };
    let rendered = ToolResult::from(err).llm_format();
    assert!(rendered.starts_with("Error: "));
    assert!(rendered.contains("email"));
}
