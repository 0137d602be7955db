use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use minichain::agent::{Agent, AgentOutput};
use minichain::cache::DiskCache;
use minichain::models::message::Message;
use minichain::models::tool::{FunctionCall, FunctionSchema};
use minichain::providers::base::{Completion, Provider, Usage};
use minichain::providers::cached::CachedProvider;
use minichain::providers::configs::OpenAiProviderConfig;
use minichain::providers::openai::OpenAiProvider;
use minichain::sandbox::{BashSession, HostShellBackend};

/// Replays a fixed script of completions
#[derive(Clone)]
struct ScriptedProvider {
    script: Arc<Mutex<Vec<Completion>>>,
    calls: Arc<Mutex<usize>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Completion>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(
        &self,
        _messages: &[Message],
        _functions: &[FunctionSchema],
    ) -> Result<(Completion, Usage)> {
        *self.calls.lock().unwrap() += 1;
        let mut script = self.script.lock().unwrap();
        anyhow::ensure!(!script.is_empty(), "script exhausted");
        Ok((script.remove(0), Usage::default()))
    }
}

fn bash_call(commands: &[&str]) -> Completion {
    Completion::call(FunctionCall::with_value(
        "bash",
        json!({ "commands": commands }),
    ))
}

#[tokio::test]
async fn test_bash_agent_keeps_directory_between_calls() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let bash = Arc::new(BashSession::new(Arc::new(HostShellBackend::new(dir.path()))));

    let provider = ScriptedProvider::new(vec![
        bash_call(&["mkdir project", "cd project", "echo hello > notes.txt"]),
        bash_call(&["pwd", "cat notes.txt"]),
        Completion::text("Created project/notes.txt"),
    ]);
    let agent = Agent::builder(Arc::new(provider.clone()), "You are a shell assistant.")
        .function(bash.function())
        .build()?;

    let mut session = agent.session();
    let output = session.run_task("Create a notes file in a new project").await?;
    assert_eq!(output.content(), Some("Created project/notes.txt"));

    // system, user, call, result, call, result, answer
    let history = session.history();
    assert_eq!(history.len(), 7);
    let listing = history.get(5).and_then(Message::content).unwrap();
    let mut lines = listing.lines();
    assert!(lines.next().unwrap().ends_with("/project"));
    assert_eq!(lines.next(), Some("hello"));

    assert_eq!(provider.calls(), 3);
    assert!(dir.path().join("project/notes.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_structured_agent_collects_shell_output() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("a.txt"), "")?;
    std::fs::write(dir.path().join("b.txt"), "")?;
    let bash = Arc::new(BashSession::new(Arc::new(HostShellBackend::new(dir.path()))));

    let provider = ScriptedProvider::new(vec![
        bash_call(&["ls *.txt | wc -l"]),
        Completion::text("There are two files, returning now."),
        Completion::call(FunctionCall::with_value("return", json!({"count": 2}))),
    ]);
    let agent = Agent::builder(Arc::new(provider), "Count files.")
        .function(bash.function())
        .response_schema(json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}},
            "required": ["count"]
        }))
        .build()?;

    let output = agent.run_task("How many text files are there?").await?;
    assert_eq!(output, AgentOutput::Structured(json!({"count": 2})));
    Ok(())
}

#[tokio::test]
async fn test_openai_agent_round_trip() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "function_call": {"name": "add", "arguments": "{\"a\": 2, \"b\": 3}"}
                }
            }],
            "usage": {"prompt_tokens": 30, "completion_tokens": 10, "total_tokens": 40}
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "2 + 3 = 5"}}]
        })))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(OpenAiProviderConfig {
        host: server.uri(),
        ..OpenAiProviderConfig::new("test_api_key")
    })?;
    let add = minichain::function::Function::new(
        "add",
        "Add two integers",
        json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
            "required": ["a", "b"]
        }),
        |arguments| async move {
            let sum: i64 = ["a", "b"]
                .iter()
                .filter_map(|key| arguments.get(*key).and_then(Value::as_i64))
                .sum();
            Ok(json!(sum))
        },
    );
    let agent = Agent::builder(Arc::new(provider), "You are a calculator.")
        .function(add)
        .build()?;

    let output = agent.run_task("What is 2 + 3?").await?;
    assert_eq!(output.content(), Some("2 + 3 = 5"));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let second: Value = serde_json::from_slice(&requests[1].body)?;
    let messages = second["messages"].as_array().unwrap();
    assert_eq!(
        messages.last().unwrap(),
        &json!({"role": "function", "name": "add", "content": "5"})
    );
    assert_eq!(second["functions"][0]["name"], "add");
    Ok(())
}

#[tokio::test]
async fn test_cached_provider_replays_a_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = DiskCache::open(dir.path())?;

    let first = ScriptedProvider::new(vec![Completion::text("cached answer")]);
    let agent = Agent::builder(
        Arc::new(CachedProvider::new(first.clone(), cache.clone(), "test")),
        "system",
    )
    .build()?;
    agent.run_task("question").await?;

    // an exhausted provider still answers the same conversation from disk
    let second = ScriptedProvider::new(vec![]);
    let agent = Agent::builder(
        Arc::new(CachedProvider::new(second.clone(), cache, "test")),
        "system",
    )
    .build()?;
    let output = agent.run_task("question").await?;

    assert_eq!(output.content(), Some("cached answer"));
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 0);
    Ok(())
}
