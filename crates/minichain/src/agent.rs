use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::errors::{AgentError, AgentResult};
use crate::function::{
    schema_return_function, typed_return_function, Function, FunctionRegistry, RETURN_FUNCTION,
};
use crate::history::History;
use crate::models::message::Message;
use crate::models::tool::FunctionSchema;
use crate::prompt_template::{load_prompt, DEFAULT_PROMPT_TEMPLATE};
use crate::providers::base::{Completion, Provider};

pub const DEFAULT_KEEP_FIRST: usize = 1;
pub const DEFAULT_KEEP_LAST: usize = 20;

/// Called right after a message is appended to a session's history
pub type MessageObserver = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Clone, Default)]
struct Observers {
    on_user: Option<MessageObserver>,
    on_assistant: Option<MessageObserver>,
    on_function: Option<MessageObserver>,
}

impl Observers {
    fn notify(&self, message: &Message) {
        let observer = match message {
            Message::System { .. } => None,
            Message::User { .. } => self.on_user.as_ref(),
            Message::Assistant { .. } => self.on_assistant.as_ref(),
            Message::Function { .. } => self.on_function.as_ref(),
        };
        if let Some(observer) = observer {
            observer(message);
        }
    }
}

/// What a finished run produced
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    /// Text content of the final assistant message
    Content(String),
    /// The payload passed to the `return` function
    Structured(Value),
}

impl AgentOutput {
    pub fn content(&self) -> Option<&str> {
        match self {
            AgentOutput::Content(content) => Some(content),
            AgentOutput::Structured(_) => None,
        }
    }

    pub fn structured(&self) -> Option<&Value> {
        match self {
            AgentOutput::Content(_) => None,
            AgentOutput::Structured(value) => Some(value),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            AgentOutput::Content(content) => Value::String(content),
            AgentOutput::Structured(value) => value,
        }
    }

    /// Deserialize a structured payload into `T`
    pub fn parse<T: DeserializeOwned>(self) -> AgentResult<T> {
        serde_json::from_value(self.into_value())
            .map_err(|e| AgentError::Internal(format!("Unexpected response shape: {}", e)))
    }
}

impl fmt::Display for AgentOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentOutput::Content(content) => write!(f, "{}", content),
            AgentOutput::Structured(value) => write!(f, "{:#}", value),
        }
    }
}

/// Drives a completion service and a set of functions until the task is answered.
///
/// An `Agent` is an immutable template; every run happens in its own [`AgentSession`].
#[derive(Clone)]
pub struct Agent {
    provider: Arc<dyn Provider>,
    functions: Arc<FunctionRegistry>,
    schemas: Arc<Vec<FunctionSchema>>,
    system_message: String,
    prompt_template: String,
    init_history: Vec<Message>,
    keep_first: usize,
    keep_last: usize,
    structured_response: bool,
    max_turns: Option<usize>,
    observers: Observers,
}

impl Agent {
    pub fn builder<S: Into<String>>(provider: Arc<dyn Provider>, system_message: S) -> AgentBuilder {
        AgentBuilder::new(provider, system_message)
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn has_structured_response(&self) -> bool {
        self.structured_response
    }

    /// A new session seeded with the system message and the initial history
    pub fn session(&self) -> AgentSession {
        let history = History::with_messages(&self.system_message, self.init_history.clone());
        AgentSession {
            agent: self.clone(),
            history,
        }
    }

    /// Run a task in a fresh session, rendering the prompt template with `arguments`
    pub async fn run<A: Serialize>(&self, arguments: &A) -> AgentResult<AgentOutput> {
        self.session().run(arguments).await
    }

    /// Run with `task` as the only template argument
    pub async fn run_task(&self, task: &str) -> AgentResult<AgentOutput> {
        self.session().run_task(task).await
    }
}

/// One conversation: the history plus the loop that grows it
pub struct AgentSession {
    agent: Agent,
    history: History,
}

impl AgentSession {
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Append the rendered task as a user message and loop until done
    pub async fn run<A: Serialize>(&mut self, arguments: &A) -> AgentResult<AgentOutput> {
        let task = load_prompt(&self.agent.prompt_template, arguments)?;
        self.append(Message::user(task));
        self.run_until_done().await
    }

    pub async fn run_task(&mut self, task: &str) -> AgentResult<AgentOutput> {
        self.run(&json!({ "task": task })).await
    }

    /// Continue the same conversation with another user message
    pub async fn follow_up<S: Into<String>>(&mut self, content: S) -> AgentResult<AgentOutput> {
        self.append(Message::user(content));
        self.run_until_done().await
    }

    fn append(&mut self, message: Message) {
        let index = self.history.push(message);
        self.agent.observers.notify(&self.history.messages()[index]);
    }

    async fn next_action(&self) -> AgentResult<Completion> {
        let window = self
            .history
            .windowed(self.agent.keep_first, self.agent.keep_last);
        debug!(
            history = self.history.len(),
            window = window.len(),
            "requesting completion"
        );

        let (completion, _usage) = self
            .agent
            .provider
            .complete(&window, &self.agent.schemas)
            .await
            .map_err(AgentError::Completion)?;

        if completion.is_empty() {
            return Err(AgentError::EmptyCompletion);
        }
        Ok(completion)
    }

    /// Complete and dispatch until the run has an answer.
    ///
    /// A `return` call whose payload validates always ends the run, and without a
    /// structured response so does the first text reply. A rejected `return` payload
    /// is fed back as a function message and costs another turn.
    async fn run_until_done(&mut self) -> AgentResult<AgentOutput> {
        let mut turns = 0;
        loop {
            if let Some(max_turns) = self.agent.max_turns {
                if turns >= max_turns {
                    return Err(AgentError::TurnLimit(max_turns));
                }
            }
            turns += 1;

            let completion = self.next_action().await?;
            let content = completion.content.clone();
            let call = completion.function_call.clone();
            self.append(completion.into_message());

            if !self.agent.structured_response {
                if let Some(content) = content {
                    return Ok(AgentOutput::Content(content));
                }
            }

            // a text-only reply while a structured response is pending asks for another turn
            let Some(call) = call else {
                continue;
            };

            let outcome = self.agent.functions.dispatch(&call).await;
            self.append(outcome.to_message());

            if call.name == RETURN_FUNCTION {
                if let Ok(value) = outcome.result {
                    return Ok(AgentOutput::Structured(value));
                }
            }
        }
    }
}

enum ResponseSpec {
    Schema(Value),
    Typed(Function),
}

pub struct AgentBuilder {
    provider: Arc<dyn Provider>,
    system_message: String,
    prompt_template: String,
    init_history: Vec<Message>,
    functions: Vec<Function>,
    keep_first: usize,
    keep_last: usize,
    response: Option<ResponseSpec>,
    max_turns: Option<usize>,
    observers: Observers,
}

impl AgentBuilder {
    pub fn new<S: Into<String>>(provider: Arc<dyn Provider>, system_message: S) -> Self {
        Self {
            provider,
            system_message: system_message.into(),
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            init_history: Vec::new(),
            functions: Vec::new(),
            keep_first: DEFAULT_KEEP_FIRST,
            keep_last: DEFAULT_KEEP_LAST,
            response: None,
            max_turns: None,
            observers: Observers::default(),
        }
    }

    pub fn function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    pub fn functions<I: IntoIterator<Item = Function>>(mut self, functions: I) -> Self {
        self.functions.extend(functions);
        self
    }

    /// A tera template rendered with the arguments of each run
    pub fn prompt_template<S: Into<String>>(mut self, template: S) -> Self {
        self.prompt_template = template.into();
        self
    }

    /// Messages placed right after the system message in every session
    pub fn init_history<I: IntoIterator<Item = Message>>(mut self, messages: I) -> Self {
        self.init_history = messages
            .into_iter()
            .filter(|message| !matches!(message, Message::System { .. }))
            .collect();
        self
    }

    pub fn keep_first(mut self, keep_first: usize) -> Self {
        self.keep_first = keep_first;
        self
    }

    pub fn keep_last(mut self, keep_last: usize) -> Self {
        self.keep_last = keep_last;
        self
    }

    /// Require a structured response described by a JSON schema
    pub fn response_schema(mut self, schema: Value) -> Self {
        self.response = Some(ResponseSpec::Schema(schema));
        self
    }

    /// Require a structured response that deserializes into `T`
    pub fn response_type<T>(mut self, schema: Value) -> Self
    where
        T: DeserializeOwned + Serialize + Send + 'static,
    {
        self.response = Some(ResponseSpec::Typed(typed_return_function::<T>(schema)));
        self
    }

    /// Give up after this many completions without a final answer
    pub fn max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn on_user_message<F: Fn(&Message) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.observers.on_user = Some(Arc::new(f));
        self
    }

    pub fn on_assistant_message<F: Fn(&Message) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.observers.on_assistant = Some(Arc::new(f));
        self
    }

    pub fn on_function_message<F: Fn(&Message) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.observers.on_function = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> AgentResult<Agent> {
        let mut registry = FunctionRegistry::new();
        for function in self.functions {
            registry.register(function)?;
        }

        let structured_response = self.response.is_some();
        if let Some(response) = self.response {
            // an explicitly registered `return` takes precedence
            if !registry.contains(RETURN_FUNCTION) {
                let function = match response {
                    ResponseSpec::Schema(schema) => schema_return_function(schema),
                    ResponseSpec::Typed(function) => function,
                };
                registry.register(function)?;
            }
        }

        Ok(Agent {
            provider: self.provider,
            schemas: Arc::new(registry.schemas()),
            functions: Arc::new(registry),
            system_message: self.system_message,
            prompt_template: self.prompt_template,
            init_history: self.init_history,
            keep_first: self.keep_first,
            keep_last: self.keep_last,
            structured_response,
            max_turns: self.max_turns,
            observers: self.observers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::role::Role;
    use crate::models::tool::FunctionCall;
    use crate::providers::mock::MockProvider;
    use anyhow::anyhow;
    use serde::Deserialize;
    use std::sync::Mutex;

    fn add_function() -> Function {
        Function::new(
            "add",
            "Add two numbers",
            json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                "required": ["a", "b"]
            }),
            |arguments| async move {
                let a = arguments.get("a").and_then(Value::as_i64).unwrap_or_default();
                let b = arguments.get("b").and_then(Value::as_i64).unwrap_or_default();
                Ok(json!(a + b))
            },
        )
    }

    fn failing_function() -> Function {
        Function::new(
            "save",
            "Save a file",
            json!({"type": "object", "properties": {}}),
            |_| async move { Err::<Value, _>(anyhow!("disk full")) },
        )
    }

    fn call(name: &str, arguments: Value) -> Completion {
        Completion::call(FunctionCall::with_value(name, arguments))
    }

    fn agent(mock: &MockProvider) -> AgentBuilder {
        Agent::builder(Arc::new(mock.clone()), "You are a helpful assistant.")
    }

    #[tokio::test]
    async fn test_run_returns_content() -> AgentResult<()> {
        let mock = MockProvider::new(vec![Completion::text("Hello!")]);
        let agent = agent(&mock)
            .prompt_template("Say hello to {{ name }}")
            .build()?;

        let mut session = agent.session();
        let output = session.run(&json!({"name": "Alice"})).await?;

        assert_eq!(output, AgentOutput::Content("Hello!".to_string()));
        let roles: Vec<Role> = session.history().iter().map(Message::role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(
            session.history().get(1).and_then(Message::content),
            Some("Say hello to Alice")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_function_result_is_fed_back() -> AgentResult<()> {
        let mock = MockProvider::new(vec![
            call("add", json!({"a": 1, "b": 2})),
            Completion::text("The answer is 3"),
        ]);
        let agent = agent(&mock).function(add_function()).build()?;

        let output = agent.run_task("What is 1 + 2?").await?;
        assert_eq!(output.content(), Some("The answer is 3"));

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].last(), Some(&Message::function("add", "3")));
        Ok(())
    }

    #[tokio::test]
    async fn test_invocation_error_is_contained() -> AgentResult<()> {
        let mock = MockProvider::new(vec![
            call("save", json!({})),
            Completion::text("Could not save the file"),
        ]);
        let agent = agent(&mock).function(failing_function()).build()?;

        let output = agent.run_task("Save it").await?;
        assert_eq!(output.content(), Some("Could not save the file"));

        let requests = mock.requests();
        let observation = requests[1].last().and_then(Message::content).unwrap();
        assert_eq!(observation, "InvocationError: disk full");
        Ok(())
    }

    #[tokio::test]
    async fn test_panicking_function_is_contained() -> AgentResult<()> {
        let mock = MockProvider::new(vec![
            call("crash", json!({})),
            Completion::text("The tool crashed"),
        ]);
        let crash = Function::new(
            "crash",
            "Crashes",
            json!({"type": "object", "properties": {}}),
            |arguments| async move {
                if arguments.is_empty() {
                    panic!("tool crashed");
                }
                Ok(Value::Null)
            },
        );
        let agent = agent(&mock).function(crash).build()?;

        let output = agent.run_task("Crash").await?;
        assert_eq!(output.content(), Some("The tool crashed"));

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].last(),
            Some(&Message::function("crash", "InvocationError: tool crashed"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_function_reports_requested_name() -> AgentResult<()> {
        let mock = MockProvider::new(vec![
            call("search", json!({"query": "rust"})),
            Completion::text("Sorry"),
        ]);
        let agent = agent(&mock).function(add_function()).build()?;

        let mut session = agent.session();
        session.run(&json!({"task": "Search"})).await?;

        let message = session.history().get(3).unwrap();
        assert_eq!(message.name(), Some("search"));
        assert_eq!(
            message.content(),
            Some("DispatchLookupError: Function 'search' does not exist")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_contained() -> AgentResult<()> {
        let mock = MockProvider::new(vec![
            Completion::call(FunctionCall::new("add", "{not json")),
            Completion::text("Retrying failed"),
        ]);
        let agent = agent(&mock).function(add_function()).build()?;

        let mut session = agent.session();
        session.run(&json!({"task": "Add"})).await?;

        let observation = session.history().get(3).and_then(Message::content).unwrap();
        assert!(observation.starts_with("DecodeError: "));
        Ok(())
    }

    #[tokio::test]
    async fn test_structured_response_with_schema() -> AgentResult<()> {
        let mock = MockProvider::new(vec![
            Completion::text("Let me think about it."),
            call("return", json!({"answer": 42, "unit": "none"})),
        ]);
        let agent = agent(&mock)
            .function(add_function())
            .response_schema(json!({
                "type": "object",
                "properties": {"answer": {"type": "integer"}, "unit": {"type": "string"}},
                "required": ["answer"]
            }))
            .build()?;

        assert!(agent.has_structured_response());
        assert!(agent.functions().contains(RETURN_FUNCTION));

        let output = agent.run_task("What is the answer?").await?;
        assert_eq!(
            output,
            AgentOutput::Structured(json!({"answer": 42, "unit": "none"}))
        );
        // the text reply did not end the run, the return call did
        assert_eq!(mock.requests().len(), 2);
        Ok(())
    }

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Answer {
        answer: i64,
    }

    #[tokio::test]
    async fn test_invalid_structured_payload_continues() -> AgentResult<()> {
        let mock = MockProvider::new(vec![
            call("return", json!({"answer": "forty-two"})),
            call("return", json!({"answer": 42})),
        ]);
        let agent = agent(&mock)
            .response_type::<Answer>(json!({
                "type": "object",
                "properties": {"answer": {"type": "integer"}},
                "required": ["answer"]
            }))
            .build()?;

        let mut session = agent.session();
        let output = session.run(&json!({"task": "Answer"})).await?;

        assert_eq!(output.parse::<Answer>()?, Answer { answer: 42 });
        let observation = session.history().get(3).and_then(Message::content).unwrap();
        assert!(observation.starts_with("InvalidParameters: "));
        Ok(())
    }

    #[tokio::test]
    async fn test_explicit_return_function_is_kept() -> AgentResult<()> {
        let mock = MockProvider::new(vec![call("return", json!({}))]);
        let custom = Function::new(
            RETURN_FUNCTION,
            "Finish",
            json!({"type": "object", "properties": {}}),
            |_| async move { Ok(json!("custom")) },
        );
        let agent = agent(&mock)
            .function(custom)
            .response_schema(json!({"type": "object"}))
            .build()?;

        assert_eq!(agent.functions().len(), 1);
        let output = agent.run_task("Finish").await?;
        assert_eq!(output, AgentOutput::Structured(json!("custom")));
        Ok(())
    }

    #[test]
    fn test_empty_completion_is_an_error() -> AgentResult<()> {
        let mock = MockProvider::new(vec![Completion::default()]);
        let agent = agent(&mock).build()?;

        let error = tokio_test::block_on(agent.run_task("Hi")).unwrap_err();
        assert!(matches!(error, AgentError::EmptyCompletion));
        Ok(())
    }

    #[tokio::test]
    async fn test_completion_failure_aborts_run() -> AgentResult<()> {
        let mock = MockProvider::new(vec![]);
        let agent = agent(&mock).build()?;

        let error = agent.run_task("Hi").await.unwrap_err();
        assert!(matches!(error, AgentError::Completion(_)));
        assert!(error.to_string().contains("no more scripted completions"));
        Ok(())
    }

    #[tokio::test]
    async fn test_follow_up_reuses_history() -> AgentResult<()> {
        let mock = MockProvider::new(vec![
            Completion::text("Paris"),
            Completion::text("About two million"),
        ]);
        let agent = agent(&mock).build()?;

        let mut session = agent.session();
        session.run_task("What is the capital of France?").await?;
        let output = session.follow_up("How many people live there?").await?;

        assert_eq!(output.content(), Some("About two million"));
        assert_eq!(session.history().len(), 5);
        let second = &mock.requests()[1];
        assert_eq!(second.len(), 4);
        assert_eq!(second[2], Message::assistant("Paris"));
        Ok(())
    }

    #[tokio::test]
    async fn test_each_run_gets_a_fresh_session() -> AgentResult<()> {
        let mock = MockProvider::new(vec![Completion::text("one"), Completion::text("two")]);
        let agent = agent(&mock).build()?;

        agent.run_task("first").await?;
        agent.run_task("second").await?;

        let requests = mock.requests();
        assert_eq!(requests[1].len(), 2);
        assert_eq!(requests[1][1], Message::user("second"));
        Ok(())
    }

    #[tokio::test]
    async fn test_init_history_follows_system_message() -> AgentResult<()> {
        let mock = MockProvider::new(vec![Completion::text("ok")]);
        let agent = agent(&mock)
            .init_history(vec![
                Message::user("Remember: be brief."),
                Message::assistant("Understood."),
            ])
            .build()?;

        agent.run_task("Go").await?;
        let request = &mock.requests()[0];
        assert_eq!(request.len(), 4);
        assert_eq!(request[1], Message::user("Remember: be brief."));
        assert_eq!(request[3], Message::user("Go"));
        Ok(())
    }

    #[tokio::test]
    async fn test_window_drops_middle_messages() -> AgentResult<()> {
        let mut script: Vec<Completion> = (0..3)
            .map(|i| call("add", json!({"a": i, "b": 1})))
            .collect();
        script.push(Completion::text("done"));
        let mock = MockProvider::new(script);
        let agent = agent(&mock)
            .function(add_function())
            .keep_first(1)
            .keep_last(2)
            .build()?;

        agent.run_task("Count").await?;

        // the last request sees system, task and the two freshest messages only
        let last = mock.requests().pop().unwrap();
        assert_eq!(
            last,
            vec![
                Message::system("You are a helpful assistant."),
                Message::user("Count"),
                Message::function_call(FunctionCall::with_value("add", json!({"a": 2, "b": 1}))),
                Message::function("add", "3"),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_observers_see_every_append() -> AgentResult<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mock = MockProvider::new(vec![
            call("add", json!({"a": 1, "b": 1})),
            Completion::text("2"),
        ]);

        let (user, assistant, function) = (seen.clone(), seen.clone(), seen.clone());
        let agent = agent(&mock)
            .function(add_function())
            .on_user_message(move |m| user.lock().unwrap().push(m.role()))
            .on_assistant_message(move |m| assistant.lock().unwrap().push(m.role()))
            .on_function_message(move |m| function.lock().unwrap().push(m.role()))
            .build()?;

        agent.run_task("1 + 1").await?;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Role::User, Role::Assistant, Role::Function, Role::Assistant]
        );
        Ok(())
    }

    #[test]
    fn test_duplicate_functions_are_rejected() {
        let mock = MockProvider::new(vec![]);
        let result = agent(&mock)
            .function(add_function())
            .function(add_function())
            .build();
        assert!(matches!(result, Err(AgentError::DuplicateFunction(name)) if name == "add"));
    }

    #[tokio::test]
    async fn test_turn_limit() -> AgentResult<()> {
        let mock = MockProvider::new(vec![
            Completion::text("thinking"),
            Completion::text("still thinking"),
            Completion::text("never requested"),
        ]);
        let agent = agent(&mock)
            .response_schema(json!({"type": "object"}))
            .max_turns(2)
            .build()?;

        let error = agent.run_task("Decide").await.unwrap_err();
        assert!(matches!(error, AgentError::TurnLimit(2)));
        assert_eq!(mock.requests().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_template_error() -> AgentResult<()> {
        let mock = MockProvider::new(vec![]);
        let agent = agent(&mock).prompt_template("{{ missing }}").build()?;

        let error = agent.run_task("ignored").await.unwrap_err();
        assert!(matches!(error, AgentError::Template(_)));
        assert!(mock.requests().is_empty());
        Ok(())
    }
}
