use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{AgentError, AgentResult, FunctionError};
use crate::models::message::Message;
use crate::models::tool::{FunctionCall, FunctionSchema};

/// Name of the function that ends a structured-response run
pub const RETURN_FUNCTION: &str = "return";

type Handler =
    Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value, FunctionError>> + Send + Sync>;

/// How the raw keyword arguments reach the callable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentShape {
    /// The decoded argument map is passed through as is
    Keyword,
    /// The arguments are coerced into a typed value before the call
    Structured,
}

/// A named capability the model may invoke.
#[derive(Clone)]
pub struct Function {
    schema: FunctionSchema,
    shape: ArgumentShape,
    handler: Handler,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.schema.name)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

impl Function {
    /// A function receiving the decoded keyword arguments
    pub fn new<N, D, F, Fut>(name: N, description: D, parameters: Value, function: F) -> Self
    where
        N: Into<String>,
        D: Into<String>,
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            schema: FunctionSchema::new(name, description, parameters),
            shape: ArgumentShape::Keyword,
            handler: keyword_handler(function),
        }
    }

    /// A function receiving a single typed argument built from the keyword arguments.
    ///
    /// Arguments that do not deserialize into `T` are reported as invalid parameters
    /// without calling `function`.
    pub fn structured<N, D, T, R, F, Fut>(
        name: N,
        description: D,
        parameters: Value,
        function: F,
    ) -> Self
    where
        N: Into<String>,
        D: Into<String>,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self {
            schema: FunctionSchema::new(name, description, parameters),
            shape: ArgumentShape::Structured,
            handler: structured_handler(function),
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn description(&self) -> &str {
        &self.schema.description
    }

    pub fn shape(&self) -> ArgumentShape {
        self.shape
    }

    pub fn schema(&self) -> &FunctionSchema {
        &self.schema
    }

    /// Call the function with decoded keyword arguments.
    ///
    /// A panicking callable is reported as an execution error.
    pub async fn invoke(&self, arguments: Map<String, Value>) -> Result<Value, FunctionError> {
        match AssertUnwindSafe((self.handler)(arguments)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(FunctionError::Execution(panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "function panicked".to_string()
    }
}

fn keyword_handler<F, Fut>(function: F) -> Handler
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    let function = Arc::new(function);
    Arc::new(move |arguments| {
        let function = function.clone();
        Box::pin(async move { function(arguments).await.map_err(FunctionError::from_anyhow) })
    })
}

fn structured_handler<T, R, F, Fut>(function: F) -> Handler
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let function = Arc::new(function);
    Arc::new(move |arguments| {
        let function = function.clone();
        Box::pin(async move {
            let input: T = serde_json::from_value(Value::Object(arguments))
                .map_err(|e| FunctionError::InvalidParameters(e.to_string()))?;
            let output = function(input).await.map_err(FunctionError::from_anyhow)?;
            serde_json::to_value(output).map_err(|e| FunctionError::Execution(e.to_string()))
        })
    })
}

/// The `return` function of a structured-response agent with a typed payload
pub fn typed_return_function<T>(parameters: Value) -> Function
where
    T: DeserializeOwned + Serialize + Send + 'static,
{
    Function::structured(
        RETURN_FUNCTION,
        "End the conversation and return a structured response.",
        parameters,
        |payload: T| async move { Ok(payload) },
    )
}

/// The `return` function of a structured-response agent described only by a JSON schema.
///
/// The payload must be an object carrying every property the schema marks as required.
pub fn schema_return_function(parameters: Value) -> Function {
    let required: Vec<String> = parameters
        .get("required")
        .and_then(|v| v.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let function = Function::new(
        RETURN_FUNCTION,
        "End the conversation and return a structured response.",
        parameters,
        move |arguments| {
            let missing: Vec<String> = required
                .iter()
                .filter(|name| !arguments.contains_key(name.as_str()))
                .cloned()
                .collect();
            async move {
                if !missing.is_empty() {
                    return Err(anyhow::Error::from(FunctionError::InvalidParameters(format!(
                        "missing required field(s): {}",
                        missing.join(", ")
                    ))));
                }
                Ok(Value::Object(arguments))
            }
        },
    );
    Function {
        shape: ArgumentShape::Structured,
        ..function
    }
}

/// The result of dispatching one function call.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// The name the model asked for
    pub name: String,
    /// The raw return value, or the contained failure
    pub result: Result<Value, FunctionError>,
    /// The observation text shown to the model
    pub text: String,
}

impl DispatchOutcome {
    fn success(name: &str, value: Value) -> Self {
        let text = match &value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Self {
            name: name.to_string(),
            result: Ok(value),
            text,
        }
    }

    fn failure(name: &str, error: FunctionError) -> Self {
        Self {
            name: name.to_string(),
            text: error.observation(),
            result: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// The error kind for failed dispatches
    pub fn kind(&self) -> Option<&'static str> {
        self.result.as_ref().err().map(FunctionError::kind)
    }

    /// The function message recording this outcome in history
    pub fn to_message(&self) -> Message {
        Message::function(&self.name, &self.text)
    }
}

/// An ordered set of functions with unique names.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: Vec<Function>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, rejecting a name that is already registered
    pub fn register(&mut self, function: Function) -> AgentResult<()> {
        if self.contains(function.name()) {
            return Err(AgentError::DuplicateFunction(function.name().to_string()));
        }
        self.functions.push(function);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|function| function.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    /// Schemas of every function, in registration order
    pub fn schemas(&self) -> Vec<FunctionSchema> {
        self.functions.iter().map(|f| f.schema().clone()).collect()
    }

    /// Decode, look up and invoke a call.
    ///
    /// Every failure is contained in the returned outcome; this never errors.
    pub async fn dispatch(&self, call: &FunctionCall) -> DispatchOutcome {
        let arguments = match call.parse_arguments() {
            Ok(arguments) => arguments,
            Err(error) => return self.contained(call, error),
        };

        let Some(function) = self.get(&call.name) else {
            return self.contained(call, FunctionError::NotFound(call.name.clone()));
        };

        info!(function = %call.name, "dispatching function call");
        match function.invoke(arguments).await {
            Ok(value) => DispatchOutcome::success(&call.name, value),
            Err(error) => self.contained(call, error),
        }
    }

    fn contained(&self, call: &FunctionCall, error: FunctionError) -> DispatchOutcome {
        warn!(function = %call.name, kind = error.kind(), error = %error, "function call failed");
        DispatchOutcome::failure(&call.name, error)
    }
}
