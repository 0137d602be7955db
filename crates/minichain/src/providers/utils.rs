use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::{json, Value};

use crate::models::message::Message;
use crate::models::tool::{FunctionCall, FunctionSchema};
use crate::providers::base::Completion;

/// Convert internal messages to OpenAI's chat message specification
///
/// Uses the function-calling fields (`function_call` on assistant turns and the `function`
/// role for results), which is the shape the agent loop reasons in.
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| match message {
            Message::System { content } | Message::User { content } => json!({
                "role": message.role(),
                "content": content,
            }),
            Message::Assistant {
                content,
                function_call,
            } => {
                let mut converted = json!({
                    "role": "assistant",
                    "content": content,
                });
                if let Some(call) = function_call {
                    converted["function_call"] = json!({
                        "name": sanitize_function_name(&call.name),
                        "arguments": call.arguments,
                    });
                }
                converted
            }
            Message::Function { name, content } => json!({
                "role": "function",
                "name": sanitize_function_name(name),
                "content": content,
            }),
        })
        .collect()
}

/// Convert function schemas to OpenAI's `functions` specification
pub fn functions_to_openai_spec(functions: &[FunctionSchema]) -> Result<Vec<Value>> {
    let mut function_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for function in functions {
        if !function_names.insert(&function.name) {
            return Err(anyhow!("Duplicate function name: {}", function.name));
        }

        result.push(json!({
            "name": function.name,
            "description": function.description,
            "parameters": function.parameters,
        }));
    }

    Ok(result)
}

/// Convert OpenAI's API response to a completion
///
/// Arguments are kept as the raw JSON text the model produced; decoding them is left to
/// dispatch so that malformed arguments become feedback for the model.
pub fn openai_response_to_completion(response: &Value) -> Result<Completion> {
    let message = response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| anyhow!("No message in response: {}", response))?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .map(String::from);

    let function_call = message
        .get("function_call")
        .filter(|call| !call.is_null())
        .or_else(|| {
            // Endpoints that only speak the tools API answer with tool_calls instead
            message
                .get("tool_calls")
                .and_then(|calls| calls.get(0))
                .and_then(|call| call.get("function"))
        })
        .map(|call| {
            let name = call["name"].as_str().unwrap_or_default();
            let arguments = match &call["arguments"] {
                Value::String(arguments) => arguments.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            FunctionCall::new(name, arguments)
        });

    Ok(Completion {
        content,
        function_call,
    })
}

pub fn sanitize_function_name(name: &str) -> String {
    let re = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    re.replace_all(name, "_").to_string()
}

#[derive(Debug, thiserror::Error)]
#[error("Context length exceeded. Message: {0}")]
pub struct ContextLengthExceededError(String);

pub fn check_openai_context_length_error(error: &Value) -> Option<ContextLengthExceededError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ContextLengthExceededError(message))
    } else {
        None
    }
}
