use serde::{Deserialize, Serialize};

use super::role::Role;
use super::tool::FunctionCall;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
/// A message to or from an LLM
pub enum Message {
    /// The instruction that frames the whole conversation
    System { content: String },
    /// A task or follow-up instruction
    User { content: String },
    /// A reply from the model, carrying either text or a function call
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        function_call: Option<FunctionCall>,
    },
    /// The textual result (or error text) of a function invocation
    Function { name: String, content: String },
}

impl Message {
    pub fn system<S: Into<String>>(content: S) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn user<S: Into<String>>(content: S) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    /// An assistant message holding only text
    pub fn assistant<S: Into<String>>(content: S) -> Self {
        Message::Assistant {
            content: Some(content.into()),
            function_call: None,
        }
    }

    /// An assistant message requesting a function call
    pub fn function_call(call: FunctionCall) -> Self {
        Message::Assistant {
            content: None,
            function_call: Some(call),
        }
    }

    pub fn function<N: Into<String>, S: Into<String>>(name: N, content: S) -> Self {
        Message::Function {
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::User { .. } => Role::User,
            Message::Assistant { .. } => Role::Assistant,
            Message::Function { .. } => Role::Function,
        }
    }

    /// Get the text content, if any
    pub fn content(&self) -> Option<&str> {
        match self {
            Message::System { content }
            | Message::User { content }
            | Message::Function { content, .. } => Some(content),
            Message::Assistant { content, .. } => content.as_deref(),
        }
    }

    /// Get the requested function call if this is an assistant message carrying one
    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Message::Assistant { function_call, .. } => function_call.as_ref(),
            _ => None,
        }
    }

    /// The function name of a function message
    pub fn name(&self) -> Option<&str> {
        match self {
            Message::Function { name, .. } => Some(name),
            _ => None,
        }
    }
}
