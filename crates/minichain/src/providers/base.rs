use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::message::Message;
use crate::models::tool::{FunctionCall, FunctionSchema};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }
}

/// What the completion service answered: free text, a function call, or (in error) neither.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl Completion {
    pub fn text<S: Into<String>>(content: S) -> Self {
        Self {
            content: Some(content.into()),
            function_call: None,
        }
    }

    pub fn call(function_call: FunctionCall) -> Self {
        Self {
            content: None,
            function_call: Some(function_call),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.function_call.is_none()
    }

    pub fn into_message(self) -> Message {
        Message::Assistant {
            content: self.content,
            function_call: self.function_call,
        }
    }
}

/// Base trait for completion services (OpenAI and compatible endpoints)
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate the next assistant turn for the given window of messages
    async fn complete(
        &self,
        messages: &[Message],
        functions: &[FunctionSchema],
    ) -> Result<(Completion, Usage)>;
}
