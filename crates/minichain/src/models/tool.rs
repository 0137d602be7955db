use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::FunctionError;

/// The description of a function as it is shown to the completion service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionSchema {
    /// The name of the function
    pub name: String,
    /// A description of what the function does
    pub description: String,
    /// JSON schema of the parameters that the function accepts
    pub parameters: Value,
}

impl FunctionSchema {
    /// Create a new schema with the given name and description
    pub fn new<N, D>(name: N, description: D, parameters: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        FunctionSchema {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A function call requested by the model.
///
/// The arguments are kept in their wire form, a JSON encoded object, and are only decoded
/// at dispatch time so that a malformed payload becomes feedback instead of a failed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    /// The name of the function to execute
    pub name: String,
    /// The JSON encoded arguments
    pub arguments: String,
}

impl FunctionCall {
    pub fn new<N: Into<String>, A: Into<String>>(name: N, arguments: A) -> Self {
        Self {
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Build a call from already structured arguments
    pub fn with_value<N: Into<String>>(name: N, arguments: Value) -> Self {
        Self::new(name, arguments.to_string())
    }

    /// Decode the arguments into a keyword map
    pub fn parse_arguments(&self) -> Result<Map<String, Value>, FunctionError> {
        if self.arguments.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&self.arguments) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(FunctionError::Decode(format!(
                "expected a JSON object, got {}",
                other
            ))),
            Err(e) => Err(FunctionError::Decode(e.to_string())),
        }
    }
}
