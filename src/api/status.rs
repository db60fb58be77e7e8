//! Error reporting.

use std::fmt;
use std::collections::HashMap;
use serde::{Deserialize, Serialize};


//------------ ErrorResponse -------------------------------------------------

/// An API error response.
///
/// This is the JSON body of every non-successful reply of the service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorResponse {
    /// The error label.
    pub label: String,

    /// The error message.
    pub msg: String,

    /// Arguments with details about the error.
    pub args: HashMap<String, String>,
}

impl ErrorResponse {
    pub fn new(label: &str, msg: impl fmt::Display) -> Self {
        ErrorResponse {
            label: label.to_string(),
            msg: msg.to_string(),
            args: HashMap::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.args.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_tool(self, tool: impl fmt::Display) -> Self {
        self.with_arg("tool", tool)
    }

    pub fn with_exit_code(self, code: Option<i32>) -> Self {
        match code {
            Some(code) => self.with_arg("exit_code", code),
            None => self.with_arg("exit_code", "signal"),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match serde_json::to_string(&self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{}: {}", self.label, self.msg),
        }
    }
}
