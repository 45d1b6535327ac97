//! Node definitions and execution for the built-in engine
//!
//! Node kinds:
//! - `constant`: yields a fixed value
//! - `response`: shapes the result headers and body
//! - `rest`: HTTP request (extension `rest`)
//! - `shell`: command execution with the input on stdin (extension `shell`)

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

/// HTTP methods for REST nodes
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// A named node in a pipeline definition
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Node type configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeKind {
    /// Fixed output
    Constant {
        #[serde(default)]
        value: Value,
    },
    /// Result shaping: headers plus a body template (defaults to the input)
    Response {
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    /// HTTP REST call
    Rest {
        #[serde(default)]
        method: HttpMethod,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(default = "default_timeout")]
        timeout: u64,
    },
    /// Shell command execution
    Shell {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default = "default_timeout")]
        timeout: u64,
    },
}

fn default_timeout() -> u64 {
    30
}

impl NodeKind {
    /// Extension that must be loaded before a node of this kind is built.
    pub fn required_extension(&self) -> Option<&'static str> {
        match self {
            Self::Constant { .. } | Self::Response { .. } => None,
            Self::Rest { .. } => Some("rest"),
            Self::Shell { .. } => Some("shell"),
        }
    }
}

/// Output of one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub value: Value,
    /// Only set by `response` nodes
    pub headers: Option<Map<String, Value>>,
}

impl NodeOutput {
    fn value(value: Value) -> Self {
        Self {
            value,
            headers: None,
        }
    }
}

/// Errors during node execution
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("REST request failed: {0}")]
    RestError(String),

    #[error("Shell command failed: {0}")]
    ShellError(String),

    #[error("Timeout after {0}s")]
    Timeout(u64),
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Substitute variables in a string
/// Variables: $INPUT, $PARAM, $HEADERS, $CLIENT, $NODE, $WORKER, $TIMESTAMP
pub fn substitute_variables(template: &str, variables: &HashMap<String, Value>) -> String {
    let mut keys: Vec<&String> = variables.keys().filter(|k| !k.is_empty()).collect();
    // Longest first so `$PARAMS` is not clobbered by `$PARAM`
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    // Single pass: substituted text is emitted as-is and never rescanned
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        match keys.iter().find(|k| after.starts_with(k.as_str())) {
            Some(key) => {
                match &variables[key.as_str()] {
                    Value::String(s) => result.push_str(s),
                    Value::Null => result.push_str("null"),
                    other => result.push_str(&other.to_string()),
                }
                rest = &after[key.len()..];
            }
            None => {
                result.push('$');
                rest = after;
            }
        }
    }
    result.push_str(rest);

    result
}

/// Substitute variables in a HashMap of strings
pub fn substitute_variables_in_map(
    map: &HashMap<String, String>,
    variables: &HashMap<String, Value>,
) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), substitute_variables(v, variables)))
        .collect()
}

/// Substitute variables in a serde_json::Value recursively.
/// A string that is exactly `$NAME` is replaced by the variable's value
/// itself, keeping its JSON type.
pub fn substitute_variables_in_value(value: &Value, variables: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(exact) = s.strip_prefix('$').and_then(|name| variables.get(name)) {
                return exact.clone();
            }
            Value::String(substitute_variables(s, variables))
        }
        Value::Array(arr) => Value::Array(
            arr.iter()
                .map(|v| substitute_variables_in_value(v, variables))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_variables_in_value(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn parse_output(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str::<Value>(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

// ============================================================================
// SBIO: I/O - NodeRunner
// ============================================================================

/// Executes nodes with variable substitution
#[derive(Clone, Default)]
pub struct NodeRunner {
    client: reqwest::Client,
}

impl NodeRunner {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Run one node against its input
    pub async fn run(
        &self,
        node: &NodeSpec,
        input: &Value,
        variables: &HashMap<String, Value>,
    ) -> Result<NodeOutput, NodeError> {
        match &node.kind {
            NodeKind::Constant { value } => Ok(NodeOutput::value(value.clone())),
            NodeKind::Response { headers, body } => {
                let headers = substitute_variables_in_map(headers, variables)
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect();
                let value = match body {
                    Some(template) => substitute_variables_in_value(template, variables),
                    None => input.clone(),
                };
                Ok(NodeOutput {
                    value,
                    headers: Some(headers),
                })
            }
            NodeKind::Rest {
                method,
                url,
                headers,
                body,
                timeout,
            } => self
                .execute_rest(method, url, headers, body.as_ref(), input, *timeout, variables)
                .await
                .map(NodeOutput::value),
            NodeKind::Shell {
                command,
                args,
                env,
                cwd,
                timeout,
            } => self
                .execute_shell(command, args, env, cwd.as_deref(), input, *timeout, variables)
                .await
                .map(NodeOutput::value),
        }
    }

    /// Execute REST node. Without a body template, non-GET requests send the
    /// node input as the JSON body.
    #[allow(clippy::too_many_arguments)]
    async fn execute_rest(
        &self,
        method: &HttpMethod,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&Value>,
        input: &Value,
        timeout: u64,
        variables: &HashMap<String, Value>,
    ) -> Result<Value, NodeError> {
        let url = substitute_variables(url, variables);
        let headers = substitute_variables_in_map(headers, variables);

        let mut request = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Patch => self.client.patch(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };

        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        match body {
            Some(template) => {
                request = request.json(&substitute_variables_in_value(template, variables));
            }
            None if *method != HttpMethod::Get => {
                request = request.json(input);
            }
            None => {}
        }

        request = request.timeout(Duration::from_secs(timeout));

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                NodeError::Timeout(timeout)
            } else {
                NodeError::RestError(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(NodeError::RestError(format!(
                "HTTP {} {}",
                response.status().as_u16(),
                response.status().as_str()
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| NodeError::RestError(e.to_string()))?;
        Ok(parse_output(&text))
    }

    /// Execute shell node; the input is written to stdin as JSON
    #[allow(clippy::too_many_arguments)]
    async fn execute_shell(
        &self,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
        input: &Value,
        timeout: u64,
        variables: &HashMap<String, Value>,
    ) -> Result<Value, NodeError> {
        let command = substitute_variables(command, variables);
        let args: Vec<String> = args
            .iter()
            .map(|a| substitute_variables(a, variables))
            .collect();
        let env = substitute_variables_in_map(env, variables);

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(&key, &value);
        }

        if let Some(dir) = cwd {
            cmd.current_dir(substitute_variables(dir, variables));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| NodeError::ShellError(e.to_string()))?;

        let stdin = child.stdin.take();
        let payload = input.to_string();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores stdin may close it early
                let _ = stdin.write_all(payload.as_bytes()).await;
            }
        };

        // Feed stdin while draining stdout so large payloads cannot fill both pipes
        let exchange = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = tokio::time::timeout(Duration::from_secs(timeout), exchange)
            .await
            .map_err(|_| NodeError::Timeout(timeout))?
            .map_err(|e| NodeError::ShellError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NodeError::ShellError(format!(
                "Exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(parse_output(&String::from_utf8_lossy(&output.stdout)))
    }
}
