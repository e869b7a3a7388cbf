//! Tool registry and the built-in shell tool
//!
//! The upstream tool-dispatch layer hands the service an opaque command
//! string and a working directory; it never sees sandbox internals.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::service::{ExecutionRequest, ExecutionService};

pub const SHELL_TOOL_NAME: &str = "run_shell_command";

/// Tool metadata advertised to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Trait for executing tools
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, input: Value) -> Result<String>;
    fn list_tools(&self) -> Vec<ToolDefinition>;
}

/// Individual tool handler
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, input: Value) -> Result<String>;
}

fn definition_of(handler: &dyn ToolHandler) -> ToolDefinition {
    ToolDefinition {
        name: handler.name().to_string(),
        description: handler.description().to_string(),
        input_schema: handler.input_schema(),
    }
}

/// Registry of available tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<Arc<str>, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the shell tool bound to `service`
    pub fn with_shell(service: Arc<ExecutionService>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellTool::new(service)));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name: Arc<str> = Arc::from(handler.name());
        debug!("Registering tool: {}", name);
        self.tools.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, tool_name: &str, input: Value) -> Result<String> {
        debug!("Executing tool: {} with input: {:?}", tool_name, input);

        let handler = self
            .tools
            .get(tool_name)
            .ok_or_else(|| anyhow!("Unknown tool: {}", tool_name))?;

        handler.execute(input).await.inspect_err(|e| {
            warn!("Tool {} failed: {}", tool_name, e);
        })
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<_> = self
            .tools
            .values()
            .map(|handler| definition_of(handler.as_ref()))
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

/// Helper function to create a JSON schema for tool input
pub fn json_schema(properties: Value, required: Vec<&str>) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Runs a shell command through the execution service.
///
/// Returns the serialized `ExecutionResult`. Configuration errors come back
/// as `Err` wrapping the underlying `SandboxError`.
pub struct ShellTool {
    service: Arc<ExecutionService>,
}

impl ShellTool {
    pub fn new(service: Arc<ExecutionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ToolHandler for ShellTool {
    fn name(&self) -> &str {
        SHELL_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Execute a shell command with `sh -c` inside the configured sandbox. \
         Returns stdout for successful commands, otherwise a report with exit \
         code, signal, timeout flag and both output streams."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            serde_json::json!({
                "command": {
                    "type": "string",
                    "description": "Exact command to execute"
                },
                "description": {
                    "type": "string",
                    "description": "Brief description of the command for the user"
                },
                "directory": {
                    "type": "string",
                    "description": "Directory to run the command in (default: current directory)"
                },
                "config": {
                    "type": "object",
                    "description": "Optional overrides: sandbox, profile, image, timeoutSecs"
                }
            }),
            vec!["command"],
        )
    }

    async fn execute(&self, input: Value) -> Result<String> {
        let request: ExecutionRequest =
            serde_json::from_value(input).context("Invalid run_shell_command input")?;
        let result = self
            .service
            .execute(&request, CancellationToken::new())
            .await?;
        serde_json::to_string(&result).context("Failed to serialize execution result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxSettings;
    use crate::platform::Platform;

    struct DummyTool;

    #[async_trait]
    impl ToolHandler for DummyTool {
        fn name(&self) -> &str {
            "dummy"
        }

        fn description(&self) -> &str {
            "A dummy tool for testing"
        }

        fn input_schema(&self) -> Value {
            json_schema(serde_json::json!({}), vec![])
        }

        async fn execute(&self, _input: Value) -> Result<String> {
            Ok("dummy result".to_string())
        }
    }

    fn registry() -> ToolRegistry {
        let service = ExecutionService::new(Arc::new(SandboxSettings::default()), Platform::current());
        let mut registry = ToolRegistry::with_shell(Arc::new(service));
        registry.register(Arc::new(DummyTool));
        registry
    }

    #[test]
    fn test_list_tools_sorted() {
        let registry = registry();
        assert_eq!(registry.len(), 2);
        let names: Vec<_> = registry.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["dummy", "run_shell_command"]);

        let shell = registry.get(SHELL_TOOL_NAME).unwrap();
        assert_eq!(shell.input_schema()["required"][0], "command");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let err = registry().execute("nope", serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_bad_input_rejected() {
        let err = registry()
            .execute(SHELL_TOOL_NAME, serde_json::json!({"directory": "/tmp"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid run_shell_command input"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_tool_runs_command() {
        let dir = tempfile::tempdir().unwrap();
        let out = registry()
            .execute(
                SHELL_TOOL_NAME,
                serde_json::json!({
                    "command": "echo hello",
                    "description": "greet",
                    "directory": dir.path(),
                }),
            )
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["content"], "hello\n");
        assert!(value["displayText"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_config_error_is_downcastable() {
        let err = registry()
            .execute(
                SHELL_TOOL_NAME,
                serde_json::json!({"command": "ls", "directory": "/definitely/not/here"}),
            )
            .await
            .unwrap_err();
        let sandbox = err.downcast_ref::<crate::error::SandboxError>().unwrap();
        assert!(sandbox.is_config_error());
    }
}
