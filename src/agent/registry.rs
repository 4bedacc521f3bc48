use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Schema for a single tool, in the shape OpenAI-compatible chat APIs
/// expect inside the `tools` array (before the `function` wrapper).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Outcome of one tool execution. Serialized as-is into the tool role
/// message that answers the originating call id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub success: bool,
    pub message: String,
}

impl ToolExecutionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// A callable scene operation exposed to the model.
///
/// Arguments arrive already decoded from the model's JSON string. Tools
/// ignore unknown keys and report missing required ones through a failure
/// result; `Err` is reserved for host-level faults.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn schema(&self) -> ToolSchema;

    async fn execute(&self, args: &Map<String, Value>) -> Result<ToolExecutionResult>;
}

/// Every tool the assistant may call, in registration order.
///
/// Order matters: the schema catalog baked into the system prompt lists
/// tools in the order they were registered, which keeps the prompt stable
/// across runs.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name replaces the earlier
    /// registration in place, keeping its position in the catalog.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&slot) => {
                debug!("replacing registered tool: {}", name);
                self.tools[slot] = tool;
            }
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.index.get(name).map(|&slot| self.tools[slot].as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedTool {
        name: &'static str,
        reply: &'static str,
    }

    #[async_trait]
    impl Tool for FixedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: self.name.to_string(),
                description: format!("test tool {}", self.name),
                parameters: json!({"type": "object", "properties": {}}),
            }
        }

        async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolExecutionResult> {
            Ok(ToolExecutionResult::ok(self.reply))
        }
    }

    #[test]
    fn registration_order_is_preserved() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(FixedTool {
            name: "beta",
            reply: "b",
        }));
        registry.register(Box::new(FixedTool {
            name: "alpha",
            reply: "a",
        }));

        assert_eq!(registry.names(), vec!["beta", "alpha"]);
        assert_eq!(registry.schemas()[0].name, "beta");
    }

    #[test]
    fn duplicate_name_replaces_in_place() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(FixedTool {
            name: "beta",
            reply: "old",
        }));
        registry.register(Box::new(FixedTool {
            name: "alpha",
            reply: "a",
        }));
        registry.register(Box::new(FixedTool {
            name: "beta",
            reply: "new",
        }));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["beta", "alpha"]);
    }

    #[tokio::test]
    async fn lookup_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(FixedTool {
            name: "ping",
            reply: "pong",
        }));

        let tool = registry.get("ping").expect("tool registered");
        let result = tool.execute(&Map::new()).await.expect("execute");
        assert!(result.success);
        assert_eq!(result.message, "pong");

        assert!(registry.get("missing").is_none());
        assert!(registry.contains("ping"));
        assert!(!registry.contains("missing"));
    }
}
