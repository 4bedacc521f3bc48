use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::client::ToolCallRequest;
use super::registry::{ToolExecutionResult, ToolRegistry};

/// Undo integration point of the host application. Every tool call runs
/// inside one open/close pair so a single user undo reverts it.
pub trait UndoScope: Send + Sync {
    fn open(&self, label: &str);
    fn close(&self);
}

/// Result of one dispatched call, keyed by the originating call id.
#[derive(Debug, Clone)]
pub struct CompletedCall {
    pub call_id: String,
    pub name: String,
    pub result: ToolExecutionResult,
}

/// Executes model-requested tool calls in order. One failing call never
/// aborts the batch; its failure is recorded and the rest still run.
pub struct Dispatcher {
    undo: Arc<dyn UndoScope>,
}

impl Dispatcher {
    pub fn new(undo: Arc<dyn UndoScope>) -> Self {
        Self { undo }
    }

    pub async fn execute(
        &self,
        registry: &ToolRegistry,
        calls: &[ToolCallRequest],
    ) -> Vec<CompletedCall> {
        let mut completed = Vec::with_capacity(calls.len());
        for call in calls {
            let result = self.execute_single(registry, call).await;
            if !result.success {
                warn!("tool {} failed: {}", call.name, result.message);
            }
            completed.push(CompletedCall {
                call_id: call.id.clone(),
                name: call.name.clone(),
                result,
            });
        }
        completed
    }

    async fn execute_single(
        &self,
        registry: &ToolRegistry,
        call: &ToolCallRequest,
    ) -> ToolExecutionResult {
        let Some(tool) = registry.get(&call.name) else {
            return ToolExecutionResult::failure(format!("unknown tool: {}", call.name));
        };

        let args = decode_arguments(&call.arguments);
        debug!("executing tool {} with {} args", call.name, args.len());

        self.undo.open(&format!("scenepilot_{}", call.name));
        let guard = UndoGuard { undo: &*self.undo };
        let result = match tool.execute(&args).await {
            Ok(result) => result,
            Err(err) => ToolExecutionResult::failure(format!("tool execution failed: {err:#}")),
        };
        drop(guard);
        result
    }
}

struct UndoGuard<'a> {
    undo: &'a dyn UndoScope,
}

impl Drop for UndoGuard<'_> {
    fn drop(&mut self) {
        self.undo.close();
    }
}

/// Decode the raw argument string from the model. Anything that is not a
/// JSON object maps to no arguments; the tool then reports what is
/// missing instead of the whole call blowing up.
fn decode_arguments(raw: &str) -> Map<String, Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!("tool arguments were not a JSON object, ignoring them");
            Map::new()
        }
        Err(err) => {
            warn!("unparseable tool arguments ({err}), ignoring them");
            Map::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::registry::{Tool, ToolSchema};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingUndo {
        log: Mutex<Vec<String>>,
    }

    impl UndoScope for RecordingUndo {
        fn open(&self, label: &str) {
            self.log.lock().unwrap().push(format!("open:{label}"));
        }

        fn close(&self) {
            self.log.lock().unwrap().push("close".to_string());
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "echo".to_string(),
                description: "echo arguments back".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            }
        }

        async fn execute(&self, args: &Map<String, Value>) -> Result<ToolExecutionResult> {
            Ok(ToolExecutionResult::ok(format!("{} args", args.len())))
        }
    }

    struct FaultyTool;

    #[async_trait]
    impl Tool for FaultyTool {
        fn name(&self) -> &str {
            "faulty"
        }

        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "faulty".to_string(),
                description: "always errors".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            }
        }

        async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolExecutionResult> {
            anyhow::bail!("host exploded")
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        registry.register(Box::new(FaultyTool));
        registry
    }

    fn call(id: &str, name: &str, arguments: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[tokio::test]
    async fn batch_keeps_order_and_isolates_failures() {
        let undo = Arc::new(RecordingUndo::default());
        let dispatcher = Dispatcher::new(undo.clone());
        let registry = registry();

        let completed = dispatcher
            .execute(
                &registry,
                &[
                    call("call_1", "faulty", "{}"),
                    call("call_2", "echo", r#"{"a":1}"#),
                ],
            )
            .await;

        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].call_id, "call_1");
        assert!(!completed[0].result.success);
        assert!(completed[0].result.message.contains("host exploded"));
        assert_eq!(completed[1].call_id, "call_2");
        assert!(completed[1].result.success);
        assert_eq!(completed[1].result.message, "1 args");

        // Each call got its own undo chunk, closed even for the failure.
        let log = undo.log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                "open:scenepilot_faulty".to_string(),
                "close".to_string(),
                "open:scenepilot_echo".to_string(),
                "close".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_tool_reports_failure_without_undo_chunk() {
        let undo = Arc::new(RecordingUndo::default());
        let dispatcher = Dispatcher::new(undo.clone());
        let registry = registry();

        let completed = dispatcher
            .execute(&registry, &[call("call_9", "not_registered", "{}")])
            .await;

        assert!(!completed[0].result.success);
        assert!(completed[0].result.message.contains("unknown tool"));
        assert!(undo.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_arguments_degrade_to_empty() {
        let dispatcher = Dispatcher::new(Arc::new(RecordingUndo::default()));
        let registry = registry();

        let completed = dispatcher
            .execute(&registry, &[call("call_3", "echo", "{not json")])
            .await;

        assert!(completed[0].result.success);
        assert_eq!(completed[0].result.message, "0 args");
    }

    #[test]
    fn argument_decoding_rules() {
        assert!(decode_arguments("").is_empty());
        assert!(decode_arguments("  ").is_empty());
        assert!(decode_arguments("[1,2]").is_empty());
        assert!(decode_arguments("broken{").is_empty());
        let args = decode_arguments(r#"{"frame": 12, "extra": true}"#);
        assert_eq!(args.len(), 2);
        assert_eq!(args["frame"], json!(12));
    }
}
