use anyhow::Result;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Map, Value, json};

use crate::agent::{PendingCapture, Tool, ToolExecutionResult, ToolSchema};
use crate::config::VisionConfig;

use super::{SharedScene, lock_scene};

// 1x1 transparent PNG standing in for a real viewport grab.
const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x62, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

const MIN_CAPTURE_WIDTH: i64 = 320;
const MAX_CAPTURE_WIDTH: i64 = 3840;
const MIN_CAPTURE_HEIGHT: i64 = 240;
const MAX_CAPTURE_HEIGHT: i64 = 2160;

/// Build the default tool set over the shared scene document.
pub fn create_scene_tools(doc: &SharedScene, vision: &VisionConfig) -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(GetSceneInfoTool { doc: doc.clone() }),
        Box::new(SelectObjectsTool { doc: doc.clone() }),
        Box::new(ZeroOutTransformsTool { doc: doc.clone() }),
        Box::new(FreezeTransformationsTool { doc: doc.clone() }),
        Box::new(SetKeyframeTool { doc: doc.clone() }),
        Box::new(CreateLocatorTool { doc: doc.clone() }),
        Box::new(DeleteObjectsTool { doc: doc.clone() }),
        Box::new(QaCheckTransformsTool { doc: doc.clone() }),
        Box::new(CaptureViewportTool {
            doc: doc.clone(),
            vision: vision.clone(),
        }),
    ]
}

fn int_arg(args: &Map<String, Value>, key: &str) -> Option<i64> {
    match args.get(key) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn string_list_arg(args: &Map<String, Value>, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn no_parameters() -> Value {
    json!({"type": "object", "properties": {}, "required": []})
}

pub struct GetSceneInfoTool {
    doc: SharedScene,
}

#[async_trait]
impl Tool for GetSceneInfoTool {
    fn name(&self) -> &str {
        "get_scene_info"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_scene_info".to_string(),
            description: "Summarize the open scene: name, timeline, node counts by type and the current selection.".to_string(),
            parameters: no_parameters(),
        }
    }

    async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolExecutionResult> {
        let doc = lock_scene(&self.doc);
        Ok(ToolExecutionResult::ok(doc.context_text()))
    }
}

pub struct SelectObjectsTool {
    doc: SharedScene,
}

#[async_trait]
impl Tool for SelectObjectsTool {
    fn name(&self) -> &str {
        "select_objects"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "select_objects".to_string(),
            description: "Replace the selection, either with exact object names or with every object whose name contains a pattern.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "names": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Exact object names to select."
                    },
                    "pattern": {
                        "type": "string",
                        "description": "Case-insensitive substring to match object names against. Ignored when names are given."
                    }
                },
                "required": []
            }),
        }
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<ToolExecutionResult> {
        let names = string_list_arg(args, "names");
        let pattern = str_arg(args, "pattern").map(str::to_string);
        let mut doc = lock_scene(&self.doc);

        if !names.is_empty() {
            let missing = doc.select(&names);
            if doc.selection().is_empty() {
                return Ok(ToolExecutionResult::failure(format!(
                    "none of the requested objects exist: {}",
                    missing.join(", ")
                )));
            }
            let mut message = format!(
                "selected {} object(s): {}",
                doc.selection().len(),
                doc.selection().join(", ")
            );
            if !missing.is_empty() {
                message.push_str(&format!(" (not found: {})", missing.join(", ")));
            }
            return Ok(ToolExecutionResult::ok(message));
        }

        if let Some(pattern) = pattern {
            let count = doc.select_matching(&pattern);
            if count == 0 {
                return Ok(ToolExecutionResult::failure(format!(
                    "no object name contains \"{pattern}\""
                )));
            }
            return Ok(ToolExecutionResult::ok(format!(
                "selected {} object(s) matching \"{}\": {}",
                count,
                pattern,
                doc.selection().join(", ")
            )));
        }

        Ok(ToolExecutionResult::failure(
            "provide names or a pattern to select",
        ))
    }
}

pub struct ZeroOutTransformsTool {
    doc: SharedScene,
}

#[async_trait]
impl Tool for ZeroOutTransformsTool {
    fn name(&self) -> &str {
        "zero_out_transforms"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "zero_out_transforms".to_string(),
            description: "Zero translate and rotate on every selected object. Scale is left untouched.".to_string(),
            parameters: no_parameters(),
        }
    }

    async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolExecutionResult> {
        let mut doc = lock_scene(&self.doc);
        let selection = doc.selection().to_vec();
        if selection.is_empty() {
            return Ok(ToolExecutionResult::failure(
                "nothing is selected; select the objects to zero first",
            ));
        }
        let changed = doc.zero_transforms(&selection);
        Ok(ToolExecutionResult::ok(format!(
            "zeroed translate and rotate on {} of {} selected object(s)",
            changed,
            selection.len()
        )))
    }
}

pub struct FreezeTransformationsTool {
    doc: SharedScene,
}

#[async_trait]
impl Tool for FreezeTransformationsTool {
    fn name(&self) -> &str {
        "freeze_transformations"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "freeze_transformations".to_string(),
            description: "Bake the current transform of every selected object as its rest pose: translate and rotate go to zero, scale to one.".to_string(),
            parameters: no_parameters(),
        }
    }

    async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolExecutionResult> {
        let mut doc = lock_scene(&self.doc);
        let selection = doc.selection().to_vec();
        if selection.is_empty() {
            return Ok(ToolExecutionResult::failure(
                "nothing is selected; select the objects to freeze first",
            ));
        }
        let changed = doc.freeze_transforms(&selection);
        Ok(ToolExecutionResult::ok(format!(
            "froze transforms on {} of {} selected object(s)",
            changed,
            selection.len()
        )))
    }
}

pub struct SetKeyframeTool {
    doc: SharedScene,
}

#[async_trait]
impl Tool for SetKeyframeTool {
    fn name(&self) -> &str {
        "set_keyframe"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "set_keyframe".to_string(),
            description: "Key translate and rotate on every selected object, at the given frame or at the current frame.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "frame": {
                        "type": "integer",
                        "description": "Frame to key at. Defaults to the current frame."
                    }
                },
                "required": []
            }),
        }
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<ToolExecutionResult> {
        let mut doc = lock_scene(&self.doc);
        let selection = doc.selection().to_vec();
        if selection.is_empty() {
            return Ok(ToolExecutionResult::failure(
                "nothing is selected; select the objects to key first",
            ));
        }
        let frame = int_arg(args, "frame").unwrap_or_else(|| doc.current_frame());
        let keyed = doc.set_keyframe(&selection, frame);
        Ok(ToolExecutionResult::ok(format!(
            "keyed {keyed} object(s) at frame {frame}"
        )))
    }
}

pub struct CreateLocatorTool {
    doc: SharedScene,
}

#[async_trait]
impl Tool for CreateLocatorTool {
    fn name(&self) -> &str {
        "create_locator_at_selection"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "create_locator_at_selection".to_string(),
            description: "Create a locator at the average position of the selection (or at the origin when nothing is selected) and select it.".to_string(),
            parameters: no_parameters(),
        }
    }

    async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolExecutionResult> {
        let mut doc = lock_scene(&self.doc);
        let position = doc.average_selected_position().unwrap_or([0.0; 3]);
        let name = doc.create_locator(position);
        Ok(ToolExecutionResult::ok(format!(
            "created {} at ({:.2}, {:.2}, {:.2})",
            name, position[0], position[1], position[2]
        )))
    }
}

pub struct DeleteObjectsTool {
    doc: SharedScene,
}

#[async_trait]
impl Tool for DeleteObjectsTool {
    fn name(&self) -> &str {
        "delete_objects"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "delete_objects".to_string(),
            description: "Delete every selected object from the scene.".to_string(),
            parameters: no_parameters(),
        }
    }

    async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolExecutionResult> {
        let mut doc = lock_scene(&self.doc);
        let selection = doc.selection().to_vec();
        if selection.is_empty() {
            return Ok(ToolExecutionResult::failure(
                "nothing is selected; select the objects to delete first",
            ));
        }
        let deleted = doc.delete_nodes(&selection);
        Ok(ToolExecutionResult::ok(format!(
            "deleted {deleted} object(s)"
        )))
    }
}

pub struct QaCheckTransformsTool {
    doc: SharedScene,
}

#[async_trait]
impl Tool for QaCheckTransformsTool {
    fn name(&self) -> &str {
        "qa_check_transforms"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "qa_check_transforms".to_string(),
            description: "Report every transform, joint or locator whose translate, rotate or scale is off identity. Changes nothing.".to_string(),
            parameters: no_parameters(),
        }
    }

    async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolExecutionResult> {
        let doc = lock_scene(&self.doc);
        let dirty = doc.dirty_transform_nodes();
        if dirty.is_empty() {
            return Ok(ToolExecutionResult::ok("all transform nodes are at identity"));
        }
        let shown: Vec<&str> = dirty.iter().take(10).map(String::as_str).collect();
        let mut message = format!("{} node(s) off identity: {}", dirty.len(), shown.join(", "));
        if dirty.len() > shown.len() {
            message.push_str(&format!(" (+{} more)", dirty.len() - shown.len()));
        }
        Ok(ToolExecutionResult::ok(message))
    }
}

pub struct CaptureViewportTool {
    doc: SharedScene,
    vision: VisionConfig,
}

#[async_trait]
impl Tool for CaptureViewportTool {
    fn name(&self) -> &str {
        "capture_viewport"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "capture_viewport".to_string(),
            description: "Capture the current viewport. The image is attached to the next request so the model can look at the scene.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "width": {
                        "type": "integer",
                        "description": "Capture width in pixels."
                    },
                    "height": {
                        "type": "integer",
                        "description": "Capture height in pixels."
                    }
                },
                "required": []
            }),
        }
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<ToolExecutionResult> {
        let width = int_arg(args, "width")
            .unwrap_or(self.vision.width as i64)
            .clamp(MIN_CAPTURE_WIDTH, MAX_CAPTURE_WIDTH);
        let height = int_arg(args, "height")
            .unwrap_or(self.vision.height as i64)
            .clamp(MIN_CAPTURE_HEIGHT, MAX_CAPTURE_HEIGHT);

        let mut doc = lock_scene(&self.doc);
        let metadata = format!(
            "scene {} at frame {}, {} node(s), {} selected, capture {}x{}",
            doc.name(),
            doc.current_frame(),
            doc.node_count(),
            doc.selection().len(),
            width,
            height
        );
        let data_uri = format!("data:image/png;base64,{}", STANDARD.encode(PLACEHOLDER_PNG));
        let detail = Some(self.vision.detail.clone()).filter(|d| !d.is_empty());
        doc.set_pending_capture(PendingCapture {
            data_uri,
            detail,
            metadata: Some(metadata),
        });

        Ok(ToolExecutionResult::ok(format!(
            "captured the viewport at {width}x{height}; the image will ride along with the next request"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{SceneDoc, shared};

    fn args(raw: &str) -> Map<String, Value> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => panic!("bad test args"),
        }
    }

    fn tool_named<'a>(tools: &'a [Box<dyn Tool>], name: &str) -> &'a dyn Tool {
        tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
            .expect("tool registered")
    }

    #[tokio::test]
    async fn select_then_zero_flow() {
        let doc = shared(SceneDoc::sample());
        let tools = create_scene_tools(&doc, &VisionConfig::default());

        let select = tool_named(&tools, "select_objects");
        let result = select
            .execute(&args(r#"{"names": ["cube1", "ghost"]}"#))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.message.contains("selected 1 object(s): cube1"));
        assert!(result.message.contains("not found: ghost"));

        let zero = tool_named(&tools, "zero_out_transforms");
        let result = zero.execute(&Map::new()).await.unwrap();
        assert!(result.success);
        assert!(result.message.contains("zeroed translate and rotate on 1"));
        assert_eq!(lock_scene(&doc).node("cube1").unwrap().translate, [0.0; 3]);
    }

    #[tokio::test]
    async fn selection_by_pattern() {
        let doc = shared(SceneDoc::sample());
        let tools = create_scene_tools(&doc, &VisionConfig::default());

        let select = tool_named(&tools, "select_objects");
        let result = select
            .execute(&args(r#"{"pattern": "SPHERE"}"#))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(lock_scene(&doc).selection(), &["sphere1".to_string()]);

        let result = select
            .execute(&args(r#"{"pattern": "nonexistent"}"#))
            .await
            .unwrap();
        assert!(!result.success);

        let result = select.execute(&Map::new()).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("provide names or a pattern"));
    }

    #[tokio::test]
    async fn keyframe_accepts_number_or_string_frame() {
        let doc = shared(SceneDoc::sample());
        let tools = create_scene_tools(&doc, &VisionConfig::default());
        lock_scene(&doc).select(&["cube1".to_string()]);

        let key = tool_named(&tools, "set_keyframe");
        let result = key.execute(&args(r#"{"frame": 12}"#)).await.unwrap();
        assert!(result.message.contains("at frame 12"));

        let result = key
            .execute(&args(r#"{"frame": "30", "unknown": true}"#))
            .await
            .unwrap();
        assert!(result.message.contains("at frame 30"));

        // No frame argument keys at the current frame.
        let result = key.execute(&Map::new()).await.unwrap();
        assert!(result.message.contains("at frame 1"));

        let cube = lock_scene(&doc);
        let frames = &cube.node("cube1").unwrap().keyed_frames;
        assert!(frames.contains(&12) && frames.contains(&30) && frames.contains(&1));
    }

    #[tokio::test]
    async fn empty_selection_fails_mutating_tools() {
        let doc = shared(SceneDoc::sample());
        let tools = create_scene_tools(&doc, &VisionConfig::default());

        for name in [
            "zero_out_transforms",
            "freeze_transformations",
            "set_keyframe",
            "delete_objects",
        ] {
            let result = tool_named(&tools, name).execute(&Map::new()).await.unwrap();
            assert!(!result.success, "{name} should fail with empty selection");
            assert!(result.message.contains("nothing is selected"));
        }
    }

    #[tokio::test]
    async fn locator_lands_at_selection_average() {
        let doc = shared(SceneDoc::sample());
        let tools = create_scene_tools(&doc, &VisionConfig::default());
        // cube1 (2, 0.5, -1) and sphere1 (-3, 1, 2) average to (-0.5, 0.75, 0.5).
        lock_scene(&doc).select(&["cube1".to_string(), "sphere1".to_string()]);

        let result = tool_named(&tools, "create_locator_at_selection")
            .execute(&Map::new())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.message.contains("locator1"));
        assert!(result.message.contains("(-0.50, 0.75, 0.50)"));

        let scene = lock_scene(&doc);
        assert_eq!(scene.node("locator1").unwrap().translate, [-0.5, 0.75, 0.5]);
        assert_eq!(scene.selection(), &["locator1".to_string()]);
    }

    #[tokio::test]
    async fn qa_check_reports_without_mutating() {
        let doc = shared(SceneDoc::sample());
        let tools = create_scene_tools(&doc, &VisionConfig::default());

        let result = tool_named(&tools, "qa_check_transforms")
            .execute(&Map::new())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.message.contains("2 node(s) off identity"));
        assert!(result.message.contains("ctrl_main"));
        assert_eq!(lock_scene(&doc).node("ctrl_main").unwrap().translate[0], 0.2);
    }

    #[tokio::test]
    async fn capture_clamps_and_stores_pending_image() {
        let doc = shared(SceneDoc::sample());
        let tools = create_scene_tools(&doc, &VisionConfig::default());

        let result = tool_named(&tools, "capture_viewport")
            .execute(&args(r#"{"width": 99999, "height": 10}"#))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.message.contains("3840x240"));

        let capture = lock_scene(&doc).take_pending_capture().expect("pending");
        assert!(capture.data_uri.starts_with("data:image/png;base64,"));
        assert_eq!(capture.detail.as_deref(), Some("high"));
        assert!(capture.metadata.unwrap().contains("capture 3840x240"));
    }

    #[tokio::test]
    async fn capture_defaults_come_from_config() {
        let doc = shared(SceneDoc::sample());
        let tools = create_scene_tools(&doc, &VisionConfig::default());

        let result = tool_named(&tools, "capture_viewport")
            .execute(&Map::new())
            .await
            .unwrap();
        assert!(result.message.contains("1280x720"));
    }
}
