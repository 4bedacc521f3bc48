use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::ShortcutsConfig;

use super::registry::ToolRegistry;

/// A recognized shortcut: which tool to run and with which arguments,
/// bypassing the model entirely.
#[derive(Debug, Clone)]
pub struct ShortcutMatch {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub matched_input: String,
}

type ArgsBuilder = fn(&Captures) -> Map<String, Value>;

struct ShortcutEntry {
    pattern: Regex,
    tool_name: &'static str,
    build_args: ArgsBuilder,
}

fn no_args(_caps: &Captures) -> Map<String, Value> {
    Map::new()
}

fn frame_arg(caps: &Captures) -> Map<String, Value> {
    let mut args = Map::new();
    if let Some(frame) = caps
        .name("frame")
        .and_then(|m| m.as_str().parse::<i64>().ok())
    {
        args.insert("frame".to_string(), json!(frame));
    }
    args
}

// Common animator phrasings, Chinese and English. Patterns are anchored;
// a shortcut fires only when the whole input is the command.
static TABLE: Lazy<Vec<ShortcutEntry>> = Lazy::new(|| {
    let entry = |pattern: &str, tool_name: &'static str, build_args: ArgsBuilder| ShortcutEntry {
        pattern: Regex::new(pattern).unwrap(),
        tool_name,
        build_args,
    };
    vec![
        entry(
            r"(?i)^(清零|归零|zero\s*out|reset\s*transform|把.*归零|把.*清零|选中.*归零|选中.*清零|帮我.*归零|帮我.*清零|所有.*归零)$",
            "zero_out_transforms",
            no_args,
        ),
        entry(
            r"(?i)^(打帧|打关键帧|set\s*key|key\s*frame|k帧|打key|打个帧|帮我打帧|设置关键帧|设关键帧|设个帧|打一帧)$",
            "set_keyframe",
            no_args,
        ),
        entry(
            r"(?i)^(?:在|到)?第?\s*(?P<frame>\d+)\s*帧(?:打帧|打关键帧|设置关键帧|打key|k帧|设帧)$",
            "set_keyframe",
            frame_arg,
        ),
        entry(
            r"(?i)^(?:打帧|打关键帧|设置关键帧|打key|k帧|设帧)(?:到|在)?第?\s*(?P<frame>\d+)\s*帧$",
            "set_keyframe",
            frame_arg,
        ),
        entry(
            r"(?i)^(创建定位器|创建locator|建定位器|加定位器|放定位器|帮我.*创建定位器|在.*位置.*定位器)$",
            "create_locator_at_selection",
            no_args,
        ),
        entry(
            r"(?i)^(欧拉.*滤波|euler\s*filter|修复.*万向.*锁|清理.*旋转|滤波|欧拉滤波|帮我.*欧拉.*滤波)$",
            "euler_filter",
            no_args,
        ),
        entry(
            r"(?i)^(冻结变换|冻结|freeze\s*transform|freeze|冻结选中|帮我冻结)$",
            "freeze_transformations",
            no_args,
        ),
        entry(
            r"(?i)^(居中轴心|居中pivot|center\s*pivot|轴心居中|居中枢轴)$",
            "center_pivot",
            no_args,
        ),
        entry(
            r"(?i)^(删除历史|删历史|delete\s*history|清除历史|清除构造历史|删除构造历史)$",
            "delete_history",
            no_args,
        ),
        entry(
            r"(?i)^(qa检查|检查.*归零|检查.*清零|检查控制器|qa\s*check|哪些.*没.*归零|哪些.*没.*清零)$",
            "qa_check_transforms",
            no_args,
        ),
        entry(
            r"(?i)^(删除|delete|删除选中|删掉|删除物体)$",
            "delete_objects",
            no_args,
        ),
    ]
});

/// Matches terse commands against a fixed phrase table so routine
/// operations skip the model round-trip entirely.
///
/// Only short, statement-like inputs are eligible: anything long or
/// ending in a question mark goes to the model, which can weigh context
/// a regex cannot.
pub struct ShortcutTable {
    enabled: bool,
    max_chars: usize,
}

impl ShortcutTable {
    pub fn new(config: &ShortcutsConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_chars: config.max_chars,
        }
    }

    pub fn try_match(&self, input: &str, registry: &ToolRegistry) -> Option<ShortcutMatch> {
        if !self.enabled {
            return None;
        }
        let text = input.trim();
        if text.is_empty() || text.chars().count() > self.max_chars {
            return None;
        }
        if text.ends_with('?') || text.ends_with('？') {
            return None;
        }

        for entry in TABLE.iter() {
            if let Some(caps) = entry.pattern.captures(text) {
                if !registry.contains(entry.tool_name) {
                    debug!(
                        "shortcut phrase matched but tool {} is not registered",
                        entry.tool_name
                    );
                    continue;
                }
                return Some(ShortcutMatch {
                    tool_name: entry.tool_name.to_string(),
                    arguments: (entry.build_args)(&caps),
                    matched_input: text.to_string(),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::registry::{Tool, ToolExecutionResult, ToolSchema};
    use anyhow::Result;
    use async_trait::async_trait;

    struct StubTool(&'static str);

    #[async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &str {
            self.0
        }

        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: self.0.to_string(),
                description: String::new(),
                parameters: json!({"type": "object", "properties": {}}),
            }
        }

        async fn execute(&self, _args: &Map<String, Value>) -> Result<ToolExecutionResult> {
            Ok(ToolExecutionResult::ok("ok"))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for name in [
            "zero_out_transforms",
            "set_keyframe",
            "freeze_transformations",
            "delete_objects",
        ] {
            registry.register(Box::new(StubTool(name)));
        }
        registry
    }

    fn table() -> ShortcutTable {
        ShortcutTable::new(&ShortcutsConfig::default())
    }

    #[test]
    fn matches_chinese_and_english_phrases() {
        let registry = registry();
        let table = table();

        let m = table.try_match("清零", &registry).expect("matches");
        assert_eq!(m.tool_name, "zero_out_transforms");
        assert!(m.arguments.is_empty());

        let m = table.try_match("Zero Out", &registry).expect("matches");
        assert_eq!(m.tool_name, "zero_out_transforms");

        let m = table.try_match("freeze", &registry).expect("matches");
        assert_eq!(m.tool_name, "freeze_transformations");
    }

    #[test]
    fn frame_number_is_captured() {
        let registry = registry();
        let table = table();

        let m = table.try_match("第12帧打帧", &registry).expect("matches");
        assert_eq!(m.tool_name, "set_keyframe");
        assert_eq!(m.arguments["frame"], json!(12));

        let m = table.try_match("打帧到第30帧", &registry).expect("matches");
        assert_eq!(m.arguments["frame"], json!(30));

        // Bare keyframe command carries no frame argument.
        let m = table.try_match("打帧", &registry).expect("matches");
        assert!(m.arguments.is_empty());
    }

    #[test]
    fn questions_and_long_inputs_go_to_the_model() {
        let registry = registry();
        let table = table();

        assert!(table.try_match("清零?", &registry).is_none());
        assert!(table.try_match("清零？", &registry).is_none());
        assert!(table.try_match(&"清".repeat(31), &registry).is_none());
        assert!(
            table
                .try_match("please zero out everything under the root group carefully", &registry)
                .is_none()
        );
    }

    #[test]
    fn unregistered_tool_never_fires() {
        let registry = registry();
        let table = table();

        // Phrase is in the table but delete_history is not registered.
        assert!(table.try_match("删除历史", &registry).is_none());
        // Registered phrase still works afterwards.
        assert!(table.try_match("删除", &registry).is_some());
    }

    #[test]
    fn disabled_table_matches_nothing() {
        let registry = registry();
        let table = ShortcutTable::new(&ShortcutsConfig {
            enabled: false,
            ..ShortcutsConfig::default()
        });
        assert!(table.try_match("清零", &registry).is_none());
    }

    #[test]
    fn partial_phrases_do_not_match() {
        let registry = registry();
        let table = table();

        assert!(table.try_match("清零一下这个然后旋转", &registry).is_none());
        assert!(table.try_match("deleted", &registry).is_none());
    }
}
