use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::agent::PendingCapture;

/// Undo steps kept before the oldest is dropped.
const MAX_UNDO_STEPS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Transform,
    Joint,
    Camera,
    Light,
    Mesh,
    Locator,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Transform => "transform",
            NodeType::Joint => "joint",
            NodeType::Camera => "camera",
            NodeType::Light => "light",
            NodeType::Mesh => "mesh",
            NodeType::Locator => "locator",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    pub node_type: NodeType,
    pub translate: [f64; 3],
    pub rotate: [f64; 3],
    pub scale: [f64; 3],
    pub keyed_frames: BTreeSet<i64>,
}

impl SceneNode {
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            translate: [0.0; 3],
            rotate: [0.0; 3],
            scale: [1.0; 3],
            keyed_frames: BTreeSet::new(),
        }
    }

    pub fn placed(node_type: NodeType, translate: [f64; 3], rotate: [f64; 3]) -> Self {
        Self {
            node_type,
            translate,
            rotate,
            ..Self::new(node_type)
        }
    }

    /// Zero translate and rotate, unit scale.
    pub fn is_identity(&self) -> bool {
        self.translate.iter().all(|v| *v == 0.0)
            && self.rotate.iter().all(|v| *v == 0.0)
            && self.scale.iter().all(|v| *v == 1.0)
    }

    fn is_transform_like(&self) -> bool {
        matches!(
            self.node_type,
            NodeType::Transform | NodeType::Joint | NodeType::Locator
        )
    }
}

#[derive(Debug, Clone)]
pub struct SceneStats {
    pub total: usize,
    pub by_type: BTreeMap<&'static str, usize>,
}

struct UndoChunk {
    label: String,
    nodes: BTreeMap<String, SceneNode>,
    selection: Vec<String>,
}

/// The open scene: a flat node table with transforms, keys, a selection
/// list and a timeline, plus an undo stack of labeled snapshots.
///
/// This is the in-process stand-in for a real authoring application. The
/// assistant only ever touches it through registered tools.
pub struct SceneDoc {
    name: String,
    modified: bool,
    up_axis: String,
    linear_unit: String,
    fps: f64,
    current_frame: i64,
    playback_start: i64,
    playback_end: i64,
    nodes: BTreeMap<String, SceneNode>,
    selection: Vec<String>,
    undo_stack: Vec<UndoChunk>,
    open_chunk: Option<UndoChunk>,
    pending_capture: Option<PendingCapture>,
}

impl SceneDoc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modified: false,
            up_axis: "Y".to_string(),
            linear_unit: "cm".to_string(),
            fps: 24.0,
            current_frame: 1,
            playback_start: 1,
            playback_end: 120,
            nodes: BTreeMap::new(),
            selection: Vec::new(),
            undo_stack: Vec::new(),
            open_chunk: None,
            pending_capture: None,
        }
    }

    /// A small animation scene to poke at from the REPL.
    pub fn sample() -> Self {
        let mut doc = Self::new("shot010_anim_v003");
        doc.add_node(
            "persp",
            SceneNode::placed(NodeType::Camera, [28.0, 21.0, 28.0], [-27.9, 45.0, 0.0]),
        );
        doc.add_node(
            "key_light",
            SceneNode::placed(NodeType::Light, [10.0, 15.0, 5.0], [-40.0, 25.0, 0.0]),
        );
        doc.add_node("ground", SceneNode::new(NodeType::Mesh));
        doc.add_node(
            "cube1",
            SceneNode::placed(NodeType::Mesh, [2.0, 0.5, -1.0], [0.0, 35.0, 0.0]),
        );
        doc.add_node(
            "sphere1",
            SceneNode::placed(NodeType::Mesh, [-3.0, 1.0, 2.0], [0.0, 0.0, 0.0]),
        );
        doc.add_node("char_root", SceneNode::new(NodeType::Joint));
        doc.add_node(
            "spine_01",
            SceneNode::placed(NodeType::Joint, [0.0, 9.0, 0.0], [0.0, 0.0, 0.0]),
        );
        doc.add_node(
            "ctrl_main",
            SceneNode::placed(NodeType::Transform, [0.2, 0.0, 0.4], [0.0, 15.0, 0.0]),
        );
        doc.modified = false;
        doc
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_frame(&self) -> i64 {
        self.current_frame
    }

    pub fn set_current_frame(&mut self, frame: i64) {
        self.current_frame = frame;
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, name: &str) -> Option<&SceneNode> {
        self.nodes.get(name)
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    pub fn add_node(&mut self, name: impl Into<String>, node: SceneNode) {
        self.nodes.insert(name.into(), node);
        self.modified = true;
    }

    pub fn selection(&self) -> &[String] {
        &self.selection
    }

    /// Replace the selection, keeping only names that exist. Returns the
    /// names that were not found.
    pub fn select(&mut self, names: &[String]) -> Vec<String> {
        let mut missing = Vec::new();
        let mut kept = Vec::new();
        for name in names {
            if self.nodes.contains_key(name) {
                if !kept.contains(name) {
                    kept.push(name.clone());
                }
            } else {
                missing.push(name.clone());
            }
        }
        self.selection = kept;
        missing
    }

    pub fn select_matching(&mut self, pattern: &str) -> usize {
        let pattern = pattern.to_lowercase();
        self.selection = self
            .nodes
            .keys()
            .filter(|n| n.to_lowercase().contains(&pattern))
            .cloned()
            .collect();
        self.selection.len()
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    /// Zero translate and rotate on the named nodes. Scale is left alone.
    /// Returns how many nodes actually changed.
    pub fn zero_transforms(&mut self, names: &[String]) -> usize {
        let mut changed = 0;
        for name in names {
            if let Some(node) = self.nodes.get_mut(name) {
                let dirty = node.translate != [0.0; 3] || node.rotate != [0.0; 3];
                node.translate = [0.0; 3];
                node.rotate = [0.0; 3];
                if dirty {
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.modified = true;
        }
        changed
    }

    /// Bake the current transform as the rest pose: zero translate and
    /// rotate, unit scale. Returns how many nodes changed.
    pub fn freeze_transforms(&mut self, names: &[String]) -> usize {
        let mut changed = 0;
        for name in names {
            if let Some(node) = self.nodes.get_mut(name) {
                if !node.is_identity() {
                    changed += 1;
                }
                node.translate = [0.0; 3];
                node.rotate = [0.0; 3];
                node.scale = [1.0; 3];
            }
        }
        if changed > 0 {
            self.modified = true;
        }
        changed
    }

    pub fn set_keyframe(&mut self, names: &[String], frame: i64) -> usize {
        let mut keyed = 0;
        for name in names {
            if let Some(node) = self.nodes.get_mut(name) {
                node.keyed_frames.insert(frame);
                keyed += 1;
            }
        }
        if keyed > 0 {
            self.modified = true;
        }
        keyed
    }

    pub fn delete_nodes(&mut self, names: &[String]) -> usize {
        let mut deleted = 0;
        for name in names {
            if self.nodes.remove(name).is_some() {
                deleted += 1;
            }
        }
        if deleted > 0 {
            self.selection.retain(|s| self.nodes.contains_key(s));
            self.modified = true;
        }
        deleted
    }

    /// Create a locator with a unique generated name, select it, and
    /// return the name.
    pub fn create_locator(&mut self, position: [f64; 3]) -> String {
        let mut index = 1;
        let name = loop {
            let candidate = format!("locator{index}");
            if !self.nodes.contains_key(&candidate) {
                break candidate;
            }
            index += 1;
        };
        let mut node = SceneNode::new(NodeType::Locator);
        node.translate = position;
        self.nodes.insert(name.clone(), node);
        self.selection = vec![name.clone()];
        self.modified = true;
        name
    }

    pub fn average_selected_position(&self) -> Option<[f64; 3]> {
        let positions: Vec<[f64; 3]> = self
            .selection
            .iter()
            .filter_map(|n| self.nodes.get(n))
            .map(|n| n.translate)
            .collect();
        if positions.is_empty() {
            return None;
        }
        let count = positions.len() as f64;
        let mut sum = [0.0; 3];
        for p in positions {
            for axis in 0..3 {
                sum[axis] += p[axis];
            }
        }
        Some([sum[0] / count, sum[1] / count, sum[2] / count])
    }

    /// Transform-like nodes that are off identity; the usual pre-publish
    /// cleanup check.
    pub fn dirty_transform_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.is_transform_like() && !node.is_identity())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn stats(&self) -> SceneStats {
        let mut by_type: BTreeMap<&'static str, usize> = BTreeMap::new();
        for node in self.nodes.values() {
            *by_type.entry(node.node_type.as_str()).or_insert(0) += 1;
        }
        SceneStats {
            total: self.nodes.len(),
            by_type,
        }
    }

    /// The scene-state block prepended to each fresh user turn.
    pub fn context_text(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();
        out.push_str(&format!(
            "scene: {}{}\n",
            self.name,
            if self.modified { " (modified)" } else { "" }
        ));
        out.push_str(&format!(
            "up axis: {}, linear unit: {}, {} fps\n",
            self.up_axis, self.linear_unit, self.fps
        ));
        out.push_str(&format!(
            "frame: {} (playback {}..{})\n",
            self.current_frame, self.playback_start, self.playback_end
        ));

        let breakdown = stats
            .by_type
            .iter()
            .map(|(kind, count)| format!("{kind} {count}"))
            .collect::<Vec<_>>()
            .join(", ");
        if breakdown.is_empty() {
            out.push_str("nodes: none\n");
        } else {
            out.push_str(&format!("nodes: {} total ({})\n", stats.total, breakdown));
        }

        if self.selection.is_empty() {
            out.push_str("selection: empty\n");
        } else {
            let collected: Vec<&str> = self
                .selection
                .iter()
                .take(50)
                .map(String::as_str)
                .collect();
            let shown = &collected[..collected.len().min(20)];
            let mut line = format!(
                "selection ({}): {}",
                self.selection.len(),
                shown.join(", ")
            );
            if self.selection.len() > shown.len() {
                line.push_str(&format!(" (+{} more)", self.selection.len() - shown.len()));
            }
            out.push_str(&line);
            out.push('\n');
        }

        let dirty = self.dirty_transform_nodes();
        if !dirty.is_empty() {
            out.push_str(&format!("transforms off identity: {}\n", dirty.len()));
        }
        out.trim_end().to_string()
    }

    /// Open an undo step: snapshot nodes and selection under a label.
    /// An already-open step is finalized first.
    pub fn begin_undo(&mut self, label: &str) {
        if self.open_chunk.is_some() {
            self.end_undo();
        }
        self.open_chunk = Some(UndoChunk {
            label: label.to_string(),
            nodes: self.nodes.clone(),
            selection: self.selection.clone(),
        });
    }

    pub fn end_undo(&mut self) {
        if let Some(chunk) = self.open_chunk.take() {
            self.undo_stack.push(chunk);
            if self.undo_stack.len() > MAX_UNDO_STEPS {
                self.undo_stack.remove(0);
            }
        }
    }

    /// Revert the most recent undo step. Returns its label.
    pub fn undo(&mut self) -> Option<String> {
        let chunk = self.undo_stack.pop()?;
        self.nodes = chunk.nodes;
        self.selection = chunk.selection;
        self.modified = true;
        Some(chunk.label)
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn set_pending_capture(&mut self, capture: PendingCapture) {
        self.pending_capture = Some(capture);
    }

    pub fn take_pending_capture(&mut self) -> Option<PendingCapture> {
        self.pending_capture.take()
    }
}
