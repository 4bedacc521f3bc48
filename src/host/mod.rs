//! In-process host environment: a demo scene document plus the adapters
//! that expose it to the agent as context, undo scope and tools.

pub mod scene;
pub mod tools;

pub use scene::{NodeType, SceneDoc, SceneNode, SceneStats};
pub use tools::create_scene_tools;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use crate::agent::{ContextSource, PendingCapture, UndoScope};

pub type SharedScene = Arc<Mutex<SceneDoc>>;

pub fn shared(doc: SceneDoc) -> SharedScene {
    Arc::new(Mutex::new(doc))
}

/// Lock the scene, recovering the guard if a previous holder panicked.
pub(crate) fn lock_scene(doc: &Mutex<SceneDoc>) -> MutexGuard<'_, SceneDoc> {
    doc.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wraps tool execution in scene undo steps.
pub struct SceneUndo {
    doc: SharedScene,
}

impl SceneUndo {
    pub fn new(doc: SharedScene) -> Self {
        Self { doc }
    }
}

impl UndoScope for SceneUndo {
    fn open(&self, label: &str) {
        lock_scene(&self.doc).begin_undo(label);
    }

    fn close(&self) {
        lock_scene(&self.doc).end_undo();
    }
}

/// Feeds scene state and pending captures into prompt construction.
pub struct SceneContext {
    doc: SharedScene,
}

impl SceneContext {
    pub fn new(doc: SharedScene) -> Self {
        Self { doc }
    }
}

impl ContextSource for SceneContext {
    fn scene_context(&self) -> Result<String> {
        Ok(lock_scene(&self.doc).context_text())
    }

    fn take_pending_capture(&self) -> Option<PendingCapture> {
        lock_scene(&self.doc).take_pending_capture()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_scope_round_trips_through_the_scene() {
        let doc = shared(SceneDoc::sample());
        let undo = SceneUndo::new(doc.clone());

        undo.open("test step");
        lock_scene(&doc).delete_nodes(&["cube1".to_string()]);
        undo.close();

        assert!(lock_scene(&doc).node("cube1").is_none());
        assert_eq!(lock_scene(&doc).undo().as_deref(), Some("test step"));
        assert!(lock_scene(&doc).node("cube1").is_some());
    }

    #[test]
    fn context_source_reads_scene_state() {
        let doc = shared(SceneDoc::sample());
        let context = SceneContext::new(doc.clone());

        let text = context.scene_context().expect("context");
        assert!(text.contains("scene: shot010_anim_v003"));

        assert!(context.take_pending_capture().is_none());
        lock_scene(&doc).set_pending_capture(PendingCapture {
            data_uri: "data:image/png;base64,AA==".to_string(),
            detail: None,
            metadata: None,
        });
        assert!(context.take_pending_capture().is_some());
        assert!(context.take_pending_capture().is_none());
    }
}
