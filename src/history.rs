use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HistoryConfig;

/// One completed exchange, as a line of JSONL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub user_input: String,
    #[serde(default)]
    pub assistant_reply: String,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub is_shortcut: bool,
}

/// Thresholds for the similarity search over past exchanges.
#[derive(Debug, Clone, Copy)]
pub struct FuzzyParams {
    pub threshold: f64,
    pub min_length_ratio: f64,
    pub max_length_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub records: usize,
    pub started: String,
}

#[derive(Debug, Clone)]
pub struct HistoryStats {
    pub total_records: usize,
    pub total_sessions: usize,
    pub shortcut_records: usize,
    pub tool_records: usize,
    pub current_session: String,
}

/// Lowercase and keep only word characters. Shared by the cache and the
/// similarity search so both sides agree on what "the same question" is.
pub fn normalize_text(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

fn generate_session_id() -> String {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("{stamp}_{suffix}")
}

/// Append-only conversation log.
///
/// Every record goes straight to disk; a bounded window stays in memory
/// for search and similarity matching. The file rotates once it crosses
/// the size limit, so a long-lived install never grows one giant log.
pub struct HistoryStore {
    path: PathBuf,
    config: HistoryConfig,
    session_id: String,
    records: Vec<HistoryRecord>,
    loaded: bool,
}

impl HistoryStore {
    pub fn new(path: PathBuf, config: HistoryConfig) -> Self {
        Self {
            path,
            config,
            session_id: generate_session_id(),
            records: Vec::new(),
            loaded: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Start a fresh session id for subsequent records.
    pub fn begin_session(&mut self) -> String {
        self.session_id = generate_session_id();
        info!("history session {}", self.session_id);
        self.session_id.clone()
    }

    /// Continue logging under an existing session id.
    pub fn resume_session(&mut self, session_id: &str) {
        self.session_id = session_id.to_string();
        info!("resumed history session {}", self.session_id);
    }

    pub fn append(
        &mut self,
        user_input: &str,
        assistant_reply: &str,
        tools_used: &[String],
        is_shortcut: bool,
    ) {
        self.ensure_loaded();
        let record = HistoryRecord {
            session_id: self.session_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            user_input: user_input.to_string(),
            assistant_reply: assistant_reply.to_string(),
            tools_used: tools_used.to_vec(),
            is_shortcut,
        };
        self.records.push(record.clone());

        let max = self.config.max_memory_records;
        if max > 0 && self.records.len() > max {
            let excess = self.records.len() - max;
            self.records.drain(..excess);
        }

        self.append_to_disk(&record);
    }

    /// Case-insensitive keyword search, most recent first. An empty
    /// keyword returns everything (up to `limit`; zero means no limit).
    pub fn search(&mut self, keyword: &str, limit: usize) -> Vec<HistoryRecord> {
        self.ensure_loaded();
        let keyword = keyword.trim().to_lowercase();
        let mut found = Vec::new();
        for record in self.records.iter().rev() {
            let matched = keyword.is_empty()
                || record.user_input.to_lowercase().contains(&keyword)
                || record.assistant_reply.to_lowercase().contains(&keyword)
                || record
                    .tools_used
                    .iter()
                    .any(|t| t.to_lowercase().contains(&keyword));
            if matched {
                found.push(record.clone());
                if limit > 0 && found.len() >= limit {
                    break;
                }
            }
        }
        found
    }

    /// Find the reply to the most similar past question, if any clears
    /// the threshold. Exchanges that ran tools or shortcuts are skipped;
    /// their replies describe scene state that has since moved on.
    pub fn find_similar(&mut self, query: &str, params: &FuzzyParams) -> Option<String> {
        let normalized = normalize_text(query);
        if normalized.is_empty() {
            return None;
        }
        let query_len = normalized.chars().count() as f64;

        self.ensure_loaded();
        let mut best: Option<(f64, &HistoryRecord)> = None;
        for record in self.records.iter().rev() {
            if record.is_shortcut || !record.tools_used.is_empty() {
                continue;
            }
            if record.assistant_reply.is_empty() {
                continue;
            }
            let past = normalize_text(&record.user_input);
            if past.is_empty() {
                continue;
            }
            let ratio = query_len / past.chars().count().max(1) as f64;
            if ratio < params.min_length_ratio || ratio > params.max_length_ratio {
                continue;
            }
            let score = strsim::normalized_levenshtein(&normalized, &past);
            if score >= params.threshold && best.is_none_or(|(b, _)| score > b) {
                best = Some((score, record));
            }
        }

        if let Some((score, record)) = best {
            debug!("similar past question found (score {score:.2})");
            return Some(record.assistant_reply.clone());
        }
        None
    }

    pub fn session_records(&mut self, session_id: &str) -> Vec<HistoryRecord> {
        self.ensure_loaded();
        self.records
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Distinct sessions in first-seen order.
    pub fn sessions(&mut self) -> Vec<SessionSummary> {
        self.ensure_loaded();
        let mut order: Vec<String> = Vec::new();
        let mut map: HashMap<String, SessionSummary> = HashMap::new();
        for record in &self.records {
            match map.get_mut(&record.session_id) {
                Some(summary) => summary.records += 1,
                None => {
                    order.push(record.session_id.clone());
                    map.insert(
                        record.session_id.clone(),
                        SessionSummary {
                            id: record.session_id.clone(),
                            records: 1,
                            started: record.timestamp.clone(),
                        },
                    );
                }
            }
        }
        order.into_iter().filter_map(|id| map.remove(&id)).collect()
    }

    pub fn stats(&mut self) -> HistoryStats {
        self.ensure_loaded();
        let sessions: HashSet<&str> = self.records.iter().map(|r| r.session_id.as_str()).collect();
        HistoryStats {
            total_records: self.records.len(),
            total_sessions: sessions.len(),
            shortcut_records: self.records.iter().filter(|r| r.is_shortcut).count(),
            tool_records: self
                .records
                .iter()
                .filter(|r| !r.tools_used.is_empty())
                .count(),
            current_session: self.session_id.clone(),
        }
    }

    pub fn clear_all(&mut self) -> usize {
        self.ensure_loaded();
        let cleared = self.records.len();
        self.records.clear();
        if self.path.exists()
            && let Err(err) = fs::remove_file(&self.path)
        {
            warn!("failed to remove history file: {err}");
        }
        cleared
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn ensure_loaded(&mut self) {
        if !self.loaded {
            self.records = self.load();
            self.loaded = true;
        }
    }

    fn load(&self) -> Vec<HistoryRecord> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let mut records = Vec::new();
        let mut skipped = 0usize;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(line) {
                Ok(record) => records.push(record),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("skipped {skipped} unreadable history lines");
        }
        let max = self.config.max_memory_records;
        if max > 0 && records.len() > max {
            let excess = records.len() - max;
            records.drain(..excess);
        }
        records
    }

    fn append_to_disk(&self, record: &HistoryRecord) {
        if let Some(parent) = self.path.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!("failed to create history directory: {err}");
            return;
        }
        self.rotate_if_needed();

        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(err) => {
                warn!("failed to serialize history record: {err}");
                return;
            }
        };
        match fs::OpenOptions::new().append(true).create(true).open(&self.path) {
            Ok(mut file) => {
                if let Err(err) = writeln!(file, "{line}") {
                    warn!("failed to append history record: {err}");
                }
            }
            Err(err) => warn!("failed to open history file: {err}"),
        }
    }

    fn rotate_if_needed(&self) {
        let Ok(meta) = fs::metadata(&self.path) else {
            return;
        };
        if meta.len() < self.config.max_file_bytes {
            return;
        }
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("history");
        let ext = self
            .path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("jsonl");
        let rotated = self.path.with_file_name(format!("{stem}_{stamp}.{ext}"));
        match fs::rename(&self.path, &rotated) {
            Ok(()) => info!("rotated history to {}", rotated.display()),
            Err(err) => warn!("history rotation failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir, config: HistoryConfig) -> HistoryStore {
        HistoryStore::new(dir.path().join("history.jsonl"), config)
    }

    fn default_fuzzy() -> FuzzyParams {
        FuzzyParams {
            threshold: 0.75,
            min_length_ratio: 0.3,
            max_length_ratio: 3.0,
        }
    }

    #[test]
    fn normalization_keeps_word_characters_only() {
        assert_eq!(normalize_text("  How do I Zero-Out? "), "howdoizeroout");
        assert_eq!(normalize_text("把选中物体清零!"), "把选中物体清零");
        assert_eq!(normalize_text("a_b c"), "a_bc");
        assert_eq!(normalize_text("!!!"), "");
    }

    #[test]
    fn append_and_search_most_recent_first() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir, HistoryConfig::default());

        store.append("how to rig a leg", "use three joints", &[], false);
        store.append(
            "zero the selection",
            "done",
            &["zero_out_transforms".to_string()],
            false,
        );
        store.append("what is a locator", "a null transform", &[], false);

        let all = store.search("", 0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].user_input, "what is a locator");

        let hits = store.search("ZERO", 0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tools_used, vec!["zero_out_transforms"]);

        let limited = store.search("", 2);
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn records_survive_reload() {
        let dir = TempDir::new().unwrap();
        let session;
        {
            let mut store = store_in(&dir, HistoryConfig::default());
            session = store.session_id().to_string();
            store.append("q1", "a1", &[], false);
            store.append("q2", "a2", &[], true);
        }
        let mut store = store_in(&dir, HistoryConfig::default());
        let records = store.session_records(&session);
        assert_eq!(records.len(), 2);
        assert!(records[1].is_shortcut);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        fs::write(
            &path,
            "not json at all\n{\"session_id\":\"s\",\"user_input\":\"ok\",\"assistant_reply\":\"fine\"}\n",
        )
        .unwrap();

        let mut store = HistoryStore::new(path, HistoryConfig::default());
        let all = store.search("", 0);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].user_input, "ok");
    }

    #[test]
    fn file_rotates_past_size_limit() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(
            &dir,
            HistoryConfig {
                max_file_bytes: 64,
                ..HistoryConfig::default()
            },
        );

        store.append("first question", "first answer", &[], false);
        store.append("second question", "second answer", &[], false);

        let files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("history"))
            .collect();
        assert_eq!(files.len(), 2, "expected current file plus one rotation");

        let current = fs::read_to_string(store.path()).unwrap();
        assert_eq!(current.lines().count(), 1);
    }

    #[test]
    fn memory_window_is_bounded() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(
            &dir,
            HistoryConfig {
                max_memory_records: 3,
                ..HistoryConfig::default()
            },
        );
        for i in 0..5 {
            store.append(&format!("q{i}"), "a", &[], false);
        }
        let all = store.search("", 0);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].user_input, "q4");
    }

    #[test]
    fn similar_question_returns_past_reply() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir, HistoryConfig::default());
        store.append(
            "how do I center the pivot on a mesh",
            "use the center pivot command",
            &[],
            false,
        );

        let hit = store.find_similar("How do I center the pivot on a mesh?", &default_fuzzy());
        assert_eq!(hit.as_deref(), Some("use the center pivot command"));

        assert!(
            store
                .find_similar("completely different topic", &default_fuzzy())
                .is_none()
        );
    }

    #[test]
    fn tool_and_shortcut_records_are_not_reused() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir, HistoryConfig::default());
        store.append(
            "zero out the selected nodes now",
            "zeroed 3 nodes",
            &["zero_out_transforms".to_string()],
            false,
        );
        store.append("zero out the selected nodes too", "zeroed again", &[], true);

        assert!(
            store
                .find_similar("zero out the selected nodes now", &default_fuzzy())
                .is_none()
        );
    }

    #[test]
    fn length_ratio_prefilter_applies() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir, HistoryConfig::default());
        store.append(
            "this is a fairly long question about constraint behavior in rigs",
            "long detailed reply",
            &[],
            false,
        );

        // Far too short relative to the stored question.
        assert!(store.find_similar("rigs", &default_fuzzy()).is_none());
    }

    #[test]
    fn sessions_and_stats_are_grouped() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir, HistoryConfig::default());
        let first = store.session_id().to_string();
        store.append("q1", "a1", &[], false);
        store.append("q2", "a2", &[], true);
        let second = store.begin_session();
        store.append("q3", "a3", &["set_keyframe".to_string()], false);

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, first);
        assert_eq!(sessions[0].records, 2);
        assert_eq!(sessions[1].id, second);

        let stats = store.stats();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.shortcut_records, 1);
        assert_eq!(stats.tool_records, 1);

        assert_eq!(store.clear_all(), 3);
        assert_eq!(store.stats().total_records, 0);
    }
}
