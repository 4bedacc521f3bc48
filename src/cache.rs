use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::history::{FuzzyParams, HistoryStore, normalize_text};

/// One cached reply, keyed by the hash of the normalized query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub normalized: String,
    pub query: String,
    pub response: String,
    /// Unix seconds when the entry was stored.
    pub timestamp: i64,
    pub last_access: i64,
    pub hit_count: u64,
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub total_hits: u64,
    pub max_entries: usize,
    pub ttl_days: f64,
}

/// Caches model replies to repeated questions.
///
/// Lookup runs two tiers: an exact match on the normalized query, then a
/// similarity search over past conversations in the history store. Only
/// plain text replies land here; anything produced through tool calls
/// depends on scene state and must not be replayed.
pub struct ResponseCache {
    path: PathBuf,
    config: CacheConfig,
    entries: Option<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(path: PathBuf, config: CacheConfig) -> Self {
        Self {
            path,
            config,
            entries: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn lookup(&mut self, query: &str, history: &mut HistoryStore) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        let normalized = normalize_text(query);
        if normalized.is_empty() {
            return None;
        }

        let key = query_hash(&normalized);
        let ttl = self.config.ttl_secs as i64;
        let now = Utc::now().timestamp();

        let entries = self.ensure_loaded();
        if entries.get(&key).is_some_and(|e| now - e.timestamp > ttl) {
            debug!("dropping expired cache entry");
            entries.remove(&key);
        } else if let Some(entry) = entries.get_mut(&key)
            && entry.normalized == normalized
        {
            entry.hit_count += 1;
            entry.last_access = now;
            debug!("exact cache hit ({} uses)", entry.hit_count);
            return Some(entry.response.clone());
        }

        let fuzzy = FuzzyParams {
            threshold: self.config.similarity,
            min_length_ratio: self.config.min_length_ratio,
            max_length_ratio: self.config.max_length_ratio,
        };
        history.find_similar(query, &fuzzy)
    }

    pub fn store(&mut self, query: &str, response: &str) {
        if !self.config.enabled {
            return;
        }
        let normalized = normalize_text(query);
        // Tiny replies are usually refusals or errors, not worth keeping.
        if normalized.is_empty() || response.chars().count() < self.config.min_response_chars {
            return;
        }

        let key = query_hash(&normalized);
        let now = Utc::now().timestamp();
        let ttl = self.config.ttl_secs as i64;
        let max_entries = self.config.max_entries;

        let entries = self.ensure_loaded();
        entries.insert(
            key,
            CacheEntry {
                normalized,
                query: query.trim().to_string(),
                response: response.to_string(),
                timestamp: now,
                last_access: now,
                hit_count: 0,
            },
        );

        entries.retain(|_, e| now - e.timestamp <= ttl);
        if entries.len() > max_entries {
            let mut by_age: Vec<(String, i64)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.last_access))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            let excess = entries.len() - max_entries;
            for (stale, _) in by_age.into_iter().take(excess) {
                entries.remove(&stale);
            }
        }

        self.save();
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.ensure_loaded().len();
        self.entries = Some(HashMap::new());
        if self.path.exists()
            && let Err(err) = fs::remove_file(&self.path)
        {
            warn!("failed to remove cache file: {err}");
        }
        cleared
    }

    pub fn stats(&mut self) -> CacheStats {
        let max_entries = self.config.max_entries;
        let ttl_days = self.config.ttl_secs as f64 / 86_400.0;
        let entries = self.ensure_loaded();
        CacheStats {
            entries: entries.len(),
            total_hits: entries.values().map(|e| e.hit_count).sum(),
            max_entries,
            ttl_days,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn ensure_loaded(&mut self) -> &mut HashMap<String, CacheEntry> {
        if self.entries.is_none() {
            self.entries = Some(self.load());
        }
        self.entries.get_or_insert_with(HashMap::new)
    }

    fn load(&self) -> HashMap<String, CacheEntry> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("unreadable cache file, starting fresh: {err}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    fn save(&mut self) {
        let Some(entries) = &self.entries else {
            return;
        };
        let serialized = match serde_json::to_string_pretty(entries) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!("failed to serialize cache: {err}");
                return;
            }
        };
        if let Some(parent) = self.path.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!("failed to create cache directory: {err}");
            return;
        }
        if let Err(err) = fs::write(&self.path, serialized) {
            warn!("failed to write cache file: {err}");
        }
    }

    #[cfg(test)]
    pub(crate) fn age_entry(&mut self, query: &str, seconds: i64) {
        let key = query_hash(&normalize_text(query));
        if let Some(entry) = self.ensure_loaded().get_mut(&key) {
            entry.timestamp -= seconds;
            entry.last_access -= seconds;
        }
    }
}

fn query_hash(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}
