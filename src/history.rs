//! Rolling conversation window and seen-event dedup set.
//!
//! Both live in one store because they are written by the same owner
//! (the subscription loop). The window is persisted synchronously after
//! every turn; the seen set is in-memory with bounded FIFO eviction.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

/// Dedup set size that triggers a prune.
const SEEN_LIMIT: usize = 1000;
/// How many of the oldest keys a prune removes.
const SEEN_PRUNE: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub sender: String,
    pub content: String,
    /// Local wall-clock label, "HH:MM".
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    messages: Vec<ConversationTurn>,
    last_updated: String,
}

/// Dedup key for one logical message.
pub fn event_key(sender: &str, timestamp: i64) -> String {
    format!("{}_{}", sender, timestamp)
}

fn time_label(timestamp_millis: i64) -> String {
    Local
        .timestamp_millis_opt(timestamp_millis)
        .single()
        .map(|dt| dt.format("%H:%M").to_string())
        .unwrap_or_else(|| "00:00".to_string())
}

pub struct ChatStore {
    path: PathBuf,
    capacity: usize,
    messages: VecDeque<ConversationTurn>,
    seen: HashSet<String>,
    /// Insertion order of `seen`, oldest first, for FIFO eviction.
    seen_order: VecDeque<String>,
}

impl ChatStore {
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            capacity: capacity.max(1),
            messages: VecDeque::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Construct and repopulate the window from disk. History is
    /// best-effort: any read or parse failure starts empty.
    pub fn load(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let mut store = Self::new(path, capacity);
        match read_history(&store.path) {
            Ok(Some(data)) => {
                for turn in data.messages {
                    store.messages.push_back(turn);
                    if store.messages.len() > store.capacity {
                        store.messages.pop_front();
                    }
                }
                tracing::info!("Loaded {} messages from history", store.messages.len());
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Failed to load history from {:?}: {}", store.path, e);
            }
        }
        store
    }

    /// Append a turn, evicting the oldest beyond capacity, and persist
    /// the full window before returning.
    pub fn record_turn(&mut self, sender: &str, content: &str, timestamp_millis: i64) {
        self.messages.push_back(ConversationTurn {
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: time_label(timestamp_millis),
        });
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }

        if let Err(e) = self.save() {
            // In-memory state stays authoritative; durability resumes on
            // the next successful write.
            tracing::error!("Failed to save history to {:?}: {}", self.path, e);
        }
    }

    fn save(&self) -> Result<()> {
        let data = HistoryFile {
            messages: self.messages.iter().cloned().collect(),
            last_updated: Local::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&data).context("serialize history")?;
        fs::write(&self.path, json)
            .with_context(|| format!("write history file {}", self.path.display()))?;
        Ok(())
    }

    /// Context for the responder: the window excluding the turn that was
    /// just recorded, empty when there is at most one entry.
    pub fn context_window(&self) -> Vec<ConversationTurn> {
        if self.messages.len() > 1 {
            self.messages
                .iter()
                .take(self.messages.len() - 1)
                .cloned()
                .collect()
        } else {
            Vec::new()
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.messages.iter()
    }

    pub fn has_responded(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn mark_responded(&mut self, key: &str) {
        if !self.seen.insert(key.to_string()) {
            return;
        }
        self.seen_order.push_back(key.to_string());

        if self.seen_order.len() > SEEN_LIMIT {
            for _ in 0..SEEN_PRUNE {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
            tracing::debug!("Pruned seen-event set to {} entries", self.seen.len());
        }
    }

    #[cfg(test)]
    fn seen_len(&self) -> usize {
        self.seen.len()
    }
}

fn read_history(path: &Path) -> Result<Option<HistoryFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let data = serde_json::from_str(&contents).context("parse history file")?;
    Ok(Some(data))
}
