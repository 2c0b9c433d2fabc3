// Result cache
//
// Per-category, per-workspace scan results. The map lock is only held long
// enough to find a key's slot; readers and writers then contend on that slot
// alone, so a completing scan never blocks reads of other categories.

pub mod watcher;

pub use watcher::{
    ChangeFilter, DebounceFilter, EventSink, FileChangeWatcher, FileEvent, FileEventKind,
    FsEventSource,
};

use crate::metrics::Metrics;
use crate::models::{ScanCategory, ScanOutcome};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Cached result of the last scan of one category in one workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub category: ScanCategory,
    pub workspace_key: String,
    pub outcome: ScanOutcome,
    pub timestamp: DateTime<Utc>,
    /// Set by the file watcher; obsolete entries are no longer served by
    /// [`ResultCache::get`] but stay visible through [`ResultCache::peek`].
    pub obsolete: bool,
}

/// Hit/miss counters of a [`ResultCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

type Slot = Arc<RwLock<Option<CacheEntry>>>;

#[derive(Debug, Default)]
pub struct ResultCache {
    slots: RwLock<HashMap<(ScanCategory, String), Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

/// Normalised cache key for a workspace path.
pub fn workspace_key(workspace: &Utf8Path) -> String {
    let s = workspace.as_str();
    let trimmed = s.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() { s.to_string() } else { trimmed.to_string() }
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    fn slot(&self, category: ScanCategory, workspace: &Utf8Path) -> Option<Slot> {
        self.slots
            .read()
            .unwrap()
            .get(&(category, workspace_key(workspace)))
            .cloned()
    }

    fn slot_or_insert(&self, category: ScanCategory, workspace: &Utf8Path) -> Slot {
        if let Some(slot) = self.slot(category, workspace) {
            return slot;
        }
        self.slots
            .write()
            .unwrap()
            .entry((category, workspace_key(workspace)))
            .or_default()
            .clone()
    }

    /// Fresh entry for the pair, or `None` if missing or obsolete.
    pub fn get(&self, category: ScanCategory, workspace: &Utf8Path) -> Option<CacheEntry> {
        let entry = self
            .slot(category, workspace)
            .and_then(|slot| slot.read().unwrap().clone())
            .filter(|e| !e.obsolete);

        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &self.metrics {
                m.record_cache_hit();
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &self.metrics {
                m.record_cache_miss();
            }
        }
        entry
    }

    /// Entry for the pair including obsolete ones. Does not count as a hit or miss.
    pub fn peek(&self, category: ScanCategory, workspace: &Utf8Path) -> Option<CacheEntry> {
        self.slot(category, workspace)
            .and_then(|slot| slot.read().unwrap().clone())
    }

    /// Replace the entry for the pair wholesale.
    ///
    /// Cancelled outcomes are never cached; returns `false` for them.
    pub fn store(&self, category: ScanCategory, workspace: &Utf8Path, outcome: ScanOutcome) -> bool {
        if outcome.is_cancelled() {
            return false;
        }

        let entry = CacheEntry {
            category,
            workspace_key: workspace_key(workspace),
            outcome,
            timestamp: Utc::now(),
            obsolete: false,
        };
        *self.slot_or_insert(category, workspace).write().unwrap() = Some(entry);
        tracing::debug!("Cached {} result for {}", category, workspace);
        true
    }

    /// Mark the pair's entry obsolete. Returns `true` if a fresh entry was marked.
    pub fn mark_obsolete(&self, category: ScanCategory, workspace: &Utf8Path) -> bool {
        let Some(slot) = self.slot(category, workspace) else {
            return false;
        };
        let mut guard = slot.write().unwrap();
        match guard.as_mut() {
            Some(entry) if !entry.obsolete => {
                entry.obsolete = true;
                true
            }
            _ => false,
        }
    }

    /// Drop every entry of a workspace.
    pub fn invalidate_workspace(&self, workspace: &Utf8Path) {
        let key = workspace_key(workspace);
        self.slots.write().unwrap().retain(|(_, ws), _| *ws != key);
    }

    pub fn clear(&self) {
        self.slots.write().unwrap().clear();
    }

    /// Current entries (fresh and obsolete) of a workspace.
    pub fn entries(&self, workspace: &Utf8Path) -> Vec<CacheEntry> {
        let key = workspace_key(workspace);
        let slots: Vec<Slot> = self
            .slots
            .read()
            .unwrap()
            .iter()
            .filter(|((_, ws), _)| *ws == key)
            .map(|(_, slot)| slot.clone())
            .collect();

        let mut entries: Vec<CacheEntry> = slots
            .iter()
            .filter_map(|slot| slot.read().unwrap().clone())
            .collect();
        entries.sort_by_key(|e| e.category);
        entries
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
