//! C4 File-change Watcher Registry: one debounced filesystem watcher per
//! workspace, multiplexing subscribers. Backed by `notify`'s documented
//! `RecommendedWatcher` + channel delivery, with a hand-rolled 100 ms
//! coalescing window (mirroring the bespoke windowing logic used elsewhere
//! in this codebase, e.g. `LoginRateLimiter`).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::workspace::is_hidden_path;

pub type Subscriber = mpsc::UnboundedSender<Vec<String>>;

struct WatchEntry {
    /// Kept alive only to keep the OS-level watch armed; dropping it tears
    /// the watch down.
    _watcher: std::sync::Mutex<RecommendedWatcher>,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_sub_id: AtomicU64,
    pending: Mutex<HashSet<String>>,
    timer_active: AtomicBool,
    debounce_ms: u64,
}

impl WatchEntry {
    async fn record_and_maybe_schedule(self: Arc<Self>, paths: Vec<String>) {
        {
            let mut pending = self.pending.lock().await;
            for p in paths {
                if !is_hidden_path(&p) {
                    pending.insert(p);
                }
            }
        }
        if !self.timer_active.swap(true, Ordering::SeqCst) {
            tokio::spawn(self.clone().flush_after_debounce());
        }
    }

    async fn flush_after_debounce(self: Arc<Self>) {
        tokio::time::sleep(Duration::from_millis(self.debounce_ms)).await;
        let paths: Vec<String> = {
            let mut pending = self.pending.lock().await;
            let out: Vec<String> = pending.iter().cloned().collect();
            pending.clear();
            out
        };
        // Rearm before delivering: a fresh event arriving during delivery
        // starts the next window rather than being folded into this one.
        self.timer_active.store(false, Ordering::SeqCst);
        if paths.is_empty() {
            return;
        }
        // Snapshot the subscriber list so adds/removes mid-flush are only
        // observed starting from the next flush.
        let subs: Vec<Subscriber> = self.subscribers.read().await.values().cloned().collect();
        for sub in subs {
            let _ = sub.send(paths.clone());
        }
    }
}

pub struct WatcherRegistry {
    entries: RwLock<HashMap<PathBuf, Arc<WatchEntry>>>,
}

impl Default for WatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber for `watch_dir`, creating the underlying
    /// watcher on first use. Returns a subscriber id (for `unsubscribe`)
    /// and a receiver of coalesced, deduplicated relative-path batches.
    pub async fn subscribe(
        &self,
        watch_dir: &Path,
        debounce_ms: u64,
    ) -> notify::Result<(u64, mpsc::UnboundedReceiver<Vec<String>>)> {
        let entry = self.get_or_create(watch_dir, debounce_ms).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = entry.next_sub_id.fetch_add(1, Ordering::SeqCst);
        entry.subscribers.write().await.insert(id, tx);
        Ok((id, rx))
    }

    pub async fn unsubscribe(&self, watch_dir: &Path, id: u64) {
        let Some(entry) = self.entries.read().await.get(watch_dir).cloned() else {
            return;
        };
        entry.subscribers.write().await.remove(&id);
        if entry.subscribers.read().await.is_empty() {
            self.entries.write().await.remove(watch_dir);
        }
    }

    /// Tears down the watcher for `watch_dir` unconditionally: clears the
    /// timer state implicitly (the entry, and any pending flush task's
    /// strong reference, are dropped), closes the OS-level watcher, and
    /// clears subscribers. Called before a session's workspace directory
    /// is removed.
    pub async fn stop(&self, watch_dir: &Path) {
        if let Some(entry) = self.entries.write().await.remove(watch_dir) {
            entry.subscribers.write().await.clear();
        }
    }

    async fn get_or_create(
        &self,
        watch_dir: &Path,
        debounce_ms: u64,
    ) -> notify::Result<Arc<WatchEntry>> {
        if let Some(entry) = self.entries.read().await.get(watch_dir) {
            return Ok(entry.clone());
        }
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(watch_dir) {
            return Ok(entry.clone());
        }
        std::fs::create_dir_all(watch_dir).ok();
        let handle = tokio::runtime::Handle::current();
        let root = watch_dir.to_path_buf();
        let mut build_err = None;

        // `new_cyclic` hands the closure a `Weak` back-reference before the
        // `Arc` itself exists, so the watcher callback can reach the entry
        // it belongs to without a throwaway first construction.
        let entry = Arc::new_cyclic(|weak: &std::sync::Weak<WatchEntry>| {
            let weak = weak.clone();
            let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
                let Ok(event) = res else { return };
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                let mut rel_paths = Vec::new();
                for p in &event.paths {
                    if let Ok(rel) = p.strip_prefix(&root) {
                        let rel = rel.to_string_lossy().replace('\\', "/");
                        if !rel.is_empty() {
                            rel_paths.push(rel);
                        }
                    }
                }
                if rel_paths.is_empty() {
                    return;
                }
                let Some(entry) = weak.upgrade() else { return };
                handle.spawn(entry.record_and_maybe_schedule(rel_paths));
            });
            let mut watcher = match watcher {
                Ok(w) => w,
                Err(e) => {
                    build_err = Some(e);
                    // Placeholder watcher; discarded via the error path below.
                    notify::recommended_watcher(|_: notify::Result<Event>| {})
                        .expect("recommended_watcher with a no-op closure never fails")
                }
            };
            if build_err.is_none() {
                if let Err(e) = watcher.watch(&watch_dir.to_path_buf(), RecursiveMode::Recursive) {
                    build_err = Some(e);
                }
            }
            WatchEntry {
                _watcher: std::sync::Mutex::new(watcher),
                subscribers: RwLock::new(HashMap::new()),
                next_sub_id: AtomicU64::new(0),
                pending: Mutex::new(HashSet::new()),
                timer_active: AtomicBool::new(false),
                debounce_ms,
            }
        });
        if let Some(e) = build_err {
            return Err(e);
        }
        entries.insert(watch_dir.to_path_buf(), entry.clone());
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn subscribe_and_receive_coalesced_change() {
        let dir = tempdir().unwrap();
        let registry = WatcherRegistry::new();
        let (_id, mut rx) = registry.subscribe(dir.path(), 50).await.unwrap();

        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"hi").unwrap();

        let batch = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("should receive a batch")
            .expect("channel open");
        assert!(batch.iter().any(|p| p == "a.txt"));
    }

    #[tokio::test]
    async fn unsubscribe_removes_entry_when_empty() {
        let dir = tempdir().unwrap();
        let registry = WatcherRegistry::new();
        let (id, _rx) = registry.subscribe(dir.path(), 50).await.unwrap();
        registry.unsubscribe(dir.path(), id).await;
        assert!(registry.entries.read().await.get(dir.path()).is_none());
    }

    #[tokio::test]
    async fn stop_clears_subscribers() {
        let dir = tempdir().unwrap();
        let registry = WatcherRegistry::new();
        let (_id, _rx) = registry.subscribe(dir.path(), 50).await.unwrap();
        registry.stop(dir.path()).await;
        assert!(registry.entries.read().await.is_empty());
    }
}
