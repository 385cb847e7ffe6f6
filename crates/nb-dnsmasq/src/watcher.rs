//! Filesystem watch plumbing shared by the lease and config stores.
//!
//! Each store owns one [`FileWatcher`]. Events are forwarded into a bounded
//! channel; a store's loop drains it and runs a full reload for every relevant
//! event, including the ones caused by its own saves.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch, Mutex};

const EVENT_QUEUE_DEPTH: usize = 64;

pub type EventReceiver = mpsc::Receiver<notify::Result<Event>>;

struct WatchState {
    watcher: RecommendedWatcher,
    watched: HashSet<PathBuf>,
}

pub struct FileWatcher {
    state: Mutex<Option<WatchState>>,
    events: Mutex<Option<EventReceiver>>,
}

impl FileWatcher {
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Full queue: a reload is already pending.
            let _ = tx.try_send(res);
        })
        .context("Failed to create filesystem watcher")?;

        Ok(Self {
            state: Mutex::new(Some(WatchState {
                watcher,
                watched: HashSet::new(),
            })),
            events: Mutex::new(Some(rx)),
        })
    }

    /// Watch a directory (non-recursive). Returns false if it was already
    /// watched or the watcher is closed.
    pub async fn watch(&self, dir: &Path) -> Result<bool> {
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_mut() else {
            return Ok(false);
        };
        if state.watched.contains(dir) {
            return Ok(false);
        }
        state
            .watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
        state.watched.insert(dir.to_path_buf());
        Ok(true)
    }

    pub async fn is_watching(&self, dir: &Path) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.watched.contains(dir))
    }

    /// Hand the event stream to a reload loop. Only the first caller gets it.
    pub async fn take_events(&self) -> Option<EventReceiver> {
        self.events.lock().await.take()
    }

    /// Drop the OS watcher. Any running loop sees its channel close and exits.
    pub async fn close(&self) {
        self.state.lock().await.take();
    }
}

/// Events that can change file content: creation, writes, renames, removal.
pub fn is_change_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Wait for the next watcher event. `None` once shutdown is signalled or the
/// watcher has been closed.
pub async fn next_event(
    events: &mut EventReceiver,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<notify::Result<Event>> {
    loop {
        if *shutdown.borrow_and_update() {
            return None;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            event = events.recv() => return event,
        }
    }
}
