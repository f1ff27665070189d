//! Named loading indicators with safety timeouts.
//!
//! Each in-flight operation shows an indicator under a name: a filter name
//! (`"brightness"`) while that filter is being applied, or [`GLOBAL`] for work
//! that touches everything. While a name is active the matching filter
//! controls are disabled; `"global"` disables all of them. Other names
//! (`"export"`) only track state.
//!
//! Showing an already active name refreshes its message and restarts its
//! timeout; it never stacks. If a name is still active when its timeout fires,
//! it is hidden anyway and the user is warned, so a lost `hide` cannot leave
//! the controls locked.

use crate::config::LoadingConfig;
use crate::host::{ControlPanel, Notifier};
use crate::imaging::FilterKind;
use crate::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The name used when no specific operation is given.
pub const GLOBAL: &str = "global";

struct Token {
    message: String,
    generation: u64,
    timer: JoinHandle<()>,
}

struct Inner {
    timeout: Duration,
    notifier: Option<Arc<dyn Notifier>>,
    controls: Option<Arc<dyn ControlPanel>>,
    active: Mutex<HashMap<String, Token>>,
    next_generation: Mutex<u64>,
}

/// Tracks active loading indicators. Cheap to clone; clones share state.
///
/// `show` spawns a timer, so it must be called inside a tokio runtime.
#[derive(Clone)]
pub struct LoadingCoordinator {
    inner: Arc<Inner>,
}

impl LoadingCoordinator {
    pub fn new(
        timeout: Duration,
        notifier: Option<Arc<dyn Notifier>>,
        controls: Option<Arc<dyn ControlPanel>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                timeout,
                notifier,
                controls,
                active: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
            }),
        }
    }

    pub fn from_config(
        config: &LoadingConfig,
        notifier: Option<Arc<dyn Notifier>>,
        controls: Option<Arc<dyn ControlPanel>>,
    ) -> Self {
        Self::new(config.timeout(), notifier, controls)
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Show the indicator for `name`, or refresh it if already shown.
    pub fn show(&self, name: &str, message: &str) {
        let generation = {
            let mut next = lock(&self.inner.next_generation);
            *next += 1;
            *next
        };
        let timer = self.spawn_timer(name.to_string(), generation);

        let mut active = lock(&self.inner.active);
        let fresh = match active.get_mut(name) {
            Some(token) => {
                token.timer.abort();
                token.timer = timer;
                token.generation = generation;
                token.message = message.to_string();
                false
            }
            None => {
                active.insert(
                    name.to_string(),
                    Token {
                        message: message.to_string(),
                        generation,
                        timer,
                    },
                );
                true
            }
        };
        drop(active);

        if fresh {
            debug!(name, message, "loading shown");
            self.sync_controls(name);
        }
    }

    /// Hide the indicator for `name`. Returns whether it was shown.
    pub fn hide(&self, name: &str) -> bool {
        let removed = lock(&self.inner.active).remove(name);
        match removed {
            Some(token) => {
                token.timer.abort();
                debug!(name, "loading hidden");
                self.sync_controls(name);
                true
            }
            None => false,
        }
    }

    pub fn hide_all(&self) {
        let drained: Vec<(String, Token)> = lock(&self.inner.active).drain().collect();
        for (name, token) in &drained {
            token.timer.abort();
            self.sync_controls(name);
        }
    }

    pub fn is_loading(&self, name: &str) -> bool {
        lock(&self.inner.active).contains_key(name)
    }

    pub fn has_any_loading(&self) -> bool {
        !lock(&self.inner.active).is_empty()
    }

    /// Active names, sorted.
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.active).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn message(&self, name: &str) -> Option<String> {
        lock(&self.inner.active).get(name).map(|t| t.message.clone())
    }

    fn spawn_timer(&self, name: String, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                LoadingCoordinator { inner }.expire(&name, generation);
            }
        })
    }

    fn expire(&self, name: &str, generation: u64) {
        {
            let mut active = lock(&self.inner.active);
            match active.get(name) {
                Some(token) if token.generation == generation => {
                    active.remove(name);
                }
                _ => return,
            }
        }
        warn!(name, timeout = ?self.inner.timeout, "loading indicator timed out");
        self.sync_controls(name);
        if let Some(notifier) = &self.inner.notifier {
            notifier.warning(&format!("{name} is taking too long and was stopped waiting for"));
        }
    }

    /// Recompute the enabled state of every control `name` affects.
    fn sync_controls(&self, name: &str) {
        let Some(controls) = &self.inner.controls else {
            return;
        };
        let affected: Vec<FilterKind> = if name == GLOBAL {
            FilterKind::ALL.to_vec()
        } else {
            match name.parse::<FilterKind>() {
                Ok(kind) => vec![kind],
                Err(_) => return,
            }
        };
        let updates: Vec<(FilterKind, bool)> = {
            let active = lock(&self.inner.active);
            let global = active.contains_key(GLOBAL);
            affected
                .into_iter()
                .map(|kind| (kind, !(global || active.contains_key(kind.name()))))
                .collect()
        };
        for (kind, enabled) in updates {
            controls.set_control_enabled(kind, enabled);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let active = self.active.get_mut().unwrap_or_else(PoisonError::into_inner);
        for token in active.values() {
            token.timer.abort();
        }
    }
}
