//! Diagnostic events emitted at each load phase
//!
//! Events are informational. Subscribers that fall behind lose the oldest
//! events; the loader never waits for them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::engine::ExecutionMode;

/// Loader phase transition
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoaderEvent {
    LoadStarted {
        module: String,
    },
    ModeSelected {
        module: String,
        mode: ExecutionMode,
        reason: String,
    },
    CacheHit {
        module: String,
        bytes: usize,
    },
    CacheMiss {
        module: String,
    },
    Downloaded {
        module: String,
        bytes: usize,
    },
    Instantiated {
        module: String,
        mode: ExecutionMode,
    },
    Ready {
        module: String,
        mode: ExecutionMode,
        elapsed_ms: u64,
    },
    FallbackToInline {
        module: String,
        reason: String,
    },
    Failed {
        module: String,
        error: String,
    },
    ModeDowngraded {
        reason: String,
    },
    ModeReset,
    Invoked {
        module: String,
        function: String,
        mode: ExecutionMode,
        elapsed_ms: u64,
    },
}

impl LoaderEvent {
    /// Module the event concerns, if any
    pub fn module(&self) -> Option<&str> {
        match self {
            LoaderEvent::LoadStarted { module }
            | LoaderEvent::ModeSelected { module, .. }
            | LoaderEvent::CacheHit { module, .. }
            | LoaderEvent::CacheMiss { module }
            | LoaderEvent::Downloaded { module, .. }
            | LoaderEvent::Instantiated { module, .. }
            | LoaderEvent::Ready { module, .. }
            | LoaderEvent::FallbackToInline { module, .. }
            | LoaderEvent::Failed { module, .. }
            | LoaderEvent::Invoked { module, .. } => Some(module),
            LoaderEvent::ModeDowngraded { .. } | LoaderEvent::ModeReset => None,
        }
    }

    fn log(&self) {
        match self {
            LoaderEvent::LoadStarted { module } => info!("Loading module {}", module),
            LoaderEvent::ModeSelected { module, mode, reason } => {
                info!("Module {} will run {} ({})", module, mode, reason)
            }
            LoaderEvent::CacheHit { module, bytes } => {
                debug!("Module {} served from cache ({} bytes)", module, bytes)
            }
            LoaderEvent::CacheMiss { module } => debug!("Module {} not cached", module),
            LoaderEvent::Downloaded { module, bytes } => {
                info!("Module {} downloaded ({} bytes)", module, bytes)
            }
            LoaderEvent::Instantiated { module, mode } => {
                debug!("Module {} instantiated {}", module, mode)
            }
            LoaderEvent::Ready {
                module,
                mode,
                elapsed_ms,
            } => info!("Module {} ready ({}, {}ms)", module, mode, elapsed_ms),
            LoaderEvent::FallbackToInline { module, reason } => {
                warn!("Module {} falling back to inline execution: {}", module, reason)
            }
            LoaderEvent::Failed { module, error } => warn!("Module {} failed to load: {}", module, error),
            LoaderEvent::ModeDowngraded { reason } => {
                warn!("Isolated execution disabled for this loader: {}", reason)
            }
            LoaderEvent::ModeReset => info!("Execution mode reset; isolated execution preferred"),
            LoaderEvent::Invoked {
                module,
                function,
                mode,
                elapsed_ms,
            } => debug!("Invoked {}::{} ({}, {}ms)", module, function, mode, elapsed_ms),
        }
    }
}

/// Event with its emission time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LoaderEvent,
}

/// Broadcast fan-out of loader events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventRecord>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Log the event and deliver it to current subscribers
    pub fn emit(&self, event: LoaderEvent) {
        event.log();
        let _ = self.sender.send(EventRecord {
            at: Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }
}
