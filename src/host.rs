//! Collaborators the editor core calls into.
//!
//! The core never reaches for a UI directly. Whoever embeds it passes these
//! capabilities in at construction; each one is optional, and a missing one is
//! simply not called.
//!
//! | Trait | Used by | For |
//! |---|---|---|
//! | [`Notifier`] | loading, preview | user-visible warnings and errors |
//! | [`ControlPanel`] | loading | enabling/disabling filter controls |
//! | [`FilterSource`] | preview | reading the current filter values from a form |

use crate::imaging::{FilterKind, FilterState};
use tracing::{error, info, warn};

/// User-visible notifications (toasts in a GUI, log lines in the CLI).
pub trait Notifier: Send + Sync {
    fn warning(&self, message: &str);
    fn error(&self, message: &str);
    fn success(&self, message: &str);
}

/// Filter controls that can be disabled while work is in flight.
pub trait ControlPanel: Send + Sync {
    fn set_control_enabled(&self, filter: FilterKind, enabled: bool);
}

/// Validated accessor for the filter values currently set in the UI.
pub trait FilterSource: Send + Sync {
    fn current_filters(&self) -> FilterState;
}

/// Routes notifications to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn warning(&self, message: &str) {
        warn!(target: "simple_edit::notify", "{message}");
    }

    fn error(&self, message: &str) {
        error!(target: "simple_edit::notify", "{message}");
    }

    fn success(&self, message: &str) {
        info!(target: "simple_edit::notify", "{message}");
    }
}
