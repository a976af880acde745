//! UI instance lifecycle.
//!
//! Each instance moves `Unregistered -> Visible -> Disposed` and never goes
//! back. Exactly one visible instance is active for command routing.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Lifecycle state of one UI instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiState {
    Unregistered,
    Visible,
    Disposed,
}

#[derive(Debug, Default)]
struct Instances {
    states: HashMap<String, UiState>,
    // Visible instances, most recently shown last.
    visible_order: Vec<String>,
}

/// Tracks every UI instance the host knows about.
#[derive(Debug, Default)]
pub struct UiInstances {
    inner: Mutex<Instances>,
}

impl UiInstances {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Instances> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new instance. Returns `false` if the id is already known.
    pub fn register(&self, instance_id: impl Into<String>) -> bool {
        let mut inner = self.lock();
        let instance_id = instance_id.into();
        if inner.states.contains_key(&instance_id) {
            return false;
        }
        inner.states.insert(instance_id, UiState::Unregistered);
        true
    }

    /// `Unregistered -> Visible`. The instance becomes the active one.
    ///
    /// Unknown ids are registered on the fly. Disposed instances stay disposed.
    pub fn mark_visible(&self, instance_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.states.get(instance_id).copied() {
            Some(UiState::Disposed) => false,
            Some(UiState::Visible) => true,
            Some(UiState::Unregistered) | None => {
                inner.states.insert(instance_id.to_owned(), UiState::Visible);
                inner.visible_order.push(instance_id.to_owned());
                tracing::debug!(instance_id = %instance_id, "ui instance visible");
                true
            }
        }
    }

    /// `* -> Disposed`. Returns `false` if it was already disposed or unknown.
    pub fn dispose(&self, instance_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.states.get(instance_id).copied() {
            None | Some(UiState::Disposed) => false,
            Some(_) => {
                inner.states.insert(instance_id.to_owned(), UiState::Disposed);
                inner.visible_order.retain(|id| id != instance_id);
                tracing::debug!(instance_id = %instance_id, "ui instance disposed");
                true
            }
        }
    }

    #[must_use]
    pub fn state(&self, instance_id: &str) -> Option<UiState> {
        self.lock().states.get(instance_id).copied()
    }

    /// The instance commands are routed to, if any is visible.
    #[must_use]
    pub fn active(&self) -> Option<String> {
        self.lock().visible_order.last().cloned()
    }

    #[must_use]
    pub fn visible_count(&self) -> usize {
        self.lock().visible_order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_forward_only() {
        let ui = UiInstances::new();
        assert!(ui.register("a"));
        assert_eq!(ui.state("a"), Some(UiState::Unregistered));
        assert!(ui.active().is_none());

        assert!(ui.mark_visible("a"));
        assert_eq!(ui.active().as_deref(), Some("a"));

        assert!(ui.dispose("a"));
        assert_eq!(ui.state("a"), Some(UiState::Disposed));
        assert!(!ui.mark_visible("a"));
        assert!(!ui.dispose("a"));
        assert!(ui.active().is_none());
    }

    #[test]
    fn latest_visible_instance_is_active() {
        let ui = UiInstances::new();
        ui.mark_visible("sidebar");
        ui.mark_visible("tab");
        assert_eq!(ui.active().as_deref(), Some("tab"));
        ui.dispose("tab");
        assert_eq!(ui.active().as_deref(), Some("sidebar"));
        assert_eq!(ui.visible_count(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let ui = UiInstances::new();
        assert!(ui.register("a"));
        assert!(!ui.register("a"));
    }
}
