//! Error types raised by entity code.
//!
//! Scheduler-level errors live in `convoy-engine`; this module only covers
//! what a domain [`Entity`](crate::Entity) can report back to its Worker.

use thiserror::Error;

/// Errors from an entity's `frame_init()` or `update()`.
///
/// Any of these is fatal for the simulation run: the Worker that observed
/// it logs the failure and triggers an orderly abort of every WorkGroup.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EntityError {
    /// `frame_init()` could not prepare the entity for its first tick.
    #[error("frame_init failed: {reason}")]
    InitFailed {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// `update()` failed.
    #[error("update failed: {reason}")]
    UpdateFailed {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// Entity code panicked; the panic was caught at the Worker boundary.
    #[error("entity panicked: {message}")]
    Panicked {
        /// The panic payload, if it was a string.
        message: String,
    },
}

impl EntityError {
    /// Shorthand for [`EntityError::UpdateFailed`].
    pub fn update(reason: impl Into<String>) -> Self {
        Self::UpdateFailed {
            reason: reason.into(),
        }
    }

    /// Build a [`EntityError::Panicked`] from a `catch_unwind` payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked { message }
    }
}
