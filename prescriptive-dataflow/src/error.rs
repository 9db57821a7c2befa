//! Error and control-signal types.
//!
//! The runtime distinguishes one *control signal* from real errors: a `get` on an item
//! that has not yet been produced reports [`GetError::NotReady`], which a step body
//! propagates as [`StepError::NotReady`] and the scheduler absorbs by suspending the
//! step — it is never observed after `wait` returns. Everything else is a genuine
//! failure that aborts the context and surfaces from
//! [`Context::wait`](crate::Context::wait) as a [`Fatal`].

use thiserror::Error;

/// The ways a `get` can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GetError {
    /// The item has not been produced yet. Inside a step this suspends the step; outside a
    /// step it is returned to the caller directly.
    #[error("item not yet available")]
    NotReady,
    /// The item slot was already reclaimed after its last permitted read. Fatal to the
    /// calling step; no later put can revive the slot.
    #[error("item {0} was already reclaimed")]
    Gone(String),
}

/// The ways a `put` can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PutError {
    /// A second put on a slot that already holds a value, in a collection that does not
    /// treat equal re-puts as no-ops.
    #[error("item {0} is already present")]
    AlreadyPresent(String),
}

/// The error half of a step body's result.
///
/// `get` and `put` failures convert into this type via `?`; [`StepError::failed`] covers
/// failures originating in user code itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// The body observed a missing item and is unwinding so the scheduler can suspend it.
    #[error("data not ready")]
    NotReady,
    /// The body read an item slot that was already reclaimed.
    #[error("read of reclaimed item {0}")]
    Gone(String),
    /// The body collided with an existing item on put.
    #[error("item {0} is already present")]
    ItemAlreadyPresent(String),
    /// The body failed for a reason of its own.
    #[error("{0}")]
    Failed(String),
}

impl StepError {
    /// A user-level step failure with the given reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        StepError::Failed(reason.into())
    }
}

impl From<GetError> for StepError {
    fn from(e: GetError) -> Self {
        match e {
            GetError::NotReady => StepError::NotReady,
            GetError::Gone(what) => StepError::Gone(what),
        }
    }
}

impl From<PutError> for StepError {
    fn from(e: PutError) -> Self {
        match e {
            PutError::AlreadyPresent(what) => StepError::ItemAlreadyPresent(what),
        }
    }
}

/// A failure that terminates a context.
///
/// Returned by [`Context::wait`](crate::Context::wait); once a context has produced a
/// `Fatal` it stays failed and performs no further work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fatal {
    /// A step body returned a non-success status.
    #[error("step {step} failed: {reason}")]
    StepFailed {
        /// A description of the offending step instance.
        step: String,
        /// The reason the body reported.
        reason: String,
    },
    /// A producer collided with an already-present item.
    #[error("step {step} put item {item} which is already present")]
    ItemAlreadyPresent {
        /// A description of the offending step instance.
        step: String,
        /// A description of the colliding item.
        item: String,
    },
    /// A step read an item slot after its reclamation.
    #[error("step {step} read item {item} after reclamation")]
    ItemGone {
        /// A description of the offending step instance.
        step: String,
        /// A description of the reclaimed item.
        item: String,
    },
    /// Work remains outstanding but nothing is runnable: some step instances are suspended
    /// on items no producer will ever put.
    #[error("nothing runnable while work remains; {} suspended step instance(s): {}", pending.len(), pending.join(", "))]
    QuiescentButPending {
        /// Descriptions of the suspended step instances and the reads they wait on.
        pending: Vec<String>,
    },
    /// An operation that requires a quiescent context was invoked with work outstanding,
    /// or on a context that has already failed.
    #[error("operation requires a quiescent context")]
    InvalidSafeState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_error_converts_to_step_error() {
        assert_eq!(StepError::from(GetError::NotReady), StepError::NotReady);
        assert_eq!(
            StepError::from(GetError::Gone("items(7)".to_owned())),
            StepError::Gone("items(7)".to_owned())
        );
    }

    #[test]
    fn quiescent_but_pending_names_every_instance() {
        let fatal = Fatal::QuiescentButPending {
            pending: vec!["consume(42)".to_owned(), "consume(43)".to_owned()],
        };
        let text = fatal.to_string();
        assert!(text.contains("consume(42)"));
        assert!(text.contains("consume(43)"));
    }
}
