use std::sync::Arc;

use thiserror::Error;

/// Structural failures raised synchronously by posting and spawning APIs.
///
/// Failures *inside* user code never surface here: they are captured,
/// appended to the owning unit's error list and reflected in its state.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Operation on a closed handler or task group.
    #[error("scheduler is closed")]
    Closed,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A dispatch hook needed a collaborator that was never attached.
    #[error("missing {0} attachment")]
    MissingAttachment(&'static str),
    #[error("failed to spawn worker thread")]
    Spawn(#[source] std::io::Error),
}

/// Marker for cancellation-typed failures inside user code.
///
/// An exec body that returns an error chain carrying this type promotes the
/// unit's terminal state to CANCELED instead of FAILED.
#[derive(Debug, Default, Error)]
#[error("canceled")]
pub struct Canceled;

/// The cancellation predicate: does this user error carry a [`Canceled`]?
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.is::<Canceled>()
}

/// Copy-on-append error list: readers snapshot the `Arc`, writers replace it.
pub type ErrorList = Arc<Vec<Arc<anyhow::Error>>>;

pub(crate) fn append_error(list: &mut ErrorList, err: anyhow::Error) {
    let mut next = Vec::with_capacity(list.len() + 1);
    next.extend(list.iter().cloned());
    next.push(Arc::new(err));
    *list = Arc::new(next);
}
