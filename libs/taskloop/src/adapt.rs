//! Conversions between the two callable worlds.
//!
//! Request-style bodies take `&Request` and return nothing useful;
//! task-style bodies take `&Task` and may return a deferred [`PostBody`].
//! These shims promote narrower callables — plain runnables, fallible
//! closures — into either world, supplying whatever the caller's signature
//! left out.

use crate::request::Request;
use crate::task::{PostBody, Task};

/// Lift a zero-argument runnable into a request-style body. The runnable
/// fires at most once.
pub fn request_fn<F>(f: F) -> impl FnMut(&Request) -> anyhow::Result<()> + Send + 'static
where
    F: FnOnce() + Send + 'static,
{
    let mut slot = Some(f);
    move |_| {
        if let Some(f) = slot.take() {
            f();
        }
        Ok(())
    }
}

/// Lift a zero-argument runnable into a task-style body with no deferred
/// phase.
pub fn task_fn<F>(f: F) -> impl FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static
where
    F: FnOnce() + Send + 'static,
{
    let mut slot = Some(f);
    move |_| {
        if let Some(f) = slot.take() {
            f();
        }
        Ok(None)
    }
}

/// Promote a fallible zero-argument closure into a task-style body; its
/// error becomes the task's failure.
pub fn task_fn_fallible<F>(
    mut f: F,
) -> impl FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static
where
    F: FnMut() -> anyhow::Result<()> + Send + 'static,
{
    move |_| {
        f()?;
        Ok(None)
    }
}

/// Promote a request-style body into a task-style one with no deferred
/// phase. `request` is the argument handed to the wrapped body in place of
/// the task — usually the request the body was originally written against,
/// or a fresh one when the body ignores it.
pub fn task_fn_from_request_fn<F>(
    mut f: F,
    request: Request,
) -> impl FnMut(&Task) -> anyhow::Result<Option<PostBody>> + Send + 'static
where
    F: FnMut(&Request) -> anyhow::Result<()> + Send + 'static,
{
    move |_| {
        f(&request)?;
        Ok(None)
    }
}

/// Wrap a runnable as a deferred post body.
pub fn post_body<F>(f: F) -> PostBody
where
    F: FnOnce() + Send + 'static,
{
    Box::new(move || {
        f();
        Ok(())
    })
}

/// Wrap a fallible closure as a deferred post body.
pub fn post_body_fallible<F>(f: F) -> PostBody
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    Box::new(f)
}
