//! # taskloop — embeddable two-phase task execution
//!
//! Two cooperating layers of asynchronous work management:
//!
//! - a **request/loop layer**: [`Request`]s posted onto a [`Handler`]
//!   (an immediate LIFO stack plus a time-ordered delayed queue), drained
//!   one at a time by a [`Looper`] thread;
//! - a **task layer**: [`Task`]s that split a unit of work into a primary
//!   phase and a deferred post phase, grouped by [`TaskStack`] /
//!   [`TaskSpawner`] which own the scheduling policy as a [`Dispatch`]
//!   binding — run the work on a pool and the callback on a looper thread,
//!   or any other combination.
//!
//! Every unit carries the shared bitfield [`State`], its own lock and an
//! append-only error list; cancellation is advisory and never interrupts a
//! body that is already running.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskloop::{Handler, Looper};
//!
//! let handler = Arc::new(Handler::new());
//! let looper = Arc::new(Looper::new(handler.clone()));
//! let thread = Looper::spawn_on_thread(&looper)?;
//!
//! handler.post_fn(|| println!("ran on the looper thread"))?;
//! ```

pub mod adapt;
mod clock;
mod config;
mod dispatch;
mod error;
mod group;
mod handler;
mod looper;
mod request;
mod state;
mod task;
mod wait;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Timings;
pub use dispatch::{
    AsyncDispatch, Dispatch, Executor, ExecutorDispatch, HandlerDispatch, InlineDispatch, Job,
    ThreadDispatch,
};
pub use error::{is_cancellation, Canceled, ErrorList, ScheduleError};
pub use group::{TaskSpawner, TaskStack};
pub use handler::Handler;
pub use looper::Looper;
pub use request::Request;
pub use state::State;
pub use task::{PostBody, Task};
pub use wait::Wait;
