//! Ring-buffered double-ended containers backing the scheduler queues.
//!
//! [`Deque`] is a fixed-capacity ring buffer with explicit growth control;
//! [`DStack`] is the LIFO view used for pending immediate work: pushes land
//! at the young end, pops take the young end, iteration walks oldest-first.

mod deque;
mod stack;

pub use deque::{Deque, DequeError};
pub use stack::{DStack, StackError};
