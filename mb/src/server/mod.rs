//! The per-run coordination server
//!
//! A TCP rendezvous service that hands each spawned process its descriptor
//! and enforces the startup ordering barriers. One session per run.

mod core;
mod handler;
mod latch;

pub use self::core::{CoordServer, ServerError, SyncReport};
pub use handler::{HandlerError, HandlerErrorKind};
pub use latch::{CancelToken, Gate, Latch, WaitError};
