//! Read side of the event-sourcing runtime.
//!
//! This crate provides:
//! - [`Projection`] trait: batch dispatch plus a low watermark
//! - [`InMemoryProjection`] maintaining a [`ReadModel`]
//! - [`ProjectionProcessor`] streaming the committed log to projections
//! - [`CatchUpHandle`] for the background catch-up worker, which also plugs
//!   into the command processor as its [`domain::EventDispatcher`]

pub mod config;
pub mod error;
pub mod processor;
pub mod projection;
pub mod read_model;
pub mod worker;

pub use config::CatchUpConfig;
pub use error::{ProjectionError, Result};
pub use processor::{CatchUpRequest, ProjectionProcessor};
pub use projection::{Projection, ProjectionPosition};
pub use read_model::{InMemoryProjection, ReadModel};
pub use worker::CatchUpHandle;
