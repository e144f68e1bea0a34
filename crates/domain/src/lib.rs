//! Write side of the event-sourcing runtime.
//!
//! Aggregates are rebuilt from the event log, commands run against them
//! inside a unit of work, and the resulting batch is appended atomically
//! with optimistic concurrency. Conflicts are retried from scratch.

pub mod aggregate;
pub mod command;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod processor;
pub mod repository;
pub mod snapshot;
pub mod unit_of_work;

pub use aggregate::{Aggregate, AggregateRoot, DomainEvent, Hydratable};
pub use command::{AggregateCommand, Command, CommandHandler, CommandRegistry, ExecutableCommand};
pub use config::ProcessorConfig;
pub use context::CommandContext;
pub use dispatch::{EventDispatcher, NullDispatcher};
pub use error::{BoxError, CommandProcessingError, DomainError};
pub use processor::{CommandProcessingResult, CommandProcessor, CommandProcessorBuilder};
pub use repository::{AggregateRepository, AggregateRepositoryExt, EventSourcedRepository, Finalizer};
pub use snapshot::{SnapshotPolicy, SnapshottingRepository};
pub use unit_of_work::{PendingCommit, UnitOfWork};
