//! Command traits and the typed command registry.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use common::AggregateId;
use event_store::Metadata;

use crate::aggregate::Aggregate;
use crate::context::CommandContext;
use crate::error::{BoxError, CommandProcessingError};

/// An intention to change the system.
///
/// Commands represent an intention to perform an action. They may be
/// rejected if the current state doesn't allow the action.
pub trait Command: Send + Sync + 'static {
    /// Stable tag the registry resolves the handler by.
    const COMMAND_TYPE: &'static str;

    /// The aggregate this command addresses, if any.
    fn aggregate_id(&self) -> Option<AggregateId> {
        None
    }

    /// Metadata copied onto every emitted event that does not already
    /// carry the same key.
    fn metadata(&self) -> Metadata {
        Metadata::new()
    }
}

/// A command bound to a single aggregate type, executed directly against it.
pub trait AggregateCommand: Command {
    /// The type of aggregate this command targets.
    type Aggregate: Aggregate;

    /// The aggregate instance the command runs against.
    fn target(&self) -> AggregateId;

    /// Decides which events to emit given the aggregate's current state.
    fn execute(
        &self,
        aggregate: &Self::Aggregate,
    ) -> Result<Vec<<Self::Aggregate as Aggregate>::Event>, <Self::Aggregate as Aggregate>::Error>;
}

/// A command carrying its own logic, free to load and mutate several
/// aggregates through the context.
#[async_trait]
pub trait ExecutableCommand: Command {
    async fn execute(&self, ctx: &mut CommandContext<'_>) -> Result<(), BoxError>;
}

/// Externally supplied logic for a command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    async fn handle(&self, command: &C, ctx: &mut CommandContext<'_>) -> Result<(), BoxError>;
}

#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn handle(
        &self,
        command: &(dyn Any + Send + Sync),
        ctx: &mut CommandContext<'_>,
    ) -> Result<(), BoxError>;
}

fn downcast<C: Command>(command: &(dyn Any + Send + Sync)) -> Result<&C, BoxError> {
    command
        .downcast_ref::<C>()
        .ok_or_else(|| CommandProcessingError::UnknownCommand(C::COMMAND_TYPE).into())
}

struct AggregateBound<C>(PhantomData<fn() -> C>);

#[async_trait]
impl<C: AggregateCommand> ErasedHandler for AggregateBound<C> {
    async fn handle(
        &self,
        command: &(dyn Any + Send + Sync),
        ctx: &mut CommandContext<'_>,
    ) -> Result<(), BoxError> {
        let command = downcast::<C>(command)?;
        ctx.execute::<C::Aggregate, _>(command.target(), |aggregate| command.execute(aggregate))
            .await
    }
}

struct SelfExecuting<C>(PhantomData<fn() -> C>);

#[async_trait]
impl<C: ExecutableCommand> ErasedHandler for SelfExecuting<C> {
    async fn handle(
        &self,
        command: &(dyn Any + Send + Sync),
        ctx: &mut CommandContext<'_>,
    ) -> Result<(), BoxError> {
        downcast::<C>(command)?.execute(ctx).await
    }
}

struct Mapped<C, H> {
    handler: H,
    _command: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C: Command, H: CommandHandler<C>> ErasedHandler for Mapped<C, H> {
    async fn handle(
        &self,
        command: &(dyn Any + Send + Sync),
        ctx: &mut CommandContext<'_>,
    ) -> Result<(), BoxError> {
        self.handler.handle(downcast::<C>(command)?, ctx).await
    }
}

/// Maps command type tags to handlers. Built once at startup.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command executed directly against its aggregate.
    pub fn aggregate<C: AggregateCommand>(self) -> Self {
        self.insert(C::COMMAND_TYPE, Arc::new(AggregateBound::<C>(PhantomData)))
    }

    /// Registers a command that carries its own logic.
    pub fn executable<C: ExecutableCommand>(self) -> Self {
        self.insert(C::COMMAND_TYPE, Arc::new(SelfExecuting::<C>(PhantomData)))
    }

    /// Registers an external handler for a command type.
    pub fn mapped<C: Command, H: CommandHandler<C>>(self, handler: H) -> Self {
        self.insert(
            C::COMMAND_TYPE,
            Arc::new(Mapped {
                handler,
                _command: PhantomData::<fn() -> C>,
            }),
        )
    }

    pub fn contains(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn resolve(
        &self,
        command_type: &'static str,
    ) -> Result<Arc<dyn ErasedHandler>, CommandProcessingError> {
        self.handlers
            .get(command_type)
            .cloned()
            .ok_or(CommandProcessingError::UnknownCommand(command_type))
    }

    fn insert(mut self, command_type: &'static str, handler: Arc<dyn ErasedHandler>) -> Self {
        if self.handlers.insert(command_type, handler).is_some() {
            tracing::warn!(command_type, "command handler registered twice, keeping the last one");
        }
        self
    }
}
