//! End-to-end command processing with optimistic retry.

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use common::{BatchId, GlobalSequenceNumber};
use event_store::{
    CommittedBatch, EventEnvelope, EventLog, Metadata, SequenceExpectations, SnapshotStore,
    validate_batch,
};

use crate::command::{Command, CommandRegistry};
use crate::config::ProcessorConfig;
use crate::context::CommandContext;
use crate::dispatch::{EventDispatcher, NullDispatcher};
use crate::error::{BoxError, CommandProcessingError};
use crate::repository::{AggregateRepository, EventSourcedRepository, Finalizer};
use crate::snapshot::SnapshottingRepository;
use crate::unit_of_work::UnitOfWork;

/// Outcome of a successfully processed command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandProcessingResult {
    new_position: Option<GlobalSequenceNumber>,
}

impl CommandProcessingResult {
    /// The handler emitted nothing and nothing was appended.
    pub fn no_events() -> Self {
        Self { new_position: None }
    }

    pub fn from_batch(batch: &CommittedBatch) -> Self {
        Self {
            new_position: batch.max_global_sequence_number(),
        }
    }

    pub fn events_were_emitted(&self) -> bool {
        self.new_position.is_some()
    }

    /// Highest global sequence number assigned by the commit.
    pub fn new_position(&self) -> Option<GlobalSequenceNumber> {
        self.new_position
    }
}

type DomainErrorPredicate = fn(&(dyn Error + Send + Sync + 'static)) -> bool;

fn is_error<E: Error + 'static>(error: &(dyn Error + Send + Sync + 'static)) -> bool {
    error.is::<E>()
}

/// Runs commands: resolve handler, execute against a fresh unit of work,
/// append the emitted batch, retry on conflict, then finalize and dispatch.
///
/// Processing runs on the caller's task. Concurrent callers are safe; the
/// log's uniqueness constraints plus the retry loop keep them consistent.
pub struct CommandProcessor<L> {
    log: Arc<L>,
    repository: Arc<dyn AggregateRepository>,
    dispatcher: Arc<dyn EventDispatcher>,
    registry: CommandRegistry,
    domain_errors: Vec<DomainErrorPredicate>,
    config: ProcessorConfig,
}

impl<L: EventLog + 'static> CommandProcessor<L> {
    pub fn builder(log: L) -> CommandProcessorBuilder<L> {
        CommandProcessorBuilder {
            log,
            dispatcher: Arc::new(NullDispatcher),
            snapshots: None,
            registry: CommandRegistry::new(),
            domain_errors: Vec::new(),
            config: ProcessorConfig::default(),
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Prepares the log and the dispatcher. With `purge_existing_views`,
    /// projections are reset and rebuilt from the log.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self, purge_existing_views: bool) -> Result<(), CommandProcessingError> {
        self.log
            .initialize()
            .await
            .map_err(|e| CommandProcessingError::Initialization(e.into()))?;
        self.dispatcher
            .initialize(purge_existing_views)
            .await
            .map_err(CommandProcessingError::Initialization)?;
        tracing::info!("command processor initialized");
        Ok(())
    }

    /// Processes one command end to end.
    #[tracing::instrument(skip(self, command), fields(command_type = C::COMMAND_TYPE, aggregate_id = ?command.aggregate_id()))]
    pub async fn process_command<C: Command>(
        &self,
        command: &C,
    ) -> Result<CommandProcessingResult, CommandProcessingError> {
        let started = Instant::now();
        let result = self.run(command).await;

        let outcome = match &result {
            Ok(result) if result.events_were_emitted() => "committed",
            Ok(_) => "no_events",
            Err(CommandProcessingError::Dispatch { .. }) => "dispatch_failed",
            Err(CommandProcessingError::Domain(_)) => "rejected",
            Err(_) => "failed",
        };
        metrics::counter!("commands_processed_total", "command_type" => C::COMMAND_TYPE, "outcome" => outcome)
            .increment(1);
        metrics::histogram!("command_duration_seconds", "command_type" => C::COMMAND_TYPE)
            .record(started.elapsed().as_secs_f64());

        result
    }

    async fn run<C: Command>(
        &self,
        command: &C,
    ) -> Result<CommandProcessingResult, CommandProcessingError> {
        let command_type = C::COMMAND_TYPE;
        let handler = self.registry.resolve(command_type)?;
        let command_metadata = command.metadata();
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut uow = UnitOfWork::new(Arc::clone(&self.repository));

            let handled = handler
                .handle(command, &mut CommandContext::new(&mut uow))
                .await;
            if let Err(error) = handled {
                return Err(self.classify(command_type, error));
            }

            if uow.emitted_events().is_empty() {
                tracing::debug!(attempt, "handler emitted no events");
                return Ok(CommandProcessingResult::no_events());
            }

            let pending = uow
                .into_commit()
                .map_err(|e| CommandProcessingError::Failed {
                    command_type,
                    source: e.into(),
                })?;

            match self
                .commit(&pending.events, pending.expectations, &command_metadata)
                .await
            {
                Ok(batch) => return self.after_commit(batch, pending.finalizers).await,
                Err(error) if error.is_conflict() => {
                    metrics::counter!("command_conflicts_total", "command_type" => command_type)
                        .increment(1);
                    if attempt >= max_attempts {
                        tracing::warn!(attempt, %error, "giving up after repeated conflicts");
                        return Err(CommandProcessingError::ConflictRetriesExhausted {
                            command_type,
                            attempts: attempt,
                            source: error,
                        });
                    }
                    tracing::warn!(attempt, %error, "conflict, retrying with a fresh unit of work");
                }
                Err(error) => {
                    return Err(CommandProcessingError::Failed {
                        command_type,
                        source: error.into(),
                    });
                }
            }
        }
    }

    /// Stamps the events with a fresh batch id and global positions read
    /// from the log, validates them and appends them atomically.
    async fn commit(
        &self,
        events: &[EventEnvelope],
        expectations: SequenceExpectations,
        command_metadata: &Metadata,
    ) -> event_store::Result<CommittedBatch> {
        let batch_id = BatchId::new();
        let next_global = self.log.next_global_sequence_number().await?;

        let stamped: Vec<EventEnvelope> = events
            .iter()
            .enumerate()
            .map(|(offset, event)| {
                event.stamped(batch_id, next_global.offset(offset), command_metadata)
            })
            .collect();

        validate_batch(&stamped, &expectations.next_global(next_global))?;
        self.log.append(batch_id, &stamped).await?;

        tracing::debug!(%batch_id, first = %next_global, count = stamped.len(), "batch committed");
        Ok(CommittedBatch::new(batch_id, stamped))
    }

    async fn after_commit(
        &self,
        batch: CommittedBatch,
        finalizers: Vec<Finalizer>,
    ) -> Result<CommandProcessingResult, CommandProcessingError> {
        for finalizer in finalizers {
            if let Err(error) = finalizer(&batch).await {
                tracing::warn!(batch_id = %batch.batch_id, %error, "post-commit finalizer failed");
            }
        }

        let result = CommandProcessingResult::from_batch(&batch);
        if let Err(source) = self.dispatcher.dispatch(&batch).await {
            tracing::error!(batch_id = %batch.batch_id, error = %source, "dispatch failed after commit");
            return Err(CommandProcessingError::Dispatch { result, source });
        }
        Ok(result)
    }

    fn classify(&self, command_type: &'static str, error: BoxError) -> CommandProcessingError {
        if self
            .domain_errors
            .iter()
            .any(|is_domain_error| is_domain_error(error.as_ref()))
        {
            tracing::debug!(%error, "command rejected by domain rule");
            CommandProcessingError::Domain(error)
        } else {
            CommandProcessingError::Failed {
                command_type,
                source: error,
            }
        }
    }
}

/// Assembles a [`CommandProcessor`].
pub struct CommandProcessorBuilder<L> {
    log: L,
    dispatcher: Arc<dyn EventDispatcher>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    registry: CommandRegistry,
    domain_errors: Vec<DomainErrorPredicate>,
    config: ProcessorConfig,
}

impl<L: EventLog + 'static> CommandProcessorBuilder<L> {
    pub fn dispatcher(mut self, dispatcher: impl EventDispatcher + 'static) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    /// Enables snapshot-backed hydration for aggregates that declare a
    /// snapshot version.
    pub fn snapshots(mut self, store: impl SnapshotStore + 'static) -> Self {
        self.snapshots = Some(Arc::new(store));
        self
    }

    pub fn registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Declares `E` a domain error: handlers raising it get it back unwrapped
    /// as [`CommandProcessingError::Domain`].
    pub fn domain_error<E: Error + 'static>(mut self) -> Self {
        self.domain_errors.push(is_error::<E>);
        self
    }

    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> CommandProcessor<L> {
        let log = Arc::new(self.log);
        let replay = EventSourcedRepository::new(Arc::clone(&log));
        let repository: Arc<dyn AggregateRepository> = match self.snapshots {
            Some(store) => Arc::new(SnapshottingRepository::new(
                replay,
                store,
                self.config.snapshot,
            )),
            None => Arc::new(replay),
        };

        CommandProcessor {
            log,
            repository,
            dispatcher: self.dispatcher,
            registry: self.registry,
            domain_errors: self.domain_errors,
            config: self.config,
        }
    }
}
