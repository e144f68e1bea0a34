//! Per-attempt aggregate cache and emitted-event buffer.

use std::collections::HashMap;
use std::sync::Arc;

use common::{AggregateId, Cutoff, SequenceNumber};
use event_store::{EventEnvelope, Metadata, SequenceExpectations};

use crate::aggregate::{Aggregate, AggregateRoot, Hydratable};
use crate::error::{DomainError, Result};
use crate::repository::{AggregateRepository, AggregateRepositoryExt, Finalizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    cutoff: Cutoff,
    aggregate_id: AggregateId,
}

/// Everything the processor needs to commit one attempt.
pub struct PendingCommit {
    /// Emitted events in emission order, not yet stamped.
    pub events: Vec<EventEnvelope>,

    /// Snapshot finalizers first, in load order, then handler-registered ones.
    pub finalizers: Vec<Finalizer>,

    /// Where each touched aggregate's run must start.
    pub expectations: SequenceExpectations,
}

/// Scope of one command-processing attempt.
///
/// Caches live aggregate roots by (cutoff, id), so loading the same id twice
/// within an attempt yields the same instance, and buffers every event the
/// roots emit. A unit of work is never reused across attempts.
pub struct UnitOfWork {
    repository: Arc<dyn AggregateRepository>,
    cache: HashMap<CacheKey, Box<dyn Hydratable>>,
    load_order: Vec<CacheKey>,
    emitted: Vec<EventEnvelope>,
    finalizers: Vec<Finalizer>,
}

impl UnitOfWork {
    pub fn new(repository: Arc<dyn AggregateRepository>) -> Self {
        Self {
            repository,
            cache: HashMap::new(),
            load_order: Vec::new(),
            emitted: Vec::new(),
            finalizers: Vec::new(),
        }
    }

    /// Returns the cached root for (id, cutoff), hydrating it on first use.
    ///
    /// A root born here (no history, `create_if_not_exists`) fires its
    /// creation hook once; the hook's events join the emitted buffer.
    pub async fn get<A: Aggregate>(
        &mut self,
        aggregate_id: AggregateId,
        cutoff: Cutoff,
        create_if_not_exists: bool,
    ) -> Result<&mut AggregateRoot<A>> {
        let key = CacheKey {
            cutoff,
            aggregate_id,
        };

        if !self.cache.contains_key(&key) {
            let mut root = self
                .repository
                .get::<A>(aggregate_id, cutoff, create_if_not_exists)
                .await?;

            if root.is_new() && cutoff.is_unbounded() {
                for event in A::created(aggregate_id) {
                    let envelope = root.emit(event, &Metadata::new())?;
                    self.emitted.push(envelope);
                }
            }

            self.cache.insert(key, Box::new(root));
            self.load_order.push(key);
        } else {
            tracing::trace!(%aggregate_id, %cutoff, "unit of work cache hit");
        }

        let cached = self
            .cache
            .get_mut(&key)
            .ok_or(DomainError::AggregateNotFound {
                aggregate_type: A::aggregate_type(),
                aggregate_id,
            })?;
        let actual = cached.aggregate_type();
        cached
            .as_any_mut()
            .downcast_mut::<AggregateRoot<A>>()
            .ok_or_else(|| DomainError::WrongAggregateType {
                aggregate_id,
                expected: A::aggregate_type(),
                actual: actual.to_string(),
            })
    }

    /// Returns true if the aggregate has history at `cutoff`, or was given
    /// events earlier in this attempt.
    pub async fn exists(&self, aggregate_id: AggregateId, cutoff: Cutoff) -> Result<bool> {
        let key = CacheKey {
            cutoff,
            aggregate_id,
        };
        if let Some(root) = self.cache.get(&key)
            && root.sequence_number().is_some()
        {
            return Ok(true);
        }
        self.repository.exists(aggregate_id, cutoff).await
    }

    pub fn add_emitted_event(&mut self, envelope: EventEnvelope) {
        self.emitted.push(envelope);
    }

    pub fn emitted_events(&self) -> &[EventEnvelope] {
        &self.emitted
    }

    /// Registers work to run after the batch is durably committed.
    pub fn on_committed(&mut self, finalizer: Finalizer) {
        self.finalizers.push(finalizer);
    }

    /// Consumes the unit of work, collecting the events, finalizers and
    /// sequence expectations of the attempt.
    pub fn into_commit(self) -> Result<PendingCommit> {
        let mut expectations = SequenceExpectations::new();
        let mut finalizers = Vec::new();

        for key in &self.load_order {
            let Some(root) = self.cache.get(key) else {
                continue;
            };
            if !key.cutoff.is_unbounded() {
                continue;
            }
            if root.advanced_since_checkout() {
                expectations.next_local.insert(
                    key.aggregate_id,
                    SequenceNumber::after(root.checked_out_at()),
                );
            }
            if let Some(finalizer) = self.repository.finalizer(&**root)? {
                finalizers.push(finalizer);
            }
        }
        finalizers.extend(self.finalizers);

        Ok(PendingCommit {
            events: self.emitted,
            finalizers,
            expectations,
        })
    }
}
