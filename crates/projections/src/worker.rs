//! Background catch-up worker and the watermark wait protocol.
//!
//! One task owns the [`ProjectionProcessor`] and drains a FIFO queue of
//! catch-up requests. A ticker task feeds a "catch up to the end" request
//! into the same queue at a fixed period, so commits made by other
//! processes are eventually observed. Callers interact through a cloneable
//! [`CatchUpHandle`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::GlobalSequenceNumber;
use domain::{BoxError, CommandProcessingResult, EventDispatcher};
use event_store::{CommittedBatch, EventLog};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::CatchUpConfig;
use crate::processor::{CatchUpRequest, ProjectionProcessor};
use crate::projection::Projection;
use crate::{ProjectionError, Result};

/// Messages drained by the worker, strictly in arrival order.
enum WorkerMessage {
    /// Catch up as requested. `reply` is `None` for fire-and-forget requests.
    CatchUp {
        request: CatchUpRequest,
        reply: Option<oneshot::Sender<Result<usize>>>,
    },
    /// Reset every projection and replay the log from the start.
    Rebuild { reply: oneshot::Sender<Result<usize>> },
    /// Drain whatever is queued, then stop.
    Shutdown { reply: oneshot::Sender<()> },
}

impl<L: EventLog + 'static> ProjectionProcessor<L> {
    /// Moves the processor onto a background worker task and starts the
    /// periodic refresh.
    pub fn spawn(self, config: &CatchUpConfig) -> CatchUpHandle {
        let processor = self.with_page_size(config.page_size);
        let projections: Arc<[Arc<dyn Projection>]> = processor.projections().into();
        let (sender, receiver) = mpsc::unbounded_channel();

        let ticker = tokio::spawn(run_ticker(sender.downgrade(), config.refresh_interval));
        tokio::spawn(run_worker(processor, receiver, ticker));

        tracing::info!(
            projections = projections.len(),
            refresh_ms = config.refresh_interval.as_millis() as u64,
            "catch-up worker started"
        );

        CatchUpHandle {
            sender,
            projections,
            poll_interval: config.poll_interval,
        }
    }
}

async fn run_ticker(sender: mpsc::WeakUnboundedSender<WorkerMessage>, period: Duration) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(sender) = sender.upgrade() else {
            break;
        };
        let message = WorkerMessage::CatchUp {
            request: CatchUpRequest::to_end(),
            reply: None,
        };
        if sender.send(message).is_err() {
            break;
        }
    }
}

async fn run_worker<L: EventLog>(
    processor: ProjectionProcessor<L>,
    mut receiver: mpsc::UnboundedReceiver<WorkerMessage>,
    ticker: JoinHandle<()>,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            WorkerMessage::Shutdown { reply } => {
                ticker.abort();
                receiver.close();
                while let Ok(pending) = receiver.try_recv() {
                    handle_message(&processor, pending).await;
                }
                tracing::info!("catch-up worker stopped");
                let _ = reply.send(());
                return;
            }
            other => handle_message(&processor, other).await,
        }
    }

    ticker.abort();
    tracing::debug!("catch-up queue closed, worker exiting");
}

async fn handle_message<L: EventLog>(processor: &ProjectionProcessor<L>, message: WorkerMessage) {
    match message {
        WorkerMessage::CatchUp { request, reply } => {
            let result = processor.catch_up(request).await;
            if let Err(error) = &result {
                record_failure(error);
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        WorkerMessage::Rebuild { reply } => {
            let result = processor.rebuild_all().await;
            if let Err(error) = &result {
                record_failure(error);
            }
            let _ = reply.send(result);
        }
        // A shutdown queued behind another shutdown has nothing left to do.
        WorkerMessage::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

fn record_failure(error: &ProjectionError) {
    metrics::counter!("catch_up_failures_total").increment(1);
    tracing::error!(%error, "catch-up attempt failed");
}

/// Cloneable front end of a running catch-up worker.
#[derive(Clone)]
pub struct CatchUpHandle {
    sender: mpsc::UnboundedSender<WorkerMessage>,
    projections: Arc<[Arc<dyn Projection>]>,
    poll_interval: Duration,
}

impl CatchUpHandle {
    /// Queues a catch-up request without waiting for it.
    pub fn request(&self, request: CatchUpRequest) -> Result<()> {
        self.sender
            .send(WorkerMessage::CatchUp {
                request,
                reply: None,
            })
            .map_err(|_| ProjectionError::WorkerStopped)
    }

    /// Queues a catch-up request and waits for the worker to run it.
    /// Returns the number of events read from the log.
    pub async fn catch_up(&self, request: CatchUpRequest) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(WorkerMessage::CatchUp {
                request,
                reply: Some(reply),
            })
            .map_err(|_| ProjectionError::WorkerStopped)?;
        response.await.map_err(|_| ProjectionError::WorkerStopped)?
    }

    /// Resets every projection and replays the whole log.
    pub async fn rebuild(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(WorkerMessage::Rebuild { reply })
            .map_err(|_| ProjectionError::WorkerStopped)?;
        response.await.map_err(|_| ProjectionError::WorkerStopped)?
    }

    /// Waits until every projection has processed `target`.
    ///
    /// Fails with [`ProjectionError::Timeout`] naming the first projection
    /// still behind when `timeout` elapses.
    #[tracing::instrument(skip(self))]
    pub async fn wait_for(&self, target: GlobalSequenceNumber, timeout: Duration) -> Result<()> {
        self.wait_on(&self.projections, target, timeout).await
    }

    /// Waits until the named projection has processed `target`.
    #[tracing::instrument(skip(self))]
    pub async fn wait_for_projection(
        &self,
        name: &str,
        target: GlobalSequenceNumber,
        timeout: Duration,
    ) -> Result<()> {
        let projection = self
            .projections
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| ProjectionError::UnknownProjection(name.to_string()))?;
        self.wait_on(&[projection], target, timeout).await
    }

    /// Waits until every projection has seen a command's events. Returns
    /// immediately when the command emitted nothing.
    pub async fn wait_until_processed(
        &self,
        result: &CommandProcessingResult,
        timeout: Duration,
    ) -> Result<()> {
        match result.new_position() {
            Some(position) => self.wait_for(position, timeout).await,
            None => Ok(()),
        }
    }

    /// Stops the worker after it has drained every queued request.
    pub async fn shutdown(self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(WorkerMessage::Shutdown { reply })
            .map_err(|_| ProjectionError::WorkerStopped)?;
        response.await.map_err(|_| ProjectionError::WorkerStopped)
    }

    async fn wait_on(
        &self,
        projections: &[Arc<dyn Projection>],
        target: GlobalSequenceNumber,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut lagging = None;
            for projection in projections {
                if !projection.low_watermark(true).await?.has_reached(target) {
                    lagging = Some(projection.name());
                    break;
                }
            }

            let Some(projection) = lagging else {
                return Ok(());
            };
            if Instant::now() >= deadline {
                tracing::warn!(projection, %target, "timed out waiting for projection");
                return Err(ProjectionError::Timeout {
                    projection: projection.to_string(),
                    target,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl EventDispatcher for CatchUpHandle {
    async fn initialize(&self, purge_existing_views: bool) -> std::result::Result<(), BoxError> {
        if purge_existing_views {
            self.rebuild().await?;
        } else {
            self.catch_up(CatchUpRequest::to_end()).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, batch: &CommittedBatch) -> std::result::Result<(), BoxError> {
        if let Some(target) = batch.max_global_sequence_number() {
            self.request(CatchUpRequest::to(target, true))?;
        }
        Ok(())
    }
}
