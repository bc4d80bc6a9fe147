//! Per-item stage sequence.
//!
//! An [`ItemHandler`] supplies the four external collaborators for one kind of
//! payload. [`StageRunner`] drives them in order:
//!
//! 1. `validate` (synchronous; failure classifies the item as invalid)
//! 2. `call` under the retry executor and concurrency limiter
//! 3. `blocking_step` on the blocking offload executor
//! 4. `finalize`
//!
//! The pipeline core never looks inside the payload or the call results.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{CallError, ItemError, ValidationError};
use crate::scheduler::job::WorkItem;
use crate::scheduler::offload::BlockingOffload;
use crate::scheduler::retry::RetryExecutor;

use super::events::{EventSink, PipelineEvent};

/// External collaborators invoked for each work item.
#[async_trait]
pub trait ItemHandler: Send + Sync + 'static {
    /// Payload carried by work items.
    type Payload: Send + Sync + 'static;
    /// Result of a successful external call.
    type Response: Send + 'static;
    /// Output of the blocking step, consumed by `finalize`.
    type Artifact: Send + 'static;

    /// Item-local precondition check. Never retried.
    fn validate(&self, item: &WorkItem<Self::Payload>) -> Result<(), ValidationError>;

    /// One external call attempt. `attempt` starts at 1.
    async fn call(
        &self,
        item: &WorkItem<Self::Payload>,
        attempt: u32,
    ) -> Result<Self::Response, CallError>;

    /// Synchronous work that may block the calling thread.
    fn blocking_step(
        &self,
        item: &WorkItem<Self::Payload>,
        response: Self::Response,
    ) -> anyhow::Result<Self::Artifact>;

    /// Final step; returns a receipt used for logging.
    async fn finalize(
        &self,
        item: &WorkItem<Self::Payload>,
        artifact: Self::Artifact,
    ) -> anyhow::Result<String>;
}

/// Runs the stage sequence for one item at a time.
pub struct StageRunner<H: ItemHandler> {
    handler: Arc<H>,
    retry: RetryExecutor,
    offload: BlockingOffload,
    events: EventSink,
}

impl<H: ItemHandler> StageRunner<H> {
    pub fn new(
        handler: Arc<H>,
        retry: RetryExecutor,
        offload: BlockingOffload,
        events: EventSink,
    ) -> Self {
        Self {
            handler,
            retry,
            offload,
            events,
        }
    }

    /// Processes `item` through every stage and returns the finalize receipt.
    ///
    /// # Errors
    ///
    /// Returns the [`ItemError`] of the first stage that failed.
    pub async fn run(&self, item: Arc<WorkItem<H::Payload>>) -> Result<String, ItemError> {
        let item_id = item.id.as_str();

        self.handler.validate(&item)?;

        let handler = self.handler.as_ref();
        let target = item.as_ref();
        let response = self
            .retry
            .execute(item_id, |attempt| handler.call(target, attempt))
            .await?;

        let artifact = {
            let handler = Arc::clone(&self.handler);
            let item = Arc::clone(&item);
            self.offload
                .run(move || handler.blocking_step(&item, response))
                .await
                .map_err(|source| ItemError::Offload {
                    item_id: item_id.to_string(),
                    source,
                })?
        };
        debug!(item_id = %item_id, "Blocking step completed");
        self.events.emit(PipelineEvent::OffloadCompleted {
            item_id: item_id.to_string(),
        });

        let receipt = self
            .handler
            .finalize(&item, artifact)
            .await
            .map_err(|e| ItemError::FinalStep {
                item_id: item_id.to_string(),
                reason: format!("{:#}", e),
            })?;
        info!(item_id = %item_id, receipt = %receipt, "Final step completed");

        Ok(receipt)
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }
}
