use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracksync_core::flow::{Action, Job, Step};
use tracksync_core::model::{Locator, Ticket, Update};
use tracksync_core::storage::{Storage, TicketQuery};
use tracksync_core::tracker::{CallRequest, TrackerRegistry};
use tracksync_core::vars::Evaluator;
use tracksync_core::{Error, Result};

/// Runs one job's sequence for one update and persists the ticket.
///
/// There is no per-ticket lock. Two runs that resolve to the same ticket
/// race and the last write to storage wins.
pub struct SequenceExecutor {
    trackers: TrackerRegistry,
    storage: Arc<dyn Storage>,
    evaluator: Evaluator,
}

impl SequenceExecutor {
    pub fn new(trackers: TrackerRegistry, storage: Arc<dyn Storage>, evaluator: Evaluator) -> Self {
        Self {
            trackers,
            storage,
            evaluator,
        }
    }

    /// Resolve the ticket `update` belongs to, run `job` against it and
    /// persist the result.
    ///
    /// A failing action stops the sequence and nothing is written. Calls
    /// already made are not undone.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        update: &Update,
        job: &Job,
    ) -> Result<Ticket> {
        let mut ticket = self.resolve(&update.received_from).await?;
        ticket.patch(update);

        self.run_sequence(cancel, &job.actions, update, &mut ticket)
            .await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if ticket.is_persisted() {
            self.storage.update_ticket(&ticket).await?;
        } else {
            ticket.id = self.storage.create_ticket(&ticket).await?;
        }
        debug!(job = %job.name, ticket = %ticket.id, "ticket saved");
        Ok(ticket)
    }

    async fn resolve(&self, from: &Locator) -> Result<Ticket> {
        match self.storage.get_ticket(&TicketQuery::Locator(from.clone())).await {
            Ok(ticket) => Ok(ticket),
            Err(e) if e.is_not_found() => Ok(Ticket::default()),
            Err(e) => Err(e),
        }
    }

    fn run_sequence<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        seq: &'a [Step],
        update: &'a Update,
        ticket: &'a mut Ticket,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for step in seq {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                match step {
                    Step::Action(action) => self.run_action(cancel, action, update, ticket).await?,
                    Step::If(branch) => {
                        if self.evaluator.condition(&branch.condition, update, ticket)? {
                            self.run_sequence(cancel, &branch.actions, update, ticket)
                                .await?;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    async fn run_action(
        &self,
        cancel: &CancellationToken,
        action: &Action,
        update: &Update,
        ticket: &mut Ticket,
    ) -> Result<()> {
        let vars = self.evaluator.evaluate(&action.vars, update, ticket)?;
        let tracker = self.trackers.get(&action.name.tracker)?;
        let task_id = if action.detached {
            String::new()
        } else {
            ticket.task_id(&action.name.tracker).to_string()
        };

        debug!(action = %action.name, task_id = %task_id, "calling tracker");
        let id = tracker
            .call(
                cancel,
                CallRequest {
                    method: action.name.method.clone(),
                    vars,
                    task_id,
                },
            )
            .await?;

        if !action.detached && !id.is_empty() {
            ticket.set_task_id(&action.name.tracker, id);
        }
        Ok(())
    }
}
