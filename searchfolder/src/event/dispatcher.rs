use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{group_events, ChangeEvent, EventQueue};
use crate::{context::SearchContext, registry::Registry, update::process_message_change};

/// Spawn the event dispatcher on the current runtime.
pub(crate) fn spawn(
    ctx: Arc<SearchContext>,
    registry: Arc<Registry>,
    queue: Arc<EventQueue>,
) -> JoinHandle<()> {
    tokio::spawn(async move { run(&ctx, &registry, &queue).await })
}

async fn run(ctx: &SearchContext, registry: &Registry, queue: &EventQueue) {
    debug!("event dispatcher started");

    loop {
        let cycle = queue.start_cycle();
        let events = queue.pop_batch(ctx.config.event_batch_size());

        if !events.is_empty() {
            dispatch(ctx, registry, events).await;
        }

        queue.finish_cycle(cycle);
        trace!(cycle, "event dispatcher cycle finished");

        if queue.is_empty() {
            if queue.is_shut_down() {
                break;
            }
            queue.wait().await;
        }
    }

    queue.mark_stopped();
    debug!("event dispatcher stopped");
}

async fn dispatch(ctx: &SearchContext, registry: &Registry, events: Vec<ChangeEvent>) {
    debug!(events = events.len(), "dispatching change events");

    for batch in group_events(events) {
        // held for the whole pass, so that a cancelled search folder
        // is never updated once it left the registry
        let folders = registry.lock().await;

        if let Some(store_folders) = folders.get(&batch.store) {
            process_message_change(ctx, store_folders, &batch).await;
        }
    }
}
