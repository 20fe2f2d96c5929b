//! Full rebuilds of search results.
//!
//! A rebuild resets the results of a search folder, then fills them
//! again from scratch: either from the candidates returned by the
//! indexer, or by scanning every message of the target folders,
//! newest first. Candidates are evaluated and committed in bounded
//! batches, and the cancellation flag is checked between batches.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::{
    context::SearchContext,
    criteria::SearchCriteria,
    folder::SearchFolder,
    indexer::IndexerResults,
    notify::Notification,
    restriction::{PropTag, Restriction},
    retry::retry_transaction,
    store::{
        self,
        results::{add_results, reset_results, set_status, update_folder_counts, CountDelta},
        FolderStatus,
    },
    update::folder_changed,
    FolderId, ObjectId, Result, StoreId,
};

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.map_or(false, |cancel| cancel.load(Ordering::Acquire))
}

/// Rebuild the results of the given search folder.
///
/// The search stops between two batches as soon as `cancel` is set.
/// When `notify` is `false`, no table or folder notification is
/// sent, which is what startup rebuilds want.
///
/// On success, including after a cancellation, the status of the
/// search folder is set back to running. On error, the status is
/// left untouched so that an interrupted rebuild is attempted again
/// at the next startup.
pub async fn search(
    ctx: &SearchContext,
    store: StoreId,
    folder: FolderId,
    criteria: &SearchCriteria,
    cancel: Option<&AtomicBool>,
    notify: bool,
) -> Result<()> {
    if is_cancelled(cancel) {
        debug!(store, folder, "search cancelled before it started");
        return Ok(());
    }

    info!(store, folder, %criteria, "rebuilding search folder");

    let targets = resolve_targets(ctx, criteria).await;
    reset_results(ctx, folder).await?;

    let delta = match query_indexer(ctx, store, &targets, criteria.restriction()).await {
        Some(results) => search_indexed(ctx, store, folder, results, cancel, notify).await?,
        None => {
            search_scan(ctx, store, folder, &targets, criteria.restriction(), cancel, notify)
                .await?
        }
    };

    set_status(ctx, folder, FolderStatus::Running).await?;

    info!(
        store,
        folder,
        count = delta.count,
        unread = delta.unread,
        cancelled = is_cancelled(cancel),
        "search folder rebuilt"
    );

    Ok(())
}

/// Run a rebuild worker for the given search folder.
///
/// Clients are told the search completed whatever the outcome, then
/// the completion is reported to anyone waiting for the worker.
pub(crate) async fn run_worker(
    ctx: Arc<SearchContext>,
    folder: Arc<SearchFolder>,
    done: oneshot::Sender<()>,
) {
    ctx.stats.add_workers(1);

    let res = search(
        &ctx,
        folder.store,
        folder.folder,
        &folder.criteria,
        Some(folder.exit_flag()),
        true,
    )
    .await;

    if let Err(err) = res {
        warn!(store = folder.store, folder = folder.folder, ?err, "cannot rebuild search folder");
    }

    ctx.notifier
        .notify(Notification::SearchComplete(folder.store, folder.folder));
    ctx.stats.add_workers(-1);
    folder.finish_rebuild(done);
}

/// Resolve the folders to search: the targets, plus all their
/// descendants when the search is recursive.
async fn resolve_targets(ctx: &SearchContext, criteria: &SearchCriteria) -> Vec<FolderId> {
    let mut targets: Vec<_> = criteria.folders().to_vec();

    if !criteria.is_recursive() {
        return targets;
    }

    let mut visited: HashSet<_> = targets.iter().copied().collect();
    let mut queue: VecDeque<_> = targets.iter().copied().collect();

    while let Some(folder) = queue.pop_front() {
        match ctx.db.list_child_folders(folder).await {
            Ok(children) => {
                for child in children {
                    if visited.insert(child) {
                        targets.push(child);
                        queue.push_back(child);
                    }
                }
            }
            Err(err) => {
                warn!(folder, ?err, "cannot expand target folder, skipping it");
            }
        }
    }

    trace!(folders = targets.len(), "target folders expanded");
    targets
}

/// Query the indexer, if enabled.
///
/// Returns `None` when the scan path must be used instead.
async fn query_indexer(
    ctx: &SearchContext,
    store: StoreId,
    targets: &[FolderId],
    restriction: &Restriction,
) -> Option<IndexerResults> {
    if !ctx.config.is_index_enabled() {
        return None;
    }

    let server = ctx.db.get_server_guid().await.ok()?;
    let store_guid = ctx.db.get_store_guid(store).await.ok()?;

    match ctx
        .indexer
        .query(server, store_guid, targets, restriction)
        .await
    {
        Ok(results) => {
            debug!(store, candidates = results.objects.len(), "using indexer results");
            Some(results)
        }
        Err(err) => {
            debug!(store, ?err, "indexer not usable, scanning folders");
            None
        }
    }
}

async fn search_indexed(
    ctx: &SearchContext,
    store: StoreId,
    folder: FolderId,
    results: IndexerResults,
    cancel: Option<&AtomicBool>,
    notify: bool,
) -> Result<CountDelta> {
    let suggestion = results.suggestion.as_str();
    retry_transaction(ctx.retry_policy(), &ctx.stats, || async move {
        let mut tx = ctx.db.begin().await?;
        tx.lock_folder(folder).await?;
        tx.save_suggestion(folder, suggestion).await?;
        tx.commit().await
    })
    .await?;

    let residual = results.residual.as_ref();
    let mut total = CountDelta::default();

    for candidates in results.objects.chunks(ctx.config.index_batch_size()) {
        if is_cancelled(cancel) {
            debug!(store, folder, "indexed search cancelled");
            break;
        }

        let (delta, _) = add_matching(ctx, store, folder, candidates, residual).await?;
        total += delta;
    }

    if notify {
        let mut notifications = vec![Notification::TableChanged(folder)];
        if !total.is_empty() {
            notifications.extend(folder_changed(ctx, folder).await);
        }
        ctx.notifier.notify_all(notifications);
    }

    Ok(total)
}

async fn search_scan(
    ctx: &SearchContext,
    store: StoreId,
    folder: FolderId,
    targets: &[FolderId],
    restriction: &Restriction,
    cancel: Option<&AtomicBool>,
    notify: bool,
) -> Result<CountDelta> {
    let mut total = CountDelta::default();

    'targets: for target in targets {
        let messages = match ctx.db.list_child_messages(*target).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(folder = target, ?err, "cannot list messages, skipping folder");
                continue;
            }
        };

        for candidates in messages.chunks(ctx.config.scan_batch_size()) {
            if is_cancelled(cancel) {
                debug!(store, folder, "search cancelled");
                break 'targets;
            }

            let (delta, matches) =
                add_matching(ctx, store, folder, candidates, Some(restriction)).await?;
            total += delta;

            if notify && !delta.is_empty() {
                let mut notifications: Vec<_> = matches
                    .into_iter()
                    .map(|object| Notification::TableRowAdded(folder, object))
                    .collect();
                notifications.extend(folder_changed(ctx, folder).await);
                ctx.notifier.notify_all(notifications);
            }
        }
    }

    Ok(total)
}

/// Evaluate the candidates and add the matching ones to the results,
/// in one transaction.
///
/// A residual restriction of `None` means every candidate matches.
async fn add_matching(
    ctx: &SearchContext,
    store: StoreId,
    folder: FolderId,
    candidates: &[ObjectId],
    restriction: Option<&Restriction>,
) -> store::Result<(CountDelta, Vec<ObjectId>)> {
    let tags = match restriction {
        Some(restriction) => restriction.prop_tags(),
        None => vec![PropTag::MESSAGE_FLAGS],
    };

    let rows = ctx.db.query_rows(store, candidates, &tags).await?;

    let matches: Vec<(ObjectId, u32)> = match restriction {
        Some(restriction) => {
            let existing: Vec<_> = rows.iter().map(|row| row.object).collect();
            let subs = ctx
                .evaluator
                .sub_restrictions(store, restriction, &existing)
                .await?;
            rows.iter()
                .filter(|row| ctx.evaluator.matches(row, restriction, &subs))
                .filter_map(|row| row.message_flags().map(|flags| (row.object, flags)))
                .collect()
        }
        None => rows
            .iter()
            .filter_map(|row| row.message_flags().map(|flags| (row.object, flags)))
            .collect(),
    };

    if matches.is_empty() {
        return Ok(Default::default());
    }

    let batch = &matches;
    let delta = retry_transaction(ctx.retry_policy(), &ctx.stats, || async move {
        let mut tx = ctx.db.begin().await?;
        tx.lock_folder(folder).await?;
        let delta = add_results(tx.as_mut(), folder, batch).await?;
        update_folder_counts(tx.as_mut(), folder, delta).await?;
        tx.commit().await?;
        Ok(delta)
    })
    .await?;

    trace!(
        folder,
        candidates = candidates.len(),
        matches = matches.len(),
        "search batch committed"
    );

    Ok((delta, matches.into_iter().map(|(object, _)| object).collect()))
}
