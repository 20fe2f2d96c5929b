//! Incremental updates of search results.
//!
//! A [`ChangeBatch`] is applied to every search folder of its store.
//! Each search folder is updated in its own row-locked transaction,
//! retried on lock conflicts. A failure on one search folder never
//! prevents the others from being updated.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, trace, warn};

use crate::{
    context::SearchContext,
    criteria::SearchCriteria,
    event::{ChangeBatch, ChangeKind},
    folder::SearchFolder,
    notify::Notification,
    registry::StoreFolders,
    retry::retry_transaction,
    store::{
        self,
        results::{add_result, delete_result, is_unread, update_folder_counts, AddOutcome, CountDelta},
        Database, Transaction,
    },
    FolderId, ObjectId,
};

/// The ancestors of the folder containing a change, resolved lazily
/// and at most once per batch.
pub(crate) struct ScopeResolver<'a> {
    db: &'a dyn Database,
    folder: FolderId,
    ancestors: Option<Option<Vec<FolderId>>>,
}

impl<'a> ScopeResolver<'a> {
    pub(crate) fn new(db: &'a dyn Database, folder: FolderId) -> Self {
        Self {
            db,
            folder,
            ancestors: None,
        }
    }

    /// Return `true` if the folder is a target of the criteria, or a
    /// descendant of a target when the search is recursive.
    ///
    /// A folder whose ancestors cannot be resolved is out of scope.
    pub(crate) async fn contains(&mut self, criteria: &SearchCriteria) -> bool {
        let targets = criteria.folders();

        if targets.contains(&self.folder) {
            return true;
        }

        if !criteria.is_recursive() {
            return false;
        }

        match self.ancestors().await {
            Some(ancestors) => ancestors.iter().any(|folder| targets.contains(folder)),
            None => false,
        }
    }

    async fn ancestors(&mut self) -> Option<&[FolderId]> {
        if self.ancestors.is_none() {
            self.ancestors = Some(self.resolve_ancestors().await);
        }

        self.ancestors.as_ref().and_then(|a| a.as_deref())
    }

    async fn resolve_ancestors(&self) -> Option<Vec<FolderId>> {
        let mut ancestors = Vec::new();
        let mut visited = HashSet::from([self.folder]);
        let mut folder = self.folder;

        loop {
            match self.db.get_parent(folder).await {
                Ok(Some(parent)) if visited.insert(parent) => {
                    ancestors.push(parent);
                    folder = parent;
                }
                Ok(Some(parent)) => {
                    warn!(folder, parent, "cycle found in folder hierarchy");
                    break Some(ancestors);
                }
                Ok(None) => break Some(ancestors),
                Err(err) => {
                    debug!(folder, ?err, "cannot resolve folder ancestors");
                    break None;
                }
            }
        }
    }
}

/// Apply a batch of changes to all search folders of its store.
pub(crate) async fn process_message_change(
    ctx: &SearchContext,
    folders: &StoreFolders,
    batch: &ChangeBatch,
) {
    trace!(
        store = batch.store,
        folder = batch.folder,
        kind = %batch.kind,
        objects = batch.objects.len(),
        "processing changes"
    );

    let mut scope = ScopeResolver::new(ctx.db.as_ref(), batch.folder);

    for search in folders.values() {
        let in_scope = match batch.kind {
            ChangeKind::Delete => false,
            ChangeKind::Add | ChangeKind::Modify => scope.contains(&search.criteria).await,
        };

        let res = retry_transaction(ctx.retry_policy(), &ctx.stats, || {
            update_search_folder(ctx, search, batch, in_scope)
        })
        .await;

        match res {
            Ok((delta, mut notifications)) => {
                if !delta.is_empty() {
                    notifications.extend(folder_changed(ctx, search.folder).await);
                }
                ctx.notifier.notify_all(notifications);
            }
            Err(err) => {
                warn!(
                    store = search.store,
                    folder = search.folder,
                    ?err,
                    "cannot update search folder, skipping it"
                );
            }
        }
    }
}

/// Build the notifications sent when the counters of a search folder
/// changed.
pub(crate) async fn folder_changed(ctx: &SearchContext, folder: FolderId) -> Vec<Notification> {
    let mut notifications = vec![
        Notification::CacheInvalidated(folder),
        Notification::FolderModified(folder),
    ];

    if let Ok(Some(parent)) = ctx.db.get_parent(folder).await {
        notifications.push(Notification::HierarchyRowModified(parent, folder));
    }

    notifications
}

async fn update_search_folder(
    ctx: &SearchContext,
    search: &SearchFolder,
    batch: &ChangeBatch,
    in_scope: bool,
) -> store::Result<(CountDelta, Vec<Notification>)> {
    let folder = search.folder;
    let mut tx = ctx.db.begin().await?;
    tx.lock_folder(folder).await?;

    let mut delta = CountDelta::default();
    let mut notifications = Vec::new();

    if in_scope {
        let restriction = search.criteria.restriction();
        let tags = restriction.prop_tags();
        let rows = ctx
            .db
            .query_rows(batch.store, &batch.objects, &tags)
            .await?;
        let found: BTreeSet<_> = rows.iter().map(|row| row.object).collect();
        let existing: Vec<_> = found.iter().copied().collect();
        let subs = ctx
            .evaluator
            .sub_restrictions(batch.store, restriction, &existing)
            .await?;

        for row in &rows {
            let Some(flags) = row.message_flags() else {
                continue;
            };

            if ctx.evaluator.matches(row, restriction, &subs) {
                match add_result(tx.as_mut(), folder, row.object, flags).await? {
                    AddOutcome::Inserted => {
                        delta.count += 1;
                        if is_unread(flags) {
                            delta.unread += 1;
                        }
                        notifications.push(Notification::TableRowAdded(folder, row.object));
                    }
                    AddOutcome::Modified => {
                        delta.unread += if is_unread(flags) { 1 } else { -1 };
                        notifications.push(Notification::TableRowModified(folder, row.object));
                    }
                    AddOutcome::Unchanged => {
                        // the row data may have changed anyway
                        notifications.push(Notification::TableRowModified(folder, row.object));
                    }
                }
            } else if batch.kind == ChangeKind::Modify {
                remove(tx.as_mut(), folder, row.object, &mut delta, &mut notifications).await?;
            }
        }

        // modified objects that vanished meanwhile are not members
        // anymore
        if batch.kind == ChangeKind::Modify {
            for object in batch.objects.iter().filter(|o| !found.contains(*o)) {
                remove(tx.as_mut(), folder, *object, &mut delta, &mut notifications).await?;
            }
        }
    } else {
        for object in &batch.objects {
            remove(tx.as_mut(), folder, *object, &mut delta, &mut notifications).await?;
        }
    }

    update_folder_counts(tx.as_mut(), folder, delta).await?;
    tx.commit().await?;

    if !notifications.is_empty() {
        debug!(
            store = search.store,
            folder,
            count = delta.count,
            unread = delta.unread,
            "search folder updated"
        );
    }

    Ok((delta, notifications))
}

async fn remove(
    tx: &mut dyn Transaction,
    folder: FolderId,
    object: ObjectId,
    delta: &mut CountDelta,
    notifications: &mut Vec<Notification>,
) -> store::Result<()> {
    if let Some(flags) = delete_result(tx, folder, object).await? {
        delta.count -= 1;
        if is_unread(flags) {
            delta.unread -= 1;
        }
        notifications.push(Notification::TableRowDeleted(folder, object));
    }

    Ok(())
}
