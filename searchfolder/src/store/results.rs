//! # Search results
//!
//! Module dedicated to the search results helpers shared by rebuilds
//! and incremental updates. Every membership change goes through
//! these helpers, so that result rows and folder counters always
//! move together inside the same transaction.

use std::ops::AddAssign;

use tracing::debug;

use super::{FolderStatus, Result, Transaction, MSGFLAG_READ};
use crate::{
    context::SearchContext, notify::Notification, restriction::PropTag, retry::retry_transaction,
    FolderId, ObjectId,
};

/// The outcome of adding a single search result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddOutcome {
    /// The object was not a member yet.
    Inserted,
    /// The object was already a member, its read state changed.
    Modified,
    /// The object was already a member with the same read state.
    Unchanged,
}

/// A change of the content and unread counters of a folder.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CountDelta {
    pub count: i64,
    pub unread: i64,
}

impl CountDelta {
    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.unread == 0
    }
}

impl AddAssign for CountDelta {
    fn add_assign(&mut self, other: Self) {
        self.count += other.count;
        self.unread += other.unread;
    }
}

/// Return `true` if the given message flags mark an unread message.
pub fn is_unread(flags: u32) -> bool {
    flags & MSGFLAG_READ == 0
}

/// Add the object to the results of the folder, or update its read
/// state if it is already a member.
///
/// Only the read bit of the given flags is stored.
pub async fn add_result(
    tx: &mut dyn Transaction,
    folder: FolderId,
    object: ObjectId,
    flags: u32,
) -> Result<AddOutcome> {
    let flags = flags & MSGFLAG_READ;

    let outcome = match tx.get_result_flags(folder, object).await? {
        Some(prev) if prev == flags => return Ok(AddOutcome::Unchanged),
        Some(_) => AddOutcome::Modified,
        None => AddOutcome::Inserted,
    };

    tx.upsert_result(folder, object, flags).await?;
    Ok(outcome)
}

/// Add a batch of matching objects to the results of the folder.
///
/// New rows are inserted as read, then the unread ones are marked
/// unread. Existing rows keep their stored read state, which is
/// correct as long as the results were reset before the batch.
pub async fn add_results(
    tx: &mut dyn Transaction,
    folder: FolderId,
    matches: &[(ObjectId, u32)],
) -> Result<CountDelta> {
    if matches.is_empty() {
        return Ok(CountDelta::default());
    }

    let objects: Vec<_> = matches.iter().map(|(object, _)| *object).collect();
    let inserted = tx.insert_results(folder, &objects, MSGFLAG_READ).await?;

    let unread: Vec<_> = matches
        .iter()
        .filter(|(_, flags)| is_unread(*flags))
        .map(|(object, _)| *object)
        .collect();
    let unread = tx.update_results_flags(folder, &unread, 0).await?;

    Ok(CountDelta {
        count: inserted as i64,
        unread: unread as i64,
    })
}

/// Remove the object from the results of the folder.
///
/// Returns the flags of the removed row, or `None` if the object was
/// not a member.
pub async fn delete_result(
    tx: &mut dyn Transaction,
    folder: FolderId,
    object: ObjectId,
) -> Result<Option<u32>> {
    match tx.get_result_flags(folder, object).await? {
        Some(flags) => {
            tx.delete_result(folder, object).await?;
            Ok(Some(flags))
        }
        None => Ok(None),
    }
}

/// Apply the given delta to the counters of the folder.
pub async fn update_folder_counts(
    tx: &mut dyn Transaction,
    folder: FolderId,
    delta: CountDelta,
) -> Result<()> {
    if delta.count != 0 {
        tx.add_folder_count(folder, PropTag::CONTENT_COUNT, delta.count)
            .await?;
    }

    if delta.unread != 0 {
        tx.add_folder_count(folder, PropTag::CONTENT_UNREAD, delta.unread)
            .await?;
    }

    Ok(())
}

/// Remove all results of the folder and zero its counters.
pub async fn reset_results(ctx: &SearchContext, folder: FolderId) -> Result<()> {
    let parent = ctx.db.get_parent(folder).await?;

    retry_transaction(ctx.retry_policy(), &ctx.stats, || async move {
        let mut tx = ctx.db.begin().await?;
        tx.lock_folder(folder).await?;
        tx.delete_results(folder).await?;
        tx.reset_folder_counts(folder).await?;
        tx.commit().await
    })
    .await?;

    debug!(folder, "search results reset");

    if let Some(parent) = parent {
        ctx.notifier
            .notify(Notification::HierarchyRowModified(parent, folder));
    }

    Ok(())
}

/// Persist the status of the folder.
pub async fn set_status(ctx: &SearchContext, folder: FolderId, status: FolderStatus) -> Result<()> {
    retry_transaction(ctx.retry_policy(), &ctx.stats, || async move {
        let mut tx = ctx.db.begin().await?;
        tx.lock_folder(folder).await?;
        tx.set_status(folder, status).await?;
        tx.commit().await
    })
    .await?;

    debug!(folder, %status, "search folder status changed");
    Ok(())
}
