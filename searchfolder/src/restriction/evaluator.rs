use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use tracing::trace;

use super::Restriction;
use crate::{
    store::{self, Database, Row},
    ObjectId, StoreId,
};

/// The objects matching each sub-restriction of a restriction.
///
/// Entries are indexed in the order given by
/// [`Restriction::sub_restrictions`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubRestrictionResults(Vec<BTreeSet<ObjectId>>);

impl SubRestrictionResults {
    pub fn new(results: Vec<BTreeSet<ObjectId>>) -> Self {
        Self(results)
    }

    /// Return `true` if the given object matches the sub-restriction
    /// at the given index.
    pub fn contains(&self, index: usize, object: ObjectId) -> bool {
        self.0
            .get(index)
            .map(|objects| objects.contains(&object))
            .unwrap_or(false)
    }
}

/// The restriction evaluator.
///
/// Sub-restrictions are resolved once per batch of candidates, then
/// every candidate row is matched against the restriction using
/// those results.
#[async_trait]
pub trait RestrictionEvaluator: Send + Sync {
    /// Resolve all sub-restrictions of the given restriction for the
    /// given candidate objects.
    async fn sub_restrictions(
        &self,
        store: StoreId,
        restriction: &Restriction,
        objects: &[ObjectId],
    ) -> store::Result<SubRestrictionResults>;

    /// Match one candidate row against the restriction.
    fn matches(&self, row: &Row, restriction: &Restriction, subs: &SubRestrictionResults)
        -> bool;
}

/// The default restriction evaluator.
///
/// Rows are matched using their properties, sub-restrictions are
/// resolved by querying sub-objects from the database.
#[derive(Clone)]
pub struct PropertyEvaluator {
    db: Arc<dyn Database>,
}

impl PropertyEvaluator {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RestrictionEvaluator for PropertyEvaluator {
    async fn sub_restrictions(
        &self,
        store: StoreId,
        restriction: &Restriction,
        objects: &[ObjectId],
    ) -> store::Result<SubRestrictionResults> {
        let subs = restriction.sub_restrictions();
        let mut results = Vec::with_capacity(subs.len());

        for (kind, sub) in subs {
            let mut matching = BTreeSet::new();

            for object in objects {
                let rows = match self.db.query_sub_rows(*object, kind).await {
                    Ok(rows) => rows,
                    Err(store::Error::ObjectNotFoundError(_)) => {
                        trace!(store, object, "object vanished, no sub-object can match");
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                // nested sub-restrictions are rejected with the criteria
                let empty = SubRestrictionResults::default();
                if rows.iter().any(|row| sub.matches(row, &empty)) {
                    matching.insert(*object);
                }
            }

            trace!(store, ?kind, matches = matching.len(), "resolved sub-restriction");
            results.push(matching);
        }

        Ok(SubRestrictionResults::new(results))
    }

    fn matches(&self, row: &Row, restriction: &Restriction, subs: &SubRestrictionResults) -> bool {
        restriction.matches(row, subs)
    }
}
