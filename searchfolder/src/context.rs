//! # Search context
//!
//! Module dedicated to the search context: the explicit set of
//! collaborators and settings shared by every component of the
//! engine. It is built once with a [`SearchContextBuilder`] and
//! passed around behind an `Arc`.

use std::sync::Arc;

use crate::{
    config::SearchFoldersConfig,
    indexer::{IndexerClient, NoIndexer},
    notify::{NoopNotifier, Notifier},
    restriction::{PropertyEvaluator, RestrictionEvaluator},
    retry::RetryPolicy,
    stats::Stats,
    store::Database,
};

/// The search context.
pub struct SearchContext {
    pub db: Arc<dyn Database>,
    pub evaluator: Arc<dyn RestrictionEvaluator>,
    pub indexer: Arc<dyn IndexerClient>,
    pub notifier: Arc<dyn Notifier>,
    pub stats: Arc<Stats>,
    pub config: SearchFoldersConfig,
    retry_policy: RetryPolicy,
}

impl SearchContext {
    /// The retry policy applied to every search folder transaction.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

/// The search context builder.
#[derive(Clone)]
pub struct SearchContextBuilder {
    db: Arc<dyn Database>,
    evaluator: Option<Arc<dyn RestrictionEvaluator>>,
    indexer: Option<Arc<dyn IndexerClient>>,
    notifier: Option<Arc<dyn Notifier>>,
    stats: Option<Arc<Stats>>,
    config: SearchFoldersConfig,
}

impl SearchContextBuilder {
    /// Create a new builder around the given database.
    ///
    /// Other collaborators default to a [`PropertyEvaluator`] on the
    /// same database, no indexer and no notifications.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            evaluator: None,
            indexer: None,
            notifier: None,
            stats: None,
            config: Default::default(),
        }
    }

    pub fn set_evaluator(&mut self, evaluator: Arc<dyn RestrictionEvaluator>) {
        self.evaluator = Some(evaluator);
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn RestrictionEvaluator>) -> Self {
        self.set_evaluator(evaluator);
        self
    }

    pub fn set_indexer(&mut self, indexer: Arc<dyn IndexerClient>) {
        self.indexer = Some(indexer);
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn IndexerClient>) -> Self {
        self.set_indexer(indexer);
        self
    }

    pub fn set_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifier = Some(notifier);
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.set_notifier(notifier);
        self
    }

    /// Share the given stats instead of creating new ones.
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn set_config(&mut self, config: SearchFoldersConfig) {
        self.config = config;
    }

    pub fn with_config(mut self, config: SearchFoldersConfig) -> Self {
        self.set_config(config);
        self
    }

    pub fn build(self) -> SearchContext {
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(PropertyEvaluator::new(self.db.clone())));

        SearchContext {
            evaluator,
            indexer: self.indexer.unwrap_or_else(|| Arc::new(NoIndexer)),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier)),
            stats: self.stats.unwrap_or_default(),
            retry_policy: self.config.retry_policy(),
            config: self.config,
            db: self.db,
        }
    }
}
