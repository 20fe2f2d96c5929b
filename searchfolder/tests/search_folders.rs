use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use searchfolder::{
    config::SearchFoldersConfig,
    context::SearchContextBuilder,
    criteria::{SearchCriteria, SearchFlags},
    folder::SearchState,
    indexer::{self, IndexerClient, IndexerResults},
    notify::{MemoryNotifier, Notification},
    restriction::{
        PropTag, PropValue, PropertyEvaluator, Restriction, RestrictionEvaluator, SubObject,
        SubRestrictionResults,
    },
    store::{self, Database, FolderStatus, MemoryDatabase, Row, Transaction, MSGFLAG_READ},
    ChangeKind, Error, FolderId, Guid, ObjectId, SearchFolders, StoreId,
};
use tokio::{
    sync::{Notify, Semaphore},
    time::{sleep, timeout},
};

fn config() -> SearchFoldersConfig {
    SearchFoldersConfig {
        threads: Some(2),
        retry_backoff_min_ms: Some(0),
        retry_backoff_max_ms: Some(1),
        ..Default::default()
    }
}

fn context(db: &MemoryDatabase, notifier: &Arc<MemoryNotifier>) -> SearchContextBuilder {
    SearchContextBuilder::new(Arc::new(db.clone()))
        .with_notifier(notifier.clone())
        .with_config(config())
}

fn subject(subject: &str) -> [(PropTag, PropValue); 1] {
    [(PropTag::SUBJECT, subject.into())]
}

fn subject_contains(folders: impl IntoIterator<Item = FolderId>, value: &str) -> SearchCriteria {
    SearchCriteria::new(
        folders,
        Restriction::contains(PropTag::SUBJECT, value),
        SearchFlags::RESTART_SEARCH,
    )
    .unwrap()
}

async fn wait_rebuilt(engine: &SearchFolders, store: StoreId, folder: FolderId) {
    timeout(Duration::from_secs(5), async {
        while engine.get_state(store, folder).await.is_rebuilding() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("rebuild should finish");
}

/// An evaluator blocking every batch until the test lets it go.
struct GatedEvaluator {
    inner: PropertyEvaluator,
    entered: Notify,
    gate: Semaphore,
}

impl GatedEvaluator {
    fn new(db: &MemoryDatabase) -> Self {
        Self {
            inner: PropertyEvaluator::new(Arc::new(db.clone())),
            entered: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    fn open(&self) {
        self.gate.add_permits(1024);
    }
}

#[async_trait]
impl RestrictionEvaluator for GatedEvaluator {
    async fn sub_restrictions(
        &self,
        store: StoreId,
        restriction: &Restriction,
        objects: &[ObjectId],
    ) -> store::Result<SubRestrictionResults> {
        self.entered.notify_one();
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        self.inner.sub_restrictions(store, restriction, objects).await
    }

    fn matches(&self, row: &Row, restriction: &Restriction, subs: &SubRestrictionResults) -> bool {
        self.inner.matches(row, restriction, subs)
    }
}

/// An evaluator recording how many batches are evaluated at the same
/// time.
struct ConcurrencyEvaluator {
    inner: PropertyEvaluator,
    current: AtomicUsize,
    max: AtomicUsize,
}

#[async_trait]
impl RestrictionEvaluator for ConcurrencyEvaluator {
    async fn sub_restrictions(
        &self,
        store: StoreId,
        restriction: &Restriction,
        objects: &[ObjectId],
    ) -> store::Result<SubRestrictionResults> {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(current, Ordering::SeqCst);
        sleep(Duration::from_millis(2)).await;
        let subs = self.inner.sub_restrictions(store, restriction, objects).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        subs
    }

    fn matches(&self, row: &Row, restriction: &Restriction, subs: &SubRestrictionResults) -> bool {
        self.inner.matches(row, restriction, subs)
    }
}

struct StaticIndexer(IndexerResults);

#[async_trait]
impl IndexerClient for StaticIndexer {
    async fn query(
        &self,
        _server: Guid,
        _store: Guid,
        _folders: &[FolderId],
        _restriction: &Restriction,
    ) -> indexer::Result<IndexerResults> {
        Ok(self.0.clone())
    }
}

struct DecliningIndexer;

#[async_trait]
impl IndexerClient for DecliningIndexer {
    async fn query(
        &self,
        _server: Guid,
        _store: Guid,
        _folders: &[FolderId],
        _restriction: &Restriction,
    ) -> indexer::Result<IndexerResults> {
        Err(indexer::Error::DeclinedError)
    }
}

#[test_log::test(tokio::test)]
async fn incremental_updates() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let archive = db.create_folder(store).unwrap();
    let search = db.create_search_folder(store).unwrap();

    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(context(&db, &notifier).build());

    // testing definition

    engine
        .define(store, search, Some(subject_contains([inbox], "foo")), true)
        .await
        .unwrap();
    wait_rebuilt(&engine, store, search).await;

    assert!(engine.search_results(search).await.unwrap().is_empty());
    assert_eq!(db.status(search), FolderStatus::Running);
    assert!(db.persisted_criteria(search).is_some());

    let notifications = notifier.take();
    assert!(notifications.contains(&Notification::TableChanged(search)));
    assert!(notifications.contains(&Notification::HierarchyRowModified(store, search)));
    assert_eq!(
        notifications.last(),
        Some(&Notification::SearchComplete(store, search))
    );

    // testing message creation

    let m1 = db.create_message(inbox, subject("foobar")).unwrap();
    let m2 = db.create_message(inbox, subject("bar")).unwrap();
    engine.notify_changes(store, inbox, [m1, m2], ChangeKind::Add);
    engine.flush().await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1]);
    assert_eq!(db.folder_counts(search), (1, 1));
    assert_eq!(
        notifier.take(),
        vec![
            Notification::TableRowAdded(search, m1),
            Notification::CacheInvalidated(search),
            Notification::FolderModified(search),
            Notification::HierarchyRowModified(store, search),
        ]
    );

    // testing duplicate events

    engine.notify_change(store, inbox, m1, ChangeKind::Add);
    engine.notify_change(store, inbox, m1, ChangeKind::Add);
    engine.flush().await;
    engine.notify_change(store, inbox, m1, ChangeKind::Add);
    engine.flush().await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1]);
    assert_eq!(db.folder_counts(search), (1, 1));
    assert!(!notifier
        .take()
        .contains(&Notification::FolderModified(search)));

    // testing read state changes

    db.set_read(m1, true).unwrap();
    engine.notify_change(store, inbox, m1, ChangeKind::Modify);
    engine.flush().await;

    assert_eq!(db.folder_counts(search), (1, 0));
    assert_eq!(db.results(search).get(&m1), Some(&MSGFLAG_READ));
    assert!(notifier
        .take()
        .contains(&Notification::TableRowModified(search, m1)));

    // testing property changes

    db.set_prop(m1, PropTag::SUBJECT, "baz").unwrap();
    engine.notify_change(store, inbox, m1, ChangeKind::Modify);
    engine.flush().await;

    assert!(engine.search_results(search).await.unwrap().is_empty());
    assert_eq!(db.folder_counts(search), (0, 0));
    assert!(notifier
        .take()
        .contains(&Notification::TableRowDeleted(search, m1)));

    db.set_prop(m1, PropTag::SUBJECT, "foo again").unwrap();
    db.set_prop(m2, PropTag::SUBJECT, "food").unwrap();
    engine.notify_changes(store, inbox, [m1, m2], ChangeKind::Modify);
    engine.flush().await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1, m2]);
    assert_eq!(db.folder_counts(search), (2, 1));

    // testing moves out of the target folder

    db.move_object(m1, archive).unwrap();
    engine.notify_change(store, inbox, m1, ChangeKind::Delete);
    engine.notify_change(store, archive, m1, ChangeKind::Add);
    engine.flush().await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m2]);
    assert_eq!(db.folder_counts(search), (1, 1));
    assert!(notifier
        .take()
        .contains(&Notification::TableRowDeleted(search, m1)));

    // testing deletions

    db.soft_delete(m2).unwrap();
    engine.notify_change(store, inbox, m2, ChangeKind::Delete);
    engine.flush().await;

    assert!(engine.search_results(search).await.unwrap().is_empty());
    assert_eq!(db.folder_counts(search), (0, 0));

    // testing stats

    let stats = engine.stats().await;
    assert_eq!(stats.stores, 1);
    assert_eq!(stats.folders, 1);
    assert_eq!(stats.events, 0);
    assert_eq!(stats.workers, 0);
    assert_eq!(stats.update_failures, 0);

    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn recursive_search() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let sub = db.create_folder(inbox).unwrap();
    let flat = db.create_search_folder(store).unwrap();
    let deep = db.create_search_folder(store).unwrap();

    let m0 = db.create_message(sub, subject("foo before")).unwrap();

    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(context(&db, &notifier).build());

    let recursive = SearchCriteria::new(
        [inbox],
        Restriction::contains(PropTag::SUBJECT, "foo"),
        SearchFlags::RECURSIVE_SEARCH,
    )
    .unwrap();

    engine
        .define(store, flat, Some(subject_contains([inbox], "foo")), true)
        .await
        .unwrap();
    engine
        .define(store, deep, Some(recursive.clone()), true)
        .await
        .unwrap();
    wait_rebuilt(&engine, store, flat).await;
    wait_rebuilt(&engine, store, deep).await;

    assert!(engine.search_results(flat).await.unwrap().is_empty());
    assert_eq!(engine.search_results(deep).await.unwrap(), vec![m0]);

    // testing criteria and state

    let (criteria, state) = engine.get_criteria(store, deep).await.unwrap();
    assert_eq!(criteria, recursive);
    assert!(state.is_running());
    assert!(state.contains(SearchState::RECURSIVE));

    let (_, state) = engine.get_criteria(store, flat).await.unwrap();
    assert!(!state.contains(SearchState::RECURSIVE));

    // testing changes in descendants

    let subsub = db.create_folder(sub).unwrap();
    let m1 = db.create_message(sub, subject("foo 1")).unwrap();
    let m2 = db.create_message(subsub, subject("foo 2")).unwrap();
    engine.notify_change(store, sub, m1, ChangeKind::Add);
    engine.notify_change(store, subsub, m2, ChangeKind::Add);
    engine.flush().await;

    assert_eq!(engine.search_results(deep).await.unwrap(), vec![m0, m1, m2]);
    assert_eq!(db.folder_counts(deep), (3, 3));
    assert!(engine.search_results(flat).await.unwrap().is_empty());

    // testing rebuild agrees with incremental updates

    engine.restart_searches().await.unwrap();

    assert_eq!(engine.search_results(deep).await.unwrap(), vec![m0, m1, m2]);
    assert_eq!(db.folder_counts(deep), (3, 3));
    assert!(engine.search_results(flat).await.unwrap().is_empty());

    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn cancel_running_rebuild() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let search = db.create_search_folder(store).unwrap();

    let messages: Vec<_> = (0..3)
        .map(|i| db.create_message(inbox, subject(&format!("foo {i}"))).unwrap())
        .collect();

    let evaluator = Arc::new(GatedEvaluator::new(&db));
    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(
        context(&db, &notifier)
            .with_evaluator(evaluator.clone())
            .with_config(SearchFoldersConfig {
                scan_batch_size: Some(1),
                ..config()
            })
            .build(),
    );

    engine
        .define(store, search, Some(subject_contains([inbox], "foo")), true)
        .await
        .unwrap();
    evaluator.entered.notified().await;
    assert!(engine.get_state(store, search).await.is_rebuilding());

    // cancel waits for the worker

    let cancel = engine.cancel(store, search);
    tokio::pin!(cancel);
    assert!(timeout(Duration::from_millis(50), &mut cancel).await.is_err());

    evaluator.open();
    cancel.await.unwrap();

    assert!(engine.get_state(store, search).await.is_absent());
    assert_eq!(db.status(search), FolderStatus::Stopped);
    assert_eq!(engine.stats().await.workers, 0);

    let results = db.results(search);
    assert!(results.len() <= 1);

    // a stopped search folder is never updated

    engine.notify_changes(store, inbox, messages.iter().copied(), ChangeKind::Add);
    engine.flush().await;
    assert_eq!(db.results(search), results);

    assert!(matches!(
        engine.cancel(store, search).await,
        Err(Error::SearchFolderNotFoundError(_, _))
    ));

    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn racing_definitions() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let search = db.create_search_folder(store).unwrap();

    let mut foos = BTreeSet::new();
    let mut bars = BTreeSet::new();
    for i in 0..4 {
        foos.insert(db.create_message(inbox, subject(&format!("foo {i}"))).unwrap());
        bars.insert(db.create_message(inbox, subject(&format!("bar {i}"))).unwrap());
    }

    let evaluator = Arc::new(ConcurrencyEvaluator {
        inner: PropertyEvaluator::new(Arc::new(db.clone())),
        current: AtomicUsize::new(0),
        max: AtomicUsize::new(0),
    });
    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(
        context(&db, &notifier)
            .with_evaluator(evaluator.clone())
            .with_config(SearchFoldersConfig {
                threads: Some(4),
                scan_batch_size: Some(1),
                ..config()
            })
            .build(),
    );

    let (a, b) = tokio::join!(
        engine.define(store, search, Some(subject_contains([inbox], "foo")), true),
        engine.define(store, search, Some(subject_contains([inbox], "bar")), true),
    );
    a.unwrap();
    b.unwrap();
    wait_rebuilt(&engine, store, search).await;

    assert_eq!(evaluator.max.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats().await.folders, 1);

    let (criteria, _) = engine.get_criteria(store, search).await.unwrap();
    assert_eq!(db.persisted_criteria(search), Some(criteria.encode().unwrap()));

    let expected = if criteria == subject_contains([inbox], "foo") {
        foos
    } else {
        bars
    };
    let results: BTreeSet<_> = engine.search_results(search).await.unwrap().into_iter().collect();
    assert_eq!(results, expected);
    assert_eq!(db.folder_counts(search), (4, 4));

    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn sub_restrictions() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let search = db.create_search_folder(store).unwrap();

    let email = || [(PropTag::EMAIL_ADDRESS, PropValue::from("alice@localhost"))];
    let m1 = db.create_message(inbox, subject("foo 1")).unwrap();
    db.add_recipient(m1, email()).unwrap();
    let m2 = db.create_message(inbox, subject("foo 2")).unwrap();
    db.add_recipient(m2, [(PropTag::DISPLAY_NAME, PropValue::from("Alice"))])
        .unwrap();
    let m3 = db.create_message(inbox, subject("foo 3")).unwrap();
    db.add_attachment(m3, [(PropTag::ATTACH_LONG_FILENAME, PropValue::from("foo.txt"))])
        .unwrap();
    let m4 = db.create_message(inbox, subject("bar 4")).unwrap();
    db.add_recipient(m4, email()).unwrap();

    let criteria = SearchCriteria::new(
        [inbox],
        Restriction::And(vec![
            Restriction::contains(PropTag::SUBJECT, "foo"),
            Restriction::Sub {
                kind: SubObject::Recipients,
                restriction: Box::new(Restriction::Exist(PropTag::EMAIL_ADDRESS)),
            },
        ]),
        SearchFlags::RESTART_SEARCH,
    )
    .unwrap();

    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(context(&db, &notifier).build());

    // testing rebuild

    engine
        .define(store, search, Some(criteria), true)
        .await
        .unwrap();
    wait_rebuilt(&engine, store, search).await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1]);
    assert_eq!(db.folder_counts(search), (1, 1));

    // testing creation along with a missing object

    let m5 = db.create_message(inbox, subject("foo 5")).unwrap();
    db.add_recipient(m5, email()).unwrap();
    engine.notify_changes(store, inbox, [m5, 999_999], ChangeKind::Add);
    engine.flush().await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1, m5]);
    assert_eq!(db.folder_counts(search), (2, 2));

    // testing modification of a vanished member along with a missing
    // object

    db.soft_delete(m5).unwrap();
    db.add_recipient(m2, email()).unwrap();
    engine.notify_changes(store, inbox, [m2, m5, 999_999], ChangeKind::Modify);
    engine.flush().await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1, m2]);
    assert_eq!(db.folder_counts(search), (2, 2));
    let notifications = notifier.take();
    assert!(notifications.contains(&Notification::TableRowAdded(search, m2)));
    assert!(notifications.contains(&Notification::TableRowDeleted(search, m5)));

    // testing deletion along with a missing object

    engine.notify_changes(store, inbox, [m1, 999_999], ChangeKind::Delete);
    engine.flush().await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m2]);
    assert_eq!(db.folder_counts(search), (1, 1));
    assert_eq!(engine.stats().await.update_failures, 0);

    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn define_after_cancel() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let search = db.create_search_folder(store).unwrap();
    let m1 = db.create_message(inbox, subject("foo")).unwrap();

    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(context(&db, &notifier).build());

    engine
        .define(store, search, Some(subject_contains([inbox], "foo")), true)
        .await
        .unwrap();
    wait_rebuilt(&engine, store, search).await;

    // testing cancellation

    engine.define(store, search, None, false).await.unwrap();

    assert!(engine.get_state(store, search).await.is_absent());
    assert_eq!(db.status(search), FolderStatus::Stopped);

    // testing definition without restart

    let bar = subject_contains([inbox], "bar");
    engine
        .define(store, search, Some(bar.clone()), false)
        .await
        .unwrap();

    assert!(engine.get_state(store, search).await.is_running());
    assert_eq!(db.status(search), FolderStatus::Running);
    assert_eq!(db.persisted_criteria(search), Some(bar.encode().unwrap()));
    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1]);

    engine.shutdown().await.unwrap();

    // testing reload

    let engine = SearchFolders::new(context(&db, &notifier).build());
    engine.load().await.unwrap();

    let (criteria, state) = engine.get_criteria(store, search).await.unwrap();
    assert_eq!(criteria, bar);
    assert!(state.is_running());
    assert!(!state.is_rebuilding());

    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn load_persisted_search_folders() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let m1 = db.create_message(inbox, subject("foo")).unwrap();
    let m2 = db.create_message(inbox, subject("bar")).unwrap();

    let criteria = subject_contains([inbox], "foo").encode().unwrap();

    let running = db.create_search_folder(store).unwrap();
    db.set_persisted_criteria(running, &criteria);
    let mut tx = db.begin().await.unwrap();
    tx.upsert_result(running, m2, 0).await.unwrap();
    tx.commit().await.unwrap();

    let rebuilding = db.create_search_folder(store).unwrap();
    db.set_persisted_criteria(rebuilding, &criteria);
    db.set_persisted_status(rebuilding, FolderStatus::Rebuilding);

    let stopped = db.create_search_folder(store).unwrap();
    db.set_persisted_criteria(stopped, &criteria);
    db.set_persisted_status(stopped, FolderStatus::Stopped);

    let malformed = db.create_search_folder(store).unwrap();
    db.set_persisted_criteria(malformed, "{");

    let missing = db.create_search_folder(store).unwrap();

    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(context(&db, &notifier).build());
    engine.load().await.unwrap();
    wait_rebuilt(&engine, store, rebuilding).await;

    assert_eq!(engine.stats().await.folders, 2);
    assert!(engine.get_state(store, running).await.is_running());
    assert!(engine.get_state(store, rebuilding).await.is_running());
    assert!(engine.get_state(store, stopped).await.is_absent());
    assert!(engine.get_state(store, malformed).await.is_absent());
    assert!(engine.get_state(store, missing).await.is_absent());

    // results of running search folders are trusted
    assert_eq!(engine.search_results(running).await.unwrap(), vec![m2]);
    assert_eq!(engine.search_results(rebuilding).await.unwrap(), vec![m1]);
    assert_eq!(db.status(rebuilding), FolderStatus::Running);

    // testing criteria loaded on demand

    assert!(matches!(
        engine.add_search_folder(store, malformed, false, None).await,
        Err(Error::CriteriaError(_))
    ));
    assert!(matches!(
        engine.add_search_folder(store, missing, false, None).await,
        Err(Error::CriteriaNotFoundError(_))
    ));
    engine
        .add_search_folder(store, stopped, false, None)
        .await
        .unwrap();
    assert!(engine.get_state(store, stopped).await.is_running());
    assert_eq!(db.status(stopped), FolderStatus::Running);

    // testing startup rebuilds

    engine.restart_searches().await.unwrap();
    assert_eq!(engine.search_results(running).await.unwrap(), vec![m1]);
    assert_eq!(engine.search_results(stopped).await.unwrap(), vec![m1]);
    assert_eq!(db.folder_counts(running), (1, 1));

    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn retry_lock_conflicts() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let search = db.create_search_folder(store).unwrap();

    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(
        context(&db, &notifier)
            .with_config(SearchFoldersConfig {
                max_attempts: Some(4),
                ..config()
            })
            .build(),
    );

    engine
        .define(store, search, Some(subject_contains([inbox], "foo")), false)
        .await
        .unwrap();

    // testing exhausted attempts

    db.inject_lock_conflicts(search, 4);
    let m1 = db.create_message(inbox, subject("foo 1")).unwrap();
    engine.notify_change(store, inbox, m1, ChangeKind::Add);
    engine.flush().await;

    assert!(engine.search_results(search).await.unwrap().is_empty());
    let stats = engine.stats().await;
    assert_eq!(stats.update_retries, 3);
    assert_eq!(stats.update_failures, 1);

    // testing successful retries

    db.inject_lock_conflicts(search, 2);
    let m2 = db.create_message(inbox, subject("foo 2")).unwrap();
    engine.notify_change(store, inbox, m1, ChangeKind::Add);
    engine.notify_change(store, inbox, m2, ChangeKind::Add);
    engine.flush().await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1, m2]);
    assert_eq!(db.folder_counts(search), (2, 2));
    let stats = engine.stats().await;
    assert_eq!(stats.update_retries, 5);
    assert_eq!(stats.update_failures, 1);

    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn indexed_rebuild() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let m1 = db.create_message(inbox, subject("foo 1")).unwrap();
    let m2 = db.create_message(inbox, subject("foo 2")).unwrap();
    let m3 = db.create_message(inbox, subject("bar")).unwrap();
    let m4 = db.create_message(inbox, subject("foo deleted")).unwrap();
    db.soft_delete(m4).unwrap();
    db.set_read(m2, true).unwrap();

    // testing candidates without residual restriction

    let search = db.create_search_folder(store).unwrap();
    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(
        context(&db, &notifier)
            .with_indexer(Arc::new(StaticIndexer(IndexerResults {
                objects: vec![m1, m2, m4, 9999],
                residual: None,
                suggestion: String::from("foo*"),
            })))
            .build(),
    );

    engine
        .define(store, search, Some(subject_contains([inbox], "foo")), true)
        .await
        .unwrap();
    wait_rebuilt(&engine, store, search).await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1, m2]);
    assert_eq!(db.folder_counts(search), (2, 1));
    assert_eq!(db.suggestion(search).as_deref(), Some("foo*"));

    let notifications = notifier.take();
    assert!(notifications.contains(&Notification::TableChanged(search)));
    assert!(notifications.contains(&Notification::FolderModified(search)));
    assert!(!notifications
        .iter()
        .any(|n| matches!(n, Notification::TableRowAdded(..))));

    engine.shutdown().await.unwrap();

    // testing candidates with residual restriction

    let search = db.create_search_folder(store).unwrap();
    let engine = SearchFolders::new(
        context(&db, &notifier)
            .with_indexer(Arc::new(StaticIndexer(IndexerResults {
                objects: vec![m1, m3],
                residual: Some(Restriction::contains(PropTag::SUBJECT, "foo")),
                suggestion: String::new(),
            })))
            .build(),
    );

    engine
        .define(store, search, Some(subject_contains([inbox], "foo")), true)
        .await
        .unwrap();
    wait_rebuilt(&engine, store, search).await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1]);
    engine.shutdown().await.unwrap();

    // testing fallback to full scans

    let search = db.create_search_folder(store).unwrap();
    let engine = SearchFolders::new(
        context(&db, &notifier)
            .with_indexer(Arc::new(DecliningIndexer))
            .build(),
    );

    engine
        .define(store, search, Some(subject_contains([inbox], "foo")), true)
        .await
        .unwrap();
    wait_rebuilt(&engine, store, search).await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1, m2]);
    assert_eq!(db.suggestion(search), None);
    engine.shutdown().await.unwrap();

    // testing disabled indexer

    let search = db.create_search_folder(store).unwrap();
    let engine = SearchFolders::new(
        context(&db, &notifier)
            .with_indexer(Arc::new(StaticIndexer(IndexerResults {
                objects: vec![m3],
                residual: None,
                suggestion: String::from("bar"),
            })))
            .with_config(SearchFoldersConfig {
                index_enabled: Some(false),
                ..config()
            })
            .build(),
    );

    engine
        .define(store, search, Some(subject_contains([inbox], "foo")), true)
        .await
        .unwrap();
    wait_rebuilt(&engine, store, search).await;

    assert_eq!(engine.search_results(search).await.unwrap(), vec![m1, m2]);
    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn remove_search_folders() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let s1 = db.create_search_folder(store).unwrap();
    let s2 = db.create_search_folder(store).unwrap();
    let m1 = db.create_message(inbox, subject("foo")).unwrap();

    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(context(&db, &notifier).build());

    for search in [s1, s2] {
        engine
            .define(store, search, Some(subject_contains([inbox], "foo")), true)
            .await
            .unwrap();
        wait_rebuilt(&engine, store, search).await;
        assert_eq!(engine.search_results(search).await.unwrap(), vec![m1]);
    }

    // testing cancellation through empty criteria

    engine.define(store, s1, None, false).await.unwrap();
    assert!(engine.get_state(store, s1).await.is_absent());
    assert_eq!(db.status(s1), FolderStatus::Stopped);
    assert_eq!(engine.search_results(s1).await.unwrap(), vec![m1]);
    engine.define(store, s1, None, false).await.unwrap();

    // testing removal

    engine.remove(store, s1).await.unwrap();
    assert!(engine.search_results(s1).await.unwrap().is_empty());
    assert_eq!(db.folder_counts(s1), (0, 0));

    // testing store removal

    assert!(matches!(
        engine.remove_store(store + 1000).await,
        Err(Error::StoreNotFoundError(_))
    ));

    engine.remove_store(store).await.unwrap();
    assert!(engine.get_state(store, s2).await.is_absent());
    assert!(engine.search_results(s2).await.unwrap().is_empty());
    assert_eq!(db.status(s2), FolderStatus::Stopped);
    assert_eq!(engine.stats().await.stores, 0);

    assert!(matches!(
        engine.remove_store(store).await,
        Err(Error::StoreNotFoundError(_))
    ));

    engine.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn shutdown_processes_pending_events() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let search = db.create_search_folder(store).unwrap();

    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(context(&db, &notifier).build());

    engine
        .define(store, search, Some(subject_contains([inbox], "foo")), false)
        .await
        .unwrap();

    let m1 = db.create_message(inbox, subject("foo")).unwrap();
    engine.notify_change(store, inbox, m1, ChangeKind::Add);
    engine.shutdown().await.unwrap();

    assert_eq!(db.results(search).len(), 1);
    assert_eq!(engine.stats().await.folders, 0);

    // flushing a stopped engine returns at once
    engine.notify_change(store, inbox, m1, ChangeKind::Modify);
    engine.flush().await;

    assert!(matches!(
        engine
            .define(store, search, Some(subject_contains([inbox], "foo")), true)
            .await,
        Err(Error::ShutDownError(_))
    ));
}

#[test_log::test(tokio::test)]
async fn shutdown_resumes_interrupted_rebuilds() {
    let db = MemoryDatabase::new();
    let store = db.create_store();
    let inbox = db.create_folder(store).unwrap();
    let search = db.create_search_folder(store).unwrap();

    for i in 0..3 {
        db.create_message(inbox, subject(&format!("foo {i}"))).unwrap();
    }

    let evaluator = Arc::new(GatedEvaluator::new(&db));
    let notifier = Arc::new(MemoryNotifier::default());
    let engine = SearchFolders::new(
        context(&db, &notifier)
            .with_evaluator(evaluator.clone())
            .with_config(SearchFoldersConfig {
                scan_batch_size: Some(1),
                ..config()
            })
            .build(),
    );

    engine
        .define(store, search, Some(subject_contains([inbox], "foo")), true)
        .await
        .unwrap();
    evaluator.entered.notified().await;

    let shutdown = engine.shutdown();
    tokio::pin!(shutdown);
    assert!(timeout(Duration::from_millis(50), &mut shutdown).await.is_err());

    evaluator.open();
    shutdown.await.unwrap();

    assert_eq!(db.status(search), FolderStatus::Rebuilding);
    assert!(db.results(search).len() <= 1);

    // the next engine finishes the job

    let engine = SearchFolders::new(context(&db, &notifier).build());
    engine.load().await.unwrap();
    wait_rebuilt(&engine, store, search).await;

    assert_eq!(engine.search_results(search).await.unwrap().len(), 3);
    assert_eq!(db.folder_counts(search), (3, 3));
    assert_eq!(db.status(search), FolderStatus::Running);

    engine.shutdown().await.unwrap();
}
