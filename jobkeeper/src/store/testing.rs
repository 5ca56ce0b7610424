//! Test suite for ensuring a correct implementation of a store.
use chrono::TimeDelta;

use super::*;
use crate::job::now;

/// Create test suite for a jobkeeper store.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use jobkeeper::test_suite;
/// use jobkeeper::store::memory::InMemoryStore;
/// test_suite!(for: InMemoryStore::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use jobkeeper::test_suite;
/// test_suite!(
///     attrs: [sqlx::test, ignore = "requires DATABASE_URL"],
///     args: (pool: PgPool),
///     store: StoreImplementation::from_pool(pool)
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        $crate::test_suite!(attrs: [$attr], args: $args, store: $store);
    };
    (attrs: $attrs:tt, args: $args:tt, store: $store:expr) => {
        $crate::test_suite!(@test $attrs $args $store; find_not_found);
        $crate::test_suite!(@test $attrs $args $store; create_and_find);
        $crate::test_suite!(@test $attrs $args $store; create_duplicate);
        $crate::test_suite!(@test $attrs $args $store; upsert_inserts_new_job);
        $crate::test_suite!(@test $attrs $args $store; upsert_overwrites_changed_definition);
        $crate::test_suite!(@test $attrs $args $store; upsert_ignores_unchanged_definition);
        $crate::test_suite!(@test $attrs $args $store; update_definition);
        $crate::test_suite!(@test $attrs $args $store; update_definition_not_found);
        $crate::test_suite!(@test $attrs $args $store; update_execution_guarded_by_lease);
        $crate::test_suite!(@test $attrs $args $store; update_execution_not_found);
        $crate::test_suite!(@test $attrs $args $store; concurrent_claims_have_single_winner);
        $crate::test_suite!(@test $attrs $args $store; update_progress_only_while_running);
        $crate::test_suite!(@test $attrs $args $store; list_ready_orders_by_priority_then_schedule);
        $crate::test_suite!(@test $attrs $args $store; list_ready_respects_limit);
        $crate::test_suite!(@test $attrs $args $store; list_deadline_exceeded);
        $crate::test_suite!(@test $attrs $args $store; next_scheduled_time);
        $crate::test_suite!(@test $attrs $args $store; count_running);
        $crate::test_suite!(@test $attrs $args $store; delete_old);
        $crate::test_suite!(@test $attrs $args $store; delete_by_uid);
        $crate::test_suite!(@test $attrs $args $store; group_operations);
    };
    (@test [$($attr:meta),+] $args:tt $store:expr; $name:ident) => {
        $(#[$attr])+
        async fn $name $args {
            let store = $store;
            $crate::store::testing::$name(store).await;
        }
    };
}

pub use test_suite;

#[doc(hidden)]
impl Job {
    pub fn raw_job() -> Self {
        let now = now();
        Self {
            uid: "job".to_owned(),
            group_id: None,
            job_type: "noop".to_owned(),
            priority: Job::PRIORITY_NORMAL,
            data: String::new(),
            result: String::new(),
            max_duration_seconds: 60,
            max_retries: 0,
            state: JobState::Scheduled,
            scheduled: now,
            total_executions: 0,
            run_by: None,
            run_deadline: None,
            run_progress: Job::PROGRESS_MIN,
            last_executed: None,
            is_recurring: false,
            recurring_cron: String::new(),
            consecutive_failures: 0,
            last_failure_error: String::new(),
            created: now,
            updated: now,
        }
    }

    pub fn with_uid(self, uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..self
        }
    }

    pub fn with_group_id(self, group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..self
        }
    }

    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub fn with_state(self, state: JobState) -> Self {
        Self { state, ..self }
    }

    pub fn with_scheduled(self, scheduled: DateTime<Utc>) -> Self {
        Self { scheduled, ..self }
    }

    pub fn with_max_retries(self, max_retries: i32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn with_max_duration_seconds(self, max_duration_seconds: i32) -> Self {
        Self {
            max_duration_seconds,
            ..self
        }
    }

    pub fn with_recurring(self, cron: impl Into<String>) -> Self {
        Self {
            is_recurring: true,
            recurring_cron: cron.into(),
            ..self
        }
    }

    pub fn with_last_executed(self, last_executed: DateTime<Utc>) -> Self {
        Self {
            last_executed: Some(last_executed),
            ..self
        }
    }
}

async fn claimed(store: &impl Store, uid: &str, now: DateTime<Utc>) -> Job {
    let mut job = store.find(uid).await.unwrap();
    let expected = job.expected();
    job.claim("executor-test", now);
    assert!(store.update_execution(&job, expected).await.unwrap());
    job
}

#[doc(hidden)]
pub async fn find_not_found(store: impl Store) {
    assert!(matches!(
        store.find("missing").await,
        Err(StoreError::NotFound(uid)) if uid == "missing"
    ));
}

#[doc(hidden)]
pub async fn create_and_find(store: impl Store) {
    let job = Job::raw_job()
        .with_group_id("group")
        .with_priority(Job::PRIORITY_ELEVATED)
        .with_recurring("0 15 */4 * * *")
        .with_last_executed(now() - TimeDelta::minutes(5));

    store.create(&job).await.unwrap();

    assert_eq!(store.find(&job.uid).await.unwrap(), job);
}

#[doc(hidden)]
pub async fn create_duplicate(store: impl Store) {
    let job = Job::raw_job();
    store.create(&job).await.unwrap();

    assert!(matches!(
        store.create(&job.clone().with_priority(5)).await,
        Err(StoreError::Duplicate(uid)) if uid == job.uid
    ));
    assert_eq!(store.find(&job.uid).await.unwrap().priority, job.priority);
}

#[doc(hidden)]
pub async fn upsert_inserts_new_job(store: impl Store) {
    let job = Job::raw_job().with_recurring("* * * * *");

    store.upsert(&job).await.unwrap();

    assert_eq!(store.find(&job.uid).await.unwrap(), job);
}

#[doc(hidden)]
pub async fn upsert_overwrites_changed_definition(store: impl Store) {
    let job = Job::raw_job().with_recurring("* * * * *");
    store.create(&job).await.unwrap();
    claimed(&store, &job.uid, now()).await;

    let scheduled = now() + TimeDelta::hours(1);
    let changed = job
        .clone()
        .with_recurring("0 0 * * *")
        .with_scheduled(scheduled);
    store.upsert(&changed).await.unwrap();

    let stored = store.find(&job.uid).await.unwrap();
    assert_eq!(stored.recurring_cron, "0 0 * * *");
    assert_eq!(stored.state, JobState::Scheduled);
    assert_eq!(stored.scheduled, scheduled);
    // Execution history survives a definition change.
    assert_eq!(stored.total_executions, 1);
}

#[doc(hidden)]
pub async fn upsert_ignores_unchanged_definition(store: impl Store) {
    let job = Job::raw_job().with_recurring("* * * * *");
    store.create(&job).await.unwrap();
    let running = claimed(&store, &job.uid, now()).await;

    store
        .upsert(&job.clone().with_scheduled(now() + TimeDelta::days(1)))
        .await
        .unwrap();

    assert_eq!(store.find(&job.uid).await.unwrap(), running);
}

#[doc(hidden)]
pub async fn update_definition(store: impl Store) {
    let job = Job::raw_job();
    store.create(&job).await.unwrap();

    let updated = job
        .clone()
        .with_priority(Job::PRIORITY_ELEVATED)
        .with_group_id("other")
        .with_max_retries(4);
    store.update_definition(&updated).await.unwrap();

    let stored = store.find(&job.uid).await.unwrap();
    assert_eq!(stored.priority, Job::PRIORITY_ELEVATED);
    assert_eq!(stored.group_id.as_deref(), Some("other"));
    assert_eq!(stored.max_retries, 4);
}

#[doc(hidden)]
pub async fn update_definition_not_found(store: impl Store) {
    assert!(matches!(
        store.update_definition(&Job::raw_job()).await,
        Err(StoreError::NotFound(_))
    ));
}

#[doc(hidden)]
pub async fn update_execution_guarded_by_lease(store: impl Store) {
    let job = Job::raw_job();
    store.create(&job).await.unwrap();
    let stale = job.expected();

    let running = claimed(&store, &job.uid, now()).await;

    let mut second = job.clone();
    second.claim("executor-other", now());
    assert!(!store.update_execution(&second, stale).await.unwrap());

    let stored = store.find(&job.uid).await.unwrap();
    assert_eq!(stored, running);
    assert_eq!(stored.run_by.as_deref(), Some("executor-test"));
    assert_eq!(stored.total_executions, 1);
}

#[doc(hidden)]
pub async fn update_execution_not_found(store: impl Store) {
    let job = Job::raw_job();
    assert!(matches!(
        store.update_execution(&job, job.expected()).await,
        Err(StoreError::NotFound(_))
    ));
}

#[doc(hidden)]
pub async fn concurrent_claims_have_single_winner(store: impl Store) {
    let job = Job::raw_job();
    store.create(&job).await.unwrap();

    let attempts = (0..8).map(|instance| {
        let mut claim = job.clone();
        let expected = claim.expected();
        claim.claim(&format!("executor-{instance}"), now());
        let store = &store;
        async move { store.update_execution(&claim, expected).await.unwrap() }
    });
    let results = futures::future::join_all(attempts).await;

    assert_eq!(results.into_iter().filter(|won| *won).count(), 1);
    let stored = store.find(&job.uid).await.unwrap();
    assert_eq!(stored.state, JobState::Running);
    assert_eq!(stored.total_executions, 1);
}

#[doc(hidden)]
pub async fn update_progress_only_while_running(store: impl Store) {
    let job = Job::raw_job();
    store.create(&job).await.unwrap();
    let update = |total_executions| ProgressUpdate {
        uid: job.uid.clone(),
        total_executions,
        progress: 42,
        result: "partial".to_owned(),
        updated: now(),
    };

    assert!(!store.update_progress(&update(0)).await.unwrap());

    let running = claimed(&store, &job.uid, now()).await;
    assert!(!store.update_progress(&update(0)).await.unwrap());
    assert!(store
        .update_progress(&update(running.total_executions))
        .await
        .unwrap());

    let stored = store.find(&job.uid).await.unwrap();
    assert_eq!(stored.run_progress, 42);
    assert_eq!(stored.result, "partial");

    assert!(!store
        .update_progress(&ProgressUpdate {
            uid: "missing".to_owned(),
            ..update(1)
        })
        .await
        .unwrap());
}

#[doc(hidden)]
pub async fn list_ready_orders_by_priority_then_schedule(store: impl Store) {
    let now = now();
    let jobs = [
        Job::raw_job()
            .with_uid("b-late")
            .with_scheduled(now - TimeDelta::seconds(1)),
        Job::raw_job()
            .with_uid("a-late")
            .with_scheduled(now - TimeDelta::seconds(1)),
        Job::raw_job()
            .with_uid("early")
            .with_scheduled(now - TimeDelta::minutes(1)),
        Job::raw_job()
            .with_uid("elevated")
            .with_priority(Job::PRIORITY_ELEVATED)
            .with_scheduled(now),
        Job::raw_job()
            .with_uid("future")
            .with_scheduled(now + TimeDelta::seconds(1)),
        Job::raw_job().with_uid("running").with_state(JobState::Running),
        Job::raw_job().with_uid("failed").with_state(JobState::Failed),
    ];
    for job in &jobs {
        store.create(job).await.unwrap();
    }

    let ready = store
        .list_ready(now, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.uid)
        .collect::<Vec<_>>();

    assert_eq!(ready, ["elevated", "early", "a-late", "b-late"]);
}

#[doc(hidden)]
pub async fn list_ready_respects_limit(store: impl Store) {
    let now = now();
    for i in 0..5 {
        store
            .create(
                &Job::raw_job()
                    .with_uid(format!("job-{i}"))
                    .with_scheduled(now - TimeDelta::seconds(i)),
            )
            .await
            .unwrap();
    }

    let ready = store.list_ready(now, 3).await.unwrap();

    assert_eq!(ready.len(), 3);
    assert_eq!(ready[0].uid, "job-4");
    assert!(store.list_ready(now, 0).await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn list_deadline_exceeded(store: impl Store) {
    let start = now();
    for (uid, duration) in [("short", 1), ("shorter", 1), ("long", 3600)] {
        store
            .create(
                &Job::raw_job()
                    .with_uid(uid)
                    .with_max_duration_seconds(duration),
            )
            .await
            .unwrap();
    }
    claimed(&store, "short", start).await;
    claimed(&store, "shorter", start - TimeDelta::seconds(10)).await;
    claimed(&store, "long", start).await;

    let overdue = store
        .list_deadline_exceeded(start + TimeDelta::seconds(5))
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.uid)
        .collect::<Vec<_>>();

    assert_eq!(overdue, ["shorter", "short"]);
    assert!(store.list_deadline_exceeded(start).await.unwrap().len() == 1);
}

#[doc(hidden)]
pub async fn next_scheduled_time(store: impl Store) {
    let now = now();
    assert_eq!(store.next_scheduled_time(now).await.unwrap(), None);

    let soon = now + TimeDelta::minutes(1);
    let later = now + TimeDelta::minutes(10);
    for (uid, scheduled) in [("due", now), ("soon", soon), ("later", later)] {
        store
            .create(&Job::raw_job().with_uid(uid).with_scheduled(scheduled))
            .await
            .unwrap();
    }
    store
        .create(
            &Job::raw_job()
                .with_uid("failed")
                .with_state(JobState::Failed)
                .with_scheduled(now + TimeDelta::seconds(1)),
        )
        .await
        .unwrap();

    assert_eq!(store.next_scheduled_time(now).await.unwrap(), Some(soon));
    assert_eq!(store.next_scheduled_time(soon).await.unwrap(), Some(later));
    assert_eq!(store.next_scheduled_time(later).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn count_running(store: impl Store) {
    assert_eq!(store.count_running().await.unwrap(), 0);
    for uid in ["a", "b", "c"] {
        store.create(&Job::raw_job().with_uid(uid)).await.unwrap();
    }
    claimed(&store, "a", now()).await;
    claimed(&store, "c", now()).await;

    assert_eq!(store.count_running().await.unwrap(), 2);
}

#[doc(hidden)]
pub async fn delete_old(store: impl Store) {
    let now = now();
    let old = now - TimeDelta::days(10);
    let recent = now - TimeDelta::hours(1);
    let jobs = [
        Job::raw_job()
            .with_uid("old-finished")
            .with_state(JobState::Finished)
            .with_last_executed(old),
        Job::raw_job()
            .with_uid("old-failed")
            .with_state(JobState::Failed)
            .with_last_executed(old),
        Job::raw_job()
            .with_uid("old-canceled")
            .with_state(JobState::Canceled)
            .with_last_executed(old),
        Job::raw_job()
            .with_uid("old-scheduled")
            .with_last_executed(old),
        Job::raw_job()
            .with_uid("old-recurring")
            .with_recurring("* * * * *")
            .with_state(JobState::Failed)
            .with_last_executed(old),
        Job::raw_job()
            .with_uid("recent-finished")
            .with_state(JobState::Finished)
            .with_last_executed(recent),
        Job::raw_job()
            .with_uid("never-executed")
            .with_state(JobState::Canceled),
    ];
    for job in &jobs {
        store.create(job).await.unwrap();
    }

    let deleted = store.delete_old(now - TimeDelta::days(5)).await.unwrap();

    assert_eq!(deleted, 3);
    for uid in ["old-finished", "old-failed", "old-canceled"] {
        assert!(matches!(
            store.find(uid).await,
            Err(StoreError::NotFound(_))
        ));
    }
    for uid in [
        "old-scheduled",
        "old-recurring",
        "recent-finished",
        "never-executed",
    ] {
        assert!(store.find(uid).await.is_ok());
    }
}

#[doc(hidden)]
pub async fn delete_by_uid(store: impl Store) {
    let job = Job::raw_job();
    store.create(&job).await.unwrap();

    store.delete_by_uid(&job.uid).await.unwrap();
    store.delete_by_uid(&job.uid).await.unwrap();

    assert!(matches!(
        store.find(&job.uid).await,
        Err(StoreError::NotFound(_))
    ));
}

#[doc(hidden)]
pub async fn group_operations(store: impl Store) {
    for uid in ["a", "b"] {
        store
            .create(&Job::raw_job().with_uid(uid).with_group_id("group"))
            .await
            .unwrap();
    }
    store
        .create(&Job::raw_job().with_uid("c").with_group_id("other"))
        .await
        .unwrap();
    store.create(&Job::raw_job().with_uid("d")).await.unwrap();

    let mut uids = store
        .list_by_group_id("group")
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.uid)
        .collect::<Vec<_>>();
    uids.sort();
    assert_eq!(uids, ["a", "b"]);

    assert_eq!(store.delete_by_group_id("group").await.unwrap(), 2);
    assert_eq!(store.delete_by_group_id("group").await.unwrap(), 0);
    assert!(store.list_by_group_id("group").await.unwrap().is_empty());
    assert!(store.find("c").await.is_ok());
    assert!(store.find("d").await.is_ok());
}
