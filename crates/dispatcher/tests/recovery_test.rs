use chrono::Duration;
use jobs_dispatcher::HandlerRegistry;
use jobs_domain::{JobStore, RunState, TaskState};
use jobs_testing_utils::{test_epoch, JobDefBuilder, JobRunBuilder, JobTaskBuilder, Script, TestEngine};

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    Script::new(1).register(&mut registry, "batch").unwrap();
    registry
}

#[tokio::test]
async fn test_dead_task_is_requeued_or_failed() {
    let lenient = JobDefBuilder::new("lenient", "batch")
        .with_task_timeout_secs(60)
        .with_task_retries(1)
        .build();
    let strict = JobDefBuilder::new("strict", "batch")
        .with_task_timeout_secs(60)
        .build();
    let te = TestEngine::new(registry(), [lenient.clone(), strict.clone()]);

    let stale = test_epoch() - Duration::minutes(5);
    let lenient_run = JobRunBuilder::new("lenient_1", &lenient)
        .with_state(RunState::Running)
        .started_at(stale)
        .build();
    let strict_run = JobRunBuilder::new("strict_1", &strict)
        .with_state(RunState::Running)
        .started_at(stale)
        .build();
    let tasks = vec![
        JobTaskBuilder::new(&lenient_run, 1)
            .with_state(TaskState::Running)
            .started_at(stale)
            .build(),
        JobTaskBuilder::new(&lenient_run, 2)
            .with_state(TaskState::Running)
            .started_at(test_epoch() - Duration::seconds(30))
            .build(),
        JobTaskBuilder::new(&strict_run, 1)
            .with_state(TaskState::Running)
            .started_at(stale)
            .build(),
    ];
    te.store
        .insert_job_runs(vec![lenient_run, strict_run])
        .await
        .unwrap();
    te.store.insert_job_tasks(tasks).await.unwrap();

    te.engine.expire_or_retry_dead_tasks().await;

    let lenient_tasks = te.tasks_of("lenient_1").await;
    assert_eq!(lenient_tasks[0].state, TaskState::Pending);
    assert_eq!(lenient_tasks[0].latest_error(), Some("deadline exceeded"));
    assert_eq!(lenient_tasks[1].state, TaskState::Running);

    let strict_task = te.tasks_of("strict_1").await.remove(0);
    assert!(strict_task.failed());
    assert_eq!(strict_task.latest_error(), Some("deadline exceeded"));
    assert_eq!(strict_task.finish_time, Some(test_epoch()));
}

#[tokio::test]
async fn test_tasks_of_removed_handler_are_cancelled() {
    let orphan = JobDefBuilder::new("orphan", "gone").build();
    let te = TestEngine::new(registry(), [orphan.clone()]);

    let run = JobRunBuilder::new("orphan_1", &orphan)
        .with_state(RunState::Running)
        .started_at(test_epoch())
        .build();
    let tasks = vec![
        JobTaskBuilder::new(&run, 1)
            .with_state(TaskState::Running)
            .started_at(test_epoch())
            .build(),
        JobTaskBuilder::new(&run, 2).build(),
        JobTaskBuilder::new(&run, 3)
            .failed_at(test_epoch(), "boom")
            .build(),
    ];
    te.store.insert_job_runs(vec![run]).await.unwrap();
    te.store.insert_job_tasks(tasks).await.unwrap();

    te.engine.expire_or_retry_dead_tasks().await;

    let tasks = te.tasks_of("orphan_1").await;
    assert_eq!(tasks[0].state, TaskState::Cancelled);
    assert_eq!(tasks[0].latest_error(), Some("cancelled"));
    assert_eq!(tasks[1].state, TaskState::Cancelled);
    assert!(tasks[2].failed());
    assert_eq!(tasks[2].latest_error(), Some("boom"));
}

#[tokio::test]
async fn test_expired_runs_are_deleted_with_their_tasks() {
    let kept_forever = JobDefBuilder::new("forever", "batch").build();
    let short_lived = JobDefBuilder::new("short", "batch")
        .with_delete_after_days(1)
        .build();
    let te = TestEngine::new(registry(), [kept_forever.clone(), short_lived.clone()]);

    let long_ago = test_epoch() - Duration::days(2);
    let runs = vec![
        JobRunBuilder::new("short_old", &short_lived)
            .with_state(RunState::Done)
            .finished_at(long_ago)
            .build(),
        JobRunBuilder::new("short_cancelled", &short_lived)
            .with_state(RunState::Cancelled)
            .finished_at(long_ago)
            .build(),
        JobRunBuilder::new("short_recent", &short_lived)
            .with_state(RunState::Done)
            .finished_at(test_epoch() - Duration::hours(1))
            .build(),
        JobRunBuilder::new("forever_old", &kept_forever)
            .with_state(RunState::Done)
            .finished_at(long_ago)
            .build(),
    ];
    let tasks = vec![
        JobTaskBuilder::new(&runs[0], 1)
            .with_state(TaskState::Done)
            .build(),
        JobTaskBuilder::new(&runs[0], 2)
            .with_state(TaskState::Done)
            .build(),
        JobTaskBuilder::new(&runs[2], 1)
            .with_state(TaskState::Done)
            .build(),
    ];
    te.store.insert_job_runs(runs).await.unwrap();
    te.store.insert_job_tasks(tasks).await.unwrap();

    te.engine.delete_storage_expired_jobs().await;

    assert!(te.run("short_old").await.is_none());
    assert!(te.run("short_cancelled").await.is_none());
    assert!(te.tasks_of("short_old").await.is_empty());
    assert!(te.run("short_recent").await.is_some());
    assert_eq!(te.tasks_of("short_recent").await.len(), 1);
    assert!(te.run("forever_old").await.is_some());
}
