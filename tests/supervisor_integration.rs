//! End-to-end supervisor scenarios against the in-memory session service.

use std::sync::Arc;
use std::time::Duration;

use magnus_opus::config::{CategoryConfig, SupervisorConfig};
use magnus_opus::session::{InMemorySessionService, MessageRole};
use magnus_opus::worker::{
    BackgroundTask, CompletionSignal, DeliveryKind, LaunchRequest, TaskEvent, TaskStatus,
    TaskSupervisor,
};

fn setup(limit: usize) -> (TaskSupervisor, Arc<InMemorySessionService>) {
    let config = SupervisorConfig::default().with_category(
        "build",
        CategoryConfig {
            agent: Some("builder".into()),
            concurrency: Some(limit),
        },
    );
    let service = Arc::new(InMemorySessionService::new());
    let supervisor = TaskSupervisor::new(config, service.clone()).unwrap();
    (supervisor, service)
}

fn build(description: &str) -> LaunchRequest {
    LaunchRequest::new(description, format!("run {description}"), "build", "ctx_root")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn finish(service: &InMemorySessionService, task: &BackgroundTask, reply: &str) {
    service
        .finish(task.session_id.as_deref().unwrap(), reply)
        .await;
}

#[tokio::test(start_paused = true)]
async fn siblings_are_announced_once_in_a_batch() {
    let (supervisor, service) = setup(5);
    let a = supervisor.launch(build("lint")).await.unwrap();
    let b = supervisor.launch(build("unit")).await.unwrap();
    let c = supervisor.launch(build("docs")).await.unwrap();
    settle().await;

    finish(&service, &a, "lint clean").await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    finish(&service, &b, "tests pass").await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(service.posted("ctx_root").await.is_empty());

    finish(&service, &c, "docs built").await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let posted = service.posted("ctx_root").await;
    assert_eq!(posted.len(), 1);
    assert!(posted[0].starts_with("[ALL BACKGROUND TASKS FINISHED] 3 tasks"));
    for name in ["\"lint\"", "\"unit\"", "\"docs\""] {
        assert!(posted[0].contains(name), "{name} missing from {}", posted[0]);
    }
}

#[tokio::test(start_paused = true)]
async fn slots_are_granted_in_launch_order() {
    let (supervisor, service) = setup(2);
    let a = supervisor.launch(build("a")).await.unwrap();
    let _b = supervisor.launch(build("b")).await.unwrap();

    let c = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.launch(build("c")).await }
    });
    settle().await;
    let d = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.launch(build("d")).await }
    });
    settle().await;

    assert_eq!(supervisor.slots().in_use("build"), 2);
    assert!(!c.is_finished());
    assert!(!d.is_finished());

    finish(&service, &a, "done").await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(c.is_finished());
    assert!(!d.is_finished());
    let c = c.await.unwrap().unwrap();
    assert_eq!(c.agent, "builder");
    assert_eq!(supervisor.slots().in_use("build"), 2);

    supervisor.cancel(c.id, None).await.unwrap();
    settle().await;
    assert!(d.is_finished());
    d.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn threshold_reports_progress_then_batch() {
    let (supervisor, service) = setup(5);
    let mut tasks = Vec::new();
    for name in ["one", "two", "three", "four"] {
        tasks.push(
            supervisor
                .launch(build(name).with_notification_threshold(2))
                .await
                .unwrap(),
        );
    }
    settle().await;

    finish(&service, &tasks[0], "ok").await;
    finish(&service, &tasks[1], "ok").await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let posted = service.posted("ctx_root").await;
    assert_eq!(posted.len(), 1);
    assert!(posted[0].starts_with("[BACKGROUND TASKS PROGRESS] 2 of 4"));

    finish(&service, &tasks[2], "ok").await;
    finish(&service, &tasks[3], "ok").await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let posted = service.posted("ctx_root").await;
    assert_eq!(posted.len(), 2);
    assert!(posted[1].starts_with("[ALL BACKGROUND TASKS FINISHED] 4 tasks"));
}

#[tokio::test(start_paused = true)]
async fn pushed_idle_event_completes_busy_session() {
    let (supervisor, service) = setup(5);
    supervisor.spawn_event_listener().await;
    let mut events = supervisor.subscribe();

    let task = supervisor
        .launch(build("solo").notify_on_completion())
        .await
        .unwrap();
    let session_id = task.session_id.clone().unwrap();
    settle().await;
    service
        .push_message(&session_id, MessageRole::Assistant, "built")
        .await;

    service.emit_idle(&session_id);
    settle().await;
    assert!(supervisor.get_task(task.id).await.unwrap().status.is_running());

    tokio::time::sleep(Duration::from_secs(5)).await;
    service.emit_idle(&session_id);
    settle().await;

    let done = supervisor.get_task(task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result.as_deref(), Some("built"));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(
        e,
        TaskEvent::Completed {
            signal: CompletionSignal::Event,
            ..
        }
    )));
    assert!(seen.iter().any(|e| matches!(
        e,
        TaskEvent::Notified {
            kind: DeliveryKind::Immediate,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn stale_task_frees_its_slot_for_the_queue() {
    let (supervisor, _service) = setup(1);
    let stuck = supervisor.launch(build("stuck")).await.unwrap();

    let next = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.launch(build("next")).await }
    });
    settle().await;
    assert!(!next.is_finished());

    tokio::time::sleep(Duration::from_secs(185)).await;
    let stuck = supervisor.get_task(stuck.id).await.unwrap();
    assert_eq!(stuck.status, TaskStatus::Error);
    assert!(next.is_finished());
    next.await.unwrap().unwrap();
}
