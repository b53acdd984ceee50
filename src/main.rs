use std::sync::Arc;
use std::time::Duration;

use magnus_opus::config::SupervisorConfig;
use magnus_opus::context::{ContextCollector, Priority, RegisterOptions};
use magnus_opus::session::InMemorySessionService;
use magnus_opus::worker::{DeliveryKind, LaunchRequest, TaskEvent, TaskSupervisor};

const PARENT_CONTEXT: &str = "ctx_main";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = SupervisorConfig::from_env()?;
    let sessions = Arc::new(InMemorySessionService::new());
    let supervisor = TaskSupervisor::new(config, sessions.clone())?;
    supervisor.spawn_event_listener().await;
    let mut events = supervisor.subscribe();

    let collector = ContextCollector::new();
    collector
        .register(
            PARENT_CONTEXT,
            "rules",
            "style",
            "Prefer small, reviewable changes.",
            RegisterOptions::default().persistent(),
        )
        .await;

    let mut launched = Vec::new();
    for area in ["parser", "storage", "network"] {
        let request = LaunchRequest::new(
            format!("Review {area} module"),
            format!("Review the {area} module and list any defects."),
            "review",
            PARENT_CONTEXT,
        );
        launched.push(supervisor.launch(request).await?);
    }

    // Let the instructions reach their sessions, then stand in for the
    // remote agents finishing their work.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for task in &launched {
        if let Some(session_id) = task.session_id.as_deref() {
            sessions
                .finish(session_id, &format!("{}: no defects found.", task.description))
                .await;
        }
    }

    tokio::time::timeout(Duration::from_secs(30), async {
        while let Ok(event) = events.recv().await {
            if let TaskEvent::Notified {
                kind: DeliveryKind::Batch | DeliveryKind::Immediate,
                ..
            } = event
            {
                break;
            }
        }
    })
    .await?;

    for (i, text) in sessions.posted(PARENT_CONTEXT).await.into_iter().enumerate() {
        collector
            .register(
                PARENT_CONTEXT,
                "background",
                &format!("notice-{i}"),
                text,
                RegisterOptions::default().with_priority(Priority::High),
            )
            .await;
    }

    println!("{}", collector.consume(PARENT_CONTEXT).await.merged);
    println!();
    println!("{}", collector.get_persistent(PARENT_CONTEXT).await.merged);
    println!();
    println!("{}", serde_json::to_string_pretty(&supervisor.summary().await)?);

    supervisor.shutdown().await;
    Ok(())
}
