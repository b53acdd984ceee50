//! Property tests for context merge order and overwrite semantics.

use chrono::{TimeZone, Utc};
use magnus_opus::context::{ContextCollector, PendingContext, Priority, RegisterOptions, SEPARATOR};
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct Registration {
    source: u8,
    id: u8,
    content: String,
    priority: Priority,
    secs: i64,
    persistent: bool,
}

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Critical),
        Just(Priority::High),
        Just(Priority::Normal),
        Just(Priority::Low),
    ]
}

fn arb_registration() -> impl Strategy<Value = Registration> {
    (0u8..3, 0u8..4, "[a-z]{1,8}", arb_priority(), 0i64..50, any::<bool>()).prop_map(
        |(source, id, content, priority, secs, persistent)| Registration {
            source,
            id,
            content,
            priority,
            secs,
            persistent,
        },
    )
}

fn run<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(fut)
}

async fn register_all(collector: &ContextCollector, regs: &[Registration]) {
    for r in regs {
        let mut options = RegisterOptions::default()
            .with_priority(r.priority)
            .at(Utc.timestamp_opt(r.secs, 0).unwrap());
        if r.persistent {
            options = options.persistent();
        }
        collector
            .register(
                "ctx",
                &format!("src{}", r.source),
                &format!("id{}", r.id),
                r.content.clone(),
                options,
            )
            .await;
    }
}

/// Last registration per key, in first-seen key order.
fn survivors(regs: &[Registration]) -> Vec<(usize, Registration)> {
    let mut out: Vec<(usize, Registration)> = Vec::new();
    for (i, r) in regs.iter().enumerate() {
        match out
            .iter_mut()
            .find(|(_, s)| s.source == r.source && s.id == r.id)
        {
            Some(slot) => *slot = (i, r.clone()),
            None => out.push((i, r.clone())),
        }
    }
    out
}

fn is_sorted(pending: &PendingContext) -> bool {
    pending
        .entries
        .windows(2)
        .all(|w| (w[0].priority.rank(), w[0].timestamp) <= (w[1].priority.rank(), w[1].timestamp))
}

proptest! {
    #![proptest_config(ProptestConfig {
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_merge_follows_priority_then_time(regs in prop::collection::vec(arb_registration(), 1..20)) {
        let pending = run(async {
            let collector = ContextCollector::new();
            register_all(&collector, &regs).await;
            collector.get_pending("ctx").await
        });

        prop_assert!(is_sorted(&pending));
        let joined = pending
            .entries
            .iter()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join(SEPARATOR);
        prop_assert_eq!(pending.merged, joined);
    }

    #[test]
    fn prop_last_registration_wins(regs in prop::collection::vec(arb_registration(), 1..20)) {
        let pending = run(async {
            let collector = ContextCollector::new();
            register_all(&collector, &regs).await;
            collector.get_pending("ctx").await
        });

        let expected = survivors(&regs);
        prop_assert_eq!(pending.entries.len(), expected.len());
        for (_, r) in expected {
            let entry = pending
                .entries
                .iter()
                .find(|e| e.source == format!("src{}", r.source) && e.id == format!("id{}", r.id));
            prop_assert!(entry.is_some());
            let entry = entry.unwrap();
            prop_assert_eq!(&entry.content, &r.content);
            prop_assert_eq!(entry.priority, r.priority);
            prop_assert_eq!(entry.persistent, r.persistent);
        }
    }

    #[test]
    fn prop_consume_splits_on_persistence(regs in prop::collection::vec(arb_registration(), 0..20)) {
        let (first, second, persistent) = run(async {
            let collector = ContextCollector::new();
            register_all(&collector, &regs).await;
            let first = collector.consume("ctx").await;
            let second = collector.consume("ctx").await;
            let persistent = collector.get_persistent("ctx").await;
            (first, second, persistent)
        });

        let expected = survivors(&regs);
        let transient = expected.iter().filter(|(_, r)| !r.persistent).count();
        prop_assert_eq!(first.entries.len(), transient);
        prop_assert!(first.entries.iter().all(|e| !e.persistent));
        prop_assert!(is_sorted(&first));
        prop_assert!(second.is_empty());
        prop_assert_eq!(persistent.entries.len(), expected.len() - transient);
    }
}

#[tokio::test]
async fn overwritten_entry_takes_new_priority() {
    let collector = ContextCollector::new();
    let at = |secs| Utc.timestamp_opt(secs, 0).unwrap();
    collector
        .register("ctx", "a", "x", "foo", RegisterOptions::default().with_priority(Priority::Low).at(at(1)))
        .await;
    collector
        .register("ctx", "b", "y", "bar", RegisterOptions::default().with_priority(Priority::Critical).at(at(2)))
        .await;
    collector
        .register("ctx", "a", "x", "baz", RegisterOptions::default().at(at(3)))
        .await;

    assert_eq!(
        collector.get_pending("ctx").await.merged,
        format!("bar{SEPARATOR}baz")
    );
}
