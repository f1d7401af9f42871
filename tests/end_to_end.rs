mod common;

use common::*;
use live_tally::config::EngineConfig;
use live_tally::db::Database;
use live_tally::engine::{AcquisitionMode, EngineBuilder, EngineSnapshot, ResourceCounts};
use live_tally::models::{ChangeEvent, EntityId, SubjectId, UserId, VoteId};
use live_tally::transport::local::LocalChangeFeed;
use live_tally::voting::NoDirectory;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test(start_paused = true)]
async fn point_update_reorders_and_highlights() {
    let h = Harness::start(EngineConfig::default(), default_items(), true);
    settle().await;

    h.transport.emit_event(ChangeEvent::updated(2, 8));
    settle().await;

    let ranked: Vec<_> = h
        .engine
        .ranked(None, &NoDirectory)
        .into_iter()
        .map(|r| (r.item.id, r.rank, r.item.total))
        .collect();
    assert_eq!(
        ranked,
        vec![(EntityId::Int(2), 1, 8), (EntityId::Int(1), 2, 5)]
    );
    assert!(h.engine.is_highlighted(&EntityId::Int(2)));
    assert!(!h.engine.is_highlighted(&EntityId::Int(1)));

    advance(2_900).await;
    assert!(h.engine.is_highlighted(&EntityId::Int(2)));
    advance(200).await;
    assert!(!h.engine.is_highlighted(&EntityId::Int(2)));
    assert_eq!(h.engine.highlights().pending_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_updates_extend_a_single_highlight() {
    let h = Harness::start(EngineConfig::default(), default_items(), true);
    settle().await;

    h.transport.emit_event(ChangeEvent::updated(1, 6));
    settle().await;
    advance(2_000).await;
    h.transport.emit_event(ChangeEvent::updated(1, 7));
    settle().await;
    assert_eq!(h.engine.highlights().pending_timers(), 1);

    // The first timer would have fired here
    advance(1_500).await;
    assert!(h.engine.is_highlighted(&EntityId::Int(1)));
    advance(1_600).await;
    assert!(!h.engine.is_highlighted(&EntityId::Int(1)));
}

#[tokio::test(start_paused = true)]
async fn polled_changes_highlight_only_what_moved() {
    let config = EngineConfig {
        enable_realtime: false,
        ..EngineConfig::default()
    };
    let h = Harness::start(config, default_items(), true);
    settle().await;
    // First load never highlights
    assert!(h.engine.highlights().highlighted().is_empty());

    h.source.set_items(vec![item(1, 5), item(2, 9)]);
    advance(1_000).await;
    assert_eq!(h.engine.highlights().highlighted(), vec![EntityId::Int(2)]);

    let names: HashMap<SubjectId, String> = HashMap::from([
        (EntityId::from("subject-1"), "Aurora".to_string()),
        (EntityId::from("subject-2"), "Nova".to_string()),
    ]);
    let ranked = h.engine.ranked(Some("NOV"), &names);
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].display_name, "Nova");
    assert_eq!(ranked[0].rank, 1);
}

async fn wait_for(rx: &mut watch::Receiver<EngineSnapshot>, what: &str, pred: impl Fn(&EngineSnapshot) -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pred(&*rx.borrow_and_update()) {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("engine stopped while waiting for {}", what);
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn sqlite_votes_flow_through_the_local_feed() {
    let feed = LocalChangeFeed::default();
    let database = Arc::new(Database::in_memory().await.unwrap().with_change_feed(feed.clone()));
    let vote_id = VoteId::Int(42);
    database
        .seed_if_empty(&vote_id, &[("aurora", "Aurora"), ("nova", "Nova")])
        .await
        .unwrap();
    let names: HashMap<SubjectId, String> = database.subject_names(&vote_id).await.unwrap();

    let voter = UserId::from("fan-9");
    let engine = EngineBuilder::new(vote_id.clone(), database.clone(), Arc::new(feed.clone()))
        .user(Some(voter.clone()))
        .spawn();
    let mut updates = engine.subscribe();
    wait_for(&mut updates, "realtime connection and first snapshot", |s| {
        s.state.mode == AcquisitionMode::Realtime && s.state.is_connected && s.items.len() == 2
    })
    .await;
    assert_eq!(feed.active_subscriptions(), 1);

    let nova = engine
        .snapshot()
        .items
        .iter()
        .find(|i| i.subject_id == EntityId::from("nova"))
        .map(|i| i.id.clone())
        .unwrap();
    let EntityId::Int(nova_id) = nova else { panic!("integer ids expected") };
    assert_eq!(database.submit_vote(&vote_id, nova_id, &voter, 3).await.unwrap(), 3);

    wait_for(&mut updates, "the pushed total", |s| {
        s.items.iter().any(|i| i.id == EntityId::Int(nova_id) && i.total == 3)
    })
    .await;
    let ranked = engine.ranked(None, &names);
    assert_eq!(ranked[0].display_name, "Nova");
    assert_eq!(ranked[0].rank, 1);
    assert!(engine.is_highlighted(&EntityId::Int(nova_id)));

    let leftover = engine.shutdown().await;
    assert_eq!(leftover, ResourceCounts::default());
    assert_eq!(feed.active_subscriptions(), 0);
}
