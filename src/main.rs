mod tasks;

use live_tally::config::EngineConfig;
use live_tally::db::Database;
use live_tally::engine::{EngineBuilder, EngineHandle};
use live_tally::models::{EntityId, SubjectId};
use live_tally::signals::{NeutralProbe, SystemSignalMonitor};
use live_tally::transport::local::LocalChangeFeed;
use log::{error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

const DEMO_SUBJECTS: &[(&str, &str)] = &[
    ("aurora", "Aurora"),
    ("nova", "Nova"),
    ("lumen", "Lumen"),
    ("echo", "Echo"),
];

fn log_standings(engine: &EngineHandle, names: &HashMap<SubjectId, String>) {
    let snapshot = engine.snapshot();
    let standings: Vec<_> = engine
        .ranked(None, names)
        .iter()
        .map(|r| {
            json!({
                "rank": r.rank,
                "name": r.display_name,
                "total": r.item.total,
                "highlighted": engine.is_highlighted(&r.item.id),
            })
        })
        .collect();

    let dump = json!({
        "vote": snapshot.vote_id,
        "mode": snapshot.state.mode,
        "connected": snapshot.state.is_connected,
        "quality": snapshot.quality.score,
        "standings": standings,
        "my_votes": snapshot.user_votes.len(),
    });
    info!("{}", dump);
}

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };
    let vote_id = EntityId::parse(&env::var("VOTE_ID").unwrap_or_else(|_| "1".to_string()));
    let user_id = env::var("USER_ID").ok().map(|raw| EntityId::parse(&raw));
    let db_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:live_tally.db".to_string());

    // Initialize database, publishing accepted votes into the local feed
    let feed = LocalChangeFeed::default();
    let database = match Database::new(&db_url).await {
        Ok(db) => Arc::new(db.with_change_feed(feed.clone())),
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };
    if let Err(e) = database.seed_if_empty(&vote_id, DEMO_SUBJECTS).await {
        error!("Failed to seed vote {}: {}", vote_id, e);
        return;
    }
    let names = match database.subject_names(&vote_id).await {
        Ok(names) => names,
        Err(e) => {
            warn!("Subject names unavailable, using fallbacks: {}", e);
            HashMap::new()
        }
    };

    let monitor = SystemSignalMonitor::spawn(Arc::new(NeutralProbe), config.signal_debounce);
    let engine = EngineBuilder::new(vote_id.clone(), database.clone(), Arc::new(feed))
        .user(user_id)
        .config(config)
        .signals(monitor.subscribe())
        .spawn();
    info!("Following vote {} (engine {})", vote_id, engine.id());

    // --- Optional background voter ---
    let simulate_every = env::var("SIMULATE_VOTES")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|ms| *ms > 0);
    if let Some(ms) = simulate_every {
        let db_clone = Arc::clone(&database);
        let vote_clone = vote_id.clone();
        tokio::spawn(async move {
            tasks::vote_simulator::simulate_votes_task(db_clone, vote_clone, Duration::from_millis(ms)).await;
        });
    }

    let mut updates = engine.subscribe();
    let mut last_version = None;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    warn!("Engine stopped publishing");
                    break;
                }
                let version = updates.borrow_and_update().data_version;
                if last_version != Some(version) {
                    last_version = Some(version);
                    log_standings(&engine, &names);
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    let leftover = engine.shutdown().await;
    monitor.shutdown();
    match serde_json::to_string(&leftover) {
        Ok(counts) => info!("Resources after shutdown: {}", counts),
        Err(e) => error!("Could not report resources: {}", e),
    }
}
