use live_tally::db::Database;
use live_tally::models::{EntityId, UserId, VoteId};
use live_tally::polling::TallySource;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

const SIMULATED_VOTERS: u64 = 5;

/// Casts a vote on a rotating item every `every`, so the engine has a live
/// feed to follow without any external producer.
pub async fn simulate_votes_task(database: Arc<Database>, vote_id: VoteId, every: Duration) {
    info!("Starting vote simulator for vote {} every {:?}", vote_id, every);
    let mut interval = interval(every);
    let mut round: u64 = 0;

    loop {
        interval.tick().await;
        round += 1;

        let items = match database.fetch_tally_snapshot(&vote_id).await {
            Ok(items) => items,
            Err(e) => {
                error!("Simulator could not read tallies: {}", e);
                continue;
            }
        };
        if items.is_empty() {
            warn!("Vote {} has no items to vote on", vote_id);
            continue;
        }

        // Skewed rotation so the standings actually move
        let pick = (round * round + round / 3) as usize % items.len();
        let EntityId::Int(item_id) = &items[pick].id else {
            continue;
        };
        let voter = UserId::Text(format!("simulated-{}", round % SIMULATED_VOTERS));
        let amount = round % 3 + 1;

        match database.submit_vote(&vote_id, *item_id, &voter, amount).await {
            Ok(total) => debug!("{} voted {} on item {} (now {})", voter, amount, item_id, total),
            Err(e) => error!("Simulated vote failed: {}", e),
        }
    }
}
