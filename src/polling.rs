use crate::error::FetchError;
use crate::models::{TallySnapshot, UserId, UserVoteRecord, VoteId, VoteTallyItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Read side of the vote store.
#[async_trait]
pub trait TallySource: Send + Sync {
    async fn fetch_tally_snapshot(&self, vote_id: &VoteId) -> Result<Vec<VoteTallyItem>, FetchError>;

    async fn fetch_user_vote_state(
        &self,
        vote_id: &VoteId,
        user_id: &UserId,
    ) -> Result<Vec<UserVoteRecord>, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPurpose {
    /// Scheduled polling tick (or the immediate fetch on polling entry).
    Poll,
    /// First snapshot when entering realtime with nothing loaded.
    Initial,
    /// Realtime event that could not be applied as a point update.
    Resync,
    /// Explicit caller refresh.
    Refresh,
}

/// The two queries fail independently; one never blocks the other.
#[derive(Debug)]
pub struct FetchOutcome {
    pub tally: Result<TallySnapshot, FetchError>,
    pub personal: Option<Result<Vec<UserVoteRecord>, FetchError>>,
    pub elapsed: Duration,
}

/// A fetch that has been admitted and can run on its own task.
pub struct PendingFetch {
    source: Arc<dyn TallySource>,
    vote_id: VoteId,
    user_id: Option<UserId>,
    timeout: Duration,
}

impl PendingFetch {
    pub async fn run(self) -> FetchOutcome {
        let started = Instant::now();
        let tally = with_timeout(self.timeout, self.source.fetch_tally_snapshot(&self.vote_id));
        let personal = async {
            match &self.user_id {
                Some(user_id) => Some(
                    with_timeout(
                        self.timeout,
                        self.source.fetch_user_vote_state(&self.vote_id, user_id),
                    )
                    .await,
                ),
                None => None,
            }
        };

        let (tally, personal) = tokio::join!(tally, personal);
        FetchOutcome {
            tally: tally.map(|items| TallySnapshot {
                items,
                fetched_at: Utc::now(),
            }),
            personal,
            elapsed: started.elapsed(),
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(limit)),
    }
}

pub struct PollingAcquirer {
    source: Arc<dyn TallySource>,
    vote_id: VoteId,
    user_id: Option<UserId>,
    request_timeout: Duration,
    personal_interval: Duration,
    realtime_active: bool,
    in_flight: bool,
    last_personal_fetch: Option<Instant>,
    last_success: Option<DateTime<Utc>>,
    consecutive_errors: u32,
}

impl PollingAcquirer {
    pub fn new(
        source: Arc<dyn TallySource>,
        vote_id: VoteId,
        user_id: Option<UserId>,
        request_timeout: Duration,
        personal_interval: Duration,
    ) -> Self {
        Self {
            source,
            vote_id,
            user_id,
            request_timeout,
            personal_interval,
            realtime_active: false,
            in_flight: false,
            last_personal_fetch: None,
            last_success: None,
            consecutive_errors: 0,
        }
    }

    pub fn set_realtime_active(&mut self, active: bool) {
        self.realtime_active = active;
    }

    /// Admits a fetch, or returns `None` when one is already in flight or a
    /// poll was requested while realtime owns acquisition.
    pub fn begin(&mut self, purpose: FetchPurpose) -> Option<PendingFetch> {
        if purpose == FetchPurpose::Poll && self.realtime_active {
            debug!("poll for vote {} refused: realtime is active", self.vote_id);
            return None;
        }
        if self.in_flight {
            return None;
        }
        self.in_flight = true;

        let now = Instant::now();
        let personal_due = self.user_id.is_some()
            && self
                .last_personal_fetch
                .is_none_or(|at| now.duration_since(at) >= self.personal_interval);
        let user_id = if personal_due {
            self.last_personal_fetch = Some(now);
            self.user_id.clone()
        } else {
            None
        };

        Some(PendingFetch {
            source: Arc::clone(&self.source),
            vote_id: self.vote_id.clone(),
            user_id,
            timeout: self.request_timeout,
        })
    }

    pub fn complete(&mut self, outcome: &FetchOutcome) {
        self.in_flight = false;
        match &outcome.tally {
            Ok(snapshot) => {
                self.last_success = Some(snapshot.fetched_at);
                self.consecutive_errors = 0;
            }
            Err(_) => self.consecutive_errors += 1,
        }
        if let Some(Err(_)) = &outcome.personal {
            // Retry the personal query on the next admitted fetch
            self.last_personal_fetch = None;
        }
    }

    /// Forget an in-flight fetch whose mode dwell has ended.
    pub fn abandon(&mut self) {
        self.in_flight = false;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}
