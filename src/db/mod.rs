use crate::error::FetchError;
use crate::models::{ChangeEvent, EntityId, SubjectId, UserId, UserVoteRecord, VoteId, VoteTallyItem};
use crate::polling::TallySource;
use crate::transport::{local::LocalChangeFeed, topic_for};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow},
    Row, Sqlite,
};
use std::collections::HashMap;

type DbResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub struct Database {
    pool: SqlitePool,
    feed: Option<LocalChangeFeed>,
}

impl Database {
    pub async fn new(db_url: &str) -> DbResult<Self> {
        // Create database if it doesn't exist
        if !db_url.contains(":memory:") && !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            info!("Creating database at {}", db_url);
            Sqlite::create_database(db_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;
        Self::init_schema(&pool).await?;

        Ok(Self { pool, feed: None })
    }

    /// Private in-memory database. A single connection that never expires,
    /// since every new sqlite memory connection starts empty.
    pub async fn in_memory() -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::init_schema(&pool).await?;

        Ok(Self { pool, feed: None })
    }

    /// Publish every accepted vote to `feed` as a row change.
    pub fn with_change_feed(mut self, feed: LocalChangeFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    async fn init_schema(pool: &SqlitePool) -> DbResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subjects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vote_tallies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vote_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                total INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT,
                UNIQUE (vote_id, subject_id)
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_votes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                vote_id TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (item_id) REFERENCES vote_tallies(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Creates a zeroed tally row per subject unless the vote already has
    /// rows. Returns whether anything was inserted.
    pub async fn seed_if_empty(&self, vote_id: &VoteId, subjects: &[(&str, &str)]) -> DbResult<bool> {
        let existing: i64 = sqlx::query("SELECT COUNT(*) AS n FROM vote_tallies WHERE vote_id = ?")
            .bind(vote_id.to_string())
            .fetch_one(&self.pool)
            .await?
            .get("n");
        if existing > 0 {
            debug!("vote {} already has {} tally rows", vote_id, existing);
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;
        for (subject_id, name) in subjects {
            sqlx::query("INSERT OR REPLACE INTO subjects (id, name) VALUES (?, ?)")
                .bind(*subject_id)
                .bind(*name)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO vote_tallies (vote_id, subject_id, total, updated_at)
                VALUES (?, ?, 0, ?)
                "#,
            )
            .bind(vote_id.to_string())
            .bind(*subject_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!("Seeded vote {} with {} subjects", vote_id, subjects.len());
        Ok(true)
    }

    /// Display names for every subject that has a tally row in this vote.
    pub async fn subject_names(&self, vote_id: &VoteId) -> DbResult<HashMap<SubjectId, String>> {
        let names = sqlx::query(
            r#"
            SELECT s.id, s.name
            FROM subjects s
            JOIN vote_tallies t ON t.subject_id = s.id
            WHERE t.vote_id = ?
            "#,
        )
        .bind(vote_id.to_string())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| {
            (
                EntityId::parse(&row.get::<String, _>("id")),
                row.get::<String, _>("name"),
            )
        })
        .collect();
        Ok(names)
    }

    /// Records a vote, bumps the item's total and publishes the new total.
    pub async fn submit_vote(&self, vote_id: &VoteId, item_id: i64, user_id: &UserId, amount: u64) -> DbResult<u64> {
        let amount = i64::try_from(amount)?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE vote_tallies
            SET total = total + ?, updated_at = ?
            WHERE id = ? AND vote_id = ?
            "#,
        )
        .bind(amount)
        .bind(now.to_rfc3339())
        .bind(item_id)
        .bind(vote_id.to_string())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(format!("Unknown tally item {} in vote {}", item_id, vote_id).into());
        }

        sqlx::query(
            r#"
            INSERT INTO user_votes (user_id, vote_id, item_id, amount, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id.to_string())
        .bind(vote_id.to_string())
        .bind(item_id)
        .bind(amount)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let total: i64 = sqlx::query("SELECT total FROM vote_tallies WHERE id = ?")
            .bind(item_id)
            .fetch_one(&mut *tx)
            .await?
            .get("total");
        tx.commit().await?;

        let total = total.max(0) as u64;
        if let Some(feed) = &self.feed {
            feed.publish(&topic_for(vote_id), ChangeEvent::updated(item_id, total));
        }
        Ok(total)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, FetchError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FetchError::Malformed(format!("bad timestamp {:?}: {}", raw, e)))
}

fn tally_from_row(vote_id: &VoteId, row: &SqliteRow) -> Result<VoteTallyItem, FetchError> {
    let total: i64 = row.try_get("total")?;
    let updated_at: Option<String> = row.try_get("updated_at")?;
    Ok(VoteTallyItem {
        id: EntityId::Int(row.try_get("id")?),
        vote_id: vote_id.clone(),
        subject_id: EntityId::parse(&row.try_get::<String, _>("subject_id")?),
        total: u64::try_from(total).map_err(|_| FetchError::Malformed(format!("negative total {}", total)))?,
        updated_at: updated_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[async_trait]
impl TallySource for Database {
    async fn fetch_tally_snapshot(&self, vote_id: &VoteId) -> Result<Vec<VoteTallyItem>, FetchError> {
        sqlx::query(
            r#"
            SELECT id, subject_id, total, updated_at
            FROM vote_tallies
            WHERE vote_id = ?
            ORDER BY total DESC, id
            "#,
        )
        .bind(vote_id.to_string())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| tally_from_row(vote_id, row))
        .collect()
    }

    async fn fetch_user_vote_state(
        &self,
        vote_id: &VoteId,
        user_id: &UserId,
    ) -> Result<Vec<UserVoteRecord>, FetchError> {
        sqlx::query(
            r#"
            SELECT item_id, amount, created_at
            FROM user_votes
            WHERE vote_id = ? AND user_id = ?
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(vote_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            let amount: i64 = row.try_get("amount")?;
            Ok(UserVoteRecord {
                item_id: EntityId::Int(row.try_get("item_id")?),
                amount: amount.max(0) as u64,
                created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            })
        })
        .collect()
    }
}
