use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// Identifiers arrive either as integers or strings depending on the backing table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Text(String),
}

pub type ItemId = EntityId;
pub type VoteId = EntityId;
pub type SubjectId = EntityId;
pub type UserId = EntityId;

impl EntityId {
    /// Numeric text becomes `Int`, anything else is kept verbatim.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<i64>() {
            Ok(n) => EntityId::Int(n),
            Err(_) => EntityId::Text(trimmed.to_string()),
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, EntityId::Text(s) if s.trim().is_empty())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(n) => write!(f, "{}", n),
            EntityId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Int(value)
    }
}

impl From<i32> for EntityId {
    fn from(value: i32) -> Self {
        EntityId::Int(value as i64)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::parse(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId::parse(&value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteTallyItem {
    pub id: ItemId,
    pub vote_id: VoteId,
    pub subject_id: SubjectId,
    pub total: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl VoteTallyItem {
    pub fn new(
        id: impl Into<ItemId>,
        vote_id: impl Into<VoteId>,
        subject_id: impl Into<SubjectId>,
        total: u64,
    ) -> Self {
        Self {
            id: id.into(),
            vote_id: vote_id.into(),
            subject_id: subject_id.into(),
            total,
            updated_at: None,
        }
    }
}

// A single row of the signed-in user's own votes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserVoteRecord {
    pub item_id: ItemId,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TallySnapshot {
    pub items: Vec<VoteTallyItem>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One row-level change from the push feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity_id: ItemId,
    pub new_total: Option<u64>,
}

impl ChangeEvent {
    pub fn updated(entity_id: impl Into<ItemId>, new_total: u64) -> Self {
        Self {
            kind: ChangeKind::Updated,
            entity_id: entity_id.into(),
            new_total: Some(new_total),
        }
    }

    pub fn created(entity_id: impl Into<ItemId>) -> Self {
        Self {
            kind: ChangeKind::Created,
            entity_id: entity_id.into(),
            new_total: None,
        }
    }

    pub fn deleted(entity_id: impl Into<ItemId>) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            entity_id: entity_id.into(),
            new_total: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_text_ids() {
        assert_eq!(EntityId::parse("42"), EntityId::Int(42));
        assert_eq!(EntityId::parse(" abc "), EntityId::Text("abc".to_string()));
        assert!(EntityId::parse("  ").is_blank());
        assert!(!EntityId::Int(0).is_blank());
    }

    #[test]
    fn untagged_serde_accepts_both_forms() {
        let ids: Vec<EntityId> = serde_json::from_str(r#"[7, "seven"]"#).unwrap();
        assert_eq!(ids, vec![EntityId::Int(7), EntityId::Text("seven".into())]);
        assert_eq!(EntityId::Int(7).to_string(), "7");
    }
}
