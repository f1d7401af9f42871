pub mod ranking;

use crate::models::{SubjectId, VoteTallyItem};
use serde::Serialize;
use std::collections::HashMap;

// A tally row together with its standing in the overall result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedItem {
    pub item: VoteTallyItem,
    pub rank: usize,
    pub display_name: String,
}

pub const UNKNOWN_SUBJECT: &str = "Unknown Subject";

/// Resolves subject display names. Artist/group lookup lives outside this crate.
pub trait SubjectDirectory {
    fn display_name(&self, subject: &SubjectId) -> Option<String>;
}

impl SubjectDirectory for HashMap<SubjectId, String> {
    fn display_name(&self, subject: &SubjectId) -> Option<String> {
        self.get(subject).cloned()
    }
}

/// Directory with no names; every subject renders with the fallback.
pub struct NoDirectory;

impl SubjectDirectory for NoDirectory {
    fn display_name(&self, _subject: &SubjectId) -> Option<String> {
        None
    }
}
