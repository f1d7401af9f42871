use crate::models::VoteTallyItem;
use crate::voting::{RankedItem, SubjectDirectory, UNKNOWN_SUBJECT};

pub fn project(
    items: &[VoteTallyItem],
    search: Option<&str>,
    names: &dyn SubjectDirectory,
) -> Vec<RankedItem> {
    // Sort by total, highest first; sort_by is stable so ties keep input order
    let mut sorted: Vec<&VoteTallyItem> = items.iter().collect();
    sorted.sort_by(|a, b| b.total.cmp(&a.total));

    // Competition ranking: ties share a rank, the next distinct total skips ahead
    let mut ranked: Vec<RankedItem> = Vec::with_capacity(sorted.len());
    for (i, item) in sorted.into_iter().enumerate() {
        let rank = match ranked.last() {
            Some(prev) if prev.item.total == item.total => prev.rank,
            _ => i + 1,
        };
        let display_name = names
            .display_name(&item.subject_id)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_SUBJECT.to_string());
        ranked.push(RankedItem {
            item: item.clone(),
            rank,
            display_name,
        });
    }

    // Filter after ranking so ranks reflect the overall standing
    match search.map(str::trim).filter(|q| !q.is_empty()) {
        Some(query) => {
            let needle = query.to_lowercase();
            ranked
                .into_iter()
                .filter(|r| r.display_name.to_lowercase().contains(&needle))
                .collect()
        }
        None => ranked,
    }
}
