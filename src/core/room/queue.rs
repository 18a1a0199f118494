use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub track: Track,
    pub vote_score: u32,
    pub uploaded_at: i64,
}

/// Highest score first; among equal scores the earliest upload wins. The track id
/// breaks any remaining tie so equal inputs always produce the same order.
pub fn compare_entries(left: &QueueEntry, right: &QueueEntry) -> Ordering {
    right
        .vote_score
        .cmp(&left.vote_score)
        .then_with(|| left.uploaded_at.cmp(&right.uploaded_at))
        .then_with(|| left.track.id.cmp(&right.track.id))
}

pub fn order_queue(mut entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
    entries.sort_by(compare_entries);
    entries
}

pub fn next_entry<'a>(entries: &'a [QueueEntry], current: Option<&str>) -> Option<&'a QueueEntry> {
    entries
        .iter()
        .filter(|entry| Some(entry.track.id.as_str()) != current)
        .min_by(|left, right| compare_entries(left, right))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, vote_score: u32, uploaded_at: i64) -> QueueEntry {
        QueueEntry {
            track: Track {
                id: id.to_string(),
                title: format!("Track {id}"),
                duration_ms: 180_000,
            },
            vote_score,
            uploaded_at,
        }
    }

    fn ids(entries: &[QueueEntry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.track.id.as_str()).collect()
    }

    #[test]
    fn orders_by_score_then_upload_time() {
        let ordered = order_queue(vec![entry("A", 3, 1), entry("B", 1, 2), entry("C", 2, 3)]);
        assert_eq!(ids(&ordered), vec!["A", "C", "B"]);
    }

    #[test]
    fn equal_scores_fall_back_to_earliest_upload() {
        let ordered = order_queue(vec![entry("late", 2, 50), entry("early", 2, 10)]);
        assert_eq!(ids(&ordered), vec!["early", "late"]);
    }

    #[test]
    fn reordering_is_idempotent() {
        let input = vec![entry("x", 0, 7), entry("y", 4, 7), entry("z", 4, 2)];
        let once = order_queue(input.clone());
        let twice = order_queue(once.clone());
        assert_eq!(once, twice);
        assert_eq!(order_queue(input), once);
    }

    #[test]
    fn next_entry_skips_current_track() {
        let entries = vec![entry("A", 3, 1), entry("B", 1, 2)];
        assert_eq!(next_entry(&entries, Some("A")).map(|e| e.track.id.as_str()), Some("B"));
        assert_eq!(next_entry(&entries, None).map(|e| e.track.id.as_str()), Some("A"));
        assert!(next_entry(&entries[..1], Some("A")).is_none());
    }
}
