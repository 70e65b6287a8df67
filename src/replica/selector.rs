use std::fmt::Debug;

use crate::message::TopicPartition;
use crate::request::ClientMetadata;

/// One in-sync replica as a read-replica candidate.
#[derive(Debug, Clone)]
pub struct ReplicaView {
    pub broker_id: i32,
    pub log_start_offset: i64,
    pub log_end_offset: i64,
}

/// Pluggable policy for redirecting consumer fetches to a close in-sync
/// follower. Candidates are pre-filtered to ISR members whose offset range
/// covers the fetch offset; follower fetches are never redirected.
pub trait ReplicaSelector: Send + Sync + Debug {
    fn select(
        &self,
        topic_partition: &TopicPartition,
        client_metadata: &ClientMetadata,
        candidates: &[ReplicaView],
    ) -> Option<i32>;
}

/// Picks the most caught-up candidate; equal log ends resolve to the lowest
/// broker id so the choice is deterministic.
#[derive(Debug, Default)]
pub struct DefaultReplicaSelector;

impl ReplicaSelector for DefaultReplicaSelector {
    fn select(
        &self,
        _topic_partition: &TopicPartition,
        _client_metadata: &ClientMetadata,
        candidates: &[ReplicaView],
    ) -> Option<i32> {
        candidates
            .iter()
            .max_by(|a, b| {
                a.log_end_offset
                    .cmp(&b.log_end_offset)
                    .then(b.broker_id.cmp(&a.broker_id))
            })
            .map(|view| view.broker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: i32, leo: i64) -> ReplicaView {
        ReplicaView {
            broker_id: id,
            log_start_offset: 0,
            log_end_offset: leo,
        }
    }

    #[test]
    fn test_highest_leo_wins() {
        let selector = DefaultReplicaSelector;
        let client = ClientMetadata {
            rack_id: "east-1".into(),
            client_id: "consumer".into(),
        };
        let tp = TopicPartition::new("t", 0);
        let picked = selector.select(&tp, &client, &[view(2, 10), view(3, 15)]);
        assert_eq!(picked, Some(3));
    }

    #[test]
    fn test_tie_breaks_to_lowest_id() {
        let selector = DefaultReplicaSelector;
        let client = ClientMetadata {
            rack_id: "east-1".into(),
            client_id: "consumer".into(),
        };
        let tp = TopicPartition::new("t", 0);
        let picked = selector.select(&tp, &client, &[view(5, 10), view(2, 10)]);
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn test_no_candidates() {
        let selector = DefaultReplicaSelector;
        let client = ClientMetadata {
            rack_id: "east-1".into(),
            client_id: "consumer".into(),
        };
        let tp = TopicPartition::new("t", 0);
        assert_eq!(selector.select(&tp, &client, &[]), None);
    }
}
