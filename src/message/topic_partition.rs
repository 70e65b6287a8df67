use std::fmt::{Display, Formatter};

use uuid::Uuid;

use crate::{AppError, AppResult};

use super::MemoryRecords;

/// Identity of a partition. Immutable once constructed.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    fn parse_topic_partition(tp_str: &str) -> Option<(String, i32)> {
        let last_hyphen_idx = tp_str.rfind('-')?;
        let (topic, partition_str) = tp_str.split_at(last_hyphen_idx);
        let partition = partition_str[1..].parse::<i32>().ok()?;
        Some((topic.to_string(), partition))
    }

    pub fn from_str(tp_str: &str) -> AppResult<Self> {
        let (topic, partition) = Self::parse_topic_partition(tp_str)
            .ok_or(AppError::InvalidValue("topic partition", tp_str.to_string()))?;
        Ok(Self { topic, partition })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }
}

/// A partition identity carrying the stable topic UUID. The UUID, once
/// assigned, never changes while the topic exists; a mismatch on a control
/// message means the log belongs to a deleted incarnation of the topic.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct TopicIdPartition {
    topic_id: Uuid,
    topic_partition: TopicPartition,
}

impl TopicIdPartition {
    pub fn new(topic_id: Uuid, topic_partition: TopicPartition) -> Self {
        Self {
            topic_id,
            topic_partition,
        }
    }

    pub fn topic_id(&self) -> Uuid {
        self.topic_id
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }
}

impl Display for TopicIdPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic_id, self.topic_partition)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartitionMsgData {
    pub partition: i32,
    pub message_set: MemoryRecords,
}

impl PartitionMsgData {
    pub fn new(partition: i32, message_set: MemoryRecords) -> Self {
        Self {
            partition,
            message_set,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TopicData {
    pub topic_name: String,
    pub partition_data: Vec<PartitionMsgData>,
}

impl TopicData {
    pub fn new(topic_name: String, partition_data: Vec<PartitionMsgData>) -> Self {
        Self {
            topic_name,
            partition_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let tp = TopicPartition::new("orders", 3);
        let parsed = TopicPartition::from_str(&tp.id()).unwrap();
        assert_eq!(parsed, tp);
    }

    #[test]
    fn test_parse_topic_with_hyphen() {
        let parsed = TopicPartition::from_str("click-events-12").unwrap();
        assert_eq!(parsed.topic(), "click-events");
        assert_eq!(parsed.partition(), 12);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TopicPartition::from_str("no_partition_index").is_err());
    }
}
