use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// Partition handed to a group member, with the last committed offset if the
/// group has ever committed one for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionAssignment {
    partition: Partition,
    committed_offset: Option<i64>,
}

impl PartitionAssignment {
    pub fn new(partition: Partition, committed_offset: Option<i64>) -> Self {
        Self {
            partition,
            committed_offset,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn committed_offset(&self) -> Option<i64> {
        self.committed_offset
    }

    /// Offset the fetcher should start from: one past the committed record, or
    /// `default_start` for partitions the group has never committed.
    pub fn start_offset(&self, default_start: i64) -> i64 {
        self.committed_offset
            .map(|offset| offset + 1)
            .unwrap_or(default_start)
    }
}
