use crate::types::{OffsetMap, TopicPartition};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// When a resolved offset becomes eligible for commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitStrategy {
    /// Commit only once every earlier offset of the partition is resolved.
    #[default]
    Throttled,
    /// Commit the highest resolved offset, skipping unresolved ones.
    Latest,
}

#[derive(Debug, Default)]
struct PartitionState {
    /// Received offsets in delivery order and whether each is resolved.
    received: VecDeque<(i64, bool)>,
    /// Position the strategy allows committing.
    eligible: Option<i64>,
    /// Position the committer accepted.
    committed: Option<i64>,
}

impl PartitionState {
    fn uncommitted(&self) -> Option<i64> {
        let eligible = self.eligible?;
        match self.committed {
            Some(committed) if committed >= eligible => None,
            _ => Some(eligible),
        }
    }
}

/// Per-partition bookkeeping deciding the next offset to commit.
///
/// Positions are Kafka commit positions: one past the last processed
/// offset.
#[derive(Debug)]
pub struct CommitTracker {
    strategy: CommitStrategy,
    partitions: HashMap<TopicPartition, PartitionState>,
}

impl CommitTracker {
    pub fn new(strategy: CommitStrategy) -> Self {
        Self {
            strategy,
            partitions: HashMap::new(),
        }
    }

    pub fn strategy(&self) -> CommitStrategy {
        self.strategy
    }

    /// Records a message handed to the application.
    pub fn received(&mut self, partition: &TopicPartition, offset: i64) {
        self.partitions
            .entry(partition.clone())
            .or_default()
            .received
            .push_back((offset, false));
    }

    /// Marks `offset` as resolved. Returns the position to commit for the
    /// partition, if it is ahead of the last accepted commit. Nothing is
    /// recorded as committed until [`committed_to`](Self::committed_to).
    pub fn resolved(&mut self, partition: &TopicPartition, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(partition)?;
        let index = state.received.iter().position(|(o, _)| *o == offset)?;

        let candidate = match self.strategy {
            CommitStrategy::Throttled => {
                state.received[index].1 = true;
                let mut last = None;
                while let Some((o, true)) = state.received.front().copied() {
                    last = Some(o);
                    state.received.pop_front();
                }
                last
            }
            CommitStrategy::Latest => {
                state.received.remove(index);
                Some(offset)
            }
        };

        if let Some(candidate) = candidate {
            let position = candidate + 1;
            if state.eligible.map_or(true, |e| position > e) {
                trace!(partition = %partition, position, "Commit position advanced");
                state.eligible = Some(position);
            }
        }
        state.uncommitted()
    }

    /// Records that `position` reached the broker.
    pub fn committed_to(&mut self, partition: &TopicPartition, position: i64) {
        if let Some(state) = self.partitions.get_mut(partition) {
            if state.committed.map_or(true, |c| position > c) {
                state.committed = Some(position);
            }
        }
    }

    /// Eligible positions not yet accepted by the committer.
    pub fn uncommitted(&self) -> OffsetMap {
        self.partitions
            .iter()
            .filter_map(|(tp, state)| state.uncommitted().map(|position| (tp.clone(), position)))
            .collect()
    }

    /// Received offsets not yet resolved.
    pub fn pending(&self, partition: &TopicPartition) -> usize {
        self.partitions
            .get(partition)
            .map(|s| s.received.iter().filter(|(_, resolved)| !resolved).count())
            .unwrap_or(0)
    }

    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.partitions.get(partition).and_then(|s| s.committed)
    }
}
