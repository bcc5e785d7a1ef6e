use std::collections::BTreeMap;

use crate::{Assignment, Error, Result};

/// Offset bookkeeping of one assigned partition. All offsets are inclusive record offsets, the
/// broker-side "next offset to read" is `committed + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionState {
    pub generation: u64,
    /// Last offset durably committed for the group.
    pub committed: Option<i64>,
    /// Last offset handed out by a poll.
    pub consumed: Option<i64>,
    /// Last offset the forwarder resolved (delivered or disposed), committed or not.
    pub handled: Option<i64>,
}

impl PartitionState {
    /// The handled offset if it is ahead of the last commit.
    pub fn pending_commit(&self) -> Option<i64> {
        match (self.handled, self.committed) {
            (Some(handled), Some(committed)) if handled <= committed => None,
            (handled, _) => handled,
        }
    }
}

/// Group membership and offsets of this consumer, keyed by partition.
///
/// Maintains `committed <= consumed` and `handled <= consumed` for every partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupState {
    next_generation: u64,
    partitions: BTreeMap<i32, PartitionState>,
}

impl GroupState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of a partition whose last committed offset is `committed`.
    pub fn assign(&mut self, partition: i32, committed: Option<i64>) -> Assignment {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.partitions.insert(
            partition,
            PartitionState {
                generation,
                committed,
                consumed: committed,
                handled: committed,
            },
        );
        Assignment {
            partition,
            generation,
        }
    }

    pub fn revoke(&mut self, partition: i32) -> Option<PartitionState> {
        self.partitions.remove(&partition)
    }

    pub fn assigned(&self) -> Vec<i32> {
        self.partitions.keys().copied().collect()
    }

    pub fn partition(&self, partition: i32) -> Option<&PartitionState> {
        self.partitions.get(&partition)
    }

    pub fn is_current(&self, assignment: Assignment) -> bool {
        self.partition(assignment.partition)
            .is_some_and(|state| state.generation == assignment.generation)
    }

    fn current_mut(&mut self, assignment: Assignment) -> Result<&mut PartitionState> {
        match self.partitions.get_mut(&assignment.partition) {
            Some(state) if state.generation == assignment.generation => Ok(state),
            _ => Err(Error::NotAssigned(assignment.partition)),
        }
    }

    fn current(&self, assignment: Assignment) -> Result<&PartitionState> {
        match self.partitions.get(&assignment.partition) {
            Some(state) if state.generation == assignment.generation => Ok(state),
            _ => Err(Error::NotAssigned(assignment.partition)),
        }
    }

    /// Notes that records up to `offset` were handed out.
    pub fn record_consumed(&mut self, assignment: Assignment, offset: i64) -> Result<()> {
        let state = self.current_mut(assignment)?;
        state.consumed = state.consumed.max(Some(offset));
        Ok(())
    }

    pub fn record_handled(&mut self, assignment: Assignment, offset: i64) -> Result<()> {
        let state = self.current_mut(assignment)?;
        if state.consumed.is_none_or(|consumed| offset > consumed) {
            return Err(Error::Other(format!(
                "offset {offset} of partition {} was marked handled before it was consumed",
                assignment.partition
            )));
        }
        state.handled = state.handled.max(Some(offset));
        Ok(())
    }

    /// Decides whether committing `offset` needs a broker call. `Ok(None)` means the offset is
    /// already covered by the last commit.
    pub fn plan_commit(&self, assignment: Assignment, offset: i64) -> Result<Option<i64>> {
        let state = self.current(assignment)?;
        if state.committed.is_some_and(|committed| offset <= committed) {
            return Ok(None);
        }
        if state.consumed.is_none_or(|consumed| offset > consumed) {
            return Err(Error::Commit {
                partition: assignment.partition,
                offset,
                error: format!("offset is ahead of the last consumed offset {:?}", state.consumed),
            });
        }
        Ok(Some(offset))
    }

    /// Handled-but-uncommitted offsets of `partitions`, to be committed before they are given up.
    pub fn pending_commits(&self, partitions: &[i32]) -> Vec<(i32, i64)> {
        partitions
            .iter()
            .filter_map(|p| {
                self.partition(*p)
                    .and_then(PartitionState::pending_commit)
                    .map(|offset| (*p, offset))
            })
            .collect()
    }

    pub fn record_committed(&mut self, partition: i32, offset: i64) {
        if let Some(state) = self.partitions.get_mut(&partition) {
            state.committed = state.committed.max(Some(offset));
            state.handled = state.handled.max(Some(offset));
        }
    }
}
