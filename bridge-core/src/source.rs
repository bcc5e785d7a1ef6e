use std::time::Duration;

use crate::Result;
use crate::message::{Assignment, Record};

/// Kafka consumer-group member backing the bridge.
pub(crate) mod kafka;

/// In-memory log used by forwarder and supervisor tests.
#[cfg(test)]
pub(crate) mod test_utils;

/// Changes to the set of partitions this process owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GroupEvent {
    Assigned(Vec<Assignment>),
    Revoked(Vec<i32>),
}

/// A partitioned, offset-addressed log consumed as a member of a consumer group.
///
/// Every call carries the [Assignment] it was made under and fails with
/// [crate::Error::Revoked] once that assignment is no longer current.
#[trait_variant::make(LogSource: Send)]
pub(crate) trait LocalLogSource {
    /// Waits up to `max_wait` and returns the next records of the partition in log order,
    /// possibly none.
    async fn poll(&self, assignment: Assignment, max_wait: Duration) -> Result<Vec<Record>>;

    /// Durably records every record up to and including `offset` as handled. Committing an
    /// offset at or behind the last commit is a no-op.
    async fn commit(&self, assignment: Assignment, offset: i64) -> Result<()>;

    /// Notes forwarding progress without committing it, so it can be committed when the
    /// partition is revoked.
    async fn mark_handled(&self, assignment: Assignment, offset: i64) -> Result<()>;

    /// Stops fetching the partition for the rest of the assignment.
    async fn pause(&self, assignment: Assignment) -> Result<()>;
}
