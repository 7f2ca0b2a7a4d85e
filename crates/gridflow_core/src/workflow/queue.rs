//! Priority ordering of pending chains.
//!
//! # Invariants
//! - Higher priority runs first; equal priorities run in submission order.
//! - Only `general` and `initialized` chains are pending.

use crate::model::identity::EntityId;
use crate::model::status::Status;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Queue priority; larger is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i64);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);
    /// Explicit user requests jump ahead of site-wide background work.
    pub const REQUESTED: Priority = Priority(5);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The queue-relevant slice of a stored chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSummary {
    pub id: EntityId,
    pub priority: Priority,
    pub status: Status,
    pub submitted_at: i64,
}

impl ChainSummary {
    /// Whether `self` runs before `other`.
    pub fn is_ahead_of(&self, other: &ChainSummary) -> bool {
        self.id != other.id
            && self.status.is_pending()
            && (self.priority > other.priority
                || (self.priority == other.priority && self.submitted_at < other.submitted_at))
    }
}

/// Number of pending chains that run before `target`.
pub fn count_ahead(chains: &[ChainSummary], target: &ChainSummary) -> usize {
    chains.iter().filter(|chain| chain.is_ahead_of(target)).count()
}

#[cfg(test)]
mod tests {
    use super::{count_ahead, ChainSummary, Priority};
    use crate::model::status::Status;
    use uuid::Uuid;

    fn summary(priority: i64, submitted_at: i64, status: Status) -> ChainSummary {
        ChainSummary {
            id: Uuid::new_v4(),
            priority: Priority(priority),
            status,
            submitted_at,
        }
    }

    #[test]
    fn higher_priority_and_earlier_equal_priority_are_ahead() {
        let chains = [
            summary(5, 1, Status::General),
            summary(1, 2, Status::General),
            summary(1, 3, Status::Initialized),
            summary(3, 4, Status::General),
        ];
        assert_eq!(count_ahead(&chains, &chains[1]), 2);
        assert_eq!(count_ahead(&chains, &chains[0]), 0);
        assert_eq!(count_ahead(&chains, &chains[2]), 3);
    }

    #[test]
    fn finished_and_failed_chains_are_not_ahead() {
        let chains = [
            summary(5, 1, Status::Complete),
            summary(5, 1, Status::FatalError),
            summary(1, 2, Status::General),
        ];
        assert_eq!(count_ahead(&chains, &chains[2]), 0);
    }

    #[test]
    fn requested_outranks_site_priorities() {
        assert!(Priority::REQUESTED > Priority::HIGH);
        assert!(Priority::HIGH > Priority::NORMAL);
        assert!(Priority::NORMAL > Priority::LOW);
    }
}
