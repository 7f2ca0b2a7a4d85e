//! Status lifecycle for computed entities.
//!
//! # Responsibility
//! - Define the persisted states and the legal moves between them.
//! - Decide what reconciliation does to a stored status.
//! - Classify engine error codes as recoverable or fatal.
//!
//! # Invariants
//! - `Complete` and `FatalError` are never rewritten by reconciliation.
//! - `Initialized` and `RecoverableError` roll back to `General` on reconcile.
//! - `finished()` is true only for `Complete`.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Persisted, needs work.
    General,
    /// Declared inside a written chain.
    Initialized,
    Complete,
    RecoverableError,
    FatalError,
}

impl Status {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Initialized => "initialized",
            Self::Complete => "complete",
            Self::RecoverableError => "recoverable_error",
            Self::FatalError => "fatal_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "general" => Some(Self::General),
            "initialized" => Some(Self::Initialized),
            "complete" => Some(Self::Complete),
            "recoverable_error" => Some(Self::RecoverableError),
            "fatal_error" => Some(Self::FatalError),
            _ => None,
        }
    }

    /// Whether no further chaining is needed.
    pub fn finished(self) -> bool {
        self == Self::Complete
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::RecoverableError | Self::FatalError)
    }

    /// Pending means queued or waiting to be queued.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::General | Self::Initialized)
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        match (self, next) {
            (Self::General, Self::Initialized | Self::Complete) => true,
            (Self::Initialized, Self::Complete) => true,
            (Self::General | Self::Initialized, Self::RecoverableError | Self::FatalError) => true,
            _ => false,
        }
    }

    /// Returns `next` when the move is legal.
    pub fn transition(self, next: Status) -> Result<Status, StatusTransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StatusTransitionError {
                from: self,
                to: next,
            })
        }
    }

    /// Status a stored entity carries after being reconciled again.
    pub fn after_reconcile(self) -> Status {
        match self {
            Self::Initialized | Self::RecoverableError => Self::General,
            other => other,
        }
    }

    /// Stored status merged with the status a reconcile candidate brings.
    ///
    /// A stored `general` row takes any legal forward move. A rolled-back row
    /// only takes `complete`; anything else leaves it at `general`.
    pub fn merge_on_reconcile(stored: Status, incoming: Status) -> Status {
        match (stored, incoming) {
            (Self::General, _) if stored.can_transition_to(incoming) => incoming,
            (Self::Initialized | Self::RecoverableError, Self::Complete) => Self::Complete,
            _ => stored.after_reconcile(),
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransitionError {
    pub from: Status,
    pub to: Status,
}

impl Display for StatusTransitionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal status transition {} -> {}", self.from, self.to)
    }
}

impl Error for StatusTransitionError {}

/// Error codes reported by the workflow engine and its steps.
pub mod codes {
    pub const GENERAL_ERROR: i64 = 1000;
    pub const UNKNOWN_ERROR: i64 = 1001;
    pub const DEPENDENCY_ERROR: i64 = 1002;
    pub const REMOTE_KILL: i64 = 1150;
    pub const DB_CREATE_ERROR: i64 = 1201;
    pub const DB_DELETE_ERROR: i64 = 1202;
    pub const DB_INSERT_ERROR: i64 = 1203;
    pub const DB_READ_ERROR: i64 = 1204;
    pub const DB_UPDATE_ERROR: i64 = 1205;
    pub const IO_READ_ERROR: i64 = 1301;
    pub const IO_WRITE_ERROR: i64 = 1302;
    pub const IO_WAIT_ERROR: i64 = 1303;
    pub const IO_PERMISSION_ERROR: i64 = 1304;
    pub const DATA_ERROR: i64 = 2300;
    pub const POINT_DATA_ERROR: i64 = 2301;
    pub const LAYER_DATA_ERROR: i64 = 2302;
}

/// Error status for an engine failure code. Unlisted codes are fatal.
pub fn failure_status(code: i64) -> Status {
    match code {
        codes::DEPENDENCY_ERROR
        | codes::REMOTE_KILL
        | codes::DB_CREATE_ERROR..=codes::DB_UPDATE_ERROR
        | codes::IO_READ_ERROR..=codes::IO_WAIT_ERROR => Status::RecoverableError,
        _ => Status::FatalError,
    }
}

#[cfg(test)]
mod tests {
    use super::{codes, failure_status, Status};

    #[test]
    fn reconcile_rolls_back_only_retryable_states() {
        assert_eq!(Status::Initialized.after_reconcile(), Status::General);
        assert_eq!(Status::RecoverableError.after_reconcile(), Status::General);
        assert_eq!(Status::Complete.after_reconcile(), Status::Complete);
        assert_eq!(Status::FatalError.after_reconcile(), Status::FatalError);
        assert_eq!(Status::General.after_reconcile(), Status::General);
    }

    #[test]
    fn merge_rolls_back_before_accepting_candidates() {
        assert_eq!(
            Status::merge_on_reconcile(Status::General, Status::Complete),
            Status::Complete
        );
        assert_eq!(
            Status::merge_on_reconcile(Status::General, Status::Initialized),
            Status::Initialized
        );
        assert_eq!(
            Status::merge_on_reconcile(Status::Initialized, Status::Initialized),
            Status::General
        );
        assert_eq!(
            Status::merge_on_reconcile(Status::RecoverableError, Status::Initialized),
            Status::General
        );
        assert_eq!(
            Status::merge_on_reconcile(Status::RecoverableError, Status::FatalError),
            Status::General
        );
        assert_eq!(
            Status::merge_on_reconcile(Status::Initialized, Status::Complete),
            Status::Complete
        );
        assert_eq!(
            Status::merge_on_reconcile(Status::Complete, Status::General),
            Status::Complete
        );
        assert_eq!(
            Status::merge_on_reconcile(Status::FatalError, Status::Complete),
            Status::FatalError
        );
    }

    #[test]
    fn transition_rejects_leaving_terminal_states() {
        assert!(Status::Complete.transition(Status::General).is_err());
        assert!(Status::FatalError.transition(Status::Initialized).is_err());
        assert!(Status::Initialized.transition(Status::General).is_err());
        assert_eq!(
            Status::Initialized.transition(Status::Complete).unwrap(),
            Status::Complete
        );
    }

    #[test]
    fn failure_codes_split_into_recoverable_and_fatal() {
        assert_eq!(failure_status(codes::IO_WAIT_ERROR), Status::RecoverableError);
        assert_eq!(failure_status(codes::DB_READ_ERROR), Status::RecoverableError);
        assert_eq!(failure_status(codes::REMOTE_KILL), Status::RecoverableError);
        assert_eq!(failure_status(codes::POINT_DATA_ERROR), Status::FatalError);
        assert_eq!(failure_status(codes::IO_PERMISSION_ERROR), Status::FatalError);
        assert_eq!(failure_status(codes::UNKNOWN_ERROR), Status::FatalError);
        assert_eq!(failure_status(42), Status::FatalError);
    }
}
