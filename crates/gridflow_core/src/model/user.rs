//! Archive owners.

use super::metadata::Metadata;
use serde::{Deserialize, Serialize};

/// A catalog user. The user id is both identity and natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub email: Option<String>,
    pub metadata: Metadata,
    /// Unix epoch milliseconds of the last write.
    pub mod_time: i64,
}

impl User {
    pub fn new(user_id: impl Into<String>, mod_time: i64) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            metadata: Metadata::default(),
            mod_time,
        }
    }
}
