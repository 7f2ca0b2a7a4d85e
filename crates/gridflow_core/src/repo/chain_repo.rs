//! Chain persistence and queue queries.
//!
//! # Responsibility
//! - Store chain bookkeeping (owner, priority, status, document location).
//! - Answer queue questions for an external dispatcher.
//!
//! # Invariants
//! - Rules are not stored; the written document is their only record.
//! - A chain's id never changes once stored. Callers may preset it so the
//!   document location is known before the row exists.

use super::catalog_repo::{
    parse_id_column, parse_optional_id_column, parse_status_column, query_all, CatalogError,
    CatalogResult,
};
use crate::model::identity::{EntityId, EntityKind};
use crate::model::status::Status;
use crate::workflow::chain::{Chain, ChainMetadata};
use crate::workflow::queue::{ChainSummary, Priority};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const CHAIN_SELECT_SQL: &str = "SELECT
    id, owner, gridset_id, priority, status, status_mod_time,
    submitted_at, dlocation, metadata, mod_time
FROM chains";

/// Repository interface for authored chains.
pub trait ChainRepository {
    /// Stores a new chain and returns its id, generating one when unset.
    fn insert_chain(&self, chain: &Chain) -> CatalogResult<EntityId>;
    fn update_chain(&self, chain: &Chain) -> CatalogResult<()>;
    fn update_chain_status(&self, id: EntityId, status: Status, mod_time: i64)
        -> CatalogResult<()>;
    /// Loads bookkeeping only; `rules` is empty.
    fn get_chain(&self, id: EntityId) -> CatalogResult<Option<Chain>>;
    fn list_chains_for_gridset(&self, gridset_id: EntityId) -> CatalogResult<Vec<Chain>>;
    /// Deletes one chain and returns its document path, if any.
    fn delete_chain(&self, id: EntityId) -> CatalogResult<Option<String>>;
    /// Pending chains in run order.
    fn list_pending_chains(&self, limit: u32) -> CatalogResult<Vec<ChainSummary>>;
    /// Number of pending chains that run before `id`.
    fn count_chains_ahead_of(&self, id: EntityId) -> CatalogResult<usize>;
}

/// SQLite-backed chain repository.
pub struct SqliteChainRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteChainRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl ChainRepository for SqliteChainRepository<'_> {
    fn insert_chain(&self, chain: &Chain) -> CatalogResult<EntityId> {
        let id = chain.id.unwrap_or_else(Uuid::new_v4);
        self.conn.execute(
            "INSERT INTO chains (
                id, owner, gridset_id, priority, status, status_mod_time,
                submitted_at, dlocation, metadata, mod_time
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                id.to_string(),
                chain.owner.as_str(),
                chain.gridset_id.map(|id| id.to_string()),
                chain.priority.0,
                chain.status.as_db(),
                chain.status_mod_time,
                chain.submitted_at,
                chain.dlocation.as_deref(),
                serde_json::to_string(&chain.metadata)?,
                chain.mod_time,
            ],
        )?;
        Ok(id)
    }

    fn update_chain(&self, chain: &Chain) -> CatalogResult<()> {
        let id = chain
            .id
            .ok_or(CatalogError::MissingIdentity(EntityKind::Chain))?;
        let changed = self.conn.execute(
            "UPDATE chains
             SET gridset_id = ?1, priority = ?2, status = ?3, status_mod_time = ?4,
                 submitted_at = ?5, dlocation = ?6, metadata = ?7, mod_time = ?8
             WHERE id = ?9;",
            params![
                chain.gridset_id.map(|id| id.to_string()),
                chain.priority.0,
                chain.status.as_db(),
                chain.status_mod_time,
                chain.submitted_at,
                chain.dlocation.as_deref(),
                serde_json::to_string(&chain.metadata)?,
                chain.mod_time,
                id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(CatalogError::NotFound {
                kind: EntityKind::Chain,
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn update_chain_status(
        &self,
        id: EntityId,
        status: Status,
        mod_time: i64,
    ) -> CatalogResult<()> {
        let changed = self.conn.execute(
            "UPDATE chains SET status = ?1, status_mod_time = ?2, mod_time = ?2 WHERE id = ?3;",
            params![status.as_db(), mod_time, id.to_string()],
        )?;
        if changed == 0 {
            return Err(CatalogError::NotFound {
                kind: EntityKind::Chain,
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn get_chain(&self, id: EntityId) -> CatalogResult<Option<Chain>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{CHAIN_SELECT_SQL} WHERE id = ?1"))?;
        let row = stmt
            .query_row([id.to_string()], |row| Ok(parse_chain_row(row)))
            .optional()?;
        row.transpose()
    }

    fn list_chains_for_gridset(&self, gridset_id: EntityId) -> CatalogResult<Vec<Chain>> {
        query_all(
            self.conn,
            &format!(
                "{CHAIN_SELECT_SQL} WHERE gridset_id = ?1 ORDER BY submitted_at ASC, rowid ASC"
            ),
            [gridset_id.to_string()],
            parse_chain_row,
        )
    }

    fn delete_chain(&self, id: EntityId) -> CatalogResult<Option<String>> {
        let document: Option<String> = self
            .conn
            .query_row(
                "DELETE FROM chains WHERE id = ?1 RETURNING dlocation;",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| CatalogError::NotFound {
                kind: EntityKind::Chain,
                id: id.to_string(),
            })?;
        Ok(document)
    }

    fn list_pending_chains(&self, limit: u32) -> CatalogResult<Vec<ChainSummary>> {
        query_all(
            self.conn,
            "SELECT id, priority, status, submitted_at
             FROM chains
             WHERE status IN ('general', 'initialized')
             ORDER BY priority DESC, submitted_at ASC, rowid ASC
             LIMIT ?1",
            [i64::from(limit)],
            parse_summary_row,
        )
    }

    fn count_chains_ahead_of(&self, id: EntityId) -> CatalogResult<usize> {
        let count: Option<i64> = self
            .conn
            .query_row(
                "SELECT COUNT(other.id)
                 FROM chains target
                 LEFT JOIN chains other
                   ON other.id <> target.id
                  AND other.status IN ('general', 'initialized')
                  AND (other.priority > target.priority
                       OR (other.priority = target.priority
                           AND other.submitted_at < target.submitted_at))
                 WHERE target.id = ?1
                 GROUP BY target.id",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let count = count.ok_or_else(|| CatalogError::NotFound {
            kind: EntityKind::Chain,
            id: id.to_string(),
        })?;
        usize::try_from(count)
            .map_err(|_| CatalogError::InvalidData(format!("negative chain count {count}")))
    }
}

fn parse_chain_row(row: &Row<'_>) -> CatalogResult<Chain> {
    let metadata_text: String = row.get("metadata")?;
    let metadata: ChainMetadata = serde_json::from_str(&metadata_text)?;
    Ok(Chain {
        id: Some(parse_id_column(row, "id")?),
        owner: row.get("owner")?,
        gridset_id: parse_optional_id_column(row, "gridset_id")?,
        priority: Priority(row.get("priority")?),
        status: parse_status_column(row, "status")?,
        status_mod_time: row.get("status_mod_time")?,
        submitted_at: row.get("submitted_at")?,
        dlocation: row.get("dlocation")?,
        metadata,
        rules: Vec::new(),
        mod_time: row.get("mod_time")?,
    })
}

fn parse_summary_row(row: &Row<'_>) -> CatalogResult<ChainSummary> {
    Ok(ChainSummary {
        id: parse_id_column(row, "id")?,
        priority: Priority(row.get("priority")?),
        status: parse_status_column(row, "status")?,
        submitted_at: row.get("submitted_at")?,
    })
}
