//! Core domain logic for gridflow.
//! Catalog reconciliation, status lifecycle and DAG authoring for archive
//! runs; every binary goes through this crate.

pub mod clock;
pub mod config;
pub mod db;
pub mod layer_io;
pub mod locator;
pub mod logging;
pub mod model;
pub mod package;
pub mod repo;
pub mod request;
pub mod service;
pub mod user_layers;
pub mod workflow;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigurationError, SiteConfig};
pub use layer_io::{FsLayerIo, LayerInfo, LayerIo, LayerIoError};
pub use locator::PathLocator;
pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig};
pub use model::identity::{EntityId, EntityKind, Reconciled};
pub use model::status::{failure_status, Status, StatusTransitionError};
pub use repo::catalog_repo::{
    CatalogError, CatalogRepository, CatalogResult, Lookup, SqliteCatalog,
};
pub use repo::chain_repo::{ChainRepository, SqliteChainRepository};
pub use request::{ArchiveRecord, ArchiveRequest, RawArchiveRequest};
pub use service::archive_service::{ArchiveError, ArchiveOrchestrator, ArchiveOutcome};
pub use service::status_service::{EngineReport, StatusService, StatusServiceError};
pub use workflow::chain::{Chain, ChainError};
pub use workflow::queue::{count_ahead, ChainSummary, Priority};
pub use workflow::rule::Rule;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
