//! Use-case services over the catalog and chain repositories.

pub mod archive_service;
pub mod status_service;
