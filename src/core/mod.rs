//! Core module - fundamental types and utilities

pub mod catalog;
pub mod config;
pub mod entity;
pub mod identity;
pub mod loader;
pub mod project;
pub mod store;

pub use catalog::{Catalog, CatalogError};
pub use config::Config;
pub use entity::Entity;
pub use identity::{EntityId, EntityPrefix, IdParseError};
pub use project::{Project, ProjectError};
pub use store::{Store, StoreError, StoreTx};
