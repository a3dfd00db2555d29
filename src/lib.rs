//! TFLOW: Tessera Flow
//!
//! A workflow engine that moves work order cohorts of manufactured parts
//! through versioned process graphs, gates them in batches and decides per
//! part and step whether inspection is required.

pub mod cli;
pub mod core;
pub mod engine;
pub mod entities;
pub mod logging;
pub mod yaml;
