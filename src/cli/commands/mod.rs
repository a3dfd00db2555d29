//! Command implementations

pub mod completions;
pub mod init;
pub mod part;
pub mod proc;
pub mod qa;
pub mod sampling;
pub mod validate;
pub mod wo;
