//! CLI command implementations

pub mod cache;
pub mod index;
pub mod init;
pub mod list;
pub mod replay;
pub mod select;
