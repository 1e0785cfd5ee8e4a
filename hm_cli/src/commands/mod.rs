//! Command implementations for the hermit CLI.

pub mod cache;
pub mod install;
pub mod list;
pub mod smoke;
pub mod verify;
