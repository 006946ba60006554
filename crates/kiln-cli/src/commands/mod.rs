//! Command implementations

pub mod cache;
pub mod config_cmd;
pub mod invoke;
pub mod load;
pub mod status;
