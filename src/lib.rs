//! Inspect and change CPU power and performance settings on local and remote Linux hosts.

pub mod config;
pub mod drivers;
pub mod engine;
pub mod host;
pub mod props;
pub mod range;
pub mod selection;
pub mod session;
pub mod topology;
pub mod util;
