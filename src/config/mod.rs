// Re-export all configuration types and functions
pub use self::load::*;
pub use self::types::*;

// Internal organization of config submodules
mod load;
mod types;
