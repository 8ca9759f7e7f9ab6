pub mod check_config;
pub mod classify;
pub mod inspect;

// Re-export command functions for convenience
pub use check_config::check_config;
pub use classify::classify;
pub use inspect::inspect;
