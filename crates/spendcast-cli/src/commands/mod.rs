//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `core` - Init and shared utilities (open_db, open_pipeline)
//! - `forecast` - Ad-hoc forecast, anomaly and suggestion commands
//! - `import` - CSV import
//! - `refresh` - One-shot and scheduled artifact refresh
//! - `status` - Users, published artifacts and history

pub mod core;
pub mod forecast;
pub mod import;
pub mod refresh;
pub mod status;

// Re-export command functions for main.rs
pub use self::core::*;
pub use forecast::*;
pub use import::*;
pub use refresh::*;
pub use status::*;

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
