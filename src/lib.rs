// Nioh 3 Mod Manager - backend-aware mod installs for Nioh 3
//
// This is the library crate containing the core logic and data structures.
// The binary crate (main.rs) provides the command-line front end.

pub mod config;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use manager::ModManager;
pub use metrics::Metrics;
pub use models::{AppState, Backend, InstalledMod, ManagerSettings, PackageState, Selection};
pub use services::ManagerError;
pub use state::{StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
