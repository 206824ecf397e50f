pub mod config;
pub mod logging;
pub mod paths;
pub mod state;

pub use config::{AppConfig, LoggingConfig, ProviderConfig, ResilienceConfig, WorkflowConfig};
pub use paths::AppPaths;
pub use state::AppState;
