// Configuration module
// Public interface for configuration loading

mod loader;
mod settings;

pub use loader::{apply_env_overrides, config_path, load_config, load_config_from, write_default_config};
pub use settings::{
    default_excludes, default_state_dir, ChangeDetection, ConnectionSettings, LaunchSettings,
    LocalSettings, LogSettings, OrchestratorConfig, SshSettings, SyncPolicy, SyncSettings,
};
