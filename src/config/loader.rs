// Configuration loader
// Reads ~/.remote-trainer/config.toml (optional), then applies SSH_* and
// TRAINING_MODE environment overrides

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::settings::OrchestratorConfig;
use crate::errors::{OrchestratorError, OrchestratorResult};

/// Default config file location
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".remote-trainer/config.toml"))
}

/// Load configuration from the default file and the process environment
pub fn load_config() -> OrchestratorResult<OrchestratorConfig> {
    load_config_from(config_path().as_deref(), |key| std::env::var(key).ok())
}

/// Load configuration from `path` (missing file is fine) and an environment
/// lookup
pub fn load_config_from<F>(path: Option<&Path>, env: F) -> OrchestratorResult<OrchestratorConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        debug!(path = %path.display(), "Loading configuration file");
        builder = builder.add_source(
            config::File::from(path)
                .format(config::FileFormat::Toml)
                .required(false),
        );
    }

    let mut config: OrchestratorConfig = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;

    apply_env_overrides(&mut config, env)?;
    Ok(config)
}

/// Apply the documented environment keys on top of file values
pub fn apply_env_overrides<F>(config: &mut OrchestratorConfig, env: F) -> OrchestratorResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(host) = get("SSH_HOSTNAME") {
        config.ssh.hostname = host;
    }
    if let Some(port) = get("SSH_PORT") {
        config.ssh.port = port.trim().parse().map_err(|_| {
            OrchestratorError::InvalidConfig(format!("SSH_PORT must be a port number, got '{}'", port))
        })?;
    }
    if let Some(user) = get("SSH_USERNAME") {
        config.ssh.username = user;
    }
    if let Some(key) = get("SSH_KEY_FILENAME") {
        config.ssh.key_filename = Some(expand_home(&key));
    }
    if let Some(workspace) = get("SSH_REMOTE_WORKSPACE") {
        config.ssh.remote_workspace = workspace;
    }
    if let Some(mode) = get("TRAINING_MODE") {
        config.training_mode = mode.parse()?;
    }

    if let Some(key) = config.ssh.key_filename.take() {
        config.ssh.key_filename = Some(expand_home(&key.to_string_lossy()));
    }
    Ok(())
}

/// Write a default config file. Refuses to overwrite unless `force`.
pub fn write_default_config(path: &Path, force: bool) -> OrchestratorResult<()> {
    if path.exists() && !force {
        return Err(OrchestratorError::InvalidConfig(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let body = toml::to_string_pretty(&OrchestratorConfig::default())
        .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
    let contents = format!(
        "# remote-trainer configuration\n\
        # Environment variables SSH_HOSTNAME, SSH_PORT, SSH_USERNAME, SSH_KEY_FILENAME,\n\
        # SSH_REMOTE_WORKSPACE and TRAINING_MODE override the values below.\n\n{}",
        body
    );
    fs::write(path, contents)?;
    Ok(())
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChangeDetection, SyncPolicy};
    use crate::job::StrategyKind;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = load_config_from(Some(&dir.path().join("missing.toml")), env_of(&[])).unwrap();
        assert_eq!(config.training_mode, StrategyKind::Local);
        assert_eq!(config.ssh.username, "root");
        assert_eq!(config.ssh.remote_workspace, "/root/workspace");
        assert_eq!(config.sync.policy, SyncPolicy::Incremental);
    }

    #[test]
    fn test_file_values_and_env_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
training_mode = "local"

[ssh]
hostname = "gpu-file"
port = 2200

[sync]
policy = "full"
change_detection = "checksum"
"#,
        )
        .unwrap();

        let config = load_config_from(
            Some(&path),
            env_of(&[
                ("SSH_HOSTNAME", "gpu-env"),
                ("TRAINING_MODE", "remote"),
                ("SSH_KEY_FILENAME", "/keys/id_ed25519"),
            ]),
        )
        .unwrap();

        assert_eq!(config.ssh.hostname, "gpu-env");
        assert_eq!(config.ssh.port, 2200);
        assert_eq!(config.training_mode, StrategyKind::Remote);
        assert_eq!(config.sync.policy, SyncPolicy::Full);
        assert_eq!(config.sync.change_detection, ChangeDetection::Checksum);

        let target = config.ssh.target().unwrap();
        assert_eq!(target.port, 2200);
        assert_eq!(target.identity_file_path, PathBuf::from("/keys/id_ed25519"));
    }

    #[test]
    fn test_bad_env_values_are_invalid_config() {
        let mut config = OrchestratorConfig::default();
        let err = apply_env_overrides(&mut config, env_of(&[("SSH_PORT", "ssh")])).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(_)));
        let err = apply_env_overrides(&mut config, env_of(&[("TRAINING_MODE", "cloud")])).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(_)));
    }

    #[test]
    fn test_remote_mode_requires_host() {
        let mut config = OrchestratorConfig::default();
        config.training_mode = StrategyKind::Remote;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        write_default_config(&path, false).unwrap();
        assert!(write_default_config(&path, false).is_err());

        let loaded = load_config_from(Some(&path), env_of(&[])).unwrap();
        let expected = OrchestratorConfig::default();
        assert_eq!(loaded.sync, expected.sync);
        assert_eq!(loaded.logs, expected.logs);
    }
}
